//! agentloop - Local-First Agent Runtime
//!
//! agentloop is a local-first runtime that drives chat sessions against
//! locally supervised model backends.  Clients speak a JSON command/event
//! protocol over a single WebSocket; the engine routes each message to an
//! agent pack, streams tokens back, and runs bounded tool loops when the
//! selected agent permits them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       agentloop runtime                          │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                     WebSocket Gateway                      │  │
//! │  │   /ws — JSON commands in, broadcast events out             │  │
//! │  └───────────────────────────┬────────────────────────────────┘  │
//! │                              │                                   │
//! │  ┌───────────────────────────▼────────────────────────────────┐  │
//! │  │                      Session Engine                        │  │
//! │  │  - Session lifecycle, busy rejection, cancellation         │  │
//! │  │  - Agent routing (heuristic or pinned)                     │  │
//! │  │  - Token streaming, tool loop, follow-up, workbench        │  │
//! │  └────────┬───────────────────────────────┬───────────────────┘  │
//! │           │                               │                      │
//! │  ┌────────▼─────────┐        ┌────────────▼───────────────────┐  │
//! │  │   Tool Registry  │        │   LLM / VLM / TTS clients      │  │
//! │  │   fs, time,      │        │   (buffered JSON and SSE       │  │
//! │  │   service, web   │        │    normalized to one stream)   │  │
//! │  └──────────────────┘        └────────────┬───────────────────┘  │
//! │                                           │                      │
//! │  ┌────────────────────────────────────────▼───────────────────┐  │
//! │  │                    Service Supervisor                      │  │
//! │  │   spawn / adopt / health-poll / stop local backends        │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! ### Session Protocol
//! - One WebSocket, JSON commands in, JSON events out
//! - Busy rejection while a turn is in flight
//! - Token streaming with think-block sanitization
//!
//! ### Agents and Tools
//! - Built-in agent packs with per-agent tool allowlists
//! - Keyword routing, or a pinned agent per session
//! - Bounded tool loop with structured failure feedback
//!
//! ### Local Backend Supervision
//! - Spawns or adopts LLM, VLM, and TTS backends
//! - Health polling with ready timeouts
//! - Graceful teardown on shutdown
//!
//! ## Modules
//!
//! - [`gateway`]: WebSocket command/event surface
//! - [`engine`]: session engine, tool loop, workbench fan-out
//! - [`agents`]: agent packs and the routing heuristic
//! - [`tools`]: built-in tool registry
//! - [`llm`]: streaming chat-completion client
//! - [`tts`]: speech synthesis client
//! - [`supervisor`]: local backend process supervision
//! - [`protocol`]: wire types for commands and events
//! - [`config`]: configuration management

pub mod agents;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod protocol;
pub mod supervisor;
pub mod tools;
pub mod tts;

pub use config::AgentloopConfig;
pub use error::{Error, Result};
