//! Session protocol engine.
//!
//! Owns the session table and turns inbound commands into state transitions,
//! pipelines, and events. At most one send pipeline runs per session at a
//! time (enforced by the status-based busy check); everything a pipeline
//! produces is fanned out on the shared broadcast channel, so every
//! connected client observes every session.

pub mod sanitize;
pub mod session;
pub mod tool_loop;
pub mod workbench;

pub use session::{Message, Session, ToolCallRecord};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

use crate::agents::{pinned_decision, route_heuristic, AgentCatalog, AgentPack};
use crate::config::AgentloopConfig;
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionOptions, LlmClient};
use crate::protocol::{ClientCommand, ImageAttachment, RoutingMode, ServerEvent, SessionStatus};
use crate::supervisor::{ServiceKind, ServiceSupervisor};
use crate::tools::ToolRegistry;
use crate::tts::TtsClient;

use sanitize::{sanitize_text, TokenSanitizer};
use tool_loop::run_tool_loop;
use workbench::run_workbench;

/// The protocol engine. Shared behind an `Arc`; command handling and the
/// pipelines it spawns all go through the same instance.
pub struct Engine {
    config: AgentloopConfig,
    sessions: RwLock<HashMap<String, Session>>,
    catalog: AgentCatalog,
    registry: ToolRegistry,
    supervisor: Arc<ServiceSupervisor>,
    llm: LlmClient,
    vlm: LlmClient,
    tts: TtsClient,
    events: broadcast::Sender<ServerEvent>,
}

// =============================================================================
// Construction
// =============================================================================

impl Engine {
    pub fn new(
        config: AgentloopConfig,
        supervisor: Arc<ServiceSupervisor>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.llm.request_timeout_secs);
        let llm = LlmClient::new(
            supervisor.descriptor(ServiceKind::Llm)?.base_url(),
            request_timeout,
        )?;
        let vlm = LlmClient::new(
            supervisor.descriptor(ServiceKind::Vlm)?.base_url(),
            request_timeout,
        )?;
        let tts = TtsClient::new(
            supervisor.descriptor(ServiceKind::Tts)?.base_url(),
            request_timeout,
        )?;
        let registry = ToolRegistry::builtin(config.workspace.resolve_root(), supervisor.clone());
        let catalog = AgentCatalog::from_config(&config);

        Ok(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            catalog,
            registry,
            supervisor,
            llm,
            vlm,
            tts,
            events,
        })
    }

    pub fn events(&self) -> broadcast::Sender<ServerEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, session_id: &str, status: SessionStatus, detail: Option<String>) {
        self.emit(ServerEvent::SessionStatus {
            session_id: session_id.to_string(),
            status,
            detail,
        });
    }

    // =========================================================================
    // Command handling
    // =========================================================================

    /// Apply one client command. `Err` means the command was rejected before
    /// any state change; the gateway answers the offending connection with an
    /// error event and nothing is broadcast.
    pub async fn handle_command(self: &Arc<Self>, command: ClientCommand) -> Result<()> {
        match command {
            ClientCommand::SessionCreate { session_id } => self.create_session(session_id).await,
            ClientCommand::SessionSend {
                session_id,
                content,
                images,
            } => self.send_message(session_id, content, images).await,
            ClientCommand::SessionConfigure {
                session_id,
                routing_mode,
                agent,
                session_prompt,
            } => {
                self.configure_session(session_id, routing_mode, agent, session_prompt)
                    .await
            }
            ClientCommand::SessionCancel { session_id } => self.cancel_session(&session_id).await,
            ClientCommand::AgentList {} => {
                let agents = self.catalog.summaries().await;
                self.emit(ServerEvent::AgentList { agents });
                Ok(())
            }
            ClientCommand::ServiceStart { name } => self.service_command(&name, true),
            ClientCommand::ServiceStop { name } => self.service_command(&name, false),
            ClientCommand::ServiceStatus { name } => self.service_status(name.as_deref()).await,
            ClientCommand::TtsSpeak { text, session_id } => self.speak(text, session_id),
        }
    }

    async fn create_session(&self, session_id: Option<String>) -> Result<()> {
        let id = match session_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(id.clone())
                .or_insert_with(|| Session::new(id.clone()));
        }
        self.emit(ServerEvent::SessionCreated { session_id: id });
        Ok(())
    }

    async fn send_message(
        self: &Arc<Self>,
        session_id: String,
        content: String,
        images: Vec<ImageAttachment>,
    ) -> Result<()> {
        // Blank no-image sends are rejected here, before routing, so the
        // router's `empty` fallback only ever fires for direct callers.
        if content.trim().is_empty() && images.is_empty() {
            return Err(Error::Protocol("message content is empty".to_string()));
        }

        // Busy check, status flip, and transcript append as one atomic step.
        let created = {
            let mut sessions = self.sessions.write().await;
            let created = !sessions.contains_key(&session_id);
            let session = sessions
                .entry(session_id.clone())
                .or_insert_with(|| Session::new(session_id.clone()));
            if session.status.is_busy() {
                return Err(Error::Session(format!("session {session_id} is busy")));
            }
            session.status = SessionStatus::Thinking;
            session.append_user(transcript_text(&content, images.len()));
            created
        };

        if created {
            self.emit(ServerEvent::SessionCreated {
                session_id: session_id.clone(),
            });
        }
        self.emit_status(&session_id, SessionStatus::Thinking, None);

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_send_pipeline(session_id, content, images).await;
        });
        Ok(())
    }

    async fn configure_session(
        &self,
        session_id: String,
        routing_mode: Option<RoutingMode>,
        agent: Option<String>,
        session_prompt: Option<String>,
    ) -> Result<()> {
        if let Some(name) = agent.as_deref() {
            if self.catalog.get(name).await.is_none() {
                return Err(Error::Session(format!("unknown agent: {name}")));
            }
        }

        let (created, status) = {
            let mut sessions = self.sessions.write().await;
            let created = !sessions.contains_key(&session_id);
            let session = sessions
                .entry(session_id.clone())
                .or_insert_with(|| Session::new(session_id.clone()));
            if let Some(mode) = routing_mode {
                session.routing_mode = mode;
            }
            if let Some(name) = agent {
                session.pinned_agent = Some(name);
            }
            if let Some(prompt) = session_prompt {
                session.session_prompt = if prompt.trim().is_empty() {
                    None
                } else {
                    Some(prompt)
                };
            }
            (created, session.status)
        };

        if created {
            self.emit(ServerEvent::SessionCreated {
                session_id: session_id.clone(),
            });
        }
        self.emit_status(&session_id, status, Some("configured".to_string()));
        Ok(())
    }

    async fn cancel_session(&self, session_id: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return Err(Error::Session(format!("unknown session: {session_id}")));
            };
            session.status = SessionStatus::Idle;
        }
        self.emit_status(session_id, SessionStatus::Idle, Some("cancelled".to_string()));
        Ok(())
    }

    /// Start or stop a backend in a detached task; outcomes arrive as
    /// `service.status` events.
    fn service_command(self: &Arc<Self>, name: &str, start: bool) -> Result<()> {
        let kind = ServiceKind::from_name(name)
            .ok_or_else(|| Error::Service(format!("unknown service: {name}")))?;
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            let result = if start {
                supervisor.start(kind).await
            } else {
                supervisor.stop(kind).await
            };
            if let Err(e) = result {
                tracing::warn!(service = %kind, error = %e, "service command failed");
            }
        });
        Ok(())
    }

    async fn service_status(&self, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) => {
                let kind = ServiceKind::from_name(name)
                    .ok_or_else(|| Error::Service(format!("unknown service: {name}")))?;
                if let Some(state) = self.supervisor.status(kind).await {
                    self.emit(state.to_event());
                }
            }
            None => {
                for state in self.supervisor.all_statuses().await {
                    self.emit(state.to_event());
                }
            }
        }
        Ok(())
    }

    fn speak(self: &Arc<Self>, text: String, session_id: Option<String>) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::Protocol("tts text is empty".to_string()));
        }
        let engine = self.clone();
        tokio::spawn(async move {
            if !engine.supervisor.ensure_healthy(ServiceKind::Tts).await {
                engine.emit(ServerEvent::error(backend_fallback_message(
                    ServiceKind::Tts,
                )));
                return;
            }
            match engine.tts.synthesize(&text).await {
                Ok(audio) => {
                    engine.emit(ServerEvent::TtsAudio {
                        session_id,
                        audio_base64: BASE64.encode(&audio),
                        format: "wav".to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tts synthesis failed");
                    engine.emit(ServerEvent::error(format!("tts synthesis failed: {e}")));
                }
            }
        });
        Ok(())
    }

    // =========================================================================
    // Send pipeline
    // =========================================================================

    async fn run_send_pipeline(
        self: Arc<Self>,
        session_id: String,
        content: String,
        images: Vec<ImageAttachment>,
    ) {
        let started = Instant::now();

        let (mode, pinned, session_prompt) = {
            let sessions = self.sessions.read().await;
            match sessions.get(&session_id) {
                Some(s) => (
                    s.routing_mode,
                    s.pinned_agent.clone(),
                    s.session_prompt.clone(),
                ),
                None => (RoutingMode::Auto, None, None),
            }
        };

        // Vision turns bypass routing; the router is a text heuristic.
        if !images.is_empty() {
            if !self.supervisor.ensure_healthy(ServiceKind::Vlm).await {
                self.finish_with_message(&session_id, backend_fallback_message(ServiceKind::Vlm))
                    .await;
                return;
            }

            self.emit_status(&session_id, SessionStatus::Streaming, None);
            let pack = self.catalog.default_pack().await;
            let system = system_text(&pack, session_prompt.as_deref());
            let ask = if content.trim().is_empty() {
                "Describe the attached image(s).".to_string()
            } else {
                content.clone()
            };
            let urls = images
                .iter()
                .map(|image| format!("data:{};base64,{}", image.media_type, image.data))
                .collect();
            let messages = vec![
                ChatMessage::system(&system),
                ChatMessage::user_with_images(ask, urls),
            ];
            // The vision backend serves one loaded model; do not name one.
            let options = CompletionOptions::from_config(&self.config.llm).with_model(None);

            match self
                .stream_completion(&self.vlm, &messages, &options, &session_id)
                .await
            {
                Ok((text, model)) => {
                    self.finish_completed(&session_id, text, &pack, &model, false, started)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "vision completion failed");
                    self.finish_with_message(
                        &session_id,
                        backend_fallback_message(ServiceKind::Vlm),
                    )
                    .await;
                }
            }
            return;
        }

        // Routing.
        let packs = self.catalog.packs().await;
        let decision = match (mode, pinned.as_deref()) {
            (RoutingMode::Pinned, Some(name)) => pinned_decision(&packs, name),
            _ => route_heuristic(&content, &packs, self.catalog.default_agent()),
        };
        self.emit(ServerEvent::RouterDecision {
            session_id: session_id.clone(),
            agent: decision.agent.clone(),
            reason: decision.reason.clone(),
            tools: decision.tools.clone(),
        });
        let pack = match packs.iter().find(|p| p.name == decision.agent) {
            Some(pack) => pack.clone(),
            None => self.catalog.default_pack().await,
        };

        if !self.supervisor.ensure_healthy(ServiceKind::Llm).await {
            self.finish_with_message(&session_id, backend_fallback_message(ServiceKind::Llm))
                .await;
            return;
        }

        let system = system_text(&pack, session_prompt.as_deref());
        let mut options = CompletionOptions::from_config(&self.config.llm);
        if let Some(temperature) = pack.temperature {
            options = options.with_temperature(temperature);
        }
        let history = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&session_id)
                .map(|s| s.recent_history(pack.max_history_turns))
                .unwrap_or_default()
        };

        // Tool path.
        if pack.uses_tools() {
            self.emit_status(&session_id, SessionStatus::ToolUse, None);
            let seed = format!("{}\n\n{}", system, self.registry.catalog_prompt(&pack.tools));
            let mut messages = vec![ChatMessage::system(seed)];
            messages.extend(history);

            match run_tool_loop(
                &self.llm,
                &self.registry,
                &pack,
                messages,
                &options,
                &session_id,
                &self.events,
            )
            .await
            {
                Ok(outcome) => {
                    if !outcome.calls.is_empty() {
                        let mut sessions = self.sessions.write().await;
                        if let Some(session) = sessions.get_mut(&session_id) {
                            session.tool_calls.extend(outcome.calls.iter().cloned());
                        }
                    }
                    let follow_up = self
                        .maybe_follow_up(
                            &session_id,
                            &pack,
                            &system,
                            &content,
                            &outcome.content,
                            &options,
                        )
                        .await;
                    let follow_up_ran = follow_up.is_some();
                    let full = match follow_up {
                        Some(extra) => format!("{}\n\n{}", outcome.content, extra),
                        None => outcome.content,
                    };
                    self.finish_completed(
                        &session_id,
                        full,
                        &pack,
                        &outcome.model,
                        follow_up_ran,
                        started,
                    )
                    .await;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        agent = %pack.name,
                        error = %e,
                        "tool loop failed"
                    );
                    self.finish_with_message(
                        &session_id,
                        backend_fallback_message(ServiceKind::Llm),
                    )
                    .await;
                }
            }
            return;
        }

        // Quick no-tool path.
        self.emit_status(&session_id, SessionStatus::Streaming, None);
        let mut messages = vec![ChatMessage::system(&system)];
        messages.extend(history);

        let (primary, model) = match self
            .stream_completion(&self.llm, &messages, &options, &session_id)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "completion failed");
                self.finish_with_message(&session_id, backend_fallback_message(ServiceKind::Llm))
                    .await;
                return;
            }
        };

        let follow_up = self
            .maybe_follow_up(&session_id, &pack, &system, &content, &primary, &options)
            .await;
        let follow_up_ran = follow_up.is_some();
        let full = match &follow_up {
            Some(extra) => format!("{primary}\n\n{extra}"),
            None => primary.clone(),
        };
        self.finish_completed(&session_id, full, &pack, &model, follow_up_ran, started)
            .await;

        // Detached workbench fan-out, observability only.
        let workbench = &self.config.workbench;
        if workbench.enabled && workbench.presets.len() >= 2 && !follow_up_ran {
            let engine = self.clone();
            let presets = workbench.presets.clone();
            let options = options.clone();
            let sid = session_id.clone();
            tokio::spawn(async move {
                run_workbench(
                    &engine.llm,
                    &presets,
                    &messages,
                    &primary,
                    &options,
                    &sid,
                    &engine.events,
                )
                .await;
            });
        }
    }

    /// Stream one completion, sanitizing control tokens out of the live
    /// token events. Returns the sanitized full text and the model id.
    async fn stream_completion(
        &self,
        client: &LlmClient,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        session_id: &str,
    ) -> Result<(String, String)> {
        let mut sanitizer = TokenSanitizer::new();
        let events = self.events.clone();
        let sid = session_id.to_string();
        let completion = client
            .complete_streaming(messages, options, |token| {
                let visible = sanitizer.feed(token);
                if !visible.is_empty() {
                    let _ = events.send(ServerEvent::AssistantToken {
                        session_id: sid.clone(),
                        token: visible,
                    });
                }
            })
            .await?;
        let tail = sanitizer.finish();
        if !tail.is_empty() {
            let _ = events.send(ServerEvent::AssistantToken {
                session_id: sid,
                token: tail,
            });
        }
        Ok((sanitize_text(&completion.content), completion.model))
    }

    /// One bounded continuation for an unusually short primary answer.
    /// Failures are suppressed; the primary answer stands alone.
    async fn maybe_follow_up(
        &self,
        session_id: &str,
        pack: &AgentPack,
        system: &str,
        user_content: &str,
        primary: &str,
        options: &CompletionOptions,
    ) -> Option<String> {
        if !pack.allow_follow_up {
            return None;
        }
        if primary.trim().chars().count() >= self.config.llm.follow_up_min_chars {
            return None;
        }

        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(user_content),
            ChatMessage::assistant(primary),
            ChatMessage::user(
                "Continue your previous answer with any useful detail you left out. \
                 Do not repeat yourself.",
            ),
        ];
        match self.llm.complete(&messages, options).await {
            Ok(completion) => {
                let text = sanitize_text(&completion.content);
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "follow-up continuation failed");
                None
            }
        }
    }

    /// Append the assistant message, return to idle, and emit the completed
    /// message. Returns the message id, or `None` when the session vanished.
    async fn finish_with_message(&self, session_id: &str, content: String) -> Option<String> {
        let message_id = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(session_id) else {
                tracing::warn!(session_id = %session_id, "session vanished mid-pipeline");
                return None;
            };
            let id = session.append_assistant(&content).id.clone();
            session.status = SessionStatus::Idle;
            id
        };
        self.emit_status(session_id, SessionStatus::Idle, None);
        self.emit(ServerEvent::AssistantMessage {
            session_id: session_id.to_string(),
            message_id: message_id.clone(),
            content,
        });
        Some(message_id)
    }

    async fn finish_completed(
        &self,
        session_id: &str,
        content: String,
        pack: &AgentPack,
        model: &str,
        follow_up: bool,
        started: Instant,
    ) {
        if self.finish_with_message(session_id, content).await.is_none() {
            return;
        }
        self.emit(ServerEvent::PerfMetric {
            name: "completion".to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            meta: json!({
                "sessionId": session_id,
                "agent": pack.name,
                "model": model,
                "followUp": follow_up,
            }),
        });
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Transcript rendering of a user turn, noting attachments inline.
fn transcript_text(content: &str, image_count: usize) -> String {
    if image_count == 0 {
        return content.to_string();
    }
    let note = if image_count == 1 {
        "[1 image attached]".to_string()
    } else {
        format!("[{image_count} images attached]")
    };
    if content.trim().is_empty() {
        note
    } else {
        format!("{content} {note}")
    }
}

fn system_text(pack: &AgentPack, session_prompt: Option<&str>) -> String {
    match session_prompt.map(str::trim) {
        Some(extra) if !extra.is_empty() => format!("{}\n\n{}", pack.system_prompt, extra),
        _ => pack.system_prompt.clone(),
    }
}

/// Deterministic transcript substitute for an unavailable backend. Tells the
/// user how to get the backend up instead of erroring the session.
fn backend_fallback_message(kind: ServiceKind) -> String {
    format!(
        "The {kind} backend is not available right now. Start it with a \
         `service.start` command (or enable auto_start in the config) and send \
         your message again. `service.status` shows what each backend is doing."
    )
}
