//! Workbench fan-out: replay the primary prompt under alternative presets.
//!
//! Runs after an eligible response has already been delivered, entirely off
//! the session path. Nothing here touches the transcript; every preset
//! produces one `perf.metric` event comparing its answer to the primary
//! one, and failures are logged and dropped.

use serde_json::json;
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::config::WorkbenchPreset;
use crate::llm::{ChatMessage, CompletionOptions, LlmClient};
use crate::protocol::ServerEvent;

/// Re-run `messages` once per preset and report latency and similarity
/// against the primary answer.
pub async fn run_workbench(
    client: &LlmClient,
    presets: &[WorkbenchPreset],
    messages: &[ChatMessage],
    primary: &str,
    options: &CompletionOptions,
    session_id: &str,
    events: &broadcast::Sender<ServerEvent>,
) {
    let runs = presets.iter().map(|preset| {
        let opts = preset_options(options, preset);
        async move {
            let started = Instant::now();
            let result = client.complete(messages, &opts).await;
            (preset, started.elapsed(), result)
        }
    });

    for (preset, elapsed, result) in futures::future::join_all(runs).await {
        let meta = match result {
            Ok(completion) => json!({
                "sessionId": session_id,
                "preset": preset.name,
                "model": completion.model,
                "similarity": round3(token_overlap(primary, &completion.content)),
                "lengthRatio": round3(length_ratio(primary, &completion.content)),
            }),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    preset = %preset.name,
                    error = %e,
                    "workbench preset failed"
                );
                json!({
                    "sessionId": session_id,
                    "preset": preset.name,
                    "error": e.to_string(),
                })
            }
        };
        let _ = events.send(ServerEvent::PerfMetric {
            name: "workbench.preset".to_string(),
            duration_ms: elapsed.as_millis() as u64,
            meta,
        });
    }
}

fn preset_options(base: &CompletionOptions, preset: &WorkbenchPreset) -> CompletionOptions {
    let mut opts = base.clone().with_temperature(preset.temperature);
    if preset.model.is_some() {
        opts = opts.with_model(preset.model.clone());
    }
    if let Some(top_p) = preset.top_p {
        opts = opts.with_top_p(top_p);
    }
    if let Some(max_tokens) = preset.max_tokens {
        opts = opts.with_max_tokens(max_tokens);
    }
    opts
}

fn words(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Jaccard similarity over lowercased word sets. Two empty texts count as
/// identical.
fn token_overlap(a: &str, b: &str) -> f64 {
    let (a, b) = (words(a), words(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    intersection as f64 / union as f64
}

/// Shorter length over longer length, in characters.
fn length_ratio(a: &str, b: &str) -> f64 {
    let (la, lb) = (a.chars().count(), b.chars().count());
    if la == 0 && lb == 0 {
        return 1.0;
    }
    la.min(lb) as f64 / la.max(lb) as f64
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    async fn spawn_fixed(content: &'static str) -> (String, Arc<Mutex<Vec<Value>>>) {
        let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(body);
                    Json(serde_json::json!({
                        "model": "stub-model",
                        "choices": [{"message": {"content": content}}]
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), requests)
    }

    fn base_options() -> CompletionOptions {
        CompletionOptions {
            model: Some("stub-model".to_string()),
            max_tokens: 128,
            temperature: 0.7,
            top_p: 0.9,
        }
    }

    fn two_presets() -> Vec<WorkbenchPreset> {
        vec![
            WorkbenchPreset {
                name: "precise".to_string(),
                model: None,
                temperature: 0.2,
                top_p: None,
                max_tokens: None,
            },
            WorkbenchPreset {
                name: "creative".to_string(),
                model: None,
                temperature: 0.9,
                top_p: None,
                max_tokens: None,
            },
        ]
    }

    #[tokio::test]
    async fn test_one_metric_per_preset() {
        let (base, requests) = spawn_fixed("alpha beta gamma").await;
        let client = LlmClient::new(base, Duration::from_secs(5)).unwrap();
        let (tx, mut rx) = broadcast::channel(64);

        run_workbench(
            &client,
            &two_presets(),
            &[ChatMessage::user("hi")],
            "alpha beta gamma",
            &base_options(),
            "s1",
            &tx,
        )
        .await;

        assert_eq!(requests.lock().unwrap().len(), 2);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ServerEvent::PerfMetric { name, meta, .. } => {
                    assert_eq!(name, "workbench.preset");
                    assert_eq!(meta["sessionId"], "s1");
                    assert_eq!(meta["similarity"].as_f64().unwrap(), 1.0);
                    assert_eq!(meta["lengthRatio"].as_f64().unwrap(), 1.0);
                    names.push(meta["preset"].as_str().unwrap().to_string());
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(names, vec!["precise", "creative"]);

        // Each preset carried its own temperature, in whatever arrival order.
        let mut temps: Vec<f64> = requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r["temperature"].as_f64().unwrap())
            .collect();
        temps.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((temps[0] - 0.2).abs() < 1e-6);
        assert!((temps[1] - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_backend_failure_is_swallowed() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = LlmClient::new(base, Duration::from_secs(2)).unwrap();
        let (tx, mut rx) = broadcast::channel(64);

        run_workbench(
            &client,
            &two_presets(),
            &[ChatMessage::user("hi")],
            "primary answer",
            &base_options(),
            "s1",
            &tx,
        )
        .await;

        let mut errors = 0;
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::PerfMetric { meta, .. } = event {
                assert!(meta["error"].is_string());
                errors += 1;
            }
        }
        assert_eq!(errors, 2);
    }

    #[test]
    fn test_token_overlap() {
        assert_eq!(token_overlap("Hello, world!", "hello world"), 1.0);
        assert_eq!(token_overlap("", ""), 1.0);
        assert_eq!(token_overlap("abc", ""), 0.0);
        assert_eq!(token_overlap("cats", "dogs"), 0.0);
        let third = token_overlap("a b", "b c");
        assert!((third - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_length_ratio() {
        assert_eq!(length_ratio("abcd", "ab"), 0.5);
        assert_eq!(length_ratio("", ""), 1.0);
        assert_eq!(length_ratio("", "x"), 0.0);
        assert_eq!(length_ratio("same", "size"), 1.0);
    }

    #[test]
    fn test_preset_options_override() {
        let preset = WorkbenchPreset {
            name: "alt".to_string(),
            model: Some("other-model".to_string()),
            temperature: 0.5,
            top_p: Some(0.5),
            max_tokens: Some(32),
        };
        let opts = preset_options(&base_options(), &preset);
        assert_eq!(opts.model.as_deref(), Some("other-model"));
        assert_eq!(opts.temperature, 0.5);
        assert_eq!(opts.top_p, 0.5);
        assert_eq!(opts.max_tokens, 32);

        let sparse = WorkbenchPreset {
            name: "sparse".to_string(),
            model: None,
            temperature: 0.3,
            top_p: None,
            max_tokens: None,
        };
        let opts = preset_options(&base_options(), &sparse);
        assert_eq!(opts.model.as_deref(), Some("stub-model"));
        assert_eq!(opts.temperature, 0.3);
        assert_eq!(opts.top_p, 0.9);
        assert_eq!(opts.max_tokens, 128);
    }
}
