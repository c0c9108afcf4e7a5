//! Client for the text-to-speech backend.
//!
//! The backend accepts `POST /tts` with `{"text": ...}` and answers with raw
//! `audio/wav` bytes. Playback is the terminal client's concern; this core
//! only moves the bytes.

use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
}

/// Client for one TTS backend endpoint.
#[derive(Debug, Clone)]
pub struct TtsClient {
    http: reqwest::Client,
    base_url: String,
}

impl TtsClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Synthesize `text` into wav bytes.
    pub async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Completion("tts text is empty".to_string()));
        }
        let resp = self
            .http
            .post(format!("{}/tts", self.base_url))
            .json(&TtsRequest { text })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            body.truncate(200);
            return Err(Error::Completion(format!(
                "tts backend returned {status}: {body}"
            )));
        }
        let audio = resp.bytes().await?;
        if audio.is_empty() {
            return Err(Error::Completion("tts backend returned no audio".to_string()));
        }
        Ok(audio)
    }
}
