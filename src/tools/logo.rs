//! Cached external logo lookup.
//!
//! Fetches a company/project logo by domain from a public logo endpoint and
//! reports metadata about it. Responses are cached per domain with a TTL so
//! repeated calls inside one conversation do not refetch.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{parse_args, Tool};
use crate::error::{Error, Result};

const DEFAULT_LOGO_BASE: &str = "https://logo.clearbit.com";
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_TTL: Duration = Duration::from_secs(3600);
const CACHE_CAP: usize = 32;

#[derive(Debug, Deserialize)]
struct LogoArgs {
    domain: String,
}

struct CacheEntry {
    fetched_at: Instant,
    value: Value,
}

pub struct LogoTool {
    http: reqwest::Client,
    base_url: String,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl LogoTool {
    pub fn new() -> Self {
        Self::with_base(DEFAULT_LOGO_BASE)
    }

    pub fn with_base(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl: CACHE_TTL,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn validate_domain(domain: &str) -> Result<()> {
        let ok = !domain.is_empty()
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
        if ok {
            Ok(())
        } else {
            Err(Error::Tool(format!("invalid domain: {domain}")))
        }
    }
}

impl Default for LogoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for LogoTool {
    fn name(&self) -> &str {
        "web.logo"
    }

    fn description(&self) -> &str {
        "Look up the logo for a domain and report its content type and size."
    }

    fn args_hint(&self) -> &str {
        r#"{"domain": "example.com"}"#
    }

    fn validate_args(&self, args: &Value) -> Result<()> {
        parse_args::<LogoArgs>(args).map(|_| ())
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let args: LogoArgs = parse_args(args)?;
        let domain = args.domain.trim().to_lowercase();
        Self::validate_domain(&domain)?;

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&domain) {
                if entry.fetched_at.elapsed() < self.ttl {
                    let mut value = entry.value.clone();
                    value["cached"] = json!(true);
                    return Ok(value);
                }
            }
        }

        let url = format!("{}/{domain}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Tool(format!("logo fetch failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Tool(format!(
                "logo fetch failed: {} for {domain}",
                resp.status()
            )));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Tool(format!("logo fetch failed: {e}")))?;

        let value = json!({
            "domain": domain,
            "url": url,
            "contentType": content_type,
            "bytes": bytes.len(),
            "cached": false,
        });

        let mut cache = self.cache.lock().await;
        if cache.len() >= CACHE_CAP {
            cache.clear();
        }
        cache.insert(
            domain,
            CacheEntry {
                fetched_at: Instant::now(),
                value: value.clone(),
            },
        );
        Ok(value)
    }
}
