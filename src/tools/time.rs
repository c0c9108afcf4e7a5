//! Current date/time tool.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Tool;
use crate::error::Result;

pub struct TimeNowTool;

impl TimeNowTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TimeNowTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TimeNowTool {
    fn name(&self) -> &str {
        "time.now"
    }

    fn description(&self) -> &str {
        "Current local date and time."
    }

    fn args_hint(&self) -> &str {
        "{}"
    }

    fn validate_args(&self, _args: &Value) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _args: &Value) -> Result<Value> {
        let now = chrono::Local::now();
        Ok(json!({
            "iso": now.to_rfc3339(),
            "unixMs": now.timestamp_millis(),
            "offset": now.offset().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_time_now_shape() {
        let tool = TimeNowTool::new();
        let value = tool.execute(&Value::Null).await.unwrap();
        assert!(value["iso"].as_str().unwrap().contains('T'));
        assert!(value["unixMs"].as_i64().unwrap() > 1_600_000_000_000);
    }
}
