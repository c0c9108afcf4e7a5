//! Backend status tool, backed by the service supervisor.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{parse_args, Tool};
use crate::error::{Error, Result};
use crate::supervisor::{ServiceKind, ServiceState, ServiceSupervisor};

#[derive(Debug, Default, Deserialize)]
struct StatusArgs {
    #[serde(default)]
    name: Option<String>,
}

pub struct ServiceStatusTool {
    supervisor: Arc<ServiceSupervisor>,
}

impl ServiceStatusTool {
    pub fn new(supervisor: Arc<ServiceSupervisor>) -> Self {
        Self { supervisor }
    }
}

fn state_json(state: &ServiceState) -> Value {
    json!({
        "name": state.name,
        "status": state.status.as_str(),
        "pid": state.pid,
        "detail": state.detail,
        "lastError": state.last_error,
    })
}

#[async_trait]
impl Tool for ServiceStatusTool {
    fn name(&self) -> &str {
        "service.status"
    }

    fn description(&self) -> &str {
        "Status of the supervised model backends (llm, vlm, tts)."
    }

    fn args_hint(&self) -> &str {
        r#"{"name": "llm"} or {}"#
    }

    fn validate_args(&self, args: &Value) -> Result<()> {
        parse_args::<StatusArgs>(args).map(|_| ())
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let args: StatusArgs = parse_args(args)?;
        match args.name {
            Some(name) => {
                let kind = ServiceKind::from_name(&name)
                    .ok_or_else(|| Error::Tool(format!("unknown service: {name}")))?;
                let state = self
                    .supervisor
                    .status(kind)
                    .await
                    .ok_or_else(|| Error::Tool(format!("unknown service: {name}")))?;
                Ok(state_json(&state))
            }
            None => {
                let states = self.supervisor.all_statuses().await;
                Ok(json!({
                    "services": states.iter().map(state_json).collect::<Vec<_>>(),
                }))
            }
        }
    }
}
