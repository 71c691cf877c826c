use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::{ToolContext, ToolRegistry};
use crate::providers::ToolDefinition;

/// Result of one tool invocation. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(String),
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Failure(msg) => Some(msg),
        }
    }

    /// The payload the model sees: the result itself, or `{"error": msg}`.
    pub fn payload(&self) -> Value {
        match self {
            Self::Success(value) => value.clone(),
            Self::Failure(msg) => json!({ "error": msg }),
        }
    }

    /// Content of the `tool` message appended to the history.
    pub fn message_content(&self) -> String {
        self.payload().to_string()
    }
}

/// Record of a call made during a turn, returned to callers for display.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub result: Value,
}

/// Dispatches calls by name against a validated registry.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Run `name` with the model's raw argument text.
    pub async fn execute(&self, context: &ToolContext, name: &str, arguments: &str) -> ToolOutcome {
        self.execute_value(context, name, parse_arguments(name, arguments))
            .await
    }

    #[instrument(
        skip(self, context, args),
        fields(account = %context.account_id, session = ?context.session_id)
    )]
    pub async fn execute_value(&self, context: &ToolContext, name: &str, args: Value) -> ToolOutcome {
        let Some(tool) = self.registry.lookup(name) else {
            warn!("model requested unknown tool '{name}'");
            return ToolOutcome::Failure(format!("Unknown tool: {name}"));
        };

        match tool.execute(context, args).await {
            Ok(value) => {
                debug!("tool '{name}' succeeded");
                ToolOutcome::Success(value)
            }
            Err(e) => {
                debug!("tool '{name}' failed: {e}");
                ToolOutcome::Failure(e.user_message())
            }
        }
    }
}

/// Malformed or non-object argument text degrades to `{}`.
pub fn parse_arguments(name: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!("arguments for '{name}' are not an object ({other}), using {{}}");
            json!({})
        }
        Err(e) => {
            warn!("malformed arguments for '{name}': {e}, using {{}}");
            json!({})
        }
    }
}
