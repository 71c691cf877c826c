pub mod account;
pub mod executor;
pub mod registry;

use async_trait::async_trait;
use l8r_common::{AccountId, Result, SessionId};

pub use executor::{ToolExecutor, ToolInvocation, ToolOutcome};
pub use registry::{ToolName, ToolRegistry};

/// Who a tool call acts for.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub account_id: AccountId,
    pub session_id: Option<SessionId>,
}

impl ToolContext {
    pub fn for_account(account_id: AccountId) -> Self {
        Self {
            account_id,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// A typed capability the model may invoke. Implementations forward to
/// exactly one domain-service operation and return its JSON result.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> serde_json::Value;
    async fn execute(&self, context: &ToolContext, args: serde_json::Value)
    -> Result<serde_json::Value>;
}
