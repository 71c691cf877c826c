use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use l8r_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Built-in system instruction, used when no override or remote prompt is
/// configured and as the permanent fallback when a remote load fails.
pub const DEFAULT_PROMPT: &str = "\
You are the customer service assistant for l8r, a Buy Now Pay Later service. \
You help customers to:

- check their account balance, credit limit and available credit
- find and understand their orders
- manage their installment plans
- sort out payment problems, including retrying failed payments
- submit refund requests
- understand how l8r works

Guidelines:
1. Be friendly, professional and brief.
2. Look up real account data with the tools instead of guessing.
3. Show money as currency, for example $123.45.
4. Show dates in a readable form, for example \"January 15, 2025\".
5. When a tool reports an error, explain it plainly and suggest what the customer can do next.
6. Confirm the details with the customer before retrying a payment or requesting a refund.
7. Ask a clarifying question when you do not have enough information.

Keep in mind:
- The customer is Alex Johnson.
- Every tool only sees this customer's account.
- Be understanding about payment trouble and focus on solutions.
- Point out things that need attention, such as a failed payment you can retry.

Typical requests:
- \"What's my balance?\" -> get_account_balance
- \"Show me my recent orders\" -> get_orders
- \"My payment failed\" -> find it with get_payment_history or get_installment_plans, then offer retry_payment
- \"I want to return my order\" -> find it with get_orders, then use request_refund

Work out what the customer needs first, then use the tools that answer it.";

/// Where the system instruction comes from.
#[async_trait]
pub trait PromptSource: Send + Sync {
    async fn load(&self) -> Result<String>;
}

/// A fixed prompt string.
pub struct StaticPrompt(String);

impl StaticPrompt {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self(prompt.into())
    }
}

#[async_trait]
impl PromptSource for StaticPrompt {
    async fn load(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Fetches the prompt from a URL. The body may be JSON with a `prompt` or
/// `content` string field, a JSON string, or plain text.
pub struct HttpPromptSource {
    client: reqwest::Client,
    url: String,
}

impl HttpPromptSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl PromptSource for HttpPromptSource {
    async fn load(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Config(format!("failed to fetch prompt: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Config(format!(
                "prompt source returned status {}",
                status.as_u16()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::Config(format!("failed to read prompt body: {e}")))?;
        Ok(extract_prompt(&body))
    }
}

fn extract_prompt(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(text)) => text,
        Ok(json) => ["prompt", "content"]
            .iter()
            .find_map(|key| json.get(key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => body.to_string(),
    }
}

type PendingLoad = Shared<BoxFuture<'static, String>>;

enum CacheState {
    Unloaded,
    Loading(PendingLoad),
    Loaded(String),
}

/// Process-wide memo of the system instruction.
///
/// The first caller starts the load; concurrent callers join the same
/// in-flight future. Whatever it resolves to, including the default after a
/// failure, is kept for the rest of the process.
pub struct PromptCache {
    source: Arc<dyn PromptSource>,
    state: Mutex<CacheState>,
}

impl PromptCache {
    pub fn new(source: Arc<dyn PromptSource>) -> Self {
        Self {
            source,
            state: Mutex::new(CacheState::Unloaded),
        }
    }

    /// A cache that always yields `prompt`.
    pub fn fixed(prompt: impl Into<String>) -> Self {
        Self {
            source: Arc::new(StaticPrompt::new("")),
            state: Mutex::new(CacheState::Loaded(prompt.into())),
        }
    }

    pub async fn get(&self) -> String {
        let pending = {
            let mut state = self.state.lock().await;
            match &*state {
                CacheState::Loaded(prompt) => return prompt.clone(),
                CacheState::Loading(pending) => pending.clone(),
                CacheState::Unloaded => {
                    let pending = load_or_default(Arc::clone(&self.source)).boxed().shared();
                    *state = CacheState::Loading(pending.clone());
                    pending
                }
            }
        };

        let prompt = pending.await;
        let mut state = self.state.lock().await;
        if matches!(*state, CacheState::Loading(_)) {
            *state = CacheState::Loaded(prompt.clone());
        }
        prompt
    }

    pub async fn is_loaded(&self) -> bool {
        matches!(*self.state.lock().await, CacheState::Loaded(_))
    }
}

async fn load_or_default(source: Arc<dyn PromptSource>) -> String {
    match source.load().await {
        Ok(prompt) if !prompt.trim().is_empty() => {
            info!("system prompt loaded ({} chars)", prompt.len());
            prompt
        }
        Ok(_) => {
            warn!("prompt source returned an empty prompt, using built-in default");
            DEFAULT_PROMPT.to_string()
        }
        Err(e) => {
            warn!("failed to load system prompt, using built-in default: {e}");
            DEFAULT_PROMPT.to_string()
        }
    }
}
