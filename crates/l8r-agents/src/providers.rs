use async_trait::async_trait;
use futures::Stream;
use l8r_common::Result;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::message::{ChatMessage, ToolCallRequest};

/// Chat-completions capable model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "openai").
    fn provider_id(&self) -> &str;

    /// Send a completion request and return the whole response.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Send a streaming completion request and return a stream of deltas.
    async fn complete_stream(&self, request: &LlmRequest) -> Result<LlmStream>;

    /// Check if the provider is reachable and configured.
    async fn health_check(&self) -> Result<bool>;
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub model: String,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
}

/// Incremental piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamDelta {
    Content(String),
    /// Fragment of the tool call at `index`. `id` and `name` usually arrive
    /// only on the first fragment; `arguments` is partial JSON text.
    ToolCall {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Usage(Usage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}
