pub mod message;
pub mod normalize;
pub mod openai;
pub mod prompt;
pub mod providers;
pub mod runtime;
pub mod spans;
pub mod tools;

pub use message::{ChatMessage, Role, ToolCallRequest};
pub use normalize::normalize;
pub use openai::OpenAiProvider;
pub use prompt::{DEFAULT_PROMPT, HttpPromptSource, PromptCache, PromptSource, StaticPrompt};
pub use providers::{
    LlmProvider, LlmRequest, LlmResponse, LlmStream, StreamDelta, ToolDefinition, Usage,
};
pub use runtime::{
    ChatEvent, ChatOptions, ChatOutcome, ChatRuntime, DEFAULT_MAX_TOOL_ROUNDS, TracedTurn,
    TurnRequest,
};
pub use spans::{SpanManager, TurnSpans};
pub use tools::{Tool, ToolContext, ToolExecutor, ToolInvocation, ToolName, ToolOutcome, ToolRegistry};
