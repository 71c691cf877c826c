use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use l8r_common::{AccountId, Error, Result, SessionId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::message::{ChatMessage, ToolCallRequest};
use crate::normalize;
use crate::prompt::{DEFAULT_PROMPT, PromptCache};
use crate::providers::{LlmProvider, LlmRequest, LlmResponse, StreamDelta};
use crate::spans::{SpanManager, TurnRecord};
use crate::tools::executor::parse_arguments;
use crate::tools::{ToolContext, ToolExecutor, ToolInvocation};

/// Default cap on model rounds per turn.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 10;

const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Replaces the cached system instruction for this turn.
    pub instructions: Option<String>,
}

/// Result of one turn of the tool-calling loop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutcome {
    pub content: String,
    pub tool_invocations: Vec<ToolInvocation>,
    /// Working history after the turn, without the system instruction.
    pub messages: Vec<ChatMessage>,
    pub rounds: usize,
}

/// A turn together with the conversation trace it was recorded under.
#[derive(Debug, Clone)]
pub struct TracedTurn {
    pub span_id: String,
    pub outcome: ChatOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub messages: Vec<ChatMessage>,
    pub session_id: Option<SessionId>,
    /// Conversation token issued on an earlier turn.
    pub parent_span_id: Option<String>,
    pub options: ChatOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallSummary {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Incremental events of a streamed turn, serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    SpanId {
        #[serde(rename = "spanId")]
        span_id: String,
    },
    Content {
        content: String,
    },
    ToolCalls {
        tool_calls: Vec<ToolCallSummary>,
    },
    ToolStart {
        tool: String,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        tool_call_id: String,
        result: Value,
    },
    Error {
        error: String,
    },
}

async fn emit(events: Option<&mpsc::Sender<ChatEvent>>, event: ChatEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles one model response from content pieces and tool-call
/// fragments keyed by call index. Batch responses are fed through the same
/// path as streamed ones.
#[derive(Debug, Default)]
struct RoundAccumulator {
    content: String,
    calls: BTreeMap<u32, PartialCall>,
}

struct Round {
    content: String,
    tool_calls: Vec<ToolCallRequest>,
}

impl RoundAccumulator {
    fn from_response(response: LlmResponse) -> Self {
        let mut acc = Self::default();
        acc.push_content(&response.content);
        for (index, call) in (0u32..).zip(response.tool_calls) {
            acc.push_tool_fragment(index, Some(call.id), Some(call.name), &call.arguments);
        }
        acc
    }

    fn push_content(&mut self, text: &str) {
        self.content.push_str(text);
    }

    fn push_tool_fragment(
        &mut self,
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: &str,
    ) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            call.name = name;
        }
        call.arguments.push_str(arguments);
    }

    fn finish(self) -> Round {
        let tool_calls = self
            .calls
            .into_values()
            .map(|call| ToolCallRequest {
                id: if call.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    call.id
                },
                name: call.name,
                arguments: call.arguments,
            })
            .collect();
        Round {
            content: self.content,
            tool_calls,
        }
    }
}

/// Runs the tool-calling conversation loop against one account.
pub struct ChatRuntime {
    provider: Arc<dyn LlmProvider>,
    executor: ToolExecutor,
    prompt: Arc<PromptCache>,
    spans: SpanManager,
    account_id: AccountId,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    max_tool_rounds: Option<usize>,
}

impl ChatRuntime {
    pub fn new(provider: Arc<dyn LlmProvider>, executor: ToolExecutor, account_id: AccountId) -> Self {
        Self {
            provider,
            executor,
            prompt: Arc::new(PromptCache::fixed(DEFAULT_PROMPT)),
            spans: SpanManager::disabled(),
            account_id,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: None,
            temperature: None,
            max_tool_rounds: Some(DEFAULT_MAX_TOOL_ROUNDS),
        }
    }

    pub fn set_prompt_cache(&mut self, prompt: Arc<PromptCache>) {
        self.prompt = prompt;
    }

    pub fn set_span_manager(&mut self, spans: SpanManager) {
        self.spans = spans;
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn set_max_tokens(&mut self, max_tokens: Option<u32>) {
        self.max_tokens = max_tokens;
    }

    pub fn set_temperature(&mut self, temperature: Option<f64>) {
        self.temperature = temperature;
    }

    /// `None` removes the cap entirely.
    pub fn set_max_tool_rounds(&mut self, rounds: Option<usize>) {
        self.max_tool_rounds = rounds;
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn provider_id(&self) -> &str {
        self.provider.provider_id()
    }

    pub async fn health_check(&self) -> bool {
        match self.provider.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!("provider health check failed: {e}");
                false
            }
        }
    }

    /// One batched turn without tracing.
    pub async fn run_turn(&self, history: Vec<ChatMessage>, options: &ChatOptions) -> Result<ChatOutcome> {
        self.drive(history, options, None, None).await
    }

    /// One streamed turn without tracing. Events go to `events` as they occur.
    pub async fn run_turn_streaming(
        &self,
        history: Vec<ChatMessage>,
        options: &ChatOptions,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<ChatOutcome> {
        self.drive(history, options, Some(&events), None).await
    }

    /// A batched turn recorded under the conversation trace.
    pub async fn chat(&self, request: TurnRequest) -> Result<TracedTurn> {
        self.traced(request, None).await
    }

    /// A streamed turn recorded under the conversation trace. The first
    /// event is always `span_id`.
    pub async fn chat_streaming(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<ChatEvent>,
    ) -> Result<TracedTurn> {
        self.traced(request, Some(&events)).await
    }

    async fn traced(
        &self,
        request: TurnRequest,
        events: Option<&mpsc::Sender<ChatEvent>>,
    ) -> Result<TracedTurn> {
        let spans = self
            .spans
            .begin_turn(
                request.parent_span_id.as_deref(),
                request.session_id.as_ref(),
                &request.messages,
            )
            .await;
        let span_id = spans.conversation_token();
        emit(
            events,
            ChatEvent::SpanId {
                span_id: span_id.clone(),
            },
        )
        .await;

        let result = self
            .drive(
                request.messages,
                &request.options,
                events,
                request.session_id.clone(),
            )
            .await;

        match result {
            Ok(outcome) => {
                self.spans
                    .finish_turn(
                        &spans,
                        TurnRecord {
                            transcript: &outcome.messages,
                            answer: &outcome.content,
                            tool_calls: outcome.tool_invocations.len(),
                        },
                    )
                    .await;
                Ok(TracedTurn { span_id, outcome })
            }
            Err(e) => {
                self.spans.fail_turn(&spans, &e.to_string()).await;
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(streaming = events.is_some(), session = ?session_id))]
    async fn drive(
        &self,
        history: Vec<ChatMessage>,
        options: &ChatOptions,
        events: Option<&mpsc::Sender<ChatEvent>>,
        session_id: Option<SessionId>,
    ) -> Result<ChatOutcome> {
        let system = match options.instructions.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => self.prompt.get().await,
        };
        let context = ToolContext::for_account(self.account_id.clone()).with_session(session_id);
        let tools = self.executor.definitions();
        let mut messages = normalize::repair(history);
        let mut invocations = Vec::new();
        let mut rounds = 0usize;

        loop {
            if self.max_tool_rounds.is_some_and(|max| rounds >= max) {
                return Err(Error::Agent(format!(
                    "tool loop exceeded maximum of {rounds} rounds"
                )));
            }
            rounds += 1;

            let request = LlmRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                system: Some(system.clone()),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                tools: tools.clone(),
            };
            let accumulator = match events {
                Some(tx) => self.stream_round(&request, tx).await?,
                None => RoundAccumulator::from_response(self.provider.complete(&request).await?),
            };
            let round = accumulator.finish();

            if round.tool_calls.is_empty() {
                info!(
                    rounds,
                    tool_calls = invocations.len(),
                    "turn complete"
                );
                messages.push(ChatMessage::assistant(round.content.clone()));
                return Ok(ChatOutcome {
                    content: round.content,
                    tool_invocations: invocations,
                    messages,
                    rounds,
                });
            }

            self.apply_tool_round(&context, round, &mut messages, &mut invocations, events)
                .await;
        }
    }

    async fn stream_round(
        &self,
        request: &LlmRequest,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<RoundAccumulator> {
        let mut stream = self.provider.complete_stream(request).await?;
        let mut accumulator = RoundAccumulator::default();
        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::Content(text) => {
                    accumulator.push_content(&text);
                    let _ = events.send(ChatEvent::Content { content: text }).await;
                }
                StreamDelta::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => accumulator.push_tool_fragment(index, id, name, &arguments),
                StreamDelta::Usage(usage) => debug!(
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "round usage"
                ),
            }
        }
        Ok(accumulator)
    }

    /// Record the assistant's calls, then run them one at a time in the
    /// order the model listed them.
    async fn apply_tool_round(
        &self,
        context: &ToolContext,
        round: Round,
        messages: &mut Vec<ChatMessage>,
        invocations: &mut Vec<ToolInvocation>,
        events: Option<&mpsc::Sender<ChatEvent>>,
    ) {
        emit(
            events,
            ChatEvent::ToolCalls {
                tool_calls: round
                    .tool_calls
                    .iter()
                    .map(|call| ToolCallSummary {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .collect(),
            },
        )
        .await;
        messages.push(ChatMessage::assistant_with_tool_calls(
            round.content,
            round.tool_calls.clone(),
        ));

        for call in round.tool_calls {
            emit(
                events,
                ChatEvent::ToolStart {
                    tool: call.name.clone(),
                    tool_call_id: call.id.clone(),
                },
            )
            .await;

            let arguments = parse_arguments(&call.name, &call.arguments);
            let outcome = self
                .executor
                .execute_value(context, &call.name, arguments.clone())
                .await;
            let payload = outcome.payload();

            emit(
                events,
                ChatEvent::ToolResult {
                    tool: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    result: payload.clone(),
                },
            )
            .await;
            messages.push(ChatMessage::tool_result(&call.id, outcome.message_content()));
            invocations.push(ToolInvocation {
                name: call.name,
                arguments,
                result: payload,
            });
        }
    }
}
