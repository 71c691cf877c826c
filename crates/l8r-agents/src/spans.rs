//! Keeps a multi-turn conversation in one trace even though every turn
//! arrives as an independent request.
//!
//! Layout: one `conversation` span per session with a `chat_turn_N` child
//! per turn. The first turn opens the conversation span and hands its token
//! to the client; later turns echo the token back and the conversation span
//! is updated purely by handle.

use std::future::Future;
use std::sync::Arc;

use l8r_common::{NoopTraceSink, Result, SessionId, SpanUpdate, TraceHandle, TraceSink};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::message::{ChatMessage, Role};

/// Spans in play for one turn.
#[derive(Debug, Clone)]
pub struct TurnSpans {
    pub conversation: TraceHandle,
    pub turn: TraceHandle,
    pub turn_number: usize,
    /// True when this turn opened the conversation span.
    pub opened_conversation: bool,
    session_id: Option<SessionId>,
}

impl TurnSpans {
    /// Token the client echoes back on its next turn.
    pub fn conversation_token(&self) -> String {
        self.conversation.encode()
    }
}

/// What a finished turn reports back to the trace.
pub struct TurnRecord<'a> {
    /// Full history excluding the system instruction.
    pub transcript: &'a [ChatMessage],
    pub answer: &'a str,
    pub tool_calls: usize,
}

/// Best-effort writer over a [`TraceSink`]. No method here can fail a turn.
#[derive(Clone)]
pub struct SpanManager {
    sink: Arc<dyn TraceSink>,
}

impl SpanManager {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self { sink }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopTraceSink))
    }

    /// Turns are numbered by how many user messages the history holds.
    pub fn turn_number(history: &[ChatMessage]) -> usize {
        history.iter().filter(|m| m.role == Role::User).count()
    }

    pub async fn begin_turn(
        &self,
        inbound: Option<&str>,
        session_id: Option<&SessionId>,
        history: &[ChatMessage],
    ) -> TurnSpans {
        let turn_number = Self::turn_number(history);
        let session = session_id.map(|s| s.as_str());

        let parent = inbound
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .and_then(|token| match TraceHandle::decode(token) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("ignoring inbound conversation span: {e}");
                    None
                }
            });

        let (conversation, opened_conversation) = match parent {
            Some(handle) => (handle, false),
            None => {
                let handle = TraceHandle::new_root();
                best_effort(
                    "open conversation span",
                    self.sink.open_span(
                        &handle,
                        None,
                        "conversation",
                        json!({ "sessionId": session, "type": "multi_turn_conversation" }),
                    ),
                )
                .await;
                (handle, true)
            }
        };

        let turn = TraceHandle::child_of(&conversation);
        let name = format!("chat_turn_{turn_number}");
        best_effort(
            "open turn span",
            self.sink.open_span(
                &turn,
                Some(&conversation),
                &name,
                json!({ "sessionId": session, "turnNumber": turn_number }),
            ),
        )
        .await;

        let latest = history.last().map(|m| Value::String(m.content.clone()));
        best_effort(
            "log turn input",
            self.sink.update_span(
                &turn,
                SpanUpdate {
                    input: latest,
                    ..SpanUpdate::default()
                },
            ),
        )
        .await;

        debug!(
            turn_number,
            opened_conversation,
            conversation = conversation.span_id(),
            "turn spans started"
        );
        TurnSpans {
            conversation,
            turn,
            turn_number,
            opened_conversation,
            session_id: session_id.cloned(),
        }
    }

    pub async fn finish_turn(&self, spans: &TurnSpans, record: TurnRecord<'_>) {
        best_effort(
            "log turn output",
            self.sink.update_span(
                &spans.turn,
                SpanUpdate {
                    output: Some(Value::String(record.answer.to_string())),
                    metadata: Some(json!({
                        "toolCallsCount": record.tool_calls,
                        "turnNumber": spans.turn_number,
                    })),
                    ..SpanUpdate::default()
                },
            ),
        )
        .await;
        best_effort("close turn span", self.sink.close_span(&spans.turn)).await;

        let transcript = match serde_json::to_value(record.transcript) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to serialize transcript for tracing: {e}");
                Value::Null
            }
        };
        best_effort(
            "update conversation span",
            self.sink.update_span(
                &spans.conversation,
                SpanUpdate {
                    input: Some(transcript),
                    output: Some(Value::String(record.answer.to_string())),
                    metadata: Some(json!({
                        "turnNumber": spans.turn_number,
                        "messagesCount": record.transcript.len(),
                    })),
                },
            ),
        )
        .await;

        if spans.opened_conversation {
            best_effort(
                "close conversation span",
                self.sink.close_span(&spans.conversation),
            )
            .await;
        }
    }

    /// Record a turn that ended in an error. The conversation span is left
    /// as it was so the last successful state stays visible.
    pub async fn fail_turn(&self, spans: &TurnSpans, error: &str) {
        best_effort(
            "log turn error",
            self.sink.update_span(
                &spans.turn,
                SpanUpdate {
                    output: Some(json!({ "error": error })),
                    metadata: Some(json!({
                        "turnNumber": spans.turn_number,
                        "sessionId": spans.session_id.as_ref().map(|s| s.as_str()),
                        "failed": true,
                    })),
                    ..SpanUpdate::default()
                },
            ),
        )
        .await;
        best_effort("close turn span", self.sink.close_span(&spans.turn)).await;
        if spans.opened_conversation {
            best_effort(
                "close conversation span",
                self.sink.close_span(&spans.conversation),
            )
            .await;
        }
    }
}

async fn best_effort(what: &str, op: impl Future<Output = Result<()>>) {
    if let Err(e) = op.await {
        warn!("tracing: failed to {what}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use l8r_common::Error;
    use l8r_db::SqliteSpanStore;

    fn history(turns: usize) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        for i in 1..=turns {
            messages.push(ChatMessage::user(format!("question {i}")));
            if i < turns {
                messages.push(ChatMessage::assistant(format!("answer {i}")));
            }
        }
        messages
    }

    #[tokio::test]
    async fn first_turn_opens_and_closes_conversation() {
        let store = Arc::new(SqliteSpanStore::in_memory("test").unwrap());
        let spans = SpanManager::new(store.clone());
        let session = SessionId::from_string("sess-1");
        let messages = history(1);

        let turn = spans.begin_turn(None, Some(&session), &messages).await;
        assert!(turn.opened_conversation);
        assert_eq!(turn.turn_number, 1);

        let mut transcript = messages.clone();
        transcript.push(ChatMessage::assistant("hello"));
        spans
            .finish_turn(
                &turn,
                TurnRecord {
                    transcript: &transcript,
                    answer: "hello",
                    tool_calls: 0,
                },
            )
            .await;

        let trace = store.trace(turn.conversation.root_id()).await.unwrap();
        assert_eq!(trace.len(), 2);
        let (conversation, child) = (&trace[0], &trace[1]);
        assert_eq!(conversation.name, "conversation");
        assert_eq!(conversation.metadata["type"], "multi_turn_conversation");
        assert_eq!(conversation.metadata["sessionId"], "sess-1");
        assert_eq!(conversation.metadata["messagesCount"], 2);
        assert_eq!(conversation.output, Some(json!("hello")));
        assert!(conversation.ended_at.is_some());

        assert_eq!(child.name, "chat_turn_1");
        assert_eq!(child.input, Some(json!("question 1")));
        assert_eq!(child.metadata["toolCallsCount"], 0);
        assert!(child.ended_at.is_some());
    }

    #[tokio::test]
    async fn later_turns_update_conversation_by_handle() {
        let store = Arc::new(SqliteSpanStore::in_memory("test").unwrap());
        let first = SpanManager::new(store.clone())
            .begin_turn(None, None, &history(1))
            .await;
        let token = first.conversation_token();

        // A fresh manager stands in for a different request.
        let spans = SpanManager::new(store.clone());
        let messages = history(2);
        let second = spans.begin_turn(Some(&token), None, &messages).await;
        assert!(!second.opened_conversation);
        assert_eq!(second.conversation, first.conversation);
        assert_eq!(second.turn_number, 2);

        spans
            .finish_turn(
                &second,
                TurnRecord {
                    transcript: &messages,
                    answer: "answer 2",
                    tool_calls: 3,
                },
            )
            .await;

        let trace = store.trace(first.conversation.root_id()).await.unwrap();
        let names: Vec<&str> = trace.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["conversation", "chat_turn_1", "chat_turn_2"]);
        assert_eq!(trace[0].metadata["turnNumber"], 2);
        assert_eq!(trace[0].output, Some(json!("answer 2")));
        assert_eq!(trace[2].parent_id.as_deref(), Some(first.conversation.span_id()));
        assert_eq!(trace[2].metadata["toolCallsCount"], 3);
    }

    #[tokio::test]
    async fn malformed_inbound_token_starts_a_new_conversation() {
        let spans = SpanManager::disabled();
        let turn = spans
            .begin_turn(Some("definitely not a token"), None, &history(3))
            .await;
        assert!(turn.opened_conversation);
        assert_eq!(turn.turn_number, 3);
    }

    struct BrokenSink;

    #[async_trait]
    impl TraceSink for BrokenSink {
        async fn open_span(
            &self,
            _span: &TraceHandle,
            _parent: Option<&TraceHandle>,
            _name: &str,
            _metadata: Value,
        ) -> Result<()> {
            Err(Error::Trace("collector unreachable".into()))
        }

        async fn update_span(&self, _span: &TraceHandle, _update: SpanUpdate) -> Result<()> {
            Err(Error::Trace("collector unreachable".into()))
        }

        async fn close_span(&self, _span: &TraceHandle) -> Result<()> {
            Err(Error::Trace("collector unreachable".into()))
        }
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let spans = SpanManager::new(Arc::new(BrokenSink));
        let messages = history(1);
        let turn = spans.begin_turn(None, None, &messages).await;
        spans
            .finish_turn(
                &turn,
                TurnRecord {
                    transcript: &messages,
                    answer: "ok",
                    tool_calls: 0,
                },
            )
            .await;
        spans.fail_turn(&turn, "boom").await;
        assert!(TraceHandle::decode(&turn.conversation_token()).is_ok());
    }
}
