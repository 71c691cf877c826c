//! Chat endpoints: an SSE stream of turn events and a batch variant.

use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use l8r_agents::{ChatEvent, ChatOptions, TurnRequest, normalize};
use l8r_common::SessionId;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::error::{ApiError, CHAT_FAILURE};
use crate::state::SharedState;

const MESSAGES_REQUIRED: &str = "Messages are required";
const EVENT_BUFFER: usize = 64;

/// Pull a turn out of `{messages, sessionId?, parentSpanId?, instructions?}`.
fn turn_request(payload: Result<Json<Value>, JsonRejection>) -> Result<TurnRequest, ApiError> {
    let Json(body) = payload.map_err(|_| ApiError::bad_request(MESSAGES_REQUIRED))?;
    let Some(messages) = body.get("messages").filter(|m| m.is_array()) else {
        return Err(ApiError::bad_request(MESSAGES_REQUIRED));
    };
    let messages = normalize(messages).map_err(|e| ApiError::bad_request(e.user_message()))?;

    let text = |key: &str| {
        body.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Ok(TurnRequest {
        messages,
        session_id: text("sessionId").map(SessionId::from_string),
        parent_span_id: text("parentSpanId"),
        options: ChatOptions {
            instructions: text("instructions"),
        },
    })
}

/// POST /api/chat
pub async fn chat_stream(
    State(state): State<SharedState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = turn_request(payload)?;
    info!(
        messages = request.messages.len(),
        continued = request.parent_span_id.is_some(),
        "chat stream requested"
    );

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let runtime = state.runtime.clone();
    let expose = state.expose_error_details();
    tokio::spawn(async move {
        let errors = tx.clone();
        if let Err(e) = runtime.chat_streaming(request, tx).await {
            error!("streamed chat turn failed: {e}");
            let message = if expose {
                format!("{CHAT_FAILURE}: {e}")
            } else {
                CHAT_FAILURE.to_string()
            };
            let _ = errors.send(ChatEvent::Error { error: message }).await;
        }
    });

    Ok(Sse::new(event_stream(rx)).keep_alive(KeepAlive::default()))
}

/// Each event becomes one `data:` frame; the stream ends with `[DONE]` once
/// the turn has dropped its sender.
fn event_stream(rx: mpsc::Receiver<ChatEvent>) -> impl Stream<Item = Result<Event, Infallible>> {
    ReceiverStream::new(rx)
        .map(|event| {
            let frame = match serde_json::to_string(&event) {
                Ok(data) => data,
                Err(e) => json!({ "type": "error", "error": e.to_string() }).to_string(),
            };
            Ok(Event::default().data(frame))
        })
        .chain(stream::once(async { Ok(Event::default().data("[DONE]")) }))
}

/// POST /api/chat/complete
pub async fn chat_complete(
    State(state): State<SharedState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = turn_request(payload)?;
    let turn = state
        .runtime
        .chat(request)
        .await
        .map_err(|e| ApiError::chat(&e, state.expose_error_details()))?;

    Ok(Json(json!({
        "content": turn.outcome.content,
        "spanId": turn.span_id,
        "toolCalls": turn.outcome.tool_invocations,
        "messages": turn.outcome.messages,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use l8r_agents::Role;

    fn parse(body: Value) -> Result<TurnRequest, ApiError> {
        turn_request(Ok(Json(body)))
    }

    #[test]
    fn missing_or_non_array_messages_are_rejected() {
        for body in [json!({}), json!({"messages": "hi"}), json!({"messages": null})] {
            let err = parse(body).err().unwrap();
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn optional_fields_are_trimmed_and_blank_ones_dropped() {
        let request = parse(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "sessionId": " sess-9 ",
            "parentSpanId": "",
            "instructions": "be brief",
        }))
        .unwrap();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.session_id.unwrap().as_str(), "sess-9");
        assert!(request.parent_span_id.is_none());
        assert_eq!(request.options.instructions.as_deref(), Some("be brief"));
    }

    #[tokio::test]
    async fn stream_ends_with_done_sentinel() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ChatEvent::Content {
            content: "hi".into(),
        })
        .await
        .unwrap();
        drop(tx);
        let frames: Vec<_> = event_stream(rx).collect().await;
        assert_eq!(frames.len(), 2);
    }
}
