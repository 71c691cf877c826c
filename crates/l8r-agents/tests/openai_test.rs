use std::sync::Arc;

use futures::StreamExt;
use l8r_agents::{
    ChatEvent, ChatMessage, ChatOptions, ChatRuntime, LlmProvider, LlmRequest, OpenAiProvider,
    StreamDelta, ToolDefinition, ToolExecutor, ToolRegistry,
};
use l8r_common::{AccountId, Error};
use l8r_db::AccountStore;
use l8r_db::seed::DEMO_ACCOUNT_ID;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(tools: Vec<ToolDefinition>) -> LlmRequest {
    LlmRequest {
        model: "gpt-4o".to_string(),
        messages: vec![ChatMessage::user("What's my balance?")],
        system: Some("You are a helpful assistant.".to_string()),
        max_tokens: None,
        temperature: None,
        tools,
    }
}

fn balance_tool() -> ToolDefinition {
    ToolDefinition {
        name: "get_account_balance".to_string(),
        description: "Get the balance".to_string(),
        input_schema: json!({"type": "object", "properties": {}}),
    }
}

fn sse(events: &[serde_json::Value]) -> String {
    let mut body: String = events
        .iter()
        .map(|event| format!("data: {event}\n\n"))
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn test_openai_completion() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o",
            "stream": false,
            "messages": [
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "What's my balance?"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-123",
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "You have $2,599.01 available."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let response = provider.complete(&request(vec![])).await.unwrap();

    assert_eq!(response.content, "You have $2,599.01 available.");
    assert!(response.tool_calls.is_empty());
    assert_eq!(response.stop_reason.as_deref(), Some("stop"));
    assert_eq!(response.usage.unwrap().output_tokens, 12);
}

#[tokio::test]
async fn test_openai_tool_use() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"tool_choice": "auto"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc123",
                        "type": "function",
                        "function": {"name": "get_account_balance", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let response = provider.complete(&request(vec![balance_tool()])).await.unwrap();

    assert_eq!(response.content, "");
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].id, "call_abc123");
    assert_eq!(response.tool_calls[0].name, "get_account_balance");
}

#[tokio::test]
async fn test_openai_error_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let err = provider.complete(&request(vec![])).await.unwrap_err();
    match err {
        Error::Agent(msg) => {
            assert!(msg.contains("status=429"), "{msg}");
            assert!(msg.contains("rate limited"), "{msg}");
        }
        other => panic!("expected agent error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_openai_streaming() {
    let mock_server = MockServer::start().await;

    let body = sse(&[
        json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}),
        json!({"choices": [{"index": 0, "delta": {"content": "Hello"}}]}),
        json!({"choices": [{"index": 0, "delta": {"content": " Alex"}}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
    ]);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "stream": true,
            "stream_options": {"include_usage": true}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new("test-key".to_string(), Some(mock_server.uri()));
    let mut stream = provider.complete_stream(&request(vec![])).await.unwrap();

    let mut text = String::new();
    let mut saw_usage = false;
    while let Some(delta) = stream.next().await {
        match delta.unwrap() {
            StreamDelta::Content(piece) => text.push_str(&piece),
            StreamDelta::Usage(usage) => {
                saw_usage = true;
                assert_eq!(usage.input_tokens, 5);
            }
            StreamDelta::ToolCall { .. } => panic!("unexpected tool call"),
        }
    }
    assert_eq!(text, "Hello Alex");
    assert!(saw_usage);
}

#[tokio::test]
async fn test_streamed_turn_over_http() {
    let mock_server = MockServer::start().await;

    // Round 1: a tool call split across fragments.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "id": "call_1", "type": "function",
                     "function": {"name": "get_payment_details", "arguments": ""}}
                ]}}]}),
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"payment_id\":"}}
                ]}}]}),
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "\"payment_failed_001\"}"}}
                ]}}]}),
            ]),
            "text/event-stream",
        ))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    // Round 2: the answer.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[json!({"choices": [{"index": 0, "delta": {"content": "That payment failed."}}]})]),
            "text/event-stream",
        ))
        .mount(&mock_server)
        .await;

    let mut store = AccountStore::in_memory().unwrap();
    store.seed_demo().unwrap();
    let registry = ToolRegistry::account_tools(Arc::new(Mutex::new(store))).unwrap();
    let provider = Arc::new(OpenAiProvider::new(
        "test-key".to_string(),
        Some(mock_server.uri()),
    ));
    let runtime = ChatRuntime::new(
        provider,
        ToolExecutor::new(Arc::new(registry)),
        AccountId::new(DEMO_ACCOUNT_ID),
    );

    let (tx, mut rx) = mpsc::channel(32);
    let outcome = runtime
        .run_turn_streaming(
            vec![ChatMessage::user("Why did my payment fail?")],
            &ChatOptions::default(),
            tx,
        )
        .await
        .unwrap();

    assert_eq!(outcome.content, "That payment failed.");
    assert_eq!(outcome.tool_invocations.len(), 1);
    assert_eq!(
        outcome.tool_invocations[0].result["failureReason"],
        "Insufficient funds in linked payment method"
    );

    let mut kinds = Vec::new();
    while let Some(event) = rx.recv().await {
        kinds.push(match event {
            ChatEvent::ToolCalls { .. } => "tool_calls",
            ChatEvent::ToolStart { .. } => "tool_start",
            ChatEvent::ToolResult { .. } => "tool_result",
            ChatEvent::Content { .. } => "content",
            ChatEvent::SpanId { .. } => "span_id",
            ChatEvent::Error { .. } => "error",
        });
    }
    assert_eq!(kinds, vec!["tool_calls", "tool_start", "tool_result", "content"]);
}
