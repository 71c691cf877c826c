use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use l8r_agents::{
    ChatRuntime, LlmProvider, LlmRequest, LlmResponse, LlmStream, StreamDelta, ToolCallRequest,
    ToolExecutor, ToolRegistry,
};
use l8r_common::{AccountId, Error, Result};
use l8r_config::AppConfig;
use l8r_db::AccountStore;
use l8r_db::seed::DEMO_ACCOUNT_ID;
use l8r_gateway::router::build_router;
use l8r_gateway::state::AppState;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Replays canned responses in order; an exhausted script is a transport error.
struct ScriptedProvider {
    script: StdMutex<VecDeque<LlmResponse>>,
}

impl ScriptedProvider {
    fn new(script: Vec<LlmResponse>) -> Self {
        Self {
            script: StdMutex::new(script.into()),
        }
    }

    fn next(&self) -> Result<LlmResponse> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Agent("upstream unavailable".into()))
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn provider_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse> {
        self.next()
    }

    async fn complete_stream(&self, _request: &LlmRequest) -> Result<LlmStream> {
        let response = self.next()?;
        let mut deltas: Vec<Result<StreamDelta>> = Vec::new();
        if !response.content.is_empty() {
            deltas.push(Ok(StreamDelta::Content(response.content)));
        }
        for (index, call) in (0u32..).zip(response.tool_calls) {
            deltas.push(Ok(StreamDelta::ToolCall {
                index,
                id: Some(call.id),
                name: Some(call.name),
                arguments: call.arguments,
            }));
        }
        Ok(Box::pin(futures::stream::iter(deltas)))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

fn text(content: &str) -> LlmResponse {
    LlmResponse {
        content: content.to_string(),
        ..LlmResponse::default()
    }
}

fn balance_call() -> LlmResponse {
    LlmResponse {
        tool_calls: vec![ToolCallRequest {
            id: "call_balance".to_string(),
            name: "get_account_balance".to_string(),
            arguments: "{}".to_string(),
        }],
        ..LlmResponse::default()
    }
}

/// Start a gateway on an ephemeral port and return its base URL.
async fn start_gateway(script: Vec<LlmResponse>, expose_errors: bool) -> String {
    let mut store = AccountStore::in_memory()
        .unwrap()
        .with_retry_success_rate(1.0);
    store.seed_demo().unwrap();
    let store = Arc::new(Mutex::new(store));

    let registry = ToolRegistry::account_tools(Arc::clone(&store)).unwrap();
    let runtime = ChatRuntime::new(
        Arc::new(ScriptedProvider::new(script)),
        ToolExecutor::new(Arc::new(registry)),
        AccountId::new(DEMO_ACCOUNT_ID),
    );

    let mut config = AppConfig::default();
    config.gateway.expose_error_details = expose_errors;
    let state = Arc::new(AppState::new(config, runtime, store));
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Split an SSE body into its `data:` payloads.
fn frames(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|event| {
            event
                .lines()
                .find_map(|line| line.strip_prefix("data:"))
                .map(|data| data.trim().to_string())
        })
        .collect()
}

fn user_turn(content: &str) -> Value {
    json!({ "messages": [{ "role": "user", "content": content }] })
}

#[tokio::test]
async fn health_reports_ok() {
    let base = start_gateway(vec![], false).await;
    let body = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn tool_catalog_lists_every_tool() {
    let base = start_gateway(vec![], false).await;
    let body: Value = reqwest::get(format!("{base}/api/tools"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tools = body["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 10);
    assert_eq!(tools[0]["name"], "get_account_balance");
}

#[tokio::test]
async fn streamed_chat_emits_events_in_order() {
    let base = start_gateway(vec![balance_call(), text("You have credit left.")], false).await;
    let response = reqwest::Client::new()
        .post(format!("{base}/api/chat"))
        .json(&user_turn("What's my balance?"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let body = response.text().await.unwrap();
    let mut frames = frames(&body);
    assert_eq!(frames.pop().as_deref(), Some("[DONE]"));

    let events: Vec<Value> = frames
        .iter()
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();
    let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(
        kinds,
        vec!["span_id", "tool_calls", "tool_start", "tool_result", "content"]
    );
    assert!(!events[0]["spanId"].as_str().unwrap().is_empty());
    assert_eq!(events[3]["result"]["name"], "Alex Johnson");
    assert_eq!(events[4]["content"], "You have credit left.");
}

#[tokio::test]
async fn missing_messages_is_a_client_error() {
    let base = start_gateway(vec![], false).await;
    let client = reqwest::Client::new();
    for path in ["/api/chat", "/api/chat/complete"] {
        let response = client
            .post(format!("{base}{path}"))
            .json(&json!({ "messages": "hello" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Messages are required");
    }
}

#[tokio::test]
async fn batch_chat_returns_answer_and_span() {
    let base = start_gateway(vec![balance_call(), text("All good.")], false).await;
    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{base}/api/chat/complete"))
        .json(&json!({
            "messages": [{ "role": "user", "content": "Balance please" }],
            "sessionId": "sess-42",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["content"], "All good.");
    assert!(!body["spanId"].as_str().unwrap().is_empty());
    assert_eq!(body["toolCalls"][0]["name"], "get_account_balance");
    assert_eq!(body["messages"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn model_failure_is_a_generic_server_error() {
    let base = start_gateway(vec![], false).await;
    let response = reqwest::Client::new()
        .post(format!("{base}/api/chat/complete"))
        .json(&user_turn("hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "error": "Failed to process chat request" }));
}

#[tokio::test]
async fn model_failure_mid_stream_sends_error_event() {
    let base = start_gateway(vec![], true).await;
    let body = reqwest::Client::new()
        .post(format!("{base}/api/chat"))
        .json(&user_turn("hi"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = frames(&body);
    assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));

    let error: Value = serde_json::from_str(&frames[frames.len() - 2]).unwrap();
    assert_eq!(error["type"], "error");
    assert!(
        error["error"].as_str().unwrap().contains("upstream unavailable"),
        "{error}"
    );
}

#[tokio::test]
async fn account_endpoints_read_the_seeded_account() {
    let base = start_gateway(vec![], false).await;
    let client = reqwest::Client::new();
    let get = |path: &str| client.get(format!("{base}{path}")).send();

    let balance: Value = get("/api/users/balance").await.unwrap().json().await.unwrap();
    assert_eq!(balance["userId"], DEMO_ACCOUNT_ID);
    assert_eq!(balance["name"], "Alex Johnson");

    let failed: Value = get("/api/payments?status=failed")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(failed.as_array().unwrap().len(), 1);
    assert_eq!(failed[0]["id"], "payment_failed_001");

    let dashboard: Value = get("/api/dashboard").await.unwrap().json().await.unwrap();
    assert_eq!(dashboard["alerts"]["failedPaymentCount"], 1);

    let plan: Value = get("/api/plans/plan_001").await.unwrap().json().await.unwrap();
    assert_eq!(plan["progress"]["paid"], 2);

    let missing = get("/api/orders/order_999").await.unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"], "Order not found");
}

#[tokio::test]
async fn account_mutations_enforce_domain_rules() {
    let base = start_gateway(vec![], false).await;
    let client = reqwest::Client::new();

    let invalid = client
        .patch(format!("{base}/api/plans/plan_001"))
        .json(&json!({ "action": "cancel" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);
    let body: Value = invalid.json().await.unwrap();
    assert_eq!(
        body["error"],
        "Invalid action. Must be pause, resume, or reschedule"
    );

    let paused = client
        .patch(format!("{base}/api/plans/plan_001"))
        .json(&json!({ "action": "pause" }))
        .send()
        .await
        .unwrap();
    assert_eq!(paused.status(), 200);

    let retry = client
        .post(format!("{base}/api/payments/payment_001/retry"))
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status(), 422);

    let incomplete = client
        .post(format!("{base}/api/refunds"))
        .json(&json!({ "orderId": "order_005" }))
        .send()
        .await
        .unwrap();
    assert_eq!(incomplete.status(), 400);
    let body: Value = incomplete.json().await.unwrap();
    assert_eq!(body["error"], "orderId and reason are required");

    let created = client
        .post(format!("{base}/api/refunds"))
        .json(&json!({ "orderId": "order_005", "reason": "Wrong shade" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let body: Value = created.json().await.unwrap();
    assert_eq!(body["refund"]["status"], "pending");

    let duplicate = client
        .post(format!("{base}/api/refunds"))
        .json(&json!({ "orderId": "order_005", "reason": "Wrong shade" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 422);

    let cancelled = client
        .delete(format!("{base}/api/refunds/refund_001"))
        .send()
        .await
        .unwrap();
    assert_eq!(cancelled.status(), 200);
    let body: Value = cancelled.json().await.unwrap();
    assert_eq!(body, json!({ "success": true }));

    let gone = client
        .get(format!("{base}/api/refunds/refund_001"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}
