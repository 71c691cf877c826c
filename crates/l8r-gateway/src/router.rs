use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::chat;
use crate::state::SharedState;

/// Build the main application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/tools", get(list_tools))
        .route("/api/chat", post(chat::chat_stream))
        .route("/api/chat/complete", post(chat::chat_complete))
        .route("/api/users/balance", get(api::balance))
        .route("/api/dashboard", get(api::dashboard))
        .route("/api/orders", get(api::list_orders))
        .route("/api/orders/{id}", get(api::get_order))
        .route("/api/plans", get(api::list_plans))
        .route("/api/plans/{id}", get(api::get_plan).patch(api::modify_plan))
        .route("/api/payments", get(api::list_payments))
        .route("/api/payments/{id}", get(api::get_payment))
        .route("/api/payments/{id}/retry", post(api::retry_payment))
        .route(
            "/api/refunds",
            get(api::list_refunds).post(api::create_refund),
        )
        .route(
            "/api/refunds/{id}",
            get(api::get_refund).delete(api::cancel_refund),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "provider": state.runtime.provider_id(),
        "model": state.runtime.model(),
        "account": state.account_id.as_str(),
        "tools": state.runtime.executor().registry().len(),
    }))
}

/// GET /api/tools: the catalog advertised to the model.
async fn list_tools(State(state): State<SharedState>) -> Json<Value> {
    let tools: Vec<Value> = state
        .runtime
        .executor()
        .definitions()
        .into_iter()
        .map(|def| {
            json!({
                "name": def.name,
                "description": def.description,
                "parameters": def.input_schema,
            })
        })
        .collect();
    Json(json!({ "tools": tools }))
}
