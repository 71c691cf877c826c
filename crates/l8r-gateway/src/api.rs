//! REST API over the account store, scoped to the configured account.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use l8r_agents::tools::account::parse_date;
use l8r_db::{Money, OrderFilters, PaymentFilters, PlanAction, PlanFilters, RefundFilters};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::SharedState;

type ApiResult = Result<Json<Value>, ApiError>;

fn to_json(value: impl Serialize) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| ApiError::from(l8r_common::Error::from(e)))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// GET /api/users/balance
pub async fn balance(State(state): State<SharedState>) -> ApiResult {
    let store = state.store.lock().await;
    to_json(store.account_balance(state.account_id.as_str())?)
}

/// GET /api/dashboard
pub async fn dashboard(State(state): State<SharedState>) -> ApiResult {
    let store = state.store.lock().await;
    to_json(store.dashboard(state.account_id.as_str())?)
}

#[derive(Debug, Default, Deserialize)]
pub struct OrderQuery {
    pub status: Option<String>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/orders
pub async fn list_orders(
    State(state): State<SharedState>,
    Query(query): Query<OrderQuery>,
) -> ApiResult {
    let filters = OrderFilters {
        status: non_blank(query.status),
        merchant_category: non_blank(query.category),
        limit: query.limit,
        ..OrderFilters::default()
    };
    let store = state.store.lock().await;
    to_json(store.orders(state.account_id.as_str(), &filters)?)
}

/// GET /api/orders/{id}
pub async fn get_order(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let store = state.store.lock().await;
    to_json(store.order(state.account_id.as_str(), &id)?)
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/plans
pub async fn list_plans(
    State(state): State<SharedState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult {
    let filters = PlanFilters {
        status: non_blank(query.status),
        limit: query.limit,
    };
    let store = state.store.lock().await;
    to_json(store.plans(state.account_id.as_str(), &filters)?)
}

/// GET /api/plans/{id}
pub async fn get_plan(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let store = state.store.lock().await;
    to_json(store.plan(state.account_id.as_str(), &id)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyPlanBody {
    pub action: Option<String>,
    pub new_date: Option<String>,
}

/// PATCH /api/plans/{id}
pub async fn modify_plan(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<ModifyPlanBody>,
) -> ApiResult {
    let action = body
        .action
        .as_deref()
        .and_then(|a| a.parse::<PlanAction>().ok())
        .ok_or_else(|| {
            ApiError::bad_request("Invalid action. Must be pause, resume, or reschedule")
        })?;
    let new_date = non_blank(body.new_date)
        .map(|raw| parse_date(&raw))
        .transpose()
        .map_err(|e| ApiError::bad_request(e.user_message()))?;

    let mut store = state.store.lock().await;
    to_json(store.modify_plan(state.account_id.as_str(), &id, action, new_date)?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentQuery {
    pub status: Option<String>,
    pub plan_id: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/payments
pub async fn list_payments(
    State(state): State<SharedState>,
    Query(query): Query<PaymentQuery>,
) -> ApiResult {
    let filters = PaymentFilters {
        status: non_blank(query.status),
        plan_id: non_blank(query.plan_id),
        limit: query.limit,
        ..PaymentFilters::default()
    };
    let store = state.store.lock().await;
    to_json(store.payments(state.account_id.as_str(), &filters)?)
}

/// GET /api/payments/{id}
pub async fn get_payment(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let store = state.store.lock().await;
    to_json(store.payment(state.account_id.as_str(), &id)?)
}

/// POST /api/payments/{id}/retry
pub async fn retry_payment(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let mut store = state.store.lock().await;
    to_json(store.retry_payment(state.account_id.as_str(), &id)?)
}

/// GET /api/refunds
pub async fn list_refunds(
    State(state): State<SharedState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult {
    let filters = RefundFilters {
        status: non_blank(query.status),
        limit: query.limit,
    };
    let store = state.store.lock().await;
    to_json(store.refunds(state.account_id.as_str(), &filters)?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundBody {
    pub order_id: Option<String>,
    pub reason: Option<String>,
    pub amount: Option<f64>,
}

/// POST /api/refunds
pub async fn create_refund(
    State(state): State<SharedState>,
    Json(body): Json<RefundBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (Some(order_id), Some(reason)) = (non_blank(body.order_id), non_blank(body.reason)) else {
        return Err(ApiError::bad_request("orderId and reason are required"));
    };
    let amount = body.amount.map(Money::from_dollars);

    let mut store = state.store.lock().await;
    let outcome = store.request_refund(state.account_id.as_str(), &order_id, &reason, amount)?;
    Ok((StatusCode::CREATED, to_json(outcome)?))
}

/// GET /api/refunds/{id}
pub async fn get_refund(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let store = state.store.lock().await;
    to_json(store.refund(state.account_id.as_str(), &id)?)
}

/// DELETE /api/refunds/{id}
pub async fn cancel_refund(State(state): State<SharedState>, Path(id): Path<String>) -> ApiResult {
    let mut store = state.store.lock().await;
    store.cancel_refund(state.account_id.as_str(), &id)?;
    Ok(Json(json!({ "success": true })))
}
