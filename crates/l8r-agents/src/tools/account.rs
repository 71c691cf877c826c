//! Account-domain tools. Each one forwards to a single `AccountStore`
//! operation scoped to the caller's account.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use l8r_common::{Error, Result};
use l8r_db::{AccountStore, Money, OrderFilters, PlanAction, PlanFilters};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::{Tool, ToolContext};

type Store = Arc<Mutex<AccountStore>>;

const DEFAULT_ORDER_LIMIT: usize = 10;
const DEFAULT_PAYMENT_HISTORY_LIMIT: usize = 20;

/// One handler per catalog entry.
pub fn all(store: Store) -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(GetAccountBalance::new(Arc::clone(&store))),
        Box::new(GetOrders::new(Arc::clone(&store))),
        Box::new(GetOrderDetails::new(Arc::clone(&store))),
        Box::new(GetInstallmentPlans::new(Arc::clone(&store))),
        Box::new(GetPlanDetails::new(Arc::clone(&store))),
        Box::new(GetPaymentHistory::new(Arc::clone(&store))),
        Box::new(GetPaymentDetails::new(Arc::clone(&store))),
        Box::new(RetryPayment::new(Arc::clone(&store))),
        Box::new(ModifyPlan::new(Arc::clone(&store))),
        Box::new(RequestRefund::new(store)),
    ]
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    optional_str(args, key).ok_or_else(|| Error::Tool(format!("Missing required parameter: {key}")))
}

/// Numbers may arrive as JSON numbers or numeric strings. Zero and
/// unparseable values fall back to the default.
fn optional_number(args: &Value, key: &str) -> Option<f64> {
    match args.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn limit(args: &Value, default: usize) -> usize {
    optional_number(args, "limit")
        .filter(|n| *n >= 1.0)
        .map(|n| n as usize)
        .unwrap_or(default)
}

/// Accepts `2025-02-15` (midnight UTC) or a full RFC 3339 timestamp.
pub fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| Error::Tool(format!("Invalid date: {raw}")))
}

macro_rules! store_tool {
    ($name:ident) => {
        pub struct $name {
            store: Store,
        }

        impl $name {
            pub fn new(store: Store) -> Self {
                Self { store }
            }
        }
    };
}

store_tool!(GetAccountBalance);
store_tool!(GetOrders);
store_tool!(GetOrderDetails);
store_tool!(GetInstallmentPlans);
store_tool!(GetPlanDetails);
store_tool!(GetPaymentHistory);
store_tool!(GetPaymentDetails);
store_tool!(RetryPayment);
store_tool!(ModifyPlan);
store_tool!(RequestRefund);

#[async_trait]
impl Tool for GetAccountBalance {
    fn name(&self) -> &'static str {
        "get_account_balance"
    }

    fn description(&self) -> &'static str {
        "Get the customer's account balance, credit limit and available credit. Use it \
         whenever the customer asks about balance, available credit or their limit."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn execute(&self, context: &ToolContext, _args: Value) -> Result<Value> {
        let store = self.store.lock().await;
        Ok(serde_json::to_value(
            store.account_balance(context.account_id.as_str())?,
        )?)
    }
}

#[async_trait]
impl Tool for GetOrders {
    fn name(&self) -> &'static str {
        "get_orders"
    }

    fn description(&self) -> &'static str {
        "List the customer's orders, optionally filtered by status or merchant category."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["pending", "completed", "cancelled", "refunded"],
                    "description": "Only return orders with this status"
                },
                "category": {
                    "type": "string",
                    "description": "Only return orders from this merchant category (e.g. Electronics, Apparel)"
                },
                "limit": {
                    "type": "number",
                    "description": "Maximum number of orders to return (default 10)"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let filters = OrderFilters {
            status: optional_str(&args, "status").map(str::to_string),
            merchant_category: optional_str(&args, "category").map(str::to_string),
            limit: Some(limit(&args, DEFAULT_ORDER_LIMIT)),
            ..OrderFilters::default()
        };
        let store = self.store.lock().await;
        Ok(serde_json::to_value(
            store.orders(context.account_id.as_str(), &filters)?,
        )?)
    }
}

#[async_trait]
impl Tool for GetOrderDetails {
    fn name(&self) -> &'static str {
        "get_order_details"
    }

    fn description(&self) -> &'static str {
        "Get full details of one order, including its installment plan and any refund requests."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "order_id": { "type": "string", "description": "ID of the order to look up" }
            },
            "required": ["order_id"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let order_id = required_str(&args, "order_id")?;
        let store = self.store.lock().await;
        Ok(serde_json::to_value(
            store.order(context.account_id.as_str(), order_id)?,
        )?)
    }
}

#[async_trait]
impl Tool for GetInstallmentPlans {
    fn name(&self) -> &'static str {
        "get_installment_plans"
    }

    fn description(&self) -> &'static str {
        "List the customer's installment payment plans, optionally filtered by status."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["active", "paused", "completed", "cancelled"],
                    "description": "Only return plans with this status"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let filters = PlanFilters {
            status: optional_str(&args, "status").map(str::to_string),
            ..PlanFilters::default()
        };
        let store = self.store.lock().await;
        Ok(serde_json::to_value(
            store.plans(context.account_id.as_str(), &filters)?,
        )?)
    }
}

#[async_trait]
impl Tool for GetPlanDetails {
    fn name(&self) -> &'static str {
        "get_plan_details"
    }

    fn description(&self) -> &'static str {
        "Get full details of one installment plan, including its payment schedule and progress."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plan_id": { "type": "string", "description": "ID of the installment plan to look up" }
            },
            "required": ["plan_id"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let plan_id = required_str(&args, "plan_id")?;
        let store = self.store.lock().await;
        Ok(serde_json::to_value(
            store.plan(context.account_id.as_str(), plan_id)?,
        )?)
    }
}

#[async_trait]
impl Tool for GetPaymentHistory {
    fn name(&self) -> &'static str {
        "get_payment_history"
    }

    fn description(&self) -> &'static str {
        "Get the customer's completed payments, most recent first."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "number",
                    "description": "Maximum number of payments to return (default 20)"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let store = self.store.lock().await;
        Ok(serde_json::to_value(store.payment_history(
            context.account_id.as_str(),
            limit(&args, DEFAULT_PAYMENT_HISTORY_LIMIT),
        )?)?)
    }
}

#[async_trait]
impl Tool for GetPaymentDetails {
    fn name(&self) -> &'static str {
        "get_payment_details"
    }

    fn description(&self) -> &'static str {
        "Get full details of one payment."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "payment_id": { "type": "string", "description": "ID of the payment to look up" }
            },
            "required": ["payment_id"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let payment_id = required_str(&args, "payment_id")?;
        let store = self.store.lock().await;
        Ok(serde_json::to_value(
            store.payment(context.account_id.as_str(), payment_id)?,
        )?)
    }
}

#[async_trait]
impl Tool for RetryPayment {
    fn name(&self) -> &'static str {
        "retry_payment"
    }

    fn description(&self) -> &'static str {
        "Retry a failed payment. Only payments whose status is \"failed\" can be retried."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "payment_id": { "type": "string", "description": "ID of the failed payment to retry" }
            },
            "required": ["payment_id"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let payment_id = required_str(&args, "payment_id")?;
        let mut store = self.store.lock().await;
        Ok(serde_json::to_value(
            store.retry_payment(context.account_id.as_str(), payment_id)?,
        )?)
    }
}

#[async_trait]
impl Tool for ModifyPlan {
    fn name(&self) -> &'static str {
        "modify_plan"
    }

    fn description(&self) -> &'static str {
        "Change an installment plan: pause it, resume it, or reschedule its next payment."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plan_id": { "type": "string", "description": "ID of the installment plan to change" },
                "action": {
                    "type": "string",
                    "enum": ["pause", "resume", "reschedule"],
                    "description": "What to do with the plan"
                },
                "new_date": {
                    "type": "string",
                    "description": "Reschedule only: the new payment date in ISO format (e.g. 2025-02-15)"
                }
            },
            "required": ["plan_id", "action"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let plan_id = required_str(&args, "plan_id")?;
        let action: PlanAction = required_str(&args, "action")?
            .parse()
            .map_err(|_| Error::Tool("Invalid action".to_string()))?;
        let new_date = optional_str(&args, "new_date").map(parse_date).transpose()?;

        let mut store = self.store.lock().await;
        Ok(serde_json::to_value(store.modify_plan(
            context.account_id.as_str(),
            plan_id,
            action,
            new_date,
        )?)?)
    }
}

#[async_trait]
impl Tool for RequestRefund {
    fn name(&self) -> &'static str {
        "request_refund"
    }

    fn description(&self) -> &'static str {
        "Submit a refund request for an order. Only orders placed within the last 30 days are eligible."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "order_id": { "type": "string", "description": "ID of the order to refund" },
                "reason": { "type": "string", "description": "Why the customer wants a refund" },
                "amount": {
                    "type": "number",
                    "description": "Optional amount to refund; defaults to the full order total"
                }
            },
            "required": ["order_id", "reason"]
        })
    }

    async fn execute(&self, context: &ToolContext, args: Value) -> Result<Value> {
        let order_id = required_str(&args, "order_id")?;
        let reason = required_str(&args, "reason")?;
        let amount = optional_number(&args, "amount").map(Money::from_dollars);

        let mut store = self.store.lock().await;
        Ok(serde_json::to_value(store.request_refund(
            context.account_id.as_str(),
            order_id,
            reason,
            amount,
        )?)?)
    }
}
