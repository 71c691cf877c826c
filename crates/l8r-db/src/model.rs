use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::money::Money;

/// Closed set of lowercase status strings stored as TEXT.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    )),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_enum!(OrderStatus {
    Pending => "pending",
    Completed => "completed",
    Cancelled => "cancelled",
    Refunded => "refunded",
});

text_enum!(PlanStatus {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Cancelled => "cancelled",
});

text_enum!(
    /// `scheduled` and `pending` both count as upcoming.
    PaymentStatus {
        Scheduled => "scheduled",
        Pending => "pending",
        Paid => "paid",
        Failed => "failed",
    }
);

impl PaymentStatus {
    pub fn is_upcoming(self) -> bool {
        matches!(self, Self::Scheduled | Self::Pending)
    }
}

text_enum!(
    /// `pending` and `approved` requests block a new request on the same order.
    RefundStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Processed => "processed",
    }
);

text_enum!(PlanAction {
    Pause => "pause",
    Resume => "resume",
    Reschedule => "reschedule",
});

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub user_id: String,
    pub name: String,
    pub credit_limit: Money,
    pub available_credit: Money,
    pub used_credit: Money,
    pub utilization_percent: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub merchant_name: String,
    pub merchant_category: String,
    pub total_amount: Money,
    pub status: OrderStatus,
    pub order_date: DateTime<Utc>,
}

/// Merchant reference attached to plan, payment and refund listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRef {
    pub id: String,
    pub merchant_name: String,
    pub merchant_category: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanBrief {
    pub id: String,
    pub status: PlanStatus,
    pub remaining_amount: Money,
    pub number_of_payments: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderListItem {
    #[serde(flatten)]
    pub order: Order,
    pub installment_plan: Option<PlanBrief>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub installment_plan: Option<PlanWithPayments>,
    pub refund_requests: Vec<RefundRequest>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    pub total_spent: Money,
    pub order_count: usize,
    pub average_order_value: Money,
    pub by_category: BTreeMap<String, Money>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallmentPlan {
    pub id: String,
    pub user_id: String,
    pub order_id: String,
    pub total_amount: Money,
    pub number_of_payments: i64,
    pub remaining_amount: Money,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanWithPayments {
    #[serde(flatten)]
    pub plan: InstallmentPlan,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanListItem {
    #[serde(flatten)]
    pub plan: InstallmentPlan,
    pub order: OrderRef,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanProgress {
    pub paid: usize,
    pub total: i64,
    pub percent_complete: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDetails {
    #[serde(flatten)]
    pub plan: InstallmentPlan,
    pub order: Order,
    pub payments: Vec<Payment>,
    pub progress: PlanProgress,
    pub paid_payments: Vec<Payment>,
    pub upcoming_payments: Vec<Payment>,
    pub failed_payments: Vec<Payment>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedPlan {
    #[serde(flatten)]
    pub plan: InstallmentPlan,
    pub merchant_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub total_plans: usize,
    pub active_plans: usize,
    pub total_owed: Money,
    pub total_original: Money,
    pub paid_off: Money,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub amount: Money,
    pub due_date: DateTime<Utc>,
    pub paid_date: Option<DateTime<Utc>>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentListItem {
    #[serde(flatten)]
    pub payment: Payment,
    pub order: OrderRef,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetails {
    #[serde(flatten)]
    pub payment: Payment,
    pub plan: InstallmentPlan,
    pub order: Order,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub success: bool,
    pub payment: Payment,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub id: String,
    pub user_id: String,
    pub order_id: String,
    pub reason: String,
    pub amount: Money,
    pub status: RefundStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundListItem {
    #[serde(flatten)]
    pub refund: RefundRequest,
    pub order: OrderRef,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundDetails {
    #[serde(flatten)]
    pub refund: RefundRequest,
    pub order: Order,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundOutcome {
    pub refund: RefundRequest,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundSummary {
    pub total_requests: usize,
    pub pending_count: usize,
    pub pending_amount: Money,
    pub approved_count: usize,
    pub processed_count: usize,
    pub total_refunded: Money,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardAlerts {
    pub has_failed_payments: bool,
    pub failed_payment_count: usize,
    pub next_payment_due: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub balance: AccountBalance,
    pub recent_orders: Vec<OrderListItem>,
    pub upcoming_payments: Vec<PaymentListItem>,
    pub failed_payments: Vec<PaymentListItem>,
    pub active_plans: Vec<PlanListItem>,
    pub alerts: DashboardAlerts,
}
