use chrono::{DateTime, NaiveDate, Utc};
use l8r_common::{Error, Result};
use rusqlite::params;
use tracing::info;

use crate::account_store::{AccountStore, timestamp};
use crate::model::{OrderStatus, PaymentStatus, PlanStatus, RefundRequest, RefundStatus};
use crate::money::Money;

pub const DEMO_ACCOUNT_ID: &str = "user_demo_001";

/// Calendar day the demo data is written against. Every seeded date is
/// shifted by `today - REFERENCE_DAY` so the relative ages never drift.
const REFERENCE_DAY: &str = "2025-02-05";

struct SeedOrder {
    id: &'static str,
    merchant: &'static str,
    category: &'static str,
    total_cents: i64,
    status: OrderStatus,
    date: &'static str,
}

struct SeedPlan {
    id: &'static str,
    order_id: &'static str,
    total_cents: i64,
    remaining_cents: i64,
    next_payment: &'static str,
}

struct SeedPayment {
    id: &'static str,
    plan_id: &'static str,
    amount_cents: i64,
    due: &'static str,
    status: PaymentStatus,
    failure_reason: Option<&'static str>,
}

const ORDERS: &[SeedOrder] = &[
    SeedOrder { id: "order_001", merchant: "Apple Store", category: "Electronics", total_cents: 129_900, status: OrderStatus::Completed, date: "2024-12-15" },
    SeedOrder { id: "order_002", merchant: "Nike", category: "Apparel", total_cents: 24_500, status: OrderStatus::Completed, date: "2024-12-20" },
    SeedOrder { id: "order_003", merchant: "IKEA", category: "Home & Furniture", total_cents: 58_950, status: OrderStatus::Completed, date: "2025-01-02" },
    SeedOrder { id: "order_004", merchant: "Best Buy", category: "Electronics", total_cents: 44_999, status: OrderStatus::Completed, date: "2025-01-08" },
    SeedOrder { id: "order_005", merchant: "Sephora", category: "Beauty", total_cents: 12_700, status: OrderStatus::Completed, date: "2025-01-12" },
    SeedOrder { id: "order_006", merchant: "Amazon", category: "General", total_cents: 8_999, status: OrderStatus::Pending, date: "2025-01-18" },
];

const PLANS: &[SeedPlan] = &[
    SeedPlan { id: "plan_001", order_id: "order_001", total_cents: 129_900, remaining_cents: 64_950, next_payment: "2025-02-15" },
    SeedPlan { id: "plan_002", order_id: "order_003", total_cents: 58_950, remaining_cents: 44_213, next_payment: "2025-02-02" },
    SeedPlan { id: "plan_003", order_id: "order_004", total_cents: 44_999, remaining_cents: 44_999, next_payment: "2025-02-08" },
];

const PAYMENTS: &[SeedPayment] = &[
    SeedPayment { id: "payment_001", plan_id: "plan_001", amount_cents: 32_475, due: "2024-12-15", status: PaymentStatus::Paid, failure_reason: None },
    SeedPayment { id: "payment_002", plan_id: "plan_001", amount_cents: 32_475, due: "2025-01-15", status: PaymentStatus::Paid, failure_reason: None },
    SeedPayment { id: "payment_upcoming_001", plan_id: "plan_001", amount_cents: 32_475, due: "2025-02-15", status: PaymentStatus::Scheduled, failure_reason: None },
    SeedPayment { id: "payment_004", plan_id: "plan_001", amount_cents: 32_475, due: "2025-03-15", status: PaymentStatus::Scheduled, failure_reason: None },
    SeedPayment { id: "payment_005", plan_id: "plan_002", amount_cents: 14_738, due: "2025-01-02", status: PaymentStatus::Paid, failure_reason: None },
    SeedPayment { id: "payment_failed_001", plan_id: "plan_002", amount_cents: 14_738, due: "2025-02-02", status: PaymentStatus::Failed, failure_reason: Some("Insufficient funds in linked payment method") },
    SeedPayment { id: "payment_007", plan_id: "plan_002", amount_cents: 14_737, due: "2025-03-02", status: PaymentStatus::Scheduled, failure_reason: None },
    SeedPayment { id: "payment_008", plan_id: "plan_002", amount_cents: 14_737, due: "2025-04-02", status: PaymentStatus::Scheduled, failure_reason: None },
    SeedPayment { id: "payment_009", plan_id: "plan_003", amount_cents: 11_250, due: "2025-02-08", status: PaymentStatus::Scheduled, failure_reason: None },
    SeedPayment { id: "payment_010", plan_id: "plan_003", amount_cents: 11_250, due: "2025-03-08", status: PaymentStatus::Scheduled, failure_reason: None },
    SeedPayment { id: "payment_011", plan_id: "plan_003", amount_cents: 11_250, due: "2025-04-08", status: PaymentStatus::Scheduled, failure_reason: None },
    SeedPayment { id: "payment_012", plan_id: "plan_003", amount_cents: 11_249, due: "2025-05-08", status: PaymentStatus::Scheduled, failure_reason: None },
];

/// Maps the fixed seed calendar onto the current date.
struct Calendar {
    shift: chrono::TimeDelta,
}

impl Calendar {
    fn anchored_today() -> Result<Self> {
        let reference = parse_day(REFERENCE_DAY)?;
        Ok(Self {
            shift: Utc::now().date_naive() - reference,
        })
    }

    fn at(&self, day: &str) -> Result<DateTime<Utc>> {
        let date = parse_day(day)? + self.shift;
        date.and_hms_opt(12, 0, 0)
            .map(|dt| dt.and_utc())
            .ok_or_else(|| Error::Database(format!("invalid seed time for {day}")))
    }
}

fn parse_day(day: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| Error::Database(format!("invalid seed date '{day}': {e}")))
}

impl AccountStore {
    /// Replace all data with the demo account: six orders, three active
    /// plans, twelve payments (one failed) and a pending refund on the Nike
    /// order.
    pub fn seed_demo(&mut self) -> Result<()> {
        let calendar = Calendar::anchored_today()?;
        let now = Utc::now();

        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        tx.execute_batch(
            "DELETE FROM payments;
             DELETE FROM refund_requests;
             DELETE FROM installment_plans;
             DELETE FROM orders;
             DELETE FROM users;",
        )
        .map_err(|e| Error::Database(format!("failed to clear demo data: {e}")))?;

        tx.execute(
            "INSERT INTO users (id, email, name, credit_limit, available_credit, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                DEMO_ACCOUNT_ID,
                "alex.johnson@email.com",
                "Alex Johnson",
                Money::from_cents(500_000),
                Money::from_cents(284_750),
                timestamp(now),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to seed user: {e}")))?;

        for order in ORDERS {
            tx.execute(
                "INSERT INTO orders (id, user_id, merchant_name, merchant_category, total_amount, status, order_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    order.id,
                    DEMO_ACCOUNT_ID,
                    order.merchant,
                    order.category,
                    Money::from_cents(order.total_cents),
                    order.status,
                    timestamp(calendar.at(order.date)?),
                ],
            )
            .map_err(|e| Error::Database(format!("failed to seed order {}: {e}", order.id)))?;
        }

        for plan in PLANS {
            let created = ORDERS
                .iter()
                .find(|o| o.id == plan.order_id)
                .map(|o| o.date)
                .unwrap_or(REFERENCE_DAY);
            tx.execute(
                "INSERT INTO installment_plans
                    (id, user_id, order_id, total_amount, number_of_payments, remaining_amount, next_payment_date, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 4, ?5, ?6, ?7, ?8)",
                params![
                    plan.id,
                    DEMO_ACCOUNT_ID,
                    plan.order_id,
                    Money::from_cents(plan.total_cents),
                    Money::from_cents(plan.remaining_cents),
                    timestamp(calendar.at(plan.next_payment)?),
                    PlanStatus::Active,
                    timestamp(calendar.at(created)?),
                ],
            )
            .map_err(|e| Error::Database(format!("failed to seed plan {}: {e}", plan.id)))?;
        }

        for payment in PAYMENTS {
            let due = calendar.at(payment.due)?;
            let paid = (payment.status == PaymentStatus::Paid).then(|| timestamp(due));
            tx.execute(
                "INSERT INTO payments (id, user_id, plan_id, amount, due_date, paid_date, status, failure_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    payment.id,
                    DEMO_ACCOUNT_ID,
                    payment.plan_id,
                    Money::from_cents(payment.amount_cents),
                    timestamp(due),
                    paid,
                    payment.status,
                    payment.failure_reason,
                ],
            )
            .map_err(|e| Error::Database(format!("failed to seed payment {}: {e}", payment.id)))?;
        }

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit demo data: {e}")))?;

        self.insert_refund(&RefundRequest {
            id: "refund_001".to_string(),
            user_id: DEMO_ACCOUNT_ID.to_string(),
            order_id: "order_002".to_string(),
            reason: "Item did not fit as expected".to_string(),
            amount: Money::from_cents(24_500),
            status: RefundStatus::Pending,
            created_at: now,
        })?;

        info!(
            orders = ORDERS.len(),
            plans = PLANS.len(),
            payments = PAYMENTS.len(),
            "seeded demo account {DEMO_ACCOUNT_ID}"
        );
        Ok(())
    }

    /// Seed only when the demo account does not exist yet.
    pub fn seed_if_empty(&mut self) -> Result<bool> {
        if self.has_account(DEMO_ACCOUNT_ID)? {
            return Ok(false);
        }
        self.seed_demo()?;
        Ok(true)
    }
}
