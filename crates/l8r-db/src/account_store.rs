use chrono::{DateTime, SecondsFormat, Utc};
use l8r_common::{Error, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::model::*;
use crate::money::Money;

const DEFAULT_LIST_LIMIT: usize = 50;
const REFUND_WINDOW_DAYS: i64 = 30;

const ORDER_COLUMNS: &str =
    "o.id, o.user_id, o.merchant_name, o.merchant_category, o.total_amount, o.status, o.order_date";
const ORDER_REF_COLUMNS: &str = "o.id, o.merchant_name, o.merchant_category";
const PLAN_COLUMNS: &str = "p.id, p.user_id, p.order_id, p.total_amount, p.number_of_payments, \
     p.remaining_amount, p.next_payment_date, p.status, p.created_at";
const PAYMENT_COLUMNS: &str = "pay.id, pay.user_id, pay.plan_id, pay.amount, pay.due_date, \
     pay.paid_date, pay.status, pay.failure_reason";
const REFUND_COLUMNS: &str =
    "r.id, r.user_id, r.order_id, r.reason, r.amount, r.status, r.created_at";

#[derive(Debug, Clone, Default)]
pub struct OrderFilters {
    pub status: Option<String>,
    pub merchant_category: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanFilters {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PaymentFilters {
    pub status: Option<String>,
    pub plan_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RefundFilters {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// Persistent store for the BNPL account: orders, installment plans,
/// payments and refund requests. Every query is scoped to one account id.
pub struct AccountStore {
    pub(crate) conn: Connection,
    retry_success_rate: f64,
}

impl AccountStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening account store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn,
            retry_success_rate: 0.9,
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn,
            retry_success_rate: 0.9,
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Probability in `[0, 1]` that a simulated payment retry succeeds.
    pub fn with_retry_success_rate(mut self, rate: f64) -> Self {
        self.retry_success_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    credit_limit INTEGER NOT NULL,
                    available_credit INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS orders (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    merchant_name TEXT NOT NULL,
                    merchant_category TEXT NOT NULL,
                    total_amount INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    order_date TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_orders_user_date
                    ON orders(user_id, order_date);

                CREATE TABLE IF NOT EXISTS installment_plans (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    order_id TEXT NOT NULL UNIQUE REFERENCES orders(id) ON DELETE CASCADE,
                    total_amount INTEGER NOT NULL,
                    number_of_payments INTEGER NOT NULL,
                    remaining_amount INTEGER NOT NULL,
                    next_payment_date TEXT,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS payments (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    plan_id TEXT NOT NULL REFERENCES installment_plans(id) ON DELETE CASCADE,
                    amount INTEGER NOT NULL,
                    due_date TEXT NOT NULL,
                    paid_date TEXT,
                    status TEXT NOT NULL,
                    failure_reason TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_payments_plan_due
                    ON payments(plan_id, due_date);

                CREATE TABLE IF NOT EXISTS refund_requests (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                    reason TEXT NOT NULL,
                    amount INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn has_account(&self, account: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE id = ?1",
                params![account],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to look up account: {e}")))?;
        Ok(count > 0)
    }

    // -- account ---------------------------------------------------------

    pub fn account_balance(&self, account: &str) -> Result<AccountBalance> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, credit_limit, available_credit FROM users WHERE id = ?1",
                params![account],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Money>(2)?,
                        row.get::<_, Money>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load account: {e}")))?;

        let Some((user_id, name, credit_limit, available_credit)) = row else {
            return Err(Error::NotFound("User not found".to_string()));
        };

        let used_credit = credit_limit - available_credit;
        let utilization_percent = if credit_limit.is_positive() {
            (used_credit.cents() as f64 / credit_limit.cents() as f64 * 100.0).round() as i64
        } else {
            0
        };

        Ok(AccountBalance {
            user_id,
            name,
            credit_limit,
            available_credit,
            used_credit,
            utilization_percent,
        })
    }

    // -- orders ----------------------------------------------------------

    pub fn orders(&self, account: &str, filters: &OrderFilters) -> Result<Vec<OrderListItem>> {
        let mut query = Query::new(
            format!("SELECT {ORDER_COLUMNS} FROM orders o WHERE o.user_id = ?1"),
            account,
        );
        if let Some(status) = &filters.status {
            query.and("o.status =", status.clone());
        }
        if let Some(category) = &filters.merchant_category {
            query.and("o.merchant_category =", category.clone());
        }
        if let Some(start) = filters.start_date {
            query.and("o.order_date >=", timestamp(start));
        }
        if let Some(end) = filters.end_date {
            query.and("o.order_date <=", timestamp(end));
        }
        query.finish(
            "ORDER BY o.order_date DESC",
            filters.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        );

        let orders = self.select(&query, |row| order_at(row, 0), "orders")?;
        orders
            .into_iter()
            .map(|order| {
                let installment_plan = self.plan_brief_for_order(&order.id)?;
                Ok(OrderListItem {
                    order,
                    installment_plan,
                })
            })
            .collect()
    }

    pub fn order(&self, account: &str, order_id: &str) -> Result<OrderDetails> {
        let order = self
            .find_order(account, order_id)?
            .ok_or_else(|| Error::NotFound("Order not found".to_string()))?;

        let installment_plan = match self.find_plan_for_order(&order.id)? {
            Some(plan) => {
                let payments = self.plan_payments(&plan.id)?;
                Some(PlanWithPayments { plan, payments })
            }
            None => None,
        };

        let mut query = Query::new(
            format!("SELECT {REFUND_COLUMNS} FROM refund_requests r WHERE r.user_id = ?1"),
            account,
        );
        query.and("r.order_id =", order.id.clone());
        query.order_by("ORDER BY r.created_at DESC");
        let refund_requests = self.select(&query, |row| refund_at(row, 0), "refund requests")?;

        Ok(OrderDetails {
            order,
            installment_plan,
            refund_requests,
        })
    }

    pub fn recent_orders(&self, account: &str, limit: usize) -> Result<Vec<OrderListItem>> {
        self.orders(
            account,
            &OrderFilters {
                limit: Some(limit),
                ..OrderFilters::default()
            },
        )
    }

    pub fn order_stats(&self, account: &str) -> Result<OrderStats> {
        let query = Query::new(
            format!("SELECT {ORDER_COLUMNS} FROM orders o WHERE o.user_id = ?1"),
            account,
        );
        let orders = self.select(&query, |row| order_at(row, 0), "orders")?;

        let total_spent: Money = orders.iter().map(|o| o.total_amount).sum();
        let order_count = orders.len();
        let average_order_value = if order_count > 0 {
            Money::from_dollars(total_spent.dollars() / order_count as f64)
        } else {
            Money::ZERO
        };
        let mut by_category: BTreeMap<String, Money> = BTreeMap::new();
        for order in &orders {
            let entry = by_category
                .entry(order.merchant_category.clone())
                .or_default();
            *entry = *entry + order.total_amount;
        }

        Ok(OrderStats {
            total_spent,
            order_count,
            average_order_value,
            by_category,
        })
    }

    // -- installment plans -----------------------------------------------

    pub fn plans(&self, account: &str, filters: &PlanFilters) -> Result<Vec<PlanListItem>> {
        let mut query = Query::new(
            format!(
                "SELECT {PLAN_COLUMNS}, {ORDER_REF_COLUMNS} FROM installment_plans p \
                 JOIN orders o ON o.id = p.order_id WHERE p.user_id = ?1"
            ),
            account,
        );
        if let Some(status) = &filters.status {
            query.and("p.status =", status.clone());
        }
        query.finish(
            "ORDER BY p.created_at DESC",
            filters.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        );

        let rows = self.select(
            &query,
            |row| Ok((plan_at(row, 0)?, order_ref_at(row, 9)?)),
            "installment plans",
        )?;
        rows.into_iter()
            .map(|(plan, order)| {
                let payments = self.plan_payments(&plan.id)?;
                Ok(PlanListItem {
                    plan,
                    order,
                    payments,
                })
            })
            .collect()
    }

    pub fn plan(&self, account: &str, plan_id: &str) -> Result<PlanDetails> {
        let plan = self
            .find_plan(account, plan_id)?
            .ok_or_else(|| Error::NotFound("Installment plan not found".to_string()))?;
        let order = self
            .find_order(account, &plan.order_id)?
            .ok_or_else(|| Error::NotFound("Order not found".to_string()))?;
        let payments = self.plan_payments(&plan.id)?;

        let by_status = |wanted: fn(PaymentStatus) -> bool| -> Vec<Payment> {
            payments
                .iter()
                .filter(|p| wanted(p.status))
                .cloned()
                .collect()
        };
        let paid_payments = by_status(|s| s == PaymentStatus::Paid);
        let upcoming_payments = by_status(PaymentStatus::is_upcoming);
        let failed_payments = by_status(|s| s == PaymentStatus::Failed);

        let percent_complete = if plan.number_of_payments > 0 {
            (paid_payments.len() as f64 / plan.number_of_payments as f64 * 100.0).round() as i64
        } else {
            0
        };
        let progress = PlanProgress {
            paid: paid_payments.len(),
            total: plan.number_of_payments,
            percent_complete,
        };

        Ok(PlanDetails {
            plan,
            order,
            payments,
            progress,
            paid_payments,
            upcoming_payments,
            failed_payments,
        })
    }

    /// Active plans soonest-due first, each carrying only its next upcoming
    /// payment.
    pub fn active_plans(&self, account: &str) -> Result<Vec<PlanListItem>> {
        let mut query = Query::new(
            format!(
                "SELECT {PLAN_COLUMNS}, {ORDER_REF_COLUMNS} FROM installment_plans p \
                 JOIN orders o ON o.id = p.order_id WHERE p.user_id = ?1"
            ),
            account,
        );
        query.and("p.status =", PlanStatus::Active.as_str().to_string());
        query.order_by("ORDER BY p.next_payment_date ASC");

        let rows = self.select(
            &query,
            |row| Ok((plan_at(row, 0)?, order_ref_at(row, 9)?)),
            "active plans",
        )?;
        rows.into_iter()
            .map(|(plan, order)| {
                let payments = self.next_upcoming_payment(&plan.id)?.into_iter().collect();
                Ok(PlanListItem {
                    plan,
                    order,
                    payments,
                })
            })
            .collect()
    }

    pub fn modify_plan(
        &mut self,
        account: &str,
        plan_id: &str,
        action: PlanAction,
        new_date: Option<DateTime<Utc>>,
    ) -> Result<ModifiedPlan> {
        let plan = self
            .find_plan(account, plan_id)?
            .ok_or_else(|| Error::NotFound("Installment plan not found".to_string()))?;

        match action {
            PlanAction::Pause => {
                if plan.status != PlanStatus::Active {
                    return Err(Error::Tool("Can only pause active plans".to_string()));
                }
                self.set_plan_status(&plan.id, PlanStatus::Paused)?;
            }
            PlanAction::Resume => {
                if plan.status != PlanStatus::Paused {
                    return Err(Error::Tool("Can only resume paused plans".to_string()));
                }
                self.set_plan_status(&plan.id, PlanStatus::Active)?;
            }
            PlanAction::Reschedule => {
                let Some(new_date) = new_date else {
                    return Err(Error::Tool(
                        "New date is required for rescheduling".to_string(),
                    ));
                };
                if plan.status != PlanStatus::Active {
                    return Err(Error::Tool("Can only reschedule active plans".to_string()));
                }
                self.reschedule_plan(&plan.id, new_date)?;
            }
        }
        info!(plan_id = %plan.id, action = %action, "installment plan modified");

        let plan = self
            .find_plan(account, plan_id)?
            .ok_or_else(|| Error::NotFound("Installment plan not found".to_string()))?;
        let merchant_name = self
            .find_order(account, &plan.order_id)?
            .map(|o| o.merchant_name)
            .unwrap_or_default();
        Ok(ModifiedPlan {
            plan,
            merchant_name,
        })
    }

    pub fn plan_summary(&self, account: &str) -> Result<PlanSummary> {
        let query = Query::new(
            format!("SELECT {PLAN_COLUMNS} FROM installment_plans p WHERE p.user_id = ?1"),
            account,
        );
        let plans = self.select(&query, |row| plan_at(row, 0), "installment plans")?;

        let active: Vec<&InstallmentPlan> = plans
            .iter()
            .filter(|p| p.status == PlanStatus::Active)
            .collect();
        let total_owed: Money = active.iter().map(|p| p.remaining_amount).sum();
        let total_original: Money = plans.iter().map(|p| p.total_amount).sum();

        Ok(PlanSummary {
            total_plans: plans.len(),
            active_plans: active.len(),
            total_owed,
            total_original,
            paid_off: total_original - total_owed,
        })
    }

    // -- payments --------------------------------------------------------

    pub fn payments(&self, account: &str, filters: &PaymentFilters) -> Result<Vec<PaymentListItem>> {
        let mut query = Self::payment_listing(account);
        if let Some(status) = &filters.status {
            query.and("pay.status =", status.clone());
        }
        if let Some(plan_id) = &filters.plan_id {
            query.and("pay.plan_id =", plan_id.clone());
        }
        if let Some(start) = filters.start_date {
            query.and("pay.due_date >=", timestamp(start));
        }
        if let Some(end) = filters.end_date {
            query.and("pay.due_date <=", timestamp(end));
        }
        query.finish(
            "ORDER BY pay.due_date ASC",
            filters.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        );
        self.select(&query, payment_item_at, "payments")
    }

    pub fn payment(&self, account: &str, payment_id: &str) -> Result<PaymentDetails> {
        let payment = self
            .find_payment(account, payment_id)?
            .ok_or_else(|| Error::NotFound("Payment not found".to_string()))?;
        let plan = self
            .find_plan(account, &payment.plan_id)?
            .ok_or_else(|| Error::NotFound("Installment plan not found".to_string()))?;
        let order = self
            .find_order(account, &plan.order_id)?
            .ok_or_else(|| Error::NotFound("Order not found".to_string()))?;
        Ok(PaymentDetails {
            payment,
            plan,
            order,
        })
    }

    pub fn upcoming_payments(&self, account: &str, limit: usize) -> Result<Vec<PaymentListItem>> {
        let mut query = Self::payment_listing(account);
        query.raw("pay.status IN ('scheduled', 'pending')");
        query.and("pay.due_date >=", timestamp(Utc::now()));
        query.finish("ORDER BY pay.due_date ASC", limit);
        self.select(&query, payment_item_at, "upcoming payments")
    }

    pub fn failed_payments(&self, account: &str) -> Result<Vec<PaymentListItem>> {
        let mut query = Self::payment_listing(account);
        query.and("pay.status =", PaymentStatus::Failed.as_str().to_string());
        query.order_by("ORDER BY pay.due_date DESC");
        self.select(&query, payment_item_at, "failed payments")
    }

    pub fn payment_history(&self, account: &str, limit: usize) -> Result<Vec<PaymentListItem>> {
        let mut query = Self::payment_listing(account);
        query.and("pay.status =", PaymentStatus::Paid.as_str().to_string());
        query.finish("ORDER BY pay.paid_date DESC", limit);
        self.select(&query, payment_item_at, "payment history")
    }

    /// Simulated processor retry of a failed payment. A successful retry
    /// marks the payment paid and reduces the plan's remaining balance.
    pub fn retry_payment(&mut self, account: &str, payment_id: &str) -> Result<RetryOutcome> {
        let payment = self
            .find_payment(account, payment_id)?
            .ok_or_else(|| Error::NotFound("Payment not found".to_string()))?;

        if payment.status != PaymentStatus::Failed {
            return Err(Error::Tool("Can only retry failed payments".to_string()));
        }

        let success =
            self.retry_success_rate >= 1.0 || rand::random::<f64>() < self.retry_success_rate;
        if !success {
            warn!(payment_id = %payment.id, "simulated payment retry declined");
            return Ok(RetryOutcome {
                success: false,
                payment,
                message: "Payment retry failed. Please try again or update your payment method."
                    .to_string(),
            });
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        tx.execute(
            "UPDATE payments SET status = ?1, paid_date = ?2, failure_reason = NULL WHERE id = ?3",
            params![PaymentStatus::Paid, timestamp(Utc::now()), payment.id],
        )
        .map_err(|e| Error::Database(format!("failed to update payment: {e}")))?;
        tx.execute(
            "UPDATE installment_plans SET remaining_amount = remaining_amount - ?1 WHERE id = ?2",
            params![payment.amount, payment.plan_id],
        )
        .map_err(|e| Error::Database(format!("failed to update plan balance: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit retry: {e}")))?;

        info!(payment_id = %payment.id, amount = %payment.amount, "payment retry succeeded");
        let updated = self
            .find_payment(account, payment_id)?
            .ok_or_else(|| Error::NotFound("Payment not found".to_string()))?;
        Ok(RetryOutcome {
            success: true,
            message: format!("Payment of {} was successful", payment.amount),
            payment: updated,
        })
    }

    // -- refunds ---------------------------------------------------------

    pub fn refunds(&self, account: &str, filters: &RefundFilters) -> Result<Vec<RefundListItem>> {
        let mut query = Query::new(
            format!(
                "SELECT {REFUND_COLUMNS}, {ORDER_REF_COLUMNS} FROM refund_requests r \
                 JOIN orders o ON o.id = r.order_id WHERE r.user_id = ?1"
            ),
            account,
        );
        if let Some(status) = &filters.status {
            query.and("r.status =", status.clone());
        }
        query.finish(
            "ORDER BY r.created_at DESC",
            filters.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        );
        self.select(
            &query,
            |row| {
                Ok(RefundListItem {
                    refund: refund_at(row, 0)?,
                    order: order_ref_at(row, 7)?,
                })
            },
            "refund requests",
        )
    }

    pub fn refund(&self, account: &str, refund_id: &str) -> Result<RefundDetails> {
        let refund = self
            .find_refund(account, refund_id)?
            .ok_or_else(|| Error::NotFound("Refund request not found".to_string()))?;
        let order = self
            .find_order(account, &refund.order_id)?
            .ok_or_else(|| Error::NotFound("Order not found".to_string()))?;
        Ok(RefundDetails { refund, order })
    }

    /// Open a refund request for a recent order. Non-positive or missing
    /// amounts default to the order total.
    pub fn request_refund(
        &mut self,
        account: &str,
        order_id: &str,
        reason: &str,
        amount: Option<Money>,
    ) -> Result<RefundOutcome> {
        let order = self
            .find_order(account, order_id)?
            .ok_or_else(|| Error::NotFound("Order not found".to_string()))?;

        let open_requests: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM refund_requests
                 WHERE order_id = ?1 AND status IN ('pending', 'approved')",
                params![order.id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to check refund requests: {e}")))?;
        if open_requests > 0 {
            return Err(Error::Tool(
                "A refund request already exists for this order".to_string(),
            ));
        }

        let days_since_order = (Utc::now() - order.order_date).num_days();
        if days_since_order > REFUND_WINDOW_DAYS {
            return Err(Error::Tool(
                "Orders older than 30 days are not eligible for refunds. Please contact support for assistance."
                    .to_string(),
            ));
        }

        let amount = amount
            .filter(|a| a.is_positive())
            .unwrap_or(order.total_amount);
        let refund = RefundRequest {
            id: format!("refund_{}", uuid::Uuid::new_v4().simple()),
            user_id: account.to_string(),
            order_id: order.id.clone(),
            reason: reason.to_string(),
            amount,
            status: RefundStatus::Pending,
            created_at: Utc::now(),
        };
        self.insert_refund(&refund)?;
        info!(refund_id = %refund.id, order_id = %order.id, "refund requested");

        Ok(RefundOutcome {
            message: format!(
                "Refund request for {amount} has been submitted. You will receive an update within 3-5 business days."
            ),
            refund,
        })
    }

    /// Withdraw a pending refund request. Returns the deleted row.
    pub fn cancel_refund(&mut self, account: &str, refund_id: &str) -> Result<RefundRequest> {
        let refund = self
            .find_refund(account, refund_id)?
            .ok_or_else(|| Error::NotFound("Refund request not found".to_string()))?;
        if refund.status != RefundStatus::Pending {
            return Err(Error::Tool(
                "Can only cancel pending refund requests".to_string(),
            ));
        }
        self.conn
            .execute(
                "DELETE FROM refund_requests WHERE id = ?1",
                params![refund.id],
            )
            .map_err(|e| Error::Database(format!("failed to delete refund request: {e}")))?;
        Ok(refund)
    }

    pub fn refund_summary(&self, account: &str) -> Result<RefundSummary> {
        let query = Query::new(
            format!("SELECT {REFUND_COLUMNS} FROM refund_requests r WHERE r.user_id = ?1"),
            account,
        );
        let refunds = self.select(&query, |row| refund_at(row, 0), "refund requests")?;

        let with_status = |status: RefundStatus| refunds.iter().filter(move |r| r.status == status);
        Ok(RefundSummary {
            total_requests: refunds.len(),
            pending_count: with_status(RefundStatus::Pending).count(),
            pending_amount: with_status(RefundStatus::Pending).map(|r| r.amount).sum(),
            approved_count: with_status(RefundStatus::Approved).count(),
            processed_count: with_status(RefundStatus::Processed).count(),
            total_refunded: with_status(RefundStatus::Processed).map(|r| r.amount).sum(),
        })
    }

    // -- dashboard -------------------------------------------------------

    pub fn dashboard(&self, account: &str) -> Result<Dashboard> {
        let balance = self.account_balance(account)?;
        let recent_orders = self.recent_orders(account, 5)?;
        let upcoming_payments = self.upcoming_payments(account, 5)?;
        let failed_payments = self.failed_payments(account)?;
        let active_plans = self.active_plans(account)?;

        let alerts = DashboardAlerts {
            has_failed_payments: !failed_payments.is_empty(),
            failed_payment_count: failed_payments.len(),
            next_payment_due: upcoming_payments.first().map(|p| p.payment.due_date),
        };
        debug!(account, failed = alerts.failed_payment_count, "dashboard assembled");

        Ok(Dashboard {
            balance,
            recent_orders,
            upcoming_payments,
            failed_payments,
            active_plans,
            alerts,
        })
    }

    // -- internals -------------------------------------------------------

    fn payment_listing(account: &str) -> Query {
        Query::new(
            format!(
                "SELECT {PAYMENT_COLUMNS}, {ORDER_REF_COLUMNS} FROM payments pay \
                 JOIN installment_plans p ON p.id = pay.plan_id \
                 JOIN orders o ON o.id = p.order_id WHERE pay.user_id = ?1"
            ),
            account,
        )
    }

    fn select<T>(
        &self,
        query: &Query,
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
        what: &str,
    ) -> Result<Vec<T>> {
        let mut stmt = self
            .conn
            .prepare(&query.sql)
            .map_err(|e| Error::Database(format!("failed to prepare {what} query: {e}")))?;
        let rows = stmt
            .query_map(params_from_iter(query.args.iter()), map)
            .map_err(|e| Error::Database(format!("failed to query {what}: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(|e| Error::Database(format!("failed to read {what}: {e}")))
    }

    fn find_order(&self, account: &str, order_id: &str) -> Result<Option<Order>> {
        self.conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders o WHERE o.id = ?1 AND o.user_id = ?2"),
                params![order_id, account],
                |row| order_at(row, 0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load order: {e}")))
    }

    fn find_plan(&self, account: &str, plan_id: &str) -> Result<Option<InstallmentPlan>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {PLAN_COLUMNS} FROM installment_plans p WHERE p.id = ?1 AND p.user_id = ?2"
                ),
                params![plan_id, account],
                |row| plan_at(row, 0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load installment plan: {e}")))
    }

    fn find_plan_for_order(&self, order_id: &str) -> Result<Option<InstallmentPlan>> {
        self.conn
            .query_row(
                &format!("SELECT {PLAN_COLUMNS} FROM installment_plans p WHERE p.order_id = ?1"),
                params![order_id],
                |row| plan_at(row, 0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load installment plan: {e}")))
    }

    fn plan_brief_for_order(&self, order_id: &str) -> Result<Option<PlanBrief>> {
        Ok(self.find_plan_for_order(order_id)?.map(|plan| PlanBrief {
            id: plan.id,
            status: plan.status,
            remaining_amount: plan.remaining_amount,
            number_of_payments: plan.number_of_payments,
        }))
    }

    fn find_payment(&self, account: &str, payment_id: &str) -> Result<Option<Payment>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payments pay WHERE pay.id = ?1 AND pay.user_id = ?2"
                ),
                params![payment_id, account],
                |row| payment_at(row, 0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load payment: {e}")))
    }

    fn find_refund(&self, account: &str, refund_id: &str) -> Result<Option<RefundRequest>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {REFUND_COLUMNS} FROM refund_requests r WHERE r.id = ?1 AND r.user_id = ?2"
                ),
                params![refund_id, account],
                |row| refund_at(row, 0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load refund request: {e}")))
    }

    fn plan_payments(&self, plan_id: &str) -> Result<Vec<Payment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments pay WHERE pay.plan_id = ?1 ORDER BY pay.due_date ASC"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare payments query: {e}")))?;
        let rows = stmt
            .query_map(params![plan_id], |row| payment_at(row, 0))
            .map_err(|e| Error::Database(format!("failed to query payments: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read payments: {e}")))
    }

    fn next_upcoming_payment(&self, plan_id: &str) -> Result<Option<Payment>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payments pay
                     WHERE pay.plan_id = ?1 AND pay.status IN ('scheduled', 'pending')
                     ORDER BY pay.due_date ASC LIMIT 1"
                ),
                params![plan_id],
                |row| payment_at(row, 0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load next payment: {e}")))
    }

    fn set_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE installment_plans SET status = ?1 WHERE id = ?2",
                params![status, plan_id],
            )
            .map_err(|e| Error::Database(format!("failed to update plan status: {e}")))?;
        Ok(())
    }

    fn reschedule_plan(&mut self, plan_id: &str, new_date: DateTime<Utc>) -> Result<()> {
        let next_payment = self.next_upcoming_payment(plan_id)?;
        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        tx.execute(
            "UPDATE installment_plans SET next_payment_date = ?1 WHERE id = ?2",
            params![timestamp(new_date), plan_id],
        )
        .map_err(|e| Error::Database(format!("failed to reschedule plan: {e}")))?;
        if let Some(payment) = next_payment {
            tx.execute(
                "UPDATE payments SET due_date = ?1 WHERE id = ?2",
                params![timestamp(new_date), payment.id],
            )
            .map_err(|e| Error::Database(format!("failed to reschedule payment: {e}")))?;
        }
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit reschedule: {e}")))
    }

    pub(crate) fn insert_refund(&self, refund: &RefundRequest) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO refund_requests (id, user_id, order_id, reason, amount, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    refund.id,
                    refund.user_id,
                    refund.order_id,
                    refund.reason,
                    refund.amount,
                    refund.status,
                    timestamp(refund.created_at),
                ],
            )
            .map_err(|e| Error::Database(format!("failed to insert refund request: {e}")))?;
        Ok(())
    }
}

/// Incrementally built `SELECT` scoped to an account id bound as `?1`.
struct Query {
    sql: String,
    args: Vec<Value>,
}

impl Query {
    fn new(sql: String, account: &str) -> Self {
        Self {
            sql,
            args: vec![Value::Text(account.to_string())],
        }
    }

    fn and(&mut self, predicate: &str, value: impl Into<Value>) {
        self.args.push(value.into());
        self.sql
            .push_str(&format!(" AND {predicate} ?{}", self.args.len()));
    }

    fn raw(&mut self, predicate: &str) {
        self.sql.push_str(" AND ");
        self.sql.push_str(predicate);
    }

    fn order_by(&mut self, clause: &str) {
        self.sql.push(' ');
        self.sql.push_str(clause);
    }

    fn finish(&mut self, order_by: &str, limit: usize) {
        self.order_by(order_by);
        self.args.push(Value::Integer(limit as i64));
        self.sql.push_str(&format!(" LIMIT ?{}", self.args.len()));
    }
}

/// Fixed-width UTC timestamp so TEXT columns sort chronologically.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("failed to parse timestamp '{value}': {e}, falling back to now");
            Utc::now()
        })
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .map(|raw| parse_timestamp(&raw)))
}

fn order_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(base)?,
        user_id: row.get(base + 1)?,
        merchant_name: row.get(base + 2)?,
        merchant_category: row.get(base + 3)?,
        total_amount: row.get(base + 4)?,
        status: row.get(base + 5)?,
        order_date: parse_timestamp(&row.get::<_, String>(base + 6)?),
    })
}

fn order_ref_at(row: &Row<'_>, base: usize) -> rusqlite::Result<OrderRef> {
    Ok(OrderRef {
        id: row.get(base)?,
        merchant_name: row.get(base + 1)?,
        merchant_category: row.get(base + 2)?,
    })
}

fn plan_at(row: &Row<'_>, base: usize) -> rusqlite::Result<InstallmentPlan> {
    Ok(InstallmentPlan {
        id: row.get(base)?,
        user_id: row.get(base + 1)?,
        order_id: row.get(base + 2)?,
        total_amount: row.get(base + 3)?,
        number_of_payments: row.get(base + 4)?,
        remaining_amount: row.get(base + 5)?,
        next_payment_date: optional_timestamp(row, base + 6)?,
        status: row.get(base + 7)?,
        created_at: parse_timestamp(&row.get::<_, String>(base + 8)?),
    })
}

fn payment_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(base)?,
        user_id: row.get(base + 1)?,
        plan_id: row.get(base + 2)?,
        amount: row.get(base + 3)?,
        due_date: parse_timestamp(&row.get::<_, String>(base + 4)?),
        paid_date: optional_timestamp(row, base + 5)?,
        status: row.get(base + 6)?,
        failure_reason: row.get(base + 7)?,
    })
}

fn payment_item_at(row: &Row<'_>) -> rusqlite::Result<PaymentListItem> {
    Ok(PaymentListItem {
        payment: payment_at(row, 0)?,
        order: order_ref_at(row, 8)?,
    })
}

fn refund_at(row: &Row<'_>, base: usize) -> rusqlite::Result<RefundRequest> {
    Ok(RefundRequest {
        id: row.get(base)?,
        user_id: row.get(base + 1)?,
        order_id: row.get(base + 2)?,
        reason: row.get(base + 3)?,
        amount: row.get(base + 4)?,
        status: row.get(base + 5)?,
        created_at: parse_timestamp(&row.get::<_, String>(base + 6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::DEMO_ACCOUNT_ID;
    use chrono::Duration;

    const ACCOUNT: &str = DEMO_ACCOUNT_ID;

    fn seeded() -> AccountStore {
        let mut store = AccountStore::in_memory().expect("in-memory store should open");
        store.seed_demo().expect("seed should succeed");
        store
    }

    #[test]
    fn balance_reports_used_credit_and_utilization() {
        let store = seeded();
        let balance = store.account_balance(ACCOUNT).unwrap();
        assert_eq!(balance.name, "Alex Johnson");
        assert_eq!(balance.credit_limit, Money::from_cents(500_000));
        assert_eq!(balance.available_credit, Money::from_cents(284_750));
        assert_eq!(balance.used_credit, Money::from_cents(215_250));
        assert_eq!(balance.utilization_percent, 43);
    }

    #[test]
    fn unknown_account_is_not_found() {
        let store = seeded();
        let err = store.account_balance("nobody").unwrap_err();
        assert_eq!(err.to_string(), "User not found");
    }

    #[test]
    fn orders_are_newest_first_and_filterable() {
        let store = seeded();
        let all = store.orders(ACCOUNT, &OrderFilters::default()).unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0].order.id, "order_006");
        assert!(
            all.windows(2)
                .all(|w| w[0].order.order_date >= w[1].order.order_date)
        );

        let electronics = store
            .orders(
                ACCOUNT,
                &OrderFilters {
                    merchant_category: Some("Electronics".to_string()),
                    ..OrderFilters::default()
                },
            )
            .unwrap();
        assert_eq!(electronics.len(), 2);
        assert!(electronics.iter().all(|o| o.installment_plan.is_some()));

        let limited = store
            .orders(
                ACCOUNT,
                &OrderFilters {
                    limit: Some(2),
                    ..OrderFilters::default()
                },
            )
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn order_details_include_plan_payments_and_refunds() {
        let store = seeded();
        let details = store.order(ACCOUNT, "order_003").unwrap();
        let plan = details.installment_plan.expect("IKEA order has a plan");
        assert_eq!(plan.plan.id, "plan_002");
        assert_eq!(plan.payments.len(), 4);
        assert!(
            plan.payments
                .windows(2)
                .all(|w| w[0].due_date <= w[1].due_date)
        );

        let nike = store.order(ACCOUNT, "order_002").unwrap();
        assert_eq!(nike.refund_requests.len(), 1);

        let err = store.order(ACCOUNT, "order_999").unwrap_err();
        assert_eq!(err.to_string(), "Order not found");
    }

    #[test]
    fn order_stats_sum_by_category() {
        let store = seeded();
        let stats = store.order_stats(ACCOUNT).unwrap();
        assert_eq!(stats.order_count, 6);
        assert_eq!(stats.total_spent, Money::from_cents(280_048));
        assert_eq!(
            stats.by_category.get("Electronics"),
            Some(&Money::from_cents(174_899))
        );
    }

    #[test]
    fn plan_details_track_progress() {
        let store = seeded();
        let details = store.plan(ACCOUNT, "plan_001").unwrap();
        assert_eq!(details.progress.paid, 2);
        assert_eq!(details.progress.total, 4);
        assert_eq!(details.progress.percent_complete, 50);
        assert_eq!(details.upcoming_payments.len(), 2);
        assert!(details.failed_payments.is_empty());
        assert_eq!(details.order.merchant_name, "Apple Store");

        let ikea = store.plan(ACCOUNT, "plan_002").unwrap();
        assert_eq!(ikea.failed_payments.len(), 1);
        assert_eq!(ikea.progress.percent_complete, 25);
    }

    #[test]
    fn pause_and_resume_enforce_current_status() {
        let mut store = seeded();
        let paused = store
            .modify_plan(ACCOUNT, "plan_003", PlanAction::Pause, None)
            .unwrap();
        assert_eq!(paused.plan.status, PlanStatus::Paused);
        assert_eq!(paused.merchant_name, "Best Buy");

        let err = store
            .modify_plan(ACCOUNT, "plan_003", PlanAction::Pause, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Can only pause active plans");

        let err = store
            .modify_plan(ACCOUNT, "plan_003", PlanAction::Reschedule, Some(Utc::now()))
            .unwrap_err();
        assert_eq!(err.to_string(), "Can only reschedule active plans");

        let resumed = store
            .modify_plan(ACCOUNT, "plan_003", PlanAction::Resume, None)
            .unwrap();
        assert_eq!(resumed.plan.status, PlanStatus::Active);

        let err = store
            .modify_plan(ACCOUNT, "plan_003", PlanAction::Resume, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Can only resume paused plans");
    }

    #[test]
    fn reschedule_requires_a_date_and_moves_next_payment() {
        let mut store = seeded();
        let err = store
            .modify_plan(ACCOUNT, "plan_001", PlanAction::Reschedule, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "New date is required for rescheduling");

        let new_date = Utc::now() + Duration::days(20);
        let modified = store
            .modify_plan(ACCOUNT, "plan_001", PlanAction::Reschedule, Some(new_date))
            .unwrap();
        let stored = modified.plan.next_payment_date.unwrap();
        assert_eq!(timestamp(stored), timestamp(new_date));

        let payment = store.payment(ACCOUNT, "payment_upcoming_001").unwrap();
        assert_eq!(timestamp(payment.payment.due_date), timestamp(new_date));
    }

    #[test]
    fn plan_summary_counts_owed_on_active_plans() {
        let store = seeded();
        let summary = store.plan_summary(ACCOUNT).unwrap();
        assert_eq!(summary.total_plans, 3);
        assert_eq!(summary.active_plans, 3);
        assert_eq!(summary.total_owed, Money::from_cents(64_950 + 44_213 + 44_999));
        assert_eq!(
            summary.paid_off,
            summary.total_original - summary.total_owed
        );
    }

    #[test]
    fn successful_retry_marks_paid_and_reduces_plan_balance() {
        let mut store = seeded().with_retry_success_rate(1.0);
        let outcome = store.retry_payment(ACCOUNT, "payment_failed_001").unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.payment.status, PaymentStatus::Paid);
        assert!(outcome.payment.paid_date.is_some());
        assert!(outcome.payment.failure_reason.is_none());
        assert_eq!(outcome.message, "Payment of $147.38 was successful");

        let plan = store.plan(ACCOUNT, "plan_002").unwrap();
        assert_eq!(plan.plan.remaining_amount, Money::from_cents(44_213 - 14_738));
        assert!(store.failed_payments(ACCOUNT).unwrap().is_empty());
    }

    #[test]
    fn declined_retry_leaves_payment_failed() {
        let mut store = seeded().with_retry_success_rate(0.0);
        let outcome = store.retry_payment(ACCOUNT, "payment_failed_001").unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.payment.status, PaymentStatus::Failed);
        assert_eq!(store.failed_payments(ACCOUNT).unwrap().len(), 1);
    }

    #[test]
    fn retry_rejects_missing_and_non_failed_payments() {
        let mut store = seeded();
        let err = store.retry_payment(ACCOUNT, "payment_nope").unwrap_err();
        assert_eq!(err.to_string(), "Payment not found");

        let err = store
            .retry_payment(ACCOUNT, "payment_upcoming_001")
            .unwrap_err();
        assert_eq!(err.to_string(), "Can only retry failed payments");
    }

    #[test]
    fn history_lists_paid_payments_newest_first() {
        let store = seeded();
        let history = store.payment_history(ACCOUNT, 20).unwrap();
        assert_eq!(history.len(), 3);
        assert!(
            history
                .iter()
                .all(|p| p.payment.status == PaymentStatus::Paid)
        );
        assert!(
            history
                .windows(2)
                .all(|w| w[0].payment.paid_date >= w[1].payment.paid_date)
        );
    }

    #[test]
    fn upcoming_payments_are_future_and_ascending() {
        let store = seeded();
        let upcoming = store.upcoming_payments(ACCOUNT, 5).unwrap();
        assert_eq!(upcoming.len(), 5);
        let now = Utc::now();
        assert!(upcoming.iter().all(|p| p.payment.due_date >= now));
        assert!(
            upcoming
                .windows(2)
                .all(|w| w[0].payment.due_date <= w[1].payment.due_date)
        );
    }

    #[test]
    fn refund_for_recent_order_defaults_to_order_total() {
        let mut store = seeded();
        let outcome = store
            .request_refund(ACCOUNT, "order_005", "Wrong shade", None)
            .unwrap();
        assert_eq!(outcome.refund.amount, Money::from_cents(12_700));
        assert_eq!(outcome.refund.status, RefundStatus::Pending);
        assert!(outcome.message.starts_with("Refund request for $127.00"));

        let err = store
            .request_refund(ACCOUNT, "order_005", "Again", None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "A refund request already exists for this order"
        );
    }

    #[test]
    fn refund_rejects_old_and_unknown_orders() {
        let mut store = seeded();
        let err = store
            .request_refund(ACCOUNT, "order_001", "Changed my mind", None)
            .unwrap_err();
        assert!(err.to_string().starts_with("Orders older than 30 days"));

        let err = store
            .request_refund(ACCOUNT, "order_404", "?", None)
            .unwrap_err();
        assert_eq!(err.to_string(), "Order not found");
    }

    #[test]
    fn cancel_refund_deletes_pending_request() {
        let mut store = seeded();
        let outcome = store
            .request_refund(ACCOUNT, "order_006", "Late", Some(Money::from_cents(5_000)))
            .unwrap();
        assert_eq!(outcome.refund.amount, Money::from_cents(5_000));

        let cancelled = store.cancel_refund(ACCOUNT, &outcome.refund.id).unwrap();
        assert_eq!(cancelled.id, outcome.refund.id);
        let err = store.refund(ACCOUNT, &outcome.refund.id).unwrap_err();
        assert_eq!(err.to_string(), "Refund request not found");
    }

    #[test]
    fn refund_summary_aggregates_by_status() {
        let store = seeded();
        let summary = store.refund_summary(ACCOUNT).unwrap();
        assert_eq!(summary.total_requests, 1);
        assert_eq!(summary.pending_count, 1);
        assert_eq!(summary.pending_amount, Money::from_cents(24_500));
        assert_eq!(summary.total_refunded, Money::ZERO);
    }

    #[test]
    fn dashboard_flags_failed_payments() {
        let store = seeded();
        let dashboard = store.dashboard(ACCOUNT).unwrap();
        assert!(dashboard.alerts.has_failed_payments);
        assert_eq!(dashboard.alerts.failed_payment_count, 1);
        assert_eq!(dashboard.recent_orders.len(), 5);
        assert_eq!(dashboard.active_plans.len(), 3);
        assert!(dashboard.active_plans.iter().all(|p| p.payments.len() == 1));
        assert_eq!(
            dashboard.alerts.next_payment_due,
            dashboard.upcoming_payments.first().map(|p| p.payment.due_date)
        );
    }
}
