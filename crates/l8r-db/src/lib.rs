pub mod account_store;
pub mod model;
pub mod money;
pub mod seed;
pub mod span_store;

pub use account_store::{AccountStore, OrderFilters, PaymentFilters, PlanFilters, RefundFilters};
pub use model::{
    OrderStatus, PaymentStatus, PlanAction, PlanStatus, RefundStatus,
};
pub use money::Money;
pub use span_store::{SpanRecord, SqliteSpanStore};
