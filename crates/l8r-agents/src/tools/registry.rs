use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use l8r_common::{Error, Result};
use l8r_db::AccountStore;
use tokio::sync::Mutex;
use tracing::info;

use super::Tool;
use super::account;
use crate::providers::ToolDefinition;

/// The fixed tool catalog, in the order it is presented to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolName {
    GetAccountBalance,
    GetOrders,
    GetOrderDetails,
    GetInstallmentPlans,
    GetPlanDetails,
    GetPaymentHistory,
    GetPaymentDetails,
    RetryPayment,
    ModifyPlan,
    RequestRefund,
}

impl ToolName {
    pub const ALL: [ToolName; 10] = [
        Self::GetAccountBalance,
        Self::GetOrders,
        Self::GetOrderDetails,
        Self::GetInstallmentPlans,
        Self::GetPlanDetails,
        Self::GetPaymentHistory,
        Self::GetPaymentDetails,
        Self::RetryPayment,
        Self::ModifyPlan,
        Self::RequestRefund,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetAccountBalance => "get_account_balance",
            Self::GetOrders => "get_orders",
            Self::GetOrderDetails => "get_order_details",
            Self::GetInstallmentPlans => "get_installment_plans",
            Self::GetPlanDetails => "get_plan_details",
            Self::GetPaymentHistory => "get_payment_history",
            Self::GetPaymentDetails => "get_payment_details",
            Self::RetryPayment => "retry_payment",
            Self::ModifyPlan => "modify_plan",
            Self::RequestRefund => "request_refund",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::Tool(format!("Unknown tool: {s}")))
    }
}

/// Immutable mapping from every catalog name to its handler.
///
/// Construction fails unless the handlers cover the catalog exactly once, so
/// a missing or stray tool is caught at startup rather than mid-conversation.
pub struct ToolRegistry {
    tools: BTreeMap<ToolName, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(handlers: Vec<Box<dyn Tool>>) -> Result<Self> {
        let mut tools = BTreeMap::new();
        for tool in handlers {
            let name: ToolName = tool.name().parse().map_err(|_| {
                Error::Config(format!("tool '{}' is not in the catalog", tool.name()))
            })?;
            if tools.insert(name, tool).is_some() {
                return Err(Error::Config(format!("tool '{name}' registered twice")));
            }
        }

        let missing: Vec<&str> = ToolName::ALL
            .into_iter()
            .filter(|name| !tools.contains_key(name))
            .map(ToolName::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing handlers for tools: {}",
                missing.join(", ")
            )));
        }

        info!("registered {} tools", tools.len());
        Ok(Self { tools })
    }

    /// The catalog backed by the account store.
    pub fn account_tools(store: Arc<Mutex<AccountStore>>) -> Result<Self> {
        Self::new(account::all(store))
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub fn get(&self, name: ToolName) -> Option<&dyn Tool> {
        self.tools.get(&name).map(|tool| tool.as_ref())
    }

    pub fn lookup(&self, name: &str) -> Option<&dyn Tool> {
        name.parse().ok().and_then(|name| self.get(name))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
