use std::sync::Arc;

use l8r_agents::ChatRuntime;
use l8r_common::AccountId;
use l8r_config::AppConfig;
use l8r_db::AccountStore;
use tokio::sync::Mutex;

/// Shared gateway state accessible from all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub runtime: Arc<ChatRuntime>,
    /// The same store the account tools hold, so REST and chat see one view.
    pub store: Arc<Mutex<AccountStore>>,
    pub account_id: AccountId,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: AppConfig, runtime: ChatRuntime, store: Arc<Mutex<AccountStore>>) -> Self {
        let account_id = AccountId::new(config.agent.account_id.clone());
        Self {
            config,
            runtime: Arc::new(runtime),
            store,
            account_id,
        }
    }

    pub fn expose_error_details(&self) -> bool {
        self.config.gateway.expose_error_details
    }
}
