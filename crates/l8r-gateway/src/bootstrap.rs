//! Wires configuration into a ready runtime: store, tools, provider, prompt
//! and tracing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use l8r_agents::{
    ChatRuntime, DEFAULT_PROMPT, HttpPromptSource, LlmProvider, OpenAiProvider, PromptCache,
    SpanManager, ToolExecutor, ToolRegistry,
};
use l8r_common::{AccountId, Error, Result};
use l8r_config::AppConfig;
use l8r_config::loader::{default_db_path, default_trace_db_path};
use l8r_db::{AccountStore, SqliteSpanStore};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::state::{AppState, SharedState};

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn db_path(config: &AppConfig) -> PathBuf {
    config.database.path.clone().unwrap_or_else(default_db_path)
}

/// Open the account store, seeding the demo account when configured to.
pub fn open_store(config: &AppConfig) -> Result<AccountStore> {
    let path = db_path(config);
    ensure_parent(&path)?;
    let mut store =
        AccountStore::open(&path)?.with_retry_success_rate(config.database.retry_success_rate);
    if config.database.seed_if_empty && store.seed_if_empty()? {
        info!("seeded demo account into {}", path.display());
    }
    Ok(store)
}

pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn LlmProvider>> {
    let llm = &config.llm;
    match llm.provider.as_str() {
        "openai" => {
            let api_key = llm
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| Error::Config("OPENAI_API_KEY is not set".to_string()))?;
            Ok(Arc::new(OpenAiProvider::new(api_key, llm.base_url.clone())))
        }
        other => Err(Error::Config(format!("unsupported llm provider '{other}'"))),
    }
}

/// Inline prompt wins, then the remote source, then the built-in default.
pub fn build_prompt_cache(config: &AppConfig) -> PromptCache {
    let agent = &config.agent;
    if let Some(prompt) = agent.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        return PromptCache::fixed(prompt);
    }
    match agent.prompt_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => PromptCache::new(Arc::new(HttpPromptSource::new(url))),
        None => PromptCache::fixed(DEFAULT_PROMPT),
    }
}

/// A span store that cannot be opened disables tracing instead of failing
/// startup.
pub fn build_span_manager(config: &AppConfig) -> SpanManager {
    let tracing = &config.tracing;
    if !tracing.enabled {
        return SpanManager::disabled();
    }
    let path = tracing.path.clone().unwrap_or_else(default_trace_db_path);
    let opened = ensure_parent(&path)
        .and_then(|()| SqliteSpanStore::open(&path, tracing.project_name.clone()));
    match opened {
        Ok(store) => SpanManager::new(Arc::new(store)),
        Err(e) => {
            warn!("conversation tracing disabled: {e}");
            SpanManager::disabled()
        }
    }
}

pub fn build_runtime(
    config: &AppConfig,
    provider: Arc<dyn LlmProvider>,
    store: Arc<Mutex<AccountStore>>,
) -> Result<ChatRuntime> {
    let registry = ToolRegistry::account_tools(store)?;
    let account_id = AccountId::new(config.agent.account_id.clone());
    let mut runtime = ChatRuntime::new(provider, ToolExecutor::new(Arc::new(registry)), account_id);
    runtime.set_model(config.llm.model.clone());
    runtime.set_max_tokens(config.llm.max_tokens);
    runtime.set_temperature(config.llm.temperature);
    runtime.set_max_tool_rounds(config.agent.max_tool_rounds);
    runtime.set_prompt_cache(Arc::new(build_prompt_cache(config)));
    runtime.set_span_manager(build_span_manager(config));
    Ok(runtime)
}

/// Everything the gateway needs, built from config.
pub fn build_state(config: AppConfig) -> Result<SharedState> {
    let store = Arc::new(Mutex::new(open_store(&config)?));
    let provider = build_provider(&config)?;
    let runtime = build_runtime(&config, provider, Arc::clone(&store))?;
    info!(
        model = runtime.model(),
        account = %config.agent.account_id,
        "runtime ready"
    );
    Ok(Arc::new(AppState::new(config, runtime, store)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inline_prompt_takes_precedence() {
        let mut config = AppConfig::default();
        config.agent.system_prompt = Some("inline".into());
        config.agent.prompt_url = Some("http://127.0.0.1:9/prompt".into());
        assert_eq!(build_prompt_cache(&config).get().await, "inline");
    }

    #[tokio::test]
    async fn no_prompt_configured_uses_default() {
        let config = AppConfig::default();
        assert_eq!(build_prompt_cache(&config).get().await, DEFAULT_PROMPT);
    }

    #[test]
    fn provider_requires_an_api_key() {
        let config = AppConfig::default();
        assert!(matches!(build_provider(&config), Err(Error::Config(_))));

        let mut unknown = AppConfig::default();
        unknown.llm.provider = "mystery".into();
        unknown.llm.api_key = Some("k".into());
        assert!(build_provider(&unknown).is_err());
    }

    #[test]
    fn store_is_seeded_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.database.path = Some(dir.path().join("nested").join("l8r.db"));

        let store = open_store(&config).unwrap();
        assert!(store.has_account("user_demo_001").unwrap());
    }

    #[test]
    fn disabled_tracing_needs_no_database() {
        let mut config = AppConfig::default();
        config.tracing.enabled = false;
        config.tracing.path = Some(PathBuf::from("/nonexistent/dir/traces.db"));
        let _ = build_span_manager(&config);
    }
}
