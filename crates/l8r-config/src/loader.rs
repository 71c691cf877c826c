use l8r_common::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::model::AppConfig;

const CONFIG_DIR_NAME: &str = ".l8r";
const CONFIG_FILE_NAME: &str = "config.yml";

/// Loads `AppConfig` from YAML, `.env`, and process environment, in that order
/// of increasing precedence.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            path: config_dir().join(CONFIG_FILE_NAME),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AppConfig> {
        if let Ok(env_path) = dotenvy::dotenv() {
            debug!("loaded environment from {}", env_path.display());
        }

        let mut config = self.load_file()?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_file(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            info!(
                "no config file at {}, using defaults",
                self.path.display()
            );
            return Ok(AppConfig::default());
        }

        let raw = std::fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(AppConfig::default());
        }
        let config: AppConfig = serde_yaml::from_str(&raw).map_err(|e| {
            Error::Config(format!("failed to parse {}: {e}", self.path.display()))
        })?;
        info!("loaded config from {}", self.path.display());
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// `~/.l8r`, or `./.l8r` when no home directory can be resolved.
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(CONFIG_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR_NAME))
}

pub fn default_db_path() -> PathBuf {
    config_dir().join("l8r.db")
}

pub fn default_trace_db_path() -> PathBuf {
    config_dir().join("traces.db")
}

/// Overlay environment variables onto a loaded config. `lookup` is injected so
/// tests do not have to mutate the process environment.
pub fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(key) = non_empty("OPENAI_API_KEY") {
        config.llm.api_key = Some(key);
    }
    if let Some(url) = non_empty("OPENAI_BASE_URL") {
        config.llm.base_url = Some(url);
    }
    if let Some(model) = non_empty("L8R_MODEL") {
        config.llm.model = model;
    }
    if let Some(port) = non_empty("L8R_PORT") {
        match port.trim().parse::<u16>() {
            Ok(port) => config.gateway.port = port,
            Err(_) => warn!("ignoring invalid L8R_PORT value '{port}'"),
        }
    }
    if let Some(path) = non_empty("L8R_DB_PATH") {
        config.database.path = Some(PathBuf::from(path));
    }
    if let Some(url) = non_empty("L8R_PROMPT_URL") {
        config.agent.prompt_url = Some(url);
    }
    if let Some(env) = non_empty("L8R_ENV") {
        config.gateway.expose_error_details = !env.eq_ignore_ascii_case("production");
    }
}
