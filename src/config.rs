use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "parley";

const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub save_debounce_ms: u64,
    /// Poll the conversation list on this interval in addition to
    /// change-triggered refreshes. Off when unset.
    pub list_refresh_secs: Option<u64>,
    pub list_limit: u32,
    pub connect_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            model: None,
            provider: None,
            max_tokens: None,
            temperature: None,
            save_debounce_ms: 1000,
            list_refresh_secs: None,
            list_limit: 100,
            connect_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    /// Defaults, then the config file (skipped when it does not exist), then
    /// `PARLEY_API_URL`, `PARLEY_MODEL` and `PARLEY_PROVIDER`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path().context("Could not determine the config directory")?,
        };
        tracing::debug!("Loading config from {}", path.display());

        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Json::file(&path))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .only(&["api_url", "model", "provider"])
                    .map(|key| {
                        if key.as_str().eq_ignore_ascii_case("api_url") {
                            "api_base_url".into()
                        } else {
                            key.into()
                        }
                    }),
            )
            .extract()
            .with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.json"))
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn list_refresh_interval(&self) -> Option<Duration> {
        self.list_refresh_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
