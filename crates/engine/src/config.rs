//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use triage_common::error::{Error, Result};

/// Analysis engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Reasoning backend configuration
    pub reasoning: ReasoningConfig,

    /// Upper bound for one whole analysis run, in seconds. The host request
    /// path that triggers analysis is itself time-limited, so this stays
    /// generous but finite.
    pub run_timeout_secs: u64,

    /// How many uploaded screenshots to retain per run (correlation only
    /// consumes the first)
    pub screenshot_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reasoning: ReasoningConfig::default(),
            run_timeout_secs: 60,
            screenshot_limit: 4,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw).map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

/// Reasoning / image-understanding backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Base URL of the structured-inference service
    pub base_url: String,

    /// Model identifier passed through to the backend
    pub model: String,

    /// Environment variable holding the API key; the key itself never lives
    /// in config files
    pub api_key_env: Option<String>,

    /// Per-request timeout, in seconds
    pub request_timeout_secs: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8700".to_string(),
            model: "triage-reasoner-1".to_string(),
            api_key_env: Some("TRIAGE_API_KEY".to_string()),
            request_timeout_secs: 30,
        }
    }
}
