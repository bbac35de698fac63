use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CuadraError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default)]
    pub ai: AiSettings,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Write a timestamped copy of the pattern memory after this many
    /// processed movements.
    #[serde(default = "default_memory_backup_every")]
    pub memory_backup_every: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSettings {
    /// Base URL of an OpenAI-compatible chat completions server.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    /// Memory matches below this confidence are sent to the AI classifier.
    #[serde(default = "default_ai_below")]
    pub ai_below: f64,
    /// Memory matches at or above this confidence skip the review prompt.
    #[serde(default = "default_auto_confirm")]
    pub auto_confirm: f64,
    /// Description similarity ratio for the legacy duplicate check.
    #[serde(default = "default_similarity")]
    pub similarity: f64,
}

fn default_currency() -> String {
    "MXN".to_string()
}

fn default_memory_backup_every() -> usize {
    25
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "CUADRA_AI_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_ai_below() -> f64 {
    0.70
}

fn default_auto_confirm() -> f64 {
    0.95
}

fn default_similarity() -> f64 {
    0.85
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            user_name: String::new(),
            default_currency: default_currency(),
            ai: AiSettings::default(),
            thresholds: Thresholds::default(),
            memory_backup_every: default_memory_backup_every(),
        }
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ai_below: default_ai_below(),
            auto_confirm: default_auto_confirm(),
            similarity: default_similarity(),
        }
    }
}

impl AiSettings {
    /// Endpoint and model after environment overrides. `None` disables AI.
    pub fn resolved_endpoint(&self) -> Option<String> {
        std::env::var("CUADRA_AI_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.endpoint.clone())
    }

    pub fn resolved_model(&self) -> String {
        std::env::var("CUADRA_AI_MODEL").unwrap_or_else(|_| self.model.clone())
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|v| !v.is_empty())
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("cuadra.db")
    }

    pub fn memory_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("memory").join("patterns.json")
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("cuadra")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Documents")
        .join("cuadra")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable settings, using defaults");
            Settings::default()
        })
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| CuadraError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}
