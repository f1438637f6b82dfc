//! Configuration management for converge
//!
//! Settings come from three layers: built-in defaults, an optional TOML file
//! (`.converge/config.toml` or an explicit `--config` path), and CLI flags.
//! This module owns the first two; the CLI applies its overrides on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{ConvergeError, Result};

/// Location of the per-directory config file, relative to the working directory
pub const CONFIG_RELATIVE_PATH: &str = ".converge/config.toml";

/// Top-level converge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergeConfig {
    /// Convergence and iteration limits
    #[serde(default, rename = "loop")]
    pub loop_settings: LoopSettings,

    /// Retry policy for model calls
    #[serde(default)]
    pub retry: RetrySettings,

    /// Model backend selection
    #[serde(default)]
    pub model: ModelSettings,

    /// Input classification
    #[serde(default)]
    pub input: InputSettings,

    /// Per-iteration notifications
    #[serde(default)]
    pub notify: NotifySettings,
}

/// Convergence loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSettings {
    /// Stop once the diff ratio drops below this value
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Maximum number of iterations (unbounded when absent)
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Retry parameters for a single model request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts, in seconds
    #[serde(default = "default_retry_delay_secs")]
    pub delay_secs: f64,
}

/// Model backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Model identifier sent to the backend
    #[serde(default = "default_model")]
    pub name: String,

    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the Responses API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Input classification rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSettings {
    /// Extensions that mark a file as source code
    #[serde(default = "default_programming_extensions")]
    pub programming_extensions: Vec<String>,

    /// Extensions collected when a target is a directory
    #[serde(default = "default_directory_extensions")]
    pub directory_extensions: Vec<String>,
}

/// Notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Characters of raw output included in each message
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,

    /// SMTP endpoint used for email delivery
    #[serde(default = "default_smtp_url")]
    pub smtp_url: String,

    /// Environment variable holding the sender address
    #[serde(default = "default_address_env")]
    pub address_env: String,

    /// Environment variable holding the app-scoped password
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

// Default value providers
fn default_threshold() -> f64 {
    0.2
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_secs() -> f64 {
    2.0
}

fn default_model() -> String {
    "o3-pro".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    3600
}

fn default_programming_extensions() -> Vec<String> {
    [
        ".py", ".js", ".ts", ".java", ".c", ".cpp", ".h", ".hpp", ".go", ".rs", ".rb", ".php",
        ".swift", ".sh", ".pl",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_directory_extensions() -> Vec<String> {
    vec![".utf".to_string(), ".txt".to_string()]
}

fn default_excerpt_chars() -> usize {
    500
}

fn default_smtp_url() -> String {
    "smtps://smtp.gmail.com:465".to_string()
}

fn default_address_env() -> String {
    "GMAIL_ADDRESS".to_string()
}

fn default_password_env() -> String {
    "GMAIL_APP_PASSWORD".to_string()
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            limit: None,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_secs: default_retry_delay_secs(),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            name: default_model(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            programming_extensions: default_programming_extensions(),
            directory_extensions: default_directory_extensions(),
        }
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            excerpt_chars: default_excerpt_chars(),
            smtp_url: default_smtp_url(),
            address_env: default_address_env(),
            password_env: default_password_env(),
        }
    }
}

impl ConvergeConfig {
    /// Load configuration from an explicit file, or from `.converge/config.toml`
    /// under `working_dir`, or fall back to defaults.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file is not.
    pub fn load_or_default(explicit: Option<&Path>, working_dir: &Path) -> Result<Self> {
        let config_path: PathBuf = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConvergeError::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => {
                let candidate = working_dir.join(CONFIG_RELATIVE_PATH);
                if !candidate.exists() {
                    return Ok(Self::default());
                }
                candidate
            }
        };

        tracing::debug!("Loading config from {}", config_path.display());
        let content = std::fs::read_to_string(&config_path)?;
        toml::from_str(&content).map_err(|e| {
            ConvergeError::Config(format!(
                "Failed to parse config file {}: {}",
                config_path.display(),
                e
            ))
        })
    }

    /// Write default configuration to `.converge/config.toml`
    pub fn write_default(working_dir: &Path) -> Result<PathBuf> {
        let config_path = working_dir.join(CONFIG_RELATIVE_PATH);
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ConvergeError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }
}

/// Normalize an extension list entry to a lowercase, dot-prefixed form
pub(crate) fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

impl InputSettings {
    /// Replace the programming extension set from a comma-separated list
    pub fn set_programming_extensions(&mut self, list: &str) {
        self.programming_extensions = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(normalize_extension)
            .collect();
    }
}
