//! API key resolution for the model backend
//!
//! Priority:
//! 1. An explicit key (`--api-key`)
//! 2. The configured environment variable (`OPENAI_API_KEY` by default)

use converge_core::{ConvergeError, Result};
use std::env;

/// Resolve the API key for the model backend
pub fn resolve_api_key(explicit: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
        tracing::info!("Using API key from command line");
        return Ok(key.to_string());
    }

    match env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::info!("Using {}", env_var);
            Ok(key.trim().to_string())
        }
        _ => Err(ConvergeError::Auth(format!(
            "No API key found. Pass --api-key or set {}",
            env_var
        ))),
    }
}
