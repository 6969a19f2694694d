//! Configuration loading
//!
//! Reads config.json, applies `ENV:` indirection for Proxmox connection
//! fields, deserializes into [`Config`], and validates.

use super::Config;
use crate::DeployError;
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

/// Proxmox fields that support the `ENV:<NAME>` indirection
const ENV_SUBSTITUTABLE_KEYS: [&str; 5] =
    ["host", "user", "password", "api_token_id", "api_token_secret"];

/// Load, substitute, deserialize, and validate the application configuration
pub async fn load_config(path: impl AsRef<Path>) -> Result<Config, DeployError> {
    let path = path.as_ref();
    debug!("Loading configuration from {}", path.display());

    if !path.exists() {
        return Err(DeployError::config(format!(
            "Configuration file not found at '{}'. Create one or run \
             'k3s-deploy discover --format=json' to generate node entries",
            path.display()
        )));
    }

    let content = fs::read_to_string(path).await.map_err(|e| {
        DeployError::config(format!(
            "Error reading configuration file '{}': {e}",
            path.display()
        ))
    })?;

    let mut raw: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        DeployError::config(format!("Error decoding JSON from '{}': {e}", path.display()))
    })?;

    substitute_env_values(&mut raw);

    let config: Config = serde_json::from_value(raw).map_err(|e| {
        DeployError::config(format!(
            "Configuration validation error in '{}': {e}",
            path.display()
        ))
    })?;

    config.validate()?;
    debug!("Configuration loaded and validated successfully");
    Ok(config)
}

/// Replace `ENV:<NAME>` strings in the proxmox section with the value of
/// the named environment variable. A missing variable nulls the field so
/// validation reports it against the config key rather than the variable.
fn substitute_env_values(raw: &mut serde_json::Value) {
    let Some(proxmox) = raw.get_mut("proxmox").and_then(|v| v.as_object_mut()) else {
        return;
    };

    for key in ENV_SUBSTITUTABLE_KEYS {
        let Some(value) = proxmox.get(key).and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(var_name) = value.strip_prefix("ENV:") else {
            continue;
        };

        match std::env::var(var_name) {
            Ok(env_value) => {
                debug!("Substituting proxmox.{key} from environment variable '{var_name}'");
                proxmox.insert(key.to_string(), serde_json::Value::String(env_value));
            }
            Err(_) => {
                warn!(
                    "Environment variable '{var_name}' for proxmox.{key} not found; \
                     leaving the field unset"
                );
                proxmox.insert(key.to_string(), serde_json::Value::Null);
            }
        }
    }
}
