//! Application configuration types
//!
//! Typed representation of config.json: Proxmox connection details, the
//! configured K3s nodes, global cloud-init settings, and SSH options.

mod loader;

pub use loader::load_config;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::DeployError;

/// Top-level application configuration loaded from config.json
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Proxmox VE connection settings
    pub proxmox: ProxmoxConfig,

    /// Configured K3s nodes (may be populated by `discover --output=file`)
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Global cloud-init settings, overridable per node
    ///
    /// Kept as a free-form YAML value so arbitrary cloud-init keys
    /// (e.g. `network`) pass through the merge pipeline untouched.
    #[serde(default)]
    pub cloud_init: serde_yaml::Value,

    /// SSH options used during provisioning
    #[serde(default)]
    pub ssh: SshSettings,
}

/// Proxmox VE connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxmoxConfig {
    /// Hostname of the Proxmox API endpoint (port 8006 assumed unless given)
    pub host: String,

    /// API user, e.g. `root@pam`
    pub user: String,

    /// Password for ticket-based authentication
    pub password: Option<String>,

    /// API token id, e.g. `root@pam!deploy` (used with `api_token_secret`)
    pub api_token_id: Option<String>,

    /// API token secret
    pub api_token_secret: Option<String>,

    /// Verify the API TLS certificate
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Explicit snippet storage name (auto-detected per node when unset)
    pub snippet_storage: Option<String>,
}

fn default_verify_ssl() -> bool {
    true
}

fn default_timeout() -> u64 {
    10
}

/// A configured K3s node entry
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Proxmox VM id
    pub vmid: u32,

    /// K3s role of the VM
    pub role: K3sRole,

    /// Per-VM cloud-init overrides (replace matching global keys)
    #[serde(default)]
    pub cloud_init: serde_yaml::Value,
}

/// K3s role assigned to a VM via Proxmox tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum K3sRole {
    Server,
    Agent,
    Storage,
}

/// Proxmox VM tags recognized as K3s role markers
pub const K3S_TAGS: [&str; 3] = ["k3s-server", "k3s-agent", "k3s-storage"];

impl K3sRole {
    /// Map a Proxmox tag to its role, if it is one of the K3s tags
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "k3s-server" => Some(Self::Server),
            "k3s-agent" => Some(Self::Agent),
            "k3s-storage" => Some(Self::Storage),
            _ => None,
        }
    }
}

impl fmt::Display for K3sRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            K3sRole::Server => write!(f, "server"),
            K3sRole::Agent => write!(f, "agent"),
            K3sRole::Storage => write!(f, "storage"),
        }
    }
}

/// SSH options used when injecting the fallback provisioning user
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Username created on provisioned VMs when no users are configured
    pub username: String,

    /// Path to an SSH public key to authorize for that user
    pub public_key_file: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: "ubuntu".to_string(),
            public_key_file: None,
        }
    }
}

impl Config {
    /// Cross-field validation that serde cannot express
    pub fn validate(&self) -> Result<(), DeployError> {
        let proxmox = &self.proxmox;

        if proxmox.host.trim().is_empty() || proxmox.user.trim().is_empty() {
            return Err(DeployError::config(
                "Proxmox host and user must be configured",
            ));
        }

        let has_password = proxmox.password.as_deref().is_some_and(|p| !p.is_empty());
        let has_token = proxmox.api_token_id.as_deref().is_some_and(|t| !t.is_empty())
            && proxmox
                .api_token_secret
                .as_deref()
                .is_some_and(|s| !s.is_empty());

        if !has_password && !has_token {
            return Err(DeployError::config(
                "Proxmox authentication not configured. Provide 'password' or both \
                 'api_token_id' and 'api_token_secret'",
            ));
        }

        Ok(())
    }

    /// Find the configured node entry for a VM id
    pub fn node_by_vmid(&self, vmid: u32) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.vmid == vmid)
    }

    /// All configured VM ids
    pub fn configured_vmids(&self) -> Vec<u32> {
        self.nodes.iter().map(|node| node.vmid).collect()
    }
}

impl ProxmoxConfig {
    /// SSH username: the part of the API user before the realm separator
    pub fn ssh_username(&self) -> &str {
        self.user.split('@').next().unwrap_or(&self.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(auth: &str) -> Config {
        let json = format!(
            r#"{{"proxmox": {{"host": "pve.example.com", "user": "root@pam", {auth}}}}}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal_config(r#""password": "secret""#);
        assert!(config.proxmox.verify_ssl);
        assert_eq!(config.proxmox.timeout, 10);
        assert_eq!(config.ssh.username, "ubuntu");
        assert!(config.nodes.is_empty());
        assert!(config.cloud_init.is_null());
    }

    #[test]
    fn test_validate_password_auth() {
        let config = minimal_config(r#""password": "secret""#);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_token_auth() {
        let config =
            minimal_config(r#""api_token_id": "root@pam!ci", "api_token_secret": "abc""#);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_missing_auth() {
        let config = minimal_config(r#""verify_ssl": false"#);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("authentication"));
    }

    #[test]
    fn test_validate_incomplete_token_pair() {
        let config = minimal_config(r#""api_token_id": "root@pam!ci""#);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_role_from_tag() {
        assert_eq!(K3sRole::from_tag("k3s-server"), Some(K3sRole::Server));
        assert_eq!(K3sRole::from_tag("k3s-agent"), Some(K3sRole::Agent));
        assert_eq!(K3sRole::from_tag("k3s-storage"), Some(K3sRole::Storage));
        assert_eq!(K3sRole::from_tag("production"), None);
    }

    #[test]
    fn test_ssh_username_strips_realm() {
        let config = minimal_config(r#""password": "secret""#);
        assert_eq!(config.proxmox.ssh_username(), "root");
    }

    #[test]
    fn test_node_lookup() {
        let json = r#"{
            "proxmox": {"host": "pve", "user": "root@pam", "password": "x"},
            "nodes": [
                {"vmid": 100, "role": "server"},
                {"vmid": 101, "role": "agent", "cloud_init": {"packages": ["vim"]}}
            ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.node_by_vmid(100).is_some());
        assert!(config.node_by_vmid(999).is_none());
        assert_eq!(config.configured_vmids(), vec![100, 101]);
        assert_eq!(config.nodes[1].role, K3sRole::Agent);
        assert!(!config.nodes[1].cloud_init.is_null());
    }
}
