//! Error types for k3s-deploy

use thiserror::Error;

/// Main error type for k3s-deploy operations
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Proxmox API error: {0}")]
    Proxmox(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("VM operation failed: {0}")]
    VmOperation(String),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DeployError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a Proxmox API error
    pub fn proxmox(message: impl Into<String>) -> Self {
        Self::Proxmox(message.into())
    }

    /// Create an SSH error
    pub fn ssh(message: impl Into<String>) -> Self {
        Self::Ssh(message.into())
    }

    /// Create a VM operation error
    pub fn vm_operation(message: impl Into<String>) -> Self {
        Self::VmOperation(message.into())
    }

    /// Create a provisioning error
    pub fn provision(message: impl Into<String>) -> Self {
        Self::Provision(message.into())
    }
}

impl From<russh::Error> for DeployError {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for DeployError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}
