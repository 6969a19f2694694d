//! SSH/SFTP operations against Proxmox nodes
//!
//! Snippet uploads go over SFTP to the node that owns the storage: the
//! configured primary host for shared storage, the node-specific hostname
//! for local storage. Authentication tries the default public keys first,
//! then the configured password.

use russh::client;
use russh::keys::{self, HashAlg, PrivateKeyWithHashAlg};
use russh_sftp::client::SftpSession;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::DeployError;
use crate::config::ProxmoxConfig;

/// Default key files probed for public-key authentication, in order
const DEFAULT_KEY_FILES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Connection and authentication timeout
const SSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of the SFTP write-access probe
#[derive(Debug, Clone)]
pub struct WriteProbe {
    pub writable: bool,
    pub error: Option<String>,
}

/// Result of the SSH connectivity check shown by `info`
#[derive(Debug, Clone)]
pub struct SshConnectivity {
    pub success: bool,
    pub auth_method: Option<&'static str>,
    pub error: Option<String>,
}

/// Minimal russh client handler — accepts all server keys (the Proxmox
/// hosts are already trusted API endpoints).
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH session to a Proxmox host
pub struct SshSession {
    handle: client::Handle<AcceptingHandler>,
    host: String,
}

impl SshSession {
    /// Connect to the configured primary Proxmox host
    pub async fn connect_primary(config: &ProxmoxConfig) -> Result<Self, DeployError> {
        let host = ssh_host(&config.host);
        Self::connect(host, config.ssh_username(), config.password.as_deref()).await
    }

    /// Connect to a specific cluster node.
    ///
    /// The node hostname is derived from the configured host by swapping
    /// its first label for the node name. If that connection fails, the
    /// bare node name is tried as a fallback.
    pub async fn connect_to_node(
        config: &ProxmoxConfig,
        node: &str,
    ) -> Result<Self, DeployError> {
        let node_host = construct_node_hostname(ssh_host(&config.host), node);
        if !is_valid_hostname(&node_host) {
            return Err(DeployError::config(format!(
                "Invalid hostname constructed for node {node}: {node_host}"
            )));
        }

        let username = config.ssh_username();
        let password = config.password.as_deref();

        match Self::connect(&node_host, username, password).await {
            Ok(session) => Ok(session),
            Err(first_err) if node_host != node => {
                debug!("SSH to {node_host} failed, falling back to bare node name {node}");
                Self::connect(node, username, password)
                    .await
                    .map_err(|fallback_err| {
                        DeployError::ssh(format!(
                            "SSH connection failed to both {node_host} ({first_err}) \
                             and {node} ({fallback_err})"
                        ))
                    })
            }
            Err(err) => Err(err),
        }
    }

    /// Connect and authenticate: default public keys first, then password
    pub async fn connect(
        host: &str,
        username: &str,
        password: Option<&str>,
    ) -> Result<Self, DeployError> {
        debug!("Establishing SSH connection to {username}@{host}");

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(SSH_TIMEOUT),
            ..client::Config::default()
        });

        let connect = client::connect(ssh_config, (host, 22), AcceptingHandler);
        let mut handle = tokio::time::timeout(SSH_TIMEOUT, connect)
            .await
            .map_err(|_| DeployError::ssh(format!("SSH connection to {host} timed out")))?
            .map_err(|e| DeployError::ssh(format!("SSH connection to {host} failed: {e}")))?;

        for key_path in default_key_paths() {
            let Some(key) = load_secret_key(&key_path) else {
                continue;
            };
            // The hash algorithm override only applies to RSA keys
            let hash_alg = match key.algorithm() {
                keys::Algorithm::Rsa { .. } => best_hash_alg(&handle).await,
                _ => None,
            };
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

            match handle.authenticate_publickey(username, key).await {
                Ok(auth) if auth.success() => {
                    debug!(
                        "SSH public key authentication successful to {host} \
                         using {}",
                        key_path.display()
                    );
                    return Ok(Self {
                        handle,
                        host: host.to_string(),
                    });
                }
                Ok(_) => debug!("Key {} rejected by {host}", key_path.display()),
                Err(e) => debug!("Public key auth error for {host}: {e}"),
            }
        }

        if let Some(password) = password {
            debug!("SSH public key authentication failed to {host}, trying password");
            let auth = handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| DeployError::ssh(format!("SSH password auth to {host} failed: {e}")))?;
            if auth.success() {
                debug!("SSH password authentication successful to {host}");
                return Ok(Self {
                    handle,
                    host: host.to_string(),
                });
            }
            return Err(DeployError::ssh(format!(
                "SSH authentication failed for {username}@{host}: all methods rejected"
            )));
        }

        Err(DeployError::ssh(format!(
            "SSH public key authentication failed for {username}@{host} \
             and no password configured"
        )))
    }

    /// Open an SFTP subsystem on this session
    async fn sftp(&self) -> Result<SftpSession, DeployError> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| DeployError::ssh(format!("Failed to open SFTP session: {e}")))?;
        Ok(sftp)
    }

    /// Upload a snippet document to `<storage_path>/snippets/<filename>`,
    /// creating the snippets directory when missing. Returns the remote
    /// path written.
    pub async fn upload_snippet(
        &self,
        storage_path: &str,
        filename: &str,
        content: &str,
    ) -> Result<String, DeployError> {
        let snippets_dir = format!("{}/snippets", storage_path.trim_end_matches('/'));
        let remote_path = format!("{snippets_dir}/{filename}");

        debug!("Uploading to remote path {remote_path} on {}", self.host);
        let sftp = self.sftp().await?;

        // mkdir fails when the directory already exists, which is fine
        if let Err(e) = sftp.create_dir(&snippets_dir).await {
            debug!("create_dir {snippets_dir}: {e} (likely already exists)");
        }

        let mut file = sftp
            .create(&remote_path)
            .await
            .map_err(|e| DeployError::ssh(format!("Failed to create {remote_path}: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| DeployError::ssh(format!("Failed to write {remote_path}: {e}")))?;
        file.shutdown()
            .await
            .map_err(|e| DeployError::ssh(format!("Failed to flush {remote_path}: {e}")))?;

        sftp.close().await.ok();
        info!("Uploaded {remote_path} on {}", self.host);
        Ok(remote_path)
    }

    /// Probe SFTP write access to a remote directory by creating, statting,
    /// and removing a uniquely named test file. Never propagates errors.
    pub async fn probe_write_access(&self, remote_dir: &str) -> WriteProbe {
        let test_file = format!(
            "{}/.k3s_deploy_write_test_{}_{}.tmp",
            remote_dir.trim_end_matches('/'),
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        debug!("Testing SFTP write access with {test_file}");

        let sftp = match self.sftp().await {
            Ok(sftp) => sftp,
            Err(e) => {
                return WriteProbe {
                    writable: false,
                    error: Some(e.to_string()),
                };
            }
        };

        let result: Result<(), String> = async {
            let mut file = sftp.create(&test_file).await.map_err(|e| e.to_string())?;
            file.write_all(b"k3s-deploy SFTP write access test")
                .await
                .map_err(|e| e.to_string())?;
            file.shutdown().await.map_err(|e| e.to_string())?;
            sftp.metadata(&test_file).await.map_err(|e| e.to_string())?;
            Ok(())
        }
        .await;

        let probe = match result {
            Ok(()) => {
                if let Err(e) = sftp.remove_file(&test_file).await {
                    warn!("Failed to remove remote test file {test_file}: {e}");
                }
                WriteProbe {
                    writable: true,
                    error: None,
                }
            }
            Err(e) => {
                debug!("SFTP write test failed for {remote_dir}: {e}");
                WriteProbe {
                    writable: false,
                    error: Some(e),
                }
            }
        };
        sftp.close().await.ok();
        probe
    }

    /// Close the session
    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Quick SSH connectivity check against the configured host, used by the
/// `info` cluster overview. Reports rather than propagates failures.
pub async fn check_connectivity(config: &ProxmoxConfig) -> SshConnectivity {
    match SshSession::connect_primary(config).await {
        Ok(session) => {
            let method = if config.password.is_some() {
                // Either method may have won; key auth is attempted first
                "publickey/password"
            } else {
                "publickey"
            };
            session.close().await;
            SshConnectivity {
                success: true,
                auth_method: Some(method),
                error: None,
            }
        }
        Err(e) => SshConnectivity {
            success: false,
            auth_method: None,
            error: Some(e.to_string()),
        },
    }
}

/// Strip an explicit API port from the configured host for SSH use
fn ssh_host(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Replace the first hostname label with the node name, keeping the domain
/// (`pve1.lan.example` + `pve2` -> `pve2.lan.example`). A bare hostname
/// falls back to the node name alone.
pub fn construct_node_hostname(base_host: &str, node: &str) -> String {
    match base_host.split_once('.') {
        Some((_, domain)) => format!("{node}.{domain}"),
        None => node.to_string(),
    }
}

/// Basic hostname shape check: labels of alphanumerics and dashes
fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && !host.starts_with('-')
        && !host.ends_with('-')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Validate an OpenSSH public key line: a known type prefix followed by a
/// base64 body
pub fn validate_public_key(key: &str) -> Result<(), DeployError> {
    const KEY_TYPES: [&str; 6] = [
        "ssh-rsa",
        "ssh-dss",
        "ssh-ed25519",
        "ecdsa-sha2-nistp256",
        "ecdsa-sha2-nistp384",
        "ecdsa-sha2-nistp521",
    ];

    let mut parts = key.trim().split_whitespace();
    let key_type = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();

    let valid_type = KEY_TYPES.contains(&key_type);
    let valid_body = !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=');

    if valid_type && valid_body {
        Ok(())
    } else {
        Err(DeployError::provision("Invalid SSH public key format"))
    }
}

fn default_key_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    DEFAULT_KEY_FILES
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.exists())
        .collect()
}

fn load_secret_key(path: &PathBuf) -> Option<keys::PrivateKey> {
    let data = std::fs::read_to_string(path).ok()?;
    match keys::decode_secret_key(&data, None) {
        Ok(key) => Some(key),
        Err(e) => {
            debug!("Failed to decode SSH key {}: {e}", path.display());
            None
        }
    }
}

async fn best_hash_alg(handle: &client::Handle<AcceptingHandler>) -> Option<HashAlg> {
    handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construct_node_hostname_with_domain() {
        assert_eq!(
            construct_node_hostname("pve1.lan.home.example.io", "pve2"),
            "pve2.lan.home.example.io"
        );
    }

    #[test]
    fn test_construct_node_hostname_bare() {
        assert_eq!(construct_node_hostname("proxmox", "pve2"), "pve2");
    }

    #[test]
    fn test_ssh_host_strips_port() {
        assert_eq!(ssh_host("pve.lan:8006"), "pve.lan");
        assert_eq!(ssh_host("pve.lan"), "pve.lan");
    }

    #[test]
    fn test_is_valid_hostname() {
        assert!(is_valid_hostname("pve2.lan.example"));
        assert!(is_valid_hostname("pve-2"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname("-pve"));
        assert!(!is_valid_hostname("pve_2"));
    }

    #[test]
    fn test_validate_public_key_accepts_known_types() {
        assert!(validate_public_key("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 user@host").is_ok());
        assert!(validate_public_key("ssh-rsa AAAAB3NzaC1yc2E= user@host").is_ok());
        assert!(validate_public_key("ecdsa-sha2-nistp256 AAAAE2VjZHNh").is_ok());
    }

    #[test]
    fn test_validate_public_key_rejects_garbage() {
        assert!(validate_public_key("not-a-key AAAA").is_err());
        assert!(validate_public_key("ssh-ed25519").is_err());
        assert!(validate_public_key("ssh-ed25519 spaces in body").is_err());
        assert!(validate_public_key("").is_err());
    }
}
