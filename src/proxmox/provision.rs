//! VM provisioning orchestration
//!
//! Per VM: locate the hosting node, merge cloud-init settings, generate
//! the user-data (and network-config) documents, upload them to snippet
//! storage over SFTP, point `cicustom` at them, and trigger cloud-init
//! regeneration.

use tokio::fs;
use tracing::{debug, info, warn};

use super::ProxmoxClient;
use super::discovery::SnippetStorage;
use crate::DeployError;
use crate::cloudinit::merge::{extract_network, merged_cloud_init_for_vm};
use crate::cloudinit::{CloudInitSettings, UserDataDoc, UserSettings, render_network_config};
use crate::config::Config;
use crate::ssh::{SshSession, validate_public_key};

/// Fallback storage path when the API does not report one
const DEFAULT_STORAGE_PATH: &str = "/var/lib/vz";

/// Build the `cicustom` value pointing a VM at its uploaded snippets
pub fn format_cicustom(storage: &str, vmid: u32, has_network: bool) -> String {
    let mut cicustom = format!("user={storage}:snippets/userconfig-{vmid}.yaml");
    if has_network {
        cicustom.push_str(&format!(
            ",network={storage}:snippets/networkconfig-{vmid}.yaml"
        ));
    }
    cicustom
}

/// Provision a single VM with cloud-init configuration
pub async fn provision_vm(
    client: &ProxmoxClient,
    config: &Config,
    vmid: u32,
) -> Result<(), DeployError> {
    info!("Starting provisioning for VM {vmid}");

    // Step 1: locate the hosting node
    let node = client
        .find_vm_node(vmid)
        .await?
        .ok_or_else(|| DeployError::vm_operation(format!("VM {vmid} not found on any node")))?;
    debug!("VM {vmid} found on node {node}");

    // Step 2: merge settings and split off the network document
    let mut merged = merged_cloud_init_for_vm(config, vmid);
    let network = extract_network(&mut merged);
    let mut settings = CloudInitSettings::from_mapping(&merged)?;
    apply_fallback_user(&mut settings, config).await?;

    // Step 3: generate the documents
    let user_data = UserDataDoc::from_settings(&settings)?.render()?;
    let network_data = network
        .as_ref()
        .map(render_network_config)
        .transpose()?;

    // Step 4: resolve storage and upload over SFTP
    let storage = resolve_snippet_storage(client, config, &node).await?;
    debug!(
        "Using snippet storage '{}' at path '{}' (shared: {})",
        storage.name,
        storage.path.as_deref().unwrap_or(DEFAULT_STORAGE_PATH),
        storage.shared
    );

    let session = if storage.shared {
        debug!("Using primary host connection for shared storage");
        SshSession::connect_primary(&config.proxmox).await?
    } else {
        debug!("Using node-specific connection for local storage on {node}");
        SshSession::connect_to_node(&config.proxmox, &node).await?
    };

    let storage_path = storage.path.as_deref().unwrap_or(DEFAULT_STORAGE_PATH);
    let upload = async {
        session
            .upload_snippet(
                storage_path,
                &format!("userconfig-{vmid}.yaml"),
                &user_data,
            )
            .await?;
        if let Some(network_yaml) = &network_data {
            session
                .upload_snippet(
                    storage_path,
                    &format!("networkconfig-{vmid}.yaml"),
                    network_yaml,
                )
                .await?;
        }
        Ok::<(), DeployError>(())
    }
    .await;
    session.close().await;
    upload.map_err(|e| DeployError::provision(format!("Failed to upload cloud-init configuration: {e}")))?;

    // Step 5: point the VM at the uploaded snippets
    let cicustom = format_cicustom(&storage.name, vmid, network_data.is_some());
    client.set_cicustom(&node, vmid, &cicustom).await?;
    info!("Configured VM {vmid} to use cloud-init snippets ({cicustom})");

    // Step 6: regenerate and apply
    trigger_reconfiguration(client, &node, vmid).await?;

    info!("Successfully completed provisioning for VM {vmid}");
    Ok(())
}

/// Regenerate the cloud-init drive and apply it according to VM state:
/// reboot a running VM, leave a stopped VM for its next start.
async fn trigger_reconfiguration(
    client: &ProxmoxClient,
    node: &str,
    vmid: u32,
) -> Result<(), DeployError> {
    client.regenerate_cloudinit(node, vmid).await?;
    info!("Triggered cloud-init regeneration for VM {vmid}");

    match client.vm_status(node, vmid).await {
        Ok(status) if status.is_stopped() => {
            info!(
                "VM {vmid} is stopped; the configuration takes effect on the next start \
                 (k3s-deploy start {vmid})"
            );
        }
        Ok(status) if status.is_running() => {
            client.reboot_vm(node, vmid).await?;
            info!("Rebooted VM {vmid} to apply cloud-init configuration");
        }
        Ok(status) => {
            warn!(
                "VM {vmid} is in '{}' state; configuration applies after a restart",
                status.status
            );
        }
        Err(e) => {
            warn!(
                "Could not check VM {vmid} status: {e}. Configuration applied; \
                 restart manually if needed"
            );
        }
    }
    Ok(())
}

/// Inject the configured SSH user as a fallback when the merged settings
/// define no users of their own.
async fn apply_fallback_user(
    settings: &mut CloudInitSettings,
    config: &Config,
) -> Result<(), DeployError> {
    if settings.users.as_ref().is_some_and(|users| !users.is_empty()) {
        return Ok(());
    }

    let username = config.ssh.username.clone();
    let mut ssh_keys = Vec::new();

    if let Some(key_path) = &config.ssh.public_key_file {
        let key = fs::read_to_string(key_path).await.map_err(|e| {
            DeployError::provision(format!(
                "SSH public key file not found: {}: {e}",
                key_path.display()
            ))
        })?;
        let key = key.trim().to_string();
        validate_public_key(&key)?;
        debug!("Using SSH public key from {}", key_path.display());
        ssh_keys.push(key);
    } else {
        debug!("No SSH key configured; relying on host OS SSH key management");
    }

    info!("No users in cloud-init settings; adding fallback user '{username}'");
    settings.users = Some(vec![UserSettings {
        username: Some(username),
        ssh_keys,
        sudo: Some(crate::cloudinit::SudoSetting::Flag(true)),
        ..UserSettings::default()
    }]);
    Ok(())
}

/// Resolve the snippet storage for a node: the configured override (with
/// sharedness and path looked up) or the node's auto-detected storage.
async fn resolve_snippet_storage(
    client: &ProxmoxClient,
    config: &Config,
    node: &str,
) -> Result<SnippetStorage, DeployError> {
    if let Some(name) = &config.proxmox.snippet_storage {
        debug!("Using configured snippet storage '{name}'");
        let detail = client.storage_detail(name).await?;
        return Ok(SnippetStorage {
            name: name.clone(),
            kind: detail.kind,
            path: detail.path,
            shared: detail.shared == Some(1),
        });
    }

    client.snippet_storage(node).await?.ok_or_else(|| {
        DeployError::provision(format!("No snippet-capable storage found on node {node}"))
    })
}
