//! The `provision` command
//!
//! Provisions VMs configured in the config file with cloud-init
//! configuration. Requested vmids that are not configured are warned about
//! and skipped; the command never discovers nodes on its own.

use tracing::{error, info, warn};

use crate::DeployError;
use crate::config::Config;
use crate::proxmox::ProxmoxClient;
use crate::proxmox::provision::provision_vm;

/// Parse a comma-separated vmid list like `100,101,102`
pub fn parse_vmid_list(input: &str) -> Result<Vec<u32>, DeployError> {
    input
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| DeployError::config(format!("Invalid VMID format: '{}'", part.trim())))
        })
        .collect()
}

/// Split requested vmids into configured and unconfigured lists
fn filter_configured(requested: &[u32], configured: &[u32]) -> (Vec<u32>, Vec<u32>) {
    requested
        .iter()
        .copied()
        .partition(|vmid| configured.contains(vmid))
}

/// Run the provision command
pub async fn handle(config: &Config, vmids: Option<Vec<u32>>) -> Result<(), DeployError> {
    info!("Starting VM provisioning process");

    let configured = config.configured_vmids();
    if configured.is_empty() {
        if let Some(requested) = &vmids {
            for vmid in requested {
                warn!("VMID {vmid} is not configured in the config file and will be skipped");
            }
        } else {
            info!("No nodes configured - nothing to provision");
        }
        return Ok(());
    }

    let to_provision = match vmids {
        None => {
            info!(
                "No specific VMIDs provided - provisioning all {} configured VMs",
                configured.len()
            );
            configured
        }
        Some(requested) => {
            let (known, unknown) = filter_configured(&requested, &configured);
            for vmid in unknown {
                warn!("VMID {vmid} is not configured in the config file and will be skipped");
            }
            if known.is_empty() {
                info!("No configured VMs found in the requested VMIDs");
                return Ok(());
            }
            info!("Provisioning {} configured VMs: {known:?}", known.len());
            known
        }
    };

    let client = ProxmoxClient::connect(&config.proxmox).await?;
    let single = to_provision.len() == 1;
    let mut failures = 0;

    for vmid in &to_provision {
        info!("Provisioning VM {vmid}...");
        match provision_vm(&client, config, *vmid).await {
            Ok(()) => info!("Successfully provisioned VM {vmid}"),
            Err(e) if single => return Err(e),
            Err(e) => {
                error!("Failed to provision VM {vmid}: {e}");
                failures += 1;
            }
        }
    }

    let total = to_provision.len();
    info!(
        "Provisioning complete: {}/{total} successful, {failures} failed",
        total - failures
    );

    if failures > 0 {
        return Err(DeployError::provision(format!(
            "{failures} of {total} VMs failed to provision"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vmid_list() {
        assert_eq!(parse_vmid_list("100").unwrap(), vec![100]);
        assert_eq!(parse_vmid_list("100,101,102").unwrap(), vec![100, 101, 102]);
        assert_eq!(parse_vmid_list("100, 101 ,102").unwrap(), vec![100, 101, 102]);
    }

    #[test]
    fn test_parse_vmid_list_invalid() {
        assert!(parse_vmid_list("abc").is_err());
        assert!(parse_vmid_list("100,").is_err());
        assert!(parse_vmid_list("").is_err());
    }

    #[test]
    fn test_filter_configured() {
        let (known, unknown) = filter_configured(&[100, 101, 999], &[100, 101, 102]);
        assert_eq!(known, vec![100, 101]);
        assert_eq!(unknown, vec![999]);
    }
}
