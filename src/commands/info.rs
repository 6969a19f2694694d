//! The `info` command
//!
//! Displays a cluster overview, a per-node table (DNS domain, snippet
//! storage, SFTP writability), and the K3s VMs — tag-discovered or from
//! the configured nodes.

use tabled::{Table, Tabled};
use tracing::{debug, info, warn};

use crate::DeployError;
use crate::config::Config;
use crate::proxmox::discovery::DiscoveredVm;
use crate::proxmox::{ClusterStatusEntry, ProxmoxClient};
use crate::ssh::{self, SshSession};
use crate::table::themed;

#[derive(Tabled)]
struct OverviewRow {
    property: String,
    value: String,
}

#[derive(Tabled)]
struct NodeRow {
    node: String,
    domain: String,
    local: String,
    online: String,
    #[tabled(rename = "ip address")]
    ip: String,
    #[tabled(rename = "snippet storage")]
    snippet_storage: String,
    #[tabled(rename = "storage path")]
    storage_path: String,
    #[tabled(rename = "sftp writable")]
    sftp_writable: String,
}

#[derive(Tabled)]
struct VmRow {
    vmid: String,
    name: String,
    status: String,
    #[tabled(rename = "role tag")]
    tag: String,
    #[tabled(rename = "qga enabled")]
    qga_enabled: String,
    #[tabled(rename = "qga running")]
    qga_running: String,
    #[tabled(rename = "qga version")]
    qga_version: String,
}

#[derive(Tabled)]
struct ConfiguredRow {
    vmid: String,
    name: String,
    role: String,
    #[tabled(rename = "proxmox node")]
    node: String,
    status: String,
}

/// Run the info command
pub async fn handle(config: &Config, discover: bool) -> Result<(), DeployError> {
    info!("Retrieving Proxmox cluster information");
    let client = ProxmoxClient::connect(&config.proxmox).await?;

    let version = client.version().await?;
    let cluster = client.cluster_status().await?;

    if cluster.is_empty() {
        println!("Could not retrieve cluster status (no members found).");
        return Ok(());
    }

    print_overview(config, &cluster, &version.version, version.release.as_deref()).await;

    let mut nodes: Vec<&ClusterStatusEntry> =
        cluster.iter().filter(|entry| entry.kind == "node").collect();
    nodes.sort_by_key(|node| node.name.clone());

    if nodes.is_empty() {
        println!("\nNo Proxmox VE nodes found in the cluster status.");
        return Ok(());
    }

    print_nodes_table(&client, config, &nodes).await;
    print_k3s_vms(&client, config, discover).await?;
    Ok(())
}

async fn print_overview(
    config: &Config,
    cluster: &[ClusterStatusEntry],
    version: &str,
    release: Option<&str>,
) {
    let cluster_info = cluster.iter().find(|entry| entry.kind == "cluster");
    let cluster_name = cluster_info
        .and_then(|c| c.name.clone())
        .unwrap_or_else(|| "N/A".to_string());
    let quorate = cluster_info.and_then(|c| c.quorate) == Some(1);

    let displayed_version = match release {
        Some(release) => format!("{version} (release: {release})"),
        None => version.to_string(),
    };

    debug!("Checking SSH connectivity to {}", config.proxmox.host);
    let ssh_status = match ssh::check_connectivity(&config.proxmox).await {
        result if result.success => "Connected".to_string(),
        result => {
            debug!(
                "SSH connectivity check failed: {}",
                result.error.as_deref().unwrap_or("unknown")
            );
            "Failed".to_string()
        }
    };

    let rows = vec![
        OverviewRow {
            property: "Name".to_string(),
            value: cluster_name,
        },
        OverviewRow {
            property: "Proxmox VE Version".to_string(),
            value: displayed_version,
        },
        OverviewRow {
            property: "Quorate".to_string(),
            value: yes_no(quorate),
        },
        OverviewRow {
            property: "SSH Connectivity".to_string(),
            value: ssh_status,
        },
    ];

    println!("\nCluster Overview");
    println!("{}", themed(Table::new(rows)));
}

async fn print_nodes_table(
    client: &ProxmoxClient,
    config: &Config,
    nodes: &[&ClusterStatusEntry],
) {
    let mut rows = Vec::new();

    for node in nodes {
        let Some(name) = node.name.as_deref() else {
            continue;
        };

        let domain = match client.node_dns_search(name).await {
            Ok(Some(domain)) => domain,
            Ok(None) => "N/A".to_string(),
            Err(e) => {
                debug!("Failed to get DNS info for node '{name}': {e}");
                "N/A".to_string()
            }
        };

        let (snippet_storage, storage_path, sftp_writable) =
            storage_columns(client, config, name).await;

        rows.push(NodeRow {
            node: name.to_string(),
            domain,
            local: yes_no(node.local == Some(1)),
            online: yes_no(node.online == Some(1)),
            ip: node.ip.clone().unwrap_or_else(|| "N/A".to_string()),
            snippet_storage,
            storage_path,
            sftp_writable,
        });
    }

    println!("\nProxmox VE Nodes");
    println!("{}", themed(Table::new(rows)));
}

/// Snippet storage, path, and SFTP writability columns for one node.
/// The write probe runs only against node-local storage with a known path.
async fn storage_columns(
    client: &ProxmoxClient,
    config: &Config,
    node: &str,
) -> (String, String, String) {
    match client.snippet_storage(node).await {
        Ok(Some(storage)) => {
            let path = storage.path.clone().unwrap_or_else(|| "N/A".to_string());
            let writable = if storage.shared {
                "Shared".to_string()
            } else if let Some(storage_path) = &storage.path {
                probe_node_write_access(config, node, storage_path).await
            } else {
                "Unknown".to_string()
            };
            (storage.name, path, writable)
        }
        Ok(None) => ("None".to_string(), "N/A".to_string(), "N/A".to_string()),
        Err(e) => {
            debug!("Failed to get snippet storage info for node '{node}': {e}");
            ("Error".to_string(), "N/A".to_string(), "Error".to_string())
        }
    }
}

async fn probe_node_write_access(config: &Config, node: &str, path: &str) -> String {
    match SshSession::connect_to_node(&config.proxmox, node).await {
        Ok(session) => {
            let probe = session.probe_write_access(path).await;
            session.close().await;
            if probe.writable {
                "Yes".to_string()
            } else {
                debug!(
                    "SFTP write test failed for {node}: {}",
                    probe.error.as_deref().unwrap_or("unknown")
                );
                "No".to_string()
            }
        }
        Err(e) => {
            debug!("SFTP write test failed for node '{node}': {e}");
            "Error".to_string()
        }
    }
}

async fn print_k3s_vms(
    client: &ProxmoxClient,
    config: &Config,
    discover: bool,
) -> Result<(), DeployError> {
    if discover || config.nodes.is_empty() {
        let mode = if discover { "discovery" } else { "fallback discovery" };
        println!("\nK3s VMs (tag-based {mode}):");
        if discover && !config.nodes.is_empty() {
            println!("Note: discovery mode ignores the configured nodes.");
        }

        let vms = client.discover_k3s_vms().await?;
        if vms.is_empty() {
            println!("No K3s VMs found on any online nodes.");
        } else {
            print_discovered_table(&vms);
        }
    } else {
        print_configured_nodes(client, config).await?;
    }
    Ok(())
}

fn print_discovered_table(vms: &[DiscoveredVm]) {
    let rows: Vec<VmRow> = vms
        .iter()
        .map(|vm| {
            let (enabled, running, version) = qga_columns(vm);
            VmRow {
                vmid: vm.vmid.to_string(),
                name: vm.name.clone(),
                status: vm.status.clone(),
                tag: vm.tag.to_string(),
                qga_enabled: enabled,
                qga_running: running,
                qga_version: version,
            }
        })
        .collect();
    println!("{}", themed(Table::new(rows)));
}

fn qga_columns(vm: &DiscoveredVm) -> (String, String, String) {
    let qga = &vm.qga;
    if qga.error.is_some() {
        return ("Unknown".to_string(), "N/A".to_string(), "N/A".to_string());
    }
    if !qga.enabled {
        return ("No".to_string(), "N/A".to_string(), "N/A".to_string());
    }
    if !qga.running {
        return ("Yes".to_string(), "No".to_string(), "N/A".to_string());
    }
    (
        "Yes".to_string(),
        "Yes".to_string(),
        qga.version.clone().unwrap_or_else(|| "Unknown".to_string()),
    )
}

async fn print_configured_nodes(
    client: &ProxmoxClient,
    config: &Config,
) -> Result<(), DeployError> {
    println!(
        "\nConfigured K3s Nodes ({} configured):",
        config.nodes.len()
    );

    let mut rows = Vec::new();
    for node_config in &config.nodes {
        match find_vm_summary(client, node_config.vmid).await? {
            Some((node, name, status)) => rows.push(ConfiguredRow {
                vmid: node_config.vmid.to_string(),
                name,
                role: node_config.role.to_string(),
                node,
                status,
            }),
            None => {
                warn!(
                    "Configured VMID {} not found in Proxmox cluster",
                    node_config.vmid
                );
                rows.push(ConfiguredRow {
                    vmid: node_config.vmid.to_string(),
                    name: "VM Not Found".to_string(),
                    role: node_config.role.to_string(),
                    node: "N/A".to_string(),
                    status: "N/A".to_string(),
                });
            }
        }
    }

    println!("{}", themed(Table::new(rows)));
    println!("Use 'k3s-deploy info --discover' to force tag-based discovery instead.");
    Ok(())
}

/// Locate a VM by vmid across online nodes, returning (node, name, status)
async fn find_vm_summary(
    client: &ProxmoxClient,
    vmid: u32,
) -> Result<Option<(String, String, String)>, DeployError> {
    let cluster = client.cluster_status().await?;

    for entry in cluster.iter().filter(|e| e.is_online_node()) {
        let Some(node) = entry.name.as_deref() else {
            continue;
        };
        let vms = match client.list_vms(node).await {
            Ok(vms) => vms,
            Err(e) => {
                debug!("Error checking node '{node}' for VMID {vmid}: {e}");
                continue;
            }
        };
        if let Some(vm) = vms.into_iter().find(|vm| vm.vmid == vmid) {
            return Ok(Some((
                node.to_string(),
                vm.name.unwrap_or_else(|| "N/A".to_string()),
                vm.status.unwrap_or_else(|| "N/A".to_string()),
            )));
        }
    }
    Ok(None)
}

fn yes_no(value: bool) -> String {
    if value { "Yes".to_string() } else { "No".to_string() }
}
