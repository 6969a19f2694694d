//! The `discover` command
//!
//! Tag-based discovery of K3s VMs with table or JSON output. JSON output
//! can also be written back into the config file's `nodes` array.

use clap::ValueEnum;
use serde::Serialize;
use std::path::Path;
use tabled::{Table, Tabled};
use tracing::{info, warn};

use crate::DeployError;
use crate::config::{Config, K3S_TAGS, K3sRole};
use crate::proxmox::ProxmoxClient;
use crate::proxmox::discovery::DiscoveredVm;
use crate::table::themed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputTarget {
    #[default]
    Stdout,
    File,
}

/// The `[{vmid, role}]` entries written to config.json
#[derive(Debug, Serialize)]
struct ConfigNode {
    vmid: u32,
    role: K3sRole,
}

#[derive(Tabled)]
struct DiscoverRow {
    vmid: String,
    name: String,
    role: String,
    #[tabled(rename = "proxmox node")]
    node: String,
    status: String,
    #[tabled(rename = "qga enabled")]
    qga_enabled: String,
    #[tabled(rename = "qga running")]
    qga_running: String,
}

/// Run the discover command
pub async fn handle(
    config: &Config,
    config_path: &Path,
    format: OutputFormat,
    output: OutputTarget,
) -> Result<(), DeployError> {
    info!("Discovering K3s-tagged VMs across Proxmox cluster");

    if format == OutputFormat::Table && output == OutputTarget::File {
        return Err(DeployError::config(
            "File output requires JSON format. Use --format=json --output=file",
        ));
    }

    let client = ProxmoxClient::connect(&config.proxmox).await?;
    let discovered = client.discover_k3s_vms().await?;

    if discovered.is_empty() {
        println!("\nNo K3s-tagged VMs found in the Proxmox cluster.");
        println!("Expected tags: {}", K3S_TAGS.join(", "));
        return Ok(());
    }

    match format {
        OutputFormat::Json => handle_json_output(&discovered, config_path, output).await,
        OutputFormat::Table => {
            print_table(&discovered);
            Ok(())
        }
    }
}

async fn handle_json_output(
    discovered: &[DiscoveredVm],
    config_path: &Path,
    output: OutputTarget,
) -> Result<(), DeployError> {
    let config_nodes: Vec<ConfigNode> = discovered
        .iter()
        .map(|vm| ConfigNode {
            vmid: vm.vmid,
            role: vm.role,
        })
        .collect();

    match output {
        OutputTarget::File => update_config_file(&config_nodes, config_path).await,
        OutputTarget::Stdout => {
            println!("\nDiscovered K3s Nodes Configuration (JSON):");
            println!("{}", serde_json::to_string_pretty(&config_nodes)?);
            println!(
                "\nFound {} K3s nodes. Copy the JSON above into the 'nodes' array \
                 of your config file.",
                config_nodes.len()
            );
            Ok(())
        }
    }
}

fn print_table(discovered: &[DiscoveredVm]) {
    println!("\nDiscovered K3s Nodes ({} found):", discovered.len());

    let rows: Vec<DiscoverRow> = discovered
        .iter()
        .map(|vm| DiscoverRow {
            vmid: vm.vmid.to_string(),
            name: vm.name.clone(),
            role: vm.role.to_string(),
            node: vm.node.clone(),
            status: vm.status.clone(),
            qga_enabled: if vm.qga.enabled { "Yes" } else { "No" }.to_string(),
            qga_running: if !vm.qga.enabled {
                "N/A".to_string()
            } else if vm.qga.running {
                "Yes".to_string()
            } else {
                "No".to_string()
            },
        })
        .collect();

    println!("{}", themed(Table::new(rows)));
    println!("Use 'k3s-deploy discover --format=json' to see the configuration JSON.");
    println!("Use 'k3s-deploy discover --format=json --output=file' to update the config file.");
}

/// Rewrite the `nodes` array in the config file, preserving everything
/// else and leaving a `.backup` copy of the previous content.
async fn update_config_file(
    config_nodes: &[ConfigNode],
    config_path: &Path,
) -> Result<(), DeployError> {
    use tokio::fs;

    let mut existing: serde_json::Value = if config_path.exists() {
        let content = fs::read_to_string(config_path).await?;
        let existing: serde_json::Value = serde_json::from_str(&content)?;

        let backup_path = config_path.with_extension("json.backup");
        fs::write(&backup_path, serde_json::to_string_pretty(&existing)?).await?;
        info!("Created backup: {}", backup_path.display());
        println!("Created backup: {}", backup_path.display());
        existing
    } else {
        warn!(
            "{} does not exist, creating a new file",
            config_path.display()
        );
        serde_json::json!({})
    };

    existing["nodes"] = serde_json::to_value(config_nodes)?;
    fs::write(config_path, serde_json::to_string_pretty(&existing)?).await?;

    println!(
        "Updated {} with {} discovered nodes",
        config_path.display(),
        config_nodes.len()
    );
    info!(
        "Successfully updated {} with {} nodes",
        config_path.display(),
        config_nodes.len()
    );
    Ok(())
}
