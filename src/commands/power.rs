//! The `start`, `stop`, and `restart` commands
//!
//! With a vmid, operates on that single VM after checking its current
//! state. Without one, sweeps every discovered K3s VM and reports the
//! per-VM outcomes in a table.

use tabled::{Table, Tabled};
use tracing::{debug, error, info};

use crate::DeployError;
use crate::config::Config;
use crate::proxmox::ProxmoxClient;
use crate::table::themed;

/// A VM power state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop { force: bool },
    Restart,
}

impl PowerAction {
    fn verb(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop { force: true } => "force stop",
            PowerAction::Stop { force: false } => "shutdown",
            PowerAction::Restart => "restart",
        }
    }
}

#[derive(Tabled)]
struct ResultRow {
    vmid: String,
    name: String,
    role: String,
    node: String,
    status: String,
    result: String,
}

/// Run a power command against one VM or every discovered K3s VM
pub async fn handle(
    config: &Config,
    action: PowerAction,
    vmid: Option<u32>,
) -> Result<(), DeployError> {
    let client = ProxmoxClient::connect(&config.proxmox).await?;

    match vmid {
        Some(vmid) => single_vm(&client, action, vmid).await,
        None => all_k3s_vms(&client, action).await,
    }
}

async fn single_vm(
    client: &ProxmoxClient,
    action: PowerAction,
    vmid: u32,
) -> Result<(), DeployError> {
    debug!("Running {} for single VM {vmid}", action.verb());

    let Some(node) = client.find_vm_node(vmid).await? else {
        println!("VM {vmid} not found on any accessible node");
        return Ok(());
    };

    let status = client.vm_status(&node, vmid).await?;

    match action {
        PowerAction::Start => {
            if status.is_running() {
                println!("VM {vmid} is already running");
                return Ok(());
            }
            client.start_vm(&node, vmid).await?;
            println!("Successfully started VM {vmid}");
        }
        PowerAction::Stop { force } => {
            if status.is_stopped() {
                println!("VM {vmid} is already stopped");
                return Ok(());
            }
            if force {
                client.stop_vm(&node, vmid).await?;
                println!("Successfully force stopped VM {vmid}");
            } else {
                client.shutdown_vm(&node, vmid).await?;
                println!("Shutdown initiated for VM {vmid}");
            }
        }
        PowerAction::Restart => {
            if status.is_stopped() {
                println!("Cannot restart VM {vmid}: VM is currently stopped");
                return Ok(());
            }
            client.reboot_vm(&node, vmid).await?;
            println!("Successfully restarted VM {vmid}");
        }
    }

    info!("Completed {} for VM {vmid}", action.verb());
    Ok(())
}

/// Sweep every discovered K3s VM; individual failures are recorded in the
/// results table rather than aborting the sweep.
async fn all_k3s_vms(client: &ProxmoxClient, action: PowerAction) -> Result<(), DeployError> {
    println!("Running {} for all K3s VMs...", action.verb());

    let vms = client.discover_k3s_vms().await?;
    if vms.is_empty() {
        println!("No K3s VMs found");
        return Ok(());
    }

    let mut rows = Vec::new();
    for vm in &vms {
        let status = vm.status.to_lowercase();
        let result = match action {
            PowerAction::Start if status == "running" => "Already running".to_string(),
            PowerAction::Start => match client.start_vm(&vm.node, vm.vmid).await {
                Ok(_) => "Started".to_string(),
                Err(e) => failed(&e),
            },
            PowerAction::Stop { .. } if status == "stopped" => "Already stopped".to_string(),
            PowerAction::Stop { force: true } => match client.stop_vm(&vm.node, vm.vmid).await {
                Ok(_) => "Force stopped".to_string(),
                Err(e) => failed(&e),
            },
            PowerAction::Stop { force: false } => {
                match client.shutdown_vm(&vm.node, vm.vmid).await {
                    Ok(_) => "Shutdown initiated".to_string(),
                    Err(e) => failed(&e),
                }
            }
            PowerAction::Restart if status == "stopped" => "Cannot restart (stopped)".to_string(),
            PowerAction::Restart => match client.reboot_vm(&vm.node, vm.vmid).await {
                Ok(_) => "Restarted".to_string(),
                Err(e) => failed(&e),
            },
        };

        rows.push(ResultRow {
            vmid: vm.vmid.to_string(),
            name: vm.name.clone(),
            role: vm.role.to_string(),
            node: vm.node.clone(),
            status,
            result,
        });
    }

    println!("{}", themed(Table::new(rows)));
    Ok(())
}

fn failed(e: &DeployError) -> String {
    error!("{e}");
    format!("Failed: {e}")
}
