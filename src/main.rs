//! k3s-deploy - manage K3s VMs on Proxmox VE
//!
//! Discovers K3s-tagged VMs, controls their power state, and provisions
//! them with cloud-init configuration through the Proxmox API and SFTP
//! snippet uploads.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, debug, error};
use tracing_subscriber::FmtSubscriber;

use k3s_deploy::commands::discover::{OutputFormat, OutputTarget};
use k3s_deploy::commands::{self, PowerAction};
use k3s_deploy::config::{self, Config};
use k3s_deploy::DeployError;

#[derive(Parser)]
#[command(name = "k3s-deploy")]
#[command(author, version, about = "Deploy and manage K3s clusters on Proxmox VE", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "config.json", env = "K3S_DEPLOY_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display Proxmox cluster status and information
    Info {
        /// Force tag-based discovery instead of using configured nodes
        #[arg(long)]
        discover: bool,
    },
    /// Discover K3s-tagged VMs and generate configuration
    Discover {
        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
        /// Output target (file updates the config file)
        #[arg(long, value_enum, default_value = "stdout")]
        output: OutputTarget,
    },
    /// Start VM(s); omit the VMID to start all K3s VMs
    Start {
        /// VM ID to start
        vmid: Option<u32>,
    },
    /// Stop VM(s); omit the VMID to stop all K3s VMs
    Stop {
        /// VM ID to stop
        vmid: Option<u32>,
        /// Force stop instead of graceful shutdown
        #[arg(long)]
        force: bool,
    },
    /// Restart VM(s); omit the VMID to restart all K3s VMs
    Restart {
        /// VM ID to restart
        vmid: Option<u32>,
    },
    /// Provision VMs with cloud-init configuration
    Provision {
        /// VM ID(s) to provision, comma-separated; omit for all configured VMs
        #[arg(long)]
        vmid: Option<String>,
    },
}

fn init_logging(verbose: bool, debug: bool) {
    let level = if debug {
        Level::TRACE
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    // Logging setup failure is unrecoverable and happens before any work
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), DeployError> {
    debug!("Loading configuration from {}", cli.config.display());
    let config = config::load_config(&cli.config).await?;
    log_redacted_config(&config);

    match cli.command {
        Commands::Info { discover } => commands::info::handle(&config, discover).await,
        Commands::Discover { format, output } => {
            commands::discover::handle(&config, &cli.config, format, output).await
        }
        Commands::Start { vmid } => commands::power::handle(&config, PowerAction::Start, vmid).await,
        Commands::Stop { vmid, force } => {
            commands::power::handle(&config, PowerAction::Stop { force }, vmid).await
        }
        Commands::Restart { vmid } => {
            commands::power::handle(&config, PowerAction::Restart, vmid).await
        }
        Commands::Provision { vmid } => {
            let vmids = vmid
                .as_deref()
                .map(commands::provision::parse_vmid_list)
                .transpose()?;
            commands::provision::handle(&config, vmids).await
        }
    }
}

/// Debug-dump the loaded configuration with credentials masked
fn log_redacted_config(config: &Config) {
    debug!(
        "Loaded configuration: host={}, user={}, password={}, token={}, \
         verify_ssl={}, {} configured nodes",
        config.proxmox.host,
        config.proxmox.user,
        config.proxmox.password.as_ref().map_or("<unset>", |_| "****"),
        config.proxmox.api_token_id.as_deref().unwrap_or("<unset>"),
        config.proxmox.verify_ssl,
        config.nodes.len()
    );
}
