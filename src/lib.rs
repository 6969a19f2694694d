//! k3s-deploy library
//!
//! Discovers, power-manages, and provisions K3s-tagged VMs on a Proxmox VE
//! cluster.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`unsafe_code = "forbid"`)
//! - **Thin orchestration**: typed wrappers over the Proxmox REST API and
//!   SSH/SFTP, with the cloud-init merge pipeline as the only non-trivial
//!   logic
//! - **Replacement merge**: per-VM cloud-init settings replace global keys
//!   wholesale, never deep-merge

pub mod cloudinit;
pub mod commands;
pub mod config;
pub mod proxmox;
pub mod ssh;
pub mod table;

mod error;

pub use error::DeployError;
