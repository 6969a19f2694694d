//! Command handlers
//!
//! One module per subcommand, each a thin orchestration layer over the
//! Proxmox client, the cloud-init pipeline, and the SSH operations.

pub mod discover;
pub mod info;
pub mod power;
pub mod provision;

pub use power::PowerAction;
