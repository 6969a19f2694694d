//! K3s VM discovery and node storage probing
//!
//! Finds K3s-tagged VMs across the cluster, classifies them by role,
//! probes QEMU Guest Agent status, and selects snippet-capable storage
//! for provisioning uploads.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{ProxmoxClient, VmSummary};
use crate::DeployError;
use crate::config::{K3S_TAGS, K3sRole};

/// A K3s-tagged VM discovered on the cluster
#[derive(Debug, Clone)]
pub struct DiscoveredVm {
    pub vmid: u32,
    pub name: String,
    pub status: String,
    pub role: K3sRole,
    pub tag: &'static str,
    pub node: String,
    pub qga: QgaStatus,
}

/// QEMU Guest Agent status of a VM
#[derive(Debug, Clone, Default)]
pub struct QgaStatus {
    /// QGA enabled in the VM configuration
    pub enabled: bool,
    /// QGA currently responding
    pub running: bool,
    /// Reported agent version, when running
    pub version: Option<String>,
    /// Error from the config check, if it failed
    pub error: Option<String>,
}

/// Snippet-capable storage selected for a node
#[derive(Debug, Clone)]
pub struct SnippetStorage {
    pub name: String,
    pub kind: Option<String>,
    pub path: Option<String>,
    pub shared: bool,
}

/// Pick the single K3s tag of a VM's `tags` field.
///
/// Proxmox separates tags with `;`. A VM qualifies only when exactly one
/// of the K3s tags is present; zero or several disqualify it.
pub fn k3s_tag(tags: Option<&str>) -> Option<&'static str> {
    let tags = tags?;
    let vm_tags: Vec<&str> = tags.split(';').map(str::trim).collect();

    let mut found = None;
    for tag in K3S_TAGS {
        if vm_tags.contains(&tag) {
            if found.is_some() {
                return None;
            }
            found = Some(tag);
        }
    }
    found
}

/// Decide QGA enabled-ness from the `agent` key of a VM config.
///
/// The value is absent, an integer, or an option string like
/// `enabled=1,fstrim_cloned_disks=1`. Any non-empty string that does not
/// explicitly disable the agent counts as enabled.
pub fn agent_enabled(agent: Option<&Value>) -> bool {
    match agent {
        None | Some(Value::Null) => false,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(Value::String(s)) => {
            let s = s.trim().to_lowercase();
            if s.is_empty() {
                return false;
            }
            !(s == "0"
                || s == "false"
                || s.contains("enabled=0")
                || s.contains("enabled=false"))
        }
        Some(other) => {
            warn!("Unexpected agent config value '{other}', assuming QGA disabled");
            false
        }
    }
}

impl ProxmoxClient {
    /// QGA configuration and runtime status for a VM.
    ///
    /// A failed config fetch records the error and reports the agent as
    /// disabled; the runtime probe never fails, only reports not-running.
    pub async fn qga_status(&self, node: &str, vmid: u32) -> QgaStatus {
        let config = match self.vm_config(node, vmid).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to check QGA config for VM {vmid}: {e}");
                return QgaStatus {
                    error: Some(format!("Config check failed: {e}")),
                    ..QgaStatus::default()
                };
            }
        };

        let enabled = agent_enabled(config.get("agent"));
        if !enabled {
            return QgaStatus::default();
        }

        match self.agent_info(node, vmid).await {
            Some(info) => QgaStatus {
                enabled: true,
                running: true,
                version: info
                    .get("version")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| Some("Unknown".to_string())),
                error: None,
            },
            None => QgaStatus {
                enabled: true,
                ..QgaStatus::default()
            },
        }
    }

    /// K3s-tagged VMs on a single node, sorted by vmid
    pub async fn tagged_vms(&self, node: &str) -> Result<Vec<DiscoveredVm>, DeployError> {
        debug!("Fetching VMs from node '{node}' for K3s tag check");
        let vms = self.list_vms(node).await?;

        let mut tagged = Vec::new();
        for vm in vms {
            let Some(tag) = k3s_tag(vm.tags.as_deref()) else {
                continue;
            };
            let Some(role) = K3sRole::from_tag(tag) else {
                warn!("Unknown K3s tag '{tag}' for VM {}, skipping", vm.vmid);
                continue;
            };

            let qga = self.qga_status(node, vm.vmid).await;
            tagged.push(discovered_vm(vm, role, tag, node, qga));
        }

        tagged.sort_by_key(|vm| vm.vmid);
        debug!("Found {} K3s-tagged VMs on node '{node}'", tagged.len());
        Ok(tagged)
    }

    /// K3s-tagged VMs across all online cluster nodes, sorted by vmid.
    ///
    /// Per-node API failures are logged and skipped so one unreachable
    /// node does not abort discovery.
    pub async fn discover_k3s_vms(&self) -> Result<Vec<DiscoveredVm>, DeployError> {
        let cluster = self.cluster_status().await?;
        let online_nodes: Vec<String> = cluster
            .iter()
            .filter(|entry| entry.is_online_node())
            .filter_map(|entry| entry.name.clone())
            .collect();

        if online_nodes.is_empty() {
            warn!("No online Proxmox nodes found for K3s discovery");
            return Ok(Vec::new());
        }

        info!(
            "Scanning {} online Proxmox nodes for K3s VMs",
            online_nodes.len()
        );

        let mut discovered = Vec::new();
        for node in &online_nodes {
            match self.tagged_vms(node).await {
                Ok(vms) => discovered.extend(vms),
                Err(e) => warn!("Failed to get K3s VMs from node '{node}': {e}"),
            }
        }

        discovered.sort_by_key(|vm| vm.vmid);
        info!(
            "Discovery complete: found {} K3s VMs across {} nodes",
            discovered.len(),
            online_nodes.len()
        );
        Ok(discovered)
    }

    /// Locate the node hosting a VM by scanning every node's VM listing.
    ///
    /// Inaccessible nodes are skipped; `None` means the VM was not found
    /// on any reachable node.
    pub async fn find_vm_node(&self, vmid: u32) -> Result<Option<String>, DeployError> {
        debug!("Searching for VM {vmid} across all nodes");
        let cluster = self.cluster_status().await?;

        for entry in cluster.iter().filter(|e| e.kind == "node") {
            let Some(node) = entry.name.as_deref() else {
                continue;
            };

            match self.list_vms(node).await {
                Ok(vms) => {
                    if vms.iter().any(|vm| vm.vmid == vmid) {
                        debug!("Found VM {vmid} on node '{node}'");
                        return Ok(Some(node.to_string()));
                    }
                }
                Err(e) => {
                    debug!("Could not access node '{node}', skipping: {e}");
                }
            }
        }

        debug!("VM {vmid} not found on any accessible node");
        Ok(None)
    }

    /// First snippet-capable storage on a node that is enabled and active.
    ///
    /// `path` and `shared` come from the node listing when present; the
    /// cluster storage definition fills the gaps, and a failed detail
    /// fetch degrades to the listing values.
    pub async fn snippet_storage(
        &self,
        node: &str,
    ) -> Result<Option<SnippetStorage>, DeployError> {
        let storage_list = self.node_storage(node).await?;
        debug!(
            "Retrieved {} storage configurations for node '{node}'",
            storage_list.len()
        );

        for entry in storage_list {
            let supports_snippets = entry
                .content
                .as_deref()
                .is_some_and(|content| content.split(',').any(|c| c.trim() == "snippets"));
            if !supports_snippets || entry.enabled != Some(1) || entry.active != Some(1) {
                continue;
            }

            debug!(
                "Found snippet-capable storage '{}' on node '{node}'",
                entry.storage
            );

            if entry.path.is_some() && entry.shared.is_some() {
                return Ok(Some(SnippetStorage {
                    name: entry.storage,
                    kind: entry.kind,
                    path: entry.path,
                    shared: entry.shared == Some(1),
                }));
            }

            // Node listing was incomplete, consult the storage definition
            return Ok(Some(match self.storage_detail(&entry.storage).await {
                Ok(detail) => SnippetStorage {
                    name: entry.storage,
                    kind: detail.kind.or(entry.kind),
                    path: detail.path.or(entry.path),
                    shared: detail.shared.or(entry.shared) == Some(1),
                },
                Err(e) => {
                    warn!(
                        "Could not fetch details for storage '{}': {e}",
                        entry.storage
                    );
                    SnippetStorage {
                        name: entry.storage,
                        kind: entry.kind,
                        path: entry.path,
                        shared: entry.shared == Some(1),
                    }
                }
            }));
        }

        debug!("No snippet-capable storage found on node '{node}'");
        Ok(None)
    }

    /// Whether a named storage is shared across nodes
    pub async fn is_storage_shared(&self, name: &str) -> Result<bool, DeployError> {
        let detail = self.storage_detail(name).await?;
        Ok(detail.shared == Some(1))
    }
}

fn discovered_vm(
    vm: VmSummary,
    role: K3sRole,
    tag: &'static str,
    node: &str,
    qga: QgaStatus,
) -> DiscoveredVm {
    DiscoveredVm {
        vmid: vm.vmid,
        name: vm.name.unwrap_or_else(|| "N/A".to_string()),
        status: vm.status.unwrap_or_else(|| "unknown".to_string()),
        role,
        tag,
        node: node.to_string(),
        qga,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_k3s_tag_single_match() {
        assert_eq!(k3s_tag(Some("k3s-server")), Some("k3s-server"));
        assert_eq!(k3s_tag(Some("prod;k3s-agent")), Some("k3s-agent"));
        assert_eq!(k3s_tag(Some(" k3s-storage ; prod ")), Some("k3s-storage"));
    }

    #[test]
    fn test_k3s_tag_requires_exactly_one() {
        assert_eq!(k3s_tag(Some("k3s-server;k3s-agent")), None);
        assert_eq!(k3s_tag(Some("prod;backup")), None);
        assert_eq!(k3s_tag(Some("")), None);
        assert_eq!(k3s_tag(None), None);
    }

    #[test]
    fn test_k3s_tag_no_substring_match() {
        // "k3s-server-old" is a different tag, not a K3s role tag
        assert_eq!(k3s_tag(Some("k3s-server-old")), None);
    }

    #[test]
    fn test_agent_enabled_absent_or_null() {
        assert!(!agent_enabled(None));
        assert!(!agent_enabled(Some(&Value::Null)));
    }

    #[test]
    fn test_agent_enabled_integers() {
        assert!(agent_enabled(Some(&json!(1))));
        assert!(!agent_enabled(Some(&json!(0))));
    }

    #[test]
    fn test_agent_enabled_strings() {
        assert!(agent_enabled(Some(&json!("1"))));
        assert!(agent_enabled(Some(&json!("enabled=1"))));
        assert!(agent_enabled(Some(&json!("enabled=1,fstrim_cloned_disks=1"))));
        // Presence of options implies enabled
        assert!(agent_enabled(Some(&json!("fstrim_cloned_disks=1"))));

        assert!(!agent_enabled(Some(&json!("0"))));
        assert!(!agent_enabled(Some(&json!("false"))));
        assert!(!agent_enabled(Some(&json!("enabled=0"))));
        assert!(!agent_enabled(Some(&json!("enabled=false,fstrim_cloned_disks=1"))));
        assert!(!agent_enabled(Some(&json!(""))));
    }
}
