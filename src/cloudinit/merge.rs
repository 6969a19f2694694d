//! Cloud-init settings merging
//!
//! Combines global cloud-init settings with per-VM overrides. The merge is
//! a shallow key-by-key replacement: any key present and non-null in the VM
//! mapping fully replaces the corresponding global key. Lists are never
//! concatenated and mappings are never deep-merged.

use crate::config::Config;
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

/// Merge VM-specific cloud-init settings over the global settings.
///
/// Non-mapping inputs (including null) are treated as empty mappings, so a
/// config without a `cloud_init` section merges cleanly.
pub fn merge_cloud_init(global: &Value, vm: &Value) -> Mapping {
    let mut merged = global.as_mapping().cloned().unwrap_or_default();

    if let Some(overrides) = vm.as_mapping() {
        for (key, value) in overrides {
            if value.is_null() {
                continue;
            }
            debug!(
                "VM cloud-init overriding '{}'",
                key.as_str().unwrap_or("<non-string key>")
            );
            merged.insert(key.clone(), value.clone());
        }
    }

    merged
}

/// Look up the merged cloud-init settings for a specific VM.
///
/// Global settings come from the top-level `cloud_init` section; per-VM
/// overrides from the matching `nodes[]` entry. An unconfigured VM gets
/// the global settings alone.
pub fn merged_cloud_init_for_vm(config: &Config, vmid: u32) -> Mapping {
    let vm_settings = config
        .node_by_vmid(vmid)
        .map(|node| node.cloud_init.clone())
        .unwrap_or(Value::Null);

    if vm_settings.is_null() {
        debug!("No cloud-init overrides for VM {vmid}, using global settings only");
    }

    merge_cloud_init(&config.cloud_init, &vm_settings)
}

/// Recursively strip nulls, empty sequences, and empty mappings.
///
/// Cloud-init schema validation rejects properties like `groups: []`, so
/// values that clean down to nothing are removed entirely. Scalars are
/// always kept, including `false` and `0`.
pub fn clean_value(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Sequence(items) => {
            let cleaned: Vec<Value> = items.iter().filter_map(clean_value).collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Sequence(cleaned))
            }
        }
        Value::Mapping(map) => {
            let cleaned = clean_mapping(map);
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Mapping(cleaned))
            }
        }
        other => Some(other.clone()),
    }
}

/// Clean every entry of a mapping, dropping keys whose values clean away
pub fn clean_mapping(map: &Mapping) -> Mapping {
    map.iter()
        .filter_map(|(key, value)| clean_value(value).map(|v| (key.clone(), v)))
        .collect()
}

/// Remove and return the `network` section from merged settings.
///
/// Only a non-empty mapping counts as network configuration; anything else
/// is discarded with a warning so a stray scalar cannot produce a broken
/// network-config document.
pub fn extract_network(settings: &mut Mapping) -> Option<Mapping> {
    let network = settings.remove("network")?;

    match network {
        Value::Mapping(map) if !map.is_empty() => Some(map),
        Value::Mapping(_) => {
            debug!("Network configuration is empty, ignoring");
            None
        }
        other => {
            warn!(
                "Network configuration is not a mapping (found {}), ignoring",
                type_name(&other)
            );
            None
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}
