//! Cloud-init document generation
//!
//! Turns merged cloud-init settings into the user-data and network-config
//! YAML documents referenced by a VM's `cicustom` parameter. Settings are
//! parsed from the merged mapping, defaults applied, users expanded, and
//! the result cleaned and rendered with the `#cloud-config` header.

pub mod merge;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use sha_crypt::{Sha256Params, Sha512Params, sha256_simple, sha512_simple};
use tracing::{debug, warn};

use crate::DeployError;

/// Document header expected by cloud-init
const CLOUD_CONFIG_HEADER: &str = "#cloud-config\n";

/// Sudo rule used when a user sets `sudo: true`
const PASSWORDLESS_SUDO: &str = "ALL=(ALL) NOPASSWD:ALL";

/// Merged cloud-init settings as they appear in config.json
///
/// Every field is optional; [`UserDataDoc::from_settings`] applies the
/// defaults for absent keys.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CloudInitSettings {
    pub packages: Option<Vec<String>>,
    pub package_update: Option<bool>,
    pub package_upgrade: Option<bool>,
    pub package_reboot_if_required: Option<bool>,
    pub runcmd: Option<Vec<String>>,
    pub users: Option<Vec<UserSettings>>,
}

/// A user entry from the settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub username: Option<String>,
    pub plain_text_passwd: Option<String>,
    pub hashed_passwd: Option<String>,
    pub ssh_keys: Vec<String>,
    pub sudo: Option<SudoSetting>,
    pub groups: Vec<String>,
    pub shell: Option<String>,
}

/// Sudo access: a boolean shorthand or an explicit sudoers rule
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SudoSetting {
    Flag(bool),
    Rule(String),
}

impl SudoSetting {
    /// Resolve to the sudoers rule emitted into the document, if any
    fn to_rule(&self) -> Option<String> {
        match self {
            SudoSetting::Flag(true) => Some(PASSWORDLESS_SUDO.to_string()),
            SudoSetting::Flag(false) => None,
            SudoSetting::Rule(rule) => Some(rule.clone()),
        }
    }
}

/// The rendered cloud-init user-data document
#[derive(Debug, Clone, Serialize)]
pub struct UserDataDoc {
    pub package_update: bool,
    pub package_upgrade: bool,
    pub package_reboot_if_required: bool,
    pub packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<String>,
}

/// A cloud-init `users:` entry
#[derive(Debug, Clone, Serialize)]
pub struct UserEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sudo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashed_passwd: Option<String>,
    pub lock_passwd: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// Password hash scheme for cloud-init `hashed_passwd`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMethod {
    Sha256,
    Sha512,
}

/// Hash a plain-text password into a crypt(3) string with a random salt
pub fn hash_password(password: &str, method: HashMethod) -> Result<String, DeployError> {
    let hashed = match method {
        HashMethod::Sha512 => sha512_simple(password, &Sha512Params::default()),
        HashMethod::Sha256 => sha256_simple(password, &Sha256Params::default()),
    }
    .map_err(|e| DeployError::provision(format!("Failed to hash password: {e:?}")))?;

    debug!("Generated {method:?} password hash");
    Ok(hashed)
}

impl CloudInitSettings {
    /// Parse settings from a merged cloud-init mapping.
    ///
    /// The `network` key must already be extracted; unknown keys are
    /// ignored here since only the recognized settings feed the document.
    pub fn from_mapping(settings: &Mapping) -> Result<Self, DeployError> {
        serde_yaml::from_value(Value::Mapping(settings.clone()))
            .map_err(|e| DeployError::provision(format!("Invalid cloud-init settings: {e}")))
    }
}

impl UserDataDoc {
    /// Build the user-data document, applying defaults for absent keys
    pub fn from_settings(settings: &CloudInitSettings) -> Result<Self, DeployError> {
        let packages = settings.packages.clone().unwrap_or_else(|| {
            vec!["qemu-guest-agent".to_string(), "ansible".to_string()]
        });
        let runcmd = settings.runcmd.clone().unwrap_or_else(|| {
            vec![
                "systemctl enable qemu-guest-agent".to_string(),
                "systemctl start qemu-guest-agent".to_string(),
            ]
        });

        let mut users = Vec::new();
        for user in settings.users.as_deref().unwrap_or_default() {
            let Some(name) = user.username.as_deref().filter(|n| !n.is_empty()) else {
                warn!("Skipping user configuration without 'username' field");
                continue;
            };

            let hashed_passwd = match (&user.plain_text_passwd, &user.hashed_passwd) {
                (Some(plain), _) => Some(hash_password(plain, HashMethod::Sha512)?),
                (None, Some(hashed)) => Some(hashed.clone()),
                (None, None) => None,
            };

            users.push(UserEntry {
                name: name.to_string(),
                ssh_authorized_keys: user.ssh_keys.clone(),
                sudo: user.sudo.as_ref().and_then(SudoSetting::to_rule),
                shell: Some(user.shell.clone().unwrap_or_else(|| "/bin/bash".to_string())),
                hashed_passwd,
                lock_passwd: false,
                groups: user.groups.clone(),
            });
            debug!("Added user '{name}' to cloud-init configuration");
        }

        Ok(Self {
            package_update: settings.package_update.unwrap_or(true),
            package_upgrade: settings.package_upgrade.unwrap_or(true),
            package_reboot_if_required: settings.package_reboot_if_required.unwrap_or(true),
            packages,
            users,
            runcmd,
        })
    }

    /// Render the document as `#cloud-config` YAML, cleaned of empty fields
    pub fn render(&self) -> Result<String, DeployError> {
        let value = serde_yaml::to_value(self)?;
        let cleaned = merge::clean_value(&value).unwrap_or(Value::Mapping(Mapping::new()));
        render_document(&cleaned)
    }
}

/// Render the network-config document: the cleaned network mapping wrapped
/// under a top-level `network` key
pub fn render_network_config(network: &Mapping) -> Result<String, DeployError> {
    let cleaned = merge::clean_mapping(network);
    if cleaned.is_empty() {
        return Err(DeployError::provision(
            "Network configuration cannot be empty",
        ));
    }

    let mut doc = Mapping::new();
    doc.insert(
        Value::String("network".to_string()),
        Value::Mapping(cleaned),
    );
    render_document(&Value::Mapping(doc))
}

fn render_document(value: &Value) -> Result<String, DeployError> {
    let yaml = serde_yaml::to_string(value)?;
    Ok(format!("{CLOUD_CONFIG_HEADER}{yaml}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_from_yaml(s: &str) -> CloudInitSettings {
        let mapping: Mapping = serde_yaml::from_str(s).unwrap();
        CloudInitSettings::from_mapping(&mapping).unwrap()
    }

    #[test]
    fn test_defaults_when_settings_empty() {
        let doc = UserDataDoc::from_settings(&CloudInitSettings::default()).unwrap();
        assert!(doc.package_update);
        assert!(doc.package_upgrade);
        assert!(doc.package_reboot_if_required);
        assert_eq!(doc.packages, vec!["qemu-guest-agent", "ansible"]);
        assert_eq!(doc.runcmd.len(), 2);
        assert!(doc.users.is_empty());
    }

    #[test]
    fn test_explicit_settings_override_defaults() {
        let settings = settings_from_yaml("packages: [htop]\npackage_upgrade: false");
        let doc = UserDataDoc::from_settings(&settings).unwrap();
        assert_eq!(doc.packages, vec!["htop"]);
        assert!(!doc.package_upgrade);
        // Unset keys still get defaults
        assert!(doc.package_update);
    }

    #[test]
    fn test_user_expansion() {
        let settings = settings_from_yaml(
            r#"
users:
  - username: admin
    ssh_keys: ["ssh-ed25519 AAAAC3Nza admin@host"]
    sudo: true
    groups: [docker]
"#,
        );
        let doc = UserDataDoc::from_settings(&settings).unwrap();
        assert_eq!(doc.users.len(), 1);

        let user = &doc.users[0];
        assert_eq!(user.name, "admin");
        assert_eq!(user.sudo.as_deref(), Some(PASSWORDLESS_SUDO));
        assert_eq!(user.shell.as_deref(), Some("/bin/bash"));
        assert!(!user.lock_passwd);
        assert_eq!(user.groups, vec!["docker"]);
    }

    #[test]
    fn test_user_sudo_false_and_rule() {
        let settings = settings_from_yaml(
            r#"
users:
  - username: restricted
    sudo: false
  - username: ops
    sudo: "ALL=(ALL) ALL"
"#,
        );
        let doc = UserDataDoc::from_settings(&settings).unwrap();
        assert!(doc.users[0].sudo.is_none());
        assert_eq!(doc.users[1].sudo.as_deref(), Some("ALL=(ALL) ALL"));
    }

    #[test]
    fn test_user_without_username_skipped() {
        let settings = settings_from_yaml("users:\n  - sudo: true\n  - username: kept");
        let doc = UserDataDoc::from_settings(&settings).unwrap();
        assert_eq!(doc.users.len(), 1);
        assert_eq!(doc.users[0].name, "kept");
    }

    #[test]
    fn test_plain_password_is_hashed() {
        let settings = settings_from_yaml(
            "users:\n  - username: admin\n    plain_text_passwd: hunter2",
        );
        let doc = UserDataDoc::from_settings(&settings).unwrap();
        let hashed = doc.users[0].hashed_passwd.as_deref().unwrap();
        assert!(hashed.starts_with("$6$"));
    }

    #[test]
    fn test_hashed_password_passed_through() {
        let settings = settings_from_yaml(
            "users:\n  - username: admin\n    hashed_passwd: \"$6$salt$digest\"",
        );
        let doc = UserDataDoc::from_settings(&settings).unwrap();
        assert_eq!(doc.users[0].hashed_passwd.as_deref(), Some("$6$salt$digest"));
    }

    #[test]
    fn test_hash_password_methods() {
        assert!(hash_password("pw", HashMethod::Sha512)
            .unwrap()
            .starts_with("$6$"));
        assert!(hash_password("pw", HashMethod::Sha256)
            .unwrap()
            .starts_with("$5$"));
    }

    #[test]
    fn test_render_has_header_and_no_empty_fields() {
        let doc = UserDataDoc::from_settings(&CloudInitSettings::default()).unwrap();
        let yaml = doc.render().unwrap();
        assert!(yaml.starts_with("#cloud-config\n"));
        assert!(yaml.contains("qemu-guest-agent"));
        // Empty users list must not survive cleaning
        assert!(!yaml.contains("users:"));
    }

    #[test]
    fn test_render_network_config() {
        let network: Mapping =
            serde_yaml::from_str("version: 2\nethernets:\n  eth0:\n    dhcp4: true").unwrap();
        let yaml = render_network_config(&network).unwrap();
        assert!(yaml.starts_with("#cloud-config\n"));
        assert!(yaml.contains("network:"));
        assert!(yaml.contains("dhcp4: true"));
    }

    #[test]
    fn test_render_network_config_rejects_empty() {
        let network = Mapping::new();
        assert!(render_network_config(&network).is_err());
    }

    #[test]
    fn test_unknown_settings_keys_ignored() {
        // Arbitrary extra keys (already separated from network) must not
        // fail settings parsing
        let settings = settings_from_yaml("packages: [git]\nwrite_files: []\ncustom_key: 1");
        let doc = UserDataDoc::from_settings(&settings).unwrap();
        assert_eq!(doc.packages, vec!["git"]);
    }
}
