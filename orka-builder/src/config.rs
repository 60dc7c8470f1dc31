//! Builder configuration.
//!
//! Loaded from a JSON document whose keys mirror the Orka builder options,
//! then normalized by [`BuilderConfig::prepare`], which fills defaults and
//! reports every validation problem at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{OrkaError, OrkaResult};

/// Namespace used for builder VMs and saved images unless configured otherwise.
pub const DEFAULT_ORKA_NAMESPACE: &str = "orka-default";

const DEFAULT_NAME_PREFIX: &str = "packer";
const DEFAULT_CPU_CORES: u32 = 3;
const DEFAULT_VM_WAIT_TIMEOUT_MINUTES: u64 = 10;
const DEFAULT_SSH_USERNAME: &str = "admin";
const DEFAULT_SSH_PASSWORD: &str = "admin";
const DEFAULT_SSH_TIMEOUT_SECS: u64 = 5 * 60;
const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 5 * 60;

/// Which Orka API generation drives VM creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMode {
    /// Resource API (VirtualMachineInstance / Image resources with watches).
    #[default]
    Orka3,
    /// Legacy REST API (token login, vm create/deploy/purge, image copy).
    Legacy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub api_mode: ApiMode,

    // Control plane access
    pub orka_endpoint: String,
    pub orka_auth_token: String,
    pub orka_user: String,
    pub orka_password: String,

    // Builder VM
    pub orka_vm_builder_namespace: String,
    pub orka_vm_builder_name: String,
    pub orka_vm_builder_prefix: String,
    pub source_image: String,
    pub orka_vm_cpu_core: u32,
    pub orka_vm_tag: Option<String>,
    pub orka_vm_tag_required: Option<bool>,
    pub orka_legacy_io: Option<bool>,
    pub orka_net_boost: Option<bool>,
    pub orka_vm_builder_enable_io_boost: bool,
    /// Minutes to wait for the builder VM to reach Running.
    pub vm_wait_timeout: u64,
    pub enable_orka_node_ip_mapping: bool,
    pub orka_node_ip_map: HashMap<String, String>,

    // Resulting image
    pub image_name: String,
    pub image_description: String,
    pub image_force_overwrite: bool,
    pub image_precopy: bool,

    // Lifecycle switches
    pub no_create_image: bool,
    pub no_delete_vm: bool,
    /// Seconds granted to each step's cleanup.
    pub cleanup_timeout: u64,

    pub communicator: CommunicatorConfig,
    pub provisioner: ProvisionerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorConfig {
    pub ssh_username: String,
    pub ssh_password: String,
    pub ssh_private_key_file: Option<PathBuf>,
    /// Seconds to wait for the SSH port to accept connections.
    pub ssh_timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Shell commands run on the builder VM, in order.
    pub inline: Vec<String>,
}

impl BuilderConfig {
    /// Read a configuration document from disk. Does not apply defaults.
    pub fn from_file(path: &Path) -> OrkaResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrkaError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            OrkaError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })
    }

    /// Apply defaults and validate.
    ///
    /// Every problem found is reported in a single `OrkaError::Config`.
    pub fn prepare(&mut self) -> OrkaResult<()> {
        let timestamp = chrono::Utc::now().timestamp();
        let mut errors = Vec::new();

        if self.orka_endpoint.is_empty() {
            errors.push("orka_endpoint is required".to_string());
        } else if let Err(e) = url::Url::parse(&self.orka_endpoint) {
            errors.push(format!("orka_endpoint is not a valid URL: {e}"));
        }

        match self.api_mode {
            ApiMode::Orka3 => {
                if self.orka_auth_token.is_empty() {
                    errors.push("orka_auth_token is required".to_string());
                }
            }
            ApiMode::Legacy => {
                if self.orka_user.is_empty() || self.orka_password.is_empty() {
                    errors.push("orka_user and orka_password are required in legacy mode".to_string());
                }
            }
        }

        if self.source_image.is_empty() {
            errors.push(
                "No source image specified! Please specify source_image in the builder options"
                    .to_string(),
            );
        }

        if self.orka_vm_builder_namespace.is_empty() {
            self.orka_vm_builder_namespace = DEFAULT_ORKA_NAMESPACE.to_string();
        }

        if self.orka_vm_builder_name.is_empty() {
            let prefix = if self.orka_vm_builder_prefix.is_empty() {
                DEFAULT_NAME_PREFIX
            } else {
                self.orka_vm_builder_prefix.as_str()
            };
            self.orka_vm_builder_name = format!("{prefix}-{timestamp}");
        }

        if self.image_name.is_empty() {
            self.image_name = format!("{DEFAULT_NAME_PREFIX}-{timestamp}");
        }

        if self.orka_vm_cpu_core == 0 {
            self.orka_vm_cpu_core = DEFAULT_CPU_CORES;
        }
        if self.vm_wait_timeout == 0 {
            self.vm_wait_timeout = DEFAULT_VM_WAIT_TIMEOUT_MINUTES;
        }
        if self.cleanup_timeout == 0 {
            self.cleanup_timeout = DEFAULT_CLEANUP_TIMEOUT_SECS;
        }

        if self.enable_orka_node_ip_mapping && self.orka_node_ip_map.is_empty() {
            tracing::warn!("orka node IP mapping is enabled but the map is empty");
        }

        let comm = &mut self.communicator;
        if comm.ssh_username.is_empty() {
            comm.ssh_username = DEFAULT_SSH_USERNAME.to_string();
        }
        if comm.ssh_password.is_empty() && comm.ssh_private_key_file.is_none() {
            comm.ssh_password = DEFAULT_SSH_PASSWORD.to_string();
        }
        if comm.ssh_timeout == 0 {
            comm.ssh_timeout = DEFAULT_SSH_TIMEOUT_SECS;
        }
        if let Some(key) = &comm.ssh_private_key_file
            && !key.is_file()
        {
            errors.push(format!(
                "ssh_private_key_file does not exist: {}",
                key.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrkaError::Config(errors.join("; ")))
        }
    }

    pub fn vm_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.vm_wait_timeout.saturating_mul(60))
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.communicator.ssh_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal() -> BuilderConfig {
        BuilderConfig {
            orka_endpoint: "http://10.221.188.20".into(),
            orka_auth_token: "token".into(),
            source_image: "sonoma-90gb.orkasi".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_fills_defaults() {
        let mut config = minimal();
        config.prepare().unwrap();

        assert_eq!(config.orka_vm_builder_namespace, DEFAULT_ORKA_NAMESPACE);
        assert!(config.orka_vm_builder_name.starts_with("packer-"));
        assert!(config.image_name.starts_with("packer-"));
        assert_eq!(config.orka_vm_cpu_core, 3);
        assert_eq!(config.vm_wait_timeout(), Duration::from_secs(600));
        assert_eq!(config.cleanup_timeout(), Duration::from_secs(300));
        assert_eq!(config.communicator.ssh_username, "admin");
        assert_eq!(config.communicator.ssh_password, "admin");
        assert_eq!(config.ssh_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_prepare_uses_builder_prefix() {
        let mut config = minimal();
        config.orka_vm_builder_prefix = "ci".into();
        config.prepare().unwrap();
        assert!(config.orka_vm_builder_name.starts_with("ci-"));
    }

    #[test]
    fn test_prepare_keeps_explicit_values() {
        let mut config = minimal();
        config.orka_vm_builder_name = "my-vm-name".into();
        config.image_name = "my-packer-image".into();
        config.vm_wait_timeout = 25;
        config.prepare().unwrap();
        assert_eq!(config.orka_vm_builder_name, "my-vm-name");
        assert_eq!(config.image_name, "my-packer-image");
        assert_eq!(config.vm_wait_timeout(), Duration::from_secs(25 * 60));
    }

    #[test]
    fn test_prepare_reports_all_errors() {
        let mut config = BuilderConfig::default();
        let err = config.prepare().unwrap_err().to_string();
        assert!(err.contains("orka_endpoint is required"));
        assert!(err.contains("orka_auth_token is required"));
        assert!(err.contains("No source image specified"));
    }

    #[test]
    fn test_huge_vm_wait_timeout_saturates() {
        let config = BuilderConfig {
            vm_wait_timeout: u64::MAX,
            ..minimal()
        };
        assert_eq!(config.vm_wait_timeout(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_legacy_mode_requires_credentials() {
        let mut config = minimal();
        config.api_mode = ApiMode::Legacy;
        let err = config.prepare().unwrap_err().to_string();
        assert!(err.contains("orka_user and orka_password"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "orka_endpoint": "http://10.221.188.20",
                "orka_auth_token": "secret",
                "source_image": "90gbsonomassh.orkasi",
                "image_name": "ghcr.io/org/image:latest",
                "orka_vm_builder_namespace": "my-namespace",
                "enable_orka_node_ip_mapping": true,
                "orka_node_ip_map": {{ "10.0.0.5": "203.0.113.5" }},
                "communicator": {{ "ssh_username": "builder" }},
                "provisioner": {{ "inline": ["hostname"] }}
            }}"#
        )
        .unwrap();

        let config = BuilderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.api_mode, ApiMode::Orka3);
        assert_eq!(config.orka_vm_builder_namespace, "my-namespace");
        assert_eq!(
            config.orka_node_ip_map.get("10.0.0.5").map(String::as_str),
            Some("203.0.113.5")
        );
        assert_eq!(config.communicator.ssh_username, "builder");
        assert_eq!(config.provisioner.inline, vec!["hostname".to_string()]);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = BuilderConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, OrkaError::Config(_)));
    }
}
