//! # Address-Assignment Delegate Bridge
//!
//! Addresses are allocated by a separate IPAM plugin named in the network
//! configuration (`ipam.type`). The plugin is an executable found on
//! `CNI_PATH`, invoked with the same environment and stdin the runtime gave
//! this plugin, but with `CNI_COMMAND` set to `ADD` or `DEL`.
//!
//! ```text
//! AttachmentRequest ──assign──▶ IpamBridge ──add──▶ IpamPlugin (exec host-local, whereabouts, ...)
//!                                   │
//!                                   ├── reject "dhcp" before any call
//!                                   ├── zero addresses ⇒ EmptyAddressResult
//!                                   └── every ips[*].interface := 0
//! ```
//!
//! `dhcp` is rejected outright: the DHCP daemon runs in the host namespace
//! and cannot reach an interface that has been moved into a container.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::constants::{is_unsupported_ipam, CONTAINER_INTERFACE_INDEX, IPAM_EXEC_TIMEOUT};
use crate::error::{Error, Result};

// =============================================================================
// Result Types
// =============================================================================

/// Interface entry of a CNI result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name.
    pub name: String,
    /// Hardware address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Namespace path; absent for host interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// Address entry of a CNI result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// IP family (`"4"` or `"6"`); only present in pre-1.0 results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Address with prefix length.
    pub address: IpNetwork,
    /// Gateway for this address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Index into `interfaces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

/// Route entry of a CNI result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination network.
    pub dst: IpNetwork,
    /// Next hop; the address gateway is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

/// DNS settings of a CNI result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Dns {
    fn is_empty(&self) -> bool {
        self == &Dns::default()
    }
}

/// Addressing produced by the IPAM plugin, in CNI result form.
///
/// Pre-1.0 and 1.0 results decode into the same shape; use
/// [`AddressResult::encode_as`] before printing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResult {
    /// CNI version of the result.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    /// Interfaces the addresses refer to.
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    /// Assigned addresses.
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    /// Routes to install.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    /// DNS settings.
    #[serde(default, skip_serializing_if = "Dns::is_empty")]
    pub dns: Dns,
}

impl AddressResult {
    /// Stamps the result with `cni_version` and sets `ips[].version` the
    /// way that version expects: required before 1.0.0, removed after.
    pub fn encode_as(&mut self, cni_version: &str) {
        let legacy = cni_version.starts_with("0.");
        for ip in &mut self.ips {
            ip.version = legacy.then(|| {
                match ip.address {
                    IpNetwork::V4(_) => "4",
                    IpNetwork::V6(_) => "6",
                }
                .to_string()
            });
        }
        self.cni_version = cni_version.to_string();
    }

    /// Points every address at the container-side interface.
    pub fn bind_to_container_interface(&mut self) {
        for ip in &mut self.ips {
            ip.interface = Some(CONTAINER_INTERFACE_INDEX);
        }
    }
}

// =============================================================================
// IPAM Plugin Trait
// =============================================================================

/// Outcome of an IPAM release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The plugin ran and released whatever it held.
    Released,
    /// There was no plugin to ask, so nothing can have been allocated.
    NothingToRelease,
}

/// Request/response interface to an IPAM plugin.
#[async_trait]
pub trait IpamPlugin: Send + Sync {
    /// Runs the plugin's ADD.
    async fn add(&self, ipam_type: &str, raw_config: &[u8]) -> Result<AddressResult>;

    /// Runs the plugin's DEL.
    async fn del(&self, ipam_type: &str, raw_config: &[u8]) -> Result<Release>;
}

// =============================================================================
// Exec Plugin
// =============================================================================

/// Per-invocation environment passed through to the IPAM plugin.
#[derive(Debug, Clone, Default)]
pub struct IpamEnv {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    pub args: String,
    pub path: String,
}

/// CNI error object printed by a failing plugin.
#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Executes IPAM plugin binaries from `CNI_PATH`.
#[derive(Debug, Clone)]
pub struct ExecIpam {
    env: IpamEnv,
    search_path: Vec<PathBuf>,
    timeout: Duration,
}

impl ExecIpam {
    /// Creates an executor searching the directories in `env.path`.
    pub fn new(env: IpamEnv) -> Self {
        let search_path = std::env::split_paths(&env.path)
            .filter(|dir| !dir.as_os_str().is_empty())
            .collect();
        Self {
            env,
            search_path,
            timeout: IPAM_EXEC_TIMEOUT,
        }
    }

    /// Overrides the invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Locates the plugin binary.
    fn find(&self, ipam_type: &str) -> Result<Option<PathBuf>> {
        if ipam_type.is_empty() || ipam_type.contains('/') || ipam_type == ".." {
            return Err(Error::InvalidConfig(format!(
                "invalid ipam type '{ipam_type}'"
            )));
        }
        Ok(self
            .search_path
            .iter()
            .map(|dir| dir.join(ipam_type))
            .find(|candidate| candidate.is_file()))
    }

    /// Runs the plugin and returns its stdout, or a failure reason.
    async fn exec(
        &self,
        plugin: &Path,
        command: &str,
        raw_config: &[u8],
    ) -> std::result::Result<Vec<u8>, String> {
        let mut child = Command::new(plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &self.env.container_id)
            .env("CNI_NETNS", &self.env.netns)
            .env("CNI_IFNAME", &self.env.if_name)
            .env("CNI_ARGS", &self.env.args)
            .env("CNI_PATH", &self.env.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to execute {}: {e}", plugin.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(raw_config)
                .await
                .map_err(|e| format!("failed to write plugin stdin: {e}"))?;
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("timed out after {:?}", self.timeout))?
            .map_err(|e| format!("failed to wait for plugin: {e}"))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let reason = match serde_json::from_slice::<PluginError>(&output.stdout) {
            Ok(err) if !err.details.is_empty() => {
                format!("{} (code {}): {}", err.msg, err.code, err.details)
            }
            Ok(err) => format!("{} (code {})", err.msg, err.code),
            Err(_) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };
        Err(reason)
    }
}

#[async_trait]
impl IpamPlugin for ExecIpam {
    #[instrument(skip(self, raw_config), fields(container = %self.env.container_id))]
    async fn add(&self, ipam_type: &str, raw_config: &[u8]) -> Result<AddressResult> {
        let plugin = self.find(ipam_type)?.ok_or_else(|| Error::AddressAssignment {
            plugin: ipam_type.to_string(),
            reason: format!("plugin not found in CNI_PATH '{}'", self.env.path),
        })?;

        debug!(plugin = %plugin.display(), "Executing IPAM ADD");
        let stdout = self
            .exec(&plugin, "ADD", raw_config)
            .await
            .map_err(|reason| Error::AddressAssignment {
                plugin: ipam_type.to_string(),
                reason,
            })?;

        serde_json::from_slice(&stdout).map_err(|e| Error::AddressAssignment {
            plugin: ipam_type.to_string(),
            reason: format!("invalid result: {e}"),
        })
    }

    #[instrument(skip(self, raw_config), fields(container = %self.env.container_id))]
    async fn del(&self, ipam_type: &str, raw_config: &[u8]) -> Result<Release> {
        let Some(plugin) = self.find(ipam_type)? else {
            return Ok(Release::NothingToRelease);
        };

        debug!(plugin = %plugin.display(), "Executing IPAM DEL");
        self.exec(&plugin, "DEL", raw_config)
            .await
            .map_err(|reason| Error::AddressRelease {
                plugin: ipam_type.to_string(),
                reason,
            })?;
        Ok(Release::Released)
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Applies the address-delegate rules on top of an [`IpamPlugin`].
#[derive(Clone)]
pub struct IpamBridge {
    plugin: Arc<dyn IpamPlugin>,
}

impl IpamBridge {
    /// Wraps a plugin.
    pub fn new(plugin: Arc<dyn IpamPlugin>) -> Self {
        Self { plugin }
    }

    /// Rejects IPAM types that cannot work with a moved device.
    pub fn check_supported(ipam_type: &str) -> Result<()> {
        if is_unsupported_ipam(ipam_type) {
            return Err(Error::UnsupportedIpam(ipam_type.to_string()));
        }
        Ok(())
    }

    /// Obtains addressing for the container interface.
    pub async fn assign(&self, ipam_type: &str, raw_config: &[u8]) -> Result<AddressResult> {
        Self::check_supported(ipam_type)?;

        let mut result = self.plugin.add(ipam_type, raw_config).await?;
        if result.ips.is_empty() {
            return Err(Error::EmptyAddressResult {
                plugin: ipam_type.to_string(),
            });
        }
        result.bind_to_container_interface();

        info!(plugin = %ipam_type, addresses = result.ips.len(), "IPAM assigned addresses");
        Ok(result)
    }

    /// Releases addressing held for the container interface.
    pub async fn release(&self, ipam_type: &str, raw_config: &[u8]) -> Result<()> {
        Self::check_supported(ipam_type)?;
        if ipam_type.is_empty() {
            return Ok(());
        }

        match self.plugin.del(ipam_type, raw_config).await? {
            Release::Released => info!(plugin = %ipam_type, "IPAM released addresses"),
            Release::NothingToRelease => {
                warn!(plugin = %ipam_type, "IPAM plugin not found, nothing to release")
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pre_1_0_result() {
        let json = r#"{
            "cniVersion": "0.4.0",
            "ips": [{"version": "4", "address": "10.1.0.5/16", "gateway": "10.1.0.1", "interface": 3}],
            "routes": [{"dst": "0.0.0.0/0"}],
            "dns": {}
        }"#;
        let result: AddressResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.ips.len(), 1);
        assert_eq!(result.ips[0].interface, Some(3));
        assert_eq!(result.routes[0].gw, None);
    }

    #[test]
    fn test_encode_as_0_4_0_keeps_ip_version() {
        let json = r#"{
            "cniVersion": "0.4.0",
            "ips": [
                {"version": "4", "address": "10.1.0.5/16", "gateway": "10.1.0.1", "interface": 3},
                {"address": "fd00::5/64"}
            ]
        }"#;
        let mut result: AddressResult = serde_json::from_str(json).unwrap();

        result.encode_as("0.4.0");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["cniVersion"], "0.4.0");
        assert_eq!(value["ips"][0]["version"], "4");
        assert_eq!(value["ips"][1]["version"], "6");

        result.encode_as("1.0.0");
        let value = serde_json::to_value(&result).unwrap();
        assert!(value["ips"][0].get("version").is_none());
    }

    #[test]
    fn test_empty_dns_not_serialized() {
        let result = AddressResult {
            cni_version: "1.0.0".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("dns"));
        assert!(!json.contains("routes"));
    }

    #[test]
    fn test_find_rejects_path_like_type() {
        let ipam = ExecIpam::new(IpamEnv::default());
        assert!(ipam.find("../bin/sh").is_err());
        assert!(ipam.find("").is_err());
    }

    #[test]
    fn test_find_missing_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let ipam = ExecIpam::new(IpamEnv {
            path: dir.path().display().to_string(),
            ..Default::default()
        });
        assert_eq!(ipam.find("host-local").unwrap(), None);

        std::fs::write(dir.path().join("host-local"), b"").unwrap();
        assert_eq!(
            ipam.find("host-local").unwrap(),
            Some(dir.path().join("host-local"))
        );
    }

    #[test]
    fn test_unsupported_ipam_rejected() {
        assert!(matches!(
            IpamBridge::check_supported("dhcp"),
            Err(Error::UnsupportedIpam(_))
        ));
        assert!(IpamBridge::check_supported("host-local").is_ok());
        assert!(IpamBridge::check_supported("").is_ok());
    }
}
