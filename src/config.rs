//! Network configuration and request construction.
//!
//! The container runtime hands the plugin a JSON network configuration on
//! stdin and the per-container arguments in the environment. This module
//! turns those into the validated records the lifecycle consumes:
//!
//! - [`NetConf`]: the network configuration, extended with the VF names
//!   resolved from sysfs and the GUID saved by the configurator.
//! - [`AttachmentRequest`]: everything an attach needs, validated.
//! - [`DetachRequest`]: the detach arguments, which may lack a usable
//!   configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    is_supported_version, CONFIGURED_INFINIBAND, DEFAULT_CACHE_DIR, DEFAULT_CNI_VERSION,
    GUID_ARG, INFINIBAND_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::sysfs::PciSysfs;

/// Maximum Linux interface name length (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

// =============================================================================
// GUID
// =============================================================================

/// 64-bit InfiniBand GUID, written `xx:xx:xx:xx:xx:xx:xx:xx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Guid([u8; 8]);

impl Guid {
    /// Creates a GUID from raw bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Extracts the GUID from an IPoIB hardware address.
    ///
    /// IPoIB addresses are 20 bytes: 4 bytes of flags/QPN followed by the
    /// 16-byte GID, whose last 8 bytes are the port GUID.
    pub fn from_hardware_addr(addr: &[u8]) -> Option<Self> {
        if addr.len() < 8 {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&addr[addr.len() - 8..]);
        Some(Self(bytes))
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 8 {
            return Err(Error::InvalidGuid(s.to_string()));
        }

        let mut bytes = [0u8; 8];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(Error::InvalidGuid(s.to_string()));
            }
            let decoded = hex::decode(part).map_err(|_| Error::InvalidGuid(s.to_string()))?;
            *byte = decoded[0];
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self
            .0
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");
        f.write_str(&hex)
    }
}

impl TryFrom<String> for Guid {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Guid> for String {
    fn from(guid: Guid) -> Self {
        guid.to_string()
    }
}

// =============================================================================
// Link State
// =============================================================================

/// Administrative VF link state as seen by the PF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Follow the PF link.
    Auto,
    /// Always up.
    Enable,
    /// Always down.
    Disable,
}

impl LinkState {
    /// Keyword accepted by `ip link set ... vf N state`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Enable => "enable",
            Self::Disable => "disable",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Network Configuration
// =============================================================================

/// `ipam` section of the network configuration.
///
/// Only `type` is interpreted; everything else belongs to the IPAM plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamConfig {
    /// IPAM plugin binary name. Empty means no address assignment.
    #[serde(rename = "type", default)]
    pub ipam_type: String,
    /// Plugin-specific settings.
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// `args` section of the network configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetConfArgs {
    /// Arguments injected by the orchestrator (annotations, guid).
    #[serde(default)]
    pub cni: BTreeMap<String, serde_json::Value>,
}

/// Network configuration for an InfiniBand SR-IOV attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI version requested by the runtime.
    #[serde(default)]
    pub cni_version: String,
    /// Network name.
    #[serde(default)]
    pub name: String,
    /// Plugin type.
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// PCI address of the VF, injected by the device plugin.
    #[serde(rename = "deviceID", default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    /// Physical function netdev name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    /// VF index on the PF.
    #[serde(rename = "vfID", default, skip_serializing_if = "Option::is_none")]
    pub vf_id: Option<u32>,
    /// VF netdev name in the host namespace.
    #[serde(rename = "hostIFNames", default, skip_serializing_if = "Option::is_none")]
    pub host_if_name: Option<String>,
    /// VF GUID before the plugin changed it.
    #[serde(rename = "hostIFGUID", default, skip_serializing_if = "Option::is_none")]
    pub host_if_guid: Option<Guid>,
    /// GUID to assign to the VF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Guid>,
    /// VF link state to apply.
    #[serde(rename = "link_state", default, skip_serializing_if = "Option::is_none")]
    pub link_state: Option<LinkState>,
    /// Address assignment.
    #[serde(default)]
    pub ipam: IpamConfig,
    /// Orchestrator-supplied arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<NetConfArgs>,
    /// Directory holding cached configurations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Append logs to this file instead of stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl NetConf {
    /// Parses a network configuration.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Looks up a CNI argument, preferring `args.cni` over `CNI_ARGS`.
    pub fn cni_arg(&self, env_args: &BTreeMap<String, String>, key: &str) -> Option<String> {
        let from_conf = self
            .args
            .as_ref()
            .and_then(|a| a.cni.get(key))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        from_conf.or_else(|| env_args.get(key).cloned())
    }

    /// Returns the CNI version results are encoded with.
    pub fn result_version(&self) -> &str {
        if is_supported_version(&self.cni_version) {
            &self.cni_version
        } else {
            DEFAULT_CNI_VERSION
        }
    }

    /// Returns the configured cache directory.
    pub fn cache_dir(&self) -> &Path {
        self.cache_dir
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_CACHE_DIR))
    }

    /// Returns the PF name, failing if it was never resolved.
    pub fn master(&self) -> Result<&str> {
        self.master
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("master device not resolved".to_string()))
    }

    /// Returns the VF index, failing if it was never resolved.
    pub fn vf_id(&self) -> Result<u32> {
        self.vf_id
            .ok_or_else(|| Error::InvalidConfig("VF index not resolved".to_string()))
    }

    /// Returns the host-side VF name, failing if it was never resolved.
    pub fn host_if_name(&self) -> Result<&str> {
        self.host_if_name
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("VF netdev name not resolved".to_string()))
    }

    /// Fills in PF name, VF index and VF netdev from the VF's PCI address.
    ///
    /// Values already present in the configuration are kept.
    pub fn resolve_device(&mut self, sysfs: &PciSysfs) -> Result<()> {
        if self.device_id.is_empty() {
            if self.master.is_some() && self.vf_id.is_some() && self.host_if_name.is_some() {
                return Ok(());
            }
            return Err(Error::InvalidConfig(
                "VF pci addr is required (deviceID)".to_string(),
            ));
        }

        if self.master.is_none() {
            self.master = Some(sysfs.pf_name(&self.device_id)?);
        }
        if self.vf_id.is_none() {
            self.vf_id = Some(sysfs.vf_index(&self.device_id)?);
        }
        if self.host_if_name.is_none() {
            self.host_if_name = Some(sysfs.vf_netdev(&self.device_id)?);
        }

        debug!(
            device = %self.device_id,
            master = ?self.master,
            vf = ?self.vf_id,
            netdev = ?self.host_if_name,
            "Resolved VF from sysfs"
        );
        Ok(())
    }
}

/// Parses `CNI_ARGS` (`K=V;K=V`).
pub fn parse_cni_args(args: &str) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for pair in args.split(';').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::InvalidEnvironment(format!("invalid CNI_ARGS pair '{pair}'")))?;
        parsed.insert(key.to_string(), value.to_string());
    }
    Ok(parsed)
}

fn validate_ifname(ifname: &str) -> Result<()> {
    if ifname.is_empty() || ifname.len() > MAX_IFNAME_LEN {
        return Err(Error::InvalidEnvironment(format!(
            "interface name '{ifname}' must be 1-{MAX_IFNAME_LEN} bytes"
        )));
    }
    if ifname.contains(['/', ' ', ':']) || ifname == "." || ifname == ".." {
        return Err(Error::InvalidEnvironment(format!(
            "interface name '{ifname}' contains invalid characters"
        )));
    }
    Ok(())
}

// =============================================================================
// Attachment Request
// =============================================================================

/// Validated input of an attach.
#[derive(Debug, Clone)]
pub struct AttachmentRequest {
    /// Container ID.
    pub container_id: String,
    /// Interface name inside the container.
    pub if_name: String,
    /// Path to the target network namespace.
    pub netns: PathBuf,
    /// Network configuration with the VF resolved and the GUID set.
    pub conf: NetConf,
    /// Configuration exactly as received, passed on to the IPAM plugin.
    pub raw_config: Vec<u8>,
}

impl AttachmentRequest {
    /// Builds a request from the runtime's inputs.
    ///
    /// The preparation annotation and the GUID are checked before sysfs is
    /// touched.
    pub fn from_cni(
        container_id: &str,
        if_name: &str,
        netns: &str,
        raw_config: &[u8],
        env_args: &BTreeMap<String, String>,
        sysfs: &PciSysfs,
    ) -> Result<Self> {
        if container_id.is_empty() {
            return Err(Error::InvalidEnvironment("CNI_CONTAINERID is required".to_string()));
        }
        if netns.is_empty() {
            return Err(Error::InvalidEnvironment("CNI_NETNS is required".to_string()));
        }
        validate_ifname(if_name)?;

        let mut conf = NetConf::parse(raw_config)?;
        if !conf.cni_version.is_empty() && !is_supported_version(&conf.cni_version) {
            return Err(Error::UnsupportedVersion(conf.cni_version));
        }

        let status = conf.cni_arg(env_args, INFINIBAND_ANNOTATION);
        if status.as_deref() != Some(CONFIGURED_INFINIBAND) {
            return Err(Error::AnnotationNotConfigured {
                key: INFINIBAND_ANNOTATION.to_string(),
                found: status,
            });
        }

        let guid = conf.cni_arg(env_args, GUID_ARG).ok_or(Error::MissingGuid)?;
        conf.guid = Some(guid.parse()?);

        conf.resolve_device(sysfs)?;

        Ok(Self {
            container_id: container_id.to_string(),
            if_name: if_name.to_string(),
            netns: PathBuf::from(netns),
            conf,
            raw_config: raw_config.to_vec(),
        })
    }
}

// =============================================================================
// Detach Request
// =============================================================================

/// Input of a detach.
#[derive(Debug, Clone)]
pub struct DetachRequest {
    /// Container ID.
    pub container_id: String,
    /// Interface name inside the container.
    pub if_name: String,
    /// Namespace path; `None` when the runtime passed none.
    pub netns: Option<PathBuf>,
    /// Configuration as received for this call.
    pub raw_config: Vec<u8>,
    /// The received configuration, if it parses.
    pub conf: Option<NetConf>,
}

impl DetachRequest {
    /// Builds a request from the runtime's inputs.
    ///
    /// An unparseable configuration is not an error here: detach must be
    /// able to run on cached state alone.
    pub fn from_cni(container_id: &str, if_name: &str, netns: &str, raw_config: &[u8]) -> Self {
        let conf = NetConf::parse(raw_config).ok();
        Self {
            container_id: container_id.to_string(),
            if_name: if_name.to_string(),
            netns: (!netns.is_empty()).then(|| PathBuf::from(netns)),
            raw_config: raw_config.to_vec(),
            conf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_display_is_lowercase() {
        let guid: Guid = "02:00:00:00:AB:CD:EF:01".parse().unwrap();
        assert_eq!(guid.to_string(), "02:00:00:00:ab:cd:ef:01");
    }

    #[test]
    fn test_guid_rejects_malformed() {
        for bad in [
            "",
            "02:00:00:00:00:00:00",
            "02:00:00:00:00:00:00:00:00",
            "0200:00:00:00:00:00:00",
            "zz:00:00:00:00:00:00:00",
            "2:00:00:00:00:00:00:000",
        ] {
            assert!(bad.parse::<Guid>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_guid_from_ipoib_hardware_addr() {
        let addr = [
            0x80, 0x00, 0x00, 0x48, 0xfe, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1c, 0x34,
            0xda, 0x03, 0x00, 0x5e, 0x3f, 0x01,
        ];
        let guid = Guid::from_hardware_addr(&addr).unwrap();
        assert_eq!(guid.to_string(), "1c:34:da:03:00:5e:3f:01");
        assert!(Guid::from_hardware_addr(&addr[..4]).is_none());
    }

    #[test]
    fn test_parse_cni_args() {
        let args = parse_cni_args("IgnoreUnknown=1;guid=02:00:00:00:00:00:00:01").unwrap();
        assert_eq!(args.get("IgnoreUnknown").map(String::as_str), Some("1"));
        assert_eq!(
            args.get("guid").map(String::as_str),
            Some("02:00:00:00:00:00:00:01")
        );
        assert!(parse_cni_args("").unwrap().is_empty());
        assert!(parse_cni_args("novalue").is_err());
    }

    #[test]
    fn test_ifname_validation() {
        assert!(validate_ifname("net1").is_ok());
        assert!(validate_ifname("").is_err());
        assert!(validate_ifname("a-very-long-ifname").is_err());
        assert!(validate_ifname("../x").is_err());
    }
}
