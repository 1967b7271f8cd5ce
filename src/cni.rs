//! # CNI Boundary
//!
//! Decodes an invocation from the `CNI_*` environment, dispatches it to the
//! lifecycle, and encodes what goes back on stdout.
//!
//! | Command   | Effect                                   | Stdout            |
//! |-----------|------------------------------------------|-------------------|
//! | `ADD`     | [`VfLifecycle::attach`]                  | CNI result        |
//! | `DEL`     | [`VfLifecycle::detach`]                  | nothing           |
//! | `CHECK`   | nothing                                  | nothing           |
//! | `VERSION` | nothing                                  | supported versions|
//!
//! Failures are printed as a CNI error object (see [`ErrorResult`]) and the
//! process exits non-zero.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::NetConfCache;
use crate::config::{AttachmentRequest, DetachRequest, NetConf, parse_cni_args};
use crate::constants::{DEFAULT_CACHE_DIR, DEFAULT_CNI_VERSION, SUPPORTED_CNI_VERSIONS};
use crate::device::LinkDevices;
use crate::error::{Error, Result};
use crate::ipam::{ExecIpam, IpamBridge, IpamEnv};
use crate::lifecycle::VfLifecycle;
use crate::sysfs::PciSysfs;
use crate::vf::SriovVfConfigurator;

// =============================================================================
// Invocation
// =============================================================================

/// `CNI_COMMAND` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            "VERSION" => Ok(Self::Version),
            other => Err(Error::InvalidEnvironment(format!(
                "unknown CNI_COMMAND '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
            Self::Check => "CHECK",
            Self::Version => "VERSION",
        })
    }
}

/// One plugin invocation as described by the `CNI_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Command,
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    pub args: String,
    pub path: String,
}

impl Invocation {
    /// Reads the invocation from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Reads the invocation through `get`. Only `CNI_COMMAND` is required
    /// here; per-command requirements are checked on dispatch.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let command = get("CNI_COMMAND")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidEnvironment("CNI_COMMAND is required".to_string()))?
            .parse::<Command>()?;

        Ok(Self {
            command,
            container_id: get("CNI_CONTAINERID").unwrap_or_default(),
            netns: get("CNI_NETNS").unwrap_or_default(),
            if_name: get("CNI_IFNAME").unwrap_or_default(),
            args: get("CNI_ARGS").unwrap_or_default(),
            path: get("CNI_PATH").unwrap_or_default(),
        })
    }

    fn require_key(&self) -> Result<()> {
        if self.container_id.is_empty() {
            return Err(Error::InvalidEnvironment("CNI_CONTAINERID is required".to_string()));
        }
        if self.if_name.is_empty() {
            return Err(Error::InvalidEnvironment("CNI_IFNAME is required".to_string()));
        }
        Ok(())
    }

    fn ipam_env(&self) -> IpamEnv {
        IpamEnv {
            container_id: self.container_id.clone(),
            netns: self.netns.clone(),
            if_name: self.if_name.clone(),
            args: self.args.clone(),
            path: self.path.clone(),
        }
    }
}

// =============================================================================
// Output
// =============================================================================

/// `VERSION` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl VersionInfo {
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            supported_versions: SUPPORTED_CNI_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// CNI error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResult {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorResult {
    /// Encodes `err`. `details` holds the chain of underlying causes.
    pub fn from_error(err: &Error, cni_version: &str) -> Self {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = std::error::Error::source(cause);
        }

        Self {
            cni_version: cni_version.to_string(),
            code: err.cni_code(),
            msg: err.to_string(),
            details: causes.join(": "),
        }
    }
}

/// Returns the version to encode output with, taken from the raw
/// configuration when it names a supported one.
pub fn output_version(raw_config: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(raw_config)
        .ok()
        .and_then(|v| v.get("cniVersion")?.as_str().map(str::to_string))
        .filter(|v| SUPPORTED_CNI_VERSIONS.contains(&v.as_str()))
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string())
}

// =============================================================================
// Dispatch
// =============================================================================

/// The plugin: builds the real capabilities and runs one command.
#[derive(Debug, Clone, Default)]
pub struct Plugin {
    sysfs: PciSysfs,
}

impl Plugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves VFs against a sysfs tree rooted elsewhere.
    pub fn with_sysfs(sysfs: PciSysfs) -> Self {
        Self { sysfs }
    }

    /// Runs `invocation` with `raw_config` from stdin. Returns the JSON to
    /// print, if the command produces any.
    pub async fn run(&self, invocation: &Invocation, raw_config: &[u8]) -> Result<Option<String>> {
        debug!(command = %invocation.command, container = %invocation.container_id, "CNI invocation");

        match invocation.command {
            Command::Add => self.add(invocation, raw_config).await.map(Some),
            Command::Del => self.del(invocation, raw_config).await.map(|()| None),
            Command::Check => {
                info!("CHECK is not implemented, reporting success");
                Ok(None)
            }
            Command::Version => {
                let info = VersionInfo::new(&output_version(raw_config));
                Ok(Some(serde_json::to_string(&info)?))
            }
        }
    }

    async fn add(&self, invocation: &Invocation, raw_config: &[u8]) -> Result<String> {
        invocation.require_key()?;
        let env_args: BTreeMap<String, String> = parse_cni_args(&invocation.args)?;

        let request = AttachmentRequest::from_cni(
            &invocation.container_id,
            &invocation.if_name,
            &invocation.netns,
            raw_config,
            &env_args,
            &self.sysfs,
        )?;

        let lifecycle = self.lifecycle(invocation, request.conf.cache_dir());
        let result = lifecycle.attach(&request).await?;
        Ok(serde_json::to_string(&result)?)
    }

    async fn del(&self, invocation: &Invocation, raw_config: &[u8]) -> Result<()> {
        invocation.require_key()?;
        let request = DetachRequest::from_cni(
            &invocation.container_id,
            &invocation.if_name,
            &invocation.netns,
            raw_config,
        );

        let cache_dir = request
            .conf
            .as_ref()
            .map(|conf| conf.cache_dir().to_path_buf())
            .unwrap_or_else(|| DEFAULT_CACHE_DIR.into());
        self.lifecycle(invocation, &cache_dir).detach(&request).await
    }

    fn lifecycle(&self, invocation: &Invocation, cache_dir: &std::path::Path) -> VfLifecycle {
        VfLifecycle::new(
            Arc::new(LinkDevices::new()),
            Arc::new(SriovVfConfigurator::new(self.sysfs.clone())),
            IpamBridge::new(Arc::new(ExecIpam::new(invocation.ipam_env()))),
            NetConfCache::new(cache_dir),
        )
    }
}

/// Reads logging settings from a configuration that may not parse.
pub fn log_settings(raw_config: &[u8]) -> (Option<String>, Option<std::path::PathBuf>) {
    match NetConf::parse(raw_config) {
        Ok(conf) => (conf.log_level, conf.log_file),
        Err(_) => (None, None),
    }
}
