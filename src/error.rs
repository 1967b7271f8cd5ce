//! Error types for the attach/detach lifecycle.
//!
//! Every variant belongs to one [`ErrorKind`], which drives both the
//! rollback policy of the state machine and the CNI error code reported to
//! the container runtime.

use std::path::PathBuf;

use crate::lifecycle::AttachState;

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing input. Raised before anything is mutated.
    Validation,
    /// Device, namespace or kernel call failure.
    Device,
    /// Address-assignment delegate failure.
    Delegate,
    /// Cache save/load/delete failure.
    Persistence,
    /// Everything else.
    Internal,
}

/// Errors that can occur while attaching or detaching a VF.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Malformed or inconsistent network configuration.
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    /// Required invocation environment variable missing or malformed.
    #[error("invalid CNI environment: {0}")]
    InvalidEnvironment(String),

    /// Device-preparation annotation missing or not `configured`.
    #[error(
        "InfiniBand status \"{key}\" is {found:?}, expected \"configured\"; \
         check that the device was prepared by ib-kubernetes"
    )]
    AnnotationNotConfigured { key: String, found: Option<String> },

    /// No GUID supplied with the request.
    #[error("no guid found in CNI args; check that the device was prepared by ib-kubernetes")]
    MissingGuid,

    /// GUID not in `xx:xx:xx:xx:xx:xx:xx:xx` form.
    #[error("invalid guid '{0}'")]
    InvalidGuid(String),

    /// IPAM type rejected by this plugin.
    #[error("ipam type {0} is not supported")]
    UnsupportedIpam(String),

    /// Requested CNI version not supported.
    #[error("unsupported CNI version '{0}'")]
    UnsupportedVersion(String),

    /// Cache key component would escape the cache directory.
    #[error("invalid cache key '{0}'")]
    InvalidCacheKey(String),

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// Link not present where it was expected.
    #[error("device '{name}' not found")]
    DeviceNotFound { name: String },

    /// Namespace path does not exist (node restart, sandbox gone).
    #[error("network namespace {0} does not exist")]
    NamespaceNotFound(PathBuf),

    /// Namespace could not be opened or entered.
    #[error("network namespace {path} unavailable: {reason}")]
    NamespaceUnavailable { path: PathBuf, reason: String },

    /// External command (ip, ...) failed.
    #[error("command '{command}' failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// Sysfs read or write failed.
    #[error("sysfs access at {path} failed: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Delegate Errors
    // =========================================================================
    /// IPAM ADD failed.
    #[error("failed to set up IPAM plugin type '{plugin}': {reason}")]
    AddressAssignment { plugin: String, reason: String },

    /// IPAM ADD reported success with no addresses.
    #[error("IPAM plugin '{plugin}' returned missing IP config")]
    EmptyAddressResult { plugin: String },

    /// IPAM DEL failed.
    #[error("failed to release addresses from IPAM plugin type '{plugin}': {reason}")]
    AddressRelease { plugin: String, reason: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// No cache record for the key.
    #[error("no cached configuration at {path}")]
    CacheNotFound { path: PathBuf },

    /// Cache read, write, or delete failed.
    #[error("cache operation on {path} failed: {reason}")]
    Cache { path: PathBuf, reason: String },

    /// Cache record exists but does not parse.
    #[error("corrupt cache record at {path}: {reason}")]
    CorruptCache { path: PathBuf, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Attach failed and completed steps were unwound.
    #[error(
        "attach of '{ifname}' failed in state {state}{}",
        format_rollback(.rollback)
    )]
    AttachFailed {
        state: AttachState,
        ifname: String,
        #[source]
        source: Box<Error>,
        rollback: Vec<Error>,
    },

    /// One or more independent detach steps failed.
    #[error("detach of '{ifname}' incomplete: {}", join_errors(.errors))]
    DetachIncomplete { ifname: String, errors: Vec<Error> },

    // =========================================================================
    // I/O and Internal Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding or encoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_rollback(rollback: &[Error]) -> String {
    if rollback.is_empty() {
        String::new()
    } else {
        format!(" (rollback errors: {})", join_errors(rollback))
    }
}

impl Error {
    /// Returns the category of this error.
    ///
    /// Lifecycle wrappers report the category of the failure they wrap, so
    /// an attach that failed on a device call is still a device error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_)
            | Self::InvalidEnvironment(_)
            | Self::AnnotationNotConfigured { .. }
            | Self::MissingGuid
            | Self::InvalidGuid(_)
            | Self::UnsupportedIpam(_)
            | Self::UnsupportedVersion(_)
            | Self::InvalidCacheKey(_) => ErrorKind::Validation,

            Self::DeviceNotFound { .. }
            | Self::NamespaceNotFound(_)
            | Self::NamespaceUnavailable { .. }
            | Self::CommandFailed { .. }
            | Self::Sysfs { .. } => ErrorKind::Device,

            Self::AddressAssignment { .. }
            | Self::EmptyAddressResult { .. }
            | Self::AddressRelease { .. } => ErrorKind::Delegate,

            Self::CacheNotFound { .. } | Self::Cache { .. } | Self::CorruptCache { .. } => {
                ErrorKind::Persistence
            }

            Self::AttachFailed { source, .. } => source.kind(),
            Self::DetachIncomplete { errors, .. } => errors
                .first()
                .map_or(ErrorKind::Internal, Error::kind),

            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the CNI error code for this error.
    ///
    /// Codes below 100 are reserved by CNI itself.
    pub fn cni_code(&self) -> u32 {
        match self {
            Self::InvalidEnvironment(_) => 4,
            Self::Io(_) => 5,
            Self::Serialization(_) => 6,
            Self::UnsupportedVersion(_) => 1,
            _ => match self.kind() {
                ErrorKind::Validation => 7,
                ErrorKind::Device => 100,
                ErrorKind::Delegate => 101,
                ErrorKind::Persistence => 102,
                ErrorKind::Internal => 999,
            },
        }
    }

    /// Returns true if this error means the target is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. } | Self::NamespaceNotFound(_) | Self::CacheNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
