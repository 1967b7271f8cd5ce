//! # Plugin Constants
//!
//! Annotation keys, well-known paths, protocol versions and timeouts.

use std::time::Duration;

// =============================================================================
// Device Preparation Annotation
// =============================================================================

/// CNI argument set by ib-kubernetes once it has prepared the VF.
pub const INFINIBAND_ANNOTATION: &str = "mellanox.infiniband.app";

/// Required value of [`INFINIBAND_ANNOTATION`].
pub const CONFIGURED_INFINIBAND: &str = "configured";

/// CNI argument carrying the GUID to assign to the VF.
pub const GUID_ARG: &str = "guid";

// =============================================================================
// Address Assignment
// =============================================================================

/// IPAM plugin types that cannot work once the device leaves the host
/// namespace.
pub const UNSUPPORTED_IPAM_TYPES: &[&str] = &["dhcp"];

/// Upper bound on a single IPAM plugin invocation.
pub const IPAM_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Interface index every IPAM address is attached to. The result carries
/// exactly one interface: the container-side VF.
pub const CONTAINER_INTERFACE_INDEX: usize = 0;

// =============================================================================
// Paths
// =============================================================================

/// Default directory holding cached network configurations.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/cni/ib-sriov";

/// Default sysfs mount point.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// PCI devices directory, relative to the sysfs root.
pub const PCI_DEVICES_DIR: &str = "bus/pci/devices";

/// PCI drivers directory, relative to the sysfs root.
pub const PCI_DRIVERS_DIR: &str = "bus/pci/drivers";

/// Prefix for the intermediate link name used while moving a VF.
///
/// Linux interface names are limited to 15 bytes; `tmp` plus an ifindex
/// always fits.
pub const TEMP_LINK_PREFIX: &str = "tmp";

// =============================================================================
// Protocol
// =============================================================================

/// CNI versions this plugin can consume and produce.
pub const SUPPORTED_CNI_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// CNI version used when the request does not name a supported one.
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// Environment variable overriding the log filter.
pub const LOG_ENV: &str = "IB_SRIOV_CNI_LOG";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Returns true if `version` is one of [`SUPPORTED_CNI_VERSIONS`].
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_CNI_VERSIONS.contains(&version)
}

/// Returns true if the IPAM type is explicitly rejected.
pub fn is_unsupported_ipam(ipam_type: &str) -> bool {
    UNSUPPORTED_IPAM_TYPES.contains(&ipam_type)
}
