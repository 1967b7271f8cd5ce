//! Tests for constants module.
//!
//! Validates protocol constants against what runtimes and ib-kubernetes
//! expect.

use ib_sriov_cni::config::MAX_IFNAME_LEN;
use ib_sriov_cni::constants::*;
use std::time::Duration;

// =============================================================================
// Protocol Tests
// =============================================================================

#[test]
fn test_default_version_is_supported() {
    assert!(is_supported_version(DEFAULT_CNI_VERSION));
    assert!(!is_supported_version(""));
    assert!(!is_supported_version("0.2.0"));
}

#[test]
fn test_annotation_keys() {
    assert_eq!(INFINIBAND_ANNOTATION, "mellanox.infiniband.app");
    assert_eq!(CONFIGURED_INFINIBAND, "configured");
    assert_eq!(GUID_ARG, "guid");
}

#[test]
fn test_only_dhcp_is_rejected() {
    assert!(is_unsupported_ipam("dhcp"));
    assert!(!is_unsupported_ipam("host-local"));
    assert!(!is_unsupported_ipam("whereabouts"));
    assert!(!is_unsupported_ipam(""));
}

// =============================================================================
// Limit Tests
// =============================================================================

#[test]
fn test_temp_link_name_fits_ifnamsiz() {
    let longest = format!("{TEMP_LINK_PREFIX}{}", u32::MAX);
    assert!(longest.len() <= MAX_IFNAME_LEN);
}

#[test]
fn test_ipam_timeout_reasonable() {
    assert!(IPAM_EXEC_TIMEOUT >= Duration::from_secs(10));
    assert!(IPAM_EXEC_TIMEOUT <= Duration::from_secs(300));
}

#[test]
fn test_container_interface_index() {
    assert_eq!(CONTAINER_INTERFACE_INDEX, 0);
}
