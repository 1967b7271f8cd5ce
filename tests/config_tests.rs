//! Tests for network configuration and request construction.
//!
//! Builds a miniature sysfs tree with the PF/VF symlinks the kernel
//! creates, and checks that preconditions are enforced before it is read.

use std::collections::BTreeMap;
use std::os::unix::fs::symlink;
use std::path::Path;

use ib_sriov_cni::config::parse_cni_args;
use ib_sriov_cni::{AttachmentRequest, DetachRequest, Error, LinkState, NetConf, PciSysfs};
use serde_json::json;
use tempfile::TempDir;

const PF_PCI: &str = "0000:3b:00.0";
const VF_PCI: &str = "0000:3b:00.2";
const GUID: &str = "02:00:00:00:00:00:00:07";

/// Creates a sysfs tree with PF `ib0` and its VF 3 (`ib0v3`) bound to
/// `mlx5_core`.
fn fake_sysfs(root: &Path) -> PciSysfs {
    let devices = root.join("bus/pci/devices");
    let pf = devices.join(PF_PCI);
    let vf = devices.join(VF_PCI);
    let driver = root.join("bus/pci/drivers/mlx5_core");

    std::fs::create_dir_all(pf.join("net/ib0")).unwrap();
    std::fs::create_dir_all(vf.join("net/ib0v3")).unwrap();
    std::fs::create_dir_all(&driver).unwrap();
    std::fs::write(driver.join("bind"), b"").unwrap();
    std::fs::write(driver.join("unbind"), b"").unwrap();

    symlink(format!("../{PF_PCI}"), vf.join("physfn")).unwrap();
    symlink("../0000:3b:00.1", pf.join("virtfn0")).unwrap();
    symlink(format!("../{VF_PCI}"), pf.join("virtfn3")).unwrap();
    symlink("../../../../bus/pci/drivers/mlx5_core", vf.join("driver")).unwrap();

    PciSysfs::with_root(root)
}

fn raw_config(extra: serde_json::Value) -> Vec<u8> {
    let mut conf = json!({
        "cniVersion": "1.0.0",
        "name": "ib-net",
        "type": "ib-sriov",
        "deviceID": VF_PCI,
        "ipam": { "type": "host-local", "subnet": "10.56.217.0/24" }
    });
    if let (Some(base), Some(extra)) = (conf.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    serde_json::to_vec(&conf).unwrap()
}

fn prepared_args() -> BTreeMap<String, String> {
    parse_cni_args(&format!(
        "IgnoreUnknown=1;mellanox.infiniband.app=configured;guid={GUID}"
    ))
    .unwrap()
}

fn build(
    raw: &[u8],
    env_args: &BTreeMap<String, String>,
    sysfs: &PciSysfs,
) -> ib_sriov_cni::Result<AttachmentRequest> {
    AttachmentRequest::from_cni("c0ffee", "net1", "/var/run/netns/pod1", raw, env_args, sysfs)
}

// =============================================================================
// Sysfs Resolution Tests
// =============================================================================

#[test]
fn test_resolve_device_from_sysfs() {
    let dir = TempDir::new().unwrap();
    let sysfs = fake_sysfs(dir.path());

    let mut conf = NetConf::parse(&raw_config(json!({}))).unwrap();
    conf.resolve_device(&sysfs).unwrap();

    assert_eq!(conf.master.as_deref(), Some("ib0"));
    assert_eq!(conf.vf_id, Some(3));
    assert_eq!(conf.host_if_name.as_deref(), Some("ib0v3"));
}

#[test]
fn test_resolve_keeps_configured_names() {
    let dir = TempDir::new().unwrap();
    let sysfs = fake_sysfs(dir.path());

    let mut conf = NetConf::parse(&raw_config(json!({"master": "ib1"}))).unwrap();
    conf.resolve_device(&sysfs).unwrap();

    assert_eq!(conf.master.as_deref(), Some("ib1"));
    assert_eq!(conf.vf_id, Some(3));
}

#[test]
fn test_resolve_without_device_id_needs_all_names() {
    let sysfs = PciSysfs::with_root("/nonexistent");

    let mut conf = NetConf::default();
    assert!(matches!(
        conf.resolve_device(&sysfs),
        Err(Error::InvalidConfig(_))
    ));

    conf.master = Some("ib0".to_string());
    conf.vf_id = Some(1);
    conf.host_if_name = Some("ib0v1".to_string());
    conf.resolve_device(&sysfs).unwrap();
}

#[test]
fn test_rebind_writes_driver_files() {
    let dir = TempDir::new().unwrap();
    let sysfs = fake_sysfs(dir.path());

    assert_eq!(sysfs.driver(VF_PCI).unwrap().as_deref(), Some("mlx5_core"));
    sysfs.rebind(VF_PCI).unwrap();

    let driver = dir.path().join("bus/pci/drivers/mlx5_core");
    assert_eq!(std::fs::read_to_string(driver.join("unbind")).unwrap(), VF_PCI);
    assert_eq!(std::fs::read_to_string(driver.join("bind")).unwrap(), VF_PCI);
}

// =============================================================================
// Attachment Request Tests
// =============================================================================

#[test]
fn test_from_cni_builds_request() {
    let dir = TempDir::new().unwrap();
    let sysfs = fake_sysfs(dir.path());
    let raw = raw_config(json!({}));

    let request = build(&raw, &prepared_args(), &sysfs).unwrap();

    assert_eq!(request.container_id, "c0ffee");
    assert_eq!(request.if_name, "net1");
    assert_eq!(request.conf.guid.unwrap().to_string(), GUID);
    assert_eq!(request.conf.host_if_name.as_deref(), Some("ib0v3"));
    assert_eq!(request.raw_config, raw);
}

#[test]
fn test_config_args_take_precedence() {
    let dir = TempDir::new().unwrap();
    let sysfs = fake_sysfs(dir.path());
    let raw = raw_config(json!({
        "args": { "cni": { "guid": "02:00:00:00:00:00:00:99" } }
    }));

    let request = build(&raw, &prepared_args(), &sysfs).unwrap();

    assert_eq!(
        request.conf.guid.unwrap().to_string(),
        "02:00:00:00:00:00:00:99"
    );
}

#[test]
fn test_missing_annotation_rejected_before_sysfs() {
    // The sysfs root does not exist: reaching it would be a device error.
    let sysfs = PciSysfs::with_root("/nonexistent");
    let env_args = parse_cni_args(&format!("guid={GUID}")).unwrap();

    let err = build(&raw_config(json!({})), &env_args, &sysfs).unwrap_err();

    assert!(matches!(
        err,
        Error::AnnotationNotConfigured { found: None, .. }
    ));
    assert_eq!(err.cni_code(), 7);
}

#[test]
fn test_wrong_annotation_value_rejected() {
    let sysfs = PciSysfs::with_root("/nonexistent");
    let env_args =
        parse_cni_args(&format!("mellanox.infiniband.app=pending;guid={GUID}")).unwrap();

    let err = build(&raw_config(json!({})), &env_args, &sysfs).unwrap_err();

    match err {
        Error::AnnotationNotConfigured { found, .. } => {
            assert_eq!(found.as_deref(), Some("pending"))
        }
        other => panic!("expected AnnotationNotConfigured, got {other:?}"),
    }
}

#[test]
fn test_missing_guid_rejected() {
    let sysfs = PciSysfs::with_root("/nonexistent");
    let env_args = parse_cni_args("mellanox.infiniband.app=configured").unwrap();

    let err = build(&raw_config(json!({})), &env_args, &sysfs).unwrap_err();

    assert!(matches!(err, Error::MissingGuid));
}

#[test]
fn test_malformed_guid_rejected() {
    let sysfs = PciSysfs::with_root("/nonexistent");
    let env_args =
        parse_cni_args("mellanox.infiniband.app=configured;guid=02:00:00").unwrap();

    let err = build(&raw_config(json!({})), &env_args, &sysfs).unwrap_err();

    assert!(matches!(err, Error::InvalidGuid(_)));
}

#[test]
fn test_unsupported_version_rejected() {
    let sysfs = PciSysfs::with_root("/nonexistent");
    let raw = raw_config(json!({"cniVersion": "0.1.0"}));

    let err = build(&raw, &prepared_args(), &sysfs).unwrap_err();

    assert!(matches!(err, Error::UnsupportedVersion(_)));
    assert_eq!(err.cni_code(), 1);
}

#[test]
fn test_missing_environment_rejected() {
    let sysfs = PciSysfs::with_root("/nonexistent");
    let raw = raw_config(json!({}));

    let err = AttachmentRequest::from_cni("", "net1", "/ns", &raw, &prepared_args(), &sysfs)
        .unwrap_err();
    assert_eq!(err.cni_code(), 4);

    let err = AttachmentRequest::from_cni("c0ffee", "net1", "", &raw, &prepared_args(), &sysfs)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidEnvironment(_)));
}

#[test]
fn test_malformed_config_rejected() {
    let sysfs = PciSysfs::with_root("/nonexistent");

    let err = build(b"{not json", &prepared_args(), &sysfs).unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
}

// =============================================================================
// NetConf Encoding Tests
// =============================================================================

#[test]
fn test_netconf_field_names() {
    let mut conf = NetConf::parse(&raw_config(json!({"link_state": "enable"}))).unwrap();
    conf.host_if_name = Some("ib0v3".to_string());
    conf.host_if_guid = Some(GUID.parse().unwrap());

    assert_eq!(conf.link_state, Some(LinkState::Enable));

    let value = serde_json::to_value(&conf).unwrap();
    assert_eq!(value["deviceID"], VF_PCI);
    assert_eq!(value["hostIFNames"], "ib0v3");
    assert_eq!(value["hostIFGUID"], GUID);
    assert_eq!(value["link_state"], "enable");
    assert_eq!(value["ipam"]["type"], "host-local");
    assert_eq!(value["ipam"]["subnet"], "10.56.217.0/24");
}

#[test]
fn test_unknown_link_state_rejected() {
    let err = NetConf::parse(&raw_config(json!({"link_state": "up"}))).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

// =============================================================================
// Detach Request Tests
// =============================================================================

#[test]
fn test_detach_request_tolerates_bad_config() {
    let request = DetachRequest::from_cni("c0ffee", "net1", "/var/run/netns/pod1", b"garbage");

    assert!(request.conf.is_none());
    assert_eq!(
        request.netns.as_deref(),
        Some(Path::new("/var/run/netns/pod1"))
    );
}

#[test]
fn test_detach_request_empty_netns() {
    let request = DetachRequest::from_cni("c0ffee", "net1", "", &raw_config(json!({})));

    assert!(request.netns.is_none());
    assert_eq!(request.conf.unwrap().ipam.ipam_type, "host-local");
}
