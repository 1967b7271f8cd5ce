//! Tests for the lifecycle cache.
//!
//! Validates record layout, permissions, NotFound handling, idempotent
//! delete and key validation.

use std::os::unix::fs::PermissionsExt;

use chrono::Utc;
use ib_sriov_cni::{CacheRecord, Error, ErrorKind, NetConf, NetConfCache};
use serde_json::json;
use tempfile::TempDir;

fn record(container_id: &str, if_name: &str) -> CacheRecord {
    let raw = json!({
        "cniVersion": "1.0.0",
        "name": "ib-net",
        "type": "ib-sriov",
        "deviceID": "0000:3b:00.2",
        "ipam": { "type": "host-local" }
    });
    let mut conf: NetConf = serde_json::from_value(raw.clone()).unwrap();
    conf.master = Some("ib0".to_string());
    conf.vf_id = Some(3);
    conf.host_if_name = Some("ib0v3".to_string());
    conf.guid = Some("02:00:00:00:00:00:00:07".parse().unwrap());
    conf.host_if_guid = Some("1c:34:da:03:00:5e:3f:01".parse().unwrap());

    CacheRecord {
        container_id: container_id.to_string(),
        if_name: if_name.to_string(),
        conf,
        raw_config: raw,
        created_at: Utc::now(),
    }
}

// =============================================================================
// Save / Load Tests
// =============================================================================

#[test]
fn test_save_and_load_record() {
    let temp_dir = TempDir::new().unwrap();
    let cache = NetConfCache::new(temp_dir.path().join("ib-sriov"));
    let saved = record("c0ffee", "net1");

    let path = cache.save("c0ffee", "net1", &saved).unwrap();
    assert_eq!(path, temp_dir.path().join("ib-sriov").join("c0ffee-net1"));

    let (loaded, loaded_path) = cache.load("c0ffee", "net1").unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(loaded_path, path);
    assert_eq!(loaded.raw_config_bytes().unwrap(), serde_json::to_vec(&saved.raw_config).unwrap());
}

#[test]
fn test_save_creates_private_directory_and_file() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("nested").join("ib-sriov");
    let cache = NetConfCache::new(&dir);

    let path = cache.save("c0ffee", "net1", &record("c0ffee", "net1")).unwrap();

    let dir_mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
    let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(dir_mode, 0o700);
    assert_eq!(file_mode, 0o600);
}

#[test]
fn test_save_replaces_and_leaves_no_temp_files() {
    let temp_dir = TempDir::new().unwrap();
    let cache = NetConfCache::new(temp_dir.path());

    cache.save("c0ffee", "net1", &record("c0ffee", "net1")).unwrap();
    let mut updated = record("c0ffee", "net1");
    updated.conf.host_if_name = Some("ib0v7".to_string());
    cache.save("c0ffee", "net1", &updated).unwrap();

    let (loaded, _) = cache.load("c0ffee", "net1").unwrap();
    assert_eq!(loaded.conf.host_if_name.as_deref(), Some("ib0v7"));

    let names: Vec<_> = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["c0ffee-net1"]);
}

#[test]
fn test_keys_are_independent() {
    let temp_dir = TempDir::new().unwrap();
    let cache = NetConfCache::new(temp_dir.path());

    cache.save("c0ffee", "net1", &record("c0ffee", "net1")).unwrap();
    cache.save("c0ffee", "net2", &record("c0ffee", "net2")).unwrap();

    let (first, _) = cache.load("c0ffee", "net1").unwrap();
    let (second, _) = cache.load("c0ffee", "net2").unwrap();
    assert_eq!(first.if_name, "net1");
    assert_eq!(second.if_name, "net2");
}

// =============================================================================
// Missing and Corrupt Record Tests
// =============================================================================

#[test]
fn test_load_missing_record_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let cache = NetConfCache::new(temp_dir.path());

    let err = cache.load("c0ffee", "net1").unwrap_err();

    assert!(matches!(err, Error::CacheNotFound { .. }));
    assert!(err.is_not_found());
}

#[test]
fn test_load_corrupt_record_is_not_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let cache = NetConfCache::new(temp_dir.path());
    std::fs::write(temp_dir.path().join("c0ffee-net1"), b"{\"containerId\":").unwrap();

    let err = cache.load("c0ffee", "net1").unwrap_err();

    assert!(matches!(err, Error::CorruptCache { .. }));
    assert!(!err.is_not_found());
    assert_eq!(err.kind(), ErrorKind::Persistence);
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let cache = NetConfCache::new(temp_dir.path());
    let path = cache.save("c0ffee", "net1", &record("c0ffee", "net1")).unwrap();

    cache.delete(&path).unwrap();
    assert!(!path.exists());
    cache.delete(&path).unwrap();

    assert!(cache.load("c0ffee", "net1").unwrap_err().is_not_found());
}

// =============================================================================
// Key Validation Tests
// =============================================================================

#[test]
fn test_traversal_keys_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let cache = NetConfCache::new(temp_dir.path().join("cache"));
    let rec = record("x", "net1");

    for (container_id, if_name) in [("../etc", "net1"), ("c0ffee", "a/b"), ("", "net1")] {
        let err = cache.save(container_id, if_name, &rec).unwrap_err();
        assert!(
            matches!(err, Error::InvalidCacheKey(_)),
            "{container_id:?}/{if_name:?} accepted"
        );
    }
    assert!(!temp_dir.path().join("cache").exists(), "nothing written");
}
