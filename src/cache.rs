//! # Lifecycle Cache
//!
//! Persists what detach needs to reverse an attach: the resolved
//! configuration (PF, VF index, host netdev name, original GUID) and the raw
//! configuration passed to the IPAM plugin.
//!
//! ## Layout
//!
//! ```text
//! /var/lib/cni/ib-sriov/          (0700)
//! ├── 3f1c...e9-net1              (0600, one record per container/ifname)
//! └── 77ab...02-net2
//! ```
//!
//! ## Atomic Writes
//!
//! Records are written to a uniquely named temp file in the same directory
//! and renamed into place, so a crash never leaves a truncated record that
//! a later detach would fail to parse.
//!
//! ## Path Safety
//!
//! Both key components end up in a file name. Components that are empty or
//! contain `/`, `..` or NUL are rejected with [`Error::InvalidCacheKey`].

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AttachmentRequest, NetConf};
use crate::error::{Error, Result};

/// Saved state of one attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Container ID.
    pub container_id: String,
    /// Interface name inside the container.
    pub if_name: String,
    /// Configuration as resolved and applied by attach.
    pub conf: NetConf,
    /// Configuration as received, replayed to the IPAM plugin on release.
    #[serde(default)]
    pub raw_config: serde_json::Value,
    /// When the attach completed.
    pub created_at: DateTime<Utc>,
}

impl CacheRecord {
    /// Builds the record for a completed attach.
    ///
    /// `conf` is the configuration after the VF configurator ran, so it
    /// carries the original GUID and the current host netdev name.
    pub fn new(request: &AttachmentRequest, conf: NetConf) -> Result<Self> {
        Ok(Self {
            container_id: request.container_id.clone(),
            if_name: request.if_name.clone(),
            conf,
            raw_config: serde_json::from_slice(&request.raw_config)?,
            created_at: Utc::now(),
        })
    }

    /// Returns the raw configuration as bytes for the IPAM plugin.
    pub fn raw_config_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.raw_config)?)
    }
}

/// File-per-key store of [`CacheRecord`]s.
#[derive(Debug, Clone)]
pub struct NetConfCache {
    dir: PathBuf,
}

impl NetConfCache {
    /// Creates a cache rooted at `dir`. Nothing is created until the first
    /// save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the record path for a key.
    pub fn record_path(&self, container_id: &str, if_name: &str) -> Result<PathBuf> {
        validate_key(container_id)?;
        validate_key(if_name)?;
        Ok(self.dir.join(format!("{container_id}-{if_name}")))
    }

    /// Writes `record` under the key, replacing any previous record.
    pub fn save(&self, container_id: &str, if_name: &str, record: &CacheRecord) -> Result<PathBuf> {
        let path = self.record_path(container_id, if_name)?;
        let data = serde_json::to_vec_pretty(record)?;

        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .map_err(|e| cache_error(&self.dir, e))?;

        let temp_path = self
            .dir
            .join(format!(".{container_id}-{if_name}.tmp.{}", uuid::Uuid::now_v7()));
        write_new(&temp_path, &data).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            cache_error(&temp_path, e)
        })?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            cache_error(&path, e)
        })?;

        info!(path = %path.display(), "Saved attachment state");
        Ok(path)
    }

    /// Reads the record for a key.
    ///
    /// Returns [`Error::CacheNotFound`] if nothing was saved,
    /// [`Error::CorruptCache`] if the record does not parse, and
    /// [`Error::Cache`] if it cannot be read.
    pub fn load(&self, container_id: &str, if_name: &str) -> Result<(CacheRecord, PathBuf)> {
        let path = self.record_path(container_id, if_name)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::CacheNotFound { path });
            }
            Err(e) => return Err(cache_error(&path, e)),
        };

        let record = serde_json::from_slice(&data).map_err(|e| Error::CorruptCache {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        debug!(path = %path.display(), "Loaded attachment state");
        Ok((record, path))
    }

    /// Removes a record. A missing file is not an error.
    pub fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted attachment state");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cache_error(path, e)),
        }
    }
}

fn validate_key(component: &str) -> Result<()> {
    if component.is_empty()
        || component.contains('/')
        || component.contains('\0')
        || component.contains("..")
    {
        return Err(Error::InvalidCacheKey(component.to_string()));
    }
    Ok(())
}

fn write_new(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn cache_error(path: &Path, err: io::Error) -> Error {
    Error::Cache {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_path_layout() {
        let cache = NetConfCache::new("/var/lib/cni/ib-sriov");
        assert_eq!(
            cache.record_path("abc123", "net1").unwrap(),
            PathBuf::from("/var/lib/cni/ib-sriov/abc123-net1")
        );
    }

    #[test]
    fn test_rejects_traversal_keys() {
        let cache = NetConfCache::new("/tmp/cache");
        for bad in ["", "../etc", "a/b", "x\0y", ".."] {
            assert!(
                matches!(cache.record_path(bad, "net1"), Err(Error::InvalidCacheKey(_))),
                "accepted {bad:?}"
            );
            assert!(cache.record_path("abc", bad).is_err());
        }
    }
}
