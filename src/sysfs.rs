//! PCI sysfs access for SR-IOV virtual functions.
//!
//! Resolves the names the configurator needs from the VF's PCI address
//! (`deviceID` in the network configuration) and rebinds the VF driver.
//!
//! ```text
//! /sys/bus/pci/devices/0000:3b:00.2/
//! ├── driver  -> ../../../bus/pci/drivers/mlx5_core
//! ├── net/ib1/                          (VF netdev)
//! └── physfn  -> ../0000:3b:00.0
//!                 ├── net/ib0/          (PF netdev)
//!                 ├── virtfn0 -> ../0000:3b:00.1
//!                 └── virtfn1 -> ../0000:3b:00.2
//! ```
//!
//! The root is configurable so tests can build a fake tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::constants::{DEFAULT_SYSFS_ROOT, PCI_DEVICES_DIR, PCI_DRIVERS_DIR};
use crate::error::{Error, Result};

/// PCI address format: `0000:3b:00.2`.
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("PCI address regex is valid")
});

/// Validates PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// View of the PCI part of sysfs.
#[derive(Debug, Clone)]
pub struct PciSysfs {
    root: PathBuf,
}

impl Default for PciSysfs {
    fn default() -> Self {
        Self::new()
    }
}

impl PciSysfs {
    /// Uses the real sysfs mount.
    pub fn new() -> Self {
        Self::with_root(DEFAULT_SYSFS_ROOT)
    }

    /// Uses a sysfs tree rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the sysfs root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_path(&self, pci: &str) -> Result<PathBuf> {
        if !is_valid_pci_address(pci) {
            return Err(Error::InvalidConfig(format!(
                "invalid PCI address '{pci}' (expected: 0000:3b:00.2)"
            )));
        }
        let path = self.root.join(PCI_DEVICES_DIR).join(pci);
        if !path.exists() {
            return Err(Error::DeviceNotFound {
                name: pci.to_string(),
            });
        }
        Ok(path)
    }

    /// Returns the netdev name of the physical function owning `vf_pci`.
    pub fn pf_name(&self, vf_pci: &str) -> Result<String> {
        let net_dir = self.device_path(vf_pci)?.join("physfn").join("net");
        first_entry(&net_dir)?.ok_or_else(|| Error::DeviceNotFound {
            name: format!("physical function of {vf_pci}"),
        })
    }

    /// Returns the VF index of `vf_pci` on its physical function.
    pub fn vf_index(&self, vf_pci: &str) -> Result<u32> {
        let physfn = self.device_path(vf_pci)?.join("physfn");
        let entries = fs::read_dir(&physfn).map_err(|e| sysfs_error(&physfn, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| sysfs_error(&physfn, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(index) = name.strip_prefix("virtfn") else {
                continue;
            };
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            if target.file_name().is_some_and(|n| n == vf_pci) {
                return index.parse().map_err(|_| {
                    Error::Internal(format!("malformed virtfn link name '{name}'"))
                });
            }
        }

        Err(Error::DeviceNotFound {
            name: format!("VF index of {vf_pci}"),
        })
    }

    /// Returns the host-side netdev name of `vf_pci`.
    pub fn vf_netdev(&self, vf_pci: &str) -> Result<String> {
        let net_dir = self.device_path(vf_pci)?.join("net");
        first_entry(&net_dir)?.ok_or_else(|| Error::DeviceNotFound {
            name: format!("netdev of {vf_pci}"),
        })
    }

    /// Returns the driver currently bound to `pci`, if any.
    pub fn driver(&self, pci: &str) -> Result<Option<String>> {
        let link = self.device_path(pci)?.join("driver");
        match fs::read_link(&link) {
            Ok(target) => Ok(target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(sysfs_error(&link, e)),
        }
    }

    /// Unbinds `pci` from its driver and binds it again.
    ///
    /// The mlx5 driver only picks up a new node/port GUID on probe.
    pub fn rebind(&self, pci: &str) -> Result<()> {
        let driver = self.driver(pci)?.ok_or_else(|| Error::DeviceNotFound {
            name: format!("driver of {pci}"),
        })?;
        let driver_dir = self.root.join(PCI_DRIVERS_DIR).join(&driver);

        debug!(address = %pci, driver = %driver, "Rebinding VF driver");

        let unbind = driver_dir.join("unbind");
        fs::write(&unbind, pci).map_err(|e| sysfs_error(&unbind, e))?;

        let bind = driver_dir.join("bind");
        fs::write(&bind, pci).map_err(|e| sysfs_error(&bind, e))?;

        Ok(())
    }
}

/// Returns the lexically first entry of a directory, if any.
fn first_entry(dir: &Path) -> Result<Option<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(sysfs_error(dir, e)),
    };

    let mut names = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names.into_iter().next())
}

fn sysfs_error(path: &Path, source: io::Error) -> Error {
    Error::Sysfs {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_address_validation() {
        assert!(is_valid_pci_address("0000:3b:00.2"));
        assert!(is_valid_pci_address("ABCD:12:34.5"));

        assert!(!is_valid_pci_address("3b:00.2"));
        assert!(!is_valid_pci_address("0000:3b:00"));
        assert!(!is_valid_pci_address("0000:3b:00.8"));
        assert!(!is_valid_pci_address("../../etc"));
    }

    #[test]
    fn test_invalid_address_is_config_error() {
        let sysfs = PciSysfs::with_root("/nonexistent");
        let err = sysfs.vf_netdev("bogus").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_device_is_not_found() {
        let sysfs = PciSysfs::with_root("/nonexistent");
        let err = sysfs.vf_netdev("0000:3b:00.2").unwrap_err();
        assert!(err.is_not_found());
    }
}
