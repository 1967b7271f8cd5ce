//! In-memory implementations of the capability traits.
//!
//! These implement [`DeviceOps`], [`VfConfigurator`] and [`IpamPlugin`]
//! without touching the host, so the lifecycle can be exercised in tests.
//! All three can share one [`Journal`] that records every mutating call in
//! order, and each can be told to fail a named operation.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use crate::config::{Guid, NetConf};
use crate::device::DeviceOps;
use crate::error::{Error, Result};
use crate::ipam::{AddressResult, IpConfig, IpamPlugin, Release};
use crate::netns::NetNs;
use crate::vf::VfConfigurator;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered record of calls across fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entry: String) {
        lock(&self.0).push(entry);
    }

    /// Returns all entries in call order.
    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Returns true if no call was recorded.
    pub fn is_empty(&self) -> bool {
        lock(&self.0).is_empty()
    }

    /// Forgets all entries.
    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

/// Operation names that should fail.
#[derive(Debug, Default)]
struct Failures(Mutex<HashSet<String>>);

impl Failures {
    fn insert(&self, op: &str) {
        lock(&self.0).insert(op.to_string());
    }

    fn remove(&self, op: &str) {
        lock(&self.0).remove(op);
    }

    fn check(&self, op: &str) -> Result<()> {
        if lock(&self.0).contains(op) {
            return Err(Error::CommandFailed {
                command: op.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Devices
// =============================================================================

#[derive(Debug, Default)]
struct Links {
    host: BTreeSet<String>,
    namespaces: BTreeMap<PathBuf, BTreeSet<String>>,
}

/// A fake [`DeviceOps`] tracking which links are in which namespace.
#[derive(Debug)]
pub struct FakeDevices {
    journal: Journal,
    links: Mutex<Links>,
    failures: Failures,
}

impl FakeDevices {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            links: Mutex::new(Links::default()),
            failures: Failures::default(),
        })
    }

    /// Adds a link to the host namespace.
    pub fn add_host_link(&self, name: &str) {
        lock(&self.links).host.insert(name.to_string());
    }

    /// Places a link directly in a namespace.
    pub fn add_namespace_link(&self, netns: impl Into<PathBuf>, name: &str) {
        lock(&self.links)
            .namespaces
            .entry(netns.into())
            .or_default()
            .insert(name.to_string());
    }

    /// Returns the links in the host namespace.
    pub fn host_links(&self) -> Vec<String> {
        lock(&self.links).host.iter().cloned().collect()
    }

    /// Returns the links in the namespace at `netns`.
    pub fn namespace_links(&self, netns: impl Into<PathBuf>) -> Vec<String> {
        lock(&self.links)
            .namespaces
            .get(&netns.into())
            .map(|links| links.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes `op` fail until [`FakeDevices::recover`] is called.
    pub fn fail(&self, op: &str) {
        self.failures.insert(op);
    }

    pub fn recover(&self, op: &str) {
        self.failures.remove(op);
    }
}

#[async_trait]
impl DeviceOps for FakeDevices {
    async fn exists(&self, netns: &NetNs, name: &str) -> Result<bool> {
        self.failures.check("exists")?;
        Ok(lock(&self.links)
            .namespaces
            .get(netns.path())
            .is_some_and(|links| links.contains(name)))
    }

    async fn move_to_namespace(
        &self,
        host_name: &str,
        netns: &NetNs,
        container_name: &str,
    ) -> Result<String> {
        self.journal
            .record(format!("move_to_namespace {host_name}->{container_name}"));
        self.failures.check("move_to_namespace")?;

        let mut links = lock(&self.links);
        if !links.host.remove(host_name) {
            return Err(Error::DeviceNotFound {
                name: host_name.to_string(),
            });
        }
        links
            .namespaces
            .entry(netns.path().to_path_buf())
            .or_default()
            .insert(container_name.to_string());
        Ok(container_name.to_string())
    }

    async fn move_to_host(
        &self,
        netns: &NetNs,
        container_name: &str,
        host_name: &str,
    ) -> Result<String> {
        self.journal
            .record(format!("move_to_host {container_name}->{host_name}"));
        self.failures.check("move_to_host")?;

        let mut links = lock(&self.links);
        let removed = links
            .namespaces
            .get_mut(netns.path())
            .is_some_and(|ns| ns.remove(container_name));
        if !removed {
            return Err(Error::DeviceNotFound {
                name: container_name.to_string(),
            });
        }
        links.host.insert(host_name.to_string());
        Ok(host_name.to_string())
    }

    async fn configure_addresses(
        &self,
        _netns: &NetNs,
        if_name: &str,
        result: &AddressResult,
    ) -> Result<()> {
        self.journal
            .record(format!("configure_addresses {if_name} {}", result.ips.len()));
        self.failures.check("configure_addresses")
    }
}

// =============================================================================
// VF configurator
// =============================================================================

/// A fake [`VfConfigurator`] holding the VF's current GUID.
#[derive(Debug)]
pub struct FakeVf {
    journal: Journal,
    guid: Mutex<Guid>,
    failures: Failures,
}

impl FakeVf {
    /// Creates a VF whose GUID is `factory_guid`.
    pub fn new(journal: Journal, factory_guid: Guid) -> Arc<Self> {
        Arc::new(Self {
            journal,
            guid: Mutex::new(factory_guid),
            failures: Failures::default(),
        })
    }

    /// Returns the GUID the VF currently has.
    pub fn current_guid(&self) -> Guid {
        *lock(&self.guid)
    }

    pub fn fail(&self, op: &str) {
        self.failures.insert(op);
    }

    pub fn recover(&self, op: &str) {
        self.failures.remove(op);
    }
}

#[async_trait]
impl VfConfigurator for FakeVf {
    async fn apply(&self, conf: &mut NetConf) -> Result<()> {
        self.journal.record("apply".to_string());
        self.failures.check("apply")?;

        if let Some(guid) = conf.guid {
            let mut current = lock(&self.guid);
            if conf.host_if_guid.is_none() {
                conf.host_if_guid = Some(*current);
            }
            *current = guid;
        }
        Ok(())
    }

    async fn reset(&self, conf: &NetConf) -> Result<()> {
        self.journal.record("reset".to_string());
        self.failures.check("reset")?;

        if let Some(original) = conf.host_if_guid {
            *lock(&self.guid) = original;
        }
        Ok(())
    }
}

// =============================================================================
// IPAM
// =============================================================================

/// A fake [`IpamPlugin`] returning a fixed result.
#[derive(Debug)]
pub struct FakeIpam {
    journal: Journal,
    result: Mutex<AddressResult>,
    leases: Mutex<BTreeSet<String>>,
    failures: Failures,
}

impl FakeIpam {
    /// Creates a plugin that hands out `10.56.217.2/24` on interface 2.
    pub fn new(journal: Journal) -> Arc<Self> {
        let result = AddressResult {
            cni_version: "1.0.0".to_string(),
            ips: "10.56.217.2/24"
                .parse::<IpNetwork>()
                .into_iter()
                .map(|address| IpConfig {
                    version: None,
                    address,
                    gateway: "10.56.217.1".parse().ok(),
                    interface: Some(2),
                })
                .collect(),
            ..Default::default()
        };
        Arc::new(Self {
            journal,
            result: Mutex::new(result),
            leases: Mutex::new(BTreeSet::new()),
            failures: Failures::default(),
        })
    }

    /// Replaces the result returned by `add`.
    pub fn set_result(&self, result: AddressResult) {
        *lock(&self.result) = result;
    }

    /// Returns the IPAM types currently holding a lease.
    pub fn leases(&self) -> Vec<String> {
        lock(&self.leases).iter().cloned().collect()
    }

    pub fn fail(&self, op: &str) {
        self.failures.insert(op);
    }

    pub fn recover(&self, op: &str) {
        self.failures.remove(op);
    }
}

#[async_trait]
impl IpamPlugin for FakeIpam {
    async fn add(&self, ipam_type: &str, _raw_config: &[u8]) -> Result<AddressResult> {
        self.journal.record(format!("ipam_add {ipam_type}"));
        self.failures
            .check("add")
            .map_err(|e| Error::AddressAssignment {
                plugin: ipam_type.to_string(),
                reason: e.to_string(),
            })?;

        lock(&self.leases).insert(ipam_type.to_string());
        Ok(lock(&self.result).clone())
    }

    async fn del(&self, ipam_type: &str, _raw_config: &[u8]) -> Result<Release> {
        self.journal.record(format!("ipam_del {ipam_type}"));
        self.failures
            .check("del")
            .map_err(|e| Error::AddressRelease {
                plugin: ipam_type.to_string(),
                reason: e.to_string(),
            })?;

        if lock(&self.leases).remove(ipam_type) {
            Ok(Release::Released)
        } else {
            Ok(Release::NothingToRelease)
        }
    }
}
