//! # Attachment State Machine
//!
//! Drives one VF through attach and detach for a (container, interface)
//! key.
//!
//! ## Attach
//!
//! ```text
//!   Initial ──apply──▶ DeviceConfigured ──move──▶ NamespaceAttached
//!      │                    │                          │ assign + configure
//!      │                    │                          ▼
//!      │                    │                   AddressAssigned ──save──▶ Persisted
//!      └────────────────────┴──────────────────────────┴──▶ Failed
//! ```
//!
//! Each completed step registers its compensating action in a rollback
//! table. A failure unwinds the table in strict reverse order; an undo step
//! that fails is logged and collected, and the remaining steps still run.
//! The address release is registered *before* the delegate is called, so an
//! address the delegate handed out before failing is returned as well.
//!
//! A failure to persist the record is reported without unwinding: the
//! interface is already functional in the container.
//!
//! ## Detach
//!
//! ```text
//!   Requested ──release──▶ AddressReleased ──move back──▶ DeviceDetached ──reset──▶ Reset
//! ```
//!
//! Detach runs every independent step even if an earlier one failed, treats
//! resources that are already gone as released, and works without a saved
//! record (degraded mode, using only what the caller passed). The record is
//! deleted only when every step succeeded, so the orchestrator's retry still
//! finds it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheRecord, NetConfCache};
use crate::config::{AttachmentRequest, DetachRequest, NetConf};
use crate::device::DeviceOps;
use crate::error::{Error, Result};
use crate::ipam::{AddressResult, Interface, IpamBridge};
use crate::netns::NetNs;
use crate::vf::VfConfigurator;

// =============================================================================
// States
// =============================================================================

/// Attach progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// Request validated, nothing mutated.
    Initial,
    /// GUID and link state applied to the VF.
    DeviceConfigured,
    /// VF moved into the container namespace.
    NamespaceAttached,
    /// Addresses assigned and configured (or no IPAM configured).
    AddressAssigned,
    /// Record saved. Terminal.
    Persisted,
    /// Attach failed and was unwound. Terminal.
    Failed,
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "Initial",
            Self::DeviceConfigured => "DeviceConfigured",
            Self::NamespaceAttached => "NamespaceAttached",
            Self::AddressAssigned => "AddressAssigned",
            Self::Persisted => "Persisted",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Detach progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachState {
    Requested,
    AddressReleased,
    DeviceDetached,
    Reset,
}

impl fmt::Display for DetachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "Requested",
            Self::AddressReleased => "AddressReleased",
            Self::DeviceDetached => "DeviceDetached",
            Self::Reset => "Reset",
        };
        f.write_str(name)
    }
}

/// Compensating action for a completed attach step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    /// Restore the VF's original GUID and link state.
    ResetVf,
    /// Move the container interface back to the host.
    MoveToHost {
        container_name: String,
        host_name: String,
    },
    /// Release whatever the IPAM plugin assigned.
    ReleaseAddress,
}

/// Forward progress of one attach: current state plus the rollback table.
#[derive(Debug)]
struct AttachRun {
    state: AttachState,
    undo: Vec<Undo>,
}

impl AttachRun {
    fn new() -> Self {
        Self {
            state: AttachState::Initial,
            undo: Vec::new(),
        }
    }

    fn advance(&mut self, to: AttachState) {
        debug!(from = %self.state, to = %to, "Attach transition");
        self.state = to;
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Attach/detach orchestrator over the device, VF and IPAM capabilities.
pub struct VfLifecycle {
    devices: Arc<dyn DeviceOps>,
    vf: Arc<dyn VfConfigurator>,
    ipam: IpamBridge,
    cache: NetConfCache,
}

impl VfLifecycle {
    /// Creates a lifecycle over the given capabilities.
    pub fn new(
        devices: Arc<dyn DeviceOps>,
        vf: Arc<dyn VfConfigurator>,
        ipam: IpamBridge,
        cache: NetConfCache,
    ) -> Self {
        Self {
            devices,
            vf,
            ipam,
            cache,
        }
    }

    /// Returns the record cache.
    pub fn cache(&self) -> &NetConfCache {
        &self.cache
    }

    /// Attaches the VF described by `request` to its container namespace.
    ///
    /// On failure every completed step has been unwound and no record is
    /// saved; the error carries the state the attach failed in and any
    /// rollback failures.
    #[instrument(skip(self, request), fields(container = %request.container_id, ifname = %request.if_name))]
    pub async fn attach(&self, request: &AttachmentRequest) -> Result<AddressResult> {
        // Validation: nothing below this block runs if any of it fails.
        if request.conf.guid.is_none() {
            return Err(Error::MissingGuid);
        }
        IpamBridge::check_supported(&request.conf.ipam.ipam_type)?;
        self.cache.record_path(&request.container_id, &request.if_name)?;
        let netns = NetNs::open(&request.netns)?;

        let mut run = AttachRun::new();
        let mut conf = request.conf.clone();

        let mut result = match self.attach_steps(request, &netns, &mut conf, &mut run).await {
            Ok(result) => result,
            Err(source) => {
                let failed_in = run.state;
                let rollback = self.rollback(run.undo, request, &conf, &netns).await;
                debug!(from = %failed_in, to = %AttachState::Failed, "Attach transition");
                warn!(
                    state = %failed_in,
                    error = %source,
                    rollback_errors = rollback.len(),
                    "Attach failed, completed steps unwound"
                );
                return Err(Error::AttachFailed {
                    state: failed_in,
                    ifname: request.if_name.clone(),
                    source: Box::new(source),
                    rollback,
                });
            }
        };

        // AddressAssigned -> Persisted. Not unwound on failure.
        let saved = CacheRecord::new(request, conf.clone()).and_then(|record| {
            self.cache
                .save(&request.container_id, &request.if_name, &record)
        });
        if let Err(source) = saved {
            warn!(error = %source, "Attached but failed to save state");
            return Err(Error::AttachFailed {
                state: run.state,
                ifname: request.if_name.clone(),
                source: Box::new(source),
                rollback: Vec::new(),
            });
        }
        run.advance(AttachState::Persisted);

        result.encode_as(conf.result_version());
        result.interfaces = vec![Interface {
            name: request.if_name.clone(),
            mac: None,
            sandbox: Some(request.netns.display().to_string()),
        }];

        info!(
            device = %conf.device_id,
            guid = ?conf.guid,
            addresses = result.ips.len(),
            "Attached VF"
        );
        Ok(result)
    }

    /// Forward steps up to `AddressAssigned`, registering undo actions as
    /// they complete.
    async fn attach_steps(
        &self,
        request: &AttachmentRequest,
        netns: &NetNs,
        conf: &mut NetConf,
        run: &mut AttachRun,
    ) -> Result<AddressResult> {
        // Initial -> DeviceConfigured
        self.vf.apply(conf).await?;
        run.undo.push(Undo::ResetVf);
        run.advance(AttachState::DeviceConfigured);

        // DeviceConfigured -> NamespaceAttached
        let host_name = conf.host_if_name()?.to_string();
        let container_name = self
            .devices
            .move_to_namespace(&host_name, netns, &request.if_name)
            .await?;
        run.undo.push(Undo::MoveToHost {
            container_name: container_name.clone(),
            host_name,
        });
        run.advance(AttachState::NamespaceAttached);

        // NamespaceAttached -> AddressAssigned
        let ipam_type = conf.ipam.ipam_type.clone();
        let result = if ipam_type.is_empty() {
            debug!("No IPAM configured, skipping address assignment");
            AddressResult::default()
        } else {
            run.undo.push(Undo::ReleaseAddress);
            let result = self.ipam.assign(&ipam_type, &request.raw_config).await?;
            self.devices
                .configure_addresses(netns, &container_name, &result)
                .await?;
            result
        };
        run.advance(AttachState::AddressAssigned);

        Ok(result)
    }

    /// Runs the rollback table in reverse. Returns the failures of
    /// individual undo steps; every step is attempted.
    async fn rollback(
        &self,
        undo: Vec<Undo>,
        request: &AttachmentRequest,
        conf: &NetConf,
        netns: &NetNs,
    ) -> Vec<Error> {
        let mut errors = Vec::new();

        for step in undo.into_iter().rev() {
            let outcome = match &step {
                Undo::ReleaseAddress => {
                    self.ipam
                        .release(&conf.ipam.ipam_type, &request.raw_config)
                        .await
                }
                Undo::MoveToHost {
                    container_name,
                    host_name,
                } => self
                    .devices
                    .move_to_host(netns, container_name, host_name)
                    .await
                    .map(|_| ()),
                Undo::ResetVf => self.vf.reset(conf).await,
            };

            match outcome {
                Ok(()) => debug!(step = ?step, "Rolled back"),
                Err(e) => {
                    warn!(step = ?step, error = %e, "Rollback step failed");
                    errors.push(e);
                }
            }
        }

        errors
    }

    /// Detaches the VF attached under `request`'s key.
    ///
    /// Safe to run repeatedly and against a partially failed attach.
    #[instrument(skip(self, request), fields(container = %request.container_id, ifname = %request.if_name))]
    pub async fn detach(&self, request: &DetachRequest) -> Result<()> {
        let Some(netns_path) = request.netns.as_deref() else {
            info!("No network namespace given, nothing to detach");
            return Ok(());
        };

        let mut errors = Vec::new();
        let mut state = DetachState::Requested;

        let (record, record_path) = match self.cache.load(&request.container_id, &request.if_name)
        {
            Ok((record, path)) => (Some(record), Some(path)),
            Err(e) if e.is_not_found() => {
                info!("No saved state, detaching with caller arguments");
                (None, None)
            }
            Err(Error::CorruptCache { path, reason }) => {
                warn!(
                    path = %path.display(),
                    error = %reason,
                    "Ignoring corrupt saved state, detaching with caller arguments"
                );
                (None, Some(path))
            }
            Err(e) => {
                warn!(error = %e, "Failed to load saved state, detaching with caller arguments");
                errors.push(e);
                (None, None)
            }
        };

        let (ipam_type, raw_config) = match &record {
            Some(record) => (
                record.conf.ipam.ipam_type.clone(),
                record
                    .raw_config_bytes()
                    .unwrap_or_else(|_| request.raw_config.clone()),
            ),
            None => (
                request
                    .conf
                    .as_ref()
                    .map(|conf| conf.ipam.ipam_type.clone())
                    .unwrap_or_default(),
                request.raw_config.clone(),
            ),
        };
        IpamBridge::check_supported(&ipam_type)?;

        // Requested -> AddressReleased. Independent of the device; an empty
        // type releases nothing.
        match self.ipam.release(&ipam_type, &raw_config).await {
            Ok(()) => {
                debug!(from = %state, to = %DetachState::AddressReleased, "Detach transition");
                state = DetachState::AddressReleased;
            }
            Err(e) => {
                warn!(error = %e, "Address release failed, continuing with device");
                errors.push(e);
            }
        }

        match self
            .detach_device(netns_path, &request.if_name, record.as_ref(), &mut state)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                warn!(state = %state, error = %e, "Device detach failed");
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return Err(Error::DetachIncomplete {
                ifname: request.if_name.clone(),
                errors,
            });
        }

        if let Some(path) = record_path
            && let Err(e) = self.cache.delete(&path)
        {
            warn!(path = %path.display(), error = %e, "Detached but failed to delete saved state");
        }

        info!("Detached VF");
        Ok(())
    }

    /// AddressReleased -> DeviceDetached -> Reset.
    async fn detach_device(
        &self,
        netns_path: &Path,
        if_name: &str,
        record: Option<&CacheRecord>,
        state: &mut DetachState,
    ) -> Result<()> {
        let netns = match NetNs::open(netns_path) {
            Ok(netns) => netns,
            Err(e) if e.is_not_found() => {
                info!(netns = %netns_path.display(), "Network namespace is gone, device already released");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.devices.exists(&netns, if_name).await? {
            let host_name = record
                .and_then(|r| r.conf.host_if_name.clone())
                .unwrap_or_else(|| if_name.to_string());
            self.devices.move_to_host(&netns, if_name, &host_name).await?;
        } else {
            info!("Interface not in namespace, already moved out");
        }
        debug!(from = %state, to = %DetachState::DeviceDetached, "Detach transition");
        *state = DetachState::DeviceDetached;

        match record {
            Some(record) => self.vf.reset(&record.conf).await?,
            None => debug!("No saved configuration, skipping VF reset"),
        }
        debug!(from = %state, to = %DetachState::Reset, "Detach transition");
        *state = DetachState::Reset;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(AttachState::NamespaceAttached.to_string(), "NamespaceAttached");
        assert_eq!(AttachState::Failed.to_string(), "Failed");
        assert_eq!(DetachState::DeviceDetached.to_string(), "DeviceDetached");
    }

    #[test]
    fn test_attach_run_starts_empty() {
        let run = AttachRun::new();
        assert_eq!(run.state, AttachState::Initial);
        assert!(run.undo.is_empty());
    }
}
