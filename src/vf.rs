//! # Virtual Function Configurator
//!
//! Applies and resets VF settings that live on the physical function, so
//! they are independent of which namespace the VF netdev is in:
//!
//! - node and port GUID (`ip link set <pf> vf <n> node_guid|port_guid`)
//! - administrative link state (`ip link set <pf> vf <n> state`)
//!
//! A new GUID only takes effect after the VF driver re-probes the device,
//! so setting it is followed by an unbind/bind through sysfs. The VF netdev
//! is recreated by the re-probe and may come back under a different name,
//! which is why [`VfConfigurator::apply`] updates the configuration in place.
//!
//! The GUID the VF had before the first apply is recorded in
//! `hostIFGUID`; reset writes it back.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::config::{Guid, LinkState, NetConf};
use crate::device::ip_host;
use crate::error::{Error, Result};
use crate::sysfs::PciSysfs;

/// How long to wait for the VF netdev to reappear after a driver rebind.
const REBIND_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while waiting for the VF netdev.
const REBIND_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Host-side VF settings.
#[async_trait]
pub trait VfConfigurator: Send + Sync {
    /// Applies the GUID and link state from `conf`.
    ///
    /// Records the original GUID in `conf.host_if_guid` the first time and
    /// refreshes `conf.host_if_name`. Safe to call again after a partial
    /// failure.
    async fn apply(&self, conf: &mut NetConf) -> Result<()>;

    /// Restores the recorded GUID and the default link state.
    ///
    /// A configuration with nothing recorded is already reset.
    async fn reset(&self, conf: &NetConf) -> Result<()>;
}

/// [`VfConfigurator`] for mlx5 SR-IOV VFs.
#[derive(Debug, Clone, Default)]
pub struct SriovVfConfigurator {
    sysfs: PciSysfs,
}

impl SriovVfConfigurator {
    /// Creates a configurator over the given sysfs view.
    pub fn new(sysfs: PciSysfs) -> Self {
        Self { sysfs }
    }

    async fn set_guid(&self, conf: &NetConf, guid: Guid) -> Result<()> {
        let master = conf.master()?;
        let vf = conf.vf_id()?.to_string();
        let guid = guid.to_string();

        ip_host(&["link", "set", "dev", master, "vf", &vf, "node_guid", &guid]).await?;
        ip_host(&["link", "set", "dev", master, "vf", &vf, "port_guid", &guid]).await?;

        if !conf.device_id.is_empty() {
            self.sysfs.rebind(&conf.device_id)?;
        }

        debug!(master = %master, vf = %vf, guid = %guid, "Set VF GUID");
        Ok(())
    }

    async fn set_link_state(&self, conf: &NetConf, state: LinkState) -> Result<()> {
        let master = conf.master()?;
        let vf = conf.vf_id()?.to_string();
        ip_host(&["link", "set", "dev", master, "vf", &vf, "state", state.as_str()]).await?;

        debug!(master = %master, vf = %vf, state = %state, "Set VF link state");
        Ok(())
    }

    /// Waits for the VF netdev to come back after a rebind.
    async fn wait_for_netdev(&self, pci: &str) -> Result<String> {
        let deadline = tokio::time::Instant::now() + REBIND_SETTLE_TIMEOUT;
        loop {
            match self.sysfs.vf_netdev(pci) {
                Ok(name) => return Ok(name),
                Err(e) if e.is_not_found() && tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(REBIND_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl VfConfigurator for SriovVfConfigurator {
    #[instrument(skip(self, conf), fields(device = %conf.device_id))]
    async fn apply(&self, conf: &mut NetConf) -> Result<()> {
        if let Some(guid) = conf.guid {
            if conf.host_if_guid.is_none() {
                let original = read_link_guid(conf.host_if_name()?).await?;
                conf.host_if_guid = Some(original);
            }
            self.set_guid(conf, guid).await?;

            if !conf.device_id.is_empty() {
                conf.host_if_name = Some(self.wait_for_netdev(&conf.device_id).await?);
            }
        }

        if let Some(state) = conf.link_state {
            self.set_link_state(conf, state).await?;
        }

        info!(
            guid = ?conf.guid,
            original_guid = ?conf.host_if_guid,
            link_state = ?conf.link_state,
            "Applied VF configuration"
        );
        Ok(())
    }

    #[instrument(skip(self, conf), fields(device = %conf.device_id))]
    async fn reset(&self, conf: &NetConf) -> Result<()> {
        if conf.host_if_guid.is_none() && conf.link_state.is_none() {
            debug!("Nothing recorded, VF already in reset state");
            return Ok(());
        }

        if let Some(guid) = conf.host_if_guid {
            self.set_guid(conf, guid).await?;
        }
        if conf.link_state.is_some() {
            self.set_link_state(conf, LinkState::Auto).await?;
        }

        info!(guid = ?conf.host_if_guid, "Reset VF configuration");
        Ok(())
    }
}

/// Reads the port GUID of an IPoIB link.
async fn read_link_guid(name: &str) -> Result<Guid> {
    let output = ip_host(&["-o", "link", "show", "dev", name]).await?;
    require_infiniband_guid(name, &output)
}

/// Fails for links without an InfiniBand address: a GUID applied to them
/// could never be restored.
fn require_infiniband_guid(name: &str, output: &str) -> Result<Guid> {
    parse_infiniband_guid(output)?.ok_or_else(|| Error::CommandFailed {
        command: format!("ip -o link show dev {name}"),
        reason: format!("{name} has no infiniband address, original GUID cannot be recorded"),
    })
}

/// Extracts the GUID from the `link/infiniband <addr>` field of
/// `ip -o link show` output.
pub fn parse_infiniband_guid(output: &str) -> Result<Option<Guid>> {
    let mut fields = output.split_whitespace();
    if fields.by_ref().find(|f| *f == "link/infiniband").is_none() {
        return Ok(None);
    }
    let Some(addr) = fields.next() else {
        return Ok(None);
    };

    let bytes = addr
        .split(':')
        .map(hex::decode)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::InvalidGuid(addr.to_string()))?
        .concat();
    Ok(Guid::from_hardware_addr(&bytes))
}
