//! # ib-sriov-cni
//!
//! **CNI plugin attaching InfiniBand SR-IOV virtual functions to containers**
//!
//! The container runtime calls the plugin once per (container, interface)
//! pair. `ADD` gives a prepared VF the GUID chosen by the fabric manager,
//! moves it into the container's network namespace and has an IPAM plugin
//! address it; `DEL` undoes all of that, even after a partial attach or when
//! run twice.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         ib-sriov-cni                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  cni:  CNI_* env + stdin ──▶ Invocation ──▶ Plugin::run ──▶ stdout  │
//! │                                   │                                 │
//! │  ┌────────────────────────────────▼────────────────────────────┐    │
//! │  │                  VfLifecycle (lifecycle)                    │    │
//! │  │   attach: apply ─▶ move ─▶ assign ─▶ save   (rollback table)│    │
//! │  │   detach: release ─▶ move back ─▶ reset ─▶ delete           │    │
//! │  └───────┬──────────────────┬───────────────────┬──────────────┘    │
//! │          │                  │                   │                   │
//! │  ┌───────▼───────┐  ┌───────▼────────┐  ┌───────▼────────┐          │
//! │  │ VfConfigurator│  │   DeviceOps    │  │   IpamBridge   │          │
//! │  │  GUID, state  │  │ netns moves,   │  │ exec IPAM from │          │
//! │  │  sysfs rebind │  │ addresses      │  │ CNI_PATH       │          │
//! │  └───────────────┘  └────────────────┘  └────────────────┘          │
//! │                                                                     │
//! │  NetConfCache: <cacheDir>/<containerID>-<ifName> (atomic JSON)      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Preconditions
//!
//! A VF is only attached if the device plugin and fabric manager prepared
//! it: the `mellanox.infiniband.app` argument must be `configured` and a
//! `guid` argument must be present. Both are checked before any device is
//! looked up.
//!
//! # Namespaces
//!
//! Work inside a container namespace runs on a dedicated thread that exits
//! afterwards (see [`netns::NetNs::run`]); the runtime's threads stay in the
//! host namespace.
//!
//! # Example
//!
//! ```rust,ignore
//! use ib_sriov_cni::{Invocation, Plugin};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> ib_sriov_cni::Result<()> {
//!     let invocation = Invocation::from_env()?;
//!     let stdin = std::fs::read("/dev/stdin")?;
//!     if let Some(out) = Plugin::new().run(&invocation, &stdin).await? {
//!         println!("{out}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cni;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod fakes;
pub mod ipam;
pub mod lifecycle;
pub mod logging;
pub mod netns;
pub mod sysfs;
pub mod vf;

// Re-exports
pub use cache::{CacheRecord, NetConfCache};
pub use cni::{Command, ErrorResult, Invocation, Plugin, VersionInfo};
pub use config::{AttachmentRequest, DetachRequest, Guid, LinkState, NetConf};
pub use device::{DeviceOps, LinkDevices};
pub use error::{Error, ErrorKind, Result};
pub use ipam::{AddressResult, ExecIpam, IpamBridge, IpamEnv, IpamPlugin};
pub use lifecycle::{AttachState, DetachState, Undo, VfLifecycle};
pub use netns::NetNs;
pub use sysfs::PciSysfs;
pub use vf::{SriovVfConfigurator, VfConfigurator};
