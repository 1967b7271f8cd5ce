//! # Device Capability Surface
//!
//! Namespace-aware link operations on the VF netdev. The lifecycle only
//! sees the [`DeviceOps`] trait; [`LinkDevices`] implements it with
//! `ip(8)`.
//!
//! ## Moving a VF into a container
//!
//! ```text
//! host ns:       ib1 ──down──▶ ib1 ──rename──▶ tmp7 ──netns──┐
//! container ns:                                             └▶ tmp7 ──rename──▶ net1 ──up
//! ```
//!
//! The intermediate `tmp<ifindex>` name keeps the host-side name from
//! clashing with an interface already present in the container namespace.
//! Moves are not idempotent: moving a device that is already gone fails with
//! [`Error::DeviceNotFound`], so callers check [`DeviceOps::exists`] first
//! when they need to tolerate repeats.

use std::process::Output;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::constants::TEMP_LINK_PREFIX;
use crate::error::{Error, Result};
use crate::ipam::AddressResult;
use crate::netns::{host_netns_path, NetNs};

/// Link operations the lifecycle depends on.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    /// Returns true if a link named `name` exists in `netns`.
    async fn exists(&self, netns: &NetNs, name: &str) -> Result<bool>;

    /// Moves host link `host_name` into `netns` as `container_name`, up.
    ///
    /// Returns the container-side name. If the in-namespace part fails the
    /// link is moved back to the host before the error is returned.
    async fn move_to_namespace(
        &self,
        host_name: &str,
        netns: &NetNs,
        container_name: &str,
    ) -> Result<String>;

    /// Moves `container_name` out of `netns`, down, renamed to `host_name`.
    ///
    /// Returns the host-side name.
    async fn move_to_host(
        &self,
        netns: &NetNs,
        container_name: &str,
        host_name: &str,
    ) -> Result<String>;

    /// Brings `if_name` up and installs the addresses and routes of `result`.
    async fn configure_addresses(
        &self,
        netns: &NetNs,
        if_name: &str,
        result: &AddressResult,
    ) -> Result<()>;
}

/// [`DeviceOps`] backed by `ip(8)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkDevices;

impl LinkDevices {
    /// Creates the link manager.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceOps for LinkDevices {
    async fn exists(&self, netns: &NetNs, name: &str) -> Result<bool> {
        let name = name.to_string();
        netns
            .run(move || match ip(&["-o", "link", "show", "dev", &name]) {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            })
            .await
    }

    #[instrument(skip(self, netns), fields(netns = %netns.path().display()))]
    async fn move_to_namespace(
        &self,
        host_name: &str,
        netns: &NetNs,
        container_name: &str,
    ) -> Result<String> {
        let shown = ip_host(&["-o", "link", "show", "dev", host_name]).await?;
        let index = parse_ifindex(&shown).ok_or_else(|| Error::CommandFailed {
            command: format!("ip -o link show dev {host_name}"),
            reason: format!("unexpected output: {}", shown.trim()),
        })?;
        let temp_name = format!("{TEMP_LINK_PREFIX}{index}");
        let netns_path = netns.path().display().to_string();

        ip_host(&["link", "set", "dev", host_name, "down"]).await?;
        ip_host(&["link", "set", "dev", host_name, "name", &temp_name]).await?;

        if let Err(e) = ip_host(&["link", "set", "dev", &temp_name, "netns", &netns_path]).await {
            if let Err(restore) = ip_host(&["link", "set", "dev", &temp_name, "name", host_name]).await
            {
                warn!(device = %temp_name, error = %restore, "Failed to restore host link name");
            }
            return Err(e);
        }

        let (temp, target) = (temp_name.clone(), container_name.to_string());
        let placed = netns
            .run(move || {
                ip(&["link", "set", "dev", &temp, "name", &target])?;
                ip(&["link", "set", "dev", &target, "up"])?;
                Ok(())
            })
            .await;

        if let Err(e) = placed {
            let (temp, target, host) = (
                temp_name,
                container_name.to_string(),
                host_name.to_string(),
            );
            let undo = netns
                .run(move || {
                    let current = match ip(&["-o", "link", "show", "dev", &target]) {
                        Ok(_) => target,
                        Err(_) => temp,
                    };
                    return_to_host(&current, &host)
                })
                .await;
            if let Err(undo_err) = undo {
                warn!(device = %host_name, error = %undo_err, "Failed to return link after partial move");
            }
            return Err(e);
        }

        info!(device = %host_name, ifname = %container_name, "Moved link into namespace");
        Ok(container_name.to_string())
    }

    #[instrument(skip(self, netns), fields(netns = %netns.path().display()))]
    async fn move_to_host(
        &self,
        netns: &NetNs,
        container_name: &str,
        host_name: &str,
    ) -> Result<String> {
        let (current, host) = (container_name.to_string(), host_name.to_string());
        netns.run(move || return_to_host(&current, &host)).await?;

        info!(ifname = %container_name, device = %host_name, "Moved link back to host");
        Ok(host_name.to_string())
    }

    #[instrument(skip(self, netns, result), fields(netns = %netns.path().display()))]
    async fn configure_addresses(
        &self,
        netns: &NetNs,
        if_name: &str,
        result: &AddressResult,
    ) -> Result<()> {
        let commands = address_commands(if_name, result);
        netns
            .run(move || {
                for args in &commands {
                    let args: Vec<&str> = args.iter().map(String::as_str).collect();
                    ip(&args)?;
                }
                Ok(())
            })
            .await?;

        debug!(ifname = %if_name, addresses = result.ips.len(), "Configured container interface");
        Ok(())
    }
}

/// Takes `current` down, renames it to `host_name`, and moves it to the host
/// namespace. Must run inside the container namespace.
fn return_to_host(current: &str, host_name: &str) -> Result<()> {
    let host_ns = host_netns_path().display().to_string();
    ip(&["link", "set", "dev", current, "down"])?;
    ip(&["link", "set", "dev", current, "name", host_name])?;
    ip(&["link", "set", "dev", host_name, "netns", &host_ns])?;
    Ok(())
}

/// Builds the `ip` invocations that configure an interface from a result.
pub fn address_commands(if_name: &str, result: &AddressResult) -> Vec<Vec<String>> {
    let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    let mut commands = vec![owned(&["link", "set", "dev", if_name, "up"])];

    for ip in &result.ips {
        let address = ip.address.to_string();
        commands.push(owned(&["addr", "add", &address, "dev", if_name]));
    }

    for route in &result.routes {
        let gateway = route.gw.or_else(|| {
            result
                .ips
                .iter()
                .filter(|ip| ip.address.is_ipv4() == route.dst.is_ipv4())
                .find_map(|ip| ip.gateway)
        });
        let dst = route.dst.to_string();
        let mut args = owned(&["route", "add", &dst]);
        if let Some(gw) = gateway {
            args.extend(owned(&["via", &gw.to_string()]));
        }
        args.extend(owned(&["dev", if_name]));
        commands.push(args);
    }

    commands
}

/// Extracts the ifindex from `ip -o link show` output (`7: ib1: <...`).
pub fn parse_ifindex(output: &str) -> Option<u32> {
    output
        .lines()
        .next()?
        .split(':')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn check_output(args: &[&str], output: Output) -> Result<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("does not exist") || stderr.contains("Cannot find device") {
        let name = args
            .iter()
            .position(|a| *a == "dev")
            .and_then(|i| args.get(i + 1))
            .unwrap_or(&"")
            .to_string();
        return Err(Error::DeviceNotFound { name });
    }

    Err(Error::CommandFailed {
        command: format!("ip {}", args.join(" ")),
        reason: stderr,
    })
}

/// Runs `ip` on the calling thread, in whatever namespace it is in.
fn ip(args: &[&str]) -> Result<String> {
    let output = std::process::Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| Error::CommandFailed {
            command: format!("ip {}", args.join(" ")),
            reason: format!("failed to execute: {e}"),
        })?;
    check_output(args, output)
}

/// Runs `ip` from the async runtime, in the host namespace.
pub(crate) async fn ip_host(args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::CommandFailed {
            command: format!("ip {}", args.join(" ")),
            reason: format!("failed to execute: {e}"),
        })?;
    check_output(args, output)
}
