//! macOS routing via the BSD `route`/`ifconfig` tools, DNS via
//! `networksetup`. The kill-switch interplay mirrors Linux: a default route
//! engages PF, and the anchor passes traffic on the utun interface.
//!
//! Defaults are installed as two half-width prefixes per family so the ISP
//! default stays less specific, the same trick the Windows router uses.

use std::net::IpAddr;
use std::sync::Arc;

use firewall::Firewall as _;
use ipnetwork::IpNetwork;
use tokio::process::Command;
use tunnel_types::RouterConfig;

use crate::{Error, Router};

pub struct OsRouter {
    iface: String,
    fw: Arc<firewall::OsFirewall>,
    prev_config: Option<RouterConfig>,
    we_engaged_ks: bool,
    /// Network services whose DNS we overrode, for the revert.
    dns_services: Vec<String>,
    v6_available: bool,
}

impl OsRouter {
    pub fn new(iface: &str, fw: Arc<firewall::OsFirewall>) -> Result<Self, Error> {
        Ok(Self {
            iface: iface.to_owned(),
            fw,
            prev_config: None,
            we_engaged_ks: false,
            dns_services: Vec::new(),
            v6_available: tunnel_types::supports_ipv6(),
        })
    }

    fn sync_firewall_state(&mut self, new: &RouterConfig) -> Result<(), Error> {
        let requires_ks = new.has_any_default();

        if requires_ks && !self.fw.is_enabled() {
            self.fw.enable()?;
            self.we_engaged_ks = true;
            self.fw.add_tunnel_bypasses(&self.iface)?;
        } else if !requires_ks && self.we_engaged_ks {
            self.fw.disable()?;
            self.we_engaged_ks = false;
        }
        Ok(())
    }

    async fn sync_device_params(&self, new: &RouterConfig, prev: &RouterConfig) {
        if new.mtu > 0 && new.mtu != prev.mtu {
            if let Err(e) = run(
                "ifconfig",
                &[&self.iface, "mtu", &new.mtu.to_string()],
            )
            .await
            {
                tracing::warn!(mtu = new.mtu, "Failed to set MTU: {e}");
            }
        }

        if new.listen_port != 0 && new.listen_port != prev.listen_port {
            if let Err(e) = self.fw.set_tunnel_port(new.listen_port) {
                tracing::warn!(port = new.listen_port, "Failed to punch tunnel port: {e}");
            }
        }
    }

    async fn cleanup_previous_state(&self, new: &RouterConfig, prev: &RouterConfig) {
        if self.prev_config.is_none() {
            return;
        }

        for addr in &prev.tunnel_addrs {
            if !new.tunnel_addrs.contains(addr) {
                let family = if addr.is_ipv4() { "inet" } else { "inet6" };
                if let Err(e) = run(
                    "ifconfig",
                    &[&self.iface, family, &addr.to_string(), "-alias"],
                )
                .await
                {
                    tracing::warn!(%addr, "Failed to remove address: {e}");
                }
            }
        }

        for route in &prev.routes {
            if !new.routes.contains(route) {
                for dest in expand_route(route) {
                    self.route_delete(&dest).await;
                }
            }
        }
    }

    async fn apply_new_addresses(&self, new: &RouterConfig) -> Result<(), Error> {
        for addr in &new.tunnel_addrs {
            if addr.is_ipv6() && !self.v6_available {
                continue;
            }
            match addr {
                IpNetwork::V4(v4) => {
                    // Point-to-point interface: the peer address is our own.
                    run(
                        "ifconfig",
                        &[
                            &self.iface,
                            "inet",
                            &v4.to_string(),
                            &v4.ip().to_string(),
                            "alias",
                        ],
                    )
                    .await?;
                }
                IpNetwork::V6(v6) => {
                    run(
                        "ifconfig",
                        &[
                            &self.iface,
                            "inet6",
                            &v6.ip().to_string(),
                            "prefixlen",
                            &v6.prefix().to_string(),
                            "alias",
                        ],
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn sync_routes(&self, new: &RouterConfig) -> Result<(), Error> {
        for route in &new.routes {
            if route.is_ipv6() && !self.v6_available {
                continue;
            }
            for dest in expand_route(route) {
                self.route_add(&dest).await?;
            }
        }
        Ok(())
    }

    async fn route_add(&self, dest: &IpNetwork) -> Result<(), Error> {
        let family = if dest.is_ipv4() { "-inet" } else { "-inet6" };
        let result = run(
            "route",
            &[
                "-n",
                "add",
                family,
                &dest.to_string(),
                "-interface",
                &self.iface,
            ],
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            // Re-applying an existing route is a no-op.
            Err(Error::Command { message, .. }) if message.contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn route_delete(&self, dest: &IpNetwork) {
        let family = if dest.is_ipv4() { "-inet" } else { "-inet6" };
        if let Err(e) = run(
            "route",
            &["-n", "delete", family, &dest.to_string()],
        )
        .await
        {
            tracing::debug!(%dest, "Route removal skipped: {e}");
        }
    }

    async fn sync_dns(&mut self, new: &RouterConfig, prev: &RouterConfig) -> Result<(), Error> {
        let state_changed = new.has_any_default() != prev.has_any_default();
        let dns_changed = new.dns != prev.dns || new.search_domains != prev.search_domains;
        if !dns_changed && !state_changed {
            return Ok(());
        }

        if new.dns.is_empty() && new.search_domains.is_empty() {
            self.revert_dns().await;
            return Ok(());
        }

        let services = network_services().await?;
        let servers: Vec<String> = new.dns.iter().map(IpAddr::to_string).collect();

        for service in &services {
            let mut args = vec!["-setdnsservers", service.as_str()];
            let server_refs: Vec<&str> = servers.iter().map(String::as_str).collect();
            args.extend(server_refs);
            run("networksetup", &args).await?;

            if !new.search_domains.is_empty() {
                let mut args = vec!["-setsearchdomains", service.as_str()];
                args.extend(new.search_domains.iter().map(String::as_str));
                run("networksetup", &args).await?;
            }
        }

        self.dns_services = services;
        Ok(())
    }

    async fn revert_dns(&mut self) {
        for service in std::mem::take(&mut self.dns_services) {
            for setting in ["-setdnsservers", "-setsearchdomains"] {
                if let Err(e) = run("networksetup", &[setting, &service, "Empty"]).await {
                    tracing::warn!(%service, "Failed to revert DNS setting: {e}");
                }
            }
        }
    }
}

/// Defaults become half-width splits; everything else passes through.
fn expand_route(route: &IpNetwork) -> Vec<IpNetwork> {
    if route.prefix() != 0 {
        return vec![*route];
    }
    if route.is_ipv4() {
        vec![
            "0.0.0.0/1".parse().expect("static half-default"),
            "128.0.0.0/1".parse().expect("static half-default"),
        ]
    } else {
        vec![
            "::/1".parse().expect("static half-default"),
            "8000::/1".parse().expect("static half-default"),
        ]
    }
}

/// Every network service name known to `networksetup`, minus the header
/// line and disabled entries.
async fn network_services() -> Result<Vec<String>, Error> {
    let output = Command::new("networksetup")
        .arg("-listallnetworkservices")
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Command {
            command: "networksetup -listallnetworkservices".to_owned(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .map(ToString::to_string)
        .collect())
}

async fn run(command: &str, args: &[&str]) -> Result<(), Error> {
    let output = Command::new(command).args(args).output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(Error::Command {
        command: format!("{command} {}", args.join(" ")),
        message: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

impl Router for OsRouter {
    async fn set(&mut self, config: Option<&RouterConfig>) -> Result<(), Error> {
        let new = config.cloned().unwrap_or_default();
        let prev = self.prev_config.clone().unwrap_or_default();

        if self.prev_config.as_ref() == Some(&new) {
            tracing::debug!("Config unchanged, skipping");
            return Ok(());
        }

        run("ifconfig", &[&self.iface, "up"]).await?;

        self.sync_firewall_state(&new)?;
        self.sync_device_params(&new, &prev).await;
        self.cleanup_previous_state(&new, &prev).await;
        self.apply_new_addresses(&new).await?;
        self.sync_routes(&new).await?;
        self.sync_dns(&new, &prev).await?;

        self.prev_config = Some(new);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.prev_config.is_some() {
            self.revert_dns().await;
        }

        if let Err(e) = self.set(None).await {
            tracing::warn!("Cleanup set failed: {e}");
        }

        if self.we_engaged_ks && self.fw.is_enabled() {
            tracing::debug!(iface = %self.iface, "Disabling full tunnel kill switch");
            self.fw.disable()?;
            self.we_engaged_ks = false;
        } else if self.fw.is_enabled() {
            tracing::debug!(iface = %self.iface, "Removing firewall bypasses");
            self.fw.remove_tunnel_bypasses(&self.iface)?;
        }

        tracing::debug!("Router closed");
        Ok(())
    }
}
