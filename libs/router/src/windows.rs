//! Windows routing via the IP Helper API.
//!
//! Default routes are never installed as `0/0`. They are split into two
//! half-width prefixes per family so the genuine ISP default stays strictly
//! less specific at longest-prefix match, which both captures all traffic
//! and avoids a routing loop for the tunnel's own packets. Gateways are
//! synthesized from documentation/ULA space; packets to them land on the
//! TUN interface regardless of the address.

mod dns;
mod netcfg;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnetwork::{IpNetwork, Ipv6Network};
use tunnel_types::RouterConfig;

use crate::{Error, Router, delta};
use firewall::Firewall as _;
use netcfg::RouteData;

const SYNTHETIC_GATEWAY_V4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const SYNTHETIC_GATEWAY_V6: Ipv6Addr = Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 1);
/// On-link helper installed when v6 routes exist without a v6 tunnel
/// address, so the synthetic gateway has a materialized next hop.
const ONLINK_HELPER_V6: Ipv6Addr = Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0xdead, 0xbeef);

/// Route deletion failures for this destination are harmless leftovers of
/// the broadcast host route and are ignored.
const IGNORED_DELETE_FAILURE: &str = "169.254.255.255/32";

pub struct OsRouter {
    iface: String,
    fw: Arc<firewall::OsFirewall>,
    luid: u64,
    prev_config: Option<RouterConfig>,
    original_search_domains: Option<Vec<String>>,
}

impl OsRouter {
    pub fn new(iface: &str, fw: Arc<firewall::OsFirewall>) -> Result<Self, Error> {
        let luid = netcfg::luid_from_alias(iface)?;

        Ok(Self {
            iface: iface.to_owned(),
            fw,
            luid,
            prev_config: None,
            original_search_domains: None,
        })
    }

    fn configure_interface(&self, cfg: &RouterConfig) -> Result<(), Error> {
        if let Err(e) = dns::set_private_network(&self.iface) {
            tracing::warn!("Failed to set private network category: {e}");
        }

        let has_v4 = netcfg::set_interface_properties(
            self.luid,
            false,
            &netcfg::InterfaceProperties {
                mtu: 0,
                pin_metric: false,
            },
        )
        .is_ok_and(|present| present);
        let has_v6 = tunnel_types::supports_ipv6()
            && netcfg::set_interface_properties(
                self.luid,
                true,
                &netcfg::InterfaceProperties {
                    mtu: 0,
                    pin_metric: false,
                },
            )
            .is_ok_and(|present| present);

        // Primary per-family tunnel addresses drive gateway synthesis.
        let mut addresses: Vec<IpNetwork> = Vec::with_capacity(cfg.tunnel_addrs.len());
        let mut local_v4: Option<Ipv4Addr> = None;
        let mut local_v6: Option<Ipv6Addr> = None;
        let mut gateway_v6: Option<Ipv6Addr> = None;

        for addr in &cfg.tunnel_addrs {
            match addr {
                IpNetwork::V4(_) if !has_v4 => continue,
                IpNetwork::V6(_) if !has_v6 => continue,
                _ => {}
            }
            addresses.push(*addr);
            match addr.ip() {
                IpAddr::V4(v4) if local_v4.is_none() => local_v4 = Some(v4),
                IpAddr::V6(v6) if local_v6.is_none() => {
                    local_v6 = Some(v6);
                    gateway_v6 = Some(SYNTHETIC_GATEWAY_V6);
                }
                _ => {}
            }
        }

        let mut routes: Vec<RouteData> = Vec::new();
        let mut pin_v4 = false;
        let mut pin_v6 = false;

        for route in &cfg.routes {
            match route {
                IpNetwork::V4(_) if !has_v4 => continue,
                IpNetwork::V6(_) if !has_v6 => continue,
                _ => {}
            }

            // Materialize a v6 next hop when routes arrive before any v6
            // tunnel address.
            if route.is_ipv6() && gateway_v6.is_none() {
                addresses.push(IpNetwork::V6(
                    Ipv6Network::new(ONLINK_HELPER_V6, 128).expect("host prefix is valid"),
                ));
                gateway_v6 = Some(ONLINK_HELPER_V6);
            }

            let (gateway, local): (IpAddr, Option<IpAddr>) = if route.is_ipv4() {
                (SYNTHETIC_GATEWAY_V4.into(), local_v4.map(IpAddr::from))
            } else {
                (
                    gateway_v6.unwrap_or(SYNTHETIC_GATEWAY_V6).into(),
                    local_v6.map(IpAddr::from),
                )
            };

            // Split the default so the ISP default stays more specific.
            if route.prefix() == 0 {
                let halves: [IpNetwork; 2] = if route.is_ipv4() {
                    pin_v4 = true;
                    [
                        "0.0.0.0/1".parse().expect("static half-default"),
                        "128.0.0.0/1".parse().expect("static half-default"),
                    ]
                } else {
                    pin_v6 = true;
                    [
                        "::/1".parse().expect("static half-default"),
                        "8000::/1".parse().expect("static half-default"),
                    ]
                };
                for half in halves {
                    routes.push(RouteData {
                        destination: half,
                        next_hop: gateway,
                        metric: 0,
                    });
                }
                continue;
            }

            // The route to our own address is implicit.
            if Some(route.ip().to_canonical()) == local {
                continue;
            }

            // Single-IP routes go via the local tunnel address.
            let next_hop = if route.prefix() == 32 && route.is_ipv4()
                || route.prefix() == 128 && route.is_ipv6()
            {
                local.unwrap_or(gateway)
            } else {
                gateway
            };

            routes.push(RouteData {
                destination: *route,
                next_hop,
                metric: 0,
            });
        }

        self.sync_addresses(&addresses)?;

        routes.sort_by(RouteData::compare);
        routes.dedup_by(|a, b| a.destination == b.destination);

        self.sync_routes(&routes, &cfg.tunnel_addrs)?;

        if has_v4 {
            netcfg::set_interface_properties(
                self.luid,
                false,
                &netcfg::InterfaceProperties {
                    mtu: cfg.mtu,
                    pin_metric: pin_v4,
                },
            )?;
        }
        if has_v6 {
            netcfg::set_interface_properties(
                self.luid,
                true,
                &netcfg::InterfaceProperties {
                    mtu: cfg.mtu,
                    pin_metric: pin_v6,
                },
            )?;
        }

        Ok(())
    }

    /// Delta-based address sync. Link-local v6 addresses are never deleted;
    /// they get `SkipAsSource` instead so they lose source selection.
    fn sync_addresses(&self, want: &[IpNetwork]) -> Result<(), Error> {
        let got = netcfg::unicast_addresses(self.luid)?;
        let (add, del) = delta(&got, want);

        let mut errors: Vec<String> = Vec::new();
        let mut link_local = Vec::new();

        for addr in del {
            if is_ipv6_link_local(&addr) {
                link_local.push(addr);
                continue;
            }
            if let Err(e) = netcfg::delete_address(self.luid, addr) {
                errors.push(format!("deleting IP {addr}: {e}"));
            }
        }
        for addr in add {
            if let Err(e) = netcfg::add_address(self.luid, addr) {
                errors.push(format!("adding IP {addr}: {e}"));
            }
        }
        for addr in link_local {
            if let Err(e) = netcfg::set_skip_as_source(self.luid, addr) {
                errors.push(format!("setting skip-as-source on {addr}: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Command {
                command: "sync_addresses".to_owned(),
                message: errors.join("; "),
            })
        }
    }

    /// Delta-based route sync; `dont_delete` protects the interface address
    /// routes the stack installs on its own.
    fn sync_routes(&self, want: &[RouteData], dont_delete: &[IpNetwork]) -> Result<(), Error> {
        let existing = netcfg::interface_routes(self.luid)?;

        let mut keep: HashSet<IpNetwork> = dont_delete.iter().copied().collect();
        for route in &existing {
            if route.destination.prefix() == 32 && route.destination.is_ipv4()
                || route.destination.prefix() == 128 && route.destination.is_ipv6()
            {
                continue;
            }
            keep.insert(netcfg::last_ip_host_prefix(&route.destination));
        }

        let mut got: Vec<RouteData> = existing
            .into_iter()
            .filter(|route| !keep.contains(&route.destination))
            .collect();
        got.sort_by(RouteData::compare);

        let mut want = want.to_vec();
        want.sort_by(RouteData::compare);

        let (add, del) = delta_routes(&got, &want);

        let mut errors: Vec<String> = Vec::new();
        for route in del {
            if let Err(e) = netcfg::delete_route(self.luid, &route) {
                if route.destination.to_string() == IGNORED_DELETE_FAILURE {
                    continue;
                }
                errors.push(format!("deleting route {}: {e}", route.destination));
            }
        }
        for route in add {
            if let Err(e) = netcfg::add_route(self.luid, &route) {
                errors.push(format!("adding route {}: {e}", route.destination));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Command {
                command: "sync_routes".to_owned(),
                message: errors.join("; "),
            })
        }
    }

    fn sync_firewall_state(&self, new: &RouterConfig, requires_ks: bool) -> Result<(), Error> {
        if !requires_ks && !self.fw.is_enabled() {
            return Ok(());
        }

        if new.is_empty() && self.fw.is_enabled() {
            // Tunnel going down: a persistent switch keeps the base policy,
            // a tunnel-scoped one goes away entirely.
            if self.fw.is_persistent() {
                self.fw.remove_tunnel_rules()?;
            } else {
                self.fw.disable()?;
            }
            return Ok(());
        }

        if requires_ks && !self.fw.is_enabled() {
            // This switch exists only for this tunnel.
            self.fw.set_persist(false);
            self.fw.enable()?;
        }

        if self.fw.is_enabled() {
            self.fw.bypass_tunnel(self.luid, new.listen_port)?;
        }

        Ok(())
    }
}

fn is_ipv6_link_local(net: &IpNetwork) -> bool {
    matches!(net.ip(), IpAddr::V6(v6) if v6.is_unicast_link_local())
}

fn delta_routes(got: &[RouteData], want: &[RouteData]) -> (Vec<RouteData>, Vec<RouteData>) {
    let mut add = Vec::with_capacity(want.len());
    let mut del = Vec::with_capacity(got.len());

    let mut i = 0;
    let mut j = 0;
    while i < got.len() && j < want.len() {
        match got[i].compare(&want[j]) {
            std::cmp::Ordering::Less => {
                del.push(got[i]);
                i += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
            std::cmp::Ordering::Greater => {
                add.push(want[j]);
                j += 1;
            }
        }
    }
    del.extend_from_slice(&got[i..]);
    add.extend_from_slice(&want[j..]);
    (add, del)
}

impl Router for OsRouter {
    async fn set(&mut self, config: Option<&RouterConfig>) -> Result<(), Error> {
        let new = config.cloned().unwrap_or_default();
        let prev = self.prev_config.clone().unwrap_or_default();

        if self.prev_config.as_ref() == Some(&new) {
            tracing::debug!("Config unchanged, skipping");
            return Ok(());
        }

        self.configure_interface(&new)?;

        let prev_full = prev.has_any_default();
        let new_full = new.has_any_default();

        if new.dns != prev.dns || new.search_domains != prev.search_domains || new_full != prev_full
        {
            // Capture the pristine suffix list before the first
            // full-tunnel activation overwrites it.
            if new_full && self.original_search_domains.is_none() {
                match dns::global_search_domains() {
                    Ok(domains) => self.original_search_domains = Some(domains),
                    Err(e) => tracing::warn!("Failed to read original search domains: {e}"),
                }
            }
            dns::set(self.luid, &new.dns, &new.search_domains, new_full)?;
        }

        self.sync_firewall_state(&new, new_full)?;

        if let Err(e) = dns::flush_caches() {
            tracing::warn!("Failed to flush DNS caches: {e}");
        }

        self.prev_config = Some(new);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        if let Some(prev) = &self.prev_config {
            dns::revert(
                self.luid,
                prev.has_any_default(),
                self.original_search_domains.take(),
            );
        }

        if let Err(e) = self.set(None).await {
            tracing::warn!("Cleanup set failed: {e}");
        }

        tracing::debug!("Router closed");
        Ok(())
    }
}
