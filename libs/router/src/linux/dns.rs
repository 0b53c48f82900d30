//! System DNS programming.
//!
//! Preferred backend is systemd-resolved over the system bus, probed with a
//! `ResolveHostname("localhost")` round trip. When resolved is not there,
//! the fallback rewrites `/etc/resolv.conf` with a backup for the revert.

mod resolv_file;

use std::net::IpAddr;

use zbus::Connection;

use crate::Error;

const AF_INET: i32 = libc::AF_INET;
const AF_INET6: i32 = libc::AF_INET6;
const AF_UNSPEC: i32 = libc::AF_UNSPEC;

#[zbus::proxy(
    interface = "org.freedesktop.resolve1.Manager",
    default_service = "org.freedesktop.resolve1",
    default_path = "/org/freedesktop/resolve1"
)]
trait Resolve1Manager {
    #[allow(clippy::type_complexity)]
    fn resolve_hostname(
        &self,
        ifindex: i32,
        name: &str,
        family: i32,
        flags: u64,
    ) -> zbus::Result<(Vec<(i32, i32, Vec<u8>)>, String, u64)>;

    fn set_link_dns(&self, ifindex: i32, addresses: Vec<(i32, Vec<u8>)>) -> zbus::Result<()>;

    fn set_link_domains(&self, ifindex: i32, domains: Vec<(String, bool)>) -> zbus::Result<()>;

    fn set_link_default_route(&self, ifindex: i32, enable: bool) -> zbus::Result<()>;

    fn revert_link(&self, ifindex: i32) -> zbus::Result<()>;
}

/// Programs resolvers and search domains for the tunnel interface, via
/// systemd-resolved if it answers, otherwise by rewriting resolv.conf.
pub(crate) async fn set(
    iface: &str,
    dns: &[IpAddr],
    search_domains: &[String],
    full_tunnel: bool,
) -> Result<(), Error> {
    match resolved_proxy().await {
        Some(proxy) => {
            tracing::debug!("Configuring systemd-resolved");
            let index = iface_index(iface)?;
            set_resolved(&proxy, index, dns, search_domains, full_tunnel).await
        }
        None => {
            tracing::debug!("systemd-resolved not detected, falling back to resolv.conf");
            let dns = dns.to_vec();
            let search = search_domains.to_vec();
            tokio::task::spawn_blocking(move || {
                resolv_file::configure(&resolv_file::Paths::default(), &dns, &search, full_tunnel)
            })
            .await
            .map_err(|e| Error::Command {
                command: "spawn_blocking".to_owned(),
                message: e.to_string(),
            })?
        }
    }
}

/// Reverts whatever [`set`] programmed.
pub(crate) async fn revert(iface: &str) -> Result<(), Error> {
    match resolved_proxy().await {
        Some(proxy) => {
            tracing::debug!("Reverting systemd-resolved link settings");
            let index = iface_index(iface)?;
            if let Err(e) = proxy.set_link_default_route(index, false).await {
                tracing::debug!("Failed to clear link default route: {e}");
            }
            proxy.revert_link(index).await?;
            Ok(())
        }
        None => {
            tracing::debug!("Reverting resolv.conf from backup");
            tokio::task::spawn_blocking(|| resolv_file::revert(&resolv_file::Paths::default()))
                .await
                .map_err(|e| Error::Command {
                    command: "spawn_blocking".to_owned(),
                    message: e.to_string(),
                })?
        }
    }
}

/// Connects to resolved and proves it is alive with a trivial local lookup.
async fn resolved_proxy() -> Option<Resolve1ManagerProxy<'static>> {
    let connection = Connection::system().await.ok()?;
    let proxy = Resolve1ManagerProxy::new(&connection).await.ok()?;

    proxy
        .resolve_hostname(0, "localhost", AF_UNSPEC, 0)
        .await
        .ok()?;

    Some(proxy)
}

async fn set_resolved(
    proxy: &Resolve1ManagerProxy<'_>,
    index: i32,
    dns: &[IpAddr],
    search_domains: &[String],
    full_tunnel: bool,
) -> Result<(), Error> {
    let addresses: Vec<(i32, Vec<u8>)> = dns
        .iter()
        .map(|ip| match ip {
            IpAddr::V4(v4) => (AF_INET, v4.octets().to_vec()),
            IpAddr::V6(v6) => (AF_INET6, v6.octets().to_vec()),
        })
        .collect();
    proxy.set_link_dns(index, addresses).await?;

    let mut domains: Vec<(String, bool)> = search_domains
        .iter()
        .map(|domain| (domain.clone(), false))
        .collect();
    // Routing-only catch-all domain: resolved sends every query to this
    // link while the tunnel owns the default route.
    if full_tunnel && !dns.is_empty() {
        domains.push(("~.".to_owned(), true));
    }
    proxy.set_link_domains(index, domains).await?;

    if full_tunnel {
        proxy.set_link_default_route(index, true).await?;
    }

    Ok(())
}

fn iface_index(iface: &str) -> Result<i32, Error> {
    let index = nix::net::if_::if_nametoindex(iface)
        .map_err(|_| Error::LinkNotFound(iface.to_owned()))?;
    Ok(index as i32)
}
