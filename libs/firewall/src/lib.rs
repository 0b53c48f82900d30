//! Kill-switch firewall controller.
//!
//! While a full tunnel is up (or the user pinned the switch persistently),
//! the host drops all traffic except a narrow bypass set: loopback, reply
//! traffic, the tunnel's own marked packets, the tunnel interface, DHCP/NDP
//! and, optionally, local networks and explicitly permitted routes.
//!
//! One controller exists per process (see [`get`]); routers borrow it and
//! coordinate through the enable/disable contract.

use std::sync::{Arc, OnceLock};

use ipnetwork::IpNetwork;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(target_os = "windows")]
#[path = "windows.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod platform;

pub use platform::OsFirewall;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The platform backend could not initialize (no netfilter, no WFP
    /// engine). Sticky for the process lifetime.
    #[error("firewall backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("kill switch is not enabled")]
    NotEnabled,
    #[error("interface {0} not found")]
    UnknownInterface(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(windows)]
    #[error("WFP call failed: {0}")]
    Wfp(#[from] windows::core::Error),
    #[cfg(target_os = "macos")]
    #[error("pfctl: {0}")]
    Pfctl(String),
}

/// Capability set every platform controller implements. All methods take
/// `&self`; controllers guard their rule graph with an internal lock.
pub trait Firewall: Send + Sync {
    /// Installs the base deny-by-default policy. Idempotent.
    fn enable(&self) -> Result<(), Error>;

    /// Removes every rule this controller installed. Idempotent; deletion
    /// failures are logged and skipped, never abort the teardown.
    fn disable(&self) -> Result<(), Error>;

    fn is_enabled(&self) -> bool;

    /// Persistent means the switch survives tunnel teardown.
    fn set_persist(&self, enabled: bool);

    fn is_persistent(&self) -> bool;

    /// Additive LAN exemption on top of `enable`. Rolls back rules added by
    /// the failing call.
    fn allow_local_networks(&self, prefixes: &[IpNetwork]) -> Result<(), Error>;

    fn remove_local_networks(&self) -> Result<(), Error>;

    fn is_allow_local_networks_enabled(&self) -> bool;

    /// Replaces the per-destination allow set.
    fn update_permitted_routes(&self, routes: &[IpNetwork]) -> Result<(), Error>;

    /// Accept inbound UDP on the tunnel's listen port. The port is retained
    /// if the switch is currently down and applied on the next enable.
    fn set_tunnel_port(&self, port: u16) -> Result<(), Error>;
}

/// Returns the process-wide firewall controller, initializing it on first
/// use. Initialization failure is sticky and reported as
/// [`Error::BackendUnavailable`] on every subsequent call.
pub fn get() -> Result<Arc<OsFirewall>, Error> {
    static INSTANCE: OnceLock<Result<Arc<OsFirewall>, String>> = OnceLock::new();

    INSTANCE
        .get_or_init(|| OsFirewall::new().map(Arc::new).map_err(|e| e.to_string()))
        .clone()
        .map_err(Error::BackendUnavailable)
}

/// Destinations exempted by the LAN bypass: RFC1918, link-local, loopback
/// and multicast for v4; ULA, link-local, loopback and multicast for v6.
pub fn local_network_prefixes() -> Vec<IpNetwork> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "127.0.0.0/8",
        "224.0.0.0/4",
        "fc00::/7",
        "fe80::/10",
        "::1/128",
        "ff00::/8",
    ]
    .iter()
    .map(|prefix| prefix.parse().expect("static prefixes parse"))
    .collect()
}

pub(crate) fn family_matches(net: &IpNetwork, v4: bool) -> bool {
    matches!(
        (net, v4),
        (IpNetwork::V4(_), true) | (IpNetwork::V6(_), false)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lan_prefix_list_matches_contract() {
        let prefixes = local_network_prefixes();
        assert_eq!(prefixes.len(), 10);
        assert_eq!(prefixes.iter().filter(|p| p.is_ipv4()).count(), 6);
        assert!(prefixes.contains(&"fc00::/7".parse().unwrap()));
    }
}
