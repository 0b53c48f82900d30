//! Routing controller: converges the host's addresses, routes, policy rules
//! and system DNS to a [`RouterConfig`](tunnel_types::RouterConfig) and
//! reverts cleanly on close.
//!
//! The router is the only component that toggles the kill switch: a config
//! with a default route engages it (and remembers that it did), a config
//! without one releases it again. Callers serialize `set` calls; the router
//! assumes a single writer.

use std::cmp::Ordering;

use ipnetwork::IpNetwork;
use tunnel_types::RouterConfig;

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(target_os = "windows")]
#[path = "windows.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod platform;

pub use platform::OsRouter;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Firewall(#[from] firewall::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("interface {0} not found")]
    LinkNotFound(String),
    #[cfg(target_os = "linux")]
    #[error("netlink: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[cfg(target_os = "linux")]
    #[error("systemd-resolved: {0}")]
    Resolved(#[from] zbus::Error),
    #[cfg(windows)]
    #[error(transparent)]
    Windows(#[from] windows::core::Error),
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },
}

/// Capability set of a platform router. The supervisor owns the concrete
/// [`OsRouter`]; the trait documents the contract.
pub trait Router {
    /// Applies `config`; `None` reverts to the empty configuration.
    /// Idempotent: applying the previous config performs no OS mutation.
    fn set(
        &mut self,
        config: Option<&RouterConfig>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Reverts DNS, applies the empty config and releases the kill switch
    /// if this router engaged it.
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Computes the changes turning `existing` into `desired`.
///
/// Both slices are sorted with [`net_compare`] first; the merge walk then
/// yields `(add, del)`. Prefix order is unmapped address first, then longer
/// prefixes before shorter ones for the same destination.
pub fn delta(existing: &[IpNetwork], desired: &[IpNetwork]) -> (Vec<IpNetwork>, Vec<IpNetwork>) {
    let mut existing = existing.to_vec();
    let mut desired = desired.to_vec();
    existing.sort_by(net_compare);
    desired.sort_by(net_compare);

    let mut add = Vec::with_capacity(desired.len());
    let mut del = Vec::with_capacity(existing.len());

    let mut i = 0;
    let mut j = 0;
    while i < existing.len() && j < desired.len() {
        match net_compare(&existing[i], &desired[j]) {
            Ordering::Less => {
                del.push(existing[i]);
                i += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
            Ordering::Greater => {
                add.push(desired[j]);
                j += 1;
            }
        }
    }
    del.extend_from_slice(&existing[i..]);
    add.extend_from_slice(&desired[j..]);

    (add, del)
}

/// Orders prefixes by unmapped address, then by descending prefix length
/// (more specific first for the same destination).
pub fn net_compare(a: &IpNetwork, b: &IpNetwork) -> Ordering {
    let a_ip = a.ip().to_canonical();
    let b_ip = b.ip().to_canonical();
    a_ip.cmp(&b_ip)
        .then_with(|| b.prefix().cmp(&a.prefix()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn delta_disjoint_sets() {
        let existing = [net("10.0.0.0/24")];
        let desired = [net("192.168.1.0/24")];
        let (add, del) = delta(&existing, &desired);
        assert_eq!(add, vec![net("192.168.1.0/24")]);
        assert_eq!(del, vec![net("10.0.0.0/24")]);
    }

    #[test]
    fn delta_overlap_is_kept() {
        let existing = [net("10.0.0.0/24"), net("10.9.0.0/24")];
        let desired = [net("10.9.0.0/24"), net("172.16.0.0/12")];
        let (add, del) = delta(&existing, &desired);
        assert_eq!(add, vec![net("172.16.0.0/12")]);
        assert_eq!(del, vec![net("10.0.0.0/24")]);
    }

    #[test]
    fn delta_equal_sets_change_nothing() {
        let nets = [net("0.0.0.0/1"), net("128.0.0.0/1"), net("::/1")];
        let (add, del) = delta(&nets, &nets);
        assert!(add.is_empty());
        assert!(del.is_empty());
    }

    #[test]
    fn compare_prefers_longer_prefix_for_same_destination() {
        assert_eq!(
            net_compare(&net("10.0.0.0/24"), &net("10.0.0.0/8")),
            Ordering::Less
        );
        assert_eq!(
            net_compare(&net("10.0.0.0/8"), &net("10.0.0.0/8")),
            Ordering::Equal
        );
    }

    #[test]
    fn compare_unmaps_v4_in_v6() {
        let mapped: IpNetwork = "::ffff:10.0.0.0/104".parse().unwrap();
        let plain = net("10.0.0.0/8");
        // Same canonical address; the longer (mapped) prefix sorts first.
        assert_eq!(net_compare(&mapped, &plain), Ordering::Less);
    }
}
