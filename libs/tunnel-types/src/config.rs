use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// The single record both the routing and the firewall controllers consume.
///
/// Equality is structural and order-sensitive for the ordered lists; the
/// router uses it to make `set(cfg)` a no-op when nothing changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// CIDR prefixes assigned to the virtual interface. At most one address
    /// per family acts as the "primary" used for gateway synthesis.
    pub tunnel_addrs: Vec<IpNetwork>,
    /// Prefixes routed through the tunnel. A zero-bit prefix marks the
    /// family as full-tunnel.
    pub routes: Vec<IpNetwork>,
    /// DNS resolvers, v4 and v6 intermixed.
    pub dns: Vec<IpAddr>,
    /// Search suffixes.
    pub search_domains: Vec<String>,
    /// 0 means "leave unchanged".
    pub mtu: u16,
    /// UDP port actually bound by the tunnel after the bind opened.
    pub listen_port: u16,
}

impl RouterConfig {
    /// True iff `routes` contains a zero-bit prefix of the given family.
    pub fn has_default(&self, v4: bool) -> bool {
        self.routes
            .iter()
            .any(|route| route.prefix() == 0 && route.is_ipv4() == v4)
    }

    pub fn has_any_default(&self) -> bool {
        self.has_default(true) || self.has_default(false)
    }

    pub fn is_empty(&self) -> bool {
        *self == RouterConfig::default()
    }

    /// Family-filtered view of `routes`.
    pub fn routes_for(&self, v4: bool) -> impl Iterator<Item = &IpNetwork> {
        self.routes.iter().filter(move |route| route.is_ipv4() == v4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn default_route_detection() {
        let mut config = RouterConfig {
            routes: vec![net("10.9.0.0/24")],
            ..Default::default()
        };
        assert!(!config.has_default(true));
        assert!(!config.has_default(false));

        config.routes.push(net("0.0.0.0/0"));
        assert!(config.has_default(true));
        assert!(!config.has_default(false));
        assert!(config.has_any_default());

        config.routes.push(net("::/0"));
        assert!(config.has_default(false));
    }

    #[test]
    fn equality_is_order_sensitive() {
        let a = RouterConfig {
            dns: vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
            ..Default::default()
        };
        let b = RouterConfig {
            dns: vec!["8.8.8.8".parse().unwrap(), "1.1.1.1".parse().unwrap()],
            ..Default::default()
        };
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn empty_config() {
        assert!(RouterConfig::default().is_empty());
        let config = RouterConfig {
            mtu: 1420,
            ..Default::default()
        };
        assert!(!config.is_empty());
    }
}
