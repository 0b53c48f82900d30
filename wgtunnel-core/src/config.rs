//! Tunnel configuration: the wg-quick INI dialect.
//!
//! `[Interface]` carries the local key, addresses, DNS and MTU; each
//! `[Peer]` carries a public key, allowed IPs and an optional endpoint.
//! Endpoints given as hostnames are replaced with a dummy, non-routable
//! address before the config ever reaches the engine; the original host is
//! queued for bootstrap resolution.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ipnetwork::IpNetwork;
use tunnel_types::RouterConfig;

/// Documentation address (TEST-NET-3) that routes nowhere; peers keep their
/// original port so the first handshake after resolution needs no
/// interface-level changes.
pub const DUMMY_ENDPOINT: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

const DEFAULT_MTU: u16 = 1420;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: expected `key = value`")]
    Syntax { line: usize },
    #[error("line {line}: unknown section [{name}]")]
    UnknownSection { line: usize, name: String },
    #[error("line {line}: {key} outside of a section")]
    KeyOutsideSection { line: usize, key: String },
    #[error("line {line}: invalid value for {key}: {value}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("missing [Interface] section")]
    MissingInterface,
    #[error("[Interface] is missing PrivateKey")]
    MissingPrivateKey,
    #[error("peer {index} is missing PublicKey")]
    MissingPublicKey { index: usize },
}

/// A curve25519 key, parsed from base64 and rendered as hex for UAPI.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key([u8; 32]);

impl Key {
    pub fn from_base64(s: &str) -> Option<Self> {
        let bytes = BASE64.decode(s.trim()).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(hidden)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Addr(SocketAddr),
    /// A hostname that still needs bootstrap resolution.
    Host { host: String, port: u16 },
}

impl Endpoint {
    fn parse(value: &str) -> Option<Self> {
        if let Ok(addr) = value.parse::<SocketAddr>() {
            return Some(Endpoint::Addr(addr));
        }
        // host:port with a DNS name, or a bracketed v6 literal that the
        // SocketAddr parser already handled above.
        let (host, port) = value.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() || host.contains(':') {
            return None;
        }
        Some(Endpoint::Host {
            host: host.to_owned(),
            port,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: Key,
    pub addresses: Vec<IpNetwork>,
    pub dns: Vec<IpAddr>,
    pub search_domains: Vec<String>,
    pub mtu: u16,
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub allowed_ips: Vec<IpNetwork>,
    pub endpoint: Option<Endpoint>,
    pub persistent_keepalive: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

/// A peer whose endpoint was swapped for the dummy address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedPeer {
    pub public_key_hex: String,
    pub host: String,
    pub port: u16,
}

impl TunnelConfig {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        enum Section {
            None,
            Interface,
            Peer,
        }

        struct InterfaceDraft {
            private_key: Option<Key>,
            addresses: Vec<IpNetwork>,
            dns: Vec<IpAddr>,
            search_domains: Vec<String>,
            mtu: u16,
            listen_port: Option<u16>,
        }

        struct PeerDraft {
            public_key: Option<Key>,
            preshared_key: Option<Key>,
            allowed_ips: Vec<IpNetwork>,
            endpoint: Option<Endpoint>,
            persistent_keepalive: Option<u16>,
        }

        let mut section = Section::None;
        let mut interface: Option<InterfaceDraft> = None;
        let mut peers: Vec<PeerDraft> = Vec::new();

        for (number, raw_line) in text.lines().enumerate() {
            let line = number + 1;
            let content = raw_line
                .split_once('#')
                .map_or(raw_line, |(before, _)| before);
            let content = content
                .split_once(';')
                .map_or(content, |(before, _)| before)
                .trim();
            if content.is_empty() {
                continue;
            }

            if let Some(name) = content.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or(ParseError::Syntax { line })?
                    .trim();
                section = match name.to_ascii_lowercase().as_str() {
                    "interface" => {
                        if interface.is_none() {
                            interface = Some(InterfaceDraft {
                                private_key: None,
                                addresses: Vec::new(),
                                dns: Vec::new(),
                                search_domains: Vec::new(),
                                mtu: DEFAULT_MTU,
                                listen_port: None,
                            });
                        }
                        Section::Interface
                    }
                    "peer" => {
                        peers.push(PeerDraft {
                            public_key: None,
                            preshared_key: None,
                            allowed_ips: Vec::new(),
                            endpoint: None,
                            persistent_keepalive: None,
                        });
                        Section::Peer
                    }
                    _ => {
                        return Err(ParseError::UnknownSection {
                            line,
                            name: name.to_owned(),
                        });
                    }
                };
                continue;
            }

            let (key, value) = content.split_once('=').ok_or(ParseError::Syntax { line })?;
            let key = key.trim();
            let value = value.trim();
            let invalid = || ParseError::InvalidValue {
                line,
                key: key.to_owned(),
                value: value.to_owned(),
            };

            match section {
                Section::None => {
                    return Err(ParseError::KeyOutsideSection {
                        line,
                        key: key.to_owned(),
                    });
                }
                Section::Interface => {
                    let draft = interface.as_mut().expect("section implies draft");
                    match key.to_ascii_lowercase().as_str() {
                        "privatekey" => {
                            draft.private_key =
                                Some(Key::from_base64(value).ok_or_else(invalid)?);
                        }
                        "address" => {
                            for part in value.split(',') {
                                draft
                                    .addresses
                                    .push(part.trim().parse().map_err(|_| invalid())?);
                            }
                        }
                        "dns" => {
                            // wg-quick semantics: entries that are not IPs
                            // are search domains.
                            for part in value.split(',') {
                                let part = part.trim();
                                match part.parse::<IpAddr>() {
                                    Ok(ip) => draft.dns.push(ip),
                                    Err(_) => draft.search_domains.push(part.to_owned()),
                                }
                            }
                        }
                        "mtu" => draft.mtu = value.parse().map_err(|_| invalid())?,
                        "listenport" => {
                            draft.listen_port = Some(value.parse().map_err(|_| invalid())?);
                        }
                        // Settings consumed by other frontends (PostUp and
                        // friends) are not ours to interpret.
                        _ => tracing::debug!(key, "Ignoring unsupported [Interface] key"),
                    }
                }
                Section::Peer => {
                    let draft = peers.last_mut().expect("section implies draft");
                    match key.to_ascii_lowercase().as_str() {
                        "publickey" => {
                            draft.public_key =
                                Some(Key::from_base64(value).ok_or_else(invalid)?);
                        }
                        "presharedkey" => {
                            draft.preshared_key =
                                Some(Key::from_base64(value).ok_or_else(invalid)?);
                        }
                        "allowedips" => {
                            for part in value.split(',') {
                                draft
                                    .allowed_ips
                                    .push(part.trim().parse().map_err(|_| invalid())?);
                            }
                        }
                        "endpoint" => {
                            draft.endpoint = Some(Endpoint::parse(value).ok_or_else(invalid)?);
                        }
                        "persistentkeepalive" => {
                            draft.persistent_keepalive =
                                Some(value.parse().map_err(|_| invalid())?);
                        }
                        _ => tracing::debug!(key, "Ignoring unsupported [Peer] key"),
                    }
                }
            }
        }

        let interface = interface.ok_or(ParseError::MissingInterface)?;
        let private_key = interface.private_key.ok_or(ParseError::MissingPrivateKey)?;

        let peers = peers
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                Ok(PeerConfig {
                    public_key: draft
                        .public_key
                        .ok_or(ParseError::MissingPublicKey { index })?,
                    preshared_key: draft.preshared_key,
                    allowed_ips: draft.allowed_ips,
                    endpoint: draft.endpoint,
                    persistent_keepalive: draft.persistent_keepalive,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(TunnelConfig {
            interface: InterfaceConfig {
                private_key,
                addresses: interface.addresses,
                dns: interface.dns,
                search_domains: interface.search_domains,
                mtu: interface.mtu,
                listen_port: interface.listen_port,
            },
            peers,
        })
    }

    /// Swaps every hostname endpoint for the dummy address (keeping the
    /// port) and returns the peers that need resolution.
    pub fn take_unresolved_peers(&mut self) -> Vec<UnresolvedPeer> {
        let mut unresolved = Vec::new();

        for peer in &mut self.peers {
            if let Some(Endpoint::Host { host, port }) = peer.endpoint.clone() {
                peer.endpoint = Some(Endpoint::Addr(SocketAddr::new(
                    IpAddr::V4(DUMMY_ENDPOINT),
                    port,
                )));
                unresolved.push(UnresolvedPeer {
                    public_key_hex: peer.public_key.to_hex(),
                    host,
                    port,
                });
            }
        }

        unresolved
    }

    /// Projects the parsed config onto the record the router and firewall
    /// consume. `listen_port` is the port the bind actually bound.
    pub fn to_router_config(&self, listen_port: u16) -> RouterConfig {
        RouterConfig {
            tunnel_addrs: self.interface.addresses.clone(),
            routes: self
                .peers
                .iter()
                .flat_map(|peer| peer.allowed_ips.iter().copied())
                .collect(),
            dns: self.interface.dns.clone(),
            search_domains: self.interface.search_domains.clone(),
            mtu: self.interface.mtu,
            listen_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "GBw1GqHgmCTxCnOfIgT6HLGW4CajZ0GVcdq0Vma8j0Y=";
    const KEY_B: &str = "cyDTLWdmNG1nHtQGAw4Es27faeurYRTJ3Nf5BM9RdEE=";

    fn full_config() -> String {
        format!(
            r"[Interface]
PrivateKey = {KEY_A}
Address = 10.9.0.2/32, fd42::2/128
DNS = 1.1.1.1, corp.example
MTU = 1380
ListenPort = 51821

[Peer]
PublicKey = {KEY_B}
AllowedIPs = 0.0.0.0/0, ::/0
Endpoint = vpn.example.com:51820
PersistentKeepalive = 25
"
        )
    }

    #[test]
    fn parses_full_config() {
        let config = TunnelConfig::parse(&full_config()).unwrap();

        assert_eq!(config.interface.addresses.len(), 2);
        assert_eq!(config.interface.dns, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.interface.search_domains, vec!["corp.example"]);
        assert_eq!(config.interface.mtu, 1380);
        assert_eq!(config.interface.listen_port, Some(51821));

        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert_eq!(
            peer.endpoint,
            Some(Endpoint::Host {
                host: "vpn.example.com".to_owned(),
                port: 51820,
            })
        );
    }

    #[test]
    fn hostname_endpoints_become_dummies() {
        let mut config = TunnelConfig::parse(&full_config()).unwrap();
        let unresolved = config.take_unresolved_peers();

        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].host, "vpn.example.com");
        assert_eq!(unresolved[0].port, 51820);

        assert_eq!(
            config.peers[0].endpoint,
            Some(Endpoint::Addr(SocketAddr::new(
                IpAddr::V4(DUMMY_ENDPOINT),
                51820,
            )))
        );

        // A second pass finds nothing left to resolve.
        assert!(config.take_unresolved_peers().is_empty());
    }

    #[test]
    fn ip_endpoints_are_left_alone() {
        let text = format!(
            "[Interface]\nPrivateKey = {KEY_A}\n\n[Peer]\nPublicKey = {KEY_B}\n\
             AllowedIPs = 10.9.0.0/24\nEndpoint = 192.0.2.7:51820\n"
        );
        let mut config = TunnelConfig::parse(&text).unwrap();
        assert!(config.take_unresolved_peers().is_empty());
        assert_eq!(
            config.peers[0].endpoint,
            Some(Endpoint::Addr("192.0.2.7:51820".parse().unwrap()))
        );
    }

    #[test]
    fn bracketed_v6_endpoint() {
        let endpoint = Endpoint::parse("[2001:db8::1]:51820").unwrap();
        assert_eq!(
            endpoint,
            Endpoint::Addr("[2001:db8::1]:51820".parse().unwrap())
        );
    }

    #[test]
    fn router_config_projection() {
        let config = TunnelConfig::parse(&full_config()).unwrap();
        let router_config = config.to_router_config(51821);

        assert_eq!(router_config.tunnel_addrs, config.interface.addresses);
        assert!(router_config.has_default(true));
        assert!(router_config.has_default(false));
        assert_eq!(router_config.mtu, 1380);
        assert_eq!(router_config.listen_port, 51821);
    }

    #[test]
    fn split_tunnel_has_no_default() {
        let text = format!(
            "[Interface]\nPrivateKey = {KEY_A}\nAddress = 10.9.0.2/32\n\n\
             [Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 10.9.0.0/24\n"
        );
        let config = TunnelConfig::parse(&text).unwrap();
        let router_config = config.to_router_config(0);
        assert!(!router_config.has_any_default());
        assert_eq!(router_config.routes, vec!["10.9.0.0/24".parse().unwrap()]);
    }

    #[test]
    fn comments_and_case_are_tolerated() {
        let text = format!(
            "# full line comment\n[interface]\nprivatekey = {KEY_A} ; trailing\nmtu = 1400\n"
        );
        let config = TunnelConfig::parse(&text).unwrap();
        assert_eq!(config.interface.mtu, 1400);
    }

    #[test]
    fn errors_are_reported() {
        assert!(matches!(
            TunnelConfig::parse("PrivateKey = x"),
            Err(ParseError::KeyOutsideSection { .. })
        ));
        assert!(matches!(
            TunnelConfig::parse("[Tunnel]\n"),
            Err(ParseError::UnknownSection { .. })
        ));
        assert!(matches!(
            TunnelConfig::parse("[Interface]\nPrivateKey = not-base64!\n"),
            Err(ParseError::InvalidValue { .. })
        ));
        assert!(matches!(
            TunnelConfig::parse("[Peer]\n"),
            Err(ParseError::MissingInterface)
        ));
        let no_pubkey = format!("[Interface]\nPrivateKey = {KEY_A}\n[Peer]\n");
        assert!(matches!(
            TunnelConfig::parse(&no_pubkey),
            Err(ParseError::MissingPublicKey { index: 0 })
        ));
    }
}
