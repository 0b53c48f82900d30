use std::net::{IpAddr, SocketAddr};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::ResolveError;

/// Transport scheme of an upstream URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Udp,
    Tcp,
    Tls,
    Https,
    Quic,
    /// A DNSCrypt server stamp (`sdns://…`).
    DnsCrypt,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Udp | Scheme::Tcp => 53,
            Scheme::Tls | Scheme::Quic => 853,
            Scheme::Https | Scheme::DnsCrypt => 443,
        }
    }
}

/// A parsed DNS upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        if let Some(stamp) = raw.strip_prefix("sdns://") {
            return Self::parse_stamp(stamp);
        }

        let url = url::Url::parse(raw)
            .map_err(|e| ResolveError::InvalidUpstream(format!("{raw}: {e}")))?;

        let scheme = match url.scheme() {
            "udp" => Scheme::Udp,
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            "https" => Scheme::Https,
            "quic" => Scheme::Quic,
            other => {
                return Err(ResolveError::InvalidUpstream(format!(
                    "unsupported scheme {other}"
                )));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ResolveError::InvalidUpstream(format!("{raw}: missing host")))?
            .to_owned();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self { scheme, host, port })
    }

    /// Decodes a DNSCrypt server stamp far enough to extract the embedded
    /// server address: one protocol byte, eight property bytes, then a
    /// length-prefixed `addr[:port]` string.
    fn parse_stamp(stamp: &str) -> Result<Self, ResolveError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(stamp)
            .map_err(|e| ResolveError::InvalidUpstream(format!("bad stamp encoding: {e}")))?;

        let addr_len = *bytes
            .get(9)
            .ok_or_else(|| ResolveError::InvalidUpstream("stamp too short".to_owned()))?
            as usize;
        let addr_bytes = bytes
            .get(10..10 + addr_len)
            .ok_or_else(|| ResolveError::InvalidUpstream("stamp address truncated".to_owned()))?;
        let addr = std::str::from_utf8(addr_bytes)
            .map_err(|_| ResolveError::InvalidUpstream("stamp address not UTF-8".to_owned()))?;

        let (host, port) = split_host_port(addr, Scheme::DnsCrypt.default_port())?;

        Ok(Self {
            scheme: Scheme::DnsCrypt,
            host,
            port,
        })
    }

    /// Whether queries to this upstream use TCP framing.
    pub fn uses_tcp(&self) -> bool {
        self.scheme == Scheme::Tcp
    }

    /// The socket address to exchange queries with. Hostname upstreams fall
    /// back to the system resolver; bootstrap upstreams are expected to be
    /// IP literals (the default is).
    pub async fn server_addr(&self) -> Result<SocketAddr, ResolveError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(ResolveError::Network)?
            .next()
            .ok_or_else(|| {
                ResolveError::InvalidUpstream(format!("upstream {} did not resolve", self.host))
            })
    }
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16), ResolveError> {
    // Try full socket-address forms first ("1.2.3.4:443", "[::1]:443").
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok((sa.ip().to_string(), sa.port()));
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok((ip.to_string(), default_port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ResolveError::InvalidUpstream(format!("bad port in {addr}")))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((addr.to_owned(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_schemes() {
        let cases = [
            ("udp://1.1.1.1:53", Scheme::Udp, "1.1.1.1", 53),
            ("udp://9.9.9.9", Scheme::Udp, "9.9.9.9", 53),
            ("tcp://1.1.1.1:53", Scheme::Tcp, "1.1.1.1", 53),
            ("tls://1.1.1.1:853", Scheme::Tls, "1.1.1.1", 853),
            ("tls://8.8.8.8", Scheme::Tls, "8.8.8.8", 853),
            (
                "https://cloudflare-dns.com/dns-query",
                Scheme::Https,
                "cloudflare-dns.com",
                443,
            ),
            (
                "quic://dns.adguard-dns.com:853",
                Scheme::Quic,
                "dns.adguard-dns.com",
                853,
            ),
        ];

        for (raw, scheme, host, port) in cases {
            let upstream = Upstream::parse(raw).unwrap();
            assert_eq!(upstream.scheme, scheme, "{raw}");
            assert_eq!(upstream.host, host, "{raw}");
            assert_eq!(upstream.port, port, "{raw}");
        }
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            Upstream::parse("ftp://1.1.1.1"),
            Err(ResolveError::InvalidUpstream(_))
        ));
        assert!(matches!(
            Upstream::parse("not a url"),
            Err(ResolveError::InvalidUpstream(_))
        ));
    }

    #[test]
    fn parses_dnscrypt_stamp() {
        // Hand-built stamp: proto 0x01, props 0, addr "9.9.9.9:8443".
        let mut bytes = vec![0x01];
        bytes.extend_from_slice(&[0u8; 8]);
        let addr = b"9.9.9.9:8443";
        bytes.push(addr.len() as u8);
        bytes.extend_from_slice(addr);
        let stamp = format!("sdns://{}", URL_SAFE_NO_PAD.encode(&bytes));

        let upstream = Upstream::parse(&stamp).unwrap();
        assert_eq!(upstream.scheme, Scheme::DnsCrypt);
        assert_eq!(upstream.host, "9.9.9.9");
        assert_eq!(upstream.port, 8443);
    }

    #[test]
    fn stamp_without_port_uses_default() {
        let mut bytes = vec![0x01];
        bytes.extend_from_slice(&[0u8; 8]);
        let addr = b"9.9.9.9";
        bytes.push(addr.len() as u8);
        bytes.extend_from_slice(addr);
        let stamp = format!("sdns://{}", URL_SAFE_NO_PAD.encode(&bytes));

        let upstream = Upstream::parse(&stamp).unwrap();
        assert_eq!(upstream.port, 443);
    }

    #[tokio::test]
    async fn literal_upstream_resolves_without_network() {
        let upstream = Upstream::parse("udp://1.1.1.1:53").unwrap();
        let addr = upstream.server_addr().await.unwrap();
        assert_eq!(addr, "1.1.1.1:53".parse().unwrap());
    }
}
