//! UAPI text protocol: request rendering and response parsing.
//!
//! The protocol is the standard WireGuard key/value dialect: a `set=1` or
//! `get=1` line, key/value pairs, a blank-line terminator, and an `errno=`
//! status in responses.

use std::net::SocketAddr;

use crate::config::{Endpoint, TunnelConfig};

/// Renders the full device configuration: interface keys first, then every
/// peer with `replace_peers` semantics. On Linux the bypass mark rides
/// along as `fwmark`, which makes the engine mark its own encrypted
/// sockets.
pub fn device_request(config: &TunnelConfig) -> String {
    let mut body = String::new();

    push(&mut body, "private_key", &config.interface.private_key.to_hex());
    if let Some(port) = config.interface.listen_port {
        push(&mut body, "listen_port", &port.to_string());
    }
    #[cfg(target_os = "linux")]
    push(
        &mut body,
        "fwmark",
        &tunnel_types::marks::BYPASS_MARK.to_string(),
    );

    if !config.peers.is_empty() {
        push(&mut body, "replace_peers", "true");
    }
    for peer in &config.peers {
        push(&mut body, "public_key", &peer.public_key.to_hex());
        if let Some(preshared) = peer.preshared_key {
            push(&mut body, "preshared_key", &preshared.to_hex());
        }
        if let Some(Endpoint::Addr(addr)) = &peer.endpoint {
            push(&mut body, "endpoint", &addr.to_string());
        }
        if let Some(interval) = peer.persistent_keepalive {
            push(&mut body, "persistent_keepalive_interval", &interval.to_string());
        }
        for allowed in &peer.allowed_ips {
            push(&mut body, "allowed_ip", &allowed.to_string());
        }
    }

    body
}

/// Renders a peers-only update that swaps a single peer's endpoint without
/// touching interface fields or other peers.
pub fn peer_endpoint_update(public_key_hex: &str, endpoint: SocketAddr) -> String {
    let mut body = String::new();
    push(&mut body, "public_key", public_key_hex);
    push(&mut body, "update_only", "true");
    push(&mut body, "endpoint", &endpoint.to_string());
    body
}

fn push(body: &mut String, key: &str, value: &str) {
    body.push_str(key);
    body.push('=');
    body.push_str(value);
    body.push('\n');
}

/// The `errno` reported in a response, if present.
pub fn parse_errno(response: &str) -> Option<i32> {
    lookup(response, "errno").and_then(|value| value.parse().ok())
}

/// The port the bind actually bound, reported by `get=1` after open.
pub fn parse_listen_port(response: &str) -> Option<u16> {
    lookup(response, "listen_port").and_then(|value| value.parse().ok())
}

/// Per-peer handshake ages: `(public_key_hex, last_handshake_unix_secs)`.
/// A peer that never shook hands reports 0.
pub fn parse_last_handshakes(response: &str) -> Vec<(String, u64)> {
    let mut peers = Vec::new();
    let mut current: Option<(String, u64)> = None;

    for line in response.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "public_key" => {
                if let Some(peer) = current.take() {
                    peers.push(peer);
                }
                current = Some((value.to_owned(), 0));
            }
            "last_handshake_time_sec" => {
                if let Some((_, handshake)) = current.as_mut() {
                    *handshake = value.parse().unwrap_or(0);
                }
            }
            _ => {}
        }
    }
    if let Some(peer) = current.take() {
        peers.push(peer);
    }

    peers
}

fn lookup<'a>(response: &'a str, wanted: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key == wanted).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;

    const KEY_A: &str = "GBw1GqHgmCTxCnOfIgT6HLGW4CajZ0GVcdq0Vma8j0Y=";
    const KEY_B: &str = "cyDTLWdmNG1nHtQGAw4Es27faeurYRTJ3Nf5BM9RdEE=";

    #[test]
    fn device_request_shape() {
        let text = format!(
            "[Interface]\nPrivateKey = {KEY_A}\nListenPort = 51820\n\n\
             [Peer]\nPublicKey = {KEY_B}\nAllowedIPs = 10.9.0.0/24\n\
             Endpoint = 192.0.2.7:51820\nPersistentKeepalive = 25\n"
        );
        let config = TunnelConfig::parse(&text).unwrap();
        let body = device_request(&config);

        let lines: Vec<&str> = body.lines().collect();
        assert!(lines[0].starts_with("private_key="));
        assert!(lines.contains(&"listen_port=51820"));
        assert!(lines.contains(&"replace_peers=true"));
        assert!(lines.contains(&"endpoint=192.0.2.7:51820"));
        assert!(lines.contains(&"persistent_keepalive_interval=25"));
        assert!(lines.contains(&"allowed_ip=10.9.0.0/24"));
        // The interface section precedes the first peer.
        let private = lines.iter().position(|l| l.starts_with("private_key=")).unwrap();
        let public = lines.iter().position(|l| l.starts_with("public_key=")).unwrap();
        assert!(private < public);

        #[cfg(target_os = "linux")]
        assert!(
            lines.contains(
                &format!("fwmark={}", tunnel_types::marks::BYPASS_MARK).as_str()
            )
        );
    }

    #[test]
    fn endpoint_update_is_peers_only() {
        let body = peer_endpoint_update("ab".repeat(32).as_str(), "192.0.2.9:51820".parse().unwrap());
        assert_eq!(
            body,
            format!(
                "public_key={}\nupdate_only=true\nendpoint=192.0.2.9:51820\n",
                "ab".repeat(32)
            )
        );
        assert!(!body.contains("private_key"));
        assert!(!body.contains("replace_peers"));
    }

    #[test]
    fn parses_get_response() {
        let response = "private_key=00\nlisten_port=51999\n\
                        public_key=aa\nlast_handshake_time_sec=1700000000\n\
                        public_key=bb\nendpoint=192.0.2.7:51820\n\
                        errno=0\n";

        assert_eq!(parse_errno(response), Some(0));
        assert_eq!(parse_listen_port(response), Some(51999));
        assert_eq!(
            parse_last_handshakes(response),
            vec![("aa".to_owned(), 1_700_000_000), ("bb".to_owned(), 0)]
        );
    }
}
