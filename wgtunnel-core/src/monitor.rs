//! Tunnel health monitor.
//!
//! The engine exposes handshake timestamps through `get=1`; this task polls
//! them and forwards transitions to the host callback: a fresh handshake is
//! healthy, a stale one (or none at all) is a handshake failure.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tunnel_types::StatusCode;

use crate::device::UapiClient;
use crate::{registry, uapi};

const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Handshakes are expected at least every 2 minutes; 3 minutes of silence
/// after a first successful handshake means the path is down.
const STALE_HANDSHAKE: Duration = Duration::from_secs(180);

/// A peer that never completed a handshake gets a grace period before the
/// failure is reported, covering slow first connects.
const FIRST_HANDSHAKE_GRACE: Duration = Duration::from_secs(30);

pub(crate) async fn run(handle: i32, client: UapiClient, cancel: CancellationToken) {
    let started = SystemTime::now();
    let mut last_reported: Option<StatusCode> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        // Resolution owns the status channel while it is in flight.
        if registry::is_resolving(handle) {
            continue;
        }

        let response = match client.get().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(handle, "Monitor failed to query device: {e}");
                continue;
            }
        };

        let Some(status) = derive_status(&response, started) else {
            continue;
        };

        if last_reported != Some(status) {
            tracing::debug!(handle, ?status, "Tunnel status transition");
            registry::notify(handle, status);
            last_reported = Some(status);
        }
    }
}

fn derive_status(response: &str, started: SystemTime) -> Option<StatusCode> {
    let peers = uapi::parse_last_handshakes(response);
    if peers.is_empty() {
        return None;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let freshest = peers.iter().map(|(_, handshake)| *handshake).max()?;

    if freshest == 0 {
        let age = SystemTime::now()
            .duration_since(started)
            .unwrap_or_default();
        if age < FIRST_HANDSHAKE_GRACE {
            return None;
        }
        return Some(StatusCode::HandshakeFailure);
    }

    if now.saturating_sub(freshest) > STALE_HANDSHAKE.as_secs() {
        Some(StatusCode::HandshakeFailure)
    } else {
        Some(StatusCode::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_peers_reports_nothing() {
        assert_eq!(derive_status("listen_port=1\n", SystemTime::now()), None);
    }

    #[test]
    fn fresh_handshake_is_healthy() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let response = format!("public_key=aa\nlast_handshake_time_sec={}\n", now - 10);
        assert_eq!(
            derive_status(&response, SystemTime::now()),
            Some(StatusCode::Healthy)
        );
    }

    #[test]
    fn stale_handshake_is_a_failure() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let response = format!("public_key=aa\nlast_handshake_time_sec={}\n", now - 600);
        assert_eq!(
            derive_status(&response, SystemTime::now()),
            Some(StatusCode::HandshakeFailure)
        );
    }

    #[test]
    fn missing_first_handshake_gets_grace() {
        let response = "public_key=aa\nlast_handshake_time_sec=0\n";
        assert_eq!(derive_status(response, SystemTime::now()), None);

        let long_ago = SystemTime::now() - Duration::from_secs(120);
        assert_eq!(
            derive_status(response, long_ago),
            Some(StatusCode::HandshakeFailure)
        );
    }
}
