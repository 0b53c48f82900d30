//! Bootstrap DNS resolution for peer endpoints.
//!
//! Lookups run over the [`bypass-dialer`](bypass_dialer) so they never enter
//! the tunnel they are trying to establish. Upstreams are given as URLs
//! (`udp://1.1.1.1:53`, `tcp://…`, `tls://…`, `https://…`, `quic://…`,
//! `sdns://…`); the wire exchange itself speaks plain DNS to the upstream's
//! address, with length-prefixed framing for `tcp://`.

mod exchange;
mod upstream;

pub use upstream::{Scheme, Upstream};

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use bypass_dialer::BypassDialer;
use hickory_proto::rr::RecordType;
use tokio_util::sync::CancellationToken;

/// Default upstream and per-query timeout.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub upstream_url: String,
    pub timeout: Duration,
    /// Prefer the AAAA answer when both families resolve.
    pub prefer_ipv6: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            upstream_url: "udp://1.1.1.1:53".to_owned(),
            timeout: Duration::from_secs(5),
            prefer_ipv6: false,
        }
    }
}

/// Answer of a successful resolution. At least one list is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

impl Resolved {
    /// The address the supervisor should install, honoring the preference.
    pub fn pick(&self, prefer_ipv6: bool) -> Option<std::net::IpAddr> {
        if prefer_ipv6 {
            if let Some(ip) = self.v6.first() {
                return Some((*ip).into());
            }
        }
        if let Some(ip) = self.v4.first() {
            return Some((*ip).into());
        }
        self.v6.first().map(|ip| (*ip).into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid upstream URL: {0}")]
    InvalidUpstream(String),
    #[error("network error: {0}")]
    Network(#[source] io::Error),
    #[error("DNS response code {0}")]
    Rcode(u16),
    #[error("no addresses in answer")]
    NoAddresses,
    #[error("resolution cancelled")]
    Cancelled,
    #[error("A: {a}; AAAA: {aaaa}")]
    BothFailed {
        a: Box<ResolveError>,
        aaaa: Box<ResolveError>,
    },
}

impl ResolveError {
    fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::BothFailed { a, aaaa } => a.is_cancelled() || aaaa.is_cancelled(),
            _ => false,
        }
    }
}

/// Resolves `host` once: A and AAAA in parallel on the shared upstream.
///
/// Partial success is success. Both queries failing joins the errors; both
/// succeeding with empty answers is [`ResolveError::NoAddresses`]. AAAA is
/// skipped entirely on hosts without an IPv6 stack.
pub async fn resolve(
    host: &str,
    options: &ResolverOptions,
    dialer: &BypassDialer,
) -> Result<Resolved, ResolveError> {
    let upstream = Upstream::parse(&options.upstream_url)?;
    let server = upstream.server_addr().await?;

    tracing::debug!(%host, %server, scheme = ?upstream.scheme, "Resolving peer endpoint");

    let query_v6 = tunnel_types::supports_ipv6();

    let (answer_a, answer_aaaa) = tokio::join!(
        exchange::query(dialer, &upstream, server, host, RecordType::A, options.timeout),
        async {
            if query_v6 {
                exchange::query(
                    dialer,
                    &upstream,
                    server,
                    host,
                    RecordType::AAAA,
                    options.timeout,
                )
                .await
            } else {
                Ok(Vec::new())
            }
        },
    );

    let (v4, v6) = match (answer_a, answer_aaaa) {
        (Err(a), Err(aaaa)) => {
            return Err(ResolveError::BothFailed {
                a: Box::new(a),
                aaaa: Box::new(aaaa),
            });
        }
        (Ok(a), Ok(aaaa)) => (a, aaaa),
        (Ok(a), Err(e)) => {
            if a.is_empty() {
                return Err(e);
            }
            (a, Vec::new())
        }
        (Err(e), Ok(aaaa)) => {
            if aaaa.is_empty() {
                return Err(e);
            }
            (Vec::new(), aaaa)
        }
    };

    let resolved = Resolved {
        v4: v4
            .into_iter()
            .filter_map(|ip| match ip {
                std::net::IpAddr::V4(v4) => Some(v4),
                std::net::IpAddr::V6(_) => None,
            })
            .collect(),
        v6: v6
            .into_iter()
            .filter_map(|ip| match ip {
                std::net::IpAddr::V6(v6) => Some(v6),
                std::net::IpAddr::V4(_) => None,
            })
            .collect(),
    };

    if resolved.v4.is_empty() && resolved.v6.is_empty() {
        return Err(ResolveError::NoAddresses);
    }

    Ok(resolved)
}

/// Retries [`resolve`] with exponential backoff, forever, until the token is
/// cancelled. Cancellation is a permanent error: the backoff terminates
/// without another attempt.
pub async fn resolve_with_backoff(
    host: &str,
    options: &ResolverOptions,
    dialer: &BypassDialer,
    cancel: &CancellationToken,
) -> Result<Resolved, ResolveError> {
    let backoff = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(None)
        .build();

    let attempt = || async {
        if cancel.is_cancelled() {
            return Err(backoff::Error::permanent(ResolveError::Cancelled));
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ResolveError::Cancelled),
            result = resolve(host, options, dialer) => result,
        };

        match result {
            Ok(resolved) => Ok(resolved),
            Err(e) if e.is_cancelled() => {
                Err(backoff::Error::permanent(ResolveError::Cancelled))
            }
            Err(e) => {
                tracing::warn!(%host, "Resolution attempt failed, retrying: {e}");
                Err(backoff::Error::transient(e))
            }
        }
    };

    // The select interrupts a backoff sleep immediately; the inner check
    // turns the interrupt into the permanent-error contract.
    tokio::select! {
        _ = cancel.cancelled() => Err(ResolveError::Cancelled),
        result = backoff::future::retry(backoff, attempt) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_token_is_permanent() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let options = ResolverOptions::default();
        let dialer = BypassDialer::new();

        let err = resolve_with_backoff("vpn.example.com", &options, &dialer, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
    }

    #[tokio::test]
    async fn cancel_during_backoff_exits_promptly() {
        let cancel = CancellationToken::new();
        // Unroutable upstream: every attempt fails fast, then backs off.
        let options = ResolverOptions {
            upstream_url: "udp://127.0.0.1:1".to_owned(),
            timeout: Duration::from_millis(50),
            prefer_ipv6: false,
        };
        let dialer = BypassDialer::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };

        let err = resolve_with_backoff("vpn.example.com", &options, &dialer, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
        canceller.await.unwrap();
    }

    #[test]
    fn pick_honors_preference() {
        let resolved = Resolved {
            v4: vec![Ipv4Addr::new(192, 0, 2, 10)],
            v6: vec![Ipv6Addr::LOCALHOST],
        };
        assert_eq!(
            resolved.pick(true),
            Some(std::net::IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(
            resolved.pick(false),
            Some(std::net::IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
        );

        let v4_only = Resolved {
            v4: vec![Ipv4Addr::new(192, 0, 2, 10)],
            v6: vec![],
        };
        assert_eq!(
            v4_only.pick(true),
            Some(std::net::IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
        );
    }
}
