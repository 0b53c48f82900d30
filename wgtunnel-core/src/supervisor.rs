//! Tunnel supervisor: bring-up ordering, async endpoint resolution,
//! teardown and crash-safe cleanup.
//!
//! Bring-up: allocate a handle, register the callback, parse the config and
//! swap hostname endpoints for dummies, create the engine (TUN + bind),
//! push the initial UAPI configuration, learn the bound port, construct the
//! router over the shared firewall and apply the routing config (which
//! engages the kill switch for full tunnels), then spawn one cancellable
//! resolution task per unresolved peer. Any failure runs the partial
//! cleanup and surfaces as an error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::LazyLock;

use anyhow::{Context as _, Result};
use bootstrap_dns::ResolverOptions;
use bypass_dialer::BypassDialer;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tunnel_types::StatusCode;

use crate::config::{TunnelConfig, UnresolvedPeer};
use crate::device::{Device, UapiClient};
use crate::{monitor, registry, runtime, uapi};

/// The resolver preference is not surfaced to hosts yet; IPv4 answers win.
const PREFER_IPV6: bool = false;

static TUNNELS: LazyLock<Mutex<HashMap<i32, TunnelHandle>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Per-tunnel state, owned solely by the supervisor.
struct TunnelHandle {
    device: Option<Device>,
    uapi: Option<UapiClient>,
    router: Option<router::OsRouter>,
    cancel: CancellationToken,
}

impl TunnelHandle {
    fn empty() -> Self {
        Self {
            device: None,
            uapi: None,
            router: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Ordered, idempotent teardown: cancel resolution, drop the UAPI
    /// client, close the router (which reverts DNS and releases the kill
    /// switch), close the device. Missing fields are no-ops.
    async fn close(&mut self) {
        self.cancel.cancel();

        drop(self.uapi.take());

        if let Some(mut os_router) = self.router.take() {
            use router::Router as _;
            if let Err(e) = os_router.close().await {
                tracing::warn!("Router close failed: {e}");
            }
        }

        if let Some(mut device) = self.device.take() {
            device.close();
        }
    }
}

/// Brings a tunnel up from its textual configuration. Returns the handle.
pub fn turn_on(config_text: &str, callback: Option<registry::StatusCallback>) -> Result<i32> {
    runtime::ensure_initialized();
    runtime::block_on(turn_on_inner(config_text, callback))
}

async fn turn_on_inner(
    config_text: &str,
    callback: Option<registry::StatusCallback>,
) -> Result<i32> {
    let handle_id = registry::allocate(callback).context("Unable to find empty handle")?;

    match bring_up(handle_id, config_text).await {
        Ok(()) => Ok(handle_id),
        Err(e) => {
            tracing::debug!(
                handle_id,
                "Startup failed, cleaning up partial resources"
            );
            if let Some(mut handle) = TUNNELS.lock().await.remove(&handle_id) {
                handle.close().await;
            }
            registry::release(handle_id);
            Err(e)
        }
    }
}

async fn bring_up(handle_id: i32, config_text: &str) -> Result<()> {
    let mut config = TunnelConfig::parse(config_text).context("Invalid config file")?;
    let resolution_queue = config.take_unresolved_peers();

    let mut handle = TunnelHandle::empty();
    let iface = crate::iface_name(handle_id);

    // Engine creation blocks on TUN and socket setup.
    let device = {
        let iface = iface.clone();
        tokio::task::spawn_blocking(move || Device::create(&iface))
            .await
            .context("Device creation task panicked")?
            .context("Create TUN failed")?
    };
    let uapi = device.uapi();
    handle.device = Some(device);
    handle.uapi = Some(uapi.clone());

    // Partially-built state must be reachable for cleanup before any
    // fallible step below.
    TUNNELS.lock().await.insert(handle_id, handle);

    configure(handle_id, &iface, &uapi, &config, &resolution_queue).await?;

    tracing::debug!(handle_id, %iface, "Device started successfully");
    Ok(())
}

async fn configure(
    handle_id: i32,
    iface: &str,
    uapi: &UapiClient,
    config: &TunnelConfig,
    resolution_queue: &[UnresolvedPeer],
) -> Result<()> {
    uapi.set(&uapi::device_request(config))
        .await
        .context("Initial device configuration failed")?;

    // The engine opened its bind during configuration; read back the port
    // it actually bound so the firewall can punch it.
    let state = uapi.get().await.context("Failed to query device state")?;
    let listen_port = uapi::parse_listen_port(&state)
        .or(config.interface.listen_port)
        .unwrap_or(0);

    let fw = firewall::get().context("Firewall backend unavailable")?;
    let mut os_router =
        router::OsRouter::new(iface, fw).context("Failed to construct router")?;

    let router_config = config.to_router_config(listen_port);
    {
        use router::Router as _;
        if let Err(e) = os_router.set(Some(&router_config)).await {
            // A failed set may have engaged the kill switch already; the
            // close path releases it again.
            if let Err(close_err) = os_router.close().await {
                tracing::warn!("Cleanup of failed router also failed: {close_err}");
            }
            return Err(e).context("Failed to apply router config");
        }
    }

    let cancel = {
        let mut tunnels = TUNNELS.lock().await;
        let handle = tunnels
            .get_mut(&handle_id)
            .context("Tunnel disappeared during bring-up")?;
        handle.router = Some(os_router);
        handle.cancel.clone()
    };

    for peer in resolution_queue {
        runtime::handle().spawn(resolve_and_update_peer(
            handle_id,
            uapi.clone(),
            peer.clone(),
            cancel.clone(),
        ));
    }

    runtime::handle().spawn(monitor::run(handle_id, uapi.clone(), cancel));

    Ok(())
}

/// Resolves one peer's hostname over the bypass path and swaps the dummy
/// endpoint for the real one via a peers-only UAPI update.
async fn resolve_and_update_peer(
    handle_id: i32,
    uapi: UapiClient,
    peer: UnresolvedPeer,
    cancel: CancellationToken,
) {
    registry::set_resolving(handle_id, true);
    registry::notify(handle_id, StatusCode::ResolvingDns);

    let options = ResolverOptions {
        prefer_ipv6: PREFER_IPV6,
        ..Default::default()
    };
    let dialer = BypassDialer::new();

    let resolved =
        match bootstrap_dns::resolve_with_backoff(&peer.host, &options, &dialer, &cancel).await {
            Ok(resolved) => resolved,
            Err(bootstrap_dns::ResolveError::Cancelled) => {
                tracing::debug!(host = %peer.host, "Tunnel closed, stopping resolver");
                registry::set_resolving(handle_id, false);
                return;
            }
            Err(e) => {
                tracing::error!(host = %peer.host, "Permanent failure resolving: {e}");
                return;
            }
        };

    let Some(ip) = resolved.pick(options.prefer_ipv6) else {
        tracing::error!(host = %peer.host, "No suitable IP resolved");
        return;
    };
    tracing::debug!(host = %peer.host, %ip, "Resolved peer endpoint");

    // The handle may have been torn down while we were resolving.
    if !TUNNELS.lock().await.contains_key(&handle_id) {
        tracing::debug!(host = %peer.host, "Tunnel down, skipping endpoint update");
        return;
    }

    let update = uapi::peer_endpoint_update(&peer.public_key_hex, SocketAddr::new(ip, peer.port));
    if let Err(e) = uapi.set(&update).await {
        tracing::error!(host = %peer.host, "Failed to update peer endpoint: {e}");
        return;
    }

    registry::set_resolving(handle_id, false);
    registry::notify(handle_id, StatusCode::Healthy);
    tracing::debug!(host = %peer.host, "Peer endpoint updated");
}

/// Tears one tunnel down. Unknown handles are logged and ignored.
pub fn turn_off(handle_id: i32) {
    runtime::ensure_initialized();
    runtime::block_on(turn_off_inner(handle_id));
}

async fn turn_off_inner(handle_id: i32) {
    let Some(mut handle) = TUNNELS.lock().await.remove(&handle_id) else {
        tracing::error!(handle_id, "Tunnel is not up");
        return;
    };

    handle.close().await;
    registry::release(handle_id);
    tracing::info!(handle_id, "Tunnel closed");
}

/// Tears every tunnel down.
pub fn turn_off_all() {
    runtime::ensure_initialized();
    runtime::block_on(turn_off_all_inner());
}

pub(crate) async fn turn_off_all_inner() {
    let handles: Vec<i32> = TUNNELS.lock().await.keys().copied().collect();
    for handle_id in handles {
        turn_off_inner(handle_id).await;
    }
}

/// The device's current UAPI state, or `None` for unknown handles.
pub fn get_config(handle_id: i32) -> Option<String> {
    runtime::ensure_initialized();
    runtime::block_on(async {
        let uapi = TUNNELS.lock().await.get(&handle_id)?.uapi.clone()?;
        match uapi.get().await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(handle_id, "Failed to get device config: {e}");
                None
            }
        }
    })
}
