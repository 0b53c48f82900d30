//! Proxy-mode handle management.
//!
//! The socks/http data plane is an external collaborator; what the core
//! owns is the shared config parsing, the handle/callback registry and the
//! config read-back, so the host can manage proxy instances through the
//! same surface as tunnels.

use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;

use crate::config::TunnelConfig;
use crate::{registry, runtime, uapi};

struct ProxyInstance {
    config: TunnelConfig,
}

static PROXIES: LazyLock<Mutex<HashMap<i32, ProxyInstance>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Validates the configuration and registers a proxy handle.
pub fn turn_on(config_text: &str, callback: Option<registry::StatusCallback>) -> Result<i32> {
    runtime::ensure_initialized();

    let mut config = TunnelConfig::parse(config_text).context("Invalid config file")?;
    // Proxy peers resolve through the regular system path; there is no
    // kill switch to escape. Dummy substitution still applies so an
    // unresolvable name cannot poison the rendered config.
    let unresolved = config.take_unresolved_peers();
    if !unresolved.is_empty() {
        tracing::debug!(
            peers = unresolved.len(),
            "Proxy config has hostname endpoints; they resolve lazily"
        );
    }

    let handle_id = registry::allocate(callback).context("Unable to find empty handle")?;
    PROXIES.lock().insert(handle_id, ProxyInstance { config });

    tracing::debug!(handle_id, "Proxy instance registered");
    Ok(handle_id)
}

pub fn turn_off(handle_id: i32) {
    if PROXIES.lock().remove(&handle_id).is_none() {
        tracing::error!(handle_id, "Proxy handle not found");
        return;
    }
    registry::release(handle_id);
    tracing::debug!(handle_id, "Proxy instance closed");
}

pub fn turn_off_all() {
    let handles: Vec<i32> = PROXIES.lock().keys().copied().collect();
    for handle_id in &handles {
        turn_off(*handle_id);
    }
    tracing::debug!(count = handles.len(), "Proxy fully reset");
}

/// The instance's configuration in UAPI form.
pub fn get_config(handle_id: i32) -> Option<String> {
    let proxies = PROXIES.lock();
    let instance = proxies.get(&handle_id)?;
    Some(uapi::device_request(&instance.config))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "[Interface]\n\
        PrivateKey = GBw1GqHgmCTxCnOfIgT6HLGW4CajZ0GVcdq0Vma8j0Y=\n\
        Address = 10.9.0.2/32\n\n\
        [Peer]\n\
        PublicKey = cyDTLWdmNG1nHtQGAw4Es27faeurYRTJ3Nf5BM9RdEE=\n\
        AllowedIPs = 0.0.0.0/0\n\
        Endpoint = 192.0.2.7:51820\n";

    #[test]
    fn proxy_lifecycle() {
        let handle = turn_on(CONFIG, None).unwrap();

        let rendered = get_config(handle).unwrap();
        assert!(rendered.contains("endpoint=192.0.2.7:51820"));
        assert!(rendered.contains("replace_peers=true"));

        turn_off(handle);
        assert!(get_config(handle).is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(turn_on("not a config", None).is_err());
    }
}
