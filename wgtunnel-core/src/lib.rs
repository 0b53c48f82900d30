//! Tunnel lifecycle orchestrator.
//!
//! Couples the firewall, the router, the bootstrap resolver and the
//! WireGuard engine: brings tunnels up in an order that never leaks a
//! packet, substitutes dummy endpoints until hostname peers resolve, and
//! tears everything down crash-safe.

pub mod config;
pub mod proxy;
pub mod secrets;
pub mod supervisor;
pub mod uapi;

pub(crate) mod device;
pub(crate) mod monitor;
pub(crate) mod registry;
pub(crate) mod runtime;

pub use registry::StatusCallback;
pub use runtime::{block_on, ensure_initialized};

/// Kill-switch entry points shared by the FFI surface.
pub mod killswitch {
    use firewall::Firewall as _;

    /// Enables (persistently) or disables the kill switch. Returns the new
    /// state, or an error if the backend is unavailable.
    pub fn set(enabled: bool) -> Result<bool, firewall::Error> {
        let fw = firewall::get()?;
        if enabled {
            fw.set_persist(true);
            fw.enable()?;
            tracing::info!("Kill switch enabled");
        } else {
            fw.disable()?;
            tracing::info!("Kill switch disabled");
        }
        Ok(enabled)
    }

    /// True iff the switch is up and pinned persistently.
    pub fn status() -> Result<bool, firewall::Error> {
        let fw = firewall::get()?;
        Ok(fw.is_enabled() && fw.is_persistent())
    }

    /// Toggles the LAN exemption. Requires an enabled switch.
    pub fn set_lan_bypass(enabled: bool) -> Result<bool, firewall::Error> {
        let fw = firewall::get()?;
        if enabled {
            fw.allow_local_networks(&firewall::local_network_prefixes())?;
            tracing::info!("Kill switch LAN bypass enabled");
        } else {
            fw.remove_local_networks()?;
            tracing::info!("Kill switch LAN bypass disabled");
        }
        Ok(enabled)
    }

    pub fn lan_bypass_status() -> Result<bool, firewall::Error> {
        Ok(firewall::get()?.is_allow_local_networks_enabled())
    }
}

/// Interface name for a tunnel handle. macOS requires the `utunN` form;
/// the offset keeps us clear of system-assigned utun devices.
pub(crate) fn iface_name(handle: i32) -> String {
    #[cfg(target_os = "macos")]
    {
        format!("utun{}", 61 + handle)
    }
    #[cfg(not(target_os = "macos"))]
    {
        format!("wgt{handle}")
    }
}
