//! C ABI surface.
//!
//! Every entry point is non-throwing: panics are caught, failures come back
//! through the integer/null channel and diagnostics go to the tracing
//! subscriber. Strings returned to the host are owned by the callee until
//! handed back through [`awg_free_string`].

use std::ffi::{CStr, CString, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};

use wgtunnel_core::StatusCallback;

fn guarded<T>(default: T, f: impl FnOnce() -> T) -> T {
    wgtunnel_core::ensure_initialized();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!("Entry point panicked");
            default
        }
    }
}

/// # Safety
/// `s` must be a valid, nul-terminated UTF-8 C string or null.
unsafe fn utf8_arg<'a>(s: *const c_char) -> Option<&'a str> {
    if s.is_null() {
        return None;
    }
    // SAFETY: caller contract.
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

fn into_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(c) => c.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Brings a tunnel up from its textual configuration.
///
/// Returns a non-negative handle, or -1 on any failure. `status_cb` (may be
/// null) receives `(handle, code)` with codes 0 = healthy, 1 = handshake
/// failure, 2 = resolving DNS.
///
/// # Safety
/// `config` must be a valid, nul-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn awg_turn_on(
    config: *const c_char,
    status_cb: Option<StatusCallback>,
) -> i32 {
    guarded(-1, || {
        // SAFETY: forwarded caller contract.
        let Some(config) = (unsafe { utf8_arg(config) }) else {
            tracing::error!("awg_turn_on: config is null or not UTF-8");
            return -1;
        };

        match wgtunnel_core::supervisor::turn_on(config, status_cb) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to bring tunnel up: {e:#}");
                -1
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn awg_turn_off(handle: i32) {
    guarded((), || wgtunnel_core::supervisor::turn_off(handle));
}

#[unsafe(no_mangle)]
pub extern "C" fn awg_turn_off_all() {
    guarded((), wgtunnel_core::supervisor::turn_off_all);
}

/// The tunnel's current UAPI state, or null for unknown handles. Free the
/// returned string with [`awg_free_string`].
#[unsafe(no_mangle)]
pub extern "C" fn awg_get_config(handle: i32) -> *mut c_char {
    guarded(std::ptr::null_mut(), || {
        match wgtunnel_core::supervisor::get_config(handle) {
            Some(config) => into_c_string(config),
            None => std::ptr::null_mut(),
        }
    })
}

/// # Safety
/// `config` must be a valid, nul-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn awg_proxy_turn_on(
    config: *const c_char,
    status_cb: Option<StatusCallback>,
) -> i32 {
    guarded(-1, || {
        // SAFETY: forwarded caller contract.
        let Some(config) = (unsafe { utf8_arg(config) }) else {
            tracing::error!("awg_proxy_turn_on: config is null or not UTF-8");
            return -1;
        };

        match wgtunnel_core::proxy::turn_on(config, status_cb) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Failed to start proxy: {e:#}");
                -1
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn awg_proxy_turn_off(handle: i32) {
    guarded((), || wgtunnel_core::proxy::turn_off(handle));
}

#[unsafe(no_mangle)]
pub extern "C" fn awg_proxy_turn_off_all() {
    guarded((), wgtunnel_core::proxy::turn_off_all);
}

/// Free with [`awg_free_string`].
#[unsafe(no_mangle)]
pub extern "C" fn awg_proxy_get_config(handle: i32) -> *mut c_char {
    guarded(std::ptr::null_mut(), || {
        match wgtunnel_core::proxy::get_config(handle) {
            Some(config) => into_c_string(config),
            None => std::ptr::null_mut(),
        }
    })
}

/// Releases a string previously returned by this library.
///
/// # Safety
/// `s` must be a pointer returned by `awg_get_config`/`awg_proxy_get_config`
/// /`get_secret`, or null, and must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn awg_free_string(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    // SAFETY: caller contract, the pointer came from CString::into_raw.
    drop(unsafe { CString::from_raw(s) });
}

/// Enables (1) or disables (0) the persistent kill switch. Returns the new
/// state, or -1 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn set_kill_switch(enabled: i32) -> i32 {
    guarded(-1, || {
        match wgtunnel_core::killswitch::set(enabled == 1) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                tracing::error!("Failed to toggle kill switch: {e}");
                -1
            }
        }
    })
}

/// 1 if the kill switch is enabled persistently, 0 otherwise, -1 on error.
#[unsafe(no_mangle)]
pub extern "C" fn get_kill_switch_status() -> i32 {
    guarded(-1, || {
        match wgtunnel_core::killswitch::status() {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                tracing::error!("Failed to read kill switch status: {e}");
                -1
            }
        }
    })
}

/// Toggles the LAN bypass. Requires an enabled kill switch.
#[unsafe(no_mangle)]
pub extern "C" fn set_kill_switch_lan_bypass(enabled: i32) -> i32 {
    guarded(-1, || {
        match wgtunnel_core::killswitch::set_lan_bypass(enabled == 1) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                tracing::error!("Failed to toggle LAN bypass: {e}");
                -1
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn get_kill_switch_lan_bypass_status() -> i32 {
    guarded(-1, || {
        match wgtunnel_core::killswitch::lan_bypass_status() {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                tracing::error!("Failed to read LAN bypass status: {e}");
                -1
            }
        }
    })
}

/// Stores a secret in the OS keystore. Returns 1 on success, -1 otherwise.
///
/// # Safety
/// All arguments must be valid, nul-terminated UTF-8 C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn store_secret(
    service: *const c_char,
    name: *const c_char,
    value: *const c_char,
) -> i32 {
    guarded(-1, || {
        // SAFETY: forwarded caller contract.
        let (Some(service), Some(name), Some(value)) = (unsafe {
            (utf8_arg(service), utf8_arg(name), utf8_arg(value))
        }) else {
            return -1;
        };

        match wgtunnel_core::secrets::store(service, name, value) {
            Ok(()) => 1,
            Err(e) => {
                tracing::error!("Failed to store secret: {e}");
                -1
            }
        }
    })
}

/// Reads a secret; null when missing or on error. Free the result with
/// [`awg_free_string`].
///
/// # Safety
/// `service` and `name` must be valid, nul-terminated UTF-8 C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn get_secret(
    service: *const c_char,
    name: *const c_char,
) -> *mut c_char {
    guarded(std::ptr::null_mut(), || {
        // SAFETY: forwarded caller contract.
        let (Some(service), Some(name)) =
            (unsafe { (utf8_arg(service), utf8_arg(name)) })
        else {
            return std::ptr::null_mut();
        };

        match wgtunnel_core::secrets::get(service, name) {
            Ok(Some(value)) => into_c_string(value),
            Ok(None) => std::ptr::null_mut(),
            Err(e) => {
                tracing::error!("Failed to read secret: {e}");
                std::ptr::null_mut()
            }
        }
    })
}

/// Deletes a secret. Returns 1 when deleted, -1 when missing or on error.
///
/// # Safety
/// `service` and `name` must be valid, nul-terminated UTF-8 C strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn delete_secret(service: *const c_char, name: *const c_char) -> i32 {
    guarded(-1, || {
        // SAFETY: forwarded caller contract.
        let (Some(service), Some(name)) =
            (unsafe { (utf8_arg(service), utf8_arg(name)) })
        else {
            return -1;
        };

        match wgtunnel_core::secrets::delete(service, name) {
            Ok(true) => 1,
            Ok(false) => -1,
            Err(e) => {
                tracing::error!("Failed to delete secret: {e}");
                -1
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_arguments_are_rejected() {
        // SAFETY: null is explicitly allowed by the helpers.
        unsafe {
            assert_eq!(awg_turn_on(std::ptr::null(), None), -1);
            assert_eq!(awg_proxy_turn_on(std::ptr::null(), None), -1);
            assert_eq!(store_secret(std::ptr::null(), std::ptr::null(), std::ptr::null()), -1);
            assert!(get_secret(std::ptr::null(), std::ptr::null()).is_null());
            awg_free_string(std::ptr::null_mut());
        }
    }

    #[test]
    fn unknown_handles_return_null_config() {
        assert!(awg_get_config(987_654).is_null());
        assert!(awg_proxy_get_config(987_654).is_null());
    }

    #[test]
    fn proxy_round_trip_through_ffi() {
        let config = std::ffi::CString::new(
            "[Interface]\nPrivateKey = GBw1GqHgmCTxCnOfIgT6HLGW4CajZ0GVcdq0Vma8j0Y=\n\n\
             [Peer]\nPublicKey = cyDTLWdmNG1nHtQGAw4Es27faeurYRTJ3Nf5BM9RdEE=\n\
             AllowedIPs = 10.9.0.0/24\n",
        )
        .unwrap();

        // SAFETY: `config` is a valid C string for the duration of the call.
        let handle = unsafe { awg_proxy_turn_on(config.as_ptr(), None) };
        assert!(handle >= 0);

        let rendered = awg_proxy_get_config(handle);
        assert!(!rendered.is_null());
        // SAFETY: `rendered` came from awg_proxy_get_config just above.
        unsafe {
            let text = CStr::from_ptr(rendered).to_str().unwrap();
            assert!(text.contains("allowed_ip=10.9.0.0/24"));
            awg_free_string(rendered);
        }

        awg_proxy_turn_off(handle);
        assert!(awg_proxy_get_config(handle).is_null());
    }
}
