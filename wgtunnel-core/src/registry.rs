//! Handle and callback registry.
//!
//! Handles are positive 32-bit integers shared between the tunnel and proxy
//! surfaces; an id is unique across both for its lifetime and becomes
//! available again after release. Status callbacks fan out on a spawned
//! task so the host can never re-enter the device from the notifying
//! thread.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use parking_lot::Mutex;
use tunnel_types::StatusCode;

/// Host-provided status callback: `(handle, status_code)`.
pub type StatusCallback = extern "C" fn(i32, i32);

#[derive(Default)]
struct Registry {
    used_ids: HashSet<i32>,
    callbacks: HashMap<i32, StatusCallback>,
    resolving: HashSet<i32>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(Mutex::default);

#[derive(Debug, thiserror::Error)]
#[error("handle space exhausted")]
pub struct HandleSpaceExhausted;

/// Claims the lowest free handle and registers the callback, if any.
pub(crate) fn allocate(callback: Option<StatusCallback>) -> Result<i32, HandleSpaceExhausted> {
    let mut registry = REGISTRY.lock();

    let handle = first_free(&registry.used_ids).ok_or(HandleSpaceExhausted)?;
    registry.used_ids.insert(handle);
    if let Some(callback) = callback {
        registry.callbacks.insert(handle, callback);
    }

    Ok(handle)
}

fn first_free(used: &HashSet<i32>) -> Option<i32> {
    (0..i32::MAX).find(|id| !used.contains(id))
}

/// Releases a handle and every piece of state attached to it.
pub(crate) fn release(handle: i32) {
    let mut registry = REGISTRY.lock();
    registry.used_ids.remove(&handle);
    registry.callbacks.remove(&handle);
    registry.resolving.remove(&handle);
}

/// Invokes the handle's callback asynchronously, on a plain thread: the
/// host must be able to call back into the API from its callback without
/// re-entering the runtime or the device.
pub(crate) fn notify(handle: i32, status: StatusCode) {
    let Some(callback) = REGISTRY.lock().callbacks.get(&handle).copied() else {
        return;
    };

    let spawned = std::thread::Builder::new()
        .name("wgtunnel-status".to_owned())
        .spawn(move || callback(handle, status.as_i32()));
    if let Err(e) = spawned {
        tracing::warn!(handle, "Failed to spawn status callback thread: {e}");
    }
}

pub(crate) fn set_resolving(handle: i32, resolving: bool) {
    let mut registry = REGISTRY.lock();
    if resolving {
        registry.resolving.insert(handle);
    } else {
        registry.resolving.remove(&handle);
    }
}

pub(crate) fn is_resolving(handle: i32) -> bool {
    REGISTRY.lock().resolving.contains(&handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-global; serialize the tests that touch it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn first_free_probes_linearly() {
        let mut used = HashSet::new();
        assert_eq!(first_free(&used), Some(0));

        used.insert(0);
        used.insert(1);
        used.insert(3);
        assert_eq!(first_free(&used), Some(2));
    }

    #[test]
    fn released_handles_are_reused() {
        extern "C" fn noop(_: i32, _: i32) {}

        let _guard = TEST_LOCK.lock();
        let a = allocate(Some(noop)).unwrap();
        let b = allocate(None).unwrap();
        assert_ne!(a, b);

        release(a);
        let c = allocate(None).unwrap();
        assert_eq!(a, c);

        release(b);
        release(c);
    }

    #[test]
    fn resolving_flag_round_trip() {
        let _guard = TEST_LOCK.lock();
        let handle = allocate(None).unwrap();
        assert!(!is_resolving(handle));

        set_resolving(handle, true);
        assert!(is_resolving(handle));

        set_resolving(handle, false);
        assert!(!is_resolving(handle));

        release(handle);
    }
}
