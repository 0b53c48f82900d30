//! OS keystore wrapper for tunnel credentials.

use keyring::Entry;

/// Stores (or overwrites) a secret under `(service, name)`.
pub fn store(service: &str, name: &str, value: &str) -> Result<(), keyring::Error> {
    Entry::new(service, name)?.set_password(value)
}

/// Reads a secret; `Ok(None)` when it does not exist.
pub fn get(service: &str, name: &str) -> Result<Option<String>, keyring::Error> {
    match Entry::new(service, name)?.get_password() {
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deletes a secret; `Ok(false)` when there was nothing to delete.
pub fn delete(service: &str, name: &str) -> Result<bool, keyring::Error> {
    match Entry::new(service, name)?.delete_credential() {
        Ok(()) => Ok(true),
        Err(keyring::Error::NoEntry) => Ok(false),
        Err(e) => Err(e),
    }
}
