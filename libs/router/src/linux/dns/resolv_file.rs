//! resolv.conf fallback backend.
//!
//! The original file is backed up to `/etc/resolv.conf.bak.wgt` (only if no
//! backup exists, so a crashed run's backup wins), the live file is
//! rewritten with our nameservers, and under full tunnel the immutable bit
//! keeps DHCP clients from clobbering it. Revert restores the backup
//! byte-for-byte and removes it.

use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::process::Command;

use crate::Error;

const RESOLV_CONF: &str = "/etc/resolv.conf";
const RESOLV_CONF_BACKUP: &str = "/etc/resolv.conf.bak.wgt";

/// Path pair, a parameter so tests never touch `/etc`.
#[derive(Clone)]
pub(crate) struct Paths {
    pub resolv: PathBuf,
    pub backup: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            resolv: PathBuf::from(RESOLV_CONF),
            backup: PathBuf::from(RESOLV_CONF_BACKUP),
        }
    }
}

/// Sync because the revert half runs on teardown paths.
pub(crate) fn configure(
    paths: &Paths,
    dns: &[IpAddr],
    search_domains: &[String],
    full_tunnel: bool,
) -> Result<(), Error> {
    backup(paths)?;

    // A previous full-tunnel run may have left the file immutable.
    lock(paths, false);

    let mut contents = String::new();
    for ip in dns {
        contents.push_str(&format!("nameserver {ip}\n"));
    }
    if !search_domains.is_empty() {
        contents.push_str(&format!("search {}\n", search_domains.join(" ")));
    }

    std::fs::write(&paths.resolv, contents)?;
    std::fs::set_permissions(&paths.resolv, std::fs::Permissions::from_mode(0o644))?;

    if full_tunnel {
        lock(paths, true);
    }

    tracing::debug!(?dns, "Rewrote resolv.conf");
    Ok(())
}

pub(crate) fn revert(paths: &Paths) -> Result<(), Error> {
    lock(paths, false);

    let original = match std::fs::read(&paths.backup) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No resolv.conf backup, nothing to revert");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    std::fs::write(&paths.resolv, original)?;
    std::fs::set_permissions(&paths.resolv, std::fs::Permissions::from_mode(0o644))?;
    std::fs::remove_file(&paths.backup)?;

    tracing::debug!("Restored resolv.conf from backup");
    Ok(())
}

/// Backs up the live file unless a backup already exists (it would hold the
/// pre-tunnel contents from a run that never got to revert).
fn backup(paths: &Paths) -> Result<(), Error> {
    if paths.backup.exists() {
        return Ok(());
    }
    let contents = std::fs::read(&paths.resolv)?;
    std::fs::write(&paths.backup, contents)?;
    std::fs::set_permissions(&paths.backup, std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Toggles the immutable bit. Best effort: not every filesystem supports
/// chattr, and a failed lock must not fail the tunnel.
fn lock(paths: &Paths, lock: bool) {
    let flag = if lock { "+i" } else { "-i" };
    match Command::new("chattr").arg(flag).arg(&paths.resolv).output() {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            tracing::debug!(
                flag,
                "chattr failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => tracing::debug!(flag, "chattr not available: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::TempDir::with_prefix("wgtunnel-dns-test-")
            .expect("temp dir should be creatable");
        let paths = Paths {
            resolv: dir.path().join("resolv.conf"),
            backup: dir.path().join("resolv.conf.bak.wgt"),
        };
        (dir, paths)
    }

    fn dns(s: &str) -> Vec<IpAddr> {
        s.split(',').map(|ip| ip.parse().unwrap()).collect()
    }

    #[test]
    fn configure_then_revert_restores_bytes() {
        let (_dir, paths) = temp_paths();
        let original = "nameserver 192.168.1.1\nsearch lan\n";
        std::fs::write(&paths.resolv, original).unwrap();

        configure(&paths, &dns("1.1.1.1"), &[], true).unwrap();
        let rewritten = std::fs::read_to_string(&paths.resolv).unwrap();
        assert_eq!(rewritten, "nameserver 1.1.1.1\n");
        assert_eq!(std::fs::read_to_string(&paths.backup).unwrap(), original);

        revert(&paths).unwrap();
        assert_eq!(std::fs::read_to_string(&paths.resolv).unwrap(), original);
        assert!(!paths.backup.exists(), "backup is removed on revert");
    }

    #[test]
    fn search_domains_are_written() {
        let (_dir, paths) = temp_paths();
        std::fs::write(&paths.resolv, "nameserver 8.8.8.8\n").unwrap();

        configure(
            &paths,
            &dns("10.64.0.1,fd00::1"),
            &["corp.example".to_owned(), "lan".to_owned()],
            false,
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(&paths.resolv).unwrap(),
            "nameserver 10.64.0.1\nnameserver fd00::1\nsearch corp.example lan\n"
        );
    }

    #[test]
    fn second_configure_keeps_first_backup() {
        let (_dir, paths) = temp_paths();
        let original = "nameserver 9.9.9.9\n";
        std::fs::write(&paths.resolv, original).unwrap();

        configure(&paths, &dns("1.1.1.1"), &[], false).unwrap();
        configure(&paths, &dns("1.0.0.1"), &[], false).unwrap();

        // The backup still holds the pre-tunnel file, not our first rewrite.
        assert_eq!(std::fs::read_to_string(&paths.backup).unwrap(), original);

        revert(&paths).unwrap();
        assert_eq!(std::fs::read_to_string(&paths.resolv).unwrap(), original);
    }

    #[test]
    fn revert_without_backup_is_noop() {
        let (_dir, paths) = temp_paths();
        std::fs::write(&paths.resolv, "nameserver 9.9.9.9\n").unwrap();

        revert(&paths).unwrap();
        assert_eq!(
            std::fs::read_to_string(&paths.resolv).unwrap(),
            "nameserver 9.9.9.9\n"
        );
    }

    #[test]
    fn revert_is_idempotent() {
        let (_dir, paths) = temp_paths();
        let original = "nameserver 9.9.9.9\n";
        std::fs::write(&paths.resolv, original).unwrap();

        configure(&paths, &dns("1.1.1.1"), &[], false).unwrap();
        revert(&paths).unwrap();
        revert(&paths).unwrap();
        assert_eq!(std::fs::read_to_string(&paths.resolv).unwrap(), original);
    }
}
