//! PF kill switch.
//!
//! The ruleset lives in a named anchor (`wgtunnel`) referenced once from
//! `/etc/pf.conf` and loaded from `/etc/pf.anchors/wgtunnel`. Every mutation
//! rewrites the anchor file from the desired-state snapshot and reloads it
//! with `pfctl`, so each public operation is idempotent.

use std::fmt::Write as _;
use std::io::Write as _;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use ipnetwork::IpNetwork;
use parking_lot::Mutex;

use crate::{Error, Firewall};

const ANCHOR_NAME: &str = "wgtunnel";
const ANCHOR_FILE: &str = "/etc/pf.anchors/wgtunnel";
const PF_CONF: &str = "/etc/pf.conf";

#[derive(Default)]
struct State {
    enabled: bool,
    tunnel_port: Option<u16>,
    bypass_ifaces: Vec<String>,
    local_networks: Option<Vec<IpNetwork>>,
    permitted_routes: Vec<IpNetwork>,
}

impl State {
    /// Renders the anchor ruleset. PF is first-match with `quick`, so the
    /// pass rules precede nothing and the trailing `block out all` catches
    /// whatever they did not claim.
    fn render(&self) -> String {
        if !self.enabled {
            return String::new();
        }

        let mut rules = String::new();

        for iface in &self.bypass_ifaces {
            let _ = writeln!(rules, "pass out quick on {iface} all keep state");
        }
        let _ = writeln!(rules, "pass quick on lo0 all");

        if let Some(prefixes) = &self.local_networks {
            for prefix in prefixes {
                let _ = writeln!(rules, "pass out quick to {prefix} keep state");
            }
        }
        for route in &self.permitted_routes {
            let _ = writeln!(rules, "pass out quick to {route} keep state");
        }

        if let Some(port) = self.tunnel_port {
            let _ = writeln!(
                rules,
                "pass in quick proto udp from any to any port = {port} keep state"
            );
        }

        rules.push_str("block out all\n");
        rules
    }
}

pub struct OsFirewall {
    enabled: AtomicBool,
    persistent: AtomicBool,
    state: Mutex<State>,
}

impl OsFirewall {
    pub fn new() -> Result<Self, Error> {
        // `pfctl -s info` works without changing anything and tells us
        // whether PF is usable at all.
        run_pfctl(&["-s", "info"])
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        Ok(Self {
            enabled: AtomicBool::new(false),
            persistent: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        })
    }

    /// Pass outbound traffic on the tunnel interface (`utunN`).
    pub fn add_tunnel_bypasses(&self, iface: &str) -> Result<(), Error> {
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }
        let mut state = self.state.lock();
        if !state.bypass_ifaces.iter().any(|name| name == iface) {
            state.bypass_ifaces.push(iface.to_owned());
        }
        apply(&state)?;
        tracing::debug!(%iface, "Added tunnel bypass");
        Ok(())
    }

    pub fn remove_tunnel_bypasses(&self, iface: &str) -> Result<(), Error> {
        if !self.is_enabled() {
            tracing::debug!("Firewall is not enabled, skipping bypass removal");
            return Ok(());
        }
        let mut state = self.state.lock();
        state.bypass_ifaces.retain(|name| name != iface);
        apply(&state)?;
        tracing::debug!(%iface, "Removed tunnel bypass");
        Ok(())
    }
}

impl Firewall for OsFirewall {
    fn enable(&self) -> Result<(), Error> {
        if self.is_enabled() {
            tracing::debug!("Kill switch already active, skipping activation");
            return Ok(());
        }

        ensure_pf_running()?;
        ensure_anchor_reference()?;

        let mut state = self.state.lock();
        state.enabled = true;
        if let Err(e) = apply(&state) {
            state.enabled = false;
            return Err(e);
        }
        self.enabled.store(true, Ordering::SeqCst);

        tracing::info!("Kill switch enabled");
        Ok(())
    }

    fn disable(&self) -> Result<(), Error> {
        if !self.is_enabled() {
            tracing::debug!("Firewall is not enabled, skipping");
            return Ok(());
        }

        let mut state = self.state.lock();
        *state = State::default();

        // Empty the anchor file and flush the loaded anchor; failures are
        // logged and the teardown keeps going.
        if let Err(e) = std::fs::write(ANCHOR_FILE, b"") {
            tracing::warn!("Failed to truncate anchor file: {e}");
        }
        if let Err(e) = run_pfctl(&["-a", ANCHOR_NAME, "-F", "all"]) {
            tracing::warn!("Failed to flush PF anchor: {e}");
        }

        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("Kill switch disabled and anchor cleared");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_persist(&self, enabled: bool) {
        self.persistent.store(enabled, Ordering::SeqCst);
    }

    fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    fn allow_local_networks(&self, prefixes: &[IpNetwork]) -> Result<(), Error> {
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }
        let mut state = self.state.lock();
        let previous = state.local_networks.replace(prefixes.to_vec());
        if let Err(e) = apply(&state) {
            state.local_networks = previous;
            return Err(e);
        }
        tracing::debug!(?prefixes, "Bypassed local networks");
        Ok(())
    }

    fn remove_local_networks(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.local_networks.take().is_none() {
            return Ok(());
        }
        if state.enabled {
            apply(&state)?;
        }
        Ok(())
    }

    fn is_allow_local_networks_enabled(&self) -> bool {
        self.state.lock().local_networks.is_some()
    }

    fn update_permitted_routes(&self, routes: &[IpNetwork]) -> Result<(), Error> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.permitted_routes, routes.to_vec());
        if state.enabled {
            if let Err(e) = apply(&state) {
                state.permitted_routes = previous;
                return Err(e);
            }
        }
        Ok(())
    }

    fn set_tunnel_port(&self, port: u16) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.tunnel_port = Some(port);
        if state.enabled {
            apply(&state)?;
        }
        Ok(())
    }
}

/// Writes the rendered ruleset to the anchor file and reloads the anchor.
fn apply(state: &State) -> Result<(), Error> {
    std::fs::write(ANCHOR_FILE, state.render())?;
    run_pfctl(&["-a", ANCHOR_NAME, "-f", ANCHOR_FILE])?;
    Ok(())
}

/// PF is off by default on macOS; "already enabled" is not an error.
fn ensure_pf_running() -> Result<(), Error> {
    match run_pfctl(&["-e"]) {
        Ok(()) => Ok(()),
        Err(Error::Pfctl(output)) if output.contains("already enabled") => Ok(()),
        Err(e) => Err(e),
    }
}

/// Adds the anchor reference to `/etc/pf.conf` once.
fn ensure_anchor_reference() -> Result<(), Error> {
    let conf = std::fs::read_to_string(PF_CONF)?;
    if conf.contains(&format!("anchor \"{ANCHOR_NAME}\"")) {
        return Ok(());
    }

    let mut file = std::fs::OpenOptions::new().append(true).open(PF_CONF)?;
    writeln!(file, "anchor \"{ANCHOR_NAME}\"")?;
    writeln!(
        file,
        "load anchor \"{ANCHOR_NAME}\" from \"{ANCHOR_FILE}\""
    )?;
    drop(file);

    run_pfctl(&["-f", PF_CONF])?;
    tracing::debug!("Registered PF anchor in pf.conf");
    Ok(())
}

fn run_pfctl(args: &[&str]) -> Result<(), Error> {
    let output = Command::new("pfctl").args(args).output()?;
    if output.status.success() {
        return Ok(());
    }
    // pfctl writes diagnostics to stderr even on success paths like
    // "pf already enabled", so hand the text to the caller.
    Err(Error::Pfctl(
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_covers_bypass_sets() {
        let state = State {
            enabled: true,
            tunnel_port: Some(51820),
            bypass_ifaces: vec!["utun7".to_owned()],
            local_networks: Some(vec!["192.168.0.0/16".parse().unwrap()]),
            permitted_routes: vec!["198.51.100.0/24".parse().unwrap()],
        };

        let rules = state.render();
        let lines: Vec<&str> = rules.lines().collect();

        assert_eq!(lines.first(), Some(&"pass out quick on utun7 all keep state"));
        assert!(lines.contains(&"pass quick on lo0 all"));
        assert!(lines.contains(&"pass out quick to 192.168.0.0/16 keep state"));
        assert!(lines.contains(&"pass out quick to 198.51.100.0/24 keep state"));
        assert!(
            lines.contains(&"pass in quick proto udp from any to any port = 51820 keep state")
        );
        assert_eq!(lines.last(), Some(&"block out all"));
    }

    #[test]
    fn disabled_state_renders_empty() {
        assert!(State::default().render().is_empty());
    }
}
