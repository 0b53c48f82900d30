//! nftables kill switch.
//!
//! The controller keeps a desired-state snapshot and converges the kernel to
//! it with a single netlink batch per mutation: the owned `filter` and `nat`
//! tables are atomically deleted and recreated with the full rule set. A
//! batch either applies completely or not at all, and rebuilding from the
//! snapshot makes every public operation idempotent.

use std::ffi::CString;
use std::io;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use ipnetwork::IpNetwork;
use nftnl::expr::Verdict;
use nftnl::{Batch, Chain, FinalizedBatch, Hook, MsgType, Policy, ProtoFamily, Rule, Table,
            nft_expr};
use parking_lot::Mutex;

use tunnel_types::marks::{BOOTSTRAP_MARK, BYPASS_MARK, MARK_MASK};

use crate::{Error, Firewall, family_matches};

static TABLE_FILTER: LazyLock<CString> = LazyLock::new(|| CString::new("filter").expect("static"));
static TABLE_NAT: LazyLock<CString> = LazyLock::new(|| CString::new("nat").expect("static"));

static BASE_INPUT: LazyLock<CString> = LazyLock::new(|| CString::new("INPUT").expect("static"));
static BASE_OUTPUT: LazyLock<CString> = LazyLock::new(|| CString::new("OUTPUT").expect("static"));
static BASE_FORWARD: LazyLock<CString> = LazyLock::new(|| CString::new("FORWARD").expect("static"));
static BASE_POSTROUTING: LazyLock<CString> =
    LazyLock::new(|| CString::new("POSTROUTING").expect("static"));

static CHAIN_INPUT: LazyLock<CString> =
    LazyLock::new(|| CString::new("wgtunnel-input").expect("static"));
static CHAIN_OUTPUT: LazyLock<CString> =
    LazyLock::new(|| CString::new("wgtunnel-output").expect("static"));
static CHAIN_FORWARD: LazyLock<CString> =
    LazyLock::new(|| CString::new("wgtunnel-forward").expect("static"));
static CHAIN_POSTROUTING: LazyLock<CString> =
    LazyLock::new(|| CString::new("wgtunnel-postrouting").expect("static"));

/// Established (2) | related (4) conntrack state bits.
const CT_ESTABLISHED_RELATED: u32 = 0x06;

/// Arbitrary sequence number for the netlink callback loop.
const NETLINK_SEQ: u32 = 2;

#[derive(Default)]
struct State {
    enabled: bool,
    tunnel_port: Option<u16>,
    /// Interface indexes (with names for logging) whose output is accepted
    /// and whose presence activates the bootstrap-mark bypass.
    bypass_ifaces: Vec<(String, u32)>,
    local_networks: Option<Vec<IpNetwork>>,
    permitted_routes: Vec<IpNetwork>,
}

pub struct OsFirewall {
    v6_available: bool,
    enabled: AtomicBool,
    persistent: AtomicBool,
    state: Mutex<State>,
}

impl OsFirewall {
    pub fn new() -> Result<Self, Error> {
        // Probe netfilter early so a missing backend surfaces at
        // initialization instead of on the first enable.
        mnl::Socket::new(mnl::Bus::Netfilter)
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        let v6_available = tunnel_types::supports_ipv6();
        tracing::debug!(v6_available, "nftables firewall initialized");

        Ok(Self {
            v6_available,
            enabled: AtomicBool::new(false),
            persistent: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        })
    }

    /// Accept output on the tunnel interface and open the bootstrap-mark
    /// escape hatch used by endpoint resolution.
    pub fn add_tunnel_bypasses(&self, iface: &str) -> Result<(), Error> {
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }

        let index = iface_index(iface)?;

        let mut state = self.state.lock();
        state.bypass_ifaces.retain(|(name, _)| name != iface);
        state.bypass_ifaces.push((iface.to_owned(), index));
        self.apply(&state)?;

        tracing::debug!(%iface, "Added tunnel bypasses");
        Ok(())
    }

    pub fn remove_tunnel_bypasses(&self, iface: &str) -> Result<(), Error> {
        if !self.is_enabled() {
            tracing::debug!("Firewall is not enabled, skipping bypass removal");
            return Ok(());
        }

        let mut state = self.state.lock();
        let before = state.bypass_ifaces.len();
        state.bypass_ifaces.retain(|(name, _)| name != iface);
        if state.bypass_ifaces.len() == before {
            return Ok(());
        }
        self.apply(&state)?;

        tracing::debug!(%iface, "Removed tunnel bypasses");
        Ok(())
    }

    /// Converges the kernel to `state` with one atomic batch.
    fn apply(&self, state: &State) -> Result<(), Error> {
        let mut batch = Batch::new();

        for family in self.families() {
            let filter = Table::new(&*TABLE_FILTER, family);
            let nat = Table::new(&*TABLE_NAT, family);

            // Add-then-delete guarantees the delete succeeds whether or not
            // the table existed; re-adding leaves a fresh empty table. On
            // disable we stop after the delete.
            batch.add(&filter, MsgType::Add);
            batch.add(&filter, MsgType::Del);
            batch.add(&nat, MsgType::Add);
            batch.add(&nat, MsgType::Del);

            if !state.enabled {
                continue;
            }

            batch.add(&filter, MsgType::Add);
            batch.add(&nat, MsgType::Add);

            let v4 = matches!(family, ProtoFamily::Ipv4);

            // Base chains with accept policy; the drop sits at the end of
            // the custom chains they jump to.
            let mut base_input = Chain::new(&*BASE_INPUT, &filter);
            base_input.set_hook(Hook::In, 0);
            base_input.set_policy(Policy::Accept);
            batch.add(&base_input, MsgType::Add);

            let mut base_output = Chain::new(&*BASE_OUTPUT, &filter);
            base_output.set_hook(Hook::Out, 0);
            base_output.set_policy(Policy::Accept);
            batch.add(&base_output, MsgType::Add);

            let mut base_forward = Chain::new(&*BASE_FORWARD, &filter);
            base_forward.set_hook(Hook::Forward, 0);
            base_forward.set_policy(Policy::Accept);
            batch.add(&base_forward, MsgType::Add);

            let mut base_postrouting = Chain::new(&*BASE_POSTROUTING, &nat);
            base_postrouting.set_hook(Hook::PostRouting, 100);
            base_postrouting.set_type(nftnl::ChainType::Nat);
            base_postrouting.set_policy(Policy::Accept);
            batch.add(&base_postrouting, MsgType::Add);

            let input = Chain::new(&*CHAIN_INPUT, &filter);
            batch.add(&input, MsgType::Add);
            let output = Chain::new(&*CHAIN_OUTPUT, &filter);
            batch.add(&output, MsgType::Add);
            let forward = Chain::new(&*CHAIN_FORWARD, &filter);
            batch.add(&forward, MsgType::Add);
            let postrouting = Chain::new(&*CHAIN_POSTROUTING, &nat);
            batch.add(&postrouting, MsgType::Add);

            add_jump(&mut batch, &base_input, &CHAIN_INPUT);
            add_jump(&mut batch, &base_output, &CHAIN_OUTPUT);
            add_jump(&mut batch, &base_forward, &CHAIN_FORWARD);
            add_jump(&mut batch, &base_postrouting, &CHAIN_POSTROUTING);

            self.add_input_rules(&mut batch, &input, state)?;
            self.add_output_rules(&mut batch, &output, state, v4)?;

            let mut drop_forward = Rule::new(&forward);
            drop_forward.add_expr(&nft_expr!(counter));
            drop_forward.add_expr(&nft_expr!(verdict drop));
            batch.add(&drop_forward, MsgType::Add);
        }

        let finalized = batch.finalize();
        send_and_process(&finalized)?;
        Ok(())
    }

    fn add_input_rules(
        &self,
        batch: &mut Batch,
        chain: &Chain<'_>,
        state: &State,
    ) -> Result<(), Error> {
        let lo = iface_index("lo")?;

        let mut loopback = Rule::new(chain);
        loopback.add_expr(&nft_expr!(meta iif));
        loopback.add_expr(&nft_expr!(cmp == lo));
        loopback.add_expr(&nft_expr!(counter));
        loopback.add_expr(&nft_expr!(verdict accept));
        batch.add(&loopback, MsgType::Add);

        let mut established = Rule::new(chain);
        established.add_expr(&nft_expr!(ct state));
        established.add_expr(&nft_expr!(bitwise mask CT_ESTABLISHED_RELATED, xor 0u32));
        established.add_expr(&nft_expr!(cmp != 0u32));
        established.add_expr(&nft_expr!(counter));
        established.add_expr(&nft_expr!(verdict accept));
        batch.add(&established, MsgType::Add);

        if let Some(port) = state.tunnel_port {
            let mut punch = Rule::new(chain);
            punch.add_expr(&nft_expr!(meta l4proto));
            punch.add_expr(&nft_expr!(cmp == libc::IPPROTO_UDP as u8));
            punch.add_expr(&nft_expr!(payload udp dport));
            punch.add_expr(&nft_expr!(cmp == port.to_be()));
            punch.add_expr(&nft_expr!(counter));
            punch.add_expr(&nft_expr!(verdict accept));
            batch.add(&punch, MsgType::Add);
        }

        let mut drop_rest = Rule::new(chain);
        drop_rest.add_expr(&nft_expr!(counter));
        drop_rest.add_expr(&nft_expr!(verdict drop));
        batch.add(&drop_rest, MsgType::Add);

        Ok(())
    }

    fn add_output_rules(
        &self,
        batch: &mut Batch,
        chain: &Chain<'_>,
        state: &State,
        v4: bool,
    ) -> Result<(), Error> {
        let lo = iface_index("lo")?;

        let mut loopback = Rule::new(chain);
        loopback.add_expr(&nft_expr!(meta oif));
        loopback.add_expr(&nft_expr!(cmp == lo));
        loopback.add_expr(&nft_expr!(counter));
        loopback.add_expr(&nft_expr!(verdict accept));
        batch.add(&loopback, MsgType::Add);

        add_mark_rule(batch, chain, BYPASS_MARK);

        // The bootstrap mark only escapes while a tunnel has bypasses
        // installed; a bare persistent kill switch keeps it closed.
        if !state.bypass_ifaces.is_empty() {
            add_mark_rule(batch, chain, BOOTSTRAP_MARK);
        }

        for (name, index) in &state.bypass_ifaces {
            tracing::trace!(iface = %name, "Accepting output on tunnel interface");
            let mut rule = Rule::new(chain);
            rule.add_expr(&nft_expr!(meta oif));
            rule.add_expr(&nft_expr!(cmp == *index));
            rule.add_expr(&nft_expr!(counter));
            rule.add_expr(&nft_expr!(verdict accept));
            batch.add(&rule, MsgType::Add);
        }

        if let Some(prefixes) = &state.local_networks {
            for prefix in prefixes.iter().filter(|p| family_matches(p, v4)) {
                add_dest_accept_rule(batch, chain, *prefix);
            }
        }

        for route in state.permitted_routes.iter().filter(|p| family_matches(p, v4)) {
            add_dest_accept_rule(batch, chain, *route);
        }

        let mut drop_rest = Rule::new(chain);
        drop_rest.add_expr(&nft_expr!(counter));
        drop_rest.add_expr(&nft_expr!(verdict drop));
        batch.add(&drop_rest, MsgType::Add);

        Ok(())
    }

    fn families(&self) -> Vec<ProtoFamily> {
        if self.v6_available {
            vec![ProtoFamily::Ipv4, ProtoFamily::Ipv6]
        } else {
            vec![ProtoFamily::Ipv4]
        }
    }
}

impl Firewall for OsFirewall {
    fn enable(&self) -> Result<(), Error> {
        if self.is_enabled() {
            tracing::debug!("Kill switch already active, skipping activation");
            return Ok(());
        }

        let mut state = self.state.lock();
        state.enabled = true;
        if let Err(e) = self.apply(&state) {
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
        let cleared = State::default();
        // The batch is atomic: on failure the old rules are still in place,
        // so the snapshot must stay untouched for a later retry.
        self.apply(&cleared)?;
        *state = cleared;
        self.enabled.store(false, Ordering::SeqCst);

        tracing::info!("Firewall cleaned up and kill switch disabled");
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
        let previous = state.local_networks.take();
        state.local_networks = Some(
            prefixes
                .iter()
                .filter(|p| p.is_ipv4() || self.v6_available)
                .copied()
                .collect(),
        );
        if let Err(e) = self.apply(&state) {
            // The batch failed atomically; restore the snapshot so the
            // in-memory state keeps matching the kernel.
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
            self.apply(&state)?;
        }
        tracing::debug!("Removed local network bypass");
        Ok(())
    }

    fn is_allow_local_networks_enabled(&self) -> bool {
        self.state.lock().local_networks.is_some()
    }

    fn update_permitted_routes(&self, routes: &[IpNetwork]) -> Result<(), Error> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.permitted_routes, routes.to_vec());
        if state.enabled {
            if let Err(e) = self.apply(&state) {
                state.permitted_routes = previous;
                return Err(e);
            }
        }
        tracing::debug!(?routes, "Updated permitted routes");
        Ok(())
    }

    fn set_tunnel_port(&self, port: u16) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.tunnel_port = Some(port);
        if state.enabled {
            self.apply(&state)?;
        }
        tracing::debug!(port, "Set tunnel port punch");
        Ok(())
    }
}

fn add_jump(batch: &mut Batch, from: &Chain<'_>, to: &CString) {
    let mut rule = Rule::new(from);
    rule.add_expr(&nft_expr!(counter));
    rule.add_expr(&Verdict::Jump {
        chain: CString::clone(to),
    });
    batch.add(&rule, MsgType::Add);
}

/// Accept packets whose mark, masked to our bits, equals `mark`.
fn add_mark_rule(batch: &mut Batch, chain: &Chain<'_>, mark: u32) {
    let mut rule = Rule::new(chain);
    rule.add_expr(&nft_expr!(meta mark));
    rule.add_expr(&nft_expr!(bitwise mask MARK_MASK, xor 0u32));
    rule.add_expr(&nft_expr!(cmp == mark));
    rule.add_expr(&nft_expr!(counter));
    rule.add_expr(&nft_expr!(verdict accept));
    batch.add(&rule, MsgType::Add);
}

/// Accept packets destined to `net`.
fn add_dest_accept_rule(batch: &mut Batch, chain: &Chain<'_>, net: IpNetwork) {
    let mut rule = Rule::new(chain);
    match net {
        IpNetwork::V4(v4) => {
            rule.add_expr(&nft_expr!(payload ipv4 daddr));
            rule.add_expr(&nft_expr!(bitwise mask v4.mask(), xor 0u32));
            rule.add_expr(&nft_expr!(cmp == v4.network()));
        }
        IpNetwork::V6(v6) => {
            rule.add_expr(&nft_expr!(payload ipv6 daddr));
            rule.add_expr(&nft_expr!(bitwise mask v6.mask(), xor &[0u16; 8][..]));
            rule.add_expr(&nft_expr!(cmp == v6.network()));
        }
    }
    rule.add_expr(&nft_expr!(counter));
    rule.add_expr(&nft_expr!(verdict accept));
    batch.add(&rule, MsgType::Add);
}

fn iface_index(name: &str) -> Result<u32, Error> {
    nix::net::if_::if_nametoindex(name)
        .map_err(|_| Error::UnknownInterface(name.to_owned()))
}

fn send_and_process(batch: &FinalizedBatch) -> Result<(), io::Error> {
    let socket = mnl::Socket::new(mnl::Bus::Netfilter)?;
    socket.send_all(batch)?;

    let portid = socket.portid();
    let mut buffer = vec![0; nftnl::nft_nlmsg_maxsize() as usize];

    while let Some(message) = socket_recv(&socket, &mut buffer[..])? {
        match mnl::cb_run(message, NETLINK_SEQ, portid)? {
            mnl::CbResult::Stop => break,
            mnl::CbResult::Ok => (),
        }
    }
    Ok(())
}

fn socket_recv<'a>(socket: &mnl::Socket, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>, io::Error> {
    let ret = socket.recv(buf)?;
    if ret > 0 {
        Ok(Some(&buf[..ret]))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The kernel-facing paths need CAP_NET_ADMIN; these tests cover the
    // state machine around them.

    fn unprivileged_firewall() -> Option<OsFirewall> {
        OsFirewall::new().ok()
    }

    #[test]
    fn disable_without_enable_is_noop() {
        let Some(fw) = unprivileged_firewall() else {
            return;
        };
        assert!(!fw.is_enabled());
        fw.disable().expect("disable on disabled firewall is a no-op");
        assert!(!fw.is_enabled());
    }

    #[test]
    fn lan_bypass_requires_enabled_switch() {
        let Some(fw) = unprivileged_firewall() else {
            return;
        };
        let err = fw
            .allow_local_networks(&crate::local_network_prefixes())
            .unwrap_err();
        assert!(matches!(err, Error::NotEnabled));
        assert!(!fw.is_allow_local_networks_enabled());
    }

    #[test]
    fn persistence_flag_is_independent() {
        let Some(fw) = unprivileged_firewall() else {
            return;
        };
        assert!(!fw.is_persistent());
        fw.set_persist(true);
        assert!(fw.is_persistent());
        assert!(!fw.is_enabled());
        fw.set_persist(false);
        assert!(!fw.is_persistent());
    }
}
