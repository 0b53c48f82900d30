//! WFP kill switch.
//!
//! Every `enable` opens a fresh dynamic session with a new provider GUID and
//! a new sublayer GUID; `disable` closes the session, which makes all rules
//! evaporate. Rules are added in three weight tiers: daemon traffic (15),
//! known infrastructure traffic such as DHCP and NDP (12), and the final
//! block-all (0).

mod wfp;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};

use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::{
    FWP_CONDITION_FLAG_IS_LOOPBACK, FWP_MATCH_EQUAL, FWP_MATCH_FLAGS_ALL_SET,
    FWPM_CONDITION_ALE_APP_ID, FWPM_CONDITION_FLAGS, FWPM_CONDITION_IP_LOCAL_ADDRESS,
    FWPM_CONDITION_IP_LOCAL_INTERFACE, FWPM_CONDITION_IP_LOCAL_PORT, FWPM_CONDITION_IP_PROTOCOL,
    FWPM_CONDITION_IP_REMOTE_ADDRESS, FWPM_CONDITION_IP_REMOTE_PORT,
    FWPM_LAYER_ALE_AUTH_CONNECT_V4, FWPM_LAYER_ALE_AUTH_CONNECT_V6,
    FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4, FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V6,
};
use windows::core::GUID;

use crate::{Error, Firewall};
use wfp::{AppId, Condition, ConditionValue, FilterSpec, Session};

const WEIGHT_DAEMON_TRAFFIC: u64 = 15;
const WEIGHT_KNOWN_TRAFFIC: u64 = 12;
const WEIGHT_CATCH_ALL: u64 = 0;

const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

// NDP filtering aliases ICMP type/code onto the port condition fields.
const FIELD_ICMP_TYPE: GUID = FWPM_CONDITION_IP_LOCAL_PORT;
const FIELD_ICMP_CODE: GUID = FWPM_CONDITION_IP_REMOTE_PORT;

const LINK_LOCAL_RANGE: (Ipv6Addr, u8) = (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10);
const LINK_LOCAL_DHCP_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x1, 0x2);
const SITE_LOCAL_DHCP_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0x1, 0x3);
const LINK_LOCAL_ROUTER_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x2);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Protocol {
    V4,
    V6,
    All,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
    Both,
}

impl Protocol {
    fn layers(self, direction: Direction) -> Vec<GUID> {
        let mut layers = Vec::new();
        if matches!(self, Protocol::All | Protocol::V4) {
            if matches!(direction, Direction::Both | Direction::Inbound) {
                layers.push(FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4);
            }
            if matches!(direction, Direction::Both | Direction::Outbound) {
                layers.push(FWPM_LAYER_ALE_AUTH_CONNECT_V4);
            }
        }
        if matches!(self, Protocol::All | Protocol::V6) {
            if matches!(direction, Direction::Both | Direction::Inbound) {
                layers.push(FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V6);
            }
            if matches!(direction, Direction::Both | Direction::Outbound) {
                layers.push(FWPM_LAYER_ALE_AUTH_CONNECT_V6);
            }
        }
        layers
    }
}

fn equal(field: GUID, value: ConditionValue) -> Condition {
    Condition {
        field,
        match_type: FWP_MATCH_EQUAL,
        value,
    }
}

fn remote_prefix(net: &IpNetwork) -> Condition {
    match net {
        IpNetwork::V4(v4) => equal(
            FWPM_CONDITION_IP_REMOTE_ADDRESS,
            ConditionValue::V4AddrMask {
                addr: u32::from(v4.network()),
                mask: u32::from(v4.mask()),
            },
        ),
        IpNetwork::V6(v6) => equal(
            FWPM_CONDITION_IP_REMOTE_ADDRESS,
            ConditionValue::V6AddrMask {
                addr: v6.network().octets(),
                prefix_length: v6.prefix(),
            },
        ),
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    provider: GUID,
    sublayer: GUID,
    luid: u64,
    tun_rules: Vec<u64>,
    local_addr_rules: Option<Vec<u64>>,
    permitted_routes: HashMap<IpNetwork, Vec<u64>>,
}

pub struct OsFirewall {
    v6_available: bool,
    enabled: AtomicBool,
    persistent: AtomicBool,
    inner: Mutex<Inner>,
}

impl OsFirewall {
    pub fn new() -> Result<Self, Error> {
        // Probe the engine so an unusable WFP surfaces at initialization.
        Session::open("WGTunnel firewall probe", "Startup probe")
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        Ok(Self {
            v6_available: tunnel_types::supports_ipv6(),
            enabled: AtomicBool::new(false),
            persistent: AtomicBool::new(false),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Pins the tunnel interface LUID and UDP listen port through the
    /// switch. Requires an enabled switch.
    pub fn bypass_tunnel(&self, luid: u64, listen_port: u16) -> Result<(), Error> {
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }

        let mut inner = self.inner.lock();
        inner.luid = luid;

        let old_rules = std::mem::take(&mut inner.tun_rules);
        remove_rules(&inner, &old_rules);

        let tun_rules = self.permit_tun_interface(&inner, WEIGHT_DAEMON_TRAFFIC)?;
        inner.tun_rules = tun_rules;

        tracing::debug!(listen_port, "Bypassing tunnel listen port");
        let port_rules = self.permit_listen_port(&inner, WEIGHT_DAEMON_TRAFFIC, listen_port)?;
        inner.tun_rules.extend(port_rules);

        tracing::debug!("Tunnel successfully bypassed");
        Ok(())
    }

    /// Removes the tunnel pin and the permitted-route set, leaving the base
    /// policy in place (used when a persistent switch outlives a tunnel).
    pub fn remove_tunnel_rules(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        let tun_rules = std::mem::take(&mut inner.tun_rules);
        remove_rules(&inner, &tun_rules);

        let permitted = std::mem::take(&mut inner.permitted_routes);
        for (prefix, rules) in permitted {
            tracing::trace!(%prefix, "Removing permitted route");
            remove_rules(&inner, &rules);
        }

        tracing::debug!("Tunnel rules and permitted routes removed");
        Ok(())
    }

    fn add_rules(
        &self,
        inner: &Inner,
        name: &str,
        weight: u64,
        conditions: impl Fn() -> Vec<Condition>,
        permit: bool,
        protocol: Protocol,
        direction: Direction,
    ) -> Result<Vec<u64>, Error> {
        let session = inner.session.as_ref().ok_or(Error::NotEnabled)?;

        let mut ids = Vec::new();
        for layer in protocol.layers(direction) {
            let spec = FilterSpec {
                name: format!("WGTunnel-{name}"),
                layer,
                permit,
                weight,
                conditions: conditions(),
            };
            match session.add_filter(&inner.provider, inner.sublayer, &spec) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    remove_rules(inner, &ids);
                    return Err(e.into());
                }
            }
        }
        Ok(ids)
    }

    fn permit_daemon(&self, inner: &Inner, weight: u64) -> Result<(), Error> {
        tracing::debug!("Adding bypass rule for the daemon executable");

        let session = inner.session.as_ref().ok_or(Error::NotEnabled)?;
        for layer in Protocol::All.layers(Direction::Both) {
            let spec = FilterSpec {
                name: "WGTunnel-daemon traffic".to_owned(),
                layer,
                permit: true,
                weight,
                conditions: vec![Condition {
                    field: FWPM_CONDITION_ALE_APP_ID,
                    match_type: FWP_MATCH_EQUAL,
                    value: ConditionValue::AppId(AppId::current_exe()?),
                }],
            };
            session.add_filter(&inner.provider, inner.sublayer, &spec)?;
        }
        Ok(())
    }

    fn permit_loopback(&self, inner: &Inner, weight: u64) -> Result<(), Error> {
        self.add_rules(
            inner,
            "loopback",
            weight,
            || {
                vec![Condition {
                    field: FWPM_CONDITION_FLAGS,
                    match_type: FWP_MATCH_FLAGS_ALL_SET,
                    value: ConditionValue::Uint32(FWP_CONDITION_FLAG_IS_LOOPBACK),
                }]
            },
            true,
            Protocol::All,
            Direction::Both,
        )?;
        Ok(())
    }

    fn permit_tun_interface(&self, inner: &Inner, weight: u64) -> Result<Vec<u64>, Error> {
        let luid = inner.luid;
        self.add_rules(
            inner,
            "on TUN",
            weight,
            || {
                vec![equal(
                    FWPM_CONDITION_IP_LOCAL_INTERFACE,
                    ConditionValue::Uint64(luid),
                )]
            },
            true,
            Protocol::All,
            Direction::Both,
        )
    }

    fn permit_listen_port(
        &self,
        inner: &Inner,
        weight: u64,
        port: u16,
    ) -> Result<Vec<u64>, Error> {
        let luid = inner.luid;
        self.add_rules(
            inner,
            "WireGuard UDP",
            weight,
            || {
                vec![
                    equal(
                        FWPM_CONDITION_IP_LOCAL_INTERFACE,
                        ConditionValue::Uint64(luid),
                    ),
                    equal(FWPM_CONDITION_IP_PROTOCOL, ConditionValue::Uint8(IPPROTO_UDP)),
                    equal(FWPM_CONDITION_IP_LOCAL_PORT, ConditionValue::Uint16(port)),
                ]
            },
            true,
            Protocol::All,
            Direction::Inbound,
        )
    }

    fn permit_dhcp_v4(&self, inner: &Inner, weight: u64) -> Result<(), Error> {
        let base = || {
            vec![
                equal(FWPM_CONDITION_IP_PROTOCOL, ConditionValue::Uint8(IPPROTO_UDP)),
                equal(FWPM_CONDITION_IP_LOCAL_PORT, ConditionValue::Uint16(68)),
                equal(FWPM_CONDITION_IP_REMOTE_PORT, ConditionValue::Uint16(67)),
            ]
        };

        self.add_rules(
            inner,
            "DHCP request",
            weight,
            || {
                let mut conditions = base();
                conditions.push(equal(
                    FWPM_CONDITION_IP_REMOTE_ADDRESS,
                    ConditionValue::V4AddrMask {
                        addr: u32::from(Ipv4Addr::BROADCAST),
                        mask: u32::MAX,
                    },
                ));
                conditions
            },
            true,
            Protocol::V4,
            Direction::Outbound,
        )?;

        self.add_rules(
            inner,
            "DHCP response",
            weight,
            base,
            true,
            Protocol::V4,
            Direction::Inbound,
        )?;
        Ok(())
    }

    fn permit_dhcp_v6(&self, inner: &Inner, weight: u64) -> Result<(), Error> {
        let base = || {
            vec![
                equal(FWPM_CONDITION_IP_PROTOCOL, ConditionValue::Uint8(IPPROTO_UDP)),
                equal(
                    FWPM_CONDITION_IP_LOCAL_ADDRESS,
                    ConditionValue::V6AddrMask {
                        addr: LINK_LOCAL_RANGE.0.octets(),
                        prefix_length: LINK_LOCAL_RANGE.1,
                    },
                ),
                equal(FWPM_CONDITION_IP_LOCAL_PORT, ConditionValue::Uint16(546)),
                equal(FWPM_CONDITION_IP_REMOTE_PORT, ConditionValue::Uint16(547)),
            ]
        };

        // Conditions on the same field OR together: either DHCP multicast
        // group is accepted outbound.
        self.add_rules(
            inner,
            "DHCPv6 request",
            weight,
            || {
                let mut conditions = base();
                for multicast in [LINK_LOCAL_DHCP_MULTICAST, SITE_LOCAL_DHCP_MULTICAST] {
                    conditions.push(equal(
                        FWPM_CONDITION_IP_REMOTE_ADDRESS,
                        ConditionValue::V6AddrMask {
                            addr: multicast.octets(),
                            prefix_length: 128,
                        },
                    ));
                }
                conditions
            },
            true,
            Protocol::V6,
            Direction::Outbound,
        )?;

        self.add_rules(
            inner,
            "DHCPv6 response",
            weight,
            || {
                let mut conditions = base();
                conditions.push(equal(
                    FWPM_CONDITION_IP_REMOTE_ADDRESS,
                    ConditionValue::V6AddrMask {
                        addr: LINK_LOCAL_RANGE.0.octets(),
                        prefix_length: LINK_LOCAL_RANGE.1,
                    },
                ));
                conditions
            },
            true,
            Protocol::V6,
            Direction::Inbound,
        )?;
        Ok(())
    }

    fn permit_ndp(&self, inner: &Inner, weight: u64) -> Result<(), Error> {
        let icmp = |icmp_type: u16, remote: Option<(Ipv6Addr, u8)>| {
            move || {
                let mut conditions = vec![
                    equal(
                        FWPM_CONDITION_IP_PROTOCOL,
                        ConditionValue::Uint8(IPPROTO_ICMPV6),
                    ),
                    equal(FIELD_ICMP_TYPE, ConditionValue::Uint16(icmp_type)),
                    equal(FIELD_ICMP_CODE, ConditionValue::Uint16(0)),
                ];
                if let Some((addr, prefix)) = remote {
                    conditions.push(equal(
                        FWPM_CONDITION_IP_REMOTE_ADDRESS,
                        ConditionValue::V6AddrMask {
                            addr: addr.octets(),
                            prefix_length: prefix,
                        },
                    ));
                }
                conditions
            }
        };

        // Router solicitation, outgoing to the router multicast group.
        self.add_rules(
            inner,
            "NDP type 133",
            weight,
            icmp(133, Some((LINK_LOCAL_ROUTER_MULTICAST, 128))),
            true,
            Protocol::V6,
            Direction::Outbound,
        )?;
        // Router advertisement, incoming from link-local.
        self.add_rules(
            inner,
            "NDP type 134",
            weight,
            icmp(134, Some(LINK_LOCAL_RANGE)),
            true,
            Protocol::V6,
            Direction::Inbound,
        )?;
        // Neighbor solicitation / advertisement, both directions.
        self.add_rules(
            inner,
            "NDP type 135",
            weight,
            icmp(135, None),
            true,
            Protocol::V6,
            Direction::Both,
        )?;
        self.add_rules(
            inner,
            "NDP type 136",
            weight,
            icmp(136, None),
            true,
            Protocol::V6,
            Direction::Both,
        )?;
        // Redirect, incoming from link-local.
        self.add_rules(
            inner,
            "NDP type 137",
            weight,
            icmp(137, Some(LINK_LOCAL_RANGE)),
            true,
            Protocol::V6,
            Direction::Inbound,
        )?;
        Ok(())
    }

    fn block_all(&self, inner: &Inner, weight: u64) -> Result<(), Error> {
        self.add_rules(
            inner,
            "all",
            weight,
            Vec::new,
            false,
            Protocol::All,
            Direction::Both,
        )?;
        Ok(())
    }

    fn add_permissive_rules_for_prefixes(
        &self,
        inner: &Inner,
        prefixes: &[IpNetwork],
        name_prefix: &str,
    ) -> Result<HashMap<IpNetwork, Vec<u64>>, Error> {
        let mut added: HashMap<IpNetwork, Vec<u64>> = HashMap::new();

        for prefix in prefixes {
            if prefix.is_ipv6() && !self.v6_available {
                continue;
            }
            let protocol = if prefix.is_ipv4() {
                Protocol::V4
            } else {
                Protocol::V6
            };

            let result = self.add_rules(
                inner,
                &format!("{name_prefix}{prefix}"),
                WEIGHT_KNOWN_TRAFFIC,
                || vec![remote_prefix(prefix)],
                true,
                protocol,
                Direction::Both,
            );

            match result {
                Ok(rules) => {
                    added.insert(*prefix, rules);
                }
                Err(e) => {
                    // Roll back everything this call added so a failed
                    // mutation leaves no trace.
                    for (rolled_back, rules) in &added {
                        tracing::debug!(prefix = %rolled_back, "Rolling back rules");
                        remove_rules(inner, rules);
                    }
                    return Err(e);
                }
            }
        }

        Ok(added)
    }
}

fn remove_rules(inner: &Inner, rules: &[u64]) {
    let Some(session) = inner.session.as_ref() else {
        return;
    };
    for id in rules {
        if let Err(e) = session.delete_filter(*id) {
            // Deletion failures never abort a teardown.
            tracing::warn!(id, "Failed to delete WFP filter: {e}");
        }
    }
}

impl Firewall for OsFirewall {
    fn enable(&self) -> Result<(), Error> {
        if self.is_enabled() {
            tracing::debug!("Kill switch already active, skipping activation");
            return Ok(());
        }

        let mut inner = self.inner.lock();

        if inner.session.is_none() {
            let session = Session::open(
                "WGTunnel firewall",
                "Manages WGTunnel firewall rules",
            )?;

            // Fresh GUIDs per session: stale objects from an earlier run can
            // never be confused with ours.
            let provider = wfp::new_guid();
            session.add_provider(provider, "WGTunnel provider")?;

            let sublayer = wfp::new_guid();
            session.add_sublayer(
                sublayer,
                "WGTunnel permissive and blocking filters",
                WEIGHT_CATCH_ALL as u16,
            )?;

            inner.session = Some(session);
            inner.provider = provider;
            inner.sublayer = sublayer;
            tracing::debug!("Created fresh WFP session");
        }

        self.permit_daemon(&inner, WEIGHT_DAEMON_TRAFFIC)?;
        self.permit_loopback(&inner, WEIGHT_DAEMON_TRAFFIC)?;
        self.permit_dhcp_v4(&inner, WEIGHT_KNOWN_TRAFFIC)?;

        if self.v6_available {
            self.permit_dhcp_v6(&inner, WEIGHT_KNOWN_TRAFFIC)?;
            self.permit_ndp(&inner, WEIGHT_KNOWN_TRAFFIC)?;
        }

        self.block_all(&inner, WEIGHT_CATCH_ALL)?;

        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("Kill switch enabled");
        Ok(())
    }

    fn disable(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();

        let tun_rules = std::mem::take(&mut inner.tun_rules);
        remove_rules(&inner, &tun_rules);
        inner.local_addr_rules = None;
        inner.permitted_routes.clear();

        // Dropping the dynamic session evaporates every remaining rule; the
        // next enable recreates provider and sublayer with new GUIDs.
        inner.session = None;

        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("Firewall fully disabled and session closed");
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

        let mut inner = self.inner.lock();

        if let Some(old) = inner.local_addr_rules.take() {
            remove_rules(&inner, &old);
        }

        let added = self.add_permissive_rules_for_prefixes(&inner, prefixes, "bypass for local addr ")?;
        inner.local_addr_rules = Some(added.into_values().flatten().collect());

        tracing::debug!("Bypassed local addrs in firewall");
        Ok(())
    }

    fn remove_local_networks(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if let Some(rules) = inner.local_addr_rules.take() {
            remove_rules(&inner, &rules);
        }
        Ok(())
    }

    fn is_allow_local_networks_enabled(&self) -> bool {
        self.inner.lock().local_addr_rules.is_some()
    }

    fn update_permitted_routes(&self, routes: &[IpNetwork]) -> Result<(), Error> {
        if !self.is_enabled() {
            return Err(Error::NotEnabled);
        }

        let mut inner = self.inner.lock();

        let stale: Vec<IpNetwork> = inner
            .permitted_routes
            .keys()
            .filter(|existing| !routes.contains(existing))
            .copied()
            .collect();
        for route in stale {
            if let Some(rules) = inner.permitted_routes.remove(&route) {
                remove_rules(&inner, &rules);
            }
        }

        let missing: Vec<IpNetwork> = routes
            .iter()
            .filter(|route| !inner.permitted_routes.contains_key(route))
            .copied()
            .collect();
        let added = self.add_permissive_rules_for_prefixes(&inner, &missing, "permitted route - ")?;
        inner.permitted_routes.extend(added);

        tracing::debug!(?routes, "Updated permitted routes");
        Ok(())
    }

    fn set_tunnel_port(&self, port: u16) -> Result<(), Error> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let rules = self.permit_listen_port(&inner, WEIGHT_DAEMON_TRAFFIC, port)?;
        inner.tun_rules.extend(rules);
        Ok(())
    }
}
