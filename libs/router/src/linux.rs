//! Linux routing via rtnetlink.
//!
//! Full-tunnel routes live in a dedicated table (52) selected by policy
//! rules; the main table keeps the ISP default so marked traffic can still
//! escape. Rule priorities: 50 routes the bootstrap resolver's marked
//! packets through main (above everything else), 100 does the same for the
//! tunnel's own encrypted packets, 200 sends the rest to the tunnel table.

mod dns;

use std::sync::Arc;

use futures::TryStreamExt as _;
use ipnetwork::IpNetwork;
use libc::{EEXIST, ENOENT, ESRCH};
use netlink_packet_route::AddressFamily;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::route::{RouteProtocol, RouteScope};
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::Error::NetlinkError;
use rtnetlink::{Handle, IpVersion, LinkUnspec, RouteMessageBuilder};
use tunnel_types::RouterConfig;
use tunnel_types::marks::{BOOTSTRAP_MARK, BYPASS_MARK, MARK_MASK};

use crate::{Error, Router};
use firewall::Firewall as _;

const RULE_PRIO_BOOTSTRAP: u32 = 50;
const RULE_PRIO_MARK: u32 = 100;
const RULE_PRIO_DEFAULT: u32 = 200;

const TUNNEL_TABLE_ID: u32 = 52;
const MAIN_TABLE_ID: u32 = libc::RT_TABLE_MAIN as u32;

pub struct OsRouter {
    iface: String,
    fw: Arc<firewall::OsFirewall>,
    handle: Handle,
    connection: tokio::task::JoinHandle<()>,
    prev_config: Option<RouterConfig>,
    we_engaged_ks: bool,
    dns_configured: bool,
    v6_available: bool,
}

impl Drop for OsRouter {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

impl OsRouter {
    /// Creates a router for `iface` sharing the process firewall.
    ///
    /// Panics if called without a Tokio runtime.
    pub fn new(iface: &str, fw: Arc<firewall::OsFirewall>) -> Result<Self, Error> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        let connection = tokio::spawn(connection);

        Ok(Self {
            iface: iface.to_owned(),
            fw,
            handle,
            connection,
            prev_config: None,
            we_engaged_ks: false,
            dns_configured: false,
            v6_available: tunnel_types::supports_ipv6(),
        })
    }

    async fn link_index(&self) -> Result<u32, Error> {
        let link = self
            .handle
            .link()
            .get()
            .match_name(self.iface.clone())
            .execute()
            .try_next()
            .await
            .map_err(|_| Error::LinkNotFound(self.iface.clone()))?
            .ok_or_else(|| Error::LinkNotFound(self.iface.clone()))?;

        Ok(link.header.index)
    }

    fn sync_firewall_state(&mut self, new: &RouterConfig) -> Result<(), Error> {
        let requires_ks = new.has_any_default();

        if requires_ks && !self.fw.is_enabled() {
            self.fw.enable()?;
            self.we_engaged_ks = true;
            self.fw.add_tunnel_bypasses(&self.iface)?;
        } else if !requires_ks && self.we_engaged_ks {
            self.fw.disable()?;
            self.we_engaged_ks = false;
        }
        Ok(())
    }

    async fn sync_device_params(&self, index: u32, new: &RouterConfig, prev: &RouterConfig) {
        if new.mtu > 0 && new.mtu != prev.mtu {
            let result = self
                .handle
                .link()
                .set(
                    LinkUnspec::new_with_index(index)
                        .mtu(u32::from(new.mtu))
                        .build(),
                )
                .execute()
                .await;
            if let Err(e) = result {
                tracing::warn!(mtu = new.mtu, "Failed to set MTU: {e}");
            }
        }

        if new.listen_port != 0 && new.listen_port != prev.listen_port {
            if let Err(e) = self.fw.set_tunnel_port(new.listen_port) {
                tracing::warn!(port = new.listen_port, "Failed to punch tunnel port: {e}");
            }
        }
    }

    async fn cleanup_previous_state(&self, index: u32, new: &RouterConfig, prev: &RouterConfig) {
        if self.prev_config.is_none() {
            return;
        }

        for addr in &prev.tunnel_addrs {
            if !new.tunnel_addrs.contains(addr) {
                if let Err(e) = self.delete_address(index, *addr).await {
                    tracing::warn!(%addr, "Failed to delete address: {e}");
                }
            }
        }

        let prev_v4_full = prev.has_default(true);
        let prev_v6_full = prev.has_default(false);

        for route in &prev.routes {
            if !new.routes.contains(route) {
                let full = if route.is_ipv4() {
                    prev_v4_full
                } else {
                    prev_v6_full
                };
                let table = if full { TUNNEL_TABLE_ID } else { MAIN_TABLE_ID };
                self.delete_route(index, *route, table).await;
            }
        }

        if prev_v4_full && !new.has_default(true) {
            self.delete_policy_rules(IpVersion::V4).await;
        }
        if prev_v6_full && !new.has_default(false) {
            self.delete_policy_rules(IpVersion::V6).await;
        }
    }

    async fn apply_new_addresses(&self, index: u32, new: &RouterConfig) -> Result<(), Error> {
        let existing = self.list_addresses(index).await?;

        for addr in &new.tunnel_addrs {
            if addr.is_ipv6() && !self.v6_available {
                continue;
            }
            if existing.contains(addr) {
                continue;
            }
            self.handle
                .address()
                .add(index, addr.ip(), addr.prefix())
                .replace()
                .execute()
                .await?;
            tracing::debug!(%addr, "Assigned tunnel address");
        }
        Ok(())
    }

    async fn sync_routing_and_rules(&self, index: u32, new: &RouterConfig) -> Result<(), Error> {
        let mut families = vec![IpVersion::V4];
        if self.v6_available {
            families.push(IpVersion::V6);
        }

        for family in families {
            let v4 = matches!(family, IpVersion::V4);
            let full = new.has_default(v4);

            if full {
                self.add_policy_rules(family.clone()).await?;
                self.add_bootstrap_policy_rule(family.clone()).await?;
            }

            let table = if full { TUNNEL_TABLE_ID } else { MAIN_TABLE_ID };
            for route in new.routes_for(v4) {
                self.replace_route(index, *route, table).await?;
            }
        }
        Ok(())
    }

    async fn sync_dns(&mut self, new: &RouterConfig, prev: &RouterConfig) -> Result<(), Error> {
        let v4_full = new.has_default(true);
        let v6_full = new.has_default(false);
        let dns_changed = new.dns != prev.dns || new.search_domains != prev.search_domains;
        let state_changed =
            (v4_full != prev.has_default(true)) || (v6_full != prev.has_default(false));

        if !dns_changed && !state_changed {
            return Ok(());
        }

        if new.dns.is_empty() && new.search_domains.is_empty() {
            if self.dns_configured {
                dns::revert(&self.iface).await?;
                self.dns_configured = false;
            }
            return Ok(());
        }

        dns::set(&self.iface, &new.dns, &new.search_domains, v4_full || v6_full).await?;
        self.dns_configured = true;
        Ok(())
    }

    async fn list_addresses(&self, index: u32) -> Result<Vec<IpNetwork>, Error> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut addrs = Vec::new();
        while let Some(message) = stream.try_next().await? {
            let prefix = message.header.prefix_len;
            let ip = message.attributes.iter().find_map(|attr| match attr {
                AddressAttribute::Address(ip) => Some(*ip),
                _ => None,
            });
            if let Some(ip) = ip {
                if let Ok(net) = IpNetwork::new(ip, prefix) {
                    addrs.push(net);
                }
            }
        }
        Ok(addrs)
    }

    async fn delete_address(&self, index: u32, addr: IpNetwork) -> Result<(), Error> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        while let Some(message) = stream.try_next().await? {
            let matches = message.header.prefix_len == addr.prefix()
                && message.attributes.iter().any(|attr| {
                    matches!(attr, AddressAttribute::Address(ip) if *ip == addr.ip())
                });
            if matches {
                self.handle.address().del(message).execute().await?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn replace_route(&self, index: u32, route: IpNetwork, table: u32) -> Result<(), Error> {
        let message = match route {
            IpNetwork::V4(net) => RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                .output_interface(index)
                .protocol(RouteProtocol::Static)
                .scope(RouteScope::Universe)
                .table_id(table)
                .destination_prefix(net.network(), net.prefix())
                .build(),
            IpNetwork::V6(net) => RouteMessageBuilder::<std::net::Ipv6Addr>::new()
                .output_interface(index)
                .protocol(RouteProtocol::Static)
                .scope(RouteScope::Universe)
                .table_id(table)
                .destination_prefix(net.network(), net.prefix())
                .build(),
        };

        match self.handle.route().add(message).replace().execute().await {
            Ok(()) => Ok(()),
            // No IPv6 support for this route type: skip, don't fail.
            Err(NetlinkError(e)) if e.raw_code() == -libc::EOPNOTSUPP => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_route(&self, index: u32, route: IpNetwork, table: u32) {
        let message = match route {
            IpNetwork::V4(net) => RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                .output_interface(index)
                .table_id(table)
                .destination_prefix(net.network(), net.prefix())
                .build(),
            IpNetwork::V6(net) => RouteMessageBuilder::<std::net::Ipv6Addr>::new()
                .output_interface(index)
                .table_id(table)
                .destination_prefix(net.network(), net.prefix())
                .build(),
        };

        if let Err(e) = self.handle.route().del(message).execute().await {
            // Stale view of the table; a missing route is not a problem.
            if matches!(&e, NetlinkError(err) if err.raw_code() == -ENOENT || err.raw_code() == -ESRCH)
            {
                return;
            }
            tracing::warn!(%route, table, "Failed to remove route: {e}");
        }
    }

    /// Mark rule (prio 100 → main) and catch-all rule (prio 200 → 52).
    async fn add_policy_rules(&self, family: IpVersion) -> Result<(), Error> {
        self.add_rule_idempotent(
            family.clone(),
            RULE_PRIO_MARK,
            Some(BYPASS_MARK),
            MAIN_TABLE_ID,
        )
        .await?;
        self.add_rule_idempotent(family, RULE_PRIO_DEFAULT, None, TUNNEL_TABLE_ID)
            .await
    }

    /// Bootstrap rule (prio 50 → main): strictly above the bypass rule so
    /// resolver queries never consult the tunnel table.
    async fn add_bootstrap_policy_rule(&self, family: IpVersion) -> Result<(), Error> {
        self.add_rule_idempotent(
            family,
            RULE_PRIO_BOOTSTRAP,
            Some(BOOTSTRAP_MARK),
            MAIN_TABLE_ID,
        )
        .await
    }

    async fn add_rule_idempotent(
        &self,
        family: IpVersion,
        priority: u32,
        fwmark: Option<u32>,
        table: u32,
    ) -> Result<(), Error> {
        let mut existing = self.handle.rule().get(family.clone()).execute();
        while let Some(rule) = existing.try_next().await? {
            if rule_matches(&rule, priority, fwmark, table) {
                tracing::trace!(priority, "Policy rule already exists, skipping");
                return Ok(());
            }
        }

        let request = self.handle.rule().add();
        let request = match family {
            IpVersion::V4 => request.v4(),
            IpVersion::V6 => request.v6(),
        };
        let mut request = request
            .table_id(table)
            .priority(priority)
            .action(RuleAction::ToTable);
        if let Some(mark) = fwmark {
            request = request.fw_mark(mark);
            request
                .message_mut()
                .attributes
                .push(RuleAttribute::FwMask(MARK_MASK));
        }

        match request.execute().await {
            Ok(()) => Ok(()),
            Err(NetlinkError(e)) if e.raw_code() == -EEXIST => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_policy_rules(&self, family: IpVersion) {
        for (priority, fwmark, table) in [
            (RULE_PRIO_BOOTSTRAP, Some(BOOTSTRAP_MARK), MAIN_TABLE_ID),
            (RULE_PRIO_MARK, Some(BYPASS_MARK), MAIN_TABLE_ID),
            (RULE_PRIO_DEFAULT, None, TUNNEL_TABLE_ID),
        ] {
            let mut message = RuleMessage::default();
            message.header.family = match family {
                IpVersion::V4 => AddressFamily::Inet,
                IpVersion::V6 => AddressFamily::Inet6,
            };
            message.header.action = RuleAction::ToTable;
            message.attributes.push(RuleAttribute::Priority(priority));
            message.attributes.push(RuleAttribute::Table(table));
            if let Some(mark) = fwmark {
                message.attributes.push(RuleAttribute::FwMark(mark));
            }

            if let Err(e) = self.handle.rule().del(message).execute().await {
                // Rules may be gone already (family never full, or a
                // previous cleanup ran); that is fine.
                tracing::debug!(priority, "Policy rule removal skipped: {e}");
            }
        }
    }
}

fn rule_matches(rule: &RuleMessage, priority: u32, fwmark: Option<u32>, table: u32) -> bool {
    let mut rule_priority = None;
    let mut rule_mark = None;
    let mut rule_table = u32::from(rule.header.table);

    for attr in &rule.attributes {
        match attr {
            RuleAttribute::Priority(p) => rule_priority = Some(*p),
            RuleAttribute::FwMark(m) => rule_mark = Some(*m),
            RuleAttribute::Table(t) => rule_table = *t,
            _ => {}
        }
    }

    rule_priority == Some(priority) && rule_mark == fwmark && rule_table == table
}

impl Router for OsRouter {
    async fn set(&mut self, config: Option<&RouterConfig>) -> Result<(), Error> {
        let new = config.cloned().unwrap_or_default();
        let prev = self.prev_config.clone().unwrap_or_default();

        if self.prev_config.as_ref() == Some(&new) {
            tracing::debug!("Config unchanged, skipping");
            return Ok(());
        }

        let index = self.link_index().await?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await?;

        self.sync_firewall_state(&new)?;
        self.sync_device_params(index, &new, &prev).await;
        self.cleanup_previous_state(index, &new, &prev).await;
        self.apply_new_addresses(index, &new).await?;
        self.sync_routing_and_rules(index, &new).await?;
        self.sync_dns(&new, &prev).await?;

        tracing::debug!(
            v4_full = new.has_default(true),
            v6_full = new.has_default(false),
            "Router state updated"
        );
        self.prev_config = Some(new);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.prev_config.is_some() && self.dns_configured {
            if let Err(e) = dns::revert(&self.iface).await {
                tracing::warn!("Failed to revert DNS on close: {e}");
            }
            self.dns_configured = false;
        }

        if let Err(e) = self.set(None).await {
            tracing::warn!("Cleanup set failed: {e}");
        }

        if self.we_engaged_ks && self.fw.is_enabled() {
            tracing::debug!(iface = %self.iface, "Disabling full tunnel kill switch");
            self.fw.disable()?;
            self.we_engaged_ks = false;
        } else if self.fw.is_enabled() {
            tracing::debug!(iface = %self.iface, "Removing firewall bypasses");
            self.fw.remove_tunnel_bypasses(&self.iface)?;
        }

        self.delete_policy_rules(IpVersion::V4).await;
        if self.v6_available {
            self.delete_policy_rules(IpVersion::V6).await;
        }

        tracing::debug!("Router closed");
        Ok(())
    }
}
