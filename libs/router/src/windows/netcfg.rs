//! Thin wrappers over the IP Helper API: unicast addresses, the forward
//! table and per-interface parameters, all keyed by interface LUID.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use ipnetwork::IpNetwork;
use windows::Win32::Foundation::{ERROR_NOT_FOUND, WIN32_ERROR};
use windows::Win32::NetworkManagement::IpHelper::{
    ConvertInterfaceAliasToLuid, CreateIpForwardEntry2, CreateUnicastIpAddressEntry,
    DeleteIpForwardEntry2, DeleteUnicastIpAddressEntry, FreeMibTable, GetIpForwardTable2,
    GetIpInterfaceEntry, GetUnicastIpAddressTable, InitializeIpForwardEntry,
    InitializeIpInterfaceEntry, InitializeUnicastIpAddressEntry, MIB_IPFORWARD_ROW2,
    MIB_IPFORWARD_TABLE2, MIB_IPINTERFACE_ROW, MIB_UNICASTIPADDRESS_ROW,
    MIB_UNICASTIPADDRESS_TABLE, RouterDiscoveryDisabled, SetIpInterfaceEntry,
    SetUnicastIpAddressEntry,
};
use windows::Win32::NetworkManagement::Ndis::NET_LUID_LH;
use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6, AF_UNSPEC, SOCKADDR_INET};
use windows::core::PCWSTR;

use crate::Error;

/// `ERROR_OBJECT_ALREADY_EXISTS` as surfaced through an HRESULT.
const DUPLICATE_ROUTE: u32 = 0x8007_1392;

fn check(status: WIN32_ERROR) -> Result<(), Error> {
    status.ok().map_err(Error::Windows)
}

fn luid_of(raw: u64) -> NET_LUID_LH {
    NET_LUID_LH { Value: raw }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

pub(crate) fn luid_from_alias(alias: &str) -> Result<u64, Error> {
    let alias = wide(alias);
    let mut luid = NET_LUID_LH::default();
    // SAFETY: both pointers reference locals valid for the call.
    check(unsafe { ConvertInterfaceAliasToLuid(PCWSTR(alias.as_ptr()), &mut luid) })?;
    // SAFETY: NET_LUID_LH is a u64 union.
    Ok(unsafe { luid.Value })
}

fn sockaddr_of(ip: IpAddr) -> SOCKADDR_INET {
    let mut addr = SOCKADDR_INET::default();
    match ip {
        IpAddr::V4(v4) => addr.Ipv4 = SocketAddrV4::new(v4, 0).into(),
        IpAddr::V6(v6) => addr.Ipv6 = SocketAddrV6::new(v6, 0, 0, 0).into(),
    }
    addr
}

fn ip_of(addr: &SOCKADDR_INET) -> Option<IpAddr> {
    // SAFETY: the union discriminates on si_family.
    unsafe {
        match addr.si_family {
            AF_INET => {
                let octets = addr.Ipv4.sin_addr.S_un.S_addr.to_ne_bytes();
                Some(IpAddr::V4(octets.into()))
            }
            AF_INET6 => Some(IpAddr::V6(addr.Ipv6.sin6_addr.u.Byte.into())),
            _ => None,
        }
    }
}

/// Unicast addresses currently assigned to the interface.
pub(crate) fn unicast_addresses(luid: u64) -> Result<Vec<IpNetwork>, Error> {
    let mut table: *mut MIB_UNICASTIPADDRESS_TABLE = std::ptr::null_mut();
    // SAFETY: `table` receives an allocation freed below.
    check(unsafe { GetUnicastIpAddressTable(AF_UNSPEC, &mut table) })?;

    let mut addresses = Vec::new();
    // SAFETY: the table layout is NumEntries followed by that many rows.
    unsafe {
        let rows = std::slice::from_raw_parts(
            (*table).Table.as_ptr(),
            (*table).NumEntries as usize,
        );
        for row in rows {
            if row.InterfaceLuid.Value != luid {
                continue;
            }
            if let Some(ip) = ip_of(&row.Address) {
                if let Ok(net) = IpNetwork::new(ip, row.OnLinkPrefixLength) {
                    addresses.push(net);
                }
            }
        }
        FreeMibTable(table as *const core::ffi::c_void);
    }

    Ok(addresses)
}

pub(crate) fn add_address(luid: u64, net: IpNetwork) -> Result<(), Error> {
    let mut row = MIB_UNICASTIPADDRESS_ROW::default();
    // SAFETY: initializes the row in place with defaults.
    unsafe { InitializeUnicastIpAddressEntry(&mut row) };
    row.InterfaceLuid = luid_of(luid);
    row.Address = sockaddr_of(net.ip());
    row.OnLinkPrefixLength = net.prefix();

    // SAFETY: the row is fully initialized above.
    check(unsafe { CreateUnicastIpAddressEntry(&row) })
}

pub(crate) fn delete_address(luid: u64, net: IpNetwork) -> Result<(), Error> {
    let mut row = MIB_UNICASTIPADDRESS_ROW::default();
    // SAFETY: initializes the row in place with defaults.
    unsafe { InitializeUnicastIpAddressEntry(&mut row) };
    row.InterfaceLuid = luid_of(luid);
    row.Address = sockaddr_of(net.ip());
    row.OnLinkPrefixLength = net.prefix();

    // SAFETY: the row is fully initialized above.
    check(unsafe { DeleteUnicastIpAddressEntry(&row) })
}

/// Marks a retained link-local address as skip-as-source so it never wins
/// source selection.
pub(crate) fn set_skip_as_source(luid: u64, net: IpNetwork) -> Result<(), Error> {
    let mut row = MIB_UNICASTIPADDRESS_ROW::default();
    // SAFETY: initializes the row in place with defaults.
    unsafe { InitializeUnicastIpAddressEntry(&mut row) };
    row.InterfaceLuid = luid_of(luid);
    row.Address = sockaddr_of(net.ip());
    row.OnLinkPrefixLength = net.prefix();
    row.SkipAsSource = true.into();

    // SAFETY: the row is fully initialized above.
    check(unsafe { SetUnicastIpAddressEntry(&row) })
}

/// A route on the tunnel interface, the unit of the sync delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RouteData {
    pub destination: IpNetwork,
    pub next_hop: IpAddr,
    pub metric: u32,
}

impl RouteData {
    pub(crate) fn compare(&self, other: &Self) -> std::cmp::Ordering {
        crate::net_compare(&self.destination, &other.destination)
            .then_with(|| self.next_hop.cmp(&other.next_hop))
            .then_with(|| self.metric.cmp(&other.metric))
    }
}

/// All routes currently attached to the interface, both families.
pub(crate) fn interface_routes(luid: u64) -> Result<Vec<RouteData>, Error> {
    let mut table: *mut MIB_IPFORWARD_TABLE2 = std::ptr::null_mut();
    // SAFETY: `table` receives an allocation freed below.
    check(unsafe { GetIpForwardTable2(AF_UNSPEC, &mut table) })?;

    let mut routes = Vec::new();
    // SAFETY: the table layout is NumEntries followed by that many rows.
    unsafe {
        let rows = std::slice::from_raw_parts(
            (*table).Table.as_ptr(),
            (*table).NumEntries as usize,
        );
        for row in rows {
            if row.InterfaceLuid.Value != luid {
                continue;
            }
            let Some(dest) = ip_of(&row.DestinationPrefix.Prefix) else {
                continue;
            };
            let Ok(destination) = IpNetwork::new(dest, row.DestinationPrefix.PrefixLength) else {
                continue;
            };
            let next_hop = ip_of(&row.NextHop).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            routes.push(RouteData {
                destination,
                next_hop,
                metric: row.Metric,
            });
        }
        FreeMibTable(table as *const core::ffi::c_void);
    }

    Ok(routes)
}

fn forward_row(luid: u64, route: &RouteData) -> MIB_IPFORWARD_ROW2 {
    let mut row = MIB_IPFORWARD_ROW2::default();
    // SAFETY: initializes the row in place with defaults.
    unsafe { InitializeIpForwardEntry(&mut row) };
    row.InterfaceLuid = luid_of(luid);
    row.DestinationPrefix.Prefix = sockaddr_of(route.destination.ip());
    row.DestinationPrefix.PrefixLength = route.destination.prefix();
    row.NextHop = sockaddr_of(route.next_hop);
    row.Metric = route.metric;
    row
}

pub(crate) fn add_route(luid: u64, route: &RouteData) -> Result<(), Error> {
    let row = forward_row(luid, route);
    // SAFETY: the row is fully initialized above.
    match check(unsafe { CreateIpForwardEntry2(&row) }) {
        Ok(()) => Ok(()),
        Err(Error::Windows(e)) if e.code().0 as u32 == DUPLICATE_ROUTE => {
            tracing::debug!(route = %route.destination, "Route already exists, ignoring");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn delete_route(luid: u64, route: &RouteData) -> Result<(), Error> {
    let row = forward_row(luid, route);
    // SAFETY: the row is fully initialized above.
    check(unsafe { DeleteIpForwardEntry2(&row) })
}

/// Per-family interface parameters applied after routes are in place.
pub(crate) struct InterfaceProperties {
    pub mtu: u16,
    /// Pin the metric to 0 so the tunnel out-ranks every other interface.
    pub pin_metric: bool,
}

/// Applies interface parameters; returns Ok(false) when the family does not
/// exist on the interface (no address of that family).
pub(crate) fn set_interface_properties(
    luid: u64,
    v6: bool,
    properties: &InterfaceProperties,
) -> Result<bool, Error> {
    let mut row = MIB_IPINTERFACE_ROW::default();
    // SAFETY: initializes the row in place with defaults.
    unsafe { InitializeIpInterfaceEntry(&mut row) };
    row.InterfaceLuid = luid_of(luid);
    row.Family = if v6 { AF_INET6 } else { AF_INET };

    // SAFETY: the row carries the lookup key set above.
    match unsafe { GetIpInterfaceEntry(&mut row) } {
        status if status == ERROR_NOT_FOUND => return Ok(false),
        status => check(status)?,
    }

    if properties.mtu > 0 {
        row.NlMtu = u32::from(properties.mtu);
    }
    if properties.pin_metric {
        row.UseAutomaticMetric = false.into();
        row.Metric = 0;
    }
    if v6 {
        row.DadTransmits = 0;
        row.RouterDiscoveryBehavior = RouterDiscoveryDisabled;
    }
    // SetIpInterfaceEntry rejects rows with a stale SitePrefixLength.
    row.SitePrefixLength = 0;

    // SAFETY: the row came from GetIpInterfaceEntry.
    check(unsafe { SetIpInterfaceEntry(&mut row) })?;
    Ok(true)
}

/// The highest address inside `net` as a host prefix (the broadcast-style
/// route Windows attaches to on-link prefixes).
pub(crate) fn last_ip_host_prefix(net: &IpNetwork) -> IpNetwork {
    match net {
        IpNetwork::V4(v4) => {
            let last = u32::from(v4.network()) | !u32::from(v4.mask());
            IpNetwork::V4(
                ipnetwork::Ipv4Network::new(Ipv4Addr::from(last), 32)
                    .expect("host prefix is valid"),
            )
        }
        IpNetwork::V6(v6) => {
            let last = u128::from(v6.network()) | !u128::from(v6.mask());
            IpNetwork::V6(
                ipnetwork::Ipv6Network::new(Ipv6Addr::from(last), 128)
                    .expect("host prefix is valid"),
            )
        }
    }
}
