//! Interface DNS programming plus the PowerShell-driven pieces: the global
//! suffix search list and the network-category tweak.

use std::net::IpAddr;
use std::os::windows::process::CommandExt as _;
use std::process::{Command, Stdio};

use windows::Win32::NetworkManagement::IpHelper::{
    ConvertInterfaceLuidToGuid, DNS_INTERFACE_SETTINGS, DNS_INTERFACE_SETTINGS_VERSION1,
    DNS_SETTING_IPV6, DNS_SETTING_NAMESERVER, DNS_SETTING_SEARCHLIST, SetInterfaceDnsSettings,
};
use windows::Win32::NetworkManagement::Ndis::NET_LUID_LH;
use windows::core::{GUID, PWSTR};

use crate::Error;

const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Programs resolvers (per family) and the search list on the interface;
/// under full tunnel the configured search domains also become the global
/// suffix list so they apply to every lookup.
pub(crate) fn set(
    luid: u64,
    dns: &[IpAddr],
    search_domains: &[String],
    full_tunnel: bool,
) -> Result<(), Error> {
    if full_tunnel && !search_domains.is_empty() {
        if let Err(e) = set_global_search_domains(search_domains) {
            tracing::warn!("Failed to set global search list: {e}");
        }
    }

    let v6_available = tunnel_types::supports_ipv6();
    let v4_servers: Vec<String> = dns
        .iter()
        .filter(|ip| ip.is_ipv4())
        .map(ToString::to_string)
        .collect();
    let v6_servers: Vec<String> = dns
        .iter()
        .filter(|ip| ip.is_ipv6() && v6_available)
        .map(ToString::to_string)
        .collect();

    if !v4_servers.is_empty() || !search_domains.is_empty() {
        set_interface_dns(luid, false, &v4_servers, search_domains)?;
    }
    if !v6_servers.is_empty() || !search_domains.is_empty() {
        set_interface_dns(luid, true, &v6_servers, search_domains)?;
    }

    Ok(())
}

/// Clears interface DNS and puts the global suffix list back.
pub(crate) fn revert(luid: u64, full_tunnel: bool, original_search_domains: Option<Vec<String>>) {
    if full_tunnel {
        let restore = original_search_domains.unwrap_or_default();
        if let Err(e) = set_global_search_domains(&restore) {
            tracing::warn!("Failed to restore global search list: {e}");
        }
    }

    for v6 in [false, true] {
        if let Err(e) = set_interface_dns(luid, v6, &[], &[]) {
            tracing::debug!(v6, "Failed to clear interface DNS: {e}");
        }
    }
}

fn set_interface_dns(
    luid: u64,
    v6: bool,
    servers: &[String],
    search_domains: &[String],
) -> Result<(), Error> {
    let guid = interface_guid(luid)?;

    let mut name_server: Vec<u16> = servers
        .join(",")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();
    let mut search_list: Vec<u16> = search_domains
        .join(",")
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    let mut flags = DNS_SETTING_NAMESERVER | DNS_SETTING_SEARCHLIST;
    if v6 {
        flags |= DNS_SETTING_IPV6;
    }

    let settings = DNS_INTERFACE_SETTINGS {
        Version: DNS_INTERFACE_SETTINGS_VERSION1,
        Flags: flags as u64,
        NameServer: PWSTR(name_server.as_mut_ptr()),
        SearchList: PWSTR(search_list.as_mut_ptr()),
        ..Default::default()
    };

    // SAFETY: `settings` and its string buffers outlive the call.
    let status = unsafe { SetInterfaceDnsSettings(guid, &settings) };
    status.ok().map_err(Error::Windows)
}

fn interface_guid(luid: u64) -> Result<GUID, Error> {
    let luid = NET_LUID_LH { Value: luid };
    let mut guid = GUID::zeroed();
    // SAFETY: both pointers reference locals valid for the call.
    let status = unsafe { ConvertInterfaceLuidToGuid(&luid, &mut guid) };
    status.ok().map_err(Error::Windows)?;
    Ok(guid)
}

/// Reads the current global suffix search list.
pub(crate) fn global_search_domains() -> Result<Vec<String>, Error> {
    let output = powershell("(Get-DnsClientGlobalSetting).SuffixSearchList")?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}

fn set_global_search_domains(domains: &[String]) -> Result<(), Error> {
    let list = domains
        .iter()
        .map(|domain| format!("'{domain}'"))
        .collect::<Vec<_>>()
        .join(",");
    powershell(&format!(
        "Set-DnsClientGlobalSetting -SuffixSearchList @({list})"
    ))?;
    Ok(())
}

/// Moves the tunnel interface to the Private network category so local
/// discovery keeps working for users who expect it.
pub(crate) fn set_private_network(alias: &str) -> Result<(), Error> {
    let current = powershell(&format!(
        "Get-NetConnectionProfile -InterfaceAlias \"{alias}\" | \
         Select-Object -ExpandProperty NetworkCategory"
    ))?;
    let category = current.trim();

    if category.is_empty() {
        tracing::debug!(%alias, "Adapter has no connection profile yet");
        return Ok(());
    }
    if category == "Private" || category == "DomainAuthenticated" {
        return Ok(());
    }

    powershell(&format!(
        "Set-NetConnectionProfile -InterfaceAlias \"{alias}\" -NetworkCategory Private"
    ))?;
    tracing::debug!(%alias, "Set network category to Private");
    Ok(())
}

/// Flushes the system resolver cache.
pub(crate) fn flush_caches() -> Result<(), Error> {
    let output = Command::new("ipconfig")
        .arg("/flushdns")
        .creation_flags(CREATE_NO_WINDOW)
        .stdout(Stdio::null())
        .output()?;

    if !output.status.success() {
        return Err(Error::Command {
            command: "ipconfig /flushdns".to_owned(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

fn powershell(script: &str) -> Result<String, Error> {
    let output = Command::new("powershell")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(script)
        .creation_flags(CREATE_NO_WINDOW)
        .output()?;

    if !output.status.success() {
        return Err(Error::Command {
            command: format!("powershell {script}"),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
