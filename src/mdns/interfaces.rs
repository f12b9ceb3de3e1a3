//! Host network interface discovery.
//!
//! Interfaces are enumerated through `local_ip_address` and grouped by name.
//! Overlay and container plumbing interfaces are filtered out with a set of
//! name patterns before the server joins any multicast group on them.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::Result;
use log::debug;
use regex::RegexSet;

/// Interface name patterns excluded from mDNS by default.
pub const DEFAULT_EXCLUDED_INTERFACES: &[&str] = &[
    "^[A-Fa-f0-9]{15}", // OVN pod interfaces
    "ovn.*",            // ovn-k8s-mp0 and friends
    "br-int",           // OVN integration bridge
    "veth.*",
    "cni.*",
    "ovs-system$",
    "^br-ex$", // OVN gateway bridge
];

/// OVN-Kubernetes masquerade addresses, never advertised for the node.
const MASQUERADE_IPS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(169, 254, 169, 2)),
    IpAddr::V6(Ipv6Addr::new(0xfd69, 0, 0, 0, 0, 0, 0, 2)),
];

/// A host interface and the addresses bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub index: Option<u32>,
    pub addrs: Vec<IpAddr>,
}

impl NetInterface {
    /// First IPv4 address on the interface.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    pub fn has_ipv6(&self) -> bool {
        self.addrs.iter().any(IpAddr::is_ipv6)
    }
}

/// Enumerate host interfaces.
pub fn list_interfaces() -> Result<Vec<NetInterface>> {
    let pairs = local_ip_address::list_afinet_netifas()?;
    Ok(group_by_name(pairs))
}

fn group_by_name(pairs: Vec<(String, IpAddr)>) -> Vec<NetInterface> {
    let mut interfaces: Vec<NetInterface> = Vec::new();
    for (name, ip) in pairs {
        match interfaces.iter_mut().find(|i| i.name == name) {
            Some(iface) => iface.addrs.push(ip),
            None => {
                let index = interface_index(&name);
                interfaces.push(NetInterface {
                    name,
                    index,
                    addrs: vec![ip],
                });
            }
        }
    }
    interfaces
}

#[cfg(unix)]
fn interface_index(name: &str) -> Option<u32> {
    let c_name = std::ffi::CString::new(name).ok()?;
    // SAFETY: `c_name` is a valid NUL-terminated string that outlives the call,
    // and if_nametoindex does not retain the pointer.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        debug!("mDNS: no index for interface {}", name);
        None
    } else {
        Some(index)
    }
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> Option<u32> {
    None
}

/// Compiled denylist of interface name patterns.
#[derive(Debug, Clone)]
pub struct InterfaceFilter {
    patterns: RegexSet,
}

impl InterfaceFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = RegexSet::new(patterns)?;
        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.patterns.is_match(name)
    }
}

impl Default for InterfaceFilter {
    fn default() -> Self {
        Self {
            patterns: RegexSet::new(DEFAULT_EXCLUDED_INTERFACES)
                .unwrap_or_else(|_| RegexSet::empty()),
        }
    }
}

/// Address families advertised for the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFamilies {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl AddressFamilies {
    fn allows(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(_) => self.ipv4,
            IpAddr::V6(_) => self.ipv6,
        }
    }
}

/// Addresses to advertise for the node.
///
/// Starts from `node_ip`; if an interface carries `node_ip`, every usable
/// address on that interface is advertised instead. Masquerade, link-local
/// and disabled-family addresses are dropped. Falls back to `node_ip` alone
/// when nothing usable remains.
pub fn node_addresses(
    node_ip: IpAddr,
    interfaces: &[NetInterface],
    families: AddressFamilies,
) -> Vec<IpAddr> {
    let mut ips = vec![node_ip];

    for iface in interfaces {
        if !iface.addrs.contains(&node_ip) {
            continue;
        }
        let usable: Vec<IpAddr> = iface
            .addrs
            .iter()
            .copied()
            .filter(|ip| !MASQUERADE_IPS.contains(ip))
            .filter(|ip| !is_link_local(ip))
            .filter(|ip| families.allows(ip))
            .collect();
        if !usable.is_empty() {
            ips = usable;
        }
    }

    ips
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            v4.is_link_local() || (a == 224 && b == 0 && c == 0)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            (first & 0xffc0) == 0xfe80 || (v6.is_multicast() && (first & 0x000f) == 0x2)
        }
    }
}
