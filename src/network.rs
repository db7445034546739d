use dns_lookup::lookup_host;
use pnet::datalink::NetworkInterface;
use pnet::datalink::interfaces;
use std::net::IpAddr;
use tracing::debug;
use tracing::warn;

use crate::error::TamperError;

/// What the orchestrator needs to know about the host's network.
pub trait HostNetwork: Send {
    /// Non-loopback, non-link-local addresses usable as probe sources.
    fn local_addrs(&self) -> Vec<IpAddr>;
    fn link_active(&self) -> bool;
    /// Free-form description attached to the final report.
    fn describe(&self) -> String;
}

pub(crate) fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(ipv4) => ipv4.is_link_local(),
        IpAddr::V6(ipv6) => (ipv6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Loopback and link-local addresses never reach the remote server.
pub(crate) fn usable_source(addr: &IpAddr) -> bool {
    !addr.is_loopback() && !is_link_local(addr)
}

fn usable(interface: &NetworkInterface) -> bool {
    interface.is_up() && !interface.is_loopback()
}

/// Enumerates the host interfaces on every call.
pub struct SystemNetwork;

impl HostNetwork for SystemNetwork {
    fn local_addrs(&self) -> Vec<IpAddr> {
        let mut addrs = Vec::new();
        for interface in interfaces() {
            if !usable(&interface) {
                continue;
            }
            for ipnetwork in &interface.ips {
                let ip = ipnetwork.ip();
                if !usable_source(&ip) {
                    continue;
                }
                debug!("found local addr {} on {}", ip, interface.name);
                addrs.push(ip);
            }
        }
        addrs
    }
    fn link_active(&self) -> bool {
        let active = interfaces().iter().any(|i| usable(i) && !i.ips.is_empty());
        if !active {
            warn!("no active network interface");
        }
        active
    }
    fn describe(&self) -> String {
        let mut parts = Vec::new();
        for interface in interfaces() {
            if !usable(&interface) {
                continue;
            }
            let ips: Vec<String> = interface.ips.iter().map(|n| n.to_string()).collect();
            let mac = match interface.mac {
                Some(m) => m.to_string(),
                None => String::from("-"),
            };
            parts.push(format!("{} ({}) [{}]", interface.name, mac, ips.join(", ")));
        }
        parts.join("; ")
    }
}

/// Fixed answers, used when the addresses come from the config.
#[derive(Debug, Clone)]
pub struct StaticNetwork {
    pub addrs: Vec<IpAddr>,
    pub active: bool,
    pub description: String,
}

impl StaticNetwork {
    pub fn new(addrs: Vec<IpAddr>) -> StaticNetwork {
        let description = addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<String>>()
            .join(", ");
        StaticNetwork {
            addrs,
            active: true,
            description: format!("static [{}]", description),
        }
    }
}

impl HostNetwork for StaticNetwork {
    fn local_addrs(&self) -> Vec<IpAddr> {
        self.addrs.clone()
    }
    fn link_active(&self) -> bool {
        self.active
    }
    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Literal addresses are taken as is, names go through the system resolver.
pub fn resolve_host(host: &str) -> Result<IpAddr, TamperError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let ips = match lookup_host(host) {
        Ok(ips) => ips,
        Err(e) => {
            warn!("dns query {} failed: {}", host, e);
            return Err(TamperError::UnknownHost {
                host: host.to_string(),
            });
        }
    };
    match ips.first() {
        Some(ip) => {
            debug!("{} resolved to {}", host, ip);
            Ok(*ip)
        }
        None => Err(TamperError::UnknownHost {
            host: host.to_string(),
        }),
    }
}

/// Keep only the addresses that can reach `remote`.
pub fn same_family(addrs: &[IpAddr], remote: &IpAddr) -> Vec<IpAddr> {
    addrs
        .iter()
        .filter(|a| a.is_ipv4() == remote.is_ipv4())
        .copied()
        .collect()
}
