use anyhow::{anyhow, Result};
use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, error, info, warn};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wifi,
    Loopback,
    Other,
}

/// An IPv4 interface the node can advertise itself on
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub interface_type: InterfaceType,
    pub priority: u8, // Higher number = higher priority
}

impl NetworkInterface {
    pub fn new(name: String, ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let interface_type = Self::detect_interface_type(&name, &ip);
        let priority = match interface_type {
            InterfaceType::Ethernet => 80,
            InterfaceType::Wifi => 60,
            InterfaceType::Other => 20,
            InterfaceType::Loopback => 1,
        };

        Self {
            name,
            ip,
            netmask,
            interface_type,
            priority,
        }
    }

    /// Whether `addr` lives on this interface's subnet
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => {
                let mask = u32::from(self.netmask);
                u32::from(*v4) & mask == u32::from(self.ip) & mask
            }
            IpAddr::V6(_) => false,
        }
    }

    fn is_wifi(name: &str) -> bool {
        name.contains("wlan") || name.contains("wifi") || name.contains("wi-fi") || name.starts_with("wl")
    }

    fn is_ethernet(name: &str) -> bool {
        name.starts_with("eth") || name.starts_with("en")
    }

    fn detect_interface_type(name: &str, ip: &Ipv4Addr) -> InterfaceType {
        if ip.is_loopback() || name == "lo" {
            InterfaceType::Loopback
        } else if Self::is_wifi(name) {
            InterfaceType::Wifi
        } else if Self::is_ethernet(name) {
            InterfaceType::Ethernet
        } else {
            InterfaceType::Other
        }
    }
}

/// Discover all IPv4 interfaces, best first
pub fn discover_interfaces() -> Result<Vec<NetworkInterface>> {
    let if_addrs = get_if_addrs().map_err(|err| {
        error!("Failed to get network interfaces: {}", err);
        anyhow!("Failed to get network interfaces: {}", err)
    })?;

    let mut interfaces: Vec<NetworkInterface> = if_addrs
        .into_iter()
        .filter_map(|interface| match interface.addr {
            IfAddr::V4(addr) if !addr.ip.is_unspecified() => {
                Some(NetworkInterface::new(interface.name, addr.ip, addr.netmask))
            }
            _ => None,
        })
        .collect();

    interfaces.sort_by(|a, b| b.priority.cmp(&a.priority));

    for interface in &interfaces {
        debug!(
            "Interface {} ({:?}) - {}/{}",
            interface.name, interface.interface_type, interface.ip, interface.netmask
        );
    }

    if interfaces.is_empty() {
        warn!("No usable network interfaces found!");
    }

    Ok(interfaces)
}

/// Pick the interface named by `selector`, or the best non-loopback one
pub fn select_interface(selector: Option<&str>) -> Result<NetworkInterface> {
    let interfaces = discover_interfaces()?;
    let chosen = pick_interface(&interfaces, selector);

    match chosen {
        Some(interface) => {
            info!("Using interface {} ({})", interface.name, interface.ip);
            Ok(interface)
        }
        None if selector.is_some() => Err(anyhow!(
            "Network interface '{}' not found or has no IPv4 address",
            selector.unwrap_or_default()
        )),
        None => {
            // Nothing enumerable, ask the OS which address it would route from
            match local_ip() {
                Ok(IpAddr::V4(ip)) => Ok(NetworkInterface::new("default".to_string(), ip, Ipv4Addr::new(255, 255, 255, 0))),
                Ok(other) => Err(anyhow!("Local address {} is not IPv4", other)),
                Err(err) => Err(anyhow!("Failed to determine local IP: {}", err)),
            }
        }
    }
}

fn pick_interface(interfaces: &[NetworkInterface], selector: Option<&str>) -> Option<NetworkInterface> {
    match selector {
        Some(name) => interfaces.iter().find(|i| i.name == name).cloned(),
        None => interfaces
            .iter()
            .find(|i| i.interface_type != InterfaceType::Loopback)
            .cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: [u8; 4]) -> NetworkInterface {
        NetworkInterface::new(name.to_string(), Ipv4Addr::from(ip), Ipv4Addr::new(255, 255, 255, 0))
    }

    #[test]
    fn test_contains_same_subnet_only() {
        let eth = iface("eth0", [192, 168, 1, 20]);
        assert!(eth.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77))));
        assert!(!eth.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 2, 77))));
        assert!(!eth.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_interface_type_detection() {
        assert_eq!(iface("lo", [127, 0, 0, 1]).interface_type, InterfaceType::Loopback);
        assert_eq!(iface("wlan0", [10, 0, 0, 2]).interface_type, InterfaceType::Wifi);
        assert_eq!(iface("enp3s0", [10, 0, 0, 3]).interface_type, InterfaceType::Ethernet);
        assert_eq!(iface("docker0", [172, 17, 0, 1]).interface_type, InterfaceType::Other);
    }

    #[test]
    fn test_pick_interface() {
        let interfaces = vec![iface("eth0", [192, 168, 1, 2]), iface("lo", [127, 0, 0, 1])];

        assert_eq!(pick_interface(&interfaces, None).unwrap().name, "eth0");
        assert_eq!(pick_interface(&interfaces, Some("lo")).unwrap().name, "lo");
        assert!(pick_interface(&interfaces, Some("wlan9")).is_none());
        assert!(pick_interface(&interfaces[1..], None).is_none());
    }
}
