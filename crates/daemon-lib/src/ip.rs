//! Dual-stack address and network pairs, plus CIDR helpers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

use crate::rpc;

/// An IPv4/IPv6 address pair; either side may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSet {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl IpSet {
    pub fn from_v4(addr: Ipv4Addr) -> Self {
        Self {
            ipv4: Some(addr),
            ipv6: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }

    /// Comma-joined addresses, v4 first. Used for the pod annotation patch.
    pub fn join(&self) -> String {
        let mut out = Vec::new();
        if let Some(v4) = self.ipv4 {
            out.push(v4.to_string());
        }
        if let Some(v6) = self.ipv6 {
            out.push(v6.to_string());
        }
        out.join(",")
    }

    pub fn to_rpc(&self) -> rpc::IpSet {
        rpc::IpSet {
            ipv4: self.ipv4.map(|a| a.to_string()).unwrap_or_default(),
            ipv6: self.ipv6.map(|a| a.to_string()).unwrap_or_default(),
        }
    }
}

/// An IPv4/IPv6 CIDR pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpNetSet {
    pub ipv4: Option<Ipv4Network>,
    pub ipv6: Option<Ipv6Network>,
}

impl IpNetSet {
    /// Parse a comma-separated CIDR list into the pair. Later entries of the
    /// same family win.
    pub fn parse(cidrs: &str) -> anyhow::Result<Self> {
        let mut set = Self::default();
        for part in cidrs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match part.parse::<IpNetwork>()? {
                IpNetwork::V4(n) => set.ipv4 = Some(n),
                IpNetwork::V6(n) => set.ipv6 = Some(n),
            }
        }
        Ok(set)
    }

    pub fn to_rpc(&self) -> rpc::IpSet {
        rpc::IpSet {
            ipv4: self.ipv4.map(|n| n.to_string()).unwrap_or_default(),
            ipv6: self.ipv6.map(|n| n.to_string()).unwrap_or_default(),
        }
    }
}

/// Gateway of a subnet: the first usable address after the network base.
pub fn derive_gateway(cidr: &IpNetwork) -> IpAddr {
    match cidr {
        IpNetwork::V4(n) => {
            let base = u32::from(n.network());
            IpAddr::V4(Ipv4Addr::from(base.wrapping_add(1)))
        }
        IpNetwork::V6(n) => {
            let base = u128::from(n.network());
            IpAddr::V6(Ipv6Addr::from(base.wrapping_add(1)))
        }
    }
}

/// Gateway for a CIDR in string form; `None` when the CIDR does not parse.
pub fn derive_gateway_str(cidr: &str) -> Option<String> {
    let net = cidr.parse::<IpNetwork>().ok()?;
    Some(derive_gateway(&net).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_is_network_plus_one() {
        assert_eq!(derive_gateway_str("192.168.32.0/24").unwrap(), "192.168.32.1");
        assert_eq!(derive_gateway_str("10.4.0.0/16").unwrap(), "10.4.0.1");
        assert_eq!(derive_gateway_str("fd00:12::/64").unwrap(), "fd00:12::1");
    }

    #[test]
    fn gateway_of_bad_cidr_is_none() {
        assert!(derive_gateway_str("not-a-cidr").is_none());
        assert!(derive_gateway_str("").is_none());
    }

    #[test]
    fn ipset_join_orders_v4_first() {
        let set = IpSet {
            ipv4: Some("172.16.3.4".parse().unwrap()),
            ipv6: Some("fd00::4".parse().unwrap()),
        };
        assert_eq!(set.join(), "172.16.3.4,fd00::4");
        assert_eq!(IpSet::default().join(), "");
    }

    #[test]
    fn netset_parses_mixed_list() {
        let set = IpNetSet::parse("10.96.0.0/12, fd00:10::/108").unwrap();
        assert_eq!(set.ipv4.unwrap().to_string(), "10.96.0.0/12");
        assert_eq!(set.ipv6.unwrap().to_string(), "fd00:10::/108");
    }
}
