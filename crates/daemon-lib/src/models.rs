//! Core data model shared by the coordinator, managers and store

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ip::{IpNetSet, IpSet};

/// The default pod interface. A `NetConf` with an empty name targets it too.
pub const IF_ETH0: &str = "eth0";

/// Key under which a pod's resources are stored: `"<namespace>/<name>"`.
pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Mode the daemon was started in. Decides which managers exist on the node
/// and which pod network types are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonMode {
    #[serde(rename = "VPC")]
    Vpc,
    #[serde(rename = "ENIMultiIP")]
    EniMultiIp,
    #[serde(rename = "ENIOnly")]
    EniOnly,
}

impl FromStr for DaemonMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VPC" => Ok(DaemonMode::Vpc),
            "ENIMultiIP" => Ok(DaemonMode::EniMultiIp),
            "ENIOnly" => Ok(DaemonMode::EniOnly),
            other => Err(anyhow::anyhow!("unsupported daemon mode {}", other)),
        }
    }
}

impl fmt::Display for DaemonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DaemonMode::Vpc => "VPC",
            DaemonMode::EniMultiIp => "ENIMultiIP",
            DaemonMode::EniOnly => "ENIOnly",
        };
        f.write_str(s)
    }
}

/// How a pod wants to be networked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodNetworkType {
    #[serde(rename = "ENIMultiIP")]
    EniMultiIp,
    #[serde(rename = "VPCENI")]
    VpcEni,
    #[serde(rename = "VPCIP")]
    VpcIp,
}

impl fmt::Display for PodNetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodNetworkType::EniMultiIp => "ENIMultiIP",
            PodNetworkType::VpcEni => "VPCENI",
            PodNetworkType::VpcIp => "VPCIP",
        };
        f.write_str(s)
    }
}

/// IPAM flavor: pool-driven by the daemon, or handed over to the PodEni CRD
/// controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpamType {
    #[default]
    Default,
    Crd,
}

/// Which IP families the node serves. Dual stack is downgraded to v4 at
/// startup when the instance type lacks IPv6 support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpFamily {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl IpFamily {
    pub fn v4_only() -> Self {
        Self {
            ipv4: true,
            ipv6: false,
        }
    }

    pub fn dual() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
        }
    }
}

/// Elastic-IP opt-in carried on the pod.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EipInfo {
    pub pod_eip: bool,
}

/// Snapshot of a pod taken from the Kubernetes cache at request time.
///
/// The coordinator never re-reads the pod during a request; everything it
/// needs to decide the allocation plan lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub pod_network_type: PodNetworkType,
    /// Pod opted into CRD-managed allocations (PodEni resource).
    #[serde(default)]
    pub pod_eni: bool,
    #[serde(default)]
    pub eip_info: EipInfo,
    /// Traffic shaping, bytes per second. Zero means unshaped.
    #[serde(default)]
    pub tc_ingress: u64,
    #[serde(default)]
    pub tc_egress: u64,
    #[serde(default)]
    pub network_priority: String,
    /// Seconds the release of this pod's resources is delayed after the pod
    /// is gone. Non-zero for stateful workloads that want their IP back.
    #[serde(default)]
    pub ip_stick_time: u64,
    /// IPs cached from the last allocation, used as the EIP bind target.
    #[serde(default)]
    pub pod_ips: IpSet,
    /// True when the pod sandbox has already exited (terminal phase).
    #[serde(default)]
    pub sandbox_exited: bool,
}

impl PodInfo {
    pub fn key(&self) -> String {
        pod_key(&self.namespace, &self.name)
    }
}

/// Kind tag for everything a manager can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Eni,
    EniIp,
    Veth,
    Eip,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Eni => "eni",
            ResourceType::EniIp => "eniIp",
            ResourceType::Veth => "veth",
            ResourceType::Eip => "eip",
        };
        f.write_str(s)
    }
}

/// One allocated resource as the store sees it. `id` is opaque and unique
/// per type; `extra_config` is manager-private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceItem {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_config: Option<BTreeMap<String, String>>,
}

impl ResourceItem {
    pub fn new(kind: ResourceType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            extra_config: None,
        }
    }
}

/// The persisted record binding a pod to its resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodResources {
    pub pod_info: PodInfo,
    pub resources: Vec<ResourceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_ns: Option<String>,
    /// Sandbox container id of the allocation. A release carrying a
    /// different id belongs to an older sandbox and must not touch this
    /// record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl PodResources {
    /// All stored items of one type. More than one is a defect the
    /// coordinator tolerates but never produces.
    pub fn items_of(&self, kind: ResourceType) -> Vec<&ResourceItem> {
        self.resources.iter().filter(|r| r.kind == kind).collect()
    }

    /// The single prior id of a type, if exactly one is stored.
    pub fn prior_id(&self, kind: ResourceType) -> Option<&str> {
        let items = self.items_of(kind);
        match items.len() {
            1 => Some(items[0].id.as_str()),
            _ => None,
        }
    }
}

/// A concrete elastic network interface as a manager reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eni {
    pub id: String,
    pub mac: String,
    pub primary_ip: IpSet,
    pub gateway_ip: IpSet,
    pub vswitch_cidr: IpNetSet,
    pub trunk: bool,
}

/// A secondary IP on an ENI. Its id is `"<eni id>.<ipv4>"`, which the GC
/// route cleanup relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EniIp {
    pub eni: Eni,
    pub ip: IpSet,
}

impl EniIp {
    pub fn id(&self) -> String {
        match self.ip.ipv4 {
            Some(v4) => format!("{}.{}", self.eni.id, v4),
            None => match self.ip.ipv6 {
                Some(v6) => format!("{}.{}", self.eni.id, v6),
                None => self.eni.id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veth {
    pub host_veth: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip {
    pub id: String,
    pub address: IpSet,
}

/// Uniform wrapper the [`crate::manager::ResourceManager`] operations speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkResource {
    Eni(Eni),
    EniIp(EniIp),
    Veth(Veth),
    Eip(Eip),
}

impl NetworkResource {
    pub fn kind(&self) -> ResourceType {
        match self {
            NetworkResource::Eni(_) => ResourceType::Eni,
            NetworkResource::EniIp(_) => ResourceType::EniIp,
            NetworkResource::Veth(_) => ResourceType::Veth,
            NetworkResource::Eip(_) => ResourceType::Eip,
        }
    }

    pub fn id(&self) -> String {
        match self {
            NetworkResource::Eni(e) => e.id.clone(),
            NetworkResource::EniIp(e) => e.id(),
            NetworkResource::Veth(v) => v.host_veth.clone(),
            NetworkResource::Eip(e) => e.id.clone(),
        }
    }

    /// Store representation of this resource.
    pub fn to_res_items(&self) -> Vec<ResourceItem> {
        vec![ResourceItem::new(self.kind(), self.id())]
    }
}

/// Is this name the default pod interface?
pub fn default_if(name: &str) -> bool {
    name.is_empty() || name == IF_ETH0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_key_format() {
        assert_eq!(pod_key("kube-system", "coredns-abc"), "kube-system/coredns-abc");
    }

    #[test]
    fn eni_ip_id_embeds_eni_and_ip() {
        let eni = Eni {
            id: "eni-1".to_string(),
            mac: "ee:ff:00:11:22:33".to_string(),
            primary_ip: IpSet::default(),
            gateway_ip: IpSet::default(),
            vswitch_cidr: IpNetSet::default(),
            trunk: false,
        };
        let eni_ip = EniIp {
            eni,
            ip: IpSet {
                ipv4: Some("192.168.1.10".parse().unwrap()),
                ipv6: None,
            },
        };
        assert_eq!(eni_ip.id(), "eni-1.192.168.1.10");
    }

    #[test]
    fn prior_id_requires_exactly_one_item() {
        let info = PodInfo {
            namespace: "default".to_string(),
            name: "p".to_string(),
            pod_network_type: PodNetworkType::VpcIp,
            pod_eni: false,
            eip_info: EipInfo::default(),
            tc_ingress: 0,
            tc_egress: 0,
            network_priority: String::new(),
            ip_stick_time: 0,
            pod_ips: IpSet::default(),
            sandbox_exited: false,
        };
        let mut res = PodResources {
            pod_info: info,
            resources: vec![ResourceItem::new(ResourceType::Veth, "veth-a")],
            net_ns: None,
            container_id: None,
        };
        assert_eq!(res.prior_id(ResourceType::Veth), Some("veth-a"));
        assert_eq!(res.prior_id(ResourceType::Eni), None);

        res.resources.push(ResourceItem::new(ResourceType::Veth, "veth-b"));
        assert_eq!(res.prior_id(ResourceType::Veth), None);
    }

    #[test]
    fn default_if_matches_empty_and_eth0() {
        assert!(default_if(""));
        assert!(default_if("eth0"));
        assert!(!default_if("eth1"));
    }
}
