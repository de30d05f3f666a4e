//! NetConf assembly from the PodEni custom resource
//!
//! A sibling controller reconciles per-pod allocations into PodEni
//! objects. For CRD-mode pods the coordinator only translates that state
//! into interface configs: multi-IP allocations ride the node's trunk ENI
//! as VLAN members; exclusive allocations carry their own ENI, optionally
//! trunked.

use anyhow::{Context, Result};

use super::{default_for_net_conf, NetworkService};
use crate::ip::derive_gateway_str;
use crate::kubernetes::{AllocationRoute, PodEni, PodEniAllocation};
use crate::models::{IpamType, PodInfo};
use crate::rpc;

impl NetworkService {
    /// Fetch the pod's PodEni when the pod is CRD-managed; `None` when the
    /// pod is not. Absence and emptiness are errors so the caller can
    /// distinguish "not CRD mode" from "CRD not ready".
    pub(crate) async fn request_crd(
        &self,
        pod: &PodInfo,
        wait_ready: bool,
    ) -> Result<Option<PodEni>> {
        if self.ipam_type != IpamType::Crd && !(pod.pod_eni && self.enable_trunk) {
            return Ok(None);
        }

        let pod_eni = if wait_ready {
            self.k8s.wait_pod_eni(pod).await
        } else {
            self.k8s.get_pod_eni(pod).await
        }
        .with_context(|| format!("failed to read pod eni for {}", pod.key()))?;

        if pod_eni.spec.allocations.is_empty() {
            anyhow::bail!("pod eni for {} has no allocation info", pod.key());
        }

        Ok(Some(pod_eni))
    }

    /// Multi-IP CRD branch: every allocation becomes a VLAN member of the
    /// node trunk ENI.
    pub(crate) async fn multi_ip_from_crd(
        &self,
        pod: &PodInfo,
        wait_ready: bool,
    ) -> Result<Option<Vec<rpc::NetConf>>> {
        let Some(pod_eni) = self.request_crd(pod, wait_ready).await? else {
            return Ok(None);
        };

        let trunk = self
            .trunk_eni
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("node has no trunk eni"))?;
        let status = pod_eni.status.clone().unwrap_or_default();
        if trunk.id != status.trunk_eni_id {
            anyhow::bail!(
                "pod eni parent {} does not match node trunk eni {}",
                status.trunk_eni_id,
                trunk.id
            );
        }

        let mut net_confs = Vec::new();
        for alloc in &pod_eni.spec.allocations {
            let (pod_ip, pod_cidr, gateway_ip) = alloc_addresses(alloc)?;

            let info = status
                .eni_infos
                .get(&alloc.eni.id)
                .ok_or_else(|| anyhow::anyhow!("no status entry for eni {}", alloc.eni.id))?;

            net_confs.push(rpc::NetConf {
                basic_info: Some(rpc::BasicInfo {
                    pod_ip: Some(pod_ip),
                    pod_cidr: Some(pod_cidr),
                    gateway_ip: Some(gateway_ip),
                    service_cidr: Some(self.k8s.service_cidr().to_rpc()),
                }),
                eni_info: Some(rpc::EniInfo {
                    // members are reached through the trunk's transport
                    mac: trunk.mac.clone(),
                    trunk: true,
                    vid: info.vid,
                    gateway_ip: Some(trunk.gateway_ip.to_rpc()),
                }),
                pod: Some(super::pod_section(pod)),
                if_name: alloc.interface.clone(),
                extra_routes: parse_extra_routes(&alloc.extra_routes),
                default_route: alloc.default_route,
            });
        }

        Ok(Some(net_confs))
    }

    /// Exclusive-ENI CRD branch: each allocation carries its own ENI;
    /// trunking is optional.
    pub(crate) async fn exclusive_eni_from_crd(
        &self,
        pod: &PodInfo,
        wait_ready: bool,
    ) -> Result<Vec<rpc::NetConf>> {
        let pod_eni = self
            .request_crd(pod, wait_ready)
            .await?
            .ok_or_else(|| anyhow::anyhow!("pod eni required for crd ipam"))?;

        let status = pod_eni.status.clone().unwrap_or_default();
        let trunk = if self.enable_trunk {
            let trunk = self
                .trunk_eni
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("node has no trunk eni"))?;
            if trunk.id != status.trunk_eni_id {
                anyhow::bail!(
                    "pod eni parent {} does not match node trunk eni {}",
                    status.trunk_eni_id,
                    trunk.id
                );
            }
            Some(trunk)
        } else {
            None
        };

        let mut net_confs = Vec::new();
        for alloc in &pod_eni.spec.allocations {
            let (pod_ip, pod_cidr, gateway_ip) = alloc_addresses(alloc)?;

            let eni_info = match trunk {
                Some(trunk) => {
                    let info = status.eni_infos.get(&alloc.eni.id).ok_or_else(|| {
                        anyhow::anyhow!("no status entry for eni {}", alloc.eni.id)
                    })?;
                    rpc::EniInfo {
                        mac: trunk.mac.clone(),
                        trunk: true,
                        vid: info.vid,
                        gateway_ip: Some(trunk.gateway_ip.to_rpc()),
                    }
                }
                None => rpc::EniInfo {
                    mac: alloc.eni.mac.clone(),
                    trunk: false,
                    vid: 0,
                    gateway_ip: None,
                },
            };

            net_confs.push(rpc::NetConf {
                basic_info: Some(rpc::BasicInfo {
                    pod_ip: Some(pod_ip),
                    pod_cidr: Some(pod_cidr),
                    gateway_ip: Some(gateway_ip),
                    service_cidr: Some(self.k8s.service_cidr().to_rpc()),
                }),
                eni_info: Some(eni_info),
                pod: Some(super::pod_section(pod)),
                if_name: alloc.interface.clone(),
                extra_routes: parse_extra_routes(&alloc.extra_routes),
                default_route: alloc.default_route,
            });
        }

        default_for_net_conf(&mut net_confs)?;
        Ok(net_confs)
    }
}

/// Pod IP, CIDR and derived gateway for one allocation. Empty CIDRs and
/// underivable gateways fail the call.
fn alloc_addresses(
    alloc: &PodEniAllocation,
) -> Result<(rpc::IpSet, rpc::IpSet, rpc::IpSet)> {
    let mut pod_ip = rpc::IpSet::default();
    let mut cidr = rpc::IpSet::default();
    let mut gateway = rpc::IpSet::default();

    if !alloc.ipv4.is_empty() {
        pod_ip.ipv4.clone_from(&alloc.ipv4);
        cidr.ipv4.clone_from(&alloc.ipv4_cidr);
        gateway.ipv4 = derive_gateway_str(&alloc.ipv4_cidr).unwrap_or_default();
        if cidr.ipv4.is_empty() || gateway.ipv4.is_empty() {
            anyhow::bail!("empty cidr or gateway for allocation {}", alloc.eni.id);
        }
    }
    if !alloc.ipv6.is_empty() {
        pod_ip.ipv6.clone_from(&alloc.ipv6);
        cidr.ipv6.clone_from(&alloc.ipv6_cidr);
        gateway.ipv6 = derive_gateway_str(&alloc.ipv6_cidr).unwrap_or_default();
        if cidr.ipv6.is_empty() || gateway.ipv6.is_empty() {
            anyhow::bail!("empty cidr or gateway for allocation {}", alloc.eni.id);
        }
    }

    Ok((pod_ip, cidr, gateway))
}

fn parse_extra_routes(routes: &[AllocationRoute]) -> Vec<rpc::Route> {
    routes
        .iter()
        .map(|r| rpc::Route { dst: r.dst.clone() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::{IpNetSet, IpSet};
    use crate::kubernetes::{AllocationEni, MockKubernetes, PodEniInfo, PodEniSpec, PodEniStatus};
    use crate::models::{DaemonMode, EipInfo, Eni, PodNetworkType};
    use crate::storage::DiskStorage;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn trunk_eni() -> Eni {
        Eni {
            id: "eni-trunk".to_string(),
            mac: "aa:bb:cc:dd:ee:ff".to_string(),
            primary_ip: IpSet::from_v4("10.0.0.2".parse().unwrap()),
            gateway_ip: IpSet::from_v4("10.0.0.1".parse().unwrap()),
            vswitch_cidr: IpNetSet::parse("10.0.0.0/24").unwrap(),
            trunk: true,
        }
    }

    fn crd_pod(name: &str) -> crate::models::PodInfo {
        crate::models::PodInfo {
            namespace: "default".to_string(),
            name: name.to_string(),
            pod_network_type: PodNetworkType::EniMultiIp,
            pod_eni: true,
            eip_info: EipInfo::default(),
            tc_ingress: 0,
            tc_egress: 0,
            network_priority: String::new(),
            ip_stick_time: 0,
            pod_ips: IpSet::default(),
            sandbox_exited: false,
        }
    }

    fn pod_eni(trunk_id: &str, allocations: Vec<PodEniAllocation>) -> PodEni {
        let mut eni_infos = HashMap::new();
        for alloc in &allocations {
            eni_infos.insert(alloc.eni.id.clone(), PodEniInfo { vid: 101 });
        }
        let mut res = PodEni::new("web-0", PodEniSpec { allocations });
        res.status = Some(PodEniStatus {
            phase: "Bound".to_string(),
            trunk_eni_id: trunk_id.to_string(),
            eni_infos,
        });
        res
    }

    fn allocation(eni_id: &str, interface: &str) -> PodEniAllocation {
        PodEniAllocation {
            eni: AllocationEni {
                id: eni_id.to_string(),
                mac: "11:22:33:44:55:66".to_string(),
            },
            ipv4: "10.0.1.10".to_string(),
            ipv4_cidr: "10.0.1.0/24".to_string(),
            ipv6: String::new(),
            ipv6_cidr: String::new(),
            interface: interface.to_string(),
            default_route: false,
            extra_routes: vec![AllocationRoute {
                dst: "192.168.0.0/16".to_string(),
            }],
        }
    }

    fn service(k8s: Arc<MockKubernetes>, trunk: Option<Eni>) -> NetworkService {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStorage::open(dir.path().join("db.json")).unwrap());
        NetworkService::builder()
            .daemon_mode(DaemonMode::EniMultiIp)
            .kubernetes(k8s)
            .storage(store)
            .enable_trunk(true)
            .trunk_eni(trunk)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn multi_ip_assembles_vlan_members() {
        let k8s = Arc::new(MockKubernetes::default());
        let pod = crd_pod("web-0");
        k8s.pod_enis.insert(
            pod.key(),
            pod_eni("eni-trunk", vec![allocation("eni-member", "eth1")]),
        );

        let svc = service(k8s, Some(trunk_eni()));
        let confs = svc.multi_ip_from_crd(&pod, false).await.unwrap().unwrap();

        assert_eq!(confs.len(), 1);
        let conf = &confs[0];
        assert_eq!(conf.if_name, "eth1");
        let eni_info = conf.eni_info.as_ref().unwrap();
        assert!(eni_info.trunk);
        assert_eq!(eni_info.vid, 101);
        assert_eq!(eni_info.mac, "aa:bb:cc:dd:ee:ff");
        let basic = conf.basic_info.as_ref().unwrap();
        assert_eq!(basic.gateway_ip.as_ref().unwrap().ipv4, "10.0.1.1");
        assert_eq!(conf.extra_routes[0].dst, "192.168.0.0/16");
    }

    #[tokio::test]
    async fn multi_ip_requires_matching_trunk() {
        let k8s = Arc::new(MockKubernetes::default());
        let pod = crd_pod("web-0");
        k8s.pod_enis.insert(
            pod.key(),
            pod_eni("eni-other", vec![allocation("eni-member", "eth1")]),
        );

        let svc = service(k8s, Some(trunk_eni()));
        assert!(svc.multi_ip_from_crd(&pod, false).await.is_err());
    }

    #[tokio::test]
    async fn multi_ip_requires_status_entry() {
        let k8s = Arc::new(MockKubernetes::default());
        let pod = crd_pod("web-0");
        let mut res = pod_eni("eni-trunk", vec![allocation("eni-member", "eth1")]);
        res.status.as_mut().unwrap().eni_infos.clear();
        k8s.pod_enis.insert(pod.key(), res);

        let svc = service(k8s, Some(trunk_eni()));
        assert!(svc.multi_ip_from_crd(&pod, false).await.is_err());
    }

    #[tokio::test]
    async fn empty_cidr_fails_the_call() {
        let k8s = Arc::new(MockKubernetes::default());
        let pod = crd_pod("web-0");
        let mut alloc = allocation("eni-member", "eth1");
        alloc.ipv4_cidr = String::new();
        k8s.pod_enis
            .insert(pod.key(), pod_eni("eni-trunk", vec![alloc]));

        let svc = service(k8s, Some(trunk_eni()));
        assert!(svc.multi_ip_from_crd(&pod, false).await.is_err());
    }

    #[tokio::test]
    async fn non_crd_pod_yields_none() {
        let k8s = Arc::new(MockKubernetes::default());
        let mut pod = crd_pod("web-0");
        pod.pod_eni = false;

        let svc = service(k8s, Some(trunk_eni()));
        assert!(svc.multi_ip_from_crd(&pod, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_allocations_is_an_error() {
        let k8s = Arc::new(MockKubernetes::default());
        let pod = crd_pod("web-0");
        k8s.pod_enis.insert(pod.key(), pod_eni("eni-trunk", vec![]));

        let svc = service(k8s, Some(trunk_eni()));
        assert!(svc.multi_ip_from_crd(&pod, false).await.is_err());
    }
}
