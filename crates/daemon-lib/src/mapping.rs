//! Three-way resource mapping
//!
//! Joins the manager's pool-local view, the cloud-remote view and the
//! store's pod bindings by resource id. The result feeds the period
//! checker's divergence warnings and the operator mapping dump.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{PodResources, ResourceType};
use crate::pool::PoolSnapshot;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodMapping {
    pub name: String,
    pub namespace: String,
    pub local_res_id: String,
    pub remote_res_id: String,
    pub pod_bind_res_id: String,
    pub valid: bool,
}

/// Build the join. An entry is valid either when it is bound to a pod and
/// all three ids agree, or when it is idle and local matches remote. EIPs
/// never join; they have no pool-local side.
pub fn to_res_mapping(snapshot: &PoolSnapshot, pods: &[PodResources]) -> Vec<PodMapping> {
    let mut all: HashMap<String, PodMapping> = HashMap::new();

    for id in &snapshot.local {
        all.entry(id.clone())
            .or_default()
            .local_res_id
            .clone_from(id);
    }

    for id in &snapshot.remote {
        all.entry(id.clone())
            .or_default()
            .remote_res_id
            .clone_from(id);
    }

    for pod in pods {
        for res in &pod.resources {
            if res.kind == ResourceType::Eip {
                continue;
            }
            let entry = all.entry(res.id.clone()).or_default();
            entry.name.clone_from(&pod.pod_info.name);
            entry.namespace.clone_from(&pod.pod_info.namespace);
            entry.pod_bind_res_id.clone_from(&res.id);
            if entry.pod_bind_res_id == entry.local_res_id
                && entry.local_res_id == entry.remote_res_id
            {
                entry.valid = true;
            }
        }
    }

    let mut mapping: Vec<PodMapping> = all
        .into_values()
        .map(|mut entry| {
            if entry.name.is_empty() && entry.local_res_id == entry.remote_res_id {
                entry.valid = true;
            }
            entry
        })
        .collect();

    mapping.sort_by(|a, b| {
        b.name
            .cmp(&a.name)
            .then_with(|| a.remote_res_id.cmp(&b.remote_res_id))
    });
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpSet;
    use crate::models::{EipInfo, PodInfo, PodNetworkType, ResourceItem};

    fn pod_with(name: &str, items: Vec<ResourceItem>) -> PodResources {
        PodResources {
            pod_info: PodInfo {
                namespace: "default".to_string(),
                name: name.to_string(),
                pod_network_type: PodNetworkType::EniMultiIp,
                pod_eni: false,
                eip_info: EipInfo::default(),
                tc_ingress: 0,
                tc_egress: 0,
                network_priority: String::new(),
                ip_stick_time: 0,
                pod_ips: IpSet::default(),
                sandbox_exited: false,
            },
            resources: items,
            net_ns: None,
            container_id: None,
        }
    }

    #[test]
    fn bound_entry_valid_when_all_three_agree() {
        let snapshot = PoolSnapshot {
            local: vec!["eni-1.10.0.0.5".to_string()],
            remote: vec!["eni-1.10.0.0.5".to_string()],
        };
        let pods = vec![pod_with(
            "web-0",
            vec![ResourceItem::new(ResourceType::EniIp, "eni-1.10.0.0.5")],
        )];

        let mapping = to_res_mapping(&snapshot, &pods);
        assert_eq!(mapping.len(), 1);
        assert!(mapping[0].valid);
        assert_eq!(mapping[0].name, "web-0");
    }

    #[test]
    fn bound_entry_invalid_when_remote_is_missing() {
        let snapshot = PoolSnapshot {
            local: vec!["eni-1.10.0.0.5".to_string()],
            remote: vec![],
        };
        let pods = vec![pod_with(
            "web-0",
            vec![ResourceItem::new(ResourceType::EniIp, "eni-1.10.0.0.5")],
        )];

        let mapping = to_res_mapping(&snapshot, &pods);
        assert!(!mapping[0].valid);
    }

    #[test]
    fn idle_entry_valid_when_local_matches_remote() {
        let snapshot = PoolSnapshot {
            local: vec!["eni-1.10.0.0.6".to_string()],
            remote: vec!["eni-1.10.0.0.6".to_string()],
        };
        let mapping = to_res_mapping(&snapshot, &[]);
        assert_eq!(mapping.len(), 1);
        assert!(mapping[0].valid);
        assert!(mapping[0].name.is_empty());
    }

    #[test]
    fn remote_only_entry_is_invalid() {
        let snapshot = PoolSnapshot {
            local: vec![],
            remote: vec!["eni-1.10.0.0.7".to_string()],
        };
        let mapping = to_res_mapping(&snapshot, &[]);
        assert!(!mapping[0].valid);
    }

    #[test]
    fn eips_are_excluded_from_the_join() {
        let snapshot = PoolSnapshot::default();
        let pods = vec![pod_with(
            "web-0",
            vec![
                ResourceItem::new(ResourceType::Eip, "eip-1"),
                ResourceItem::new(ResourceType::EniIp, "eni-1.10.0.0.5"),
            ],
        )];
        let mapping = to_res_mapping(&snapshot, &pods);
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[0].pod_bind_res_id, "eni-1.10.0.0.5");
    }

    #[test]
    fn sorted_by_name_desc_then_remote_asc() {
        let snapshot = PoolSnapshot {
            local: vec![],
            remote: vec!["id-b".to_string(), "id-a".to_string()],
        };
        let pods = vec![
            pod_with("alpha", vec![ResourceItem::new(ResourceType::EniIp, "id-c")]),
            pod_with("zulu", vec![ResourceItem::new(ResourceType::EniIp, "id-d")]),
        ];
        let mapping = to_res_mapping(&snapshot, &pods);
        let order: Vec<(&str, &str)> = mapping
            .iter()
            .map(|m| (m.name.as_str(), m.remote_res_id.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("zulu", ""), ("alpha", ""), ("", "id-a"), ("", "id-b")]
        );
    }
}
