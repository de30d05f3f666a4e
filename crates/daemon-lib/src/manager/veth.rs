//! Veth manager for VPC-routed pods
//!
//! No cloud object backs a veth; the manager only reserves a stable host
//! interface name per pod. The name is derived from the pod key so a
//! re-allocation for the same pod converges on the same pair.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::context::RequestContext;
use crate::error::ResourceError;
use crate::manager::ResourceManager;
use crate::models::{NetworkResource, ResourceItem, Veth};
use crate::pool::PoolSnapshot;

const VETH_PREFIX: &str = "pn";

pub struct VethManager {
    registry: DashMap<String, Veth>,
}

impl VethManager {
    pub fn new() -> Self {
        Self {
            registry: DashMap::new(),
        }
    }

    /// Re-register a veth restored from the store at startup.
    pub fn seed(&self, id: &str) {
        self.registry.insert(
            id.to_string(),
            Veth {
                host_veth: id.to_string(),
            },
        );
    }

    fn name_for(pod_key: &str) -> String {
        let mut hasher = DefaultHasher::new();
        pod_key.hash(&mut hasher);
        // kernel interface names are capped at 15 chars
        format!("{}{:012x}", VETH_PREFIX, hasher.finish() & 0xffff_ffff_ffff)
    }
}

impl Default for VethManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceManager for VethManager {
    async fn allocate(
        &self,
        ctx: &RequestContext,
        prior_id: &str,
    ) -> Result<NetworkResource, ResourceError> {
        let name = if prior_id.is_empty() {
            Self::name_for(&ctx.pod().key())
        } else {
            prior_id.to_string()
        };
        let veth = Veth {
            host_veth: name.clone(),
        };
        self.registry.insert(name.clone(), veth.clone());
        debug!(pod = %ctx.pod().key(), veth = %name, "veth allocated");
        Ok(NetworkResource::Veth(veth))
    }

    async fn release(
        &self,
        _ctx: &RequestContext,
        item: &ResourceItem,
    ) -> Result<(), ResourceError> {
        match self.registry.remove(&item.id) {
            Some(_) => Ok(()),
            None => Err(ResourceError::InvalidState(item.id.clone())),
        }
    }

    async fn stat(
        &self,
        _ctx: &RequestContext,
        id: &str,
    ) -> Result<NetworkResource, ResourceError> {
        self.registry
            .get(id)
            .map(|v| NetworkResource::Veth(v.clone()))
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))
    }

    async fn garbage_collect(
        &self,
        _in_use: &HashMap<String, ResourceItem>,
        expired: &HashMap<String, ResourceItem>,
    ) -> Result<(), ResourceError> {
        for id in expired.keys() {
            self.registry.remove(id);
        }
        Ok(())
    }

    async fn resource_mapping(&self) -> Result<PoolSnapshot, ResourceError> {
        let local: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        // no cloud side exists for veths
        Ok(PoolSnapshot {
            remote: local.clone(),
            local,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpSet;
    use crate::kubernetes::MockKubernetes;
    use crate::models::{EipInfo, PodInfo, PodNetworkType, ResourceType};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(name: &str) -> RequestContext {
        RequestContext::new(
            CancellationToken::new(),
            PodInfo {
                namespace: "default".to_string(),
                name: name.to_string(),
                pod_network_type: PodNetworkType::VpcIp,
                pod_eni: false,
                eip_info: EipInfo::default(),
                tc_ingress: 0,
                tc_egress: 0,
                network_priority: String::new(),
                ip_stick_time: 0,
                pod_ips: IpSet::default(),
                sandbox_exited: false,
            },
            Arc::new(MockKubernetes::default()),
        )
    }

    #[tokio::test]
    async fn same_pod_gets_same_name() {
        let mgr = VethManager::new();
        let a = mgr.allocate(&ctx("web-0"), "").await.unwrap();
        let b = mgr.allocate(&ctx("web-0"), "").await.unwrap();
        let c = mgr.allocate(&ctx("web-1"), "").await.unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert!(a.id().len() <= 15);
    }

    #[tokio::test]
    async fn prior_id_is_honored() {
        let mgr = VethManager::new();
        let res = mgr.allocate(&ctx("web-0"), "pnfeedface0000").await.unwrap();
        assert_eq!(res.id(), "pnfeedface0000");
    }

    #[tokio::test]
    async fn double_release_is_invalid_state() {
        let mgr = VethManager::new();
        let res = mgr.allocate(&ctx("web-0"), "").await.unwrap();
        let item = ResourceItem::new(ResourceType::Veth, res.id());

        mgr.release(&ctx("web-0"), &item).await.unwrap();
        let err = mgr.release(&ctx("web-0"), &item).await.unwrap_err();
        assert!(err.is_invalid_state());
    }
}
