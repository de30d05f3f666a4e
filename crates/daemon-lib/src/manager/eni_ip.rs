//! Secondary-IP manager for shared-ENI pods
//!
//! Hands out secondary IPs on the node's worker ENI. Ids carry the parent
//! interface (`"<eni id>.<ip>"`), which the GC's kernel route cleanup
//! parses back apart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cloud::CloudApi;
use crate::config::PoolConfig;
use crate::context::RequestContext;
use crate::error::ResourceError;
use crate::manager::ResourceManager;
use crate::models::{Eni, EniIp, NetworkResource, ResourceItem};
use crate::pool::{MemoryPool, ObjectFactory, PoolSnapshot};

pub struct EniIpFactory {
    cloud: Arc<dyn CloudApi>,
    /// The ENI secondary IPs are assigned on.
    worker_eni: Eni,
}

impl EniIpFactory {
    pub fn new(cloud: Arc<dyn CloudApi>, worker_eni: Eni) -> Self {
        Self { cloud, worker_eni }
    }
}

#[async_trait]
impl ObjectFactory for EniIpFactory {
    async fn create(&self) -> Result<NetworkResource, ResourceError> {
        let ip = self.cloud.assign_private_ip(&self.worker_eni.id).await?;
        Ok(NetworkResource::EniIp(EniIp {
            eni: self.worker_eni.clone(),
            ip,
        }))
    }

    async fn dispose(&self, res: &NetworkResource) -> Result<(), ResourceError> {
        match res {
            NetworkResource::EniIp(eni_ip) => {
                self.cloud
                    .unassign_private_ip(&eni_ip.eni.id, &eni_ip.ip)
                    .await
            }
            other => Err(ResourceError::InvalidState(other.id())),
        }
    }

    async fn list_remote(&self) -> Result<Vec<String>, ResourceError> {
        self.cloud.describe_eni_ips().await
    }
}

pub struct EniIpManager {
    pool: MemoryPool,
    /// The node's trunk ENI when trunking is enabled; CRD-mode allocations
    /// ride its VLAN members.
    trunk_eni: Option<Eni>,
}

impl EniIpManager {
    pub fn new(
        factory: Arc<dyn ObjectFactory>,
        pool_cfg: &PoolConfig,
        trunk_eni: Option<Eni>,
    ) -> Self {
        Self {
            pool: MemoryPool::new(factory, pool_cfg.max_pool_size),
            trunk_eni,
        }
    }

    pub fn seed(&self, resources: impl IntoIterator<Item = NetworkResource>) {
        for res in resources {
            self.pool.seed(res, true);
        }
    }

    pub fn trunk_eni(&self) -> Option<&Eni> {
        self.trunk_eni.as_ref()
    }
}

#[async_trait]
impl ResourceManager for EniIpManager {
    async fn allocate(
        &self,
        _ctx: &RequestContext,
        prior_id: &str,
    ) -> Result<NetworkResource, ResourceError> {
        let res = self.pool.acquire(prior_id).await?;
        match res {
            NetworkResource::EniIp(_) => Ok(res),
            other => Err(ResourceError::Upstream(anyhow::anyhow!(
                "eni-ip pool returned foreign resource {}",
                other.id()
            ))),
        }
    }

    async fn release(
        &self,
        _ctx: &RequestContext,
        item: &ResourceItem,
    ) -> Result<(), ResourceError> {
        self.pool.release(&item.id)
    }

    async fn stat(
        &self,
        _ctx: &RequestContext,
        id: &str,
    ) -> Result<NetworkResource, ResourceError> {
        self.pool.stat(id)
    }

    async fn garbage_collect(
        &self,
        in_use: &HashMap<String, ResourceItem>,
        expired: &HashMap<String, ResourceItem>,
    ) -> Result<(), ResourceError> {
        self.pool.garbage_collect(in_use, expired).await
    }

    async fn resource_mapping(&self) -> Result<PoolSnapshot, ResourceError> {
        self.pool.mapping().await
    }
}
