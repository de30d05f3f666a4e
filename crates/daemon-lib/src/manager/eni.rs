//! Exclusive-ENI manager
//!
//! Hands out whole network interfaces, one per pod. The pool holds
//! detached interfaces for reuse; creation picks a vSwitch according to
//! the configured selection policy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cloud::CloudApi;
use crate::config::PoolConfig;
use crate::context::RequestContext;
use crate::error::ResourceError;
use crate::manager::ResourceManager;
use crate::models::{NetworkResource, ResourceItem};
use crate::pool::{MemoryPool, ObjectFactory, PoolSnapshot};

pub struct EniFactory {
    cloud: Arc<dyn CloudApi>,
    vswitches: Vec<String>,
}

impl EniFactory {
    pub fn new(cloud: Arc<dyn CloudApi>, pool_cfg: &PoolConfig) -> Self {
        Self {
            cloud,
            vswitches: pool_cfg.vswitches.clone(),
        }
    }

    fn pick_vswitch(&self) -> Result<&str, ResourceError> {
        if self.vswitches.is_empty() {
            return Err(ResourceError::Upstream(anyhow::anyhow!(
                "no vswitch configured for eni creation"
            )));
        }
        // selection policy is random; a time-derived index avoids carrying
        // an RNG for a once-per-allocation pick
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as usize;
        Ok(&self.vswitches[nanos % self.vswitches.len()])
    }
}

#[async_trait]
impl ObjectFactory for EniFactory {
    async fn create(&self) -> Result<NetworkResource, ResourceError> {
        let vswitch = self.pick_vswitch()?;
        let eni = self.cloud.create_eni(vswitch, false).await?;
        Ok(NetworkResource::Eni(eni))
    }

    async fn dispose(&self, res: &NetworkResource) -> Result<(), ResourceError> {
        self.cloud.delete_eni(&res.id()).await
    }

    async fn list_remote(&self) -> Result<Vec<String>, ResourceError> {
        let enis = self.cloud.describe_enis().await?;
        Ok(enis.into_iter().map(|e| e.id).collect())
    }
}

pub struct EniManager {
    pool: MemoryPool,
}

impl EniManager {
    pub fn new(factory: Arc<dyn ObjectFactory>, pool_cfg: &PoolConfig) -> Self {
        Self {
            pool: MemoryPool::new(factory, pool_cfg.max_eni),
        }
    }

    /// Restore interfaces known from the store at startup.
    pub fn seed(&self, resources: impl IntoIterator<Item = NetworkResource>) {
        for res in resources {
            self.pool.seed(res, true);
        }
    }
}

#[async_trait]
impl ResourceManager for EniManager {
    async fn allocate(
        &self,
        _ctx: &RequestContext,
        prior_id: &str,
    ) -> Result<NetworkResource, ResourceError> {
        let res = self.pool.acquire(prior_id).await?;
        match res {
            NetworkResource::Eni(_) => Ok(res),
            other => Err(ResourceError::Upstream(anyhow::anyhow!(
                "eni pool returned foreign resource {}",
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
