//! Elastic public IP manager
//!
//! EIPs are not pooled: each allocation goes straight to the cloud and is
//! bound to the pod IPs carried in the request context. The registry only
//! exists so stat and GC can see what this node holds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::cloud::CloudApi;
use crate::context::RequestContext;
use crate::error::ResourceError;
use crate::manager::ResourceManager;
use crate::models::{Eip, NetworkResource, ResourceItem};
use crate::pool::PoolSnapshot;

pub struct EipManager {
    cloud: Arc<dyn CloudApi>,
    allow_rob: bool,
    registry: DashMap<String, Eip>,
}

impl EipManager {
    pub fn new(cloud: Arc<dyn CloudApi>, allow_rob: bool) -> Self {
        Self {
            cloud,
            allow_rob,
            registry: DashMap::new(),
        }
    }

    pub fn seed(&self, id: &str) {
        self.registry.insert(
            id.to_string(),
            Eip {
                id: id.to_string(),
                address: Default::default(),
            },
        );
    }

    async fn unbind_and_release(&self, eip: &Eip) -> Result<(), ResourceError> {
        if let Err(err) = self.cloud.unassociate_eip(&eip.id).await {
            // an EIP that is already unbound still has to be released
            warn!(eip = %eip.id, error = %err, "failed to unassociate eip before release");
        }
        self.cloud.release_eip(&eip.id).await
    }
}

#[async_trait]
impl ResourceManager for EipManager {
    async fn allocate(
        &self,
        ctx: &RequestContext,
        prior_id: &str,
    ) -> Result<NetworkResource, ResourceError> {
        if !prior_id.is_empty() {
            if let Some(existing) = self.registry.get(prior_id) {
                return Ok(NetworkResource::Eip(existing.clone()));
            }
        }

        let pod = ctx.pod();
        if pod.pod_ips.is_empty() {
            return Err(ResourceError::Upstream(anyhow::anyhow!(
                "pod {} has no ip to bind an eip to",
                pod.key()
            )));
        }

        let eip = self.cloud.allocate_eip(self.allow_rob).await?;
        if let Err(err) = self.cloud.associate_eip(&eip.id, &pod.pod_ips).await {
            // binding failed; give the address back before surfacing
            if let Err(release_err) = self.cloud.release_eip(&eip.id).await {
                warn!(eip = %eip.id, error = %release_err, "failed to release eip after bind failure");
            }
            return Err(err);
        }

        self.registry.insert(eip.id.clone(), eip.clone());
        Ok(NetworkResource::Eip(eip))
    }

    async fn release(
        &self,
        _ctx: &RequestContext,
        item: &ResourceItem,
    ) -> Result<(), ResourceError> {
        match self.registry.remove(&item.id) {
            Some((_, eip)) => self.unbind_and_release(&eip).await,
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
            .map(|e| NetworkResource::Eip(e.clone()))
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))
    }

    async fn garbage_collect(
        &self,
        in_use: &HashMap<String, ResourceItem>,
        expired: &HashMap<String, ResourceItem>,
    ) -> Result<(), ResourceError> {
        let mut last_err = None;
        for id in expired.keys() {
            if in_use.contains_key(id) {
                continue;
            }
            if let Some((_, eip)) = self.registry.remove(id) {
                if let Err(err) = self.unbind_and_release(&eip).await {
                    warn!(eip = %id, error = %err, "failed to reclaim expired eip");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn resource_mapping(&self) -> Result<PoolSnapshot, ResourceError> {
        let local: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        Ok(PoolSnapshot {
            remote: local.clone(),
            local,
        })
    }
}
