//! Pluggable resource managers
//!
//! Every resource kind sits behind the same five operations; the
//! coordinator dispatches on [`crate::models::ResourceType`] and never
//! branches on cloud specifics. Managers own their thread safety; the
//! coordinator only guarantees that `garbage_collect` never runs
//! concurrently with request-driven calls.

mod eip;
mod eni;
mod eni_ip;
mod veth;

pub use eip::EipManager;
pub use eni::{EniFactory, EniManager};
pub use eni_ip::{EniIpFactory, EniIpManager};
pub use veth::VethManager;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::ResourceError;
use crate::models::{NetworkResource, ResourceItem};
use crate::pool::PoolSnapshot;

#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Allocate a resource for the request's pod. A non-empty `prior_id`
    /// names a previously held resource which must be returned when still
    /// valid; otherwise a fresh one is handed out.
    async fn allocate(
        &self,
        ctx: &RequestContext,
        prior_id: &str,
    ) -> Result<NetworkResource, ResourceError>;

    /// Idempotent. `InvalidState` means the resource is already gone and is
    /// not fatal to the caller.
    async fn release(&self, ctx: &RequestContext, item: &ResourceItem)
        -> Result<(), ResourceError>;

    /// Read-only lookup by id.
    async fn stat(&self, ctx: &RequestContext, id: &str) -> Result<NetworkResource, ResourceError>;

    /// Reconcile the manager's own pool: `in_use` must remain, `expired`
    /// may be reclaimed.
    async fn garbage_collect(
        &self,
        in_use: &HashMap<String, ResourceItem>,
        expired: &HashMap<String, ResourceItem>,
    ) -> Result<(), ResourceError>;

    /// Pool-local and cloud-remote id lists for the three-way join.
    async fn resource_mapping(&self) -> Result<PoolSnapshot, ResourceError>;
}
