//! In-memory resource pool backing the ENI-family managers
//!
//! The pool tracks which objects exist on the instance and which are
//! handed out. Creation and disposal go through an [`ObjectFactory`], the
//! cloud-facing half that lives outside this crate's scope; replenish
//! scheduling belongs to the factory owner as well.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::ResourceError;
use crate::models::NetworkResource;

/// Creates and destroys the concrete cloud objects a pool manages.
#[async_trait]
pub trait ObjectFactory: Send + Sync {
    async fn create(&self) -> Result<NetworkResource, ResourceError>;
    async fn dispose(&self, res: &NetworkResource) -> Result<(), ResourceError>;
    /// Ids the cloud currently reports for this object kind.
    async fn list_remote(&self) -> Result<Vec<String>, ResourceError>;
}

struct Entry {
    res: NetworkResource,
    in_use: bool,
}

/// Pool of allocated-but-reusable objects keyed by resource id.
pub struct MemoryPool {
    entries: DashMap<String, Entry>,
    factory: Arc<dyn ObjectFactory>,
    /// Hard cap on objects the pool may hold; zero means unbounded.
    max_total: usize,
}

impl MemoryPool {
    pub fn new(factory: Arc<dyn ObjectFactory>, max_total: usize) -> Self {
        Self {
            entries: DashMap::new(),
            factory,
            max_total,
        }
    }

    /// Register an object restored from the store at startup.
    pub fn seed(&self, res: NetworkResource, in_use: bool) {
        self.entries.insert(res.id(), Entry { res, in_use });
    }

    /// Hand out an object. A non-empty `prior_id` that is still tracked is
    /// returned as-is; otherwise an idle object or a freshly created one.
    pub async fn acquire(&self, prior_id: &str) -> Result<NetworkResource, ResourceError> {
        if !prior_id.is_empty() {
            if let Some(mut entry) = self.entries.get_mut(prior_id) {
                entry.in_use = true;
                debug!(id = %prior_id, "pool re-acquired prior resource");
                return Ok(entry.res.clone());
            }
        }

        for mut entry in self.entries.iter_mut() {
            if !entry.in_use {
                entry.in_use = true;
                return Ok(entry.res.clone());
            }
        }

        if self.max_total > 0 && self.entries.len() >= self.max_total {
            return Err(ResourceError::Upstream(anyhow::anyhow!(
                "pool exhausted, {} objects in use",
                self.entries.len()
            )));
        }

        let res = self.factory.create().await?;
        self.entries.insert(
            res.id(),
            Entry {
                res: res.clone(),
                in_use: true,
            },
        );
        Ok(res)
    }

    /// Return an object to the idle set. Unknown ids are an invalid-state
    /// condition, not a failure of the caller.
    pub fn release(&self, id: &str) -> Result<(), ResourceError> {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.in_use = false;
                Ok(())
            }
            None => Err(ResourceError::InvalidState(id.to_string())),
        }
    }

    pub fn stat(&self, id: &str) -> Result<NetworkResource, ResourceError> {
        self.entries
            .get(id)
            .map(|e| e.res.clone())
            .ok_or_else(|| ResourceError::NotFound(id.to_string()))
    }

    /// Reconcile against the coordinator's view: everything in `in_use`
    /// stays; `expired` objects are disposed and dropped. An id on both
    /// sides counts as in use.
    pub async fn garbage_collect(
        &self,
        in_use: &HashMap<String, crate::models::ResourceItem>,
        expired: &HashMap<String, crate::models::ResourceItem>,
    ) -> Result<(), ResourceError> {
        for id in in_use.keys() {
            if let Some(mut entry) = self.entries.get_mut(id) {
                entry.in_use = true;
            }
        }

        let mut last_err = None;
        for id in expired.keys() {
            if in_use.contains_key(id) {
                continue;
            }
            let res = match self.entries.get(id) {
                Some(entry) => entry.res.clone(),
                None => continue,
            };
            match self.factory.dispose(&res).await {
                Ok(()) => {
                    self.entries.remove(id);
                    debug!(id = %id, "pool disposed expired resource");
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "failed to dispose expired resource");
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Local ids plus the factory's remote view, for the three-way join.
    pub async fn mapping(&self) -> Result<PoolSnapshot, ResourceError> {
        let local: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let remote = self.factory.list_remote().await?;
        Ok(PoolSnapshot { local, remote })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn idle(&self) -> usize {
        self.entries.iter().filter(|e| !e.in_use).count()
    }
}

/// Pool-local and cloud-remote id lists.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub local: Vec<String>,
    pub remote: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceItem, ResourceType, Veth};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        created: AtomicUsize,
        disposed: AtomicUsize,
        fail_dispose: bool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                disposed: AtomicUsize::new(0),
                fail_dispose: false,
            }
        }
    }

    #[async_trait]
    impl ObjectFactory for CountingFactory {
        async fn create(&self) -> Result<NetworkResource, ResourceError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(NetworkResource::Veth(Veth {
                host_veth: format!("veth-{}", n),
            }))
        }

        async fn dispose(&self, _res: &NetworkResource) -> Result<(), ResourceError> {
            if self.fail_dispose {
                return Err(ResourceError::Upstream(anyhow::anyhow!("dispose failed")));
            }
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list_remote(&self) -> Result<Vec<String>, ResourceError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn acquire_returns_prior_resource() {
        let pool = MemoryPool::new(Arc::new(CountingFactory::new()), 0);
        let first = pool.acquire("").await.unwrap();
        pool.release(&first.id()).unwrap();

        let again = pool.acquire(&first.id()).await.unwrap();
        assert_eq!(first.id(), again.id());
    }

    #[tokio::test]
    async fn acquire_prefers_idle_over_create() {
        let factory = Arc::new(CountingFactory::new());
        let pool = MemoryPool::new(factory.clone(), 0);

        let first = pool.acquire("").await.unwrap();
        pool.release(&first.id()).unwrap();
        let second = pool.acquire("").await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_of_unknown_id_is_invalid_state() {
        let pool = MemoryPool::new(Arc::new(CountingFactory::new()), 0);
        let err = pool.release("nope").unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn capped_pool_refuses_to_grow() {
        let pool = MemoryPool::new(Arc::new(CountingFactory::new()), 1);
        pool.acquire("").await.unwrap();
        assert!(pool.acquire("").await.is_err());
    }

    #[tokio::test]
    async fn gc_disposes_expired_and_keeps_in_use() {
        let factory = Arc::new(CountingFactory::new());
        let pool = MemoryPool::new(factory.clone(), 0);
        let live = pool.acquire("").await.unwrap();
        let dead = pool.acquire("").await.unwrap();

        let mut in_use = HashMap::new();
        in_use.insert(live.id(), ResourceItem::new(ResourceType::Veth, live.id()));
        let mut expired = HashMap::new();
        expired.insert(dead.id(), ResourceItem::new(ResourceType::Veth, dead.id()));

        pool.garbage_collect(&in_use, &expired).await.unwrap();

        assert!(pool.stat(&live.id()).is_ok());
        assert!(pool.stat(&dead.id()).is_err());
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gc_liveness_wins_when_listed_on_both_sides() {
        let factory = Arc::new(CountingFactory::new());
        let pool = MemoryPool::new(factory.clone(), 0);
        let res = pool.acquire("").await.unwrap();

        let mut both = HashMap::new();
        both.insert(res.id(), ResourceItem::new(ResourceType::Veth, res.id()));

        pool.garbage_collect(&both, &both.clone()).await.unwrap();
        assert!(pool.stat(&res.id()).is_ok());
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 0);
    }
}
