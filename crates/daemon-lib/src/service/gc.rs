//! Garbage collector loop
//!
//! Every tick reconciles three views under the write lock: the store's
//! records, the live pod set, and each manager's pool. A record whose pod
//! is gone is reclaimed, except that sticky pods get one extra cycle: the
//! first pass only rewrites the record with the grace cleared, the next
//! pass releases for real.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::NetworkService;
use crate::health::components;
use crate::models::{ResourceItem, ResourceType};

pub const GC_PERIOD: Duration = Duration::from_secs(300);

impl NetworkService {
    pub fn spawn_gc_loop(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            info!(period_secs = GC_PERIOD.as_secs(), "starting resource gc loop");
            let mut ticker = tokio::time::interval(GC_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first interval tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match svc.gc_once().await {
                            Ok(()) => svc.health.set_healthy(components::GC).await,
                            Err(err) => {
                                warn!(error = %err, "resource gc failed");
                                svc.health.set_degraded(components::GC, err.to_string()).await;
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        info!("shutting down resource gc loop");
                        break;
                    }
                }
            }
        })
    }

    /// One GC tick, run to completion. All request traffic is frozen for
    /// its duration.
    pub async fn gc_once(&self) -> anyhow::Result<()> {
        let _write = self.lock.write().await;
        let start = Instant::now();
        debug!("resource gc tick");

        let pods = self
            .k8s
            .get_local_pods()
            .await
            .context("failed to list local pods")?;
        let mut live_pods = HashSet::new();
        for pod in &pods {
            if !pod.sandbox_exited {
                live_pods.insert(pod.key());
            }
        }

        let records = self.store.list().context("failed to list resource store")?;
        self.metrics.set_store_records(records.len() as i64);

        let mut in_use: HashMap<ResourceType, HashMap<String, ResourceItem>> = HashMap::new();
        let mut expired: HashMap<ResourceType, HashMap<String, ResourceItem>> = HashMap::new();
        let mut relate_expire_list = Vec::new();

        for record in records {
            let key = record.pod_info.key();
            let mut pod_exists = live_pods.contains(&key);
            if !pod_exists {
                if record.pod_info.ip_stick_time != 0 {
                    // sticky pod, first pass after deletion: clear the grace
                    // and keep the record until the next pass
                    let mut downgraded = record.clone();
                    downgraded.pod_info.ip_stick_time = 0;
                    if let Err(err) = self.store.put(&key, downgraded) {
                        warn!(pod = %key, error = %err, "failed to rewrite sticky record");
                    }
                    pod_exists = true;
                } else {
                    relate_expire_list.push(key.clone());
                }
            }

            for res in &record.resources {
                let in_use_t = in_use.entry(res.kind).or_default();
                let expired_t = expired.entry(res.kind).or_default();
                // an id already claimed live by another pod stays live
                if in_use_t.contains_key(&res.id) {
                    continue;
                }
                if pod_exists {
                    expired_t.remove(&res.id);
                    in_use_t.insert(res.id.clone(), res.clone());
                } else {
                    expired_t.insert(res.id.clone(), res.clone());
                }
            }
        }

        let mut gc_done = true;
        let kinds: BTreeSet<ResourceType> =
            in_use.keys().chain(expired.keys()).copied().collect();
        let empty = HashMap::new();
        for kind in kinds {
            let Some(mgr) = self.manager_for(kind) else {
                continue;
            };
            let in_use_t = in_use.get(&kind).unwrap_or(&empty);
            let expired_t = expired.get(&kind).unwrap_or(&empty);
            debug!(
                kind = %kind,
                in_use = in_use_t.len(),
                expired = expired_t.len(),
                "manager garbage collection"
            );
            if let Err(err) = mgr.garbage_collect(in_use_t, expired_t).await {
                warn!(kind = %kind, error = %err, "manager garbage collection failed");
                gc_done = false;
            }
        }

        // a failing manager defers the post-gc cleanup to the next cycle
        if gc_done {
            if let Some(expired_ips) = expired.get(&ResourceType::EniIp) {
                for id in expired_ips.keys() {
                    let Some(addr) = eni_ip_rule_addr(id) else {
                        debug!(id = %id, "skip route cleanup for unparseable id");
                        continue;
                    };
                    debug!(ip = %addr, "cleaning stale rules and routes");
                    if let Err(err) = self.route_cleanup.delete_rules_by_ip(addr).await {
                        error!(ip = %addr, error = %err, "failed to delete ip rules");
                    }
                    if let Err(err) = self.route_cleanup.delete_route_by_ip(addr).await {
                        error!(ip = %addr, error = %err, "failed to delete route");
                    }
                }
            }

            for key in &relate_expire_list {
                if let Err(err) = self.store.delete(key) {
                    warn!(pod = %key, error = %err, "failed to delete expired record");
                }
            }
        }

        self.metrics.observe_gc(start.elapsed());
        Ok(())
    }
}

/// Address parsed out of an ENI-IP id of the form `"<eni id>.<ip>"`.
/// Malformed ids yield `None` and are skipped.
fn eni_ip_rule_addr(id: &str) -> Option<IpAddr> {
    let (_, ip) = id.split_once('.')?;
    ip.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eni_ip_id_parses_back_to_address() {
        assert_eq!(
            eni_ip_rule_addr("eni-1.192.168.3.7"),
            Some("192.168.3.7".parse().unwrap())
        );
        assert_eq!(
            eni_ip_rule_addr("eni-1.fd00::7"),
            Some("fd00::7".parse().unwrap())
        );
    }

    #[test]
    fn malformed_ids_are_skipped() {
        assert_eq!(eni_ip_rule_addr("eni-without-ip"), None);
        assert_eq!(eni_ip_rule_addr("eni-1.not-an-ip"), None);
        assert_eq!(eni_ip_rule_addr(""), None);
    }
}
