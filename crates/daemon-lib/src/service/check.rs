//! Period checker loop
//!
//! On a jittered interval the checker compares the pools against cloud
//! reality through the three-way mapping, warns about divergence, and
//! re-runs CNI CHECK against every pod attachment the store knows about.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::NetworkService;
use crate::health::components;
use crate::kubernetes::EventKind;

pub const POOL_CHECK_PERIOD: Duration = Duration::from_secs(600);
pub const POOL_CHECK_PERIOD_ENV: &str = "POOL_CHECK_PERIOD_SECONDS";

impl NetworkService {
    pub fn spawn_period_check_loop(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let svc = Arc::clone(self);
        let period = period_from_env();
        tokio::spawn(async move {
            info!(period_secs = period.as_secs(), "starting period check loop");
            loop {
                svc.check_once().await;
                svc.health.set_healthy(components::PERIOD_CHECK).await;

                // jitter spreads the herd when many nodes restart together
                let delay = period + Duration::from_millis(jitter_ms(period.as_millis() as u64));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => {
                        info!("shutting down period check loop");
                        break;
                    }
                }
            }
        })
    }

    /// One checker pass. Failures log and wait for the next period.
    pub async fn check_once(&self) {
        debug!("comparing pools with cloud state");
        match self.resource_mapping().await {
            Ok(mapping) => {
                let invalid = mapping.iter().filter(|m| !m.valid).count();
                self.metrics.set_invalid_resources(invalid as i64);

                for entry in mapping.iter().filter(|m| !m.valid) {
                    if entry.name.is_empty() || entry.namespace.is_empty() {
                        warn!(
                            local = %entry.local_res_id,
                            remote = %entry.remote_res_id,
                            "found invalid resource"
                        );
                        continue;
                    }
                    if let Err(err) = self
                        .k8s
                        .record_pod_event(
                            &entry.namespace,
                            &entry.name,
                            EventKind::Warning,
                            "ResourceInvalid",
                            &format!("resource {}", entry.local_res_id),
                        )
                        .await
                    {
                        warn!(pod = %entry.name, error = %err, "failed to record invalid-resource event");
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to build resource mapping"),
        }

        debug!("running cni check over stored attachments");
        let records = {
            let _read = self.lock.read().await;
            match self.store.list() {
                Ok(records) => records,
                Err(err) => {
                    warn!(error = %err, "failed to list store for cni check");
                    return;
                }
            }
        };

        for record in records {
            let Some(net_ns) = &record.net_ns else {
                continue;
            };
            let pod = &record.pod_info;
            debug!(pod = %pod.key(), "cni check");
            if let Err(err) = self
                .cni
                .check(net_ns, &pod.namespace, &pod.name, record.container_id.as_deref())
                .await
            {
                warn!(pod = %pod.key(), error = %err, "cni check failed");
            }
        }

        self.metrics.inc_check_runs();
    }
}

fn period_from_env() -> Duration {
    std::env::var(POOL_CHECK_PERIOD_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(POOL_CHECK_PERIOD)
}

/// Jitter in `[0, max_ms)`, derived from the clock; good enough for
/// spreading periodic work.
fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    now % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..32 {
            assert!(jitter_ms(1000) < 1000);
        }
        assert_eq!(jitter_ms(0), 0);
    }

    #[test]
    fn period_override_comes_from_env() {
        std::env::remove_var(POOL_CHECK_PERIOD_ENV);
        assert_eq!(period_from_env(), POOL_CHECK_PERIOD);

        std::env::set_var(POOL_CHECK_PERIOD_ENV, "30");
        assert_eq!(period_from_env(), Duration::from_secs(30));

        std::env::set_var(POOL_CHECK_PERIOD_ENV, "not-a-number");
        assert_eq!(period_from_env(), POOL_CHECK_PERIOD);

        std::env::remove_var(POOL_CHECK_PERIOD_ENV);
    }
}
