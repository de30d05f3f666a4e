//! Component health tracking
//!
//! Backs the daemon's liveness and readiness probes. Each long-lived part
//! of the daemon (store, managers, background loops, the Kubernetes link)
//! reports into the registry; the HTTP API folds the component states
//! into one answer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Impaired but still serving; a degraded GC retries next period.
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn now(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::now(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::now(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::now(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst component wins: any unhealthy part makes the daemon
    /// unhealthy, any degraded part makes it degraded.
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;
        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }
        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names used across the daemon.
pub mod components {
    pub const STORE: &str = "store";
    pub const MANAGERS: &str = "managers";
    pub const GC: &str = "gc";
    pub const PERIOD_CHECK: &str = "period_check";
    pub const KUBERNETES: &str = "kubernetes";
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component; it starts healthy.
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Readiness flips true once startup wiring is complete.
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("daemon still starting".to_string()),
            };
        }

        let health = self.health().await;
        if health.status == ComponentStatus::Unhealthy {
            return ReadinessResponse {
                ready: false,
                reason: Some("critical component unhealthy".to_string()),
            };
        }

        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn degraded_component_degrades_the_daemon() {
        let registry = HealthRegistry::new();
        registry.register(components::GC).await;
        registry.register(components::STORE).await;

        registry.set_degraded(components::GC, "manager gc failed").await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.status.is_operational());
    }

    #[tokio::test]
    async fn unhealthy_component_wins_over_degraded() {
        let registry = HealthRegistry::new();
        registry.register(components::GC).await;
        registry.register(components::KUBERNETES).await;

        registry.set_degraded(components::GC, "slow").await;
        registry
            .set_unhealthy(components::KUBERNETES, "api unreachable")
            .await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn not_ready_until_startup_completes() {
        let registry = HealthRegistry::new();
        assert!(!registry.readiness().await.ready);

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn ready_but_unhealthy_is_not_ready() {
        let registry = HealthRegistry::new();
        registry.register(components::STORE).await;
        registry.set_ready(true).await;
        registry.set_unhealthy(components::STORE, "disk gone").await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }
}
