//! Kubernetes boundary
//!
//! The coordinator sees the cluster through the [`Kubernetes`] trait:
//! pod snapshots, the node-local pod set, the PodEni custom resource, the
//! pod-IP annotation patch and event recording. `KubeClient` backs it with
//! direct API reads; a full informer cache stays outside this crate.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ip::{IpNetSet, IpSet};
use crate::models::{DaemonMode, EipInfo, PodInfo, PodNetworkType};

pub const ANNOTATION_ENI: &str = "podnet.io/eni";
pub const ANNOTATION_POD_ENI: &str = "podnet.io/pod-eni";
pub const ANNOTATION_POD_EIP: &str = "podnet.io/pod-with-eip";
pub const ANNOTATION_NETWORK_PRIORITY: &str = "podnet.io/network-priority";
pub const ANNOTATION_IP_RESERVATION: &str = "podnet.io/ip-reservation-seconds";
pub const ANNOTATION_POD_IPS: &str = "podnet.io/pod-ips";
pub const ANNOTATION_INGRESS_BANDWIDTH: &str = "kubernetes.io/ingress-bandwidth";
pub const ANNOTATION_EGRESS_BANDWIDTH: &str = "kubernetes.io/egress-bandwidth";

/// Sticky grace applied to stateful workloads without an explicit override.
const DEFAULT_STICK_SECS: u64 = 300;

const POD_ENI_PHASE_BOUND: &str = "Bound";
const WAIT_POD_ENI_TIMEOUT: Duration = Duration::from_secs(20);
const WAIT_POD_ENI_INTERVAL: Duration = Duration::from_millis(500);

/// Per-pod allocations reconciled by the PodEni controller. Authoritative
/// for CRD-mode pods.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.podnet.io",
    version = "v1beta1",
    kind = "PodEni",
    namespaced,
    status = "PodEniStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PodEniSpec {
    #[serde(default)]
    pub allocations: Vec<PodEniAllocation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodEniAllocation {
    #[serde(default)]
    pub eni: AllocationEni,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv4_cidr: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub ipv6_cidr: String,
    /// Interface name inside the pod; empty means the default interface.
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub default_route: bool,
    #[serde(default)]
    pub extra_routes: Vec<AllocationRoute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocationEni {
    pub id: String,
    #[serde(default)]
    pub mac: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRoute {
    pub dst: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodEniStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub trunk_eni_id: String,
    /// Per-member interface facts, keyed by ENI id.
    #[serde(default)]
    pub eni_infos: HashMap<String, PodEniInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodEniInfo {
    #[serde(default)]
    pub vid: u32,
}

/// Node-scoped configuration overlay, merged over the file config as an
/// RFC 7396 patch. Named after the node.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "network.podnet.io",
    version = "v1beta1",
    kind = "NodeDynamicConfig"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeDynamicConfigSpec {
    #[serde(default)]
    pub merge_patch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Normal => "Normal",
            EventKind::Warning => "Warning",
        }
    }
}

#[async_trait]
pub trait Kubernetes: Send + Sync {
    /// Snapshot a pod for a request.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo>;

    /// All pods scheduled to this node.
    async fn get_local_pods(&self) -> Result<Vec<PodInfo>>;

    fn service_cidr(&self) -> IpNetSet;

    /// The node's pod CIDR, used by VPC-routed pods.
    fn node_cidr(&self) -> IpNetSet;

    /// Post-commit annotation patch with the pod's effective IPs.
    async fn patch_pod_ips(&self, pod: &PodInfo, ips: &str) -> Result<()>;

    async fn record_node_event(&self, kind: EventKind, reason: &str, message: &str) -> Result<()>;

    async fn record_pod_event(
        &self,
        namespace: &str,
        name: &str,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) -> Result<()>;

    /// Read the pod's PodEni resource as it is right now.
    async fn get_pod_eni(&self, pod: &PodInfo) -> Result<PodEni>;

    /// Wait for the PodEni resource to be bound, bounded by a fixed timeout.
    async fn wait_pod_eni(&self, pod: &PodInfo) -> Result<PodEni>;
}

/// Direct-API [`Kubernetes`] implementation.
pub struct KubeClient {
    client: kube::Client,
    node_name: String,
    daemon_mode: DaemonMode,
    service_cidr: IpNetSet,
    node_cidr: IpNetSet,
    stateful_kinds: Vec<String>,
}

impl KubeClient {
    pub async fn new(
        client: kube::Client,
        node_name: impl Into<String>,
        daemon_mode: DaemonMode,
        service_cidr: IpNetSet,
        custom_stateful_kinds: Vec<String>,
    ) -> Result<Self> {
        let node_name = node_name.into();
        let nodes: Api<Node> = Api::all(client.clone());
        let node = nodes
            .get(&node_name)
            .await
            .with_context(|| format!("failed to read node {}", node_name))?;

        let mut node_cidr = IpNetSet::default();
        if let Some(spec) = node.spec {
            let cidrs: Vec<String> = match spec.pod_cidrs {
                Some(list) if !list.is_empty() => list,
                _ => spec.pod_cidr.into_iter().collect(),
            };
            if !cidrs.is_empty() {
                node_cidr = IpNetSet::parse(&cidrs.join(","))?;
            }
        }

        let mut stateful_kinds = vec!["StatefulSet".to_string()];
        stateful_kinds.extend(custom_stateful_kinds);

        Ok(Self {
            client,
            node_name,
            daemon_mode,
            service_cidr,
            node_cidr,
            stateful_kinds,
        })
    }

    /// Fetch the node's dynamic config overlay, if one exists.
    pub async fn dynamic_config(client: &kube::Client, node_name: &str) -> Result<Option<String>> {
        let api: Api<NodeDynamicConfig> = Api::all(client.clone());
        let cfg = api
            .get_opt(node_name)
            .await
            .context("failed to read dynamic config")?;
        Ok(cfg
            .map(|c| c.spec.merge_patch)
            .filter(|p| !p.trim().is_empty()))
    }

    fn convert_pod(&self, pod: &Pod) -> Result<PodInfo> {
        let meta = &pod.metadata;
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();
        let empty = std::collections::BTreeMap::new();
        let annotations = meta.annotations.as_ref().unwrap_or(&empty);

        let annotation_true =
            |key: &str| annotations.get(key).map(|v| v == "true").unwrap_or(false);

        let pod_network_type = match self.daemon_mode {
            DaemonMode::EniMultiIp => PodNetworkType::EniMultiIp,
            DaemonMode::EniOnly => PodNetworkType::VpcEni,
            DaemonMode::Vpc => {
                if annotation_true(ANNOTATION_ENI) {
                    PodNetworkType::VpcEni
                } else {
                    PodNetworkType::VpcIp
                }
            }
        };

        let is_stateful = meta
            .owner_references
            .as_ref()
            .map(|owners| {
                owners
                    .iter()
                    .any(|o| self.stateful_kinds.iter().any(|k| k == &o.kind))
            })
            .unwrap_or(false);
        let ip_stick_time = annotations
            .get(ANNOTATION_IP_RESERVATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(if is_stateful { DEFAULT_STICK_SECS } else { 0 });

        let mut pod_ips = IpSet::default();
        let status = pod.status.as_ref();
        // the annotation carries both families; the status field only one
        let cached = annotations
            .get(ANNOTATION_POD_IPS)
            .cloned()
            .or_else(|| status.and_then(|s| s.pod_ip.clone()))
            .unwrap_or_default();
        for part in cached.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match part.parse() {
                Ok(std::net::IpAddr::V4(v4)) => pod_ips.ipv4 = Some(v4),
                Ok(std::net::IpAddr::V6(v6)) => pod_ips.ipv6 = Some(v6),
                Err(_) => {}
            }
        }

        let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("");
        let sandbox_exited = matches!(phase, "Succeeded" | "Failed");

        Ok(PodInfo {
            namespace,
            name,
            pod_network_type,
            pod_eni: annotation_true(ANNOTATION_POD_ENI),
            eip_info: EipInfo {
                pod_eip: annotation_true(ANNOTATION_POD_EIP),
            },
            tc_ingress: annotations
                .get(ANNOTATION_INGRESS_BANDWIDTH)
                .and_then(|v| parse_bandwidth(v))
                .unwrap_or(0),
            tc_egress: annotations
                .get(ANNOTATION_EGRESS_BANDWIDTH)
                .and_then(|v| parse_bandwidth(v))
                .unwrap_or(0),
            network_priority: annotations
                .get(ANNOTATION_NETWORK_PRIORITY)
                .cloned()
                .unwrap_or_default(),
            ip_stick_time,
            pod_ips,
            sandbox_exited,
        })
    }

    async fn create_event(
        &self,
        namespace: &str,
        reference: ObjectReference,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let now = Time(Utc::now());
        let name = format!(
            "{}.{:x}",
            reference.name.as_deref().unwrap_or("node"),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let event = Event {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            involved_object: reference,
            type_: Some(kind.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            source: Some(EventSource {
                component: Some("podnetd".to_string()),
                host: Some(self.node_name.clone()),
            }),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &event)
            .await
            .context("failed to create event")?;
        Ok(())
    }
}

#[async_trait]
impl Kubernetes for KubeClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get(name)
            .await
            .with_context(|| format!("failed to read pod {}/{}", namespace, name))?;
        self.convert_pod(&pod)
    }

    async fn get_local_pods(&self) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params =
            ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let pods = api
            .list(&params)
            .await
            .context("failed to list node-local pods")?;
        pods.items.iter().map(|p| self.convert_pod(p)).collect()
    }

    fn service_cidr(&self) -> IpNetSet {
        self.service_cidr
    }

    fn node_cidr(&self) -> IpNetSet {
        self.node_cidr
    }

    async fn patch_pod_ips(&self, pod: &PodInfo, ips: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let patch = serde_json::json!({
            "metadata": { "annotations": { ANNOTATION_POD_IPS: ips } }
        });
        api.patch(&pod.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("failed to patch pod ips for {}", pod.key()))?;
        debug!(pod = %pod.key(), ips = %ips, "patched pod ip annotation");
        Ok(())
    }

    async fn record_node_event(&self, kind: EventKind, reason: &str, message: &str) -> Result<()> {
        let reference = ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(self.node_name.clone()),
            ..Default::default()
        };
        self.create_event("default", reference, kind, reason, message)
            .await
    }

    async fn record_pod_event(
        &self,
        namespace: &str,
        name: &str,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let reference = ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        self.create_event(namespace, reference, kind, reason, message)
            .await
    }

    async fn get_pod_eni(&self, pod: &PodInfo) -> Result<PodEni> {
        let api: Api<PodEni> = Api::namespaced(self.client.clone(), &pod.namespace);
        api.get(&pod.name)
            .await
            .with_context(|| format!("failed to read pod eni for {}", pod.key()))
    }

    async fn wait_pod_eni(&self, pod: &PodInfo) -> Result<PodEni> {
        let api: Api<PodEni> = Api::namespaced(self.client.clone(), &pod.namespace);
        let deadline = tokio::time::Instant::now() + WAIT_POD_ENI_TIMEOUT;

        loop {
            if let Some(pod_eni) = api
                .get_opt(&pod.name)
                .await
                .with_context(|| format!("failed to read pod eni for {}", pod.key()))?
            {
                let bound = pod_eni
                    .status
                    .as_ref()
                    .map(|s| s.phase == POD_ENI_PHASE_BOUND)
                    .unwrap_or(false);
                if bound && !pod_eni.spec.allocations.is_empty() {
                    return Ok(pod_eni);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for pod eni of {}", pod.key());
            }
            tokio::time::sleep(WAIT_POD_ENI_INTERVAL).await;
        }
    }
}

/// Parse a Kubernetes bandwidth quantity into bytes per second.
fn parse_bandwidth(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (digits, suffix) = value.split_at(split);
    let base: u64 = digits.parse().ok()?;
    let multiplier: u64 = match suffix {
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        _ => return None,
    };
    Some(base * multiplier)
}

/// In-process fake used by tests across the crate.
#[derive(Default)]
pub struct MockKubernetes {
    pub pods: dashmap::DashMap<String, PodInfo>,
    pub local_pods: std::sync::Mutex<Vec<PodInfo>>,
    pub pod_enis: dashmap::DashMap<String, PodEni>,
    pub service_cidr: IpNetSet,
    pub node_cidr: IpNetSet,
    pub patched_ips: std::sync::Mutex<Vec<(String, String)>>,
    pub events: std::sync::Mutex<Vec<(String, String, String)>>,
}

impl MockKubernetes {
    pub fn add_pod(&self, pod: PodInfo) {
        self.pods.insert(pod.key(), pod);
    }

    pub fn set_local_pods(&self, pods: Vec<PodInfo>) {
        *self.local_pods.lock().unwrap() = pods;
    }
}

#[async_trait]
impl Kubernetes for MockKubernetes {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodInfo> {
        self.pods
            .get(&crate::models::pod_key(namespace, name))
            .map(|p| p.clone())
            .ok_or_else(|| anyhow::anyhow!("pod {}/{} not found", namespace, name))
    }

    async fn get_local_pods(&self) -> Result<Vec<PodInfo>> {
        Ok(self.local_pods.lock().unwrap().clone())
    }

    fn service_cidr(&self) -> IpNetSet {
        self.service_cidr
    }

    fn node_cidr(&self) -> IpNetSet {
        self.node_cidr
    }

    async fn patch_pod_ips(&self, pod: &PodInfo, ips: &str) -> Result<()> {
        self.patched_ips
            .lock()
            .unwrap()
            .push((pod.key(), ips.to_string()));
        Ok(())
    }

    async fn record_node_event(&self, kind: EventKind, reason: &str, message: &str) -> Result<()> {
        self.events.lock().unwrap().push((
            "node".to_string(),
            format!("{}/{}", kind.as_str(), reason),
            message.to_string(),
        ));
        Ok(())
    }

    async fn record_pod_event(
        &self,
        namespace: &str,
        name: &str,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.events.lock().unwrap().push((
            crate::models::pod_key(namespace, name),
            format!("{}/{}", kind.as_str(), reason),
            message.to_string(),
        ));
        Ok(())
    }

    async fn get_pod_eni(&self, pod: &PodInfo) -> Result<PodEni> {
        self.pod_enis
            .get(&pod.key())
            .map(|e| e.clone())
            .ok_or_else(|| anyhow::anyhow!("pod eni for {} not found", pod.key()))
    }

    async fn wait_pod_eni(&self, pod: &PodInfo) -> Result<PodEni> {
        self.get_pod_eni(pod).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_parses_decimal_and_binary_suffixes() {
        assert_eq!(parse_bandwidth("10M"), Some(10_000_000));
        assert_eq!(parse_bandwidth("1G"), Some(1_000_000_000));
        assert_eq!(parse_bandwidth("512k"), Some(512_000));
        assert_eq!(parse_bandwidth("4Mi"), Some(4 << 20));
        assert_eq!(parse_bandwidth("garbage"), None);
        assert_eq!(parse_bandwidth("100"), None);
    }

    #[test]
    fn event_kind_strings() {
        assert_eq!(EventKind::Normal.as_str(), "Normal");
        assert_eq!(EventKind::Warning.as_str(), "Warning");
    }
}
