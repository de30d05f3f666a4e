//! Per-request carrier
//!
//! One value travels through a request: the cancellation token, the pod
//! snapshot, the Kubernetes handle, and the list of items tentatively
//! committed so far. The rollback path walks that list.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::ip::IpSet;
use crate::kubernetes::Kubernetes;
use crate::models::{PodInfo, ResourceItem};

pub struct RequestContext {
    cancel: CancellationToken,
    pod: Mutex<PodInfo>,
    pub k8s: Arc<dyn Kubernetes>,
    resources: Mutex<Vec<ResourceItem>>,
}

impl RequestContext {
    pub fn new(cancel: CancellationToken, pod: PodInfo, k8s: Arc<dyn Kubernetes>) -> Self {
        Self {
            cancel,
            pod: Mutex::new(pod),
            k8s,
            resources: Mutex::new(Vec::new()),
        }
    }

    /// The pod snapshot as of now; allocation steps may refine it.
    pub fn pod(&self) -> PodInfo {
        self.pod.lock().expect("context lock poisoned").clone()
    }

    /// Update the snapshot's IPs once an address materializes; the EIP
    /// allocation binds against them.
    pub fn set_pod_ips(&self, ips: IpSet) {
        self.pod.lock().expect("context lock poisoned").pod_ips = ips;
    }

    /// Remember items that would need rolling back on failure.
    pub fn record(&self, items: &[ResourceItem]) {
        let mut resources = self.resources.lock().expect("context lock poisoned");
        resources.extend_from_slice(items);
    }

    pub fn resources(&self) -> Vec<ResourceItem> {
        self.resources.lock().expect("context lock poisoned").clone()
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::MockKubernetes;
    use crate::models::{EipInfo, PodNetworkType, ResourceType};

    fn pod() -> PodInfo {
        PodInfo {
            namespace: "default".to_string(),
            name: "web-0".to_string(),
            pod_network_type: PodNetworkType::VpcIp,
            pod_eni: false,
            eip_info: EipInfo::default(),
            tc_ingress: 0,
            tc_egress: 0,
            network_priority: String::new(),
            ip_stick_time: 0,
            pod_ips: IpSet::default(),
            sandbox_exited: false,
        }
    }

    #[test]
    fn records_accumulate() {
        let ctx = RequestContext::new(
            CancellationToken::new(),
            pod(),
            Arc::new(MockKubernetes::default()),
        );
        assert!(ctx.resources().is_empty());

        ctx.record(&[ResourceItem::new(ResourceType::EniIp, "eni-1.10.0.0.5")]);
        ctx.record(&[ResourceItem::new(ResourceType::Eip, "eip-1")]);
        let items = ctx.resources();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "eni-1.10.0.0.5");
    }

    #[test]
    fn pod_ip_refinement_is_visible() {
        let ctx = RequestContext::new(
            CancellationToken::new(),
            pod(),
            Arc::new(MockKubernetes::default()),
        );
        assert!(ctx.pod().pod_ips.is_empty());

        ctx.set_pod_ips(IpSet::from_v4("10.0.0.5".parse().unwrap()));
        assert_eq!(ctx.pod().pod_ips.join(), "10.0.0.5");
    }

    #[test]
    fn cancellation_is_visible() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new(token.clone(), pod(), Arc::new(MockKubernetes::default()));
        assert!(!ctx.cancelled());
        token.cancel();
        assert!(ctx.cancelled());
    }
}
