//! End-to-end coordinator tests against mock managers and a mock
//! Kubernetes, with the real store on a temp dir.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use daemon_lib::context::RequestContext;
use daemon_lib::error::{ResourceError, ServiceError};
use daemon_lib::ip::{IpNetSet, IpSet};
use daemon_lib::kubernetes::{Kubernetes, MockKubernetes, PodEni, PodEniSpec};
use daemon_lib::link::NoopCleanup;
use daemon_lib::manager::ResourceManager;
use daemon_lib::models::{
    DaemonMode, EipInfo, Eni, EniIp, Eip, NetworkResource, PodInfo, PodNetworkType, PodResources,
    ResourceItem, ResourceType,
};
use daemon_lib::pool::PoolSnapshot;
use daemon_lib::rpc;
use daemon_lib::service::NetworkService;
use daemon_lib::storage::{DiskStorage, Storage};

/// Scriptable manager that records every interaction.
struct MockManager {
    resource: NetworkResource,
    fail_allocate: bool,
    priors: Mutex<Vec<String>>,
    released: Mutex<Vec<String>>,
    seen_pod_ips: Mutex<IpSet>,
    gc_expired: Mutex<Vec<Vec<String>>>,
}

impl MockManager {
    fn build(resource: NetworkResource, fail_allocate: bool) -> Arc<Self> {
        Arc::new(Self {
            resource,
            fail_allocate,
            priors: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            seen_pod_ips: Mutex::new(IpSet::default()),
            gc_expired: Mutex::new(Vec::new()),
        })
    }

    fn new(resource: NetworkResource) -> Arc<Self> {
        Self::build(resource, false)
    }

    fn failing(resource: NetworkResource) -> Arc<Self> {
        Self::build(resource, true)
    }

    fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    fn expired_per_gc(&self) -> Vec<Vec<String>> {
        self.gc_expired.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ResourceManager for MockManager {
    async fn allocate(
        &self,
        ctx: &RequestContext,
        prior_id: &str,
    ) -> Result<NetworkResource, ResourceError> {
        if self.fail_allocate {
            return Err(ResourceError::Upstream(anyhow::anyhow!(
                "injected allocate failure"
            )));
        }
        self.priors.lock().unwrap().push(prior_id.to_string());
        *self.seen_pod_ips.lock().unwrap() = ctx.pod().pod_ips;
        Ok(self.resource.clone())
    }

    async fn release(
        &self,
        _ctx: &RequestContext,
        item: &ResourceItem,
    ) -> Result<(), ResourceError> {
        self.released.lock().unwrap().push(item.id.clone());
        Ok(())
    }

    async fn stat(
        &self,
        _ctx: &RequestContext,
        id: &str,
    ) -> Result<NetworkResource, ResourceError> {
        if self.resource.id() == id {
            Ok(self.resource.clone())
        } else {
            Err(ResourceError::NotFound(id.to_string()))
        }
    }

    async fn garbage_collect(
        &self,
        _in_use: &std::collections::HashMap<String, ResourceItem>,
        expired: &std::collections::HashMap<String, ResourceItem>,
    ) -> Result<(), ResourceError> {
        let mut ids: Vec<String> = expired.keys().cloned().collect();
        ids.sort();
        self.gc_expired.lock().unwrap().push(ids);
        Ok(())
    }

    async fn resource_mapping(&self) -> Result<PoolSnapshot, ResourceError> {
        Ok(PoolSnapshot {
            local: vec![self.resource.id()],
            remote: vec![self.resource.id()],
        })
    }
}

fn sample_eni() -> Eni {
    Eni {
        id: "eni-1".to_string(),
        mac: "aa:bb:cc:00:11:22".to_string(),
        primary_ip: IpSet::from_v4("10.0.0.2".parse().unwrap()),
        gateway_ip: IpSet::from_v4("10.0.0.1".parse().unwrap()),
        vswitch_cidr: IpNetSet::parse("10.0.0.0/24").unwrap(),
        trunk: false,
    }
}

fn sample_eni_ip() -> EniIp {
    EniIp {
        eni: sample_eni(),
        ip: IpSet::from_v4("10.0.0.5".parse().unwrap()),
    }
}

fn pod_info(namespace: &str, name: &str, network_type: PodNetworkType) -> PodInfo {
    PodInfo {
        namespace: namespace.to_string(),
        name: name.to_string(),
        pod_network_type: network_type,
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

fn alloc_request(namespace: &str, name: &str, container_id: &str) -> rpc::AllocIpRequest {
    rpc::AllocIpRequest {
        k8s_pod_name: name.to_string(),
        k8s_pod_namespace: namespace.to_string(),
        k8s_pod_infra_container_id: container_id.to_string(),
        netns: "/var/run/netns/test".to_string(),
        if_name: "eth0".to_string(),
    }
}

fn release_request(namespace: &str, name: &str, container_id: &str) -> rpc::ReleaseIpRequest {
    rpc::ReleaseIpRequest {
        k8s_pod_name: name.to_string(),
        k8s_pod_namespace: namespace.to_string(),
        k8s_pod_infra_container_id: container_id.to_string(),
        reason: String::new(),
    }
}

struct Harness {
    svc: Arc<NetworkService>,
    k8s: Arc<MockKubernetes>,
    store: Arc<DiskStorage>,
    cleanup: Arc<NoopCleanup>,
    _dir: tempfile::TempDir,
}

fn harness(
    mode: DaemonMode,
    managers: Vec<(ResourceType, Arc<dyn ResourceManager>)>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DiskStorage::open(dir.path().join("resources.json")).unwrap());
    let k8s = Arc::new(MockKubernetes {
        service_cidr: IpNetSet::parse("10.96.0.0/12").unwrap(),
        node_cidr: IpNetSet::parse("172.16.5.0/24").unwrap(),
        ..Default::default()
    });
    let cleanup = Arc::new(NoopCleanup::default());

    let mut builder = NetworkService::builder()
        .daemon_mode(mode)
        .kubernetes(k8s.clone())
        .storage(store.clone())
        .route_cleanup(cleanup.clone());
    for (kind, mgr) in managers {
        builder = builder.manager(kind, mgr);
    }

    Harness {
        svc: Arc::new(builder.build().unwrap()),
        k8s,
        store,
        cleanup,
        _dir: dir,
    }
}

#[tokio::test]
async fn happy_vpc_ip_alloc() {
    let veth = Arc::new(daemon_lib::manager::VethManager::new());
    let h = harness(DaemonMode::Vpc, vec![(ResourceType::Veth, veth)]);
    h.k8s.add_pod(pod_info("default", "web-0", PodNetworkType::VpcIp));

    let reply = h
        .svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    assert!(reply.success);
    assert_eq!(reply.ip_type, rpc::IpType::TypeVpcIp as i32);
    assert!(reply.ipv4);
    assert!(!reply.ipv6);
    assert_eq!(reply.net_confs.len(), 1);

    let conf = &reply.net_confs[0];
    assert!(conf.default_route);
    let basic = conf.basic_info.as_ref().unwrap();
    assert_eq!(basic.pod_cidr.as_ref().unwrap().ipv4, "172.16.5.0/24");
    assert_eq!(basic.service_cidr.as_ref().unwrap().ipv4, "10.96.0.0/12");

    let record = h.store.get("default/web-0").unwrap().unwrap();
    assert_eq!(record.resources.len(), 1);
    assert_eq!(record.resources[0].kind, ResourceType::Veth);
    assert_eq!(record.container_id.as_deref(), Some("cid-a"));
    assert_eq!(record.net_ns.as_deref(), Some("/var/run/netns/test"));
}

#[tokio::test]
async fn eni_ip_and_eip_alloc_persists_both() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let eip = MockManager::new(NetworkResource::Eip(Eip {
        id: "eip-1".to_string(),
        address: IpSet::from_v4("203.0.113.9".parse().unwrap()),
    }));
    let h = harness(
        DaemonMode::EniMultiIp,
        vec![
            (ResourceType::EniIp, eni_ip.clone()),
            (ResourceType::Eip, eip.clone()),
        ],
    );

    let mut pod = pod_info("default", "web-0", PodNetworkType::EniMultiIp);
    pod.eip_info.pod_eip = true;
    h.k8s.add_pod(pod);

    let reply = h
        .svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    assert!(reply.success);
    assert_eq!(reply.ip_type, rpc::IpType::TypeEniMultiIp as i32);
    assert_eq!(reply.net_confs.len(), 1);
    assert_eq!(
        reply.net_confs[0].basic_info.as_ref().unwrap().pod_ip.as_ref().unwrap().ipv4,
        "10.0.0.5"
    );

    let record = h.store.get("default/web-0").unwrap().unwrap();
    let kinds: Vec<ResourceType> = record.resources.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ResourceType::EniIp, ResourceType::Eip]);

    // the eip bind target is the ip that came off the eni-ip allocation
    assert_eq!(eip.seen_pod_ips.lock().unwrap().join(), "10.0.0.5");

    // the default interface ips were pushed back onto the pod
    let patched = h.k8s.patched_ips.lock().unwrap().clone();
    assert_eq!(patched, vec![("default/web-0".to_string(), "10.0.0.5".to_string())]);
}

#[tokio::test]
async fn failed_eip_alloc_rolls_back_the_eni_ip() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let eip = MockManager::failing(NetworkResource::Eip(Eip {
        id: "eip-1".to_string(),
        address: IpSet::default(),
    }));
    let h = harness(
        DaemonMode::EniMultiIp,
        vec![
            (ResourceType::EniIp, eni_ip.clone()),
            (ResourceType::Eip, eip.clone()),
        ],
    );

    let mut pod = pod_info("default", "web-0", PodNetworkType::EniMultiIp);
    pod.eip_info.pod_eip = true;
    h.k8s.add_pod(pod);

    let err = h
        .svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UpstreamUnavailable(_)));

    // rollback completeness: no record survives, the eni-ip was released
    assert!(h.store.get("default/web-0").unwrap().is_none());
    assert_eq!(eni_ip.released(), vec!["eni-1.10.0.0.5".to_string()]);
}

#[tokio::test]
async fn sticky_release_defers_to_gc_for_two_cycles() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let h = harness(DaemonMode::EniMultiIp, vec![(ResourceType::EniIp, eni_ip.clone())]);

    let mut pod = pod_info("default", "db-0", PodNetworkType::EniMultiIp);
    pod.ip_stick_time = 300;
    h.k8s.add_pod(pod.clone());

    h.svc
        .alloc_ip(&alloc_request("default", "db-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    // release succeeds but must not touch the record or the manager
    let reply = h
        .svc
        .release_ip(&release_request("default", "db-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();
    assert!(reply.success);
    assert!(eni_ip.released().is_empty());
    assert!(h.store.get("default/db-0").unwrap().is_some());

    // pod is gone; first gc pass only clears the grace
    h.k8s.set_local_pods(vec![]);
    h.svc.gc_once().await.unwrap();
    let record = h.store.get("default/db-0").unwrap().unwrap();
    assert_eq!(record.pod_info.ip_stick_time, 0);
    assert_eq!(eni_ip.expired_per_gc(), vec![Vec::<String>::new()]);

    // second pass reclaims and prunes
    h.svc.gc_once().await.unwrap();
    assert!(h.store.get("default/db-0").unwrap().is_none());
    assert_eq!(
        eni_ip.expired_per_gc(),
        vec![vec![], vec!["eni-1.10.0.0.5".to_string()]]
    );

    // stale kernel state for the expired ip was cleaned
    let cleaned = h.cleanup.deleted.lock().unwrap().clone();
    assert_eq!(cleaned, vec!["10.0.0.5".parse::<std::net::IpAddr>().unwrap()]);
}

#[tokio::test]
async fn non_sticky_pod_is_reclaimed_in_one_gc_pass() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let h = harness(DaemonMode::EniMultiIp, vec![(ResourceType::EniIp, eni_ip.clone())]);
    h.k8s
        .add_pod(pod_info("default", "web-0", PodNetworkType::EniMultiIp));

    h.svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    h.k8s.set_local_pods(vec![]);
    h.svc.gc_once().await.unwrap();

    assert!(h.store.get("default/web-0").unwrap().is_none());
    assert_eq!(
        eni_ip.expired_per_gc(),
        vec![vec!["eni-1.10.0.0.5".to_string()]]
    );
}

#[tokio::test]
async fn stale_sandbox_release_is_a_no_op() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let h = harness(DaemonMode::EniMultiIp, vec![(ResourceType::EniIp, eni_ip.clone())]);
    h.k8s
        .add_pod(pod_info("default", "web-0", PodNetworkType::EniMultiIp));

    h.svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    let reply = h
        .svc
        .release_ip(&release_request("default", "web-0", "cid-b"), CancellationToken::new())
        .await
        .unwrap();

    assert!(reply.success);
    assert!(eni_ip.released().is_empty());
    assert!(h.store.get("default/web-0").unwrap().is_some());
}

#[tokio::test]
async fn release_after_alloc_clears_the_record() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let h = harness(DaemonMode::EniMultiIp, vec![(ResourceType::EniIp, eni_ip.clone())]);
    h.k8s
        .add_pod(pod_info("default", "web-0", PodNetworkType::EniMultiIp));

    h.svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();
    h.svc
        .release_ip(&release_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    assert!(h.store.get("default/web-0").unwrap().is_none());
    assert_eq!(eni_ip.released(), vec!["eni-1.10.0.0.5".to_string()]);
}

#[tokio::test]
async fn cross_mode_release_succeeds_without_touching_managers() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let h = harness(DaemonMode::Vpc, vec![(ResourceType::EniIp, eni_ip.clone())]);

    // record left behind by a previous daemon mode
    let pod = pod_info("default", "web-0", PodNetworkType::EniMultiIp);
    h.store
        .put(
            "default/web-0",
            PodResources {
                pod_info: pod.clone(),
                resources: vec![ResourceItem::new(ResourceType::EniIp, "eni-1.10.0.0.5")],
                net_ns: None,
                container_id: Some("cid-a".to_string()),
            },
        )
        .unwrap();
    h.k8s.add_pod(pod);

    let reply = h
        .svc
        .release_ip(&release_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    assert!(reply.success);
    assert!(eni_ip.released().is_empty());
    assert!(h.store.get("default/web-0").unwrap().is_some());
}

#[tokio::test]
async fn concurrent_alloc_for_same_pod_is_rejected() {
    /// Kubernetes wrapper that holds get_pod long enough to overlap calls.
    struct SlowK8s(Arc<MockKubernetes>);

    #[async_trait::async_trait]
    impl Kubernetes for SlowK8s {
        async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<PodInfo> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.get_pod(namespace, name).await
        }
        async fn get_local_pods(&self) -> anyhow::Result<Vec<PodInfo>> {
            self.0.get_local_pods().await
        }
        fn service_cidr(&self) -> IpNetSet {
            self.0.service_cidr()
        }
        fn node_cidr(&self) -> IpNetSet {
            self.0.node_cidr()
        }
        async fn patch_pod_ips(&self, pod: &PodInfo, ips: &str) -> anyhow::Result<()> {
            self.0.patch_pod_ips(pod, ips).await
        }
        async fn record_node_event(
            &self,
            kind: daemon_lib::kubernetes::EventKind,
            reason: &str,
            message: &str,
        ) -> anyhow::Result<()> {
            self.0.record_node_event(kind, reason, message).await
        }
        async fn record_pod_event(
            &self,
            namespace: &str,
            name: &str,
            kind: daemon_lib::kubernetes::EventKind,
            reason: &str,
            message: &str,
        ) -> anyhow::Result<()> {
            self.0
                .record_pod_event(namespace, name, kind, reason, message)
                .await
        }
        async fn get_pod_eni(&self, pod: &PodInfo) -> anyhow::Result<PodEni> {
            self.0.get_pod_eni(pod).await
        }
        async fn wait_pod_eni(&self, pod: &PodInfo) -> anyhow::Result<PodEni> {
            self.0.wait_pod_eni(pod).await
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DiskStorage::open(dir.path().join("resources.json")).unwrap());
    let mock = Arc::new(MockKubernetes::default());
    mock.add_pod(pod_info("default", "web-0", PodNetworkType::EniMultiIp));

    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let svc = Arc::new(
        NetworkService::builder()
            .daemon_mode(DaemonMode::EniMultiIp)
            .kubernetes(Arc::new(SlowK8s(mock)))
            .storage(store)
            .manager(ResourceType::EniIp, eni_ip)
            .build()
            .unwrap(),
    );

    let first = {
        let svc = svc.clone();
        tokio::spawn(async move {
            svc.alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ResourceBusy(_)));
    assert!(err.to_string().contains("resource processing"));

    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn info_reports_crd_not_found_for_empty_pod_eni() {
    let mut pod = pod_info("default", "web-0", PodNetworkType::EniMultiIp);
    pod.pod_eni = true;

    let k8s = Arc::new(MockKubernetes::default());
    k8s.add_pod(pod.clone());
    // the CRD exists but carries no allocations yet
    k8s.pod_enis
        .insert(pod.key(), PodEni::new("web-0", PodEniSpec::default()));

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DiskStorage::open(dir.path().join("resources.json")).unwrap());
    // trunking makes the pod CRD-managed
    let svc = NetworkService::builder()
        .daemon_mode(DaemonMode::EniMultiIp)
        .kubernetes(k8s)
        .storage(store)
        .enable_trunk(true)
        .build()
        .unwrap();

    let reply = svc
        .get_ip_info(&rpc::GetInfoRequest {
            k8s_pod_name: "web-0".to_string(),
            k8s_pod_namespace: "default".to_string(),
            k8s_pod_infra_container_id: "cid-a".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(reply.error, rpc::ErrorCode::ErrCrdNotFound as i32);
    assert!(reply.net_confs.is_empty());
}

#[tokio::test]
async fn info_returns_stored_eni_ip_config() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let h = harness(DaemonMode::EniMultiIp, vec![(ResourceType::EniIp, eni_ip)]);
    h.k8s
        .add_pod(pod_info("default", "web-0", PodNetworkType::EniMultiIp));

    h.svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    let reply = h
        .svc
        .get_ip_info(&rpc::GetInfoRequest {
            k8s_pod_name: "web-0".to_string(),
            k8s_pod_namespace: "default".to_string(),
            k8s_pod_infra_container_id: "cid-a".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(reply.error, rpc::ErrorCode::ErrNone as i32);
    assert_eq!(reply.net_confs.len(), 1);
    let basic = reply.net_confs[0].basic_info.as_ref().unwrap();
    assert_eq!(basic.pod_ip.as_ref().unwrap().ipv4, "10.0.0.5");
    assert!(reply.net_confs[0].default_route);
}

#[tokio::test]
async fn alloc_rejects_foreign_network_type() {
    let h = harness(DaemonMode::EniOnly, vec![]);
    h.k8s.add_pod(pod_info("default", "web-0", PodNetworkType::VpcIp));

    let err = h
        .svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Configuration(_)));
}

#[tokio::test]
async fn reallocation_offers_the_prior_id() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let h = harness(DaemonMode::EniMultiIp, vec![(ResourceType::EniIp, eni_ip.clone())]);
    h.k8s
        .add_pod(pod_info("default", "web-0", PodNetworkType::EniMultiIp));

    h.svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();
    h.svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-b"), CancellationToken::new())
        .await
        .unwrap();

    let priors = eni_ip.priors.lock().unwrap().clone();
    assert_eq!(priors, vec!["".to_string(), "eni-1.10.0.0.5".to_string()]);
}

#[tokio::test]
async fn mapping_joins_pool_and_store() {
    let eni_ip = MockManager::new(NetworkResource::EniIp(sample_eni_ip()));
    let h = harness(DaemonMode::EniMultiIp, vec![(ResourceType::EniIp, eni_ip)]);
    h.k8s
        .add_pod(pod_info("default", "web-0", PodNetworkType::EniMultiIp));

    h.svc
        .alloc_ip(&alloc_request("default", "web-0", "cid-a"), CancellationToken::new())
        .await
        .unwrap();

    let mapping = h.svc.resource_mapping().await.unwrap();
    assert_eq!(mapping.len(), 1);
    assert!(mapping[0].valid);
    assert_eq!(mapping[0].name, "web-0");
    assert_eq!(mapping[0].pod_bind_res_id, "eni-1.10.0.0.5");
}
