//! Request coordinator
//!
//! Serializes per-pod allocate/release/info calls, dispatches over the
//! resource managers, persists the pod-to-resource bindings and unwinds
//! half-done allocations on failure. One process-wide RW lock gates
//! request handlers (read side) against the GC tick (write side); a
//! pending-pod set rejects concurrent calls for the same pod outright.

pub mod check;
pub mod crd;
pub mod gc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cni::CniInvoker;
use crate::context::RequestContext;
use crate::error::ServiceError;
use crate::health::HealthRegistry;
use crate::kubernetes::{EventKind, Kubernetes};
use crate::link::{NoopCleanup, RouteCleanup};
use crate::manager::ResourceManager;
use crate::mapping::{to_res_mapping, PodMapping};
use crate::models::{
    default_if, pod_key, DaemonMode, Eni, EniIp, IpFamily, IpamType, NetworkResource, PodInfo,
    PodNetworkType, PodResources, ResourceType,
};
use crate::observability::DaemonMetrics;
use crate::rpc;
use crate::storage::Storage;

pub struct NetworkService {
    daemon_mode: DaemonMode,
    config_file_path: String,
    k8s: Arc<dyn Kubernetes>,
    store: Arc<dyn Storage>,
    mgr_for_resource: HashMap<ResourceType, Arc<dyn ResourceManager>>,
    pending_pods: DashMap<String, ()>,
    lock: RwLock<()>,
    ip_family: IpFamily,
    ipam_type: IpamType,
    enable_trunk: bool,
    trunk_eni: Option<Eni>,
    route_cleanup: Arc<dyn RouteCleanup>,
    cni: CniInvoker,
    health: HealthRegistry,
    metrics: DaemonMetrics,
}

/// Removes the pod from the pending set when the request ends, whichever
/// way it ends.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

impl NetworkService {
    pub fn builder() -> NetworkServiceBuilder {
        NetworkServiceBuilder::new()
    }

    pub fn daemon_mode(&self) -> DaemonMode {
        self.daemon_mode
    }

    pub fn ip_family(&self) -> IpFamily {
        self.ip_family
    }

    pub fn metrics(&self) -> &DaemonMetrics {
        &self.metrics
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    fn manager_for(&self, kind: ResourceType) -> Option<&Arc<dyn ResourceManager>> {
        self.mgr_for_resource.get(&kind)
    }

    fn register_pending(&self, key: &str) -> Result<PendingGuard<'_>, ServiceError> {
        match self.pending_pods.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ServiceError::ResourceBusy(key.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                self.metrics.set_pending_pods(self.pending_pods.len() as i64);
                Ok(PendingGuard {
                    pending: &self.pending_pods,
                    key: key.to_string(),
                })
            }
        }
    }

    pub(crate) fn verify_pod_network_type(&self, network_type: PodNetworkType) -> bool {
        matches!(
            (self.daemon_mode, network_type),
            (DaemonMode::Vpc, PodNetworkType::VpcEni)
                | (DaemonMode::Vpc, PodNetworkType::VpcIp)
                | (DaemonMode::EniMultiIp, PodNetworkType::EniMultiIp)
                | (DaemonMode::EniOnly, PodNetworkType::VpcEni)
        )
    }

    /// Handle one AllocIP call end to end.
    pub async fn alloc_ip(
        &self,
        req: &rpc::AllocIpRequest,
        cancel: CancellationToken,
    ) -> Result<rpc::AllocIpReply, ServiceError> {
        let key = pod_key(&req.k8s_pod_namespace, &req.k8s_pod_name);
        info!(
            pod = %key,
            container_id = %req.k8s_pod_infra_container_id,
            netns = %req.netns,
            if_name = %req.if_name,
            "alloc ip request"
        );

        let _pending = self.register_pending(&key)?;
        let _read = self.lock.read().await;

        let pod = self
            .k8s
            .get_pod(&req.k8s_pod_namespace, &req.k8s_pod_name)
            .await
            .map_err(ServiceError::UpstreamUnavailable)?;

        if !self.verify_pod_network_type(pod.pod_network_type) {
            return Err(ServiceError::Configuration(format!(
                "unexpected pod network type {} for daemon mode {}, maybe daemon mode changed",
                pod.pod_network_type, self.daemon_mode
            )));
        }

        let ctx = RequestContext::new(cancel, pod.clone(), Arc::clone(&self.k8s));
        let old_res = self.store.get(&key).map_err(ServiceError::Internal)?;

        match self.build_alloc_reply(&ctx, req, &key, &old_res).await {
            Ok(reply) => {
                self.patch_default_pod_ips(&pod, &reply.net_confs).await;
                info!(pod = %key, confs = reply.net_confs.len(), "alloc ip done");
                Ok(reply)
            }
            Err(err) => {
                error!(pod = %key, error = %err, "alloc ip failed, rolling back");
                self.rollback(&ctx, &key).await;
                Err(err)
            }
        }
    }

    async fn build_alloc_reply(
        &self,
        ctx: &RequestContext,
        req: &rpc::AllocIpRequest,
        key: &str,
        old_res: &Option<PodResources>,
    ) -> Result<rpc::AllocIpReply, ServiceError> {
        let pod = ctx.pod();
        let mut reply = rpc::AllocIpReply {
            success: true,
            ipv4: self.ip_family.ipv4,
            ipv6: self.ip_family.ipv6,
            enable_trunking: self.enable_trunk,
            ..Default::default()
        };
        let mut net_confs: Vec<rpc::NetConf> = Vec::new();

        match pod.pod_network_type {
            PodNetworkType::EniMultiIp => {
                reply.ip_type = rpc::IpType::TypeEniMultiIp as i32;

                if let Some(confs) = self
                    .multi_ip_from_crd(&pod, true)
                    .await
                    .map_err(|e| ServiceError::CrdNotReady(e.to_string()))?
                {
                    net_confs.extend(confs);
                }

                let default_if_set = net_confs.iter().any(|c| default_if(&c.if_name));
                if !default_if_set {
                    let res = self
                        .allocate_by_type(ctx, ResourceType::EniIp, old_res)
                        .await?;
                    let NetworkResource::EniIp(eni_ip) = &res else {
                        return Err(ServiceError::Internal(anyhow::anyhow!(
                            "eni-ip manager returned foreign resource"
                        )));
                    };

                    let mut new_res = PodResources {
                        pod_info: pod.clone(),
                        resources: res.to_res_items(),
                        net_ns: Some(req.netns.clone()),
                        container_id: Some(req.k8s_pod_infra_container_id.clone()),
                    };
                    ctx.record(&new_res.resources);

                    if pod.eip_info.pod_eip && self.manager_for(ResourceType::Eip).is_some() {
                        ctx.set_pod_ips(eni_ip.ip);
                        let eip = self.allocate_by_type(ctx, ResourceType::Eip, old_res).await?;
                        let items = eip.to_res_items();
                        ctx.record(&items);
                        new_res.resources.extend(items);
                    }

                    self.store
                        .put(key, new_res)
                        .map_err(ServiceError::Internal)?;

                    net_confs.push(self.eni_ip_net_conf(&pod, eni_ip, true));
                }

                default_for_net_conf(&mut net_confs).map_err(ServiceError::Internal)?;
            }
            PodNetworkType::VpcEni => {
                reply.ip_type = rpc::IpType::TypeVpcEni as i32;

                if self.ipam_type == IpamType::Crd {
                    let confs = self
                        .exclusive_eni_from_crd(&pod, true)
                        .await
                        .map_err(|e| ServiceError::CrdNotReady(e.to_string()))?;
                    net_confs.extend(confs);
                } else {
                    let res = self.allocate_by_type(ctx, ResourceType::Eni, old_res).await?;
                    let NetworkResource::Eni(eni) = &res else {
                        return Err(ServiceError::Internal(anyhow::anyhow!(
                            "eni manager returned foreign resource"
                        )));
                    };

                    let mut new_res = PodResources {
                        pod_info: pod.clone(),
                        resources: res.to_res_items(),
                        net_ns: Some(req.netns.clone()),
                        container_id: Some(req.k8s_pod_infra_container_id.clone()),
                    };
                    ctx.record(&new_res.resources);

                    if pod.eip_info.pod_eip && self.manager_for(ResourceType::Eip).is_some() {
                        ctx.set_pod_ips(eni.primary_ip);
                        let eip = self.allocate_by_type(ctx, ResourceType::Eip, old_res).await?;
                        let items = eip.to_res_items();
                        ctx.record(&items);
                        new_res.resources.extend(items);
                    }

                    self.store
                        .put(key, new_res)
                        .map_err(ServiceError::Internal)?;

                    net_confs.push(self.eni_net_conf(&pod, eni, false, true));
                }
            }
            PodNetworkType::VpcIp => {
                reply.ip_type = rpc::IpType::TypeVpcIp as i32;

                let res = self.allocate_by_type(ctx, ResourceType::Veth, old_res).await?;
                let new_res = PodResources {
                    pod_info: pod.clone(),
                    resources: res.to_res_items(),
                    net_ns: Some(req.netns.clone()),
                    container_id: Some(req.k8s_pod_infra_container_id.clone()),
                };
                ctx.record(&new_res.resources);
                self.store
                    .put(key, new_res)
                    .map_err(ServiceError::Internal)?;

                net_confs.push(rpc::NetConf {
                    basic_info: Some(rpc::BasicInfo {
                        pod_ip: None,
                        pod_cidr: Some(self.k8s.node_cidr().to_rpc()),
                        gateway_ip: None,
                        service_cidr: Some(self.k8s.service_cidr().to_rpc()),
                    }),
                    eni_info: None,
                    pod: Some(pod_section(&pod)),
                    if_name: String::new(),
                    extra_routes: Vec::new(),
                    default_route: true,
                });
            }
        }

        if ctx.cancelled() {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "request cancelled by caller"
            )));
        }

        reply.net_confs = net_confs;
        Ok(reply)
    }

    /// Allocate one resource of a kind, re-offering the previously stored id
    /// when exactly one exists.
    async fn allocate_by_type(
        &self,
        ctx: &RequestContext,
        kind: ResourceType,
        old_res: &Option<PodResources>,
    ) -> Result<NetworkResource, ServiceError> {
        let pod_key = ctx.pod().key();
        let prior = old_res
            .as_ref()
            .and_then(|old| {
                let items = old.items_of(kind);
                match items.len() {
                    0 => {
                        debug!(pod = %pod_key, kind = %kind, "no prior resource");
                        None
                    }
                    1 => Some(items[0].id.clone()),
                    n => {
                        warn!(pod = %pod_key, kind = %kind, count = n, "more than one prior resource");
                        None
                    }
                }
            })
            .unwrap_or_default();

        let mgr = self.manager_for(kind).ok_or_else(|| {
            ServiceError::Configuration(format!("no manager for resource type {}", kind))
        })?;
        mgr.allocate(ctx, &prior)
            .await
            .map_err(|e| ServiceError::UpstreamUnavailable(e.into()))
    }

    /// Undo a failed allocation: drop the store record, then best-effort
    /// release everything the context saw. Never surfaces its own errors.
    async fn rollback(&self, ctx: &RequestContext, key: &str) {
        let resources = ctx.resources();
        if resources.is_empty() {
            return;
        }

        if let Err(err) = self.store.delete(key) {
            error!(pod = %key, error = %err, "rollback failed to delete store record");
        }

        for res in resources {
            match self.manager_for(res.kind) {
                Some(mgr) => {
                    if let Err(err) = mgr.release(ctx, &res).await {
                        warn!(pod = %key, id = %res.id, error = %err, "rollback release failed");
                    }
                }
                None => {
                    warn!(pod = %key, id = %res.id, kind = %res.kind, "no manager to roll back resource");
                }
            }
        }
    }

    /// Post-commit: annotate the pod with the default interface's IPs.
    /// Failure is logged, never propagated.
    async fn patch_default_pod_ips(&self, pod: &PodInfo, net_confs: &[rpc::NetConf]) {
        for conf in net_confs {
            if !default_if(&conf.if_name) {
                continue;
            }
            let Some(pod_ip) = conf.basic_info.as_ref().and_then(|b| b.pod_ip.as_ref()) else {
                continue;
            };
            let mut ips = Vec::new();
            if !pod_ip.ipv4.is_empty() {
                ips.push(pod_ip.ipv4.clone());
            }
            if !pod_ip.ipv6.is_empty() {
                ips.push(pod_ip.ipv6.clone());
            }
            if ips.is_empty() {
                continue;
            }
            if let Err(err) = self.k8s.patch_pod_ips(pod, &ips.join(",")).await {
                warn!(pod = %pod.key(), error = %err, "failed to patch pod ip annotation");
            }
        }
    }

    /// Handle one ReleaseIP call.
    pub async fn release_ip(
        &self,
        req: &rpc::ReleaseIpRequest,
        cancel: CancellationToken,
    ) -> Result<rpc::ReleaseIpReply, ServiceError> {
        let key = pod_key(&req.k8s_pod_namespace, &req.k8s_pod_name);
        info!(
            pod = %key,
            container_id = %req.k8s_pod_infra_container_id,
            "release ip request"
        );

        let _pending = self.register_pending(&key)?;
        let _read = self.lock.read().await;

        let pod = self
            .k8s
            .get_pod(&req.k8s_pod_namespace, &req.k8s_pod_name)
            .await
            .map_err(ServiceError::UpstreamUnavailable)?;

        let reply = rpc::ReleaseIpReply {
            success: true,
            ipv4: self.ip_family.ipv4,
            ipv6: self.ip_family.ipv6,
        };

        // A mode change between allocate and release leaves foreign state
        // behind; the safest act is to leave it to the GC and succeed.
        if !self.verify_pod_network_type(pod.pod_network_type) {
            warn!(
                pod = %key,
                network_type = %pod.pod_network_type,
                "unexpected pod network type on release, maybe daemon mode changed"
            );
            return Ok(reply);
        }

        let Some(old_res) = self.store.get(&key).map_err(ServiceError::Internal)? else {
            return Ok(reply);
        };

        if let Some(stored_id) = &old_res.container_id {
            if *stored_id != req.k8s_pod_infra_container_id {
                warn!(
                    pod = %key,
                    expected = %stored_id,
                    got = %req.k8s_pod_infra_container_id,
                    "release does not match stored sandbox, ignored"
                );
                return Ok(reply);
            }
        }

        let ctx = RequestContext::new(cancel, pod.clone(), Arc::clone(&self.k8s));

        if pod.ip_stick_time == 0 {
            for res in &old_res.resources {
                ctx.record(std::slice::from_ref(res));
                let Some(mgr) = self.manager_for(res.kind) else {
                    warn!(pod = %key, id = %res.id, kind = %res.kind, "no manager to release resource");
                    continue;
                };
                if let Err(err) = mgr.release(&ctx, res).await {
                    if !err.is_invalid_state() {
                        return Err(ServiceError::UpstreamUnavailable(err.into()));
                    }
                    debug!(pod = %key, id = %res.id, "resource already gone");
                }
            }
            self.store.delete(&key).map_err(ServiceError::Internal)?;
        } else {
            debug!(pod = %key, stick_secs = pod.ip_stick_time, "sticky pod, deferring release to gc");
        }

        if ctx.cancelled() {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "request cancelled by caller"
            )));
        }

        info!(pod = %key, "release ip done");
        Ok(reply)
    }

    /// Handle one GetIPInfo call. A strict read path.
    pub async fn get_ip_info(
        &self,
        req: &rpc::GetInfoRequest,
    ) -> Result<rpc::GetInfoReply, ServiceError> {
        let key = pod_key(&req.k8s_pod_namespace, &req.k8s_pod_name);
        debug!(pod = %key, "get ip info request");

        let _read = self.lock.read().await;

        let pod = self
            .k8s
            .get_pod(&req.k8s_pod_namespace, &req.k8s_pod_name)
            .await
            .map_err(ServiceError::UpstreamUnavailable)?;

        if !self.verify_pod_network_type(pod.pod_network_type) {
            return Err(ServiceError::Configuration(format!(
                "unexpected pod network type {} for daemon mode {}",
                pod.pod_network_type, self.daemon_mode
            )));
        }

        let mut reply = rpc::GetInfoReply {
            ipv4: self.ip_family.ipv4,
            ipv6: self.ip_family.ipv6,
            enable_trunking: self.enable_trunk,
            ..Default::default()
        };

        let pod_res = self.store.get(&key).map_err(ServiceError::Internal)?;
        if let Some(res) = &pod_res {
            if let Some(stored_id) = &res.container_id {
                if *stored_id != req.k8s_pod_infra_container_id {
                    warn!(
                        pod = %key,
                        expected = %stored_id,
                        got = %req.k8s_pod_infra_container_id,
                        "info request does not match stored sandbox, ignored"
                    );
                    return Ok(reply);
                }
            }
        }

        let ctx = RequestContext::new(CancellationToken::new(), pod.clone(), Arc::clone(&self.k8s));
        let mut net_confs: Vec<rpc::NetConf> = Vec::new();

        match pod.pod_network_type {
            PodNetworkType::EniMultiIp => {
                reply.ip_type = rpc::IpType::TypeEniMultiIp as i32;

                match self.multi_ip_from_crd(&pod, false).await {
                    Ok(Some(confs)) => net_confs.extend(confs),
                    Ok(None) => {}
                    Err(err) => {
                        debug!(pod = %key, error = %err, "pod eni not readable");
                        reply.error = rpc::ErrorCode::ErrCrdNotFound as i32;
                        return Ok(reply);
                    }
                }

                let default_if_set = net_confs.iter().any(|c| default_if(&c.if_name));
                if !default_if_set {
                    if let Some(res) = &pod_res {
                        let items = res.items_of(ResourceType::EniIp);
                        if let (Some(item), Some(mgr)) =
                            (items.first(), self.manager_for(ResourceType::EniIp))
                        {
                            match mgr.stat(&ctx, &item.id).await {
                                Ok(NetworkResource::EniIp(eni_ip)) => {
                                    net_confs.push(self.eni_ip_net_conf(&pod, &eni_ip, false));
                                }
                                Ok(_) | Err(_) => {
                                    debug!(pod = %key, id = %item.id, "failed to stat eni-ip");
                                }
                            }
                        }
                    }
                }

                default_for_net_conf(&mut net_confs).map_err(ServiceError::Internal)?;
            }
            PodNetworkType::VpcIp => {
                reply.ip_type = rpc::IpType::TypeVpcIp as i32;
                net_confs.push(rpc::NetConf {
                    basic_info: Some(rpc::BasicInfo {
                        pod_ip: None,
                        pod_cidr: Some(self.k8s.node_cidr().to_rpc()),
                        gateway_ip: None,
                        service_cidr: Some(self.k8s.service_cidr().to_rpc()),
                    }),
                    eni_info: None,
                    pod: Some(pod_section(&pod)),
                    if_name: String::new(),
                    extra_routes: Vec::new(),
                    default_route: true,
                });
            }
            PodNetworkType::VpcEni => {
                reply.ip_type = rpc::IpType::TypeVpcEni as i32;

                if self.ipam_type == IpamType::Crd {
                    match self.exclusive_eni_from_crd(&pod, false).await {
                        Ok(confs) => net_confs.extend(confs),
                        Err(err) => {
                            debug!(pod = %key, error = %err, "pod eni not readable");
                            reply.error = rpc::ErrorCode::ErrCrdNotFound as i32;
                            return Ok(reply);
                        }
                    }
                } else if let Some(res) = &pod_res {
                    let items = res.items_of(ResourceType::Eni);
                    if let (Some(item), Some(mgr)) =
                        (items.first(), self.manager_for(ResourceType::Eni))
                    {
                        match mgr.stat(&ctx, &item.id).await {
                            Ok(NetworkResource::Eni(eni)) => {
                                let trunk = pod.pod_eni && self.enable_trunk && eni.trunk;
                                net_confs.push(self.eni_net_conf(&pod, &eni, trunk, true));
                            }
                            Ok(_) | Err(_) => {
                                debug!(pod = %key, id = %item.id, "failed to stat eni");
                            }
                        }
                    }
                }
            }
        }

        reply.net_confs = net_confs;
        Ok(reply)
    }

    /// Thin passthrough to the Kubernetes event recorder.
    pub async fn record_event(
        &self,
        req: &rpc::EventRequest,
    ) -> Result<rpc::EventReply, ServiceError> {
        let kind = if req.event_type == rpc::EventType::EventTypeWarning as i32 {
            EventKind::Warning
        } else {
            EventKind::Normal
        };

        let mut reply = rpc::EventReply {
            succeed: true,
            error: String::new(),
        };

        if req.event_target == rpc::EventTarget::EventTargetNode as i32 {
            let _ = self
                .k8s
                .record_node_event(kind, &req.reason, &req.message)
                .await;
            return Ok(reply);
        }

        if let Err(err) = self
            .k8s
            .record_pod_event(
                &req.k8s_pod_namespace,
                &req.k8s_pod_name,
                kind,
                &req.reason,
                &req.message,
            )
            .await
        {
            reply.succeed = false;
            reply.error = err.to_string();
        }

        Ok(reply)
    }

    /// Pool-local / cloud-remote / pod-bound three-way join for the mode's
    /// primary resource kind. VPC mode has no pool to compare.
    pub async fn resource_mapping(&self) -> anyhow::Result<Vec<PodMapping>> {
        let _read = self.lock.read().await;

        let kind = match self.daemon_mode {
            DaemonMode::EniMultiIp => ResourceType::EniIp,
            DaemonMode::EniOnly => ResourceType::Eni,
            DaemonMode::Vpc => return Ok(Vec::new()),
        };
        let mgr = self
            .manager_for(kind)
            .ok_or_else(|| anyhow::anyhow!("no manager for resource type {}", kind))?;
        let snapshot = mgr.resource_mapping().await?;
        let pods = self.store.list()?;
        Ok(to_res_mapping(&snapshot, &pods))
    }

    /// Introspection surface for the operator API.
    pub fn snapshot(&self) -> ServiceSnapshot {
        let pods = self
            .store
            .list()
            .unwrap_or_default()
            .into_iter()
            .map(|res| PodResourceSummary {
                key: res.pod_info.key(),
                resources: res
                    .resources
                    .iter()
                    .map(|r| format!("({}){}", r.kind, r.id))
                    .collect(),
            })
            .collect();

        ServiceSnapshot {
            daemon_mode: self.daemon_mode.to_string(),
            config_file_path: self.config_file_path.clone(),
            pending_pods: self.pending_pods.len(),
            pods,
        }
    }

    fn eni_ip_net_conf(&self, pod: &PodInfo, eni_ip: &EniIp, default_route: bool) -> rpc::NetConf {
        rpc::NetConf {
            basic_info: Some(rpc::BasicInfo {
                pod_ip: Some(eni_ip.ip.to_rpc()),
                pod_cidr: Some(eni_ip.eni.vswitch_cidr.to_rpc()),
                gateway_ip: Some(eni_ip.eni.gateway_ip.to_rpc()),
                service_cidr: Some(self.k8s.service_cidr().to_rpc()),
            }),
            eni_info: Some(rpc::EniInfo {
                mac: eni_ip.eni.mac.clone(),
                trunk: false,
                vid: 0,
                gateway_ip: None,
            }),
            pod: Some(pod_section(pod)),
            if_name: String::new(),
            extra_routes: Vec::new(),
            default_route,
        }
    }

    fn eni_net_conf(&self, pod: &PodInfo, eni: &Eni, trunk: bool, default_route: bool) -> rpc::NetConf {
        rpc::NetConf {
            basic_info: Some(rpc::BasicInfo {
                pod_ip: Some(eni.primary_ip.to_rpc()),
                pod_cidr: Some(eni.vswitch_cidr.to_rpc()),
                gateway_ip: Some(eni.gateway_ip.to_rpc()),
                service_cidr: Some(self.k8s.service_cidr().to_rpc()),
            }),
            eni_info: Some(rpc::EniInfo {
                mac: eni.mac.clone(),
                trunk,
                vid: 0,
                gateway_ip: None,
            }),
            pod: Some(pod_section(pod)),
            if_name: String::new(),
            extra_routes: Vec::new(),
            default_route,
        }
    }
}

fn pod_section(pod: &PodInfo) -> rpc::Pod {
    rpc::Pod {
        ingress: pod.tc_ingress,
        egress: pod.tc_egress,
        network_priority: pod.network_priority.clone(),
    }
}

/// Default-route policy over a reply's interface list: at most one default
/// route, at least one default interface, and the first default interface
/// becomes the default route when none is marked.
pub fn default_for_net_conf(net_confs: &mut [rpc::NetConf]) -> anyhow::Result<()> {
    if net_confs.is_empty() {
        return Ok(());
    }

    let mut default_route_set = false;
    let mut default_if_set = false;
    for conf in net_confs.iter() {
        if conf.default_route && default_route_set {
            anyhow::bail!("default route is duplicated");
        }
        default_route_set = default_route_set || conf.default_route;
        if default_if(&conf.if_name) {
            default_if_set = true;
        }
    }

    if !default_if_set {
        anyhow::bail!("default interface is not set");
    }

    if !default_route_set {
        for conf in net_confs.iter_mut() {
            if default_if(&conf.if_name) {
                conf.default_route = true;
                break;
            }
        }
    }

    Ok(())
}

/// Builder wiring the coordinator out of its collaborators.
pub struct NetworkServiceBuilder {
    daemon_mode: Option<DaemonMode>,
    config_file_path: String,
    k8s: Option<Arc<dyn Kubernetes>>,
    store: Option<Arc<dyn Storage>>,
    managers: HashMap<ResourceType, Arc<dyn ResourceManager>>,
    ip_family: IpFamily,
    ipam_type: IpamType,
    enable_trunk: bool,
    trunk_eni: Option<Eni>,
    route_cleanup: Option<Arc<dyn RouteCleanup>>,
    cni: Option<CniInvoker>,
    health: Option<HealthRegistry>,
}

impl NetworkServiceBuilder {
    pub fn new() -> Self {
        Self {
            daemon_mode: None,
            config_file_path: String::new(),
            k8s: None,
            store: None,
            managers: HashMap::new(),
            ip_family: IpFamily::v4_only(),
            ipam_type: IpamType::Default,
            enable_trunk: false,
            trunk_eni: None,
            route_cleanup: None,
            cni: None,
            health: None,
        }
    }

    pub fn daemon_mode(mut self, mode: DaemonMode) -> Self {
        self.daemon_mode = Some(mode);
        self
    }

    pub fn config_file_path(mut self, path: impl Into<String>) -> Self {
        self.config_file_path = path.into();
        self
    }

    pub fn kubernetes(mut self, k8s: Arc<dyn Kubernetes>) -> Self {
        self.k8s = Some(k8s);
        self
    }

    pub fn storage(mut self, store: Arc<dyn Storage>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn manager(mut self, kind: ResourceType, mgr: Arc<dyn ResourceManager>) -> Self {
        self.managers.insert(kind, mgr);
        self
    }

    pub fn ip_family(mut self, family: IpFamily) -> Self {
        self.ip_family = family;
        self
    }

    pub fn ipam_type(mut self, ipam: IpamType) -> Self {
        self.ipam_type = ipam;
        self
    }

    pub fn enable_trunk(mut self, enable: bool) -> Self {
        self.enable_trunk = enable;
        self
    }

    pub fn trunk_eni(mut self, eni: Option<Eni>) -> Self {
        self.trunk_eni = eni;
        self
    }

    pub fn route_cleanup(mut self, cleanup: Arc<dyn RouteCleanup>) -> Self {
        self.route_cleanup = Some(cleanup);
        self
    }

    pub fn cni(mut self, cni: CniInvoker) -> Self {
        self.cni = Some(cni);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> anyhow::Result<NetworkService> {
        let daemon_mode = self
            .daemon_mode
            .ok_or_else(|| anyhow::anyhow!("daemon mode is required"))?;
        let k8s = self
            .k8s
            .ok_or_else(|| anyhow::anyhow!("kubernetes handle is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("storage is required"))?;

        Ok(NetworkService {
            daemon_mode,
            config_file_path: self.config_file_path,
            k8s,
            store,
            mgr_for_resource: self.managers,
            pending_pods: DashMap::new(),
            lock: RwLock::new(()),
            ip_family: self.ip_family,
            ipam_type: self.ipam_type,
            enable_trunk: self.enable_trunk,
            trunk_eni: self.trunk_eni,
            route_cleanup: self
                .route_cleanup
                .unwrap_or_else(|| Arc::new(NoopCleanup::default())),
            cni: self.cni.unwrap_or_else(CniInvoker::from_env),
            health: self.health.unwrap_or_default(),
            metrics: DaemonMetrics::new(),
        })
    }
}

impl Default for NetworkServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceSnapshot {
    pub daemon_mode: String,
    pub config_file_path: String,
    pub pending_pods: usize,
    pub pods: Vec<PodResourceSummary>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PodResourceSummary {
    pub key: String,
    pub resources: Vec<String>,
}

/// gRPC adapter over the coordinator.
pub struct GrpcService {
    inner: Arc<NetworkService>,
}

impl GrpcService {
    pub fn new(inner: Arc<NetworkService>) -> Self {
        Self { inner }
    }
}

#[tonic::async_trait]
impl rpc::PodNetworkBackend for GrpcService {
    async fn alloc_ip(
        &self,
        request: tonic::Request<rpc::AllocIpRequest>,
    ) -> Result<tonic::Response<rpc::AllocIpReply>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let result = self.inner.alloc_ip(&req, CancellationToken::new()).await;
        self.inner
            .metrics
            .observe_rpc("AllocIP", start.elapsed(), result.is_err());
        result.map(tonic::Response::new).map_err(Into::into)
    }

    async fn release_ip(
        &self,
        request: tonic::Request<rpc::ReleaseIpRequest>,
    ) -> Result<tonic::Response<rpc::ReleaseIpReply>, tonic::Status> {
        let start = Instant::now();
        let req = request.into_inner();
        let result = self.inner.release_ip(&req, CancellationToken::new()).await;
        self.inner
            .metrics
            .observe_rpc("ReleaseIP", start.elapsed(), result.is_err());
        result.map(tonic::Response::new).map_err(Into::into)
    }

    async fn get_ip_info(
        &self,
        request: tonic::Request<rpc::GetInfoRequest>,
    ) -> Result<tonic::Response<rpc::GetInfoReply>, tonic::Status> {
        let req = request.into_inner();
        self.inner
            .get_ip_info(&req)
            .await
            .map(tonic::Response::new)
            .map_err(Into::into)
    }

    async fn record_event(
        &self,
        request: tonic::Request<rpc::EventRequest>,
    ) -> Result<tonic::Response<rpc::EventReply>, tonic::Status> {
        let req = request.into_inner();
        self.inner
            .record_event(&req)
            .await
            .map(tonic::Response::new)
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(if_name: &str, default_route: bool) -> rpc::NetConf {
        rpc::NetConf {
            if_name: if_name.to_string(),
            default_route,
            ..Default::default()
        }
    }

    #[test]
    fn empty_list_is_fine() {
        let mut confs: Vec<rpc::NetConf> = Vec::new();
        default_for_net_conf(&mut confs).unwrap();
    }

    #[test]
    fn duplicate_default_route_is_an_error() {
        let mut confs = vec![conf("", true), conf("eth1", true)];
        assert!(default_for_net_conf(&mut confs).is_err());
    }

    #[test]
    fn missing_default_interface_is_an_error() {
        let mut confs = vec![conf("eth1", false), conf("eth2", true)];
        assert!(default_for_net_conf(&mut confs).is_err());
    }

    #[test]
    fn first_default_interface_gets_the_route() {
        let mut confs = vec![conf("eth1", false), conf("", false), conf("eth0", false)];
        default_for_net_conf(&mut confs).unwrap();
        assert!(!confs[0].default_route);
        assert!(confs[1].default_route);
        assert!(!confs[2].default_route);
    }

    #[test]
    fn explicit_default_route_is_kept() {
        let mut confs = vec![conf("eth0", false), conf("eth1", true)];
        default_for_net_conf(&mut confs).unwrap();
        assert!(!confs[0].default_route);
        assert!(confs[1].default_route);
    }
}
