//! podnetd - per-node network resource coordinator
//!
//! Runs as a DaemonSet on each worker node. The CNI plugin talks to it
//! over a unix-socket gRPC service; background loops reconcile the store
//! against the live pod set and cloud reality.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use daemon_lib::cloud::{ApiClient, CloudApi, InstanceMetadata};
use daemon_lib::config::DaemonConfig;
use daemon_lib::health::{components, HealthRegistry};
use daemon_lib::ip::IpNetSet;
use daemon_lib::kubernetes::KubeClient;
use daemon_lib::manager::{
    EipManager, EniFactory, EniIpFactory, EniIpManager, EniManager, ResourceManager, VethManager,
};
use daemon_lib::models::{DaemonMode, Eni, EniIp, NetworkResource, PodResources, ResourceType};
use daemon_lib::rpc::PodNetworkBackendServer;
use daemon_lib::service::{GrpcService, NetworkService};
use daemon_lib::storage::{DiskStorage, Storage};
use daemon_lib::link::IpCommandCleanup;

mod api;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "podnetd", version, about = "per-node network resource coordinator")]
struct Args {
    /// Daemon config file (JSON or YAML)
    #[arg(long, default_value = "/etc/podnet/podnet.json")]
    config: String,

    /// Daemon mode: VPC, ENIMultiIP or ENIOnly
    #[arg(long, default_value = "VPC")]
    daemon_mode: String,

    /// Unix socket the CNI plugin connects to
    #[arg(long, default_value = "/var/run/podnet/podnet.sock")]
    socket: String,

    /// Resource store location
    #[arg(long, default_value = "/var/lib/podnet/pod_resources.json")]
    state_file: String,

    /// Port for health, metrics and the operator API
    #[arg(long, default_value_t = 8080)]
    api_port: u16,

    /// Node name from the Kubernetes downward API
    #[arg(long, env = "NODE_NAME")]
    node_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let daemon_mode = DaemonMode::from_str(&args.daemon_mode)?;
    info!(
        version = DAEMON_VERSION,
        mode = %daemon_mode,
        node = %args.node_name,
        config = %args.config,
        "starting podnetd"
    );

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to build kubernetes client")?;

    // dynamic overlay merged over the file config; absence falls back to
    // the file alone
    let overlay = match KubeClient::dynamic_config(&kube_client, &args.node_name).await {
        Ok(overlay) => overlay,
        Err(err) => {
            warn!(error = %err, "failed to fetch dynamic config, using file config only");
            None
        }
    };

    let mut config = DaemonConfig::from_file_with_merge(&args.config, overlay.as_deref())?;
    config.apply_defaults();
    config.validate()?;
    if overlay.is_some() {
        info!("merged dynamic config overlay");
    }
    if !config.backoff_override.is_empty() {
        info!(
            profiles = config.backoff_override.len(),
            "applying backoff overrides"
        );
    }

    let instance = InstanceMetadata::from_metadata_server()
        .await
        .context("failed to read instance metadata")?;
    info!(
        instance = %instance.instance_id,
        instance_type = %instance.instance_type,
        zone = %instance.zone_id,
        "resolved instance identity"
    );

    let cloud: Arc<dyn CloudApi> = Arc::new(ApiClient::new(
        config.api_endpoint.clone(),
        config.access_key.clone(),
        instance.instance_id.clone(),
    ));

    let mut ip_family = config.ip_family();
    let limits = cloud
        .instance_limits(&instance.instance_type)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("unable to get instance limits")?;
    if ip_family.ipv6
        && (!limits.support_ipv6()
            || (daemon_mode == DaemonMode::EniMultiIp && !limits.support_multi_ip_ipv6()))
    {
        ip_family.ipv6 = false;
        warn!(
            instance_type = %instance.instance_type,
            "instance does not support ipv6, serving v4 only"
        );
    }

    let service_cidr =
        IpNetSet::parse(&config.service_cidr).context("invalid service_cidr in config")?;
    let k8s = Arc::new(
        KubeClient::new(
            kube_client,
            args.node_name.clone(),
            daemon_mode,
            service_cidr,
            config.custom_stateful_workload_kinds.clone(),
        )
        .await?,
    );

    let health = HealthRegistry::new();
    health.register(components::STORE).await;
    health.register(components::MANAGERS).await;
    health.register(components::GC).await;
    health.register(components::PERIOD_CHECK).await;
    health.register(components::KUBERNETES).await;

    let store = Arc::new(DiskStorage::open(&args.state_file)?);
    let restored = store.list()?;
    let local_ids = stored_ids_by_type(&restored);
    info!(records = restored.len(), "restored resource store");

    let pool_cfg = config.pool_config(&instance)?;
    let mut managers: HashMap<ResourceType, Arc<dyn ResourceManager>> = HashMap::new();
    let mut trunk_eni: Option<Eni> = None;

    match daemon_mode {
        DaemonMode::Vpc => {
            let eni_mgr = Arc::new(EniManager::new(
                Arc::new(EniFactory::new(cloud.clone(), &pool_cfg)),
                &pool_cfg,
            ));
            eni_mgr.seed(restore_enis(&cloud, local_ids.get(&ResourceType::Eni)).await?);

            let veth_mgr = Arc::new(VethManager::new());
            for id in local_ids.get(&ResourceType::Veth).into_iter().flatten() {
                veth_mgr.seed(id);
            }

            managers.insert(ResourceType::Eni, eni_mgr);
            managers.insert(ResourceType::Veth, veth_mgr);
        }
        DaemonMode::EniMultiIp => {
            let enis = cloud
                .describe_enis()
                .await
                .map_err(|e| anyhow::anyhow!(e))
                .context("failed to describe node enis")?;
            trunk_eni = enis.iter().find(|e| e.trunk).cloned();
            if config.enable_eni_trunking && trunk_eni.is_none() && !config.wait_trunk_eni {
                warn!("trunking enabled but the node has no trunk eni yet");
            }
            let worker_eni = enis
                .iter()
                .find(|e| !e.trunk)
                .cloned()
                .context("node has no worker eni for secondary ips")?;

            let eni_ip_mgr = Arc::new(EniIpManager::new(
                Arc::new(EniIpFactory::new(cloud.clone(), worker_eni.clone())),
                &pool_cfg,
                trunk_eni.clone(),
            ));
            eni_ip_mgr.seed(restore_eni_ips(
                &worker_eni,
                local_ids.get(&ResourceType::EniIp),
            ));
            managers.insert(ResourceType::EniIp, eni_ip_mgr);

            if config.enable_eip_pool {
                let eip_mgr = Arc::new(EipManager::new(cloud.clone(), config.allow_eip_rob));
                for id in local_ids.get(&ResourceType::Eip).into_iter().flatten() {
                    eip_mgr.seed(id);
                }
                managers.insert(ResourceType::Eip, eip_mgr);
            }
        }
        DaemonMode::EniOnly => {
            let eni_mgr = Arc::new(EniManager::new(
                Arc::new(EniFactory::new(cloud.clone(), &pool_cfg)),
                &pool_cfg,
            ));
            eni_mgr.seed(restore_enis(&cloud, local_ids.get(&ResourceType::Eni)).await?);
            managers.insert(ResourceType::Eni, eni_mgr);

            if config.enable_eip_pool && !config.enable_eni_trunking {
                let eip_mgr = Arc::new(EipManager::new(cloud.clone(), config.allow_eip_rob));
                for id in local_ids.get(&ResourceType::Eip).into_iter().flatten() {
                    eip_mgr.seed(id);
                }
                managers.insert(ResourceType::Eip, eip_mgr);
            }
        }
    }

    let mut builder = NetworkService::builder()
        .daemon_mode(daemon_mode)
        .config_file_path(args.config.clone())
        .kubernetes(k8s)
        .storage(store)
        .ip_family(ip_family)
        .ipam_type(config.ipam_type)
        .enable_trunk(config.enable_eni_trunking)
        .trunk_eni(trunk_eni)
        .route_cleanup(Arc::new(IpCommandCleanup))
        .health(health.clone());
    for (kind, mgr) in managers {
        builder = builder.manager(kind, mgr);
    }
    let svc = Arc::new(builder.build()?);

    let shutdown = CancellationToken::new();
    let _gc = svc.spawn_gc_loop(shutdown.clone());
    let _check = svc.spawn_period_check_loop(shutdown.clone());

    let api_state = Arc::new(api::AppState::new(svc.clone(), health.clone()));
    let _api = tokio::spawn(api::serve(args.api_port, api_state));

    health.set_ready(true).await;

    // stop everything once SIGINT arrives
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    serve_grpc(&args.socket, svc, shutdown.clone()).await?;
    shutdown.cancel();
    info!("podnetd stopped");

    Ok(())
}

async fn serve_grpc(
    socket: &str,
    svc: Arc<NetworkService>,
    shutdown: CancellationToken,
) -> Result<()> {
    let path = std::path::Path::new(socket);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {:?}", parent))?;
    }
    // a stale socket from a previous run blocks the bind
    let _ = std::fs::remove_file(path);

    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind unix socket {}", socket))?;
    info!(socket = %socket, "serving cni backend");

    tonic::transport::Server::builder()
        .add_service(PodNetworkBackendServer::new(GrpcService::new(svc)))
        .serve_with_incoming_shutdown(
            UnixListenerStream::new(listener),
            shutdown.cancelled_owned(),
        )
        .await
        .context("grpc server failed")?;

    Ok(())
}

fn stored_ids_by_type(records: &[PodResources]) -> HashMap<ResourceType, Vec<String>> {
    let mut ids: HashMap<ResourceType, Vec<String>> = HashMap::new();
    for record in records {
        for res in &record.resources {
            ids.entry(res.kind).or_default().push(res.id.clone());
        }
    }
    ids
}

/// Rebuild ENI objects for stored ids from the cloud's describe output.
async fn restore_enis(
    cloud: &Arc<dyn CloudApi>,
    ids: Option<&Vec<String>>,
) -> Result<Vec<NetworkResource>> {
    let Some(ids) = ids else {
        return Ok(Vec::new());
    };
    let enis = cloud
        .describe_enis()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to describe enis for restore")?;

    let mut restored = Vec::new();
    for id in ids {
        match enis.iter().find(|e| &e.id == id) {
            Some(eni) => restored.push(NetworkResource::Eni(eni.clone())),
            None => warn!(id = %id, "stored eni not found on the instance, leaving to gc"),
        }
    }
    Ok(restored)
}

/// Rebuild ENI-IP objects from their `"<eni id>.<ip>"` ids.
fn restore_eni_ips(worker_eni: &Eni, ids: Option<&Vec<String>>) -> Vec<NetworkResource> {
    let mut restored = Vec::new();
    for id in ids.into_iter().flatten() {
        let Some((eni_id, ip)) = id.split_once('.') else {
            warn!(id = %id, "stored eni-ip id is malformed, leaving to gc");
            continue;
        };
        if eni_id != worker_eni.id {
            warn!(id = %id, "stored eni-ip belongs to a foreign eni, leaving to gc");
            continue;
        }
        let ip_set = match ip.parse() {
            Ok(std::net::IpAddr::V4(v4)) => daemon_lib::ip::IpSet {
                ipv4: Some(v4),
                ipv6: None,
            },
            Ok(std::net::IpAddr::V6(v6)) => daemon_lib::ip::IpSet {
                ipv4: None,
                ipv6: Some(v6),
            },
            Err(_) => {
                warn!(id = %id, "stored eni-ip id is malformed, leaving to gc");
                continue;
            }
        };
        restored.push(NetworkResource::EniIp(EniIp {
            eni: worker_eni.clone(),
            ip: ip_set,
        }));
    }
    restored
}
