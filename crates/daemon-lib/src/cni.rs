//! CNI CHECK invocation
//!
//! The period checker drives the CNI plugin's CHECK verb against every
//! known pod. The plugin is executed over the standard CNI exec protocol:
//! config on stdin, parameters in the environment. Each invocation is
//! bounded so a stuck plugin cannot wedge the loop.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::models::IF_ETH0;

pub const CNI_DEFAULT_PATH: &str = "/opt/cni/bin";
/// Written by the configmap mount; read back only to drive CHECK.
pub const CNI_CONF_FILE: &str = "/etc/cni/net.d/10-podnet.conf";

const CNI_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Executes the CNI plugin for liveness checks.
pub struct CniInvoker {
    bin_dir: PathBuf,
    conf_file: PathBuf,
}

impl CniInvoker {
    pub fn new(bin_dir: impl Into<PathBuf>, conf_file: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            conf_file: conf_file.into(),
        }
    }

    /// Build the invoker from the environment: `CNI_PATH` overrides the
    /// plugin directory.
    pub fn from_env() -> Self {
        let bin_dir =
            std::env::var("CNI_PATH").unwrap_or_else(|_| CNI_DEFAULT_PATH.to_string());
        Self::new(bin_dir, CNI_CONF_FILE)
    }

    /// Run CHECK for one pod attachment. The container id may be synthetic;
    /// the plugin's interest is the net namespace.
    pub async fn check(
        &self,
        netns: &str,
        pod_namespace: &str,
        pod_name: &str,
        container_id: Option<&str>,
    ) -> Result<()> {
        let conf = tokio::fs::read(&self.conf_file)
            .await
            .with_context(|| format!("failed to read cni conf {:?}", self.conf_file))?;

        let plugin = plugin_name(&conf)?;
        let netns_path = resolve_netns(netns);

        let mut args = vec![
            "IgnoreUnknown=1".to_string(),
            format!("K8S_POD_NAME={}", pod_name),
            format!("K8S_POD_NAMESPACE={}", pod_namespace),
        ];
        if let Some(id) = container_id {
            args.push(format!("K8S_POD_INFRA_CONTAINER_ID={}", id));
        }

        let mut child = Command::new(self.bin_dir.join(&plugin))
            .env("CNI_COMMAND", "CHECK")
            .env("CNI_CONTAINERID", container_id.unwrap_or("fake"))
            .env("CNI_NETNS", &netns_path)
            .env("CNI_IFNAME", IF_ETH0)
            .env("CNI_PATH", &self.bin_dir)
            .env("CNI_ARGS", args.join(";"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn cni plugin {}", plugin))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&conf)
                .await
                .context("failed to write cni conf to plugin")?;
        }

        let output = tokio::time::timeout(CNI_EXEC_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("cni check timed out for {}/{}", pod_namespace, pod_name))?
            .context("cni plugin did not run")?;

        if !output.status.success() {
            anyhow::bail!(
                "cni check failed for {}/{}: {}",
                pod_namespace,
                pod_name,
                String::from_utf8_lossy(&output.stdout)
            );
        }

        debug!(pod = %format!("{}/{}", pod_namespace, pod_name), "cni check ok");
        Ok(())
    }
}

/// Pod net namespaces are visible through the host's init mount namespace.
pub fn resolve_netns(netns: &str) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(netns)
    } else {
        Path::new("/proc/1/root/").join(netns.trim_start_matches('/'))
    }
}

fn plugin_name(conf: &[u8]) -> Result<String> {
    let parsed: serde_json::Value =
        serde_json::from_slice(conf).context("cni conf is not valid json")?;
    parsed
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
        .ok_or_else(|| anyhow::anyhow!("cni conf has no plugin type"))
}
