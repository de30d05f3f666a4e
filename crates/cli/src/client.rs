//! HTTP client for the daemon's operator API

use std::collections::HashMap;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub struct DaemonClient {
    client: Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to create http client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach daemon at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("daemon error ({}): {}", status, body);
        }

        response.json().await.context("failed to parse response")
    }

    pub async fn mapping(&self) -> Result<Vec<PodMapping>> {
        self.get("/mapping").await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("/healthz").await
    }

    pub async fn config(&self) -> Result<ServiceSnapshot> {
        self.get("/config").await
    }
}

// Daemon API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodMapping {
    pub name: String,
    pub namespace: String,
    pub local_res_id: String,
    pub remote_res_id: String,
    pub pod_bind_res_id: String,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub daemon_mode: String,
    pub config_file_path: String,
    pub pending_pods: usize,
    pub pods: Vec<PodResourceSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodResourceSummary {
    pub key: String,
    pub resources: Vec<String>,
}
