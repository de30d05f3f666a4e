//! Cloud-provider boundary
//!
//! The daemon never talks to the cloud directly; the managers' pools do,
//! through [`CloudApi`]. The trait carries only the verbs the pools need.
//! `ApiClient` is a thin JSON transport for deployments where the node
//! reaches the provider through the platform's network controller; real
//! credential exchange is terminated outside this process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ResourceError;
use crate::ip::{IpNetSet, IpSet};
use crate::models::{Eip, Eni};

const METADATA_BASE_DEFAULT: &str = "http://169.254.169.254/latest/meta-data";

/// Identity of the instance the daemon runs on.
#[derive(Debug, Clone, Default)]
pub struct InstanceMetadata {
    pub instance_id: String,
    pub instance_type: String,
    pub region_id: String,
    pub zone_id: String,
    pub vpc_id: String,
    pub vswitch_id: String,
}

impl InstanceMetadata {
    /// Read the instance identity from the metadata server. The base URL is
    /// overridable through `METADATA_BASE_URL` for non-standard hosts.
    pub async fn from_metadata_server() -> Result<Self> {
        let base = std::env::var("METADATA_BASE_URL")
            .unwrap_or_else(|_| METADATA_BASE_DEFAULT.to_string());
        let http = reqwest::Client::new();

        let fetch = |path: &'static str| {
            let http = http.clone();
            let url = format!("{}/{}", base, path);
            async move {
                http.get(&url)
                    .send()
                    .await
                    .with_context(|| format!("metadata request {} failed", url))?
                    .error_for_status()
                    .with_context(|| format!("metadata request {} rejected", url))?
                    .text()
                    .await
                    .context("metadata response unreadable")
            }
        };

        Ok(Self {
            instance_id: fetch("instance-id").await?,
            instance_type: fetch("instance/instance-type").await?,
            region_id: fetch("region-id").await?,
            zone_id: fetch("zone-id").await?,
            vpc_id: fetch("vpc-id").await?,
            vswitch_id: fetch("vswitch-id").await?,
        })
    }
}

/// Per-instance-type capability set the coordinator consults at startup.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct InstanceLimits {
    pub max_enis: usize,
    pub ipv4_per_eni: usize,
    pub ipv6_per_eni: usize,
    pub trunk_supported: bool,
}

impl InstanceLimits {
    pub fn support_ipv6(&self) -> bool {
        self.ipv6_per_eni > 0
    }

    /// Secondary-IP IPv6 needs per-ENI v6 capacity beyond the primary.
    pub fn support_multi_ip_ipv6(&self) -> bool {
        self.ipv6_per_eni > 1
    }
}

/// The cloud verbs the pools are built on.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn instance_limits(&self, instance_type: &str) -> Result<InstanceLimits, ResourceError>;

    async fn create_eni(&self, vswitch: &str, trunk: bool) -> Result<Eni, ResourceError>;
    async fn delete_eni(&self, eni_id: &str) -> Result<(), ResourceError>;
    /// The cloud-side truth for the mapping join.
    async fn describe_enis(&self) -> Result<Vec<Eni>, ResourceError>;

    async fn assign_private_ip(&self, eni_id: &str) -> Result<IpSet, ResourceError>;
    async fn unassign_private_ip(&self, eni_id: &str, ip: &IpSet) -> Result<(), ResourceError>;
    /// Assigned secondary IP ids (`"<eni id>.<ip>"`) across the instance.
    async fn describe_eni_ips(&self) -> Result<Vec<String>, ResourceError>;

    async fn allocate_eip(&self, allow_rob: bool) -> Result<Eip, ResourceError>;
    async fn release_eip(&self, eip_id: &str) -> Result<(), ResourceError>;
    async fn associate_eip(&self, eip_id: &str, target_ip: &IpSet) -> Result<(), ResourceError>;
    async fn unassociate_eip(&self, eip_id: &str) -> Result<(), ResourceError>;
}

#[derive(Debug, Deserialize)]
struct EniPayload {
    id: String,
    mac: String,
    #[serde(default)]
    primary_ip: String,
    #[serde(default)]
    gateway: String,
    #[serde(default)]
    vswitch_cidr: String,
    #[serde(default)]
    trunk: bool,
}

impl EniPayload {
    fn into_eni(self) -> Result<Eni> {
        Ok(Eni {
            id: self.id,
            mac: self.mac,
            primary_ip: IpSet {
                ipv4: self.primary_ip.parse().ok(),
                ipv6: None,
            },
            gateway_ip: IpSet {
                ipv4: self.gateway.parse().ok(),
                ipv6: None,
            },
            vswitch_cidr: IpNetSet::parse(&self.vswitch_cidr)?,
            trunk: self.trunk,
        })
    }
}

#[derive(Debug, Deserialize)]
struct IpPayload {
    #[serde(default)]
    ipv4: String,
    #[serde(default)]
    ipv6: String,
}

#[derive(Debug, Deserialize)]
struct EipPayload {
    id: String,
    #[serde(default)]
    address: String,
}

/// JSON-over-HTTP [`CloudApi`] transport.
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    access_key: String,
    instance_id: String,
}

impl ApiClient {
    pub fn new(endpoint: impl Into<String>, access_key: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            instance_id: instance_id.into(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
        params: serde_json::Value,
    ) -> Result<T, ResourceError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header("x-access-key", &self.access_key)
            .json(&serde_json::json!({
                "action": action,
                "instance_id": self.instance_id,
                "params": params,
            }))
            .send()
            .await
            .with_context(|| format!("cloud call {} failed", action))?;

        let resp = resp
            .error_for_status()
            .with_context(|| format!("cloud call {} rejected", action))?;

        Ok(resp
            .json()
            .await
            .with_context(|| format!("cloud call {} returned invalid payload", action))?)
    }
}

#[async_trait]
impl CloudApi for ApiClient {
    async fn instance_limits(&self, instance_type: &str) -> Result<InstanceLimits, ResourceError> {
        self.call("DescribeInstanceLimits", serde_json::json!({ "instance_type": instance_type }))
            .await
    }

    async fn create_eni(&self, vswitch: &str, trunk: bool) -> Result<Eni, ResourceError> {
        let payload: EniPayload = self
            .call("CreateNetworkInterface", serde_json::json!({ "vswitch": vswitch, "trunk": trunk }))
            .await?;
        payload.into_eni().map_err(ResourceError::Upstream)
    }

    async fn delete_eni(&self, eni_id: &str) -> Result<(), ResourceError> {
        let _: serde_json::Value = self
            .call("DeleteNetworkInterface", serde_json::json!({ "eni_id": eni_id }))
            .await?;
        Ok(())
    }

    async fn describe_enis(&self) -> Result<Vec<Eni>, ResourceError> {
        let payloads: Vec<EniPayload> = self
            .call("DescribeNetworkInterfaces", serde_json::json!({}))
            .await?;
        payloads
            .into_iter()
            .map(|p| p.into_eni().map_err(ResourceError::Upstream))
            .collect()
    }

    async fn assign_private_ip(&self, eni_id: &str) -> Result<IpSet, ResourceError> {
        let payload: IpPayload = self
            .call("AssignPrivateIpAddress", serde_json::json!({ "eni_id": eni_id }))
            .await?;
        Ok(IpSet {
            ipv4: payload.ipv4.parse().ok(),
            ipv6: payload.ipv6.parse().ok(),
        })
    }

    async fn unassign_private_ip(&self, eni_id: &str, ip: &IpSet) -> Result<(), ResourceError> {
        let _: serde_json::Value = self
            .call(
                "UnassignPrivateIpAddress",
                serde_json::json!({ "eni_id": eni_id, "ipv4": ip.to_rpc().ipv4, "ipv6": ip.to_rpc().ipv6 }),
            )
            .await?;
        Ok(())
    }

    async fn describe_eni_ips(&self) -> Result<Vec<String>, ResourceError> {
        self.call("DescribeAssignedIpAddresses", serde_json::json!({}))
            .await
    }

    async fn allocate_eip(&self, allow_rob: bool) -> Result<Eip, ResourceError> {
        let payload: EipPayload = self
            .call("AllocateEipAddress", serde_json::json!({ "allow_rob": allow_rob }))
            .await?;
        Ok(Eip {
            id: payload.id,
            address: IpSet {
                ipv4: payload.address.parse().ok(),
                ipv6: None,
            },
        })
    }

    async fn release_eip(&self, eip_id: &str) -> Result<(), ResourceError> {
        let _: serde_json::Value = self
            .call("ReleaseEipAddress", serde_json::json!({ "eip_id": eip_id }))
            .await?;
        Ok(())
    }

    async fn associate_eip(&self, eip_id: &str, target_ip: &IpSet) -> Result<(), ResourceError> {
        let _: serde_json::Value = self
            .call(
                "AssociateEipAddress",
                serde_json::json!({ "eip_id": eip_id, "target": target_ip.join() }),
            )
            .await?;
        Ok(())
    }

    async fn unassociate_eip(&self, eip_id: &str) -> Result<(), ResourceError> {
        let _: serde_json::Value = self
            .call("UnassociateEipAddress", serde_json::json!({ "eip_id": eip_id }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_ipv6_support() {
        let none = InstanceLimits {
            max_enis: 4,
            ipv4_per_eni: 10,
            ipv6_per_eni: 0,
            trunk_supported: false,
        };
        assert!(!none.support_ipv6());
        assert!(!none.support_multi_ip_ipv6());

        let single = InstanceLimits {
            ipv6_per_eni: 1,
            ..none
        };
        assert!(single.support_ipv6());
        assert!(!single.support_multi_ip_ipv6());

        let multi = InstanceLimits {
            ipv6_per_eni: 10,
            ..none
        };
        assert!(multi.support_multi_ip_ipv6());
    }
}
