//! Daemon configuration
//!
//! The base config is a JSON or YAML file; a dynamic overlay fetched from a
//! node-scoped custom resource is merged over it as an RFC 7396 merge
//! patch. Validation and defaulting run after the merge.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cloud::InstanceMetadata;
use crate::models::{IpFamily, IpamType};

/// Security group count the cloud accepts per ENI.
pub const MAX_SECURITY_GROUPS: usize = 5;

const VSWITCH_POLICY_RANDOM: &str = "random";

/// A static route pushed into pods in addition to the default route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
}

/// Retry shaping for one named upstream operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub duration_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
    pub cap_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub version: String,
    pub access_key: String,
    pub access_secret: String,
    pub credential_path: String,
    /// Endpoint of the platform's network controller fronting the cloud
    /// API for this node.
    pub api_endpoint: String,
    pub service_cidr: String,
    /// vSwitch ids usable for ENI creation, keyed by zone.
    pub vswitches: HashMap<String, Vec<String>>,
    pub eni_tags: HashMap<String, String>,
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub min_eni: usize,
    pub max_eni: usize,
    pub prefix: String,
    pub security_group: String,
    pub security_groups: Vec<String>,
    pub eni_cap_ratio: f64,
    pub eni_cap_shift: i64,
    pub vswitch_selection_policy: String,
    pub enable_eip_pool: bool,
    /// `ipv4`, `ipv6` or `dual`.
    pub ip_stack: String,
    /// Bind an EIP even when it is already bound elsewhere.
    pub allow_eip_rob: bool,
    pub enable_eni_trunking: bool,
    /// Workload kinds treated as stateful in addition to StatefulSet.
    pub custom_stateful_workload_kinds: Vec<String>,
    pub ipam_type: IpamType,
    /// `preferTrunk` or `secondary`.
    pub eni_cap_policy: String,
    pub backoff_override: HashMap<String, BackoffConfig>,
    pub extra_routes: Vec<Route>,
    pub disable_device_plugin: bool,
    /// Do not create a trunk ENI even when trunking is enabled.
    pub wait_trunk_eni: bool,
    /// When set, only ENIs matching all tags are managed.
    pub eni_tag_filter: HashMap<String, String>,
    pub disable_security_group_check: bool,
    pub kube_client_qps: f32,
    pub kube_client_burst: u32,
}

impl DaemonConfig {
    /// Parse the base file and merge the optional dynamic overlay over it.
    /// Both sides accept JSON or YAML.
    pub fn from_file_with_merge(path: impl AsRef<Path>, overlay: Option<&str>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        Self::merge_and_parse(&data, overlay)
    }

    pub fn merge_and_parse(base: &[u8], overlay: Option<&str>) -> Result<Self> {
        let mut doc: serde_json::Value =
            serde_yaml::from_slice(base).context("failed to parse base config")?;

        if let Some(overlay) = overlay.filter(|s| !s.trim().is_empty()) {
            let patch: serde_json::Value =
                serde_yaml::from_str(overlay).context("failed to parse dynamic config overlay")?;
            json_patch::merge(&mut doc, &patch);
        }

        serde_json::from_value(doc).context("failed to decode merged config")
    }

    /// Fill in defaults for fields the file may omit.
    pub fn apply_defaults(&mut self) {
        if self.eni_cap_ratio == 0.0 {
            self.eni_cap_ratio = 1.0;
        }
        if self.vswitch_selection_policy.is_empty() {
            self.vswitch_selection_policy = VSWITCH_POLICY_RANDOM.to_string();
        }
        if self.ip_stack.is_empty() {
            self.ip_stack = "ipv4".to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.ip_stack.as_str() {
            "" | "ipv4" | "ipv6" | "dual" => {}
            other => anyhow::bail!("unsupported ip_stack {}", other),
        }

        let groups = self.merged_security_groups();
        if groups.len() > MAX_SECURITY_GROUPS {
            anyhow::bail!(
                "security groups should not be more than {}, current {}",
                MAX_SECURITY_GROUPS,
                groups.len()
            );
        }

        Ok(())
    }

    /// The singular and plural security group fields merged, deduplicated.
    pub fn merged_security_groups(&self) -> Vec<String> {
        let mut set = BTreeSet::new();
        if !self.security_group.is_empty() {
            set.insert(self.security_group.clone());
        }
        set.extend(self.security_groups.iter().cloned());
        set.into_iter().collect()
    }

    /// The IP families the node should serve, before the instance-type
    /// downgrade.
    pub fn ip_family(&self) -> IpFamily {
        match self.ip_stack.as_str() {
            "dual" => IpFamily::dual(),
            "ipv6" => IpFamily {
                ipv4: false,
                ipv6: true,
            },
            _ => IpFamily::v4_only(),
        }
    }

    /// Sizing and placement parameters handed to the resource pools.
    pub fn pool_config(&self, instance: &InstanceMetadata) -> Result<PoolConfig> {
        let mut pool = PoolConfig {
            max_pool_size: self.max_pool_size,
            min_pool_size: self.min_pool_size,
            max_eni: self.max_eni,
            min_eni: self.min_eni,
            eni_cap_ratio: self.eni_cap_ratio,
            eni_cap_shift: self.eni_cap_shift,
            security_groups: self.merged_security_groups(),
            vswitch_selection_policy: self.vswitch_selection_policy.clone(),
            enable_eni_trunking: self.enable_eni_trunking,
            wait_trunk_eni: self.wait_trunk_eni,
            eni_cap_policy: self.eni_cap_policy.clone(),
            disable_security_group_check: self.disable_security_group_check,
            eni_tags: self.eni_tags.clone(),
            vswitches: Vec::new(),
            vpc_id: instance.vpc_id.clone(),
            instance_id: instance.instance_id.clone(),
            zone_id: instance.zone_id.clone(),
        };

        if let Some(zone_vswitches) = self.vswitches.get(&instance.zone_id) {
            if !zone_vswitches.is_empty() {
                pool.vswitches = zone_vswitches.clone();
            }
        }
        if pool.vswitches.is_empty() {
            pool.vswitches = vec![instance.vswitch_id.clone()];
        }

        // CRD-managed IPAM keeps no local pool.
        if self.ipam_type == IpamType::Crd {
            pool.max_pool_size = 0;
            pool.min_pool_size = 0;
            pool.max_eni = 0;
            pool.min_eni = 0;
        }

        Ok(pool)
    }
}

/// Parameters for the managers' pools, derived from config plus instance
/// metadata.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub max_eni: usize,
    pub min_eni: usize,
    pub eni_cap_ratio: f64,
    pub eni_cap_shift: i64,
    pub security_groups: Vec<String>,
    pub vswitch_selection_policy: String,
    pub enable_eni_trunking: bool,
    pub wait_trunk_eni: bool,
    pub eni_cap_policy: String,
    pub disable_security_group_check: bool,
    pub eni_tags: HashMap<String, String>,
    pub vswitches: Vec<String>,
    pub vpc_id: String,
    pub instance_id: String,
    pub zone_id: String,
}
