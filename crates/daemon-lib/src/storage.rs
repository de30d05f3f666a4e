//! Durable pod-to-resource association store
//!
//! One record per pod key. The disk format is a single JSON map rewritten
//! atomically (temp file + rename) on every mutation, loaded once at open.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::models::PodResources;

/// Store contract the coordinator and the GC depend on. Keys are pod keys
/// (`"<namespace>/<name>"`).
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<PodResources>>;
    fn put(&self, key: &str, value: PodResources) -> Result<()>;
    /// Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<PodResources>>;
}

/// File-backed [`Storage`] implementation.
pub struct DiskStorage {
    path: PathBuf,
    entries: RwLock<HashMap<String, PodResources>>,
}

impl DiskStorage {
    /// Open the store, loading any existing state from disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();

        if path.exists() {
            let mut file = File::open(&path)
                .with_context(|| format!("failed to open store file {:?}", path))?;
            let mut data = Vec::new();
            file.read_to_end(&mut data).context("failed to read store file")?;
            if !data.is_empty() {
                entries = serde_json::from_slice(&data).context("failed to decode store file")?;
            }
            info!(path = %path.display(), records = entries.len(), "loaded resource store");
        }

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &HashMap<String, PodResources>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory {:?}", parent))?;
        }

        let json = serde_json::to_vec(entries).context("failed to encode store")?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("failed to create temp store file {:?}", temp_path))?;
        file.write_all(&json).context("failed to write store")?;
        file.sync_all().context("failed to sync store")?;

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("failed to rename {:?} to {:?}", temp_path, self.path))?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for DiskStorage {
    fn get(&self, key: &str) -> Result<Option<PodResources>> {
        let entries = self.entries.read().expect("store lock poisoned");
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: PodResources) -> Result<()> {
        let mut entries = self.entries.write().expect("store lock poisoned");
        entries.insert(key.to_string(), value);
        self.persist(&entries)?;
        debug!(key = %key, records = entries.len(), "store put");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().expect("store lock poisoned");
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
            debug!(key = %key, records = entries.len(), "store delete");
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<PodResources>> {
        let entries = self.entries.read().expect("store lock poisoned");
        Ok(entries.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::IpSet;
    use crate::models::{EipInfo, PodInfo, PodNetworkType, ResourceItem, ResourceType};

    fn record(ns: &str, name: &str) -> PodResources {
        PodResources {
            pod_info: PodInfo {
                namespace: ns.to_string(),
                name: name.to_string(),
                pod_network_type: PodNetworkType::VpcIp,
                pod_eni: false,
                eip_info: EipInfo::default(),
                tc_ingress: 0,
                tc_egress: 0,
                network_priority: String::new(),
                ip_stick_time: 0,
                pod_ips: IpSet::default(),
                sandbox_exited: false,
            },
            resources: vec![ResourceItem::new(ResourceType::Veth, "veth-1")],
            net_ns: Some("/var/run/netns/x".to_string()),
            container_id: Some("abc".to_string()),
        }
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStorage::open(dir.path().join("resources.json")).unwrap();

        store.put("default/web-0", record("default", "web-0")).unwrap();
        let got = store.get("default/web-0").unwrap().unwrap();
        assert_eq!(got.pod_info.name, "web-0");
        assert_eq!(got.container_id.as_deref(), Some("abc"));

        store.delete("default/web-0").unwrap();
        assert!(store.get("default/web-0").unwrap().is_none());

        // deleting again is fine
        store.delete("default/web-0").unwrap();
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");

        {
            let store = DiskStorage::open(&path).unwrap();
            store.put("default/web-0", record("default", "web-0")).unwrap();
            store.put("kube-system/dns-1", record("kube-system", "dns-1")).unwrap();
        }

        let store = DiskStorage::open(&path).unwrap();
        let mut names: Vec<String> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.pod_info.key())
            .collect();
        names.sort();
        assert_eq!(names, vec!["default/web-0", "kube-system/dns-1"]);
    }

    #[test]
    fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStorage::open(dir.path().join("resources.json")).unwrap();
        assert!(store.get("no/such").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }
}
