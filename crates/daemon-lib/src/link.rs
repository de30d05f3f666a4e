//! Kernel route and rule cleanup
//!
//! After an ENI-IP expires, stale policy rules and host routes for its
//! address may linger. The GC deletes them best-effort through this
//! boundary; the real netlink work stays outside the coordinator.

use std::net::IpAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait RouteCleanup: Send + Sync {
    /// Delete every policy rule matching the address.
    async fn delete_rules_by_ip(&self, ip: IpAddr) -> Result<()>;

    /// Delete the host route for the address.
    async fn delete_route_by_ip(&self, ip: IpAddr) -> Result<()>;
}

/// `ip(8)`-backed cleanup.
pub struct IpCommandCleanup;

impl IpCommandCleanup {
    async fn run(args: &[&str]) -> Result<bool> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .context("failed to run ip command")?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl RouteCleanup for IpCommandCleanup {
    async fn delete_rules_by_ip(&self, ip: IpAddr) -> Result<()> {
        let target = ip.to_string();
        // several rules may reference the address; delete until none match
        for _ in 0..16 {
            if !Self::run(&["rule", "del", "to", &target]).await? {
                break;
            }
            debug!(ip = %target, "deleted ip rule");
        }
        for _ in 0..16 {
            if !Self::run(&["rule", "del", "from", &target]).await? {
                break;
            }
        }
        Ok(())
    }

    async fn delete_route_by_ip(&self, ip: IpAddr) -> Result<()> {
        let target = ip.to_string();
        if Self::run(&["route", "del", &target]).await? {
            debug!(ip = %target, "deleted host route");
        }
        Ok(())
    }
}

/// Cleanup that does nothing; for tests and non-Linux hosts.
#[derive(Default)]
pub struct NoopCleanup {
    pub deleted: std::sync::Mutex<Vec<IpAddr>>,
}

#[async_trait]
impl RouteCleanup for NoopCleanup {
    async fn delete_rules_by_ip(&self, ip: IpAddr) -> Result<()> {
        self.deleted.lock().unwrap().push(ip);
        Ok(())
    }

    async fn delete_route_by_ip(&self, _ip: IpAddr) -> Result<()> {
        Ok(())
    }
}
