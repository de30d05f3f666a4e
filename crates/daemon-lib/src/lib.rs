//! Core library for the podnet node daemon
//!
//! This crate provides the daemon's building blocks:
//! - The request coordinator behind the CNI-facing gRPC service
//! - Pluggable resource managers (ENI, ENI-IP, veth, EIP)
//! - The durable pod-to-resource store
//! - Background reconcilers: garbage collection and the period checker
//! - Health checks and metrics

pub mod cloud;
pub mod cni;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod ip;
pub mod kubernetes;
pub mod link;
pub mod manager;
pub mod mapping;
pub mod models;
pub mod observability;
pub mod pool;
pub mod rpc;
pub mod service;
pub mod storage;

pub use error::{ResourceError, ServiceError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::DaemonMetrics;
pub use service::{GrpcService, NetworkService, NetworkServiceBuilder};
