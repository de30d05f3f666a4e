//! Error kinds crossing the coordinator's boundaries
//!
//! `ResourceError` is what managers speak; `ServiceError` is what the gRPC
//! surface speaks. Background loops never surface either, they log and
//! retry on the next period.

use thiserror::Error;

/// Errors from resource managers and the pools behind them.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The resource is not in a state the operation applies to, e.g. a
    /// release for an id the pool no longer tracks. Callers treat this as
    /// "already gone" and continue.
    #[error("resource {0} is in an invalid state")]
    InvalidState(String),

    #[error("resource {0} not found")]
    NotFound(String),

    /// Cloud or pool-refill failure. Transient from the caller's view.
    #[error("upstream error: {0}")]
    Upstream(#[from] anyhow::Error),
}

impl ResourceError {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, ResourceError::InvalidState(_))
    }
}

/// Errors surfaced to the gRPC client.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Daemon mode and pod network type do not go together.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another call for the same pod is in flight; the plugin retries.
    #[error("pod {0} resource processing")]
    ResourceBusy(String),

    /// Kubernetes or cloud upstream failed; the plugin retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[source] anyhow::Error),

    /// The PodEni resource is missing or has no allocations yet.
    #[error("pod eni not ready: {0}")]
    CrdNotReady(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::Configuration(_) => tonic::Status::failed_precondition(err.to_string()),
            ServiceError::ResourceBusy(_) => tonic::Status::aborted(err.to_string()),
            ServiceError::UpstreamUnavailable(_) => tonic::Status::unavailable(err.to_string()),
            ServiceError::CrdNotReady(_) => tonic::Status::failed_precondition(err.to_string()),
            ServiceError::Internal(_) => tonic::Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_is_detectable() {
        assert!(ResourceError::InvalidState("eni-1".into()).is_invalid_state());
        assert!(!ResourceError::NotFound("eni-1".into()).is_invalid_state());
    }

    #[test]
    fn busy_maps_to_aborted() {
        let status: tonic::Status = ServiceError::ResourceBusy("default/web-0".into()).into();
        assert_eq!(status.code(), tonic::Code::Aborted);
        assert!(status.message().contains("resource processing"));
    }
}
