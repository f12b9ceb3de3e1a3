//! Error types shared across the crate.

use hickory_server::proto::error::ProtoError;
use thiserror::Error;

/// Errors returned by the service orchestrator.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{0}' added more than once")]
    DuplicateService(String),

    #[error("dependency '{dependency}' of service '{service}' not yet defined")]
    MissingDependency { dependency: String, service: String },

    #[error("service run cancelled")]
    Cancelled,
}

/// Errors raised while handling mDNS traffic.
#[derive(Debug, Error)]
pub enum MdnsError {
    #[error("mdns message error: {0}")]
    Proto(#[from] ProtoError),

    #[error("mdns socket error: {0}")]
    Io(#[from] std::io::Error),
}
