use thiserror::Error;

/// Why an inbound telemetry message could not be handled.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Unusable message; dropped and never partially persisted.
    #[error("malformed telemetry message: {0}")]
    Malformed(String),

    /// The local store failed; the message must not be acknowledged.
    #[error("local store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Failure of a remote document-store write.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Connectivity problem: the whole sync cycle backs off.
    #[error("remote store unreachable: {0}")]
    Unreachable(String),

    #[error("remote store rejected the write: {0}")]
    Rejected(String),

    #[error("invalid outbox payload: {0}")]
    InvalidPayload(String),
}

#[derive(Error, Debug)]
pub enum ThresholdError {
    #[error("threshold_overrides must be a JSON object")]
    InvalidOverrides,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("local store error: {0:#}")]
    Store(#[from] anyhow::Error),

    /// State and outbox are committed; only the retained broadcast failed.
    #[error("config broadcast failed: {0:#}")]
    Publish(anyhow::Error),
}
