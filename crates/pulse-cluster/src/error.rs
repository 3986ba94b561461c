use crate::types::PeerId;

/// Cluster-level errors.
///
/// Heartbeat decode failures and stale sequence numbers never surface
/// here; the validator drops those messages silently.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("host has no listen addresses")]
    NoListenAddrs,

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("dial {peer} failed: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("dial {peer} timed out")]
    DialTimeout { peer: PeerId },

    #[error("{operation} timed out")]
    OperationTimeout { operation: &'static str },

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("substrate error: {0}")]
    Substrate(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<rmp_serde::encode::Error> for ClusterError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ClusterError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ClusterError::Deserialization(e.to_string())
    }
}

/// Outcome of a failed publish.
///
/// `Closed` is terminal for the announce loop; anything else is retried
/// on the next tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("topic closed")]
    Closed,

    #[error("publish failed: {0}")]
    Other(String),
}
