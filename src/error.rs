use crate::communication::CommunicationError;
use crate::node::NodeId;
use std::time::Duration;

/// Errors surfaced by cluster-level operations
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Node table is full ({max_nodes} nodes)")]
    CapacityExceeded { max_nodes: usize },

    #[error("Invalid node index {index} (node count {node_count})")]
    InvalidIndex { index: usize, node_count: usize },

    #[error("Node {0} is already registered")]
    DuplicateNode(NodeId),

    #[error("Task queue is full ({capacity} tasks)")]
    QueueFull { capacity: usize },

    #[error("No node available for task")]
    NoNodeAvailable,

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Configuration rejected: {0}")]
    ConfigRejected(String),

    #[error("Checkpointing is disabled in the cluster configuration")]
    CheckpointingDisabled,

    #[error("No local model attached")]
    ModelUnavailable,

    #[error("Cluster is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CommunicationError> for ClusterError {
    fn from(err: CommunicationError) -> Self {
        match err {
            CommunicationError::Timeout(after) => ClusterError::Timeout(after),
            CommunicationError::UnknownMessageType(_)
            | CommunicationError::BufferTooSmall { .. }
            | CommunicationError::Payload(_) => ClusterError::SerializationFailure(err.to_string()),
            other => ClusterError::TransportFailure(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::SerializationFailure(err.to_string())
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;
