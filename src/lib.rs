//! # Nimbus
//!
//! Coordination layer for running quantized language-model inference across
//! a cluster of heterogeneous machines: membership, model partitioning, task
//! scheduling and fault tolerance. Model execution itself is supplied by the
//! caller through [`InferenceModel`].

pub mod cluster;
pub mod communication;
pub mod config;
pub mod error;
pub mod fault_tolerance;
pub mod health;
pub mod load_balancer;
pub mod node;
pub mod partition;
pub mod scheduler;

pub use cluster::{Cluster, ClusterSettings, RestoreSummary};
pub use communication::{CommProtocol, Connection, Frame, MessageType, Transport};
pub use config::DistributedConfig;
pub use error::{ClusterError, Result};
pub use fault_tolerance::FaultToleranceMode;
pub use health::{ClusterStats, HealthReport};
pub use load_balancer::{LoadBalanceStrategy, LoadStatistics};
pub use node::{NodeCapability, NodeId, NodeInfo, NodeRole, NodeStatus};
pub use partition::{ModelDescriptor, ModelPartition, PartitionStrategy};
pub use scheduler::{ExecutionOptions, GenerationParams, InferenceModel, TOKEN_SENTINEL};
