//! Cluster configuration.
//!
//! A [`DistributedConfig`] is supplied once when a cluster is created and is
//! never mutated afterwards; runtime-adjustable knobs (fault-tolerance mode,
//! load-balance strategy, SIMD and compression settings) live in the cluster's
//! own settings and start from the values given here.

use crate::communication::{CommProtocol, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::{ClusterError, Result};
use crate::fault_tolerance::FaultToleranceMode;
use crate::load_balancer::LoadBalanceStrategy;
use crate::partition::PartitionStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port the coordinator listens on
pub const DEFAULT_COORDINATOR_PORT: u16 = 8888;

/// Default base port for worker nodes
pub const DEFAULT_WORKER_BASE_PORT: u16 = 8900;

/// Default node table capacity
pub const DEFAULT_MAX_NODES: usize = 64;

/// Tuning for a distributed inference cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub partition_strategy: PartitionStrategy,
    pub load_balance_strategy: LoadBalanceStrategy,
    pub fault_tolerance: FaultToleranceMode,
    pub protocol: CommProtocol,

    /// Node table capacity
    pub max_nodes: usize,
    pub coordinator_port: u16,
    pub worker_base_port: u16,
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a node is marked failed
    pub max_missed_heartbeats: u32,

    /// Largest payload accepted on the wire, in bytes
    pub max_message_size: usize,
    pub task_timeout: Duration,
    pub max_retries: u32,

    pub enable_compression: bool,
    pub enable_encryption: bool,
    pub enable_checkpointing: bool,

    pub batch_size: usize,
    pub pipeline_width: usize,
    /// Load imbalance factor above which the cluster reports itself imbalanced
    pub load_balance_threshold: f32,

    /// Destination for periodic checkpoints written by the coordinator
    pub checkpoint_path: Option<PathBuf>,
    pub checkpoint_interval: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            partition_strategy: PartitionStrategy::LayerWise,
            load_balance_strategy: LoadBalanceStrategy::LeastLoaded,
            fault_tolerance: FaultToleranceMode::Checkpoint,
            protocol: CommProtocol::Tcp,
            max_nodes: DEFAULT_MAX_NODES,
            coordinator_port: DEFAULT_COORDINATOR_PORT,
            worker_base_port: DEFAULT_WORKER_BASE_PORT,
            heartbeat_interval: Duration::from_secs(5),
            max_missed_heartbeats: 3,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            task_timeout: Duration::from_secs(30),
            max_retries: 3,
            enable_compression: false,
            enable_encryption: false,
            enable_checkpointing: true,
            batch_size: 8,
            pipeline_width: 2,
            load_balance_threshold: 0.8,
            checkpoint_path: None,
            checkpoint_interval: Duration::from_secs(60),
        }
    }
}

impl DistributedConfig {
    /// Check that every limit is usable
    pub fn validate(&self) -> Result<()> {
        if self.max_nodes == 0 {
            return Err(ClusterError::ConfigRejected("max_nodes must be positive".to_string()));
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(ClusterError::ConfigRejected(format!(
                "max_message_size must be in 1..={}",
                u32::MAX
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ClusterError::ConfigRejected(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ClusterError::ConfigRejected(
                "max_missed_heartbeats must be positive".to_string(),
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(ClusterError::ConfigRejected("task_timeout must be positive".to_string()));
        }
        if self.batch_size == 0 || self.pipeline_width == 0 {
            return Err(ClusterError::ConfigRejected(
                "batch_size and pipeline_width must be positive".to_string(),
            ));
        }
        if !(self.load_balance_threshold.is_finite() && self.load_balance_threshold > 0.0) {
            return Err(ClusterError::ConfigRejected(
                "load_balance_threshold must be a positive number".to_string(),
            ));
        }
        if self.checkpoint_path.is_some() && self.checkpoint_interval.is_zero() {
            return Err(ClusterError::ConfigRejected(
                "checkpoint_interval must be positive when checkpoint_path is set".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a JSON document; absent fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
