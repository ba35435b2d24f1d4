use crate::communication::CommProtocol;
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Stable identifier for a node in the cluster.
///
/// Node indices shift whenever a node is removed; the id never does, so
/// anything held across a removal should be re-resolved through
/// [`NodeRegistry::position`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(format!("node-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Role a node plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Accepts joins and dispatches tasks
    Coordinator,
    /// Executes inference tasks
    Worker,
    /// Aggregates results from workers
    Aggregator,
    /// Handles external requests
    Gateway,
}

impl NodeRole {
    pub fn code(self) -> u32 {
        match self {
            NodeRole::Coordinator => 0,
            NodeRole::Worker => 1,
            NodeRole::Aggregator => 2,
            NodeRole::Gateway => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(NodeRole::Coordinator),
            1 => Some(NodeRole::Worker),
            2 => Some(NodeRole::Aggregator),
            3 => Some(NodeRole::Gateway),
            _ => None,
        }
    }
}

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Initializing,
    /// Ready to accept tasks
    Active,
    /// Holding a deployed partition or processing tasks
    Busy,
    /// Missed too many heartbeats
    Failed,
    Disconnected,
}

impl NodeStatus {
    pub fn code(self) -> u32 {
        match self {
            NodeStatus::Initializing => 0,
            NodeStatus::Active => 1,
            NodeStatus::Busy => 2,
            NodeStatus::Failed => 3,
            NodeStatus::Disconnected => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(NodeStatus::Initializing),
            1 => Some(NodeStatus::Active),
            2 => Some(NodeStatus::Busy),
            3 => Some(NodeStatus::Failed),
            4 => Some(NodeStatus::Disconnected),
            _ => None,
        }
    }

    /// Active or busy
    pub fn is_live(self) -> bool {
        matches!(self, NodeStatus::Active | NodeStatus::Busy)
    }
}

/// Static hardware capabilities of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapability {
    pub cpu_cores: u32,
    /// Available memory in bytes
    pub memory_bytes: u64,
    /// Relative compute power (1.0 = baseline)
    pub compute_power: f32,
    pub has_gpu: bool,
    pub gpu_count: u32,
}

impl NodeCapability {
    /// Create a new NodeCapability with validation
    pub fn new(
        cpu_cores: u32,
        memory_bytes: u64,
        compute_power: f32,
        gpu_count: u32,
    ) -> std::result::Result<Self, NodeError> {
        if cpu_cores == 0 {
            return Err(NodeError::InvalidCapability("Must have at least one CPU core".to_string()));
        }
        if memory_bytes == 0 {
            return Err(NodeError::InvalidCapability("Memory must be positive".to_string()));
        }
        if !(compute_power.is_finite() && compute_power > 0.0) {
            return Err(NodeError::InvalidCapability("Compute power must be positive".to_string()));
        }

        Ok(Self {
            cpu_cores,
            memory_bytes,
            compute_power,
            has_gpu: gpu_count > 0,
            gpu_count,
        })
    }

    /// Memory per CPU core in bytes
    pub fn memory_per_core(&self) -> u64 {
        self.memory_bytes / self.cpu_cores.max(1) as u64
    }
}

impl Default for NodeCapability {
    /// Baseline machine: 4 cores, 8 GiB, no GPU
    fn default() -> Self {
        Self {
            cpu_cores: 4,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            compute_power: 1.0,
            has_gpu: false,
            gpu_count: 0,
        }
    }
}

/// Live performance metrics reported by a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// CPU/GPU load, 0.0 to 1.0
    pub current_load: f32,
    pub memory_used: u64,
    pub active_tasks: u32,
    /// Average task latency in milliseconds
    pub avg_latency: f32,
    /// Latency to the coordinator in milliseconds
    pub network_latency: f32,
    /// Available bandwidth in MB/s
    pub network_bandwidth: f32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Everything the cluster knows about one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub hostname: String,
    pub port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub protocol: CommProtocol,
    pub capability: NodeCapability,
    pub metrics: NodeMetrics,
    /// Unix timestamp of the last heartbeat, in milliseconds
    pub last_heartbeat_ms: i64,
    /// Consecutive missed heartbeats
    pub missed_heartbeats: u32,
}

impl NodeInfo {
    /// An active node with baseline capability
    pub fn new(id: impl Into<NodeId>, hostname: impl Into<String>, port: u16, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            port,
            role,
            status: NodeStatus::Active,
            protocol: CommProtocol::Tcp,
            capability: NodeCapability::default(),
            metrics: NodeMetrics::default(),
            last_heartbeat_ms: 0,
            missed_heartbeats: 0,
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_capability(mut self, capability: NodeCapability) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_load(mut self, load: f32) -> Self {
        self.metrics.current_load = load.clamp(0.0, 1.0);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Advance the heartbeat clock; never moves backwards
    pub fn touch_heartbeat(&mut self, now_ms: i64) {
        self.last_heartbeat_ms = self.last_heartbeat_ms.max(now_ms);
    }
}

/// Ordered node table with a secondary id index.
///
/// Indices are dense (`0..len`) and shift down by one for every node after a
/// removed entry.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: Vec<NodeInfo>,
    positions: HashMap<NodeId, usize>,
    capacity: usize,
}

impl NodeRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            positions: HashMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node, stamping its heartbeat with `now_ms`
    pub fn add(&mut self, mut info: NodeInfo, now_ms: i64) -> Result<usize> {
        if self.nodes.len() >= self.capacity {
            return Err(ClusterError::CapacityExceeded {
                max_nodes: self.capacity,
            });
        }
        if self.positions.contains_key(&info.id) {
            return Err(ClusterError::DuplicateNode(info.id));
        }

        info.touch_heartbeat(now_ms);
        info.missed_heartbeats = 0;

        let index = self.nodes.len();
        self.positions.insert(info.id.clone(), index);
        self.nodes.push(info);
        Ok(index)
    }

    /// Remove the node at `index`, shifting later nodes down
    pub fn remove(&mut self, index: usize) -> Result<NodeInfo> {
        self.check_index(index)?;

        let removed = self.nodes.remove(index);
        self.positions.remove(&removed.id);
        for (position, node) in self.nodes.iter().enumerate().skip(index) {
            self.positions.insert(node.id.clone(), position);
        }
        Ok(removed)
    }

    pub fn get(&self, index: usize) -> Option<&NodeInfo> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(index)
    }

    /// Current index of a node
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn get_by_id(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.position(id).and_then(|index| self.nodes.get(index))
    }

    pub fn update_load(
        &mut self,
        index: usize,
        load: f32,
        memory_used: u64,
        active_tasks: u32,
        now_ms: i64,
    ) -> Result<()> {
        self.check_index(index)?;
        let node = &mut self.nodes[index];
        node.metrics.current_load = load.clamp(0.0, 1.0);
        node.metrics.memory_used = memory_used;
        node.metrics.active_tasks = active_tasks;
        node.touch_heartbeat(now_ms);
        Ok(())
    }

    /// Record a heartbeat; a failed node that heartbeats again is active
    pub fn record_heartbeat(&mut self, index: usize, now_ms: i64) -> Result<()> {
        self.check_index(index)?;
        let node = &mut self.nodes[index];
        node.touch_heartbeat(now_ms);
        node.missed_heartbeats = 0;
        if node.status == NodeStatus::Failed {
            node.status = NodeStatus::Active;
        }
        Ok(())
    }

    pub fn set_status(&mut self, index: usize, status: NodeStatus) -> Result<()> {
        self.check_index(index)?;
        self.nodes[index].status = status;
        Ok(())
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }

    pub fn count_with_status(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Indices of nodes that are active or busy
    pub fn live_indices(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.status.is_live())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn total_memory_used(&self) -> u64 {
        self.nodes.iter().map(|n| n.metrics.memory_used).sum()
    }

    /// Replace the whole table, keeping at most `capacity` nodes.
    /// Returns how many nodes were kept.
    pub fn replace_all(&mut self, nodes: Vec<NodeInfo>) -> usize {
        self.nodes.clear();
        self.positions.clear();
        for node in nodes.into_iter().take(self.capacity) {
            if self.positions.contains_key(&node.id) {
                tracing::warn!(node_id = %node.id, "Skipping duplicate node while replacing table");
                continue;
            }
            self.positions.insert(node.id.clone(), self.nodes.len());
            self.nodes.push(node);
        }
        self.nodes.len()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.nodes.len() {
            return Err(ClusterError::InvalidIndex {
                index,
                node_count: self.nodes.len(),
            });
        }
        Ok(())
    }
}

/// Current wall-clock time in Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Invalid node capability: {0}")]
    InvalidCapability(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str) -> NodeInfo {
        NodeInfo::new(id, "127.0.0.1", 8900, NodeRole::Worker)
    }

    #[test]
    fn test_capability_validation() {
        assert!(NodeCapability::new(8, 16 << 30, 1.5, 1).is_ok());
        assert!(NodeCapability::new(0, 16 << 30, 1.5, 1).is_err());
        assert!(NodeCapability::new(8, 0, 1.5, 1).is_err());
        assert!(NodeCapability::new(8, 16 << 30, 0.0, 1).is_err());

        let cap = NodeCapability::new(8, 16 << 30, 1.5, 2).unwrap();
        assert!(cap.has_gpu);
        assert_eq!(cap.memory_per_core(), 2 << 30);
    }

    #[test]
    fn test_registry_never_exceeds_capacity() {
        let mut registry = NodeRegistry::new(3);

        for i in 0..3 {
            assert_eq!(registry.add(worker(&format!("w{}", i)), 0).unwrap(), i);
        }

        let before: Vec<_> = registry.nodes().to_vec();
        let result = registry.add(worker("w3"), 0);
        assert!(matches!(result, Err(ClusterError::CapacityExceeded { max_nodes: 3 })));
        assert_eq!(registry.nodes(), before.as_slice());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut registry = NodeRegistry::new(4);
        registry.add(worker("w0"), 0).unwrap();
        assert!(matches!(
            registry.add(worker("w0"), 0),
            Err(ClusterError::DuplicateNode(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_shifts_indices_down() {
        let mut registry = NodeRegistry::new(8);
        for i in 0..4 {
            registry.add(worker(&format!("w{}", i)), 0).unwrap();
        }

        let removed = registry.remove(1).unwrap();
        assert_eq!(removed.id.as_str(), "w1");
        assert_eq!(registry.get(1).unwrap().id.as_str(), "w2");
        assert_eq!(registry.position(&NodeId::from("w3")), Some(2));
        assert_eq!(registry.position(&NodeId::from("w1")), None);

        registry.remove(2).unwrap();
        assert!(registry.get(2).is_none());
        assert!(matches!(registry.remove(5), Err(ClusterError::InvalidIndex { .. })));
    }

    #[test]
    fn test_active_count_tracks_status() {
        let mut registry = NodeRegistry::new(8);
        registry.add(worker("a"), 0).unwrap();
        registry.add(worker("b").with_status(NodeStatus::Busy), 0).unwrap();
        registry.add(worker("c").with_status(NodeStatus::Failed), 0).unwrap();

        assert_eq!(registry.count_with_status(NodeStatus::Active), 1);
        assert_eq!(registry.live_indices(), vec![0, 1]);

        registry.set_status(0, NodeStatus::Failed).unwrap();
        assert_eq!(registry.count_with_status(NodeStatus::Active), 0);
    }

    #[test]
    fn test_update_load_refreshes_heartbeat() {
        let mut registry = NodeRegistry::new(2);
        registry.add(worker("a"), 1_000).unwrap();

        registry.update_load(0, 1.7, 4096, 3, 2_000).unwrap();
        let node = registry.get(0).unwrap();
        assert_eq!(node.metrics.current_load, 1.0);
        assert_eq!(node.metrics.memory_used, 4096);
        assert_eq!(node.metrics.active_tasks, 3);
        assert_eq!(node.last_heartbeat_ms, 2_000);

        assert!(registry.update_load(1, 0.5, 0, 0, 0).is_err());
    }

    #[test]
    fn test_heartbeat_is_monotonic_and_revives_failed_node() {
        let mut registry = NodeRegistry::new(2);
        registry.add(worker("a"), 5_000).unwrap();
        registry.set_status(0, NodeStatus::Failed).unwrap();
        registry.get_mut(0).unwrap().missed_heartbeats = 3;

        registry.record_heartbeat(0, 4_000).unwrap();
        let node = registry.get(0).unwrap();
        assert_eq!(node.last_heartbeat_ms, 5_000);
        assert_eq!(node.missed_heartbeats, 0);
        assert_eq!(node.status, NodeStatus::Active);
    }

    #[test]
    fn test_replace_all_clamps_to_capacity() {
        let mut registry = NodeRegistry::new(2);
        let kept = registry.replace_all(vec![worker("a"), worker("b"), worker("c")]);
        assert_eq!(kept, 2);
        assert_eq!(registry.position(&NodeId::from("b")), Some(1));
        assert!(registry.get_by_id(&NodeId::from("c")).is_none());
    }
}
