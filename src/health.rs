//! Read-only health reporting over a registry snapshot.

use crate::error::Result;
use crate::node::{NodeInfo, NodeStatus};
use serde::{Deserialize, Serialize};

/// Summary counters returned by `Cluster::stats`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    pub total_nodes: usize,
    /// Nodes whose status is exactly `Active`
    pub active_nodes: usize,
    pub total_tasks_processed: u64,
    /// Mean task latency in milliseconds
    pub avg_latency: f64,
}

/// Per-node entry of a [`HealthReport`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub id: String,
    /// Integer discriminant of the node status
    pub status: u32,
    pub load: f32,
    pub memory: u64,
    pub latency: f32,
}

/// Cluster health snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub nodes: usize,
    /// Nodes that are active or busy
    pub active: usize,
    pub tasks: u64,
    #[serde(rename = "avgLatency")]
    pub avg_latency: f64,
    pub details: Vec<NodeHealth>,
}

impl HealthReport {
    pub fn from_nodes(nodes: &[NodeInfo], total_tasks: u64, avg_latency: f64) -> Self {
        let details = nodes
            .iter()
            .map(|node| NodeHealth {
                id: node.id.to_string(),
                status: node.status.code(),
                load: node.metrics.current_load,
                memory: node.metrics.memory_used,
                latency: node.metrics.avg_latency,
            })
            .collect();

        Self {
            nodes: nodes.len(),
            active: nodes.iter().filter(|n| n.status.is_live()).count(),
            tasks: total_tasks,
            avg_latency,
            details,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Entries for nodes in `status`
    pub fn with_status(&self, status: NodeStatus) -> impl Iterator<Item = &NodeHealth> {
        let code = status.code();
        self.details.iter().filter(move |d| d.status == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRole;

    #[test]
    fn test_report_counts_busy_as_active() {
        let mut busy = NodeInfo::new("w1", "h", 1, NodeRole::Worker).with_status(NodeStatus::Busy);
        busy.metrics.memory_used = 2048;
        let nodes = vec![
            NodeInfo::new("coord", "h", 0, NodeRole::Coordinator),
            busy,
            NodeInfo::new("w2", "h", 2, NodeRole::Worker).with_status(NodeStatus::Failed),
        ];

        let report = HealthReport::from_nodes(&nodes, 7, 12.5);
        assert_eq!(report.nodes, 3);
        assert_eq!(report.active, 2);
        assert_eq!(report.details[1].memory, 2048);
        assert_eq!(report.with_status(NodeStatus::Failed).count(), 1);
    }

    #[test]
    fn test_report_json_shape() {
        let nodes = vec![NodeInfo::new("w1", "h", 1, NodeRole::Worker)
            .with_status(NodeStatus::Busy)
            .with_load(0.5)];
        let json = HealthReport::from_nodes(&nodes, 3, 4.0).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["nodes"], 1);
        assert_eq!(value["active"], 1);
        assert_eq!(value["tasks"], 3);
        assert_eq!(value["avgLatency"], 4.0);
        assert_eq!(value["details"][0]["id"], "w1");
        assert_eq!(value["details"][0]["status"], NodeStatus::Busy.code());
        assert_eq!(value["details"][0]["load"], 0.5);
    }
}
