use crate::node::{NodeInfo, NodeStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How the balancer scores candidate nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Rotate through active nodes
    RoundRobin,
    /// Prefer the node with the lowest current load
    LeastLoaded,
    /// Spare capacity scaled by compute power
    Weighted,
    /// Weighted, penalized by average task latency
    Dynamic,
}

impl LoadBalanceStrategy {
    pub fn code(self) -> u32 {
        match self {
            LoadBalanceStrategy::RoundRobin => 0,
            LoadBalanceStrategy::LeastLoaded => 1,
            LoadBalanceStrategy::Weighted => 2,
            LoadBalanceStrategy::Dynamic => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(LoadBalanceStrategy::RoundRobin),
            1 => Some(LoadBalanceStrategy::LeastLoaded),
            2 => Some(LoadBalanceStrategy::Weighted),
            3 => Some(LoadBalanceStrategy::Dynamic),
            _ => None,
        }
    }
}

/// Score a node under `strategy`; higher is better
pub fn score(node: &NodeInfo, strategy: LoadBalanceStrategy) -> f32 {
    let spare = 1.0 - node.metrics.current_load;
    match strategy {
        LoadBalanceStrategy::RoundRobin => 1.0,
        LoadBalanceStrategy::LeastLoaded => spare,
        LoadBalanceStrategy::Weighted => spare * node.capability.compute_power,
        LoadBalanceStrategy::Dynamic => {
            spare * node.capability.compute_power / (1.0 + node.metrics.avg_latency)
        }
    }
}

/// Selects the node that should run the next task.
///
/// Only `Active` nodes are eligible. Scoring strategies pick the maximum score
/// with ties going to the lowest index. Round-robin keeps a rotation cursor
/// and hands out the first eligible node at or after it; concurrent callers
/// may occasionally land on the same node.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a node index, skipping anything in `exclude`
    pub fn select(
        &self,
        nodes: &[NodeInfo],
        strategy: LoadBalanceStrategy,
        exclude: &[usize],
    ) -> Option<usize> {
        let eligible = |index: usize| {
            nodes[index].status == NodeStatus::Active && !exclude.contains(&index)
        };

        if strategy == LoadBalanceStrategy::RoundRobin {
            return self.rotate(nodes.len(), eligible);
        }

        let mut best: Option<(usize, f32)> = None;
        for index in (0..nodes.len()).filter(|&i| eligible(i)) {
            let candidate = score(&nodes[index], strategy);
            match best {
                Some((_, top)) if candidate <= top => {}
                _ => best = Some((index, candidate)),
            }
        }
        best.map(|(index, _)| index)
    }

    fn rotate(&self, len: usize, eligible: impl Fn(usize) -> bool) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed) % len;
        let chosen = (start..len).chain(0..start).find(|&i| eligible(i))?;
        self.cursor.store(chosen + 1, Ordering::Relaxed);
        Some(chosen)
    }
}

/// Statistics about load distribution across live nodes
#[derive(Debug, Clone, PartialEq)]
pub struct LoadStatistics {
    pub min_load: f32,
    pub max_load: f32,
    pub avg_load: f32,
    pub std_dev: f32,
    pub num_nodes: usize,
}

impl LoadStatistics {
    /// Compute statistics over active and busy nodes
    pub fn from_nodes(nodes: &[NodeInfo]) -> Self {
        let loads: Vec<f32> = nodes
            .iter()
            .filter(|n| n.status.is_live())
            .map(|n| n.metrics.current_load)
            .collect();

        if loads.is_empty() {
            return Self {
                min_load: 0.0,
                max_load: 0.0,
                avg_load: 0.0,
                std_dev: 0.0,
                num_nodes: 0,
            };
        }

        let count = loads.len() as f32;
        let min_load = loads.iter().copied().fold(f32::INFINITY, f32::min);
        let max_load = loads.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let avg_load = loads.iter().sum::<f32>() / count;
        let variance = loads.iter().map(|l| (l - avg_load).powi(2)).sum::<f32>() / count;

        Self {
            min_load,
            max_load,
            avg_load,
            std_dev: variance.sqrt(),
            num_nodes: loads.len(),
        }
    }

    /// Calculate the load imbalance factor (closer to 0 is better)
    pub fn imbalance_factor(&self) -> f32 {
        if self.avg_load == 0.0 {
            0.0
        } else {
            (self.max_load - self.min_load) / self.avg_load
        }
    }

    pub fn is_imbalanced(&self, threshold: f32) -> bool {
        self.imbalance_factor() > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeCapability, NodeRole};

    fn node(id: &str, load: f32, power: f32) -> NodeInfo {
        NodeInfo::new(id, "127.0.0.1", 8900, NodeRole::Worker)
            .with_load(load)
            .with_capability(NodeCapability::new(4, 8 << 30, power, 0).unwrap())
    }

    #[test]
    fn test_weighted_prefers_spare_compute() {
        let lb = LoadBalancer::new();
        let nodes = vec![node("a", 0.8, 1.0), node("b", 0.2, 2.0)];

        assert_eq!(lb.select(&nodes, LoadBalanceStrategy::Weighted, &[]), Some(1));
        assert!((score(&nodes[0], LoadBalanceStrategy::Weighted) - 0.2).abs() < 1e-6);
        assert!((score(&nodes[1], LoadBalanceStrategy::Weighted) - 1.6).abs() < 1e-6);
    }

    #[test]
    fn test_least_loaded_ties_go_to_lowest_index() {
        let lb = LoadBalancer::new();
        let nodes = vec![node("a", 0.5, 1.0), node("b", 0.3, 1.0), node("c", 0.3, 4.0)];

        assert_eq!(lb.select(&nodes, LoadBalanceStrategy::LeastLoaded, &[]), Some(1));
    }

    #[test]
    fn test_dynamic_penalizes_latency() {
        let lb = LoadBalancer::new();
        let mut nodes = vec![node("a", 0.0, 1.0), node("b", 0.0, 1.0)];
        nodes[0].metrics.avg_latency = 100.0;

        assert_eq!(lb.select(&nodes, LoadBalanceStrategy::Dynamic, &[]), Some(1));
    }

    #[test]
    fn test_only_active_nodes_are_eligible() {
        let lb = LoadBalancer::new();
        let nodes = vec![
            node("a", 0.0, 8.0).with_status(NodeStatus::Busy),
            node("b", 0.9, 1.0),
            node("c", 0.0, 8.0).with_status(NodeStatus::Failed),
        ];

        assert_eq!(lb.select(&nodes, LoadBalanceStrategy::Weighted, &[]), Some(1));
        assert_eq!(lb.select(&nodes, LoadBalanceStrategy::Weighted, &[1]), None);
        assert_eq!(lb.select(&[], LoadBalanceStrategy::LeastLoaded, &[]), None);
    }

    #[test]
    fn test_round_robin_rotates() {
        let lb = LoadBalancer::new();
        let nodes = vec![
            node("a", 0.0, 1.0),
            node("b", 0.0, 1.0).with_status(NodeStatus::Failed),
            node("c", 0.0, 1.0),
        ];

        let picks: Vec<_> = (0..4)
            .map(|_| lb.select(&nodes, LoadBalanceStrategy::RoundRobin, &[]).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
        assert_eq!(lb.select(&nodes, LoadBalanceStrategy::RoundRobin, &[0]), Some(2));
    }

    #[test]
    fn test_load_statistics() {
        let nodes = vec![
            node("a", 0.3, 1.0),
            node("b", 0.7, 1.0),
            node("c", 0.0, 1.0).with_status(NodeStatus::Disconnected),
        ];

        let stats = LoadStatistics::from_nodes(&nodes);
        assert_eq!(stats.num_nodes, 2);
        assert!((stats.min_load - 0.3).abs() < 1e-6);
        assert!((stats.max_load - 0.7).abs() < 1e-6);
        assert!((stats.avg_load - 0.5).abs() < 1e-6);
        assert!((stats.std_dev - 0.2).abs() < 1e-6);
        assert!((stats.imbalance_factor() - 0.8).abs() < 1e-5);
        assert!(stats.is_imbalanced(0.5));
        assert!(!stats.is_imbalanced(0.9));
    }

    #[test]
    fn test_empty_statistics_are_balanced() {
        let stats = LoadStatistics::from_nodes(&[]);
        assert_eq!(stats.num_nodes, 0);
        assert_eq!(stats.imbalance_factor(), 0.0);
    }
}
