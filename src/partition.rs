use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};

/// Strategy for splitting a model across nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// One partition per layer, spread round-robin across nodes
    LayerWise,
    /// Every node holds a slice of every layer
    TensorParallel,
    /// Consecutive layers grouped into one stage per node
    Pipeline,
    /// Every node holds the full model
    DataParallel,
    /// Currently planned as data-parallel
    Hybrid,
}

impl PartitionStrategy {
    pub fn code(self) -> u32 {
        match self {
            PartitionStrategy::LayerWise => 0,
            PartitionStrategy::TensorParallel => 1,
            PartitionStrategy::Pipeline => 2,
            PartitionStrategy::DataParallel => 3,
            PartitionStrategy::Hybrid => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PartitionStrategy::LayerWise),
            1 => Some(PartitionStrategy::TensorParallel),
            2 => Some(PartitionStrategy::Pipeline),
            3 => Some(PartitionStrategy::DataParallel),
            4 => Some(PartitionStrategy::Hybrid),
            _ => None,
        }
    }
}

/// Shape of a model as far as planning is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub layer_count: usize,
    pub hidden_size: usize,
    pub context_size: usize,
}

impl ModelDescriptor {
    pub fn new(layer_count: usize, hidden_size: usize, context_size: usize) -> Self {
        Self {
            layer_count,
            hidden_size,
            context_size,
        }
    }
}

/// Pipeline layout: which stage runs each layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub depth: usize,
    pub layer_to_stage: Vec<usize>,
}

/// Tensor-parallel layout: group size and per-layer split width
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorParallelPlan {
    pub group_size: usize,
    pub split_dims: Vec<usize>,
}

/// A plan mapping model partitions to node indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPartition {
    pub strategy: PartitionStrategy,
    /// Layers held by each partition
    pub partition_sizes: Vec<usize>,
    /// Node index assigned to each partition
    pub node_assignments: Vec<usize>,
    pub pipeline: Option<PipelinePlan>,
    pub tensor_parallel: Option<TensorParallelPlan>,
}

impl ModelPartition {
    /// Plan a partition for `node_count` registered nodes.
    ///
    /// Planning is pure: it never contacts nodes and does not install the
    /// result anywhere.
    pub fn plan(model: &ModelDescriptor, strategy: PartitionStrategy, node_count: usize) -> Result<Self> {
        if node_count == 0 {
            return Err(ClusterError::NoNodeAvailable);
        }
        if model.layer_count == 0 {
            return Err(ClusterError::ConfigRejected(
                "model must have at least one layer".to_string(),
            ));
        }

        let partition = match strategy {
            PartitionStrategy::LayerWise => Self::layer_wise(model, node_count),
            PartitionStrategy::Pipeline => Self::pipeline(model, node_count),
            PartitionStrategy::TensorParallel => Self::tensor_parallel(model, node_count),
            PartitionStrategy::DataParallel | PartitionStrategy::Hybrid => {
                Self::data_parallel(model, node_count, strategy)
            }
        };
        Ok(partition)
    }

    fn layer_wise(model: &ModelDescriptor, node_count: usize) -> Self {
        Self {
            strategy: PartitionStrategy::LayerWise,
            partition_sizes: vec![1; model.layer_count],
            node_assignments: (0..model.layer_count).map(|layer| layer % node_count).collect(),
            pipeline: None,
            tensor_parallel: None,
        }
    }

    fn pipeline(model: &ModelDescriptor, depth: usize) -> Self {
        let layers_per_stage = (model.layer_count / depth).max(1);
        let layer_to_stage: Vec<usize> = (0..model.layer_count)
            .map(|layer| (layer / layers_per_stage).min(depth - 1))
            .collect();

        let mut partition_sizes = vec![0; depth];
        for &stage in &layer_to_stage {
            partition_sizes[stage] += 1;
        }

        Self {
            strategy: PartitionStrategy::Pipeline,
            partition_sizes,
            node_assignments: (0..depth).collect(),
            pipeline: Some(PipelinePlan { depth, layer_to_stage }),
            tensor_parallel: None,
        }
    }

    fn tensor_parallel(model: &ModelDescriptor, group_size: usize) -> Self {
        let split = (model.hidden_size / group_size).max(1);
        Self {
            strategy: PartitionStrategy::TensorParallel,
            partition_sizes: vec![model.layer_count; group_size],
            node_assignments: (0..group_size).collect(),
            pipeline: None,
            tensor_parallel: Some(TensorParallelPlan {
                group_size,
                split_dims: vec![split; model.layer_count],
            }),
        }
    }

    fn data_parallel(model: &ModelDescriptor, node_count: usize, strategy: PartitionStrategy) -> Self {
        Self {
            strategy,
            partition_sizes: vec![model.layer_count; node_count],
            node_assignments: (0..node_count).collect(),
            pipeline: None,
            tensor_parallel: None,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.node_assignments.len()
    }

    /// Check every assignment against the current node count
    pub fn validate(&self, node_count: usize) -> Result<()> {
        if self.partition_sizes.len() != self.node_assignments.len() {
            return Err(ClusterError::ConfigRejected(format!(
                "{} partition sizes for {} assignments",
                self.partition_sizes.len(),
                self.node_assignments.len()
            )));
        }
        if let Some(&index) = self.node_assignments.iter().find(|&&index| index >= node_count) {
            return Err(ClusterError::ConfigRejected(format!(
                "partition assigned to node {} but only {} nodes exist",
                index, node_count
            )));
        }
        Ok(())
    }

    /// Distinct node indices referenced by the plan, ascending
    pub fn assigned_nodes(&self) -> Vec<usize> {
        let mut nodes = self.node_assignments.clone();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Partition indices held by a node
    pub fn partitions_for_node(&self, node: usize) -> Vec<usize> {
        self.node_assignments
            .iter()
            .enumerate()
            .filter(|&(_, &assigned)| assigned == node)
            .map(|(partition, _)| partition)
            .collect()
    }

    /// Node that runs `layer`, if the plan places layers on specific nodes
    pub fn node_for_layer(&self, layer: usize) -> Option<usize> {
        match self.strategy {
            PartitionStrategy::LayerWise => self.node_assignments.get(layer).copied(),
            PartitionStrategy::Pipeline => {
                let stage = *self.pipeline.as_ref()?.layer_to_stage.get(layer)?;
                self.node_assignments.get(stage).copied()
            }
            _ => None,
        }
    }

    /// Move every partition held by `from` onto `targets`, round-robin.
    /// Returns how many partitions moved.
    pub fn reassign(&mut self, from: usize, targets: &[usize]) -> usize {
        let targets: Vec<usize> = targets.iter().copied().filter(|&t| t != from).collect();
        if targets.is_empty() {
            return 0;
        }

        let mut moved = 0;
        for assigned in self.node_assignments.iter_mut().filter(|a| **a == from) {
            *assigned = targets[moved % targets.len()];
            moved += 1;
        }
        moved
    }

    /// Fix up assignments after node `removed` left the table and later
    /// indices shifted down. Partitions that lived on the removed node move
    /// to `fallback`.
    pub fn shift_after_removal(&mut self, removed: usize, fallback: usize) {
        for assigned in self.node_assignments.iter_mut() {
            if *assigned == removed {
                *assigned = fallback;
            } else if *assigned > removed {
                *assigned -= 1;
            }
        }
    }
}
