//! Task bookkeeping and generation request types.
//!
//! The cluster turns every generation request into a [`DistributedTask`] that
//! lives in the [`TaskQueue`] from submission until it completes or fails.

use crate::communication::MessageType;
use crate::error::{ClusterError, Result};
use crate::node::NodeId;
use crate::partition::ModelDescriptor;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Value written into token slots that were not generated
pub const TOKEN_SENTINEL: i32 = -1;

/// Default number of tasks the queue holds
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMethod {
    Greedy,
    TopK,
    #[default]
    TopP,
    Temperature,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStyle {
    #[default]
    Neutral,
    Formal,
    Creative,
    Concise,
    Descriptive,
}

/// Parameters for one text generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub sampling: SamplingMethod,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    /// 0 picks a random seed
    pub seed: u32,
    pub prompt_tokens: Vec<i32>,
    pub style: GenerationStyle,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 32,
            sampling: SamplingMethod::default(),
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            seed: 0,
            prompt_tokens: Vec::new(),
            style: GenerationStyle::default(),
        }
    }
}

impl GenerationParams {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_prompt(mut self, prompt_tokens: Vec<i32>) -> Self {
        self.prompt_tokens = prompt_tokens;
        self
    }
}

/// Per-call execution policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Run on the local model once remote retries are exhausted
    pub allow_local_fallback: bool,
    pub priority: u32,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            allow_local_fallback: false,
            priority: 1,
        }
    }
}

impl ExecutionOptions {
    pub fn with_local_fallback(mut self) -> Self {
        self.allow_local_fallback = true;
        self
    }
}

/// The model a node executes locally.
///
/// Implementations own the weights and the forward pass; the cluster only
/// needs the model's shape and a way to run one request.
pub trait InferenceModel: Send + Sync {
    fn descriptor(&self) -> ModelDescriptor;

    /// Generate at most `params.max_tokens` tokens
    fn generate(&self, params: &GenerationParams) -> Result<Vec<i32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One unit of work tracked by the cluster
#[derive(Debug, Clone)]
pub struct DistributedTask {
    pub id: u64,
    pub task_type: MessageType,
    /// Index of the executing node at assignment time
    pub assigned_index: Option<usize>,
    pub assigned_node: Option<NodeId>,
    pub priority: u32,
    pub payload: Bytes,
    pub payload_size: usize,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub completed: bool,
    pub retry_count: u32,
    pub status: TaskStatus,
}

impl DistributedTask {
    /// Milliseconds from start to completion
    pub fn latency_ms(&self) -> Option<i64> {
        Some(self.completed_at_ms? - self.started_at_ms?)
    }
}

/// Bounded queue of in-flight tasks, ordered by priority then age
#[derive(Debug)]
pub struct TaskQueue {
    tasks: Vec<DistributedTask>,
    capacity: usize,
    next_id: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Vec::new(),
            capacity,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue a new task and return its id
    pub fn submit(&mut self, task_type: MessageType, priority: u32, payload: Bytes, now_ms: i64) -> Result<u64> {
        if self.tasks.len() >= self.capacity {
            return Err(ClusterError::QueueFull {
                capacity: self.capacity,
            });
        }

        let id = self.next_id;
        self.next_id += 1;

        let task = DistributedTask {
            id,
            task_type,
            assigned_index: None,
            assigned_node: None,
            priority,
            payload_size: payload.len(),
            payload,
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            completed: false,
            retry_count: 0,
            status: TaskStatus::Pending,
        };

        // stable insert: behind every task of equal or higher priority
        let position = self
            .tasks
            .iter()
            .position(|t| t.priority < priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(position, task);
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<&DistributedTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// The pending task that should run next
    pub fn next_pending(&self) -> Option<&DistributedTask> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Pending)
    }

    /// Record the node a task runs on; a reassignment counts as a retry
    pub fn assign(&mut self, id: u64, index: usize, node: NodeId, now_ms: i64) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        if task.status == TaskStatus::Running {
            task.retry_count += 1;
        }
        task.assigned_index = Some(index);
        task.assigned_node = Some(node);
        task.started_at_ms = Some(now_ms);
        task.status = TaskStatus::Running;
        true
    }

    /// Remove a finished task and return its final record
    pub fn finish(&mut self, id: u64, succeeded: bool, now_ms: i64) -> Option<DistributedTask> {
        let position = self.tasks.iter().position(|t| t.id == id)?;
        let mut task = self.tasks.remove(position);
        task.completed = succeeded;
        task.completed_at_ms = Some(now_ms);
        task.status = if succeeded {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        Some(task)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Encode tokens as little-endian i32s
pub fn encode_tokens(tokens: &[i32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(tokens.len() * 4);
    for &token in tokens {
        buf.put_i32_le(token);
    }
    buf.freeze()
}

/// Decode a token payload holding at most `max_tokens` tokens
pub fn decode_tokens(mut payload: &[u8], max_tokens: usize) -> Result<Vec<i32>> {
    if payload.len() % 4 != 0 {
        return Err(ClusterError::SerializationFailure(format!(
            "token payload of {} bytes is not a whole number of tokens",
            payload.len()
        )));
    }
    let count = payload.len() / 4;
    if count > max_tokens {
        return Err(ClusterError::SerializationFailure(format!(
            "{} tokens returned for a limit of {}",
            count, max_tokens
        )));
    }

    let mut tokens = Vec::with_capacity(count);
    while payload.has_remaining() {
        tokens.push(payload.get_i32_le());
    }
    Ok(tokens)
}

/// Fit generated tokens into a row of `width`, filling the rest with the sentinel
pub fn pad_row(mut tokens: Vec<i32>, width: usize) -> Vec<i32> {
    tokens.truncate(width);
    tokens.resize(width, TOKEN_SENTINEL);
    tokens
}
