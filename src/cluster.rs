//! The cluster aggregate: node table, active partition, task queue,
//! statistics, peer connections and the coordinator/worker lifecycle.
//!
//! All shared state sits behind one `RwLock`. No socket or file I/O happens
//! while it is held: data is copied out, the lock is released, and results
//! are written back under a fresh lock.

use crate::communication::{
    split_request_id, tag_payload, transport_for, Acceptor, CommunicationError, Connection, Frame,
    FrameCodec, MessageType, RawStream,
};
use crate::config::DistributedConfig;
use crate::error::{ClusterError, Result};
use crate::fault_tolerance::{self, CheckpointData, FaultToleranceMode};
use crate::health::{ClusterStats, HealthReport};
use crate::load_balancer::{LoadBalanceStrategy, LoadBalancer, LoadStatistics};
use crate::node::{now_millis, NodeId, NodeInfo, NodeRegistry, NodeRole, NodeStatus};
use crate::partition::{ModelDescriptor, ModelPartition, PartitionStrategy};
use crate::scheduler::{
    decode_tokens, encode_tokens, pad_row, ExecutionOptions, GenerationParams, InferenceModel, TaskQueue,
    TaskStatus, TOKEN_SENTINEL,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Weight of the newest sample in a node's latency average
const LATENCY_EMA_ALPHA: f32 = 0.2;

/// Highest accepted compression level
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Runtime-adjustable settings, shared with peers over MODEL_SYNC
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub fault_tolerance: FaultToleranceMode,
    pub load_balance_strategy: LoadBalanceStrategy,
    pub simd_enabled: bool,
    /// 0 disables compression
    pub compression_level: u32,
    pub encryption_enabled: bool,
}

impl ClusterSettings {
    fn from_config(config: &DistributedConfig) -> Self {
        Self {
            fault_tolerance: config.fault_tolerance,
            load_balance_strategy: config.load_balance_strategy,
            simd_enabled: true,
            compression_level: if config.enable_compression { 6 } else { 0 },
            encryption_enabled: config.enable_encryption,
        }
    }
}

/// Payload of a MODEL_SYNC message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum SyncMessage {
    Settings(ClusterSettings),
    Partition(ModelPartition),
}

/// Coordinator's reply to a NODE_JOIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinAck {
    pub node_index: usize,
    pub coordinator_id: NodeId,
}

/// Payload of a LOAD_REPORT message
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub load: f32,
    pub memory_used: u64,
    pub active_tasks: u32,
}

/// Outcome of a checkpoint restore
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreSummary {
    pub nodes_restored: usize,
    /// Nodes in the file beyond this cluster's capacity
    pub nodes_dropped: usize,
    pub total_tasks: u64,
    /// Configuration the checkpoint was written with; the live config is kept
    pub saved_config: DistributedConfig,
}

struct ClusterState {
    registry: NodeRegistry,
    local: Option<NodeId>,
    coordinator: Option<NodeId>,
    is_coordinator: bool,
    running: bool,
    partition: Option<ModelPartition>,
    tasks: TaskQueue,
    settings: ClusterSettings,
    total_tasks: u64,
    avg_latency_ms: f64,
}

impl ClusterState {
    fn local_index(&self) -> Option<usize> {
        self.local.as_ref().and_then(|id| self.registry.position(id))
    }
}

struct Inner {
    config: DistributedConfig,
    codec: FrameCodec,
    state: RwLock<ClusterState>,
    balancer: LoadBalancer,
    connections: Mutex<HashMap<NodeId, Arc<Connection>>>,
    model: RwLock<Option<Arc<dyn InferenceModel>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Handle to a distributed inference cluster. Cloning is cheap and every
/// clone refers to the same cluster.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Cluster")
            .field("nodes", &state.registry.len())
            .field("local", &state.local)
            .field("is_coordinator", &state.is_coordinator)
            .field("running", &state.running)
            .finish()
    }
}

impl Cluster {
    pub fn new(config: DistributedConfig) -> Result<Self> {
        config.validate()?;

        let state = ClusterState {
            registry: NodeRegistry::new(config.max_nodes),
            local: None,
            coordinator: None,
            is_coordinator: false,
            running: false,
            partition: None,
            tasks: TaskQueue::default(),
            settings: ClusterSettings::from_config(&config),
            total_tasks: 0,
            avg_latency_ms: 0.0,
        };
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                codec: FrameCodec::new(config.max_message_size),
                config,
                state: RwLock::new(state),
                balancer: LoadBalancer::new(),
                connections: Mutex::new(HashMap::new()),
                model: RwLock::new(None),
                background: Mutex::new(Vec::new()),
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &DistributedConfig {
        &self.inner.config
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.state.read().is_coordinator
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.read().running
    }

    pub fn local_node_id(&self) -> Option<NodeId> {
        self.inner.state.read().local.clone()
    }

    pub fn local_index(&self) -> Option<usize> {
        self.inner.state.read().local_index()
    }

    /// Coordinator this node belongs to; the local id on a coordinator
    pub fn coordinator_id(&self) -> Option<NodeId> {
        self.inner.state.read().coordinator.clone()
    }

    /// Model used for tasks that run on this node
    pub fn attach_model(&self, model: Arc<dyn InferenceModel>) {
        let descriptor = model.descriptor();
        info!(
            layers = descriptor.layer_count,
            hidden = descriptor.hidden_size,
            context = descriptor.context_size,
            "Attached local model"
        );
        *self.inner.model.write() = Some(model);
    }

    pub fn local_model(&self) -> Option<Arc<dyn InferenceModel>> {
        self.inner.model.read().clone()
    }

    // ----- node registry -----

    /// Register a node; its heartbeat clock starts now
    pub fn add_node(&self, info: NodeInfo) -> Result<usize> {
        let id = info.id.clone();
        let index = self.inner.state.write().registry.add(info, now_millis())?;
        info!(node_id = %id, index, "Node added");
        Ok(index)
    }

    /// Remove a node and close its connection. Later nodes shift down one
    /// index and partition assignments follow them.
    pub async fn remove_node(&self, index: usize) -> Result<NodeInfo> {
        let removed = {
            let mut state = self.inner.state.write();
            let removed = state.registry.remove(index)?;

            if state.local.as_ref() == Some(&removed.id) {
                state.local = None;
            }
            if state.registry.is_empty() {
                state.partition = None;
            } else if let Some(partition) = state.partition.as_mut() {
                partition.shift_after_removal(index, 0);
            }
            removed
        };

        let connection = self.inner.connections.lock().remove(&removed.id);
        if let Some(connection) = connection {
            connection.close().await;
        }

        info!(node_id = %removed.id, index, "Node removed");
        Ok(removed)
    }

    /// Record a load report; also counts as a heartbeat
    pub fn update_node_load(&self, index: usize, load: f32, memory_used: u64, active_tasks: u32) -> Result<()> {
        self.inner
            .state
            .write()
            .registry
            .update_load(index, load, memory_used, active_tasks, now_millis())
    }

    pub fn node_info(&self, index: usize) -> Option<NodeInfo> {
        self.inner.state.read().registry.get(index).cloned()
    }

    /// Current index of a node
    pub fn node_index(&self, id: &NodeId) -> Option<usize> {
        self.inner.state.read().registry.position(id)
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.state.read().registry.nodes().to_vec()
    }

    pub fn node_count(&self) -> usize {
        self.inner.state.read().registry.len()
    }

    pub fn stats(&self) -> ClusterStats {
        let state = self.inner.state.read();
        ClusterStats {
            total_nodes: state.registry.len(),
            active_nodes: state.registry.count_with_status(NodeStatus::Active),
            total_tasks_processed: state.total_tasks,
            avg_latency: state.avg_latency_ms,
        }
    }

    /// Memory used by the local node and by the whole cluster
    pub fn memory_usage(&self) -> (u64, u64) {
        let state = self.inner.state.read();
        let local = state
            .local_index()
            .and_then(|index| state.registry.get(index))
            .map(|node| node.metrics.memory_used)
            .unwrap_or(0);
        (local, state.registry.total_memory_used())
    }

    pub fn health_report(&self) -> HealthReport {
        let state = self.inner.state.read();
        HealthReport::from_nodes(state.registry.nodes(), state.total_tasks, state.avg_latency_ms)
    }

    pub fn load_statistics(&self) -> LoadStatistics {
        LoadStatistics::from_nodes(self.inner.state.read().registry.nodes())
    }

    pub fn is_load_imbalanced(&self) -> bool {
        self.load_statistics()
            .is_imbalanced(self.inner.config.load_balance_threshold)
    }

    /// Tasks submitted but not yet finished, whether waiting or running
    pub fn in_flight_tasks(&self) -> usize {
        self.inner.state.read().tasks.len()
    }

    /// Tasks submitted but not yet assigned to a node
    pub fn pending_tasks(&self) -> usize {
        self.inner.state.read().tasks.count_with_status(TaskStatus::Pending)
    }

    // ----- partitioning -----

    /// Plan a partition over the nodes registered right now
    pub fn partition_model(&self, model: &ModelDescriptor, strategy: PartitionStrategy) -> Result<ModelPartition> {
        let node_count = self.inner.state.read().registry.len();
        ModelPartition::plan(model, strategy, node_count)
    }

    /// Install `partition` as the active plan and mark its nodes busy.
    ///
    /// Fails without touching the current plan if any assignment is not a
    /// valid node index. Connected peers are sent the new plan afterwards.
    pub async fn deploy(&self, partition: ModelPartition) -> Result<()> {
        let targets = {
            let mut state = self.inner.state.write();
            partition.validate(state.registry.len())?;

            let mut targets = Vec::new();
            for index in partition.assigned_nodes() {
                if let Some(node) = state.registry.get_mut(index) {
                    if !matches!(node.status, NodeStatus::Failed | NodeStatus::Disconnected) {
                        node.status = NodeStatus::Busy;
                    }
                    targets.push(node.id.clone());
                }
            }

            info!(
                strategy = ?partition.strategy,
                partitions = partition.num_partitions(),
                "Deployed partition"
            );
            state.partition = Some(partition.clone());
            targets
        };

        let payload = serde_json::to_vec(&SyncMessage::Partition(partition))?;
        self.broadcast(MessageType::ModelSync, &payload, Some(&targets)).await;
        Ok(())
    }

    pub fn current_partition(&self) -> Option<ModelPartition> {
        self.inner.state.read().partition.clone()
    }

    // ----- runtime settings -----

    pub fn settings(&self) -> ClusterSettings {
        self.inner.state.read().settings
    }

    pub async fn set_fault_tolerance(&self, mode: FaultToleranceMode) -> Result<()> {
        self.update_settings(|s| s.fault_tolerance = mode).await
    }

    pub async fn set_load_balancing(&self, strategy: LoadBalanceStrategy) -> Result<()> {
        self.update_settings(|s| s.load_balance_strategy = strategy).await
    }

    pub async fn enable_simd(&self, enabled: bool) -> Result<()> {
        self.update_settings(|s| s.simd_enabled = enabled).await
    }

    pub async fn set_compression(&self, level: u32) -> Result<()> {
        if level > MAX_COMPRESSION_LEVEL {
            return Err(ClusterError::ConfigRejected(format!(
                "compression level {} is outside 0..={}",
                level, MAX_COMPRESSION_LEVEL
            )));
        }
        self.update_settings(|s| s.compression_level = level).await
    }

    async fn update_settings(&self, change: impl FnOnce(&mut ClusterSettings)) -> Result<()> {
        let (settings, is_coordinator) = {
            let mut state = self.inner.state.write();
            change(&mut state.settings);
            (state.settings, state.is_coordinator)
        };
        info!(?settings, "Cluster settings changed");

        if is_coordinator {
            let payload = serde_json::to_vec(&SyncMessage::Settings(settings))?;
            self.broadcast(MessageType::ModelSync, &payload, None).await;
        }
        Ok(())
    }

    /// Send to every connected peer (or only `targets`); failures are logged
    async fn broadcast(&self, msg_type: MessageType, payload: &[u8], targets: Option<&[NodeId]>) {
        let peers: Vec<(NodeId, Arc<Connection>)> = {
            let connections = self.inner.connections.lock();
            connections
                .iter()
                .filter(|(id, _)| targets.map_or(true, |t| t.contains(id)))
                .map(|(id, conn)| (id.clone(), Arc::clone(conn)))
                .collect()
        };

        for (id, connection) in peers {
            if let Err(e) = connection.send(msg_type, payload).await {
                warn!(node_id = %id, ?msg_type, error = %e, "Broadcast failed");
            }
        }
    }

    // ----- task execution -----

    /// Run one generation request somewhere in the cluster.
    ///
    /// Remote attempts that time out or hit a transport error are retried up
    /// to `max_retries` times. In migration and adaptive modes each retry
    /// avoids nodes that already failed the task. Once retries run out the
    /// local model is used only if `options` allow it.
    pub async fn generate_text(&self, params: &GenerationParams, options: ExecutionOptions) -> Result<Vec<i32>> {
        let payload = Bytes::from(serde_json::to_vec(params)?);

        let (task_id, strategy, migrate) = {
            let mut state = self.inner.state.write();
            let strategy = state.settings.load_balance_strategy;
            let migrate = state.settings.fault_tolerance.migrates();
            let id = state
                .tasks
                .submit(MessageType::TaskRequest, options.priority, payload.clone(), now_millis())?;
            (id, strategy, migrate)
        };

        let mut failed_nodes: Vec<NodeId> = Vec::new();
        let mut last_error = ClusterError::NoNodeAvailable;

        for attempt in 0..=self.inner.config.max_retries {
            let selection = {
                let mut state = self.inner.state.write();
                let exclude: Vec<usize> = if migrate {
                    failed_nodes
                        .iter()
                        .filter_map(|id| state.registry.position(id))
                        .collect()
                } else {
                    Vec::new()
                };

                let chosen = self
                    .inner
                    .balancer
                    .select(state.registry.nodes(), strategy, &exclude)
                    .and_then(|index| Some((index, state.registry.get(index)?.id.clone())));

                if let Some((index, id)) = &chosen {
                    state.tasks.assign(task_id, *index, id.clone(), now_millis());
                }
                chosen.map(|(index, id)| {
                    let is_local = state.local.as_ref() == Some(&id);
                    (index, id, is_local)
                })
            };

            let Some((index, node_id, is_local)) = selection else {
                if attempt == 0 {
                    self.finish_task(task_id, None, false);
                    return Err(ClusterError::NoNodeAvailable);
                }
                break;
            };

            debug!(task_id, attempt, index, node_id = %node_id, is_local, "Dispatching task");

            let outcome = if is_local {
                self.run_local(params).await
            } else {
                self.run_remote(task_id, &node_id, &payload, params.max_tokens).await
            };

            match outcome {
                Ok(tokens) => {
                    self.finish_task(task_id, Some(&node_id), true);
                    return Ok(tokens);
                }
                Err(e @ (ClusterError::Timeout(_) | ClusterError::TransportFailure(_))) if !is_local => {
                    warn!(task_id, attempt, node_id = %node_id, error = %e, "Task attempt failed");
                    failed_nodes.push(node_id);
                    last_error = e;
                }
                Err(e) => {
                    self.finish_task(task_id, Some(&node_id), false);
                    return Err(e);
                }
            }
        }

        if options.allow_local_fallback {
            warn!(task_id, error = %last_error, "Remote execution exhausted, falling back to local model");
            let local_id = self.local_node_id();
            let outcome = self.run_local(params).await;
            self.finish_task(task_id, local_id.as_ref(), outcome.is_ok());
            return outcome;
        }

        self.finish_task(task_id, None, false);
        Err(last_error)
    }

    /// Run each request independently.
    ///
    /// Every row of the result is `max_tokens_per_item` wide; slots that were
    /// not generated (including whole rows of failed items) hold
    /// [`TOKEN_SENTINEL`]. Returns how many items succeeded.
    pub async fn batch_inference(
        &self,
        batch: &[GenerationParams],
        max_tokens_per_item: usize,
        options: ExecutionOptions,
    ) -> (usize, Vec<Vec<i32>>) {
        let mut processed = 0;
        let mut results = Vec::with_capacity(batch.len());

        for (item, params) in batch.iter().enumerate() {
            let mut params = params.clone();
            params.max_tokens = params.max_tokens.min(max_tokens_per_item);

            match self.generate_text(&params, options).await {
                Ok(tokens) => {
                    processed += 1;
                    results.push(pad_row(tokens, max_tokens_per_item));
                }
                Err(e) => {
                    warn!(item, error = %e, "Batch item failed");
                    results.push(vec![TOKEN_SENTINEL; max_tokens_per_item]);
                }
            }
        }

        (processed, results)
    }

    async fn run_local(&self, params: &GenerationParams) -> Result<Vec<i32>> {
        let model = self.local_model().ok_or(ClusterError::ModelUnavailable)?;
        let params = params.clone();
        let max_tokens = params.max_tokens;

        self.adjust_local_tasks(1);
        let joined = tokio::task::spawn_blocking(move || model.generate(&params)).await;
        self.adjust_local_tasks(-1);

        let mut tokens = joined
            .map_err(|e| ClusterError::TransportFailure(format!("local inference aborted: {}", e)))??;
        tokens.truncate(max_tokens);
        Ok(tokens)
    }

    /// Dispatch to a peer. The task id travels as the request id, so a late
    /// reply to an earlier attempt can only ever complete the same task.
    async fn run_remote(&self, task_id: u64, node_id: &NodeId, payload: &[u8], max_tokens: usize) -> Result<Vec<i32>> {
        let connection = self
            .inner
            .connections
            .lock()
            .get(node_id)
            .cloned()
            .ok_or_else(|| ClusterError::TransportFailure(format!("no connection to node {}", node_id)))?;

        let response = connection
            .request(MessageType::TaskRequest, task_id, payload, self.inner.config.task_timeout)
            .await?;

        match response.msg_type {
            MessageType::TaskResponse => decode_tokens(&response.payload, max_tokens),
            MessageType::ErrorReport => Err(ClusterError::TransportFailure(format!(
                "node {} reported: {}",
                node_id,
                String::from_utf8_lossy(&response.payload)
            ))),
            other => Err(ClusterError::SerializationFailure(format!(
                "unexpected {:?} in reply to a task request",
                other
            ))),
        }
    }

    fn adjust_local_tasks(&self, delta: i32) {
        let mut state = self.inner.state.write();
        if let Some(index) = state.local_index() {
            if let Some(node) = state.registry.get_mut(index) {
                node.metrics.active_tasks = node.metrics.active_tasks.saturating_add_signed(delta);
            }
        }
    }

    fn finish_task(&self, task_id: u64, node: Option<&NodeId>, succeeded: bool) {
        let mut state = self.inner.state.write();
        let Some(task) = state.tasks.finish(task_id, succeeded, now_millis()) else {
            return;
        };
        if !succeeded {
            return;
        }

        let latency = task.latency_ms().unwrap_or(0).max(0) as f64;
        state.total_tasks += 1;
        state.avg_latency_ms += (latency - state.avg_latency_ms) / state.total_tasks as f64;

        if let Some(index) = node.and_then(|id| state.registry.position(id)) {
            if let Some(entry) = state.registry.get_mut(index) {
                let previous = entry.metrics.avg_latency;
                entry.metrics.avg_latency = if previous == 0.0 {
                    latency as f32
                } else {
                    previous + LATENCY_EMA_ALPHA * (latency as f32 - previous)
                };
            }
        }
    }

    // ----- fault tolerance -----

    /// Count missed heartbeats as of `now_ms` and return nodes that just
    /// failed. In migration and adaptive modes their partitions move to live
    /// nodes.
    pub fn check_heartbeats(&self, now_ms: i64) -> Vec<NodeId> {
        let mut state = self.inner.state.write();
        let state = &mut *state;

        let failed = fault_tolerance::sweep_heartbeats(
            &mut state.registry,
            state.local.as_ref(),
            now_ms,
            self.inner.config.heartbeat_interval,
            self.inner.config.max_missed_heartbeats,
        );

        if !failed.is_empty() && state.settings.fault_tolerance.migrates() {
            if let Some(partition) = state.partition.as_mut() {
                fault_tolerance::migrate_partitions(partition, &failed, &state.registry);
            }
        }

        failed
            .iter()
            .filter_map(|&index| state.registry.get(index).map(|n| n.id.clone()))
            .collect()
    }

    /// Write the node table, task counter and configuration to `path`
    pub async fn create_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.inner.config.enable_checkpointing {
            return Err(ClusterError::CheckpointingDisabled);
        }

        let data = {
            let state = self.inner.state.read();
            CheckpointData {
                created_at: now_millis(),
                total_tasks: state.total_tasks,
                config: self.inner.config.clone(),
                nodes: state.registry.nodes().to_vec(),
            }
        };

        fault_tolerance::write_checkpoint(path.as_ref(), &data).await
    }

    /// Replace the node table and task counter from a checkpoint.
    ///
    /// Nodes beyond this cluster's capacity are dropped. All open
    /// connections are closed since they belong to the replaced table.
    pub async fn restore_checkpoint(&self, path: impl AsRef<Path>) -> Result<RestoreSummary> {
        let data = fault_tolerance::read_checkpoint(path.as_ref()).await?;
        let in_file = data.nodes.len();

        let nodes_restored = {
            let mut state = self.inner.state.write();
            let kept = state.registry.replace_all(data.nodes);
            state.total_tasks = data.total_tasks;

            if state.local_index().is_none() {
                state.local = None;
            }
            let node_count = state.registry.len();
            if state.partition.as_ref().is_some_and(|p| p.validate(node_count).is_err()) {
                state.partition = None;
            }
            kept
        };

        let connections: Vec<Arc<Connection>> = self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close().await;
        }

        info!(
            path = %path.as_ref().display(),
            nodes = nodes_restored,
            dropped = in_file - nodes_restored,
            "Checkpoint restored"
        );

        Ok(RestoreSummary {
            nodes_restored,
            nodes_dropped: in_file - nodes_restored,
            total_tasks: data.total_tasks,
            saved_config: data.config,
        })
    }

    // ----- lifecycle -----

    /// Listen for workers on `host` at the configured coordinator port
    /// (0 picks a free port) and register this node as coordinator.
    pub async fn start_coordinator(&self, host: &str) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(ClusterError::ConfigRejected("cluster is already running".to_string()));
        }

        let transport = transport_for(self.inner.config.protocol)?;
        let acceptor = transport
            .listen(&format!("{}:{}", host, self.inner.config.coordinator_port))
            .await?;
        let addr = acceptor.local_addr()?;

        let local = NodeInfo::new(NodeId::generate(), host, addr.port(), NodeRole::Coordinator);
        {
            let mut state = self.inner.state.write();
            state.registry.add(local.clone(), now_millis())?;
            state.local = Some(local.id.clone());
            state.coordinator = Some(local.id.clone());
            state.is_coordinator = true;
            state.running = true;
        }
        self.inner.shutdown.send_replace(false);

        let handles = vec![
            tokio::spawn(self.clone().accept_loop(acceptor)),
            tokio::spawn(self.clone().monitor_loop()),
            tokio::spawn(self.clone().checkpoint_loop()),
        ];
        self.inner.background.lock().extend(handles);

        info!(%addr, node_id = %local.id, "Coordinator started");
        Ok(addr)
    }

    /// Join the coordinator at `host:port` as `local`. Returns the index the
    /// coordinator assigned to this node.
    pub async fn join_cluster(&self, host: &str, port: u16, local: NodeInfo) -> Result<usize> {
        if self.is_running() {
            return Err(ClusterError::ConfigRejected("cluster is already running".to_string()));
        }

        let config = &self.inner.config;
        let transport = transport_for(config.protocol)?;
        let stream = transport
            .dial(&format!("{}:{}", host, port), config.task_timeout)
            .await?;
        let connection = Arc::new(Connection::new(stream, self.inner.codec));

        connection
            .send(MessageType::NodeJoin, &serde_json::to_vec(&local)?)
            .await?;
        let reply = connection
            .receive_timeout(config.max_message_size, config.task_timeout)
            .await?;

        let ack: JoinAck = match reply.msg_type {
            MessageType::NodeJoin => serde_json::from_slice(&reply.payload)?,
            MessageType::ErrorReport => {
                connection.close().await;
                return Err(ClusterError::TransportFailure(format!(
                    "coordinator rejected join: {}",
                    String::from_utf8_lossy(&reply.payload)
                )));
            }
            other => {
                connection.close().await;
                return Err(ClusterError::SerializationFailure(format!(
                    "unexpected {:?} in reply to join",
                    other
                )));
            }
        };

        {
            let mut state = self.inner.state.write();
            if state.registry.position(&local.id).is_none() {
                state.registry.add(local.clone(), now_millis())?;
            }
            state.local = Some(local.id.clone());
            state.coordinator = Some(ack.coordinator_id.clone());
            state.is_coordinator = false;
            state.running = true;
        }
        self.inner
            .connections
            .lock()
            .insert(ack.coordinator_id.clone(), Arc::clone(&connection));
        self.inner.shutdown.send_replace(false);

        let handles = vec![
            tokio::spawn(self.clone().worker_loop(Arc::clone(&connection))),
            tokio::spawn(self.clone().heartbeat_loop(connection)),
        ];
        self.inner.background.lock().extend(handles);

        info!(
            node_id = %local.id,
            coordinator = %ack.coordinator_id,
            index = ack.node_index,
            "Joined cluster"
        );
        Ok(ack.node_index)
    }

    /// Announce departure, stop background tasks and close every connection
    pub async fn leave_cluster(&self) -> Result<()> {
        let was_coordinator = {
            let mut state = self.inner.state.write();
            if !state.running {
                return Err(ClusterError::NotRunning);
            }
            state.running = false;
            state.is_coordinator
        };

        let goodbye = self
            .local_node_id()
            .map(|id| id.as_str().as_bytes().to_vec())
            .unwrap_or_default();
        self.broadcast(MessageType::NodeLeave, &goodbye, None).await;

        self.inner.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        let connections: Vec<Arc<Connection>> = self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.close().await;
        }

        {
            let mut state = self.inner.state.write();
            state.coordinator = None;
            state.is_coordinator = false;
        }

        info!(was_coordinator, "Left cluster");
        Ok(())
    }

    /// Leave if running; safe to call more than once
    pub async fn shutdown(&self) {
        match self.leave_cluster().await {
            Ok(()) | Err(ClusterError::NotRunning) => {}
            Err(e) => warn!(error = %e, "Error during shutdown"),
        }
    }

    // ----- background tasks -----

    async fn accept_loop(self, acceptor: Box<dyn Acceptor>) {
        let stop = stopped(self.inner.shutdown.subscribe());
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                accepted = acceptor.accept() => match accepted {
                    Ok(stream) => {
                        let cluster = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = cluster.serve_peer(stream).await {
                                warn!(error = %e, "Peer connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
        debug!("Accept loop stopped");
    }

    /// Coordinator side of one worker connection: join handshake, then
    /// apply whatever the worker reports until it leaves or disconnects.
    async fn serve_peer(self, stream: RawStream) -> Result<()> {
        let config = &self.inner.config;
        let connection = Arc::new(Connection::new(stream, self.inner.codec));

        let join = connection
            .receive_timeout(config.max_message_size, config.task_timeout)
            .await?;
        if join.msg_type != MessageType::NodeJoin {
            connection.close().await;
            return Err(ClusterError::SerializationFailure(format!(
                "expected a join from {}, got {:?}",
                connection.peer(),
                join.msg_type
            )));
        }

        let added = serde_json::from_slice::<NodeInfo>(&join.payload)
            .map_err(ClusterError::from)
            .and_then(|info| {
                let id = info.id.clone();
                let mut state = self.inner.state.write();
                let index = state.registry.add(info, now_millis())?;
                let coordinator = state.local.clone().unwrap_or_else(|| NodeId::from("coordinator"));
                Ok((id, index, coordinator, state.settings))
            });

        let (node_id, index, coordinator_id, settings) = match added {
            Ok(added) => added,
            Err(e) => {
                warn!(peer = %connection.peer(), error = %e, "Rejected join");
                let _ = connection.send(MessageType::ErrorReport, e.to_string().as_bytes()).await;
                connection.close().await;
                return Err(e);
            }
        };

        self.inner
            .connections
            .lock()
            .insert(node_id.clone(), Arc::clone(&connection));

        let ack = JoinAck {
            node_index: index,
            coordinator_id,
        };
        connection
            .send(MessageType::NodeJoin, &serde_json::to_vec(&ack)?)
            .await?;
        connection
            .send(MessageType::ModelSync, &serde_json::to_vec(&SyncMessage::Settings(settings))?)
            .await?;
        info!(node_id = %node_id, index, peer = %connection.peer(), "Node joined");

        self.peer_reader(node_id, connection).await;
        Ok(())
    }

    async fn peer_reader(&self, node_id: NodeId, connection: Arc<Connection>) {
        let stop = stopped(self.inner.shutdown.subscribe());
        tokio::pin!(stop);
        let limit = self.inner.config.max_message_size;

        loop {
            let frame = tokio::select! {
                _ = &mut stop => break,
                frame = connection.receive(limit) => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(CommunicationError::UnknownMessageType(code)) => {
                    warn!(node_id = %node_id, code, "Ignoring frame with unknown type");
                    continue;
                }
                Err(e) => {
                    if !connection.is_closed() {
                        warn!(node_id = %node_id, error = %e, "Lost connection to node");
                    }
                    self.mark_disconnected(&node_id, &connection).await;
                    break;
                }
            };

            match frame.msg_type {
                MessageType::Heartbeat => {
                    let mut state = self.inner.state.write();
                    if let Some(index) = state.registry.position(&node_id) {
                        let _ = state.registry.record_heartbeat(index, now_millis());
                    }
                }
                MessageType::LoadReport => match serde_json::from_slice::<LoadReport>(&frame.payload) {
                    Ok(report) => {
                        let mut state = self.inner.state.write();
                        if let Some(index) = state.registry.position(&node_id) {
                            let now = now_millis();
                            let _ = state.registry.update_load(
                                index,
                                report.load,
                                report.memory_used,
                                report.active_tasks,
                                now,
                            );
                            let _ = state.registry.record_heartbeat(index, now);
                        }
                    }
                    Err(e) => warn!(node_id = %node_id, error = %e, "Malformed load report"),
                },
                MessageType::NodeLeave => {
                    info!(node_id = %node_id, "Node left");
                    self.mark_disconnected(&node_id, &connection).await;
                    break;
                }
                MessageType::TaskResponse | MessageType::ErrorReport => {
                    if !connection.deliver_response(frame) {
                        debug!(node_id = %node_id, "Response matched no waiting task");
                    }
                }
                other => debug!(node_id = %node_id, msg_type = ?other, "Ignoring frame"),
            }
        }
    }

    async fn mark_disconnected(&self, node_id: &NodeId, connection: &Arc<Connection>) {
        {
            let mut state = self.inner.state.write();
            if let Some(index) = state.registry.position(node_id) {
                let _ = state.registry.set_status(index, NodeStatus::Disconnected);
            }
        }
        {
            let mut connections = self.inner.connections.lock();
            if connections.get(node_id).is_some_and(|c| Arc::ptr_eq(c, connection)) {
                connections.remove(node_id);
            }
        }
        connection.close().await;
    }

    /// Worker side: serve task requests and apply MODEL_SYNC updates
    async fn worker_loop(self, connection: Arc<Connection>) {
        let stop = stopped(self.inner.shutdown.subscribe());
        tokio::pin!(stop);
        let limit = self.inner.config.max_message_size;

        loop {
            let frame = tokio::select! {
                _ = &mut stop => break,
                frame = connection.receive(limit) => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(CommunicationError::UnknownMessageType(code)) => {
                    warn!(code, "Ignoring frame with unknown type");
                    continue;
                }
                Err(e) => {
                    if !connection.is_closed() {
                        warn!(error = %e, "Lost connection to coordinator");
                    }
                    break;
                }
            };

            match frame.msg_type {
                MessageType::TaskRequest => {
                    let (request_id, body) = match split_request_id(&frame.payload) {
                        Ok(parts) => parts,
                        Err(e) => {
                            warn!(error = %e, "Dropping task request without an id");
                            continue;
                        }
                    };
                    let (msg_type, reply) = match self.serve_task(&body).await {
                        Ok(tokens) => (MessageType::TaskResponse, encode_tokens(&tokens)),
                        Err(e) => {
                            warn!(request_id, error = %e, "Task failed on this node");
                            (MessageType::ErrorReport, Bytes::from(e.to_string()))
                        }
                    };
                    if let Err(e) = connection.send(msg_type, &tag_payload(request_id, &reply)).await {
                        warn!(request_id, error = %e, "Could not send task reply");
                    }
                }
                MessageType::ModelSync => self.apply_sync(&frame),
                MessageType::NodeLeave => {
                    info!("Coordinator is leaving");
                    break;
                }
                other => debug!(msg_type = ?other, "Ignoring frame"),
            }
        }

        self.inner.state.write().running = false;
        connection.close().await;
    }

    async fn serve_task(&self, body: &[u8]) -> Result<Vec<i32>> {
        let params: GenerationParams = serde_json::from_slice(body)?;
        let tokens = self.run_local(&params).await?;

        let mut state = self.inner.state.write();
        state.total_tasks += 1;
        Ok(tokens)
    }

    fn apply_sync(&self, frame: &Frame) {
        match serde_json::from_slice::<SyncMessage>(&frame.payload) {
            Ok(SyncMessage::Settings(settings)) => {
                debug!(?settings, "Applied settings from coordinator");
                self.inner.state.write().settings = settings;
            }
            Ok(SyncMessage::Partition(partition)) => {
                debug!(partitions = partition.num_partitions(), "Received partition from coordinator");
                self.inner.state.write().partition = Some(partition);
            }
            Err(e) => warn!(error = %e, "Malformed model sync"),
        }
    }

    /// Worker side: report liveness and load every heartbeat interval
    async fn heartbeat_loop(self, connection: Arc<Connection>) {
        let stop = stopped(self.inner.shutdown.subscribe());
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(self.inner.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }

            let report = {
                let state = self.inner.state.read();
                state
                    .local_index()
                    .and_then(|index| state.registry.get(index))
                    .map(|node| LoadReport {
                        load: node.metrics.current_load,
                        memory_used: node.metrics.memory_used,
                        active_tasks: node.metrics.active_tasks,
                    })
            };

            if let Err(e) = connection.send(MessageType::Heartbeat, &[]).await {
                debug!(error = %e, "Heartbeat send failed, stopping");
                break;
            }
            if let Some(report) = report {
                match serde_json::to_vec(&report) {
                    Ok(payload) => {
                        if let Err(e) = connection.send(MessageType::LoadReport, &payload).await {
                            debug!(error = %e, "Load report send failed, stopping");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Could not encode load report"),
                }
            }
        }
    }

    /// Coordinator side: heartbeat sweep every interval
    async fn monitor_loop(self) {
        let stop = stopped(self.inner.shutdown.subscribe());
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(self.inner.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }
            let failed = self.check_heartbeats(now_millis());
            if !failed.is_empty() {
                warn!(failed = failed.len(), "Heartbeat sweep found failed nodes");
            }
        }
    }

    /// Coordinator side: periodic checkpoints while the mode asks for them
    async fn checkpoint_loop(self) {
        let Some(path) = self.inner.config.checkpoint_path.clone() else {
            return;
        };
        if !self.inner.config.enable_checkpointing {
            return;
        }

        let period = self.inner.config.checkpoint_interval;
        let stop = stopped(self.inner.shutdown.subscribe());
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }
            if !self.settings().fault_tolerance.checkpoints() {
                continue;
            }
            if let Err(e) = self.create_checkpoint(&path).await {
                warn!(path = %path.display(), error = %e, "Periodic checkpoint failed");
            }
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
async fn stopped(mut rx: watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeCapability;

    struct CountingModel;

    impl InferenceModel for CountingModel {
        fn descriptor(&self) -> ModelDescriptor {
            ModelDescriptor::new(8, 256, 512)
        }

        fn generate(&self, params: &GenerationParams) -> Result<Vec<i32>> {
            Ok((0..params.max_tokens as i32).map(|t| 100 + t).collect())
        }
    }

    fn cluster_with(config: DistributedConfig) -> Cluster {
        Cluster::new(config).unwrap()
    }

    fn worker(id: &str) -> NodeInfo {
        NodeInfo::new(id, "127.0.0.1", 0, NodeRole::Worker)
    }

    fn local_config() -> DistributedConfig {
        DistributedConfig {
            coordinator_port: 0,
            max_retries: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = DistributedConfig {
            max_nodes: 0,
            ..Default::default()
        };
        assert!(matches!(Cluster::new(config), Err(ClusterError::ConfigRejected(_))));
    }

    #[tokio::test]
    async fn test_remove_node_then_lookup_returns_successor() {
        let cluster = cluster_with(DistributedConfig::default());
        for id in ["a", "b", "c"] {
            cluster.add_node(worker(id)).unwrap();
        }

        cluster.remove_node(1).await.unwrap();
        assert_eq!(cluster.node_info(1).unwrap().id.as_str(), "c");
        assert_eq!(cluster.node_index(&NodeId::from("c")), Some(1));
        assert!(cluster.node_info(2).is_none());
        assert!(matches!(
            cluster.remove_node(7).await,
            Err(ClusterError::InvalidIndex { index: 7, node_count: 2 })
        ));
    }

    #[test]
    fn test_stats_count_active_only() {
        let cluster = cluster_with(DistributedConfig::default());
        cluster.add_node(worker("a")).unwrap();
        cluster.add_node(worker("b").with_status(NodeStatus::Busy)).unwrap();
        cluster.add_node(worker("c").with_status(NodeStatus::Failed)).unwrap();

        let stats = cluster.stats();
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.active_nodes, 1);
        assert_eq!(cluster.health_report().active, 2);
    }

    #[test]
    fn test_update_node_load_and_memory_usage() {
        let cluster = cluster_with(DistributedConfig::default());
        cluster.add_node(worker("a")).unwrap();
        cluster.add_node(worker("b")).unwrap();

        cluster.update_node_load(0, 0.9, 1000, 2).unwrap();
        cluster.update_node_load(1, 0.1, 500, 0).unwrap();
        assert!(cluster.update_node_load(2, 0.1, 0, 0).is_err());

        assert_eq!(cluster.memory_usage(), (0, 1500));
        assert!(cluster.is_load_imbalanced());
    }

    #[tokio::test]
    async fn test_deploy_rejects_bad_assignment_and_keeps_previous() {
        let cluster = cluster_with(DistributedConfig::default());
        cluster.add_node(worker("a")).unwrap();
        cluster.add_node(worker("b")).unwrap();

        let model = ModelDescriptor::new(4, 64, 128);
        let good = cluster.partition_model(&model, PartitionStrategy::LayerWise).unwrap();
        cluster.deploy(good.clone()).await.unwrap();
        assert_eq!(cluster.node_info(0).unwrap().status, NodeStatus::Busy);

        let mut bad = good.clone();
        bad.node_assignments[0] = 2;
        assert!(matches!(cluster.deploy(bad).await, Err(ClusterError::ConfigRejected(_))));
        assert_eq!(cluster.current_partition(), Some(good));
    }

    #[tokio::test]
    async fn test_settings_updates() {
        let cluster = cluster_with(DistributedConfig::default());

        cluster.set_compression(9).await.unwrap();
        assert!(matches!(cluster.set_compression(10).await, Err(ClusterError::ConfigRejected(_))));
        cluster.set_load_balancing(LoadBalanceStrategy::Dynamic).await.unwrap();
        cluster.set_fault_tolerance(FaultToleranceMode::Migration).await.unwrap();
        cluster.enable_simd(false).await.unwrap();

        let settings = cluster.settings();
        assert_eq!(settings.compression_level, 9);
        assert_eq!(settings.load_balance_strategy, LoadBalanceStrategy::Dynamic);
        assert_eq!(settings.fault_tolerance, FaultToleranceMode::Migration);
        assert!(!settings.simd_enabled);
        assert_eq!(cluster.config().load_balance_strategy, LoadBalanceStrategy::LeastLoaded);
    }

    #[tokio::test]
    async fn test_generate_without_nodes_fails_fast() {
        let cluster = cluster_with(DistributedConfig::default());
        let result = cluster
            .generate_text(&GenerationParams::default(), ExecutionOptions::default())
            .await;
        assert!(matches!(result, Err(ClusterError::NoNodeAvailable)));
        assert_eq!(cluster.in_flight_tasks(), 0);
    }

    #[test]
    fn test_pending_excludes_running_tasks() {
        let cluster = cluster_with(DistributedConfig::default());
        {
            let mut state = cluster.inner.state.write();
            let running = state.tasks.submit(MessageType::TaskRequest, 1, Bytes::new(), 0).unwrap();
            state.tasks.submit(MessageType::TaskRequest, 1, Bytes::new(), 0).unwrap();
            state.tasks.assign(running, 0, NodeId::from("a"), 1);
        }
        assert_eq!(cluster.pending_tasks(), 1);
        assert_eq!(cluster.in_flight_tasks(), 2);
    }

    #[tokio::test]
    async fn test_local_generation_updates_statistics() {
        let cluster = cluster_with(local_config());
        cluster.attach_model(Arc::new(CountingModel));
        cluster.start_coordinator("127.0.0.1").await.unwrap();

        let params = GenerationParams::default().with_max_tokens(4);
        let tokens = cluster.generate_text(&params, ExecutionOptions::default()).await.unwrap();
        assert_eq!(tokens, vec![100, 101, 102, 103]);
        assert_eq!(cluster.stats().total_tasks_processed, 1);
        assert_eq!(cluster.in_flight_tasks(), 0);

        cluster.shutdown().await;
        assert!(!cluster.is_running());
    }

    #[tokio::test]
    async fn test_unreachable_node_falls_back_only_when_allowed() {
        let cluster = cluster_with(local_config());
        cluster.attach_model(Arc::new(CountingModel));
        cluster.start_coordinator("127.0.0.1").await.unwrap();

        // registered but never connected, and far more attractive than the coordinator
        let fast = worker("fast").with_capability(NodeCapability::new(64, 1 << 40, 50.0, 8).unwrap());
        cluster.add_node(fast).unwrap();
        cluster.set_load_balancing(LoadBalanceStrategy::Weighted).await.unwrap();

        let params = GenerationParams::default().with_max_tokens(2);
        let result = cluster.generate_text(&params, ExecutionOptions::default()).await;
        assert!(matches!(result, Err(ClusterError::TransportFailure(_))));

        let tokens = cluster
            .generate_text(&params, ExecutionOptions::default().with_local_fallback())
            .await
            .unwrap();
        assert_eq!(tokens, vec![100, 101]);

        // migration retries steer away from the unreachable node
        cluster.set_fault_tolerance(FaultToleranceMode::Migration).await.unwrap();
        let tokens = cluster.generate_text(&params, ExecutionOptions::default()).await.unwrap();
        assert_eq!(tokens.len(), 2);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_check_migrates_partitions() {
        let cluster = cluster_with(DistributedConfig {
            fault_tolerance: FaultToleranceMode::Migration,
            max_missed_heartbeats: 1,
            ..Default::default()
        });
        cluster.add_node(worker("a")).unwrap();
        cluster.add_node(worker("b")).unwrap();

        let model = ModelDescriptor::new(4, 64, 128);
        let partition = cluster.partition_model(&model, PartitionStrategy::LayerWise).unwrap();
        cluster.deploy(partition).await.unwrap();

        // "a" stays fresh, "b" goes quiet
        let later = now_millis() + 60_000;
        cluster.update_node_load(0, 0.1, 0, 0).unwrap();
        {
            let mut state = cluster.inner.state.write();
            state.registry.get_mut(0).unwrap().last_heartbeat_ms = later;
        }

        let failed = cluster.check_heartbeats(later);
        assert_eq!(failed, vec![NodeId::from("b")]);
        assert_eq!(cluster.node_info(1).unwrap().status, NodeStatus::Failed);
        assert_eq!(cluster.node_count(), 2);
        assert!(cluster
            .current_partition()
            .unwrap()
            .node_assignments
            .iter()
            .all(|&n| n == 0));
    }

    #[tokio::test]
    async fn test_checkpoint_requires_enabled_flag() {
        let cluster = cluster_with(DistributedConfig {
            enable_checkpointing: false,
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            cluster.create_checkpoint(dir.path().join("c.ckpt")).await,
            Err(ClusterError::CheckpointingDisabled)
        ));
    }

    #[tokio::test]
    async fn test_leave_when_not_running() {
        let cluster = cluster_with(DistributedConfig::default());
        assert!(matches!(cluster.leave_cluster().await, Err(ClusterError::NotRunning)));
        cluster.shutdown().await;
    }

    #[test]
    fn test_sync_message_wire_shape() {
        let settings = ClusterSettings::from_config(&DistributedConfig::default());
        let json = serde_json::to_value(SyncMessage::Settings(settings)).unwrap();
        assert_eq!(json["kind"], "settings");
        assert_eq!(json["body"]["load_balance_strategy"], "least_loaded");
    }
}
