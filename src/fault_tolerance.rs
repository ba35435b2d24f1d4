//! Failure detection, partition migration and checkpoint persistence.

use crate::communication::CommProtocol;
use crate::config::DistributedConfig;
use crate::error::{ClusterError, Result};
use crate::node::{NodeCapability, NodeId, NodeInfo, NodeMetrics, NodeRegistry, NodeRole, NodeStatus};
use crate::partition::ModelPartition;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How the cluster reacts to node failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultToleranceMode {
    None,
    /// Persist cluster state periodically
    Checkpoint,
    Replication,
    /// Move work off failed nodes
    Migration,
    /// Checkpoint and migrate
    Adaptive,
}

impl FaultToleranceMode {
    pub fn code(self) -> u32 {
        match self {
            FaultToleranceMode::None => 0,
            FaultToleranceMode::Checkpoint => 1,
            FaultToleranceMode::Replication => 2,
            FaultToleranceMode::Migration => 3,
            FaultToleranceMode::Adaptive => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(FaultToleranceMode::None),
            1 => Some(FaultToleranceMode::Checkpoint),
            2 => Some(FaultToleranceMode::Replication),
            3 => Some(FaultToleranceMode::Migration),
            4 => Some(FaultToleranceMode::Adaptive),
            _ => None,
        }
    }

    /// Whether work is moved off failed nodes
    pub fn migrates(self) -> bool {
        matches!(self, FaultToleranceMode::Migration | FaultToleranceMode::Adaptive)
    }

    /// Whether the coordinator writes periodic checkpoints
    pub fn checkpoints(self) -> bool {
        matches!(self, FaultToleranceMode::Checkpoint | FaultToleranceMode::Adaptive)
    }
}

/// Count missed heartbeats and mark nodes that crossed the threshold.
///
/// Nodes already failed or disconnected are left alone, as is `local`.
/// Returns the indices of nodes that became failed in this sweep.
pub fn sweep_heartbeats(
    registry: &mut NodeRegistry,
    local: Option<&NodeId>,
    now_ms: i64,
    interval: Duration,
    max_missed: u32,
) -> Vec<usize> {
    let interval_ms = interval.as_millis() as i64;
    let local_index = local.and_then(|id| registry.position(id));
    let mut newly_failed = Vec::new();

    for index in 0..registry.len() {
        if Some(index) == local_index {
            continue;
        }
        let Some(node) = registry.get_mut(index) else {
            continue;
        };
        if matches!(node.status, NodeStatus::Failed | NodeStatus::Disconnected) {
            continue;
        }
        if now_ms.saturating_sub(node.last_heartbeat_ms) <= interval_ms {
            continue;
        }

        node.missed_heartbeats += 1;
        debug!(node_id = %node.id, missed = node.missed_heartbeats, "Missed heartbeat");

        if node.missed_heartbeats >= max_missed {
            node.status = NodeStatus::Failed;
            warn!(node_id = %node.id, index, missed = node.missed_heartbeats, "Node marked failed");
            newly_failed.push(index);
        }
    }

    newly_failed
}

/// Move partitions held by failed nodes onto live ones, round-robin.
/// Returns the number of partitions moved.
pub fn migrate_partitions(partition: &mut ModelPartition, failed: &[usize], registry: &NodeRegistry) -> usize {
    let live = registry.live_indices();
    if live.is_empty() {
        warn!(failed = failed.len(), "No live nodes to take over failed partitions");
        return 0;
    }

    let mut moved = 0;
    for &index in failed {
        let count = partition.reassign(index, &live);
        if count > 0 {
            info!(from = index, partitions = count, "Migrated partitions off failed node");
        }
        moved += count;
    }
    moved
}

/// Leading tag of every checkpoint file
pub const CHECKPOINT_MAGIC: u32 = 0x4E42_434B;

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

const CHECKSUM_LEN: usize = 32;

// id and hostname lengths plus every fixed-width field of a node record
const MIN_NODE_RECORD_LEN: usize = 4 + 4 + 2 + 4 + 4 + 4 + (4 + 8 + 4 + 1 + 4) + (4 + 8 + 4 + 4 + 4 + 4 + 8 + 8) + 8 + 4;

/// Everything a checkpoint persists
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointData {
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    pub total_tasks: u64,
    pub config: DistributedConfig,
    pub nodes: Vec<NodeInfo>,
}

impl CheckpointData {
    /// Serialize into the versioned binary layout.
    ///
    /// ```text
    /// u32 magic, u32 version, i64 created_at
    /// i32 node_count, u64 total_tasks
    /// u32 config_len, config (JSON)
    /// node_count x node record
    /// [u8; 32] sha256 of everything above
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>> {
        let node_count = i32::try_from(self.nodes.len())
            .map_err(|_| ClusterError::SerializationFailure("too many nodes".to_string()))?;
        let config = serde_json::to_vec(&self.config)?;

        let mut buf = BytesMut::with_capacity(64 + config.len() + self.nodes.len() * 128);
        buf.put_u32_le(CHECKPOINT_MAGIC);
        buf.put_u32_le(CHECKPOINT_VERSION);
        buf.put_i64_le(self.created_at);
        buf.put_i32_le(node_count);
        buf.put_u64_le(self.total_tasks);
        put_bytes(&mut buf, &config)?;

        for node in &self.nodes {
            encode_node(&mut buf, node)?;
        }

        let checksum = Sha256::digest(&buf[..]);
        buf.put_slice(&checksum);
        Ok(buf.to_vec())
    }

    /// Parse and verify a checkpoint image
    pub fn decode(image: &[u8]) -> Result<Self> {
        if image.len() < CHECKSUM_LEN {
            return Err(corrupt("file is shorter than its checksum"));
        }
        let (body, checksum) = image.split_at(image.len() - CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(corrupt("checksum mismatch"));
        }

        let mut reader = Reader { buf: body };
        if reader.u32()? != CHECKPOINT_MAGIC {
            return Err(corrupt("not a checkpoint file"));
        }
        let version = reader.u32()?;
        if version != CHECKPOINT_VERSION {
            return Err(ClusterError::SerializationFailure(format!(
                "unsupported checkpoint version {}",
                version
            )));
        }

        let created_at = reader.i64()?;
        let node_count = reader.i32()?;
        let total_tasks = reader.u64()?;
        let config: DistributedConfig = serde_json::from_slice(reader.bytes()?)?;

        let node_count = usize::try_from(node_count).map_err(|_| corrupt("negative node count"))?;
        if node_count * MIN_NODE_RECORD_LEN > reader.remaining() {
            return Err(corrupt("node count exceeds file size"));
        }

        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            nodes.push(decode_node(&mut reader)?);
        }
        if reader.remaining() != 0 {
            return Err(corrupt("trailing bytes after node records"));
        }

        Ok(Self {
            created_at,
            total_tasks,
            config,
            nodes,
        })
    }
}

/// Write a checkpoint atomically: a temporary sibling file is renamed into
/// place, so a failed write leaves any previous checkpoint intact.
pub async fn write_checkpoint(path: &Path, data: &CheckpointData) -> Result<()> {
    let image = data.encode()?;
    let staging = staging_path(path);

    if let Err(e) = tokio::fs::write(&staging, &image).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }

    info!(path = %path.display(), nodes = data.nodes.len(), bytes = image.len(), "Checkpoint written");
    Ok(())
}

pub async fn read_checkpoint(path: &Path) -> Result<CheckpointData> {
    let image = tokio::fs::read(path).await?;
    CheckpointData::decode(&image)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupt(reason: &str) -> ClusterError {
    ClusterError::SerializationFailure(format!("corrupt checkpoint: {}", reason))
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| ClusterError::SerializationFailure("field too long".to_string()))?;
    buf.put_u32_le(len);
    buf.put_slice(bytes);
    Ok(())
}

fn encode_node(buf: &mut BytesMut, node: &NodeInfo) -> Result<()> {
    put_bytes(buf, node.id.as_str().as_bytes())?;
    put_bytes(buf, node.hostname.as_bytes())?;
    buf.put_u16_le(node.port);
    buf.put_u32_le(node.role.code());
    buf.put_u32_le(node.status.code());
    buf.put_u32_le(node.protocol.code());

    let cap = &node.capability;
    buf.put_u32_le(cap.cpu_cores);
    buf.put_u64_le(cap.memory_bytes);
    buf.put_f32_le(cap.compute_power);
    buf.put_u8(cap.has_gpu as u8);
    buf.put_u32_le(cap.gpu_count);

    let m = &node.metrics;
    buf.put_f32_le(m.current_load);
    buf.put_u64_le(m.memory_used);
    buf.put_u32_le(m.active_tasks);
    buf.put_f32_le(m.avg_latency);
    buf.put_f32_le(m.network_latency);
    buf.put_f32_le(m.network_bandwidth);
    buf.put_u64_le(m.bytes_sent);
    buf.put_u64_le(m.bytes_received);

    buf.put_i64_le(node.last_heartbeat_ms);
    buf.put_u32_le(node.missed_heartbeats);
    Ok(())
}

fn decode_node(reader: &mut Reader<'_>) -> Result<NodeInfo> {
    let id = reader.string()?;
    let hostname = reader.string()?;
    let port = reader.u16()?;
    let role = NodeRole::from_code(reader.u32()?).ok_or_else(|| corrupt("unknown node role"))?;
    let status = NodeStatus::from_code(reader.u32()?).ok_or_else(|| corrupt("unknown node status"))?;
    let protocol = CommProtocol::from_code(reader.u32()?).ok_or_else(|| corrupt("unknown protocol"))?;

    let capability = NodeCapability {
        cpu_cores: reader.u32()?,
        memory_bytes: reader.u64()?,
        compute_power: reader.f32()?,
        has_gpu: reader.u8()? != 0,
        gpu_count: reader.u32()?,
    };

    let metrics = NodeMetrics {
        current_load: reader.f32()?,
        memory_used: reader.u64()?,
        active_tasks: reader.u32()?,
        avg_latency: reader.f32()?,
        network_latency: reader.f32()?,
        network_bandwidth: reader.f32()?,
        bytes_sent: reader.u64()?,
        bytes_received: reader.u64()?,
    };

    Ok(NodeInfo {
        id: NodeId::from(id),
        hostname,
        port,
        role,
        status,
        protocol,
        capability,
        metrics,
        last_heartbeat_ms: reader.i64()?,
        missed_heartbeats: reader.u32()?,
    })
}

/// Bounds-checked little-endian reader
struct Reader<'a> {
    buf: &'a [u8],
}

macro_rules! read_fixed {
    ($($name:ident: $ty:ty => $get:ident),* $(,)?) => {
        $(
            fn $name(&mut self) -> Result<$ty> {
                self.need(std::mem::size_of::<$ty>())?;
                Ok(self.buf.$get())
            }
        )*
    };
}

impl<'a> Reader<'a> {
    read_fixed! {
        u8: u8 => get_u8,
        u16: u16 => get_u16_le,
        u32: u32 => get_u32_le,
        i32: i32 => get_i32_le,
        u64: u64 => get_u64_le,
        i64: i64 => get_i64_le,
        f32: f32 => get_f32_le,
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, len: usize) -> Result<()> {
        if self.buf.len() < len {
            return Err(corrupt("truncated record"));
        }
        Ok(())
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| corrupt("invalid UTF-8 in string field"))
    }
}
