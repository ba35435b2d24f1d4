//! Throughput benchmarks for the coordination hot paths
//!
//! Covers frame encoding, node selection, partition planning and
//! checkpoint serialization using the Criterion framework.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nimbus::communication::{FrameCodec, DEFAULT_MAX_MESSAGE_SIZE};
use nimbus::fault_tolerance::CheckpointData;
use nimbus::load_balancer::LoadBalancer;
use nimbus::*;

fn cluster_nodes(count: usize) -> Vec<NodeInfo> {
    (0..count)
        .map(|i| {
            let capability = NodeCapability::new(8, 16 << 30, 1.0 + (i % 4) as f32, 0).unwrap();
            NodeInfo::new(format!("node-{}", i), "10.0.0.1", 8900 + i as u16, NodeRole::Worker)
                .with_capability(capability)
                .with_load((i % 10) as f32 / 10.0)
        })
        .collect()
}

/// Frame encoding and decoding across payload sizes
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    let codec = FrameCodec::new(DEFAULT_MAX_MESSAGE_SIZE);
    let runtime = tokio::runtime::Runtime::new().unwrap();

    for size in [64usize, 4096, 65536].iter() {
        let payload = vec![0xABu8; *size];
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            b.iter(|| codec.encode(MessageType::TaskRequest, black_box(payload)).unwrap());
        });

        let encoded = codec.encode(MessageType::TaskResponse, &payload).unwrap().freeze();
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.to_async(&runtime).iter(|| async {
                let mut reader = &encoded[..];
                codec.read_frame(&mut reader, DEFAULT_MAX_MESSAGE_SIZE).await.unwrap()
            });
        });
    }

    group.finish();
}

/// Node selection under each strategy
fn bench_load_balancer(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balancer_select");
    let balancer = LoadBalancer::new();

    for node_count in [8usize, 64].iter() {
        let nodes = cluster_nodes(*node_count);
        for strategy in [
            LoadBalanceStrategy::RoundRobin,
            LoadBalanceStrategy::LeastLoaded,
            LoadBalanceStrategy::Weighted,
            LoadBalanceStrategy::Dynamic,
        ] {
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", strategy), node_count),
                &nodes,
                |b, nodes| {
                    b.iter(|| balancer.select(black_box(nodes), strategy, &[]));
                },
            );
        }
    }

    group.finish();
}

/// Partition planning for a large model
fn bench_partition_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_plan");
    let model = ModelDescriptor::new(80, 8192, 4096);

    for strategy in [
        PartitionStrategy::LayerWise,
        PartitionStrategy::TensorParallel,
        PartitionStrategy::Pipeline,
        PartitionStrategy::DataParallel,
    ] {
        group.bench_function(format!("{:?}", strategy), |b| {
            b.iter(|| ModelPartition::plan(black_box(&model), strategy, 16).unwrap());
        });
    }

    group.finish();
}

/// Checkpoint image encoding for growing node tables
fn bench_checkpoint_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_encode");

    for node_count in [4usize, 64].iter() {
        let data = CheckpointData {
            created_at: 1_700_000_000_000,
            total_tasks: 1234,
            config: DistributedConfig::default(),
            nodes: cluster_nodes(*node_count),
        };
        group.throughput(Throughput::Elements(*node_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(node_count), &data, |b, data| {
            b.iter(|| data.encode().unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_load_balancer,
    bench_partition_planning,
    bench_checkpoint_encode
);
criterion_main!(benches);
