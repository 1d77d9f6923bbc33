//! Benchmark for container placement
//!
//! Covers the pure candidate selection and a full path-reuse lookup
//! against in-memory arrays.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use mirror_coordinator::array::{ArrayEndpoint, InMemoryArray};
use mirror_coordinator::domain::ports::{
    ArrayGateway, ArrayIdentity, PathId, PathPortPair, PortPair, PortState, ReplicationPath,
    VolumeType,
};
use mirror_coordinator::replication::{
    LinkSelection, PathManager, PlacementAllocator, PlacementCandidate, PlacementEngine,
    ReplicationSession, RetryPolicy,
};
use mirror_coordinator::ConnectionType;
use std::collections::BTreeMap;
use std::sync::Arc;

fn candidates(count: u32) -> Vec<PlacementCandidate> {
    (0..count)
        .map(|i| PlacementCandidate {
            source_pool: "P0".to_string(),
            source_container: format!("{:02X}", i % 128),
            source_volumes: (i * 37) % 256,
            target_pool: "P1".to_string(),
            target_container: format!("{:02X}", 128 + i % 128),
            target_volumes: (i * 53) % 256,
        })
        .collect()
}

fn bench_engine_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement_engine");

    for count in [8u32, 64, 255] {
        let candidates = candidates(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("select_{}", count), |b| {
            b.iter(|| PlacementEngine::select(black_box(&candidates)));
        });
    }

    group.finish();
}

fn bench_path_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement_allocator");
    group.throughput(Throughput::Elements(1));

    let primary = Arc::new(InMemoryArray::new(ArrayIdentity::new(
        "bench-a",
        "5000000000FFC111",
        "2107-1111111",
    )));
    let secondary = Arc::new(InMemoryArray::new(ArrayIdentity::new(
        "bench-b",
        "5000000000FFD222",
        "2107-2222222",
    )));
    primary.add_pool("P0", VolumeType::Block, 100_000);
    secondary.add_pool("P1", VolumeType::Block, 100_000);

    let links = vec![PortPair::new("I0001", "I0101")];
    primary.add_links(&secondary.identity().storage_wwnn, &links);

    // 32 container pairs, each joined by a healthy path
    for i in 0..32u32 {
        let source = format!("{:02X}", i);
        let target = format!("{:02X}", 0x40 + i);
        primary.add_container(&source, "P0", (i * 7) % 200);
        secondary.add_container(&target, "P1", (i * 11) % 200);
        primary.add_path(ReplicationPath {
            id: PathId {
                source_wwnn: primary.identity().storage_wwnn.clone(),
                source_container: source,
                target_wwnn: secondary.identity().storage_wwnn.clone(),
                target_container: target,
            },
            port_pairs: vec![PathPortPair {
                pair: links[0].clone(),
                state: PortState::Success,
            }],
        });
    }

    let variant = ConnectionType::FibreChannel.variant(&BTreeMap::new());
    let session = ReplicationSession::new(
        ArrayEndpoint::new(primary.clone(), variant.clone()),
        ArrayEndpoint::new(secondary.clone(), variant),
        LinkSelection::from_forward(links),
    );
    let allocator = PlacementAllocator::new(
        Arc::new(PathManager::new(RetryPolicy::path_health())),
        Default::default(),
    );

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("find_placement_32_paths", |b| {
        b.iter(|| {
            rt.block_on(async {
                let _ = allocator.find_placement(black_box(&session), &[]).await;
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_engine_select, bench_path_reuse);
criterion_main!(benches);
