//! Benchmarks for backend selection and registry report intake

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use volume_orchestrator::{
    BackendId, BackendKind, BackendReport, CapabilityRegistry, CapabilityRequirements,
    CapabilitySet, CapacityReport, MemoryStore, RegistryConfig, Scheduler, SchedulerConfig,
    SchedulingRequest,
};

const GIB: u64 = 1024 * 1024 * 1024;

fn report(index: usize, sequence_no: u64) -> BackendReport {
    BackendReport {
        backend_id: BackendId::new(format!("lvm-{:03}", index)),
        kind: BackendKind::Lvm,
        capacity: CapacityReport {
            free_bytes: (100 + index as u64 % 50) * GIB,
            total_bytes: 200 * GIB,
            utilization_percent: (index % 100) as u8,
            ..Default::default()
        },
        capabilities: CapabilitySet {
            volume_types: ["lvm".to_string()].into_iter().collect(),
            thin_provisioning: true,
            ..Default::default()
        },
        reserved_percentage: 5,
        sequence_no,
    }
}

fn registry_with(backends: usize) -> Arc<CapabilityRegistry> {
    let registry = CapabilityRegistry::new(RegistryConfig::default());
    for i in 0..backends {
        let _ = registry.report(report(i, 1));
    }
    registry
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();

    for backends in [10usize, 100] {
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            registry_with(backends),
            Arc::new(MemoryStore::new()),
        );
        let request = SchedulingRequest {
            volume_id: "vol-bench".into(),
            size_bytes: GIB,
            capabilities: CapabilityRequirements {
                volume_type: Some("lvm".into()),
                ..Default::default()
            },
        };

        group.bench_function(format!("select_and_release_{}_backends", backends), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let placement = scheduler.select(black_box(&request)).await.unwrap();
                    scheduler.release(&placement.reservation).await.unwrap();
                })
            });
        });
    }

    group.finish();
}

fn bench_report_intake(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    let registry = registry_with(100);
    group.bench_function("report_100_backends", |b| {
        let mut sequence_no = 1u64;
        b.iter(|| {
            sequence_no += 1;
            let _ = registry.report(black_box(report(sequence_no as usize % 100, sequence_no)));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_select, bench_report_intake);
criterion_main!(benches);
