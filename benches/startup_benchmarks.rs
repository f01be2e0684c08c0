use criterion::{Criterion, criterion_group, criterion_main};
use std::time::Duration;
use vigil::{
    DependencyGraph, OrchestratorConfig, ServiceCatalog, Task, TaskOrchestrator,
};

fn bench_startup_planning(c: &mut Criterion) {
    let catalog = ServiceCatalog::builtin_defaults();
    let graph = DependencyGraph::build(&catalog).unwrap();
    let names: Vec<String> = catalog.names().map(String::from).collect();

    c.bench_function("startup_plan_builtin_catalog", |b| {
        b.iter(|| {
            let plan = graph.plan(&names);
            assert!(!plan.groups.is_empty());
            plan
        })
    });
}

fn bench_parallel_schedule(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let orchestrator = runtime.block_on(async {
        TaskOrchestrator::new(OrchestratorConfig {
            cpu_workers: 4,
            io_workers: 8,
            retry_base_delay: Duration::from_millis(1),
            batch_pause: Duration::from_millis(1),
        })
    });

    c.bench_function("schedule_100_cpu_tasks", |b| {
        b.to_async(&runtime).iter(|| async {
            let tasks: Vec<Task<u64>> = (0..100)
                .map(|i| Task::cpu(move || Ok(i * i)))
                .collect();
            let results = orchestrator.schedule(tasks).await.unwrap();
            assert_eq!(results.len(), 100);
        })
    });

    runtime.block_on(orchestrator.shutdown(true));
}

criterion_group!(benches, bench_startup_planning, bench_parallel_schedule);
criterion_main!(benches);
