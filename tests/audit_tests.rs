use chrono::Utc;
use std::time::Duration;
use vigil::audit::{
    AuditThresholds, BottleneckSeverity, BottleneckType, analyze_resource_history,
    analyze_startup_records, analyze_worker_stats,
};
use vigil::lifecycle::ServiceStartupRecord;
use vigil::{EngineConfig, ResourceMetrics, StartupMode, VigilEngine, WorkerStats};

fn record(name: &str, duration_secs: f64, estimated_secs: f64) -> ServiceStartupRecord {
    ServiceStartupRecord {
        name: name.to_string(),
        success: true,
        duration_secs,
        estimated_secs,
        error: None,
    }
}

fn metrics(cpu: f64, memory: f64, disk: f64) -> ResourceMetrics {
    ResourceMetrics {
        timestamp: Utc::now(),
        cpu_percent: cpu,
        memory_percent: memory,
        memory_used_mb: 1024.0,
        memory_available_mb: 1024.0,
        disk_percent: disk,
        disk_free_gb: 100.0,
        network_bytes_sent: 0,
        network_bytes_recv: 0,
        gpu_percent: None,
        gpu_memory_percent: None,
        process_count: 10,
        thread_count: 4,
        open_files: 16,
    }
}

#[test]
fn slow_startup_is_flagged_with_scaled_severity() {
    let thresholds = AuditThresholds::default();
    let bottlenecks = analyze_startup_records(
        &[record("fast", 0.2, 0.5), record("sluggish", 15.0, 0.5)],
        &thresholds,
    );

    assert_eq!(bottlenecks.len(), 1);
    let bottleneck = &bottlenecks[0];
    assert_eq!(bottleneck.service_name, "sluggish");
    assert_eq!(bottleneck.bottleneck_type, BottleneckType::StartupSlow);
    assert_eq!(bottleneck.severity, BottleneckSeverity::High);
    assert!((bottleneck.impact_score - 75.0).abs() < 1e-9);
    assert!(!bottleneck.recommendations.is_empty());
}

#[test]
fn startup_over_estimate_is_flagged_even_under_absolute_threshold() {
    let thresholds = AuditThresholds::default();
    // 1.5s is under the 10s absolute bar but triples the estimate.
    let bottlenecks = analyze_startup_records(&[record("drifting", 1.5, 0.5)], &thresholds);

    assert_eq!(bottlenecks.len(), 1);
    assert_eq!(bottlenecks[0].bottleneck_type, BottleneckType::StartupSlow);
    assert_eq!(bottlenecks[0].severity, BottleneckSeverity::Low);
}

#[test]
fn sustained_high_cpu_classifies_as_cpu_intensive() {
    let thresholds = AuditThresholds::default();
    let history: Vec<ResourceMetrics> = (0..12).map(|_| metrics(97.0, 40.0, 20.0)).collect();
    let bottlenecks = analyze_resource_history(&history, &thresholds);

    let cpu: Vec<_> = bottlenecks
        .iter()
        .filter(|b| b.bottleneck_type == BottleneckType::CpuIntensive)
        .collect();
    assert_eq!(cpu.len(), 1);
    assert_eq!(cpu[0].severity, BottleneckSeverity::Medium);
    assert!(cpu[0].impact_score > 0.0);
}

#[test]
fn monotonic_memory_growth_classifies_as_leak() {
    let thresholds = AuditThresholds::default();
    let history: Vec<ResourceMetrics> = (0..12)
        .map(|i| metrics(20.0, 68.0 + i as f64, 20.0))
        .collect();
    let bottlenecks = analyze_resource_history(&history, &thresholds);

    let leaks: Vec<_> = bottlenecks
        .iter()
        .filter(|b| b.bottleneck_type == BottleneckType::MemoryLeak)
        .collect();
    assert_eq!(leaks.len(), 1);
    assert!(leaks[0].description.contains("grew"));
}

#[test]
fn stable_memory_is_not_a_leak() {
    let thresholds = AuditThresholds::default();
    let history: Vec<ResourceMetrics> = (0..12).map(|_| metrics(20.0, 60.0, 20.0)).collect();
    let bottlenecks = analyze_resource_history(&history, &thresholds);
    assert!(bottlenecks.is_empty());
}

#[test]
fn combined_pressure_flags_resource_contention() {
    let thresholds = AuditThresholds::default();
    let history = vec![metrics(30.0, 40.0, 20.0), metrics(85.0, 90.0, 20.0)];
    let bottlenecks = analyze_resource_history(&history, &thresholds);

    assert!(
        bottlenecks
            .iter()
            .any(|b| b.bottleneck_type == BottleneckType::ResourceContention)
    );
}

#[test]
fn slow_average_task_time_flags_blocking_operations() {
    let thresholds = AuditThresholds::default();
    let stats = WorkerStats {
        cpu_workers: 4,
        io_workers: 8,
        tasks_submitted: 10,
        tasks_completed: 10,
        tasks_failed: 0,
        average_execution_secs: 2.5,
    };
    let bottlenecks = analyze_worker_stats(&stats, &thresholds);

    assert_eq!(bottlenecks.len(), 1);
    assert_eq!(
        bottlenecks[0].bottleneck_type,
        BottleneckType::BlockingOperation
    );
    assert_eq!(bottlenecks[0].severity, BottleneckSeverity::High);
}

#[test]
fn idle_workers_raise_nothing() {
    let thresholds = AuditThresholds::default();
    let bottlenecks = analyze_worker_stats(&WorkerStats::default(), &thresholds);
    assert!(bottlenecks.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_engine_audits_healthy() {
    let engine = VigilEngine::new(EngineConfig {
        profile: "production".to_string(),
        ..Default::default()
    })
    .await
    .unwrap();
    engine.register_catalog_stubs().await.unwrap();
    engine.start(StartupMode::EssentialOnly).await.unwrap();

    let report = engine.audit().await;
    assert_eq!(report.services_analyzed, engine.catalog().len());
    // Stub startups are fast and no tasks ran; only ambient host
    // pressure could surface, never startup or orchestrator findings.
    assert!(
        report.bottlenecks.iter().all(|b| {
            b.bottleneck_type != BottleneckType::StartupSlow
                && b.bottleneck_type != BottleneckType::BlockingOperation
        })
    );
    assert!(report.health_score > 0.0);

    // The report serializes for the operational surface.
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("health_score"));

    engine.stop(Duration::from_secs(10)).await;
}
