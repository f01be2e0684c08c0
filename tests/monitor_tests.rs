use async_trait::async_trait;
use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use vigil::{
    AlertLevel, Classification, ClearableCache, DependencyGraph, EventBus, LifecycleConfig,
    LifecycleManager, LifecycleState, ManagedService, MonitorConfig, ResourceMetrics,
    ResourceMonitor, ResourceThreshold, ResourceType, ServiceCatalog, ServiceConfig,
    ServiceInstance, ServiceRegistry, factory_fn,
};

struct Plain;

#[async_trait]
impl ManagedService for Plain {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn synthetic_metrics(cpu: f64, memory: f64) -> ResourceMetrics {
    ResourceMetrics {
        timestamp: Utc::now(),
        cpu_percent: cpu,
        memory_percent: memory,
        memory_used_mb: 1024.0,
        memory_available_mb: 1024.0,
        disk_percent: 10.0,
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

fn monitor_config(auto_optimize: bool) -> MonitorConfig {
    MonitorConfig {
        check_interval: Duration::from_millis(100),
        auto_optimize,
        enable_gpu: false,
        essential_prefixes: vec!["auth".to_string(), "config".to_string()],
    }
}

#[tokio::test]
async fn single_spike_does_not_alert() {
    let events = EventBus::new();
    let monitor = ResourceMonitor::new(monitor_config(false), events);
    monitor
        .configure_threshold(
            ResourceType::Cpu,
            ResourceThreshold::new(70.0, 85.0, 95.0, 1),
        )
        .await;

    monitor.observe(synthetic_metrics(90.0, 50.0)).await;
    // Recovery below the threshold clears the pressure window.
    monitor.observe(synthetic_metrics(30.0, 50.0)).await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    monitor.observe(synthetic_metrics(90.0, 50.0)).await;

    assert!(monitor.recent_alerts(None).await.is_empty());
}

#[tokio::test]
async fn sustained_pressure_raises_alert_at_matching_level() {
    let events = EventBus::new();
    let monitor = ResourceMonitor::new(monitor_config(false), events);
    monitor
        .configure_threshold(
            ResourceType::Cpu,
            ResourceThreshold::new(70.0, 85.0, 95.0, 1),
        )
        .await;

    monitor.observe(synthetic_metrics(90.0, 50.0)).await;
    assert!(monitor.is_under_pressure(Some(ResourceType::Cpu)).await);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    monitor.observe(synthetic_metrics(90.0, 50.0)).await;

    let alerts = monitor.recent_alerts(None).await;
    assert!(!alerts.is_empty());
    assert_eq!(alerts[0].resource_type, ResourceType::Cpu);
    assert_eq!(alerts[0].level, AlertLevel::Critical);
}

#[tokio::test]
async fn alert_level_escalates_with_value() {
    let events = EventBus::new();
    let monitor = ResourceMonitor::new(monitor_config(false), events);
    monitor
        .configure_threshold(
            ResourceType::Memory,
            ResourceThreshold::new(75.0, 90.0, 98.0, 0),
        )
        .await;

    monitor.observe(synthetic_metrics(10.0, 80.0)).await;
    monitor.observe(synthetic_metrics(10.0, 92.0)).await;
    monitor.observe(synthetic_metrics(10.0, 99.0)).await;

    let levels: Vec<AlertLevel> = monitor
        .recent_alerts(None)
        .await
        .iter()
        .map(|a| a.level)
        .collect();
    assert_eq!(
        levels,
        vec![
            AlertLevel::Warning,
            AlertLevel::Critical,
            AlertLevel::Emergency
        ]
    );
}

#[tokio::test]
async fn sustained_cpu_pressure_suspends_background_services() {
    let catalog = ServiceCatalog::from_configs(
        vec![
            ServiceConfig::new("bg_reports", Classification::Background),
            ServiceConfig::new("bg_cleanup", Classification::Background),
            ServiceConfig::new("bg_indexer", Classification::Background),
        ],
        "production",
    )
    .unwrap();
    let catalog = Arc::new(catalog);
    let graph = Arc::new(RwLock::new(DependencyGraph::build(&catalog).unwrap()));
    let events = EventBus::new();
    let registry = Arc::new(ServiceRegistry::new(events.clone()));
    let lifecycle = LifecycleManager::new(
        catalog,
        graph,
        registry.clone(),
        vigil::MetricsStore::new(),
        events.clone(),
        LifecycleConfig::default(),
    );

    for name in ["bg_reports", "bg_cleanup", "bg_indexer"] {
        registry
            .register(
                ServiceConfig::new(name, Classification::Background),
                factory_fn(|| async { Ok(Arc::new(Plain) as ServiceInstance) }),
            )
            .await
            .unwrap();
        registry.get(name).await.unwrap();
    }

    let monitor = ResourceMonitor::new(monitor_config(true), events.clone());
    let target: Arc<dyn vigil::monitor::SuspensionTarget> = lifecycle.clone();
    monitor.set_suspension_target(target).await;
    monitor
        .configure_threshold(
            ResourceType::Cpu,
            ResourceThreshold::new(70.0, 85.0, 95.0, 1),
        )
        .await;

    let critical_alerts = Arc::new(AtomicU64::new(0));
    let counted = critical_alerts.clone();
    events.on_alert(Box::new(move |alert| {
        if alert.level >= AlertLevel::Critical {
            counted.fetch_add(1, Ordering::SeqCst);
        }
    }));

    // Drive 90% CPU across the sustained window: two observation ticks.
    monitor.observe(synthetic_metrics(90.0, 50.0)).await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    monitor.observe(synthetic_metrics(90.0, 50.0)).await;

    assert!(critical_alerts.load(Ordering::SeqCst) >= 1);
    for name in ["bg_reports", "bg_cleanup", "bg_indexer"] {
        assert_eq!(
            registry.state_of(name).await.unwrap(),
            LifecycleState::Suspended,
            "{name} should be suspended under sustained CPU pressure"
        );
    }
}

struct CountingCache {
    entries: AtomicU64,
}

impl ClearableCache for CountingCache {
    fn name(&self) -> &str {
        "counting"
    }

    fn clear(&self) -> u64 {
        self.entries.swap(0, Ordering::SeqCst)
    }
}

#[tokio::test]
async fn memory_pressure_clears_registered_caches() {
    let events = EventBus::new();
    let monitor = ResourceMonitor::new(monitor_config(true), events);
    monitor
        .configure_threshold(
            ResourceType::Memory,
            ResourceThreshold::new(75.0, 90.0, 98.0, 0),
        )
        .await;

    let cache = Arc::new(CountingCache {
        entries: AtomicU64::new(42),
    });
    let registered: Arc<dyn ClearableCache> = cache.clone();
    monitor.register_cache(&registered).await;

    monitor.observe(synthetic_metrics(10.0, 95.0)).await;

    assert_eq!(cache.entries.load(Ordering::SeqCst), 0);
    let history = monitor.optimization_history(None).await;
    assert!(
        history
            .iter()
            .any(|r| r.resources_freed.get("cache_entries") == Some(&42.0))
    );
}

#[tokio::test]
async fn weakly_held_caches_do_not_outlive_owner() {
    let events = EventBus::new();
    let monitor = ResourceMonitor::new(monitor_config(true), events);
    monitor
        .configure_threshold(
            ResourceType::Memory,
            ResourceThreshold::new(75.0, 90.0, 98.0, 0),
        )
        .await;

    {
        let cache: Arc<dyn ClearableCache> = Arc::new(CountingCache {
            entries: AtomicU64::new(7),
        });
        monitor.register_cache(&cache).await;
        // Owner drops the cache here.
    }

    monitor.observe(synthetic_metrics(10.0, 95.0)).await;
    let history = monitor.optimization_history(None).await;
    assert!(
        history
            .iter()
            .any(|r| r.resources_freed.get("cache_entries") == Some(&0.0))
    );
}

#[tokio::test]
async fn history_is_bounded() {
    let events = EventBus::new();
    let monitor = ResourceMonitor::new(monitor_config(false), events);
    for i in 0..150 {
        monitor
            .observe(synthetic_metrics(i as f64 / 10.0, 20.0))
            .await;
    }
    assert_eq!(monitor.metrics_history(None).await.len(), 100);
}
