use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vigil::{
    EngineConfig, LifecycleState, Metric, MetricQuery, StartupMode, VigilEngine,
};

fn quiet_config(profile: &str) -> EngineConfig {
    EngineConfig {
        profile: profile.to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_starts_builtin_catalog_essential_only() {
    let engine = VigilEngine::new(quiet_config("production")).await.unwrap();
    engine.register_catalog_stubs().await.unwrap();

    let report = engine.start(StartupMode::EssentialOnly).await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(report.records.len(), 4);

    for name in [
        "logging_service",
        "config_manager",
        "auth_service",
        "database_client",
    ] {
        assert_eq!(
            engine.registry().state_of(name).await.unwrap(),
            LifecycleState::Active
        );
    }
    assert_eq!(
        engine.registry().state_of("memory_service").await.unwrap(),
        LifecycleState::NotLoaded
    );

    engine.stop(Duration::from_secs(10)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn minimal_profile_disables_optional_services() {
    let engine = VigilEngine::new(quiet_config("minimal")).await.unwrap();
    engine.register_catalog_stubs().await.unwrap();

    let err = engine.registry().get("memory_service").await.unwrap_err();
    assert!(err.to_string().contains("disabled"));

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_chain_loads_through_handles() {
    let engine = VigilEngine::new(quiet_config("production")).await.unwrap();
    engine.register_catalog_stubs().await.unwrap();

    // memory_service depends on database_client -> config_manager.
    let handle = engine.handle("memory_service");
    handle.get().await.unwrap();

    for name in ["config_manager", "database_client", "memory_service"] {
        assert_eq!(
            engine.registry().state_of(name).await.unwrap(),
            LifecycleState::Active
        );
    }
    engine.stop(Duration::from_secs(10)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn report_covers_every_service_and_estimates() {
    let engine = VigilEngine::new(quiet_config("production")).await.unwrap();
    engine.register_catalog_stubs().await.unwrap();
    engine.start(StartupMode::EssentialOnly).await.unwrap();

    let report = engine.report().await;
    assert_eq!(report.lifecycle.total_services, engine.catalog().len());
    assert!(report.startup_plan.estimated_wall_clock_secs > 0.0);
    assert!(!report.startup_plan.groups.is_empty());
    assert_eq!(report.profile, "production");

    // The report serializes for the operational surface.
    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("auth_service"));

    engine.stop(Duration::from_secs(10)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_metrics_flow_into_store() {
    let engine = VigilEngine::new(quiet_config("production")).await.unwrap();
    engine.register_catalog_stubs().await.unwrap();
    engine.start(StartupMode::EssentialOnly).await.unwrap();

    engine
        .metrics()
        .record(Metric::gauge("custom_metric", 1.5).for_service("auth_service"));
    engine.metrics().flush().await;

    let startup_rows = engine
        .metrics()
        .query(&MetricQuery {
            name: Some("service_startup_ms".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(startup_rows.len(), 4);

    let custom = engine
        .metrics()
        .query(&MetricQuery {
            service_name: Some("auth_service".to_string()),
            ..Default::default()
        })
        .await;
    assert!(custom.iter().any(|m| m.name == "custom_metric"));

    engine.stop(Duration::from_secs(10)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_transitions_are_published() {
    let engine = VigilEngine::new(quiet_config("production")).await.unwrap();
    engine.register_catalog_stubs().await.unwrap();

    let transitions = Arc::new(AtomicUsize::new(0));
    let counted = transitions.clone();
    engine
        .events()
        .on_lifecycle_transition(Box::new(move |_, _, _| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

    engine.handle("auth_service").get().await.unwrap();
    // not_loaded -> loading -> active.
    assert_eq!(transitions.load(Ordering::SeqCst), 2);

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_mode_starts_disabled_services_too() {
    let engine = VigilEngine::new(quiet_config("minimal")).await.unwrap();
    engine.register_catalog_stubs().await.unwrap();

    let report = engine.start(StartupMode::Full).await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(
        engine
            .registry()
            .state_of("analytics_service")
            .await
            .unwrap(),
        LifecycleState::Active
    );

    engine.stop(Duration::from_secs(10)).await;
}
