use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use vigil::{
    Classification, EventBus, LazyController, LifecycleState, ManagedService, PreloadRule,
    PreloadTrigger, ServiceConfig, ServiceInstance, ServiceRegistry, SessionToken, factory_fn,
};

struct Echo {
    id: usize,
}

#[async_trait]
impl ManagedService for Echo {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn counting_factory(counter: Arc<AtomicUsize>) -> vigil::ServiceFactory {
    factory_fn(move || {
        let id = counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok(Arc::new(Echo { id }) as ServiceInstance) }
    })
}

async fn registry_with(names: &[&str]) -> Arc<ServiceRegistry> {
    let registry = Arc::new(ServiceRegistry::new(EventBus::new()));
    for name in names {
        registry
            .register(
                ServiceConfig::new(*name, Classification::Optional),
                counting_factory(Arc::new(AtomicUsize::new(0))),
            )
            .await
            .unwrap();
    }
    registry
}

#[tokio::test]
async fn cache_hits_and_misses_are_counted() {
    let registry = registry_with(&["svc"]).await;
    let controller = LazyController::new(registry);

    controller.get("svc").await.unwrap();
    controller.get("svc").await.unwrap();
    controller.get("svc").await.unwrap();

    assert_eq!(controller.cache_misses(), 1);
    assert_eq!(controller.cache_hits(), 2);
}

#[tokio::test]
async fn lru_eviction_unloads_least_recently_used() {
    let registry = registry_with(&["a", "b", "c"]).await;
    let controller = LazyController::with_capacity(registry.clone(), 2);

    controller.get("a").await.unwrap();
    controller.get("b").await.unwrap();
    // Refresh "a" so "b" becomes the eviction victim.
    controller.get("a").await.unwrap();
    controller.get("c").await.unwrap();

    let cached = controller.cached_names().await;
    assert_eq!(cached, vec!["a", "c"]);
    assert_eq!(
        registry.state_of("b").await.unwrap(),
        LifecycleState::Shutdown
    );
}

#[tokio::test]
async fn typed_handle_downcasts_to_concrete_service() {
    let registry = Arc::new(ServiceRegistry::new(EventBus::new()));
    registry
        .register(
            ServiceConfig::new("echo", Classification::Optional),
            factory_fn(|| async { Ok(Arc::new(Echo { id: 7 }) as ServiceInstance) }),
        )
        .await
        .unwrap();
    let controller = LazyController::new(registry);

    let handle = controller.typed_handle::<Echo>("echo");
    let echo = handle.get().await.unwrap();
    assert_eq!(echo.id, 7);
}

#[tokio::test]
async fn session_token_attributes_co_accesses() {
    let registry = registry_with(&["left", "right"]).await;
    let controller = LazyController::new(registry);

    let session = SessionToken::new();
    controller.get_with("left", Some(&session)).await.unwrap();
    controller.get_with("right", Some(&session)).await.unwrap();

    let report = controller.usage_report().await;
    assert!(
        report.patterns["left"]
            .co_accessed_services
            .contains("right")
    );
    assert!(
        report.patterns["right"]
            .co_accessed_services
            .contains("left")
    );
}

#[tokio::test]
async fn accesses_without_session_are_not_co_attributed() {
    let registry = registry_with(&["left", "right"]).await;
    let controller = LazyController::new(registry);

    controller.get("left").await.unwrap();
    controller.get("right").await.unwrap();

    let report = controller.usage_report().await;
    assert!(report.patterns["left"].co_accessed_services.is_empty());
    assert!(report.patterns["right"].co_accessed_services.is_empty());
}

#[tokio::test]
async fn preload_rules_fire_best_effort() {
    let registry = registry_with(&["warm"]).await;
    // "ghost" is not registered: its preload must fail quietly.
    let controller = LazyController::new(registry.clone());
    controller
        .configure_preload_rules(vec![PreloadRule {
            trigger: PreloadTrigger::UserLogin,
            services: vec!["warm".to_string(), "ghost".to_string()],
            priority: 10,
        }])
        .await;

    let loaded = controller.trigger_preload(PreloadTrigger::UserLogin).await;
    assert_eq!(loaded, vec!["warm"]);
    assert_eq!(
        registry.state_of("warm").await.unwrap(),
        LifecycleState::Active
    );
}

#[tokio::test]
async fn frequently_accessed_services_score_for_preload() {
    let registry = registry_with(&["hot", "cold"]).await;
    let controller = LazyController::new(registry);

    for _ in 0..20 {
        controller.get("hot").await.unwrap();
    }
    controller.get("cold").await.unwrap();
    controller.recompute_scores().await;

    let report = controller.usage_report().await;
    let hot_score = report.patterns["hot"].critical_path_score;
    let cold_score = report.patterns["cold"].critical_path_score;
    assert!(hot_score > cold_score);
    // Frequency 1.0 and full recency put the hot service over the
    // preload threshold.
    assert!(hot_score > 0.5);
}

#[tokio::test]
async fn handle_reloads_fresh_instance_after_suspension() {
    let instances = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(ServiceRegistry::new(EventBus::new()));
    registry
        .register(
            ServiceConfig::new("opt", Classification::Optional),
            counting_factory(instances.clone()),
        )
        .await
        .unwrap();
    let controller = LazyController::new(registry.clone());

    controller.get("opt").await.unwrap();
    registry.suspend("opt").await.unwrap();

    // The handle path reloads through the registry after suspension.
    let handle = controller.handle("opt");
    handle.get().await.unwrap();
    assert_eq!(instances.load(Ordering::SeqCst), 2);
    assert_eq!(registry.suspension_count("opt").await.unwrap(), 1);
}

#[tokio::test]
async fn clear_cache_unloads_everything() {
    let registry = registry_with(&["a", "b"]).await;
    let controller = LazyController::new(registry.clone());
    controller.get("a").await.unwrap();
    controller.get("b").await.unwrap();

    let cleared = controller.clear_cache().await;
    assert_eq!(cleared, 2);
    assert!(controller.cached_names().await.is_empty());
    assert_eq!(
        registry.state_of("a").await.unwrap(),
        LifecycleState::Shutdown
    );
}
