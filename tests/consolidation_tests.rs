use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::RwLock;
use vigil::lifecycle::consolidation::{ConsolidationManager, ConsolidationType, RiskLevel};
use vigil::{
    Classification, DependencyGraph, EventBus, LazyController, LifecycleState, ManagedService,
    ServiceCatalog, ServiceConfig, ServiceInstance, ServiceRegistry, factory_fn,
};

struct ApiService {
    methods: Vec<String>,
}

#[async_trait]
impl ManagedService for ApiService {
    fn api_contract(&self) -> Vec<String> {
        self.methods.clone()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn api_factory(methods: Vec<&str>) -> vigil::ServiceFactory {
    let methods: Vec<String> = methods.into_iter().map(String::from).collect();
    factory_fn(move || {
        let methods = methods.clone();
        async move { Ok(Arc::new(ApiService { methods }) as ServiceInstance) }
    })
}

struct Stack {
    catalog: Arc<ServiceCatalog>,
    graph: Arc<RwLock<DependencyGraph>>,
    registry: Arc<ServiceRegistry>,
    manager: ConsolidationManager,
}

async fn build_stack(configs: Vec<ServiceConfig>) -> Stack {
    let catalog = Arc::new(ServiceCatalog::from_configs(configs, "production").unwrap());
    let graph = Arc::new(RwLock::new(DependencyGraph::build(&catalog).unwrap()));
    let events = EventBus::new();
    let registry = Arc::new(ServiceRegistry::new(events));
    let lazy = LazyController::new(registry.clone());
    let manager = ConsolidationManager::new(
        catalog.clone(),
        graph.clone(),
        registry.clone(),
        lazy,
    );
    Stack {
        catalog,
        graph,
        registry,
        manager,
    }
}

fn media_configs() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig::new("media_primary", Classification::Optional)
            .with_priority(10)
            .with_memory_mb(128)
            .with_consolidation_group("media"),
        ServiceConfig::new("media_thumbs", Classification::Background)
            .with_priority(60)
            .with_memory_mb(100)
            .with_consolidation_group("media"),
        ServiceConfig::new("media_tags", Classification::Background)
            .with_priority(70)
            .with_memory_mb(100)
            .with_consolidation_group("media"),
    ]
}

#[tokio::test]
async fn declared_groups_surface_as_opportunities() {
    let stack = build_stack(media_configs()).await;
    let opportunities = stack.manager.identify_opportunities().await;

    let declared: Vec<_> = opportunities
        .iter()
        .filter(|o| o.consolidation_type == ConsolidationType::Declared)
        .collect();
    assert_eq!(declared.len(), 1);
    assert_eq!(
        declared[0].services,
        vec!["media_primary", "media_tags", "media_thumbs"]
    );
}

#[tokio::test]
async fn memory_buckets_require_three_members() {
    let stack = build_stack(vec![
        ServiceConfig::new("a", Classification::Optional).with_memory_mb(100),
        ServiceConfig::new("b", Classification::Optional).with_memory_mb(120),
    ])
    .await;
    let opportunities = stack.manager.identify_opportunities().await;
    assert!(
        opportunities
            .iter()
            .all(|o| o.consolidation_type != ConsolidationType::MemoryBased)
    );

    let stack = build_stack(vec![
        ServiceConfig::new("a", Classification::Optional).with_memory_mb(100),
        ServiceConfig::new("b", Classification::Optional).with_memory_mb(120),
        ServiceConfig::new("c", Classification::Background).with_memory_mb(90),
    ])
    .await;
    let opportunities = stack.manager.identify_opportunities().await;
    let memory: Vec<_> = opportunities
        .iter()
        .filter(|o| o.consolidation_type == ConsolidationType::MemoryBased)
        .collect();
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0].estimated_savings_percent, 15.0);
}

#[tokio::test]
async fn plan_picks_best_classified_lowest_priority_primary() {
    let stack = build_stack(media_configs()).await;
    let services: Vec<String> = vec![
        "media_primary".into(),
        "media_thumbs".into(),
        "media_tags".into(),
    ];
    let plan = stack
        .manager
        .plan(&services, ConsolidationType::Declared)
        .await
        .unwrap();

    assert_eq!(plan.primary, "media_primary");
    assert_eq!(plan.secondaries.len(), 2);
    // 25% of the 200MB of secondary footprint.
    assert!((plan.estimated_memory_savings_mb - 50.0).abs() < 1e-9);
    assert!(plan.risk < RiskLevel::Critical);
    assert!(!plan.migration_steps.is_empty());
    assert!(!plan.rollback_steps.is_empty());
}

#[tokio::test]
async fn contract_collisions_block_execution() {
    let stack = build_stack(media_configs()).await;
    stack
        .registry
        .register(
            stack.catalog.get("media_primary").unwrap().clone(),
            api_factory(vec!["render", "fetch"]),
        )
        .await
        .unwrap();
    stack
        .registry
        .register(
            stack.catalog.get("media_thumbs").unwrap().clone(),
            api_factory(vec!["render"]),
        )
        .await
        .unwrap();
    stack.registry.get("media_primary").await.unwrap();
    stack.registry.get("media_thumbs").await.unwrap();

    let services: Vec<String> = vec!["media_primary".into(), "media_thumbs".into()];
    let plan = stack
        .manager
        .plan(&services, ConsolidationType::Declared)
        .await
        .unwrap();
    let validation = stack.manager.validate(&plan).await;

    assert!(!validation.can_execute);
    assert!(
        validation
            .reasons
            .iter()
            .any(|r| r.contains("collision") && r.contains("render"))
    );

    let err = stack.manager.apply(&plan.id).await.unwrap_err();
    assert!(err.to_string().contains("blocked"));
}

#[tokio::test]
async fn execution_redirects_secondary_names_to_primary() {
    let stack = build_stack(media_configs()).await;
    stack
        .registry
        .register(
            stack.catalog.get("media_primary").unwrap().clone(),
            api_factory(vec!["render"]),
        )
        .await
        .unwrap();
    stack
        .registry
        .register(
            stack.catalog.get("media_thumbs").unwrap().clone(),
            api_factory(vec!["thumbnail"]),
        )
        .await
        .unwrap();
    stack.registry.get("media_primary").await.unwrap();
    stack.registry.get("media_thumbs").await.unwrap();

    let services: Vec<String> = vec!["media_primary".into(), "media_thumbs".into()];
    let plan = stack
        .manager
        .plan(&services, ConsolidationType::Declared)
        .await
        .unwrap();
    let outcome = stack.manager.apply(&plan.id).await.unwrap();
    assert!(!outcome.rolled_back);

    // The retired name now answers through the primary.
    let via_alias = stack.registry.get("media_thumbs").await.unwrap();
    assert_eq!(via_alias.api_contract(), vec!["render"]);
    assert_eq!(
        stack.registry.state_of("media_primary").await.unwrap(),
        LifecycleState::Active
    );
}

#[tokio::test]
async fn dependents_are_rewired_onto_primary() {
    let mut configs = media_configs();
    configs.push(
        ServiceConfig::new("gallery", Classification::Optional)
            .with_priority(90)
            .with_dependencies(["media_thumbs"]),
    );
    let stack = build_stack(configs).await;
    stack
        .registry
        .register(
            stack.catalog.get("media_primary").unwrap().clone(),
            api_factory(vec!["render"]),
        )
        .await
        .unwrap();
    stack
        .registry
        .register(
            stack.catalog.get("media_thumbs").unwrap().clone(),
            api_factory(vec!["thumbnail"]),
        )
        .await
        .unwrap();

    let services: Vec<String> = vec!["media_primary".into(), "media_thumbs".into()];
    let plan = stack
        .manager
        .plan(&services, ConsolidationType::Declared)
        .await
        .unwrap();
    stack.manager.apply(&plan.id).await.unwrap();

    let graph = stack.graph.read().await;
    assert!(
        graph
            .dependents_of("media_primary")
            .contains(&"gallery".to_string())
    );
    assert!(graph.dependents_of("media_thumbs").is_empty());
}

#[tokio::test]
async fn high_risk_failure_rolls_back() {
    // Three essential services push the risk assessment to high, and a
    // primary whose factory fails forces a mid-execution failure.
    let configs = vec![
        ServiceConfig::new("core_a", Classification::Essential).with_priority(1),
        ServiceConfig::new("core_b", Classification::Essential).with_priority(2),
        ServiceConfig::new("core_c", Classification::Essential).with_priority(3),
    ];
    let stack = build_stack(configs).await;
    stack
        .registry
        .register(
            stack.catalog.get("core_a").unwrap().clone(),
            factory_fn(|| async { Err(anyhow::anyhow!("primary cannot start")) }),
        )
        .await
        .unwrap();
    stack
        .registry
        .register(
            stack.catalog.get("core_b").unwrap().clone(),
            api_factory(vec![]),
        )
        .await
        .unwrap();
    stack
        .registry
        .register(
            stack.catalog.get("core_c").unwrap().clone(),
            api_factory(vec![]),
        )
        .await
        .unwrap();

    let services: Vec<String> = vec!["core_a".into(), "core_b".into(), "core_c".into()];
    let plan = stack
        .manager
        .plan(&services, ConsolidationType::Declared)
        .await
        .unwrap();
    assert_eq!(plan.risk, RiskLevel::High);
    assert_eq!(plan.primary, "core_a");

    let err = stack.manager.apply(&plan.id).await.unwrap_err();
    assert!(err.to_string().contains("failed"));

    // Rollback removed the aliases: the secondaries answer for
    // themselves again.
    assert!(stack.registry.aliases().await.is_empty());
    let outcomes = stack.manager.outcomes().await;
    assert!(outcomes.iter().any(|o| o.rolled_back));
}
