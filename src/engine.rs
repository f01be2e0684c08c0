use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::audit::{AuditReport, PerformanceAuditor};
use crate::config::{ResourceAnalysis, ServiceCatalog, ServiceConfig};
use crate::error::Result;
use crate::events::EventBus;
use crate::graph::{DependencyGraph, StartupPlan};
use crate::lazy::{LazyController, ServiceHandle, TypedHandle};
use crate::lifecycle::consolidation::ConsolidationManager;
use crate::lifecycle::{LifecycleConfig, LifecycleManager, LifecycleReport, ShutdownReport, StartupMode, StartupReport};
use crate::metrics::benchmark::BenchmarkRunner;
use crate::metrics::{MetricsStore, RegressionDetector};
use crate::monitor::{MonitorConfig, ResourceAlert, ResourceMetrics, ResourceMonitor};
use crate::orchestrator::gpu::{GpuComputeOffloader, GpuOffloadConfig, GpuOffloadStats};
use crate::orchestrator::{OrchestratorConfig, TaskOrchestrator, WorkerStats};
use crate::registry::{ManagedService, ServiceInstance, ServiceFactory, ServiceRegistry, factory_fn};

/// Engine-wide configuration: catalog sources plus per-subsystem
/// settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub catalog_paths: Vec<PathBuf>,
    pub profile: String,
    pub cache_capacity: usize,
    pub lifecycle: LifecycleConfig,
    pub monitor: MonitorConfig,
    pub orchestrator: OrchestratorConfig,
    pub gpu_offload: GpuOffloadConfig,
    pub regression_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_paths: Vec::new(),
            profile: "production".to_string(),
            cache_capacity: 10,
            lifecycle: LifecycleConfig::default(),
            monitor: MonitorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            gpu_offload: GpuOffloadConfig::default(),
            regression_check_interval: Duration::from_secs(60),
        }
    }
}

/// Full JSON snapshot of the engine for the operational surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub generated_at: DateTime<Utc>,
    pub hostname: String,
    pub profile: String,
    pub lifecycle: LifecycleReport,
    pub startup_plan: StartupPlan,
    pub recent_alerts: Vec<ResourceAlert>,
    pub current_metrics: Option<ResourceMetrics>,
    pub worker_stats: WorkerStats,
    pub gpu: GpuOffloadStats,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub resource_analysis: ResourceAnalysis,
    pub catalog_warnings: Vec<String>,
}

/// The composition root: builds and wires every subsystem, owns
/// process-wide state, and exposes the public operational surface.
pub struct VigilEngine {
    config: EngineConfig,
    catalog: Arc<ServiceCatalog>,
    graph: Arc<RwLock<DependencyGraph>>,
    registry: Arc<ServiceRegistry>,
    lazy: Arc<LazyController>,
    lifecycle: Arc<LifecycleManager>,
    consolidation: ConsolidationManager,
    orchestrator: Arc<TaskOrchestrator>,
    gpu: GpuComputeOffloader,
    monitor: Arc<ResourceMonitor>,
    metrics: MetricsStore,
    regression: Arc<RegressionDetector>,
    benchmarks: BenchmarkRunner,
    auditor: PerformanceAuditor,
    events: Arc<EventBus>,
}

impl VigilEngine {
    /// Load the catalog, validate the dependency graph, and construct
    /// every subsystem. No services start here.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        info!("Initializing engine with profile {}", config.profile);

        let catalog = Arc::new(ServiceCatalog::load(&config.catalog_paths, &config.profile)?);
        let graph = Arc::new(RwLock::new(DependencyGraph::build(&catalog)?));
        let events = EventBus::new();

        let registry = Arc::new(ServiceRegistry::new(events.clone()));
        let lazy = LazyController::with_capacity(registry.clone(), config.cache_capacity);
        let metrics = MetricsStore::new();
        let monitor = ResourceMonitor::new(config.monitor.clone(), events.clone());
        let orchestrator = Arc::new(TaskOrchestrator::new(config.orchestrator.clone()));
        let regression = RegressionDetector::new(metrics.clone(), events.clone());
        let benchmarks = BenchmarkRunner::new(metrics.clone());

        let lifecycle = LifecycleManager::new(
            catalog.clone(),
            graph.clone(),
            registry.clone(),
            metrics.clone(),
            events.clone(),
            config.lifecycle.clone(),
        );
        lifecycle.attach_monitor(monitor.clone()).await;
        let suspension_target: Arc<dyn crate::monitor::SuspensionTarget> = lifecycle.clone();
        monitor.set_suspension_target(suspension_target).await;

        let consolidation = ConsolidationManager::new(
            catalog.clone(),
            graph.clone(),
            registry.clone(),
            lazy.clone(),
        );
        let gpu = GpuComputeOffloader::new(config.gpu_offload.clone(), orchestrator.clone());
        let auditor = PerformanceAuditor::new(
            lifecycle.clone(),
            monitor.clone(),
            orchestrator.clone(),
        );

        Ok(Self {
            config,
            catalog,
            graph,
            registry,
            lazy,
            lifecycle,
            consolidation,
            orchestrator,
            gpu,
            monitor,
            metrics,
            regression,
            benchmarks,
            auditor,
            events,
        })
    }

    /// Register a factory for a catalog service.
    pub async fn register_service(&self, name: &str, factory: ServiceFactory) -> Result<()> {
        let config = self
            .catalog
            .get(name)
            .cloned()
            .ok_or_else(|| crate::error::ConfigError::UnknownService {
                name: name.to_string(),
            })?;
        self.registry.register(config, factory).await
    }

    /// Register a service that is not in the catalog, supplying its
    /// full config.
    pub async fn register_with_config(
        &self,
        config: ServiceConfig,
        factory: ServiceFactory,
    ) -> Result<()> {
        self.registry.register(config, factory).await
    }

    /// Register inert placeholder instances for every catalog service
    /// without a factory. Lets the operational surface exercise startup
    /// plans without the real collaborators.
    pub async fn register_catalog_stubs(&self) -> Result<()> {
        for config in self.catalog.services() {
            if self.registry.is_registered(&config.name).await {
                continue;
            }
            let name = config.name.clone();
            self.registry
                .register(
                    config.clone(),
                    factory_fn(move || {
                        let name = name.clone();
                        async move { Ok(Arc::new(StubService { name }) as ServiceInstance) }
                    }),
                )
                .await?;
        }
        debug!("Catalog stubs registered");
        Ok(())
    }

    /// Start services for a mode and launch the background machinery.
    pub async fn start(&self, mode: StartupMode) -> Result<StartupReport> {
        let report = self.lifecycle.start(mode).await?;
        self.regression
            .start(self.config.regression_check_interval)
            .await;
        Ok(report)
    }

    /// Stop everything: services in shutdown order, then the background
    /// tasks and worker pools.
    pub async fn stop(&self, total_timeout: Duration) -> ShutdownReport {
        let report = self.lifecycle.shutdown_all(total_timeout).await;
        self.monitor.stop().await;
        self.regression.stop().await;
        self.lazy.stop_background_tasks().await;
        self.gpu.shutdown(true).await;
        self.orchestrator.shutdown(true).await;
        report
    }

    /// Build the operational snapshot report.
    pub async fn report(&self) -> EngineReport {
        let enabled: Vec<String> = self
            .catalog
            .services()
            .filter(|c| c.enabled)
            .map(|c| c.name.clone())
            .collect();
        let startup_plan = self.graph.read().await.plan(&enabled);

        EngineReport {
            generated_at: Utc::now(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            profile: self.config.profile.clone(),
            lifecycle: self.lifecycle.lifecycle_report().await,
            startup_plan,
            recent_alerts: self.monitor.recent_alerts(Some(20)).await,
            current_metrics: self.monitor.current_metrics().await,
            worker_stats: self.orchestrator.worker_stats(),
            gpu: self.gpu.stats(),
            cache_hits: self.lazy.cache_hits(),
            cache_misses: self.lazy.cache_misses(),
            resource_analysis: self.catalog.analyze_resources(),
            catalog_warnings: self.catalog.load_warnings().to_vec(),
        }
    }

    pub fn handle(&self, name: impl Into<String>) -> ServiceHandle {
        self.lazy.handle(name)
    }

    pub fn typed_handle<T: ManagedService>(&self, name: impl Into<String>) -> TypedHandle<T> {
        self.lazy.typed_handle(name)
    }

    pub fn catalog(&self) -> &Arc<ServiceCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn lazy(&self) -> &Arc<LazyController> {
        &self.lazy
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn consolidation(&self) -> &ConsolidationManager {
        &self.consolidation
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn gpu_offloader(&self) -> &GpuComputeOffloader {
        &self.gpu
    }

    pub fn auditor(&self) -> &PerformanceAuditor {
        &self.auditor
    }

    /// Run one bottleneck audit over the live engine state.
    pub async fn audit(&self) -> AuditReport {
        self.auditor.audit().await
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    pub fn regression(&self) -> &Arc<RegressionDetector> {
        &self.regression
    }

    pub fn benchmarks(&self) -> &BenchmarkRunner {
        &self.benchmarks
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

impl std::fmt::Debug for VigilEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VigilEngine")
            .field("profile", &self.config.profile)
            .field("services", &self.catalog.len())
            .finish()
    }
}

/// Inert instance used when the operational surface runs without real
/// collaborators.
struct StubService {
    name: String,
}

#[async_trait]
impl ManagedService for StubService {
    fn api_contract(&self) -> Vec<String> {
        vec![format!("{}::status", self.name)]
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
