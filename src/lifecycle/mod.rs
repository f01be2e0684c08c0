use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Classification, ServiceCatalog};
use crate::error::{LifecycleError, Result};
use crate::events::EventBus;
use crate::graph::DependencyGraph;
use crate::metrics::{Metric, MetricsStore};
use crate::monitor::{ResourceMonitor, SuspensionTarget};
use crate::registry::{LifecycleState, ServiceRegistry, ShutdownOutcome};

pub mod consolidation;

/// Which services a startup run includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// Essential and enabled services only.
    EssentialOnly,
    /// Essential plus high-priority optional services.
    FastStart,
    /// Every enabled service.
    Normal,
    /// Every registered service, ignoring the profile's enabled flags.
    Full,
}

impl std::str::FromStr for StartupMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "essential" | "essential_only" | "essential-only" => Ok(StartupMode::EssentialOnly),
            "fast" | "fast_start" | "fast-start" => Ok(StartupMode::FastStart),
            "normal" => Ok(StartupMode::Normal),
            "full" => Ok(StartupMode::Full),
            other => Err(format!("unknown startup mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub idle_check_interval: Duration,
    /// Optional services at or below this priority join FAST_START.
    pub fast_start_priority_cutoff: i32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_check_interval: Duration::from_secs(30),
            fast_start_priority_cutoff: 50,
        }
    }
}

/// Per-service outcome of one startup run.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStartupRecord {
    pub name: String,
    pub success: bool,
    pub duration_secs: f64,
    pub estimated_secs: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub mode: StartupMode,
    pub groups: Vec<Vec<String>>,
    pub records: Vec<ServiceStartupRecord>,
    pub estimated_wall_clock_secs: f64,
    pub actual_wall_clock_secs: f64,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub outcomes: HashMap<String, ShutdownOutcome>,
    pub forced_count: u64,
}

/// Orchestrates startup sequences, idle suspension, graceful shutdown,
/// and feeds pressure-driven suspension requests from the monitor into
/// the registry.
pub struct LifecycleManager {
    catalog: Arc<ServiceCatalog>,
    graph: Arc<RwLock<DependencyGraph>>,
    registry: Arc<ServiceRegistry>,
    metrics: MetricsStore,
    events: Arc<EventBus>,
    config: LifecycleConfig,
    monitor: Mutex<Option<Arc<ResourceMonitor>>>,
    startup_records: Mutex<HashMap<String, ServiceStartupRecord>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    monitors_started: AtomicBool,
}

impl LifecycleManager {
    pub fn new(
        catalog: Arc<ServiceCatalog>,
        graph: Arc<RwLock<DependencyGraph>>,
        registry: Arc<ServiceRegistry>,
        metrics: MetricsStore,
        events: Arc<EventBus>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            graph,
            registry,
            metrics,
            events,
            config,
            monitor: Mutex::new(None),
            startup_records: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            monitors_started: AtomicBool::new(false),
        })
    }

    /// Attach the resource monitor launched after the first startup.
    pub async fn attach_monitor(&self, monitor: Arc<ResourceMonitor>) {
        *self.monitor.lock().await = Some(monitor);
    }

    fn services_for_mode(&self, mode: StartupMode) -> Vec<String> {
        let mut selected: Vec<&crate::config::ServiceConfig> = self
            .catalog
            .services()
            .filter(|config| match mode {
                StartupMode::EssentialOnly => {
                    config.classification == Classification::Essential && config.enabled
                }
                StartupMode::FastStart => {
                    config.enabled
                        && (config.classification == Classification::Essential
                            || (config.classification == Classification::Optional
                                && config.startup_priority
                                    <= self.config.fast_start_priority_cutoff))
                }
                StartupMode::Normal => config.enabled,
                StartupMode::Full => true,
            })
            .collect();
        selected.sort_by_key(|config| (config.startup_priority, config.name.clone()));
        selected.into_iter().map(|c| c.name.clone()).collect()
    }

    /// Start services for a mode: compute the plan, launch each parallel
    /// group concurrently, and start the background monitors once after
    /// the final group.
    ///
    /// A load failure of an essential service aborts the run; optional
    /// and background failures are recorded and skipped.
    pub async fn start(self: &Arc<Self>, mode: StartupMode) -> Result<StartupReport> {
        let included = self.services_for_mode(mode);
        let plan = self.graph.read().await.plan(&included);
        info!(
            "Startup ({:?}): {} services in {} groups, estimated {:.1}s",
            mode,
            included.len(),
            plan.groups.len(),
            plan.estimated_wall_clock_secs
        );

        let run_started = Instant::now();
        let mut records = Vec::new();
        let mut failed = Vec::new();

        for (rank, group) in plan.groups.iter().enumerate() {
            debug!("Starting group {}: {}", rank, group.join(", "));
            let launches = group.iter().map(|name| {
                let registry = self.registry.clone();
                let name = name.clone();
                async move {
                    let started = Instant::now();
                    let result = if mode == StartupMode::Full {
                        registry.get_ignoring_profile(&name).await
                    } else {
                        registry.get(&name).await
                    };
                    (name, started.elapsed(), result.map(|_| ()))
                }
            });

            for (name, duration, result) in join_all(launches).await {
                let estimated = plan.estimates_secs.get(&name).copied().unwrap_or(0.0);
                let record = ServiceStartupRecord {
                    name: name.clone(),
                    success: result.is_ok(),
                    duration_secs: duration.as_secs_f64(),
                    estimated_secs: estimated,
                    error: result.as_ref().err().map(|e| e.to_string()),
                };
                self.metrics.record(
                    Metric::timer("service_startup_ms", duration.as_secs_f64() * 1000.0)
                        .for_service(&name)
                        .with_unit("ms"),
                );

                if let Err(e) = result {
                    let classification = self
                        .catalog
                        .get(&name)
                        .map(|c| c.classification)
                        .unwrap_or(Classification::Optional);
                    if classification == Classification::Essential {
                        return Err(LifecycleError::EssentialStartupFailure {
                            name,
                            reason: e.to_string(),
                        }
                        .into());
                    }
                    warn!("Non-essential service {} failed to start: {}", name, e);
                    failed.push(name.clone());
                }
                records.push(record);
            }
        }

        let actual = run_started.elapsed().as_secs_f64();
        {
            let mut stored = self.startup_records.lock().await;
            for record in &records {
                stored.insert(record.name.clone(), record.clone());
            }
        }
        self.metrics
            .record(Metric::timer("startup_wall_clock_ms", actual * 1000.0).with_unit("ms"));

        self.start_monitors_once().await;

        info!(
            "Startup ({:?}) complete in {:.2}s (estimated {:.2}s), {} failed",
            mode,
            actual,
            plan.estimated_wall_clock_secs,
            failed.len()
        );
        Ok(StartupReport {
            mode,
            groups: plan.groups,
            records,
            estimated_wall_clock_secs: plan.estimated_wall_clock_secs,
            actual_wall_clock_secs: actual,
            failed,
        })
    }

    /// Launch the idle detector and resource sampler exactly once,
    /// regardless of how many startup runs happen.
    async fn start_monitors_once(self: &Arc<Self>) {
        if self.monitors_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let manager = self.clone();
        let interval = self.config.idle_check_interval;
        let idle_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let suspended = manager.suspend_idle_services().await;
                if !suspended.is_empty() {
                    info!("Idle detector suspended: {}", suspended.join(", "));
                }
            }
        });
        self.background.lock().await.push(idle_task);

        if let Some(monitor) = self.monitor.lock().await.clone() {
            monitor.start().await;
        }
        debug!("Background monitors launched");
    }

    /// One idle-detection pass: suspend every active, non-essential
    /// service whose idle timeout has elapsed since its last access.
    pub async fn suspend_idle_services(&self) -> Vec<String> {
        let mut suspended = Vec::new();
        for snapshot in self.registry.snapshot().await {
            if snapshot.state != LifecycleState::Active
                || snapshot.classification == Classification::Essential
            {
                continue;
            }
            let Ok(config) = self.registry.config(&snapshot.name).await else {
                continue;
            };
            let Some(idle_timeout) = config.idle_timeout_secs else {
                continue;
            };
            let Ok(Some(since_access)) = self.registry.time_since_access(&snapshot.name).await
            else {
                continue;
            };
            if since_access >= Duration::from_secs(idle_timeout) {
                match self.registry.suspend(&snapshot.name).await {
                    Ok(()) => suspended.push(snapshot.name.clone()),
                    Err(e) => debug!("Idle suspension of {} skipped: {}", snapshot.name, e),
                }
            }
        }
        suspended
    }

    /// Gracefully shut down one service with an explicit budget.
    pub async fn shutdown_service(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<ShutdownOutcome> {
        self.registry.shutdown(name, timeout).await
    }

    /// Walk the shutdown order, splitting the total budget evenly over
    /// the services still holding state.
    pub async fn shutdown_all(&self, total_timeout: Duration) -> ShutdownReport {
        self.stop_background_tasks().await;

        let snapshots = self.registry.snapshot().await;
        let live: Vec<String> = snapshots
            .iter()
            .filter(|s| {
                matches!(
                    s.state,
                    LifecycleState::Active | LifecycleState::Idle | LifecycleState::Suspended
                )
            })
            .map(|s| s.name.clone())
            .collect();

        if live.is_empty() {
            return ShutdownReport {
                outcomes: HashMap::new(),
                forced_count: self.registry.forced_shutdowns(),
            };
        }

        let per_service = total_timeout / live.len() as u32;
        let order = self.graph.read().await.shutdown_order(&live);
        info!(
            "Shutting down {} services, {:.1}s budget each",
            live.len(),
            per_service.as_secs_f64()
        );

        let mut outcomes = HashMap::new();
        for name in order {
            match self.registry.shutdown(&name, Some(per_service)).await {
                Ok(outcome) => {
                    outcomes.insert(name, outcome);
                }
                Err(e) => {
                    warn!("Shutdown of {} failed: {}", name, e);
                }
            }
        }

        ShutdownReport {
            outcomes,
            forced_count: self.registry.forced_shutdowns(),
        }
    }

    pub async fn stop_background_tasks(&self) {
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        self.monitors_started.store(false, Ordering::Release);
    }

    /// Snapshot report: every service with its state, metrics, and
    /// startup estimate vs actual.
    pub async fn lifecycle_report(&self) -> LifecycleReport {
        let services = self.registry.snapshot().await;
        let active = services
            .iter()
            .filter(|s| s.state == LifecycleState::Active)
            .count();
        let suspended = services
            .iter()
            .filter(|s| s.state == LifecycleState::Suspended)
            .count();
        LifecycleReport {
            generated_at: Utc::now(),
            active_services: active,
            suspended_services: suspended,
            total_services: services.len(),
            services,
            startup_records: self.startup_records.lock().await.clone(),
            graceful_shutdowns: self.registry.graceful_shutdowns(),
            forced_shutdowns: self.registry.forced_shutdowns(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub generated_at: chrono::DateTime<Utc>,
    pub active_services: usize,
    pub suspended_services: usize,
    pub total_services: usize,
    pub services: Vec<crate::registry::ServiceSnapshot>,
    pub startup_records: HashMap<String, ServiceStartupRecord>,
    pub graceful_shutdowns: u64,
    pub forced_shutdowns: u64,
}

#[async_trait]
impl SuspensionTarget for LifecycleManager {
    async fn suspend_by_classification(&self, classification: Classification) -> Vec<String> {
        let mut suspended = Vec::new();
        for snapshot in self.registry.snapshot().await {
            if snapshot.classification != classification
                || !matches!(
                    snapshot.state,
                    LifecycleState::Active | LifecycleState::Idle
                )
            {
                continue;
            }
            match self.registry.suspend(&snapshot.name).await {
                Ok(()) => suspended.push(snapshot.name),
                Err(e) => debug!(
                    "Pressure suspension of {} skipped: {}",
                    snapshot.name, e
                ),
            }
        }
        suspended
    }

    async fn suspend_excluding_prefixes(&self, prefixes: &[String]) -> Vec<String> {
        let mut suspended = Vec::new();
        for snapshot in self.registry.snapshot().await {
            if snapshot.classification == Classification::Essential
                || !matches!(
                    snapshot.state,
                    LifecycleState::Active | LifecycleState::Idle
                )
            {
                continue;
            }
            if prefixes
                .iter()
                .any(|prefix| snapshot.name.starts_with(prefix.as_str()))
            {
                continue;
            }
            match self.registry.suspend(&snapshot.name).await {
                Ok(()) => suspended.push(snapshot.name),
                Err(e) => debug!(
                    "Pressure suspension of {} skipped: {}",
                    snapshot.name, e
                ),
            }
        }
        suspended
    }
}
