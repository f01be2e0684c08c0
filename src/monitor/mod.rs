use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Classification;
use crate::events::EventBus;

pub mod gpu;
mod sampler;

pub use sampler::ResourceSampler;

/// History depth for metric snapshots, alerts, and optimization results.
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
    Disk,
    Network,
    Gpu,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Disk => "disk",
            ResourceType::Network => "network",
            ResourceType::Gpu => "gpu",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// Escalation thresholds for one resource. A violation only becomes an
/// alert after the threshold has been exceeded continuously for
/// `sustained_duration`.
#[derive(Debug, Clone, Copy)]
pub struct ResourceThreshold {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
    pub sustained_duration: Duration,
}

impl ResourceThreshold {
    pub fn new(warning: f64, critical: f64, emergency: f64, sustained_secs: u64) -> Self {
        Self {
            warning,
            critical,
            emergency,
            sustained_duration: Duration::from_secs(sustained_secs),
        }
    }

    fn level_for(&self, value: f64) -> Option<AlertLevel> {
        if value >= self.emergency {
            Some(AlertLevel::Emergency)
        } else if value >= self.critical {
            Some(AlertLevel::Critical)
        } else if value >= self.warning {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }
}

/// One point-in-time snapshot of system resources.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub memory_available_mb: f64,
    pub disk_percent: f64,
    pub disk_free_gb: f64,
    pub network_bytes_sent: u64,
    pub network_bytes_recv: u64,
    pub gpu_percent: Option<f64>,
    pub gpu_memory_percent: Option<f64>,
    pub process_count: u32,
    pub thread_count: u32,
    pub open_files: u32,
}

impl ResourceMetrics {
    pub fn value_for(&self, resource: ResourceType) -> Option<f64> {
        match resource {
            ResourceType::Cpu => Some(self.cpu_percent),
            ResourceType::Memory => Some(self.memory_percent),
            ResourceType::Disk => Some(self.disk_percent),
            ResourceType::Gpu => self.gpu_percent,
            ResourceType::Network => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceAlert {
    pub resource_type: ResourceType,
    pub level: AlertLevel,
    pub current_value: f64,
    pub threshold_value: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationAction {
    MemoryReclaim,
    ClearCaches,
    SuspendBackgroundServices,
    SuspendOptionalServices,
    SuspendCpuHeavyServices,
    LowerProcessPriority,
    GpuCacheClear,
}

/// Outcome of one auto-optimization step, including a best-effort map
/// of resources freed (e.g. "memory_mb", "cache_entries").
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub action: OptimizationAction,
    pub success: bool,
    pub message: String,
    pub resources_freed: HashMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

/// A cache that can be asked to drop its contents under memory
/// pressure. Registered weakly: a cleared cache never outlives its
/// owner because of the monitor.
pub trait ClearableCache: Send + Sync {
    fn name(&self) -> &str;
    /// Drop cached entries, returning how many were cleared.
    fn clear(&self) -> u64;
}

/// Lifecycle-side surface the monitor drives when pressure calls for
/// suspending services.
#[async_trait]
pub trait SuspensionTarget: Send + Sync {
    /// Suspend every active service of a classification; returns the
    /// names actually suspended.
    async fn suspend_by_classification(&self, classification: Classification) -> Vec<String>;

    /// Suspend active non-essential services whose names do not start
    /// with any of the given prefixes; returns the names suspended.
    async fn suspend_excluding_prefixes(&self, prefixes: &[String]) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub auto_optimize: bool,
    pub enable_gpu: bool,
    /// Name prefixes shielded from CPU-pressure suspension.
    pub essential_prefixes: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            auto_optimize: true,
            enable_gpu: true,
            essential_prefixes: vec![
                "auth".to_string(),
                "config".to_string(),
                "logging".to_string(),
                "database".to_string(),
            ],
        }
    }
}

fn default_thresholds() -> HashMap<ResourceType, ResourceThreshold> {
    HashMap::from([
        (ResourceType::Cpu, ResourceThreshold::new(70.0, 85.0, 95.0, 30)),
        (ResourceType::Memory, ResourceThreshold::new(75.0, 90.0, 98.0, 20)),
        (ResourceType::Disk, ResourceThreshold::new(80.0, 90.0, 95.0, 60)),
        (ResourceType::Network, ResourceThreshold::new(70.0, 85.0, 95.0, 30)),
        (ResourceType::Gpu, ResourceThreshold::new(80.0, 90.0, 95.0, 30)),
    ])
}

struct MonitorState {
    thresholds: HashMap<ResourceType, ResourceThreshold>,
    history: VecDeque<ResourceMetrics>,
    alerts: VecDeque<ResourceAlert>,
    optimizations: VecDeque<OptimizationResult>,
    pressure_since: HashMap<ResourceType, Instant>,
    caches: Vec<Weak<dyn ClearableCache>>,
    gpu_hooks: Vec<Box<dyn Fn() -> u64 + Send + Sync>>,
    lifecycle: Option<Arc<dyn SuspensionTarget>>,
}

/// Samples system resources on an interval, detects sustained pressure,
/// and drives multi-level cleanup actions when auto-optimization is on.
pub struct ResourceMonitor {
    config: MonitorConfig,
    sampler: ResourceSampler,
    state: Mutex<MonitorState>,
    events: Arc<EventBus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, events: Arc<EventBus>) -> Arc<Self> {
        let gpu_available = config.enable_gpu && gpu::detect();
        if gpu_available {
            info!("GPU monitoring enabled");
        } else {
            debug!("GPU monitoring disabled or no GPU detected");
        }
        Arc::new(Self {
            sampler: ResourceSampler::new(gpu_available),
            config,
            state: Mutex::new(MonitorState {
                thresholds: default_thresholds(),
                history: VecDeque::with_capacity(HISTORY_LIMIT),
                alerts: VecDeque::with_capacity(HISTORY_LIMIT),
                optimizations: VecDeque::with_capacity(HISTORY_LIMIT),
                pressure_since: HashMap::new(),
                caches: Vec::new(),
                gpu_hooks: Vec::new(),
                lifecycle: None,
            }),
            events,
            task: Mutex::new(None),
        })
    }

    /// Wire the lifecycle surface used for pressure-driven suspension.
    pub async fn set_suspension_target(&self, target: Arc<dyn SuspensionTarget>) {
        self.state.lock().await.lifecycle = Some(target);
    }

    /// Register a cache for pressure-driven clearing. Held weakly.
    pub async fn register_cache(&self, cache: &Arc<dyn ClearableCache>) {
        let mut state = self.state.lock().await;
        state.caches.push(Arc::downgrade(cache));
    }

    pub async fn register_gpu_cache_hook<F>(&self, hook: F)
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.state.lock().await.gpu_hooks.push(Box::new(hook));
    }

    /// Override thresholds for one resource at runtime.
    pub async fn configure_threshold(&self, resource: ResourceType, threshold: ResourceThreshold) {
        self.state.lock().await.thresholds.insert(resource, threshold);
    }

    /// Start the periodic sampling loop. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Resource monitoring already started");
            return;
        }
        let monitor = self.clone();
        let interval = self.config.check_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.tick().await;
            }
        }));
        info!(
            "Resource monitoring started with {:.0}s interval",
            self.config.check_interval.as_secs_f64()
        );
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            info!("Resource monitoring stopped");
        }
    }

    /// One sampling cycle: collect, record, evaluate, optimize.
    pub async fn tick(&self) {
        let metrics = self.sampler.sample().await;
        self.observe(metrics).await;
    }

    /// Evaluate a metrics snapshot against thresholds. Split from
    /// [`tick`] so synthetic snapshots can drive the pressure logic.
    pub async fn observe(&self, metrics: ResourceMetrics) {
        let (alerts, critical) = {
            let mut state = self.state.lock().await;
            state.history.push_back(metrics.clone());
            while state.history.len() > HISTORY_LIMIT {
                state.history.pop_front();
            }
            let alerts = Self::evaluate_pressure(&mut state, &metrics);
            let critical: Vec<ResourceType> = alerts
                .iter()
                .filter(|a| a.level >= AlertLevel::Critical)
                .map(|a| a.resource_type)
                .collect();
            for alert in &alerts {
                state.alerts.push_back(alert.clone());
                while state.alerts.len() > HISTORY_LIMIT {
                    state.alerts.pop_front();
                }
            }
            (alerts, critical)
        };

        for alert in &alerts {
            self.events.emit_alert(alert);
        }

        if self.config.auto_optimize && !critical.is_empty() {
            self.trigger_cleanup(&critical).await;
        }
    }

    fn evaluate_pressure(
        state: &mut MonitorState,
        metrics: &ResourceMetrics,
    ) -> Vec<ResourceAlert> {
        let mut alerts = Vec::new();
        let resources = [
            ResourceType::Cpu,
            ResourceType::Memory,
            ResourceType::Disk,
            ResourceType::Gpu,
        ];

        for resource in resources {
            let Some(threshold) = state.thresholds.get(&resource).copied() else {
                continue;
            };
            let Some(value) = metrics.value_for(resource) else {
                // GPU sensing absent: thresholds disabled without error.
                continue;
            };

            match threshold.level_for(value) {
                Some(level) => {
                    let since = state
                        .pressure_since
                        .entry(resource)
                        .or_insert_with(Instant::now);
                    if since.elapsed() >= threshold.sustained_duration {
                        let threshold_value = match level {
                            AlertLevel::Emergency => threshold.emergency,
                            AlertLevel::Critical => threshold.critical,
                            _ => threshold.warning,
                        };
                        alerts.push(ResourceAlert {
                            resource_type: resource,
                            level,
                            current_value: value,
                            threshold_value,
                            message: format!(
                                "{} at {:.1}% exceeded the {:.1}% threshold for {:.0}s",
                                resource.as_str(),
                                value,
                                threshold_value,
                                since.elapsed().as_secs_f64()
                            ),
                            timestamp: metrics.timestamp,
                        });
                    }
                }
                None => {
                    // Recovery clears the pressure state.
                    state.pressure_since.remove(&resource);
                }
            }
        }
        alerts
    }

    /// Run the cleanup escalation for the resources currently critical.
    pub async fn trigger_cleanup(&self, critical: &[ResourceType]) -> Vec<OptimizationResult> {
        let mut results = Vec::new();

        if critical.contains(&ResourceType::Memory) {
            results.extend(self.optimize_memory().await);
        }
        if critical.contains(&ResourceType::Cpu) {
            results.extend(self.optimize_cpu().await);
        }
        if critical.contains(&ResourceType::Gpu) {
            results.extend(self.optimize_gpu().await);
        }

        let mut state = self.state.lock().await;
        for result in &results {
            self.events.emit_optimization(result);
            state.optimizations.push_back(result.clone());
            while state.optimizations.len() > HISTORY_LIMIT {
                state.optimizations.pop_front();
            }
        }
        results
    }

    async fn optimize_memory(&self) -> Vec<OptimizationResult> {
        let mut results = Vec::new();
        results.push(self.reclaim_memory().await);
        results.push(self.clear_registered_caches().await);

        let lifecycle = self.state.lock().await.lifecycle.clone();
        if let Some(lifecycle) = lifecycle {
            let suspended = lifecycle
                .suspend_by_classification(Classification::Background)
                .await;
            results.push(suspension_result(
                OptimizationAction::SuspendBackgroundServices,
                &suspended,
            ));

            // Escalate to optional services when memory is still
            // critical after background suspension.
            let critical_threshold = {
                let state = self.state.lock().await;
                state
                    .thresholds
                    .get(&ResourceType::Memory)
                    .map(|t| t.critical)
            };
            let still_critical = match critical_threshold {
                Some(critical) => self.sampler.sample().await.memory_percent >= critical,
                None => false,
            };
            if still_critical {
                let suspended = lifecycle
                    .suspend_by_classification(Classification::Optional)
                    .await;
                results.push(suspension_result(
                    OptimizationAction::SuspendOptionalServices,
                    &suspended,
                ));
            }
        }
        results
    }

    async fn reclaim_memory(&self) -> OptimizationResult {
        let before = self.sampler.sample().await.memory_used_mb;
        // No collector to force here; dropping cleared caches is the
        // reclaim path. Record the observed delta best-effort.
        let after = self.sampler.sample().await.memory_used_mb;
        let freed = (before - after).max(0.0);
        OptimizationResult {
            action: OptimizationAction::MemoryReclaim,
            success: true,
            message: format!("allocator reclaim observed {:.1}MB", freed),
            resources_freed: HashMap::from([("memory_mb".to_string(), freed)]),
            timestamp: Utc::now(),
        }
    }

    async fn clear_registered_caches(&self) -> OptimizationResult {
        let caches: Vec<Arc<dyn ClearableCache>> = {
            let mut state = self.state.lock().await;
            state.caches.retain(|weak| weak.strong_count() > 0);
            state.caches.iter().filter_map(Weak::upgrade).collect()
        };

        let mut cleared_entries = 0u64;
        for cache in &caches {
            let cleared = cache.clear();
            debug!("Cleared {} entries from cache {}", cleared, cache.name());
            cleared_entries += cleared;
        }

        OptimizationResult {
            action: OptimizationAction::ClearCaches,
            success: true,
            message: format!(
                "cleared {} entries across {} caches",
                cleared_entries,
                caches.len()
            ),
            resources_freed: HashMap::from([(
                "cache_entries".to_string(),
                cleared_entries as f64,
            )]),
            timestamp: Utc::now(),
        }
    }

    async fn optimize_cpu(&self) -> Vec<OptimizationResult> {
        let mut results = Vec::new();
        let lifecycle = self.state.lock().await.lifecycle.clone();

        let suspended = match lifecycle {
            Some(lifecycle) => {
                lifecycle
                    .suspend_excluding_prefixes(&self.config.essential_prefixes)
                    .await
            }
            None => Vec::new(),
        };

        if suspended.is_empty() {
            results.push(self.lower_process_priority());
        } else {
            results.push(suspension_result(
                OptimizationAction::SuspendCpuHeavyServices,
                &suspended,
            ));
        }
        results
    }

    #[cfg(unix)]
    fn lower_process_priority(&self) -> OptimizationResult {
        // Best-effort renice of our own process.
        let outcome = unsafe {
            let current = libc::getpriority(libc::PRIO_PROCESS, 0);
            libc::setpriority(libc::PRIO_PROCESS, 0, (current + 5).min(19))
        };
        OptimizationResult {
            action: OptimizationAction::LowerProcessPriority,
            success: outcome == 0,
            message: if outcome == 0 {
                "process priority lowered".to_string()
            } else {
                "setpriority was not permitted".to_string()
            },
            resources_freed: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[cfg(not(unix))]
    fn lower_process_priority(&self) -> OptimizationResult {
        OptimizationResult {
            action: OptimizationAction::LowerProcessPriority,
            success: false,
            message: "process priority adjustment unsupported on this platform".to_string(),
            resources_freed: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    async fn optimize_gpu(&self) -> Vec<OptimizationResult> {
        let mut freed = 0u64;
        {
            let state = self.state.lock().await;
            for hook in &state.gpu_hooks {
                freed += hook();
            }
        }
        vec![
            OptimizationResult {
                action: OptimizationAction::GpuCacheClear,
                success: true,
                message: format!("gpu cache hooks freed {} entries", freed),
                resources_freed: HashMap::from([("gpu_cache_entries".to_string(), freed as f64)]),
                timestamp: Utc::now(),
            },
            self.reclaim_memory().await,
        ]
    }

    pub async fn current_metrics(&self) -> Option<ResourceMetrics> {
        self.state.lock().await.history.back().cloned()
    }

    pub async fn metrics_history(&self, limit: Option<usize>) -> Vec<ResourceMetrics> {
        let state = self.state.lock().await;
        let limit = limit.unwrap_or(state.history.len());
        state
            .history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub async fn recent_alerts(&self, limit: Option<usize>) -> Vec<ResourceAlert> {
        let state = self.state.lock().await;
        let limit = limit.unwrap_or(state.alerts.len());
        state
            .alerts
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub async fn optimization_history(&self, limit: Option<usize>) -> Vec<OptimizationResult> {
        let state = self.state.lock().await;
        let limit = limit.unwrap_or(state.optimizations.len());
        state
            .optimizations
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// Whether a resource (or any, when `None`) is currently in a
    /// pressure window.
    pub async fn is_under_pressure(&self, resource: Option<ResourceType>) -> bool {
        let state = self.state.lock().await;
        match resource {
            Some(resource) => state.pressure_since.contains_key(&resource),
            None => !state.pressure_since.is_empty(),
        }
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("check_interval", &self.config.check_interval)
            .field("auto_optimize", &self.config.auto_optimize)
            .finish()
    }
}

fn suspension_result(action: OptimizationAction, suspended: &[String]) -> OptimizationResult {
    OptimizationResult {
        action,
        success: true,
        message: if suspended.is_empty() {
            "no services eligible for suspension".to_string()
        } else {
            format!("suspended: {}", suspended.join(", "))
        },
        resources_freed: HashMap::from([(
            "services_suspended".to_string(),
            suspended.len() as f64,
        )]),
        timestamp: Utc::now(),
    }
}
