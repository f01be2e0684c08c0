//! Vigil - classification-driven service lifecycle management
//!
//! This crate provides the runtime performance core of a multi-service
//! engine: a declarative service catalog with deployment profiles, a
//! dependency-aware startup planner, a classified registry with lazy
//! loading and idle suspension, prioritized CPU/IO task offload, a
//! resource monitor with sustained-pressure auto-optimization, and an
//! in-process performance metrics store with regression detection.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod lazy;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod registry;

pub use audit::{
    AuditReport, AuditThresholds, Bottleneck, BottleneckSeverity, BottleneckType,
    PerformanceAuditor,
};
pub use config::{
    Classification, DeploymentProfile, ResourceRequirements, ServiceCatalog, ServiceConfig,
};
pub use engine::{EngineConfig, EngineReport, VigilEngine};
pub use error::{
    ConfigError, ConsolidationError, LifecycleError, OrchestratorError, Result, VigilError,
};
pub use events::EventBus;
pub use graph::{DependencyGraph, StartupPlan};
pub use lazy::{
    LazyController, PreloadRule, PreloadTrigger, ServiceHandle, SessionToken, TypedHandle,
    UsagePattern,
};
pub use lifecycle::{
    LifecycleConfig, LifecycleManager, LifecycleReport, ShutdownReport, StartupMode,
    StartupReport,
};
pub use lifecycle::consolidation::{
    ConsolidationManager, ConsolidationPlan, ConsolidationType, RiskLevel,
};
pub use logging::LoggingConfig;
pub use metrics::benchmark;
pub use metrics::{
    Baseline, MeasureGuard, Metric, MetricKind, MetricQuery, MetricsStore, RegressionDetection,
    RegressionDetector, RegressionSeverity,
};
pub use monitor::{
    AlertLevel, ClearableCache, MonitorConfig, OptimizationAction, OptimizationResult,
    ResourceAlert, ResourceMetrics, ResourceMonitor, ResourceThreshold, ResourceType,
};
pub use orchestrator::gpu::{
    GpuBackend, GpuComputeOffloader, GpuMemoryManager, GpuMemoryStrategy, GpuOffloadConfig,
    GpuOffloadStats, GpuTask, GpuTaskResult,
};
pub use orchestrator::{
    OrchestratorConfig, Task, TaskKind, TaskOrchestrator, TaskPriority, TaskResult, WorkerStats,
};
pub use registry::{
    LifecycleState, ManagedService, ServiceFactory, ServiceInstance, ServiceRegistry,
    ServiceSnapshot, ShutdownOutcome, factory_fn,
};

// Re-export anyhow for factory implementations.
pub use anyhow;
