use thiserror::Error;

/// Vigil-specific error types for better error handling
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Consolidation error: {0}")]
    Consolidation(#[from] ConsolidationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors raised while loading or validating the service catalog.
///
/// These are always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown service: {name}")]
    UnknownService { name: String },

    #[error("Duplicate service name: {name}")]
    DuplicateService { name: String },

    #[error("Invalid {field} value for service {service}: {value}")]
    InvalidEnum {
        service: String,
        field: String,
        value: String,
    },

    #[error("Service {service} depends on unknown service {dependency}")]
    UnresolvedDependency { service: String, dependency: String },

    #[error("Circular dependency detected: {}", .cycles.join("; "))]
    CircularDependency { cycles: Vec<String> },

    #[error("Unknown deployment profile: {name}")]
    UnknownProfile { name: String },

    #[error("Catalog source not found at path: {path}")]
    SourceNotFound { path: String },

    #[error("Invalid catalog format in {path}: {reason}")]
    InvalidFormat { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Service not registered: {name}")]
    NotRegistered { name: String },

    #[error("Service {name} is disabled by the active deployment profile")]
    ServiceDisabled { name: String },

    #[error("Service {name} failed to load: {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("Service {name} exhausted its {attempts} restart attempts")]
    RestartsExhausted { name: String, attempts: u32 },

    #[error("Graceful shutdown of {name} exceeded {timeout_secs}s budget")]
    ShutdownTimeout { name: String, timeout_secs: f64 },

    #[error("Invalid transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("Essential service {name} cannot be suspended")]
    EssentialSuspension { name: String },

    #[error("Essential service {name} failed during startup: {reason}")]
    EssentialStartupFailure { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Orchestrator is closed; task {task_id} rejected")]
    Closed { task_id: String },

    #[error("Task {task_id} timed out after {timeout_secs}s")]
    Timeout { task_id: String, timeout_secs: f64 },

    #[error("Task {task_id} failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    #[error("Worker pool unavailable: {pool}")]
    PoolUnavailable { pool: String },
}

#[derive(Error, Debug)]
pub enum ConsolidationError {
    #[error("Consolidation plan not found: {plan_id}")]
    PlanNotFound { plan_id: String },

    #[error("Consolidation plan {plan_id} blocked by validation: {}", .reasons.join(", "))]
    ValidationBlocked {
        plan_id: String,
        reasons: Vec<String>,
    },

    #[error("Consolidation of {plan_id} failed at step {step}: {reason}")]
    ExecutionFailed {
        plan_id: String,
        step: String,
        reason: String,
    },
}

/// Convenience type alias for Vigil results
pub type Result<T, E = VigilError> = std::result::Result<T, E>;
