use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{Classification, ServiceConfig};
use crate::error::{ConfigError, LifecycleError, Result};
use crate::events::EventBus;

/// A live service instance managed by the registry.
///
/// Both hooks default to no-ops; absence of real shutdown or cleanup
/// behavior is not an error.
#[async_trait]
pub trait ManagedService: Send + Sync + 'static {
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Names of the public operations this service exposes. Used by
    /// consolidation to compute the API contracts that must survive a
    /// merge.
    fn api_contract(&self) -> Vec<String> {
        Vec::new()
    }

    /// Upcast for typed handles.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl std::fmt::Debug for dyn ManagedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn ManagedService")
            .field("api_contract", &self.api_contract())
            .finish()
    }
}

pub type ServiceInstance = Arc<dyn ManagedService>;

/// Factory producing a service instance. May perform async work.
pub type ServiceFactory =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<ServiceInstance>> + Send + Sync>;

/// Per-service lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotLoaded,
    Loading,
    Active,
    Idle,
    Suspended,
    Shutdown,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::NotLoaded => "not_loaded",
            LifecycleState::Loading => "loading",
            LifecycleState::Active => "active",
            LifecycleState::Idle => "idle",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Shutdown => "shutdown",
            LifecycleState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a graceful shutdown attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    Graceful,
    /// The shutdown hook exceeded its budget and the instance was
    /// force-dropped.
    Forced,
    /// No live instance existed; only the state changed.
    NoInstance,
}

struct EntryState {
    state: LifecycleState,
    instance: Option<ServiceInstance>,
    last_accessed: Option<Instant>,
    last_accessed_at: Option<DateTime<Utc>>,
    idle_since: Option<Instant>,
    suspension_count: u64,
    restart_attempts: u32,
    last_error: Option<String>,
    startup_duration: Option<Duration>,
}

impl std::fmt::Debug for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryState")
            .field("state", &self.state)
            .field("instance", &self.instance.is_some())
            .field("last_accessed", &self.last_accessed)
            .field("last_accessed_at", &self.last_accessed_at)
            .field("idle_since", &self.idle_since)
            .field("suspension_count", &self.suspension_count)
            .field("restart_attempts", &self.restart_attempts)
            .field("last_error", &self.last_error)
            .field("startup_duration", &self.startup_duration)
            .finish()
    }
}

impl EntryState {
    fn new() -> Self {
        Self {
            state: LifecycleState::NotLoaded,
            instance: None,
            last_accessed: None,
            last_accessed_at: None,
            idle_since: None,
            suspension_count: 0,
            restart_attempts: 0,
            last_error: None,
            startup_duration: None,
        }
    }
}

struct ServiceEntry {
    config: ServiceConfig,
    factory: ServiceFactory,
    // One logical mutex per entry: all transitions for a service are
    // totally ordered, while distinct services proceed concurrently.
    state: Mutex<EntryState>,
}

/// Point-in-time view of one registry entry, used by monitoring and the
/// snapshot report.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub classification: Classification,
    pub state: LifecycleState,
    pub enabled: bool,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub idle_secs: Option<u64>,
    pub suspension_count: u64,
    pub restart_attempts: u32,
    pub last_error: Option<String>,
    pub startup_duration_secs: Option<f64>,
}

/// The classified service registry: single authority for service
/// instances and lifecycle transitions.
pub struct ServiceRegistry {
    entries: RwLock<HashMap<String, Arc<ServiceEntry>>>,
    /// Consolidation redirects: lookups for a secondary name resolve to
    /// the primary that absorbed it.
    aliases: RwLock<HashMap<String, String>>,
    events: Arc<EventBus>,
    graceful_shutdowns: AtomicU64,
    forced_shutdowns: AtomicU64,
}

impl ServiceRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            events,
            graceful_shutdowns: AtomicU64::new(0),
            forced_shutdowns: AtomicU64::new(0),
        }
    }

    /// Register a service factory under its catalog config. Registering
    /// the same name twice is a programming error.
    pub async fn register(&self, config: ServiceConfig, factory: ServiceFactory) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&config.name) {
            return Err(ConfigError::DuplicateService {
                name: config.name.clone(),
            }
            .into());
        }
        debug!(
            "Registered service {} ({})",
            config.name,
            config.classification.as_str()
        );
        entries.insert(
            config.name.clone(),
            Arc::new(ServiceEntry {
                config,
                factory,
                state: Mutex::new(EntryState::new()),
            }),
        );
        Ok(())
    }

    async fn entry(&self, name: &str) -> Result<Arc<ServiceEntry>> {
        let resolved = self.resolve_alias(name).await;
        self.entries
            .read()
            .await
            .get(resolved.as_str())
            .cloned()
            .ok_or_else(|| {
                LifecycleError::NotRegistered {
                    name: name.to_string(),
                }
                .into()
            })
    }

    async fn resolve_alias(&self, name: &str) -> String {
        let aliases = self.aliases.read().await;
        aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    /// Redirect lookups for `from` to `to`. Installed by consolidation
    /// so a merged service answers under all pre-merge names.
    pub async fn add_alias(&self, from: &str, to: &str) {
        self.aliases
            .write()
            .await
            .insert(from.to_string(), to.to_string());
        debug!("Registry alias installed: {} -> {}", from, to);
    }

    pub async fn remove_alias(&self, from: &str) {
        self.aliases.write().await.remove(from);
    }

    pub async fn aliases(&self) -> HashMap<String, String> {
        self.aliases.read().await.clone()
    }

    /// API contract of the live instance, when one exists.
    pub async fn api_contract(&self, name: &str) -> Result<Vec<String>> {
        let entry = self.entry(name).await?;
        let state = entry.state.lock().await;
        Ok(state
            .instance
            .as_ref()
            .map(|instance| instance.api_contract())
            .unwrap_or_default())
    }

    pub async fn config(&self, name: &str) -> Result<ServiceConfig> {
        Ok(self.entry(name).await?.config.clone())
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Retrieve the service instance, loading it on demand.
    ///
    /// Concurrent callers for the same cold service single-flight on the
    /// entry lock: exactly one factory invocation happens and everyone
    /// observes its result. Dependencies are activated first.
    pub fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<ServiceInstance>> {
        self.get_inner(name, false)
    }

    /// Load regardless of the active profile's enabled flag. Used by
    /// FULL-mode startup, which includes disabled services.
    pub fn get_ignoring_profile<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<ServiceInstance>> {
        self.get_inner(name, true)
    }

    fn get_inner<'a>(
        &'a self,
        name: &'a str,
        bypass_profile: bool,
    ) -> BoxFuture<'a, Result<ServiceInstance>> {
        Box::pin(async move {
            let entry = self.entry(name).await?;

            if !entry.config.enabled && !bypass_profile {
                return Err(LifecycleError::ServiceDisabled {
                    name: name.to_string(),
                }
                .into());
            }

            // Activate dependencies before taking this entry's lock so a
            // dependency's load serializes on its own entry only.
            for dep in &entry.config.dependencies {
                self.get_inner(dep, bypass_profile).await.map_err(|e| {
                    LifecycleError::LoadFailed {
                        name: name.to_string(),
                        reason: format!("dependency {} unavailable: {}", dep, e),
                    }
                })?;
            }

            let mut state = entry.state.lock().await;
            match state.state {
                LifecycleState::Active | LifecycleState::Idle => {
                    if state.state == LifecycleState::Idle {
                        self.transition(name, &mut state, LifecycleState::Active);
                    }
                    self.touch(&mut state);
                    Ok(state.instance.clone().expect("active service has instance"))
                }
                LifecycleState::Failed => {
                    if state.restart_attempts >= entry.config.max_restart_attempts {
                        return Err(LifecycleError::RestartsExhausted {
                            name: name.to_string(),
                            attempts: entry.config.max_restart_attempts,
                        }
                        .into());
                    }
                    let backoff = restart_backoff(state.restart_attempts);
                    debug!(
                        "Retrying failed service {} after {:?} (attempt {})",
                        name,
                        backoff,
                        state.restart_attempts + 1
                    );
                    tokio::time::sleep(backoff).await;
                    self.load_locked(&entry, name, &mut state).await
                }
                LifecycleState::NotLoaded
                | LifecycleState::Suspended
                | LifecycleState::Shutdown => self.load_locked(&entry, name, &mut state).await,
                LifecycleState::Loading => {
                    // Unreachable: loading happens under the entry lock.
                    Err(LifecycleError::InvalidTransition {
                        name: name.to_string(),
                        from: "loading".to_string(),
                        to: "active".to_string(),
                    }
                    .into())
                }
            }
        })
    }

    async fn load_locked(
        &self,
        entry: &ServiceEntry,
        name: &str,
        state: &mut EntryState,
    ) -> Result<ServiceInstance> {
        self.transition(name, state, LifecycleState::Loading);
        let started = Instant::now();

        match (entry.factory)().await {
            Ok(instance) => {
                state.instance = Some(instance.clone());
                state.restart_attempts = 0;
                state.last_error = None;
                state.startup_duration = Some(started.elapsed());
                self.transition(name, state, LifecycleState::Active);
                self.touch(state);
                info!(
                    "Service {} active in {:.3}s",
                    name,
                    started.elapsed().as_secs_f64()
                );
                Ok(instance)
            }
            Err(e) => {
                state.restart_attempts += 1;
                state.last_error = Some(e.to_string());
                self.transition(name, state, LifecycleState::Failed);
                warn!("Service {} failed to load: {}", name, e);
                Err(LifecycleError::LoadFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Suspend an active service: run its shutdown hook under the
    /// graceful budget, then drop the instance. Forbidden for essential
    /// services.
    pub async fn suspend(&self, name: &str) -> Result<()> {
        let entry = self.entry(name).await?;
        if entry.config.classification == Classification::Essential {
            return Err(LifecycleError::EssentialSuspension {
                name: name.to_string(),
            }
            .into());
        }

        let mut state = entry.state.lock().await;
        match state.state {
            LifecycleState::Active | LifecycleState::Idle => {
                if state.state == LifecycleState::Active {
                    state.idle_since = Some(Instant::now());
                    self.transition(name, &mut state, LifecycleState::Idle);
                }
                let budget = Duration::from_secs(entry.config.graceful_shutdown_timeout_secs);
                if let Some(instance) = state.instance.take() {
                    self.stop_instance(name, instance, budget).await;
                }
                state.suspension_count += 1;
                state.idle_since = None;
                self.transition(name, &mut state, LifecycleState::Suspended);
                info!(
                    "Service {} suspended (count {})",
                    name, state.suspension_count
                );
                Ok(())
            }
            other => Err(LifecycleError::InvalidTransition {
                name: name.to_string(),
                from: other.as_str().to_string(),
                to: "suspended".to_string(),
            }
            .into()),
        }
    }

    /// Gracefully shut a service down, escalating to a forced drop when
    /// the hook exceeds the timeout. The outcome reports which path was
    /// taken; a forced shutdown is recorded, not raised.
    pub async fn shutdown(&self, name: &str, timeout: Option<Duration>) -> Result<ShutdownOutcome> {
        let entry = self.entry(name).await?;
        let mut state = entry.state.lock().await;

        match state.state {
            LifecycleState::Active | LifecycleState::Idle | LifecycleState::Suspended => {
                let budget = timeout.unwrap_or(Duration::from_secs(
                    entry.config.graceful_shutdown_timeout_secs,
                ));
                let outcome = match state.instance.take() {
                    Some(instance) => {
                        let forced = self.stop_instance(name, instance, budget).await;
                        if forced {
                            ShutdownOutcome::Forced
                        } else {
                            ShutdownOutcome::Graceful
                        }
                    }
                    None => ShutdownOutcome::NoInstance,
                };
                if outcome == ShutdownOutcome::Graceful {
                    self.graceful_shutdowns.fetch_add(1, Ordering::Relaxed);
                }
                state.idle_since = None;
                self.transition(name, &mut state, LifecycleState::Shutdown);
                Ok(outcome)
            }
            LifecycleState::Shutdown => Ok(ShutdownOutcome::NoInstance),
            other => Err(LifecycleError::InvalidTransition {
                name: name.to_string(),
                from: other.as_str().to_string(),
                to: "shutdown".to_string(),
            }
            .into()),
        }
    }

    /// Run the instance hooks under a timeout. Returns true when the
    /// budget was exceeded and the instance was force-dropped.
    async fn stop_instance(
        &self,
        name: &str,
        instance: ServiceInstance,
        budget: Duration,
    ) -> bool {
        let hook = async {
            if let Err(e) = instance.shutdown().await {
                warn!("Service {} shutdown hook failed: {}", name, e);
            }
            if let Err(e) = instance.cleanup().await {
                warn!("Service {} cleanup hook failed: {}", name, e);
            }
        };

        match tokio::time::timeout(budget, hook).await {
            Ok(()) => false,
            Err(_) => {
                self.forced_shutdowns.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Service {} exceeded its {:.1}s shutdown budget, forcing drop",
                    name,
                    budget.as_secs_f64()
                );
                true
            }
        }
    }

    /// Mark an active service idle. Used by the idle detector before
    /// suspension.
    pub async fn mark_idle(&self, name: &str) -> Result<()> {
        let entry = self.entry(name).await?;
        let mut state = entry.state.lock().await;
        if state.state == LifecycleState::Active {
            state.idle_since = Some(Instant::now());
            self.transition(name, &mut state, LifecycleState::Idle);
        }
        Ok(())
    }

    /// Elapsed time since last access, when the service has been
    /// accessed at all.
    pub async fn time_since_access(&self, name: &str) -> Result<Option<Duration>> {
        let entry = self.entry(name).await?;
        let state = entry.state.lock().await;
        Ok(state.last_accessed.map(|at| at.elapsed()))
    }

    pub async fn state_of(&self, name: &str) -> Result<LifecycleState> {
        let entry = self.entry(name).await?;
        let state = entry.state.lock().await;
        Ok(state.state)
    }

    pub async fn suspension_count(&self, name: &str) -> Result<u64> {
        let entry = self.entry(name).await?;
        let state = entry.state.lock().await;
        Ok(state.suspension_count)
    }

    pub fn graceful_shutdowns(&self) -> u64 {
        self.graceful_shutdowns.load(Ordering::Relaxed)
    }

    pub fn forced_shutdowns(&self) -> u64 {
        self.forced_shutdowns.load(Ordering::Relaxed)
    }

    /// Snapshot every entry for monitoring and reporting.
    pub async fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let entries: Vec<(String, Arc<ServiceEntry>)> = {
            let map = self.entries.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut snapshots = Vec::with_capacity(entries.len());
        for (name, entry) in entries {
            let state = entry.state.lock().await;
            snapshots.push(ServiceSnapshot {
                name,
                classification: entry.config.classification,
                state: state.state,
                enabled: entry.config.enabled,
                last_accessed_at: state.last_accessed_at,
                idle_secs: state.idle_since.map(|at| at.elapsed().as_secs()),
                suspension_count: state.suspension_count,
                restart_attempts: state.restart_attempts,
                last_error: state.last_error.clone(),
                startup_duration_secs: state.startup_duration.map(|d| d.as_secs_f64()),
            });
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    fn transition(&self, name: &str, state: &mut EntryState, to: LifecycleState) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        self.events.emit_transition(name, from.as_str(), to.as_str());
    }

    fn touch(&self, state: &mut EntryState) {
        state.last_accessed = Some(Instant::now());
        state.last_accessed_at = Some(Utc::now());
        state.idle_since = None;
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("graceful_shutdowns", &self.graceful_shutdowns)
            .field("forced_shutdowns", &self.forced_shutdowns)
            .finish()
    }
}

fn restart_backoff(attempts: u32) -> Duration {
    let millis = 100u64.saturating_mul(1u64 << attempts.min(6));
    Duration::from_millis(millis.min(5_000))
}

/// Wrap a plain constructor closure into a [`ServiceFactory`].
pub fn factory_fn<F, Fut>(f: F) -> ServiceFactory
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<ServiceInstance>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Classification, ServiceConfig};
    use std::sync::atomic::AtomicUsize;

    struct Plain;

    #[async_trait]
    impl ManagedService for Plain {
        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(EventBus::new())
    }

    #[tokio::test]
    async fn get_transitions_through_loading_to_active() {
        let registry = registry();
        registry
            .register(
                ServiceConfig::new("svc", Classification::Optional),
                factory_fn(|| async { Ok(Arc::new(Plain) as ServiceInstance) }),
            )
            .await
            .unwrap();

        registry.get("svc").await.unwrap();
        assert_eq!(
            registry.state_of("svc").await.unwrap(),
            LifecycleState::Active
        );
    }

    #[tokio::test]
    async fn single_flight_invokes_factory_once() {
        let registry = Arc::new(registry());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        registry
            .register(
                ServiceConfig::new("svc", Classification::Optional),
                factory_fn(move || {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Arc::new(Plain) as ServiceInstance)
                    }
                }),
            )
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get("svc").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suspension_forbidden_for_essential() {
        let registry = registry();
        registry
            .register(
                ServiceConfig::new("core", Classification::Essential),
                factory_fn(|| async { Ok(Arc::new(Plain) as ServiceInstance) }),
            )
            .await
            .unwrap();
        registry.get("core").await.unwrap();
        assert!(registry.suspend("core").await.is_err());
    }

    #[tokio::test]
    async fn failed_factory_retries_up_to_limit() {
        let registry = registry();
        let mut config = ServiceConfig::new("flaky", Classification::Optional);
        config.max_restart_attempts = 2;
        registry
            .register(
                config,
                factory_fn(|| async { Err(anyhow::anyhow!("boom")) }),
            )
            .await
            .unwrap();

        assert!(registry.get("flaky").await.is_err());
        assert!(registry.get("flaky").await.is_err());
        // Attempts exhausted: the factory is no longer invoked.
        let err = registry.get("flaky").await.unwrap_err();
        assert!(err.to_string().contains("restart attempts"));
    }
}
