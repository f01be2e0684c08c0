use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::registry::{ManagedService, ServiceInstance, ServiceRegistry};

/// Sliding window inside which two accesses count as co-accesses.
const SESSION_WINDOW: Duration = Duration::from_secs(60);

/// Services scoring above this are eligible for critical-path preload.
const PRELOAD_SCORE_THRESHOLD: f64 = 0.5;

const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Events that can trigger rule-based preloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadTrigger {
    Startup,
    UserLogin,
    HighUsage,
    DependencyLoaded,
    Scheduled,
}

/// A configurable mapping from trigger to service set.
#[derive(Debug, Clone)]
pub struct PreloadRule {
    pub trigger: PreloadTrigger,
    pub services: Vec<String>,
    pub priority: i32,
}

/// Per-service access statistics driving preload decisions.
#[derive(Debug, Clone, Serialize)]
pub struct UsagePattern {
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub average_access_interval_secs: f64,
    pub co_accessed_services: HashSet<String>,
    pub critical_path_score: f64,
    #[serde(skip)]
    last_accessed: Option<Instant>,
    #[serde(skip)]
    hour_histogram: [u32; 24],
}

impl UsagePattern {
    fn new() -> Self {
        Self {
            access_count: 0,
            last_accessed_at: None,
            average_access_interval_secs: 0.0,
            co_accessed_services: HashSet::new(),
            critical_path_score: 0.0,
            last_accessed: None,
            hour_histogram: [0; 24],
        }
    }

    fn record_access(&mut self, now: DateTime<Utc>) {
        if let Some(previous) = self.last_accessed {
            let interval = previous.elapsed().as_secs_f64();
            let n = self.access_count as f64;
            self.average_access_interval_secs =
                (self.average_access_interval_secs * (n - 1.0) + interval) / n.max(1.0);
        }
        self.access_count += 1;
        self.last_accessed = Some(Instant::now());
        self.last_accessed_at = Some(now);
        self.hour_histogram[now.hour() as usize] += 1;
    }

    /// The three busiest hours observed for this service.
    fn peak_usage_hours(&self) -> Vec<u32> {
        let mut hours: Vec<(u32, u32)> = self
            .hour_histogram
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(hour, count)| (hour as u32, *count))
            .collect();
        hours.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hours.into_iter().take(3).map(|(hour, _)| hour).collect()
    }
}

/// A session token identifying one logical unit of work. Accesses made
/// under the same token within the session window are recorded as
/// co-accesses of each other.
pub struct SessionToken {
    id: Uuid,
    accesses: Mutex<Vec<(String, Instant)>>,
}

impl SessionToken {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            accesses: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded hot-set of service names with least-recently-used eviction.
#[derive(Debug)]
struct LruSet {
    capacity: usize,
    stamps: HashMap<String, u64>,
    clock: u64,
}

impl LruSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            stamps: HashMap::new(),
            clock: 0,
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.stamps.contains_key(name)
    }

    fn touch(&mut self, name: &str) {
        self.clock += 1;
        self.stamps.insert(name.to_string(), self.clock);
    }

    /// Insert a name, returning the evicted victim when at capacity.
    fn insert(&mut self, name: &str) -> Option<String> {
        let victim = if !self.stamps.contains_key(name) && self.stamps.len() >= self.capacity {
            self.stamps
                .iter()
                .min_by_key(|(_, stamp)| **stamp)
                .map(|(victim, _)| victim.clone())
        } else {
            None
        };
        if let Some(victim) = &victim {
            self.stamps.remove(victim);
        }
        self.touch(name);
        victim
    }

    fn remove(&mut self, name: &str) -> bool {
        self.stamps.remove(name).is_some()
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stamps.keys().cloned().collect();
        names.sort();
        names
    }

    fn len(&self) -> usize {
        self.stamps.len()
    }
}

#[derive(Debug)]
struct LazyState {
    cache: LruSet,
    patterns: HashMap<String, UsagePattern>,
    preload_rules: Vec<PreloadRule>,
}

/// Usage summary exposed to reporting.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub tracked_services: usize,
    pub cached_services: Vec<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub patterns: HashMap<String, UsagePattern>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreloadRecommendation {
    pub service: String,
    pub score: f64,
    pub reason: String,
}

/// On-demand access layer over the registry: stable handles, an LRU
/// hot-set, usage tracking, and rule- or score-driven preloading.
///
/// The controller holds cached names and usage state but never owns
/// service instances; the registry remains the single owner.
pub struct LazyController {
    registry: Arc<ServiceRegistry>,
    state: Mutex<LazyState>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl LazyController {
    pub fn new(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Self::with_capacity(registry, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(registry: Arc<ServiceRegistry>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            registry,
            state: Mutex::new(LazyState {
                cache: LruSet::new(capacity),
                patterns: HashMap::new(),
                preload_rules: Vec::new(),
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Obtain a stable handle bound to a service name.
    pub fn handle(self: &Arc<Self>, name: impl Into<String>) -> ServiceHandle {
        ServiceHandle {
            controller: self.clone(),
            name: name.into(),
        }
    }

    /// Obtain a typed handle; dereferencing downcasts to `T`.
    pub fn typed_handle<T: ManagedService>(self: &Arc<Self>, name: impl Into<String>) -> TypedHandle<T> {
        TypedHandle {
            inner: self.handle(name),
            _marker: PhantomData,
        }
    }

    /// Dereference path: cache check, registry load, usage accounting.
    pub async fn get(&self, name: &str) -> Result<ServiceInstance> {
        self.get_with(name, None).await
    }

    /// Like [`get`], attributing the access to a session token for
    /// co-access tracking.
    pub async fn get_with(
        &self,
        name: &str,
        session: Option<&SessionToken>,
    ) -> Result<ServiceInstance> {
        let hit = {
            let mut state = self.state.lock().await;
            if state.cache.contains(name) {
                state.cache.touch(name);
                true
            } else {
                false
            }
        };

        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        // The registry performs the actual load (or returns the live
        // instance); after a suspension this is a full reload.
        let instance = self.registry.get(name).await?;

        if !hit {
            let victim = {
                let mut state = self.state.lock().await;
                state.cache.insert(name)
            };
            if let Some(victim) = victim {
                debug!("LRU evicting {} for {}", victim, name);
                if let Err(e) = self.registry.shutdown(&victim, None).await {
                    warn!("Eviction shutdown of {} failed: {}", victim, e);
                }
            }
        }

        self.record_access(name, session).await;
        Ok(instance)
    }

    async fn record_access(&self, name: &str, session: Option<&SessionToken>) {
        let now = Utc::now();
        let co_accessed: Vec<String> = match session {
            Some(token) => {
                let mut accesses = token.accesses.lock().await;
                accesses.retain(|(_, at)| at.elapsed() <= SESSION_WINDOW);
                let peers: Vec<String> = accesses
                    .iter()
                    .map(|(peer, _)| peer.clone())
                    .filter(|peer| peer != name)
                    .collect();
                accesses.push((name.to_string(), Instant::now()));
                peers
            }
            None => Vec::new(),
        };

        let mut state = self.state.lock().await;
        state
            .patterns
            .entry(name.to_string())
            .or_insert_with(UsagePattern::new)
            .record_access(now);

        for peer in co_accessed {
            state
                .patterns
                .entry(name.to_string())
                .or_insert_with(UsagePattern::new)
                .co_accessed_services
                .insert(peer.clone());
            state
                .patterns
                .entry(peer)
                .or_insert_with(UsagePattern::new)
                .co_accessed_services
                .insert(name.to_string());
        }
    }

    /// Drop a name from the hot-set and shut it down through the
    /// registry. Returns whether the name was cached.
    pub async fn unload(&self, name: &str) -> Result<bool> {
        let was_cached = {
            let mut state = self.state.lock().await;
            state.cache.remove(name)
        };
        if was_cached {
            self.registry.shutdown(name, None).await?;
        }
        Ok(was_cached)
    }

    /// Clear the hot-set entirely, shutting down each cached service.
    /// Returns how many services were unloaded.
    pub async fn clear_cache(&self) -> usize {
        let names = {
            let mut state = self.state.lock().await;
            let names = state.cache.names();
            for name in &names {
                state.cache.remove(name);
            }
            names
        };
        for name in &names {
            if let Err(e) = self.registry.shutdown(name, None).await {
                warn!("Cache clear shutdown of {} failed: {}", name, e);
            }
        }
        names.len()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub async fn cached_names(&self) -> Vec<String> {
        self.state.lock().await.cache.names()
    }

    pub async fn configure_preload_rules(&self, rules: Vec<PreloadRule>) {
        let mut state = self.state.lock().await;
        state.preload_rules = rules;
        state
            .preload_rules
            .sort_by_key(|rule| std::cmp::Reverse(rule.priority));
    }

    /// Fire the preload rules for a trigger. Best-effort: failures are
    /// logged and skipped. Returns the services that loaded.
    pub async fn trigger_preload(&self, trigger: PreloadTrigger) -> Vec<String> {
        let targets: Vec<String> = {
            let state = self.state.lock().await;
            state
                .preload_rules
                .iter()
                .filter(|rule| rule.trigger == trigger)
                .flat_map(|rule| rule.services.iter().cloned())
                .collect()
        };

        let mut loaded = Vec::new();
        for name in targets {
            match self.get(&name).await {
                Ok(_) => loaded.push(name),
                Err(e) => warn!("Preload of {} on {:?} failed: {}", name, trigger, e),
            }
        }
        if !loaded.is_empty() {
            info!("Preloaded {} services for {:?}", loaded.len(), trigger);
        }
        loaded
    }

    /// Recompute critical-path scores for every tracked service.
    ///
    /// score = 0.4 frequency + 0.3 co-access + 0.2 recency
    ///       + 0.1 peak-hour alignment
    pub async fn recompute_scores(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let tracked = state.patterns.len().max(1);
        let max_access = state
            .patterns
            .values()
            .map(|p| p.access_count)
            .max()
            .unwrap_or(0)
            .max(1);

        for pattern in state.patterns.values_mut() {
            let frequency = pattern.access_count as f64 / max_access as f64;
            let co_access = pattern.co_accessed_services.len() as f64 / tracked as f64;
            let recency = pattern
                .last_accessed
                .map(|at| {
                    let hours = at.elapsed().as_secs_f64() / 3600.0;
                    (1.0 - hours / 24.0).max(0.0)
                })
                .unwrap_or(0.0);
            let peak_alignment = if pattern.peak_usage_hours().contains(&now.hour()) {
                1.0
            } else {
                0.0
            };
            pattern.critical_path_score =
                0.4 * frequency + 0.3 * co_access + 0.2 * recency + 0.1 * peak_alignment;
        }
    }

    /// Preload the top critical-path scorers. Returns the services that
    /// loaded.
    pub async fn preload_critical_path(&self) -> Vec<String> {
        self.recompute_scores().await;
        let candidates: Vec<String> = {
            let state = self.state.lock().await;
            let mut scored: Vec<(String, f64)> = state
                .patterns
                .iter()
                .filter(|(_, p)| p.critical_path_score > PRELOAD_SCORE_THRESHOLD)
                .map(|(name, p)| (name.clone(), p.critical_path_score))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.into_iter().map(|(name, _)| name).collect()
        };

        let mut loaded = Vec::new();
        for name in candidates {
            match self.get(&name).await {
                Ok(_) => loaded.push(name),
                Err(e) => warn!("Critical-path preload of {} failed: {}", name, e),
            }
        }
        loaded
    }

    pub async fn usage_report(&self) -> UsageReport {
        let state = self.state.lock().await;
        let hits = self.cache_hits();
        let misses = self.cache_misses();
        let total = hits + misses;
        UsageReport {
            tracked_services: state.patterns.len(),
            cached_services: state.cache.names(),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            patterns: state.patterns.clone(),
        }
    }

    pub async fn preload_recommendations(&self) -> Vec<PreloadRecommendation> {
        self.recompute_scores().await;
        let state = self.state.lock().await;
        let mut recommendations: Vec<PreloadRecommendation> = state
            .patterns
            .iter()
            .filter(|(name, pattern)| {
                pattern.critical_path_score > PRELOAD_SCORE_THRESHOLD
                    && !state.cache.contains(name)
            })
            .map(|(name, pattern)| PreloadRecommendation {
                service: name.clone(),
                score: pattern.critical_path_score,
                reason: format!(
                    "{} accesses, {} co-accessed services",
                    pattern.access_count,
                    pattern.co_accessed_services.len()
                ),
            })
            .collect();
        recommendations
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        recommendations
    }

    /// Start the periodic preload evaluation loop.
    pub async fn start_background_tasks(self: &Arc<Self>, interval: Duration) {
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let loaded = controller.preload_critical_path().await;
                if !loaded.is_empty() {
                    debug!("Background preload loaded: {}", loaded.join(", "));
                }
            }
        });
        self.background.lock().await.push(handle);
    }

    pub async fn stop_background_tasks(&self) {
        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for LazyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyController")
            .field("cache_hits", &self.cache_hits)
            .field("cache_misses", &self.cache_misses)
            .finish()
    }
}

/// A stable reference to a service by name. Dereferencing loads the
/// service on first use and again after any suspension.
#[derive(Clone)]
pub struct ServiceHandle {
    controller: Arc<LazyController>,
    name: String,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> Result<ServiceInstance> {
        self.controller.get(&self.name).await
    }

    pub async fn get_with(&self, session: &SessionToken) -> Result<ServiceInstance> {
        self.controller.get_with(&self.name, Some(session)).await
    }
}

/// A handle that downcasts to a concrete service type on dereference.
pub struct TypedHandle<T: ManagedService> {
    inner: ServiceHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ManagedService> Clone for TypedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: ManagedService> TypedHandle<T> {
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn get(&self) -> Result<Arc<T>> {
        self.get_inner(None).await
    }

    pub async fn get_with(&self, session: &SessionToken) -> Result<Arc<T>> {
        self.get_inner(Some(session)).await
    }

    async fn get_inner(&self, session: Option<&SessionToken>) -> Result<Arc<T>> {
        let instance = self
            .inner
            .controller
            .get_with(&self.inner.name, session)
            .await?;
        instance.as_any().downcast::<T>().map_err(|_| {
            anyhow::anyhow!(
                "service {} is not of the requested type",
                self.inner.name
            )
            .into()
        })
    }
}
