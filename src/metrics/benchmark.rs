use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::{Metric, MetricsStore};

/// An operation under benchmark. Each invocation is one request.
pub type RequestFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadProfile {
    /// Constant 10 requests per second.
    Light,
    /// Constant 50 requests per second.
    Moderate,
    /// Constant 200 requests per second.
    Heavy,
    /// Low-high-low phases around the heavy rate.
    Burst,
}

impl LoadProfile {
    fn target_rps(&self) -> f64 {
        match self {
            LoadProfile::Light => 10.0,
            LoadProfile::Moderate => 50.0,
            LoadProfile::Heavy => 200.0,
            LoadProfile::Burst => 200.0,
        }
    }
}

/// Service-level objectives a benchmark run is scored against.
#[derive(Debug, Clone, Serialize)]
pub struct SloTargets {
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub min_throughput_rps: f64,
    pub max_error_rate: f64,
}

#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    pub name: String,
    pub profile: LoadProfile,
    pub duration: Duration,
    pub warmup: Duration,
    pub slo: Option<SloTargets>,
}

impl BenchmarkConfig {
    pub fn new(name: impl Into<String>, profile: LoadProfile, duration: Duration) -> Self {
        Self {
            name: name.into(),
            profile,
            duration,
            warmup: Duration::from_secs(0),
            slo: None,
        }
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_slo(mut self, slo: SloTargets) -> Self {
        self.slo = Some(slo);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResult {
    pub id: String,
    pub name: String,
    pub profile: LoadProfile,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub latency_min_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_max_ms: f64,
    pub latency_avg_ms: f64,
    pub throughput_rps: f64,
    pub error_rate: f64,
    pub slo_passed: Option<bool>,
    pub slo_violations: Vec<String>,
}

/// Executes request closures at a target rate and aggregates latency,
/// throughput, and SLO conformance.
pub struct BenchmarkRunner {
    store: MetricsStore,
    history: Mutex<Vec<BenchmarkResult>>,
}

impl BenchmarkRunner {
    pub fn new(store: MetricsStore) -> Self {
        Self {
            store,
            history: Mutex::new(Vec::new()),
        }
    }

    pub async fn run(&self, config: BenchmarkConfig, request: RequestFn) -> Result<BenchmarkResult> {
        info!(
            "Benchmark {} starting: {:?} profile for {:.1}s",
            config.name,
            config.profile,
            config.duration.as_secs_f64()
        );

        if !config.warmup.is_zero() {
            debug!("Warmup phase: {:.1}s", config.warmup.as_secs_f64());
            self.drive_constant(
                &request,
                config.profile.target_rps() / 4.0,
                config.warmup,
            )
            .await;
        }

        let started_at = Utc::now();
        let run_started = Instant::now();
        let samples = match config.profile {
            LoadProfile::Burst => self.drive_burst(&request, &config).await,
            _ => {
                self.drive_constant(&request, config.profile.target_rps(), config.duration)
                    .await
            }
        };
        let elapsed = run_started.elapsed();

        let result = self.aggregate(&config, started_at, elapsed, samples);
        self.store.record(
            Metric::timer(
                format!("benchmark_{}_p95_ms", config.name),
                result.latency_p95_ms,
            )
            .with_unit("ms"),
        );
        self.store.record(
            Metric::gauge(
                format!("benchmark_{}_throughput_rps", config.name),
                result.throughput_rps,
            )
            .with_unit("rps"),
        );

        info!(
            "Benchmark {} finished: {} requests, p95 {:.2}ms, {:.1} rps, {:.2}% errors",
            result.name,
            result.total_requests,
            result.latency_p95_ms,
            result.throughput_rps,
            result.error_rate * 100.0
        );
        self.history.lock().await.push(result.clone());
        Ok(result)
    }

    /// Fire requests at a constant rate for the given window, returning
    /// (latency_ms, success) samples.
    async fn drive_constant(
        &self,
        request: &RequestFn,
        rps: f64,
        window: Duration,
    ) -> Vec<(f64, bool)> {
        if rps <= 0.0 || window.is_zero() {
            return Vec::new();
        }
        let pause = Duration::from_secs_f64(1.0 / rps);
        let deadline = Instant::now() + window;
        let mut handles = Vec::new();
        let mut ticker = tokio::time::interval(pause);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

        while Instant::now() < deadline {
            ticker.tick().await;
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let outcome = request().await;
                (started.elapsed().as_secs_f64() * 1000.0, outcome.is_ok())
            }));
        }

        let mut samples = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(sample) => samples.push(sample),
                Err(_) => samples.push((0.0, false)),
            }
        }
        samples
    }

    /// Burst shape: quarter-rate, full-rate, quarter-rate phases.
    async fn drive_burst(
        &self,
        request: &RequestFn,
        config: &BenchmarkConfig,
    ) -> Vec<(f64, bool)> {
        let rps = config.profile.target_rps();
        let quarter = Duration::from_secs_f64(config.duration.as_secs_f64() / 4.0);
        let half = Duration::from_secs_f64(config.duration.as_secs_f64() / 2.0);

        let mut samples = self.drive_constant(request, rps / 4.0, quarter).await;
        samples.extend(self.drive_constant(request, rps, half).await);
        samples.extend(self.drive_constant(request, rps / 4.0, quarter).await);
        samples
    }

    fn aggregate(
        &self,
        config: &BenchmarkConfig,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        samples: Vec<(f64, bool)>,
    ) -> BenchmarkResult {
        let total = samples.len() as u64;
        let successful = samples.iter().filter(|(_, ok)| *ok).count() as u64;
        let failed = total - successful;

        let mut latencies: Vec<f64> = samples
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(latency, _)| *latency)
            .collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let error_rate = if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        };
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            total as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let mut result = BenchmarkResult {
            id: Uuid::new_v4().to_string(),
            name: config.name.clone(),
            profile: config.profile,
            started_at,
            duration_secs: elapsed.as_secs_f64(),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            latency_min_ms: latencies.first().copied().unwrap_or(0.0),
            latency_p50_ms: percentile(&latencies, 50.0),
            latency_p95_ms: percentile(&latencies, 95.0),
            latency_p99_ms: percentile(&latencies, 99.0),
            latency_max_ms: latencies.last().copied().unwrap_or(0.0),
            latency_avg_ms: if latencies.is_empty() {
                0.0
            } else {
                latencies.iter().sum::<f64>() / latencies.len() as f64
            },
            throughput_rps: throughput,
            error_rate,
            slo_passed: None,
            slo_violations: Vec::new(),
        };

        if let Some(slo) = &config.slo {
            let mut violations = Vec::new();
            if result.latency_p95_ms > slo.p95_latency_ms {
                violations.push(format!(
                    "p95 {:.2}ms exceeds target {:.2}ms",
                    result.latency_p95_ms, slo.p95_latency_ms
                ));
            }
            if result.latency_p99_ms > slo.p99_latency_ms {
                violations.push(format!(
                    "p99 {:.2}ms exceeds target {:.2}ms",
                    result.latency_p99_ms, slo.p99_latency_ms
                ));
            }
            if result.throughput_rps < slo.min_throughput_rps {
                violations.push(format!(
                    "throughput {:.1}rps below target {:.1}rps",
                    result.throughput_rps, slo.min_throughput_rps
                ));
            }
            if result.error_rate > slo.max_error_rate {
                violations.push(format!(
                    "error rate {:.2}% exceeds target {:.2}%",
                    result.error_rate * 100.0,
                    slo.max_error_rate * 100.0
                ));
            }
            result.slo_passed = Some(violations.is_empty());
            result.slo_violations = violations;
        }

        result
    }

    pub async fn history(&self) -> Vec<BenchmarkResult> {
        self.history.lock().await.clone()
    }

    pub async fn export_json(&self) -> Result<String> {
        let history = self.history.lock().await;
        Ok(serde_json::to_string_pretty(&*history)?)
    }
}

impl std::fmt::Debug for BenchmarkRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BenchmarkRunner").finish()
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Wrap a plain async closure into a [`RequestFn`].
pub fn request_fn<F, Fut>(f: F) -> RequestFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}
