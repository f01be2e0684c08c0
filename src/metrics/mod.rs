use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::EventBus;

pub mod benchmark;

/// Default cap on rows returned by a time-window query.
const DEFAULT_QUERY_LIMIT: usize = 1_000;

/// Samples considered for the "recent mean" in regression checks.
const RECENT_SAMPLE_WINDOW: usize = 10;

/// Minimum recent samples before a regression check runs.
const MIN_SAMPLES_FOR_DETECTION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Timer,
}

/// One persisted metric row. Readers tolerate unknown tags and missing
/// optional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub kind: MetricKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Metric {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricKind::Gauge)
    }

    pub fn counter(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricKind::Counter)
    }

    pub fn timer(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricKind::Timer)
    }

    fn new(name: impl Into<String>, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            timestamp: Utc::now(),
            service_name: None,
            tags: HashMap::new(),
            unit: None,
            description: None,
        }
    }

    pub fn for_service(mut self, service: impl Into<String>) -> Self {
        self.service_name = Some(service.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    fn series_key(&self) -> (String, String) {
        (
            self.name.clone(),
            self.service_name.clone().unwrap_or_default(),
        )
    }
}

/// Named per-(metric, service) reference mean used for regression
/// comparison.
#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    pub metric_name: String,
    pub service_name: String,
    pub mean: f64,
    pub sample_count: usize,
    pub window_secs: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionSeverity {
    Medium,
    High,
    Critical,
}

/// A detected performance regression, surfaced as an advisory event.
#[derive(Debug, Clone, Serialize)]
pub struct RegressionDetection {
    pub metric_name: String,
    pub service_name: String,
    pub baseline_value: f64,
    pub current_value: f64,
    pub change_percent: f64,
    pub threshold_percent: f64,
    pub severity: RegressionSeverity,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricQuery {
    pub name: Option<String>,
    pub service_name: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

enum StoreCommand {
    Record(Metric),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct StoreRows {
    rows: Vec<Arc<Metric>>,
    by_name: HashMap<String, Vec<usize>>,
    by_service: HashMap<String, Vec<usize>>,
    baselines: HashMap<(String, String), Baseline>,
}

impl StoreRows {
    fn append(&mut self, metric: Metric) {
        let index = self.rows.len();
        self.by_name
            .entry(metric.name.clone())
            .or_default()
            .push(index);
        if let Some(service) = &metric.service_name {
            self.by_service
                .entry(service.clone())
                .or_default()
                .push(index);
        }
        self.rows.push(Arc::new(metric));
    }
}

/// Append-only in-process metrics store with a single-writer ingestion
/// queue and snapshot-isolated reads.
#[derive(Clone)]
pub struct MetricsStore {
    rows: Arc<RwLock<StoreRows>>,
    sender: mpsc::UnboundedSender<StoreCommand>,
    writer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        let rows: Arc<RwLock<StoreRows>> = Arc::new(RwLock::new(StoreRows::default()));
        let (sender, mut receiver) = mpsc::unbounded_channel::<StoreCommand>();

        let writer_rows = rows.clone();
        let writer = tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    StoreCommand::Record(metric) => {
                        writer_rows.write().await.append(metric);
                    }
                    StoreCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Metrics writer drained");
        });

        Self {
            rows,
            sender,
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Queue a metric for ingestion. Never blocks the caller.
    pub fn record(&self, metric: Metric) {
        if self.sender.send(StoreCommand::Record(metric)).is_err() {
            warn!("Metrics store is closed, dropping metric");
        }
    }

    /// Wait until every previously queued metric is visible to readers.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(StoreCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn close(&self) {
        if let Some(writer) = self.writer.lock().await.take() {
            self.flush().await;
            writer.abort();
        }
    }

    /// Time-window query by name and/or service, newest rows last,
    /// capped at `limit` (default 1000).
    pub async fn query(&self, query: &MetricQuery) -> Vec<Metric> {
        let rows = self.rows.read().await;
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);

        let candidate_indices: Vec<usize> = match (&query.name, &query.service_name) {
            (Some(name), _) => rows.by_name.get(name).cloned().unwrap_or_default(),
            (None, Some(service)) => rows.by_service.get(service).cloned().unwrap_or_default(),
            (None, None) => (0..rows.rows.len()).collect(),
        };

        let mut matched: Vec<Metric> = candidate_indices
            .into_iter()
            .map(|index| rows.rows[index].as_ref().clone())
            .filter(|metric| {
                if let Some(service) = &query.service_name {
                    if metric.service_name.as_deref() != Some(service.as_str()) {
                        return false;
                    }
                }
                if let Some(since) = query.since {
                    if metric.timestamp < since {
                        return false;
                    }
                }
                if let Some(until) = query.until {
                    if metric.timestamp > until {
                        return false;
                    }
                }
                true
            })
            .collect();

        if matched.len() > limit {
            matched.drain(..matched.len() - limit);
        }
        matched
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.rows.len()
    }

    /// Compute and store a baseline mean per (metric, service) series
    /// over the trailing window. Recomputing over the same window is
    /// idempotent.
    pub async fn create_baseline(&self, window: Duration) -> usize {
        let since = Utc::now() - ChronoDuration::from_std(window).unwrap_or(ChronoDuration::zero());
        let mut rows = self.rows.write().await;

        let mut sums: HashMap<(String, String), (f64, usize)> = HashMap::new();
        for row in &rows.rows {
            if row.timestamp < since {
                continue;
            }
            let entry = sums.entry(row.series_key()).or_insert((0.0, 0));
            entry.0 += row.value;
            entry.1 += 1;
        }

        let created = sums.len();
        for ((name, service), (sum, count)) in sums {
            let baseline = Baseline {
                metric_name: name.clone(),
                service_name: service.clone(),
                mean: sum / count as f64,
                sample_count: count,
                window_secs: window.as_secs(),
                created_at: Utc::now(),
            };
            rows.baselines.insert((name, service), baseline);
        }
        info!("Established {} metric baselines", created);
        created
    }

    pub async fn baseline(&self, name: &str, service: &str) -> Option<Baseline> {
        self.rows
            .read()
            .await
            .baselines
            .get(&(name.to_string(), service.to_string()))
            .cloned()
    }

    pub async fn baselines(&self) -> Vec<Baseline> {
        let rows = self.rows.read().await;
        let mut baselines: Vec<Baseline> = rows.baselines.values().cloned().collect();
        baselines.sort_by(|a, b| {
            (a.metric_name.as_str(), a.service_name.as_str())
                .cmp(&(b.metric_name.as_str(), b.service_name.as_str()))
        });
        baselines
    }

    async fn set_baseline(&self, baseline: Baseline) {
        let key = (
            baseline.metric_name.clone(),
            baseline.service_name.clone(),
        );
        self.rows.write().await.baselines.insert(key, baseline);
    }

    /// Start a scoped timing measurement. The elapsed time is recorded
    /// as a timer metric when the guard is finished or dropped.
    pub fn measure(
        &self,
        name: impl Into<String>,
        service: impl Into<String>,
    ) -> MeasureGuard {
        MeasureGuard {
            store: self.clone(),
            name: name.into(),
            service: service.into(),
            started: Instant::now(),
            error_tag: None,
            released: false,
        }
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsStore").finish()
    }
}

/// Token for a scoped measurement. Recording happens on every exit
/// path: either explicitly via [`finish`]/[`fail`] or on drop.
pub struct MeasureGuard {
    store: MetricsStore,
    name: String,
    service: String,
    started: Instant,
    error_tag: Option<String>,
    released: bool,
}

impl MeasureGuard {
    /// Mark the scope as failed; the recorded metric carries the error
    /// tag.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error_tag = Some(error.into());
    }

    pub fn finish(mut self) -> Duration {
        let elapsed = self.started.elapsed();
        self.release(elapsed);
        elapsed
    }

    fn release(&mut self, elapsed: Duration) {
        if self.released {
            return;
        }
        self.released = true;
        let mut metric = Metric::timer(self.name.clone(), elapsed.as_secs_f64() * 1000.0)
            .for_service(self.service.clone())
            .with_unit("ms");
        if let Some(error) = &self.error_tag {
            metric = metric.with_tag("error", error.clone());
        }
        self.store.record(metric);
    }
}

impl Drop for MeasureGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        self.release(elapsed);
    }
}

/// Per-metric regression thresholds in percent change.
fn regression_threshold(metric_name: &str) -> f64 {
    if metric_name.contains("cpu") {
        20.0
    } else if metric_name.contains("memory") {
        15.0
    } else if metric_name.contains("response_time") {
        25.0
    } else if metric_name.contains("error_count") {
        5.0
    } else {
        10.0
    }
}

/// Periodically compares recent samples against stored baselines and
/// emits advisory regression events.
pub struct RegressionDetector {
    store: MetricsStore,
    events: Arc<EventBus>,
    task: Mutex<Option<JoinHandle<()>>>,
    detections: Mutex<Vec<RegressionDetection>>,
}

impl RegressionDetector {
    pub fn new(store: MetricsStore, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            task: Mutex::new(None),
            detections: Mutex::new(Vec::new()),
        })
    }

    /// Run one detection pass over every baselined series.
    pub async fn detect(&self) -> Vec<RegressionDetection> {
        let baselines = self.store.baselines().await;
        let mut detections = Vec::new();

        // Series with enough data but no baseline yet get one
        // established silently.
        let mut series_seen: HashMap<(String, String), Vec<f64>> = HashMap::new();
        {
            let rows = self.store.rows.read().await;
            for row in &rows.rows {
                series_seen.entry(row.series_key()).or_default().push(row.value);
            }
        }

        let baselined: std::collections::HashSet<(String, String)> = baselines
            .iter()
            .map(|b| (b.metric_name.clone(), b.service_name.clone()))
            .collect();

        for ((name, service), values) in &series_seen {
            if values.len() >= MIN_SAMPLES_FOR_DETECTION
                && !baselined.contains(&(name.clone(), service.clone()))
            {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                self.store
                    .set_baseline(Baseline {
                        metric_name: name.clone(),
                        service_name: service.clone(),
                        mean,
                        sample_count: values.len(),
                        window_secs: 0,
                        created_at: Utc::now(),
                    })
                    .await;
            }
        }

        for baseline in baselines {
            let key = (
                baseline.metric_name.clone(),
                baseline.service_name.clone(),
            );
            let Some(values) = series_seen.get(&key) else {
                continue;
            };
            if values.len() < MIN_SAMPLES_FOR_DETECTION {
                continue;
            }

            let recent: Vec<f64> = values
                .iter()
                .rev()
                .take(RECENT_SAMPLE_WINDOW.min(values.len()))
                .copied()
                .collect();
            let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;

            if baseline.mean.abs() < f64::EPSILON {
                continue;
            }
            let change_percent = (recent_mean - baseline.mean) / baseline.mean * 100.0;
            let threshold = regression_threshold(&baseline.metric_name);

            if change_percent.abs() > threshold {
                let severity = if change_percent.abs() > threshold * 2.0 {
                    RegressionSeverity::Critical
                } else if change_percent.abs() > threshold * 1.5 {
                    RegressionSeverity::High
                } else {
                    RegressionSeverity::Medium
                };
                detections.push(RegressionDetection {
                    metric_name: baseline.metric_name,
                    service_name: baseline.service_name,
                    baseline_value: baseline.mean,
                    current_value: recent_mean,
                    change_percent,
                    threshold_percent: threshold,
                    severity,
                    detected_at: Utc::now(),
                });
            }
        }

        for detection in &detections {
            warn!(
                "Regression: {} for {} changed {:.1}% (baseline {:.2}, now {:.2})",
                detection.metric_name,
                detection.service_name,
                detection.change_percent,
                detection.baseline_value,
                detection.current_value
            );
            self.events.emit_regression(detection);
            self.store.record(
                Metric::counter("regression_detected", 1.0)
                    .for_service(detection.service_name.clone())
                    .with_tag("metric", detection.metric_name.clone())
                    .with_tag("severity", format!("{:?}", detection.severity).to_lowercase()),
            );
        }
        self.detections.lock().await.extend(detections.clone());
        detections
    }

    pub async fn start(self: &Arc<Self>, interval: Duration) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let detector = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                detector.detect().await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }

    pub async fn recent_detections(&self) -> Vec<RegressionDetection> {
        self.detections.lock().await.clone()
    }
}
