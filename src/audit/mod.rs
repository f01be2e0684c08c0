use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::lifecycle::{LifecycleManager, ServiceStartupRecord};
use crate::monitor::{ResourceMetrics, ResourceMonitor};
use crate::orchestrator::{TaskOrchestrator, WorkerStats};

/// Classified performance bottlenecks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckType {
    CpuIntensive,
    MemoryLeak,
    IoBound,
    StartupSlow,
    ResourceContention,
    BlockingOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One identified bottleneck with remediation hints. `impact_score` is
/// 0-100, higher meaning more user-visible damage.
#[derive(Debug, Clone, Serialize)]
pub struct Bottleneck {
    pub service_name: String,
    pub bottleneck_type: BottleneckType,
    pub severity: BottleneckSeverity,
    pub description: String,
    pub impact_score: f64,
    pub recommendations: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// Detection thresholds for the audit pass.
#[derive(Debug, Clone)]
pub struct AuditThresholds {
    pub cpu_high_percent: f64,
    pub memory_high_percent: f64,
    pub startup_slow_secs: f64,
    /// A startup is also slow when actual exceeds this multiple of the
    /// planner's estimate (and is long enough to matter).
    pub startup_estimate_ratio: f64,
    pub disk_high_percent: f64,
    pub blocking_avg_secs: f64,
    /// Memory-percent rise across the history window that counts as a
    /// leak signature.
    pub memory_growth_points: f64,
}

impl Default for AuditThresholds {
    fn default() -> Self {
        Self {
            cpu_high_percent: 80.0,
            memory_high_percent: 85.0,
            startup_slow_secs: 10.0,
            startup_estimate_ratio: 2.0,
            disk_high_percent: 85.0,
            blocking_avg_secs: 1.0,
            memory_growth_points: 5.0,
        }
    }
}

/// Full audit output: bottlenecks ranked by impact plus an aggregate
/// health score (100 = clean).
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub services_analyzed: usize,
    pub total_startup_secs: f64,
    pub bottlenecks: Vec<Bottleneck>,
    pub recommendations: Vec<String>,
    pub health_score: f64,
}

fn calculate_severity(value: f64, threshold: f64, critical: f64) -> BottleneckSeverity {
    if value >= critical {
        BottleneckSeverity::Critical
    } else if value >= threshold * 1.5 {
        BottleneckSeverity::High
    } else if value >= threshold * 1.2 {
        BottleneckSeverity::Medium
    } else {
        BottleneckSeverity::Low
    }
}

/// Flag services whose startup ran long, either in absolute terms or
/// relative to the planner's estimate.
pub fn analyze_startup_records(
    records: &[ServiceStartupRecord],
    thresholds: &AuditThresholds,
) -> Vec<Bottleneck> {
    let mut bottlenecks = Vec::new();
    for record in records {
        let over_absolute = record.duration_secs > thresholds.startup_slow_secs;
        let over_estimate = record.estimated_secs > 0.0
            && record.duration_secs
                > thresholds.startup_estimate_ratio * record.estimated_secs
            && record.duration_secs >= 1.0;
        if !over_absolute && !over_estimate {
            continue;
        }

        bottlenecks.push(Bottleneck {
            service_name: record.name.clone(),
            bottleneck_type: BottleneckType::StartupSlow,
            severity: calculate_severity(
                record.duration_secs,
                thresholds.startup_slow_secs,
                30.0,
            ),
            description: format!(
                "startup took {:.2}s (estimated {:.2}s, slow threshold {:.0}s)",
                record.duration_secs, record.estimated_secs, thresholds.startup_slow_secs
            ),
            impact_score: (record.duration_secs / thresholds.startup_slow_secs * 50.0)
                .min(100.0),
            recommendations: vec![
                "Lazy-load non-essential components".to_string(),
                "Move heavy initialization to background tasks".to_string(),
                "Cache expensive startup computations".to_string(),
            ],
            detected_at: Utc::now(),
        });
    }
    bottlenecks
}

/// Classify sustained system-level symptoms from the monitor's metric
/// history.
pub fn analyze_resource_history(
    history: &[ResourceMetrics],
    thresholds: &AuditThresholds,
) -> Vec<Bottleneck> {
    let mut bottlenecks = Vec::new();
    if history.is_empty() {
        return bottlenecks;
    }

    let samples = history.len() as f64;
    let avg_cpu = history.iter().map(|m| m.cpu_percent).sum::<f64>() / samples;
    let max_cpu = history.iter().map(|m| m.cpu_percent).fold(0.0, f64::max);
    let avg_memory = history.iter().map(|m| m.memory_percent).sum::<f64>() / samples;
    let avg_disk = history.iter().map(|m| m.disk_percent).sum::<f64>() / samples;

    if avg_cpu > thresholds.cpu_high_percent {
        bottlenecks.push(Bottleneck {
            service_name: "system".to_string(),
            bottleneck_type: BottleneckType::CpuIntensive,
            severity: calculate_severity(avg_cpu, thresholds.cpu_high_percent, 100.0),
            description: format!(
                "high CPU usage: {:.1}% average, {:.1}% peak",
                avg_cpu, max_cpu
            ),
            impact_score: (avg_cpu / thresholds.cpu_high_percent * 60.0).min(100.0),
            recommendations: vec![
                "Profile hot paths and offload CPU-bound work to the worker pool".to_string(),
                "Cache frequently computed results".to_string(),
                "Suspend background services under load".to_string(),
            ],
            detected_at: Utc::now(),
        });
    }

    if avg_memory > thresholds.memory_high_percent {
        bottlenecks.push(Bottleneck {
            service_name: "system".to_string(),
            bottleneck_type: BottleneckType::MemoryLeak,
            severity: calculate_severity(avg_memory, thresholds.memory_high_percent, 98.0),
            description: format!("high memory usage: {:.1}% average", avg_memory),
            impact_score: (avg_memory / thresholds.memory_high_percent * 50.0).min(100.0),
            recommendations: vec![
                "Review cache sizes and idle timeouts".to_string(),
                "Enable memory-pressure auto-optimization".to_string(),
            ],
            detected_at: Utc::now(),
        });
    }

    // Leak signature: mostly monotonic growth across the window.
    if history.len() >= 10 {
        let first = history.first().map(|m| m.memory_percent).unwrap_or(0.0);
        let last = history.last().map(|m| m.memory_percent).unwrap_or(0.0);
        let rising_steps = history
            .windows(2)
            .filter(|pair| pair[1].memory_percent >= pair[0].memory_percent)
            .count();
        let rising_share = rising_steps as f64 / (history.len() - 1) as f64;
        if last - first >= thresholds.memory_growth_points && rising_share >= 0.8 {
            bottlenecks.push(Bottleneck {
                service_name: "system".to_string(),
                bottleneck_type: BottleneckType::MemoryLeak,
                severity: calculate_severity(
                    last - first,
                    thresholds.memory_growth_points,
                    thresholds.memory_growth_points * 4.0,
                ),
                description: format!(
                    "memory grew {:.1} points over {} samples without recovery",
                    last - first,
                    history.len()
                ),
                impact_score: ((last - first) / thresholds.memory_growth_points * 40.0)
                    .min(100.0),
                recommendations: vec![
                    "Look for instances retained past their idle timeout".to_string(),
                    "Verify suspended services drop their caches".to_string(),
                ],
                detected_at: Utc::now(),
            });
        }
    }

    if avg_disk > thresholds.disk_high_percent {
        bottlenecks.push(Bottleneck {
            service_name: "system".to_string(),
            bottleneck_type: BottleneckType::IoBound,
            severity: calculate_severity(avg_disk, thresholds.disk_high_percent, 95.0),
            description: format!("disk usage at {:.1}% average", avg_disk),
            impact_score: (avg_disk / thresholds.disk_high_percent * 40.0).min(100.0),
            recommendations: vec![
                "Batch and cache I/O-heavy operations".to_string(),
                "Schedule cleanup of stale on-disk data".to_string(),
            ],
            detected_at: Utc::now(),
        });
    }

    if let Some(latest) = history.last() {
        if latest.cpu_percent >= 70.0 && latest.memory_percent >= 75.0 {
            bottlenecks.push(Bottleneck {
                service_name: "system".to_string(),
                bottleneck_type: BottleneckType::ResourceContention,
                severity: BottleneckSeverity::High,
                description: format!(
                    "CPU ({:.1}%) and memory ({:.1}%) elevated simultaneously",
                    latest.cpu_percent, latest.memory_percent
                ),
                impact_score: 70.0,
                recommendations: vec![
                    "Stagger background workloads".to_string(),
                    "Lower worker pool sizes under combined pressure".to_string(),
                ],
                detected_at: Utc::now(),
            });
        }
    }

    bottlenecks
}

/// Flag orchestrator symptoms: a high average execution time means the
/// pools are absorbing long blocking operations.
pub fn analyze_worker_stats(
    stats: &WorkerStats,
    thresholds: &AuditThresholds,
) -> Vec<Bottleneck> {
    let mut bottlenecks = Vec::new();
    if stats.tasks_completed > 0 && stats.average_execution_secs > thresholds.blocking_avg_secs {
        bottlenecks.push(Bottleneck {
            service_name: "orchestrator".to_string(),
            bottleneck_type: BottleneckType::BlockingOperation,
            severity: calculate_severity(
                stats.average_execution_secs,
                thresholds.blocking_avg_secs,
                thresholds.blocking_avg_secs * 5.0,
            ),
            description: format!(
                "tasks average {:.2}s across {} completions",
                stats.average_execution_secs, stats.tasks_completed
            ),
            impact_score: (stats.average_execution_secs / thresholds.blocking_avg_secs * 30.0)
                .min(100.0),
            recommendations: vec![
                "Split long tasks into batches".to_string(),
                "Route blocking I/O to the IO pool with timeouts".to_string(),
            ],
            detected_at: Utc::now(),
        });
    }
    bottlenecks
}

fn health_score(bottlenecks: &[Bottleneck]) -> f64 {
    let penalty: f64 = bottlenecks
        .iter()
        .map(|b| match b.severity {
            BottleneckSeverity::Critical => 25.0,
            BottleneckSeverity::High => 15.0,
            BottleneckSeverity::Medium => 8.0,
            BottleneckSeverity::Low => 3.0,
        })
        .sum();
    (100.0 - penalty).max(0.0)
}

/// Audits startup and runtime behavior of the running engine,
/// classifying bottlenecks and scoring overall health.
pub struct PerformanceAuditor {
    lifecycle: Arc<LifecycleManager>,
    monitor: Arc<ResourceMonitor>,
    orchestrator: Arc<TaskOrchestrator>,
    thresholds: AuditThresholds,
}

impl PerformanceAuditor {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        monitor: Arc<ResourceMonitor>,
        orchestrator: Arc<TaskOrchestrator>,
    ) -> Self {
        Self {
            lifecycle,
            monitor,
            orchestrator,
            thresholds: AuditThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: AuditThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Run one audit pass over the live engine state.
    pub async fn audit(&self) -> AuditReport {
        let lifecycle_report = self.lifecycle.lifecycle_report().await;
        let history = self.monitor.metrics_history(None).await;
        let worker_stats = self.orchestrator.worker_stats();

        let startup_records: Vec<ServiceStartupRecord> =
            lifecycle_report.startup_records.values().cloned().collect();
        let total_startup_secs: f64 = startup_records.iter().map(|r| r.duration_secs).sum();

        let mut bottlenecks = analyze_startup_records(&startup_records, &self.thresholds);
        bottlenecks.extend(analyze_resource_history(&history, &self.thresholds));
        bottlenecks.extend(analyze_worker_stats(&worker_stats, &self.thresholds));
        bottlenecks.sort_by(|a, b| {
            b.impact_score
                .partial_cmp(&a.impact_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut recommendations = Vec::new();
        for bottleneck in &bottlenecks {
            for recommendation in &bottleneck.recommendations {
                if !recommendations.contains(recommendation) {
                    recommendations.push(recommendation.clone());
                }
            }
        }
        recommendations.truncate(10);

        let report = AuditReport {
            generated_at: Utc::now(),
            services_analyzed: lifecycle_report.total_services,
            total_startup_secs,
            health_score: health_score(&bottlenecks),
            bottlenecks,
            recommendations,
        };
        info!(
            "Audit complete: {} bottlenecks, health score {:.0}",
            report.bottlenecks.len(),
            report.health_score
        );
        report
    }
}

impl std::fmt::Debug for PerformanceAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceAuditor").finish()
    }
}
