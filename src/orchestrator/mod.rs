use futures::future::BoxFuture;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

pub mod gpu;

/// Where a task's work runs.
///
/// `CpuIntensive` work executes on dedicated CPU worker threads. A
/// timeout on a CPU task cancels only the caller's wait: the worker
/// thread cannot be interrupted and will finish the job, its result
/// discarded. IO-kind tasks additionally honor cancellation while still
/// queued, and async tasks are aborted outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CpuIntensive,
    IoBound,
    Blocking,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

enum TaskWork<T> {
    Sync(Arc<dyn Fn() -> anyhow::Result<T> + Send + Sync>),
    Async(Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>),
}

impl<T> Clone for TaskWork<T> {
    fn clone(&self) -> Self {
        match self {
            TaskWork::Sync(f) => TaskWork::Sync(f.clone()),
            TaskWork::Async(f) => TaskWork::Async(f.clone()),
        }
    }
}

/// A unit of work for the orchestrator.
pub struct Task<T> {
    pub id: String,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    work: TaskWork<T>,
}

impl<T: Send + 'static> Task<T> {
    pub fn cpu<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::sync_task(TaskKind::CpuIntensive, f)
    }

    pub fn io<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::sync_task(TaskKind::IoBound, f)
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::sync_task(TaskKind::Blocking, f)
    }

    /// Already-asynchronous work, scheduled on the main scheduling path.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Batch,
            priority: TaskPriority::Normal,
            timeout: None,
            max_retries: 0,
            work: TaskWork::Async(Arc::new(move || Box::pin(f()))),
        }
    }

    fn sync_task<F>(kind: TaskKind, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            priority: TaskPriority::Normal,
            timeout: None,
            max_retries: 0,
            work: TaskWork::Sync(Arc::new(f)),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Result of one task, including retries. Task failures are carried
/// here rather than raised; only submission-level problems (a closed
/// orchestrator) surface as errors.
#[derive(Debug, Serialize)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<String>,
    pub execution_time_secs: f64,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub cpu_workers: usize,
    pub io_workers: usize,
    /// Base unit of the 2^attempt retry delay.
    pub retry_base_delay: Duration,
    /// Pause inserted between batches by [`TaskOrchestrator::batch`].
    pub batch_pause: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let cores = num_cpus::get();
        Self {
            cpu_workers: cores.saturating_sub(1).max(1),
            io_workers: (cores + 4).min(32),
            retry_base_delay: Duration::from_secs(1),
            batch_pause: Duration::from_millis(10),
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size pool of OS worker threads fed by a multi-consumer queue.
struct WorkerPool {
    name: &'static str,
    size: usize,
    sender: std::sync::Mutex<Option<crossbeam_channel::Sender<Job>>>,
    handles: std::sync::Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkerPool {
    fn spawn(name: &'static str, size: usize, drain_pending: Arc<AtomicBool>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let drain_pending = drain_pending.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vigil-{name}-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if drain_pending.load(Ordering::Acquire) {
                            // Cancelled shutdown: discard queued jobs.
                            continue;
                        }
                        job();
                    }
                })
                .expect("worker thread spawn");
            handles.push(handle);
        }
        Self {
            name,
            size,
            sender: std::sync::Mutex::new(Some(sender)),
            handles: std::sync::Mutex::new(handles),
        }
    }

    fn submit(&self, job: Job) -> Result<(), OrchestratorError> {
        let sender = self.sender.lock().unwrap();
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| OrchestratorError::PoolUnavailable {
                pool: self.name.to_string(),
            }),
            None => Err(OrchestratorError::PoolUnavailable {
                pool: self.name.to_string(),
            }),
        }
    }

    fn close(&self) -> Vec<std::thread::JoinHandle<()>> {
        self.sender.lock().unwrap().take();
        self.handles.lock().unwrap().drain(..).collect()
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkerStats {
    pub cpu_workers: usize,
    pub io_workers: usize,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub average_execution_secs: f64,
}

/// Prioritized offload of CPU-bound and blocking work onto dedicated
/// worker pools, keeping the main scheduling path responsive.
///
/// Exclusively owns its pools: dropping or shutting down the
/// orchestrator tears the worker threads down with it.
pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    cpu_pool: WorkerPool,
    io_pool: WorkerPool,
    closed: AtomicBool,
    drain_pending: Arc<AtomicBool>,
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_execution_micros: AtomicU64,
}

impl TaskOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let drain_pending = Arc::new(AtomicBool::new(false));
        info!(
            "Task orchestrator starting: {} CPU workers, {} IO workers",
            config.cpu_workers, config.io_workers
        );
        Self {
            cpu_pool: WorkerPool::spawn("cpu", config.cpu_workers, drain_pending.clone()),
            io_pool: WorkerPool::spawn("io", config.io_workers, drain_pending.clone()),
            closed: AtomicBool::new(false),
            drain_pending,
            config,
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_execution_micros: AtomicU64::new(0),
        }
    }

    /// Submit one task and wait for its result, honoring the task's
    /// timeout and retry policy.
    pub async fn offload<T: Send + 'static>(&self, task: Task<T>) -> Result<TaskResult<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrchestratorError::Closed {
                task_id: task.id.clone(),
            }
            .into());
        }
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let mut last_error = String::new();
        let attempts = task.max_retries + 1;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry_delay(attempt - 1);
                debug!(
                    "Task {} retry {}/{} after {:?}",
                    task.id, attempt, task.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.execute_once(&task).await {
                Ok(value) => {
                    let elapsed = started.elapsed();
                    self.tasks_completed.fetch_add(1, Ordering::Relaxed);
                    self.total_execution_micros
                        .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
                    return Ok(TaskResult {
                        task_id: task.id.clone(),
                        success: true,
                        value: Some(value),
                        error: None,
                        execution_time_secs: elapsed.as_secs_f64(),
                        retries: attempt,
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }

        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Task {} failed after {} retries: {}",
            task.id, task.max_retries, last_error
        );
        Ok(TaskResult {
            task_id: task.id.clone(),
            success: false,
            value: None,
            error: Some(last_error),
            execution_time_secs: started.elapsed().as_secs_f64(),
            retries: task.max_retries,
        })
    }

    async fn execute_once<T: Send + 'static>(&self, task: &Task<T>) -> anyhow::Result<T> {
        match (&task.work, task.kind) {
            (TaskWork::Async(work), _) => {
                let handle = tokio::spawn(work());
                let abort = handle.abort_handle();
                match task.timeout {
                    Some(budget) => match tokio::time::timeout(budget, handle).await {
                        Ok(joined) => joined?,
                        Err(_) => {
                            // Async work is cancelled along with the wait.
                            abort.abort();
                            anyhow::bail!("timed out after {:.1}s", budget.as_secs_f64());
                        }
                    },
                    None => handle.await?,
                }
            }
            (TaskWork::Sync(work), kind) => {
                let (tx, rx) = oneshot::channel::<anyhow::Result<T>>();
                let work = work.clone();
                let cancelled = Arc::new(AtomicBool::new(false));
                let cancel_flag = cancelled.clone();
                let job: Job = Box::new(move || {
                    if cancel_flag.load(Ordering::Acquire) {
                        return;
                    }
                    let _ = tx.send(work());
                });

                let pool = match kind {
                    TaskKind::CpuIntensive => &self.cpu_pool,
                    _ => &self.io_pool,
                };
                pool.submit(job)?;

                match task.timeout {
                    Some(budget) => match tokio::time::timeout(budget, rx).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => anyhow::bail!("worker dropped the task"),
                        Err(_) => {
                            // CPU work is uninterruptible: only the wait is
                            // cancelled. Queued IO work is flagged so it
                            // never starts.
                            if kind != TaskKind::CpuIntensive {
                                cancelled.store(true, Ordering::Release);
                            }
                            anyhow::bail!("timed out after {:.1}s", budget.as_secs_f64());
                        }
                    },
                    None => match rx.await {
                        Ok(result) => result,
                        Err(_) => anyhow::bail!("worker dropped the task"),
                    },
                }
            }
        }
    }

    /// Launch a set of tasks concurrently, highest priority first.
    ///
    /// Results align positionally with the input regardless of
    /// completion order.
    pub async fn schedule<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
    ) -> Result<Vec<TaskResult<T>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrchestratorError::Closed {
                task_id: "<schedule>".to_string(),
            }
            .into());
        }

        let mut indexed: Vec<(usize, Task<T>)> = tasks.into_iter().enumerate().collect();
        // Stable sort: equal priorities keep submission order.
        indexed.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));

        let futures: Vec<_> = indexed
            .into_iter()
            .map(|(index, task)| async move { (index, self.offload(task).await) })
            .collect();

        let mut completed = futures::future::join_all(futures).await;
        completed.sort_by_key(|(index, _)| *index);

        completed
            .into_iter()
            .map(|(_, result)| result)
            .collect::<Result<Vec<_>>>()
    }

    /// Run tasks in batches of `batch_size`, yielding briefly between
    /// batches to relieve scheduling pressure. Result order mirrors the
    /// input.
    pub async fn batch<T: Send + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        batch_size: usize,
    ) -> Result<Vec<TaskResult<T>>> {
        let batch_size = batch_size.max(1);
        let mut results = Vec::with_capacity(tasks.len());
        let total = tasks.len();
        let mut queue = tasks;

        while !queue.is_empty() {
            let rest = queue.split_off(queue.len().min(batch_size));
            let chunk = std::mem::replace(&mut queue, rest);
            results.extend(self.schedule(chunk).await?);
            if !queue.is_empty() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }

        debug!("Batch processing finished: {} tasks", total);
        Ok(results)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay.as_millis() as u64;
        let backoff = base.saturating_mul(1u64 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        Duration::from_millis(backoff + jitter)
    }

    pub fn worker_stats(&self) -> WorkerStats {
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        let total_micros = self.total_execution_micros.load(Ordering::Relaxed);
        WorkerStats {
            cpu_workers: self.cpu_pool.size,
            io_workers: self.io_pool.size,
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: completed,
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            average_execution_secs: if completed > 0 {
                (total_micros as f64 / completed as f64) / 1_000_000.0
            } else {
                0.0
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut the pools down. With `wait`, in-flight and queued jobs
    /// finish and worker threads are joined; without it, queued jobs are
    /// discarded and in-flight CPU work completes unobserved.
    pub async fn shutdown(&self, wait: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !wait {
            self.drain_pending.store(true, Ordering::Release);
        }

        let mut handles = self.cpu_pool.close();
        handles.extend(self.io_pool.close());

        if wait {
            let joined = tokio::task::spawn_blocking(move || {
                for handle in handles {
                    let _ = handle.join();
                }
            })
            .await;
            if joined.is_err() {
                warn!("Worker pool join was interrupted");
            }
        }
        info!("Task orchestrator shut down (wait={})", wait);
    }
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("cpu_workers", &self.cpu_pool.size)
            .field("io_workers", &self.io_pool.size)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> OrchestratorConfig {
        OrchestratorConfig {
            cpu_workers: 2,
            io_workers: 2,
            retry_base_delay: Duration::from_millis(5),
            batch_pause: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn offload_runs_cpu_work() {
        let orchestrator = TaskOrchestrator::new(quick_config());
        let result = orchestrator
            .offload(Task::cpu(|| Ok(21 * 2)))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.value, Some(42));
        orchestrator.shutdown(true).await;
    }

    #[tokio::test]
    async fn retries_exactly_max_retries_times() {
        let orchestrator = TaskOrchestrator::new(quick_config());
        let calls = Arc::new(AtomicU64::new(0));
        let counted = calls.clone();
        let task = Task::cpu(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(anyhow::anyhow!("always fails"))
        })
        .with_max_retries(3);

        let result = orchestrator.offload(task).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.retries, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        orchestrator.shutdown(true).await;
    }

    #[tokio::test]
    async fn schedule_preserves_input_order() {
        let orchestrator = TaskOrchestrator::new(quick_config());
        let tasks = vec![
            Task::cpu(|| Ok(1u32)).with_priority(TaskPriority::Low),
            Task::cpu(|| Ok(2u32)).with_priority(TaskPriority::Critical),
            Task::cpu(|| Ok(3u32)).with_priority(TaskPriority::Normal),
        ];
        let results = orchestrator.schedule(tasks).await.unwrap();
        let values: Vec<u32> = results.iter().map(|r| r.value.unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3]);
        orchestrator.shutdown(true).await;
    }

    #[tokio::test]
    async fn submissions_fail_after_shutdown() {
        let orchestrator = TaskOrchestrator::new(quick_config());
        orchestrator.shutdown(true).await;
        let err = orchestrator
            .offload(Task::cpu(|| Ok(1u32)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn cpu_timeout_cancels_wait_only() {
        let orchestrator = TaskOrchestrator::new(quick_config());
        let task = Task::cpu(|| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(1u32)
        })
        .with_timeout(Duration::from_millis(20));

        let result = orchestrator.offload(task).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        orchestrator.shutdown(true).await;
    }
}
