//! GPU compute offloading with CPU fallback.
//!
//! Tasks flagged for the GPU run on a small dedicated worker pool after
//! passing a GPU-memory reservation gate; when no backend is available,
//! the reservation fails, or the GPU-side execution errors, the task
//! falls back to the regular CPU pool. As with CPU tasks, a timeout
//! cancels only the caller's wait, never the in-flight work.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Job, Task, TaskOrchestrator, TaskPriority, TaskResult, TaskWork, WorkerPool};
use crate::error::Result;
use crate::monitor::gpu as gpu_sensing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    Cuda,
    None,
}

impl GpuBackend {
    pub fn is_available(&self) -> bool {
        *self != GpuBackend::None
    }
}

/// How reserved GPU memory blocks are recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuMemoryStrategy {
    /// Release a block as soon as its task completes.
    Eager,
    /// Released blocks linger and are reused by later tasks of the
    /// same or smaller size until expiry.
    Pooled,
}

/// Detected GPU resources. `backend == None` means every task takes
/// the CPU fallback path.
#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub backend: GpuBackend,
    pub device_count: u32,
    pub total_memory_mb: u64,
    pub device_names: Vec<String>,
}

impl GpuInfo {
    fn unavailable() -> Self {
        Self {
            backend: GpuBackend::None,
            device_count: 0,
            total_memory_mb: 0,
            device_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MemoryBlock {
    size_mb: u64,
    in_use: bool,
    released_at: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuMemoryUsage {
    pub total_mb: u64,
    pub allocated_mb: u64,
    pub available_mb: u64,
    pub block_count: usize,
}

/// Reservation accounting for GPU memory. Blocks are bookkeeping
/// entries, not device allocations; they gate admission so concurrent
/// GPU tasks cannot oversubscribe the device.
#[derive(Debug)]
pub struct GpuMemoryManager {
    total_mb: u64,
    strategy: GpuMemoryStrategy,
    blocks: std::sync::Mutex<HashMap<String, MemoryBlock>>,
}

impl GpuMemoryManager {
    pub fn new(total_mb: u64, strategy: GpuMemoryStrategy) -> Self {
        Self {
            total_mb,
            strategy,
            blocks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Reserve `size_mb`, reusing a lingering pooled block when one
    /// fits. Returns the block id, or `None` when the device would be
    /// oversubscribed.
    pub fn allocate(&self, size_mb: u64) -> Option<String> {
        let mut blocks = self.blocks.lock().unwrap();

        if self.strategy == GpuMemoryStrategy::Pooled {
            let reusable = blocks
                .iter()
                .filter(|(_, block)| !block.in_use && block.size_mb >= size_mb)
                .min_by_key(|(_, block)| block.size_mb)
                .map(|(id, _)| id.clone());
            if let Some(id) = reusable {
                let block = blocks.get_mut(&id).expect("block exists");
                block.in_use = true;
                block.released_at = None;
                return Some(id);
            }
        }

        let reserved: u64 = blocks.values().map(|b| b.size_mb).sum();
        if reserved + size_mb > self.total_mb {
            return None;
        }

        let id = Uuid::new_v4().to_string();
        blocks.insert(
            id.clone(),
            MemoryBlock {
                size_mb,
                in_use: true,
                released_at: None,
            },
        );
        Some(id)
    }

    /// Release a reservation. Pooled blocks linger for reuse; eager
    /// blocks are dropped immediately.
    pub fn release(&self, block_id: &str) -> bool {
        let mut blocks = self.blocks.lock().unwrap();
        match self.strategy {
            GpuMemoryStrategy::Eager => blocks.remove(block_id).is_some(),
            GpuMemoryStrategy::Pooled => match blocks.get_mut(block_id) {
                Some(block) => {
                    block.in_use = false;
                    block.released_at = Some(Instant::now());
                    true
                }
                None => false,
            },
        }
    }

    /// Drop lingering pooled blocks older than `max_age`. Returns how
    /// many were removed.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let mut blocks = self.blocks.lock().unwrap();
        let before = blocks.len();
        blocks.retain(|_, block| {
            block.in_use
                || block
                    .released_at
                    .map(|at| at.elapsed() < max_age)
                    .unwrap_or(true)
        });
        before - blocks.len()
    }

    pub fn usage(&self) -> GpuMemoryUsage {
        let blocks = self.blocks.lock().unwrap();
        let allocated_mb: u64 = blocks.values().map(|b| b.size_mb).sum();
        GpuMemoryUsage {
            total_mb: self.total_mb,
            allocated_mb,
            available_mb: self.total_mb.saturating_sub(allocated_mb),
            block_count: blocks.len(),
        }
    }
}

/// A computation flagged for the GPU lane.
pub struct GpuTask<T> {
    inner: Task<T>,
    pub memory_required_mb: u64,
}

impl<T: Send + 'static> GpuTask<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            inner: Task::cpu(f),
            memory_required_mb: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.inner = self.inner.with_id(id);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_required_mb = memory_mb;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.inner = self.inner.with_priority(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.with_timeout(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn priority(&self) -> TaskPriority {
        self.inner.priority
    }
}

/// Result of a GPU-lane submission, recording where the work actually
/// ran.
#[derive(Debug, Serialize)]
pub struct GpuTaskResult<T> {
    pub backend: GpuBackend,
    pub fell_back_to_cpu: bool,
    pub memory_reserved_mb: u64,
    pub result: TaskResult<T>,
}

#[derive(Debug, Clone)]
pub struct GpuOffloadConfig {
    pub gpu_workers: usize,
    pub memory_strategy: GpuMemoryStrategy,
    /// Lingering pooled blocks older than this are dropped by
    /// [`GpuComputeOffloader::manage_memory`].
    pub block_max_age: Duration,
}

impl Default for GpuOffloadConfig {
    fn default() -> Self {
        Self {
            gpu_workers: 2,
            memory_strategy: GpuMemoryStrategy::Pooled,
            block_max_age: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuOffloadStats {
    pub backend: GpuBackend,
    pub device_count: u32,
    pub gpu_tasks_executed: u64,
    pub cpu_fallbacks: u64,
    pub memory: GpuMemoryUsage,
}

/// Routes GPU-flagged tasks onto a dedicated worker pool when a
/// backend is present, falling back to the orchestrator's CPU pool
/// otherwise.
pub struct GpuComputeOffloader {
    config: GpuOffloadConfig,
    info: GpuInfo,
    memory: GpuMemoryManager,
    pool: Option<WorkerPool>,
    drain_pending: Arc<AtomicBool>,
    orchestrator: Arc<TaskOrchestrator>,
    gpu_tasks_executed: AtomicU64,
    cpu_fallbacks: AtomicU64,
}

impl GpuComputeOffloader {
    pub fn new(config: GpuOffloadConfig, orchestrator: Arc<TaskOrchestrator>) -> Self {
        let info = match gpu_sensing::device_info() {
            Some(device) => GpuInfo {
                backend: GpuBackend::Cuda,
                device_count: device.device_count,
                total_memory_mb: device.total_memory_mb,
                device_names: device.device_names,
            },
            None => GpuInfo::unavailable(),
        };

        let drain_pending = Arc::new(AtomicBool::new(false));
        let pool = if info.backend.is_available() {
            info!(
                "GPU offload enabled: {} device(s), {}MB, {} workers",
                info.device_count, info.total_memory_mb, config.gpu_workers
            );
            Some(WorkerPool::spawn(
                "gpu",
                config.gpu_workers.max(1),
                drain_pending.clone(),
            ))
        } else {
            debug!("No GPU backend detected; GPU tasks take the CPU fallback path");
            None
        };

        Self {
            memory: GpuMemoryManager::new(info.total_memory_mb, config.memory_strategy),
            info,
            pool,
            drain_pending,
            orchestrator,
            config,
            gpu_tasks_executed: AtomicU64::new(0),
            cpu_fallbacks: AtomicU64::new(0),
        }
    }

    pub fn info(&self) -> &GpuInfo {
        &self.info
    }

    pub fn memory(&self) -> &GpuMemoryManager {
        &self.memory
    }

    /// Submit one GPU task. Runs on the GPU pool when the backend is
    /// present and memory admits it; otherwise (or on GPU-side
    /// failure) the work re-runs on the CPU pool.
    pub async fn offload<T: Send + 'static>(&self, task: GpuTask<T>) -> Result<GpuTaskResult<T>> {
        let Some(pool) = &self.pool else {
            return self.fallback(task, "no GPU backend available").await;
        };

        let block = if task.memory_required_mb > 0 {
            match self.memory.allocate(task.memory_required_mb) {
                Some(block) => Some(block),
                None => {
                    return self
                        .fallback(task, "GPU memory reservation failed")
                        .await;
                }
            }
        } else {
            None
        };
        let reserved_mb = task.memory_required_mb;

        let outcome = self.execute_on_gpu(pool, &task).await;
        if let Some(block) = &block {
            self.memory.release(block);
        }

        match outcome {
            Ok(result) => {
                self.gpu_tasks_executed.fetch_add(1, Ordering::Relaxed);
                Ok(GpuTaskResult {
                    backend: self.info.backend,
                    fell_back_to_cpu: false,
                    memory_reserved_mb: reserved_mb,
                    result,
                })
            }
            Err(reason) => {
                warn!("GPU execution of {} failed: {}", task.inner.id, reason);
                self.fallback(task, &reason).await
            }
        }
    }

    async fn execute_on_gpu<T: Send + 'static>(
        &self,
        pool: &WorkerPool,
        task: &GpuTask<T>,
    ) -> std::result::Result<TaskResult<T>, String> {
        let TaskWork::Sync(work) = &task.inner.work else {
            return Err("async work cannot run on the GPU pool".to_string());
        };

        let (tx, rx) = oneshot::channel::<anyhow::Result<T>>();
        let work = work.clone();
        let job: Job = Box::new(move || {
            let _ = tx.send(work());
        });
        pool.submit(job).map_err(|e| e.to_string())?;

        let started = Instant::now();
        let received = match task.inner.timeout {
            Some(budget) => match tokio::time::timeout(budget, rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(format!(
                        "timed out after {:.1}s",
                        budget.as_secs_f64()
                    ));
                }
            },
            None => rx.await,
        };

        match received {
            Ok(Ok(value)) => Ok(TaskResult {
                task_id: task.inner.id.clone(),
                success: true,
                value: Some(value),
                error: None,
                execution_time_secs: started.elapsed().as_secs_f64(),
                retries: 0,
            }),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("GPU worker dropped the task".to_string()),
        }
    }

    async fn fallback<T: Send + 'static>(
        &self,
        task: GpuTask<T>,
        reason: &str,
    ) -> Result<GpuTaskResult<T>> {
        debug!("GPU task {} falling back to CPU: {}", task.inner.id, reason);
        self.cpu_fallbacks.fetch_add(1, Ordering::Relaxed);
        let result = self.orchestrator.offload(task.inner).await?;
        Ok(GpuTaskResult {
            backend: GpuBackend::None,
            fell_back_to_cpu: true,
            memory_reserved_mb: 0,
            result,
        })
    }

    /// Submit a set of GPU tasks, highest priority first. Results align
    /// positionally with the input.
    pub async fn offload_many<T: Send + 'static>(
        &self,
        tasks: Vec<GpuTask<T>>,
    ) -> Result<Vec<GpuTaskResult<T>>> {
        let mut indexed: Vec<(usize, GpuTask<T>)> = tasks.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.inner.priority.cmp(&a.1.inner.priority));

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

    /// Housekeeping pass: drop expired pooled blocks and report usage.
    pub fn manage_memory(&self) -> GpuMemoryUsage {
        let cleaned = self.memory.cleanup_expired(self.config.block_max_age);
        if cleaned > 0 {
            debug!("Dropped {} expired GPU memory blocks", cleaned);
        }
        self.memory.usage()
    }

    pub fn stats(&self) -> GpuOffloadStats {
        GpuOffloadStats {
            backend: self.info.backend,
            device_count: self.info.device_count,
            gpu_tasks_executed: self.gpu_tasks_executed.load(Ordering::Relaxed),
            cpu_fallbacks: self.cpu_fallbacks.load(Ordering::Relaxed),
            memory: self.memory.usage(),
        }
    }

    /// Tear down the GPU pool. With `wait`, in-flight jobs finish and
    /// workers are joined; without it, queued jobs are discarded.
    pub async fn shutdown(&self, wait: bool) {
        let Some(pool) = &self.pool else {
            return;
        };
        if !wait {
            self.drain_pending.store(true, Ordering::Release);
        }
        let handles = pool.close();
        if wait {
            let _ = tokio::task::spawn_blocking(move || {
                for handle in handles {
                    let _ = handle.join();
                }
            })
            .await;
        }
    }
}

impl std::fmt::Debug for GpuComputeOffloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuComputeOffloader")
            .field("backend", &self.info.backend)
            .field("device_count", &self.info.device_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_manager_rejects_oversubscription() {
        let manager = GpuMemoryManager::new(1024, GpuMemoryStrategy::Eager);
        let first = manager.allocate(600).unwrap();
        assert!(manager.allocate(600).is_none());
        assert!(manager.release(&first));
        assert!(manager.allocate(600).is_some());
    }

    #[test]
    fn pooled_blocks_are_reused() {
        let manager = GpuMemoryManager::new(1024, GpuMemoryStrategy::Pooled);
        let block = manager.allocate(512).unwrap();
        manager.release(&block);
        assert_eq!(manager.usage().block_count, 1);

        // The lingering block satisfies the next fitting request.
        let reused = manager.allocate(256).unwrap();
        assert_eq!(reused, block);
        assert_eq!(manager.usage().block_count, 1);
    }

    #[test]
    fn expired_pooled_blocks_are_dropped() {
        let manager = GpuMemoryManager::new(1024, GpuMemoryStrategy::Pooled);
        let block = manager.allocate(512).unwrap();
        manager.release(&block);
        assert_eq!(manager.cleanup_expired(Duration::ZERO), 1);
        assert_eq!(manager.usage().allocated_mb, 0);
    }
}
