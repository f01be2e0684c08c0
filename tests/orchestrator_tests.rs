use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use vigil::{
    GpuBackend, GpuComputeOffloader, GpuOffloadConfig, GpuTask, OrchestratorConfig, Task,
    TaskOrchestrator, TaskPriority,
};

fn quick_config() -> OrchestratorConfig {
    OrchestratorConfig {
        cpu_workers: 1,
        io_workers: 2,
        retry_base_delay: Duration::from_millis(5),
        batch_pause: Duration::from_millis(2),
    }
}

#[tokio::test]
async fn parallel_schedule_preserves_order_and_starts_critical_first() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    let execution_order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let tasks = vec![
        {
            let order = execution_order.clone();
            Task::cpu(move || {
                order.lock().unwrap().push("low");
                Ok(1u32)
            })
            .with_id("low")
            .with_priority(TaskPriority::Low)
        },
        {
            let order = execution_order.clone();
            Task::cpu(move || {
                order.lock().unwrap().push("critical");
                Ok(2u32)
            })
            .with_id("critical")
            .with_priority(TaskPriority::Critical)
        },
        {
            let order = execution_order.clone();
            Task::cpu(move || {
                order.lock().unwrap().push("normal");
                Ok(3u32)
            })
            .with_id("normal")
            .with_priority(TaskPriority::Normal)
        },
    ];

    let results = orchestrator.schedule(tasks).await.unwrap();

    // Positional alignment with the input, regardless of completion.
    let values: Vec<u32> = results.iter().map(|r| r.value.unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3]);
    let ids: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["low", "critical", "normal"]);

    // With a single CPU worker, queue order is execution order.
    let observed = execution_order.lock().unwrap().clone();
    assert_eq!(observed.first(), Some(&"critical"));

    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn schedule_result_count_matches_input() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    let tasks: Vec<Task<usize>> = (0..25)
        .map(|i| Task::io(move || Ok(i)).with_id(format!("task-{i}")))
        .collect();
    let results = orchestrator.schedule(tasks).await.unwrap();

    assert_eq!(results.len(), 25);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.task_id, format!("task-{i}"));
        assert_eq!(result.value, Some(i));
    }
    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn batch_processing_mirrors_input_order() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    let tasks: Vec<Task<usize>> = (0..10).map(|i| Task::cpu(move || Ok(i))).collect();
    let results = orchestrator.batch(tasks, 3).await.unwrap();

    let values: Vec<usize> = results.iter().map(|r| r.value.unwrap()).collect();
    assert_eq!(values, (0..10).collect::<Vec<_>>());
    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn retry_succeeds_after_transient_failures() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    let attempts = Arc::new(AtomicU64::new(0));
    let counted = attempts.clone();
    let task = Task::io(move || {
        let attempt = counted.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            Err(anyhow::anyhow!("transient"))
        } else {
            Ok("done")
        }
    })
    .with_max_retries(3);

    let result = orchestrator.offload(task).await.unwrap();
    assert!(result.success);
    assert_eq!(result.value, Some("done"));
    assert_eq!(result.retries, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn failure_surfaces_last_error_after_exhausting_retries() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    let task = Task::io(|| Err::<(), _>(anyhow::anyhow!("disk on fire"))).with_max_retries(2);

    let result = orchestrator.offload(task).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.retries, 2);
    assert!(result.error.unwrap().contains("disk on fire"));
    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn async_tasks_run_on_the_scheduling_path() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    let task = Task::future(|| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(99u32)
    });
    let result = orchestrator.offload(task).await.unwrap();
    assert_eq!(result.value, Some(99));
    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn async_task_timeout_cancels_the_work() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    let completed = Arc::new(AtomicU64::new(0));
    let counted = completed.clone();
    let task = Task::future(move || {
        let counted = counted.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .with_timeout(Duration::from_millis(20));

    let result = orchestrator.offload(task).await.unwrap();
    assert!(!result.success);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn shutdown_without_wait_rejects_new_submissions() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    orchestrator.shutdown(false).await;
    assert!(orchestrator.is_closed());

    let err = orchestrator
        .offload(Task::cpu(|| Ok(())))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("closed"));

    let err = orchestrator
        .schedule(vec![Task::cpu(|| Ok(()))])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("closed"));
}

#[tokio::test]
async fn gpu_tasks_fall_back_to_cpu_without_backend() {
    // Test builds carry no GPU backend, so the fallback path is the
    // observable one.
    let orchestrator = Arc::new(TaskOrchestrator::new(quick_config()));
    let offloader = GpuComputeOffloader::new(GpuOffloadConfig::default(), orchestrator.clone());
    assert!(!offloader.info().backend.is_available());

    let task = GpuTask::new(|| Ok(6 * 7)).with_memory_mb(512);
    let outcome = offloader.offload(task).await.unwrap();

    assert!(outcome.fell_back_to_cpu);
    assert_eq!(outcome.backend, GpuBackend::None);
    assert!(outcome.result.success);
    assert_eq!(outcome.result.value, Some(42));

    let stats = offloader.stats();
    assert_eq!(stats.cpu_fallbacks, 1);
    assert_eq!(stats.gpu_tasks_executed, 0);

    offloader.shutdown(true).await;
    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn gpu_batch_results_align_with_input() {
    let orchestrator = Arc::new(TaskOrchestrator::new(quick_config()));
    let offloader = GpuComputeOffloader::new(GpuOffloadConfig::default(), orchestrator.clone());

    let tasks = vec![
        GpuTask::new(|| Ok(1u32)).with_priority(TaskPriority::Low),
        GpuTask::new(|| Ok(2u32)).with_priority(TaskPriority::Critical),
        GpuTask::new(|| Ok(3u32)).with_priority(TaskPriority::Normal),
    ];
    let outcomes = offloader.offload_many(tasks).await.unwrap();

    let values: Vec<u32> = outcomes
        .iter()
        .map(|o| o.result.value.unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3]);

    offloader.shutdown(true).await;
    orchestrator.shutdown(true).await;
}

#[tokio::test]
async fn worker_stats_track_completion() {
    let orchestrator = TaskOrchestrator::new(quick_config());
    for _ in 0..5 {
        orchestrator.offload(Task::cpu(|| Ok(()))).await.unwrap();
    }
    let failing = Task::cpu(|| Err::<(), _>(anyhow::anyhow!("nope")));
    orchestrator.offload(failing).await.unwrap();

    let stats = orchestrator.worker_stats();
    assert_eq!(stats.tasks_submitted, 6);
    assert_eq!(stats.tasks_completed, 5);
    assert_eq!(stats.tasks_failed, 1);
    assert_eq!(stats.cpu_workers, 1);
    orchestrator.shutdown(true).await;
}
