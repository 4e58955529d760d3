//! Worker pool for processing stage jobs.
//!
//! This module provides a pool of workers that process jobs from a shared
//! [`StageQueue`]. Each worker runs as an independent async task, pulls one
//! job at a time and hands it to a [`StageExecutor`].
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Pool statistics tracking
//!
//! Stages are never retried: a failed stage fails its run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{JobOutcome, JobResult, StageJob};
use super::queue::{QueueError, StageQueue};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Runs one stage job.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes `job`, returning the stage outcome. Failures are outcomes,
    /// not errors.
    async fn execute(&self, job: &StageJob) -> JobOutcome;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long a dequeue waits before checking for shutdown.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Total number of stages completed successfully.
    pub jobs_completed: u64,
    /// Total number of stages that failed.
    pub jobs_failed: u64,
    /// Average stage duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        if success {
            self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn StageQueue>,
    executor: Arc<dyn StageExecutor>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool over `queue`.
    ///
    /// # Arguments
    ///
    /// * `config` - Pool configuration
    /// * `queue` - Queue the workers pull from
    /// * `executor` - Runs each dequeued stage
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn StageQueue>,
        executor: Arc<dyn StageExecutor>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            executor,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                queue: Arc::clone(&self.queue),
                executor: Arc::clone(&self.executor),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
                stats: Arc::clone(&self.stats),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current stage before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that processes jobs from the queue.
struct Worker {
    id: String,
    queue: Arc<dyn StageQueue>,
    executor: Arc<dyn StageExecutor>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Polls for jobs and processes them until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single job and publishes its result.
    async fn process_job(&self, job: StageJob) {
        let start_time = Instant::now();
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            run_id = %job.run_id,
            stage = %job.stage,
            "Processing stage"
        );

        self.stats.active_workers.fetch_add(1, Ordering::SeqCst);
        let outcome = self.executor.execute(&job).await;
        self.stats.active_workers.fetch_sub(1, Ordering::SeqCst);

        let duration = start_time.elapsed();
        let success = outcome.is_success();
        self.stats.record(success, duration);

        if success {
            info!(
                worker_id = %self.id,
                job_id = %job.id,
                stage = %job.stage,
                duration_ms = duration.as_millis(),
                "Stage completed"
            );
        } else {
            warn!(
                worker_id = %self.id,
                job_id = %job.id,
                stage = %job.stage,
                "Stage failed"
            );
        }

        let result = JobResult::new(job.id, outcome, &self.id, duration.as_millis() as u64);
        if let Err(e) = self.queue.complete(result).await {
            error!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %e,
                "Failed to publish stage result"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::scheduler::queue::MemoryQueue;
    use serde_json::json;
    use uuid::Uuid;

    /// Echoes the context back, failing stages named "boom".
    struct EchoExecutor;

    #[async_trait]
    impl StageExecutor for EchoExecutor {
        async fn execute(&self, job: &StageJob) -> JobOutcome {
            if job.stage == "boom" {
                JobOutcome::Failed {
                    kind: ErrorKind::BuildStepFailed,
                    message: "exploded".to_string(),
                    context: None,
                }
            } else {
                JobOutcome::Completed {
                    context: job.context.clone(),
                }
            }
        }
    }

    fn pool(queue: Arc<MemoryQueue>, workers: usize) -> WorkerPool {
        WorkerPool::new(
            WorkerPoolConfig::new(workers)
                .with_poll_interval(Duration::from_millis(20))
                .with_shutdown_timeout(Duration::from_secs(5)),
            queue,
            Arc::new(EchoExecutor),
        )
    }

    #[test]
    fn test_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            average_job_duration: Duration::from_secs(30),
        };
        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < 0.001);
        assert_eq!(PoolStats::default().success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_pool_processes_jobs_and_records_stats() {
        let queue = Arc::new(MemoryQueue::new());
        let mut pool = pool(Arc::clone(&queue), 2);
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        let ok = StageJob::new(Uuid::new_v4(), "stage", json!({"n": 1}));
        let bad = StageJob::new(Uuid::new_v4(), "boom", json!({}));
        let (ok_id, bad_id) = (ok.id, bad.id);
        queue.enqueue(ok).await.unwrap();
        queue.enqueue(bad).await.unwrap();

        let timeout = Some(Duration::from_secs(5));
        let ok_result = queue.wait_result(ok_id, timeout).await.unwrap();
        let bad_result = queue.wait_result(bad_id, timeout).await.unwrap();

        assert_eq!(
            ok_result.outcome,
            JobOutcome::Completed { context: json!({"n": 1}) }
        );
        assert!(!bad_result.is_success());

        pool.shutdown().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_failed, 1);
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_when_not_running() {
        let mut pool = pool(Arc::new(MemoryQueue::new()), 1);
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }
}
