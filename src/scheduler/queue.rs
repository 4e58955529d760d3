//! Stage queues.
//!
//! The coordinator enqueues one [`StageJob`] at a time per run and waits for
//! its [`JobResult`] before enqueueing the next stage. Two transports
//! implement [`StageQueue`]:
//!
//! - [`MemoryQueue`]: in-process, for a coordinator and worker pool sharing a process
//! - [`RedisQueue`]: Redis lists, for workers in other processes or hosts
//!
//! # Redis Queue Structure
//!
//! - `{queue_name}`: Main queue where jobs are enqueued
//! - `{queue_name}:processing`: Jobs being processed (for crash recovery)
//! - `{queue_name}:results:{job_id}`: Single-entry list holding a job's result
//!
//! Jobs are atomically moved from the main queue to the processing queue when
//! dequeued (BRPOPLPUSH). Results are pushed onto their own list so the
//! coordinator can block on them with BLPOP.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::job::{JobResult, StageJob};

/// Seconds a job result is kept in Redis.
const RESULT_TTL_SECS: i64 = 604_800;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Transport between the coordinator and the workers.
#[async_trait]
pub trait StageQueue: Send + Sync {
    /// Adds a job to the queue.
    async fn enqueue(&self, job: StageJob) -> Result<(), QueueError>;

    /// Takes the next job, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` if no job arrived in time.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<StageJob>, QueueError>;

    /// Publishes the result of a dequeued job.
    async fn complete(&self, result: JobResult) -> Result<(), QueueError>;

    /// Waits for the result of `job_id`.
    ///
    /// With `timeout = None` this waits indefinitely.
    async fn wait_result(&self, job_id: Uuid, timeout: Option<Duration>) -> Result<JobResult, QueueError>;

    /// Number of jobs waiting to be processed.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Returns whether no jobs are waiting.
    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}

/// In-process stage queue.
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<StageJob>>,
    job_ready: Notify,
    results: Mutex<HashMap<Uuid, JobResult>>,
    result_ready: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

#[async_trait]
impl StageQueue for MemoryQueue {
    async fn enqueue(&self, job: StageJob) -> Result<(), QueueError> {
        self.jobs.lock().await.push_back(job);
        self.job_ready.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<StageJob>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.jobs.lock().await.pop_front() {
                return Ok(Some(job));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            if tokio::time::timeout(left, self.job_ready.notified()).await.is_err() {
                return Ok(self.jobs.lock().await.pop_front());
            }
        }
    }

    async fn complete(&self, result: JobResult) -> Result<(), QueueError> {
        self.results.lock().await.insert(result.job_id, result);
        self.result_ready.notify_waiters();
        Ok(())
    }

    async fn wait_result(&self, job_id: Uuid, timeout: Option<Duration>) -> Result<JobResult, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.result_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.results.lock().await.remove(&job_id) {
                return Ok(result);
            }

            match remaining(deadline) {
                Some(left) => {
                    if left.is_zero() || tokio::time::timeout(left, notified).await.is_err() {
                        return match self.results.lock().await.remove(&job_id) {
                            Some(result) => Ok(result),
                            None => Err(QueueError::Timeout(timeout.unwrap_or_default())),
                        };
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.jobs.lock().await.len())
    }
}

/// Redis-backed stage queue with reliable dequeue.
pub struct RedisQueue {
    client: redis::Client,
    /// Connection manager for non-blocking commands (handles reconnection automatically).
    redis: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    results_prefix: String,
}

impl RedisQueue {
    /// Connects to Redis and creates a new stage queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            results_prefix: format!("{}:results", queue_name),
        })
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn result_key(&self, job_id: Uuid) -> String {
        format!("{}:{}", self.results_prefix, job_id)
    }

    /// Dedicated connection for blocking commands, which would otherwise
    /// stall every other command multiplexed on the shared connection.
    async fn blocking_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
    }

    /// Number of jobs currently being processed.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.processing_queue).await?;
        Ok(len)
    }

    /// Moves jobs left in the processing queue by crashed workers back to the
    /// main queue.
    ///
    /// # Returns
    ///
    /// The number of jobs recovered.
    pub async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        let mut recovered = 0;
        for job_data in jobs {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .lrem(&self.processing_queue, 1, &job_data)
                .rpush(&self.queue_name, &job_data);
            pipe.query_async::<_, ()>(&mut conn).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Clears the main and processing queues.
    ///
    /// **Warning**: This permanently deletes all queued jobs.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(&self.queue_name).del(&self.processing_queue);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn remove_job_from_processing(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<StageJob>(&job_data) {
                if job.id == job_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &job_data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Already removed, e.g. by recovery
        Ok(())
    }
}

#[async_trait]
impl StageQueue for RedisQueue {
    /// Jobs are added to the left of the queue (LPUSH) so they can be
    /// dequeued from the right in FIFO order.
    async fn enqueue(&self, job: StageJob) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<StageJob>, QueueError> {
        let mut conn = self.blocking_connection().await?;
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, result: JobResult) -> Result<(), QueueError> {
        let key = self.result_key(result.job_id);
        let data = serde_json::to_string(&result)?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&key, &data)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(RESULT_TTL_SECS);
        pipe.query_async::<_, ()>(&mut conn).await?;

        self.remove_job_from_processing(result.job_id).await
    }

    async fn wait_result(&self, job_id: Uuid, timeout: Option<Duration>) -> Result<JobResult, QueueError> {
        let key = self.result_key(job_id);
        let mut conn = self.blocking_connection().await?;
        // BLPOP with 0 blocks indefinitely
        let timeout_secs = timeout.map(|t| t.as_secs().max(1)).unwrap_or(0) as usize;

        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match popped {
            Some((_, data)) => Ok(serde_json::from_str(&data)?),
            None => Err(QueueError::Timeout(timeout.unwrap_or_default())),
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobOutcome;
    use serde_json::json;
    use std::sync::Arc;

    fn job(stage: &str) -> StageJob {
        StageJob::new(Uuid::new_v4(), stage, json!({"stage": stage}))
    }

    fn completed(job_id: Uuid) -> JobResult {
        JobResult::new(job_id, JobOutcome::Completed { context: json!({}) }, "worker-0", 5)
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = QueueError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }

    #[tokio::test]
    async fn test_memory_queue_fifo() {
        let queue = MemoryQueue::new();
        queue.enqueue(job("stage")).await.unwrap();
        queue.enqueue(job("create-manifest")).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.stage, "stage");
        assert_eq!(second.stage, "create-manifest");
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_queue_dequeue_times_out() {
        let queue = MemoryQueue::new();
        let got = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_memory_queue_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(job("publish")).await.unwrap();

        let got = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(got.stage, "publish");
    }

    #[tokio::test]
    async fn test_memory_queue_result_delivery() {
        let queue = Arc::new(MemoryQueue::new());
        let job_id = Uuid::new_v4();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_result(job_id, Some(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.complete(completed(Uuid::new_v4())).await.unwrap();
        queue.complete(completed(job_id)).await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.job_id, job_id);
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_memory_queue_result_before_wait() {
        let queue = MemoryQueue::new();
        let job_id = Uuid::new_v4();
        queue.complete(completed(job_id)).await.unwrap();
        let result = queue.wait_result(job_id, None).await.unwrap();
        assert_eq!(result.job_id, job_id);
    }

    #[tokio::test]
    async fn test_memory_queue_result_timeout() {
        let queue = MemoryQueue::new();
        let err = queue
            .wait_result(Uuid::new_v4(), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Timeout(_)));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_queue_roundtrip() {
        let queue = RedisQueue::connect("redis://127.0.0.1:6379", "envforge:test")
            .await
            .unwrap();
        queue.clear().await.unwrap();

        let job = job("stage");
        let job_id = job.id;
        queue.enqueue(job).await.unwrap();
        let got = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(got.id, job_id);
        assert_eq!(queue.processing_len().await.unwrap(), 1);

        queue.complete(completed(job_id)).await.unwrap();
        assert_eq!(queue.processing_len().await.unwrap(), 0);
        let result = queue
            .wait_result(job_id, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(result.job_id, job_id);
    }
}
