//! Distributed stage scheduling.
//!
//! The coordinator enqueues one [`StageJob`] per pipeline stage and blocks on
//! its result; workers, possibly on other hosts, pull jobs from the same
//! queue and run them.
//!
//! - **StageQueue**: queue abstraction with an in-memory and a Redis backend
//! - **WorkerPool**: pool of workers that process stage jobs concurrently
//! - **StageJob / JobResult**: the wire types exchanged through the queue
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Coordinator  │
//!                      └──┬───────▲───┘
//!                  enqueue│       │wait_result
//!                      ┌──▼───────┴───┐
//!                      │    Queue     │
//!                      └──────┬───────┘
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! The job payload is opaque JSON; the scheduler knows nothing about
//! environments.

pub mod job;
pub mod queue;
pub mod worker_pool;

pub use job::{JobOutcome, JobResult, StageJob};
pub use queue::{MemoryQueue, QueueError, RedisQueue, StageQueue};
pub use worker_pool::{PoolError, PoolStats, StageExecutor, WorkerPool, WorkerPoolConfig};
