//! # Task Queue & Worker Pool
//!
//! Bounded, cooperative background processing of spatialization jobs.
//!
//! ## Key Components:
//! - **Task**: One job and its `queued → processing → completed | failed`
//!   state machine
//! - **WorkerPool**: Queue, dispatcher, concurrency slots and the task table

pub mod pool;
pub mod task;

pub use pool::{PoolSettings, QueueStats, WorkerPool};
pub use task::{Task, TaskRequest, TaskResult, TaskStatus};
