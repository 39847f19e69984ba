//! Process-pool task scheduler.
//!
//! This crate provides:
//! - A bounded pool of OS worker processes with FIFO overflow queueing
//! - Per-task timeouts enforced by terminating and replacing the worker
//! - Automatic respawn of crashed workers
//! - Correlated request/reply messaging between a running task and the pool
//! - The worker runtime that `bale-worker` processes run
//!
//! # Architecture
//!
//! ```text
//! caller ──► Pool::add_task ──► coordinator (one tokio task)
//!                                   │
//!                                   └── DispatchQueue
//!                                         ├── idle worker?  ──► task envelope ──► bale-worker
//!                                         └── none idle     ──► pending FIFO
//!
//! bale-worker ──► done envelope ──► coordinator ──► TaskHandle resolves
//!             ──► message       ──► on_message handler ──► reply envelope
//! ```

pub mod config;
mod dispatch;
pub mod error;
pub mod ipc;
pub mod pool;
pub mod runtime;
pub mod task;

pub use config::{PoolConfig, WorkerCommand};
pub use error::{Error, Result};
pub use pool::{MessageHandler, Pool, PoolBuilder, PoolStats, Replier};
pub use runtime::{HandlerResult, ReplyHandle, TaskContext, WorkerRuntime};
pub use task::{CompletionCallback, Task, TaskHandle, TaskOutcome, Work};
