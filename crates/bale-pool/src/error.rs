//! Error types for bale-pool.

use thiserror::Error;

/// Result type for bale-pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pool, its workers, or the IPC channel between them.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error (process spawn, pipes).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The worker binary could not be located.
    #[error("worker binary not found: {0}")]
    WorkerNotFound(String),

    /// A worker process could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The task ran longer than its timeout and its worker was terminated.
    #[error("task timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The worker running the task exited before reporting completion.
    #[error("worker exited unexpectedly ({status})")]
    WorkerExited { status: String },

    /// The worker reported that the task failed.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// The task description is not something a worker can run.
    #[error("malformed task: {0}")]
    MalformedTask(String),

    /// The task was running when the pool was killed.
    #[error("task killed by pool shutdown")]
    Killed,

    /// The pool has shut down and no longer accepts or runs tasks.
    #[error("pool has shut down")]
    PoolShutDown,

    /// The coordinator went away before the task settled.
    #[error("task abandoned by coordinator")]
    Abandoned,

    /// The reply resolver for a worker message was discarded before a reply arrived.
    #[error("reply channel dropped before a reply arrived")]
    ReplyDropped,

    /// Failed to load a task module.
    #[error("failed to load module: {0}")]
    ModuleLoad(#[from] libloading::Error),
}
