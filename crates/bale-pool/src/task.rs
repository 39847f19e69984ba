//! Tasks submitted to the pool and the handles that track their completion.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Callback run on the coordinator when a task completes successfully.
pub type CompletionCallback = Box<dyn FnOnce(&Value) + Send + 'static>;

/// Description of the work a worker should perform.
///
/// Serialized as the payload of a `task` envelope. The `type` tag tells the
/// worker whether the work is inline (a handler compiled into the worker) or
/// a module reference (a dynamic library loaded at runtime).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Work {
    /// Run a handler registered in the worker under `name`.
    Handler {
        name: String,
        #[serde(default)]
        args: Value,
    },
    /// Load the dynamic library at `path` and call its exported `symbol`.
    Module {
        path: PathBuf,
        symbol: String,
        #[serde(default)]
        args: Value,
    },
}

impl Work {
    /// Whether this is inline work rather than a module reference.
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Handler { .. })
    }

    /// Parse a work description from JSON.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::MalformedTask(e.to_string()))
    }

    /// Check that a worker could act on this description.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Handler { name, .. } if name.trim().is_empty() => Err(Error::MalformedTask(
                "handler name must not be empty".to_string(),
            )),
            Self::Module { path, .. } if path.as_os_str().is_empty() => Err(
                Error::MalformedTask("module path must not be empty".to_string()),
            ),
            Self::Module { symbol, .. } if symbol.trim().is_empty() => Err(Error::MalformedTask(
                "module symbol must not be empty".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Short human-readable label for logs.
    pub fn label(&self) -> String {
        match self {
            Self::Handler { name, .. } => name.clone(),
            Self::Module { path, symbol, .. } => format!("{}#{}", path.display(), symbol),
        }
    }
}

/// Result reported by a worker in its `done` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Ok {
        #[serde(default)]
        value: Value,
    },
    Error {
        message: String,
    },
}

impl TaskOutcome {
    /// Decode a `done` payload.
    ///
    /// Payloads that are not a tagged outcome are treated as a bare success value.
    pub fn from_payload(payload: Value) -> Self {
        match serde_json::from_value::<TaskOutcome>(payload.clone()) {
            Ok(outcome) => outcome,
            Err(_) => Self::Ok { value: payload },
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Error { message } => Err(Error::TaskFailed(message)),
        }
    }
}

/// A unit of work submitted to the pool.
pub struct Task {
    pub(crate) work: Work,
    pub(crate) timeout: Option<Duration>,
    pub(crate) on_complete: Option<CompletionCallback>,
}

impl Task {
    /// Task running the worker handler `name` with `args`.
    pub fn handler(name: impl Into<String>, args: Value) -> Self {
        Self::new(Work::Handler {
            name: name.into(),
            args,
        })
    }

    /// Task calling `symbol` in the dynamic library at `path` with `args`.
    pub fn module(path: impl Into<PathBuf>, symbol: impl Into<String>, args: Value) -> Self {
        Self::new(Work::Module {
            path: path.into(),
            symbol: symbol.into(),
            args,
        })
    }

    pub fn new(work: Work) -> Self {
        Self {
            work,
            timeout: None,
            on_complete: None,
        }
    }

    /// Terminate the worker if the task has not completed within `timeout`.
    ///
    /// A zero duration means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Run `callback` with the task's value once it completes successfully.
    pub fn on_complete(mut self, callback: impl FnOnce(&Value) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn work(&self) -> &Work {
        &self.work
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("work", &self.work)
            .field("timeout", &self.timeout)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Sending half of a task's completion handle.
///
/// Settling consumes it, so a handle can never be resolved twice.
pub(crate) struct Completion {
    tx: oneshot::Sender<Result<Value>>,
}

impl Completion {
    pub(crate) fn new() -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, TaskHandle { rx })
    }

    pub(crate) fn settle(self, result: Result<Value>) {
        // The caller may have dropped its handle; nothing to deliver then.
        let _ = self.tx.send(result);
    }
}

/// Completion handle for a submitted task.
///
/// Resolves exactly once with the task's value or the reason it failed.
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for TaskHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Abandoned)))
    }
}
