//! Worker runtime: the program each pool worker process runs.
//!
//! A runtime reads envelopes from its channel (stdin by default), executes one
//! task at a time, and answers every task with exactly one `done` envelope on
//! its output (stdout by default).
//!
//! # Architecture
//!
//! ```text
//! stdin ──► reader thread ──┬── task  ──► executor loop ──► handler / module
//!                           │                  │
//!                           └── reply ──► resolvers ◄── TaskContext::send
//!                                              │
//! stdout ◄──────────── message / done ◄────────┘
//! ```
//!
//! Handlers run on the caller's thread while the reader thread keeps routing
//! replies, so a handler can block on [`ReplyHandle::wait`] mid-task.

mod ffi;

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::ipc::{CorrelationIds, Envelope, EnvelopeKind, read_message, write_message};
use crate::task::{TaskOutcome, Work};

pub use ffi::{ModuleCache, ModuleEntryFn, ModuleStatus};

/// Value returned by a task handler; the error string becomes the task's failure message.
pub type HandlerResult = std::result::Result<Value, String>;

type Handler = Arc<dyn Fn(&TaskContext, Value) -> HandlerResult + Send + Sync>;
type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;
type Resolvers = Arc<Mutex<ReplyTable>>;

/// Resolvers for outstanding worker messages, keyed by correlation id.
#[derive(Default)]
struct ReplyTable {
    pending: HashMap<String, oneshot::Sender<Value>>,
    /// The channel is gone; no reply can arrive any more.
    closed: bool,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker-side task executor with a registry of named handlers.
#[derive(Default)]
pub struct WorkerRuntime {
    handlers: HashMap<String, Handler>,
    modules: ModuleCache,
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for inline tasks named `name`.
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&TaskContext, Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Names of all registered handlers.
    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Serve tasks over stdin/stdout until stdin closes.
    pub fn run(self) -> Result<()> {
        self.run_with(std::io::stdin(), std::io::stdout())
    }

    /// Serve tasks over an arbitrary channel until `reader` reaches EOF.
    ///
    /// Returns [`Error::MalformedTask`] if a task envelope carries no
    /// recognizable work; the worker is expected to exit in that case.
    pub fn run_with<R, W>(mut self, reader: R, writer: W) -> Result<()>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let resolvers: Resolvers = Arc::default();
        let (task_tx, mut task_rx) = mpsc::unbounded_channel();

        let reader_resolvers = Arc::clone(&resolvers);
        std::thread::Builder::new()
            .name("bale-worker-reader".to_string())
            .spawn(move || read_loop(reader, task_tx, reader_resolvers))?;

        let context = TaskContext {
            writer: Arc::clone(&writer),
            resolvers,
            ids: Mutex::new(CorrelationIds::new()),
        };

        while let Some(payload) = task_rx.blocking_recv() {
            let work = match Work::from_value(payload) {
                Ok(work) => work,
                Err(e) => {
                    tracing::error!("Task carried no recognizable work: {}", e);
                    return Err(e);
                }
            };

            tracing::debug!("Executing task {}", work.label());
            let outcome = self.execute(&context, work);
            context.clear_pending();

            let envelope = Envelope::done(serde_json::to_value(&outcome)?);
            write_message(&mut *lock(&writer), &envelope)?;
        }

        Ok(())
    }

    fn execute(&mut self, context: &TaskContext, work: Work) -> TaskOutcome {
        if let Err(e) = work.validate() {
            return TaskOutcome::Error {
                message: e.to_string(),
            };
        }

        let result = match work {
            Work::Handler { name, args } => match self.handlers.get(&name) {
                Some(handler) => {
                    panic::catch_unwind(AssertUnwindSafe(|| handler(context, args)))
                        .unwrap_or_else(|payload| {
                            Err(format!(
                                "handler '{}' panicked: {}",
                                name,
                                panic_message(payload.as_ref())
                            ))
                        })
                }
                None => Err(format!("no handler registered under '{}'", name)),
            },
            Work::Module { path, symbol, args } => self
                .modules
                .invoke(&path, &symbol, &args)
                .map_err(|e| match e {
                    Error::TaskFailed(message) => message,
                    other => other.to_string(),
                }),
        };

        match result {
            Ok(value) => TaskOutcome::Ok { value },
            Err(message) => TaskOutcome::Error { message },
        }
    }
}

fn read_loop<R: Read>(reader: R, tasks: mpsc::UnboundedSender<Value>, resolvers: Resolvers) {
    let mut reader = BufReader::new(reader);
    loop {
        match read_message(&mut reader) {
            Ok(Some(envelope)) => match envelope.kind {
                EnvelopeKind::Task => {
                    if tasks.send(envelope.payload).is_err() {
                        break;
                    }
                }
                EnvelopeKind::Reply => {
                    let resolver = envelope
                        .correlation_id
                        .as_ref()
                        .and_then(|id| lock(&resolvers).pending.remove(id));
                    if let Some(resolver) = resolver {
                        let _ = resolver.send(envelope.payload);
                    }
                }
                other => tracing::debug!("Ignoring {:?} envelope", other),
            },
            Ok(None) => break,
            Err(Error::Json(e)) => tracing::warn!("Ignoring undecodable envelope: {}", e),
            Err(e) => {
                tracing::error!("Worker channel failed: {}", e);
                break;
            }
        }
    }

    // Release handlers blocked on a reply that can no longer arrive.
    let mut table = lock(&resolvers);
    table.closed = true;
    table.pending.clear();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle given to task handlers for talking to the coordinator mid-task.
pub struct TaskContext {
    writer: SharedWriter,
    resolvers: Resolvers,
    ids: Mutex<CorrelationIds>,
}

impl TaskContext {
    /// Send `data` to the coordinator's message handler.
    ///
    /// The returned handle resolves with the coordinator's reply. Handles still
    /// outstanding when the current task finishes, or when the channel to the
    /// coordinator closes, resolve to [`Error::ReplyDropped`].
    pub fn send(&self, data: Value) -> Result<ReplyHandle> {
        let correlation_id = lock(&self.ids).next_id();
        let (tx, rx) = oneshot::channel();
        {
            // Register before writing so a fast reply cannot be missed.
            let mut table = lock(&self.resolvers);
            if table.closed {
                return Err(Error::ReplyDropped);
            }
            table.pending.insert(correlation_id.clone(), tx);
        }

        let envelope = Envelope::message(data, correlation_id.clone());
        if let Err(e) = write_message(&mut *lock(&self.writer), &envelope) {
            lock(&self.resolvers).pending.remove(&correlation_id);
            return Err(e);
        }

        Ok(ReplyHandle { correlation_id, rx })
    }

    fn clear_pending(&self) {
        lock(&self.resolvers).pending.clear();
    }
}

/// Pending reply to a message sent with [`TaskContext::send`].
#[derive(Debug)]
pub struct ReplyHandle {
    correlation_id: String,
    rx: oneshot::Receiver<Value>,
}

impl ReplyHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Block until the reply arrives.
    pub fn wait(self) -> Result<Value> {
        self.rx.blocking_recv().map_err(|_| Error::ReplyDropped)
    }
}
