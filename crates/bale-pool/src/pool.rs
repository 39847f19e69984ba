//! The public process-pool scheduler.
//!
//! A [`Pool`] is a cheap, clonable handle to a coordinator task that owns the
//! workers. Submissions return immediately with a [`TaskHandle`]; the caller
//! awaits it whenever it likes.
//!
//! # Example
//!
//! ```no_run
//! use bale_pool::{Pool, Task};
//! use serde_json::json;
//!
//! # async fn demo() -> bale_pool::Result<()> {
//! let pool = Pool::builder().size(4).build()?;
//! let value = pool.add_task(Task::handler("echo", json!({"n": 1}))).await?;
//! assert_eq!(value, json!({"n": 1}));
//! pool.kill_all();
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{TryJoinAll, try_join_all};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::PoolConfig;
use crate::dispatch::{DispatchQueue, PoolEvent, run_guarded};
use crate::error::{Error, Result};
use crate::ipc::Envelope;
use crate::task::{Completion, Task, TaskHandle};

/// Handler for messages sent by workers mid-task.
pub type MessageHandler = Arc<dyn Fn(Value, Replier) + Send + Sync>;

type AllDoneFn = Box<dyn FnOnce() + Send>;

/// Answers one worker message.
///
/// Consumed by [`Replier::reply`], so each message gets at most one reply.
pub struct Replier {
    outbox: mpsc::UnboundedSender<Envelope>,
    correlation_id: Option<String>,
}

impl Replier {
    pub(crate) fn new(
        outbox: mpsc::UnboundedSender<Envelope>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            outbox,
            correlation_id,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Send `data` back to the worker that asked.
    pub fn reply(self, data: Value) {
        if self
            .outbox
            .send(Envelope::reply(data, self.correlation_id))
            .is_err()
        {
            tracing::debug!("Dropping reply: worker is gone");
        }
    }
}

/// Snapshot of the pool's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured number of workers.
    pub size: usize,
    /// Workers currently registered.
    pub live: usize,
    /// Workers waiting for a task.
    pub idle: usize,
    /// Workers running a task.
    pub busy: usize,
    /// Tasks waiting for an idle worker.
    pub pending: usize,
    /// Tasks accepted since the pool started.
    pub submitted: usize,
    /// Accepted tasks that have settled, successfully or not.
    pub settled: usize,
    /// Worker processes started since the pool was built, replacements included.
    pub spawned: usize,
    /// Process ids of the live workers, ascending.
    pub worker_pids: Vec<u32>,
    /// Whether the pool has shut down.
    pub shut_down: bool,
}

/// Builder for [`Pool`].
#[derive(Default)]
pub struct PoolBuilder {
    config: PoolConfig,
    on_all_done: Option<AllDoneFn>,
}

impl PoolBuilder {
    pub fn from_config(config: PoolConfig) -> Self {
        Self {
            config,
            on_all_done: None,
        }
    }

    /// Number of workers; 0 means one per core.
    pub fn size(mut self, size: usize) -> Self {
        self.config.size = size;
        self
    }

    /// Shut down once every submitted task has settled.
    pub fn shutdown_on_completion(mut self, enabled: bool) -> Self {
        self.config.shutdown_on_completion = enabled;
        self
    }

    /// Worker executable to spawn instead of the located `bale-worker`.
    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.worker.program = Some(program.into());
        self
    }

    pub fn worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.worker.args.push(arg.into());
        self
    }

    pub fn worker_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.worker.envs.push((key.into(), value.into()));
        self
    }

    /// Run `callback` once when the pool shuts down.
    pub fn on_all_done(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_all_done = Some(Box::new(callback));
        self
    }

    /// Spawn the workers and start the coordinator.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Pool> {
        let Self {
            config,
            on_all_done,
        } = self;

        let size = config.effective_size();
        let program = config.worker.resolve_program()?;
        let (events, rx) = mpsc::unbounded_channel();
        let mut queue = DispatchQueue::new(program, config.worker.clone(), events.clone());

        tracing::info!("Starting thread pool with {} workers", size);
        for _ in 0..size {
            if let Err(e) = queue.create_worker() {
                queue.kill_all();
                return Err(e);
            }
        }
        tracing::info!("{} processes alive", queue.live());

        let manager = PoolManager {
            queue,
            size,
            shutdown_on_completion: config.shutdown_on_completion,
            submitted: 0,
            settled: 0,
            shut_down: false,
            on_all_done,
            started_at: Instant::now(),
        };
        tokio::spawn(manager.run(rx));

        Ok(Pool {
            inner: Arc::new(PoolInner {
                events,
                size,
                shutdown_on_completion: config.shutdown_on_completion,
            }),
        })
    }
}

/// Handle to a pool of worker processes.
///
/// Clones share the same pool. Dropping the last clone kills every worker.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    events: mpsc::UnboundedSender<PoolEvent>,
    size: usize,
    shutdown_on_completion: bool,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let _ = self.events.send(PoolEvent::Close);
    }
}

impl Pool {
    /// Start a pool from `config`. See [`PoolBuilder::build`].
    pub fn new(config: PoolConfig) -> Result<Self> {
        PoolBuilder::from_config(config).build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Submit a task.
    ///
    /// It runs on an idle worker right away or waits in FIFO order for one.
    /// A task whose description is malformed is rejected immediately.
    pub fn add_task(&self, task: Task) -> TaskHandle {
        let (completion, handle) = Completion::new();
        if let Err(e) = task.work().validate() {
            tracing::error!("Rejecting task {}: {}", task.work().label(), e);
            completion.settle(Err(e));
            return handle;
        }
        // If the coordinator is gone the completion is dropped and the handle reports Abandoned.
        let _ = self.inner.events.send(PoolEvent::Submit { task, completion });
        handle
    }

    /// Submit several tasks; the returned future waits for all of them.
    ///
    /// Every task is submitted before this returns. The future fails with the
    /// first error if any task fails.
    pub fn add_tasks<I>(&self, tasks: I) -> TryJoinAll<TaskHandle>
    where
        I: IntoIterator<Item = Task>,
    {
        try_join_all(tasks.into_iter().map(|task| self.add_task(task)))
    }

    /// Install the handler invoked for every worker message, replacing any previous one.
    ///
    /// The handler runs on the coordinator and must not block.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Value, Replier) + Send + Sync + 'static,
    {
        let _ = self
            .inner
            .events
            .send(PoolEvent::SetMessageHandler(Arc::new(handler)));
    }

    /// Terminate every worker and stop accepting tasks.
    ///
    /// Running tasks fail with [`Error::Killed`], queued ones with
    /// [`Error::PoolShutDown`]. Calling it again does nothing.
    pub fn kill_all(&self) {
        let _ = self.inner.events.send(PoolEvent::KillAll);
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .events
            .send(PoolEvent::Stats(tx))
            .map_err(|_| Error::PoolShutDown)?;
        rx.await.map_err(|_| Error::PoolShutDown)
    }

    /// Number of tasks accepted so far.
    pub async fn total_submitted(&self) -> Result<usize> {
        self.stats().await.map(|stats| stats.submitted)
    }

    pub fn shutdown_on_completion(&self) -> bool {
        self.inner.shutdown_on_completion
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }
}

/// The coordinator: sole owner of the dispatch queue and the pool counters.
struct PoolManager {
    queue: DispatchQueue,
    size: usize,
    shutdown_on_completion: bool,
    submitted: usize,
    settled: usize,
    shut_down: bool,
    on_all_done: Option<AllDoneFn>,
    started_at: Instant,
}

impl PoolManager {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
        while let Some(event) = events.recv().await {
            let close = matches!(event, PoolEvent::Close);
            self.handle(event);

            let settled = self.queue.take_settled();
            if settled > 0 {
                self.record_settled(settled);
            }
            if close {
                break;
            }
        }
        tracing::debug!("Pool coordinator stopped");
    }

    fn handle(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Submit { task, completion } => self.add_task(task, completion),
            PoolEvent::Envelope { worker, envelope } => {
                self.queue.handle_envelope(worker, envelope)
            }
            PoolEvent::Exited { worker, status } => {
                self.queue.handle_exit(worker, &status, !self.shut_down)
            }
            PoolEvent::TimedOut { worker, dispatch } => self.queue.handle_timeout(worker, dispatch),
            PoolEvent::Respawn => self.queue.handle_respawn(!self.shut_down),
            PoolEvent::SetMessageHandler(handler) => self.queue.set_message_handler(handler),
            PoolEvent::KillAll | PoolEvent::Close => self.kill_all(),
            PoolEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn add_task(&mut self, task: Task, completion: Completion) {
        if self.shut_down {
            completion.settle(Err(Error::PoolShutDown));
            return;
        }
        self.submitted += 1;
        self.queue.submit(task, completion);
    }

    fn record_settled(&mut self, count: usize) {
        self.settled += count;
        if self.shutdown_on_completion && !self.shut_down && self.settled >= self.submitted {
            tracing::info!("All {} tasks settled", self.submitted);
            self.kill_all();
        }
    }

    fn kill_all(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let killed = self.queue.kill_all();
        tracing::info!(
            "Shutdown thread pool after {} ms ({} workers terminated)",
            self.started_at.elapsed().as_millis(),
            killed
        );

        if let Some(on_all_done) = self.on_all_done.take() {
            run_guarded("shutdown callback", on_all_done);
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            live: self.queue.live(),
            idle: self.queue.idle(),
            busy: self.queue.busy(),
            pending: self.queue.pending(),
            submitted: self.submitted,
            settled: self.settled,
            spawned: self.queue.spawned(),
            worker_pids: self.queue.worker_pids(),
            shut_down: self.shut_down,
        }
    }
}
