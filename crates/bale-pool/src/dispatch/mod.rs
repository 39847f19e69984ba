//! Coordinator-side dispatch of tasks onto worker processes.
//!
//! [`DispatchQueue`] owns the live-worker registry, the idle set and the
//! pending FIFO. It is driven exclusively by the pool's event loop, one
//! [`PoolEvent`] at a time, so none of its state needs locking.
//!
//! # Worker lifecycle
//!
//! ```text
//! spawn ──► idle ──► busy ──(done)──► idle ...
//!                     │
//!                     ├─(crash)────► exited ──► replacement spawned
//!                     └─(timeout)──► killed ──► exited ──► replacement spawned
//! ```
//!
//! A worker removed from the registry by `kill_all` is forgotten: its later
//! exit event finds no state and spawns nothing.
//!
//! Workers that die shortly after spawning, and spawns that fail outright,
//! push the queue into a crash loop: replacements are then started after an
//! exponential backoff instead of immediately.

mod process;

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::WorkerCommand;
use crate::error::{Error, Result};
use crate::ipc::{Envelope, EnvelopeKind};
use crate::pool::{MessageHandler, PoolStats, Replier};
use crate::task::{Completion, CompletionCallback, Task, TaskOutcome};

use process::WorkerProcess;

/// A worker exiting on its own sooner than this after spawn counts towards a crash loop.
const MIN_HEALTHY_UPTIME: Duration = Duration::from_millis(500);

const RESPAWN_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RESPAWN_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Identity of a worker process within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WorkerId(u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker_{}", self.0)
    }
}

/// Everything the pool's event loop reacts to.
pub(crate) enum PoolEvent {
    /// A caller submitted a task.
    Submit { task: Task, completion: Completion },
    /// A worker sent an envelope.
    Envelope { worker: WorkerId, envelope: Envelope },
    /// A worker process exited and has been reaped.
    Exited { worker: WorkerId, status: String },
    /// The timeout of dispatch number `dispatch` on `worker` expired.
    TimedOut { worker: WorkerId, dispatch: u64 },
    /// A delayed replacement worker is due.
    Respawn,
    /// Install the handler for worker messages.
    SetMessageHandler(MessageHandler),
    /// Terminate every worker and stop accepting tasks.
    KillAll,
    /// Report pool statistics.
    Stats(oneshot::Sender<PoolStats>),
    /// The last pool handle was dropped.
    Close,
}

/// A task currently executing on a worker.
struct InFlight {
    dispatch: u64,
    label: String,
    timeout: Option<Duration>,
    timer: Option<JoinHandle<()>>,
    timed_out: bool,
    on_complete: Option<CompletionCallback>,
    completion: Completion,
}

impl InFlight {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.map(|t| t.as_millis() as u64).unwrap_or_default()
    }
}

/// Coordinator-side state of one live worker.
struct WorkerState {
    process: WorkerProcess,
    spawned_at: Instant,
    in_flight: Option<InFlight>,
    /// Set once the coordinator has asked the process to die.
    terminating: bool,
}

struct PendingEntry {
    task: Task,
    completion: Completion,
}

/// Owner of the live workers, the idle set and the pending FIFO.
pub(crate) struct DispatchQueue {
    program: PathBuf,
    command: WorkerCommand,
    events: mpsc::UnboundedSender<PoolEvent>,
    workers: FxHashMap<WorkerId, WorkerState>,
    idle: Vec<WorkerId>,
    pending: VecDeque<PendingEntry>,
    message_handler: Option<MessageHandler>,
    next_worker: u64,
    next_dispatch: u64,
    /// Tasks settled since the coordinator last collected the count.
    settled: usize,
    /// Worker processes started so far.
    spawned: usize,
    /// Consecutive early exits or failed spawns.
    crash_streak: u32,
    /// The last attempt to start a worker failed.
    spawn_failing: bool,
}

impl DispatchQueue {
    pub(crate) fn new(
        program: PathBuf,
        command: WorkerCommand,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Self {
        Self {
            program,
            command,
            events,
            workers: FxHashMap::default(),
            idle: Vec::new(),
            pending: VecDeque::new(),
            message_handler: None,
            next_worker: 0,
            next_dispatch: 0,
            settled: 0,
            spawned: 0,
            crash_streak: 0,
            spawn_failing: false,
        }
    }

    /// Spawn a worker, register it as idle and hand it a pending task if one is waiting.
    pub(crate) fn create_worker(&mut self) -> Result<WorkerId> {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;

        let process = WorkerProcess::spawn(id, &self.program, &self.command, &self.events)?;
        tracing::debug!("Spawned {} (pid {:?})", id, process.pid());
        self.spawned += 1;

        self.workers.insert(
            id,
            WorkerState {
                process,
                spawned_at: Instant::now(),
                in_flight: None,
                terminating: false,
            },
        );
        self.idle.push(id);
        self.drain_pending();
        Ok(id)
    }

    /// Dispatch `task` to an idle worker, or queue it until one frees up.
    ///
    /// With no live worker and spawning failing, the task is rejected instead
    /// of queued.
    pub(crate) fn submit(&mut self, task: Task, completion: Completion) {
        if self.workers.is_empty() && self.spawn_failing {
            self.settle(
                completion,
                Err(Error::Spawn("no worker process could be started".to_string())),
            );
            return;
        }
        match self.idle.pop() {
            Some(worker) => self.dispatch(worker, task, completion),
            None => self.pending.push_back(PendingEntry { task, completion }),
        }
    }

    pub(crate) fn set_message_handler(&mut self, handler: MessageHandler) {
        self.message_handler = Some(handler);
    }

    /// Handle an envelope from `worker`.
    pub(crate) fn handle_envelope(&mut self, worker: WorkerId, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Done => self.on_done(worker, envelope),
            EnvelopeKind::Message => self.on_message(worker, envelope),
            other => tracing::debug!("Ignoring {:?} envelope from {}", other, worker),
        }
    }

    /// Handle the exit of `worker`, rejecting its in-flight task.
    ///
    /// A replacement is started when `respawn` is set, keeping the pool at
    /// size; during a crash loop it is started after a backoff.
    pub(crate) fn handle_exit(&mut self, worker: WorkerId, status: &str, respawn: bool) {
        let Some(mut state) = self.workers.remove(&worker) else {
            return;
        };
        self.idle.retain(|id| *id != worker);
        let unexpected = !state.terminating;

        match state.in_flight.take() {
            Some(mut flight) => {
                flight.cancel_timer();
                let error = if flight.timed_out {
                    Error::Timeout {
                        timeout_ms: flight.timeout_ms(),
                    }
                } else {
                    tracing::warn!(
                        "{} exited while running task {}: {}",
                        worker,
                        flight.label,
                        status
                    );
                    Error::WorkerExited {
                        status: status.to_string(),
                    }
                };
                self.settle(flight.completion, Err(error));
            }
            None if unexpected => {
                tracing::warn!("Idle {} exited unexpectedly: {}", worker, status)
            }
            None => {}
        }

        if !respawn {
            return;
        }
        if unexpected {
            let uptime = state.spawned_at.elapsed();
            if uptime < MIN_HEALTHY_UPTIME {
                self.crash_streak = self.crash_streak.saturating_add(1);
            } else {
                self.crash_streak = 0;
            }
        }

        if self.crash_streak == 0 {
            self.respawn();
        } else {
            let delay = self.backoff();
            tracing::warn!(
                "Workers are crash looping ({} in a row), replacing {} in {} ms",
                self.crash_streak,
                worker,
                delay.as_millis()
            );
            self.schedule_respawn(delay);
        }
    }

    /// Start a delayed replacement worker, unless the pool stopped in the meantime.
    pub(crate) fn handle_respawn(&mut self, enabled: bool) {
        if enabled {
            self.respawn();
        }
    }

    /// Terminate `worker` if dispatch number `dispatch` is still running on it.
    pub(crate) fn handle_timeout(&mut self, worker: WorkerId, dispatch: u64) {
        let Some(state) = self.workers.get_mut(&worker) else {
            return;
        };
        let Some(flight) = state.in_flight.as_mut() else {
            return;
        };
        if flight.dispatch != dispatch {
            return;
        }

        tracing::warn!(
            "Task {} on {} timed out after {} ms, terminating worker",
            flight.label,
            worker,
            flight.timeout_ms()
        );
        flight.timed_out = true;
        state.terminating = true;
        state.process.kill();
    }

    /// Terminate every worker, rejecting in-flight and pending tasks.
    ///
    /// Returns the number of workers terminated.
    pub(crate) fn kill_all(&mut self) -> usize {
        let count = self.workers.len();
        for (_, mut state) in self.workers.drain() {
            if let Some(mut flight) = state.in_flight.take() {
                flight.cancel_timer();
                self.settled += 1;
                flight.completion.settle(Err(Error::Killed));
            }
            state.terminating = true;
            state.process.kill();
        }
        self.idle.clear();
        for entry in self.pending.drain(..) {
            self.settled += 1;
            entry.completion.settle(Err(Error::PoolShutDown));
        }
        count
    }

    /// Number of tasks settled since the last call.
    pub(crate) fn take_settled(&mut self) -> usize {
        std::mem::take(&mut self.settled)
    }

    pub(crate) fn spawned(&self) -> usize {
        self.spawned
    }

    pub(crate) fn live(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn idle(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn busy(&self) -> usize {
        self.workers
            .values()
            .filter(|state| state.in_flight.is_some())
            .count()
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn worker_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .workers
            .values()
            .filter_map(|state| state.process.pid())
            .collect();
        pids.sort_unstable();
        pids
    }

    fn respawn(&mut self) {
        match self.create_worker() {
            Ok(replacement) => {
                self.spawn_failing = false;
                tracing::info!("Started replacement {}", replacement);
            }
            Err(e) => {
                tracing::error!("Failed to start a replacement worker: {}", e);
                self.spawn_failing = true;
                self.crash_streak = self.crash_streak.saturating_add(1);
                if self.workers.is_empty() {
                    self.fail_pending(&e.to_string());
                }
                self.schedule_respawn(self.backoff());
            }
        }
    }

    fn schedule_respawn(&self, delay: Duration) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(PoolEvent::Respawn);
        });
    }

    fn backoff(&self) -> Duration {
        respawn_backoff(self.crash_streak)
    }

    fn settle(&mut self, completion: Completion, result: Result<Value>) {
        self.settled += 1;
        completion.settle(result);
    }

    fn drain_pending(&mut self) {
        while let Some(worker) = self.idle.pop() {
            match self.pending.pop_front() {
                Some(entry) => self.dispatch(worker, entry.task, entry.completion),
                None => {
                    self.idle.push(worker);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, worker: WorkerId, task: Task, completion: Completion) {
        let Task {
            work,
            timeout,
            on_complete,
        } = task;

        let payload = match serde_json::to_value(&work) {
            Ok(payload) => payload,
            Err(e) => {
                self.settle(completion, Err(e.into()));
                self.idle.push(worker);
                return;
            }
        };

        let Some(state) = self.workers.get_mut(&worker) else {
            self.settle(completion, Err(Error::Ipc(format!("{} is not live", worker))));
            return;
        };

        self.next_dispatch += 1;
        let dispatch = self.next_dispatch;
        let timer = timeout.map(|duration| {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let _ = events.send(PoolEvent::TimedOut { worker, dispatch });
            })
        });

        let label = work.label();
        tracing::debug!("Dispatching task {} to {}", label, worker);
        if !state.process.send(Envelope::task(payload)) {
            // The worker is going away; its exit event will reject the task.
            tracing::debug!("{} stdin is closed", worker);
        }

        state.in_flight = Some(InFlight {
            dispatch,
            label,
            timeout,
            timer,
            timed_out: false,
            on_complete,
            completion,
        });
    }

    fn on_done(&mut self, worker: WorkerId, envelope: Envelope) {
        let Some(state) = self.workers.get_mut(&worker) else {
            return;
        };
        let Some(mut flight) = state.in_flight.take() else {
            tracing::warn!("{} reported completion with no task in flight", worker);
            return;
        };
        flight.cancel_timer();
        self.crash_streak = 0;

        // A worker being killed for a timeout must not pick up new work.
        if !state.terminating {
            self.idle.push(worker);
            self.drain_pending();
        }

        let result = TaskOutcome::from_payload(envelope.payload).into_result();
        match &result {
            Ok(value) => {
                if let Some(callback) = flight.on_complete.take() {
                    run_guarded("completion callback", || callback(value));
                }
            }
            Err(e) => tracing::debug!("Task {} on {} failed: {}", flight.label, worker, e),
        }
        self.settle(flight.completion, result);
    }

    fn on_message(&self, worker: WorkerId, envelope: Envelope) {
        let Some(handler) = &self.message_handler else {
            tracing::debug!("No message handler registered, dropping message from {}", worker);
            return;
        };
        let Some(state) = self.workers.get(&worker) else {
            return;
        };

        let replier = Replier::new(state.process.outbox(), envelope.correlation_id);
        run_guarded("message handler", || handler(envelope.payload, replier));
    }

    fn fail_pending(&mut self, reason: &str) {
        for entry in self.pending.drain(..) {
            self.settled += 1;
            entry
                .completion
                .settle(Err(Error::Spawn(reason.to_string())));
        }
    }
}

/// Delay before the next replacement worker after `streak` consecutive failures.
fn respawn_backoff(streak: u32) -> Duration {
    let exponent = streak.saturating_sub(1).min(16);
    RESPAWN_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(RESPAWN_BACKOFF_MAX)
}

/// Run a user callback on the coordinator, logging instead of unwinding on panic.
pub(crate) fn run_guarded(what: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("{} panicked; the pool keeps running", what);
    }
}
