//! Worker process management.
//!
//! Every worker is driven by two tasks: a writer that drains its outbound
//! envelope queue into the child's stdin, and a supervisor that forwards
//! stdout frames to the coordinator, honours kill requests, reaps the child
//! and reports its exit exactly once.

use std::path::Path;
use std::process::Stdio;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::WorkerCommand;
use crate::error::{Error, Result};
use crate::ipc::{Envelope, read_envelope, write_envelope};

use super::{PoolEvent, WorkerId};

/// Coordinator-side handle to a running worker process.
pub(crate) struct WorkerProcess {
    pid: Option<u32>,
    outbox: mpsc::UnboundedSender<Envelope>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerProcess {
    /// Spawn a worker and start its writer and supervisor tasks.
    pub(crate) fn spawn(
        id: WorkerId,
        program: &Path,
        command: &WorkerCommand,
        events: &mpsc::UnboundedSender<PoolEvent>,
    ) -> Result<Self> {
        let mut child = Command::new(program)
            .args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("'{}': {}", program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let pid = child.id();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (kill, kill_rx) = oneshot::channel();

        tokio::spawn(write_loop(id, stdin, outbox_rx));
        tokio::spawn(supervise(id, child, stdout, kill_rx, events.clone()));

        Ok(Self {
            pid,
            outbox,
            kill: Some(kill),
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue an envelope for the worker. Returns false if its stdin is gone.
    pub(crate) fn send(&self, envelope: Envelope) -> bool {
        self.outbox.send(envelope).is_ok()
    }

    /// Sender used to answer worker messages.
    pub(crate) fn outbox(&self) -> mpsc::UnboundedSender<Envelope> {
        self.outbox.clone()
    }

    /// Force-terminate the worker. Idempotent.
    pub(crate) fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn write_loop(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = outbox.recv().await {
        if let Err(e) = write_envelope(&mut stdin, &envelope).await {
            tracing::debug!("Stopped writing to {}: {}", id, e);
            break;
        }
    }
    // Dropping stdin closes the channel; an idle worker exits on EOF.
}

async fn supervise(
    id: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    mut kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    let mut reader = BufReader::new(stdout);
    let mut kill_requested = false;

    loop {
        tokio::select! {
            frame = read_envelope(&mut reader) => match frame {
                Ok(Some(envelope)) => {
                    if events.send(PoolEvent::Envelope { worker: id, envelope }).is_err() {
                        // Coordinator is gone; nobody will ever read from this worker.
                        kill_requested = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(Error::Json(e)) => {
                    tracing::warn!("Ignoring undecodable envelope from {}: {}", id, e);
                }
                Err(e) => {
                    tracing::warn!("Lost channel to {}: {}", id, e);
                    break;
                }
            },
            // A dropped sender counts as a kill request too.
            _ = &mut kill => {
                kill_requested = true;
                break;
            }
        }
    }

    if !kill_requested {
        tokio::select! {
            status = child.wait() => {
                report_exit(id, status, &events);
                return;
            }
            _ = &mut kill => {}
        }
    }

    if let Err(e) = child.start_kill() {
        // Already exited is fine
        tracing::debug!("Failed to kill {}: {}", id, e);
    }
    let status = child.wait().await;
    report_exit(id, status, &events);
}

fn report_exit(
    id: WorkerId,
    status: std::io::Result<std::process::ExitStatus>,
    events: &mpsc::UnboundedSender<PoolEvent>,
) {
    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown status: {}", e),
    };
    tracing::debug!("{} exited with {}", id, status);
    let _ = events.send(PoolEvent::Exited { worker: id, status });
}
