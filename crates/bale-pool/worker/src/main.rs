//! bale-worker - worker process for the bale process pool.
//!
//! Reads task envelopes on stdin and answers on stdout, so nothing in this
//! process may print to stdout. Logs go to stderr, filtered by `RUST_LOG`.

mod handlers;

use bale_pool::WorkerRuntime;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let runtime = handlers::register_builtin(WorkerRuntime::new());
    tracing::debug!("Worker {} ready", std::process::id());

    // A malformed task ends up here: exit non-zero so the pool replaces us.
    runtime.run()?;
    Ok(())
}
