//! Pool configuration and worker binary discovery.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Environment variable naming the worker binary to spawn.
pub const WORKER_PATH_ENV: &str = "BALE_WORKER_PATH";

/// Environment variable overriding the pool size.
pub const POOL_SIZE_ENV: &str = "BALE_POOL_SIZE";

const WORKER_BIN: &str = "bale-worker";

/// Configuration for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Number of worker processes. 0 means one per available core.
    pub size: usize,
    /// Shut the pool down once every submitted task has settled.
    pub shutdown_on_completion: bool,
    /// How to launch a worker process.
    pub worker: WorkerCommand,
}

impl PoolConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = std::env::var(POOL_SIZE_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            config.size = size;
        }
        config
    }

    /// The worker count this configuration resolves to.
    pub fn effective_size(&self) -> usize {
        if self.size > 0 {
            self.size
        } else {
            default_pool_size()
        }
    }
}

/// Number of workers used when no size is configured.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Command line used to start a worker process.
#[derive(Debug, Clone, Default)]
pub struct WorkerCommand {
    /// Worker executable. `None` means locate `bale-worker`.
    pub program: Option<PathBuf>,
    /// Extra arguments passed to every worker.
    pub args: Vec<String>,
    /// Extra environment variables set for every worker.
    pub envs: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Worker command running the given executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Self::default()
        }
    }

    /// Resolve the executable to run.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(path) => Ok(path.clone()),
            None => find_worker_binary(),
        }
    }
}

/// Find the bale-worker binary path.
///
/// Looks in the following order:
/// 1. `BALE_WORKER_PATH` environment variable
/// 2. Same directory as the current executable (or its parent, for test binaries in `deps/`)
/// 3. System PATH
/// 4. `target/debug` or `target/release` of the workspace
pub fn find_worker_binary() -> Result<PathBuf> {
    let worker_name = if cfg!(windows) {
        "bale-worker.exe"
    } else {
        WORKER_BIN
    };

    // 1. Check environment variable
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "{} points at {}, which does not exist",
            WORKER_PATH_ENV,
            path.display()
        );
    }

    // 2. Look next to current executable
    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let candidate = dir.join(worker_name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    // 3. Try system PATH via which
    if let Ok(path) = which::which(worker_name) {
        return Ok(path);
    }

    // 4. For development: try target/debug or target/release
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(worker_name);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::WorkerNotFound(format!(
        "could not find {}. Set {} or ensure it's in PATH.",
        worker_name, WORKER_PATH_ENV
    )))
}
