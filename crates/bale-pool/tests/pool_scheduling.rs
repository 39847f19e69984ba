//! Integration tests for the process pool.
//!
//! Every test drives real `bale-worker` processes built alongside this crate.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bale_pool::{Error, Pool, PoolBuilder, PoolStats, Task};
use serde_json::{Value, json};

fn pool(size: usize) -> PoolBuilder {
    Pool::builder()
        .size(size)
        .worker_program(env!("CARGO_BIN_EXE_bale-worker"))
}

fn sleep_task(ms: u64, tag: usize) -> Task {
    Task::handler("sleep", json!({ "ms": ms, "tag": tag }))
}

fn pid_of(value: &Value) -> u64 {
    value["pid"].as_u64().expect("sleep reports its pid")
}

/// Poll the pool until `condition` holds, failing after a few seconds.
async fn wait_for_stats(pool: &Pool, condition: impl Fn(&PoolStats) -> bool) -> PoolStats {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = pool.stats().await.unwrap();
        if condition(&stats) {
            return stats;
        }
        assert!(
            Instant::now() < deadline,
            "pool never reached the expected state: {:?}",
            stats
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Copy of the worker binary that the test can delete while the pool runs.
fn disposable_worker(dir: &Path) -> PathBuf {
    let program = dir.join("bale-worker-copy");
    std::fs::copy(env!("CARGO_BIN_EXE_bale-worker"), &program).unwrap();
    program
}

/// Compile `tests/fixtures/json_module.rs` into a dynamic library inside `dir`.
fn build_fixture_module(dir: &Path) -> PathBuf {
    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/json_module.rs");
    let output = dir.join(format!(
        "{}json_module{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    ));
    let rustc = std::env::var_os("RUSTC").unwrap_or_else(|| "rustc".into());
    let status = std::process::Command::new(rustc)
        .args(["--crate-type", "cdylib", "--crate-name", "json_module", "--edition", "2021"])
        .arg("-o")
        .arg(&output)
        .arg(&source)
        .status()
        .unwrap();
    assert!(status.success(), "failed to compile {}", source.display());
    output
}

#[tokio::test]
async fn test_more_tasks_than_workers_all_complete() {
    let pool = pool(2).build().unwrap();

    let results = pool
        .add_tasks((0..5).map(|_| Task::handler("noop", Value::Null)))
        .await
        .unwrap();
    assert_eq!(results, vec![Value::Null; 5]);

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.live, 2);
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.settled, 5);
    assert_eq!(stats.worker_pids.len(), 2);
    assert!(!stats.shut_down);

    pool.kill_all();
}

#[tokio::test]
async fn test_echo_returns_arguments() {
    let pool = pool(1).build().unwrap();
    let args = json!({ "name": "bale", "items": [1, 2, 3] });
    let value = pool.add_task(Task::handler("echo", args.clone())).await.unwrap();
    assert_eq!(value, args);
    pool.kill_all();
}

#[tokio::test]
async fn test_timeout_kills_and_replaces_worker() {
    let pool = pool(1).build().unwrap();
    let before = pool.add_task(sleep_task(0, 0)).await.unwrap();

    let started = Instant::now();
    let result = pool
        .add_task(sleep_task(5_000, 1).with_timeout(Duration::from_millis(100)))
        .await;
    assert!(
        matches!(result, Err(Error::Timeout { timeout_ms: 100 })),
        "{:?}",
        result
    );
    assert!(started.elapsed() < Duration::from_secs(3));

    // The replacement serves the next task.
    let after = pool.add_task(sleep_task(0, 2)).await.unwrap();
    assert_ne!(pid_of(&before), pid_of(&after));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.settled, 3);
    pool.kill_all();
}

#[tokio::test]
async fn test_task_finishing_within_timeout_succeeds() {
    let pool = pool(1).build().unwrap();
    let value = pool
        .add_task(sleep_task(10, 7).with_timeout(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(value["tag"], json!(7));
    pool.kill_all();
}

#[tokio::test]
async fn test_shutdown_on_completion_fires_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let pool = pool(2)
        .shutdown_on_completion(true)
        .on_all_done(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    assert!(pool.shutdown_on_completion());

    let results = pool
        .add_tasks((0..3).map(|i| Task::handler("echo", json!(i))))
        .await
        .unwrap();
    assert_eq!(results, vec![json!(0), json!(1), json!(2)]);

    let stats = pool.stats().await.unwrap();
    assert!(stats.shut_down);
    assert_eq!(stats.live, 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let late = pool.add_task(Task::handler("noop", Value::Null)).await;
    assert!(matches!(late, Err(Error::PoolShutDown)));
    pool.kill_all();
    pool.stats().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_message_reply_roundtrip() {
    let pool = pool(1).build().unwrap();
    pool.on_message(|data, replier| {
        assert!(replier.correlation_id().is_some());
        if data == json!("ping") {
            replier.reply(json!("pong"));
        } else {
            replier.reply(json!({ "unexpected": data }));
        }
    });

    let value = pool.add_task(Task::handler("ask", json!("ping"))).await.unwrap();
    assert_eq!(value, json!("pong"));
    pool.kill_all();
}

#[tokio::test]
async fn test_concurrency_never_exceeds_pool_size() {
    let pool = pool(2).build().unwrap();

    let results = pool
        .add_tasks((0..6).map(|i| sleep_task(150, i)))
        .await
        .unwrap();

    let intervals: Vec<(u64, u64)> = results
        .iter()
        .map(|v| {
            (
                v["startedAt"].as_u64().unwrap(),
                v["finishedAt"].as_u64().unwrap(),
            )
        })
        .collect();
    for &(start, _) in &intervals {
        let running = intervals
            .iter()
            .filter(|&&(s, f)| s <= start && start < f)
            .count();
        assert!(running <= 2, "{} tasks overlapped at {}", running, start);
    }

    let pids: HashSet<u64> = results.iter().map(pid_of).collect();
    assert_eq!(pids.len(), 2);
    pool.kill_all();
}

#[tokio::test]
async fn test_single_worker_runs_tasks_in_submission_order() {
    let pool = pool(1).build().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let tasks = (0..5).map(|i| {
        let order = Arc::clone(&order);
        sleep_task(10, i).on_complete(move |value| {
            order.lock().unwrap().push(value["tag"].as_u64().unwrap());
        })
    });
    pool.add_tasks(tasks).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    pool.kill_all();
}

#[tokio::test]
async fn test_on_complete_skipped_for_failed_task() {
    let pool = pool(1).build().unwrap();
    let called = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&called);

    let result = pool
        .add_task(
            Task::handler("fail", json!({ "message": "nope" })).on_complete(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;
    assert!(matches!(result, Err(Error::TaskFailed(ref m)) if m == "nope"));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    pool.kill_all();
}

#[tokio::test]
async fn test_crashed_worker_is_replaced() {
    let pool = pool(1).build().unwrap();

    let result = pool
        .add_task(Task::handler("exit", json!({ "code": 3 })))
        .await;
    assert!(
        matches!(result, Err(Error::WorkerExited { .. })),
        "{:?}",
        result
    );

    let value = pool.add_task(Task::handler("echo", json!("still here"))).await.unwrap();
    assert_eq!(value, json!("still here"));

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.live, 1);
    assert!(!stats.shut_down);
    pool.kill_all();
}

#[tokio::test]
async fn test_kill_all_is_idempotent() {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let pool = pool(2)
        .on_all_done(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    pool.kill_all();
    pool.kill_all();

    let late = pool.add_task(Task::handler("noop", Value::Null)).await;
    assert!(matches!(late, Err(Error::PoolShutDown)));

    let stats = pool.stats().await.unwrap();
    assert!(stats.shut_down);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.submitted, 0);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_kill_all_rejects_running_and_queued_tasks() {
    let pool = pool(1).build().unwrap();

    let running = pool.add_task(sleep_task(5_000, 0));
    let queued = pool.add_task(Task::handler("echo", json!("never")));
    pool.kill_all();

    assert!(matches!(running.await, Err(Error::Killed)));
    assert!(matches!(queued.await, Err(Error::PoolShutDown)));
}

#[tokio::test]
async fn test_failing_and_unknown_handlers_report_errors() {
    let pool = pool(2).build().unwrap();

    let failed = pool.add_task(Task::handler("fail", json!({ "message": "boom" }))).await;
    assert!(matches!(failed, Err(Error::TaskFailed(ref m)) if m == "boom"));

    let unknown = pool.add_task(Task::handler("does-not-exist", Value::Null)).await;
    match unknown {
        Err(Error::TaskFailed(message)) => assert!(message.contains("does-not-exist"), "{}", message),
        other => panic!("expected TaskFailed, got {:?}", other),
    }

    // Task errors do not cost a worker.
    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.live, 2);
    pool.kill_all();
}

#[tokio::test]
async fn test_malformed_task_rejected_without_counting() {
    let pool = pool(1).build().unwrap();

    let result = pool.add_task(Task::handler("", Value::Null)).await;
    assert!(matches!(result, Err(Error::MalformedTask(_))), "{:?}", result);
    assert_eq!(pool.total_submitted().await.unwrap(), 0);

    pool.add_task(Task::handler("noop", Value::Null)).await.unwrap();
    assert_eq!(pool.total_submitted().await.unwrap(), 1);
    pool.kill_all();
}

#[tokio::test]
async fn test_add_tasks_fails_if_any_task_fails() {
    let pool = pool(2).build().unwrap();

    let result = pool
        .add_tasks(vec![
            Task::handler("echo", json!(1)),
            Task::handler("fail", json!({ "message": "second" })),
            Task::handler("echo", json!(3)),
        ])
        .await;
    assert!(matches!(result, Err(Error::TaskFailed(ref m)) if m == "second"));
    pool.kill_all();
}

#[tokio::test]
async fn test_missing_module_reports_load_failure() {
    let pool = pool(1).build().unwrap();

    let result = pool
        .add_task(Task::module("/nonexistent/libbale_missing.so", "run", Value::Null))
        .await;
    match result {
        Err(Error::TaskFailed(message)) => {
            assert!(message.contains("failed to load module"), "{}", message)
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }

    // The worker survives a module load failure.
    pool.add_task(Task::handler("noop", Value::Null)).await.unwrap();
    assert_eq!(pool.stats().await.unwrap().live, 1);
    pool.kill_all();
}

#[tokio::test]
async fn test_accessors() {
    let pool = pool(3).build().unwrap();
    assert_eq!(pool.size(), 3);
    assert!(!pool.shutdown_on_completion());

    pool.add_tasks((0..4).map(|i| Task::handler("echo", json!(i))))
        .await
        .unwrap();
    assert_eq!(pool.total_submitted().await.unwrap(), 4);
    pool.kill_all();
}

#[tokio::test]
async fn test_missing_worker_binary_fails_to_build() {
    let result = Pool::builder()
        .size(1)
        .worker_program("/nonexistent/bale-worker")
        .build();
    assert!(matches!(result, Err(Error::Spawn(_))));
}

#[tokio::test]
async fn test_tasks_rejected_when_no_worker_can_start() {
    let dir = tempfile::tempdir().unwrap();
    let program = disposable_worker(dir.path());
    let pool = Pool::builder()
        .size(1)
        .worker_program(program.clone())
        .build()
        .unwrap();
    std::fs::remove_file(&program).unwrap();

    let crashed = pool.add_task(Task::handler("exit", json!({ "code": 3 }))).await;
    assert!(matches!(crashed, Err(Error::WorkerExited { .. })), "{:?}", crashed);

    // The replacement cannot start, so the task must fail rather than wait forever.
    let queued = tokio::time::timeout(
        Duration::from_secs(10),
        pool.add_task(Task::handler("noop", Value::Null)),
    )
    .await
    .expect("task settles");
    assert!(matches!(queued, Err(Error::Spawn(_))), "{:?}", queued);

    let late = pool.add_task(Task::handler("noop", Value::Null)).await;
    assert!(matches!(late, Err(Error::Spawn(_))), "{:?}", late);

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.settled, 3);
    assert!(!stats.shut_down);
    pool.kill_all();
}

#[tokio::test]
async fn test_shutdown_on_completion_counts_tasks_failed_by_spawn_errors() {
    let dir = tempfile::tempdir().unwrap();
    let program = disposable_worker(dir.path());
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let pool = Pool::builder()
        .size(1)
        .worker_program(program.clone())
        .shutdown_on_completion(true)
        .on_all_done(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    std::fs::remove_file(&program).unwrap();

    let crashing = pool.add_task(Task::handler("exit", json!({ "code": 3 })));
    let queued = pool.add_task(Task::handler("noop", Value::Null));
    let (crashed, queued) = tokio::time::timeout(Duration::from_secs(10), async {
        (crashing.await, queued.await)
    })
    .await
    .expect("both tasks settle");
    assert!(matches!(crashed, Err(Error::WorkerExited { .. })));
    assert!(matches!(queued, Err(Error::Spawn(_))));

    let stats = pool.stats().await.unwrap();
    assert!(stats.shut_down);
    assert_eq!(stats.settled, stats.submitted);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_crash_looping_worker_is_respawned_with_backoff() {
    let Ok(program) = which::which("true") else {
        return;
    };
    let pool = Pool::builder()
        .size(1)
        .worker_program(program)
        .build()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let stats = pool.stats().await.unwrap();
    assert!(stats.spawned >= 2, "{:?}", stats);
    assert!(
        stats.spawned <= 8,
        "{} workers started in 1.2s without backing off",
        stats.spawned
    );
    pool.kill_all();
}

#[cfg(unix)]
#[tokio::test]
async fn test_idle_worker_killed_externally_is_replaced() {
    let pool = pool(2).build().unwrap();
    let victim = pool.stats().await.unwrap().worker_pids[0];

    // SAFETY: plain syscall on a pid this pool owns.
    let rc = unsafe { libc::kill(victim as libc::pid_t, libc::SIGKILL) };
    assert_eq!(rc, 0);

    let stats = wait_for_stats(&pool, |s| s.live == 2 && !s.worker_pids.contains(&victim)).await;
    assert_eq!(stats.spawned, 3);
    assert_eq!(stats.worker_pids.len(), 2);

    pool.add_tasks((0..4).map(|_| Task::handler("noop", Value::Null)))
        .await
        .unwrap();
    pool.kill_all();
}

#[tokio::test]
async fn test_module_tasks_run_through_pool() {
    let dir = tempfile::tempdir().unwrap();
    let module = build_fixture_module(dir.path());
    let pool = pool(1).build().unwrap();

    let args = json!({ "rows": [[1, 2], [3, 4]], "label": "matrix" });
    let value = pool
        .add_task(Task::module(module.clone(), "echo", args.clone()))
        .await
        .unwrap();
    assert_eq!(value, args);

    // One worker, so the second call hits the library it already loaded.
    for expected in 1..=2 {
        let value = pool
            .add_task(Task::module(module.clone(), "calls", Value::Null))
            .await
            .unwrap();
        assert_eq!(value["calls"], expected);
    }

    let rejected = pool
        .add_task(Task::module(module.clone(), "reject", Value::Null))
        .await;
    match rejected {
        Err(Error::TaskFailed(message)) => {
            assert_eq!(message, "module reported an error: value out of range")
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    pool.kill_all();
}
