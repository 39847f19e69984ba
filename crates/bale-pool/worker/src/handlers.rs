//! Built-in task handlers.
//!
//! | name   | args                  | result |
//! |--------|-----------------------|--------|
//! | `noop` | ignored               | `null` |
//! | `echo` | anything              | the args |
//! | `sleep`| `{"ms": n, "tag"?: v}`| `{"pid", "tag", "startedAt", "finishedAt"}` (epoch millis) |
//! | `ask`  | anything              | the pool's reply to a message carrying the args |
//! | `fail` | `{"message"?: s}`     | task error |
//! | `exit` | `{"code"?: n}`        | process exits immediately |

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bale_pool::{HandlerResult, TaskContext, WorkerRuntime};
use serde_json::{Value, json};

pub fn register_builtin(runtime: WorkerRuntime) -> WorkerRuntime {
    runtime
        .register("noop", |_, _| Ok(Value::Null))
        .register("echo", |_, args| Ok(args))
        .register("sleep", sleep)
        .register("ask", ask)
        .register("fail", fail)
        .register("exit", exit)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn sleep(_: &TaskContext, args: Value) -> HandlerResult {
    let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
    let started_at = now_millis();
    std::thread::sleep(Duration::from_millis(ms));
    Ok(json!({
        "pid": std::process::id(),
        "tag": args.get("tag").cloned().unwrap_or(Value::Null),
        "startedAt": started_at,
        "finishedAt": now_millis(),
    }))
}

fn ask(ctx: &TaskContext, args: Value) -> HandlerResult {
    ctx.send(args)
        .and_then(|reply| reply.wait())
        .map_err(|e| e.to_string())
}

fn fail(_: &TaskContext, args: Value) -> HandlerResult {
    let message = args
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("task failed on purpose");
    Err(message.to_string())
}

fn exit(_: &TaskContext, args: Value) -> HandlerResult {
    let code = args.get("code").and_then(Value::as_i64).unwrap_or(1);
    tracing::debug!("Exiting with code {} on request", code);
    std::process::exit(code as i32)
}
