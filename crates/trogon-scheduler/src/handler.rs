//! Job handlers: the opaque work a job runs, looked up by id.
//!
//! A handler receives a [`HandlerContext`] and returns a JSON result or an
//! error message. Long-running handlers should watch `ctx.cancel`; once the
//! job timeout elapses the pool cancels it and, after a grace period, drops
//! the task outright.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub type HandlerOutcome = std::result::Result<Value, String>;

/// Everything a handler learns about the attempt it is running.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: String,
    pub execution_id: String,
    pub attempt: u32,
    pub fired_at: DateTime<Utc>,
    pub args: Value,
    pub cancel: CancellationToken,
}

pub trait JobHandler: Send + Sync + 'static {
    fn run(&self, ctx: HandlerContext) -> BoxFuture<'static, HandlerOutcome>;

    /// Reject bad `handler.args` when the job is defined rather than when it fires.
    fn validate_args(&self, _args: &Value) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl<F, Fut> JobHandler for F
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn run(&self, ctx: HandlerContext) -> BoxFuture<'static, HandlerOutcome> {
        (self)(ctx).boxed()
    }
}

/// Handlers by id. Built once at startup, then cloned into the client and
/// dispatcher.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo` and `spawn`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", EchoHandler);
        registry.register("spawn", SpawnHandler::default());
        registry
    }

    /// Replaces any handler already registered under `id`.
    pub fn register(&mut self, id: impl Into<String>, handler: impl JobHandler) -> &mut Self {
        self.handlers.insert(id.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Returns its arguments. Useful for smoke tests and heartbeats.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl JobHandler for EchoHandler {
    fn run(&self, ctx: HandlerContext) -> BoxFuture<'static, HandlerOutcome> {
        async move { Ok(ctx.args) }.boxed()
    }
}

#[derive(Debug, Deserialize)]
struct SpawnArgs {
    bin: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Runs an external binary. Exit code 0 is success.
///
/// `handler.args` is `{"bin": "/abs/path", "args": ["..."]}`. The child sees
/// `SCHEDULER_JOB_ID`, `SCHEDULER_EXECUTION_ID`, `SCHEDULER_ATTEMPT` and
/// `SCHEDULER_FIRED_AT` in its environment. On cancellation it gets SIGTERM,
/// then SIGKILL after `kill_grace`.
#[derive(Debug, Clone)]
pub struct SpawnHandler {
    kill_grace: Duration,
}

impl Default for SpawnHandler {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl SpawnHandler {
    pub fn with_kill_grace(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl JobHandler for SpawnHandler {
    fn validate_args(&self, args: &Value) -> std::result::Result<(), String> {
        let spawn: SpawnArgs =
            serde_json::from_value(args.clone()).map_err(|e| format!("spawn args: {e}"))?;
        validate_spawn(&spawn.bin, &spawn.args)
    }

    fn run(&self, ctx: HandlerContext) -> BoxFuture<'static, HandlerOutcome> {
        let kill_grace = self.kill_grace;
        async move {
            let spawn: SpawnArgs =
                serde_json::from_value(ctx.args.clone()).map_err(|e| format!("spawn args: {e}"))?;
            run_process(spawn, &ctx, kill_grace).await
        }
        .boxed()
    }
}

fn validate_spawn(bin: &str, args: &[String]) -> std::result::Result<(), String> {
    let path = std::path::Path::new(bin);
    if !path.is_absolute() {
        return Err(format!("bin must be an absolute path, got: {bin}"));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path).map_err(|e| format!("cannot access bin '{bin}': {e}"))?;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(format!("bin '{bin}' is not executable"));
        }
    }

    if let Some(arg) = args.iter().find(|a| a.contains('\0')) {
        return Err(format!("argument contains null byte: {arg:?}"));
    }
    Ok(())
}

async fn run_process(
    spawn: SpawnArgs,
    ctx: &HandlerContext,
    kill_grace: Duration,
) -> HandlerOutcome {
    let bin = spawn.bin;
    tracing::debug!(bin = %bin, job_id = %ctx.job_id, "Spawning process");

    let mut child = tokio::process::Command::new(&bin)
        .args(&spawn.args)
        .env("SCHEDULER_JOB_ID", &ctx.job_id)
        .env("SCHEDULER_EXECUTION_ID", &ctx.execution_id)
        .env("SCHEDULER_ATTEMPT", ctx.attempt.to_string())
        .env("SCHEDULER_FIRED_AT", ctx.fired_at.to_rfc3339())
        // Dropping the handle (task aborted, process exiting) kills the child.
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn '{bin}': {e}"))?;

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| format!("wait for '{bin}': {e}"))?;
            if status.success() {
                tracing::debug!(bin = %bin, %status, "Process completed");
                Ok(json!({ "exit_code": status.code() }))
            } else {
                tracing::warn!(bin = %bin, %status, "Process exited with non-zero status");
                Err(format!("Process exited with status: {status}"))
            }
        }
        _ = ctx.cancel.cancelled() => {
            kill_gracefully(&mut child, &bin, kill_grace).await;
            Err("Process cancelled".to_string())
        }
    }
}

/// SIGTERM, wait `grace`, then SIGKILL. Non-Unix goes straight to SIGKILL.
async fn kill_gracefully(child: &mut tokio::process::Child, bin: &str, grace: Duration) {
    tracing::warn!(bin, "Process cancelled, sending SIGTERM");

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill as nix_kill};
        use nix::unistd::Pid;
        if let Ok(pid) = i32::try_from(pid) {
            let _ = nix_kill(Pid::from_raw(pid), Signal::SIGTERM);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => return,
                Err(_) => tracing::warn!(bin, "SIGTERM ignored, escalating to SIGKILL"),
            }
        }
    }

    let _ = child.start_kill();
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(bin, error = %e, "Error waiting for killed process"),
        Err(_) => tracing::error!(bin, "Process still alive after SIGKILL"),
    }
}
