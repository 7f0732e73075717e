//! QuickJS script sandbox.
//!
//! JavaScript capabilities run in a fresh QuickJS runtime and context per
//! invocation, built and torn down on a blocking worker thread. A sandbox
//! moves through
//!
//! ```text
//! Created -> Initialized -> Running -> {Completed | TimedOut | Crashed} -> Disposed
//! ```
//!
//! and is disposed exactly once on every path; [`SandboxMetrics`] counts
//! creations and disposals so leaks are observable.
//!
//! # Limits
//!
//! - Memory: runtime memory limit from the manifest ceiling, 1MB stack
//! - Time: the runtime interrupt handler aborts execution at the deadline,
//!   including tight synchronous loops. An outer async timer with a grace
//!   period covers host calls that block past the deadline; when it fires it
//!   cancels the sandbox and waits for the worker to dispose it before the
//!   timeout is reported.
//!
//! # Globals
//!
//! Each is installed only when listed in `allowedAPIs` (an empty list means
//! `console` and `setTimeout`):
//!
//! - `console.{log,info,warn,error,debug}` -> host tracing logger
//! - `setTimeout` / `clearTimeout`, driven by the host loop; delays above
//!   the capability timeout throw `RangeError`
//! - `fetch(url, init)` -> [`SandboxHost::fetch`]
//! - `fs.{readFile,writeFile,exists,listDir}` -> the host filesystem facade
//! - `process.env` when `env.read` is granted
//!
//! Results cross the boundary as `JSON.stringify` output only, so the host
//! never holds a reference into sandbox memory.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use rquickjs::{CatchResultExt, Context, Function, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;

use super::capabilities::RateLimiterRegistry;
use super::error::DispatchError;
use super::executor::{CapabilityExecutor, ExecutionContext};
use super::host::{FetchRequest, HostError, LogLevel, SandboxHost};
use super::manifest::Language;
use super::output::{normalize_outputs, PluginOutput};

/// Stack ceiling for one runtime (1MB)
pub const DEFAULT_MAX_STACK_BYTES: usize = 1024 * 1024;

/// Slack given to the outer timer beyond the capability timeout
pub const DEFAULT_TIMEOUT_GRACE: Duration = Duration::from_millis(250);

/// Longest single sleep of the timer loop, so the deadline stays responsive
const MAX_TIMER_SLEEP: Duration = Duration::from_millis(50);

/// How long a timed-out invocation waits for its worker to dispose the
/// sandbox before counting it as abandoned.
pub const DISPOSAL_WAIT: Duration = Duration::from_secs(2);

/// Lifecycle of one sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Initialized,
    Running,
    Completed,
    TimedOut,
    Crashed,
    Disposed,
}

/// Counters shared by every sandbox an executor creates.
#[derive(Debug, Default)]
pub struct SandboxMetrics {
    created: AtomicU64,
    disposed: AtomicU64,
    timed_out: AtomicU64,
    crashed: AtomicU64,
    abandoned: AtomicU64,
}

impl SandboxMetrics {
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> u64 {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn crashed(&self) -> u64 {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Timeouts reported while the worker was still inside a blocking host
    /// call. Each such sandbox is disposed once that call returns.
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Sandboxes created but not yet disposed.
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.disposed())
    }
}

/// Tunables for the script executor.
#[derive(Debug, Clone, Copy)]
pub struct ScriptLimits {
    pub max_stack_bytes: usize,
    pub timeout_grace: Duration,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_stack_bytes: DEFAULT_MAX_STACK_BYTES,
            timeout_grace: DEFAULT_TIMEOUT_GRACE,
        }
    }
}

/// Runtime prelude. Host functions exchange JSON strings; `{"value": ..}`
/// on success, `{"error": ".."}` on failure.
const CORE_PRELUDE: &str = r#"
(function () {
  globalThis.__capdispatch_settled = undefined;
  globalThis.__capdispatch_run_timers = function () { return -1; };
  globalThis.__capdispatch_unwrap = function (raw) {
    const r = JSON.parse(raw);
    if (r.error !== undefined) { throw new Error(r.error); }
    return r.value;
  };
  function settle(ok, v) {
    if (globalThis.__capdispatch_settled !== undefined) { return; }
    if (ok) {
      try {
        globalThis.__capdispatch_settled = { ok: true, json: JSON.stringify(v === undefined ? null : v) };
      } catch (e) {
        globalThis.__capdispatch_settled = { ok: false, error: 'result is not serializable: ' + String(e) };
      }
    } else {
      const msg = (v && v.name && v.message) ? (v.name + ': ' + v.message) : String(v);
      globalThis.__capdispatch_settled = { ok: false, error: msg };
    }
  }
  globalThis.__capdispatch_invoke = function (entry, inputsJson, contextJson) {
    if (typeof entry !== 'function') {
      settle(false, new TypeError('entry function not found'));
      return;
    }
    const inputs = new Map(Object.entries(JSON.parse(inputsJson)));
    const context = JSON.parse(contextJson);
    let result;
    try {
      result = entry(inputs, context);
    } catch (e) {
      settle(false, e);
      return;
    }
    if (result !== null && typeof result === 'object' && typeof result.then === 'function') {
      result.then(function (v) { settle(true, v); }, function (e) { settle(false, e); });
    } else {
      settle(true, result);
    }
  };
  globalThis.__capdispatch_poll = function () {
    const s = globalThis.__capdispatch_settled;
    return s === undefined ? '' : JSON.stringify(s);
  };
})();
"#;

const CONSOLE_PRELUDE: &str = r#"
(function () {
  function fmt(args) {
    return Array.prototype.map.call(args, function (a) {
      if (typeof a === 'string') { return a; }
      try { return JSON.stringify(a); } catch (e) { return String(a); }
    }).join(' ');
  }
  const c = {};
  ['log', 'info', 'warn', 'error', 'debug'].forEach(function (level) {
    c[level] = function () { __capdispatch_host_log(level, fmt(arguments)); };
  });
  globalThis.console = c;
})();
"#;

const TIMER_PRELUDE: &str = r#"
(function () {
  const timers = new Map();
  let nextId = 1;
  globalThis.setTimeout = function (fn, delay) {
    if (typeof fn !== 'function') { throw new TypeError('setTimeout callback must be a function'); }
    const extra = Array.prototype.slice.call(arguments, 2);
    const r = JSON.parse(__capdispatch_host_timer(String(delay === undefined ? 0 : Number(delay))));
    if (r.error !== undefined) { throw new RangeError(r.error); }
    const id = nextId++;
    timers.set(id, { due: Date.now() + r.value, fn: fn, args: extra });
    return id;
  };
  globalThis.clearTimeout = function (id) { timers.delete(id); };
  globalThis.__capdispatch_run_timers = function () {
    const now = Date.now();
    Array.from(timers.entries()).forEach(function (pair) {
      if (pair[1].due <= now) {
        timers.delete(pair[0]);
        pair[1].fn.apply(undefined, pair[1].args);
      }
    });
    let next = -1;
    timers.forEach(function (t) {
      const d = Math.max(0, t.due - Date.now());
      if (next < 0 || d < next) { next = d; }
    });
    return next;
  };
})();
"#;

const FETCH_PRELUDE: &str = r#"
(function () {
  function makeResponse(r) {
    return {
      status: r.status,
      ok: r.ok,
      headers: r.headers,
      text: function () { return Promise.resolve(r.body); },
      json: function () {
        try { return Promise.resolve(JSON.parse(r.body)); } catch (e) { return Promise.reject(e); }
      }
    };
  }
  globalThis.fetch = function (url, init) {
    return new Promise(function (resolve) {
      const o = init || {};
      const req = { url: String(url), method: o.method, headers: o.headers || {}, body: o.body === undefined ? undefined : String(o.body) };
      resolve(makeResponse(__capdispatch_unwrap(__capdispatch_host_fetch(JSON.stringify(req)))));
    });
  };
})();
"#;

const FS_PRELUDE: &str = r#"
(function () {
  globalThis.fs = {
    readFile: function (p) { return __capdispatch_unwrap(__capdispatch_host_fs('read', String(p), '')); },
    writeFile: function (p, data) { __capdispatch_unwrap(__capdispatch_host_fs('write', String(p), String(data))); },
    exists: function (p) { return __capdispatch_unwrap(__capdispatch_host_fs('exists', String(p), '')); },
    listDir: function (p) { return __capdispatch_unwrap(__capdispatch_host_fs('list', String(p), '')); }
  };
})();
"#;

static ENTRY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("failed to compile regex: entry_name")
});

/// Wrap a CommonJS-style module body so it evaluates to the entry function:
/// `module.exports` itself, `module.exports[entry]`, or a top-level
/// declaration named `entry`.
fn wrap_module(source: &str, entry: &str) -> String {
    format!(
        "globalThis.__capdispatch_entry = (function () {{\n\
         const module = {{ exports: {{}} }};\n\
         let __fallback;\n\
         (function (module, exports) {{\n{source}\n;\
         __fallback = (typeof {entry} === 'function') ? {entry} : undefined;\n\
         }})(module, module.exports);\n\
         const m = module.exports;\n\
         if (typeof m === 'function') {{ return m; }}\n\
         if (m && typeof m['{entry}'] === 'function') {{ return m['{entry}']; }}\n\
         return __fallback;\n\
         }})();"
    )
}

/// Settlement record written by the prelude.
#[derive(Debug, Deserialize)]
struct Settled {
    ok: bool,
    #[serde(default)]
    json: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn envelope<T: Serialize>(result: Result<T, HostError>) -> String {
    let env = match result {
        Ok(value) => Envelope {
            value: Some(value),
            error: None,
        },
        Err(e) => Envelope {
            value: None,
            error: Some(e.to_string()),
        },
    };
    serde_json::to_string(&env).unwrap_or_else(|_| r#"{"error":"host encoding failure"}"#.to_string())
}

/// Everything the worker thread needs, moved in by value.
struct ScriptJob {
    source: String,
    entry: String,
    inputs_json: String,
    context_json: String,
    env_json: Option<String>,
    memory_bytes: usize,
    timeout: Duration,
    limits: ScriptLimits,
    host: Arc<SandboxHost>,
    handle: Handle,
    /// Set by the executor when its outer timer fires.
    cancel: Arc<AtomicBool>,
}

/// One isolated QuickJS runtime + context.
pub struct ScriptSandbox {
    state: SandboxState,
    runtime: Option<Runtime>,
    context: Option<Context>,
    metrics: Arc<SandboxMetrics>,
    interrupted: Arc<AtomicBool>,
}

impl ScriptSandbox {
    /// `Created`: allocate the runtime.
    pub fn create(metrics: Arc<SandboxMetrics>) -> Result<Self, DispatchError> {
        let runtime = Runtime::new()
            .map_err(|e| DispatchError::SandboxCrash(format!("failed to create runtime: {e}")))?;
        metrics.created.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            state: SandboxState::Created,
            runtime: Some(runtime),
            context: None,
            metrics,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// `Initialized`: apply limits, arm the deadline and install globals.
    fn initialize(&mut self, job: &ScriptJob, deadline: Instant) -> Result<(), DispatchError> {
        let runtime = self.runtime.as_ref().ok_or_else(disposed_error)?;
        runtime.set_memory_limit(job.memory_bytes);
        runtime.set_max_stack_size(job.limits.max_stack_bytes);

        let interrupted = Arc::clone(&self.interrupted);
        let cancel = Arc::clone(&job.cancel);
        runtime.set_interrupt_handler(Some(Box::new(move || {
            if cancel.load(Ordering::SeqCst) || Instant::now() >= deadline {
                interrupted.store(true, Ordering::SeqCst);
                true
            } else {
                false
            }
        })));

        let context = Context::full(runtime)
            .map_err(|e| DispatchError::SandboxCrash(format!("failed to create context: {e}")))?;

        let options = job.host.enforcer().options().clone();
        let env_read = job.host.enforcer().grants().env_read;
        context.with(|ctx| -> Result<(), DispatchError> {
            let crash = |e: rquickjs::Error| DispatchError::SandboxCrash(format!("prelude: {e}"));
            let globals = ctx.globals();

            ctx.eval::<rquickjs::Value, _>(CORE_PRELUDE)
                .catch(&ctx)
                .map_err(|e| DispatchError::SandboxCrash(format!("prelude: {e}")))?;

            if options.allows_api("console") {
                let host = Arc::clone(&job.host);
                let log = Function::new(ctx.clone(), move |level: String, message: String| {
                    // dropped lines are not an error for the capability
                    let _ = host.log(LogLevel::parse(&level), &message);
                })
                .map_err(crash)?;
                globals.set("__capdispatch_host_log", log).map_err(crash)?;
                ctx.eval::<rquickjs::Value, _>(CONSOLE_PRELUDE).map_err(crash)?;
            }

            if options.allows_api("setTimeout") {
                let host = Arc::clone(&job.host);
                let timer = Function::new(ctx.clone(), move |delay: String| -> String {
                    let delay_ms = delay.parse::<f64>().unwrap_or(0.0);
                    envelope(host.check_timer(delay_ms))
                })
                .map_err(crash)?;
                globals.set("__capdispatch_host_timer", timer).map_err(crash)?;
                ctx.eval::<rquickjs::Value, _>(TIMER_PRELUDE).map_err(crash)?;
            }

            if options.allows_api("fetch") {
                let host = Arc::clone(&job.host);
                let handle = job.handle.clone();
                let fetch = Function::new(ctx.clone(), move |request: String| -> String {
                    let req: FetchRequest = match serde_json::from_str(&request) {
                        Ok(r) => r,
                        Err(e) => return envelope::<()>(Err(HostError::Http(e.to_string()))),
                    };
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let result = handle.block_on(async {
                        match tokio::time::timeout(remaining, host.fetch(req)).await {
                            Ok(r) => r,
                            Err(_) => Err(HostError::Http("fetch exceeded the capability timeout".to_string())),
                        }
                    });
                    envelope(result)
                })
                .map_err(crash)?;
                globals.set("__capdispatch_host_fetch", fetch).map_err(crash)?;
                ctx.eval::<rquickjs::Value, _>(FETCH_PRELUDE).map_err(crash)?;
            }

            if options.allows_api("fs") {
                let host = Arc::clone(&job.host);
                let fs = Function::new(
                    ctx.clone(),
                    move |op: String, path: String, data: String| -> String {
                        match op.as_str() {
                            "read" => envelope(host.read_file(&path)),
                            "write" => envelope(host.write_file(&path, &data)),
                            "exists" => envelope(host.exists(&path)),
                            "list" => envelope(host.list_dir(&path)),
                            other => envelope::<()>(Err(HostError::Fs(format!(
                                "unknown operation {other}"
                            )))),
                        }
                    },
                )
                .map_err(crash)?;
                globals.set("__capdispatch_host_fs", fs).map_err(crash)?;
                ctx.eval::<rquickjs::Value, _>(FS_PRELUDE).map_err(crash)?;
            }

            if env_read {
                if let Some(env_json) = &job.env_json {
                    let script = format!(
                        "globalThis.process = Object.freeze({{ env: Object.freeze(JSON.parse({})) }});",
                        js_string_literal(env_json)
                    );
                    ctx.eval::<rquickjs::Value, _>(script).map_err(crash)?;
                }
            }
            Ok(())
        })?;

        self.context = Some(context);
        self.state = SandboxState::Initialized;
        Ok(())
    }

    /// `Running`: evaluate the module, call the entry and drive promises and
    /// timers until the result settles or the deadline passes.
    fn run(&mut self, job: &ScriptJob, deadline: Instant) -> Result<Value, DispatchError> {
        self.state = SandboxState::Running;
        let result = self.run_inner(job, deadline);
        self.state = match &result {
            Ok(_) => SandboxState::Completed,
            Err(DispatchError::SandboxTimeout { .. }) => SandboxState::TimedOut,
            Err(_) => SandboxState::Crashed,
        };
        result
    }

    fn run_inner(&self, job: &ScriptJob, deadline: Instant) -> Result<Value, DispatchError> {
        let runtime = self.runtime.as_ref().ok_or_else(disposed_error)?;
        let context = self.context.as_ref().ok_or_else(disposed_error)?;
        let timeout_ms = u64::try_from(job.timeout.as_millis()).unwrap_or(u64::MAX);
        let fail = |message: String| -> DispatchError {
            if self.interrupted.load(Ordering::SeqCst) {
                DispatchError::SandboxTimeout { timeout_ms }
            } else {
                DispatchError::SandboxCrash(message)
            }
        };

        let wrapped = wrap_module(&job.source, &job.entry);
        context.with(|ctx| -> Result<(), DispatchError> {
            ctx.eval::<rquickjs::Value, _>(wrapped.as_str())
                .catch(&ctx)
                .map_err(|e| fail(format!("module evaluation failed: {e}")))?;
            let invoke: Function = ctx
                .globals()
                .get("__capdispatch_invoke")
                .map_err(|e| fail(e.to_string()))?;
            let entry: rquickjs::Value = ctx
                .globals()
                .get("__capdispatch_entry")
                .map_err(|e| fail(e.to_string()))?;
            invoke
                .call::<_, rquickjs::Value>((entry, job.inputs_json.as_str(), job.context_json.as_str()))
                .catch(&ctx)
                .map_err(|e| fail(format!("entry invocation failed: {e}")))?;
            Ok(())
        })?;

        loop {
            loop {
                match runtime.execute_pending_job() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(_) => return Err(fail("pending job raised an exception".to_string())),
                }
            }

            let status: String = context.with(|ctx| {
                ctx.eval::<String, _>("__capdispatch_poll()")
                    .catch(&ctx)
                    .map_err(|e| fail(e.to_string()))
            })?;
            if !status.is_empty() {
                let settled: Settled = serde_json::from_str(&status)
                    .map_err(|e| DispatchError::SandboxCrash(format!("bad settlement: {e}")))?;
                if !settled.ok {
                    return Err(fail(
                        settled
                            .error
                            .unwrap_or_else(|| "capability failed".to_string()),
                    ));
                }
                let json = settled.json.unwrap_or_else(|| "null".to_string());
                return serde_json::from_str(&json).map_err(|e| {
                    DispatchError::SandboxCrash(format!("result is not valid JSON: {e}"))
                });
            }

            if job.cancel.load(Ordering::SeqCst) || Instant::now() >= deadline {
                self.interrupted.store(true, Ordering::SeqCst);
                return Err(DispatchError::SandboxTimeout { timeout_ms });
            }

            let next_timer_ms: f64 = context.with(|ctx| {
                ctx.eval::<f64, _>("__capdispatch_run_timers()")
                    .catch(&ctx)
                    .map_err(|e| fail(format!("timer callback failed: {e}")))
            })?;

            if runtime.is_job_pending() {
                continue;
            }
            if next_timer_ms < 0.0 {
                return Err(DispatchError::SandboxCrash(
                    "entry returned a promise that can never settle".to_string(),
                ));
            }
            let wait = Duration::from_millis(next_timer_ms.max(0.0) as u64)
                .min(MAX_TIMER_SLEEP)
                .min(deadline.saturating_duration_since(Instant::now()));
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }
    }

    /// Release the context and runtime. Safe to call more than once; only
    /// the first call counts as a disposal.
    pub fn dispose(&mut self) {
        if self.state == SandboxState::Disposed {
            return;
        }
        match self.state {
            SandboxState::TimedOut => {
                self.metrics.timed_out.fetch_add(1, Ordering::SeqCst);
            }
            SandboxState::Crashed => {
                self.metrics.crashed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        // context holds a runtime reference; drop it first
        self.context.take();
        self.runtime.take();
        self.state = SandboxState::Disposed;
        self.metrics.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ScriptSandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn disposed_error() -> DispatchError {
    DispatchError::SandboxCrash("sandbox already disposed".to_string())
}

fn js_string_literal(s: &str) -> String {
    // JSON string literals are valid JavaScript string literals
    Value::String(s.to_string()).to_string()
}

/// Worker-thread body: create, initialize, run, dispose.
fn run_job(job: ScriptJob, metrics: Arc<SandboxMetrics>) -> Result<Value, DispatchError> {
    let deadline = Instant::now() + job.timeout;
    let mut sandbox = ScriptSandbox::create(metrics)?;
    let result = sandbox
        .initialize(&job, deadline)
        .and_then(|()| sandbox.run(&job, deadline));
    if result.is_err()
        && matches!(sandbox.state(), SandboxState::Created | SandboxState::Initialized)
    {
        sandbox.state = SandboxState::Crashed;
    }
    sandbox.dispose();
    result
}

/// Executor for `javascript` capabilities.
pub struct ScriptExecutor {
    rate_limiters: Arc<RateLimiterRegistry>,
    metrics: Arc<SandboxMetrics>,
    limits: ScriptLimits,
}

impl ScriptExecutor {
    pub fn new(rate_limiters: Arc<RateLimiterRegistry>, limits: ScriptLimits) -> Self {
        Self {
            rate_limiters,
            metrics: Arc::new(SandboxMetrics::default()),
            limits,
        }
    }

    pub fn metrics(&self) -> Arc<SandboxMetrics> {
        Arc::clone(&self.metrics)
    }

    async fn execute_inner(&self, ctx: &ExecutionContext) -> Result<Value, DispatchError> {
        let manifest = &ctx.manifest;
        let entry = manifest.entry_point.function_name().to_string();
        if !ENTRY_NAME.is_match(&entry) {
            return Err(DispatchError::SandboxCrash(format!(
                "invalid entry function name {entry:?}"
            )));
        }

        let env_json = serde_json::to_string(&ctx.environment).ok();
        let cancel = Arc::new(AtomicBool::new(false));
        let job = ScriptJob {
            source: ctx.module.entry_text()?.to_string(),
            entry,
            inputs_json: ctx.input_values_json().to_string(),
            context_json: ctx.call_context_json().to_string(),
            env_json,
            memory_bytes: ctx.limits.memory_bytes,
            timeout: ctx.limits.timeout,
            limits: self.limits,
            host: Arc::new(SandboxHost::new(
                manifest,
                ctx.root().clone(),
                Arc::clone(&self.rate_limiters),
            )),
            handle: Handle::current(),
            cancel: Arc::clone(&cancel),
        };

        let timeout = ctx.limits.timeout;
        let metrics = Arc::clone(&self.metrics);
        let mut worker = tokio::task::spawn_blocking(move || run_job(job, metrics));

        let raced = tokio::time::timeout(timeout + self.limits.timeout_grace, &mut worker).await;
        let Ok(joined) = raced else {
            cancel.store(true, Ordering::SeqCst);
            self.await_disposal(worker, ctx).await;
            return Err(DispatchError::SandboxTimeout {
                timeout_ms: ctx.limits.timeout_ms(),
            });
        };
        joined.map_err(|e| DispatchError::SandboxCrash(format!("sandbox worker failed: {e}")))?
    }

    /// The worker only observes cancellation between host calls, so a call
    /// blocked past [`DISPOSAL_WAIT`] leaves the sandbox to be disposed later.
    async fn await_disposal(
        &self,
        worker: tokio::task::JoinHandle<Result<Value, DispatchError>>,
        ctx: &ExecutionContext,
    ) {
        if tokio::time::timeout(DISPOSAL_WAIT, worker).await.is_err() {
            self.metrics.abandoned.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                capability_id = %ctx.manifest.id,
                invocation_id = %ctx.invocation_id,
                "sandbox worker still blocked after timeout; disposal deferred"
            );
        }
    }
}

#[async_trait]
impl CapabilityExecutor for ScriptExecutor {
    fn name(&self) -> &'static str {
        "quickjs"
    }

    fn supports(&self, language: &Language) -> bool {
        *language == Language::JavaScript
    }

    async fn execute(&self, ctx: ExecutionContext) -> Vec<PluginOutput> {
        let started = Instant::now();
        let result = self.execute_inner(&ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(value) => {
                tracing::debug!(
                    capability_id = %ctx.manifest.id,
                    invocation_id = %ctx.invocation_id,
                    elapsed_ms,
                    "script capability completed"
                );
                normalize_outputs(value, false)
            }
            Err(e) => {
                tracing::warn!(
                    capability_id = %ctx.manifest.id,
                    invocation_id = %ctx.invocation_id,
                    elapsed_ms,
                    error = %e,
                    "script capability failed"
                );
                e.into_outputs()
            }
        }
    }
}
