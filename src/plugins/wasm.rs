//! WebAssembly sandbox (wasmtime, core modules).
//!
//! Guest ABI:
//!
//! - export `memory`
//! - export `alloc(len: i32) -> i32`, returning a guest buffer for the input
//! - export `<entry>(ptr: i32, len: i32) -> i64`, where `<entry>` is the
//!   manifest entry function; the result packs `(out_ptr << 32) | out_len`
//! - optional import `env.log(level: i32, ptr: i32, len: i32)`
//!
//! The input buffer holds `{"inputs": {..}, "context": {..}}` as UTF-8 JSON
//! and the output buffer holds the result JSON (an array of outputs, or a
//! single output object).
//!
//! # Resource Limits
//!
//! - Memory: per-store `ResourceLimiter` at the capability's memory ceiling
//! - CPU: fuel budget per call
//! - Wall clock: epoch interruption, ticked by a background thread
//!
//! Compilation and the store both run on a blocking worker thread, so the
//! executor works under any tokio runtime flavor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use wasmtime::{Caller, Config, Engine, Linker, Memory, Module, ResourceLimiter, Store, Trap};

use super::capabilities::RateLimiterRegistry;
use super::error::DispatchError;
use super::executor::{CapabilityExecutor, ExecutionContext};
use super::host::{LogLevel, SandboxHost};
use super::manifest::Language;
use super::output::{normalize_outputs, PluginOutput};

/// Maximum table entries per instance.
pub const MAX_TABLE_ELEMENTS: usize = 100_000;

/// Epoch tick interval for wall-clock timeout enforcement.
pub const DEFAULT_EPOCH_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Fuel budget per call (1 billion instructions).
pub const DEFAULT_FUEL_BUDGET: u64 = 1_000_000_000;

/// Largest result buffer read back from the guest (10MB)
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Compiled modules kept in memory, keyed by content digest.
const MAX_CACHED_MODULES: usize = 64;

fn compute_epoch_deadline_ticks(timeout: Duration, interval: Duration) -> u64 {
    let interval_ms = interval.as_millis().max(1);
    let timeout_ms = timeout.as_millis().max(1);
    u64::try_from(timeout_ms.div_ceil(interval_ms)).unwrap_or(u64::MAX)
}

struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::Builder::new()
            .name("wasm-epoch-ticker".to_string())
            .spawn(move || {
                while !stop_clone.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct SandboxLimiter {
    max_memory_bytes: usize,
    max_table_elements: usize,
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_memory_bytes)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }
}

/// State held in each invocation's store.
struct WasmState {
    host: Arc<SandboxHost>,
    limiter: SandboxLimiter,
}

/// Engine, module cache and host collaborators; cheap to clone into a
/// blocking worker.
#[derive(Clone)]
struct WasmRuntime {
    engine: Engine,
    rate_limiters: Arc<RateLimiterRegistry>,
    modules: Arc<Mutex<HashMap<String, Module>>>,
    tick_interval: Duration,
}

/// Executor for `wasm` capabilities.
pub struct WasmExecutor {
    runtime: WasmRuntime,
    _epoch_ticker: EpochTicker,
}

impl WasmExecutor {
    pub fn new(rate_limiters: Arc<RateLimiterRegistry>) -> Result<Self, DispatchError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|e| DispatchError::SandboxCrash(format!("wasm engine: {e}")))?;
        let epoch_ticker = EpochTicker::start(engine.clone(), DEFAULT_EPOCH_TICK_INTERVAL)
            .map_err(|e| DispatchError::SandboxCrash(format!("epoch ticker: {e}")))?;
        Ok(Self {
            runtime: WasmRuntime {
                engine,
                rate_limiters,
                modules: Arc::new(Mutex::new(HashMap::new())),
                tick_interval: DEFAULT_EPOCH_TICK_INTERVAL,
            },
            _epoch_ticker: epoch_ticker,
        })
    }
}

impl WasmRuntime {
    fn compile(&self, ctx: &ExecutionContext) -> Result<Module, DispatchError> {
        if let Some(module) = self.modules.lock().get(&ctx.module.digest) {
            return Ok(module.clone());
        }
        let module = Module::new(&self.engine, &ctx.module.entry_bytes[..]).map_err(|e| {
            DispatchError::ModuleLoadFailed(format!("{}: {e}", ctx.module.entry))
        })?;
        let mut modules = self.modules.lock();
        if modules.len() >= MAX_CACHED_MODULES {
            modules.clear();
        }
        modules.insert(ctx.module.digest.clone(), module.clone());
        Ok(module)
    }

    fn run(&self, module: &Module, ctx: &ExecutionContext) -> Result<Value, DispatchError> {
        let timeout_ms = ctx.limits.timeout_ms();
        let host = Arc::new(SandboxHost::new(
            &ctx.manifest,
            ctx.root().clone(),
            Arc::clone(&self.rate_limiters),
        ));
        let mut store = Store::new(
            &self.engine,
            WasmState {
                host,
                limiter: SandboxLimiter {
                    max_memory_bytes: ctx.limits.memory_bytes,
                    max_table_elements: MAX_TABLE_ELEMENTS,
                },
            },
        );
        store.limiter(|state| &mut state.limiter);
        store.set_epoch_deadline(compute_epoch_deadline_ticks(
            ctx.limits.timeout,
            self.tick_interval,
        ));
        store
            .set_fuel(DEFAULT_FUEL_BUDGET)
            .map_err(|e| DispatchError::SandboxCrash(format!("failed to set fuel budget: {e}")))?;

        let mut linker: Linker<WasmState> = Linker::new(&self.engine);
        linker
            .func_wrap(
                "env",
                "log",
                |mut caller: Caller<'_, WasmState>, level: i32, ptr: i32, len: i32| {
                    let message = caller
                        .get_export("memory")
                        .and_then(|e| e.into_memory())
                        .and_then(|memory| read_guest(&memory, &caller, ptr, len, MAX_OUTPUT_BYTES))
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
                    if let Some(message) = message {
                        let level = match level {
                            0 => "debug",
                            2 => "warn",
                            3 => "error",
                            _ => "info",
                        };
                        // dropped lines are not an error for the capability
                        let _ = caller.data_mut().host.log(LogLevel::parse(level), &message);
                    }
                },
            )
            .map_err(|e| DispatchError::SandboxCrash(format!("failed to bind env.log: {e}")))?;

        let trap = |e: wasmtime::Error| classify_trap(e, timeout_ms);

        let instance = linker.instantiate(&mut store, module).map_err(trap)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| DispatchError::SandboxCrash("module does not export memory".to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, "alloc")
            .map_err(|e| DispatchError::SandboxCrash(format!("alloc export: {e}")))?;
        let entry_name = ctx.manifest.entry_point.function_name();
        let entry = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, entry_name)
            .map_err(|e| DispatchError::SandboxCrash(format!("entry function {entry_name}: {e}")))?;

        let payload = serde_json::to_vec(&json!({
            "inputs": ctx.input_values_json(),
            "context": ctx.call_context_json(),
        }))
        .map_err(|e| DispatchError::SandboxCrash(e.to_string()))?;
        let payload_len = i32::try_from(payload.len())
            .map_err(|_| DispatchError::SandboxCrash("input payload too large".to_string()))?;

        let in_ptr = alloc.call(&mut store, payload_len).map_err(trap)?;
        let offset = usize::try_from(in_ptr)
            .map_err(|_| DispatchError::SandboxCrash(format!("alloc returned {in_ptr}")))?;
        memory
            .write(&mut store, offset, &payload)
            .map_err(|e| DispatchError::SandboxCrash(format!("input write: {e}")))?;

        let packed = entry.call(&mut store, (in_ptr, payload_len)).map_err(trap)?;
        let out_ptr = (packed >> 32) as u32 as i32;
        let out_len = (packed & 0xFFFF_FFFF) as u32 as i32;
        let bytes = read_guest(&memory, &store, out_ptr, out_len, MAX_OUTPUT_BYTES).ok_or_else(|| {
            DispatchError::SandboxCrash(format!(
                "result buffer ({out_ptr}, {out_len}) is outside guest memory"
            ))
        })?;

        serde_json::from_slice(&bytes)
            .map_err(|e| DispatchError::SandboxCrash(format!("result is not valid JSON: {e}")))
    }
}

/// Copy a guest buffer, bounds checked against memory size and `max`.
fn read_guest(
    memory: &Memory,
    store: impl wasmtime::AsContext,
    ptr: i32,
    len: i32,
    max: usize,
) -> Option<Vec<u8>> {
    let start = usize::try_from(ptr as u32).ok()?;
    let len = usize::try_from(len as u32).ok()?;
    if len > max {
        return None;
    }
    let data = memory.data(&store);
    let end = start.checked_add(len)?;
    data.get(start..end).map(<[u8]>::to_vec)
}

fn classify_trap(error: wasmtime::Error, timeout_ms: u64) -> DispatchError {
    match error.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) | Some(Trap::OutOfFuel) => DispatchError::SandboxTimeout { timeout_ms },
        Some(trap) => DispatchError::SandboxCrash(format!("wasm trap: {trap}")),
        None => DispatchError::SandboxCrash(format!("{error:#}")),
    }
}

#[async_trait]
impl CapabilityExecutor for WasmExecutor {
    fn name(&self) -> &'static str {
        "wasmtime"
    }

    fn supports(&self, language: &Language) -> bool {
        *language == Language::Wasm
    }

    async fn execute(&self, ctx: ExecutionContext) -> Vec<PluginOutput> {
        let started = Instant::now();
        let capability_id = ctx.manifest.id.clone();
        let invocation_id = ctx.invocation_id.clone();
        let runtime = self.runtime.clone();

        // the store is driven synchronously; epoch interruption bounds it
        let result = tokio::task::spawn_blocking(move || {
            let module = runtime.compile(&ctx)?;
            runtime.run(&module, &ctx)
        })
        .await
        .unwrap_or_else(|e| Err(DispatchError::SandboxCrash(format!("wasm worker failed: {e}"))));

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(value) => {
                tracing::debug!(
                    capability_id = %capability_id,
                    invocation_id = %invocation_id,
                    elapsed_ms,
                    "wasm capability completed"
                );
                normalize_outputs(value, true)
            }
            Err(e) => {
                tracing::warn!(
                    capability_id = %capability_id,
                    invocation_id = %invocation_id,
                    elapsed_ms,
                    error = %e,
                    "wasm capability failed"
                );
                e.into_outputs()
            }
        }
    }
}
