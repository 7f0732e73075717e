//! Capability manifests, trust checks and sandboxed execution.
//!
//! A capability is a signed manifest plus the code it points at. The
//! [`dispatch::ExecutionDispatcher`] verifies the manifest, prepares the
//! invocation (configuration, credentials, usage) and hands it to one of the
//! sandbox backends:
//!
//! - [`script::ScriptExecutor`]: QuickJS for JavaScript sources, with a
//!   memory cap, a stack cap and an interrupt-driven deadline.
//! - [`wasm::WasmExecutor`]: wasmtime with a store memory limiter, fuel and
//!   epoch deadlines.
//! - [`subprocess::SubprocessExecutor`]: the configured interpreter for the
//!   manifest language, fed JSON on stdin with a scrubbed environment.
//!
//! # Security Model
//!
//! 1. **Trust**: manifests without a valid signature from a trusted publisher
//!    (or the generator) never reach a sandbox.
//!
//! 2. **Permissions**: unknown tokens are rejected; dangerous ones are
//!    allowed but audited. Host APIs exposed to the script sandbox check the
//!    manifest grants on every call.
//!
//! 3. **SSRF Protection**: sandboxed fetches refuse private, loopback,
//!    link-local and metadata addresses, and only speak HTTP/HTTPS.
//!
//! 4. **Resource Limits**: every run is bounded by the smaller of the
//!    manifest's limits and the operator ceiling.
//!
//! 5. **Isolation**: every invocation runs in its own workspace, a copy of
//!    the verified module sources that is removed when the invocation ends.

pub mod capabilities;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod host;
pub mod loader;
pub mod manifest;
pub mod output;
pub mod permissions;
pub mod script;
pub mod signature;
pub mod subprocess;
pub mod wasm;

pub use capabilities::{
    CapabilityError, PathValidator, RateLimiterRegistry, SsrfProtection,
    HTTP_RATE_LIMIT_PER_MINUTE, LOG_RATE_LIMIT_PER_MINUTE,
};
pub use dispatch::{DispatcherServices, DispatcherSettings, ExecutionDispatcher};
pub use error::{DispatchError, ErrorKind};
pub use executor::{CapabilityExecutor, ExecutionContext, ExecutionLimits};
pub use loader::{LoadedModule, LoaderError, ModuleLoader};
pub use manifest::{
    inputs_from_pairs, CapabilityManifest, ConfigItem, EntryPoint, InputValue, Inputs, Language,
    SecurityBlock,
};
pub use output::{PluginOutput, ResultType};
pub use permissions::{PermissionEnforcer, PermissionError};
pub use script::{ScriptExecutor, ScriptLimits};
pub use signature::{TrustConfig, TrustVerifier};
pub use subprocess::{SubprocessConfig, SubprocessExecutor};
pub use wasm::WasmExecutor;
