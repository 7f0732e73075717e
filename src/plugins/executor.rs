//! Executor seam and per-invocation execution context.
//!
//! One [`CapabilityExecutor`] implementation exists per runtime (QuickJS,
//! wasmtime, interpreter subprocess). Each one honors the same contract:
//! memory ceiling, wall-clock timeout, allow-listed network and filesystem
//! access, and a non-empty output sequence on every path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::loader::LoadedModule;
use super::manifest::{CapabilityManifest, Inputs, Language};
use super::output::PluginOutput;

/// Effective limits for one invocation: the manifest's declared limits
/// clamped to the operator ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub memory_bytes: usize,
}

impl ExecutionLimits {
    pub fn for_manifest(
        manifest: &CapabilityManifest,
        max_timeout: Duration,
        max_memory_bytes: usize,
    ) -> Self {
        let options = manifest.sandbox_options();
        Self {
            timeout: options.timeout().min(max_timeout),
            memory_bytes: options.memory_limit_bytes().min(max_memory_bytes),
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Everything an executor needs for one invocation. Owned by that
/// invocation and dropped at its end.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub invocation_id: String,
    pub manifest: Arc<CapabilityManifest>,
    pub inputs: Inputs,
    /// Configuration values and injected tokens.
    pub environment: BTreeMap<String, String>,
    pub module: Arc<LoadedModule>,
    pub limits: ExecutionLimits,
}

impl ExecutionContext {
    pub fn new(
        invocation_id: impl Into<String>,
        manifest: Arc<CapabilityManifest>,
        module: Arc<LoadedModule>,
        inputs: Inputs,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            manifest,
            inputs,
            environment: BTreeMap::new(),
            module,
            limits,
        }
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Materialized capability root.
    pub fn root(&self) -> &PathBuf {
        &self.module.root
    }

    /// Inputs as a JSON object of `name -> InputValue`, sorted by name.
    pub fn inputs_json(&self) -> Value {
        let sorted: BTreeMap<&String, &_> = self.inputs.iter().collect();
        let mut map = Map::new();
        for (name, input) in sorted {
            map.insert(
                name.clone(),
                serde_json::to_value(input).unwrap_or(Value::Null),
            );
        }
        Value::Object(map)
    }

    /// Inputs as a JSON object of `name -> raw value`.
    pub fn input_values_json(&self) -> Value {
        let sorted: BTreeMap<&String, &_> = self.inputs.iter().collect();
        let mut map = Map::new();
        for (name, input) in sorted {
            map.insert(name.clone(), input.value.clone());
        }
        Value::Object(map)
    }

    /// Context object passed alongside the inputs.
    pub fn call_context_json(&self) -> Value {
        serde_json::json!({
            "verb": self.manifest.verb,
            "capabilityId": self.manifest.id,
            "invocationId": self.invocation_id,
        })
    }
}

/// One runtime backend.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn supports(&self, language: &Language) -> bool;

    /// Run the capability. Failures are returned as failed outputs; the
    /// sequence is never empty.
    async fn execute(&self, ctx: ExecutionContext) -> Vec<PluginOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::{
        inputs_from_pairs, EntryPoint, SandboxOptions, SecurityBlock,
    };
    use serde_json::json;

    fn manifest(timeout_ms: u64, memory_mb: u64) -> CapabilityManifest {
        CapabilityManifest {
            id: "ctx-test".to_string(),
            verb: "CTX".to_string(),
            version: "1.0.0".to_string(),
            language: Language::JavaScript,
            description: String::new(),
            entry_point: EntryPoint::default(),
            security: SecurityBlock {
                sandbox_options: SandboxOptions {
                    timeout_ms,
                    memory_limit_mb: memory_mb,
                    ..SandboxOptions::default()
                },
                ..SecurityBlock::default()
            },
            configuration: Vec::new(),
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
        }
    }

    #[test]
    fn test_limits_clamped_to_ceilings() {
        let limits = ExecutionLimits::for_manifest(
            &manifest(120_000, 4096),
            Duration::from_secs(60),
            256 * 1024 * 1024,
        );
        assert_eq!(limits.timeout, Duration::from_secs(60));
        assert_eq!(limits.memory_bytes, 256 * 1024 * 1024);

        let limits = ExecutionLimits::for_manifest(
            &manifest(500, 16),
            Duration::from_secs(60),
            256 * 1024 * 1024,
        );
        assert_eq!(limits.timeout_ms(), 500);
        assert_eq!(limits.memory_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_inputs_json_shapes() {
        let m = Arc::new(manifest(1000, 16));
        let module = Arc::new(LoadedModule::in_memory("index.js", b"".to_vec()));
        let ctx = ExecutionContext::new(
            "inv-1",
            m,
            module,
            inputs_from_pairs([("text", json!("hi")), ("n", json!(2))]),
            ExecutionLimits {
                timeout: Duration::from_secs(1),
                memory_bytes: 1024,
            },
        );
        assert_eq!(ctx.input_values_json(), json!({"n": 2, "text": "hi"}));
        assert_eq!(ctx.inputs_json()["text"]["inputName"], json!("text"));
        assert_eq!(ctx.inputs_json()["text"]["valueType"], json!("STRING"));
        assert_eq!(
            ctx.call_context_json(),
            json!({"verb": "CTX", "capabilityId": "ctx-test", "invocationId": "inv-1"})
        );
    }
}
