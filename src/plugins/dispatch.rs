//! Per-invocation execution sequence.
//!
//! For every capability invocation the dispatcher runs, in order:
//!
//! 1. the trust gate (signature), with no bypass,
//! 2. permission validation (dangerous tokens are logged and audited),
//! 3. the configuration-set load and best-effort usage accounting,
//! 4. credential acquisition (a capabilities token, plus a brain token for
//!    the reasoning capability only),
//! 5. augmentation of environment and inputs under the reserved keys,
//! 6. module loading and language-based executor selection.
//!
//! Every failure becomes a failed [`PluginOutput`]; nothing is thrown past
//! [`ExecutionDispatcher::execute`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use super::capabilities::RateLimiterRegistry;
use super::error::DispatchError;
use super::executor::{CapabilityExecutor, ExecutionContext, ExecutionLimits};
use super::loader::ModuleLoader;
use super::manifest::{CapabilityManifest, InputValue, Inputs};
use super::output::PluginOutput;
use super::permissions::dangerous_permissions;
use super::script::ScriptExecutor;
use super::signature::TrustVerifier;
use super::subprocess::SubprocessExecutor;
use super::wasm::WasmExecutor;
use crate::config::store::{missing_required, ConfigurationStore, LayeredConfigStore};
use crate::config::{DispatcherConfig, EscalationSettings, SandboxSettings};
use crate::credentials::{
    CredentialProvider, EnvCredentialProvider, StaticCredentialProvider, AUDIENCE_BRAIN,
    AUDIENCE_CAPABILITIES,
};
use crate::logging::audit::{audit, AuditEvent};
use crate::logging::redact::{register_secret, SecretRegistration};
use crate::logging::targets;
use crate::registry::{CapabilityRegistry, FileRegistry};
use crate::usage::{NoopUsageRecorder, UsageRecorder, UsageTracker};
use crate::verbs::escalation::{CapabilityGenerator, DisabledGenerator, HttpGenerator};
use crate::verbs::plan_cache::{FilePlanCache, InMemoryPlanCache, PlanCache};

/// Reserved key carrying the capabilities token.
pub const AUTH_TOKEN_KEY: &str = "__auth_token";

/// Reserved key carrying the reasoning capability's extra token.
pub const BRAIN_AUTH_TOKEN_KEY: &str = "__brain_auth_token";

/// Tunables shared by the dispatcher and the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub escalation: EscalationSettings,
    pub max_timeout: Duration,
    pub max_memory_bytes: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let sandbox = SandboxSettings::default();
        Self {
            escalation: EscalationSettings::default(),
            max_timeout: sandbox.max_timeout(),
            max_memory_bytes: sandbox.max_memory_bytes(),
        }
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            escalation: config.escalation.clone(),
            max_timeout: config.sandbox.max_timeout(),
            max_memory_bytes: config.sandbox.max_memory_bytes(),
        }
    }

    pub fn is_reasoning_verb(&self, verb: &str) -> bool {
        verb.eq_ignore_ascii_case(&self.escalation.reasoning_verb)
    }
}

/// Every collaborator the dispatcher and resolver talk to. Built explicitly,
/// so independent instances can coexist (tests build one each).
pub struct DispatcherServices {
    pub registry: Arc<dyn CapabilityRegistry>,
    pub plan_cache: Arc<dyn PlanCache>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub config_store: Arc<dyn ConfigurationStore>,
    pub usage: Arc<dyn UsageRecorder>,
    pub generator: Arc<dyn CapabilityGenerator>,
    pub verifier: Arc<TrustVerifier>,
    pub loader: ModuleLoader,
    /// Consulted in order; the first that supports the language runs it.
    pub executors: Vec<Arc<dyn CapabilityExecutor>>,
    pub settings: DispatcherSettings,
}

impl DispatcherServices {
    /// Services with in-memory or inert defaults for every optional
    /// collaborator and no executors.
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        verifier: TrustVerifier,
        loader: ModuleLoader,
    ) -> Self {
        Self {
            registry,
            plan_cache: Arc::new(InMemoryPlanCache::new()),
            credentials: Arc::new(StaticCredentialProvider::new()),
            config_store: Arc::new(LayeredConfigStore::default()),
            usage: Arc::new(NoopUsageRecorder),
            generator: Arc::new(DisabledGenerator),
            verifier: Arc::new(verifier),
            loader,
            executors: Vec::new(),
            settings: DispatcherSettings::default(),
        }
    }

    /// File-backed services laid out as the configuration describes.
    pub fn from_config(config: &DispatcherConfig) -> Result<Self, DispatchError> {
        let paths = config.resolved_paths();
        let generator: Arc<dyn CapabilityGenerator> = match &config.generation.endpoint {
            Some(endpoint) => Arc::new(
                HttpGenerator::new(
                    endpoint,
                    Duration::from_millis(config.generation.timeout_ms),
                )
                .map_err(|e| DispatchError::CapabilityCreationFailed(e.to_string()))?,
            ),
            None => Arc::new(DisabledGenerator),
        };

        let services = Self::new(
            Arc::new(FileRegistry::new(&paths.registry_dir)),
            TrustVerifier::new(config.trust.clone()),
            ModuleLoader::new(&paths.registry_dir, &paths.module_cache_dir),
        )
        .with_plan_cache(Arc::new(FilePlanCache::new(&paths.plan_cache_dir)))
        .with_credentials(Arc::new(EnvCredentialProvider::default()))
        .with_config_store(Arc::new(LayeredConfigStore::from_config(config)))
        .with_usage(Arc::new(UsageTracker::load_or_default(paths.usage_file)))
        .with_generator(generator)
        .with_settings(DispatcherSettings::from_config(config))
        .with_default_executors(config)?;
        Ok(services)
    }

    pub fn with_plan_cache(mut self, plan_cache: Arc<dyn PlanCache>) -> Self {
        self.plan_cache = plan_cache;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_config_store(mut self, config_store: Arc<dyn ConfigurationStore>) -> Self {
        self.config_store = config_store;
        self
    }

    pub fn with_usage(mut self, usage: Arc<dyn UsageRecorder>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn CapabilityGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_settings(mut self, settings: DispatcherSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CapabilityExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Register the QuickJS, wasmtime and interpreter subprocess backends.
    pub fn with_default_executors(self, config: &DispatcherConfig) -> Result<Self, DispatchError> {
        let rate_limiters = Arc::new(RateLimiterRegistry::new());
        let script = ScriptExecutor::new(Arc::clone(&rate_limiters), config.sandbox.script_limits());
        let wasm = WasmExecutor::new(rate_limiters)?;
        let subprocess = SubprocessExecutor::new(config.subprocess_config());
        Ok(self
            .with_executor(Arc::new(script))
            .with_executor(Arc::new(wasm))
            .with_executor(Arc::new(subprocess)))
    }

    fn executor_for(&self, manifest: &CapabilityManifest) -> Option<&Arc<dyn CapabilityExecutor>> {
        self.executors
            .iter()
            .find(|executor| executor.supports(&manifest.language))
    }
}

/// Tokens acquired for one invocation.
#[derive(Debug, Default)]
struct AcquiredTokens {
    capabilities: Option<String>,
    brain: Option<String>,
}

/// Runs verified capabilities.
pub struct ExecutionDispatcher {
    services: DispatcherServices,
}

impl ExecutionDispatcher {
    pub fn new(services: DispatcherServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &DispatcherServices {
        &self.services
    }

    /// Execute one capability. The returned sequence is never empty.
    pub async fn execute(
        &self,
        manifest: Arc<CapabilityManifest>,
        inputs: Inputs,
    ) -> Vec<PluginOutput> {
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            target: targets::DISPATCH,
            "invoke",
            capability_id = %manifest.id,
            verb = %manifest.verb,
            invocation_id = %invocation_id,
        );
        self.execute_inner(manifest, inputs, invocation_id)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        manifest: Arc<CapabilityManifest>,
        inputs: Inputs,
        invocation_id: String,
    ) -> Vec<PluginOutput> {
        let started = Instant::now();

        if let Err(e) = self.check_trust(&manifest) {
            return e.into_outputs();
        }

        // injected values are scrubbed from logs until the invocation ends
        let mut secrets = Vec::new();
        let environment = self.configuration_environment(&manifest, &mut secrets);
        self.record_usage(&invocation_id, &manifest);

        let tokens = self.acquire_tokens(&manifest, &mut secrets).await;
        let (environment, inputs) = augment(environment, inputs, &tokens);

        let outputs = match self
            .run(Arc::clone(&manifest), inputs, environment, &invocation_id)
            .await
        {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::warn!(target: targets::DISPATCH, kind = %e.kind(), error = %e, "invocation failed");
                e.into_outputs()
            }
        };

        let success = outputs.iter().all(|o| o.success);
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            target: targets::DISPATCH,
            success,
            outputs = outputs.len(),
            elapsed_ms,
            "invocation finished"
        );
        audit(AuditEvent::CapabilityExecuted {
            capability_id: manifest.id.clone(),
            verb: manifest.verb.clone(),
            invocation_id,
            success,
            elapsed_ms,
        });
        outputs
    }

    /// Steps 1 and 2. Both failures are fatal to the invocation.
    fn check_trust(&self, manifest: &CapabilityManifest) -> Result<(), DispatchError> {
        let verifier = &self.services.verifier;
        let checked = verifier
            .verify_signature(manifest)
            .and_then(|()| verifier.verify_permissions(manifest));
        if let Err(e) = checked {
            tracing::warn!(target: targets::TRUST, kind = %e.kind(), error = %e, "capability blocked");
            audit(AuditEvent::CapabilityBlocked {
                capability_id: manifest.id.clone(),
                verb: manifest.verb.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }

        let dangerous = dangerous_permissions(manifest.permissions());
        if !dangerous.is_empty() {
            tracing::warn!(
                target: targets::TRUST,
                permissions = ?dangerous,
                "capability declares dangerous permissions"
            );
            audit(AuditEvent::DangerousPermission {
                capability_id: manifest.id.clone(),
                permissions: dangerous.iter().map(|p| p.to_string()).collect(),
            });
        }
        Ok(())
    }

    /// Step 3a: configuration values as environment entries. A store failure
    /// falls back to the manifest's declared items.
    fn configuration_environment(
        &self,
        manifest: &CapabilityManifest,
        secrets: &mut Vec<SecretRegistration>,
    ) -> BTreeMap<String, String> {
        let items = match self.services.config_store.load(manifest) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(
                    target: targets::CONFIG,
                    error = %e,
                    "configuration store failed; using manifest defaults"
                );
                manifest.configuration.clone()
            }
        };

        let missing = missing_required(&items);
        if !missing.is_empty() {
            tracing::warn!(
                target: targets::CONFIG,
                missing = ?missing,
                "required configuration items have no value"
            );
        }

        let mut environment = BTreeMap::new();
        for item in &items {
            if let Some(value) = item.effective_value() {
                if item.sensitive {
                    secrets.push(register_secret(value));
                }
                environment.insert(item.key.clone(), value.to_string());
            }
        }
        environment
    }

    /// Step 3b: best-effort; failures are logged and swallowed.
    fn record_usage(&self, invocation_id: &str, manifest: &CapabilityManifest) {
        match self
            .services
            .usage
            .record(invocation_id, &manifest.id, &manifest.verb)
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(target: targets::DISPATCH, "usage already recorded for invocation");
            }
            Err(e) => {
                tracing::warn!(target: targets::DISPATCH, error = %e, "usage accounting failed");
            }
        }
    }

    /// Step 4. A missing token never aborts the invocation.
    async fn acquire_tokens(
        &self,
        manifest: &CapabilityManifest,
        secrets: &mut Vec<SecretRegistration>,
    ) -> AcquiredTokens {
        let credentials = &self.services.credentials;
        let capabilities = credentials.get_token(AUDIENCE_CAPABILITIES).await;
        if capabilities.is_none() {
            tracing::warn!(
                target: targets::DISPATCH,
                audience = AUDIENCE_CAPABILITIES,
                "no token available; continuing unauthenticated"
            );
        }

        let brain = if self.services.settings.is_reasoning_verb(&manifest.verb) {
            let token = credentials.get_token(AUDIENCE_BRAIN).await;
            if token.is_none() {
                tracing::warn!(
                    target: targets::DISPATCH,
                    audience = AUDIENCE_BRAIN,
                    "no token available for reasoning capability"
                );
            }
            token
        } else {
            None
        };

        secrets.extend(capabilities.iter().chain(brain.iter()).map(|t| register_secret(t)));
        AcquiredTokens {
            capabilities,
            brain,
        }
    }

    /// Step 6.
    async fn run(
        &self,
        manifest: Arc<CapabilityManifest>,
        inputs: Inputs,
        environment: BTreeMap<String, String>,
        invocation_id: &str,
    ) -> Result<Vec<PluginOutput>, DispatchError> {
        let executor = self
            .services
            .executor_for(&manifest)
            .ok_or_else(|| DispatchError::UnsupportedLanguage(manifest.language.to_string()))?;

        let loader = self.services.loader.clone();
        let to_load = Arc::clone(&manifest);
        let module = tokio::task::spawn_blocking(move || loader.load(&to_load))
            .await
            .map_err(|e| DispatchError::ModuleLoadFailed(e.to_string()))??;

        let limits = ExecutionLimits::for_manifest(
            &manifest,
            self.services.settings.max_timeout,
            self.services.settings.max_memory_bytes,
        );
        tracing::debug!(
            target: targets::DISPATCH,
            executor = executor.name(),
            digest = %module.digest,
            timeout_ms = limits.timeout_ms(),
            "executing capability"
        );

        let ctx = ExecutionContext::new(invocation_id, manifest, Arc::new(module), inputs, limits)
            .with_environment(environment);
        let outputs = executor.execute(ctx).await;
        if outputs.is_empty() {
            return Err(DispatchError::SandboxCrash(
                "executor returned no outputs".to_string(),
            ));
        }
        Ok(outputs)
    }
}

/// Step 5: place acquired tokens under the reserved keys.
fn augment(
    mut environment: BTreeMap<String, String>,
    mut inputs: Inputs,
    tokens: &AcquiredTokens,
) -> (BTreeMap<String, String>, Inputs) {
    let reserved = [
        (AUTH_TOKEN_KEY, &tokens.capabilities),
        (BRAIN_AUTH_TOKEN_KEY, &tokens.brain),
    ];
    for (key, token) in reserved {
        // callers cannot smuggle values in under a reserved key
        inputs.remove(key);
        environment.remove(key);
        if let Some(token) = token {
            environment.insert(key.to_string(), token.clone());
            inputs.insert(key.to_string(), InputValue::string(key, token.clone()));
        }
    }
    (environment, inputs)
}
