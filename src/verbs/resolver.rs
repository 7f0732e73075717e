//! Action-verb resolution.
//!
//! ```text
//! lookup ─┬─ found ──────────────► verify & execute
//!         └─ missing ─► plan cache ─┬─ hit ──► cached plan
//!                                   └─ miss ─► escalate
//! ```
//!
//! A `PLAN` from escalation is cached under the verb before it is returned.
//! After a `PLUGIN` result the registry is polled a bounded number of times
//! for the new capability.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::escalation::{EscalationOutcome, UnknownVerbHandler};
use crate::logging::audit::{audit, AuditEvent};
use crate::logging::targets;
use crate::plugins::dispatch::ExecutionDispatcher;
use crate::plugins::error::DispatchError;
use crate::plugins::manifest::Inputs;
use crate::plugins::output::{PluginOutput, ResultType};

/// One invocation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub action_verb: String,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_context: Option<String>,
}

impl InvocationRequest {
    pub fn new(action_verb: impl Into<String>, inputs: Inputs) -> Self {
        Self {
            action_verb: action_verb.into(),
            inputs,
            step_context: None,
        }
    }

    pub fn with_step_context(mut self, context: impl Into<String>) -> Self {
        self.step_context = Some(context.into());
        self
    }
}

pub struct VerbResolver {
    dispatcher: Arc<ExecutionDispatcher>,
    escalation: UnknownVerbHandler,
}

impl VerbResolver {
    pub fn new(dispatcher: Arc<ExecutionDispatcher>) -> Self {
        Self {
            escalation: UnknownVerbHandler::new(Arc::clone(&dispatcher)),
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &Arc<ExecutionDispatcher> {
        &self.dispatcher
    }

    /// Resolve and run one request. The returned sequence is never empty.
    pub async fn resolve(&self, request: InvocationRequest) -> Vec<PluginOutput> {
        let verb = request.action_verb.trim().to_string();
        if verb.is_empty() {
            return DispatchError::CapabilityNotFound("(empty verb)".to_string()).into_outputs();
        }
        let services = self.dispatcher.services();

        match services.registry.find_by_verb(&verb).await {
            Ok(Some(manifest)) => {
                tracing::debug!(target: targets::RESOLVER, verb = %verb, capability_id = %manifest.id, "verb resolved");
                return self.dispatcher.execute(manifest, request.inputs).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(target: targets::RESOLVER, verb = %verb, error = %e, "registry lookup failed");
                return DispatchError::RegistryUnavailable(e.to_string()).into_outputs();
            }
        }

        match services.plan_cache.get(&verb) {
            Ok(Some(cached)) => {
                tracing::info!(target: targets::RESOLVER, verb = %verb, "returning cached plan");
                return vec![PluginOutput::success(
                    "plan",
                    ResultType::Plan,
                    cached.plan,
                    format!("cached plan for {verb}"),
                )];
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(target: targets::RESOLVER, verb = %verb, error = %e, "plan cache read failed; treating as a miss");
            }
        }

        let outcome = self
            .escalation
            .escalate(&verb, &request.inputs, request.step_context.as_deref())
            .await;

        match outcome {
            EscalationOutcome::Plan { plan, outputs } => {
                match services.plan_cache.put(&verb, plan) {
                    Ok(_) => audit(AuditEvent::PlanCached { verb: verb.clone() }),
                    Err(e) => {
                        tracing::warn!(target: targets::RESOLVER, verb = %verb, error = %e, "failed to cache plan");
                    }
                }
                outputs
            }
            EscalationOutcome::DirectAnswer(outputs) | EscalationOutcome::Failed(outputs) => outputs,
            EscalationOutcome::CapabilityRequested => {
                self.run_generated(&verb, request.inputs).await
            }
        }
    }

    /// Poll the registry for a freshly generated capability and run it.
    async fn run_generated(&self, verb: &str, inputs: Inputs) -> Vec<PluginOutput> {
        let services = self.dispatcher.services();
        let settings = &services.settings.escalation;

        for attempt in 1..=settings.poll_attempts.max(1) {
            match services.registry.find_by_verb(verb).await {
                Ok(Some(manifest)) => {
                    tracing::info!(
                        target: targets::RESOLVER,
                        verb = %verb,
                        capability_id = %manifest.id,
                        attempt,
                        "generated capability is available"
                    );
                    return self.dispatcher.execute(manifest, inputs).await;
                }
                Ok(None) => {}
                Err(e) => {
                    return DispatchError::RegistryUnavailable(e.to_string()).into_outputs();
                }
            }
            if attempt < settings.poll_attempts {
                tokio::time::sleep(settings.poll_interval()).await;
            }
        }

        DispatchError::CapabilityCreationFailed(format!(
            "capability for {verb} was requested but is still not registered"
        ))
        .into_outputs()
    }
}
