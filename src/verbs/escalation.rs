//! Unknown-verb escalation.
//!
//! When no capability is registered for a verb, the reasoning capability
//! (itself an ordinary signed, sandboxed capability) is asked how to
//! accomplish the step. Its first successful output decides what happens:
//!
//! | result type | outcome |
//! |---|---|
//! | `PLUGIN` | the capability generator is asked for a new capability |
//! | `PLAN` | the plan is returned (and cached by the resolver) |
//! | `STRING` `NUMBER` `BOOLEAN` `DIRECT_ANSWER` | returned as a direct answer |
//! | anything else | `UnexpectedResultType` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::logging::audit::{audit, AuditEvent};
use crate::logging::targets;
use crate::plugins::dispatch::ExecutionDispatcher;
use crate::plugins::error::DispatchError;
use crate::plugins::host::safe_truncate;
use crate::plugins::manifest::{InputValue, Inputs};
use crate::plugins::output::{PluginOutput, ResultType};

/// Input carrying the goal statement.
pub const GOAL_INPUT: &str = "goal";

/// Input naming the verb the reasoning capability must not suggest.
pub const VERB_TO_AVOID_INPUT: &str = "verbToAvoid";

/// Longest rendering of one input value inside the goal text.
const MAX_GOAL_INPUT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("capability generation is not configured")]
    Disabled,

    #[error("invalid generator endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("generator request failed: {0}")]
    Transport(String),

    #[error("generator rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Produces and publishes new capabilities on request.
#[async_trait]
pub trait CapabilityGenerator: Send + Sync {
    async fn request(
        &self,
        verb: &str,
        context: &str,
        rationale: &str,
    ) -> Result<(), GenerationError>;
}

/// Refuses every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGenerator;

#[async_trait]
impl CapabilityGenerator for DisabledGenerator {
    async fn request(&self, _: &str, _: &str, _: &str) -> Result<(), GenerationError> {
        Err(GenerationError::Disabled)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationRequest<'a> {
    action_verb: &'a str,
    context: &'a str,
    rationale: &'a str,
}

/// POSTs `{actionVerb, context, rationale}` to a webhook. Any 2xx status
/// means the request was accepted; the capability shows up in the registry
/// later.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpGenerator {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let invalid = |message: String| GenerationError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message,
        };
        let url = url::Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: url,
        })
    }
}

#[async_trait]
impl CapabilityGenerator for HttpGenerator {
    async fn request(
        &self,
        verb: &str,
        context: &str,
        rationale: &str,
    ) -> Result<(), GenerationError> {
        let body = GenerationRequest {
            action_verb: verb,
            context,
            rationale,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(GenerationError::Rejected {
            status: status.as_u16(),
            body: safe_truncate(&text, 512).to_string(),
        })
    }
}

/// Goal statement for the reasoning capability. The unresolved verb is
/// named and explicitly marked as the one to avoid.
pub fn build_goal(verb: &str, step_context: Option<&str>, inputs: &Inputs) -> String {
    let mut goal = format!(
        "Accomplish the step requested with the action verb \"{verb}\". \
         No capability is registered for this verb."
    );

    if let Some(context) = step_context.map(str::trim).filter(|c| !c.is_empty()) {
        goal.push_str("\nStep context: ");
        goal.push_str(context);
    }

    let mut names: Vec<&String> = inputs.keys().filter(|k| !k.starts_with("__")).collect();
    names.sort();
    if names.is_empty() {
        goal.push_str("\nAvailable inputs: none");
    } else {
        goal.push_str("\nAvailable inputs:");
        for name in names {
            let rendered = match &inputs[name].value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let short: String = rendered.chars().take(MAX_GOAL_INPUT_CHARS).collect();
            goal.push_str(&format!("\n- {name}: {short}"));
        }
    }

    goal.push_str(&format!(
        "\nRespond with a plan that uses other action verbs, a direct answer, \
         or a request for a new capability. Avoid using the action verb \"{verb}\" \
         anywhere in your answer.\nVerb to avoid: {verb}"
    ));
    goal
}

/// True when any step of `plan` still uses `verb` as its action verb.
pub fn plan_mentions_verb(plan: &Value, verb: &str) -> bool {
    match plan {
        Value::Object(map) => map.iter().any(|(key, value)| {
            (key == "actionVerb" && value.as_str().is_some_and(|v| v.eq_ignore_ascii_case(verb)))
                || plan_mentions_verb(value, verb)
        }),
        Value::Array(items) => items.iter().any(|item| plan_mentions_verb(item, verb)),
        _ => false,
    }
}

/// Result of one escalation.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationOutcome {
    /// The generator accepted a request; the caller should re-poll the
    /// registry.
    CapabilityRequested,
    Plan {
        plan: Value,
        outputs: Vec<PluginOutput>,
    },
    DirectAnswer(Vec<PluginOutput>),
    /// Terminal failure, already shaped as outputs.
    Failed(Vec<PluginOutput>),
}

/// Runs the reasoning capability for unknown verbs.
pub struct UnknownVerbHandler {
    dispatcher: Arc<ExecutionDispatcher>,
}

impl UnknownVerbHandler {
    pub fn new(dispatcher: Arc<ExecutionDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn escalate(
        &self,
        verb: &str,
        inputs: &Inputs,
        step_context: Option<&str>,
    ) -> EscalationOutcome {
        let services = self.dispatcher.services();
        let reasoning_verb = &services.settings.escalation.reasoning_verb;

        let reasoning = match services.registry.find_by_verb(reasoning_verb).await {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                return EscalationOutcome::Failed(
                    DispatchError::CapabilityNotFound(reasoning_verb.clone()).into_outputs(),
                )
            }
            Err(e) => {
                return EscalationOutcome::Failed(
                    DispatchError::RegistryUnavailable(e.to_string()).into_outputs(),
                )
            }
        };

        let goal = build_goal(verb, step_context, inputs);
        tracing::info!(
            target: targets::RESOLVER,
            verb = %verb,
            reasoning_capability = %reasoning.id,
            "escalating unknown verb"
        );

        let mut reasoning_inputs = Inputs::new();
        reasoning_inputs.insert(GOAL_INPUT.to_string(), InputValue::string(GOAL_INPUT, goal.clone()));
        reasoning_inputs.insert(
            VERB_TO_AVOID_INPUT.to_string(),
            InputValue::string(VERB_TO_AVOID_INPUT, verb),
        );

        let outputs = self.dispatcher.execute(reasoning, reasoning_inputs).await;
        let Some(first) = outputs.iter().find(|o| o.success).cloned() else {
            return EscalationOutcome::Failed(outputs);
        };

        match first.result_type {
            ResultType::Plugin => self.request_capability(verb, &goal, &first).await,
            ResultType::Plan => {
                if plan_mentions_verb(&first.result, verb) {
                    tracing::warn!(
                        target: targets::RESOLVER,
                        verb = %verb,
                        "reasoning plan still uses the unresolved verb"
                    );
                }
                EscalationOutcome::Plan {
                    plan: first.result,
                    outputs,
                }
            }
            ref t if t.is_direct_answer() => EscalationOutcome::DirectAnswer(outputs),
            other => EscalationOutcome::Failed(
                DispatchError::UnexpectedResultType(other.to_string()).into_outputs(),
            ),
        }
    }

    async fn request_capability(
        &self,
        verb: &str,
        goal: &str,
        output: &PluginOutput,
    ) -> EscalationOutcome {
        let rationale = match &output.result {
            Value::String(s) => s.clone(),
            Value::Null => output.result_description.clone(),
            other => other.to_string(),
        };
        let result = self
            .dispatcher
            .services()
            .generator
            .request(verb, goal, &rationale)
            .await;

        audit(AuditEvent::CapabilityRequested {
            verb: verb.to_string(),
            accepted: result.is_ok(),
        });
        match result {
            Ok(()) => EscalationOutcome::CapabilityRequested,
            Err(e) => {
                tracing::warn!(target: targets::RESOLVER, verb = %verb, error = %e, "capability generation failed");
                EscalationOutcome::Failed(
                    DispatchError::CapabilityCreationFailed(format!("{verb}: {e}")).into_outputs(),
                )
            }
        }
    }
}
