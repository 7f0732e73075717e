//! Capability outputs and their normalization.
//!
//! Every invocation completes with a non-empty ordered sequence of
//! [`PluginOutput`]. Raw values coming back from a sandbox are reshaped by
//! [`normalize_outputs`] so that a capability cannot hand back a blank or
//! malformed item silently.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::error::ErrorKind;

/// Type tag of a capability result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Plan,
    Plugin,
    Error,
    Any,
    DirectAnswer,
    /// Unrecognized tag, carried verbatim.
    Other(String),
}

impl ResultType {
    pub fn as_str(&self) -> &str {
        match self {
            ResultType::String => "STRING",
            ResultType::Number => "NUMBER",
            ResultType::Boolean => "BOOLEAN",
            ResultType::Array => "ARRAY",
            ResultType::Object => "OBJECT",
            ResultType::Plan => "PLAN",
            ResultType::Plugin => "PLUGIN",
            ResultType::Error => "ERROR",
            ResultType::Any => "ANY",
            ResultType::DirectAnswer => "DIRECT_ANSWER",
            ResultType::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "STRING" => ResultType::String,
            "NUMBER" => ResultType::Number,
            "BOOLEAN" => ResultType::Boolean,
            "ARRAY" => ResultType::Array,
            "OBJECT" => ResultType::Object,
            "PLAN" => ResultType::Plan,
            "PLUGIN" => ResultType::Plugin,
            "ERROR" => ResultType::Error,
            "ANY" => ResultType::Any,
            "DIRECT_ANSWER" => ResultType::DirectAnswer,
            _ => ResultType::Other(s.to_string()),
        }
    }

    /// Infer a tag from a JSON value.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::String(_) => ResultType::String,
            Value::Number(_) => ResultType::Number,
            Value::Bool(_) => ResultType::Boolean,
            Value::Array(_) => ResultType::Array,
            Value::Object(_) => ResultType::Object,
            Value::Null => ResultType::Any,
        }
    }

    /// Literal answer types that end an escalation directly.
    pub fn is_direct_answer(&self) -> bool {
        matches!(
            self,
            ResultType::String
                | ResultType::Number
                | ResultType::Boolean
                | ResultType::DirectAnswer
        )
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResultType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResultType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ResultType::parse(&s))
    }
}

/// One item of a capability's result sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginOutput {
    pub success: bool,
    pub name: String,
    pub result_type: ResultType,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub result_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl PluginOutput {
    pub fn success(
        name: impl Into<String>,
        result_type: ResultType,
        result: Value,
        description: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            name: name.into(),
            result_type,
            result,
            result_description: description.into(),
            error: None,
            error_kind: None,
            mime_type: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            name: "error".to_string(),
            result_type: ResultType::Error,
            result: Value::Null,
            result_description: message.clone(),
            error: Some(message),
            error_kind: Some(kind),
            mime_type: None,
        }
    }
}

/// Output item name used when a capability omits one.
pub const DEFAULT_OUTPUT_NAME: &str = "result";

/// Reshape a raw sandbox result into the output contract.
///
/// When `wrap_object` is set a lone object is treated as a one-element
/// array; the script sandbox requires an array outright.
pub fn normalize_outputs(raw: Value, wrap_object: bool) -> Vec<PluginOutput> {
    let items = match raw {
        Value::Array(items) => items,
        obj @ Value::Object(_) if wrap_object => vec![obj],
        other => {
            return vec![PluginOutput::failure(
                ErrorKind::SandboxCrash,
                format!(
                    "capability must return an array of outputs, got {}",
                    json_kind(&other)
                ),
            )];
        }
    };

    if items.is_empty() {
        return vec![PluginOutput::failure(
            ErrorKind::SandboxCrash,
            "capability returned an empty output array",
        )];
    }

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| normalize_item(index, item))
        .collect()
}

fn normalize_item(index: usize, item: Value) -> PluginOutput {
    let Value::Object(mut obj) = item else {
        return PluginOutput::failure(
            ErrorKind::SandboxCrash,
            format!(
                "output item {index} must be an object, got {}",
                json_kind(&item)
            ),
        );
    };

    let name = match obj.remove("name") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => DEFAULT_OUTPUT_NAME.to_string(),
    };
    let result_type = match obj.remove("resultType") {
        Some(Value::String(s)) if !s.is_empty() => ResultType::parse(&s),
        _ => ResultType::Any,
    };
    let result = obj.remove("result").unwrap_or(Value::Null);
    let result_description = match obj.remove("resultDescription") {
        Some(Value::String(s)) => s,
        _ => String::new(),
    };
    let mime_type = match obj.remove("mimeType") {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    let error = match obj.remove("error") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };

    let success = match obj.remove("success") {
        Some(Value::Bool(b)) => b,
        _ => {
            return PluginOutput {
                success: false,
                name,
                result_type,
                result,
                result_description,
                error: Some(format!(
                    "output item {index} is missing a boolean `success` field"
                )),
                error_kind: None,
                mime_type,
            };
        }
    };

    PluginOutput {
        success,
        name,
        result_type,
        result,
        result_description,
        error,
        error_kind: None,
        mime_type,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
