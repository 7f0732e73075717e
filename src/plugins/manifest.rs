//! Capability manifest wire types.
//!
//! A manifest is the declarative description of a capability: identity,
//! entry point, security policy and I/O contract. Manifests are produced by
//! the registry and shared read-only (`Arc<CapabilityManifest>`) for the
//! lifetime of one invocation; nothing in the dispatcher mutates them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::output::ResultType;

/// Default memory ceiling for a sandboxed capability, in MiB.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 128;

/// Default wall-clock timeout for a sandboxed capability, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default entry function name.
pub const DEFAULT_ENTRY_FUNCTION: &str = "execute";

/// File extensions the filesystem facade permits when a manifest does not
/// declare its own list.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[".json", ".txt", ".csv", ".md"];

/// Runtime a capability is written for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Language {
    JavaScript,
    Python,
    Wasm,
    /// Carried verbatim so the dispatcher can report it as unsupported
    /// instead of failing manifest parsing.
    Other(String),
}

impl Language {
    pub fn as_str(&self) -> &str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Wasm => "wasm",
            Language::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "javascript" | "js" => Language::JavaScript,
            "python" | "py" => Language::Python,
            "wasm" => Language::Wasm,
            _ => Language::Other(s.to_string()),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Language {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Language {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Language::parse(&s))
    }
}

/// Where a capability's code lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    /// Entry file, relative to the capability root.
    pub main: String,
    /// Entry function name inside the module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Embedded source of `main`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Additional embedded files (relative path -> contents).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    /// Package reference resolved by the module loader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageRef>,
}

impl EntryPoint {
    pub fn function_name(&self) -> &str {
        self.function
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_ENTRY_FUNCTION)
    }
}

/// A fetchable package holding the capability sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PackageRef {
    /// A directory, relative to the registry root unless absolute.
    Local { path: String },
}

/// Signature and publisher of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

/// Resource and access limits applied by every executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOptions {
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Path prefixes the filesystem facade may touch, relative to the
    /// capability root.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Global APIs installed in the script sandbox.
    #[serde(default, rename = "allowedAPIs")]
    pub allowed_apis: Vec<String>,
}

fn default_memory_limit_mb() -> u64 {
    DEFAULT_MEMORY_LIMIT_MB
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_allowed_extensions() -> Vec<String> {
    DEFAULT_ALLOWED_EXTENSIONS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            allowed_domains: Vec::new(),
            allowed_paths: Vec::new(),
            allowed_extensions: default_allowed_extensions(),
            allowed_apis: Vec::new(),
        }
    }
}

impl SandboxOptions {
    /// Memory ceiling in bytes. A zero limit falls back to the default.
    pub fn memory_limit_bytes(&self) -> usize {
        let mb = if self.memory_limit_mb == 0 {
            DEFAULT_MEMORY_LIMIT_MB
        } else {
            self.memory_limit_mb
        };
        usize::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn timeout(&self) -> std::time::Duration {
        let ms = if self.timeout_ms == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            self.timeout_ms
        };
        std::time::Duration::from_millis(ms)
    }

    /// Whether a global API is exposed to the script sandbox.
    ///
    /// An empty list exposes only `console` and `setTimeout`.
    pub fn allows_api(&self, api: &str) -> bool {
        if self.allowed_apis.is_empty() {
            return matches!(api, "console" | "setTimeout");
        }
        self.allowed_apis.iter().any(|a| a == api)
    }
}

/// The security block of a manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityBlock {
    #[serde(default)]
    pub trust: TrustInfo,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub sandbox_options: SandboxOptions,
}

/// A declared configuration key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItem {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub description: String,
}

impl ConfigItem {
    /// The effective value: an explicit value, else the default.
    pub fn effective_value(&self) -> Option<&str> {
        self.value
            .as_deref()
            .or(self.default_value.as_deref())
            .filter(|v| !v.is_empty())
    }
}

/// A named, typed input or output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoDefinition {
    pub name: String,
    #[serde(rename = "type", default = "default_io_type")]
    pub value_type: ResultType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

fn default_io_type() -> ResultType {
    ResultType::Any
}

/// Declarative description of one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityManifest {
    pub id: String,
    pub verb: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub language: Language,
    #[serde(default)]
    pub description: String,
    pub entry_point: EntryPoint,
    #[serde(default)]
    pub security: SecurityBlock,
    #[serde(default)]
    pub configuration: Vec<ConfigItem>,
    #[serde(default)]
    pub input_definitions: Vec<IoDefinition>,
    #[serde(default)]
    pub output_definitions: Vec<IoDefinition>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl CapabilityManifest {
    pub fn signature(&self) -> Option<&str> {
        self.security
            .trust
            .signature
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    pub fn publisher(&self) -> Option<&str> {
        self.security
            .trust
            .publisher
            .as_deref()
            .filter(|s| !s.is_empty())
    }

    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.security.permissions
    }

    pub fn sandbox_options(&self) -> &SandboxOptions {
        &self.security.sandbox_options
    }

    pub fn has_permission(&self, token: &str) -> bool {
        self.security.permissions.contains(token)
    }

    /// Parse a manifest from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One typed input handed to a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValue {
    pub input_name: String,
    pub value: serde_json::Value,
    #[serde(default = "default_io_type")]
    pub value_type: ResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Map<String, serde_json::Value>>,
}

impl InputValue {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        let value_type = ResultType::of_value(&value);
        Self {
            input_name: name.into(),
            value,
            value_type,
            args: None,
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, serde_json::Value::String(value.into()))
    }
}

/// Inputs keyed by name.
pub type Inputs = HashMap<String, InputValue>;

/// Build an input map from `(name, json)` pairs.
pub fn inputs_from_pairs<I, K>(pairs: I) -> Inputs
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| {
            let input = InputValue::new(k, v);
            (input.input_name.clone(), input)
        })
        .collect()
}
