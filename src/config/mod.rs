//! Configuration parsing module
//!
//! Handles the JSON5 configuration file with environment variable
//! substitution and deserializes it into a typed [`DispatcherConfig`].
//! A missing file yields the defaults.

pub mod store;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::logging::{parse_level, LogConfig, LogFormat, LogOutput};
use crate::plugins::script::{ScriptLimits, DEFAULT_MAX_STACK_BYTES, DEFAULT_TIMEOUT_GRACE};
use crate::plugins::signature::{parse_verifying_key, TrustConfig};
use crate::plugins::subprocess::SubprocessConfig;

pub const CONFIG_PATH_ENV: &str = "CAPDISPATCH_CONFIG_PATH";
pub const STATE_DIR_ENV: &str = "CAPDISPATCH_STATE_DIR";
const CONFIG_FILE_STEM: &str = "capdispatch";

/// Verb of the reasoning capability used for escalation.
pub const DEFAULT_REASONING_VERB: &str = "ACCOMPLISH";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid configuration at {path}: {message}")]
    Invalid { path: String, message: String },
}

/// Resolve the state directory.
/// Priority: CAPDISPATCH_STATE_DIR > ~/.capdispatch
pub fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = env::var(STATE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".capdispatch")
}

/// Get the config file path.
/// Priority: CAPDISPATCH_CONFIG_PATH > CAPDISPATCH_STATE_DIR/capdispatch.json5 >
/// ~/.capdispatch/capdispatch.json5.
/// Falls back to .json extension if the .json5 file doesn't exist.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }

    let dir = resolve_state_dir();
    let json5 = dir.join(format!("{CONFIG_FILE_STEM}.json5"));
    if json5.exists() {
        return json5;
    }
    let json = dir.join(format!("{CONFIG_FILE_STEM}.json"));
    if json.exists() {
        return json;
    }
    json5
}

/// Load the raw configuration value with environment substitution applied.
/// Returns an empty object if the file doesn't exist.
pub fn load_config_value(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;
    Ok(value)
}

/// Load and deserialize the configuration file.
pub fn load_config(path: &Path) -> Result<DispatcherConfig, ConfigError> {
    let value = load_config_value(path)?;
    let config = DispatcherConfig::from_value(value).map_err(|e| match e {
        ConfigError::Invalid { message, .. } => ConfigError::Invalid {
            path: path.display().to_string(),
            message,
        },
        other => other,
    })?;
    tracing::debug!(target: "config", path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Parse JSON5 content
fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").expect("failed to compile regex: env_var")
    });

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full_match), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = var.as_str();
        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }
        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

// ---------------------------------------------------------------------------
// Typed sections
// ---------------------------------------------------------------------------

/// Operator ceilings for every sandbox. Manifest values above these are
/// clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    pub max_memory_mb: u64,
    pub max_timeout_ms: u64,
    pub stack_size_bytes: usize,
    /// Extra wall-clock allowance for the outer timer of the script sandbox.
    pub timeout_grace_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_timeout_ms: 300_000,
            stack_size_bytes: DEFAULT_MAX_STACK_BYTES,
            timeout_grace_ms: u64::try_from(DEFAULT_TIMEOUT_GRACE.as_millis()).unwrap_or(250),
        }
    }
}

impl SandboxSettings {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn max_memory_bytes(&self) -> usize {
        usize::try_from(self.max_memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            max_stack_bytes: self.stack_size_bytes,
            timeout_grace: Duration::from_millis(self.timeout_grace_ms),
        }
    }
}

/// `"python3"` or `["python3", "-I"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InterpreterSpec {
    Program(String),
    Argv(Vec<String>),
}

impl InterpreterSpec {
    pub fn argv(&self) -> Vec<String> {
        match self {
            InterpreterSpec::Program(p) if p.trim().is_empty() => Vec::new(),
            InterpreterSpec::Program(p) => vec![p.trim().to_string()],
            InterpreterSpec::Argv(argv) => argv.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EscalationSettings {
    pub reasoning_verb: String,
    /// Registry polls after a capability was requested.
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            reasoning_verb: DEFAULT_REASONING_VERB.to_string(),
            poll_attempts: 5,
            poll_interval_ms: 1000,
        }
    }
}

impl EscalationSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    /// Capability generator webhook; generation is disabled when unset.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 30_000,
        }
    }
}

/// Storage locations. Unset entries live under the state directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathSettings {
    pub registry_dir: Option<PathBuf>,
    pub plan_cache_dir: Option<PathBuf>,
    pub module_cache_dir: Option<PathBuf>,
    pub usage_file: Option<PathBuf>,
    pub audit_dir: Option<PathBuf>,
}

/// Fully resolved storage locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub registry_dir: PathBuf,
    pub plan_cache_dir: PathBuf,
    pub module_cache_dir: PathBuf,
    pub usage_file: PathBuf,
    pub audit_dir: PathBuf,
}

impl PathSettings {
    pub fn resolve(&self, state_dir: &Path) -> ResolvedPaths {
        let pick = |p: &Option<PathBuf>, default: &str| {
            p.clone().unwrap_or_else(|| state_dir.join(default))
        };
        ResolvedPaths {
            registry_dir: pick(&self.registry_dir, "capabilities"),
            plan_cache_dir: pick(&self.plan_cache_dir, "plans"),
            module_cache_dir: pick(&self.module_cache_dir, "modules"),
            usage_file: pick(&self.usage_file, "usage.json"),
            audit_dir: pick(&self.audit_dir, "audit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// `plaintext` or `json`
    pub format: String,
    /// Append to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plaintext".to_string(),
            file: None,
        }
    }
}

impl LoggingSettings {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: LogFormat::parse(&self.format),
            output: match &self.file {
                Some(path) => LogOutput::File(path.clone()),
                None => LogOutput::Stderr,
            },
            default_level: parse_level(&self.level),
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherConfig {
    pub trust: TrustConfig,
    pub sandbox: SandboxSettings,
    /// Language -> interpreter; merged over `subprocess.interpreters`.
    pub interpreters: BTreeMap<String, InterpreterSpec>,
    pub subprocess: SubprocessConfig,
    pub escalation: EscalationSettings,
    pub generation: GenerationSettings,
    pub paths: PathSettings,
    pub logging: LoggingSettings,
    /// Capability id -> configuration key -> operator value.
    pub capabilities: HashMap<String, BTreeMap<String, Value>>,
}

impl DispatcherConfig {
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Invalid {
            path: ".".to_string(),
            message: e.to_string(),
        })
    }

    /// Subprocess settings with the top-level `interpreters` section applied.
    pub fn subprocess_config(&self) -> SubprocessConfig {
        let mut config = self.subprocess.clone();
        for (language, spec) in &self.interpreters {
            config
                .interpreters
                .insert(language.to_ascii_lowercase(), spec.argv());
        }
        config
    }

    pub fn resolved_paths(&self) -> ResolvedPaths {
        self.paths.resolve(&resolve_state_dir())
    }
}

/// Validation error with path context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Check values the type system cannot. Returns an empty list when valid.
pub fn validate_config(config: &DispatcherConfig) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut issue = |path: String, message: String| issues.push(ValidationIssue { path, message });

    for (publisher, key) in &config.trust.trusted_publishers {
        if let Err(e) = parse_verifying_key(key) {
            issue(format!(".trust.trustedPublishers.{publisher}"), e.to_string());
        }
    }
    if config.trust.generator_publisher.trim().is_empty() {
        issue(
            ".trust.generatorPublisher".to_string(),
            "generator publisher must not be empty".to_string(),
        );
    }
    if config.sandbox.max_timeout_ms == 0 {
        issue(
            ".sandbox.maxTimeoutMs".to_string(),
            "timeout ceiling must be greater than zero".to_string(),
        );
    }
    if config.sandbox.max_memory_mb == 0 {
        issue(
            ".sandbox.maxMemoryMb".to_string(),
            "memory ceiling must be greater than zero".to_string(),
        );
    }
    for (language, argv) in &config.subprocess_config().interpreters {
        if argv.iter().all(|a| a.trim().is_empty()) {
            issue(
                format!(".interpreters.{language}"),
                "interpreter program must not be empty".to_string(),
            );
        }
    }
    if config.escalation.reasoning_verb.trim().is_empty() {
        issue(
            ".escalation.reasoningVerb".to_string(),
            "reasoning verb must not be empty".to_string(),
        );
    }
    if let Some(endpoint) = &config.generation.endpoint {
        match url::Url::parse(endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => issue(
                ".generation.endpoint".to_string(),
                format!("unsupported scheme {}", url.scheme()),
            ),
            Err(e) => issue(".generation.endpoint".to_string(), e.to_string()),
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serializes tests that modify env vars.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config, DispatcherConfig::default());
        assert_eq!(config.escalation.reasoning_verb, "ACCOMPLISH");
        assert_eq!(config.trust.generator_publisher, "capability-generator");
        assert!(config.generation.endpoint.is_none());
    }

    #[test]
    fn test_parses_json5_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capdispatch.json5");
        fs::write(
            &path,
            r#"{
                // trailing commas and comments are fine
                trust: { generatorSecret: "s3cret", trustedPublishers: { acme: "00" } },
                sandbox: { maxTimeoutMs: 5000, maxMemoryMb: 64 },
                interpreters: { python: "python3.12", ruby: ["ruby", "-W0"] },
                escalation: { reasoningVerb: "THINK", pollAttempts: 2 },
                capabilities: { "plugin-echo": { greeting: "hi", retries: 3 } },
            }"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.trust.generator_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.sandbox.max_timeout(), Duration::from_secs(5));
        assert_eq!(config.sandbox.max_memory_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.escalation.reasoning_verb, "THINK");
        assert_eq!(config.escalation.poll_attempts, 2);
        assert_eq!(config.escalation.poll_interval_ms, 1000);

        let sub = config.subprocess_config();
        assert_eq!(sub.interpreters["python"], vec!["python3.12"]);
        assert_eq!(sub.interpreters["ruby"], vec!["ruby", "-W0"]);
        assert_eq!(config.capabilities["plugin-echo"]["retries"], json!(3));
    }

    #[test]
    fn test_parse_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json5");
        fs::write(&path, "{ nope: ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("bad.json5"));
    }

    #[test]
    fn test_wrong_type_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json5");
        fs::write(&path, r#"{ sandbox: { maxTimeoutMs: "soon" } }"#).unwrap();
        assert!(matches!(
            load_config(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_env_substitution_and_escape() {
        let _lock = ENV_LOCK.lock().unwrap();
        env::set_var("CAPDISPATCH_TEST_SECRET", "from-env");
        assert_eq!(
            substitute_env_in_string("k=${CAPDISPATCH_TEST_SECRET}").unwrap(),
            "k=from-env"
        );
        assert_eq!(
            substitute_env_in_string("$${CAPDISPATCH_TEST_SECRET}").unwrap(),
            "${CAPDISPATCH_TEST_SECRET}"
        );
        env::remove_var("CAPDISPATCH_TEST_SECRET");
        assert!(matches!(
            substitute_env_in_string("${CAPDISPATCH_TEST_SECRET}"),
            Err(ConfigError::MissingEnvVar { .. })
        ));
        assert_eq!(substitute_env_in_string("${lower}").unwrap(), "${lower}");
    }

    #[test]
    fn test_config_path_priority() {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();

        env::set_var(CONFIG_PATH_ENV, "/tmp/explicit.json5");
        assert_eq!(get_config_path(), PathBuf::from("/tmp/explicit.json5"));
        env::remove_var(CONFIG_PATH_ENV);

        env::set_var(STATE_DIR_ENV, dir.path());
        assert_eq!(get_config_path(), dir.path().join("capdispatch.json5"));
        fs::write(dir.path().join("capdispatch.json"), "{}").unwrap();
        assert_eq!(get_config_path(), dir.path().join("capdispatch.json"));
        assert_eq!(resolve_state_dir(), dir.path());
        env::remove_var(STATE_DIR_ENV);
    }

    #[test]
    fn test_paths_default_under_state_dir() {
        let state = Path::new("/var/lib/capdispatch");
        let settings = PathSettings {
            plan_cache_dir: Some(PathBuf::from("/srv/plans")),
            ..PathSettings::default()
        };
        let paths = settings.resolve(state);
        assert_eq!(paths.registry_dir, state.join("capabilities"));
        assert_eq!(paths.plan_cache_dir, PathBuf::from("/srv/plans"));
        assert_eq!(paths.usage_file, state.join("usage.json"));
    }

    #[test]
    fn test_validate_config_reports_issues() {
        let mut config = DispatcherConfig::default();
        assert!(validate_config(&config).is_empty());

        config
            .trust
            .trusted_publishers
            .insert("acme".into(), "zz-not-hex".into());
        config.sandbox.max_timeout_ms = 0;
        config
            .interpreters
            .insert("python".into(), InterpreterSpec::Program("  ".into()));
        config.generation.endpoint = Some("ftp://gen.test".into());

        let issues = validate_config(&config);
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&".trust.trustedPublishers.acme"));
        assert!(paths.contains(&".sandbox.maxTimeoutMs"));
        assert!(paths.contains(&".interpreters.python"));
        assert!(paths.contains(&".generation.endpoint"));
    }

    #[test]
    fn test_logging_settings_map_to_log_config() {
        let settings = LoggingSettings {
            level: "debug".into(),
            format: "json".into(),
            file: Some(PathBuf::from("/tmp/x.log")),
        };
        let config = settings.log_config();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::File(PathBuf::from("/tmp/x.log")));
        assert_eq!(config.default_level, tracing::Level::DEBUG);
    }
}
