//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `invoke <VERB>` -- resolve an action verb and print the outputs
//! - `list` -- list registered capabilities
//! - `verify <MANIFEST>` -- run the trust checks against a manifest file
//! - `sign <MANIFEST>` -- sign a manifest with an Ed25519 key or the generator secret
//! - `keygen` -- create an Ed25519 publisher keypair
//! - `config show|path|validate` -- inspect configuration
//! - `version` -- print build/version info

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};

use crate::config::{self, DispatcherConfig, CONFIG_PATH_ENV};
use crate::logging::redact::redact_json_value;
use crate::plugins::dispatch::{DispatcherServices, ExecutionDispatcher};
use crate::plugins::manifest::{CapabilityManifest, InputValue, Inputs, TrustInfo};
use crate::plugins::output::PluginOutput;
use crate::plugins::signature::{generator_signature, sign_manifest, TrustVerifier};
use crate::verbs::{InvocationRequest, VerbResolver};

/// Capability dispatcher for action verbs.
#[derive(Parser, Debug)]
#[command(
    name = "capdispatch",
    version = env!("CARGO_PKG_VERSION"),
    about = "capdispatch: resolve action verbs and run signed capabilities in sandboxes"
)]
pub struct Cli {
    /// Configuration file (default: ~/.capdispatch/capdispatch.json5).
    #[arg(long, global = true, env = CONFIG_PATH_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve an action verb and run it.
    Invoke {
        /// Action verb, matched case-insensitively.
        verb: String,

        /// Input as NAME=VALUE; VALUE is parsed as JSON when possible.
        #[arg(short, long = "input", value_name = "NAME=VALUE", value_parser = parse_input_pair)]
        inputs: Vec<(String, Value)>,

        /// Inputs as a JSON object of name -> value.
        #[arg(long, value_name = "JSON")]
        inputs_json: Option<String>,

        /// Free-text description of the surrounding step.
        #[arg(long)]
        context: Option<String>,
    },

    /// List capabilities in the registry.
    List,

    /// Check a manifest's signature and permissions against the trust config.
    Verify {
        /// Path to the manifest JSON file.
        manifest: PathBuf,
    },

    /// Sign a manifest and print it (or rewrite it with --in-place).
    Sign {
        /// Path to the manifest JSON file.
        manifest: PathBuf,

        /// Hex-encoded 32-byte Ed25519 secret key.
        #[arg(long, required_unless_present = "generator", conflicts_with = "generator")]
        key_hex: Option<String>,

        /// Sign as the capability generator using the configured secret.
        #[arg(long)]
        generator: bool,

        /// Publisher to record in the manifest.
        #[arg(long)]
        publisher: Option<String>,

        /// Overwrite the manifest file instead of printing.
        #[arg(long)]
        in_place: bool,
    },

    /// Generate an Ed25519 publisher keypair.
    Keygen,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration (secrets redacted).
    Show,
    /// Print the configuration file path.
    Path,
    /// Report configuration problems.
    Validate,
}

/// Parse a `NAME=VALUE` input argument.
pub fn parse_input_pair(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("input name is empty in '{raw}'"));
    }
    // Parse value as JSON first; fall back to treating it as a plain string.
    let value: Value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Merge `--inputs-json` and `--input` arguments; later `--input` values win.
pub fn collect_inputs(
    pairs: &[(String, Value)],
    inputs_json: Option<&str>,
) -> Result<Inputs, Box<dyn std::error::Error>> {
    let mut inputs: Inputs = HashMap::new();
    if let Some(text) = inputs_json {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err("--inputs-json must be a JSON object".into());
        };
        for (name, value) in map {
            inputs.insert(name.clone(), InputValue::new(name, value));
        }
    }
    for (name, value) in pairs {
        inputs.insert(name.clone(), InputValue::new(name.clone(), value.clone()));
    }
    Ok(inputs)
}

/// Resolve the configuration path from the flag or the default lookup.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(config::get_config_path)
}

/// Run the `invoke` subcommand. Returns whether every output succeeded.
pub async fn handle_invoke(
    cfg: &DispatcherConfig,
    verb: &str,
    inputs: Inputs,
    context: Option<&str>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let services = DispatcherServices::from_config(cfg)?;
    let usage = Arc::clone(&services.usage);
    let resolver = VerbResolver::new(Arc::new(ExecutionDispatcher::new(services)));

    let mut request = InvocationRequest::new(verb, inputs);
    if let Some(context) = context {
        request = request.with_step_context(context);
    }
    let outputs = resolver.resolve(request).await;

    if let Err(e) = usage.flush() {
        tracing::warn!(target: "dispatch", error = %e, "failed to persist usage");
    }

    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(all_succeeded(&outputs))
}

fn all_succeeded(outputs: &[PluginOutput]) -> bool {
    !outputs.is_empty() && outputs.iter().all(|o| o.success)
}

/// Run the `list` subcommand.
pub async fn handle_list(cfg: &DispatcherConfig) -> Result<(), Box<dyn std::error::Error>> {
    use crate::registry::{CapabilityRegistry, FileRegistry};

    let registry = FileRegistry::new(cfg.resolved_paths().registry_dir);
    let mut manifests = registry.list().await?;
    manifests.sort_by(|a, b| a.verb.cmp(&b.verb).then_with(|| a.id.cmp(&b.id)));

    let rows: Vec<Value> = manifests
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "verb": m.verb,
                "version": m.version,
                "language": m.language.as_str(),
                "publisher": m.publisher(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn read_manifest(path: &Path) -> Result<CapabilityManifest, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    Ok(CapabilityManifest::from_json(&text)?)
}

/// Run the `verify` subcommand. Returns whether the manifest is trusted.
pub fn handle_verify(
    cfg: &DispatcherConfig,
    manifest_path: &Path,
) -> Result<bool, Box<dyn std::error::Error>> {
    let manifest = read_manifest(manifest_path)?;
    let verifier = TrustVerifier::new(cfg.trust.clone());
    match verifier.verify(&manifest) {
        Ok(()) => {
            println!(
                "trusted: {} ({}) published by {}",
                manifest.id,
                manifest.verb,
                manifest.publisher().unwrap_or("-")
            );
            Ok(true)
        }
        Err(e) => {
            eprintln!("untrusted: {} [{}] {}", manifest.id, e.kind(), e);
            Ok(false)
        }
    }
}

/// Parse a hex-encoded 32-byte Ed25519 secret key.
pub fn parse_signing_key(hex_key: &str) -> Result<SigningKey, String> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| format!("invalid hex key: {e}"))?;
    let secret: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("secret key must be 32 bytes, got {}", bytes.len()))?;
    Ok(SigningKey::from_bytes(&secret))
}

/// How `sign` produces the signature.
#[derive(Debug)]
pub enum SigningMethod {
    Key(SigningKey),
    Generator,
}

/// Set the publisher and signature on a manifest.
///
/// The signature is computed with the signature field cleared so a manifest
/// can be re-signed.
pub fn sign_with(
    cfg: &DispatcherConfig,
    mut manifest: CapabilityManifest,
    method: &SigningMethod,
    publisher: Option<&str>,
) -> Result<CapabilityManifest, Box<dyn std::error::Error>> {
    let publisher = match (method, publisher) {
        (SigningMethod::Generator, _) => cfg.trust.generator_publisher.clone(),
        (SigningMethod::Key(_), Some(p)) => p.to_string(),
        (SigningMethod::Key(_), None) => manifest
            .publisher()
            .map(str::to_string)
            .ok_or("--publisher is required when the manifest has none")?,
    };
    manifest.security.trust = TrustInfo {
        signature: None,
        publisher: Some(publisher),
    };

    let signature = match method {
        SigningMethod::Key(key) => sign_manifest(&manifest, key),
        SigningMethod::Generator => {
            generator_signature(&manifest, cfg.trust.generator_secret.as_deref())
        }
    };
    manifest.security.trust.signature = Some(signature);
    Ok(manifest)
}

/// Run the `sign` subcommand.
pub fn handle_sign(
    cfg: &DispatcherConfig,
    manifest_path: &Path,
    method: SigningMethod,
    publisher: Option<&str>,
    in_place: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = read_manifest(manifest_path)?;
    let signed = sign_with(cfg, manifest, &method, publisher)?;
    let pretty = serde_json::to_string_pretty(&signed)?;
    if in_place {
        let temp_path = manifest_path.with_extension("json.tmp");
        std::fs::write(&temp_path, format!("{pretty}\n"))?;
        std::fs::rename(&temp_path, manifest_path)?;
        println!("signed {}", manifest_path.display());
    } else {
        println!("{pretty}");
    }
    Ok(())
}

/// Run the `keygen` subcommand.
pub fn handle_keygen() -> Result<(), Box<dyn std::error::Error>> {
    let mut secret = [0u8; 32];
    getrandom::getrandom(&mut secret).map_err(|e| format!("failed to gather entropy: {e}"))?;
    let key = SigningKey::from_bytes(&secret);
    let out = json!({
        "secretKey": hex::encode(key.to_bytes()),
        "publicKey": hex::encode(key.verifying_key().to_bytes()),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Run the `config show` subcommand.
pub fn handle_config_show(cfg: &DispatcherConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(&redacted_config(cfg)?)?);
    Ok(())
}

fn redacted_config(cfg: &DispatcherConfig) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(cfg)?;
    redact_json_value(&mut value);
    Ok(value)
}

/// Run the `config path` subcommand.
pub fn handle_config_path(path: &Path) {
    println!("{}", path.display());
}

/// Run the `config validate` subcommand. Returns whether no issues were found.
pub fn handle_config_validate(cfg: &DispatcherConfig) -> bool {
    let issues = config::validate_config(cfg);
    if issues.is_empty() {
        println!("configuration OK");
        return true;
    }
    for issue in &issues {
        eprintln!("{issue}");
    }
    false
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("capdispatch {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::{EntryPoint, Language, SecurityBlock};
    use crate::plugins::signature::TrustConfig;

    fn manifest() -> CapabilityManifest {
        CapabilityManifest {
            id: "plugin-echo".to_string(),
            verb: "ECHO".to_string(),
            version: "1.0.0".to_string(),
            language: Language::JavaScript,
            description: String::new(),
            entry_point: EntryPoint {
                main: "index.js".to_string(),
                source: Some("function execute(inputs) { return inputs; }".to_string()),
                ..EntryPoint::default()
            },
            security: SecurityBlock::default(),
            configuration: Vec::new(),
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
        }
    }

    #[test]
    fn test_no_subcommand() {
        let cli = Cli::try_parse_from(["capdispatch"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_invoke_with_inputs() {
        let cli = Cli::try_parse_from([
            "capdispatch",
            "invoke",
            "echo",
            "--input",
            "message=hello",
            "-i",
            "count=3",
            "--context",
            "step 1",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Invoke {
                verb,
                inputs,
                inputs_json,
                context,
            }) => {
                assert_eq!(verb, "echo");
                assert_eq!(inputs[0], ("message".to_string(), json!("hello")));
                assert_eq!(inputs[1], ("count".to_string(), json!(3)));
                assert!(inputs_json.is_none());
                assert_eq!(context.as_deref(), Some("step 1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_invoke_rejects_malformed_input() {
        assert!(Cli::try_parse_from(["capdispatch", "invoke", "ECHO", "--input", "novalue"]).is_err());
        assert!(Cli::try_parse_from(["capdispatch", "invoke", "ECHO", "--input", "=x"]).is_err());
    }

    #[test]
    fn test_invoke_requires_verb() {
        assert!(Cli::try_parse_from(["capdispatch", "invoke"]).is_err());
    }

    #[test]
    fn test_sign_requires_key_or_generator() {
        assert!(Cli::try_parse_from(["capdispatch", "sign", "m.json"]).is_err());
        assert!(Cli::try_parse_from([
            "capdispatch",
            "sign",
            "m.json",
            "--generator",
            "--key-hex",
            "00"
        ])
        .is_err());

        let cli = Cli::try_parse_from(["capdispatch", "sign", "m.json", "--generator"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Sign {
                generator: true,
                in_place: false,
                ..
            })
        ));
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["capdispatch", "config", "show"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Show))
        ));
        let cli = Cli::try_parse_from(["capdispatch", "config", "path"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Path))
        ));
        let cli = Cli::try_parse_from(["capdispatch", "config", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Validate))
        ));
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["capdispatch", "list", "--config", "/tmp/c.json5"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json5")));
        assert_eq!(config_path(cli.config.as_deref()), PathBuf::from("/tmp/c.json5"));
    }

    #[test]
    fn test_collect_inputs_flag_overrides_json() {
        let pairs = vec![("a".to_string(), json!("flag"))];
        let inputs = collect_inputs(&pairs, Some(r#"{"a": "json", "b": [1, 2]}"#)).unwrap();
        assert_eq!(inputs["a"].value, json!("flag"));
        assert_eq!(inputs["b"].value, json!([1, 2]));
        assert_eq!(inputs["b"].input_name, "b");
    }

    #[test]
    fn test_collect_inputs_rejects_non_object() {
        assert!(collect_inputs(&[], Some("[1]")).is_err());
        assert!(collect_inputs(&[], Some("{")).is_err());
    }

    #[test]
    fn test_parse_signing_key() {
        assert!(parse_signing_key(&"11".repeat(32)).is_ok());
        assert!(parse_signing_key("abcd").unwrap_err().contains("32 bytes"));
        assert!(parse_signing_key("zz").is_err());
    }

    #[test]
    fn test_sign_with_key_verifies() {
        let key = parse_signing_key(&"07".repeat(32)).unwrap();
        let public = hex::encode(key.verifying_key().to_bytes());
        let cfg = DispatcherConfig {
            trust: TrustConfig {
                trusted_publishers: [("acme".to_string(), public)].into_iter().collect(),
                ..TrustConfig::default()
            },
            ..DispatcherConfig::default()
        };

        let signed = sign_with(&cfg, manifest(), &SigningMethod::Key(key), Some("acme")).unwrap();
        assert_eq!(signed.publisher(), Some("acme"));
        TrustVerifier::new(cfg.trust.clone()).verify(&signed).unwrap();

        // Re-signing an already signed manifest still verifies.
        let key = parse_signing_key(&"07".repeat(32)).unwrap();
        let resigned = sign_with(&cfg, signed, &SigningMethod::Key(key), None).unwrap();
        TrustVerifier::new(cfg.trust).verify(&resigned).unwrap();
    }

    #[test]
    fn test_sign_with_key_needs_publisher() {
        let key = parse_signing_key(&"07".repeat(32)).unwrap();
        let cfg = DispatcherConfig::default();
        assert!(sign_with(&cfg, manifest(), &SigningMethod::Key(key), None).is_err());
    }

    #[test]
    fn test_sign_with_generator_verifies() {
        let cfg = DispatcherConfig {
            trust: TrustConfig {
                generator_secret: Some("generator-secret".to_string()),
                ..TrustConfig::default()
            },
            ..DispatcherConfig::default()
        };
        let signed = sign_with(&cfg, manifest(), &SigningMethod::Generator, Some("ignored")).unwrap();
        assert_eq!(signed.publisher(), Some(cfg.trust.generator_publisher.as_str()));
        TrustVerifier::new(cfg.trust).verify(&signed).unwrap();
    }

    #[test]
    fn test_config_show_redacts_generator_secret() {
        let cfg = DispatcherConfig {
            trust: TrustConfig {
                generator_secret: Some("hunter2-hunter2".to_string()),
                ..TrustConfig::default()
            },
            ..DispatcherConfig::default()
        };
        let value = redacted_config(&cfg).unwrap();
        assert_eq!(value["trust"]["generatorSecret"], json!("[REDACTED]"));
        assert_eq!(
            value["trust"]["generatorPublisher"],
            json!(cfg.trust.generator_publisher)
        );
    }

    #[test]
    fn test_all_succeeded() {
        assert!(!all_succeeded(&[]));
        let ok = PluginOutput::success(
            "result",
            crate::plugins::output::ResultType::String,
            json!("x"),
            "",
        );
        assert!(all_succeeded(std::slice::from_ref(&ok)));
        let failed = PluginOutput::failure(crate::plugins::error::ErrorKind::SandboxCrash, "boom");
        assert!(!all_succeeded(&[ok, failed]));
    }
}
