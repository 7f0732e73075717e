//! Manifest trust verification.
//!
//! Every manifest must carry a signature over its canonical payload before any
//! of its code runs. Two publisher classes are recognized:
//!
//! - The built-in capability generator signs with a deterministic SHA-256
//!   digest of the payload (HMAC-SHA256 when a generator secret is configured).
//! - External publishers sign with Ed25519; their hex-encoded public keys come
//!   from the trusted-publisher registry in the configuration. An unknown
//!   publisher fails closed.
//!
//! The canonical payload is the compact JSON encoding of
//! `{entryPoint, id, permissions, sandboxOptions, verb}` with object keys
//! sorted recursively, so key order in the stored manifest never matters.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::error::DispatchError;
use super::manifest::CapabilityManifest;
use super::permissions;

/// Publisher name used by manifests the capability generator produces.
pub const DEFAULT_GENERATOR_PUBLISHER: &str = "capability-generator";

/// Trust configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustConfig {
    /// Publisher name whose manifests are verified by digest.
    #[serde(default = "default_generator_publisher")]
    pub generator_publisher: String,
    /// When set, generator digests are HMAC-SHA256 keyed with this secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_secret: Option<String>,
    /// Publisher name -> hex-encoded Ed25519 public key.
    #[serde(default)]
    pub trusted_publishers: HashMap<String, String>,
}

fn default_generator_publisher() -> String {
    DEFAULT_GENERATOR_PUBLISHER.to_string()
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            generator_publisher: default_generator_publisher(),
            generator_secret: None,
            trusted_publishers: HashMap::new(),
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Build the canonical signing payload of a manifest.
pub fn canonical_payload(manifest: &CapabilityManifest) -> Vec<u8> {
    let permissions: Vec<&String> = manifest.permissions().iter().collect();
    let payload = serde_json::json!({
        "entryPoint": manifest.entry_point,
        "id": manifest.id,
        "permissions": permissions,
        "sandboxOptions": manifest.sandbox_options(),
        "verb": manifest.verb,
    });
    let mut out = String::new();
    write_canonical(&payload, &mut out);
    out.into_bytes()
}

/// Compact JSON with object keys emitted in sorted order at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Digest signature used for generator-published manifests.
pub fn generator_signature(manifest: &CapabilityManifest, secret: Option<&str>) -> String {
    let payload = canonical_payload(manifest);
    match secret.filter(|s| !s.is_empty()) {
        Some(secret) => {
            // HMAC accepts keys of any length
            let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
                Ok(mac) => mac,
                Err(_) => return hex::encode(Sha256::digest(&payload)),
            };
            mac.update(&payload);
            hex::encode(mac.finalize().into_bytes())
        }
        None => hex::encode(Sha256::digest(&payload)),
    }
}

/// Sign a manifest's canonical payload with an Ed25519 key.
///
/// Returns the hex-encoded 64-byte signature.
pub fn sign_manifest(manifest: &CapabilityManifest, signing_key: &SigningKey) -> String {
    let signature: Signature = signing_key.sign(&canonical_payload(manifest));
    hex::encode(signature.to_bytes())
}

/// Parse a hex-encoded Ed25519 verifying key.
pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, DispatchError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| DispatchError::SignatureInvalid(format!("invalid hex public key: {e}")))?;

    let key_bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        DispatchError::SignatureInvalid(format!(
            "public key must be 32 bytes, got {}",
            bytes.len()
        ))
    })?;

    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| DispatchError::SignatureInvalid(format!("invalid Ed25519 public key: {e}")))
}

/// Parse a hex-encoded Ed25519 signature.
fn parse_signature(hex_sig: &str) -> Result<Signature, DispatchError> {
    let bytes = hex::decode(hex_sig.trim())
        .map_err(|e| DispatchError::SignatureInvalid(format!("invalid hex signature: {e}")))?;

    let sig_bytes: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
        DispatchError::SignatureInvalid(format!(
            "signature must be 64 bytes, got {}",
            bytes.len()
        ))
    })?;

    Ok(Signature::from_bytes(&sig_bytes))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Gatekeeper applied to every manifest before execution.
#[derive(Debug, Clone)]
pub struct TrustVerifier {
    config: TrustConfig,
    publisher_keys: HashMap<String, VerifyingKey>,
}

impl TrustVerifier {
    /// Build a verifier. Publisher keys that fail to parse are dropped with a
    /// warning, which makes that publisher unknown (fail closed).
    pub fn new(config: TrustConfig) -> Self {
        let mut publisher_keys = HashMap::new();
        for (publisher, key_hex) in &config.trusted_publishers {
            match parse_verifying_key(key_hex) {
                Ok(key) => {
                    publisher_keys.insert(publisher.clone(), key);
                }
                Err(e) => {
                    tracing::warn!(
                        publisher = %publisher,
                        error = %e,
                        "ignoring trusted publisher with unparseable key"
                    );
                }
            }
        }
        Self {
            config,
            publisher_keys,
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Full trust gate: signature, then permission set.
    pub fn verify(&self, manifest: &CapabilityManifest) -> Result<(), DispatchError> {
        self.verify_signature(manifest)?;
        self.verify_permissions(manifest)
    }

    /// Check the manifest signature.
    ///
    /// - No signature -> `Unsigned`, unconditionally.
    /// - Generator publisher -> digest comparison.
    /// - Any other publisher -> Ed25519 against the registered key; missing
    ///   or unknown publishers are rejected.
    pub fn verify_signature(&self, manifest: &CapabilityManifest) -> Result<(), DispatchError> {
        let Some(signature) = manifest.signature() else {
            return Err(DispatchError::Unsigned(manifest.id.clone()));
        };

        let publisher = manifest.publisher().ok_or_else(|| {
            DispatchError::SignatureInvalid(format!(
                "manifest {} is signed but names no publisher",
                manifest.id
            ))
        })?;

        if publisher == self.config.generator_publisher {
            let expected =
                generator_signature(manifest, self.config.generator_secret.as_deref());
            let provided = signature.trim().to_ascii_lowercase();
            if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
                return Err(DispatchError::SignatureInvalid(format!(
                    "generator digest mismatch for manifest {}",
                    manifest.id
                )));
            }
        } else {
            let key = self.publisher_keys.get(publisher).ok_or_else(|| {
                DispatchError::SignatureInvalid(format!(
                    "publisher {publisher} is not in the trusted publishers registry"
                ))
            })?;
            let signature = parse_signature(signature)?;
            key.verify(&canonical_payload(manifest), &signature)
                .map_err(|e| {
                    DispatchError::SignatureInvalid(format!(
                        "Ed25519 verification failed for manifest {}: {e}",
                        manifest.id
                    ))
                })?;
        }

        tracing::debug!(
            capability_id = %manifest.id,
            publisher = %publisher,
            "manifest signature verification passed"
        );
        Ok(())
    }

    /// Reject unrecognized permission tokens. Dangerous tokens pass.
    pub fn verify_permissions(&self, manifest: &CapabilityManifest) -> Result<(), DispatchError> {
        let errors = permissions::validate_permissions(manifest.permissions());
        if errors.is_empty() {
            return Ok(());
        }
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(DispatchError::PermissionDenied(joined))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugins::error::ErrorKind;
    use crate::plugins::manifest::{EntryPoint, Language, SecurityBlock};

    pub(crate) fn generate_keypair() -> (SigningKey, VerifyingKey) {
        let mut secret = [0u8; 32];
        getrandom::getrandom(&mut secret).expect("failed to generate random bytes");
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        (signing_key, verifying_key)
    }

    fn manifest(publisher: Option<&str>) -> CapabilityManifest {
        CapabilityManifest {
            id: "plugin-echo".to_string(),
            verb: "ECHO".to_string(),
            version: "1.0.0".to_string(),
            language: Language::JavaScript,
            description: String::new(),
            entry_point: EntryPoint {
                main: "index.js".to_string(),
                source: Some("function execute() { return []; }".to_string()),
                ..EntryPoint::default()
            },
            security: SecurityBlock {
                trust: crate::plugins::manifest::TrustInfo {
                    signature: None,
                    publisher: publisher.map(String::from),
                },
                permissions: ["net.fetch".to_string()].into_iter().collect(),
                ..SecurityBlock::default()
            },
            configuration: Vec::new(),
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
        }
    }

    fn flip_first_hex_digit(s: &str) -> String {
        let mut chars: Vec<char> = s.chars().collect();
        chars[0] = if chars[0] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    // ==================== Canonical Payload ====================

    #[test]
    fn test_canonical_payload_sorted_and_compact() {
        let m = manifest(None);
        let payload = String::from_utf8(canonical_payload(&m)).unwrap();
        assert!(payload.starts_with("{\"entryPoint\":"));
        let id_pos = payload.find("\"id\":").unwrap();
        let perm_pos = payload.find("\"permissions\":").unwrap();
        let sandbox_pos = payload.find("\"sandboxOptions\":").unwrap();
        let verb_pos = payload.find("\"verb\":").unwrap();
        assert!(id_pos < perm_pos && perm_pos < sandbox_pos && sandbox_pos < verb_pos);
        assert!(!payload.contains(": "));
    }

    #[test]
    fn test_canonical_payload_ignores_trust_block() {
        let a = manifest(Some("x"));
        let mut b = a.clone();
        b.security.trust.signature = Some("deadbeef".to_string());
        b.description = "changed".to_string();
        assert_eq!(canonical_payload(&a), canonical_payload(&b));
    }

    #[test]
    fn test_canonical_payload_nested_keys_sorted() {
        let mut out = String::new();
        write_canonical(&serde_json::json!({"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": null}), &mut out);
        assert_eq!(out, r#"{"a":null,"b":{"a":[{"x":1,"y":2}],"z":1}}"#);
    }

    // ==================== Unsigned ====================

    #[test]
    fn test_unsigned_fails_immediately() {
        let verifier = TrustVerifier::new(TrustConfig::default());
        let err = verifier.verify(&manifest(None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsigned);
    }

    // ==================== Generator Digest ====================

    #[test]
    fn test_generator_digest_accepted() {
        let verifier = TrustVerifier::new(TrustConfig::default());
        let mut m = manifest(Some(DEFAULT_GENERATOR_PUBLISHER));
        m.security.trust.signature = Some(generator_signature(&m, None));
        assert!(verifier.verify(&m).is_ok());
    }

    #[test]
    fn test_generator_digest_tampered_signature() {
        let verifier = TrustVerifier::new(TrustConfig::default());
        let mut m = manifest(Some(DEFAULT_GENERATOR_PUBLISHER));
        let sig = generator_signature(&m, None);
        m.security.trust.signature = Some(flip_first_hex_digit(&sig));
        let err = verifier.verify(&m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
    }

    #[test]
    fn test_generator_digest_tampered_payload() {
        let verifier = TrustVerifier::new(TrustConfig::default());
        let mut m = manifest(Some(DEFAULT_GENERATOR_PUBLISHER));
        m.security.trust.signature = Some(generator_signature(&m, None));
        m.verb = "ECHP".to_string();
        assert!(verifier.verify(&m).is_err());
    }

    #[test]
    fn test_generator_hmac_requires_secret() {
        let config = TrustConfig {
            generator_secret: Some("s3cret".to_string()),
            ..TrustConfig::default()
        };
        let verifier = TrustVerifier::new(config);
        let mut m = manifest(Some(DEFAULT_GENERATOR_PUBLISHER));

        m.security.trust.signature = Some(generator_signature(&m, None));
        assert!(verifier.verify(&m).is_err());

        m.security.trust.signature = Some(generator_signature(&m, Some("s3cret")));
        assert!(verifier.verify(&m).is_ok());
    }

    #[test]
    fn test_generator_digest_case_insensitive() {
        let verifier = TrustVerifier::new(TrustConfig::default());
        let mut m = manifest(Some(DEFAULT_GENERATOR_PUBLISHER));
        m.security.trust.signature = Some(generator_signature(&m, None).to_ascii_uppercase());
        assert!(verifier.verify(&m).is_ok());
    }

    // ==================== Ed25519 Publishers ====================

    fn verifier_trusting(name: &str, key: &VerifyingKey) -> TrustVerifier {
        let mut config = TrustConfig::default();
        config
            .trusted_publishers
            .insert(name.to_string(), hex::encode(key.as_bytes()));
        TrustVerifier::new(config)
    }

    #[test]
    fn test_ed25519_roundtrip() {
        let (signing_key, verifying_key) = generate_keypair();
        let verifier = verifier_trusting("acme", &verifying_key);
        let mut m = manifest(Some("acme"));
        m.security.trust.signature = Some(sign_manifest(&m, &signing_key));
        assert!(verifier.verify(&m).is_ok());
    }

    #[test]
    fn test_ed25519_single_bit_flip_in_signature() {
        let (signing_key, verifying_key) = generate_keypair();
        let verifier = verifier_trusting("acme", &verifying_key);
        let mut m = manifest(Some("acme"));
        let sig = sign_manifest(&m, &signing_key);
        let mut bytes = hex::decode(&sig).unwrap();
        bytes[10] ^= 0x01;
        m.security.trust.signature = Some(hex::encode(bytes));
        let err = verifier.verify(&m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
    }

    #[test]
    fn test_ed25519_payload_tamper() {
        let (signing_key, verifying_key) = generate_keypair();
        let verifier = verifier_trusting("acme", &verifying_key);
        let mut m = manifest(Some("acme"));
        m.security.trust.signature = Some(sign_manifest(&m, &signing_key));
        m.security
            .sandbox_options
            .allowed_domains
            .push("evil.example".to_string());
        assert!(verifier.verify(&m).is_err());
    }

    #[test]
    fn test_unknown_publisher_fails_closed() {
        let (signing_key, _) = generate_keypair();
        let verifier = TrustVerifier::new(TrustConfig::default());
        let mut m = manifest(Some("stranger"));
        m.security.trust.signature = Some(sign_manifest(&m, &signing_key));
        let err = verifier.verify(&m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
        assert!(err.to_string().contains("stranger"));
    }

    #[test]
    fn test_missing_publisher_fails() {
        let verifier = TrustVerifier::new(TrustConfig::default());
        let mut m = manifest(None);
        m.security.trust.signature = Some("00".repeat(64));
        assert_eq!(
            verifier.verify(&m).unwrap_err().kind(),
            ErrorKind::SignatureInvalid
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let (signing_key, _) = generate_keypair();
        let (_, other_key) = generate_keypair();
        let verifier = verifier_trusting("acme", &other_key);
        let mut m = manifest(Some("acme"));
        m.security.trust.signature = Some(sign_manifest(&m, &signing_key));
        assert!(verifier.verify(&m).is_err());
    }

    #[test]
    fn test_bad_publisher_key_is_ignored() {
        let mut config = TrustConfig::default();
        config
            .trusted_publishers
            .insert("broken".to_string(), "zz-not-hex".to_string());
        let verifier = TrustVerifier::new(config);
        let mut m = manifest(Some("broken"));
        m.security.trust.signature = Some("00".repeat(64));
        assert!(verifier.verify(&m).is_err());
    }

    // ==================== Permissions ====================

    #[test]
    fn test_unknown_permission_rejected() {
        let verifier = TrustVerifier::new(TrustConfig::default());
        let mut m = manifest(Some(DEFAULT_GENERATOR_PUBLISHER));
        m.security.permissions.insert("root.everything".to_string());
        m.security.trust.signature = Some(generator_signature(&m, None));
        let err = verifier.verify(&m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("root.everything"));
    }

    #[test]
    fn test_dangerous_permission_does_not_block() {
        let verifier = TrustVerifier::new(TrustConfig::default());
        let mut m = manifest(Some(DEFAULT_GENERATOR_PUBLISHER));
        m.security.permissions.insert("process.spawn".to_string());
        m.security.trust.signature = Some(generator_signature(&m, None));
        assert!(verifier.verify(&m).is_ok());
    }

    // ==================== Key / Signature Parsing ====================

    #[test]
    fn test_parse_verifying_key_valid() {
        let (_, verifying_key) = generate_keypair();
        let parsed = parse_verifying_key(&hex::encode(verifying_key.as_bytes())).unwrap();
        assert_eq!(parsed.as_bytes(), verifying_key.as_bytes());
    }

    #[test]
    fn test_parse_verifying_key_invalid_hex() {
        assert!(parse_verifying_key("not-hex-data!").is_err());
    }

    #[test]
    fn test_parse_verifying_key_wrong_length() {
        assert!(parse_verifying_key(&hex::encode([0u8; 16])).is_err());
    }

    #[test]
    fn test_parse_signature_wrong_length() {
        assert!(parse_signature(&hex::encode([0u8; 32])).is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: TrustConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.generator_publisher, DEFAULT_GENERATOR_PUBLISHER);
        assert!(config.generator_secret.is_none());
        assert!(config.trusted_publishers.is_empty());
    }
}
