#![no_main]

use std::sync::LazyLock;

use libfuzzer_sys::fuzz_target;

use capdispatch::plugins::output::normalize_outputs;
use capdispatch::plugins::signature::{canonical_payload, TrustConfig, TrustVerifier};
use capdispatch::plugins::CapabilityManifest;

static VERIFIER: LazyLock<TrustVerifier> = LazyLock::new(|| {
    let mut config = TrustConfig::default();
    config.generator_secret = Some("fuzz-generator-secret".to_string());
    config.trusted_publishers.insert(
        "fuzz".to_string(),
        "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a".to_string(),
    );
    TrustVerifier::new(config)
});

fuzz_target!(|data: &str| {
    // Manifest parsing and trust checks must reject, never panic.
    if let Ok(manifest) = CapabilityManifest::from_json(data) {
        let _ = canonical_payload(&manifest);
        let _ = VERIFIER.verify(&manifest);
        let _ = manifest.sandbox_options().timeout();
        let _ = manifest.sandbox_options().memory_limit_bytes();
    }

    // The same bytes as a capability result.
    if let Ok(value) = serde_json::from_str(data) {
        let _ = normalize_outputs(value, true);
    }
});
