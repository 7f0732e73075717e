//! Credential providers for capability invocations.
//!
//! The dispatcher asks for a bearer token per audience before running a
//! capability. Providers never fail: a missing token is `None`, and the
//! invocation proceeds without it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

/// Audience for the token every capability receives.
pub const AUDIENCE_CAPABILITIES: &str = "capabilities";

/// Audience for the extra token handed to the reasoning capability.
pub const AUDIENCE_BRAIN: &str = "brain";

/// Environment variable prefix used by [`EnvCredentialProvider`].
pub const TOKEN_ENV_PREFIX: &str = "CAPDISPATCH_TOKEN_";

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self, audience: &str) -> Option<String>;
}

/// Reads `CAPDISPATCH_TOKEN_<AUDIENCE>` (audience upper-cased, other
/// characters mapped to `_`).
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    prefix: String,
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self {
            prefix: TOKEN_ENV_PREFIX.to_string(),
        }
    }
}

impl EnvCredentialProvider {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, audience: &str) -> String {
        let suffix: String = audience
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_token(&self, audience: &str) -> Option<String> {
        std::env::var(self.variable_for(audience))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Fixed tokens, for tests and embedding.
#[derive(Debug, Default)]
pub struct StaticCredentialProvider {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, audience: &str, token: &str) -> Self {
        self.set_token(audience, token);
        self
    }

    pub fn set_token(&self, audience: &str, token: &str) {
        self.tokens
            .write()
            .insert(audience.to_string(), token.to_string());
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_token(&self, audience: &str) -> Option<String> {
        self.tokens.read().get(audience).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_variable_names() {
        let provider = EnvCredentialProvider::default();
        assert_eq!(
            provider.variable_for("capabilities"),
            "CAPDISPATCH_TOKEN_CAPABILITIES"
        );
        assert_eq!(provider.variable_for("brain-v2"), "CAPDISPATCH_TOKEN_BRAIN_V2");
    }

    #[tokio::test]
    async fn test_env_provider_reads_and_trims() {
        let provider = EnvCredentialProvider::with_prefix("CAPDISPATCH_TEST_CRED_");
        std::env::set_var("CAPDISPATCH_TEST_CRED_ALPHA", "  tok-a \n");
        std::env::set_var("CAPDISPATCH_TEST_CRED_EMPTY", "   ");
        assert_eq!(provider.get_token("alpha").await.as_deref(), Some("tok-a"));
        assert_eq!(provider.get_token("empty").await, None);
        assert_eq!(provider.get_token("missing").await, None);
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticCredentialProvider::new().with_token(AUDIENCE_BRAIN, "b");
        assert_eq!(provider.get_token(AUDIENCE_BRAIN).await.as_deref(), Some("b"));
        assert_eq!(provider.get_token(AUDIENCE_CAPABILITIES).await, None);
    }
}
