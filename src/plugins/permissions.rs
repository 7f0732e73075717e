//! Permission model for capabilities.
//!
//! A manifest declares a set of permission tokens. The trust gate rejects any
//! token it does not recognize; a small subset of recognized tokens is
//! flagged as dangerous, which is logged and audited but never blocks,
//! because some first-party capabilities legitimately need them.
//!
//! At runtime the [`PermissionEnforcer`] consults the granted tokens and the
//! manifest's sandbox options on every host call (fetch, filesystem, env).
//!
//! ```text
//! manifest.security.permissions ──► validate_permissions (load time)
//!                │
//!                ▼
//!        PermissionGrants + SandboxOptions
//!                │
//!                ▼
//!        PermissionEnforcer ◄── host bridge, per call
//! ```

use std::collections::BTreeSet;

use regex::Regex;

use super::manifest::{CapabilityManifest, SandboxOptions};

pub const FS_READ: &str = "fs.read";
pub const FS_WRITE: &str = "fs.write";
pub const FS_UNRESTRICTED: &str = "fs.unrestricted";
pub const NET_FETCH: &str = "net.fetch";
pub const NET_UNRESTRICTED: &str = "net.unrestricted";
pub const ENV_READ: &str = "env.read";
pub const PROCESS_SPAWN: &str = "process.spawn";
pub const CREDENTIALS_READ: &str = "credentials.read";
pub const BRAIN_INVOKE: &str = "brain.invoke";

/// Every permission token the trust gate accepts.
pub const RECOGNIZED_PERMISSIONS: &[&str] = &[
    FS_READ,
    FS_WRITE,
    FS_UNRESTRICTED,
    NET_FETCH,
    NET_UNRESTRICTED,
    ENV_READ,
    PROCESS_SPAWN,
    CREDENTIALS_READ,
    BRAIN_INVOKE,
];

/// Tokens that are logged as dangerous. Advisory only.
pub const DANGEROUS_PERMISSIONS: &[&str] = &[FS_UNRESTRICTED, NET_UNRESTRICTED, PROCESS_SPAWN];

/// Errors from permission validation and enforcement.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionError {
    /// A declared token is not recognized.
    UnknownPermission { permission: String },
    /// A host call needs a permission the manifest does not declare.
    NotGranted {
        capability_id: String,
        permission: String,
        operation: String,
    },
    /// A fetch destination is outside the allowed domains.
    DomainDenied {
        capability_id: String,
        host: String,
    },
    /// A global API is not listed in `allowedAPIs`.
    ApiNotAllowed {
        capability_id: String,
        api: String,
    },
}

impl std::fmt::Display for PermissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionError::UnknownPermission { permission } => {
                write!(f, "unrecognized permission '{}'", permission)
            }
            PermissionError::NotGranted {
                capability_id,
                permission,
                operation,
            } => write!(
                f,
                "capability '{}' needs permission '{}' for {}",
                capability_id, permission, operation
            ),
            PermissionError::DomainDenied {
                capability_id,
                host,
            } => write!(
                f,
                "capability '{}' may not contact host '{}': not in allowedDomains",
                capability_id, host
            ),
            PermissionError::ApiNotAllowed { capability_id, api } => write!(
                f,
                "capability '{}' may not use API '{}': not in allowedAPIs",
                capability_id, api
            ),
        }
    }
}

impl std::error::Error for PermissionError {}

/// Validate declared tokens. Returns one error per unrecognized token.
pub fn validate_permissions(permissions: &BTreeSet<String>) -> Vec<PermissionError> {
    permissions
        .iter()
        .filter(|p| !RECOGNIZED_PERMISSIONS.contains(&p.as_str()))
        .map(|p| PermissionError::UnknownPermission {
            permission: p.clone(),
        })
        .collect()
}

/// The dangerous tokens among a declared set.
pub fn dangerous_permissions(permissions: &BTreeSet<String>) -> Vec<&str> {
    permissions
        .iter()
        .map(String::as_str)
        .filter(|p| DANGEROUS_PERMISSIONS.contains(p))
        .collect()
}

// ============== Domain Matching ==============

/// Matches hosts against an `allowedDomains` list.
///
/// A plain entry matches the domain itself and any subdomain. An entry with
/// `*` is a glob where `*` matches within a single label.
#[derive(Debug, Clone)]
pub struct DomainMatcher {
    exact: Vec<String>,
    globs: Vec<Regex>,
}

impl DomainMatcher {
    pub fn new(domains: &[String]) -> Self {
        let mut exact = Vec::new();
        let mut globs = Vec::new();
        for domain in domains {
            let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
            if domain.is_empty() {
                continue;
            }
            if domain.contains('*') {
                match Regex::new(&glob_to_regex(&domain)) {
                    Ok(re) => globs.push(re),
                    Err(e) => {
                        tracing::warn!(pattern = %domain, error = %e, "invalid domain pattern");
                    }
                }
            } else {
                exact.push(domain);
            }
        }
        Self { exact, globs }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.globs.is_empty()
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.exact
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
            || self.globs.iter().any(|re| re.is_match(&host))
    }
}

/// Convert a host glob to an anchored regex. `*` stays inside one label.
fn glob_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    format!("^{}$", escaped.replace(r"\*", "[^.]*"))
}

// ============== Runtime Enforcement ==============

/// Permissions granted to one capability, resolved once per invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionGrants {
    pub fs_read: bool,
    pub fs_write: bool,
    pub fs_unrestricted: bool,
    pub net_fetch: bool,
    pub net_unrestricted: bool,
    pub env_read: bool,
    pub process_spawn: bool,
    pub credentials_read: bool,
    pub brain_invoke: bool,
}

impl PermissionGrants {
    pub fn from_tokens(tokens: &BTreeSet<String>) -> Self {
        let has = |t: &str| tokens.contains(t);
        Self {
            fs_read: has(FS_READ) || has(FS_WRITE) || has(FS_UNRESTRICTED),
            fs_write: has(FS_WRITE) || has(FS_UNRESTRICTED),
            fs_unrestricted: has(FS_UNRESTRICTED),
            net_fetch: has(NET_FETCH) || has(NET_UNRESTRICTED),
            net_unrestricted: has(NET_UNRESTRICTED),
            env_read: has(ENV_READ),
            process_spawn: has(PROCESS_SPAWN),
            credentials_read: has(CREDENTIALS_READ),
            brain_invoke: has(BRAIN_INVOKE),
        }
    }
}

/// Runtime permission enforcer, consulted on every host call.
#[derive(Debug, Clone)]
pub struct PermissionEnforcer {
    capability_id: String,
    grants: PermissionGrants,
    domains: DomainMatcher,
    options: SandboxOptions,
}

impl PermissionEnforcer {
    pub fn new(manifest: &CapabilityManifest) -> Self {
        let options = manifest.sandbox_options().clone();
        Self {
            capability_id: manifest.id.clone(),
            grants: PermissionGrants::from_tokens(manifest.permissions()),
            domains: DomainMatcher::new(&options.allowed_domains),
            options,
        }
    }

    pub fn capability_id(&self) -> &str {
        &self.capability_id
    }

    pub fn grants(&self) -> &PermissionGrants {
        &self.grants
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    fn not_granted(&self, permission: &str, operation: &str) -> PermissionError {
        PermissionError::NotGranted {
            capability_id: self.capability_id.clone(),
            permission: permission.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Check a global API against `allowedAPIs`.
    pub fn check_api(&self, api: &str) -> Result<(), PermissionError> {
        if self.options.allows_api(api) {
            Ok(())
        } else {
            Err(PermissionError::ApiNotAllowed {
                capability_id: self.capability_id.clone(),
                api: api.to_string(),
            })
        }
    }

    /// Check a fetch destination host.
    ///
    /// `net.unrestricted` skips the domain list; `net.fetch` requires the host
    /// (or a parent domain) to be listed.
    pub fn check_fetch(&self, host: &str) -> Result<(), PermissionError> {
        if !self.grants.net_fetch {
            return Err(self.not_granted(NET_FETCH, "fetch"));
        }
        if self.grants.net_unrestricted {
            return Ok(());
        }
        if self.domains.matches(host) {
            Ok(())
        } else {
            Err(PermissionError::DomainDenied {
                capability_id: self.capability_id.clone(),
                host: host.to_string(),
            })
        }
    }

    pub fn check_fs_read(&self) -> Result<(), PermissionError> {
        if self.grants.fs_read {
            Ok(())
        } else {
            Err(self.not_granted(FS_READ, "filesystem read"))
        }
    }

    pub fn check_fs_write(&self) -> Result<(), PermissionError> {
        if self.grants.fs_write {
            Ok(())
        } else {
            Err(self.not_granted(FS_WRITE, "filesystem write"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::manifest::{EntryPoint, Language, SecurityBlock};

    fn tokens(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn manifest(perms: &[&str], domains: &[&str]) -> CapabilityManifest {
        CapabilityManifest {
            id: "cap".to_string(),
            verb: "FETCH".to_string(),
            version: "1.0.0".to_string(),
            language: Language::JavaScript,
            description: String::new(),
            entry_point: EntryPoint::default(),
            security: SecurityBlock {
                permissions: tokens(perms),
                sandbox_options: SandboxOptions {
                    allowed_domains: domains.iter().map(|s| s.to_string()).collect(),
                    ..SandboxOptions::default()
                },
                ..SecurityBlock::default()
            },
            configuration: Vec::new(),
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
        }
    }

    // ============== Validation ==============

    #[test]
    fn test_validate_recognized_tokens() {
        let all: BTreeSet<String> = RECOGNIZED_PERMISSIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(validate_permissions(&all).is_empty());
    }

    #[test]
    fn test_validate_rejects_each_unknown_token() {
        let errors = validate_permissions(&tokens(&["fs.read", "fs.delete", "net.raw"]));
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&PermissionError::UnknownPermission {
            permission: "fs.delete".to_string()
        }));
    }

    #[test]
    fn test_dangerous_subset() {
        let perms = tokens(&["fs.read", "process.spawn", "net.unrestricted"]);
        let found = dangerous_permissions(&perms);
        assert_eq!(found, vec!["net.unrestricted", "process.spawn"]);
    }

    // ============== Domains ==============

    #[test]
    fn test_domain_matcher_subdomains() {
        let m = DomainMatcher::new(&["example.com".to_string()]);
        assert!(m.matches("example.com"));
        assert!(m.matches("api.example.com"));
        assert!(m.matches("API.Example.com."));
        assert!(!m.matches("notexample.com"));
        assert!(!m.matches("example.com.evil.net"));
    }

    #[test]
    fn test_domain_matcher_glob_single_label() {
        let m = DomainMatcher::new(&["*.svc.example.com".to_string()]);
        assert!(m.matches("a.svc.example.com"));
        assert!(!m.matches("a.b.svc.example.com"));
        assert!(!m.matches("svc.example.com"));
    }

    #[test]
    fn test_domain_matcher_empty() {
        let m = DomainMatcher::new(&[" ".to_string()]);
        assert!(m.is_empty());
        assert!(!m.matches("example.com"));
    }

    // ============== Enforcer ==============

    #[test]
    fn test_fetch_requires_permission() {
        let enforcer = PermissionEnforcer::new(&manifest(&[], &["example.com"]));
        assert!(matches!(
            enforcer.check_fetch("example.com"),
            Err(PermissionError::NotGranted { .. })
        ));
    }

    #[test]
    fn test_fetch_checks_domains() {
        let enforcer = PermissionEnforcer::new(&manifest(&["net.fetch"], &["example.com"]));
        assert!(enforcer.check_fetch("api.example.com").is_ok());
        assert!(matches!(
            enforcer.check_fetch("evil.net"),
            Err(PermissionError::DomainDenied { .. })
        ));
    }

    #[test]
    fn test_fetch_unrestricted_skips_domains() {
        let enforcer = PermissionEnforcer::new(&manifest(&["net.unrestricted"], &[]));
        assert!(enforcer.check_fetch("anything.example").is_ok());
    }

    #[test]
    fn test_fs_write_implies_read() {
        let enforcer = PermissionEnforcer::new(&manifest(&["fs.write"], &[]));
        assert!(enforcer.check_fs_read().is_ok());
        assert!(enforcer.check_fs_write().is_ok());

        let enforcer = PermissionEnforcer::new(&manifest(&["fs.read"], &[]));
        assert!(enforcer.check_fs_read().is_ok());
        assert!(enforcer.check_fs_write().is_err());
    }

    #[test]
    fn test_check_api_default_set() {
        let enforcer = PermissionEnforcer::new(&manifest(&[], &[]));
        assert!(enforcer.check_api("console").is_ok());
        assert!(enforcer.check_api("fetch").is_err());
    }

    #[test]
    fn test_error_display() {
        let err = PermissionError::DomainDenied {
            capability_id: "cap".to_string(),
            host: "evil.net".to_string(),
        };
        assert!(err.to_string().contains("evil.net"));
        assert!(err.to_string().contains("allowedDomains"));
    }
}
