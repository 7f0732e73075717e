//! Capability enforcement for sandboxed code.
//!
//! - SSRF protection: block private IPv4/IPv6 ranges, localhost, cloud
//!   metadata endpoints, non-HTTP schemes
//! - Rate limiting: per-capability fetch (100/min) and log (1000/min) budgets
//! - Path validation: the filesystem facade's allow-list gate

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Maximum fetch requests per capability per minute
pub const HTTP_RATE_LIMIT_PER_MINUTE: usize = 100;

/// Maximum log messages per capability per minute
pub const LOG_RATE_LIMIT_PER_MINUTE: usize = 1000;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Path segments rejected regardless of the allow-list.
pub const SENSITIVE_PATH_SEGMENTS: &[&str] = &[
    ".ssh", ".gnupg", ".aws", ".git", ".env", ".kube", ".docker", "etc", "proc", "sys", "dev",
    "root",
];

/// Capability enforcement errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("SSRF protection: blocked request to {0}")]
    SsrfBlocked(String),

    #[error("fetch rate limit exceeded ({0} requests/minute)")]
    HttpRateLimitExceeded(usize),

    #[error("log rate limit exceeded ({0} messages/minute)")]
    LogRateLimitExceeded(usize),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("protocol not allowed: {0} (only http/https allowed)")]
    ProtocolNotAllowed(String),

    #[error("path rejected: {0}")]
    PathRejected(String),
}

// ============== Rate Limiting ==============

/// Sliding one-minute window over event instants.
#[derive(Debug, Default, Clone)]
struct SlidingWindow {
    events: VecDeque<Instant>,
}

impl SlidingWindow {
    fn try_record(&mut self, now: Instant, limit: usize) -> bool {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() >= limit {
            return false;
        }
        self.events.push_back(now);
        true
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

/// Fetch and log budgets of one capability.
#[derive(Debug, Default, Clone)]
pub struct CapabilityRateLimiter {
    http: SlidingWindow,
    log: SlidingWindow,
}

impl CapabilityRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a fetch is allowed, and record it if so
    pub fn check_http_request(&mut self) -> Result<(), CapabilityError> {
        if self
            .http
            .try_record(Instant::now(), HTTP_RATE_LIMIT_PER_MINUTE)
        {
            Ok(())
        } else {
            Err(CapabilityError::HttpRateLimitExceeded(
                HTTP_RATE_LIMIT_PER_MINUTE,
            ))
        }
    }

    /// Check if a log message is allowed, and record it if so
    pub fn check_log_message(&mut self) -> Result<(), CapabilityError> {
        if self.log.try_record(Instant::now(), LOG_RATE_LIMIT_PER_MINUTE) {
            Ok(())
        } else {
            Err(CapabilityError::LogRateLimitExceeded(
                LOG_RATE_LIMIT_PER_MINUTE,
            ))
        }
    }

    pub fn http_request_count(&self) -> usize {
        self.http.len()
    }

    pub fn log_message_count(&self) -> usize {
        self.log.len()
    }
}

/// Rate limiters keyed by capability id, shared across invocations so a
/// capability cannot reset its budget by being invoked again.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, CapabilityRateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record a fetch for a capability
    pub fn check_http_request(&self, capability_id: &str) -> Result<(), CapabilityError> {
        let mut limiters = self.limiters.lock();
        limiters
            .entry(capability_id.to_string())
            .or_default()
            .check_http_request()
    }

    /// Check and record a log message for a capability
    pub fn check_log_message(&self, capability_id: &str) -> Result<(), CapabilityError> {
        let mut limiters = self.limiters.lock();
        limiters
            .entry(capability_id.to_string())
            .or_default()
            .check_log_message()
    }

    pub fn http_request_count(&self, capability_id: &str) -> usize {
        self.limiters
            .lock()
            .get(capability_id)
            .map(|l| l.http_request_count())
            .unwrap_or(0)
    }
}

// ============== SSRF ==============

/// SSRF protection configuration
#[derive(Debug, Clone, Default)]
pub struct SsrfConfig {
    /// Permit the 100.64.0.0/10 CGNAT range (used by overlay networks).
    pub allow_cgnat: bool,
}

/// SSRF protection for sandbox fetches
///
/// URL validation alone does not stop DNS rebinding. Callers must also
/// resolve the host, run [`SsrfProtection::validate_resolved_ip`] on every
/// address, and connect to the validated address only.
pub struct SsrfProtection;

/// (first octet, second-octet range, third octet) blocks.
const BLOCKED_V4: &[(u8, std::ops::RangeInclusive<u8>, Option<u8>)] = &[
    (0, 0..=255, None),         // current network
    (10, 0..=255, None),        // private
    (127, 0..=255, None),       // loopback
    (169, 254..=254, None),     // link-local
    (172, 16..=31, None),       // private
    (192, 168..=168, None),     // private
    (192, 0..=0, Some(0)),      // IETF assignments
    (192, 0..=0, Some(2)),      // TEST-NET-1
    (198, 18..=19, None),       // benchmarking
    (198, 51..=51, Some(100)),  // TEST-NET-2
    (203, 0..=0, Some(113)),    // TEST-NET-3
];

impl SsrfProtection {
    /// Validate a URL with the default config
    pub fn validate_url(url: &str) -> Result<url::Url, CapabilityError> {
        Self::validate_url_with_config(url, &SsrfConfig::default())
    }

    /// Validate scheme and literal host of a URL. Returns the parsed URL.
    pub fn validate_url_with_config(
        url: &str,
        config: &SsrfConfig,
    ) -> Result<url::Url, CapabilityError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| CapabilityError::InvalidUrl(format!("{url}: {e}")))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CapabilityError::ProtocolNotAllowed(
                parsed.scheme().to_string(),
            ));
        }

        let host = match parsed.host() {
            Some(url::Host::Domain(d)) => d.to_ascii_lowercase(),
            Some(url::Host::Ipv4(ip)) => {
                Self::check_ip(&IpAddr::V4(ip), config)?;
                return Ok(parsed);
            }
            Some(url::Host::Ipv6(ip)) => {
                Self::check_ip(&IpAddr::V6(ip), config)?;
                return Ok(parsed);
            }
            None => return Err(CapabilityError::InvalidUrl("no host in URL".to_string())),
        };

        if Self::is_localhost_name(&host) {
            return Err(CapabilityError::SsrfBlocked(format!(
                "localhost address: {host}"
            )));
        }
        if Self::is_metadata_name(&host) {
            return Err(CapabilityError::SsrfBlocked(format!(
                "cloud metadata endpoint: {host}"
            )));
        }
        Ok(parsed)
    }

    /// Validate a DNS-resolved address before connecting to it.
    pub fn validate_resolved_ip(
        ip: &IpAddr,
        original_host: &str,
        config: &SsrfConfig,
    ) -> Result<(), CapabilityError> {
        if Self::is_private_ip(ip, config) {
            return Err(CapabilityError::SsrfBlocked(format!(
                "DNS {original_host} resolved to private IP: {ip}"
            )));
        }
        Ok(())
    }

    fn check_ip(ip: &IpAddr, config: &SsrfConfig) -> Result<(), CapabilityError> {
        if Self::is_private_ip(ip, config) {
            return Err(CapabilityError::SsrfBlocked(format!(
                "private IP address: {ip}"
            )));
        }
        Ok(())
    }

    fn is_localhost_name(host: &str) -> bool {
        host == "localhost" || host == "localhost.localdomain" || host.ends_with(".localhost")
    }

    fn is_metadata_name(host: &str) -> bool {
        matches!(host, "metadata" | "metadata.google.internal" | "instance-data")
            || host.ends_with(".internal")
    }

    pub fn is_private_ip(ip: &IpAddr, config: &SsrfConfig) -> bool {
        match ip {
            IpAddr::V4(v4) => Self::is_private_ipv4(v4, config),
            IpAddr::V6(v6) => Self::is_private_ipv6(v6, config),
        }
    }

    fn is_private_ipv4(ip: &Ipv4Addr, config: &SsrfConfig) -> bool {
        let [a, b, c, _] = ip.octets();
        if BLOCKED_V4
            .iter()
            .any(|(first, second, third)| {
                a == *first && second.contains(&b) && third.map_or(true, |t| c == t)
            })
        {
            return true;
        }
        // CGNAT 100.64.0.0/10
        if a == 100 && (64..=127).contains(&b) && !config.allow_cgnat {
            return true;
        }
        // multicast and reserved 224.0.0.0/3
        a >= 224
    }

    fn is_private_ipv6(ip: &Ipv6Addr, config: &SsrfConfig) -> bool {
        if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
            return true;
        }
        if let Some(v4) = ip.to_ipv4_mapped() {
            return Self::is_private_ipv4(&v4, config);
        }
        let seg = ip.segments();
        // fc00::/7 unique local (includes fd00:ec2::254)
        (seg[0] & 0xfe00) == 0xfc00
            // fe80::/10 link-local
            || (seg[0] & 0xffc0) == 0xfe80
            // fec0::/10 deprecated site-local
            || (seg[0] & 0xffc0) == 0xfec0
            // 2001:db8::/32 documentation
            || (seg[0] == 0x2001 && seg[1] == 0x0db8)
    }
}

// ============== Path Validation ==============

/// Allow-list gate for the sandbox filesystem facade.
///
/// Paths are relative to the capability root. The following are rejected
/// before the allow-list is consulted: `..` components, absolute paths and
/// drive prefixes, `~` home markers, NUL bytes, backslashes, and any
/// component in [`SENSITIVE_PATH_SEGMENTS`]. A surviving path must start with
/// an allowed prefix and end with an allowed extension.
#[derive(Debug, Clone)]
pub struct PathValidator {
    allowed_prefixes: Vec<PathBuf>,
    allowed_extensions: Vec<String>,
    any_location: bool,
}

impl PathValidator {
    pub fn new(allowed_prefixes: &[String], allowed_extensions: &[String]) -> Self {
        Self {
            allowed_prefixes: allowed_prefixes
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(|p| p.trim_start_matches("./").trim_end_matches('/'))
                .map(PathBuf::from)
                .collect(),
            allowed_extensions: allowed_extensions
                .iter()
                .map(|e| {
                    let e = e.trim().to_ascii_lowercase();
                    if e.starts_with('.') {
                        e
                    } else {
                        format!(".{e}")
                    }
                })
                .collect(),
            any_location: false,
        }
    }

    /// Skip the prefix and extension allow-lists (`fs.unrestricted`). The
    /// structural and sensitive-name checks still apply.
    pub fn with_any_location(mut self) -> Self {
        self.any_location = true;
        self
    }

    /// Validate a path for a file operation. Returns the normalized
    /// relative path.
    pub fn validate_file(&self, raw: &str) -> Result<PathBuf, CapabilityError> {
        let path = self.validate_structure(raw)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !self.any_location
            && !self
                .allowed_extensions
                .iter()
                .any(|ext| file_name.len() > ext.len() && file_name.ends_with(ext.as_str()))
        {
            return Err(CapabilityError::PathRejected(format!(
                "{raw}: extension not allowed"
            )));
        }
        Ok(path)
    }

    /// Validate a path for a directory operation (no extension check).
    pub fn validate_dir(&self, raw: &str) -> Result<PathBuf, CapabilityError> {
        self.validate_structure(raw)
    }

    fn validate_structure(&self, raw: &str) -> Result<PathBuf, CapabilityError> {
        let reject = |why: &str| Err(CapabilityError::PathRejected(format!("{raw}: {why}")));

        if raw.trim().is_empty() {
            return reject("empty path");
        }
        if raw.contains('\0') {
            return reject("NUL byte");
        }
        if raw.contains('\\') {
            return reject("backslash separator");
        }
        if raw.starts_with('~') {
            return reject("home directory marker");
        }
        if raw.starts_with('/') || raw.get(1..2) == Some(":") {
            return reject("absolute path");
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().unwrap_or_default();
                    if part.starts_with('~') {
                        return reject("home directory marker");
                    }
                    if SENSITIVE_PATH_SEGMENTS
                        .iter()
                        .any(|s| part.eq_ignore_ascii_case(s))
                    {
                        return reject("sensitive directory");
                    }
                    normalized.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => return reject("directory traversal"),
                Component::RootDir | Component::Prefix(_) => return reject("absolute path"),
            }
        }

        if !self.any_location
            && !self
                .allowed_prefixes
                .iter()
                .any(|prefix| normalized.starts_with(prefix))
        {
            return reject("not under an allowed path");
        }
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============== SSRF ==============

    #[test]
    fn test_ssrf_blocks_private_ipv4_literals() {
        for url in [
            "http://10.1.2.3/",
            "http://172.20.0.1/",
            "http://192.168.1.1/",
            "http://127.0.0.1:8080/",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://100.100.1.1/",
            "http://224.0.0.1/",
        ] {
            assert!(
                matches!(
                    SsrfProtection::validate_url(url),
                    Err(CapabilityError::SsrfBlocked(_))
                ),
                "{url} should be blocked"
            );
        }
    }

    #[test]
    fn test_ssrf_blocks_ipv6() {
        for url in [
            "http://[::1]/",
            "http://[fc00::1]/",
            "http://[fd00:ec2::254]/",
            "http://[fe80::1]/",
            "http://[::ffff:10.0.0.1]/",
            "http://[2001:db8::1]/",
        ] {
            assert!(
                matches!(
                    SsrfProtection::validate_url(url),
                    Err(CapabilityError::SsrfBlocked(_))
                ),
                "{url} should be blocked"
            );
        }
    }

    #[test]
    fn test_ssrf_blocks_hostnames() {
        for url in [
            "http://localhost/",
            "http://api.localhost/",
            "http://metadata.google.internal/",
            "http://instance-data/",
        ] {
            assert!(matches!(
                SsrfProtection::validate_url(url),
                Err(CapabilityError::SsrfBlocked(_))
            ));
        }
    }

    #[test]
    fn test_ssrf_scheme_and_parse() {
        assert!(matches!(
            SsrfProtection::validate_url("file:///etc/passwd"),
            Err(CapabilityError::ProtocolNotAllowed(_))
        ));
        assert!(matches!(
            SsrfProtection::validate_url("not a url"),
            Err(CapabilityError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_ssrf_allows_public() {
        assert!(SsrfProtection::validate_url("https://example.com/data.json").is_ok());
        assert!(SsrfProtection::validate_url("http://93.184.216.34/").is_ok());
    }

    #[test]
    fn test_ssrf_cgnat_config() {
        let config = SsrfConfig { allow_cgnat: true };
        assert!(SsrfProtection::validate_url_with_config("http://100.100.1.1/", &config).is_ok());
    }

    #[test]
    fn test_resolved_ip_validation() {
        let config = SsrfConfig::default();
        let private: IpAddr = "10.0.0.5".parse().unwrap();
        let public: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(SsrfProtection::validate_resolved_ip(&private, "rebind.example", &config).is_err());
        assert!(SsrfProtection::validate_resolved_ip(&public, "example.com", &config).is_ok());
    }

    // ============== Rate Limiting ==============

    #[test]
    fn test_http_rate_limit() {
        let mut limiter = CapabilityRateLimiter::new();
        for _ in 0..HTTP_RATE_LIMIT_PER_MINUTE {
            assert!(limiter.check_http_request().is_ok());
        }
        assert_eq!(
            limiter.check_http_request(),
            Err(CapabilityError::HttpRateLimitExceeded(
                HTTP_RATE_LIMIT_PER_MINUTE
            ))
        );
        assert_eq!(limiter.http_request_count(), HTTP_RATE_LIMIT_PER_MINUTE);
    }

    #[test]
    fn test_log_rate_limit_independent_of_http() {
        let mut limiter = CapabilityRateLimiter::new();
        for _ in 0..HTTP_RATE_LIMIT_PER_MINUTE {
            limiter.check_http_request().unwrap();
        }
        assert!(limiter.check_log_message().is_ok());
        assert_eq!(limiter.log_message_count(), 1);
    }

    #[test]
    fn test_registry_tracks_per_capability() {
        let registry = RateLimiterRegistry::new();
        for _ in 0..HTTP_RATE_LIMIT_PER_MINUTE {
            registry.check_http_request("a").unwrap();
        }
        assert!(registry.check_http_request("a").is_err());
        assert!(registry.check_http_request("b").is_ok());
        assert_eq!(registry.http_request_count("b"), 1);
        assert_eq!(registry.http_request_count("missing"), 0);
    }

    // ============== Paths ==============

    fn validator() -> PathValidator {
        PathValidator::new(
            &["data/".to_string()],
            &[".json".to_string(), "txt".to_string()],
        )
    }

    #[test]
    fn test_path_rejects_traversal() {
        assert!(matches!(
            validator().validate_file("../../etc/passwd"),
            Err(CapabilityError::PathRejected(_))
        ));
        assert!(validator().validate_file("data/../../secret.json").is_err());
    }

    #[test]
    fn test_path_accepts_allowed() {
        let path = validator().validate_file("data/sample.json").unwrap();
        assert_eq!(path, PathBuf::from("data/sample.json"));
        assert!(validator().validate_file("./data/nested/notes.TXT").is_ok());
    }

    #[test]
    fn test_path_rejects_absolute_and_home() {
        let v = validator();
        assert!(v.validate_file("/data/sample.json").is_err());
        assert!(v.validate_file("~/data/sample.json").is_err());
        assert!(v.validate_file("C:/data/sample.json").is_err());
        assert!(v.validate_file("data\\sample.json").is_err());
        assert!(v.validate_file("data/sample\0.json").is_err());
    }

    #[test]
    fn test_path_rejects_sensitive_even_if_allowed() {
        let v = PathValidator::new(&["".to_string(), "data".to_string()], &[".json".to_string()]);
        assert!(v.validate_file("data/.ssh/keys.json").is_err());
        assert!(v.validate_file("data/.git/config.json").is_err());
        assert!(v.validate_file("data/.ENV/x.json").is_err());
    }

    #[test]
    fn test_path_requires_prefix_and_extension() {
        let v = validator();
        assert!(v.validate_file("other/sample.json").is_err());
        assert!(v.validate_file("data/sample.exe").is_err());
        assert!(v.validate_file("data/.json").is_err());
        assert!(v.validate_file("database.json").is_err());
    }

    #[test]
    fn test_path_no_prefixes_denies_everything() {
        let v = PathValidator::new(&[], &[".json".to_string()]);
        assert!(v.validate_file("data/sample.json").is_err());
    }

    #[test]
    fn test_any_location_keeps_structural_checks() {
        let v = PathValidator::new(&[], &[]).with_any_location();
        assert!(v.validate_file("anything/at/all.bin").is_ok());
        assert!(v.validate_file("../up.txt").is_err());
        assert!(v.validate_file("proc/self/environ").is_err());
    }

    #[test]
    fn test_dir_validation_skips_extension() {
        let v = validator();
        assert!(v.validate_dir("data").is_ok());
        assert!(v.validate_dir("data/sub").is_ok());
        assert!(v.validate_dir("../data").is_err());
    }
}
