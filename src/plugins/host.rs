//! Sandbox host bridge
//!
//! The host side of every API a sandboxed capability may call: logging,
//! fetch, timers and the filesystem facade. Each call is checked against the
//! capability's permissions and sandbox options before it touches the
//! outside world. Executors own one [`SandboxHost`] per invocation.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::capabilities::{
    CapabilityError, PathValidator, RateLimiterRegistry, SsrfConfig, SsrfProtection,
};
use super::manifest::CapabilityManifest;
use super::permissions::PermissionEnforcer;

/// Maximum message size for logging (4KB)
pub const MAX_LOG_MESSAGE_SIZE: usize = 4 * 1024;

/// Maximum fetch request body size (10MB)
pub const MAX_HTTP_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Maximum fetch response body size (10MB)
pub const MAX_HTTP_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Maximum file size readable or writable through the filesystem facade
pub const MAX_FS_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Maximum URL length
pub const MAX_URL_LENGTH: usize = 2048;

/// Upper bound for a single fetch, further capped by the capability timeout
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Safely truncate a string to at most `max_bytes` bytes without splitting
/// a multi-byte UTF-8 character.
pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut boundary = max_bytes;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    &s[..boundary]
}

/// Dispatch a capability log line to tracing at the given level.
#[allow(clippy::cognitive_complexity)]
fn emit_log_message(level: LogLevel, capability_id: &str, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(capability_id = %capability_id, "{}", message),
        LogLevel::Info => tracing::info!(capability_id = %capability_id, "{}", message),
        LogLevel::Warn => tracing::warn!(capability_id = %capability_id, "{}", message),
        LogLevel::Error => tracing::error!(capability_id = %capability_id, "{}", message),
    }
}

/// Host errors
#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("{0}")]
    Capability(#[from] CapabilityError),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("fetch error: {0}")]
    Http(String),

    #[error("filesystem error: {0}")]
    Fs(String),

    #[error("URL too long: {size} chars (max {max})")]
    UrlTooLong { size: usize, max: usize },

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("timer delay {requested_ms}ms exceeds the capability timeout of {max_ms}ms")]
    TimerTooLong { requested_ms: u64, max_ms: u64 },
}

/// Log level requested by sandboxed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map console method names and numeric WASM levels.
    pub fn parse(name: &str) -> Self {
        match name {
            "debug" | "trace" | "0" => LogLevel::Debug,
            "warn" | "2" => LogLevel::Warn,
            "error" | "3" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Fetch request from sandboxed code.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Fetch response handed back to sandboxed code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub ok: bool,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Host context for one capability invocation.
pub struct SandboxHost {
    capability_id: String,
    root: PathBuf,
    enforcer: PermissionEnforcer,
    paths: PathValidator,
    rate_limiters: Arc<RateLimiterRegistry>,
    ssrf_config: SsrfConfig,
    timeout: Duration,
}

impl SandboxHost {
    pub fn new(
        manifest: &CapabilityManifest,
        root: impl Into<PathBuf>,
        rate_limiters: Arc<RateLimiterRegistry>,
    ) -> Self {
        let enforcer = PermissionEnforcer::new(manifest);
        let options = manifest.sandbox_options();
        let mut paths = PathValidator::new(&options.allowed_paths, &options.allowed_extensions);
        if enforcer.grants().fs_unrestricted {
            paths = paths.with_any_location();
        }
        Self {
            capability_id: manifest.id.clone(),
            root: root.into(),
            timeout: options.timeout(),
            enforcer,
            paths,
            rate_limiters,
            ssrf_config: SsrfConfig::default(),
        }
    }

    pub fn with_ssrf_config(mut self, config: SsrfConfig) -> Self {
        self.ssrf_config = config;
        self
    }

    pub fn capability_id(&self) -> &str {
        &self.capability_id
    }

    pub fn enforcer(&self) -> &PermissionEnforcer {
        &self.enforcer
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // ============== Logging ==============

    /// Forward a log line to the host logger, rate limited and truncated.
    pub fn log(&self, level: LogLevel, message: &str) -> Result<(), HostError> {
        self.rate_limiters.check_log_message(&self.capability_id)?;
        emit_log_message(
            level,
            &self.capability_id,
            safe_truncate(message, MAX_LOG_MESSAGE_SIZE),
        );
        Ok(())
    }

    // ============== Timers ==============

    /// Reject timer delays longer than the capability's declared timeout.
    pub fn check_timer(&self, delay_ms: f64) -> Result<u64, HostError> {
        let max_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let requested_ms = if delay_ms.is_finite() && delay_ms > 0.0 {
            delay_ms.ceil() as u64
        } else {
            0
        };
        if requested_ms > max_ms {
            return Err(HostError::TimerTooLong {
                requested_ms,
                max_ms,
            });
        }
        Ok(requested_ms)
    }

    // ============== Fetch ==============

    /// Fetch a URL on behalf of the capability.
    ///
    /// 1. Validates length, scheme and literal host (SSRF)
    /// 2. Checks `net.fetch` and `allowedDomains`, then the rate limit
    /// 3. Resolves DNS, validates every address and pins the first one
    /// 4. Sends without following redirects
    /// 5. Streams the body with a hard size limit
    pub async fn fetch(&self, req: FetchRequest) -> Result<FetchResponse, HostError> {
        let (method, url, host) = self.validate_fetch(&req)?;
        let port = url.port_or_known_default().unwrap_or(443);
        let client = self.build_pinned_client(&host, port).await?;

        tracing::debug!(
            capability_id = %self.capability_id,
            method = %method,
            url = %url,
            "sandbox fetch"
        );

        let response = send_request(client, &method, &url, req).await?;

        if let Some(len) = response.content_length() {
            if len > MAX_HTTP_RESPONSE_SIZE as u64 {
                return Err(HostError::BodyTooLarge {
                    size: usize::try_from(len).unwrap_or(usize::MAX),
                    max: MAX_HTTP_RESPONSE_SIZE,
                });
            }
        }

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = read_body_limited(response, MAX_HTTP_RESPONSE_SIZE).await?;

        Ok(FetchResponse {
            status,
            ok: (200..300).contains(&status),
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    fn validate_fetch(&self, req: &FetchRequest) -> Result<(String, url::Url, String), HostError> {
        if req.url.len() > MAX_URL_LENGTH {
            return Err(HostError::UrlTooLong {
                size: req.url.len(),
                max: MAX_URL_LENGTH,
            });
        }

        let url = SsrfProtection::validate_url_with_config(&req.url, &self.ssrf_config)?;
        let host = url
            .host_str()
            .ok_or_else(|| HostError::Http("URL has no host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        self.enforcer
            .check_fetch(&host)
            .map_err(|e| HostError::PermissionDenied(e.to_string()))?;

        self.rate_limiters.check_http_request(&self.capability_id)?;

        if let Some(body) = &req.body {
            if body.len() > MAX_HTTP_BODY_SIZE {
                return Err(HostError::BodyTooLarge {
                    size: body.len(),
                    max: MAX_HTTP_BODY_SIZE,
                });
            }
        }

        let method = req
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(HostError::Http(format!("invalid HTTP method: {method}")));
        }

        Ok((method, url, host))
    }

    async fn build_pinned_client(&self, host: &str, port: u16) -> Result<Client, HostError> {
        let timeout = self
            .timeout
            .min(Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS));
        let mut builder = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none());

        if host.parse::<IpAddr>().is_err() {
            let ip = self.resolve_and_validate(host).await?;
            builder = builder.resolve(host, std::net::SocketAddr::new(ip, port));
        }

        builder
            .build()
            .map_err(|e| HostError::Http(format!("failed to create HTTP client: {e}")))
    }

    /// Resolve a hostname and validate every address it maps to. Returns the
    /// address to pin.
    async fn resolve_and_validate(&self, host: &str) -> Result<IpAddr, HostError> {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let lookup = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| HostError::Http(format!("DNS resolution failed for {host}: {e}")))?;

        let mut pinned = None;
        for ip in lookup.iter() {
            SsrfProtection::validate_resolved_ip(&ip, host, &self.ssrf_config)?;
            pinned.get_or_insert(ip);
        }
        pinned.ok_or_else(|| HostError::Http(format!("DNS returned no addresses for {host}")))
    }

    // ============== Filesystem ==============

    pub fn read_file(&self, path: &str) -> Result<String, HostError> {
        self.enforcer
            .check_fs_read()
            .map_err(|e| HostError::PermissionDenied(e.to_string()))?;
        let relative = self.paths.validate_file(path)?;
        let full = self.confine(&relative)?;
        let meta = std::fs::metadata(&full).map_err(|e| HostError::Fs(format!("{path}: {e}")))?;
        if meta.len() > MAX_FS_FILE_SIZE as u64 {
            return Err(HostError::BodyTooLarge {
                size: usize::try_from(meta.len()).unwrap_or(usize::MAX),
                max: MAX_FS_FILE_SIZE,
            });
        }
        std::fs::read_to_string(&full).map_err(|e| HostError::Fs(format!("{path}: {e}")))
    }

    pub fn write_file(&self, path: &str, contents: &str) -> Result<(), HostError> {
        self.enforcer
            .check_fs_write()
            .map_err(|e| HostError::PermissionDenied(e.to_string()))?;
        if contents.len() > MAX_FS_FILE_SIZE {
            return Err(HostError::BodyTooLarge {
                size: contents.len(),
                max: MAX_FS_FILE_SIZE,
            });
        }
        let relative = self.paths.validate_file(path)?;
        let full = self.root.join(&relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HostError::Fs(format!("{path}: {e}")))?;
        }
        // re-check after directory creation so a symlinked parent cannot escape
        if let Some(parent) = relative.parent() {
            self.confine(parent)?;
        }
        if std::fs::symlink_metadata(&full).is_ok_and(|meta| meta.file_type().is_symlink()) {
            return Err(CapabilityError::PathRejected(format!("{path} is a symlink")).into());
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            // closes the gap between the check above and the open
            options.custom_flags(libc::O_NOFOLLOW);
        }
        let fs_err = |e: std::io::Error| HostError::Fs(format!("{path}: {e}"));
        let mut file = options.open(&full).map_err(fs_err)?;
        file.write_all(contents.as_bytes()).map_err(fs_err)
    }

    pub fn exists(&self, path: &str) -> Result<bool, HostError> {
        self.enforcer
            .check_fs_read()
            .map_err(|e| HostError::PermissionDenied(e.to_string()))?;
        let relative = self.paths.validate_dir(path)?;
        match self.confine(&relative) {
            Ok(full) => Ok(full.exists()),
            Err(HostError::Fs(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, HostError> {
        self.enforcer
            .check_fs_read()
            .map_err(|e| HostError::PermissionDenied(e.to_string()))?;
        let relative = self.paths.validate_dir(path)?;
        let full = self.confine(&relative)?;
        let mut names: Vec<String> = std::fs::read_dir(&full)
            .map_err(|e| HostError::Fs(format!("{path}: {e}")))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Resolve a validated relative path under the root, following symlinks,
    /// and reject anything that lands outside the root.
    fn confine(&self, relative: &Path) -> Result<PathBuf, HostError> {
        let root = self
            .root
            .canonicalize()
            .map_err(|e| HostError::Fs(format!("capability root unavailable: {e}")))?;
        let full = root
            .join(relative)
            .canonicalize()
            .map_err(|e| HostError::Fs(format!("{}: {e}", relative.display())))?;
        if !full.starts_with(&root) {
            return Err(CapabilityError::PathRejected(format!(
                "{}: resolves outside the capability root",
                relative.display()
            ))
            .into());
        }
        Ok(full)
    }
}

/// Build and send a fetch using the pinned client.
async fn send_request(
    client: Client,
    method: &str,
    url: &url::Url,
    req: FetchRequest,
) -> Result<reqwest::Response, HostError> {
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| HostError::Http(format!("invalid HTTP method: {method}")))?;

    let mut builder = client.request(method, url.clone());
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = req.body {
        builder = builder.body(body);
    }

    builder
        .send()
        .await
        .map_err(|e| HostError::Http(format!("request failed: {e}")))
}

/// Read a response body chunk by chunk with a hard size limit.
async fn read_body_limited(
    response: reqwest::Response,
    max_size: usize,
) -> Result<Vec<u8>, HostError> {
    use futures_util::StreamExt;

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HostError::Http(format!("failed to read body: {e}")))?;
        if body.len() + chunk.len() > max_size {
            return Err(HostError::BodyTooLarge {
                size: body.len() + chunk.len(),
                max: max_size,
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
