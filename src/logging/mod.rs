//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats. Every writer is wrapped in
//! [`redact::RedactingMakeWriter`], so injected credentials never reach a
//! log sink verbatim.
//!
//! # Log Targets
//!
//! - `dispatch` - per-invocation dispatch sequence
//! - `sandbox` - script, WASM and subprocess runtimes
//! - `trust` - signature and permission checks
//! - `resolver` - verb resolution and escalation
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `CAPDISPATCH_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter
//!
//! # Examples
//!
//! ```no_run
//! use capdispatch::logging::{init_logging, LogConfig, LogFormat, LogOutput};
//!
//! init_logging(LogConfig {
//!     format: LogFormat::Json,
//!     output: LogOutput::File("/var/log/capdispatch.log".into()),
//!     default_level: tracing::Level::INFO,
//! }).unwrap();
//! ```

pub mod audit;
pub mod redact;

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use crate::logging::redact::RedactingMakeWriter;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Primary filter variable.
pub const LOG_ENV_VAR: &str = "CAPDISPATCH_LOG";

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

impl LogFormat {
    /// `"json"` selects JSON; anything else is plaintext.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Plaintext
        }
    }
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    Stdout,
    /// Write to stderr (default: stdout carries command results)
    #[default]
    Stderr,
    /// Append to a file at the given path
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stderr,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stderr, debug level
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            ..Self::default()
        }
    }

    /// JSON to stderr, info level
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Self::default()
        }
    }
}

/// Parse a level name, falling back to INFO.
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from environment variables or default level.
///
/// Checks CAPDISPATCH_LOG first, then RUST_LOG, falling back to the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var(LOG_ENV_VAR) {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    let level = default_level.as_str().to_lowercase();
    let mut directives = vec![level.clone()];
    for target in targets::ALL {
        directives.push(format!("{target}={level}"));
    }
    // wasmtime/cranelift are noisy below warn
    directives.push("cranelift_codegen=warn".to_string());
    directives.push("wasmtime=warn".to_string());
    Ok(EnvFilter::try_new(directives.join(","))?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(RedactingMakeWriter::new(io::stdout)),
        LogOutput::Stderr => BoxMakeWriter::new(RedactingMakeWriter::new(io::stderr)),
        LogOutput::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(RedactingMakeWriter::new(Mutex::new(file)))
        }
    })
}

fn build_layer(
    config: &LogConfig,
) -> Result<Box<dyn Layer<Registry> + Send + Sync + 'static>, LoggingError> {
    let filter = build_env_filter(config.default_level)?;
    let writer = make_writer(&config.output)?;
    let timer = UtcTime::rfc_3339();

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    };
    Ok(layer)
}

/// Initialize the logging subsystem with the given configuration.
///
/// Call once at startup. Subsequent calls return
/// [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }
    let layer = build_layer(&config)?;
    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

/// Initialize logging for tests.
///
/// Plaintext at debug level; silently ignores an already-installed
/// subscriber, so it is safe to call from many tests.
pub fn init_test_logging() {
    if let Ok(layer) = build_layer(&LogConfig::development()) {
        let _ = tracing_subscriber::registry().with(layer).try_init();
    }
}

/// Log target constants for consistent naming across the codebase
pub mod targets {
    pub const DISPATCH: &str = "dispatch";
    pub const SANDBOX: &str = "sandbox";
    pub const TRUST: &str = "trust";
    pub const RESOLVER: &str = "resolver";
    pub const CONFIG: &str = "config";

    pub const ALL: &[&str] = &[DISPATCH, SANDBOX, TRUST, RESOLVER, CONFIG];
}
