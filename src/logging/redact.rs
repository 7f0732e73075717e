//! Secret masking for logs, audit records and failure excerpts.
//!
//! Pattern-based scrubbing (bearer and basic credentials, long query-string
//! secrets, reserved token keys) plus exact-value scrubbing of credentials
//! the dispatcher injected into an invocation. Injected values stay
//! registered only while a [`SecretRegistration`] for them is alive.

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::LazyLock;
use tracing_subscriber::fmt::MakeWriter;

const REDACTED: &str = "[REDACTED]";

/// Shortest injected value worth scrubbing verbatim.
const MIN_REGISTERED_SECRET_LEN: usize = 8;

const SECRET_KEY_NAMES: &[&str] = &[
    "apikey",
    "api_key",
    "token",
    "secret",
    "password",
    "credentials",
    "authorization",
];

static RE_BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bearer [a-zA-Z0-9._\-]+").expect("failed to compile regex: bearer")
});

static RE_BASIC_AUTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Basic [a-zA-Z0-9+/=]+").expect("failed to compile regex: basic_auth")
});

static RE_QUERY_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(key|token)=([a-zA-Z0-9]{40,})").expect("failed to compile regex: query_secret")
});

static RE_RESERVED_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(__(?:brain_)?auth_token)("?\s*[:=]\s*"?)([^"\s,}]+)"#)
        .expect("failed to compile regex: reserved_key")
});

/// Values scrubbed verbatim wherever they appear, with the number of live
/// registrations for each.
static REGISTERED_SECRETS: LazyLock<RwLock<BTreeMap<String, usize>>> =
    LazyLock::new(|| RwLock::new(BTreeMap::new()));

/// Scrub `value` from redaction passes until the returned registration is
/// dropped. Short values are ignored to avoid mangling ordinary text.
pub fn register_secret(value: &str) -> SecretRegistration {
    let value = value.trim();
    if value.len() < MIN_REGISTERED_SECRET_LEN {
        return SecretRegistration { value: None };
    }
    *REGISTERED_SECRETS
        .write()
        .entry(value.to_string())
        .or_insert(0) += 1;
    SecretRegistration {
        value: Some(value.to_string()),
    }
}

/// Keeps one value registered for scrubbing. Overlapping registrations of
/// the same value are counted; the value is forgotten when the last one
/// drops.
#[must_use = "the secret is unregistered when this is dropped"]
pub struct SecretRegistration {
    value: Option<String>,
}

impl std::fmt::Debug for SecretRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRegistration")
            .field("active", &self.value.is_some())
            .finish()
    }
}

impl Drop for SecretRegistration {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        let mut secrets = REGISTERED_SECRETS.write();
        if let Some(count) = secrets.get_mut(&value) {
            *count -= 1;
            if *count == 0 {
                secrets.remove(&value);
            }
        }
    }
}

pub struct RedactingWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
}

const MAX_BUFFER_BYTES: usize = 8192;

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buffer);
        let redacted = redact_string(&text);
        self.inner.write_all(redacted.as_bytes())?;
        self.buffer.fill(0);
        self.buffer.clear();
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.buffer.extend_from_slice(buf);
        if self.buffer.len() > MAX_BUFFER_BYTES {
            self.flush_buffer()?;
        }
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.drain(..=pos).collect::<Vec<u8>>();
            line.pop();
            let text = String::from_utf8_lossy(&line);
            self.inner.write_all(redact_string(&text).as_bytes())?;
            self.inner.write_all(b"\n")?;
            line.fill(0);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
        let _ = self.inner.flush();
    }
}

pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
    M::Writer: Write,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

pub fn redact_string(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let mut result = RE_BEARER.replace_all(input, REDACTED).into_owned();
    result = RE_BASIC_AUTH.replace_all(&result, REDACTED).into_owned();
    result = RE_QUERY_SECRET
        .replace_all(&result, "$1=[REDACTED]")
        .into_owned();
    result = RE_RESERVED_KEY
        .replace_all(&result, "$1$2[REDACTED]")
        .into_owned();

    let secrets = REGISTERED_SECRETS.read();
    for secret in secrets.keys() {
        if result.contains(secret.as_str()) {
            result = result.replace(secret.as_str(), REDACTED);
        }
    }
    result
}

/// Replace string values under secret-looking keys, recursively, and scrub
/// every other string.
pub fn redact_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let lower = key.to_lowercase();
                if child.is_string() && SECRET_KEY_NAMES.iter().any(|s| lower.contains(s)) {
                    *child = Value::String(REDACTED.to_string());
                } else {
                    redact_json_value(child);
                }
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(redact_json_value),
        Value::String(s) => {
            let scrubbed = redact_string(s);
            if scrubbed != *s {
                *s = scrubbed;
            }
        }
        _ => {}
    }
}
