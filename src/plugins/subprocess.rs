//! Interpreter subprocess executor.
//!
//! Runs interpreted capabilities (Python by default) as a child process:
//!
//! - command: `<interpreter...> <root>/<main>`, cwd = materialized root
//! - environment: cleared, then the pass-through list, the invocation
//!   environment, `PYTHONPATH=<root>` and `PYTHONUNBUFFERED=1`
//! - stdin: the inputs as a JSON object of `name -> InputValue`
//! - stdout: the result JSON (capped at [`MAX_STDOUT_BYTES`])
//! - stderr: logged, never a failure by itself
//!
//! On Unix the child gets rlimits before exec: address space from the memory
//! ceiling, CPU seconds from the timeout, and open files.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::error::DispatchError;
use super::executor::{CapabilityExecutor, ExecutionContext};
use super::host::safe_truncate;
use super::manifest::Language;
use super::output::{normalize_outputs, PluginOutput};
use crate::logging::redact::redact_string;

/// Largest stdout accepted from a child (10MB)
pub const MAX_STDOUT_BYTES: usize = 10 * 1024 * 1024;

/// Largest stderr kept for logging (64KB)
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

/// How much stdout/stderr a failed output carries.
const FAILURE_EXCERPT_BYTES: usize = 2048;

fn default_interpreters() -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert("python".to_string(), vec!["python3".to_string()]);
    map
}

fn default_env_passthrough() -> Vec<String> {
    ["PATH", "LANG", "LC_ALL", "HOME", "TMPDIR", "SYSTEMROOT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_fds() -> u64 {
    256
}

/// Interpreter and child-process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubprocessConfig {
    /// Language name -> interpreter argv prefix.
    #[serde(default = "default_interpreters")]
    pub interpreters: BTreeMap<String, Vec<String>>,
    /// Host variables copied into the child environment when set.
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,
    #[serde(default = "default_max_fds")]
    pub max_fds: u64,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            interpreters: default_interpreters(),
            env_passthrough: default_env_passthrough(),
            max_fds: default_max_fds(),
        }
    }
}

impl SubprocessConfig {
    pub fn interpreter_for(&self, language: &Language) -> Option<&[String]> {
        self.interpreters
            .get(language.as_str())
            .map(Vec::as_slice)
            .filter(|argv| !argv.is_empty())
    }
}

/// Limits applied in the child before exec.
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    memory_bytes: u64,
    cpu_seconds: u64,
    max_fds: u64,
}

#[cfg(unix)]
fn apply_child_limits(limits: &ChildLimits) -> std::io::Result<()> {
    set_rlimit(libc::RLIMIT_CPU, limits.cpu_seconds)?;
    // not supported on every platform (macOS returns EINVAL)
    let _ = set_rlimit(libc::RLIMIT_AS, limits.memory_bytes);
    set_rlimit(libc::RLIMIT_NOFILE, limits.max_fds)?;
    Ok(())
}

/// `c_int` on macOS/BSDs, `__rlimit_resource_t` (u32) on Linux glibc.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

/// Lower the soft limit, leaving the hard limit alone.
#[cfg(unix)]
fn set_rlimit(resource: RlimitResource, limit: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the provided struct only.
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let requested = limit as libc::rlim_t;
    let hard = current.rlim_max;
    let rlim = libc::rlimit {
        rlim_cur: if hard == libc::RLIM_INFINITY || requested < hard {
            requested
        } else {
            hard
        },
        rlim_max: hard,
    };
    // SAFETY: setrlimit reads the provided struct only.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Read up to `max` bytes, then keep draining so the child never blocks on
/// a full pipe. Returns the bytes and whether anything was dropped.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

/// Executor for interpreted languages.
pub struct SubprocessExecutor {
    config: SubprocessConfig,
}

impl SubprocessExecutor {
    pub fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, ctx: &ExecutionContext, argv: &[String]) -> Command {
        let root: &Path = ctx.root();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .arg(root.join(&ctx.module.entry))
            .current_dir(root)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for var in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        cmd.envs(&ctx.environment);
        cmd.env("PYTHONPATH", root);
        cmd.env("PYTHONUNBUFFERED", "1");

        #[cfg(unix)]
        {
            let limits = ChildLimits {
                memory_bytes: ctx.limits.memory_bytes as u64,
                cpu_seconds: ctx.limits.timeout.as_secs().max(1),
                max_fds: self.config.max_fds,
            };
            // SAFETY: `pre_exec` runs in the child immediately before exec and
            // only calls getrlimit/setrlimit.
            unsafe {
                cmd.pre_exec(move || apply_child_limits(&limits));
            }
        }
        cmd
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<serde_json::Value, DispatchError> {
        let language = &ctx.manifest.language;
        let argv = self
            .config
            .interpreter_for(language)
            .ok_or_else(|| DispatchError::UnsupportedLanguage(language.to_string()))?;

        let mut child = self.build_command(ctx, argv).spawn().map_err(|e| {
            DispatchError::SubprocessSpawnFailure(format!("{}: {e}", argv[0]))
        })?;

        let stdin_payload = serde_json::to_vec(&ctx.inputs_json())
            .map_err(|e| DispatchError::SandboxCrash(e.to_string()))?;
        let mut stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let writer = async move {
            if let Some(stdin) = stdin.as_mut() {
                // a child that exits without reading stdin is not an error here
                let _ = stdin.write_all(&stdin_payload).await;
                let _ = stdin.shutdown().await;
            }
        };
        let stdout_reader = async move {
            match stdout {
                Some(out) => read_capped(out, MAX_STDOUT_BYTES).await,
                None => (Vec::new(), false),
            }
        };
        let stderr_reader = async move {
            match stderr {
                Some(err) => read_capped(err, MAX_STDERR_BYTES).await,
                None => (Vec::new(), false),
            }
        };
        let io = async { tokio::join!(writer, stdout_reader, stderr_reader, child.wait()) };

        let outcome = tokio::time::timeout(ctx.limits.timeout, io).await;
        let (_, (stdout, stdout_truncated), (stderr, _), status) = match outcome {
            Ok(done) => done,
            Err(_) => {
                // the join future is gone; kill and reap explicitly
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(DispatchError::SandboxTimeout {
                    timeout_ms: ctx.limits.timeout_ms(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        if !stderr.trim().is_empty() {
            tracing::info!(
                capability_id = %ctx.manifest.id,
                invocation_id = %ctx.invocation_id,
                stderr = %redact_string(safe_truncate(&stderr, FAILURE_EXCERPT_BYTES)),
                "capability stderr"
            );
        }

        let status = status.map_err(|e| DispatchError::SandboxCrash(format!("wait failed: {e}")))?;
        if !status.success() {
            return Err(DispatchError::SandboxCrash(format!(
                "interpreter exited with {status}{}",
                excerpt(&stdout, &stderr)
            )));
        }
        if stdout_truncated {
            return Err(DispatchError::SubprocessOutputUnparseable(format!(
                "stdout exceeded {MAX_STDOUT_BYTES} bytes"
            )));
        }

        serde_json::from_str(stdout.trim()).map_err(|e| {
            DispatchError::SubprocessOutputUnparseable(format!("{e}{}", excerpt(&stdout, &stderr)))
        })
    }
}

/// Redacted, truncated stdout/stderr appended to failure messages.
fn excerpt(stdout: &str, stderr: &str) -> String {
    let mut text = String::new();
    if !stdout.trim().is_empty() {
        text.push_str("; stdout: ");
        text.push_str(&redact_string(safe_truncate(stdout.trim(), FAILURE_EXCERPT_BYTES)));
    }
    if !stderr.trim().is_empty() {
        text.push_str("; stderr: ");
        text.push_str(&redact_string(safe_truncate(stderr.trim(), FAILURE_EXCERPT_BYTES)));
    }
    text
}

#[async_trait]
impl CapabilityExecutor for SubprocessExecutor {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    fn supports(&self, language: &Language) -> bool {
        self.config.interpreter_for(language).is_some()
    }

    async fn execute(&self, ctx: ExecutionContext) -> Vec<PluginOutput> {
        let started = Instant::now();
        let result = self.run(&ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(value) => {
                tracing::debug!(
                    capability_id = %ctx.manifest.id,
                    invocation_id = %ctx.invocation_id,
                    elapsed_ms,
                    "subprocess capability completed"
                );
                normalize_outputs(value, true)
            }
            Err(e) => {
                tracing::warn!(
                    capability_id = %ctx.manifest.id,
                    invocation_id = %ctx.invocation_id,
                    elapsed_ms,
                    error = %e,
                    "subprocess capability failed"
                );
                e.into_outputs()
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugins::error::ErrorKind;
    use crate::plugins::executor::ExecutionLimits;
    use crate::plugins::loader::LoadedModule;
    use crate::plugins::manifest::{inputs_from_pairs, CapabilityManifest, EntryPoint};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn shell_config() -> SubprocessConfig {
        let mut config = SubprocessConfig::default();
        config
            .interpreters
            .insert("shell".to_string(), vec!["/bin/sh".to_string()]);
        config
    }

    fn context(dir: &TempDir, script: &str, timeout: Duration) -> ExecutionContext {
        std::fs::write(dir.path().join("main.sh"), script).unwrap();
        let manifest = CapabilityManifest {
            id: "shell-test".to_string(),
            verb: "SHELL".to_string(),
            version: "1.0.0".to_string(),
            language: Language::Other("shell".to_string()),
            description: String::new(),
            entry_point: EntryPoint {
                main: "main.sh".to_string(),
                ..EntryPoint::default()
            },
            security: Default::default(),
            configuration: Vec::new(),
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
        };
        let mut module = LoadedModule::in_memory("main.sh", script.as_bytes().to_vec());
        module.root = dir.path().to_path_buf();
        ExecutionContext::new(
            "inv-sub",
            Arc::new(manifest),
            Arc::new(module),
            inputs_from_pairs([("text", json!("hello"))]),
            ExecutionLimits {
                timeout,
                memory_bytes: 512 * 1024 * 1024,
            },
        )
    }

    #[test]
    fn test_default_config() {
        let config = SubprocessConfig::default();
        assert_eq!(
            config.interpreter_for(&Language::Python),
            Some(&["python3".to_string()][..])
        );
        assert!(config.interpreter_for(&Language::JavaScript).is_none());
        assert!(config.env_passthrough.contains(&"PATH".to_string()));
    }

    #[tokio::test]
    async fn test_stdin_to_stdout_round_trip() {
        let dir = TempDir::new().unwrap();
        let exec = SubprocessExecutor::new(shell_config());
        let script = "input=$(cat)\nprintf '[{\"success\":true,\"name\":\"echo\",\"result\":%s}]' \"$input\"\n";
        let out = exec.execute(context(&dir, script, Duration::from_secs(5))).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].success, "{:?}", out[0]);
        assert_eq!(out[0].result["text"]["value"], json!("hello"));
        assert_eq!(out[0].result["text"]["inputName"], json!("text"));
    }

    #[tokio::test]
    async fn test_lone_object_wrapped_and_cwd_is_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data.txt"), "x").unwrap();
        let exec = SubprocessExecutor::new(shell_config());
        let script = "cat >/dev/null\nif [ -f data.txt ]; then printf '{\"success\":true,\"result\":\"found\"}'; fi\n";
        let out = exec.execute(context(&dir, script, Duration::from_secs(5))).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].result, json!("found"));
    }

    #[tokio::test]
    async fn test_environment_is_filtered() {
        let dir = TempDir::new().unwrap();
        let exec = SubprocessExecutor::new(shell_config());
        let script = "cat >/dev/null\nprintf '[{\"success\":true,\"result\":\"%s|%s|%s\"}]' \"$__auth_token\" \"$PYTHONUNBUFFERED\" \"${CARGO_PKG_NAME:-unset}\"\n";
        let mut env = BTreeMap::new();
        env.insert("__auth_token".to_string(), "tok123".to_string());
        let ctx = context(&dir, script, Duration::from_secs(5)).with_environment(env);
        let out = exec.execute(ctx).await;
        assert_eq!(out[0].result, json!("tok123|1|unset"));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let exec = SubprocessExecutor::new(shell_config());
        let started = Instant::now();
        let out = exec
            .execute(context(&dir, "sleep 30\n", Duration::from_millis(300)))
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out[0].error_kind, Some(ErrorKind::SandboxTimeout));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_crash_with_stderr() {
        let dir = TempDir::new().unwrap();
        let exec = SubprocessExecutor::new(shell_config());
        let out = exec
            .execute(context(&dir, "cat >/dev/null\necho 'went wrong' >&2\nexit 3\n", Duration::from_secs(5)))
            .await;
        assert_eq!(out[0].error_kind, Some(ErrorKind::SandboxCrash));
        let error = out[0].error.as_deref().unwrap();
        assert!(error.contains("went wrong"));
    }

    #[tokio::test]
    async fn test_unparseable_stdout() {
        let dir = TempDir::new().unwrap();
        let exec = SubprocessExecutor::new(shell_config());
        let out = exec
            .execute(context(&dir, "cat >/dev/null\necho 'not json'\n", Duration::from_secs(5)))
            .await;
        assert_eq!(out[0].error_kind, Some(ErrorKind::SubprocessOutputUnparseable));
        assert!(out[0].error.as_deref().unwrap().contains("not json"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let mut config = SubprocessConfig::default();
        config.interpreters.insert(
            "shell".to_string(),
            vec!["/nonexistent/interpreter".to_string()],
        );
        let exec = SubprocessExecutor::new(config);
        let out = exec.execute(context(&dir, "", Duration::from_secs(5))).await;
        assert_eq!(out[0].error_kind, Some(ErrorKind::SubprocessSpawnFailure));
    }

    #[tokio::test]
    async fn test_failure_excerpt_is_redacted() {
        let dir = TempDir::new().unwrap();
        let exec = SubprocessExecutor::new(shell_config());
        let script = "cat >/dev/null\necho 'Authorization: Bearer abcdef123456' >&2\nexit 1\n";
        let out = exec.execute(context(&dir, script, Duration::from_secs(5))).await;
        let error = out[0].error.as_deref().unwrap();
        assert!(!error.contains("abcdef123456"));
    }
}
