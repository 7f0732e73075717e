//! Dispatch error taxonomy.
//!
//! Every failure detected while resolving, verifying or executing a
//! capability is a [`DispatchError`]. It is converted into a failed
//! [`PluginOutput`] where it is detected, so no error crosses the dispatcher
//! boundary as a raw `Err`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::output::PluginOutput;

/// Stable, serializable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Unsigned,
    SignatureInvalid,
    PermissionDenied,
    UnsupportedLanguage,
    SandboxTimeout,
    SandboxCrash,
    SubprocessSpawnFailure,
    SubprocessOutputUnparseable,
    CapabilityCreationFailed,
    UnexpectedResultType,
    RegistryUnavailable,
    CapabilityNotFound,
    ModuleLoadFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unsigned => "Unsigned",
            ErrorKind::SignatureInvalid => "SignatureInvalid",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::UnsupportedLanguage => "UnsupportedLanguage",
            ErrorKind::SandboxTimeout => "SandboxTimeout",
            ErrorKind::SandboxCrash => "SandboxCrash",
            ErrorKind::SubprocessSpawnFailure => "SubprocessSpawnFailure",
            ErrorKind::SubprocessOutputUnparseable => "SubprocessOutputUnparseable",
            ErrorKind::CapabilityCreationFailed => "CapabilityCreationFailed",
            ErrorKind::UnexpectedResultType => "UnexpectedResultType",
            ErrorKind::RegistryUnavailable => "RegistryUnavailable",
            ErrorKind::CapabilityNotFound => "CapabilityNotFound",
            ErrorKind::ModuleLoadFailed => "ModuleLoadFailed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised anywhere along the dispatch path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("manifest {0} is unsigned; unsigned capabilities are never executed")]
    Unsigned(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("sandbox timed out after {timeout_ms}ms")]
    SandboxTimeout { timeout_ms: u64 },

    #[error("sandbox crashed: {0}")]
    SandboxCrash(String),

    #[error("failed to spawn interpreter: {0}")]
    SubprocessSpawnFailure(String),

    #[error("interpreter output is not valid JSON: {0}")]
    SubprocessOutputUnparseable(String),

    #[error("capability creation failed: {0}")]
    CapabilityCreationFailed(String),

    #[error("unexpected result type: {0}")]
    UnexpectedResultType(String),

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("no capability registered for verb {0}")]
    CapabilityNotFound(String),

    #[error("module load failed: {0}")]
    ModuleLoadFailed(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Unsigned(_) => ErrorKind::Unsigned,
            DispatchError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            DispatchError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            DispatchError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            DispatchError::SandboxTimeout { .. } => ErrorKind::SandboxTimeout,
            DispatchError::SandboxCrash(_) => ErrorKind::SandboxCrash,
            DispatchError::SubprocessSpawnFailure(_) => ErrorKind::SubprocessSpawnFailure,
            DispatchError::SubprocessOutputUnparseable(_) => {
                ErrorKind::SubprocessOutputUnparseable
            }
            DispatchError::CapabilityCreationFailed(_) => ErrorKind::CapabilityCreationFailed,
            DispatchError::UnexpectedResultType(_) => ErrorKind::UnexpectedResultType,
            DispatchError::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            DispatchError::CapabilityNotFound(_) => ErrorKind::CapabilityNotFound,
            DispatchError::ModuleLoadFailed(_) => ErrorKind::ModuleLoadFailed,
        }
    }

    pub fn into_output(self) -> PluginOutput {
        PluginOutput::failure(self.kind(), self.to_string())
    }

    /// The single-element failure sequence returned to callers.
    pub fn into_outputs(self) -> Vec<PluginOutput> {
        vec![self.into_output()]
    }
}
