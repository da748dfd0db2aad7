//! Error types for the pre-reboot driver.

use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a [`SandboxLifecycle`](crate::sandbox::SandboxLifecycle)
/// implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// The setup service rejected the request (already active, invalid
    /// update state, busy mounts on exclusive teardown, ...).
    #[error("sandbox service error {code}: {message}")]
    ServiceSpecific { code: i32, message: String },

    /// The setup service could not be reached.
    #[error("failed to reach sandbox service: {0}")]
    Communication(String),
}

/// Top-level error type for driver operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Talking to the privileged compiler service failed.
    #[error("compiler service communication failed: {0}")]
    ServiceCommunication(String),

    /// Building, initializing or tearing down the sandbox failed.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The sandbox cannot run the job on this device.
    #[error("system requirement check failed: {0}")]
    RequirementCheckFailed(String),

    /// The artifact was read but did not yield a distinct implementation.
    #[error("failed to load {path}: {reason}")]
    ArtifactLoad { path: PathBuf, reason: String },

    /// The entry point is missing or does not speak the expected ABI.
    #[error("entry point lookup failed: {0}")]
    EntryPointSignature(String),

    /// The entry point ran and reported a failure.
    #[error("entry point failed with {type_name}: {message}")]
    EntryPointFailed { type_name: String, message: String },

    /// Processes rooted in the sandbox survived the wait and the kill.
    #[error("{count} process(es) still running in {dir} after {timeout_ms}ms")]
    ProcessesStillRunning {
        dir: PathBuf,
        count: usize,
        timeout_ms: u64,
    },

    /// The package snapshot could not be taken or resolved.
    #[error("package snapshot error: {0}")]
    Snapshot(String),

    /// Batch parameters could not be encoded or decoded.
    #[error("invalid batch description: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The job was cancelled before the expensive part started.
    #[error("job cancelled")]
    Cancelled,

    /// A collaborator panicked or failed in a way the driver cannot classify.
    #[error("unexpected failure: {0}")]
    Unexpected(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while reading the artifact or scanning processes.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error points at a broken build or packaging of the
    /// pending update rather than at the environment.
    pub fn is_packaging_problem(&self) -> bool {
        matches!(
            self,
            Error::ArtifactLoad { .. } | Error::EntryPointSignature(_)
        )
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
