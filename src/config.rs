//! Driver configuration and validation.
//!
//! The configuration is usually loaded from a TOML file; every field has a
//! default so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default root of the sandbox that mirrors the pending update.
pub const DEFAULT_SANDBOX_ROOT: &str = "/mnt/pre_reboot_dexopt/chroot";

/// Default location of the recompilation artifact, relative to the sandbox root.
pub const DEFAULT_ARTIFACT_PATH: &str = "apex/com.android.art/lib64/libprereboot_service.so";

/// Default helper binary that mounts and unmounts the sandbox.
pub const DEFAULT_SETUP_HELPER: &str = "/apex/com.android.art/bin/dexopt_chroot_setup";

/// Reason code used when resolving batch parameters.
pub const REASON_PRE_REBOOT: &str = "ab-ota";

/// Configuration for [`MaintenanceJobDriver`](crate::driver::MaintenanceJobDriver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Root directory of the sandbox.
    pub sandbox_root: PathBuf,

    /// Path of the new version's entry-point module inside the sandbox.
    pub artifact_path: PathBuf,

    /// How long to wait for sandboxed processes to exit before killing them.
    #[serde(with = "millis")]
    pub quiescence_timeout: Duration,

    /// How often to re-scan the process list while waiting.
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// Helper binary that builds, initializes and removes the sandbox.
    pub setup_helper: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from(DEFAULT_SANDBOX_ROOT),
            artifact_path: PathBuf::from(DEFAULT_ARTIFACT_PATH),
            quiescence_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(50),
            setup_helper: PathBuf::from(DEFAULT_SETUP_HELPER),
        }
    }
}

impl DriverConfig {
    /// Loads a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Sets the sandbox root.
    pub fn with_sandbox_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sandbox_root = root.into();
        self
    }

    /// Sets the quiescence timeout.
    pub fn with_quiescence_timeout(mut self, timeout: Duration) -> Self {
        self.quiescence_timeout = timeout;
        self
    }

    /// Absolute path of the artifact as seen from outside the sandbox.
    pub fn artifact_location(&self) -> PathBuf {
        self.sandbox_root.join(&self.artifact_path)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for DriverConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !self.sandbox_root.is_absolute() {
            result.add_error("sandbox_root must be an absolute path");
        }
        if self.sandbox_root == Path::new("/") {
            result.add_error("sandbox_root cannot be the filesystem root");
        }

        if self.artifact_path.as_os_str().is_empty() {
            result.add_error("artifact_path cannot be empty");
        } else if self.artifact_path.is_absolute() {
            result.add_error("artifact_path must be relative to sandbox_root");
        }

        if self.poll_interval.is_zero() {
            result.add_error("poll_interval must be greater than zero");
        } else if self.poll_interval > self.quiescence_timeout {
            result.add_warning("poll_interval exceeds quiescence_timeout; only one scan will run");
        }

        if self.quiescence_timeout < Duration::from_millis(500) {
            result.add_warning(
                "quiescence_timeout under 500ms will likely kill the compiler service",
            );
        }

        result
    }
}
