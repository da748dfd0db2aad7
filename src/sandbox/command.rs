//! Sandbox lifecycle backed by an external setup helper.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::SandboxError;

use super::lifecycle::SandboxLifecycle;

/// A sandbox managed by a privileged helper binary.
///
/// The helper does the mounting. This type only translates lifecycle calls
/// into helper invocations:
///
/// - `setup [--slot <slot>] [--map-snapshots]`
/// - `init`
/// - `teardown [--allow-concurrent]`
///
/// A non-zero exit status becomes [`SandboxError::ServiceSpecific`] carrying
/// the exit code and the helper's stderr.
#[derive(Debug, Clone)]
pub struct CommandSandboxLifecycle {
    /// Path to the helper binary.
    helper: PathBuf,
    /// Root directory the helper builds the sandbox in.
    root: PathBuf,
}

impl CommandSandboxLifecycle {
    /// Creates a lifecycle that drives `helper` for the sandbox at `root`.
    pub fn new(helper: PathBuf, root: PathBuf) -> Self {
        Self { helper, root }
    }

    fn invoke(&self, args: &[&str]) -> Result<(), SandboxError> {
        let output = Command::new(&self.helper)
            .args(args)
            .output()
            .map_err(|e| {
                SandboxError::Communication(format!(
                    "failed to run {}: {}",
                    self.helper.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::ServiceSpecific {
                code: output.status.code().unwrap_or(-1),
                message: stderr.trim().to_string(),
            });
        }

        tracing::debug!(helper = ?self.helper, args = ?args, "sandbox helper succeeded");
        Ok(())
    }
}

impl SandboxLifecycle for CommandSandboxLifecycle {
    fn root(&self) -> &Path {
        &self.root
    }

    fn set_up(
        &self,
        update_slot: Option<&str>,
        remap_snapshots: bool,
    ) -> Result<(), SandboxError> {
        let mut args = vec!["setup"];
        if let Some(slot) = update_slot {
            args.push("--slot");
            args.push(slot);
        }
        if remap_snapshots {
            args.push("--map-snapshots");
        }
        self.invoke(&args)?;

        tracing::info!(
            root = ?self.root,
            slot = ?update_slot,
            remap_snapshots,
            "set up sandbox"
        );
        Ok(())
    }

    fn initialize(&self) -> Result<(), SandboxError> {
        self.invoke(&["init"])
    }

    fn tear_down(&self, allow_concurrent: bool) -> Result<(), SandboxError> {
        if allow_concurrent {
            self.invoke(&["teardown", "--allow-concurrent"])?;
        } else {
            self.invoke(&["teardown"])?;
        }

        tracing::info!(root = ?self.root, allow_concurrent, "tore down sandbox");
        Ok(())
    }
}
