//! Sandbox lifecycle trait.

use std::path::Path;

use crate::error::SandboxError;

/// Builds, finalizes and removes the sandbox.
///
/// Implementations own the sandbox exclusively. The driver never keeps a
/// handle to it beyond [`root`](SandboxLifecycle::root).
pub trait SandboxLifecycle: Send + Sync {
    /// Returns the root directory of the sandbox.
    fn root(&self) -> &Path;

    /// Mounts the pending update into the sandbox.
    ///
    /// `update_slot` is the slot holding a full system update (for example
    /// `"_b"`), or `None` for a component-only update. `remap_snapshots`
    /// requests mapping the update's snapshot devices and only applies to a
    /// full system update.
    ///
    /// Fails with [`SandboxError::ServiceSpecific`] if a sandbox is already
    /// active or the update state is invalid.
    fn set_up(&self, update_slot: Option<&str>, remap_snapshots: bool)
        -> Result<(), SandboxError>;

    /// Finalizes the sandbox so code can safely run inside it.
    fn initialize(&self) -> Result<(), SandboxError>;

    /// Unmounts and removes the sandbox.
    ///
    /// With `allow_concurrent == false` the caller asserts it is the only one
    /// tearing down, and a race is reported as an error. With
    /// `allow_concurrent == true` a teardown that another caller already
    /// completed counts as success.
    fn tear_down(&self, allow_concurrent: bool) -> Result<(), SandboxError>;
}
