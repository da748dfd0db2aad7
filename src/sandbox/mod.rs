//! Sandbox module for the isolated root that mirrors a pending update.
//!
//! This module provides the [`SandboxLifecycle`] trait consumed by the driver
//! and the [`CommandSandboxLifecycle`] implementation that delegates to an
//! external setup helper.

mod command;
mod lifecycle;

pub use command::CommandSandboxLifecycle;
pub use lifecycle::SandboxLifecycle;
