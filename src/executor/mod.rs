//! Running the pending update's version of the recompilation entry point.
//!
//! The running process executes the old system version, but the job must use
//! the code that matches the pending update's on-disk format. The executor
//! copies the new module out of the sandbox into memory, loads it into an
//! isolated scope, checks that the load really produced a different entry
//! point than the one the running version has, and calls it with flat
//! arguments only. Nothing is cached between calls.

pub mod abi;
mod image;
mod loader;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::packages::BatchWorkDescription;
use crate::service::ServiceLink;

pub use image::{ImageAlias, MemoryImage};
pub use loader::{DynamicModuleLoader, EntryPoint, LoadedModule, ModuleLoader};

/// Loads and invokes the entry point shipped with the pending update.
pub struct VersionedCodeExecutor {
    loader: Arc<dyn ModuleLoader>,
    service: Arc<dyn ServiceLink>,
    artifact_path: PathBuf,
}

impl VersionedCodeExecutor {
    /// Creates an executor that loads `artifact_path` (relative to the
    /// sandbox root) with `loader`.
    pub fn new(
        loader: Arc<dyn ModuleLoader>,
        service: Arc<dyn ServiceLink>,
        artifact_path: PathBuf,
    ) -> Self {
        Self {
            loader,
            service,
            artifact_path,
        }
    }

    /// Runs the new entry point against `batch` inside `sandbox_root`.
    ///
    /// Blocks until the entry point returns; there is no way to interrupt it
    /// once started.
    pub fn execute(&self, sandbox_root: &Path, batch: &BatchWorkDescription) -> Result<()> {
        let artifact = sandbox_root.join(&self.artifact_path);
        let params = batch.encode()?;

        let image = MemoryImage::copy_from(&artifact)?;
        let module = self.loader.load(&image)?;
        let entry = module.resolve_entry_point()?;

        // A load that quietly resolved to the running version would run the
        // wrong code against the new on-disk format.
        if self.loader.local_entry_point() == Some(entry.address()) {
            return Err(Error::ArtifactLoad {
                path: artifact,
                reason: "entry point resolved to the running version".to_string(),
            });
        }
        if entry.abi_version != abi::ABI_VERSION {
            return Err(Error::EntryPointSignature(format!(
                "module declares ABI version {}, expected {}",
                entry.abi_version,
                abi::ABI_VERSION
            )));
        }

        tracing::info!(
            origin = ?module.origin(),
            packages = batch.packages.len(),
            "invoking pending update's entry point"
        );
        // SAFETY: `module` stays loaded until after the call returns.
        let result = unsafe {
            abi::invoke(
                entry.function,
                self.service.service_manager_handle(),
                sandbox_root,
                &params,
            )
        };

        drop(module);
        drop(image);
        result
    }
}
