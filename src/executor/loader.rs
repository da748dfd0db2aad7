//! Loading the entry-point module from an in-memory image.

use std::ffi::c_int;
use std::path::{Path, PathBuf};

use libloading::os::unix::{Library, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};

use crate::error::{Error, Result};

use super::abi::{EntryPointFn, ABI_VERSION_SYMBOL, ENTRY_POINT_SYMBOL};
use super::image::MemoryImage;

/// Resolve the module's own symbols before the process's global ones, so a
/// symbol defined by the new module always wins over a same-named one that
/// the running version already loaded.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
const RTLD_DEEPBIND: c_int = nix::libc::RTLD_DEEPBIND;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
const RTLD_DEEPBIND: c_int = 0;

/// Descriptors tried before giving up on a path no earlier module holds.
const MAX_PATH_ATTEMPTS: usize = 8;

/// An entry point resolved from a loaded module.
///
/// Only valid while the module it came from is loaded.
#[derive(Clone, Copy)]
pub struct EntryPoint {
    /// The function itself.
    pub function: EntryPointFn,
    /// ABI version the module declares.
    pub abi_version: u32,
}

impl EntryPoint {
    /// Address of the function, used to tell two loaded copies apart.
    pub fn address(&self) -> usize {
        self.function as usize
    }
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("abi_version", &self.abi_version)
            .finish()
    }
}

/// A module loaded for exactly one invocation. Unloaded on drop.
pub trait LoadedModule {
    /// Where the module's bytes came from.
    fn origin(&self) -> &Path;

    /// Looks up the entry point and ABI version by name.
    ///
    /// Fails with [`Error::EntryPointSignature`] if either symbol is missing.
    fn resolve_entry_point(&self) -> Result<EntryPoint>;
}

/// Creates throwaway modules from in-memory images.
pub trait ModuleLoader: Send + Sync {
    /// Loads `image` into a fresh, isolated module.
    fn load(&self, image: &MemoryImage) -> Result<Box<dyn LoadedModule>>;

    /// Address of the entry point already present in the running process, if
    /// the running version exports one.
    fn local_entry_point(&self) -> Option<usize>;
}

/// [`ModuleLoader`] backed by the dynamic linker.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicModuleLoader;

struct DynamicModule {
    library: Library,
    origin: PathBuf,
}

impl LoadedModule for DynamicModule {
    fn origin(&self) -> &Path {
        &self.origin
    }

    fn resolve_entry_point(&self) -> Result<EntryPoint> {
        // SAFETY: the symbol types match what `export_entry_point!` defines.
        unsafe {
            let function = *self
                .library
                .get::<EntryPointFn>(ENTRY_POINT_SYMBOL)
                .map_err(|e| Error::EntryPointSignature(e.to_string()))?;
            let version = *self
                .library
                .get::<*const u32>(ABI_VERSION_SYMBOL)
                .map_err(|e| Error::EntryPointSignature(e.to_string()))?;
            if version.is_null() {
                return Err(Error::EntryPointSignature(
                    "ABI version symbol is null".to_string(),
                ));
            }
            Ok(EntryPoint {
                function,
                abi_version: *version,
            })
        }
    }
}

impl ModuleLoader for DynamicModuleLoader {
    fn load(&self, image: &MemoryImage) -> Result<Box<dyn LoadedModule>> {
        // The dynamic linker hands back an already mapped module whose name
        // matches the requested path. Descriptor numbers are reused from job
        // to job, so a module from an earlier job that could not be unloaded
        // may still own this image's /proc path.
        let mut aliases = Vec::new();
        let mut path = image.proc_path();
        while is_loaded(&path) {
            if aliases.len() == MAX_PATH_ATTEMPTS {
                return Err(Error::ArtifactLoad {
                    path: image.origin().to_path_buf(),
                    reason: format!(
                        "{} still names a module from an earlier load",
                        path.display()
                    ),
                });
            }
            tracing::warn!(path = ?path, "earlier module still loaded under this path, using another descriptor");
            let alias = image.alias()?;
            path = alias.proc_path();
            aliases.push(alias);
        }

        // SAFETY: loading runs the module's initializers. The module comes from
        // the pending update, which is trusted as much as the running system.
        let library = unsafe { Library::open(Some(&path), RTLD_NOW | RTLD_LOCAL | RTLD_DEEPBIND) }
            .map_err(|e| Error::ArtifactLoad {
                path: image.origin().to_path_buf(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            origin = ?image.origin(),
            bytes = image.len(),
            path = ?path,
            "loaded entry-point module"
        );
        Ok(Box::new(DynamicModule {
            library,
            origin: image.origin().to_path_buf(),
        }))
    }

    fn local_entry_point(&self) -> Option<usize> {
        let this = Library::this();
        // SAFETY: only the address is read; the function is not called.
        unsafe { this.get::<EntryPointFn>(ENTRY_POINT_SYMBOL) }
            .ok()
            .map(|symbol| *symbol as usize)
    }
}

/// Returns true if the dynamic linker already has a module under `path`.
fn is_loaded(path: &Path) -> bool {
    // SAFETY: RTLD_NOLOAD never maps a module or runs initializers. A hit
    // takes a reference that dropping the handle gives back.
    unsafe { Library::open(Some(path), RTLD_LAZY | nix::libc::RTLD_NOLOAD) }.is_ok()
}
