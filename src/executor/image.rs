//! Anonymous in-memory copy of the entry-point artifact.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

use crate::error::Result;

/// Longest name the kernel accepts for a memfd, minus the `memfd:` prefix.
const MAX_MEMFD_NAME: usize = 249;

/// The artifact's bytes held in a memfd.
///
/// Loading from the memfd instead of the original path means nothing keeps a
/// file inside the sandbox open, so the sandbox can still be unmounted even if
/// the loaded module cannot be unloaded, and unmounting the source while the
/// module runs cannot pull it out from under the call.
#[derive(Debug)]
pub struct MemoryImage {
    file: File,
    origin: PathBuf,
    len: u64,
}

impl MemoryImage {
    /// Reads `path` fully into a new memfd.
    pub fn copy_from(path: &Path) -> Result<Self> {
        let mut source = File::open(path)?;

        let name = memfd_name(path)?;
        let fd = memfd_create(name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(io::Error::from)?;
        let mut file = File::from(fd);
        let len = io::copy(&mut source, &mut file)?;

        tracing::debug!(origin = ?path, bytes = len, "copied artifact into memory");
        Ok(Self {
            file,
            origin: path.to_path_buf(),
            len,
        })
    }

    /// Path through which the loader can open the in-memory copy.
    pub fn proc_path(&self) -> PathBuf {
        fd_path(&self.file)
    }

    /// Opens another descriptor onto the same in-memory copy.
    ///
    /// The alias has its own `/proc/self/fd` path, which lets the loader
    /// reach this image under a name no earlier load has used. The path stays
    /// valid only while the alias is alive.
    pub fn alias(&self) -> Result<ImageAlias> {
        Ok(ImageAlias {
            file: self.file.try_clone()?,
        })
    }

    /// Path the image was copied from.
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the artifact was empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Extra descriptor onto a [`MemoryImage`], closed on drop.
#[derive(Debug)]
pub struct ImageAlias {
    file: File,
}

impl ImageAlias {
    /// Path through which the loader can open the in-memory copy.
    pub fn proc_path(&self) -> PathBuf {
        fd_path(&self.file)
    }
}

fn fd_path(file: &File) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()))
}

fn memfd_name(path: &Path) -> Result<CString> {
    let mut name = format!("in memory from {}", path.display());
    if name.len() > MAX_MEMFD_NAME {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name = format!("in memory from {}", file_name);
        name.truncate(
            (0..=MAX_MEMFD_NAME)
                .rev()
                .find(|&i| name.is_char_boundary(i))
                .unwrap_or(0),
        );
    }
    CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e).into())
}
