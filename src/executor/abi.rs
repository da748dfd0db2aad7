//! The narrow ABI between the running version and the pending update's
//! version of the entry point.
//!
//! Both sides are compiled separately and may disagree on the layout of every
//! Rust type, including ones with the same name. Nothing but integers, raw
//! handles and byte buffers crosses the boundary: the batch description is
//! encoded by the caller and decoded by the callee, and a failure comes back
//! as a type name plus message written into a caller-owned buffer.

use std::ffi::{c_int, OsStr};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::packages::BatchWorkDescription;

/// Exported name of the entry-point function.
pub const ENTRY_POINT_SYMBOL: &[u8] = b"prereboot_entry_point\0";

/// Exported name of the `u32` static holding the module's ABI version.
pub const ABI_VERSION_SYMBOL: &[u8] = b"prereboot_abi_version\0";

/// ABI version spoken by this build.
pub const ABI_VERSION: u32 = 1;

/// Type name reported by an entry point whose requirement check failed.
pub const REQUIREMENT_FAILURE_TYPE: &str = "prereboot::SystemRequirementFailure";

/// Type name reported when the request could not be decoded.
pub const INVALID_REQUEST_TYPE: &str = "prereboot::InvalidRequest";

/// Type name reported when the handler panicked.
pub const PANIC_TYPE: &str = "prereboot::Panic";

/// Size of the buffer the caller provides for failure details.
pub const FAILURE_BUFFER_LEN: usize = 4096;

/// Returned by the entry point on success.
pub const STATUS_OK: c_int = 0;

/// Returned by the entry point after writing failure details.
pub const STATUS_FAILED: c_int = 1;

/// Signature of the exported entry point.
///
/// Arguments: service-manager handle (`-1` if none), sandbox root path bytes,
/// encoded batch description bytes, failure buffer.
pub type EntryPointFn = unsafe extern "C" fn(
    service_manager_handle: c_int,
    sandbox_root: *const u8,
    sandbox_root_len: usize,
    params: *const u8,
    params_len: usize,
    failure: *mut u8,
    failure_cap: usize,
) -> c_int;

/// A failure reported by the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    /// Name of the failure's type on the callee's side.
    pub type_name: String,
    /// Human-readable message.
    pub message: String,
}

impl EntryFailure {
    /// Creates a failure with an arbitrary type name.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Creates a failure signalling that the system requirements are not met.
    pub fn requirement(message: impl Into<String>) -> Self {
        Self::new(REQUIREMENT_FAILURE_TYPE, message)
    }

    /// Returns true if the type name matches the requirement-failure shape.
    ///
    /// Matched by name: the two sides never share a type.
    pub fn is_requirement_failure(&self) -> bool {
        self.type_name == REQUIREMENT_FAILURE_TYPE
    }

    /// Writes `type_name\0message` into `buf`, truncating the message to fit.
    /// Returns the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        let type_name = self.type_name.as_bytes();
        if buf.len() <= type_name.len() {
            return 0;
        }
        buf[..type_name.len()].copy_from_slice(type_name);
        buf[type_name.len()] = 0;

        let offset = type_name.len() + 1;
        let message = self.message.as_bytes();
        let len = message.len().min(buf.len() - offset);
        buf[offset..offset + len].copy_from_slice(&message[..len]);
        offset + len
    }

    /// Reads a failure written by [`encode_into`](Self::encode_into).
    ///
    /// Trailing zero bytes are ignored; an empty buffer yields an unnamed
    /// failure.
    pub fn decode(buf: &[u8]) -> Self {
        let end = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let buf = &buf[..end];
        let (type_name, message) = match buf.iter().position(|&b| b == 0) {
            Some(split) => (&buf[..split], &buf[split + 1..]),
            None => (buf, &[][..]),
        };
        let type_name = if type_name.is_empty() {
            "<unknown>".to_string()
        } else {
            String::from_utf8_lossy(type_name).into_owned()
        };
        Self::new(type_name, String::from_utf8_lossy(message))
    }
}

/// Decoded arguments handed to an entry-point handler on the callee side.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    /// Raw handle to the service manager, if the caller had one.
    pub service_manager_handle: Option<RawFd>,
    /// Root of the sandbox.
    pub sandbox_root: PathBuf,
    /// The callee's own copy of the batch description.
    pub batch: BatchWorkDescription,
}

/// Calls `entry` with flat arguments and translates its status.
///
/// # Safety
///
/// `entry` must point to a live function with the [`EntryPointFn`]
/// signature, i.e. the module it came from must still be loaded.
pub unsafe fn invoke(
    entry: EntryPointFn,
    service_manager_handle: Option<RawFd>,
    sandbox_root: &Path,
    params: &[u8],
) -> Result<()> {
    let root = sandbox_root.as_os_str().as_bytes();
    let mut failure = vec![0u8; FAILURE_BUFFER_LEN];

    let status = entry(
        service_manager_handle.unwrap_or(-1),
        root.as_ptr(),
        root.len(),
        params.as_ptr(),
        params.len(),
        failure.as_mut_ptr(),
        failure.len(),
    );

    if status == STATUS_OK {
        return Ok(());
    }
    let failure = EntryFailure::decode(&failure);
    Err(Error::EntryPointFailed {
        type_name: failure.type_name,
        message: failure.message,
    })
}

/// Implements the callee side of the entry point.
///
/// Decodes the flat arguments, runs `handler`, and reports any failure
/// (including a panic) through the failure buffer.
///
/// # Safety
///
/// The pointer and length pairs must describe valid, readable (or, for
/// `failure`, writable) memory for the duration of the call, as guaranteed by
/// [`invoke`].
#[allow(clippy::too_many_arguments)]
pub unsafe fn serve_entry_point<F>(
    service_manager_handle: c_int,
    sandbox_root: *const u8,
    sandbox_root_len: usize,
    params: *const u8,
    params_len: usize,
    failure: *mut u8,
    failure_cap: usize,
    handler: F,
) -> c_int
where
    F: FnOnce(EntryRequest) -> std::result::Result<(), EntryFailure>,
{
    let root = std::slice::from_raw_parts(sandbox_root, sandbox_root_len);
    let params = std::slice::from_raw_parts(params, params_len);
    let failure_buf = std::slice::from_raw_parts_mut(failure, failure_cap);

    let outcome = match BatchWorkDescription::decode(params) {
        Ok(batch) => {
            let request = EntryRequest {
                service_manager_handle: (service_manager_handle >= 0)
                    .then_some(service_manager_handle),
                sandbox_root: PathBuf::from(OsStr::from_bytes(root)),
                batch,
            };
            catch_unwind(AssertUnwindSafe(|| handler(request)))
                .unwrap_or_else(|_| Err(EntryFailure::new(PANIC_TYPE, "entry point panicked")))
        }
        Err(e) => Err(EntryFailure::new(INVALID_REQUEST_TYPE, e.to_string())),
    };

    match outcome {
        Ok(()) => STATUS_OK,
        Err(f) => {
            f.encode_into(failure_buf);
            STATUS_FAILED
        }
    }
}

/// Exports the entry point and ABI version from a module built against this
/// crate.
///
/// ```ignore
/// fn run(request: EntryRequest) -> Result<(), EntryFailure> { ... }
/// prereboot_driver::export_entry_point!(run);
/// ```
#[macro_export]
macro_rules! export_entry_point {
    ($handler:path) => {
        #[allow(non_upper_case_globals)]
        #[no_mangle]
        pub static prereboot_abi_version: u32 = $crate::executor::abi::ABI_VERSION;

        /// # Safety
        ///
        /// Called only through `executor::abi::invoke`.
        #[no_mangle]
        pub unsafe extern "C" fn prereboot_entry_point(
            service_manager_handle: ::std::ffi::c_int,
            sandbox_root: *const u8,
            sandbox_root_len: usize,
            params: *const u8,
            params_len: usize,
            failure: *mut u8,
            failure_cap: usize,
        ) -> ::std::ffi::c_int {
            $crate::executor::abi::serve_entry_point(
                service_manager_handle,
                sandbox_root,
                sandbox_root_len,
                params,
                params_len,
                failure,
                failure_cap,
                $handler,
            )
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(request: EntryRequest) -> std::result::Result<(), EntryFailure> {
        assert_eq!(request.sandbox_root, PathBuf::from("/mnt/root"));
        assert_eq!(request.service_manager_handle, Some(9));
        assert_eq!(request.batch.packages, vec!["com.example.mail".to_string()]);
        Ok(())
    }

    fn refuse(_request: EntryRequest) -> std::result::Result<(), EntryFailure> {
        Err(EntryFailure::requirement("kernel too old"))
    }

    fn explode(_request: EntryRequest) -> std::result::Result<(), EntryFailure> {
        panic!("boom");
    }

    unsafe extern "C" fn accepting_entry(
        handle: c_int,
        root: *const u8,
        root_len: usize,
        params: *const u8,
        params_len: usize,
        failure: *mut u8,
        failure_cap: usize,
    ) -> c_int {
        serve_entry_point(handle, root, root_len, params, params_len, failure, failure_cap, accept)
    }

    unsafe extern "C" fn refusing_entry(
        handle: c_int,
        root: *const u8,
        root_len: usize,
        params: *const u8,
        params_len: usize,
        failure: *mut u8,
        failure_cap: usize,
    ) -> c_int {
        serve_entry_point(handle, root, root_len, params, params_len, failure, failure_cap, refuse)
    }

    unsafe extern "C" fn panicking_entry(
        handle: c_int,
        root: *const u8,
        root_len: usize,
        params: *const u8,
        params_len: usize,
        failure: *mut u8,
        failure_cap: usize,
    ) -> c_int {
        serve_entry_point(handle, root, root_len, params, params_len, failure, failure_cap, explode)
    }

    fn params() -> Vec<u8> {
        BatchWorkDescription {
            packages: vec!["com.example.mail".to_string()],
            ..Default::default()
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn invoke_succeeds_when_entry_point_accepts() {
        let result = unsafe { invoke(accepting_entry, Some(9), Path::new("/mnt/root"), &params()) };
        assert!(result.is_ok());
    }

    #[test]
    fn invoke_reports_failure_type_name() {
        let err = unsafe { invoke(refusing_entry, None, Path::new("/mnt/root"), &params()) }
            .unwrap_err();

        match err {
            Error::EntryPointFailed { type_name, message } => {
                assert_eq!(type_name, REQUIREMENT_FAILURE_TYPE);
                assert_eq!(message, "kernel too old");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invoke_reports_undecodable_params() {
        let err = unsafe { invoke(accepting_entry, None, Path::new("/mnt/root"), b"nope") }
            .unwrap_err();
        assert!(matches!(err, Error::EntryPointFailed { ref type_name, .. } if type_name == INVALID_REQUEST_TYPE));
    }

    #[test]
    fn invoke_contains_callee_panics() {
        let err = unsafe { invoke(panicking_entry, None, Path::new("/mnt/root"), &params()) }
            .unwrap_err();
        assert!(matches!(err, Error::EntryPointFailed { ref type_name, .. } if type_name == PANIC_TYPE));
    }

    #[test]
    fn failure_encoding_truncates_long_messages() {
        let failure = EntryFailure::new("T", "x".repeat(100));
        let mut buf = [0u8; 16];

        let written = failure.encode_into(&mut buf);

        assert_eq!(written, 16);
        let decoded = EntryFailure::decode(&buf);
        assert_eq!(decoded.type_name, "T");
        assert_eq!(decoded.message, "x".repeat(14));
    }

    #[test]
    fn empty_failure_buffer_decodes_to_unknown() {
        let decoded = EntryFailure::decode(&[0u8; 32]);
        assert_eq!(decoded.type_name, "<unknown>");
        assert!(decoded.message.is_empty());
        assert!(!decoded.is_requirement_failure());
    }
}
