//! Access to the privileged compiler service.
//!
//! The service is a process-wide singleton owned by an external service
//! manager. The driver reaches it through a [`ServiceCache`] handed in at
//! construction, which also lets the driver drop every proxy it holds before
//! tearing the sandbox down.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Pass/fail check of whether the sandbox can run the job.
pub trait RequirementGate: Send + Sync {
    /// Returns `Ok(false)` when the sandbox rooted at `sandbox_root` does not
    /// meet the system requirements.
    fn check(&self, sandbox_root: &Path) -> Result<bool>;
}

/// A live proxy to the privileged compiler service.
pub trait CompilerService: Send + Sync {
    /// Checks whether the sandbox rooted at `sandbox_root` can run the job.
    fn check_requirements(&self, sandbox_root: &Path) -> Result<bool>;
}

/// What the driver needs from its connection to the compiler service.
pub trait ServiceLink: Send + Sync {
    /// Drops every proxy this process holds so the service manager can stop
    /// the service.
    fn release(&self);

    /// Raw handle to the service manager, obtained independently of any
    /// proxy. Passed across the version boundary as a plain integer.
    fn service_manager_handle(&self) -> Option<RawFd>;
}

type Connector = dyn Fn() -> Result<Arc<dyn CompilerService>> + Send + Sync;

/// Lazily connects to the compiler service and caches the proxy.
pub struct ServiceCache {
    connector: Box<Connector>,
    cached: Mutex<Option<Arc<dyn CompilerService>>>,
    manager_handle: Option<RawFd>,
}

impl ServiceCache {
    /// Creates a cache that connects with `connector` on first use.
    pub fn new<F>(connector: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn CompilerService>> + Send + Sync + 'static,
    {
        Self {
            connector: Box::new(connector),
            cached: Mutex::new(None),
            manager_handle: None,
        }
    }

    /// Sets the raw service-manager handle forwarded to the entry point.
    pub fn with_manager_handle(mut self, handle: RawFd) -> Self {
        self.manager_handle = Some(handle);
        self
    }

    /// Returns the cached proxy, connecting if needed.
    pub fn get(&self) -> Result<Arc<dyn CompilerService>> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| Error::ServiceCommunication("service cache poisoned".to_string()))?;
        if let Some(service) = cached.as_ref() {
            return Ok(Arc::clone(service));
        }

        let service = (self.connector)()?;
        *cached = Some(Arc::clone(&service));
        tracing::debug!("connected to compiler service");
        Ok(service)
    }

    /// Returns true if a proxy is currently cached.
    pub fn is_connected(&self) -> bool {
        self.cached.lock().map(|c| c.is_some()).unwrap_or(false)
    }
}

impl RequirementGate for ServiceCache {
    fn check(&self, sandbox_root: &Path) -> Result<bool> {
        self.get()?.check_requirements(sandbox_root)
    }
}

impl ServiceLink for ServiceCache {
    fn release(&self) {
        let dropped = match self.cached.lock() {
            Ok(mut cached) => cached.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(service) = dropped {
            let others = Arc::strong_count(&service) - 1;
            if others > 0 {
                tracing::warn!(
                    references = others,
                    "compiler service proxy still referenced after release"
                );
            }
            tracing::debug!("released compiler service proxy");
        }
    }

    fn service_manager_handle(&self) -> Option<RawFd> {
        self.manager_handle
    }
}

/// Compiler service reached through a helper binary.
///
/// `check_requirements` runs `<helper> check <sandbox_root>`. Exit status 0
/// means the requirements are met, 1 means they are not, and anything else
/// is a communication failure.
#[derive(Debug, Clone)]
pub struct CommandCompilerService {
    helper: PathBuf,
}

impl CommandCompilerService {
    /// Creates a service proxy backed by `helper`.
    pub fn new(helper: PathBuf) -> Self {
        Self { helper }
    }
}

impl CompilerService for CommandCompilerService {
    fn check_requirements(&self, sandbox_root: &Path) -> Result<bool> {
        let output = Command::new(&self.helper)
            .arg("check")
            .arg(sandbox_root)
            .output()
            .map_err(|e| {
                Error::ServiceCommunication(format!(
                    "failed to run {}: {}",
                    self.helper.display(),
                    e
                ))
            })?;

        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(reason = %stderr.trim(), "system requirements not met");
                Ok(false)
            }
            code => Err(Error::ServiceCommunication(format!(
                "requirement check exited with {:?}",
                code
            ))),
        }
    }
}
