//! Waiting for the sandbox to become quiescent before teardown.
//!
//! The sandbox cannot be unmounted while a process still holds files open
//! inside it. The privileged compiler service is such a process, and it is
//! owned by a service manager that offers neither a stop call nor an exit
//! notification. The waiter therefore drops every proxy to the service,
//! gives the manager a bounded amount of time to stop it, and kills whatever
//! is still running from the sandbox once that time is up.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::service::ServiceLink;

/// A process whose executable lives inside a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootedProcess {
    /// Process id.
    pub pid: i32,
    /// Short process name from `/proc/<pid>/comm`.
    pub name: String,
}

/// A process found running from the sandbox.
///
/// Pinned by a pidfd where the kernel supports it, so a signal can never
/// reach a later process that reuses the pid.
struct Tracked {
    name: String,
    pidfd: Option<OwnedFd>,
}

/// Finds, waits for and kills processes running from a directory.
pub trait ProcessReaper: Send + Sync {
    /// Waits up to `timeout` for every process whose executable is under
    /// `dir` to exit, kills the survivors, and fails if any are still alive
    /// after a second wait.
    fn ensure_no_process_in_dir(&self, dir: &Path, timeout: Duration) -> Result<()>;
}

/// [`ProcessReaper`] that reads the process list from procfs.
#[derive(Debug, Clone)]
pub struct ProcfsReaper {
    proc_root: PathBuf,
    poll_interval: Duration,
}

impl Default for ProcfsReaper {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl ProcfsReaper {
    /// Creates a reaper that re-scans every `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            poll_interval,
        }
    }

    /// Lists the processes whose executable is under `dir`.
    ///
    /// Processes this caller cannot inspect are skipped.
    pub fn processes_in_dir(&self, dir: &Path) -> Result<Vec<RootedProcess>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            if self.is_rooted_in(pid, dir) {
                found.push(RootedProcess {
                    pid,
                    name: self.process_name(pid),
                });
            }
        }
        Ok(found)
    }

    fn is_rooted_in(&self, pid: i32, dir: &Path) -> bool {
        match std::fs::read_link(self.proc_root.join(pid.to_string()).join("exe")) {
            Ok(exe) => exe.starts_with(dir),
            // Gone, a zombie, or not ours to look at.
            Err(_) => false,
        }
    }

    /// Pins `process` and checks it still runs from `dir`.
    ///
    /// Returns `None` if it has exited or its pid now belongs to a process
    /// outside `dir`.
    fn track(&self, process: RootedProcess, dir: &Path) -> Option<Tracked> {
        let pidfd = match pidfd_open(process.pid) {
            Ok(pidfd) => Some(pidfd),
            Err(Errno::ESRCH) => return None,
            Err(e) => {
                tracing::debug!(pid = process.pid, error = %e, "pidfd unavailable, signalling by pid");
                None
            }
        };
        // The pid may have been reused between the scan and pidfd_open.
        if !self.is_rooted_in(process.pid, dir) {
            return None;
        }
        Some(Tracked {
            name: process.name,
            pidfd,
        })
    }

    fn kill_tracked(&self, pid: i32, tracked: &Tracked, dir: &Path) -> nix::Result<()> {
        let result = match &tracked.pidfd {
            Some(pidfd) => pidfd_send_sigkill(pidfd),
            // Without a pidfd, only a fresh check narrows the reuse window.
            None if self.is_rooted_in(pid, dir) => kill(Pid::from_raw(pid), Signal::SIGKILL),
            None => Ok(()),
        };
        match result {
            Err(Errno::ESRCH) => Ok(()),
            other => other,
        }
    }

    fn process_name(&self, pid: i32) -> String {
        match std::fs::read_to_string(self.proc_root.join(pid.to_string()).join("comm")) {
            Ok(comm) => comm
                .split(|c| c == '\n' || c == '\0')
                .next()
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to read process name");
                String::new()
            }
        }
    }

    /// Polls until every process in `running` has exited or `timeout` passes.
    fn wait_for_exit(
        &self,
        dir: &Path,
        running: &mut HashMap<i32, Tracked>,
        timeout: Duration,
    ) {
        let start = Instant::now();
        loop {
            running.retain(|&pid, tracked| {
                if self.is_rooted_in(pid, dir) {
                    return true;
                }
                tracing::info!(
                    pid,
                    name = %tracked.name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "sandboxed process exited"
                );
                false
            });

            let elapsed = start.elapsed();
            if running.is_empty() || elapsed >= timeout {
                return;
            }
            std::thread::sleep(self.poll_interval.min(timeout - elapsed));
        }
    }
}

impl ProcessReaper for ProcfsReaper {
    fn ensure_no_process_in_dir(&self, dir: &Path, timeout: Duration) -> Result<()> {
        let mut running: HashMap<i32, Tracked> = HashMap::new();
        for process in self.processes_in_dir(dir)? {
            let pid = process.pid;
            if let Some(tracked) = self.track(process, dir) {
                tracing::info!(pid, name = %tracked.name, "process still running in sandbox, waiting for it to exit");
                running.insert(pid, tracked);
            }
        }

        self.wait_for_exit(dir, &mut running, timeout);
        if running.is_empty() {
            return Ok(());
        }

        for (&pid, tracked) in &running {
            tracing::error!(
                pid,
                name = %tracked.name,
                timeout_ms = timeout.as_millis() as u64,
                "process still running in sandbox after timeout, killing it"
            );
            if let Err(e) = self.kill_tracked(pid, tracked, dir) {
                tracing::error!(pid, name = %tracked.name, error = %e, "failed to kill process");
            }
        }

        self.wait_for_exit(dir, &mut running, timeout);
        if running.is_empty() {
            return Ok(());
        }

        Err(Error::ProcessesStillRunning {
            dir: dir.to_path_buf(),
            count: running.len(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

fn pidfd_open(pid: i32) -> nix::Result<OwnedFd> {
    // SAFETY: no pointer arguments.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if fd < 0 {
        return Err(Errno::last());
    }
    // SAFETY: the kernel just returned this descriptor and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn pidfd_send_sigkill(pidfd: &OwnedFd) -> nix::Result<()> {
    // SAFETY: a null siginfo makes this behave like kill(2).
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            libc::SIGKILL,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Makes the sandbox safe to tear down.
pub struct ProcessQuiescenceWaiter {
    service: Arc<dyn ServiceLink>,
    reaper: Arc<dyn ProcessReaper>,
    timeout: Duration,
}

impl ProcessQuiescenceWaiter {
    /// Creates a waiter that gives processes `timeout` to exit on their own.
    pub fn new(
        service: Arc<dyn ServiceLink>,
        reaper: Arc<dyn ProcessReaper>,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            reaper,
            timeout,
        }
    }

    /// Releases the compiler service and waits until nothing runs from
    /// `sandbox_root`.
    ///
    /// Only after this returns `Ok` is the sandbox safe to unmount.
    pub fn wait(&self, sandbox_root: &Path) -> Result<()> {
        // Dropping the last proxy lets the service manager stop the service.
        self.service.release();
        self.reaper.ensure_no_process_in_dir(sandbox_root, self.timeout)
    }
}
