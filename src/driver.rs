//! The pre-reboot job driver.
//!
//! A job takes a package snapshot, resolves the batch to recompile, builds
//! the sandbox, checks that the device can run the job, and hands the batch
//! to the pending update's entry point. Teardown runs on every path out of
//! the job once the snapshot stage has been entered, and the job always ends
//! with exactly one [`JobResult`].
//!
//! ```text
//! IDLE -> SNAPSHOT -> CANCELLED ------------------------------------------> TEARDOWN -> DONE
//!                  -> SETUP -> REQUIREMENT_CHECK -> SANDBOX_INIT -> EXECUTE -> TEARDOWN -> DONE
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{DriverConfig, REASON_PRE_REBOOT};
use crate::error::{Error, Result, SandboxError};
use crate::executor::abi::REQUIREMENT_FAILURE_TYPE;
use crate::executor::{ModuleLoader, VersionedCodeExecutor};
use crate::packages::{BatchParameterResolver, PackageSnapshotProvider};
use crate::quiescence::{ProcessQuiescenceWaiter, ProcessReaper};
use crate::sandbox::SandboxLifecycle;
use crate::service::{RequirementGate, ServiceLink};

/// Parameters of one job run.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Slot holding a full system update (`"_a"` or `"_b"`), or `None` for a
    /// component-only update.
    pub update_slot: Option<String>,
    /// Whether to map the update's snapshot devices. Only applies to a full
    /// system update.
    pub remap_snapshots: bool,
    /// Checked once, right before the sandbox is built.
    pub cancellation: CancellationToken,
}

impl JobRequest {
    /// Creates a request for a full system update in `slot`.
    pub fn system_update(
        slot: impl Into<String>,
        remap_snapshots: bool,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            update_slot: Some(slot.into()),
            remap_snapshots,
            cancellation,
        }
    }

    /// Creates a request for a component-only update.
    pub fn component_update(cancellation: CancellationToken) -> Self {
        Self {
            update_slot: None,
            remap_snapshots: false,
            cancellation,
        }
    }
}

/// Outcome of a job run.
///
/// A failed requirement check always implies failure. A cancelled job is a
/// success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    success: bool,
    requirement_check_failed: bool,
    #[serde(default)]
    cancelled: bool,
}

impl JobResult {
    /// The job completed, or was cancelled before the expensive part.
    pub fn succeeded() -> Self {
        Self {
            success: true,
            requirement_check_failed: false,
            cancelled: false,
        }
    }

    /// The job was cancelled before the sandbox was built.
    pub fn cancelled() -> Self {
        Self {
            success: true,
            requirement_check_failed: false,
            cancelled: true,
        }
    }

    /// The job failed.
    pub fn failed() -> Self {
        Self {
            success: false,
            requirement_check_failed: false,
            cancelled: false,
        }
    }

    /// The device does not meet the requirements to run the job.
    pub fn requirement_check_failed() -> Self {
        Self {
            success: false,
            requirement_check_failed: true,
            cancelled: false,
        }
    }

    /// Whether the job succeeded.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Whether the job failed because of the requirement check.
    pub fn is_requirement_check_failed(&self) -> bool {
        self.requirement_check_failed
    }

    /// Whether the job stopped at the cancellation check instead of running.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Stage of a job run, reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Idle,
    Snapshot,
    Cancelled,
    SetUp,
    RequirementCheck,
    SandboxInit,
    Execute,
    TearDown,
    Done,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStage::Idle => "idle",
            JobStage::Snapshot => "snapshot",
            JobStage::Cancelled => "cancelled",
            JobStage::SetUp => "setup",
            JobStage::RequirementCheck => "requirement_check",
            JobStage::SandboxInit => "sandbox_init",
            JobStage::Execute => "execute",
            JobStage::TearDown => "teardown",
            JobStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Process-wide collaborators the driver works with.
///
/// Injected instead of looked up globally so tests can substitute any of them.
#[derive(Clone)]
pub struct DriverDeps {
    pub sandbox: Arc<dyn SandboxLifecycle>,
    pub gate: Arc<dyn RequirementGate>,
    pub service: Arc<dyn ServiceLink>,
    pub snapshots: Arc<dyn PackageSnapshotProvider>,
    pub resolver: Arc<dyn BatchParameterResolver>,
    pub loader: Arc<dyn ModuleLoader>,
    pub reaper: Arc<dyn ProcessReaper>,
}

/// Runs pre-reboot jobs. Jobs are not retried.
pub struct MaintenanceJobDriver {
    sandbox: Arc<dyn SandboxLifecycle>,
    gate: Arc<dyn RequirementGate>,
    snapshots: Arc<dyn PackageSnapshotProvider>,
    resolver: Arc<dyn BatchParameterResolver>,
    executor: VersionedCodeExecutor,
    waiter: ProcessQuiescenceWaiter,
}

impl MaintenanceJobDriver {
    /// Creates a driver from `config` and its collaborators.
    pub fn new(config: &DriverConfig, deps: DriverDeps) -> Self {
        let executor = VersionedCodeExecutor::new(
            deps.loader,
            Arc::clone(&deps.service),
            config.artifact_path.clone(),
        );
        let waiter =
            ProcessQuiescenceWaiter::new(deps.service, deps.reaper, config.quiescence_timeout);
        Self {
            sandbox: deps.sandbox,
            gate: deps.gate,
            snapshots: deps.snapshots,
            resolver: deps.resolver,
            executor,
            waiter,
        }
    }

    /// Runs a job and reports its outcome. Never fails or panics; failures
    /// are logged and folded into the result.
    pub fn run(&self, request: &JobRequest) -> JobResult {
        enter(JobStage::Idle);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_stages(request)))
            .unwrap_or_else(|payload| Err(Error::Unexpected(panic_message(payload))));

        let result = match outcome {
            Ok(Completion::Finished) => JobResult::succeeded(),
            Ok(Completion::Cancelled) => JobResult::cancelled(),
            Err(e) if report_job_failure(&e) => JobResult::requirement_check_failed(),
            Err(_) => JobResult::failed(),
        };

        enter(JobStage::TearDown);
        match catch_unwind(AssertUnwindSafe(|| self.tear_down())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report_teardown_failure(&e),
            Err(payload) => report_teardown_failure(&Error::Unexpected(panic_message(payload))),
        }

        enter(JobStage::Done);
        tracing::info!(
            success = result.success(),
            requirement_check_failed = result.is_requirement_check_failed(),
            cancelled = result.was_cancelled(),
            "pre-reboot job finished"
        );
        result
    }

    /// Builds and removes the sandbox without running anything in it.
    ///
    /// Teardown is attempted exactly once: explicitly after a successful
    /// setup, or best-effort (errors swallowed) when setup fails.
    pub fn test(&self) -> Result<()> {
        let mut teardown_attempted = false;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.set_up(None, false)?;
            teardown_attempted = true;
            self.tear_down()
        }));

        if !teardown_attempted {
            match catch_unwind(AssertUnwindSafe(|| self.tear_down())) {
                Ok(Err(e)) => tracing::debug!(error = %e, "best-effort teardown failed"),
                Err(_) => tracing::debug!("best-effort teardown panicked"),
                Ok(Ok(())) => {}
            }
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Removes a sandbox left behind by a job that did not end normally.
    ///
    /// Safe to call at any time, including while a job is finishing its own
    /// teardown. Does nothing if there is no sandbox directory.
    pub fn cleanup_leftover_sandbox(&self) {
        let root = self.sandbox.root();
        if !root.exists() {
            return;
        }
        tracing::info!(root = ?root, "cleaning up leftover sandbox");

        if let Err(e) = self.waiter.wait(root) {
            tracing::error!(error = %e, "leftover sandbox is still busy, tearing down anyway");
        }
        match self.sandbox.tear_down(true) {
            Ok(()) => tracing::info!(root = ?root, "cleaned up leftover sandbox"),
            Err(SandboxError::Communication(e)) => {
                tracing::error!(error = %e, "failed to reach sandbox service")
            }
            Err(e) => tracing::error!(error = %e, "failed to clean up leftover sandbox"),
        }
    }

    fn run_stages(&self, request: &JobRequest) -> Result<Completion> {
        enter(JobStage::Snapshot);
        let snapshot = self.snapshots.acquire()?;
        let batch = match self
            .resolver
            .resolve(&*snapshot, REASON_PRE_REBOOT, &request.cancellation)
        {
            Ok(batch) => batch,
            Err(Error::Cancelled) => {
                enter(JobStage::Cancelled);
                return Ok(Completion::Cancelled);
            }
            Err(e) => return Err(e),
        };
        if request.cancellation.is_cancelled() {
            enter(JobStage::Cancelled);
            tracing::info!("pre-reboot job cancelled before setup");
            return Ok(Completion::Cancelled);
        }

        self.set_up(request.update_slot.as_deref(), request.remap_snapshots)?;

        enter(JobStage::Execute);
        self.executor.execute(self.sandbox.root(), &batch)?;
        Ok(Completion::Finished)
    }

    fn set_up(&self, update_slot: Option<&str>, remap_snapshots: bool) -> Result<()> {
        enter(JobStage::SetUp);
        self.sandbox.set_up(update_slot, remap_snapshots)?;

        enter(JobStage::RequirementCheck);
        if !self.gate.check(self.sandbox.root())? {
            return Err(Error::RequirementCheckFailed(
                "see logs for details".to_string(),
            ));
        }

        enter(JobStage::SandboxInit);
        self.sandbox.initialize()?;
        Ok(())
    }

    fn tear_down(&self) -> Result<()> {
        // Teardown unmounts the update's partitions, which fails while any
        // process still holds files open under the sandbox root.
        if let Err(e) = self.waiter.wait(self.sandbox.root()) {
            tracing::error!(error = %e, "sandbox is still busy, tearing down anyway");
        }
        self.sandbox.tear_down(false)?;
        Ok(())
    }
}

/// How a job that did not fail came to an end.
enum Completion {
    Finished,
    Cancelled,
}

fn enter(stage: JobStage) {
    tracing::debug!(stage = %stage, "pre-reboot job stage");
}

/// Logs a job failure. Returns true if it means the requirements are not met.
fn report_job_failure(error: &Error) -> bool {
    match error {
        Error::ServiceCommunication(_) => {
            tracing::error!(error = %error, "compiler service communication failed");
        }
        Error::Sandbox(_) => {
            tracing::error!(error = %error, "failed to set up sandbox");
        }
        Error::RequirementCheckFailed(_) => {
            tracing::error!(error = %error, "system requirement check failed");
            return true;
        }
        // Not produced by any released entry point yet.
        Error::EntryPointFailed { type_name, .. } if type_name == REQUIREMENT_FAILURE_TYPE => {
            tracing::error!(error = %error, "system requirement check failed in sandbox");
            return true;
        }
        e if e.is_packaging_problem() => {
            tracing::error!(
                error = %error,
                packaging = true,
                "failed to load the pending update's entry point"
            );
        }
        Error::EntryPointFailed { .. } | Error::Unexpected(_) => {
            tracing::error!(error = %error, unexpected = true, "pre-reboot job failed unexpectedly");
        }
        _ => {
            tracing::error!(error = %error, "failed to run pre-reboot job");
        }
    }
    false
}

fn report_teardown_failure(error: &Error) {
    match error {
        Error::ServiceCommunication(_) | Error::Sandbox(SandboxError::Communication(_)) => {
            tracing::error!(error = %error, "failed to reach sandbox service for teardown")
        }
        _ => tracing::error!(error = %error, "failed to tear down sandbox"),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
