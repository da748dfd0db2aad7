//! Pre-reboot driver - runs a pending update's recompilation pass in a sandbox
//!
//! This library builds a sandbox that mirrors a staged system update, loads the
//! update's own version of the recompilation entry point from inside it, and
//! runs that entry point from the currently running system before the device
//! reboots, tearing the sandbox down safely afterwards.

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod job;
pub mod packages;
pub mod quiescence;
pub mod sandbox;
pub mod service;

pub use error::{Error, Result, SandboxError};

pub use config::{DriverConfig, Validate, ValidationResult, REASON_PRE_REBOOT};
pub use driver::{DriverDeps, JobRequest, JobResult, JobStage, MaintenanceJobDriver};
pub use executor::abi::{EntryFailure, EntryRequest, REQUIREMENT_FAILURE_TYPE};
pub use executor::{DynamicModuleLoader, LoadedModule, MemoryImage, ModuleLoader, VersionedCodeExecutor};
pub use job::{JobStatus, PreRebootJob};
pub use packages::{
    BatchParameterResolver, BatchWorkDescription, EmptySnapshotProvider, FixedBatchResolver,
    PackageSnapshot, PackageSnapshotProvider,
};
pub use quiescence::{ProcessQuiescenceWaiter, ProcessReaper, ProcfsReaper, RootedProcess};
pub use sandbox::{CommandSandboxLifecycle, SandboxLifecycle};
pub use service::{CommandCompilerService, CompilerService, RequirementGate, ServiceCache, ServiceLink};
