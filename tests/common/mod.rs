//! Recording fakes shared by the integration tests.
//!
//! Every fake appends to one event log, so tests can assert on the order in
//! which the driver talks to its collaborators. The fake entry point writes to
//! the same log, found next to the sandbox root it is handed.

#![allow(dead_code)]

use std::ffi::c_int;
use std::io::Write;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use prereboot_driver::executor::abi::{self, EntryFailure, EntryPointFn};
use prereboot_driver::executor::EntryPoint;
use prereboot_driver::{
    BatchParameterResolver, BatchWorkDescription, DriverConfig, DriverDeps, Error, LoadedModule,
    MaintenanceJobDriver, MemoryImage, ModuleLoader, PackageSnapshot, PackageSnapshotProvider,
    ProcessReaper, RequirementGate, Result, SandboxError, SandboxLifecycle, ServiceLink,
};

pub const EVENTS_FILE: &str = "events.log";
pub const ARTIFACT_PATH: &str = "lib/libprereboot_service.so";

/// Compiler filter that makes the fake entry point fail.
pub const FAILING_FILTER: &str = "fail";

/// Compiler filter that makes the fake entry point report a requirement failure.
pub const REQUIREMENT_FILTER: &str = "requirement";

/// Append-only event log on disk.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn record(&self, event: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .expect("failed to open event log");
        writeln!(file, "{}", event).expect("failed to write event log");
    }

    pub fn events(&self) -> Vec<String> {
        std::fs::read_to_string(&self.path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    /// Index of the first occurrence of `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

/// How the fake requirement gate answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAnswer {
    Pass,
    Fail,
    Unreachable,
}

/// Knobs for one test scenario.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub gate: GateAnswer,
    pub set_up_fails: bool,
    pub initialize_fails: bool,
    pub tear_down_fails: bool,
    pub reaper_fails: bool,
    pub reaper_delay: Duration,
    pub snapshot_fails: bool,
    pub resolver_reports_cancel: bool,
    pub resolver_panics: bool,
    pub resolve_delay: Duration,
    pub loads_running_version: bool,
    pub batch: BatchWorkDescription,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            gate: GateAnswer::Pass,
            set_up_fails: false,
            initialize_fails: false,
            tear_down_fails: false,
            reaper_fails: false,
            reaper_delay: Duration::ZERO,
            snapshot_fails: false,
            resolver_reports_cancel: false,
            resolver_panics: false,
            resolve_delay: Duration::ZERO,
            loads_running_version: false,
            batch: BatchWorkDescription {
                packages: vec!["com.example.mail".to_string(), "com.example.maps".to_string()],
                compiler_filter: "speed-profile".to_string(),
                priority_class: 40,
                flags: 0,
            },
        }
    }
}

/// Temp directory holding a sandbox root and the event log beside it.
pub struct Fixture {
    pub temp: TempDir,
    pub root: PathBuf,
    pub log: EventLog,
}

impl Fixture {
    /// Creates a fixture whose sandbox directory exists and holds an artifact.
    pub fn new() -> Self {
        let fixture = Self::without_sandbox_dir();
        std::fs::create_dir_all(fixture.root.join("lib")).expect("failed to create sandbox");
        std::fs::write(fixture.root.join(ARTIFACT_PATH), b"\x7fELF new version")
            .expect("failed to write artifact");
        fixture
    }

    /// Creates a fixture with no sandbox directory.
    pub fn without_sandbox_dir() -> Self {
        let temp = TempDir::new().expect("failed to create temp dir");
        let root = temp.path().join("sandbox");
        let log = EventLog::new(temp.path().join(EVENTS_FILE));
        Self { temp, root, log }
    }

    pub fn config(&self) -> DriverConfig {
        DriverConfig {
            sandbox_root: self.root.clone(),
            artifact_path: PathBuf::from(ARTIFACT_PATH),
            quiescence_timeout: Duration::from_millis(5000),
            ..Default::default()
        }
    }

    pub fn driver(&self, scenario: &Scenario) -> MaintenanceJobDriver {
        let deps = DriverDeps {
            sandbox: Arc::new(FakeSandbox {
                root: self.root.clone(),
                log: self.log.clone(),
                set_up_fails: scenario.set_up_fails,
                initialize_fails: scenario.initialize_fails,
                tear_down_fails: scenario.tear_down_fails,
            }),
            gate: Arc::new(FakeGate {
                log: self.log.clone(),
                answer: scenario.gate,
            }),
            service: Arc::new(FakeLink {
                log: self.log.clone(),
            }),
            snapshots: Arc::new(FakeSnapshots {
                log: self.log.clone(),
                fails: scenario.snapshot_fails,
            }),
            resolver: Arc::new(FakeResolver {
                log: self.log.clone(),
                batch: scenario.batch.clone(),
                reports_cancel: scenario.resolver_reports_cancel,
                panics: scenario.resolver_panics,
                delay: scenario.resolve_delay,
            }),
            loader: Arc::new(FakeLoader {
                log: self.log.clone(),
                loads_running_version: scenario.loads_running_version,
            }),
            reaper: Arc::new(FakeReaper {
                log: self.log.clone(),
                fails: scenario.reaper_fails,
                delay: scenario.reaper_delay,
            }),
        };
        MaintenanceJobDriver::new(&self.config(), deps)
    }

    pub fn events(&self) -> Vec<String> {
        self.log.events()
    }
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

pub fn cancelled_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

struct FakeSandbox {
    root: PathBuf,
    log: EventLog,
    set_up_fails: bool,
    initialize_fails: bool,
    tear_down_fails: bool,
}

impl SandboxLifecycle for FakeSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    fn set_up(
        &self,
        update_slot: Option<&str>,
        remap_snapshots: bool,
    ) -> std::result::Result<(), SandboxError> {
        self.log.record(&format!(
            "set_up({},{})",
            update_slot.unwrap_or("none"),
            remap_snapshots
        ));
        if self.set_up_fails {
            return Err(SandboxError::ServiceSpecific {
                code: 1,
                message: "sandbox already active".to_string(),
            });
        }
        Ok(())
    }

    fn initialize(&self) -> std::result::Result<(), SandboxError> {
        self.log.record("initialize");
        if self.initialize_fails {
            return Err(SandboxError::ServiceSpecific {
                code: 2,
                message: "init failed".to_string(),
            });
        }
        Ok(())
    }

    fn tear_down(&self, allow_concurrent: bool) -> std::result::Result<(), SandboxError> {
        self.log.record(&format!("tear_down({})", allow_concurrent));
        if self.tear_down_fails {
            return Err(SandboxError::ServiceSpecific {
                code: 16,
                message: "device busy".to_string(),
            });
        }
        Ok(())
    }
}

struct FakeGate {
    log: EventLog,
    answer: GateAnswer,
}

impl RequirementGate for FakeGate {
    fn check(&self, _sandbox_root: &Path) -> Result<bool> {
        self.log.record("check_requirements");
        match self.answer {
            GateAnswer::Pass => Ok(true),
            GateAnswer::Fail => Ok(false),
            GateAnswer::Unreachable => {
                Err(Error::ServiceCommunication("service died".to_string()))
            }
        }
    }
}

struct FakeLink {
    log: EventLog,
}

impl ServiceLink for FakeLink {
    fn release(&self) {
        self.log.record("release_service");
    }

    fn service_manager_handle(&self) -> Option<RawFd> {
        Some(3)
    }
}

struct FakeSnapshots {
    log: EventLog,
    fails: bool,
}

struct FakeSnapshot {
    log: EventLog,
}

impl PackageSnapshot for FakeSnapshot {
    fn package_count(&self) -> usize {
        2
    }
}

impl Drop for FakeSnapshot {
    fn drop(&mut self) {
        self.log.record("release_snapshot");
    }
}

impl PackageSnapshotProvider for FakeSnapshots {
    fn acquire(&self) -> Result<Box<dyn PackageSnapshot>> {
        self.log.record("acquire_snapshot");
        if self.fails {
            return Err(Error::Snapshot("package manager unavailable".to_string()));
        }
        Ok(Box::new(FakeSnapshot {
            log: self.log.clone(),
        }))
    }
}

struct FakeResolver {
    log: EventLog,
    batch: BatchWorkDescription,
    reports_cancel: bool,
    panics: bool,
    delay: Duration,
}

impl BatchParameterResolver for FakeResolver {
    fn resolve(
        &self,
        _snapshot: &dyn PackageSnapshot,
        reason: &str,
        _cancellation: &CancellationToken,
    ) -> Result<BatchWorkDescription> {
        self.log.record(&format!("resolve({})", reason));
        std::thread::sleep(self.delay);
        if self.panics {
            panic!("resolver bug");
        }
        if self.reports_cancel {
            return Err(Error::Cancelled);
        }
        Ok(self.batch.clone())
    }
}

struct FakeReaper {
    log: EventLog,
    fails: bool,
    delay: Duration,
}

impl ProcessReaper for FakeReaper {
    fn ensure_no_process_in_dir(&self, dir: &Path, timeout: Duration) -> Result<()> {
        self.log.record("ensure_no_process");
        std::thread::sleep(self.delay);
        if self.fails {
            return Err(Error::ProcessesStillRunning {
                dir: dir.to_path_buf(),
                count: 1,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// The entry point compiled into the running version.
unsafe extern "C" fn running_version_entry(
    _handle: c_int,
    _root: *const u8,
    _root_len: usize,
    _params: *const u8,
    _params_len: usize,
    _failure: *mut u8,
    _failure_cap: usize,
) -> c_int {
    abi::STATUS_OK
}

fn pending_version(request: abi::EntryRequest) -> std::result::Result<(), EntryFailure> {
    let log = EventLog::new(
        request
            .sandbox_root
            .parent()
            .expect("sandbox root has a parent")
            .join(EVENTS_FILE),
    );
    log.record(&format!(
        "execute({},{:?})",
        request.batch.packages.len(),
        request.service_manager_handle
    ));

    match request.batch.compiler_filter.as_str() {
        FAILING_FILTER => Err(EntryFailure::new("prereboot::OutOfSpace", "disk full")),
        REQUIREMENT_FILTER => Err(EntryFailure::requirement("unsupported kernel")),
        _ => Ok(()),
    }
}

/// The entry point shipped with the pending update.
unsafe extern "C" fn pending_version_entry(
    handle: c_int,
    root: *const u8,
    root_len: usize,
    params: *const u8,
    params_len: usize,
    failure: *mut u8,
    failure_cap: usize,
) -> c_int {
    abi::serve_entry_point(
        handle,
        root,
        root_len,
        params,
        params_len,
        failure,
        failure_cap,
        pending_version,
    )
}

struct FakeModule {
    origin: PathBuf,
    entry: EntryPointFn,
}

impl LoadedModule for FakeModule {
    fn origin(&self) -> &Path {
        &self.origin
    }

    fn resolve_entry_point(&self) -> Result<EntryPoint> {
        Ok(EntryPoint {
            function: self.entry,
            abi_version: abi::ABI_VERSION,
        })
    }
}

struct FakeLoader {
    log: EventLog,
    loads_running_version: bool,
}

impl ModuleLoader for FakeLoader {
    fn load(&self, image: &MemoryImage) -> Result<Box<dyn LoadedModule>> {
        self.log.record("load_module");
        let entry: EntryPointFn = if self.loads_running_version {
            running_version_entry
        } else {
            pending_version_entry
        };
        Ok(Box::new(FakeModule {
            origin: image.origin().to_path_buf(),
            entry,
        }))
    }

    fn local_entry_point(&self) -> Option<usize> {
        Some(running_version_entry as EntryPointFn as usize)
    }
}
