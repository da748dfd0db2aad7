//! Pre-reboot driver CLI
//!
//! Command-line entry into the pre-reboot driver, for manual runs and device
//! tests.

use std::path::PathBuf;
use std::sync::Arc;

use prereboot_driver::{
    BatchWorkDescription, CommandCompilerService, CommandSandboxLifecycle, CompilerService,
    DriverConfig, DriverDeps, DynamicModuleLoader, EmptySnapshotProvider, FixedBatchResolver,
    JobStatus, MaintenanceJobDriver, PreRebootJob, ProcfsReaper, ServiceCache, Validate,
};

const USAGE: &str = "\
Usage: prereboot-driver [--config FILE] <command>

Commands:
  cleanup                                    Remove a sandbox left by a crashed run
  self-test                                  Build and tear down the sandbox only
  run --work FILE [--slot S] [--map-snapshots]
                                             Run the job for the batch in FILE (JSON)";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    command: String,
    work: Option<PathBuf>,
    slot: Option<String>,
    map_snapshots: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => parsed.config = Some(args.next().ok_or("--config needs a value")?.into()),
            "--work" => parsed.work = Some(args.next().ok_or("--work needs a value")?.into()),
            "--slot" => parsed.slot = Some(args.next().ok_or("--slot needs a value")?),
            "--map-snapshots" => parsed.map_snapshots = true,
            other if other.starts_with("--") => return Err(format!("unknown option {}", other)),
            other if parsed.command.is_empty() => parsed.command = other.to_string(),
            other => return Err(format!("unexpected argument {}", other)),
        }
    }
    if parsed.command.is_empty() {
        return Err("missing command".to_string());
    }
    Ok(parsed)
}

fn build_driver(config: &DriverConfig, batch: BatchWorkDescription) -> MaintenanceJobDriver {
    let helper = config.setup_helper.clone();
    let service = Arc::new(ServiceCache::new(move || {
        Ok(Arc::new(CommandCompilerService::new(helper.clone())) as Arc<dyn CompilerService>)
    }));

    let deps = DriverDeps {
        sandbox: Arc::new(CommandSandboxLifecycle::new(
            config.setup_helper.clone(),
            config.sandbox_root.clone(),
        )),
        gate: service.clone(),
        service,
        snapshots: Arc::new(EmptySnapshotProvider),
        resolver: Arc::new(FixedBatchResolver::new(batch)),
        loader: Arc::new(DynamicModuleLoader),
        reaper: Arc::new(ProcfsReaper::new(config.poll_interval)),
    };
    MaintenanceJobDriver::new(config, deps)
}

fn load_batch(path: &PathBuf) -> Result<BatchWorkDescription, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    BatchWorkDescription::decode(&bytes).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    let config = match &args.config {
        Some(path) => DriverConfig::load(path),
        None => Ok(DriverConfig::default()),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    match config.validate().into_result() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(warning = %warning, "configuration warning");
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    }

    match args.command.as_str() {
        "cleanup" => {
            let driver = build_driver(&config, BatchWorkDescription::default());
            driver.cleanup_leftover_sandbox();
        }
        "self-test" => {
            let driver = build_driver(&config, BatchWorkDescription::default());
            if let Err(e) = driver.test() {
                eprintln!("Self-test failed: {}", e);
                std::process::exit(1);
            }
            println!("Self-test passed");
        }
        "run" => {
            let Some(work) = &args.work else {
                eprintln!("run needs --work\n\n{}", USAGE);
                std::process::exit(2);
            };
            let batch = match load_batch(work) {
                Ok(batch) => batch,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(2);
                }
            };

            let job = PreRebootJob::new(Arc::new(build_driver(&config, batch)));
            let mut handle = job.start(args.slot.clone(), args.map_snapshots).await;

            let status = tokio::select! {
                status = &mut handle => status,
                _ = tokio::signal::ctrl_c() => {
                    job.cancel();
                    handle.await
                }
            };

            match status {
                Ok(JobStatus::Finished) => println!("Pre-reboot job finished"),
                Ok(status) => {
                    println!("Pre-reboot job ended with status {:?}", status);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Pre-reboot job panicked: {}", e);
                    std::process::exit(1);
                }
            }
        }
        other => {
            eprintln!("unknown command {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}
