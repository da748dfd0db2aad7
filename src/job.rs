//! Background job wrapper around [`MaintenanceJobDriver`].
//!
//! Runs at most one driver operation at a time on a blocking tokio worker and
//! owns the cancellation token of the running job. A new operation cancels
//! the running one and waits for it to end before it starts.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::driver::{JobRequest, JobResult, MaintenanceJobDriver};

/// Final status of a job, as reported to metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The job ran to completion.
    Finished,
    /// The job was cancelled before it started recompiling.
    Cancelled,
    /// The job failed.
    Failed,
    /// The device does not meet the requirements to run the job.
    RequirementsNotMet,
}

impl JobStatus {
    /// Derives the status from a driver result.
    pub fn from_result(result: JobResult) -> Self {
        if result.is_requirement_check_failed() {
            JobStatus::RequirementsNotMet
        } else if !result.success() {
            JobStatus::Failed
        } else if result.was_cancelled() {
            JobStatus::Cancelled
        } else {
            JobStatus::Finished
        }
    }
}

struct RunningJob {
    cancellation: CancellationToken,
    done: watch::Receiver<bool>,
}

type Slot = Arc<Mutex<Option<RunningJob>>>;

/// Schedules driver operations one at a time.
pub struct PreRebootJob {
    driver: Arc<MaintenanceJobDriver>,
    running: Slot,
}

impl PreRebootJob {
    /// Creates a job wrapper around `driver`.
    pub fn new(driver: Arc<MaintenanceJobDriver>) -> Self {
        Self {
            driver,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts a job on a blocking worker.
    ///
    /// Must be called from within a tokio runtime. An operation already in
    /// progress is cancelled first, and the new job starts once it has ended.
    pub async fn start(
        &self,
        update_slot: Option<String>,
        remap_snapshots: bool,
    ) -> JoinHandle<JobStatus> {
        let (cancellation, done) = self.take_over().await;
        let request = JobRequest {
            update_slot,
            remap_snapshots,
            cancellation,
        };
        let driver = Arc::clone(&self.driver);
        let running = Arc::clone(&self.running);

        tracing::info!(slot = ?request.update_slot, "starting pre-reboot job");
        tokio::task::spawn_blocking(move || {
            let result = driver.run(&request);
            let status = JobStatus::from_result(result);
            tracing::info!(status = ?status, "pre-reboot job ended");
            finish(&running, done);
            status
        })
    }

    /// Cleans up a sandbox left over by a previous process, in the background.
    ///
    /// Counts as the running operation, so a job started meanwhile waits
    /// for the cleanup instead of racing with it.
    pub async fn clean_up_on_startup(&self) -> JoinHandle<()> {
        // The token is a placeholder; cleanup cannot be cancelled.
        let (_cancellation, done) = self.take_over().await;
        let driver = Arc::clone(&self.driver);
        let running = Arc::clone(&self.running);

        tokio::task::spawn_blocking(move || {
            driver.cleanup_leftover_sandbox();
            finish(&running, done);
        })
    }

    /// Requests cancellation of the running job, if any.
    ///
    /// Only takes effect if the job has not started building the sandbox yet.
    pub fn cancel(&self) {
        if let Some(job) = lock(&self.running).as_ref() {
            tracing::info!("cancelling pre-reboot job");
            job.cancellation.cancel();
        }
    }

    /// Returns true while an operation is in progress.
    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Waits until the running operation, if any, has finished.
    pub async fn wait(&self) {
        let done = lock(&self.running).as_ref().map(|job| job.done.clone());
        if let Some(done) = done {
            wait_until_done(done).await;
        }
    }

    /// Cancels and waits out the running operation, then registers a new one.
    async fn take_over(&self) -> (CancellationToken, watch::Sender<bool>) {
        loop {
            let done = {
                let mut running = lock(&self.running);
                match running.as_ref() {
                    Some(job) => {
                        tracing::info!("cancelling running pre-reboot operation to start a new one");
                        job.cancellation.cancel();
                        job.done.clone()
                    }
                    None => {
                        let cancellation = CancellationToken::new();
                        let (done_tx, done_rx) = watch::channel(false);
                        *running = Some(RunningJob {
                            cancellation: cancellation.clone(),
                            done: done_rx,
                        });
                        return (cancellation, done_tx);
                    }
                }
            };
            // Another caller may take over first, so check again.
            wait_until_done(done).await;
        }
    }
}

async fn wait_until_done(mut done: watch::Receiver<bool>) {
    // An error means the sender is gone, which also means finished.
    let _ = done.wait_for(|finished| *finished).await;
}

fn finish(running: &Slot, done: watch::Sender<bool>) {
    *lock(running) = None;
    let _ = done.send(true);
}

fn lock(running: &Slot) -> MutexGuard<'_, Option<RunningJob>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
