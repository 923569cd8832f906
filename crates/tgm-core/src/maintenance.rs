//! Background housekeeping for the session directory.
//!
//! Completed and failed sessions are archived on a fixed interval. A failed
//! pass is retried after the shorter retry delay.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{archive::ArchiveFormat, config::Config, storage::FileSessionStorage, Result};

#[derive(Clone, Debug)]
struct Schedule {
    archive_dir: PathBuf,
    archive_age_days: u32,
    archive_format: ArchiveFormat,
    interval: Duration,
    retry: Duration,
}

pub struct MaintenanceTask;

/// Running maintenance loop; dropping it leaves the task running until the runtime stops.
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    passes: Arc<AtomicUsize>,
}

impl MaintenanceTask {
    /// Start the loop on the current tokio runtime. The first pass runs immediately.
    pub fn spawn(storage: Arc<FileSessionStorage>, cfg: &Config) -> MaintenanceHandle {
        let schedule = Schedule {
            archive_dir: cfg.archive_dir.clone(),
            archive_age_days: cfg.archive_age_days,
            archive_format: cfg.archive_format,
            interval: cfg.maintenance_interval,
            retry: cfg.maintenance_retry,
        };

        let cancel = CancellationToken::new();
        let passes = Arc::new(AtomicUsize::new(0));

        let tok = cancel.clone();
        let counter = Arc::clone(&passes);
        let task = tokio::spawn(async move {
            info!(
                "Session maintenance started (every {:?}, archive after {} days)",
                schedule.interval, schedule.archive_age_days
            );
            loop {
                let wait = match run_pass(&storage, &schedule).await {
                    Ok(archived) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if archived > 0 {
                            info!("Maintenance archived {archived} sessions");
                        }
                        schedule.interval
                    }
                    Err(e) => {
                        error!("Session maintenance failed: {e}");
                        schedule.retry
                    }
                };

                tokio::select! {
                  _ = tok.cancelled() => break,
                  _ = sleep(wait) => {}
                }
            }
            info!("Session maintenance stopped");
        });

        MaintenanceHandle {
            cancel,
            task,
            passes,
        }
    }
}

impl MaintenanceHandle {
    /// Number of archive passes that finished without error.
    pub fn completed_passes(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run_pass(storage: &Arc<FileSessionStorage>, schedule: &Schedule) -> Result<usize> {
    let storage = Arc::clone(storage);
    let schedule = schedule.clone();
    tokio::task::spawn_blocking(move || {
        storage.archive_completed_sessions(
            schedule.archive_age_days,
            Some(&schedule.archive_dir),
            schedule.archive_format,
        )
    })
    .await?
}
