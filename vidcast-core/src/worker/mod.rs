//! Background transcoding of uploaded videos.
//!
//! Each tick reaps abandoned jobs, then claims and drives up to
//! `batch_size` Processing jobs through fetch, probe, thumbnail, renditions
//! and finalize. Jobs are handled one at a time; a failing job is recorded
//! and never stops the tick.

mod error;
mod pipeline;
mod types;

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::encoder::MediaEncoder;
use crate::jobs::{JobStoreError, SqliteVideoStore, VideoJob};
use crate::notify::{NotificationKind, Notifier};
use crate::progress::ProgressBoard;
use crate::storage::Storage;

pub use error::{PipelineError, PipelineResult};
pub use types::{RetryPolicy, TickReport, WorkerSettings};

use types::JobOutcome;

pub struct TranscodeWorker {
    store: SqliteVideoStore,
    encoder: Arc<dyn MediaEncoder>,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    progress: ProgressBoard,
    settings: WorkerSettings,
}

impl TranscodeWorker {
    pub fn new(
        store: SqliteVideoStore,
        encoder: Arc<dyn MediaEncoder>,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            encoder,
            storage,
            notifier,
            progress: ProgressBoard::new(),
            settings,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBoard) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressBoard {
        &self.progress
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Ticks every `poll_interval` until `cancel` fires. A tick in flight
    /// finishes before the loop exits, so no job is left half processed.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            target: "worker",
            worker_id = %self.settings.worker_id,
            interval = ?self.settings.poll_interval,
            "starting transcode worker"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_tick().await {
                Ok(report) if report.selected > 0 || report.reaped > 0 => {
                    info!(
                        target: "worker",
                        selected = report.selected,
                        ready = report.ready,
                        failed = report.failed,
                        skipped = report.skipped,
                        reaped = report.reaped,
                        "tick complete"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(target: "worker", error = %err, "tick aborted"),
            }
        }
        info!(target: "worker", worker_id = %self.settings.worker_id, "transcode worker stopped");
    }

    /// One pass over the queue. Only failures to read the queue itself are
    /// returned; per-job failures end up in the report.
    pub async fn run_tick(&self) -> Result<TickReport, JobStoreError> {
        let mut report = TickReport {
            reaped: self.reap()?,
            ..TickReport::default()
        };
        let jobs = self
            .store
            .pending(self.settings.batch_size, self.settings.lease)?;
        report.selected = jobs.len();
        for job in jobs {
            match self.handle_job(&job).await {
                JobOutcome::Ready => report.ready += 1,
                JobOutcome::Failed => report.failed += 1,
                JobOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    fn reap(&self) -> Result<usize, JobStoreError> {
        let reaped = self
            .store
            .reap_stale(self.settings.lease, self.settings.max_attempts)?;
        for job in &reaped {
            let reason = job.error.as_deref().unwrap_or("processing abandoned");
            warn!(target: "worker", job_id = %job.id, attempts = job.attempts, "reaped stale job");
            self.progress.clear(&job.id);
            self.notify_failed(job, reason);
        }
        Ok(reaped.len())
    }

    async fn handle_job(&self, job: &VideoJob) -> JobOutcome {
        match self
            .store
            .claim(&job.id, &self.settings.worker_id, self.settings.lease)
        {
            Ok(true) => {}
            Ok(false) => {
                info!(target: "worker", job_id = %job.id, "job claimed elsewhere, skipping");
                return JobOutcome::Skipped;
            }
            Err(err) => {
                error!(target: "worker", job_id = %job.id, error = %err, "claim failed");
                return JobOutcome::Skipped;
            }
        }

        match self.process(job).await {
            Ok(()) => {
                info!(target: "worker", job_id = %job.id, "job ready");
                self.notifier.notify(
                    &job.owner_id,
                    "Your video is ready",
                    &format!("Video {} finished processing and is now published.", job.id),
                    NotificationKind::VideoReady,
                );
                JobOutcome::Ready
            }
            Err(PipelineError::Store(JobStoreError::InvalidTransition { .. })) => {
                warn!(target: "worker", job_id = %job.id, "lease lost before finalize, dropping result");
                JobOutcome::Skipped
            }
            Err(err) => self.fail_job(job, err),
        }
    }

    fn fail_job(&self, job: &VideoJob, err: PipelineError) -> JobOutcome {
        let stage = err.stage();
        let message = err.to_string();
        error!(target: "worker", job_id = %job.id, stage, error = %message, "job failed");
        self.progress.fail(&job.id, stage, message.clone());
        match self
            .store
            .mark_failed(&job.id, Some(&self.settings.worker_id), &message)
        {
            Ok(()) => {
                self.notify_failed(job, &message);
                JobOutcome::Failed
            }
            Err(JobStoreError::InvalidTransition { .. }) => {
                warn!(target: "worker", job_id = %job.id, "lease lost before failure could be recorded");
                JobOutcome::Skipped
            }
            Err(store_err) => {
                error!(target: "worker", job_id = %job.id, error = %store_err, "failed to record job failure");
                JobOutcome::Failed
            }
        }
    }

    fn notify_failed(&self, job: &VideoJob, reason: &str) {
        self.notifier.notify(
            &job.owner_id,
            "Video processing failed",
            &format!("Video {} could not be processed: {reason}", job.id),
            NotificationKind::VideoFailed,
        );
    }
}
