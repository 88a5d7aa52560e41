use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::config::{FetchRetrySection, VidcastConfig};
use crate::encoder::RenditionSpec;

/// Exponential backoff for source downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl From<&FetchRetrySection> for RetryPolicy {
    fn from(section: &FetchRetrySection) -> Self {
        Self {
            attempts: section.attempts.max(1),
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms.max(section.base_delay_ms)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub lease: Duration,
    pub max_attempts: u32,
    pub fetch_retry: RetryPolicy,
    pub scratch_dir: PathBuf,
    pub thumbnail_offset_s: f64,
    pub renditions: Vec<RenditionSpec>,
}

impl WorkerSettings {
    pub fn from_config(config: &VidcastConfig) -> Self {
        let renditions = if config.encoder.renditions.is_empty() {
            RenditionSpec::default_ladder()
        } else {
            config.encoder.renditions.iter().map(RenditionSpec::from).collect()
        };
        Self {
            worker_id: config.worker.worker_id.clone(),
            poll_interval: config.worker.poll_interval(),
            batch_size: config.worker.batch_size.max(1),
            lease: config.worker.lease(),
            max_attempts: config.worker.max_attempts.max(1),
            fetch_retry: RetryPolicy::from(&config.worker.fetch_retry),
            scratch_dir: config.scratch_dir(),
            thumbnail_offset_s: config.encoder.thumbnail_offset_secs,
            renditions,
        }
    }

    /// Seek position for the thumbnail frame, kept inside short clips.
    pub fn thumbnail_offset(&self, duration_s: f64) -> f64 {
        let half = (duration_s / 2.0).max(0.0);
        self.thumbnail_offset_s.max(0.0).min(half)
    }
}

/// What one worker tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub selected: usize,
    pub ready: usize,
    pub failed: usize,
    pub skipped: usize,
    pub reaped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Ready,
    Failed,
    Skipped,
}
