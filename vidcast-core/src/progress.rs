use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Snapshot of the stage a job's pipeline run is in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub stage: String,
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub job_id: String,
    pub record: ProgressRecord,
}

/// In-memory progress records, one per job, plus a broadcast feed of every
/// update for status endpoints and tests.
#[derive(Debug, Clone)]
pub struct ProgressBoard {
    records: Arc<Mutex<HashMap<String, ProgressRecord>>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBoard {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Starts a fresh run for `job_id`, discarding any previous record.
    pub fn begin(&self, job_id: &str) {
        self.records().remove(job_id);
    }

    /// Records a stage transition. Percent is clamped to 100 and never moves
    /// below the previous value within a run.
    pub fn update(&self, job_id: &str, stage: &str, percent: u8, message: impl Into<String>) {
        let record = {
            let mut records = self.records();
            let floor = records.get(job_id).map(|r| r.percent).unwrap_or(0);
            let record = ProgressRecord {
                stage: stage.to_string(),
                percent: percent.min(100).max(floor),
                message: message.into(),
                error: None,
                updated_at: Utc::now(),
            };
            records.insert(job_id.to_string(), record.clone());
            record
        };
        self.publish(job_id, record);
    }

    /// Marks the current stage as failed, keeping the last percent.
    pub fn fail(&self, job_id: &str, stage: &str, error: impl Into<String>) {
        let error = error.into();
        let record = {
            let mut records = self.records();
            let percent = records.get(job_id).map(|r| r.percent).unwrap_or(0);
            let record = ProgressRecord {
                stage: stage.to_string(),
                percent,
                message: format!("{stage} failed"),
                error: Some(error),
                updated_at: Utc::now(),
            };
            records.insert(job_id.to_string(), record.clone());
            record
        };
        self.publish(job_id, record);
    }

    pub fn get(&self, job_id: &str) -> Option<ProgressRecord> {
        self.records().get(job_id).cloned()
    }

    pub fn clear(&self, job_id: &str) {
        self.records().remove(job_id);
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ProgressRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, job_id: &str, record: ProgressRecord) {
        // No subscribers is the normal case outside of tests.
        let _ = self.events.send(ProgressEvent {
            job_id: job_id.to_string(),
            record,
        });
    }
}
