use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::storage::Storage;

use super::process::{shutdown_process, IngestLauncher, IngestProcess, RecorderSpec};
use super::registry::{StreamEndHook, StreamRegistry};
use super::{LiveError, LiveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Recording,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingHandle {
    pub id: String,
    pub stream_key: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub file_path: PathBuf,
    pub status: RecordingStatus,
    pub file_size: Option<u64>,
    pub uploaded_url: Option<String>,
    pub error: Option<String>,
}

struct ActiveRecording {
    index: usize,
    process: Box<dyn IngestProcess>,
}

#[derive(Default)]
struct StreamRecordings {
    handles: Vec<RecordingHandle>,
    active: Option<ActiveRecording>,
}

/// Records live streams to files and publishes them through storage once
/// stopped. Handles are kept in memory for the life of the manager.
///
/// The manager registers itself as an end hook on its registry, so a
/// recording never outlives the stream it copies.
pub struct RecordingManager {
    registry: StreamRegistry,
    launcher: Arc<dyn IngestLauncher>,
    storage: Arc<dyn Storage>,
    stop_timeout: Duration,
    streams: Mutex<HashMap<String, Arc<AsyncMutex<StreamRecordings>>>>,
}

impl RecordingManager {
    pub fn new(
        registry: StreamRegistry,
        launcher: Arc<dyn IngestLauncher>,
        storage: Arc<dyn Storage>,
    ) -> Arc<Self> {
        let stop_timeout = registry.settings().stop_timeout;
        let manager = Arc::new(Self {
            registry,
            launcher,
            storage,
            stop_timeout,
            streams: Mutex::new(HashMap::new()),
        });
        let hook: Weak<dyn StreamEndHook> = Arc::<RecordingManager>::downgrade(&manager);
        manager.registry.on_stream_end(hook);
        manager
    }

    fn recordings_for(&self, stream_key: &str) -> Arc<AsyncMutex<StreamRecordings>> {
        let mut streams = self
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(streams.entry(stream_key.to_string()).or_default())
    }

    fn existing(&self, stream_key: &str) -> Option<Arc<AsyncMutex<StreamRecordings>>> {
        let streams = self
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        streams.get(stream_key).cloned()
    }

    /// Starts recording a live stream. Liveness is checked while holding the
    /// stream's recording lock, so a concurrent stop either sees this
    /// recording and finishes it or makes this call fail with NotFound.
    pub async fn start_recording(&self, stream_key: &str) -> LiveResult<RecordingHandle> {
        let entry = self.recordings_for(stream_key);
        let mut recordings = entry.lock().await;
        let output_dir = self
            .registry
            .output_dir(stream_key)
            .await
            .ok_or_else(|| LiveError::NotFound(stream_key.to_string()))?;
        if recordings.active.is_some() {
            return Err(LiveError::InvalidOperation {
                key: stream_key.to_string(),
                reason: "a recording is already in progress".to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let dir = output_dir.join("recordings");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| LiveError::Io {
                source,
                path: dir.clone(),
            })?;
        let spec = RecorderSpec {
            stream_key: stream_key.to_string(),
            playlist: output_dir.join("index.m3u8"),
            output: dir.join(format!("{id}.mp4")),
            log: dir.join(format!("{id}.log")),
        };
        let process = self.launcher.spawn_recorder(&spec).await?;

        let handle = RecordingHandle {
            id,
            stream_key: stream_key.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            file_path: spec.output,
            status: RecordingStatus::Recording,
            file_size: None,
            uploaded_url: None,
            error: None,
        };
        recordings.handles.push(handle.clone());
        let index = recordings.handles.len() - 1;
        recordings.active = Some(ActiveRecording { index, process });
        info!(target: "live", stream_key, recording_id = %handle.id, "recording started");
        Ok(handle)
    }

    /// Finishes the active recording of `stream_key` and publishes the file.
    /// When the upload fails the handle is marked Failed, the file stays on
    /// disk, and the storage error is returned.
    pub async fn stop_recording(&self, stream_key: &str) -> LiveResult<RecordingHandle> {
        let entry = self
            .existing(stream_key)
            .ok_or_else(|| LiveError::NotFound(stream_key.to_string()))?;
        let mut recordings = entry.lock().await;
        let Some(mut active) = recordings.active.take() else {
            return Err(LiveError::NotFound(stream_key.to_string()));
        };

        if let Err(err) = shutdown_process(active.process.as_mut(), self.stop_timeout, stream_key).await {
            warn!(target: "live", stream_key, error = %err, "recorder did not exit cleanly");
        }

        let handle = &mut recordings.handles[active.index];
        handle.ended_at = Some(Utc::now());
        handle.status = RecordingStatus::Completed;
        let bytes = match tokio::fs::read(&handle.file_path).await {
            Ok(bytes) => bytes,
            Err(source) => {
                let err = LiveError::Io {
                    source,
                    path: handle.file_path.clone(),
                };
                error!(target: "live", stream_key, recording_id = %handle.id, error = %err, "recording file missing");
                handle.status = RecordingStatus::Failed;
                handle.error = Some(err.to_string());
                return Err(err);
            }
        };
        handle.file_size = Some(bytes.len() as u64);

        match self.storage.upload_video(bytes).await {
            Ok(url) => {
                info!(target: "live", stream_key, recording_id = %handle.id, %url, "recording published");
                handle.uploaded_url = Some(url);
                Ok(handle.clone())
            }
            Err(err) => {
                error!(target: "live", stream_key, recording_id = %handle.id, error = %err, "recording upload failed");
                handle.status = RecordingStatus::Failed;
                handle.error = Some(err.to_string());
                Err(LiveError::Storage(err))
            }
        }
    }

    /// Every recording made for `stream_key`, oldest first.
    pub async fn recordings(&self, stream_key: &str) -> Vec<RecordingHandle> {
        match self.existing(stream_key) {
            Some(entry) => {
                let recordings = entry.lock().await;
                recordings.handles.clone()
            }
            None => Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl StreamEndHook for RecordingManager {
    async fn stream_ended(&self, stream_key: &str) {
        match self.stop_recording(stream_key).await {
            Ok(handle) => {
                info!(target: "live", stream_key, recording_id = %handle.id, "recording finished with stream")
            }
            Err(LiveError::NotFound(_)) => {}
            Err(err) => {
                warn!(target: "live", stream_key, error = %err, "recording could not be finished with stream")
            }
        }
    }
}
