use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LiveSection;
use crate::encoder::MediaEncoder;
use crate::storage::Storage;

use super::metrics::{estimate_bitrate_kbps, MetricsSampler, StreamMetrics};
use super::process::{shutdown_process, IngestLauncher, IngestProcess, IngestSpec};
use super::variants::{quality_variants, QualityVariant};
use super::{validate_stream_key, LiveError, LiveResult};

const PLAYLIST_NAME: &str = "index.m3u8";

/// Notified after a stream leaves the registry, whether it was stopped,
/// exited on its own, or went down with [`StreamRegistry::shutdown`].
#[async_trait::async_trait]
pub trait StreamEndHook: Send + Sync {
    async fn stream_ended(&self, stream_key: &str);
}

/// Source of audience numbers, owned by whatever serves playback.
pub trait ViewerCounter: Send + Sync {
    fn viewer_count(&self, stream_key: &str) -> u64;
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub output_root: PathBuf,
    pub public_base_url: String,
    pub monitor_interval: Duration,
    pub stop_timeout: Duration,
    pub stale_after: Duration,
    pub hls_time_secs: u32,
    pub hls_list_size: u32,
}

impl RegistrySettings {
    pub fn from_config(section: &LiveSection) -> Self {
        Self {
            output_root: PathBuf::from(&section.output_root),
            public_base_url: section.public_base_url.clone(),
            monitor_interval: Duration::from_secs(section.monitor_interval_secs.max(1)),
            stop_timeout: Duration::from_secs(section.stop_timeout_secs.max(1)),
            stale_after: Duration::from_secs(section.stale_after_secs.max(1)),
            hls_time_secs: section.hls_time_secs.max(1),
            hls_list_size: section.hls_list_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub is_live: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub viewer_count: u64,
    pub playback_url: Option<String>,
}

struct StreamEntry {
    output_dir: PathBuf,
    playlist: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    process: Box<dyn IngestProcess>,
    monitor: CancellationToken,
}

type Slot = Arc<AsyncMutex<Option<StreamEntry>>>;

struct RegistryInner {
    slots: Mutex<HashMap<String, Slot>>,
    launcher: Arc<dyn IngestLauncher>,
    encoder: Arc<dyn MediaEncoder>,
    storage: Arc<dyn Storage>,
    viewers: Option<Arc<dyn ViewerCounter>>,
    end_hooks: Mutex<Vec<Weak<dyn StreamEndHook>>>,
    sampler: MetricsSampler,
    settings: RegistrySettings,
}

impl RegistryInner {
    fn slot(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    fn existing_slot(&self, key: &str) -> Option<Slot> {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.get(key).cloned()
    }

    /// Drops the slot for `key` when it is empty and nobody else holds it.
    fn prune(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let idle = slots.get(key).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().map(|entry| entry.is_none()).unwrap_or(false)
        });
        if idle {
            slots.remove(key);
        }
    }

    async fn stream_ended(&self, key: &str) {
        let hooks: Vec<Arc<dyn StreamEndHook>> = {
            let mut hooks = self
                .end_hooks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            hooks.retain(|hook| hook.strong_count() > 0);
            hooks.iter().filter_map(Weak::upgrade).collect()
        };
        for hook in hooks {
            hook.stream_ended(key).await;
        }
    }

    fn playback_url(&self, key: &str) -> String {
        format!(
            "{}/{key}/{PLAYLIST_NAME}",
            self.settings.public_base_url.trim_end_matches('/')
        )
    }
}

/// Keyed registry of running ingest processes.
///
/// Each stream key owns an async mutex slot, so start, stop and the
/// per-stream monitor are serialized per key while different keys proceed
/// independently. At most one process exists per key; starting a key that
/// is already live is rejected.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl StreamRegistry {
    pub fn new(
        settings: RegistrySettings,
        launcher: Arc<dyn IngestLauncher>,
        encoder: Arc<dyn MediaEncoder>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(HashMap::new()),
                launcher,
                encoder,
                storage,
                viewers: None,
                end_hooks: Mutex::new(Vec::new()),
                sampler: MetricsSampler::new(),
                settings,
            }),
        }
    }

    /// Must be called before the registry is cloned or started.
    pub fn with_viewer_counter(mut self, viewers: Arc<dyn ViewerCounter>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.viewers = Some(viewers);
        } else {
            warn!(target: "live", "viewer counter ignored, registry already shared");
        }
        self
    }

    /// Registers `hook` to run after each stream is removed. Only a weak
    /// reference is kept, so a dropped hook simply stops being called.
    pub fn on_stream_end(&self, hook: Weak<dyn StreamEndHook>) {
        self.inner
            .end_hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub async fn start_stream(&self, stream_key: &str, input_url: &str) -> LiveResult<String> {
        validate_stream_key(stream_key)?;
        let slot = self.inner.slot(stream_key);
        let mut guard = slot.lock().await;
        if guard.is_some() {
            return Err(LiveError::AlreadyLive(stream_key.to_string()));
        }

        let output_dir = self.inner.settings.output_root.join(stream_key);
        let spec = IngestSpec {
            stream_key: stream_key.to_string(),
            input_url: input_url.to_string(),
            playlist: output_dir.join(PLAYLIST_NAME),
            output_dir: output_dir.clone(),
            hls_time_secs: self.inner.settings.hls_time_secs,
            hls_list_size: self.inner.settings.hls_list_size,
        };
        let spawned = match prepare_output_dir(&spec).await {
            Ok(()) => self.inner.launcher.spawn_ingest(&spec).await,
            Err(err) => Err(err),
        };
        let process = match spawned {
            Ok(process) => process,
            Err(err) => {
                error!(target: "live", stream_key, error = %err, "failed to start ingest");
                drop(guard);
                drop(slot);
                self.inner.prune(stream_key);
                return Err(err);
            }
        };

        let monitor = CancellationToken::new();
        let pid = process.pid();
        *guard = Some(StreamEntry {
            output_dir,
            playlist: spec.playlist,
            started_at: Utc::now(),
            started: Instant::now(),
            process,
            monitor: monitor.clone(),
        });
        drop(guard);

        tokio::spawn(monitor_stream(
            Arc::downgrade(&self.inner),
            stream_key.to_string(),
            monitor,
        ));
        info!(target: "live", stream_key, ?pid, "stream live");
        Ok(self.inner.playback_url(stream_key))
    }

    /// Stops the stream and waits for its process to exit, then runs the
    /// end hooks. Unknown keys are a no-op.
    pub async fn stop_stream(&self, stream_key: &str) -> LiveResult<()> {
        let Some(slot) = self.inner.existing_slot(stream_key) else {
            return Ok(());
        };
        let mut guard = slot.lock().await;
        let Some(mut entry) = guard.take() else {
            drop(guard);
            drop(slot);
            self.inner.prune(stream_key);
            return Ok(());
        };
        entry.monitor.cancel();
        let stop_timeout = self.inner.settings.stop_timeout;
        let result = shutdown_process(entry.process.as_mut(), stop_timeout, stream_key).await;
        match &result {
            Ok(exit) => info!(target: "live", stream_key, code = ?exit.code, "stream stopped"),
            Err(err) => {
                error!(
                    target: "live",
                    stream_key,
                    pid = ?entry.process.pid(),
                    error = %err,
                    "stream did not exit cleanly, killing"
                );
                force_reap(entry.process.as_mut(), stop_timeout, stream_key).await;
            }
        }
        drop(entry);
        drop(guard);
        drop(slot);
        self.inner.prune(stream_key);
        self.inner.stream_ended(stream_key).await;
        result.map(|_| ())
    }

    pub async fn status(&self, stream_key: &str) -> StreamStatus {
        let mut started_at = None;
        if let Some(slot) = self.inner.existing_slot(stream_key) {
            let guard = slot.lock().await;
            started_at = guard.as_ref().map(|entry| entry.started_at);
        }
        let is_live = started_at.is_some();
        let viewer_count = match (&self.inner.viewers, is_live) {
            (Some(viewers), true) => viewers.viewer_count(stream_key),
            _ => 0,
        };
        StreamStatus {
            is_live,
            started_at,
            viewer_count,
            playback_url: is_live.then(|| self.inner.playback_url(stream_key)),
        }
    }

    /// Output directory of a live stream.
    pub async fn output_dir(&self, stream_key: &str) -> Option<PathBuf> {
        let slot = self.inner.existing_slot(stream_key)?;
        let guard = slot.lock().await;
        guard.as_ref().map(|entry| entry.output_dir.clone())
    }

    /// Grabs a frame from the live playlist and uploads it. Any failure,
    /// including an unknown key, yields `None`.
    pub async fn generate_thumbnail(&self, stream_key: &str) -> Option<String> {
        let playlist = {
            let slot = self.inner.existing_slot(stream_key)?;
            let guard = slot.lock().await;
            let playlist = guard.as_ref()?.playlist.clone();
            playlist
        };
        let frame = match self.inner.encoder.thumbnail(&playlist, 0.0).await {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "live", stream_key, error = %err, "live thumbnail failed");
                return None;
            }
        };
        let bytes = match frame.read().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "live", stream_key, error = %err, "live thumbnail unreadable");
                return None;
            }
        };
        match self.inner.storage.upload_thumbnail(bytes).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(target: "live", stream_key, error = %err, "live thumbnail upload failed");
                None
            }
        }
    }

    pub async fn metrics(&self, stream_key: &str) -> Option<StreamMetrics> {
        let (pid, uptime, output_dir) = {
            let slot = self.inner.existing_slot(stream_key)?;
            let guard = slot.lock().await;
            let entry = guard.as_ref()?;
            (
                entry.process.pid(),
                entry.started.elapsed().as_secs(),
                entry.output_dir.clone(),
            )
        };
        let mut metrics = StreamMetrics::nominal(pid, uptime);
        if let Some((cpu, memory)) = pid.and_then(|pid| self.inner.sampler.sample(pid)) {
            metrics.cpu_percent = cpu;
            metrics.memory_bytes = memory;
        }
        metrics.bitrate_kbps =
            estimate_bitrate_kbps(&output_dir, self.inner.settings.hls_time_secs).await;
        Some(metrics)
    }

    /// Registered, still running, and writing its playlist. A stream gets
    /// one staleness window of grace after start before the playlist must
    /// exist.
    pub async fn is_healthy(&self, stream_key: &str) -> bool {
        let Some(slot) = self.inner.existing_slot(stream_key) else {
            return false;
        };
        let mut guard = slot.lock().await;
        let Some(entry) = guard.as_mut() else {
            return false;
        };
        if !entry.process.is_alive() {
            return false;
        }
        let stale_after = self.inner.settings.stale_after;
        if entry.started.elapsed() < stale_after {
            return true;
        }
        let modified = tokio::fs::metadata(&entry.playlist)
            .await
            .and_then(|meta| meta.modified());
        match modified {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age <= stale_after)
                .unwrap_or(true),
            Err(_) => false,
        }
    }

    pub fn quality_variants(&self, stream_key: &str) -> Vec<QualityVariant> {
        quality_variants(&self.inner.settings.public_base_url, stream_key)
    }

    pub async fn live_keys(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = {
            let slots = self
                .inner
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots
                .iter()
                .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
                .collect()
        };
        let mut keys = Vec::new();
        for (key, slot) in slots {
            let live = slot.lock().await.is_some();
            if live {
                keys.push(key);
            }
        }
        keys.sort();
        keys
    }

    /// Stops every live stream, waiting for each process to exit.
    pub async fn shutdown(&self) {
        for key in self.live_keys().await {
            if let Err(err) = self.stop_stream(&key).await {
                warn!(target: "live", stream_key = %key, error = %err, "error stopping stream during shutdown");
            }
        }
    }
}

/// Last resort after a failed shutdown: kill and wait once more so the
/// process is not left unreaped.
async fn force_reap(process: &mut dyn IngestProcess, grace: Duration, stream_key: &str) {
    let pid = process.pid();
    if let Err(err) = process.kill().await {
        warn!(target: "live", stream_key, ?pid, error = %err, "kill failed");
    }
    match timeout(grace, process.wait_exit()).await {
        Ok(Ok(exit)) => debug!(target: "live", stream_key, ?pid, code = ?exit.code, "ingest reaped after kill"),
        Ok(Err(err)) => error!(target: "live", stream_key, ?pid, error = %err, "ingest could not be reaped"),
        Err(_) => error!(target: "live", stream_key, ?pid, "ingest still running after kill"),
    }
}

async fn prepare_output_dir(spec: &IngestSpec) -> LiveResult<()> {
    tokio::fs::create_dir_all(&spec.output_dir)
        .await
        .map_err(|source| LiveError::Io {
            source,
            path: spec.output_dir.clone(),
        })?;
    // A playlist left by an earlier session would make the new one look
    // healthy before it wrote anything.
    match tokio::fs::remove_file(&spec.playlist).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LiveError::Io {
            source,
            path: spec.playlist.clone(),
        }),
    }
}

/// Polls the stream's process until it exits on its own or the entry is
/// stopped. No lock is held while sleeping.
async fn monitor_stream(inner: Weak<RegistryInner>, stream_key: String, cancel: CancellationToken) {
    loop {
        let interval = match inner.upgrade() {
            Some(inner) => inner.settings.monitor_interval,
            None => return,
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(interval) => {}
        }
        let Some(registry) = inner.upgrade() else {
            return;
        };
        let Some(slot) = registry.existing_slot(&stream_key) else {
            return;
        };
        let mut guard = slot.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        let Some(entry) = guard.as_mut() else {
            return;
        };
        match entry.process.try_exit() {
            Ok(None) => debug!(target: "live", stream_key = %stream_key, "ingest alive"),
            Ok(Some(exit)) => {
                warn!(
                    target: "live",
                    stream_key = %stream_key,
                    code = ?exit.code,
                    success = exit.success,
                    "ingest process exited, removing stream"
                );
                *guard = None;
                drop(guard);
                drop(slot);
                registry.prune(&stream_key);
                registry.stream_ended(&stream_key).await;
                return;
            }
            Err(err) => {
                warn!(target: "live", stream_key = %stream_key, error = %err, "ingest liveness check failed");
            }
        }
    }
}
