#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vidcast_core::{
    EncodedFile, EncoderError, EncoderResult, ExitInfo, IngestLauncher, IngestProcess, IngestSpec,
    LiveError, LiveResult, MediaEncoder, MediaProbe, NotificationKind, Notifier, RecorderSpec,
    RenditionSpec, Storage, StorageError, StorageResult,
};

/// Encoder double writing small files into `scratch` instead of running
/// ffmpeg. Every call is logged as `probe`, `thumbnail` or the rendition
/// name.
pub struct FakeEncoder {
    scratch: PathBuf,
    probe: Option<MediaProbe>,
    fail_thumbnail: bool,
    fail_renditions: Vec<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeEncoder {
    pub fn new(scratch: &Path, probe: Option<MediaProbe>) -> Self {
        std::fs::create_dir_all(scratch).unwrap();
        Self {
            scratch: scratch.to_path_buf(),
            probe,
            fail_thumbnail: false,
            fail_renditions: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_thumbnail(mut self) -> Self {
        self.fail_thumbnail = true;
        self
    }

    pub fn failing_rendition(mut self, name: &str) -> Self {
        self.fail_renditions.push(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn output(&self, suffix: &str, contents: &[u8]) -> EncodedFile {
        let file = tempfile::Builder::new()
            .prefix("fake-")
            .suffix(suffix)
            .tempfile_in(&self.scratch)
            .unwrap();
        std::fs::write(file.path(), contents).unwrap();
        EncodedFile::new(file.into_temp_path())
    }

    fn encode_failure(stage: &str) -> EncoderError {
        EncoderError::Encode {
            command: format!("ffmpeg {stage}"),
            status: Some(1),
            stderr: "conversion failed".into(),
        }
    }
}

pub fn probe_1080p(duration_s: f64) -> MediaProbe {
    MediaProbe {
        duration_s,
        width: 1920,
        height: 1080,
        codec: "h264".into(),
        bitrate_bps: 4_800_000,
    }
}

#[async_trait::async_trait]
impl MediaEncoder for FakeEncoder {
    async fn probe(&self, input: &Path) -> EncoderResult<MediaProbe> {
        self.calls.lock().unwrap().push("probe".into());
        self.probe.clone().ok_or_else(|| {
            EncoderError::Metadata(format!("missing video stream in {}", input.display()))
        })
    }

    async fn thumbnail(&self, input: &Path, offset_s: f64) -> EncoderResult<EncodedFile> {
        self.calls.lock().unwrap().push("thumbnail".into());
        if self.fail_thumbnail {
            return Err(Self::encode_failure("thumbnail"));
        }
        let contents = format!("jpeg {} @{offset_s}", input.display());
        Ok(self.output(".jpg", contents.as_bytes()))
    }

    async fn transcode(
        &self,
        input: &Path,
        rendition: &RenditionSpec,
    ) -> EncoderResult<EncodedFile> {
        self.calls.lock().unwrap().push(rendition.name.clone());
        if self.fail_renditions.contains(&rendition.name) {
            return Err(Self::encode_failure(&rendition.name));
        }
        let contents = format!("{} {}", rendition.name, input.display());
        Ok(self.output(".mp4", contents.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub user_id: String,
    pub title: String,
    pub kind: NotificationKind,
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, user_id: &str, title: &str, _body: &str, kind: NotificationKind) {
        self.sent.lock().unwrap().push(SentNotification {
            user_id: user_id.to_string(),
            title: title.to_string(),
            kind,
        });
    }
}

/// Storage that accepts nothing.
pub struct RejectingStorage;

#[async_trait::async_trait]
impl Storage for RejectingStorage {
    async fn upload_video(&self, _bytes: Vec<u8>) -> StorageResult<String> {
        Err(StorageError::Unsupported("uploads disabled".into()))
    }

    async fn upload_thumbnail(&self, _bytes: Vec<u8>) -> StorageResult<String> {
        Err(StorageError::Unsupported("uploads disabled".into()))
    }

    async fn download(&self, url: &str) -> StorageResult<Vec<u8>> {
        Err(StorageError::NotFound(url.to_string()))
    }
}

/// Shared view of a fake process, kept by the test after the registry takes
/// ownership of the process itself.
#[derive(Default)]
pub struct ProcessState {
    pub alive: AtomicBool,
    pub terminated: AtomicBool,
    pub killed: AtomicBool,
    pub reaped: AtomicBool,
    pub ignore_terminate: AtomicBool,
    pub fail_exit_check: AtomicBool,
}

impl ProcessState {
    pub fn exit(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

pub struct FakeProcess {
    state: Arc<ProcessState>,
    pid: Option<u32>,
}

#[async_trait::async_trait]
impl IngestProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_exit(&mut self) -> LiveResult<Option<ExitInfo>> {
        if self.state.fail_exit_check.load(Ordering::SeqCst) {
            return Err(LiveError::Io {
                source: std::io::Error::new(std::io::ErrorKind::Other, "waitpid failed"),
                path: PathBuf::from("/proc/self"),
            });
        }
        if self.state.alive.load(Ordering::SeqCst) {
            Ok(None)
        } else {
            self.state.reaped.store(true, Ordering::SeqCst);
            Ok(Some(ExitInfo {
                code: Some(0),
                success: true,
            }))
        }
    }

    async fn terminate(&mut self) -> LiveResult<()> {
        self.state.terminated.store(true, Ordering::SeqCst);
        if !self.state.ignore_terminate.load(Ordering::SeqCst) {
            self.state.exit();
        }
        Ok(())
    }

    async fn kill(&mut self) -> LiveResult<()> {
        self.state.killed.store(true, Ordering::SeqCst);
        self.state.exit();
        Ok(())
    }

    async fn wait_exit(&mut self) -> LiveResult<ExitInfo> {
        while self.state.alive.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.state.reaped.store(true, Ordering::SeqCst);
        Ok(ExitInfo {
            code: Some(0),
            success: true,
        })
    }
}

/// Launcher handing out [`FakeProcess`]es. Recorders write `recording_bytes`
/// to their output path as soon as they start.
#[derive(Default)]
pub struct FakeLauncher {
    pub ingests: Mutex<Vec<(IngestSpec, Arc<ProcessState>)>>,
    pub recorders: Mutex<Vec<(RecorderSpec, Arc<ProcessState>)>>,
    pub spawn_count: AtomicUsize,
    pub fail_spawn: AtomicBool,
    pub ignore_terminate: AtomicBool,
    pub with_pid: AtomicBool,
    pub recording_bytes: Vec<u8>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            recording_bytes: b"recorded stream".to_vec(),
            ..Self::default()
        }
    }

    pub fn ingest_state(&self, index: usize) -> Arc<ProcessState> {
        Arc::clone(&self.ingests.lock().unwrap()[index].1)
    }

    pub fn recorder_state(&self, index: usize) -> Arc<ProcessState> {
        Arc::clone(&self.recorders.lock().unwrap()[index].1)
    }

    fn process(&self) -> LiveResult<(FakeProcess, Arc<ProcessState>)> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(LiveError::Spawn {
                program: "ffmpeg".into(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
            });
        }
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(ProcessState::default());
        state.alive.store(true, Ordering::SeqCst);
        state
            .ignore_terminate
            .store(self.ignore_terminate.load(Ordering::SeqCst), Ordering::SeqCst);
        let pid = self
            .with_pid
            .load(Ordering::SeqCst)
            .then(std::process::id);
        Ok((
            FakeProcess {
                state: Arc::clone(&state),
                pid,
            },
            state,
        ))
    }
}

#[async_trait::async_trait]
impl IngestLauncher for FakeLauncher {
    async fn spawn_ingest(&self, spec: &IngestSpec) -> LiveResult<Box<dyn IngestProcess>> {
        let (process, state) = self.process()?;
        self.ingests.lock().unwrap().push((spec.clone(), state));
        Ok(Box::new(process))
    }

    async fn spawn_recorder(&self, spec: &RecorderSpec) -> LiveResult<Box<dyn IngestProcess>> {
        let (process, state) = self.process()?;
        std::fs::write(&spec.output, &self.recording_bytes).unwrap();
        self.recorders.lock().unwrap().push((spec.clone(), state));
        Ok(Box::new(process))
    }
}

/// Polls `check` every few milliseconds until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
