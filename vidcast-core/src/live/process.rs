use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{LiveError, LiveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// An owned external process. Dropping it without [`IngestProcess::wait_exit`]
/// still kills it, but callers are expected to reap it explicitly.
#[async_trait::async_trait]
pub trait IngestProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check. Returns the exit once the process is gone.
    fn try_exit(&mut self) -> LiveResult<Option<ExitInfo>>;

    fn is_alive(&mut self) -> bool {
        matches!(self.try_exit(), Ok(None))
    }

    /// Asks the process to finish cleanly.
    async fn terminate(&mut self) -> LiveResult<()>;

    async fn kill(&mut self) -> LiveResult<()>;

    async fn wait_exit(&mut self) -> LiveResult<ExitInfo>;
}

/// Everything needed to start the segmenting encoder for one stream.
#[derive(Debug, Clone)]
pub struct IngestSpec {
    pub stream_key: String,
    pub input_url: String,
    pub output_dir: PathBuf,
    pub playlist: PathBuf,
    pub hls_time_secs: u32,
    pub hls_list_size: u32,
}

/// A recorder copying a stream's rolling playlist into one file.
#[derive(Debug, Clone)]
pub struct RecorderSpec {
    pub stream_key: String,
    pub playlist: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
}

#[async_trait::async_trait]
pub trait IngestLauncher: Send + Sync {
    async fn spawn_ingest(&self, spec: &IngestSpec) -> LiveResult<Box<dyn IngestProcess>>;

    async fn spawn_recorder(&self, spec: &RecorderSpec) -> LiveResult<Box<dyn IngestProcess>>;
}

/// Terminates `process` and waits for it, escalating to a kill when it
/// outlives `grace`.
pub(crate) async fn shutdown_process(
    process: &mut dyn IngestProcess,
    grace: Duration,
    stream_key: &str,
) -> LiveResult<ExitInfo> {
    if let Some(exit) = process.try_exit()? {
        return Ok(exit);
    }
    if let Err(err) = process.terminate().await {
        warn!(target: "live", stream_key, error = %err, "graceful terminate failed, killing");
        process.kill().await?;
        return process.wait_exit().await;
    }
    match timeout(grace, process.wait_exit()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(target: "live", stream_key, grace = ?grace, "process ignored terminate, killing");
            process.kill().await?;
            process.wait_exit().await
        }
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegIngestLauncher {
    ffmpeg: PathBuf,
}

impl FfmpegIngestLauncher {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    fn spawn(&self, args: Vec<String>, log: &Path) -> LiveResult<FfmpegProcess> {
        let log_file = File::create(log).map_err(|source| LiveError::Io {
            source,
            path: log.to_path_buf(),
        })?;
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| LiveError::Spawn {
            program: self.ffmpeg.display().to_string(),
            source,
        })?;
        debug!(target: "live", pid = ?child.id(), args = %args.join(" "), "spawned ffmpeg");
        Ok(FfmpegProcess { child })
    }
}

pub(crate) fn ingest_args(spec: &IngestSpec) -> Vec<String> {
    let segment_pattern = spec.output_dir.join("segment_%05d.ts");
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-nostats".into(),
        "-i".into(),
        spec.input_url.clone(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-tune".into(),
        "zerolatency".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        spec.hls_time_secs.to_string(),
        "-hls_list_size".into(),
        spec.hls_list_size.to_string(),
        "-hls_flags".into(),
        "delete_segments".into(),
        "-hls_segment_filename".into(),
        segment_pattern.to_string_lossy().to_string(),
        spec.playlist.to_string_lossy().to_string(),
    ]
}

pub(crate) fn recorder_args(spec: &RecorderSpec) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-nostats".into(),
        "-y".into(),
        "-i".into(),
        spec.playlist.to_string_lossy().to_string(),
        "-c".into(),
        "copy".into(),
        spec.output.to_string_lossy().to_string(),
    ]
}

#[async_trait::async_trait]
impl IngestLauncher for FfmpegIngestLauncher {
    async fn spawn_ingest(&self, spec: &IngestSpec) -> LiveResult<Box<dyn IngestProcess>> {
        let log = spec.output_dir.join("ingest.log");
        Ok(Box::new(self.spawn(ingest_args(spec), &log)?))
    }

    async fn spawn_recorder(&self, spec: &RecorderSpec) -> LiveResult<Box<dyn IngestProcess>> {
        Ok(Box::new(self.spawn(recorder_args(spec), &spec.log)?))
    }
}

/// ffmpeg child process. `terminate` sends `q` on stdin, which lets ffmpeg
/// finish writing its output before exiting.
#[derive(Debug)]
pub struct FfmpegProcess {
    child: Child,
}

#[async_trait::async_trait]
impl IngestProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> LiveResult<Option<ExitInfo>> {
        self.child
            .try_wait()
            .map(|status| status.map(ExitInfo::from))
            .map_err(|source| LiveError::Io {
                source,
                path: PathBuf::from("ffmpeg"),
            })
    }

    async fn terminate(&mut self) -> LiveResult<()> {
        match self.child.stdin.take() {
            Some(mut stdin) => {
                // A closed pipe means the process is already on its way out.
                if let Err(err) = stdin.write_all(b"q").await {
                    debug!(target: "live", error = %err, "ffmpeg stdin closed");
                }
                let _ = stdin.shutdown().await;
                Ok(())
            }
            None => self.kill().await,
        }
    }

    async fn kill(&mut self) -> LiveResult<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(LiveError::Io {
                source,
                path: PathBuf::from("ffmpeg"),
            }),
        }
    }

    async fn wait_exit(&mut self) -> LiveResult<ExitInfo> {
        self.child
            .wait()
            .await
            .map(ExitInfo::from)
            .map_err(|source| LiveError::Io {
                source,
                path: PathBuf::from("ffmpeg"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_writes_rolling_playlist_into_stream_dir() {
        let spec = IngestSpec {
            stream_key: "k1".into(),
            input_url: "rtmp://ingest/live/k1".into(),
            output_dir: PathBuf::from("/srv/live/k1"),
            playlist: PathBuf::from("/srv/live/k1/index.m3u8"),
            hls_time_secs: 4,
            hls_list_size: 6,
        };
        let args = ingest_args(&spec);
        let joined = args.join(" ");
        assert!(joined.contains("-i rtmp://ingest/live/k1"));
        assert!(joined.contains("-f hls -hls_time 4 -hls_list_size 6 -hls_flags delete_segments"));
        assert!(joined.contains("/srv/live/k1/segment_%05d.ts"));
        assert_eq!(args.last().map(String::as_str), Some("/srv/live/k1/index.m3u8"));
    }

    #[test]
    fn recorder_copies_playlist_without_reencoding() {
        let spec = RecorderSpec {
            stream_key: "k1".into(),
            playlist: PathBuf::from("/srv/live/k1/index.m3u8"),
            output: PathBuf::from("/srv/live/k1/recordings/r.mp4"),
            log: PathBuf::from("/srv/live/k1/recordings/r.log"),
        };
        let joined = recorder_args(&spec).join(" ");
        assert!(joined.ends_with("-i /srv/live/k1/index.m3u8 -c copy /srv/live/k1/recordings/r.mp4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let launcher = FfmpegIngestLauncher::new("/nonexistent/ffmpeg");
        let spec = IngestSpec {
            stream_key: "k1".into(),
            input_url: "rtmp://ingest/live/k1".into(),
            output_dir: dir.path().to_path_buf(),
            playlist: dir.path().join("index.m3u8"),
            hls_time_secs: 4,
            hls_list_size: 6,
        };
        let err = launcher.spawn_ingest(&spec).await.err().unwrap();
        assert!(matches!(err, LiveError::Spawn { .. }));
    }
}
