use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tempfile::Builder;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::EncoderSection;

use super::error::{EncoderError, EncoderResult};
use super::types::{EncodedFile, MediaProbe, RenditionSpec};
use super::{CommandExecutor, MediaEncoder, SystemCommandExecutor};

#[derive(Debug, Clone)]
pub struct EncoderPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

pub struct FfmpegEncoder {
    paths: EncoderPaths,
    scratch_dir: PathBuf,
    probe_timeout: Duration,
    encode_timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for FfmpegEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegEncoder")
            .field("paths", &self.paths)
            .field("scratch_dir", &self.scratch_dir)
            .field("probe_timeout", &self.probe_timeout)
            .field("encode_timeout", &self.encode_timeout)
            .finish()
    }
}

impl FfmpegEncoder {
    pub fn new(section: &EncoderSection, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            paths: EncoderPaths {
                ffmpeg: PathBuf::from(&section.ffmpeg),
                ffprobe: PathBuf::from(&section.ffprobe),
            },
            scratch_dir: scratch_dir.into(),
            probe_timeout: Duration::from_secs(section.probe_timeout_secs.max(1)),
            encode_timeout: Duration::from_secs(section.encode_timeout_secs.max(1)),
            executor: Arc::new(SystemCommandExecutor),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn paths(&self) -> &EncoderPaths {
        &self.paths
    }

    async fn execute(
        &self,
        program: &Path,
        args: &[String],
        limit: Duration,
    ) -> EncoderResult<Output> {
        let command = describe(program, args);
        debug!(%command, "running encoder command");
        match timeout(limit, self.executor.run(program, args)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(EncoderError::Io {
                path: program.to_path_buf(),
                source,
            }),
            Err(_) => {
                warn!(%command, timeout = ?limit, "encoder command timed out");
                Err(EncoderError::Timeout {
                    command,
                    timeout: limit,
                })
            }
        }
    }

    fn scratch_output(&self, prefix: &str, suffix: &str) -> EncoderResult<tempfile::TempPath> {
        std::fs::create_dir_all(&self.scratch_dir).map_err(|source| EncoderError::Io {
            path: self.scratch_dir.clone(),
            source,
        })?;
        Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(&self.scratch_dir)
            .map(|file| file.into_temp_path())
            .map_err(|source| EncoderError::Io {
                path: self.scratch_dir.clone(),
                source,
            })
    }

    /// Runs an ffmpeg invocation writing to `output`. On any failure the
    /// output is dropped, and with it the partial file.
    async fn encode_into(
        &self,
        args: Vec<String>,
        output: tempfile::TempPath,
    ) -> EncoderResult<EncodedFile> {
        let result = self
            .execute(&self.paths.ffmpeg, &args, self.encode_timeout)
            .await?;
        if !result.status.success() {
            return Err(EncoderError::Encode {
                command: describe(&self.paths.ffmpeg, &args),
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        let produced = tokio::fs::metadata(&*output)
            .await
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);
        if !produced {
            return Err(EncoderError::Encode {
                command: describe(&self.paths.ffmpeg, &args),
                status: result.status.code(),
                stderr: "encoder produced no output".to_string(),
            });
        }
        Ok(EncodedFile::new(output))
    }
}

#[async_trait::async_trait]
impl MediaEncoder for FfmpegEncoder {
    async fn probe(&self, input: &Path) -> EncoderResult<MediaProbe> {
        let args = probe_args(input);
        let output = self
            .execute(&self.paths.ffprobe, &args, self.probe_timeout)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncoderError::Metadata(format!(
                "ffprobe exited with {:?} for {}: {}",
                output.status.code(),
                input.display(),
                stderr.trim()
            )));
        }
        parse_probe(&output.stdout, input)
    }

    async fn thumbnail(&self, input: &Path, offset_s: f64) -> EncoderResult<EncodedFile> {
        let output = self.scratch_output("thumb-", ".jpg")?;
        let args = thumbnail_args(input, offset_s, &output);
        self.encode_into(args, output).await
    }

    async fn transcode(
        &self,
        input: &Path,
        rendition: &RenditionSpec,
    ) -> EncoderResult<EncodedFile> {
        let output = self.scratch_output(&format!("{}-", rendition.name), ".mp4")?;
        let args = transcode_args(input, rendition, &output);
        self.encode_into(args, output).await
    }
}

fn describe(program: &Path, args: &[String]) -> String {
    format!("{} {}", program.display(), args.join(" "))
}

fn probe_args(input: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "error".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_streams".to_string(),
        "-show_format".to_string(),
        input.to_string_lossy().to_string(),
    ]
}

fn thumbnail_args(input: &Path, offset_s: f64, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-ss".to_string(),
        format!("{:.3}", offset_s.max(0.0)),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-q:v".to_string(),
        "2".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

fn transcode_args(input: &Path, rendition: &RenditionSpec, output: &Path) -> Vec<String> {
    let bitrate = rendition.bitrate_kbps;
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-vf".to_string(),
        format!(
            "scale={}:{}:force_original_aspect_ratio=decrease,pad=ceil(iw/2)*2:ceil(ih/2)*2",
            rendition.width, rendition.height
        ),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-b:v".to_string(),
        format!("{bitrate}k"),
        "-maxrate".to_string(),
        format!("{}k", bitrate + bitrate / 10),
        "-bufsize".to_string(),
        format!("{}k", bitrate * 2),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    bit_rate: Option<String>,
}

fn parse_probe(stdout: &[u8], input: &Path) -> EncoderResult<MediaProbe> {
    let data: FfprobeOutput = serde_json::from_slice(stdout).map_err(|err| {
        EncoderError::Metadata(format!("invalid ffprobe payload for {}: {err}", input.display()))
    })?;
    let video = data
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| {
            EncoderError::Metadata(format!("missing video stream in {}", input.display()))
        })?;
    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(EncoderError::Metadata(format!(
                "video stream in {} has no dimensions",
                input.display()
            )))
        }
    };
    let duration_s = parse_number(data.format.duration.as_deref())
        .or_else(|| parse_number(video.duration.as_deref()))
        .ok_or_else(|| {
            EncoderError::Metadata(format!("no duration reported for {}", input.display()))
        })?;
    let bitrate_bps = parse_number(data.format.bit_rate.as_deref())
        .or_else(|| parse_number(video.bit_rate.as_deref()))
        .map(|value| value.round() as u64)
        .unwrap_or(0);
    Ok(MediaProbe {
        duration_s,
        width,
        height,
        codec: video
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        bitrate_bps,
    })
}

fn parse_number(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|parsed| parsed.is_finite() && *parsed >= 0.0)
}
