//! Adapter between the pipeline and the external probe/encode binaries.
//!
//! The worker and the live registry only see [`MediaEncoder`]; command-line
//! details live in [`FfmpegEncoder`], which runs every binary through a
//! [`CommandExecutor`] so tests can replace the processes.

mod error;
mod ffmpeg;
mod types;

use std::path::Path;
use std::process::{Output, Stdio};

use tokio::process::Command;

pub use error::{EncoderError, EncoderResult};
pub use ffmpeg::{EncoderPaths, FfmpegEncoder};
pub use types::{EncodedFile, MediaProbe, RenditionSpec};

#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, program: &Path, args: &[String]) -> std::io::Result<Output> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command.output().await
    }
}

#[async_trait::async_trait]
pub trait MediaEncoder: Send + Sync {
    async fn probe(&self, input: &Path) -> EncoderResult<MediaProbe>;

    /// Grabs a single JPEG frame `offset_s` seconds into `input`.
    async fn thumbnail(&self, input: &Path, offset_s: f64) -> EncoderResult<EncodedFile>;

    async fn transcode(&self, input: &Path, rendition: &RenditionSpec)
        -> EncoderResult<EncodedFile>;
}
