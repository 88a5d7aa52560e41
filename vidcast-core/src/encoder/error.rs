use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("metadata error: {0}")]
    Metadata(String),
    #[error("encode failed ({command}): {stderr}")]
    Encode {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl EncoderError {
    /// True when the source media itself is unusable, as opposed to the
    /// encoder failing on otherwise valid input.
    pub fn is_metadata(&self) -> bool {
        matches!(self, EncoderError::Metadata(_))
    }
}

pub type EncoderResult<T> = Result<T, EncoderError>;
