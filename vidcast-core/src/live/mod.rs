//! Live ingest supervision: one external segmenting encoder per stream key,
//! plus on-demand recordings of the running streams.

mod metrics;
mod process;
mod recording;
mod registry;
mod variants;

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::storage::StorageError;

pub use metrics::{MetricsSampler, StreamMetrics};
pub use process::{
    ExitInfo, FfmpegIngestLauncher, FfmpegProcess, IngestLauncher, IngestProcess, IngestSpec,
    RecorderSpec,
};
pub use recording::{RecordingHandle, RecordingManager, RecordingStatus};
pub use registry::{
    RegistrySettings, StreamEndHook, StreamRegistry, StreamStatus, ViewerCounter,
};
pub use variants::{quality_variants, QualityVariant, VariantSpec, VARIANT_CATALOG};

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("stream {0} is already live")]
    AlreadyLive(String),
    #[error("stream {0} not found")]
    NotFound(String),
    #[error("invalid operation on stream {key}: {reason}")]
    InvalidOperation { key: String, reason: String },
    #[error("invalid stream key: {0:?}")]
    InvalidStreamKey(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("live io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type LiveResult<T> = Result<T, LiveError>;

fn stream_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid regex"))
}

/// Stream keys double as directory names, so only a conservative alphabet
/// is accepted.
pub fn validate_stream_key(key: &str) -> LiveResult<()> {
    if stream_key_pattern().is_match(key) {
        Ok(())
    } else {
        Err(LiveError::InvalidStreamKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_are_validated() {
        assert!(validate_stream_key("live_abc-123").is_ok());
        assert!(validate_stream_key("").is_err());
        assert!(validate_stream_key("../etc").is_err());
        assert!(validate_stream_key("a/b").is_err());
        assert!(validate_stream_key(&"k".repeat(129)).is_err());
    }
}
