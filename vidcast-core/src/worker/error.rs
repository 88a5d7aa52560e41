use std::path::PathBuf;

use thiserror::Error;

use crate::encoder::EncoderError;
use crate::jobs::JobStoreError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to fetch source {url} after {attempts} attempts: {source}")]
    TransientFetch {
        url: String,
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error("{0}")]
    Metadata(#[source] EncoderError),
    #[error("{stage} failed: {source}")]
    Encode {
        stage: &'static str,
        #[source]
        source: EncoderError,
    },
    #[error("{stage} storage error: {source}")]
    Storage {
        stage: &'static str,
        #[source]
        source: StorageError,
    },
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error("scratch io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl PipelineError {
    /// Pipeline stage the error aborted.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::TransientFetch { .. } | PipelineError::Io { .. } => "fetch",
            PipelineError::Metadata(_) => "probe",
            PipelineError::Encode { stage, .. } | PipelineError::Storage { stage, .. } => *stage,
            PipelineError::Store(_) => "finalize",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
