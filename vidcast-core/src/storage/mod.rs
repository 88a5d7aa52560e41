//! Byte storage for published media.
//!
//! Callers only see [`Storage`]; [`storage_from_config`] decides whether the
//! bytes land on the local filesystem or in an S3-style object store.

mod local;
mod object;

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{StorageBackend, VidcastConfig};

pub use local::LocalStorage;
pub use object::ObjectStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unsupported storage location: {0}")]
    Unsupported(String),
}

impl StorageError {
    /// Errors worth retrying: the object may still be reachable later.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Fetch { .. } => true,
            StorageError::Network(err) => !err.is_builder() && !err.is_redirect(),
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn upload_video(&self, bytes: Vec<u8>) -> StorageResult<String>;

    async fn upload_thumbnail(&self, bytes: Vec<u8>) -> StorageResult<String>;

    async fn download(&self, url: &str) -> StorageResult<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Video,
    Thumbnail,
}

impl ObjectKind {
    fn prefix(self) -> &'static str {
        match self {
            ObjectKind::Video => "videos",
            ObjectKind::Thumbnail => "thumbnails",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ObjectKind::Video => "mp4",
            ObjectKind::Thumbnail => "jpg",
        }
    }

    pub(crate) fn content_type(self) -> &'static str {
        match self {
            ObjectKind::Video => "video/mp4",
            ObjectKind::Thumbnail => "image/jpeg",
        }
    }
}

/// Content-addressed key, e.g. `videos/<sha256>.mp4`. Identical uploads map
/// to the same object.
pub(crate) fn object_key(kind: ObjectKind, bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!(
        "{}/{}.{}",
        kind.prefix(),
        hex::encode(digest),
        kind.extension()
    )
}

pub(crate) fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key)
}

/// Plain HTTP(S) GET shared by both backends.
pub(crate) async fn http_get(client: &reqwest::Client, url: &str) -> StorageResult<Vec<u8>> {
    let response = client.get(url).send().await.map_err(|err| {
        if err.is_connect() || err.is_timeout() {
            StorageError::Fetch {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else {
            StorageError::Network(err)
        }
    })?;
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(StorageError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        return Err(StorageError::Fetch {
            url: url.to_string(),
            reason: format!("http status {status}"),
        });
    }
    let bytes = response.bytes().await?;
    Ok(bytes.to_vec())
}

pub fn storage_from_config(config: &VidcastConfig) -> StorageResult<Arc<dyn Storage>> {
    let section = &config.storage;
    match section.backend {
        StorageBackend::Local => Ok(Arc::new(LocalStorage::new(
            config.resolve_path(&section.local_dir),
            section.public_base_url.clone(),
        ))),
        StorageBackend::Object => {
            let endpoint = section.endpoint.clone().ok_or_else(|| {
                StorageError::Unsupported("object storage requires storage.endpoint".into())
            })?;
            let bucket = section.bucket.clone().ok_or_else(|| {
                StorageError::Unsupported("object storage requires storage.bucket".into())
            })?;
            Ok(Arc::new(ObjectStorage::new(
                endpoint,
                bucket,
                section.public_base_url.clone(),
            )?))
        }
    }
}
