use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::debug;
use url::Url;

use super::{
    http_get, join_url, object_key, ObjectKind, Storage, StorageError, StorageResult,
};

/// Filesystem fallback: objects live under `root` and are served from
/// `public_base_url` by whatever fronts that directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    public_base_url: String,
    http_client: reqwest::Client,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a URL this storage handed out back to its file, if it is one.
    pub fn local_path_for(&self, url: &str) -> Option<PathBuf> {
        let base = self.public_base_url.trim_end_matches('/');
        let key = url.strip_prefix(base)?.strip_prefix('/')?;
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !safe || key.is_empty() {
            return None;
        }
        Some(self.root.join(relative))
    }

    async fn store(&self, kind: ObjectKind, bytes: Vec<u8>) -> StorageResult<String> {
        let key = object_key(kind, &bytes);
        let path = self.root.join(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        if fs::metadata(&path).await.is_err() {
            let staging = path.with_extension("part");
            fs::write(&staging, &bytes)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: staging.clone(),
                })?;
            fs::rename(&staging, &path)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: path.clone(),
                })?;
            debug!(target: "storage", key = %key, size = bytes.len(), "stored object");
        }
        Ok(join_url(&self.public_base_url, &key))
    }

    async fn read_file(&self, path: &Path) -> StorageResult<Vec<u8>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.display().to_string()))
            }
            Err(source) => Err(StorageError::Io {
                source,
                path: path.to_path_buf(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl Storage for LocalStorage {
    async fn upload_video(&self, bytes: Vec<u8>) -> StorageResult<String> {
        self.store(ObjectKind::Video, bytes).await
    }

    async fn upload_thumbnail(&self, bytes: Vec<u8>) -> StorageResult<String> {
        self.store(ObjectKind::Thumbnail, bytes).await
    }

    async fn download(&self, url: &str) -> StorageResult<Vec<u8>> {
        if let Some(path) = self.local_path_for(url) {
            return self.read_file(&path).await;
        }
        match Url::parse(url) {
            Ok(parsed) => match parsed.scheme() {
                "file" => {
                    let path = parsed
                        .to_file_path()
                        .map_err(|_| StorageError::Unsupported(url.to_string()))?;
                    self.read_file(&path).await
                }
                "http" | "https" => http_get(&self.http_client, url).await,
                _ => Err(StorageError::Unsupported(url.to_string())),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => self.read_file(Path::new(url)).await,
            Err(_) => Err(StorageError::Unsupported(url.to_string())),
        }
    }
}
