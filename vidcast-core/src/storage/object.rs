use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::{http_get, join_url, object_key, ObjectKind, Storage, StorageError, StorageResult};

/// S3-style object store reached with plain PUT/GET requests.
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    endpoint: String,
    bucket: String,
    public_base_url: String,
    http_client: reqwest::Client,
}

impl ObjectStorage {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
    ) -> StorageResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            public_base_url: public_base_url.into(),
            http_client,
        })
    }

    fn object_url(&self, key: &str) -> String {
        join_url(&join_url(&self.endpoint, &self.bucket), key)
    }

    async fn put(&self, kind: ObjectKind, bytes: Vec<u8>) -> StorageResult<String> {
        let key = object_key(kind, &bytes);
        let url = self.object_url(&key);
        let size = bytes.len();
        let response = self
            .http_client
            .put(&url)
            .header(CONTENT_TYPE, kind.content_type())
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::Fetch {
                url,
                reason: format!("upload rejected with http status {status}"),
            });
        }
        debug!(target: "storage", key = %key, size, "uploaded object");
        Ok(join_url(&self.public_base_url, &key))
    }
}

#[async_trait::async_trait]
impl Storage for ObjectStorage {
    async fn upload_video(&self, bytes: Vec<u8>) -> StorageResult<String> {
        self.put(ObjectKind::Video, bytes).await
    }

    async fn upload_thumbnail(&self, bytes: Vec<u8>) -> StorageResult<String> {
        self.put(ObjectKind::Thumbnail, bytes).await
    }

    async fn download(&self, url: &str) -> StorageResult<Vec<u8>> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StorageError::Unsupported(url.to_string()));
        }
        http_get(&self.http_client, url).await
    }
}
