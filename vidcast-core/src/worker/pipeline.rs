use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::encoder::{EncoderError, MediaProbe};
use crate::jobs::{JobRendition, ReadyUpdate, VideoJob};
use crate::storage::StorageError;

use super::error::{PipelineError, PipelineResult};
use super::TranscodeWorker;

const RENDITION_START: u8 = 70;
const RENDITION_END: u8 = 90;

impl TranscodeWorker {
    /// Runs every stage for one claimed job. The scratch directory is removed
    /// when this returns, whichever stage ended it.
    pub(super) async fn process(&self, job: &VideoJob) -> PipelineResult<()> {
        self.progress.begin(&job.id);
        let scratch = self.create_scratch(&job.id)?;
        let result = self.run_stages(job, scratch.path()).await;
        let scratch_path = scratch.path().to_path_buf();
        if let Err(err) = scratch.close() {
            warn!(target: "worker", job_id = %job.id, path = %scratch_path.display(), error = %err, "failed to remove scratch directory");
        }
        result
    }

    async fn run_stages(&self, job: &VideoJob, scratch: &Path) -> PipelineResult<()> {
        self.progress
            .update(&job.id, "fetch", 10, "downloading source");
        let source = self.fetch_source(job, scratch).await?;
        self.progress.update(&job.id, "fetch", 20, "source downloaded");

        self.progress.update(&job.id, "probe", 30, "reading metadata");
        let probe = self.probe(job, &source).await?;

        self.progress
            .update(&job.id, "thumbnail", 50, "generating thumbnail");
        let thumbnail_url = self.thumbnail(job, &source, &probe).await?;

        let renditions = self.renditions(job, &source).await;

        let update = ReadyUpdate {
            duration_s: probe.duration_s,
            thumbnail_url,
            renditions,
        };
        self.store
            .mark_ready(&job.id, &self.settings.worker_id, &update)?;
        self.progress.update(
            &job.id,
            "finalize",
            100,
            format!("published with {} renditions", update.renditions.len()),
        );
        Ok(())
    }

    fn create_scratch(&self, job_id: &str) -> PipelineResult<TempDir> {
        let root = &self.settings.scratch_dir;
        std::fs::create_dir_all(root).map_err(|source| PipelineError::Io {
            source,
            path: root.clone(),
        })?;
        tempfile::Builder::new()
            .prefix(&format!("job-{job_id}-"))
            .tempdir_in(root)
            .map_err(|source| PipelineError::Io {
                source,
                path: root.clone(),
            })
    }

    async fn fetch_source(&self, job: &VideoJob, scratch: &Path) -> PipelineResult<PathBuf> {
        let policy = &self.settings.fetch_retry;
        let attempts = policy.attempts.max(1);
        let mut attempt = 0;
        let bytes = loop {
            match self.storage.download(&job.source_url).await {
                Ok(bytes) => break bytes,
                Err(err) if !err.is_transient() => {
                    return Err(PipelineError::Storage {
                        stage: "fetch",
                        source: err,
                    })
                }
                Err(err) if attempt + 1 >= attempts => {
                    return Err(PipelineError::TransientFetch {
                        url: job.source_url.clone(),
                        attempts,
                        source: err,
                    })
                }
                Err(err) => {
                    let delay = policy.compute_delay(attempt);
                    warn!(
                        target: "worker",
                        job_id = %job.id,
                        attempt = attempt + 1,
                        wait = ?delay,
                        error = %err,
                        "retrying source download"
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        };
        let path = scratch.join(source_file_name(&job.source_url));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| PipelineError::Io {
                source,
                path: path.clone(),
            })?;
        debug!(target: "worker", job_id = %job.id, size = bytes.len(), "source written to scratch");
        Ok(path)
    }

    async fn probe(&self, job: &VideoJob, source: &Path) -> PipelineResult<MediaProbe> {
        let probe = self.encoder.probe(source).await.map_err(|err| {
            if err.is_metadata() {
                PipelineError::Metadata(err)
            } else {
                PipelineError::Encode {
                    stage: "probe",
                    source: err,
                }
            }
        })?;
        info!(
            target: "worker",
            job_id = %job.id,
            duration_s = probe.duration_s,
            width = probe.width,
            height = probe.height,
            codec = %probe.codec,
            "probed source"
        );
        Ok(probe)
    }

    async fn thumbnail(
        &self,
        job: &VideoJob,
        source: &Path,
        probe: &MediaProbe,
    ) -> PipelineResult<String> {
        let offset = self.settings.thumbnail_offset(probe.duration_s);
        let frame = self
            .encoder
            .thumbnail(source, offset)
            .await
            .map_err(|source| PipelineError::Encode {
                stage: "thumbnail",
                source,
            })?;
        let bytes = frame.read().await.map_err(|source| PipelineError::Encode {
            stage: "thumbnail",
            source,
        })?;
        let url = self
            .storage
            .upload_thumbnail(bytes)
            .await
            .map_err(|source| PipelineError::Storage {
                stage: "thumbnail",
                source,
            })?;
        debug!(target: "worker", job_id = %job.id, %url, "thumbnail uploaded");
        Ok(url)
    }

    /// Encodes and uploads each configured rendition in order. A failing
    /// variant is logged and left out; the others still run.
    async fn renditions(&self, job: &VideoJob, source: &Path) -> Vec<JobRendition> {
        let specs = &self.settings.renditions;
        let total = specs.len().max(1);
        let mut published = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let percent = rendition_percent(index, total);
            self.progress.update(
                &job.id,
                "renditions",
                percent,
                format!("encoding {} ({})", spec.name, spec.resolution()),
            );
            match self.encode_variant(source, spec).await {
                Ok(url) => published.push(JobRendition {
                    name: spec.name.clone(),
                    width: spec.width,
                    height: spec.height,
                    bitrate_kbps: spec.bitrate_kbps,
                    url,
                }),
                Err(err) => {
                    warn!(
                        target: "worker",
                        job_id = %job.id,
                        rendition = %spec.name,
                        error = %err,
                        "rendition skipped"
                    );
                }
            }
        }
        self.progress.update(
            &job.id,
            "renditions",
            RENDITION_END,
            format!("{}/{} renditions published", published.len(), specs.len()),
        );
        published
    }

    async fn encode_variant(
        &self,
        source: &Path,
        spec: &crate::encoder::RenditionSpec,
    ) -> Result<String, VariantError> {
        let encoded = self.encoder.transcode(source, spec).await?;
        let bytes = encoded.read().await?;
        drop(encoded);
        Ok(self.storage.upload_video(bytes).await?)
    }
}

#[derive(Debug, thiserror::Error)]
enum VariantError {
    #[error(transparent)]
    Encode(#[from] EncoderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Progress for the start of variant `index` out of `total`, spread over the
/// 70..90 band. Steps stay distinct up to
/// [`MAX_RENDITIONS`](crate::config::MAX_RENDITIONS) variants.
fn rendition_percent(index: usize, total: usize) -> u8 {
    let span = (RENDITION_END - RENDITION_START) as usize;
    RENDITION_START + (span * index / total) as u8
}

fn source_file_name(url: &str) -> String {
    let name = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("source.{ext}"),
        None => "source".to_string(),
    }
}
