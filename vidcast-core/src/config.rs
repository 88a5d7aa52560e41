use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Rendition progress is spread over a 20 point band, one point per step.
pub const MAX_RENDITIONS: usize = 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VidcastConfig {
    pub paths: PathsSection,
    pub worker: WorkerSection,
    pub encoder: EncoderSection,
    pub live: LiveSection,
    pub storage: StorageSection,
    #[serde(default)]
    pub notify: NotifySection,
}

impl VidcastConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.database)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.scratch_dir)
    }

    /// Upper bound on one job's encoder time: a probe, a thumbnail and every
    /// rendition each running into their timeout.
    pub fn worst_case_pipeline_secs(&self) -> u64 {
        let renditions = if self.encoder.renditions.is_empty() {
            crate::encoder::RenditionSpec::default_ladder().len()
        } else {
            self.encoder.renditions.len()
        } as u64;
        self.encoder
            .encode_timeout_secs
            .saturating_mul(renditions + 1)
            .saturating_add(self.encoder.probe_timeout_secs)
    }

    /// Rejects values the worker and registry cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.worker_id.trim().is_empty() {
            return Err(ConfigError::invalid("worker.worker_id", "must not be empty"));
        }
        if self.worker.batch_size == 0 {
            return Err(ConfigError::invalid("worker.batch_size", "must be at least 1"));
        }
        if self.worker.lease_secs == 0 {
            return Err(ConfigError::invalid("worker.lease_secs", "must be at least 1"));
        }
        let mut names = std::collections::HashSet::new();
        for rendition in &self.encoder.renditions {
            if rendition.width == 0 || rendition.height == 0 || rendition.bitrate_kbps == 0 {
                return Err(ConfigError::invalid(
                    format!("encoder.renditions.{}", rendition.name),
                    "width, height and bitrate must be positive",
                ));
            }
            if !names.insert(rendition.name.as_str()) {
                return Err(ConfigError::invalid(
                    "encoder.renditions",
                    format!("duplicate rendition {}", rendition.name),
                ));
            }
        }
        if self.encoder.renditions.len() > MAX_RENDITIONS {
            return Err(ConfigError::invalid(
                "encoder.renditions",
                format!("at most {MAX_RENDITIONS} renditions are supported"),
            ));
        }
        let worst_case = self.worst_case_pipeline_secs();
        if self.worker.lease_secs <= worst_case {
            return Err(ConfigError::invalid(
                "worker.lease_secs",
                format!("must exceed the worst-case pipeline time of {worst_case}s"),
            ));
        }
        if self.live.hls_time_secs == 0 {
            return Err(ConfigError::invalid("live.hls_time_secs", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub data_dir: String,
    pub scratch_dir: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub worker_id: String,
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub lease_secs: u64,
    pub max_attempts: u32,
    pub fetch_retry: FetchRetrySection,
}

impl WorkerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchRetrySection {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub probe_timeout_secs: u64,
    pub encode_timeout_secs: u64,
    pub thumbnail_offset_secs: f64,
    #[serde(default)]
    pub renditions: Vec<RenditionSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenditionSection {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveSection {
    pub output_root: String,
    pub public_base_url: String,
    pub monitor_interval_secs: u64,
    pub stop_timeout_secs: u64,
    pub stale_after_secs: u64,
    pub hls_time_secs: u32,
    pub hls_list_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Local,
    Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    pub backend: StorageBackend,
    pub local_dir: String,
    pub public_base_url: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifySection {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

pub fn load_vidcast_config<P: AsRef<Path>>(path: P) -> Result<VidcastConfig> {
    let config: VidcastConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
