use std::path::Path;

use serde::Serialize;
use tempfile::TempPath;

use crate::config::RenditionSection;

use super::error::{EncoderError, EncoderResult};

/// Stream metadata extracted from a probe run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaProbe {
    pub duration_s: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    pub bitrate_bps: u64,
}

/// One target quality of the rendition ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenditionSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

impl RenditionSpec {
    pub fn new(name: impl Into<String>, width: u32, height: u32, bitrate_kbps: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            bitrate_kbps,
        }
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// The 360p/720p/1080p ladder used when no configuration overrides it.
    pub fn default_ladder() -> Vec<RenditionSpec> {
        vec![
            RenditionSpec::new("360p", 640, 360, 800),
            RenditionSpec::new("720p", 1280, 720, 2800),
            RenditionSpec::new("1080p", 1920, 1080, 5000),
        ]
    }
}

impl From<&RenditionSection> for RenditionSpec {
    fn from(section: &RenditionSection) -> Self {
        RenditionSpec::new(
            section.name.clone(),
            section.width,
            section.height,
            section.bitrate_kbps,
        )
    }
}

/// Encoder output living in scratch space. The file is removed when the
/// value is dropped, whatever happened to it in between.
#[derive(Debug)]
pub struct EncodedFile {
    path: TempPath,
}

impl EncodedFile {
    pub fn new(path: TempPath) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> EncoderResult<Vec<u8>> {
        tokio::fs::read(&*self.path)
            .await
            .map_err(|source| EncoderError::Io {
                path: self.path.to_path_buf(),
                source,
            })
    }

    pub async fn size(&self) -> EncoderResult<u64> {
        tokio::fs::metadata(&*self.path)
            .await
            .map(|meta| meta.len())
            .map_err(|source| EncoderError::Io {
                path: self.path.to_path_buf(),
                source,
            })
    }
}
