use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use sysinfo::{Pid, System};

/// ffmpeg does not report frame telemetry to us; these are the nominal
/// values reported in its place.
const NOMINAL_FPS: f32 = 30.0;

/// Approximate resource snapshot of one ingest process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetrics {
    pub pid: Option<u32>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub uptime_s: u64,
    pub bitrate_kbps: u32,
    pub fps: f32,
    pub dropped_frames: u64,
}

impl StreamMetrics {
    pub fn nominal(pid: Option<u32>, uptime_s: u64) -> Self {
        Self {
            pid,
            cpu_percent: 0.0,
            memory_bytes: 0,
            uptime_s,
            bitrate_kbps: 0,
            fps: NOMINAL_FPS,
            dropped_frames: 0,
        }
    }
}

/// Process sampler shared by all streams. CPU usage is a delta between two
/// refreshes, so the first sample of a process reads zero.
#[derive(Debug)]
pub struct MetricsSampler {
    system: Mutex<System>,
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// CPU percent and resident memory of `pid`, if it is still running.
    pub fn sample(&self, pid: u32) -> Option<(f32, u64)> {
        let mut system = self.system.lock().ok()?;
        system.refresh_all();
        let process = system.process(Pid::from_u32(pid))?;
        let cpu = process.cpu_usage();
        let cpu = if cpu.is_finite() { cpu.max(0.0) } else { 0.0 };
        Some((cpu, process.memory()))
    }
}

/// Output bitrate estimated from the segments currently on disk.
pub(crate) async fn estimate_bitrate_kbps(output_dir: &Path, segment_secs: u32) -> u32 {
    let Ok(mut entries) = tokio::fs::read_dir(output_dir).await else {
        return 0;
    };
    let mut total_bytes: u64 = 0;
    let mut segments: u64 = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("ts") {
            continue;
        }
        if let Ok(meta) = entry.metadata().await {
            total_bytes += meta.len();
            segments += 1;
        }
    }
    let seconds = segments * u64::from(segment_secs.max(1));
    if seconds == 0 {
        return 0;
    }
    (total_bytes * 8 / seconds / 1000).min(u64::from(u32::MAX)) as u32
}
