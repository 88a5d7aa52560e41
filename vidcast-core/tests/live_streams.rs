mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use vidcast_core::{
    LiveError, LocalStorage, RecordingManager, RecordingStatus, RegistrySettings, Storage,
    StreamRegistry, ViewerCounter,
};

use common::{eventually, probe_1080p, FakeEncoder, FakeLauncher, RejectingStorage};

fn settings(dir: &TempDir) -> RegistrySettings {
    RegistrySettings {
        output_root: dir.path().join("live"),
        public_base_url: "http://localhost:8080/live".into(),
        monitor_interval: Duration::from_millis(20),
        stop_timeout: Duration::from_millis(200),
        stale_after: Duration::from_millis(100),
        hls_time_secs: 4,
        hls_list_size: 6,
    }
}

fn registry_with(
    dir: &TempDir,
    launcher: Arc<FakeLauncher>,
    storage: Arc<dyn Storage>,
) -> StreamRegistry {
    let encoder = Arc::new(FakeEncoder::new(
        &dir.path().join("frames"),
        Some(probe_1080p(0.0)),
    ));
    StreamRegistry::new(settings(dir), launcher, encoder, storage)
}

fn local_storage(dir: &TempDir) -> Arc<dyn Storage> {
    Arc::new(LocalStorage::new(
        dir.path().join("media"),
        "http://localhost:8080/media",
    ))
}

#[tokio::test]
async fn started_stream_reports_live_immediately() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    let url = registry
        .start_stream("k1", "rtmp://ingest/live/k1")
        .await
        .unwrap();
    assert_eq!(url, "http://localhost:8080/live/k1/index.m3u8");

    let status = registry.status("k1").await;
    assert!(status.is_live);
    let started = status.started_at.unwrap();
    assert!((Utc::now() - started).num_seconds().abs() < 5);
    assert_eq!(status.playback_url.as_deref(), Some(url.as_str()));
    assert_eq!(status.viewer_count, 0);

    assert!(dir.path().join("live/k1").is_dir());
    let ingests = launcher.ingests.lock().unwrap();
    assert_eq!(ingests[0].0.input_url, "rtmp://ingest/live/k1");
    assert_eq!(ingests[0].0.playlist, dir.path().join("live/k1/index.m3u8"));
}

#[tokio::test]
async fn unknown_keys_are_not_live_and_stop_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let registry = registry_with(&dir, Arc::new(FakeLauncher::new()), local_storage(&dir));
    let status = registry.status("ghost").await;
    assert!(!status.is_live);
    assert!(status.started_at.is_none());
    assert!(status.playback_url.is_none());
    registry.stop_stream("ghost").await.unwrap();
    registry.stop_stream("ghost").await.unwrap();
    assert!(!registry.is_healthy("ghost").await);
    assert!(registry.metrics("ghost").await.is_none());
    assert!(registry.generate_thumbnail("ghost").await.is_none());
}

#[tokio::test]
async fn second_start_is_rejected_without_spawning() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    registry.start_stream("k1", "rtmp://a").await.unwrap();
    let err = registry.start_stream("k1", "rtmp://b").await.unwrap_err();
    assert!(matches!(err, LiveError::AlreadyLive(ref key) if key == "k1"));
    assert_eq!(launcher.spawn_count.load(Ordering::SeqCst), 1);
    assert_eq!(registry.live_keys().await, ["k1"]);
}

#[tokio::test]
async fn concurrent_starts_leave_one_process() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start_stream("race", "rtmp://x").await })
        })
        .collect();
    let mut started = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => started += 1,
            Err(LiveError::AlreadyLive(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(launcher.spawn_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_waits_for_exit_and_allows_restart() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    registry.start_stream("k1", "rtmp://a").await.unwrap();
    registry.stop_stream("k1").await.unwrap();
    let first = launcher.ingest_state(0);
    assert!(first.terminated.load(Ordering::SeqCst));
    assert!(first.reaped.load(Ordering::SeqCst));
    assert!(!first.killed.load(Ordering::SeqCst));
    assert!(!registry.status("k1").await.is_live);

    registry.start_stream("k1", "rtmp://a").await.unwrap();
    assert_eq!(launcher.spawn_count.load(Ordering::SeqCst), 2);
    assert!(registry.status("k1").await.is_live);
}

#[tokio::test]
async fn stubborn_process_is_killed_after_grace() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    launcher.ignore_terminate.store(true, Ordering::SeqCst);
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    registry.start_stream("k1", "rtmp://a").await.unwrap();
    registry.stop_stream("k1").await.unwrap();
    let state = launcher.ingest_state(0);
    assert!(state.terminated.load(Ordering::SeqCst));
    assert!(state.killed.load(Ordering::SeqCst));
    assert!(state.reaped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn failed_shutdown_still_kills_and_reaps() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    registry.start_stream("k1", "rtmp://a").await.unwrap();
    let state = launcher.ingest_state(0);
    state.fail_exit_check.store(true, Ordering::SeqCst);

    let err = registry.stop_stream("k1").await.unwrap_err();
    assert!(matches!(err, LiveError::Io { .. }));
    assert!(state.killed.load(Ordering::SeqCst));
    assert!(state.reaped.load(Ordering::SeqCst));
    assert!(!registry.status("k1").await.is_live);

    registry.start_stream("k1", "rtmp://a").await.unwrap();
    assert_eq!(launcher.spawn_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn spawn_failure_leaves_registry_unchanged() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    launcher.fail_spawn.store(true, Ordering::SeqCst);
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    let err = registry.start_stream("k1", "rtmp://a").await.unwrap_err();
    assert!(matches!(err, LiveError::Spawn { .. }));
    assert!(!registry.status("k1").await.is_live);
    assert!(registry.live_keys().await.is_empty());

    launcher.fail_spawn.store(false, Ordering::SeqCst);
    registry.start_stream("k1", "rtmp://a").await.unwrap();
}

#[tokio::test]
async fn invalid_keys_are_rejected() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));
    let err = registry.start_stream("../escape", "rtmp://a").await.unwrap_err();
    assert!(matches!(err, LiveError::InvalidStreamKey(_)));
    assert_eq!(launcher.spawn_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn monitor_removes_streams_whose_process_exited() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    registry.start_stream("k1", "rtmp://a").await.unwrap();
    launcher.ingest_state(0).exit();
    let removed = eventually(Duration::from_secs(2), || {
        let registry = registry.clone();
        async move { !registry.status("k1").await.is_live }
    })
    .await;
    assert!(removed);
    assert!(launcher.ingest_state(0).reaped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn health_requires_a_fresh_playlist_after_warm_up() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));

    registry.start_stream("k1", "rtmp://a").await.unwrap();
    assert!(registry.is_healthy("k1").await, "healthy during warm-up");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!registry.is_healthy("k1").await, "no playlist written");

    std::fs::write(dir.path().join("live/k1/index.m3u8"), b"#EXTM3U\n").unwrap();
    assert!(registry.is_healthy("k1").await);

    launcher.ingest_state(0).exit();
    assert!(!registry.is_healthy("k1").await);
}

#[tokio::test]
async fn metrics_thumbnail_and_variants_for_live_stream() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    launcher.with_pid.store(true, Ordering::SeqCst);
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));
    registry.start_stream("k1", "rtmp://a").await.unwrap();

    let metrics = registry.metrics("k1").await.unwrap();
    assert_eq!(metrics.pid, Some(std::process::id()));
    assert_eq!(metrics.fps, 30.0);
    assert_eq!(metrics.dropped_frames, 0);

    let thumbnail = registry.generate_thumbnail("k1").await.unwrap();
    assert!(thumbnail.starts_with("http://localhost:8080/media/thumbnails/"));

    let variants = registry.quality_variants("k1");
    assert_eq!(variants.len(), 4);
    assert_eq!(
        variants[0].playlist_url,
        "http://localhost:8080/live/k1/1080p/index.m3u8"
    );
}

struct FixedViewers(u64);

impl ViewerCounter for FixedViewers {
    fn viewer_count(&self, _stream_key: &str) -> u64 {
        self.0
    }
}

#[tokio::test]
async fn viewer_count_comes_from_counter() {
    let dir = TempDir::new().unwrap();
    let registry = registry_with(&dir, Arc::new(FakeLauncher::new()), local_storage(&dir))
        .with_viewer_counter(Arc::new(FixedViewers(17)));
    registry.start_stream("k1", "rtmp://a").await.unwrap();
    assert_eq!(registry.status("k1").await.viewer_count, 17);
    assert_eq!(registry.status("other").await.viewer_count, 0);
}

#[tokio::test]
async fn shutdown_stops_every_stream() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let registry = registry_with(&dir, launcher.clone(), local_storage(&dir));
    registry.start_stream("a", "rtmp://a").await.unwrap();
    registry.start_stream("b", "rtmp://b").await.unwrap();
    assert_eq!(registry.live_keys().await, ["a", "b"]);

    registry.shutdown().await;
    assert!(registry.live_keys().await.is_empty());
    assert!(launcher.ingest_state(0).reaped.load(Ordering::SeqCst));
    assert!(launcher.ingest_state(1).reaped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn recording_requires_a_live_stream() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let storage = local_storage(&dir);
    let registry = registry_with(&dir, launcher.clone(), storage.clone());
    let recordings = RecordingManager::new(registry, launcher, storage);

    let err = recordings.start_recording("k2").await.unwrap_err();
    assert!(matches!(err, LiveError::NotFound(ref key) if key == "k2"));
    let err = recordings.stop_recording("k2").await.unwrap_err();
    assert!(matches!(err, LiveError::NotFound(_)));
    assert!(recordings.recordings("k2").await.is_empty());
}

#[tokio::test]
async fn stop_recording_publishes_the_latest_recording() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let storage = local_storage(&dir);
    let registry = registry_with(&dir, launcher.clone(), storage.clone());
    registry.start_stream("k2", "rtmp://a").await.unwrap();
    let recordings = RecordingManager::new(registry.clone(), launcher.clone(), storage);

    let first = recordings.start_recording("k2").await.unwrap();
    assert_eq!(first.status, RecordingStatus::Recording);
    assert!(first.file_path.starts_with(dir.path().join("live/k2/recordings")));
    let err = recordings.start_recording("k2").await.unwrap_err();
    assert!(matches!(err, LiveError::InvalidOperation { .. }));

    let stopped = recordings.stop_recording("k2").await.unwrap();
    assert_eq!(stopped.id, first.id);
    assert_eq!(stopped.status, RecordingStatus::Completed);
    assert!(stopped.ended_at.is_some());
    assert_eq!(stopped.file_size, Some(b"recorded stream".len() as u64));
    assert!(stopped
        .uploaded_url
        .as_deref()
        .is_some_and(|url| url.starts_with("http://localhost:8080/media/videos/")));
    assert!(launcher.recorder_state(0).reaped.load(Ordering::SeqCst));

    let err = recordings.stop_recording("k2").await.unwrap_err();
    assert!(matches!(err, LiveError::NotFound(_)));

    let second = recordings.start_recording("k2").await.unwrap();
    assert_ne!(second.id, first.id);
    assert_ne!(second.file_path, first.file_path);
    let stopped = recordings.stop_recording("k2").await.unwrap();
    assert_eq!(stopped.id, second.id);

    let all = recordings.recordings("k2").await;
    let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, [first.id.as_str(), second.id.as_str()]);
    assert!(all.iter().all(|r| r.status == RecordingStatus::Completed));
}

#[tokio::test]
async fn failed_upload_marks_recording_failed() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let storage: Arc<dyn Storage> = Arc::new(RejectingStorage);
    let registry = registry_with(&dir, launcher.clone(), storage.clone());
    registry.start_stream("k3", "rtmp://a").await.unwrap();
    let recordings = RecordingManager::new(registry, launcher, storage);

    let started = recordings.start_recording("k3").await.unwrap();
    let err = recordings.stop_recording("k3").await.unwrap_err();
    assert!(matches!(err, LiveError::Storage(_)));

    let all = recordings.recordings("k3").await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, RecordingStatus::Failed);
    assert!(all[0].error.is_some());
    assert!(all[0].uploaded_url.is_none());
    assert!(started.file_path.exists());
}

#[tokio::test]
async fn stopping_a_stream_finishes_its_recording() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let storage = local_storage(&dir);
    let registry = registry_with(&dir, launcher.clone(), storage.clone());
    let recordings = RecordingManager::new(registry.clone(), launcher.clone(), storage);

    registry.start_stream("k4", "rtmp://a").await.unwrap();
    let first = recordings.start_recording("k4").await.unwrap();
    registry.stop_stream("k4").await.unwrap();

    let recorder = launcher.recorder_state(0);
    assert!(recorder.terminated.load(Ordering::SeqCst));
    assert!(recorder.reaped.load(Ordering::SeqCst));
    let all = recordings.recordings("k4").await;
    assert_eq!(all[0].id, first.id);
    assert_eq!(all[0].status, RecordingStatus::Completed);
    assert!(all[0].ended_at.is_some());
    assert!(all[0].uploaded_url.is_some());
    let err = recordings.stop_recording("k4").await.unwrap_err();
    assert!(matches!(err, LiveError::NotFound(_)));

    registry.start_stream("k4", "rtmp://a").await.unwrap();
    let second = recordings.start_recording("k4").await.unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(second.status, RecordingStatus::Recording);
}

#[tokio::test]
async fn exited_stream_finishes_its_recording() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let storage = local_storage(&dir);
    let registry = registry_with(&dir, launcher.clone(), storage.clone());
    let recordings = RecordingManager::new(registry.clone(), launcher.clone(), storage);

    registry.start_stream("k5", "rtmp://a").await.unwrap();
    recordings.start_recording("k5").await.unwrap();
    launcher.ingest_state(0).exit();

    let finished = eventually(Duration::from_secs(2), || {
        let recordings = Arc::clone(&recordings);
        async move {
            recordings
                .recordings("k5")
                .await
                .first()
                .is_some_and(|r| r.status == RecordingStatus::Completed)
        }
    })
    .await;
    assert!(finished);
    assert!(launcher.recorder_state(0).reaped.load(Ordering::SeqCst));
    assert!(!registry.status("k5").await.is_live);
}

#[tokio::test]
async fn shutdown_finishes_every_recording() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let storage: Arc<dyn Storage> = Arc::new(RejectingStorage);
    let registry = registry_with(&dir, launcher.clone(), storage.clone());
    let recordings = RecordingManager::new(registry.clone(), launcher.clone(), storage);

    for key in ["a", "b"] {
        registry.start_stream(key, "rtmp://x").await.unwrap();
        recordings.start_recording(key).await.unwrap();
    }
    registry.shutdown().await;

    for (index, key) in ["a", "b"].into_iter().enumerate() {
        assert!(launcher.recorder_state(index).reaped.load(Ordering::SeqCst));
        let all = recordings.recordings(key).await;
        assert_eq!(all[0].status, RecordingStatus::Failed, "upload rejected for {key}");
        assert!(all[0].ended_at.is_some());
    }
}

#[tokio::test]
async fn dropped_manager_no_longer_hooks_stream_end() {
    let dir = TempDir::new().unwrap();
    let launcher = Arc::new(FakeLauncher::new());
    let storage = local_storage(&dir);
    let registry = registry_with(&dir, launcher.clone(), storage.clone());
    drop(RecordingManager::new(registry.clone(), launcher, storage));

    registry.start_stream("k6", "rtmp://a").await.unwrap();
    registry.stop_stream("k6").await.unwrap();
    assert!(!registry.status("k6").await.is_live);
}
