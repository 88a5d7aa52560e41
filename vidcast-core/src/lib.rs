pub mod config;
pub mod encoder;
pub mod error;
pub mod jobs;
pub mod live;
pub mod notify;
pub mod progress;
pub mod sqlite;
pub mod storage;
pub mod worker;

pub use config::{
    load_vidcast_config, EncoderSection, FetchRetrySection, LiveSection, NotifySection,
    PathsSection, RenditionSection, StorageBackend, StorageSection, VidcastConfig, WorkerSection,
    MAX_RENDITIONS,
};
pub use encoder::{
    CommandExecutor, EncodedFile, EncoderError, EncoderResult, FfmpegEncoder, MediaEncoder,
    MediaProbe, RenditionSpec, SystemCommandExecutor,
};
pub use error::{ConfigError, Result};
pub use jobs::{
    JobFilter, JobRendition, JobStoreError, JobStoreResult, NewVideoJob, ReadyUpdate,
    SqliteVideoStore, SqliteVideoStoreBuilder, VideoJob, VideoStatus,
};
pub use live::{
    validate_stream_key, ExitInfo, FfmpegIngestLauncher, IngestLauncher, IngestProcess,
    IngestSpec, LiveError, LiveResult, QualityVariant, RecorderSpec, RecordingHandle,
    RecordingManager, RecordingStatus, RegistrySettings, StreamEndHook, StreamMetrics,
    StreamRegistry, StreamStatus, ViewerCounter,
};
pub use notify::{
    notifier_from_config, LogNotifier, Notification, NotificationKind, Notifier, WebhookNotifier,
};
pub use progress::{ProgressBoard, ProgressEvent, ProgressRecord};
pub use storage::{
    storage_from_config, LocalStorage, ObjectStorage, Storage, StorageError, StorageResult,
};
pub use worker::{
    PipelineError, PipelineResult, RetryPolicy, TickReport, TranscodeWorker, WorkerSettings,
};
