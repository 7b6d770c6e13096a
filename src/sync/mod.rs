// ABOUTME: Watermark-based change detection and search index synchronization
// ABOUTME: Polls per-chain tables for updated rows and upserts them into the search backend

pub mod detector;
pub mod documents;
pub mod index;
pub mod model;
pub mod source;
pub mod state;
pub mod synchronizer;

pub use detector::{
    ChangeDetector, ChangeHandler, CycleOutcome, DetectorConfig, FnHandler, PollingDetector,
};
pub use documents::{KeyStrategy, PRIMARY_KEY};
pub use index::{IndexError, IndexSettings, SearchIndex, TaskHandle, TaskInfo, TaskStatus};
pub use model::{next_watermark, ChangeSet, Chain, Entity, EntityKind, SourceBatch, Watermark};
pub use source::{ChangeSource, PgChangeSource, SourceMode, SourceOptions};
pub use state::{SyncState, WatermarkStore};
pub use synchronizer::{
    IndexSynchronizer, SyncMetrics, SyncPhase, Synchronizer, SynchronizerConfig,
};
