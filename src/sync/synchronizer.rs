// ABOUTME: Synchronizer - applies detected change sets to the search indexes
// ABOUTME: Apply-then-confirm writes, sync metrics, and detector lifecycle supervision

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use super::detector::{ChangeDetector, ChangeHandler, CycleOutcome};
use super::documents::{drip_list_document, project_document, KeyStrategy, PRIMARY_KEY};
use super::index::{settings_for, IndexError, SearchIndex, TaskHandle};
use super::model::{ChangeSet, Entity, EntityKind, Watermark};

/// Lifecycle of a synchronizer.
///
/// `Failed` is transient: teardown runs and the synchronizer settles in
/// `Stopped`. Nothing restarts it automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Process-lifetime sync counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    /// Watermark of the last successfully applied change set
    pub last_sync_time: Option<Watermark>,
    /// Wall-clock time of the last successful apply
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Records applied since the process started
    pub total_processed_records: u64,
}

/// Applies change sets to a search backend and supervises its detector.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Configure the indexes and start the detector. No-op when running.
    async fn start(&self) -> Result<()>;

    /// Stop the detector and wait for its loop to exit. No-op when stopped.
    async fn stop(&self);

    /// Snapshot of the current metrics.
    fn metrics(&self) -> SyncMetrics;

    fn phase(&self) -> SyncPhase;

    /// Error that last took the synchronizer down, if any.
    fn last_error(&self) -> Option<String>;

    /// Liveness of the search backend. Never fails; errors read as unhealthy.
    async fn is_healthy(&self) -> bool;
}

/// Configuration for the IndexSynchronizer.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Upper bound for each backend task to reach a terminal status
    pub task_timeout: Duration,
    pub key_strategy: KeyStrategy,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(120),
            key_strategy: KeyStrategy::Id,
        }
    }
}

struct SyncInner {
    detector: Arc<dyn ChangeDetector>,
    index: Arc<dyn SearchIndex>,
    config: SynchronizerConfig,
    running: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    metrics: Mutex<SyncMetrics>,
    last_error: Mutex<Option<String>>,
}

/// Synchronizer that upserts Drip Lists and Projects into one index each.
///
/// A change set counts as applied only once every backend task it produced has
/// succeeded. Any failure on that path is treated as the index being in an
/// unknown state: the synchronizer stops itself and its detector, and the
/// watermark stays put so a restart re-delivers the same rows.
pub struct IndexSynchronizer {
    inner: Arc<SyncInner>,
}

impl IndexSynchronizer {
    pub fn new(
        detector: Arc<dyn ChangeDetector>,
        index: Arc<dyn SearchIndex>,
        config: SynchronizerConfig,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Stopped);
        Self {
            inner: Arc::new(SyncInner {
                detector,
                index,
                config,
                running: AtomicBool::new(false),
                phase,
                metrics: Mutex::new(SyncMetrics::default()),
                last_error: Mutex::new(None),
            }),
        }
    }

    fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    /// Resolve once the synchronizer has stopped, returning the error that
    /// stopped it, if it failed.
    pub async fn wait_stopped(&self) -> Option<String> {
        let mut phases = self.subscribe();
        let _ = phases.wait_for(|phase| *phase == SyncPhase::Stopped).await;
        self.last_error()
    }

    /// Configure the indexes and run a single detection cycle.
    pub async fn sync_once(&self) -> Result<CycleOutcome> {
        self.inner.initialize_indexes().await?;
        let handler = SyncHandler {
            inner: Arc::clone(&self.inner),
        };
        self.inner.detector.poll_once(&handler).await
    }

    pub fn watermark(&self) -> Watermark {
        self.inner.detector.watermark()
    }

    async fn launch(&self) -> Result<()> {
        self.inner.initialize_indexes().await?;

        let handler: Arc<dyn ChangeHandler> = Arc::new(SyncHandler {
            inner: Arc::clone(&self.inner),
        });
        self.inner
            .detector
            .start(handler)
            .await
            .context("Failed to start change detector")
    }
}

#[async_trait]
impl Synchronizer for IndexSynchronizer {
    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Synchronizer is already running");
            return Ok(());
        }

        inner.set_phase(SyncPhase::Starting);
        *inner.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;

        match self.launch().await {
            Ok(()) => {
                // The first cycle may already have halted us
                let promoted = inner.phase.send_if_modified(|phase| {
                    if *phase == SyncPhase::Starting {
                        *phase = SyncPhase::Running;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    tracing::info!("Synchronizer started");
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!("Synchronizer failed to start: {:?}", e);
                inner.halt(&e).await;
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        let inner = &self.inner;
        if inner.running.swap(false, Ordering::SeqCst) {
            inner.set_phase(SyncPhase::Stopping);
            if let Err(e) = inner.detector.stop().await {
                tracing::warn!("Failed to stop change detector: {:?}", e);
            }
        } else {
            tracing::debug!("Synchronizer is not running");
        }

        // Also covers a detector halted by a failed apply whose cycle is still unwinding
        inner.detector.wait().await;
        inner.set_phase(SyncPhase::Stopped);

        let metrics = self.metrics();
        tracing::info!(
            "Synchronizer stopped: {} records processed, last sync time {:?}, last successful sync {:?}",
            metrics.total_processed_records,
            metrics.last_sync_time,
            metrics.last_successful_sync
        );
    }

    fn metrics(&self) -> SyncMetrics {
        self.inner
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn is_healthy(&self) -> bool {
        match self.inner.index.health().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Search backend health check failed: {:?}", e);
                false
            }
        }
    }
}

impl SyncInner {
    fn set_phase(&self, phase: SyncPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!("Synchronizer phase {:?} -> {:?}", previous, phase);
        }
    }

    /// Tear down after a fatal error: record it, stop the detector, settle in `Stopped`.
    async fn halt(&self, error: &anyhow::Error) {
        self.running.store(false, Ordering::SeqCst);
        self.set_phase(SyncPhase::Failed);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(format!("{:#}", error));

        if let Err(stop_err) = self.detector.stop().await {
            tracing::warn!("Failed to stop change detector during teardown: {:?}", stop_err);
        }
        self.set_phase(SyncPhase::Stopped);
    }

    /// Create each index with its primary key and apply its settings.
    async fn initialize_indexes(&self) -> Result<()> {
        try_join_all(EntityKind::ALL.into_iter().map(|kind| self.initialize_index(kind))).await?;
        tracing::info!("Search indexes configured");
        Ok(())
    }

    async fn initialize_index(&self, kind: EntityKind) -> Result<()> {
        let uid = kind.index_uid();
        let timeout = self.config.task_timeout;

        let created = self
            .index
            .create_index(uid, PRIMARY_KEY)
            .await
            .with_context(|| format!("Failed to create index '{}'", uid))?;
        match self.index.wait_for_task(&created, timeout).await?.into_result() {
            Ok(()) => tracing::info!("Created index '{}'", uid),
            Err(IndexError::TaskFailed { code, .. }) if code == "index_already_exists" => {
                tracing::debug!("Index '{}' already exists", uid);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create index '{}'", uid));
            }
        }

        let settings = self
            .index
            .update_settings(uid, &settings_for(kind))
            .await
            .with_context(|| format!("Failed to configure index '{}'", uid))?;
        self.index
            .wait_for_task(&settings, timeout)
            .await?
            .into_result()
            .with_context(|| format!("Failed to configure index '{}'", uid))?;

        Ok(())
    }

    async fn apply(&self, changes: &ChangeSet) -> Result<()> {
        let mut submissions = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let entities = changes.entities(kind);
            if entities.is_empty() {
                continue;
            }
            let documents = to_documents(kind, entities, self.config.key_strategy)?;
            submissions.push(self.submit(kind, documents));
        }

        let tasks = try_join_all(submissions).await?;
        try_join_all(tasks.iter().map(|task| self.confirm(task))).await?;
        Ok(())
    }

    async fn submit(&self, kind: EntityKind, documents: Vec<serde_json::Value>) -> Result<TaskHandle> {
        let count = documents.len();
        let task = self
            .index
            .upsert_documents(kind.index_uid(), documents)
            .await
            .with_context(|| format!("Failed to submit {} {} documents", count, kind))?;
        tracing::debug!(
            index = kind.index_uid(),
            task_uid = task.task_uid,
            "Submitted {} documents",
            count
        );
        Ok(task)
    }

    async fn confirm(&self, task: &TaskHandle) -> Result<()> {
        self.index
            .wait_for_task(task, self.config.task_timeout)
            .await?
            .into_result()?;
        Ok(())
    }

    fn record_success(&self, changes: &ChangeSet) -> SyncMetrics {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.last_sync_time = Some(changes.timestamp);
        metrics.last_successful_sync = Some(Utc::now());
        metrics.total_processed_records += changes.len() as u64;
        metrics.clone()
    }
}

fn to_documents(
    kind: EntityKind,
    entities: &[Entity],
    keys: KeyStrategy,
) -> Result<Vec<serde_json::Value>> {
    entities
        .iter()
        .map(|entity| {
            let document = match kind {
                EntityKind::DripList => serde_json::to_value(drip_list_document(entity, keys)),
                EntityKind::Project => serde_json::to_value(project_document(entity, keys)),
            };
            document.with_context(|| format!("Failed to translate {} {}", kind, entity.id))
        })
        .collect()
}

/// Handler registered with the detector on the synchronizer's behalf.
struct SyncHandler {
    inner: Arc<SyncInner>,
}

#[async_trait]
impl ChangeHandler for SyncHandler {
    async fn on_changes(&self, changes: ChangeSet) -> Result<()> {
        match self.inner.apply(&changes).await {
            Ok(()) => {
                let metrics = self.inner.record_success(&changes);
                tracing::info!(
                    "Applied {} drip lists and {} projects up to {} ({} records total)",
                    changes.drip_lists.len(),
                    changes.projects.len(),
                    changes.timestamp,
                    metrics.total_processed_records
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Failed to apply change set up to {}, halting synchronization: {:?}",
                    changes.timestamp,
                    e
                );
                self.inner.halt(&e).await;
                Err(e)
            }
        }
    }
}
