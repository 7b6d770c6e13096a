// ABOUTME: ChangeDetector - polls the source on a fixed cadence and reports change sets
// ABOUTME: Advances its watermark only after the registered handler accepts a change set

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::model::{initial_watermark, next_watermark, ChangeSet, EntityKind, SourceBatch, Watermark};
use super::source::ChangeSource;
use super::state::WatermarkStore;

/// Consumer of detected change sets.
///
/// Returning `Ok` tells the detector the change set is durable and the
/// watermark may move past it. Returning an error leaves the watermark where it
/// was, so the same rows are delivered again.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_changes(&self, changes: ChangeSet) -> Result<()>;
}

/// Adapts an async closure into a [`ChangeHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ChangeHandler for FnHandler<F>
where
    F: Fn(ChangeSet) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn on_changes(&self, changes: ChangeSet) -> Result<()> {
        (self.0)(changes).await
    }
}

/// Produces change sets for a single registered handler.
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    /// Start polling. Calling this while already running is a no-op.
    async fn start(&self, handler: Arc<dyn ChangeHandler>) -> Result<()>;

    /// Stop scheduling cycles. An in-flight cycle is left to finish; use
    /// [`ChangeDetector::wait`] to await it. Safe to call from inside a handler.
    async fn stop(&self) -> Result<()>;

    /// Wait for the polling loop to exit after [`ChangeDetector::stop`].
    /// Must not be called from inside a handler.
    async fn wait(&self);

    /// Run exactly one detection cycle outside the timer loop.
    async fn poll_once(&self, handler: &dyn ChangeHandler) -> Result<CycleOutcome>;

    fn is_running(&self) -> bool;

    fn watermark(&self) -> Watermark;
}

/// Configuration for the PollingDetector.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Interval between detection cycles
    pub poll_interval: Duration,
    /// Watermark used when no stored state is available
    pub initial_watermark: Watermark,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            initial_watermark: initial_watermark(),
        }
    }
}

/// Result of one detection cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NoChanges,
    Applied { records: usize, watermark: Watermark },
}

struct DetectorShared {
    running: AtomicBool,
    /// Bumped on every start so a loop left over from a previous run exits.
    generation: AtomicU64,
    watermark: Mutex<Watermark>,
    /// Held for the duration of a cycle: at most one change set in flight.
    cycle_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl DetectorShared {
    fn watermark(&self) -> Watermark {
        *self.watermark.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adopt `next` unless it would move the watermark backwards.
    fn advance(&self, next: Watermark) -> Watermark {
        let mut current = self.watermark.lock().unwrap_or_else(|e| e.into_inner());
        if next > *current {
            *current = next;
        }
        *current
    }
}

/// Timer-driven detector over a [`ChangeSource`].
///
/// Cycles run inline in a single spawned task. Ticks that elapse while a slow
/// cycle is still running are skipped rather than queued.
pub struct PollingDetector {
    source: Arc<dyn ChangeSource>,
    config: DetectorConfig,
    store: Option<WatermarkStore>,
    resumed: AtomicBool,
    shared: Arc<DetectorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingDetector {
    pub fn new(source: Arc<dyn ChangeSource>, config: DetectorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(DetectorShared {
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            watermark: Mutex::new(config.initial_watermark),
            cycle_lock: tokio::sync::Mutex::new(()),
            shutdown,
        });

        Self {
            source,
            config,
            store: None,
            resumed: AtomicBool::new(false),
            shared,
            task: Mutex::new(None),
        }
    }

    /// Persist every adopted watermark and resume from the stored one.
    pub fn with_store(mut self, store: WatermarkStore) -> Self {
        self.store = Some(store);
        self
    }

    async fn resume_from_store(&self) {
        if self.resumed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(store) = &self.store {
            if let Some(stored) = store.load().await {
                self.shared.advance(stored);
            }
        }
    }
}

#[async_trait]
impl ChangeDetector for PollingDetector {
    async fn start(&self, handler: Arc<dyn ChangeHandler>) -> Result<()> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("Change detector is already running");
            return Ok(());
        }

        self.resume_from_store().await;

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();

        tracing::info!(
            "Starting change detector with poll_interval={:?}, watermark={}",
            self.config.poll_interval,
            self.shared.watermark()
        );

        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.source),
            handler,
            self.store.clone(),
            self.config.poll_interval,
            generation,
            shutdown,
        ));

        let previous = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        // A loop from an earlier run exits on its own once it sees the new generation.
        drop(previous);

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            tracing::debug!("Change detector is not running");
            return Ok(());
        }
        self.shared.shutdown.send_replace(true);
        tracing::info!("Change detector stopped at watermark {}", self.shared.watermark());
        Ok(())
    }

    async fn wait(&self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Change detector loop ended abnormally: {}", e);
            }
        }
    }

    async fn poll_once(&self, handler: &dyn ChangeHandler) -> Result<CycleOutcome> {
        self.resume_from_store().await;
        run_cycle(&self.shared, self.source.as_ref(), handler, self.store.as_ref()).await
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn watermark(&self) -> Watermark {
        self.shared.watermark()
    }
}

async fn poll_loop(
    shared: Arc<DetectorShared>,
    source: Arc<dyn ChangeSource>,
    handler: Arc<dyn ChangeHandler>,
    store: Option<WatermarkStore>,
    poll_interval: Duration,
    generation: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = 0u64;

    loop {
        tokio::select! {
            biased; // Check shutdown first

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        if !shared.running.load(Ordering::SeqCst)
            || shared.generation.load(Ordering::SeqCst) != generation
        {
            break;
        }

        cycles += 1;
        let watermark = shared.watermark();
        match run_cycle(&shared, source.as_ref(), handler.as_ref(), store.as_ref()).await {
            Ok(CycleOutcome::NoChanges) => {}
            Ok(CycleOutcome::Applied { records, watermark }) => {
                tracing::info!(
                    "Detection cycle {} applied {} records, watermark now {}",
                    cycles,
                    records,
                    watermark
                );
            }
            Err(e) => {
                // Log with :? to show full error chain including root cause
                tracing::error!(
                    cycle = cycles,
                    error = %e,
                    "Detection cycle failed, watermark stays at {}: {:?}",
                    watermark,
                    e
                );
            }
        }
    }

    tracing::debug!("Change detector loop exited after {} cycles", cycles);
}

async fn run_cycle(
    shared: &DetectorShared,
    source: &dyn ChangeSource,
    handler: &dyn ChangeHandler,
    store: Option<&WatermarkStore>,
) -> Result<CycleOutcome> {
    let _cycle = shared.cycle_lock.lock().await;
    let current = shared.watermark();

    let mut batches = source
        .read_changes(current)
        .await
        .context("Failed to read changes from source")?;

    for batch in batches.iter_mut().filter(|b| b.is_stuck_at(current)) {
        let rows = source
            .read_boundary(batch.chain, batch.kind, current)
            .await
            .with_context(|| {
                format!(
                    "Failed to read {} rows at {} from {}",
                    batch.kind, current, batch.chain
                )
            })?;
        tracing::info!(
            "Batch limit reached with every {} row from {} at {}; read all {} rows at that timestamp",
            batch.kind,
            batch.chain,
            current,
            rows.len()
        );
        batch.rows = rows;
        batch.truncated = false;
    }

    let Some(next) = next_watermark(current, &batches) else {
        tracing::debug!("No changes since {}", current);
        return Ok(CycleOutcome::NoChanges);
    };

    let changes = build_change_set(batches, next);
    let records = changes.len();
    tracing::info!(
        "Found {} changed drip lists and {} changed projects (watermark {} -> {})",
        changes.drip_lists.len(),
        changes.projects.len(),
        current,
        next
    );

    handler
        .on_changes(changes)
        .await
        .context("Change handler rejected change set")?;

    let adopted = shared.advance(next);

    if let Some(store) = store {
        if let Err(e) = store.save(adopted).await {
            tracing::warn!(
                "Failed to persist watermark {} to {:?}: {:?}",
                adopted,
                store.path(),
                e
            );
        }
    }

    Ok(CycleOutcome::Applied {
        records,
        watermark: adopted,
    })
}

fn build_change_set(batches: Vec<SourceBatch>, timestamp: Watermark) -> ChangeSet {
    let mut drip_lists = Vec::new();
    let mut projects = Vec::new();

    for batch in batches {
        match batch.kind {
            EntityKind::DripList => drip_lists.extend(batch.rows),
            EntityKind::Project => projects.extend(batch.rows),
        }
    }

    drip_lists.sort_by(|a, b| (a.updated_at, a.chain, &a.id).cmp(&(b.updated_at, b.chain, &b.id)));
    projects.sort_by(|a, b| (a.updated_at, a.chain, &a.id).cmp(&(b.updated_at, b.chain, &b.id)));

    ChangeSet {
        drip_lists,
        projects,
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::{Chain, Entity};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    struct StaticSource {
        rows: Vec<Entity>,
        limit: usize,
    }

    impl StaticSource {
        fn new(rows: Vec<Entity>) -> Self {
            Self { rows, limit: usize::MAX }
        }
    }

    #[async_trait]
    impl ChangeSource for StaticSource {
        async fn read_changes(&self, since: Watermark) -> Result<Vec<SourceBatch>> {
            let rows: Vec<Entity> = self
                .rows
                .iter()
                .filter(|r| r.updated_at >= since)
                .take(self.limit)
                .cloned()
                .collect();
            Ok(vec![SourceBatch {
                kind: EntityKind::Project,
                chain: Chain::Mainnet,
                truncated: rows.len() >= self.limit,
                rows,
            }])
        }

        async fn read_boundary(
            &self,
            _chain: Chain,
            _kind: EntityKind,
            at: Watermark,
        ) -> Result<Vec<Entity>> {
            Ok(self
                .rows
                .iter()
                .filter(|r| r.updated_at == at)
                .cloned()
                .collect())
        }

        async fn ping(&self) -> Result<Duration> {
            Ok(Duration::ZERO)
        }
    }

    fn project(id: &str, secs: i64) -> Entity {
        Entity {
            id: id.to_string(),
            name: Some(format!("owner/{id}")),
            description: None,
            owner_address: None,
            owner_account_id: None,
            updated_at: Utc.timestamp_opt(secs, 0).unwrap(),
            chain: Chain::Mainnet,
        }
    }

    #[test]
    fn test_detector_config_default() {
        let config = DetectorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.initial_watermark, initial_watermark());
    }

    #[tokio::test]
    async fn test_poll_once_advances_only_on_success() {
        let source = Arc::new(StaticSource::new(vec![project("1", 100)]));
        let detector = PollingDetector::new(source, DetectorConfig::default());

        let failing = FnHandler(|_changes: ChangeSet| async {
            Err::<(), _>(anyhow::anyhow!("index down"))
        });
        assert!(detector.poll_once(&failing).await.is_err());
        assert_eq!(detector.watermark(), initial_watermark());

        let calls = AtomicUsize::new(0);
        let accepting = FnHandler(|changes: ChangeSet| {
            calls.fetch_add(changes.len(), Ordering::SeqCst);
            async { Ok::<(), anyhow::Error>(()) }
        });
        let outcome = detector.poll_once(&accepting).await.unwrap();
        let expected = Utc.timestamp_opt(100, 1_000).unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Applied {
                records: 1,
                watermark: expected
            }
        );
        assert_eq!(detector.watermark(), expected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Nothing new since the watermark
        assert_eq!(
            detector.poll_once(&accepting).await.unwrap(),
            CycleOutcome::NoChanges
        );
    }

    #[tokio::test]
    async fn test_full_batch_on_watermark_reads_every_row_at_that_timestamp() {
        let source = Arc::new(StaticSource {
            rows: vec![project("1", 50), project("2", 50), project("3", 50)],
            limit: 2,
        });
        let detector = PollingDetector::new(
            source,
            DetectorConfig {
                initial_watermark: Utc.timestamp_opt(50, 0).unwrap(),
                ..Default::default()
            },
        );

        let seen = Mutex::new(Vec::new());
        let collect = FnHandler(|changes: ChangeSet| {
            seen.lock()
                .unwrap()
                .extend(changes.projects.into_iter().map(|p| p.id));
            async { Ok::<(), anyhow::Error>(()) }
        });

        let outcome = detector.poll_once(&collect).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Applied {
                records: 3,
                watermark: Utc.timestamp_opt(50, 1_000).unwrap()
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_build_change_set_splits_and_orders() {
        let mut late = project("b", 20);
        late.chain = Chain::Sepolia;
        let batches = vec![
            SourceBatch {
                kind: EntityKind::Project,
                chain: Chain::Sepolia,
                rows: vec![late],
                truncated: false,
            },
            SourceBatch {
                kind: EntityKind::Project,
                chain: Chain::Mainnet,
                rows: vec![project("a", 10)],
                truncated: false,
            },
            SourceBatch {
                kind: EntityKind::DripList,
                chain: Chain::Mainnet,
                rows: vec![],
                truncated: false,
            },
        ];
        let set = build_change_set(batches, Utc.timestamp_opt(21, 0).unwrap());
        assert!(set.drip_lists.is_empty());
        assert_eq!(
            set.projects.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }
}
