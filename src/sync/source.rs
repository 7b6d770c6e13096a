// ABOUTME: ChangeSource for timestamp-based change detection against PostgreSQL
// ABOUTME: Reads rows changed since a watermark inside a skip-locked transaction

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::time::{Duration, Instant};
use tokio_postgres::{Row, Transaction};

use super::model::{Chain, Entity, EntityKind, SourceBatch, Watermark};
use crate::postgres::SharedClient;
use crate::utils::{quote_ident, validate_postgres_identifier};

/// Something the detector can poll for changed rows.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Read every tracked row changed at or after `since`, one batch per
    /// (chain, kind).
    async fn read_changes(&self, since: Watermark) -> Result<Vec<SourceBatch>>;

    /// Read every unlocked row of one (chain, kind) whose `updated_at` is
    /// exactly `at`, with no batch limit.
    ///
    /// Used when a full batch never gets past the current watermark, so rows
    /// sharing that timestamp are delivered before the watermark steps over it.
    async fn read_boundary(
        &self,
        chain: Chain,
        kind: EntityKind,
        at: Watermark,
    ) -> Result<Vec<Entity>>;

    /// Run a trivial query and report how long it took.
    async fn ping(&self) -> Result<Duration>;
}

/// How the source selects rows each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    /// Rows with `updated_at >= watermark`, batch-limited, skipping locked rows.
    Incremental,
    /// Re-read the whole table every cycle.
    FullRefresh,
}

#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub mode: SourceMode,
    /// Maximum rows per (chain, kind) query
    pub batch_size: usize,
    /// Upper bound for the whole read transaction
    pub query_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            mode: SourceMode::Incremental,
            batch_size: 1_000,
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// Reads changed Drip Lists and Projects from one schema per chain.
///
/// All per-(chain, kind) queries of a cycle run on the same transaction and are
/// pipelined over the connection. Rows locked by in-flight writers are skipped
/// (`FOR UPDATE SKIP LOCKED`), so the reader never waits on a writer; those
/// rows show up in a later cycle once their writer commits.
pub struct PgChangeSource {
    client: SharedClient,
    chains: Vec<Chain>,
    options: SourceOptions,
}

impl PgChangeSource {
    /// Create a source for the given chains.
    ///
    /// Fails when no chain is given or when a schema name would not be a
    /// plain identifier.
    pub fn new(client: SharedClient, chains: Vec<Chain>, options: SourceOptions) -> Result<Self> {
        if chains.is_empty() {
            bail!("At least one chain must be configured");
        }
        if options.batch_size == 0 {
            bail!("Batch size must be greater than zero");
        }

        let mut unique = chains;
        unique.sort();
        unique.dedup();

        for chain in &unique {
            validate_postgres_identifier(chain.schema())
                .with_context(|| format!("Invalid schema for chain {}", chain))?;
        }

        Ok(Self {
            client,
            chains: unique,
            options,
        })
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    async fn read_locked(&self, since: Watermark) -> Result<Vec<SourceBatch>> {
        let mut client = self.client.lock().await?;
        let tx = client
            .transaction()
            .await
            .context("Failed to open read transaction")?;

        let result = self.read_in_transaction(&tx, since).await;
        finish(tx, result).await
    }

    async fn read_boundary_locked(
        &self,
        chain: Chain,
        kind: EntityKind,
        at: Watermark,
    ) -> Result<Vec<Entity>> {
        let mut client = self.client.lock().await?;
        let tx = client
            .transaction()
            .await
            .context("Failed to open read transaction")?;

        let result = self.read_boundary_in_transaction(&tx, chain, kind, at).await;
        finish(tx, result).await
    }

    // statement_timeout only accepts a literal
    async fn set_statement_timeout(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.batch_execute(&format!(
            "SET LOCAL statement_timeout = {}",
            self.options.query_timeout.as_millis()
        ))
        .await
        .context("Failed to set statement timeout")
    }

    async fn read_in_transaction(
        &self,
        tx: &Transaction<'_>,
        since: Watermark,
    ) -> Result<Vec<SourceBatch>> {
        self.set_statement_timeout(tx).await?;

        let mut reads = Vec::with_capacity(self.chains.len() * EntityKind::ALL.len());
        for chain in &self.chains {
            for kind in EntityKind::ALL {
                reads.push(self.read_batch(tx, *chain, kind, since));
            }
        }

        try_join_all(reads).await
    }

    async fn read_batch(
        &self,
        tx: &Transaction<'_>,
        chain: Chain,
        kind: EntityKind,
        since: Watermark,
    ) -> Result<SourceBatch> {
        let query = build_change_query(chain, kind, self.options.mode);

        let rows = match self.options.mode {
            SourceMode::Incremental => {
                let limit = self.options.batch_size as i64;
                tx.query(&query, &[&since, &limit]).await
            }
            SourceMode::FullRefresh => tx.query(&query, &[]).await,
        }
        .with_context(|| format!("Failed to read {} changes from {}", kind, chain))?;

        let truncated =
            self.options.mode == SourceMode::Incremental && rows.len() >= self.options.batch_size;

        let rows = rows
            .iter()
            .map(|row| row_to_entity(row, chain))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to decode {} rows from {}", kind, chain))?;

        Ok(SourceBatch {
            kind,
            chain,
            rows,
            truncated,
        })
    }

    async fn read_boundary_in_transaction(
        &self,
        tx: &Transaction<'_>,
        chain: Chain,
        kind: EntityKind,
        at: Watermark,
    ) -> Result<Vec<Entity>> {
        self.set_statement_timeout(tx).await?;

        let rows = tx
            .query(&build_boundary_query(chain, kind), &[&at])
            .await
            .with_context(|| format!("Failed to read {} rows at {} from {}", kind, at, chain))?;

        rows.iter()
            .map(|row| row_to_entity(row, chain))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to decode {} rows from {}", kind, chain))
    }
}

/// Commit the read transaction on success, roll it back otherwise.
async fn finish<T>(tx: Transaction<'_>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .context("Failed to commit read transaction")?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!("Failed to roll back read transaction: {}", rollback_err);
            }
            Err(e)
        }
    }
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn read_changes(&self, since: Watermark) -> Result<Vec<SourceBatch>> {
        tokio::time::timeout(self.options.query_timeout, self.read_locked(since))
            .await
            .with_context(|| {
                format!(
                    "Reading changes timed out after {:?}",
                    self.options.query_timeout
                )
            })?
    }

    async fn read_boundary(
        &self,
        chain: Chain,
        kind: EntityKind,
        at: Watermark,
    ) -> Result<Vec<Entity>> {
        tokio::time::timeout(
            self.options.query_timeout,
            self.read_boundary_locked(chain, kind, at),
        )
        .await
        .with_context(|| {
            format!(
                "Reading {} rows at {} timed out after {:?}",
                kind, at, self.options.query_timeout
            )
        })?
    }

    async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let client = self.client.lock().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .context("Database liveness query failed")?;
        Ok(start.elapsed())
    }
}

/// Build the per-(chain, kind) change query.
///
/// The schema comes from the `Chain` allow-list and is quoted; the watermark
/// and limit are bind parameters.
pub fn build_change_query(chain: Chain, kind: EntityKind, mode: SourceMode) -> String {
    let select = select_from(chain, kind);

    match mode {
        SourceMode::Incremental => format!(
            "{} WHERE updated_at >= $1 ORDER BY updated_at ASC LIMIT $2 FOR UPDATE SKIP LOCKED",
            select
        ),
        SourceMode::FullRefresh => format!("{} ORDER BY updated_at ASC", select),
    }
}

/// Build the unlimited query for rows sitting exactly on one timestamp.
pub fn build_boundary_query(chain: Chain, kind: EntityKind) -> String {
    format!(
        "{} WHERE updated_at = $1 ORDER BY id FOR UPDATE SKIP LOCKED",
        select_from(chain, kind)
    )
}

fn select_from(chain: Chain, kind: EntityKind) -> String {
    format!(
        "SELECT id::text AS id, name, description, owner_address, \
         owner_account_id::text AS owner_account_id, updated_at \
         FROM {}.{}",
        quote_ident(chain.schema()),
        quote_ident(kind.table())
    )
}

fn row_to_entity(row: &Row, chain: Chain) -> Result<Entity> {
    Ok(Entity {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        owner_address: row.try_get("owner_address")?,
        owner_account_id: row.try_get("owner_account_id")?,
        updated_at: row.try_get("updated_at")?,
        chain,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_query_uses_skip_locked() {
        let query = build_change_query(Chain::Mainnet, EntityKind::DripList, SourceMode::Incremental);
        assert!(query.contains(r#"FROM "mainnet"."drip_lists""#));
        assert!(query.contains("updated_at >= $1"));
        assert!(query.contains("ORDER BY updated_at ASC LIMIT $2"));
        assert!(query.ends_with("FOR UPDATE SKIP LOCKED"));
    }

    #[test]
    fn test_full_refresh_query_has_no_filter() {
        let query = build_change_query(
            Chain::OptimismSepolia,
            EntityKind::Project,
            SourceMode::FullRefresh,
        );
        assert!(query.contains(r#"FROM "optimism_sepolia"."projects""#));
        assert!(!query.contains("WHERE"));
        assert!(!query.contains("LIMIT"));
        assert!(!query.contains("FOR UPDATE"));
    }

    #[test]
    fn test_boundary_query_has_no_limit() {
        let query = build_boundary_query(Chain::Filecoin, EntityKind::Project);
        assert!(query.contains(r#"FROM "filecoin"."projects""#));
        assert!(query.contains("WHERE updated_at = $1"));
        assert!(!query.contains("LIMIT"));
        assert!(query.ends_with("FOR UPDATE SKIP LOCKED"));
    }

    #[test]
    fn test_source_options_default() {
        let options = SourceOptions::default();
        assert_eq!(options.mode, SourceMode::Incremental);
        assert_eq!(options.batch_size, 1_000);
        assert_eq!(options.query_timeout, Duration::from_secs(30));
    }
}
