// ABOUTME: Core data model for change detection - entities, chains, change sets
// ABOUTME: Holds the watermark algebra shared by the detector and its tests

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp boundary below which all source changes have been observed.
pub type Watermark = DateTime<Utc>;

/// Smallest step between two distinct `timestamptz` values in PostgreSQL.
pub fn watermark_epsilon() -> Duration {
    Duration::microseconds(1)
}

/// The initial watermark: nothing has been observed yet.
pub fn initial_watermark() -> Watermark {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Logical partition a row came from. Each chain lives in its own schema with
/// an identical table layout.
///
/// The variant list is the allow-list for schema names: only these values are
/// ever interpolated into query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Mainnet,
    Sepolia,
    OptimismSepolia,
    PolygonAmoy,
    BaseSepolia,
    Filecoin,
    Metis,
    Optimism,
    Localtestnet,
}

impl Chain {
    pub const ALL: [Chain; 9] = [
        Chain::Mainnet,
        Chain::Sepolia,
        Chain::OptimismSepolia,
        Chain::PolygonAmoy,
        Chain::BaseSepolia,
        Chain::Filecoin,
        Chain::Metis,
        Chain::Optimism,
        Chain::Localtestnet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Mainnet => "mainnet",
            Chain::Sepolia => "sepolia",
            Chain::OptimismSepolia => "optimism_sepolia",
            Chain::PolygonAmoy => "polygon_amoy",
            Chain::BaseSepolia => "base_sepolia",
            Chain::Filecoin => "filecoin",
            Chain::Metis => "metis",
            Chain::Optimism => "optimism",
            Chain::Localtestnet => "localtestnet",
        }
    }

    /// Schema holding this chain's tables.
    pub fn schema(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match Chain::ALL.iter().find(|c| c.as_str() == normalized) {
            Some(chain) => Ok(*chain),
            None => bail!(
                "Unsupported chain '{}'. Allowed values: {}",
                value.trim(),
                Chain::ALL
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

/// The two tracked entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// List-like entity: a curated list of funding recipients.
    DripList,
    /// Record-like entity: a claimed source-code repository.
    Project,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::DripList, EntityKind::Project];

    /// Source table name for this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::DripList => "drip_lists",
            EntityKind::Project => "projects",
        }
    }

    /// Search index uid for this kind.
    pub fn index_uid(&self) -> &'static str {
        match self {
            EntityKind::DripList => "drip_lists",
            EntityKind::Project => "projects",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::DripList => f.write_str("drip list"),
            EntityKind::Project => f.write_str("project"),
        }
    }
}

/// A changed row read from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub owner_address: Option<String>,
    pub owner_account_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub chain: Chain,
}

/// One detection cycle's output.
///
/// `timestamp` is the watermark the detector adopts once the change set has
/// been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub drip_lists: Vec<Entity>,
    pub projects: Vec<Entity>,
    pub timestamp: Watermark,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.drip_lists.len() + self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drip_lists.is_empty() && self.projects.is_empty()
    }

    pub fn entities(&self, kind: EntityKind) -> &[Entity] {
        match kind {
            EntityKind::DripList => &self.drip_lists,
            EntityKind::Project => &self.projects,
        }
    }
}

/// Rows returned by one (chain, kind) query.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub kind: EntityKind,
    pub chain: Chain,
    pub rows: Vec<Entity>,
    /// True when the query hit its row limit, so rows after the last returned
    /// timestamp may still be pending.
    pub truncated: bool,
}

impl SourceBatch {
    /// A full batch whose rows all sit on `current` cannot move the watermark.
    /// Its remaining rows at that timestamp have to be read without a limit.
    pub fn is_stuck_at(&self, current: Watermark) -> bool {
        self.truncated
            && !self.rows.is_empty()
            && self.rows.iter().all(|row| row.updated_at <= current)
    }
}

/// Compute the watermark to adopt after applying `batches`.
///
/// Returns `None` when nothing was read. The result is `max(updated_at) + ε`,
/// capped at the last timestamp of any truncated batch so rows past a batch
/// limit are not skipped. The result is always strictly greater than
/// `current` when rows were read.
pub fn next_watermark(current: Watermark, batches: &[SourceBatch]) -> Option<Watermark> {
    let max_seen = batches
        .iter()
        .flat_map(|b| b.rows.iter())
        .map(|row| row.updated_at)
        .max()?;

    let mut next = max_seen + watermark_epsilon();

    let truncation_cap = batches
        .iter()
        .filter(|b| b.truncated)
        .filter_map(|b| b.rows.iter().map(|row| row.updated_at).max())
        .min();

    if let Some(cap) = truncation_cap {
        if cap > current {
            next = next.min(cap);
        } else {
            // The detector expands stuck batches before getting here, so this
            // only triggers for a source that reports one anyway.
            tracing::warn!(
                "Batch limit reached with every row at watermark {}; rows at that timestamp past the limit are skipped",
                current
            );
            next = next.min(cap + watermark_epsilon());
        }
    }

    Some(next.max(current))
}
