// ABOUTME: SyncState for watermark persistence - survives process restarts
// ABOUTME: Stores the last adopted watermark per configured chain set as JSON

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::model::{Chain, Watermark};
use crate::utils::sanitize_url;

const STATE_VERSION: u32 = 1;

/// Persisted detector progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// Version of the state format for future migrations
    pub version: u32,
    /// Source database URL (sanitized - no password)
    pub source_url: String,
    /// Chains the watermark covers, sorted
    pub chains: Vec<Chain>,
    /// Last adopted watermark
    pub watermark: Watermark,
    /// When this state was last written
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl SyncState {
    pub fn new(source_url: &str, chains: &[Chain], watermark: Watermark) -> Self {
        let mut chains = chains.to_vec();
        chains.sort();
        chains.dedup();
        Self {
            version: STATE_VERSION,
            source_url: sanitize_url(source_url),
            chains,
            watermark,
            updated_at: chrono::Utc::now(),
        }
    }

    /// True when this state was recorded for the same chain set.
    pub fn matches_chains(&self, chains: &[Chain]) -> bool {
        let mut wanted = chains.to_vec();
        wanted.sort();
        wanted.dedup();
        self.chains == wanted
    }

    /// Load state from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read sync state from {:?}", path))?;
        let state: SyncState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse sync state from {:?}", path))?;
        Ok(state)
    }

    /// Save state to a JSON file.
    ///
    /// Writes to a sibling temp file and renames it so a crash never leaves a
    /// truncated state file behind.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize sync state")?;
        let tmp = tmp_path(path);
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write sync state to {:?}", tmp))?;
        fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move sync state into {:?}", path))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Where the detector reads its starting watermark and records progress.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
    source_url: String,
    chains: Vec<Chain>,
}

impl WatermarkStore {
    pub fn new(path: PathBuf, source_url: &str, chains: &[Chain]) -> Self {
        Self {
            path,
            source_url: source_url.to_string(),
            chains: chains.to_vec(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored watermark, if a compatible state file exists.
    ///
    /// Unreadable or mismatched state is logged and ignored.
    pub async fn load(&self) -> Option<Watermark> {
        if !self.path.exists() {
            return None;
        }

        match SyncState::load(&self.path).await {
            Ok(state) if state.matches_chains(&self.chains) => {
                tracing::info!(
                    "Resuming from watermark {} stored in {:?}",
                    state.watermark,
                    self.path
                );
                Some(state.watermark)
            }
            Ok(state) => {
                tracing::warn!(
                    "Ignoring sync state in {:?}: recorded for chains {:?}, configured {:?}",
                    self.path,
                    state.chains,
                    self.chains
                );
                None
            }
            Err(e) => {
                tracing::warn!("Failed to load sync state from {:?}: {:?}", self.path, e);
                None
            }
        }
    }

    pub async fn save(&self, watermark: Watermark) -> Result<()> {
        SyncState::new(&self.source_url, &self.chains, watermark)
            .save(&self.path)
            .await
    }
}
