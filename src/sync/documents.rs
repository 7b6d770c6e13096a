// ABOUTME: Translation of source entities into search index documents
// ABOUTME: Field projection, primary key derivation and project name splitting

use serde::{Deserialize, Serialize};

use super::model::{Chain, Entity};

/// Primary key field declared on every index.
pub const PRIMARY_KEY: &str = "searchId";

/// How document primary keys are derived from entity identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// A single chain is synced; the row id is unique on its own.
    Id,
    /// Several chains share the index; ids are only unique per chain.
    ChainScoped,
}

impl KeyStrategy {
    pub fn for_chains(chains: &[Chain]) -> Self {
        if chains.len() > 1 {
            KeyStrategy::ChainScoped
        } else {
            KeyStrategy::Id
        }
    }

    /// Meilisearch keys allow `[a-zA-Z0-9_-]`, so the chain is joined with `_`.
    pub fn key(&self, entity: &Entity) -> String {
        match self {
            KeyStrategy::Id => entity.id.clone(),
            KeyStrategy::ChainScoped => format!("{}_{}", entity.chain.as_str(), entity.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DripListDocument {
    pub search_id: String,
    pub id: String,
    pub chain: Chain,
    pub name: Option<String>,
    pub description: Option<String>,
    pub owner_address: Option<String>,
    pub owner_account_id: Option<String>,
    /// Milliseconds since the Unix epoch, sortable
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDocument {
    pub search_id: String,
    pub id: String,
    pub chain: Chain,
    pub name: Option<String>,
    pub owner_name: Option<String>,
    pub repo_name: Option<String>,
    pub description: Option<String>,
    pub owner_address: Option<String>,
    pub owner_account_id: Option<String>,
    pub updated_at: i64,
}

pub fn drip_list_document(entity: &Entity, keys: KeyStrategy) -> DripListDocument {
    DripListDocument {
        search_id: keys.key(entity),
        id: entity.id.clone(),
        chain: entity.chain,
        name: entity.name.clone(),
        description: entity.description.clone(),
        owner_address: entity.owner_address.clone(),
        owner_account_id: entity.owner_account_id.clone(),
        updated_at: entity.updated_at.timestamp_millis(),
    }
}

pub fn project_document(entity: &Entity, keys: KeyStrategy) -> ProjectDocument {
    let (owner_name, repo_name) = match entity.name.as_deref() {
        Some(name) => split_repo_name(name),
        None => (None, None),
    };

    ProjectDocument {
        search_id: keys.key(entity),
        id: entity.id.clone(),
        chain: entity.chain,
        name: entity.name.clone(),
        owner_name,
        repo_name,
        description: entity.description.clone(),
        owner_address: entity.owner_address.clone(),
        owner_account_id: entity.owner_account_id.clone(),
        updated_at: entity.updated_at.timestamp_millis(),
    }
}

/// Split an `owner/repo` project name.
///
/// A name without a slash is treated as the repository name alone.
pub fn split_repo_name(name: &str) -> (Option<String>, Option<String>) {
    let name = name.trim();
    if name.is_empty() {
        return (None, None);
    }
    match name.split_once('/') {
        Some((owner, repo)) => (non_empty(owner), non_empty(repo)),
        None => (None, Some(name.to_string())),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}
