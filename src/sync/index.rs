// ABOUTME: SearchIndex contract used by the synchronizer
// ABOUTME: Index settings per entity kind, task handles and terminal task outcomes

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::documents::PRIMARY_KEY;
use super::model::EntityKind;

/// Search backend operations the synchronizer relies on.
///
/// Every write is asynchronous on the backend side: it returns a task handle
/// that must be waited on before the write counts as durable.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn create_index(&self, index_uid: &str, primary_key: &str) -> Result<TaskHandle>;

    async fn update_settings(&self, index_uid: &str, settings: &IndexSettings) -> Result<TaskHandle>;

    /// Add or replace documents keyed by the index's primary key.
    async fn upsert_documents(
        &self,
        index_uid: &str,
        documents: Vec<serde_json::Value>,
    ) -> Result<TaskHandle>;

    /// Wait until `task` reaches a terminal status or `timeout` elapses.
    ///
    /// Returns the terminal task; a timeout is an `IndexError::TaskTimeout`.
    async fn wait_for_task(&self, task: &TaskHandle, timeout: Duration) -> Result<TaskInfo>;

    /// Lightweight liveness check.
    async fn health(&self) -> Result<()>;
}

/// Handle returned for an enqueued backend write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub index_uid: String,
    pub task_uid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Enqueued,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Structured error detail attached to a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub code: String,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub index_uid: String,
    pub task_uid: u64,
    pub status: TaskStatus,
    pub error: Option<TaskError>,
}

/// Backend outcomes the synchronizer must tell apart from plain I/O errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("task {task_uid} on index '{index_uid}' failed: {message} ({code})")]
    TaskFailed {
        index_uid: String,
        task_uid: u64,
        code: String,
        message: String,
    },
    #[error("task {task_uid} on index '{index_uid}' was canceled")]
    TaskCanceled { index_uid: String, task_uid: u64 },
    #[error("timed out after {timeout:?} waiting for task {task_uid} on index '{index_uid}'")]
    TaskTimeout {
        index_uid: String,
        task_uid: u64,
        timeout: Duration,
    },
    #[error("search backend returned {status} for {operation}: {body}")]
    Http {
        operation: String,
        status: u16,
        body: String,
    },
}

impl TaskInfo {
    /// Turn a terminal task into `Ok(())` only when it succeeded.
    pub fn into_result(self) -> Result<(), IndexError> {
        match self.status {
            TaskStatus::Succeeded => Ok(()),
            TaskStatus::Canceled => Err(IndexError::TaskCanceled {
                index_uid: self.index_uid,
                task_uid: self.task_uid,
            }),
            _ => {
                let (code, message) = match self.error {
                    Some(e) => (e.code, e.message),
                    None => (
                        "unknown".to_string(),
                        format!("task ended with status {:?}", self.status),
                    ),
                };
                Err(IndexError::TaskFailed {
                    index_uid: self.index_uid,
                    task_uid: self.task_uid,
                    code,
                    message,
                })
            }
        }
    }
}

/// Searchable / filterable / displayed configuration for one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSettings {
    pub searchable_attributes: Vec<String>,
    pub filterable_attributes: Vec<String>,
    pub displayed_attributes: Vec<String>,
    pub sortable_attributes: Vec<String>,
    pub typo_tolerance: TypoTolerance,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypoTolerance {
    /// Attributes matched exactly: addresses and ids are not words.
    pub disable_on_attributes: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Index settings for each entity kind.
pub fn settings_for(kind: EntityKind) -> IndexSettings {
    match kind {
        EntityKind::DripList => IndexSettings {
            searchable_attributes: strings(&["name", "description", "ownerAddress", "id"]),
            filterable_attributes: strings(&["chain", "ownerAddress", "ownerAccountId"]),
            displayed_attributes: strings(&[
                PRIMARY_KEY,
                "id",
                "chain",
                "name",
                "description",
                "ownerAddress",
                "ownerAccountId",
                "updatedAt",
            ]),
            sortable_attributes: strings(&["updatedAt"]),
            typo_tolerance: TypoTolerance {
                disable_on_attributes: strings(&["ownerAddress", "id"]),
            },
        },
        EntityKind::Project => IndexSettings {
            searchable_attributes: strings(&[
                "name",
                "repoName",
                "ownerName",
                "description",
                "ownerAddress",
                "id",
            ]),
            filterable_attributes: strings(&["chain", "ownerName", "ownerAddress", "ownerAccountId"]),
            displayed_attributes: strings(&[
                PRIMARY_KEY,
                "id",
                "chain",
                "name",
                "ownerName",
                "repoName",
                "description",
                "ownerAddress",
                "ownerAccountId",
                "updatedAt",
            ]),
            sortable_attributes: strings(&["updatedAt"]),
            typo_tolerance: TypoTolerance {
                disable_on_attributes: strings(&["ownerAddress", "id"]),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: TaskStatus, error: Option<TaskError>) -> TaskInfo {
        TaskInfo {
            index_uid: "projects".to_string(),
            task_uid: 12,
            status,
            error,
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Enqueued.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_failed_task_carries_backend_detail() {
        let err = info(
            TaskStatus::Failed,
            Some(TaskError {
                message: "Document identifier `a b` is invalid".to_string(),
                code: "invalid_document_id".to_string(),
                error_type: Some("invalid_request".to_string()),
                link: None,
            }),
        )
        .into_result()
        .unwrap_err();

        match err {
            IndexError::TaskFailed { code, task_uid, .. } => {
                assert_eq!(code, "invalid_document_id");
                assert_eq!(task_uid, 12);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_succeeded_task_is_ok() {
        assert!(info(TaskStatus::Succeeded, None).into_result().is_ok());
        assert!(matches!(
            info(TaskStatus::Canceled, None).into_result(),
            Err(IndexError::TaskCanceled { .. })
        ));
    }

    #[test]
    fn test_settings_serialize_as_backend_expects() {
        let json = serde_json::to_value(settings_for(EntityKind::Project)).unwrap();
        assert!(json["searchableAttributes"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("repoName")));
        assert!(json.get("distinctAttribute").is_none());
        assert_eq!(
            json["typoTolerance"]["disableOnAttributes"],
            serde_json::json!(["ownerAddress", "id"])
        );
    }
}
