// ABOUTME: Data structures for Meilisearch REST requests and responses
// ABOUTME: These are serialized to JSON for API communication

use serde::{Deserialize, Serialize};

use crate::sync::index::{TaskError, TaskStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIndexRequest<'a> {
    pub uid: &'a str,
    pub primary_key: &'a str,
}

/// Summary returned by every asynchronous write.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedTask {
    pub task_uid: u64,
    pub index_uid: Option<String>,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub task_type: String,
}

/// Full task record from `GET /tasks/{uid}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub uid: u64,
    pub index_uid: Option<String>,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub task_type: String,
    pub error: Option<TaskError>,
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: String, // "available"
}
