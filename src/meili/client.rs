// ABOUTME: HTTP client for the Meilisearch REST API
// ABOUTME: Index setup, document upserts, task status polling and health check

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use tokio::time::Instant;

use super::models::{CreateIndexRequest, EnqueuedTask, HealthResponse, TaskRecord};
use crate::sync::index::{IndexError, IndexSettings, SearchIndex, TaskHandle, TaskInfo};

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct MeiliClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl MeiliClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_millis(50),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_key {
            Some(ref key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn enqueue(
        &self,
        operation: &str,
        index_uid: &str,
        request: RequestBuilder,
    ) -> Result<TaskHandle> {
        let response = self
            .authorize(request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to search backend", operation))?;

        let response = check_status(operation, response).await?;
        let task: EnqueuedTask = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} task response", operation))?;

        tracing::debug!(
            task_uid = task.task_uid,
            task_type = %task.task_type,
            "Enqueued {} task",
            operation
        );

        Ok(TaskHandle {
            index_uid: task.index_uid.unwrap_or_else(|| index_uid.to_string()),
            task_uid: task.task_uid,
        })
    }

    pub async fn get_task(&self, task_uid: u64) -> Result<TaskRecord> {
        let url = format!("{}/tasks/{}", self.base_url, task_uid);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .context("Failed to get task status from search backend")?;

        let response = check_status("get task", response).await?;
        let task: TaskRecord = response.json().await.context("Failed to parse task status")?;
        Ok(task)
    }
}

#[async_trait]
impl SearchIndex for MeiliClient {
    async fn create_index(&self, index_uid: &str, primary_key: &str) -> Result<TaskHandle> {
        let url = format!("{}/indexes", self.base_url);
        let body = CreateIndexRequest {
            uid: index_uid,
            primary_key,
        };
        self.enqueue("create index", index_uid, self.client.post(&url).json(&body))
            .await
    }

    async fn update_settings(&self, index_uid: &str, settings: &IndexSettings) -> Result<TaskHandle> {
        let url = format!("{}/indexes/{}/settings", self.base_url, index_uid);
        self.enqueue("update settings", index_uid, self.client.patch(&url).json(settings))
            .await
    }

    async fn upsert_documents(
        &self,
        index_uid: &str,
        documents: Vec<serde_json::Value>,
    ) -> Result<TaskHandle> {
        let url = format!(
            "{}/indexes/{}/documents?primaryKey={}",
            self.base_url,
            index_uid,
            crate::sync::documents::PRIMARY_KEY
        );
        self.enqueue("add documents", index_uid, self.client.post(&url).json(&documents))
            .await
    }

    async fn wait_for_task(&self, task: &TaskHandle, timeout: Duration) -> Result<TaskInfo> {
        let deadline = Instant::now() + timeout;
        let mut delay = self.poll_interval;

        loop {
            let record = self.get_task(task.task_uid).await?;
            if record.status.is_terminal() {
                return Ok(TaskInfo {
                    index_uid: record.index_uid.unwrap_or_else(|| task.index_uid.clone()),
                    task_uid: record.uid,
                    status: record.status,
                    error: record.error,
                });
            }

            let Some(wait) = next_poll(Instant::now(), deadline, delay) else {
                return Err(IndexError::TaskTimeout {
                    index_uid: task.index_uid.clone(),
                    task_uid: task.task_uid,
                    timeout,
                }
                .into());
            };

            tokio::time::sleep(wait).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }

    async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach search backend")?;

        let response = check_status("health", response).await?;
        let health: HealthResponse = response
            .json()
            .await
            .context("Failed to parse health response")?;

        if health.status != "available" {
            anyhow::bail!("Search backend reports status '{}'", health.status);
        }
        Ok(())
    }
}

/// How long to sleep before polling again, or `None` once the deadline has
/// passed. The last sleep is shortened so one poll lands on the deadline.
fn next_poll(now: Instant, deadline: Instant, delay: Duration) -> Option<Duration> {
    if now >= deadline {
        None
    } else {
        Some(delay.min(deadline - now))
    }
}

async fn check_status(operation: &str, response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if status == 401 || status == 403 {
        anyhow::bail!(
            "Search backend rejected the API key for {} ({}). Check --meili-api-key",
            operation,
            status
        );
    }

    Err(IndexError::Http {
        operation: operation.to_string(),
        status: status.as_u16(),
        body,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::index::{settings_for, TaskStatus};
    use crate::sync::model::EntityKind;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, patch, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Stand-in backend: task 1 never finishes, task 2 succeeds on its third poll.
    #[derive(Default)]
    struct Backend {
        polls: AtomicUsize,
    }

    async fn task_status(
        State(backend): State<Arc<Backend>>,
        Path(uid): Path<u64>,
    ) -> Json<Value> {
        let polls = backend.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = if uid == 2 && polls >= 3 {
            "succeeded"
        } else {
            "processing"
        };
        Json(json!({
            "uid": uid,
            "indexUid": "projects",
            "status": status,
            "type": "documentAdditionOrUpdate"
        }))
    }

    async fn spawn_backend() -> (MeiliClient, Arc<Backend>) {
        let backend = Arc::new(Backend::default());
        let app = Router::new()
            .route("/tasks/:uid", get(task_status))
            .route(
                "/indexes",
                post(|| async { (StatusCode::UNAUTHORIZED, "The provided API key is invalid.") }),
            )
            .route(
                "/indexes/:uid/settings",
                patch(|| async { (StatusCode::FORBIDDEN, "The API key cannot access this index.") }),
            )
            .route(
                "/indexes/:uid/documents",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "disk full") }),
            )
            .route("/health", get(|| async { Json(json!({ "status": "available" })) }))
            .with_state(Arc::clone(&backend));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = MeiliClient::new(&format!("http://{addr}"), Some("key".to_string())).unwrap();
        (client, backend)
    }

    fn handle(task_uid: u64) -> TaskHandle {
        TaskHandle {
            index_uid: "projects".to_string(),
            task_uid,
        }
    }

    #[test]
    fn test_client_creation() {
        let client = MeiliClient::new("http://localhost:7700/", None).unwrap();
        assert_eq!(client.base_url(), "http://localhost:7700");
    }

    #[test]
    fn test_client_creation_with_api_key() {
        let client = MeiliClient::new("https://search.example.com", Some("master-key".to_string()));
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_next_poll_stops_at_deadline() {
        let now = Instant::now();
        let deadline = now + Duration::from_millis(100);

        assert_eq!(
            next_poll(now, deadline, Duration::from_millis(50)),
            Some(Duration::from_millis(50))
        );
        assert_eq!(
            next_poll(now, deadline, Duration::from_millis(400)),
            Some(Duration::from_millis(100))
        );
        assert_eq!(next_poll(deadline, deadline, Duration::from_millis(50)), None);
        assert_eq!(
            next_poll(deadline + Duration::from_millis(1), deadline, Duration::from_millis(50)),
            None
        );
    }

    #[tokio::test]
    async fn test_unfinished_task_times_out() {
        let (client, backend) = spawn_backend().await;

        let err = client
            .wait_for_task(&handle(1), Duration::from_millis(300))
            .await
            .unwrap_err();

        match err.downcast_ref::<IndexError>() {
            Some(IndexError::TaskTimeout {
                index_uid,
                task_uid,
                timeout,
            }) => {
                assert_eq!(index_uid, "projects");
                assert_eq!(*task_uid, 1);
                assert_eq!(*timeout, Duration::from_millis(300));
            }
            other => panic!("expected TaskTimeout, got {other:?}"),
        }
        assert!(backend.polls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_wait_returns_once_task_is_terminal() {
        let (client, backend) = spawn_backend().await;

        let info = client
            .wait_for_task(&handle(2), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(info.status, TaskStatus::Succeeded);
        assert_eq!(info.task_uid, 2);
        assert_eq!(info.index_uid, "projects");
        assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_server_error_maps_to_http_error() {
        let (client, _backend) = spawn_backend().await;

        let err = client
            .upsert_documents("projects", vec![json!({ "searchId": "1" })])
            .await
            .unwrap_err();

        match err.downcast_ref::<IndexError>() {
            Some(IndexError::Http {
                operation,
                status,
                body,
            }) => {
                assert_eq!(operation, "add documents");
                assert_eq!(*status, 500);
                assert_eq!(body, "disk full");
            }
            other => panic!("expected Http error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_api_key_is_reported() {
        let (client, _backend) = spawn_backend().await;

        let unauthorized = client.create_index("projects", "searchId").await.unwrap_err();
        assert!(unauthorized.downcast_ref::<IndexError>().is_none());
        assert!(unauthorized.to_string().contains("rejected the API key"));
        assert!(unauthorized.to_string().contains("401"));

        let forbidden = client
            .update_settings("projects", &settings_for(EntityKind::Project))
            .await
            .unwrap_err();
        assert!(forbidden.to_string().contains("rejected the API key"));
        assert!(forbidden.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_health_accepts_available_backend() {
        let (client, _backend) = spawn_backend().await;
        client.health().await.unwrap();
    }
}
