// ABOUTME: HTTP health endpoint for the sync service
// ABOUTME: Reports database reachability, sync progress and search backend liveness

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::sync::model::initial_watermark;
use crate::sync::{ChangeSource, SyncMetrics, SyncPhase, Synchronizer};

/// Upper bound for the database check; a cycle may hold the connection meanwhile.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HealthState {
    pub source: Arc<dyn ChangeSource>,
    pub synchronizer: Arc<dyn Synchronizer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Running, nothing applied yet
    Initializing,
    Ok,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncHealth {
    pub status: SyncStatus,
    pub phase: SyncPhase,
    pub metrics: SyncMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHealth {
    pub status: ComponentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Components {
    pub database: DatabaseHealth,
    pub sync: SyncHealth,
    pub search: SearchHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: Components,
}

impl HealthReport {
    pub fn status_code(&self) -> StatusCode {
        if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Derive the sync component status from the synchronizer's state.
pub fn sync_status(phase: SyncPhase, metrics: &SyncMetrics, last_error: Option<&str>) -> SyncStatus {
    if phase == SyncPhase::Failed || last_error.is_some() {
        return SyncStatus::Fail;
    }

    let synced = metrics
        .last_sync_time
        .map_or(false, |watermark| watermark > initial_watermark());

    match phase {
        SyncPhase::Starting => SyncStatus::Initializing,
        SyncPhase::Running if synced => SyncStatus::Ok,
        SyncPhase::Running => SyncStatus::Initializing,
        SyncPhase::Stopping => SyncStatus::Fail,
        // Not started yet, or already shut down
        SyncPhase::Stopped if metrics.last_successful_sync.is_none() => SyncStatus::Initializing,
        SyncPhase::Stopped | SyncPhase::Failed => SyncStatus::Fail,
    }
}

async fn check_database(source: &dyn ChangeSource) -> DatabaseHealth {
    match tokio::time::timeout(CHECK_TIMEOUT, source.ping()).await {
        Ok(Ok(latency)) => DatabaseHealth {
            status: ComponentStatus::Up,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        },
        Ok(Err(e)) => {
            tracing::warn!("Database health check failed: {:?}", e);
            DatabaseHealth {
                status: ComponentStatus::Down,
                latency_ms: None,
                error: Some(format!("{:#}", e)),
            }
        }
        Err(_) => DatabaseHealth {
            status: ComponentStatus::Down,
            latency_ms: None,
            error: Some(format!("check timed out after {:?}", CHECK_TIMEOUT)),
        },
    }
}

/// Run every check and assemble the report.
pub async fn check(state: &HealthState) -> HealthReport {
    let (database, search_up) = tokio::join!(
        check_database(state.source.as_ref()),
        state.synchronizer.is_healthy()
    );

    let phase = state.synchronizer.phase();
    let metrics = state.synchronizer.metrics();
    let error = state.synchronizer.last_error();
    let status = sync_status(phase, &metrics, error.as_deref());

    let search = SearchHealth {
        status: if search_up {
            ComponentStatus::Up
        } else {
            ComponentStatus::Down
        },
    };

    let healthy = database.status == ComponentStatus::Up
        && search.status == ComponentStatus::Up
        && status != SyncStatus::Fail;

    HealthReport {
        healthy,
        components: Components {
            database,
            sync: SyncHealth {
                status,
                phase,
                metrics,
                error,
            },
            search,
        },
    }
}

async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let report = check(&state).await;
    if !report.healthy {
        tracing::debug!("Health check reports unhealthy: {:?}", report);
    }
    (report.status_code(), Json(report))
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve the health endpoint until `shutdown` flips to true.
pub async fn serve(port: u16, state: HealthState, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;

    tracing::info!("Health endpoint listening on http://{}/health", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Health server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn synced() -> SyncMetrics {
        SyncMetrics {
            last_sync_time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            last_successful_sync: Some(Utc::now()),
            total_processed_records: 3,
        }
    }

    #[test]
    fn test_initializing_before_first_sync() {
        let metrics = SyncMetrics::default();
        assert_eq!(
            sync_status(SyncPhase::Starting, &metrics, None),
            SyncStatus::Initializing
        );
        assert_eq!(
            sync_status(SyncPhase::Running, &metrics, None),
            SyncStatus::Initializing
        );
        assert_eq!(
            sync_status(SyncPhase::Stopped, &metrics, None),
            SyncStatus::Initializing
        );
    }

    #[test]
    fn test_ok_after_sync_with_nonzero_watermark() {
        assert_eq!(
            sync_status(SyncPhase::Running, &synced(), None),
            SyncStatus::Ok
        );

        let mut epoch = synced();
        epoch.last_sync_time = Some(initial_watermark());
        assert_eq!(
            sync_status(SyncPhase::Running, &epoch, None),
            SyncStatus::Initializing
        );
    }

    #[test]
    fn test_fail_after_halt() {
        assert_eq!(
            sync_status(SyncPhase::Stopped, &synced(), Some("task 4 failed")),
            SyncStatus::Fail
        );
        assert_eq!(
            sync_status(SyncPhase::Stopped, &SyncMetrics::default(), Some("boom")),
            SyncStatus::Fail
        );
        assert_eq!(
            sync_status(SyncPhase::Failed, &synced(), None),
            SyncStatus::Fail
        );
        assert_eq!(
            sync_status(SyncPhase::Stopped, &synced(), None),
            SyncStatus::Fail
        );
    }

    #[test]
    fn test_report_status_code() {
        let report = HealthReport {
            healthy: false,
            components: Components {
                database: DatabaseHealth {
                    status: ComponentStatus::Down,
                    latency_ms: None,
                    error: Some("connection refused".to_string()),
                },
                sync: SyncHealth {
                    status: SyncStatus::Initializing,
                    phase: SyncPhase::Running,
                    metrics: SyncMetrics::default(),
                    error: None,
                },
                search: SearchHealth {
                    status: ComponentStatus::Up,
                },
            },
        };
        assert_eq!(report.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["components"]["database"]["status"], "down");
        assert_eq!(json["components"]["sync"]["status"], "initializing");
        assert!(json["components"]["database"].get("latency_ms").is_none());
    }
}
