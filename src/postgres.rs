// ABOUTME: PostgreSQL connection helpers for the change source
// ABOUTME: TLS-aware connect with retry, and the shared self-healing connection

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::{Client, Config, NoTls};

use crate::utils::{retry_with_backoff, sanitize_url};

/// Source connection shared by the detector and the health check.
pub type SharedClient = Arc<SourceConnection>;

/// Options for establishing the source connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Accept self-signed or otherwise unverifiable server certificates
    pub allow_self_signed_certs: bool,
}

/// Connect to PostgreSQL, negotiating TLS when the URL asks for it.
///
/// The connection task is spawned onto the runtime; it logs and exits when
/// the connection closes.
pub async fn connect(url: &str, options: &ConnectOptions) -> Result<Client> {
    let config: Config = url
        .parse()
        .with_context(|| format!("Invalid PostgreSQL URL: {}", sanitize_url(url)))?;

    let wants_tls = !matches!(config.get_ssl_mode(), tokio_postgres::config::SslMode::Disable);

    if wants_tls {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(options.allow_self_signed_certs)
            .build()
            .context("Failed to build TLS connector")?;
        let tls = MakeTlsConnector::new(connector);

        let (client, connection) = config
            .connect(tls)
            .await
            .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });
        Ok(client)
    } else {
        let (client, connection) = config
            .connect(NoTls)
            .await
            .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });
        Ok(client)
    }
}

/// Connect with exponential backoff (3 retries starting at 1s).
pub async fn connect_with_retry(url: &str, options: &ConnectOptions) -> Result<Client> {
    retry_with_backoff(|| connect(url, options), 3, Duration::from_secs(1))
        .await
        .context("Failed to connect to PostgreSQL after retries")
}

/// Connect and wrap the client for sharing.
pub async fn connect_shared(url: &str, options: &ConnectOptions) -> Result<SharedClient> {
    Ok(Arc::new(SourceConnection::open(url, options.clone()).await?))
}

/// One PostgreSQL client that is replaced when its connection closes.
///
/// A cycle holds the lock for the length of its read transaction; queries
/// inside the transaction are pipelined on the one connection. A server
/// restart, failover or idle kill closes the client; the next caller to lock
/// it reconnects before using it.
pub struct SourceConnection {
    url: String,
    options: ConnectOptions,
    client: Mutex<Client>,
}

impl SourceConnection {
    pub async fn open(url: &str, options: ConnectOptions) -> Result<Self> {
        let client = connect_with_retry(url, &options).await?;
        Ok(Self {
            url: url.to_string(),
            options,
            client: Mutex::new(client),
        })
    }

    /// Lock the client, reconnecting first if the connection has closed.
    pub async fn lock(&self) -> Result<MutexGuard<'_, Client>> {
        let mut client = self.client.lock().await;
        if client.is_closed() {
            tracing::warn!(
                "Source connection to {} closed, reconnecting",
                sanitize_url(&self.url)
            );
            *client = connect_with_retry(&self.url, &self.options).await?;
            tracing::info!("Reconnected to {}", sanitize_url(&self.url));
        }
        Ok(client)
    }
}
