// ABOUTME: CLI entry point for drips-index-sync
// ABOUTME: Wires the source, detector, search backend and health endpoint, then runs until signalled

use anyhow::{bail, Context};
use clap::Parser;
use drips_index_sync::config::{Cli, SyncConfig};
use drips_index_sync::health::{self, HealthState};
use drips_index_sync::meili::MeiliClient;
use drips_index_sync::postgres::{connect_shared, ConnectOptions};
use drips_index_sync::sync::model::initial_watermark;
use drips_index_sync::sync::{
    ChangeSource, CycleOutcome, DetectorConfig, IndexSynchronizer, KeyStrategy, PgChangeSource,
    PollingDetector, SourceOptions, Synchronizer, SynchronizerConfig, WatermarkStore,
};
use drips_index_sync::utils::sanitize_url;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging with the following precedence:
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = SyncConfig::try_from(&cli).context("Invalid configuration")?;

    if let Err(e) = run(config, cli.once).await {
        tracing::error!("drips-index-sync exited with error: {:?}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: SyncConfig, once: bool) -> anyhow::Result<()> {
    let chain_names: Vec<&str> = config.chains.iter().map(|c| c.as_str()).collect();
    tracing::info!(
        "Syncing chains [{}] from {} to {}",
        chain_names.join(", "),
        sanitize_url(&config.database_url),
        config.meili_url
    );

    let client = connect_shared(
        &config.database_url,
        &ConnectOptions {
            allow_self_signed_certs: config.allow_self_signed_certs,
        },
    )
    .await?;

    let source = Arc::new(PgChangeSource::new(
        Arc::clone(&client),
        config.chains.clone(),
        SourceOptions {
            mode: config.mode,
            batch_size: config.batch_size,
            query_timeout: config.query_timeout,
        },
    )?);

    let mut detector = PollingDetector::new(
        source.clone(),
        DetectorConfig {
            poll_interval: config.poll_interval,
            initial_watermark: config.initial_watermark.unwrap_or_else(initial_watermark),
        },
    );
    if let Some(ref path) = config.state_file {
        tracing::info!("Persisting watermark to {:?}", path);
        detector = detector.with_store(WatermarkStore::new(
            path.clone(),
            &config.database_url,
            &config.chains,
        ));
    }

    let index = Arc::new(MeiliClient::new(
        &config.meili_url,
        config.meili_api_key.clone(),
    )?);

    let synchronizer = Arc::new(IndexSynchronizer::new(
        Arc::new(detector),
        index,
        SynchronizerConfig {
            task_timeout: config.task_timeout,
            key_strategy: KeyStrategy::for_chains(source.chains()),
        },
    ));

    if once {
        tracing::info!("Running single sync cycle...");
        let outcome = synchronizer.sync_once().await;
        drop(client);
        return match outcome? {
            CycleOutcome::NoChanges => {
                tracing::info!("Sync cycle complete: no changes");
                Ok(())
            }
            CycleOutcome::Applied { records, watermark } => {
                tracing::info!(
                    "Sync cycle complete: {} records applied, watermark {}",
                    records,
                    watermark
                );
                Ok(())
            }
        };
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_state = HealthState {
        source: source as Arc<dyn ChangeSource>,
        synchronizer: synchronizer.clone() as Arc<dyn Synchronizer>,
    };
    let port = config.health_port;
    let health_server = tokio::spawn(async move {
        if let Err(e) = health::serve(port, health_state, shutdown_rx).await {
            tracing::error!("Health endpoint stopped: {:?}", e);
        }
    });

    if let Err(e) = synchronizer.start().await {
        stop_health_server(&shutdown_tx, health_server).await;
        drop(client);
        return Err(e).context("Failed to start synchronization");
    }

    tracing::info!("Synchronization running, press Ctrl+C to stop");

    // Resolves when the synchronizer halts itself after a failed apply
    let halted = synchronizer.wait_stopped();

    let failure = tokio::select! {
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => tracing::info!("Received {}, shutting down", name),
                Err(e) => tracing::warn!("Failed to listen for shutdown signals: {:?}", e),
            }
            None
        }
        error = halted => error,
    };

    synchronizer.stop().await;
    stop_health_server(&shutdown_tx, health_server).await;
    drop(synchronizer);
    drop(client);
    tracing::info!("Source connection closed");

    if let Some(error) = failure {
        bail!("Synchronization halted: {}", error);
    }
    Ok(())
}

/// Flag the health endpoint to shut down and wait for its task.
async fn stop_health_server(shutdown_tx: &watch::Sender<bool>, server: JoinHandle<()>) {
    let _ = shutdown_tx.send(true);
    if let Err(e) = server.await {
        tracing::warn!("Health endpoint task failed: {:?}", e);
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    Ok("Ctrl+C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_health_server_waits_for_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            let _ = rx.wait_for(|stop| *stop).await;
        });

        tokio::time::timeout(Duration::from_secs(5), stop_health_server(&tx, server))
            .await
            .expect("server task should exit once flagged");
    }

    #[tokio::test]
    async fn test_stop_health_server_tolerates_panicked_task() {
        let (tx, _rx) = watch::channel(false);
        let server = tokio::spawn(async {
            panic!("listener crashed");
        });

        stop_health_server(&tx, server).await;
        assert!(*tx.borrow());
    }
}
