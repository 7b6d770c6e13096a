// ABOUTME: Command-line, environment and TOML configuration for the sync service
// ABOUTME: Merges the sources and validates them into a SyncConfig

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::{Chain, SourceMode, Watermark};
use crate::utils::{validate_connection_string, validate_http_url};

const DEFAULT_CHAINS: &[&str] = &["mainnet"];
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_BATCH_SIZE: usize = 1_000;
const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Parser, Debug, Clone)]
#[command(name = "drips-index-sync")]
#[command(
    about = "Keep Meilisearch indexes in sync with Drip Lists and Projects in PostgreSQL",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    /// PostgreSQL connection string of the source database
    #[arg(long = "database-url", env = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// Base URL of the Meilisearch instance
    #[arg(long = "meili-url", env = "MEILI_URL")]
    pub meili_url: Option<String>,
    /// Meilisearch API key
    #[arg(long = "meili-api-key", env = "MEILI_API_KEY", hide_env_values = true)]
    pub meili_api_key: Option<String>,
    /// Chains to synchronize (comma-separated, default: mainnet)
    #[arg(long, env = "CHAINS", value_delimiter = ',')]
    pub chains: Option<Vec<String>>,
    /// Seconds between polling cycles (default: 30)
    #[arg(long = "poll-interval-secs", env = "POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,
    /// Maximum rows read per chain and entity kind each cycle (default: 1000)
    #[arg(long = "batch-size", env = "BATCH_SIZE")]
    pub batch_size: Option<usize>,
    /// Upper bound in seconds for one source read (default: 30)
    #[arg(long = "query-timeout-secs", env = "QUERY_TIMEOUT_SECS")]
    pub query_timeout_secs: Option<u64>,
    /// Upper bound in seconds for a search backend task to finish (default: 120)
    #[arg(long = "task-timeout-secs", env = "TASK_TIMEOUT_SECS")]
    pub task_timeout_secs: Option<u64>,
    /// Port of the health endpoint (default: 8080)
    #[arg(long = "health-port", env = "HEALTH_PORT")]
    pub health_port: Option<u16>,
    /// Persist the watermark to this file and resume from it on restart
    #[arg(long = "state-file", env = "STATE_FILE")]
    pub state_file: Option<PathBuf>,
    /// Re-read every row each cycle instead of only changed ones
    #[arg(long = "full-refresh")]
    pub full_refresh: bool,
    /// RFC 3339 timestamp to start detecting changes from
    #[arg(long = "initial-watermark", env = "INITIAL_WATERMARK")]
    pub initial_watermark: Option<String>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(long = "allow-self-signed-certs")]
    pub allow_self_signed_certs: bool,
    /// Run a single synchronization cycle and exit
    #[arg(long)]
    pub once: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log: String,
    /// Path to a TOML file with the same settings; flags and env override it
    #[arg(long = "config", env = "SYNC_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Settings given on the command line or through the environment.
    fn overrides(&self) -> FileConfig {
        FileConfig {
            database_url: self.database_url.clone(),
            meili_url: self.meili_url.clone(),
            meili_api_key: self.meili_api_key.clone(),
            chains: self.chains.clone(),
            poll_interval_secs: self.poll_interval_secs,
            batch_size: self.batch_size,
            query_timeout_secs: self.query_timeout_secs,
            task_timeout_secs: self.task_timeout_secs,
            health_port: self.health_port,
            state_file: self.state_file.clone(),
            full_refresh: self.full_refresh.then_some(true),
            initial_watermark: self.initial_watermark.clone(),
            allow_self_signed_certs: self.allow_self_signed_certs.then_some(true),
        }
    }
}

/// Settings file layout. Every key is optional.
///
/// ```toml
/// database_url = "postgresql://sync@db:5432/drips"
/// meili_url = "http://meili:7700"
/// chains = ["mainnet", "optimism"]
/// poll_interval_secs = 15
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub database_url: Option<String>,
    pub meili_url: Option<String>,
    pub meili_api_key: Option<String>,
    pub chains: Option<Vec<String>>,
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<usize>,
    pub query_timeout_secs: Option<u64>,
    pub task_timeout_secs: Option<u64>,
    pub health_port: Option<u16>,
    pub state_file: Option<PathBuf>,
    pub full_refresh: Option<bool>,
    pub initial_watermark: Option<String>,
    pub allow_self_signed_certs: Option<bool>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML config")
    }

    /// Layer `top` over `self`; values set in `top` win.
    pub fn overlay(self, top: FileConfig) -> FileConfig {
        FileConfig {
            database_url: top.database_url.or(self.database_url),
            meili_url: top.meili_url.or(self.meili_url),
            meili_api_key: top.meili_api_key.or(self.meili_api_key),
            chains: top.chains.or(self.chains),
            poll_interval_secs: top.poll_interval_secs.or(self.poll_interval_secs),
            batch_size: top.batch_size.or(self.batch_size),
            query_timeout_secs: top.query_timeout_secs.or(self.query_timeout_secs),
            task_timeout_secs: top.task_timeout_secs.or(self.task_timeout_secs),
            health_port: top.health_port.or(self.health_port),
            state_file: top.state_file.or(self.state_file),
            full_refresh: top.full_refresh.or(self.full_refresh),
            initial_watermark: top.initial_watermark.or(self.initial_watermark),
            allow_self_signed_certs: top
                .allow_self_signed_certs
                .or(self.allow_self_signed_certs),
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub meili_url: String,
    pub meili_api_key: Option<String>,
    pub chains: Vec<Chain>,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub query_timeout: Duration,
    pub task_timeout: Duration,
    pub health_port: u16,
    pub state_file: Option<PathBuf>,
    pub mode: SourceMode,
    pub initial_watermark: Option<Watermark>,
    pub allow_self_signed_certs: bool,
}

impl TryFrom<&Cli> for SyncConfig {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self> {
        let base = match cli.config {
            Some(ref path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        SyncConfig::try_from(base.overlay(cli.overrides()))
    }
}

impl TryFrom<FileConfig> for SyncConfig {
    type Error = anyhow::Error;

    fn try_from(raw: FileConfig) -> Result<Self> {
        let database_url = raw
            .database_url
            .filter(|url| !url.trim().is_empty())
            .context("Missing database URL. Set --database-url or DATABASE_URL")?;
        validate_connection_string(&database_url).context("Invalid database URL")?;

        let meili_url = raw
            .meili_url
            .filter(|url| !url.trim().is_empty())
            .context("Missing Meilisearch URL. Set --meili-url or MEILI_URL")?;
        validate_http_url(&meili_url).context("Invalid Meilisearch URL")?;

        let chain_names = raw
            .chains
            .unwrap_or_else(|| DEFAULT_CHAINS.iter().map(|c| c.to_string()).collect());
        let chains = parse_chains(&chain_names)?;

        let poll_interval_secs = raw.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if poll_interval_secs == 0 {
            bail!("Poll interval must be greater than zero seconds");
        }
        let batch_size = raw.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            bail!("Batch size must be greater than zero");
        }
        let query_timeout_secs = raw.query_timeout_secs.unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS);
        if query_timeout_secs == 0 {
            bail!("Query timeout must be greater than zero seconds");
        }
        let task_timeout_secs = raw.task_timeout_secs.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS);
        if task_timeout_secs == 0 {
            bail!("Task timeout must be greater than zero seconds");
        }

        let initial_watermark = raw
            .initial_watermark
            .as_deref()
            .map(parse_watermark)
            .transpose()?;

        let mode = if raw.full_refresh.unwrap_or(false) {
            SourceMode::FullRefresh
        } else {
            SourceMode::Incremental
        };

        Ok(SyncConfig {
            database_url,
            meili_url,
            meili_api_key: raw.meili_api_key.filter(|key| !key.is_empty()),
            chains,
            poll_interval: Duration::from_secs(poll_interval_secs),
            batch_size,
            query_timeout: Duration::from_secs(query_timeout_secs),
            task_timeout: Duration::from_secs(task_timeout_secs),
            health_port: raw.health_port.unwrap_or(DEFAULT_HEALTH_PORT),
            state_file: raw.state_file,
            mode,
            initial_watermark,
            allow_self_signed_certs: raw.allow_self_signed_certs.unwrap_or(false),
        })
    }
}

/// Parse chain names against the allow-list, dropping duplicates.
pub fn parse_chains(names: &[String]) -> Result<Vec<Chain>> {
    let mut chains = Vec::with_capacity(names.len());
    for name in names.iter().filter(|n| !n.trim().is_empty()) {
        let chain: Chain = name.parse()?;
        if !chains.contains(&chain) {
            chains.push(chain);
        }
    }
    if chains.is_empty() {
        bail!("At least one chain must be configured");
    }
    Ok(chains)
}

/// Parse an RFC 3339 timestamp into a watermark.
pub fn parse_watermark(value: &str) -> Result<Watermark> {
    let parsed = DateTime::parse_from_rfc3339(value.trim()).with_context(|| {
        format!(
            "Invalid initial watermark '{}'. Expected RFC 3339, e.g. 2024-01-31T12:00:00Z",
            value
        )
    })?;
    Ok(parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn minimal() -> FileConfig {
        FileConfig {
            database_url: Some("postgresql://sync@localhost:5432/drips".to_string()),
            meili_url: Some("http://localhost:7700".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = SyncConfig::try_from(minimal()).unwrap();
        assert_eq!(config.chains, vec![Chain::Mainnet]);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert_eq!(config.task_timeout, Duration::from_secs(120));
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.mode, SourceMode::Incremental);
        assert!(config.initial_watermark.is_none());
        assert!(!config.allow_self_signed_certs);
    }

    #[test]
    fn test_missing_urls_rejected() {
        let mut raw = minimal();
        raw.database_url = None;
        let err = SyncConfig::try_from(raw).unwrap_err();
        assert!(err.to_string().contains("database URL"));

        let mut raw = minimal();
        raw.meili_url = Some("not a url".to_string());
        assert!(SyncConfig::try_from(raw).is_err());
    }

    #[test]
    fn test_unknown_chain_rejected() {
        let mut raw = minimal();
        raw.chains = Some(vec!["mainnet".to_string(), "public; DROP".to_string()]);
        let err = SyncConfig::try_from(raw).unwrap_err();
        assert!(format!("{:?}", err).contains("Unsupported chain"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut raw = minimal();
        raw.poll_interval_secs = Some(0);
        assert!(SyncConfig::try_from(raw).is_err());

        let mut raw = minimal();
        raw.batch_size = Some(0);
        assert!(SyncConfig::try_from(raw).is_err());
    }

    #[test]
    fn test_parse_chains_dedups_and_keeps_order() {
        let chains = parse_chains(&[
            "optimism".to_string(),
            " Mainnet ".to_string(),
            "optimism".to_string(),
            "".to_string(),
        ])
        .unwrap();
        assert_eq!(chains, vec![Chain::Optimism, Chain::Mainnet]);
        assert!(parse_chains(&[]).is_err());
    }

    #[test]
    fn test_parse_watermark() {
        let watermark = parse_watermark("2024-01-31T12:00:00+01:00").unwrap();
        assert_eq!(watermark, Utc.with_ymd_and_hms(2024, 1, 31, 11, 0, 0).unwrap());
        assert!(parse_watermark("yesterday").is_err());
    }

    #[test]
    fn test_full_refresh_mode() {
        let mut raw = minimal();
        raw.full_refresh = Some(true);
        let config = SyncConfig::try_from(raw).unwrap();
        assert_eq!(config.mode, SourceMode::FullRefresh);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(FileConfig::from_toml("poll_interval = 5").is_err());
        let parsed = FileConfig::from_toml("poll_interval_secs = 5\nchains = [\"filecoin\"]").unwrap();
        assert_eq!(parsed.poll_interval_secs, Some(5));
        assert_eq!(parsed.chains, Some(vec!["filecoin".to_string()]));
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "database_url = \"postgresql://file@db:5432/drips\"\n\
             meili_url = \"http://file-meili:7700\"\n\
             batch_size = 250\n\
             poll_interval_secs = 60\n\
             full_refresh = true"
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "drips-index-sync",
            "--config",
            file.path().to_str().unwrap(),
            "--meili-url",
            "http://cli-meili:7700",
            "--poll-interval-secs",
            "5",
            "--chains",
            "sepolia,optimism_sepolia",
        ])
        .unwrap();

        let config = SyncConfig::try_from(&cli).unwrap();
        assert_eq!(config.database_url, "postgresql://file@db:5432/drips");
        assert_eq!(config.meili_url, "http://cli-meili:7700");
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.chains, vec![Chain::Sepolia, Chain::OptimismSepolia]);
        assert_eq!(config.mode, SourceMode::FullRefresh);
    }
}
