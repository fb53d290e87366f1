use clap::Parser;
use lib_counter::connections::{RedisStreamOptions, RedisStreamTransport};
use lib_counter::{ConnectorOptions, RollupOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_distinct.conf";
const DEFAULT_STORE_HOST: &str = "127.0.0.1";
const DEFAULT_STORE_PORT: u16 = 6379;
const DEFAULT_BUS_HOST: &str = "127.0.0.1";
const DEFAULT_BUS_PORT: u16 = 6379;
const DEFAULT_EXCHANGE: &str = "metrics";
const DEFAULT_SUBSCRIPTION: &str = "distinct";
const DEFAULT_PREFETCH: usize = 1;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
const DEFAULT_BUCKET_SECS: i64 = 86_400;
const DEFAULT_PERIOD_BUCKETS: i64 = 15;
const DEFAULT_KEY_PREFIX: &str = "distinct";
/// Seconds, minutes, hours, day of month, month, day of week (UTC).
const DEFAULT_ROLLUP_CRON: &str = "0 5 0 * * *";
const DEFAULT_MONITOR_PORT: u16 = 9090;
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Distinct action counter: bus consumer, bucket rollup and monitor", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "DISTINCT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DISTINCT_STORE_HOST", help = "Bucket store (Redis) host.")]
    pub store_host: Option<String>,

    #[clap(long, env = "DISTINCT_STORE_PORT", help = "Bucket store (Redis) port.")]
    pub store_port: Option<u16>,

    #[clap(long, env = "DISTINCT_STORE_PASSWORD", help = "Bucket store password.")]
    pub store_password: Option<String>,

    #[clap(long, env = "DISTINCT_STORE_DB", help = "Bucket store database index.")]
    pub store_db: Option<u32>,

    #[clap(long, env = "DISTINCT_BUS_HOST", help = "Message bus (Redis Streams) host.")]
    pub bus_host: Option<String>,

    #[clap(long, env = "DISTINCT_BUS_PORT", help = "Message bus port.")]
    pub bus_port: Option<u16>,

    #[clap(long, env = "DISTINCT_BUS_USER", help = "Message bus user.")]
    pub bus_user: Option<String>,

    #[clap(long, env = "DISTINCT_BUS_PASSWORD", help = "Message bus password.")]
    pub bus_password: Option<String>,

    #[clap(long, env = "DISTINCT_EXCHANGE", help = "Topic every subscription is bound to.")]
    pub exchange: Option<String>,

    #[clap(
        long,
        env = "DISTINCT_SUBSCRIPTIONS",
        value_delimiter = ',',
        help = "Comma separated subscription names, one ingest handler each."
    )]
    pub subscriptions: Option<Vec<String>>,

    #[clap(long, env = "DISTINCT_PREFETCH", help = "Unacknowledged deliveries allowed per subscription.")]
    pub prefetch: Option<usize>,

    #[clap(long, env = "DISTINCT_RETRY_INTERVAL_SECS", help = "Seconds between bus reconnect attempts.")]
    pub retry_interval_secs: Option<u64>,

    #[clap(long, env = "DISTINCT_BUCKET_SECS", help = "Bucket length in seconds.")]
    pub bucket_secs: Option<i64>,

    #[clap(long, env = "DISTINCT_PERIOD_BUCKETS", help = "Buckets merged per rollup period.")]
    pub period_buckets: Option<i64>,

    #[clap(long, env = "DISTINCT_KEY_PREFIX", help = "Namespace for bucket and summary keys.")]
    pub key_prefix: Option<String>,

    #[clap(long, env = "DISTINCT_ROLLUP_CRON", help = "Six-field cron expression (UTC) for the rollup job.")]
    pub rollup_cron: Option<String>,

    #[clap(long, env = "DISTINCT_MONITOR_PORT", help = "Port of the monitor HTTP endpoint.")]
    pub monitor_port: Option<u16>,

    #[clap(long, env = "DISTINCT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DISTINCT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl Config {
    /// Built-in values, the lowest precedence layer.
    pub fn defaults() -> Config {
        Config {
            store_host: Some(DEFAULT_STORE_HOST.to_string()),
            store_port: Some(DEFAULT_STORE_PORT),
            store_db: Some(0),
            bus_host: Some(DEFAULT_BUS_HOST.to_string()),
            bus_port: Some(DEFAULT_BUS_PORT),
            exchange: Some(DEFAULT_EXCHANGE.to_string()),
            subscriptions: Some(vec![DEFAULT_SUBSCRIPTION.to_string()]),
            prefetch: Some(DEFAULT_PREFETCH),
            retry_interval_secs: Some(DEFAULT_RETRY_INTERVAL_SECS),
            bucket_secs: Some(DEFAULT_BUCKET_SECS),
            period_buckets: Some(DEFAULT_PERIOD_BUCKETS),
            key_prefix: Some(DEFAULT_KEY_PREFIX.to_string()),
            rollup_cron: Some(DEFAULT_ROLLUP_CRON.to_string()),
            monitor_port: Some(DEFAULT_MONITOR_PORT),
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            store_host: other.store_host.or(self.store_host),
            store_port: other.store_port.or(self.store_port),
            store_password: other.store_password.or(self.store_password),
            store_db: other.store_db.or(self.store_db),
            bus_host: other.bus_host.or(self.bus_host),
            bus_port: other.bus_port.or(self.bus_port),
            bus_user: other.bus_user.or(self.bus_user),
            bus_password: other.bus_password.or(self.bus_password),
            exchange: other.exchange.or(self.exchange),
            subscriptions: other.subscriptions.or(self.subscriptions),
            prefetch: other.prefetch.or(self.prefetch),
            retry_interval_secs: other.retry_interval_secs.or(self.retry_interval_secs),
            bucket_secs: other.bucket_secs.or(self.bucket_secs),
            period_buckets: other.period_buckets.or(self.period_buckets),
            key_prefix: other.key_prefix.or(self.key_prefix),
            rollup_cron: other.rollup_cron.or(self.rollup_cron),
            monitor_port: other.monitor_port.or(self.monitor_port),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    /// Connection URL of the bucket store.
    pub fn store_url(&self) -> String {
        let host = self.store_host.as_deref().unwrap_or(DEFAULT_STORE_HOST);
        let port = self.store_port.unwrap_or(DEFAULT_STORE_PORT);
        let db = self.store_db.unwrap_or(0);
        match self.store_password.as_deref() {
            Some(password) if !password.is_empty() => format!("redis://:{}@{}:{}/{}", password, host, port, db),
            _ => format!("redis://{}:{}/{}", host, port, db),
        }
    }

    /// Connection URL of the message bus.
    pub fn bus_url(&self) -> String {
        RedisStreamTransport::url(
            self.bus_host.as_deref().unwrap_or(DEFAULT_BUS_HOST),
            self.bus_port.unwrap_or(DEFAULT_BUS_PORT),
            self.bus_user.as_deref().unwrap_or_default(),
            self.bus_password.as_deref().unwrap_or_default(),
        )
    }

    pub fn subscription_names(&self) -> Vec<String> {
        let names: Vec<String> = self
            .subscriptions
            .iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if names.is_empty() {
            vec![DEFAULT_SUBSCRIPTION.to_string()]
        } else {
            names
        }
    }

    pub fn connector_options(&self) -> ConnectorOptions {
        ConnectorOptions {
            topic: self.exchange.clone().unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            prefetch: self.prefetch.unwrap_or(DEFAULT_PREFETCH),
            retry_interval: Duration::from_secs(self.retry_interval_secs.unwrap_or(DEFAULT_RETRY_INTERVAL_SECS)),
        }
    }

    pub fn rollup_options(&self) -> RollupOptions {
        RollupOptions {
            key_prefix: self.key_prefix.clone().unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            bucket_secs: self.bucket_secs.unwrap_or(DEFAULT_BUCKET_SECS),
            period_buckets: self.period_buckets.unwrap_or(DEFAULT_PERIOD_BUCKETS),
        }
    }

    pub fn stream_options(&self) -> RedisStreamOptions {
        RedisStreamOptions {
            // Pending entries are owned by the consumer name.
            consumer: std::env::var("HOSTNAME").unwrap_or_else(|_| "server_distinct".to_string()),
            ..RedisStreamOptions::default()
        }
    }

    pub fn rollup_cron(&self) -> &str {
        self.rollup_cron.as_deref().unwrap_or(DEFAULT_ROLLUP_CRON)
    }

    pub fn monitor_port(&self) -> u16 {
        self.monitor_port.unwrap_or(DEFAULT_MONITOR_PORT)
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or_else(|| Path::new(DEFAULT_LOG_DIR))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// Reads a JSON config file. Missing or malformed files yield `None`.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the config file and `cli` (which already carries the
/// environment), in increasing precedence.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}
