use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::log::LogOptions;

pub const DEFAULT_TRUNCATE_FREQUENCY: Duration = Duration::from_secs(60);
pub const DEFAULT_BUFFER_SIZE: usize = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PRW_WAL_ENDPOINT is required but not set")]
    EndpointMissing,

    #[error("PRW_WAL_ENDPOINT is not a valid URL: {0}")]
    EndpointInvalidUrl(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("PRW_WAL_BUFFER_SIZE must be a positive integer")]
    InvalidBufferSize,
}

/// Backoff applied by the remote-write exporter between attempts at one
/// request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// `None` retries until cancelled.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(30),
            max_elapsed: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub endpoint: Url,
    pub export_timeout: Duration,
    pub export_headers: Vec<(String, String)>,
    pub max_batch_size_bytes: usize,
    pub retry: RetryPolicy,
}

/// Write-ahead log settings. Fixed once a WAL has been built from them.
#[derive(Debug, Clone, PartialEq)]
pub struct WalConfig {
    pub directory: PathBuf,
    /// How often the drain loop runs when `buffer_size` is not reached first.
    pub truncate_frequency: Duration,
    /// Number of persisted entries that triggers a drain ahead of the timer.
    pub buffer_size: usize,
    pub segment_max_bytes: u64,
}

impl WalConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            truncate_frequency: DEFAULT_TRUNCATE_FREQUENCY,
            buffer_size: DEFAULT_BUFFER_SIZE,
            segment_max_bytes: LogOptions::default().segment_max_bytes,
        }
    }

    /// Replace unset (zero) values with their defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.truncate_frequency.is_zero() {
            self.truncate_frequency = DEFAULT_TRUNCATE_FREQUENCY;
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.segment_max_bytes == 0 {
            self.segment_max_bytes = LogOptions::default().segment_max_bytes;
        }
        self
    }

    pub(crate) fn log_options(&self) -> LogOptions {
        LogOptions {
            segment_max_bytes: self.segment_max_bytes,
            ..LogOptions::default()
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub exporter: ExporterConfig,
    /// `None` when `PRW_WAL_DIRECTORY` is unset: requests go straight to the
    /// endpoint without buffering.
    pub wal: Option<WalConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with("PRW_WAL_"))
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let endpoint = parse_endpoint(vars)?;
        let export_timeout = parse_duration_ms(vars, "PRW_WAL_EXPORT_TIMEOUT_MS", 5000)?;
        let export_headers = parse_headers(vars);
        let max_batch_size_bytes =
            parse_number(vars, "PRW_WAL_MAX_BATCH_SIZE_BYTES", 3_000_000)?;
        let retry = parse_retry(vars)?;
        let wal = parse_wal(vars)?;

        Ok(Self {
            exporter: ExporterConfig {
                endpoint,
                export_timeout,
                export_headers,
                max_batch_size_bytes,
                retry,
            },
            wal,
        })
    }
}

fn parse_endpoint(vars: &HashMap<String, String>) -> Result<Url, ConfigError> {
    let raw = vars
        .get("PRW_WAL_ENDPOINT")
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::EndpointMissing)?;

    Url::parse(raw).map_err(|_| ConfigError::EndpointInvalidUrl(raw.clone()))
}

fn parse_number<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parse_number(vars, name, default_ms).map(Duration::from_millis)
}

fn parse_retry(vars: &HashMap<String, String>) -> Result<RetryPolicy, ConfigError> {
    let defaults = RetryPolicy::default();
    let initial_interval = parse_duration_ms(
        vars,
        "PRW_WAL_RETRY_INITIAL_INTERVAL_MS",
        defaults.initial_interval.as_millis() as u64,
    )?;
    let max_interval = parse_duration_ms(
        vars,
        "PRW_WAL_RETRY_MAX_INTERVAL_MS",
        defaults.max_interval.as_millis() as u64,
    )?;
    let max_elapsed = parse_duration_ms(vars, "PRW_WAL_RETRY_MAX_ELAPSED_MS", 300_000)?;

    Ok(RetryPolicy {
        initial_interval,
        max_interval: max_interval.max(initial_interval),
        max_elapsed: (!max_elapsed.is_zero()).then_some(max_elapsed),
    })
}

fn parse_wal(vars: &HashMap<String, String>) -> Result<Option<WalConfig>, ConfigError> {
    let Some(directory) = vars.get("PRW_WAL_DIRECTORY").filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let defaults = WalConfig::new(directory);

    let truncate_frequency = parse_duration_ms(
        vars,
        "PRW_WAL_TRUNCATE_FREQUENCY_MS",
        defaults.truncate_frequency.as_millis() as u64,
    )?;
    let buffer_size = parse_number(vars, "PRW_WAL_BUFFER_SIZE", defaults.buffer_size)?;
    if buffer_size == 0 {
        return Err(ConfigError::InvalidBufferSize);
    }
    let segment_max_bytes =
        parse_number(vars, "PRW_WAL_SEGMENT_MAX_BYTES", defaults.segment_max_bytes)?;

    Ok(Some(
        WalConfig {
            truncate_frequency,
            buffer_size,
            segment_max_bytes,
            ..defaults
        }
        .normalized(),
    ))
}

fn parse_headers(vars: &HashMap<String, String>) -> Vec<(String, String)> {
    vars.get("PRW_WAL_EXPORT_HEADERS")
        .filter(|s| !s.is_empty())
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    let k = k.trim();
                    let v = v.trim();
                    if k.is_empty() {
                        return None;
                    }
                    Some((k.to_owned(), v.to_owned()))
                })
                .collect()
        })
        .unwrap_or_default()
}
