use arc_swap::ArcSwapOption;
use brook_types::{EventType, BROOK_CONFIG_ENV_PREFIX};
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use log::warn;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::OsStr;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../default.toml");

static CONFIG: ArcSwapOption<Config> = ArcSwapOption::const_empty();

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration could not be loaded: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("configuration file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("invalid window configuration: {0}")]
    InvalidWindow(String),

    #[error("invalid checkpoint configuration: {0}")]
    InvalidCheckpoint(String),
}

/// Loads configuration and installs it as the process-wide config. Fails if a config has
/// already been installed.
pub fn initialize_config(path: Option<&Path>) -> Result<Arc<Config>, ConfigError> {
    let config = Arc::new(Config::load(path)?);

    let current = CONFIG.load();
    if current.is_none()
        && CONFIG
            .compare_and_swap(current, Some(config.clone()))
            .is_none()
    {
        return Ok(config);
    }

    panic!("Unable to initialize configuration; it's already initialized!");
}

pub fn config() -> Arc<Config> {
    let cur = CONFIG.load();
    if cur.is_none() {
        warn!("Config accessed before initialization! This should only happen in tests.");
        let default = load_config(&[])
            .extract::<Config>()
            .expect("embedded default config is invalid");
        CONFIG.compare_and_swap(cur, Some(Arc::new(default)));
    } else {
        drop(cur);
    }

    CONFIG.load_full().unwrap()
}

fn load_config(paths: &[PathBuf]) -> Figment {
    // Lowest to highest priority: embedded defaults, the user config dir, brook.{yaml,toml} in
    // the working directory, files passed in `paths`, then BROOK__* environment variables
    let mut figment = Figment::from(Toml::string(DEFAULT_CONFIG));

    if let Some(config_dir) = dirs::config_dir() {
        figment = figment
            .admerge(Yaml::file(config_dir.join("brook/config.yaml")))
            .admerge(Toml::file(config_dir.join("brook/config.toml")));
    }

    figment = figment
        .admerge(Yaml::file("brook.yaml"))
        .admerge(Toml::file("brook.toml"));

    for path in paths {
        match path.extension().and_then(OsStr::to_str) {
            Some("yaml") | Some("yml") => {
                figment = figment.admerge(Yaml::file(path));
            }
            Some("json") => {
                figment = figment.admerge(Json::file(path));
            }
            _ => {
                figment = figment.admerge(Toml::file(path));
            }
        }
    }

    figment.admerge(
        Env::prefixed(BROOK_CONFIG_ENV_PREFIX)
            .map(|p| p.as_str().replace("__", ".").replace('_', "-").into()),
    )
}

/// Brook configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Windowing and lateness behavior
    pub window: WindowConfig,

    /// Which records take part in aggregation
    #[serde(default)]
    pub filter: FilterConfig,

    /// Checkpointing
    pub checkpoint: CheckpointConfig,

    /// Aggregate store writes
    pub sink: SinkConfig,

    /// Inbound feed
    pub feed: FeedConfig,

    /// Admin HTTP server
    pub admin: AdminConfig,

    /// Logging
    pub logging: LogConfig,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut paths = vec![];
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            paths.push(path.to_path_buf());
        }

        let config: Config = load_config(&paths).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// The embedded defaults, ignoring files and the environment.
    pub fn defaults() -> Self {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .extract()
            .expect("embedded default config is invalid")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.validate()?;
        self.checkpoint.validate()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LatePolicy {
    /// Late records never change state.
    #[default]
    Drop,
    /// Late records update windows that are still held in state and re-emit them; windows that
    /// have already been evicted are not reopened.
    UpdateIfWindowNotYetEvicted,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EmitMode {
    /// Only emit when a window closes.
    #[default]
    OnClose,
    /// Emit an updated, non-final aggregate after every accumulation as well.
    OnUpdate,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WindowConfig {
    /// Width of each window
    pub width: HumanReadableDuration,

    /// Distance between the starts of consecutive windows; tumbling when unset or equal to the
    /// width
    #[serde(default)]
    pub slide: Option<HumanReadableDuration>,

    /// How far behind the maximum observed event time the watermark trails
    pub allowed_lateness: HumanReadableDuration,

    /// What to do with records below the watermark
    #[serde(default)]
    pub late_policy: LatePolicy,

    /// When to emit aggregates
    #[serde(default)]
    pub emit_mode: EmitMode,

    /// Maximum number of live window accumulators per engine instance
    pub max_window_state: usize,
}

impl WindowConfig {
    pub fn slide(&self) -> Duration {
        self.slide.as_deref().copied().unwrap_or(*self.width)
    }

    pub fn is_tumbling(&self) -> bool {
        self.slide() == *self.width
    }

    /// Number of windows every record is assigned to.
    pub fn windows_per_record(&self) -> u128 {
        self.width.as_nanos().div_ceil(self.slide().as_nanos().max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width.is_zero() {
            return Err(ConfigError::InvalidWindow(
                "window width must be positive".to_string(),
            ));
        }
        if self.slide().is_zero() {
            return Err(ConfigError::InvalidWindow(
                "window slide must be positive".to_string(),
            ));
        }
        if self.slide() > *self.width {
            return Err(ConfigError::InvalidWindow(format!(
                "window slide ({:?}) may not exceed the width ({:?})",
                self.slide(),
                *self.width
            )));
        }
        if self.max_window_state == 0 {
            return Err(ConfigError::InvalidWindow(
                "max-window-state must be positive".to_string(),
            ));
        }
        // a single record must fit in window state
        if self.windows_per_record() > self.max_window_state as u128 {
            return Err(ConfigError::InvalidWindow(format!(
                "width ({:?}) / slide ({:?}) gives {} windows per record, more than \
                 max-window-state ({})",
                *self.width,
                self.slide(),
                self.windows_per_record(),
                self.max_window_state
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FilterConfig {
    /// Event types that are aggregated; all types are accepted when empty
    #[serde(default)]
    pub event_types: Vec<EventType>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CheckpointConfig {
    /// URL of an object store or filesystem for storing checkpoints
    pub url: String,

    /// Wall-clock interval between checkpoints
    pub interval: HumanReadableDuration,

    /// Additionally checkpoint after this many records have been ingested by a partition
    #[serde(default)]
    pub every_records: Option<u64>,

    /// Number of checkpoints to retain
    pub retained: usize,
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retained < 2 {
            return Err(ConfigError::InvalidCheckpoint(
                "at least two checkpoints must be retained".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidCheckpoint(
                "checkpoint interval must be positive".to_string(),
            ));
        }
        if self.every_records == Some(0) {
            return Err(ConfigError::InvalidCheckpoint(
                "every-records must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SinkConfig {
    /// Where aggregates are written; `memory` or an object store URL
    pub url: String,

    /// Number of pending aggregates that triggers a flush
    pub batch_size: usize,

    /// Maximum time an aggregate may wait before being flushed
    pub flush_interval: HumanReadableDuration,

    /// Retries for transient write failures before ingestion halts
    pub max_retries: u32,

    pub initial_backoff: HumanReadableDuration,

    pub max_backoff: HumanReadableDuration,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FeedConfig {
    /// Directory containing one `partition-<n>.jsonl` file per partition
    pub path: PathBuf,

    /// How long to wait before polling an idle partition again
    pub poll_interval: HumanReadableDuration,

    /// Maximum number of records read from a partition at once
    pub batch_size: usize,

    /// Close all windows and stop once every partition has been read to its end
    #[serde(default)]
    pub stop_at_end: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AdminConfig {
    /// Bind address for the admin HTTP server
    pub bind_address: IpAddr,

    /// Port for the admin HTTP server
    pub http_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LogConfig {
    /// Output format for log lines
    #[serde(default)]
    pub format: LogFormat,

    /// Write logs from a background thread instead of the logging task
    #[serde(default)]
    pub nonblocking: bool,

    /// Lines buffered by the nonblocking writer before new lines are dropped
    pub buffered_lines_limit: usize,

    /// Include the source line number in each log line
    #[serde(default)]
    pub enable_file_line: bool,

    /// Include the source file name in each log line
    #[serde(default)]
    pub enable_file_name: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
    Logfmt,
}

#[derive(Clone)]
pub struct HumanReadableDuration {
    duration: Duration,
    original: String,
}

impl From<Duration> for HumanReadableDuration {
    fn from(value: Duration) -> Self {
        Self {
            duration: value,
            original: format!("{}ns", value.as_nanos()),
        }
    }
}

impl Deref for HumanReadableDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.duration
    }
}

impl Debug for HumanReadableDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.original.fmt(f)
    }
}

impl Serialize for HumanReadableDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

fn duration_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(\d+)\s*([a-zA-Zµ]+)$").unwrap())
}

impl<'de> Deserialize<'de> for HumanReadableDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(deserializer)?;

        let captures = duration_regex()
            .captures(str.trim())
            .ok_or_else(|| de::Error::custom(format!("invalid duration specification '{str}'")))?;

        let n: u64 = captures[1]
            .parse()
            .map_err(|_| de::Error::custom(format!("duration out of range '{str}'")))?;
        let unit = &captures[2];

        let duration = match unit {
            "ns" | "nanos" => Duration::from_nanos(n),
            "µs" | "micros" => Duration::from_micros(n),
            "ms" | "millis" => Duration::from_millis(n),
            "s" | "secs" | "seconds" => Duration::from_secs(n),
            "m" | "mins" | "minutes" => Duration::from_secs(n * 60),
            "h" | "hrs" | "hours" => Duration::from_secs(n * 60 * 60),
            x => return Err(de::Error::custom(format!("unknown time unit '{x}'"))),
        };

        Ok(HumanReadableDuration {
            duration,
            original: str,
        })
    }
}
