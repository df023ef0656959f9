use chrono::FixedOffset;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where mark notifications go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// Emit a tracing event only.
    Log,
    /// Append one JSON line per notification to `spool_path`.
    Spool,
}

/// Which D-Bus bus to claim the service name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: defaults, then `tally.toml`, then `TALLY_*` env.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine distance below which a probe matches (strict).
    pub distance_threshold: f64,
    /// Reference timezone for calendar days, e.g. "+05:30".
    pub utc_offset: String,
    /// Helper program (argv) speaking the JSON-line embedding protocol.
    pub extractor_command: Vec<String>,
    /// Tag stored with reference embeddings, e.g. "facenet-128".
    pub extractor_model: Option<String>,
    /// Upper bound on one extraction + resolution round trip.
    pub extractor_timeout_secs: u64,
    /// Upper bound on waiting for a principal's lock.
    pub lock_timeout_secs: u64,
    pub notifier: NotifierKind,
    pub spool_path: PathBuf,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            db_path: data_dir.join("attendance.db"),
            distance_threshold: 0.35,
            utc_offset: "+00:00".to_string(),
            extractor_command: vec![
                "python3".to_string(),
                "/usr/share/tally/encode_face.py".to_string(),
            ],
            extractor_model: None,
            extractor_timeout_secs: 20,
            lock_timeout_secs: 5,
            notifier: NotifierKind::Log,
            spool_path: data_dir.join("notifications.jsonl"),
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load configuration from the config file (if any) and `TALLY_*`
    /// environment variables, then validate it.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("TALLY_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| config_dir().join("tally.toml"));

        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml_str(&text, &path)?,
            // A missing default file is fine; a missing explicit one is not.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => Self::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TALLY_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.distance_threshold = env_f64("TALLY_DISTANCE_THRESHOLD", self.distance_threshold);
        if let Ok(v) = std::env::var("TALLY_UTC_OFFSET") {
            self.utc_offset = v;
        }
        if let Ok(v) = std::env::var("TALLY_EXTRACTOR_COMMAND") {
            self.extractor_command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(v) = std::env::var("TALLY_EXTRACTOR_MODEL") {
            self.extractor_model = Some(v).filter(|v| !v.is_empty());
        }
        self.extractor_timeout_secs = env_u64("TALLY_EXTRACTOR_TIMEOUT_SECS", self.extractor_timeout_secs);
        self.lock_timeout_secs = env_u64("TALLY_LOCK_TIMEOUT_SECS", self.lock_timeout_secs);
        match std::env::var("TALLY_NOTIFIER").as_deref() {
            Ok("log") => self.notifier = NotifierKind::Log,
            Ok("spool") => self.notifier = NotifierKind::Spool,
            Ok(other) => tracing::warn!(value = other, "ignoring unknown TALLY_NOTIFIER"),
            Err(_) => {}
        }
        if let Ok(v) = std::env::var("TALLY_SPOOL_PATH") {
            self.spool_path = PathBuf::from(v);
        }
        match std::env::var("TALLY_BUS").as_deref() {
            Ok("session") => self.bus = BusKind::Session,
            Ok("system") => self.bus = BusKind::System,
            Ok(other) => tracing::warn!(value = other, "ignoring unknown TALLY_BUS"),
            Err(_) => {}
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // Degenerate pairs sit at distance 1.0, so anything above it is meaningless.
        if !(self.distance_threshold > 0.0 && self.distance_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "distance_threshold must be in (0, 1], got {}",
                self.distance_threshold
            )));
        }
        if self.extractor_command.is_empty() {
            return Err(ConfigError::Invalid("extractor_command is empty".into()));
        }
        if self.extractor_timeout_secs == 0 || self.lock_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least one second".into()));
        }
        self.reference_offset()?;
        Ok(())
    }

    /// Parsed reference timezone.
    pub fn reference_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.utc_offset
            .parse::<FixedOffset>()
            .map_err(|e| ConfigError::Invalid(format!("utc_offset {:?}: {e}", self.utc_offset)))
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
        .join("tally")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("tally")
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
