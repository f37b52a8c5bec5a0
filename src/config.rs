use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;

/// Server settings, read once at startup from `SLOTWISE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last rewrite before the compactor runs.
    pub compact_threshold: u64,
    /// Business timezone; "today" and same-day lead time are judged in it.
    pub timezone: Tz,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_connections = parsed(&lookup, "SLOTWISE_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "SLOTWISE_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }
        Ok(Self {
            port: parsed(&lookup, "SLOTWISE_PORT")?.unwrap_or(5433),
            bind: lookup("SLOTWISE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("SLOTWISE_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: lookup("SLOTWISE_PASSWORD").unwrap_or_else(|| "slotwise".into()),
            max_connections,
            compact_threshold: parsed(&lookup, "SLOTWISE_COMPACT_THRESHOLD")?.unwrap_or(1000),
            timezone: parsed(&lookup, "SLOTWISE_TIMEZONE")?.unwrap_or(Tz::UTC),
            tls_cert: lookup("SLOTWISE_TLS_CERT"),
            tls_key: lookup("SLOTWISE_TLS_KEY"),
            metrics_port: parsed(&lookup, "SLOTWISE_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
