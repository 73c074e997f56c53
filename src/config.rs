use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::EngineConfig;
use crate::model::MINUTE_MS;

const ENV_PREFIX: &str = "TABLETIME_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}: cannot parse {value:?}")]
    Invalid { name: String, value: String },
    #[error("both TABLETIME_TLS_CERT and TABLETIME_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read from `TABLETIME_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub cancellation_lead_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "tabletime".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            cancellation_lead_minutes: 120,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let defaults = Config::default();

        let config = Config {
            port: parsed(&var, "PORT")?.unwrap_or(defaults.port),
            bind: var("BIND").unwrap_or(defaults.bind),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: var("PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&var, "MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&var, "COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&var, "METRICS_PORT")?,
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
            cancellation_lead_minutes: parsed(&var, "CANCELLATION_LEAD_MINUTES")?
                .unwrap_or(defaults.cancellation_lead_minutes),
        };

        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }
        if config.max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: format!("{ENV_PREFIX}MAX_CONNECTIONS"),
                value: "0".into(),
            });
        }
        if config.cancellation_lead_minutes < 0 {
            return Err(ConfigError::Invalid {
                name: format!("{ENV_PREFIX}CANCELLATION_LEAD_MINUTES"),
                value: config.cancellation_lead_minutes.to_string(),
            });
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("tabletime.wal")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cancellation_lead_ms: self.cancellation_lead_minutes * MINUTE_MS,
            ..EngineConfig::default()
        }
    }
}

fn parsed<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            name: format!("{ENV_PREFIX}{name}"),
            value,
        }),
    }
}
