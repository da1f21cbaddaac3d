//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::str::FromStr;

use clap::Parser;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

mod cli;

pub use cli::{CliArgs, Command, Overrides, SimulateArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quire";
const ENV_PREFIX: &str = "QUIRE";

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: CacheConfig,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(prefix) = overrides.cache_key_prefix.as_ref() {
            self.cache.key_prefix = prefix.clone();
        }
        if let Some(timeout) = overrides.cache_lock_timeout_ms {
            self.cache.lock_timeout_ms = timeout;
        }
        if let Some(capacity) = overrides.cache_memory_capacity {
            self.cache.memory_capacity = capacity;
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = validate_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }

    /// Settings as TOML, in the shape accepted by the config files.
    pub fn to_toml(&self) -> Result<String, LoadError> {
        #[derive(Serialize)]
        struct Rendered<'a> {
            logging: RenderedLogging,
            cache: &'a CacheConfig,
        }

        #[derive(Serialize)]
        struct RenderedLogging {
            level: String,
            json: bool,
        }

        let rendered = Rendered {
            logging: RenderedLogging {
                level: self.logging.level.to_string().to_lowercase(),
                json: self.logging.format == LogFormat::Json,
            },
            cache: &self.cache,
        };
        Ok(toml::to_string_pretty(&rendered)?)
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn validate_cache_settings(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    non_zero(cache.entry_ttl_seconds, "cache.entry_ttl_seconds")?;
    non_zero(cache.lock_timeout_ms, "cache.lock_timeout_ms")?;
    non_zero(cache.lock_retry_interval_ms, "cache.lock_retry_interval_ms")?;
    non_zero(cache.lock_ttl_ms, "cache.lock_ttl_ms")?;
    non_zero(cache.drain_retry_initial_ms, "cache.drain_retry_initial_ms")?;
    non_zero(cache.max_touch_entities as u64, "cache.max_touch_entities")?;
    non_zero(cache.memory_capacity as u64, "cache.memory_capacity")?;

    if cache.drain_retry_max_ms < cache.drain_retry_initial_ms {
        return Err(LoadError::invalid(
            "cache.drain_retry_max_ms",
            "must not be smaller than cache.drain_retry_initial_ms",
        ));
    }
    if cache.lock_ttl_ms < cache.lock_timeout_ms {
        return Err(LoadError::invalid(
            "cache.lock_ttl_ms",
            "must not be smaller than cache.lock_timeout_ms",
        ));
    }
    if cache.key_prefix.chars().any(char::is_whitespace) {
        return Err(LoadError::invalid(
            "cache.key_prefix",
            "must not contain whitespace",
        ));
    }

    Ok(cache)
}

fn non_zero(value: u64, key: &'static str) -> Result<(), LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}
