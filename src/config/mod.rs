//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheKind;
use crate::catalog::TableFilter;
use crate::listener::ddl::MAX_CHUNK_SIZE;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "featuretag";
const ENV_PREFIX: &str = "FEATURETAG";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_NAIVE_CAPACITY: usize = 1000;
const DEFAULT_REDIS_POOL_SIZE: usize = 8;
const DEFAULT_REDIS_TIMEOUT_MS: u64 = 2000;
const DEFAULT_REDIS_KEY_PREFIX: &str = "featuretag";
const DEFAULT_TEMP_SCHEMA: &str = "featuretag_cdc";
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_CHUNK_SIZE: u32 = 1000;

/// Command-line arguments for the featuretag binary.
#[derive(Debug, Parser)]
#[command(
    name = "featuretag",
    version,
    about = "Etag cache kept in step with PostGIS tables through LISTEN/NOTIFY"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FEATURETAG_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Install triggers and keep the etag cache current until stopped.
    Serve(Box<ServeArgs>),
    /// Drop notify triggers and the notification schema left by a crashed run.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the notification schema to remove.
    #[arg(long = "listener-temp-schema", value_name = "SCHEMA")]
    pub temp_schema: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the cache backend (disabled|naive|redis).
    #[arg(long = "cache-kind", value_name = "KIND")]
    pub cache_kind: Option<String>,

    /// Override the initial capacity of the in-process cache.
    #[arg(long = "cache-naive-capacity", value_name = "COUNT")]
    pub cache_naive_capacity: Option<usize>,

    /// Override the Redis URL.
    #[arg(long = "cache-redis-url", value_name = "URL")]
    pub cache_redis_url: Option<String>,

    /// Enable or disable the change listener.
    #[arg(
        long = "listener-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub listener_enabled: Option<bool>,

    /// Override the notification schema.
    #[arg(long = "listener-temp-schema", value_name = "SCHEMA")]
    pub listener_temp_schema: Option<String>,

    /// Override the notification wait timeout.
    #[arg(long = "listener-wait-timeout-ms", value_name = "MILLIS")]
    pub listener_wait_timeout_ms: Option<u64>,

    /// Override the notification page size in characters.
    #[arg(long = "listener-chunk-size", value_name = "CHARS")]
    pub listener_chunk_size: Option<u32>,

    /// Only install triggers on these schemas or tables (comma separated).
    #[arg(long = "catalog-include", value_name = "NAMES", value_delimiter = ',')]
    pub catalog_include: Option<Vec<String>>,

    /// Never install triggers on these schemas or tables (comma separated).
    #[arg(long = "catalog-exclude", value_name = "NAMES", value_delimiter = ',')]
    pub catalog_exclude: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub listener: ListenerSettings,
    pub catalog: CatalogSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub kind: CacheKind,
    pub naive_capacity: usize,
    pub redis_url: Option<String>,
    pub redis_password: Option<String>,
    pub redis_pool_size: NonZeroUsize,
    pub redis_timeout: Duration,
    pub redis_key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub enabled: bool,
    pub temp_schema: String,
    pub wait_timeout: Duration,
    pub chunk_size: NonZeroU32,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogSettings {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl CatalogSettings {
    pub fn filter(&self) -> TableFilter {
        TableFilter::new(&self.include, &self.exclude)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
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

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("catalog.include")
            .with_list_parse_key("catalog.exclude"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Cleanup(args)) => raw.apply_cleanup_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    listener: RawListenerSettings,
    catalog: RawCatalogSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(kind) = overrides.cache_kind.as_ref() {
            self.cache.kind = Some(kind.clone());
        }
        if let Some(capacity) = overrides.cache_naive_capacity {
            self.cache.naive_capacity = Some(capacity);
        }
        if let Some(url) = overrides.cache_redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(enabled) = overrides.listener_enabled {
            self.listener.enabled = Some(enabled);
        }
        if let Some(schema) = overrides.listener_temp_schema.as_ref() {
            self.listener.temp_schema = Some(schema.clone());
        }
        if let Some(timeout) = overrides.listener_wait_timeout_ms {
            self.listener.wait_timeout_ms = Some(timeout);
        }
        if let Some(chunk) = overrides.listener_chunk_size {
            self.listener.chunk_size = Some(chunk);
        }
        if let Some(include) = overrides.catalog_include.as_ref() {
            self.catalog.include = Some(include.clone());
        }
        if let Some(exclude) = overrides.catalog_exclude.as_ref() {
            self.catalog.exclude = Some(exclude.clone());
        }
    }

    fn apply_cleanup_overrides(&mut self, args: &CleanupArgs) {
        self.apply_database_override(&args.database);
        if let Some(schema) = args.temp_schema.as_ref() {
            self.listener.temp_schema = Some(schema.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
            listener,
            catalog,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache)?;
        let listener = build_listener_settings(listener)?;
        let catalog = build_catalog_settings(catalog);

        Ok(Self {
            logging,
            database,
            cache,
            listener,
            catalog,
        })
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

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_empty(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let kind = match cache.kind {
        Some(kind) => {
            CacheKind::from_str(&kind).map_err(|reason| LoadError::invalid("cache.kind", reason))?
        }
        None => CacheKind::Disabled,
    };

    let redis_url = non_empty(cache.redis_url);
    if kind == CacheKind::Redis && redis_url.is_none() {
        return Err(LoadError::invalid(
            "cache.redis_url",
            "required when cache.kind is redis",
        ));
    }

    let redis_pool_size = NonZeroUsize::new(cache.redis_pool_size.unwrap_or(DEFAULT_REDIS_POOL_SIZE))
        .ok_or_else(|| LoadError::invalid("cache.redis_pool_size", "must be greater than zero"))?;

    let timeout_ms = cache.redis_timeout_ms.unwrap_or(DEFAULT_REDIS_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.redis_timeout_ms",
            "must be greater than zero",
        ));
    }

    let redis_key_prefix = cache
        .redis_key_prefix
        .map(|prefix| prefix.trim().to_string())
        .unwrap_or_else(|| DEFAULT_REDIS_KEY_PREFIX.to_string());
    if redis_key_prefix.is_empty() {
        return Err(LoadError::invalid(
            "cache.redis_key_prefix",
            "must not be empty",
        ));
    }

    Ok(CacheSettings {
        kind,
        naive_capacity: cache.naive_capacity.unwrap_or(DEFAULT_NAIVE_CAPACITY),
        redis_url,
        redis_password: non_empty(cache.redis_password),
        redis_pool_size,
        redis_timeout: Duration::from_millis(timeout_ms),
        redis_key_prefix,
    })
}

fn build_listener_settings(listener: RawListenerSettings) -> Result<ListenerSettings, LoadError> {
    let temp_schema = listener
        .temp_schema
        .map(|schema| schema.trim().to_string())
        .unwrap_or_else(|| DEFAULT_TEMP_SCHEMA.to_string());
    if temp_schema.is_empty() {
        return Err(LoadError::invalid(
            "listener.temp_schema",
            "must not be empty",
        ));
    }

    let wait_ms = listener.wait_timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
    if wait_ms == 0 {
        return Err(LoadError::invalid(
            "listener.wait_timeout_ms",
            "must be greater than zero",
        ));
    }

    let chunk_size = non_zero_u32(
        listener.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).into(),
        "listener.chunk_size",
    )?;
    if chunk_size.get() > MAX_CHUNK_SIZE {
        return Err(LoadError::invalid(
            "listener.chunk_size",
            format!("must be at most {MAX_CHUNK_SIZE} to fit one notification"),
        ));
    }

    Ok(ListenerSettings {
        enabled: listener.enabled.unwrap_or(true),
        temp_schema,
        wait_timeout: Duration::from_millis(wait_ms),
        chunk_size,
    })
}

fn build_catalog_settings(catalog: RawCatalogSettings) -> CatalogSettings {
    CatalogSettings {
        include: catalog.include.unwrap_or_default(),
        exclude: catalog.exclude.unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    kind: Option<String>,
    naive_capacity: Option<usize>,
    redis_url: Option<String>,
    redis_password: Option<String>,
    redis_pool_size: Option<usize>,
    redis_timeout_ms: Option<u64>,
    redis_key_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawListenerSettings {
    enabled: Option<bool>,
    temp_schema: Option<String>,
    wait_timeout_ms: Option<u64>,
    chunk_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCatalogSettings {
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
