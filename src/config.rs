use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub data_dir: PathBuf,
    pub cache: CacheConfig,
    pub compression: CompressionConfig,
    pub local: LocalStoreConfig,
    pub remote: RemoteConfig,
    pub autosave: AutoSaveConfig,
    pub facade: FacadeConfig,
    pub account: AccountConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            cache: CacheConfig::from_env(),
            compression: CompressionConfig::from_env(),
            local: LocalStoreConfig::from_env(),
            remote: RemoteConfig::from_env(),
            autosave: AutoSaveConfig::from_env(),
            facade: FacadeConfig::from_env(),
            account: AccountConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.enabled && self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::Missing { key: "REMOTE_API_URL" });
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid {
                key: "CACHE_MAX_ENTRIES",
                reason: "must be greater than zero",
            });
        }
        if !(0.0..=1.0).contains(&self.compression.target_ratio) {
            return Err(ConfigError::Invalid {
                key: "COMPRESSION_TARGET_RATIO",
                reason: "must be within 0.0..=1.0",
            });
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: PathBuf::from("./data"),
            cache: CacheConfig::default(),
            compression: CompressionConfig::default(),
            local: LocalStoreConfig::default(),
            remote: RemoteConfig::default(),
            autosave: AutoSaveConfig::default(),
            facade: FacadeConfig::default(),
            account: AccountConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_size_bytes: usize,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_size_bytes: 5 * 1024 * 1024,
            default_ttl: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: env_usize("CACHE_MAX_ENTRIES", defaults.max_entries),
            max_size_bytes: env_usize("CACHE_MAX_SIZE_BYTES", defaults.max_size_bytes),
            default_ttl: env_duration_ms("CACHE_DEFAULT_TTL_MS", defaults.default_ttl),
            cleanup_interval: env_duration_ms("CACHE_CLEANUP_INTERVAL_MS", defaults.cleanup_interval),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Payloads below this size are stored as-is.
    pub min_size_bytes: usize,
    /// compressed/original must be strictly below this to keep the compressed form.
    pub target_ratio: f64,
    pub max_compress_time: Duration,
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 1024,
            target_ratio: 0.9,
            max_compress_time: Duration::from_millis(50),
            level: 6,
        }
    }
}

impl CompressionConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("COMPRESSION_ENABLED", defaults.enabled),
            min_size_bytes: env_usize("COMPRESSION_MIN_SIZE_BYTES", defaults.min_size_bytes),
            target_ratio: env_f64("COMPRESSION_TARGET_RATIO", defaults.target_ratio),
            max_compress_time: env_duration_ms("COMPRESSION_MAX_TIME_MS", defaults.max_compress_time),
            level: env_u32("COMPRESSION_LEVEL", defaults.level).min(9),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalStoreConfig {
    /// `None` keeps the local tier in memory.
    pub path: Option<PathBuf>,
}

impl LocalStoreConfig {
    fn from_env() -> Self {
        Self {
            path: std::env::var("LOCAL_STORE_PATH").ok().map(PathBuf::from),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub base_url: String,
    pub user_id: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub allow_local_fallback: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            user_id: None,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            base_retry_delay: Duration::from_millis(500),
            allow_local_fallback: true,
        }
    }
}

impl RemoteConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("REMOTE_STORAGE_ENABLED", defaults.enabled),
            base_url: std::env::var("REMOTE_API_URL").unwrap_or_default(),
            user_id: std::env::var("REMOTE_USER_ID").ok().filter(|v| !v.is_empty()),
            timeout: env_duration_ms("REMOTE_TIMEOUT_MS", defaults.timeout),
            max_retries: env_u32("REMOTE_MAX_RETRIES", defaults.max_retries),
            base_retry_delay: env_duration_ms("REMOTE_RETRY_BASE_DELAY_MS", defaults.base_retry_delay),
            allow_local_fallback: env_bool("REMOTE_LOCAL_FALLBACK", defaults.allow_local_fallback),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSaveConfig {
    pub enabled: bool,
    pub save_interval: Duration,
    pub idle_threshold: Duration,
    pub max_pending_changes: usize,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            save_interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(5),
            max_pending_changes: 50,
        }
    }
}

impl AutoSaveConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("AUTOSAVE_ENABLED", defaults.enabled),
            save_interval: env_duration_ms("AUTOSAVE_INTERVAL_MS", defaults.save_interval),
            idle_threshold: env_duration_ms("AUTOSAVE_IDLE_MS", defaults.idle_threshold),
            max_pending_changes: env_usize("AUTOSAVE_MAX_PENDING", defaults.max_pending_changes).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FacadeConfig {
    pub progress_ttl: Duration,
    pub summary_ttl: Duration,
    pub analytics_ttl: Duration,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            progress_ttl: Duration::from_secs(5 * 60),
            summary_ttl: Duration::from_secs(60),
            analytics_ttl: Duration::from_secs(30),
        }
    }
}

impl FacadeConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            progress_ttl: env_duration_ms("FACADE_PROGRESS_TTL_MS", defaults.progress_ttl),
            summary_ttl: env_duration_ms("FACADE_SUMMARY_TTL_MS", defaults.summary_ttl),
            analytics_ttl: env_duration_ms("FACADE_ANALYTICS_TTL_MS", defaults.analytics_ttl),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub link_code_ttl: Duration,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            link_code_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl AccountConfig {
    fn from_env() -> Self {
        let secs = env_u64("LINK_CODE_TTL_SECS", Self::default().link_code_ttl.as_secs());
        Self {
            link_code_ttl: Duration::from_secs(secs.max(60)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required env var: {key}")]
    Missing { key: &'static str },
    #[error("Invalid value for {key}: {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_u64(key, default.as_millis() as u64))
}
