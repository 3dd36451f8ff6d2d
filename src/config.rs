use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{ServiceError, ServiceResult};

const DEFAULT_DATABASE_URL: &str = "sqlite://pos_terminal.sqlite?mode=rwc";
const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

/// Runtime configuration for the terminal's store and sync engine
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub api_base_url: String,
    /// Fixed interval between scheduled sync cycles
    pub sync_interval: Duration,
    /// Delay before the first cycle after startup
    pub warmup_delay: Duration,
    /// Maximum outbox entries submitted in one push
    pub push_batch_size: u32,
    /// Upper bound on pages fetched by a single pull
    pub max_pull_pages: u32,
    /// Rejections after which an outbox entry is dead-lettered; `None` retries forever
    pub max_push_attempts: Option<u32>,
    /// Skip pull overwrites of records that still have unsynced local edits
    pub protect_pending_local_edits: bool,
    pub request_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            sync_interval: Duration::from_secs(5 * 60),
            warmup_delay: Duration::from_secs(10),
            push_batch_size: 200,
            max_pull_pages: 1_000,
            max_push_attempts: Some(20),
            protect_pending_local_edits: true,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl CoreConfig {
    /// Build from `POS_*` environment variables, loading `.env` first.
    /// Unset variables keep their defaults.
    pub fn from_env() -> ServiceResult<Self> {
        let _ = dotenv::dotenv();
        let mut config = Self::default();

        if let Ok(url) = env::var("POS_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(url) = env::var("POS_API_BASE_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(secs) = parse_var::<u64>("POS_SYNC_INTERVAL_SECS")? {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("POS_SYNC_WARMUP_SECS")? {
            config.warmup_delay = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<u32>("POS_PUSH_BATCH_SIZE")? {
            config.push_batch_size = size;
        }
        if let Some(pages) = parse_var::<u32>("POS_MAX_PULL_PAGES")? {
            config.max_pull_pages = pages;
        }
        if let Some(attempts) = parse_var::<u32>("POS_MAX_PUSH_ATTEMPTS")? {
            // 0 disables dead-lettering
            config.max_push_attempts = if attempts == 0 { None } else { Some(attempts) };
        }
        if let Some(protect) = parse_var::<bool>("POS_PROTECT_PENDING_EDITS")? {
            config.protect_pending_local_edits = protect;
        }
        if let Some(secs) = parse_var::<u64>("POS_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.push_batch_size == 0 {
            return Err(ServiceError::Configuration("push_batch_size must be positive".to_string()));
        }
        if self.max_pull_pages == 0 {
            return Err(ServiceError::Configuration("max_pull_pages must be positive".to_string()));
        }
        if self.sync_interval.is_zero() {
            return Err(ServiceError::Configuration("sync_interval must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str) -> ServiceResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ServiceError::Configuration(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
