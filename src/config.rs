use std::path::PathBuf;
use std::time::Duration;

use crate::batch::{MAX_WORKERS, MIN_WORKERS};
use crate::engine::SessionConfig;
use crate::orchestrator::OrchestratorPolicy;
use crate::quality::DEFAULT_QUALITY_FLOOR;

/// Service configuration, read from the environment (after `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    /// Minimum score for a record to be accepted
    pub quality_floor: u8,
    /// Attempts per engine before moving to the next one
    pub engine_max_attempts: u32,
    /// Linear backoff unit between attempts on the same engine
    pub retry_backoff: Duration,
    pub engine_timeout: Duration,
    pub cache_max_age: Duration,
    /// Concurrent browser sessions across a batch
    pub max_concurrent_sessions: usize,
    pub include_reviews: bool,
    pub max_reviews: usize,
    pub locale: String,
    pub chrome_path: Option<PathBuf>,
    pub retention: Duration,
    /// Six-field cron expression for the retention sweep
    pub sweep_cron: String,
    pub accept_best_effort: bool,
    pub teardown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://maps_cache.db".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            quality_floor: DEFAULT_QUALITY_FLOOR,
            engine_max_attempts: 2,
            retry_backoff: Duration::from_secs(3),
            engine_timeout: Duration::from_secs(60),
            cache_max_age: Duration::from_secs(168 * 3600),
            max_concurrent_sessions: 3,
            include_reviews: true,
            max_reviews: 20,
            locale: "en".to_string(),
            chrome_path: None,
            retention: Duration::from_secs(90 * 24 * 3600),
            sweep_cron: "0 0 3 * * *".to_string(),
            accept_best_effort: false,
            teardown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(default.database_url),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(default.bind_addr),
            quality_floor: parsed("QUALITY_FLOOR").map(|f: u8| f.min(100)).unwrap_or(default.quality_floor),
            engine_max_attempts: parsed("ENGINE_MAX_ATTEMPTS").map(|n: u32| n.max(1)).unwrap_or(default.engine_max_attempts),
            retry_backoff: parsed("RETRY_BACKOFF_SECS").map(Duration::from_secs).unwrap_or(default.retry_backoff),
            engine_timeout: parsed("ENGINE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(default.engine_timeout),
            cache_max_age: parsed("CACHE_MAX_AGE_HOURS")
                .map(|h: u64| Duration::from_secs(h * 3600))
                .unwrap_or(default.cache_max_age),
            max_concurrent_sessions: parsed("MAX_CONCURRENT_SESSIONS")
                .unwrap_or(default.max_concurrent_sessions)
                .clamp(MIN_WORKERS, MAX_WORKERS),
            include_reviews: parsed("INCLUDE_REVIEWS").unwrap_or(default.include_reviews),
            max_reviews: parsed("MAX_REVIEWS").unwrap_or(default.max_reviews),
            locale: std::env::var("MAPS_LOCALE").unwrap_or(default.locale),
            chrome_path: std::env::var("CHROME_PATH").ok().map(PathBuf::from).or(default.chrome_path),
            retention: parsed("RETENTION_DAYS")
                .map(|d: u64| Duration::from_secs(d * 24 * 3600))
                .unwrap_or(default.retention),
            sweep_cron: std::env::var("SWEEP_CRON").unwrap_or(default.sweep_cron),
            accept_best_effort: parsed("ACCEPT_BEST_EFFORT").unwrap_or(default.accept_best_effort),
            teardown_grace: parsed("TEARDOWN_GRACE_SECS").map(Duration::from_secs).unwrap_or(default.teardown_grace),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            chrome_path: self.chrome_path.clone(),
            teardown_grace: self.teardown_grace,
            ..SessionConfig::default()
        }
    }

    pub fn policy(&self) -> OrchestratorPolicy {
        OrchestratorPolicy {
            quality_floor: self.quality_floor,
            max_attempts: self.engine_max_attempts,
            retry_backoff: self.retry_backoff,
            cache_max_age: self.cache_max_age,
            accept_best_effort: self.accept_best_effort,
            locale: self.locale.clone(),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
