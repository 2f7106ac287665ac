//! Worker settings loaded from the environment.

use core_config::{
    database::DatabaseConfig, env_or_default, env_parse, env_required, redis::RedisConfig,
    server::ServerConfig, ConfigError, FromEnv,
};
use std::num::{NonZeroU64, NonZeroUsize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub queue_name: String,
    pub max_concurrent_calls: usize,
    pub max_lock_renewal: Duration,
    pub max_delivery_count: u32,
    pub booking_system_url: String,
    pub booking_timeout: Duration,
    pub file_output_path: PathBuf,
    pub dlq_alert_threshold: u64,
    /// Six-field cron expression (seconds first)
    pub dlq_monitor_cron: String,
}

impl FromEnv for WorkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            redis: RedisConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            server: ServerConfig::from_env()?,
            queue_name: env_or_default("POLICY_QUEUE_NAME", "policy-processing-queue"),
            max_concurrent_calls: nonzero_count("MAX_CONCURRENT_CALLS", 10)?,
            max_lock_renewal: Duration::from_secs(env_parse("MAX_LOCK_RENEWAL_SECS", 300)?),
            max_delivery_count: env_parse("MAX_DELIVERY_COUNT", 3)?,
            booking_system_url: env_required("BOOKING_SYSTEM_URL")?,
            booking_timeout: nonzero_secs("BOOKING_TIMEOUT_SECS", 10)?,
            file_output_path: PathBuf::from(env_or_default("FILE_OUTPUT_PATH", "./outbound")),
            dlq_alert_threshold: env_parse("DLQ_ALERT_THRESHOLD", 10)?,
            dlq_monitor_cron: env_or_default("DLQ_MONITOR_CRON", "0 */15 * * * *"),
        })
    }
}

/// Zero is rejected as a parse error
fn nonzero_secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    let default = NonZeroU64::new(default).unwrap_or(NonZeroU64::MIN);
    Ok(Duration::from_secs(env_parse(key, default)?.get()))
}

fn nonzero_count(key: &str, default: usize) -> Result<usize, ConfigError> {
    let default = NonZeroUsize::new(default).unwrap_or(NonZeroUsize::MIN);
    Ok(env_parse(key, default)?.get())
}
