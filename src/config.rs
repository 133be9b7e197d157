//! Configuration types.
//!
//! Everything is read from `FLEET_*` environment variables. The staleness
//! thresholds and the autoscaler's capacity, hysteresis and cooldown have no
//! built-in defaults and must be set explicitly.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::registry::StalenessThresholds;

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub autoscale: AutoscaleConfig,
    pub quota: QuotaConfig,
    pub pool: PoolConfig,
    pub alerts: AlertConfig,
}

impl FleetConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            server: ServerConfig::from_lookup(&get)?,
            registry: RegistryConfig::from_lookup(&get)?,
            autoscale: AutoscaleConfig::from_lookup(&get)?,
            quota: QuotaConfig::from_lookup(&get)?,
            pool: PoolConfig::from_lookup(&get)?,
            alerts: AlertConfig::from_lookup(&get)?,
        };
        Ok(config)
    }
}

/// HTTP server, storage and credentials.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Bearer token the external scheduler presents on trigger endpoints.
    pub scheduler_token: Option<SecretString>,
    /// Bearer token for privileged pool operations.
    pub admin_token: Option<SecretString>,
    /// Run the in-process scheduler loops.
    pub run_scheduler: bool,
    /// Directory for daily-rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    fn from_lookup<F: Fn(&str) -> Option<String>>(get: &F) -> Result<Self, ConfigError> {
        Ok(Self {
            port: optional(get, "FLEET_PORT", 8080)?,
            db_path: get("FLEET_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/worker-fleet.db")),
            scheduler_token: secret(get, "FLEET_SCHEDULER_TOKEN"),
            admin_token: secret(get, "FLEET_ADMIN_TOKEN"),
            run_scheduler: optional(get, "FLEET_SCHEDULER_ENABLED", true)?,
            log_dir: get("FLEET_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Worker registry thresholds and housekeeping.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Heartbeat age below which a worker is ACTIVE.
    pub active_threshold: Duration,
    /// Heartbeat age at or above which a worker is FAILED.
    pub failed_threshold: Duration,
    /// Heartbeat age after which a record is moved to the archive.
    pub archive_after: Duration,
    /// How often today's history point is refreshed.
    pub snapshot_interval: Duration,
}

impl RegistryConfig {
    fn from_lookup<F: Fn(&str) -> Option<String>>(get: &F) -> Result<Self, ConfigError> {
        let config = Self {
            active_threshold: required_secs(
                get,
                "FLEET_ACTIVE_THRESHOLD_SECS",
                "Heartbeat age (seconds) under which a worker counts as ACTIVE.",
            )?,
            failed_threshold: required_secs(
                get,
                "FLEET_FAILED_THRESHOLD_SECS",
                "Heartbeat age (seconds) at which a worker counts as FAILED.",
            )?,
            archive_after: optional_secs(get, "FLEET_ARCHIVE_AFTER_SECS", 30 * 24 * 3600)?,
            snapshot_interval: optional_secs(get, "FLEET_HISTORY_SNAPSHOT_SECS", 3600)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.active_threshold >= self.failed_threshold {
            return Err(invalid(
                "FLEET_ACTIVE_THRESHOLD_SECS",
                "must be smaller than FLEET_FAILED_THRESHOLD_SECS",
            ));
        }
        if self.archive_after < self.failed_threshold {
            return Err(invalid(
                "FLEET_ARCHIVE_AFTER_SECS",
                "must be at least FLEET_FAILED_THRESHOLD_SECS",
            ));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> StalenessThresholds {
        StalenessThresholds {
            active: self.active_threshold,
            failed: self.failed_threshold,
        }
    }
}

/// Slack a single-flight lease keeps beyond the longest bounded wait it covers.
const LEASE_MARGIN: Duration = Duration::from_secs(10);

/// Autoscaling controller settings.
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    /// Queued jobs one worker is expected to absorb.
    pub capacity_per_worker: u64,
    pub min_workers: u32,
    pub max_workers: u32,
    /// Surplus of active workers tolerated before scaling down.
    pub hysteresis_margin: u32,
    /// Minimum time between successful scaling actions.
    pub cooldown: Duration,
    pub tick_interval: Duration,
    /// TTL of the single-flight tick lease.
    pub lock_ttl: Duration,
    /// Webhook receiving scale requests; log-only when unset.
    pub provisioner_url: Option<String>,
    pub provisioner_timeout: Duration,
}

impl AutoscaleConfig {
    fn from_lookup<F: Fn(&str) -> Option<String>>(get: &F) -> Result<Self, ConfigError> {
        let config = Self {
            capacity_per_worker: required(
                get,
                "FLEET_CAPACITY_PER_WORKER",
                "Number of queued jobs a single worker absorbs.",
            )?,
            min_workers: optional(get, "FLEET_MIN_WORKERS", 1)?,
            max_workers: optional(get, "FLEET_MAX_WORKERS", 50)?,
            hysteresis_margin: required(
                get,
                "FLEET_HYSTERESIS_MARGIN",
                "Extra active workers tolerated before scaling down.",
            )?,
            cooldown: required_secs(
                get,
                "FLEET_SCALE_COOLDOWN_SECS",
                "Seconds to wait after a scaling action before the next one.",
            )?,
            tick_interval: optional_secs(get, "FLEET_AUTOSCALE_INTERVAL_SECS", 60)?,
            lock_ttl: optional_secs(get, "FLEET_AUTOSCALE_LOCK_TTL_SECS", 120)?,
            provisioner_url: get("FLEET_PROVISIONER_URL").filter(|s| !s.trim().is_empty()),
            provisioner_timeout: optional_secs(get, "FLEET_PROVISIONER_TIMEOUT_SECS", 10)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity_per_worker == 0 {
            return Err(invalid("FLEET_CAPACITY_PER_WORKER", "must be greater than 0"));
        }
        if self.min_workers > self.max_workers {
            return Err(invalid(
                "FLEET_MIN_WORKERS",
                "must not exceed FLEET_MAX_WORKERS",
            ));
        }
        if self.lock_ttl < self.provisioner_timeout + LEASE_MARGIN {
            return Err(invalid(
                "FLEET_AUTOSCALE_LOCK_TTL_SECS",
                "must exceed FLEET_PROVISIONER_TIMEOUT_SECS by at least 10 seconds",
            ));
        }
        Ok(())
    }
}

/// Quota admission settings.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Limit given to organizations on first use.
    pub default_limit: u64,
    /// Compare-and-increment attempts before giving up under contention.
    pub max_admission_attempts: u32,
}

impl QuotaConfig {
    fn from_lookup<F: Fn(&str) -> Option<String>>(get: &F) -> Result<Self, ConfigError> {
        let config = Self {
            default_limit: optional(get, "FLEET_DEFAULT_QUOTA_LIMIT", 1000)?,
            max_admission_attempts: optional(get, "FLEET_QUOTA_MAX_ATTEMPTS", 8)?,
        };
        if config.max_admission_attempts == 0 {
            return Err(invalid("FLEET_QUOTA_MAX_ATTEMPTS", "must be greater than 0"));
        }
        if config.default_limit > i64::MAX as u64 {
            return Err(invalid("FLEET_DEFAULT_QUOTA_LIMIT", "must fit a signed 64-bit integer"));
        }
        Ok(config)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit: 1000,
            max_admission_attempts: 8,
        }
    }
}

/// Connection pool bounds and maintenance.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool maximum at startup.
    pub initial_size: u32,
    /// Lower bound accepted by `configure`.
    pub min_size: u32,
    /// Upper bound accepted by `configure`.
    pub max_size: u32,
    pub drain_timeout: Duration,
    pub snapshot_interval: Duration,
    /// Multiplier applied to peak utilization when recommending a size.
    pub headroom: f64,
    pub lock_ttl: Duration,
}

impl PoolConfig {
    fn from_lookup<F: Fn(&str) -> Option<String>>(get: &F) -> Result<Self, ConfigError> {
        let config = Self {
            initial_size: optional(get, "FLEET_POOL_SIZE", 20)?,
            min_size: optional(get, "FLEET_POOL_MIN_SIZE", 2)?,
            max_size: optional(get, "FLEET_POOL_MAX_SIZE", 200)?,
            drain_timeout: optional_secs(get, "FLEET_POOL_DRAIN_TIMEOUT_SECS", 30)?,
            snapshot_interval: optional_secs(get, "FLEET_POOL_SNAPSHOT_SECS", 60)?,
            headroom: optional(get, "FLEET_POOL_HEADROOM", 1.25)?,
            lock_ttl: optional_secs(get, "FLEET_POOL_LOCK_TTL_SECS", 120)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size == 0 || self.min_size > self.max_size {
            return Err(invalid(
                "FLEET_POOL_MIN_SIZE",
                "must be positive and not exceed FLEET_POOL_MAX_SIZE",
            ));
        }
        if !(self.min_size..=self.max_size).contains(&self.initial_size) {
            return Err(invalid(
                "FLEET_POOL_SIZE",
                "must lie within FLEET_POOL_MIN_SIZE..=FLEET_POOL_MAX_SIZE",
            ));
        }
        if !self.headroom.is_finite() || self.headroom < 1.0 {
            return Err(invalid("FLEET_POOL_HEADROOM", "must be a finite number >= 1.0"));
        }
        if self.lock_ttl < self.drain_timeout + LEASE_MARGIN {
            return Err(invalid(
                "FLEET_POOL_LOCK_TTL_SECS",
                "must exceed FLEET_POOL_DRAIN_TIMEOUT_SECS by at least 10 seconds",
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 20,
            min_size: 2,
            max_size: 200,
            drain_timeout: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(60),
            headroom: 1.25,
            lock_ttl: Duration::from_secs(120),
        }
    }
}

/// Alert engine thresholds and schedule.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Cron expression (with seconds) for the in-process scheduler.
    pub schedule: String,
    /// Trailing evaluation window, also the dedup bucket size.
    pub window: Duration,
    /// Failure ratio (0.0-1.0) above which the failure check alerts.
    pub failure_rate_threshold: f64,
    /// Completed jobs required before the failure ratio is meaningful.
    pub min_jobs: u64,
    /// Average submit-to-completion latency above which to alert.
    pub latency_threshold: Duration,
    /// Queued job count above which to alert.
    pub queue_depth_threshold: u64,
    pub webhook_url: Option<String>,
}

impl AlertConfig {
    fn from_lookup<F: Fn(&str) -> Option<String>>(get: &F) -> Result<Self, ConfigError> {
        let config = Self {
            schedule: get("FLEET_ALERT_SCHEDULE").unwrap_or_else(|| "0 */5 * * * *".to_string()),
            window: optional_secs(get, "FLEET_ALERT_WINDOW_SECS", 300)?,
            failure_rate_threshold: optional(get, "FLEET_ALERT_FAILURE_RATE", 0.1)?,
            min_jobs: optional(get, "FLEET_ALERT_MIN_JOBS", 10)?,
            latency_threshold: optional_secs(get, "FLEET_ALERT_LATENCY_SECS", 300)?,
            queue_depth_threshold: optional(get, "FLEET_ALERT_QUEUE_DEPTH", 500)?,
            webhook_url: get("FLEET_ALERT_WEBHOOK_URL").filter(|s| !s.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.as_secs() == 0 {
            return Err(invalid("FLEET_ALERT_WINDOW_SECS", "must be at least 1 second"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(invalid("FLEET_ALERT_FAILURE_RATE", "must be within 0.0..=1.0"));
        }
        cron::Schedule::from_str(&self.schedule)
            .map_err(|e| invalid("FLEET_ALERT_SCHEDULE", &format!("invalid cron: {e}")))?;
        Ok(())
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            schedule: "0 */5 * * * *".to_string(),
            window: Duration::from_secs(300),
            failure_rate_threshold: 0.1,
            min_jobs: 10,
            latency_threshold: Duration::from_secs(300),
            queue_depth_threshold: 500,
            webhook_url: None,
        }
    }
}

// ── Lookup helpers ──────────────────────────────────────────────────

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(key, &e.to_string()))
}

fn required<F, T>(get: &F, key: &str, hint: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get(key).ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })?;
    parse(key, &raw)
}

fn optional<F, T>(get: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn required_secs<F>(get: &F, key: &str, hint: &str) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    required::<F, u64>(get, key, hint).map(Duration::from_secs)
}

fn optional_secs<F>(get: &F, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(get, key, default).map(Duration::from_secs)
}

fn secret<F>(get: &F, key: &str) -> Option<SecretString>
where
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .filter(|s| !s.trim().is_empty())
        .map(SecretString::from)
}
