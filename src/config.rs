use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

pub const DEFAULT_LOCK_KEY: &str = "service:migrations";
pub const DEFAULT_LEASE_FOR: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MIGRATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_DB_PATH: &str = "data/migrator.db";

/// Migration manager settings. Built explicitly and handed to
/// [`crate::migrator::Manager::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorConfig {
    pub lock_key: String,
    pub lease_for: Duration,
    pub poll_interval: Duration,
    /// Bound for lock, read and record operations.
    pub op_timeout: Duration,
    /// Bound for a single migration body.
    pub migration_timeout: Duration,
    /// Return errors from `run` instead of staying up not-ready.
    pub fail_fast: bool,
    /// Followers poll until the target version appears instead of returning.
    pub wait_for_leader: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lease_for: DEFAULT_LEASE_FOR,
            poll_interval: DEFAULT_POLL_INTERVAL,
            op_timeout: DEFAULT_OP_TIMEOUT,
            migration_timeout: DEFAULT_MIGRATION_TIMEOUT,
            fail_fast: false,
            wait_for_leader: false,
        }
    }
}

impl MigratorConfig {
    /// Replace an empty lock key and zero durations with defaults.
    pub fn normalized(mut self) -> Self {
        if self.lock_key.is_empty() {
            self.lock_key = DEFAULT_LOCK_KEY.to_string();
        }
        if self.lease_for.is_zero() {
            self.lease_for = DEFAULT_LEASE_FOR;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.op_timeout.is_zero() {
            self.op_timeout = DEFAULT_OP_TIMEOUT;
        }
        if self.migration_timeout.is_zero() {
            self.migration_timeout = DEFAULT_MIGRATION_TIMEOUT;
        }
        self
    }

    /// Read `MIGRATION_*` variables from the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("MIGRATION_LOCK_KEY") {
            cfg.lock_key = v;
        }
        if let Some(v) = lookup("MIGRATION_LEASE_FOR_SECS") {
            cfg.lease_for = Duration::from_secs(parse_num("MIGRATION_LEASE_FOR_SECS", &v)?);
        }
        if let Some(v) = lookup("MIGRATION_POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(parse_num("MIGRATION_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("MIGRATION_OP_TIMEOUT_SECS") {
            cfg.op_timeout = Duration::from_secs(parse_num("MIGRATION_OP_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("MIGRATION_TIMEOUT_SECS") {
            cfg.migration_timeout = Duration::from_secs(parse_num("MIGRATION_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("MIGRATION_FAIL_FAST") {
            cfg.fail_fast = parse_bool("MIGRATION_FAIL_FAST", &v)?;
        }
        if let Some(v) = lookup("MIGRATION_WAIT_FOR_LEADER") {
            cfg.wait_for_leader = parse_bool("MIGRATION_WAIT_FOR_LEADER", &v)?;
        }

        Ok(cfg.normalized())
    }
}

/// Process-level settings for the binary: where the store lives and who we
/// are when competing for the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub db_path: PathBuf,
    /// `None` means derive one from the hostname.
    pub owner_id: Option<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            owner_id: None,
        }
    }
}

impl ServiceSettings {
    /// Read `MIGRATOR_DB_PATH` and `MIGRATOR_OWNER_ID` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        if let Some(v) = lookup("MIGRATOR_DB_PATH").filter(|v| !v.trim().is_empty()) {
            settings.db_path = PathBuf::from(v);
        }
        settings.owner_id = lookup("MIGRATOR_OWNER_ID").filter(|v| !v.trim().is_empty());
        settings
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Validation(format!("{key} must be a non-negative integer, got {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(AppError::Validation(format!("{key} must be a boolean, got {value:?}"))),
    }
}
