//! Configuration and settings management
//!
//! Loads settings from configuration files and environment variables and
//! defines tuning constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application settings loaded from files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    #[serde(default)]
    pub telegram_token: String,

    /// Base URL of the rendering service (without trailing slash)
    #[serde(default = "default_proxy_server")]
    pub proxy_server: String,
    /// Shared secret sent in the `mj-api-secret` header
    pub proxy_api_secret: Option<String>,

    /// Administrator password used to seed the credential file on first start
    #[serde(default = "default_admin_password")]
    pub admin_password: String,

    /// Daily allotment of quota-consuming jobs per identity
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Length of the access window granted to a new identity, in days
    #[serde(default = "default_access_window_days")]
    pub access_window_days: i64,

    /// Prefix of administrative commands
    #[serde(default = "default_trigger_prefix")]
    pub trigger_prefix: String,

    /// Seconds between reconciliation passes
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds a submitted job stays tracked without a terminal status
    #[serde(default = "default_task_ttl_secs")]
    pub task_ttl_secs: u64,
    /// Seconds a `/describe` or `/img2img` waits for its image
    #[serde(default = "default_pending_command_ttl_secs")]
    pub pending_command_ttl_secs: u64,
    /// Timeout for calls to the rendering service
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Directory holding the roll, ledger and credential files
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Check names against the contact directory before adding roll entries
    #[serde(default)]
    pub validate_roll_names: bool,

    /// Seconds between two access-denied replies to the same identity
    #[serde(default = "default_denial_cooldown_secs")]
    pub denial_cooldown_secs: u64,
}

fn default_proxy_server() -> String {
    "http://127.0.0.1:8080/mj".to_string()
}

fn default_admin_password() -> String {
    "12345678".to_string()
}

const fn default_daily_limit() -> u32 {
    10
}

const fn default_access_window_days() -> i64 {
    30
}

fn default_trigger_prefix() -> String {
    "$".to_string()
}

const fn default_poll_interval_secs() -> u64 {
    10
}

const fn default_task_ttl_secs() -> u64 {
    60 * 60
}

const fn default_pending_command_ttl_secs() -> u64 {
    60 * 60
}

const fn default_http_timeout_secs() -> u64 {
    30
}

fn default_data_dir() -> String {
    "data".to_string()
}

const fn default_denial_cooldown_secs() -> u64 {
    UNAUTHORIZED_COOLDOWN_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            telegram_token: String::new(),
            proxy_server: default_proxy_server(),
            proxy_api_secret: None,
            admin_password: default_admin_password(),
            daily_limit: default_daily_limit(),
            access_window_days: default_access_window_days(),
            trigger_prefix: default_trigger_prefix(),
            poll_interval_secs: default_poll_interval_secs(),
            task_ttl_secs: default_task_ttl_secs(),
            pending_command_ttl_secs: default_pending_command_ttl_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            data_dir: default_data_dir(),
            validate_roll_names: false,
            denial_cooldown_secs: default_denial_cooldown_secs(),
        }
    }
}

/// Build the layered configuration source.
///
/// # Errors
///
/// Returns a `ConfigError` if a present source cannot be read.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        // Start off by merging in the "default" configuration file
        .add_source(File::with_name("config/default").required(false))
        // Add in the current environment file
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Add in a local configuration file
        // This file shouldn't be checked into git
        .add_source(File::with_name("config/local").required(false))
        // Add in settings from the environment (with a prefix of APP)
        // Eg.. `APP__DAILY_LIMIT=5 ./target/app` would set the `daily_limit` key
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Plain environment variables; empty values are treated as unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use imagine_gateway::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        build_config()?.try_deserialize()
    }

    /// Path of the Roll Store file
    #[must_use]
    pub fn roll_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("roll.json")
    }

    /// Path of the Quota Ledger file
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("quota.json")
    }

    /// Path of the administrator credential file
    #[must_use]
    pub fn auth_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("auth.json")
    }

    /// Interval between reconciliation passes
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Time-to-live of a tracked job
    #[must_use]
    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    /// Time-to-live of a pending image command
    #[must_use]
    pub fn pending_command_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_command_ttl_secs)
    }

    /// Timeout of rendering service calls
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Whether the administrator password is still the shipped default
    #[must_use]
    pub fn uses_default_password(&self) -> bool {
        self.admin_password == default_admin_password()
    }
}

/// Initial delay before retrying a failed Telegram call
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Upper bound of the retry delay
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 8_000;
/// Number of retries after the first failed attempt
pub const TELEGRAM_API_MAX_RETRIES: usize = 4;

/// Cooldown period (seconds) between "Access Denied" messages for same identity.
/// Default: 20 minutes.
pub const UNAUTHORIZED_COOLDOWN_SECS: u64 = 1200;
/// Time-to-live (seconds) for denial cache entries.
/// Default: 2 hours.
pub const UNAUTHORIZED_CACHE_TTL_SECS: u64 = 7200;
/// Maximum denial cache capacity (number of entries).
pub const UNAUTHORIZED_CACHE_MAX_SIZE: u64 = 10_000;

/// Upper bound on pending image commands held at once
pub const PENDING_COMMAND_MAX_SIZE: u64 = 10_000;

/// Minimum length of an administrator password
pub const MIN_ADMIN_PASSWORD_LEN: usize = 6;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Single test so env mutations do not race with each other
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("TELEGRAM_TOKEN", "dummy_token");
        env::set_var("DAILY_LIMIT", "25");
        env::set_var("PROXY_API_SECRET", "");

        let settings = Settings::new()?;
        assert_eq!(settings.telegram_token, "dummy_token");
        assert_eq!(settings.daily_limit, 25);
        assert_eq!(settings.proxy_api_secret, None);
        assert_eq!(settings.trigger_prefix, "$");

        env::remove_var("TELEGRAM_TOKEN");
        env::remove_var("DAILY_LIMIT");
        env::remove_var("PROXY_API_SECRET");
        Ok(())
    }

    #[test]
    fn test_defaults_and_paths() {
        let settings = Settings {
            data_dir: "/var/lib/gateway".to_string(),
            poll_interval_secs: 0,
            ..Settings::default()
        };

        assert_eq!(settings.daily_limit, 10);
        assert_eq!(settings.access_window_days, 30);
        assert_eq!(settings.task_ttl(), Duration::from_secs(3600));
        // A zero interval would spin the poller
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert_eq!(
            settings.ledger_path(),
            PathBuf::from("/var/lib/gateway/quota.json")
        );
        assert!(settings.uses_default_password());
    }
}
