//! Runtime configuration.
//!
//! Each value is taken from the environment first, then from the OS
//! credential store (see [`crate::storage`]), then from its default.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use zeroize::Zeroizing;

use crate::diagnostics;
use crate::queue::QueueSettings;
use crate::storage;

pub const ENV_SUPABASE_URL: &str = "QUEUE_SUPABASE_URL";
pub const ENV_SUPABASE_ANON_KEY: &str = "QUEUE_SUPABASE_ANON_KEY";
pub const ENV_SMS_WEBHOOK_URL: &str = "QUEUE_SMS_WEBHOOK_URL";
pub const ENV_DATABASE_PATH: &str = "QUEUE_DATABASE_PATH";
pub const ENV_VEHICLE_DEBOUNCE_MS: &str = "QUEUE_VEHICLE_DEBOUNCE_MS";
pub const ENV_CATALOG_DEBOUNCE_MS: &str = "QUEUE_CATALOG_DEBOUNCE_MS";
pub const ENV_COMPLETION_MAX_RETRIES: &str = "QUEUE_COMPLETION_MAX_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "QUEUE_RETRY_DELAY_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "QUEUE_POLL_INTERVAL_MS";

const DEFAULT_VEHICLE_DEBOUNCE_MS: u64 = 500;
const DEFAULT_CATALOG_DEBOUNCE_MS: u64 = 1000;
const DEFAULT_COMPLETION_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

#[derive(Clone)]
pub struct Config {
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<Zeroizing<String>>,
    pub sms_webhook_url: Option<String>,
    pub database_path: PathBuf,
    pub vehicle_debounce_ms: u64,
    pub catalog_debounce_ms: u64,
    pub completion_max_retries: u32,
    pub retry_delay_ms: u64,
    pub poll_interval_ms: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("supabase_url", &self.supabase_url)
            .field("supabase_anon_key", &self.supabase_anon_key.as_ref().map(|_| "<redacted>"))
            .field("sms_webhook_url", &self.sms_webhook_url)
            .field("database_path", &self.database_path)
            .field("vehicle_debounce_ms", &self.vehicle_debounce_ms)
            .field("catalog_debounce_ms", &self.catalog_debounce_ms)
            .field("completion_max_retries", &self.completion_max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            sms_webhook_url: None,
            database_path: diagnostics::data_dir().join("queue.db"),
            vehicle_debounce_ms: DEFAULT_VEHICLE_DEBOUNCE_MS,
            catalog_debounce_ms: DEFAULT_CATALOG_DEBOUNCE_MS,
            completion_max_retries: DEFAULT_COMPLETION_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(env: &str, raw: Option<String>, default: T) -> T {
    let Some(raw) = non_empty(raw) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(var = env, value = %raw, "invalid numeric setting, using default");
            default
        }
    }
}

impl Config {
    /// Resolve from the process environment and the OS keyring.
    pub fn load() -> Self {
        Self::from_sources(|name| std::env::var(name).ok(), storage::get_credential)
    }

    /// Resolve from explicit lookups: `env` by variable name, `secrets` by
    /// keyring key.
    pub fn from_sources(
        env: impl Fn(&str) -> Option<String>,
        secrets: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let layered = |var: &str, key: &str| non_empty(env(var)).or_else(|| non_empty(secrets(key)));
        let defaults = Self::default();

        Self {
            supabase_url: layered(ENV_SUPABASE_URL, storage::KEY_SUPABASE_URL),
            supabase_anon_key: layered(ENV_SUPABASE_ANON_KEY, storage::KEY_SUPABASE_ANON_KEY)
                .map(Zeroizing::new),
            sms_webhook_url: layered(ENV_SMS_WEBHOOK_URL, storage::KEY_SMS_WEBHOOK_URL),
            database_path: non_empty(env(ENV_DATABASE_PATH))
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            vehicle_debounce_ms: parse_number(
                ENV_VEHICLE_DEBOUNCE_MS,
                env(ENV_VEHICLE_DEBOUNCE_MS),
                defaults.vehicle_debounce_ms,
            ),
            catalog_debounce_ms: parse_number(
                ENV_CATALOG_DEBOUNCE_MS,
                env(ENV_CATALOG_DEBOUNCE_MS),
                defaults.catalog_debounce_ms,
            ),
            completion_max_retries: parse_number(
                ENV_COMPLETION_MAX_RETRIES,
                env(ENV_COMPLETION_MAX_RETRIES),
                defaults.completion_max_retries,
            ),
            retry_delay_ms: parse_number(
                ENV_RETRY_DELAY_MS,
                env(ENV_RETRY_DELAY_MS),
                defaults.retry_delay_ms,
            ),
            poll_interval_ms: parse_number(
                ENV_POLL_INTERVAL_MS,
                env(ENV_POLL_INTERVAL_MS),
                defaults.poll_interval_ms,
            ),
        }
    }

    /// Both the URL and the key are needed to talk to the hosted database.
    pub fn remote(&self) -> Option<(&str, Zeroizing<String>)> {
        match (&self.supabase_url, &self.supabase_anon_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key.clone())),
            _ => None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl From<&Config> for QueueSettings {
    fn from(config: &Config) -> Self {
        Self {
            vehicle_debounce: Duration::from_millis(config.vehicle_debounce_ms),
            catalog_debounce: Duration::from_millis(config.catalog_debounce_ms),
            completion_max_retries: config.completion_max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}
