//! Runtime configuration, loaded from environment variables.
//!
//! Every knob has a default; unparseable values fall back to it rather than
//! aborting startup.

use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ROOM: &str = "default";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_PARTICIPANT_LABEL: &str = "authority";
const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 250;
const DEFAULT_PERSIST_RETRIES: usize = 3;
const DEFAULT_PERSIST_RETRY_BASE_MS: u64 = 50;
const DEFAULT_DELETE_VERIFY_ATTEMPTS: usize = 3;
const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

/// Retry and debounce knobs for the persistence gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistConfig {
    /// Quiet period before dirty buckets are saved.
    pub debounce: Duration,
    /// Attempts per durable write, including the first.
    pub retries: usize,
    /// Linear back-off step between attempts.
    pub retry_base: Duration,
    /// Delete-then-verify rounds before giving up.
    pub delete_verify_attempts: usize,
}

impl PersistConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            debounce: Duration::from_millis(env_parse("SAVE_DEBOUNCE_MS", DEFAULT_SAVE_DEBOUNCE_MS)),
            retries: env_parse("PERSIST_RETRIES", DEFAULT_PERSIST_RETRIES).max(1),
            retry_base: Duration::from_millis(env_parse("PERSIST_RETRY_BASE_MS", DEFAULT_PERSIST_RETRY_BASE_MS)),
            delete_verify_attempts: env_parse("DELETE_VERIFY_ATTEMPTS", DEFAULT_DELETE_VERIFY_ATTEMPTS).max(1),
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_SAVE_DEBOUNCE_MS),
            retries: DEFAULT_PERSIST_RETRIES,
            retry_base: Duration::from_millis(DEFAULT_PERSIST_RETRY_BASE_MS),
            delete_verify_attempts: DEFAULT_DELETE_VERIFY_ATTEMPTS,
        }
    }
}

/// Process configuration for the relay and the embedded authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub room: String,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Remote relay for the authority; the in-process hub when unset.
    pub relay_url: Option<String>,
    pub participant_label: String,
    pub client_queue_capacity: usize,
    pub persist: PersistConfig,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            room: env_string("ROOM").unwrap_or_else(|| DEFAULT_ROOM.to_owned()),
            database_url: env_string("DATABASE_URL"),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            relay_url: env_string("RELAY_URL"),
            participant_label: env_string("PARTICIPANT_LABEL").unwrap_or_else(|| DEFAULT_PARTICIPANT_LABEL.to_owned()),
            client_queue_capacity: env_parse("CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY).max(1),
            persist: PersistConfig::from_env(),
        }
    }
}

/// Parse `key` as `T`, or return `default` when missing or malformed.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Non-empty string value of `key`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
