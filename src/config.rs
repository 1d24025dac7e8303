use std::env::var;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use uuid::Uuid;

use crate::{
    application::services::{manager::OutboxManagerConfig, outbox_store::OutboxStoreConfig},
    domain::{
        errors::{OutboxError, OutboxResult},
        retry::{ConstantRetryStrategy, ExponentialRetryStrategy, RetryStrategy},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    Exponential,
    Constant(Duration),
}

impl FromStr for RetryPolicy {
    type Err = OutboxError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("exponential") {
            return Ok(RetryPolicy::Exponential);
        }
        let secs = raw
            .strip_prefix("constant:")
            .and_then(|secs| secs.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .ok_or_else(|| {
                OutboxError::configuration(format!(
                    "retry strategy must be `exponential` or `constant:<secs>`, got `{raw}`"
                ))
            })?;
        Ok(RetryPolicy::Constant(Duration::from_secs(secs)))
    }
}

impl RetryPolicy {
    pub fn strategy(&self) -> OutboxResult<Arc<dyn RetryStrategy>> {
        match self {
            RetryPolicy::Exponential => Ok(Arc::new(ExponentialRetryStrategy)),
            RetryPolicy::Constant(interval) => {
                let interval = chrono::Duration::from_std(*interval).map_err(|_| {
                    OutboxError::configuration("constant retry interval is out of range")
                })?;
                Ok(Arc::new(ConstantRetryStrategy::new(interval)))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    pub name: String,
    pub timeout: Duration,
    pub max_owners: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub log_level: String,
    pub owner_id: String,
    pub retry: RetryPolicy,
    pub store: OutboxStoreConfig,
    pub manager: OutboxManagerConfig,
    /// Present only when lease gating is enabled.
    pub semaphore: Option<SemaphoreConfig>,
}

impl Config {
    pub fn try_parse() -> OutboxResult<Config> {
        let _ = dotenv();
        Self::from_lookup(|key| var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> OutboxResult<Config> {
        let env = Env(&lookup);

        let database_url = env
            .get("DATABASE_URL")
            .ok_or_else(|| OutboxError::configuration("DATABASE_URL env param is required"))?;

        let semaphore = env
            .get("OUTBOX_SEMAPHORE_NAME")
            .map(|name| -> OutboxResult<SemaphoreConfig> {
                Ok(SemaphoreConfig {
                    name,
                    timeout: env.secs("OUTBOX_SEMAPHORE_TIMEOUT_SECS", 30)?,
                    max_owners: env.positive("OUTBOX_SEMAPHORE_MAX_OWNERS", 1)?,
                })
            })
            .transpose()?;

        let config = Config {
            database_url,
            database_max_connections: env.positive("DATABASE_MAX_CONNECTIONS", 10)?,
            log_level: env.get("OUTBOX_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            owner_id: env
                .get("OUTBOX_OWNER_ID")
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            retry: env
                .get("OUTBOX_RETRY_STRATEGY")
                .map(|raw| raw.parse::<RetryPolicy>())
                .transpose()?
                .unwrap_or(RetryPolicy::Exponential),
            store: OutboxStoreConfig {
                batch_size: env.positive("OUTBOX_BATCH_SIZE", 50)?,
                max_concurrency: env.positive("OUTBOX_MAX_CONCURRENCY", 1)?,
                max_tries: env.positive("OUTBOX_MAX_TRIES", 12)?,
            },
            manager: OutboxManagerConfig {
                dispatch_frequency: env.secs("OUTBOX_DISPATCH_FREQUENCY_SECS", 3)?,
                reset_frequency: env.secs("OUTBOX_RESET_FREQUENCY_SECS", 30)?,
                reset_age: env.secs("OUTBOX_RESET_AGE_SECS", 60)?,
                cleanup_frequency: env.secs("OUTBOX_CLEANUP_FREQUENCY_SECS", 3600)?,
                cleanup_age: env.secs("OUTBOX_CLEANUP_AGE_SECS", 3600)?,
                disable_transient_dispatch: env.flag("OUTBOX_DISABLE_TRANSIENT_DISPATCH")?,
                transient_max_concurrency: env.positive("OUTBOX_TRANSIENT_MAX_CONCURRENCY", 1)?,
                transient_queue_capacity: env.positive("OUTBOX_TRANSIENT_QUEUE_CAPACITY", 1024)?,
            },
            semaphore,
        };

        config.store.validate()?;
        config.manager.validate()?;
        Ok(config)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Unset and blank values both count as absent.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> OutboxResult<T> {
        match self.get(key) {
            Some(raw) => raw.parse::<T>().map_err(|_| {
                OutboxError::configuration(format!("failed to parse {key} env param: `{raw}`"))
            }),
            None => Ok(default),
        }
    }

    fn positive<T: FromStr + PartialOrd + Default>(&self, key: &str, default: T) -> OutboxResult<T> {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(OutboxError::configuration(format!("{key} env param must be positive")));
        }
        Ok(value)
    }

    fn secs(&self, key: &str, default: u64) -> OutboxResult<Duration> {
        self.positive(key, default).map(Duration::from_secs)
    }

    fn flag(&self, key: &str) -> OutboxResult<bool> {
        match self.get(key).map(|raw| raw.to_ascii_lowercase()).as_deref() {
            None | Some("false" | "0" | "no") => Ok(false),
            Some("true" | "1" | "yes") => Ok(true),
            Some(raw) => Err(OutboxError::configuration(format!(
                "failed to parse {key} env param: `{raw}`"
            ))),
        }
    }
}
