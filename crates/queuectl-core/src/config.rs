//! Typed accessors over the store's config key/value table, with defaults.

use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::job::{ConfigKey, JobStore};

/// Read a config value, parsed as `i64`, falling back to [`ConfigKey::default_value`].
pub async fn get_int(store: &Arc<dyn JobStore>, key: ConfigKey) -> Result<i64> {
    match store.get_config(key).await? {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| QueueError::BadConfig(format!("{} is not an integer: {raw}", key.as_str()))),
        None => Ok(key.default_value()),
    }
}

/// Validate and persist a config value.
pub async fn set_int(store: &Arc<dyn JobStore>, key: ConfigKey, value: &str) -> Result<()> {
    let parsed = value
        .parse::<i64>()
        .map_err(|_| QueueError::BadConfig(format!("{} is not an integer: {value}", key.as_str())))?;
    key.validate(parsed)?;
    store.set_config(key, value).await
}

/// The three knobs that govern retry behavior and worker polling, resolved
/// from the store (falling back to their defaults) in a single round trip.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub max_retries: i64,
    pub backoff_base_seconds: i64,
    pub poll_interval_seconds: i64,
}

impl Settings {
    pub async fn load(store: &Arc<dyn JobStore>) -> Result<Self> {
        Ok(Settings {
            max_retries: get_int(store, ConfigKey::MaxRetries).await?,
            backoff_base_seconds: get_int(store, ConfigKey::BackoffBaseSeconds).await?,
            poll_interval_seconds: get_int(store, ConfigKey::PollIntervalSeconds).await?,
        })
    }
}
