pub mod retry;

use alloy_primitives::U256;
use chrono::{DateTime, NaiveDate, Utc};
use config::{Environment, File};
use std::path::Path;
use tracing::info;

use crate::models::common::Config;
use crate::models::errors::ConfigError;

/// Parses a decimal or `0x`-prefixed quantity as returned by explorer APIs.
pub fn parse_quantity(value: &str) -> Option<U256> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<U256>().ok()
}

pub fn unix_to_date(timestamp: u64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(timestamp as i64, 0).map(|dt| dt.date_naive())
}

pub fn load_config<P: AsRef<Path>>(file_name: P) -> Result<Config, ConfigError> {
    let path = file_name.as_ref();
    info!("Config path: {}", path.to_string_lossy());

    // File first, then INDEXER__* environment overrides
    let mut config: Config = config::Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::with_prefix("INDEXER").separator("__"))
        .build()?
        .try_deserialize()?;

    if config.publish.admin_secret.is_none() {
        config.publish.admin_secret = std::env::var("INDEXER_ADMIN_SECRET").ok();
    }

    // Convert hyphens to underscores so chain names are usable in file names
    for chain in config.chains.iter_mut() {
        chain.chain_name = chain.chain_name.replace('-', "_");
    }

    config.validate()?;
    Ok(config)
}

pub(crate) fn strip_html(error: &str) -> String {
    // If the error contains HTML tags, extract just the text content
    if error.contains("<!doctype html>") || error.contains("<html>") {
        error
            .lines()
            .map(|line| line.trim())
            .find(|line| {
                !line.starts_with('<')
                    && !line.ends_with('>')
                    && !line.is_empty()
                    && *line != "html"
                    && *line != "body"
            })
            .unwrap_or(error)
            .to_string()
    } else {
        error.to_string()
    }
}

/// Serializes big integers as base-10 strings so consumers never see hex or lose precision.
pub mod u256_decimal {
    use alloy_primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_quantity(&raw).ok_or_else(|| D::Error::custom(format!("invalid quantity: {raw}")))
    }
}
