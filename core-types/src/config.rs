// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate};
use config::{Config, ConfigError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    retry::RetryPolicy,
    types::{CurrencyPair, OutputLayout, Period, TimeZoneMode},
};

pub const DEFAULT_SETTINGS_FILE: &str = "klinefill";
pub const ENV_PREFIX: &str = "KLINEFILL";
pub const MAX_PAGE_SIZE: usize = 1_000;
const MAX_PRECISION: usize = 16;

/// Run settings, layered from an optional TOML file and `KLINEFILL_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSettings {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
    #[serde(default = "default_pair")]
    pub pair: CurrencyPair,
    #[serde(default = "default_period")]
    pub period: Period,
    /// RFC 3339 timestamp or bare `YYYY-MM-DD` date (midnight UTC).
    #[serde(default = "default_start_time")]
    pub start_time: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub layout: OutputLayout,
    #[serde(default = "default_precision")]
    pub precision: usize,
    #[serde(default)]
    pub timezone: TimeZoneMode,
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_pair() -> CurrencyPair {
    CurrencyPair::new("LTC", "USDT")
}

fn default_period() -> Period {
    Period::OneMin
}

fn default_start_time() -> String {
    "2017-12-18T00:00:00Z".to_string()
}

fn default_page_size() -> usize {
    MAX_PAGE_SIZE
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_precision() -> usize {
    8
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            rest_base_url: default_rest_base_url(),
            pair: default_pair(),
            period: default_period(),
            start_time: default_start_time(),
            page_size: default_page_size(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            output_dir: default_output_dir(),
            layout: OutputLayout::default(),
            precision: default_precision(),
            timezone: TimeZoneMode::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl BackfillSettings {
    /// Loads settings from `path` (required) or `klinefill.toml` in the working directory
    /// (optional), then applies `KLINEFILL_*` overrides. Nested keys use `__`, e.g.
    /// `KLINEFILL_RETRY__MODE=backoff`.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_SETTINGS_FILE).required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let settings: Self = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(SettingsError::InvalidPageSize {
                value: self.page_size,
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(SettingsError::InvalidPollInterval);
        }
        if self.precision > MAX_PRECISION {
            return Err(SettingsError::InvalidPrecision {
                value: self.precision,
            });
        }
        if self.exchange.is_empty() || !self.exchange.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SettingsError::InvalidExchange {
                value: self.exchange.clone(),
            });
        }
        self.start_ms()?;
        Ok(())
    }

    /// Start of the backfill as epoch milliseconds.
    pub fn start_ms(&self) -> Result<i64, SettingsError> {
        parse_start_ms(&self.start_time)
    }
}

fn parse_start_ms(value: &str) -> Result<i64, SettingsError> {
    let trimmed = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.timestamp_millis());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| SettingsError::InvalidStartTime {
            value: value.to_string(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryModeSetting {
    /// Retry forever at the poll interval.
    #[default]
    Fixed,
    /// Jittered exponential backoff with an attempt ceiling.
    Backoff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default)]
    pub mode: RetryModeSetting,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
}

fn default_max_attempts() -> usize {
    10
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_pct() -> f64 {
    0.2
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            mode: RetryModeSetting::default(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

impl RetrySettings {
    /// Backoff policy, or `None` when failed fetches retry at the fixed poll interval.
    pub fn policy(&self) -> Option<RetryPolicy> {
        match self.mode {
            RetryModeSetting::Fixed => None,
            RetryModeSetting::Backoff => Some(RetryPolicy::new(
                self.max_attempts,
                self.base_delay_ms,
                self.max_delay_ms,
                self.jitter_pct,
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid start_time '{value}' (expected RFC 3339 or YYYY-MM-DD)")]
    InvalidStartTime { value: String },
    #[error("page_size {value} out of range (1..={MAX_PAGE_SIZE})")]
    InvalidPageSize { value: usize },
    #[error("poll_interval_ms must be positive")]
    InvalidPollInterval,
    #[error("precision {value} exceeds {MAX_PRECISION}")]
    InvalidPrecision { value: usize },
    #[error("invalid exchange label '{value}'")]
    InvalidExchange { value: String },
}
