// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One OHLCV bucket. `timestamp` is the bucket open time in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.saturating_mul(1_000)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeParseError {
    #[error("unknown period '{value}' (expected one of 1min, 5min, 30min, 1h, 4h, 1day)")]
    UnknownPeriod { value: String },
    #[error("invalid currency pair '{value}' (expected BASE_QUOTE, e.g. LTC_USDT)")]
    InvalidPair { value: String },
    #[error("unknown output layout '{value}' (expected 'raw' or 'extended')")]
    UnknownLayout { value: String },
    #[error("unknown timezone '{value}' (expected 'utc' or 'local')")]
    UnknownTimeZone { value: String },
}

/// Candle bucket width. Only the widths the output naming scheme knows about are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Period {
    OneMin,
    FiveMin,
    ThirtyMin,
    OneHour,
    FourHour,
    OneDay,
}

impl Period {
    pub const ALL: [Period; 6] = [
        Period::OneMin,
        Period::FiveMin,
        Period::ThirtyMin,
        Period::OneHour,
        Period::FourHour,
        Period::OneDay,
    ];

    /// Label used in output file names.
    pub fn label(self) -> &'static str {
        match self {
            Period::OneMin => "1min",
            Period::FiveMin => "5min",
            Period::ThirtyMin => "30min",
            Period::OneHour => "1h",
            Period::FourHour => "4h",
            Period::OneDay => "1day",
        }
    }

    /// Interval code understood by the exchange REST API.
    pub fn interval_code(self) -> &'static str {
        match self {
            Period::OneMin => "1m",
            Period::FiveMin => "5m",
            Period::ThirtyMin => "30m",
            Period::OneHour => "1h",
            Period::FourHour => "4h",
            Period::OneDay => "1d",
        }
    }

    pub fn duration_secs(self) -> i64 {
        match self {
            Period::OneMin => 60,
            Period::FiveMin => 300,
            Period::ThirtyMin => 1_800,
            Period::OneHour => 3_600,
            Period::FourHour => 14_400,
            Period::OneDay => 86_400,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Period {
    type Err = TypeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Period::ALL
            .into_iter()
            .find(|period| period.label() == normalized || period.interval_code() == normalized)
            .ok_or_else(|| TypeParseError::UnknownPeriod {
                value: value.to_string(),
            })
    }
}

impl TryFrom<String> for Period {
    type Error = TypeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.label().to_string()
    }
}

/// Base/quote asset pair, stored upper-case (`LTC_USDT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().trim().to_ascii_uppercase(),
            quote: quote.as_ref().trim().to_ascii_uppercase(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Exchange request symbol, e.g. `LTCUSDT`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Lower-case joined symbol used in file names, e.g. `ltcusdt`.
    pub fn symbol_lower(&self) -> String {
        self.symbol().to_ascii_lowercase()
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = TypeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeParseError::InvalidPair {
            value: value.to_string(),
        };
        let (base, quote) = value
            .trim()
            .split_once(['_', '/', '-'])
            .ok_or_else(invalid)?;
        let valid_part = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid_part(base) || !valid_part(quote) {
            return Err(invalid());
        }
        Ok(CurrencyPair::new(base, quote))
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = TypeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(value: CurrencyPair) -> Self {
        value.to_string()
    }
}

/// Row layout of the partition files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OutputLayout {
    /// `timestamp,high,low,open,close,volume`, no header.
    #[default]
    Raw,
    /// vnpy-compatible rows with a header and human readable open time.
    Extended,
}

impl FromStr for OutputLayout {
    type Err = TypeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(OutputLayout::Raw),
            "extended" | "vnpy" => Ok(OutputLayout::Extended),
            _ => Err(TypeParseError::UnknownLayout {
                value: value.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for OutputLayout {
    type Error = TypeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputLayout> for String {
    fn from(value: OutputLayout) -> Self {
        match value {
            OutputLayout::Raw => "raw".to_string(),
            OutputLayout::Extended => "extended".to_string(),
        }
    }
}

/// Zone used for partition dates and human readable timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeZoneMode {
    #[default]
    Utc,
    Local,
}

impl TimeZoneMode {
    /// Wall-clock time of an epoch-seconds timestamp in this zone.
    pub fn datetime(self, timestamp: i64) -> Option<NaiveDateTime> {
        let utc = DateTime::from_timestamp(timestamp, 0)?;
        Some(match self {
            TimeZoneMode::Utc => utc.naive_utc(),
            TimeZoneMode::Local => utc.with_timezone(&Local).naive_local(),
        })
    }

    pub fn date(self, timestamp: i64) -> Option<NaiveDate> {
        self.datetime(timestamp).map(|dt| dt.date())
    }
}

impl FromStr for TimeZoneMode {
    type Err = TypeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utc" => Ok(TimeZoneMode::Utc),
            "local" => Ok(TimeZoneMode::Local),
            _ => Err(TypeParseError::UnknownTimeZone {
                value: value.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for TimeZoneMode {
    type Error = TypeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeZoneMode> for String {
    fn from(value: TimeZoneMode) -> Self {
        match value {
            TimeZoneMode::Utc => "utc".to_string(),
            TimeZoneMode::Local => "local".to_string(),
        }
    }
}
