// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Shared candle types, run settings, and retry policy for the kline backfill tools.

pub mod config;
pub mod retry;
pub mod types;

pub use config::{BackfillSettings, RetryModeSetting, RetrySettings, SettingsError};
pub use retry::RetryPolicy;
pub use types::{Candle, CurrencyPair, OutputLayout, Period, TimeZoneMode, TypeParseError};
