use core_types::{Candle, OutputLayout, TimeZoneMode};

use crate::partition::SinkError;

const EXTENDED_HEADER: &[&str] = &[
    "open_time",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "open_interest",
];
const EXTENDED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Renders candles as CSV rows for one of the two partition file layouts.
#[derive(Debug, Clone, Copy)]
pub struct RowFormatter {
    layout: OutputLayout,
    precision: usize,
    timezone: TimeZoneMode,
}

impl RowFormatter {
    pub fn new(layout: OutputLayout, precision: usize, timezone: TimeZoneMode) -> Self {
        Self {
            layout,
            precision,
            timezone,
        }
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Header written once when a partition file is created.
    pub fn header(&self) -> Option<&'static [&'static str]> {
        match self.layout {
            OutputLayout::Raw => None,
            OutputLayout::Extended => Some(EXTENDED_HEADER),
        }
    }

    pub fn format(&self, candle: &Candle) -> Result<Vec<String>, SinkError> {
        let decimal = |value: f64| format_decimal(value, self.precision);
        match self.layout {
            OutputLayout::Raw => Ok(vec![
                candle.timestamp.to_string(),
                decimal(candle.high),
                decimal(candle.low),
                decimal(candle.open),
                decimal(candle.close),
                decimal(candle.volume),
            ]),
            OutputLayout::Extended => {
                let open_time = self
                    .timezone
                    .datetime(candle.timestamp)
                    .ok_or(SinkError::InvalidTimestamp(candle.timestamp))?;
                // open_interest stays unpopulated
                Ok(vec![
                    open_time.format(EXTENDED_TIME_FORMAT).to_string(),
                    decimal(candle.open),
                    decimal(candle.high),
                    decimal(candle.low),
                    decimal(candle.close),
                    decimal(candle.volume),
                ])
            }
        }
    }
}

/// Rounds half away from zero to `precision` places and prints the shortest decimal form.
pub fn format_decimal(value: f64, precision: usize) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let scale = 10f64.powi(precision.min(i32::MAX as usize) as i32);
    let rounded = (value * scale).round() / scale;
    let rounded = if rounded.is_finite() { rounded } else { value };
    if rounded == 0.0 {
        "0".to_string()
    } else {
        rounded.to_string()
    }
}
