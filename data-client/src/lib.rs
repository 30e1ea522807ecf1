// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Kline provider seam and the Binance REST implementation.

mod binance;

pub use binance::{decode_klines, BinanceClient, BinanceClientConfig};

use std::sync::Arc;

use core_types::{Candle, CurrencyPair, Period};
use thiserror::Error;

/// One page fetch against a candle provider.
///
/// Implementations return candles with `timestamp >= since_ms / 1000`, ascending, at most
/// `limit` long. Any failure is reported as an error; partial pages are never returned.
#[async_trait::async_trait]
pub trait KlineSource: Send + Sync {
    async fn fetch_klines(
        &self,
        pair: &CurrencyPair,
        period: Period,
        limit: usize,
        since_ms: i64,
    ) -> Result<Vec<Candle>, SourceError>;
}

#[async_trait::async_trait]
impl<T: KlineSource + ?Sized> KlineSource for Arc<T> {
    async fn fetch_klines(
        &self,
        pair: &CurrencyPair,
        period: Period,
        limit: usize,
        since_ms: i64,
    ) -> Result<Vec<Candle>, SourceError> {
        (**self).fetch_klines(pair, period, limit, since_ms).await
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("provider error {code} (http {status}): {message}")]
    Provider {
        status: u16,
        code: i64,
        message: String,
    },
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid proxy url '{url}': {source}")]
    Proxy {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}
