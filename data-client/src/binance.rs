use std::time::Duration;

use core_types::{Candle, CurrencyPair, Period};
use log::{debug, info};
use reqwest::{Client, Proxy, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::{KlineSource, SourceError};

const KLINES_PATH: &str = "/api/v3/klines";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const ERROR_BODY_LIMIT: usize = 256;

#[derive(Clone, Debug)]
pub struct BinanceClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl BinanceClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            proxy: None,
            user_agent: format!("klinefill/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|url| !url.trim().is_empty());
        self
    }
}

/// Spot kline endpoint of the Binance REST API.
pub struct BinanceClient {
    client: Client,
    base_url: Url,
}

impl BinanceClient {
    pub fn new(config: BinanceClientConfig) -> Result<Self, SourceError> {
        let base_url = Url::parse(&config.base_url)?;
        let mut builder = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout);
        if let Some(proxy_url) = config.proxy.as_deref() {
            let proxy = Proxy::all(proxy_url).map_err(|source| SourceError::Proxy {
                url: proxy_url.to_string(),
                source,
            })?;
            info!("proxy: {}", proxy_url);
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            client: builder.build()?,
            base_url,
        })
    }

    pub fn klines_url(
        &self,
        pair: &CurrencyPair,
        period: Period,
        limit: usize,
        since_ms: i64,
    ) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(KLINES_PATH);
        url.query_pairs_mut()
            .append_pair("symbol", &pair.symbol())
            .append_pair("interval", period.interval_code())
            .append_pair("limit", &limit.to_string())
            .append_pair("startTime", &since_ms.to_string());
        url
    }
}

#[async_trait::async_trait]
impl KlineSource for BinanceClient {
    async fn fetch_klines(
        &self,
        pair: &CurrencyPair,
        period: Period,
        limit: usize,
        since_ms: i64,
    ) -> Result<Vec<Candle>, SourceError> {
        let url = self.klines_url(pair, period, limit, since_ms);
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &body));
        }
        let mut candles = decode_klines(&body)?;
        candles.truncate(limit);
        Ok(candles)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

fn status_error(status: u16, body: &[u8]) -> SourceError {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(api) => SourceError::Provider {
            status,
            code: api.code,
            message: api.msg,
        },
        Err(_) => SourceError::HttpStatus {
            status,
            body: String::from_utf8_lossy(body)
                .chars()
                .take(ERROR_BODY_LIMIT)
                .collect(),
        },
    }
}

/// Decodes a `/api/v3/klines` payload: an array of
/// `[open_time_ms, open, high, low, close, volume, close_time_ms, ...]` rows with decimal strings.
pub fn decode_klines(body: &[u8]) -> Result<Vec<Candle>, SourceError> {
    let rows: Vec<Vec<Value>> = serde_json::from_slice(body)?;
    rows.iter()
        .enumerate()
        .map(|(idx, row)| decode_row(idx, row))
        .collect()
}

fn decode_row(idx: usize, row: &[Value]) -> Result<Candle, SourceError> {
    if row.len() < 6 {
        return Err(SourceError::Decode(format!(
            "kline row {idx} has {} fields, expected at least 6",
            row.len()
        )));
    }
    let open_time_ms = row[0].as_i64().ok_or_else(|| {
        SourceError::Decode(format!("kline row {idx} has non-integer open time {}", row[0]))
    })?;
    Ok(Candle {
        timestamp: open_time_ms.div_euclid(1_000),
        open: decimal_field(idx, "open", &row[1])?,
        high: decimal_field(idx, "high", &row[2])?,
        low: decimal_field(idx, "low", &row[3])?,
        close: decimal_field(idx, "close", &row[4])?,
        volume: decimal_field(idx, "volume", &row[5])?,
    })
}

fn decimal_field(idx: usize, name: &str, value: &Value) -> Result<f64, SourceError> {
    let parsed = match value {
        Value::String(text) => text.parse::<f64>().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| SourceError::Decode(format!("kline row {idx} has invalid {name} {value}")))
}
