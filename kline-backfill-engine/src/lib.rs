mod cursor;
mod format;
mod metrics;
mod partition;
mod shutdown;

pub use cursor::Cursor;
pub use format::{format_decimal, RowFormatter};
pub use metrics::{BackfillMetrics, BackfillMetricsSnapshot};
pub use partition::{OutputSink, PartitionKey, PartitionRouter, SinkError, SinkSummary};
pub use shutdown::{spawn_interrupt_listener, ShutdownCoordinator, ShutdownState, StopReason};

use std::{path::PathBuf, sync::Arc, time::Duration};

use core_types::{
    config::MAX_PAGE_SIZE, BackfillSettings, Candle, CurrencyPair, OutputLayout, Period,
    RetryPolicy, SettingsError, TimeZoneMode,
};
use data_client::{KlineSource, SourceError};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::time::{sleep, Instant};

const DEFAULT_EXCHANGE: &str = "binance";
const DEFAULT_POLL_MS: u64 = 200;
const DEFAULT_PRECISION: usize = 8;

/// What happens after a failed page fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryMode {
    /// Retry the same cursor on the next tick, forever.
    Fixed,
    /// Jittered exponential backoff; the run fails once the policy's attempt ceiling is hit.
    Backoff(RetryPolicy),
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub label: String,
    pub exchange: String,
    pub pair: CurrencyPair,
    pub period: Period,
    pub start_ms: i64,
    pub page_size: usize,
    pub poll_interval: Duration,
    pub output_dir: PathBuf,
    pub layout: OutputLayout,
    pub precision: usize,
    pub timezone: TimeZoneMode,
    pub retry: RetryMode,
}

impl BackfillConfig {
    pub fn new(
        pair: CurrencyPair,
        period: Period,
        start_ms: i64,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label: format!("{}-{}", pair.symbol_lower(), period.label()),
            exchange: DEFAULT_EXCHANGE.to_string(),
            pair,
            period,
            start_ms,
            page_size: MAX_PAGE_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            output_dir: output_dir.into(),
            layout: OutputLayout::Raw,
            precision: DEFAULT_PRECISION,
            timezone: TimeZoneMode::Utc,
            retry: RetryMode::Fixed,
        }
    }

    pub fn from_settings(settings: &BackfillSettings) -> Result<Self, SettingsError> {
        let retry = settings
            .retry
            .policy()
            .map_or(RetryMode::Fixed, RetryMode::Backoff);
        Ok(Self::new(
            settings.pair.clone(),
            settings.period,
            settings.start_ms()?,
            settings.output_dir.clone(),
        )
        .with_exchange(settings.exchange.clone())
        .with_page_size(settings.page_size)
        .with_poll_interval(Duration::from_millis(settings.poll_interval_ms))
        .with_layout(settings.layout)
        .with_precision(settings.precision)
        .with_timezone(settings.timezone)
        .with_retry(retry))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_start_ms(mut self, start_ms: i64) -> Self {
        self.start_ms = start_ms;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_layout(mut self, layout: OutputLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_timezone(mut self, timezone: TimeZoneMode) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_retry(mut self, retry: RetryMode) -> Self {
        self.retry = retry;
        self
    }
}

/// Outcome of a run that stopped cleanly.
#[derive(Debug, Clone)]
pub struct BackfillReport {
    pub reason: StopReason,
    /// Cursor the next run would resume from.
    pub cursor_ms: i64,
    pub pages: u64,
    pub rows_written: u64,
    pub partitions: Vec<SinkSummary>,
}

/// Pages through a provider's history for one instrument and period, writing candles into
/// date-partitioned CSV files until the provider runs dry or the run is interrupted.
///
/// The poll loop is the only writer of the cursor and of the sinks. Interrupts only cancel
/// the coordinator's token; the loop notices at the top of the next tick, so a page that is
/// already in flight is always processed in full.
pub struct KlineBackfillEngine<S> {
    config: BackfillConfig,
    source: S,
    coordinator: Arc<ShutdownCoordinator>,
    metrics: Arc<BackfillMetrics>,
}

impl<S: KlineSource> KlineBackfillEngine<S> {
    pub fn new(
        config: BackfillConfig,
        source: S,
        coordinator: Arc<ShutdownCoordinator>,
        metrics: Arc<BackfillMetrics>,
    ) -> Self {
        Self {
            config,
            source,
            coordinator,
            metrics,
        }
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn metrics(&self) -> Arc<BackfillMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Runs until exhaustion, interrupt, or a fatal error. Every partition opened during the
    /// run is flushed and closed before this returns, whichever way the run ended.
    pub async fn run(&self) -> Result<BackfillReport, BackfillError> {
        if self.coordinator.state() == ShutdownState::Stopped {
            return Err(BackfillError::AlreadyStopped);
        }
        info!(
            "[{}] backfill starting at {} (page size {}, every {:?})",
            self.config.label,
            self.config.start_ms,
            self.config.page_size,
            self.config.poll_interval
        );
        let mut router = PartitionRouter::new(&self.config, Arc::clone(&self.metrics));
        let mut cursor = Cursor::new(self.config.start_ms);
        self.metrics.record_cursor(cursor.since_ms());

        let outcome = self.poll(&mut router, &mut cursor).await;
        if let Err(err) = &outcome {
            error!("[{}] backfill aborted: {}", self.config.label, err);
            self.coordinator.request_stop(StopReason::Failed);
        }
        let closed = self.coordinator.complete(&mut router);
        let progress = outcome?;
        let partitions = closed?;

        let reason = self
            .coordinator
            .stop_reason()
            .unwrap_or(StopReason::Interrupted);
        info!(
            "[{}] backfill stopped ({:?}): {} page(s), {} row(s), cursor {}",
            self.config.label,
            reason,
            progress.pages,
            progress.rows_written,
            cursor.since_ms()
        );
        Ok(BackfillReport {
            reason,
            cursor_ms: cursor.since_ms(),
            pages: progress.pages,
            rows_written: progress.rows_written,
            partitions,
        })
    }

    async fn poll(
        &self,
        router: &mut PartitionRouter,
        cursor: &mut Cursor,
    ) -> Result<Progress, BackfillError> {
        let token = self.coordinator.token();
        let mut progress = Progress::default();
        let mut failures = 0usize;
        let mut delay = self.config.poll_interval;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
            if token.is_cancelled() {
                break;
            }

            let since_ms = cursor.since_ms();
            self.metrics.record_fetch_attempt();
            let started = Instant::now();
            let fetched = self
                .source
                .fetch_klines(
                    &self.config.pair,
                    self.config.period,
                    self.config.page_size,
                    since_ms,
                )
                .await;
            let page = match fetched {
                Ok(page) => {
                    self.metrics.record_fetch_success(started.elapsed());
                    page
                }
                Err(err) => {
                    self.metrics.record_fetch_failure(started.elapsed());
                    failures += 1;
                    warn!(
                        "[{}] fetch since {} failed (attempt {}): {}",
                        self.config.label, since_ms, failures, err
                    );
                    delay = self.retry_delay(failures, err)?;
                    continue;
                }
            };
            failures = 0;
            delay = self.config.poll_interval;

            let written = self.write_page(router, &page)?;
            let next = cursor.advance(&page);
            self.metrics.record_page(page.len(), next);
            progress.pages += 1;
            progress.rows_written += written;
            debug!(
                "[{}] page since {}: {} candle(s), cursor -> {}",
                self.config.label,
                since_ms,
                page.len(),
                next
            );

            if Cursor::is_exhausted(&page, self.config.page_size) {
                info!(
                    "[{}] short page ({} < {}), no more history",
                    self.config.label,
                    page.len(),
                    self.config.page_size
                );
                self.coordinator.request_stop(StopReason::Exhausted);
                break;
            }
        }
        Ok(progress)
    }

    fn write_page(&self, router: &mut PartitionRouter, page: &[Candle]) -> Result<u64, SinkError> {
        for candle in page {
            router.write(candle)?;
        }
        Ok(page.len() as u64)
    }

    fn retry_delay(&self, failures: usize, err: SourceError) -> Result<Duration, BackfillError> {
        match &self.config.retry {
            RetryMode::Fixed => Ok(self.config.poll_interval),
            RetryMode::Backoff(policy) => {
                if !policy.allows_retry(failures) {
                    return Err(BackfillError::RetriesExhausted {
                        attempts: failures,
                        source: err,
                    });
                }
                Ok(policy.delay_for(failures))
            }
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    pages: u64,
    rows_written: u64,
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("output error: {0}")]
    Sink(#[from] SinkError),
    #[error("fetch failed {attempts} time(s) in a row: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: SourceError,
    },
    #[error("backfill run already stopped")]
    AlreadyStopped,
}
