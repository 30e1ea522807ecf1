use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::NaiveDate;
use core_types::{Candle, Period, TimeZoneMode};
use log::{error, info};
use thiserror::Error;

use crate::{format::RowFormatter, metrics::BackfillMetrics, BackfillConfig};

/// Output destination of a candle: one file per instrument, period, and calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub symbol: String,
    pub period: Period,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn file_name(&self, exchange: &str) -> String {
        format!(
            "{}_kline_{}_{}_{}.csv",
            exchange,
            self.symbol,
            self.period.label(),
            self.date.format("%Y-%m-%d")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSummary {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub rows: u64,
}

/// Buffered CSV writer over one partition file.
///
/// The file is truncated on creation. `close` flushes and releases it; a sink dropped without
/// being closed flushes on drop so buffered rows are never lost on an early exit.
pub struct OutputSink {
    key: PartitionKey,
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows: u64,
}

impl OutputSink {
    fn create(
        key: PartitionKey,
        path: PathBuf,
        header: Option<&[&str]>,
    ) -> Result<Self, SinkError> {
        let file = File::create(&path).map_err(|source| SinkError::Open {
            path: path.clone(),
            source,
        })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        if let Some(header) = header {
            writer
                .write_record(header)
                .map_err(|source| SinkError::Write {
                    path: path.clone(),
                    source,
                })?;
        }
        Ok(Self {
            key,
            path,
            writer: Some(writer),
            rows: 0,
        })
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows written so far, header excluded.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    pub fn write_row<I, T>(&mut self, row: I) -> Result<(), SinkError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SinkError::Closed {
                path: self.path.clone(),
            });
        };
        writer
            .write_record(row)
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.rows += 1;
        Ok(())
    }

    /// Flushes and releases the file. Returns `None` when the sink was already closed.
    pub fn close(&mut self) -> Result<Option<SinkSummary>, SinkError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(None);
        };
        writer.flush().map_err(|source| SinkError::Flush {
            path: self.path.clone(),
            source,
        })?;
        drop(writer);
        Ok(Some(SinkSummary {
            key: self.key.clone(),
            path: self.path.clone(),
            rows: self.rows,
        }))
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.flush() {
                error!("failed to flush {:?} on drop: {}", self.path, err);
            }
        }
    }
}

/// Owns every sink opened during a run, keyed by partition.
pub struct PartitionRouter {
    label: String,
    exchange: String,
    symbol: String,
    period: Period,
    timezone: TimeZoneMode,
    output_dir: PathBuf,
    formatter: RowFormatter,
    sinks: BTreeMap<PartitionKey, OutputSink>,
    metrics: Arc<BackfillMetrics>,
}

impl PartitionRouter {
    pub fn new(config: &BackfillConfig, metrics: Arc<BackfillMetrics>) -> Self {
        Self {
            label: config.label.clone(),
            exchange: config.exchange.clone(),
            symbol: config.pair.symbol_lower(),
            period: config.period,
            timezone: config.timezone,
            output_dir: config.output_dir.clone(),
            formatter: RowFormatter::new(config.layout, config.precision, config.timezone),
            sinks: BTreeMap::new(),
            metrics,
        }
    }

    pub fn partition_key(&self, candle: &Candle) -> Result<PartitionKey, SinkError> {
        let date = self
            .timezone
            .date(candle.timestamp)
            .ok_or(SinkError::InvalidTimestamp(candle.timestamp))?;
        Ok(PartitionKey {
            symbol: self.symbol.clone(),
            period: self.period,
            date,
        })
    }

    /// Returns the sink for `candle`'s partition, creating the file (and header) on first use.
    pub fn route(&mut self, candle: &Candle) -> Result<&mut OutputSink, SinkError> {
        let key = self.partition_key(candle)?;
        let Self {
            label,
            exchange,
            output_dir,
            formatter,
            sinks,
            metrics,
            ..
        } = self;
        match sinks.entry(key) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                fs::create_dir_all(output_dir.as_path()).map_err(|source| SinkError::Open {
                    path: output_dir.clone(),
                    source,
                })?;
                let path = output_dir.join(slot.key().file_name(exchange));
                let sink = OutputSink::create(slot.key().clone(), path, formatter.header())?;
                metrics.record_partition_opened();
                info!("[{}] opened partition {}", label, sink.path.display());
                Ok(slot.insert(sink))
            }
        }
    }

    pub fn write(&mut self, candle: &Candle) -> Result<(), SinkError> {
        let row = self.formatter.format(candle)?;
        self.route(candle)?.write_row(&row)?;
        self.metrics.record_row_written();
        Ok(())
    }

    pub fn open_partitions(&self) -> usize {
        self.sinks.values().filter(|sink| !sink.is_closed()).count()
    }

    pub fn sinks(&self) -> impl Iterator<Item = &OutputSink> {
        self.sinks.values()
    }

    /// Closes every sink still open. Each sink is closed at most once; a failure on one sink
    /// does not stop the others from closing, and the first failure is returned.
    pub fn close_all(&mut self) -> Result<Vec<SinkSummary>, SinkError> {
        let mut summaries = Vec::new();
        let mut first_error = None;
        for sink in self.sinks.values_mut() {
            match sink.close() {
                Ok(Some(summary)) => {
                    self.metrics.record_partition_closed();
                    summaries.push(summary);
                }
                Ok(None) => {}
                Err(err) => {
                    error!("[{}] failed to close partition: {}", self.label, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(summaries),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to flush {path:?}: {source}")]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("partition {path:?} already closed")]
    Closed { path: PathBuf },
    #[error("candle timestamp {0} has no calendar date")]
    InvalidTimestamp(i64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{CurrencyPair, OutputLayout};
    use tempfile::tempdir;

    // 2024-01-01T00:00:00Z
    const DAY_ONE: i64 = 1_704_067_200;

    fn candle(timestamp: i64) -> Candle {
        Candle {
            timestamp,
            open: 1.5,
            high: 2.0,
            low: 1.0,
            close: 1.75,
            volume: 100.0,
        }
    }

    fn router(dir: &Path, layout: OutputLayout) -> PartitionRouter {
        let config = BackfillConfig::new(
            CurrencyPair::new("LTC", "USDT"),
            Period::OneMin,
            DAY_ONE * 1_000,
            dir,
        )
        .with_layout(layout);
        PartitionRouter::new(&config, Arc::new(BackfillMetrics::new()))
    }

    #[test]
    fn same_date_routes_to_same_partition() {
        let dir = tempdir().unwrap();
        let router = router(dir.path(), OutputLayout::Raw);
        let morning = router.partition_key(&candle(DAY_ONE + 60)).unwrap();
        let night = router.partition_key(&candle(DAY_ONE + 86_340)).unwrap();
        let next_day = router.partition_key(&candle(DAY_ONE + 86_400)).unwrap();
        assert_eq!(morning, night);
        assert_ne!(morning, next_day);
        assert_eq!(
            morning.file_name("binance"),
            "binance_kline_ltcusdt_1min_2024-01-01.csv"
        );
    }

    #[test]
    fn local_mode_partitions_by_host_date() {
        use chrono::{Local, TimeZone};

        let dir = tempdir().unwrap();
        let config = BackfillConfig::new(
            CurrencyPair::new("LTC", "USDT"),
            Period::OneMin,
            DAY_ONE * 1_000,
            dir.path(),
        )
        .with_timezone(TimeZoneMode::Local);
        let router = PartitionRouter::new(&config, Arc::new(BackfillMetrics::new()));
        let ts = DAY_ONE - 30 * 60;
        let expected = Local.timestamp_opt(ts, 0).single().unwrap().date_naive();
        assert_eq!(router.partition_key(&candle(ts)).unwrap().date, expected);
    }

    #[test]
    fn route_reuses_open_sink() {
        let dir = tempdir().unwrap();
        let mut router = router(dir.path(), OutputLayout::Raw);
        for offset in 0..3 {
            router.write(&candle(DAY_ONE + offset * 60)).unwrap();
        }
        router.write(&candle(DAY_ONE + 86_400)).unwrap();
        assert_eq!(router.open_partitions(), 2);
        let rows: Vec<u64> = router.sinks().map(OutputSink::rows).collect();
        assert_eq!(rows, vec![3, 1]);
    }

    #[test]
    fn extended_header_written_once_per_file() {
        let dir = tempdir().unwrap();
        let mut router = router(dir.path(), OutputLayout::Extended);
        for offset in 0..5 {
            router.write(&candle(DAY_ONE + offset * 60)).unwrap();
        }
        let summaries = router.close_all().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].rows, 5);

        let contents = fs::read_to_string(&summaries[0].path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "open_time,open,high,low,close,volume,open_interest");
        assert_eq!(lines[1], "2024-01-01 00:00:00,1.5,2,1,1.75,100");
        assert_eq!(
            contents.matches("open_interest").count(),
            1,
            "header must appear once"
        );
    }

    #[test]
    fn raw_rows_have_no_header() {
        let dir = tempdir().unwrap();
        let mut router = router(dir.path(), OutputLayout::Raw);
        router.write(&candle(DAY_ONE)).unwrap();
        let summaries = router.close_all().unwrap();
        let contents = fs::read_to_string(&summaries[0].path).unwrap();
        assert_eq!(contents, "1704067200,2,1,1.5,1.75,100\n");
    }

    #[test]
    fn close_all_closes_each_sink_once() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(BackfillMetrics::new());
        let config = BackfillConfig::new(
            CurrencyPair::new("LTC", "USDT"),
            Period::OneMin,
            DAY_ONE * 1_000,
            dir.path(),
        );
        let mut router = PartitionRouter::new(&config, Arc::clone(&metrics));
        router.write(&candle(DAY_ONE)).unwrap();
        router.write(&candle(DAY_ONE + 86_400)).unwrap();

        assert_eq!(router.close_all().unwrap().len(), 2);
        assert!(router.close_all().unwrap().is_empty());
        assert_eq!(router.open_partitions(), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.partitions_opened, 2);
        assert_eq!(snapshot.partitions_closed, 2);
    }

    #[test]
    fn closed_sink_rejects_writes() {
        let dir = tempdir().unwrap();
        let mut router = router(dir.path(), OutputLayout::Raw);
        router.write(&candle(DAY_ONE)).unwrap();
        router.close_all().unwrap();
        assert!(matches!(
            router.write(&candle(DAY_ONE + 60)),
            Err(SinkError::Closed { .. })
        ));
    }

    #[test]
    fn dropped_router_flushes_buffered_rows() {
        let dir = tempdir().unwrap();
        let path = {
            let mut router = router(dir.path(), OutputLayout::Raw);
            router.write(&candle(DAY_ONE)).unwrap();
            let path = router.sinks().next().unwrap().path().to_path_buf();
            path
        };
        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn reopening_run_truncates_existing_file() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("binance_kline_ltcusdt_1min_2024-01-01.csv");
        fs::write(&stale, "stale\nrows\nfrom\nbefore\n").unwrap();
        let mut router = router(dir.path(), OutputLayout::Raw);
        router.write(&candle(DAY_ONE)).unwrap();
        router.close_all().unwrap();
        assert_eq!(fs::read_to_string(stale).unwrap().lines().count(), 1);
    }

    #[test]
    fn unopenable_partition_is_an_open_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("binance_kline_ltcusdt_1min_2024-01-01.csv");
        fs::create_dir(&blocker).unwrap();
        let mut router = router(dir.path(), OutputLayout::Raw);
        assert!(matches!(
            router.write(&candle(DAY_ONE)),
            Err(SinkError::Open { .. })
        ));
    }
}
