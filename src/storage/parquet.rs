//! Parquet-backed tick store
//!
//! Rows are staged and written as Snappy-compressed files, one directory per
//! day. Prices are stored as strings to keep `Decimal` precision.

use super::{
    daily_stats, latest, summarize, MarketTick, StorageError, TickStats, TickStore, TokenSummary,
};
use arrow::array::{
    Array, ArrayRef, Int64Array, StringArray, TimestampMicrosecondArray, UInt8Array,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const FILE_PREFIX: &str = "ticks";
const PARTITION_PREFIX: &str = "date=";
const MAX_STAGED_FILES: usize = 10;

type PriceGetter = fn(&MarketTick) -> Decimal;

/// Price columns in file order
const PRICE_COLUMNS: [(&str, PriceGetter); 7] = [
    ("last_price", |t| t.last_price),
    ("bid_price", |t| t.bid_price),
    ("ask_price", |t| t.ask_price),
    ("open_price", |t| t.open_price),
    ("high_price", |t| t.high_price),
    ("low_price", |t| t.low_price),
    ("close_price", |t| t.close_price),
];

/// Tick file schema
pub fn tick_schema() -> Schema {
    let ts = || DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));
    let mut fields = vec![
        Field::new("timestamp", ts(), false),
        Field::new("exchange_timestamp", ts(), false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("exchange_type", DataType::UInt8, false),
        Field::new("sequence_number", DataType::Int64, false),
        Field::new("volume", DataType::Int64, false),
    ];
    fields.extend(
        PRICE_COLUMNS
            .iter()
            .map(|(name, _)| Field::new(*name, DataType::Utf8, false)),
    );
    Schema::new(fields)
}

/// File sizing for [`ParquetStore`]
#[derive(Debug, Clone, PartialEq)]
pub struct ParquetConfig {
    /// Staged rows that fill one file
    pub max_rows_per_file: usize,
    /// Age of the oldest staged row that forces a file out on the next insert
    pub rotation_interval: Duration,
}

impl Default for ParquetConfig {
    fn default() -> Self {
        Self {
            max_rows_per_file: 10_000,
            rotation_interval: Duration::from_secs(60),
        }
    }
}

impl ParquetConfig {
    /// Staged rows kept while writes fail; older rows are evicted beyond this
    fn staged_cap(&self) -> usize {
        self.max_rows_per_file.max(1) * MAX_STAGED_FILES
    }
}

/// Rows accepted but not yet in a file
#[derive(Debug, Default)]
struct Staging {
    rows: Vec<MarketTick>,
    opened_at: Option<Instant>,
}

impl Staging {
    fn push(&mut self, ticks: &[MarketTick], now: Instant) {
        if self.rows.is_empty() {
            self.opened_at = Some(now);
        }
        self.rows.extend_from_slice(ticks);
    }

    fn is_due(&self, config: &ParquetConfig, now: Instant) -> bool {
        !self.rows.is_empty()
            && (self.rows.len() >= config.max_rows_per_file
                || self
                    .opened_at
                    .is_some_and(|at| now.duration_since(at) >= config.rotation_interval))
    }

    fn take(&mut self) -> Vec<MarketTick> {
        self.opened_at = None;
        std::mem::take(&mut self.rows)
    }

    /// Put back rows whose write failed; returns how many were evicted
    fn restore(&mut self, rows: Vec<MarketTick>, cap: usize, now: Instant) -> usize {
        self.rows = rows;
        self.opened_at = (!self.rows.is_empty()).then_some(now);
        let evicted = self.rows.len().saturating_sub(cap);
        self.rows.drain(..evicted);
        evicted
    }
}

/// Columnar store writing day-partitioned Parquet files
///
/// Inserts are staged in memory and written out as one file once
/// `max_rows_per_file` rows are staged or the oldest staged row is older than
/// `rotation_interval`. Staged rows are visible to queries. Files live under
/// `date=YYYY-MM-DD/` by receipt date; `query_last` and `query_aggregates`
/// read only the newest partition holding the token.
#[derive(Debug)]
pub struct ParquetStore {
    output_dir: PathBuf,
    config: ParquetConfig,
    staging: Mutex<Staging>,
}

impl ParquetStore {
    /// Open a store rooted at `output_dir` with default file sizing
    pub fn open(output_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_with(output_dir, ParquetConfig::default())
    }

    /// Open a store rooted at `output_dir`, creating the directory
    pub fn open_with(output_dir: impl Into<PathBuf>, config: ParquetConfig) -> Result<Self, StorageError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            config,
            staging: Mutex::new(Staging::default()),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn config(&self) -> &ParquetConfig {
        &self.config
    }

    /// Rows accepted but not yet written to a file
    pub async fn staged(&self) -> usize {
        self.staging.lock().await.rows.len()
    }

    /// Days that have a partition, oldest first
    pub fn partitions(&self) -> Result<Vec<NaiveDate>, StorageError> {
        Ok(list_partitions(&self.output_dir)?
            .into_iter()
            .map(|(day, _)| day)
            .collect())
    }

    /// Tick files in every partition, oldest partition first
    pub fn files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        for (_, dir) in list_partitions(&self.output_dir)? {
            files.extend(list_files(&dir)?);
        }
        Ok(files)
    }

    /// Write every staged row out; `added` trailing rows belong to the caller
    /// and are dropped again if the write fails
    async fn write_staged(&self, staging: &mut Staging, added: usize) -> Result<(), StorageError> {
        let rows = staging.take();
        if rows.is_empty() {
            return Ok(());
        }

        let dir = self.output_dir.clone();
        let outcome = tokio::task::spawn_blocking(move || match write_partitioned(&dir, &rows) {
            Ok(files) => Ok((files, rows.len())),
            Err(e) => Err((e, rows)),
        })
        .await
        .map_err(|e| StorageError::Backend(format!("writer task failed: {}", e)))?;

        match outcome {
            Ok((files, count)) => {
                tracing::debug!(files, count, "Wrote staged ticks to Parquet");
                Ok(())
            }
            Err((e, mut rows)) => {
                rows.truncate(rows.len().saturating_sub(added));
                let evicted = staging.restore(rows, self.config.staged_cap(), Instant::now());
                if evicted > 0 {
                    tracing::warn!(evicted, "Parquet staging full, dropped oldest ticks");
                }
                Err(e)
            }
        }
    }

    /// Staged rows for `symbol` plus the newest partition holding it
    async fn scan_latest(&self, symbol: &str) -> Result<Vec<MarketTick>, StorageError> {
        let mut ticks: Vec<MarketTick> = self
            .staging
            .lock()
            .await
            .rows
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect();

        let dir = self.output_dir.clone();
        let wanted = symbol.to_string();
        let stored = tokio::task::spawn_blocking(move || read_newest_partition(&dir, &wanted))
            .await
            .map_err(|e| StorageError::Backend(format!("reader task failed: {}", e)))??;
        ticks.extend(stored);
        Ok(ticks)
    }

    async fn scan_all(&self) -> Result<Vec<MarketTick>, StorageError> {
        let mut ticks = self.staging.lock().await.rows.clone();

        let dir = self.output_dir.clone();
        let stored = tokio::task::spawn_blocking(move || read_all_partitions(&dir))
            .await
            .map_err(|e| StorageError::Backend(format!("reader task failed: {}", e)))??;
        ticks.extend(stored);
        Ok(ticks)
    }
}

#[async_trait]
impl TickStore for ParquetStore {
    fn name(&self) -> &'static str {
        "parquet"
    }

    async fn insert_batch(&self, ticks: &[MarketTick]) -> Result<(), StorageError> {
        if ticks.is_empty() {
            return Ok(());
        }

        let mut staging = self.staging.lock().await;
        let now = Instant::now();
        staging.push(ticks, now);
        if staging.is_due(&self.config, now) {
            self.write_staged(&mut staging, ticks.len()).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let mut staging = self.staging.lock().await;
        self.write_staged(&mut staging, 0).await
    }

    async fn query_last(&self, symbol: &str) -> Result<MarketTick, StorageError> {
        latest(&self.scan_latest(symbol).await?, symbol)
    }

    async fn query_aggregates(&self, symbol: &str) -> Result<TickStats, StorageError> {
        daily_stats(&self.scan_latest(symbol).await?, symbol)
    }

    async fn query_summary(&self, symbols: &[String]) -> Result<Vec<TokenSummary>, StorageError> {
        Ok(summarize(&self.scan_all().await?, symbols))
    }
}

fn partition_name(day: NaiveDate) -> String {
    format!("{}{}", PARTITION_PREFIX, day.format("%Y-%m-%d"))
}

fn file_name(now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}.parquet",
        FILE_PREFIX,
        now.format("%Y%m%d_%H%M%S"),
        uuid::Uuid::new_v4().simple()
    )
}

/// Write one file per receipt day; files become visible only once all are complete
fn write_partitioned(dir: &Path, ticks: &[MarketTick]) -> Result<usize, StorageError> {
    let mut by_day: BTreeMap<NaiveDate, Vec<MarketTick>> = BTreeMap::new();
    for tick in ticks {
        by_day
            .entry(tick.timestamp.date_naive())
            .or_default()
            .push(tick.clone());
    }

    let now = Utc::now();
    let mut written: Vec<(PathBuf, PathBuf)> = Vec::new();
    for (day, rows) in &by_day {
        let path = dir.join(partition_name(*day)).join(file_name(now));
        let tmp = path.with_extension("parquet.tmp");
        if let Err(e) = write_file(&tmp, rows) {
            let _ = fs::remove_file(&tmp);
            for (tmp, _) in &written {
                let _ = fs::remove_file(tmp);
            }
            return Err(e);
        }
        written.push((tmp, path));
    }

    for (tmp, path) in &written {
        fs::rename(tmp, path)?;
        tracing::debug!(path = ?path, "Finalized Parquet file");
    }
    Ok(written.len())
}

fn write_file(path: &Path, ticks: &[MarketTick]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let schema = Arc::new(tick_schema());
    let batch = to_record_batch(schema.clone(), ticks)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn to_record_batch(schema: Arc<Schema>, ticks: &[MarketTick]) -> Result<RecordBatch, StorageError> {
    let micros = |f: fn(&MarketTick) -> DateTime<Utc>| -> ArrayRef {
        let values: Vec<i64> = ticks.iter().map(|t| f(t).timestamp_micros()).collect();
        Arc::new(TimestampMicrosecondArray::from(values).with_timezone("UTC"))
    };

    let mut columns: Vec<ArrayRef> = vec![
        micros(|t| t.timestamp),
        micros(|t| t.exchange_timestamp),
        Arc::new(StringArray::from(
            ticks.iter().map(|t| t.symbol.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt8Array::from(
            ticks.iter().map(|t| t.exchange_type).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            ticks.iter().map(|t| t.sequence_number).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            ticks.iter().map(|t| t.volume).collect::<Vec<_>>(),
        )),
    ];

    for (_, get) in PRICE_COLUMNS {
        let values: Vec<String> = ticks.iter().map(|t| get(t).to_string()).collect();
        columns.push(Arc::new(StringArray::from(values)));
    }

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    files.sort();
    Ok(files)
}

/// `date=YYYY-MM-DD` directories, oldest first
fn list_partitions(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>, StorageError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut partitions: Vec<(NaiveDate, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?;
            let day = NaiveDate::parse_from_str(name.strip_prefix(PARTITION_PREFIX)?, "%Y-%m-%d").ok()?;
            Some((day, p))
        })
        .collect();
    partitions.sort();
    Ok(partitions)
}

fn read_newest_partition(dir: &Path, symbol: &str) -> Result<Vec<MarketTick>, StorageError> {
    for (_, partition) in list_partitions(dir)?.into_iter().rev() {
        let mut found = Vec::new();
        for path in list_files(&partition)? {
            found.extend(read_file(&path)?.into_iter().filter(|t| t.symbol == symbol));
        }
        if !found.is_empty() {
            return Ok(found);
        }
    }
    Ok(Vec::new())
}

fn read_all_partitions(dir: &Path) -> Result<Vec<MarketTick>, StorageError> {
    let mut ticks = Vec::new();
    for (_, partition) in list_partitions(dir)? {
        for path in list_files(&partition)? {
            ticks.extend(read_file(&path)?);
        }
    }
    Ok(ticks)
}

/// Read every tick from one file
pub(crate) fn read_file(path: &Path) -> Result<Vec<MarketTick>, StorageError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut ticks = Vec::new();
    for batch in reader {
        let batch = batch?;

        let timestamps = column::<TimestampMicrosecondArray>(&batch, "timestamp")?;
        let exchange_timestamps =
            column::<TimestampMicrosecondArray>(&batch, "exchange_timestamp")?;
        let symbols = column::<StringArray>(&batch, "symbol")?;
        let exchange_types = column::<UInt8Array>(&batch, "exchange_type")?;
        let sequences = column::<Int64Array>(&batch, "sequence_number")?;
        let volumes = column::<Int64Array>(&batch, "volume")?;
        let prices = PRICE_COLUMNS
            .iter()
            .map(|(name, _)| column::<StringArray>(&batch, name))
            .collect::<Result<Vec<_>, _>>()?;

        for i in 0..batch.num_rows() {
            let price = |idx: usize| parse_decimal(prices[idx].value(i));
            ticks.push(MarketTick {
                timestamp: from_micros(timestamps.value(i))?,
                exchange_timestamp: from_micros(exchange_timestamps.value(i))?,
                symbol: symbols.value(i).to_string(),
                exchange_type: exchange_types.value(i),
                sequence_number: sequences.value(i),
                last_price: price(0)?,
                volume: volumes.value(i),
                bid_price: price(1)?,
                ask_price: price(2)?,
                open_price: price(3)?,
                high_price: price(4)?,
                low_price: price(5)?,
                close_price: price(6)?,
            });
        }
    }

    Ok(ticks)
}

fn column<'a, A: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a A, StorageError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<A>())
        .ok_or_else(|| StorageError::Corrupt(format!("invalid {} column", name)))
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StorageError::Corrupt(format!("invalid timestamp {}", micros)))
}

fn parse_decimal(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::Corrupt(format!("invalid price {:?}: {}", s, e)))
}
