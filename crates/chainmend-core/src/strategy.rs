//! Acquisition strategies: where the records for a missing range come from.
//!
//! Selection is a pure function of range size and log availability. The
//! three executors share the [`RangeSource`] interface and hand records to a
//! [`RecordConsumer`] in ascending height order (log order for scans).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::binlog::{BinaryLogReader, ScanStop};
use crate::error::{LISTED_HEIGHTS_LIMIT, RangeError};
use crate::gap::HeightRange;
use crate::record::StateChangeRecord;
use crate::remote::{BlockFetcher, FetchError};

/// How a range is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SequentialRemote,
    ParallelRemote,
    LogScan,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SequentialRemote => "sequential_remote",
            Self::ParallelRemote => "parallel_remote",
            Self::LogScan => "log_scan",
        })
    }
}

/// Size cut-offs for [`select_strategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyThresholds {
    /// Largest range fetched one height at a time.
    pub sequential_max: u64,
    /// Largest range fetched by the worker pool when a log is available.
    pub parallel_max: u64,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            sequential_max: 100,
            parallel_max: 10_000,
        }
    }
}

/// Pick the cheapest source for a range of `size` heights.
#[must_use]
pub fn select_strategy(size: u64, log_available: bool, thresholds: StrategyThresholds) -> Strategy {
    if size <= thresholds.sequential_max {
        Strategy::SequentialRemote
    } else if size <= thresholds.parallel_max || !log_available {
        Strategy::ParallelRemote
    } else {
        Strategy::LogScan
    }
}

/// Why a range is being repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeOrigin {
    /// Found by gap detection; existing rows win on conflict.
    Detected,
    /// Requested by the operator; fetched rows overwrite existing ones.
    Manual,
}

impl RangeOrigin {
    #[must_use]
    pub const fn allow_update_on_conflict(self) -> bool {
        matches!(self, Self::Manual)
    }
}

/// A range paired with the strategy chosen for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RepairRange {
    pub range: HeightRange,
    pub strategy: Strategy,
    pub origin: RangeOrigin,
}

/// Attach a strategy to every range.
#[must_use]
pub fn plan_ranges(
    ranges: &[HeightRange],
    origin: RangeOrigin,
    log_available: bool,
    thresholds: StrategyThresholds,
) -> Vec<RepairRange> {
    ranges
        .iter()
        .map(|&range| RepairRange {
            range,
            strategy: select_strategy(range.size(), log_available, thresholds),
            origin,
        })
        .collect()
}

/// Receives acquired records. Errors returned here are fatal to the run.
pub trait RecordConsumer {
    fn consume(&mut self, record: StateChangeRecord) -> crate::Result<()>;

    /// Make everything consumed so far durable.
    fn checkpoint(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// Per-range success summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireSummary {
    pub emitted: u64,
}

/// Range-level failure, or a fatal error raised by the consumer.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Fatal(#[from] crate::Error),
}

/// A source able to produce every record of a height range.
#[allow(async_fn_in_trait)]
pub trait RangeSource {
    fn strategy(&self) -> Strategy;

    async fn acquire(
        &mut self,
        range: HeightRange,
        consumer: &mut dyn RecordConsumer,
    ) -> Result<AcquireSummary, AcquireError>;
}

/// Turn collected per-height failures into one range error.
///
/// Only transient failures with nothing fetched at all mean the source was
/// unavailable; anything else is a partial failure.
#[must_use]
pub fn classify_failures(range: HeightRange, failures: &[(u64, FetchError)], fetched: u64) -> RangeError {
    let all_transient = failures.iter().all(|(_, err)| err.is_transient());
    if fetched == 0 && all_transient {
        let reason = failures
            .first()
            .map_or_else(|| "no heights fetched".to_string(), |(_, err)| err.to_string());
        return RangeError::SourceUnavailable { range, reason };
    }
    RangeError::partial(range, failures.iter().map(|(height, _)| *height).collect())
}

// =============================================================================
// Sequential remote
// =============================================================================

/// One request at a time, in height order.
pub struct SequentialRemote<F> {
    fetcher: Arc<F>,
}

impl<F: BlockFetcher> SequentialRemote<F> {
    #[must_use]
    pub fn new(fetcher: Arc<F>) -> Self {
        Self { fetcher }
    }
}

impl<F: BlockFetcher> RangeSource for SequentialRemote<F> {
    fn strategy(&self) -> Strategy {
        Strategy::SequentialRemote
    }

    async fn acquire(
        &mut self,
        range: HeightRange,
        consumer: &mut dyn RecordConsumer,
    ) -> Result<AcquireSummary, AcquireError> {
        let mut failures = Vec::new();
        let mut emitted = 0u64;

        for height in range.heights() {
            match self.fetcher.fetch(height).await {
                Ok(record) => {
                    consumer.consume(record)?;
                    emitted += 1;
                }
                Err(err) => {
                    warn!(height, error = %err, "failed to fetch block");
                    failures.push((height, err));
                }
            }
        }

        if failures.is_empty() {
            Ok(AcquireSummary { emitted })
        } else {
            Err(classify_failures(range, &failures, emitted).into())
        }
    }
}

// =============================================================================
// Parallel remote (bounded worker pool)
// =============================================================================

/// Worker pool over windows of the range.
pub struct ParallelRemote<F> {
    fetcher: Arc<F>,
    workers: usize,
    window: u64,
}

impl<F: BlockFetcher + 'static> ParallelRemote<F> {
    #[must_use]
    pub fn new(fetcher: Arc<F>, workers: usize, window: u64) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
            window: window.max(1),
        }
    }

    /// Fetch every height of `window`; results keyed by height.
    async fn fetch_window(
        &self,
        window: HeightRange,
    ) -> crate::Result<(BTreeMap<u64, StateChangeRecord>, Vec<(u64, FetchError)>)> {
        let workers = self
            .workers
            .min(usize::try_from(window.size()).unwrap_or(usize::MAX));
        let capacity = workers.saturating_mul(2);
        let (job_tx, job_rx) = flume::bounded::<u64>(capacity);
        let (result_tx, result_rx) =
            flume::bounded::<(u64, Result<StateChangeRecord, FetchError>)>(capacity);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let fetcher = Arc::clone(&self.fetcher);
            handles.push(tokio::spawn(async move {
                while let Ok(height) = jobs.recv_async().await {
                    let outcome = fetcher.fetch(height).await;
                    if results.send_async((height, outcome)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(job_rx);
        drop(result_tx);

        let producer = tokio::spawn(async move {
            for height in window.heights() {
                if job_tx.send_async(height).await.is_err() {
                    break;
                }
            }
        });

        let mut records = BTreeMap::new();
        let mut failures = Vec::new();
        let mut received = 0u64;
        while let Ok((height, outcome)) = result_rx.recv_async().await {
            received += 1;
            match outcome {
                Ok(record) => {
                    records.insert(height, record);
                }
                Err(err) => {
                    warn!(height, error = %err, "failed to fetch block");
                    failures.push((height, err));
                }
            }
            if received % 1_000 == 0 {
                debug!(
                    start = window.start(),
                    end = window.end(),
                    received,
                    failed = failures.len(),
                    "window progress"
                );
            }
        }

        producer
            .await
            .map_err(|err| crate::Error::Panicked(format!("job producer: {err}")))?;
        for handle in handles {
            handle
                .await
                .map_err(|err| crate::Error::Panicked(format!("fetch worker: {err}")))?;
        }

        Ok((records, failures))
    }
}

impl<F: BlockFetcher + 'static> RangeSource for ParallelRemote<F> {
    fn strategy(&self) -> Strategy {
        Strategy::ParallelRemote
    }

    async fn acquire(
        &mut self,
        range: HeightRange,
        consumer: &mut dyn RecordConsumer,
    ) -> Result<AcquireSummary, AcquireError> {
        let mut emitted = 0u64;

        for window in range.windows(self.window) {
            let (records, mut failures) = self.fetch_window(window).await?;
            if !failures.is_empty() {
                failures.sort_unstable_by_key(|(height, _)| *height);
                let fetched = emitted + records.len() as u64;
                return Err(classify_failures(range, &failures, fetched).into());
            }

            for record in records.into_values() {
                consumer.consume(record)?;
                emitted += 1;
            }
            consumer.checkpoint()?;
            info!(
                start = window.start(),
                end = window.end(),
                emitted,
                total = range.size(),
                "window fetched"
            );
        }

        Ok(AcquireSummary { emitted })
    }
}

// =============================================================================
// Binary log scan
// =============================================================================

/// Scan of the local binary log.
///
/// Records are emitted in log order. The log writer appends heights in
/// ascending order, so log order is height order apart from duplicates,
/// which are dropped. Heights the scan could not supply are kept in
/// [`LogScan::unresolved`] so the caller can try another source.
pub struct LogScan<'a> {
    reader: &'a mut BinaryLogReader,
    unresolved: Vec<u64>,
}

impl<'a> LogScan<'a> {
    #[must_use]
    pub fn new(reader: &'a mut BinaryLogReader) -> Self {
        Self {
            reader,
            unresolved: Vec::new(),
        }
    }

    /// Ascending heights left unserved by a scan that ended in
    /// `MissingHeights` or a log read error. Empty otherwise.
    #[must_use]
    pub fn unresolved(&self) -> &[u64] {
        &self.unresolved
    }

    pub fn take_unresolved(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.unresolved)
    }
}

fn heights_not_in(range: HeightRange, served: &HashSet<u64>) -> Vec<u64> {
    range.heights().filter(|h| !served.contains(h)).collect()
}

impl RangeSource for LogScan<'_> {
    fn strategy(&self) -> Strategy {
        Strategy::LogScan
    }

    async fn acquire(
        &mut self,
        range: HeightRange,
        consumer: &mut dyn RecordConsumer,
    ) -> Result<AcquireSummary, AcquireError> {
        self.unresolved.clear();
        let mut served = HashSet::new();
        let scanned = self.reader.scan_range(range, &mut |record| {
            let height = record.height;
            consumer.consume(record)?;
            served.insert(height);
            Ok(())
        });
        let emitted = served.len() as u64;

        let outcome = match scanned {
            Ok(outcome) => outcome,
            Err(crate::Error::Log(err)) => {
                self.unresolved = heights_not_in(range, &served);
                return Err(RangeError::SourceUnavailable {
                    range,
                    reason: err.to_string(),
                }
                .into());
            }
            Err(err) => return Err(err.into()),
        };

        match outcome.stop {
            ScanStop::Complete => Ok(AcquireSummary { emitted }),
            ScanStop::DecodeLimit => Err(RangeError::DecodeCorruption {
                range,
                errors: outcome.decode_errors,
                last_position: outcome.last_position,
            }
            .into()),
            ScanStop::EndOfLog | ScanStop::BoundExceeded => {
                let (missing, missing_count) = outcome.missing(LISTED_HEIGHTS_LIMIT);
                self.unresolved = heights_not_in(range, &served);
                Err(RangeError::MissingHeights {
                    range,
                    missing,
                    missing_count,
                }
                .into())
            }
        }
    }
}
