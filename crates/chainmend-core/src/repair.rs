//! Repair orchestration: detect, plan, acquire and commit, one range at a time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::binlog::BinaryLogReader;
use crate::committer::{BackfillCommitter, CommitterConfig};
use crate::error::{ConfigError, RangeError, Result};
use crate::gap::{HeightRange, ReplicaIndex, detect_gaps, ranges_from_heights, total_missing};
use crate::remote::BlockFetcher;
use crate::sink::EntrySink;
use crate::strategy::{
    AcquireError, AcquireSummary, LogScan, ParallelRemote, RangeOrigin, RangeSource,
    RecordConsumer, RepairRange, SequentialRemote, Strategy, StrategyThresholds, plan_ranges,
    select_strategy,
};

/// `[repair]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Concurrent fetch tasks for parallel remote ranges.
    pub workers: usize,
    pub commit_interval: u64,
    pub apply_batch_size: usize,
    /// Heights fetched per parallel window.
    pub fetch_window: u64,
    pub sequential_max: u64,
    pub parallel_max: u64,
    /// Report missing heights below the lowest populated height.
    pub detect_from_genesis: bool,
}

impl Default for RepairConfig {
    fn default() -> Self {
        let thresholds = StrategyThresholds::default();
        let committer = CommitterConfig::default();
        Self {
            workers: 100,
            commit_interval: committer.commit_interval,
            apply_batch_size: committer.apply_batch_size,
            fetch_window: 50_000,
            sequential_max: thresholds.sequential_max,
            parallel_max: thresholds.parallel_max,
            detect_from_genesis: true,
        }
    }
}

impl RepairConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let positive = [
            ("repair.workers", self.workers as u64),
            ("repair.commit_interval", self.commit_interval),
            ("repair.apply_batch_size", self.apply_batch_size as u64),
            ("repair.fetch_window", self.fetch_window),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ValidationError(format!("{name} must be >= 1")));
        }
        if self.sequential_max >= self.parallel_max {
            return Err(ConfigError::ValidationError(format!(
                "repair.sequential_max ({}) must be below repair.parallel_max ({})",
                self.sequential_max, self.parallel_max
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn thresholds(&self) -> StrategyThresholds {
        StrategyThresholds {
            sequential_max: self.sequential_max,
            parallel_max: self.parallel_max,
        }
    }

    #[must_use]
    pub fn committer(&self) -> CommitterConfig {
        CommitterConfig {
            commit_interval: self.commit_interval,
            apply_batch_size: self.apply_batch_size,
        }
    }
}

/// Where the ranges to repair come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairMode {
    /// Query the replica for gaps.
    DetectGaps,
    /// Operator-supplied ranges; detection and the existence guard are bypassed.
    Manual(Vec<HeightRange>),
}

/// What happened to one planned range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeOutcome {
    Repaired { emitted: u64, applied: u64, commits: u64 },
    Skipped { reason: String },
    Failed(RangeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeReport {
    pub planned: RepairRange,
    pub outcome: RangeOutcome,
}

/// Result of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub ranges: Vec<RangeReport>,
}

impl RepairReport {
    pub fn repaired(&self) -> usize {
        self.count(|o| matches!(o, RangeOutcome::Repaired { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RangeOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RangeOutcome::Failed(_)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &RangeError> {
        self.ranges.iter().filter_map(|r| match &r.outcome {
            RangeOutcome::Failed(err) => Some(err),
            _ => None,
        })
    }

    pub fn applied(&self) -> u64 {
        self.ranges
            .iter()
            .map(|r| match r.outcome {
                RangeOutcome::Repaired { applied, .. } => applied,
                _ => 0,
            })
            .sum()
    }

    /// Every range repaired or skipped.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// 0 on success, 1 when any range failed.
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.is_success())
    }

    fn count(&self, pred: impl Fn(&RangeOutcome) -> bool) -> usize {
        self.ranges.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Drives a repair run against one replica.
pub struct RepairRunner<F, R> {
    config: RepairConfig,
    fetcher: Arc<F>,
    log: Option<BinaryLogReader>,
    committer: BackfillCommitter<R>,
}

impl<F, R> RepairRunner<F, R>
where
    F: BlockFetcher + 'static,
    R: EntrySink + ReplicaIndex,
{
    pub fn new(config: RepairConfig, fetcher: Arc<F>, log: Option<BinaryLogReader>, replica: R) -> Self {
        let committer = BackfillCommitter::new(replica, config.committer());
        Self {
            config,
            fetcher,
            log,
            committer,
        }
    }

    pub fn replica(&self) -> &R {
        self.committer.sink()
    }

    pub fn into_replica(self) -> R {
        self.committer.into_sink()
    }

    pub fn log_available(&self) -> bool {
        self.log.is_some()
    }

    /// Ranges and strategies a run would use, without fetching anything.
    pub fn plan(&self, mode: &RepairMode) -> Result<Vec<RepairRange>> {
        let (ranges, origin) = match mode {
            RepairMode::DetectGaps => (
                detect_gaps(self.committer.sink(), self.config.detect_from_genesis)?,
                RangeOrigin::Detected,
            ),
            RepairMode::Manual(ranges) => (ranges.clone(), RangeOrigin::Manual),
        };
        Ok(plan_ranges(
            &ranges,
            origin,
            self.log_available(),
            self.config.thresholds(),
        ))
    }

    /// Repair every planned range.
    ///
    /// Range failures are recorded in the report and the run moves on. Commit
    /// and replica errors abort the run.
    pub async fn run(&mut self, mode: &RepairMode) -> Result<RepairReport> {
        let plan = self.plan(mode)?;
        if plan.is_empty() {
            info!("no missing heights found; replica is contiguous");
            return Ok(RepairReport::default());
        }

        let ranges: Vec<HeightRange> = plan.iter().map(|p| p.range).collect();
        info!(
            ranges = plan.len(),
            heights = total_missing(&ranges),
            log_available = self.log_available(),
            "repair plan ready"
        );

        let mut report = RepairReport::default();
        for planned in plan {
            let outcome = self.repair_range(planned).await?;
            report.ranges.push(RangeReport { planned, outcome });
        }

        if report.is_success() {
            info!(
                repaired = report.repaired(),
                skipped = report.skipped(),
                applied = report.applied(),
                commits = self.committer.total_commits(),
                "repair finished"
            );
        } else {
            error!(
                repaired = report.repaired(),
                skipped = report.skipped(),
                failed = report.failed(),
                applied = report.applied(),
                "repair finished with failed ranges"
            );
        }
        Ok(report)
    }

    async fn repair_range(&mut self, planned: RepairRange) -> Result<RangeOutcome> {
        let range = planned.range;
        if planned.origin == RangeOrigin::Detected && self.committer.sink().height_exists(range.start())? {
            warn!(
                start = range.start(),
                end = range.end(),
                "gap start already present in replica; skipping"
            );
            return Ok(RangeOutcome::Skipped {
                reason: format!("height {} already present", range.start()),
            });
        }

        info!(
            start = range.start(),
            end = range.end(),
            size = range.size(),
            strategy = %planned.strategy,
            "repairing range"
        );
        self.committer
            .begin_range(range, planned.origin.allow_update_on_conflict());

        let acquired = match planned.strategy {
            Strategy::SequentialRemote | Strategy::ParallelRemote => {
                self.fetch_remote(range, planned.strategy).await
            }
            Strategy::LogScan => self.scan_log(range).await,
        };

        match acquired {
            Ok(summary) => {
                let stats = self.committer.finish_range()?;
                if !stats.failed_heights.is_empty() {
                    let err = RangeError::partial(range, stats.failed_heights);
                    warn!(
                        start = range.start(),
                        end = range.end(),
                        kind = err.kind(),
                        error = %err,
                        "range failed"
                    );
                    return Ok(RangeOutcome::Failed(err));
                }
                info!(
                    start = range.start(),
                    end = range.end(),
                    applied = stats.applied,
                    commits = stats.commits,
                    "range repaired"
                );
                Ok(RangeOutcome::Repaired {
                    emitted: summary.emitted,
                    applied: stats.applied,
                    commits: stats.commits,
                })
            }
            Err(AcquireError::Range(err)) => {
                // Whatever was emitted before the failure is kept
                let stats = self.committer.finish_range()?;
                warn!(
                    start = range.start(),
                    end = range.end(),
                    kind = err.kind(),
                    applied = stats.applied,
                    error = %err,
                    "range failed"
                );
                Ok(RangeOutcome::Failed(err))
            }
            Err(AcquireError::Fatal(err)) => Err(err),
        }
    }

    async fn fetch_remote(
        &mut self,
        range: HeightRange,
        strategy: Strategy,
    ) -> std::result::Result<AcquireSummary, AcquireError> {
        if strategy == Strategy::SequentialRemote {
            SequentialRemote::new(Arc::clone(&self.fetcher))
                .acquire(range, &mut self.committer)
                .await
        } else {
            ParallelRemote::new(
                Arc::clone(&self.fetcher),
                self.config.workers,
                self.config.fetch_window,
            )
            .acquire(range, &mut self.committer)
            .await
        }
    }

    /// Scan the log, then fetch whatever it lacked from the remote API.
    async fn scan_log(&mut self, range: HeightRange) -> std::result::Result<AcquireSummary, AcquireError> {
        let Some(reader) = self.log.as_mut() else {
            return Err(AcquireError::Range(RangeError::SourceUnavailable {
                range,
                reason: "binary log not configured".to_string(),
            }));
        };

        let mut scan = LogScan::new(reader);
        let log_err = match scan.acquire(range, &mut self.committer).await {
            Ok(summary) => return Ok(summary),
            Err(AcquireError::Range(err)) if !scan.unresolved().is_empty() => err,
            Err(err) => return Err(err),
        };
        let unresolved = scan.take_unresolved();
        let mut emitted = range.size() - unresolved.len() as u64;

        warn!(
            start = range.start(),
            end = range.end(),
            unresolved = unresolved.len(),
            error = %log_err,
            "binary log could not serve the whole range; falling back to the remote API"
        );
        self.committer.checkpoint()?;

        for part in ranges_from_heights(unresolved) {
            let strategy = select_strategy(part.size(), false, self.config.thresholds());
            match self.fetch_remote(part, strategy).await {
                Ok(summary) => emitted += summary.emitted,
                Err(AcquireError::Range(remote_err)) => {
                    return Err(fallback_failed(range, &log_err, remote_err).into());
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Ok(AcquireSummary { emitted })
    }
}

/// Failure of the remote fetch that followed a short log scan, reported
/// against the whole planned range.
fn fallback_failed(range: HeightRange, log_err: &RangeError, remote_err: RangeError) -> RangeError {
    match remote_err {
        RangeError::SourceUnavailable { reason, .. } => RangeError::SourceUnavailable {
            range,
            reason: format!("binary log: {log_err}; remote: {reason}"),
        },
        RangeError::PartialRangeFailure {
            failed_heights,
            failed_count,
            ..
        } => RangeError::PartialRangeFailure {
            range,
            failed_heights,
            failed_count,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{BinaryLogConfig, BinaryLogWriter};
    use crate::record::{BlockPayload, StateChangeRecord};
    use crate::remote::FetchError;
    use crate::replica::SqliteReplica;
    use std::collections::HashSet;
    use std::future::Future;
    use std::sync::Mutex;

    fn range(start: u64, end: u64) -> HeightRange {
        HeightRange::new(start, end).unwrap()
    }

    fn block(height: u64) -> StateChangeRecord {
        StateChangeRecord::block(
            height.to_be_bytes().repeat(4),
            BlockPayload {
                height,
                timestamp_nanos: 1_700_000_000_000_000_000,
                ..BlockPayload::default()
            },
        )
    }

    #[derive(Default)]
    struct StubFetcher {
        permanent: HashSet<u64>,
        fetched: Mutex<Vec<u64>>,
    }

    impl BlockFetcher for StubFetcher {
        fn fetch(
            &self,
            height: u64,
        ) -> impl Future<Output = std::result::Result<StateChangeRecord, FetchError>> + Send {
            self.fetched.lock().unwrap().push(height);
            let result = if self.permanent.contains(&height) {
                Err(FetchError::Permanent {
                    height,
                    reason: "HTTP 404".to_string(),
                })
            } else {
                Ok(block(height))
            };
            async move { result }
        }
    }

    fn seeded_replica(heights: impl IntoIterator<Item = u64>) -> SqliteReplica {
        let mut replica = SqliteReplica::open_in_memory().unwrap();
        let records: Vec<_> = heights.into_iter().map(block).collect();
        replica.begin().unwrap();
        for chunk in records.chunks(500) {
            replica.apply_batch(chunk, false).unwrap();
        }
        replica.commit().unwrap();
        replica
    }

    fn runner(
        replica: SqliteReplica,
        fetcher: StubFetcher,
        log: Option<BinaryLogReader>,
    ) -> RepairRunner<StubFetcher, SqliteReplica> {
        RepairRunner::new(RepairConfig::default(), Arc::new(fetcher), log, replica)
    }

    #[tokio::test]
    async fn repairs_detected_gaps() {
        let replica = seeded_replica((0..=150).chain(153..=8451).chain([8453]));
        let mut runner = runner(replica, StubFetcher::default(), None);

        let plan = runner.plan(&RepairMode::DetectGaps).unwrap();
        let planned: Vec<_> = plan.iter().map(|p| (p.range, p.strategy)).collect();
        assert_eq!(
            planned,
            vec![
                (range(151, 152), Strategy::SequentialRemote),
                (range(8452, 8452), Strategy::SequentialRemote),
            ]
        );

        let report = runner.run(&RepairMode::DetectGaps).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.repaired(), 2);
        assert_eq!(report.applied(), 3);
        assert_eq!(report.exit_code(), 0);
        assert!(runner.plan(&RepairMode::DetectGaps).unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_run_is_a_noop() {
        let replica = seeded_replica((0..=10).chain(20..=30));
        let mut runner = runner(replica, StubFetcher::default(), None);
        runner.run(&RepairMode::DetectGaps).await.unwrap();
        let count = runner.replica().block_count().unwrap();

        let report = runner.run(&RepairMode::DetectGaps).await.unwrap();
        assert!(report.ranges.is_empty());
        assert_eq!(runner.replica().block_count().unwrap(), count);
        assert_eq!(count, 31);
    }

    #[tokio::test]
    async fn failed_range_does_not_stop_the_run() {
        let replica = seeded_replica((0..=10).chain(15..=20).chain(25..=30));
        let fetcher = StubFetcher {
            permanent: HashSet::from([12]),
            ..StubFetcher::default()
        };
        let mut runner = runner(replica, fetcher, None);
        let report = runner.run(&RepairMode::DetectGaps).await.unwrap();

        assert_eq!(report.failed(), 1);
        assert_eq!(report.repaired(), 1);
        assert_eq!(report.exit_code(), 1);
        let err = report.failures().next().unwrap();
        assert_eq!(
            *err,
            RangeError::PartialRangeFailure {
                range: range(11, 14),
                failed_heights: vec![12],
                failed_count: 1,
            }
        );
        // 12 is still missing and will be detected again
        let remaining: Vec<_> = runner
            .plan(&RepairMode::DetectGaps)
            .unwrap()
            .into_iter()
            .map(|p| p.range)
            .collect();
        assert_eq!(remaining, vec![range(12, 12)]);
    }

    #[tokio::test]
    async fn manual_ranges_bypass_detection() {
        let replica = seeded_replica(0..=50);
        let fetcher = Arc::new(StubFetcher::default());
        let mut runner = RepairRunner::new(RepairConfig::default(), Arc::clone(&fetcher), None, replica);

        let report = runner
            .run(&RepairMode::Manual(vec![range(40, 60)]))
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.ranges[0].planned.origin, RangeOrigin::Manual);
        assert_eq!(*fetcher.fetched.lock().unwrap(), (40..=60).collect::<Vec<_>>());
        assert_eq!(runner.replica().block_count().unwrap(), 61);
    }

    #[tokio::test]
    async fn detected_gap_with_existing_start_is_skipped() {
        struct StaleIndex(SqliteReplica);

        impl ReplicaIndex for StaleIndex {
            fn query_gaps(&self) -> std::result::Result<Vec<HeightRange>, crate::error::ReplicaError> {
                Ok(vec![range(5, 6)])
            }
            fn min_height(&self) -> std::result::Result<Option<u64>, crate::error::ReplicaError> {
                self.0.min_height()
            }
            fn height_exists(&self, height: u64) -> std::result::Result<bool, crate::error::ReplicaError> {
                self.0.height_exists(height)
            }
        }

        impl EntrySink for StaleIndex {
            fn begin(&mut self) -> std::result::Result<(), crate::error::ReplicaError> {
                self.0.begin()
            }
            fn apply_batch(
                &mut self,
                records: &[StateChangeRecord],
                allow_update_on_conflict: bool,
            ) -> std::result::Result<(), crate::error::ReplicaError> {
                self.0.apply_batch(records, allow_update_on_conflict)
            }
            fn commit(&mut self) -> std::result::Result<(), crate::error::ReplicaError> {
                self.0.commit()
            }
            fn rollback(&mut self) -> std::result::Result<(), crate::error::ReplicaError> {
                self.0.rollback()
            }
        }

        let fetcher = Arc::new(StubFetcher::default());
        let mut runner = RepairRunner::new(
            RepairConfig::default(),
            Arc::clone(&fetcher),
            None,
            StaleIndex(seeded_replica(0..=10)),
        );
        let report = runner.run(&RepairMode::DetectGaps).await.unwrap();
        assert_eq!(report.skipped(), 1);
        assert!(report.is_success());
        assert!(fetcher.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_gap_uses_binary_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_config = BinaryLogConfig::in_dir(dir.path());
        let mut writer = BinaryLogWriter::create(&log_config).unwrap();
        for height in 0..=12_000 {
            writer.append(&block(height)).unwrap();
        }
        writer.finish().unwrap();
        let reader = BinaryLogReader::open_json(&log_config).unwrap();

        let replica = seeded_replica([0, 12_000]);
        let fetcher = Arc::new(StubFetcher::default());
        let mut runner = RepairRunner::new(
            RepairConfig::default(),
            Arc::clone(&fetcher),
            Some(reader),
            replica,
        );
        let plan = runner.plan(&RepairMode::DetectGaps).unwrap();
        assert_eq!(plan[0].strategy, Strategy::LogScan);

        let report = runner.run(&RepairMode::DetectGaps).await.unwrap();
        assert!(report.is_success(), "{report:?}");
        assert!(fetcher.fetched.lock().unwrap().is_empty());
        assert_eq!(runner.replica().block_count().unwrap(), 12_001);
        assert!(runner.plan(&RepairMode::DetectGaps).unwrap().is_empty());
    }

    fn log_without(dir: &std::path::Path, last: u64, holes: &[u64]) -> BinaryLogReader {
        let log_config = BinaryLogConfig::in_dir(dir);
        let mut writer = BinaryLogWriter::create(&log_config).unwrap();
        for height in (0..=last).filter(|h| !holes.contains(h)) {
            writer.append(&block(height)).unwrap();
        }
        writer.finish().unwrap();
        BinaryLogReader::open_json(&log_config).unwrap()
    }

    #[tokio::test]
    async fn heights_missing_from_log_come_from_remote() {
        let dir = tempfile::tempdir().unwrap();
        let reader = log_without(dir.path(), 20_000, &[5_000]);
        let fetcher = Arc::new(StubFetcher::default());
        let mut runner = RepairRunner::new(
            RepairConfig::default(),
            Arc::clone(&fetcher),
            Some(reader),
            seeded_replica([0, 20_000]),
        );

        let report = runner.run(&RepairMode::DetectGaps).await.unwrap();
        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.ranges[0].planned.strategy, Strategy::LogScan);
        assert!(matches!(
            report.ranges[0].outcome,
            RangeOutcome::Repaired {
                emitted: 19_999,
                applied: 19_999,
                ..
            }
        ));
        assert_eq!(*fetcher.fetched.lock().unwrap(), vec![5_000]);
        assert_eq!(runner.replica().block_count().unwrap(), 20_001);
        assert!(runner.plan(&RepairMode::DetectGaps).unwrap().is_empty());
    }

    #[tokio::test]
    async fn range_fails_when_log_and_remote_both_lack_a_height() {
        let dir = tempfile::tempdir().unwrap();
        let reader = log_without(dir.path(), 20_000, &[5_000, 5_001, 9_000]);
        let fetcher = Arc::new(StubFetcher {
            permanent: HashSet::from([9_000]),
            ..StubFetcher::default()
        });
        let mut runner = RepairRunner::new(
            RepairConfig::default(),
            Arc::clone(&fetcher),
            Some(reader),
            seeded_replica([0, 20_000]),
        );

        let report = runner.run(&RepairMode::DetectGaps).await.unwrap();
        assert_eq!(report.failed(), 1);
        assert_eq!(
            *report.failures().next().unwrap(),
            RangeError::PartialRangeFailure {
                range: range(1, 19_999),
                failed_heights: vec![9_000],
                failed_count: 1,
            }
        );
        assert_eq!(*fetcher.fetched.lock().unwrap(), vec![5_000, 5_001, 9_000]);
        let remaining: Vec<_> = runner
            .plan(&RepairMode::DetectGaps)
            .unwrap()
            .into_iter()
            .map(|p| p.range)
            .collect();
        assert_eq!(remaining, vec![range(9_000, 9_000)]);
    }

    #[test]
    fn config_validation() {
        RepairConfig::default().validate().unwrap();
        let config = RepairConfig {
            apply_batch_size: 0,
            ..RepairConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("apply_batch_size"));
    }
}
