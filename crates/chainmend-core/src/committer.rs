//! Batched, periodically committed write-back into an [`EntrySink`].
//!
//! Records arrive one at a time through [`RecordConsumer::consume`]. They are
//! grouped into batches of a single operation kind, applied inside a lazily
//! opened transaction, and committed every `commit_interval` applied records.
//! Whatever is still open when the range finishes is committed as well.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::gap::HeightRange;
use crate::record::{OperationKind, StateChangeRecord};
use crate::sink::EntrySink;
use crate::strategy::RecordConsumer;

/// Committer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitterConfig {
    /// Applied records per transaction.
    pub commit_interval: u64,
    /// Records per `apply_batch` call.
    pub apply_batch_size: usize,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self {
            commit_interval: 10_000,
            apply_batch_size: 100,
        }
    }
}

/// Write statistics of one range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RangeCommitStats {
    pub applied: u64,
    pub commits: u64,
    /// Heights with at least one record the sink rejected, ascending.
    pub failed_heights: Vec<u64>,
}

pub struct BackfillCommitter<S> {
    sink: S,
    config: CommitterConfig,
    range: Option<HeightRange>,
    allow_update: bool,
    batch: Vec<StateChangeRecord>,
    in_transaction: bool,
    since_commit: u64,
    stats: RangeCommitStats,
    total_commits: u64,
}

impl<S: EntrySink> BackfillCommitter<S> {
    pub fn new(sink: S, config: CommitterConfig) -> Self {
        let config = CommitterConfig {
            commit_interval: config.commit_interval.max(1),
            apply_batch_size: config.apply_batch_size.max(1),
        };
        Self {
            sink,
            config,
            range: None,
            allow_update: false,
            batch: Vec::with_capacity(config.apply_batch_size),
            in_transaction: false,
            since_commit: 0,
            stats: RangeCommitStats::default(),
            total_commits: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Commits across every range so far.
    pub fn total_commits(&self) -> u64 {
        self.total_commits
    }

    /// Start collecting records for `range`.
    pub fn begin_range(&mut self, range: HeightRange, allow_update_on_conflict: bool) {
        self.range = Some(range);
        self.allow_update = allow_update_on_conflict;
        self.batch.clear();
        self.since_commit = 0;
        self.stats = RangeCommitStats::default();
    }

    /// Apply anything buffered and commit the open transaction, if any.
    fn commit_pending(&mut self) -> Result<()> {
        self.flush_batch()?;
        if self.in_transaction {
            self.commit()?;
        }
        Ok(())
    }

    /// Commit whatever is pending and return the range statistics.
    pub fn finish_range(&mut self) -> Result<RangeCommitStats> {
        self.commit_pending()?;
        self.range = None;
        let mut stats = std::mem::take(&mut self.stats);
        stats.failed_heights.sort_unstable();
        stats.failed_heights.dedup();
        Ok(stats)
    }

    fn push(&mut self, mut record: StateChangeRecord) -> Result<()> {
        // Repair writes are always upserts
        if record.operation_kind == OperationKind::Insert {
            record.operation_kind = OperationKind::Upsert;
        }
        if self
            .batch
            .last()
            .is_some_and(|last| last.operation_kind != record.operation_kind)
        {
            self.flush_batch()?;
        }
        self.batch.push(record);
        if self.batch.len() >= self.config.apply_batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        if !self.in_transaction {
            self.sink
                .begin()
                .map_err(|source| Error::Commit { stage: "begin", source })?;
            self.in_transaction = true;
        }

        let batch = std::mem::take(&mut self.batch);
        match self.sink.apply_batch(&batch, self.allow_update) {
            Ok(()) => self.note_applied(batch.len() as u64),
            Err(err) => {
                warn!(
                    first_height = batch.first().map(|r| r.height),
                    records = batch.len(),
                    error = %err,
                    "batch apply failed; retrying records one by one"
                );
                for record in &batch {
                    match self
                        .sink
                        .apply_batch(std::slice::from_ref(record), self.allow_update)
                    {
                        Ok(()) => self.note_applied(1),
                        Err(err) => {
                            warn!(
                                height = record.height,
                                kind = %record.record_kind,
                                key = %record.key_hex(),
                                error = %err,
                                "failed to apply record"
                            );
                            self.stats.failed_heights.push(record.height);
                        }
                    }
                }
            }
        }
        self.batch = batch;
        self.batch.clear();

        if self.since_commit >= self.config.commit_interval {
            self.commit()?;
        }
        Ok(())
    }

    fn note_applied(&mut self, count: u64) {
        self.stats.applied += count;
        self.since_commit += count;
    }

    fn commit(&mut self) -> Result<()> {
        if let Err(source) = self.sink.commit() {
            self.in_transaction = false;
            if let Err(rollback_err) = self.sink.rollback() {
                warn!(error = %rollback_err, "rollback after failed commit also failed");
            }
            return Err(Error::Commit {
                stage: "commit",
                source,
            });
        }
        self.in_transaction = false;
        self.since_commit = 0;
        self.stats.commits += 1;
        self.total_commits += 1;

        let expected = self.range.map_or(0, |r| r.size());
        let percent = if expected == 0 {
            100.0
        } else {
            self.stats.applied as f64 / expected as f64 * 100.0
        };
        info!(
            start = self.range.map(|r| r.start()),
            end = self.range.map(|r| r.end()),
            applied = self.stats.applied,
            expected,
            percent = format!("{percent:.1}"),
            commits = self.stats.commits,
            "committed backfill batch"
        );
        Ok(())
    }
}

impl<S: EntrySink> RecordConsumer for BackfillCommitter<S> {
    fn consume(&mut self, record: StateChangeRecord) -> Result<()> {
        self.push(record)
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.commit_pending()
    }
}
