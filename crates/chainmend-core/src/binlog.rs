//! Binary state-change log: index file + data file.
//!
//! The index holds one fixed-width entry per positional index. The data file
//! holds records framed as a LEB128 unsigned length prefix followed by the
//! payload bytes. Positional index and height are not the same thing: a
//! block usually contributes several entries (transactions, entity changes),
//! so the block at height `h` sits at some position `>= h`.
//!
//! Layouts:
//! - `offsets`: `u64` LE data-file offset (8 bytes per entry)
//! - `extended`: `u64` LE offset, length, height (24 bytes per entry)

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::gap::{Gap, HeightRange, gaps_from_sorted_heights};
use crate::record::{JsonRecordDecoder, RecordDecoder, StateChangeRecord, encode_json};

pub const DEFAULT_INDEX_FILE: &str = "state-changes-index.bin";
pub const DEFAULT_DATA_FILE: &str = "state-changes.bin";

/// On-disk index entry layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexLayout {
    #[default]
    Offsets,
    Extended,
}

impl IndexLayout {
    #[must_use]
    pub const fn entry_width(self) -> u64 {
        match self {
            Self::Offsets => 8,
            Self::Extended => 24,
        }
    }
}

/// `[binlog]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryLogConfig {
    /// Directory holding the index and data files. Unset disables log scans.
    pub dir: Option<PathBuf>,
    pub index_file: String,
    pub data_file: String,
    pub layout: IndexLayout,
    /// Records larger than this are decode errors.
    pub max_record_bytes: u64,
    /// Decode errors tolerated per scan before aborting it.
    pub max_decode_errors: u64,
    /// Minimum positions scanned past the range end.
    pub scan_slack_floor: u64,
    /// Expected upper bound of entries per block, scales the scan bound.
    pub records_per_block: u64,
}

impl Default for BinaryLogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            index_file: DEFAULT_INDEX_FILE.to_string(),
            data_file: DEFAULT_DATA_FILE.to_string(),
            layout: IndexLayout::Offsets,
            max_record_bytes: 10 * 1024 * 1024,
            max_decode_errors: 100,
            scan_slack_floor: 1_000_000,
            records_per_block: 64,
        }
    }
}

impl BinaryLogConfig {
    /// Config for a log in `dir` with default file names.
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index_file.trim().is_empty() || self.data_file.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "binlog.index_file and binlog.data_file must be non-empty".to_string(),
            ));
        }
        if self.max_record_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "binlog.max_record_bytes must be >= 1".to_string(),
            ));
        }
        if self.records_per_block == 0 {
            return Err(ConfigError::ValidationError(
                "binlog.records_per_block must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn index_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(&self.index_file))
    }

    #[must_use]
    pub fn data_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(&self.data_file))
    }

    /// Both files exist on disk.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(
            (self.index_path(), self.data_path()),
            (Some(index), Some(data)) if index.is_file() && data.is_file()
        )
    }

    /// Positions a scan may run past the range end before giving up.
    #[must_use]
    pub fn scan_bound(&self, range: HeightRange) -> u64 {
        range
            .size()
            .saturating_mul(self.records_per_block)
            .max(self.scan_slack_floor)
    }
}

/// Errors raised while reading the log.
#[derive(Debug, Error)]
pub enum LogReadError {
    #[error("binary log directory is not configured")]
    NotConfigured,

    #[error("position {position} is past the end of the index")]
    NotFound { position: u64 },

    #[error("entry at position {position} is truncated: {reason}")]
    Truncated { position: u64, reason: String },

    #[error("entry at position {position} cannot be decoded: {reason}")]
    Decode { position: u64, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LogReadError {
    /// Entry-local damage that a scan may skip.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::Decode { .. })
    }
}

/// One decoded index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    /// Stored payload length (extended layout only).
    pub length: Option<u64>,
    /// Stored height (extended layout only).
    pub height: Option<u64>,
}

/// A decoded record and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub position: u64,
    pub offset: u64,
    pub record: StateChangeRecord,
}

/// Why a range scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStop {
    /// Every height of the range was found.
    Complete,
    /// The index ended first.
    EndOfLog,
    /// The safety bound past the range end was exhausted.
    BoundExceeded,
    /// Too many undecodable entries.
    DecodeLimit,
}

/// Result of [`BinaryLogReader::scan_range`].
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub range: HeightRange,
    pub stop: ScanStop,
    pub positions_scanned: u64,
    pub last_position: u64,
    pub decode_errors: u64,
    pub duplicates: u64,
    found: HashSet<u64>,
}

impl ScanOutcome {
    #[must_use]
    pub fn found_count(&self) -> u64 {
        self.found.len() as u64
    }

    /// First `limit` missing heights, ascending, and the total missing count.
    #[must_use]
    pub fn missing(&self, limit: usize) -> (Vec<u64>, u64) {
        let total = self.range.size() - self.found_count();
        let listed = self
            .range
            .heights()
            .filter(|h| !self.found.contains(h))
            .take(limit)
            .collect();
        (listed, total)
    }
}

/// Diagnostic summary of a whole log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogCoverageReport {
    pub entries: u64,
    pub block_records: u64,
    pub other_records: u64,
    pub decode_errors: u64,
    pub distinct_heights: u64,
    pub duplicate_heights: u64,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
    /// Missing heights strictly inside `[min_height, max_height]`.
    pub gaps: Vec<Gap>,
    pub missing_heights: u64,
}

/// Random-access reader over the index + data pair.
pub struct BinaryLogReader {
    config: BinaryLogConfig,
    index: BufReader<File>,
    data: BufReader<File>,
    entries: u64,
    data_len: u64,
    decoder: Arc<dyn RecordDecoder>,
}

impl std::fmt::Debug for BinaryLogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryLogReader")
            .field("dir", &self.config.dir)
            .field("layout", &self.config.layout)
            .field("entries", &self.entries)
            .field("data_len", &self.data_len)
            .finish_non_exhaustive()
    }
}

impl BinaryLogReader {
    pub fn open(config: &BinaryLogConfig, decoder: Arc<dyn RecordDecoder>) -> Result<Self, LogReadError> {
        let (Some(index_path), Some(data_path)) = (config.index_path(), config.data_path()) else {
            return Err(LogReadError::NotConfigured);
        };
        let index = File::open(&index_path)?;
        let data = File::open(&data_path)?;

        let width = config.layout.entry_width();
        let index_len = index.metadata()?.len();
        if index_len % width != 0 {
            warn!(
                path = %index_path.display(),
                index_len,
                width,
                "index file has a partial trailing entry; ignoring it"
            );
        }
        let data_len = data.metadata()?.len();

        debug!(
            index = %index_path.display(),
            entries = index_len / width,
            data_len,
            "opened binary log"
        );

        Ok(Self {
            config: config.clone(),
            index: BufReader::new(index),
            data: BufReader::new(data),
            entries: index_len / width,
            data_len,
            decoder,
        })
    }

    /// Open with the JSON record decoder.
    pub fn open_json(config: &BinaryLogConfig) -> Result<Self, LogReadError> {
        Self::open(config, Arc::new(JsonRecordDecoder))
    }

    /// Number of index entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Read the index entry at `position`.
    pub fn index_entry(&mut self, position: u64) -> Result<IndexEntry, LogReadError> {
        if position >= self.entries {
            return Err(LogReadError::NotFound { position });
        }
        let width = self.config.layout.entry_width();
        seek_buffered(&mut self.index, position * width)?;

        let mut buf = [0u8; 24];
        let slot = &mut buf[..width as usize];
        self.index.read_exact(slot).map_err(|err| truncated_or_io(position, err))?;

        let word = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
            u64::from_le_bytes(bytes)
        };
        Ok(match self.config.layout {
            IndexLayout::Offsets => IndexEntry {
                offset: word(0),
                length: None,
                height: None,
            },
            IndexLayout::Extended => IndexEntry {
                offset: word(0),
                length: Some(word(1)),
                height: Some(word(2)),
            },
        })
    }

    /// Read and decode the record at `position`.
    pub fn read(&mut self, position: u64) -> Result<LogRecord, LogReadError> {
        let entry = self.index_entry(position)?;
        self.read_entry(position, entry)
    }

    fn read_entry(&mut self, position: u64, entry: IndexEntry) -> Result<LogRecord, LogReadError> {
        if entry.offset >= self.data_len {
            return Err(LogReadError::Truncated {
                position,
                reason: format!("offset {} past data end {}", entry.offset, self.data_len),
            });
        }
        seek_buffered(&mut self.data, entry.offset)?;

        let len = leb128::read::unsigned(&mut self.data).map_err(|err| match err {
            leb128::read::Error::IoError(err) => truncated_or_io(position, err),
            leb128::read::Error::Overflow => LogReadError::Decode {
                position,
                reason: "length prefix overflows u64".to_string(),
            },
        })?;

        if let Some(stored) = entry.length {
            if stored != len {
                return Err(LogReadError::Decode {
                    position,
                    reason: format!("index length {stored} != prefix length {len}"),
                });
            }
        }
        if len > self.config.max_record_bytes {
            return Err(LogReadError::Decode {
                position,
                reason: format!(
                    "record length {len} exceeds limit {}",
                    self.config.max_record_bytes
                ),
            });
        }
        let payload_start = self.data.stream_position()?;
        if payload_start.saturating_add(len) > self.data_len {
            return Err(LogReadError::Truncated {
                position,
                reason: format!("record of {len} bytes runs past data end"),
            });
        }

        let mut payload = vec![0u8; len as usize];
        self.data
            .read_exact(&mut payload)
            .map_err(|err| truncated_or_io(position, err))?;

        let record = self
            .decoder
            .decode(&payload)
            .map_err(|err| LogReadError::Decode {
                position,
                reason: err.0,
            })?;

        Ok(LogRecord {
            position,
            offset: entry.offset,
            record,
        })
    }

    /// Scan forward from positional index `range.start` and emit the first
    /// block record of every height in `range`, in log order.
    ///
    /// Undecodable entries are skipped and counted; errors returned by
    /// `emit` abort the scan. The caller decides what a deficit means.
    pub fn scan_range(
        &mut self,
        range: HeightRange,
        emit: &mut dyn FnMut(StateChangeRecord) -> crate::Result<()>,
    ) -> crate::Result<ScanOutcome> {
        let bound = self.config.scan_bound(range);
        let last_allowed = range.end().saturating_add(bound);
        let wanted = range.size();

        let mut outcome = ScanOutcome {
            range,
            stop: ScanStop::EndOfLog,
            positions_scanned: 0,
            last_position: range.start(),
            decode_errors: 0,
            duplicates: 0,
            found: HashSet::new(),
        };

        let mut position = range.start();
        loop {
            if outcome.found_count() == wanted {
                outcome.stop = ScanStop::Complete;
                break;
            }
            if position >= self.entries {
                outcome.stop = ScanStop::EndOfLog;
                break;
            }
            if position > last_allowed {
                outcome.stop = ScanStop::BoundExceeded;
                break;
            }
            outcome.last_position = position;
            outcome.positions_scanned += 1;

            let result = self
                .index_entry(position)
                .and_then(|entry| match entry.height {
                    Some(height) if !range.contains(height) => Ok(None),
                    _ => self.read_entry(position, entry).map(Some),
                });

            match result {
                Ok(Some(LogRecord { record, .. })) => {
                    if record.is_block() && range.contains(record.height) {
                        if outcome.found.insert(record.height) {
                            emit(record)?;
                        } else {
                            outcome.duplicates += 1;
                            debug!(position, height = record.height, "duplicate block in log");
                        }
                    }
                }
                Ok(None) => {}
                Err(err) if err.is_skippable() => {
                    outcome.decode_errors += 1;
                    warn!(position, error = %err, "skipping undecodable log entry");
                    if outcome.decode_errors > self.config.max_decode_errors {
                        outcome.stop = ScanStop::DecodeLimit;
                        break;
                    }
                }
                Err(err) => return Err(err.into()),
            }
            position += 1;
        }

        info!(
            start = range.start(),
            end = range.end(),
            found = outcome.found_count(),
            scanned = outcome.positions_scanned,
            decode_errors = outcome.decode_errors,
            stop = ?outcome.stop,
            "binary log scan finished"
        );
        Ok(outcome)
    }

    /// Scan the whole log and summarize block coverage.
    pub fn coverage_report(&mut self) -> Result<LogCoverageReport, LogReadError> {
        let mut report = LogCoverageReport {
            entries: self.entries,
            ..LogCoverageReport::default()
        };
        let mut heights = Vec::new();

        for position in 0..self.entries {
            match self.read(position) {
                Ok(LogRecord { record, .. }) if record.is_block() => {
                    report.block_records += 1;
                    heights.push(record.height);
                }
                Ok(_) => report.other_records += 1,
                Err(err) if err.is_skippable() => {
                    report.decode_errors += 1;
                    debug!(position, error = %err, "undecodable entry in coverage scan");
                }
                Err(err) => return Err(err),
            }
            if position > 0 && position % 1_000_000 == 0 {
                info!(position, entries = self.entries, "coverage scan progress");
            }
        }

        heights.sort_unstable();
        let total = heights.len() as u64;
        heights.dedup();
        report.distinct_heights = heights.len() as u64;
        report.duplicate_heights = total - report.distinct_heights;
        report.min_height = heights.first().copied();
        report.max_height = heights.last().copied();
        report.gaps = gaps_from_sorted_heights(&heights, false);
        report.missing_heights = report.gaps.iter().map(HeightRange::size).sum();
        Ok(report)
    }
}

/// Move to `target`, keeping buffered bytes when the target is already
/// buffered. Sequential scans read entry after entry from the same buffer.
fn seek_buffered(reader: &mut BufReader<File>, target: u64) -> io::Result<()> {
    let current = reader.stream_position()?;
    if current != target {
        reader.seek_relative(target as i64 - current as i64)?;
    }
    Ok(())
}

fn truncated_or_io(position: u64, err: io::Error) -> LogReadError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        LogReadError::Truncated {
            position,
            reason: err.to_string(),
        }
    } else {
        LogReadError::Io(err)
    }
}

/// Sequential writer producing the index + data pair.
pub struct BinaryLogWriter {
    layout: IndexLayout,
    index: BufWriter<File>,
    data: BufWriter<File>,
    data_offset: u64,
    entries: u64,
}

impl BinaryLogWriter {
    /// Create (or truncate) the log files named by `config`.
    pub fn create(config: &BinaryLogConfig) -> Result<Self, LogReadError> {
        let (Some(index_path), Some(data_path), Some(dir)) =
            (config.index_path(), config.data_path(), config.dir.as_ref())
        else {
            return Err(LogReadError::NotConfigured);
        };
        std::fs::create_dir_all(dir)?;
        let open = |path: &PathBuf| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
        };
        Ok(Self {
            layout: config.layout,
            index: BufWriter::new(open(&index_path)?),
            data: BufWriter::new(open(&data_path)?),
            data_offset: 0,
            entries: 0,
        })
    }

    /// Append raw payload bytes; returns the positional index.
    /// `height` is stored only by the extended layout.
    pub fn append_raw(&mut self, payload: &[u8], height: u64) -> io::Result<u64> {
        let offset = self.data_offset;
        let len = payload.len() as u64;
        let prefix = leb128::write::unsigned(&mut self.data, len)?;
        self.data.write_all(payload)?;
        self.data_offset += prefix as u64 + len;

        self.index.write_all(&offset.to_le_bytes())?;
        if self.layout == IndexLayout::Extended {
            self.index.write_all(&len.to_le_bytes())?;
            self.index.write_all(&height.to_le_bytes())?;
        }

        let position = self.entries;
        self.entries += 1;
        Ok(position)
    }

    /// Append a record encoded as JSON.
    pub fn append(&mut self, record: &StateChangeRecord) -> io::Result<u64> {
        let payload = encode_json(record).map_err(io::Error::other)?;
        self.append_raw(&payload, record.height)
    }

    /// Flush both files; returns the number of entries written.
    pub fn finish(mut self) -> io::Result<u64> {
        self.data.flush()?;
        self.index.flush()?;
        Ok(self.entries)
    }
}
