//! Error types for chainmend-core

use std::fmt::Write;
use thiserror::Error;

use crate::gap::HeightRange;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chainmend-core.
///
/// Every variant here aborts the run. Per-range failures are reported as
/// [`RangeError`] inside the repair report instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (fatal at startup)
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Replica (relational store) errors outside the commit path
    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    /// Binary log could not be opened or read
    #[error("Binary log error: {0}")]
    Log(#[from] crate::binlog::LogReadError),

    /// Transaction begin/commit failed; the outcome of in-flight writes is ambiguous
    #[error("Commit failed during {stage}: {source}")]
    Commit {
        stage: &'static str,
        #[source]
        source: ReplicaError,
    },

    /// Runtime errors (HTTP client construction, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A worker task panicked
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Replica(err) => Some(err.remediation()),
            Self::Log(_) => Some(
                Remediation::new("Check the state-change directory and file names, then retry.")
                    .command("Inspect log", "chainmend scan-log")
                    .alternative("Unset binlog.dir to repair from the remote API only."),
            ),
            Self::Commit { .. } => Some(
                Remediation::new(
                    "A commit failed. Re-run the repair; writes are upserts and safe to repeat.",
                )
                .command("Re-detect gaps", "chainmend gaps")
                .command("Re-run repair", "chainmend repair")
                .alternative("Check disk space and replica file permissions."),
            ),
            Self::Runtime(_) | Self::Panicked(_) => Some(
                Remediation::new("Re-run the repair; completed ranges are not repeated.")
                    .command("Re-run repair", "chainmend repair")
                    .alternative("If the failure persists, lower --workers and retry."),
            ),
        }
    }
}

/// Replica-specific errors
#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("integer conversion overflow for field: {0}")]
    IntegerOverflow(&'static str),

    #[error("invalid database value: {0}")]
    InvalidDbValue(String),

    #[error("gap query returned out-of-order or overlapping ranges: {0}")]
    GapOrder(String),

    #[error("no transaction is open")]
    NoTransaction,
}

impl ReplicaError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Sqlite(_) | Self::Io(_) => Remediation::new(
                "Replica operation failed. Check the replica path and permissions.",
            )
            .command("Show gaps", "chainmend gaps")
            .alternative("Ensure no other process holds a write lock on the replica."),
            Self::IntegerOverflow(field) => Remediation::new(format!(
                "Value for {field} does not fit the replica column type."
            ))
            .command("Show gaps", "chainmend gaps"),
            Self::InvalidDbValue(_) | Self::GapOrder(_) => Remediation::new(
                "Gap detection produced inconsistent ranges. The replica may be corrupt.",
            )
            .command("Integrity check", "sqlite3 replica.db 'PRAGMA integrity_check'"),
            Self::NoTransaction => Remediation::new("Internal sequencing error; re-run the repair.")
                .command("Re-run repair", "chainmend repair"),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) | Self::SerializeFailed(_) => {
                Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                    .command("Show effective config", "chainmend config")
            }
            Self::InvalidOverride { key, .. } => Remediation::new(format!(
                "Environment override {key} is not valid. Fix or unset it."
            ))
            .command("Unset override", format!("unset {key}")),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show effective config", "chainmend config")
            }
        }
    }
}

/// Maximum number of heights listed verbatim in a range error.
pub const LISTED_HEIGHTS_LIMIT: usize = 10;

/// Failure of one repair range. The run continues with the next range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// No configured source could serve the range.
    #[error("no source could serve {range}: {reason}")]
    SourceUnavailable { range: HeightRange, reason: String },

    /// Some heights could not be fetched or applied.
    #[error("{failed_count} heights in {range} failed (first: {failed_heights:?})")]
    PartialRangeFailure {
        range: HeightRange,
        failed_heights: Vec<u64>,
        failed_count: u64,
    },

    /// The binary log did not contain every height of the range.
    #[error("{missing_count} heights in {range} not found in binary log (first: {missing:?})")]
    MissingHeights {
        range: HeightRange,
        missing: Vec<u64>,
        missing_count: u64,
    },

    /// Too many undecodable records while scanning the binary log.
    #[error("binary log scan for {range} aborted after {errors} decode errors (last position {last_position})")]
    DecodeCorruption {
        range: HeightRange,
        errors: u64,
        last_position: u64,
    },
}

impl RangeError {
    /// Build a partial-failure error from an unordered list of failed heights.
    #[must_use]
    pub fn partial(range: HeightRange, mut failed: Vec<u64>) -> Self {
        failed.sort_unstable();
        failed.dedup();
        let failed_count = failed.len() as u64;
        failed.truncate(LISTED_HEIGHTS_LIMIT);
        Self::PartialRangeFailure {
            range,
            failed_heights: failed,
            failed_count,
        }
    }

    /// The range this error belongs to.
    #[must_use]
    pub fn range(&self) -> HeightRange {
        match self {
            Self::SourceUnavailable { range, .. }
            | Self::PartialRangeFailure { range, .. }
            | Self::MissingHeights { range, .. }
            | Self::DecodeCorruption { range, .. } => *range,
        }
    }

    /// Stable label used in structured logs and reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::PartialRangeFailure { .. } => "partial_range_failure",
            Self::MissingHeights { .. } => "missing_heights",
            Self::DecodeCorruption { .. } => "decode_corruption",
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
