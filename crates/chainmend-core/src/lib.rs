//! chainmend-core: gap detection and hybrid backfill for block replicas
//!
//! A replica stores one row per block height. When heights go missing this
//! crate finds them and refills them from whichever source is cheapest.
//!
//! # Architecture
//!
//! ```text
//! SqliteReplica ──► gap detection ──► strategy selection
//!                                         │
//!           ┌─────────────────────────────┼──────────────────────┐
//!           ▼                             ▼                      ▼
//!   SequentialRemote              ParallelRemote              LogScan
//!   (RemoteFetcher)          (worker pool, windows)      (BinaryLogReader)
//!           └─────────────────────────────┼──────────────────────┘
//!                                         ▼
//!                        BackfillCommitter ──► SqliteReplica
//! ```
//!
//! # Modules
//!
//! - `gap`: height ranges and gap detection
//! - `replica`: SQLite replica (gap queries and the entry sink)
//! - `binlog`: positional binary log of state-change records
//! - `remote`: HTTP block API client
//! - `strategy`: strategy selection and range sources
//! - `committer`: batched, periodically committed writes
//! - `repair`: run orchestration and reporting
//! - `config`: configuration management
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod binlog;
pub mod committer;
pub mod config;
pub mod error;
pub mod gap;
pub mod logging;
pub mod record;
pub mod remote;
pub mod repair;
pub mod replica;
pub mod retry;
pub mod sink;
pub mod strategy;

pub use error::{Error, Result};

/// Version of the chainmend-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
