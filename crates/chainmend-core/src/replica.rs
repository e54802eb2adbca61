//! SQLite replica: gap queries and idempotent write-back.

use std::path::Path;

use chrono::{DateTime, SecondsFormat};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ReplicaError;
use crate::gap::{Gap, HeightRange, ReplicaIndex};
use crate::record::{BlockPayload, OperationKind, RecordKind, StateChangeRecord};
use crate::sink::EntrySink;

type Result<T> = std::result::Result<T, ReplicaError>;

/// `[replica]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// SQLite database file.
    pub path: std::path::PathBuf,
    /// Busy timeout while another writer holds the lock.
    pub busy_timeout_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("chainmend.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Relational replica backed by a single SQLite connection.
pub struct SqliteReplica {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteReplica {
    /// Open or create the replica at `config.path`.
    pub fn open(config: &ReplicaConfig) -> Result<Self> {
        let path = config.path.as_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened replica");
        Self::with_connection(conn)
    }

    /// Open an existing replica without creating it.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ReplicaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("replica not found: {}", path.display()),
            )));
        }
        Self::open(&ReplicaConfig {
            path: path.to_path_buf(),
            ..ReplicaConfig::default()
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    /// Ascending distinct block heights.
    pub fn populated_heights(&self) -> Result<Vec<u64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT DISTINCT height FROM block ORDER BY height")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut heights = Vec::new();
        for row in rows {
            heights.push(i64_to_u64(row?, "height")?);
        }
        Ok(heights)
    }

    pub fn max_height(&self) -> Result<Option<u64>> {
        let value: Option<i64> = self
            .conn
            .query_row("SELECT MAX(height) FROM block", [], |row| row.get(0))?;
        value.map(|h| i64_to_u64(h, "height")).transpose()
    }

    pub fn block_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM block", [], |row| row.get(0))?;
        i64_to_u64(count, "block_count")
    }

    pub fn state_change_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM state_change", [], |row| row.get(0))?;
        i64_to_u64(count, "state_change_count")
    }

    /// Stored block hash at `height`, hex encoded.
    pub fn block_hash_at(&self, height: u64) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT block_hash FROM block WHERE height = ?1 ORDER BY block_hash LIMIT 1",
                params![u64_to_i64(height, "height")?],
                |row| row.get(0),
            )
            .optional()
            .map_err(ReplicaError::from)
    }

    /// Stored header of the block at `height`.
    pub fn block_at(&self, height: u64) -> Result<Option<BlockPayload>> {
        let row = self
            .conn
            .query_row(
                "SELECT block_version, prev_block_hash, txn_merkle_root, timestamp_nanos,
                        height, nonce, extra_nonce, proposed_in_view, block_hash
                 FROM block WHERE height = ?1 ORDER BY block_hash LIMIT 1",
                params![u64_to_i64(height, "height")?],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((version, prev, merkle, nanos, height, nonce, extra, view, hash)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare_cached(
            "SELECT raw_txn FROM block_transaction WHERE block_hash = ?1 ORDER BY txn_index",
        )?;
        let transactions = stmt
            .query_map(params![hash], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(BlockPayload {
            version: u32::try_from(version).map_err(|_| ReplicaError::IntegerOverflow("block_version"))?,
            prev_block_hash: decode_hex_column(&prev, "prev_block_hash")?,
            txn_merkle_root: decode_hex_column(&merkle, "txn_merkle_root")?,
            timestamp_nanos: nanos,
            height: i64_to_u64(height, "height")?,
            nonce: parse_u64_column(&nonce, "nonce")?,
            extra_nonce: parse_u64_column(&extra, "extra_nonce")?,
            proposed_in_view: i64_to_u64(view, "proposed_in_view")?,
            transactions,
        }))
    }

    fn apply_one(conn: &Connection, record: &StateChangeRecord, allow_update: bool) -> Result<()> {
        match (record.record_kind, record.operation_kind) {
            (RecordKind::Block, OperationKind::Insert | OperationKind::Upsert) => {
                upsert_block(conn, record, allow_update)
            }
            (RecordKind::Block, OperationKind::Delete) => delete_block(conn, record),
            (
                RecordKind::Transaction | RecordKind::Entity { .. },
                OperationKind::Insert | OperationKind::Upsert,
            ) => upsert_state_change(conn, record, allow_update),
            (RecordKind::Transaction | RecordKind::Entity { .. }, OperationKind::Delete) => {
                delete_state_change(conn, record)
            }
        }
    }
}

impl ReplicaIndex for SqliteReplica {
    fn query_gaps(&self) -> Result<Vec<Gap>> {
        let mut stmt = self.conn.prepare_cached(GAP_SQL)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        let mut gaps = Vec::new();
        for row in rows {
            let (start, end) = row?;
            let range = HeightRange::new(i64_to_u64(start, "gap_start")?, i64_to_u64(end, "gap_end")?)
                .map_err(|err| ReplicaError::GapOrder(err.to_string()))?;
            gaps.push(range);
        }
        Ok(gaps)
    }

    fn min_height(&self) -> Result<Option<u64>> {
        let value: Option<i64> = self
            .conn
            .query_row("SELECT MIN(height) FROM block", [], |row| row.get(0))?;
        value.map(|h| i64_to_u64(h, "height")).transpose()
    }

    fn height_exists(&self, height: u64) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM block WHERE height = ?1 LIMIT 1",
                params![u64_to_i64(height, "height")?],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl EntrySink for SqliteReplica {
    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn apply_batch(&mut self, records: &[StateChangeRecord], allow_update_on_conflict: bool) -> Result<()> {
        if !self.in_transaction {
            return Err(ReplicaError::NoTransaction);
        }
        // Savepoint keeps a failed batch from leaving half of its rows behind
        let sp = self.conn.savepoint()?;
        for record in records {
            Self::apply_one(&sp, record, allow_update_on_conflict)?;
        }
        sp.commit()?;
        debug!(records = records.len(), "applied batch");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(ReplicaError::NoTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

fn upsert_block(conn: &Connection, record: &StateChangeRecord, allow_update: bool) -> Result<()> {
    let default_block = BlockPayload {
        height: record.height,
        ..BlockPayload::default()
    };
    let block = record.block.as_ref().unwrap_or(&default_block);
    let block_hash = hex::encode(&record.key_bytes);
    let timestamp = DateTime::from_timestamp_nanos(block.timestamp_nanos)
        .to_rfc3339_opts(SecondsFormat::Nanos, true);

    let sql = if allow_update {
        UPSERT_BLOCK_SQL
    } else {
        INSERT_BLOCK_SQL
    };
    let mut stmt = conn.prepare_cached(sql)?;
    stmt.execute(params![
        block_hash,
        hex::encode(&block.prev_block_hash),
        hex::encode(&block.txn_merkle_root),
        timestamp,
        block.timestamp_nanos,
        u64_to_i64(record.height, "height")?,
        block.nonce.to_string(),
        block.extra_nonce.to_string(),
        i64::from(block.version),
        u64_to_i64(block.proposed_in_view, "proposed_in_view")?,
        u64_to_i64(block.transactions.len() as u64, "txn_count")?,
        record.key_bytes,
    ])?;

    if allow_update {
        conn.prepare_cached("DELETE FROM block_transaction WHERE block_hash = ?1")?
            .execute(params![block_hash])?;
    }
    let mut insert_txn = conn.prepare_cached(
        "INSERT INTO block_transaction (block_hash, txn_index, raw_txn) VALUES (?1, ?2, ?3)
         ON CONFLICT(block_hash, txn_index) DO NOTHING",
    )?;
    for (index, raw) in block.transactions.iter().enumerate() {
        insert_txn.execute(params![block_hash, u64_to_i64(index as u64, "txn_index")?, raw])?;
    }
    Ok(())
}

fn delete_block(conn: &Connection, record: &StateChangeRecord) -> Result<()> {
    let block_hash = hex::encode(&record.key_bytes);
    conn.prepare_cached("DELETE FROM block_transaction WHERE block_hash = ?1")?
        .execute(params![block_hash])?;
    conn.prepare_cached("DELETE FROM block WHERE block_hash = ?1")?
        .execute(params![block_hash])?;
    Ok(())
}

fn upsert_state_change(conn: &Connection, record: &StateChangeRecord, allow_update: bool) -> Result<()> {
    let sql = if allow_update {
        UPSERT_STATE_CHANGE_SQL
    } else {
        INSERT_STATE_CHANGE_SQL
    };
    conn.prepare_cached(sql)?.execute(params![
        record.record_kind.label(),
        i64::from(record.record_kind.encoder_type()),
        record.key_bytes,
        u64_to_i64(record.height, "height")?,
        record.flush_id,
        record.payload,
        record.ancestral_payload,
    ])?;
    Ok(())
}

fn delete_state_change(conn: &Connection, record: &StateChangeRecord) -> Result<()> {
    conn.prepare_cached(
        "DELETE FROM state_change WHERE record_kind = ?1 AND encoder_type = ?2 AND key_bytes = ?3",
    )?
    .execute(params![
        record.record_kind.label(),
        i64::from(record.record_kind.encoder_type()),
        record.key_bytes,
    ])?;
    Ok(())
}

fn u64_to_i64(value: u64, field: &'static str) -> Result<i64> {
    i64::try_from(value).map_err(|_| ReplicaError::IntegerOverflow(field))
}

fn i64_to_u64(value: i64, field: &'static str) -> Result<u64> {
    u64::try_from(value).map_err(|_| ReplicaError::IntegerOverflow(field))
}

fn parse_u64_column(value: &str, field: &'static str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| ReplicaError::InvalidDbValue(format!("{field}: {value:?}")))
}

fn decode_hex_column(value: &str, field: &'static str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|err| ReplicaError::InvalidDbValue(format!("{field}: {err}")))
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS block (
    block_hash TEXT PRIMARY KEY,
    prev_block_hash TEXT NOT NULL,
    txn_merkle_root TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    timestamp_nanos INTEGER NOT NULL,
    height INTEGER NOT NULL,
    nonce TEXT NOT NULL,
    extra_nonce TEXT NOT NULL,
    block_version INTEGER NOT NULL,
    proposed_in_view INTEGER NOT NULL,
    txn_count INTEGER NOT NULL,
    source_key BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_block_height ON block(height);

CREATE TABLE IF NOT EXISTS block_transaction (
    block_hash TEXT NOT NULL,
    txn_index INTEGER NOT NULL,
    raw_txn BLOB NOT NULL,
    PRIMARY KEY (block_hash, txn_index)
);

CREATE TABLE IF NOT EXISTS state_change (
    record_kind TEXT NOT NULL,
    encoder_type INTEGER NOT NULL,
    key_bytes BLOB NOT NULL,
    height INTEGER NOT NULL,
    flush_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    ancestral_payload BLOB,
    PRIMARY KEY (record_kind, encoder_type, key_bytes)
);
CREATE INDEX IF NOT EXISTS idx_state_change_height ON state_change(height);
";

const GAP_SQL: &str = r"
WITH ordered AS (
    SELECT DISTINCT height FROM block
),
sequenced AS (
    SELECT height, LEAD(height) OVER (ORDER BY height) AS next_height FROM ordered
)
SELECT height + 1 AS gap_start, next_height - 1 AS gap_end
FROM sequenced
WHERE next_height IS NOT NULL AND next_height > height + 1
ORDER BY gap_start
";

const INSERT_BLOCK_SQL: &str = r"
INSERT INTO block (
    block_hash, prev_block_hash, txn_merkle_root, timestamp, timestamp_nanos, height,
    nonce, extra_nonce, block_version, proposed_in_view, txn_count, source_key
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(block_hash) DO NOTHING
";

const UPSERT_BLOCK_SQL: &str = r"
INSERT INTO block (
    block_hash, prev_block_hash, txn_merkle_root, timestamp, timestamp_nanos, height,
    nonce, extra_nonce, block_version, proposed_in_view, txn_count, source_key
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(block_hash) DO UPDATE SET
    prev_block_hash = excluded.prev_block_hash,
    txn_merkle_root = excluded.txn_merkle_root,
    timestamp = excluded.timestamp,
    timestamp_nanos = excluded.timestamp_nanos,
    height = excluded.height,
    nonce = excluded.nonce,
    extra_nonce = excluded.extra_nonce,
    block_version = excluded.block_version,
    proposed_in_view = excluded.proposed_in_view,
    txn_count = excluded.txn_count,
    source_key = excluded.source_key
";

const INSERT_STATE_CHANGE_SQL: &str = r"
INSERT INTO state_change (
    record_kind, encoder_type, key_bytes, height, flush_id, payload, ancestral_payload
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(record_kind, encoder_type, key_bytes) DO NOTHING
";

const UPSERT_STATE_CHANGE_SQL: &str = r"
INSERT INTO state_change (
    record_kind, encoder_type, key_bytes, height, flush_id, payload, ancestral_payload
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(record_kind, encoder_type, key_bytes) DO UPDATE SET
    height = excluded.height,
    flush_id = excluded.flush_id,
    payload = excluded.payload,
    ancestral_payload = excluded.ancestral_payload
";
