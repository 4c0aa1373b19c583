//! Embedded SQLite backend.
//!
//! Two connections in WAL mode: every mutation goes through the writer
//! inside one transaction, reads use a dedicated connection so a long
//! ancestor walk never stalls header ingestion.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Row};

use pulse_consensus::BlockHash;

use crate::{
    work_from_decimal, work_to_decimal, ChainBatch, HeaderRecord, HeaderState, HeaderStore,
    StoreError,
};

const SCHEMA_VERSION: i64 = 1;

const CREATE_SQL: &str = "
CREATE TABLE IF NOT EXISTS headers (
    hash          TEXT PRIMARY KEY,
    version       INTEGER NOT NULL,
    merkleroot    TEXT NOT NULL,
    timestamp     INTEGER NOT NULL,
    bits          INTEGER NOT NULL,
    nonce         INTEGER NOT NULL,
    previousblock TEXT NOT NULL,
    height        INTEGER NOT NULL,
    chainwork     TEXT NOT NULL,
    cumulatedwork TEXT NOT NULL,
    header_state  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_headers_longest_height
    ON headers (height) WHERE header_state = 'LONGEST_CHAIN';
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
";

const SELECT_COLUMNS: &str = "hash, version, merkleroot, timestamp, bits, nonce, \
     previousblock, height, chainwork, cumulatedwork, header_state";

pub struct SqliteHeaderStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl SqliteHeaderStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let writer = Connection::open(path.as_ref()).map_err(backend)?;
        writer
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(backend)?;
        writer
            .pragma_update(None, "synchronous", "NORMAL")
            .map_err(backend)?;
        writer
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(backend)?;
        let reader = Connection::open(path.as_ref()).map_err(backend)?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn record_from_row(row: &Row<'_>) -> Result<HeaderRecord, StoreError> {
    let hash: String = row.get(0).map_err(backend)?;
    let merkle_root: String = row.get(2).map_err(backend)?;
    let prev_hash: String = row.get(6).map_err(backend)?;
    let chainwork: String = row.get(8).map_err(backend)?;
    let cumulated_work: String = row.get(9).map_err(backend)?;
    let state: String = row.get(10).map_err(backend)?;

    Ok(HeaderRecord {
        hash: parse_hash(&hash)?,
        version: row.get(1).map_err(backend)?,
        merkle_root: parse_hash(&merkle_root)?,
        time: row.get::<_, i64>(3).map_err(backend)? as u32,
        bits: row.get::<_, i64>(4).map_err(backend)? as u32,
        nonce: row.get::<_, i64>(5).map_err(backend)? as u32,
        prev_hash: parse_hash(&prev_hash)?,
        height: row.get::<_, i64>(7).map_err(backend)? as u32,
        chainwork: work_from_decimal(&chainwork)?,
        cumulated_work: work_from_decimal(&cumulated_work)?,
        state: HeaderState::parse(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown header state {state:?}")))?,
    })
}

fn parse_hash(hex: &str) -> Result<BlockHash, StoreError> {
    BlockHash::from_hex(hex).map_err(|err| StoreError::Corrupt(format!("bad hash {hex:?}: {err}")))
}

fn query_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<HeaderRecord>, StoreError> {
    let mut statement = conn.prepare_cached(sql).map_err(backend)?;
    let row = statement
        .query_row(params, |row| {
            // Defer field validation so corruption maps to StoreError::Corrupt
            // rather than a driver error.
            Ok(record_from_row(row))
        })
        .optional()
        .map_err(backend)?;
    row.transpose()
}

impl HeaderStore for SqliteHeaderStore {
    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.writer.lock().expect("sqlite writer lock");
        conn.execute_batch(CREATE_SQL).map_err(backend)?;
        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(backend)?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )
                .map_err(backend)?;
            }
            Some(found) if found == SCHEMA_VERSION => {}
            Some(found) => {
                return Err(StoreError::Backend(format!(
                    "unsupported schema version {found} (expected {SCHEMA_VERSION})"
                )));
            }
        }
        Ok(())
    }

    fn get(&self, hash: &BlockHash) -> Result<Option<HeaderRecord>, StoreError> {
        let conn = self.reader.lock().expect("sqlite reader lock");
        query_one(
            &conn,
            &format!("SELECT {SELECT_COLUMNS} FROM headers WHERE hash = ?1"),
            params![hash.to_string()],
        )
    }

    fn get_by_height(&self, height: u32) -> Result<Option<HeaderRecord>, StoreError> {
        let conn = self.reader.lock().expect("sqlite reader lock");
        query_one(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM headers \
                 WHERE height = ?1 AND header_state = 'LONGEST_CHAIN'"
            ),
            params![height as i64],
        )
    }

    fn tip(&self) -> Result<Option<HeaderRecord>, StoreError> {
        let conn = self.reader.lock().expect("sqlite reader lock");
        query_one(
            &conn,
            &format!(
                "SELECT {SELECT_COLUMNS} FROM headers \
                 WHERE header_state = 'LONGEST_CHAIN' \
                 ORDER BY height DESC LIMIT 1"
            ),
            [],
        )
    }

    fn commit(&self, batch: &ChainBatch) -> Result<(), StoreError> {
        let mut conn = self.writer.lock().expect("sqlite writer lock");
        let tx = conn.transaction().map_err(backend)?;
        {
            let mut insert = tx
                .prepare_cached(
                    "INSERT INTO headers (hash, version, merkleroot, timestamp, bits, nonce, \
                     previousblock, height, chainwork, cumulatedwork, header_state) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(hash) DO UPDATE SET \
                     height = excluded.height, chainwork = excluded.chainwork, \
                     cumulatedwork = excluded.cumulatedwork, header_state = excluded.header_state",
                )
                .map_err(backend)?;
            for record in &batch.inserts {
                insert
                    .execute(params![
                        record.hash.to_string(),
                        record.version,
                        record.merkle_root.to_string(),
                        record.time as i64,
                        record.bits as i64,
                        record.nonce as i64,
                        record.prev_hash.to_string(),
                        record.height as i64,
                        work_to_decimal(&record.chainwork),
                        work_to_decimal(&record.cumulated_work),
                        record.state.as_str(),
                    ])
                    .map_err(backend)?;
            }

            let mut update = tx
                .prepare_cached("UPDATE headers SET header_state = ?2 WHERE hash = ?1")
                .map_err(backend)?;
            for (hash, state) in &batch.state_changes {
                let changed = update
                    .execute(params![hash.to_string(), state.as_str()])
                    .map_err(backend)?;
                if changed == 0 {
                    return Err(StoreError::Corrupt(format!(
                        "state change for unknown header {hash}"
                    )));
                }
            }
        }
        tx.commit().map_err(backend)
    }

    fn header_count(&self) -> Result<u64, StoreError> {
        let conn = self.reader.lock().expect("sqlite reader lock");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM headers", [], |row| row.get(0))
            .map_err(backend)?;
        Ok(count as u64)
    }
}
