use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{Connection, params};

use crate::metadata::{ItemSubmission, MetadataError, MetadataSink, RunSummary};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    item_id       TEXT PRIMARY KEY,
    run_id        TEXT NOT NULL,
    name          TEXT NOT NULL,
    logical_path  TEXT NOT NULL,
    backing       TEXT NOT NULL,
    status        TEXT NOT NULL,
    size          INTEGER,
    content_hash  TEXT,
    duplicate_of  TEXT,
    metadata      TEXT NOT NULL,
    text          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS items_content_hash ON items(content_hash);
CREATE TABLE IF NOT EXISTS artefacts (
    item_id  TEXT NOT NULL,
    kind     TEXT NOT NULL,
    value    TEXT NOT NULL,
    byte_offset INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS artefacts_item ON artefacts(item_id);
CREATE TABLE IF NOT EXISTS runs (
    run_id          TEXT NOT NULL,
    case_name       TEXT NOT NULL,
    outcome         TEXT NOT NULL,
    enumerated      INTEGER NOT NULL,
    done            INTEGER NOT NULL,
    failed          INTEGER NOT NULL,
    duplicates      INTEGER NOT NULL,
    pending         INTEGER NOT NULL,
    bytes_processed INTEGER NOT NULL,
    elapsed_seconds REAL NOT NULL,
    tool_version    TEXT NOT NULL,
    config_hash     TEXT NOT NULL
);
";

/// Searchable index in `metadata/index.sqlite`.
///
/// Items are keyed by id, so a resumed run that submits an item again
/// replaces the earlier row.
pub struct SqliteSink {
    tool_version: String,
    config_hash: String,
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn new(
        tool_version: &str,
        config_hash: &str,
        meta_dir: &Path,
        append: bool,
    ) -> Result<Self, MetadataError> {
        let path = meta_dir.join("index.sqlite");
        if !append {
            for suffix in ["", "-wal", "-shm"] {
                let stale = meta_dir.join(format!("index.sqlite{suffix}"));
                if stale.exists() {
                    std::fs::remove_file(&stale)?;
                }
            }
        }
        let conn = Connection::open(&path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            tool_version: tool_version.to_string(),
            config_hash: config_hash.to_string(),
            conn: Mutex::new(conn),
        })
    }
}

impl MetadataSink for SqliteSink {
    fn submit(&self, submission: &ItemSubmission<'_>) -> Result<(), MetadataError> {
        let item = submission.item;
        let metadata = serde_json::to_string(submission.metadata())?;
        let text = submission.derived().text.join("\n");
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO items
             (item_id, run_id, name, logical_path, backing, status, size, content_hash, duplicate_of, metadata, text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                item.id().as_str(),
                submission.run_id,
                item.name(),
                item.descriptor.logical_path,
                item.descriptor.backing.kind(),
                submission.status.as_str(),
                item.size.map(|s| s as i64),
                submission.content_hash(),
                submission.duplicate_of(),
                metadata,
                text,
            ],
        )?;
        tx.execute(
            "DELETE FROM artefacts WHERE item_id = ?1",
            params![item.id().as_str()],
        )?;
        for artefact in &submission.derived().artefacts {
            tx.execute(
                "INSERT INTO artefacts (item_id, kind, value, byte_offset) VALUES (?1, ?2, ?3, ?4)",
                params![
                    item.id().as_str(),
                    artefact.kind,
                    artefact.value,
                    artefact.offset as i64
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn record_run_summary(&self, summary: &RunSummary) -> Result<(), MetadataError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO runs
             (run_id, case_name, outcome, enumerated, done, failed, duplicates, pending,
              bytes_processed, elapsed_seconds, tool_version, config_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                summary.run_id,
                summary.case,
                summary.outcome,
                summary.enumerated as i64,
                summary.done as i64,
                summary.failed as i64,
                summary.duplicates as i64,
                summary.pending as i64,
                summary.bytes_processed as i64,
                summary.elapsed_seconds,
                self.tool_version,
                self.config_hash,
            ],
        )?;
        Ok(())
    }

    fn flush(&self) -> Result<(), MetadataError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        Ok(())
    }
}
