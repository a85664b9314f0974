//! Durable message log backed by SQLite
//!
//! The log is the single authority for offset assignment and message
//! idempotency. Offsets are assigned by the database (`INTEGER PRIMARY KEY
//! AUTOINCREMENT`), so successful appends produce a dense, strictly
//! increasing sequence. Retried sends are rejected by the `UNIQUE`
//! constraint on the client token at the storage layer, never by a
//! check-then-insert in application code.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::protocol::Offset;

/// A message row from the durable log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Offset assigned on insert
    pub offset: Offset,
    /// Client-generated token, unique across all messages
    pub token: String,
    /// Sender identity
    pub sender: String,
    /// Message content
    pub content: String,
}

/// Outcome of an append attempt
///
/// `Duplicate` is a signal, not a failure: the token was already recorded,
/// and the caller should acknowledge the sender without re-broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The message was recorded under this new offset
    Stored(Offset),
    /// The token already exists; this is the original row's offset
    Duplicate(Offset),
}

/// Append-only message ledger
pub struct MessageLog {
    conn: Mutex<Connection>,
}

impl MessageLog {
    /// Open (or create) the log at the given path.
    ///
    /// With `reset`, any existing database file is removed first. The
    /// default is to preserve prior history across restarts.
    pub fn open(path: impl AsRef<Path>, reset: bool) -> Result<Self> {
        let path = path.as_ref();

        if reset {
            remove_database_files(path);
            info!(path = %path.display(), "Reset requested, prior message log removed");
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;

        debug!(path = %path.display(), "Message log opened");
        Ok(log)
    }

    /// Open an in-memory log (tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                client_token TEXT NOT NULL UNIQUE,
                sender       TEXT NOT NULL,
                content      TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RelayError::storage("connection lock poisoned"))
    }

    /// Append a message, or detect that its token was already recorded.
    ///
    /// Duplicates are detected through the `UNIQUE(client_token)`
    /// constraint (`SQLITE_CONSTRAINT`); the original row's offset is
    /// looked up and returned so the sender can be acknowledged.
    pub fn append(&self, sender: &str, content: &str, token: &str) -> Result<AppendOutcome> {
        let conn = self.lock()?;

        let inserted = conn.execute(
            "INSERT INTO messages (client_token, sender, content) VALUES (?1, ?2, ?3)",
            params![token, sender, content],
        );

        match inserted {
            Ok(_) => Ok(AppendOutcome::Stored(conn.last_insert_rowid() as Offset)),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let offset: i64 = conn.query_row(
                    "SELECT id FROM messages WHERE client_token = ?1",
                    params![token],
                    |row| row.get(0),
                )?;
                Ok(AppendOutcome::Duplicate(offset as Offset))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read up to `limit` messages with offset strictly greater than
    /// `offset`, in ascending offset order.
    ///
    /// Replay walks the log through repeated pages, which keeps it lazy,
    /// restartable from any watermark, and cheap to abandon mid-way.
    pub fn read_after(&self, offset: Offset, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, client_token, sender, content FROM messages
             WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![offset as i64, limit as i64], |row| {
            Ok(StoredMessage {
                offset: row.get::<_, i64>(0)? as Offset,
                token: row.get(1)?,
                sender: row.get(2)?,
                content: row.get(3)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Highest assigned offset, or 0 when the log is empty
    pub fn head_offset(&self) -> Result<Offset> {
        let conn = self.lock()?;
        let head: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM messages", [], |row| {
            row.get(0)
        })?;
        Ok(head as Offset)
    }

    /// Number of recorded messages
    pub fn len(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Whether the log holds no messages
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Remove the database file and its WAL siblings, ignoring missing files
fn remove_database_files(path: &Path) {
    let _ = std::fs::remove_file(path);
    for suffix in ["-wal", "-shm"] {
        let mut sibling = PathBuf::from(path);
        sibling.set_file_name(format!(
            "{}{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or(""),
            suffix
        ));
        let _ = std::fs::remove_file(sibling);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_dense_and_increasing() {
        let log = MessageLog::open_in_memory().unwrap();

        for (i, token) in ["t1", "t2", "t3"].iter().enumerate() {
            let outcome = log.append("alice", "hello", token).unwrap();
            assert_eq!(outcome, AppendOutcome::Stored(i as Offset + 1));
        }

        assert_eq!(log.head_offset().unwrap(), 3);
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn test_duplicate_token_keeps_original_row() {
        let log = MessageLog::open_in_memory().unwrap();

        let first = log.append("alice", "hi", "abc").unwrap();
        assert_eq!(first, AppendOutcome::Stored(1));

        // Retrying the same token creates no new row and reports the
        // original offset
        let second = log.append("alice", "hi", "abc").unwrap();
        assert_eq!(second, AppendOutcome::Duplicate(1));

        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(log.head_offset().unwrap(), 1);

        // A fresh token continues the sequence without a gap
        let third = log.append("alice", "hi again", "def").unwrap();
        assert_eq!(third, AppendOutcome::Stored(2));
    }

    #[test]
    fn test_read_after_returns_exactly_the_missed_suffix() {
        let log = MessageLog::open_in_memory().unwrap();

        for i in 1..=5u64 {
            log.append("bob", &format!("msg {}", i), &format!("tok{}", i))
                .unwrap();
        }

        let all = log.read_after(0, 100).unwrap();
        assert_eq!(all.len(), 5);
        let offsets: Vec<Offset> = all.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3, 4, 5]);

        let tail = log.read_after(3, 100).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].offset, 4);
        assert_eq!(tail[0].content, "msg 4");
        assert_eq!(tail[1].offset, 5);

        assert!(log.read_after(5, 100).unwrap().is_empty());
    }

    #[test]
    fn test_read_after_pages_by_limit() {
        let log = MessageLog::open_in_memory().unwrap();

        for i in 1..=7u64 {
            log.append("carol", "x", &format!("tok{}", i)).unwrap();
        }

        let page1 = log.read_after(0, 3).unwrap();
        assert_eq!(
            page1.iter().map(|m| m.offset).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let page2 = log.read_after(page1.last().unwrap().offset, 3).unwrap();
        assert_eq!(
            page2.iter().map(|m| m.offset).collect::<Vec<_>>(),
            vec![4, 5, 6]
        );

        let page3 = log.read_after(page2.last().unwrap().offset, 3).unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].offset, 7);
    }

    #[test]
    fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        {
            let log = MessageLog::open(&path, false).unwrap();
            log.append("alice", "persisted", "tok1").unwrap();
        }

        let log = MessageLog::open(&path, false).unwrap();
        assert_eq!(log.head_offset().unwrap(), 1);
        let messages = log.read_after(0, 10).unwrap();
        assert_eq!(messages[0].content, "persisted");
    }

    #[test]
    fn test_reset_erases_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");

        {
            let log = MessageLog::open(&path, false).unwrap();
            log.append("alice", "gone soon", "tok1").unwrap();
        }

        let log = MessageLog::open(&path, true).unwrap();
        assert!(log.is_empty().unwrap());
        assert_eq!(log.head_offset().unwrap(), 0);
    }

    #[test]
    fn test_equal_token_implies_equal_row() {
        let log = MessageLog::open_in_memory().unwrap();

        log.append("alice", "original", "abc").unwrap();
        // A retry with different content still maps to the original row
        log.append("alice", "mutated retry", "abc").unwrap();

        let rows = log.read_after(0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "original");
        assert_eq!(rows[0].sender, "alice");
    }
}
