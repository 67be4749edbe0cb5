use chrono::{NaiveDateTime, SubsecRound};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::{path::Path, sync::Arc};
use tokio::sync::{watch, Mutex};

use crate::error::StoreError;

// Fixed-width local time, so TEXT ordering equals time ordering.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ListenRecord {
    pub id: i64,
    pub title: String,
    pub artist: String,
    pub timestamp: NaiveDateTime,
    #[serde(rename = "analyzedBy", skip_serializing_if = "Option::is_none")]
    pub analyzed_by: Option<String>,
}

/// Append-only listen log backed by a single SQLite connection.
///
/// Cloning is cheap and every clone shares the connection and the change
/// signal. Each statement finishes under the connection lock, so readers
/// never see a half-written row.
#[derive(Clone)]
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
    changes: Arc<watch::Sender<u64>>,
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_db(&conn)?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            changes: Arc::new(changes),
        })
    }

    pub async fn insert(
        &self,
        title: &str,
        artist: &str,
        timestamp: NaiveDateTime,
    ) -> Result<ListenRecord, StoreError> {
        // Stored with microsecond precision; return what a later read sees.
        let timestamp = timestamp.trunc_subsecs(6);
        let id = {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO listen_history (title, artist, timestamp, analyzed_by) VALUES (?1, ?2, ?3, NULL)",
                (title, artist, format_ts(timestamp)),
            )?;
            conn.last_insert_rowid()
        };
        self.changes.send_modify(|rev| *rev += 1);

        Ok(ListenRecord {
            id,
            title: title.to_string(),
            artist: artist.to_string(),
            timestamp,
            analyzed_by: None,
        })
    }

    /// Newest record for this exact (title, artist) strictly after `since`.
    /// `None` means no lower bound.
    pub async fn find_recent(
        &self,
        title: &str,
        artist: &str,
        since: Option<NaiveDateTime>,
    ) -> Result<Option<ListenRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"
SELECT id, title, artist, timestamp, analyzed_by FROM listen_history
WHERE title = ?1 AND artist = ?2 AND (?3 IS NULL OR timestamp > ?3)
ORDER BY timestamp DESC
LIMIT 1
"#,
                (title, artist, since.map(format_ts)),
                raw_row,
            )
            .optional()?;
        row.map(RawRow::into_record).transpose()
    }

    pub async fn stream_all(&self) -> Result<Vec<ListenRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, title, artist, timestamp, analyzed_by FROM listen_history ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map([], raw_row)?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?.into_record()?);
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row("SELECT COUNT(*) FROM listen_history", [], |row| row.get(0))?)
    }

    /// Revision counter bumped after every successful insert.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, title: &str, artist: &str, timestamp: &str) {
        self.conn
            .lock()
            .await
            .execute(
                "INSERT INTO listen_history (title, artist, timestamp) VALUES (?1, ?2, ?3)",
                (title, artist, timestamp),
            )
            .unwrap();
    }

    #[cfg(test)]
    pub(crate) async fn hold_connection(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS listen_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  artist TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  analyzed_by TEXT
);
CREATE INDEX IF NOT EXISTS idx_listen_history_ts ON listen_history(timestamp);
CREATE INDEX IF NOT EXISTS idx_listen_history_song ON listen_history(title, artist, timestamp);
"#,
    )
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

struct RawRow {
    id: i64,
    title: String,
    artist: String,
    timestamp: String,
    analyzed_by: Option<String>,
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        timestamp: row.get(3)?,
        analyzed_by: row.get(4)?,
    })
}

impl RawRow {
    fn into_record(self) -> Result<ListenRecord, StoreError> {
        let timestamp = NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_PARSE_FORMAT)
            .map_err(|_| StoreError::Timestamp {
                id: self.id,
                value: self.timestamp.clone(),
            })?;
        Ok(ListenRecord {
            id: self.id,
            title: self.title,
            artist: self.artist,
            timestamp,
            analyzed_by: self.analyzed_by,
        })
    }
}
