//! SqliteSessionLog - durable append-only session history

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

use crate::error::{QuarryError, Result, ResultExt};
use crate::session::{Exchange, SessionStats, SessionStore};
use crate::types::SessionId;

pub struct SqliteSessionLog {
    conn: Mutex<Connection>,
}

impl SqliteSessionLog {
    /// Open (or create) the log in WAL mode
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(QuarryError::from)
                .with_context(|| format!("Creating session log directory '{}'", parent.display()))?;
        }

        let conn = Connection::open(path)
            .map_err(QuarryError::from)
            .with_context(|| format!("Opening session log '{}'", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let log = Self {
            conn: Mutex::new(conn),
        };
        log.migrate()?;
        Ok(log)
    }

    /// In-memory log, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let log = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        log.migrate()?;
        Ok(log)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS exchanges (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id    TEXT NOT NULL,
                arrival_seq   INTEGER NOT NULL,
                exchange_json TEXT NOT NULL,
                recorded_at   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_exchanges_session
                ON exchanges(session_id, id);
            ",
        )?;
        Ok(())
    }
}

impl SessionStore for SqliteSessionLog {
    fn append(&self, exchange: Exchange) -> Result<()> {
        let payload = serde_json::to_string(&exchange)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO exchanges (session_id, arrival_seq, exchange_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    exchange.request.session_id.as_str(),
                    exchange.request.arrival_sequence as i64,
                    payload,
                    exchange.recorded_at.to_rfc3339(),
                ],
            )
            .map_err(QuarryError::from)
            .context("Appending exchange to session log")?;
        Ok(())
    }

    fn read_history(&self, session_id: &SessionId) -> Result<Vec<Exchange>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT exchange_json FROM exchanges WHERE session_id = ?1 ORDER BY id")?;
        let payloads = stmt
            .query_map(params![session_id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(QuarryError::from))
            .collect()
    }

    fn stats(&self, session_id: &SessionId) -> Result<Option<SessionStats>> {
        Ok(SessionStats::from_history(&self.read_history(session_id)?))
    }

    fn close(&self, session_id: &SessionId) -> Result<bool> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM exchanges WHERE session_id = ?1", params![session_id.as_str()])?;
        Ok(removed > 0)
    }
}
