//! Persistent download state backed by an embedded SQLite database.
//!
//! One `downloads` row per known download plus its outstanding `tasks`
//! rows. Every save replaces the task set inside a single transaction, so a
//! crash leaves either the old consistent state or the new one and the
//! resume contract survives.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::task::Task;

/// Environment variable that overrides the state directory. Tests point it
/// at a temp dir so parallel runs never share a database.
pub const STATE_DIR_ENV: &str = "SURGE_STATE_DIR";

/// Database filename inside the state directory.
pub const DB_FILENAME: &str = "engine.db";

/// Lifecycle states a persisted download can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl DownloadStatus {
    /// Canonical lowercase form stored in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Parses the canonical form back.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "downloading" => Some(Self::Downloading),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for DownloadStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DownloadStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Self::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

/// A paused download's full resume payload.
#[derive(Debug, Clone)]
pub struct DownloadState {
    pub id: String,
    pub url: String,
    pub dest_path: PathBuf,
    pub filename: String,
    pub total_size: u64,
    pub downloaded: u64,
    /// Byte ranges still outstanding.
    pub tasks: Vec<Task>,
    /// Wall time accumulated across previous sessions.
    pub elapsed: Duration,
    pub url_hash: String,
    pub created_at: i64,
    pub paused_at: i64,
}

/// A master-list row: any download the store knows about.
#[derive(Debug, Clone)]
pub struct DownloadEntry {
    pub id: String,
    pub url: String,
    pub dest_path: PathBuf,
    pub filename: String,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub downloaded: u64,
    pub completed_at: Option<i64>,
    pub time_taken: Option<Duration>,
    pub url_hash: String,
}

/// Short stable key for correlating entries without comparing full URLs:
/// the first 8 bytes of `sha256(url)`, hex-encoded.
#[must_use]
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Returns the directory holding the engine database, honoring the
/// [`STATE_DIR_ENV`] override.
#[must_use]
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("surge")
}

/// Handle to the downloads database. Cheap to share behind an `Arc`; all
/// access funnels through one connection guarded by a mutex.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Opens (and if needed creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened or the schema cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens the database under [`state_dir`].
    ///
    /// # Errors
    ///
    /// See [`StateStore::open`].
    pub fn open_default() -> Result<Self> {
        Self::open(&state_dir().join(DB_FILENAME))
    }

    /// A throwaway in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error when the schema cannot be applied.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id           TEXT PRIMARY KEY,
                url          TEXT NOT NULL,
                dest_path    TEXT NOT NULL,
                filename     TEXT NOT NULL DEFAULT '',
                status       TEXT NOT NULL,
                total_size   INTEGER NOT NULL DEFAULT 0,
                downloaded   INTEGER NOT NULL DEFAULT 0,
                url_hash     TEXT NOT NULL DEFAULT '',
                created_at   INTEGER NOT NULL DEFAULT 0,
                paused_at    INTEGER,
                completed_at INTEGER,
                time_taken   INTEGER
            );
            CREATE TABLE IF NOT EXISTS tasks (
                download_id TEXT NOT NULL REFERENCES downloads(id) ON DELETE CASCADE,
                "offset"    INTEGER NOT NULL,
                length      INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_download_id ON tasks(download_id);
            CREATE INDEX IF NOT EXISTS idx_downloads_url_dest ON downloads(url, dest_path);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persists a paused download and its outstanding tasks atomically.
    /// Fills in `id`, `url_hash` and timestamps when missing.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the transaction fails; nothing is
    /// written in that case.
    pub fn save_state(&self, state: &mut DownloadState) -> Result<()> {
        if state.id.is_empty() {
            state.id = uuid::Uuid::new_v4().to_string();
        }
        state.url_hash = url_hash(&state.url);
        state.paused_at = chrono::Utc::now().timestamp();
        if state.created_at == 0 {
            state.created_at = state.paused_at;
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            r"
            INSERT INTO downloads (
                id, url, dest_path, filename, status, total_size, downloaded,
                url_hash, created_at, paused_at, time_taken
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                dest_path = excluded.dest_path,
                filename = excluded.filename,
                status = excluded.status,
                total_size = excluded.total_size,
                downloaded = excluded.downloaded,
                url_hash = excluded.url_hash,
                paused_at = excluded.paused_at,
                time_taken = excluded.time_taken
            ",
            params![
                state.id,
                state.url,
                path_str(&state.dest_path),
                state.filename,
                DownloadStatus::Paused,
                to_i64(state.total_size),
                to_i64(state.downloaded),
                state.url_hash,
                state.created_at,
                state.paused_at,
                i64::try_from(state.elapsed.as_millis()).unwrap_or(i64::MAX),
            ],
        )?;

        tx.execute("DELETE FROM tasks WHERE download_id = ?1", [&state.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tasks (download_id, \"offset\", length) VALUES (?1, ?2, ?3)",
            )?;
            for task in &state.tasks {
                stmt.execute(params![state.id, to_i64(task.offset), to_i64(task.length)])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Loads the newest paused state for `(url, dest_path)` with its tasks.
    ///
    /// # Errors
    ///
    /// [`Error::StateNotFound`] when no paused row matches.
    pub fn load_state(&self, url: &str, dest_path: &Path) -> Result<DownloadState> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                r"
                SELECT id, url, dest_path, filename, total_size, downloaded,
                       url_hash, created_at, paused_at, time_taken
                FROM downloads
                WHERE url = ?1 AND dest_path = ?2 AND status = 'paused'
                ORDER BY paused_at DESC
                LIMIT 1
                ",
                params![url, path_str(dest_path)],
                |row| {
                    Ok(DownloadState {
                        id: row.get(0)?,
                        url: row.get(1)?,
                        dest_path: PathBuf::from(row.get::<_, String>(2)?),
                        filename: row.get(3)?,
                        total_size: from_i64(row.get(4)?),
                        downloaded: from_i64(row.get(5)?),
                        tasks: Vec::new(),
                        url_hash: row.get(6)?,
                        created_at: row.get(7)?,
                        paused_at: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
                        elapsed: row
                            .get::<_, Option<i64>>(9)?
                            .map_or(Duration::ZERO, |ms| {
                                Duration::from_millis(ms.unsigned_abs())
                            }),
                    })
                },
            )
            .optional()?;

        let mut state = row.ok_or(Error::StateNotFound)?;

        let mut stmt =
            conn.prepare("SELECT \"offset\", length FROM tasks WHERE download_id = ?1")?;
        let tasks = stmt
            .query_map([&state.id], |row| {
                Ok(Task::new(from_i64(row.get(0)?), from_i64(row.get(1)?)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        state.tasks = tasks;

        Ok(state)
    }

    /// Deletes a persisted download (tasks cascade). Prefers `id`; falls
    /// back to `(url, dest_path)`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error on database failure only; a missing row
    /// is not an error.
    pub fn delete_state(&self, id: Option<&str>, url: &str, dest_path: &Path) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        match id.filter(|id| !id.is_empty()) {
            Some(id) => {
                conn.execute("DELETE FROM downloads WHERE id = ?1", [id])?;
            }
            None => {
                conn.execute(
                    "DELETE FROM downloads WHERE url = ?1 AND dest_path = ?2",
                    params![url, path_str(dest_path)],
                )?;
            }
        }
        Ok(())
    }

    /// Upserts a historical entry (completed downloads and the like).
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the write fails.
    pub fn add_to_master_list(&self, entry: &DownloadEntry) -> Result<()> {
        let id = if entry.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            entry.id.clone()
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            r"
            INSERT INTO downloads (
                id, url, dest_path, filename, status, total_size, downloaded,
                completed_at, time_taken, url_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                dest_path = excluded.dest_path,
                filename = excluded.filename,
                status = excluded.status,
                total_size = excluded.total_size,
                downloaded = excluded.downloaded,
                completed_at = excluded.completed_at,
                time_taken = excluded.time_taken,
                url_hash = excluded.url_hash
            ",
            params![
                id,
                entry.url,
                path_str(&entry.dest_path),
                entry.filename,
                entry.status,
                to_i64(entry.total_size),
                to_i64(entry.downloaded),
                entry.completed_at,
                entry
                    .time_taken
                    .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
                url_hash(&entry.url),
            ],
        )?;
        Ok(())
    }

    /// Removes a master-list entry by id. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the delete fails.
    pub fn remove_from_master_list(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM downloads WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Every download the store knows about.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the query fails.
    pub fn load_master_list(&self) -> Result<Vec<DownloadEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r"
            SELECT id, url, dest_path, filename, status, total_size,
                   downloaded, completed_at, time_taken, url_hash
            FROM downloads
            ORDER BY created_at
            ",
        )?;
        let entries = stmt
            .query_map([], map_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// A single download by id, if present.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the query fails.
    pub fn get_download(&self, id: &str) -> Result<Option<DownloadEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                r"
                SELECT id, url, dest_path, filename, status, total_size,
                       downloaded, completed_at, time_taken, url_hash
                FROM downloads WHERE id = ?1
                ",
                [id],
                map_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// All paused downloads.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the query fails.
    pub fn load_paused_downloads(&self) -> Result<Vec<DownloadEntry>> {
        Ok(self
            .load_master_list()?
            .into_iter()
            .filter(|e| e.status == DownloadStatus::Paused)
            .collect())
    }

    /// All completed downloads.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the query fails.
    pub fn load_completed_downloads(&self) -> Result<Vec<DownloadEntry>> {
        Ok(self
            .load_master_list()?
            .into_iter()
            .filter(|e| e.status == DownloadStatus::Completed)
            .collect())
    }

    /// Whether any row (any status) references `url`.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the query fails.
    pub fn check_download_exists(&self, url: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM downloads WHERE url = ?1",
            [url],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Updates one download's status.
    ///
    /// # Errors
    ///
    /// [`Error::StateNotFound`] when the id is unknown.
    pub fn update_status(&self, id: &str, status: DownloadStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE downloads SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        if n == 0 {
            return Err(Error::StateNotFound);
        }
        Ok(())
    }

    /// Marks every non-completed download paused.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the update fails.
    pub fn pause_all_downloads(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE downloads SET status = 'paused' WHERE status != 'completed'",
            [],
        )?;
        Ok(())
    }

    /// Moves every paused download back to queued.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the update fails.
    pub fn resume_all_downloads(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE downloads SET status = 'queued' WHERE status = 'paused'",
            [],
        )?;
        Ok(())
    }

    /// Deletes completed rows and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a [`rusqlite`] error when the delete fails.
    pub fn remove_completed_downloads(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM downloads WHERE status = 'completed'", [])?;
        Ok(n)
    }
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadEntry> {
    Ok(DownloadEntry {
        id: row.get(0)?,
        url: row.get(1)?,
        dest_path: PathBuf::from(row.get::<_, String>(2)?),
        filename: row.get(3)?,
        status: row.get(4)?,
        total_size: from_i64(row.get(5)?),
        downloaded: from_i64(row.get(6)?),
        completed_at: row.get(7)?,
        time_taken: row
            .get::<_, Option<i64>>(8)?
            .map(|ms| Duration::from_millis(ms.unsigned_abs())),
        url_hash: row.get(9)?,
    })
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[allow(clippy::cast_possible_wrap)]
const fn to_i64(v: u64) -> i64 {
    v as i64
}

#[allow(clippy::cast_sign_loss)]
const fn from_i64(v: i64) -> u64 {
    if v < 0 { 0 } else { v as u64 }
}
