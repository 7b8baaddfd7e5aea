//! Persistence port for ranking sessions, with a SQLite implementation.
//!
//! One `sessions` table holds both reducer and merger snapshots, keyed by
//! session id and tagged with [`Snapshot::KIND`]. Category rotation for
//! raters lives alongside it, as do the audit tables.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::audit::{AuditError, AuditEvent, AuditSink};
use crate::decision::Decision;
use crate::merger::MergerSnapshot;
use crate::node::ItemId;
use crate::reducer::ReducerSnapshot;

/// A persistable algorithm state.
pub trait Snapshot: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
}

impl Snapshot for ReducerSnapshot {
    const KIND: &'static str = "reducer";
}

impl Snapshot for MergerSnapshot {
    const KIND: &'static str = "merger";
}

/// The item pool a rater is currently working through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryPool {
    pub session_id: String,
    pub category_id: String,
    pub items: Vec<ItemId>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session {0} is already completed")]
    SessionCompleted(String),
    #[error("session {session_id} holds a {found} state, expected {expected}")]
    KindMismatch {
        session_id: String,
        expected: &'static str,
        found: String,
    },
    #[error("unknown category: {0}")]
    UnknownCategory(String),
    #[error("category {0} has no items")]
    EmptyCategory(String),
    #[error("category {category_id} lists {item} more than once")]
    DuplicateItem { category_id: String, item: ItemId },
}

#[async_trait]
pub trait SessionStore<S: Snapshot>: Send + Sync {
    async fn read_state(&self, session_id: &str) -> Result<Option<S>, StoreError>;
    /// Durable write; re-writing an identical state is a no-op.
    async fn write_state(&self, session_id: &str, state: &S) -> Result<(), StoreError>;
    async fn mark_complete(&self, session_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CategoryRotation: Send + Sync {
    /// The rater's open session, if any.
    async fn active_session(&self, rater_id: &str) -> Result<Option<CategoryPool>, StoreError>;
    /// First assigned category without a completed session; `None` once exhausted.
    async fn advance_category(&self, rater_id: &str)
        -> Result<Option<CategoryPool>, StoreError>;
}

/// Row view used by `show`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub rater_id: Option<String>,
    pub category_id: Option<String>,
    pub kind: String,
    pub completed: bool,
    pub state: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS categories (\
               category_id TEXT PRIMARY KEY,\
               items TEXT NOT NULL,\
               created_at INTEGER NOT NULL \
             );\
             CREATE TABLE IF NOT EXISTS rater_categories (\
               rater_id TEXT NOT NULL,\
               category_id TEXT NOT NULL,\
               position INTEGER NOT NULL,\
               PRIMARY KEY (rater_id, category_id) \
             );\
             CREATE TABLE IF NOT EXISTS sessions (\
               session_id TEXT PRIMARY KEY,\
               rater_id TEXT,\
               category_id TEXT,\
               kind TEXT NOT NULL,\
               state TEXT,\
               state_hash TEXT,\
               completed INTEGER NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL \
             );\
             CREATE INDEX IF NOT EXISTS sessions_rater ON sessions (rater_id, category_id);\
             CREATE TABLE IF NOT EXISTS comparisons (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               session_id TEXT NOT NULL,\
               left_items TEXT NOT NULL,\
               relation TEXT NOT NULL,\
               right_items TEXT NOT NULL,\
               round_index INTEGER NOT NULL,\
               timestamp_ms INTEGER NOT NULL \
             );\
             CREATE TABLE IF NOT EXISTS equivalence_classes (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               session_id TEXT NOT NULL,\
               rank INTEGER NOT NULL,\
               items TEXT NOT NULL,\
               timestamp_ms INTEGER NOT NULL \
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("TIERWISE_DB") {
            return PathBuf::from(path);
        }
        PathBuf::from(".tierwise.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<SessionLock, StoreError> {
        SessionLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Create or replace a category's item pool.
    pub async fn put_category(&self, category_id: &str, items: &[ItemId]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Err(StoreError::EmptyCategory(category_id.to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(item) = items.iter().find(|item| !seen.insert(item.as_str())) {
            return Err(StoreError::DuplicateItem {
                category_id: category_id.to_string(),
                item: item.clone(),
            });
        }
        let category_id = category_id.to_string();
        let items = to_json(items)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO categories (category_id, items, created_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(category_id) DO UPDATE SET items = excluded.items",
                params![category_id, items, now_epoch()],
            )?;
            Ok(())
        })
        .await
    }

    /// Append categories to a rater's rotation, in order. Already assigned
    /// categories keep their position.
    pub async fn assign_categories(
        &self,
        rater_id: &str,
        category_ids: &[String],
    ) -> Result<(), StoreError> {
        let rater_id = rater_id.to_string();
        let category_ids = category_ids.to_vec();
        self.blocking(move |conn| {
            for category_id in &category_ids {
                let known: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM categories WHERE category_id = ?1",
                        params![category_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if known.is_none() {
                    return Err(StoreError::UnknownCategory(category_id.clone()));
                }
                let next: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(position) + 1, 0) FROM rater_categories WHERE rater_id = ?1",
                    params![rater_id],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT OR IGNORE INTO rater_categories (rater_id, category_id, position) \
                     VALUES (?1, ?2, ?3)",
                    params![rater_id, category_id, next],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn session_record(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT session_id, rater_id, category_id, kind, completed, state,\
                            created_at, updated_at \
                     FROM sessions WHERE session_id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)? != 0,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    },
                )
                .optional()?;
            let Some((session_id, rater_id, category_id, kind, completed, state, created_at, updated_at)) =
                row
            else {
                return Ok(None);
            };
            let state = state
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| StoreError::Serde(e.to_string()))?;
            Ok(Some(SessionRecord {
                session_id,
                rater_id,
                category_id,
                kind,
                completed,
                state,
                created_at,
                updated_at,
            }))
        })
        .await
    }

    /// Write both audit tables to `path` as JSONL, oldest first. Returns the
    /// number of lines written.
    pub async fn export_audit_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let mut events: Vec<(i64, u8, i64, AuditEvent)> = Vec::new();

            let mut stmt = conn.prepare(
                "SELECT id, session_id, left_items, relation, right_items, round_index, timestamp_ms \
                 FROM comparisons",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let relation: String = row.get(3)?;
                let timestamp_ms: i64 = row.get(6)?;
                let event = AuditEvent::Comparison {
                    session_id: row.get(1)?,
                    left: from_json(&row.get::<_, String>(2)?)?,
                    relation: relation
                        .parse::<Decision>()
                        .map_err(|e| StoreError::Serde(e.to_string()))?,
                    right: from_json(&row.get::<_, String>(4)?)?,
                    round_index: row.get::<_, i64>(5)? as usize,
                    timestamp_ms,
                };
                events.push((timestamp_ms, 0, id, event));
            }

            let mut stmt = conn.prepare(
                "SELECT id, session_id, rank, items, timestamp_ms FROM equivalence_classes",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let timestamp_ms: i64 = row.get(4)?;
                let event = AuditEvent::Class {
                    session_id: row.get(1)?,
                    rank: row.get::<_, i64>(2)? as usize,
                    items: from_json(&row.get::<_, String>(3)?)?,
                    timestamp_ms,
                };
                events.push((timestamp_ms, 1, id, event));
            }

            events.sort_by_key(|(ts, order, id, _)| (*ts, *order, *id));
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            for (_, _, _, event) in &events {
                let line = serde_json::to_string(event).map_err(|e| StoreError::Serde(e.to_string()))?;
                writeln!(file, "{line}")?;
            }
            file.flush()?;
            Ok(events.len())
        })
        .await
    }
}

fn open_session_for(
    conn: &Connection,
    rater_id: &str,
    category_id: &str,
) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT session_id FROM sessions \
             WHERE rater_id = ?1 AND category_id = ?2 AND kind = ?3 AND completed = 0 \
             ORDER BY created_at ASC LIMIT 1",
            params![rater_id, category_id, ReducerSnapshot::KIND],
            |row| row.get(0),
        )
        .optional()?)
}

#[async_trait]
impl<S: Snapshot> SessionStore<S> for SqliteSessionStore {
    async fn read_state(&self, session_id: &str) -> Result<Option<S>, StoreError> {
        let id = session_id.to_string();
        let row = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT kind, state FROM sessions WHERE session_id = ?1",
                        params![id],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                    )
                    .optional()?)
            })
            .await?;
        let Some((kind, state)) = row else {
            return Ok(None);
        };
        if kind != S::KIND {
            return Err(StoreError::KindMismatch {
                session_id: session_id.to_string(),
                expected: S::KIND,
                found: kind,
            });
        }
        state.map(|raw| from_json(&raw)).transpose()
    }

    async fn write_state(&self, session_id: &str, state: &S) -> Result<(), StoreError> {
        let raw = to_json(state)?;
        let state_hash = hash_text(&raw);
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let existing = conn
                .query_row(
                    "SELECT kind, state_hash, completed FROM sessions WHERE session_id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, i64>(2)? != 0,
                        ))
                    },
                )
                .optional()?;

            let now = now_epoch();
            match existing {
                Some((kind, _, _)) if kind != S::KIND => Err(StoreError::KindMismatch {
                    session_id,
                    expected: S::KIND,
                    found: kind,
                }),
                Some((_, Some(hash), _)) if hash == state_hash => {
                    tracing::debug!(session_id = %session_id, "state unchanged; write skipped");
                    Ok(())
                }
                Some((_, _, true)) => Err(StoreError::SessionCompleted(session_id)),
                Some(_) => {
                    conn.execute(
                        "UPDATE sessions SET state = ?1, state_hash = ?2, updated_at = ?3 \
                         WHERE session_id = ?4",
                        params![raw, state_hash, now, session_id],
                    )?;
                    Ok(())
                }
                None => {
                    conn.execute(
                        "INSERT INTO sessions (session_id, kind, state, state_hash, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![session_id, S::KIND, raw, state_hash, now, now],
                    )?;
                    Ok(())
                }
            }
        })
        .await
    }

    async fn mark_complete(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE sessions SET completed = 1, updated_at = ?1 WHERE session_id = ?2",
                params![now_epoch(), session_id],
            )?;
            if updated == 0 {
                return Err(StoreError::UnknownSession(session_id));
            }
            tracing::info!(session_id = %session_id, "session completed");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CategoryRotation for SqliteSessionStore {
    async fn active_session(&self, rater_id: &str) -> Result<Option<CategoryPool>, StoreError> {
        let rater_id = rater_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT s.session_id, s.category_id, c.items \
                     FROM sessions s JOIN categories c ON c.category_id = s.category_id \
                     JOIN rater_categories rc \
                       ON rc.rater_id = s.rater_id AND rc.category_id = s.category_id \
                     WHERE s.rater_id = ?1 AND s.kind = ?2 AND s.completed = 0 \
                     ORDER BY rc.position ASC LIMIT 1",
                    params![rater_id, ReducerSnapshot::KIND],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(session_id, category_id, items)| {
                Ok(CategoryPool {
                    session_id,
                    category_id,
                    items: from_json(&items)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn advance_category(
        &self,
        rater_id: &str,
    ) -> Result<Option<CategoryPool>, StoreError> {
        let rater_id = rater_id.to_string();
        self.blocking(move |conn| {
            let next = conn
                .query_row(
                    "SELECT rc.category_id, c.items \
                     FROM rater_categories rc JOIN categories c ON c.category_id = rc.category_id \
                     WHERE rc.rater_id = ?1 AND NOT EXISTS (\
                       SELECT 1 FROM sessions s \
                       WHERE s.rater_id = rc.rater_id AND s.category_id = rc.category_id \
                         AND s.kind = ?2 AND s.completed = 1 \
                     ) \
                     ORDER BY rc.position ASC LIMIT 1",
                    params![rater_id, ReducerSnapshot::KIND],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            let Some((category_id, items)) = next else {
                tracing::info!(rater_id = %rater_id, "all assigned categories complete");
                return Ok(None);
            };

            let session_id = match open_session_for(conn, &rater_id, &category_id)? {
                Some(existing) => existing,
                None => {
                    let session_id = new_session_id();
                    let now = now_epoch();
                    conn.execute(
                        "INSERT INTO sessions (session_id, rater_id, category_id, kind, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![session_id, rater_id, category_id, ReducerSnapshot::KIND, now, now],
                    )?;
                    tracing::info!(
                        rater_id = %rater_id,
                        category_id = %category_id,
                        session_id = %session_id,
                        "opened session for next category"
                    );
                    session_id
                }
            };

            Ok(Some(CategoryPool {
                session_id,
                category_id,
                items: from_json(&items)?,
            }))
        })
        .await
    }
}

/// Audit rows are written inline on the caller's thread.
impl AuditSink for SqliteSessionStore {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let result = self.with_conn(|conn| {
            match &event {
                AuditEvent::Comparison {
                    session_id,
                    left,
                    relation,
                    right,
                    round_index,
                    timestamp_ms,
                } => {
                    conn.execute(
                        "INSERT INTO comparisons \
                         (session_id, left_items, relation, right_items, round_index, timestamp_ms) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            session_id,
                            to_json(left)?,
                            relation.as_str(),
                            to_json(right)?,
                            *round_index as i64,
                            timestamp_ms
                        ],
                    )?;
                }
                AuditEvent::Class {
                    session_id,
                    rank,
                    items,
                    timestamp_ms,
                } => {
                    conn.execute(
                        "INSERT INTO equivalence_classes (session_id, rank, items, timestamp_ms) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![session_id, *rank as i64, to_json(items)?, timestamp_ms],
                    )?;
                }
            }
            Ok(())
        });
        result.map_err(|e| AuditError::Store(e.to_string()))
    }
}

/// Advisory exclusive lock on `<db>.lock`, released on drop.
#[derive(Debug)]
pub struct SessionLock {
    _file: std::fs::File,
}

impl SessionLock {
    fn new(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serde(e.to_string()))
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serde(e.to_string()))
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
