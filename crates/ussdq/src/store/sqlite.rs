//! SQLite-backed operation store.
//!
//! All access is serialized through a `Mutex<Connection>`, which is fine for
//! SQLite (which serializes writes anyway). WAL mode is enabled so a separate
//! producer process can insert while the queue is reading. The async store
//! surface runs every query on the blocking pool, since a busy database can
//! hold the lock for up to the busy timeout.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{migrations, ChangeFeed, ChangeKind, OperationStore, StoreChange, StoreError, Subscription};
use crate::model::{NewOperation, Operation, OperationStatus, Transition};

/// Thread-safe database handle wrapping a single rusqlite connection.
///
/// Cloning is cheap (inner `Arc`).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrations::run_all(&conn)?;

        log::info!("Database opened at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }
}

/// Returns the canonical database path: `~/.ussdq/data/ussdq.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ussdq").join("data").join("ussdq.db"))
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    // Fixed width so that lexical order is chronological order.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow {
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", s, e),
        })
}

/// A raw operation row from the database.
#[derive(Debug, Clone)]
struct OperationRow {
    id: String,
    ussd_code: String,
    sim_slot: i64,
    status: String,
    result: Option<String>,
    error_message: Option<String>,
    created_at: String,
    executed_at: Option<String>,
}

impl OperationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            ussd_code: row.get("ussd_code")?,
            sim_slot: row.get("sim_slot")?,
            status: row.get("status")?,
            result: row.get("result")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            executed_at: row.get("executed_at")?,
        })
    }

    fn into_operation(self) -> Result<Operation, StoreError> {
        let invalid = |reason: String| StoreError::InvalidRow {
            id: self.id.clone(),
            reason,
        };
        let sim_slot = u32::try_from(self.sim_slot)
            .map_err(|_| invalid(format!("sim_slot {} out of range", self.sim_slot)))?;
        let status: OperationStatus = self.status.parse().map_err(invalid)?;
        let created_at = parse_timestamp(&self.created_at, &self.id)?;
        let executed_at = self
            .executed_at
            .as_deref()
            .map(|s| parse_timestamp(s, &self.id))
            .transpose()?;

        Ok(Operation {
            id: self.id,
            ussd_code: self.ussd_code,
            sim_slot,
            status,
            result: self.result,
            error_message: self.error_message,
            created_at,
            executed_at,
        })
    }
}

/// Operation store on top of a SQLite [`Database`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
    feed: ChangeFeed,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            feed: ChangeFeed::default(),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a pending operation with an explicit creation time.
    ///
    /// The time is truncated to the stored microsecond precision so the
    /// returned record equals what a later read yields.
    pub fn insert_at(
        &self,
        new: NewOperation,
        created_at: DateTime<Utc>,
    ) -> Result<Operation, StoreError> {
        let created_at = created_at.trunc_subsecs(6);
        let op = Operation {
            id: Uuid::new_v4().to_string(),
            ussd_code: new.ussd_code,
            sim_slot: new.sim_slot,
            status: OperationStatus::Pending,
            result: None,
            error_message: None,
            created_at,
            executed_at: None,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO operations (id, ussd_code, sim_slot, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    op.id,
                    op.ussd_code,
                    op.sim_slot,
                    op.status.as_str(),
                    format_timestamp(op.created_at),
                ],
            )?;
            Ok(())
        })?;

        self.feed.publish(StoreChange::new(ChangeKind::Insert, &op.id));
        Ok(op)
    }

    fn query(&self, sql: &str) -> Result<Vec<Operation>, StoreError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map([], OperationRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    fn current_status(&self, id: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let status = conn
                .query_row(
                    "SELECT status FROM operations WHERE id = ?1",
                    params![id],
                    |r| r.get::<_, String>(0),
                )
                .optional()?;
            Ok(status)
        })
    }

    /// Runs a synchronous store call on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }

    fn fetch(&self, id: &str) -> Result<Option<Operation>, StoreError> {
        let row = self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT * FROM operations WHERE id = ?1",
                    params![id],
                    OperationRow::from_row,
                )
                .optional()?;
            Ok(row)
        })?;
        row.map(OperationRow::into_operation).transpose()
    }

    fn write_transition(&self, id: &str, transition: &Transition) -> Result<(), StoreError> {
        let changed = self.db.with_conn(|conn| {
            let changed = match transition {
                Transition::Executing { executed_at } => conn.execute(
                    "UPDATE operations SET status = 'executing', executed_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, format_timestamp(*executed_at)],
                )?,
                Transition::Completed { result } => conn.execute(
                    "UPDATE operations SET status = 'completed', result = ?2, error_message = NULL
                     WHERE id = ?1 AND status IN ('pending', 'executing')",
                    params![id, result],
                )?,
                Transition::Failed { error_message } => conn.execute(
                    "UPDATE operations SET status = 'failed', error_message = ?2, result = NULL
                     WHERE id = ?1 AND status IN ('pending', 'executing')",
                    params![id, error_message],
                )?,
            };
            Ok(changed)
        })?;

        if changed == 0 {
            return match self.current_status(id)? {
                None => Err(StoreError::NotFound(id.to_string())),
                Some(status) => Err(StoreError::StaleTransition {
                    id: id.to_string(),
                    current: status.parse().map_err(|reason| StoreError::InvalidRow {
                        id: id.to_string(),
                        reason,
                    })?,
                    target: transition.status(),
                }),
            };
        }

        self.feed.publish(StoreChange::new(ChangeKind::Update, id));
        Ok(())
    }

    /// Starts a task that publishes [`ChangeKind::External`] whenever another
    /// connection commits to the database file.
    ///
    /// Writes made through this store never trigger it; they are published
    /// directly.
    pub fn spawn_change_watcher(&self, interval: Duration) -> ChangeWatcher {
        let db = self.db.clone();
        let feed = self.feed.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_version: Option<i64> = None;

            loop {
                ticker.tick().await;
                let db = db.clone();
                let version = tokio::task::spawn_blocking(move || {
                    db.with_conn(|conn| {
                        Ok(conn.query_row("PRAGMA data_version", [], |r| r.get::<_, i64>(0))?)
                    })
                })
                .await;
                match version {
                    Ok(Ok(v)) => {
                        if last_version.is_some_and(|last| last != v) {
                            log::debug!("External change detected (data_version {})", v);
                            feed.publish(StoreChange::external());
                        }
                        last_version = Some(v);
                    }
                    Ok(Err(e)) => log::warn!("Failed to poll data_version: {}", e),
                    Err(e) => log::warn!("data_version poll task failed: {}", e),
                }
            }
        });

        ChangeWatcher { handle }
    }
}

#[async_trait]
impl OperationStore for SqliteStore {
    async fn insert(&self, new: NewOperation) -> Result<Operation, StoreError> {
        self.blocking(move |store| store.insert_at(new, Utc::now()))
            .await
    }

    async fn oldest_pending(&self) -> Result<Option<Operation>, StoreError> {
        self.blocking(|store| {
            let mut rows = store.query(
                "SELECT * FROM operations WHERE status = 'pending'
                 ORDER BY created_at ASC, rowid ASC LIMIT 1",
            )?;
            Ok(rows.pop())
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<Operation>, StoreError> {
        self.blocking(|store| {
            store.query("SELECT * FROM operations ORDER BY created_at ASC, rowid ASC")
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Operation>, StoreError> {
        let id = id.to_string();
        self.blocking(move |store| store.fetch(&id)).await
    }

    async fn apply(&self, id: &str, transition: &Transition) -> Result<(), StoreError> {
        let id = id.to_string();
        let transition = transition.clone();
        self.blocking(move |store| store.write_transition(&id, &transition))
            .await
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        Ok(self.feed.subscribe())
    }
}

/// Background data_version poller; stops when dropped.
pub struct ChangeWatcher {
    handle: JoinHandle<()>,
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
