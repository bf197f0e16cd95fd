use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;

/// Async-safe handle to the application database.
///
/// Wraps `AppDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads. Everything inside one `call` closure
/// runs under the mutex, so a closure is the unit of atomicity.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<AppDb>>,
}

impl DbHandle {
    pub fn new(db: AppDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&AppDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct AppDb {
    conn: Connection,
}

const WORK_ITEM_COLUMNS: &str = "id, owner_id, space_id, title, source_urls, status, run_id, \
     result_payload, failure_reason, summary, created_at, updated_at";

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl AppDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS spaces (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS work_items (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    space_id TEXT REFERENCES spaces(id) ON DELETE SET NULL,
                    title TEXT,
                    source_urls TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'PENDING'
                        CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETE', 'FAILED')),
                    run_id TEXT,
                    result_payload TEXT,
                    failure_reason TEXT,
                    summary TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    CHECK (status <> 'PROCESSING' OR run_id IS NOT NULL),
                    CHECK (status <> 'COMPLETE' OR (result_payload IS NOT NULL AND failure_reason IS NULL)),
                    CHECK (status <> 'FAILED' OR failure_reason IS NOT NULL)
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    work_item_id TEXT NOT NULL REFERENCES work_items(id) ON DELETE CASCADE,
                    owner_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS entities (
                    id TEXT PRIMARY KEY,
                    work_item_id TEXT NOT NULL REFERENCES work_items(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    kind TEXT,
                    data TEXT
                );

                CREATE TABLE IF NOT EXISTS user_settings (
                    user_id TEXT PRIMARY KEY,
                    settings TEXT NOT NULL DEFAULT '{}',
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_spaces_owner ON spaces(owner_id);
                CREATE INDEX IF NOT EXISTS idx_work_items_owner ON work_items(owner_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_work_items_space ON work_items(space_id);
                CREATE INDEX IF NOT EXISTS idx_messages_work_item ON messages(work_item_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_entities_work_item ON entities(work_item_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Spaces ────────────────────────────────────────────────────────

    pub fn create_space(&self, owner_id: &str, name: &str) -> Result<Space> {
        let space = Space {
            id: new_id(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            created_at: now(),
        };
        self.conn
            .execute(
                "INSERT INTO spaces (id, owner_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![space.id, space.owner_id, space.name, space.created_at],
            )
            .context("Failed to insert space")?;
        Ok(space)
    }

    pub fn get_space(&self, id: &str) -> Result<Option<Space>> {
        self.conn
            .query_row(
                "SELECT id, owner_id, name, created_at FROM spaces WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Space {
                        id: row.get(0)?,
                        owner_id: row.get(1)?,
                        name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query space")
    }

    pub fn list_spaces(&self, owner_id: &str) -> Result<Vec<Space>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, name, created_at FROM spaces
                 WHERE owner_id = ?1 ORDER BY created_at, id",
            )
            .context("Failed to prepare list_spaces")?;
        let rows = stmt
            .query_map(params![owner_id], |row| {
                Ok(Space {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    name: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query spaces")?;
        let mut spaces = Vec::new();
        for row in rows {
            spaces.push(row.context("Failed to read space row")?);
        }
        Ok(spaces)
    }

    /// Webs in the space are detached, not deleted.
    pub fn delete_space(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM spaces WHERE id = ?1", params![id])
            .context("Failed to delete space")?;
        Ok(count > 0)
    }

    // ── Work items ────────────────────────────────────────────────────

    pub fn create_work_item(
        &self,
        owner_id: &str,
        space_id: Option<&str>,
        title: Option<&str>,
        source_urls: &[String],
    ) -> Result<WorkItem> {
        let id = new_id();
        let ts = now();
        let urls = serde_json::to_string(source_urls).context("Failed to serialize source_urls")?;
        self.conn
            .execute(
                "INSERT INTO work_items (id, owner_id, space_id, title, source_urls, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, ?6)",
                params![id, owner_id, space_id, title, urls, ts],
            )
            .context("Failed to insert work item")?;
        self.get_work_item(&id)?
            .context("Work item not found after insert")
    }

    pub fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let sql = format!("SELECT {} FROM work_items WHERE id = ?1", WORK_ITEM_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], WorkItemRow::from_row)
            .optional()
            .context("Failed to query work item")?;
        row.map(WorkItemRow::into_work_item).transpose()
    }

    pub fn list_work_items(&self, owner_id: &str, space_id: Option<&str>) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {} FROM work_items
             WHERE owner_id = ?1 AND (?2 IS NULL OR space_id = ?2)
             ORDER BY created_at DESC, id",
            WORK_ITEM_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_work_items")?;
        let rows = stmt
            .query_map(params![owner_id, space_id], WorkItemRow::from_row)
            .context("Failed to query work items")?;
        let mut items = Vec::new();
        for row in rows {
            let r = row.context("Failed to read work item row")?;
            items.push(r.into_work_item()?);
        }
        Ok(items)
    }

    /// Deletes the item; messages and entities cascade.
    pub fn delete_work_item(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM work_items WHERE id = ?1", params![id])
            .context("Failed to delete work item")?;
        Ok(count > 0)
    }

    /// Atomically move an item into `PROCESSING` under `run_id`.
    ///
    /// The update only applies when the item is not already `PROCESSING`, so
    /// two racing dispatches cannot both own the item. Returns `None` when
    /// the claim was lost or the item no longer exists. `source_urls`, when
    /// given, replaces the stored input.
    pub fn claim_for_run(
        &self,
        id: &str,
        run_id: &str,
        source_urls: Option<&[String]>,
    ) -> Result<Option<WorkItem>> {
        let urls = source_urls
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize source_urls")?;
        let count = self
            .conn
            .execute(
                "UPDATE work_items
                 SET status = 'PROCESSING', run_id = ?1, failure_reason = NULL,
                     source_urls = COALESCE(?2, source_urls), updated_at = ?3
                 WHERE id = ?4 AND status <> 'PROCESSING'",
                params![run_id, urls, now(), id],
            )
            .context("Failed to claim work item for run")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_work_item(id)
    }

    /// Record a successful run: payload, derived fields and entities in one
    /// transaction. Entities from a previous run are replaced.
    pub fn complete_work_item(
        &self,
        id: &str,
        payload: &serde_json::Value,
        derived: &DerivedResult,
    ) -> Result<WorkItem> {
        if payload.is_null() {
            anyhow::bail!("Cannot complete work item {} with a null result", id);
        }
        let payload_json = serde_json::to_string(payload).context("Failed to serialize result")?;

        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let count = tx
            .execute(
                "UPDATE work_items
                 SET status = 'COMPLETE', result_payload = ?1, failure_reason = NULL,
                     summary = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![payload_json, derived.summary, now(), id],
            )
            .context("Failed to complete work item")?;
        if count == 0 {
            anyhow::bail!("Work item {} not found", id);
        }

        tx.execute("DELETE FROM entities WHERE work_item_id = ?1", params![id])
            .context("Failed to clear previous entities")?;
        for entity in &derived.entities {
            let data = entity
                .data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("Failed to serialize entity data")?;
            tx.execute(
                "INSERT INTO entities (id, work_item_id, name, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![new_id(), id, entity.name, entity.kind, data],
            )
            .context("Failed to insert entity")?;
        }

        tx.commit().context("Failed to commit work item completion")?;
        self.get_work_item(id)?
            .context("Work item not found after completion")
    }

    pub fn fail_work_item(&self, id: &str, reason: &str) -> Result<WorkItem> {
        let count = self
            .conn
            .execute(
                "UPDATE work_items SET status = 'FAILED', failure_reason = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![reason, now(), id],
            )
            .context("Failed to mark work item failed")?;
        if count == 0 {
            anyhow::bail!("Work item {} not found", id);
        }
        self.get_work_item(id)?
            .context("Work item not found after failure update")
    }

    /// Mark `FAILED` only if no run currently owns the item.
    pub fn fail_unless_processing(&self, id: &str, reason: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE work_items SET status = 'FAILED', failure_reason = ?1, updated_at = ?2
                 WHERE id = ?3 AND status <> 'PROCESSING'",
                params![reason, now(), id],
            )
            .context("Failed to mark work item failed")?;
        Ok(count > 0)
    }

    /// Mark `FAILED` only if `run_id` is still the item's active run.
    pub fn fail_active_run(&self, id: &str, run_id: &str, reason: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE work_items SET status = 'FAILED', failure_reason = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'PROCESSING' AND run_id = ?4",
                params![reason, now(), id, run_id],
            )
            .context("Failed to mark run failed")?;
        Ok(count > 0)
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn create_message(
        &self,
        work_item_id: &str,
        owner_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let message = Message {
            id: new_id(),
            work_item_id: work_item_id.to_string(),
            owner_id: owner_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now(),
        };
        self.conn
            .execute(
                "INSERT INTO messages (id, work_item_id, owner_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    message.work_item_id,
                    message.owner_id,
                    role.as_str(),
                    message.content,
                    message.created_at
                ],
            )
            .context("Failed to insert message")?;
        Ok(message)
    }

    pub fn list_messages(&self, work_item_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, work_item_id, owner_id, role, content, created_at
                 FROM messages WHERE work_item_id = ?1 ORDER BY created_at, rowid",
            )
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![work_item_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, work_item_id, owner_id, role_str, content, created_at) =
                row.context("Failed to read message row")?;
            messages.push(Message {
                id,
                work_item_id,
                owner_id,
                role: role_str
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid role in database: '{}'", role_str))?,
                content,
                created_at,
            });
        }
        Ok(messages)
    }

    // ── Entities ──────────────────────────────────────────────────────

    pub fn list_entities(&self, work_item_id: &str) -> Result<Vec<Entity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, work_item_id, name, kind, data
                 FROM entities WHERE work_item_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare list_entities")?;
        let rows = stmt
            .query_map(params![work_item_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query entities")?;
        let mut entities = Vec::new();
        for row in rows {
            let (id, work_item_id, name, kind, data) = row.context("Failed to read entity row")?;
            let data = data
                .map(|d| serde_json::from_str(&d))
                .transpose()
                .context("corrupt entity data JSON")?;
            entities.push(Entity {
                id,
                work_item_id,
                name,
                kind,
                data,
            });
        }
        Ok(entities)
    }

    // ── User settings ─────────────────────────────────────────────────

    pub fn get_settings(&self, user_id: &str) -> Result<Option<UserSettings>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, settings, updated_at FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query user settings")?;
        match row {
            Some((user_id, settings, updated_at)) => Ok(Some(UserSettings {
                user_id,
                settings: serde_json::from_str(&settings).context("corrupt settings JSON")?,
                updated_at,
            })),
            None => Ok(None),
        }
    }

    pub fn put_settings(&self, user_id: &str, settings: &serde_json::Value) -> Result<UserSettings> {
        let json = serde_json::to_string(settings).context("Failed to serialize settings")?;
        self.conn
            .execute(
                "INSERT INTO user_settings (user_id, settings, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET settings = ?2, updated_at = ?3",
                params![user_id, json, now()],
            )
            .context("Failed to upsert user settings")?;
        self.get_settings(user_id)?
            .context("User settings not found after upsert")
    }
}

/// Raw `work_items` row before JSON columns are decoded.
struct WorkItemRow {
    id: String,
    owner_id: String,
    space_id: Option<String>,
    title: Option<String>,
    source_urls: String,
    status: String,
    run_id: Option<String>,
    result_payload: Option<String>,
    failure_reason: Option<String>,
    summary: Option<String>,
    created_at: String,
    updated_at: String,
}

impl WorkItemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            space_id: row.get(2)?,
            title: row.get(3)?,
            source_urls: row.get(4)?,
            status: row.get(5)?,
            run_id: row.get(6)?,
            result_payload: row.get(7)?,
            failure_reason: row.get(8)?,
            summary: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_work_item(self) -> Result<WorkItem> {
        let source_urls: Vec<String> = serde_json::from_str(&self.source_urls).map_err(|e| {
            anyhow::anyhow!("corrupt source_urls JSON '{}': {}", self.source_urls, e)
        })?;
        let result_payload = self
            .result_payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .context("corrupt result_payload JSON")?;
        Ok(WorkItem {
            status: self
                .status
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid status in database: '{}'", self.status))?,
            id: self.id,
            owner_id: self.owner_id,
            space_id: self.space_id,
            title: self.title,
            source_urls,
            run_id: self.run_id,
            result_payload,
            failure_reason: self.failure_reason,
            summary: self.summary,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
