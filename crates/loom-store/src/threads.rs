use chrono::Utc;
use tracing::instrument;

use loom_core::ids::ThreadId;
use loom_core::messages::{ContentFilter, Thread};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const THREAD_COLUMNS: &str = "id, name, content_filter, shared, created_at, updated_at";

pub struct ThreadRepo {
    db: Database,
}

impl ThreadRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new thread.
    #[instrument(skip(self, content_filter), fields(name))]
    pub fn create(
        &self,
        name: &str,
        content_filter: Option<&ContentFilter>,
    ) -> Result<Thread, StoreError> {
        let id = ThreadId::new();
        let now = Utc::now();
        let stamp = row_helpers::format_timestamp(&now);
        let filter_json = content_filter.map(serde_json::to_string).transpose()?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO threads (id, name, content_filter, shared, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                rusqlite::params![id.as_str(), name, filter_json, stamp, stamp],
            )?;

            Ok(Thread {
                id,
                name: name.to_string(),
                content_filter: content_filter.cloned(),
                shared: false,
                created_at: now,
                updated_at: now,
            })
        })
    }

    /// Get a thread by ID.
    #[instrument(skip(self), fields(thread_id = %id))]
    pub fn get(&self, id: &ThreadId) -> Result<Thread, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_thread(row),
                None => Err(StoreError::NotFound(format!("thread {id}"))),
            }
        })
    }

    pub fn exists(&self, id: &ThreadId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM threads WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// List threads, most recently active first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<Thread>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {THREAD_COLUMNS} FROM threads
                 ORDER BY updated_at DESC, id DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_thread(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(thread_id = %id))]
    pub fn rename(&self, id: &ThreadId, name: &str) -> Result<(), StoreError> {
        self.update(
            id,
            "UPDATE threads SET name = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::types::Value::Text(name.to_string()),
        )
    }

    #[instrument(skip(self), fields(thread_id = %id))]
    pub fn set_shared(&self, id: &ThreadId, shared: bool) -> Result<(), StoreError> {
        self.update(
            id,
            "UPDATE threads SET shared = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::types::Value::Integer(i64::from(shared)),
        )
    }

    #[instrument(skip(self, filter), fields(thread_id = %id))]
    pub fn set_filter(&self, id: &ThreadId, filter: Option<&ContentFilter>) -> Result<(), StoreError> {
        let value = match filter {
            Some(f) => rusqlite::types::Value::Text(serde_json::to_string(f)?),
            None => rusqlite::types::Value::Null,
        };
        self.update(
            id,
            "UPDATE threads SET content_filter = ?1, updated_at = ?2 WHERE id = ?3",
            value,
        )
    }

    /// Bump `updated_at` without changing anything else.
    #[instrument(skip(self), fields(thread_id = %id))]
    pub fn touch(&self, id: &ThreadId) -> Result<(), StoreError> {
        let now = row_helpers::format_timestamp(&Utc::now());
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE threads SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("thread {id}")));
            }
            Ok(())
        })
    }

    /// Delete a thread and, by cascade, its messages.
    #[instrument(skip(self), fields(thread_id = %id))]
    pub fn delete(&self, id: &ThreadId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM threads WHERE id = ?1", [id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("thread {id}")));
            }
            Ok(())
        })
    }

    fn update(&self, id: &ThreadId, sql: &str, value: rusqlite::types::Value) -> Result<(), StoreError> {
        let now = row_helpers::format_timestamp(&Utc::now());
        self.db.with_conn(|conn| {
            let changed = conn.execute(sql, rusqlite::params![value, now, id.as_str()])?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("thread {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_thread(row: &rusqlite::Row<'_>) -> Result<Thread, StoreError> {
    let content_filter = row_helpers::get_opt::<String>(row, 2, "threads", "content_filter")?
        .map(|raw| row_helpers::parse_json::<ContentFilter>(&raw, "threads", "content_filter"))
        .transpose()?;
    let created: String = row_helpers::get(row, 4, "threads", "created_at")?;
    let updated: String = row_helpers::get(row, 5, "threads", "updated_at")?;

    Ok(Thread {
        id: ThreadId::from_raw(row_helpers::get::<String>(row, 0, "threads", "id")?),
        name: row_helpers::get(row, 1, "threads", "name")?,
        content_filter,
        shared: row_helpers::get::<i64>(row, 3, "threads", "shared")? != 0,
        created_at: row_helpers::parse_timestamp(&created, "threads", "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated, "threads", "updated_at")?,
    })
}
