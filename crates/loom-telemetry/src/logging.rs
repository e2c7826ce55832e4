//! Persistence of warn+ events for later inspection with `loom logs`.
//!
//! Each row carries the thread, stream and answer it concerns. Events rarely
//! name all three themselves, so missing ids are filled in from the
//! enclosing spans (the coordinator opens an `answer_stream` span per worker).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Least severe level written to the database.
pub const PERSIST_LEVEL: Level = Level::WARN;

const SCHEMA: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     CREATE TABLE IF NOT EXISTS stream_logs (
         seq INTEGER PRIMARY KEY AUTOINCREMENT,
         logged_at TEXT NOT NULL,
         severity INTEGER NOT NULL,
         target TEXT NOT NULL,
         message TEXT NOT NULL,
         fields TEXT NOT NULL DEFAULT '{}',
         thread_id TEXT,
         stream_id TEXT,
         answer_id TEXT
     );
     CREATE INDEX IF NOT EXISTS idx_stream_logs_thread ON stream_logs(thread_id, seq);
     CREATE INDEX IF NOT EXISTS idx_stream_logs_stream ON stream_logs(stream_id, seq);";

const SELECT: &str = "SELECT seq, logged_at, severity, target, message, fields, thread_id, stream_id, answer_id
     FROM stream_logs
     WHERE severity <= ?1
       AND (?2 IS NULL OR thread_id = ?2)
       AND (?3 IS NULL OR stream_id = ?3)
     ORDER BY seq DESC
     LIMIT ?4";

/// 1 for ERROR up to 5 for TRACE, so "this level or worse" is `severity <= n`.
fn severity(level: Level) -> i64 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        _ => 5,
    }
}

fn level_name(severity: i64) -> &'static str {
    match severity {
        1 => "ERROR",
        2 => "WARN",
        3 => "INFO",
        4 => "DEBUG",
        _ => "TRACE",
    }
}

/// Which thread, stream and answer an event belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Correlation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_id: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.thread_id.is_none() && self.stream_id.is_none() && self.answer_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.thread_id.is_some() && self.stream_id.is_some() && self.answer_id.is_some()
    }

    /// Take ids from `outer` only where this one has none.
    fn inherit(&mut self, outer: &Correlation) {
        if self.thread_id.is_none() {
            self.thread_id.clone_from(&outer.thread_id);
        }
        if self.stream_id.is_none() {
            self.stream_id.clone_from(&outer.stream_id);
        }
        if self.answer_id.is_none() {
            self.answer_id.clone_from(&outer.answer_id);
        }
    }
}

/// One persisted event, newest first in query results.
#[derive(Clone, Debug, Serialize)]
pub struct LogRecord {
    pub seq: i64,
    pub logged_at: DateTime<Utc>,
    pub level: &'static str,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(flatten)]
    pub correlation: Correlation,
}

/// Filters for [`SqliteLogSink::query`].
#[derive(Clone, Debug)]
pub struct LogQuery {
    /// Include this level and everything more severe.
    pub min_level: Level,
    pub thread_id: Option<String>,
    pub stream_id: Option<String>,
    pub limit: u32,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            min_level: PERSIST_LEVEL,
            thread_id: None,
            stream_id: None,
            limit: 100,
        }
    }
}

/// An event ready to be written.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub logged_at: DateTime<Utc>,
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: Map<String, Value>,
    pub correlation: Correlation,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            // Connection::open reports the failure if this did not work.
            let _ = std::fs::create_dir_all(parent);
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record(&self, entry: &LogEntry) -> Result<i64, rusqlite::Error> {
        let fields = Value::Object(entry.fields.clone()).to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stream_logs (logged_at, severity, target, message, fields, thread_id, stream_id, answer_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                entry.logged_at.to_rfc3339(),
                severity(entry.level),
                entry.target,
                entry.message,
                fields,
                entry.correlation.thread_id,
                entry.correlation.stream_id,
                entry.correlation.answer_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SELECT)?;
        let rows = stmt.query_map(
            rusqlite::params![severity(q.min_level), q.thread_id, q.stream_id, q.limit],
            row_to_record,
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM stream_logs", [], |row| row.get(0))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
    let logged_at: String = row.get(1)?;
    let logged_at = DateTime::parse_from_rfc3339(&logged_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);
    let fields: String = row.get(5)?;
    let fields = match serde_json::from_str(&fields) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => return Err(rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))),
    };
    Ok(LogRecord {
        seq: row.get(0)?,
        logged_at,
        level: level_name(row.get(2)?),
        target: row.get(3)?,
        message: row.get(4)?,
        fields,
        correlation: Correlation {
            thread_id: row.get(6)?,
            stream_id: row.get(7)?,
            answer_id: row.get(8)?,
        },
    })
}

/// Splits recorded values into the message, correlation ids and the rest.
#[derive(Default)]
struct Collected {
    message: Option<String>,
    correlation: Correlation,
    fields: Map<String, Value>,
}

impl Collected {
    fn text(&mut self, name: &str, value: String) {
        let slot = match name {
            "message" => &mut self.message,
            "thread_id" => &mut self.correlation.thread_id,
            "stream_id" => &mut self.correlation.stream_id,
            "answer_id" => &mut self.correlation.answer_id,
            other => {
                self.fields.insert(other.to_string(), Value::String(value));
                return;
            }
        };
        *slot = Some(value);
    }
}

impl Visit for Collected {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.text(field.name(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

/// Layer that writes events at [`PERSIST_LEVEL`] or worse to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        attrs.record(&mut collected);
        if collected.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collected.correlation);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > PERSIST_LEVEL {
            return;
        }

        let mut collected = Collected::default();
        event.record(&mut collected);

        // Innermost span first, so the closest ids win.
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if collected.correlation.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    collected.correlation.inherit(outer);
                }
            }
        }

        let entry = LogEntry {
            logged_at: Utc::now(),
            level,
            target: event.metadata().target().to_string(),
            message: collected.message.unwrap_or_default(),
            fields: collected.fields,
            correlation: collected.correlation,
        };
        // A failing log write has nowhere to be reported.
        let _ = self.sink.record(&entry);
    }
}
