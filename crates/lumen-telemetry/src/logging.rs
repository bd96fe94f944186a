use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const LOGS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp       TEXT NOT NULL,
    level           TEXT NOT NULL,
    target          TEXT NOT NULL,
    message         TEXT NOT NULL,
    fields          TEXT,
    conversation_id INTEGER,
    tool            TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_conversation ON logs(conversation_id);
";

/// A persisted warn+ record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub conversation_id: Option<i64>,
    pub tool: Option<String>,
}

/// Filters for [`SqliteLogSink::query`].
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub conversation_id: Option<i64>,
    pub limit: Option<u32>,
}

/// SQLite store for warn+ log records.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_schema(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(LOGS_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // A failed log write has nowhere to be reported.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, conversation_id, tool)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.conversation_id,
                record.tool,
            ],
        );
    }

    /// Most recent records first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, level, target, message, fields, conversation_id, tool
             FROM logs
             WHERE (?1 IS NULL OR level = ?1)
               AND (?2 IS NULL OR conversation_id = ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![q.level, q.conversation_id, q.limit.unwrap_or(100)],
            |row| {
                Ok(LogRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    level: row.get(2)?,
                    target: row.get(3)?,
                    message: row.get(4)?,
                    fields: row.get(5)?,
                    conversation_id: row.get(6)?,
                    tool: row.get(7)?,
                })
            },
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    conversation_id: Option<i64>,
    tool: Option<String>,
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
    conversation_id: Option<i64>,
    tool: Option<String>,
}

impl FieldVisitor {
    fn record_value(&mut self, name: &str, value: Value) {
        match (name, &value) {
            ("message", _) => {
                self.message = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
            }
            ("conversation_id", Value::Number(n)) => self.conversation_id = n.as_i64(),
            ("conversation_id", Value::String(s)) => self.conversation_id = s.parse().ok(),
            ("tool", Value::String(s)) => self.tool = Some(s.clone()),
            _ => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        self.record_value(
            field.name(),
            Value::String(rendered.trim_matches('"').to_string()),
        );
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field.name(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field.name(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field.name(), Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.record_value(field.name(), Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field.name(), Value::Bool(value));
    }
}

/// Stored on spans so child events inherit `conversation_id` / `tool`.
#[derive(Clone)]
struct SpanFields {
    conversation_id: Option<i64>,
    tool: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.conversation_id.is_none() && visitor.tool.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanFields {
                conversation_id: visitor.conversation_id,
                tool: visitor.tool,
            });
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        // Spans often declare `conversation_id = field::Empty` and fill it later.
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if visitor.conversation_id.is_none() && visitor.tool.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            let previous = extensions.remove::<SpanFields>();
            extensions.insert(SpanFields {
                conversation_id: visitor
                    .conversation_id
                    .or(previous.as_ref().and_then(|p| p.conversation_id)),
                tool: visitor.tool.or(previous.and_then(|p| p.tool)),
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if visitor.conversation_id.is_some() && visitor.tool.is_some() {
                    break;
                }
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    visitor.conversation_id = visitor.conversation_id.or(fields.conversation_id);
                    if visitor.tool.is_none() {
                        visitor.tool.clone_from(&fields.tool);
                    }
                }
            }
        }

        let fields = (!visitor.fields.is_empty())
            .then(|| serde_json::to_string(&visitor.fields).unwrap_or_default());

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            conversation_id: visitor.conversation_id,
            tool: visitor.tool,
        });
    }
}
