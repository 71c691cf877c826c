use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use l8r_common::{Error, Result, SpanUpdate, TraceHandle, TraceSink};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A persisted span row.
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub id: String,
    pub root_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub metadata: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Local span backend. Rows are keyed by span id, so any process that holds
/// a decoded `TraceHandle` can keep writing to the same trace tree.
pub struct SqliteSpanStore {
    conn: Mutex<Connection>,
    project: String,
}

impl SqliteSpanStore {
    pub fn open(db_path: &Path, project: impl Into<String>) -> Result<Self> {
        info!("opening span store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open span database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        Self::with_connection(conn, project.into())
    }

    pub fn in_memory(project: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::with_connection(conn, project.into())
    }

    fn with_connection(conn: Connection, project: String) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS spans (
                id TEXT PRIMARY KEY,
                root_id TEXT NOT NULL,
                parent_id TEXT,
                project TEXT NOT NULL,
                name TEXT NOT NULL,
                input TEXT,
                output TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                started_at TEXT NOT NULL,
                ended_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_spans_root
                ON spans(root_id, started_at);",
        )
        .map_err(|e| Error::Database(format!("migration failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            project,
        })
    }

    pub async fn span(&self, span_id: &str) -> Result<Option<SpanRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, root_id, parent_id, name, input, output, metadata, started_at, ended_at
             FROM spans WHERE id = ?1",
            params![span_id],
            span_from_row,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load span: {e}")))
    }

    /// All spans of one trace tree, oldest first.
    pub async fn trace(&self, root_id: &str) -> Result<Vec<SpanRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, root_id, parent_id, name, input, output, metadata, started_at, ended_at
                 FROM spans WHERE root_id = ?1 ORDER BY started_at ASC, rowid ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare trace query: {e}")))?;
        let rows = stmt
            .query_map(params![root_id], span_from_row)
            .map_err(|e| Error::Database(format!("failed to query trace: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Database(format!("failed to read trace: {e}")))
    }
}

#[async_trait]
impl TraceSink for SqliteSpanStore {
    async fn open_span(
        &self,
        span: &TraceHandle,
        parent: Option<&TraceHandle>,
        name: &str,
        metadata: Value,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO spans (id, root_id, parent_id, project, name, metadata, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                span.span_id(),
                span.root_id(),
                parent.map(|p| p.span_id()),
                self.project,
                name,
                metadata.to_string(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )
        .map_err(|e| Error::Trace(format!("failed to open span '{name}': {e}")))?;
        debug!(span_id = span.span_id(), name, "span opened");
        Ok(())
    }

    async fn update_span(&self, span: &TraceHandle, update: SpanUpdate) -> Result<()> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT metadata FROM spans WHERE id = ?1",
                params![span.span_id()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Trace(format!("failed to load span: {e}")))?;
        let Some(existing) = existing else {
            return Err(Error::Trace(format!("unknown span {}", span.span_id())));
        };

        let mut metadata: Value =
            serde_json::from_str(&existing).unwrap_or_else(|_| Value::Object(Default::default()));
        if let Some(extra) = update.metadata {
            merge_metadata(&mut metadata, extra);
        }

        conn.execute(
            "UPDATE spans SET
                input = COALESCE(?1, input),
                output = COALESCE(?2, output),
                metadata = ?3
             WHERE id = ?4",
            params![
                update.input.map(|v| v.to_string()),
                update.output.map(|v| v.to_string()),
                metadata.to_string(),
                span.span_id(),
            ],
        )
        .map_err(|e| Error::Trace(format!("failed to update span: {e}")))?;
        Ok(())
    }

    async fn close_span(&self, span: &TraceHandle) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE spans SET ended_at = COALESCE(ended_at, ?1) WHERE id = ?2",
                params![Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true), span.span_id()],
            )
            .map_err(|e| Error::Trace(format!("failed to close span: {e}")))?;
        if changed == 0 {
            return Err(Error::Trace(format!("unknown span {}", span.span_id())));
        }
        debug!(span_id = span.span_id(), "span closed");
        Ok(())
    }
}

fn merge_metadata(target: &mut Value, extra: Value) {
    match (target, extra) {
        (Value::Object(target), Value::Object(extra)) => {
            for (key, value) in extra {
                target.insert(key, value);
            }
        }
        (target, extra) => *target = extra,
    }
}

fn span_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpanRecord> {
    let json = |raw: Option<String>| raw.and_then(|s| serde_json::from_str(&s).ok());
    let time = |raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(SpanRecord {
        id: row.get(0)?,
        root_id: row.get(1)?,
        parent_id: row.get(2)?,
        name: row.get(3)?,
        input: json(row.get(4)?),
        output: json(row.get(5)?),
        metadata: json(row.get(6)?).unwrap_or(Value::Null),
        started_at: time(row.get(7)?),
        ended_at: row.get::<_, Option<String>>(8)?.map(time),
    })
}
