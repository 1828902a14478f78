//! Query catalog interface, and a local SQLite-backed catalog.

use std::{fmt, path::Path, sync::Mutex, time::Duration};

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{error::BoxError, record::PartitionKey};

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryId(pub String);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryState::Queued | QueryState::Running)
    }

    fn label(&self) -> &'static str {
        match self {
            QueryState::Queued => "QUEUED",
            QueryState::Running => "RUNNING",
            QueryState::Succeeded => "SUCCEEDED",
            QueryState::Failed(_) => "FAILED",
            QueryState::Cancelled => "CANCELLED",
        }
    }

    fn from_row(label: &str, reason: Option<String>) -> Result<Self, BoxError> {
        Ok(match label {
            "QUEUED" => QueryState::Queued,
            "RUNNING" => QueryState::Running,
            "SUCCEEDED" => QueryState::Succeeded,
            "FAILED" => QueryState::Failed(reason.unwrap_or_default()),
            "CANCELLED" => QueryState::Cancelled,
            other => return Err(format!("unknown query state {other:?}").into()),
        })
    }
}

/// A statement the catalog can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    AddPartition {
        database: String,
        table: String,
        key: PartitionKey,
        location: String,
    },
    Sql(String),
}

fn quote(s: &str) -> String {
    s.replace('\'', "''")
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::AddPartition {
                database,
                table,
                key,
                location,
            } => write!(
                f,
                "ALTER TABLE {database}.{table} ADD IF NOT EXISTS PARTITION (year='{}', month='{}', day='{}') LOCATION '{}'",
                quote(&key.year),
                quote(&key.month),
                quote(&key.day),
                quote(location)
            ),
            Statement::Sql(sql) => f.write_str(sql),
        }
    }
}

/// An asynchronous query service: statements are submitted, then polled.
#[allow(async_fn_in_trait)]
pub trait QueryCatalog {
    async fn submit(&self, statement: &Statement) -> Result<QueryId, BoxError>;
    async fn state(&self, id: &QueryId) -> Result<QueryState, BoxError>;
}

/// Poll `id` every `poll_interval` until it reaches a terminal state.
pub async fn wait_for_completion<C: QueryCatalog>(
    catalog: &C,
    id: &QueryId,
    poll_interval: Duration,
) -> Result<QueryState, BoxError> {
    loop {
        let state = catalog.state(id).await?;
        if state.is_terminal() {
            return Ok(state);
        }
        tracing::debug!("query {id} is {}", state.label());
        tokio::time::sleep(poll_interval).await;
    }
}

/// Catalog kept in a SQLite database. Statements run synchronously on submit.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("could not open catalog {}", path.display()))?;
        Self::init(conn)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory().context("could not open catalog")?)
    }

    fn init(mut conn: Connection) -> anyhow::Result<Self> {
        {
            let tx = conn.transaction().context("could not initialize catalog")?;
            tx.execute_batch(SCHEMA)
                .context("could not initialize catalog schema")?;
            tx.commit()?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, BoxError> {
        self.conn
            .lock()
            .map_err(|_| "catalog connection poisoned".into())
    }

    fn execute(conn: &Connection, statement: &Statement) -> rusqlite::Result<()> {
        match statement {
            Statement::AddPartition {
                database,
                table,
                key,
                location,
            } => {
                conn.prepare_cached(
                    "INSERT INTO partitions (database_name, table_name, year, month, day, location, registered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT DO NOTHING",
                )?
                .execute(params![
                    database,
                    table,
                    key.year,
                    key.month,
                    key.day,
                    location,
                    chrono::Utc::now().to_rfc3339()
                ])?;
                Ok(())
            }
            Statement::Sql(sql) => conn.execute_batch(sql),
        }
    }

    /// Registered partitions of `database.table`, oldest first.
    pub fn partitions(&self, database: &str, table: &str) -> Result<Vec<(PartitionKey, String)>, BoxError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT year, month, day, location FROM partitions
             WHERE database_name = ?1 AND table_name = ?2
             ORDER BY year, month, day",
        )?;
        let rows = stmt.query_map(params![database, table], |row| {
            Ok((
                PartitionKey {
                    year: row.get(0)?,
                    month: row.get(1)?,
                    day: row.get(2)?,
                },
                row.get::<_, String>(3)?,
            ))
        })?;
        let partitions = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(partitions)
    }
}

impl QueryCatalog for SqliteCatalog {
    async fn submit(&self, statement: &Statement) -> Result<QueryId, BoxError> {
        let id = QueryId(uuid::Uuid::new_v4().to_string());
        let text = statement.to_string();
        let conn = self.lock()?;
        let state = match Self::execute(&conn, statement) {
            Ok(()) => QueryState::Succeeded,
            Err(e) => QueryState::Failed(e.to_string()),
        };
        let reason = match &state {
            QueryState::Failed(reason) => Some(reason.as_str()),
            _ => None,
        };
        conn.prepare_cached(
            "INSERT INTO queries (id, statement, state, reason, submitted_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![id.0, text, state.label(), reason, chrono::Utc::now().to_rfc3339()])?;
        tracing::debug!("query {id}: {text} -> {}", state.label());
        Ok(id)
    }

    async fn state(&self, id: &QueryId) -> Result<QueryState, BoxError> {
        let conn = self.lock()?;
        let row: Option<(String, Option<String>)> = conn
            .prepare_cached("SELECT state, reason FROM queries WHERE id = ?1")?
            .query_row(params![id.0], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        let (label, reason) = row.ok_or_else(|| format!("unknown query {id}"))?;
        QueryState::from_row(&label, reason)
    }
}
