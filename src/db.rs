//! Local SQLite implementation of the data store.
//!
//! Rows are kept as JSON documents in a single `records` table keyed by
//! `(table_name, id)`, and filtered with SQLite's JSON1 functions. Used when
//! no hosted store is configured, and by the test suite (in memory).
//!
//! A partial unique expression index mirrors the active-plate rule: among
//! non-deleted `waiting` / `in-progress` rows of one table, the uppercased
//! plate is unique. Violations surface as Postgres code `23505`, the same
//! as the hosted store reports.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, PG_UNIQUE_VIOLATION};
use crate::store::{
    ChangeEvent, ChangeOp, DataStore, Filter, Query, Subscription, Table, CHANGE_CHANNEL_CAPACITY,
};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    channels: BTreeMap<Table, broadcast::Sender<ChangeEvent>>,
}

/// Timestamp format used for store-generated fields. Fixed width, so
/// lexical order in SQL matches chronological order.
pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn sql_err(context: &str, e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return StoreError::from_code(
                Some(PG_UNIQUE_VIOLATION),
                format!("{context}: duplicate key value violates unique constraint"),
            );
        }
    }
    StoreError::other(format!("{context}: {e}"))
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::other(format!("Failed to create data dir: {e}")))?;
        }
        info!("Opening queue database at {}", path.display());
        let conn = Connection::open(path).map_err(|e| sql_err("sqlite open", e))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| sql_err("pragma setup", e))?;
        Self::with_connection(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| sql_err("sqlite open", e))?;
        Self::with_connection(conn, PathBuf::from(":memory:"))
    }

    fn with_connection(conn: Connection, db_path: PathBuf) -> Result<Self, StoreError> {
        run_migrations(&conn)?;
        let channels = Table::ALL
            .into_iter()
            .map(|table| (table, broadcast::channel(CHANGE_CHANNEL_CAPACITY).0))
            .collect();
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            channels,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, table: Table, op: ChangeOp) {
        if let Some(tx) = self.channels.get(&table) {
            // No receivers is fine.
            let _ = tx.send(ChangeEvent { table, op });
        }
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| sql_err("create schema_version", e))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        debug!("Queue database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating queue database from v{current} to v{CURRENT_SCHEMA_VERSION}");
    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

/// v1: JSON document table.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            table_name TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (table_name, id)
        );
        CREATE INDEX IF NOT EXISTS idx_records_table_created
            ON records(table_name, created_at);
        INSERT INTO schema_version (version) VALUES (1);",
    )
    .map_err(|e| sql_err("migrate v1", e))
}

/// v2: active-plate uniqueness.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_active_plate
            ON records(table_name, upper(trim(json_extract(body, '$.plate'))))
            WHERE json_extract(body, '$.is_deleted') = 0
              AND json_extract(body, '$.status') IN ('waiting', 'in-progress');
        INSERT INTO schema_version (version) VALUES (2);",
    )
    .map_err(|e| sql_err("migrate v2", e))
}

// ---------------------------------------------------------------------------
// Query building
// ---------------------------------------------------------------------------

fn json_path(column: &str) -> String {
    format!("$.{column}")
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// `SELECT id, body` statement plus bound parameters for `query`.
fn build_select(table: Table, query: &Query) -> (String, Vec<SqlValue>) {
    let mut sql = String::from("SELECT id, body FROM records WHERE table_name = ?");
    let mut args = vec![SqlValue::Text(table.as_str().to_string())];

    for filter in &query.filters {
        match filter {
            Filter::Eq(column, Value::Null) => {
                sql.push_str(" AND json_extract(body, ?) IS NULL");
                args.push(SqlValue::Text(json_path(column)));
            }
            Filter::Eq(column, value) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                args.push(SqlValue::Text(json_path(column)));
                args.push(to_sql_value(value));
            }
            Filter::Contains(column, needle) => {
                sql.push_str(" AND lower(json_extract(body, ?)) LIKE ? ESCAPE '\\'");
                args.push(SqlValue::Text(json_path(column)));
                args.push(SqlValue::Text(escape_like(needle)));
            }
        }
    }

    if let Some(order) = &query.order {
        sql.push_str(" ORDER BY json_extract(body, ?)");
        sql.push_str(if order.ascending { " ASC" } else { " DESC" });
        args.push(SqlValue::Text(json_path(&order.column)));
    }
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    (sql, args)
}

fn select_rows(
    conn: &Connection,
    table: Table,
    query: &Query,
) -> Result<Vec<(String, Value)>, StoreError> {
    let (sql, args) = build_select(table, query);
    let mut stmt = conn.prepare(&sql).map_err(|e| sql_err("prepare select", e))?;
    let rows = stmt
        .query_map(params_from_iter(args), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| sql_err("select", e))?;

    let mut out = Vec::new();
    for row in rows {
        let (id, body) = row.map_err(|e| sql_err("read row", e))?;
        let value = serde_json::from_str(&body)
            .map_err(|e| StoreError::decode(format!("Corrupt row {id} in {table}: {e}")))?;
        out.push((id, value));
    }
    Ok(out)
}

fn into_object(row: Value, what: &str) -> Result<Map<String, Value>, StoreError> {
    match row {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::other(format!(
            "{what} must be a JSON object, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// DataStore
// ---------------------------------------------------------------------------

#[async_trait]
impl DataStore for SqliteStore {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, StoreError> {
        let conn = self.lock();
        Ok(select_rows(&conn, table, query)?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError> {
        let mut row = into_object(row, "Inserted row")?;
        let now = now_timestamp();

        let id = match row.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        row.insert("id".into(), Value::String(id.clone()));
        row.entry("created_at")
            .or_insert_with(|| Value::String(now.clone()));
        row.entry("updated_at")
            .or_insert_with(|| Value::String(now.clone()));
        row.entry("is_deleted").or_insert(Value::Bool(false));
        if matches!(table, Table::Crews | Table::Packages) {
            row.entry("is_active").or_insert(Value::Bool(true));
        }
        let created_at = row
            .get("created_at")
            .and_then(Value::as_str)
            .unwrap_or(&now)
            .to_string();

        let row = Value::Object(row);
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO records (table_name, id, body, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![table.as_str(), id, row.to_string(), created_at],
            )
            .map_err(|e| sql_err("insert", e))?;
        }

        debug!(table = %table, id = %id, "row inserted");
        self.publish(table, ChangeOp::Insert);
        Ok(row)
    }

    async fn update(
        &self,
        table: Table,
        changes: Value,
        query: &Query,
    ) -> Result<Vec<Value>, StoreError> {
        let changes = into_object(changes, "Update")?;
        let now = now_timestamp();

        let updated = {
            let mut conn = self.lock();
            let tx = conn
                .transaction()
                .map_err(|e| sql_err("begin update", e))?;
            let matches = select_rows(&tx, table, query)?;
            let mut updated = Vec::with_capacity(matches.len());
            for (id, row) in matches {
                let mut row = into_object(row, "Stored row")?;
                for (key, value) in &changes {
                    row.insert(key.clone(), value.clone());
                }
                if !changes.contains_key("updated_at") {
                    row.insert("updated_at".into(), Value::String(now.clone()));
                }
                let row = Value::Object(row);
                tx.execute(
                    "UPDATE records SET body = ?1 WHERE table_name = ?2 AND id = ?3",
                    params![row.to_string(), table.as_str(), id],
                )
                .map_err(|e| sql_err("update", e))?;
                updated.push(row);
            }
            tx.commit().map_err(|e| sql_err("commit update", e))?;
            updated
        };

        if !updated.is_empty() {
            debug!(table = %table, rows = updated.len(), "rows updated");
            self.publish(table, ChangeOp::Update);
        }
        Ok(updated)
    }

    fn subscribe(&self, table: Table) -> Subscription {
        let receiver = match self.channels.get(&table) {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        Subscription::new(table, receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorKind;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("open in-memory store")
    }

    fn car(plate: &str, status: &str) -> Value {
        json!({ "plate": plate, "model": "Vios", "size": "medium", "status": status })
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_insert_assigns_generated_fields() {
        let store = store();
        let row = store.insert(Table::Cars, car("ABC-1234", "waiting")).await.unwrap();
        assert!(row["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(row["created_at"].is_string());
        assert_eq!(row["is_deleted"], json!(false));

        let crew = store.insert(Table::Crews, json!({ "name": "Jun" })).await.unwrap();
        assert_eq!(crew["is_active"], json!(true));
    }

    #[tokio::test]
    async fn test_select_filters_orders_and_limits() {
        let store = store();
        store.insert(Table::Cars, car("AAA-1111", "waiting")).await.unwrap();
        store.insert(Table::Cars, car("BBB-2222", "completed")).await.unwrap();
        store.insert(Table::Motorcycles, car("AAA-1111", "waiting")).await.unwrap();

        let waiting = store
            .select(Table::Cars, &Query::new().eq("status", "waiting"))
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);

        let newest = store
            .select(
                Table::Cars,
                &Query::new()
                    .contains("plate", "b")
                    .order_by("created_at", false)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0]["plate"], json!("BBB-2222"));

        let not_deleted = store
            .select(Table::Cars, &Query::new().eq("is_deleted", false))
            .await
            .unwrap();
        assert_eq!(not_deleted.len(), 2);
    }

    #[tokio::test]
    async fn test_contains_escapes_like_wildcards() {
        let store = store();
        store.insert(Table::Cars, car("ABC-1234", "completed")).await.unwrap();
        let hits = store
            .select(Table::Cars, &Query::new().contains("plate", "%"))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_active_plate_unique_index() {
        let store = store();
        store.insert(Table::Cars, car("ABC-1234", "waiting")).await.unwrap();

        let err = store
            .insert(Table::Cars, car("abc-1234", "in-progress"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::UniqueViolation);

        // Completed records and other tables may reuse the plate.
        store.insert(Table::Cars, car("ABC-1234", "completed")).await.unwrap();
        store
            .insert(Table::Motorcycles, car("ABC-1234", "waiting"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_merges_and_publishes() {
        let store = store();
        let mut sub = store.subscribe(Table::Cars);
        let row = store.insert(Table::Cars, car("ABC-1234", "waiting")).await.unwrap();
        let id = row["id"].as_str().unwrap().to_string();
        assert_eq!(sub.recv().await.unwrap().op, ChangeOp::Insert);

        let updated = store
            .update(
                Table::Cars,
                json!({ "status": "in-progress", "crew": ["c1"] }),
                &Query::by_id(&id),
            )
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["status"], json!("in-progress"));
        assert_eq!(updated[0]["model"], json!("Vios"));
        assert_eq!(sub.recv().await.unwrap().op, ChangeOp::Update);

        let none = store
            .update(Table::Cars, json!({ "model": "x" }), &Query::by_id("missing"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_update_into_duplicate_active_plate_is_rejected() {
        let store = store();
        store.insert(Table::Cars, car("ABC-1234", "waiting")).await.unwrap();
        let other = store.insert(Table::Cars, car("XYZ-9876", "waiting")).await.unwrap();
        let err = store
            .update(
                Table::Cars,
                json!({ "plate": "ABC-1234" }),
                &Query::by_id(other["id"].as_str().unwrap()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::UniqueViolation);
    }
}
