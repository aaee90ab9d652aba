//! Remote data store contract.
//!
//! The queue core talks to its backing store only through [`DataStore`]:
//! table-scoped select / insert / update on JSON rows, plus a per-table
//! change feed. Two implementations ship with the crate:
//! [`SqliteStore`](crate::db::SqliteStore) (local) and
//! [`SupabaseStore`](crate::api::SupabaseStore) (hosted PostgREST).

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StoreError;

/// Capacity of each table's change channel. Lagging receivers only lose
/// "something changed" events, which the debounce coalesces anyway.
pub const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Cars,
    Motorcycles,
    Services,
    Crews,
    Packages,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Cars,
        Table::Motorcycles,
        Table::Services,
        Table::Crews,
        Table::Packages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Cars => "cars",
            Table::Motorcycles => "motorcycles",
            Table::Services => "services",
            Table::Crews => "crew_members",
            Table::Packages => "service_packages",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Column equals a JSON scalar (string, number or bool).
    Eq(String, Value),
    /// Case-insensitive substring match on a text column.
    Contains(String, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn contains(mut self, column: &str, needle: &str) -> Self {
        self.filters
            .push(Filter::Contains(column.to_string(), needle.to_string()));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query matching a single row by id.
    pub fn by_id(id: &str) -> Self {
        Self::new().eq("id", id)
    }

    /// Evaluate the filters against an in-memory row.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|filter| match filter {
            Filter::Eq(column, expected) => row.get(column) == Some(expected),
            Filter::Contains(column, needle) => row
                .get(column)
                .and_then(Value::as_str)
                .map(|s| s.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    /// Reported by pollers that only know the table changed.
    Unknown,
}

/// "Something changed in this table". No payload beyond that is relied upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: Table,
    pub op: ChangeOp,
}

/// Live subscription to one table's change feed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    table: Table,
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn new(table: Table, receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { table, receiver }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Wait for the next change. Returns `None` once the store is gone.
    ///
    /// A lagged receiver still reports a change: the missed events all mean
    /// the same thing.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => Some(ChangeEvent {
                table: self.table,
                op: ChangeOp::Unknown,
            }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub fn unsubscribe(self) {}
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// Rows matching `query`, ordered and limited as requested.
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// Insert a row; returns it with server-generated fields
    /// (`id`, `created_at`, `updated_at`, defaults).
    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError>;

    /// Merge `changes` into every row matching `query`; returns the updated rows.
    async fn update(
        &self,
        table: Table,
        changes: Value,
        query: &Query,
    ) -> Result<Vec<Value>, StoreError>;

    fn subscribe(&self, table: Table) -> Subscription;
}
