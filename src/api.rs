//! Hosted data store client (Supabase / PostgREST).
//!
//! Each table maps to `{url}/rest/v1/{table}`. Filters are encoded as
//! PostgREST operators (`eq.`, `ilike.`), writes ask for the affected rows
//! back with `Prefer: return=representation`, and error bodies
//! (`{code, message}`) are turned into [`StoreError`]s.
//!
//! Change notifications are produced by polling: while a table has
//! subscribers, a background task compares the row count and newest
//! `updated_at` every `poll_interval` and emits a change when they move.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{StoreError, PGRST_TABLE_NOT_FOUND, PG_PERMISSION_DENIED};
use crate::store::{
    ChangeEvent, ChangeOp, DataStore, Filter, Query, Subscription, Table, CHANGE_CHANNEL_CAPACITY,
};

/// Default timeout for REST requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the project URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/rest/v1`
pub fn normalize_project_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if let Some(stripped) = url.strip_suffix("/rest/v1") {
        url = stripped.to_string();
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

// ---------------------------------------------------------------------------
// Query encoding
// ---------------------------------------------------------------------------

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// PostgREST query-string pairs for `query`.
pub(crate) fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for filter in &query.filters {
        match filter {
            Filter::Eq(column, Value::Null) => params.push((column.clone(), "is.null".into())),
            Filter::Eq(column, value) => {
                params.push((column.clone(), format!("eq.{}", scalar_text(value))))
            }
            Filter::Contains(column, needle) => {
                // `*` is the PostgREST wildcard; `,` and parens are syntax.
                let cleaned: String = needle
                    .chars()
                    .filter(|c| !matches!(c, '*' | ',' | '(' | ')'))
                    .collect();
                params.push((column.clone(), format!("ilike.*{cleaned}*")));
            }
        }
    }
    if let Some(order) = &query.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push(("order".into(), format!("{}.{direction}", order.column)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".into(), limit.to_string()));
    }
    params
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a store error with a friendly message.
fn transport_error(url: &str, err: &reqwest::Error) -> StoreError {
    if err.is_connect() {
        return StoreError::network(format!("Cannot reach the queue database at {url}"));
    }
    if err.is_timeout() {
        return StoreError::network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return StoreError::other(format!("Invalid queue database URL: {url}"));
    }
    StoreError::network(format!("Network error communicating with {url}: {err}"))
}

/// Build a store error from a non-success response.
pub(crate) fn response_error(status: StatusCode, body: &str) -> StoreError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("error")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| match body.trim() {
            "" => format!("Queue database error (HTTP {})", status.as_u16()),
            text => format!("Queue database error (HTTP {}): {text}", status.as_u16()),
        });

    let code = code.or_else(|| match status.as_u16() {
        401 | 403 => Some(PG_PERMISSION_DENIED.to_string()),
        404 => Some(PGRST_TABLE_NOT_FOUND.to_string()),
        _ => None,
    });

    let mut error = StoreError::from_code(code.as_deref(), message);
    if status.is_server_error() && code.is_none() {
        error.kind = crate::error::StoreErrorKind::Network;
    }
    error
}

/// Total from a `Content-Range` header (`0-24/573`, `*/0`).
pub(crate) fn content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Inner {
    rest_url: String,
    anon_key: Zeroizing<String>,
    client: Client,
    poll_interval: Duration,
    channels: Mutex<BTreeMap<Table, broadcast::Sender<ChangeEvent>>>,
}

/// [`DataStore`] backed by a Supabase project's REST API.
#[derive(Clone)]
pub struct SupabaseStore {
    inner: Arc<Inner>,
}

impl SupabaseStore {
    pub fn new(
        project_url: &str,
        anon_key: Zeroizing<String>,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::other(format!("Failed to create HTTP client: {e}")))?;
        let rest_url = format!("{}/rest/v1", normalize_project_url(project_url));
        info!(url = %rest_url, "Using hosted queue database");
        Ok(Self {
            inner: Arc::new(Inner {
                rest_url,
                anon_key,
                client,
                poll_interval,
                channels: Mutex::new(BTreeMap::new()),
            }),
        })
    }
}

impl Inner {
    fn table_url(&self, table: Table) -> String {
        format!("{}/{}", self.rest_url, table.as_str())
    }

    fn channels(&self) -> MutexGuard<'_, BTreeMap<Table, broadcast::Sender<ChangeEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", self.anon_key.as_str())
            .bearer_auth(self.anon_key.as_str())
            .header(ACCEPT, "application/json")
    }

    /// Send and return `(headers, body)` of a successful response.
    async fn send(&self, req: RequestBuilder) -> Result<(HeaderMap, Value), StoreError> {
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.rest_url, &e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(response_error(status, &body));
        }
        if body.trim().is_empty() {
            return Ok((headers, Value::Array(Vec::new())));
        }
        let value = serde_json::from_str(&body)
            .map_err(|e| StoreError::decode(format!("Invalid JSON from queue database: {e}")))?;
        Ok((headers, value))
    }

    fn rows(value: Value) -> Result<Vec<Value>, StoreError> {
        match value {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            row @ Value::Object(_) => Ok(vec![row]),
            other => Err(StoreError::decode(format!("Expected rows, got {other}"))),
        }
    }

    /// `(row count, newest updated_at)` for change detection.
    async fn fingerprint(&self, table: Table) -> Result<(Option<u64>, Option<String>), StoreError> {
        let req = self
            .authed(self.inner_get(table))
            .query(&[
                ("select", "updated_at"),
                ("order", "updated_at.desc.nullslast"),
                ("limit", "1"),
            ])
            .header("Prefer", "count=exact");
        let (headers, body) = self.send(req).await?;
        let count = headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total);
        let newest = Self::rows(body)?
            .first()
            .and_then(|row| row.get("updated_at"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok((count, newest))
    }

    fn inner_get(&self, table: Table) -> RequestBuilder {
        self.client.get(self.table_url(table))
    }
}

/// Poll `table` until its last subscriber goes away.
async fn poll_changes(inner: Arc<Inner>, table: Table, tx: broadcast::Sender<ChangeEvent>) {
    debug!(table = %table, "change poller started");
    let mut last: Option<(Option<u64>, Option<String>)> = None;
    loop {
        tokio::time::sleep(inner.poll_interval).await;
        if tx.receiver_count() == 0 {
            inner.channels().remove(&table);
            break;
        }
        match inner.fingerprint(table).await {
            Ok(current) => {
                if last.as_ref().is_some_and(|prev| *prev != current) {
                    let _ = tx.send(ChangeEvent {
                        table,
                        op: ChangeOp::Unknown,
                    });
                }
                last = Some(current);
            }
            Err(e) => warn!(table = %table, error = %e, "change poll failed"),
        }
    }
    debug!(table = %table, "change poller stopped");
}

#[async_trait]
impl DataStore for SupabaseStore {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Value>, StoreError> {
        let inner = &self.inner;
        let req = inner
            .authed(inner.inner_get(table))
            .query(&query_params(query));
        let (_, body) = inner.send(req).await?;
        Inner::rows(body)
    }

    async fn insert(&self, table: Table, row: Value) -> Result<Value, StoreError> {
        let inner = &self.inner;
        let req = inner
            .authed(inner.client.post(inner.table_url(table)))
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .json(&row);
        let (_, body) = inner.send(req).await?;
        Inner::rows(body)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::decode(format!("Insert into {table} returned no row")))
    }

    async fn update(
        &self,
        table: Table,
        changes: Value,
        query: &Query,
    ) -> Result<Vec<Value>, StoreError> {
        let inner = &self.inner;
        // PATCH takes filters only; `select=*` shapes the returned rows.
        let req = inner
            .authed(inner.client.patch(inner.table_url(table)))
            .query(&query_params(query))
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=representation")
            .json(&changes);
        let (_, body) = inner.send(req).await?;
        Inner::rows(body)
    }

    fn subscribe(&self, table: Table) -> Subscription {
        let mut channels = self.inner.channels();
        if let Some(tx) = channels.get(&table) {
            return Subscription::new(table, tx.subscribe());
        }

        let (tx, rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                channels.insert(table, tx.clone());
                handle.spawn(poll_changes(self.inner.clone(), table, tx));
            }
            Err(_) => warn!(table = %table, "no async runtime; change polling disabled"),
        }
        Subscription::new(table, rx)
    }
}
