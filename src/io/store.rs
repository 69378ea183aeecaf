//! Counts table store
//!
//! `RestStore` talks to a PostgREST-style collection endpoint
//! (`{base_url}/rest/v1/{table}`). `MemoryStore` keeps rows in a BTreeMap
//! with the same unique key and merge semantics; services and tests use it
//! through the `CountStore` trait.
//!
//! Upsert contract: one row per (sensor_id, timestamp). Writing a record
//! whose key exists replaces its count columns and keeps `id`/`created_at`.

use crate::domain::timestamp::to_backend_string;
use crate::domain::types::{CountRecord, RecordKey, RecordRow, SensorId, StoredRecord};
use crate::infra::error::{truncate_body, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Unique constraint columns
const CONFLICT_COLUMNS: &str = "sensor_id,timestamp";

/// Postgres unique_violation
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Rows asked for per select request; servers may cap pages lower (max-rows)
pub const SELECT_PAGE_SIZE: usize = 1000;

/// Row selection shared by select, count and delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub sensor_id: Option<SensorId>,
    /// Inclusive lower bound on `timestamp`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `timestamp`
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sensor(mut self, sensor_id: SensorId) -> Self {
        self.sensor_id = Some(sensor_id);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// No row constraint at all (limit does not count)
    pub fn is_unfiltered(&self) -> bool {
        self.sensor_id.is_none() && self.since.is_none() && self.until.is_none()
    }

    pub fn matches(&self, record: &CountRecord) -> bool {
        self.sensor_id.as_ref().map_or(true, |id| *id == record.sensor_id)
            && self.since.map_or(true, |since| record.timestamp >= since)
            && self.until.map_or(true, |until| record.timestamp < until)
    }

    /// PostgREST query parameters (without select/order/limit)
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(id) = &self.sensor_id {
            query.push(("sensor_id".to_string(), format!("eq.{}", id)));
        }
        if let Some(since) = self.since {
            query.push(("timestamp".to_string(), format!("gte.{}", to_backend_string(since))));
        }
        if let Some(until) = self.until {
            query.push(("timestamp".to_string(), format!("lt.{}", to_backend_string(until))));
        }
        query
    }
}

/// Backing store for count records
#[async_trait]
pub trait CountStore: Send + Sync {
    /// Rows matching the filter, ordered by timestamp
    async fn select(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StoreError>;

    /// Insert or merge by (sensor_id, timestamp); returns rows written
    async fn upsert(&self, records: &[CountRecord]) -> Result<usize, StoreError>;

    /// Exact number of matching rows
    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError>;

    /// Delete matching rows; an unfiltered delete is refused
    async fn delete(&self, filter: &RecordFilter) -> Result<usize, StoreError>;
}

/// Error body returned by PostgREST
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a failed response to a store error
fn status_error(status: u16, body: &str) -> StoreError {
    let api_error = serde_json::from_str::<ApiError>(body).ok();
    let is_duplicate = status == 409
        || api_error.as_ref().and_then(|e| e.code.as_deref()) == Some(PG_UNIQUE_VIOLATION);

    if is_duplicate {
        let message = api_error.and_then(|e| e.message).unwrap_or_else(|| truncate_body(body));
        return StoreError::DuplicateKey(message);
    }
    StoreError::HttpStatus { status, body: truncate_body(body) }
}

/// Total from a `Content-Range` header (`0-24/3573`, `*/0`)
pub fn parse_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

/// Read pages from `fetch(offset, limit)` until one comes back empty
///
/// The next offset is the number of rows received so far, so a server that
/// returns fewer rows than asked (max-rows cap) is still read to the end.
/// Stops early once `limit` rows are collected.
pub async fn collect_pages<F, Fut>(
    page_size: usize,
    limit: Option<usize>,
    mut fetch: F,
) -> Result<Vec<StoredRecord>, StoreError>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<StoredRecord>, StoreError>>,
{
    let page_size = page_size.max(1);
    let mut rows: Vec<StoredRecord> = Vec::new();
    loop {
        let want = match limit {
            Some(limit) => page_size.min(limit.saturating_sub(rows.len())),
            None => page_size,
        };
        if want == 0 {
            break;
        }
        let page = fetch(rows.len(), want).await?;
        if page.is_empty() {
            break;
        }
        rows.extend(page);
    }
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    Ok(rows)
}

/// REST client for the hosted counts table
pub struct RestStore {
    http: reqwest::Client,
    base_url: String,
    table: String,
    api_key: String,
}

impl RestStore {
    pub fn new(
        base_url: &str,
        table: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            table: table.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn collection_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    /// Send and fail on non-2xx, returning headers and body
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<(HeaderMap, String), StoreError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &body));
        }
        Ok((headers, body))
    }

    fn decode_rows(body: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let rows: Vec<RecordRow> =
            serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))?;
        rows.into_iter().map(|row| row.into_stored().map_err(StoreError::from)).collect()
    }
}

#[async_trait]
impl CountStore for RestStore {
    async fn select(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StoreError> {
        let mut base = filter.to_query();
        base.push(("select".to_string(), "*".to_string()));
        // Total order so offsets are stable between pages
        base.push(("order".to_string(), "timestamp.asc,sensor_id.asc,id.asc".to_string()));

        let records = collect_pages(SELECT_PAGE_SIZE, filter.limit, |offset, limit| {
            let mut query = base.clone();
            query.push(("offset".to_string(), offset.to_string()));
            query.push(("limit".to_string(), limit.to_string()));
            let request = self.http.get(self.collection_url()).query(&query);
            async move { self.execute(request).await.and_then(|(_, body)| Self::decode_rows(&body)) }
        })
        .await?;
        debug!(rows = %records.len(), "store_select");
        Ok(records)
    }

    async fn upsert(&self, records: &[CountRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows: Vec<RecordRow> = records.iter().map(CountRecord::to_row).collect();

        let request = self
            .http
            .post(self.collection_url())
            .query(&[("on_conflict", CONFLICT_COLUMNS)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);
        self.execute(request).await?;

        debug!(rows = %rows.len(), "store_upsert");
        Ok(rows.len())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let mut query = filter.to_query();
        query.push(("select".to_string(), "id".to_string()));

        let request = self
            .http
            .head(self.collection_url())
            .query(&query)
            .header("Prefer", "count=exact");
        let (headers, _) = self.execute(request).await?;

        headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| StoreError::Decode("missing or invalid Content-Range".to_string()))
    }

    async fn delete(&self, filter: &RecordFilter) -> Result<usize, StoreError> {
        if filter.is_unfiltered() {
            return Err(StoreError::UnfilteredDelete);
        }

        let request = self
            .http
            .delete(self.collection_url())
            .query(&filter.to_query())
            .header("Prefer", "return=representation");
        let (_, body) = self.execute(request).await?;

        let deleted = Self::decode_rows(&body)?.len();
        debug!(rows = %deleted, "store_delete");
        Ok(deleted)
    }
}

/// In-process store with the table's unique key
pub struct MemoryStore {
    rows: Mutex<MemoryRows>,
}

struct MemoryRows {
    by_key: BTreeMap<RecordKey, StoredRecord>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { rows: Mutex::new(MemoryRows { by_key: BTreeMap::new(), next_id: 1 }) }
    }

    /// Plain insert (no merge): fails on an existing key like the backend does
    pub fn insert(&self, stored: StoredRecord) -> Result<i64, StoreError> {
        let mut rows = self.rows.lock();
        let key = stored.record.key();
        if rows.by_key.contains_key(&key) {
            return Err(StoreError::DuplicateKey(format!(
                "duplicate key value violates unique constraint ({}, {})",
                key.sensor_id,
                to_backend_string(key.timestamp)
            )));
        }
        let id = stored.id.unwrap_or(rows.next_id);
        rows.next_id = rows.next_id.max(id + 1);
        rows.by_key.insert(key, StoredRecord { id: Some(id), ..stored });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every row, ordered by (sensor_id, timestamp)
    pub fn all(&self) -> Vec<StoredRecord> {
        self.rows.lock().by_key.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CountStore for MemoryStore {
    async fn select(&self, filter: &RecordFilter) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = self.rows.lock();
        let mut matched: Vec<StoredRecord> =
            rows.by_key.values().filter(|s| filter.matches(&s.record)).cloned().collect();
        matched.sort_by(|a, b| a.record.timestamp.cmp(&b.record.timestamp));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn upsert(&self, records: &[CountRecord]) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut guard = self.rows.lock();
        let rows = &mut *guard;
        for record in records {
            let key = record.key();
            match rows.by_key.get_mut(&key) {
                Some(existing) => existing.record = record.clone(),
                None => {
                    let id = rows.next_id;
                    rows.next_id += 1;
                    let stored = StoredRecord {
                        id: Some(id),
                        record: record.clone(),
                        inserted_at: Some(now),
                    };
                    rows.by_key.insert(key, stored);
                }
            }
        }
        Ok(records.len())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64, StoreError> {
        let rows = self.rows.lock();
        Ok(rows.by_key.values().filter(|s| filter.matches(&s.record)).count() as u64)
    }

    async fn delete(&self, filter: &RecordFilter) -> Result<usize, StoreError> {
        if filter.is_unfiltered() {
            return Err(StoreError::UnfilteredDelete);
        }
        let mut rows = self.rows.lock();
        let before = rows.by_key.len();
        rows.by_key.retain(|_, s| !filter.matches(&s.record));
        Ok(before - rows.by_key.len())
    }
}
