use std::fmt;

use serde::Serialize;
use serde_json::Value;

use async_trait::async_trait;

/// The six tables exposed by the hosted platform's row API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Users,
    Posts,
    Comments,
    Likes,
    Bookmarks,
    Follows,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Users,
        Table::Posts,
        Table::Comments,
        Table::Likes,
        Table::Bookmarks,
        Table::Follows,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Posts => "posts",
            Table::Comments => "comments",
            Table::Likes => "likes",
            Table::Bookmarks => "bookmarks",
            Table::Follows => "follows",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row predicate understood by every backend.
#[derive(Debug, Clone)]
pub enum Filter {
    Eq(&'static str, Value),
    Neq(&'static str, Value),
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Serialize) -> Self {
        Filter::Eq(column, serde_json::to_value(value).unwrap_or(Value::Null))
    }

    pub fn neq(column: &'static str, value: impl Serialize) -> Self {
        Filter::Neq(column, serde_json::to_value(value).unwrap_or(Value::Null))
    }

    pub fn column(&self) -> &'static str {
        match self {
            Filter::Eq(c, _) | Filter::Neq(c, _) => c,
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(col, v) => row.get(*col).unwrap_or(&Value::Null) == v,
            Filter::Neq(col, v) => row.get(*col).unwrap_or(&Value::Null) != v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub column: &'static str,
    pub direction: Direction,
}

/// Read shape: filters, optional ordering, optional row cap.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    pub fn order_by(mut self, column: &'static str, direction: Direction) -> Self {
        self.order = Some(Order { column, direction });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("conflict")]
    Conflict,
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("backend: {0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Row-level CRUD surface of the hosted platform.
///
/// `select` never fails for "no rows"; it returns an empty vec. `insert`
/// surfaces duplicate-key violations as [`BackendError::Conflict`] so callers
/// can coerce them to the already-satisfied state.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn select(&self, table: Table, query: Query) -> BackendResult<Vec<Value>>;
    async fn count(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64>;
    async fn insert(&self, table: Table, record: Value) -> BackendResult<Value>;
    async fn update(&self, table: Table, filters: Vec<Filter>, patch: Value) -> BackendResult<u64>;
    async fn delete(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64>;
}

#[cfg(feature = "inmem-backend")]
pub mod inmem {
    use super::*;
    use crate::changefeed::{ChangeEvent, ChangeFeedHub, EventKind};
    use serde::{Deserialize, Serialize};
    use std::cmp::Ordering;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};
    use uuid::Uuid;

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        tables: HashMap<String, Vec<Value>>,
    }

    impl State {
        fn rows(&self, table: Table) -> &[Value] {
            self.tables
                .get(table.name())
                .map(Vec::as_slice)
                .unwrap_or_default()
        }

        fn rows_mut(&mut self, table: Table) -> &mut Vec<Value> {
            self.tables.entry(table.name().to_string()).or_default()
        }
    }

    /// Local stand-in for the hosted platform: in-memory tables with a JSON
    /// snapshot on disk, unique-pair enforcement, the `posts.likes` tally
    /// trigger, and change-event publication on every mutation.
    #[derive(Clone)]
    pub struct InMemBackend {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
        feed: ChangeFeedHub,
    }

    impl InMemBackend {
        fn data_dir() -> PathBuf {
            std::env::var("FOODIE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("FOODIE_DATA_DIR").is_ok() {
                let mut p = Self::data_dir();
                p.push("state.json");
                p
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        tracing::info!(path = %path.display(), "loaded snapshot");
                        s
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to parse snapshot, starting empty");
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write snapshot");
                }
            }
        }

        pub fn new(feed: ChangeFeedHub) -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
                feed,
            }
        }

        /// Uniqueness discipline the platform enforces with unique indexes.
        fn unique_columns(table: Table) -> Option<&'static [&'static str]> {
            match table {
                Table::Users => Some(&["username"]),
                Table::Likes | Table::Bookmarks => Some(&["post_id", "user_id"]),
                Table::Follows => Some(&["follower_id", "followed_id"]),
                Table::Posts | Table::Comments => None,
            }
        }

        fn duplicate_of(state: &State, table: Table, record: &Value) -> bool {
            let Some(cols) = Self::unique_columns(table) else {
                return false;
            };
            state.rows(table).iter().any(|row| {
                cols.iter().all(|c| {
                    row.get(*c).unwrap_or(&Value::Null) == record.get(*c).unwrap_or(&Value::Null)
                })
            })
        }

        /// Mirror of the platform trigger that keeps `posts.likes` current.
        fn retally_likes(state: &mut State, post_id: &Value, events: &mut Vec<ChangeEvent>) {
            let tally = state
                .rows(Table::Likes)
                .iter()
                .filter(|l| l.get("post_id").unwrap_or(&Value::Null) == post_id)
                .count() as i64;
            for row in state.rows_mut(Table::Posts).iter_mut() {
                if row.get("id").unwrap_or(&Value::Null) == post_id {
                    if let Some(obj) = row.as_object_mut() {
                        obj.insert("likes".into(), Value::from(tally));
                    }
                    events.push(ChangeEvent {
                        table: Table::Posts,
                        kind: EventKind::Update,
                        row: row.clone(),
                    });
                }
            }
        }

        fn publish_all(&self, events: Vec<ChangeEvent>) {
            for ev in events {
                self.feed.publish(ev);
            }
        }
    }

    fn cmp_json(a: &Value, b: &Value) -> Ordering {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            // RFC 3339 timestamps order lexicographically.
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => Ordering::Equal,
        }
    }

    #[async_trait]
    impl Backend for InMemBackend {
        async fn select(&self, table: Table, query: Query) -> BackendResult<Vec<Value>> {
            let s = self.state.read().unwrap();
            let mut rows: Vec<Value> = s
                .rows(table)
                .iter()
                .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                .cloned()
                .collect();
            if let Some(order) = &query.order {
                rows.sort_by(|a, b| {
                    let ord = cmp_json(
                        a.get(order.column).unwrap_or(&Value::Null),
                        b.get(order.column).unwrap_or(&Value::Null),
                    );
                    match order.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    }
                });
            }
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
            Ok(rows)
        }

        async fn count(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
            let s = self.state.read().unwrap();
            Ok(s.rows(table)
                .iter()
                .filter(|row| filters.iter().all(|f| f.matches(row)))
                .count() as u64)
        }

        async fn insert(&self, table: Table, record: Value) -> BackendResult<Value> {
            let mut record = record;
            let obj = record
                .as_object_mut()
                .ok_or_else(|| BackendError::Other("record must be a JSON object".into()))?;
            if !obj.contains_key("id") {
                obj.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }
            if !obj.contains_key("created_at") {
                obj.insert(
                    "created_at".into(),
                    Value::String(chrono::Utc::now().to_rfc3339()),
                );
            }
            if table == Table::Posts && !obj.contains_key("likes") {
                obj.insert("likes".into(), Value::from(0));
            }

            let mut events = Vec::new();
            {
                let mut s = self.state.write().unwrap();
                if Self::duplicate_of(&s, table, &record) {
                    return Err(BackendError::Conflict);
                }
                s.rows_mut(table).push(record.clone());
                events.push(ChangeEvent {
                    table,
                    kind: EventKind::Insert,
                    row: record.clone(),
                });
                if table == Table::Likes {
                    if let Some(post_id) = record.get("post_id").cloned() {
                        Self::retally_likes(&mut s, &post_id, &mut events);
                    }
                }
            }
            self.persist();
            self.publish_all(events);
            Ok(record)
        }

        async fn update(&self, table: Table, filters: Vec<Filter>, patch: Value) -> BackendResult<u64> {
            let patch_obj = patch
                .as_object()
                .ok_or_else(|| BackendError::Other("patch must be a JSON object".into()))?
                .clone();
            let mut events = Vec::new();
            let affected;
            {
                let mut s = self.state.write().unwrap();
                let mut n = 0u64;
                for row in s.rows_mut(table).iter_mut() {
                    if filters.iter().all(|f| f.matches(row)) {
                        if let Some(obj) = row.as_object_mut() {
                            for (k, v) in &patch_obj {
                                obj.insert(k.clone(), v.clone());
                            }
                        }
                        n += 1;
                        events.push(ChangeEvent {
                            table,
                            kind: EventKind::Update,
                            row: row.clone(),
                        });
                    }
                }
                affected = n;
            }
            self.persist();
            self.publish_all(events);
            Ok(affected)
        }

        async fn delete(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
            let mut events = Vec::new();
            let affected;
            {
                let mut s = self.state.write().unwrap();
                let rows = s.rows_mut(table);
                let mut removed = Vec::new();
                rows.retain(|row| {
                    if filters.iter().all(|f| f.matches(row)) {
                        removed.push(row.clone());
                        false
                    } else {
                        true
                    }
                });
                affected = removed.len() as u64;
                for row in removed {
                    if table == Table::Likes {
                        if let Some(post_id) = row.get("post_id").cloned() {
                            Self::retally_likes(&mut s, &post_id, &mut events);
                        }
                    }
                    events.push(ChangeEvent {
                        table,
                        kind: EventKind::Delete,
                        row,
                    });
                }
            }
            self.persist();
            self.publish_all(events);
            Ok(affected)
        }
    }
}

// REST implementation against the platform's row API (feature = "rest-backend")
#[cfg(feature = "rest-backend")]
pub mod rest {
    use super::*;
    use crate::auth::SessionContext;
    use crate::config::Config;
    use std::time::Duration;

    /// PostgREST-style row API client. Filters render as `?col=eq.value`
    /// pairs; mutations ask for `return=representation` so callers get the
    /// stored row back.
    #[derive(Clone)]
    pub struct RestBackend {
        http: reqwest::Client,
        base: String,
        api_key: String,
        session: SessionContext,
    }

    impl RestBackend {
        pub fn new(config: &Config, session: SessionContext) -> BackendResult<Self> {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| BackendError::Other(e.to_string()))?;
            Ok(Self {
                http,
                base: config.api_url.trim_end_matches('/').to_string(),
                api_key: config.api_key.clone(),
                session,
            })
        }

        fn url(&self, table: Table, query_string: &str) -> String {
            if query_string.is_empty() {
                format!("{}/rest/v1/{}", self.base, table)
            } else {
                format!("{}/rest/v1/{}?{}", self.base, table, query_string)
            }
        }

        fn bearer(&self) -> String {
            // The anon key doubles as the bearer until someone signs in.
            self.session
                .access_token()
                .unwrap_or_else(|| self.api_key.clone())
        }

        fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
            self.http
                .request(method, url)
                .header("apikey", &self.api_key)
                .bearer_auth(self.bearer())
        }

        async fn map_failure(resp: reqwest::Response) -> BackendError {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::CONFLICT || body.contains("\"23505\"") {
                return BackendError::Conflict;
            }
            match status.as_u16() {
                401 | 403 => BackendError::Unauthorized,
                404 => BackendError::NotFound,
                _ => BackendError::Other(format!("{status}: {body}")),
            }
        }
    }

    fn filter_pair(f: &Filter) -> String {
        let (op, col, v) = match f {
            Filter::Eq(c, v) => ("eq", c, v),
            Filter::Neq(c, v) => ("neq", c, v),
        };
        let text = match v {
            Value::String(s) => s.clone(),
            Value::Null => "null".to_string(),
            other => other.to_string(),
        };
        let op = if matches!(v, Value::Null) {
            match op {
                "eq" => "is",
                _ => "not.is",
            }
        } else {
            op
        };
        format!("{}={}.{}", col, op, urlencoding::encode(&text))
    }

    fn query_string(filters: &[Filter], order: Option<&Order>, limit: Option<usize>) -> String {
        let mut parts: Vec<String> = filters.iter().map(filter_pair).collect();
        if let Some(order) = order {
            let dir = match order.direction {
                Direction::Asc => "asc",
                Direction::Desc => "desc",
            };
            parts.push(format!("order={}.{}", order.column, dir));
        }
        if let Some(limit) = limit {
            parts.push(format!("limit={limit}"));
        }
        parts.join("&")
    }

    #[async_trait]
    impl Backend for RestBackend {
        async fn select(&self, table: Table, query: Query) -> BackendResult<Vec<Value>> {
            let qs = query_string(&query.filters, query.order.as_ref(), query.limit);
            let resp = self
                .request(reqwest::Method::GET, self.url(table, &qs))
                .send()
                .await
                .map_err(|e| BackendError::Other(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Self::map_failure(resp).await);
            }
            resp.json::<Vec<Value>>()
                .await
                .map_err(|e| BackendError::Other(e.to_string()))
        }

        async fn count(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
            let mut qs = query_string(&filters, None, Some(1));
            qs.push_str("&select=id");
            let resp = self
                .request(reqwest::Method::GET, self.url(table, &qs))
                .header("Prefer", "count=exact")
                .send()
                .await
                .map_err(|e| BackendError::Other(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Self::map_failure(resp).await);
            }
            // Content-Range: "0-0/42" (or "*/0" when empty)
            let total = resp
                .headers()
                .get("content-range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| BackendError::Other("missing count in content-range".into()))?;
            Ok(total)
        }

        async fn insert(&self, table: Table, record: Value) -> BackendResult<Value> {
            let resp = self
                .request(reqwest::Method::POST, self.url(table, ""))
                .header("Prefer", "return=representation")
                .json(&record)
                .send()
                .await
                .map_err(|e| BackendError::Other(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Self::map_failure(resp).await);
            }
            let body: Value = resp
                .json()
                .await
                .map_err(|e| BackendError::Other(e.to_string()))?;
            match body {
                Value::Array(mut rows) if !rows.is_empty() => Ok(rows.remove(0)),
                Value::Object(_) => Ok(body),
                _ => Err(BackendError::Other("empty insert representation".into())),
            }
        }

        async fn update(&self, table: Table, filters: Vec<Filter>, patch: Value) -> BackendResult<u64> {
            let qs = query_string(&filters, None, None);
            let resp = self
                .request(reqwest::Method::PATCH, self.url(table, &qs))
                .header("Prefer", "return=representation")
                .json(&patch)
                .send()
                .await
                .map_err(|e| BackendError::Other(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Self::map_failure(resp).await);
            }
            let rows: Vec<Value> = resp.json().await.unwrap_or_default();
            Ok(rows.len() as u64)
        }

        async fn delete(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
            let qs = query_string(&filters, None, None);
            let resp = self
                .request(reqwest::Method::DELETE, self.url(table, &qs))
                .header("Prefer", "return=representation")
                .send()
                .await
                .map_err(|e| BackendError::Other(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Self::map_failure(resp).await);
            }
            let rows: Vec<Value> = resp.json().await.unwrap_or_default();
            Ok(rows.len() as u64)
        }
    }
}
