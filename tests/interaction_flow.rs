#![cfg(feature = "inmem-backend")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use foodie::auth::{local::LocalAuth, AuthProvider, SessionContext};
use foodie::backend::{
    inmem::InMemBackend, Backend, BackendError, BackendResult, Filter, Query, Table,
};
use foodie::changefeed::ChangeFeedHub;
use foodie::interactions::{RelationKind, RelationMirror, RelationState};
use foodie::storage::{mem::MemMediaStore, MediaStore};
use foodie::{AppError, Config, Foodie};
use serde_json::Value;
use serial_test::serial;
use uuid::Uuid;

fn test_config() -> Config {
    Config {
        api_url: String::new(),
        api_key: String::new(),
        jwt_secret: "test-secret-must-be-32-bytes-long!!".into(),
    }
}

fn client() -> Foodie {
    std::env::set_var("FOODIE_DATA_DIR", tempfile::tempdir().unwrap().path());
    Foodie::in_memory(&test_config()).unwrap()
}

/// Build a client whose backend is wrapped by `wrap`, for fault injection.
fn client_with<F>(wrap: F) -> Foodie
where
    F: FnOnce(Arc<dyn Backend>) -> Arc<dyn Backend>,
{
    std::env::set_var("FOODIE_DATA_DIR", tempfile::tempdir().unwrap().path());
    let feed = ChangeFeedHub::new();
    let session = SessionContext::new();
    let backend = wrap(Arc::new(InMemBackend::new(feed.clone())));
    let media: Arc<dyn MediaStore> = Arc::new(MemMediaStore::new());
    let auth: Arc<dyn AuthProvider> = Arc::new(LocalAuth::new(
        backend.clone(),
        session.clone(),
        test_config().jwt_secret,
    ));
    Foodie::from_parts(backend, media, auth, session, feed)
}

async fn signed_in(client: &Foodie, email: &str, username: &str) -> Uuid {
    client
        .auth()
        .sign_up(email, "hunter2-hunter2", username)
        .await
        .unwrap()
        .unwrap()
        .user_id
}

// ---------------- fault-injection wrappers ----------------

/// Delegates everything, pausing before each mutation.
struct SlowBackend {
    inner: Arc<dyn Backend>,
    delay: Duration,
}

#[async_trait]
impl Backend for SlowBackend {
    async fn select(&self, table: Table, query: Query) -> BackendResult<Vec<Value>> {
        self.inner.select(table, query).await
    }
    async fn count(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
        self.inner.count(table, filters).await
    }
    async fn insert(&self, table: Table, record: Value) -> BackendResult<Value> {
        tokio::time::sleep(self.delay).await;
        self.inner.insert(table, record).await
    }
    async fn update(&self, table: Table, filters: Vec<Filter>, patch: Value) -> BackendResult<u64> {
        self.inner.update(table, filters, patch).await
    }
    async fn delete(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(table, filters).await
    }
}

/// Relation inserts always hit the duplicate-key path.
struct ConflictingBackend {
    inner: Arc<dyn Backend>,
}

#[async_trait]
impl Backend for ConflictingBackend {
    async fn select(&self, table: Table, query: Query) -> BackendResult<Vec<Value>> {
        self.inner.select(table, query).await
    }
    async fn count(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
        self.inner.count(table, filters).await
    }
    async fn insert(&self, table: Table, record: Value) -> BackendResult<Value> {
        match table {
            Table::Likes | Table::Bookmarks | Table::Follows => Err(BackendError::Conflict),
            _ => self.inner.insert(table, record).await,
        }
    }
    async fn update(&self, table: Table, filters: Vec<Filter>, patch: Value) -> BackendResult<u64> {
        self.inner.update(table, filters, patch).await
    }
    async fn delete(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
        self.inner.delete(table, filters).await
    }
}

/// Relation mutations fail outright.
struct FailingBackend {
    inner: Arc<dyn Backend>,
}

#[async_trait]
impl Backend for FailingBackend {
    async fn select(&self, table: Table, query: Query) -> BackendResult<Vec<Value>> {
        self.inner.select(table, query).await
    }
    async fn count(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
        self.inner.count(table, filters).await
    }
    async fn insert(&self, table: Table, record: Value) -> BackendResult<Value> {
        match table {
            Table::Likes | Table::Bookmarks | Table::Follows => {
                Err(BackendError::Other("wire down".into()))
            }
            _ => self.inner.insert(table, record).await,
        }
    }
    async fn update(&self, table: Table, filters: Vec<Filter>, patch: Value) -> BackendResult<u64> {
        self.inner.update(table, filters, patch).await
    }
    async fn delete(&self, table: Table, filters: Vec<Filter>) -> BackendResult<u64> {
        self.inner.delete(table, filters).await
    }
}

// ---------------- tests ----------------

#[tokio::test]
#[serial]
async fn toggle_round_trips_to_non_member() {
    let c = client();
    signed_in(&c, "a@x.dev", "ada").await;
    let post = c.posts().create("ramen night", None).await.unwrap();

    let mirror = RelationMirror::new(RelationState::default());
    let rec = c.interactions();

    let on = rec
        .toggle(RelationKind::Like, post.id, mirror.handle())
        .await
        .unwrap();
    assert!(on);
    assert_eq!(mirror.get(), RelationState { member: true, count: 1 });

    let off = rec
        .toggle(RelationKind::Like, post.id, mirror.handle())
        .await
        .unwrap();
    assert!(!off);
    assert_eq!(mirror.get(), RelationState { member: false, count: 0 });

    let state = rec
        .load(RelationKind::Like, post.id, c.session().user_id())
        .await
        .unwrap();
    assert_eq!(state, RelationState { member: false, count: 0 });
}

#[tokio::test]
#[serial]
async fn duplicate_key_insert_coerces_to_member() {
    let c = client_with(|inner| Arc::new(ConflictingBackend { inner }));
    signed_in(&c, "a@x.dev", "ada").await;
    let post = c.posts().create("pho", None).await.unwrap();

    let mirror = RelationMirror::new(RelationState::default());
    let on = c
        .interactions()
        .toggle(RelationKind::Bookmark, post.id, mirror.handle())
        .await
        .unwrap();
    assert!(on, "conflict must coerce to MEMBER, not error");
    assert!(mirror.get().member);
}

#[tokio::test]
#[serial]
async fn failed_mutation_leaves_mirror_untouched() {
    let c = client_with(|inner| Arc::new(FailingBackend { inner }));
    signed_in(&c, "a@x.dev", "ada").await;
    let post = c.posts().create("tacos", None).await.unwrap();

    let mirror = RelationMirror::new(RelationState { member: false, count: 7 });
    let err = c
        .interactions()
        .toggle(RelationKind::Like, post.id, mirror.handle())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Backend(_)));
    assert_eq!(mirror.get(), RelationState { member: false, count: 7 });
}

#[tokio::test]
#[serial]
async fn rapid_double_toggle_serializes_per_relation() {
    let c = client_with(|inner| {
        Arc::new(SlowBackend {
            inner,
            delay: Duration::from_millis(30),
        })
    });
    signed_in(&c, "a@x.dev", "ada").await;
    let post = c.posts().create("gyoza", None).await.unwrap();

    let mirror = RelationMirror::new(RelationState::default());
    let rec = c.interactions().clone();
    let (r1, r2) = (rec.clone(), rec.clone());
    let (h1, h2) = (mirror.handle(), mirror.handle());
    let post_id = post.id;

    let t1 = tokio::spawn(async move { r1.toggle(RelationKind::Like, post_id, h1).await });
    let t2 = tokio::spawn(async move { r2.toggle(RelationKind::Like, post_id, h2).await });
    t1.await.unwrap().unwrap();
    t2.await.unwrap().unwrap();

    // one like, one unlike, in order: back where we started
    let state = rec
        .load(RelationKind::Like, post_id, c.session().user_id())
        .await
        .unwrap();
    assert_eq!(state, RelationState { member: false, count: 0 });
    assert_eq!(mirror.get(), RelationState { member: false, count: 0 });
}

#[tokio::test]
#[serial]
async fn late_result_after_view_drop_is_a_noop() {
    let c = client_with(|inner| {
        Arc::new(SlowBackend {
            inner,
            delay: Duration::from_millis(50),
        })
    });
    signed_in(&c, "a@x.dev", "ada").await;
    let post = c.posts().create("bibimbap", None).await.unwrap();

    let mirror = RelationMirror::new(RelationState::default());
    let handle = mirror.handle();
    let rec = c.interactions().clone();
    let post_id = post.id;
    let task = tokio::spawn(async move { rec.toggle(RelationKind::Like, post_id, handle).await });

    // the owning view unmounts while the mutation is outstanding
    drop(mirror);

    let on = task.await.unwrap().unwrap();
    assert!(on, "mutation itself still completes");

    // the remote row exists; nothing local was touched and nothing blew up
    let state = c
        .interactions()
        .load(RelationKind::Like, post_id, c.session().user_id())
        .await
        .unwrap();
    assert_eq!(state, RelationState { member: true, count: 1 });
}

#[tokio::test]
#[serial]
async fn follow_toggle_and_self_follow_guard() {
    let c = client();
    let ada = signed_in(&c, "a@x.dev", "ada").await;

    // following someone else works and counts
    let other = Uuid::new_v4();
    c.backend()
        .insert(
            Table::Users,
            serde_json::json!({"id": other, "username": "grace"}),
        )
        .await
        .unwrap();

    let mirror = RelationMirror::new(RelationState::default());
    let on = c
        .interactions()
        .toggle(RelationKind::Follow, other, mirror.handle())
        .await
        .unwrap();
    assert!(on);
    assert_eq!(
        c.backend()
            .count(Table::Follows, vec![Filter::eq("followed_id", other)])
            .await
            .unwrap(),
        1
    );

    // following yourself is rejected before any mutation
    let err = c
        .interactions()
        .toggle(RelationKind::Follow, ada, mirror.handle())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));
}

// Toggling requires a session.
#[tokio::test]
#[serial]
async fn toggle_without_session_is_auth_required() {
    let c = client();
    let mirror = RelationMirror::new(RelationState::default());
    let err = c
        .interactions()
        .toggle(RelationKind::Like, Uuid::new_v4(), mirror.handle())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AuthRequired));
}
