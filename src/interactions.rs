use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::auth::SessionContext;
use crate::backend::{Backend, Filter, Query, Table};
use crate::error::{AppError, AppResult};
use crate::models::Id;

/// The three membership relations a viewer can toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    Like,
    Bookmark,
    Follow,
}

impl RelationKind {
    pub fn table(&self) -> Table {
        match self {
            RelationKind::Like => Table::Likes,
            RelationKind::Bookmark => Table::Bookmarks,
            RelationKind::Follow => Table::Follows,
        }
    }

    /// Column naming the entity the relation is about.
    pub fn subject_column(&self) -> &'static str {
        match self {
            RelationKind::Like | RelationKind::Bookmark => "post_id",
            RelationKind::Follow => "followed_id",
        }
    }

    /// Column naming the acting viewer.
    pub fn actor_column(&self) -> &'static str {
        match self {
            RelationKind::Like | RelationKind::Bookmark => "user_id",
            RelationKind::Follow => "follower_id",
        }
    }
}

/// Membership plus the mirrored tally shown next to the button.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationState {
    pub member: bool,
    pub count: u64,
}

/// View-held optimistic mirror. The owning view keeps the mirror alive;
/// in-flight mutations hold only a [`MirrorRef`], so a result landing
/// after the view is gone is discarded without touching anything.
#[derive(Clone)]
pub struct RelationMirror {
    state: Arc<RwLock<RelationState>>,
}

impl RelationMirror {
    pub fn new(initial: RelationState) -> Self {
        Self {
            state: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self) -> RelationState {
        *self.state.read().unwrap()
    }

    /// Weak handle for in-flight mutations. Does not extend the mirror's
    /// lifetime.
    pub fn handle(&self) -> MirrorRef {
        MirrorRef {
            state: Arc::downgrade(&self.state),
        }
    }
}

#[derive(Clone)]
pub struct MirrorRef {
    state: Weak<RwLock<RelationState>>,
}

type FlightKey = (RelationKind, Id, Id);

/// Reads and toggles relation membership against the remote store, keeping
/// a view's [`RelationMirror`] in sync.
///
/// Toggles on the same (relation, subject, viewer) serialize through a
/// single-flight lock so a rapid double-toggle issues strictly ordered
/// mutations and lands back where it started.
#[derive(Clone)]
pub struct Reconciler {
    backend: Arc<dyn Backend>,
    session: SessionContext,
    flights: Arc<DashMap<FlightKey, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub(crate) fn new(backend: Arc<dyn Backend>, session: SessionContext) -> Self {
        Self {
            backend,
            session,
            flights: Arc::new(DashMap::new()),
        }
    }

    async fn membership(&self, kind: RelationKind, subject: Id, actor: Id) -> AppResult<bool> {
        let rows = self
            .backend
            .select(
                kind.table(),
                Query::new()
                    .filter(Filter::eq(kind.subject_column(), subject))
                    .filter(Filter::eq(kind.actor_column(), actor))
                    .limit(1),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Current membership and exact count for a subject, as seen by
    /// `viewer`. This is the refetch path; between refetches the mirror is
    /// maintained by ±1 adjustments.
    pub async fn load(
        &self,
        kind: RelationKind,
        subject: Id,
        viewer: Option<Id>,
    ) -> AppResult<RelationState> {
        let count = self
            .backend
            .count(kind.table(), vec![Filter::eq(kind.subject_column(), subject)])
            .await?;
        let member = match viewer {
            Some(actor) => self.membership(kind, subject, actor).await?,
            None => false,
        };
        Ok(RelationState { member, count })
    }

    /// Flip membership for the signed-in viewer and return the resulting
    /// state. NON_MEMBER inserts, MEMBER deletes; a duplicate-key conflict
    /// on insert is the already-satisfied state, not an error. On success
    /// the mirror flips and its count moves ±1; on failure it is untouched.
    pub async fn toggle(
        &self,
        kind: RelationKind,
        subject: Id,
        mirror: MirrorRef,
    ) -> AppResult<bool> {
        let actor = self.session.user_id().ok_or(AppError::AuthRequired)?;
        if kind == RelationKind::Follow && subject == actor {
            return Err(AppError::Forbidden);
        }

        let lock = self
            .flights
            .entry((kind, subject, actor))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // The remote row is the authority; the mirror may be stale.
        let now_member = if self.membership(kind, subject, actor).await? {
            self.backend
                .delete(
                    kind.table(),
                    vec![
                        Filter::eq(kind.subject_column(), subject),
                        Filter::eq(kind.actor_column(), actor),
                    ],
                )
                .await?;
            false
        } else {
            let mut record = serde_json::Map::new();
            record.insert(kind.subject_column().to_string(), json!(subject));
            record.insert(kind.actor_column().to_string(), json!(actor));
            match self.backend.insert(kind.table(), Value::Object(record)).await {
                Ok(_) => true,
                Err(crate::backend::BackendError::Conflict) => {
                    tracing::debug!(?kind, %subject, "duplicate membership insert coerced");
                    true
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(state) = mirror.state.upgrade() {
            let mut s = state.write().unwrap();
            if s.member != now_member {
                s.member = now_member;
                s.count = if now_member {
                    s.count + 1
                } else {
                    s.count.saturating_sub(1)
                };
            }
        }
        Ok(now_member)
    }
}
