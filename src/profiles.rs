use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::try_join;
use serde_json::{json, Value};

use crate::auth::SessionContext;
use crate::backend::{Backend, Filter, Query, Table};
use crate::error::{AppError, AppResult};
use crate::models::{self, Follow, Id, ProfilePatch, User};
use crate::storage::MediaStore;

/// A user page: the profile row, the two follow tallies, and whether the
/// signed-in viewer already follows them.
#[derive(Debug, Clone)]
pub struct Profile {
    pub user: User,
    pub follower_count: u64,
    pub following_count: u64,
    pub viewer_follows: bool,
}

#[derive(Clone)]
pub struct ProfileService {
    backend: Arc<dyn Backend>,
    media: Arc<dyn MediaStore>,
    session: SessionContext,
}

impl ProfileService {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        media: Arc<dyn MediaStore>,
        session: SessionContext,
    ) -> Self {
        Self {
            backend,
            media,
            session,
        }
    }

    pub async fn by_username(&self, username: &str) -> AppResult<Profile> {
        let rows = self
            .backend
            .select(
                Table::Users,
                Query::new().filter(Filter::eq("username", username)).limit(1),
            )
            .await?;
        let user: User = rows
            .into_iter()
            .find_map(|r| models::decode_row("users", r))
            .ok_or(AppError::NotFound)?;
        self.assemble(user).await
    }

    pub async fn by_id(&self, user_id: Id) -> AppResult<Profile> {
        let rows = self
            .backend
            .select(
                Table::Users,
                Query::new().filter(Filter::eq("id", user_id)).limit(1),
            )
            .await?;
        let user: User = rows
            .into_iter()
            .find_map(|r| models::decode_row("users", r))
            .ok_or(AppError::NotFound)?;
        self.assemble(user).await
    }

    /// The signed-in user's own profile.
    pub async fn me(&self) -> AppResult<Profile> {
        let user_id = self.session.user_id().ok_or(AppError::AuthRequired)?;
        self.by_id(user_id).await
    }

    async fn assemble(&self, user: User) -> AppResult<Profile> {
        let followers = self
            .backend
            .count(Table::Follows, vec![Filter::eq("followed_id", user.id)]);
        let following = self
            .backend
            .count(Table::Follows, vec![Filter::eq("follower_id", user.id)]);
        let (follower_count, following_count) = try_join(followers, following).await?;

        let viewer_follows = match self.session.user_id() {
            Some(viewer) if viewer != user.id => {
                let rows = self
                    .backend
                    .select(
                        Table::Follows,
                        Query::new()
                            .filter(Filter::eq("follower_id", viewer))
                            .filter(Filter::eq("followed_id", user.id))
                            .limit(1),
                    )
                    .await?;
                !rows.is_empty()
            }
            _ => false,
        };

        Ok(Profile {
            user,
            follower_count,
            following_count,
            viewer_follows,
        })
    }

    /// Update one's own profile row; a new avatar goes through the media
    /// store and its public URL lands on the row.
    pub async fn update(&self, patch: ProfilePatch, avatar: Option<&[u8]>) -> AppResult<User> {
        let user_id = self.session.user_id().ok_or(AppError::AuthRequired)?;
        let mut fields = serde_json::Map::new();
        if let Some(full_name) = patch.full_name {
            fields.insert("full_name".into(), Value::String(full_name));
        }
        if let Some(bio) = patch.bio {
            fields.insert("bio".into(), Value::String(bio));
        }
        if let Some(bytes) = avatar {
            let stored = self.media.save(bytes).await?;
            fields.insert("avatar_url".into(), Value::String(stored.url));
        }
        if !fields.is_empty() {
            let affected = self
                .backend
                .update(
                    Table::Users,
                    vec![Filter::eq("id", user_id)],
                    Value::Object(fields),
                )
                .await?;
            if affected == 0 {
                return Err(AppError::NotFound);
            }
        }
        let rows = self
            .backend
            .select(
                Table::Users,
                Query::new().filter(Filter::eq("id", user_id)).limit(1),
            )
            .await?;
        rows.into_iter()
            .find_map(|r| models::decode_row("users", r))
            .ok_or(AppError::NotFound)
    }

    /// People-you-might-know: other users the viewer does not follow yet.
    pub async fn suggested(&self, limit: usize) -> AppResult<Vec<User>> {
        let viewer = self.session.user_id().ok_or(AppError::AuthRequired)?;
        let follow_rows = self
            .backend
            .select(
                Table::Follows,
                Query::new().filter(Filter::eq("follower_id", viewer)),
            )
            .await?;
        let followed: HashSet<Id> = models::decode_rows::<Follow>("follows", follow_rows)
            .into_iter()
            .map(|f| f.followed_id)
            .collect();

        let rows = self
            .backend
            .select(
                Table::Users,
                Query::new().filter(Filter::neq("id", viewer)),
            )
            .await?;
        let mut users: Vec<User> = models::decode_rows("users", rows)
            .into_iter()
            .filter(|u: &User| !followed.contains(&u.id))
            .collect();
        users.truncate(limit);
        Ok(users)
    }

    /// Make sure a profile row exists for the signed-in user, creating it
    /// from session metadata on first sign-in.
    pub async fn ensure_profile(&self) -> AppResult<User> {
        let session = self.session.current().ok_or(AppError::AuthRequired)?;
        let rows = self
            .backend
            .select(
                Table::Users,
                Query::new().filter(Filter::eq("id", session.user_id)).limit(1),
            )
            .await?;
        if let Some(user) = rows.into_iter().find_map(|r| models::decode_row("users", r)) {
            return Ok(user);
        }
        let username = session
            .metadata
            .username
            .clone()
            .unwrap_or_else(|| session.user_id.to_string());
        let row = self
            .backend
            .insert(
                Table::Users,
                json!({
                    "id": session.user_id,
                    "username": username,
                    "full_name": session.metadata.full_name,
                    "avatar_url": session.metadata.avatar_url,
                }),
            )
            .await?;
        models::decode_row("users", row).ok_or_else(|| AppError::Backend("malformed user row".into()))
    }
}
