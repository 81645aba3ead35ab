use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;

use crate::auth::SessionContext;
use crate::backend::{Backend, Direction, Filter, Query, Table};
use crate::changefeed::{ChangeFeedHub, Subscription};
use crate::error::{AppError, AppResult};
use crate::models::{self, Comment, Id, NewComment, User};

/// One top-level comment and its direct replies, both in creation order.
#[derive(Debug, Clone)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<Comment>,
}

/// Nest a flat, creation-time-ascending comment list into a two-level
/// forest. Replies whose parent is itself a reply attach to that reply's
/// top-level ancestor; a parent reference that matches nothing in the list
/// is skipped.
pub fn build_comment_tree(flat: Vec<Comment>) -> Vec<CommentNode> {
    let mut roots: Vec<CommentNode> = Vec::new();
    // comment id -> index of the root it hangs under
    let mut root_of: HashMap<Id, usize> = HashMap::new();
    for comment in flat {
        match comment.parent_id {
            None => {
                root_of.insert(comment.id, roots.len());
                roots.push(CommentNode {
                    comment,
                    replies: Vec::new(),
                });
            }
            Some(parent_id) => match root_of.get(&parent_id).copied() {
                Some(idx) => {
                    root_of.insert(comment.id, idx);
                    roots[idx].replies.push(comment);
                }
                None => {
                    tracing::warn!(comment = %comment.id, parent = %parent_id, "orphaned comment parent, skipping");
                }
            },
        }
    }
    roots
}

/// A post's threaded comments plus an author index for rendering.
#[derive(Debug, Clone)]
pub struct CommentThread {
    pub nodes: Vec<CommentNode>,
    pub authors: HashMap<Id, User>,
}

#[derive(Clone)]
pub struct CommentService {
    backend: Arc<dyn Backend>,
    session: SessionContext,
    feed: ChangeFeedHub,
}

impl CommentService {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        session: SessionContext,
        feed: ChangeFeedHub,
    ) -> Self {
        Self {
            backend,
            session,
            feed,
        }
    }

    pub async fn list(&self, post_id: Id) -> AppResult<CommentThread> {
        let rows = self
            .backend
            .select(
                Table::Comments,
                Query::new()
                    .filter(Filter::eq("post_id", post_id))
                    .order_by("created_at", Direction::Asc),
            )
            .await?;
        let comments: Vec<Comment> = models::decode_rows("comments", rows);

        let mut author_ids: Vec<Id> = comments.iter().map(|c| c.user_id).collect();
        author_ids.sort_unstable();
        author_ids.dedup();
        let authors = self.fetch_authors(author_ids).await?;

        Ok(CommentThread {
            nodes: build_comment_tree(comments),
            authors,
        })
    }

    async fn fetch_authors(&self, ids: Vec<Id>) -> AppResult<HashMap<Id, User>> {
        let lookups = ids.into_iter().map(|id| {
            let backend = self.backend.clone();
            async move {
                backend
                    .select(
                        Table::Users,
                        Query::new().filter(Filter::eq("id", id)).limit(1),
                    )
                    .await
            }
        });
        let mut authors = HashMap::new();
        for rows in join_all(lookups).await {
            if let Some(user) = rows?.into_iter().find_map(|r| models::decode_row::<User>("users", r)) {
                authors.insert(user.id, user);
            }
        }
        Ok(authors)
    }

    /// Post a comment or reply. A reply's parent must be a comment on the
    /// same post; anything else reads as "no such parent here".
    pub async fn create(&self, new: NewComment) -> AppResult<Comment> {
        let user_id = self.session.user_id().ok_or(AppError::AuthRequired)?;
        if let Some(parent_id) = new.parent_id {
            let rows = self
                .backend
                .select(
                    Table::Comments,
                    Query::new().filter(Filter::eq("id", parent_id)).limit(1),
                )
                .await?;
            let parent: Comment = rows
                .into_iter()
                .find_map(|r| models::decode_row("comments", r))
                .ok_or(AppError::NotFound)?;
            if parent.post_id != new.post_id {
                return Err(AppError::NotFound);
            }
        }
        let row = self
            .backend
            .insert(
                Table::Comments,
                json!({
                    "post_id": new.post_id,
                    "user_id": user_id,
                    "content": new.content,
                    "parent_id": new.parent_id,
                }),
            )
            .await?;
        models::decode_row("comments", row).ok_or_else(|| AppError::Backend("malformed comment row".into()))
    }

    /// Remove one's own comment (and, transitively, its replies).
    pub async fn delete(&self, comment_id: Id) -> AppResult<()> {
        let user_id = self.session.user_id().ok_or(AppError::AuthRequired)?;
        let rows = self
            .backend
            .select(
                Table::Comments,
                Query::new().filter(Filter::eq("id", comment_id)).limit(1),
            )
            .await?;
        let comment: Comment = rows
            .into_iter()
            .find_map(|r| models::decode_row("comments", r))
            .ok_or(AppError::NotFound)?;
        if comment.user_id != user_id {
            return Err(AppError::Forbidden);
        }
        self.backend
            .delete(Table::Comments, vec![Filter::eq("parent_id", comment_id)])
            .await?;
        self.backend
            .delete(Table::Comments, vec![Filter::eq("id", comment_id)])
            .await?;
        Ok(())
    }

    /// Change feed for one post's comments; each event should trigger a
    /// fresh `list`.
    pub fn watch(&self, post_id: Id) -> Subscription {
        self.feed
            .subscribe(Table::Comments, Some(Filter::eq("post_id", post_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn comment(id: Id, parent_id: Option<Id>, offset_secs: i64) -> Comment {
        Comment {
            id,
            post_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            content: "c".into(),
            parent_id,
            created_at: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn roots_and_replies_keep_creation_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let tree = build_comment_tree(vec![
            comment(a, None, 0),
            comment(b, Some(a), 1),
            comment(c, None, 2),
        ]);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].comment.id, a);
        assert_eq!(tree[0].replies.len(), 1);
        assert_eq!(tree[0].replies[0].id, b);
        assert_eq!(tree[1].comment.id, c);
        assert!(tree[1].replies.is_empty());
    }

    #[test]
    fn reply_to_reply_attaches_to_top_level_ancestor() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let tree = build_comment_tree(vec![
            comment(a, None, 0),
            comment(b, Some(a), 1),
            comment(c, Some(b), 2),
        ]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].replies.len(), 2);
        assert_eq!(tree[0].replies[1].id, c);
    }

    #[test]
    fn unknown_parent_is_skipped() {
        let a = Uuid::new_v4();
        let tree = build_comment_tree(vec![
            comment(a, None, 0),
            comment(Uuid::new_v4(), Some(Uuid::new_v4()), 1),
        ]);
        assert_eq!(tree.len(), 1);
        assert!(tree[0].replies.is_empty());
    }
}
