use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;

use crate::auth::SessionContext;
use crate::backend::{Backend, Direction, Filter, Query, Table};
use crate::changefeed::{ChangeFeedHub, Subscription};
use crate::error::{AppError, AppResult};
use crate::models::{self, Bookmark, Id, Post, User};
use crate::storage::MediaStore;

/// Feed row: the post plus its author when the profile row resolved.
#[derive(Debug, Clone)]
pub struct PostWithAuthor {
    pub post: Post,
    pub author: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCount {
    pub tag: String,
    pub count: usize,
}

#[derive(Clone)]
pub struct PostService {
    backend: Arc<dyn Backend>,
    media: Arc<dyn MediaStore>,
    session: SessionContext,
    feed: ChangeFeedHub,
}

impl PostService {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        media: Arc<dyn MediaStore>,
        session: SessionContext,
        feed: ChangeFeedHub,
    ) -> Self {
        Self {
            backend,
            media,
            session,
            feed,
        }
    }

    /// Publish a post, uploading the image first when one is attached.
    /// Upload-then-insert is not atomic; if the row insert fails the
    /// uploaded object is removed best-effort.
    pub async fn create(&self, content: &str, image: Option<&[u8]>) -> AppResult<Post> {
        let user_id = self.session.user_id().ok_or(AppError::AuthRequired)?;
        let mut image_url = None;
        let mut stored_key = None;
        if let Some(bytes) = image {
            let stored = self.media.save(bytes).await?;
            image_url = Some(stored.url.clone());
            stored_key = Some(stored.key);
        }
        let record = json!({
            "user_id": user_id,
            "content": content,
            "image_url": image_url,
        });
        match self.backend.insert(Table::Posts, record).await {
            Ok(row) => models::decode_row("posts", row)
                .ok_or_else(|| AppError::Backend("malformed post row".into())),
            Err(e) => {
                if let Some(key) = stored_key {
                    let _ = self.media.delete(&key).await;
                }
                Err(e.into())
            }
        }
    }

    /// Remove one's own post together with its comments and relation rows.
    pub async fn delete(&self, post_id: Id) -> AppResult<()> {
        let user_id = self.session.user_id().ok_or(AppError::AuthRequired)?;
        let post = self.get(post_id).await?.ok_or(AppError::NotFound)?;
        if post.user_id != user_id {
            return Err(AppError::Forbidden);
        }
        for table in [Table::Likes, Table::Bookmarks, Table::Comments] {
            self.backend
                .delete(table, vec![Filter::eq("post_id", post_id)])
                .await?;
        }
        self.backend
            .delete(Table::Posts, vec![Filter::eq("id", post_id)])
            .await?;
        Ok(())
    }

    pub async fn get(&self, post_id: Id) -> AppResult<Option<Post>> {
        let rows = self
            .backend
            .select(
                Table::Posts,
                Query::new().filter(Filter::eq("id", post_id)).limit(1),
            )
            .await?;
        Ok(rows.into_iter().find_map(|r| models::decode_row("posts", r)))
    }

    /// Everyone's posts, newest first.
    pub async fn home_timeline(&self, limit: Option<usize>) -> AppResult<Vec<PostWithAuthor>> {
        let mut query = Query::new().order_by("created_at", Direction::Desc);
        if let Some(n) = limit {
            query = query.limit(n);
        }
        let rows = self.backend.select(Table::Posts, query).await?;
        self.with_authors(models::decode_rows("posts", rows)).await
    }

    /// Most-liked posts, highest tally first.
    pub async fn trending(&self, limit: usize) -> AppResult<Vec<PostWithAuthor>> {
        let rows = self
            .backend
            .select(
                Table::Posts,
                Query::new()
                    .order_by("likes", Direction::Desc)
                    .limit(limit),
            )
            .await?;
        self.with_authors(models::decode_rows("posts", rows)).await
    }

    pub async fn by_user(&self, user_id: Id) -> AppResult<Vec<PostWithAuthor>> {
        let rows = self
            .backend
            .select(
                Table::Posts,
                Query::new()
                    .filter(Filter::eq("user_id", user_id))
                    .order_by("created_at", Direction::Desc),
            )
            .await?;
        self.with_authors(models::decode_rows("posts", rows)).await
    }

    /// Posts the user has bookmarked, resolved through the bookmarks table.
    pub async fn bookmarked_by(&self, user_id: Id) -> AppResult<Vec<PostWithAuthor>> {
        let rows = self
            .backend
            .select(
                Table::Bookmarks,
                Query::new()
                    .filter(Filter::eq("user_id", user_id))
                    .order_by("created_at", Direction::Desc),
            )
            .await?;
        let bookmarks: Vec<Bookmark> = models::decode_rows("bookmarks", rows);
        let lookups = bookmarks.into_iter().map(|b| {
            let backend = self.backend.clone();
            async move {
                backend
                    .select(
                        Table::Posts,
                        Query::new().filter(Filter::eq("id", b.post_id)).limit(1),
                    )
                    .await
            }
        });
        let mut posts = Vec::new();
        for rows in join_all(lookups).await {
            if let Some(post) = rows?.into_iter().find_map(|r| models::decode_row("posts", r)) {
                posts.push(post);
            }
        }
        self.with_authors(posts).await
    }

    /// Hashtag tallies over the most recent `sample` posts, most used
    /// first, ties broken alphabetically.
    pub async fn trending_topics(&self, sample: usize, limit: usize) -> AppResult<Vec<TopicCount>> {
        let rows = self
            .backend
            .select(
                Table::Posts,
                Query::new()
                    .order_by("created_at", Direction::Desc)
                    .limit(sample),
            )
            .await?;
        let posts: Vec<Post> = models::decode_rows("posts", rows);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for post in &posts {
            for tag in extract_tags(&post.content) {
                *counts.entry(tag).or_default() += 1;
            }
        }
        let mut topics: Vec<TopicCount> = counts
            .into_iter()
            .map(|(tag, count)| TopicCount { tag, count })
            .collect();
        topics.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        topics.truncate(limit);
        Ok(topics)
    }

    /// Change feed over the posts table; each event should trigger a fresh
    /// timeline read.
    pub fn watch(&self) -> Subscription {
        self.feed.subscribe(Table::Posts, None)
    }

    async fn with_authors(&self, posts: Vec<Post>) -> AppResult<Vec<PostWithAuthor>> {
        let mut author_ids: Vec<Id> = posts.iter().map(|p| p.user_id).collect();
        author_ids.sort_unstable();
        author_ids.dedup();
        let lookups = author_ids.into_iter().map(|id| {
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
        let mut authors: HashMap<Id, User> = HashMap::new();
        for rows in join_all(lookups).await {
            if let Some(user) = rows?.into_iter().find_map(|r| models::decode_row::<User>("users", r)) {
                authors.insert(user.id, user);
            }
        }
        Ok(posts
            .into_iter()
            .map(|post| {
                let author = authors.get(&post.user_id).cloned();
                PostWithAuthor { post, author }
            })
            .collect())
    }
}

/// Pull `#tag` tokens out of post text: letters, digits and underscores,
/// case-folded.
fn extract_tags(content: &str) -> Vec<String> {
    content
        .split_whitespace()
        .filter_map(|word| word.strip_prefix('#'))
        .filter_map(|rest| {
            let tag: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if tag.is_empty() {
                None
            } else {
                Some(tag.to_lowercase())
            }
        })
        .collect()
}
