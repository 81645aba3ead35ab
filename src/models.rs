use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// Row ids are platform-assigned UUIDs.
pub type Id = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Id,
    pub user_id: Id,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    // Denormalized like tally maintained by the platform; read-only here.
    #[serde(default)]
    pub likes: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Id,
    pub post_id: Id,
    pub user_id: Id,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<Id>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewComment {
    pub post_id: Id,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Like {
    pub id: Id,
    pub post_id: Id,
    pub user_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: Id,
    pub post_id: Id,
    pub user_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follow {
    pub id: Id,
    pub follower_id: Id,
    pub followed_id: Id,
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

/// Decode a single remote row against the entity schema. Remote records are
/// dynamic JSON and may be partially populated; a row missing required
/// fields is dropped with a warning rather than failing the whole read.
pub(crate) fn decode_row<T: DeserializeOwned>(table: &str, row: Value) -> Option<T> {
    match serde_json::from_value(row) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(table, error = %e, "skipping malformed row");
            None
        }
    }
}

pub(crate) fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|r| decode_row(table, r))
        .collect()
}
