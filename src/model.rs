//! Normalized entities persisted by the [`EntityStore`](crate::store::EntityStore).
//!
//! Every struct serializes to the document shape the view pipeline operates
//! on: camelCase field names, `_id` for the primary key, ids as hyphenated
//! UUID strings and timestamps as RFC 3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// A file held by the blob storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub url: String,
    pub storage_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub avatar: Option<MediaAsset>,
    /// Set semantics on insert; insertion order is kept.
    #[serde(default)]
    pub watch_history: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub video_file: MediaAsset,
    pub thumbnail: MediaAsset,
    pub duration: f64,
    pub views: i64,
    pub is_published: bool,
    pub owner: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub content: String,
    pub video: Uuid,
    pub owner: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tweet {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub content: String,
    pub owner: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a like points at. Serialized flattened, so a video like carries a
/// `video` field and nothing for `comment`/`tweet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikeSubject {
    Video(Uuid),
    Comment(Uuid),
    Tweet(Uuid),
}

impl LikeSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            LikeSubject::Video(_) => "video",
            LikeSubject::Comment(_) => "comment",
            LikeSubject::Tweet(_) => "tweet",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            LikeSubject::Video(id) | LikeSubject::Comment(id) | LikeSubject::Tweet(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "video" => Some(LikeSubject::Video(id)),
            "comment" => Some(LikeSubject::Comment(id)),
            "tweet" => Some(LikeSubject::Tweet(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Like {
    #[serde(rename = "_id")]
    pub id: Uuid,
    #[serde(flatten)]
    pub subject: LikeSubject,
    pub liked_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub subscriber: Uuid,
    pub channel: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub owner: Uuid,
    /// Set semantics on add; insertion order is kept.
    #[serde(default)]
    pub videos: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validates a caller-supplied id before any store access.
pub fn parse_id(raw: &str, what: &str) -> CoreResult<Uuid> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::invalid(format!("{what} is required")));
    }
    Uuid::parse_str(trimmed).map_err(|_| CoreError::invalid(format!("invalid {what}")))
}

/// Rejects missing or whitespace-only text fields.
pub fn require_text(value: &str, field: &str) -> CoreResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CoreError::invalid(format!("{field} is required")));
    }
    Ok(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn like_serializes_subject_as_its_own_field() {
        let video = Uuid::new_v4();
        let user = Uuid::new_v4();
        let like = Like {
            id: Uuid::new_v4(),
            subject: LikeSubject::Video(video),
            liked_by: user,
            created_at: Utc::now(),
        };
        let doc = serde_json::to_value(&like).unwrap();
        assert_eq!(doc["video"], json!(video.to_string()));
        assert_eq!(doc["likedBy"], json!(user.to_string()));
        assert!(doc.get("tweet").is_none());

        let back: Like = serde_json::from_value(doc).unwrap();
        assert_eq!(back.subject, LikeSubject::Video(video));
    }

    #[test]
    fn parse_id_rejects_empty_and_malformed() {
        assert!(matches!(
            parse_id("  ", "videoId"),
            Err(CoreError::InvalidArgument(msg)) if msg == "videoId is required"
        ));
        assert!(matches!(
            parse_id("not-a-uuid", "videoId"),
            Err(CoreError::InvalidArgument(_))
        ));
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&format!(" {id} "), "videoId").unwrap(), id);
    }
}
