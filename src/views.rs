//! Typed shapes of the documents produced by the view pipelines.
//!
//! Each struct mirrors one projection in [`builder`](crate::builder) and is
//! decoded straight from the executor's JSON output. Optional joins (an
//! avatar-less owner, a channel without published videos) come back as
//! `None` instead of failing the decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{MediaAsset, User};

/// Public part of a stored media file; the storage id never leaves the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetUrl {
    pub url: String,
}

impl From<&MediaAsset> for AssetUrl {
    fn from(asset: &MediaAsset) -> Self {
        Self {
            url: asset.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSummary {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<AssetUrl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFeedItem {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub video_file: AssetUrl,
    pub thumbnail: AssetUrl,
    pub duration: f64,
    pub views: i64,
    pub created_at: DateTime<Utc>,
    pub owner_details: OwnerSummary,
    pub likes_count: usize,
    pub is_liked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<AssetUrl>,
    pub subscriber_count: usize,
    pub is_subscribed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetail {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub video_file: AssetUrl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<AssetUrl>,
    pub title: String,
    pub description: String,
    pub views: i64,
    pub created_at: DateTime<Utc>,
    pub duration: f64,
    #[serde(default)]
    pub owner: Option<ChannelSummary>,
    pub likes_count: usize,
    pub is_liked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TweetView {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub owner_details: OwnerSummary,
    pub likes_count: usize,
    pub is_liked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub owner: OwnerSummary,
    pub likes_count: usize,
    pub is_liked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberProfile {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<AssetUrl>,
    pub subscriber_count: usize,
    /// Whether the listed channel subscribes back to this subscriber.
    pub is_subscribed_back: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberEntry {
    pub subscriber: SubscriberProfile,
}

/// Video fields shared by the nested views (latest upload, liked videos,
/// playlist contents, watch history).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub video_file: AssetUrl,
    pub thumbnail: AssetUrl,
    pub duration: f64,
    pub views: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_details: Option<OwnerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedChannel {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<AssetUrl>,
    #[serde(default)]
    pub latest_video: Option<VideoSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedChannelEntry {
    pub subscribed_channel: SubscribedChannel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikedVideoEntry {
    pub liked_video: VideoSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistOwner {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<AssetUrl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistDetail {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_videos: usize,
    pub total_views: i64,
    #[serde(default)]
    pub owner: Option<PlaylistOwner>,
    #[serde(default)]
    pub videos: Vec<VideoSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSummary {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub total_videos: usize,
    pub total_views: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WatchHistory {
    #[serde(default)]
    pub watch_history: Vec<VideoSummary>,
}

/// Account fields safe to hand back to any caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<AssetUrl>,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            full_name: user.full_name.clone(),
            email: user.email.clone(),
            avatar: user.avatar.as_ref().map(AssetUrl::from),
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeStatus {
    pub is_liked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub subscribed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishStatus {
    pub is_published: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feed_item_decodes_without_owner_avatar() {
        let owner = Uuid::new_v4();
        let doc = json!({
            "_id": Uuid::new_v4().to_string(),
            "title": "t",
            "description": "d",
            "videoFile": {"url": "/media/video/a.mp4"},
            "thumbnail": {"url": "/media/image/a.jpg"},
            "duration": 3.5,
            "views": 2,
            "createdAt": "2024-05-01T10:00:00.000000Z",
            "ownerDetails": {"_id": owner.to_string(), "username": "alice"},
            "likesCount": 0,
            "isLiked": false,
        });
        let item: VideoFeedItem = serde_json::from_value(doc).unwrap();
        assert_eq!(item.owner_details.id, owner);
        assert!(item.owner_details.avatar.is_none());

        let back = serde_json::to_value(&item).unwrap();
        assert!(back["ownerDetails"].get("avatar").is_none());
        assert_eq!(back["videoFile"], json!({"url": "/media/video/a.mp4"}));
    }

    #[test]
    fn channel_without_uploads_has_no_latest_video() {
        let doc = json!({
            "subscribedChannel": {
                "_id": Uuid::new_v4().to_string(),
                "username": "bob",
                "fullName": "Bob",
            }
        });
        let entry: SubscribedChannelEntry = serde_json::from_value(doc).unwrap();
        assert!(entry.subscribed_channel.latest_video.is_none());
    }
}
