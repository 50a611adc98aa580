//! Likes and channel subscriptions.

use uuid::Uuid;

use crate::builder::{channel_subscribers, liked_videos, subscribed_channels};
use crate::engine::Core;
use crate::error::CoreResult;
use crate::model::parse_id;
use crate::toggle::SubjectKind;
use crate::views::{
    LikeStatus, LikedVideoEntry, SubscribedChannelEntry, SubscriberEntry, SubscriptionStatus,
};

impl Core {
    pub async fn toggle_video_like(&self, actor: Uuid, video_id: &str) -> CoreResult<LikeStatus> {
        self.toggle_like(SubjectKind::Video, video_id, actor).await
    }

    pub async fn toggle_comment_like(
        &self,
        actor: Uuid,
        comment_id: &str,
    ) -> CoreResult<LikeStatus> {
        self.toggle_like(SubjectKind::Comment, comment_id, actor).await
    }

    pub async fn toggle_tweet_like(&self, actor: Uuid, tweet_id: &str) -> CoreResult<LikeStatus> {
        self.toggle_like(SubjectKind::Tweet, tweet_id, actor).await
    }

    async fn toggle_like(
        &self,
        kind: SubjectKind,
        subject_id: &str,
        actor: Uuid,
    ) -> CoreResult<LikeStatus> {
        let outcome = self.toggles.toggle(kind, subject_id, actor).await?;
        Ok(LikeStatus {
            is_liked: outcome.active,
        })
    }

    /// Published videos the viewer liked, most recent like first.
    pub async fn get_liked_videos(&self, viewer: Uuid) -> CoreResult<Vec<LikedVideoEntry>> {
        self.view_all(&liked_videos(viewer)).await
    }

    pub async fn toggle_subscription(
        &self,
        actor: Uuid,
        channel_id: &str,
    ) -> CoreResult<SubscriptionStatus> {
        let outcome = self
            .toggles
            .toggle(SubjectKind::Channel, channel_id, actor)
            .await?;
        Ok(SubscriptionStatus {
            subscribed: outcome.active,
        })
    }

    pub async fn get_user_channel_subscribers(
        &self,
        channel_id: &str,
    ) -> CoreResult<Vec<SubscriberEntry>> {
        let channel = parse_id(channel_id, "channelId")?;
        self.require_channel(channel).await?;
        self.view_all(&channel_subscribers(channel)).await
    }

    pub async fn get_subscribed_channels(
        &self,
        subscriber_id: &str,
    ) -> CoreResult<Vec<SubscribedChannelEntry>> {
        let subscriber = parse_id(subscriber_id, "subscriberId")?;
        self.require_user(subscriber).await?;
        self.view_all(&subscribed_channels(subscriber)).await
    }
}
