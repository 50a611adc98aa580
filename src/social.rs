//! Comments on videos and channel tweets.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::builder::{EntityKind, ListPipeline};
use crate::engine::{Core, ensure_owner};
use crate::error::{CoreError, CoreResult};
use crate::model::{Comment, Tweet, parse_id, require_text};
use crate::paginate::{Page, PageRequest};
use crate::views::{CommentView, TweetView};

impl Core {
    pub async fn add_comment(&self, actor: Uuid, video_id: &str, content: &str) -> CoreResult<Comment> {
        let video = parse_id(video_id, "videoId")?;
        let content = require_text(content, "content")?;
        self.require_video(video).await?;

        let now = Utc::now();
        let comment = Comment {
            id: Uuid::new_v4(),
            content,
            video,
            owner: actor,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_comment(&comment).await?;
        info!(comment = %comment.id, %video, "comment added");
        Ok(comment)
    }

    pub async fn update_comment(
        &self,
        actor: Uuid,
        comment_id: &str,
        content: &str,
    ) -> CoreResult<Comment> {
        let id = parse_id(comment_id, "commentId")?;
        let content = require_text(content, "content")?;
        let mut comment = self.require_comment(id).await?;
        ensure_owner(comment.owner, actor, "only the comment owner can edit it")?;

        comment.content = content;
        comment.updated_at = Utc::now();
        if !self.store.update_comment(&comment).await? {
            return Err(CoreError::not_found("comment not found"));
        }
        Ok(comment)
    }

    pub async fn delete_comment(&self, actor: Uuid, comment_id: &str) -> CoreResult<()> {
        let id = parse_id(comment_id, "commentId")?;
        let comment = self.require_comment(id).await?;
        ensure_owner(comment.owner, actor, "only the comment owner can delete it")?;

        if !self.store.delete_comment(id).await? {
            return Err(CoreError::not_found("comment not found"));
        }
        Ok(())
    }

    pub async fn get_video_comments(
        &self,
        viewer: Option<Uuid>,
        video_id: &str,
        page: PageRequest,
    ) -> CoreResult<Page<CommentView>> {
        let video = parse_id(video_id, "videoId")?;
        self.require_video(video).await?;
        let pipeline = ListPipeline::new(EntityKind::Comment)
            .on_video(video)
            .viewer(viewer)
            .build()?;
        self.view_page(&pipeline, page).await
    }

    pub async fn create_tweet(&self, actor: Uuid, content: &str) -> CoreResult<Tweet> {
        let content = require_text(content, "content")?;
        let now = Utc::now();
        let tweet = Tweet {
            id: Uuid::new_v4(),
            content,
            owner: actor,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_tweet(&tweet).await?;
        info!(tweet = %tweet.id, owner = %actor, "tweet created");
        Ok(tweet)
    }

    pub async fn update_tweet(&self, actor: Uuid, tweet_id: &str, content: &str) -> CoreResult<Tweet> {
        let id = parse_id(tweet_id, "tweetId")?;
        let content = require_text(content, "content")?;
        let mut tweet = self.require_tweet(id).await?;
        ensure_owner(tweet.owner, actor, "only the owner can edit their tweet")?;

        tweet.content = content;
        tweet.updated_at = Utc::now();
        if !self.store.update_tweet(&tweet).await? {
            return Err(CoreError::not_found("tweet not found"));
        }
        Ok(tweet)
    }

    pub async fn delete_tweet(&self, actor: Uuid, tweet_id: &str) -> CoreResult<()> {
        let id = parse_id(tweet_id, "tweetId")?;
        let tweet = self.require_tweet(id).await?;
        ensure_owner(tweet.owner, actor, "only the owner can delete their tweet")?;

        if !self.store.delete_tweet(id).await? {
            return Err(CoreError::not_found("tweet not found"));
        }
        Ok(())
    }

    pub async fn get_user_tweets(
        &self,
        viewer: Option<Uuid>,
        user_id: &str,
        page: PageRequest,
    ) -> CoreResult<Page<TweetView>> {
        let owner = parse_id(user_id, "userId")?;
        self.require_user(owner).await?;
        let pipeline = ListPipeline::new(EntityKind::Tweet)
            .owner(Some(owner))
            .viewer(viewer)
            .build()?;
        self.view_page(&pipeline, page).await
    }

    async fn require_comment(&self, id: Uuid) -> CoreResult<Comment> {
        self.store
            .get_comment(id)
            .await?
            .ok_or_else(|| CoreError::not_found("comment not found"))
    }

    async fn require_tweet(&self, id: Uuid) -> CoreResult<Tweet> {
        self.store
            .get_tweet(id)
            .await?
            .ok_or_else(|| CoreError::not_found("tweet not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Fixture;
    use crate::store::tests::sample_video;
    use crate::toggle::SubjectKind;

    #[tokio::test]
    async fn only_the_author_may_change_a_comment() {
        let fx = Fixture::new().await;
        let author = fx.user("author").await;
        let stranger = fx.user("stranger").await;
        let video = sample_video(author.id, "clip", true);
        fx.core.store.insert_video(&video).await.unwrap();

        let comment = fx
            .core
            .add_comment(author.id, &video.id.to_string(), "first!")
            .await
            .unwrap();
        let id = comment.id.to_string();

        assert!(matches!(
            fx.core.update_comment(stranger.id, &id, "hijacked").await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            fx.core.delete_comment(stranger.id, &id).await,
            Err(CoreError::Forbidden(_))
        ));

        let edited = fx.core.update_comment(author.id, &id, "edited").await.unwrap();
        assert_eq!(edited.content, "edited");
        fx.core.delete_comment(author.id, &id).await.unwrap();
        assert!(matches!(
            fx.core.delete_comment(author.id, &id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn comments_need_content_and_an_existing_video() {
        let fx = Fixture::new().await;
        let author = fx.user("author").await;
        assert!(matches!(
            fx.core
                .add_comment(author.id, &Uuid::new_v4().to_string(), "hi")
                .await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            fx.core
                .add_comment(author.id, &Uuid::new_v4().to_string(), "   ")
                .await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn comment_feed_joins_author_and_likes() {
        let fx = Fixture::new().await;
        let author = fx.user("author").await;
        let fan = fx.user("fan").await;
        let video = sample_video(author.id, "clip", true);
        fx.core.store.insert_video(&video).await.unwrap();
        let video_id = video.id.to_string();

        let first = fx.core.add_comment(author.id, &video_id, "one").await.unwrap();
        fx.core.add_comment(fan.id, &video_id, "two").await.unwrap();
        fx.core
            .toggles
            .toggle(SubjectKind::Comment, &first.id.to_string(), fan.id)
            .await
            .unwrap();

        let page = fx
            .core
            .get_video_comments(Some(fan.id), &video_id, PageRequest::default())
            .await
            .unwrap();
        let contents: Vec<_> = page.items.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "one"]);
        assert_eq!(page.items[0].owner.username, "fan");
        assert_eq!(page.items[1].likes_count, 1);
        assert!(page.items[1].is_liked);
        assert!(!page.items[0].is_liked);
    }

    #[tokio::test]
    async fn liking_a_tweet_twice_round_trips() {
        let fx = Fixture::new().await;
        let author = fx.user("author").await;
        let viewer = fx.user("viewer").await;
        let tweet = fx.core.create_tweet(author.id, "hello world").await.unwrap();
        let tweets = |viewer: Uuid| {
            let core = fx.core.clone();
            let author = author.id.to_string();
            async move {
                core.get_user_tweets(Some(viewer), &author, PageRequest::default())
                    .await
                    .unwrap()
            }
        };

        let before = tweets(viewer.id).await;
        assert!(!before.items[0].is_liked);
        assert_eq!(before.items[0].likes_count, 0);

        let liked = fx.core.toggle_tweet_like(viewer.id, &tweet.id.to_string()).await.unwrap();
        assert!(liked.is_liked);
        let after = tweets(viewer.id).await;
        assert!(after.items[0].is_liked);
        assert_eq!(after.items[0].likes_count, 1);
        assert!(!tweets(author.id).await.items[0].is_liked);

        let unliked = fx.core.toggle_tweet_like(viewer.id, &tweet.id.to_string()).await.unwrap();
        assert!(!unliked.is_liked);
        let reverted = tweets(viewer.id).await;
        assert!(!reverted.items[0].is_liked);
        assert_eq!(reverted.items[0].likes_count, 0);
    }

    #[tokio::test]
    async fn likes_count_matches_every_like() {
        let fx = Fixture::new().await;
        let author = fx.user("author").await;
        let tweet = fx.core.create_tweet(author.id, "popular").await.unwrap();
        for n in 0..5 {
            let fan = fx.user(&format!("fan{n}")).await;
            fx.core
                .toggle_tweet_like(fan.id, &tweet.id.to_string())
                .await
                .unwrap();
        }
        let page = fx
            .core
            .get_user_tweets(None, &author.id.to_string(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.items[0].likes_count, 5);
        assert!(!page.items[0].is_liked);
    }

    #[tokio::test]
    async fn tweets_of_unknown_user_are_not_found() {
        let fx = Fixture::new().await;
        assert!(matches!(
            fx.core
                .get_user_tweets(None, &Uuid::new_v4().to_string(), PageRequest::default())
                .await,
            Err(CoreError::NotFound(_))
        ));
    }
}
