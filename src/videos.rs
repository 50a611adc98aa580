//! Video operations: upload, edit, publish toggle, feed and detail views.

use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob::{BlobKind, StoredBlob};
use crate::builder::{EntityKind, ListPipeline, video_detail};
use crate::engine::{Core, ensure_owner};
use crate::effects::SideEffect;
use crate::error::{CoreError, CoreResult};
use crate::model::{MediaAsset, Video, parse_id, require_text};
use crate::paginate::{Page, PageRequest};
use crate::views::{PublishStatus, VideoDetail, VideoFeedItem};

/// Upload request. Files are staged local paths handed over by the
/// transport; they are consumed by the blob store.
#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub video_file: Option<PathBuf>,
    pub thumbnail: Option<PathBuf>,
    /// Used when the blob store cannot measure the upload itself.
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct VideoUpdate {
    pub title: String,
    pub description: String,
    pub thumbnail: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct VideoListParams {
    pub page: PageRequest,
    pub query: Option<String>,
    pub sort_by: Option<String>,
    pub sort_type: Option<String>,
    pub user_id: Option<String>,
}

fn asset(blob: &StoredBlob) -> MediaAsset {
    MediaAsset {
        url: blob.url.clone(),
        storage_id: blob.storage_id.clone(),
    }
}

impl Core {
    /// Uploads both files, then writes the record unpublished. Blobs that
    /// were uploaded before a later step failed are queued for deletion.
    pub async fn publish_video(&self, actor: Uuid, input: NewVideo) -> CoreResult<Video> {
        let title = require_text(&input.title, "title")?;
        let description = require_text(&input.description, "description")?;
        let video_path = input
            .video_file
            .ok_or_else(|| CoreError::invalid("video file is required"))?;
        let thumbnail_path = input
            .thumbnail
            .ok_or_else(|| CoreError::invalid("thumbnail is required"))?;

        let video_blob = self.blobs.store(&video_path, BlobKind::Video).await?;
        let thumbnail_blob = match self.blobs.store(&thumbnail_path, BlobKind::Image).await {
            Ok(blob) => blob,
            Err(err) => {
                self.discard_blob(&video_blob, BlobKind::Video);
                return Err(err);
            }
        };

        let now = Utc::now();
        let video = Video {
            id: Uuid::new_v4(),
            title,
            description,
            video_file: asset(&video_blob),
            thumbnail: asset(&thumbnail_blob),
            duration: video_blob.duration.or(input.duration).unwrap_or(0.0),
            views: 0,
            is_published: false,
            owner: actor,
            created_at: now,
            updated_at: now,
        };
        if let Err(err) = self.store.insert_video(&video).await {
            self.discard_blob(&video_blob, BlobKind::Video);
            self.discard_blob(&thumbnail_blob, BlobKind::Image);
            return Err(err);
        }

        info!(video = %video.id, owner = %actor, "video uploaded");
        Ok(video)
    }

    pub async fn update_video(
        &self,
        actor: Uuid,
        video_id: &str,
        update: VideoUpdate,
    ) -> CoreResult<Video> {
        let id = parse_id(video_id, "videoId")?;
        let title = require_text(&update.title, "title")?;
        let description = require_text(&update.description, "description")?;

        let mut video = self.require_video(id).await?;
        ensure_owner(video.owner, actor, "only the owner can edit this video")?;

        let replaced = match update.thumbnail {
            Some(path) => {
                let blob = self.blobs.store(&path, BlobKind::Image).await?;
                Some(std::mem::replace(&mut video.thumbnail, asset(&blob)))
            }
            None => None,
        };
        video.title = title;
        video.description = description;
        video.updated_at = Utc::now();

        let written = self.store.update_video(&video).await;
        match (written, replaced) {
            (Ok(true), Some(old)) => {
                self.effects.dispatch(SideEffect::DeleteBlob {
                    storage_id: old.storage_id,
                    kind: BlobKind::Image,
                });
            }
            (Ok(true), None) => {}
            (outcome, replaced) => {
                if replaced.is_some() {
                    self.effects.dispatch(SideEffect::DeleteBlob {
                        storage_id: video.thumbnail.storage_id.clone(),
                        kind: BlobKind::Image,
                    });
                }
                outcome?;
                return Err(CoreError::not_found("video not found"));
            }
        }
        Ok(video)
    }

    /// Removes the record (with its comments and likes), then the files.
    pub async fn delete_video(&self, actor: Uuid, video_id: &str) -> CoreResult<()> {
        let id = parse_id(video_id, "videoId")?;
        let video = self.require_video(id).await?;
        ensure_owner(video.owner, actor, "only the owner can delete this video")?;

        if !self.store.delete_video(id).await? {
            return Err(CoreError::not_found("video not found"));
        }
        self.discard_blob_asset(&video.video_file, BlobKind::Video);
        self.discard_blob_asset(&video.thumbnail, BlobKind::Image);
        info!(video = %id, "video deleted");
        Ok(())
    }

    pub async fn toggle_publish_status(
        &self,
        actor: Uuid,
        video_id: &str,
    ) -> CoreResult<PublishStatus> {
        let id = parse_id(video_id, "videoId")?;
        let mut video = self.require_video(id).await?;
        ensure_owner(video.owner, actor, "only the owner can publish this video")?;

        video.is_published = !video.is_published;
        video.updated_at = Utc::now();
        if !self.store.update_video(&video).await? {
            return Err(CoreError::not_found("video not found"));
        }
        Ok(PublishStatus {
            is_published: video.is_published,
        })
    }

    /// Detail view. A successful read queues the view-count increment and,
    /// for a known viewer, the watch-history insert.
    pub async fn get_video_by_id(
        &self,
        viewer: Option<Uuid>,
        video_id: &str,
    ) -> CoreResult<VideoDetail> {
        let id = parse_id(video_id, "videoId")?;
        let detail: VideoDetail = self
            .view_one(&video_detail(id, viewer))
            .await?
            .ok_or_else(|| CoreError::not_found("video not found"))?;

        self.effects.dispatch(SideEffect::IncrementViews { video: id });
        if let Some(user) = viewer {
            self.effects.dispatch(SideEffect::RecordWatch { user, video: id });
        }
        Ok(detail)
    }

    /// Feed of published videos. An owner browsing their own channel also
    /// sees their unpublished uploads.
    pub async fn get_all_videos(
        &self,
        viewer: Option<Uuid>,
        params: VideoListParams,
    ) -> CoreResult<Page<VideoFeedItem>> {
        let owner = params
            .user_id
            .as_deref()
            .map(|raw| parse_id(raw, "userId"))
            .transpose()?;
        let pipeline = ListPipeline::new(EntityKind::Video)
            .search(params.query.as_deref())
            .owner(owner)
            .published_only(owner.is_none() || owner != viewer)
            .sort(params.sort_by.as_deref(), params.sort_type.as_deref())
            .viewer(viewer)
            .build()?;

        if let Some(owner) = owner {
            if self.store.get_user(owner).await?.is_none() {
                return Err(CoreError::not_found("user does not exist"));
            }
        }
        self.view_page(&pipeline, params.page).await
    }

    pub(crate) async fn require_video(&self, id: Uuid) -> CoreResult<Video> {
        self.store
            .get_video(id)
            .await?
            .ok_or_else(|| CoreError::not_found("video not found"))
    }

    fn discard_blob(&self, blob: &StoredBlob, kind: BlobKind) {
        warn!(storage_id = %blob.storage_id, "discarding uploaded blob");
        self.effects.dispatch(SideEffect::DeleteBlob {
            storage_id: blob.storage_id.clone(),
            kind,
        });
    }

    fn discard_blob_asset(&self, asset: &MediaAsset, kind: BlobKind) {
        self.effects.dispatch(SideEffect::DeleteBlob {
            storage_id: asset.storage_id.clone(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Fixture;
    use crate::toggle::SubjectKind;

    async fn upload(fx: &Fixture, owner: Uuid, title: &str) -> Video {
        fx.core
            .publish_video(
                owner,
                NewVideo {
                    title: title.into(),
                    description: format!("{title} description"),
                    video_file: Some(fx.upload(&format!("{title}.mp4"), b"video-bytes")),
                    thumbnail: Some(fx.upload(&format!("{title}.png"), b"thumb-bytes")),
                    duration: Some(42.0),
                },
            )
            .await
            .unwrap()
    }

    fn titles(page: &Page<VideoFeedItem>) -> Vec<&str> {
        page.items.iter().map(|item| item.title.as_str()).collect()
    }

    #[tokio::test]
    async fn unpublished_videos_stay_out_of_the_public_feed() {
        let fx = Fixture::new().await;
        let owner = fx.user("creator").await;
        let video = upload(&fx, owner.id, "alpha").await;
        assert!(!video.is_published);

        let feed = fx
            .core
            .get_all_videos(None, VideoListParams::default())
            .await
            .unwrap();
        assert!(feed.items.is_empty());

        let status = fx
            .core
            .toggle_publish_status(owner.id, &video.id.to_string())
            .await
            .unwrap();
        assert!(status.is_published);
        let feed = fx
            .core
            .get_all_videos(None, VideoListParams::default())
            .await
            .unwrap();
        assert_eq!(titles(&feed), vec!["alpha"]);
        assert_eq!(feed.items[0].owner_details.username, "creator");
        assert_eq!(feed.items[0].duration, 42.0);

        fx.core
            .delete_video(owner.id, &video.id.to_string())
            .await
            .unwrap();
        let feed = fx
            .core
            .get_all_videos(None, VideoListParams::default())
            .await
            .unwrap();
        assert!(feed.items.is_empty());
        assert!(matches!(
            fx.core.get_video_by_id(None, &video.id.to_string()).await,
            Err(CoreError::NotFound(_))
        ));

        fx.core.effects().flush().await;
        let files: Vec<_> = std::fs::read_dir(fx.media.path().join("video"))
            .unwrap()
            .collect();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn owner_sees_own_drafts() {
        let fx = Fixture::new().await;
        let owner = fx.user("creator").await;
        upload(&fx, owner.id, "draft").await;
        let params = || VideoListParams {
            user_id: Some(owner.id.to_string()),
            ..VideoListParams::default()
        };

        let own = fx
            .core
            .get_all_videos(Some(owner.id), params())
            .await
            .unwrap();
        assert_eq!(own.total_items, 1);
        let visitor = fx.core.get_all_videos(None, params()).await.unwrap();
        assert_eq!(visitor.total_items, 0);
    }

    #[tokio::test]
    async fn feed_is_newest_first_and_paginated() {
        let fx = Fixture::new().await;
        let owner = fx.user("creator").await;
        for n in 0..12 {
            let video = upload(&fx, owner.id, &format!("v{n:02}")).await;
            fx.core
                .toggle_publish_status(owner.id, &video.id.to_string())
                .await
                .unwrap();
        }

        let page = fx
            .core
            .get_all_videos(
                None,
                VideoListParams {
                    page: PageRequest::new(2, 5),
                    ..VideoListParams::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.items.len(), 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(titles(&page), vec!["v06", "v05", "v04", "v03", "v02"]);

        let all = fx
            .core
            .get_all_videos(
                None,
                VideoListParams {
                    page: PageRequest::new(1, 100),
                    ..VideoListParams::default()
                },
            )
            .await
            .unwrap();
        assert!(
            all.items
                .windows(2)
                .all(|pair| pair[0].created_at >= pair[1].created_at)
        );

        let by_title = fx
            .core
            .get_all_videos(
                None,
                VideoListParams {
                    query: Some("v01 v10".into()),
                    sort_by: Some("title".into()),
                    sort_type: Some("asc".into()),
                    ..VideoListParams::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(titles(&by_title), vec!["v01", "v10"]);
    }

    #[tokio::test]
    async fn unknown_sort_key_is_invalid() {
        let fx = Fixture::new().await;
        let err = fx
            .core
            .get_all_videos(
                None,
                VideoListParams {
                    sort_by: Some("owner.password".into()),
                    sort_type: Some("asc".into()),
                    ..VideoListParams::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn detail_reports_likes_and_subscription_and_counts_the_view() {
        let fx = Fixture::new().await;
        let owner = fx.user("creator").await;
        let viewer = fx.user("viewer").await;
        let video = upload(&fx, owner.id, "clip").await;
        let id = video.id.to_string();

        let detail = fx.core.get_video_by_id(Some(viewer.id), &id).await.unwrap();
        assert_eq!(detail.likes_count, 0);
        assert!(!detail.is_liked);
        let channel = detail.owner.clone().unwrap();
        assert_eq!(channel.subscriber_count, 0);
        assert!(!channel.is_subscribed);

        fx.core
            .toggles
            .toggle(SubjectKind::Video, &id, viewer.id)
            .await
            .unwrap();
        fx.core
            .toggles
            .toggle(SubjectKind::Channel, &owner.id.to_string(), viewer.id)
            .await
            .unwrap();
        fx.core.effects().flush().await;

        let detail = fx.core.get_video_by_id(Some(viewer.id), &id).await.unwrap();
        assert_eq!(detail.views, 1);
        assert_eq!(detail.likes_count, 1);
        assert!(detail.is_liked);
        let channel = detail.owner.unwrap();
        assert_eq!(channel.subscriber_count, 1);
        assert!(channel.is_subscribed);

        let anonymous = fx.core.get_video_by_id(None, &id).await.unwrap();
        assert!(!anonymous.is_liked);
        assert!(!anonymous.owner.unwrap().is_subscribed);

        fx.core.effects().flush().await;
        let stored = fx.core.store.get_video(video.id).await.unwrap().unwrap();
        assert_eq!(stored.views, 3);
        let history = fx.core.store.get_user(viewer.id).await.unwrap().unwrap();
        assert_eq!(history.watch_history, vec![video.id]);
    }

    #[tokio::test]
    async fn only_the_owner_may_edit_and_old_thumbnail_is_removed() {
        let fx = Fixture::new().await;
        let owner = fx.user("creator").await;
        let other = fx.user("other").await;
        let video = upload(&fx, owner.id, "clip").await;
        let id = video.id.to_string();

        let update = || VideoUpdate {
            title: "renamed".into(),
            description: "new description".into(),
            thumbnail: None,
        };
        assert!(matches!(
            fx.core.update_video(other.id, &id, update()).await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            fx.core.delete_video(other.id, &id).await,
            Err(CoreError::Forbidden(_))
        ));

        let updated = fx
            .core
            .update_video(
                owner.id,
                &id,
                VideoUpdate {
                    thumbnail: Some(fx.upload("fresh.png", b"new-thumb")),
                    ..update()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "renamed");
        assert_ne!(updated.thumbnail, video.thumbnail);

        fx.core.effects().flush().await;
        let images: Vec<String> = std::fs::read_dir(fx.media.path().join("image"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(images, vec![updated.thumbnail.storage_id.clone()]);
    }

    #[tokio::test]
    async fn missing_files_fail_before_any_upload() {
        let fx = Fixture::new().await;
        let owner = fx.user("creator").await;
        let err = fx
            .core
            .publish_video(
                owner.id,
                NewVideo {
                    title: "t".into(),
                    description: "d".into(),
                    video_file: Some(fx.upload("only.mp4", b"x")),
                    thumbnail: None,
                    duration: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(msg) if msg == "thumbnail is required"));
        assert!(!fx.media.path().join("video").exists());
    }

    #[tokio::test]
    async fn failed_thumbnail_upload_discards_the_video_blob() {
        let fx = Fixture::new().await;
        let owner = fx.user("creator").await;
        let err = fx
            .core
            .publish_video(
                owner.id,
                NewVideo {
                    title: "t".into(),
                    description: "d".into(),
                    video_file: Some(fx.upload("clip.mp4", b"x")),
                    thumbnail: Some(fx.staging.path().join("never-written.png")),
                    duration: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
        fx.core.effects().flush().await;
        let left: Vec<_> = std::fs::read_dir(fx.media.path().join("video"))
            .unwrap()
            .collect();
        assert!(left.is_empty());
    }
}
