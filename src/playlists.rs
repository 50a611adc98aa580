//! Playlists: owner-managed ordered sets of videos.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::builder::{playlist_detail, user_playlists};
use crate::engine::{Core, ensure_owner};
use crate::error::{CoreError, CoreResult};
use crate::model::{Playlist, parse_id, require_text};
use crate::views::{PlaylistDetail, PlaylistSummary};

impl Core {
    pub async fn create_playlist(
        &self,
        actor: Uuid,
        name: &str,
        description: &str,
    ) -> CoreResult<Playlist> {
        let name = require_text(name, "name")?;
        let description = require_text(description, "description")?;
        let now = Utc::now();
        let playlist = Playlist {
            id: Uuid::new_v4(),
            name,
            description,
            owner: actor,
            videos: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_playlist(&playlist).await?;
        info!(playlist = %playlist.id, owner = %actor, "playlist created");
        Ok(playlist)
    }

    pub async fn update_playlist(
        &self,
        actor: Uuid,
        playlist_id: &str,
        name: &str,
        description: &str,
    ) -> CoreResult<Playlist> {
        let id = parse_id(playlist_id, "playlistId")?;
        let name = require_text(name, "name")?;
        let description = require_text(description, "description")?;
        let mut playlist = self.require_playlist(id).await?;
        ensure_owner(playlist.owner, actor, "only the owner can edit this playlist")?;

        playlist.name = name;
        playlist.description = description;
        playlist.updated_at = Utc::now();
        if !self.store.update_playlist(&playlist).await? {
            return Err(CoreError::not_found("playlist not found"));
        }
        Ok(playlist)
    }

    pub async fn delete_playlist(&self, actor: Uuid, playlist_id: &str) -> CoreResult<()> {
        let id = parse_id(playlist_id, "playlistId")?;
        let playlist = self.require_playlist(id).await?;
        ensure_owner(playlist.owner, actor, "only the owner can delete this playlist")?;
        if !self.store.delete_playlist(id).await? {
            return Err(CoreError::not_found("playlist not found"));
        }
        Ok(())
    }

    /// Adding a video already in the playlist leaves it unchanged.
    pub async fn add_video_to_playlist(
        &self,
        actor: Uuid,
        playlist_id: &str,
        video_id: &str,
    ) -> CoreResult<Playlist> {
        let playlist = parse_id(playlist_id, "playlistId")?;
        let video = parse_id(video_id, "videoId")?;
        let current = self.require_playlist(playlist).await?;
        self.require_video(video).await?;
        ensure_owner(current.owner, actor, "only the owner can add videos to this playlist")?;
        self.store.edit_playlist_videos(playlist, video, true).await
    }

    /// Removal works for videos that no longer exist.
    pub async fn remove_video_from_playlist(
        &self,
        actor: Uuid,
        playlist_id: &str,
        video_id: &str,
    ) -> CoreResult<Playlist> {
        let playlist = parse_id(playlist_id, "playlistId")?;
        let video = parse_id(video_id, "videoId")?;
        let current = self.require_playlist(playlist).await?;
        ensure_owner(
            current.owner,
            actor,
            "only the owner can remove videos from this playlist",
        )?;
        self.store.edit_playlist_videos(playlist, video, false).await
    }

    pub async fn get_playlist_by_id(&self, playlist_id: &str) -> CoreResult<PlaylistDetail> {
        let id = parse_id(playlist_id, "playlistId")?;
        self.view_one(&playlist_detail(id))
            .await?
            .ok_or_else(|| CoreError::not_found("playlist not found"))
    }

    pub async fn get_user_playlists(&self, user_id: &str) -> CoreResult<Vec<PlaylistSummary>> {
        let owner = parse_id(user_id, "userId")?;
        self.require_user(owner).await?;
        self.view_all(&user_playlists(owner)).await
    }

    async fn require_playlist(&self, id: Uuid) -> CoreResult<Playlist> {
        self.store
            .get_playlist(id)
            .await?
            .ok_or_else(|| CoreError::not_found("playlist not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Fixture;
    use crate::store::tests::sample_video;

    #[tokio::test]
    async fn detail_totals_only_published_videos_in_order() {
        let fx = Fixture::new().await;
        let owner = fx.user("curator").await;
        let mut first = sample_video(owner.id, "first", true);
        first.views = 10;
        let mut second = sample_video(owner.id, "second", true);
        second.views = 5;
        let hidden = sample_video(owner.id, "hidden", false);
        for video in [&first, &second, &hidden] {
            fx.core.store.insert_video(video).await.unwrap();
        }

        let playlist = fx
            .core
            .create_playlist(owner.id, "mix", "favourites")
            .await
            .unwrap();
        let id = playlist.id.to_string();
        for video in [&second, &first, &hidden, &second] {
            fx.core
                .add_video_to_playlist(owner.id, &id, &video.id.to_string())
                .await
                .unwrap();
        }

        let detail = fx.core.get_playlist_by_id(&id).await.unwrap();
        assert_eq!(detail.total_videos, 2);
        assert_eq!(detail.total_views, 15);
        let titles: Vec<_> = detail.videos.iter().map(|v| v.title.as_str()).collect();
        assert_eq!(titles, vec!["second", "first"]);
        assert_eq!(detail.owner.unwrap().username, "curator");

        let updated = fx
            .core
            .remove_video_from_playlist(owner.id, &id, &second.id.to_string())
            .await
            .unwrap();
        assert_eq!(updated.videos, vec![first.id, hidden.id]);
    }

    #[tokio::test]
    async fn strangers_cannot_touch_a_playlist() {
        let fx = Fixture::new().await;
        let owner = fx.user("curator").await;
        let stranger = fx.user("stranger").await;
        let video = sample_video(owner.id, "clip", true);
        fx.core.store.insert_video(&video).await.unwrap();
        let playlist = fx
            .core
            .create_playlist(owner.id, "mine", "hands off")
            .await
            .unwrap();
        let id = playlist.id.to_string();

        assert!(matches!(
            fx.core
                .add_video_to_playlist(stranger.id, &id, &video.id.to_string())
                .await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            fx.core.update_playlist(stranger.id, &id, "x", "y").await,
            Err(CoreError::Forbidden(_))
        ));
        assert!(matches!(
            fx.core.delete_playlist(stranger.id, &id).await,
            Err(CoreError::Forbidden(_))
        ));

        let renamed = fx
            .core
            .update_playlist(owner.id, &id, "renamed", "still mine")
            .await
            .unwrap();
        assert_eq!(renamed.name, "renamed");
        fx.core.delete_playlist(owner.id, &id).await.unwrap();
        assert!(matches!(
            fx.core.get_playlist_by_id(&id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn user_playlists_list_totals() {
        let fx = Fixture::new().await;
        let owner = fx.user("curator").await;
        let mut video = sample_video(owner.id, "clip", true);
        video.views = 7;
        let mut draft = sample_video(owner.id, "draft", false);
        draft.views = 100;
        for video in [&video, &draft] {
            fx.core.store.insert_video(video).await.unwrap();
        }
        let empty = fx.core.create_playlist(owner.id, "empty", "nothing").await.unwrap();
        let full = fx.core.create_playlist(owner.id, "full", "one").await.unwrap();
        for video in [&video, &draft] {
            fx.core
                .add_video_to_playlist(owner.id, &full.id.to_string(), &video.id.to_string())
                .await
                .unwrap();
        }

        let lists = fx
            .core
            .get_user_playlists(&owner.id.to_string())
            .await
            .unwrap();
        assert_eq!(lists.len(), 2);
        assert_eq!(lists[0].id, full.id);
        assert_eq!(lists[0].total_videos, 1);
        assert_eq!(lists[0].total_views, 7);
        assert_eq!(lists[1].id, empty.id);
        assert_eq!(lists[1].total_views, 0);
    }

    #[tokio::test]
    async fn playlist_fields_are_required() {
        let fx = Fixture::new().await;
        let owner = fx.user("curator").await;
        assert!(matches!(
            fx.core.create_playlist(owner.id, "", "d").await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            fx.core.get_playlist_by_id("not-an-id").await,
            Err(CoreError::InvalidArgument(_))
        ));
    }
}
