//! Accounts and per-user history.

use std::path::PathBuf;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::blob::BlobKind;
use crate::builder::watch_history;
use crate::engine::Core;
use crate::effects::SideEffect;
use crate::error::{CoreError, CoreResult};
use crate::model::{MediaAsset, User, require_text};
use crate::views::{UserProfile, VideoSummary, WatchHistory};

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub avatar: Option<PathBuf>,
}

impl Core {
    /// Usernames are stored lowercase; a taken username or email is a
    /// conflict.
    pub async fn register_user(&self, input: NewUser) -> CoreResult<UserProfile> {
        let username = require_text(&input.username, "username")?.to_lowercase();
        let full_name = require_text(&input.full_name, "fullName")?;
        let email = require_text(&input.email, "email")?;
        if !email.contains('@') {
            return Err(CoreError::invalid("invalid email"));
        }

        let avatar = match input.avatar {
            Some(path) => {
                let blob = self.blobs.store(&path, BlobKind::Image).await?;
                Some(MediaAsset {
                    url: blob.url,
                    storage_id: blob.storage_id,
                })
            }
            None => None,
        };
        let user = User {
            id: Uuid::new_v4(),
            username,
            full_name,
            email,
            avatar,
            watch_history: Vec::new(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.insert_user(&user).await {
            if let Some(avatar) = &user.avatar {
                self.effects.dispatch(SideEffect::DeleteBlob {
                    storage_id: avatar.storage_id.clone(),
                    kind: BlobKind::Image,
                });
            }
            return Err(err);
        }

        info!(user = %user.id, username = %user.username, "user registered");
        Ok(UserProfile::from(&user))
    }

    /// Watched videos in the order they were first watched, each with its
    /// owner summary. Deleted videos drop out.
    pub async fn get_watch_history(&self, viewer: Uuid) -> CoreResult<Vec<VideoSummary>> {
        let history: WatchHistory = self
            .view_one(&watch_history(viewer))
            .await?
            .ok_or_else(|| CoreError::not_found("user not found"))?;
        Ok(history.watch_history)
    }

    pub(crate) async fn require_user(&self, id: Uuid) -> CoreResult<User> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| CoreError::not_found("user not found"))
    }

    pub(crate) async fn require_channel(&self, id: Uuid) -> CoreResult<User> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| CoreError::not_found("channel not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Fixture;
    use crate::store::tests::sample_video;

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.into(),
            full_name: "Full Name".into(),
            email: format!("{}@example.com", username.to_lowercase()),
            avatar: None,
        }
    }

    #[tokio::test]
    async fn registration_lowercases_and_rejects_duplicates() {
        let fx = Fixture::new().await;
        let mut input = new_user("MixedCase");
        input.avatar = Some(fx.upload("me.png", b"avatar"));
        let profile = fx.core.register_user(input).await.unwrap();
        assert_eq!(profile.username, "mixedcase");
        assert!(profile.avatar.unwrap().url.starts_with("/media/image/"));

        let mut again = new_user("MIXEDCASE");
        again.email = "other@example.com".into();
        assert!(matches!(
            fx.core.register_user(again).await,
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            fx.core.register_user(NewUser {
                email: "nope".into(),
                ..new_user("fresh")
            })
            .await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn watch_history_follows_detail_reads() {
        let fx = Fixture::new().await;
        let owner = fx.user("owner").await;
        let viewer = fx.user("viewer").await;
        let first = sample_video(owner.id, "first", true);
        let second = sample_video(owner.id, "second", true);
        for video in [&first, &second] {
            fx.core.store.insert_video(video).await.unwrap();
        }

        for video in [&second, &first, &second] {
            fx.core
                .get_video_by_id(Some(viewer.id), &video.id.to_string())
                .await
                .unwrap();
        }
        fx.core.effects().flush().await;

        let history = fx.core.get_watch_history(viewer.id).await.unwrap();
        let titles: Vec<_> = history.iter().map(|v| v.title.as_str()).collect();
        assert_eq!(titles, vec!["second", "first"]);
        assert_eq!(
            history[0].owner_details.as_ref().unwrap().username,
            "owner"
        );
        assert!(matches!(
            fx.core.get_watch_history(Uuid::new_v4()).await,
            Err(CoreError::NotFound(_))
        ));
    }
}
