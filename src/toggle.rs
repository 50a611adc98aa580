//! Relation toggle engine for likes and subscriptions.

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{LikeSubject, parse_id};
use crate::store::{EntityStore, Relation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    Video,
    Comment,
    Tweet,
    /// A user acting as a channel; toggles a subscription.
    Channel,
}

impl SubjectKind {
    fn id_label(self) -> &'static str {
        match self {
            SubjectKind::Video => "videoId",
            SubjectKind::Comment => "commentId",
            SubjectKind::Tweet => "tweetId",
            SubjectKind::Channel => "channelId",
        }
    }

    fn relation(self, subject: Uuid) -> Relation {
        match self {
            SubjectKind::Video => Relation::Like(LikeSubject::Video(subject)),
            SubjectKind::Comment => Relation::Like(LikeSubject::Comment(subject)),
            SubjectKind::Tweet => Relation::Like(LikeSubject::Tweet(subject)),
            SubjectKind::Channel => Relation::Subscription { channel: subject },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ToggleOutcome {
    pub active: bool,
}

#[derive(Clone)]
pub struct RelationToggle {
    store: EntityStore,
}

impl RelationToggle {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Flips the (kind, subject, actor) relation and reports whether it
    /// exists afterwards. The id is validated before the store is touched.
    pub async fn toggle(
        &self,
        kind: SubjectKind,
        subject_id: &str,
        actor: Uuid,
    ) -> CoreResult<ToggleOutcome> {
        let subject = parse_id(subject_id, kind.id_label())?;
        if kind == SubjectKind::Channel && subject == actor {
            return Err(CoreError::invalid("cannot subscribe to your own channel"));
        }

        let active = self.store.toggle_relation(kind.relation(subject), actor).await?;
        info!(?kind, %subject, %actor, active, "relation toggled");
        Ok(ToggleOutcome { active })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{sample_user, sample_video};

    async fn engine() -> (RelationToggle, Uuid, Uuid, Uuid) {
        let store = EntityStore::open_in_memory().unwrap();
        let owner = sample_user("owner");
        let viewer = sample_user("viewer");
        store.insert_user(&owner).await.unwrap();
        store.insert_user(&viewer).await.unwrap();
        let video = sample_video(owner.id, "clip", true);
        store.insert_video(&video).await.unwrap();
        (RelationToggle::new(store), owner.id, viewer.id, video.id)
    }

    #[tokio::test]
    async fn toggling_twice_restores_the_original_state() {
        let (engine, _, viewer, video) = engine().await;
        let id = video.to_string();
        let first = engine.toggle(SubjectKind::Video, &id, viewer).await.unwrap();
        let second = engine.toggle(SubjectKind::Video, &id, viewer).await.unwrap();
        assert!(first.active);
        assert!(!second.active);
        let third = engine.toggle(SubjectKind::Video, &id, viewer).await.unwrap();
        assert!(third.active);
    }

    #[tokio::test]
    async fn subscriptions_toggle_per_channel() {
        let (engine, owner, viewer, _) = engine().await;
        let outcome = engine
            .toggle(SubjectKind::Channel, &owner.to_string(), viewer)
            .await
            .unwrap();
        assert!(outcome.active);
    }

    #[tokio::test]
    async fn rejects_bad_ids_and_missing_subjects() {
        let (engine, owner, viewer, _) = engine().await;
        assert!(matches!(
            engine.toggle(SubjectKind::Tweet, "", viewer).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.toggle(SubjectKind::Comment, "nope", viewer).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine
                .toggle(SubjectKind::Tweet, &Uuid::new_v4().to_string(), viewer)
                .await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            engine
                .toggle(SubjectKind::Channel, &owner.to_string(), owner)
                .await,
            Err(CoreError::InvalidArgument(_))
        ));
    }
}
