//! Entry point of the core: owns the store handle, the executor, the toggle
//! engine, the blob collaborator and the side-effect queue. The entity
//! operations are implemented on [`Core`] in their own modules.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::error::{CoreError, CoreResult};
use crate::executor::Executor;
use crate::paginate::{Page, PageRequest, paginate};
use crate::stage::Pipeline;
use crate::effects::SideEffects;
use crate::store::EntityStore;
use crate::toggle::RelationToggle;

#[derive(Clone)]
pub struct Core {
    pub(crate) store: EntityStore,
    pub(crate) executor: Executor,
    pub(crate) toggles: RelationToggle,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) effects: SideEffects,
}

impl Core {
    /// Must be called from within a tokio runtime; the side-effect worker
    /// is spawned here.
    pub fn new(store: EntityStore, blobs: Arc<dyn BlobStore>) -> Self {
        let effects = SideEffects::spawn(store.clone(), blobs.clone());
        Self {
            executor: Executor::new(store.clone()),
            toggles: RelationToggle::new(store.clone()),
            store,
            blobs,
            effects,
        }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn effects(&self) -> &SideEffects {
        &self.effects
    }

    pub(crate) async fn view_page<T: DeserializeOwned>(
        &self,
        pipeline: &Pipeline,
        page: PageRequest,
    ) -> CoreResult<Page<T>> {
        let cursor = self.executor.execute(pipeline).await?;
        paginate(cursor, page)
    }

    pub(crate) async fn view_all<T: DeserializeOwned>(&self, pipeline: &Pipeline) -> CoreResult<Vec<T>> {
        self.executor.execute(pipeline).await?.collect_as()
    }

    pub(crate) async fn view_one<T: DeserializeOwned>(
        &self,
        pipeline: &Pipeline,
    ) -> CoreResult<Option<T>> {
        self.executor.execute(pipeline).await?.first_as()
    }
}

pub(crate) fn ensure_owner(owner: Uuid, actor: Uuid, message: &str) -> CoreResult<()> {
    if owner == actor {
        Ok(())
    } else {
        Err(CoreError::forbidden(message))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::model::User;
    use crate::store::tests::sample_user;
    use tempfile::TempDir;

    /// Core over an in-memory store and a throwaway media root.
    pub(crate) struct Fixture {
        pub core: Core,
        pub media: TempDir,
        pub staging: TempDir,
    }

    impl Fixture {
        pub async fn new() -> Self {
            let media = TempDir::new().unwrap();
            let staging = TempDir::new().unwrap();
            let store = EntityStore::open_in_memory().unwrap();
            let blobs = Arc::new(LocalBlobStore::new(media.path(), "/media"));
            Self {
                core: Core::new(store, blobs),
                media,
                staging,
            }
        }

        pub async fn user(&self, username: &str) -> User {
            let user = sample_user(username);
            self.core.store.insert_user(&user).await.unwrap();
            user
        }

        /// Writes a staged upload the way the transport would.
        pub fn upload(&self, name: &str, bytes: &[u8]) -> std::path::PathBuf {
            let path = self.staging.path().join(name);
            std::fs::write(&path, bytes).unwrap();
            path
        }
    }

    #[test]
    fn ownership_check_is_forbidden_for_others() {
        let owner = Uuid::new_v4();
        assert!(ensure_owner(owner, owner, "x").is_ok());
        assert!(matches!(
            ensure_owner(owner, Uuid::new_v4(), "only the owner"),
            Err(CoreError::Forbidden(msg)) if msg == "only the owner"
        ));
    }
}
