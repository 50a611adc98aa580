//! Fire-and-forget side effects.
//!
//! View counting, watch-history updates and blob cleanup never decide the
//! outcome of the request that caused them. They are queued to one worker
//! task; failures are logged and counted in [`EffectStats`].

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blob::{BlobKind, BlobStore};
use crate::error::CoreResult;
use crate::store::EntityStore;

#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    IncrementViews { video: Uuid },
    RecordWatch { user: Uuid, video: Uuid },
    DeleteBlob { storage_id: String, kind: BlobKind },
}

enum Message {
    Run(SideEffect),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EffectStats {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct SideEffects {
    tx: mpsc::UnboundedSender<Message>,
    counters: Arc<Counters>,
}

impl SideEffects {
    /// Starts the worker on the current runtime.
    pub fn spawn(store: EntityStore, blobs: Arc<dyn BlobStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_worker(rx, store, blobs, counters.clone()));
        Self { tx, counters }
    }

    pub fn dispatch(&self, effect: SideEffect) {
        debug!(?effect, "queueing side effect");
        if let Err(err) = self.tx.send(Message::Run(effect)) {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("side-effect worker is gone, dropping {:?}", err.0.effect());
        }
    }

    /// Resolves once everything queued before the call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn stats(&self) -> EffectStats {
        EffectStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Message {
    fn effect(&self) -> Option<&SideEffect> {
        match self {
            Message::Run(effect) => Some(effect),
            Message::Flush(_) => None,
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Message>,
    store: EntityStore,
    blobs: Arc<dyn BlobStore>,
    counters: Arc<Counters>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Run(effect) => match apply(&store, blobs.as_ref(), &effect).await {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(?effect, "side effect failed: {err}");
                }
            },
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("side-effect worker stopped");
}

async fn apply(store: &EntityStore, blobs: &dyn BlobStore, effect: &SideEffect) -> CoreResult<()> {
    match effect {
        SideEffect::IncrementViews { video } => store.increment_views(*video).await,
        SideEffect::RecordWatch { user, video } => store.add_to_watch_history(*user, *video).await,
        SideEffect::DeleteBlob { storage_id, kind } => blobs.delete(storage_id, *kind).await,
    }
}
