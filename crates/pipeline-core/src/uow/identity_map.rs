use crate::domain::{Entity, Uid};
use crate::error::{Error, Result};
use crate::repository::{encode, Update};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Entity handle shared by everyone in one unit of work.
pub type Shared<E> = Arc<Mutex<E>>;

/// Type-erased view of a loaded entity.
#[async_trait]
trait Tracked: Send + Sync {
    async fn encode(&self) -> Result<Update>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[async_trait]
impl<E: Entity> Tracked for Mutex<E> {
    async fn encode(&self) -> Result<Update> {
        encode(&*self.lock().await)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct Slot {
    entity: Arc<dyn Tracked>,
    for_update: bool,
}

/// Per-scope cache guaranteeing one in-memory instance per `(collection, uid)`.
///
/// The map lives exactly as long as its unit of work, so nothing outlives the
/// scope that loaded it.
#[derive(Default)]
pub(crate) struct IdentityMap {
    seen: Mutex<HashMap<(&'static str, Uid), Slot>>,
}

impl IdentityMap {
    /// Returns the cached instance or loads one with `load`.
    ///
    /// The map lock is held while loading, so two concurrent lookups of the
    /// same key never produce two instances. Asking for update access upgrades
    /// an entry that was first loaded read-only; it never downgrades.
    pub(crate) async fn get_or_load<E, F, Fut>(&self, uid: &Uid, for_update: bool, load: F) -> Result<Shared<E>>
    where
        E: Entity,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<E>>,
    {
        let mut seen = self.seen.lock().await;
        let key = (E::NAME, uid.clone());

        if let Some(slot) = seen.get_mut(&key) {
            slot.for_update |= for_update;
            return slot
                .entity
                .clone()
                .into_any()
                .downcast::<Mutex<E>>()
                .map_err(|_| Error::TypeMismatch {
                    collection: E::NAME.to_string(),
                    uid: uid.clone(),
                });
        }

        let entity: Shared<E> = Arc::new(Mutex::new(load().await?));
        seen.insert(
            key,
            Slot {
                entity: entity.clone(),
                for_update,
            },
        );

        Ok(entity)
    }

    /// Snapshots every entity that was requested for update.
    pub(crate) async fn dirty(&self) -> Result<Vec<Update>> {
        let seen = self.seen.lock().await;
        let mut updates = Vec::new();
        for slot in seen.values().filter(|slot| slot.for_update) {
            updates.push(slot.entity.encode().await?);
        }
        Ok(updates)
    }
}
