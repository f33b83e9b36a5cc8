//! # Unit of Work
//!
//! A [`Ctx`] is the scope every handler, DAG node and task action runs in. It
//! owns an identity map of the entities loaded so far and buffers the events
//! published by the action. When the action succeeds the scope is committed:
//! entities requested for update are saved in one atomic batch and only then
//! are the buffered events released to the bus. When the action fails the
//! scope is dropped and nothing is written or published.

mod identity_map;

pub use identity_map::Shared;

use crate::bus::{Bus, Envelope};
use crate::domain::{Entity, Event, Request, Subdomain, Uid};
use crate::error::Result;
use crate::repository::Repo;
use identity_map::IdentityMap;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Context of a single unit of work.
///
/// # Architecture Note
/// Within one `Ctx`, every [`get`](Ctx::get) for the same entity returns the
/// same [`Shared`] handle, so concurrent sub-tasks of an action see each
/// other's changes. The entity lock serializes those changes.
///
/// Saving is optimistic: an entity carries the version it was loaded at, and
/// the save fails with [`Error::VersionConflict`](crate::Error::VersionConflict)
/// if someone else committed in between.
pub struct Ctx {
    component: String,
    repo: Repo,
    identity_map: IdentityMap,
    bus: Bus,
    events: Mutex<Vec<Envelope>>,
}

impl Ctx {
    pub(crate) fn new(bus: Bus, subdomain: Subdomain, component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            repo: Repo::new(bus.storage(), subdomain),
            identity_map: IdentityMap::default(),
            bus,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn subdomain(&self) -> Subdomain {
        self.repo.subdomain()
    }

    /// Returns the entity with `uid`, loading it on first access.
    ///
    /// Pass `for_update = true` to have the entity saved on commit.
    pub async fn get<E: Entity>(&self, uid: impl Into<Uid>, for_update: bool) -> Result<Shared<E>> {
        let uid = uid.into();
        self.identity_map
            .get_or_load(&uid, for_update, || self.repo.get::<E>(&uid))
            .await
    }

    /// Buffers an event until the scope commits.
    pub fn publish<E: Event>(&self, event: E) {
        self.events.lock().push(Envelope::new(event));
    }

    /// Sends a request to its handler and waits for the response.
    ///
    /// The handler runs in its own unit of work.
    pub async fn request<R: Request>(&self, request: R) -> Result<R::Response> {
        self.bus.request(request).await
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        info!(component = %self.component, "{}", msg.as_ref());
    }

    /// Logs a warning and forwards it to the operator notification channel.
    pub fn warn(&self, msg: impl AsRef<str>) {
        self.bus.warn(&self.component, msg.as_ref());
    }

    /// Saves entities requested for update, then releases buffered events.
    pub async fn commit(self) -> Result<()> {
        let updates = self.identity_map.dirty().await?;
        self.repo.save(updates).await?;

        let events = std::mem::take(&mut *self.events.lock());
        for envelope in events {
            self.bus.dispatch(envelope);
        }
        Ok(())
    }

    /// Commits on success and discards the scope on failure.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(component = %self.component, error = %err, "Discarding unit of work");
                Err(err)
            }
        }
    }
}

/// Builds fresh [`Ctx`] scopes bound to one subdomain.
#[derive(Clone)]
pub struct CtxFactory {
    bus: Bus,
    subdomain: Subdomain,
}

impl CtxFactory {
    pub(crate) fn new(bus: Bus, subdomain: Subdomain) -> Self {
        Self { bus, subdomain }
    }

    pub fn create(&self, component: impl Into<String>) -> Ctx {
        Ctx::new(self.bus.clone(), self.subdomain, component)
    }

    pub fn info(&self, component: &str, msg: impl AsRef<str>) {
        info!(component, "{}", msg.as_ref());
    }

    pub fn warn(&self, component: &str, msg: impl AsRef<str>) {
        self.bus.warn(component, msg.as_ref());
    }
}
