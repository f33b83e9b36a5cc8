//! # Repository
//!
//! Versioned persistence for [`Entity`] values. The repository knows nothing
//! about concrete databases: it converts entities to [`Document`]s and hands
//! batches of [`Update`]s to a [`Storage`] backend, which must apply a batch
//! atomically and reject it when any version check fails.
//!
//! Collections are named after the entity's component name and grouped by
//! [`Subdomain`].

mod backup;
mod codec;
mod memory;
mod sqlite;

pub use backup::Backup;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::domain::{Entity, Subdomain, Uid};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Stored form of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uid,
    pub ver: u64,
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// A conditional write of one entity.
///
/// Succeeds only if the stored version equals `expected_ver` and the stored
/// timestamp is not later than `timestamp`. An `expected_ver` of zero means
/// the document must not exist yet. On success the stored version becomes
/// `expected_ver + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub collection: &'static str,
    pub id: Uid,
    pub expected_ver: u64,
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Backend that stores documents.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn load(&self, namespace: &str, collection: &str, id: &Uid) -> Result<Option<Document>>;

    /// Every document of a collection, ordered by id.
    async fn load_all(&self, namespace: &str, collection: &str) -> Result<Vec<Document>>;

    /// Applies all updates or none of them.
    async fn save(&self, namespace: &str, updates: Vec<Update>) -> Result<()>;
}

/// Storage bound to one subdomain.
#[derive(Clone)]
pub struct Repo {
    storage: Arc<dyn Storage>,
    subdomain: Subdomain,
}

impl Repo {
    pub fn new(storage: Arc<dyn Storage>, subdomain: Subdomain) -> Self {
        Self { storage, subdomain }
    }

    pub fn subdomain(&self) -> Subdomain {
        self.subdomain
    }

    /// Loads an entity, or builds its zero value (version 0, start timestamp)
    /// when nothing is stored under `uid`.
    pub async fn get<E: Entity>(&self, uid: &Uid) -> Result<E> {
        match self.storage.load(self.subdomain.as_str(), E::NAME, uid).await? {
            Some(doc) => codec::decode(doc),
            None => {
                debug!(subdomain = %self.subdomain, collection = E::NAME, %uid, "Creating new entity");
                codec::zero(uid)
            }
        }
    }

    pub async fn save(&self, updates: Vec<Update>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        debug!(subdomain = %self.subdomain, count = updates.len(), "Saving entities");
        self.storage.save(self.subdomain.as_str(), updates).await
    }
}

pub(crate) use codec::encode;
