//! # Domain Vocabulary
//!
//! Base traits for everything that flows through the bus and the repository.
//! Entities, events and requests are all [`Component`]s: each carries a stable
//! name that is used for routing and as a storage collection name.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Returns the last path segment of a type name, e.g. `Portfolio` for
/// `pipeline_app::portfolio::Portfolio`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

/// Timestamp of a freshly created entity. Any real update is later than this.
pub fn start_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1997, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Something with a stable name.
pub trait Component {
    const NAME: &'static str;
}

/// Identifier of an entity inside its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    /// Uid of a singleton entity: the entity's own component name.
    pub fn singleton<E: Component>() -> Self {
        Self(E::NAME.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

impl From<String> for Uid {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

/// Identity plus the version that was read from storage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Revision {
    pub uid: Uid,
    pub ver: u64,
}

/// Logical namespace that groups collections, e.g. `data` or `portfolio`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subdomain(&'static str);

impl Subdomain {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A versioned, persistable domain object.
///
/// # Architecture Note
/// Entities serialize to a flat JSON object. Two fields are owned by the
/// repository rather than by the entity body: `rev` (identity and version) and
/// `timestamp` (the as-of time of the data). Implementors keep them as plain
/// struct fields named exactly `rev` and `timestamp`; the codec lifts them out
/// on save and puts them back on load.
///
/// A zero-value entity is produced by deserializing an object that only holds
/// `rev` and `timestamp`, so every other field needs a serde default. The usual
/// way is `#[derive(Default)]` plus `#[serde(default)]` on the struct.
pub trait Entity: Component + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn rev(&self) -> &Revision;

    fn timestamp(&self) -> DateTime<Utc>;

    fn uid(&self) -> &Uid {
        &self.rev().uid
    }

    fn ver(&self) -> u64 {
        self.rev().ver
    }
}

/// Immutable fact published on the bus.
pub trait Event: Component + fmt::Debug + Send + Sync + 'static {}

/// Query that is answered by exactly one handler.
pub trait Request: Component + fmt::Debug + Send + 'static {
    type Response: Send + 'static;
}
