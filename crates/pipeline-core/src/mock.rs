//! # Test Doubles
//!
//! In-memory stand-ins for the external collaborators of the core: a
//! notification sink that records what it was sent and a storage wrapper that
//! can be told to fail. Both are cheap to clone and share their state between
//! clones, so a test keeps one copy for assertions and hands the other to the
//! code under test.
//!
//! ```rust
//! use pipeline_core::mock::RecordingSink;
//! use pipeline_core::notify::NotificationSink;
//!
//! #[tokio::main]
//! async fn main() {
//!     let sink = RecordingSink::default();
//!     sink.send("hello").await.unwrap();
//!     assert_eq!(sink.messages(), vec!["hello"]);
//! }
//! ```

use crate::domain::Uid;
use crate::error::{Error, Result};
use crate::notify::{NotificationSink, Notifier};
use crate::repository::{Document, MemoryStorage, Storage, Update};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Notification sink that keeps every message in memory.
#[derive(Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, message: &str) -> Result<()> {
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

/// Spawns a notifier with a 1 ms interval that delivers into a fresh
/// [`RecordingSink`]. The worker stops when `cancel` fires.
pub fn recording_notifier(cancel: CancellationToken) -> (Notifier, RecordingSink) {
    let sink = RecordingSink::default();
    let (notifier, worker) = Notifier::new(Arc::new(sink.clone()), Duration::from_millis(1));
    tokio::spawn(worker.run(cancel));
    (notifier, sink)
}

/// Storage wrapper that fails a configurable number of upcoming loads or saves.
#[derive(Clone)]
pub struct FlakyStorage {
    inner: Arc<dyn Storage>,
    failing_loads: Arc<AtomicUsize>,
    failing_saves: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

impl FlakyStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            failing_loads: Arc::default(),
            failing_saves: Arc::default(),
            saves: Arc::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// The next `count` loads fail with a storage error.
    pub fn fail_next_loads(&self, count: usize) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// The next `count` saves fail with a storage error.
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn load(&self, namespace: &str, collection: &str, id: &Uid) -> Result<Option<Document>> {
        if take_failure(&self.failing_loads) {
            return Err(Error::storage("injected load failure"));
        }
        self.inner.load(namespace, collection, id).await
    }

    async fn load_all(&self, namespace: &str, collection: &str) -> Result<Vec<Document>> {
        if take_failure(&self.failing_loads) {
            return Err(Error::storage("injected load failure"));
        }
        self.inner.load_all(namespace, collection).await
    }

    async fn save(&self, namespace: &str, updates: Vec<Update>) -> Result<()> {
        if take_failure(&self.failing_saves) {
            return Err(Error::storage("injected save failure"));
        }

        self.inner.save(namespace, updates).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
