use super::{Document, Storage, Update};
use crate::domain::Uid;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

type Key = (String, String, Uid);

/// In-process [`Storage`] used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStorage {
    docs: Mutex<HashMap<Key, Document>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(namespace: &str, collection: &str, id: &Uid) -> Key {
    (namespace.to_string(), collection.to_string(), id.clone())
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, namespace: &str, collection: &str, id: &Uid) -> Result<Option<Document>> {
        let docs = self.docs.lock().await;
        Ok(docs.get(&key(namespace, collection, id)).cloned())
    }

    async fn load_all(&self, namespace: &str, collection: &str) -> Result<Vec<Document>> {
        let docs = self.docs.lock().await;
        let mut found: Vec<Document> = docs
            .iter()
            .filter(|((ns, col, _), _)| ns == namespace && col == collection)
            .map(|(_, doc)| doc.clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn save(&self, namespace: &str, updates: Vec<Update>) -> Result<()> {
        let mut docs = self.docs.lock().await;

        for update in &updates {
            let stored = docs.get(&key(namespace, update.collection, &update.id));
            let accepted = match stored {
                None => update.expected_ver == 0,
                Some(doc) => doc.ver == update.expected_ver && doc.timestamp <= update.timestamp,
            };
            if !accepted {
                return Err(Error::VersionConflict {
                    collection: update.collection.to_string(),
                    uid: update.id.clone(),
                });
            }
        }

        for update in updates {
            docs.insert(
                key(namespace, update.collection, &update.id),
                Document {
                    id: update.id,
                    ver: update.expected_ver + 1,
                    timestamp: update.timestamp,
                    fields: update.fields,
                },
            );
        }

        Ok(())
    }
}
