use super::{Document, Storage, Update};
use crate::domain::Subdomain;
use crate::error::{Error, Result};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// JSON dumps of whole collections, one file per collection under
/// `<dir>/<subdomain>/<collection>.json`.
///
/// Restoring only touches collections that are empty in storage. Restored
/// documents keep their ids, timestamps and fields; their versions start
/// over at 1.
#[derive(Clone)]
pub struct Backup {
    storage: Arc<dyn Storage>,
    dir: PathBuf,
}

impl Backup {
    pub fn new(storage: Arc<dyn Storage>, dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            dir: dir.into(),
        }
    }

    fn path(&self, subdomain: Subdomain, collection: &str) -> PathBuf {
        self.dir.join(subdomain.as_str()).join(format!("{collection}.json"))
    }

    /// Overwrites the dump of every listed collection.
    pub async fn backup(&self, subdomain: Subdomain, collections: &[&'static str]) -> Result<()> {
        for &collection in collections {
            let docs = self.storage.load_all(subdomain.as_str(), collection).await?;
            let body = serde_json::to_vec_pretty(&docs).map_err(Error::storage)?;

            let path = self.path(subdomain, collection);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(Error::storage)?;
            }
            tokio::fs::write(&path, body).await.map_err(Error::storage)?;
            info!(%subdomain, collection, documents = docs.len(), "Backup completed");
        }
        Ok(())
    }

    /// Fills empty collections from their dumps and returns the number of
    /// restored documents. Missing dumps are skipped with a warning.
    pub async fn restore(&self, subdomain: Subdomain, collections: &[&'static str]) -> Result<usize> {
        let mut restored = 0;

        for &collection in collections {
            if !self.storage.load_all(subdomain.as_str(), collection).await?.is_empty() {
                continue;
            }

            let path = self.path(subdomain, collection);
            let body = match tokio::fs::read(&path).await {
                Ok(body) => body,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!(%subdomain, collection, path = %path.display(), "No backup to restore");
                    continue;
                }
                Err(err) => return Err(Error::storage(err)),
            };
            let docs: Vec<Document> = serde_json::from_slice(&body).map_err(Error::storage)?;
            if docs.is_empty() {
                continue;
            }

            let updates: Vec<Update> = docs
                .into_iter()
                .map(|doc| Update {
                    collection,
                    id: doc.id,
                    expected_ver: 0,
                    timestamp: doc.timestamp,
                    fields: doc.fields,
                })
                .collect();
            restored += updates.len();
            info!(%subdomain, collection, documents = updates.len(), "Restoring from backup");
            self.storage.save(subdomain.as_str(), updates).await?;
        }

        Ok(restored)
    }
}
