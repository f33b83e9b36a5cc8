use super::{Document, Storage, Update};
use crate::domain::Uid;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    namespace TEXT NOT NULL,
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    ver INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (namespace, collection, id)
);
";

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::storage(err)
    }
}

/// [`Storage`] backed by a single SQLite file.
///
/// Each save runs in one transaction. Version checks are part of the write
/// statements themselves, so a conflicting update changes zero rows and the
/// whole transaction is rolled back.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening document storage");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(Error::storage)?
    }
}

fn to_micros(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::storage(format!("timestamp out of range: {micros}")))
}

fn document(collection: &str, id: Uid, ver: i64, timestamp: i64, body: &str) -> Result<Document> {
    let fields: Map<String, Value> = serde_json::from_str(body).map_err(|source| Error::Codec {
        collection: collection.to_string(),
        uid: id.clone(),
        source,
    })?;

    Ok(Document {
        id,
        ver: ver as u64,
        timestamp: from_micros(timestamp)?,
        fields,
    })
}

fn conflict(update: &Update) -> Error {
    Error::VersionConflict {
        collection: update.collection.to_string(),
        uid: update.id.clone(),
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn load(&self, namespace: &str, collection: &str, id: &Uid) -> Result<Option<Document>> {
        let namespace = namespace.to_string();
        let collection = collection.to_string();
        let id = id.clone();

        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT ver, timestamp, body FROM documents
                     WHERE namespace = ?1 AND collection = ?2 AND id = ?3",
                    params![namespace, collection, id.as_str()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?)),
                )
                .optional()?;

            match row {
                Some((ver, timestamp, body)) => Ok(Some(document(&collection, id, ver, timestamp, &body)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn load_all(&self, namespace: &str, collection: &str) -> Result<Vec<Document>> {
        let namespace = namespace.to_string();
        let collection = collection.to_string();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ver, timestamp, body FROM documents
                 WHERE namespace = ?1 AND collection = ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![namespace, collection], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut docs = Vec::new();
            for row in rows {
                let (id, ver, timestamp, body) = row?;
                docs.push(document(&collection, Uid::new(id), ver, timestamp, &body)?);
            }
            Ok(docs)
        })
        .await
    }

    async fn save(&self, namespace: &str, updates: Vec<Update>) -> Result<()> {
        let namespace = namespace.to_string();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            for update in &updates {
                let body = serde_json::to_string(&update.fields).map_err(|source| Error::Codec {
                    collection: update.collection.to_string(),
                    uid: update.id.clone(),
                    source,
                })?;
                let timestamp = to_micros(update.timestamp);

                let changed = if update.expected_ver == 0 {
                    tx.execute(
                        "INSERT OR IGNORE INTO documents (namespace, collection, id, ver, timestamp, body)
                         VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                        params![namespace, update.collection, update.id.as_str(), timestamp, body],
                    )?
                } else {
                    tx.execute(
                        "UPDATE documents SET ver = ver + 1, timestamp = ?1, body = ?2
                         WHERE namespace = ?3 AND collection = ?4 AND id = ?5
                           AND ver = ?6 AND timestamp <= ?1",
                        params![
                            timestamp,
                            body,
                            namespace,
                            update.collection,
                            update.id.as_str(),
                            update.expected_ver as i64
                        ],
                    )?
                };

                if changed != 1 {
                    return Err(conflict(update));
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::start_timestamp;
    use chrono::Duration;
    use serde_json::json;

    fn update(ver: u64, timestamp: DateTime<Utc>, value: i64) -> Update {
        let mut fields = Map::new();
        fields.insert("value".into(), json!(value));
        Update {
            collection: "Counter",
            id: Uid::new("c"),
            expected_ver: ver,
            timestamp,
            fields,
        }
    }

    #[tokio::test]
    async fn versions_increase_on_each_save() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let t0 = start_timestamp();

        storage.save("data", vec![update(0, t0, 1)]).await.unwrap();
        storage.save("data", vec![update(1, t0, 2)]).await.unwrap();

        let doc = storage.load("data", "Counter", &Uid::new("c")).await.unwrap().unwrap();
        assert_eq!(doc.ver, 2);
        assert_eq!(doc.fields["value"], json!(2));
        assert_eq!(doc.timestamp, t0);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let t0 = start_timestamp();
        storage.save("data", vec![update(0, t0, 1)]).await.unwrap();

        let err = storage.save("data", vec![update(0, t0, 5)]).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn older_timestamp_is_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let t1 = start_timestamp() + Duration::days(10);
        storage.save("data", vec![update(0, t1, 1)]).await.unwrap();

        let err = storage
            .save("data", vec![update(1, t1 - Duration::days(1), 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let t0 = start_timestamp();
        let mut other = update(0, t0, 7);
        other.id = Uid::new("other");

        let err = storage.save("data", vec![other, update(4, t0, 1)]).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
        assert!(storage.load("data", "Counter", &Uid::new("other")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn namespaces_are_separate() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save("data", vec![update(0, start_timestamp(), 1)]).await.unwrap();
        assert!(storage.load("portfolio", "Counter", &Uid::new("c")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn whole_collection_is_listed_by_id() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let t0 = start_timestamp();
        let mut second = update(0, t0, 2);
        second.id = Uid::new("b");
        let mut first = update(0, t0, 1);
        first.id = Uid::new("a");
        storage.save("data", vec![second, first]).await.unwrap();
        storage.save("portfolio", vec![update(0, t0, 9)]).await.unwrap();

        let docs = storage.load_all("data", "Counter").await.unwrap();
        let values: Vec<_> = docs.iter().map(|doc| (doc.id.as_str(), doc.fields["value"].clone())).collect();
        assert_eq!(values, vec![("a", json!(1)), ("b", json!(2))]);
        assert!(storage.load_all("data", "Quotes").await.unwrap().is_empty());
    }
}
