//! Document store boundary. Collections are keyed by the mirrored object's uid (`_uid`).

// System
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

// Third Party
use async_trait::async_trait;
use mongodb::{
    bson::{doc, DateTime, Document},
    options::ReplaceOptions,
    Client, Collection, Database,
};
use serde_json::Value;
use tracing::info;

// Local
use crate::error::{Result, SyncError};

pub const UID_FIELD: &str = "_uid";
/// RFC 3339 strings in this field are stored as BSON datetimes.
pub const TIMESTAMP_FIELD: &str = "_timestamp";

/// Which documents a delete applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidFilter {
    /// Exactly the document with this uid.
    Is(String),
    /// Every document whose uid is not in the set.
    NotIn(HashSet<String>),
}

impl UidFilter {
    pub fn matches(&self, uid: &str) -> bool {
        match self {
            UidFilter::Is(wanted) => wanted == uid,
            UidFilter::NotIn(keep) => !keep.contains(uid),
        }
    }

    fn to_bson(&self) -> Document {
        match self {
            UidFilter::Is(uid) => doc! { UID_FIELD: uid },
            UidFilter::NotIn(keep) => {
                let keep: Vec<&str> = keep.iter().map(String::as_str).collect();
                doc! { UID_FIELD: { "$nin": keep } }
            }
        }
    }
}

/// Must be safe for concurrent use: every reconciler task shares one store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replace the document stored under `uid`, creating it if absent.
    async fn upsert(&self, collection: &str, uid: &str, document: Value) -> Result<()>;

    /// Returns the number of deleted documents.
    async fn delete_where(&self, collection: &str, filter: &UidFilter) -> Result<u64>;

    /// Append a document that has no identity of its own.
    async fn insert(&self, collection: &str, document: Value) -> Result<()>;
}

fn to_bson_document(document: &Value) -> Result<Document> {
    let mut document = mongodb::bson::to_document(document)?;
    let timestamp = document
        .get_str(TIMESTAMP_FIELD)
        .ok()
        .and_then(|text| DateTime::parse_rfc3339_str(text).ok());
    if let Some(timestamp) = timestamp {
        document.insert(TIMESTAMP_FIELD, timestamp);
    }
    Ok(document)
}

pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        info!(database, "Connected to MongoDB");
        Ok(Self {
            database: client.database(database),
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn upsert(&self, collection: &str, uid: &str, document: Value) -> Result<()> {
        let replacement = to_bson_document(&document)?;
        self.collection(collection)
            .replace_one(
                doc! { UID_FIELD: uid },
                replacement,
                ReplaceOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }

    async fn delete_where(&self, collection: &str, filter: &UidFilter) -> Result<u64> {
        let result = self
            .collection(collection)
            .delete_many(filter.to_bson(), None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn insert(&self, collection: &str, document: Value) -> Result<()> {
        let document = to_bson_document(&document)?;
        self.collection(collection).insert_one(document, None).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryCollections {
    keyed: HashMap<String, BTreeMap<String, Value>>,
    appended: HashMap<String, Vec<Value>>,
}

/// In-process store with the same upsert/delete/insert semantics as `MongoStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryCollections>,
    writes: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryCollections>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Store("memory store lock poisoned".to_string()))
    }

    fn count_write(&self) {
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
    }

    /// Seed a document without counting it as a write.
    pub fn seed(&self, collection: &str, uid: &str, document: Value) {
        if let Ok(mut inner) = self.inner.lock() {
            inner
                .keyed
                .entry(collection.to_string())
                .or_default()
                .insert(uid.to_string(), document);
        }
    }

    pub fn get(&self, collection: &str, uid: &str) -> Option<Value> {
        let inner = self.inner.lock().ok()?;
        inner.keyed.get(collection)?.get(uid).cloned()
    }

    /// Sorted uids currently stored in a keyed collection.
    pub fn uids(&self, collection: &str) -> Vec<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| {
                inner
                    .keyed
                    .get(collection)
                    .map(|docs| docs.keys().cloned().collect())
            })
            .unwrap_or_default()
    }

    pub fn appended(&self, collection: &str) -> Vec<Value> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.appended.get(collection).cloned())
            .unwrap_or_default()
    }

    /// Number of upserts, deletes and inserts performed through `DocumentStore`.
    pub fn write_count(&self) -> u64 {
        self.writes.lock().map(|w| *w).unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert(&self, collection: &str, uid: &str, document: Value) -> Result<()> {
        self.lock()?
            .keyed
            .entry(collection.to_string())
            .or_default()
            .insert(uid.to_string(), document);
        self.count_write();
        Ok(())
    }

    async fn delete_where(&self, collection: &str, filter: &UidFilter) -> Result<u64> {
        let mut inner = self.lock()?;
        let deleted = match inner.keyed.get_mut(collection) {
            Some(docs) => {
                let before = docs.len();
                docs.retain(|uid, _| !filter.matches(uid));
                (before - docs.len()) as u64
            }
            None => 0,
        };
        drop(inner);
        self.count_write();
        Ok(deleted)
    }

    async fn insert(&self, collection: &str, document: Value) -> Result<()> {
        self.lock()?
            .appended
            .entry(collection.to_string())
            .or_default()
            .push(document);
        self.count_write();
        Ok(())
    }
}
