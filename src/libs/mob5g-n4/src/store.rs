//! Keyed Store
//!
//! Minimal persistence contract for association and session records, with an
//! in-process implementation and a MongoDB-backed one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use mongodb::{
    bson::{doc, DateTime, Document},
    options::{ClientOptions, ReplaceOptions},
    Client, Collection,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{StoreBackend, StoreConfig};

/// Store error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("MongoDB error: {0}")]
    MongoDb(#[from] mongodb::error::Error),
    #[error("Record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Put/Get/Delete contract used to persist N4 state
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    /// Fetch the value under `key`; expired and absent keys read as `None`
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remove `key`; removing an absent key succeeds
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Live keys starting with `prefix`, in no particular order
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Serialize `record` as JSON and store it under `key`
pub async fn put_record<T: Serialize + Sync>(
    store: &dyn KeyedStore,
    key: &str,
    record: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let value = serde_json::to_string(record)?;
    store.put(key, value, ttl).await
}

/// Fetch and deserialize the JSON record under `key`
pub async fn get_record<T: DeserializeOwned>(store: &dyn KeyedStore, key: &str) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}

/// Every decodable record whose key starts with `prefix`.
///
/// Records that fail to decode are logged and skipped.
pub async fn load_records<T: DeserializeOwned>(store: &dyn KeyedStore, prefix: &str) -> StoreResult<Vec<T>> {
    let mut records = Vec::new();
    for key in store.keys(prefix).await? {
        match get_record(store, &key).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => log::warn!("Skipping record {key}: {e}"),
        }
    }
    Ok(records)
}

/// In-process store
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .await
            .values()
            .filter(|(_, expires_at)| expires_at.map_or(true, |t| t > now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.records.lock().await.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut records = self.records.lock().await;
        let expired = match records.get(key) {
            Some((_, Some(expires_at))) => *expires_at <= Instant::now(),
            Some((_, None)) => false,
            None => return Ok(None),
        };
        if expired {
            records.remove(key);
            return Ok(None);
        }
        Ok(records.get(key).map(|(value, _)| value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.records.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|(key, (_, expires_at))| key.starts_with(prefix) && expires_at.map_or(true, |t| t > now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Mask credentials in database URI for logging
fn masked_db_uri(db_uri: &str) -> String {
    match db_uri.find('@') {
        Some(at_pos) => format!("mongodb://*****:*****@{}", &db_uri[at_pos + 1..]),
        None => db_uri.to_string(),
    }
}

/// MongoDB-backed store
///
/// Records live in the `n4_records` collection as `{_id, value, expires_at}`.
pub struct MongoStore {
    collection: Collection<Document>,
}

impl MongoStore {
    pub const COLLECTION: &'static str = "n4_records";

    /// Connect and verify the server answers a ping
    pub async fn connect(db_uri: &str) -> StoreResult<Self> {
        if db_uri.is_empty() {
            return Err(StoreError::Unavailable("no database URI".to_string()));
        }

        let client_options = ClientOptions::parse(db_uri).await?;
        let db_name = client_options
            .default_database
            .clone()
            .unwrap_or_else(|| "mob5g".to_string());
        let client = Client::with_options(client_options)?;
        let database = client.database(&db_name);

        if let Err(e) = database.run_command(doc! { "ping": 1 }, None).await {
            log::warn!("Failed to connect to server [{}]: {}", masked_db_uri(db_uri), e);
            return Err(e.into());
        }
        log::info!("MongoDB URI: '{}'", masked_db_uri(db_uri));

        Ok(Self {
            collection: database.collection(Self::COLLECTION),
        })
    }
}

#[async_trait]
impl KeyedStore for MongoStore {
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| DateTime::from_system_time(SystemTime::now() + ttl));
        let record = doc! { "_id": key, "value": value, "expires_at": expires_at };
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection
            .replace_one(doc! { "_id": key }, record, options)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let record = match self.collection.find_one(doc! { "_id": key }, None).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        if let Ok(expires_at) = record.get_datetime("expires_at") {
            if expires_at.to_system_time() <= SystemTime::now() {
                return Ok(None);
            }
        }

        record
            .get_str("value")
            .map(|value| Some(value.to_string()))
            .map_err(|e| StoreError::Malformed {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.collection.delete_one(doc! { "_id": key }, None).await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let filter = doc! { "_id": { "$regex": format!("^{}", escape_regex(prefix)) } };
        let mut cursor = self.collection.find(filter, None).await?;
        let now = SystemTime::now();
        let mut keys = Vec::new();

        while cursor.advance().await? {
            let record = cursor.current();
            if let Ok(expires_at) = record.get_datetime("expires_at") {
                if expires_at.to_system_time() <= now {
                    continue;
                }
            }
            match record.get_str("_id") {
                Ok(key) => keys.push(key.to_string()),
                Err(e) => log::warn!("Record without string key in {}: {e}", Self::COLLECTION),
            }
        }
        Ok(keys)
    }
}

/// Escape everything but ASCII alphanumerics for a literal regex match
fn escape_regex(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len() * 2);
    for c in literal.chars() {
        if !c.is_ascii_alphanumeric() && c.is_ascii() {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Open the store selected by `config`
pub async fn open_store(config: &StoreConfig) -> StoreResult<Arc<dyn KeyedStore>> {
    match config.backend {
        StoreBackend::Memory => {
            log::info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Mongo => {
            let db_uri = config
                .db_uri
                .as_deref()
                .ok_or_else(|| StoreError::Unavailable("no database URI".to_string()))?;
            Ok(Arc::new(MongoStore::connect(db_uri).await?))
        }
    }
}
