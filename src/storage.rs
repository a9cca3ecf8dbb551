//! Durable persistence for cloud variable maps.
//!
//! Each project or user identity owns one key holding a JSON object that
//! maps variable names to values. The store is treated as an external
//! collaborator: reads that fail are "no prior data", writes are
//! best-effort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Key-value blob store holding serialized variable maps.
#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Fetch the payload stored under `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrite the payload stored under `key`.
    async fn write(&self, key: &str, payload: Vec<u8>) -> Result<()>;
}

/// Open the backend selected by configuration: the literal `memory` gives
/// the in-memory store, anything else is treated as a Redis URL.
pub async fn open_store(url: &str) -> Result<Arc<dyn CloudStore>> {
    if url == "memory" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Ok(Arc::new(RedisStore::connect(url).await?))
    }
}

/// Redis-backed store; save paths map directly to Redis string keys.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl CloudStore for RedisStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.redis.clone();
        let payload: Option<Vec<u8>> = conn.get(key).await?;
        Ok(payload)
    }

    async fn write(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, payload).await?;
        Ok(())
    }
}

/// In-memory store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes observed; lets tests assert save coalescing.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn write(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.entries.lock().unwrap().insert(key.to_string(), payload);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
