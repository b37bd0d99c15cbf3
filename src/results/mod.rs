//! Short-TTL cache correlating job ids with their outcomes.
//!
//! Workers write a job's predictions under `"{task_name}:{job_id}"`; status
//! queries read them back until the TTL expires. Absence is a normal,
//! expected outcome, never an error. The backing store is assumed safe for
//! concurrent access, so this layer adds no locking of its own.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

/// Key-value cache with per-entry TTL.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> Result<()>;

    /// `None` means absent or expired.
    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    async fn delete(&self, key: &str);
}

struct CacheEntry {
    /// Serialized value; cached values are advisory, so a payload that no
    /// longer parses is handed back as raw text instead of an error.
    raw: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process result cache.
///
/// Expired entries are dropped lazily on read and swept periodically by a
/// background task so unread results do not accumulate.
pub struct MemoryResultCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryResultCache {
    pub fn new(cleanup_interval: Duration) -> Self {
        let entries: Arc<DashMap<String, CacheEntry>> = Arc::new(DashMap::new());
        let sweeper = Some(Self::start_sweeper(Arc::clone(&entries), cleanup_interval));
        Self { entries, sweeper }
    }

    fn start_sweeper(
        entries: Arc<DashMap<String, CacheEntry>>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let expired: Vec<String> = entries
                    .iter()
                    .filter(|entry| entry.is_expired())
                    .map(|entry| entry.key().clone())
                    .collect();
                let removed = expired
                    .into_iter()
                    .filter(|key| entries.remove(key).is_some())
                    .count();
                if removed > 0 {
                    debug!(removed, "result cache sweep dropped expired entries");
                }
            }
        })
    }
}

impl Drop for MemoryResultCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                raw,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => {
                let value = serde_json::from_str(&entry.raw)
                    .unwrap_or_else(|_| serde_json::Value::String(entry.raw.clone()));
                return Some(value);
            }
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    async fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}
