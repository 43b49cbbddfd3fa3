//! Snapshot Persistence
//!
//! The conversation store is mirrored into an external key-value collaborator
//! after every mutation batch, and reloaded from it on startup.
//!
//! # Architecture
//!
//! ```text
//!   ChatClient ──snapshot──► StorePersister ──spawn──► PersistenceStore
//!                                 │                     (get/set/delete/clear)
//!                                 └── "{namespace}:conversations"
//!                                     "{namespace}:messages"
//! ```
//!
//! Writes are fire-and-forget: a failed or slow write never blocks or fails a
//! live send. Failures are logged here and otherwise ignored. Stream sessions
//! are never persisted; an in-flight stream does not survive a reload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::PersistenceConfig;
use crate::conversation::{Conversation, StoreSnapshot};
use crate::messages::{ConversationId, Message};

/// Asynchronous key-value collaborator
///
/// Every method reports success as a boolean; implementations log their own
/// failures.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Read a value; `None` when absent or expired
    async fn get(&self, key: &str) -> Option<Value>;

    /// Write a value with an optional lifetime
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool;

    /// Remove a value
    async fn delete(&self, key: &str) -> bool;

    /// Remove every value
    async fn clear(&self) -> bool;
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory collaborator with per-entry TTL
///
/// Expired entries are dropped lazily when read.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Option<Duration>,
}

impl MemoryStore {
    /// Create an empty store whose entries never expire by default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store applying `ttl` when a write gives none
    #[must_use]
    pub fn with_default_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl: Some(ttl),
        }
    }

    /// Number of stored entries, expired ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().remove(key);
        None
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        // A TTL too large to represent never expires
        let expires_at = ttl
            .or(self.default_ttl)
            .and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        true
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    async fn clear(&self) -> bool {
        self.entries.write().clear();
        true
    }
}

/// Mirrors store snapshots into a [`PersistenceStore`]
#[derive(Clone)]
pub struct StorePersister {
    store: Arc<dyn PersistenceStore>,
    namespace: String,
    ttl: Option<Duration>,
    sequence: Arc<AtomicU64>,
    written: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for StorePersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorePersister")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl StorePersister {
    /// Create a persister writing under the configured namespace
    pub fn new(store: Arc<dyn PersistenceStore>, config: &PersistenceConfig) -> Self {
        Self {
            store,
            namespace: config.namespace.clone(),
            ttl: config.ttl,
            sequence: Arc::default(),
            written: Arc::default(),
        }
    }

    /// Key holding the conversation list
    #[must_use]
    pub fn conversations_key(&self) -> String {
        format!("{}:conversations", self.namespace)
    }

    /// Key holding messages by conversation
    #[must_use]
    pub fn messages_key(&self) -> String {
        format!("{}:messages", self.namespace)
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write a snapshot in the background
    ///
    /// Serialization happens immediately; the writes run on the current tokio
    /// runtime. Outside a runtime the snapshot is skipped. A write that lands
    /// after a newer snapshot's write is discarded.
    pub fn save(&self, snapshot: &StoreSnapshot) {
        let Some((conversations, messages)) = encode(snapshot) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime, skipping snapshot write");
            return;
        };

        let seq = self.next_seq();
        let this = self.clone();
        runtime.spawn(async move {
            this.write(seq, conversations, messages).await;
        });
    }

    /// Write a snapshot and wait for the result
    pub async fn save_now(&self, snapshot: &StoreSnapshot) -> bool {
        let Some((conversations, messages)) = encode(snapshot) else {
            return false;
        };
        let seq = self.next_seq();
        self.write(seq, conversations, messages).await
    }

    async fn write(&self, seq: u64, conversations: Value, messages: Value) -> bool {
        let mut written = self.written.lock().await;
        if seq < *written {
            tracing::debug!(seq, latest = *written, "Discarding stale snapshot");
            return true;
        }
        *written = seq;

        let ok = self
            .store
            .set(&self.conversations_key(), conversations, self.ttl)
            .await
            && self.store.set(&self.messages_key(), messages, self.ttl).await;
        if !ok {
            tracing::warn!(namespace = %self.namespace, "Failed to persist conversation snapshot");
        }
        ok
    }

    /// Load the last persisted snapshot
    ///
    /// Returns `None` when nothing was persisted or the stored data does not
    /// decode.
    pub async fn rehydrate(&self) -> Option<StoreSnapshot> {
        let conversations = self.store.get(&self.conversations_key()).await?;
        let conversations: Vec<Conversation> = match serde_json::from_value(conversations) {
            Ok(conversations) => conversations,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable persisted conversations");
                return None;
            }
        };

        let messages = match self.store.get(&self.messages_key()).await {
            Some(value) => match serde_json::from_value::<HashMap<ConversationId, Vec<Message>>>(
                value,
            ) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring unreadable persisted messages");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        tracing::info!(
            conversations = conversations.len(),
            "Rehydrated conversation store"
        );
        Some(StoreSnapshot {
            conversations,
            messages,
        })
    }

    /// Delete both keys in the background
    ///
    /// The clear is ordered against saves at the time of the call, so a
    /// snapshot saved right after it still lands.
    pub fn clear_storage(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime, skipping storage clear");
            return;
        };
        let seq = self.next_seq();
        let this = self.clone();
        runtime.spawn(async move {
            this.clear(seq).await;
        });
    }

    /// Delete both keys and wait for the result
    pub async fn clear_storage_now(&self) -> bool {
        let seq = self.next_seq();
        self.clear(seq).await
    }

    async fn clear(&self, seq: u64) -> bool {
        let mut written = self.written.lock().await;
        if seq < *written {
            tracing::debug!(seq, latest = *written, "Skipping superseded clear");
            return true;
        }
        // Anything queued before the clear must not resurrect the data
        *written = seq;

        let conversations = self.store.delete(&self.conversations_key()).await;
        let messages = self.store.delete(&self.messages_key()).await;
        conversations || messages
    }
}

fn encode(snapshot: &StoreSnapshot) -> Option<(Value, Value)> {
    let encode_both = || -> serde_json::Result<(Value, Value)> {
        Ok((
            serde_json::to_value(&snapshot.conversations)?,
            serde_json::to_value(&snapshot.messages)?,
        ))
    };
    match encode_both() {
        Ok(values) => Some(values),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode conversation snapshot");
            None
        }
    }
}
