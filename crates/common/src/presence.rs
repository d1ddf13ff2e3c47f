//! Presence registry: which users currently hold a live connection.
//!
//! The registry only indexes connections; it never owns their lifetime. The
//! backing [`PresenceStore`] is shared across every instance so presence is
//! consistent cluster-wide.
//!
//! Redis layout:
//! - `user:{user_id}`: set of connection ids
//! - `connection:{connection_id}`: owning user id
//! - `push:{connection_id}`: pub/sub channel the connection's socket listens on
//!
//! Both keys are mutated by one Lua script per operation, so a concurrent
//! connect/disconnect can never leave the two indexes disagreeing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;

use crate::error::AppError;

/// Shared storage capability behind the presence registry.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Index `connection_id` under `user_id`, moving it if another user held it.
    async fn add(&self, user_id: &str, connection_id: &str) -> Result<(), AppError>;

    /// Remove `connection_id` and return the user that owned it.
    async fn remove(&self, connection_id: &str) -> Result<Option<String>, AppError>;

    /// All connections currently indexed under `user_id`.
    async fn connections(&self, user_id: &str) -> Result<HashSet<String>, AppError>;

    /// Number of connections indexed under `user_id`.
    async fn connection_count(&self, user_id: &str) -> Result<usize, AppError>;
}

/// Cluster-wide view of user presence.
#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self { store }
    }

    /// Registry over a process-local store (single instance deployments, tests).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryPresenceStore::new()))
    }

    /// Register a live connection. Idempotent.
    pub async fn connect(&self, user_id: &str, connection_id: &str) -> Result<(), AppError> {
        self.store.add(user_id, connection_id).await?;
        tracing::debug!(user_id, connection_id, "Connection registered");
        Ok(())
    }

    /// Drop a connection; the user goes offline when their last one is removed.
    pub async fn disconnect(&self, connection_id: &str) -> Result<Option<String>, AppError> {
        let owner = self.store.remove(connection_id).await?;
        match &owner {
            Some(user_id) => tracing::debug!(user_id = %user_id, connection_id, "Connection removed"),
            None => tracing::debug!(connection_id, "Disconnect for unknown connection"),
        }
        Ok(owner)
    }

    pub async fn is_online(&self, user_id: &str) -> Result<bool, AppError> {
        Ok(self.store.connection_count(user_id).await? > 0)
    }

    pub async fn connections_of(&self, user_id: &str) -> Result<HashSet<String>, AppError> {
        self.store.connections(user_id).await
    }
}

/// Pub/sub channel carrying pushes for one live connection.
pub fn push_channel(connection_id: &str) -> String {
    format!("push:{}", connection_id)
}

fn user_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}

fn connection_key(connection_id: &str) -> String {
    format!("connection:{}", connection_id)
}

/// KEYS[1] = user:{user}, KEYS[2] = connection:{conn}; ARGV[1] = user, ARGV[2] = conn
const CONNECT_SCRIPT: &str = r#"
local previous = redis.call('GET', KEYS[2])
if previous and previous ~= ARGV[1] then
    redis.call('SREM', 'user:' .. previous, ARGV[2])
end
redis.call('SADD', KEYS[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[1])
return 1
"#;

/// KEYS[1] = connection:{conn}; ARGV[1] = conn. Returns the owning user or nil.
const DISCONNECT_SCRIPT: &str = r#"
local owner = redis.call('GET', KEYS[1])
if not owner then
    return false
end
redis.call('SREM', 'user:' .. owner, ARGV[1])
redis.call('DEL', KEYS[1])
return owner
"#;

/// Redis-backed presence store shared by every instance.
#[derive(Clone)]
pub struct RedisPresenceStore {
    redis: ConnectionManager,
    connect: Arc<redis::Script>,
    disconnect: Arc<redis::Script>,
}

impl RedisPresenceStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            connect: Arc::new(redis::Script::new(CONNECT_SCRIPT)),
            disconnect: Arc::new(redis::Script::new(DISCONNECT_SCRIPT)),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add(&self, user_id: &str, connection_id: &str) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let _: i64 = self
            .connect
            .key(user_key(user_id))
            .key(connection_key(connection_id))
            .arg(user_id)
            .arg(connection_id)
            .invoke_async(&mut redis)
            .await?;
        Ok(())
    }

    async fn remove(&self, connection_id: &str) -> Result<Option<String>, AppError> {
        let mut redis = self.redis.clone();
        let owner: Option<String> = self
            .disconnect
            .key(connection_key(connection_id))
            .arg(connection_id)
            .invoke_async(&mut redis)
            .await?;
        Ok(owner)
    }

    async fn connections(&self, user_id: &str) -> Result<HashSet<String>, AppError> {
        let mut redis = self.redis.clone();
        let members: HashSet<String> = redis.smembers(user_key(user_id)).await?;
        Ok(members)
    }

    async fn connection_count(&self, user_id: &str) -> Result<usize, AppError> {
        let mut redis = self.redis.clone();
        let count: usize = redis.scard(user_key(user_id)).await?;
        Ok(count)
    }
}

#[derive(Default)]
struct PresenceIndex {
    users: HashMap<String, HashSet<String>>,
    connections: HashMap<String, String>,
}

/// Process-local presence store. One lock guards both indexes.
#[derive(Default)]
pub struct InMemoryPresenceStore {
    index: RwLock<PresenceIndex>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn add(&self, user_id: &str, connection_id: &str) -> Result<(), AppError> {
        let mut index = self.index.write().await;
        let previous = index
            .connections
            .insert(connection_id.to_string(), user_id.to_string());

        if let Some(previous) = previous.filter(|p| p != user_id)
            && let Some(set) = index.users.get_mut(&previous)
        {
            set.remove(connection_id);
            if set.is_empty() {
                index.users.remove(&previous);
            }
        }

        index
            .users
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        Ok(())
    }

    async fn remove(&self, connection_id: &str) -> Result<Option<String>, AppError> {
        let mut index = self.index.write().await;
        let Some(owner) = index.connections.remove(connection_id) else {
            return Ok(None);
        };
        if let Some(set) = index.users.get_mut(&owner) {
            set.remove(connection_id);
            if set.is_empty() {
                index.users.remove(&owner);
            }
        }
        Ok(Some(owner))
    }

    async fn connections(&self, user_id: &str) -> Result<HashSet<String>, AppError> {
        let index = self.index.read().await;
        Ok(index.users.get(user_id).cloned().unwrap_or_default())
    }

    async fn connection_count(&self, user_id: &str) -> Result<usize, AppError> {
        let index = self.index.read().await;
        Ok(index.users.get(user_id).map_or(0, HashSet::len))
    }
}
