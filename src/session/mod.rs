//! Session Module - Per-process socket registry
//!
//! One entry per accepted presence socket. The registry's lock is written
//! only on connect and disconnect; per-session counters are atomics inside
//! the shared handle so the hot path never takes the write lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::presence::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketId(Uuid);

impl SocketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Live session metadata shared between the registry and the session task.
pub struct SessionInfo {
    pub socket_id: SocketId,
    pub user_id: UserId,
    pub connected_at: i64,
    subscriptions: AtomicUsize,
}

impl SessionInfo {
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    pub fn set_subscription_count(&self, count: usize) {
        self.subscriptions.store(count, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SocketId, Arc<SessionInfo>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: UserId, connected_at: i64) -> Arc<SessionInfo> {
        let info = Arc::new(SessionInfo {
            socket_id: SocketId::new(),
            user_id,
            connected_at,
            subscriptions: AtomicUsize::new(0),
        });
        self.sessions
            .write()
            .await
            .insert(info.socket_id, info.clone());
        info
    }

    pub async fn remove(&self, socket_id: SocketId) {
        self.sessions.write().await.remove(&socket_id);
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Sockets currently held by one user (multi-device).
    pub async fn sockets_for_user(&self, user_id: UserId) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .count()
    }

    pub async fn total_subscriptions(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.subscription_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_remove() {
        let registry = SessionRegistry::new();
        let info = registry.insert(7, 1000).await;
        assert_eq!(registry.count().await, 1);
        assert_eq!(info.user_id, 7);

        registry.remove(info.socket_id).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_multiple_sockets_per_user() {
        let registry = SessionRegistry::new();
        let a = registry.insert(7, 1000).await;
        let _b = registry.insert(7, 1001).await;
        let _c = registry.insert(8, 1002).await;

        assert_eq!(registry.sockets_for_user(7).await, 2);
        assert_eq!(registry.sockets_for_user(8).await, 1);

        registry.remove(a.socket_id).await;
        assert_eq!(registry.sockets_for_user(7).await, 1);
    }

    #[tokio::test]
    async fn test_subscription_counts_aggregate() {
        let registry = SessionRegistry::new();
        let a = registry.insert(7, 1000).await;
        let b = registry.insert(8, 1001).await;
        a.set_subscription_count(3);
        b.set_subscription_count(2);
        assert_eq!(registry.total_subscriptions().await, 5);
    }
}
