//! Graph Adapter - Mutual-follow authorization
//!
//! Presence subscriptions are gated on mutual follow. The social graph
//! itself lives elsewhere; this adapter only answers "is (a, b) mutually
//! followed" and "who are a's mutuals", with a bounded positive-answer
//! cache to absorb subscribe bursts.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::presence::UserId;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("follow graph unavailable: {0}")]
    Unavailable(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

#[async_trait]
pub trait FollowGraph: Send + Sync {
    /// True iff both `a -> b` and `b -> a` follow edges exist.
    async fn is_mutual(&self, a: UserId, b: UserId) -> GraphResult<bool>;

    /// All users mutually followed with `a`.
    async fn mutuals_of(&self, a: UserId) -> GraphResult<Vec<UserId>>;
}

/// Follow edges mirrored into the KV as sets: `following:<uid>` holds the
/// users `uid` follows, `followers:<uid>` the users following `uid`.
pub struct RedisGraph {
    conn: MultiplexedConnection,
}

impl RedisGraph {
    pub async fn connect(url: &str) -> GraphResult<RedisGraph> {
        let client =
            redis::Client::open(url).map_err(|e| GraphError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;
        Ok(RedisGraph { conn })
    }

    fn following_key(user: UserId) -> String {
        format!("following:{}", user)
    }

    fn followers_key(user: UserId) -> String {
        format!("followers:{}", user)
    }
}

#[async_trait]
impl FollowGraph for RedisGraph {
    async fn is_mutual(&self, a: UserId, b: UserId) -> GraphResult<bool> {
        let mut conn = self.conn.clone();

        // Short-circuit: no a->b edge means no mutual, skip the second probe.
        let a_follows_b: bool = redis::cmd("SISMEMBER")
            .arg(Self::following_key(a))
            .arg(b)
            .query_async(&mut conn)
            .await
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;
        if !a_follows_b {
            return Ok(false);
        }

        let b_follows_a: bool = redis::cmd("SISMEMBER")
            .arg(Self::following_key(b))
            .arg(a)
            .query_async(&mut conn)
            .await
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;
        Ok(b_follows_a)
    }

    async fn mutuals_of(&self, a: UserId) -> GraphResult<Vec<UserId>> {
        let mut conn = self.conn.clone();
        let members: Vec<UserId> = redis::cmd("SINTER")
            .arg(Self::following_key(a))
            .arg(Self::followers_key(a))
            .query_async(&mut conn)
            .await
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;
        Ok(members)
    }
}

/// Caching wrapper: positive answers only, bounded LRU, fixed TTL.
///
/// Negatives are never cached — a cached "no" would spuriously deny a
/// subscribe right after the follow-back lands.
pub struct CachedGraph<G> {
    inner: G,
    cache: RwLock<LruCache<(UserId, UserId), Instant>>,
    ttl: Duration,
}

impl<G: FollowGraph> CachedGraph<G> {
    pub fn new(inner: G, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner,
            cache: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            ttl,
        }
    }

    pub fn with_defaults(inner: G) -> Self {
        Self::new(inner, 10_000, Duration::from_secs(60))
    }

    // Mutuality is symmetric; one cache entry serves both directions.
    fn cache_key(a: UserId, b: UserId) -> (UserId, UserId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

#[async_trait]
impl<G: FollowGraph> FollowGraph for CachedGraph<G> {
    async fn is_mutual(&self, a: UserId, b: UserId) -> GraphResult<bool> {
        let key = Self::cache_key(a, b);
        {
            let mut cache = self.cache.write().await;
            if let Some(cached_at) = cache.get(&key) {
                if cached_at.elapsed() < self.ttl {
                    return Ok(true);
                }
                cache.pop(&key);
            }
        }

        let mutual = self.inner.is_mutual(a, b).await?;
        if mutual {
            self.cache.write().await.put(key, Instant::now());
        }
        Ok(mutual)
    }

    async fn mutuals_of(&self, a: UserId) -> GraphResult<Vec<UserId>> {
        self.inner.mutuals_of(a).await
    }
}

/// In-process graph for tests and embedded runs.
#[derive(Default)]
pub struct MemoryGraph {
    follows: RwLock<HashMap<UserId, HashSet<UserId>>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn follow(&self, follower: UserId, followee: UserId) {
        self.follows
            .write()
            .await
            .entry(follower)
            .or_default()
            .insert(followee);
    }

    pub async fn unfollow(&self, follower: UserId, followee: UserId) {
        if let Some(set) = self.follows.write().await.get_mut(&follower) {
            set.remove(&followee);
        }
    }
}

#[async_trait]
impl FollowGraph for MemoryGraph {
    async fn is_mutual(&self, a: UserId, b: UserId) -> GraphResult<bool> {
        let follows = self.follows.read().await;
        let a_follows_b = follows.get(&a).map(|s| s.contains(&b)).unwrap_or(false);
        if !a_follows_b {
            return Ok(false);
        }
        Ok(follows.get(&b).map(|s| s.contains(&a)).unwrap_or(false))
    }

    async fn mutuals_of(&self, a: UserId) -> GraphResult<Vec<UserId>> {
        let follows = self.follows.read().await;
        let Some(following) = follows.get(&a) else {
            return Ok(Vec::new());
        };
        let mut mutuals: Vec<UserId> = following
            .iter()
            .filter(|other| {
                follows
                    .get(other)
                    .map(|s| s.contains(&a))
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        mutuals.sort_unstable();
        Ok(mutuals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGraph {
        inner: MemoryGraph,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FollowGraph for CountingGraph {
        async fn is_mutual(&self, a: UserId, b: UserId) -> GraphResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.is_mutual(a, b).await
        }

        async fn mutuals_of(&self, a: UserId) -> GraphResult<Vec<UserId>> {
            self.inner.mutuals_of(a).await
        }
    }

    #[tokio::test]
    async fn test_mutual_requires_both_edges() {
        let graph = MemoryGraph::new();
        graph.follow(3, 7).await;
        assert!(!graph.is_mutual(3, 7).await.unwrap());
        graph.follow(7, 3).await;
        assert!(graph.is_mutual(3, 7).await.unwrap());
        assert!(graph.is_mutual(7, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_mutuals_of_lists_reciprocated_follows() {
        let graph = MemoryGraph::new();
        graph.follow(1, 2).await;
        graph.follow(2, 1).await;
        graph.follow(1, 3).await;
        graph.follow(3, 1).await;
        graph.follow(1, 4).await; // not reciprocated
        assert_eq!(graph.mutuals_of(1).await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_cache_serves_positive_answers() {
        let inner = MemoryGraph::new();
        inner.follow(3, 7).await;
        inner.follow(7, 3).await;
        let counting = CountingGraph {
            inner,
            calls: AtomicUsize::new(0),
        };
        let cached = CachedGraph::with_defaults(counting);

        assert!(cached.is_mutual(3, 7).await.unwrap());
        assert!(cached.is_mutual(7, 3).await.unwrap()); // symmetric key, cache hit
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_never_stores_negatives() {
        let inner = MemoryGraph::new();
        inner.follow(3, 7).await;
        let counting = CountingGraph {
            inner,
            calls: AtomicUsize::new(0),
        };
        let cached = CachedGraph::with_defaults(counting);

        assert!(!cached.is_mutual(3, 7).await.unwrap());
        // Follow-back lands; the next check must see it immediately.
        cached.inner.inner.follow(7, 3).await;
        assert!(cached.is_mutual(3, 7).await.unwrap());
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_entries_expire() {
        let inner = MemoryGraph::new();
        inner.follow(3, 7).await;
        inner.follow(7, 3).await;
        let counting = CountingGraph {
            inner,
            calls: AtomicUsize::new(0),
        };
        let cached = CachedGraph::new(counting, 16, Duration::from_secs(60));

        assert!(cached.is_mutual(3, 7).await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cached.is_mutual(3, 7).await.unwrap());
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }
}
