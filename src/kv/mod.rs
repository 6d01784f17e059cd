//! KV Adapter - Typed wrapper over the shared key/value store
//!
//! Two primitives back the whole presence plane: a scored set holding
//! `(user, expiry)` liveness records, and per-user field maps holding the
//! semantic state. The conditional remove runs server-side as one
//! transactional unit; see [`KvStore::zset_remove_if_below`].

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

/// Errors surfaced to KV callers. Transient errors are retryable at the
/// caller's next natural trigger; fatal errors escalate to health reporting.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key or member not found")]
    NotFound,
    #[error("kv transiently unavailable: {0}")]
    TransientUnavailable(String),
    #[error("kv fatal: {0}")]
    Fatal(String),
}

impl KvError {
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::TransientUnavailable(_))
    }
}

pub type KvResult<T> = Result<T, KvError>;

/// Result of the atomic conditional remove.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RemoveOutcome {
    /// The member existed with score strictly below the threshold and was
    /// removed in the same transactional unit.
    Removed,
    /// Nothing was removed; carries the observed score, `None` if the
    /// member was absent.
    Aborted(Option<f64>),
}

/// The store primitives the presence plane is built on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or update `member` with `score`.
    async fn zset_upsert(&self, key: &str, member: &str, score: f64) -> KvResult<()>;

    /// Current score of `member`, `None` if absent.
    async fn zset_score(&self, key: &str, member: &str) -> KvResult<Option<f64>>;

    /// Up to `limit` members with score <= `upper`, in non-decreasing
    /// score order.
    async fn zset_range_below(&self, key: &str, upper: f64, limit: usize)
        -> KvResult<Vec<String>>;

    /// Atomically remove `member` iff its score is strictly below
    /// `threshold`. Implementations MUST execute the read-check-remove as a
    /// single server-side unit; racing it on the client loses the
    /// reaper-vs-heartbeat race.
    async fn zset_remove_if_below(
        &self,
        key: &str,
        member: &str,
        threshold: f64,
    ) -> KvResult<RemoveOutcome>;

    /// Set fields on the map at `key`, refreshing its TTL when given.
    async fn map_set_fields(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> KvResult<()>;

    /// All fields of the map at `key`; empty map if absent.
    async fn map_get_all(&self, key: &str) -> KvResult<HashMap<String, String>>;

    /// One field of the map at `key`.
    async fn map_get_field(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    /// Liveness probe against the store.
    async fn ping(&self) -> KvResult<()>;
}
