//! In-process KV store with the same semantics as the Redis backend.
//!
//! One mutex over the whole state makes every operation atomic, including
//! the conditional remove. Map TTLs are tracked as deadlines and purged
//! lazily on access. Used by tests and by `--embedded` single-node runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{KvError, KvResult, KvStore, RemoveOutcome};

#[derive(Default)]
struct MemoryState {
    zsets: HashMap<String, HashMap<String, f64>>,
    maps: HashMap<String, HashMap<String, String>>,
    map_deadlines: HashMap<String, Instant>,
}

impl MemoryState {
    fn purge_if_expired(&mut self, key: &str) {
        if let Some(deadline) = self.map_deadlines.get(key) {
            if Instant::now() >= *deadline {
                self.maps.remove(key);
                self.map_deadlines.remove(key);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryKv {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail as transiently unavailable.
    /// Lets tests exercise the degradation paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> KvResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(KvError::TransientUnavailable(
                "memory kv forced unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn zset_upsert(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zset_score(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.zsets.get(key).and_then(|z| z.get(member)).copied())
    }

    async fn zset_range_below(
        &self,
        key: &str,
        upper: f64,
        limit: usize,
    ) -> KvResult<Vec<String>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let Some(zset) = state.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, f64)> = zset
            .iter()
            .filter(|(_, score)| **score <= upper)
            .map(|(m, s)| (m, *s))
            .collect();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(members
            .into_iter()
            .take(limit)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zset_remove_if_below(
        &self,
        key: &str,
        member: &str,
        threshold: f64,
    ) -> KvResult<RemoveOutcome> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(RemoveOutcome::Aborted(None));
        };
        match zset.get(member).copied() {
            None => Ok(RemoveOutcome::Aborted(None)),
            Some(score) if score < threshold => {
                zset.remove(member);
                Ok(RemoveOutcome::Removed)
            }
            Some(score) => Ok(RemoveOutcome::Aborted(Some(score))),
        }
    }

    async fn map_set_fields(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_if_expired(key);
        let map = state.maps.entry(key.to_string()).or_default();
        for (field, value) in fields {
            map.insert(field.to_string(), value.clone());
        }
        if let Some(ttl) = ttl {
            state
                .map_deadlines
                .insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn map_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_if_expired(key);
        Ok(state.maps.get(key).cloned().unwrap_or_default())
    }

    async fn map_get_field(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.purge_if_expired(key);
        Ok(state.maps.get(key).and_then(|m| m.get(field)).cloned())
    }

    async fn ping(&self) -> KvResult<()> {
        self.check_available()
    }
}
