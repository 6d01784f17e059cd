//! Presence Store - Liveness and semantic status over the KV
//!
//! Liveness is a scored set of `(user, expiry)` records; semantic status
//! (online/away) lives in a per-user field map so that away survives
//! heartbeats and late subscribers can snapshot. A user is effectively
//! online iff their liveness record exists with an unexpired score — the
//! field map never overrides an expired record.

pub mod leaderboard;
pub mod reaper;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PresenceConfig;
use crate::kv::{KvError, KvResult, KvStore, RemoveOutcome};

pub type UserId = i64;

pub const FIELD_STATUS: &str = "status";
pub const FIELD_UPDATED_TS: &str = "updated_ts";
pub const FIELD_LAST_HEARTBEAT_TS: &str = "last_heartbeat_ts";
pub const FIELD_LAST_SEEN_TS: &str = "last_seen_ts";

/// Reported presence status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Away,
    Offline,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => "online",
            Status::Away => "away",
            Status::Offline => "offline",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Status::Online),
            "away" => Ok(Status::Away),
            "offline" => Ok(Status::Offline),
            _ => Err(()),
        }
    }
}

/// What a store operation did. Callers publish to the bus only on
/// `TransitionedTo` — the debounce that keeps 30 s heartbeats from
/// re-announcing an already-online user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    TransitionedTo(Status),
    Refreshed,
    Unchanged,
    Ignored,
}

/// Stateless façade over the KV primitives.
pub struct PresenceStore {
    kv: Arc<dyn KvStore>,
    settings: PresenceConfig,
}

impl PresenceStore {
    pub fn new(kv: Arc<dyn KvStore>, settings: PresenceConfig) -> Self {
        Self { kv, settings }
    }

    pub fn settings(&self) -> &PresenceConfig {
        &self.settings
    }

    pub fn shard_for(&self, user: UserId) -> u32 {
        let shards = self.settings.num_shards.max(1);
        (user.unsigned_abs() % shards as u64) as u32
    }

    pub fn online_key_for_shard(&self, shard: u32) -> String {
        if self.settings.num_shards <= 1 {
            self.settings.scored_set_key_prefix.clone()
        } else {
            format!("{}:{}", self.settings.scored_set_key_prefix, shard)
        }
    }

    pub fn online_key_for_user(&self, user: UserId) -> String {
        self.online_key_for_shard(self.shard_for(user))
    }

    pub fn state_key(&self, user: UserId) -> String {
        format!("{}:{}", self.settings.state_key_prefix, user)
    }

    fn state_ttl(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.settings.state_ttl_seconds))
    }

    /// Refresh the liveness record. Returns `TransitionedTo(Online)` only
    /// when the user was previously expired or absent; heartbeats inside
    /// the window are `Refreshed` and rate-limited ones `Ignored`.
    pub async fn record_heartbeat(&self, user: UserId, now: i64) -> KvResult<Effect> {
        let state_key = self.state_key(user);

        // Best-effort rate limit: read-then-write races cost one extra
        // upsert per window at worst.
        if let Some(last) = self.kv.map_get_field(&state_key, FIELD_LAST_HEARTBEAT_TS).await? {
            if let Ok(last_ts) = last.parse::<i64>() {
                if now - last_ts < self.settings.min_interval_seconds {
                    return Ok(Effect::Ignored);
                }
            }
        }

        let key = self.online_key_for_user(user);
        let member = user.to_string();
        let was_online = self
            .kv
            .zset_score(&key, &member)
            .await?
            .map(|score| score >= now as f64)
            .unwrap_or(false);

        let expiry = (now + self.settings.heartbeat_window_seconds) as f64;
        self.kv.zset_upsert(&key, &member, expiry).await?;
        self.kv
            .map_set_fields(
                &state_key,
                &[(FIELD_LAST_HEARTBEAT_TS, now.to_string())],
                self.state_ttl(),
            )
            .await?;

        if was_online {
            Ok(Effect::Refreshed)
        } else {
            // Offline -> online resets any stale away state.
            self.write_status(user, Status::Online, now, true).await?;
            Ok(Effect::TransitionedTo(Status::Online))
        }
    }

    /// Record a semantic transition (online/away) for an effectively
    /// online user. Liveness is owned by heartbeats; this never touches
    /// the scored set.
    pub async fn set_semantic(&self, user: UserId, target: Status, now: i64) -> KvResult<Effect> {
        if target == Status::Offline {
            // Offline is derived by the reaper, never requested.
            return Ok(Effect::Ignored);
        }

        let key = self.online_key_for_user(user);
        let member = user.to_string();
        let online = self
            .kv
            .zset_score(&key, &member)
            .await?
            .map(|score| score >= now as f64)
            .unwrap_or(false);
        if !online {
            return Ok(Effect::Ignored);
        }

        let current = self
            .kv
            .map_get_field(&self.state_key(user), FIELD_STATUS)
            .await?
            .and_then(|s| s.parse::<Status>().ok());
        if current == Some(target) {
            return Ok(Effect::Unchanged);
        }

        self.write_status(user, target, now, false).await?;
        Ok(Effect::TransitionedTo(target))
    }

    /// Reaper path: atomically remove an expired liveness record and mark
    /// the user offline. `Unchanged` means a concurrent heartbeat won the
    /// race and the field map was left alone.
    pub async fn confirm_offline(&self, user: UserId, now: i64) -> KvResult<Effect> {
        let key = self.online_key_for_user(user);
        let member = user.to_string();
        match self
            .kv
            .zset_remove_if_below(&key, &member, now as f64)
            .await?
        {
            RemoveOutcome::Removed => {
                self.write_status(user, Status::Offline, now, true).await?;
                Ok(Effect::TransitionedTo(Status::Offline))
            }
            RemoveOutcome::Aborted(_) => Ok(Effect::Unchanged),
        }
    }

    /// Effective status per the liveness-wins rule. A fatal KV failure
    /// degrades to `(offline, now)` rather than fabricating liveness;
    /// transient failures propagate so callers can retry or 503.
    pub async fn effective_status(&self, user: UserId, now: i64) -> KvResult<(Status, i64)> {
        match self.effective_status_inner(user, now).await {
            Ok(result) => Ok(result),
            Err(KvError::Fatal(e)) => {
                warn!("kv fatal during status read for {}; reporting offline: {}", user, e);
                Ok((Status::Offline, now))
            }
            Err(e) => Err(e),
        }
    }

    async fn effective_status_inner(&self, user: UserId, now: i64) -> KvResult<(Status, i64)> {
        let key = self.online_key_for_user(user);
        let member = user.to_string();
        let score = self.kv.zset_score(&key, &member).await?;
        let online = score.map(|s| s >= now as f64).unwrap_or(false);

        let state_key = self.state_key(user);
        if !online {
            let last_seen = self
                .kv
                .map_get_field(&state_key, FIELD_LAST_SEEN_TS)
                .await?
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(now);
            return Ok((Status::Offline, last_seen));
        }

        let state = self.kv.map_get_all(&state_key).await?;
        let status = state
            .get(FIELD_STATUS)
            .and_then(|s| s.parse::<Status>().ok())
            .unwrap_or(Status::Online);
        let ts = state
            .get(FIELD_UPDATED_TS)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(now);
        Ok((status, ts))
    }

    /// Status for snapshot paths that must never fail: any KV trouble
    /// reads as offline.
    pub async fn effective_status_or_offline(&self, user: UserId, now: i64) -> (Status, i64) {
        self.effective_status(user, now)
            .await
            .unwrap_or((Status::Offline, now))
    }

    /// Statuses for a batch of users, reads issued concurrently.
    pub async fn effective_status_many(
        &self,
        users: &[UserId],
        now: i64,
    ) -> KvResult<Vec<(UserId, Status, i64)>> {
        let reads = users.iter().map(|&user| async move {
            let (status, ts) = self.effective_status(user, now).await?;
            Ok::<_, KvError>((user, status, ts))
        });
        future::try_join_all(reads).await
    }

    /// Expired liveness candidates in one shard, oldest first.
    pub async fn expired_candidates(
        &self,
        shard: u32,
        now: i64,
        limit: usize,
    ) -> KvResult<Vec<UserId>> {
        let key = self.online_key_for_shard(shard);
        let members = self.kv.zset_range_below(&key, now as f64, limit).await?;
        Ok(members
            .into_iter()
            .filter_map(|m| match m.parse::<UserId>() {
                Ok(user) => Some(user),
                Err(_) => {
                    warn!("dropping non-numeric liveness member {:?} in {}", m, key);
                    None
                }
            })
            .collect())
    }

    /// Display name from the profile map, when mirrored into the KV.
    pub async fn profile_name(&self, user: UserId) -> KvResult<Option<String>> {
        self.kv
            .map_get_field(&format!("profile:{}", user), "display_name")
            .await
    }

    /// Write a status transition with its timestamp, refusing to move
    /// `updated_ts` backwards.
    async fn write_status(
        &self,
        user: UserId,
        status: Status,
        now: i64,
        touch_last_seen: bool,
    ) -> KvResult<bool> {
        let state_key = self.state_key(user);
        if let Some(existing) = self.kv.map_get_field(&state_key, FIELD_UPDATED_TS).await? {
            if let Ok(ts) = existing.parse::<i64>() {
                if ts > now {
                    return Ok(false);
                }
            }
        }

        let mut fields = vec![
            (FIELD_STATUS, status.to_string()),
            (FIELD_UPDATED_TS, now.to_string()),
        ];
        if touch_last_seen {
            fields.push((FIELD_LAST_SEEN_TS, now.to_string()));
        }
        self.kv
            .map_set_fields(&state_key, &fields, self.state_ttl())
            .await?;
        Ok(true)
    }
}
