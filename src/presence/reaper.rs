//! Reaper Loop - Offline detection by polling expired liveness records
//!
//! One cooperative loop sweeps every shard: range-scan the scored set for
//! expired members, confirm each through the store's atomic conditional
//! remove, and publish the offline transition for confirmed ones. The
//! conditional remove is what makes the publish at-most-once per
//! transition — a concurrent heartbeat aborts the remove and no envelope
//! goes out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::bus::{status_topic, Envelope, FanoutBus};
use crate::config::ReaperConfig;
use crate::kv::KvResult;
use crate::metrics;
use crate::presence::{Effect, PresenceStore, Status};

pub struct Reaper {
    store: Arc<PresenceStore>,
    bus: Arc<dyn FanoutBus>,
    poll_interval: Duration,
    batch_size: usize,
    shards: Vec<u32>,
}

impl Reaper {
    pub fn new(store: Arc<PresenceStore>, bus: Arc<dyn FanoutBus>, config: &ReaperConfig) -> Self {
        let shards = (0..store.settings().num_shards.max(1)).collect();
        Self {
            store,
            bus,
            poll_interval: Duration::from_secs_f64(config.poll_interval_seconds),
            batch_size: config.batch_size,
            shards,
        }
    }

    /// Restrict the sweep to a single shard; lets one reaper process per
    /// shard run side by side.
    pub fn with_shard(mut self, shard: u32) -> Self {
        self.shards = vec![shard];
        self
    }

    /// Run until `shutdown` flips to true. Shutdown is observed between
    /// ticks only; a tick that has started always completes, which keeps
    /// the at-most-one-publish-per-transition property intact.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // Randomize the phase so two reapers on the same shard rarely
        // scan simultaneously.
        let poll_ms = self.poll_interval.as_millis().max(1) as u64;
        let jitter = Duration::from_millis(rand::random::<u64>() % poll_ms);
        tokio::select! {
            _ = sleep(jitter) => {}
            _ = shutdown.changed() => return,
        }

        info!(
            "presence reaper started: shards={:?} poll_interval={:?} batch_size={}",
            self.shards, self.poll_interval, self.batch_size
        );

        loop {
            let processed = match self.tick().await {
                Ok(n) => n,
                Err(e) if e.is_transient() => {
                    warn!("reaper tick aborted on transient kv error: {}", e);
                    0
                }
                Err(e) => {
                    warn!("reaper tick failed: {}", e);
                    0
                }
            };

            if *shutdown.borrow() {
                break;
            }

            // A full batch means there is likely a backlog; go straight
            // into the next tick instead of sleeping.
            if processed >= self.batch_size {
                continue;
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("presence reaper stopped");
    }

    /// Sweep the configured shards once at the current wall clock.
    pub async fn tick(&self) -> KvResult<usize> {
        self.tick_at(chrono::Utc::now().timestamp()).await
    }

    /// Sweep the configured shards once at a caller-provided clock reading.
    pub async fn tick_at(&self, now: i64) -> KvResult<usize> {
        let mut processed = 0;
        for &shard in &self.shards {
            processed += self.reap_shard(shard, now).await?;
        }
        Ok(processed)
    }

    async fn reap_shard(&self, shard: u32, now: i64) -> KvResult<usize> {
        let candidates = self
            .store
            .expired_candidates(shard, now, self.batch_size)
            .await?;

        for &user in &candidates {
            match self.store.confirm_offline(user, now).await {
                Ok(Effect::TransitionedTo(Status::Offline)) => {
                    metrics::REAPED_TOTAL.inc();
                    metrics::TRANSITIONS_TOTAL
                        .with_label_values(&[Status::Offline.as_str()])
                        .inc();
                    let envelope = Envelope::status_changed(user, Status::Offline, now);
                    if let Err(e) = self.bus.publish(&status_topic(user), envelope).await {
                        // Not retried: the user's next transition
                        // reconciles observers within one window.
                        metrics::PUBLISH_FAILURES_TOTAL.inc();
                        warn!("offline publish for {} dropped: {}", user, e);
                    }
                }
                Ok(_) => debug!("heartbeat for {} won the race, skipping", user),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!("confirm offline for {} failed: {}", user, e),
            }
        }

        Ok(candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::PresenceConfig;
    use crate::kv::{KvStore, MemoryKv};

    fn fixture() -> (Arc<MemoryKv>, Arc<PresenceStore>, Arc<LocalBus>, Reaper) {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(PresenceStore::new(kv.clone(), PresenceConfig::default()));
        let bus = Arc::new(LocalBus::default());
        let reaper = Reaper::new(store.clone(), bus.clone(), &ReaperConfig::default());
        (kv, store, bus, reaper)
    }

    #[tokio::test]
    async fn test_expired_user_is_reaped_and_published() {
        let (kv, store, bus, reaper) = fixture();
        store.record_heartbeat(7, 1000).await.unwrap();
        let mut rx = bus.join("status:7").await.unwrap();

        let processed = reaper.tick_at(1031).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(kv.zset_score("onlineUsers", "7").await.unwrap(), None);
        assert_eq!(
            store.effective_status(7, 1032).await.unwrap(),
            (Status::Offline, 1031)
        );

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.user_id, 7);
        assert_eq!(envelope.status, Status::Offline);
        assert_eq!(envelope.ts, 1031);
    }

    #[tokio::test]
    async fn test_live_users_are_left_alone() {
        let (_, store, _, reaper) = fixture();
        store.record_heartbeat(7, 1000).await.unwrap();
        let processed = reaper.tick_at(1010).await.unwrap();
        assert_eq!(processed, 0);
        assert_eq!(
            store.effective_status(7, 1010).await.unwrap().0,
            Status::Online
        );
    }

    #[tokio::test]
    async fn test_racing_heartbeat_suppresses_offline_publish() {
        let (_, store, bus, reaper) = fixture();
        store.record_heartbeat(7, 1000).await.unwrap();
        let mut rx = bus.join("status:7").await.unwrap();

        // The reaper would observe (7, 1030) as expired at t=1031, but a
        // heartbeat refreshes the record before the sweep runs.
        store.record_heartbeat(7, 1031).await.unwrap();
        reaper.tick_at(1031).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(
            store.effective_status(7, 1032).await.unwrap().0,
            Status::Online
        );
    }

    #[tokio::test]
    async fn test_each_transition_publishes_exactly_once() {
        let (_, store, bus, reaper) = fixture();
        store.record_heartbeat(7, 1000).await.unwrap();
        let mut rx = bus.join("status:7").await.unwrap();

        reaper.tick_at(1031).await.unwrap();
        // Second sweep finds nothing: the record is gone.
        reaper.tick_at(1032).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().status, Status::Offline);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transient_kv_error_aborts_tick() {
        let (kv, store, _, reaper) = fixture();
        store.record_heartbeat(7, 1000).await.unwrap();
        kv.set_failing(true);
        assert!(reaper.tick_at(1031).await.is_err());

        // Next tick succeeds once the store is back.
        kv.set_failing(false);
        assert_eq!(reaper.tick_at(1031).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweeps_every_shard() {
        let kv = Arc::new(MemoryKv::new());
        let settings = PresenceConfig {
            num_shards: 4,
            ..PresenceConfig::default()
        };
        let store = Arc::new(PresenceStore::new(kv.clone(), settings));
        let bus = Arc::new(LocalBus::default());
        let reaper = Reaper::new(store.clone(), bus, &ReaperConfig::default());

        // Users 5 and 6 land on different shards.
        store.record_heartbeat(5, 1000).await.unwrap();
        store.record_heartbeat(6, 1000).await.unwrap();

        let processed = reaper.tick_at(1031).await.unwrap();
        assert_eq!(processed, 2);
    }

    #[tokio::test]
    async fn test_single_shard_reaper_ignores_other_shards() {
        let kv = Arc::new(MemoryKv::new());
        let settings = PresenceConfig {
            num_shards: 4,
            ..PresenceConfig::default()
        };
        let store = Arc::new(PresenceStore::new(kv.clone(), settings));
        let bus = Arc::new(LocalBus::default());
        let reaper =
            Reaper::new(store.clone(), bus, &ReaperConfig::default()).with_shard(store.shard_for(5));

        store.record_heartbeat(5, 1000).await.unwrap();
        store.record_heartbeat(6, 1000).await.unwrap();

        assert_eq!(reaper.tick_at(1031).await.unwrap(), 1);
        assert_eq!(
            store.effective_status(6, 1031).await.unwrap().0,
            Status::Offline
        );
        // User 6's record is still in its shard, waiting for that shard's
        // reaper.
        assert_eq!(kv.zset_score("onlineUsers:2", "6").await.unwrap(), Some(1030.0));
    }

    #[tokio::test]
    async fn test_shutdown_between_ticks() {
        let (_, _, _, reaper) = fixture();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reaper should stop promptly")
            .unwrap();
    }
}
