//! Fanout Bus - Topic pub/sub across server instances
//!
//! Topics are strings like `status:<user_id>`. Delivery is at-most-once and
//! best-effort: a slow subscriber lags its broadcast channel and loses the
//! oldest envelopes rather than blocking publishers. `LocalBus` covers one
//! process; `RedisBus` bridges the same broker across instances through
//! redis pub/sub.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::presence::{Status, UserId};

pub const KIND_STATUS_CHANGED: &str = "status_changed";

/// Topic carrying one user's status transitions.
pub fn status_topic(user: UserId) -> String {
    format!("status:{}", user)
}

/// The published unit: one status transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: String,
    pub user_id: UserId,
    pub status: Status,
    pub ts: i64,
}

impl Envelope {
    pub fn status_changed(user_id: UserId, status: Status, ts: i64) -> Self {
        Self {
            kind: KIND_STATUS_CHANGED.to_string(),
            user_id,
            status,
            ts,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Join a topic; envelopes published after this call arrive on the
    /// returned receiver. Dropping the receiver plus calling [`leave`]
    /// releases the membership.
    async fn join(&self, topic: &str) -> BusResult<broadcast::Receiver<Envelope>>;

    /// Release interest in a topic; reclaims the channel once the last
    /// local subscriber is gone.
    async fn leave(&self, topic: &str) -> BusResult<()>;

    /// Publish an envelope; returns how many subscribers it reached.
    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<usize>;
}

/// Single-process broker: one broadcast channel per topic.
#[derive(Clone)]
pub struct LocalBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl FanoutBus for LocalBus {
    async fn join(&self, topic: &str) -> BusResult<broadcast::Receiver<Envelope>> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.subscribe())
    }

    async fn leave(&self, topic: &str) -> BusResult<()> {
        let mut channels = self.channels.write().await;
        if let Some(tx) = channels.get(topic) {
            if tx.receiver_count() == 0 {
                channels.remove(topic);
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<usize> {
        let channels = self.channels.read().await;
        match channels.get(topic) {
            // send only errors when every receiver is gone; that is a
            // delivery count of zero, not a failure.
            Some(tx) => Ok(tx.send(envelope).unwrap_or(0)),
            None => Ok(0),
        }
    }
}

enum BridgeCmd {
    Subscribe(String),
    Unsubscribe(String),
}

/// Cross-instance bus: publishes go through redis pub/sub, and a bridge
/// task feeds everything received for locally-joined topics into the
/// process-local broker. The publishing instance hears its own publishes
/// back through the bridge, so local delivery is not duplicated here.
pub struct RedisBus {
    local: LocalBus,
    conn: MultiplexedConnection,
    ctl: mpsc::UnboundedSender<BridgeCmd>,
    refcounts: Mutex<HashMap<String, usize>>,
}

impl RedisBus {
    pub async fn connect(url: &str, capacity: usize) -> BusResult<RedisBus> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let local = LocalBus::new(capacity);
        let (ctl, ctl_rx) = mpsc::unbounded_channel();
        tokio::spawn(bridge_loop(pubsub, ctl_rx, local.clone()));

        Ok(RedisBus {
            local,
            conn,
            ctl,
            refcounts: Mutex::new(HashMap::new()),
        })
    }
}

async fn bridge_loop(
    pubsub: redis::aio::PubSub,
    mut ctl: mpsc::UnboundedReceiver<BridgeCmd>,
    local: LocalBus,
) {
    let (mut sink, mut stream) = pubsub.split();
    loop {
        tokio::select! {
            cmd = ctl.recv() => match cmd {
                Some(BridgeCmd::Subscribe(topic)) => {
                    if let Err(e) = sink.subscribe(&topic).await {
                        warn!("bus bridge failed to subscribe {}: {}", topic, e);
                    }
                }
                Some(BridgeCmd::Unsubscribe(topic)) => {
                    if let Err(e) = sink.unsubscribe(&topic).await {
                        debug!("bus bridge failed to unsubscribe {}: {}", topic, e);
                    }
                }
                None => break,
            },
            msg = stream.next() => match msg {
                Some(msg) => {
                    let topic = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("bus bridge dropped unreadable payload on {}: {}", topic, e);
                            continue;
                        }
                    };
                    match serde_json::from_str::<Envelope>(&payload) {
                        Ok(envelope) => {
                            let _ = local.publish(&topic, envelope).await;
                        }
                        Err(e) => warn!("bus bridge dropped malformed envelope on {}: {}", topic, e),
                    }
                }
                None => break,
            },
        }
    }
    debug!("bus bridge loop exited");
}

#[async_trait]
impl FanoutBus for RedisBus {
    async fn join(&self, topic: &str) -> BusResult<broadcast::Receiver<Envelope>> {
        let rx = self.local.join(topic).await?;
        let mut refcounts = self.refcounts.lock().await;
        let count = refcounts.entry(topic.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.ctl
                .send(BridgeCmd::Subscribe(topic.to_string()))
                .map_err(|_| BusError::Unavailable("bus bridge is gone".to_string()))?;
        }
        Ok(rx)
    }

    async fn leave(&self, topic: &str) -> BusResult<()> {
        self.local.leave(topic).await?;
        let mut refcounts = self.refcounts.lock().await;
        if let Some(count) = refcounts.get_mut(topic) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                refcounts.remove(topic);
                let _ = self.ctl.send(BridgeCmd::Unsubscribe(topic.to_string()));
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> BusResult<usize> {
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(receivers.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_joined_subscriber() {
        let bus = LocalBus::default();
        let mut rx = bus.join("status:7").await.unwrap();

        let envelope = Envelope::status_changed(7, Status::Online, 1000);
        let reached = bus.publish("status:7", envelope.clone()).await.unwrap();
        assert_eq!(reached, 1);
        assert_eq!(rx.recv().await.unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_reaches_zero() {
        let bus = LocalBus::default();
        let reached = bus
            .publish("status:7", Envelope::status_changed(7, Status::Online, 1000))
            .await
            .unwrap();
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = LocalBus::default();
        let mut rx7 = bus.join("status:7").await.unwrap();
        let _rx8 = bus.join("status:8").await.unwrap();

        bus.publish("status:8", Envelope::status_changed(8, Status::Away, 1020))
            .await
            .unwrap();
        assert!(matches!(
            rx7.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_leave_reclaims_empty_topics() {
        let bus = LocalBus::default();
        let rx = bus.join("status:7").await.unwrap();
        assert_eq!(bus.topic_count().await, 1);

        drop(rx);
        bus.leave("status:7").await.unwrap();
        assert_eq!(bus.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest() {
        let bus = LocalBus::new(2);
        let mut rx = bus.join("status:7").await.unwrap();
        for ts in 0..5 {
            bus.publish("status:7", Envelope::status_changed(7, Status::Online, ts))
                .await
                .unwrap();
        }
        // Channel kept the newest two; the lag error reports the loss.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(rx.recv().await.unwrap().ts, 3);
        assert_eq!(rx.recv().await.unwrap().ts, 4);
    }

    #[test]
    fn test_envelope_round_trip_preserves_fields() {
        let envelope = Envelope::status_changed(7, Status::Offline, 1031);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("status_changed"));
        assert!(json.contains("offline"));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
