//! Presence WebSocket endpoint
//!
//! One task per socket. Inbound messages from the client are serialized by
//! construction; outbound traffic goes through a small bounded queue
//! drained by a writer task, so a slow client sheds its own stale statuses
//! instead of blocking the fanout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::stream::SplitSink;
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, warn};

use crate::api::{middleware, AppState};
use crate::bus::{status_topic, Envelope};
use crate::metrics;
use crate::presence::{Effect, Status, UserId};
use crate::session::SessionInfo;

/// Client -> server protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "presence.heartbeat")]
    Heartbeat,
    #[serde(rename = "presence.away")]
    Away,
    #[serde(rename = "presence.active")]
    Active,
    #[serde(rename = "presence.subscribe")]
    Subscribe { target_user_id: UserId },
    #[serde(rename = "presence.unsubscribe")]
    Unsubscribe { target_user_id: UserId },
}

/// Server -> client protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Sent once after the socket is accepted.
    #[serde(rename = "presence.connected")]
    Connected { user_id: UserId },
    /// A transition of a subscribed user.
    #[serde(rename = "presence.status")]
    Status { user_id: UserId, status: Status, ts: i64 },
    /// Subscription authorized; carries the current effective status so
    /// late joiners render immediately.
    #[serde(rename = "presence.subscribe.ack")]
    SubscribeAck {
        target_user_id: UserId,
        current: StatusSnapshot,
    },
    #[serde(rename = "presence.subscribe.denied")]
    SubscribeDenied {
        target_user_id: UserId,
        reason: DenyReason,
    },
    #[serde(rename = "presence.unsubscribe.ack")]
    UnsubscribeAck { target_user_id: UserId },
    #[serde(rename = "presence.error")]
    Error { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: Status,
    pub ts: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotMutual,
    TooManySubscriptions,
}

#[derive(Deserialize)]
pub struct WsAuthQuery {
    token: Option<String>,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsAuthQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    let Some(token) = query.token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match middleware::decode_user_token(&token) {
        Ok(user_id) => ws
            .on_upgrade(move |socket| serve_session(socket, user_id, state))
            .into_response(),
        Err(code) => code.into_response(),
    }
}

pub(crate) async fn serve_session(socket: WebSocket, user_id: UserId, state: Arc<AppState>) {
    let connected_at = chrono::Utc::now().timestamp();
    let info = state.registry.insert(user_id, connected_at).await;
    metrics::ACTIVE_SESSIONS.inc();
    debug!("socket {} connected for user {}", info.socket_id, user_id);

    let (sink, mut inbound) = futures::StreamExt::split(socket);
    let outbound = OutboundQueue::new(state.config.server.outbound_buffer_size);
    let writer = tokio::spawn(writer_task(sink, outbound.clone()));

    let mut session = Session::new(user_id, state.clone(), outbound.clone(), info.clone());

    // Join the self topic unconditionally so every socket of this user
    // hears its own transitions (multi-device parity).
    if let Err(e) = session.join_topic(user_id).await {
        warn!("self topic join failed for user {}: {}", user_id, e);
    }
    session.outbound.push(ServerMessage::Connected { user_id });

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_client_text(&text).await,
                Some(Ok(Message::Binary(_))) => session
                    .outbound
                    .push(ServerMessage::Error { reason: "binary frames are not supported".to_string() }),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong are handled by the stack
                Some(Err(_)) => break,
            },
            Some((_, event)) = session.topics.next(), if !session.topics.is_empty() => match event {
                Ok(envelope) => session.dispatch(envelope),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!("socket {} lagged behind the bus, lost {} envelopes", info.socket_id, skipped);
                }
            },
        }
    }

    // Teardown leaves the heartbeat record alone: the reaper is the one
    // offline path, so multiple sessions of one user never flap.
    session.teardown().await;
    outbound.close();
    let _ = writer.await;
    state.registry.remove(info.socket_id).await;
    metrics::ACTIVE_SESSIONS.dec();
    debug!("socket {} closed", info.socket_id);
}

struct Session {
    user_id: UserId,
    state: Arc<AppState>,
    outbound: OutboundQueue,
    info: Arc<SessionInfo>,
    topics: StreamMap<String, BroadcastStream<Envelope>>,
    /// Non-self users this socket is subscribed to.
    targets: HashSet<UserId>,
    last_delivered: HashMap<UserId, (i64, Status)>,
}

impl Session {
    fn new(
        user_id: UserId,
        state: Arc<AppState>,
        outbound: OutboundQueue,
        info: Arc<SessionInfo>,
    ) -> Self {
        Self {
            user_id,
            state,
            outbound,
            info,
            topics: StreamMap::new(),
            targets: HashSet::new(),
            last_delivered: HashMap::new(),
        }
    }

    async fn handle_client_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_client_message(message).await,
            Err(_) => self.outbound.push(ServerMessage::Error {
                reason: "malformed or unknown message".to_string(),
            }),
        }
    }

    async fn handle_client_message(&mut self, message: ClientMessage) {
        let now = chrono::Utc::now().timestamp();
        match message {
            ClientMessage::Heartbeat => self.handle_heartbeat(now).await,
            ClientMessage::Away => self.handle_semantic(Status::Away, now).await,
            ClientMessage::Active => self.handle_semantic(Status::Online, now).await,
            ClientMessage::Subscribe { target_user_id } => {
                self.handle_subscribe(target_user_id, now).await
            }
            ClientMessage::Unsubscribe { target_user_id } => {
                self.handle_unsubscribe(target_user_id).await
            }
        }
    }

    async fn handle_heartbeat(&mut self, now: i64) {
        match self.state.store.record_heartbeat(self.user_id, now).await {
            Ok(Effect::TransitionedTo(status)) => {
                metrics::HEARTBEATS_TOTAL.inc();
                self.publish_transition(status, now).await;
            }
            Ok(Effect::Refreshed) => metrics::HEARTBEATS_TOTAL.inc(),
            Ok(_) => {} // rate limited: dropped without a reply
            Err(e) => {
                // The next heartbeat is the retry.
                debug!("heartbeat for {} not recorded: {}", self.user_id, e);
            }
        }
    }

    async fn handle_semantic(&mut self, target: Status, now: i64) {
        match self.state.store.set_semantic(self.user_id, target, now).await {
            Ok(Effect::TransitionedTo(status)) => self.publish_transition(status, now).await,
            Ok(_) => {} // unchanged, or not effectively online
            Err(e) => debug!("semantic update for {} not recorded: {}", self.user_id, e),
        }
    }

    async fn publish_transition(&self, status: Status, ts: i64) {
        metrics::TRANSITIONS_TOTAL
            .with_label_values(&[status.as_str()])
            .inc();
        let envelope = Envelope::status_changed(self.user_id, status, ts);
        if let Err(e) = self
            .state
            .bus
            .publish(&status_topic(self.user_id), envelope)
            .await
        {
            metrics::PUBLISH_FAILURES_TOTAL.inc();
            warn!("status publish for {} dropped: {}", self.user_id, e);
        }
    }

    async fn handle_subscribe(&mut self, target: UserId, now: i64) {
        if target != self.user_id && !self.targets.contains(&target) {
            if self.targets.len() >= self.state.config.server.max_subscriptions_per_socket {
                self.outbound.push(ServerMessage::SubscribeDenied {
                    target_user_id: target,
                    reason: DenyReason::TooManySubscriptions,
                });
                return;
            }

            // An unreachable graph denies; it never fails open.
            let allowed = self
                .state
                .graph
                .is_mutual(self.user_id, target)
                .await
                .unwrap_or(false);
            if !allowed {
                self.outbound.push(ServerMessage::SubscribeDenied {
                    target_user_id: target,
                    reason: DenyReason::NotMutual,
                });
                return;
            }

            if let Err(e) = self.join_topic(target).await {
                warn!("topic join for {} failed: {}", target, e);
                self.outbound.push(ServerMessage::Error {
                    reason: "subscription failed, retry".to_string(),
                });
                return;
            }
            self.targets.insert(target);
            self.info.set_subscription_count(self.targets.len());
            metrics::ACTIVE_SUBSCRIPTIONS.inc();
        }

        let (status, ts) = self
            .state
            .store
            .effective_status_or_offline(target, now)
            .await;
        self.outbound.push(ServerMessage::SubscribeAck {
            target_user_id: target,
            current: StatusSnapshot { status, ts },
        });
    }

    async fn handle_unsubscribe(&mut self, target: UserId) {
        // The self topic stays joined for the life of the socket.
        if target != self.user_id && self.targets.remove(&target) {
            let topic = status_topic(target);
            self.topics.remove(&topic);
            let _ = self.state.bus.leave(&topic).await;
            self.info.set_subscription_count(self.targets.len());
            metrics::ACTIVE_SUBSCRIPTIONS.dec();
        }
        self.outbound.push(ServerMessage::UnsubscribeAck {
            target_user_id: target,
        });
    }

    async fn join_topic(&mut self, user: UserId) -> Result<(), crate::bus::BusError> {
        let topic = status_topic(user);
        let rx = self.state.bus.join(&topic).await?;
        self.topics.insert(topic, BroadcastStream::new(rx));
        Ok(())
    }

    fn dispatch(&mut self, envelope: Envelope) {
        if !monotonic_admit(&mut self.last_delivered, &envelope) {
            return;
        }
        self.outbound.push(ServerMessage::Status {
            user_id: envelope.user_id,
            status: envelope.status,
            ts: envelope.ts,
        });
    }

    async fn teardown(&mut self) {
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        // Drop receivers first so the broker can reclaim empty channels.
        for topic in &topics {
            self.topics.remove(topic);
        }
        for topic in &topics {
            let _ = self.state.bus.leave(topic).await;
        }
        metrics::ACTIVE_SUBSCRIPTIONS.sub(self.targets.len() as f64);
        self.targets.clear();
        self.info.set_subscription_count(0);
    }
}

/// The bus is ordered per publisher but not across publishers; `ts` is the
/// tiebreaker. Regressions are dropped, as are exact duplicates from a
/// dual-reaper deployment.
fn monotonic_admit(
    last_delivered: &mut HashMap<UserId, (i64, Status)>,
    envelope: &Envelope,
) -> bool {
    if let Some(&(last_ts, last_status)) = last_delivered.get(&envelope.user_id) {
        if envelope.ts < last_ts || (envelope.ts == last_ts && envelope.status == last_status) {
            return false;
        }
    }
    last_delivered.insert(envelope.user_id, (envelope.ts, envelope.status));
    true
}

/// Bounded outbound buffer shared between the session task and its writer.
/// The lock is held only for enqueue/dequeue. When full, the oldest
/// pending status for the same user is dropped in favor of the new one;
/// other message kinds shed strictly oldest-first.
#[derive(Clone)]
pub(crate) struct OutboundQueue {
    inner: Arc<OutboundInner>,
}

struct OutboundInner {
    pending: std::sync::Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(OutboundInner {
                pending: std::sync::Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn push(&self, message: ServerMessage) {
        {
            let mut pending = self.inner.pending.lock().unwrap();
            if pending.len() >= self.inner.capacity {
                let dropped = match &message {
                    ServerMessage::Status { user_id, .. } => {
                        let user_id = *user_id;
                        let stale = pending.iter().position(
                            |m| matches!(m, ServerMessage::Status { user_id: u, .. } if *u == user_id),
                        );
                        match stale {
                            Some(pos) => pending.remove(pos).is_some(),
                            None => false,
                        }
                    }
                    _ => false,
                };
                if !dropped {
                    pending.pop_front();
                }
            }
            pending.push_back(message);
        }
        self.inner.notify.notify_one();
    }

    fn pop(&self) -> Option<ServerMessage> {
        self.inner.pending.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        self.inner.notify.notified().await;
    }
}

async fn writer_task(mut sink: SplitSink<WebSocket, Message>, queue: OutboundQueue) {
    loop {
        while let Some(message) = queue.pop() {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        if queue.is_closed() {
            let _ = sink.close().await;
            return;
        }
        queue.wait().await;
    }
}
