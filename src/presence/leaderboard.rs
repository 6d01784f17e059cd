//! Batch Query - "Who is online among my mutuals"
//!
//! Synchronous counterpart to the subscription plane: fetch the
//! requester's mutual set, read every effective status concurrently, and
//! rank online users first, most recently updated first.

use std::cmp::Reverse;

use serde::Serialize;
use thiserror::Error;

use crate::graph::{FollowGraph, GraphError};
use crate::kv::KvError;
use crate::presence::{PresenceStore, Status, UserId};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 500;

#[derive(Clone, Debug, Serialize)]
pub struct FriendPresence {
    pub user_id: UserId,
    pub profile_name: String,
    pub status: Status,
    pub last_seen: i64,
}

#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error("follow graph unavailable: {0}")]
    GraphUnavailable(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

pub async fn online_mutuals(
    store: &PresenceStore,
    graph: &dyn FollowGraph,
    requester: UserId,
    limit: usize,
    now: i64,
) -> Result<Vec<FriendPresence>, LeaderboardError> {
    let mutuals = graph
        .mutuals_of(requester)
        .await
        .map_err(|GraphError::Unavailable(e)| LeaderboardError::GraphUnavailable(e))?;

    let mut ranked = store.effective_status_many(&mutuals, now).await?;
    ranked.sort_by_key(|&(_, status, ts)| (Reverse(status == Status::Online), Reverse(ts)));
    ranked.truncate(limit.min(MAX_LIMIT));

    let mut friends = Vec::with_capacity(ranked.len());
    for (user_id, status, last_seen) in ranked {
        // Missing or unreadable profile names degrade to a placeholder
        // rather than failing the whole query.
        let profile_name = store
            .profile_name(user_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| format!("user-{}", user_id));
        friends.push(FriendPresence {
            user_id,
            profile_name,
            status,
            last_seen,
        });
    }
    Ok(friends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::graph::MemoryGraph;
    use crate::kv::{KvStore, MemoryKv};
    use std::sync::Arc;

    async fn fixture() -> (Arc<MemoryKv>, PresenceStore, MemoryGraph) {
        let kv = Arc::new(MemoryKv::new());
        let store = PresenceStore::new(kv.clone(), PresenceConfig::default());
        let graph = MemoryGraph::new();
        (kv, store, graph)
    }

    async fn make_mutual(graph: &MemoryGraph, a: UserId, b: UserId) {
        graph.follow(a, b).await;
        graph.follow(b, a).await;
    }

    #[tokio::test]
    async fn test_online_mutuals_ranked_online_first_then_recent() {
        let (_, store, graph) = fixture().await;
        make_mutual(&graph, 1, 2).await;
        make_mutual(&graph, 1, 3).await;
        make_mutual(&graph, 1, 4).await;

        store.record_heartbeat(2, 1000).await.unwrap(); // online, ts 1000
        store.record_heartbeat(3, 1005).await.unwrap(); // online, ts 1005
        store.record_heartbeat(4, 900).await.unwrap();
        store.confirm_offline(4, 990).await.unwrap(); // offline, last_seen 990

        let friends = online_mutuals(&store, &graph, 1, 50, 1010).await.unwrap();
        let order: Vec<UserId> = friends.iter().map(|f| f.user_id).collect();
        assert_eq!(order, vec![3, 2, 4]);
        assert_eq!(friends[0].status, Status::Online);
        assert_eq!(friends[2].status, Status::Offline);
        assert_eq!(friends[2].last_seen, 990);
    }

    #[tokio::test]
    async fn test_away_ranks_below_online() {
        let (_, store, graph) = fixture().await;
        make_mutual(&graph, 1, 2).await;
        make_mutual(&graph, 1, 3).await;

        store.record_heartbeat(2, 1000).await.unwrap();
        store.record_heartbeat(3, 1000).await.unwrap();
        store.set_semantic(3, Status::Away, 1020).await.unwrap();

        let friends = online_mutuals(&store, &graph, 1, 50, 1025).await.unwrap();
        assert_eq!(friends[0].user_id, 2);
        assert_eq!(friends[1].user_id, 3);
        assert_eq!(friends[1].status, Status::Away);
    }

    #[tokio::test]
    async fn test_limit_truncates() {
        let (_, store, graph) = fixture().await;
        for other in 2..12 {
            make_mutual(&graph, 1, other).await;
            store.record_heartbeat(other, 1000 + other).await.unwrap();
        }
        let friends = online_mutuals(&store, &graph, 1, 3, 1020).await.unwrap();
        assert_eq!(friends.len(), 3);
        // Most recently updated first.
        assert_eq!(friends[0].user_id, 11);
    }

    #[tokio::test]
    async fn test_non_mutuals_are_excluded() {
        let (_, store, graph) = fixture().await;
        graph.follow(1, 2).await; // not reciprocated
        store.record_heartbeat(2, 1000).await.unwrap();
        let friends = online_mutuals(&store, &graph, 1, 50, 1010).await.unwrap();
        assert!(friends.is_empty());
    }

    #[tokio::test]
    async fn test_profile_names_resolve_with_fallback() {
        let (kv, store, graph) = fixture().await;
        make_mutual(&graph, 1, 2).await;
        make_mutual(&graph, 1, 3).await;
        store.record_heartbeat(2, 1000).await.unwrap();
        store.record_heartbeat(3, 1000).await.unwrap();
        kv.map_set_fields("profile:2", &[("display_name", "alice".to_string())], None)
            .await
            .unwrap();

        let friends = online_mutuals(&store, &graph, 1, 50, 1010).await.unwrap();
        let by_id = |id: UserId| friends.iter().find(|f| f.user_id == id).unwrap();
        assert_eq!(by_id(2).profile_name, "alice");
        assert_eq!(by_id(3).profile_name, "user-3");
    }

    #[tokio::test]
    async fn test_kv_outage_surfaces_transient_error() {
        let (kv, store, graph) = fixture().await;
        make_mutual(&graph, 1, 2).await;
        kv.set_failing(true);
        let err = online_mutuals(&store, &graph, 1, 50, 1010).await.unwrap_err();
        assert!(matches!(err, LeaderboardError::Kv(e) if e.is_transient()));
    }
}
