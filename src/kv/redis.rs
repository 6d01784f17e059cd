//! Redis-backed KV store.
//!
//! Uses one multiplexed connection (cheap to clone, safe to share across
//! tasks). The conditional remove is registered as a Lua script so the
//! read-check-remove runs as a single unit inside the server.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Script};

use super::{KvError, KvResult, KvStore, RemoveOutcome};

/// Atomic check-and-delete for offline detection.
///
/// KEYS[1] = scored-set key
/// ARGV[1] = member (decimal user id)
/// ARGV[2] = threshold (unix seconds)
///
/// Returns nil when the member is absent, "removed" when the member was
/// expired and deleted, otherwise the observed score as a string.
const CONFIRM_REMOVE_LUA: &str = r#"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score then
  return false
end
if tonumber(score) < tonumber(ARGV[2]) then
  redis.call('ZREM', KEYS[1], ARGV[1])
  return 'removed'
end
return score
"#;

pub struct RedisKv {
    conn: MultiplexedConnection,
    confirm_remove: Script,
}

impl RedisKv {
    pub async fn connect(url: &str) -> KvResult<RedisKv> {
        let client = redis::Client::open(url).map_err(classify)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(classify)?;
        Ok(RedisKv {
            conn,
            confirm_remove: Script::new(CONFIRM_REMOVE_LUA),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

/// Connection-level failures are retryable; protocol and type errors are not.
fn classify(e: RedisError) -> KvError {
    if e.is_io_error()
        || e.is_timeout()
        || e.is_connection_refusal()
        || e.is_connection_dropped()
        || e.is_cluster_error()
    {
        KvError::TransientUnavailable(e.to_string())
    } else {
        KvError::Fatal(e.to_string())
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn zset_upsert(&self, key: &str, member: &str, score: f64) -> KvResult<()> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await
            .map_err(classify)
    }

    async fn zset_score(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        let mut conn = self.conn();
        redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async::<Option<f64>>(&mut conn)
            .await
            .map_err(classify)
    }

    async fn zset_range_below(
        &self,
        key: &str,
        upper: f64,
        limit: usize,
    ) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(upper)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async::<Vec<String>>(&mut conn)
            .await
            .map_err(classify)
    }

    async fn zset_remove_if_below(
        &self,
        key: &str,
        member: &str,
        threshold: f64,
    ) -> KvResult<RemoveOutcome> {
        let mut conn = self.conn();
        let reply: Option<String> = self
            .confirm_remove
            .key(key)
            .arg(member)
            .arg(threshold)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        match reply {
            None => Ok(RemoveOutcome::Aborted(None)),
            Some(s) if s == "removed" => Ok(RemoveOutcome::Removed),
            Some(s) => {
                let score = s
                    .parse::<f64>()
                    .map_err(|_| KvError::Fatal(format!("unparseable score reply: {}", s)))?;
                Ok(RemoveOutcome::Aborted(Some(score)))
            }
        }
    }

    async fn map_set_fields(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        let mut hset = pipe.cmd("HSET").arg(key);
        for (field, value) in fields {
            hset = hset.arg(*field).arg(value);
        }
        if let Some(ttl) = ttl {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs());
        }
        pipe.query_async::<()>(&mut conn).await.map_err(classify)
    }

    async fn map_get_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.conn();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async::<HashMap<String, String>>(&mut conn)
            .await
            .map_err(classify)
    }

    async fn map_get_field(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(classify)
    }

    async fn ping(&self) -> KvResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
