//! Redis-backed coordination store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::FromRedisValue;

use super::{Coordination, CoordinationError};

/// Coordination over a shared, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisCoordination {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisCoordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordination").finish_non_exhaustive()
    }
}

fn map_redis_error(op: &str, e: redis::RedisError) -> CoordinationError {
    match e.kind() {
        redis::ErrorKind::TypeError => CoordinationError::WrongType(format!("{op}: {e}")),
        redis::ErrorKind::IoError => CoordinationError::Connection(format!("{op}: {e}")),
        _ if e.code() == Some("WRONGTYPE") => CoordinationError::WrongType(format!("{op}: {e}")),
        _ => CoordinationError::Command(format!("{op} failed: {e}")),
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisCoordination {
    /// Connect to Redis at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoordinationError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoordinationError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Shared connection, for adapters that live next to this store.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn query<T: FromRedisValue>(&self, op: &str, cmd: &redis::Cmd) -> Result<T, CoordinationError> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(op, e))
    }
}

#[async_trait]
impl Coordination for RedisCoordination {
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, CoordinationError> {
        self.query("RPUSH", redis::cmd("RPUSH").arg(key).arg(value)).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        self.query("LPOP", redis::cmd("LPOP").arg(key)).await
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, CoordinationError> {
        self.query("LRANGE", redis::cmd("LRANGE").arg(key).arg(0).arg(-1)).await
    }

    async fn llen(&self, key: &str) -> Result<u64, CoordinationError> {
        self.query("LLEN", redis::cmd("LLEN").arg(key)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CoordinationError> {
        let added: i64 = self.query("SADD", redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added == 1)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CoordinationError> {
        self.query("SISMEMBER", redis::cmd("SISMEMBER").arg(key).arg(member)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        self.query("EXISTS", redis::cmd("EXISTS").arg(key)).await
    }

    async fn del(&self, key: &str) -> Result<(), CoordinationError> {
        self.query("DEL", redis::cmd("DEL").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError> {
        self.query("EXPIRE", redis::cmd("EXPIRE").arg(key).arg(ttl_secs(ttl))).await
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, CoordinationError> {
        let mut conn = self.conn.clone();
        let (value, remaining): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR").arg(key)
            .cmd("TTL").arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("INCR/TTL", e))?;
        if remaining < 0 {
            self.expire(key, ttl).await?;
        }
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        self.query("GET", redis::cmd("GET").arg(key)).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CoordinationError> {
        let reply: Option<String> = self
            .query(
                "SET NX",
                redis::cmd("SET").arg(key).arg(value).arg("NX").arg("EX").arg(ttl_secs(ttl)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CoordinationError> {
        self.query("HSET", redis::cmd("HSET").arg(key).arg(field).arg(value)).await
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, CoordinationError> {
        let set: i64 = self
            .query("HSETNX", redis::cmd("HSETNX").arg(key).arg(field).arg(value))
            .await?;
        Ok(set == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CoordinationError> {
        self.query("HGET", redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CoordinationError> {
        self.query("HGETALL", redis::cmd("HGETALL").arg(key)).await
    }

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64, CoordinationError> {
        self.query("HINCRBY", redis::cmd("HINCRBY").arg(key).arg(field).arg(by)).await
    }

    async fn ping(&self) -> Result<(), CoordinationError> {
        let pong: String = self.query("PING", &redis::cmd("PING")).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(CoordinationError::Command(format!("unexpected PING reply: {pong}")))
        }
    }
}
