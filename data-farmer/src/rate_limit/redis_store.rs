//! Shared rate window store on Redis
//!
//! Windows are sorted sets scored by admission time. Admission runs as one
//! Lua script so concurrent workers never overshoot a window. Every call is
//! bounded by a timeout so an unresponsive server surfaces as a store error
//! and the limiter can fall back to local state.

use async_trait::async_trait;
use market_common::error::NetworkError;
use redis::aio::ConnectionManager;
use redis::{Client as RedisClient, FromRedisValue, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::store::RateWindowStore;
use super::types::{RateLimitError, RateLimitResult};

const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local max = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
if redis.call('ZCARD', key) < max then
    redis.call('ZADD', key, now, ARGV[4])
    redis.call('PEXPIRE', key, math.ceil(window * 1000))
    return 1
end
return 0
"#;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

pub struct RedisWindowStore {
    connection: ConnectionManager,
    admit: Script,
}

impl RedisWindowStore {
    pub async fn connect(redis_url: &str) -> RateLimitResult<Self> {
        Self::connect_with_timeouts(redis_url, CONNECT_TIMEOUT, COMMAND_TIMEOUT).await
    }

    async fn connect_with_timeouts(
        redis_url: &str,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> RateLimitResult<Self> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| NetworkError::Connection(format!("Failed to create Redis client: {}", e)))?;

        let connection = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| NetworkError::Timeout(connect_timeout))?
            .map_err(|e| NetworkError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        let store = Self {
            connection,
            admit: Script::new(ADMIT_SCRIPT),
        };
        // The manager connects lazily on some paths; make sure the server answers
        store
            .bounded("PING", command_timeout, |mut conn| async move {
                redis::cmd("PING").query_async::<_, String>(&mut conn).await
            })
            .await?;

        debug!("Connected rate window store to Redis at: {}", redis_url);
        Ok(store)
    }

    /// Run one round trip on a clone of the managed connection, bounded by `timeout`
    async fn bounded<T, F, Fut>(&self, op: &str, timeout: Duration, call: F) -> RateLimitResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(timeout, call(self.connection.clone())).await {
            Ok(result) => result.map_err(|e| redis_err(op, e)),
            Err(_) => {
                debug!(op, timeout_ms = timeout.as_millis() as u64, "Redis call timed out");
                Err(RateLimitError::Store(NetworkError::Timeout(timeout)))
            }
        }
    }

    async fn query<T: FromRedisValue>(&self, op: &str, cmd: redis::Cmd) -> RateLimitResult<T> {
        self.bounded(op, COMMAND_TIMEOUT, |mut conn| async move { cmd.query_async(&mut conn).await })
            .await
    }
}

fn redis_err(op: &str, e: redis::RedisError) -> RateLimitError {
    let err = if e.is_timeout() {
        NetworkError::Timeout(COMMAND_TIMEOUT)
    } else if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        NetworkError::Closed(format!("Redis {} failed: {}", op, e))
    } else {
        NetworkError::Send(format!("Redis {} failed: {}", op, e))
    };
    RateLimitError::Store(err)
}

#[async_trait]
impl RateWindowStore for RedisWindowStore {
    async fn try_admit(
        &self,
        key: &str,
        max: u32,
        window_secs: f64,
        now: f64,
        member: &str,
    ) -> RateLimitResult<bool> {
        let mut invocation = self.admit.key(key);
        invocation.arg(max).arg(window_secs).arg(now).arg(member);
        let admitted: i32 = self
            .bounded("admit script", COMMAND_TIMEOUT, |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(admitted == 1)
    }

    async fn count(&self, key: &str, window_secs: f64, now: f64) -> RateLimitResult<u32> {
        let mut cmd = redis::cmd("ZCOUNT");
        cmd.arg(key).arg(format!("({}", now - window_secs)).arg(now);
        self.query("ZCOUNT", cmd).await
    }

    async fn lockout_until(&self, key: &str, now: f64) -> RateLimitResult<Option<f64>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let until: Option<f64> = self.query("GET", cmd).await?;
        Ok(until.filter(|until| *until > now))
    }

    async fn set_lockout(&self, key: &str, until: f64, now: f64) -> RateLimitResult<()> {
        let ttl_ms = ((until - now) * 1000.0).ceil().max(1.0) as u64;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(until).arg("PX").arg(ttl_ms);
        self.query("SET", cmd).await
    }

    async fn increment_violations(&self, key: &str, reset_secs: u64, _now: f64) -> RateLimitResult<u32> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(reset_secs)
            .ignore();
        let (count,): (u32,) = self
            .bounded("INCR", COMMAND_TIMEOUT, |mut conn| async move {
                pipe.query_async(&mut conn).await
            })
            .await?;
        Ok(count)
    }

    async fn violations(&self, key: &str, _now: f64) -> RateLimitResult<u32> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let count: Option<u32> = self.query("GET", cmd).await?;
        Ok(count.unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
