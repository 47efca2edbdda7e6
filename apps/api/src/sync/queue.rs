use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use uuid::Uuid;

const QUEUE_KEY: &str = "context_sync:queue";
const PENDING_PREFIX: &str = "context_sync:pending:";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed queue entry: {0}")]
    Malformed(String),
}

/// Work queue of per-user sync runs.
#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Returns false when the user is already waiting or running.
    async fn enqueue(&self, user_id: Uuid) -> Result<bool, QueueError>;

    /// Waits up to `wait` for the next user.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Uuid>, QueueError>;

    /// Releases the pending marker so the user can be enqueued again.
    async fn complete(&self, user_id: Uuid) -> Result<(), QueueError>;
}

/// Redis list plus a per-user `SET NX EX` marker. The marker expires on its
/// own if a worker dies mid-run.
///
/// `dequeue` blocks its connection, so each worker needs its own instance.
pub struct RedisSyncQueue {
    conn: MultiplexedConnection,
    pending_ttl: Duration,
}

impl RedisSyncQueue {
    pub async fn connect(client: &redis::Client, pending_ttl: Duration) -> Result<Self, QueueError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn, pending_ttl })
    }

    fn pending_key(user_id: Uuid) -> String {
        format!("{PENDING_PREFIX}{user_id}")
    }
}

#[async_trait]
impl SyncQueue for RedisSyncQueue {
    async fn enqueue(&self, user_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let marked: Option<String> = redis::cmd("SET")
            .arg(Self::pending_key(user_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.pending_ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        if marked.is_none() {
            return Ok(false);
        }

        redis::cmd("LPUSH")
            .arg(QUEUE_KEY)
            .arg(user_id.to_string())
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(true)
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Uuid>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(QUEUE_KEY)
            .arg(wait.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        popped
            .map(|(_, raw)| Uuid::parse_str(&raw).map_err(|_| QueueError::Malformed(raw)))
            .transpose()
    }

    async fn complete(&self, user_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(Self::pending_key(user_id))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }
}
