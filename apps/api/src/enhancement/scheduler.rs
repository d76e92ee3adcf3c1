//! Drive scheduling. This is the only place that owns real time.
//!
//! Scheduling a request means "call `Drive(id)` again after `delay`". Both
//! backends end in the same in-process drive queue that the orchestrator's
//! worker consumes:
//! - `LocalScheduler` parks a tokio timer per request.
//! - `RedisScheduler` keeps due times in a sorted set so pending retries
//!   survive a restart; `run_redis_poller` moves due ids into the queue.
//!
//! A duplicate or early trigger is harmless: `Drive` is idempotent and every
//! transition is version-guarded.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_RETRY_QUEUE_KEY: &str = "enhance:drive_queue";
const POLL_BATCH: isize = 64;

pub type DriveSender = mpsc::UnboundedSender<Uuid>;
pub type DriveReceiver = mpsc::UnboundedReceiver<Uuid>;

pub fn drive_queue() -> (DriveSender, DriveReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("drive queue is closed")]
    Closed,
}

#[async_trait]
pub trait DriveScheduler: Send + Sync {
    async fn schedule(&self, id: Uuid, delay: Duration) -> Result<(), SchedulerError>;
}

// ────────────────────────────────────────────────────────────────────────────
// In-process timers
// ────────────────────────────────────────────────────────────────────────────

pub struct LocalScheduler {
    queue: DriveSender,
}

impl LocalScheduler {
    pub fn new(queue: DriveSender) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl DriveScheduler for LocalScheduler {
    async fn schedule(&self, id: Uuid, delay: Duration) -> Result<(), SchedulerError> {
        if self.queue.is_closed() {
            return Err(SchedulerError::Closed);
        }
        if delay.is_zero() {
            return self.queue.send(id).map_err(|_| SchedulerError::Closed);
        }

        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.send(id).is_err() {
                debug!("Drive queue closed before request {id} came due");
            }
        });
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Redis sorted set
// ────────────────────────────────────────────────────────────────────────────

pub struct RedisScheduler {
    client: redis::Client,
    key: String,
}

impl RedisScheduler {
    pub fn new(client: redis::Client, key: impl Into<String>) -> Self {
        Self {
            client,
            key: key.into(),
        }
    }
}

fn due_at_ms(delay: Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    Utc::now().timestamp_millis().saturating_add(delay_ms)
}

#[async_trait]
impl DriveScheduler for RedisScheduler {
    async fn schedule(&self, id: Uuid, delay: Duration) -> Result<(), SchedulerError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // Re-scheduling the same id moves its due time rather than duplicating it.
        conn.zadd::<_, _, _, ()>(&self.key, id.to_string(), due_at_ms(delay))
            .await?;
        debug!("Scheduled request {id} in {}ms", delay.as_millis());
        Ok(())
    }
}

/// Moves due ids from the sorted set into the drive queue until the queue closes.
/// `ZREM` is the claim: with several service instances polling the same key,
/// only the one whose removal succeeds forwards the id.
pub async fn run_redis_poller(
    client: redis::Client,
    key: String,
    queue: DriveSender,
    interval: Duration,
) {
    info!("Polling '{key}' for due enhancement requests every {}ms", interval.as_millis());
    let mut conn: Option<MultiplexedConnection> = None;

    loop {
        if queue.is_closed() {
            info!("Drive queue closed; Redis poller stopping");
            return;
        }

        if conn.is_none() {
            match client.get_multiplexed_async_connection().await {
                Ok(c) => conn = Some(c),
                Err(e) => {
                    warn!("Redis connection failed: {e}");
                    tokio::time::sleep(interval).await;
                    continue;
                }
            }
        }
        let Some(active) = conn.as_mut() else {
            continue;
        };

        match forward_due(active, &key, &queue).await {
            // A full batch likely means more are due; poll again immediately.
            Ok(forwarded) if forwarded as isize >= POLL_BATCH => continue,
            Ok(_) => tokio::time::sleep(interval).await,
            Err(SchedulerError::Closed) => return,
            Err(e) => {
                warn!("Redis poll failed: {e}");
                conn = None;
                tokio::time::sleep(interval).await;
            }
        }
    }
}

async fn forward_due(
    conn: &mut MultiplexedConnection,
    key: &str,
    queue: &DriveSender,
) -> Result<usize, SchedulerError> {
    let now = Utc::now().timestamp_millis();
    let due: Vec<String> = conn
        .zrangebyscore_limit(key, "-inf", now, 0, POLL_BATCH)
        .await?;

    let mut forwarded = 0;
    for member in due {
        let removed: i64 = conn.zrem(key, &member).await?;
        if removed != 1 {
            continue;
        }
        match Uuid::parse_str(&member) {
            Ok(id) => {
                queue.send(id).map_err(|_| SchedulerError::Closed)?;
                forwarded += 1;
            }
            Err(_) => warn!("Discarding malformed drive queue entry '{member}'"),
        }
    }
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_local_scheduler_delivers_after_delay() {
        let (tx, mut rx) = drive_queue();
        let scheduler = LocalScheduler::new(tx);
        let id = Uuid::new_v4();

        scheduler.schedule(id, Duration::from_secs(4)).await.unwrap();
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await, Some(id));
    }

    #[tokio::test]
    async fn test_local_scheduler_immediate_delivery() {
        let (tx, mut rx) = drive_queue();
        let scheduler = LocalScheduler::new(tx);
        let id = Uuid::new_v4();
        scheduler.schedule(id, Duration::ZERO).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), id);
    }

    #[tokio::test]
    async fn test_local_scheduler_reports_closed_queue() {
        let (tx, rx) = drive_queue();
        drop(rx);
        let scheduler = LocalScheduler::new(tx);
        assert!(matches!(
            scheduler.schedule(Uuid::new_v4(), Duration::ZERO).await,
            Err(SchedulerError::Closed)
        ));
    }

    #[test]
    fn test_due_time_saturates() {
        let now = Utc::now().timestamp_millis();
        let due = due_at_ms(Duration::from_secs(2));
        assert!(due >= now + 2000);
        assert_eq!(due_at_ms(Duration::MAX), i64::MAX);
    }
}
