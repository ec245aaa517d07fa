//! Durable broker on the relational store.
//!
//! Messages are rows in `mq_messages`. A consumer claims the oldest ready row
//! by leasing it; ack deletes the row, nack either releases or deletes it, and
//! a lease that runs out makes the row claimable again with `redelivered`
//! set. Rows published with an expiration are swept on every receive: once
//! expired they move through their queue's dead-letter exchange, or are
//! dropped if the queue has none.

use super::{
    Broker, DLQ_EXCHANGE, DLQ_QUEUE, DLQ_ROUTING_KEY, DOWNLOAD_EXCHANGE, DOWNLOAD_QUEUE,
    DOWNLOAD_ROUTING_KEY, Delivery, JSON_CONTENT_TYPE, QueueError, QueueResult, RETRY_EXCHANGE,
    RETRY_QUEUE, RETRY_ROUTING_KEY,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
pub struct SqliteBroker {
    db: SqlitePool,
    poll_interval: Duration,
    lease: Duration,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl SqliteBroker {
    pub fn new(db: SqlitePool, poll_interval: Duration, lease: Duration) -> Self {
        Self {
            db,
            poll_interval,
            lease,
        }
    }

    /// Messages currently stored on `queue`, leased or not.
    pub async fn depth(&self, queue: &str) -> QueueResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM mq_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    async fn route(
        tx: &mut Transaction<'_, Sqlite>,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        expiration: Option<Duration>,
    ) -> QueueResult<u64> {
        let declared: Option<String> =
            sqlx::query_scalar("SELECT kind FROM mq_exchanges WHERE name = ?")
                .bind(exchange)
                .fetch_optional(&mut **tx)
                .await?;
        if declared.is_none() {
            return Err(QueueError::UnknownExchange(exchange.to_string()));
        }

        let queues: Vec<String> = sqlx::query_scalar(
            "SELECT queue FROM mq_bindings WHERE exchange = ? AND routing_key = ? ORDER BY queue",
        )
        .bind(exchange)
        .bind(routing_key)
        .fetch_all(&mut **tx)
        .await?;
        if queues.is_empty() {
            return Err(QueueError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        let now = now_ms();
        let expires_at = expiration.map(|ttl| now.saturating_add(millis(ttl)));
        for queue in &queues {
            sqlx::query(
                "INSERT INTO mq_messages
                    (queue, body, content_type, state, available_at, expires_at, redelivered, published_at)
                 VALUES (?, ?, ?, 'ready', ?, ?, 0, ?)",
            )
            .bind(queue)
            .bind(body)
            .bind(JSON_CONTENT_TYPE)
            .bind(now)
            .bind(expires_at)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        Ok(queues.len() as u64)
    }

    /// Move expired messages to their queue's dead-letter route.
    async fn promote_expired(&self) -> QueueResult<u64> {
        let now = now_ms();
        let mut tx = self.db.begin().await?;
        let expired: Vec<(i64, Vec<u8>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT m.id, m.body, q.dead_letter_exchange, q.dead_letter_routing_key
             FROM mq_messages m LEFT JOIN mq_queues q ON q.name = m.queue
             WHERE m.state = 'ready' AND m.expires_at IS NOT NULL AND m.expires_at <= ?
             ORDER BY m.id",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut moved = 0;
        for (id, body, exchange, routing_key) in expired {
            sqlx::query("DELETE FROM mq_messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if let (Some(exchange), Some(routing_key)) = (exchange, routing_key) {
                moved += Self::route(&mut tx, &exchange, &routing_key, &body, None).await?;
            }
        }
        tx.commit().await?;
        if moved > 0 {
            debug!(moved, "dead-lettered expired messages");
        }
        Ok(moved)
    }

    async fn claim(&self, queue: &str) -> QueueResult<Option<Delivery>> {
        let now = now_ms();
        let leased_until = now.saturating_add(millis(self.lease));
        let row: Option<(i64, Vec<u8>, bool)> = sqlx::query_as(
            "UPDATE mq_messages SET
                state = 'leased',
                leased_until = ?,
                redelivered = CASE WHEN state = 'leased' THEN 1 ELSE redelivered END
             WHERE id = (
                SELECT id FROM mq_messages
                WHERE queue = ?
                  AND ((state = 'ready' AND available_at <= ?)
                       OR (state = 'leased' AND leased_until <= ?))
                  AND (expires_at IS NULL OR expires_at > ?)
                ORDER BY id LIMIT 1
             )
             RETURNING id, body, redelivered",
        )
        .bind(leased_until)
        .bind(queue)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|(tag, body, redelivered)| Delivery {
            tag,
            body,
            redelivered,
        }))
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn declare_topology(&self) -> QueueResult<()> {
        let mut tx = self.db.begin().await?;
        for exchange in [DOWNLOAD_EXCHANGE, RETRY_EXCHANGE, DLQ_EXCHANGE] {
            sqlx::query("INSERT OR IGNORE INTO mq_exchanges (name, kind) VALUES (?, 'direct')")
                .bind(exchange)
                .execute(&mut *tx)
                .await?;
        }

        let queues = [
            (DOWNLOAD_QUEUE, None, None),
            (
                RETRY_QUEUE,
                Some(DOWNLOAD_EXCHANGE),
                Some(DOWNLOAD_ROUTING_KEY),
            ),
            (DLQ_QUEUE, None, None),
        ];
        for (queue, dlx, dlk) in queues {
            sqlx::query(
                "INSERT OR IGNORE INTO mq_queues (name, dead_letter_exchange, dead_letter_routing_key)
                 VALUES (?, ?, ?)",
            )
            .bind(queue)
            .bind(dlx)
            .bind(dlk)
            .execute(&mut *tx)
            .await?;
        }

        let bindings = [
            (DOWNLOAD_EXCHANGE, DOWNLOAD_ROUTING_KEY, DOWNLOAD_QUEUE),
            (RETRY_EXCHANGE, RETRY_ROUTING_KEY, RETRY_QUEUE),
            (DLQ_EXCHANGE, DLQ_ROUTING_KEY, DLQ_QUEUE),
        ];
        for (exchange, routing_key, queue) in bindings {
            sqlx::query(
                "INSERT OR IGNORE INTO mq_bindings (exchange, routing_key, queue) VALUES (?, ?, ?)",
            )
            .bind(exchange)
            .bind(routing_key)
            .bind(queue)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!("download queue topology declared");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        expiration: Option<Duration>,
    ) -> QueueResult<()> {
        let mut tx = self.db.begin().await?;
        let routed = Self::route(&mut tx, exchange, routing_key, &body, expiration).await?;
        tx.commit().await?;
        debug!(exchange, routing_key, routed, "message published");
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        cancel: &CancellationToken,
    ) -> QueueResult<Option<Delivery>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            self.promote_expired().await?;
            if let Some(delivery) = self.claim(queue).await? {
                return Ok(Some(delivery));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, tag: i64) -> QueueResult<()> {
        let result = sqlx::query("DELETE FROM mq_messages WHERE id = ? AND state = 'leased'")
            .bind(tag)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(tag));
        }
        Ok(())
    }

    async fn nack(&self, tag: i64, requeue: bool) -> QueueResult<()> {
        let result = if requeue {
            sqlx::query(
                "UPDATE mq_messages
                 SET state = 'ready', leased_until = NULL, redelivered = 1, available_at = ?
                 WHERE id = ? AND state = 'leased'",
            )
            .bind(now_ms())
            .bind(tag)
            .execute(&self.db)
            .await?
        } else {
            sqlx::query("DELETE FROM mq_messages WHERE id = ? AND state = 'leased'")
                .bind(tag)
                .execute(&self.db)
                .await?
        };
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownDelivery(tag));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        queue::{DeadLetterRecord, TaskMessage},
    };
    use uuid::Uuid;

    async fn broker(lease: Duration) -> SqliteBroker {
        let pool = db::connect_in_memory().await.unwrap();
        let broker = SqliteBroker::new(pool, Duration::from_millis(10), lease);
        broker.declare_topology().await.unwrap();
        broker
    }

    fn msg(attempt: u32) -> TaskMessage {
        TaskMessage {
            task_id: Uuid::new_v4(),
            attempt,
        }
    }

    #[tokio::test]
    async fn topology_is_idempotent() {
        let b = broker(Duration::from_secs(60)).await;
        b.declare_topology().await.unwrap();
        let bindings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mq_bindings")
            .fetch_one(&b.db)
            .await
            .unwrap();
        assert_eq!(bindings, 3);
    }

    #[tokio::test]
    async fn publish_receive_ack() {
        let b = broker(Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let sent = msg(0);
        b.publish_task(&sent).await.unwrap();

        let delivery = b.receive(DOWNLOAD_QUEUE, &cancel).await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        assert_eq!(delivery.decode::<TaskMessage>().unwrap(), sent);

        b.ack(delivery.tag).await.unwrap();
        assert_eq!(b.depth(DOWNLOAD_QUEUE).await.unwrap(), 0);
        assert!(matches!(
            b.ack(delivery.tag).await,
            Err(QueueError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn nack_requeue_redelivers_and_nack_drop_deletes() {
        let b = broker(Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        b.publish_task(&msg(0)).await.unwrap();

        let first = b.receive(DOWNLOAD_QUEUE, &cancel).await.unwrap().unwrap();
        b.nack(first.tag, true).await.unwrap();
        let second = b.receive(DOWNLOAD_QUEUE, &cancel).await.unwrap().unwrap();
        assert_eq!(second.tag, first.tag);
        assert!(second.redelivered);

        b.nack(second.tag, false).await.unwrap();
        assert_eq!(b.depth(DOWNLOAD_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let b = broker(Duration::from_millis(20)).await;
        let cancel = CancellationToken::new();
        b.publish_task(&msg(0)).await.unwrap();

        let first = b.receive(DOWNLOAD_QUEUE, &cancel).await.unwrap().unwrap();
        let again = b.receive(DOWNLOAD_QUEUE, &cancel).await.unwrap().unwrap();
        assert_eq!(again.tag, first.tag);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn retry_message_returns_to_main_queue_after_delay() {
        let b = broker(Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let sent = msg(1);
        b.publish_retry(&sent, Duration::from_millis(30)).await.unwrap();
        assert_eq!(b.depth(RETRY_QUEUE).await.unwrap(), 1);
        assert_eq!(b.depth(DOWNLOAD_QUEUE).await.unwrap(), 0);

        let delivery = tokio::time::timeout(
            Duration::from_secs(5),
            b.receive(DOWNLOAD_QUEUE, &cancel),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(delivery.decode::<TaskMessage>().unwrap(), sent);
        assert_eq!(b.depth(RETRY_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_letters_land_on_dlq() {
        let b = broker(Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let record = DeadLetterRecord {
            task_id: Uuid::new_v4(),
            attempt: 5,
            error: "gone".into(),
            failed_at: Utc::now(),
        };
        b.publish_dlq(&record).await.unwrap();

        let delivery = b.receive(DLQ_QUEUE, &cancel).await.unwrap().unwrap();
        let got: DeadLetterRecord = delivery.decode().unwrap();
        assert_eq!(got.task_id, record.task_id);
        assert_eq!(got.error, "gone");
    }

    #[tokio::test]
    async fn receive_returns_none_when_cancelled() {
        let b = broker(Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let waiter = {
            let b = b.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { b.receive(DOWNLOAD_QUEUE, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn publishing_to_undeclared_exchange_fails() {
        let pool = db::connect_in_memory().await.unwrap();
        let b = SqliteBroker::new(pool, Duration::from_millis(10), Duration::from_secs(1));
        let err = b.publish_task(&msg(0)).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownExchange(_)));
    }
}
