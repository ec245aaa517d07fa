//! Download worker pool: consumes task messages, throttles fetch starts,
//! and turns processing outcomes into ack, retry or dead-letter decisions.

pub mod fetch;
pub mod tasks;

pub use fetch::{FetchError, FetchPolicy, RemoteFetcher};
pub use tasks::{Disposition, DownloadTasks, RetryPolicy, TaskError};

use crate::{
    config::WorkerSettings,
    queue::{Broker, DOWNLOAD_QUEUE, Delivery, QueueResult, TaskMessage},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::{num::NonZeroU32, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Token bucket allowing `rate` fetch starts per second with `burst`
/// headroom. `None` when limiting is disabled.
pub fn build_limiter(rate: f64, burst: u32) -> Option<DefaultDirectRateLimiter> {
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    let period = Duration::try_from_secs_f64(1.0 / rate).ok()?;
    let burst = NonZeroU32::new(burst.max(1))?;
    let quota = Quota::with_period(period)?.allow_burst(burst);
    Some(RateLimiter::direct(quota))
}

pub struct DownloadWorker {
    broker: Arc<dyn Broker>,
    tasks: Arc<DownloadTasks>,
    slots: Arc<Semaphore>,
    limiter: Option<DefaultDirectRateLimiter>,
    poll_interval: Duration,
}

impl DownloadWorker {
    pub fn new(broker: Arc<dyn Broker>, tasks: Arc<DownloadTasks>, settings: &WorkerSettings) -> Self {
        Self {
            broker,
            tasks,
            slots: Arc::new(Semaphore::new(settings.concurrency.max(1))),
            limiter: build_limiter(settings.rate, settings.burst),
            poll_interval: settings.poll_interval,
        }
    }

    /// Consume until `cancel` fires, then wait for in-flight tasks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> QueueResult<()> {
        self.broker.declare_topology().await?;
        info!(
            slots = self.slots.available_permits(),
            limited = self.limiter.is_some(),
            "download worker started"
        );

        let mut in_flight = JoinSet::new();
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = match self.broker.receive(DOWNLOAD_QUEUE, &cancel).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "failed to receive download message");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
            };

            let worker = self.clone();
            let cancel = cancel.clone();
            in_flight.spawn(async move {
                worker.handle(delivery, &cancel).await;
                drop(permit);
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(err) = joined {
                    error!(error = %err, "download handler panicked");
                }
            }
        }

        info!(in_flight = in_flight.len(), "download worker draining");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "download handler panicked");
            }
        }
        info!("download worker stopped");
        Ok(())
    }

    async fn handle(&self, delivery: Delivery, cancel: &CancellationToken) {
        let msg: TaskMessage = match delivery.decode() {
            Ok(msg) => msg,
            Err(err) => {
                warn!(tag = delivery.tag, error = %err, "dropping malformed download message");
                self.ack(delivery.tag).await;
                return;
            }
        };

        if let Some(limiter) = &self.limiter {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.nack(delivery.tag).await;
                    return;
                }
                _ = limiter.until_ready() => {}
            }
        }

        let err = match self.tasks.process_download_task(msg.task_id, cancel).await {
            Ok(_) => {
                self.ack(delivery.tag).await;
                return;
            }
            Err(err) => err,
        };

        let persisted = match err.disposition() {
            Disposition::Requeue => {
                debug!(task = %msg.task_id, "download interrupted, requeueing");
                self.nack(delivery.tag).await;
                return;
            }
            Disposition::Retry => self.tasks.schedule_retry(&msg, &err.to_string()).await.map(|_| ()),
            Disposition::Terminal => self.tasks.mark_failed(&msg, &err.to_string()).await,
        };

        match persisted {
            Ok(()) => self.ack(delivery.tag).await,
            Err(persist) => {
                error!(task = %msg.task_id, error = %persist, "failed to persist download outcome");
                self.nack(delivery.tag).await;
            }
        }
    }

    async fn ack(&self, tag: i64) {
        if let Err(err) = self.broker.ack(tag).await {
            warn!(tag, error = %err, "failed to ack delivery");
        }
    }

    async fn nack(&self, tag: i64) {
        if let Err(err) = self.broker.nack(tag, true).await {
            warn!(tag, error = %err, "failed to nack delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::DownloadStatus,
        queue::{DLQ_QUEUE, SqliteBroker},
        worker::tasks::tests::{Fixture, fixture, retry_policy},
    };
    use uuid::Uuid;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn settings() -> WorkerSettings {
        WorkerSettings {
            concurrency: 2,
            rate: 0.0,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn start(f: &Fixture, cancel: &CancellationToken) -> tokio::task::JoinHandle<QueueResult<()>> {
        let broker: Arc<dyn Broker> = f.broker.clone();
        let worker = Arc::new(DownloadWorker::new(broker, f.tasks.clone(), &settings()));
        tokio::spawn(worker.run(cancel.clone()))
    }

    async fn wait_for(f: &Fixture, id: Uuid, status: DownloadStatus) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let task = f.tasks.get_task(id).await.unwrap().unwrap();
                if task.status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn limiter_is_disabled_for_non_positive_rates() {
        assert!(build_limiter(0.0, 4).is_none());
        assert!(build_limiter(-1.0, 4).is_none());
        assert!(build_limiter(f64::NAN, 4).is_none());
        assert!(build_limiter(2.0, 0).is_some());
    }

    #[tokio::test]
    async fn worker_completes_queued_download() {
        let f = fixture(retry_policy()).await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"queued".to_vec()))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let handle = start(&f, &cancel);
        let task = f
            .tasks
            .create_task(Uuid::new_v4(), &format!("{}/doc.txt", server.uri()), "doc.txt")
            .await
            .unwrap();

        wait_for(&f, task.id, DownloadStatus::Completed).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(f.h.count("file_entries").await, 1);
    }

    #[tokio::test]
    async fn terminal_http_status_fails_and_dead_letters() {
        let f = fixture(retry_policy()).await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let handle = start(&f, &cancel);
        let task = f
            .tasks
            .create_task(Uuid::new_v4(), &format!("{}/gone", server.uri()), "gone")
            .await
            .unwrap();

        wait_for(&f, task.id, DownloadStatus::Failed).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let task = f.tasks.get_task(task.id).await.unwrap().unwrap();
        assert!(task.error_msg.unwrap().contains("404"));
        assert_eq!(f.broker.depth(DLQ_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let f = fixture(retry_policy()).await;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let handle = start(&f, &cancel);
        let task = f
            .tasks
            .create_task(Uuid::new_v4(), &format!("{}/busy", server.uri()), "busy")
            .await
            .unwrap();

        wait_for(&f, task.id, DownloadStatus::Retrying).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let task = f.tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 1);
        assert!(task.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let f = fixture(retry_policy()).await;
        let broker: &SqliteBroker = &f.broker;
        broker
            .publish(
                crate::queue::DOWNLOAD_EXCHANGE,
                crate::queue::DOWNLOAD_ROUTING_KEY,
                b"{oops".to_vec(),
                None,
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = start(&f, &cancel);
        tokio::time::timeout(Duration::from_secs(10), async {
            while broker.depth(DOWNLOAD_QUEUE).await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
