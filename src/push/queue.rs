/// Push delivery queue and worker
use super::apns::{build_payload, ApnsClient};
use super::tokens::{tokens_for_user_in, DeviceToken, DeviceTokenRegistry, Platform};
use super::PushJob;
use crate::config::PushConfig;
use crate::error::{AppError, AppResult};
use crate::jobs::queue::JobQueue;
use crate::metrics;
use crate::store::Store;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Producer handle for push jobs. Disabled when APNs is not configured.
#[derive(Clone)]
pub struct PushQueue {
    queue: Option<Arc<JobQueue<PushJob>>>,
}

impl PushQueue {
    /// A queue that reports `NotEnabled` for every job
    pub fn disabled() -> Self {
        Self { queue: None }
    }

    /// Wrap a queue whose worker is driven elsewhere
    pub fn from_queue(queue: JobQueue<PushJob>) -> Self {
        Self {
            queue: Some(Arc::new(queue)),
        }
    }

    /// Start push delivery when configuration allows, otherwise disable it
    pub fn start(config: &PushConfig, store: Store) -> Self {
        let Some(apns) = &config.apns else {
            warn!("APNs credentials not configured, push notifications disabled");
            return Self::disabled();
        };

        match ApnsClient::from_config(apns, config.endpoint.clone()) {
            Ok(client) => {
                info!(bundle_id = %apns.bundle_id, "Push notifications enabled");
                PushWorker::new(store, Arc::new(client)).spawn(config.queue_capacity)
            }
            Err(e) => {
                warn!(error = %e, "APNs key unusable, push notifications disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Enqueue without waiting
    pub fn enqueue(&self, job: PushJob) -> AppResult<()> {
        match &self.queue {
            Some(queue) => queue.submit(job),
            None => Err(AppError::NotEnabled("push")),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the worker and wait for the job in hand
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.queue {
            queue.shutdown().await;
        }
    }
}

/// Counts for one delivered job
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub deactivated: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Posts notifications for push jobs
#[derive(Clone)]
pub struct PushWorker {
    store: Store,
    registry: DeviceTokenRegistry,
    client: Arc<ApnsClient>,
}

impl PushWorker {
    pub fn new(store: Store, client: Arc<ApnsClient>) -> Self {
        Self {
            registry: DeviceTokenRegistry::new(store.clone()),
            store,
            client,
        }
    }

    /// Start the single worker behind a queue of `capacity` jobs
    pub fn spawn(self, capacity: usize) -> PushQueue {
        let (queue, mut rx) = JobQueue::bounded("push", capacity);

        let handle = tokio::spawn(async move {
            info!("Push worker started");
            while let Some(job) = rx.next().await {
                self.deliver(job).await;
            }
            info!("Push worker stopped");
        });
        queue.attach(handle);

        PushQueue::from_queue(queue)
    }

    /// Attempt every active device of every recipient once
    pub async fn deliver(&self, job: PushJob) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let message_id = job.message_id;

        let recipients = job.recipient_user_ids.clone();
        let devices = match self
            .store
            .view_blocking(move |tx| {
                let mut devices = Vec::new();
                for user_id in recipients {
                    devices.extend(tokens_for_user_in(tx, user_id)?);
                }
                Ok(devices)
            })
            .await
        {
            Ok(devices) => devices,
            Err(e) => {
                warn!(message_id, error = %e, "Failed to load device tokens");
                return report;
            }
        };

        if devices.is_empty() {
            debug!(message_id, "No devices to notify");
            return report;
        }

        let payload = build_payload(&job);
        for device in devices {
            self.deliver_one(message_id, &device, &payload, &mut report)
                .await;
        }

        info!(
            message_id,
            delivered = report.delivered,
            deactivated = report.deactivated,
            failed = report.failed,
            "Push job finished"
        );
        report
    }

    async fn deliver_one(
        &self,
        message_id: u64,
        device: &DeviceToken,
        payload: &serde_json::Value,
        report: &mut DeliveryReport,
    ) {
        // Only APNs is wired up
        if device.platform != Platform::Ios {
            report.skipped += 1;
            return;
        }

        match self.client.send(device, payload).await {
            Ok(()) => {
                debug!(message_id, token_id = device.id, "Push delivered");
                metrics::record_push_delivery("delivered");
                report.delivered += 1;
            }
            Err(AppError::TokenRejected(reason)) => {
                info!(message_id, token_id = device.id, %reason, "Device token rejected, deactivating");
                metrics::record_push_delivery("token_rejected");
                match self.registry.deactivate_by_id(device.id).await {
                    Ok(_) => report.deactivated += 1,
                    Err(e) => {
                        warn!(token_id = device.id, error = %e, "Failed to deactivate device token")
                    }
                }
            }
            Err(e) => {
                warn!(message_id, token_id = device.id, error = %e, "Push delivery failed");
                metrics::record_push_delivery("failed");
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PushJob {
        PushJob {
            message_id: 1,
            family_id: 7,
            sender_id: 10,
            sender_name: "Ada".into(),
            content: "hi".into(),
            recipient_user_ids: vec![11],
        }
    }

    #[test]
    fn test_disabled_queue_reports_not_enabled() {
        let queue = PushQueue::disabled();
        assert!(!queue.is_enabled());
        assert!(matches!(queue.enqueue(job()), Err(AppError::NotEnabled("push"))));
    }

    #[test]
    fn test_incomplete_config_disables_push() {
        let config = PushConfig {
            apns: None,
            queue_capacity: 4,
            endpoint: None,
            allow_token_transfer: true,
        };
        let (_dir, store) = crate::store::test_store();
        assert!(!PushQueue::start(&config, store).is_enabled());
    }

    #[test]
    fn test_full_queue_reports_queue_full() {
        let (queue, _rx) = JobQueue::bounded("push", 1);
        let queue = PushQueue::from_queue(queue);

        queue.enqueue(job()).unwrap();
        assert!(matches!(queue.enqueue(job()), Err(AppError::QueueFull("push"))));
        assert_eq!(queue.len(), 1);
    }
}
