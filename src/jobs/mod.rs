use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub mod queue;
pub mod tasks;

/// KV health probe period
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Queue depth and connection gauge refresh period
pub const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
    stop: watch::Sender<bool>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        let (stop, _) = watch::channel(false);
        Self { context, stop }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::health_check_job(Arc::clone(&self)));
        tokio::spawn(Self::gauge_refresh_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Stop every periodic job
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(HEALTH_CHECK_INTERVAL);
        let mut stop = scheduler.stop.subscribe();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {}
            }

            match tasks::health_check(&scheduler.context).await {
                Ok(_) => crate::metrics::record_background_job("health_check", "success"),
                Err(e) => {
                    crate::metrics::record_background_job("health_check", "failure");
                    error!("Health check failed: {}", e)
                }
            }
        }
    }

    /// Gauge refresh job (runs every 15 seconds)
    async fn gauge_refresh_job(scheduler: Arc<Self>) {
        let mut interval = interval(GAUGE_REFRESH_INTERVAL);
        let mut stop = scheduler.stop.subscribe();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {}
            }

            tasks::refresh_gauges(&scheduler.context);
        }
    }
}
