pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod meetings;
pub mod notifications;
pub mod payments;
pub mod scheduling;

#[cfg(test)]
pub(crate) mod test_support;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::api::rate_limit::RateLimiter;
use crate::engine::MeetingJob;
use crate::notifications::NotificationService;
use crate::payments::PaymentGateways;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    /// Work for the meeting sync engine, processed in order
    pub meeting_tx: mpsc::Sender<MeetingJob>,
    pub notifier: Arc<NotificationService>,
    pub payments: Arc<PaymentGateways>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: DbPool,
        meeting_tx: mpsc::Sender<MeetingJob>,
        notifier: Arc<NotificationService>,
        payments: Arc<PaymentGateways>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            config,
            db,
            meeting_tx,
            notifier,
            payments,
            rate_limiter,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
