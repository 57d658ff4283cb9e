//! Submit-side delivery protocol.
//!
//! Each attempt sends the update under a fresh correlation id and waits for
//! the matching confirmation. Attempts repeat with a fixed backoff until
//! one succeeds, the attempt budget is spent, or the fail timeout passes.

use super::registry::AckRegistry;
use super::transport::{DeliveryConfirmation, Envelope, Transport};
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::metric::QueryMetricUpdate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct DeliveryCoordinator {
    transport: Arc<dyn Transport>,
    registry: AckRegistry,
    config: DeliveryConfig,
}

impl DeliveryCoordinator {
    pub fn new(transport: Arc<dyn Transport>, config: DeliveryConfig) -> Self {
        DeliveryCoordinator {
            transport,
            registry: AckRegistry::new(),
            config,
        }
    }

    pub fn registry(&self) -> &AckRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// One send-and-wait attempt, taking at most `ack_timeout`
    pub async fn submit_once(&self, update: &QueryMetricUpdate) -> Result<(), DeliveryError> {
        self.attempt(update, self.config.ack_timeout).await
    }

    async fn attempt(&self, update: &QueryMetricUpdate, wait: Duration) -> Result<(), DeliveryError> {
        let correlation_id = Uuid::new_v4();
        let latch = self
            .config
            .ack_enabled
            .then(|| self.registry.register(correlation_id));

        let envelope = Envelope {
            correlation_id,
            update: update.clone(),
        };
        let result = self.send_and_wait(envelope, latch, wait).await;

        self.registry.remove(&correlation_id);
        trace!(%correlation_id, query_id = update.query_id(), ok = result.is_ok(), "delivery attempt");
        result
    }

    /// Send and wait for the confirmation; both share the `wait` budget
    async fn send_and_wait(
        &self,
        envelope: Envelope,
        latch: Option<oneshot::Receiver<()>>,
        wait: Duration,
    ) -> Result<(), DeliveryError> {
        let deadline = tokio::time::Instant::now() + wait;
        match tokio::time::timeout_at(deadline, self.transport.send(envelope)).await {
            Ok(sent) => sent?,
            Err(_) => {
                return Err(DeliveryError::SendFailed(format!(
                    "transport did not accept update within {:?}",
                    wait
                )))
            }
        }
        let Some(latch) = latch else {
            return Ok(());
        };
        match tokio::time::timeout_at(deadline, latch).await {
            Ok(Ok(())) => Ok(()),
            // Latch dropped without firing, or no confirmation in time
            Ok(Err(_)) | Err(_) => Err(DeliveryError::AckTimeout),
        }
    }

    /// Deliver `update`, retrying per the configured policy
    pub async fn submit(&self, update: &QueryMetricUpdate) -> Result<(), DeliveryError> {
        update
            .validate()
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;

        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            let remaining = self.config.fail_timeout.saturating_sub(start.elapsed());
            attempts += 1;
            let wait = self.config.ack_timeout.min(remaining);

            match self.attempt(update, wait).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    query_id = update.query_id(),
                    attempt = attempts,
                    error = %e,
                    "delivery attempt failed"
                ),
            }

            let remaining = self.config.fail_timeout.saturating_sub(start.elapsed());
            if attempts >= self.config.max_attempts || remaining.is_zero() {
                return Err(DeliveryError::RetriesExhausted {
                    attempts,
                    elapsed: start.elapsed(),
                });
            }
            tokio::time::sleep(self.config.backoff.min(remaining)).await;
        }
    }

    /// Submit a batch concurrently; one result per update, in order
    pub async fn submit_all(&self, updates: &[QueryMetricUpdate]) -> Vec<Result<(), DeliveryError>> {
        futures::future::join_all(updates.iter().map(|u| self.submit(u))).await
    }

    /// Route confirmations to waiting submitters until the channel closes
    pub fn spawn_ack_listener(
        &self,
        mut confirmations: mpsc::UnboundedReceiver<DeliveryConfirmation>,
    ) -> JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            while let Some(confirmation) = confirmations.recv().await {
                let id = confirmation.correlation_id;
                if !registry.complete(&id) {
                    debug!(correlation_id = %id, "confirmation for unknown correlation id");
                }
            }
            debug!("ack listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::transport::{ChannelTransport, ConfirmationSender};
    use crate::metric::QueryMetric;

    fn update() -> QueryMetricUpdate {
        QueryMetricUpdate::distributed(QueryMetric::new("q1"))
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            ack_enabled: true,
            ack_timeout: Duration::from_millis(30),
            fail_timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_acknowledged_submit() {
        let (transport, mut envelopes) = ChannelTransport::new(8);
        let (confirm, confirmations) = ConfirmationSender::channel();
        let coordinator = DeliveryCoordinator::new(Arc::new(transport), config());
        coordinator.spawn_ack_listener(confirmations);

        tokio::spawn(async move {
            while let Some(envelope) = envelopes.recv().await {
                confirm.confirm(envelope.correlation_id);
            }
        });

        coordinator.submit(&update()).await.unwrap();
        assert_eq!(coordinator.registry().pending(), 0);
    }

    #[tokio::test]
    async fn test_unacknowledged_submit_exhausts_attempts() {
        let (transport, mut envelopes) = ChannelTransport::new(8);
        let coordinator = DeliveryCoordinator::new(Arc::new(transport), config());
        let consumer = tokio::spawn(async move {
            let mut seen = 0;
            while envelopes.recv().await.is_some() {
                seen += 1;
            }
            seen
        });

        let err = coordinator.submit(&update()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(coordinator.registry().pending(), 0);

        drop(coordinator);
        assert_eq!(consumer.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_submit_once_times_out_without_retry() {
        let (transport, mut envelopes) = ChannelTransport::new(8);
        let coordinator = DeliveryCoordinator::new(Arc::new(transport), config());

        let err = coordinator.submit_once(&update()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::AckTimeout));
        assert!(envelopes.try_recv().is_ok());
        assert!(envelopes.try_recv().is_err());
        assert_eq!(coordinator.registry().pending(), 0);
    }

    #[tokio::test]
    async fn test_stalled_transport_bounded_by_fail_timeout() {
        // Capacity one and never drained: the second send blocks
        let (transport, _envelopes) = ChannelTransport::new(1);
        let mut cfg = config();
        cfg.fail_timeout = Duration::from_millis(200);
        let coordinator = DeliveryCoordinator::new(Arc::new(transport), cfg);

        let started = Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(2), coordinator.submit(&update()))
            .await
            .expect("submit returned within its fail timeout");
        assert!(matches!(result, Err(DeliveryError::RetriesExhausted { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(coordinator.registry().pending(), 0);
    }

    #[tokio::test]
    async fn test_submit_once_send_times_out() {
        let (transport, _envelopes) = ChannelTransport::new(1);
        let mut cfg = config();
        cfg.ack_enabled = false;
        let coordinator = DeliveryCoordinator::new(Arc::new(transport), cfg);

        coordinator.submit_once(&update()).await.unwrap();
        let err = coordinator.submit_once(&update()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::SendFailed(_)));
    }

    #[tokio::test]
    async fn test_ack_disabled_succeeds_on_send() {
        let (transport, _envelopes) = ChannelTransport::new(8);
        let mut cfg = config();
        cfg.ack_enabled = false;
        let coordinator = DeliveryCoordinator::new(Arc::new(transport), cfg);
        coordinator.submit(&update()).await.unwrap();
        assert_eq!(coordinator.registry().pending(), 0);
    }

    #[tokio::test]
    async fn test_invalid_update_rejected_without_send() {
        let (transport, mut envelopes) = ChannelTransport::new(8);
        let coordinator = DeliveryCoordinator::new(Arc::new(transport), config());
        let err = coordinator
            .submit(&QueryMetricUpdate::distributed(QueryMetric::new(" ")))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(_)));
        assert!(envelopes.try_recv().is_err());
    }
}
