//! Transport boundary between submitters and the update processor.

use crate::error::DeliveryError;
use crate::metric::QueryMetricUpdate;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Update tagged with the submitter's correlation id
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub correlation_id: Uuid,
    pub update: QueryMetricUpdate,
}

/// Notice that the envelope with `correlation_id` was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfirmation {
    pub correlation_id: Uuid,
}

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;

/// Outbound message transport
pub trait Transport: Send + Sync + 'static {
    fn send(&self, envelope: Envelope) -> SendFuture<'_>;
}

/// In-process transport over a bounded tokio channel
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Envelope>,
}

impl ChannelTransport {
    /// Transport plus the receiving end for the consumer
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChannelTransport { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: Envelope) -> SendFuture<'_> {
        Box::pin(async move {
            self.tx
                .send(envelope)
                .await
                .map_err(|_| DeliveryError::SendFailed("transport channel closed".to_string()))
        })
    }
}

/// Publishes delivery confirmations on the acknowledgment channel
#[derive(Clone)]
pub struct ConfirmationSender {
    tx: mpsc::UnboundedSender<DeliveryConfirmation>,
}

impl ConfirmationSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeliveryConfirmation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConfirmationSender { tx }, rx)
    }

    /// Returns false if nobody is listening for confirmations
    pub fn confirm(&self, correlation_id: Uuid) -> bool {
        self.tx.send(DeliveryConfirmation { correlation_id }).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::QueryMetric;

    #[tokio::test]
    async fn test_channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::new(4);
        let envelope = Envelope {
            correlation_id: Uuid::new_v4(),
            update: QueryMetricUpdate::distributed(QueryMetric::new("q1")),
        };
        transport.send(envelope.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(envelope));
    }

    #[tokio::test]
    async fn test_send_fails_without_consumer() {
        let (transport, rx) = ChannelTransport::new(1);
        drop(rx);
        let err = transport
            .send(Envelope {
                correlation_id: Uuid::new_v4(),
                update: QueryMetricUpdate::distributed(QueryMetric::new("q1")),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::SendFailed(_)));
    }

    #[test]
    fn test_confirmation_sender() {
        let (sender, mut rx) = ConfirmationSender::channel();
        let id = Uuid::new_v4();
        assert!(sender.confirm(id));
        assert_eq!(rx.try_recv().unwrap().correlation_id, id);
        drop(rx);
        assert!(!sender.confirm(id));
    }
}
