//! Inbound submissions: route, then queue
//!
//! SMPP sessions call [`Gateway`] through the `Submitter` seam; SIGTRAN
//! MO messages and SMPP client receipts arrive over channels drained by the
//! loops at the bottom of this file.

use smsc_core::{Message, MessageId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::queue::DeliveryQueue;
use crate::routing::Router;
use crate::smpp::client::ClientReceipt;
use crate::smpp::{SubmitError, Submitter};

pub struct Gateway {
    router: Arc<Router>,
    queue: DeliveryQueue,
}

impl Gateway {
    pub fn new(router: Arc<Router>, queue: DeliveryQueue) -> Self {
        Self { router, queue }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Resolve and admit one message. A destination with no route is
    /// recorded as `rejected` before the error is returned.
    pub fn accept(&self, message: Message) -> Result<MessageId, SubmitError> {
        let candidates = match self.router.resolve(&message.destination.digits) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.queue.reject(message, e.to_string());
                return Err(SubmitError::NoRoute);
            }
        };
        debug!(
            message_id = %message.id,
            destination = %message.destination,
            candidates = candidates.len(),
            "Routed"
        );
        self.queue.submit(message, candidates).map_err(|e| match e {
            QueueError::Backpressure { .. } => SubmitError::Backpressure,
            QueueError::NoCandidates => SubmitError::NoRoute,
            QueueError::UnknownOperator(_) | QueueError::ShuttingDown => SubmitError::Unavailable,
        })
    }
}

impl Submitter for Gateway {
    fn submit(&self, message: Message) -> Result<MessageId, SubmitError> {
        self.accept(message)
    }
}

/// Feed mobile-originated messages from the SIGTRAN stack into the gateway
pub async fn run_mobile_originated(
    gateway: Arc<Gateway>,
    mut inbound: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = inbound.recv() => {
                let Some(message) = received else { break };
                let id = message.id.clone();
                let source = message.client_id.clone().unwrap_or_default();
                match gateway.accept(message) {
                    Ok(_) => debug!(message_id = %id, remote = %source, "MO message accepted"),
                    Err(e) => warn!(message_id = %id, remote = %source, error = ?e, "MO message refused"),
                }
            }
        }
    }
    info!("MO relay stopped");
}

/// Apply receipts reported by outbound SMPP clients
pub async fn run_receipts(
    queue: DeliveryQueue,
    mut receipts: mpsc::Receiver<ClientReceipt>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = receipts.recv() => {
                let Some(receipt) = received else { break };
                if !queue.on_receipt(&receipt.operator, &receipt.remote_id, receipt.delivered) {
                    debug!(
                        operator = %receipt.operator,
                        remote_id = %receipt.remote_id,
                        "Receipt matched no sent message"
                    );
                }
            }
        }
    }
    info!("Receipt relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::queue::{DeliveryConfig, NullSink};
    use crate::registry::OperatorRegistry;
    use smsc_core::{Address, OperatorId, OperatorRecord, OperatorStatus, RoutingRule, TransportBinding};

    fn gateway(depth: usize) -> Gateway {
        let registry = Arc::new(
            OperatorRegistry::with_operators(
                10,
                [OperatorRecord {
                    id: OperatorId::new("a"),
                    name: "a".to_string(),
                    priority: 1,
                    weight: 1,
                    max_tps: 100,
                    status: OperatorStatus::Active,
                    transport: TransportBinding::None,
                }],
            )
            .unwrap(),
        );
        let router = Arc::new(
            Router::with_rules(
                registry.clone(),
                vec![RoutingRule {
                    id: "us".to_string(),
                    pattern: "1*".to_string(),
                    operator_id: OperatorId::new("a"),
                    priority: 1,
                    weight: None,
                }],
                None,
            )
            .unwrap(),
        );
        let config = DeliveryConfig {
            max_queue_depth: depth,
            ..Default::default()
        };
        let queue = DeliveryQueue::new(config, registry, Arc::new(Dispatcher::new()), Arc::new(NullSink));
        Gateway::new(router, queue)
    }

    fn message(destination: &str) -> Message {
        Message::new(
            Address::international("15550001"),
            Address::international(destination),
            b"hi".to_vec(),
        )
    }

    #[tokio::test]
    async fn test_unrouted_destination_is_rejected() {
        let gateway = gateway(10);
        assert_eq!(gateway.submit(message("4420")), Err(SubmitError::NoRoute));
        assert_eq!(gateway.queue().stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_backpressure() {
        let gateway = gateway(1);
        assert!(gateway.submit(message("15551234")).is_ok());
        assert_eq!(
            gateway.submit(message("15551235")),
            Err(SubmitError::Backpressure)
        );
    }
}
