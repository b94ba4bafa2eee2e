//! Hands messages to the transport bound to an operator

use async_trait::async_trait;
use parking_lot::RwLock;
use smsc_core::{Message, OperatorId, OperatorRecord, TransportBinding};
use smsc_sigtran::SigtranStack;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::smpp::client::{ClientReceipt, SmppClient, SmppClientConfig};

/// What the far side told us about an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitOutcome {
    /// Id assigned downstream, used to match a later receipt
    pub remote_id: Option<String>,
    /// The network confirmed delivery to the handset
    pub delivered: bool,
}

/// Outbound path to one operator
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn send(&self, message: &Message) -> Result<SubmitOutcome, TransportError>;

    /// Release the connection; later sends fail as unavailable
    async fn close(&self) {}
}

/// MT-ForwardSM through a SIGTRAN remote. A positive MAP answer means the
/// MSC delivered the message.
pub struct SigtranTransport {
    stack: Arc<SigtranStack>,
    remote: String,
}

impl SigtranTransport {
    pub fn new(stack: Arc<SigtranStack>, remote: impl Into<String>) -> Self {
        Self {
            stack,
            remote: remote.into(),
        }
    }
}

#[async_trait]
impl Transport for SigtranTransport {
    fn name(&self) -> &str {
        &self.remote
    }

    async fn send(&self, message: &Message) -> Result<SubmitOutcome, TransportError> {
        let receipt = self.stack.submit(&self.remote, message).await?;
        Ok(SubmitOutcome {
            remote_id: Some(receipt.transaction_id.to_string()),
            delivered: true,
        })
    }
}

#[derive(Default)]
pub struct Dispatcher {
    bindings: RwLock<HashMap<OperatorId, Arc<dyn Transport>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a transport, returning the one it replaces
    pub fn bind(&self, operator: OperatorId, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        info!(operator = %operator, transport = transport.name(), "Transport bound");
        self.bindings.write().insert(operator, transport)
    }

    pub fn unbind(&self, operator: &OperatorId) -> Option<Arc<dyn Transport>> {
        self.bindings.write().remove(operator)
    }

    pub fn transport(&self, operator: &OperatorId) -> Option<Arc<dyn Transport>> {
        self.bindings.read().get(operator).cloned()
    }

    pub fn is_bound(&self, operator: &OperatorId) -> bool {
        self.bindings.read().contains_key(operator)
    }

    pub async fn dispatch(
        &self,
        operator: &OperatorId,
        message: &Message,
    ) -> Result<SubmitOutcome, TransportError> {
        let transport = self
            .transport(operator)
            .ok_or_else(|| TransportError::Unavailable(format!("no transport for {}", operator)))?;
        debug!(operator = %operator, message_id = %message.id, transport = transport.name(), "Dispatching");
        transport.send(message).await
    }

    pub async fn close_all(&self) {
        let transports: Vec<Arc<dyn Transport>> =
            self.bindings.write().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.close().await;
        }
    }
}

/// Builds transports from operator definitions
pub struct TransportFactory {
    sigtran: Option<Arc<SigtranStack>>,
    client_defaults: SmppClientConfig,
    receipts: mpsc::Sender<ClientReceipt>,
}

impl TransportFactory {
    pub fn new(
        sigtran: Option<Arc<SigtranStack>>,
        client_defaults: SmppClientConfig,
        receipts: mpsc::Sender<ClientReceipt>,
    ) -> Self {
        Self {
            sigtran,
            client_defaults,
            receipts,
        }
    }

    /// `None` when the operator has no usable outbound path
    pub fn build(&self, operator: &OperatorRecord) -> Option<Arc<dyn Transport>> {
        match &operator.transport {
            TransportBinding::Smpp {
                host,
                port,
                system_id,
                password,
                system_type,
            } => {
                let config = SmppClientConfig {
                    host: host.clone(),
                    port: *port,
                    system_id: system_id.clone(),
                    password: password.clone(),
                    system_type: system_type.clone(),
                    ..self.client_defaults.clone()
                };
                let client = SmppClient::start(operator.id.clone(), config, self.receipts.clone());
                Some(Arc::new(client))
            }
            TransportBinding::Sigtran { remote } => match &self.sigtran {
                Some(stack) => Some(Arc::new(SigtranTransport::new(stack.clone(), remote.clone()))),
                None => {
                    warn!(operator = %operator.id, remote = %remote, "SIGTRAN disabled, operator has no transport");
                    None
                }
            },
            TransportBinding::None => None,
        }
    }

    /// Rebuild the binding for `operator`, closing the old transport
    pub async fn rebind(&self, dispatcher: &Dispatcher, operator: &OperatorRecord) {
        let replaced = match self.build(operator) {
            Some(transport) => dispatcher.bind(operator.id.clone(), transport),
            None => dispatcher.unbind(&operator.id),
        };
        if let Some(old) = replaced {
            old.close().await;
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.client_defaults.response_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smsc_core::Address;

    struct Fixed(Result<SubmitOutcome, TransportError>);

    #[async_trait]
    impl Transport for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn send(&self, _message: &Message) -> Result<SubmitOutcome, TransportError> {
            self.0.clone()
        }
    }

    fn message() -> Message {
        Message::new(
            Address::international("1"),
            Address::international("2"),
            b"x".to_vec(),
        )
    }

    #[tokio::test]
    async fn test_missing_binding_is_unavailable() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .dispatch(&OperatorId::new("a"), &message())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_dispatch_and_rebind() {
        let dispatcher = Dispatcher::new();
        let a = OperatorId::new("a");
        dispatcher.bind(
            a.clone(),
            Arc::new(Fixed(Ok(SubmitOutcome {
                remote_id: Some("r1".to_string()),
                delivered: false,
            }))),
        );
        let outcome = dispatcher.dispatch(&a, &message()).await.unwrap();
        assert_eq!(outcome.remote_id.as_deref(), Some("r1"));

        let old = dispatcher.bind(a.clone(), Arc::new(Fixed(Err(TransportError::Timeout))));
        assert!(old.is_some());
        assert_eq!(
            dispatcher.dispatch(&a, &message()).await,
            Err(TransportError::Timeout)
        );

        dispatcher.close_all().await;
        assert!(!dispatcher.is_bound(&a));
    }

    #[tokio::test]
    async fn test_factory_without_sigtran() {
        let (tx, _rx) = mpsc::channel(1);
        let factory = TransportFactory::new(None, SmppClientConfig::default(), tx);
        let record = OperatorRecord {
            id: OperatorId::new("s"),
            name: "s".to_string(),
            priority: 1,
            weight: 1,
            max_tps: 1,
            status: Default::default(),
            transport: TransportBinding::Sigtran {
                remote: "stp".to_string(),
            },
        };
        assert!(factory.build(&record).is_none());

        let dispatcher = Dispatcher::new();
        factory.rebind(&dispatcher, &record).await;
        assert!(!dispatcher.is_bound(&record.id));
    }
}
