//! ESME sessions against a live SMPP listener

use async_trait::async_trait;
use bytes::Bytes;
use smsc::dispatcher::{Dispatcher, SubmitOutcome, Transport};
use smsc::error::TransportError;
use smsc::queue::{DeliveryConfig, DeliveryQueue, FanoutSink, StatusSink};
use smsc::registry::OperatorRegistry;
use smsc::routing::Router;
use smsc::smpp::io::{write_pdu, Frame, PduReader};
use smsc::smpp::server::SessionContext;
use smsc::smpp::{status, Bind, Body, Pdu, SessionConfig, SessionRegistry, SmBody, SmppServer};
use smsc::Gateway;
use smsc_core::{Message, OperatorId, OperatorRecord, OperatorStatus, RoutingRule, TransportBinding};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

struct Handset;

#[async_trait]
impl Transport for Handset {
    fn name(&self) -> &str {
        "handset"
    }

    async fn send(&self, _message: &Message) -> Result<SubmitOutcome, TransportError> {
        Ok(SubmitOutcome {
            remote_id: None,
            delivered: true,
        })
    }
}

struct Smsc {
    server: SmppServer,
    address: SocketAddr,
    queue: DeliveryQueue,
}

impl Smsc {
    async fn start() -> Self {
        let operator = OperatorId::new("uk-mobile");
        let registry = Arc::new(
            OperatorRegistry::with_operators(
                100,
                [OperatorRecord {
                    id: operator.clone(),
                    name: "UK Mobile".to_string(),
                    priority: 1,
                    weight: 100,
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
                    id: "uk".to_string(),
                    pattern: "44*".to_string(),
                    operator_id: operator.clone(),
                    priority: 1,
                    weight: None,
                }],
                None,
            )
            .unwrap(),
        );
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.bind(operator, Arc::new(Handset));

        let sessions = Arc::new(SessionRegistry::new());
        let sinks: Vec<Arc<dyn StatusSink>> = vec![sessions.clone()];
        let queue = DeliveryQueue::new(
            DeliveryConfig::default(),
            registry,
            dispatcher,
            Arc::new(FanoutSink::new(sinks)),
        );
        let gateway = Arc::new(Gateway::new(router, queue.clone()));

        let mut credentials = HashMap::new();
        credentials.insert("esme1".to_string(), "secret".to_string());
        let context = SessionContext {
            config: Arc::new(SessionConfig::default()),
            credentials: Arc::new(credentials),
            submitter: gateway,
            registry: sessions,
            max_pdu_size: 4096,
        };
        let server = SmppServer::new(context, 8);
        let address = server.start("127.0.0.1:0").await.unwrap();
        Self {
            server,
            address,
            queue,
        }
    }

    async fn stop(self) {
        self.server.shutdown(Duration::from_secs(1)).await;
        self.queue.shutdown(Duration::from_secs(1)).await;
    }
}

struct Esme {
    frames: PduReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Esme {
    async fn connect(address: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(address).await.unwrap().into_split();
        Self {
            frames: PduReader::new(reader, 4096),
            writer,
        }
    }

    async fn send(&mut self, pdu: Pdu) {
        write_pdu(&mut self.writer, &pdu).await.unwrap();
    }

    async fn recv(&mut self) -> Pdu {
        match timeout(Duration::from_secs(5), self.frames.next()).await {
            Ok(Ok(Some(Frame::Pdu(pdu)))) => pdu,
            other => panic!("expected a PDU, got {other:?}"),
        }
    }

    async fn bind(&mut self, password: &str) -> Pdu {
        self.send(Pdu::new(
            1,
            Body::BindTransceiver(Bind {
                system_id: "esme1".to_string(),
                password: password.to_string(),
                interface_version: 0x34,
                ..Default::default()
            }),
        ))
        .await;
        self.recv().await
    }
}

fn submit(seq: u32, destination: &str, registered_delivery: u8) -> Pdu {
    Pdu::new(
        seq,
        Body::SubmitSm(SmBody {
            source_addr_ton: 1,
            source_addr_npi: 1,
            source_addr: "447700900001".to_string(),
            dest_addr_ton: 1,
            dest_addr_npi: 1,
            destination_addr: destination.to_string(),
            registered_delivery,
            short_message: Bytes::from_static(b"Hello from the test"),
            ..Default::default()
        }),
    )
}

#[tokio::test]
async fn test_submit_is_acknowledged_then_receipted() {
    let smsc = Smsc::start().await;
    let mut esme = Esme::connect(smsc.address).await;

    let resp = esme.bind("secret").await;
    assert_eq!(resp.command_status, status::ESME_ROK);
    assert!(matches!(resp.body, Body::BindTransceiverResp(_)));

    esme.send(submit(2, "447700900123", 1)).await;

    // The receipt may overtake the submit response on the wire
    let mut message_id = None;
    let mut receipt = None;
    while message_id.is_none() || receipt.is_none() {
        let pdu = esme.recv().await;
        match pdu.body {
            Body::SubmitSmResp { message_id: id } => {
                assert_eq!(pdu.sequence_number, 2);
                assert_eq!(pdu.command_status, status::ESME_ROK);
                message_id = Some(id);
            }
            Body::DeliverSm(sm) => {
                esme.send(Pdu::new(
                    pdu.sequence_number,
                    Body::DeliverSmResp {
                        message_id: String::new(),
                    },
                ))
                .await;
                receipt = Some(String::from_utf8_lossy(&sm.short_message).into_owned());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    let (message_id, receipt) = (message_id.unwrap(), receipt.unwrap());
    assert!(!message_id.is_empty());
    assert!(receipt.starts_with(&format!("id:{message_id} ")), "{receipt}");
    assert!(receipt.contains("stat:DELIVRD"), "{receipt}");
    assert_eq!(smsc.queue.stats().delivered, 1);

    esme.send(Pdu::new(3, Body::Unbind)).await;
    assert_eq!(esme.recv().await.body, Body::UnbindResp);
    smsc.stop().await;
}

#[tokio::test]
async fn test_unroutable_destination_is_refused() {
    let smsc = Smsc::start().await;
    let mut esme = Esme::connect(smsc.address).await;
    assert_eq!(esme.bind("secret").await.command_status, status::ESME_ROK);

    esme.send(submit(2, "15551234", 0)).await;
    let resp = esme.recv().await;
    assert_eq!(resp.sequence_number, 2);
    assert_eq!(resp.command_status, status::ESME_RINVDSTADR);
    assert_eq!(smsc.queue.stats().rejected, 1);
    smsc.stop().await;
}

#[tokio::test]
async fn test_wrong_password_is_refused_and_session_stays_open() {
    let smsc = Smsc::start().await;
    let mut esme = Esme::connect(smsc.address).await;

    let resp = esme.bind("guess").await;
    assert_eq!(resp.command_status, status::ESME_RINVPASWD);

    // One failed attempt does not close the connection
    let resp = esme.bind("secret").await;
    assert_eq!(resp.command_status, status::ESME_ROK);
    smsc.stop().await;
}

#[tokio::test]
async fn test_enquire_link_is_answered() {
    let smsc = Smsc::start().await;
    let mut esme = Esme::connect(smsc.address).await;
    esme.bind("secret").await;

    esme.send(Pdu::new(7, Body::EnquireLink)).await;
    let resp = esme.recv().await;
    assert_eq!(resp.sequence_number, 7);
    assert_eq!(resp.body, Body::EnquireLinkResp);
    assert_eq!(smsc.server.active_sessions(), 1);
    smsc.stop().await;
}
