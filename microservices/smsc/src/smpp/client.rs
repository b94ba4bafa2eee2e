//! Outbound SMPP client (ESME role) towards an operator SMSC
//!
//! One task owns the TCP connection: it binds as a transceiver, writes
//! `submit_sm` requests handed over a channel, matches `submit_sm_resp` by
//! sequence number and forwards delivery receipts. When the connection drops
//! every pending request fails with `ConnectionLost` and the task reconnects
//! with exponential backoff.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use smsc_core::{Message, OperatorId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::io::{write_pdu, Frame, PduReader};
use super::pdu::{tag, Bind, Body, Pdu, SmBody, Tlv, MAX_SHORT_MESSAGE};
use super::{receipt, status, INTERFACE_VERSION};
use crate::dispatcher::{SubmitOutcome, Transport};
use crate::error::TransportError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmppClientConfig {
    pub host: String,
    pub port: u16,
    pub system_id: String,
    pub password: String,
    pub system_type: String,
    #[serde(with = "millis")]
    pub response_timeout: Duration,
    #[serde(with = "millis")]
    pub enquire_link_interval: Duration,
    #[serde(with = "millis")]
    pub reconnect_base: Duration,
    #[serde(with = "millis")]
    pub reconnect_max: Duration,
    pub max_pdu_size: usize,
    pub window: usize,
}

impl Default for SmppClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2775,
            system_id: String::new(),
            password: String::new(),
            system_type: String::new(),
            response_timeout: Duration::from_secs(10),
            enquire_link_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            max_pdu_size: super::pdu::DEFAULT_MAX_PDU_SIZE,
            window: 64,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl SmppClientConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Delay before reconnect attempt `attempt` (0-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.reconnect_max)
    }
}

/// Receipt received from an operator for a message we submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReceipt {
    pub operator: OperatorId,
    pub remote_id: String,
    pub delivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Binding,
    Bound,
    Stopped,
}

struct SubmitRequest {
    sm: SmBody,
    reply: oneshot::Sender<Result<String, TransportError>>,
}

struct PendingSubmit {
    reply: oneshot::Sender<Result<String, TransportError>>,
    deadline: Instant,
}

pub struct SmppClient {
    operator: OperatorId,
    config: SmppClientConfig,
    state: Arc<RwLock<ClientState>>,
    requests: mpsc::Sender<SubmitRequest>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SmppClient {
    /// Spawn the connection task; receipts go to `receipts`
    pub fn start(
        operator: OperatorId,
        config: SmppClientConfig,
        receipts: mpsc::Sender<ClientReceipt>,
    ) -> Self {
        let (requests, requests_rx) = mpsc::channel(config.window.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(RwLock::new(ClientState::Disconnected));

        let task = tokio::spawn(connection_loop(Connection {
            operator: operator.clone(),
            config: config.clone(),
            state: state.clone(),
            requests: requests_rx,
            receipts,
            shutdown: shutdown_rx,
        }));

        Self {
            operator,
            config,
            state,
            requests,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn operator(&self) -> &OperatorId {
        &self.operator
    }

    #[instrument(skip(self, message), fields(operator = %self.operator, message_id = %message.id))]
    async fn submit(&self, message: &Message) -> Result<String, TransportError> {
        if self.state() != ClientState::Bound {
            return Err(TransportError::Unavailable(format!(
                "SMPP link to {} is not bound",
                self.operator
            )));
        }
        let (reply, response) = oneshot::channel();
        self.requests
            .try_send(SubmitRequest {
                sm: submit_body(message),
                reply,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Throttled,
                mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionLost,
            })?;

        // The connection task times requests out itself; this only covers a
        // task that died holding the reply.
        let limit = self.config.response_timeout * 2;
        match tokio::time::timeout(limit, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

#[async_trait]
impl Transport for SmppClient {
    fn name(&self) -> &str {
        self.operator.as_str()
    }

    async fn send(&self, message: &Message) -> Result<SubmitOutcome, TransportError> {
        let remote_id = self.submit(message).await?;
        Ok(SubmitOutcome {
            remote_id: Some(remote_id),
            delivered: false,
        })
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(self.config.response_timeout, task).await.is_err() {
                warn!(operator = %self.operator, "SMPP client did not stop in time");
            }
        }
    }
}

impl Drop for SmppClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// `submit_sm` body for a gateway message; content longer than
/// `short_message` allows travels in `message_payload`
pub fn submit_body(message: &Message) -> SmBody {
    let mut tlvs: Vec<Tlv> = message
        .optional_params
        .iter()
        .map(|p| Tlv::new(p.tag, p.value.clone()))
        .collect();
    let short_message = if message.content.len() > MAX_SHORT_MESSAGE {
        tlvs.push(Tlv::new(tag::MESSAGE_PAYLOAD, message.content.clone()));
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&message.content)
    };

    SmBody {
        service_type: message.service_type.clone(),
        source_addr_ton: message.source.ton,
        source_addr_npi: message.source.npi,
        source_addr: message.source.digits.clone(),
        dest_addr_ton: message.destination.ton,
        dest_addr_npi: message.destination.npi,
        destination_addr: message.destination.digits.clone(),
        esm_class: message.esm_class,
        protocol_id: message.protocol_id,
        priority_flag: message.priority.as_flag(),
        // Always ask the operator for a receipt so the final state is known
        registered_delivery: 1,
        data_coding: message.data_coding,
        short_message,
        tlvs,
        ..Default::default()
    }
}

struct Connection {
    operator: OperatorId,
    config: SmppClientConfig,
    state: Arc<RwLock<ClientState>>,
    requests: mpsc::Receiver<SubmitRequest>,
    receipts: mpsc::Sender<ClientReceipt>,
    shutdown: watch::Receiver<bool>,
}

enum LinkEnd {
    Lost,
    Shutdown,
}

async fn connection_loop(mut conn: Connection) {
    let address = conn.config.address();
    let mut attempt = 0u32;

    loop {
        if *conn.shutdown.borrow() {
            break;
        }

        *conn.state.write() = ClientState::Binding;
        let connect = tokio::time::timeout(conn.config.response_timeout, TcpStream::connect(&address));
        let end = match connect.await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                match conn.run_link(stream).await {
                    Ok(end) => {
                        attempt = 0;
                        end
                    }
                    Err(e) => {
                        warn!(operator = %conn.operator, error = %e, "SMPP bind failed");
                        LinkEnd::Lost
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(operator = %conn.operator, address = %address, error = %e, "Connect failed");
                LinkEnd::Lost
            }
            Err(_) => {
                debug!(operator = %conn.operator, address = %address, "Connect timed out");
                LinkEnd::Lost
            }
        };

        *conn.state.write() = ClientState::Disconnected;
        if matches!(end, LinkEnd::Shutdown) {
            break;
        }

        let delay = conn.config.reconnect_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(operator = %conn.operator, delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = conn.shutdown.changed() => {
                if changed.is_err() || *conn.shutdown.borrow() {
                    break;
                }
            }
        }
    }

    *conn.state.write() = ClientState::Stopped;
    // Anything still queued will never be written
    conn.requests.close();
    while let Ok(request) = conn.requests.try_recv() {
        let _ = request.reply.send(Err(TransportError::ConnectionLost));
    }
    info!(operator = %conn.operator, "SMPP client stopped");
}

impl Connection {
    /// Bind, then serve the link until it drops or shutdown is requested.
    /// An error means the bind itself failed.
    async fn run_link<S>(&mut self, stream: S) -> Result<LinkEnd, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut frames = PduReader::new(reader, self.config.max_pdu_size);
        let mut next_sequence: u32 = 1;
        let mut sequence = move || {
            let seq = next_sequence;
            next_sequence = if seq >= 0x7FFF_FFFF { 1 } else { seq + 1 };
            seq
        };

        let bind_seq = sequence();
        let bind = Pdu::new(
            bind_seq,
            Body::BindTransceiver(Bind {
                system_id: self.config.system_id.clone(),
                password: self.config.password.clone(),
                system_type: self.config.system_type.clone(),
                interface_version: INTERFACE_VERSION,
                ..Default::default()
            }),
        );
        write_pdu(&mut writer, &bind)
            .await
            .map_err(|_| TransportError::ConnectionLost)?;

        let response = tokio::time::timeout(self.config.response_timeout, frames.next())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectionLost)?;
        match response {
            Some(Frame::Pdu(pdu)) if pdu.sequence_number == bind_seq => {
                if !matches!(pdu.body, Body::BindTransceiverResp(_) | Body::GenericNack) {
                    return Err(TransportError::Unavailable(format!(
                        "unexpected {} in answer to bind",
                        pdu.body.name()
                    )));
                }
                if pdu.command_status != status::ESME_ROK {
                    return Err(TransportError::Rejected(pdu.command_status));
                }
            }
            _ => return Err(TransportError::ConnectionLost),
        }

        *self.state.write() = ClientState::Bound;
        info!(operator = %self.operator, system_id = %self.config.system_id, "SMPP link bound");

        let mut pending: HashMap<u32, PendingSubmit> = HashMap::new();
        let mut enquire = tokio::time::interval(self.config.enquire_link_interval);
        enquire.reset();
        let mut sweep = tokio::time::interval(Duration::from_millis(250));
        let mut last_heard = Instant::now();

        let end = loop {
            tokio::select! {
                frame = frames.next() => {
                    let pdu = match frame {
                        Ok(Some(Frame::Pdu(pdu))) => pdu,
                        Ok(Some(Frame::Malformed { sequence_number, error })) => {
                            warn!(operator = %self.operator, error = %error, "Malformed PDU from operator");
                            let nack = Pdu::generic_nack(sequence_number, error.command_status());
                            if write_pdu(&mut writer, &nack).await.is_err() {
                                break LinkEnd::Lost;
                            }
                            continue;
                        }
                        Ok(None) | Err(_) => break LinkEnd::Lost,
                    };
                    last_heard = Instant::now();
                    match self.on_pdu(pdu, &mut pending, &mut writer).await {
                        Ok(true) => {}
                        Ok(false) => break LinkEnd::Lost,
                        Err(_) => break LinkEnd::Lost,
                    }
                }
                request = self.requests.recv() => {
                    let Some(request) = request else { break LinkEnd::Shutdown };
                    let seq = sequence();
                    let pdu = Pdu::new(seq, Body::SubmitSm(request.sm));
                    if write_pdu(&mut writer, &pdu).await.is_err() {
                        let _ = request.reply.send(Err(TransportError::ConnectionLost));
                        break LinkEnd::Lost;
                    }
                    pending.insert(seq, PendingSubmit {
                        reply: request.reply,
                        deadline: Instant::now() + self.config.response_timeout,
                    });
                }
                _ = enquire.tick() => {
                    if last_heard.elapsed() >= self.config.enquire_link_interval * 3 {
                        warn!(operator = %self.operator, "Operator stopped answering enquire_link");
                        break LinkEnd::Lost;
                    }
                    if write_pdu(&mut writer, &Pdu::new(sequence(), Body::EnquireLink)).await.is_err() {
                        break LinkEnd::Lost;
                    }
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let expired: Vec<u32> = pending
                        .iter()
                        .filter(|(_, p)| p.deadline <= now)
                        .map(|(seq, _)| *seq)
                        .collect();
                    for seq in expired {
                        if let Some(p) = pending.remove(&seq) {
                            let _ = p.reply.send(Err(TransportError::Timeout));
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        let _ = write_pdu(&mut writer, &Pdu::new(sequence(), Body::Unbind)).await;
                        break LinkEnd::Shutdown;
                    }
                }
            }
        };

        if !pending.is_empty() {
            warn!(operator = %self.operator, pending = pending.len(), "SMPP link lost with requests in flight");
        }
        for (_, p) in pending.drain() {
            let _ = p.reply.send(Err(TransportError::ConnectionLost));
        }
        Ok(end)
    }

    /// Returns `Ok(false)` when the operator unbinds
    async fn on_pdu<W: AsyncWrite + Unpin>(
        &self,
        pdu: Pdu,
        pending: &mut HashMap<u32, PendingSubmit>,
        writer: &mut W,
    ) -> std::io::Result<bool> {
        let seq = pdu.sequence_number;
        match pdu.body {
            Body::SubmitSmResp { message_id } => {
                if let Some(p) = pending.remove(&seq) {
                    let result = match pdu.command_status {
                        status::ESME_ROK => Ok(message_id),
                        status::ESME_RTHROTTLED | status::ESME_RMSGQFUL => {
                            Err(TransportError::Throttled)
                        }
                        code => Err(TransportError::Rejected(code)),
                    };
                    let _ = p.reply.send(result);
                }
            }
            Body::GenericNack => {
                if let Some(p) = pending.remove(&seq) {
                    let _ = p.reply.send(Err(TransportError::Rejected(pdu.command_status)));
                }
            }
            Body::DeliverSm(sm) => {
                write_pdu(
                    writer,
                    &Pdu::new(
                        seq,
                        Body::DeliverSmResp {
                            message_id: String::new(),
                        },
                    ),
                )
                .await?;
                match receipt::parse(&sm) {
                    Some(parsed) => {
                        let receipt = ClientReceipt {
                            operator: self.operator.clone(),
                            remote_id: parsed.message_id,
                            delivered: parsed.delivered,
                        };
                        if self.receipts.send(receipt).await.is_err() {
                            debug!(operator = %self.operator, "Receipt consumer gone");
                        }
                    }
                    None => debug!(operator = %self.operator, "Ignoring mobile-originated deliver_sm"),
                }
            }
            Body::EnquireLink => {
                write_pdu(writer, &Pdu::new(seq, Body::EnquireLinkResp)).await?;
            }
            Body::EnquireLinkResp => {}
            Body::Unbind => {
                write_pdu(writer, &Pdu::new(seq, Body::UnbindResp)).await?;
                info!(operator = %self.operator, "Operator unbound");
                return Ok(false);
            }
            Body::UnbindResp => return Ok(false),
            other => {
                debug!(operator = %self.operator, command = other.name(), "Unexpected command");
                write_pdu(writer, &Pdu::generic_nack(seq, status::ESME_RINVCMDID)).await?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smpp::pdu::BindResp;
    use smsc_core::Address;
    use tokio::net::TcpListener;

    fn message(content: Vec<u8>) -> Message {
        Message::new(
            Address::international("15550001"),
            Address::international("15551234"),
            content,
        )
    }

    #[test]
    fn test_long_content_uses_payload() {
        let body = submit_body(&message(vec![b'a'; 300]));
        assert!(body.short_message.is_empty());
        assert_eq!(body.content().len(), 300);

        let body = submit_body(&message(b"short".to_vec()));
        assert_eq!(&body.short_message[..], b"short");
        assert_eq!(body.registered_delivery, 1);
    }

    #[test]
    fn test_reconnect_delay() {
        let config = SmppClientConfig {
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(400));
        assert_eq!(config.reconnect_delay(10), Duration::from_millis(500));
    }

    /// Minimal operator SMSC: accepts the bind, answers submits with
    /// `remote-N` and pushes a receipt for each
    async fn fake_operator(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = tokio::io::split(stream);
        let mut frames = PduReader::new(reader, 4096);
        let mut counter = 0;
        while let Ok(Some(Frame::Pdu(pdu))) = frames.next().await {
            let seq = pdu.sequence_number;
            match pdu.body {
                Body::BindTransceiver(_) => {
                    let resp = Body::BindTransceiverResp(BindResp {
                        system_id: "op".to_string(),
                        tlvs: Vec::new(),
                    });
                    write_pdu(&mut writer, &Pdu::new(seq, resp)).await.unwrap();
                }
                Body::SubmitSm(_) => {
                    counter += 1;
                    let id = format!("remote-{}", counter);
                    let resp = Body::SubmitSmResp {
                        message_id: id.clone(),
                    };
                    write_pdu(&mut writer, &Pdu::new(seq, resp)).await.unwrap();
                    let text = format!("id:{} sub:001 dlvrd:001 stat:DELIVRD err:000 text:", id);
                    let receipt = SmBody {
                        esm_class: receipt::ESM_CLASS_RECEIPT,
                        short_message: Bytes::from(text),
                        ..Default::default()
                    };
                    write_pdu(&mut writer, &Pdu::new(1000 + counter, Body::DeliverSm(receipt)))
                        .await
                        .unwrap();
                }
                Body::Unbind => {
                    write_pdu(&mut writer, &Pdu::new(seq, Body::UnbindResp)).await.unwrap();
                    break;
                }
                _ => {}
            }
        }
    }

    async fn wait_bound(client: &SmppClient) {
        for _ in 0..200 {
            if client.state() == ClientState::Bound {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never bound");
    }

    #[tokio::test]
    async fn test_submit_and_receipt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(fake_operator(listener));

        let (receipts_tx, mut receipts) = mpsc::channel(8);
        let config = SmppClientConfig {
            port,
            system_id: "gw".to_string(),
            password: "pw".to_string(),
            ..Default::default()
        };
        let client = SmppClient::start(OperatorId::new("op"), config, receipts_tx);
        wait_bound(&client).await;

        let outcome = client.send(&message(b"hi".to_vec())).await.unwrap();
        assert_eq!(outcome.remote_id.as_deref(), Some("remote-1"));
        assert!(!outcome.delivered);

        let receipt = receipts.recv().await.unwrap();
        assert_eq!(receipt.remote_id, "remote-1");
        assert!(receipt.delivered);

        client.close().await;
        assert_eq!(client.state(), ClientState::Stopped);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unbound_client_is_unavailable() {
        let (receipts_tx, _receipts) = mpsc::channel(1);
        let config = SmppClientConfig {
            // nothing listens on port 1
            port: 1,
            reconnect_base: Duration::from_secs(5),
            ..Default::default()
        };
        let client = SmppClient::start(OperatorId::new("op"), config, receipts_tx);
        let err = client.send(&message(b"x".to_vec())).await.unwrap_err();
        assert!(err.is_unavailable());
        client.close().await;
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Binds, then drops the connection on the first submit
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = tokio::io::split(stream);
            let mut frames = PduReader::new(reader, 4096);
            while let Ok(Some(Frame::Pdu(pdu))) = frames.next().await {
                match pdu.body {
                    Body::BindTransceiver(_) => {
                        let resp = Body::BindTransceiverResp(BindResp::default());
                        write_pdu(&mut writer, &Pdu::new(pdu.sequence_number, resp))
                            .await
                            .unwrap();
                    }
                    Body::SubmitSm(_) => break,
                    _ => {}
                }
            }
        });

        let (receipts_tx, _receipts) = mpsc::channel(1);
        let config = SmppClientConfig {
            port,
            reconnect_base: Duration::from_secs(5),
            ..Default::default()
        };
        let client = SmppClient::start(OperatorId::new("op"), config, receipts_tx);
        wait_bound(&client).await;

        let err = client.send(&message(b"x".to_vec())).await.unwrap_err();
        assert_eq!(err, TransportError::ConnectionLost);
        server.await.unwrap();
        client.close().await;
    }
}
