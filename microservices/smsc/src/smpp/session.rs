//! Server-side SMPP session state machine
//!
//! [`Session`] is pure: it consumes decoded PDUs and returns the PDUs to
//! write back. The socket loop in `server` owns one per connection.

use chrono::Utc;
use smsc_core::{Address, Encoding, Message, MessageId, OptionalParam, Origin, Priority};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::pdu::{tag, Bind, BindResp, Body, DecodeError, Pdu, SmBody, Tlv};
use super::{status, time, INTERFACE_VERSION};

/// Consecutive malformed PDUs tolerated before the session is closed
pub const MAX_MALFORMED: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Open,
    BoundTx,
    BoundRx,
    BoundTrx,
    Closed,
}

impl BindState {
    pub fn is_bound(self) -> bool {
        matches!(self, Self::BoundTx | Self::BoundRx | Self::BoundTrx)
    }

    pub fn can_submit(self) -> bool {
        matches!(self, Self::BoundTx | Self::BoundTrx)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, Self::BoundRx | Self::BoundTrx)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::BoundTx => "bound_tx",
            Self::BoundRx => "bound_rx",
            Self::BoundTrx => "bound_trx",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Our system id, returned in bind responses
    pub system_id: String,
    pub max_bind_attempts: u32,
    pub idle_timeout: Duration,
    pub response_timeout: Duration,
    pub max_payload_octets: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_id: "smsc".to_string(),
            max_bind_attempts: 3,
            idle_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(30),
            max_payload_octets: 4096,
        }
    }
}

/// Checks ESME credentials; the error is the bind response status
pub trait Credentials: Send + Sync + 'static {
    fn check(&self, system_id: &str, password: &str) -> Result<(), u32>;
}

impl Credentials for HashMap<String, String> {
    fn check(&self, system_id: &str, password: &str) -> Result<(), u32> {
        match self.get(system_id) {
            None => Err(status::ESME_RINVSYSID),
            Some(expected) if expected == password => Ok(()),
            Some(_) => Err(status::ESME_RINVPASWD),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    NoRoute,
    Backpressure,
    Unavailable,
}

impl SubmitError {
    pub fn command_status(self) -> u32 {
        match self {
            Self::NoRoute => status::ESME_RINVDSTADR,
            Self::Backpressure => status::ESME_RTHROTTLED,
            Self::Unavailable => status::ESME_RSYSERR,
        }
    }
}

/// Takes a validated message into the gateway
pub trait Submitter: Send + Sync + 'static {
    fn submit(&self, message: Message) -> Result<MessageId, SubmitError>;
}

#[derive(Debug, Clone)]
struct Outstanding {
    command_id: u32,
    sent_at: Instant,
}

pub struct Session {
    config: Arc<SessionConfig>,
    credentials: Arc<dyn Credentials>,
    submitter: Arc<dyn Submitter>,
    state: BindState,
    system_id: Option<String>,
    next_sequence: u32,
    outstanding: HashMap<u32, Outstanding>,
    bind_failures: u32,
    malformed: u32,
    last_activity: Instant,
}

impl Session {
    pub fn new(
        config: Arc<SessionConfig>,
        credentials: Arc<dyn Credentials>,
        submitter: Arc<dyn Submitter>,
        now: Instant,
    ) -> Self {
        Self {
            config,
            credentials,
            submitter,
            state: BindState::Open,
            system_id: None,
            next_sequence: 1,
            outstanding: HashMap::new(),
            bind_failures: 0,
            malformed: 0,
            last_activity: now,
        }
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn system_id(&self) -> Option<&str> {
        self.system_id.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.state == BindState::Closed
    }

    pub fn malformed_count(&self) -> u32 {
        self.malformed
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn close(&mut self) {
        self.state = BindState::Closed;
    }

    /// Sequence numbers run 1..=0x7FFFFFFF and wrap
    fn next_sequence(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence = if seq >= 0x7FFF_FFFF { 1 } else { seq + 1 };
        seq
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) >= self.config.idle_timeout
    }

    /// Handle one well-formed PDU from the peer
    pub fn on_pdu(&mut self, pdu: Pdu, now: Instant) -> Vec<Pdu> {
        if self.is_closed() {
            return Vec::new();
        }
        self.last_activity = now;
        self.malformed = 0;

        let seq = pdu.sequence_number;
        match pdu.body {
            Body::BindTransmitter(bind) => self.on_bind(seq, bind, BindState::BoundTx),
            Body::BindReceiver(bind) => self.on_bind(seq, bind, BindState::BoundRx),
            Body::BindTransceiver(bind) => self.on_bind(seq, bind, BindState::BoundTrx),
            Body::EnquireLink => vec![Pdu::new(seq, Body::EnquireLinkResp)],
            Body::GenericNack => {
                if let Some(request) = self.outstanding.remove(&seq) {
                    warn!(
                        sequence = seq,
                        command = super::command::name(request.command_id),
                        status = pdu.command_status,
                        "Peer rejected request"
                    );
                }
                Vec::new()
            }
            _ if !self.state.is_bound() => {
                vec![Pdu::generic_nack(seq, status::ESME_RINVBNDSTS)]
            }
            Body::SubmitSm(sm) => vec![self.on_submit(seq, sm)],
            Body::DeliverSmResp { .. } | Body::EnquireLinkResp => {
                if self.outstanding.remove(&seq).is_none() {
                    debug!(sequence = seq, "Response without matching request");
                } else if pdu.command_status != status::ESME_ROK {
                    warn!(sequence = seq, status = pdu.command_status, "Peer refused delivery");
                }
                Vec::new()
            }
            Body::Unbind => {
                info!(system_id = ?self.system_id, "Peer unbound");
                self.state = BindState::Closed;
                vec![Pdu::new(seq, Body::UnbindResp)]
            }
            Body::UnbindResp => {
                self.state = BindState::Closed;
                Vec::new()
            }
            other => {
                debug!(command = other.name(), "Unexpected command from ESME");
                vec![Pdu::generic_nack(seq, status::ESME_RINVCMDID)]
            }
        }
    }

    /// Handle a framed PDU that failed to decode
    pub fn on_malformed(&mut self, sequence_number: u32, error: &DecodeError, now: Instant) -> Vec<Pdu> {
        if self.is_closed() {
            return Vec::new();
        }
        self.last_activity = now;
        self.malformed += 1;
        warn!(
            sequence = sequence_number,
            error = %error,
            consecutive = self.malformed,
            "Malformed PDU"
        );
        if self.malformed >= MAX_MALFORMED {
            self.state = BindState::Closed;
        }
        vec![Pdu::generic_nack(sequence_number, error.command_status())]
    }

    fn on_bind(&mut self, seq: u32, bind: Bind, target: BindState) -> Vec<Pdu> {
        let response = |status: u32, system_id: String| {
            let resp = BindResp {
                system_id,
                tlvs: vec![Tlv::new(tag::SC_INTERFACE_VERSION, vec![INTERFACE_VERSION])],
            };
            let body = match target {
                BindState::BoundRx => Body::BindReceiverResp(resp),
                BindState::BoundTrx => Body::BindTransceiverResp(resp),
                _ => Body::BindTransmitterResp(resp),
            };
            Pdu::new(seq, body).with_status(status)
        };

        if self.state.is_bound() {
            return vec![response(status::ESME_RALYBND, String::new())];
        }

        match self.credentials.check(&bind.system_id, &bind.password) {
            Ok(()) => {
                info!(system_id = %bind.system_id, state = target.as_str(), "ESME bound");
                self.state = target;
                self.system_id = Some(bind.system_id);
                vec![response(status::ESME_ROK, self.config.system_id.clone())]
            }
            Err(code) => {
                self.bind_failures += 1;
                warn!(
                    system_id = %bind.system_id,
                    failures = self.bind_failures,
                    status = code,
                    "Bind rejected"
                );
                if self.bind_failures >= self.config.max_bind_attempts {
                    self.state = BindState::Closed;
                }
                vec![response(code, String::new())]
            }
        }
    }

    fn on_submit(&mut self, seq: u32, sm: SmBody) -> Pdu {
        let reply = |status: u32, message_id: String| {
            Pdu::new(seq, Body::SubmitSmResp { message_id }).with_status(status)
        };
        if !self.state.can_submit() {
            return reply(status::ESME_RINVBNDSTS, String::new());
        }
        let message = match self.build_message(sm) {
            Ok(message) => message,
            Err(code) => return reply(code, String::new()),
        };
        match self.submitter.submit(message) {
            Ok(id) => reply(status::ESME_ROK, id.to_string()),
            Err(e) => reply(e.command_status(), String::new()),
        }
    }

    /// Validate a `submit_sm` and turn it into a gateway message
    fn build_message(&self, sm: SmBody) -> Result<Message, u32> {
        if sm.destination_addr.is_empty() {
            return Err(status::ESME_RINVDSTADR);
        }

        let payload = sm.tlv(tag::MESSAGE_PAYLOAD).is_some();
        if payload && !sm.short_message.is_empty() {
            return Err(status::ESME_RINVMSGLEN);
        }
        let content = sm.content().to_vec();
        let limit = if payload {
            self.config.max_payload_octets
        } else {
            Encoding::from_data_coding(sm.data_coding).max_single_octets()
        };
        if content.is_empty() || content.len() > limit {
            return Err(status::ESME_RINVMSGLEN);
        }

        let now = Utc::now();
        let scheduled_at = time::parse(&sm.schedule_delivery_time)
            .map_err(|_| status::ESME_RINVSCHED)?
            .map(|t| t.at(now));
        let validity = time::validity_secs(&sm.validity_period, now)
            .map_err(|_| status::ESME_RINVEXPIRY)?;

        let mut message = Message::new(
            Address::new(sm.source_addr_ton, sm.source_addr_npi, sm.source_addr),
            Address::new(sm.dest_addr_ton, sm.dest_addr_npi, sm.destination_addr),
            content,
        );
        message.origin = Origin::Smpp;
        message.client_id = self.system_id.clone();
        message.data_coding = sm.data_coding;
        message.esm_class = sm.esm_class;
        message.protocol_id = sm.protocol_id;
        message.service_type = sm.service_type;
        message.registered_delivery = sm.registered_delivery;
        message.priority = Priority::from_flag(sm.priority_flag);
        message.scheduled_at = scheduled_at.filter(|at| *at > now);
        if let Some(secs) = validity {
            message.validity_secs = secs;
        }
        message.optional_params = sm
            .tlvs
            .into_iter()
            .filter(|t| t.tag != tag::MESSAGE_PAYLOAD)
            .map(|t| OptionalParam {
                tag: t.tag,
                value: t.value.to_vec(),
            })
            .collect();
        Ok(message)
    }

    /// Wrap a `deliver_sm` for the peer; `None` unless bound as a receiver
    pub fn deliver(&mut self, sm: SmBody, now: Instant) -> Option<Pdu> {
        if !self.state.can_receive() {
            return None;
        }
        let seq = self.next_sequence();
        self.outstanding.insert(
            seq,
            Outstanding {
                command_id: super::command::DELIVER_SM,
                sent_at: now,
            },
        );
        Some(Pdu::new(seq, Body::DeliverSm(sm)))
    }

    /// `enquire_link` from our side, used to probe an idle peer
    pub fn enquire_link(&mut self, now: Instant) -> Pdu {
        let seq = self.next_sequence();
        self.outstanding.insert(
            seq,
            Outstanding {
                command_id: super::command::ENQUIRE_LINK,
                sent_at: now,
            },
        );
        Pdu::new(seq, Body::EnquireLink)
    }

    /// `unbind` from our side; the session closes on the peer's response
    pub fn unbind(&mut self) -> Option<Pdu> {
        if !self.state.is_bound() {
            return None;
        }
        let seq = self.next_sequence();
        Some(Pdu::new(seq, Body::Unbind))
    }

    /// Drop requests the peer never answered; returns their sequence numbers
    pub fn expire_outstanding(&mut self, now: Instant) -> Vec<u32> {
        let timeout = self.config.response_timeout;
        let mut expired: Vec<u32> = self
            .outstanding
            .iter()
            .filter(|(_, o)| now.saturating_duration_since(o.sent_at) >= timeout)
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort_unstable();
        for seq in &expired {
            self.outstanding.remove(seq);
        }
        if !expired.is_empty() {
            warn!(count = expired.len(), "Requests timed out without response");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture {
        messages: Mutex<Vec<Message>>,
        fail: Mutex<Option<SubmitError>>,
    }

    impl Submitter for Capture {
        fn submit(&self, message: Message) -> Result<MessageId, SubmitError> {
            if let Some(err) = *self.fail.lock() {
                return Err(err);
            }
            let id = message.id.clone();
            self.messages.lock().push(message);
            Ok(id)
        }
    }

    fn session(submitter: Arc<Capture>) -> Session {
        let mut credentials = HashMap::new();
        credentials.insert("esme".to_string(), "secret".to_string());
        Session::new(
            Arc::new(SessionConfig::default()),
            Arc::new(credentials),
            submitter,
            Instant::now(),
        )
    }

    fn bind(seq: u32, password: &str) -> Pdu {
        Pdu::new(
            seq,
            Body::BindTransceiver(Bind {
                system_id: "esme".to_string(),
                password: password.to_string(),
                interface_version: INTERFACE_VERSION,
                ..Default::default()
            }),
        )
    }

    fn submit(seq: u32, text: &[u8]) -> Pdu {
        Pdu::new(
            seq,
            Body::SubmitSm(SmBody {
                source_addr: "15550001".to_string(),
                destination_addr: "15551234".to_string(),
                registered_delivery: 1,
                short_message: Bytes::copy_from_slice(text),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_submit_before_bind_is_nacked() {
        let mut s = session(Arc::default());
        let out = s.on_pdu(submit(1, b"hi"), Instant::now());
        assert_eq!(out, vec![Pdu::generic_nack(1, status::ESME_RINVBNDSTS)]);
        assert_eq!(s.state(), BindState::Open);
    }

    #[test]
    fn test_bind_and_submit() {
        let capture = Arc::new(Capture::default());
        let mut s = session(capture.clone());
        let out = s.on_pdu(bind(1, "secret"), Instant::now());
        assert_eq!(out[0].command_status, status::ESME_ROK);
        assert!(matches!(&out[0].body, Body::BindTransceiverResp(r) if r.system_id == "smsc"));
        assert_eq!(s.state(), BindState::BoundTrx);

        let out = s.on_pdu(submit(2, b"hello"), Instant::now());
        let Body::SubmitSmResp { message_id } = &out[0].body else {
            panic!("expected submit_sm_resp");
        };
        let captured = capture.messages.lock();
        assert_eq!(captured[0].id.as_str(), message_id);
        assert_eq!(captured[0].client_id.as_deref(), Some("esme"));
        assert_eq!(captured[0].destination.digits, "15551234");
        assert!(captured[0].wants_receipt());
    }

    #[test]
    fn test_bind_failures_close_session() {
        let mut s = session(Arc::default());
        for seq in 1..=2 {
            let out = s.on_pdu(bind(seq, "wrong"), Instant::now());
            assert_eq!(out[0].command_status, status::ESME_RINVPASWD);
            assert_eq!(s.state(), BindState::Open);
        }
        s.on_pdu(bind(3, "wrong"), Instant::now());
        assert!(s.is_closed());
    }

    #[test]
    fn test_already_bound() {
        let mut s = session(Arc::default());
        s.on_pdu(bind(1, "secret"), Instant::now());
        let out = s.on_pdu(bind(2, "secret"), Instant::now());
        assert_eq!(out[0].command_status, status::ESME_RALYBND);
        assert_eq!(s.state(), BindState::BoundTrx);
    }

    #[test]
    fn test_three_malformed_close() {
        let mut s = session(Arc::default());
        let err = DecodeError::UnknownCommand {
            command_id: 0x99,
            sequence_number: 1,
        };
        s.on_malformed(1, &err, Instant::now());
        s.on_malformed(2, &err, Instant::now());
        assert_eq!(s.state(), BindState::Open);
        let out = s.on_malformed(3, &err, Instant::now());
        assert_eq!(out, vec![Pdu::generic_nack(3, status::ESME_RINVCMDID)]);
        assert!(s.is_closed());
    }

    #[test]
    fn test_good_pdu_resets_malformed_count() {
        let mut s = session(Arc::default());
        let err = DecodeError::Truncated { field: "x" };
        s.on_malformed(1, &err, Instant::now());
        s.on_malformed(2, &err, Instant::now());
        s.on_pdu(Pdu::new(3, Body::EnquireLink), Instant::now());
        s.on_malformed(4, &err, Instant::now());
        assert_eq!(s.state(), BindState::Open);
    }

    #[test]
    fn test_content_limits() {
        let mut s = session(Arc::default());
        s.on_pdu(bind(1, "secret"), Instant::now());
        let out = s.on_pdu(submit(2, &[b'a'; 161]), Instant::now());
        assert_eq!(out[0].command_status, status::ESME_RINVMSGLEN);

        let mut ucs2 = submit(3, &[0u8; 142]);
        if let Body::SubmitSm(sm) = &mut ucs2.body {
            sm.data_coding = 0x08;
        }
        let out = s.on_pdu(ucs2, Instant::now());
        assert_eq!(out[0].command_status, status::ESME_RINVMSGLEN);

        let mut payload = submit(4, b"");
        if let Body::SubmitSm(sm) = &mut payload.body {
            sm.tlvs.push(Tlv::new(tag::MESSAGE_PAYLOAD, vec![b'a'; 1000]));
        }
        let out = s.on_pdu(payload, Instant::now());
        assert_eq!(out[0].command_status, status::ESME_ROK);
    }

    #[test]
    fn test_empty_destination() {
        let mut s = session(Arc::default());
        s.on_pdu(bind(1, "secret"), Instant::now());
        let mut pdu = submit(2, b"x");
        if let Body::SubmitSm(sm) = &mut pdu.body {
            sm.destination_addr.clear();
        }
        let out = s.on_pdu(pdu, Instant::now());
        assert_eq!(out[0].command_status, status::ESME_RINVDSTADR);
    }

    #[test]
    fn test_submit_errors_map_to_status() {
        let capture = Arc::new(Capture::default());
        let mut s = session(capture.clone());
        s.on_pdu(bind(1, "secret"), Instant::now());

        *capture.fail.lock() = Some(SubmitError::NoRoute);
        let out = s.on_pdu(submit(2, b"x"), Instant::now());
        assert_eq!(out[0].command_status, status::ESME_RINVDSTADR);

        *capture.fail.lock() = Some(SubmitError::Backpressure);
        let out = s.on_pdu(submit(3, b"x"), Instant::now());
        assert_eq!(out[0].command_status, status::ESME_RTHROTTLED);
    }

    #[test]
    fn test_receiver_cannot_submit() {
        let mut s = session(Arc::default());
        let mut pdu = bind(1, "secret");
        if let Body::BindTransceiver(b) = pdu.body {
            pdu.body = Body::BindReceiver(b);
        }
        s.on_pdu(pdu, Instant::now());
        assert_eq!(s.state(), BindState::BoundRx);
        let out = s.on_pdu(submit(2, b"x"), Instant::now());
        assert_eq!(out[0].command_status, status::ESME_RINVBNDSTS);
    }

    #[test]
    fn test_deliver_and_correlate() {
        let mut s = session(Arc::default());
        let start = Instant::now();
        assert!(s.deliver(SmBody::default(), start).is_none());

        s.on_pdu(bind(1, "secret"), start);
        let pdu = s.deliver(SmBody::default(), start).unwrap();
        assert_eq!(s.outstanding(), 1);
        s.on_pdu(
            Pdu::new(
                pdu.sequence_number,
                Body::DeliverSmResp {
                    message_id: String::new(),
                },
            ),
            start,
        );
        assert_eq!(s.outstanding(), 0);

        let pdu = s.deliver(SmBody::default(), start).unwrap();
        let expired = s.expire_outstanding(start + Duration::from_secs(31));
        assert_eq!(expired, vec![pdu.sequence_number]);
    }

    #[test]
    fn test_unbind_and_idle() {
        let mut s = session(Arc::default());
        let start = Instant::now();
        assert!(!s.is_idle(start));
        assert!(s.is_idle(start + Duration::from_secs(60)));

        s.on_pdu(bind(1, "secret"), start);
        let out = s.on_pdu(Pdu::new(2, Body::Unbind), start);
        assert_eq!(out, vec![Pdu::new(2, Body::UnbindResp)]);
        assert!(s.is_closed());
        assert!(s.on_pdu(Pdu::new(3, Body::EnquireLink), start).is_empty());
    }

    #[test]
    fn test_enquire_link_while_open() {
        let mut s = session(Arc::default());
        let out = s.on_pdu(Pdu::new(5, Body::EnquireLink), Instant::now());
        assert_eq!(out, vec![Pdu::new(5, Body::EnquireLinkResp)]);
    }
}
