//! SCTP association state machine
//!
//! [`Association`] holds no I/O. Every input goes through
//! [`Association::on_event`], which returns the packets to put on the wire
//! and the user messages to hand upward.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::chunks::{Chunk, DataChunk, InitChunk, Packet, SackChunk};
use crate::errors::SctpError;

const A_RWND: u32 = 65_535;

/// SCTP Association State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Closed,
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownPending,
    ShutdownSent,
    ShutdownReceived,
    ShutdownAckSent,
}

impl AssociationState {
    /// States in which the peer may still hand us DATA
    fn accepts_data(self) -> bool {
        matches!(
            self,
            Self::Established | Self::ShutdownPending | Self::ShutdownSent
        )
    }
}

/// Input to the state machine
#[derive(Debug, Clone)]
pub enum Event {
    /// Start the client-side handshake
    Connect,
    /// Packet received from the peer
    Packet(Packet),
    /// Send a user message on a stream
    Send { stream_id: u16, ppid: u32, data: Bytes },
    /// Graceful close
    Shutdown,
    /// Heartbeat interval elapsed
    HeartbeatTick,
    /// Ungraceful close
    Abort,
}

/// Output of the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transmit(Packet),
    Deliver { stream_id: u16, ppid: u32, data: Bytes },
    Established,
    Closed,
}

/// Parameters fixed for the lifetime of an association
#[derive(Debug, Clone)]
pub struct AssociationConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub max_retrans: u32,
}

/// One SCTP association, either side
#[derive(Debug)]
pub struct Association {
    config: AssociationConfig,
    state: AssociationState,
    local_tag: u32,
    peer_tag: u32,
    next_tsn: u32,
    /// Highest in-sequence TSN received from the peer
    peer_cumulative_tsn: u32,
    outbound_streams: u16,
    inbound_streams: u16,
    outbound_ssn: Vec<u16>,
    unacked: BTreeMap<u32, DataChunk>,
    outstanding_heartbeats: u32,
    heartbeat_nonce: u64,
    issued_cookie: Option<Bytes>,
}

fn random_tag() -> u32 {
    loop {
        let tag: u32 = rand::random();
        if tag != 0 {
            return tag;
        }
    }
}

/// TSN comparison with serial number arithmetic
fn tsn_lte(a: u32, b: u32) -> bool {
    a == b || b.wrapping_sub(a) < (1 << 31)
}

impl Association {
    pub fn new(config: AssociationConfig) -> Self {
        let outbound_streams = config.outbound_streams;
        let inbound_streams = config.inbound_streams;
        Self {
            config,
            state: AssociationState::Closed,
            local_tag: random_tag(),
            peer_tag: 0,
            next_tsn: rand::random(),
            peer_cumulative_tsn: 0,
            outbound_streams,
            inbound_streams,
            outbound_ssn: vec![0; outbound_streams as usize],
            unacked: BTreeMap::new(),
            outstanding_heartbeats: 0,
            heartbeat_nonce: 0,
            issued_cookie: None,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == AssociationState::Established
    }

    /// Streams usable for sending after negotiation
    pub fn outbound_streams(&self) -> u16 {
        self.outbound_streams
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn on_event(&mut self, event: Event) -> Result<Vec<Action>, SctpError> {
        match event {
            Event::Connect => self.connect(),
            Event::Packet(packet) => self.on_packet(packet),
            Event::Send {
                stream_id,
                ppid,
                data,
            } => self.send(stream_id, ppid, data),
            Event::Shutdown => Ok(self.shutdown()),
            Event::HeartbeatTick => self.heartbeat_tick(),
            Event::Abort => Ok(self.abort()),
        }
    }

    fn packet(&self, verification_tag: u32) -> Packet {
        Packet::new(
            self.config.local_port,
            self.config.remote_port,
            verification_tag,
        )
    }

    fn to_peer(&self, chunk: Chunk) -> Action {
        Action::Transmit(self.packet(self.peer_tag).with_chunk(chunk))
    }

    fn invalid_state(&self, expected: &str) -> SctpError {
        SctpError::InvalidState {
            expected: expected.to_string(),
            actual: format!("{:?}", self.state),
        }
    }

    fn local_init(&self) -> InitChunk {
        InitChunk {
            initiate_tag: self.local_tag,
            a_rwnd: A_RWND,
            outbound_streams: self.config.outbound_streams,
            inbound_streams: self.config.inbound_streams,
            initial_tsn: self.next_tsn,
            cookie: None,
        }
    }

    fn negotiate(&mut self, peer: &InitChunk) {
        self.peer_tag = peer.initiate_tag;
        self.peer_cumulative_tsn = peer.initial_tsn.wrapping_sub(1);
        self.outbound_streams = self.config.outbound_streams.min(peer.inbound_streams).max(1);
        self.inbound_streams = self.config.inbound_streams.min(peer.outbound_streams).max(1);
        self.outbound_ssn = vec![0; self.outbound_streams as usize];
    }

    fn connect(&mut self) -> Result<Vec<Action>, SctpError> {
        if self.state != AssociationState::Closed {
            return Err(self.invalid_state("Closed"));
        }
        self.state = AssociationState::CookieWait;
        debug!(tag = self.local_tag, "Sending INIT");
        Ok(vec![Action::Transmit(
            self.packet(0).with_chunk(Chunk::Init(self.local_init())),
        )])
    }

    fn send(&mut self, stream_id: u16, ppid: u32, data: Bytes) -> Result<Vec<Action>, SctpError> {
        if self.state != AssociationState::Established {
            return Err(self.invalid_state("Established"));
        }
        let ssn = self
            .outbound_ssn
            .get_mut(stream_id as usize)
            .ok_or(SctpError::InvalidStream(stream_id))?;
        let chunk = DataChunk::new(self.next_tsn, stream_id, *ssn, ppid, data);
        *ssn = ssn.wrapping_add(1);
        self.next_tsn = self.next_tsn.wrapping_add(1);
        self.unacked.insert(chunk.tsn, chunk.clone());
        Ok(vec![self.to_peer(Chunk::Data(chunk))])
    }

    fn shutdown(&mut self) -> Vec<Action> {
        match self.state {
            AssociationState::Established => {
                if self.unacked.is_empty() {
                    self.send_shutdown()
                } else {
                    self.state = AssociationState::ShutdownPending;
                    Vec::new()
                }
            }
            AssociationState::CookieWait | AssociationState::CookieEchoed => self.abort(),
            _ => Vec::new(),
        }
    }

    fn send_shutdown(&mut self) -> Vec<Action> {
        self.state = AssociationState::ShutdownSent;
        vec![self.to_peer(Chunk::Shutdown {
            cumulative_tsn_ack: self.peer_cumulative_tsn,
        })]
    }

    fn send_shutdown_ack(&mut self) -> Vec<Action> {
        self.state = AssociationState::ShutdownAckSent;
        vec![self.to_peer(Chunk::ShutdownAck)]
    }

    fn abort(&mut self) -> Vec<Action> {
        if self.state == AssociationState::Closed {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.peer_tag != 0 {
            actions.push(self.to_peer(Chunk::Abort { reflected: false }));
        }
        actions.extend(self.close());
        actions
    }

    fn close(&mut self) -> Vec<Action> {
        self.state = AssociationState::Closed;
        self.unacked.clear();
        self.issued_cookie = None;
        vec![Action::Closed]
    }

    fn heartbeat_tick(&mut self) -> Result<Vec<Action>, SctpError> {
        if self.state != AssociationState::Established {
            return Ok(Vec::new());
        }
        if self.outstanding_heartbeats >= self.config.max_retrans {
            warn!(
                missed = self.outstanding_heartbeats,
                "Heartbeat limit reached, aborting association"
            );
            self.abort();
            return Err(SctpError::HeartbeatTimeout);
        }
        self.outstanding_heartbeats += 1;
        self.heartbeat_nonce = self.heartbeat_nonce.wrapping_add(1);
        let info = Bytes::copy_from_slice(&self.heartbeat_nonce.to_be_bytes());
        Ok(vec![self.to_peer(Chunk::Heartbeat(info))])
    }

    fn on_packet(&mut self, packet: Packet) -> Result<Vec<Action>, SctpError> {
        let is_init = packet
            .chunks
            .first()
            .map(|c| matches!(c, Chunk::Init(_)))
            .unwrap_or(false);
        let reflected_abort = packet
            .chunks
            .iter()
            .any(|c| matches!(c, Chunk::Abort { reflected: true }));
        if is_init {
            if packet.header.verification_tag != 0 {
                return Err(SctpError::VerificationTag);
            }
        } else if packet.header.verification_tag != self.local_tag
            && !(reflected_abort && packet.header.verification_tag == self.peer_tag)
        {
            return Err(SctpError::VerificationTag);
        }

        let mut actions = Vec::new();
        let mut saw_data = false;
        for chunk in packet.chunks {
            match chunk {
                Chunk::Data(data) => {
                    saw_data = true;
                    actions.extend(self.on_data(data)?);
                }
                other => actions.extend(self.on_control(other)?),
            }
            if self.state == AssociationState::Closed {
                return Ok(actions);
            }
        }
        if saw_data {
            actions.push(self.sack());
        }
        Ok(actions)
    }

    fn sack(&self) -> Action {
        self.to_peer(Chunk::Sack(SackChunk {
            cumulative_tsn_ack: self.peer_cumulative_tsn,
            a_rwnd: A_RWND,
        }))
    }

    fn on_data(&mut self, data: DataChunk) -> Result<Option<Action>, SctpError> {
        if !self.state.accepts_data() {
            return Err(self.invalid_state("Established"));
        }
        if data.stream_id >= self.inbound_streams {
            return Err(SctpError::InvalidStream(data.stream_id));
        }
        if tsn_lte(data.tsn, self.peer_cumulative_tsn) {
            debug!(tsn = data.tsn, "Duplicate DATA");
            return Ok(None);
        }
        if data.tsn != self.peer_cumulative_tsn.wrapping_add(1) {
            return Err(SctpError::Malformed(format!(
                "TSN gap: expected {}, got {}",
                self.peer_cumulative_tsn.wrapping_add(1),
                data.tsn
            )));
        }
        self.peer_cumulative_tsn = data.tsn;
        Ok(Some(Action::Deliver {
            stream_id: data.stream_id,
            ppid: data.ppid,
            data: data.user_data,
        }))
    }

    fn on_control(&mut self, chunk: Chunk) -> Result<Vec<Action>, SctpError> {
        use AssociationState as S;

        match (self.state, chunk) {
            (S::Closed, Chunk::Init(init)) => {
                self.negotiate(&init);
                let cookie = self.make_cookie(&init);
                self.issued_cookie = Some(cookie.clone());
                let mut ack = self.local_init();
                ack.outbound_streams = self.outbound_streams;
                ack.inbound_streams = self.inbound_streams;
                ack.cookie = Some(cookie);
                debug!(peer_tag = init.initiate_tag, "Answering INIT");
                Ok(vec![self.to_peer(Chunk::InitAck(ack))])
            }
            (S::Closed, Chunk::CookieEcho(cookie)) => {
                match &self.issued_cookie {
                    Some(issued) if *issued == cookie => {}
                    _ => return Err(SctpError::Malformed("stale or unknown cookie".to_string())),
                }
                self.issued_cookie = None;
                self.state = S::Established;
                Ok(vec![self.to_peer(Chunk::CookieAck), Action::Established])
            }
            (S::CookieWait, Chunk::InitAck(ack)) => {
                let cookie = ack
                    .cookie
                    .clone()
                    .ok_or_else(|| SctpError::Malformed("INIT ACK without cookie".to_string()))?;
                self.negotiate(&ack);
                self.state = S::CookieEchoed;
                Ok(vec![self.to_peer(Chunk::CookieEcho(cookie))])
            }
            (S::CookieEchoed, Chunk::CookieAck) => {
                self.state = S::Established;
                Ok(vec![Action::Established])
            }
            (_, Chunk::Abort { .. }) => {
                warn!(state = ?self.state, "Association aborted by peer");
                self.close();
                Err(SctpError::Aborted)
            }
            (_, Chunk::Heartbeat(info)) => Ok(vec![self.to_peer(Chunk::HeartbeatAck(info))]),
            (_, Chunk::HeartbeatAck(_)) => {
                self.outstanding_heartbeats = 0;
                Ok(Vec::new())
            }
            (_, Chunk::Sack(sack)) => {
                self.unacked
                    .retain(|tsn, _| !tsn_lte(*tsn, sack.cumulative_tsn_ack));
                Ok(self.after_ack())
            }
            (
                S::Established | S::ShutdownPending | S::ShutdownReceived,
                Chunk::Shutdown { cumulative_tsn_ack },
            ) => {
                self.unacked.retain(|tsn, _| !tsn_lte(*tsn, cumulative_tsn_ack));
                self.state = S::ShutdownReceived;
                Ok(self.after_ack())
            }
            (S::ShutdownSent, Chunk::Shutdown { .. }) => Ok(self.send_shutdown_ack()),
            (S::ShutdownSent | S::ShutdownAckSent, Chunk::ShutdownAck) => {
                let mut actions = vec![self.to_peer(Chunk::ShutdownComplete { reflected: false })];
                actions.extend(self.close());
                Ok(actions)
            }
            (S::ShutdownAckSent, Chunk::ShutdownComplete { .. }) => Ok(self.close()),
            (_, Chunk::Error(causes)) => {
                warn!(len = causes.len(), "Peer reported an operation error");
                Ok(Vec::new())
            }
            (state, Chunk::Unknown { chunk_type, .. }) => {
                debug!(?state, chunk_type, "Ignoring unknown chunk");
                Ok(Vec::new())
            }
            (state, chunk) => {
                debug!(?state, chunk_type = chunk.chunk_type(), "Chunk not valid in state");
                Ok(Vec::new())
            }
        }
    }

    /// Progress a pending shutdown once everything we sent is acknowledged
    fn after_ack(&mut self) -> Vec<Action> {
        if !self.unacked.is_empty() {
            return Vec::new();
        }
        match self.state {
            AssociationState::ShutdownPending => self.send_shutdown(),
            AssociationState::ShutdownReceived => self.send_shutdown_ack(),
            _ => Vec::new(),
        }
    }

    fn make_cookie(&self, init: &InitChunk) -> Bytes {
        let mut cookie = BytesMut::with_capacity(24);
        cookie.put_u32(self.local_tag);
        cookie.put_u32(init.initiate_tag);
        cookie.put_u32(self.next_tsn);
        cookie.put_u32(init.initial_tsn);
        cookie.put_u64(rand::random());
        cookie.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sctp::PPID_M3UA;

    fn config() -> AssociationConfig {
        AssociationConfig {
            local_port: 2905,
            remote_port: 2905,
            outbound_streams: 2,
            inbound_streams: 2,
            max_retrans: 3,
        }
    }

    fn transmitted(actions: Vec<Action>) -> Vec<Packet> {
        actions
            .into_iter()
            .filter_map(|a| match a {
                Action::Transmit(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Feed every packet from one side into the other, returning the replies
    fn exchange(to: &mut Association, packets: Vec<Packet>) -> Vec<Action> {
        let mut out = Vec::new();
        for packet in packets {
            // through the codec so the wire format is exercised too
            let decoded = Packet::decode(packet.encode()).unwrap();
            out.extend(to.on_event(Event::Packet(decoded)).unwrap());
        }
        out
    }

    fn established_pair() -> (Association, Association) {
        let mut client = Association::new(config());
        let mut server = Association::new(config());

        let init = transmitted(client.on_event(Event::Connect).unwrap());
        assert_eq!(client.state(), AssociationState::CookieWait);
        let init_ack = transmitted(exchange(&mut server, init));
        assert_eq!(server.state(), AssociationState::Closed);
        let echo = transmitted(exchange(&mut client, init_ack));
        assert_eq!(client.state(), AssociationState::CookieEchoed);
        let replies = exchange(&mut server, echo);
        assert!(replies.contains(&Action::Established));
        assert_eq!(server.state(), AssociationState::Established);
        let replies = exchange(&mut client, transmitted(replies));
        assert_eq!(replies, vec![Action::Established]);
        (client, server)
    }

    #[test]
    fn test_handshake() {
        let (client, server) = established_pair();
        assert!(client.is_established());
        assert!(server.is_established());
    }

    #[test]
    fn test_data_delivered_and_acked() {
        let (mut client, mut server) = established_pair();
        let sent = transmitted(
            client
                .on_event(Event::Send {
                    stream_id: 1,
                    ppid: PPID_M3UA,
                    data: Bytes::from_static(b"m3ua"),
                })
                .unwrap(),
        );
        assert_eq!(client.unacked_count(), 1);

        let replies = exchange(&mut server, sent);
        assert!(replies.contains(&Action::Deliver {
            stream_id: 1,
            ppid: PPID_M3UA,
            data: Bytes::from_static(b"m3ua"),
        }));
        exchange(&mut client, transmitted(replies));
        assert_eq!(client.unacked_count(), 0);
    }

    #[test]
    fn test_stream_sequence_numbers() {
        let (mut client, _) = established_pair();
        let mut ssns = Vec::new();
        for _ in 0..3 {
            let packets = transmitted(
                client
                    .on_event(Event::Send {
                        stream_id: 0,
                        ppid: PPID_M3UA,
                        data: Bytes::from_static(b"x"),
                    })
                    .unwrap(),
            );
            if let Chunk::Data(d) = &packets[0].chunks[0] {
                ssns.push(d.stream_seq);
            }
        }
        assert_eq!(ssns, vec![0, 1, 2]);
    }

    #[test]
    fn test_invalid_stream_rejected() {
        let (mut client, _) = established_pair();
        let result = client.on_event(Event::Send {
            stream_id: 9,
            ppid: PPID_M3UA,
            data: Bytes::new(),
        });
        assert!(matches!(result, Err(SctpError::InvalidStream(9))));
    }

    #[test]
    fn test_send_before_established() {
        let mut client = Association::new(config());
        let result = client.on_event(Event::Send {
            stream_id: 0,
            ppid: PPID_M3UA,
            data: Bytes::new(),
        });
        assert!(matches!(result, Err(SctpError::InvalidState { .. })));
    }

    #[test]
    fn test_graceful_shutdown() {
        let (mut client, mut server) = established_pair();
        let shutdown = transmitted(client.on_event(Event::Shutdown).unwrap());
        assert_eq!(client.state(), AssociationState::ShutdownSent);

        let ack = transmitted(exchange(&mut server, shutdown));
        assert_eq!(server.state(), AssociationState::ShutdownAckSent);

        let replies = exchange(&mut client, ack);
        assert!(replies.contains(&Action::Closed));
        assert_eq!(client.state(), AssociationState::Closed);

        let replies = exchange(&mut server, transmitted(replies));
        assert_eq!(replies, vec![Action::Closed]);
        assert_eq!(server.state(), AssociationState::Closed);
    }

    #[test]
    fn test_shutdown_waits_for_outstanding_data() {
        let (mut client, mut server) = established_pair();
        let data = transmitted(
            client
                .on_event(Event::Send {
                    stream_id: 0,
                    ppid: PPID_M3UA,
                    data: Bytes::from_static(b"last"),
                })
                .unwrap(),
        );
        assert!(client.on_event(Event::Shutdown).unwrap().is_empty());
        assert_eq!(client.state(), AssociationState::ShutdownPending);

        let sack = transmitted(exchange(&mut server, data));
        let replies = transmitted(exchange(&mut client, sack));
        assert_eq!(client.state(), AssociationState::ShutdownSent);
        assert!(matches!(replies[0].chunks[0], Chunk::Shutdown { .. }));
    }

    #[test]
    fn test_heartbeat_limit() {
        let (mut client, mut server) = established_pair();
        let hb = transmitted(client.on_event(Event::HeartbeatTick).unwrap());
        let ack = transmitted(exchange(&mut server, hb));
        exchange(&mut client, ack);

        for _ in 0..3 {
            client.on_event(Event::HeartbeatTick).unwrap();
        }
        assert!(matches!(
            client.on_event(Event::HeartbeatTick),
            Err(SctpError::HeartbeatTimeout)
        ));
        assert_eq!(client.state(), AssociationState::Closed);
    }

    #[test]
    fn test_wrong_verification_tag() {
        let (mut client, _) = established_pair();
        let bogus = Packet::new(2905, 2905, 0).with_chunk(Chunk::CookieAck);
        assert!(matches!(
            client.on_event(Event::Packet(bogus)),
            Err(SctpError::VerificationTag)
        ));
    }

    #[test]
    fn test_peer_abort() {
        let (mut client, mut server) = established_pair();
        let abort = transmitted(client.on_event(Event::Abort).unwrap());
        assert_eq!(client.state(), AssociationState::Closed);
        let decoded = Packet::decode(abort[0].encode()).unwrap();
        assert!(matches!(
            server.on_event(Event::Packet(decoded)),
            Err(SctpError::Aborted)
        ));
        assert_eq!(server.state(), AssociationState::Closed);
    }

    #[test]
    fn test_tsn_serial_compare() {
        assert!(tsn_lte(1, 2));
        assert!(tsn_lte(u32::MAX, 0));
        assert!(!tsn_lte(5, 4));
    }
}
