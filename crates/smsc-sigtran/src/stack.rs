//! SIGTRAN relay: one association task per adjacent signaling point
//!
//! Each task owns its SCTP association, M3UA ASP and SCCP connection table
//! and runs them in a single `select!` loop, so no protocol state is shared
//! between tasks. Callers talk to a task through its command channel.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use smsc_core::{Address, Message, MessageId};
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{LocalConfig, RemoteConfig, RemoteMode, SigtranConfig};
use crate::errors::{MapError, Result, SctpError, SigtranError, TcapError};
use crate::m3ua::{self, Asp, AspRole, AspState, M3uaMessage, ProtocolData};
use crate::map::{self, SmsOperation};
use crate::sccp::{ConnectionTable, GlobalTitle, SccpAddress, SccpMessage};
use crate::sctp::{
    spawn_reader, write_packet, Action, Association, AssociationConfig, Event, Packet, PPID_M3UA,
};
use crate::tcap::{self, AbortCause, Component, DialoguePortion, TcapMessage};
use crate::types::ProtocolClass;

const COMMAND_QUEUE_DEPTH: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);
const INVOKE_ID: i32 = 1;

/// Link state of one remote, as reported to operators of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    /// No association
    Down,
    /// SCTP handshake in progress
    Connecting,
    /// Association up, ASP not yet active
    Inactive,
    /// Carrying traffic
    Active,
}

impl From<AspState> for RemoteState {
    fn from(state: AspState) -> Self {
        match state {
            AspState::Down => Self::Connecting,
            AspState::Inactive => Self::Inactive,
            AspState::Active => Self::Active,
        }
    }
}

/// Positive acknowledgement of an MT-ForwardSM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub remote: String,
    pub message_id: MessageId,
    /// Local TCAP transaction id used for the attempt
    pub transaction_id: u32,
}

enum Command {
    Submit {
        message: Box<Message>,
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    },
}

struct Remote {
    config: RemoteConfig,
    state: RwLock<RemoteState>,
    commands_tx: mpsc::Sender<Command>,
    /// Held by whichever association currently serves this remote
    commands_rx: tokio::sync::Mutex<mpsc::Receiver<Command>>,
}

impl Remote {
    fn set_state(&self, state: RemoteState) {
        let mut current = self.state.write();
        if *current != state {
            info!(remote = %self.config.name, from = ?*current, to = ?state, "Remote state change");
            *current = state;
        }
    }
}

struct Shared {
    local: LocalConfig,
    remotes: HashMap<String, Arc<Remote>>,
    inbound: mpsc::Sender<Message>,
    next_transaction: AtomicU32,
}

impl Shared {
    fn next_transaction_id(&self) -> u32 {
        self.next_transaction.fetch_add(1, Ordering::Relaxed)
    }

    fn local_sccp_address(&self) -> SccpAddress {
        if self.local.global_title.is_empty() {
            SccpAddress::from_ssn_pc(self.local.ssn, self.local.point_code)
        } else {
            SccpAddress::from_gt(
                GlobalTitle::e164(&self.local.global_title, self.local.translation_type),
                Some(self.local.ssn),
            )
        }
    }

    fn remote_sccp_address(&self, remote: &RemoteConfig) -> SccpAddress {
        if remote.global_title.is_empty() {
            SccpAddress::from_ssn_pc(remote.ssn, remote.point_code)
        } else {
            SccpAddress::from_gt(
                GlobalTitle::e164(&remote.global_title, self.local.translation_type),
                Some(remote.ssn),
            )
        }
    }

    fn service_centre(&self) -> Address {
        Address::international(self.local.global_title.clone())
    }
}

/// The SIGTRAN side of the gateway
pub struct SigtranStack {
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
    shutdown_tx: watch::Sender<bool>,
    accepting_tx: watch::Sender<bool>,
}

impl SigtranStack {
    /// Build the stack; MO and MT messages received from peers go to `inbound`
    pub fn new(config: SigtranConfig, inbound: mpsc::Sender<Message>) -> Result<Self> {
        config.validate()?;

        let remotes = config
            .remotes
            .iter()
            .map(|remote| {
                let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
                let handle = Arc::new(Remote {
                    config: remote.clone(),
                    state: RwLock::new(RemoteState::Down),
                    commands_tx,
                    commands_rx: tokio::sync::Mutex::new(commands_rx),
                });
                (remote.name.clone(), handle)
            })
            .collect();

        let (shutdown_tx, _) = watch::channel(false);
        let (accepting_tx, _) = watch::channel(true);

        Ok(Self {
            shared: Arc::new(Shared {
                local: config.local,
                remotes,
                inbound,
                next_transaction: AtomicU32::new(rand::random::<u32>() | 1),
            }),
            tasks: Mutex::new(JoinSet::new()),
            shutdown_tx,
            accepting_tx,
        })
    }

    /// Spawn the listener and one task per client-mode remote
    pub async fn start(&self) -> Result<()> {
        let listener = match &self.shared.local.listen_address {
            Some(address) => {
                let listener = TcpListener::bind(address).await?;
                info!(address = %listener.local_addr()?, "SIGTRAN listener started");
                Some(listener)
            }
            None => None,
        };

        let mut tasks = self.tasks.lock();
        if let Some(listener) = listener {
            tasks.spawn(accept_loop(
                self.shared.clone(),
                listener,
                self.accepting_tx.subscribe(),
                self.shutdown_tx.subscribe(),
            ));
        }
        for remote in self.shared.remotes.values() {
            if remote.config.mode == RemoteMode::Client {
                tasks.spawn(client_loop(
                    self.shared.clone(),
                    remote.clone(),
                    self.shutdown_tx.subscribe(),
                ));
            }
        }
        Ok(())
    }

    /// Close the listener; established associations keep running
    pub fn stop_accepting(&self) {
        let _ = self.accepting_tx.send(false);
    }

    /// Send ASPDN and SHUTDOWN on every association, waiting at most `grace`
    pub async fn shutdown(&self, grace: Duration) {
        self.stop_accepting();
        let _ = self.shutdown_tx.send(true);

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "SIGTRAN tasks did not stop within grace period");
            tasks.shutdown().await;
        }
        info!("SIGTRAN stack stopped");
    }

    pub fn remote_state(&self, remote: &str) -> Option<RemoteState> {
        self.shared.remotes.get(remote).map(|r| *r.state.read())
    }

    pub fn remote_states(&self) -> Vec<(String, RemoteState)> {
        let mut states: Vec<_> = self
            .shared
            .remotes
            .iter()
            .map(|(name, r)| (name.clone(), *r.state.read()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Deliver `message` to `remote` as an MT-ForwardSM and wait for the answer
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn submit(&self, remote: &str, message: &Message) -> Result<SubmitReceipt> {
        if *self.shutdown_tx.borrow() {
            return Err(SigtranError::ShuttingDown);
        }
        let handle = self
            .shared
            .remotes
            .get(remote)
            .ok_or_else(|| SigtranError::UnknownRemote(remote.to_string()))?;
        if *handle.state.read() != RemoteState::Active {
            return Err(SigtranError::NotActive(remote.to_string()));
        }

        let (reply, response) = oneshot::channel();
        handle
            .commands_tx
            .try_send(Command::Submit {
                message: Box::new(message.clone()),
                reply,
            })
            .map_err(|_| SigtranError::NotActive(remote.to_string()))?;

        // The association enforces the operation timeout; this bound only
        // covers a task that stopped without answering.
        let limit = self.shared.local.operation_timeout() + self.shared.local.ack_timeout();
        match tokio::time::timeout(limit, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SigtranError::AssociationLost),
            Err(_) => Err(SigtranError::Timeout),
        }
    }
}

async fn client_loop(shared: Arc<Shared>, remote: Arc<Remote>, mut shutdown: watch::Receiver<bool>) {
    let name = remote.config.name.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }

        remote.set_state(RemoteState::Connecting);
        let connect = tokio::time::timeout(
            shared.local.ack_timeout(),
            TcpStream::connect(&remote.config.address),
        );
        match connect.await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                info!(remote = %name, address = %remote.config.address, "Connected");
                let mut commands = remote.commands_rx.lock().await;
                let result = run_association(
                    &shared,
                    &remote,
                    stream,
                    AspRole::Client,
                    &mut commands,
                    &mut shutdown,
                )
                .await;
                drain_commands(&mut commands);
                match result {
                    Ok(()) => info!(remote = %name, "Association closed"),
                    Err(e) => warn!(remote = %name, error = %e, "Association failed"),
                }
            }
            Ok(Err(e)) => warn!(remote = %name, error = %e, "Connect failed"),
            Err(_) => warn!(remote = %name, "Connect timed out"),
        }
        remote.set_state(RemoteState::Down);

        tokio::select! {
            _ = sleep(shared.local.reconnect_interval()) => {}
            _ = shutdown.changed() => {}
        }
    }
    debug!(remote = %name, "Client loop stopped");
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut accepting: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                };
                let Some(remote) = match_server_remote(&shared, peer) else {
                    warn!(peer = %peer, "Rejecting association from unknown peer");
                    continue;
                };
                let shared = shared.clone();
                let mut shutdown = shutdown.clone();
                connections.spawn(async move {
                    let Ok(mut commands) = remote.commands_rx.try_lock() else {
                        warn!(remote = %remote.config.name, peer = %peer, "Remote already has an association");
                        return;
                    };
                    let _ = stream.set_nodelay(true);
                    info!(remote = %remote.config.name, peer = %peer, "Association accepted");
                    remote.set_state(RemoteState::Connecting);
                    let result = run_association(
                        &shared,
                        &remote,
                        stream,
                        AspRole::Server,
                        &mut commands,
                        &mut shutdown,
                    )
                    .await;
                    drain_commands(&mut commands);
                    remote.set_state(RemoteState::Down);
                    if let Err(e) = result {
                        warn!(remote = %remote.config.name, error = %e, "Association failed");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = accepting.changed() => {
                if changed.is_err() || !*accepting.borrow() {
                    info!("SIGTRAN listener stopped accepting");
                    break;
                }
            }
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

fn match_server_remote(shared: &Shared, peer: SocketAddr) -> Option<Arc<Remote>> {
    shared
        .remotes
        .values()
        .find(|remote| {
            remote.config.mode == RemoteMode::Server
                && remote_ip(&remote.config.address) == Some(peer.ip())
        })
        .cloned()
}

fn remote_ip(address: &str) -> Option<IpAddr> {
    address
        .parse::<SocketAddr>()
        .map(|a| a.ip())
        .or_else(|_| address.parse::<IpAddr>())
        .ok()
}

fn drain_commands(commands: &mut mpsc::Receiver<Command>) {
    while let Ok(Command::Submit { reply, .. }) = commands.try_recv() {
        let _ = reply.send(Err(SigtranError::AssociationLost));
    }
}

fn remote_port(address: &str) -> u16 {
    address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(crate::DEFAULT_M3UA_PORT)
}

async fn run_association<S>(
    shared: &Arc<Shared>,
    remote: &Arc<Remote>,
    stream: S,
    role: AspRole,
    commands: &mut mpsc::Receiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (mut packets, reader_task) = spawn_reader(reader);

    let mut driver = Driver {
        shared: shared.clone(),
        remote: remote.clone(),
        association: Association::new(AssociationConfig {
            local_port: shared.local.sctp_port,
            remote_port: remote_port(&remote.config.address),
            outbound_streams: remote.config.streams.min(shared.local.streams),
            inbound_streams: shared.local.streams,
            max_retrans: shared.local.max_retrans,
        }),
        asp: Asp::new(
            role,
            remote.config.routing_context,
            remote.config.network_appearance,
        ),
        writer,
        connections: ConnectionTable::new(),
        pending: HashMap::new(),
        sls: 0,
    };

    let result = driver.run(&mut packets, commands, shutdown).await;
    driver.fail_pending(|| SigtranError::AssociationLost);
    reader_task.abort();
    result
}

struct Pending {
    message_id: MessageId,
    invoke_id: i32,
    deadline: Instant,
    reply: oneshot::Sender<Result<SubmitReceipt>>,
}

/// Where a TCAP message came from, so the answer goes back the same way
enum Reply {
    Connectionless {
        opc: u32,
        protocol_class: ProtocolClass,
        called_party: SccpAddress,
        calling_party: SccpAddress,
    },
    Connection {
        opc: u32,
        local_ref: u32,
    },
}

struct Driver<S> {
    shared: Arc<Shared>,
    remote: Arc<Remote>,
    association: Association,
    asp: Asp,
    writer: WriteHalf<S>,
    connections: ConnectionTable,
    pending: HashMap<u32, Pending>,
    sls: u8,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn name(&self) -> &str {
        &self.remote.config.name
    }

    async fn run(
        &mut self,
        packets: &mut mpsc::Receiver<std::result::Result<Packet, SctpError>>,
        commands: &mut mpsc::Receiver<Command>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if self.asp.role() == AspRole::Client {
            let actions = self.association.on_event(Event::Connect)?;
            if self.apply(actions).await? {
                return Ok(());
            }
        }

        let mut heartbeat = interval(self.shared.local.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.reset();
        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let bring_up = sleep(self.shared.local.ack_timeout() * 2);
        tokio::pin!(bring_up);
        let mut activated = false;

        loop {
            tokio::select! {
                packet = packets.recv() => {
                    match packet {
                        Some(Ok(packet)) => {
                            if self.feed(packet).await? {
                                return Ok(());
                            }
                        }
                        Some(Err(SctpError::Io(e))) => return Err(SigtranError::Io(e)),
                        Some(Err(e)) => warn!(remote = %self.name(), error = %e, "Dropping bad packet"),
                        None => return Err(SigtranError::AssociationLost),
                    }
                    if self.asp.is_active() {
                        activated = true;
                    }
                }
                _ = heartbeat.tick(), if self.association.is_established() => {
                    let actions = self.association.on_event(Event::HeartbeatTick)?;
                    self.apply(actions).await?;
                }
                _ = sweep.tick(), if !self.pending.is_empty() => {
                    self.expire_pending();
                }
                _ = &mut bring_up, if !activated => {
                    warn!(remote = %self.name(), "Association did not become active in time");
                    let actions = self.association.on_event(Event::Abort)?;
                    self.apply(actions).await?;
                    return Err(SigtranError::Timeout);
                }
                Some(command) = commands.recv(), if self.asp.is_active() => {
                    match command {
                        Command::Submit { message, reply } => self.submit(*message, reply).await?,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return self.close(packets).await;
                    }
                }
            }
        }
    }

    /// Graceful close: ASPDN then SCTP SHUTDOWN, bounded by the ack timeout
    async fn close(
        &mut self,
        packets: &mut mpsc::Receiver<std::result::Result<Packet, SctpError>>,
    ) -> Result<()> {
        info!(remote = %self.name(), "Closing association");
        if let Some(message) = self.asp.stop() {
            self.send_m3ua(message, 0).await?;
        }
        self.fail_pending(|| SigtranError::ShuttingDown);

        let actions = self.association.on_event(Event::Shutdown)?;
        if self.apply(actions).await? {
            return Ok(());
        }

        let deadline = sleep(self.shared.local.ack_timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                packet = packets.recv() => match packet {
                    Some(Ok(packet)) => {
                        if self.feed(packet).await? {
                            return Ok(());
                        }
                    }
                    Some(Err(_)) | None => return Ok(()),
                },
                _ = &mut deadline => {
                    warn!(remote = %self.name(), "Shutdown not acknowledged, aborting");
                    let actions = self.association.on_event(Event::Abort)?;
                    self.apply(actions).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Hand one packet to the association. Packets it refuses are dropped
    /// unless the refusal ends the association.
    async fn feed(&mut self, packet: Packet) -> Result<bool> {
        match self.association.on_event(Event::Packet(packet)) {
            Ok(actions) => self.apply(actions).await,
            Err(e @ (SctpError::Aborted | SctpError::AssociationFailed(_) | SctpError::Io(_))) => {
                Err(e.into())
            }
            Err(e) => {
                warn!(remote = %self.name(), error = %e, "Packet refused");
                Ok(false)
            }
        }
    }

    /// Carry out association actions; true once the association is closed
    async fn apply(&mut self, actions: Vec<Action>) -> Result<bool> {
        let mut closed = false;
        for action in actions {
            match action {
                Action::Transmit(packet) => write_packet(&mut self.writer, &packet).await?,
                Action::Established => {
                    info!(remote = %self.name(), role = ?self.asp.role(), "SCTP association established");
                    self.remote.set_state(RemoteState::Inactive);
                    if self.asp.role() == AspRole::Client {
                        let aspup = self.asp.start()?;
                        self.send_m3ua(aspup, 0).await?;
                    }
                }
                Action::Deliver {
                    stream_id,
                    ppid,
                    data,
                } => {
                    if ppid != PPID_M3UA {
                        warn!(remote = %self.name(), ppid, "Ignoring non-M3UA payload");
                        continue;
                    }
                    self.on_m3ua(stream_id, data).await?;
                }
                Action::Closed => closed = true,
            }
        }
        if closed {
            self.asp.reset();
        }
        Ok(closed)
    }

    async fn send_m3ua(&mut self, message: M3uaMessage, stream_id: u16) -> Result<()> {
        debug!(remote = %self.name(), message = message.name(), stream_id, "Sending M3UA");
        let data = m3ua::encode_message(message);
        let actions = self.association.on_event(Event::Send {
            stream_id,
            ppid: PPID_M3UA,
            data,
        })?;
        for action in actions {
            if let Action::Transmit(packet) = action {
                write_packet(&mut self.writer, &packet).await?;
            }
        }
        Ok(())
    }

    /// DATA goes on streams 1.. when the peer offered more than one
    fn data_stream(&self, sls: u8) -> u16 {
        let streams = self.association.outbound_streams();
        if streams > 1 {
            1 + (sls as u16 % (streams - 1))
        } else {
            0
        }
    }

    async fn on_m3ua(&mut self, stream_id: u16, data: Bytes) -> Result<()> {
        let pdu = match m3ua::decode(&data) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!(remote = %self.name(), stream_id, error = %e, "Bad M3UA message");
                let reply = M3uaMessage::Error {
                    error_code: m3ua::error_code::PROTOCOL_ERROR,
                    routing_context: Vec::new(),
                    diagnostic_info: Some(data.slice(..data.len().min(40))),
                };
                return self.send_m3ua(reply, 0).await;
            }
        };
        if !pdu.unknown.is_empty() {
            debug!(count = pdu.unknown.len(), "M3UA message carries unknown parameters");
        }

        let output = self.asp.on_message(pdu.message)?;
        if let Some(error_code) = output.peer_error {
            warn!(remote = %self.name(), error_code, state = ?self.asp.state(), "Peer reported M3UA error");
        }
        for reply in output.replies {
            self.send_m3ua(reply, 0).await?;
        }
        if let Some(state) = output.transition {
            self.remote.set_state(state.into());
            if state != AspState::Active {
                let name = self.remote.config.name.clone();
                self.fail_pending(|| SigtranError::NotActive(name.clone()));
            }
        }
        if let Some(protocol_data) = output.data {
            self.on_protocol_data(protocol_data).await?;
        }
        Ok(())
    }

    async fn on_protocol_data(&mut self, protocol_data: ProtocolData) -> Result<()> {
        if protocol_data.si != crate::SI_SCCP {
            debug!(si = protocol_data.si, "Ignoring non-SCCP user part");
            return Ok(());
        }
        let opc = protocol_data.opc;
        let message = match SccpMessage::decode(&protocol_data.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(remote = %self.name(), error = %e, "Bad SCCP message");
                return Ok(());
            }
        };

        match message {
            SccpMessage::Udt {
                protocol_class,
                called_party,
                calling_party,
                data,
            }
            | SccpMessage::Xudt {
                protocol_class,
                called_party,
                calling_party,
                data,
                ..
            } => {
                let reply = Reply::Connectionless {
                    opc,
                    protocol_class: ProtocolClass {
                        class: protocol_class.class,
                        return_on_error: false,
                    },
                    called_party: calling_party,
                    calling_party: called_party,
                };
                self.on_tcap(data, reply).await
            }
            SccpMessage::Udts {
                return_cause, data, ..
            } => {
                self.on_returned(return_cause, &data);
                Ok(())
            }
            connection_oriented => {
                let output = match self.connections.on_message(connection_oriented) {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(remote = %self.name(), error = %e, "Connection-oriented message refused");
                        return Ok(());
                    }
                };
                if let Some(reply) = output.reply {
                    self.send_sccp(opc, reply).await?;
                }
                if let Some((local_ref, data)) = output.data {
                    self.on_tcap(data, Reply::Connection { opc, local_ref }).await?;
                }
                Ok(())
            }
        }
    }

    async fn send_sccp(&mut self, dpc: u32, message: SccpMessage) -> Result<()> {
        let data = message.encode()?;
        self.sls = self.sls.wrapping_add(1) & 0x0F;
        let protocol_data = ProtocolData::sccp(
            self.shared.local.point_code,
            dpc,
            self.shared.local.network_indicator,
            self.sls,
            data,
        );
        let stream_id = self.data_stream(protocol_data.sls);
        let message = self.asp.wrap_data(protocol_data)?;
        self.send_m3ua(message, stream_id).await
    }

    async fn send_tcap(&mut self, reply: Reply, message: TcapMessage) -> Result<()> {
        let data = message.encode();
        match reply {
            Reply::Connectionless {
                opc,
                protocol_class,
                called_party,
                calling_party,
            } => {
                let udt = SccpMessage::Udt {
                    protocol_class,
                    called_party,
                    calling_party,
                    data,
                };
                self.send_sccp(opc, udt).await
            }
            Reply::Connection { opc, local_ref } => {
                let dt1 = self.connections.data(local_ref, data)?;
                self.send_sccp(opc, dt1).await
            }
        }
    }

    /// A UDTS carries back our own BEGIN; fail the transaction it opened
    fn on_returned(&mut self, return_cause: u8, data: &[u8]) {
        let transaction = TcapMessage::decode(data)
            .ok()
            .and_then(|m| m.originating_transaction_id().and_then(tcap::transaction_id_value));
        warn!(remote = %self.name(), return_cause, ?transaction, "Message returned by SCCP");
        if let Some(pending) = transaction.and_then(|tid| self.pending.remove(&tid)) {
            let _ = pending
                .reply
                .send(Err(crate::errors::SccpError::Returned(return_cause).into()));
        }
    }

    async fn on_tcap(&mut self, data: Bytes, reply: Reply) -> Result<()> {
        let message = match TcapMessage::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(remote = %self.name(), error = %e, "Bad TCAP message");
                return Ok(());
            }
        };
        debug!(remote = %self.name(), message = message.name(), "Received TCAP");

        match message {
            TcapMessage::Begin {
                originating_transaction_id,
                dialogue_portion,
                component_portion,
            } => {
                let answer = self.on_begin(dialogue_portion.as_ref(), &component_portion);
                let end = TcapMessage::End {
                    destination_transaction_id: originating_transaction_id,
                    dialogue_portion: dialogue_portion
                        .as_ref()
                        .and_then(|d| d.application_context_name())
                        .map(DialoguePortion::accept),
                    component_portion: answer,
                };
                self.send_tcap(reply, end).await
            }
            TcapMessage::Continue {
                originating_transaction_id,
                destination_transaction_id,
                component_portion,
                ..
            } => {
                let known = self.resolve(&destination_transaction_id, |pending| {
                    map::outcome(&component_portion, pending.invoke_id)
                });
                if known {
                    // Close the peer's side of the dialogue we no longer need
                    let end = TcapMessage::End {
                        destination_transaction_id: originating_transaction_id,
                        dialogue_portion: None,
                        component_portion: Vec::new(),
                    };
                    self.send_tcap(reply, end).await
                } else {
                    let abort = TcapMessage::Abort {
                        destination_transaction_id: originating_transaction_id,
                        cause: AbortCause::Provider(tcap::p_abort::UNRECOGNIZED_TRANSACTION_ID),
                    };
                    self.send_tcap(reply, abort).await
                }
            }
            TcapMessage::End {
                destination_transaction_id,
                component_portion,
                ..
            } => {
                self.resolve(&destination_transaction_id, |pending| {
                    map::outcome(&component_portion, pending.invoke_id)
                });
                Ok(())
            }
            TcapMessage::Abort {
                destination_transaction_id,
                cause,
            } => {
                let code = match cause {
                    AbortCause::Provider(code) => Some(code),
                    AbortCause::User => None,
                };
                self.resolve(&destination_transaction_id, |_| {
                    Err(MapError::Tcap(TcapError::Aborted(code)))
                });
                Ok(())
            }
        }
    }

    /// Answer an inbound BEGIN: ForwardSM invokes become gateway messages
    fn on_begin(&self, dialogue: Option<&DialoguePortion>, components: &[Component]) -> Vec<Component> {
        if let Some(ac) = dialogue.and_then(|d| d.application_context_name()) {
            debug!(application_context = ?ac, "Dialogue requested");
        }
        components
            .iter()
            .filter_map(|component| match component {
                Component::Invoke {
                    invoke_id,
                    operation_code,
                    parameter,
                    ..
                } => Some(match self.on_invoke(*operation_code, parameter.as_ref()) {
                    Ok(()) => map::result(*invoke_id),
                    Err(e) => {
                        warn!(remote = %self.name(), operation_code, error = %e, "Inbound operation failed");
                        map::error(*invoke_id, map::error_code_for(&e))
                    }
                }),
                _ => None,
            })
            .collect()
    }

    fn on_invoke(&self, operation_code: i32, parameter: Option<&Bytes>) -> std::result::Result<(), MapError> {
        let operation = SmsOperation::from_code(operation_code)?;
        let parameter = parameter.ok_or_else(|| MapError::OperationError {
            code: map::error_code::DATA_MISSING,
        })?;
        let arg = map::ForwardSmArg::decode(parameter)?;
        let message = map::inbound_message(operation, &arg, self.name(), Utc::now())?;

        info!(
            remote = %self.name(),
            operation = operation.name(),
            message_id = %message.id,
            source = %message.source,
            destination = %message.destination,
            "Inbound short message"
        );
        self.shared.inbound.try_send(message).map_err(|e| {
            warn!(error = %e, "Inbound message sink unavailable");
            MapError::OperationError {
                code: map::error_code::SYSTEM_FAILURE,
            }
        })
    }

    /// Complete the pending transaction `dtid`; false when it is unknown
    fn resolve<F>(&mut self, dtid: &[u8], outcome: F) -> bool
    where
        F: FnOnce(&Pending) -> std::result::Result<(), MapError>,
    {
        let Some(pending) = tcap::transaction_id_value(dtid).and_then(|tid| {
            self.pending.remove(&tid).map(|p| (tid, p))
        }) else {
            debug!(remote = %self.name(), ?dtid, "Answer for unknown transaction");
            return false;
        };
        let (transaction_id, pending) = pending;
        let result = outcome(&pending)
            .map(|()| SubmitReceipt {
                remote: self.remote.config.name.clone(),
                message_id: pending.message_id.clone(),
                transaction_id,
            })
            .map_err(SigtranError::from);
        match &result {
            Ok(_) => debug!(transaction_id, message_id = %pending.message_id, "MT-ForwardSM acknowledged"),
            Err(e) => info!(transaction_id, message_id = %pending.message_id, error = %e, "MT-ForwardSM failed"),
        }
        let _ = pending.reply.send(result);
        true
    }

    async fn submit(
        &mut self,
        message: Message,
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    ) -> Result<()> {
        let transaction_id = self.shared.next_transaction_id();
        let begin = map::mt_forward_sm(&message, &self.shared.service_centre(), Utc::now())
            .and_then(|arg| arg.encode())
            .map(|argument| TcapMessage::Begin {
                originating_transaction_id: tcap::transaction_id(transaction_id),
                dialogue_portion: Some(DialoguePortion::request(
                    SmsOperation::MtForwardSm.application_context(),
                )),
                component_portion: vec![map::invoke(SmsOperation::MtForwardSm, INVOKE_ID, argument)],
            });
        let begin = match begin {
            Ok(begin) => begin,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return Ok(());
            }
        };

        let udt = SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_1.with_return_on_error(),
            called_party: self.shared.remote_sccp_address(&self.remote.config),
            calling_party: self.shared.local_sccp_address(),
            data: begin.encode(),
        };
        debug!(
            remote = %self.name(),
            transaction_id,
            message_id = %message.id,
            "Sending MT-ForwardSM"
        );
        self.send_sccp(self.remote.config.point_code, udt).await?;

        self.pending.insert(
            transaction_id,
            Pending {
                message_id: message.id,
                invoke_id: INVOKE_ID,
                deadline: Instant::now() + self.shared.local.operation_timeout(),
                reply,
            },
        );
        Ok(())
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in expired {
            if let Some(pending) = self.pending.remove(&tid) {
                warn!(remote = %self.name(), transaction_id = tid, message_id = %pending.message_id, "MT-ForwardSM timed out");
                let _ = pending.reply.send(Err(SigtranError::Timeout));
            }
        }
    }

    fn fail_pending<F>(&mut self, error: F)
    where
        F: Fn() -> SigtranError,
    {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error()));
        }
    }
}
