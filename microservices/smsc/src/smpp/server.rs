//! SMPP listener and per-connection session tasks

use dashmap::DashMap;
use parking_lot::Mutex;
use smsc_core::{Message, Origin};
use smsc_telemetry::{Counter, Exposition, Gauge};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::io::{write_pdu, Frame, PduReader};
use super::pdu::{Pdu, SmBody};
use super::receipt::Receipt;
use super::session::{Credentials, Session, SessionConfig, Submitter, MAX_MALFORMED};
use crate::error::SessionError;
use crate::queue::StatusSink;

/// Depth of each session's outbound `deliver_sm` queue
const DELIVER_QUEUE_DEPTH: usize = 256;

struct ReceiverHandle {
    system_id: String,
    deliver: mpsc::Sender<SmBody>,
}

/// Receiver-capable sessions by id, used to route receipts back to the ESME
/// that submitted the message
#[derive(Default)]
pub struct SessionRegistry {
    receivers: DashMap<u64, ReceiverHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, session_id: u64, system_id: String, deliver: mpsc::Sender<SmBody>) {
        self.receivers.insert(session_id, ReceiverHandle { system_id, deliver });
    }

    fn unregister(&self, session_id: u64) {
        self.receivers.remove(&session_id);
    }

    pub fn receivers(&self, system_id: &str) -> usize {
        self.receivers
            .iter()
            .filter(|h| h.system_id == system_id)
            .count()
    }

    /// Queue a `deliver_sm` on one receiver bound as `system_id`
    pub fn deliver(&self, system_id: &str, sm: SmBody) -> bool {
        let mut sm = Some(sm);
        for handle in self.receivers.iter().filter(|h| h.system_id == system_id) {
            let Some(body) = sm.take() else { break };
            match handle.deliver.try_send(body) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Full(body))
                | Err(mpsc::error::TrySendError::Closed(body)) => sm = Some(body),
            }
        }
        false
    }
}

impl StatusSink for SessionRegistry {
    fn on_status(&self, message: &Message) {
        if message.origin != Origin::Smpp || !message.wants_receipt() {
            return;
        }
        let (Some(receipt), Some(client)) = (Receipt::for_message(message), &message.client_id)
        else {
            return;
        };
        if !self.deliver(client, receipt.to_deliver_sm(message)) {
            debug!(message_id = %message.id, system_id = %client, "No receiver bound for receipt");
        }
    }
}

struct ServerMetrics {
    connections_total: Counter,
    connections_active: Gauge,
    rejected_connections: Counter,
}

/// Everything a session task needs, shared by all of them
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<SessionConfig>,
    pub credentials: Arc<dyn Credentials>,
    pub submitter: Arc<dyn Submitter>,
    pub registry: Arc<SessionRegistry>,
    pub max_pdu_size: usize,
}

pub struct SmppServer {
    context: SessionContext,
    max_connections: usize,
    next_session: Arc<AtomicU64>,
    metrics: Arc<ServerMetrics>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    accepting_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl SmppServer {
    pub fn new(context: SessionContext, max_connections: usize) -> Self {
        let (accepting_tx, _) = watch::channel(true);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            context,
            max_connections,
            next_session: Arc::new(AtomicU64::new(1)),
            metrics: Arc::new(ServerMetrics {
                connections_total: Counter::new("smpp_connections_total"),
                connections_active: Gauge::new("smpp_connections_active"),
                rejected_connections: Counter::new("smpp_connections_rejected"),
            }),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
            accepting_tx,
            shutdown_tx,
        }
    }

    /// Bind the listener and spawn the accept loop
    pub async fn start(&self, address: &str) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(address).await?;
        let local = listener.local_addr()?;
        info!(address = %local, "SMPP server listening");

        let accept = AcceptLoop {
            listener,
            context: self.context.clone(),
            max_connections: self.max_connections,
            next_session: self.next_session.clone(),
            metrics: self.metrics.clone(),
            tasks: self.tasks.clone(),
            accepting: self.accepting_tx.subscribe(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        self.tasks.lock().spawn(accept.run());
        Ok(local)
    }

    pub fn active_sessions(&self) -> u64 {
        self.metrics.connections_active.get()
    }

    pub fn total_connections(&self) -> u64 {
        self.metrics.connections_total.get()
    }

    pub fn export_metrics(&self, out: &mut Exposition) {
        out.counter_of(&self.metrics.connections_total, "SMPP connections accepted")
            .gauge_of(&self.metrics.connections_active, "SMPP sessions open")
            .counter_of(
                &self.metrics.rejected_connections,
                "SMPP connections refused at the limit",
            );
    }

    pub fn stop_accepting(&self) {
        let _ = self.accepting_tx.send(false);
    }

    /// Unbind every session and wait for them to close, at most `grace`
    pub async fn shutdown(&self, grace: Duration) {
        self.stop_accepting();
        let _ = self.shutdown_tx.send(true);

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "SMPP sessions did not close within grace period");
            tasks.shutdown().await;
        }
        info!("SMPP server stopped");
    }
}

struct AcceptLoop {
    listener: TcpListener,
    context: SessionContext,
    max_connections: usize,
    next_session: Arc<AtomicU64>,
    metrics: Arc<ServerMetrics>,
    tasks: Arc<Mutex<JoinSet<()>>>,
    accepting: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl AcceptLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (socket, addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            continue;
                        }
                    };
                    if self.metrics.connections_active.get() >= self.max_connections as u64 {
                        warn!(peer = %addr, "Max connections reached, rejecting");
                        self.metrics.rejected_connections.inc();
                        continue;
                    }
                    let _ = socket.set_nodelay(true);

                    let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    self.metrics.connections_total.inc();
                    self.metrics.connections_active.inc();
                    debug!(session_id, peer = %addr, "SMPP connection accepted");

                    let context = self.context.clone();
                    let metrics = self.metrics.clone();
                    let shutdown = self.shutdown.clone();
                    self.tasks.lock().spawn(async move {
                        match run_session(socket, session_id, context, shutdown).await {
                            Ok(()) => debug!(session_id, "Session ended"),
                            Err(e) => debug!(session_id, error = %e, "Session ended with error"),
                        }
                        metrics.connections_active.dec();
                    });
                }
                changed = self.accepting.changed() => {
                    if changed.is_err() || !*self.accepting.borrow() {
                        break;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("SMPP listener closed");
    }
}

/// Serve one ESME connection until it closes
pub async fn run_session<S>(
    stream: S,
    session_id: u64,
    context: SessionContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut frames = PduReader::new(reader, context.max_pdu_size);
    let mut session = Session::new(
        context.config.clone(),
        context.credentials.clone(),
        context.submitter.clone(),
        Instant::now(),
    );
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<SmBody>(DELIVER_QUEUE_DEPTH);
    let mut registered = false;
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    let result = loop {
        tokio::select! {
            frame = frames.next() => {
                let now = Instant::now();
                let replies = match frame {
                    Ok(Some(Frame::Pdu(pdu))) => session.on_pdu(pdu, now),
                    Ok(Some(Frame::Malformed { sequence_number, error })) => {
                        session.on_malformed(sequence_number, &error, now)
                    }
                    Ok(None) => break Ok(()),
                    Err(SessionError::Decode(error)) => {
                        // Framing is lost; answer once and hang up
                        warn!(session_id, error = %error, "Unframeable PDU");
                        let nack = Pdu::generic_nack(frames.pending_sequence(), error.command_status());
                        let _ = write_pdu(&mut writer, &nack).await;
                        break Err(SessionError::Decode(error));
                    }
                    Err(e) => break Err(e),
                };
                if !registered && session.state().can_receive() {
                    if let Some(system_id) = session.system_id() {
                        context.registry.register(session_id, system_id.to_string(), deliver_tx.clone());
                        registered = true;
                    }
                }
                if let Err(e) = write_all(&mut writer, &replies).await {
                    break Err(e);
                }
            }
            Some(sm) = deliver_rx.recv() => {
                if let Some(pdu) = session.deliver(sm, Instant::now()) {
                    if let Err(e) = write_pdu(&mut writer, &pdu).await {
                        break Err(e.into());
                    }
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                session.expire_outstanding(now);
                if session.is_idle(now) {
                    info!(session_id, system_id = ?session.system_id(), "Session idle, closing");
                    break Err(SessionError::IdleTimeout);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    if let Some(unbind) = session.unbind() {
                        let _ = write_pdu(&mut writer, &unbind).await;
                    }
                    break Err(SessionError::Closed);
                }
            }
        }

        if session.is_closed() {
            if session.malformed_count() >= MAX_MALFORMED {
                break Err(SessionError::TooManyMalformed);
            }
            break Ok(());
        }
    };

    if registered {
        context.registry.unregister(session_id);
    }
    session.close();
    let _ = writer.shutdown().await;
    result
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, pdus: &[Pdu]) -> Result<(), SessionError> {
    for pdu in pdus {
        write_pdu(writer, pdu).await?;
    }
    Ok(())
}
