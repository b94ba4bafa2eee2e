//! Delivery queue
//!
//! Every operator gets a lane: a task that owns that operator's priority
//! queue and token bucket and is the only writer of its entries. Submissions
//! and failover hand entries to a lane over an unbounded channel; admission
//! control happens before that, against the operator's `queued` counter.
//!
//! A lane pops the highest-priority entry whose attempt time has come, takes
//! a token, and runs the send as a child task so that slow transports do not
//! stall the lane. Results come back into the lane, which retries with
//! exponential backoff, fails over on unavailable transports, or finishes
//! the message.

pub mod bucket;
pub mod sink;

pub use bucket::TokenBucket;
pub use sink::{FanoutSink, NullSink, PersistingSink, StatusSink};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use smsc_core::{Message, MessageId, MessageStatus, OperatorId, OperatorStatus, Priority};
use smsc_telemetry::{Counter, Exposition, Histogram, HistogramSnapshot};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, SubmitOutcome};
use crate::error::{QueueError, TransportError};
use crate::registry::{OperatorEntry, OperatorRegistry};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Entries an operator may hold before submissions are refused
    pub max_queue_depth: usize,
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub sweep_interval: Duration,
    /// Gate dispatch on per-operator token buckets
    pub rate_limit: bool,
    /// Bucket capacity, clamped to the operator's rate; 0 means the full rate
    pub burst: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 10_000,
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            rate_limit: true,
            burst: 0,
        }
    }
}

impl DeliveryConfig {
    /// `min(base * 2^attempt, cap)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_base.saturating_mul(factor).min(self.retry_cap)
    }

    fn burst_for(&self, tps: u32) -> u32 {
        match self.burst {
            0 => tps,
            burst => burst,
        }
    }
}

/// A message waiting in an operator lane
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub message: Message,
    pub next_attempt: Instant,
    pub attempt: u32,
    /// Enqueue order, breaks priority ties
    pub seq: u64,
    /// Ranked operators from routing, used for failover
    pub candidates: Vec<OperatorId>,
}

impl QueueEntry {
    fn priority(&self) -> Priority {
        self.message.priority
    }
}

/// Ready entries: priority descending, then FIFO
struct Ready(QueueEntry);

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority()
            .cmp(&other.0.priority())
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Entries not yet due: earliest attempt first
struct Waiting(QueueEntry);

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiting {}

impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .next_attempt
            .cmp(&self.0.next_attempt)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

struct QueueMetrics {
    submitted: Counter,
    sent: Counter,
    delivered: Counter,
    failed: Counter,
    expired: Counter,
    rejected: Counter,
    retried: Counter,
    dispatch_latency_ms: Histogram,
}

impl QueueMetrics {
    fn new() -> Self {
        Self {
            submitted: Counter::new("queue_submitted_total"),
            sent: Counter::new("queue_sent_total"),
            delivered: Counter::new("queue_delivered_total"),
            failed: Counter::new("queue_failed_total"),
            expired: Counter::new("queue_expired_total"),
            rejected: Counter::new("queue_rejected_total"),
            retried: Counter::new("queue_retried_total"),
            dispatch_latency_ms: Histogram::new("queue_dispatch_latency_ms"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub awaiting_receipt: usize,
    pub submitted: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub rejected: u64,
    pub retried: u64,
    pub dispatch_latency_ms: HistogramSnapshot,
}

struct Inner {
    config: DeliveryConfig,
    registry: Arc<OperatorRegistry>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn StatusSink>,
    lanes: DashMap<OperatorId, mpsc::UnboundedSender<QueueEntry>>,
    tasks: Mutex<JoinSet<()>>,
    seq: AtomicU64,
    /// Messages not yet finished, by id
    live: DashMap<MessageId, Message>,
    /// Sent messages waiting for a receipt, by (operator, remote id)
    awaiting: DashMap<(OperatorId, String), MessageId>,
    metrics: QueueMetrics,
    shutdown_tx: watch::Sender<bool>,
}

impl Inner {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Record a status change and pass it on
    fn report(&self, message: &Message) {
        match message.status {
            MessageStatus::Sent => self.metrics.sent.inc(),
            MessageStatus::Delivered => self.metrics.delivered.inc(),
            MessageStatus::Failed => self.metrics.failed.inc(),
            MessageStatus::Expired => self.metrics.expired.inc(),
            MessageStatus::Rejected => self.metrics.rejected.inc(),
            MessageStatus::Pending | MessageStatus::Scheduled => {}
        }
        if message.status.is_terminal() {
            self.live.remove(&message.id);
        } else {
            self.live.insert(message.id.clone(), message.clone());
        }
        self.sink.on_status(message);
    }

    fn transition(&self, message: &mut Message, status: MessageStatus) {
        match message.transition(status) {
            Ok(()) => self.report(message),
            Err(e) => warn!(message_id = %message.id, error = %e, "Dropped status change"),
        }
    }

    /// Finish a message that is leaving the queue for good
    fn finish(&self, mut message: Message, status: MessageStatus) {
        debug!(
            message_id = %message.id,
            status = status.as_str(),
            retries = message.retry_count,
            "Message finished"
        );
        self.transition(&mut message, status);
    }

    fn lane(self: &Arc<Self>, operator: &OperatorId) -> mpsc::UnboundedSender<QueueEntry> {
        if let Some(lane) = self.lanes.get(operator) {
            return lane.clone();
        }
        self.lanes
            .entry(operator.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let lane = Lane::new(operator.clone(), self.clone(), rx);
                self.tasks.lock().spawn(lane.run());
                debug!(operator = %operator, "Lane started");
                tx
            })
            .clone()
    }

    /// Hand an entry to `operator`'s lane, counting it as queued there
    fn enqueue(self: &Arc<Self>, operator: &OperatorId, mut entry: QueueEntry) {
        entry.message.operator_id = Some(operator.clone());
        let counters = self.registry.get(operator);
        if let Some(counters) = &counters {
            counters.enqueued();
        }
        if let Err(mpsc::error::SendError(entry)) = self.lane(operator).send(entry) {
            if let Some(counters) = &counters {
                counters.dequeued();
            }
            warn!(message_id = %entry.message.id, operator = %operator, "Lane closed, message left pending");
        }
    }

    /// Next eligible and bound candidate after `current`, wrapping around
    fn failover_target(&self, candidates: &[OperatorId], current: &OperatorId) -> Option<OperatorId> {
        let split = candidates
            .iter()
            .position(|c| c == current)
            .map_or(0, |p| p + 1);
        candidates[split..]
            .iter()
            .chain(candidates[..split].iter())
            .filter(|c| *c != current)
            .find(|c| self.registry.is_eligible(c) && self.dispatcher.is_bound(c))
            .cloned()
    }

    fn on_sent(&self, operator: &OperatorId, mut message: Message, outcome: SubmitOutcome) {
        self.transition(&mut message, MessageStatus::Sent);
        if outcome.delivered {
            self.finish(message, MessageStatus::Delivered);
            return;
        }
        match outcome.remote_id {
            Some(remote_id) if message.wants_receipt() => {
                debug!(message_id = %message.id, operator = %operator, remote_id = %remote_id, "Awaiting receipt");
                self.awaiting.insert((operator.clone(), remote_id), message.id.clone());
            }
            // Nothing further will be heard about it
            _ => {
                self.live.remove(&message.id);
            }
        }
    }

    /// Expire sent messages whose receipt never came
    fn expire_awaiting(&self, operator: &OperatorId, now: DateTime<Utc>) {
        let overdue: Vec<(OperatorId, String)> = self
            .awaiting
            .iter()
            .filter(|item| &item.key().0 == operator)
            .filter(|item| {
                self.live
                    .get(item.value())
                    .map_or(true, |message| message.is_expired_at(now))
            })
            .map(|item| item.key().clone())
            .collect();
        for key in overdue {
            if let Some((_, id)) = self.awaiting.remove(&key) {
                if let Some((_, message)) = self.live.remove(&id) {
                    self.finish(message, MessageStatus::Expired);
                }
            }
        }
    }
}

/// Handle to the delivery queue. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl DeliveryQueue {
    pub fn new(
        config: DeliveryConfig,
        registry: Arc<OperatorRegistry>,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                dispatcher,
                sink,
                lanes: DashMap::new(),
                tasks: Mutex::new(JoinSet::new()),
                seq: AtomicU64::new(0),
                live: DashMap::new(),
                awaiting: DashMap::new(),
                metrics: QueueMetrics::new(),
                shutdown_tx,
            }),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    /// Admit a routed message to the lane of its first candidate.
    ///
    /// Refused with `Backpressure` when that lane is full. A message with a
    /// future `scheduled_at` is held as `scheduled` until due; one already
    /// past its validity is accepted and expired at once.
    pub fn submit(
        &self,
        mut message: Message,
        candidates: Vec<OperatorId>,
    ) -> Result<MessageId, QueueError> {
        let inner = &self.inner;
        if inner.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        let operator = candidates.first().cloned().ok_or(QueueError::NoCandidates)?;
        let counters = inner
            .registry
            .get(&operator)
            .ok_or_else(|| QueueError::UnknownOperator(operator.clone()))?;
        let depth = counters.queued();
        if depth >= inner.config.max_queue_depth {
            debug!(operator = %operator, depth, "Queue full");
            return Err(QueueError::Backpressure { operator, depth });
        }

        let id = message.id.clone();
        inner.metrics.submitted.inc();
        message.operator_id = Some(operator.clone());

        let now = Utc::now();
        if message.is_expired_at(now) {
            inner.report(&message);
            inner.finish(message, MessageStatus::Expired);
            return Ok(id);
        }

        let mut next_attempt = Instant::now();
        if let Some(at) = message.scheduled_at.filter(|at| *at > now) {
            // Initial state of a deferred message, not a transition
            message.status = MessageStatus::Scheduled;
            next_attempt += (at - now).to_std().unwrap_or_default();
        }
        inner.report(&message);

        debug!(
            message_id = %id,
            operator = %operator,
            priority = ?message.priority,
            status = message.status.as_str(),
            "Message queued"
        );
        let entry = QueueEntry {
            message,
            next_attempt,
            attempt: 0,
            seq: inner.next_seq(),
            candidates,
        };
        inner.enqueue(&operator, entry);
        Ok(id)
    }

    /// Record a message the gateway refused (no route), as `rejected`
    pub fn reject(&self, mut message: Message, reason: impl Into<String>) {
        let reason = reason.into();
        info!(message_id = %message.id, destination = %message.destination.digits, reason = %reason, "Message rejected");
        message.last_error = Some(reason);
        self.inner.finish(message, MessageStatus::Rejected);
    }

    /// Apply a delivery receipt for a message sent through `operator`.
    /// Returns false when no sent message carries that remote id.
    pub fn on_receipt(&self, operator: &OperatorId, remote_id: &str, delivered: bool) -> bool {
        let Some((_, id)) = self
            .inner
            .awaiting
            .remove(&(operator.clone(), remote_id.to_string()))
        else {
            debug!(operator = %operator, remote_id, "Receipt for unknown message");
            return false;
        };
        let Some((_, mut message)) = self.inner.live.remove(&id) else {
            return false;
        };
        let status = if delivered {
            MessageStatus::Delivered
        } else {
            message.last_error = Some("negative delivery receipt".to_string());
            MessageStatus::Failed
        };
        self.inner.finish(message, status);
        true
    }

    /// Entries waiting in `operator`'s lane, not counting in-flight sends
    pub fn queue_size(&self, operator: &OperatorId) -> Option<usize> {
        self.inner.registry.get(operator).map(|entry| entry.queued())
    }

    pub fn total_size(&self) -> usize {
        self.inner.registry.loads().iter().map(|load| load.queued).sum()
    }

    pub fn stats(&self) -> QueueStats {
        let loads = self.inner.registry.loads();
        let metrics = &self.inner.metrics;
        QueueStats {
            queued: loads.iter().map(|load| load.queued).sum(),
            in_flight: loads.iter().map(|load| load.in_flight).sum(),
            awaiting_receipt: self.inner.awaiting.len(),
            submitted: metrics.submitted.get(),
            sent: metrics.sent.get(),
            delivered: metrics.delivered.get(),
            failed: metrics.failed.get(),
            expired: metrics.expired.get(),
            rejected: metrics.rejected.get(),
            retried: metrics.retried.get(),
            dispatch_latency_ms: metrics.dispatch_latency_ms.snapshot(),
        }
    }

    /// Counters and levels in text exposition form
    pub fn export_metrics(&self, out: &mut Exposition) {
        let metrics = &self.inner.metrics;
        let loads = self.inner.registry.loads();
        out.counter_of(&metrics.submitted, "Messages admitted to the queue")
            .counter_of(&metrics.sent, "Messages accepted by an operator")
            .counter_of(&metrics.delivered, "Messages confirmed delivered")
            .counter_of(&metrics.failed, "Messages that failed for good")
            .counter_of(&metrics.expired, "Messages whose validity ran out")
            .counter_of(&metrics.rejected, "Messages refused before queueing")
            .counter_of(&metrics.retried, "Send attempts scheduled for retry")
            .summary(
                metrics.dispatch_latency_ms.name(),
                "Operator send latency in milliseconds",
                &metrics.dispatch_latency_ms.snapshot(),
            )
            .gauge(
                "queue_awaiting_receipt",
                "Sent messages waiting for a delivery receipt",
                self.inner.awaiting.len() as u64,
            )
            .labeled_gauge(
                "queue_operator_queued",
                "Messages waiting per operator",
                "operator",
                loads.iter().map(|load| (load.id.as_str(), load.queued as u64)),
            )
            .labeled_gauge(
                "queue_operator_in_flight",
                "Send attempts running per operator",
                "operator",
                loads.iter().map(|load| (load.id.as_str(), load.in_flight as u64)),
            );
    }

    /// Current state of a message the queue still tracks
    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.inner.live.get(id).map(|m| m.clone())
    }

    /// Stop every lane. Lanes finish their in-flight sends; whatever is still
    /// running after `grace` is aborted. Queued messages stay `pending`.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.inner.shutdown_tx.send(true);
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "Lanes did not stop within grace period");
            tasks.shutdown().await;
        }
        self.inner.lanes.clear();
        info!(left_pending = self.inner.live.len(), "Delivery queue stopped");
    }
}

type AttemptResult = (QueueEntry, Result<SubmitOutcome, TransportError>);

/// Single writer of one operator's queue
struct Lane {
    operator: OperatorId,
    inner: Arc<Inner>,
    rx: mpsc::UnboundedReceiver<QueueEntry>,
    ready: BinaryHeap<Ready>,
    waiting: BinaryHeap<Waiting>,
    bucket: Option<TokenBucket>,
    attempts: JoinSet<AttemptResult>,
    shutdown: watch::Receiver<bool>,
}

impl Lane {
    fn new(operator: OperatorId, inner: Arc<Inner>, rx: mpsc::UnboundedReceiver<QueueEntry>) -> Self {
        let shutdown = inner.shutdown_tx.subscribe();
        Self {
            operator,
            inner,
            rx,
            ready: BinaryHeap::new(),
            waiting: BinaryHeap::new(),
            bucket: None,
            attempts: JoinSet::new(),
            shutdown,
        }
    }

    fn counters(&self) -> Option<Arc<OperatorEntry>> {
        self.inner.registry.get(&self.operator)
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.inner.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*self.shutdown.borrow() {
            let now = Instant::now();
            self.promote(now);
            self.dispatch(now);

            let wake = self.next_wake(now);
            let sleep = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.changed() => break,
                received = self.rx.recv() => match received {
                    Some(entry) => self.admit(entry),
                    None => break,
                },
                Some(joined) = self.attempts.join_next(), if !self.attempts.is_empty() => {
                    self.on_attempt(joined);
                }
                _ = sweep.tick() => self.sweep(),
                _ = sleep => {}
            }
        }

        while let Some(joined) = self.attempts.join_next().await {
            self.on_attempt(joined);
        }
        debug!(
            operator = %self.operator,
            queued = self.ready.len() + self.waiting.len(),
            "Lane stopped"
        );
    }

    fn admit(&mut self, entry: QueueEntry) {
        if entry.message.status == MessageStatus::Scheduled || entry.next_attempt > Instant::now() {
            self.waiting.push(Waiting(entry));
        } else {
            self.ready.push(Ready(entry));
        }
    }

    /// Move due entries to the ready heap; due scheduled messages become pending
    fn promote(&mut self, now: Instant) {
        while self
            .waiting
            .peek()
            .is_some_and(|top| top.0.next_attempt <= now)
        {
            let Some(Waiting(mut entry)) = self.waiting.pop() else {
                break;
            };
            if entry.message.status == MessageStatus::Scheduled {
                self.inner.transition(&mut entry.message, MessageStatus::Pending);
            }
            self.ready.push(Ready(entry));
        }
    }

    fn refresh_bucket(&mut self, counters: &OperatorEntry, now: Instant) {
        if !self.inner.config.rate_limit {
            self.bucket = None;
            return;
        }
        let tps = self.inner.registry.effective_tps(counters);
        let burst = self.inner.config.burst_for(tps);
        match &mut self.bucket {
            Some(bucket) if bucket.rate() == tps as f64 => {}
            Some(bucket) => bucket.reconfigure(tps, burst, now),
            None => self.bucket = Some(TokenBucket::new(tps, burst, now)),
        }
    }

    fn dispatch(&mut self, now: Instant) {
        if self.ready.is_empty() {
            return;
        }
        let counters = self.counters();
        let active = counters
            .as_ref()
            .is_some_and(|c| c.status() == OperatorStatus::Active);
        if !active {
            self.divert_ready(now);
            return;
        }
        if let Some(counters) = &counters {
            self.refresh_bucket(counters, now);
        }

        let wall = Utc::now();
        while let Some(top) = self.ready.peek() {
            if top.0.message.is_expired_at(wall) {
                if let Some(Ready(entry)) = self.ready.pop() {
                    self.drop_expired(entry);
                }
                continue;
            }
            if let Some(bucket) = &mut self.bucket {
                if !bucket.try_take(now) {
                    break;
                }
            }
            let Some(Ready(entry)) = self.ready.pop() else {
                break;
            };
            self.start_attempt(entry);
        }
    }

    /// The operator was disabled or removed: move ready work to another
    /// candidate, or hold it until the operator comes back
    fn divert_ready(&mut self, now: Instant) {
        let counters = self.counters();
        while let Some(Ready(mut entry)) = self.ready.pop() {
            if let Some(counters) = &counters {
                counters.dequeued();
            }
            match self.inner.failover_target(&entry.candidates, &self.operator) {
                Some(target) => {
                    debug!(message_id = %entry.message.id, from = %self.operator, to = %target, "Operator unavailable, moving message");
                    self.inner.enqueue(&target, entry);
                }
                None => {
                    if let Some(counters) = &counters {
                        counters.enqueued();
                    }
                    entry.next_attempt = now + self.inner.config.retry_base;
                    self.waiting.push(Waiting(entry));
                }
            }
        }
    }

    fn start_attempt(&mut self, entry: QueueEntry) {
        if let Some(counters) = self.counters() {
            counters.dequeued();
            counters.attempt_started();
        }
        let inner = self.inner.clone();
        let operator = self.operator.clone();
        self.attempts.spawn(async move {
            let started = Instant::now();
            let result = inner.dispatcher.dispatch(&operator, &entry.message).await;
            inner
                .metrics
                .dispatch_latency_ms
                .record(started.elapsed().as_secs_f64() * 1000.0);
            (entry, result)
        });
    }

    fn on_attempt(&mut self, joined: Result<AttemptResult, JoinError>) {
        if let Some(counters) = self.counters() {
            counters.attempt_finished();
        }
        let (entry, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(operator = %self.operator, error = %e, "Send task failed");
                return;
            }
        };
        match result {
            Ok(outcome) => self.inner.on_sent(&self.operator, entry.message, outcome),
            Err(e) => self.on_failure(entry, e),
        }
    }

    fn on_failure(&mut self, mut entry: QueueEntry, error: TransportError) {
        let max_retries = self.inner.config.max_retries;
        let message = &mut entry.message;
        message.last_error = Some(error.to_string());

        if error.is_permanent() {
            warn!(message_id = %message.id, operator = %self.operator, error = %error, "Message refused by operator");
            self.inner.finish(entry.message, MessageStatus::Failed);
            return;
        }

        message.retry_count = (message.retry_count + 1).min(max_retries);
        if message.is_expired() {
            self.inner.finish(entry.message, MessageStatus::Expired);
            return;
        }
        if !message.can_retry(max_retries) {
            warn!(
                message_id = %message.id,
                operator = %self.operator,
                retries = message.retry_count,
                error = %error,
                "Retries exhausted"
            );
            self.inner.finish(entry.message, MessageStatus::Failed);
            return;
        }

        let delay = self.inner.config.backoff(message.retry_count - 1);
        entry.attempt += 1;
        entry.next_attempt = Instant::now() + delay;
        self.inner.metrics.retried.inc();
        self.inner.report(&entry.message);

        let target = if error.is_unavailable() {
            self.inner.failover_target(&entry.candidates, &self.operator)
        } else {
            None
        };
        debug!(
            message_id = %entry.message.id,
            operator = %self.operator,
            failover = ?target,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Send failed, retrying"
        );
        match target {
            Some(target) => self.inner.enqueue(&target, entry),
            None => {
                if let Some(counters) = self.counters() {
                    counters.enqueued();
                }
                self.waiting.push(Waiting(entry));
            }
        }
    }

    fn drop_expired(&mut self, entry: QueueEntry) {
        if let Some(counters) = self.counters() {
            counters.dequeued();
        }
        self.inner.finish(entry.message, MessageStatus::Expired);
    }

    fn sweep(&mut self) {
        let now = Utc::now();
        let (expired_ready, ready): (Vec<Ready>, Vec<Ready>) = std::mem::take(&mut self.ready)
            .into_vec()
            .into_iter()
            .partition(|r| r.0.message.is_expired_at(now));
        let (expired_waiting, waiting): (Vec<Waiting>, Vec<Waiting>) =
            std::mem::take(&mut self.waiting)
                .into_vec()
                .into_iter()
                .partition(|w| w.0.message.is_expired_at(now));
        self.ready = ready.into();
        self.waiting = waiting.into();

        let expired = expired_ready
            .into_iter()
            .map(|r| r.0)
            .chain(expired_waiting.into_iter().map(|w| w.0));
        for entry in expired {
            self.drop_expired(entry);
        }
        self.inner.expire_awaiting(&self.operator, now);
    }

    fn next_wake(&mut self, now: Instant) -> Option<Instant> {
        let retry = self.waiting.peek().map(|w| w.0.next_attempt);
        let token = if self.ready.is_empty() {
            None
        } else {
            self.bucket
                .as_mut()
                .and_then(|bucket| bucket.time_to_token(now))
                .map(|wait| now + wait)
        };
        match (retry, token) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Transport;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use smsc_core::{Address, OperatorRecord, TransportBinding};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(MessageId, MessageStatus)>>,
    }

    impl Recording {
        fn statuses(&self, id: &MessageId) -> Vec<MessageStatus> {
            self.seen
                .lock()
                .iter()
                .filter(|(m, _)| m == id)
                .map(|(_, s)| *s)
                .collect()
        }

        fn last(&self, id: &MessageId) -> Option<MessageStatus> {
            self.statuses(id).last().copied()
        }
    }

    impl StatusSink for Recording {
        fn on_status(&self, message: &Message) {
            self.seen.lock().push((message.id.clone(), message.status));
        }
    }

    /// Plays back scripted results, then repeats the last one
    struct Scripted {
        results: Mutex<VecDeque<Result<SubmitOutcome, TransportError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(results: Vec<Result<SubmitOutcome, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _message: &Message) -> Result<SubmitOutcome, TransportError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let mut results = self.results.lock();
            if results.len() > 1 {
                results.pop_front().unwrap_or(Err(TransportError::Timeout))
            } else {
                results.front().cloned().unwrap_or(Err(TransportError::Timeout))
            }
        }
    }

    fn operator(id: &str, max_tps: u32) -> OperatorRecord {
        OperatorRecord {
            id: OperatorId::new(id),
            name: id.to_string(),
            priority: 1,
            weight: 1,
            max_tps,
            status: OperatorStatus::Active,
            transport: TransportBinding::None,
        }
    }

    fn message() -> Message {
        Message::new(
            Address::international("15550001"),
            Address::international("15551234"),
            b"hello".to_vec(),
        )
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig {
            max_queue_depth: 100,
            max_retries: 3,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(50),
            rate_limit: true,
            burst: 0,
        }
    }

    struct Fixture {
        queue: DeliveryQueue,
        registry: Arc<OperatorRegistry>,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<Recording>,
    }

    fn fixture(config: DeliveryConfig, operators: &[(&str, u32)]) -> Fixture {
        let registry = Arc::new(
            OperatorRegistry::with_operators(
                10,
                operators.iter().map(|(id, tps)| operator(id, *tps)),
            )
            .unwrap(),
        );
        let dispatcher = Arc::new(Dispatcher::new());
        let sink = Arc::new(Recording::default());
        let queue = DeliveryQueue::new(config, registry.clone(), dispatcher.clone(), sink.clone());
        Fixture {
            queue,
            registry,
            dispatcher,
            sink,
        }
    }

    async fn settle(sink: &Recording, id: &MessageId, status: MessageStatus) {
        for _ in 0..2000 {
            if sink.last(id) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} never reached {:?}: {:?}", id, status, sink.statuses(id));
    }

    fn ok(remote: Option<&str>) -> Result<SubmitOutcome, TransportError> {
        Ok(SubmitOutcome {
            remote_id: remote.map(str::to_string),
            delivered: false,
        })
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = config();
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
        assert_eq!(config.backoff(10), Duration::from_secs(5));
        assert_eq!(config.backoff(64), Duration::from_secs(5));
    }

    #[test]
    fn test_ready_order_is_priority_then_fifo() {
        let entry = |priority, seq| {
            let mut message = message();
            message.priority = priority;
            Ready(QueueEntry {
                message,
                next_attempt: Instant::now(),
                attempt: 0,
                seq,
                candidates: Vec::new(),
            })
        };
        let mut heap = BinaryHeap::new();
        heap.push(entry(Priority::Normal, 1));
        heap.push(entry(Priority::Urgent, 3));
        heap.push(entry(Priority::Normal, 0));
        heap.push(entry(Priority::Low, 2));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|r| r.0.seq)).collect();
        assert_eq!(order, vec![3, 0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sent_without_receipt_leaves_queue() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        f.dispatcher.bind(a.clone(), Scripted::new(vec![ok(Some("r1"))]));

        let id = f.queue.submit(message(), vec![a.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Sent).await;

        assert_eq!(f.sink.statuses(&id), vec![MessageStatus::Pending, MessageStatus::Sent]);
        assert!(f.queue.message(&id).is_none());
        assert_eq!(f.queue.queue_size(&a), Some(0));
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_completes_message() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        f.dispatcher.bind(a.clone(), Scripted::new(vec![ok(Some("r1"))]));

        let mut msg = message();
        msg.registered_delivery = 1;
        let id = f.queue.submit(msg, vec![a.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Sent).await;
        assert_eq!(f.queue.stats().awaiting_receipt, 1);

        assert!(!f.queue.on_receipt(&a, "other", true));
        assert!(f.queue.on_receipt(&a, "r1", true));
        assert_eq!(f.sink.last(&id), Some(MessageStatus::Delivered));
        assert!(!f.queue.on_receipt(&a, "r1", true));
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_exhausted() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        let transport = Scripted::new(vec![Err(TransportError::Timeout)]);
        f.dispatcher.bind(a.clone(), transport.clone());

        let id = f.queue.submit(message(), vec![a.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Failed).await;

        assert_eq!(transport.calls(), 3);
        assert_eq!(f.queue.stats().retried, 2);
        assert_eq!(f.queue.stats().failed, 1);
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        let transport = Scripted::new(vec![Err(TransportError::Rejected(0x45))]);
        f.dispatcher.bind(a.clone(), transport.clone());

        let id = f.queue.submit(message(), vec![a.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Failed).await;
        assert_eq!(transport.calls(), 1);
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_fails_over_to_next_candidate() {
        let f = fixture(config(), &[("a", 10), ("b", 10)]);
        let (a, b) = (OperatorId::new("a"), OperatorId::new("b"));
        f.dispatcher.bind(
            a.clone(),
            Scripted::new(vec![Err(TransportError::ConnectionLost)]),
        );
        let backup = Scripted::new(vec![ok(None)]);
        f.dispatcher.bind(b.clone(), backup.clone());

        let id = f.queue.submit(message(), vec![a.clone(), b.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Sent).await;
        assert_eq!(backup.calls(), 1);
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_lane_applies_backpressure() {
        let mut config = config();
        config.max_queue_depth = 1;
        let f = fixture(config, &[("a", 10)]);
        let a = OperatorId::new("a");

        f.queue.submit(message(), vec![a.clone()]).unwrap();
        let err = f.queue.submit(message(), vec![a.clone()]).unwrap_err();
        assert!(matches!(err, QueueError::Backpressure { depth: 1, .. }));
        assert_eq!(f.queue.submit(message(), Vec::new()), Err(QueueError::NoCandidates));
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_message_waits_until_due() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        let transport = Scripted::new(vec![ok(None)]);
        f.dispatcher.bind(a.clone(), transport.clone());

        let mut msg = message();
        msg.scheduled_at = Some(Utc::now() + ChronoDuration::seconds(60));
        let id = f.queue.submit(msg, vec![a.clone()]).unwrap();
        assert_eq!(f.queue.message(&id).map(|m| m.status), Some(MessageStatus::Scheduled));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls(), 0);

        settle(&f.sink, &id, MessageStatus::Sent).await;
        assert_eq!(
            f.sink.statuses(&id),
            vec![MessageStatus::Scheduled, MessageStatus::Pending, MessageStatus::Sent]
        );
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_submission_is_never_sent() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        let transport = Scripted::new(vec![ok(None)]);
        f.dispatcher.bind(a.clone(), transport.clone());

        let mut msg = message();
        msg.validity_secs = 60;
        msg.created_at = Utc::now() - ChronoDuration::seconds(120);
        let id = f.queue.submit(msg, vec![a.clone()]).unwrap();

        assert_eq!(f.sink.last(&id), Some(MessageStatus::Expired));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.calls(), 0);
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_operator_moves_work() {
        let f = fixture(config(), &[("a", 10), ("b", 10)]);
        let (a, b) = (OperatorId::new("a"), OperatorId::new("b"));
        let primary = Scripted::new(vec![ok(None)]);
        f.dispatcher.bind(a.clone(), primary.clone());
        f.dispatcher.bind(b.clone(), Scripted::new(vec![ok(None)]));
        f.registry.set_status(&a, OperatorStatus::Disabled).unwrap();

        let id = f.queue.submit(message(), vec![a.clone(), b.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Sent).await;
        assert_eq!(primary.calls(), 0);
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_never_exceeds_rate_in_a_second() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        let transport = Scripted::new(vec![ok(None)]);
        f.dispatcher.bind(a.clone(), transport.clone());

        for _ in 0..50 {
            f.queue.submit(message(), vec![a.clone()]).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(transport.calls(), 10);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(transport.calls(), 20);
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_overdue_past_validity_expires() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        f.dispatcher.bind(a.clone(), Scripted::new(vec![ok(Some("r1"))]));

        let mut msg = message();
        msg.registered_delivery = 1;
        msg.validity_secs = 1;
        let id = f.queue.submit(msg, vec![a.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Sent).await;
        assert_eq!(f.queue.stats().awaiting_receipt, 1);

        // Validity is wall-clock
        std::thread::sleep(Duration::from_millis(1100));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(f.sink.last(&id), Some(MessageStatus::Expired));
        let stats = f.queue.stats();
        assert_eq!(stats.awaiting_receipt, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.expired, 1);
        assert!(f.queue.message(&id).is_none());

        assert!(!f.queue.on_receipt(&a, "r1", true));
        assert_eq!(f.sink.last(&id), Some(MessageStatus::Expired));
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    fn not_active(remote: &str) -> Result<SubmitOutcome, TransportError> {
        Err(smsc_sigtran::SigtranError::NotActive(remote.to_string()).into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_link_fails_over_to_next_candidate() {
        let f = fixture(config(), &[("a", 10), ("b", 10)]);
        let (a, b) = (OperatorId::new("a"), OperatorId::new("b"));
        let primary = Scripted::new(vec![not_active("msc-a")]);
        f.dispatcher.bind(a.clone(), primary.clone());
        let backup = Scripted::new(vec![ok(None)]);
        f.dispatcher.bind(b.clone(), backup.clone());

        let id = f.queue.submit(message(), vec![a.clone(), b.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Sent).await;
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 1);
        assert_eq!(f.queue.stats().retried, 1);
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_link_is_retried_when_alone() {
        let f = fixture(config(), &[("a", 10)]);
        let a = OperatorId::new("a");
        let transport = Scripted::new(vec![not_active("msc-a"), ok(None)]);
        f.dispatcher.bind(a.clone(), transport.clone());

        let id = f.queue.submit(message(), vec![a.clone()]).unwrap();
        settle(&f.sink, &id, MessageStatus::Sent).await;
        assert_eq!(transport.calls(), 2);
        assert!(f
            .sink
            .statuses(&id)
            .iter()
            .all(|status| *status != MessageStatus::Failed));
        f.queue.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_metrics_export_names_every_counter() {
        let f = fixture(config(), &[("a", 10)]);
        f.queue.reject(message(), "no route");
        let mut out = Exposition::new();
        f.queue.export_metrics(&mut out);
        let text = out.finish();
        assert!(text.contains("queue_rejected_total 1\n"));
        assert!(text.contains("# TYPE queue_dispatch_latency_ms summary\n"));
        assert!(text.contains("queue_operator_queued{operator=\"a\"} 0\n"));
    }

    #[test]
    fn test_reject_reports_reason() {
        let f = fixture(config(), &[("a", 10)]);
        let msg = message();
        let id = msg.id.clone();
        f.queue.reject(msg, "no route");
        assert_eq!(f.sink.statuses(&id), vec![MessageStatus::Rejected]);
        assert_eq!(f.queue.stats().rejected, 1);
    }
}
