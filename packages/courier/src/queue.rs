//! Outbound queue: priority, TTL, batching, retry and acknowledgment.
//!
//! The queue never touches a socket. `drain` is handed a [`RawSend`] and the
//! current instant; everything else is bookkeeping. Every accepted message
//! ends in exactly one of: sent, acknowledged, expired, retries exhausted,
//! ack timeout, or transport closed. The delivery callback fires exactly once
//! with that outcome.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DeliveryError, SocketError};
use crate::protocol::Envelope;

/// Unique id assigned at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Drain order: every `High` message goes before any `Normal`, and so on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    fn tier(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    AwaitingAck,
    Failed,
    Expired,
}

/// Coalescing window for batchable messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub max_size: usize,
    pub timeout: Duration,
}

impl Default for BatchWindow {
    fn default() -> Self {
        Self {
            max_size: 10,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub id: MessageId,
    /// `true` when the peer explicitly acknowledged the message.
    pub acknowledged: bool,
}

pub type DeliveryResult = Result<Delivered, DeliveryError>;
pub type DeliveryCallback = Box<dyn FnOnce(DeliveryResult) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Batching {
    #[default]
    Inherit,
    Disabled,
    Window(BatchWindow),
}

/// Per-message delivery options.
#[derive(Default)]
pub struct EnqueueOptions {
    priority: Priority,
    ttl: Option<Duration>,
    max_retries: Option<u32>,
    require_ack: bool,
    batching: Batching,
    callback: Option<DeliveryCallback>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Drop the message if it has not been delivered `ttl` after enqueue.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Override the queue's retry ceiling for this message.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Hold the message after sending until the peer acknowledges it.
    /// Acknowledged messages are never batched.
    pub fn require_ack(mut self) -> Self {
        self.require_ack = true;
        self
    }

    pub fn batch(mut self, window: BatchWindow) -> Self {
        self.batching = Batching::Window(window);
        self
    }

    /// Never coalesce this message, even if the queue batches by default.
    pub fn unbatched(mut self) -> Self {
        self.batching = Batching::Disabled;
        self
    }

    pub fn on_delivery(mut self, callback: impl FnOnce(DeliveryResult) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Like [`on_delivery`](Self::on_delivery), but hands the outcome to a
    /// oneshot receiver instead.
    pub fn with_receipt(self) -> (Self, oneshot::Receiver<DeliveryResult>) {
        let (tx, rx) = oneshot::channel();
        let options = self.on_delivery(move |result| {
            let _ = tx.send(result);
        });
        (options, rx)
    }
}

impl From<Priority> for EnqueueOptions {
    fn from(priority: Priority) -> Self {
        Self::new().priority(priority)
    }
}

impl fmt::Debug for EnqueueOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueOptions")
            .field("priority", &self.priority)
            .field("ttl", &self.ttl)
            .field("max_retries", &self.max_retries)
            .field("require_ack", &self.require_ack)
            .field("batching", &self.batching)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Queue-wide defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub ack_timeout: Duration,
    /// Default batch window; `None` sends messages individually.
    pub batch: Option<BatchWindow>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_millis(1000),
            ack_timeout: Duration::from_millis(30_000),
            batch: None,
        }
    }
}

/// The one capability the queue needs from the outside world.
pub trait RawSend {
    /// Put one frame on the wire. `ack_id` is set when the peer is expected
    /// to acknowledge it.
    fn raw_send(&mut self, envelope: &Envelope, ack_id: Option<&MessageId>)
    -> Result<(), SocketError>;
}

impl<F> RawSend for F
where
    F: FnMut(&Envelope, Option<&MessageId>) -> Result<(), SocketError>,
{
    fn raw_send(
        &mut self,
        envelope: &Envelope,
        ack_id: Option<&MessageId>,
    ) -> Result<(), SocketError> {
        self(envelope, ack_id)
    }
}

/// What one `drain` (or `sweep`) did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Raw sends attempted.
    pub frames: usize,
    /// Of which batches.
    pub batches: usize,
    pub delivered: usize,
    pub awaiting_ack: usize,
    pub retried: usize,
    pub failed: usize,
    pub expired: usize,
    pub ack_timeouts: usize,
    /// The pass stopped early because a raw send failed.
    pub send_failed: bool,
}

/// Live and lifetime counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub pending: usize,
    pub awaiting_ack: usize,
    pub sent: u64,
    pub acknowledged: u64,
    pub expired: u64,
    pub failed: u64,
    pub retries: u64,
}

struct Entry {
    id: MessageId,
    envelope: Envelope,
    priority: Priority,
    enqueued_at: Instant,
    seq: u64,
    ttl: Option<Duration>,
    max_retries: u32,
    retries: u32,
    status: MessageStatus,
    next_attempt_at: Instant,
    require_ack: bool,
    ack_deadline: Option<Instant>,
    batch: Option<BatchWindow>,
    callback: Option<DeliveryCallback>,
}

impl Entry {
    fn expires_at(&self) -> Option<Instant> {
        self.ttl.map(|ttl| self.enqueued_at + ttl)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    fn is_eligible(&self, now: Instant) -> bool {
        self.status == MessageStatus::Pending && self.next_attempt_at <= now
    }

    fn finish(mut self, status: MessageStatus, result: DeliveryResult) {
        self.status = status;
        if let Err(e) = &result {
            debug!(id = %self.id, status = ?status, error = %e, "message finished undelivered");
        }
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

enum Frame {
    Single(u64),
    Batch(Vec<u64>),
}

impl Frame {
    /// Sequence number of the oldest message in the frame.
    fn first(&self) -> u64 {
        match self {
            Self::Single(seq) => *seq,
            Self::Batch(seqs) => seqs.first().copied().unwrap_or(u64::MAX),
        }
    }
}

#[derive(Default)]
struct Totals {
    sent: u64,
    acknowledged: u64,
    expired: u64,
    failed: u64,
    retries: u64,
}

pub struct OutboundQueue {
    config: QueueConfig,
    tiers: [Vec<Entry>; 3],
    awaiting: Vec<Entry>,
    next_seq: u64,
    totals: Totals,
}

impl OutboundQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            tiers: Default::default(),
            awaiting: Vec::new(),
            next_seq: 0,
            totals: Totals::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn enqueue(&mut self, envelope: Envelope, options: EnqueueOptions, now: Instant) -> MessageId {
        let id = MessageId::new();
        self.enqueue_with_id(id.clone(), envelope, options, now);
        id
    }

    /// Accept a message under a caller-chosen id. Never fails.
    pub fn enqueue_with_id(
        &mut self,
        id: MessageId,
        envelope: Envelope,
        options: EnqueueOptions,
        now: Instant,
    ) {
        let batch = if options.require_ack || envelope.is_batch() {
            None
        } else {
            match options.batching {
                Batching::Inherit => self.config.batch,
                Batching::Disabled => None,
                Batching::Window(window) => Some(window),
            }
        };

        debug!(
            id = %id,
            kind = envelope.kind(),
            priority = ?options.priority,
            "message enqueued"
        );

        let seq = self.next_seq;
        self.next_seq += 1;
        self.tiers[options.priority.tier()].push(Entry {
            id,
            envelope,
            priority: options.priority,
            enqueued_at: now,
            seq,
            ttl: options.ttl,
            max_retries: options.max_retries.unwrap_or(self.config.max_retries),
            retries: 0,
            status: MessageStatus::Pending,
            next_attempt_at: now,
            require_ack: options.require_ack,
            ack_deadline: None,
            batch,
            callback: options.callback,
        });
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum::<usize>() + self.awaiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status_of(&self, id: &MessageId) -> Option<MessageStatus> {
        self.tiers
            .iter()
            .flatten()
            .chain(self.awaiting.iter())
            .find(|e| &e.id == id)
            .map(|e| e.status)
    }

    /// Expire messages past their TTL and fail acknowledgments past their
    /// deadline. Safe to call while disconnected.
    pub fn sweep(&mut self, now: Instant) -> DrainReport {
        let mut report = DrainReport::default();

        for tier in &mut self.tiers {
            for entry in take_where(tier, |e| e.is_expired(now)) {
                let ttl = entry.ttl.unwrap_or_default();
                entry.finish(MessageStatus::Expired, Err(DeliveryError::Expired { ttl }));
                report.expired += 1;
            }
        }

        // Expiry wins over an outstanding acknowledgment.
        for entry in take_where(&mut self.awaiting, |e| e.is_expired(now)) {
            let ttl = entry.ttl.unwrap_or_default();
            entry.finish(MessageStatus::Expired, Err(DeliveryError::Expired { ttl }));
            report.expired += 1;
        }

        let after = self.config.ack_timeout;
        for entry in take_where(&mut self.awaiting, |e| {
            e.ack_deadline.is_some_and(|d| now >= d)
        }) {
            warn!(id = %entry.id, "acknowledgment timed out");
            entry.finish(MessageStatus::Failed, Err(DeliveryError::AckTimeout { after }));
            report.ack_timeouts += 1;
        }

        self.totals.expired += report.expired as u64;
        self.totals.failed += report.ack_timeouts as u64;
        report
    }

    /// Sweep, then send everything that is due, highest tier first.
    ///
    /// A failed raw send ends the pass; the remaining messages wait for the
    /// next drain.
    pub fn drain(&mut self, now: Instant, sender: &mut impl RawSend) -> DrainReport {
        let mut report = self.sweep(now);

        for tier in 0..self.tiers.len() {
            for frame in self.plan(tier, now) {
                if !self.send_frame(tier, frame, now, sender, &mut report) {
                    report.send_failed = true;
                    return report;
                }
            }
        }
        report
    }

    /// Decide which frames tier `tier` produces at `now`, oldest first.
    ///
    /// A group whose window has elapsed is closed as soon as an unbatched
    /// message follows it, so it cannot be overtaken. A group still inside
    /// its window keeps collecting and is only sent once full.
    fn plan(&self, tier: usize, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut group: Vec<u64> = Vec::new();
        let mut window: Option<BatchWindow> = None;
        let mut oldest: Option<Instant> = None;

        let group_due = |window: Option<BatchWindow>, oldest: Option<Instant>| {
            matches!((window, oldest), (Some(w), Some(o)) if o + w.timeout <= now)
        };

        for entry in self.tiers[tier].iter().filter(|e| e.is_eligible(now)) {
            let Some(entry_window) = entry.batch else {
                if !group.is_empty() && group_due(window, oldest) {
                    frames.push(Frame::Batch(std::mem::take(&mut group)));
                    oldest = None;
                }
                frames.push(Frame::Single(entry.seq));
                continue;
            };
            let limit = window.get_or_insert(entry_window).max_size.max(1);
            oldest.get_or_insert(entry.enqueued_at);
            group.push(entry.seq);
            if group.len() >= limit {
                frames.push(Frame::Batch(std::mem::take(&mut group)));
                oldest = None;
            }
        }

        if !group.is_empty() && group_due(window, oldest) {
            frames.push(Frame::Batch(group));
        }
        // A group that filled up late still goes out in its oldest member's place.
        frames.sort_by_key(Frame::first);
        frames
    }

    fn send_frame(
        &mut self,
        tier: usize,
        frame: Frame,
        now: Instant,
        sender: &mut impl RawSend,
        report: &mut DrainReport,
    ) -> bool {
        let (seqs, is_batch) = match frame {
            Frame::Single(seq) => (vec![seq], false),
            Frame::Batch(seqs) => (seqs, true),
        };

        let entries = &mut self.tiers[tier];
        let mut members = Vec::with_capacity(seqs.len());
        for entry in entries.iter_mut().filter(|e| seqs.contains(&e.seq)) {
            entry.status = MessageStatus::Processing;
            members.push(entry.envelope.clone());
        }

        let result = if is_batch {
            let batch = Envelope::batch(members);
            sender.raw_send(&batch, None)
        } else {
            let entry = entries.iter().find(|e| e.seq == seqs[0]);
            let ack_id = entry.filter(|e| e.require_ack).map(|e| &e.id);
            match members.first() {
                Some(envelope) => sender.raw_send(envelope, ack_id),
                None => return true,
            }
        };

        report.frames += 1;
        if is_batch {
            report.batches += 1;
        }

        match result {
            Ok(()) => {
                for mut entry in take_where(entries, |e| seqs.contains(&e.seq)) {
                    if entry.require_ack {
                        entry.status = MessageStatus::AwaitingAck;
                        entry.ack_deadline = Some(now + self.config.ack_timeout);
                        debug!(id = %entry.id, "message sent, awaiting acknowledgment");
                        self.awaiting.push(entry);
                        report.awaiting_ack += 1;
                    } else {
                        let id = entry.id.clone();
                        entry.finish(
                            MessageStatus::Sent,
                            Ok(Delivered {
                                id,
                                acknowledged: false,
                            }),
                        );
                        report.delivered += 1;
                        self.totals.sent += 1;
                    }
                }
                true
            }
            Err(e) => {
                warn!(error = %e, messages = seqs.len(), "raw send failed");
                let exhausted = take_where(entries, |entry| {
                    seqs.contains(&entry.seq) && entry.retries >= entry.max_retries
                });
                // Failed messages re-enter pending in place, keeping FIFO position.
                let mut retried = 0;
                for entry in entries.iter_mut().filter(|entry| seqs.contains(&entry.seq)) {
                    entry.retries += 1;
                    entry.next_attempt_at = now + self.config.retry_interval;
                    entry.status = MessageStatus::Pending;
                    retried += 1;
                }
                let failed = exhausted.len();
                for entry in exhausted {
                    let attempts = entry.retries + 1;
                    entry.finish(
                        MessageStatus::Failed,
                        Err(DeliveryError::RetriesExhausted { attempts }),
                    );
                }
                report.retried += retried;
                report.failed += failed;
                self.totals.retries += retried as u64;
                self.totals.failed += failed as u64;
                false
            }
        }
    }

    /// Drop a message that has not been sent yet without settling it. Its
    /// delivery callback is never invoked, so this is only for messages the
    /// transport enqueued for itself. Returns `false` once the message has
    /// left the pending tiers.
    pub(crate) fn withdraw(&mut self, id: &MessageId) -> bool {
        for tier in &mut self.tiers {
            if let Some(pos) = tier
                .iter()
                .position(|e| &e.id == id && e.status == MessageStatus::Pending)
            {
                tier.remove(pos);
                return true;
            }
        }
        false
    }

    /// Resolve an outstanding acknowledgment. Returns `false` if `id` is not
    /// awaiting one.
    pub fn acknowledge(&mut self, id: &MessageId) -> bool {
        let Some(pos) = self.awaiting.iter().position(|e| &e.id == id) else {
            debug!(id = %id, "acknowledgment for unknown message");
            return false;
        };
        let entry = self.awaiting.remove(pos);
        let id = entry.id.clone();
        entry.finish(
            MessageStatus::Sent,
            Ok(Delivered {
                id,
                acknowledged: true,
            }),
        );
        self.totals.acknowledged += 1;
        true
    }

    /// The earliest future instant at which the queue has work: a TTL or ack
    /// deadline, plus retry and batch-flush times when `sending`.
    pub fn next_deadline(&self, now: Instant, sending: bool) -> Option<Instant> {
        let pending = self.tiers.iter().flatten();
        let expiries = pending
            .clone()
            .chain(self.awaiting.iter())
            .filter_map(Entry::expires_at);
        let acks = self.awaiting.iter().filter_map(|e| e.ack_deadline);

        let sends = pending
            .filter(|_| sending)
            .filter(|e| e.status == MessageStatus::Pending)
            .map(|e| match e.batch {
                Some(window) if e.retries == 0 => e.enqueued_at + window.timeout,
                _ => e.next_attempt_at,
            });

        expiries.chain(acks).chain(sends).filter(|&at| at > now).min()
    }

    /// The earliest future TTL expiry, ignoring ack and send deadlines.
    pub fn next_expiry(&self, now: Instant) -> Option<Instant> {
        self.tiers
            .iter()
            .flatten()
            .chain(self.awaiting.iter())
            .filter_map(Entry::expires_at)
            .filter(|&at| at > now)
            .min()
    }

    /// Fail every remaining message. Used when the transport shuts down.
    pub fn fail_all(&mut self, error: DeliveryError) -> usize {
        let mut count = 0;
        let tiers = self.tiers.iter_mut().map(std::mem::take);
        let drained: Vec<Entry> = tiers
            .flatten()
            .chain(std::mem::take(&mut self.awaiting))
            .collect();
        for entry in drained {
            entry.finish(MessageStatus::Failed, Err(error.clone()));
            count += 1;
        }
        self.totals.failed += count as u64;
        count
    }

    pub fn stats(&self) -> QueueStats {
        let live = || self.tiers.iter().flatten().chain(self.awaiting.iter());
        let by_priority = |p: Priority| live().filter(|e| e.priority == p).count();
        QueueStats {
            total: self.len(),
            high: by_priority(Priority::High),
            normal: by_priority(Priority::Normal),
            low: by_priority(Priority::Low),
            pending: live()
                .filter(|e| e.status == MessageStatus::Pending)
                .count(),
            awaiting_ack: self.awaiting.len(),
            sent: self.totals.sent,
            acknowledged: self.totals.acknowledged,
            expired: self.totals.expired,
            failed: self.totals.failed,
            retries: self.totals.retries,
        }
    }
}

fn take_where(entries: &mut Vec<Entry>, mut pred: impl FnMut(&Entry) -> bool) -> Vec<Entry> {
    let mut taken = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        if pred(&entries[i]) {
            taken.push(entries.remove(i));
        } else {
            i += 1;
        }
    }
    taken
}
