//! Transport metrics for observability
//!
//! Counters updated by the connection actor, readable from any thread
//! through a [`Transport`](crate::Transport) handle. Aggregates are atomics;
//! per-kind sizes and the recent-activity window sit behind mutexes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::queue::DrainReport;

/// How far back the recent-activity figures look.
pub const RECENT_WINDOW: Duration = Duration::from_secs(60);

/// Size statistics for one message kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeStats {
    pub count: u64,
    pub total_bytes: u64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub average_bytes: u64,
}

impl SizeStats {
    fn record(&mut self, bytes: u64) {
        self.min_bytes = if self.count == 0 {
            bytes
        } else {
            self.min_bytes.min(bytes)
        };
        self.max_bytes = self.max_bytes.max(bytes);
        self.count += 1;
        self.total_bytes += bytes;
        self.average_bytes = self.total_bytes / self.count;
    }
}

#[derive(Debug, Default)]
struct KindTable {
    sent: BTreeMap<String, SizeStats>,
    received: BTreeMap<String, SizeStats>,
}

/// Timestamps of frames and errors inside [`RECENT_WINDOW`].
#[derive(Debug, Default)]
struct RecentLog {
    frames: VecDeque<tokio::time::Instant>,
    errors: VecDeque<tokio::time::Instant>,
}

impl RecentLog {
    fn prune(&mut self, now: tokio::time::Instant) {
        for log in [&mut self.frames, &mut self.errors] {
            while log.front().is_some_and(|&at| now.duration_since(at) >= RECENT_WINDOW) {
                log.pop_front();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct TransportMetrics {
    // Connection metrics
    /// Sockets that reached the open state
    pub connections_opened: AtomicU64,
    /// Sockets that failed before or after opening
    pub connection_failures: AtomicU64,
    /// Reconnection attempts fired by the backoff timer
    pub reconnect_attempts: AtomicU64,
    /// Cumulative time from connect to open, in milliseconds
    connect_time_ms: AtomicU64,

    // Frame metrics
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub protocol_errors: AtomicU64,

    // Delivery metrics
    pub messages_delivered: AtomicU64,
    pub messages_acknowledged: AtomicU64,
    pub messages_expired: AtomicU64,
    pub messages_failed: AtomicU64,
    pub send_retries: AtomicU64,

    // Liveness metrics
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_received: AtomicU64,
    pub heartbeats_missed: AtomicU64,

    // Error events emitted to subscribers
    pub errors_emitted: AtomicU64,

    kinds: Mutex<KindTable>,
    recent: Mutex<RecentLog>,
    start_time: Option<Instant>,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self, connect_time_ms: u64) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.connect_time_ms
            .fetch_add(connect_time_ms, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// One frame of type `kind` went out. Batches count under `batch`.
    pub fn frame_sent(&self, kind: &str, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        record_kind(&mut lock(&self.kinds).sent, kind, bytes);
        self.note_frame();
    }

    /// A raw frame arrived, decodable or not.
    pub fn frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.note_frame();
    }

    /// A received frame decoded to an envelope of type `kind`.
    pub fn message_received(&self, kind: &str, bytes: usize) {
        record_kind(&mut lock(&self.kinds).received, kind, bytes);
    }

    pub fn error_emitted(&self) {
        self.errors_emitted.fetch_add(1, Ordering::Relaxed);
        let now = tokio::time::Instant::now();
        let mut recent = lock(&self.recent);
        recent.errors.push_back(now);
        recent.prune(now);
    }

    fn note_frame(&self) {
        let now = tokio::time::Instant::now();
        let mut recent = lock(&self.recent);
        recent.frames.push_back(now);
        recent.prune(now);
    }

    fn recent_activity(&self) -> RecentActivity {
        let mut recent = lock(&self.recent);
        recent.prune(tokio::time::Instant::now());
        RecentActivity {
            window_secs: RECENT_WINDOW.as_secs(),
            frames: recent.frames.len() as u64,
            errors: recent.errors.len() as u64,
        }
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acknowledged(&self) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_missed(&self) {
        self.heartbeats_missed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold one queue pass into the delivery counters.
    pub fn record_drain(&self, report: &DrainReport) {
        self.messages_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.messages_expired
            .fetch_add(report.expired as u64, Ordering::Relaxed);
        self.messages_failed.fetch_add(
            (report.failed + report.ack_timeouts) as u64,
            Ordering::Relaxed,
        );
        self.send_retries
            .fetch_add(report.retried as u64, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let kinds = {
            let table = lock(&self.kinds);
            KindMetrics {
                sent: table.sent.clone(),
                received: table.received.clone(),
            }
        };
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let connect_time = self.connect_time_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                opened,
                failures: self.connection_failures.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                average_connect_ms: connect_time.checked_div(opened).unwrap_or(0),
            },
            frames: FrameMetrics {
                sent: self.frames_sent.load(Ordering::Relaxed),
                received: self.frames_received.load(Ordering::Relaxed),
                bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
                bytes_received: self.bytes_received.load(Ordering::Relaxed),
                protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            },
            delivery: DeliveryMetrics {
                delivered: self.messages_delivered.load(Ordering::Relaxed),
                acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
                expired: self.messages_expired.load(Ordering::Relaxed),
                failed: self.messages_failed.load(Ordering::Relaxed),
                retries: self.send_retries.load(Ordering::Relaxed),
            },
            heartbeats: HeartbeatMetrics {
                sent: self.heartbeats_sent.load(Ordering::Relaxed),
                received: self.heartbeats_received.load(Ordering::Relaxed),
                missed: self.heartbeats_missed.load(Ordering::Relaxed),
            },
            errors_emitted: self.errors_emitted.load(Ordering::Relaxed),
            kinds,
            recent: self.recent_activity(),
        }
    }
}

fn record_kind(table: &mut BTreeMap<String, SizeStats>, kind: &str, bytes: usize) {
    table.entry(kind.to_string()).or_default().record(bytes as u64);
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub frames: FrameMetrics,
    pub delivery: DeliveryMetrics,
    pub heartbeats: HeartbeatMetrics,
    pub errors_emitted: u64,
    pub kinds: KindMetrics,
    pub recent: RecentActivity,
}

/// Frame sizes keyed by envelope type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindMetrics {
    pub sent: BTreeMap<String, SizeStats>,
    pub received: BTreeMap<String, SizeStats>,
}

/// Frames (both directions) and error events seen in the last `window_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentActivity {
    pub window_secs: u64,
    pub frames: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub opened: u64,
    pub failures: u64,
    pub reconnect_attempts: u64,
    pub average_connect_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub sent: u64,
    pub received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetrics {
    pub delivered: u64,
    pub acknowledged: u64,
    pub expired: u64,
    pub failed: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub sent: u64,
    pub received: u64,
    pub missed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = TransportMetrics::new();
        metrics.connection_opened(40);
        metrics.connection_opened(20);
        metrics.connection_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.opened, 2);
        assert_eq!(snapshot.connections.failures, 1);
        assert_eq!(snapshot.connections.average_connect_ms, 30);
    }

    #[test]
    fn test_average_without_connections() {
        let metrics = TransportMetrics::new();
        assert_eq!(metrics.snapshot().connections.average_connect_ms, 0);
    }

    #[test]
    fn test_frame_tracking() {
        let metrics = TransportMetrics::new();
        metrics.frame_sent("chat", 10);
        metrics.frame_sent("chat", 5);
        metrics.frame_received(7);

        let frames = metrics.snapshot().frames;
        assert_eq!(frames.sent, 2);
        assert_eq!(frames.bytes_sent, 15);
        assert_eq!(frames.received, 1);
        assert_eq!(frames.bytes_received, 7);
    }

    #[test]
    fn test_record_drain() {
        let metrics = TransportMetrics::new();
        metrics.record_drain(&DrainReport {
            delivered: 3,
            expired: 1,
            failed: 1,
            ack_timeouts: 1,
            retried: 2,
            ..Default::default()
        });

        let delivery = metrics.snapshot().delivery;
        assert_eq!(delivery.delivered, 3);
        assert_eq!(delivery.expired, 1);
        assert_eq!(delivery.failed, 2);
        assert_eq!(delivery.retries, 2);
    }

    #[test]
    fn test_sizes_by_kind() {
        let metrics = TransportMetrics::new();
        metrics.frame_sent("chat", 40);
        metrics.frame_sent("chat", 10);
        metrics.frame_sent("heartbeat", 30);
        metrics.message_received("chat", 25);

        let kinds = metrics.snapshot().kinds;
        assert_eq!(
            kinds.sent["chat"],
            SizeStats {
                count: 2,
                total_bytes: 50,
                min_bytes: 10,
                max_bytes: 40,
                average_bytes: 25,
            }
        );
        assert_eq!(kinds.sent["heartbeat"].count, 1);
        assert_eq!(kinds.received["chat"].min_bytes, 25);
        assert!(!kinds.received.contains_key("heartbeat"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_activity_window() {
        let metrics = TransportMetrics::new();
        metrics.frame_sent("chat", 10);
        metrics.error_emitted();
        tokio::time::advance(Duration::from_secs(30)).await;
        metrics.frame_received(10);

        let recent = metrics.snapshot().recent;
        assert_eq!(recent.window_secs, 60);
        assert_eq!((recent.frames, recent.errors), (2, 1));

        tokio::time::advance(Duration::from_secs(31)).await;
        let recent = metrics.snapshot().recent;
        assert_eq!((recent.frames, recent.errors), (1, 0));
        assert_eq!(metrics.snapshot().errors_emitted, 1);
    }
}
