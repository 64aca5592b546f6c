use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use courier::dispatch::{Category, EventDispatcher, Handler};
use courier::protocol::{ChatData, Envelope};
use courier::queue::{EnqueueOptions, MessageId, OutboundQueue, Priority, QueueConfig};
use courier::{DeliveryError, ReconnectPolicy, SocketError};

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

fn rank(priority: Priority) -> u8 {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

fn chat(n: usize) -> Envelope {
    Envelope::chat(n.to_string(), "general", "hello")
}

// --- Outbound queue ---

proptest! {
    #[test]
    fn drain_sends_by_tier_then_fifo(priorities in prop::collection::vec(arb_priority(), 0..40)) {
        let now = Instant::now();
        let mut queue = OutboundQueue::new(QueueConfig::default());
        for (n, &priority) in priorities.iter().enumerate() {
            queue.enqueue(chat(n), EnqueueOptions::new().priority(priority), now);
        }

        let mut sent = Vec::new();
        let mut sender = |envelope: &Envelope, _: Option<&MessageId>| {
            if let Envelope::Chat(ChatData { message_id, .. }) = envelope {
                sent.push(message_id.parse::<usize>().unwrap());
            }
            Ok::<(), SocketError>(())
        };
        let report = queue.drain(now, &mut sender);

        let mut expected: Vec<usize> = (0..priorities.len()).collect();
        expected.sort_by_key(|&n| (rank(priorities[n]), n));
        prop_assert_eq!(sent, expected);
        prop_assert_eq!(report.delivered, priorities.len());
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn ttl_expiry_fires_exactly_once(
        ttls in prop::collection::vec(1u64..5_000, 1..20),
        sweeps in prop::collection::vec(0u64..10_000, 1..30),
    ) {
        let t0 = Instant::now();
        let mut queue = OutboundQueue::new(QueueConfig::default());
        let expired = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        for (n, &ttl) in ttls.iter().enumerate() {
            let expired = expired.clone();
            let other = other.clone();
            let options = EnqueueOptions::new()
                .ttl(Duration::from_millis(ttl))
                .on_delivery(move |result| match result {
                    Err(DeliveryError::Expired { .. }) => {
                        expired.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {
                        other.fetch_add(1, Ordering::SeqCst);
                    }
                });
            queue.enqueue(chat(n), options, t0);
        }

        let mut sweeps = sweeps;
        sweeps.sort_unstable();
        for &at in &sweeps {
            queue.sweep(t0 + Duration::from_millis(at));
        }

        let last = sweeps.last().copied().unwrap_or(0);
        let due = ttls.iter().filter(|&&ttl| ttl <= last).count();
        prop_assert_eq!(expired.load(Ordering::SeqCst), due);
        prop_assert_eq!(other.load(Ordering::SeqCst), 0);
        prop_assert_eq!(queue.len(), ttls.len() - due);

        // Sweeping again at the same instant changes nothing.
        queue.sweep(t0 + Duration::from_millis(last));
        prop_assert_eq!(expired.load(Ordering::SeqCst), due);
    }

    #[test]
    fn failed_sends_stop_after_ceiling(max_retries in 0u32..6) {
        let t0 = Instant::now();
        let config = QueueConfig { max_retries, ..QueueConfig::default() };
        let retry_interval = config.retry_interval;
        let mut queue = OutboundQueue::new(config);
        let attempts_seen = Arc::new(AtomicUsize::new(0));
        let seen = attempts_seen.clone();
        let options = EnqueueOptions::new().on_delivery(move |result| {
            if let Err(DeliveryError::RetriesExhausted { attempts }) = result {
                seen.store(attempts as usize, Ordering::SeqCst);
            }
        });
        queue.enqueue(chat(0), options, t0);

        let mut tries = 0;
        let mut sender = |_: &Envelope, _: Option<&MessageId>| {
            tries += 1;
            Err::<(), _>(SocketError::NotConnected)
        };
        for step in 0..10 {
            queue.drain(t0 + retry_interval * step, &mut sender);
        }

        prop_assert_eq!(tries, max_retries as usize + 1);
        prop_assert_eq!(attempts_seen.load(Ordering::SeqCst), max_retries as usize + 1);
        prop_assert!(queue.is_empty());
    }
}

// --- Event dispatch ---

#[derive(Debug, Clone)]
enum Op {
    On(usize, Category),
    Off(usize, Category),
}

fn arb_category() -> impl Strategy<Value = Category> {
    prop::sample::select(Category::ALL.to_vec())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3, arb_category()).prop_map(|(h, c)| Op::On(h, c)),
        (0usize..3, arb_category()).prop_map(|(h, c)| Op::Off(h, c)),
    ]
}

proptest! {
    #[test]
    fn subscriptions_behave_like_a_set(ops in prop::collection::vec(arb_op(), 0..50)) {
        let dispatcher = EventDispatcher::new();
        let handlers: Vec<Handler> = (0..3).map(|_| Handler::new(|_| {})).collect();
        let mut model: HashSet<(usize, Category)> = HashSet::new();

        for op in ops {
            match op {
                Op::On(h, c) => {
                    dispatcher.on(c, handlers[h].clone());
                    model.insert((h, c));
                }
                Op::Off(h, c) => {
                    dispatcher.off(c, &handlers[h]);
                    model.remove(&(h, c));
                }
            }
        }

        for category in Category::ALL {
            let expected = model.iter().filter(|(_, c)| *c == category).count();
            prop_assert_eq!(dispatcher.handler_count(category), expected);
        }
    }

    #[test]
    fn emit_reaches_each_subscriber_once(subscribe_times in 1usize..5) {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler = Handler::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..subscribe_times {
            dispatcher.on(Category::Chat, handler.clone());
        }
        dispatcher.emit(Category::Chat, &chat(0));
        prop_assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

// --- Backoff and decoding ---

proptest! {
    #[test]
    fn exponential_delay_is_monotone_and_capped(
        base_ms in 1u64..10_000,
        factor in 1.0f64..4.0,
        max_ms in 1u64..120_000,
    ) {
        let max = Duration::from_millis(max_ms);
        let policy = ReconnectPolicy::exponential(Duration::from_millis(base_ms), factor, max);
        let mut previous = Duration::ZERO;
        for attempt in 1..12 {
            let delay = policy.delay(attempt);
            prop_assert!(delay <= max);
            prop_assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn decode_never_panics(text in ".{0,200}") {
        let _ = Envelope::decode(&text);
    }

    #[test]
    fn decode_accepts_any_type_with_object_data(kind in "[a-z_]{1,12}") {
        let frame = format!(r#"{{"type":"{kind}","data":{{}}}}"#);
        if let Ok(envelope) = Envelope::decode(&frame) {
            prop_assert_eq!(envelope.kind(), kind.as_str());
        }
    }
}
