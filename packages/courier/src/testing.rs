//! In-memory [`Connector`] and event recorder for driving a
//! [`Transport`](crate::Transport) without a network.
//!
//! Compiled for this crate's own tests and behind the `test-util` feature.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::dispatch::{Category, Event, Handler};
use crate::error::SocketError;
use crate::protocol::Envelope;
use crate::socket::{Connector, RawSocket, SocketEvent, SocketEventSink};
use crate::Transport;

#[derive(Default)]
struct MockState {
    urls: Vec<String>,
    events: Option<SocketEventSink>,
    generation: u64,
    open: bool,
    manual_accept: bool,
    refuse: bool,
    reject_sends: bool,
    sent: Vec<String>,
    send_attempts: usize,
    closes: Vec<(u16, String)>,
}

/// A scriptable connector. Sockets open immediately unless configured
/// otherwise; everything the transport sends is recorded.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sockets stay in `connecting` until [`accept`](Self::accept).
    pub fn manual_accept(&self, manual: bool) {
        self.lock().manual_accept = manual;
    }

    /// Complete the pending open of the current socket.
    pub fn accept(&self) {
        let mut state = self.lock();
        state.open = true;
        if let Some(events) = &state.events {
            let _ = events.send(SocketEvent::Opened);
        }
    }

    /// New sockets report an error and close instead of opening.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse = refuse;
    }

    /// Every send on an open socket fails.
    pub fn fail_sends(&self, fail: bool) {
        self.lock().reject_sends = fail;
    }

    /// Deliver a text frame from the peer on the current socket.
    pub fn push_raw(&self, text: impl Into<String>) {
        if let Some(events) = &self.lock().events {
            let _ = events.send(SocketEvent::Message(text.into()));
        }
    }

    pub fn push(&self, envelope: &Envelope) {
        if let Ok(text) = envelope.encode(None) {
            self.push_raw(text);
        }
    }

    /// Drop the current connection from the peer's side.
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        state.open = false;
        if let Some(events) = state.events.take() {
            let _ = events.send(SocketEvent::Closed {
                code: Some(1006),
                reason: "abnormal closure".to_string(),
            });
        }
    }

    pub fn open_count(&self) -> usize {
        self.lock().urls.len()
    }

    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Sent frames, decoded.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent()
            .iter()
            .filter_map(|text| Envelope::decode(text).ok())
            .collect()
    }

    /// The `type` of every sent frame, in order.
    pub fn sent_kinds(&self) -> Vec<String> {
        self.sent_envelopes()
            .iter()
            .map(|e| e.kind().to_string())
            .collect()
    }

    /// Raw sends attempted while a socket was open, including failed ones.
    pub fn send_attempts(&self) -> usize {
        self.lock().send_attempts
    }

    /// Close codes the transport used, in order.
    pub fn closes(&self) -> Vec<(u16, String)> {
        self.lock().closes.clone()
    }
}

impl Connector for MockConnector {
    fn open(&self, url: &str, events: SocketEventSink) -> Result<Box<dyn RawSocket>, SocketError> {
        let mut state = self.lock();
        state.urls.push(url.to_string());
        state.generation += 1;
        state.open = false;

        if state.refuse {
            let _ = events.send(SocketEvent::Error("connection refused".to_string()));
            let _ = events.send(SocketEvent::Closed {
                code: None,
                reason: "connection refused".to_string(),
            });
            state.events = None;
        } else {
            if !state.manual_accept {
                state.open = true;
                let _ = events.send(SocketEvent::Opened);
            }
            state.events = Some(events);
        }

        Ok(Box::new(MockSocket {
            state: self.state.clone(),
            generation: state.generation,
        }))
    }
}

struct MockSocket {
    state: Arc<Mutex<MockState>>,
    generation: u64,
}

impl RawSocket for MockSocket {
    fn send(&mut self, text: String) -> Result<(), SocketError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.generation != self.generation || !state.open {
            return Err(SocketError::NotConnected);
        }
        state.send_attempts += 1;
        if state.reject_sends {
            return Err(SocketError::Io("send rejected".to_string()));
        }
        state.sent.push(text);
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closes.push((code, reason.to_string()));
        if state.generation == self.generation {
            state.open = false;
            if let Some(events) = state.events.take() {
                let _ = events.send(SocketEvent::Closed {
                    code: Some(code),
                    reason: reason.to_string(),
                });
            }
        }
    }
}

/// Records every event a transport emits on the given categories.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn attach(transport: &Transport, categories: &[Category]) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        let handler = Handler::new(move |event| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        });
        for &category in categories {
            transport.on(category, handler.clone());
        }
        log
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn in_category(&self, category: Category) -> Vec<Envelope> {
        self.events()
            .into_iter()
            .filter(|e| e.category == category)
            .map(|e| e.envelope)
            .collect()
    }

    /// Codes of every `error` event, in order.
    pub fn error_codes(&self) -> Vec<String> {
        self.in_category(Category::Error)
            .into_iter()
            .filter_map(|e| match e {
                Envelope::Error(data) => Some(data.code),
                _ => None,
            })
            .collect()
    }

    /// `event` names of every `system` event, in order.
    pub fn system_events(&self) -> Vec<String> {
        self.in_category(Category::System)
            .into_iter()
            .filter_map(|e| match e {
                Envelope::System(data) => Some(data.event),
                _ => None,
            })
            .collect()
    }
}
