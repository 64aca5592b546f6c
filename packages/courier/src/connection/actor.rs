use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{AuthHandshake, AuthOutcome};
use crate::classify::Classifier;
use crate::config::TransportConfig;
use crate::dispatch::{Category, EventDispatcher};
use crate::error::{DeliveryError, ProtocolError, SocketError, close_codes, codes};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatTick, Liveness};
use crate::metrics::TransportMetrics;
use crate::protocol::{AuthResponseData, Envelope};
use crate::queue::{EnqueueOptions, MessageId, OutboundQueue, Priority};
use crate::socket::{Connector, RawSocket, SocketEvent, SocketEvents};
use crate::timer::{PeriodicTimer, ScheduledTimer};

use super::{Command, ConnectionState};

pub(super) struct ConnectionActor {
    config: TransportConfig,
    connector: Box<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    dispatcher: Arc<EventDispatcher>,
    metrics: Arc<TransportMetrics>,
    classifier: Classifier,

    state: ConnectionState,
    socket: Option<Box<dyn RawSocket>>,
    socket_events: Option<SocketEvents>,
    connect_started: Option<Instant>,
    retry_count: u32,
    /// The socket being opened replaces one that missed a heartbeat.
    recovering: bool,
    /// The last connection died of heartbeat loss. The retry budget is kept
    /// until the peer answers a heartbeat again.
    liveness_suspect: bool,
    /// Deliberately disconnected; only TTL expiry keeps running.
    stopped: bool,

    queue: OutboundQueue,
    heartbeat: HeartbeatMonitor,
    auth: Option<AuthHandshake>,
    /// The queued `auth` request for the current connection.
    auth_request: Option<MessageId>,
    reconnect_timer: ScheduledTimer,
    drain_timer: PeriodicTimer,
    queue_wake: ScheduledTimer,
    drain_requested: bool,
}

impl ConnectionActor {
    pub(super) fn new(
        config: TransportConfig,
        connector: Box<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        dispatcher: Arc<EventDispatcher>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        let auth = config
            .auth
            .as_ref()
            .map(|a| AuthHandshake::new(a.credentials.clone(), a.timeout));
        Self {
            classifier: Classifier::new(config.strict_types),
            queue: OutboundQueue::new(config.queue.clone()),
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
            auth,
            auth_request: None,
            config,
            connector,
            commands,
            state_tx,
            dispatcher,
            metrics,
            state: ConnectionState::Closed,
            socket: None,
            socket_events: None,
            connect_started: None,
            retry_count: 0,
            recovering: false,
            liveness_suspect: false,
            stopped: false,
            reconnect_timer: ScheduledTimer::new(),
            drain_timer: PeriodicTimer::new(),
            queue_wake: ScheduledTimer::new(),
            drain_requested: false,
        }
    }

    pub(super) async fn run(mut self) {
        debug!("transport actor started");
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                event = next_socket_event(&mut self.socket_events) => self.handle_socket_event(event),
                () = self.reconnect_timer.fired() => self.attempt_reconnect(),
                tick = self.heartbeat.tick() => self.handle_heartbeat_tick(tick),
                _ = self.drain_timer.tick() => self.drain_requested = true,
                () = self.queue_wake.fired() => self.drain_requested = true,
                () = auth_timed_out(&mut self.auth) => self.handle_auth_timeout(),
            }

            if std::mem::take(&mut self.drain_requested) {
                self.drain();
            }
            self.rearm_queue_wake();
        }
        debug!("transport actor stopped");
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::Reconnect => {
                self.disconnect();
                self.connect();
            }
            Command::Send {
                id,
                envelope,
                options,
            } => {
                debug!(%id, kind = envelope.kind(), "message queued");
                self.queue
                    .enqueue_with_id(id, envelope, options, Instant::now());
                if self.state.is_open() {
                    self.drain_requested = true;
                }
            }
            Command::Acknowledge { id, respond_to } => {
                let found = self.queue.acknowledge(&id);
                if found {
                    self.metrics.acknowledged();
                } else {
                    debug!(%id, "acknowledgment for unknown message");
                }
                let _ = respond_to.send(found);
            }
            Command::QueueStats { respond_to } => {
                let _ = respond_to.send(self.queue.stats());
            }
            Command::Shutdown { respond_to } => {
                self.shutdown();
                let _ = respond_to.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // -- lifecycle --

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "connection state");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            debug!(state = ?self.state, "connect ignored");
            return;
        }
        self.stopped = false;
        self.reconnect_timer.cancel();
        self.open_socket();
    }

    fn open_socket(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.socket = None;
        self.socket_events = None;
        self.set_state(ConnectionState::Connecting);
        self.connect_started = Some(Instant::now());

        match self.connector.open(&self.config.url, tx) {
            Ok(socket) => {
                self.socket = Some(socket);
                self.socket_events = Some(rx);
            }
            Err(e) => {
                warn!(error = %e, "failed to open socket");
                self.metrics.connection_failed();
                self.emit_error(codes::WS_ERROR, e.to_string());
                self.connection_lost(false);
            }
        }
    }

    fn on_open(&mut self) {
        let now = Instant::now();
        if let Some(started) = self.connect_started.take() {
            self.metrics
                .connection_opened((now - started).as_millis() as u64);
        }
        self.set_state(ConnectionState::Open);
        if self.liveness_suspect {
            debug!(retries = self.retry_count, "retry budget held until a heartbeat arrives");
        } else {
            self.retry_count = 0;
        }

        if std::mem::take(&mut self.recovering) {
            self.heartbeat.resume(now);
        } else {
            self.heartbeat.reset(now);
        }
        self.drain_timer.start(self.config.drain_interval);
        info!("connected");

        self.drain();
        self.emit_system("connected", Map::new());

        if let Some(message) = self.auth.as_mut().and_then(AuthHandshake::begin) {
            let id = self.queue.enqueue(
                message,
                EnqueueOptions::new().priority(Priority::High).unbatched(),
                now,
            );
            self.auth_request = Some(id);
            self.drain_requested = true;
        }
    }

    /// Stop everything that only makes sense on a live socket.
    fn teardown(&mut self) {
        self.socket = None;
        self.socket_events = None;
        self.connect_started = None;
        self.heartbeat.stop();
        self.drain_timer.stop();
        if let Some(auth) = &mut self.auth {
            auth.reset();
        }
        // An auth request belongs to the connection it was made for.
        if let Some(id) = self.auth_request.take() {
            if self.queue.withdraw(&id) {
                debug!(%id, "unsent auth request withdrawn");
            }
        }
    }

    /// Close the socket ourselves with `code` and `reason`.
    fn close_socket(&mut self, code: u16, reason: &str) {
        if let Some(mut socket) = self.socket.take() {
            socket.close(code, reason);
        }
    }

    /// The connection went away without being asked to.
    fn connection_lost(&mut self, was_open: bool) {
        self.teardown();
        self.set_state(ConnectionState::Closed);
        if was_open {
            self.emit_system("disconnected", Map::new());
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.retry_count >= self.config.max_retries {
            warn!(retries = self.retry_count, "giving up on reconnecting");
            self.emit_error(codes::MAX_RETRIES, "Max retries reached");
            return;
        }
        let attempt = self.retry_count + 1;
        let delay = self.config.reconnect.delay(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.reconnect_timer.schedule_in(delay);
        self.set_state(ConnectionState::Reconnecting { attempt });
    }

    fn attempt_reconnect(&mut self) {
        self.retry_count += 1;
        self.metrics.reconnect_attempt();
        let mut payload = Map::new();
        payload.insert("attempt".to_string(), Value::from(self.retry_count));
        self.emit_system("reconnecting", payload);
        self.open_socket();
    }

    /// Deliberate close: no reconnection, and every timer but TTL expiry
    /// stops until the next connect.
    fn close_deliberately(&mut self, code: u16, reason: &str) {
        let was_open = self.state.is_open();
        if self.socket.is_some() {
            self.set_state(ConnectionState::Closing);
        }
        self.close_socket(code, reason);
        self.teardown();
        self.reconnect_timer.cancel();
        self.queue_wake.cancel();
        self.stopped = true;
        self.recovering = false;
        self.liveness_suspect = false;
        self.retry_count = 0;
        self.set_state(ConnectionState::Closed);
        if was_open {
            info!(code, reason, "disconnected");
            self.emit_system("disconnected", Map::new());
        }
    }

    fn disconnect(&mut self) {
        self.close_deliberately(close_codes::NORMAL, "client disconnect");
    }

    fn shutdown(&mut self) {
        self.close_deliberately(close_codes::NORMAL, "transport shutdown");
        let failed = self.queue.fail_all(DeliveryError::TransportClosed);
        if failed > 0 {
            warn!(failed, "queued messages dropped at shutdown");
        }
        info!("transport shut down");
    }

    // -- socket events --

    fn handle_socket_event(&mut self, event: Option<SocketEvent>) {
        match event {
            Some(SocketEvent::Opened) => self.on_open(),
            Some(SocketEvent::Message(text)) => self.on_message(&text),
            Some(SocketEvent::Error(reason)) => {
                warn!(reason = %reason, "socket error");
                self.emit_error(codes::WS_ERROR, reason);
            }
            Some(SocketEvent::Closed { code, reason }) => {
                info!(?code, reason = %reason, "socket closed");
                self.on_unexpected_close();
            }
            None => {
                warn!("socket task ended without a close event");
                self.on_unexpected_close();
            }
        }
    }

    fn on_unexpected_close(&mut self) {
        let was_open = self.state.is_open();
        if !was_open {
            self.metrics.connection_failed();
        }
        self.connection_lost(was_open);
    }

    fn on_message(&mut self, text: &str) {
        self.metrics.frame_received(text.len());
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.protocol_error(e);
                return;
            }
        };

        self.metrics.message_received(envelope.kind(), text.len());

        let classification = self.classifier.classify(envelope);
        for warning in classification.warnings {
            self.protocol_error(warning);
        }
        let total = classification.routed.len();
        for (n, routed) in classification.routed.into_iter().enumerate() {
            routed.deliver(&self.dispatcher);
            match &routed.envelope {
                Envelope::Heartbeat(_) => self.on_peer_heartbeat(),
                Envelope::AuthResponse(response) => self.on_auth_response(response),
                _ => {}
            }
            // The rest of the frame belongs to a connection we just closed.
            if self.socket_events.is_none() {
                let dropped = total - n - 1;
                if dropped > 0 {
                    debug!(dropped, "connection closed mid-batch; remaining messages dropped");
                }
                break;
            }
        }
    }

    fn protocol_error(&mut self, error: ProtocolError) {
        warn!(error = %error, "protocol error");
        self.metrics.protocol_error();
        self.emit_error(error.error_code(), error.to_string());
    }

    // -- liveness --

    fn on_peer_heartbeat(&mut self) {
        self.metrics.heartbeat_received();
        self.heartbeat.record_ack(Instant::now());
        if std::mem::take(&mut self.liveness_suspect) {
            debug!("peer answered; retry budget restored");
            self.retry_count = 0;
        }
    }

    fn handle_heartbeat_tick(&mut self, tick: HeartbeatTick) {
        let now = Instant::now();
        match tick {
            HeartbeatTick::SendProbe => {
                if !self.state.is_open() {
                    return;
                }
                let options = EnqueueOptions::new()
                    .priority(Priority::High)
                    .ttl(self.config.heartbeat.interval)
                    .unbatched();
                self.queue.enqueue(Envelope::heartbeat(), options, now);
                self.metrics.heartbeat_sent();
                self.drain_requested = true;
            }
            HeartbeatTick::Check => match self.heartbeat.check_timeout(now) {
                Liveness::Idle | Liveness::Healthy => {}
                Liveness::Missed { reconnect, .. } => {
                    self.metrics.heartbeat_missed();
                    if reconnect {
                        self.recover_liveness();
                    }
                }
                Liveness::Dead { missed } => {
                    self.metrics.heartbeat_missed();
                    self.emit_error(
                        codes::HEARTBEAT_TIMEOUT,
                        format!("no heartbeat from peer after {missed} missed beats"),
                    );
                    self.liveness_suspect = true;
                    self.recovering = false;
                    self.close_socket(close_codes::LIVENESS, "heartbeat timeout");
                    self.connection_lost(true);
                }
            },
        }
    }

    /// Replace a socket that missed a heartbeat. The monitor keeps its streak
    /// across the swap and the retry budget is left alone.
    fn recover_liveness(&mut self) {
        info!("heartbeat missed; reconnecting");
        let was_open = self.state.is_open();
        self.close_socket(close_codes::LIVENESS, "heartbeat missed");
        self.teardown();
        self.set_state(ConnectionState::Closed);
        if was_open {
            self.emit_system("disconnected", Map::new());
        }
        let mut payload = Map::new();
        payload.insert("reason".to_string(), Value::from("heartbeat"));
        self.emit_system("reconnecting", payload);
        self.recovering = true;
        self.open_socket();
    }

    // -- auth --

    fn on_auth_response(&mut self, response: &AuthResponseData) {
        let Some(auth) = self.auth.as_mut() else {
            debug!("auth response with no credentials configured");
            return;
        };
        match auth.handle_response(response) {
            Ok(AuthOutcome::Authenticated) => self.emit_system("authenticated", Map::new()),
            Ok(AuthOutcome::Rejected { reason }) => {
                self.emit_error(codes::AUTH_FAILED, reason);
                self.close_deliberately(close_codes::AUTH_REJECTED, "authentication rejected");
            }
            Ok(AuthOutcome::Ignored) => {}
            Err(e) => self.protocol_error(e),
        }
    }

    fn handle_auth_timeout(&mut self) {
        warn!("no auth response in time");
        self.emit_error(codes::AUTH_TIMEOUT, "Authentication timed out");
        self.close_socket(close_codes::LIVENESS, "authentication timeout");
        let was_open = self.state.is_open();
        self.connection_lost(was_open);
    }

    // -- queue --

    fn drain(&mut self) {
        let now = Instant::now();
        let report = if self.state.is_open() {
            let socket = &mut self.socket;
            let metrics = &self.metrics;
            let mut sender =
                |envelope: &Envelope, ack: Option<&MessageId>| -> Result<(), SocketError> {
                    let socket = socket.as_mut().ok_or(SocketError::NotConnected)?;
                    let ack = ack.map(ToString::to_string);
                    let text = envelope
                        .encode(ack.as_deref())
                        .map_err(|e| SocketError::Io(e.to_string()))?;
                    let len = text.len();
                    socket.send(text)?;
                    metrics.frame_sent(envelope.kind(), len);
                    Ok(())
                };
            self.queue.drain(now, &mut sender)
        } else {
            self.queue.sweep(now)
        };

        if report.frames > 0 || report.expired > 0 || report.failed > 0 {
            debug!(
                frames = report.frames,
                delivered = report.delivered,
                expired = report.expired,
                failed = report.failed,
                "queue drained"
            );
        }
        self.metrics.record_drain(&report);
    }

    fn rearm_queue_wake(&mut self) {
        let now = Instant::now();
        let next = if self.stopped {
            self.queue.next_expiry(now)
        } else {
            self.queue.next_deadline(now, self.state.is_open())
        };
        match next {
            Some(at) if self.queue_wake.deadline() != Some(at) => self.queue_wake.schedule_at(at),
            Some(_) => {}
            None => self.queue_wake.cancel(),
        }
    }

    // -- events --

    fn emit_error(&self, code: &str, message: impl Into<String>) {
        self.metrics.error_emitted();
        self.dispatcher
            .emit(Category::Error, &Envelope::error(code, message));
    }

    fn emit_system(&self, event: &str, payload: Map<String, Value>) {
        self.dispatcher
            .emit(Category::System, &Envelope::system(event, payload));
    }
}

async fn next_socket_event(events: &mut Option<SocketEvents>) -> Option<SocketEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn auth_timed_out(auth: &mut Option<AuthHandshake>) {
    match auth {
        Some(auth) => auth.timed_out().await,
        None => std::future::pending().await,
    }
}
