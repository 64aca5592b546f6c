//! The connection manager and the [`Transport`] handle that drives it.
//!
//! All transport state lives in a single actor task. The handle is a cheap
//! `Clone` that talks to it over a channel; event subscriptions and metrics
//! are shared directly, since they never touch connection state.

mod actor;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, info_span};

use crate::config::TransportConfig;
use crate::dispatch::{Category, EventDispatcher, Handler};
use crate::error::{ConfigError, TransportError};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::protocol::Envelope;
use crate::queue::{EnqueueOptions, MessageId, Priority, QueueStats};
use crate::socket::Connector;

use actor::ConnectionActor;

/// Lifecycle of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
    /// Closed, with reconnection `attempt` scheduled.
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Send {
        id: MessageId,
        envelope: Envelope,
        options: EnqueueOptions,
    },
    Acknowledge {
        id: MessageId,
        respond_to: oneshot::Sender<bool>,
    },
    QueueStats {
        respond_to: oneshot::Sender<QueueStats>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running transport.
///
/// The actor keeps running while any handle exists or until
/// [`shutdown`](Self::shutdown). A handler that captures a handle keeps the
/// actor alive on its own, so call `shutdown` when done.
#[derive(Clone)]
pub struct Transport {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: Arc<EventDispatcher>,
    metrics: Arc<TransportMetrics>,
}

impl Transport {
    /// Validate `config` and start the actor. Must be called inside a tokio
    /// runtime. The transport starts closed; call [`connect`](Self::connect).
    pub fn spawn(config: TransportConfig, connector: impl Connector) -> Result<Self, ConfigError> {
        config.validate()?;

        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Closed);
        let dispatcher = Arc::new(EventDispatcher::new());
        let metrics = Arc::new(TransportMetrics::new());

        let span = info_span!("transport", url = %config.url);
        let actor = ConnectionActor::new(
            config,
            Box::new(connector),
            rx,
            state_tx,
            dispatcher.clone(),
            metrics.clone(),
        );
        tokio::spawn(actor.run().instrument(span));

        Ok(Self {
            commands,
            state,
            dispatcher,
            metrics,
        })
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Stopped)
    }

    /// Open the connection. No-op while connecting or open.
    pub fn connect(&self) -> Result<(), TransportError> {
        self.command(Command::Connect)
    }

    /// Close deliberately with code 1000. No reconnection follows and every
    /// timer stops until the next [`connect`](Self::connect).
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.command(Command::Disconnect)
    }

    /// Disconnect, then connect.
    pub fn reconnect(&self) -> Result<(), TransportError> {
        self.command(Command::Reconnect)
    }

    /// Queue `envelope` at `priority`. Sent immediately if open, otherwise
    /// held until the connection opens.
    pub fn send(&self, envelope: Envelope, priority: Priority) -> Result<MessageId, TransportError> {
        self.send_with(envelope, EnqueueOptions::new().priority(priority))
    }

    pub fn send_with(
        &self,
        envelope: Envelope,
        options: EnqueueOptions,
    ) -> Result<MessageId, TransportError> {
        let id = MessageId::new();
        self.command(Command::Send {
            id: id.clone(),
            envelope,
            options,
        })?;
        Ok(id)
    }

    /// Confirm receipt of an ack-required message. Returns whether `id` was
    /// awaiting acknowledgment.
    pub async fn acknowledge(&self, id: &MessageId) -> Result<bool, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Acknowledge {
            id: id.clone(),
            respond_to: tx,
        })?;
        rx.await.map_err(|_| TransportError::Stopped)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::QueueStats { respond_to: tx })?;
        rx.await.map_err(|_| TransportError::Stopped)
    }

    /// Subscribe `handler` to `category`. Subscribing the same handler twice
    /// has no effect.
    pub fn on(&self, category: Category, handler: Handler) {
        self.dispatcher.on(category, handler);
    }

    /// Remove `handler` from `category`. Unknown handlers are ignored.
    pub fn off(&self, category: Category, handler: &Handler) {
        self.dispatcher.off(category, handler);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for_state(
        &self,
        pred: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState, TransportError> {
        let mut rx = self.state.clone();
        rx.wait_for(pred)
            .await
            .map(|state| *state)
            .map_err(|_| TransportError::Stopped)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Close the connection, fail every queued message with
    /// `TransportClosed` and stop the actor.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Shutdown { respond_to: tx })?;
        rx.await.map_err(|_| TransportError::Stopped)
    }
}
