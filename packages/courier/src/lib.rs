//! Courier - reliable client-side message transport over WebSocket
//!
//! Keeps one connection to a server alive across drops, queues outbound
//! messages by priority until they can be sent, retries failed sends, tracks
//! acknowledgments, batches small messages, monitors liveness with
//! heartbeats, authenticates each new connection, and routes inbound
//! messages to subscribers by category.
//!
//! # Example
//!
//! ```no_run
//! use courier::{Category, Envelope, Handler, Priority, Transport, TransportConfig, WsConnector};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TransportConfig::new("wss://chat.example.com/ws").with_auth("token", "alice");
//!     let transport = Transport::spawn(config, WsConnector::new()).unwrap();
//!
//!     transport.on(
//!         Category::Chat,
//!         Handler::new(|event| println!("{:?}", event.envelope)),
//!     );
//!     transport.connect().unwrap();
//!     transport
//!         .send(Envelope::chat("m1", "general", "hello"), Priority::Normal)
//!         .unwrap();
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod classify;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod socket;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod timer;
pub mod ws;

pub use backoff::{BackoffStrategy, ReconnectPolicy};
pub use config::{TransportConfig, load_config};
pub use connection::{ConnectionState, Transport};
pub use dispatch::{Category, Event, Handler};
pub use error::{ConfigError, DeliveryError, ProtocolError, SocketError, TransportError};
pub use metrics::MetricsSnapshot;
pub use protocol::Envelope;
pub use queue::{
    BatchWindow, Delivered, DeliveryResult, EnqueueOptions, MessageId, Priority, QueueStats,
};
pub use socket::{Connector, RawSocket, SocketEvent};
pub use ws::WsConnector;
