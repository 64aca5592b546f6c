//! The raw socket seam.
//!
//! A [`Connector`] opens sockets; each socket reports what happens to it on
//! its own channel, so events from a socket that has since been replaced are
//! dropped along with its receiver.

use tokio::sync::mpsc;

use crate::error::SocketError;

/// Something that happened to a raw socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Opened,
    Message(String),
    Error(String),
    /// Always the last event. `code` is absent when the connection dropped
    /// without a close frame.
    Closed { code: Option<u16>, reason: String },
}

pub type SocketEvents = mpsc::UnboundedReceiver<SocketEvent>;
pub type SocketEventSink = mpsc::UnboundedSender<SocketEvent>;

/// A bidirectional text socket.
pub trait RawSocket: Send {
    /// Queue one text frame. Fails if the socket is not open.
    fn send(&mut self, text: String) -> Result<(), SocketError>;

    /// Begin closing. A `Closed` event follows.
    fn close(&mut self, code: u16, reason: &str);
}

/// Opens raw sockets.
pub trait Connector: Send + Sync + 'static {
    /// Start opening a socket to `url`. Progress (`Opened`, then messages,
    /// then `Closed`) is reported on `events`. An `Err` means no socket was
    /// created and no events will follow.
    fn open(&self, url: &str, events: SocketEventSink) -> Result<Box<dyn RawSocket>, SocketError>;
}
