//! [`Connector`] over a real WebSocket (tokio-tungstenite).
//!
//! Each socket is a spawned task that owns the stream. The [`RawSocket`] handed
//! back to the transport only feeds that task's outgoing channel, so sends
//! never block the transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::error::SocketError;
use crate::socket::{Connector, RawSocket, SocketEvent, SocketEventSink};

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &str, events: SocketEventSink) -> Result<Box<dyn RawSocket>, SocketError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SocketError::Open(format!("not a WebSocket URL: {url}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_socket(url.to_string(), rx, events, open.clone()));
        Ok(Box::new(WsSocket { outgoing: tx, open }))
    }
}

enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

struct WsSocket {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl RawSocket for WsSocket {
    fn send(&mut self, text: String) -> Result<(), SocketError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(SocketError::NotConnected);
        }
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| SocketError::NotConnected)
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.open.store(false, Ordering::Release);
        let _ = self.outgoing.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

async fn run_socket(
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: SocketEventSink,
    open: Arc<AtomicBool>,
) {
    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let err = SocketError::from_tungstenite(e);
            warn!(url = %url, error = %err, "WebSocket connect failed");
            let _ = events.send(SocketEvent::Error(err.to_string()));
            let _ = events.send(SocketEvent::Closed {
                code: None,
                reason: err.to_string(),
            });
            return;
        }
    };

    info!(url = %url, "WebSocket connected");
    open.store(true, Ordering::Release);
    let _ = events.send(SocketEvent::Opened);

    let (mut write, mut read) = stream.split();

    let (code, reason) = loop {
        tokio::select! {
            cmd = outgoing.recv() => match cmd {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        let err = SocketError::from_tungstenite(e);
                        let _ = events.send(SocketEvent::Error(err.to_string()));
                        break (None, err.to_string());
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break (Some(code), reason);
                }
                // The transport dropped the socket without closing it.
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break (Some(1000), "socket dropped".to_string());
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Message(text.as_str().to_string()));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(SocketEvent::Message(text));
                    }
                    Err(_) => debug!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
                        None => (None, String::new()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let err = SocketError::from_tungstenite(e);
                    let _ = events.send(SocketEvent::Error(err.to_string()));
                    break (None, err.to_string());
                }
                None => break (None, "stream ended".to_string()),
            },
        }
    };

    open.store(false, Ordering::Release);
    debug!(url = %url, code = ?code, reason = %reason, "WebSocket closed");
    let _ = events.send(SocketEvent::Closed { code, reason });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_websocket_urls() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = WsConnector::new()
            .open("http://example.com", tx)
            .err()
            .unwrap();
        assert!(matches!(err, SocketError::Open(_)));
    }

    #[tokio::test]
    async fn unreachable_peer_reports_error_then_closed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = format!("ws://127.0.0.1:{port}");
        let mut socket = WsConnector::new().open(&url, tx).unwrap();
        assert_eq!(socket.send("early".into()), Err(SocketError::NotConnected));

        assert!(matches!(rx.recv().await, Some(SocketEvent::Error(_))));
        assert!(matches!(
            rx.recv().await,
            Some(SocketEvent::Closed { code: None, .. })
        ));
    }

    #[tokio::test]
    async fn echoes_through_a_local_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() && ws.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut socket = WsConnector::new()
            .open(&format!("ws://{addr}"), tx)
            .unwrap();
        assert_eq!(rx.recv().await, Some(SocketEvent::Opened));

        socket.send("hello".into()).unwrap();
        assert_eq!(rx.recv().await, Some(SocketEvent::Message("hello".into())));

        socket.close(1000, "bye");
        assert_eq!(
            rx.recv().await,
            Some(SocketEvent::Closed {
                code: Some(1000),
                reason: "bye".into()
            })
        );
    }
}
