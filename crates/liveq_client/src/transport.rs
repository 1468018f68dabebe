//! Transport abstraction for the sync socket.
//!
//! The engine never touches a real websocket. It speaks to the network
//! through the [`Connector`] trait, which dials one socket and hands
//! back a pair of channels: a text-frame sink and a socket-event
//! stream. This keeps the state machine testable over in-memory
//! channels and lets embedders plug in whichever websocket library
//! they use.

use crate::error::{ClientError, ClientResult};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Well-known websocket close codes.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// No status code present.
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure, no close frame received.
    pub const ABNORMAL: u16 = 1006;
    /// Reserved code for a missing destination deployment.
    pub const NOT_FOUND: u16 = 4040;
}

/// Returns true for close codes treated as ordinary, retryable
/// disconnects that warrant no logging.
pub fn is_ordinary_close(code: u16) -> bool {
    matches!(
        code,
        close_code::NORMAL | close_code::GOING_AWAY | close_code::NO_STATUS | close_code::NOT_FOUND
    )
}

/// An event produced by the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// An inbound text frame.
    Message(String),
    /// The socket closed.
    Closed {
        /// Close code.
        code: u16,
        /// Machine-readable close reason, when the server sent one.
        reason: Option<String>,
    },
}

/// One open socket: a frame sink and an event stream.
///
/// Dropping the `Connection` closes the socket; the connector's
/// implementation observes the sender going away. Events queued from a
/// dropped connection are discarded with it, so a close event can never
/// re-enter the state machine after the client has already moved on.
#[derive(Debug)]
pub struct Connection {
    /// Outgoing text frames.
    pub outgoing: mpsc::UnboundedSender<String>,
    /// Inbound socket events.
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Dials one physical socket at a time.
pub trait Connector: Send + 'static {
    /// Opens a socket. Resolves once the connection is established.
    fn connect(&mut self) -> BoxFuture<'static, ClientResult<Connection>>;
}

/// The server-side end of a [`loopback`] connection, held by tests.
#[derive(Debug)]
pub struct ServerEnd {
    /// Frames the client sent.
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Events to deliver to the client.
    pub to_client: mpsc::UnboundedSender<SocketEvent>,
}

impl ServerEnd {
    /// Closes the socket from the server side.
    pub fn close(&self, code: u16, reason: Option<&str>) {
        let _ = self.to_client.send(SocketEvent::Closed {
            code,
            reason: reason.map(str::to_string),
        });
    }
}

/// An in-memory connector for tests.
///
/// Every successful dial produces a fresh channel pair and hands the
/// server end to whoever holds the receiver returned by [`loopback`].
#[derive(Debug)]
pub struct LoopbackConnector {
    server_ends: mpsc::UnboundedSender<ServerEnd>,
}

/// Creates a loopback connector and the stream of server ends it will
/// produce, one per (re)connect.
pub fn loopback() -> (LoopbackConnector, mpsc::UnboundedReceiver<ServerEnd>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LoopbackConnector { server_ends: tx }, rx)
}

impl Connector for LoopbackConnector {
    fn connect(&mut self) -> BoxFuture<'static, ClientResult<Connection>> {
        let server_ends = self.server_ends.clone();
        Box::pin(async move {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            server_ends
                .send(ServerEnd {
                    from_client: out_rx,
                    to_client: in_tx,
                })
                .map_err(|_| ClientError::transport_retryable("loopback server gone"))?;
            Ok(Connection {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_close_codes() {
        assert!(is_ordinary_close(close_code::NORMAL));
        assert!(is_ordinary_close(close_code::GOING_AWAY));
        assert!(is_ordinary_close(close_code::NO_STATUS));
        assert!(is_ordinary_close(close_code::NOT_FOUND));
        assert!(!is_ordinary_close(close_code::ABNORMAL));
        assert!(!is_ordinary_close(4001));
    }

    #[tokio::test]
    async fn loopback_roundtrip() {
        let (mut connector, mut server_ends) = loopback();
        let mut connection = connector.connect().await.unwrap();
        let mut server = server_ends.recv().await.unwrap();

        connection.outgoing.send("hello".into()).unwrap();
        assert_eq!(server.from_client.recv().await.unwrap(), "hello");

        server
            .to_client
            .send(SocketEvent::Message("world".into()))
            .unwrap();
        assert_eq!(
            connection.incoming.recv().await.unwrap(),
            SocketEvent::Message("world".into())
        );
    }

    #[tokio::test]
    async fn loopback_connect_fails_when_server_dropped() {
        let (mut connector, server_ends) = loopback();
        drop(server_ends);
        assert!(connector.connect().await.is_err());
    }
}
