//! # Transport Abstraction
//!
//! A minimal, async interface for moving text frames between peers.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: The Transport knows nothing about envelopes, routes or ids.
//!   It moves opaque strings, in order.
//! - **Duplex**: Sending and receiving are independent. Request/response and
//!   subscriptions are built on top of this, not defined here.
//! - **Closed is terminal**: `recv` yielding `Ok(None)` is the one and only
//!   "connection closed" notification.
//! - **Resets are optional**: only adapters that silently re-establish their
//!   medium (see [`websocket::WebSocketLink`]) report resets.

use std::fmt;

use tokio::sync::broadcast;
use tokio::sync::watch;

pub mod channel;
pub mod stream;
pub mod websocket;

pub use channel::ChannelTransport;
pub use stream::StreamTransport;
pub use websocket::WebSocketAdapter;
pub use websocket::WebSocketLink;
pub use websocket::WebSocketLinkOptions;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The transport was closed deliberately.
    Closed,
    /// A length-prefixed frame announced more bytes than allowed.
    FrameTooLarge { len: usize, max: usize },
    /// A frame was not valid UTF-8.
    InvalidUtf8,
    /// Generic I/O error.
    Io(String),
    /// WebSocket protocol failure.
    WebSocket(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Transport closed"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "Frame of {} bytes exceeds the {} byte limit", len, max)
            }
            Self::InvalidUtf8 => write!(f, "Frame is not valid UTF-8"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::WebSocket(msg) => write!(f, "WebSocket error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An ordered, bidirectional channel of text frames.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame. May suspend until the medium accepts it.
    ///
    /// # invariants
    /// - Frames are delivered to the peer in the order `send` completed.
    /// - Should not interpret the payload content (e.g. no JSON parsing).
    async fn send(&self, frame: &str) -> Result<()>;

    /// Waits for the next inbound frame.
    ///
    /// Returns `Ok(None)` once the connection is closed; every later call does the same.
    async fn recv(&self) -> Result<Option<String>>;

    /// Closes the transport deliberately. Idempotent.
    async fn close(&self);

    /// A notification stream firing each time the underlying connection was
    /// silently replaced. `None` for transports that never reconnect.
    fn resets(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

/// Resolves once a `closed` flag flips to `true` (or its sender is gone).
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
