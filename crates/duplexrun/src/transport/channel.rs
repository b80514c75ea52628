//! In-process message channel transport.
//!
//! Two endpoints created together with [`ChannelTransport::pair`]; frames sent
//! on one appear on the other's `recv`, in order. Used for same-process
//! client/server pairs and throughout the test suite.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Transport;

/// A duplex channel transport using tokio mpsc channels.
///
/// Closing either end ends the peer's inbound sequence once the frames
/// already in flight have been received.
pub struct ChannelTransport {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    closed: watch::Sender<bool>,
}

impl ChannelTransport {
    fn new(tx: mpsc::UnboundedSender<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
            closed: watch::Sender::new(false),
        }
    }

    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.tx.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: &str) -> transport::Result<()> {
        let Some(tx) = self.sender() else {
            return Err(transport::Error::Closed);
        };

        tx.send(frame.to_owned())
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<String>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = transport::wait_closed(&mut closed) => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = ChannelTransport::pair();

        a.send("one").await.unwrap();
        a.send("two").await.unwrap();
        b.send("back").await.unwrap();

        assert_eq!(b.recv().await.unwrap().as_deref(), Some("one"));
        assert_eq!(b.recv().await.unwrap().as_deref(), Some("two"));
        assert_eq!(a.recv().await.unwrap().as_deref(), Some("back"));
    }

    #[tokio::test]
    async fn test_close_ends_both_directions() {
        let (a, b) = ChannelTransport::pair();
        a.send("last").await.unwrap();
        a.close().await;

        // The peer drains what was in flight, then sees the end.
        assert_eq!(b.recv().await.unwrap().as_deref(), Some("last"));
        assert_eq!(b.recv().await.unwrap(), None);

        assert_eq!(a.recv().await.unwrap(), None);
        assert_eq!(a.send("more").await, Err(transport::Error::Closed));

        // Idempotent.
        a.close().await;
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (a, _b) = ChannelTransport::pair();
        let a = Arc::new(a);

        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.recv().await })
        };

        tokio::task::yield_now().await;
        a.close().await;

        assert_eq!(reader.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_is_connection_lost() {
        let (a, b) = ChannelTransport::pair();
        drop(b);

        let err = a.send("x").await.unwrap_err();
        assert!(matches!(err, transport::Error::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_no_resets() {
        let (a, _b) = ChannelTransport::pair();
        assert!(a.resets().is_none());
    }
}
