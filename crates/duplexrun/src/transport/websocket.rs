//! WebSocket transports.
//!
//! - [`WebSocketAdapter`]: wraps one accepted (or already connected) socket.
//!   Closed when the socket closes; never reconnects. The server-side choice.
//! - [`WebSocketLink`]: a client that keeps a socket to `url` alive. Frames sent
//!   while disconnected are queued and flushed, in order, on the next open.
//!   Every unexpected close fires a reset and schedules a reconnect after the
//!   configured backoff.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use futures_util::SinkExt;
use futures_util::StreamExt;
use futures_util::stream::SplitSink;
use futures_util::stream::SplitStream;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::backoff::ReconnectDelay;
use crate::transport;
use crate::transport::Transport;

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = SplitSink<ClientSocket, Message>;

// ============================================================================
//  ADAPTER
// ============================================================================

/// A single WebSocket connection as a [`Transport`].
pub struct WebSocketAdapter<S> {
    sink: Mutex<Option<SplitSink<WebSocketStream<S>, Message>>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: watch::Sender<bool>,
}

impl<S> WebSocketAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: WebSocketStream<S>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(Some(sink)),
            stream: Mutex::new(stream),
            closed: watch::Sender::new(false),
        }
    }
}

/// Pulls the next text frame, skipping control and binary frames.
async fn next_text<St>(stream: &mut St) -> transport::Result<Option<String>>
where
    St: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(Message::Binary(data))) => {
                tracing::warn!(len = data.len(), "dropping binary websocket frame, expected text");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl<S> Transport for WebSocketAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: &str) -> transport::Result<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(transport::Error::Closed);
        };
        sink.send(Message::Text(frame.to_owned())).await?;
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<String>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }

        let mut stream = self.stream.lock().await;
        tokio::select! {
            frame = next_text(&mut *stream) => frame,
            _ = transport::wait_closed(&mut closed) => Ok(None),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "websocket close failed");
            }
        }
    }
}

// ============================================================================
//  RECONNECTING LINK
// ============================================================================

/// Settings for [`WebSocketLink::connect`].
#[derive(Clone, Debug)]
pub struct WebSocketLinkOptions {
    pub url: String,
    pub reconnect_delay: ReconnectDelay,
}

impl WebSocketLinkOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: ReconnectDelay::default(),
        }
    }

    pub fn reconnect_delay(mut self, delay: impl Into<ReconnectDelay>) -> Self {
        self.reconnect_delay = delay.into();
        self
    }
}

/// Outbound side of the link: the open socket, if any, and frames waiting for one.
struct Outbound {
    sink: Option<ClientSink>,
    queue: VecDeque<String>,
}

struct LinkState {
    options: WebSocketLinkOptions,
    outbound: Mutex<Outbound>,
    attempt: AtomicU32,
    closed: watch::Sender<bool>,
    resets: broadcast::Sender<()>,
}

impl LinkState {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Flushes queued frames onto a freshly opened socket, then makes it current.
    ///
    /// Returns false if the socket failed while flushing; unsent frames stay queued.
    async fn open(&self, mut sink: ClientSink) -> bool {
        self.attempt.store(0, Ordering::Relaxed);

        let mut outbound = self.outbound.lock().await;
        while let Some(frame) = outbound.queue.pop_front() {
            if let Err(e) = sink.send(Message::Text(frame.clone())).await {
                tracing::warn!(error = %e, "websocket failed while flushing queued frames");
                outbound.queue.push_front(frame);
                return false;
            }
        }
        outbound.sink = Some(sink);
        true
    }

    /// Supervisor loop: connect, pump inbound frames, and reconnect after unexpected closes.
    async fn run(self: Arc<Self>, inbound: mpsc::UnboundedSender<String>) {
        let mut closed = self.closed.subscribe();

        loop {
            if self.is_closed() {
                return;
            }

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(self.options.url.as_str()) => result,
                _ = transport::wait_closed(&mut closed) => return,
            };

            match connected {
                Ok((socket, _response)) => {
                    tracing::debug!(url = %self.options.url, "websocket open");
                    let (sink, mut stream) = socket.split();

                    if self.open(sink).await {
                        loop {
                            let frame = tokio::select! {
                                frame = next_text(&mut stream) => frame,
                                _ = transport::wait_closed(&mut closed) => return,
                            };
                            match frame {
                                Ok(Some(text)) => {
                                    if inbound.send(text).is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!(error = %e, "websocket read failed");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.options.url, error = %e, "websocket connect failed");
                }
            }

            if self.is_closed() {
                return;
            }

            // Unexpected close. The sink is dropped first so that anything sent in
            // reaction to the reset is queued for the next socket.
            self.outbound.lock().await.sink = None;
            let _ = self.resets.send(());

            let attempt = self.attempt.fetch_add(1, Ordering::Relaxed);
            let delay = self.options.reconnect_delay.delay(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling websocket reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = transport::wait_closed(&mut closed) => return,
            }
        }
    }
}

/// A self-healing client WebSocket [`Transport`].
pub struct WebSocketLink {
    state: Arc<LinkState>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl WebSocketLink {
    /// Starts connecting in the background and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(options: WebSocketLinkOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (resets, _) = broadcast::channel(16);

        let state = Arc::new(LinkState {
            options,
            outbound: Mutex::new(Outbound { sink: None, queue: VecDeque::new() }),
            attempt: AtomicU32::new(0),
            closed: watch::Sender::new(false),
            resets,
        });

        tokio::spawn(state.clone().run(inbound_tx));

        Self {
            state,
            inbound: Mutex::new(inbound_rx),
        }
    }

    /// Number of failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.state.attempt.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketLink {
    async fn send(&self, frame: &str) -> transport::Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }

        let mut outbound = self.state.outbound.lock().await;
        if let Some(sink) = outbound.sink.as_mut() {
            match sink.send(Message::Text(frame.to_owned())).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    // The supervisor notices the dead socket on its read side.
                    tracing::debug!(error = %e, "websocket send failed, queueing frame");
                    outbound.sink = None;
                }
            }
        }
        outbound.queue.push_back(frame.to_owned());
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<String>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) {
        if self.state.closed.send_replace(true) {
            return;
        }

        let mut outbound = self.state.outbound.lock().await;
        outbound.queue.clear();
        if let Some(mut sink) = outbound.sink.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "websocket close failed");
            }
        }
    }

    fn resets(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.state.resets.subscribe())
    }
}
