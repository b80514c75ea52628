//! # RPC Client with Async Pump
//!
//! One `Client` drives one transport. Three background tasks cooperate:
//!
//! - the **writer** sends outbound frames in the order they were queued, so a
//!   Cancel can never overtake the Request it refers to;
//! - the **pump** decodes inbound frames, completes pending calls by id and
//!   feeds subscription callbacks;
//! - the **reset watcher** (only for transports that report resets) re-sends
//!   the original Request of every live subscription after a reconnect.
//!
//! When the inbound side ends, on [`Client::close`], or once the last client
//! and subscription handle is dropped, every pending call fails with
//! [`Error::ConnectionClosed`] and all subscriptions are dropped.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use dashmap::DashMap;
use duplexrpc::CancelEnvelope;
use duplexrpc::ClientEnvelope;
use duplexrpc::Json;
use duplexrpc::RequestEnvelope;
use duplexrpc::RouteType;
use duplexrpc::RpcResult;
use duplexrpc::ServerEnvelope;
use duplexrpc::Transformer;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Transport(transport::Error),
    Protocol(duplexrpc::Error),
    /// The server answered with an Error result; carries its message.
    Remote(String),
    ConnectionClosed,
    InvalidVerb(String),
    Serialize(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Remote(message) => f.write_str(message),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::InvalidVerb(verb) => write!(
                f,
                "Invalid route verb \"{}\", should be one of query, mutate, subscribe",
                verb
            ),
            Self::Serialize(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<duplexrpc::Error> for Error {
    fn from(e: duplexrpc::Error) -> Self {
        Self::Protocol(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct ClientOptions {
    pub transformer: Arc<dyn Transformer>,
}

impl ClientOptions {
    pub fn transformer(mut self, transformer: impl Transformer) -> Self {
        self.transformer = Arc::new(transformer);
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { transformer: Arc::new(Json) }
    }
}

type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

/// Callbacks for a subscription.
#[derive(Clone)]
pub struct SubscriptionOptions {
    on_data: DataCallback,
    on_error: Option<ErrorCallback>,
}

impl SubscriptionOptions {
    pub fn new(on_data: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self { on_data: Arc::new(on_data), on_error: None }
    }

    /// Called if the server rejects the subscription. Without it, the rejection is logged.
    pub fn on_error(mut self, on_error: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

enum PendingCall {
    Waiting(oneshot::Sender<Result<Value>>),
    /// Placeholder for a re-sent subscription request; its response is dropped.
    Discard,
}

struct SubscriptionEntry {
    request: RequestEnvelope,
    on_data: DataCallback,
}

struct Outgoing {
    frame: String,
    sent: Option<oneshot::Sender<transport::Result<()>>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    transformer: Arc<dyn Transformer>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    pending: DashMap<String, PendingCall>,
    subscriptions: DashMap<String, SubscriptionEntry>,
    next_id: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn encode(&self, envelope: &ClientEnvelope) -> Result<String> {
        Ok(envelope.encode(&*self.transformer)?)
    }

    fn enqueue(&self, frame: String, sent: Option<oneshot::Sender<transport::Result<()>>>) {
        if self.outbox.send(Outgoing { frame, sent }).is_err() {
            tracing::debug!("client writer has stopped");
        }
    }

    fn handle_frame(&self, frame: &str) {
        let envelope = match ServerEnvelope::decode(&*self.transformer, frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "ignoring invalid server message");
                return;
            }
        };

        match envelope {
            ServerEnvelope::Response(response) => match self.pending.remove(&response.id) {
                Some((_, PendingCall::Waiting(tx))) => {
                    let result = match response.result {
                        RpcResult::Success { data } => Ok(data),
                        RpcResult::Error { message } => Err(Error::Remote(message)),
                    };
                    let _ = tx.send(result);
                }
                Some((_, PendingCall::Discard)) => {}
                None => tracing::error!(id = %response.id, "response for unknown request id"),
            },
            ServerEnvelope::Event(event) => {
                // Clone the callback out so no map guard is held while user code runs.
                let on_data = self.subscriptions.get(&event.id).map(|entry| Arc::clone(&entry.on_data));
                if let Some(on_data) = on_data {
                    for item in event.data {
                        on_data(item);
                    }
                }
            }
        }
    }

    fn resubscribe(&self) {
        let requests: Vec<RequestEnvelope> =
            self.subscriptions.iter().map(|entry| entry.request.clone()).collect();
        tracing::debug!(count = requests.len(), "connection reset, resubscribing");

        for request in requests {
            let id = request.id.clone();
            match self.encode(&request.into()) {
                Ok(frame) => {
                    self.pending.entry(id).or_insert(PendingCall::Discard);
                    self.enqueue(frame, None);
                }
                Err(e) => tracing::error!(%id, error = %e, "failed to encode resubscription"),
            }
        }
    }

    fn fail_pending(&self, error: Error) {
        let keys: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, PendingCall::Waiting(tx))) = self.pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    fn shutdown(&self) {
        self.closed.send_replace(true);
        self.fail_pending(Error::ConnectionClosed);
        self.subscriptions.clear();
    }
}

/// Removes a call's pending entry when its future completes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

/// Shuts the connection down once the last user-facing handle is gone.
///
/// Background tasks hold [`Shared`] directly and do not keep this alive.
struct CloseOnDrop {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.shared.is_closed() {
            return;
        }
        tracing::debug!("last client handle dropped, closing connection");
        self.shared.shutdown();
        let transport = Arc::clone(&self.shared.transport);
        self.runtime.spawn(async move { transport.close().await });
    }
}

/// RPC client for making remote calls over a transport.
///
/// Cheap to clone; clones share the connection. When every clone and every
/// [`SubscriptionHandle`] is dropped, the connection is closed as if by
/// [`Client::close`].
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    owner: Arc<CloseOnDrop>,
}

impl Client {
    /// Takes ownership of the transport and spawns the client's background tasks.
    /// Must be called within a tokio runtime.
    pub fn new(transport: impl Transport) -> Self {
        Self::with_options(transport, ClientOptions::default())
    }

    pub fn with_options(transport: impl Transport, options: ClientOptions) -> Self {
        Self::with_shared_transport(Arc::new(transport), options)
    }

    pub fn with_shared_transport(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        let (outbox, outgoing) = mpsc::unbounded_channel();
        let resets = transport.resets();

        let shared = Arc::new(Shared {
            transport: Arc::clone(&transport),
            transformer: options.transformer,
            outbox,
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: watch::Sender::new(false),
        });

        tokio::spawn(write_loop(transport, outgoing));
        tokio::spawn(pump(Arc::clone(&shared)));
        if let Some(resets) = resets {
            tokio::spawn(watch_resets(Arc::downgrade(&shared), resets, shared.closed.subscribe()));
        }

        let owner = Arc::new(CloseOnDrop { shared: Arc::clone(&shared), runtime: Handle::current() });
        Self { shared, owner }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Requests still waiting for a response, including unacknowledged subscriptions.
    pub fn pending_calls(&self) -> usize {
        self.shared
            .pending
            .iter()
            .filter(|entry| matches!(entry.value(), PendingCall::Waiting(_)))
            .count()
    }

    /// Performs a query or mutation and waits for its result.
    pub async fn call(&self, path: &[&str], kind: RouteType, input: Value) -> Result<Value> {
        self.request(owned_path(path), kind, input).await
    }

    pub async fn query(&self, path: &[&str], input: impl Serialize) -> Result<Value> {
        self.request(owned_path(path), RouteType::Query, to_input(input)?).await
    }

    pub async fn mutate(&self, path: &[&str], input: impl Serialize) -> Result<Value> {
        self.request(owned_path(path), RouteType::Mutation, to_input(input)?).await
    }

    /// Starts a subscription and returns without waiting for the server's acknowledgement.
    pub fn subscribe(
        &self,
        path: &[&str],
        input: impl Serialize,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle> {
        self.start_subscription(owned_path(path), to_input(input)?, options)
    }

    /// Like [`Client::subscribe`], delivering data (and a rejection, if any) as a stream.
    pub fn subscribe_stream(&self, path: &[&str], input: impl Serialize) -> Result<SubscriptionStream> {
        self.start_stream(owned_path(path), to_input(input)?)
    }

    /// Closes the transport, fails pending calls and drops every subscription.
    pub async fn close(&self) {
        self.shared.shutdown();
        self.shared.transport.close().await;
    }

    pub(crate) async fn request(&self, path: Vec<String>, kind: RouteType, input: Value) -> Result<Value> {
        if kind == RouteType::Subscription {
            return Err(Error::Protocol(duplexrpc::Error::InvalidEnvelope(
                "subscriptions are started with subscribe".into(),
            )));
        }
        if self.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.shared.next_id();
        let frame = self.shared.encode(&RequestEnvelope::new(id.clone(), path, kind, input).into())?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id.clone(), PendingCall::Waiting(tx));
        let _guard = PendingGuard { shared: &*self.shared, id };
        if self.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let (sent_tx, sent_rx) = oneshot::channel();
        self.shared.enqueue(frame, Some(sent_tx));
        match sent_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::ConnectionClosed),
        }

        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    pub(crate) fn start_subscription(
        &self,
        path: Vec<String>,
        input: Value,
        options: SubscriptionOptions,
    ) -> Result<SubscriptionHandle> {
        if self.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = self.shared.next_id();
        let request = RequestEnvelope::new(id.clone(), path, RouteType::Subscription, input);
        let frame = self.shared.encode(&request.clone().into())?;

        // The entry exists before the request leaves, so no event can miss it.
        self.shared.subscriptions.insert(
            id.clone(),
            SubscriptionEntry { request, on_data: options.on_data },
        );
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id.clone(), PendingCall::Waiting(tx));
        self.shared.enqueue(frame, None);

        let shared = Arc::clone(&self.shared);
        let ack_id = id.clone();
        let on_error = options.on_error;
        tokio::spawn(async move {
            let Err(e) = rx.await.unwrap_or(Err(Error::ConnectionClosed)) else {
                return;
            };
            if shared.subscriptions.remove(&ack_id).is_none() {
                return;
            }
            match on_error {
                Some(on_error) => on_error(e),
                None => tracing::error!(id = %ack_id, error = %e, "subscription rejected"),
            }
        });

        Ok(SubscriptionHandle {
            shared: Arc::clone(&self.shared),
            _owner: Arc::clone(&self.owner),
            id,
            disposed: AtomicBool::new(false),
        })
    }

    pub(crate) fn start_stream(&self, path: Vec<String>, input: Value) -> Result<SubscriptionStream> {
        let (tx, items) = mpsc::unbounded_channel();
        let data_tx = tx.clone();
        let options = SubscriptionOptions::new(move |value| {
            let _ = data_tx.send(Ok(value));
        })
        .on_error(move |e| {
            let _ = tx.send(Err(e));
        });

        let handle = self.start_subscription(path, input, options)?;
        Ok(SubscriptionStream { handle, items })
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pending", &self.pending_calls())
            .field("subscriptions", &self.shared.subscriptions.len())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

fn owned_path(path: &[&str]) -> Vec<String> {
    path.iter().map(|segment| (*segment).to_owned()).collect()
}

pub(crate) fn to_input(input: impl Serialize) -> Result<Value> {
    serde_json::to_value(input).map_err(|e| Error::Serialize(e.to_string()))
}

async fn write_loop(transport: Arc<dyn Transport>, mut outgoing: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(Outgoing { frame, sent }) = outgoing.recv().await {
        let result = transport.send(&frame).await;
        match sent {
            Some(sent) => {
                let _ = sent.send(result);
            }
            None => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to send client message");
                }
            }
        }
    }
}

async fn pump(shared: Arc<Shared>) {
    let mut closed = shared.closed.subscribe();
    loop {
        let frame = tokio::select! {
            frame = shared.transport.recv() => frame,
            _ = transport::wait_closed(&mut closed) => break,
        };

        match frame {
            Ok(Some(frame)) => shared.handle_frame(&frame),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "transport error in client pump");
                break;
            }
        }
    }

    shared.shutdown();
}

async fn watch_resets(
    shared: Weak<Shared>,
    mut resets: broadcast::Receiver<()>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            reset = resets.recv() => match reset {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = transport::wait_closed(&mut closed) => break,
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.resubscribe();
    }
}

/// Cancels one subscription. Dropping the handle does not cancel.
pub struct SubscriptionHandle {
    shared: Arc<Shared>,
    _owner: Arc<CloseOnDrop>,
    id: String,
    disposed: AtomicBool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Forgets the subscription locally and sends a Cancel. Idempotent.
    ///
    /// Safe before the acknowledgement arrives; events already in flight are dropped.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.subscriptions.remove(&self.id);
        if self.shared.is_closed() {
            return;
        }

        match self.shared.encode(&CancelEnvelope::new(self.id.clone()).into()) {
            Ok(frame) => self.shared.enqueue(frame, None),
            Err(e) => tracing::error!(id = %self.id, error = %e, "failed to encode cancel"),
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A subscription consumed as a [`Stream`]. Dropping it disposes the subscription.
///
/// Yields `Err` once if the server rejects the subscription, then ends. Also
/// ends when the connection closes.
pub struct SubscriptionStream {
    handle: SubscriptionHandle,
    items: mpsc::UnboundedReceiver<Result<Value>>,
}

impl SubscriptionStream {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn dispose(&self) {
        self.handle.dispose();
    }
}

impl Stream for SubscriptionStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.handle.dispose();
    }
}

impl fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionStream").field("id", &self.handle.id()).finish()
    }
}
