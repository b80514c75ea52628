//! # RPC Server
//!
//! Serves one [`Router`] over any number of connections. Each connection gets
//! its own context value and its own subscription table; nothing is shared
//! between connections except the router.
//!
//! Per connection:
//! - every inbound frame is decoded and dispatched on its own task, so a slow
//!   handler never blocks the read loop;
//! - a Request produces exactly one Response (a subscription's Response is
//!   its acknowledgement and precedes all of its Events);
//! - a Cancel disposes the matching subscription, if any;
//! - when the transport closes, every live subscription is disposed.
//!
//! Frames that fail to decode are logged and ignored.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use duplexrpc::ClientEnvelope;
use duplexrpc::Json;
use duplexrpc::RequestEnvelope;
use duplexrpc::ResponseEnvelope;
use duplexrpc::RouteType;
use duplexrpc::ServerEnvelope;
use duplexrpc::Transformer;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::route::Outcome;
use crate::route::RouteError;
use crate::router::Router;
use crate::subscription::ActiveSubscription;
use crate::subscription::Emitter;
use crate::subscription::SubscriptionTable;
use crate::transport::Transport;

/// What the caller sees for any error that is not an explicit failure.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Clone)]
pub struct ServerOptions {
    pub transformer: Arc<dyn Transformer>,
}

impl ServerOptions {
    pub fn transformer(mut self, transformer: impl Transformer) -> Self {
        self.transformer = Arc::new(transformer);
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { transformer: Arc::new(Json) }
    }
}

/// Encodes and sends server envelopes on one connection.
pub(crate) struct Responder {
    transport: Arc<dyn Transport>,
    transformer: Arc<dyn Transformer>,
}

impl Responder {
    /// Send failures are logged; the connection's read loop notices a dead transport on its own.
    pub(crate) async fn send(&self, envelope: ServerEnvelope) {
        let frame = match envelope.encode(&*self.transformer) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(id = %envelope.id(), error = %e, "failed to encode server message");
                return;
            }
        };

        if let Err(e) = self.transport.send(&frame).await {
            tracing::warn!(id = %envelope.id(), error = %e, "failed to send server message");
        }
    }
}

pub struct Server<C> {
    router: Arc<Router<C>>,
    transformer: Arc<dyn Transformer>,
}

impl<C> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            transformer: Arc::clone(&self.transformer),
        }
    }
}

impl<C> Server<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(router: Router<C>) -> Self {
        Self::with_options(router, ServerOptions::default())
    }

    pub fn with_options(router: Router<C>, options: ServerOptions) -> Self {
        Self {
            router: Arc::new(router),
            transformer: options.transformer,
        }
    }

    pub fn router(&self) -> &Router<C> {
        &self.router
    }

    /// Starts serving one connection. Must be called within a tokio runtime.
    pub fn handle_connection(&self, context: C, transport: impl Transport) -> ConnectionHandle {
        self.handle_shared_connection(context, Arc::new(transport))
    }

    pub fn handle_shared_connection(&self, context: C, transport: Arc<dyn Transport>) -> ConnectionHandle {
        let subscriptions: Arc<SubscriptionTable> = Arc::default();
        let connection = Arc::new(Connection {
            router: Arc::clone(&self.router),
            context: Arc::new(context),
            responder: Arc::new(Responder {
                transport: Arc::clone(&transport),
                transformer: Arc::clone(&self.transformer),
            }),
            transport,
            transformer: Arc::clone(&self.transformer),
            subscriptions: Arc::clone(&subscriptions),
        });

        let task = tokio::spawn(connection.run());
        ConnectionHandle { task, subscriptions }
    }
}

/// Observes a served connection.
pub struct ConnectionHandle {
    task: JoinHandle<()>,
    subscriptions: Arc<SubscriptionTable>,
}

impl ConnectionHandle {
    /// Number of subscriptions currently live on this connection.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits until the connection's transport has closed and its subscriptions are disposed.
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "connection task failed");
        }
    }
}

struct Connection<C> {
    router: Arc<Router<C>>,
    context: Arc<C>,
    transport: Arc<dyn Transport>,
    transformer: Arc<dyn Transformer>,
    responder: Arc<Responder>,
    subscriptions: Arc<SubscriptionTable>,
}

impl<C> Connection<C>
where
    C: Send + Sync + 'static,
{
    async fn run(self: Arc<Self>) {
        loop {
            let frame = match self.transport.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "connection failed");
                    break;
                }
            };

            match ClientEnvelope::decode(&*self.transformer, &frame) {
                Ok(ClientEnvelope::Request(request)) => self.accept_request(request),
                Ok(ClientEnvelope::Cancel(cancel)) => self.cancel(&cancel.id),
                Err(e) => tracing::error!(error = %e, "ignoring invalid client message"),
            }
        }

        self.dispose_all();
        tracing::debug!("connection closed");
    }

    fn accept_request(self: &Arc<Self>, request: RequestEnvelope) {
        let slot = (request.route_type == RouteType::Subscription).then(|| {
            let active = ActiveSubscription::new(request.id.clone(), Arc::clone(&self.responder));
            if let Some(previous) = self.subscriptions.insert(request.id.clone(), Arc::clone(&active)) {
                previous.dispose();
            }
            active
        });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch(request, slot).await });
    }

    fn cancel(&self, id: &str) {
        if let Some((_, active)) = self.subscriptions.remove(id) {
            active.dispose();
        }
    }

    fn dispose_all(&self) {
        let ids: Vec<String> = self.subscriptions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    fn forget(&self, active: &Arc<ActiveSubscription>) {
        self.subscriptions
            .remove_if(active.id(), |_, current| Arc::ptr_eq(current, active));
    }

    async fn dispatch(&self, request: RequestEnvelope, slot: Option<Arc<ActiveSubscription>>) {
        let path = request.path.join("/");
        let call = self.router.call(
            &request.path,
            request.route_type,
            request.input,
            Arc::clone(&self.context),
        );

        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(RouteError::Internal(anyhow::anyhow!("handler panicked"))),
        };

        match (outcome, slot) {
            (Ok(Outcome::Data(data)), None) => {
                self.responder.send(ResponseEnvelope::success(request.id, data).into()).await;
            }
            (Ok(Outcome::Subscription(subscription)), Some(active)) => {
                self.responder
                    .send(ResponseEnvelope::success(request.id, Value::Null).into())
                    .await;
                self.start(subscription, active);
            }
            (Ok(_), slot) => {
                if let Some(active) = slot {
                    self.forget(&active);
                    active.dispose();
                }
                tracing::error!(%path, "route produced an outcome of the wrong kind");
                self.responder
                    .send(ResponseEnvelope::error(request.id, INTERNAL_ERROR_MESSAGE).into())
                    .await;
            }
            (Err(e), slot) => {
                if let Some(active) = slot {
                    self.forget(&active);
                    active.dispose();
                }
                let message = match e {
                    RouteError::Failure(failure) => failure.message().to_owned(),
                    RouteError::Internal(e) => {
                        tracing::error!(%path, error = ?e, "error during rpc call");
                        INTERNAL_ERROR_MESSAGE.to_owned()
                    }
                };
                self.responder.send(ResponseEnvelope::error(request.id, message).into()).await;
            }
        }
    }

    fn start(&self, subscription: crate::subscription::Subscription, active: Arc<ActiveSubscription>) {
        if active.is_disposed() {
            tracing::debug!(id = %active.id(), "subscription cancelled before it started");
            return;
        }

        let emitter = Emitter::new(Arc::clone(&active), Arc::downgrade(&self.subscriptions));
        match std::panic::catch_unwind(AssertUnwindSafe(|| subscription.start(emitter))) {
            Ok(disposer) => active.attach(disposer),
            Err(_) => {
                tracing::error!(id = %active.id(), "subscription producer panicked while starting");
                self.forget(&active);
                active.dispose();
            }
        }
    }
}
