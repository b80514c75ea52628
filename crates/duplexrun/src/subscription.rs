//! # Server-side subscriptions
//!
//! A subscription handler hands back a [`Subscription`]: a function that is
//! given an [`Emitter`] once the request has been acknowledged and returns a
//! [`Disposer`] that tears the producer down.
//!
//! ## Batching
//!
//! Emitted items are queued per subscription and flushed as one Event
//! envelope on the next scheduler tick. A batch never exceeds
//! [`MAX_BATCH_SIZE`] items.
//!
//! - [`Emitter::emit`] enqueues without waiting.
//! - [`Emitter::send`] waits while the queue is full, until the pending flush
//!   (including the transport send) has completed.
//!
//! Items are delivered in the order they were accepted.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use duplexrpc::EventEnvelope;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::server::Responder;

/// Largest number of items carried by one Event envelope.
pub const MAX_BATCH_SIZE: usize = 100;

/// Stops a running subscription producer. Runs at most once.
pub struct Disposer(Box<dyn FnOnce() + Send>);

impl Disposer {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(dispose))
    }

    /// A disposer with nothing to tear down.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub fn dispose(self) {
        (self.0)()
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disposer(..)")
    }
}

/// The deferred producer returned by a subscription handler.
pub struct Subscription(Box<dyn FnOnce(Emitter) -> Disposer + Send>);

impl Subscription {
    pub fn new(start: impl FnOnce(Emitter) -> Disposer + Send + 'static) -> Self {
        Self(Box::new(start))
    }

    pub(crate) fn start(self, emitter: Emitter) -> Disposer {
        (self.0)(emitter)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription(..)")
    }
}

pub(crate) type SubscriptionTable = DashMap<String, Arc<ActiveSubscription>>;

struct Batch {
    queue: Vec<Value>,
    flush_scheduled: bool,
}

/// One live subscription on one connection.
///
/// Registered in the connection's table before the handler runs, so a Cancel
/// that overtakes dispatch still finds it. Flushes run on the runtime that
/// accepted the request, whichever thread the producer emits from.
pub(crate) struct ActiveSubscription {
    id: String,
    responder: Arc<Responder>,
    runtime: Handle,
    batch: Mutex<Batch>,
    flushed: Notify,
    disposed: AtomicBool,
    disposer: Mutex<Option<Disposer>>,
}

impl ActiveSubscription {
    /// Must be called from within the connection's runtime.
    pub(crate) fn new(id: String, responder: Arc<Responder>) -> Arc<Self> {
        Arc::new(Self {
            id,
            responder,
            runtime: Handle::current(),
            batch: Mutex::new(Batch { queue: Vec::new(), flush_scheduled: false }),
            flushed: Notify::new(),
            disposed: AtomicBool::new(false),
            disposer: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stores the producer's disposer, or runs it right away if the
    /// subscription was disposed while the producer was starting.
    pub(crate) fn attach(&self, disposer: Disposer) {
        let run_now = {
            let mut slot = self.disposer.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_disposed() {
                Some(disposer)
            } else {
                *slot = Some(disposer);
                None
            }
        };

        if let Some(disposer) = run_now {
            disposer.dispose();
        }
    }

    /// Marks the subscription disposed and runs its disposer. Idempotent.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let disposer = self.disposer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(disposer) = disposer {
            disposer.dispose();
        }
        self.flushed.notify_waiters();
        tracing::debug!(id = %self.id, "subscription disposed");
    }

    fn push(self: &Arc<Self>, value: Value) {
        if self.is_disposed() {
            return;
        }

        let mut batch = self.batch();
        batch.queue.push(value);
        self.schedule_flush(&mut batch);
    }

    async fn push_when_ready(self: &Arc<Self>, value: Value) {
        loop {
            let notified = self.flushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                if self.is_disposed() {
                    return;
                }
                let mut batch = self.batch();
                if batch.queue.len() < MAX_BATCH_SIZE {
                    batch.queue.push(value);
                    self.schedule_flush(&mut batch);
                    return;
                }
            }

            notified.await;
        }
    }

    fn schedule_flush(self: &Arc<Self>, batch: &mut Batch) {
        if batch.flush_scheduled {
            return;
        }
        batch.flush_scheduled = true;

        let this = Arc::clone(self);
        self.runtime.spawn(async move { this.flush().await });
    }

    fn batch(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(id = %self.id, "subscription batch lock poisoned, recovering");
            self.batch.clear_poison();
            poisoned.into_inner()
        })
    }

    /// Sends queued items, at most [`MAX_BATCH_SIZE`] per envelope, until the queue is empty.
    async fn flush(self: Arc<Self>) {
        loop {
            tokio::task::yield_now().await;

            let items = {
                let mut batch = self.batch();
                if batch.queue.is_empty() {
                    batch.flush_scheduled = false;
                    break;
                }
                let take = batch.queue.len().min(MAX_BATCH_SIZE);
                batch.queue.drain(..take).collect::<Vec<_>>()
            };

            self.responder
                .send(EventEnvelope::new(self.id.clone(), items).into())
                .await;
            self.flushed.notify_waiters();
        }
        self.flushed.notify_waiters();
    }
}

/// Handle a running producer uses to push data to the subscriber.
///
/// Cheap to clone; every clone feeds the same subscription.
#[derive(Clone)]
pub struct Emitter {
    subscription: Arc<ActiveSubscription>,
    table: Weak<SubscriptionTable>,
}

impl Emitter {
    pub(crate) fn new(subscription: Arc<ActiveSubscription>, table: Weak<SubscriptionTable>) -> Self {
        Self { subscription, table }
    }

    /// Queues an item without waiting. Dropped if the subscription is gone.
    pub fn emit(&self, data: impl Serialize) {
        match serde_json::to_value(data) {
            Ok(value) => self.subscription.push(value),
            Err(e) => tracing::error!(id = %self.subscription.id(), error = %e, "failed to serialize subscription data"),
        }
    }

    /// Queues an item, first waiting for room in the current batch.
    pub async fn send(&self, data: impl Serialize) {
        match serde_json::to_value(data) {
            Ok(value) => self.subscription.push_when_ready(value).await,
            Err(e) => tracing::error!(id = %self.subscription.id(), error = %e, "failed to serialize subscription data"),
        }
    }

    /// Finishes the subscription from the producer side.
    ///
    /// Runs the disposer and forgets the subscription. Items already queued are still delivered.
    pub fn end(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove_if(self.subscription.id(), |_, active| Arc::ptr_eq(active, &self.subscription));
        }
        self.subscription.dispose();
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_disposed()
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").field("id", &self.subscription.id()).finish()
    }
}
