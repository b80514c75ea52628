//! # duplexrun
//!
//! Runtime for the `duplexrpc` protocol: routers and servers on one end,
//! clients on the other, and the transports that connect them.
//!
//! ## Architecture
//!
//! - [`route`] / [`router`]: declare operations and resolve paths to them.
//! - [`server`]: serves a router per connection, with batched subscription events.
//! - [`client`]: correlates calls by id and resumes subscriptions after a reset.
//! - [`proxy`]: path-building call surface over the client.
//! - [`transport`]: in-process channels, length-prefixed byte streams and WebSockets.
//! - [`backoff`]: reconnect delay policy.

pub mod backoff;
pub mod client;
pub mod proxy;
pub mod route;
pub mod router;
pub mod server;
pub mod subscription;
pub mod transport;

pub use backoff::BackoffConfig;
pub use backoff::ReconnectDelay;
pub use client::Client;
pub use client::ClientOptions;
pub use client::SubscriptionHandle;
pub use client::SubscriptionOptions;
pub use client::SubscriptionStream;
pub use proxy::Invocation;
pub use proxy::RoutePath;
pub use proxy::Verb;
pub use route::AnyInput;
pub use route::Failure;
pub use route::HandlerResult;
pub use route::InputContract;
pub use route::Params;
pub use route::Route;
pub use route::RouteError;
pub use route::Typed;
pub use router::Router;
pub use server::ConnectionHandle;
pub use server::Server;
pub use server::ServerOptions;
pub use subscription::Disposer;
pub use subscription::Emitter;
pub use subscription::Subscription;
pub use transport::Transport;
