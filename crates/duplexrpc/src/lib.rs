//! # duplexrpc
//!
//! The wire format of a small RPC protocol for queries, mutations and
//! push-style subscriptions over any ordered, bidirectional text transport.
//!
//! ## Architecture
//!
//! - **Envelopes**: four tagged message kinds, split by direction
//!   ([`ClientEnvelope`], [`ServerEnvelope`]).
//! - **Codec**: a [`Transformer`] turns value trees into frames; [`Json`] is the default.
//!
//! Routing, connection state and reconnection live in `duplexrun`; this crate
//! only knows how to build and validate frames.

pub mod codec;
pub mod envelope;
pub mod error;

pub use codec::Json;
pub use codec::Transformer;
pub use envelope::CancelEnvelope;
pub use envelope::ClientEnvelope;
pub use envelope::EventEnvelope;
pub use envelope::ProtocolTag;
pub use envelope::RequestEnvelope;
pub use envelope::ResponseEnvelope;
pub use envelope::RouteType;
pub use envelope::RpcResult;
pub use envelope::ServerEnvelope;
pub use envelope::PROTOCOL;
pub use error::Error;
pub use error::Result;

#[cfg(test)]
mod tests;
