//! # Protocol Envelopes
//!
//! Defines the four discrete messages exchanged between peers.
//!
//! Client to server: `Request`, `Cancel`.
//! Server to client: `Response`, `Event`.
//!
//! ## Invariants
//! - **Tagged**: Every envelope carries the fixed protocol tag and a `type` discriminator.
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown fields inside a known envelope are ignored.

use std::fmt;

use serde::de;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;

use crate::codec::Transformer;
use crate::error::Error;
use crate::error::Result;

/// The protocol tag stamped on every envelope.
pub const PROTOCOL: &str = "dassie-rpc-01";

/// Zero-sized marker for the `protocol` field.
///
/// Serializes to [`PROTOCOL`] and refuses any other string when deserializing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ProtocolTag;

impl Serialize for ProtocolTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(PROTOCOL)
    }
}

impl<'de> Deserialize<'de> for ProtocolTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag == PROTOCOL {
            Ok(ProtocolTag)
        } else {
            Err(de::Error::custom(format!("unknown protocol tag {:?}", tag)))
        }
    }
}

/// The declared kind of a route, and the kind a caller asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    Query,
    Mutation,
    Subscription,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoke the route at `path`. Sent client to server.
///
/// `id` is allocated by the client and unique among its outstanding requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub protocol: ProtocolTag,
    pub id: String,
    pub path: Vec<String>,
    pub route_type: RouteType,
    /// Peers that omit `input` mean "no input"; it decodes as `null`.
    #[serde(default)]
    pub input: Value,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<String>, path: Vec<String>, route_type: RouteType, input: Value) -> Self {
        Self {
            protocol: ProtocolTag,
            id: id.into(),
            path,
            route_type,
            input,
        }
    }
}

/// Terminate a subscription. Sent client to server; idempotent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelEnvelope {
    pub protocol: ProtocolTag,
    pub id: String,
}

impl CancelEnvelope {
    pub fn new(id: impl Into<String>) -> Self {
        Self { protocol: ProtocolTag, id: id.into() }
    }
}

/// Outcome carried by a [`ResponseEnvelope`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcResult {
    Success {
        #[serde(default)]
        data: Value,
    },
    Error {
        message: String,
    },
}

/// Exactly one per request. For subscriptions it acknowledges setup, not output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub protocol: ProtocolTag,
    pub id: String,
    pub result: RpcResult,
}

impl ResponseEnvelope {
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            protocol: ProtocolTag,
            id: id.into(),
            result: RpcResult::Success { data },
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            protocol: ProtocolTag,
            id: id.into(),
            result: RpcResult::Error { message: message.into() },
        }
    }
}

/// A batch of subscription output, in emission order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub protocol: ProtocolTag,
    pub id: String,
    pub data: Vec<Value>,
}

impl EventEnvelope {
    pub fn new(id: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            protocol: ProtocolTag,
            id: id.into(),
            data,
        }
    }
}

/// Envelopes originated by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEnvelope {
    Request(RequestEnvelope),
    Cancel(CancelEnvelope),
}

impl ClientEnvelope {
    pub fn id(&self) -> &str {
        match self {
            Self::Request(request) => &request.id,
            Self::Cancel(cancel) => &cancel.id,
        }
    }

    /// Serialize into a frame.
    pub fn encode(&self, transformer: &dyn Transformer) -> Result<String> {
        encode_frame(transformer, self)
    }

    /// Parse and validate a frame received by a server.
    pub fn decode(transformer: &dyn Transformer, frame: &str) -> Result<Self> {
        decode_frame(transformer, frame)
    }
}

impl From<RequestEnvelope> for ClientEnvelope {
    fn from(request: RequestEnvelope) -> Self {
        Self::Request(request)
    }
}

impl From<CancelEnvelope> for ClientEnvelope {
    fn from(cancel: CancelEnvelope) -> Self {
        Self::Cancel(cancel)
    }
}

/// Envelopes originated by a server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEnvelope {
    Response(ResponseEnvelope),
    Event(EventEnvelope),
}

impl ServerEnvelope {
    pub fn id(&self) -> &str {
        match self {
            Self::Response(response) => &response.id,
            Self::Event(event) => &event.id,
        }
    }

    /// Serialize into a frame.
    pub fn encode(&self, transformer: &dyn Transformer) -> Result<String> {
        encode_frame(transformer, self)
    }

    /// Parse and validate a frame received by a client.
    ///
    /// An event batch must hold at least one item.
    pub fn decode(transformer: &dyn Transformer, frame: &str) -> Result<Self> {
        let envelope: Self = decode_frame(transformer, frame)?;
        if let Self::Event(event) = &envelope {
            if event.data.is_empty() {
                return Err(Error::InvalidEnvelope("event batch is empty".into()));
            }
        }
        Ok(envelope)
    }
}

impl From<ResponseEnvelope> for ServerEnvelope {
    fn from(response: ResponseEnvelope) -> Self {
        Self::Response(response)
    }
}

impl From<EventEnvelope> for ServerEnvelope {
    fn from(event: EventEnvelope) -> Self {
        Self::Event(event)
    }
}

fn encode_frame<T: Serialize>(transformer: &dyn Transformer, envelope: &T) -> Result<String> {
    let value = serde_json::to_value(envelope).map_err(|e| Error::Serialize(e.to_string()))?;
    transformer.stringify(&value)
}

fn decode_frame<T: DeserializeOwned>(transformer: &dyn Transformer, frame: &str) -> Result<T> {
    let value = transformer.parse(frame)?;

    // Checked up front so a foreign tag is reported as such, not as a shape error.
    match value.get("protocol") {
        Some(Value::String(tag)) if tag == PROTOCOL => {}
        Some(Value::String(tag)) => return Err(Error::ProtocolMismatch(tag.clone())),
        Some(other) => return Err(Error::ProtocolMismatch(other.to_string())),
        None => return Err(Error::InvalidEnvelope("missing protocol tag".into())),
    }

    serde_json::from_value(value).map_err(|e| Error::InvalidEnvelope(e.to_string()))
}
