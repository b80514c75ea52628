//! # Codec
//!
//! The translation layer between structured values and text frames.
//!
//! Envelopes are always built as `serde_json::Value` trees first; a
//! [`Transformer`] then decides how a tree becomes a string and back. Any
//! transformer that round-trips through strings is acceptable, including ones
//! that preserve extended value types in their own encoding.

use serde_json::Value;

use crate::error::Error;
use crate::error::Result;

/// Pluggable value <-> frame conversion.
pub trait Transformer: Send + Sync + 'static {
    fn stringify(&self, value: &Value) -> Result<String>;
    fn parse(&self, frame: &str) -> Result<Value>;
}

/// Plain JSON. The default for servers and clients.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl Transformer for Json {
    fn stringify(&self, value: &Value) -> Result<String> {
        serde_json::to_string(value).map_err(|e| Error::Serialize(e.to_string()))
    }

    fn parse(&self, frame: &str) -> Result<Value> {
        serde_json::from_str(frame).map_err(|e| Error::Parse(e.to_string()))
    }
}
