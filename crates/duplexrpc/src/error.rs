//! # Error Definitions
//!
//! Failures raised while turning frames into envelopes and back.
//!
//! None of these are ever sent to the peer: a frame that cannot be decoded has
//! no usable `id`, so the receiving side can only log it and move on.

/// Operational failures within the envelope codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The frame was not valid text for the configured transformer (e.g. broken JSON).
    Parse(String),
    /// A value could not be turned into a frame.
    Serialize(String),
    /// The frame carried a protocol tag other than [`crate::PROTOCOL`].
    ProtocolMismatch(String),
    /// The frame parsed but does not have the shape of an envelope of the expected direction.
    InvalidEnvelope(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "Malformed frame: {}", msg),
            Self::Serialize(msg) => write!(f, "Failed to serialize frame: {}", msg),
            Self::ProtocolMismatch(found) => {
                write!(f, "Protocol mismatch: expected {}, found {}", crate::PROTOCOL, found)
            }
            Self::InvalidEnvelope(msg) => write!(f, "Invalid envelope: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for envelope operations.
pub type Result<T> = std::result::Result<T, Error>;
