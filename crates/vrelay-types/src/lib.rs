//! Shared types for the voucher relay protocol.
//!
//! - Fixed-width identifiers (`Address`, `Hash32`, `RecoverableSignature`)
//! - The error taxonomy every protocol rejection maps into
//! - Cross-chain messages and the events each chain emits

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod events;
pub mod messages;
pub mod params;
pub mod primitives;
pub mod serde_hex;

pub use events::{EventFilter, EventKind, LoggedEvent, ProtocolEvent, SlashReason};
pub use messages::{DeliveryAttestation, DeliveryVerdict, SlashReport, StakeSnapshot};
pub use params::ProtocolParams;
pub use primitives::{Address, Hash32, RecoverableSignature};

/// Smallest-unit asset amount.
pub type Amount = u128;

/// Block height on a single chain.
pub type BlockNumber = u64;

/// Chain identifier.
pub type ChainId = u64;

/// Hub chain wall-clock time, in seconds.
pub type Timestamp = u64;

/// 0x-prefixed hex string (e.g. "0x1234...").
pub type Hex = String;

/// Voucher relay error types.
///
/// The first five variants are on-chain rejections; the message names the
/// precondition that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("too early: {0}")]
    Timing(String),

    #[error("economic failure: {0}")]
    Economic(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Coarse classification used by automated relayers to decide whether to
/// retry, re-bid or abandon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Precondition,
    Authorization,
    Timing,
    Economic,
    Crypto,
    Transport,
    Codec,
    Config,
    Other,
}

impl ErrorKind {
    /// Whether the same call may succeed later without changing its parameters.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Timing)
    }
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Validation(_) => ErrorKind::Validation,
            RelayError::Precondition(_) => ErrorKind::Precondition,
            RelayError::Authorization(_) => ErrorKind::Authorization,
            RelayError::Timing(_) => ErrorKind::Timing,
            RelayError::Economic(_) => ErrorKind::Economic,
            RelayError::Crypto(_) | RelayError::InvalidHex(_) => ErrorKind::Crypto,
            RelayError::Transport(_) => ErrorKind::Transport,
            RelayError::Codec(_) => ErrorKind::Codec,
            RelayError::Config(_) => ErrorKind::Config,
            RelayError::Other(_) => ErrorKind::Other,
        }
    }

    /// The bare message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            RelayError::Validation(m)
            | RelayError::Precondition(m)
            | RelayError::Authorization(m)
            | RelayError::Timing(m)
            | RelayError::Economic(m)
            | RelayError::Crypto(m)
            | RelayError::InvalidHex(m)
            | RelayError::Transport(m)
            | RelayError::Codec(m)
            | RelayError::Config(m)
            | RelayError::Other(m) => m,
        }
    }

    /// Rebuild an error from its wire form (`kind` + `message`).
    pub fn from_parts(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => RelayError::Validation(message),
            ErrorKind::Precondition => RelayError::Precondition(message),
            ErrorKind::Authorization => RelayError::Authorization(message),
            ErrorKind::Timing => RelayError::Timing(message),
            ErrorKind::Economic => RelayError::Economic(message),
            ErrorKind::Crypto => RelayError::Crypto(message),
            ErrorKind::Transport => RelayError::Transport(message),
            ErrorKind::Codec => RelayError::Codec(message),
            ErrorKind::Config => RelayError::Config(message),
            ErrorKind::Other => RelayError::Other(message),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Codec(e.to_string())
    }
}

/// Parse a hex string (with or without `0x`) to bytes.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| RelayError::InvalidHex(e.to_string()))
}

/// Convert bytes to a 0x-prefixed hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}
