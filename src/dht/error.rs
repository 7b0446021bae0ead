use std::fmt;

use thiserror::Error;

use crate::constants::{
    ERROR_CAS_MISMATCH, ERROR_GENERIC, ERROR_INVALID_SIGNATURE, ERROR_MESSAGE_TOO_BIG,
    ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL, ERROR_SALT_TOO_BIG, ERROR_SEQUENCE_TOO_LOW,
    ERROR_SERVER,
};

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A query we can parse far enough to answer, but not far enough to
    /// handle. The receive loop replies with `error`.
    #[error("rejected query: {error}")]
    BadQuery {
        transaction_id: bytes::Bytes,
        error: ProtocolError,
    },

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("timeout")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("remote error: {0}")]
    Remote(ProtocolError),

    #[error("persistence error: {0}")]
    Persist(#[from] serde_json::Error),

    #[error("query cancelled")]
    Cancelled,
}

/// A KRPC error, sent as `{"y": "e", "e": [code, message]}`.
///
/// Query handlers return this to reject a request; the receive loop turns
/// it into an error reply carrying the request's transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ERROR_GENERIC, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ERROR_SERVER, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ERROR_PROTOCOL, message)
    }

    pub fn bad_token() -> Self {
        Self::protocol("bad token")
    }

    pub fn method_unknown(method: &str) -> Self {
        Self::new(ERROR_METHOD_UNKNOWN, format!("method unknown: {}", method))
    }

    pub fn message_too_big() -> Self {
        Self::new(ERROR_MESSAGE_TOO_BIG, "message (v field) too big")
    }

    pub fn invalid_signature() -> Self {
        Self::new(ERROR_INVALID_SIGNATURE, "invalid signature")
    }

    pub fn salt_too_big() -> Self {
        Self::new(ERROR_SALT_TOO_BIG, "salt (salt field) too big")
    }

    pub fn cas_mismatch() -> Self {
        Self::new(ERROR_CAS_MISMATCH, "CAS mismatch")
    }

    pub fn sequence_too_low() -> Self {
        Self::new(ERROR_SEQUENCE_TOO_LOW, "sequence number less than current")
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for DhtError {
    fn from(err: ProtocolError) -> Self {
        DhtError::Remote(err)
    }
}
