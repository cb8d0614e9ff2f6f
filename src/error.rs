use thiserror::Error;

/// Errors raised while decoding or encoding bencode values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("value of kind {0} cannot be bencoded")]
    UnsupportedType(&'static str),

    #[error("malformed bencode at byte {0}")]
    Malformed(usize),

    #[error("expected {expected} for field {field:?}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
}

/// Errors raised while building or parsing DHT KRPC messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad field {field:?}: {reason}")]
    BadField {
        field: &'static str,
        reason: &'static str,
    },

    #[error("field {field:?} length {got} is not a multiple of {expected_multiple_of}")]
    BadLength {
        field: &'static str,
        expected_multiple_of: usize,
        got: usize,
    },
}

/// The error type threaded through the routing table and engine layers.
/// Bencode and KRPC parse errors never reach it: they're wire-level noise
/// handled locally where a datagram is decoded (logged, and answered with
/// an error 203 for malformed queries), not escalated to the caller.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, DhtError>;
