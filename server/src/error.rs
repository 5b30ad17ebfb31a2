//! Error taxonomy for the connection core and the content store.
//!
//! Handshake failures are detailed here for server-side logging only. At the
//! connection boundary every `HandshakeError` collapses into a single rejection
//! so a client can never tell an unknown user from a wrong secret.

use thiserror::Error;

/// Failure while filling a connection's receive buffer.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Peer closed the stream before the target length was reached
    #[error("connection closed after {received} of {target} bytes")]
    Closed { received: usize, target: usize },

    /// No bytes arrived for the configured number of ticks
    #[error("receive timed out after {ticks} idle ticks")]
    TimedOut { ticks: u32 },

    /// Requested frame does not fit in the receive buffer
    #[error("frame of {target} bytes exceeds buffer capacity {capacity}")]
    FrameTooLarge { target: usize, capacity: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Symmetric cipher failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Key is not 16, 24 or 32 bytes long (cipher construction failed)
    #[error("invalid cipher key length {0}, expected 16, 24 or 32")]
    InvalidKeyLength(usize),

    /// Ciphertext is shorter than the announced plaintext
    #[error("ciphertext of {actual} bytes cannot hold {expected} plaintext bytes")]
    Truncated { expected: usize, actual: usize },
}

/// Session registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A live session already exists for this username
    #[error("user {0} already has an active session")]
    Conflict(String),

    /// The presented secret is not the owner's live session token
    #[error("reconnect token mismatch")]
    TokenMismatch,

    /// The owner already has the maximum number of bound channels
    #[error("transmission channel limit {0} reached")]
    ChannelLimit(usize),
}

/// Reasons a handshake is rejected. Never sent to the client.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("receive failed: {0}")]
    Receive(#[from] ReceiveError),

    #[error("cipher failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("malformed credential header: {0}")]
    MalformedHeader(String),

    #[error("authentication rejected")]
    AuthRejected,

    #[error("credential lookup failed: {0}")]
    Persistence(String),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
}

/// Content store failures. Fatal for the operation that raised them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DB lock error: {0}")]
    Lock(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path already exists: {0}")]
    PathExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Share link password missing or wrong
    #[error("share link access denied")]
    AccessDenied,
}
