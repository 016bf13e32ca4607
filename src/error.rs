//! Error types for peerwire.

use thiserror::Error;

/// Main error type for all peerwire operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (oversized frame, corrupt stream, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No method registered under the given name.
    #[error("method not found:{0}")]
    MethodNotFound(String),

    /// A method is already registered under the given name.
    #[error("rpc method repeated:{0}")]
    DuplicateMethod(String),

    /// A hook is already registered under the given name.
    #[error("hook already registered:{0}")]
    HookExists(String),

    /// A registered method panicked during invocation.
    #[error("method invocation fault:{0}")]
    InvokeFault(String),

    /// The peer answered with an error-flagged response; the message is the
    /// response body.
    #[error("remote error: {0}")]
    Remote(String),

    /// A pending request was not answered before its expiry.
    #[error("request timeout")]
    Timeout,

    /// The peer stayed silent past the keepalive timeout.
    #[error("connection timeout")]
    KeepaliveTimeout,

    /// Connection closed (explicitly or by transport failure).
    #[error("connection closed")]
    ConnectionClosed,

    /// `start` was called while a connection is already live.
    #[error("already connected")]
    AlreadyConnected,

    /// A call was issued with no live connection.
    #[error("not connected")]
    NotConnected,
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
