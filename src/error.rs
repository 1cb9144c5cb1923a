//! Error types for finwire.

use thiserror::Error;

/// Main error type for all finwire operations.
#[derive(Debug, Error)]
pub enum FinwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protobuf deserialization error.
    #[error("protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),

    /// Body codec is not protobuf or JSON.
    #[error("unknown codec type")]
    UnknownCodec,

    /// Gzip compression or decompression failure.
    #[error("gzip error: {0}")]
    Gzip(std::io::Error),

    /// Handshake frame is not exactly two bytes.
    #[error("invalid handshake frame length")]
    InvalidHandshake,

    /// Protocol version outside the supported set.
    #[error("invalid protocol version: {0}")]
    InvalidProtocolVersion(u8),

    /// Header type nibble is not request, response or push.
    #[error("invalid packet type")]
    UnknownPacketType,

    /// Body length exceeds the 24-bit wire limit.
    #[error("body length hit limit")]
    BodyLenHitLimit,

    /// Frame is shorter than its header promises.
    #[error("invalid frame")]
    InvalidFrame,

    /// Metadata block failed to parse.
    #[error("invalid metadata binary data")]
    InvalidMetadata,

    /// Metadata key longer than 2^15 - 1 bytes.
    #[error("key length should not exceed 2^15 - 1")]
    KeyTooLong,

    /// Metadata value longer than 2^15 - 1 bytes.
    #[error("value length should not exceed 2^15 - 1")]
    ValueTooLong,

    /// Connection is closed; no further reads or writes.
    #[error("connection closed")]
    ConnClosed,

    /// Bounded write queue is saturated; the write was rejected, not queued.
    #[error("write queue full")]
    WriteQueueFull,

    /// No dialer registered for the URL scheme.
    #[error("dialer for scheme {0} not exists")]
    DialerNotFound(String),

    /// Dial address failed to parse.
    #[error("invalid dial address: {0}")]
    InvalidAddress(#[from] url::ParseError),

    /// Transport-level connect did not finish within the dial timeout.
    #[error("dial timeout")]
    DialTimeout,

    /// WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// No response arrived for the request within its timeout.
    #[error("wait for {0} response timeout")]
    RequestTimeout(u32),

    /// The awaiter slot was drained (reconnect or close) before a response.
    #[error("awaiter dropped before response arrived")]
    AwaitDropped,

    /// Reconnect attempts exhausted; the client is closed.
    #[error("hit max reconnect count")]
    HitMaxReconnect,

    /// Error surfaced from a response with a non-zero status code.
    #[error("remote error, status:{status} code:{code} message:{message}")]
    Remote {
        status: u8,
        code: u64,
        message: String,
    },
}

/// Result type alias using FinwireError.
pub type Result<T> = std::result::Result<T, FinwireError>;
