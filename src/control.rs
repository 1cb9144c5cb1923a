//! Control-plane commands and message bodies.
//!
//! Control packets (heartbeat, auth, reconnect, close) are handled inside the
//! session layer and never reach push subscribers. Message bodies are
//! hand-written prost structs that also derive serde so they can travel under
//! either negotiated body codec.

use serde::{Deserialize, Serialize};

/// Control command codes, carried in the low 8 bits of `cmd_code`.
pub mod cmd {
    pub const CLOSE: u32 = 0;
    pub const HEARTBEAT: u32 = 1;
    pub const AUTH: u32 = 2;
    pub const RECONNECT: u32 = 3;
}

/// A cmd is control iff its code is at most the reconnect command.
#[inline]
pub fn is_control(cmd_code: u32) -> bool {
    cmd_code <= cmd::RECONNECT
}

#[inline]
pub fn is_close(cmd_code: u32) -> bool {
    cmd_code == cmd::CLOSE
}

#[inline]
pub fn is_heartbeat(cmd_code: u32) -> bool {
    cmd_code == cmd::HEARTBEAT
}

#[inline]
pub fn is_auth(cmd_code: u32) -> bool {
    cmd_code == cmd::AUTH
}

#[inline]
pub fn is_reconnect(cmd_code: u32) -> bool {
    cmd_code == cmd::RECONNECT
}

/// Keepalive payload exchanged on heartbeat packets.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender clock, milliseconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub timestamp: i64,

    /// Request id of the heartbeat, echoed back in pongs so the sender can
    /// match them without relying on transport framing.
    #[prost(int32, optional, tag = "2")]
    pub heartbeat_id: Option<i32>,
}

/// Token-based authentication request.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct AuthRequest {
    #[prost(string, tag = "1")]
    pub token: String,
}

/// Session grant returned by auth and session-resume requests.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct AuthResponse {
    /// Opaque session identifier, presented again when resuming.
    #[prost(string, tag = "1")]
    pub session_id: String,

    /// Absolute session expiry, milliseconds since the Unix epoch.
    #[prost(int64, tag = "2")]
    pub expires: i64,

    /// Server-side per-session request limit, zero when unlimited.
    #[prost(int32, tag = "3")]
    pub limit: i32,

    /// Concurrent online sessions for the account.
    #[prost(int32, tag = "4")]
    pub online: i32,
}

/// Session-resume request carrying the previously granted session id.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ReconnectRequest {
    #[prost(string, tag = "1")]
    pub session_id: String,
}

/// Close notification pushed by the server before it drops the connection.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct Close {
    #[prost(int32, tag = "1")]
    pub code: i32,

    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Error payload carried by responses with a non-zero status code.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ErrorBody {
    #[prost(uint64, tag = "1")]
    pub code: u64,

    #[prost(string, tag = "2")]
    pub msg: String,
}
