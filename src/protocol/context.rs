//! Per-connection context shared by the codec and the session.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{FinwireError, Result};
use crate::protocol::handshake::{CodecType, Handshake, PlatformType};

/// Supported frame protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            other => Err(FinwireError::InvalidProtocolVersion(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Negotiated parameters plus the request-id generator for one connection.
///
/// Request ids are strictly monotonic per connection, starting at 1; every
/// outbound request on the connection draws from this generator.
#[derive(Debug)]
pub struct ConnContext {
    pub version: ProtocolVersion,
    pub codec: CodecType,
    pub platform: PlatformType,
    next_request_id: AtomicU32,
}

impl ConnContext {
    pub fn new(handshake: &Handshake) -> Result<Self> {
        Ok(Self {
            version: ProtocolVersion::from_u8(handshake.version)?,
            codec: handshake.codec,
            platform: handshake.platform,
            next_request_id: AtomicU32::new(0),
        })
    }

    /// Draw the next request id.
    pub fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}
