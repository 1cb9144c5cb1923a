//! Connection handshake - the negotiated protocol parameters.
//!
//! Stream transports send the packed handshake as the very first two bytes on
//! the socket. Datagram transports carry the same fields as URL query
//! parameters instead and never send the packed form.
//!
//! Wire layout (2 bytes):
//!
//! ```text
//! byte 0: codec(4) | version(4)
//! byte 1: reserve(4) | platform(4)
//! ```

use std::fmt;

use crate::error::{FinwireError, Result};

/// Handshake frame size in bytes.
pub const HANDSHAKE_LENGTH: usize = 2;

const VERSION_MASK: u8 = 0x0f;
const CODEC_MASK: u8 = 0xf0;
const PLATFORM_MASK: u8 = 0x0f;
const RESERVE_MASK: u8 = 0xf0;

/// Body codec negotiated for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecType {
    #[default]
    Unknown = 0,
    Protobuf = 1,
    Json = 2,
}

impl CodecType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => CodecType::Protobuf,
            2 => CodecType::Json,
            _ => CodecType::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodecType::Unknown => "unknown",
            CodecType::Protobuf => "protobuf",
            CodecType::Json => "json",
        })
    }
}

/// Client platform advertised in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlatformType {
    #[default]
    Unknown = 0,
    Ios = 1,
    Android = 2,
    Web = 3,
    Server = 4,
    DesktopMac = 5,
    DesktopWin = 6,
    DesktopLinux = 7,
    Terminal = 8,
    Openapi = 9,
}

impl PlatformType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PlatformType::Ios,
            2 => PlatformType::Android,
            3 => PlatformType::Web,
            4 => PlatformType::Server,
            5 => PlatformType::DesktopMac,
            6 => PlatformType::DesktopWin,
            7 => PlatformType::DesktopLinux,
            8 => PlatformType::Terminal,
            9 => PlatformType::Openapi,
            _ => PlatformType::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlatformType::Unknown => "unknown",
            PlatformType::Ios => "iOS",
            PlatformType::Android => "Android",
            PlatformType::Web => "web",
            PlatformType::Server => "server",
            PlatformType::DesktopMac => "desktop-mac",
            PlatformType::DesktopWin => "desktop-windows",
            PlatformType::DesktopLinux => "desktop-linux",
            PlatformType::Terminal => "terminal",
            PlatformType::Openapi => "openapi",
        })
    }
}

/// Negotiated connection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Frame protocol version (4 bits on the wire).
    pub version: u8,
    pub codec: CodecType,
    pub platform: PlatformType,
    /// Reserved bits, zero today.
    pub reserve: u8,
}

impl Handshake {
    pub fn new(version: u8, codec: CodecType, platform: PlatformType) -> Self {
        Self {
            version,
            codec,
            platform,
            reserve: 0,
        }
    }

    /// Encode to the two-byte wire form.
    pub fn pack(&self) -> [u8; HANDSHAKE_LENGTH] {
        [
            (self.version & VERSION_MASK) | (self.codec.as_u8() << 4),
            (self.platform.as_u8() & PLATFORM_MASK) | (self.reserve << 4),
        ]
    }

    /// Decode from the two-byte wire form.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LENGTH {
            return Err(FinwireError::InvalidHandshake);
        }

        Ok(Self {
            version: data[0] & VERSION_MASK,
            codec: CodecType::from_u8((data[0] & CODEC_MASK) >> 4),
            platform: PlatformType::from_u8(data[1] & PLATFORM_MASK),
            reserve: (data[1] & RESERVE_MASK) >> 4,
        })
    }
}
