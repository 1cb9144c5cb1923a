//! Wire format encoding and decoding for frame headers.
//!
//! Header byte 0 packs `reserve(2) | gzip(1) | verify(1) | type(4)` with the
//! type in the low nibble; byte 1 is the low 8 bits of the cmd code. The rest
//! depends on the packet type and protocol version:
//!
//! ```text
//! request  v1: type+flags | cmd | request_id u32 | timeout u16 | body_len u24      (11)
//! response v1: type+flags | cmd | request_id u32 | status u8   | body_len u24      (10)
//! push     v1: type+flags | cmd | body_len u24                                     (5)
//! ```
//!
//! v2 inserts `metadata_len u16` immediately before `body_len`, adding two
//! bytes to every shape. All multi-byte integers are big endian.

use bytes::{Buf, BytesMut};

use crate::error::{FinwireError, Result};
use crate::protocol::context::{ConnContext, ProtocolVersion};
use crate::protocol::metadata::Metadata;
use crate::protocol::packet::PacketType;

/// Verify-trailer nonce size in bytes.
pub const NONCE_LENGTH: usize = 8;
/// Verify-trailer signature size in bytes.
pub const SIGNATURE_LENGTH: usize = 16;
/// Largest body the 24-bit length field can carry.
pub const MAX_BODY_LENGTH: u32 = (1 << 24) - 1;
/// Largest serialized metadata block the 16-bit length field can carry.
pub const MAX_METADATA_LENGTH: usize = u16::MAX as usize;

const TYPE_MASK: u8 = 0x0f;

/// Decoded fixed header plus the incremental-unpack flags.
///
/// One header instance lives on each decoder and is fully reset between
/// frames; the flags record how far a partially received header has been
/// parsed so `unpack` can resume where it left off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw type nibble; may hold an invalid value until validated.
    pub packet_type: u8,
    pub verify: bool,
    pub gzip: bool,
    pub reserve: u8,
    pub cmd_code: u8,
    pub request_id: u32,
    pub timeout: u16,
    pub status_code: u8,
    /// v2 only; always zero under v1.
    pub metadata_len: u16,
    pub body_len: u32,

    /// First byte consumed; the fixed header is still being read.
    pub(crate) begin_unpack: bool,
    /// The full fixed header has been parsed.
    pub(crate) is_unpacked: bool,
}

impl FrameHeader {
    /// Build a header from packet metadata, ready for `encode`.
    pub fn from_metadata(md: &Metadata) -> Self {
        Self {
            packet_type: md.packet_type as u8,
            verify: md.verify,
            gzip: md.gzip,
            reserve: 0,
            cmd_code: (md.cmd_code & 0xff) as u8,
            request_id: md.request_id,
            timeout: md.timeout,
            status_code: md.status_code,
            metadata_len: 0,
            body_len: 0,
            begin_unpack: false,
            is_unpacked: false,
        }
    }

    /// Validated packet type, or an error for an unknown nibble.
    pub fn kind(&self) -> Result<PacketType> {
        match self.packet_type {
            1 => Ok(PacketType::Request),
            2 => Ok(PacketType::Response),
            3 => Ok(PacketType::Push),
            _ => Err(FinwireError::UnknownPacketType),
        }
    }

    /// Fixed header length for this type under `version`.
    pub fn header_len(&self, version: ProtocolVersion) -> Result<usize> {
        let v1_len = match self.kind()? {
            PacketType::Request => 11,
            PacketType::Response => 10,
            PacketType::Push => 5,
        };

        Ok(match version {
            ProtocolVersion::V1 => v1_len,
            ProtocolVersion::V2 => v1_len + 2,
        })
    }

    /// Encode the fixed header.
    pub fn encode(&self, version: ProtocolVersion) -> Result<Vec<u8>> {
        let kind = self.kind()?;

        if self.body_len > MAX_BODY_LENGTH {
            return Err(FinwireError::BodyLenHitLimit);
        }

        let mut data = Vec::with_capacity(self.header_len(version)?);

        data.push(
            (self.packet_type & TYPE_MASK)
                | (u8::from(self.verify) << 4)
                | (u8::from(self.gzip) << 5)
                | ((self.reserve & 0x3) << 6),
        );
        data.push(self.cmd_code);

        if kind == PacketType::Request || kind == PacketType::Response {
            data.extend_from_slice(&self.request_id.to_be_bytes());
        }

        if kind == PacketType::Request {
            data.extend_from_slice(&self.timeout.to_be_bytes());
        }

        if kind == PacketType::Response {
            data.push(self.status_code);
        }

        if version == ProtocolVersion::V2 {
            data.extend_from_slice(&self.metadata_len.to_be_bytes());
        }

        data.push((self.body_len >> 16) as u8);
        data.push((self.body_len >> 8) as u8);
        data.push(self.body_len as u8);

        Ok(data)
    }

    /// Consume the first header byte.
    pub(crate) fn set_first_byte(&mut self, b: u8) {
        self.packet_type = b & TYPE_MASK;
        self.verify = (b >> 4) & 0x1 == 1;
        self.gzip = (b >> 5) & 0x1 == 1;
        self.reserve = (b >> 6) & 0x3;
        self.begin_unpack = true;
    }

    /// Parse the remainder of the fixed header.
    ///
    /// The caller must have verified that `buf` holds at least
    /// `header_len - 1` bytes.
    pub(crate) fn decode_rest(&mut self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
        let kind = self.kind()?;

        self.cmd_code = buf.get_u8();

        if kind == PacketType::Request || kind == PacketType::Response {
            self.request_id = buf.get_u32();
        }

        if kind == PacketType::Request {
            self.timeout = buf.get_u16();
        }

        if kind == PacketType::Response {
            self.status_code = buf.get_u8();
        }

        if version == ProtocolVersion::V2 {
            self.metadata_len = buf.get_u16();
        }

        self.body_len =
            (u32::from(buf.get_u8()) << 16) | (u32::from(buf.get_u8()) << 8) | u32::from(buf.get_u8());

        self.is_unpacked = true;

        Ok(())
    }

    /// One-shot decode from a complete frame.
    ///
    /// Returns the header and the number of header bytes consumed.
    pub fn decode(version: ProtocolVersion, frame: &[u8]) -> Result<(Self, usize)> {
        let first = *frame.first().ok_or(FinwireError::InvalidFrame)?;

        let mut header = Self::default();
        header.set_first_byte(first);

        let len = header.header_len(version)?;

        if frame.len() < len {
            return Err(FinwireError::InvalidFrame);
        }

        let mut rest = BytesMut::from(&frame[1..len]);
        header.decode_rest(version, &mut rest)?;

        Ok((header, len))
    }

    /// Expand into packet metadata; codec comes from the connection context.
    pub fn metadata(&self, ctx: &ConnContext) -> Result<Metadata> {
        let mut md = Metadata::new(self.kind()?, ctx.codec, u32::from(self.cmd_code));

        md.request_id = self.request_id;
        md.timeout = self.timeout;
        md.status_code = self.status_code;
        md.verify = self.verify;
        md.gzip = self.gzip;

        Ok(md)
    }

    /// Return the header to its pristine state for the next frame.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
