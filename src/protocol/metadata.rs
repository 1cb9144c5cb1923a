//! Per-packet metadata and the key/value string codec.
//!
//! Metadata carries the scalar header fields shared by both protocol
//! versions plus, on v2, an ordered list of UTF-8 key/value pairs serialized
//! with a compact 7-/15-bit length prefix:
//!
//! - length 0-127: one prefix byte, high bit clear;
//! - length 128-32767: two prefix bytes, high bit of the first set, the
//!   remaining 7 bits are the high bits of the length, the second byte the
//!   low 8 bits. A two-byte prefix decoding to 127 or less is malformed.
//! - length 0 is malformed in both forms.
//!
//! The block is a plain concatenation of `(key)(value)` pairs terminated by
//! the end of the block.

use crate::error::{FinwireError, Result};
use crate::protocol::handshake::CodecType;
use crate::protocol::packet::PacketType;

const LEN_15BIT_FLAG: u8 = 0b1000_0000;

/// Longest string encodable with the one-byte prefix.
pub const MAX_7BIT_LENGTH: usize = (1 << 7) - 1;
/// Longest string encodable at all.
pub const MAX_15BIT_LENGTH: usize = (1 << 15) - 1;

/// Decoded frame metadata plus body-framing flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub packet_type: PacketType,
    /// Full command code; only the low 8 bits travel on the wire.
    pub cmd_code: u32,
    pub codec: CodecType,
    /// Present for requests and responses, zero for pushes.
    pub request_id: u32,
    /// Request-only hint in milliseconds.
    pub timeout: u16,
    /// Response-only; zero is success.
    pub status_code: u8,
    pub verify: bool,
    pub gzip: bool,
    /// Verify trailer fields, meaningful iff `verify`.
    pub nonce: u64,
    pub signature: Vec<u8>,
    /// Ordered key/value pairs, v2 only.
    pub values: Vec<(String, String)>,
}

impl Metadata {
    pub fn new(packet_type: PacketType, codec: CodecType, cmd_code: u32) -> Self {
        Self {
            packet_type,
            cmd_code,
            codec,
            request_id: 0,
            timeout: 0,
            status_code: 0,
            verify: false,
            gzip: false,
            nonce: 0,
            signature: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Set a metadata value, replacing an existing entry for the same key.
    pub fn set(&mut self, key: &str, val: &str) -> Result<()> {
        if key.len() > MAX_15BIT_LENGTH {
            return Err(FinwireError::KeyTooLong);
        }

        if val.len() > MAX_15BIT_LENGTH {
            return Err(FinwireError::ValueTooLong);
        }

        match self.values.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = val.to_owned(),
            None => self.values.push((key.to_owned(), val.to_owned())),
        }

        Ok(())
    }

    /// Get a metadata value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize the key/value pairs in insertion order.
    ///
    /// Entries with empty or over-long keys or values are skipped. Encoding
    /// stops before the entry that would push the block past `max`; no
    /// partial entry is ever emitted.
    pub fn marshal_values(&self, max: usize) -> Vec<u8> {
        let mut data = Vec::new();

        for (key, val) in &self.values {
            if key.is_empty() || val.is_empty() {
                continue;
            }

            let Some(k) = marshal_string(key) else {
                continue;
            };
            let Some(v) = marshal_string(val) else {
                continue;
            };

            if data.len() + k.len() + v.len() > max {
                break;
            }

            data.extend_from_slice(&k);
            data.extend_from_slice(&v);
        }

        data
    }

    /// Parse a serialized block, replacing the current pairs.
    pub fn unmarshal_values(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if data.len() < 2 {
            return Err(FinwireError::InvalidMetadata);
        }

        let mut rest = data;
        let mut values = Vec::new();

        while !rest.is_empty() {
            let key = take_string(&mut rest)?;
            let val = take_string(&mut rest)?;
            values.push((key, val));
        }

        self.values = values;

        Ok(())
    }
}

/// Length-prefix a string, or `None` when it exceeds the 15-bit limit.
pub(crate) fn marshal_string(s: &str) -> Option<Vec<u8>> {
    let len = s.len();

    let mut data = if len <= MAX_7BIT_LENGTH {
        let mut d = Vec::with_capacity(1 + len);
        d.push(len as u8);
        d
    } else if len <= MAX_15BIT_LENGTH {
        let mut d = Vec::with_capacity(2 + len);
        d.push((len >> 8) as u8 | LEN_15BIT_FLAG);
        d.push((len & 0xff) as u8);
        d
    } else {
        return None;
    };

    data.extend_from_slice(s.as_bytes());

    Some(data)
}

/// Decode a length prefix, returning `(length, prefix_size)`.
pub(crate) fn unmarshal_string_length(data: &[u8]) -> Result<(usize, usize)> {
    let first = *data.first().ok_or(FinwireError::InvalidMetadata)?;

    if first & LEN_15BIT_FLAG == 0 {
        let len = (first & !LEN_15BIT_FLAG) as usize;

        if len == 0 {
            return Err(FinwireError::InvalidMetadata);
        }

        Ok((len, 1))
    } else {
        let second = *data.get(1).ok_or(FinwireError::InvalidMetadata)?;
        let len = ((first & !LEN_15BIT_FLAG) as usize) << 8 | second as usize;

        // a two-byte prefix must not encode a one-byte-range length
        if len <= MAX_7BIT_LENGTH {
            return Err(FinwireError::InvalidMetadata);
        }

        Ok((len, 2))
    }
}

fn take_string(data: &mut &[u8]) -> Result<String> {
    let (len, prefix) = unmarshal_string_length(data)?;

    if data.len() < prefix + len {
        return Err(FinwireError::InvalidMetadata);
    }

    let s = std::str::from_utf8(&data[prefix..prefix + len])
        .map_err(|_| FinwireError::InvalidMetadata)?
        .to_owned();

    *data = &data[prefix + len..];

    Ok(s)
}
