//! Frame codec - pack packets to bytes and unpack bytes to packets.
//!
//! Two unpack paths exist:
//!
//! - [`FrameDecoder`] consumes bytes incrementally from the connection read
//!   buffer, remembering partial header state between reads. One decoder is
//!   owned by each stream-transport read loop.
//! - [`unpack_bytes`] decodes a single complete frame, used by message
//!   transports where one message is exactly one frame.
//!
//! Frame payload ordering after the fixed header is
//! `[metadata block (v2)] [body] [nonce + signature if verify]`. Bodies are
//! compressed on pack when auto-gzip triggers and always surfaced
//! decompressed.

use bytes::{Buf, BytesMut};

use crate::error::{FinwireError, Result};
use crate::gzip;
use crate::protocol::context::{ConnContext, ProtocolVersion};
use crate::protocol::packet::Packet;
use crate::protocol::wire::{
    FrameHeader, MAX_BODY_LENGTH, MAX_METADATA_LENGTH, NONCE_LENGTH, SIGNATURE_LENGTH,
};

/// Options applied when packing a frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackOptions {
    /// Compress the body when it is at least this many bytes; zero disables
    /// auto-compression.
    pub min_gzip_size: usize,
}

impl PackOptions {
    pub fn gzip_size(min_gzip_size: usize) -> Self {
        Self { min_gzip_size }
    }
}

/// Pack a packet into a contiguous frame.
///
/// When auto-gzip triggers, the packet's body is replaced with the
/// compressed stream and its gzip flag is set; the caller-visible packet then
/// matches what went on the wire.
pub fn pack(ctx: &ConnContext, packet: &mut Packet, opts: &PackOptions) -> Result<Vec<u8>> {
    if opts.min_gzip_size != 0 && packet.body.len() >= opts.min_gzip_size {
        packet.body = gzip::compress(&packet.body)?;
        packet.metadata.gzip = true;
    }

    if packet.body.len() > MAX_BODY_LENGTH as usize {
        return Err(FinwireError::BodyLenHitLimit);
    }

    if packet.metadata.verify && packet.metadata.signature.len() != SIGNATURE_LENGTH {
        return Err(FinwireError::InvalidFrame);
    }

    let metadata_block = match ctx.version {
        ProtocolVersion::V1 => Vec::new(),
        ProtocolVersion::V2 => packet.metadata.marshal_values(MAX_METADATA_LENGTH),
    };

    let mut header = FrameHeader::from_metadata(&packet.metadata);
    header.metadata_len = metadata_block.len() as u16;
    header.body_len = packet.body.len() as u32;

    let head = header.encode(ctx.version)?;

    let trailer_len = if packet.metadata.verify {
        NONCE_LENGTH + SIGNATURE_LENGTH
    } else {
        0
    };

    let mut data =
        Vec::with_capacity(head.len() + metadata_block.len() + packet.body.len() + trailer_len);

    data.extend_from_slice(&head);
    data.extend_from_slice(&metadata_block);
    data.extend_from_slice(&packet.body);

    if packet.metadata.verify {
        data.extend_from_slice(&packet.metadata.nonce.to_be_bytes());
        data.extend_from_slice(&packet.metadata.signature);
    }

    Ok(data)
}

/// Unpack one complete frame from a byte slice.
pub fn unpack_bytes(ctx: &ConnContext, frame: &[u8]) -> Result<Packet> {
    let (header, header_len) = FrameHeader::decode(ctx.version, frame)?;
    let payload = &frame[header_len..];

    let metadata_len = header.metadata_len as usize;
    let body_len = header.body_len as usize;

    if payload.len() < metadata_len + body_len {
        return Err(FinwireError::InvalidFrame);
    }

    let mut packet = Packet {
        metadata: header.metadata(ctx)?,
        body: payload[metadata_len..metadata_len + body_len].to_vec(),
    };

    packet.metadata.unmarshal_values(&payload[..metadata_len])?;

    if header.verify {
        let trailer = &payload[metadata_len + body_len..];

        if trailer.len() < NONCE_LENGTH + SIGNATURE_LENGTH {
            return Err(FinwireError::InvalidFrame);
        }

        packet.metadata.nonce =
            u64::from_be_bytes(trailer[..NONCE_LENGTH].try_into().expect("checked length"));
        packet.metadata.signature = trailer[NONCE_LENGTH..NONCE_LENGTH + SIGNATURE_LENGTH].to_vec();
    }

    if header.gzip {
        packet.body = gzip::decompress(&packet.body)?;
    }

    Ok(packet)
}

/// Incremental frame decoder for stream transports.
///
/// `unpack` returns `Ok(None)` while more bytes are needed and `Ok(Some)`
/// once a full frame has been consumed; re-entering with the same decoder
/// resumes exactly where the previous call left off. Any error is fatal for
/// the connection and leaves the decoder reset.
#[derive(Debug)]
pub struct FrameDecoder {
    version: ProtocolVersion,
    header: FrameHeader,
}

impl FrameDecoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            header: FrameHeader::default(),
        }
    }

    pub fn unpack(&mut self, ctx: &ConnContext, buf: &mut BytesMut) -> Result<Option<Packet>> {
        match self.try_unpack(ctx, buf) {
            Ok(Some(packet)) => {
                self.header.reset();
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.header.reset();
                Err(e)
            }
        }
    }

    fn try_unpack(&mut self, ctx: &ConnContext, buf: &mut BytesMut) -> Result<Option<Packet>> {
        if !self.header.is_unpacked {
            if !self.header.begin_unpack {
                if buf.is_empty() {
                    return Ok(None);
                }

                let first = buf.get_u8();
                self.header.set_first_byte(first);
            }

            // unknown type is fatal before waiting for more bytes
            let remaining = self.header.header_len(self.version)? - 1;

            if buf.len() < remaining {
                return Ok(None);
            }

            self.header.decode_rest(self.version, buf)?;
        }

        let metadata_len = self.header.metadata_len as usize;
        let body_len = self.header.body_len as usize;

        let mut needed = metadata_len + body_len;
        if self.header.verify {
            needed += NONCE_LENGTH + SIGNATURE_LENGTH;
        }

        if buf.len() < needed {
            return Ok(None);
        }

        let metadata_block = buf.split_to(metadata_len);
        let body = buf.split_to(body_len);

        let mut packet = Packet {
            metadata: self.header.metadata(ctx)?,
            body: body.to_vec(),
        };

        packet.metadata.unmarshal_values(&metadata_block)?;

        if self.header.verify {
            packet.metadata.nonce = buf.get_u64();
            packet.metadata.signature = buf.split_to(SIGNATURE_LENGTH).to_vec();
        }

        if self.header.gzip {
            packet.body = gzip::decompress(&packet.body)?;
        }

        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::handshake::{CodecType, Handshake, PlatformType};
    use crate::protocol::metadata::Metadata;
    use crate::protocol::packet::PacketType;

    fn ctx(version: u8) -> ConnContext {
        ConnContext::new(&Handshake::new(
            version,
            CodecType::Protobuf,
            PlatformType::Openapi,
        ))
        .unwrap()
    }

    fn request_packet() -> Packet {
        let mut metadata = Metadata::new(PacketType::Request, CodecType::Protobuf, 1);
        metadata.request_id = 1;
        metadata.timeout = 255;

        Packet {
            metadata,
            body: b"hello world".to_vec(),
        }
    }

    #[test]
    fn test_pack_v1_request() {
        let ctx = ctx(1);
        let mut packet = request_packet();

        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();
        assert_eq!(
            data,
            vec![
                0x01, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0xFF, 0x00, 0x00, 0x0B, b'h', b'e',
                b'l', b'l', b'o', b' ', b'w', b'o', b'r', b'l', b'd'
            ]
        );

        assert_eq!(unpack_bytes(&ctx, &data).unwrap(), packet);
    }

    #[test]
    fn test_pack_v1_response() {
        let ctx = ctx(1);
        let mut metadata = Metadata::new(PacketType::Response, CodecType::Protobuf, 1);
        metadata.request_id = 1;
        metadata.status_code = 1;
        let mut packet = Packet {
            metadata,
            body: b"hello world".to_vec(),
        };

        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();
        assert_eq!(
            &data[..10],
            &[0x02, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00, 0x0B]
        );
        assert_eq!(&data[10..], b"hello world");
    }

    #[test]
    fn test_pack_v1_push_with_verify_trailer() {
        let ctx = ctx(1);
        let mut metadata = Metadata::new(PacketType::Push, CodecType::Protobuf, 3);
        metadata.verify = true;
        metadata.nonce = 1;
        metadata.signature = b"0123456789abcdef".to_vec();
        let mut packet = Packet {
            metadata,
            body: b"hello world".to_vec(),
        };

        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();

        let mut expected = vec![0b0001_0011, 0x03, 0x00, 0x00, 0x0B];
        expected.extend_from_slice(b"hello world");
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);
        expected.extend_from_slice(b"0123456789abcdef");
        assert_eq!(data, expected);

        assert_eq!(unpack_bytes(&ctx, &data).unwrap(), packet);
    }

    #[test]
    fn test_pack_v2_request_layout() {
        let ctx = ctx(2);
        let mut packet = request_packet();

        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();
        assert_eq!(
            &data[..13],
            &[0x01, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x0B]
        );
        assert_eq!(&data[13..], b"hello world");
    }

    #[test]
    fn test_pack_v2_metadata_values_roundtrip() {
        let ctx = ctx(2);
        let mut packet = request_packet();
        packet.metadata.set("trace-id", "abc123").unwrap();
        packet.metadata.set("tenant", "t-9").unwrap();

        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();
        let back = unpack_bytes(&ctx, &data).unwrap();

        assert_eq!(back, packet);
        assert_eq!(back.metadata.get("trace-id"), Some("abc123"));
    }

    #[test]
    fn test_pack_auto_gzip_mutates_packet() {
        let ctx = ctx(1);
        let mut packet = request_packet();
        packet.body = b"abcabcabcabcabcabcabcabcabcabc".repeat(20);
        let original = packet.body.clone();

        let data = pack(&ctx, &mut packet, &PackOptions::gzip_size(64)).unwrap();

        assert!(packet.metadata.gzip);
        assert_ne!(packet.body, original);

        let back = unpack_bytes(&ctx, &data).unwrap();
        assert!(back.metadata.gzip);
        assert_eq!(back.body, original);
    }

    #[test]
    fn test_pack_below_gzip_threshold_is_untouched() {
        let ctx = ctx(1);
        let mut packet = request_packet();

        pack(&ctx, &mut packet, &PackOptions::gzip_size(1024)).unwrap();
        assert!(!packet.metadata.gzip);
    }

    #[test]
    fn test_pack_rejects_bad_signature_length() {
        let ctx = ctx(1);
        let mut packet = request_packet().with_verify(1, vec![0u8; 4]);

        assert!(matches!(
            pack(&ctx, &mut packet, &PackOptions::default()),
            Err(FinwireError::InvalidFrame)
        ));
    }

    #[test]
    fn test_unpack_bytes_short_frame() {
        let ctx = ctx(1);
        let mut packet = request_packet();
        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();

        assert!(matches!(
            unpack_bytes(&ctx, &data[..data.len() - 3]),
            Err(FinwireError::InvalidFrame)
        ));
    }

    #[test]
    fn test_unpack_bytes_truncated_trailer() {
        let ctx = ctx(1);
        let mut metadata = Metadata::new(PacketType::Push, CodecType::Protobuf, 3);
        metadata.verify = true;
        metadata.nonce = 1;
        metadata.signature = vec![0u8; 16];
        let mut packet = Packet {
            metadata,
            body: b"x".to_vec(),
        };

        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();
        assert!(matches!(
            unpack_bytes(&ctx, &data[..data.len() - 8]),
            Err(FinwireError::InvalidFrame)
        ));
    }

    #[test]
    fn test_decoder_waits_for_header_then_body() {
        let ctx = ctx(1);
        let mut packet = request_packet();
        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();

        let mut decoder = FrameDecoder::new(ProtocolVersion::V1);
        let mut buf = BytesMut::new();

        // header only
        buf.extend_from_slice(&data[..11]);
        assert!(decoder.unpack(&ctx, &mut buf).unwrap().is_none());

        // body arrives together with bytes of the next frame
        buf.extend_from_slice(&data[11..]);
        buf.extend_from_slice(&data[..5]);
        let got = decoder.unpack(&ctx, &mut buf).unwrap().unwrap();
        assert_eq!(got, packet);

        // leftover bytes stay queued for the next frame
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_decoder_single_byte_feed() {
        let ctx = ctx(2);
        let mut packet = request_packet();
        packet.metadata.set("k", "v").unwrap();
        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();

        let mut decoder = FrameDecoder::new(ProtocolVersion::V2);
        let mut buf = BytesMut::new();
        let mut got = None;

        for b in &data {
            buf.extend_from_slice(&[*b]);

            if let Some(p) = decoder.unpack(&ctx, &mut buf).unwrap() {
                assert!(got.is_none());
                got = Some(p);
            }
        }

        assert_eq!(got.unwrap(), packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_empty_buffer_is_not_done() {
        let ctx = ctx(1);
        let mut decoder = FrameDecoder::new(ProtocolVersion::V1);
        let mut buf = BytesMut::new();

        assert!(decoder.unpack(&ctx, &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decoder_unknown_type_is_fatal() {
        let ctx = ctx(1);
        let mut decoder = FrameDecoder::new(ProtocolVersion::V1);
        let mut buf = BytesMut::from(&[0x0Fu8, 0, 0, 0, 0][..]);

        assert!(matches!(
            decoder.unpack(&ctx, &mut buf),
            Err(FinwireError::UnknownPacketType)
        ));
    }

    #[test]
    fn test_decoder_sequences_multiple_frames() {
        let ctx = ctx(1);
        let mut decoder = FrameDecoder::new(ProtocolVersion::V1);
        let mut buf = BytesMut::new();

        let mut packets = Vec::new();
        for i in 0..3u8 {
            let mut p = request_packet();
            p.metadata.request_id = u32::from(i) + 1;
            p.body = vec![i; 3];
            buf.extend_from_slice(&pack(&ctx, &mut p, &PackOptions::default()).unwrap());
            packets.push(p);
        }

        let mut got = Vec::new();
        while let Some(p) = decoder.unpack(&ctx, &mut buf).unwrap() {
            got.push(p);
        }

        assert_eq!(got, packets);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_verify_trailer_incremental() {
        let ctx = ctx(1);
        let mut metadata = Metadata::new(PacketType::Push, CodecType::Protobuf, 3);
        metadata.verify = true;
        metadata.nonce = 99;
        metadata.signature = b"0123456789abcdef".to_vec();
        let mut packet = Packet {
            metadata,
            body: b"body".to_vec(),
        };
        let data = pack(&ctx, &mut packet, &PackOptions::default()).unwrap();

        let mut decoder = FrameDecoder::new(ProtocolVersion::V1);
        let mut buf = BytesMut::new();

        // everything except the last trailer byte
        buf.extend_from_slice(&data[..data.len() - 1]);
        assert!(decoder.unpack(&ctx, &mut buf).unwrap().is_none());

        buf.extend_from_slice(&data[data.len() - 1..]);
        let got = decoder.unpack(&ctx, &mut buf).unwrap().unwrap();
        assert_eq!(got.metadata.nonce, 99);
        assert_eq!(got.metadata.signature, b"0123456789abcdef");
    }
}
