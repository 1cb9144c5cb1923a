//! Protocol module - handshake, packet model, and the v1/v2 frame codec.
//!
//! The frame codec is version-aware: v1 carries only the fixed header and
//! body, v2 adds an ordered key/value metadata block. Both versions share the
//! packet model and the incremental decoding discipline.

mod context;
mod frame;
mod handshake;
mod metadata;
mod packet;
pub mod status;
mod wire;

pub use context::{ConnContext, ProtocolVersion};
pub use frame::{pack, unpack_bytes, FrameDecoder, PackOptions};
pub use handshake::{CodecType, Handshake, PlatformType, HANDSHAKE_LENGTH};
pub use metadata::{Metadata, MAX_15BIT_LENGTH, MAX_7BIT_LENGTH};
pub use packet::{Packet, PacketType};
pub use wire::{
    FrameHeader, MAX_BODY_LENGTH, MAX_METADATA_LENGTH, NONCE_LENGTH, SIGNATURE_LENGTH,
};
