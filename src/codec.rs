//! Body codecs - serialization for packet bodies.
//!
//! The body codec is negotiated in the handshake and applies to every packet
//! on the connection:
//!
//! - [`ProtobufCodec`] - protobuf via `prost`
//! - [`JsonCodec`] - JSON via `serde_json`
//!
//! Body types implement both `prost::Message` and serde traits so a single
//! message struct works under either negotiated codec; [`marshal`] and
//! [`unmarshal`] dispatch at runtime on the connection codec.

use prost::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FinwireError, Result};
use crate::protocol::CodecType;

/// A packet body encodable under every negotiated codec.
pub trait BodyMessage: Message + Serialize + DeserializeOwned + Default {}

impl<T> BodyMessage for T where T: Message + Serialize + DeserializeOwned + Default {}

/// Protobuf codec backed by `prost`.
pub struct ProtobufCodec;

impl ProtobufCodec {
    pub fn encode<T: Message>(value: &T) -> Vec<u8> {
        value.encode_to_vec()
    }

    pub fn decode<T: Message + Default>(data: &[u8]) -> Result<T> {
        Ok(T::decode(data)?)
    }
}

/// JSON codec backed by `serde_json`.
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Encode a body under the connection codec.
pub fn marshal<T: BodyMessage>(codec: CodecType, value: &T) -> Result<Vec<u8>> {
    match codec {
        CodecType::Protobuf => Ok(ProtobufCodec::encode(value)),
        CodecType::Json => JsonCodec::encode(value),
        CodecType::Unknown => Err(FinwireError::UnknownCodec),
    }
}

/// Decode a body under the connection codec.
pub fn unmarshal<T: BodyMessage>(codec: CodecType, data: &[u8]) -> Result<T> {
    match codec {
        CodecType::Protobuf => ProtobufCodec::decode(data),
        CodecType::Json => JsonCodec::decode(data),
        CodecType::Unknown => Err(FinwireError::UnknownCodec),
    }
}
