//! # finwire
//!
//! Binary framing protocol and reconnecting socket client for the finwire
//! OpenAPI.
//!
//! The crate has two layers:
//!
//! - **Protocol**: a versioned frame codec (v1 and v2) over three packet
//!   shapes (request/response/push) with optional gzip bodies, an optional
//!   verification trailer, and on v2 an ordered key/value metadata block.
//!   Unpacking is incremental, so a stream transport can feed the decoder
//!   bytes as they arrive.
//! - **Session**: a [`Client`] that multiplexes requests by id over a
//!   pluggable transport (TCP with length-prefixed framing, or WebSocket
//!   with one message per frame), authenticates with a token, runs
//!   keepalive, fans out pushes, and reconnects transparently - resuming
//!   the session id when it is still valid.
//!
//! ## Example
//!
//! ```ignore
//! use finwire::{Client, CodecType, DialOptions, Handshake, PlatformType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new();
//!
//!     client.subscribe(3001, |packet| {
//!         println!("push: {} bytes", packet.body.len());
//!     });
//!
//!     let handshake = Handshake::new(1, CodecType::Protobuf, PlatformType::Openapi);
//!     client
//!         .dial("wss://api.example.com/socket", handshake, DialOptions::default())
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod control;
pub mod error;
pub mod gzip;
pub mod options;
pub mod protocol;
pub mod transport;

mod client;

pub use client::Client;
pub use error::{FinwireError, Result};
pub use options::{DialOptions, RequestOptions, TokenGetter};
pub use protocol::{
    CodecType, ConnContext, Handshake, PackOptions, Packet, PacketType, PlatformType,
    ProtocolVersion,
};
