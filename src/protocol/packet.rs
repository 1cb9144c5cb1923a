//! Packet model - the in-memory representation of a frame.
//!
//! A [`Packet`] is metadata plus body bytes. The body surfaced here is
//! already decompressed; compression is a wire concern owned by the frame
//! codec.

use std::fmt;

use crate::codec::{self, BodyMessage};
use crate::control::{self, ErrorBody};
use crate::error::Result;
use crate::protocol::context::ConnContext;
use crate::protocol::metadata::Metadata;
use crate::protocol::status;

/// The three packet shapes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Request = 1,
    Response = 2,
    Push = 3,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PacketType::Request => "request",
            PacketType::Response => "response",
            PacketType::Push => "push",
        })
    }
}

/// Metadata plus body bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub metadata: Metadata,
    pub body: Vec<u8>,
}

impl Packet {
    /// Build a request with a fresh request id from the connection context.
    pub fn request<T: BodyMessage>(ctx: &ConnContext, cmd: u32, body: &T) -> Result<Self> {
        Ok(Self::request_raw(ctx, cmd, codec::marshal(ctx.codec, body)?))
    }

    /// Build a request around an already encoded body.
    pub fn request_raw(ctx: &ConnContext, cmd: u32, body: Vec<u8>) -> Self {
        let mut metadata = Metadata::new(PacketType::Request, ctx.codec, cmd);
        metadata.request_id = ctx.next_request_id();

        Self { metadata, body }
    }

    /// Build a response carrying a status code.
    pub fn response<T: BodyMessage>(
        ctx: &ConnContext,
        cmd: u32,
        status_code: u8,
        body: &T,
    ) -> Result<Self> {
        Ok(Self::response_raw(
            ctx,
            cmd,
            status_code,
            codec::marshal(ctx.codec, body)?,
        ))
    }

    /// Build a response around an already encoded body.
    pub fn response_raw(ctx: &ConnContext, cmd: u32, status_code: u8, body: Vec<u8>) -> Self {
        let mut metadata = Metadata::new(PacketType::Response, ctx.codec, cmd);
        metadata.status_code = status_code;

        Self { metadata, body }
    }

    /// Build a push. Pushes carry no request id and no status code.
    pub fn push<T: BodyMessage>(ctx: &ConnContext, cmd: u32, body: &T) -> Result<Self> {
        Ok(Self::push_raw(ctx, cmd, codec::marshal(ctx.codec, body)?))
    }

    /// Build a push around an already encoded body.
    pub fn push_raw(ctx: &ConnContext, cmd: u32, body: Vec<u8>) -> Self {
        Self {
            metadata: Metadata::new(PacketType::Push, ctx.codec, cmd),
            body,
        }
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.metadata.request_id = request_id;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u16) -> Self {
        self.metadata.timeout = timeout_ms;
        self
    }

    pub fn with_verify(mut self, nonce: u64, signature: Vec<u8>) -> Self {
        self.metadata.nonce = nonce;
        self.metadata.signature = signature;
        self.metadata.verify = true;
        self
    }

    #[inline]
    pub fn cmd(&self) -> u32 {
        self.metadata.cmd_code
    }

    #[inline]
    pub fn request_id(&self) -> u32 {
        self.metadata.request_id
    }

    #[inline]
    pub fn status_code(&self) -> u8 {
        self.metadata.status_code
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        control::is_control(self.metadata.cmd_code)
    }

    #[inline]
    pub fn is_auth(&self) -> bool {
        control::is_auth(self.metadata.cmd_code)
    }

    #[inline]
    pub fn is_reconnect(&self) -> bool {
        control::is_reconnect(self.metadata.cmd_code)
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        control::is_close(self.metadata.cmd_code)
    }

    /// A heartbeat request.
    #[inline]
    pub fn is_ping(&self) -> bool {
        control::is_heartbeat(self.metadata.cmd_code)
            && self.metadata.packet_type == PacketType::Request
    }

    /// A heartbeat response.
    #[inline]
    pub fn is_pong(&self) -> bool {
        control::is_heartbeat(self.metadata.cmd_code)
            && self.metadata.packet_type == PacketType::Response
    }

    /// Decode the body under the connection codec.
    pub fn unmarshal<T: BodyMessage>(&self) -> Result<T> {
        codec::unmarshal(self.metadata.codec, &self.body)
    }

    /// Error payload of a failed response.
    ///
    /// `None` for non-responses and for success. When the body does not
    /// decode as an error payload, a synthetic code-500 error is returned so
    /// callers always get something actionable.
    pub fn remote_err(&self) -> Option<ErrorBody> {
        if self.metadata.packet_type != PacketType::Response {
            return None;
        }

        if self.metadata.status_code == status::SUCCESS {
            return None;
        }

        Some(self.unmarshal().unwrap_or_else(|_| ErrorBody {
            code: 500,
            msg: "unknown error, can't unmarshal body".to_owned(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::cmd;
    use crate::protocol::handshake::{CodecType, Handshake, PlatformType};

    fn ctx() -> ConnContext {
        ConnContext::new(&Handshake::new(1, CodecType::Protobuf, PlatformType::Openapi)).unwrap()
    }

    #[test]
    fn test_request_draws_fresh_ids() {
        let ctx = ctx();
        let p1 = Packet::request_raw(&ctx, 10, vec![]);
        let p2 = Packet::request_raw(&ctx, 10, vec![]);

        assert_eq!(p1.request_id(), 1);
        assert_eq!(p2.request_id(), 2);
        assert_eq!(p1.metadata.packet_type, PacketType::Request);
    }

    #[test]
    fn test_push_carries_no_request_id_or_status() {
        let ctx = ctx();
        let p = Packet::push_raw(&ctx, 200, b"data".to_vec());

        assert_eq!(p.request_id(), 0);
        assert_eq!(p.status_code(), 0);
        assert_eq!(p.metadata.packet_type, PacketType::Push);
    }

    #[test]
    fn test_ping_pong_predicates() {
        let ctx = ctx();
        let ping = Packet::request_raw(&ctx, cmd::HEARTBEAT, vec![]);
        let pong = Packet::response_raw(&ctx, cmd::HEARTBEAT, status::SUCCESS, vec![]);
        let push = Packet::push_raw(&ctx, cmd::HEARTBEAT, vec![]);

        assert!(ping.is_ping() && !ping.is_pong());
        assert!(pong.is_pong() && !pong.is_ping());
        assert!(!push.is_ping() && !push.is_pong());
        assert!(ping.is_control());
    }

    #[test]
    fn test_control_predicates_by_cmd() {
        let ctx = ctx();

        assert!(Packet::push_raw(&ctx, cmd::CLOSE, vec![]).is_close());
        assert!(Packet::request_raw(&ctx, cmd::AUTH, vec![]).is_auth());
        assert!(Packet::request_raw(&ctx, cmd::RECONNECT, vec![]).is_reconnect());
        assert!(!Packet::push_raw(&ctx, 300, vec![]).is_control());
    }

    #[test]
    fn test_remote_err_none_on_success() {
        let ctx = ctx();
        let res = Packet::response_raw(&ctx, 10, status::SUCCESS, vec![]);
        assert!(res.remote_err().is_none());
    }

    #[test]
    fn test_remote_err_decodes_body() {
        let ctx = ctx();
        let body = ErrorBody {
            code: 42,
            msg: "bad token".to_owned(),
        };
        let res = Packet::response(&ctx, cmd::AUTH, status::UNAUTHENTICATED, &body).unwrap();

        let err = res.remote_err().unwrap();
        assert_eq!(err.code, 42);
        assert_eq!(err.msg, "bad token");
    }

    #[test]
    fn test_remote_err_falls_back_to_synthetic_500() {
        let ctx = ctx();
        // an empty protobuf decodes to a default ErrorBody, so force garbage
        let mut res = Packet::response_raw(&ctx, 10, status::SERVER_INTERNAL_ERROR, vec![]);
        res.metadata.codec = CodecType::Json;
        res.body = b"not json".to_vec();

        let err = res.remote_err().unwrap();
        assert_eq!(err.code, 500);
        assert_eq!(err.msg, "unknown error, can't unmarshal body");
    }

    #[test]
    fn test_with_verify_builder() {
        let ctx = ctx();
        let p = Packet::push_raw(&ctx, 300, vec![]).with_verify(7, vec![0u8; 16]);

        assert!(p.metadata.verify);
        assert_eq!(p.metadata.nonce, 7);
        assert_eq!(p.metadata.signature.len(), 16);
    }
}
