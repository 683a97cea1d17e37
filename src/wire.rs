//! Minimal framed wire protocol for the heartbeat RPC (spec §6).
//!
//! This stands in for "the underlying RPC framework" the spec treats as
//! an external collaborator: a real deployment would carry
//! [`PingRequest`]/[`PingResponse`] over whatever request/response RPC
//! runtime the surrounding system already has. This crate ships a small
//! length-prefixed frame so the rest of the fabric (dial, heartbeat loop,
//! health, clock monitor) can be exercised end-to-end without pulling in
//! a full RPC stack.
//!
//! Frame layout (6-byte header + payload), modeled on a multiplexed
//! tunnel frame format but stripped of stream multiplexing — this fabric
//! only ever does one thing per connection, a unary `Ping`:
//! ```text
//! | msg_type (1B) | flags (1B) | payload_len (4B) | payload (NB) |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const HEADER_SIZE: usize = 6;

/// Frame flags.
pub mod flags {
    /// Payload is Snappy-framed; decompress before parsing as JSON.
    pub const COMPRESSED: u8 = 0x01;
}

/// Message types carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    PingRequest = 0x01,
    PingResponse = 0x02,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::PingRequest),
            0x02 => Some(Self::PingResponse),
            _ => None,
        }
    }
}

/// A single frame on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MsgType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MsgType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            flags,
            payload: payload.into(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSED != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let msg_type_raw = data.get_u8();
        let frame_flags = data.get_u8();
        let payload_len = data.get_u32() as usize;

        if data.remaining() < payload_len {
            return Err(ProtocolError::Incomplete {
                expected: HEADER_SIZE + payload_len,
                actual: HEADER_SIZE + data.remaining(),
            });
        }

        let msg_type =
            MsgType::from_u8(msg_type_raw).ok_or(ProtocolError::UnknownMsgType(msg_type_raw))?;
        let payload = data.split_to(payload_len);

        Ok(Self {
            msg_type,
            flags: frame_flags,
            payload,
        })
    }
}

/// Framing-level errors (distinct from [`crate::error::Error`] — these are
/// wire-decode failures, not fabric-level outcomes).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("frame incomplete: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMsgType(u8),
}

/// Wire message carried in a `PingRequest` frame (spec §6 proto sketch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    /// Arbitrary caller-chosen payload, echoed back unchanged.
    pub ping: String,
    /// The caller's local clock reading at send time, nanoseconds (named
    /// `offset_nanos` to match the wire contract verbatim; despite the
    /// name it carries a raw timestamp, not a pre-computed offset — the
    /// offset is derived by whoever receives it).
    pub offset_nanos: i64,
    /// Opaque token; a mismatch means cross-cluster talk.
    pub cluster_id: String,
    /// The caller's own advertised address, for the callee's passive
    /// server-side clock monitor entry (spec §4.2).
    pub node_addr: String,
}

/// Wire message carried in a `PingResponse` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub pong: String,
    /// Sampled as late as possible on the server, immediately before
    /// returning (spec §6: "to minimise asymmetric server-side delay").
    pub server_time_nanos: i64,
    /// The responder's own advertised address, additive to the spec's
    /// proto sketch: lets the dial side record connection metadata
    /// (`remote_node_addr`, SPEC_FULL.md §3) without a second RPC.
    #[serde(default)]
    pub responder_addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let frame = Frame::new(MsgType::PingRequest, flags::COMPRESSED, Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        let decoded = Frame::decode(encoded).expect("decode");
        assert_eq!(decoded.msg_type, MsgType::PingRequest);
        assert!(decoded.is_compressed());
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = Frame::decode(Bytes::from_static(b"ab")).unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort { .. }));
    }

    #[test]
    fn decode_rejects_incomplete_payload() {
        let mut buf = BytesMut::new();
        buf.put_u8(MsgType::PingRequest as u8);
        buf.put_u8(0);
        buf.put_u32(100); // claims 100 bytes of payload, supplies none
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::Incomplete { .. }));
    }

    #[test]
    fn decode_rejects_unknown_msg_type() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xee);
        buf.put_u8(0);
        buf.put_u32(0);
        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMsgType(0xee)));
    }

    #[test]
    fn ping_request_json_round_trips() {
        let req = PingRequest {
            ping: "ping".into(),
            offset_nanos: 42,
            cluster_id: "cluster-a".into(),
            node_addr: "10.0.0.1:9000".into(),
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        let back: PingRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.cluster_id, "cluster-a");
        assert_eq!(back.offset_nanos, 42);
    }
}
