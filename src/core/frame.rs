//! Frame: the unit of the Conduit wire protocol.
//!
//! Every frame is a 32-byte fixed header followed by an opaque,
//! length-prefixed payload:
//!
//! ```text
//! [Magic(4)] [Version(1)] [Type(1)] [Flags(2)] [Length(4)]
//! [Correlation(8)] [Timestamp(8)] [Reserved(4)] [Payload(N)]
//! ```
//!
//! All multi-byte integers are big-endian. A frame is immutable once
//! constructed.
//!
//! ## Safety
//! - Maximum payload size: 16 MiB (prevents memory exhaustion)
//! - Magic bytes prevent accidental misinterpretation
//! - Length validation before allocation

use crate::config::{MAGIC_BYTES, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::error::{ConduitError, Result};
use crate::utils::time::now_millis;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Frame flag bits (16-bit field, big-endian on the wire)
pub mod flags {
    /// Payload is deflated; inflate before decoding
    pub const COMPRESSED: u16 = 0x0001;
    /// Reserved for a future encryption layer; frames carrying it are rejected
    pub const ENCRYPTED: u16 = 0x0002;
    /// Priority/ack hints; tolerated, never affect correctness
    pub const HINT_MASK: u16 = 0x001C;
    /// Everything else must be zero
    pub const RESERVED_MASK: u16 = !(COMPRESSED | ENCRYPTED | HINT_MASK);
}

/// One-byte message type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Free-form typed message: `{type, data}`
    Message = 0x01,
    /// Correlated call: `{method, params}`
    RpcRequest = 0x02,
    /// Successful call result: `{success: true, result}`
    RpcResponse = 0x03,
    /// Failed call result: `{success: false, error, code?, details?}`
    RpcError = 0x04,
    /// Liveness probe
    HeartbeatPing = 0x05,
    /// Probe answer, mirroring the ping
    HeartbeatPong = 0x06,
    /// Flow control: stop sending data frames
    Pause = 0x07,
    /// Flow control: data frames may flow again
    Resume = 0x08,
    /// Password handshake request
    AuthRequest = 0x10,
    /// Handshake accepted
    AuthSuccess = 0x11,
    /// Handshake rejected
    AuthFailure = 0x12,
    /// Graceful teardown
    Disconnect = 0x20,
    /// Non-fatal protocol complaint
    Error = 0xFF,
}

impl FrameType {
    /// Decode a type tag from its wire byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Message),
            0x02 => Some(Self::RpcRequest),
            0x03 => Some(Self::RpcResponse),
            0x04 => Some(Self::RpcError),
            0x05 => Some(Self::HeartbeatPing),
            0x06 => Some(Self::HeartbeatPong),
            0x07 => Some(Self::Pause),
            0x08 => Some(Self::Resume),
            0x10 => Some(Self::AuthRequest),
            0x11 => Some(Self::AuthSuccess),
            0x12 => Some(Self::AuthFailure),
            0x20 => Some(Self::Disconnect),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }

    /// Control frames pass the send loop even while the peer is paused.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::HeartbeatPing
                | Self::HeartbeatPong
                | Self::Pause
                | Self::Resume
                | Self::AuthRequest
                | Self::AuthSuccess
                | Self::AuthFailure
                | Self::Disconnect
        )
    }

    /// Frames belonging to the authentication handshake.
    pub fn is_auth(self) -> bool {
        matches!(self, Self::AuthRequest | Self::AuthSuccess | Self::AuthFailure)
    }
}

/// One fully-formed protocol unit: header fields plus opaque payload.
///
/// The magic and length fields are implicit; they are materialized by
/// [`Frame::to_bytes`] and checked by [`Frame::from_bytes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version the sender speaks
    pub version: u8,
    /// Message type tag
    pub frame_type: FrameType,
    /// Flag bits; see [`flags`]
    pub flags: u16,
    /// Request/response matching id; 0 for unsolicited frames
    pub correlation: u64,
    /// Sender wall clock, milliseconds since epoch
    pub timestamp_ms: u64,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame stamped with the current protocol version and wall clock.
    pub fn new(frame_type: FrameType, correlation: u64, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags: 0,
            correlation,
            timestamp_ms: now_millis(),
            payload,
        }
    }

    /// Whether the COMPRESSED flag is set.
    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSED != 0
    }

    /// Serialize into a contiguous buffer of exactly `32 + payload.len()` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&MAGIC_BYTES);
        buf.push(self.version);
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.correlation.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a frame from a buffer holding at least one complete frame.
    ///
    /// Trailing bytes beyond `32 + length` are ignored; the framer hands
    /// this function exact prefixes.
    ///
    /// # Errors
    /// `InvalidHeader` for bad magic, truncation, or nonzero reserved
    /// field; `UnsupportedVersion`, `OversizedFrame`, `ReservedFlags`,
    /// and `EncryptionUnsupported` for their namesakes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ConduitError::InvalidHeader);
        }

        if buf[0..4] != MAGIC_BYTES {
            return Err(ConduitError::InvalidHeader);
        }

        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(ConduitError::UnsupportedVersion(version));
        }

        let frame_type = FrameType::from_u8(buf[5]).ok_or(ConduitError::InvalidHeader)?;

        let flag_bits = u16::from_be_bytes([buf[6], buf[7]]);
        if flag_bits & flags::ENCRYPTED != 0 {
            return Err(ConduitError::EncryptionUnsupported);
        }
        if flag_bits & flags::RESERVED_MASK != 0 {
            return Err(ConduitError::ReservedFlags(flag_bits));
        }

        let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ConduitError::OversizedFrame(length));
        }

        let correlation = u64::from_be_bytes([
            buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
        ]);
        let timestamp_ms = u64::from_be_bytes([
            buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
        ]);

        if buf[28..32] != [0u8; 4] {
            return Err(ConduitError::InvalidHeader);
        }

        if buf.len() < HEADER_SIZE + length {
            return Err(ConduitError::InvalidHeader);
        }

        Ok(Self {
            version,
            frame_type,
            flags: flag_bits,
            correlation,
            timestamp_ms,
            payload: buf[HEADER_SIZE..HEADER_SIZE + length].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_every_field() {
        let frame = Frame {
            version: PROTOCOL_VERSION,
            frame_type: FrameType::RpcRequest,
            flags: 0,
            correlation: 0xDEAD_BEEF_CAFE_0001,
            timestamp_ms: 1_700_000_000_123,
            payload: vec![1, 2, 3, 4, 5],
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        let decoded = Frame::from_bytes(&bytes).expect("roundtrip");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_decodes_for_any_type() {
        for tag in [
            FrameType::Message,
            FrameType::HeartbeatPing,
            FrameType::Pause,
            FrameType::Disconnect,
            FrameType::Error,
        ] {
            let frame = Frame::new(tag, 0, Vec::new());
            let decoded = Frame::from_bytes(&frame.to_bytes()).expect("empty payload");
            assert_eq!(decoded.frame_type, tag);
            assert!(decoded.payload.is_empty());
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = Frame::new(FrameType::Message, 0, vec![1]).to_bytes();
        bytes[0] = 0xFF;
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ConduitError::InvalidHeader)
        ));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
        bytes[4] = 99;
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ConduitError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn encrypted_flag_rejected() {
        let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
        bytes[7] |= flags::ENCRYPTED as u8;
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ConduitError::EncryptionUnsupported)
        ));
    }

    #[test]
    fn reserved_flag_bits_rejected() {
        let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
        bytes[6] = 0x80; // high reserved bit
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ConduitError::ReservedFlags(_))
        ));
    }

    #[test]
    fn hint_bits_tolerated() {
        let mut frame = Frame::new(FrameType::Message, 7, vec![9]);
        frame.flags = flags::HINT_MASK;
        let decoded = Frame::from_bytes(&frame.to_bytes()).expect("hint bits are legal");
        assert_eq!(decoded.flags, flags::HINT_MASK);
    }

    #[test]
    fn nonzero_reserved_field_rejected() {
        let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
        bytes[30] = 1;
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ConduitError::InvalidHeader)
        ));
    }

    #[test]
    fn oversized_length_rejected_before_allocation() {
        let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
        bytes[8..12].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ConduitError::OversizedFrame(_))
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let frame = Frame::new(FrameType::Message, 1, vec![0xAA; 16]);
        let bytes = frame.to_bytes();
        assert!(matches!(
            Frame::from_bytes(&bytes[..bytes.len() - 1]),
            Err(ConduitError::InvalidHeader)
        ));
    }

    #[test]
    fn control_classification() {
        assert!(FrameType::HeartbeatPing.is_control());
        assert!(FrameType::Disconnect.is_control());
        assert!(FrameType::AuthRequest.is_control());
        assert!(!FrameType::Message.is_control());
        assert!(!FrameType::RpcRequest.is_control());
        assert!(!FrameType::RpcResponse.is_control());
    }
}
