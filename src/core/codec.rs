//! Tokio codec for framing Conduit frames over a byte stream.
//!
//! The decoder buffers bytes until a complete frame is present, validating
//! the magic and length cap as soon as the header is visible so a corrupt
//! stream fails fast instead of stalling. The encoder applies the per-frame
//! compression policy: payloads above the threshold are deflated and kept
//! only when the result is strictly smaller.

use crate::config::{COMPRESSION_THRESHOLD, MAGIC_BYTES, MAX_FRAME_SIZE};
use crate::core::frame::{flags, Frame, HEADER_SIZE};
use crate::error::ConduitError;
use crate::utils::compression::{maybe_compress, maybe_decompress};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec carrying the compression policy for its connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    enable_compression: bool,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable outbound payload compression above the threshold.
    pub fn with_compression(enable: bool) -> Self {
        Self {
            enable_compression: enable,
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ConduitError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(ConduitError::OversizedFrame(frame.payload.len()));
        }

        let (payload, compressed) = if self.enable_compression {
            maybe_compress(&frame.payload, COMPRESSION_THRESHOLD)?
        } else {
            (frame.payload, false)
        };

        let mut flag_bits = frame.flags & !flags::COMPRESSED;
        if compressed {
            flag_bits |= flags::COMPRESSED;
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(frame.version);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u16(flag_bits);
        dst.put_u32(payload.len() as u32);
        dst.put_u64(frame.correlation);
        dst.put_u64(frame.timestamp_ms);
        dst.put_slice(&[0u8; 4]);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ConduitError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        // Fail fast on a corrupt stream before waiting for more bytes
        if src[0..4] != MAGIC_BYTES {
            return Err(ConduitError::InvalidHeader);
        }
        let length = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(ConduitError::OversizedFrame(length));
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame_bytes = src.split_to(total);
        let mut frame = Frame::from_bytes(&frame_bytes)?;

        if frame.is_compressed() {
            frame.payload = maybe_decompress(&frame.payload, true)?;
            frame.flags &= !flags::COMPRESSED;
        }

        Ok(Some(frame))
    }
}
