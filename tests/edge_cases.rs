#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for the frame layer: boundary sizes, flag handling,
//! compression limits, and malformed input.

use bytes::BytesMut;
use conduit::config::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use conduit::core::frame::{flags, Frame, FrameType, HEADER_SIZE};
use conduit::core::FrameCodec;
use conduit::error::ConduitError;
use tokio_util::codec::{Decoder, Encoder};

// ============================================================================
// FRAME BOUNDARY CASES
// ============================================================================

#[test]
fn test_frame_empty_payload() {
    let frame = Frame::new(FrameType::Message, 0, vec![]);
    let bytes = frame.to_bytes();
    assert_eq!(bytes.len(), HEADER_SIZE);
    let decoded = Frame::from_bytes(&bytes).expect("Should decode empty payload");
    assert!(decoded.payload.is_empty());
    assert_eq!(decoded.version, PROTOCOL_VERSION);
}

#[test]
fn test_frame_max_payload_size() {
    let max_payload = vec![0xAB; MAX_FRAME_SIZE];
    let frame = Frame::new(FrameType::Message, 1, max_payload);
    let bytes = frame.to_bytes();
    let decoded = Frame::from_bytes(&bytes).expect("Should decode max payload");
    assert_eq!(decoded.payload.len(), MAX_FRAME_SIZE);
}

#[test]
fn test_frame_oversized_length_rejected() {
    // Craft a header claiming one byte more than the maximum
    let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
    bytes[8..12].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());

    match Frame::from_bytes(&bytes) {
        Err(ConduitError::OversizedFrame(n)) => assert_eq!(n, MAX_FRAME_SIZE + 1),
        other => panic!("Unexpected result: {other:?}"),
    }
}

#[test]
fn test_frame_invalid_magic_bytes() {
    let mut bytes = Frame::new(FrameType::Message, 0, vec![0xAA; 5]).to_bytes();
    bytes[0..4].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);

    assert!(
        matches!(Frame::from_bytes(&bytes), Err(ConduitError::InvalidHeader)),
        "Should reject invalid magic bytes"
    );
}

#[test]
fn test_frame_unsupported_version() {
    let mut bytes = Frame::new(FrameType::Message, 0, vec![0xAA; 5]).to_bytes();
    bytes[4] = 99;

    match Frame::from_bytes(&bytes) {
        Err(ConduitError::UnsupportedVersion(99)) => {}
        other => panic!("Unexpected: {other:?}"),
    }
}

#[test]
fn test_frame_unknown_type_tag() {
    let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
    bytes[5] = 0x7E; // unassigned tag
    assert!(matches!(
        Frame::from_bytes(&bytes),
        Err(ConduitError::InvalidHeader)
    ));
}

#[test]
fn test_frame_truncated_header() {
    let bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
    let result = Frame::from_bytes(&bytes[..HEADER_SIZE - 1]);
    assert!(
        matches!(result, Err(ConduitError::InvalidHeader)),
        "Should reject truncated header"
    );
}

#[test]
fn test_frame_empty_buffer() {
    let result = Frame::from_bytes(&[]);
    assert!(
        matches!(result, Err(ConduitError::InvalidHeader)),
        "Should reject empty buffer"
    );
}

#[test]
fn test_correlation_id_extremes() {
    for correlation in [0u64, 1, u64::MAX] {
        let frame = Frame::new(FrameType::RpcRequest, correlation, vec![1, 2, 3]);
        let decoded = Frame::from_bytes(&frame.to_bytes()).expect("roundtrip");
        assert_eq!(decoded.correlation, correlation);
    }
}

// ============================================================================
// FLAG HANDLING
// ============================================================================

#[test]
fn test_encrypted_flag_rejected() {
    let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
    bytes[7] |= flags::ENCRYPTED as u8;
    assert!(matches!(
        Frame::from_bytes(&bytes),
        Err(ConduitError::EncryptionUnsupported)
    ));
}

#[test]
fn test_reserved_flag_bits_rejected() {
    let mut bytes = Frame::new(FrameType::Message, 0, vec![]).to_bytes();
    bytes[6] = 0x01; // bit 8: reserved
    assert!(matches!(
        Frame::from_bytes(&bytes),
        Err(ConduitError::ReservedFlags(_))
    ));
}

#[test]
fn test_priority_hint_bits_tolerated() {
    let mut frame = Frame::new(FrameType::Message, 0, vec![7; 3]);
    frame.flags = flags::HINT_MASK;
    let decoded = Frame::from_bytes(&frame.to_bytes()).expect("hints are legal");
    assert_eq!(decoded.payload, vec![7; 3]);
}

// ============================================================================
// CODEC STREAMING
// ============================================================================

#[test]
fn test_codec_byte_at_a_time() {
    let mut codec = FrameCodec::new();
    let frame = Frame::new(FrameType::RpcResponse, 9, b"piecemeal".to_vec());
    let full = frame.to_bytes();

    let mut buf = BytesMut::new();
    for (i, byte) in full.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let out = codec.decode(&mut buf).expect("no error");
        if i + 1 < full.len() {
            assert!(out.is_none(), "frame complete too early at byte {i}");
        } else {
            assert_eq!(out.expect("final byte completes the frame"), frame);
        }
    }
}

#[test]
fn test_codec_rejects_garbage_prefix() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 12345678\r\n\r\n"[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(ConduitError::InvalidHeader)
    ));
}

// ============================================================================
// COMPRESSION LIMITS
// ============================================================================

#[test]
fn test_compression_bomb_rejected() {
    // A payload that inflates beyond the frame limit must be refused even
    // though its on-wire size is tiny
    let oversize = vec![0u8; MAX_FRAME_SIZE + 1];
    let deflated = conduit::utils::compression::compress(&oversize).expect("compress");
    assert!(deflated.len() < MAX_FRAME_SIZE);

    let mut frame = Frame::new(FrameType::Message, 0, deflated);
    frame.flags = flags::COMPRESSED;
    let mut buf = BytesMut::from(&frame.to_bytes()[..]);

    let mut codec = FrameCodec::new();
    assert!(matches!(
        codec.decode(&mut buf),
        Err(ConduitError::DecompressionFailure)
    ));
}

#[test]
fn test_inflate_at_limit_accepted() {
    let exact = vec![0u8; MAX_FRAME_SIZE];
    let deflated = conduit::utils::compression::compress(&exact).expect("compress");

    let mut frame = Frame::new(FrameType::Message, 0, deflated);
    frame.flags = flags::COMPRESSED;
    let mut buf = BytesMut::from(&frame.to_bytes()[..]);

    let mut codec = FrameCodec::new();
    let decoded = codec
        .decode(&mut buf)
        .expect("decode")
        .expect("complete frame");
    assert_eq!(decoded.payload.len(), MAX_FRAME_SIZE);
}

#[test]
fn test_compressed_flag_with_garbage_rejected() {
    let mut frame = Frame::new(FrameType::Message, 0, vec![0xFF; 64]);
    frame.flags = flags::COMPRESSED;
    let mut buf = BytesMut::from(&frame.to_bytes()[..]);

    let mut codec = FrameCodec::new();
    assert!(matches!(
        codec.decode(&mut buf),
        Err(ConduitError::DecompressionFailure)
    ));
}

#[test]
fn test_encoder_decoder_symmetry_with_compression() {
    let mut codec = FrameCodec::with_compression(true);
    let payload: Vec<u8> = b"conduit ".repeat(512);
    let frame = Frame::new(FrameType::Message, 77, payload.clone());

    let mut buf = BytesMut::new();
    codec.encode(frame.clone(), &mut buf).expect("encode");
    let decoded = codec.decode(&mut buf).expect("decode").expect("complete");
    assert_eq!(decoded.payload, payload);
    assert_eq!(decoded.correlation, 77);
}
