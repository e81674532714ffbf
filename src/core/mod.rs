//! # Core Protocol Components
//!
//! Low-level frame handling, codecs, and payload serialization.
//!
//! This module provides the foundation for the protocol: frame layout,
//! encoding/decoding, and the MessagePack payload format.
//!
//! ## Components
//! - **Frame**: binary frame format with magic bytes and a 32-byte header
//! - **Codec**: tokio codec for framing over byte streams
//! - **Payload**: MessagePack bodies for control frames and envelopes
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Type(1)] [Flags(2)] [Length(4)]
//! [Correlation(8)] [Timestamp(8)] [Reserved(4)] [Payload(N)]
//! ```

pub mod codec;
pub mod frame;
pub mod payload;

pub use codec::FrameCodec;
pub use frame::{Frame, FrameType, HEADER_SIZE};
