//! Wire model for the skua protocol.
//!
//! A frame is a fixed 17-byte big-endian header followed by the payload:
//!
//! ```text
//! offset  size  field
//! 0       4     payload_len (u32, excludes the header)
//! 4       8     request_id  (u64)
//! 12      4     cmd         (u32)
//! 16      1     flags       (bitset)
//! 17      N     payload
//! ```
//!
//! The layout is fixed so peers in other languages can interoperate without
//! a schema. This crate only models frames; framing a byte stream, deadlines
//! and stream bookkeeping live in the `skua` crate.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

/// Command identifier routed by the dispatcher.
pub type Cmd = u32;

/// Length of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 17;

/// Default upper bound on a frame payload (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

bitflags! {
    /// Flags carried in each frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// Frame belongs to a multi-frame stream.
        const STREAM = 0x1;
        /// Closes the sender's half of the stream.
        const STREAM_END = 0x2;
        /// Terminates both halves of the stream.
        const STREAM_RST = 0x4;
        /// The handler may run concurrently with later requests.
        const NON_BLOCK = 0x8;
        /// Server-originated frame, exempt from stream bookkeeping.
        const PUSH = 0x10;
    }
}

/// A parsed frame. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream key. Zero is reserved and never valid on the wire.
    pub request_id: u64,
    /// Command identifier.
    pub cmd: Cmd,
    /// Flag bitset.
    pub flags: FrameFlags,
    /// Payload bytes, header excluded.
    pub payload: Bytes,
}

impl Frame {
    /// Encode the full frame (header plus payload) into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        put_header(
            &mut buf,
            self.payload.len() as u32,
            self.request_id,
            self.cmd,
            self.flags,
        );
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes, header excluded.
    pub payload_len: u32,
    /// Stream key.
    pub request_id: u64,
    /// Command identifier.
    pub cmd: Cmd,
    /// Flag bitset.
    pub flags: FrameFlags,
}

/// Append a frame header to `buf`.
pub fn put_header(buf: &mut BytesMut, payload_len: u32, request_id: u64, cmd: Cmd, flags: FrameFlags) {
    buf.put_u32(payload_len);
    buf.put_u64(request_id);
    buf.put_u32(cmd);
    buf.put_u8(flags.bits());
}

/// Patch the payload length of an already-encoded header in place.
///
/// `buf` must start with a header written by [`put_header`].
pub fn patch_payload_len(buf: &mut [u8], payload_len: u32) {
    buf[..4].copy_from_slice(&payload_len.to_be_bytes());
}

/// Decode the fixed header.
///
/// Unknown flag bits are preserved so future flags pass through unharmed.
pub fn decode_header(raw: &[u8; HEADER_LEN]) -> Header {
    Header {
        payload_len: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        request_id: u64::from_be_bytes([
            raw[4], raw[5], raw[6], raw[7], raw[8], raw[9], raw[10], raw[11],
        ]),
        cmd: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
        flags: FrameFlags::from_bits_retain(raw[16]),
    }
}
