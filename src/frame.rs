//! Length-prefixed framing for the relay wire protocol.
//!
//! Each frame is a 4-byte big-endian payload length followed by that many
//! bytes of UTF-8 text. The prefix is what keeps adjacent messages from
//! merging and multi-kilobyte file payloads from truncating on the stream.

use bytes::{Buf, BufMut, BytesMut};

use crate::{Error, Result};

/// Number of bytes in the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Default cap on a single frame's payload. Large enough for a few
/// megabytes of base64-encoded file data.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Frame a raw payload for the wire.
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf
}

/// Frame a text payload for the wire.
pub fn frame_text(text: &str) -> BytesMut {
    encode_frame(text.as_bytes())
}

/// Try to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` until the buffer holds a complete frame; the caller
/// reads more bytes and retries. A length prefix above `max_len` is
/// unrecoverable since the stream cannot be resynchronized past an
/// arbitrary payload boundary.
pub fn decode_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<BytesMut>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_len {
        return Err(Error::FrameTooLarge { len, max: max_len });
    }
    if buf.len() < LEN_PREFIX + len {
        return Ok(None);
    }

    let mut frame = buf.split_to(LEN_PREFIX + len);
    frame.advance(LEN_PREFIX);
    Ok(Some(frame))
}
