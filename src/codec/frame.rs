//! Transport Framing.
//!
//! Links carry a stream of frames, each holding exactly one encoded flit:
//!
//! ```text
//! +----------------------+----------------------+
//! | length (u32, BE)     | flit bytes (length)  |
//! +----------------------+----------------------+
//! ```
//!
//! A length shorter than a flit header or longer than the link's flit
//! capacity is a `FormatError`; the link that produced it is closed.

use super::flit::FLIT_HEADER_LEN;
use crate::common::constants::FRAME_LEN_PREFIX;
use crate::common::FormatError;

/// Prepends the big-endian length prefix to an encoded flit.
pub fn encode_frame(flit: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_LEN_PREFIX + flit.len());
    buf.extend_from_slice(&(flit.len() as u32).to_be_bytes());
    buf.extend_from_slice(flit);
    buf
}

/// Validates a received length prefix.
///
/// # Arguments
///
/// * `prefix` - The four prefix bytes as read from the stream
/// * `max` - Largest acceptable body (the link's flit capacity)
///
/// # Returns
///
/// The body length in bytes.
pub fn decode_frame_len(prefix: [u8; FRAME_LEN_PREFIX], max: usize) -> Result<usize, FormatError> {
    let length = u32::from_be_bytes(prefix) as usize;
    if length < FLIT_HEADER_LEN || length > max {
        return Err(FormatError::FrameLength {
            length,
            min: FLIT_HEADER_LEN,
            max,
        });
    }
    Ok(length)
}
