//! Link framing. Each message travels as a little-endian `u32` length followed by its
//! bincode body; the transport seals whole frames before they hit the socket.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
/// Upper bound on a frame body. A 64 KiB payload chunk plus its header fits easily.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("serialize: {0}")]
    Encode(#[from] bincode::Error),
    #[error("message body of {0} bytes exceeds frame limit")]
    TooLarge(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    /// The buffer ends before the frame does; read more and retry.
    #[error("incomplete frame")]
    NeedMore,
    #[error("announced frame length {0} exceeds limit")]
    TooLarge(u32),
    #[error("deserialize: {0}")]
    Decode(#[from] bincode::Error),
}

/// Body length announced by a frame header, once enough bytes are present.
pub fn announced_len(bytes: &[u8]) -> Option<u32> {
    let header: [u8; LEN_SIZE] = bytes.get(..LEN_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(header))
}

pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(msg)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|n| *n <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge(body.len()))?;
    let mut frame = Vec::with_capacity(LEN_SIZE + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend(body);
    Ok(frame)
}

/// Decode the frame at the front of `bytes`, returning the message and the bytes it used.
/// Trailing bytes belong to the next frame and are left alone.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = announced_len(bytes).ok_or(FrameDecodeError::NeedMore)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let end = LEN_SIZE + len as usize;
    let body = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((bincode::deserialize(body)?, end))
}
