//! Binary wire protocol: varuint framing and the awareness sub-format.
//!
//! Every protocol message travels as one binary WebSocket frame:
//!
//! ```text
//! ┌──────────┬───────────┬─────────────────┐
//! │ kind     │ length    │ payload         │
//! │ 1 byte   │ varuint   │ `length` bytes  │
//! └──────────┴───────────┴─────────────────┘
//! ```
//!
//! Awareness payloads nest one level deeper:
//!
//! ```text
//! ┌───────────┬───────────┬──────────────────┐
//! │ client_id │ json_len  │ json bytes       │
//! │ varuint   │ varuint   │ `json_len` bytes │
//! └───────────┴───────────┴──────────────────┘
//! ```
//!
//! A zero-length JSON body means "remove this client from presence".
//!
//! Varuints are LEB128 unsigned: seven value bits per byte, low group
//! first, high bit as continuation flag, capped at 32 bits. Encoders emit
//! the minimal byte sequence. Decoders borrow from the input buffer;
//! payloads are never copied. Bytes past the declared payload length are
//! tolerated and ignored.

use thiserror::Error;

/// Message kind tag, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// State vector: "here is what I have".
    SyncStep1 = 0x00,
    /// CRDT update: "here is what you are missing".
    SyncStep2 = 0x01,
    /// Ephemeral presence data, relayed but never applied to the document.
    Awareness = 0x02,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0x00 => Ok(MessageKind::SyncStep1),
            0x01 => Ok(MessageKind::SyncStep2),
            0x02 => Ok(MessageKind::Awareness),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Codec failures. The caller drops the offending frame and keeps the
/// connection; a client that sends garbage once may still recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("buffer too short for a frame")]
    ShortBuffer,
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("varuint exceeds 32 bits")]
    VarintOverflow,
    #[error("varuint ends mid-sequence")]
    VarintIncomplete,
    #[error("payload shorter than declared length")]
    PayloadShort,
}

/// A decoded frame. The payload borrows from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub kind: MessageKind,
    pub payload: &'a [u8],
}

/// A decoded awareness payload. `state_json` is `None` for a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwarenessUpdate<'a> {
    pub client_id: u32,
    pub state_json: Option<&'a [u8]>,
}

/// Appends `value` as a minimal LEB128 varuint.
pub fn write_varuint(mut value: u32, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Reads a varuint from the front of `buf`. Returns the value and the
/// number of bytes consumed. Sequences that would shift past 32 bits are
/// rejected.
pub fn read_varuint(buf: &[u8]) -> Result<(u32, usize), ProtocolError> {
    let mut num: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        num |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return u32::try_from(num)
                .map(|value| (value, i + 1))
                .map_err(|_| ProtocolError::VarintOverflow);
        }
        shift += 7;
        if shift >= 32 {
            return Err(ProtocolError::VarintOverflow);
        }
    }
    Err(ProtocolError::VarintIncomplete)
}

/// Frames `payload` under the given kind. Never fails for representable
/// lengths.
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u32::MAX as usize);
    let mut out = Vec::with_capacity(1 + 5 + payload.len());
    out.push(kind as u8);
    write_varuint(payload.len() as u32, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Parses one frame. The returned payload is a view into `buf` of exactly
/// the declared length.
pub fn decode_frame(buf: &[u8]) -> Result<Frame<'_>, ProtocolError> {
    let (&tag, rest) = buf.split_first().ok_or(ProtocolError::ShortBuffer)?;
    let kind = MessageKind::try_from(tag)?;
    let (len, consumed) = read_varuint(rest)?;
    let body = &rest[consumed..];
    let len = len as usize;
    if body.len() < len {
        return Err(ProtocolError::PayloadShort);
    }
    Ok(Frame {
        kind,
        payload: &body[..len],
    })
}

/// Builds a complete awareness frame. `state_json = None` (or an empty
/// slice) encodes a removal of the named client.
pub fn encode_awareness(client_id: u32, state_json: Option<&[u8]>) -> Vec<u8> {
    let json = state_json.unwrap_or(&[]);
    let mut payload = Vec::with_capacity(10 + json.len());
    write_varuint(client_id, &mut payload);
    write_varuint(json.len() as u32, &mut payload);
    payload.extend_from_slice(json);
    encode_frame(MessageKind::Awareness, &payload)
}

/// Parses the nested awareness payload of an already-decoded frame.
pub fn decode_awareness(payload: &[u8]) -> Result<AwarenessUpdate<'_>, ProtocolError> {
    let (client_id, consumed) = read_varuint(payload)?;
    let rest = &payload[consumed..];
    let (json_len, consumed) = read_varuint(rest)?;
    let body = &rest[consumed..];
    let json_len = json_len as usize;
    if body.len() < json_len {
        return Err(ProtocolError::PayloadShort);
    }
    let json = &body[..json_len];
    Ok(AwarenessUpdate {
        client_id,
        state_json: if json.is_empty() { None } else { Some(json) },
    })
}
