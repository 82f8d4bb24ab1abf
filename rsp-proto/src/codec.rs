//! Checksummed frame codec.
//!
//! Each frame is: `$<payload>#<hh>`, where `hh` is the sum of the raw payload
//! bytes modulo 256 as two hex digits. Reserved bytes inside the payload are
//! escaped with `}` and replies may use `*` run-length encoding.

use thiserror::Error;

use crate::packet::{Command, Response};

/// Start-of-frame delimiter.
pub const START: u8 = b'$';
/// Separates the payload from its checksum.
pub const END: u8 = b'#';
/// Positive acknowledgement of a received frame.
pub const ACK: u8 = b'+';
/// Negative acknowledgement; asks the peer to retransmit.
pub const NACK: u8 = b'-';
/// Out-of-band break request, sent without framing.
pub const INTERRUPT: u8 = 0x03;
/// Escape prefix for reserved payload bytes.
pub const ESCAPE: u8 = b'}';
/// Run-length marker: `x*N` repeats `x` another `N - 29` times.
pub const RUN_LENGTH: u8 = b'*';

/// Escaped bytes are transmitted XOR this value.
const ESCAPE_XOR: u8 = 0x20;
/// Offset subtracted from the run-length count character.
const RUN_LENGTH_BIAS: u8 = 29;

/// A frame that cannot be delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FrameError {
    /// The frame does not begin with `$`.
    #[error("frame does not start with `$`")]
    MissingStart,

    /// The frame is missing its `#hh` trailer.
    #[error("frame is truncated")]
    Truncated,

    /// The two checksum characters are not hex digits.
    #[error("checksum digits are not hex")]
    BadChecksumDigits,

    /// The transmitted checksum disagrees with the payload.
    #[error("checksum mismatch: frame carries {expected:02x}, payload sums to {actual:02x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        expected: u8,
        /// Checksum computed over the received payload.
        actual: u8,
    },

    /// An escape byte ends the payload.
    #[error("dangling escape byte")]
    BadEscape,

    /// A run-length marker has no preceding byte or an invalid count.
    #[error("invalid run-length sequence")]
    BadRunLength,

    /// The payload is well framed but the reply rule rejects it.
    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Computes the RSP checksum: the payload byte sum modulo 256.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, &b| acc.wrapping_add(b))
}

/// Serializes `command` into a complete wire frame.
pub fn encode<C: Command + ?Sized>(command: &C) -> Vec<u8> {
    frame(&escape(command.payload().as_bytes()))
}

/// Wraps an already escaped payload in `$...#hh` framing.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(START);
    out.extend_from_slice(payload);
    out.push(END);
    out.extend_from_slice(format!("{:02x}", checksum(payload)).as_bytes());
    out
}

/// Validates framing and checksum, returning the decoded payload.
///
/// Run-length sequences are expanded and escapes removed, so the result is
/// the payload exactly as the stub meant it.
pub fn unframe(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    let Some((&START, body)) = frame.split_first() else {
        return Err(FrameError::MissingStart);
    };
    let split = body
        .len()
        .checked_sub(3)
        .filter(|&i| body[i] == END)
        .ok_or(FrameError::Truncated)?;
    let (payload, trailer) = body.split_at(split);

    let expected = match hex::decode(&trailer[1..]).as_deref() {
        Ok(&[value]) => value,
        _ => return Err(FrameError::BadChecksumDigits),
    };
    let actual = checksum(payload);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    expand(payload)
}

/// Decodes `frame` as the reply to `command`.
///
/// Identical payloads decode differently depending on the command: the same
/// hex digits are memory contents for [`ReadMemory`](crate::ReadMemory) and
/// a register value for [`ReadRegister`](crate::ReadRegister).
pub fn decode<C: Command + ?Sized>(
    frame: &[u8],
    command: &C,
) -> Result<Response<C::Reply>, FrameError> {
    decode_with(frame, |payload| command.parse_reply(payload))
}

/// Decodes `frame` with an explicit reply rule.
pub fn decode_with<R>(
    frame: &[u8],
    rule: impl FnOnce(&[u8]) -> Result<R, FrameError>,
) -> Result<Response<R>, FrameError> {
    let payload = unframe(frame)?;
    Response::parse(&payload, rule)
}

/// Escapes bytes that would otherwise be read as framing.
fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &byte in payload {
        if matches!(byte, START | END | ESCAPE | RUN_LENGTH) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Undoes escaping and run-length encoding.
fn expand(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(payload.len());
    let mut bytes = payload.iter().copied();
    while let Some(byte) = bytes.next() {
        match byte {
            ESCAPE => {
                let escaped = bytes.next().ok_or(FrameError::BadEscape)?;
                out.push(escaped ^ ESCAPE_XOR);
            }
            RUN_LENGTH => {
                let &repeated = out.last().ok_or(FrameError::BadRunLength)?;
                let count = bytes
                    .next()
                    .and_then(|n| n.checked_sub(RUN_LENGTH_BIAS))
                    .ok_or(FrameError::BadRunLength)?;
                out.extend(std::iter::repeat_n(repeated, usize::from(count)));
            }
            _ => out.push(byte),
        }
    }
    Ok(out)
}
