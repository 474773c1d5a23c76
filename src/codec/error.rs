//! Codec error taxonomy
//!
//! - [`FrameError`]: a single frame was malformed. The frame has already been
//!   consumed from the buffer, so decoding can carry on with the next one.
//! - [`CodecError`]: the stream can no longer be trusted (or an outgoing
//!   message cannot be represented). The connection has to be dropped.

use std::io;

use thiserror::Error;

/// Recoverable, per-frame decoding fault
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Frame type byte is not one the client understands
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),

    /// Data frame (0x05) carried an unknown data type
    #[error("unknown data type 0x{0:02x}")]
    UnknownDataType(u8),

    /// Payload too short for its frame/data type
    #[error("truncated 0x{frame_type:02x} frame: {len} payload bytes, need {need}")]
    Truncated {
        frame_type: u8,
        len: usize,
        need: usize,
    },

    /// Wire join number does not map onto a 16-bit API join number
    #[error("join number out of range")]
    JoinOverflow,

    /// Serial payload is not ASCII text
    #[error("serial payload is not ASCII")]
    InvalidText,

    /// Date/time payload is not valid BCD or not a real date
    #[error("invalid date/time payload")]
    InvalidDateTime,
}

/// Unrecoverable codec error
#[derive(Debug, Error)]
pub enum CodecError {
    /// Declared payload length exceeds what any CIP frame can carry; the
    /// frame boundary is lost
    #[error("frame declares {len} payload bytes, maximum is {max}")]
    Oversized { len: usize, max: usize },

    /// Join 0 cannot be put on the wire
    #[error("join {0} cannot be encoded")]
    InvalidJoin(u16),

    /// Serial text does not fit the frame's inner length byte
    #[error("serial value of {len} bytes exceeds {max}")]
    SerialTooLong { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}
