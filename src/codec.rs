//! CIP frame codec
//!
//! Every CIP frame is `type (u8) | payload length (u16, big-endian) | payload`.
//! [`CipCodec`] plugs into `tokio_util`'s `FramedRead`/`FramedWrite`: the
//! decoder keeps partial reads in the `BytesMut` buffer and only yields a
//! message once the whole frame is present.
//!
//! Decoded items are `Result<CipMessage, FrameError>`. A malformed frame is
//! consumed and reported as an item so the stream keeps going; only a frame
//! whose declared length cannot be trusted fails the stream with a
//! [`CodecError`].

use bytes::{BufMut, BytesMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::join::{Direction, JoinEvent, JoinValue};

pub mod error;

pub use error::{CodecError, FrameError};

/// Frame header size: type byte + 16-bit length
pub const HEADER_LEN: usize = 3;

/// Largest payload accepted before the stream is considered corrupt
pub const MAX_PAYLOAD_LEN: usize = 1024;

/// Longest serial text a frame can carry (inner length byte counts 4 extra bytes)
pub const MAX_SERIAL_WIRE_LEN: usize = 251;

/// Frame type bytes
pub mod frame_type {
    pub const REGISTER: u8 = 0x01;
    pub const REGISTRATION_RESULT: u8 = 0x02;
    pub const PROCESSOR_DISCONNECT: u8 = 0x03;
    pub const DATA: u8 = 0x05;
    pub const HEARTBEAT: u8 = 0x0D;
    pub const HEARTBEAT_RESPONSE: u8 = 0x0E;
    pub const REGISTRATION_REQUEST: u8 = 0x0F;
    pub const SERIAL: u8 = 0x12;
}

/// Data type bytes inside a 0x05 frame (payload offset 3)
pub mod data_type {
    pub const DIGITAL: u8 = 0x00;
    pub const UPDATE_REQUEST: u8 = 0x03;
    pub const DATE_TIME: u8 = 0x08;
    pub const ANALOG: u8 = 0x14;
    pub const DIGITAL_LATCHING: u8 = 0x27;
}

const REGISTRATION_ACCEPTED: [u8; 4] = [0x00, 0x00, 0x00, 0x1f];
const REGISTRATION_UNKNOWN_IPID: [u8; 3] = [0xff, 0xff, 0x02];
const REGISTRATION_TRAILER: [u8; 5] = [0x40, 0xff, 0xff, 0xf1, 0x01];

/// Outcome of a registration attempt, as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResult {
    Accepted,
    /// The configured IP-ID is not defined in the processor program
    UnknownIpId,
    /// Any other reply; raw payload kept for logging
    Failed(Vec<u8>),
}

/// Update-request sub-types (data type 0x03)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRequestKind {
    /// Ask for (or announce) a full state retransmission
    Standard,
    /// Sent by the processor just before the end of a retransmission
    Penultimate,
    /// Retransmission complete
    EndOfQuery,
    /// Client acknowledgement of [`UpdateRequestKind::EndOfQuery`]
    EndOfQueryAck,
    Other(u8),
}

impl UpdateRequestKind {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => UpdateRequestKind::Standard,
            0x16 => UpdateRequestKind::Penultimate,
            0x1c => UpdateRequestKind::EndOfQuery,
            0x1d => UpdateRequestKind::EndOfQueryAck,
            other => UpdateRequestKind::Other(other),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            UpdateRequestKind::Standard => 0x00,
            UpdateRequestKind::Penultimate => 0x16,
            UpdateRequestKind::EndOfQuery => 0x1c,
            UpdateRequestKind::EndOfQueryAck => 0x1d,
            UpdateRequestKind::Other(byte) => byte,
        }
    }
}

/// A decoded CIP message
///
/// Join numbers are 1-based, as seen by API callers; the codec converts to
/// and from the 0-based wire numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipMessage {
    /// Processor asks the client to register (0x0F)
    RegistrationRequest,
    /// Client registration carrying its IP-ID (0x01)
    Register { ip_id: u8 },
    /// Processor's answer to a registration (0x02)
    RegistrationResult(RegistrationResult),
    /// Processor is dropping the client (0x03)
    ProcessorDisconnect,
    /// Heartbeat (0x0D)
    Heartbeat,
    /// Heartbeat response (0x0E)
    HeartbeatResponse,
    /// Update-request exchange (0x05 / 0x03)
    UpdateRequest(UpdateRequestKind),
    /// Ordinary digital join (0x05 / 0x00)
    Digital { join: u16, value: bool },
    /// Latching ("button") digital join (0x05 / 0x27); the processor
    /// releases it by itself if the client goes quiet
    DigitalLatching { join: u16, value: bool },
    /// Analog join (0x05 / 0x14)
    Analog { join: u16, value: u16 },
    /// Serial join (0x12)
    Serial { join: u16, value: String },
    /// Processor clock (0x05 / 0x08)
    DateTime(NaiveDateTime),
}

impl CipMessage {
    /// Wire message for an outgoing join event
    pub fn for_event(event: &JoinEvent, latching: bool) -> Self {
        match &event.value {
            JoinValue::Digital(value) if latching => CipMessage::DigitalLatching {
                join: event.join,
                value: *value,
            },
            JoinValue::Digital(value) => CipMessage::Digital {
                join: event.join,
                value: *value,
            },
            JoinValue::Analog(value) => CipMessage::Analog {
                join: event.join,
                value: *value,
            },
            JoinValue::Serial(value) => CipMessage::Serial {
                join: event.join,
                value: value.clone(),
            },
        }
    }

    /// Incoming join event carried by this message, if any
    pub fn join_event(&self) -> Option<JoinEvent> {
        match self {
            CipMessage::Digital { join, value } | CipMessage::DigitalLatching { join, value } => {
                Some(JoinEvent::incoming(*join, *value))
            }
            CipMessage::Analog { join, value } => Some(JoinEvent::incoming(*join, *value)),
            CipMessage::Serial { join, value } => {
                Some(JoinEvent::new(*join, Direction::Incoming, JoinValue::Serial(value.clone())))
            }
            _ => None,
        }
    }

    /// Append the encoded frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            CipMessage::RegistrationRequest => {
                put_header(dst, frame_type::REGISTRATION_REQUEST, 0);
            }
            CipMessage::Register { ip_id } => {
                put_header(dst, frame_type::REGISTER, 11);
                dst.put_slice(&[0x00; 5]);
                dst.put_u8(*ip_id);
                dst.put_slice(&REGISTRATION_TRAILER);
            }
            CipMessage::RegistrationResult(result) => {
                let payload: &[u8] = match result {
                    RegistrationResult::Accepted => &REGISTRATION_ACCEPTED,
                    RegistrationResult::UnknownIpId => &REGISTRATION_UNKNOWN_IPID,
                    RegistrationResult::Failed(raw) => raw,
                };
                put_header(dst, frame_type::REGISTRATION_RESULT, payload.len());
                dst.put_slice(payload);
            }
            CipMessage::ProcessorDisconnect => {
                put_header(dst, frame_type::PROCESSOR_DISCONNECT, 0);
            }
            CipMessage::Heartbeat => {
                put_header(dst, frame_type::HEARTBEAT, 2);
                dst.put_u16(0);
            }
            CipMessage::HeartbeatResponse => {
                put_header(dst, frame_type::HEARTBEAT_RESPONSE, 2);
                dst.put_u16(0);
            }
            CipMessage::UpdateRequest(kind) => {
                put_data_header(dst, data_type::UPDATE_REQUEST, 1);
                dst.put_u8(kind.to_byte());
            }
            CipMessage::Digital { join, value } => {
                encode_digital(dst, data_type::DIGITAL, *join, *value)?;
            }
            CipMessage::DigitalLatching { join, value } => {
                encode_digital(dst, data_type::DIGITAL_LATCHING, *join, *value)?;
            }
            CipMessage::Analog { join, value } => {
                let wire = wire_join(*join)?;
                put_data_header(dst, data_type::ANALOG, 4);
                dst.put_u16(wire);
                dst.put_u16(*value);
            }
            CipMessage::Serial { join, value } => {
                let wire = wire_join(*join)?;
                let text = value.as_bytes();
                if text.len() > MAX_SERIAL_WIRE_LEN {
                    return Err(CodecError::SerialTooLong {
                        len: text.len(),
                        max: MAX_SERIAL_WIRE_LEN,
                    });
                }
                put_header(dst, frame_type::SERIAL, 8 + text.len());
                dst.put_slice(&[0x00, 0x00, 0x00]);
                dst.put_u8((4 + text.len()) as u8);
                dst.put_u8(0x34);
                dst.put_u16(wire);
                dst.put_u8(0x03);
                dst.put_slice(text);
            }
            CipMessage::DateTime(at) => {
                put_data_header(dst, data_type::DATE_TIME, 7);
                let year = (at.year() - 2000).clamp(0, 99) as u32;
                dst.put_u8(0x00);
                for field in [at.hour(), at.minute(), at.second(), at.month(), at.day(), year] {
                    dst.put_u8(to_bcd(field));
                }
            }
        }
        Ok(())
    }
}

fn put_header(dst: &mut BytesMut, ty: u8, payload_len: usize) {
    dst.reserve(HEADER_LEN + payload_len);
    dst.put_u8(ty);
    dst.put_u16(payload_len as u16);
}

/// Header for a 0x05 data frame; `body_len` counts the bytes after the data type
fn put_data_header(dst: &mut BytesMut, data_type: u8, body_len: usize) {
    put_header(dst, frame_type::DATA, 4 + body_len);
    dst.put_u16(0);
    dst.put_u8(1 + body_len as u8);
    dst.put_u8(data_type);
}

fn wire_join(join: u16) -> Result<u16, CodecError> {
    join.checked_sub(1).ok_or(CodecError::InvalidJoin(join))
}

fn encode_digital(dst: &mut BytesMut, data_type: u8, join: u16, value: bool) -> Result<(), CodecError> {
    let wire = wire_join(join)?;
    if wire > 0x7fff {
        return Err(CodecError::InvalidJoin(join));
    }
    put_data_header(dst, data_type, 2);
    dst.put_u8((wire & 0xff) as u8);
    let high = (wire >> 8) as u8;
    dst.put_u8(if value { high } else { high | 0x80 });
    Ok(())
}

fn to_bcd(value: u32) -> u8 {
    (((value / 10) << 4) | (value % 10)) as u8
}

fn from_bcd(byte: u8) -> Option<u32> {
    let (tens, units) = (byte >> 4, byte & 0x0f);
    (tens < 10 && units < 10).then(|| u32::from(tens) * 10 + u32::from(units))
}

fn require(ty: u8, payload: &[u8], need: usize) -> Result<(), FrameError> {
    if payload.len() < need {
        return Err(FrameError::Truncated {
            frame_type: ty,
            len: payload.len(),
            need,
        });
    }
    Ok(())
}

fn api_join(wire: u16) -> Result<u16, FrameError> {
    wire.checked_add(1).ok_or(FrameError::JoinOverflow)
}

/// Decode one complete frame's payload
fn decode_frame(ty: u8, payload: &[u8]) -> Result<CipMessage, FrameError> {
    match ty {
        frame_type::REGISTRATION_REQUEST => Ok(CipMessage::RegistrationRequest),
        frame_type::REGISTER => {
            require(ty, payload, 6)?;
            Ok(CipMessage::Register { ip_id: payload[5] })
        }
        frame_type::REGISTRATION_RESULT => {
            let result = if payload == REGISTRATION_ACCEPTED {
                RegistrationResult::Accepted
            } else if payload == REGISTRATION_UNKNOWN_IPID {
                RegistrationResult::UnknownIpId
            } else {
                RegistrationResult::Failed(payload.to_vec())
            };
            Ok(CipMessage::RegistrationResult(result))
        }
        frame_type::PROCESSOR_DISCONNECT => Ok(CipMessage::ProcessorDisconnect),
        frame_type::HEARTBEAT => Ok(CipMessage::Heartbeat),
        frame_type::HEARTBEAT_RESPONSE => Ok(CipMessage::HeartbeatResponse),
        frame_type::DATA => decode_data(payload),
        frame_type::SERIAL => {
            require(ty, payload, 8)?;
            let join = api_join(u16::from_be_bytes([payload[5], payload[6]]))?;
            let text = &payload[8..];
            if !text.is_ascii() {
                return Err(FrameError::InvalidText);
            }
            let value = String::from_utf8(text.to_vec()).map_err(|_| FrameError::InvalidText)?;
            Ok(CipMessage::Serial { join, value })
        }
        other => Err(FrameError::UnknownType(other)),
    }
}

fn decode_data(payload: &[u8]) -> Result<CipMessage, FrameError> {
    require(frame_type::DATA, payload, 4)?;
    match payload[3] {
        dt @ (data_type::DIGITAL | data_type::DIGITAL_LATCHING) => {
            require(frame_type::DATA, payload, 6)?;
            let wire = (u16::from(payload[5] & 0x7f) << 8) | u16::from(payload[4]);
            let join = api_join(wire)?;
            let value = payload[5] & 0x80 == 0;
            Ok(if dt == data_type::DIGITAL {
                CipMessage::Digital { join, value }
            } else {
                CipMessage::DigitalLatching { join, value }
            })
        }
        data_type::ANALOG => {
            require(frame_type::DATA, payload, 8)?;
            let join = api_join(u16::from_be_bytes([payload[4], payload[5]]))?;
            let value = u16::from_be_bytes([payload[6], payload[7]]);
            Ok(CipMessage::Analog { join, value })
        }
        data_type::UPDATE_REQUEST => {
            require(frame_type::DATA, payload, 5)?;
            Ok(CipMessage::UpdateRequest(UpdateRequestKind::from_byte(payload[4])))
        }
        data_type::DATE_TIME => {
            require(frame_type::DATA, payload, 11)?;
            let mut fields = [0u32; 6];
            for (slot, byte) in fields.iter_mut().zip(&payload[5..11]) {
                *slot = from_bcd(*byte).ok_or(FrameError::InvalidDateTime)?;
            }
            let [hour, minute, second, month, day, year] = fields;
            NaiveDate::from_ymd_opt(2000 + year as i32, month, day)
                .and_then(|date| date.and_hms_opt(hour, minute, second))
                .map(CipMessage::DateTime)
                .ok_or(FrameError::InvalidDateTime)
        }
        other => Err(FrameError::UnknownDataType(other)),
    }
}

/// Tokio codec for CIP frames
#[derive(Debug, Clone, Copy, Default)]
pub struct CipCodec;

impl CipCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for CipCodec {
    type Item = Result<CipMessage, FrameError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let ty = src[0];
        let payload_len = usize::from(u16::from_be_bytes([src[1], src[2]]));
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::Oversized {
                len: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let frame_len = HEADER_LEN + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        trace!(frame = %hex::encode(&frame), "RX");

        Ok(Some(decode_frame(ty, &frame[HEADER_LEN..])))
    }
}

impl Encoder<CipMessage> for CipCodec {
    type Error = CodecError;

    fn encode(&mut self, item: CipMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        item.encode_into(dst)?;
        trace!(frame = %hex::encode(&dst[start..]), "TX");
        Ok(())
    }
}

/// Encode a single message into a fresh buffer
pub fn encode(message: &CipMessage) -> Result<BytesMut, CodecError> {
    let mut buf = BytesMut::new();
    message.encode_into(&mut buf)?;
    Ok(buf)
}
