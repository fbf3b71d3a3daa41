// Relay wire protocol - framing for the relay control and data messages.
//
// Wire layout (all integers big-endian):
//
//   ConnectSuccess      | u16 tag=1  | u32 len  | len UTF-8 bytes (SID)     |
//   ReconnectSuccessAck | u16 tag=2  | u64 ack                              |
//   Data                | u16 tag=4  | u32 len  | len payload bytes         |
//   Ack                 | u16 tag=7  | u64 ack                              |
//   LongClose           | u16 tag=10 | u32 code | u32 len | len UTF-8 bytes |
//
// Ack values are cumulative byte offsets into the client's write stream,
// never message counts. Tags outside this set decode as Unknown and occupy
// exactly the two tag bytes.

use crate::close_code::CloseCode;
use crate::error::RelayError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::warn;

/// Length of the tag field that prefixes every message.
pub const TAG_LEN: usize = 2;
/// Length of a payload/SID/reason length field.
pub const LEN_FIELD_LEN: usize = 4;
/// Length of a close-code field.
pub const CLOSE_CODE_LEN: usize = 4;
/// Length of an ACK watermark field.
pub const ACK_LEN: usize = 8;

/// Largest payload a single Data message may carry.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;
/// Largest complete wire message: tag + length field + payload.
pub const MAX_MESSAGE_SIZE: usize = TAG_LEN + LEN_FIELD_LEN + MAX_PAYLOAD_LEN;
/// Smallest read buffer the stream accepts, so any one message fits.
pub const MIN_READ_SIZE: usize = MAX_MESSAGE_SIZE;
/// Largest write the stream accepts per call.
pub const MAX_WRITE_SIZE: usize = MAX_PAYLOAD_LEN;

/// Message tags on the wire. The gaps are deprecated messages older relay
/// builds may still emit; they decode as `RelayMessage::Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    ConnectSuccess = 1,
    ReconnectSuccessAck = 2,
    Data = 4,
    Ack = 7,
    LongClose = 10,
}

impl Tag {
    /// Maps a raw wire code to a known tag.
    pub fn from_code(code: u16) -> Option<Tag> {
        match code {
            1 => Some(Tag::ConnectSuccess),
            2 => Some(Tag::ReconnectSuccessAck),
            4 => Some(Tag::Data),
            7 => Some(Tag::Ack),
            10 => Some(Tag::LongClose),
            _ => None,
        }
    }

    /// Writes the 2-byte tag into the front of `buf`, returning the count.
    pub fn encode(self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.len() < TAG_LEN {
            return Err(RelayError::BufferTooSmall {
                given: buf.len(),
                required: TAG_LEN,
            });
        }
        buf[..TAG_LEN].copy_from_slice(&(self as u16).to_be_bytes());
        Ok(TAG_LEN)
    }

    /// Reads a tag from the front of `buf`. `None` means the code is not one
    /// this build knows; 2 bytes are consumed either way.
    pub fn decode(buf: &[u8]) -> Result<(Option<Tag>, usize), RelayError> {
        if buf.len() < TAG_LEN {
            return Err(RelayError::MalformedMessage(format!(
                "need {TAG_LEN} bytes for a tag, have {}",
                buf.len()
            )));
        }
        let code = u16::from_be_bytes([buf[0], buf[1]]);
        Ok((Tag::from_code(code), TAG_LEN))
    }
}

/// A decoded relay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// First message on a fresh session; carries the session id.
    ConnectSuccess { sid: String },
    /// First message after a reconnect; the relay's receive watermark.
    ReconnectSuccessAck { ack: u64 },
    /// Cumulative count of client bytes the relay has consumed.
    Ack { ack: u64 },
    /// One chunk of the tunneled byte stream.
    Data { payload: Bytes },
    /// Transport teardown with a reason code.
    Close { code: CloseCode, reason: String },
    /// A tag this build does not understand.
    Unknown { tag: u16 },
}

impl RelayMessage {
    /// Short name of the message kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::ConnectSuccess { .. } => "ConnectSuccess",
            RelayMessage::ReconnectSuccessAck { .. } => "ReconnectSuccessAck",
            RelayMessage::Ack { .. } => "Ack",
            RelayMessage::Data { .. } => "Data",
            RelayMessage::Close { .. } => "LongClose",
            RelayMessage::Unknown { .. } => "Unknown",
        }
    }

    /// Exact number of bytes `encode` produces for this message.
    pub fn encoded_len(&self) -> usize {
        match self {
            RelayMessage::ConnectSuccess { sid } => TAG_LEN + LEN_FIELD_LEN + sid.len(),
            RelayMessage::ReconnectSuccessAck { .. } | RelayMessage::Ack { .. } => {
                TAG_LEN + ACK_LEN
            }
            RelayMessage::Data { payload } => TAG_LEN + LEN_FIELD_LEN + payload.len(),
            RelayMessage::Close { reason, .. } => {
                TAG_LEN + CLOSE_CODE_LEN + LEN_FIELD_LEN + reason.len()
            }
            RelayMessage::Unknown { .. } => TAG_LEN,
        }
    }

    fn validate(&self) -> Result<(), RelayError> {
        match self {
            RelayMessage::Data { payload } => {
                if payload.is_empty() {
                    return Err(RelayError::EmptyPayload);
                }
                if payload.len() > MAX_PAYLOAD_LEN {
                    return Err(RelayError::PayloadTooLarge {
                        given: payload.len(),
                        max: MAX_PAYLOAD_LEN,
                    });
                }
            }
            RelayMessage::ConnectSuccess { sid } => {
                if sid.len() > MAX_PAYLOAD_LEN {
                    return Err(RelayError::PayloadTooLarge {
                        given: sid.len(),
                        max: MAX_PAYLOAD_LEN,
                    });
                }
            }
            RelayMessage::Close { reason, .. } => {
                if reason.len() > MAX_PAYLOAD_LEN {
                    return Err(RelayError::PayloadTooLarge {
                        given: reason.len(),
                        max: MAX_PAYLOAD_LEN,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Encodes `msg` into the front of `buf`, returning the bytes written.
/// Fails without touching `buf` when the message is invalid or `buf` is too
/// small for the encoded form.
pub fn encode(msg: &RelayMessage, buf: &mut [u8]) -> Result<usize, RelayError> {
    msg.validate()?;
    let need = msg.encoded_len();
    if buf.len() < need {
        return Err(RelayError::BufferTooSmall {
            given: buf.len(),
            required: need,
        });
    }
    let mut out = &mut buf[..need];
    put_message(msg, &mut out);
    Ok(need)
}

/// Appends `msg` to `buf`, reserving space as needed. Returns the bytes
/// appended.
pub fn encode_into(msg: &RelayMessage, buf: &mut BytesMut) -> Result<usize, RelayError> {
    msg.validate()?;
    let need = msg.encoded_len();
    buf.reserve(need);
    put_message(msg, buf);
    Ok(need)
}

// Writers below assume `validate` passed and the sink has room.
fn put_message<B: BufMut>(msg: &RelayMessage, out: &mut B) {
    match msg {
        RelayMessage::ConnectSuccess { sid } => {
            out.put_u16(Tag::ConnectSuccess as u16);
            out.put_u32(sid.len() as u32);
            out.put_slice(sid.as_bytes());
        }
        RelayMessage::ReconnectSuccessAck { ack } => {
            out.put_u16(Tag::ReconnectSuccessAck as u16);
            out.put_u64(*ack);
        }
        RelayMessage::Ack { ack } => {
            out.put_u16(Tag::Ack as u16);
            out.put_u64(*ack);
        }
        RelayMessage::Data { payload } => {
            out.put_u16(Tag::Data as u16);
            out.put_u32(payload.len() as u32);
            out.put_slice(payload);
        }
        RelayMessage::Close { code, reason } => {
            out.put_u16(Tag::LongClose as u16);
            out.put_u32(code.code());
            out.put_u32(reason.len() as u32);
            out.put_slice(reason.as_bytes());
        }
        RelayMessage::Unknown { tag } => {
            out.put_u16(*tag);
        }
    }
}

/// Decodes one message from the front of `buf`, returning it and the bytes
/// consumed. Fails when `buf` holds fewer bytes than the declared lengths
/// require.
pub fn decode(buf: &[u8]) -> Result<(RelayMessage, usize), RelayError> {
    let mut work = BytesMut::from(buf);
    let before = work.len();
    match try_parse_message(&mut work)? {
        Some(msg) => Ok((msg, before - work.len())),
        None => Err(RelayError::MalformedMessage(format!(
            "truncated message: {} bytes do not hold a complete message",
            buf.len()
        ))),
    }
}

/// Attempts to parse one complete message from the front of `buf`, advancing
/// past it. `Ok(None)` means the buffer holds only a prefix of a message and
/// more transport bytes are needed.
pub fn try_parse_message(buf: &mut BytesMut) -> Result<Option<RelayMessage>, RelayError> {
    if buf.len() < TAG_LEN {
        return Ok(None);
    }
    let code = (&buf[..]).get_u16();
    let Some(tag) = Tag::from_code(code) else {
        buf.advance(TAG_LEN);
        return Ok(Some(RelayMessage::Unknown { tag: code }));
    };
    match tag {
        Tag::ReconnectSuccessAck | Tag::Ack => {
            if buf.len() < TAG_LEN + ACK_LEN {
                return Ok(None);
            }
            buf.advance(TAG_LEN);
            let ack = buf.get_u64();
            Ok(Some(match tag {
                Tag::Ack => RelayMessage::Ack { ack },
                _ => RelayMessage::ReconnectSuccessAck { ack },
            }))
        }
        Tag::ConnectSuccess => {
            if buf.len() < TAG_LEN + LEN_FIELD_LEN {
                return Ok(None);
            }
            let len = (&buf[TAG_LEN..]).get_u32() as usize;
            if len > MAX_PAYLOAD_LEN {
                warn!("Oversized SID field: {} bytes", len);
                return Err(RelayError::MalformedMessage(format!(
                    "declared SID length {len} exceeds {MAX_PAYLOAD_LEN}"
                )));
            }
            if buf.len() < TAG_LEN + LEN_FIELD_LEN + len {
                return Ok(None);
            }
            buf.advance(TAG_LEN + LEN_FIELD_LEN);
            let raw = buf.split_to(len);
            let sid = std::str::from_utf8(&raw)
                .map_err(|_| RelayError::MalformedMessage("SID is not valid UTF-8".into()))?
                .to_owned();
            Ok(Some(RelayMessage::ConnectSuccess { sid }))
        }
        Tag::Data => {
            if buf.len() < TAG_LEN + LEN_FIELD_LEN {
                return Ok(None);
            }
            let len = (&buf[TAG_LEN..]).get_u32() as usize;
            if len == 0 {
                return Err(RelayError::MalformedMessage(
                    "zero-length data payload".into(),
                ));
            }
            if len > MAX_PAYLOAD_LEN {
                warn!("Oversized data payload: {} bytes", len);
                return Err(RelayError::MalformedMessage(format!(
                    "declared payload length {len} exceeds {MAX_PAYLOAD_LEN}"
                )));
            }
            if buf.len() < TAG_LEN + LEN_FIELD_LEN + len {
                return Ok(None);
            }
            buf.advance(TAG_LEN + LEN_FIELD_LEN);
            let payload = buf.split_to(len).freeze();
            Ok(Some(RelayMessage::Data { payload }))
        }
        Tag::LongClose => {
            if buf.len() < TAG_LEN + CLOSE_CODE_LEN + LEN_FIELD_LEN {
                return Ok(None);
            }
            let mut peek = &buf[TAG_LEN..];
            let raw_code = peek.get_u32();
            let len = peek.get_u32() as usize;
            if len > MAX_PAYLOAD_LEN {
                warn!("Oversized close reason: {} bytes", len);
                return Err(RelayError::MalformedMessage(format!(
                    "declared close reason length {len} exceeds {MAX_PAYLOAD_LEN}"
                )));
            }
            if buf.len() < TAG_LEN + CLOSE_CODE_LEN + LEN_FIELD_LEN + len {
                return Ok(None);
            }
            buf.advance(TAG_LEN + CLOSE_CODE_LEN + LEN_FIELD_LEN);
            let raw = buf.split_to(len);
            let reason = std::str::from_utf8(&raw)
                .map_err(|_| {
                    RelayError::MalformedMessage("close reason is not valid UTF-8".into())
                })?
                .to_owned();
            Ok(Some(RelayMessage::Close {
                code: CloseCode::from_code(raw_code),
                reason,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: RelayMessage) {
        let mut buf = BytesMut::new();
        let written = encode_into(&msg, &mut buf).expect("encode");
        assert_eq!(written, buf.len());
        let (decoded, consumed) = decode(&buf).expect("decode");
        assert_eq!(consumed, written);
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn encode_round_trips_every_kind() {
        round_trip(RelayMessage::ConnectSuccess {
            sid: "session-1".into(),
        });
        round_trip(RelayMessage::ReconnectSuccessAck { ack: 901 });
        round_trip(RelayMessage::Ack { ack: u64::MAX });
        round_trip(RelayMessage::Data {
            payload: Bytes::from_static(b"payload bytes"),
        });
        round_trip(RelayMessage::Close {
            code: CloseCode::SidInUse,
            reason: "busy".into(),
        });
        round_trip(RelayMessage::Close {
            code: CloseCode::Other(4999),
            reason: String::new(),
        });
        round_trip(RelayMessage::Unknown { tag: 9 });
    }

    #[tokio::test]
    async fn parse_handles_split_input() {
        let mut wire = BytesMut::new();
        encode_into(
            &RelayMessage::Data {
                payload: Bytes::from_static(b"abcdef"),
            },
            &mut wire,
        )
        .unwrap();
        encode_into(&RelayMessage::Ack { ack: 6 }, &mut wire).unwrap();

        // Feed one byte at a time; the parser must never mis-frame.
        let mut acc = BytesMut::new();
        let mut seen = Vec::new();
        for b in wire.iter() {
            acc.put_u8(*b);
            while let Some(msg) = try_parse_message(&mut acc).unwrap() {
                seen.push(msg);
            }
        }
        assert_eq!(
            seen,
            vec![
                RelayMessage::Data {
                    payload: Bytes::from_static(b"abcdef")
                },
                RelayMessage::Ack { ack: 6 },
            ]
        );
        assert!(acc.is_empty());
    }

    #[tokio::test]
    async fn declared_length_violations_fail() {
        // Data with a declared length beyond the cap.
        let mut bad = BytesMut::new();
        bad.put_u16(Tag::Data as u16);
        bad.put_u32((MAX_PAYLOAD_LEN + 1) as u32);
        assert!(try_parse_message(&mut bad).is_err());

        // Zero-length data is never valid on the wire.
        let mut zero = BytesMut::new();
        zero.put_u16(Tag::Data as u16);
        zero.put_u32(0);
        assert!(try_parse_message(&mut zero).is_err());
    }
}
