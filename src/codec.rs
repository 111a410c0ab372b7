//! Delivery encoding: a byte-stream segment plus control metadata, packed
//! into one self-delimiting mesh delivery.
//!
//! Two interchangeable encapsulations of the same logical protocol:
//!
//! - **Lite** (default): `[uvarint frame_len][u8 control][uvarint seq][payload]`
//!   where `frame_len` counts everything after the length prefix. uvarint is
//!   7 bits per byte, MSB continuation.
//! - **Legacy**: `[u32 BE body_len][u8 control][u64 BE seq][payload]` where
//!   `body_len` counts everything after the length word.
//!
//! Both round-trip losslessly: concatenating decoded payloads in sequence
//! order reproduces the original byte stream, with zero-length control-only
//! deliveries interleaved at the correct positions. They are NOT
//! cross-compatible mid-stream — each endpoint pair picks one.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Upper bound on one encoded delivery. Anything larger decodes to a
/// `ProtocolViolation` rather than an allocation.
pub const MAX_DELIVERY_SIZE: u64 = 1 << 20;

/// Control metadata carried by a delivery.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Plain payload segment.
    Payload = 0,
    /// Half-close: the sending direction has no more data; the opposite
    /// direction keeps flowing.
    CloseWrite = 1,
    /// Orderly full close.
    Close = 2,
    /// Abrupt termination; unsettled deliveries are released.
    Reset = 3,
}

impl TryFrom<u8> for Control {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::Payload),
            1 => Ok(Self::CloseWrite),
            2 => Ok(Self::Close),
            3 => Ok(Self::Reset),
            other => Err(Error::ProtocolViolation(format!(
                "unknown control byte {other:#04x}"
            ))),
        }
    }
}

/// One transported unit on the mesh: a payload chunk (possibly empty for
/// pure control) plus control metadata, sequenced per sub-stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Strictly increasing per sub-stream, starting at 0. Out-of-order or
    /// duplicate sequence numbers are a protocol violation at the receiver.
    pub seq: u64,
    pub payload: Bytes,
    pub control: Control,
}

impl Delivery {
    pub fn payload(seq: u64, payload: Bytes) -> Self {
        Self {
            seq,
            payload,
            control: Control::Payload,
        }
    }

    /// A zero-payload control delivery.
    pub fn control(seq: u64, control: Control) -> Self {
        Self {
            seq,
            payload: Bytes::new(),
            control,
        }
    }
}

/// How a delivery was resolved by the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Settlement {
    /// Payload fully written to the local socket; credit returns to the
    /// sender's flow window.
    Accepted,
    /// Given back without being consumed (reset, dial failure). No credit.
    Released,
    /// Refused as malformed. No credit.
    Rejected,
}

/// Wire encapsulation variant, selected per endpoint by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encapsulation {
    Legacy,
    #[default]
    Lite,
}

impl std::str::FromStr for Encapsulation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "lite" => Ok(Self::Lite),
            other => Err(Error::ProtocolViolation(format!(
                "unknown encapsulation {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for Encapsulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Lite => f.write_str("lite"),
        }
    }
}

impl Encapsulation {
    /// Encode a delivery into one self-delimiting frame.
    pub fn encode(&self, delivery: &Delivery) -> Bytes {
        match self {
            Self::Lite => {
                let seq = encode_uvarint(delivery.seq);
                let frame_len = 1 + seq.len() + delivery.payload.len();
                let mut buf = BytesMut::with_capacity(10 + frame_len);
                buf.extend_from_slice(&encode_uvarint(frame_len as u64));
                buf.put_u8(delivery.control as u8);
                buf.extend_from_slice(&seq);
                buf.extend_from_slice(&delivery.payload);
                buf.freeze()
            }
            Self::Legacy => {
                let body_len = 1 + 8 + delivery.payload.len();
                let mut buf = BytesMut::with_capacity(4 + body_len);
                buf.put_u32(body_len as u32);
                buf.put_u8(delivery.control as u8);
                buf.put_u64(delivery.seq);
                buf.extend_from_slice(&delivery.payload);
                buf.freeze()
            }
        }
    }

    /// Decode one frame. The frame must be exactly one delivery — trailing
    /// bytes, truncation, length mismatches, unknown control bytes, and
    /// oversized frames are all protocol violations.
    pub fn decode(&self, frame: &[u8]) -> Result<Delivery, Error> {
        match self {
            Self::Lite => decode_lite(frame),
            Self::Legacy => decode_legacy(frame),
        }
    }
}

fn decode_lite(frame: &[u8]) -> Result<Delivery, Error> {
    let (frame_len, len_bytes) = decode_uvarint(frame)
        .ok_or_else(|| Error::ProtocolViolation("invalid length uvarint".into()))?;
    if frame_len > MAX_DELIVERY_SIZE {
        return Err(Error::ProtocolViolation(format!(
            "frame length {frame_len} exceeds maximum {MAX_DELIVERY_SIZE}"
        )));
    }
    let body = &frame[len_bytes..];
    if body.len() as u64 != frame_len {
        return Err(Error::ProtocolViolation(format!(
            "frame length {frame_len} does not match body length {}",
            body.len()
        )));
    }
    if body.is_empty() {
        return Err(Error::ProtocolViolation("empty frame body".into()));
    }
    let control = Control::try_from(body[0])?;
    let (seq, seq_bytes) = decode_uvarint(&body[1..])
        .ok_or_else(|| Error::ProtocolViolation("invalid sequence uvarint".into()))?;
    let payload = Bytes::copy_from_slice(&body[1 + seq_bytes..]);
    Ok(Delivery {
        seq,
        payload,
        control,
    })
}

fn decode_legacy(frame: &[u8]) -> Result<Delivery, Error> {
    if frame.len() < 4 {
        return Err(Error::ProtocolViolation("truncated length word".into()));
    }
    let body_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as u64;
    if body_len > MAX_DELIVERY_SIZE {
        return Err(Error::ProtocolViolation(format!(
            "frame length {body_len} exceeds maximum {MAX_DELIVERY_SIZE}"
        )));
    }
    let body = &frame[4..];
    if body.len() as u64 != body_len {
        return Err(Error::ProtocolViolation(format!(
            "frame length {body_len} does not match body length {}",
            body.len()
        )));
    }
    if body.len() < 9 {
        return Err(Error::ProtocolViolation("truncated delivery header".into()));
    }
    let control = Control::try_from(body[0])?;
    let seq = u64::from_be_bytes(body[1..9].try_into().expect("9-byte header"));
    let payload = Bytes::copy_from_slice(&body[9..]);
    Ok(Delivery {
        seq,
        payload,
        control,
    })
}

// ── uvarint encoding ─────────────────────────────────────────────────

/// Encode a u64 as a uvarint (7 bits per byte, MSB = continuation).
pub fn encode_uvarint(mut x: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    while x >= 0x80 {
        buf.push((x as u8) | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
    buf
}

/// Decode a uvarint from a byte slice. Returns (value, bytes_consumed).
pub fn decode_uvarint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if i >= 10 {
            return None; // overflow
        }
        if b < 0x80 {
            // Check for overflow on the last byte
            if i == 9 && b > 1 {
                return None;
            }
            return Some((x | (b as u64) << s, i + 1));
        }
        x |= ((b & 0x7f) as u64) << s;
        s += 7;
    }
    None // incomplete
}
