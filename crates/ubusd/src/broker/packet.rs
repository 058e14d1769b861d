//! MQTT 3.1.1 packets used by the bridge.
//!
//! Only what one QoS 0 client needs: CONNECT, PUBLISH, SUBSCRIBE, PINGREQ
//! and DISCONNECT going out; CONNACK, PUBLISH, SUBACK and PINGRESP coming
//! in. Anything else decodes as [`Packet::Other`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::link::ConnectOptions;

/// Largest inbound packet accepted by default.
pub const DEFAULT_MAX_PACKET: usize = 256 * 1024;

const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT: u8 = 0x10;
const PUBLISH: u8 = 0x30;
const SUBSCRIBE: u8 = 0x82;
const PINGREQ: u8 = 0xC0;
const DISCONNECT: u8 = 0xE0;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed remaining length")]
    MalformedLength,
    #[error("Packet too large: {size} bytes, limit {max}")]
    TooLarge { size: usize, max: usize },
    #[error("Packet truncated: {0}")]
    Truncated(&'static str),
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("String too long for MQTT: {0} bytes")]
    StringTooLong(usize),
}

/// Inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck { session_present: bool, code: u8 },
    Publish {
        topic: String,
        payload: Bytes,
        qos: u8,
        retain: bool,
    },
    SubAck { pkid: u16, codes: Vec<u8> },
    PingResp,
    /// Packet type nibble of anything we do not handle
    Other(u8),
}

/// Human-readable CONNACK return code.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<(), PacketError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(PacketError::TooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), PacketError> {
    let len = u16::try_from(s.len()).map_err(|_| PacketError::StringTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn read_u16(body: &mut Bytes, what: &'static str) -> Result<u16, PacketError> {
    if body.remaining() < 2 {
        return Err(PacketError::Truncated(what));
    }
    Ok(body.get_u16())
}

fn read_string(body: &mut Bytes, what: &'static str) -> Result<String, PacketError> {
    let len = read_u16(body, what)? as usize;
    if body.remaining() < len {
        return Err(PacketError::Truncated(what));
    }
    let raw = body.split_to(len);
    std::str::from_utf8(&raw)
        .map(str::to_string)
        .map_err(|_| PacketError::InvalidUtf8(what))
}

/// Run `encode`, rolling `buf` back to where it was if it fails.
fn encode_atomic(
    buf: &mut BytesMut,
    encode: impl FnOnce(&mut BytesMut) -> Result<(), PacketError>,
) -> Result<(), PacketError> {
    let start = buf.len();
    let result = encode(buf);
    if result.is_err() {
        buf.truncate(start);
    }
    result
}

pub fn encode_connect(options: &ConnectOptions, buf: &mut BytesMut) -> Result<(), PacketError> {
    let mut flags = 0u8;
    if options.clean_session {
        flags |= 0x02;
    }

    // protocol name, level, flags, keepalive
    let mut len = 10 + 2 + options.client_id.len();
    if let Some(will) = &options.will {
        // will QoS 0, not retained
        flags |= 0x04;
        len += 2 + will.topic.len() + 2 + will.message.len();
    }

    encode_atomic(buf, |buf| {
        buf.put_u8(CONNECT);
        put_remaining_length(buf, len)?;
        put_string(buf, "MQTT")?;
        buf.put_u8(4);
        buf.put_u8(flags);
        buf.put_u16(options.keepalive_secs);
        put_string(buf, &options.client_id)?;
        if let Some(will) = &options.will {
            put_string(buf, &will.topic)?;
            put_string(buf, &will.message)?;
        }
        Ok(())
    })
}

/// QoS 0, not retained.
pub fn encode_publish(topic: &str, payload: &[u8], buf: &mut BytesMut) -> Result<(), PacketError> {
    encode_atomic(buf, |buf| {
        buf.put_u8(PUBLISH);
        put_remaining_length(buf, 2 + topic.len() + payload.len())?;
        put_string(buf, topic)?;
        buf.put_slice(payload);
        Ok(())
    })
}

/// Subscribe one topic at QoS 0.
pub fn encode_subscribe(pkid: u16, topic: &str, buf: &mut BytesMut) -> Result<(), PacketError> {
    encode_atomic(buf, |buf| {
        buf.put_u8(SUBSCRIBE);
        put_remaining_length(buf, 2 + 2 + topic.len() + 1)?;
        buf.put_u16(pkid);
        put_string(buf, topic)?;
        buf.put_u8(0);
        Ok(())
    })
}

pub fn encode_pingreq(buf: &mut BytesMut) {
    buf.put_u8(PINGREQ);
    buf.put_u8(0);
}

pub fn encode_disconnect(buf: &mut BytesMut) {
    buf.put_u8(DISCONNECT);
    buf.put_u8(0);
}

/// Take one complete packet off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the packet is
/// incomplete.
pub fn decode(buf: &mut BytesMut, max_size: usize) -> Result<Option<Packet>, PacketError> {
    let mut len = 0usize;
    let mut shift = 0;
    let mut idx = 1;
    loop {
        if idx > 4 {
            return Err(PacketError::MalformedLength);
        }
        let Some(&byte) = buf.get(idx) else {
            return Ok(None);
        };
        len |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        idx += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }

    if len > max_size {
        return Err(PacketError::TooLarge {
            size: len,
            max: max_size,
        });
    }
    if buf.len() < idx + len {
        return Ok(None);
    }

    let header = buf[0];
    buf.advance(idx);
    let mut body = buf.split_to(len).freeze();

    let packet = match header >> 4 {
        2 => {
            if body.len() < 2 {
                return Err(PacketError::Truncated("CONNACK"));
            }
            Packet::ConnAck {
                session_present: body[0] & 0x01 == 0x01,
                code: body[1],
            }
        }
        3 => {
            let qos = (header >> 1) & 0x03;
            let retain = header & 0x01 == 0x01;
            let topic = read_string(&mut body, "PUBLISH topic")?;
            if qos > 0 {
                read_u16(&mut body, "PUBLISH packet id")?;
            }
            Packet::Publish {
                topic,
                payload: body,
                qos,
                retain,
            }
        }
        9 => {
            let pkid = read_u16(&mut body, "SUBACK packet id")?;
            Packet::SubAck {
                pkid,
                codes: body.to_vec(),
            }
        }
        13 => Packet::PingResp,
        other => Packet::Other(other),
    };

    Ok(Some(packet))
}
