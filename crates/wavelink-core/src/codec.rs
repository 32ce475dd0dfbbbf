//! Packet codec (panic-free).
//!
//! Wire forms:
//! - Text frame: `<digit><data>` (e.g. `4hello`, `2probe`).
//! - Binary frame: `<type byte><raw bytes>`; used only on framed transports.
//! - Base64 fallback: `b<digit><base64(data)>` when the peer cannot take
//!   binary frames.
//! - Polling payload: packets concatenated as `<length>:<text frame>`, where
//!   length counts characters. Binary packets inside a payload always take
//!   the base64 form.
//!
//! Parsing rules follow the same discipline as the rest of the workspace:
//! never index raw buffers without a bounds check, never `unwrap()`.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WavelinkError};
use crate::packet::{Packet, PacketData, PacketType};

/// URL-safe, unpadded base64. Session ids use this alphabet.
pub fn base64_url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// A single encoded packet, ready for a transport write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    Text(String),
    Binary(Bytes),
}

/// Encode one packet. `supports_binary` selects raw binary frames over the
/// base64 text fallback for [`PacketData::Binary`] payloads.
pub fn encode_packet(packet: &Packet, supports_binary: bool) -> Encoded {
    match &packet.data {
        PacketData::Text(s) => {
            let mut out = String::with_capacity(1 + s.len());
            out.push(packet.ptype.digit() as char);
            out.push_str(s);
            Encoded::Text(out)
        }
        PacketData::Binary(b) if supports_binary => {
            let mut out = BytesMut::with_capacity(1 + b.len());
            out.put_u8(packet.ptype.digit() - b'0');
            out.extend_from_slice(b);
            Encoded::Binary(out.freeze())
        }
        PacketData::Binary(b) => {
            let mut out = String::with_capacity(2 + b.len() * 4 / 3 + 4);
            out.push('b');
            out.push(packet.ptype.digit() as char);
            out.push_str(&BASE64.encode(b));
            Encoded::Text(out)
        }
    }
}

/// Decode a text frame.
pub fn decode_packet_text(s: &str) -> Result<Packet> {
    let mut chars = s.chars();
    let head = chars
        .next()
        .ok_or_else(|| WavelinkError::Parse("empty packet".into()))?;

    if head == 'b' {
        let ptype = chars
            .next()
            .and_then(|c| PacketType::from_wire(c as u8))
            .ok_or_else(|| WavelinkError::Parse("bad base64 packet type".into()))?;
        let raw = BASE64
            .decode(chars.as_str())
            .map_err(|e| WavelinkError::Parse(format!("bad base64 data: {e}")))?;
        return Ok(Packet::new(ptype, Bytes::from(raw)));
    }

    let ptype = u8::try_from(head)
        .ok()
        .and_then(PacketType::from_wire)
        .ok_or_else(|| WavelinkError::Parse(format!("unknown packet type: {head:?}")))?;
    Ok(Packet::new(ptype, chars.as_str()))
}

/// Decode a binary frame (`<type byte><raw bytes>`).
pub fn decode_packet_binary(buf: &[u8]) -> Result<Packet> {
    let (&head, rest) = buf
        .split_first()
        .ok_or_else(|| WavelinkError::Parse("empty binary packet".into()))?;
    let ptype = PacketType::from_wire(head)
        .ok_or_else(|| WavelinkError::Parse(format!("unknown packet type byte: {head}")))?;
    Ok(Packet::new(ptype, Bytes::copy_from_slice(rest)))
}

/// Encode a batch for the concatenating polling transport.
///
/// Every packet is forced into its text form, so the result is always valid
/// UTF-8 regardless of the session's binary support.
pub fn encode_payload(packets: &[Packet]) -> String {
    let mut out = String::new();
    for p in packets {
        let Encoded::Text(frame) = encode_packet(p, false) else {
            // encode_packet(_, false) never yields Binary
            continue;
        };
        let len = frame.chars().count();
        out.push_str(&len.to_string());
        out.push(':');
        out.push_str(&frame);
    }
    out
}

/// Decode a concatenated polling payload into its packets.
pub fn decode_payload(s: &str) -> Result<Vec<Packet>> {
    if s.is_empty() {
        return Err(WavelinkError::Parse("empty payload".into()));
    }

    let mut packets = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| WavelinkError::Parse("payload missing length separator".into()))?;
        let (len_s, tail) = rest.split_at(colon);
        let len: usize = len_s
            .parse()
            .map_err(|_| WavelinkError::Parse(format!("bad payload length: {len_s:?}")))?;
        if len == 0 {
            return Err(WavelinkError::Parse("zero-length frame".into()));
        }
        let tail = &tail[1..];

        let frame_end = match tail.char_indices().nth(len - 1) {
            Some((idx, c)) => idx + c.len_utf8(),
            None => return Err(WavelinkError::Parse("payload truncated".into())),
        };
        let (frame, remainder) = tail.split_at(frame_end);
        packets.push(decode_packet_text(frame)?);
        rest = remainder;
    }
    Ok(packets)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_round_trip() {
        let p = Packet::message("hello");
        let Encoded::Text(s) = encode_packet(&p, true) else {
            panic!("expected text");
        };
        assert_eq!(s, "4hello");
        assert_eq!(decode_packet_text(&s).expect("decode"), p);
    }

    #[test]
    fn binary_frame_round_trip() {
        let p = Packet::message(vec![1u8, 2, 254]);
        let Encoded::Binary(b) = encode_packet(&p, true) else {
            panic!("expected binary");
        };
        assert_eq!(b[0], 4);
        assert_eq!(decode_packet_binary(&b).expect("decode"), p);
    }

    #[test]
    fn base64_fallback_round_trip() {
        let p = Packet::message(vec![0u8, 255, 7]);
        let Encoded::Text(s) = encode_packet(&p, false) else {
            panic!("expected text");
        };
        assert!(s.starts_with("b4"));
        assert_eq!(decode_packet_text(&s).expect("decode"), p);
    }

    #[test]
    fn probe_frames() {
        let Encoded::Text(ping) = encode_packet(&Packet::ping("probe"), true) else {
            panic!("expected text");
        };
        assert_eq!(ping, "2probe");
        let Encoded::Text(pong) = encode_packet(&Packet::pong("probe"), true) else {
            panic!("expected text");
        };
        assert_eq!(pong, "3probe");
    }

    #[test]
    fn payload_round_trip() {
        let batch = vec![
            Packet::message("one"),
            Packet::noop(),
            Packet::message("två"),
            Packet::message(vec![9u8, 8, 7]),
        ];
        let payload = encode_payload(&batch);
        let decoded = decode_payload(&payload).expect("decode");
        assert_eq!(decoded, batch);
    }

    #[test]
    fn payload_length_counts_chars_not_bytes() {
        let payload = encode_payload(&[Packet::message("åäö")]);
        assert!(payload.starts_with("4:"), "payload was {payload:?}");
        let decoded = decode_payload(&payload).expect("decode");
        assert_eq!(decoded[0].data.as_text(), Some("åäö"));
    }

    #[test]
    fn malformed_input_is_a_parse_error() {
        assert!(decode_packet_text("").is_err());
        assert!(decode_packet_text("9nope").is_err());
        assert!(decode_packet_text("bZ").is_err());
        assert!(decode_packet_binary(&[]).is_err());
        assert!(decode_packet_binary(&[42]).is_err());
        assert!(decode_payload("").is_err());
        assert!(decode_payload("4hello").is_err());
        assert!(decode_payload("10:4hi").is_err());
        assert!(decode_payload("x:4hi").is_err());
    }
}
