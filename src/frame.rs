use bytes::BufMut;

use crate::errors::ProtocolError;
use crate::mask::apply_mask;

/// largest payload a single control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// close reason limit, control payload minus the two code bytes
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// Defines the interpretation of the "Payload data".  If an unknown
/// opcode is received, the receiving endpoint MUST _Fail the
/// WebSocket Connection_.
/// - x0 denotes a continuation frame
/// - x1 denotes a text frame
/// - x2 denotes a binary frame
/// - x8 denotes a connection close
/// - x9 denotes a ping
/// - xA denotes a pong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// - x0 denotes a continuation frame
    Continue,
    /// - x1 denotes a text frame
    Text,
    /// - x2 denotes a binary frame
    Binary,
    /// - x8 denotes a connection close
    Close,
    /// - x9 denotes a ping
    Ping,
    /// - xA denotes a pong
    Pong,
}

impl OpCode {
    /// get corresponding u8 value
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
        }
    }

    /// check is text/binary/continuation
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continue)
    }

    /// check is close/ping/pong
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[inline]
pub(crate) fn parse_opcode(val: u8) -> Result<OpCode, ProtocolError> {
    match val & 0b1111 {
        0 => Ok(OpCode::Continue),
        1 => Ok(OpCode::Text),
        2 => Ok(OpCode::Binary),
        8 => Ok(OpCode::Close),
        9 => Ok(OpCode::Ping),
        10 => Ok(OpCode::Pong),
        other => Err(ProtocolError::InvalidOpcode(other)),
    }
}

/// bytes occupied by a frame header for `payload_len` payload bytes
pub(crate) fn header_len(payload_len: usize, masked: bool) -> usize {
    let len_bytes = match payload_len {
        0..=125 => 0,
        126..=65535 => 2,
        _ => 8,
    };
    2 + len_bytes + if masked { 4 } else { 0 }
}

/// encode a complete fin=1 frame into `dst`
///
/// a `mask` key is applied to the payload copy, never to `payload` itself
pub(crate) fn encode_frame(
    dst: &mut Vec<u8>,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload: &[u8],
) {
    dst.reserve(header_len(payload.len(), mask.is_some()) + payload.len());
    dst.put_u8(0x80 | opcode.as_u8());
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        n @ 0..=125 => dst.put_u8(mask_bit | n as u8),
        n @ 126..=65535 => {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(n as u16);
        }
        n => {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(n as u64);
        }
    }
    match mask {
        Some(key) => {
            dst.extend_from_slice(&key);
            let start = dst.len();
            dst.extend_from_slice(payload);
            apply_mask(&mut dst[start..], key, 0);
        }
        None => dst.extend_from_slice(payload),
    }
}

/// build a close-frame payload, truncating the reason at the control limit
pub(crate) fn encode_close_payload(code: u16, reason: &[u8]) -> Vec<u8> {
    let reason = &reason[..reason.len().min(MAX_CLOSE_REASON)];
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.put_u16(code);
    payload.extend_from_slice(reason);
    payload
}

/// parse and validate a close-frame payload into (code, reason)
///
/// empty payload surfaces 1005, one byte is a protocol error, the code must
/// be in the allowed set and the reason valid utf-8
pub(crate) fn parse_close_payload(payload: &[u8]) -> Result<(u16, &[u8]), ProtocolError> {
    match payload.len() {
        0 => Ok((1005, &[])),
        1 => Err(ProtocolError::InvalidCloseFramePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let allowed = matches!(code, 1000..=1011 | 3000..=4999)
                && !matches!(code, 1004 | 1005 | 1006);
            if !allowed {
                return Err(ProtocolError::InvalidCloseCode(code));
            }
            let reason = &payload[2..];
            if std::str::from_utf8(reason).is_err() {
                return Err(ProtocolError::InvalidUtf8);
            }
            Ok((code, reason))
        }
    }
}

/// a fully encoded, shareable frame
///
/// broadcast prepares the frame once and every recipient socket queues a
/// reference-counted handle to it, so N recipients cost one encode and no
/// payload copies
#[derive(Debug)]
pub struct PreparedMessage {
    frame: Vec<u8>,
}

impl PreparedMessage {
    /// encode `payload` as a single server-directed (unmasked) fin=1 frame
    pub fn new(opcode: OpCode, payload: &[u8]) -> Self {
        let mut frame = Vec::new();
        encode_frame(&mut frame, opcode, None, payload);
        Self { frame }
    }

    /// the raw frame bytes, header included
    pub fn bytes(&self) -> &[u8] {
        &self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_frame_header() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, OpCode::Binary, None, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(buf, [0x82, 0x04, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn extended_len16_header() {
        let payload = vec![0u8; 300];
        let mut buf = Vec::new();
        encode_frame(&mut buf, OpCode::Text, None, &payload);
        assert_eq!(&buf[..4], [0x81, 126, 0x01, 0x2C]);
        assert_eq!(buf.len(), 4 + 300);
    }

    #[test]
    fn extended_len64_header() {
        let payload = vec![0u8; 70_000];
        let mut buf = Vec::new();
        encode_frame(&mut buf, OpCode::Binary, None, &payload);
        assert_eq!(buf[1], 127);
        assert_eq!(
            u64::from_be_bytes(buf[2..10].try_into().unwrap()),
            70_000
        );
    }

    #[test]
    fn masked_frame_round_trip() {
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut buf = Vec::new();
        encode_frame(&mut buf, OpCode::Text, Some(key), b"hello");
        assert_eq!(buf[1], 0x80 | 5);
        assert_eq!(&buf[2..6], key);
        let mut body = buf[6..].to_vec();
        apply_mask(&mut body, key, 0);
        assert_eq!(&body, b"hello");
    }

    #[test]
    fn close_payload_codes() {
        assert_eq!(parse_close_payload(&[]), Ok((1005, &[][..])));
        assert_eq!(
            parse_close_payload(&[0x03]),
            Err(ProtocolError::InvalidCloseFramePayload)
        );
        assert_eq!(parse_close_payload(&[0x03, 0xE8]), Ok((1000, &[][..])));
        assert_eq!(
            parse_close_payload(&[0x03, 0xED]),
            Err(ProtocolError::InvalidCloseCode(1005))
        );
        assert_eq!(
            parse_close_payload(&[0x0B, 0xB8]),
            Ok((3000, &[][..]))
        );
        assert_eq!(
            parse_close_payload(&[0x13, 0x88]),
            Err(ProtocolError::InvalidCloseCode(5000))
        );
        assert_eq!(
            parse_close_payload(&[0x03, 0xE8, 0xC3, 0x28]),
            Err(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn close_reason_truncated() {
        let reason = vec![b'x'; 200];
        let payload = encode_close_payload(1000, &reason);
        assert_eq!(payload.len(), 2 + MAX_CLOSE_REASON);
    }
}
