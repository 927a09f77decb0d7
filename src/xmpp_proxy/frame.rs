//! RFC 6455 frame codec.
//!
//! Decodes one client frame at a time out of a receive buffer and encodes the
//! frames the gateway sends back to the browser. Server frames are never
//! fragmented and never masked.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload a control frame (Close, Ping, Pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Status used when the peer's Close frame carries no status code.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Returns true for Close, Ping and Pong.
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }
}

/// Reasons a frame header is rejected. All of them are fatal for the
/// connection that produced the frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved header bits set (0x{0:02x})")]
    ReservedBits(u8),
    #[error("invalid opcode 0x{0:x}")]
    InvalidOpcode(u8),
    #[error("payload length {0} does not fit in 32 bits")]
    PayloadTooLong(u64),
    #[error("control frame payload of {0} bytes exceeds {MAX_CONTROL_PAYLOAD}")]
    ControlFrameTooLarge(usize),
    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// One decoded WebSocket frame. The payload is always stored unmasked; the
/// key it arrived with is kept in `mask_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, fin: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            masked: false,
            mask_key: None,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, true, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, true, payload)
    }

    /// Close frame carrying a status code and a reason. The reason is cut at a
    /// character boundary so the payload stays within the control frame limit.
    pub fn close(status: u16, reason: &str) -> Self {
        let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + cut);
        payload.put_u16(status);
        payload.put_slice(&reason.as_bytes()[..cut]);
        Self::new(Opcode::Close, true, payload.freeze())
    }

    /// Marks the frame to be masked with `key` when encoded (client side).
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.masked = true;
        self.mask_key = Some(key);
        self
    }
}

/// Whether `status` may appear in a Close frame on the wire (RFC 6455
/// section 7.4). 1005, 1006 and 1015 are reserved for local reporting.
pub fn is_sendable_close_status(status: u16) -> bool {
    matches!(status, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Status code and reason carried by a Close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub status: u16,
    pub reason: String,
}

impl CloseReason {
    /// Payloads shorter than two bytes carry no status and map to 1001.
    pub fn parse(payload: &[u8]) -> Self {
        if payload.len() < 2 {
            return Self {
                status: CLOSE_GOING_AWAY,
                reason: String::new(),
            };
        }
        Self {
            status: u16::from_be_bytes([payload[0], payload[1]]),
            reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
        }
    }
}

/// XOR `payload` in place with `key[i % 4]`. Applying it twice with the same
/// key restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Decode the next frame at the front of `buf`.
///
/// Returns `Ok(None)` until the whole frame (header, key and payload) is
/// buffered. On success exactly the frame's bytes are removed from `buf`;
/// anything after them stays for the next call. Length limits are checked as
/// soon as the header is readable, before the payload arrives.
pub fn decode_next(
    buf: &mut BytesMut,
    max_payload: Option<usize>,
) -> Result<Option<Frame>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (b0, b1) = (buf[0], buf[1]);

    if b0 & 0x70 != 0 {
        return Err(FrameError::ReservedBits(b0 & 0x70));
    }
    let opcode = Opcode::from_u8(b0 & 0x0F)?;
    let fin = b0 & 0x80 != 0;
    let masked = b1 & 0x80 != 0;

    let (len, mut header_len) = match b1 & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        n => (u64::from(n), 2),
    };

    let len = u32::try_from(len).map_err(|_| FrameError::PayloadTooLong(len))? as usize;
    if opcode.is_control() && len > MAX_CONTROL_PAYLOAD {
        return Err(FrameError::ControlFrameTooLarge(len));
    }
    if let Some(max) = max_payload {
        if len > max {
            return Err(FrameError::FrameTooLarge { len, max });
        }
    }

    let mask_key = if masked {
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let key = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        header_len += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < header_len + len {
        return Ok(None);
    }

    buf.advance(header_len);
    let mut payload = buf.split_to(len);
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        opcode,
        masked,
        mask_key,
        payload: payload.freeze(),
    }))
}

fn put_header(out: &mut BytesMut, first: u8, mask_bit: u8, len: usize) {
    out.put_u8(first);
    if len <= MAX_CONTROL_PAYLOAD {
        out.put_u8(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len as u64);
    }
}

/// Encode `frame` as it appears on the wire, masking the payload when the
/// frame carries a key.
pub fn encode(frame: &Frame) -> Bytes {
    let len = frame.payload.len();
    let mut out = BytesMut::with_capacity(len + 14);
    let first = (if frame.fin { 0x80 } else { 0 }) | frame.opcode as u8;

    match frame.mask_key {
        Some(key) => {
            put_header(&mut out, first, 0x80, len);
            out.put_slice(&key);
            let start = out.len();
            out.put_slice(&frame.payload);
            apply_mask(&mut out[start..], key);
        }
        None => {
            put_header(&mut out, first, 0, len);
            out.put_slice(&frame.payload);
        }
    }
    out.freeze()
}

/// Encode a server frame: FIN set, unmasked.
pub fn encode_server(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 10);
    put_header(&mut out, 0x80 | opcode as u8, 0, payload.len());
    out.put_slice(payload);
    out.freeze()
}
