//! RFC 6455 frame codec.
//!
//! Payload length uses the three-tier encoding: 0-125 literal, 126 followed
//! by a 16-bit length, 127 followed by a 64-bit length (both big-endian).
//! Client frames must be masked; server frames never are. The server never
//! fragments, so every encoded frame has FIN set.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::FrameError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text.
    Text,
    /// Binary data.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
}

impl Opcode {
    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Lowercase name, used as a metric label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Continuation => "continuation",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Whether this is a control opcode (close, ping, pong).
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::ReservedOpcode(other)),
        }
    }
}

/// One WebSocket frame. `payload` is always unmasked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Opcode.
    pub opcode: Opcode,
    /// Mask key the frame arrived with, or will be sent with.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Unmasked final frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into())
    }

    /// Pong answering a ping with `payload`.
    pub fn pong(payload: Bytes) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Close frame with a status code and reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(Opcode::Close, payload.freeze())
    }

    /// Same frame, masked with `key` on encode.
    #[must_use]
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask_key = Some(key);
        self
    }

    /// Whether the frame arrived masked.
    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    /// Payload length.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        (self.opcode == Opcode::Close && self.payload.len() >= 2)
            .then(|| u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Decode the payload as UTF-8.
    pub fn into_text(self) -> Result<String, FrameError> {
        Ok(String::from_utf8(self.payload.to_vec())?)
    }
}

/// XOR `payload` in place with `key[i % 4]`. Applying it twice restores the
/// input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode `frame` into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut dst = BytesMut::with_capacity(frame.payload.len() + 14);
    write_frame(frame, &mut dst);
    dst.freeze()
}

fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    let len = frame.payload.len();
    let mask_bit = if frame.mask_key.is_some() { 0x80 } else { 0x00 };

    dst.reserve(len + 14);
    dst.put_u8(0x80 | frame.opcode.as_u8());
    if len <= 125 {
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u8(mask_bit | len as u8);
    } else if let Ok(len16) = u16::try_from(len) {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(len16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(len as u64);
    }

    match frame.mask_key {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(&frame.payload),
    }
}

/// Stateless frame codec with a payload limit.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_payload: usize,
    require_mask: bool,
}

impl FrameCodec {
    /// Codec for frames read from clients: masking is mandatory.
    pub fn server(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: true,
        }
    }

    /// Codec for frames read from a server: masking is optional.
    pub fn client(max_payload: usize) -> Self {
        Self {
            max_payload,
            require_mask: false,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    /// Decode one frame if `src` holds all of it. Header violations are
    /// reported as soon as the header bytes are present.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let b0 = src[0];
        let b1 = src[1];

        let fin = b0 & 0x80 != 0;
        let rsv = b0 & 0x70;
        if rsv != 0 {
            return Err(FrameError::ReservedBits(rsv));
        }
        let opcode = Opcode::try_from(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;
        if self.require_mask && !masked {
            return Err(FrameError::Unmasked);
        }

        let (declared, mut header_len): (u64, usize) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0_u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (u64::from(n), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::BadControlFrame("fragmented"));
            }
            if declared > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::BadControlFrame("payload over 125 bytes"));
            }
        }
        let len = usize::try_from(declared)
            .ok()
            .filter(|&l| l <= self.max_payload)
            .ok_or(FrameError::TooLong {
                len: declared,
                limit: self.max_payload,
            })?;

        let mask_key = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                src[header_len],
                src[header_len + 1],
                src[header_len + 2],
                src[header_len + 3],
            ];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < header_len + len {
            src.reserve(header_len + len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(len);
        if let Some(key) = mask_key {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            mask_key,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        write_frame(&frame, dst);
        Ok(())
    }
}
