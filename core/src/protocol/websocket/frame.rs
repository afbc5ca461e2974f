/*
 * frame.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portiere, an asynchronous HTTP and WebSocket server.
 *
 * Portiere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portiere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portiere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! WebSocket frame format (RFC 6455 §5): parse with bytes-consumed, encode, XOR masking.

use std::fmt;

use bytes::{BufMut, BytesMut};

/// Default cap on a single frame's payload (1 MiB, configurable per connection).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Wire value → opcode. Reserved values (3–7, 11–15) yield `None`.
    pub fn from_u8(v: u8) -> Option<OpCode> {
        match v {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xa => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer does not yet hold a complete frame.
    NeedMore,
    /// Payload exceeds the configured maximum.
    TooLarge,
    /// Opcode is one of the reserved values.
    ReservedOpcode,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::NeedMore => write!(f, "incomplete frame"),
            FrameError::TooLarge => write!(f, "frame payload too large"),
            FrameError::ReservedOpcode => write!(f, "reserved opcode"),
        }
    }
}

impl std::error::Error for FrameError {}

/// One WebSocket frame. The payload is stored unmasked; `masked` records
/// whether the wire form carries a masking key (client→server frames must,
/// server→client frames must not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub masking_key: [u8; 4],
    pub payload: Vec<u8>,
}

impl Frame {
    /// A final, unmasked frame (the server-side default).
    pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            masking_key: [0; 4],
            payload,
        }
    }

    /// A final, masked frame, as a conforming client sends it.
    pub fn masked(opcode: OpCode, payload: Vec<u8>, key: [u8; 4]) -> Self {
        Self {
            masked: true,
            masking_key: key,
            ..Self::new(opcode, payload)
        }
    }

    /// Encode to the wire form: 2-byte prefix, extended length (2 or 8 bytes
    /// big-endian when needed), masking key if `masked`, payload (XOR-masked
    /// if `masked`).
    pub fn encode(&self) -> BytesMut {
        let len = self.payload.len();
        let mut out = BytesMut::with_capacity(14 + len);
        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        out.put_u8(b0);
        let mask_bit = if self.masked { 0x80 } else { 0x00 };
        if len < 126 {
            out.put_u8(mask_bit | len as u8);
        } else if len < 65536 {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }
        if self.masked {
            out.put_slice(&self.masking_key);
            let mut masked = self.payload.clone();
            apply_mask(&mut masked, self.masking_key);
            out.put_slice(&masked);
        } else {
            out.put_slice(&self.payload);
        }
        out
    }
}

/// XOR the payload with the key in wire order: byte i with key[i mod 4].
/// Applying it twice restores the original bytes.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}

/// Parse one frame from the front of `buf`. Returns the frame and the number
/// of bytes consumed so the caller can splice its buffer. Incoming masked
/// payloads are unmasked during parse.
pub fn parse_frame(buf: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameError> {
    if buf.len() < 2 {
        return Err(FrameError::NeedMore);
    }
    let b0 = buf[0];
    let b1 = buf[1];
    let opcode = OpCode::from_u8(b0 & 0x0f).ok_or(FrameError::ReservedOpcode)?;
    let masked = (b1 & 0x80) != 0;
    let len7 = (b1 & 0x7f) as u64;

    let mut pos = 2usize;
    let payload_len = if len7 == 126 {
        if buf.len() < pos + 2 {
            return Err(FrameError::NeedMore);
        }
        let len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as u64;
        pos += 2;
        len
    } else if len7 == 127 {
        if buf.len() < pos + 8 {
            return Err(FrameError::NeedMore);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[pos..pos + 8]);
        pos += 8;
        u64::from_be_bytes(bytes)
    } else {
        len7
    };

    if payload_len > max_payload as u64 {
        return Err(FrameError::TooLarge);
    }
    let payload_len = payload_len as usize;

    let mut masking_key = [0u8; 4];
    if masked {
        if buf.len() < pos + 4 {
            return Err(FrameError::NeedMore);
        }
        masking_key.copy_from_slice(&buf[pos..pos + 4]);
        pos += 4;
    }

    if buf.len() < pos + payload_len {
        return Err(FrameError::NeedMore);
    }
    let mut payload = buf[pos..pos + payload_len].to_vec();
    if masked {
        apply_mask(&mut payload, masking_key);
    }
    pos += payload_len;

    Ok((
        Frame {
            fin: (b0 & 0x80) != 0,
            rsv1: (b0 & 0x40) != 0,
            rsv2: (b0 & 0x20) != 0,
            rsv3: (b0 & 0x10) != 0,
            opcode,
            masked,
            masking_key,
            payload,
        },
        pos,
    ))
}
