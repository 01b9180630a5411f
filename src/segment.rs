//! Wire codec for protocol segments.
//!
//! A datagram carries one or more segments packed back to back, each a
//! fixed 24-byte big-endian header followed by `len` payload bytes. The
//! codec is a pure transform; windowing and retransmission live in
//! [`crate::conn`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed size of the segment header on the wire.
pub const HEADER_LEN: usize = 24;

/// Error types for segment decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("segment truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("declared payload length {len} exceeds limit {limit}")]
    Oversize { len: usize, limit: usize },

    #[error("unknown command byte {0}")]
    BadCommand(u8),
}

/// Segment command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Data carrying a stream fragment.
    Push = 81,
    /// Acknowledgement of one received `Push`.
    Ack = 82,
    /// Ask the peer to report its receive window.
    WndAsk = 83,
    /// Report the local receive window to the peer.
    WndTell = 84,
}

impl Cmd {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            81 => Some(Cmd::Push),
            82 => Some(Cmd::Ack),
            83 => Some(Cmd::WndAsk),
            84 => Some(Cmd::WndTell),
            _ => None,
        }
    }
}

/// One protocol-framed unit carried inside a datagram.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Conversation id scoping this segment to one connection.
    pub conv: u32,
    /// Command.
    pub cmd: Cmd,
    /// Fragment index, counting down to 0 on the last fragment of a message.
    pub frg: u8,
    /// Sender's unused receive window, in segments.
    pub wnd: u16,
    /// Sender timestamp at transmit time, milliseconds.
    pub ts: u32,
    /// Sequence number.
    pub sn: u32,
    /// Cumulative ack: every sequence number below this was received.
    pub una: u32,
    /// Payload.
    pub data: Bytes,
}

impl Segment {
    /// Build a payload-less control segment (`Ack`, `WndAsk`, `WndTell`).
    pub fn control(conv: u32, cmd: Cmd, wnd: u16, una: u32) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd,
            ts: 0,
            sn: 0,
            una,
            data: Bytes::new(),
        }
    }

    /// Size of this segment on the wire, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    /// Append the encoded segment to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_len());
        buf.put_u32(self.conv);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.frg);
        buf.put_u16(self.wnd);
        buf.put_u32(self.ts);
        buf.put_u32(self.sn);
        buf.put_u32(self.una);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    /// Consume exactly one segment from `buf`.
    ///
    /// `max_payload` is the negotiated MTU minus the header size; a larger
    /// declared length is rejected as [`DecodeError::Oversize`].
    ///
    /// After `Oversize` and `BadCommand` the offending segment has been
    /// consumed, so the caller may continue with any segments behind it.
    /// `Truncated` means the remaining bytes cannot frame a segment at all.
    pub fn decode(buf: &mut Bytes, max_payload: usize) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        let conv = buf.get_u32();
        let cmd_raw = buf.get_u8();
        let frg = buf.get_u8();
        let wnd = buf.get_u16();
        let ts = buf.get_u32();
        let sn = buf.get_u32();
        let una = buf.get_u32();
        let len = buf.get_u32() as usize;
        if len > max_payload {
            let skip = len.min(buf.len());
            buf.advance(skip);
            return Err(DecodeError::Oversize {
                len,
                limit: max_payload,
            });
        }
        if len > buf.len() {
            return Err(DecodeError::Truncated {
                need: len,
                have: buf.len(),
            });
        }
        let data = buf.split_to(len);
        let cmd = Cmd::from_u8(cmd_raw).ok_or(DecodeError::BadCommand(cmd_raw))?;
        Ok(Self {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            data,
        })
    }
}

/// Peek the conversation id of the first segment without a full decode.
///
/// Used for session lookup before the owning connection parses the rest.
pub fn read_conv(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([
        datagram[0],
        datagram[1],
        datagram[2],
        datagram[3],
    ]))
}
