//! Translator Wire Framing
//!
//! Every exchange with the translator hardware is a frame:
//!
//! ```text
//! +------+-----------+------+-----------------+
//! | 0x02 | len (u16) | kind | body (len - 1)  |
//! +------+-----------+------+-----------------+
//! ```
//!
//! `len` is big-endian and counts the kind byte plus the body. CAN bodies are
//! `[flags][id: u32 BE][data 0..=8]` where bit 0 of `flags` marks a 29-bit id.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::MAX_MSG_LEN;
use crate::protocol::{ConnectFlags, ProtocolFamily, ProtocolId};

/// Start of frame marker
pub const STX: u8 = 0x02;

/// STX plus the 16-bit length field
pub const HEADER_LEN: usize = 3;

/// Largest accepted `len` field
pub const MAX_FRAME_LEN: usize = MAX_MSG_LEN + 16;

/// Maximum data bytes in a classic CAN frame
pub const CAN_MAX_DLC: usize = 8;

const CAN_FLAG_EXTENDED: u8 = 0x01;

/// Framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Unknown frame kind 0x{0:02X}")]
    UnknownKind(u8),

    #[error("Frame length {0} out of range")]
    InvalidLength(usize),

    #[error("Invalid CAN frame: {0}")]
    InvalidCan(String),
}

/// Frame kinds understood by the translator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    VpwTx = 0x10,
    VpwRx = 0x11,
    CanTx = 0x20,
    CanRx = 0x21,
    ProtocolOpen = 0x30,
    ProtocolClose = 0x31,
    Version = 0xE0,
}

impl FrameKind {
    /// Protocol family receiving inbound frames of this kind
    pub fn inbound_family(&self) -> Option<ProtocolFamily> {
        match self {
            FrameKind::VpwRx => Some(ProtocolFamily::Vpw),
            FrameKind::CanRx => Some(ProtocolFamily::Can),
            _ => None,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Ok(match raw {
            0x10 => FrameKind::VpwTx,
            0x11 => FrameKind::VpwRx,
            0x20 => FrameKind::CanTx,
            0x21 => FrameKind::CanRx,
            0x30 => FrameKind::ProtocolOpen,
            0x31 => FrameKind::ProtocolClose,
            0xE0 => FrameKind::Version,
            other => return Err(FrameError::UnknownKind(other)),
        })
    }
}

/// A single translator frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    body: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    /// Firmware version request (`02 00 01 E0`)
    pub fn version_request() -> Self {
        Self::new(FrameKind::Version, Vec::new())
    }

    /// Ask the translator to start a protocol
    pub fn protocol_open(protocol: ProtocolId, flags: ConnectFlags, baudrate: u32) -> Self {
        let mut body = Vec::with_capacity(12);
        body.extend_from_slice(&protocol.as_raw().to_be_bytes());
        body.extend_from_slice(&flags.bits().to_be_bytes());
        body.extend_from_slice(&baudrate.to_be_bytes());
        Self::new(FrameKind::ProtocolOpen, body)
    }

    /// Ask the translator to stop a protocol
    pub fn protocol_close(protocol: ProtocolId) -> Self {
        Self::new(
            FrameKind::ProtocolClose,
            protocol.as_raw().to_be_bytes().to_vec(),
        )
    }

    /// Build a CAN frame of the given kind
    pub fn can(kind: FrameKind, can: &CanFrame) -> Self {
        Self::new(kind, can.encode_body())
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serialize the frame for the wire
    pub fn encode(&self) -> Vec<u8> {
        let len = (self.body.len() + 1) as u16;
        let mut out = Vec::with_capacity(HEADER_LEN + len as usize);
        out.push(STX);
        out.extend_from_slice(&len.to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.body);
        out
    }

    /// Interpret the body as a CAN frame
    pub fn as_can(&self) -> Result<CanFrame, FrameError> {
        CanFrame::decode_body(&self.body)
    }
}

/// Classic CAN frame carried in `CanTx`/`CanRx` bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, extended: bool, data: Vec<u8>) -> Result<Self, FrameError> {
        if data.len() > CAN_MAX_DLC {
            return Err(FrameError::InvalidCan(format!("DLC {} > 8", data.len())));
        }
        if !extended && id > 0x7FF {
            return Err(FrameError::InvalidCan(format!(
                "id 0x{:X} does not fit 11 bits",
                id
            )));
        }
        if id > 0x1FFF_FFFF {
            return Err(FrameError::InvalidCan(format!(
                "id 0x{:X} does not fit 29 bits",
                id
            )));
        }
        Ok(Self { id, extended, data })
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(5 + self.data.len());
        body.push(if self.extended { CAN_FLAG_EXTENDED } else { 0 });
        body.extend_from_slice(&self.id.to_be_bytes());
        body.extend_from_slice(&self.data);
        body
    }

    fn decode_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < 5 {
            return Err(FrameError::InvalidCan(format!(
                "body too short: {} bytes",
                body.len()
            )));
        }
        let extended = body[0] & CAN_FLAG_EXTENDED != 0;
        let id = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
        Self::new(id, extended, body[5..].to_vec())
    }
}

/// Accumulates raw link bytes and splits them into frames
///
/// Bytes that cannot start a frame are skipped until the next `STX`.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Push received bytes and return every complete frame
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    /// Number of bytes waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn try_extract_one(&mut self) -> Option<Frame> {
        loop {
            self.resync();
            if self.buffer.len() < HEADER_LEN {
                return None;
            }

            let len = u16::from_be_bytes([self.buffer[1], self.buffer[2]]) as usize;
            if len == 0 || len > MAX_FRAME_LEN {
                warn!(len, "Discarding frame header with invalid length");
                self.buffer.advance(1);
                continue;
            }
            if self.buffer.len() < HEADER_LEN + len {
                return None;
            }

            let mut raw = self.buffer.split_to(HEADER_LEN + len);
            raw.advance(HEADER_LEN);
            let kind = raw[0];
            match FrameKind::try_from(kind) {
                Ok(kind) => return Some(Frame::new(kind, raw[1..].to_vec())),
                Err(e) => {
                    debug!("Skipping frame: {}", e);
                    continue;
                }
            }
        }
    }

    fn resync(&mut self) {
        match self.buffer.iter().position(|b| *b == STX) {
            Some(0) => {}
            Some(pos) => {
                debug!(skipped = pos, "Resynchronising frame stream");
                self.buffer.advance(pos);
            }
            None => self.buffer.clear(),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_version_request_bytes() {
        assert_eq!(Frame::version_request().encode(), vec![0x02, 0x00, 0x01, 0xE0]);
    }

    #[test]
    fn test_can_frame_encoding() {
        let can = CanFrame::new(0x7E8, false, vec![0x03, 0x41, 0x0D, 0x37]).unwrap();
        let encoded = Frame::can(FrameKind::CanRx, &can).encode();
        assert_eq!(
            encoded,
            vec![0x02, 0x00, 0x0A, 0x21, 0x00, 0x00, 0x00, 0x07, 0xE8, 0x03, 0x41, 0x0D, 0x37]
        );

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_can().unwrap(), can);
    }

    #[test]
    fn test_can_frame_limits() {
        assert!(CanFrame::new(0x800, false, vec![]).is_err());
        assert!(CanFrame::new(0x800, true, vec![]).is_ok());
        assert!(CanFrame::new(0x7E0, false, vec![0; 9]).is_err());
    }

    #[test]
    fn test_decoder_handles_fragments() {
        let frame = Frame::new(FrameKind::VpwRx, vec![0x48, 0x6B, 0x10, 0x41, 0x00]);
        let bytes = frame.encode();

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&bytes[..2]).is_empty());
        assert!(decoder.push(&bytes[2..5]).is_empty());
        let frames = decoder.push(&bytes[5..]);
        assert_eq!(frames, vec![frame]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decoder_skips_garbage_and_unknown_kinds() {
        let good = Frame::new(FrameKind::VpwRx, vec![0x01]);
        let mut stream = vec![0xFF, 0x13];
        stream.extend_from_slice(&[STX, 0x00, 0x02, 0x77, 0xAA]);
        stream.extend_from_slice(&good.encode());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&stream), vec![good]);
    }

    #[test]
    fn test_decoder_rejects_zero_length() {
        let good = Frame::version_request();
        let mut stream = vec![STX, 0x00, 0x00];
        stream.extend_from_slice(&good.encode());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&stream), vec![good]);
    }

    proptest! {
        #[test]
        fn prop_decoder_is_split_agnostic(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..8),
            split in 0usize..512,
        ) {
            let frames: Vec<Frame> = bodies
                .into_iter()
                .map(|body| Frame::new(FrameKind::VpwRx, body))
                .collect();
            let stream: Vec<u8> = frames.iter().flat_map(|f| f.encode()).collect();
            let split = split.min(stream.len());

            let mut decoder = FrameDecoder::new();
            let mut decoded = decoder.push(&stream[..split]);
            decoded.extend(decoder.push(&stream[split..]));
            prop_assert_eq!(decoded, frames);
            prop_assert_eq!(decoder.pending(), 0);
        }
    }
}
