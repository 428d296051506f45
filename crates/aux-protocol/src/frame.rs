//! AUX frame structure, frame buffer and checksum handling

use std::fmt;

use crate::commands::PacketType;
use crate::types::ProtocolError;

/// First byte of every frame
pub const START_BYTE: u8 = 0xBB;
pub const HEADER_SIZE: usize = 8;
pub const MAX_BODY_SIZE: usize = 24;
pub const CHECKSUM_SIZE: usize = 2;
/// Largest possible frame: header(8) + body(24) + checksum(2)
pub const BUFFER_SIZE: usize = HEADER_SIZE + MAX_BODY_SIZE + CHECKSUM_SIZE;

/// Origin flag of frames sent by the Wi-Fi module
pub const ORIGIN_MODULE: u8 = 0x80;
/// Origin flag of frames sent by the indoor unit
pub const ORIGIN_UNIT: u8 = 0x00;

/// Frame header
///
/// ```text
/// [0] start byte 0xBB
/// [1] unexplored
/// [2] packet type
/// [3] origin (0x80 module, 0x00 unit)
/// [4] ping answer flag (0x01 only in pongs)
/// [5] unexplored
/// [6] body length (0..=24)
/// [7] unexplored
/// ```
///
/// Unexplored bytes are kept so a frame re-serializes exactly as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub reserved1: u8,
    pub packet_type: u8,
    pub origin: u8,
    pub ping_answer: u8,
    pub reserved5: u8,
    pub body_length: u8,
    pub reserved7: u8,
}

impl Header {
    /// Header for a frame sent by the module
    #[must_use]
    pub fn outgoing(packet_type: PacketType, body_length: u8) -> Self {
        Self {
            packet_type: packet_type as u8,
            origin: ORIGIN_MODULE,
            body_length,
            ..Self::default()
        }
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::IncompleteFrame {
                loaded: data.len(),
                expected: HEADER_SIZE,
            });
        }
        if data[0] != START_BYTE {
            return Err(ProtocolError::InvalidStartByte(data[0]));
        }
        Ok(Self {
            reserved1: data[1],
            packet_type: data[2],
            origin: data[3],
            ping_answer: data[4],
            reserved5: data[5],
            body_length: data[6],
            reserved7: data[7],
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        [
            START_BYTE,
            self.reserved1,
            self.packet_type,
            self.origin,
            self.ping_answer,
            self.reserved5,
            self.body_length,
            self.reserved7,
        ]
    }

    #[must_use]
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    #[must_use]
    pub fn body_len(&self) -> usize {
        usize::from(self.body_length)
    }

    /// Total frame size announced by this header
    #[must_use]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len() + CHECKSUM_SIZE
    }
}

/// Checksum over header and body.
///
/// Bytes are summed as big-endian 16-bit words (an odd trailing byte is padded
/// with zero), the carry is folded once and the result complemented.
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)])))
        .sum();
    sum = (sum >> 16) + (sum & 0xFFFF);
    (!sum & 0xFFFF) as u16
}

/// Checksum in wire order: high byte first
#[must_use]
pub fn checksum_bytes(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    checksum(data).to_be_bytes()
}

/// Complete, checksum-valid frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u8>,
    pub checksum: [u8; CHECKSUM_SIZE],
    /// Monotonic milliseconds when the frame was completed or built
    pub received_at: u64,
}

impl Frame {
    /// Build a module-originated frame with a fresh checksum
    #[allow(clippy::missing_errors_doc)]
    pub fn build(
        packet_type: PacketType,
        ping_answer: u8,
        body: &[u8],
        now: u64,
    ) -> Result<Self, ProtocolError> {
        let body_length = u8::try_from(body.len())
            .ok()
            .filter(|&n| usize::from(n) <= MAX_BODY_SIZE)
            .ok_or(ProtocolError::BodyTooLong(body.len()))?;

        let mut header = Header::outgoing(packet_type, body_length);
        header.ping_answer = ping_answer;

        let mut frame = Self {
            header,
            body: body.to_vec(),
            checksum: [0; CHECKSUM_SIZE],
            received_at: now,
        };
        frame.checksum = checksum_bytes(&frame.unchecked_bytes());
        Ok(frame)
    }

    /// Parse a complete frame and verify its checksum
    pub fn parse(data: &[u8], now: u64) -> Result<Self, ProtocolError> {
        let header = Header::parse(data)?;
        if header.body_len() > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLong(header.body_len()));
        }

        let expected = header.frame_len();
        if data.len() != expected {
            return Err(ProtocolError::IncompleteFrame {
                loaded: data.len(),
                expected,
            });
        }

        let crc_offset = HEADER_SIZE + header.body_len();
        let received = [data[crc_offset], data[crc_offset + 1]];
        let calculated = checksum_bytes(&data[..crc_offset]);
        if received != calculated {
            return Err(ProtocolError::ChecksumMismatch {
                expected: u16::from_be_bytes(calculated),
                actual: u16::from_be_bytes(received),
            });
        }

        Ok(Self {
            header,
            body: data[HEADER_SIZE..crc_offset].to_vec(),
            checksum: received,
            received_at: now,
        })
    }

    #[must_use]
    pub fn kind(&self) -> Option<PacketType> {
        self.header.kind()
    }

    /// Wire bytes including the checksum
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = self.unchecked_bytes();
        data.extend_from_slice(&self.checksum);
        data
    }

    fn unchecked_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(BUFFER_SIZE);
        data.extend_from_slice(&self.header.to_bytes());
        data.extend_from_slice(&self.body);
        data
    }
}

impl fmt::Display for Frame {
    /// `[header] body [checksum]` in hex
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex_frame(f, &self.to_bytes())
    }
}

/// Result of pushing one byte into a [`FrameBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Header not loaded yet
    Partial,
    /// Header loaded, body or checksum still missing
    HeaderLoaded,
    /// Header, body and checksum all loaded
    Complete,
}

/// Fixed-capacity byte accumulator for one frame.
///
/// Incoming buffers start empty. Outgoing buffers are re-seeded with the start
/// byte and module origin flag on every reset.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: [u8; BUFFER_SIZE],
    len: usize,
    outgoing: bool,
    started_at: u64,
}

impl FrameBuffer {
    #[must_use]
    pub fn incoming() -> Self {
        Self {
            data: [0; BUFFER_SIZE],
            len: 0,
            outgoing: false,
            started_at: 0,
        }
    }

    #[must_use]
    pub fn outgoing() -> Self {
        let mut buffer = Self::incoming();
        buffer.outgoing = true;
        buffer.reset();
        buffer
    }

    /// Clear the buffer; outgoing buffers get their start byte and origin back
    pub fn reset(&mut self) {
        self.data = [0; BUFFER_SIZE];
        self.len = 0;
        self.started_at = 0;
        if self.outgoing {
            self.data[0] = START_BYTE;
            self.data[3] = ORIGIN_MODULE;
        }
    }

    /// Append one byte and report how far the frame is loaded
    pub fn push_byte(&mut self, byte: u8) -> Result<PushStatus, ProtocolError> {
        if self.is_full() {
            return Err(ProtocolError::BufferOverflow(BUFFER_SIZE));
        }
        self.data[self.len] = byte;
        self.len += 1;

        if self.len < HEADER_SIZE {
            return Ok(PushStatus::Partial);
        }
        if self.is_complete() {
            Ok(PushStatus::Complete)
        } else {
            Ok(PushStatus::HeaderLoaded)
        }
    }

    /// Header view, once at least eight bytes are loaded
    #[must_use]
    pub fn header(&self) -> Option<Header> {
        Header::parse(self.as_bytes()).ok()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.header()
            .is_some_and(|header| self.len == header.frame_len())
    }

    /// Validate the loaded bytes and return them as a frame
    #[allow(clippy::missing_errors_doc)]
    pub fn to_frame(&self, now: u64) -> Result<Frame, ProtocolError> {
        Frame::parse(self.as_bytes(), now)
    }

    /// Replace the contents with a ready-to-send frame. The buffer is left
    /// untouched when the frame does not fit.
    pub fn load(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        if frame.body.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLong(frame.body.len()));
        }
        self.reset();
        let bytes = frame.to_bytes();
        self.data[..bytes.len()].copy_from_slice(&bytes);
        self.len = bytes.len();
        self.started_at = frame.received_at;
        Ok(())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == BUFFER_SIZE
    }

    /// Time the first byte arrived, or the frame was queued
    #[must_use]
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn set_started_at(&mut self, now: u64) {
        self.started_at = now;
    }
}

impl fmt::Display for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex_frame(f, self.as_bytes())
    }
}

/// Hex dump with the header and checksum bracketed, falling back to a flat
/// dump when the bytes do not form a frame.
fn write_hex_frame(f: &mut fmt::Formatter<'_>, data: &[u8]) -> fmt::Result {
    let hex = |f: &mut fmt::Formatter<'_>, bytes: &[u8]| -> fmt::Result {
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    };

    let Ok(header) = Header::parse(data) else {
        return hex(f, data);
    };
    if data.len() != header.frame_len() {
        return hex(f, data);
    }

    let crc_offset = data.len() - CHECKSUM_SIZE;
    f.write_str("[")?;
    hex(f, &data[..HEADER_SIZE])?;
    f.write_str("] ")?;
    if crc_offset > HEADER_SIZE {
        hex(f, &data[HEADER_SIZE..crc_offset])?;
        f.write_str(" ")?;
    }
    f.write_str("[")?;
    hex(f, &data[crc_offset..])?;
    f.write_str("]")
}
