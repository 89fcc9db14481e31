#![deny(unsafe_code)]

//! # Overview
//!
//! On-wire frame types for the udxfer transfer protocol: the fixed-layout
//! [`Header`] that precedes every frame, the closed set of [`Kind`] and
//! [`ControlKind`] values a header can carry, and the [`Block`] buffer shape
//! used to move a header plus its payload through a local pipe in one write.
//!
//! # Design
//!
//! A frame is a [`Header`] followed by exactly `data_len` bytes of payload.
//! [`Header::write`]/[`Header::read`] encode/decode the header field by
//! field in a fixed little-endian layout rather than relying on any
//! compiler struct layout, so the wire format is identical across platforms
//! and compilers (see the crate's `Open Question` note in the workspace
//! `DESIGN.md`). [`write_block`]/[`read_data`] are the whole-frame helpers
//! the sender and receiver protocol drivers use directly.
//!
//! # Invariants
//!
//! - [`Header::data_len`] never exceeds [`BLOCK_PAYLOAD_LEN`].
//! - [`Kind`]/[`ControlKind`] round-trip through [`TryFrom<u8>`]; any other
//!   byte value is rejected as [`WireError::InvalidKind`].
//! - A single call to [`write_block`] emits `HEADER_LEN + n` bytes in one
//!   `Write` call so a block is never observed half-written by a peer
//!   reading the same pipe.

use std::io::{self, Read, Write};

/// Size in bytes of the on-wire [`Header`] encoding.
///
/// `ctrl_msg (1) + data_len (8) + mtime_sec (4) + mtime_nsec (8) + kind (1)`,
/// written field by field with no implicit padding.
pub const HEADER_LEN: usize = 1 + 8 + 4 + 8 + 1;

/// Maximum payload carried by a single `DATA` frame: 64 MiB minus the
/// header, matching the optimal block size the underlying reliable-UDP
/// transport is tuned for.
pub const BLOCK_PAYLOAD_LEN: usize = 67_108_848;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The peer's socket or pipe ended before a whole frame was read.
    #[error("unexpected end of stream while reading {0}")]
    UnexpectedEof(&'static str),
    /// A header named a message kind outside the closed set.
    #[error("invalid frame kind byte {0}")]
    InvalidKind(u8),
    /// A header named a control sub-message kind outside the closed set.
    #[error("invalid control sub-message byte {0}")]
    InvalidControlKind(u8),
    /// A header's `data_len` exceeds [`BLOCK_PAYLOAD_LEN`].
    #[error("frame payload length {0} exceeds maximum block size {BLOCK_PAYLOAD_LEN}")]
    PayloadTooLarge(u64),
    /// The underlying pipe or socket returned an I/O error.
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The closed set of message kinds a [`Header`] can carry.
///
/// Mirrors `xfer_t` in the original `parcel` wire format verbatim, including
/// numeric order, since the ordering is meaningless on its own but keeping
/// it stable documents the specification this was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// A chunk of file content.
    Data = 0,
    /// The relative destination path of a regular file about to be sent.
    Filename = 1,
    /// The relative destination path of a FIFO or character device.
    Fifo = 2,
    /// A directory that must exist before any of its children arrive.
    Dirname = 3,
    /// The announced byte length of the file currently being sent.
    FSize = 4,
    /// The sender has drained its file list.
    Complete = 5,
    /// Reserved for future flow-control use; currently only logged.
    Wait = 6,
    /// End of the current file's data; the receiver should close and
    /// restore its modification time.
    DataComplete = 7,
    /// A packed [`crate`]-level file list exchanged during pre-flight.
    FileList = 8,
    /// A control sub-message (see [`ControlKind`]).
    Control = 9,
}

impl Kind {
    const MAX: u8 = 9;
}

impl TryFrom<u8> for Kind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Kind::Data,
            1 => Kind::Filename,
            2 => Kind::Fifo,
            3 => Kind::Dirname,
            4 => Kind::FSize,
            5 => Kind::Complete,
            6 => Kind::Wait,
            7 => Kind::DataComplete,
            8 => Kind::FileList,
            9 => Kind::Control,
            other => return Err(WireError::InvalidKind(other)),
        })
    }
}

/// Control sub-messages, valid only when [`Header::kind`] is [`Kind::Control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlKind {
    /// Acknowledges the peer's `COMPLETE` frame; ends the transfer.
    Ack = 0,
    /// Signals that the responder's transport socket has accepted a
    /// connection and is ready to receive framed data.
    RecvReady = 1,
    /// Acknowledges receipt of a file list during the pre-flight exchange.
    Received = 2,
}

impl TryFrom<u8> for ControlKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ControlKind::Ack,
            1 => ControlKind::RecvReady,
            2 => ControlKind::Received,
            other => return Err(WireError::InvalidControlKind(other)),
        })
    }
}

/// Fixed-layout frame header: message kind, payload length, and the
/// modification time of the file a `FILENAME` frame announces.
///
/// `mtime_sec`/`mtime_nsec` are unused (left zero) on frame kinds other than
/// `FILENAME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Message kind this header announces.
    pub kind: Kind,
    /// Control sub-message, meaningful only when `kind == Kind::Control`.
    pub ctrl_msg: ControlKind,
    /// Number of payload bytes following this header.
    pub data_len: u64,
    /// Modification time, whole seconds.
    pub mtime_sec: u32,
    /// Modification time, nanosecond remainder.
    pub mtime_nsec: u64,
}

impl Header {
    /// Builds a header for a non-control frame with the given payload
    /// length and no modification time.
    #[must_use]
    pub fn new(kind: Kind, data_len: u64) -> Self {
        Self {
            kind,
            ctrl_msg: ControlKind::Ack,
            data_len,
            mtime_sec: 0,
            mtime_nsec: 0,
        }
    }

    /// Builds a `FILENAME` header carrying a modification time.
    #[must_use]
    pub fn filename(data_len: u64, mtime_sec: u32, mtime_nsec: u64) -> Self {
        Self {
            kind: Kind::Filename,
            ctrl_msg: ControlKind::Ack,
            data_len,
            mtime_sec,
            mtime_nsec,
        }
    }

    /// Builds a `CONTROL` header carrying the given sub-message.
    #[must_use]
    pub fn control(ctrl_msg: ControlKind) -> Self {
        Self {
            kind: Kind::Control,
            ctrl_msg,
            data_len: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
        }
    }

    /// Validates and constructs a header from its raw wire fields.
    fn from_raw(
        ctrl_msg: u8,
        data_len: u64,
        mtime_sec: u32,
        mtime_nsec: u64,
        kind: u8,
    ) -> Result<Self, WireError> {
        if data_len as usize > BLOCK_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(data_len));
        }
        Ok(Self {
            kind: Kind::try_from(kind)?,
            ctrl_msg: ControlKind::try_from(ctrl_msg)?,
            data_len,
            mtime_sec,
            mtime_nsec,
        })
    }

    /// Encodes this header into its fixed [`HEADER_LEN`]-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let mut offset = 0;
        buf[offset] = self.ctrl_msg as u8;
        offset += 1;
        buf[offset..offset + 8].copy_from_slice(&self.data_len.to_le_bytes());
        offset += 8;
        buf[offset..offset + 4].copy_from_slice(&self.mtime_sec.to_le_bytes());
        offset += 4;
        buf[offset..offset + 8].copy_from_slice(&self.mtime_nsec.to_le_bytes());
        offset += 8;
        buf[offset] = self.kind as u8;
        buf
    }

    /// Decodes a header from its fixed [`HEADER_LEN`]-byte wire form.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, WireError> {
        let ctrl_msg = buf[0];
        let data_len = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        let mtime_sec = u32::from_le_bytes(buf[9..13].try_into().unwrap());
        let mtime_nsec = u64::from_le_bytes(buf[13..21].try_into().unwrap());
        let kind = buf[21];
        Self::from_raw(ctrl_msg, data_len, mtime_sec, mtime_nsec, kind)
    }

    /// Writes exactly [`HEADER_LEN`] bytes to `w`.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<(), WireError> {
        w.write_all(&self.encode())?;
        Ok(())
    }

    /// Reads exactly [`HEADER_LEN`] bytes from `r` and decodes a header.
    pub fn read<R: Read>(r: &mut R) -> Result<Self, WireError> {
        let mut buf = [0u8; HEADER_LEN];
        read_exact_or_eof(r, &mut buf, "frame header")?;
        Self::decode(&buf)
    }
}

/// A contiguous send/receive buffer: [`HEADER_LEN`] bytes of header prelude
/// followed by up to [`BLOCK_PAYLOAD_LEN`] bytes of payload.
///
/// The protocol driver writes into this buffer once per block so that
/// [`write_block`] can push header and payload to the pipe in a single
/// `write_all` call.
pub struct Block {
    buffer: Vec<u8>,
}

impl Block {
    /// Allocates a block buffer sized for a full header plus payload.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; HEADER_LEN + BLOCK_PAYLOAD_LEN],
        }
    }

    /// The payload region of the buffer, writable in place before a send.
    pub fn payload_mut(&mut self, len: usize) -> &mut [u8] {
        &mut self.buffer[HEADER_LEN..HEADER_LEN + len]
    }

    /// The payload region of the buffer, for a read in place.
    pub fn payload(&self, len: usize) -> &[u8] {
        &self.buffer[HEADER_LEN..HEADER_LEN + len]
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `header` followed by the first `len` bytes of `block`'s payload
/// region to `w` as a single frame.
pub fn write_block<W: Write>(w: &mut W, header: &Header, block: &Block, len: usize) -> Result<(), WireError> {
    let mut framed = Vec::with_capacity(HEADER_LEN + len);
    framed.extend_from_slice(&header.encode());
    framed.extend_from_slice(block.payload(len));
    w.write_all(&framed)?;
    Ok(())
}

/// Reads exactly `n` bytes from `r` into `buf[..n]`, looping until the
/// buffer is full. EOF before `n` bytes have accumulated is an error.
pub fn read_data<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    read_exact_or_eof(r, buf, "frame payload")
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(WireError::UnexpectedEof(what));
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_wire_encoding() {
        let header = Header::filename(42, 1_700_000_000, 123_456_789);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn control_header_carries_sub_message() {
        let header = Header::control(ControlKind::RecvReady);
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded.kind, Kind::Control);
        assert_eq!(decoded.ctrl_msg, ControlKind::RecvReady);
    }

    #[test]
    fn invalid_kind_byte_is_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        buf[HEADER_LEN - 1] = Kind::MAX + 1;
        let err = Header::decode(&buf).unwrap_err();
        assert!(matches!(err, WireError::InvalidKind(10)));
    }

    #[test]
    fn payload_length_above_block_size_is_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        let too_big = (BLOCK_PAYLOAD_LEN as u64) + 1;
        buf[1..9].copy_from_slice(&too_big.to_le_bytes());
        let err = Header::decode(&buf).unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge(_)));
    }

    #[test]
    fn write_block_then_read_header_and_payload_round_trips() {
        let mut pipe = Vec::new();
        let header = Header::new(Kind::Data, 5);
        let mut block = Block::new();
        block.payload_mut(5).copy_from_slice(b"hello");
        write_block(&mut pipe, &header, &block, 5).unwrap();

        let mut cursor = io::Cursor::new(pipe);
        let read_header = Header::read(&mut cursor).unwrap();
        assert_eq!(read_header, header);
        let mut payload = [0u8; 5];
        read_data(&mut cursor, &mut payload).unwrap();
        assert_eq!(&payload, b"hello");
    }

    #[test]
    fn read_header_reports_eof_on_short_stream() {
        let mut cursor = io::Cursor::new(vec![0u8; HEADER_LEN - 1]);
        let err = Header::read(&mut cursor).unwrap_err();
        assert!(matches!(err, WireError::UnexpectedEof("frame header")));
    }
}
