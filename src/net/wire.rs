//! Binary framing for cell traffic.
//!
//! Every frame is a 16-byte little-endian header followed by its payload:
//!
//! ```text
//! u16 kind | u16 reserved | i32 cell_x | i32 cell_y | i32 payload_len | payload
//! ```

use crate::cell::CellIndex;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::{CompressedEdit, CompressedObserverState, RECORD_SIZE};

/// Header bytes preceding every payload
pub const HEADER_SIZE: usize = 16;

/// Largest payload a stream reader accepts before dropping the connection
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Bytes per entry in an observer batch: id plus state record
const OBSERVER_ENTRY_SIZE: usize = 8 + RECORD_SIZE;

/// Frame kind
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Subscribe = 0,
    Unsubscribe = 1,
    Edit = 2,
    ObserverState = 3,
}

impl MessageKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(MessageKind::Subscribe),
            1 => Some(MessageKind::Unsubscribe),
            2 => Some(MessageKind::Edit),
            3 => Some(MessageKind::ObserverState),
            _ => None,
        }
    }
}

/// A decoded frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub cell: CellIndex,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, cell: CellIndex, payload: Vec<u8>) -> Self {
        Self { kind, cell, payload }
    }

    pub fn subscribe(cell: CellIndex) -> Self {
        Self::new(MessageKind::Subscribe, cell, Vec::new())
    }

    pub fn unsubscribe(cell: CellIndex) -> Self {
        Self::new(MessageKind::Unsubscribe, cell, Vec::new())
    }

    pub fn edit(cell: CellIndex, edit: &CompressedEdit) -> Self {
        Self::new(MessageKind::Edit, cell, edit.to_bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.kind, self.cell, &self.payload)
    }

    /// Edit record carried by an Edit frame
    pub fn edit_payload(&self) -> Option<CompressedEdit> {
        match self.kind {
            MessageKind::Edit => CompressedEdit::read(&self.payload),
            _ => None,
        }
    }
}

/// Serialize header and payload into one buffer
pub fn encode_frame(kind: MessageKind, cell: CellIndex, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&(kind as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&cell.x.to_le_bytes());
    out.extend_from_slice(&cell.y.to_le_bytes());
    out.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

struct Header {
    kind: u16,
    cell: CellIndex,
    payload_len: i32,
}

fn read_header(data: &[u8]) -> Option<Header> {
    let h = data.get(..HEADER_SIZE)?;
    let i32_at = |at: usize| i32::from_le_bytes([h[at], h[at + 1], h[at + 2], h[at + 3]]);
    Some(Header {
        kind: u16::from_le_bytes([h[0], h[1]]),
        cell: CellIndex::new(i32_at(4), i32_at(8)),
        payload_len: i32_at(12),
    })
}

/// Decode one complete frame from a message.
///
/// Returns `None` for truncated input, a negative length or an unknown kind.
/// Bytes past the declared payload are ignored.
pub fn decode_frame(data: &[u8]) -> Option<Frame> {
    let header = read_header(data)?;
    let kind = MessageKind::from_u16(header.kind)?;
    let len = usize::try_from(header.payload_len).ok()?;
    let payload = data.get(HEADER_SIZE..HEADER_SIZE + len)?;
    Some(Frame::new(kind, header.cell, payload.to_vec()))
}

/// Splits a byte stream into frames
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    /// Append bytes read from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed. A negative or oversized
    /// length is an error; the stream cannot be resynchronized after it.
    /// Frames of unknown kind are skipped.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(header) = read_header(&self.buf) else {
                return Ok(None);
            };

            let len = usize::try_from(header.payload_len)
                .ok()
                .filter(|len| *len <= self.max_payload)
                .ok_or_else(|| Error::Transport(format!("bad payload length {}", header.payload_len)))?;

            let end = HEADER_SIZE + len;
            if self.buf.len() < end {
                return Ok(None);
            }

            let payload = self.buf[HEADER_SIZE..end].to_vec();
            self.buf.drain(..end);

            match MessageKind::from_u16(header.kind) {
                Some(kind) => return Ok(Some(Frame::new(kind, header.cell, payload))),
                None => log::warn!("Skipping frame of unknown kind {}", header.kind),
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer states for one cell, as carried by an ObserverState frame
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObserverBatch {
    /// Seconds between updates from the sender
    pub period: f32,
    pub states: Vec<(i64, CompressedObserverState)>,
}

impl ObserverBatch {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.states.len() * OBSERVER_ENTRY_SIZE);
        out.extend_from_slice(&(self.states.len() as i32).to_le_bytes());
        out.extend_from_slice(&self.period.to_le_bytes());
        for (id, state) in &self.states {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&state.to_bytes());
        }
        out
    }

    /// Returns `None` if the payload is shorter than its count claims
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let head = payload.get(..8)?;
        let count = i32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let period = f32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        let count = usize::try_from(count).ok()?;

        let body = payload.get(8..8 + count.checked_mul(OBSERVER_ENTRY_SIZE)?)?;
        let states = body
            .chunks_exact(OBSERVER_ENTRY_SIZE)
            .map(|entry| {
                let mut id = [0u8; 8];
                id.copy_from_slice(&entry[..8]);
                Some((i64::from_le_bytes(id), CompressedObserverState::read(&entry[8..])?))
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self { period, states })
    }
}
