//! Observer (player) state and its 8-byte encoding.

use crate::core::types::Vec3;
use super::RECORD_SIZE;

/// Observer state flags
pub mod flags {
    pub const ON_GROUND: u8 = 1 << 0;
    pub const DUCKING: u8 = 1 << 1;
    pub const SWIMMING: u8 = 1 << 2;
}

/// Position, heading and movement flags of an observer, cell-local.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ObserverState {
    pub position: Vec3,
    /// Heading in degrees
    pub heading: f32,
    /// Bitset of [`flags`]
    pub flags: u8,
}

impl ObserverState {
    pub fn new(position: Vec3, heading: f32, flags: u8) -> Self {
        Self { position, heading, flags }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Quantize relative to a cell of edge `cell_size`.
    ///
    /// Positions map `[0, cell_size)` onto 65536 steps and are clamped rather
    /// than rejected. The heading is wrapped into `[0, 360)` and its step
    /// clamped to 255.
    pub fn compress(&self, cell_size: f32) -> CompressedObserverState {
        let rel_pos = self.position / cell_size;
        let mut rel_heading = self.heading / 360.0;
        rel_heading -= rel_heading.floor();

        CompressedObserverState {
            x: quantize(rel_pos.x),
            y: quantize(rel_pos.y),
            z: quantize(rel_pos.z),
            heading: (rel_heading * 256.0).round().min(255.0) as u8,
            flags: self.flags,
        }
    }
}

/// Fixed 8-byte observer record: `{x, y, z, heading, flags}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CompressedObserverState {
    pub x: u16,
    pub y: u16,
    pub z: u16,
    /// 256 steps over 360 degrees
    pub heading: u8,
    pub flags: u8,
}

impl CompressedObserverState {
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        self.write(&mut out);
        out
    }

    /// Write into the first 8 bytes of `out`.
    ///
    /// Panics if `out` is shorter than a record.
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.x.to_le_bytes());
        out[2..4].copy_from_slice(&self.y.to_le_bytes());
        out[4..6].copy_from_slice(&self.z.to_le_bytes());
        out[6] = self.heading;
        out[7] = self.flags;
    }

    pub fn read(data: &[u8]) -> Option<Self> {
        let bytes = data.get(..RECORD_SIZE)?;
        Some(Self {
            x: u16::from_le_bytes([bytes[0], bytes[1]]),
            y: u16::from_le_bytes([bytes[2], bytes[3]]),
            z: u16::from_le_bytes([bytes[4], bytes[5]]),
            heading: bytes[6],
            flags: bytes[7],
        })
    }

    pub fn decompress(&self, cell_size: f32) -> ObserverState {
        let rel_pos = Vec3::new(self.x as f32, self.y as f32, self.z as f32) / 65536.0;
        ObserverState {
            position: rel_pos * cell_size,
            heading: self.heading as f32 / 256.0 * 360.0,
            flags: self.flags,
        }
    }
}

fn quantize(rel: f32) -> u16 {
    (rel * 65536.0).round().clamp(0.0, u16::MAX as f32) as u16
}
