//! Edit quantization codec.

use crate::core::types::Vec3;
use crate::math::Aabb;
use super::RECORD_SIZE;

/// Smallest representable edit size
pub const MIN_SIZE: f32 = 16.0;
/// Largest representable edit size
pub const MAX_SIZE: f32 = 1024.0;

/// Steps used for positions (per axis)
const POS_STEPS: f32 = 65536.0;
/// Steps used for the log-scaled size
const SIZE_STEPS: f32 = 255.0;

/// Additive or subtractive terrain modification.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EditKind {
    Add = 0,
    Subtract = 1,
}

impl EditKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EditKind::Add),
            1 => Some(EditKind::Subtract),
            _ => None,
        }
    }
}

/// A single terrain edit in some cell-local (or subscription-local) frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Edit {
    pub kind: EditKind,
    /// Radius of the edit, in `[MIN_SIZE, MAX_SIZE]` once encoded
    pub size: f32,
    pub origin: Vec3,
}

impl Edit {
    pub fn new(kind: EditKind, size: f32, origin: Vec3) -> Self {
        Self { kind, size, origin }
    }

    /// Region this edit can affect: `origin ± (size + margin)`.
    pub fn influence_bounds(&self, margin: f32) -> Aabb {
        Aabb::around(self.origin, self.size + margin)
    }

    /// Same edit expressed in a frame whose origin sits at `-offset`.
    pub fn translated(&self, offset: Vec3) -> Edit {
        Edit {
            origin: self.origin + offset,
            ..*self
        }
    }

    /// Quantize relative to a cell of edge `cell_size`.
    ///
    /// A cell can represent origins in `[-cell_size / 2, 3 * cell_size / 2)`
    /// on every axis. Returns `None` when the origin falls outside that span;
    /// the size is clamped instead.
    pub fn compress(&self, cell_size: f32) -> Option<CompressedEdit> {
        let size = self.size.clamp(MIN_SIZE, MAX_SIZE);
        let rel_size = ((size / MIN_SIZE).log2() * SIZE_STEPS / size_octaves()).round();

        let min_pos = -cell_size * 0.5;
        let rel_pos = (self.origin - Vec3::splat(min_pos)) / (cell_size * 2.0);

        if !rel_pos.cmpge(Vec3::ZERO).all() || !rel_pos.cmplt(Vec3::ONE).all() {
            return None;
        }

        Some(CompressedEdit {
            kind: self.kind as u8,
            size_exponent: rel_size.clamp(0.0, 255.0) as u8,
            x: quantize_pos(rel_pos.x),
            y: quantize_pos(rel_pos.y),
            z: quantize_pos(rel_pos.z),
        })
    }
}

/// Fixed 8-byte edit record: `{kind, sizeExponent, x, y, z}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CompressedEdit {
    pub kind: u8,
    /// Size quantized log-uniformly over `[MIN_SIZE, MAX_SIZE]`
    pub size_exponent: u8,
    pub x: u16,
    pub y: u16,
    pub z: u16,
}

impl CompressedEdit {
    /// Little-endian record bytes
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        self.write(&mut out);
        out
    }

    /// Write into the first 8 bytes of `out`.
    ///
    /// Panics if `out` is shorter than a record.
    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.kind;
        out[1] = self.size_exponent;
        out[2..4].copy_from_slice(&self.x.to_le_bytes());
        out[4..6].copy_from_slice(&self.y.to_le_bytes());
        out[6..8].copy_from_slice(&self.z.to_le_bytes());
    }

    /// Parse the first 8 bytes of `data`.
    ///
    /// Returns `None` if `data` is short or the kind byte is unknown.
    pub fn read(data: &[u8]) -> Option<Self> {
        let bytes = data.get(..RECORD_SIZE)?;
        EditKind::from_u8(bytes[0])?;

        Some(Self {
            kind: bytes[0],
            size_exponent: bytes[1],
            x: u16::from_le_bytes([bytes[2], bytes[3]]),
            y: u16::from_le_bytes([bytes[4], bytes[5]]),
            z: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn edit_kind(&self) -> EditKind {
        EditKind::from_u8(self.kind).unwrap_or(EditKind::Add)
    }

    /// Expand back into cell-local floating point.
    pub fn decompress(&self, cell_size: f32) -> Edit {
        let size = MIN_SIZE * (self.size_exponent as f32 / SIZE_STEPS * size_octaves()).exp2();

        let min_pos = -cell_size * 0.5;
        let span = cell_size * 2.0;
        let origin = Vec3::splat(min_pos)
            + Vec3::new(self.x as f32, self.y as f32, self.z as f32) / POS_STEPS * span;

        Edit {
            kind: self.edit_kind(),
            size,
            origin,
        }
    }
}

fn size_octaves() -> f32 {
    (MAX_SIZE / MIN_SIZE).log2()
}

fn quantize_pos(rel: f32) -> u16 {
    (rel * POS_STEPS).round().clamp(0.0, u16::MAX as f32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL: f32 = 8192.0;

    fn pos_step() -> f32 {
        CELL * 2.0 / 65536.0
    }

    fn size_factor() -> f32 {
        (size_octaves() / 255.0).exp2()
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let samples = [
            Edit::new(EditKind::Add, 64.0, Vec3::new(100.0, 100.0, 100.0)),
            Edit::new(EditKind::Subtract, 16.0, Vec3::new(-4096.0, 0.0, 12000.0)),
            Edit::new(EditKind::Add, 1024.0, Vec3::new(8191.5, -1234.5, 77.7)),
            Edit::new(EditKind::Subtract, 333.0, Vec3::new(0.0, 4000.0, -4000.0)),
        ];

        for edit in samples {
            let back = edit.compress(CELL).unwrap().decompress(CELL);
            assert_eq!(back.kind, edit.kind);
            assert!(back.size <= edit.size * size_factor() && back.size >= edit.size / size_factor(),
                "size {} -> {}", edit.size, back.size);
            let err = (back.origin - edit.origin).abs();
            assert!(err.max_element() <= pos_step(), "origin {} -> {}", edit.origin, back.origin);
        }
    }

    #[test]
    fn test_size_is_clamped() {
        let tiny = Edit::new(EditKind::Add, 1.0, Vec3::ZERO).compress(CELL).unwrap();
        assert_eq!(tiny.size_exponent, 0);
        assert_eq!(tiny.decompress(CELL).size, MIN_SIZE);

        let huge = Edit::new(EditKind::Add, 1.0e6, Vec3::ZERO).compress(CELL).unwrap();
        assert_eq!(huge.size_exponent, 255);
        assert!((huge.decompress(CELL).size - MAX_SIZE).abs() < 0.01);
    }

    #[test]
    fn test_out_of_span_is_rejected() {
        let min_pos = -CELL * 0.5;
        let max_pos = min_pos + CELL * 2.0;

        let at_min = Edit::new(EditKind::Add, 64.0, Vec3::splat(min_pos));
        assert!(at_min.compress(CELL).is_some());

        for origin in [
            Vec3::new(min_pos - 1.0, 0.0, 0.0),
            Vec3::new(0.0, max_pos, 0.0),
            Vec3::new(0.0, 0.0, max_pos + 10.0),
            Vec3::new(f32::NAN, 0.0, 0.0),
        ] {
            let edit = Edit::new(EditKind::Subtract, 64.0, origin);
            assert!(edit.compress(CELL).is_none(), "{origin} should be rejected");
        }
    }

    #[test]
    fn test_byte_layout_is_little_endian() {
        let record = CompressedEdit { kind: 1, size_exponent: 0xAB, x: 0x0102, y: 0x0304, z: 0xFFEE };
        assert_eq!(record.to_bytes(), [1, 0xAB, 0x02, 0x01, 0x04, 0x03, 0xEE, 0xFF]);
        assert_eq!(CompressedEdit::read(&record.to_bytes()), Some(record));
    }

    #[test]
    fn test_read_rejects_short_or_unknown_kind() {
        assert!(CompressedEdit::read(&[0u8; 7]).is_none());
        assert!(CompressedEdit::read(&[9, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_influence_bounds() {
        let edit = Edit::new(EditKind::Add, 64.0, Vec3::new(10.0, 20.0, 30.0));
        let bounds = edit.influence_bounds(16.0);
        assert_eq!(bounds.min, Vec3::new(-70.0, -60.0, -50.0));
        assert_eq!(bounds.max, Vec3::new(90.0, 100.0, 110.0));
    }
}
