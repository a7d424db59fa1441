//! Cell grid: square shards of the world and the floating origin
//!
//! The world is split into square cells of edge `cell_size` on the horizontal
//! (x, y) plane; z is up and unbounded. All cell math goes through
//! [`CellGrid`], whose `base` is the shift of the logical origin away from the
//! true world origin. Recentering only ever changes `base`, so positions
//! before and after a shift resolve to the same cells.

use std::fmt;

use crate::core::types::{IVec2, Vec3};

/// Integer coordinate identifying a cell in the world grid
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellIndex {
    pub x: i32,
    pub y: i32,
}

impl CellIndex {
    /// Create a new cell index
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Offset between two cells as an integer vector
    pub fn delta(self, other: CellIndex) -> IVec2 {
        IVec2::new(self.x.saturating_sub(other.x), self.y.saturating_sub(other.y))
    }
}

impl From<IVec2> for CellIndex {
    fn from(v: IVec2) -> Self {
        Self::new(v.x, v.y)
    }
}

impl From<CellIndex> for IVec2 {
    fn from(c: CellIndex) -> Self {
        IVec2::new(c.x, c.y)
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.x, self.y)
    }
}

/// Rectangular, half-open range of cells `[min, max)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellRange {
    pub min: CellIndex,
    pub max: CellIndex,
}

impl CellRange {
    /// Number of cells covered
    pub fn len(&self) -> usize {
        let w = (i64::from(self.max.x) - i64::from(self.min.x)).max(0) as usize;
        let h = (i64::from(self.max.y) - i64::from(self.min.y)).max(0) as usize;
        w.saturating_mul(h)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, cell: CellIndex) -> bool {
        cell.x >= self.min.x && cell.x < self.max.x && cell.y >= self.min.y && cell.y < self.max.y
    }

    /// Cells in row-major order (x fastest)
    pub fn iter(&self) -> impl Iterator<Item = CellIndex> + use<> {
        let (min, max) = (self.min, self.max);
        (min.y..max.y).flat_map(move |y| (min.x..max.x).map(move |x| CellIndex::new(x, y)))
    }
}

/// Cell coordinate along one axis. The cast saturates: NaN maps to 0 and
/// anything past the i32 range to `i32::MIN`/`i32::MAX`.
fn axis_cell(v: f32, cell_size: f32) -> i32 {
    (v / cell_size).floor() as i32
}

/// Cell size plus the floating-origin offset all cell math is relative to
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellGrid {
    cell_size: f32,
    base: IVec2,
}

impl CellGrid {
    /// Grid with the logical origin at the true world origin
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            base: IVec2::ZERO,
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Current base cell index (how far the logical origin has moved)
    pub fn base(&self) -> CellIndex {
        self.base.into()
    }

    /// Set the base directly, e.g. when restoring a saved session
    pub fn set_base(&mut self, base: CellIndex) {
        self.base = base.into();
    }

    /// World-space position of a cell's minimum corner
    pub fn cell_to_world(&self, index: CellIndex) -> Vec3 {
        let rel_x = i64::from(index.x) - i64::from(self.base.x);
        let rel_y = i64::from(index.y) - i64::from(self.base.y);
        Vec3::new(
            rel_x as f32 * self.cell_size,
            rel_y as f32 * self.cell_size,
            0.0,
        )
    }

    /// Cell containing a world-space position. Saturates at the edge of
    /// the grid.
    pub fn world_to_cell(&self, pos: Vec3) -> CellIndex {
        CellIndex::new(
            self.base.x.saturating_add(axis_cell(pos.x, self.cell_size)),
            self.base.y.saturating_add(axis_cell(pos.y, self.cell_size)),
        )
    }

    /// Cells touched by the world-space box `[min, max]`
    ///
    /// Lower bound is `floor(min / size)`, upper (exclusive) bound is
    /// `ceil(max / size)`, widened so the range never comes out empty.
    /// Non-finite corners give an empty range at the base cell; a box
    /// running off the edge of the grid is clipped to it.
    pub fn cell_range(&self, min: Vec3, max: Vec3) -> CellRange {
        if !(min.is_finite() && max.is_finite()) {
            let base = CellIndex::from(self.base);
            return CellRange { min: base, max: base };
        }

        let min_x = axis_cell(min.x, self.cell_size);
        let min_y = axis_cell(min.y, self.cell_size);
        let max_x = ((max.x / self.cell_size).ceil() as i32).max(min_x.saturating_add(1));
        let max_y = ((max.y / self.cell_size).ceil() as i32).max(min_y.saturating_add(1));

        CellRange {
            min: CellIndex::new(self.base.x.saturating_add(min_x), self.base.y.saturating_add(min_y)),
            max: CellIndex::new(self.base.x.saturating_add(max_x), self.base.y.saturating_add(max_y)),
        }
    }

    /// Move the logical origin to the cell under `observer`, if it strayed
    /// more than `threshold` from the origin horizontally.
    ///
    /// Returns the world-space offset that must be subtracted from every
    /// world-space object so it keeps resolving to the same cell.
    pub fn recenter(&mut self, observer: Vec3, threshold: f32) -> Option<Vec3> {
        if !observer.is_finite() {
            log::warn!("Ignoring recenter to non-finite position {}", observer);
            return None;
        }
        if observer.x.abs() <= threshold && observer.y.abs() <= threshold {
            return None;
        }

        let shift = IVec2::new(
            axis_cell(observer.x, self.cell_size),
            axis_cell(observer.y, self.cell_size),
        );
        let offset = Vec3::new(
            shift.x as f32 * self.cell_size,
            shift.y as f32 * self.cell_size,
            0.0,
        );

        self.base = self.base.saturating_add(shift);

        log::info!(
            "Recentering by {} (base cell now {})",
            offset,
            CellIndex::from(self.base)
        );

        Some(offset)
    }
}
