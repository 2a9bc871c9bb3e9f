//! Square grids of raw 16-bit pressure cells, used both for a single
//! quadrant tile and for the combined floor map.

use std::fmt;

/// Cells along one side of a single quadrant tile.
pub const TILE_SIZE: usize = 48;

/// Cells along one side of the combined floor map.
pub const MAP_SIZE: usize = TILE_SIZE * 2;

/// A square, row-major grid of `u16` cells.
#[derive(Clone, PartialEq, Eq)]
pub struct Grid {
    size: usize,
    cells: Vec<u16>,
}

/// The full 96x96 floor map assembled from the four quadrants.
pub type PressureMap = Grid;

impl Grid {
    /// A grid of `size` x `size` cells, all zero.
    pub fn zeroed(size: usize) -> Self {
        Self {
            size,
            cells: vec![0; size * size],
        }
    }

    /// Builds a grid from row-major cells. Returns `None` if `cells` is not
    /// exactly `size * size` long.
    pub fn from_cells(size: usize, cells: Vec<u16>) -> Option<Self> {
        (cells.len() == size * size).then_some(Self { size, cells })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, row: usize, col: usize) -> u16 {
        self.cells[row * self.size + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: u16) {
        self.cells[row * self.size + col] = value;
    }

    /// Row-major view of every cell.
    pub fn cells(&self) -> &[u16] {
        &self.cells
    }

    /// Sum of all cells, handy for a coarse "total load" readout.
    pub fn total(&self) -> u64 {
        self.cells.iter().map(|&c| c as u64).sum()
    }

    /// Iterates the `size` x `size` block whose top-left corner sits at
    /// (`row`, `col`), yielding `(local_row, local_col, value)`.
    pub fn block(
        &self,
        row: usize,
        col: usize,
        size: usize,
    ) -> impl Iterator<Item = (usize, usize, u16)> + '_ {
        (0..size).flat_map(move |i| (0..size).map(move |j| (i, j, self.get(row + i, col + j))))
    }
}

impl fmt::Debug for Grid {
    // 9216 cells is no fun to read in a panic message
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Grid({}x{}, total={})", self.size, self.size, self.total())
    }
}
