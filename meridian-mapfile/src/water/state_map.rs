//! Packed per-cell state storage for one level.

use geo::Rect;

use super::State;
use crate::tile::TileId;

/// A rectangular grid of cell [`State`]s, two bits per cell.
///
/// The grid covers the cells intersecting the import bounding box at the
/// level's cell size. Coordinates come in two flavors: absolute cell
/// coordinates on the world grid (origin at lon -180 / lat -90) and
/// relative coordinates with the grid's own south-west cell at `(0, 0)`.
#[derive(Debug, Clone)]
pub struct StateMap {
    cell_width: f64,
    cell_height: f64,
    x_start: u32,
    x_end: u32,
    y_start: u32,
    y_end: u32,
    states: Vec<u8>,
}

impl StateMap {
    /// Lays out the grid over `bbox` with the given cell dimensions in
    /// degrees. All cells start out [`State::Unknown`].
    pub fn new(bbox: &Rect<f64>, cell_width: f64, cell_height: f64) -> Self {
        #[expect(clippy::cast_possible_truncation)]
        #[expect(clippy::cast_sign_loss)]
        let cell_of = |lon: f64, lat: f64| {
            (
                ((lon + 180.0) / cell_width).floor() as u32,
                ((lat + 90.0) / cell_height).floor() as u32,
            )
        };
        let (x_start, y_start) = cell_of(bbox.min().x, bbox.min().y);
        let (x_end, y_end) = cell_of(bbox.max().x, bbox.max().y);

        let count = u64::from(x_end - x_start + 1) * u64::from(y_end - y_start + 1);
        #[expect(clippy::cast_possible_truncation)]
        let bytes = (count as usize).div_ceil(4);

        Self {
            cell_width,
            cell_height,
            x_start,
            x_end,
            y_start,
            y_end,
            states: vec![0; bytes],
        }
    }

    pub fn cell_width(&self) -> f64 {
        self.cell_width
    }

    pub fn cell_height(&self) -> f64 {
        self.cell_height
    }

    pub fn x_start(&self) -> u32 {
        self.x_start
    }

    pub fn y_start(&self) -> u32 {
        self.y_start
    }

    pub fn x_end(&self) -> u32 {
        self.x_end
    }

    pub fn y_end(&self) -> u32 {
        self.y_end
    }

    pub fn x_count(&self) -> u32 {
        self.x_end - self.x_start + 1
    }

    pub fn y_count(&self) -> u32 {
        self.y_end - self.y_start + 1
    }

    pub fn cell_count(&self) -> u64 {
        u64::from(self.x_count()) * u64::from(self.y_count())
    }

    /// Whether the absolute cell coordinate lies within the grid.
    pub fn is_in_absolute(&self, x: u32, y: u32) -> bool {
        (self.x_start..=self.x_end).contains(&x) && (self.y_start..=self.y_end).contains(&y)
    }

    /// The relative coordinate of the absolute cell containing the point,
    /// or `None` when outside the grid.
    pub fn cell_of(&self, lon: f64, lat: f64) -> Option<TileId> {
        #[expect(clippy::cast_possible_truncation)]
        #[expect(clippy::cast_sign_loss)]
        let (x, y) = (
            ((lon + 180.0) / self.cell_width).floor() as u32,
            ((lat + 90.0) / self.cell_height).floor() as u32,
        );
        if self.is_in_absolute(x, y) {
            Some(TileId::new(x - self.x_start, y - self.y_start))
        } else {
            None
        }
    }

    fn slot(&self, x: u32, y: u32) -> (usize, u32) {
        debug_assert!(x < self.x_count() && y < self.y_count());
        let index = y as usize * self.x_count() as usize + x as usize;
        (index / 4, (index as u32 % 4) * 2)
    }

    pub fn get_state(&self, x: u32, y: u32) -> State {
        let (byte, shift) = self.slot(x, y);
        State::try_from((self.states[byte] >> shift) & 0b11).unwrap_or(State::Unknown)
    }

    pub fn set_state(&mut self, x: u32, y: u32, state: State) {
        let (byte, shift) = self.slot(x, y);
        self.states[byte] &= !(0b11 << shift);
        self.states[byte] |= u8::from(state) << shift;
    }

    pub fn get_state_absolute(&self, x: u32, y: u32) -> State {
        self.get_state(x - self.x_start, y - self.y_start)
    }

    pub fn set_state_absolute(&mut self, x: u32, y: u32, state: State) {
        self.set_state(x - self.x_start, y - self.y_start, state);
    }
}
