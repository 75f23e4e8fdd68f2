//! # Water index
//!
//! Classifies the world into land, water, and coast cells per
//! magnification level, derived from coastline geometry. Coast cells
//! additionally carry "ground tiles": sub-cell polygons in a 16-bit
//! fixed-point coordinate system that renderers fill directly.
//!
//! The pipeline runs per level:
//!
//! 1. merge raw coastline ways into rings and long chains
//! 2. synthesize coastlines against the bounding polygons of the extract
//! 3. compute per-cell border intersections for every coastline
//! 4. mark crossed cells as coast and emit ground tiles by walking each
//!    cell boundary clockwise
//! 5. infer neighbor states, flood water, fill enclosed land
//! 6. serialize a per-level state bitmap plus ground tile data
//!
//! Cells never touched by any rule receive a configurable default
//! (assume land by default).

mod coastline;
mod file;
mod geometry;
mod processor;
mod state_map;

pub use coastline::{merge_coastlines, synthesize_coastlines};
pub use file::{CellContent, WaterIndexReader, write_water_index};
pub use processor::WaterIndexProcessor;
pub use state_map::StateMap;

use geo::Coord;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::tile::TileId;
use crate::{FileOffset, ObjectId};

#[derive(Debug, Error)]
pub enum WaterIndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("water index covers levels {min}..={max}, requested {requested}")]
    LevelOutOfRange { min: u32, max: u32, requested: u32 },
}

/// Classification of a grid cell.
///
/// Stored in two bits per cell; the numeric values are part of the file
/// format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive, PartialOrd, Ord,
)]
#[repr(u8)]
pub enum State {
    #[default]
    Unknown = 0,
    Land = 1,
    Water = 2,
    Coast = 3,
}

/// What lies on one side of a coastline, viewed along its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoastState {
    /// Not yet resolved. Synthesis replaces this before processing.
    Undefined,
    Land,
    Water,
    /// Outside the data extent; nothing may be assumed.
    Unknown,
}

/// A coastline: either a closed ring (`is_area`) or an open chain.
///
/// Walking from the first point to the last, `right` is the side the
/// water index treats as sea for OSM-style coastlines.
#[derive(Debug, Clone)]
pub struct Coast {
    pub id: ObjectId,
    pub is_area: bool,
    pub front_node_id: ObjectId,
    pub back_node_id: ObjectId,
    pub points: Vec<Coord<f64>>,
    pub left: CoastState,
    pub right: CoastState,
}

/// Fixed-point coordinate within a cell, `[0, CELL_MAX]` on both axes.
///
/// The `coast` flag marks points lying on the actual coastline (as
/// opposed to synthetic points on the cell border); it is serialized as
/// bit 15 of `x`, which is why the resolution stops at 15 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroundCoord {
    pub x: u16,
    pub y: u16,
    pub coast: bool,
}

impl GroundCoord {
    pub const CELL_MAX: u16 = 32767;

    pub const fn new(x: u16, y: u16, coast: bool) -> Self {
        Self { x, y, coast }
    }

    /// Equality ignoring the coast flag, as used by island detection.
    pub const fn same_position(self, other: Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

/// A filled polygon within a coast cell.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTile {
    pub tile_type: State,
    pub coords: Vec<GroundCoord>,
}

impl GroundTile {
    pub fn new(tile_type: State) -> Self {
        Self {
            tile_type,
            coords: Vec::new(),
        }
    }
}

/// Ground tiles per cell, keyed by cell coordinates relative to the
/// level's state map, iterated row-major.
pub type CellGroundTiles = std::collections::BTreeMap<TileId, Vec<GroundTile>>;

/// Tuning for the water index build.
#[derive(Debug, Clone)]
pub struct WaterIndexParameter {
    /// First (coarsest) level to build.
    pub min_level: u32,
    /// Last (finest) level to build.
    pub max_level: u32,
    /// Classification applied to cells no rule could decide.
    pub default_assumption: State,
    /// Upper bound on water flood-fill sweeps per level.
    pub fill_water_iterations: usize,
}

impl Default for WaterIndexParameter {
    fn default() -> Self {
        Self {
            min_level: 6,
            max_level: 14,
            default_assumption: State::Land,
            fill_water_iterations: 20,
        }
    }
}

/// Build state for one index level.
#[derive(Debug, Clone)]
pub struct Level {
    pub level: u32,
    pub state_map: StateMap,
    pub has_cell_data: bool,
    pub default_cell_data: State,
    pub data_offset_bytes: u8,
    pub index_data_offset: FileOffset,
    pub(crate) index_entry_offset: FileOffset,
}

impl Level {
    pub fn new(level: u32, state_map: StateMap) -> Self {
        Self {
            level,
            state_map,
            has_cell_data: false,
            default_cell_data: State::Unknown,
            data_offset_bytes: 0,
            index_data_offset: 0,
            index_entry_offset: 0,
        }
    }
}

/// Geographic and fixed-point boundaries of one cell.
pub(crate) struct CellBoundaries {
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
    /// Corner coordinates: top left, top right, bottom right, bottom left.
    pub border_points: [Coord<f64>; 4],
    /// Same corners in fixed-point cell space.
    pub border_coords: [GroundCoord; 4],
}

impl CellBoundaries {
    pub fn new(state_map: &StateMap, cell: TileId) -> Self {
        let lon_min =
            f64::from(state_map.x_start() + cell.x) * state_map.cell_width() - 180.0;
        let lon_max = lon_min + state_map.cell_width();
        let lat_min =
            f64::from(state_map.y_start() + cell.y) * state_map.cell_height() - 90.0;
        let lat_max = lat_min + state_map.cell_height();

        const MAX: u16 = GroundCoord::CELL_MAX;
        Self {
            lon_min,
            lon_max,
            lat_min,
            lat_max,
            border_points: [
                Coord { x: lon_min, y: lat_max },
                Coord { x: lon_max, y: lat_max },
                Coord { x: lon_max, y: lat_min },
                Coord { x: lon_min, y: lat_min },
            ],
            border_coords: [
                GroundCoord::new(0, MAX, false),
                GroundCoord::new(MAX, MAX, false),
                GroundCoord::new(MAX, 0, false),
                GroundCoord::new(0, 0, false),
            ],
        }
    }
}

/// Maps a geographic point into the fixed-point space of a cell.
pub(crate) fn transform(
    point: Coord<f64>,
    state_map: &StateMap,
    cell_min_lat: f64,
    cell_min_lon: f64,
    coast: bool,
) -> GroundCoord {
    #[expect(clippy::cast_possible_truncation)]
    #[expect(clippy::cast_sign_loss)]
    GroundCoord::new(
        ((point.x - cell_min_lon) / state_map.cell_width() * f64::from(GroundCoord::CELL_MAX)
            + 0.5)
            .floor() as u16,
        ((point.y - cell_min_lat) / state_map.cell_height() * f64::from(GroundCoord::CELL_MAX)
            + 0.5)
            .floor() as u16,
        coast,
    )
}
