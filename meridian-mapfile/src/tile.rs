//! # Tile arithmetic
//!
//! The world (lon ∈ [-180, 180], lat ∈ [-90, 90]) is divided into a
//! `2^level × 2^level` grid of equally sized cells per magnification level.
//! Grid indexes pick one such level per object type and address cells with
//! [`TileId`] coordinates, row-major from the south-west corner.

use geo::{Coord, Rect, coord};

/// A magnification level of the cell grid.
///
/// Level `n` splits the world into `2^n` columns and `2^n` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MagnificationLevel(u32);

impl MagnificationLevel {
    /// Levels beyond this would overflow the cell coordinate space.
    pub const MAX: MagnificationLevel = MagnificationLevel(20);

    pub const fn new(level: u32) -> Self {
        assert!(level <= Self::MAX.0);
        Self(level)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Number of cells along one axis.
    pub const fn cell_count(self) -> u32 {
        1 << self.0
    }

    /// Width of a cell in degrees of longitude.
    pub fn cell_width(self) -> f64 {
        360.0 / f64::from(self.cell_count())
    }

    /// Height of a cell in degrees of latitude.
    pub fn cell_height(self) -> f64 {
        180.0 / f64::from(self.cell_count())
    }

    pub const fn next(self) -> Option<Self> {
        if self.0 < Self::MAX.0 {
            Some(Self(self.0 + 1))
        } else {
            None
        }
    }
}

impl std::fmt::Display for MagnificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell coordinates within a magnification level.
///
/// `x` grows eastward from longitude -180, `y` grows northward from
/// latitude -90. Ordering is row-major (y first), matching the order
/// cells are laid out in index bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId {
    pub x: u32,
    pub y: u32,
}

impl TileId {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// The cell containing the given coordinate at the given level.
    ///
    /// Coordinates outside the world bounds are clamped to the edge cells.
    pub fn from_coord(level: MagnificationLevel, coord: Coord<f64>) -> Self {
        let max = i64::from(level.cell_count()) - 1;
        let x = ((coord.x + 180.0) / level.cell_width()).floor();
        let y = ((coord.y + 90.0) / level.cell_height()).floor();
        #[expect(clippy::cast_possible_truncation)]
        #[expect(clippy::cast_sign_loss)]
        Self {
            x: (x as i64).clamp(0, max) as u32,
            y: (y as i64).clamp(0, max) as u32,
        }
    }

    /// The geographic extent of this cell.
    pub fn bounding_box(self, level: MagnificationLevel) -> Rect<f64> {
        let width = level.cell_width();
        let height = level.cell_height();
        let west = -180.0 + f64::from(self.x) * width;
        let south = -90.0 + f64::from(self.y) * height;
        Rect::new(
            coord! { x: west, y: south },
            coord! { x: west + width, y: south + height },
        )
    }
}

impl PartialOrd for TileId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TileId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.y, self.x).cmp(&(other.y, other.x))
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.x, self.y)
    }
}

/// An inclusive, axis-aligned rectangle of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileIdBox {
    min: TileId,
    max: TileId,
}

impl TileIdBox {
    /// Builds the box spanned by two corner cells (in any order).
    pub fn new(a: TileId, b: TileId) -> Self {
        Self {
            min: TileId::new(a.x.min(b.x), a.y.min(b.y)),
            max: TileId::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// The smallest box covering the given geographic rectangle.
    pub fn covering(level: MagnificationLevel, bbox: &Rect<f64>) -> Self {
        Self::new(
            TileId::from_coord(level, bbox.min()),
            TileId::from_coord(level, bbox.max()),
        )
    }

    pub const fn min(&self) -> TileId {
        self.min
    }

    pub const fn max(&self) -> TileId {
        self.max
    }

    pub const fn width(&self) -> u32 {
        self.max.x - self.min.x + 1
    }

    pub const fn height(&self) -> u32 {
        self.max.y - self.min.y + 1
    }

    pub const fn count(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub const fn contains(&self, tile: TileId) -> bool {
        tile.x >= self.min.x && tile.x <= self.max.x && tile.y >= self.min.y && tile.y <= self.max.y
    }

    /// Grows the box to include the given cell.
    pub fn include(&mut self, tile: TileId) {
        self.min = TileId::new(self.min.x.min(tile.x), self.min.y.min(tile.y));
        self.max = TileId::new(self.max.x.max(tile.x), self.max.y.max(tile.y));
    }

    /// Row-major index of a cell within this box.
    ///
    /// The cell must be contained in the box.
    pub const fn index_of(&self, tile: TileId) -> u64 {
        (tile.y - self.min.y) as u64 * self.width() as u64 + (tile.x - self.min.x) as u64
    }

    /// Iterates cells row-major, south-west to north-east.
    pub fn iter(&self) -> impl Iterator<Item = TileId> + use<> {
        let (min, max) = (self.min, self.max);
        (min.y..=max.y).flat_map(move |y| (min.x..=max.x).map(move |x| TileId::new(x, y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn level_two_grid_is_four_by_four() {
        let level = MagnificationLevel::new(2);
        assert_eq!(level.cell_count(), 4);
        assert_eq!(level.cell_width(), 90.0);
        assert_eq!(level.cell_height(), 45.0);
    }

    #[test]
    fn coord_to_cell_at_level_two() {
        let level = MagnificationLevel::new(2);
        assert_eq!(
            TileId::from_coord(level, coord! { x: -180.0, y: -90.0 }),
            TileId::new(0, 0)
        );
        assert_eq!(
            TileId::from_coord(level, coord! { x: 0.0, y: 0.0 }),
            TileId::new(2, 2)
        );
        // The east/north world edge is clamped into the last cell.
        assert_eq!(
            TileId::from_coord(level, coord! { x: 180.0, y: 90.0 }),
            TileId::new(3, 3)
        );
        assert_eq!(
            TileId::from_coord(level, coord! { x: 179.9, y: 89.9 }),
            TileId::new(3, 3)
        );
    }

    #[test]
    fn bounding_box_inverts_from_coord() {
        let level = MagnificationLevel::new(5);
        let tile = TileId::new(7, 19);
        let bbox = tile.bounding_box(level);
        assert_eq!(TileId::from_coord(level, bbox.center()), tile);
    }

    #[test]
    fn box_covering_spans_corner_cells() {
        let level = MagnificationLevel::new(2);
        let bbox = Rect::new(coord! { x: -10.0, y: -10.0 }, coord! { x: 10.0, y: 10.0 });
        let tile_box = TileIdBox::covering(level, &bbox);
        assert_eq!(tile_box.min(), TileId::new(1, 1));
        assert_eq!(tile_box.max(), TileId::new(2, 2));
        assert_eq!(tile_box.count(), 4);
        assert_eq!(tile_box.width(), 2);
        assert_eq!(tile_box.height(), 2);
    }

    #[test]
    fn row_major_iteration_and_indexing_agree() {
        let tile_box = TileIdBox::new(TileId::new(2, 5), TileId::new(4, 6));
        let cells: Vec<TileId> = tile_box.iter().collect();
        assert_eq!(cells.len() as u64, tile_box.count());
        assert_eq!(cells[0], TileId::new(2, 5));
        assert_eq!(cells[1], TileId::new(3, 5));
        assert_eq!(cells.last(), Some(&TileId::new(4, 6)));
        for (i, cell) in cells.iter().enumerate() {
            assert_eq!(tile_box.index_of(*cell), i as u64);
        }
    }

    #[test]
    fn include_grows_in_all_directions() {
        let mut tile_box = TileIdBox::new(TileId::new(3, 3), TileId::new(3, 3));
        tile_box.include(TileId::new(1, 5));
        tile_box.include(TileId::new(6, 2));
        assert_eq!(tile_box.min(), TileId::new(1, 2));
        assert_eq!(tile_box.max(), TileId::new(6, 5));
    }

    proptest! {
        #[test]
        fn from_coord_is_always_in_range(
            level in 0u32..=14,
            lon in -180.0f64..180.0,
            lat in -90.0f64..90.0,
        ) {
            let level = MagnificationLevel::new(level);
            let tile = TileId::from_coord(level, coord! { x: lon, y: lat });
            prop_assert!(tile.x < level.cell_count());
            prop_assert!(tile.y < level.cell_count());

            let bbox = tile.bounding_box(level);
            prop_assert!(bbox.min().x <= lon && lon <= bbox.max().x);
            prop_assert!(bbox.min().y <= lat && lat <= bbox.max().y);
        }
    }
}
