//! Water index serialization.
//!
//! ```text
//! varint  first level
//! varint  last level
//! per level:
//!   u8      has cell data
//!   u8      offset byte width used in the bitmap (backpatched)
//!   u8      default cell state
//!   u64     bitmap offset (backpatched)
//!   varint  x start, x end, y start, y end of the covered cell box
//! per level with cell data, later in the file:
//!   bitmap  one slot per cell, row-major; values 0..=3 are plain
//!           states, larger values are offsets into the tile data
//!   u32     zero padding, so real tile offsets start at 4
//!   data    per coast cell: varint tile count, then per tile a type
//!           byte, a varint vertex count, and u16 x/y pairs with the
//!           coast flag in bit 15 of x
//! ```

use std::path::Path;

use tracing::info;

use super::{CellGroundTiles, GroundCoord, GroundTile, Level, State, WaterIndexError};
use crate::io::{FileScanner, FileWriter, bytes_needed, varint_len};
use crate::{FileOffset, tile::MagnificationLevel};

const COAST_FLAG: u16 = 1 << 15;

fn write_index_header(writer: &mut FileWriter, levels: &mut [Level]) -> std::io::Result<()> {
    if let (Some(first), Some(last)) = (levels.first(), levels.last()) {
        writer.write_varint(u64::from(first.level))?;
        writer.write_varint(u64::from(last.level))?;
    }

    for level in levels {
        level.index_entry_offset = writer.position();
        writer.write_u8(u8::from(level.has_cell_data))?;
        writer.write_u8(level.data_offset_bytes)?;
        writer.write_u8(u8::from(level.default_cell_data))?;
        writer.write_offset(level.index_data_offset)?;
        writer.write_varint(u64::from(level.state_map.x_start()))?;
        writer.write_varint(u64::from(level.state_map.x_end()))?;
        writer.write_varint(u64::from(level.state_map.y_start()))?;
        writer.write_varint(u64::from(level.state_map.y_end()))?;
    }

    Ok(())
}

fn write_tiles(
    writer: &mut FileWriter,
    cell_ground_tiles: &CellGroundTiles,
    level: &mut Level,
) -> std::io::Result<()> {
    if level.has_cell_data {
        // The data section starts with 4 bytes of padding so that cell
        // offsets into it never collide with the plain states 0..=3.
        let mut data_size: u64 = 4;
        for tiles in cell_ground_tiles.values() {
            data_size += varint_len(tiles.len() as u64);
            for tile in tiles {
                data_size += 1;
                data_size += varint_len(tile.coords.len() as u64);
                data_size += tile.coords.len() as u64 * 4;
            }
        }

        level.data_offset_bytes = bytes_needed(data_size);

        info!(
            level = level.level,
            cells = level.state_map.cell_count(),
            entries = cell_ground_tiles.len(),
            bytes_per_entry = level.data_offset_bytes,
            "writing water index level"
        );

        level.index_data_offset = writer.position();

        for y in 0..level.state_map.y_count() {
            for x in 0..level.state_map.x_count() {
                let state = level.state_map.get_state(x, y);
                writer.write_offset_sized(u64::from(u8::from(state)), level.data_offset_bytes)?;
            }
        }

        let data_offset = writer.position();
        writer.write_offset_sized(0, 4)?;

        for (cell, tiles) in cell_ground_tiles {
            let start = writer.position();

            writer.write_varint(tiles.len() as u64)?;
            for tile in tiles {
                writer.write_u8(u8::from(tile.tile_type))?;
                writer.write_varint(tile.coords.len() as u64)?;
                for coord in &tile.coords {
                    let x = if coord.coast { coord.x | COAST_FLAG } else { coord.x };
                    writer.write_u16_le(x)?;
                    writer.write_u16_le(coord.y)?;
                }
            }

            let end = writer.position();
            let slot = u64::from(cell.y) * u64::from(level.state_map.x_count()) + u64::from(cell.x);

            writer.set_position(level.index_data_offset + slot * u64::from(level.data_offset_bytes))?;
            writer.write_offset_sized(start - data_offset, level.data_offset_bytes)?;
            writer.set_position(end)?;
        }
    } else {
        info!(
            level = level.level,
            state = ?level.default_cell_data,
            "uniform water index level, no cell data needed"
        );
    }

    let current = writer.position();
    writer.set_position(level.index_entry_offset)?;
    writer.write_u8(u8::from(level.has_cell_data))?;
    writer.write_u8(level.data_offset_bytes)?;
    writer.write_u8(u8::from(level.default_cell_data))?;
    writer.write_offset(level.index_data_offset)?;
    writer.set_position(current)?;

    Ok(())
}

/// Writes the complete index: header first, then the bitmap and tile
/// data of each level, backpatching the header entries.
///
/// # Errors
///
/// Fails when the file cannot be created or written.
pub fn write_water_index(
    path: &Path,
    levels: &mut [Level],
    tiles_per_level: &[CellGroundTiles],
) -> Result<(), WaterIndexError> {
    debug_assert_eq!(levels.len(), tiles_per_level.len());

    let mut writer = FileWriter::create(path)?;
    write_index_header(&mut writer, levels)?;

    for (level, tiles) in levels.iter_mut().zip(tiles_per_level) {
        write_tiles(&mut writer, tiles, level)?;
    }

    writer.finish()?;
    Ok(())
}

/// What a level stores for one cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellContent {
    /// The whole cell has a single state.
    Uniform(State),
    /// A coast cell with ground tile polygons.
    Tiles(Vec<GroundTile>),
}

#[derive(Debug)]
struct LevelEntry {
    has_cell_data: bool,
    data_offset_bytes: u8,
    default_cell_data: State,
    index_data_offset: FileOffset,
    x_start: u32,
    x_end: u32,
    y_start: u32,
    y_end: u32,
}

impl LevelEntry {
    fn x_count(&self) -> u32 {
        self.x_end - self.x_start + 1
    }

    fn y_count(&self) -> u32 {
        self.y_end - self.y_start + 1
    }
}

/// Reads water index files produced by [`write_water_index`].
pub struct WaterIndexReader {
    scanner: FileScanner,
    min_level: u32,
    max_level: u32,
    levels: Vec<LevelEntry>,
}

impl WaterIndexReader {
    /// Opens the index and parses all level headers.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or is malformed.
    pub fn open(path: &Path) -> Result<Self, WaterIndexError> {
        let mut scanner = FileScanner::open(path)?;

        #[expect(clippy::cast_possible_truncation)]
        let min_level = scanner.read_varint()? as u32;
        #[expect(clippy::cast_possible_truncation)]
        let max_level = scanner.read_varint()? as u32;

        let mut levels = Vec::with_capacity((max_level - min_level + 1) as usize);
        for _ in min_level..=max_level {
            let has_cell_data = scanner.read_u8()? != 0;
            let data_offset_bytes = scanner.read_u8()?;
            let default_cell_data =
                State::try_from(scanner.read_u8()?).unwrap_or(State::Unknown);
            let index_data_offset = scanner.read_offset()?;
            #[expect(clippy::cast_possible_truncation)]
            let x_start = scanner.read_varint()? as u32;
            #[expect(clippy::cast_possible_truncation)]
            let x_end = scanner.read_varint()? as u32;
            #[expect(clippy::cast_possible_truncation)]
            let y_start = scanner.read_varint()? as u32;
            #[expect(clippy::cast_possible_truncation)]
            let y_end = scanner.read_varint()? as u32;

            levels.push(LevelEntry {
                has_cell_data,
                data_offset_bytes,
                default_cell_data,
                index_data_offset,
                x_start,
                x_end,
                y_start,
                y_end,
            });
        }

        Ok(Self {
            scanner,
            min_level,
            max_level,
            levels,
        })
    }

    pub fn min_level(&self) -> u32 {
        self.min_level
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// The content of the absolute world grid cell `(x, y)` at `level`.
    ///
    /// Cells outside the covered box and levels without cell data yield
    /// the level's default state.
    ///
    /// # Errors
    ///
    /// Fails when the level is out of range or the file is corrupt.
    pub fn cell(&mut self, level: u32, x: u32, y: u32) -> Result<CellContent, WaterIndexError> {
        if !(self.min_level..=self.max_level).contains(&level) {
            return Err(WaterIndexError::LevelOutOfRange {
                min: self.min_level,
                max: self.max_level,
                requested: level,
            });
        }
        let entry = &self.levels[(level - self.min_level) as usize];

        if !entry.has_cell_data
            || !(entry.x_start..=entry.x_end).contains(&x)
            || !(entry.y_start..=entry.y_end).contains(&y)
        {
            return Ok(CellContent::Uniform(entry.default_cell_data));
        }

        let slot = u64::from(y - entry.y_start) * u64::from(entry.x_count())
            + u64::from(x - entry.x_start);
        self.scanner
            .set_position(entry.index_data_offset + slot * u64::from(entry.data_offset_bytes))?;
        let value = self.scanner.read_offset_sized(entry.data_offset_bytes)?;

        if value < 4 {
            #[expect(clippy::cast_possible_truncation)]
            let state = State::try_from(value as u8).unwrap_or(State::Unknown);
            return Ok(CellContent::Uniform(state));
        }

        let data_offset = entry.index_data_offset
            + u64::from(entry.x_count()) * u64::from(entry.y_count())
                * u64::from(entry.data_offset_bytes);
        self.scanner.set_position(data_offset + value)?;

        let tile_count = self.scanner.read_varint()?;
        let mut tiles = Vec::with_capacity(usize::try_from(tile_count).unwrap_or(0));
        for _ in 0..tile_count {
            let tile_type = State::try_from(self.scanner.read_u8()?).unwrap_or(State::Unknown);
            let coord_count = self.scanner.read_varint()?;

            let mut tile = GroundTile::new(tile_type);
            tile.coords.reserve(usize::try_from(coord_count).unwrap_or(0));
            for _ in 0..coord_count {
                let raw_x = self.scanner.read_u16_le()?;
                let y = self.scanner.read_u16_le()?;
                tile.coords.push(GroundCoord::new(
                    raw_x & !COAST_FLAG,
                    y,
                    raw_x & COAST_FLAG != 0,
                ));
            }
            tiles.push(tile);
        }

        Ok(CellContent::Tiles(tiles))
    }

    /// Like [`WaterIndexReader::cell`] for a geographic point, assuming
    /// the level's cells follow the world-grid magnification layout.
    ///
    /// # Errors
    ///
    /// Fails when the level is out of range or the file is corrupt.
    pub fn cell_at(
        &mut self,
        level: u32,
        lon: f64,
        lat: f64,
    ) -> Result<CellContent, WaterIndexError> {
        let magnification = MagnificationLevel::new(level);
        #[expect(clippy::cast_possible_truncation)]
        #[expect(clippy::cast_sign_loss)]
        let (x, y) = (
            ((lon + 180.0) / magnification.cell_width()).floor() as u32,
            ((lat + 90.0) / magnification.cell_height()).floor() as u32,
        );
        self.cell(level, x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::super::processor::tests::classified_level;
    use super::super::{StateMap, WaterIndexParameter, WaterIndexProcessor};
    use super::*;
    use crate::progress::LogProgress;
    use crate::tile::TileId;
    use geo::{Rect, coord};
    use tempfile::tempdir;

    #[test]
    fn classified_level_round_trips() {
        let (mut level, tiles) = classified_level(State::Land);
        let x0 = level.state_map.x_start();
        let y0 = level.state_map.y_start();
        let expected_default = level.state_map.get_state(0, 0);

        let dir = tempdir().unwrap();
        let path = dir.path().join("water.idx");
        write_water_index(&path, std::slice::from_mut(&mut level), &[tiles.clone()]).unwrap();

        let mut reader = WaterIndexReader::open(&path).unwrap();
        assert_eq!(reader.min_level(), 0);
        assert_eq!(reader.max_level(), 0);

        // Uniform cells come back as their states.
        assert_eq!(
            reader.cell(0, x0 + 2, y0 + 1).unwrap(),
            CellContent::Uniform(State::Water)
        );
        assert_eq!(
            reader.cell(0, x0 + 2, y0 + 3).unwrap(),
            CellContent::Uniform(State::Land)
        );

        // The coast cell crossed by the coastline yields its polygons.
        let CellContent::Tiles(read_tiles) = reader.cell(0, x0 + 2, y0 + 2).unwrap() else {
            panic!("expected ground tiles for the coast cell");
        };
        let written = tiles.get(&TileId::new(2, 2)).unwrap();
        assert_eq!(read_tiles.len(), written.len());
        for (read, original) in read_tiles.iter().zip(written) {
            assert_eq!(read.tile_type, original.tile_type);
            assert_eq!(read.coords, original.coords);
        }

        // Outside the covered box the default applies.
        assert_eq!(
            reader.cell(0, x0 + 100, y0).unwrap(),
            CellContent::Uniform(expected_default)
        );

        assert!(matches!(
            reader.cell(7, x0, y0),
            Err(WaterIndexError::LevelOutOfRange { requested: 7, .. })
        ));
    }

    #[test]
    fn uniform_level_needs_no_cell_data() {
        let bbox = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 5.0, y: 5.0 });
        let processor = WaterIndexProcessor::new(WaterIndexParameter::default());
        let mut level = super::super::Level::new(3, StateMap::new(&bbox, 1.0, 1.0));
        let tiles =
            processor.process_level(&mut level, &[], &[], &mut LogProgress::default());

        assert!(tiles.is_empty());
        assert!(!level.has_cell_data);
        assert_eq!(level.default_cell_data, State::Land);

        let dir = tempdir().unwrap();
        let path = dir.path().join("water.idx");
        write_water_index(&path, std::slice::from_mut(&mut level), &[tiles]).unwrap();

        let mut reader = WaterIndexReader::open(&path).unwrap();
        assert_eq!(
            reader.cell(3, 180, 90).unwrap(),
            CellContent::Uniform(State::Land)
        );
    }

    #[test]
    fn regeneration_is_byte_identical() {
        let write_once = || {
            let (mut level, tiles) = classified_level(State::Land);
            let dir = tempdir().unwrap();
            let path = dir.path().join("water.idx");
            write_water_index(&path, std::slice::from_mut(&mut level), &[tiles]).unwrap();
            std::fs::read(&path).unwrap()
        };

        assert_eq!(write_once(), write_once());
    }
}
