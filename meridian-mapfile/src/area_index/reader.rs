//! Query side of the grid index.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use geo::Rect;

use super::AreaIndexError;
use crate::io::FileScanner;
use crate::tile::{MagnificationLevel, TileId, TileIdBox};
use crate::{FileOffset, TypeId};

#[derive(Debug)]
struct TypeEntry {
    bitmap_offset: FileOffset,
    data_offset_bytes: u8,
    level: MagnificationLevel,
    tile_box: TileIdBox,
}

/// Reads grid index files produced by the generator.
///
/// Lookups touch only the bitmap cells intersecting the query box, plus
/// the offset lists of non-empty cells.
pub struct AreaIndexReader {
    scanner: FileScanner,
    types: HashMap<TypeId, TypeEntry>,
}

impl AreaIndexReader {
    /// Opens and parses the index header.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or the header is malformed.
    pub fn open(path: &Path) -> Result<Self, AreaIndexError> {
        let mut scanner = FileScanner::open(path)?;
        let count = scanner.read_u32_le()?;

        let mut types = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            #[expect(clippy::cast_possible_truncation)]
            let type_id = scanner.read_varint()? as TypeId;
            let bitmap_offset = scanner.read_offset()?;
            let data_offset_bytes = scanner.read_u8()?;
            #[expect(clippy::cast_possible_truncation)]
            let level = MagnificationLevel::new(scanner.read_varint()? as u32);
            #[expect(clippy::cast_possible_truncation)]
            let min_x = scanner.read_varint()? as u32;
            #[expect(clippy::cast_possible_truncation)]
            let max_x = scanner.read_varint()? as u32;
            #[expect(clippy::cast_possible_truncation)]
            let min_y = scanner.read_varint()? as u32;
            #[expect(clippy::cast_possible_truncation)]
            let max_y = scanner.read_varint()? as u32;

            types.insert(
                type_id,
                TypeEntry {
                    bitmap_offset,
                    data_offset_bytes,
                    level,
                    tile_box: TileIdBox::new(TileId::new(min_x, min_y), TileId::new(max_x, max_y)),
                },
            );
        }

        Ok(Self { scanner, types })
    }

    /// Types present in the index.
    pub fn type_ids(&self) -> impl Iterator<Item = TypeId> {
        self.types.keys().copied()
    }

    /// Returns the offsets of all objects of the given types whose index
    /// cells intersect `bbox`, sorted and deduplicated.
    ///
    /// The result is a superset of the objects actually intersecting the
    /// box: cell granularity decides, so callers filter by exact geometry
    /// after loading.
    ///
    /// # Errors
    ///
    /// Fails if the file is truncated or corrupt.
    pub fn offsets(
        &mut self,
        bbox: &Rect<f64>,
        types: &[TypeId],
    ) -> Result<Vec<FileOffset>, AreaIndexError> {
        let mut found: BTreeSet<FileOffset> = BTreeSet::new();

        for type_id in types {
            let Some(entry) = self.types.get(type_id) else {
                continue;
            };

            let query_box = TileIdBox::covering(entry.level, bbox);
            let min_x = query_box.min().x.max(entry.tile_box.min().x);
            let max_x = query_box.max().x.min(entry.tile_box.max().x);
            let min_y = query_box.min().y.max(entry.tile_box.min().y);
            let max_y = query_box.max().y.min(entry.tile_box.max().y);
            if min_x > max_x || min_y > max_y {
                continue;
            }

            let data_start = entry.bitmap_offset
                + entry.tile_box.count() * u64::from(entry.data_offset_bytes);

            for cell in TileIdBox::new(TileId::new(min_x, min_y), TileId::new(max_x, max_y)).iter()
            {
                let slot = entry.bitmap_offset
                    + entry.tile_box.index_of(cell) * u64::from(entry.data_offset_bytes);
                self.scanner.set_position(slot)?;
                let cell_offset = self.scanner.read_offset_sized(entry.data_offset_bytes)?;
                if cell_offset == 0 {
                    // Zero is the "no objects in this cell" sentinel.
                    continue;
                }

                self.scanner.set_position(data_start + cell_offset - 1)?;
                let count = self.scanner.read_varint()?;
                let mut offset: FileOffset = 0;
                for _ in 0..count {
                    offset += self.scanner.read_varint()?;
                    found.insert(offset);
                }
            }
        }

        Ok(found.into_iter().collect())
    }
}
