//! Grid index generation: level selection by cell fill rate, then bitmap
//! serialization.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::{info, warn};

use super::{AreaIndexError, GridObjectSource, TypeInfo};
use crate::io::{FileWriter, bytes_needed, varint_len};
use crate::progress::Progress;
use crate::tile::{MagnificationLevel, TileId, TileIdBox};
use crate::{FileOffset, TypeId};

/// Tuning for the level selection pass.
#[derive(Debug, Clone)]
pub struct GridIndexParameter {
    /// First candidate magnification level.
    pub min_level: MagnificationLevel,
    /// Last candidate level. Types that never satisfy the fill criteria
    /// are force-assigned here with a warning.
    pub max_level: MagnificationLevel,
    /// Cells above this count are "too full".
    pub too_high_value: u64,
    /// Cells above this count are "much too full".
    pub much_too_high_value: u64,
    /// Reject a level when at least this share of cells is much too full.
    pub much_too_high_cell_ratio: f64,
    /// Reject a level when at least this share of cells is too full.
    pub too_high_cell_ratio: f64,
    /// Warn (but accept) when at least this share of cells holds less
    /// than 40% of the average fill.
    pub too_low_cell_ratio: f64,
}

impl Default for GridIndexParameter {
    fn default() -> Self {
        Self {
            min_level: MagnificationLevel::new(10),
            max_level: MagnificationLevel::new(18),
            too_high_value: 96,
            much_too_high_value: 192,
            much_too_high_cell_ratio: 0.01,
            too_high_cell_ratio: 0.05,
            too_low_cell_ratio: 0.2,
        }
    }
}

/// Level assignment and coverage for one indexed type.
#[derive(Debug, Clone)]
pub struct TypeData {
    pub type_id: TypeId,
    pub level: MagnificationLevel,
    /// Cells covered by at least one object. `None` when the type has no
    /// objects at all (such types are left out of the index file).
    pub tile_box: Option<TileIdBox>,
    /// Number of non-empty cells.
    pub cells: u64,
    /// Total number of (object, cell) index entries.
    pub entries: u64,
    index_offset: FileOffset,
}

impl TypeData {
    pub const fn has_entries(&self) -> bool {
        self.entries > 0
    }
}

type CellCounts = BTreeMap<TileId, u64>;
type CellOffsets = BTreeMap<TileId, Vec<FileOffset>>;

/// Builds grid index files.
///
/// Generation scans the object source once per candidate level to measure
/// the fill distribution, then once more to collect object offsets for
/// the chosen levels while writing the file.
#[derive(Debug, Default)]
pub struct AreaIndexGenerator {
    parameter: GridIndexParameter,
}

impl AreaIndexGenerator {
    pub fn new(parameter: GridIndexParameter) -> Self {
        Self { parameter }
    }

    /// Generates the index file at `path` for the given types.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors from the source or the destination file, and
    /// when the source yields object offsets out of order.
    pub fn generate<S: GridObjectSource>(
        &self,
        source: &mut S,
        types: &[TypeInfo],
        path: &Path,
        progress: &mut dyn Progress,
    ) -> Result<Vec<TypeData>, AreaIndexError> {
        progress.set_action("Scanning level distribution of index types");
        let mut type_data = self.calculate_distribution(source, types, progress)?;

        progress.set_action("Writing grid index");
        let mut writer = FileWriter::create(path)?;

        let indexed: Vec<usize> = (0..types.len())
            .filter(|i| type_data[*i].has_entries())
            .collect();
        #[expect(clippy::cast_possible_truncation)]
        writer.write_u32_le(indexed.len() as u32)?;

        for &i in &indexed {
            let data = &mut type_data[i];
            writer.write_varint(u64::from(data.type_id))?;

            data.index_offset = writer.position();
            // Bitmap offset and offset byte width are backpatched once the
            // bitmap position is known.
            writer.write_offset(0)?;
            writer.write_u8(0)?;

            writer.write_varint(u64::from(data.level.get()))?;
            let tile_box = data
                .tile_box
                .as_ref()
                .unwrap_or_else(|| unreachable!("indexed types have entries"));
            writer.write_varint(u64::from(tile_box.min().x))?;
            writer.write_varint(u64::from(tile_box.max().x))?;
            writer.write_varint(u64::from(tile_box.min().y))?;
            writer.write_varint(u64::from(tile_box.max().y))?;
        }

        // One more scan to collect the object offsets per cell, for all
        // indexed types at once.
        let mut cell_offsets: BTreeMap<TypeId, CellOffsets> = indexed
            .iter()
            .map(|&i| (type_data[i].type_id, CellOffsets::new()))
            .collect();
        let level_of: BTreeMap<TypeId, MagnificationLevel> = indexed
            .iter()
            .map(|&i| (type_data[i].type_id, type_data[i].level))
            .collect();

        let mut unsorted: Option<(FileOffset, FileOffset)> = None;
        source.scan(&mut |offset, type_id, bbox| {
            let Some(cells) = cell_offsets.get_mut(&type_id) else {
                return;
            };
            let level = level_of[&type_id];
            for cell in TileIdBox::covering(level, bbox).iter() {
                let offsets = cells.entry(cell).or_default();
                if let Some(&last) = offsets.last()
                    && offset <= last
                    && unsorted.is_none()
                {
                    unsorted = Some((offset, last));
                }
                offsets.push(offset);
            }
        })?;
        if let Some((offset, last)) = unsorted {
            return Err(AreaIndexError::UnsortedObjects(offset, last));
        }

        for (n, &i) in indexed.iter().enumerate() {
            progress.set_progress(n as u64 + 1, indexed.len() as u64);
            let data = &type_data[i];
            Self::write_bitmap(&mut writer, &types[i], data, &cell_offsets[&data.type_id])?;
        }

        writer.finish()?;
        Ok(type_data)
    }

    /// Picks a magnification level per type.
    ///
    /// Starting at the minimum level, every type still unassigned gets its
    /// cell fill distribution measured; types whose distribution satisfies
    /// the fill criteria are fixed at the current level, the rest move on
    /// to the next (finer) level. At the maximum level all leftovers are
    /// force-assigned.
    fn calculate_distribution<S: GridObjectSource>(
        &self,
        source: &mut S,
        types: &[TypeInfo],
        progress: &mut dyn Progress,
    ) -> Result<Vec<TypeData>, AreaIndexError> {
        let mut remaining: BTreeSet<TypeId> = types.iter().map(|t| t.id).collect();
        let mut result: BTreeMap<TypeId, TypeData> = BTreeMap::new();
        let mut level = self.parameter.min_level;

        while !remaining.is_empty() {
            info!(level = %level, types = remaining.len(), "measuring cell fill");

            let mut fill: BTreeMap<TypeId, CellCounts> = remaining
                .iter()
                .map(|&type_id| (type_id, CellCounts::new()))
                .collect();

            source.scan(&mut |_, type_id, bbox| {
                let Some(cells) = fill.get_mut(&type_id) else {
                    return;
                };
                for cell in TileIdBox::covering(level, bbox).iter() {
                    *cells.entry(cell).or_default() += 1;
                }
            })?;

            let at_max_level = level == self.parameter.max_level;

            for type_info in types.iter() {
                if !remaining.contains(&type_info.id) {
                    continue;
                }
                let cells = &fill[&type_info.id];
                let fits = self.fits_index_criteria(type_info, cells);
                if !fits && !at_max_level {
                    continue;
                }
                if !fits {
                    warn!(
                        r#type = type_info.name,
                        level = %level,
                        "fill criteria never satisfied, forcing maximum level"
                    );
                }

                let mut tile_box: Option<TileIdBox> = None;
                for &cell in cells.keys() {
                    match &mut tile_box {
                        Some(b) => b.include(cell),
                        None => tile_box = Some(TileIdBox::new(cell, cell)),
                    }
                }

                remaining.remove(&type_info.id);
                result.insert(
                    type_info.id,
                    TypeData {
                        type_id: type_info.id,
                        level,
                        tile_box,
                        cells: cells.len() as u64,
                        entries: cells.values().sum(),
                        index_offset: 0,
                    },
                );
            }

            if remaining.is_empty() {
                break;
            }
            level = level
                .next()
                .unwrap_or_else(|| unreachable!("max level assigns all remaining types"));
        }

        progress.set_progress(types.len() as u64, types.len() as u64);
        Ok(types.iter().map(|t| result[&t.id].clone()).collect())
    }

    /// Whether the measured distribution is acceptable at this level.
    ///
    /// A type with no objects trivially fits.
    fn fits_index_criteria(&self, type_info: &TypeInfo, cell_counts: &CellCounts) -> bool {
        if cell_counts.is_empty() {
            return true;
        }

        let overall: u64 = cell_counts.values().sum();
        #[expect(clippy::cast_precision_loss)]
        let average = overall as f64 / cell_counts.len() as f64;
        #[expect(clippy::cast_possible_truncation)]
        #[expect(clippy::cast_sign_loss)]
        let too_low_value = (4.0 * average / 10.0) as u64;

        let mut too_low = 0u64;
        let mut too_high = 0u64;
        let mut much_too_high = 0u64;
        let mut ok = 0u64;
        let all = cell_counts.len() as u64;

        for &count in cell_counts.values() {
            if count < too_low_value {
                too_low += 1;
            } else if count > self.parameter.much_too_high_value {
                much_too_high += 1;
            } else if count > self.parameter.too_high_value {
                too_high += 1;
            } else {
                ok += 1;
            }
        }

        info!(
            r#type = type_info.name,
            too_low, ok, too_high, much_too_high, all, "cell fill distribution"
        );

        #[expect(clippy::cast_precision_loss)]
        let ratio = |count: u64| count as f64 / all as f64;

        if ratio(much_too_high) >= self.parameter.much_too_high_cell_ratio {
            warn!(
                r#type = type_info.name,
                "more than 1% of cells are much too full, using smaller cells"
            );
            return false;
        }
        if ratio(too_high) >= self.parameter.too_high_cell_ratio {
            warn!(
                r#type = type_info.name,
                "more than 5% of cells are too full, using smaller cells"
            );
            return false;
        }
        if ratio(too_low) >= self.parameter.too_low_cell_ratio {
            warn!(
                r#type = type_info.name,
                "more than 20% of cells hold less than 40% of the average fill"
            );
        }

        true
    }

    /// Writes the cell bitmap and per-cell offset lists for one type and
    /// backpatches the type's header entry.
    fn write_bitmap(
        writer: &mut FileWriter,
        type_info: &TypeInfo,
        type_data: &TypeData,
        cell_offsets: &CellOffsets,
    ) -> Result<(), AreaIndexError> {
        let tile_box = type_data
            .tile_box
            .as_ref()
            .unwrap_or_else(|| unreachable!("only types with entries are written"));

        // Size of the data section determines how wide the bitmap slots
        // must be: a slot has to address the last cell's data.
        let mut data_size: u64 = 0;
        for offsets in cell_offsets.values() {
            data_size += varint_len(offsets.len() as u64);
            let mut previous = 0;
            for &offset in offsets {
                data_size += varint_len(offset - previous);
                previous = offset;
            }
        }
        // +1 because stored cell offsets are biased by one to keep zero as
        // the empty sentinel.
        let data_offset_bytes = bytes_needed(data_size + 1);

        info!(
            r#type = type_info.name,
            level = %type_data.level,
            bytes = u64::from(data_offset_bytes) * tile_box.count() + data_size,
            entries_per_cell = type_data.entries / type_data.cells.max(1),
            "writing cell bitmap"
        );

        let bitmap_offset = writer.position();
        debug_assert!(type_data.index_offset != 0);
        writer.set_position(type_data.index_offset)?;
        writer.write_offset(bitmap_offset)?;
        writer.write_u8(data_offset_bytes)?;
        writer.set_position(bitmap_offset)?;

        // Prefill the bitmap with zero, the "no data" sentinel. Only cells
        // with objects are patched afterwards.
        for _ in 0..tile_box.count() {
            writer.write_offset_sized(0, data_offset_bytes)?;
        }

        let data_start = writer.position();

        for (cell, offsets) in cell_offsets {
            let bitmap_cell_offset =
                bitmap_offset + tile_box.index_of(*cell) * u64::from(data_offset_bytes);
            let cell_offset = writer.position();

            writer.set_position(bitmap_cell_offset)?;
            writer.write_offset_sized(cell_offset - data_start + 1, data_offset_bytes)?;
            writer.set_position(cell_offset)?;

            writer.write_varint(offsets.len() as u64)?;
            // Offsets arrive sorted from the forward scan, so the deltas
            // are small positive varints.
            let mut previous = 0;
            for &offset in offsets {
                writer.write_varint(offset - previous)?;
                previous = offset;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::progress::LogProgress;
    use geo::{Rect, coord};
    use tempfile::tempdir;

    /// In-memory object source for tests.
    pub(crate) struct VecSource(pub Vec<(FileOffset, TypeId, Rect<f64>)>);

    impl GridObjectSource for VecSource {
        fn scan(
            &mut self,
            visit: &mut dyn FnMut(FileOffset, TypeId, &Rect<f64>),
        ) -> Result<(), AreaIndexError> {
            for (offset, type_id, bbox) in &self.0 {
                visit(*offset, *type_id, bbox);
            }
            Ok(())
        }
    }

    fn tiny_box(x: f64, y: f64) -> Rect<f64> {
        Rect::new(coord! { x: x, y: y }, coord! { x: x + 1e-6, y: y + 1e-6 })
    }

    fn test_parameter() -> GridIndexParameter {
        GridIndexParameter {
            min_level: MagnificationLevel::new(2),
            max_level: MagnificationLevel::new(8),
            ..GridIndexParameter::default()
        }
    }

    #[test]
    fn empty_type_fits_at_minimum_level() {
        let generator = AreaIndexGenerator::new(test_parameter());
        let dir = tempdir().unwrap();
        let types = vec![TypeInfo::new(1, "building")];
        let mut source = VecSource(Vec::new());
        let mut progress = LogProgress::default();

        let data = generator
            .generate(
                &mut source,
                &types,
                &dir.path().join("index.dat"),
                &mut progress,
            )
            .unwrap();

        assert_eq!(data.len(), 1);
        assert_eq!(data[0].level, MagnificationLevel::new(2));
        assert!(!data[0].has_entries());
        assert!(data[0].tile_box.is_none());
    }

    #[test]
    fn clustered_type_escalates_to_finer_level() {
        let generator = AreaIndexGenerator::new(test_parameter());
        let dir = tempdir().unwrap();
        let types = vec![TypeInfo::new(1, "building")];
        let mut progress = LogProgress::default();

        // 200 objects along a 20 degree diagonal. At level 2 (90 degree
        // cells) they share one cell with count 200 > 192, which must be
        // rejected; a few levels down they spread into acceptably filled
        // cells well before the maximum level.
        let mut objects = Vec::new();
        for i in 0..200u64 {
            #[expect(clippy::cast_precision_loss)]
            let step = i as f64 * 0.1;
            objects.push((i * 10 + 1, 1, tiny_box(10.0 + step, 10.0 + step)));
        }
        let mut source = VecSource(objects);

        let data = generator
            .generate(
                &mut source,
                &types,
                &dir.path().join("index.dat"),
                &mut progress,
            )
            .unwrap();

        assert!(data[0].level > MagnificationLevel::new(2));
        assert!(data[0].level < MagnificationLevel::new(8));
        assert_eq!(data[0].entries, 200);
    }

    #[test]
    fn unsorted_source_is_rejected() {
        let generator = AreaIndexGenerator::new(test_parameter());
        let dir = tempdir().unwrap();
        let types = vec![TypeInfo::new(1, "building")];
        let mut progress = LogProgress::default();
        let mut source = VecSource(vec![
            (100, 1, tiny_box(1.0, 1.0)),
            (50, 1, tiny_box(1.0, 1.0)),
        ]);

        let result = generator.generate(
            &mut source,
            &types,
            &dir.path().join("index.dat"),
            &mut progress,
        );
        assert!(matches!(result, Err(AreaIndexError::UnsortedObjects(_, _))));
    }

    #[test]
    fn well_spread_type_stays_at_minimum_level() {
        let generator = AreaIndexGenerator::new(test_parameter());
        let dir = tempdir().unwrap();
        let types = vec![TypeInfo::new(7, "water")];
        let mut progress = LogProgress::default();

        // A handful of objects spread over distinct level 2 cells.
        let mut source = VecSource(vec![
            (10, 7, tiny_box(-170.0, -80.0)),
            (20, 7, tiny_box(-60.0, -30.0)),
            (30, 7, tiny_box(30.0, 20.0)),
            (40, 7, tiny_box(150.0, 70.0)),
        ]);

        let data = generator
            .generate(
                &mut source,
                &types,
                &dir.path().join("index.dat"),
                &mut progress,
            )
            .unwrap();

        assert_eq!(data[0].level, MagnificationLevel::new(2));
        assert_eq!(data[0].cells, 4);
    }
}
