//! Way data consumed by the router.
//!
//! Ways carry the geometry and access flags the search itself never
//! touches: they are needed to attach a coordinate to the graph
//! (closest-routable-node projection) and to name the roads in a route
//! description.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use geo::{Coord, Rect, coord};
use lru::LruCache;

use meridian_mapfile::{FileOffset, FileScanner, FileWriter, ObjectId, TypeId};

use crate::RouterError;

/// A routable way: an ordered node chain sharing ids with the route
/// node graph.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteWay {
    pub type_id: TypeId,
    pub name: Option<String>,
    /// Access bits, same layout as [`crate::node::path_flags`].
    pub flags: u8,
    pub node_ids: Vec<ObjectId>,
    pub points: Vec<Coord<f64>>,
}

impl RouteWay {
    /// Axis-aligned bounding box of the way geometry.
    ///
    /// `None` for a degenerate way without points.
    pub fn bounding_box(&self) -> Option<Rect<f64>> {
        let first = *self.points.first()?;
        let mut min = first;
        let mut max = first;
        for p in &self.points[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        Some(Rect::new(min, max))
    }
}

const COORD_SCALE: f64 = 1e7;

fn write_way(writer: &mut FileWriter, way: &RouteWay) -> std::io::Result<()> {
    debug_assert_eq!(way.node_ids.len(), way.points.len());

    writer.write_varint(u64::from(way.type_id))?;
    writer.write_u8(way.flags)?;
    match &way.name {
        Some(name) => {
            writer.write_varint(name.len() as u64)?;
            for byte in name.as_bytes() {
                writer.write_u8(*byte)?;
            }
        }
        None => writer.write_varint(0)?,
    }

    writer.write_varint(way.node_ids.len() as u64)?;
    for (id, point) in way.node_ids.iter().zip(&way.points) {
        writer.write_varint(*id)?;
        #[expect(clippy::cast_possible_truncation)]
        writer.write_varint_signed((point.y * COORD_SCALE).round() as i64)?;
        #[expect(clippy::cast_possible_truncation)]
        writer.write_varint_signed((point.x * COORD_SCALE).round() as i64)?;
    }
    Ok(())
}

#[expect(clippy::cast_precision_loss)]
fn read_way(scanner: &mut FileScanner) -> std::io::Result<RouteWay> {
    #[expect(clippy::cast_possible_truncation)]
    let type_id = scanner.read_varint()? as TypeId;
    let flags = scanner.read_u8()?;

    let name_len = scanner.read_varint()?;
    let name = if name_len == 0 {
        None
    } else {
        let mut bytes = Vec::with_capacity(usize::try_from(name_len).unwrap_or(0));
        for _ in 0..name_len {
            bytes.push(scanner.read_u8()?);
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    };

    let node_count = scanner.read_varint()?;
    let mut node_ids = Vec::with_capacity(usize::try_from(node_count).unwrap_or(0));
    let mut points = Vec::with_capacity(usize::try_from(node_count).unwrap_or(0));
    for _ in 0..node_count {
        node_ids.push(scanner.read_varint()?);
        let lat = scanner.read_varint_signed()? as f64 / COORD_SCALE;
        let lon = scanner.read_varint_signed()? as f64 / COORD_SCALE;
        points.push(coord! { x: lon, y: lat });
    }

    Ok(RouteWay {
        type_id,
        name,
        flags,
        node_ids,
        points,
    })
}

/// Writes the way file for one database.
///
/// Returns the file offset of every way, in input order; those offsets
/// are the object references the route-node file and the grid index
/// store.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_ways(path: &Path, ways: &[RouteWay]) -> Result<Vec<FileOffset>, RouterError> {
    let mut writer = FileWriter::create(path)?;
    writer.write_varint(ways.len() as u64)?;

    let mut offsets = Vec::with_capacity(ways.len());
    for way in ways {
        offsets.push(writer.position());
        write_way(&mut writer, way)?;
    }
    writer.finish()?;
    Ok(offsets)
}

/// Offset-addressed read access to one database's ways.
pub struct WayFile {
    scanner: Mutex<FileScanner>,
    cache: Mutex<LruCache<FileOffset, Arc<RouteWay>>>,
}

impl WayFile {
    /// # Errors
    ///
    /// Fails if the file cannot be read.
    pub fn open(path: &Path, cached_ways: NonZeroUsize) -> Result<Self, RouterError> {
        Ok(Self {
            scanner: Mutex::new(FileScanner::open(path)?),
            cache: Mutex::new(LruCache::new(cached_ways)),
        })
    }

    /// Loads the way stored at `offset`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, a bad offset, or a poisoned lock.
    pub fn get(&self, offset: FileOffset) -> Result<Arc<RouteWay>, RouterError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|e| RouterError::PoisonedLock(e.to_string()))?;
        let way = cache
            .try_get_or_insert(offset, || {
                let mut scanner = self
                    .scanner
                    .lock()
                    .map_err(|e| RouterError::PoisonedLock(e.to_string()))?;
                scanner.set_position(offset)?;
                Ok::<_, RouterError>(Arc::new(read_way(&mut scanner)?))
            })
            .cloned()?;
        Ok(way)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::path_flags;
    use tempfile::tempdir;

    fn sample_ways() -> Vec<RouteWay> {
        vec![
            RouteWay {
                type_id: 3,
                name: Some("Unter den Linden".to_owned()),
                flags: path_flags::USABLE_BY_CAR | path_flags::USABLE_BY_FOOT,
                node_ids: vec![100, 200, 300],
                points: vec![
                    coord! { x: 13.39, y: 52.517 },
                    coord! { x: 13.395, y: 52.5172 },
                    coord! { x: 13.40, y: 52.5175 },
                ],
            },
            RouteWay {
                type_id: 7,
                name: None,
                flags: path_flags::USABLE_BY_FOOT,
                node_ids: vec![300, 400],
                points: vec![coord! { x: 13.40, y: 52.5175 }, coord! { x: 13.41, y: 52.52 }],
            },
        ]
    }

    #[test]
    fn ways_round_trip_by_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ways.dat");
        let ways = sample_ways();
        let offsets = write_ways(&path, &ways).unwrap();
        assert_eq!(offsets.len(), 2);

        let file = WayFile::open(&path, NonZeroUsize::new(4).unwrap()).unwrap();
        for (offset, expected) in offsets.iter().zip(&ways) {
            let loaded = file.get(*offset).unwrap();
            assert_eq!(loaded.type_id, expected.type_id);
            assert_eq!(loaded.name, expected.name);
            assert_eq!(loaded.flags, expected.flags);
            assert_eq!(loaded.node_ids, expected.node_ids);
            for (a, b) in loaded.points.iter().zip(&expected.points) {
                assert!((a.x - b.x).abs() < 1e-7);
                assert!((a.y - b.y).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn bounding_box_spans_all_points() {
        let way = &sample_ways()[0];
        let bbox = way.bounding_box().unwrap();
        assert!((bbox.min().x - 13.39).abs() < 1e-9);
        assert!((bbox.max().x - 13.40).abs() < 1e-9);
        assert!((bbox.min().y - 52.517).abs() < 1e-9);
        assert!((bbox.max().y - 52.5175).abs() < 1e-9);
    }
}
