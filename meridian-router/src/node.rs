//! Route node model and its on-disk file.
//!
//! A route node is a junction of the routable graph: a coordinate, the
//! objects (ways) meeting there, and one path per reachable neighbor
//! node with the data needed to cost the hop. Turn restrictions are
//! stored as excludes: "arriving via object A, you may not continue
//! into object B".

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use geo::{Coord, coord};
use lru::LruCache;
use tracing::debug;

use meridian_mapfile::{FileOffset, FileScanner, FileWriter, ObjectId};

use crate::RouterError;

/// Access and restriction bits of one path.
pub mod path_flags {
    pub const USABLE_BY_FOOT: u8 = 1 << 0;
    pub const USABLE_BY_BICYCLE: u8 = 1 << 1;
    pub const USABLE_BY_CAR: u8 = 1 << 2;
    /// The target way has restricted access (destination traffic only).
    pub const RESTRICTED: u8 = 1 << 3;
}

/// One object (way) meeting at a route node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectData {
    /// File offset of the way in the database's way file.
    pub object: FileOffset,
    /// Index into the database's object variant table, selecting the
    /// way type a speed table is keyed by.
    pub variant: u32,
}

/// An outgoing edge to a neighboring route node.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteNodePath {
    /// Id of the neighbor node, within the same database.
    pub target: ObjectId,
    /// Index into [`RouteNode::objects`] of the way this path follows.
    pub object_index: usize,
    /// Length of the hop. Stored with meter resolution.
    pub distance_km: f64,
    pub flags: u8,
}

impl RouteNodePath {
    pub const fn is_restricted(&self) -> bool {
        self.flags & path_flags::RESTRICTED != 0
    }
}

/// A turn restriction at a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnRestriction {
    /// Way the vehicle arrives on.
    pub source: FileOffset,
    /// Index into [`RouteNode::paths`] of the forbidden continuation.
    pub target_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteNode {
    pub id: ObjectId,
    pub coord: Coord<f64>,
    pub objects: Vec<ObjectData>,
    pub paths: Vec<RouteNodePath>,
    pub excludes: Vec<TurnRestriction>,
}

const COORD_SCALE: f64 = 1e7;

fn write_node(writer: &mut FileWriter, node: &RouteNode) -> std::io::Result<()> {
    writer.write_varint(node.id)?;
    #[expect(clippy::cast_possible_truncation)]
    writer.write_varint_signed((node.coord.y * COORD_SCALE).round() as i64)?;
    #[expect(clippy::cast_possible_truncation)]
    writer.write_varint_signed((node.coord.x * COORD_SCALE).round() as i64)?;

    writer.write_varint(node.objects.len() as u64)?;
    for object in &node.objects {
        writer.write_varint(object.object)?;
        writer.write_varint(u64::from(object.variant))?;
    }

    writer.write_varint(node.paths.len() as u64)?;
    for path in &node.paths {
        writer.write_varint(path.target)?;
        writer.write_varint(path.object_index as u64)?;
        #[expect(clippy::cast_possible_truncation)]
        #[expect(clippy::cast_sign_loss)]
        writer.write_varint((path.distance_km * 1000.0).round() as u64)?;
        writer.write_u8(path.flags)?;
    }

    writer.write_varint(node.excludes.len() as u64)?;
    for exclude in &node.excludes {
        writer.write_varint(exclude.source)?;
        writer.write_varint(exclude.target_index as u64)?;
    }
    Ok(())
}

#[expect(clippy::cast_precision_loss)]
fn read_node(scanner: &mut FileScanner) -> std::io::Result<RouteNode> {
    let id = scanner.read_varint()?;
    let lat = scanner.read_varint_signed()? as f64 / COORD_SCALE;
    let lon = scanner.read_varint_signed()? as f64 / COORD_SCALE;

    let object_count = scanner.read_varint()?;
    let mut objects = Vec::with_capacity(usize::try_from(object_count).unwrap_or(0));
    for _ in 0..object_count {
        let object = scanner.read_varint()?;
        #[expect(clippy::cast_possible_truncation)]
        let variant = scanner.read_varint()? as u32;
        objects.push(ObjectData { object, variant });
    }

    let path_count = scanner.read_varint()?;
    let mut paths = Vec::with_capacity(usize::try_from(path_count).unwrap_or(0));
    for _ in 0..path_count {
        let target = scanner.read_varint()?;
        #[expect(clippy::cast_possible_truncation)]
        let object_index = scanner.read_varint()? as usize;
        let distance_km = scanner.read_varint()? as f64 / 1000.0;
        let flags = scanner.read_u8()?;
        paths.push(RouteNodePath {
            target,
            object_index,
            distance_km,
            flags,
        });
    }

    let exclude_count = scanner.read_varint()?;
    let mut excludes = Vec::with_capacity(usize::try_from(exclude_count).unwrap_or(0));
    for _ in 0..exclude_count {
        let source = scanner.read_varint()?;
        #[expect(clippy::cast_possible_truncation)]
        let target_index = scanner.read_varint()? as usize;
        excludes.push(TurnRestriction {
            source,
            target_index,
        });
    }

    Ok(RouteNode {
        id,
        coord: coord! { x: lon, y: lat },
        objects,
        paths,
        excludes,
    })
}

/// Writes the route-node file for one database.
///
/// # Errors
///
/// Fails on I/O errors.
pub fn write_route_nodes(path: &Path, nodes: &[RouteNode]) -> Result<(), RouterError> {
    let mut writer = FileWriter::create(path)?;
    writer.write_varint(nodes.len() as u64)?;
    for node in nodes {
        write_node(&mut writer, node)?;
    }
    writer.finish()?;
    Ok(())
}

/// Read access to one database's route nodes.
///
/// Opening scans the file once to build an id-to-offset table; node
/// payloads are decoded on demand and kept in a bounded LRU cache. The
/// cache and the underlying scanner are individually locked, so a
/// shared instance serves concurrent lookups.
pub struct RouteNodeFile {
    scanner: Mutex<FileScanner>,
    offsets: HashMap<ObjectId, FileOffset>,
    cache: Mutex<LruCache<ObjectId, Arc<RouteNode>>>,
}

impl RouteNodeFile {
    /// # Errors
    ///
    /// Fails if the file cannot be read or is malformed.
    pub fn open(path: &Path, cached_nodes: NonZeroUsize) -> Result<Self, RouterError> {
        let mut scanner = FileScanner::open(path)?;
        let count = scanner.read_varint()?;

        let mut offsets = HashMap::with_capacity(usize::try_from(count).unwrap_or(0));
        for _ in 0..count {
            let position = scanner.position();
            let node = read_node(&mut scanner)?;
            offsets.insert(node.id, position);
        }
        debug!(nodes = offsets.len(), path = %path.display(), "route node file opened");

        Ok(Self {
            scanner: Mutex::new(scanner),
            offsets,
            cache: Mutex::new(LruCache::new(cached_nodes)),
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.offsets.contains_key(&id)
    }

    /// Ids of all stored nodes, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> {
        self.offsets.keys().copied()
    }

    /// Loads a node by id. `None` when the id is not stored.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a poisoned lock.
    pub fn get(&self, id: ObjectId) -> Result<Option<Arc<RouteNode>>, RouterError> {
        let Some(&offset) = self.offsets.get(&id) else {
            return Ok(None);
        };

        let mut cache = self
            .cache
            .lock()
            .map_err(|e| RouterError::PoisonedLock(e.to_string()))?;
        let node = cache
            .try_get_or_insert(id, || {
                let mut scanner = self
                    .scanner
                    .lock()
                    .map_err(|e| RouterError::PoisonedLock(e.to_string()))?;
                scanner.set_position(offset)?;
                Ok::<_, RouterError>(Arc::new(read_node(&mut scanner)?))
            })
            .cloned()?;
        Ok(Some(node))
    }

    /// Loads a node by file position, bypassing the id table.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a poisoned lock.
    pub fn get_by_offset(&self, offset: FileOffset) -> Result<RouteNode, RouterError> {
        let mut scanner = self
            .scanner
            .lock()
            .map_err(|e| RouterError::PoisonedLock(e.to_string()))?;
        scanner.set_position(offset)?;
        Ok(read_node(&mut scanner)?)
    }

    /// Batched lookup; ids not stored are simply absent from the result.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a poisoned lock.
    pub fn get_many<I: IntoIterator<Item = ObjectId>>(
        &self,
        ids: I,
    ) -> Result<HashMap<ObjectId, Arc<RouteNode>>, RouterError> {
        let mut result = HashMap::new();
        for id in ids {
            if let Some(node) = self.get(id)? {
                result.insert(id, node);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) fn sample_nodes() -> Vec<RouteNode> {
        vec![
            RouteNode {
                id: 100,
                coord: coord! { x: 13.405, y: 52.52 },
                objects: vec![
                    ObjectData {
                        object: 4096,
                        variant: 2,
                    },
                    ObjectData {
                        object: 8192,
                        variant: 0,
                    },
                ],
                paths: vec![
                    RouteNodePath {
                        target: 200,
                        object_index: 0,
                        distance_km: 1.5,
                        flags: path_flags::USABLE_BY_CAR | path_flags::USABLE_BY_BICYCLE,
                    },
                    RouteNodePath {
                        target: 300,
                        object_index: 1,
                        distance_km: 0.25,
                        flags: path_flags::USABLE_BY_FOOT | path_flags::RESTRICTED,
                    },
                ],
                excludes: vec![TurnRestriction {
                    source: 8192,
                    target_index: 0,
                }],
            },
            RouteNode {
                id: 200,
                coord: coord! { x: 13.42, y: 52.53 },
                objects: vec![ObjectData {
                    object: 4096,
                    variant: 2,
                }],
                paths: vec![RouteNodePath {
                    target: 100,
                    object_index: 0,
                    distance_km: 1.5,
                    flags: path_flags::USABLE_BY_CAR,
                }],
                excludes: Vec::new(),
            },
            RouteNode {
                id: 300,
                coord: coord! { x: -0.1276, y: 51.5072 },
                objects: Vec::new(),
                paths: Vec::new(),
                excludes: Vec::new(),
            },
        ]
    }

    #[test]
    fn nodes_round_trip_through_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routenodes.dat");
        let nodes = sample_nodes();
        write_route_nodes(&path, &nodes).unwrap();

        let file = RouteNodeFile::open(&path, NonZeroUsize::new(8).unwrap()).unwrap();
        assert_eq!(file.len(), 3);

        for expected in &nodes {
            let loaded = file.get(expected.id).unwrap().unwrap();
            assert_eq!(*loaded, *expected);
        }
        assert!(file.get(999).unwrap().is_none());
        assert!(file.contains(100));
        assert!(!file.contains(999));
    }

    #[test]
    fn repeated_lookups_hit_the_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routenodes.dat");
        write_route_nodes(&path, &sample_nodes()).unwrap();

        let file = RouteNodeFile::open(&path, NonZeroUsize::new(8).unwrap()).unwrap();
        let first = file.get(100).unwrap().unwrap();
        let second = file.get(100).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn batched_lookup_skips_missing_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routenodes.dat");
        write_route_nodes(&path, &sample_nodes()).unwrap();

        let file = RouteNodeFile::open(&path, NonZeroUsize::new(8).unwrap()).unwrap();
        let result = file.get_many([100, 999, 300]).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.contains_key(&100));
        assert!(result.contains_key(&300));
    }

    #[test]
    fn coordinates_keep_seven_decimals() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("routenodes.dat");
        let node = RouteNode {
            id: 1,
            coord: coord! { x: -179.9999999, y: 89.9999999 },
            objects: Vec::new(),
            paths: Vec::new(),
            excludes: Vec::new(),
        };
        write_route_nodes(&path, std::slice::from_ref(&node)).unwrap();

        let file = RouteNodeFile::open(&path, NonZeroUsize::new(1).unwrap()).unwrap();
        let loaded = file.get(1).unwrap().unwrap();
        assert!((loaded.coord.x - node.coord.x).abs() < 1e-7);
        assert!((loaded.coord.y - node.coord.y).abs() < 1e-7);
    }
}
