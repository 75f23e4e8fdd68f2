//! Building a region database from a JSON-lines raw extract.
//!
//! One record per line. Ways become the way file, the route-node graph
//! and the grid index; coastline and bounding-polygon records feed the
//! water index.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use geo::{Coord, Distance, Haversine, Point, Rect, coord};
use serde::Deserialize;
use tracing::{info, warn};

use meridian_mapfile::area_index::{
    AreaIndexError, AreaIndexGenerator, GridObjectSource, TypeInfo,
};
use meridian_mapfile::import::{
    CoordinateSource, ImportError, ImportParameter, ImportReport, Importer,
    find_duplicate_coordinates,
};
use meridian_mapfile::progress::LogProgress;
use meridian_mapfile::water::{Coast, CoastState, WaterIndexProcessor};
use meridian_mapfile::{FileOffset, ObjectId, TypeId};
use meridian_router::RouterError;
use meridian_router::node::{
    ObjectData, RouteNode, RouteNodePath, path_flags, write_route_nodes,
};
use meridian_router::service::{AREA_INDEX_FILE, ROUTE_NODES_FILE, WAYS_FILE};
use meridian_router::way::{RouteWay, write_ways};

pub const WATER_INDEX_FILE: &str = "waterindex.dat";

#[derive(Debug, Deserialize)]
pub struct RawNode {
    pub id: ObjectId,
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Deserialize)]
pub struct RawWay {
    pub type_id: TypeId,
    #[serde(default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Way-type variant index, the key into speed tables.
    #[serde(default)]
    pub variant: u32,
    /// Vehicles allowed on the way: "foot", "bicycle", "car".
    #[serde(default)]
    pub access: Vec<String>,
    pub nodes: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
pub struct RawCoastline {
    pub id: ObjectId,
    #[serde(default)]
    pub is_area: bool,
    pub nodes: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Way(RawWay),
    Coastline(RawCoastline),
    BoundingPolygon(RawCoastline),
}

/// A parsed raw extract.
#[derive(Debug, Default)]
pub struct RawExtract {
    pub ways: Vec<RawWay>,
    pub coastlines: Vec<RawCoastline>,
    pub bounding_polygons: Vec<RawCoastline>,
}

impl RawExtract {
    /// Reads a JSON-lines extract. Blank lines are skipped.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors and on unparseable records, naming the line.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open extract at {}", path.display()))?;

        let mut extract = RawExtract::default();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line)
                .with_context(|| format!("Invalid record on line {}", number + 1))?;
            match record {
                Record::Way(way) => extract.ways.push(way),
                Record::Coastline(coastline) => extract.coastlines.push(coastline),
                Record::BoundingPolygon(polygon) => extract.bounding_polygons.push(polygon),
            }
        }
        info!(
            ways = extract.ways.len(),
            coastlines = extract.coastlines.len(),
            bounding_polygons = extract.bounding_polygons.len(),
            "extract parsed"
        );
        Ok(extract)
    }
}

fn access_flags(access: &[String]) -> u8 {
    let mut flags = 0;
    for entry in access {
        flags |= match entry.as_str() {
            "foot" => path_flags::USABLE_BY_FOOT,
            "bicycle" => path_flags::USABLE_BY_BICYCLE,
            "car" => path_flags::USABLE_BY_CAR,
            other => {
                warn!(access = other, "ignoring unknown access entry");
                0
            }
        };
    }
    flags
}

fn distance_km(a: Coord<f64>, b: Coord<f64>) -> f64 {
    Haversine.distance(Point::from(a), Point::from(b)) / 1000.0
}

/// Nodes that become route nodes: every node used by more than one way
/// and every way endpoint.
fn junction_ids(ways: &[RawWay]) -> HashSet<ObjectId> {
    let mut usage: HashMap<ObjectId, u32> = HashMap::new();
    for way in ways {
        let last = way.nodes.len().saturating_sub(1);
        for (index, node) in way.nodes.iter().enumerate() {
            // Endpoints count double so dead ends stay routable.
            let weight = if index == 0 || index == last { 2 } else { 1 };
            *usage.entry(node.id).or_insert(0) += weight;
        }
    }
    usage
        .into_iter()
        .filter(|(_, count)| *count >= 2)
        .map(|(id, _)| id)
        .collect()
}

fn object_index(node: &mut RouteNode, object: FileOffset, variant: u32) -> usize {
    if let Some(index) = node.objects.iter().position(|o| o.object == object) {
        return index;
    }
    node.objects.push(ObjectData { object, variant });
    node.objects.len() - 1
}

/// Builds the route-node graph from the ways and their file offsets.
///
/// Consecutive junctions along a way are linked in both directions; the
/// path distance accumulates the intermediate geometry.
pub fn build_route_nodes(ways: &[RawWay], offsets: &[FileOffset]) -> Vec<RouteNode> {
    debug_assert_eq!(ways.len(), offsets.len());
    let junctions = junction_ids(ways);

    let mut nodes: BTreeMap<ObjectId, RouteNode> = BTreeMap::new();
    for (way, offset) in ways.iter().zip(offsets) {
        let flags = access_flags(&way.access);
        let mut previous: Option<(usize, ObjectId)> = None;

        for (index, raw) in way.nodes.iter().enumerate() {
            if !junctions.contains(&raw.id) {
                continue;
            }
            let here = coord! { x: raw.lon, y: raw.lat };
            nodes.entry(raw.id).or_insert_with(|| RouteNode {
                id: raw.id,
                coord: here,
                objects: Vec::new(),
                paths: Vec::new(),
                excludes: Vec::new(),
            });

            if let Some((previous_index, previous_id)) = previous {
                let hop: f64 = way.nodes[previous_index..=index]
                    .windows(2)
                    .map(|pair| {
                        distance_km(
                            coord! { x: pair[0].lon, y: pair[0].lat },
                            coord! { x: pair[1].lon, y: pair[1].lat },
                        )
                    })
                    .sum();

                if let Some(node) = nodes.get_mut(&previous_id) {
                    let object = object_index(node, *offset, way.variant);
                    node.paths.push(RouteNodePath {
                        target: raw.id,
                        object_index: object,
                        distance_km: hop,
                        flags,
                    });
                }
                if let Some(node) = nodes.get_mut(&raw.id) {
                    let object = object_index(node, *offset, way.variant);
                    node.paths.push(RouteNodePath {
                        target: previous_id,
                        object_index: object,
                        distance_km: hop,
                        flags,
                    });
                }
            } else if let Some(node) = nodes.get_mut(&raw.id) {
                object_index(node, *offset, way.variant);
            }
            previous = Some((index, raw.id));
        }
    }

    nodes.into_values().collect()
}

fn to_route_way(raw: &RawWay) -> RouteWay {
    RouteWay {
        type_id: raw.type_id,
        name: raw.name.clone(),
        flags: access_flags(&raw.access),
        node_ids: raw.nodes.iter().map(|n| n.id).collect(),
        points: raw
            .nodes
            .iter()
            .map(|n| coord! { x: n.lon, y: n.lat })
            .collect(),
    }
}

fn to_coast(raw: &RawCoastline, left: CoastState, right: CoastState) -> Coast {
    Coast {
        id: raw.id,
        is_area: raw.is_area,
        front_node_id: raw.nodes.first().map_or(0, |n| n.id),
        back_node_id: raw.nodes.last().map_or(0, |n| n.id),
        points: raw
            .nodes
            .iter()
            .map(|n| coord! { x: n.lon, y: n.lat })
            .collect(),
        left,
        right,
    }
}

fn extract_bbox(extract: &RawExtract) -> Option<Rect<f64>> {
    let mut bbox: Option<(Coord<f64>, Coord<f64>)> = None;
    let mut include = |node: &RawNode| {
        let (min, max) = bbox.get_or_insert((
            coord! { x: node.lon, y: node.lat },
            coord! { x: node.lon, y: node.lat },
        ));
        min.x = min.x.min(node.lon);
        min.y = min.y.min(node.lat);
        max.x = max.x.max(node.lon);
        max.y = max.y.max(node.lat);
    };
    for way in &extract.ways {
        way.nodes.iter().for_each(&mut include);
    }
    for coastline in extract.coastlines.iter().chain(&extract.bounding_polygons) {
        coastline.nodes.iter().for_each(&mut include);
    }
    bbox.map(|(min, max)| Rect::new(min, max))
}

fn step_error(error: RouterError) -> ImportError {
    match error {
        RouterError::Io(e) => ImportError::Io(e),
        RouterError::AreaIndex(e) => ImportError::AreaIndex(e),
        other => ImportError::Io(std::io::Error::other(other)),
    }
}

struct ExtractCoordinates<'a> {
    extract: &'a RawExtract,
}

impl CoordinateSource for ExtractCoordinates<'_> {
    fn scan(&mut self, visit: &mut dyn FnMut(ObjectId, Coord<f64>)) -> Result<(), ImportError> {
        for way in &self.extract.ways {
            for node in &way.nodes {
                visit(node.id, coord! { x: node.lon, y: node.lat });
            }
        }
        for coastline in self
            .extract
            .coastlines
            .iter()
            .chain(&self.extract.bounding_polygons)
        {
            for node in &coastline.nodes {
                visit(node.id, coord! { x: node.lon, y: node.lat });
            }
        }
        Ok(())
    }
}

struct WaySource {
    entries: Vec<(FileOffset, TypeId, Rect<f64>)>,
}

impl GridObjectSource for WaySource {
    fn scan(
        &mut self,
        visit: &mut dyn FnMut(FileOffset, TypeId, &Rect<f64>),
    ) -> Result<(), AreaIndexError> {
        for (offset, type_id, bbox) in &self.entries {
            visit(*offset, *type_id, bbox);
        }
        Ok(())
    }
}

/// Runs the full import: ways, route nodes, grid index, water index.
///
/// # Errors
///
/// Fails on the first failing step; earlier outputs stay on disk.
pub fn build_database(
    extract: &RawExtract,
    parameter: ImportParameter,
) -> anyhow::Result<ImportReport> {
    let bbox = extract_bbox(extract).context("extract contains no coordinates")?;
    let route_ways: Vec<RouteWay> = extract.ways.iter().map(to_route_way).collect();
    let offsets: Rc<RefCell<Vec<FileOffset>>> = Rc::new(RefCell::new(Vec::new()));

    let mut types: BTreeMap<TypeId, String> = BTreeMap::new();
    for way in &extract.ways {
        types.entry(way.type_id).or_insert_with(|| {
            way.type_name
                .clone()
                .unwrap_or_else(|| format!("type-{}", way.type_id))
        });
    }
    let type_infos: Vec<TypeInfo> = types
        .into_iter()
        .map(|(id, name)| TypeInfo::new(id, name))
        .collect();

    let mut importer = Importer::new(parameter);

    // Diagnostic pass: extract node ids are already unique, so the
    // serials are reported but never fed back into node identity.
    importer.add_step("Deduplicate raw coordinates", |parameter, progress| {
        let mut source = ExtractCoordinates { extract };
        let manager = find_duplicate_coordinates(&mut source, parameter, progress)?;
        info!(
            duplicate_positions = manager.len(),
            "coordinate deduplication done"
        );
        Ok(())
    });

    {
        let offsets = Rc::clone(&offsets);
        let route_ways = &route_ways;
        importer.add_step("Write ways", move |parameter, _progress| {
            let path = parameter.destination_directory.join(WAYS_FILE);
            *offsets.borrow_mut() = write_ways(&path, route_ways).map_err(step_error)?;
            Ok(())
        });
    }

    {
        let offsets = Rc::clone(&offsets);
        let route_ways = &route_ways;
        importer.add_step("Build area index", move |parameter, progress| {
            let entries = offsets
                .borrow()
                .iter()
                .zip(route_ways)
                .filter_map(|(offset, way)| {
                    way.bounding_box().map(|bbox| (*offset, way.type_id, bbox))
                })
                .collect();
            let mut source = WaySource { entries };
            AreaIndexGenerator::new(parameter.grid_index.clone())
                .generate(
                    &mut source,
                    &type_infos,
                    &parameter.destination_directory.join(AREA_INDEX_FILE),
                    progress,
                )
                .map(|_| ())
                .map_err(ImportError::from)
        });
    }

    {
        let offsets = Rc::clone(&offsets);
        importer.add_step("Write route nodes", move |parameter, _progress| {
            let nodes = build_route_nodes(&extract.ways, &offsets.borrow());
            info!(nodes = nodes.len(), "route-node graph built");
            write_route_nodes(
                &parameter.destination_directory.join(ROUTE_NODES_FILE),
                &nodes,
            )
            .map_err(step_error)
        });
    }

    importer.add_step("Build water index", move |parameter, progress| {
        let coastlines: Vec<Coast> = extract
            .coastlines
            .iter()
            .map(|c| to_coast(c, CoastState::Land, CoastState::Water))
            .collect();
        let bounding: Vec<Coast> = extract
            .bounding_polygons
            .iter()
            .map(|c| to_coast(c, CoastState::Unknown, CoastState::Unknown))
            .collect();
        WaterIndexProcessor::new(parameter.water_index.clone())
            .process(
                &parameter.destination_directory.join(WATER_INDEX_FILE),
                coastlines,
                &bounding,
                &bbox,
                progress,
            )
            .map_err(ImportError::from)
    });

    let report = importer.run(&mut LogProgress::default(), None)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_router::way::WayFile;
    use std::num::NonZeroUsize;
    use tempfile::tempdir;

    fn raw_node(id: ObjectId, lon: f64, lat: f64) -> RawNode {
        RawNode { id, lon, lat }
    }

    fn two_crossing_ways() -> Vec<RawWay> {
        vec![
            RawWay {
                type_id: 1,
                type_name: Some("highway.residential".to_owned()),
                name: Some("A Street".to_owned()),
                variant: 0,
                access: vec!["car".to_owned()],
                nodes: vec![
                    raw_node(1, 13.0, 52.0),
                    raw_node(2, 13.001, 52.0),
                    raw_node(3, 13.002, 52.0),
                ],
            },
            RawWay {
                type_id: 1,
                type_name: None,
                name: Some("B Street".to_owned()),
                variant: 0,
                access: vec!["car".to_owned()],
                nodes: vec![raw_node(2, 13.001, 52.0), raw_node(4, 13.001, 52.001)],
            },
        ]
    }

    #[test]
    fn endpoints_and_shared_nodes_are_junctions() {
        let junctions = junction_ids(&two_crossing_ways());
        assert_eq!(
            junctions,
            HashSet::from([1, 2, 3, 4]),
            "node 2 is shared, the rest are endpoints"
        );
    }

    #[test]
    fn interior_nodes_stay_out_of_the_graph() {
        let ways = vec![RawWay {
            type_id: 1,
            type_name: None,
            name: None,
            variant: 0,
            access: vec!["car".to_owned()],
            nodes: vec![
                raw_node(1, 13.0, 52.0),
                raw_node(2, 13.001, 52.0),
                raw_node(3, 13.002, 52.0),
            ],
        }];
        let nodes = build_route_nodes(&ways, &[8]);
        let ids: Vec<ObjectId> = nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 3]);

        // The single hop spans the dropped interior node.
        let expected = distance_km(coord! { x: 13.0, y: 52.0 }, coord! { x: 13.001, y: 52.0 })
            + distance_km(coord! { x: 13.001, y: 52.0 }, coord! { x: 13.002, y: 52.0 });
        assert!((nodes[0].paths[0].distance_km - expected).abs() < 1e-12);
        assert_eq!(nodes[0].paths[0].target, 3);
        assert_eq!(nodes[1].paths[0].target, 1);
    }

    #[test]
    fn crossing_ways_meet_in_one_node() {
        let ways = two_crossing_ways();
        let nodes = build_route_nodes(&ways, &[8, 99]);
        let crossing = nodes.iter().find(|n| n.id == 2).expect("node 2 expected");
        assert_eq!(crossing.objects.len(), 2);
        let mut targets: Vec<ObjectId> = crossing.paths.iter().map(|p| p.target).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec![1, 3, 4]);
    }

    #[test]
    fn records_parse_from_json_lines() {
        let line = r#"{"kind":"way","type_id":3,"name":"X","access":["car","foot"],"nodes":[{"id":1,"lon":13.0,"lat":52.0}]}"#;
        let record: Record = serde_json::from_str(line).unwrap();
        let Record::Way(way) = record else {
            panic!("expected a way record");
        };
        assert_eq!(way.type_id, 3);
        assert_eq!(
            access_flags(&way.access),
            path_flags::USABLE_BY_CAR | path_flags::USABLE_BY_FOOT
        );
    }

    #[test]
    fn import_produces_all_database_files() {
        let dir = tempdir().unwrap();
        let extract = RawExtract {
            ways: two_crossing_ways(),
            coastlines: Vec::new(),
            bounding_polygons: Vec::new(),
        };
        let parameter = ImportParameter {
            destination_directory: dir.path().to_path_buf(),
            ..ImportParameter::default()
        };

        let report = build_database(&extract, parameter).unwrap();
        assert_eq!(report.steps.len(), 5);
        for file in [WAYS_FILE, ROUTE_NODES_FILE, AREA_INDEX_FILE, WATER_INDEX_FILE] {
            assert!(dir.path().join(file).exists(), "{file} expected");
        }

        let ways = WayFile::open(&dir.path().join(WAYS_FILE), NonZeroUsize::new(4).unwrap())
            .unwrap();
        // The first way starts right after the count header.
        let first = ways.get(1).unwrap();
        assert_eq!(first.name.as_deref(), Some("A Street"));
    }
}
