//! Route calculation across one or more region databases.
//!
//! The search itself is a plain A* over the [`RouteGraph`] trait; the
//! [`MultiDatabaseRouter`] implements that trait on top of the on-disk
//! files and adds coordinate resolution and description building on
//! top.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use geo::{Coord, Destination, Distance, Haversine, Point, Rect, coord};
use tracing::{debug, info};

use meridian_mapfile::area_index::AreaIndexReader;
use meridian_mapfile::progress::Breaker;
use meridian_mapfile::{FileOffset, ObjectId};

use crate::description::{
    Description, RouteData, RouteDataEntry, RouteDescription, RouteDescriptionNode,
};
use crate::node::{RouteNode, RouteNodeFile};
use crate::profile::RoutingProfile;
use crate::way::WayFile;
use crate::{DBId, DatabaseId, RouterError};

/// Standard file names inside a region database directory.
pub const ROUTE_NODES_FILE: &str = "routenodes.dat";
pub const WAYS_FILE: &str = "ways.dat";
pub const AREA_INDEX_FILE: &str = "areaindex.dat";

const DEFAULT_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(4096).unwrap();

/// A position on a way, produced by coordinate resolution and consumed
/// as a route start or target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePosition {
    pub database: DatabaseId,
    /// File offset of the way in its database's way file.
    pub way: FileOffset,
    /// Index of the closest way node.
    pub node_index: usize,
}

/// Per-call routing options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingParameter<'a> {
    pub breaker: Option<&'a Breaker>,
}

/// Outcome of a route calculation.
///
/// An unroutable request is not an error: the graph was searched and no
/// admissible route exists (or the search was aborted).
#[derive(Debug, Clone, Default)]
pub struct RoutingResult {
    route: Option<RouteData>,
}

impl RoutingResult {
    pub fn from_route(route: RouteData) -> Self {
        Self { route: Some(route) }
    }

    pub fn unroutable() -> Self {
        Self { route: None }
    }

    pub fn is_success(&self) -> bool {
        self.route.is_some()
    }

    pub fn route(&self) -> Option<&RouteData> {
        self.route.as_ref()
    }

    pub fn into_route(self) -> Option<RouteData> {
        self.route
    }
}

/// Node access the route calculation runs against.
pub trait RouteGraph {
    /// Loads a route node, or `None` if the id is not in the graph.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    fn node(&self, id: DBId) -> Result<Option<Arc<RouteNode>>, RouterError>;

    /// Same node in other databases. Crossing to a twin costs nothing.
    fn node_twins(&self, id: DBId) -> Vec<DBId> {
        let _ = id;
        Vec::new()
    }
}

fn distance_km(a: Coord<f64>, b: Coord<f64>) -> f64 {
    Haversine.distance(Point::from(a), Point::from(b)) / 1000.0
}

#[derive(Debug, Clone, Copy)]
struct OpenNode {
    current_cost: f64,
    overall_cost: f64,
    prev: Option<DBId>,
    /// Way used to arrive. `None` at the start and after a transfer.
    object: Option<FileOffset>,
    /// Insertion counter; a heap entry is stale unless it matches.
    sequence: u64,
}

struct HeapEntry {
    overall_cost: f64,
    sequence: u64,
    id: DBId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: reverse so the cheapest entry is popped
    // first, and among equal costs the earliest-inserted one. The
    // sequence tie-break makes equal-cost searches reproducible.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .overall_cost
            .total_cmp(&self.overall_cost)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Whether a turn restriction at `node` forbids continuing into the
/// path at `path_index` after arriving via `incoming`.
fn is_excluded(node: &RouteNode, incoming: Option<FileOffset>, path_index: usize) -> bool {
    let Some(incoming) = incoming else {
        return false;
    };
    let candidate = node.objects[node.paths[path_index].object_index].object;
    node.excludes.iter().any(|exclude| {
        exclude.source == incoming
            && node
                .paths
                .get(exclude.target_index)
                .is_some_and(|path| node.objects[path.object_index].object == candidate)
    })
}

/// Calculates the minimum-cost route from `start` to `target`.
///
/// Nodes present in several databases are crossed at no cost, so a
/// route may span database boundaries. Routes whose estimated total
/// cost exceeds the profile's cost limit are abandoned.
///
/// # Errors
///
/// Fails on storage errors and on references to nodes the graph does
/// not contain. "No route exists" is not an error, see
/// [`RoutingResult`].
pub fn calculate_route<G, P>(
    graph: &G,
    profile: &P,
    start: DBId,
    target: DBId,
    parameter: &RoutingParameter<'_>,
) -> Result<RoutingResult, RouterError>
where
    G: RouteGraph + ?Sized,
    P: RoutingProfile + ?Sized,
{
    let start_node = graph.node(start)?.ok_or(RouterError::MissingNode(start))?;
    let target_node = graph.node(target)?.ok_or(RouterError::MissingNode(target))?;
    let target_coord = target_node.coord;

    let direct_km = distance_km(start_node.coord, target_coord);
    let cost_limit = profile.cost_limit(direct_km);
    debug!(%start, %target, direct_km, cost_limit, "starting route calculation");

    let mut open: HashMap<DBId, OpenNode> = HashMap::new();
    let mut closed: HashMap<DBId, (Option<DBId>, Option<FileOffset>)> = HashMap::new();
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    let mut sequence: u64 = 0;

    let start_estimate = profile.estimate_costs(direct_km);
    open.insert(
        start,
        OpenNode {
            current_cost: 0.0,
            overall_cost: start_estimate,
            prev: None,
            object: None,
            sequence,
        },
    );
    heap.push(HeapEntry {
        overall_cost: start_estimate,
        sequence,
        id: start,
    });

    while let Some(entry) = heap.pop() {
        if let Some(breaker) = parameter.breaker
            && breaker.is_aborted()
        {
            info!("route calculation aborted");
            return Ok(RoutingResult::unroutable());
        }

        let Some(&current) = open.get(&entry.id) else {
            continue;
        };
        if current.sequence != entry.sequence {
            // A cheaper entry for this node superseded the popped one.
            continue;
        }
        open.remove(&entry.id);
        closed.insert(entry.id, (current.prev, current.object));

        if entry.id == target {
            let mut entries = Vec::new();
            let mut cursor = Some(entry.id);
            while let Some(id) = cursor {
                let &(prev, object) = closed
                    .get(&id)
                    .ok_or(RouterError::MissingNode(id))?;
                entries.push(RouteDataEntry {
                    node: id,
                    object,
                    target_node_index: None,
                });
                cursor = prev;
            }
            entries.reverse();
            let mut route = RouteData::default();
            for e in entries {
                route.push(e);
            }
            debug!(
                cost = profile.cost_string(current.current_cost),
                nodes = route.entries().len(),
                "route found"
            );
            return Ok(RoutingResult::from_route(route));
        }

        let node = graph
            .node(entry.id)?
            .ok_or(RouterError::MissingNode(entry.id))?;

        for path_index in 0..node.paths.len() {
            let path = &node.paths[path_index];
            let candidate = DBId::new(entry.id.database, path.target);

            if Some(candidate) == current.prev {
                continue;
            }
            if closed.contains_key(&candidate) {
                continue;
            }
            if !profile.can_use(&node, path_index) {
                continue;
            }
            if is_excluded(&node, current.object, path_index) {
                continue;
            }

            let current_cost = current.current_cost + profile.edge_costs(&node, path_index);
            if let Some(existing) = open.get(&candidate)
                && existing.current_cost <= current_cost
            {
                continue;
            }

            let candidate_node = graph
                .node(candidate)?
                .ok_or(RouterError::MissingNode(candidate))?;
            let estimate = profile.estimate_costs(distance_km(candidate_node.coord, target_coord));
            let overall_cost = current_cost + estimate;
            if overall_cost > cost_limit {
                continue;
            }

            sequence += 1;
            open.insert(
                candidate,
                OpenNode {
                    current_cost,
                    overall_cost,
                    prev: Some(entry.id),
                    object: Some(node.objects[path.object_index].object),
                    sequence,
                },
            );
            heap.push(HeapEntry {
                overall_cost,
                sequence,
                id: candidate,
            });
        }

        // Stepping over to a twin costs nothing; the search continues in
        // the other database from the same position.
        for twin in graph.node_twins(entry.id) {
            if closed.contains_key(&twin) {
                continue;
            }
            if let Some(existing) = open.get(&twin)
                && existing.current_cost <= current.current_cost
            {
                continue;
            }
            sequence += 1;
            open.insert(
                twin,
                OpenNode {
                    current_cost: current.current_cost,
                    overall_cost: current.overall_cost,
                    prev: Some(entry.id),
                    object: None,
                    sequence,
                },
            );
            heap.push(HeapEntry {
                overall_cost: current.overall_cost,
                sequence,
                id: twin,
            });
        }
    }

    debug!(%start, %target, "no route found");
    Ok(RoutingResult::unroutable())
}

/// The open files of one imported region.
pub struct RegionDatabase {
    id: DatabaseId,
    route_nodes: RouteNodeFile,
    ways: WayFile,
    area_index: Mutex<AreaIndexReader>,
}

impl RegionDatabase {
    /// Opens the routing files inside `directory`.
    ///
    /// # Errors
    ///
    /// Fails if any of the files is missing or unreadable.
    pub fn open(id: DatabaseId, directory: &Path) -> Result<Self, RouterError> {
        info!(database = %id, directory = %directory.display(), "opening region database");
        Ok(Self {
            id,
            route_nodes: RouteNodeFile::open(&directory.join(ROUTE_NODES_FILE), DEFAULT_CACHE_SIZE)?,
            ways: WayFile::open(&directory.join(WAYS_FILE), DEFAULT_CACHE_SIZE)?,
            area_index: Mutex::new(AreaIndexReader::open(&directory.join(AREA_INDEX_FILE))?),
        })
    }

    pub fn id(&self) -> DatabaseId {
        self.id
    }
}

/// Projects `p` onto the segment `a`..`b` in coordinate space.
///
/// Returns the normalized position along the segment and the projected
/// point.
fn project_to_segment(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> (f64, Coord<f64>) {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len2 = dx * dx + dy * dy;
    if len2 <= f64::EPSILON {
        return (0.0, a);
    }
    let r = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    (r, coord! { x: a.x + r * dx, y: a.y + r * dy })
}

/// Routing over a set of independently imported region databases.
///
/// Twins are detected once at construction: every node id stored in
/// more than one database becomes a zero-cost transfer point.
pub struct MultiDatabaseRouter {
    databases: Vec<RegionDatabase>,
    twins: HashMap<ObjectId, Vec<DatabaseId>>,
}

impl MultiDatabaseRouter {
    pub fn new(databases: Vec<RegionDatabase>) -> Self {
        let mut by_id: HashMap<ObjectId, Vec<DatabaseId>> = HashMap::new();
        for database in &databases {
            for id in database.route_nodes.ids() {
                by_id.entry(id).or_default().push(database.id);
            }
        }
        by_id.retain(|_, dbs| dbs.len() > 1);
        info!(
            databases = databases.len(),
            twins = by_id.len(),
            "router ready"
        );
        Self {
            databases,
            twins: by_id,
        }
    }

    /// Opens one database per directory, numbering them in order.
    ///
    /// # Errors
    ///
    /// Fails if any database fails to open.
    pub fn open<P: AsRef<Path>>(directories: &[P]) -> Result<Self, RouterError> {
        let mut databases = Vec::with_capacity(directories.len());
        for (index, directory) in directories.iter().enumerate() {
            #[expect(clippy::cast_possible_truncation)]
            let id = DatabaseId(index as u32);
            databases.push(RegionDatabase::open(id, directory.as_ref())?);
        }
        Ok(Self::new(databases))
    }

    fn database(&self, id: DatabaseId) -> Result<&RegionDatabase, RouterError> {
        self.databases
            .iter()
            .find(|db| db.id == id)
            .ok_or(RouterError::UnknownDatabase(id))
    }

    /// Finds the routable way position closest to `position` within
    /// `radius_m` meters, searching all databases.
    ///
    /// The grid index narrows the candidate set; candidates are then
    /// filtered by vehicle access and by actually connecting to the
    /// route graph, and the closest segment projection wins.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn closest_routable_node<P>(
        &self,
        position: Coord<f64>,
        profile: &P,
        radius_m: f64,
    ) -> Result<Option<RoutePosition>, RouterError>
    where
        P: RoutingProfile + ?Sized,
    {
        let point = Point::from(position);
        let north = Haversine.destination(point, 0.0, radius_m);
        let east = Haversine.destination(point, 90.0, radius_m);
        let south = Haversine.destination(point, 180.0, radius_m);
        let west = Haversine.destination(point, 270.0, radius_m);
        let bbox = Rect::new(
            coord! { x: west.x(), y: south.y() },
            coord! { x: east.x(), y: north.y() },
        );

        let access_bit = profile.vehicle().access_bit();
        let mut best_distance = radius_m;
        let mut best: Option<RoutePosition> = None;

        for database in &self.databases {
            let offsets = {
                let mut index = database
                    .area_index
                    .lock()
                    .map_err(|e| RouterError::PoisonedLock(e.to_string()))?;
                let types: Vec<_> = index.type_ids().collect();
                index.offsets(&bbox, &types)?
            };

            for offset in offsets {
                let way = database.ways.get(offset)?;
                if way.flags & access_bit == 0 {
                    continue;
                }
                if !way
                    .node_ids
                    .iter()
                    .any(|id| database.route_nodes.contains(*id))
                {
                    continue;
                }

                for (index, segment) in way.points.windows(2).enumerate() {
                    let (r, projected) = project_to_segment(position, segment[0], segment[1]);
                    let meters = Haversine.distance(point, Point::from(projected));
                    if meters < best_distance {
                        best_distance = meters;
                        best = Some(RoutePosition {
                            database: database.id,
                            way: offset,
                            node_index: if r < 0.5 { index } else { index + 1 },
                        });
                    }
                }
            }
        }

        Ok(best)
    }

    /// Maps a way position to the nearest way node that is part of the
    /// route graph, searching outward from the projected node.
    ///
    /// # Errors
    ///
    /// Fails if the way connects to no route node at all.
    pub fn resolve_routable_node(&self, position: &RoutePosition) -> Result<DBId, RouterError> {
        let database = self.database(position.database)?;
        let way = database.ways.get(position.way)?;
        let ids = &way.node_ids;

        for step in 0..ids.len() {
            let forward = position.node_index + step;
            if forward < ids.len() && database.route_nodes.contains(ids[forward]) {
                return Ok(DBId::new(database.id, ids[forward]));
            }
            if step > 0
                && step <= position.node_index
                && database.route_nodes.contains(ids[position.node_index - step])
            {
                return Ok(DBId::new(database.id, ids[position.node_index - step]));
            }
        }
        Err(RouterError::NoRoutableNode(crate::DBFileOffset::new(
            position.database,
            position.way,
        )))
    }

    /// Calculates a route between two resolved way positions.
    ///
    /// # Errors
    ///
    /// Fails on storage errors; an unreachable target is reported
    /// through the result, not as an error.
    pub fn calculate_route<P>(
        &self,
        profile: &P,
        start: &RoutePosition,
        target: &RoutePosition,
        parameter: &RoutingParameter<'_>,
    ) -> Result<RoutingResult, RouterError>
    where
        P: RoutingProfile + ?Sized,
    {
        let start_node = self.resolve_routable_node(start)?;
        let target_node = self.resolve_routable_node(target)?;
        let mut result = calculate_route(self, profile, start_node, target_node, parameter)?;
        if let Some(route) = result.route.as_mut() {
            self.resolve_route_indices(route)?;
        }
        Ok(result)
    }

    /// Fills each entry's position within its arrival way; the search
    /// itself never touches way data.
    fn resolve_route_indices(&self, route: &mut RouteData) -> Result<(), RouterError> {
        for entry in route.entries_mut() {
            let Some(offset) = entry.object else {
                continue;
            };
            let way = self.database(entry.node.database)?.ways.get(offset)?;
            entry.target_node_index = way.node_ids.iter().position(|id| *id == entry.node.id);
        }
        Ok(())
    }

    /// Calculates one route through all the given coordinates, in
    /// order. Sections are routed independently and joined without
    /// duplicating the junction nodes.
    ///
    /// # Errors
    ///
    /// Fails on storage errors. Returns an unroutable result when any
    /// coordinate resolves to no routable position or any section is
    /// unroutable.
    pub fn calculate_route_via<P>(
        &self,
        profile: &P,
        coordinates: &[Coord<f64>],
        radius_m: f64,
        parameter: &RoutingParameter<'_>,
    ) -> Result<RoutingResult, RouterError>
    where
        P: RoutingProfile + ?Sized,
    {
        let mut positions = Vec::with_capacity(coordinates.len());
        for coordinate in coordinates {
            match self.closest_routable_node(*coordinate, profile, radius_m)? {
                Some(position) => positions.push(position),
                None => {
                    debug!(
                        x = coordinate.x,
                        y = coordinate.y,
                        "no routable position near via point"
                    );
                    return Ok(RoutingResult::unroutable());
                }
            }
        }

        let mut route = RouteData::default();
        for pair in positions.windows(2) {
            let section = self.calculate_route(profile, &pair[0], &pair[1], parameter)?;
            let Some(section) = section.into_route() else {
                return Ok(RoutingResult::unroutable());
            };
            route.append(section);
        }
        Ok(RoutingResult::from_route(route))
    }

    /// Expands a calculated route into a description with node
    /// coordinates and way names, ready for postprocessing.
    ///
    /// # Errors
    ///
    /// Fails if a route entry references data no database contains.
    pub fn route_description(&self, route: &RouteData) -> Result<RouteDescription, RouterError> {
        // One batched node fetch per database.
        let mut ids_by_database: HashMap<DatabaseId, Vec<ObjectId>> = HashMap::new();
        for entry in route.entries() {
            ids_by_database
                .entry(entry.node.database)
                .or_default()
                .push(entry.node.id);
        }
        let mut nodes_by_database = HashMap::new();
        for (database_id, ids) in ids_by_database {
            let database = self.database(database_id)?;
            nodes_by_database.insert(database_id, database.route_nodes.get_many(ids)?);
        }

        let mut description = RouteDescription::default();
        for entry in route.entries() {
            let node = nodes_by_database
                .get(&entry.node.database)
                .and_then(|nodes| nodes.get(&entry.node.id))
                .ok_or(RouterError::MissingNode(entry.node))?;

            let mut description_node =
                RouteDescriptionNode::new(entry.node, node.coord, entry.object);
            if let Some(offset) = entry.object {
                let way = self.database(entry.node.database)?.ways.get(offset)?;
                description_node.add_description(Description::Name {
                    name: way.name.clone(),
                });
            }
            description.nodes.push(description_node);
        }
        Ok(description)
    }

    /// The route as a single unnamed way, for export or display.
    ///
    /// # Errors
    ///
    /// Fails if a route entry references a node no database contains.
    pub fn route_way(&self, route: &RouteData) -> Result<crate::way::RouteWay, RouterError> {
        let points = self.route_points(route)?;
        Ok(crate::way::RouteWay {
            type_id: 0,
            name: None,
            flags: 0,
            node_ids: route.entries().iter().map(|e| e.node.id).collect(),
            points,
        })
    }

    /// The route geometry as a plain coordinate sequence.
    ///
    /// # Errors
    ///
    /// Fails if a route entry references a node no database contains.
    pub fn route_points(&self, route: &RouteData) -> Result<Vec<Coord<f64>>, RouterError> {
        route
            .entries()
            .iter()
            .map(|entry| {
                self.database(entry.node.database)?
                    .route_nodes
                    .get(entry.node.id)?
                    .map(|node| node.coord)
                    .ok_or(RouterError::MissingNode(entry.node))
            })
            .collect()
    }
}

impl RouteGraph for MultiDatabaseRouter {
    fn node(&self, id: DBId) -> Result<Option<Arc<RouteNode>>, RouterError> {
        self.database(id.database)?.route_nodes.get(id.id)
    }

    fn node_twins(&self, id: DBId) -> Vec<DBId> {
        self.twins.get(&id.id).map_or_else(Vec::new, |databases| {
            databases
                .iter()
                .filter(|database| **database != id.database)
                .map(|database| DBId::new(*database, id.id))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ObjectData, RouteNode, RouteNodePath, TurnRestriction, path_flags};
    use crate::profile::{ShortestPathProfile, Vehicle};

    #[derive(Default)]
    struct TestGraph {
        nodes: HashMap<DBId, Arc<RouteNode>>,
        twins: HashMap<DBId, Vec<DBId>>,
    }

    impl TestGraph {
        fn add(&mut self, database: u32, node: RouteNode) {
            self.nodes
                .insert(DBId::new(DatabaseId(database), node.id), Arc::new(node));
        }

        /// Node with one object and car-usable paths; distances are the
        /// great-circle distances between the node coordinates.
        fn add_linked(&mut self, database: u32, id: ObjectId, c: Coord<f64>, targets: &[ObjectId]) {
            let node = RouteNode {
                id,
                coord: c,
                objects: vec![ObjectData { object: 1, variant: 0 }],
                paths: Vec::new(),
                excludes: Vec::new(),
            };
            self.add(database, node);
            let key = DBId::new(DatabaseId(database), id);
            let coords: Vec<Coord<f64>> = targets
                .iter()
                .map(|t| self.nodes[&DBId::new(DatabaseId(database), *t)].coord)
                .collect();
            let node = Arc::make_mut(self.nodes.get_mut(&key).unwrap());
            for (target, target_coord) in targets.iter().zip(coords) {
                node.paths.push(RouteNodePath {
                    target: *target,
                    object_index: 0,
                    distance_km: distance_km(c, target_coord),
                    flags: path_flags::USABLE_BY_CAR,
                });
            }
        }
    }

    impl RouteGraph for TestGraph {
        fn node(&self, id: DBId) -> Result<Option<Arc<RouteNode>>, RouterError> {
            Ok(self.nodes.get(&id).cloned())
        }

        fn node_twins(&self, id: DBId) -> Vec<DBId> {
            self.twins.get(&id).cloned().unwrap_or_default()
        }
    }

    fn db_id(id: ObjectId) -> DBId {
        DBId::new(DatabaseId(0), id)
    }

    fn route_node_ids(result: &RoutingResult) -> Vec<ObjectId> {
        result
            .route()
            .expect("route expected")
            .entries()
            .iter()
            .map(|e| e.node.id)
            .collect()
    }

    /// A diamond where the way through node 2 is shorter than the way
    /// through node 3.
    fn diamond() -> TestGraph {
        let mut graph = TestGraph::default();
        graph.add_linked(0, 1, coord! { x: 0.0, y: 0.0 }, &[]);
        graph.add_linked(0, 2, coord! { x: 0.01, y: 0.002 }, &[]);
        graph.add_linked(0, 3, coord! { x: 0.01, y: 0.02 }, &[]);
        graph.add_linked(0, 4, coord! { x: 0.02, y: 0.0 }, &[]);
        graph.add_linked(0, 1, coord! { x: 0.0, y: 0.0 }, &[2, 3]);
        graph.add_linked(0, 2, coord! { x: 0.01, y: 0.002 }, &[1, 4]);
        graph.add_linked(0, 3, coord! { x: 0.01, y: 0.02 }, &[1, 4]);
        graph.add_linked(0, 4, coord! { x: 0.02, y: 0.0 }, &[2, 3]);
        graph
    }

    #[test]
    fn finds_the_cheapest_path() {
        let graph = diamond();
        let profile = ShortestPathProfile::new(Vehicle::Car);
        let result = calculate_route(
            &graph,
            &profile,
            db_id(1),
            db_id(4),
            &RoutingParameter::default(),
        )
        .unwrap();
        assert_eq!(route_node_ids(&result), vec![1, 2, 4]);
    }

    #[test]
    fn disconnected_target_is_unroutable() {
        let mut graph = TestGraph::default();
        graph.add_linked(0, 1, coord! { x: 0.0, y: 0.0 }, &[]);
        graph.add_linked(0, 2, coord! { x: 0.01, y: 0.0 }, &[]);
        let profile = ShortestPathProfile::new(Vehicle::Car);
        let result = calculate_route(
            &graph,
            &profile,
            db_id(1),
            db_id(2),
            &RoutingParameter::default(),
        )
        .unwrap();
        assert!(!result.is_success());
    }

    #[test]
    fn equal_cost_routes_are_chosen_reproducibly() {
        // A perfectly symmetric diamond: both middle nodes give the
        // same total cost.
        let mut graph = TestGraph::default();
        graph.add_linked(0, 1, coord! { x: 0.0, y: 0.0 }, &[]);
        graph.add_linked(0, 2, coord! { x: 0.01, y: 0.01 }, &[]);
        graph.add_linked(0, 3, coord! { x: 0.01, y: -0.01 }, &[]);
        graph.add_linked(0, 4, coord! { x: 0.02, y: 0.0 }, &[]);
        graph.add_linked(0, 1, coord! { x: 0.0, y: 0.0 }, &[2, 3]);
        graph.add_linked(0, 2, coord! { x: 0.01, y: 0.01 }, &[1, 4]);
        graph.add_linked(0, 3, coord! { x: 0.01, y: -0.01 }, &[1, 4]);
        graph.add_linked(0, 4, coord! { x: 0.02, y: 0.0 }, &[2, 3]);

        let profile = ShortestPathProfile::new(Vehicle::Car);
        let first = calculate_route(
            &graph,
            &profile,
            db_id(1),
            db_id(4),
            &RoutingParameter::default(),
        )
        .unwrap();
        let second = calculate_route(
            &graph,
            &profile,
            db_id(1),
            db_id(4),
            &RoutingParameter::default(),
        )
        .unwrap();
        assert_eq!(
            first.route().unwrap().entries(),
            second.route().unwrap().entries()
        );
    }

    #[test]
    fn turn_restrictions_force_a_detour() {
        // 1 --way 10--> 2, then 2 -> 3 via way 20 is forbidden when
        // arriving via way 10; the detour 2 -> 4 -> 3 must be taken.
        let mut graph = TestGraph::default();
        let c1 = coord! { x: 0.0, y: 0.0 };
        let c2 = coord! { x: 0.01, y: 0.0 };
        let c3 = coord! { x: 0.02, y: 0.0 };
        let c4 = coord! { x: 0.01, y: 0.01 };

        graph.add(
            0,
            RouteNode {
                id: 1,
                coord: c1,
                objects: vec![ObjectData { object: 10, variant: 0 }],
                paths: vec![RouteNodePath {
                    target: 2,
                    object_index: 0,
                    distance_km: distance_km(c1, c2),
                    flags: path_flags::USABLE_BY_CAR,
                }],
                excludes: Vec::new(),
            },
        );
        graph.add(
            0,
            RouteNode {
                id: 2,
                coord: c2,
                objects: vec![
                    ObjectData { object: 20, variant: 0 },
                    ObjectData { object: 30, variant: 0 },
                ],
                paths: vec![
                    RouteNodePath {
                        target: 3,
                        object_index: 0,
                        distance_km: distance_km(c2, c3),
                        flags: path_flags::USABLE_BY_CAR,
                    },
                    RouteNodePath {
                        target: 4,
                        object_index: 1,
                        distance_km: distance_km(c2, c4),
                        flags: path_flags::USABLE_BY_CAR,
                    },
                ],
                excludes: vec![TurnRestriction {
                    source: 10,
                    target_index: 0,
                }],
            },
        );
        graph.add(
            0,
            RouteNode {
                id: 3,
                coord: c3,
                objects: vec![ObjectData { object: 20, variant: 0 }],
                paths: Vec::new(),
                excludes: Vec::new(),
            },
        );
        graph.add(
            0,
            RouteNode {
                id: 4,
                coord: c4,
                objects: vec![ObjectData { object: 40, variant: 0 }],
                paths: vec![RouteNodePath {
                    target: 3,
                    object_index: 0,
                    distance_km: distance_km(c4, c3),
                    flags: path_flags::USABLE_BY_CAR,
                }],
                excludes: Vec::new(),
            },
        );

        let profile = ShortestPathProfile::new(Vehicle::Car);
        let result = calculate_route(
            &graph,
            &profile,
            db_id(1),
            db_id(3),
            &RoutingParameter::default(),
        )
        .unwrap();
        assert_eq!(route_node_ids(&result), vec![1, 2, 4, 3]);
    }

    #[test]
    fn routes_beyond_the_cost_limit_are_abandoned() {
        // The target is 100 m away as the crow flies but the only road
        // is a 500 km detour, far past the cost limit.
        let mut graph = TestGraph::default();
        graph.add(
            0,
            RouteNode {
                id: 1,
                coord: coord! { x: 0.0, y: 0.0 },
                objects: vec![ObjectData { object: 1, variant: 0 }],
                paths: vec![RouteNodePath {
                    target: 2,
                    object_index: 0,
                    distance_km: 500.0,
                    flags: path_flags::USABLE_BY_CAR,
                }],
                excludes: Vec::new(),
            },
        );
        graph.add_linked(0, 2, coord! { x: 0.001, y: 0.0 }, &[]);

        let profile = ShortestPathProfile::new(Vehicle::Car);
        let result = calculate_route(
            &graph,
            &profile,
            db_id(1),
            db_id(2),
            &RoutingParameter::default(),
        )
        .unwrap();
        assert!(!result.is_success());
    }

    #[test]
    fn routes_cross_databases_through_twins() {
        let mut graph = TestGraph::default();
        let border = coord! { x: 0.01, y: 0.0 };
        graph.add_linked(0, 1, coord! { x: 0.0, y: 0.0 }, &[]);
        graph.add_linked(0, 2, border, &[]);
        graph.add_linked(0, 1, coord! { x: 0.0, y: 0.0 }, &[2]);
        graph.add_linked(1, 2, border, &[]);
        graph.add_linked(1, 3, coord! { x: 0.02, y: 0.0 }, &[]);
        graph.add_linked(1, 2, border, &[3]);
        graph
            .twins
            .insert(db_id(2), vec![DBId::new(DatabaseId(1), 2)]);
        graph
            .twins
            .insert(DBId::new(DatabaseId(1), 2), vec![db_id(2)]);

        let profile = ShortestPathProfile::new(Vehicle::Car);
        let result = calculate_route(
            &graph,
            &profile,
            db_id(1),
            DBId::new(DatabaseId(1), 3),
            &RoutingParameter::default(),
        )
        .unwrap();
        let entries = result.route().expect("route expected").entries().to_vec();

        let databases: Vec<u32> = entries.iter().map(|e| e.node.database.0).collect();
        assert_eq!(databases, vec![0, 0, 1, 1]);
        // The transfer to the twin carries no way.
        assert_eq!(entries[2].node.id, 2);
        assert!(entries[2].object.is_none());
        assert!(entries[3].object.is_some());
    }

    #[test]
    fn aborted_breaker_stops_the_search() {
        let graph = diamond();
        let profile = ShortestPathProfile::new(Vehicle::Car);
        let breaker = Breaker::new();
        breaker.abort();
        let result = calculate_route(
            &graph,
            &profile,
            db_id(1),
            db_id(4),
            &RoutingParameter {
                breaker: Some(&breaker),
            },
        )
        .unwrap();
        assert!(!result.is_success());
    }

    mod on_disk {
        use super::*;
        use crate::node::write_route_nodes;
        use crate::way::{RouteWay, write_ways};
        use meridian_mapfile::area_index::{
            AreaIndexError, AreaIndexGenerator, GridIndexParameter, GridObjectSource, TypeInfo,
        };
        use meridian_mapfile::progress::LogProgress;
        use meridian_mapfile::{FileOffset, TypeId};
        use tempfile::tempdir;

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

        fn build_database(directory: &Path) {
            let points = [
                coord! { x: 13.4, y: 52.52 },
                coord! { x: 13.401, y: 52.52 },
                coord! { x: 13.402, y: 52.52 },
            ];
            let ways = vec![RouteWay {
                type_id: 5,
                name: Some("Invalidenstraße".to_owned()),
                flags: path_flags::USABLE_BY_CAR | path_flags::USABLE_BY_FOOT,
                node_ids: vec![1, 2, 3],
                points: points.to_vec(),
            }];
            let offsets = write_ways(&directory.join(WAYS_FILE), &ways).unwrap();

            let object = ObjectData {
                object: offsets[0],
                variant: 0,
            };
            let path = |target: u64, from: Coord<f64>, to: Coord<f64>| RouteNodePath {
                target,
                object_index: 0,
                distance_km: distance_km(from, to),
                flags: path_flags::USABLE_BY_CAR,
            };
            let nodes = vec![
                RouteNode {
                    id: 1,
                    coord: points[0],
                    objects: vec![object],
                    paths: vec![path(2, points[0], points[1])],
                    excludes: Vec::new(),
                },
                RouteNode {
                    id: 2,
                    coord: points[1],
                    objects: vec![object],
                    paths: vec![path(1, points[1], points[0]), path(3, points[1], points[2])],
                    excludes: Vec::new(),
                },
                RouteNode {
                    id: 3,
                    coord: points[2],
                    objects: vec![object],
                    paths: vec![path(2, points[2], points[1])],
                    excludes: Vec::new(),
                },
            ];
            write_route_nodes(&directory.join(ROUTE_NODES_FILE), &nodes).unwrap();

            let mut source = WaySource {
                entries: vec![(offsets[0], 5, ways[0].bounding_box().unwrap())],
            };
            AreaIndexGenerator::new(GridIndexParameter::default())
                .generate(
                    &mut source,
                    &[TypeInfo::new(5, "highway")],
                    &directory.join(AREA_INDEX_FILE),
                    &mut LogProgress::default(),
                )
                .unwrap();
        }

        #[test]
        fn routes_between_resolved_coordinates() {
            let dir = tempdir().unwrap();
            build_database(dir.path());
            let router = MultiDatabaseRouter::open(&[dir.path()]).unwrap();
            let profile = ShortestPathProfile::new(Vehicle::Car);

            let start = router
                .closest_routable_node(coord! { x: 13.4001, y: 52.5201 }, &profile, 100.0)
                .unwrap()
                .expect("start position expected");
            let target = router
                .closest_routable_node(coord! { x: 13.4019, y: 52.5201 }, &profile, 100.0)
                .unwrap()
                .expect("target position expected");

            let result = router
                .calculate_route(&profile, &start, &target, &RoutingParameter::default())
                .unwrap();
            let route = result.route().expect("route expected");
            let ids: Vec<ObjectId> = route.entries().iter().map(|e| e.node.id).collect();
            assert_eq!(ids, vec![1, 2, 3]);
            assert_eq!(route.entries()[0].target_node_index, None);
            assert_eq!(route.entries()[1].target_node_index, Some(1));
            assert_eq!(route.entries()[2].target_node_index, Some(2));

            let points = router.route_points(route).unwrap();
            assert_eq!(points.len(), 3);
            assert!((points[0].x - 13.4).abs() < 1e-6);

            let description = router.route_description(route).unwrap();
            assert_eq!(description.nodes.len(), 3);
            let Some(Description::Name { name }) = description.nodes[1].description("name") else {
                panic!("expected a way name at node 1");
            };
            assert_eq!(name.as_deref(), Some("Invalidenstraße"));
        }

        #[test]
        fn positions_outside_the_radius_are_not_resolved() {
            let dir = tempdir().unwrap();
            build_database(dir.path());
            let router = MultiDatabaseRouter::open(&[dir.path()]).unwrap();
            let profile = ShortestPathProfile::new(Vehicle::Car);

            let position = router
                .closest_routable_node(coord! { x: 13.5, y: 52.6 }, &profile, 100.0)
                .unwrap();
            assert!(position.is_none());
        }

        #[test]
        fn via_routes_join_their_sections() {
            let dir = tempdir().unwrap();
            build_database(dir.path());
            let router = MultiDatabaseRouter::open(&[dir.path()]).unwrap();
            let profile = ShortestPathProfile::new(Vehicle::Car);

            let result = router
                .calculate_route_via(
                    &profile,
                    &[
                        coord! { x: 13.4001, y: 52.5201 },
                        coord! { x: 13.401, y: 52.5201 },
                        coord! { x: 13.4019, y: 52.5201 },
                    ],
                    100.0,
                    &RoutingParameter::default(),
                )
                .unwrap();
            let route = result.route().expect("route expected");
            let ids: Vec<ObjectId> = route.entries().iter().map(|e| e.node.id).collect();
            assert_eq!(ids, vec![1, 2, 3]);
        }
    }
}
