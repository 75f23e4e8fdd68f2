//! Route data and turn-by-turn descriptions.
//!
//! The search produces a bare [`RouteData`]: the visited nodes plus the
//! object used to reach each of them. Postprocessors then enrich a
//! [`RouteDescription`] derived from it with distances, way names and
//! turn instructions. Each postprocessor is independent and only adds
//! descriptions; running order matters where one reads what an earlier
//! one wrote.

use geo::{Coord, Distance, Haversine, Point};

use meridian_mapfile::FileOffset;

use crate::DBId;
use crate::RouterError;

/// One step of a calculated route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDataEntry {
    pub node: DBId,
    /// Offset of the way used to arrive at `node`. `None` at the start
    /// and after a zero-cost database transfer.
    pub object: Option<FileOffset>,
    /// Position of `node` in the arrival way's node list. Filled in
    /// after the search, which never loads way data itself.
    pub target_node_index: Option<usize>,
}

/// The raw output of the route calculation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteData {
    entries: Vec<RouteDataEntry>,
}

impl RouteData {
    pub fn push(&mut self, entry: RouteDataEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[RouteDataEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [RouteDataEntry] {
        &mut self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends another route section, dropping the duplicated junction
    /// node where the sections meet.
    pub fn append(&mut self, mut other: RouteData) {
        if let (Some(last), Some(first)) = (self.entries.last(), other.entries.first())
            && last.node == first.node
        {
            other.entries.remove(0);
        }
        self.entries.append(&mut other.entries);
    }
}

/// A single instruction or annotation attached to a route node.
#[derive(Debug, Clone, PartialEq)]
pub enum Description {
    Start { name: Option<String> },
    Target { name: Option<String> },
    /// Name of the way leaving this node.
    Name {
        name: Option<String>,
    },
    NameChanged {
        origin: Option<String>,
        target: Option<String>,
    },
    /// Ways crossing at this node, beyond the one traveled.
    CrossingWays {
        exit_count: u32,
    },
    Direction {
        /// Angle between the incoming and outgoing bearing, in degrees,
        /// normalized to `(-180, 180]`. Negative turns left.
        turn_angle: f64,
    },
    Turn,
    RoundaboutEnter { clockwise: bool },
    RoundaboutLeave { exit_count: u32 },
    MotorwayEnter,
    MotorwayChange,
    MotorwayLeave,
    MotorwayJunction { name: Option<String> },
    /// Signposted destination of the way leaving this node.
    Destination { destination: String },
    MaxSpeed { speed_km_h: u8 },
    /// Type of the way leaving this node (for example "highway.residential").
    TypeName { name: String },
    PoiAtRoute { name: String },
    Lanes { count: u8 },
    SuggestedLanes { from: u8, to: u8 },
}

impl Description {
    /// Stable label used to look a description up on a node.
    pub const fn label(&self) -> &'static str {
        match self {
            Description::Start { .. } => "start",
            Description::Target { .. } => "target",
            Description::Name { .. } => "name",
            Description::NameChanged { .. } => "name-changed",
            Description::CrossingWays { .. } => "crossing-ways",
            Description::Direction { .. } => "direction",
            Description::Turn => "turn",
            Description::RoundaboutEnter { .. } => "roundabout-enter",
            Description::RoundaboutLeave { .. } => "roundabout-leave",
            Description::MotorwayEnter => "motorway-enter",
            Description::MotorwayChange => "motorway-change",
            Description::MotorwayLeave => "motorway-leave",
            Description::MotorwayJunction { .. } => "motorway-junction",
            Description::Destination { .. } => "destination",
            Description::MaxSpeed { .. } => "max-speed",
            Description::TypeName { .. } => "type-name",
            Description::PoiAtRoute { .. } => "poi-at-route",
            Description::Lanes { .. } => "lanes",
            Description::SuggestedLanes { .. } => "suggested-lanes",
        }
    }
}

/// One node of a route description: position, running totals and the
/// descriptions attached so far.
#[derive(Debug, Clone)]
pub struct RouteDescriptionNode {
    pub node: DBId,
    pub coord: Coord<f64>,
    /// Offset of the way used to arrive here, if any.
    pub object: Option<FileOffset>,
    /// Cumulative distance from the start, in km.
    pub distance_km: f64,
    /// Cumulative travel time from the start, in hours.
    pub time_h: f64,
    descriptions: Vec<Description>,
}

impl RouteDescriptionNode {
    pub fn new(node: DBId, coord: Coord<f64>, object: Option<FileOffset>) -> Self {
        Self {
            node,
            coord,
            object,
            distance_km: 0.0,
            time_h: 0.0,
            descriptions: Vec::new(),
        }
    }

    pub fn add_description(&mut self, description: Description) {
        self.descriptions.push(description);
    }

    /// First description with the given label, if any.
    pub fn description(&self, label: &str) -> Option<&Description> {
        self.descriptions.iter().find(|d| d.label() == label)
    }

    pub fn descriptions(&self) -> &[Description] {
        &self.descriptions
    }
}

/// A route plus everything the postprocessors derived from it.
#[derive(Debug, Clone, Default)]
pub struct RouteDescription {
    pub nodes: Vec<RouteDescriptionNode>,
}

/// One enrichment pass over a route description.
pub trait Postprocessor {
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Fails if data needed for the pass cannot be loaded.
    fn process(&self, description: &mut RouteDescription) -> Result<(), RouterError>;
}

/// Runs the given postprocessors in order.
///
/// # Errors
///
/// Stops at the first failing postprocessor.
pub fn postprocess(
    description: &mut RouteDescription,
    postprocessors: &[&dyn Postprocessor],
) -> Result<(), RouterError> {
    for p in postprocessors {
        tracing::debug!(postprocessor = p.name(), "running postprocessor");
        p.process(description)?;
    }
    Ok(())
}

/// Marks the first and last node of the route.
pub struct StartTargetPostprocessor {
    pub start_name: Option<String>,
    pub target_name: Option<String>,
}

impl Postprocessor for StartTargetPostprocessor {
    fn name(&self) -> &'static str {
        "start-target"
    }

    fn process(&self, description: &mut RouteDescription) -> Result<(), RouterError> {
        if let Some(first) = description.nodes.first_mut() {
            first.add_description(Description::Start {
                name: self.start_name.clone(),
            });
        }
        if let Some(last) = description.nodes.last_mut() {
            last.add_description(Description::Target {
                name: self.target_name.clone(),
            });
        }
        Ok(())
    }
}

/// Fills in cumulative distance and travel time.
///
/// Distance is great-circle between consecutive nodes; time assumes a
/// constant speed, which is enough for an estimate shown alongside the
/// instructions.
pub struct DistanceAndTimePostprocessor {
    pub speed_km_h: f64,
}

impl Postprocessor for DistanceAndTimePostprocessor {
    fn name(&self) -> &'static str {
        "distance-and-time"
    }

    fn process(&self, description: &mut RouteDescription) -> Result<(), RouterError> {
        let mut distance_km = 0.0;
        let mut prev: Option<Coord<f64>> = None;
        for node in &mut description.nodes {
            if let Some(p) = prev {
                distance_km += Haversine.distance(Point::from(p), Point::from(node.coord)) / 1000.0;
            }
            node.distance_km = distance_km;
            node.time_h = distance_km / self.speed_km_h;
            prev = Some(node.coord);
        }
        Ok(())
    }
}

/// Detects where the way name changes between consecutive nodes.
///
/// Expects `Name` descriptions to be present already.
pub struct NameChangedPostprocessor;

impl Postprocessor for NameChangedPostprocessor {
    fn name(&self) -> &'static str {
        "name-changed"
    }

    fn process(&self, description: &mut RouteDescription) -> Result<(), RouterError> {
        let mut changes = Vec::new();
        let mut prev_name: Option<Option<String>> = None;
        for (index, node) in description.nodes.iter().enumerate() {
            let Some(Description::Name { name }) = node.description("name") else {
                continue;
            };
            if let Some(origin) = &prev_name
                && origin != name
            {
                changes.push((index, origin.clone(), name.clone()));
            }
            prev_name = Some(name.clone());
        }
        for (index, origin, target) in changes {
            description.nodes[index]
                .add_description(Description::NameChanged { origin, target });
        }
        Ok(())
    }
}

/// Adds turn angles and flags significant turns.
pub struct DirectionPostprocessor {
    /// Turns sharper than this many degrees get a `Turn` description.
    pub turn_threshold_deg: f64,
}

impl Default for DirectionPostprocessor {
    fn default() -> Self {
        Self {
            turn_threshold_deg: 50.0,
        }
    }
}

/// Initial bearing from `a` to `b` in degrees, clockwise from north.
fn bearing(a: Coord<f64>, b: Coord<f64>) -> f64 {
    let lat_a = a.y.to_radians();
    let lat_b = b.y.to_radians();
    let delta_lon = (b.x - a.x).to_radians();
    let y = delta_lon.sin() * lat_b.cos();
    let x = lat_a.cos() * lat_b.sin() - lat_a.sin() * lat_b.cos() * delta_lon.cos();
    y.atan2(x).to_degrees()
}

/// Normalizes an angle difference to `(-180, 180]`.
fn normalize_angle(mut angle: f64) -> f64 {
    while angle <= -180.0 {
        angle += 360.0;
    }
    while angle > 180.0 {
        angle -= 360.0;
    }
    angle
}

impl Postprocessor for DirectionPostprocessor {
    fn name(&self) -> &'static str {
        "direction"
    }

    fn process(&self, description: &mut RouteDescription) -> Result<(), RouterError> {
        let coords: Vec<Coord<f64>> = description.nodes.iter().map(|n| n.coord).collect();
        for index in 1..coords.len().saturating_sub(1) {
            let incoming = bearing(coords[index - 1], coords[index]);
            let outgoing = bearing(coords[index], coords[index + 1]);
            let turn_angle = normalize_angle(outgoing - incoming);

            let node = &mut description.nodes[index];
            node.add_description(Description::Direction { turn_angle });
            if turn_angle.abs() >= self.turn_threshold_deg {
                node.add_description(Description::Turn);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DatabaseId;
    use geo::coord;

    fn db_id(id: u64) -> DBId {
        DBId::new(DatabaseId(0), id)
    }

    fn description_with_coords(coords: &[Coord<f64>]) -> RouteDescription {
        RouteDescription {
            nodes: coords
                .iter()
                .enumerate()
                .map(|(i, c)| RouteDescriptionNode::new(db_id(i as u64), *c, None))
                .collect(),
        }
    }

    #[test]
    fn append_drops_the_duplicated_junction() {
        let mut first = RouteData::default();
        first.push(RouteDataEntry {
            node: db_id(1),
            object: None,
            target_node_index: None,
        });
        first.push(RouteDataEntry {
            node: db_id(2),
            object: Some(10),
            target_node_index: None,
        });

        let mut second = RouteData::default();
        second.push(RouteDataEntry {
            node: db_id(2),
            object: None,
            target_node_index: None,
        });
        second.push(RouteDataEntry {
            node: db_id(3),
            object: Some(20),
            target_node_index: None,
        });

        first.append(second);
        let nodes: Vec<u64> = first.entries().iter().map(|e| e.node.id).collect();
        assert_eq!(nodes, vec![1, 2, 3]);
    }

    #[test]
    fn start_and_target_are_marked() {
        let mut description = description_with_coords(&[
            coord! { x: 0.0, y: 0.0 },
            coord! { x: 0.1, y: 0.0 },
            coord! { x: 0.2, y: 0.0 },
        ]);
        let p = StartTargetPostprocessor {
            start_name: Some("A".to_owned()),
            target_name: Some("B".to_owned()),
        };
        p.process(&mut description).unwrap();

        assert!(description.nodes[0].description("start").is_some());
        assert!(description.nodes[0].description("target").is_none());
        assert!(description.nodes[2].description("target").is_some());
    }

    #[test]
    fn distance_accumulates_along_the_route() {
        // Roughly 111 km per degree of latitude.
        let mut description = description_with_coords(&[
            coord! { x: 0.0, y: 0.0 },
            coord! { x: 0.0, y: 1.0 },
            coord! { x: 0.0, y: 2.0 },
        ]);
        let p = DistanceAndTimePostprocessor { speed_km_h: 100.0 };
        p.process(&mut description).unwrap();

        assert!((description.nodes[0].distance_km).abs() < 1e-9);
        assert!((description.nodes[1].distance_km - 111.2).abs() < 1.0);
        assert!((description.nodes[2].distance_km - 222.4).abs() < 2.0);
        assert!(
            (description.nodes[2].time_h - description.nodes[2].distance_km / 100.0).abs() < 1e-9
        );
    }

    #[test]
    fn name_changes_are_detected_once() {
        let mut description = description_with_coords(&[
            coord! { x: 0.0, y: 0.0 },
            coord! { x: 0.1, y: 0.0 },
            coord! { x: 0.2, y: 0.0 },
        ]);
        description.nodes[0].add_description(Description::Name {
            name: Some("Main Street".to_owned()),
        });
        description.nodes[1].add_description(Description::Name {
            name: Some("High Street".to_owned()),
        });
        description.nodes[2].add_description(Description::Name {
            name: Some("High Street".to_owned()),
        });

        NameChangedPostprocessor.process(&mut description).unwrap();

        assert!(description.nodes[0].description("name-changed").is_none());
        let Some(Description::NameChanged { origin, target }) =
            description.nodes[1].description("name-changed")
        else {
            panic!("expected a name change at node 1");
        };
        assert_eq!(origin.as_deref(), Some("Main Street"));
        assert_eq!(target.as_deref(), Some("High Street"));
        assert!(description.nodes[2].description("name-changed").is_none());
    }

    #[test]
    fn right_angle_turns_are_flagged() {
        // North, then east: a 90 degree right turn at the middle node.
        let mut description = description_with_coords(&[
            coord! { x: 0.0, y: 0.0 },
            coord! { x: 0.0, y: 0.01 },
            coord! { x: 0.01, y: 0.01 },
        ]);
        DirectionPostprocessor::default()
            .process(&mut description)
            .unwrap();

        let Some(Description::Direction { turn_angle }) =
            description.nodes[1].description("direction")
        else {
            panic!("expected a direction at node 1");
        };
        assert!((turn_angle - 90.0).abs() < 1.0);
        assert!(description.nodes[1].description("turn").is_some());
    }

    #[test]
    fn straight_segments_are_not_turns() {
        let mut description = description_with_coords(&[
            coord! { x: 0.0, y: 0.0 },
            coord! { x: 0.0, y: 0.01 },
            coord! { x: 0.0, y: 0.02 },
        ]);
        DirectionPostprocessor::default()
            .process(&mut description)
            .unwrap();

        assert!(description.nodes[1].description("direction").is_some());
        assert!(description.nodes[1].description("turn").is_none());
    }
}
