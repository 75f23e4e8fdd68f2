//! Cost profiles.
//!
//! A profile decides whether a path may be used by the vehicle at hand
//! and what using it costs. Costs are opaque to the search; only the
//! profile knows whether they are kilometers or hours.

use crate::node::{RouteNode, path_flags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vehicle {
    Car,
    Bicycle,
    Foot,
}

impl Vehicle {
    pub const fn access_bit(self) -> u8 {
        match self {
            Vehicle::Car => path_flags::USABLE_BY_CAR,
            Vehicle::Bicycle => path_flags::USABLE_BY_BICYCLE,
            Vehicle::Foot => path_flags::USABLE_BY_FOOT,
        }
    }
}

/// Travel speeds in km/h per object variant.
///
/// Built once from explicit values and handed to the profile; there is
/// no global speed registry.
#[derive(Debug, Clone)]
pub struct SpeedTable {
    speeds: Vec<f64>,
    min_speed: f64,
    max_speed: f64,
    vehicle_max_speed: f64,
}

impl SpeedTable {
    /// `speeds` is indexed by object variant. Variants beyond the table
    /// fall back to the slowest known speed.
    pub fn new(speeds: Vec<f64>, vehicle_max_speed: f64) -> Self {
        let min_speed = speeds.iter().copied().fold(f64::INFINITY, f64::min);
        let max_speed = speeds.iter().copied().fold(0.0, f64::max);
        Self {
            speeds,
            min_speed: if min_speed.is_finite() {
                min_speed
            } else {
                vehicle_max_speed
            },
            max_speed: if max_speed > 0.0 {
                max_speed
            } else {
                vehicle_max_speed
            },
            vehicle_max_speed,
        }
    }

    /// Effective speed for a variant, capped by the vehicle maximum.
    pub fn speed(&self, variant: u32) -> f64 {
        let raw = self
            .speeds
            .get(variant as usize)
            .copied()
            .unwrap_or(self.min_speed);
        raw.min(self.vehicle_max_speed)
    }

    pub fn max_speed(&self) -> f64 {
        self.max_speed.min(self.vehicle_max_speed)
    }
}

/// Admissibility and cost model for one vehicle.
///
/// `estimate_costs` must never overestimate the true remaining cost or
/// the search loses optimality.
pub trait RoutingProfile {
    fn vehicle(&self) -> Vehicle;

    /// Whether the vehicle may take the given path.
    fn can_use(&self, node: &RouteNode, path_index: usize) -> bool {
        node.paths[path_index].flags & self.vehicle().access_bit() != 0
    }

    /// Cost of traversing one path of a node.
    fn edge_costs(&self, node: &RouteNode, path_index: usize) -> f64;

    /// Lower bound for the cost of covering `distance_km`.
    fn estimate_costs(&self, distance_km: f64) -> f64;

    /// Prune threshold for a route over the given direct distance.
    fn cost_limit(&self, distance_km: f64) -> f64;

    /// Human-readable rendering of a cost value.
    fn cost_string(&self, cost: f64) -> String;
}

/// Cost equals distance; the result is the shortest route.
#[derive(Debug, Clone)]
pub struct ShortestPathProfile {
    vehicle: Vehicle,
    pub cost_limit_distance_km: f64,
    pub cost_limit_factor: f64,
}

impl ShortestPathProfile {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            cost_limit_distance_km: 20.0,
            cost_limit_factor: 5.0,
        }
    }
}

impl RoutingProfile for ShortestPathProfile {
    fn vehicle(&self) -> Vehicle {
        self.vehicle
    }

    fn edge_costs(&self, node: &RouteNode, path_index: usize) -> f64 {
        node.paths[path_index].distance_km
    }

    fn estimate_costs(&self, distance_km: f64) -> f64 {
        distance_km
    }

    fn cost_limit(&self, distance_km: f64) -> f64 {
        self.cost_limit_distance_km + distance_km * self.cost_limit_factor
    }

    fn cost_string(&self, cost: f64) -> String {
        format!("{cost:.1} km")
    }
}

/// Cost equals travel time under a speed table; the result is the
/// fastest route.
#[derive(Debug, Clone)]
pub struct FastestPathProfile {
    vehicle: Vehicle,
    table: SpeedTable,
    pub cost_limit_distance_km: f64,
    pub cost_limit_factor: f64,
}

impl FastestPathProfile {
    pub fn new(vehicle: Vehicle, table: SpeedTable) -> Self {
        Self {
            vehicle,
            table,
            cost_limit_distance_km: 20.0,
            cost_limit_factor: 5.0,
        }
    }
}

impl RoutingProfile for FastestPathProfile {
    fn vehicle(&self) -> Vehicle {
        self.vehicle
    }

    fn edge_costs(&self, node: &RouteNode, path_index: usize) -> f64 {
        let path = &node.paths[path_index];
        let variant = node.objects[path.object_index].variant;
        path.distance_km / self.table.speed(variant)
    }

    fn estimate_costs(&self, distance_km: f64) -> f64 {
        // Assuming the fastest way type everywhere keeps the heuristic
        // admissible.
        distance_km / self.table.max_speed()
    }

    fn cost_limit(&self, distance_km: f64) -> f64 {
        self.estimate_costs(self.cost_limit_distance_km)
            + self.estimate_costs(distance_km) * self.cost_limit_factor
    }

    fn cost_string(&self, cost: f64) -> String {
        #[expect(clippy::cast_possible_truncation)]
        #[expect(clippy::cast_sign_loss)]
        let minutes = (cost * 60.0).round() as u64;
        format!("{}:{:02} h", minutes / 60, minutes % 60)
    }
}
