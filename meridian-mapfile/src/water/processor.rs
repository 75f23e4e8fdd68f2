//! The per-level classification pipeline.
//!
//! Every coastline's border crossings are collected per cell, then each
//! crossed cell is walked clockwise to produce ground tile polygons.
//! Afterwards neighbor states are inferred from the tiles, water is
//! flooded outward, enclosed land is filled, and whatever is left gets
//! the configured default.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use geo::{Coord, Rect};
use itertools::Itertools;
use tracing::{info, warn};

use super::coastline::{area_partly_in_area, merge_coastlines, synthesize_coastlines};
use super::file::write_water_index;
use super::geometry::{distance_square, find_path_intersections, line_intersection, lines_intersect};
use super::state_map::StateMap;
use super::{
    CellBoundaries, CellGroundTiles, Coast, CoastState, GroundCoord, GroundTile, Level, State,
    WaterIndexError, WaterIndexParameter, transform,
};
use crate::progress::Progress;
use crate::tile::{MagnificationLevel, TileId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Touch,
    Out,
}

/// A crossing between a coastline segment and a cell border.
#[derive(Debug, Clone)]
struct Intersection {
    coastline: usize,
    prev_point_index: usize,
    point: Coord<f64>,
    distance_square: f64,
    direction: Direction,
    /// 0 = top, 1 = right, 2 = bottom, 3 = left.
    border_index: usize,
}

/// A coastline prepared for one level.
#[derive(Debug)]
struct CoastlineData {
    is_area: bool,
    left: CoastState,
    right: CoastState,
    points: Vec<Coord<f64>>,
    /// Absolute cell, valid when `is_completely_in_cell`.
    cell: (u32, u32),
    is_completely_in_cell: bool,
    /// Border crossings per relative cell.
    cell_intersections: BTreeMap<TileId, Vec<Intersection>>,
}

#[derive(Debug, Default)]
struct Data {
    coastlines: Vec<CoastlineData>,
    /// Indexes of coastlines crossing each cell.
    cell_coastlines: BTreeMap<TileId, Vec<usize>>,
    /// Indexes of coastlines completely inside each cell.
    cell_covered_coastlines: BTreeMap<TileId, Vec<usize>>,
}

/// Clockwise border order: top left-to-right, right top-to-bottom,
/// bottom right-to-left, left bottom-to-top.
fn cw_order(a: &Intersection, b: &Intersection) -> std::cmp::Ordering {
    a.border_index
        .cmp(&b.border_index)
        .then_with(|| match a.border_index {
            0 => a.point.x.total_cmp(&b.point.x),
            1 => b.point.y.total_cmp(&a.point.y),
            2 => b.point.x.total_cmp(&a.point.x),
            _ => a.point.y.total_cmp(&b.point.y),
        })
}

#[expect(clippy::cast_possible_truncation)]
#[expect(clippy::cast_sign_loss)]
fn absolute_cell(state_map: &StateMap, point: Coord<f64>) -> (u32, u32) {
    (
        ((point.x + 180.0) / state_map.cell_width()) as u32,
        ((point.y + 90.0) / state_map.cell_height()) as u32,
    )
}

fn cell_border_points(state_map: &StateMap, x: u32, y: u32) -> [Coord<f64>; 5] {
    let lon_min = f64::from(x) * state_map.cell_width() - 180.0;
    let lon_max = f64::from(x + 1) * state_map.cell_width() - 180.0;
    let lat_min = f64::from(y) * state_map.cell_height() - 90.0;
    let lat_max = f64::from(y + 1) * state_map.cell_height() - 90.0;

    [
        Coord { x: lon_min, y: lat_max },
        Coord { x: lon_max, y: lat_max },
        Coord { x: lon_max, y: lat_min },
        Coord { x: lon_min, y: lat_min },
        Coord { x: lon_min, y: lat_max },
    ]
}

/// Collects the absolute cells touched by the segment `a`-`b`.
fn get_segment_cells(
    state_map: &StateMap,
    a: Coord<f64>,
    b: Coord<f64>,
    cells: &mut BTreeSet<TileId>,
) {
    let (cx1, cy1) = absolute_cell(state_map, a);
    let (cx2, cy2) = absolute_cell(state_map, b);

    cells.insert(TileId::new(cx1, cy1));

    if cx1 == cx2 && cy1 == cy2 {
        return;
    }

    for x in cx1.min(cx2)..=cx1.max(cx2) {
        for y in cy1.min(cy2)..=cy1.max(cy2) {
            let border = cell_border_points(state_map, x, y);

            for corner in 0..4 {
                if lines_intersect(a, b, border[corner], border[corner + 1]) {
                    cells.insert(TileId::new(x, y));
                    break;
                }
            }
        }
    }
}

fn get_cells(state_map: &StateMap, points: &[Coord<f64>], cells: &mut BTreeSet<TileId>) {
    for (a, b) in points.iter().copied().tuple_windows() {
        get_segment_cells(state_map, a, b, cells);
    }
}

/// Computes every border crossing of the path, grouped by relative cell.
fn get_cell_intersections(
    state_map: &StateMap,
    points: &[Coord<f64>],
    coastline: usize,
    cell_intersections: &mut BTreeMap<TileId, Vec<Intersection>>,
) {
    for (p, (a, b)) in points.iter().copied().tuple_windows().enumerate() {
        let (cx1, cy1) = absolute_cell(state_map, a);
        let (cx2, cy2) = absolute_cell(state_map, b);

        if cx1 == cx2 && cy1 == cy2 {
            continue;
        }

        for x in cx1.min(cx2)..=cx1.max(cx2) {
            for y in cy1.min(cy2)..=cy1.max(cy2) {
                if !state_map.is_in_absolute(x, y) {
                    continue;
                }

                let rel = TileId::new(x - state_map.x_start(), y - state_map.y_start());
                let border = cell_border_points(state_map, x, y);

                let crossing_at = |corner: usize| {
                    line_intersection(a, b, border[corner], border[corner + 1]).map(
                        |point| Intersection {
                            coastline,
                            prev_point_index: p,
                            point,
                            distance_square: distance_square(a, point),
                            direction: Direction::Touch,
                            border_index: corner,
                        },
                    )
                };

                let mut first: Option<Intersection> = None;
                let mut second: Option<Intersection> = None;
                let mut corner = 0;
                while corner < 4 {
                    first = crossing_at(corner);
                    corner += 1;
                    if first.is_some() {
                        break;
                    }
                }
                while corner < 4 {
                    second = crossing_at(corner);
                    corner += 1;
                    if second.is_some() {
                        break;
                    }
                }

                match (first, second) {
                    (Some(mut first), Some(mut second)) => {
                        // The crossing closer to the segment start enters
                        // the cell, the farther one leaves it.
                        let entry = cell_intersections.entry(rel).or_default();
                        if first.distance_square <= second.distance_square {
                            first.direction = Direction::In;
                            second.direction = Direction::Out;
                            entry.push(first);
                            entry.push(second);
                        } else {
                            second.direction = Direction::In;
                            first.direction = Direction::Out;
                            entry.push(second);
                            entry.push(first);
                        }
                    }
                    (Some(mut only), None) => {
                        only.direction = if x == cx1 && y == cy1 {
                            // The segment always leaves its origin cell.
                            Direction::Out
                        } else if x == cx2 && y == cy2 {
                            Direction::In
                        } else {
                            Direction::Touch
                        };
                        cell_intersections.entry(rel).or_default().push(only);
                    }
                    _ => {}
                }
            }
        }
    }
}

fn path_bbox(points: &[Coord<f64>]) -> Rect<f64> {
    let mut min = points[0];
    let mut max = points[0];
    for p in points {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    }
    Rect::new(min, max)
}

/// Prepares coastlines for one level: closes areas, drops degenerate and
/// mutually intersecting geometry, and classifies each coastline as
/// completely-in-cell or computes its border crossings.
fn calculate_coastline_data(
    state_map: &StateMap,
    coastlines: &[Coast],
    progress: &mut dyn Progress,
) -> Data {
    let mut prepared: Vec<Option<CoastlineData>> = Vec::with_capacity(coastlines.len());

    for (index, coast) in coastlines.iter().enumerate() {
        progress.set_progress(index as u64, coastlines.len() as u64);

        let mut points = coast.points.clone();
        if coast.is_area {
            if points.first() != points.last()
                && let Some(&front) = points.first()
            {
                points.push(front);
            }
            if points.len() <= 3 {
                // Island reduced to a line.
                prepared.push(None);
                continue;
            }
        }

        prepared.push(Some(CoastlineData {
            is_area: coast.is_area,
            left: coast.left,
            right: coast.right,
            points,
            cell: (0, 0),
            is_completely_in_cell: false,
            cell_intersections: BTreeMap::new(),
        }));
    }

    // Islands lying too close to other coastlines may intersect them,
    // which the cell walk cannot tolerate. Drop the area side of any
    // area/way intersection.
    for i in 0..prepared.len() {
        for j in (i + 1)..prepared.len() {
            let (Some(a), Some(b)) = (&prepared[i], &prepared[j]) else {
                continue;
            };
            if a.is_area == b.is_area {
                // Way/way touches are fine and area/area checks are too
                // expensive.
                continue;
            }

            let mut intersections = Vec::new();
            find_path_intersections(&a.points, &b.points, a.is_area, b.is_area, &mut intersections);

            if !intersections.is_empty() {
                warn!(first = i, second = j, "detected intersecting coastlines");
                if a.is_area {
                    prepared[i] = None;
                } else {
                    prepared[j] = None;
                }
            }
        }
    }

    let mut data = Data::default();

    for mut coastline in prepared.into_iter().flatten() {
        let index = data.coastlines.len();
        let bbox = path_bbox(&coastline.points);
        let (cx_min, cy_min) = absolute_cell(state_map, bbox.min());
        let (cx_max, cy_max) = absolute_cell(state_map, bbox.max());

        if cx_min == cx_max && cy_min == cy_max {
            coastline.cell = (cx_min, cy_min);
            coastline.is_completely_in_cell = true;

            if state_map.is_in_absolute(cx_min, cy_min) {
                let rel = TileId::new(cx_min - state_map.x_start(), cy_min - state_map.y_start());
                data.cell_covered_coastlines.entry(rel).or_default().push(index);
            }
        } else {
            let mut cell_intersections = BTreeMap::new();
            get_cell_intersections(state_map, &coastline.points, index, &mut cell_intersections);

            for cell in cell_intersections.keys() {
                data.cell_coastlines.entry(*cell).or_default().push(index);
            }
            coastline.cell_intersections = cell_intersections;
        }

        data.coastlines.push(coastline);
    }

    info!(
        input = coastlines.len(),
        prepared = data.coastlines.len(),
        "calculated coastline data"
    );

    data
}

/// Marks every cell a coastline passes through as coast.
fn mark_coastline_cells(state_map: &mut StateMap, data: &Data) {
    for coastline in &data.coastlines {
        let mut cells = BTreeSet::new();
        get_cells(state_map, &coastline.points, &mut cells);

        for cell in cells {
            if state_map.is_in_absolute(cell.x, cell.y)
                && state_map.get_state_absolute(cell.x, cell.y) == State::Unknown
            {
                state_map.set_state_absolute(cell.x, cell.y, State::Coast);
            }
        }
    }
}

/// Emits a ground tile polygon for every area coastline that fits into a
/// single cell.
fn handle_area_coastlines_completely_in_a_cell(
    state_map: &StateMap,
    data: &Data,
    cell_ground_tiles: &mut CellGroundTiles,
    progress: &mut dyn Progress,
) {
    for (index, coastline) in data.coastlines.iter().enumerate() {
        progress.set_progress(index as u64 + 1, data.coastlines.len() as u64);

        if !(coastline.is_area && coastline.is_completely_in_cell) {
            continue;
        }
        let (cx, cy) = coastline.cell;
        if !state_map.is_in_absolute(cx, cy) {
            continue;
        }

        let rel = TileId::new(cx - state_map.x_start(), cy - state_map.y_start());
        let tile_type = match coastline.left {
            CoastState::Unknown => State::Unknown,
            // Water on the inside happens for lakes in synthetic data only.
            CoastState::Water => State::Water,
            _ => State::Land,
        };

        let cell_min_lat = state_map.cell_height() * f64::from(cy) - 90.0;
        let cell_min_lon = state_map.cell_width() * f64::from(cx) - 180.0;

        let mut tile = GroundTile::new(tile_type);
        tile.coords.reserve(coastline.points.len());
        for point in &coastline.points {
            tile.coords
                .push(transform(*point, state_map, cell_min_lat, cell_min_lon, true));
        }

        if let Some(last) = tile.coords.last_mut() {
            last.coast = false;
            cell_ground_tiles.entry(rel).or_default().push(tile);
        }
    }
}

fn is_left_on_same_border(border: usize, a: Coord<f64>, b: Coord<f64>) -> bool {
    match border {
        0 => b.x >= a.x,
        1 => b.y <= a.y,
        2 => b.x <= a.x,
        _ => b.y >= a.y,
    }
}

fn walk_border_cw(
    tile: &mut GroundTile,
    state_map: &StateMap,
    boundaries: &CellBoundaries,
    incoming: &Intersection,
    outgoing: &Intersection,
) {
    if outgoing.border_index != incoming.border_index
        || !is_left_on_same_border(incoming.border_index, incoming.point, outgoing.point)
    {
        let mut border_point = (incoming.border_index + 1) % 4;
        let end = outgoing.border_index;

        while border_point != end {
            tile.coords.push(boundaries.border_coords[border_point]);
            border_point = (border_point + 1) % 4;
        }
        tile.coords.push(boundaries.border_coords[border_point]);
    }

    tile.coords.push(transform(
        outgoing.point,
        state_map,
        boundaries.lat_min,
        boundaries.lon_min,
        false,
    ));
}

fn walk_path_back(
    tile: &mut GroundTile,
    state_map: &StateMap,
    boundaries: &CellBoundaries,
    path_start: &Intersection,
    path_end: &Intersection,
    points: &[Coord<f64>],
    is_area: bool,
) {
    if let Some(last) = tile.coords.last_mut() {
        last.coast = true;
    }

    let push = |tile: &mut GroundTile, point: Coord<f64>, coast: bool| {
        tile.coords.push(transform(
            point,
            state_map,
            boundaries.lat_min,
            boundaries.lon_min,
            coast,
        ));
    };

    if is_area {
        if path_start.prev_point_index == path_end.prev_point_index
            && path_start.distance_square > path_end.distance_square
        {
            push(tile, path_end.point, false);
            return;
        }

        let mut idx = path_start.prev_point_index;
        let mut target_idx = path_end.prev_point_index + 1;
        if target_idx == points.len() {
            target_idx = 0;
        }

        while idx != target_idx {
            push(tile, points[idx], true);
            if idx > 0 {
                idx -= 1;
            } else {
                idx = points.len() - 1;
            }
        }
        push(tile, points[idx], true);
        push(tile, path_end.point, false);
    } else {
        let target_idx = path_end.prev_point_index + 1;
        let mut idx = path_start.prev_point_index;
        while idx >= target_idx {
            push(tile, points[idx], true);
            idx -= 1;
        }
        push(tile, path_end.point, false);
    }
}

fn walk_path_forward(
    tile: &mut GroundTile,
    state_map: &StateMap,
    boundaries: &CellBoundaries,
    path_start: &Intersection,
    path_end: &Intersection,
    points: &[Coord<f64>],
    is_area: bool,
) {
    if let Some(last) = tile.coords.last_mut() {
        last.coast = true;
    }

    let push = |tile: &mut GroundTile, point: Coord<f64>, coast: bool| {
        tile.coords.push(transform(
            point,
            state_map,
            boundaries.lat_min,
            boundaries.lon_min,
            coast,
        ));
    };

    if is_area {
        if path_start.prev_point_index == path_end.prev_point_index
            && path_start.distance_square < path_end.distance_square
        {
            push(tile, path_end.point, false);
            return;
        }

        let mut idx = path_start.prev_point_index + 1;
        let target_idx = if path_end.prev_point_index == points.len() {
            0
        } else {
            path_end.prev_point_index
        };

        while idx != target_idx {
            push(tile, points[idx], true);
            if idx >= points.len() - 1 {
                idx = 0;
            } else {
                idx += 1;
            }
        }
        push(tile, points[idx], true);
        push(tile, path_end.point, false);
    } else {
        for idx in (path_start.prev_point_index + 1)..=path_end.prev_point_index {
            push(tile, points[idx], true);
        }
        push(tile, path_end.point, false);
    }
}

/// Walks the coastline between two of its own border crossings, in the
/// direction that keeps the walked state on the left.
fn walk_path(
    tile: &mut GroundTile,
    state_map: &StateMap,
    boundaries: &CellBoundaries,
    path_start: &Intersection,
    path_end: &Intersection,
    coastline: &CoastlineData,
) {
    if path_start.direction == Direction::Out {
        walk_path_back(
            tile,
            state_map,
            boundaries,
            path_start,
            path_end,
            &coastline.points,
            coastline.is_area,
        );
    } else {
        walk_path_forward(
            tile,
            state_map,
            boundaries,
            path_start,
            path_end,
            &coastline.points,
            coastline.is_area,
        );
    }
}

/// Finds the crossing where the coastline of `current` leaves (or
/// enters) the cell again. Areas may wrap around the ring.
fn find_sibling_intersection(
    current: &Intersection,
    cw: &[Intersection],
    is_area: bool,
) -> Option<usize> {
    let search = if current.direction == Direction::In {
        Direction::Out
    } else {
        Direction::In
    };

    let candidates: Vec<usize> = cw
        .iter()
        .enumerate()
        .filter(|(_, i)| i.coastline == current.coastline && i.direction == search)
        .map(|(index, _)| index)
        .collect();

    let mut result: Option<usize> = None;
    for &i in &candidates {
        if current.direction == Direction::In {
            if cw[i].prev_point_index >= current.prev_point_index
                && result.is_none_or(|r| cw[i].prev_point_index < cw[r].prev_point_index)
            {
                result = Some(i);
            }
        } else if cw[i].prev_point_index <= current.prev_point_index
            && result.is_none_or(|r| cw[i].prev_point_index > cw[r].prev_point_index)
        {
            result = Some(i);
        }
    }

    if result.is_some() || !is_area {
        return result;
    }

    for &i in &candidates {
        if current.direction == Direction::In {
            if cw[i].prev_point_index <= current.prev_point_index
                && result.is_none_or(|r| cw[i].prev_point_index < cw[r].prev_point_index)
            {
                result = Some(i);
            }
        } else if cw[i].prev_point_index >= current.prev_point_index
            && result.is_none_or(|r| cw[i].prev_point_index > cw[r].prev_point_index)
        {
            result = Some(i);
        }
    }
    result
}

/// Continues the walk over a point where open coastlines meet. Picks the
/// next coastline by sharpest clockwise turn among those carrying the
/// walked state on the matching side.
#[expect(clippy::too_many_arguments)]
fn walk_from_tripoint(
    tile: &mut GroundTile,
    state_map: &StateMap,
    boundaries: &CellBoundaries,
    path_start: &mut Intersection,
    path_end: &mut Option<usize>,
    data: &Data,
    cw: &[Intersection],
    containing_paths: &[usize],
) -> bool {
    let coastline = &data.coastlines[path_start.coastline];
    if coastline.points.len() < 2 {
        return false;
    }

    let incoming = path_start.direction == Direction::In;
    let tripoint = if incoming {
        coastline.points[coastline.points.len() - 1]
    } else {
        coastline.points[0]
    };
    let previous_point = if incoming {
        coastline.points[coastline.points.len() - 2]
    } else {
        coastline.points[1]
    };
    let walk_type = if incoming { coastline.right } else { coastline.left };

    let mut candidates: Vec<usize> = cw.iter().map(|i| i.coastline).collect();
    candidates.extend_from_slice(containing_paths);

    let mut outgoing: Option<Intersection> = None;
    let mut outgoing_end: Option<Intersection> = None;
    let mut outgoing_end_index: Option<usize> = None;
    let mut outgoing_angle = 0.0_f64;
    let mut outgoing_coastline = 0usize;
    let mut intersect_cell = false;

    for &path_index in &candidates {
        if path_start.coastline == path_index {
            continue;
        }

        let path = &data.coastlines[path_index];
        if path.points.len() < 2 {
            continue;
        }

        let starts_here = tripoint == path.points[0];
        let ends_here = tripoint == path.points[path.points.len() - 1];
        if !starts_here && !ends_here {
            continue;
        }

        let direction = if starts_here { Direction::Out } else { Direction::In };
        if (direction == Direction::Out && walk_type != path.right)
            || (direction == Direction::In && walk_type != path.left)
        {
            continue;
        }

        let previous_out_point = if direction == Direction::Out {
            path.points[1]
        } else {
            path.points[path.points.len() - 2]
        };

        let angle = (tripoint.x - previous_point.x) * (previous_out_point.y - tripoint.y)
            - (tripoint.y - previous_point.y) * (previous_out_point.x - tripoint.x);

        if outgoing.is_none() || angle < outgoing_angle {
            outgoing_angle = angle;
            outgoing_coastline = path_index;

            outgoing = Some(Intersection {
                coastline: path_index,
                prev_point_index: if direction == Direction::In {
                    path.points.len() - 1
                } else {
                    0
                },
                point: tripoint,
                distance_square: 0.0,
                // Heading into the tripoint means leaving the cell walk.
                direction: if direction == Direction::In {
                    Direction::Out
                } else {
                    Direction::In
                },
                border_index: 0,
            });

            let mut cell_intersection: Option<usize> = None;
            for (index, candidate) in cw.iter().enumerate() {
                if candidate.coastline != path_index {
                    continue;
                }
                match cell_intersection {
                    None => cell_intersection = Some(index),
                    Some(best) => {
                        let better = if direction == Direction::Out {
                            cw[best].prev_point_index > candidate.prev_point_index
                                || (cw[best].prev_point_index == candidate.prev_point_index
                                    && cw[best].distance_square > candidate.distance_square)
                        } else {
                            cw[best].prev_point_index < candidate.prev_point_index
                                || (cw[best].prev_point_index == candidate.prev_point_index
                                    && cw[best].distance_square < candidate.distance_square)
                        };
                        if better {
                            cell_intersection = Some(index);
                        }
                    }
                }
            }

            intersect_cell = cell_intersection.is_some();
            outgoing_end_index = cell_intersection;
            outgoing_end = Some(match cell_intersection {
                Some(index) => cw[index].clone(),
                None => Intersection {
                    coastline: path_index,
                    prev_point_index: if direction == Direction::In {
                        0
                    } else {
                        path.points.len() - 1
                    },
                    point: if direction == Direction::In {
                        path.points[0]
                    } else {
                        path.points[path.points.len() - 1]
                    },
                    distance_square: 0.0,
                    direction,
                    border_index: 0,
                },
            });
        }
    }

    let (Some(outgoing), Some(outgoing_end)) = (outgoing, outgoing_end) else {
        return false;
    };
    if outgoing.direction == outgoing_end.direction {
        return false;
    }

    if intersect_cell {
        *path_end = outgoing_end_index;
    }

    walk_path(
        tile,
        state_map,
        boundaries,
        &outgoing,
        &outgoing_end,
        &data.coastlines[outgoing_coastline],
    );
    *path_start = outgoing;

    true
}

/// Walks one closed polygon clockwise around the cell: along coastlines
/// inside the cell and along the border between crossings.
#[expect(clippy::too_many_arguments)]
fn walk_boundary_cw(
    tile: &mut GroundTile,
    state_map: &StateMap,
    start: usize,
    cw: &[Intersection],
    visited: &mut HashSet<usize>,
    boundaries: &CellBoundaries,
    data: &Data,
    containing_paths: &[usize],
) -> bool {
    tile.coords.push(transform(
        cw[start].point,
        state_map,
        boundaries.lat_min,
        boundaries.lon_min,
        false,
    ));

    let mut current = start;
    let mut step = 0usize;

    loop {
        visited.insert(current);
        let current_value = cw[current].clone();
        let coastline = &data.coastlines[current_value.coastline];
        let mut path_end = find_sibling_intersection(&current_value, cw, coastline.is_area);

        if let Some(end) = path_end {
            walk_path(tile, state_map, boundaries, &current_value, &cw[end], coastline);
        } else {
            let incoming = current_value.direction == Direction::In;
            let tripoint = if incoming {
                coastline.points[coastline.points.len() - 1]
            } else {
                coastline.points[0]
            };
            let synthetic_end = Intersection {
                coastline: current_value.coastline,
                prev_point_index: if incoming { coastline.points.len() - 1 } else { 0 },
                point: tripoint,
                distance_square: 0.0,
                direction: if incoming { Direction::Out } else { Direction::In },
                border_index: 0,
            };

            walk_path(tile, state_map, boundaries, &current_value, &synthetic_end, coastline);

            let mut path_start_value = current_value;
            while path_end.is_none() {
                if data.coastlines[path_start_value.coastline].is_area {
                    // An area cannot take part in a tripoint.
                    return false;
                }

                if !walk_from_tripoint(
                    tile,
                    state_map,
                    boundaries,
                    &mut path_start_value,
                    &mut path_end,
                    data,
                    cw,
                    containing_paths,
                ) {
                    return false;
                }

                step += 1;
                if step > 1000 {
                    warn!("too many steps walking cell boundary, giving up");
                    return false;
                }
            }
        }

        step += 1;
        if step > 1000 {
            warn!("too many steps walking cell boundary, giving up");
            return false;
        }

        let Some(end) = path_end else {
            return false;
        };
        let next = (end + 1) % cw.len();
        walk_border_cw(tile, state_map, boundaries, &cw[end], &cw[next]);

        current = next;
        if current == start {
            break;
        }
    }

    true
}

fn handle_coastline_cell(
    cell: TileId,
    intersect_coastlines: &[usize],
    state_map: &StateMap,
    cell_ground_tiles: &mut CellGroundTiles,
    data: &Data,
) {
    let boundaries = CellBoundaries::new(state_map, cell);

    let mut cw: Vec<Intersection> = Vec::new();
    for &index in intersect_coastlines {
        if let Some(intersections) = data.coastlines[index].cell_intersections.get(&cell) {
            cw.extend(intersections.iter().cloned());
        }
    }
    cw.sort_by(cw_order);

    let containing_paths: Vec<usize> = data
        .cell_covered_coastlines
        .get(&cell)
        .map(|covered| {
            covered
                .iter()
                .copied()
                .filter(|&i| {
                    !data.coastlines[i].is_area && data.coastlines[i].is_completely_in_cell
                })
                .collect()
        })
        .unwrap_or_default();

    let mut visited: HashSet<usize> = HashSet::new();

    for start in 0..cw.len() {
        if cw[start].direction == Direction::Touch || visited.contains(&start) {
            continue;
        }

        let coastline = &data.coastlines[cw[start].coastline];
        let coast_state = if cw[start].direction == Direction::In {
            coastline.right
        } else {
            coastline.left
        };
        debug_assert!(coast_state != CoastState::Undefined);

        let tile_type = match coast_state {
            CoastState::Land => State::Land,
            CoastState::Water => State::Water,
            _ => State::Unknown,
        };
        let mut tile = GroundTile::new(tile_type);

        if !walk_boundary_cw(
            &mut tile,
            state_map,
            start,
            &cw,
            &mut visited,
            &boundaries,
            data,
            &containing_paths,
        ) {
            warn!(cell = %cell, "cannot walk around cell boundary");
            continue;
        }

        cell_ground_tiles.entry(cell).or_default().push(tile);
    }
}

fn handle_coastlines_partially_in_a_cell(
    state_map: &StateMap,
    cell_ground_tiles: &mut CellGroundTiles,
    data: &Data,
    progress: &mut dyn Progress,
) {
    for (index, (cell, coastlines)) in data.cell_coastlines.iter().enumerate() {
        progress.set_progress(index as u64, data.cell_coastlines.len() as u64);
        handle_coastline_cell(*cell, coastlines, state_map, cell_ground_tiles, data);
    }
}

/// Derives the state of still-unknown neighbors of coast cells from
/// ground tile polygons that run along a complete cell border.
fn calculate_coast_environment(state_map: &mut StateMap, cell_ground_tiles: &CellGroundTiles) {
    const MAX: u16 = GroundCoord::CELL_MAX;

    for (cell, tiles) in cell_ground_tiles {
        // Neighbor states: top, right, bottom, left.
        let mut state = [State::Unknown; 4];

        if cell.y < state_map.y_count() - 1 {
            state[0] = state_map.get_state(cell.x, cell.y + 1);
        }
        if cell.x < state_map.x_count() - 1 {
            state[1] = state_map.get_state(cell.x + 1, cell.y);
        }
        if cell.y > 0 {
            state[2] = state_map.get_state(cell.x, cell.y - 1);
        }
        if cell.x > 0 {
            state[3] = state_map.get_state(cell.x - 1, cell.y);
        }

        for tile in tiles {
            let tile_state = match tile.tile_type {
                State::Land => State::Land,
                State::Water => State::Water,
                _ => State::Unknown,
            };

            if tile.coords.len() < 2 {
                continue;
            }
            for (c, n) in tile.coords.iter().copied().tuple_windows() {
                // A polygon edge across a full border means the whole
                // neighbor on that side shares the tile's state.
                if c.x == 0 && c.y == MAX && n.x == MAX && n.y == MAX && state[0] == State::Unknown
                {
                    state[0] = tile_state;
                }
                if c.x == MAX && c.y == MAX && n.x == MAX && n.y == 0 && state[1] == State::Unknown
                {
                    state[1] = tile_state;
                }
                if c.x == MAX && c.y == 0 && n.x == 0 && n.y == 0 && state[2] == State::Unknown {
                    state[2] = tile_state;
                }
                if c.x == 0 && c.y == 0 && n.x == 0 && n.y == MAX && state[3] == State::Unknown {
                    state[3] = tile_state;
                }
            }
        }

        if cell.y < state_map.y_count() - 1
            && state_map.get_state(cell.x, cell.y + 1) == State::Unknown
            && state[0] != State::Unknown
        {
            state_map.set_state(cell.x, cell.y + 1, state[0]);
        }
        if cell.x < state_map.x_count() - 1
            && state_map.get_state(cell.x + 1, cell.y) == State::Unknown
            && state[1] != State::Unknown
        {
            state_map.set_state(cell.x + 1, cell.y, state[1]);
        }
        if cell.y > 0
            && state_map.get_state(cell.x, cell.y - 1) == State::Unknown
            && state[2] != State::Unknown
        {
            state_map.set_state(cell.x, cell.y - 1, state[2]);
        }
        if cell.x > 0
            && state_map.get_state(cell.x - 1, cell.y) == State::Unknown
            && state[3] != State::Unknown
        {
            state_map.set_state(cell.x - 1, cell.y, state[3]);
        }
    }
}

fn is_cell_in_bounding_polygon(boundaries: &CellBoundaries, bounding_polygons: &[Coast]) -> bool {
    if bounding_polygons.is_empty() {
        return true;
    }

    bounding_polygons
        .iter()
        .any(|poly| area_partly_in_area(&boundaries.border_points, &poly.points))
}

/// Floods water from known water cells into unknown neighbors, bounded
/// by the data extent.
fn fill_water(
    state_map: &mut StateMap,
    iterations: usize,
    bounding_polygons: &[Coast],
) {
    for _ in 0..iterations {
        let previous = state_map.clone();

        for y in 0..previous.y_count() {
            for x in 0..previous.x_count() {
                if previous.get_state(x, y) != State::Water {
                    continue;
                }

                if !is_cell_in_bounding_polygon(
                    &CellBoundaries::new(&previous, TileId::new(x, y)),
                    bounding_polygons,
                ) {
                    continue;
                }

                if y > 0 && previous.get_state(x, y - 1) == State::Unknown {
                    state_map.set_state(x, y - 1, State::Water);
                }
                if y < previous.y_count() - 1 && previous.get_state(x, y + 1) == State::Unknown {
                    state_map.set_state(x, y + 1, State::Water);
                }
                if x > 0 && previous.get_state(x - 1, y) == State::Unknown {
                    state_map.set_state(x - 1, y, State::Water);
                }
                if x < previous.x_count() - 1 && previous.get_state(x + 1, y) == State::Unknown {
                    state_map.set_state(x + 1, y, State::Water);
                }
            }
        }
    }
}

fn contains_coord(tiles: &[GroundTile], coord: GroundCoord) -> bool {
    tiles
        .iter()
        .any(|tile| tile.coords.iter().any(|c| c.same_position(coord)))
}

fn contains_typed_coord(tiles: &[GroundTile], coord: GroundCoord, tile_type: State) -> bool {
    tiles.iter().any(|tile| {
        tile.tile_type == tile_type && tile.coords.iter().any(|c| c.same_position(coord))
    })
}

fn contains_water(
    cell: (u32, u32),
    state_map: &StateMap,
    cell_ground_tiles: &CellGroundTiles,
    test1: GroundCoord,
    test2: GroundCoord,
) -> bool {
    let (x, y) = cell;
    if x >= state_map.x_count() || y >= state_map.y_count() {
        return false;
    }

    if state_map.get_state(x, y) == State::Water {
        return true;
    }

    let Some(tiles) = cell_ground_tiles.get(&TileId::new(x, y)) else {
        return false;
    };

    contains_typed_coord(tiles, test1, State::Water) || contains_typed_coord(tiles, test2, State::Water)
}

/// Gives island-only cells a water backdrop when a neighboring cell
/// carries water on the shared border.
fn fill_water_around_island(
    state_map: &StateMap,
    cell_ground_tiles: &mut CellGroundTiles,
    bounding_polygons: &[Coast],
) {
    let cells: Vec<TileId> = cell_ground_tiles.keys().copied().collect();

    for cell in cells {
        let boundaries = CellBoundaries::new(state_map, cell);
        let corners = boundaries.border_coords;

        {
            let tiles = &cell_ground_tiles[&cell];
            // A cell whose tiles touch no corner contains only islands.
            if corners.iter().any(|&corner| contains_coord(tiles, corner)) {
                continue;
            }
        }

        if !is_cell_in_bounding_polygon(&boundaries, bounding_polygons) {
            continue;
        }

        let mut fill = false;
        if cell.y > 0
            && contains_water(
                (cell.x, cell.y - 1),
                state_map,
                cell_ground_tiles,
                corners[0],
                corners[1],
            )
        {
            fill = true;
        }
        if !fill
            && contains_water(
                (cell.x, cell.y + 1),
                state_map,
                cell_ground_tiles,
                corners[2],
                corners[3],
            )
        {
            fill = true;
        }
        if !fill
            && cell.x > 0
            && contains_water(
                (cell.x - 1, cell.y),
                state_map,
                cell_ground_tiles,
                corners[0],
                corners[3],
            )
        {
            fill = true;
        }
        if !fill
            && contains_water(
                (cell.x + 1, cell.y),
                state_map,
                cell_ground_tiles,
                corners[1],
                corners[2],
            )
        {
            fill = true;
        }

        if fill {
            let mut backdrop = GroundTile::new(State::Water);
            backdrop.coords.extend_from_slice(&corners);

            // The water backdrop must be drawn below the islands.
            if let Some(tiles) = cell_ground_tiles.get_mut(&cell) {
                tiles.insert(0, backdrop);
            }
        }
    }
}

/// Fills unknown runs enclosed between land/coast on both ends, row-wise
/// and column-wise until a fixpoint.
fn fill_land(state_map: &mut StateMap) {
    let mut changed = true;

    while changed {
        changed = false;

        for y in 0..state_map.y_count() {
            let mut x = 0;
            let mut start = 0;
            let mut end = 0;
            let mut phase = 0;

            while x < state_map.x_count() {
                match phase {
                    0 => {
                        if state_map.get_state(x, y) == State::Land {
                            phase = 1;
                        }
                        x += 1;
                    }
                    1 => {
                        if state_map.get_state(x, y) == State::Unknown {
                            phase = 2;
                            start = x;
                            end = x;
                            x += 1;
                        } else {
                            phase = 0;
                        }
                    }
                    _ => {
                        let state = state_map.get_state(x, y);
                        if state == State::Unknown {
                            end = x;
                            x += 1;
                        } else if state == State::Coast || state == State::Land {
                            if start <= end {
                                for i in start..=end {
                                    state_map.set_state(i, y, State::Land);
                                    changed = true;
                                }
                            }
                            phase = 0;
                        } else {
                            phase = 0;
                        }
                    }
                }
            }
        }

        for x in 0..state_map.x_count() {
            let mut y = 0;
            let mut start = 0;
            let mut end = 0;
            let mut phase = 0;

            while y < state_map.y_count() {
                match phase {
                    0 => {
                        if state_map.get_state(x, y) == State::Land {
                            phase = 1;
                        }
                        y += 1;
                    }
                    1 => {
                        if state_map.get_state(x, y) == State::Unknown {
                            phase = 2;
                            start = y;
                            end = y;
                            y += 1;
                        } else {
                            phase = 0;
                        }
                    }
                    _ => {
                        let state = state_map.get_state(x, y);
                        if state == State::Unknown {
                            end = y;
                            y += 1;
                        } else if state == State::Coast || state == State::Land {
                            if start <= end {
                                for i in start..=end {
                                    state_map.set_state(x, i, State::Land);
                                    changed = true;
                                }
                            }
                            phase = 0;
                        } else {
                            phase = 0;
                        }
                    }
                }
            }
        }
    }
}

fn calculate_has_cell_data(level: &mut Level, cell_ground_tiles: &CellGroundTiles) {
    level.has_cell_data = false;
    level.default_cell_data = State::Unknown;

    if level.state_map.x_count() == 0 || level.state_map.y_count() == 0 {
        return;
    }

    level.default_cell_data = level.state_map.get_state(0, 0);

    if !cell_ground_tiles.is_empty() {
        level.has_cell_data = true;
        return;
    }

    for y in 0..level.state_map.y_count() {
        for x in 0..level.state_map.x_count() {
            if level.state_map.get_state(x, y) != level.default_cell_data {
                level.has_cell_data = true;
                return;
            }
        }
    }
}

/// Builds the water index for a range of levels.
pub struct WaterIndexProcessor {
    parameter: WaterIndexParameter,
}

impl WaterIndexProcessor {
    pub fn new(parameter: WaterIndexParameter) -> Self {
        Self { parameter }
    }

    /// Runs the full pipeline for one level and returns its ground
    /// tiles. The level's state map and metadata are updated in place.
    pub fn process_level(
        &self,
        level: &mut Level,
        coastlines: &[Coast],
        bounding_polygons: &[Coast],
        progress: &mut dyn Progress,
    ) -> CellGroundTiles {
        let data = calculate_coastline_data(&level.state_map, coastlines, progress);

        mark_coastline_cells(&mut level.state_map, &data);

        let mut cell_ground_tiles = CellGroundTiles::new();
        handle_area_coastlines_completely_in_a_cell(
            &level.state_map,
            &data,
            &mut cell_ground_tiles,
            progress,
        );
        handle_coastlines_partially_in_a_cell(
            &level.state_map,
            &mut cell_ground_tiles,
            &data,
            progress,
        );

        calculate_coast_environment(&mut level.state_map, &cell_ground_tiles);

        fill_water_around_island(&level.state_map, &mut cell_ground_tiles, bounding_polygons);
        fill_water(
            &mut level.state_map,
            self.parameter.fill_water_iterations,
            bounding_polygons,
        );
        fill_land(&mut level.state_map);

        if self.parameter.default_assumption != State::Unknown {
            for y in 0..level.state_map.y_count() {
                for x in 0..level.state_map.x_count() {
                    if level.state_map.get_state(x, y) == State::Unknown {
                        level.state_map.set_state(x, y, self.parameter.default_assumption);
                    }
                }
            }
        }

        calculate_has_cell_data(level, &cell_ground_tiles);

        cell_ground_tiles
    }

    /// Merges and synthesizes the coastlines, processes every configured
    /// level, and writes the index file.
    ///
    /// # Errors
    ///
    /// Fails when the index file cannot be written.
    pub fn process(
        &self,
        path: &Path,
        coastlines: Vec<Coast>,
        bounding_polygons: &[Coast],
        bbox: &Rect<f64>,
        progress: &mut dyn Progress,
    ) -> Result<(), WaterIndexError> {
        let coastlines = merge_coastlines(coastlines, progress);
        let coastlines = synthesize_coastlines(coastlines, bounding_polygons, progress);

        let mut levels: Vec<Level> = (self.parameter.min_level..=self.parameter.max_level)
            .map(|n| {
                let magnification = MagnificationLevel::new(n);
                Level::new(
                    n,
                    StateMap::new(bbox, magnification.cell_width(), magnification.cell_height()),
                )
            })
            .collect();

        let mut tiles_per_level: Vec<CellGroundTiles> = Vec::with_capacity(levels.len());
        for level in &mut levels {
            info!(level = level.level, "processing water index level");
            let tiles = self.process_level(level, &coastlines, bounding_polygons, progress);
            tiles_per_level.push(tiles);
        }

        write_water_index(path, &mut levels, &tiles_per_level)
    }
}
