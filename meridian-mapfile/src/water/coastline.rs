//! Coastline preparation: merging raw ways into chains and rings, and
//! synthesizing closed coastlines against the extract's bounding
//! polygons.

use std::collections::{HashMap, HashSet};

use geo::{Coord, Intersects, LineString, Polygon};
use tracing::{info, warn};

use super::geometry::{PathIntersection, find_path_intersections};
use super::{Coast, CoastState};
use crate::ObjectId;
use crate::progress::Progress;

/// Whether the two rings overlap at least partly.
pub(super) fn area_partly_in_area(a: &[Coord<f64>], b: &[Coord<f64>]) -> bool {
    let a_ring = Polygon::new(LineString::from(a.to_vec()), Vec::new());
    let b_ring = Polygon::new(LineString::from(b.to_vec()), Vec::new());
    a_ring.intersects(&b_ring)
}

/// Joins way coastlines end-to-end and promotes closed chains to areas.
///
/// Chains whose last node id matches another chain's first node id are
/// concatenated until no further join applies. Chains that close on
/// themselves become areas with the duplicate closing point removed.
/// Degenerate results are dropped with a warning.
pub fn merge_coastlines(coastlines: Vec<Coast>, progress: &mut dyn Progress) -> Vec<Coast> {
    progress.set_action("Merging coastlines");

    let mut merged: Vec<Coast> = Vec::new();
    let mut ways: Vec<Coast> = Vec::new();
    let mut area_count = 0usize;
    let mut way_count = 0usize;

    for coast in coastlines {
        if coast.is_area {
            area_count += 1;
            merged.push(coast);
        } else {
            ways.push(coast);
        }
    }

    // First chain starting at a given node wins, like repeated map
    // insertion with an existing key.
    let mut start_map: HashMap<ObjectId, usize> = HashMap::new();
    for (index, way) in ways.iter().enumerate() {
        start_map.entry(way.front_node_id).or_insert(index);
    }

    let mut blacklist: HashSet<ObjectId> = HashSet::new();
    let mut joined = true;
    while joined {
        joined = false;

        for i in 0..ways.len() {
            if blacklist.contains(&ways[i].id) {
                continue;
            }

            let Some(&j) = start_map.get(&ways[i].back_node_id) else {
                continue;
            };
            if blacklist.contains(&ways[j].id) || ways[i].id == ways[j].id {
                continue;
            }

            let tail: Vec<Coord<f64>> = ways[j].points[1..].to_vec();
            let new_back = ways[j].back_node_id;
            let joined_front = ways[j].front_node_id;
            ways[j].points.clear();

            ways[i].points.extend(tail);
            ways[i].back_node_id = new_back;

            blacklist.insert(ways[j].id);
            start_map.remove(&joined_front);

            joined = true;
        }
    }

    for mut way in ways {
        if blacklist.contains(&way.id) {
            continue;
        }

        if way.front_node_id == way.back_node_id {
            way.is_area = true;
            way.points.pop();
            area_count += 1;
        } else {
            way_count += 1;
        }

        if (way.is_area && way.points.len() <= 2) || way.points.len() < 2 {
            warn!(id = way.id, "dropping too short coastline");
            continue;
        }

        merged.push(way);
    }

    info!(way_count, area_count, "merged coastlines");

    merged
}

fn sort_by_candidate(intersections: &mut [PathIntersection]) {
    intersections.sort_by(|a, b| {
        a.a_index
            .cmp(&b.a_index)
            .then_with(|| a.a_distance_square.total_cmp(&b.a_distance_square))
    });
}

fn sort_by_coastline(intersections: &mut [PathIntersection]) {
    intersections.sort_by(|a, b| {
        a.b_index
            .cmp(&b.b_index)
            .then_with(|| a.b_distance_square.total_cmp(&b.b_distance_square))
    });
}

/// Copies `src[start..end)` into `dst`, wrapping around the ring when
/// `start` lies past `end`. Equal indexes with the start intersection
/// farther along the segment than the end intersection also wrap.
fn cut_path(
    dst: &mut Vec<Coord<f64>>,
    src: &[Coord<f64>],
    start: usize,
    end: usize,
    start_distance_square: f64,
    end_distance_square: f64,
) {
    let start = start % src.len();
    let end = end % src.len();

    if start > end || (start == end && start_distance_square > end_distance_square) {
        dst.extend_from_slice(&src[start..]);
        dst.extend_from_slice(&src[..end]);
    } else {
        dst.extend_from_slice(&src[start..end]);
    }
}

/// Cuts coastlines and bounding polygons against each other so that
/// every resulting coastline lies within the data extent and carries
/// resolved left/right states.
///
/// Bounding polygon segments between two crossings become synthetic
/// coastlines whose left side is water or land depending on the crossing
/// orientation. Coastline segments outside the extent are discarded;
/// closed islands without crossings survive when they overlap a bounding
/// polygon. Afterwards any still-undefined state is resolved: right
/// defaults to unknown, an area's left side becomes water when a
/// water-right coastline overlaps it, and land otherwise.
pub fn synthesize_coastlines(
    coastlines: Vec<Coast>,
    bounding_polygons: &[Coast],
    progress: &mut dyn Progress,
) -> Vec<Coast> {
    progress.set_action("Synthesizing coastlines");

    let mut synthesized: Vec<Coast> = Vec::new();
    let mut way_intersections: Vec<Vec<PathIntersection>> = vec![Vec::new(); coastlines.len()];

    for polygon in bounding_polygons {
        let candidate = Coast {
            is_area: true,
            ..polygon.clone()
        };

        let mut candidate_intersections: Vec<PathIntersection> = Vec::new();
        for (wi, coastline) in coastlines.iter().enumerate() {
            let mut intersections = Vec::new();
            find_path_intersections(
                &candidate.points,
                &coastline.points,
                candidate.is_area,
                coastline.is_area,
                &mut intersections,
            );

            // Touching without crossing has orientation zero and is not a
            // real transition.
            let mut valid = 0usize;
            for intersection in intersections {
                if intersection.orientation != 0.0 {
                    candidate_intersections.push(intersection.clone());
                    way_intersections[wi].push(intersection);
                    valid += 1;
                }
            }

            if valid % 2 != 0 {
                warn!(
                    count = valid,
                    coastline = coastline.id,
                    "odd count of valid intersections"
                );
            }
        }

        if candidate_intersections.is_empty() {
            synthesized.push(candidate);
            continue;
        }
        if candidate_intersections.len() % 2 != 0 {
            warn!(
                count = candidate_intersections.len(),
                "odd count of intersections, skipping bounding polygon"
            );
            continue;
        }

        sort_by_candidate(&mut candidate_intersections);

        for ii in 0..candidate_intersections.len() {
            let int1 = &candidate_intersections[ii];
            let int2 = &candidate_intersections[(ii + 1) % candidate_intersections.len()];
            debug_assert!(if int1.orientation > 0.0 {
                int2.orientation < 0.0
            } else {
                int2.orientation > 0.0
            });

            let mut points = vec![int1.point];
            cut_path(
                &mut points,
                &candidate.points,
                int1.a_index + 1,
                int2.a_index + 1,
                int1.a_distance_square,
                int2.a_distance_square,
            );
            points.push(int2.point);

            synthesized.push(Coast {
                id: candidate.id,
                is_area: false,
                front_node_id: 0,
                back_node_id: 0,
                points,
                left: if int1.orientation > 0.0 {
                    CoastState::Water
                } else {
                    CoastState::Land
                },
                right: candidate.right,
            });
        }
    }

    for (wi, coastline) in coastlines.iter().enumerate() {
        let intersections = &mut way_intersections[wi];

        if intersections.is_empty() {
            // An island without crossings survives iff it lies within the
            // data extent.
            if coastline.is_area
                && bounding_polygons
                    .iter()
                    .any(|poly| area_partly_in_area(&coastline.points, &poly.points))
            {
                synthesized.push(coastline.clone());
            }
            continue;
        }

        if intersections.len() % 2 != 0 {
            warn!(
                count = intersections.len(),
                coastline = coastline.id,
                "odd count of intersections, skipping coastline"
            );
            continue;
        }

        sort_by_coastline(intersections);

        let limit = if coastline.is_area {
            intersections.len()
        } else {
            intersections.len() - 1
        };

        for ii in 0..limit {
            let int1 = &intersections[ii];
            let int2 = &intersections[(ii + 1) % intersections.len()];
            debug_assert!(if int1.orientation > 0.0 {
                int2.orientation < 0.0
            } else {
                int2.orientation > 0.0
            });

            // Only keep the parts running into the extent.
            if int1.orientation < 0.0 {
                continue;
            }

            let mut points = vec![int1.point];
            cut_path(
                &mut points,
                &coastline.points,
                int1.b_index + 1,
                int2.b_index + 1,
                int1.b_distance_square,
                int2.b_distance_square,
            );
            points.push(int2.point);

            synthesized.push(Coast {
                id: coastline.id,
                is_area: false,
                front_node_id: 0,
                back_node_id: 0,
                points,
                left: coastline.left,
                right: coastline.right,
            });
        }
    }

    for index in 0..synthesized.len() {
        if synthesized[index].right == CoastState::Undefined {
            synthesized[index].right = CoastState::Unknown;
        }

        if synthesized[index].left == CoastState::Undefined && synthesized[index].is_area {
            for test in 0..synthesized.len() {
                if synthesized[test].right == CoastState::Water
                    && area_partly_in_area(
                        &synthesized[test].points,
                        &synthesized[index].points,
                    )
                {
                    synthesized[index].left = CoastState::Water;
                }
            }
        }

        if synthesized[index].left == CoastState::Undefined {
            synthesized[index].left = CoastState::Land;
        }
    }

    info!(
        bounding_polygons = bounding_polygons.len(),
        coastlines = coastlines.len(),
        synthesized = synthesized.len(),
        "synthesized coastlines"
    );

    synthesized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::LogProgress;
    use geo::coord;

    fn c(x: f64, y: f64) -> Coord<f64> {
        coord! { x: x, y: y }
    }

    fn way(id: ObjectId, front: ObjectId, back: ObjectId, points: Vec<Coord<f64>>) -> Coast {
        Coast {
            id,
            is_area: false,
            front_node_id: front,
            back_node_id: back,
            points,
            left: CoastState::Land,
            right: CoastState::Water,
        }
    }

    #[test]
    fn chains_merge_end_to_end() {
        let coasts = vec![
            way(1, 100, 200, vec![c(0.0, 0.0), c(1.0, 0.0)]),
            way(2, 200, 300, vec![c(1.0, 0.0), c(2.0, 0.0)]),
            way(3, 300, 400, vec![c(2.0, 0.0), c(3.0, 0.0)]),
        ];

        let merged = merge_coastlines(coasts, &mut LogProgress::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].front_node_id, 100);
        assert_eq!(merged[0].back_node_id, 400);
        assert_eq!(
            merged[0].points,
            vec![c(0.0, 0.0), c(1.0, 0.0), c(2.0, 0.0), c(3.0, 0.0)]
        );
        assert!(!merged[0].is_area);
    }

    #[test]
    fn closed_chain_becomes_area_without_duplicate_point() {
        let coasts = vec![
            way(1, 100, 200, vec![c(0.0, 0.0), c(1.0, 0.0)]),
            way(2, 200, 300, vec![c(1.0, 0.0), c(1.0, 1.0)]),
            way(3, 300, 100, vec![c(1.0, 1.0), c(0.0, 0.0)]),
        ];

        let merged = merge_coastlines(coasts, &mut LogProgress::default());
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_area);
        assert_eq!(merged[0].points, vec![c(0.0, 0.0), c(1.0, 0.0), c(1.0, 1.0)]);
    }

    #[test]
    fn degenerate_coastlines_are_dropped() {
        let coasts = vec![
            way(1, 100, 100, vec![c(0.0, 0.0), c(0.0, 0.0)]),
            way(2, 200, 300, vec![c(5.0, 5.0)]),
        ];

        let merged = merge_coastlines(coasts, &mut LogProgress::default());
        assert!(merged.is_empty());
    }

    fn bounding_square() -> Coast {
        Coast {
            id: 0,
            is_area: true,
            front_node_id: 0,
            back_node_id: 0,
            points: vec![c(0.0, 0.0), c(10.0, 0.0), c(10.0, 10.0), c(0.0, 10.0)],
            left: CoastState::Undefined,
            right: CoastState::Undefined,
        }
    }

    #[test]
    fn island_inside_extent_survives_synthesis() {
        let island = Coast {
            id: 7,
            is_area: true,
            front_node_id: 0,
            back_node_id: 0,
            points: vec![c(4.0, 4.0), c(6.0, 4.0), c(6.0, 6.0), c(4.0, 6.0)],
            left: CoastState::Land,
            right: CoastState::Water,
        };

        let result = synthesize_coastlines(
            vec![island],
            &[bounding_square()],
            &mut LogProgress::default(),
        );
        assert!(result.iter().any(|coast| coast.id == 7 && coast.is_area));
    }

    #[test]
    fn island_outside_extent_is_discarded() {
        let island = Coast {
            id: 7,
            is_area: true,
            front_node_id: 0,
            back_node_id: 0,
            points: vec![c(40.0, 40.0), c(42.0, 40.0), c(42.0, 42.0), c(40.0, 42.0)],
            left: CoastState::Land,
            right: CoastState::Water,
        };

        let result = synthesize_coastlines(
            vec![island],
            &[bounding_square()],
            &mut LogProgress::default(),
        );
        assert!(!result.iter().any(|coast| coast.id == 7));
    }

    #[test]
    fn crossing_coastline_splits_the_bounding_polygon() {
        // A coastline crossing the extent left to right, water below.
        let coastline = Coast {
            id: 9,
            is_area: false,
            front_node_id: 1,
            back_node_id: 2,
            points: vec![c(-2.0, 5.0), c(12.0, 5.0)],
            left: CoastState::Land,
            right: CoastState::Water,
        };

        let result = synthesize_coastlines(
            vec![coastline],
            &[bounding_square()],
            &mut LogProgress::default(),
        );

        // Two bounding polygon parts plus the clipped coastline itself.
        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|coast| !coast.is_area));
        assert!(result.iter().any(|coast| coast.id == 9));
        // The synthetic parts carry one water and one land side.
        let water_parts = result
            .iter()
            .filter(|coast| coast.id == 0 && coast.left == CoastState::Water)
            .count();
        let land_parts = result
            .iter()
            .filter(|coast| coast.id == 0 && coast.left == CoastState::Land)
            .count();
        assert_eq!(water_parts, 1);
        assert_eq!(land_parts, 1);
    }
}
