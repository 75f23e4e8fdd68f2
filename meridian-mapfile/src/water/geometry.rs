//! Segment intersection primitives for coastline processing.
//!
//! These deliberately treat shared endpoints as intersections and handle
//! collinear overlap, which the cell walk and island detection rely on.

use geo::{Coord, Rect, coord};

/// Squared distance in degree space. Only ever compared, never measured.
pub fn distance_square(a: Coord<f64>, b: Coord<f64>) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

fn bbox_of(a: Coord<f64>, b: Coord<f64>) -> Rect<f64> {
    Rect::new(a, b)
}

fn bbox_contains(bbox: &Rect<f64>, p: Coord<f64>) -> bool {
    p.x >= bbox.min().x && p.x <= bbox.max().x && p.y >= bbox.min().y && p.y <= bbox.max().y
}

fn bbox_overlap(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x && a.max().x >= b.min().x && a.min().y <= b.max().y
        && a.max().y >= b.min().y
}

/// Whether segments `a1-a2` and `b1-b2` intersect, endpoints included.
#[expect(clippy::float_cmp)]
#[expect(clippy::similar_names)]
pub fn lines_intersect(a1: Coord<f64>, a2: Coord<f64>, b1: Coord<f64>, b2: Coord<f64>) -> bool {
    if a1 == b1 || a1 == b2 || a2 == b1 || a2 == b2 {
        return true;
    }
    if a1 == a2 && b1 == b2 {
        // Two distinct zero-length segments cannot intersect.
        return false;
    }

    let denr = (b2.y - b1.y) * (a2.x - a1.x) - (b2.x - b1.x) * (a2.y - a1.y);
    let ua_numr = (b2.x - b1.x) * (a1.y - b1.y) - (b2.y - b1.y) * (a1.x - b1.x);
    let ub_numr = (a2.x - a1.x) * (a1.y - b1.y) - (a2.y - a1.y) * (a1.x - b1.x);

    if denr == 0.0 {
        if ua_numr == 0.0 && ub_numr == 0.0 {
            // Collinear: intersecting iff the segments overlap.
            let a_box = bbox_of(a1, a2);
            let b_box = bbox_of(b1, b2);
            return bbox_contains(&b_box, a1)
                || bbox_contains(&b_box, a2)
                || bbox_contains(&a_box, b1)
                || bbox_contains(&a_box, b2);
        }
        return false;
    }

    let ua = ua_numr / denr;
    let ub = ub_numr / denr;
    (0.0..=1.0).contains(&ua) && (0.0..=1.0).contains(&ub)
}

/// Computes the intersection point of two segments, endpoints included.
///
/// For collinear overlap an arbitrary endpoint within the overlap is
/// returned.
#[expect(clippy::float_cmp)]
#[expect(clippy::similar_names)]
pub fn line_intersection(
    a1: Coord<f64>,
    a2: Coord<f64>,
    b1: Coord<f64>,
    b2: Coord<f64>,
) -> Option<Coord<f64>> {
    if a1 == b1 || a1 == b2 {
        return Some(a1);
    }
    if a2 == b1 || a2 == b2 {
        return Some(a2);
    }
    if a1 == a2 && b1 == b2 {
        return None;
    }

    let denr = (b2.y - b1.y) * (a2.x - a1.x) - (b2.x - b1.x) * (a2.y - a1.y);
    let ua_numr = (b2.x - b1.x) * (a1.y - b1.y) - (b2.y - b1.y) * (a1.x - b1.x);
    let ub_numr = (a2.x - a1.x) * (a1.y - b1.y) - (a2.y - a1.y) * (a1.x - b1.x);

    if denr == 0.0 {
        if ua_numr == 0.0 && ub_numr == 0.0 {
            let a_box = bbox_of(a1, a2);
            let b_box = bbox_of(b1, b2);
            for candidate in [a1, a2] {
                if bbox_contains(&b_box, candidate) {
                    return Some(candidate);
                }
            }
            for candidate in [b1, b2] {
                if bbox_contains(&a_box, candidate) {
                    return Some(candidate);
                }
            }
        }
        return None;
    }

    let ua = ua_numr / denr;
    let ub = ub_numr / denr;
    if (0.0..=1.0).contains(&ua) && (0.0..=1.0).contains(&ub) {
        Some(coord! {
            x: a1.x + ua * (a2.x - a1.x),
            y: a1.y + ua * (a2.y - a1.y),
        })
    } else {
        None
    }
}

/// An intersection between two paths.
#[derive(Debug, Clone)]
pub struct PathIntersection {
    pub point: Coord<f64>,
    /// Index of the segment start on the first path.
    pub a_index: usize,
    /// Index of the segment start on the second path.
    pub b_index: usize,
    /// Sign of the cross product of the prolonged incoming and outgoing
    /// lines: positive when the first path crosses from right to left of
    /// the second.
    pub orientation: f64,
    pub a_distance_square: f64,
    pub b_distance_square: f64,
}

fn segment_bbox(path: &[Coord<f64>], from: usize, to: usize) -> Rect<f64> {
    let first = path[from % path.len()];
    let mut min = first;
    let mut max = first;
    for i in from..to {
        let p = path[i % path.len()];
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    }
    Rect::new(min, max)
}

/// Finds all intersections between two paths. Closed paths wrap around,
/// so the closing segment back to the first point is considered too.
pub fn find_path_intersections(
    a_path: &[Coord<f64>],
    b_path: &[Coord<f64>],
    a_closed: bool,
    b_closed: bool,
    intersections: &mut Vec<PathIntersection>,
) {
    if a_path.len() < 2 || b_path.len() < 2 {
        return;
    }
    // Bounds are inclusive segment-start indexes.
    let a_bound = if a_closed { a_path.len() } else { a_path.len() - 1 };
    let b_bound = if b_closed { b_path.len() } else { b_path.len() - 1 };

    let b_box = segment_bbox(b_path, 0, b_bound + 1);

    for a_index in 0..a_bound {
        let a1 = a_path[a_index % a_path.len()];
        let a2 = a_path[(a_index + 1) % a_path.len()];
        let a_line_box = bbox_of(a1, a2);
        if !bbox_overlap(&b_box, &a_line_box) {
            continue;
        }
        for b_index in 0..b_bound {
            let b1 = b_path[b_index % b_path.len()];
            let b2 = b_path[(b_index + 1) % b_path.len()];
            if !bbox_overlap(&a_line_box, &bbox_of(b1, b2)) {
                continue;
            }
            if let Some(point) = line_intersection(a1, a2, b1, b2) {
                // When the intersection falls on a segment endpoint the
                // plain cross product degenerates to zero, so both lines
                // are prolonged before taking the orientation.
                let point_before = coord! { x: a1.x - (a2.x - a1.x), y: a1.y - (a2.y - a1.y) };
                let point_after = coord! { x: b2.x + (b2.x - b1.x), y: b2.y + (b2.y - b1.y) };
                let orientation = (point.x - point_before.x) * (point_after.y - point.y)
                    - (point.y - point_before.y) * (point_after.x - point.x);

                intersections.push(PathIntersection {
                    point,
                    a_index,
                    b_index,
                    orientation,
                    a_distance_square: distance_square(a1, point),
                    b_distance_square: distance_square(b1, point),
                });
            }
        }
    }
}
