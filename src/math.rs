//! Integer & float geometry helpers shared by the contour builder, mesher & queries.
//!
//! All 2D predicates operate on the XZ-plane. The Y & W components of the
//! passed vectors are ignored.

use bevy::prelude::{IVec4, UVec4, Vec3};

/// Twice the signed area of the triangle ``(a, b, c)`` on the XZ-plane.
///
/// Positive when ``c`` is to the left of ``a -> b``.
#[inline]
pub(crate) fn area_2d_i(a: IVec4, b: IVec4, c: IVec4) -> i32 {
    (b.x - a.x) * (c.z - a.z) - (c.x - a.x) * (b.z - a.z)
}

#[inline]
pub(crate) fn left(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_2d_i(a, b, c) < 0
}

#[inline]
pub(crate) fn left_on(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_2d_i(a, b, c) <= 0
}

#[inline]
pub(crate) fn collinear(a: IVec4, b: IVec4, c: IVec4) -> bool {
    area_2d_i(a, b, c) == 0
}

/// True when ``a-b`` & ``c-d`` properly intersect, i.e. they cross at a point
/// interior to both. Shared endpoints & collinear overlaps don't count.
pub(crate) fn intersect_prop(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }

    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// True when ``c`` lies on the closed segment ``a-b``. Requires the three
/// points to be collinear.
fn between(a: IVec4, b: IVec4, c: IVec4) -> bool {
    if !collinear(a, b, c) {
        return false;
    }

    if a.x != b.x {
        (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x)
    } else {
        (a.z <= c.z && c.z <= b.z) || (a.z >= c.z && c.z >= b.z)
    }
}

/// True when segments ``a-b`` & ``c-d`` intersect, properly or improperly.
pub(crate) fn intersect(a: IVec4, b: IVec4, c: IVec4, d: IVec4) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

/// True when the diagonal from outline vertex ``i`` towards ``point`` stays
/// inside the cone formed by the vertex's two outline neighbours.
pub(crate) fn in_cone(i: usize, vertices: &[UVec4], point: UVec4) -> bool {
    let point_i = vertices[i].as_ivec4();
    let point_next = vertices[(i + 1) % vertices.len()].as_ivec4();
    let point_prev = vertices[(vertices.len() + i - 1) % vertices.len()].as_ivec4();
    let point = point.as_ivec4();

    if left_on(point_prev, point_i, point_next) {
        return left(point_i, point, point_prev) && left(point, point_i, point_next);
    }

    !(left_on(point_i, point, point_next) && left_on(point, point_i, point_prev))
}

/// Twice the signed area of the triangle ``(a, b, c)`` on the XZ-plane.
#[inline]
pub(crate) fn triangle_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let ab_x = b.x - a.x;
    let ab_z = b.z - a.z;

    let ac_x = c.x - a.x;
    let ac_z = c.z - a.z;

    ac_x * ab_z - ab_x * ac_z
}

/// Squared XZ distance from ``point`` to the segment ``a-b`` & the segment
/// parameter of the closest point.
pub(crate) fn distance_point_to_segment_2d(point: Vec3, a: Vec3, b: Vec3) -> (f32, f32) {
    let seg_x = b.x - a.x;
    let seg_z = b.z - a.z;

    let delta_x = point.x - a.x;
    let delta_z = point.z - a.z;

    let d = seg_x * seg_x + seg_z * seg_z;
    let mut t = seg_x * delta_x + seg_z * delta_z;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let delta_x = a.x + t * seg_x - point.x;
    let delta_z = a.z + t * seg_z - point.z;

    (delta_x * delta_x + delta_z * delta_z, t)
}

/// True when ``point`` is inside the convex or concave polygon described by
/// ``vertices`` on the XZ-plane, using the even-odd rule.
pub(crate) fn point_in_polygon_2d(point: Vec3, vertices: &[Vec3]) -> bool {
    let mut inside = false;

    for i in 0..vertices.len() {
        let a = vertices[i];
        let b = vertices[(vertices.len() + i - 1) % vertices.len()];

        if ((a.z > point.z) != (b.z > point.z))
            && (point.x < (b.x - a.x) * (point.z - a.z) / (b.z - a.z) + a.x)
        {
            inside = !inside;
        }
    }

    inside
}

/// Clips the segment ``start -> end`` against the convex polygon ``vertices``
/// on the XZ-plane.
///
/// Returns the entry & exit parameters along the segment & the polygon edges
/// crossed at each, or ``None`` when the segment misses the polygon entirely.
pub(crate) fn intersect_segment_polygon_2d(
    start: Vec3,
    end: Vec3,
    vertices: &[Vec3],
) -> Option<(f32, f32, Option<usize>, Option<usize>)> {
    const EPSILON: f32 = 0.000001;

    let mut t_min = 0.0;
    let mut t_max = 1.0;
    let mut segment_min = None;
    let mut segment_max = None;

    let direction = end - start;

    for i in 0..vertices.len() {
        let edge = vertices[(i + 1) % vertices.len()] - vertices[i];
        let to_start = start - vertices[i];

        let n = edge.z * to_start.x - edge.x * to_start.z;
        let d = direction.z * edge.x - direction.x * edge.z;

        if d.abs() < EPSILON {
            // Parallel to the edge, reject when outside of it.
            if n < 0.0 {
                return None;
            }
            continue;
        }

        let t = n / d;
        if d < 0.0 {
            // Entering the half-plane.
            if t > t_min {
                t_min = t;
                segment_min = Some(i);
                if t_min > t_max {
                    return None;
                }
            }
        } else {
            // Exiting the half-plane.
            if t < t_max {
                t_max = t;
                segment_max = Some(i);
                if t_max < t_min {
                    return None;
                }
            }
        }
    }

    Some((t_min, t_max, segment_min, segment_max))
}

/// Height of the triangle ``(a, b, c)`` at the XZ-position of ``point``, when
/// the point projects into the triangle.
pub(crate) fn closest_height_on_triangle(point: Vec3, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    const EPSILON: f32 = 1e-6;

    let v0 = c - a;
    let v1 = b - a;
    let v2 = point - a;

    let denominator = v0.x * v1.z - v0.z * v1.x;
    if denominator.abs() < EPSILON {
        return None;
    }

    let mut u = v1.z * v2.x - v1.x * v2.z;
    let mut v = v0.x * v2.z - v0.z * v2.x;

    if denominator < 0.0 {
        u = -u;
        v = -v;
    }

    let denominator = denominator.abs();
    if u >= 0.0 && v >= 0.0 && (u + v) <= denominator {
        Some(a.y + (v0.y * u + v1.y * v) / denominator)
    } else {
        None
    }
}

/// True when the convex XZ polygons ``a`` & ``b`` overlap (separating axis
/// over both edge sets).
pub(crate) fn overlap_polygons_2d(a: &[Vec3], b: &[Vec3]) -> bool {
    const EPSILON: f32 = 1e-4;

    for (polygon, other) in [(a, b), (b, a)] {
        for i in 0..polygon.len() {
            let va = polygon[i];
            let vb = polygon[(i + 1) % polygon.len()];

            // Edge normal on the XZ-plane.
            let normal = (vb.z - va.z, -(vb.x - va.x));

            let (a_min, a_max) = project_polygon_2d(normal, polygon);
            let (b_min, b_max) = project_polygon_2d(normal, other);

            if a_max + EPSILON < b_min || b_max + EPSILON < a_min {
                return false;
            }
        }
    }

    true
}

fn project_polygon_2d(axis: (f32, f32), vertices: &[Vec3]) -> (f32, f32) {
    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for vertex in vertices {
        let d = axis.0 * vertex.x + axis.1 * vertex.z;
        min = min.min(d);
        max = max.max(d);
    }

    (min, max)
}

/// Uniformly distributed point inside the convex XZ polygon ``vertices``,
/// driven by two random samples in ``[0, 1)``.
pub(crate) fn random_point_in_convex_polygon(vertices: &[Vec3], s: f32, t: f32) -> Vec3 {
    // Fan-triangulate & pick a triangle weighted by area, then sample it.
    let mut areas = Vec::with_capacity(vertices.len().saturating_sub(2));
    let mut total_area = 0.0;
    for i in 2..vertices.len() {
        let area = triangle_area_2d(vertices[0], vertices[i - 1], vertices[i]).abs() * 0.5;
        total_area += area;
        areas.push(area);
    }

    let threshold = s * total_area;
    let mut accumulated = 0.0;
    let mut triangle = vertices.len() - 1;
    for (i, area) in areas.iter().enumerate() {
        accumulated += area;
        if threshold <= accumulated {
            triangle = i + 2;
            break;
        }
    }

    let t = t.sqrt();
    let u = 1.0 - t;
    let v = (1.0 - s.fract()) * t;
    let w = 1.0 - u - v;

    vertices[0] * u + vertices[triangle - 1] * v + vertices[triangle] * w
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: i32, z: i32) -> IVec4 {
        IVec4::new(x, 0, z, 0)
    }

    #[test]
    fn left_turn_predicates() {
        assert!(left(v(0, 0), v(10, 0), v(5, -5)));
        assert!(!left(v(0, 0), v(10, 0), v(5, 5)));
        assert!(left_on(v(0, 0), v(10, 0), v(5, 0)));
        assert!(collinear(v(0, 0), v(10, 0), v(20, 0)));
    }

    #[test]
    fn segment_intersection() {
        assert!(intersect(v(0, 0), v(10, 10), v(0, 10), v(10, 0)));
        // Shared endpoint is an improper intersection.
        assert!(intersect(v(0, 0), v(10, 0), v(10, 0), v(10, 10)));
        assert!(!intersect_prop(v(0, 0), v(10, 0), v(10, 0), v(10, 10)));
        assert!(!intersect(v(0, 0), v(10, 0), v(0, 5), v(10, 5)));
    }

    #[test]
    fn segment_polygon_clipping() {
        let square = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 10.0),
            Vec3::new(10.0, 0.0, 10.0),
            Vec3::new(10.0, 0.0, 0.0),
        ];

        let (t_min, t_max, _, exit) = intersect_segment_polygon_2d(
            Vec3::new(5.0, 0.0, 5.0),
            Vec3::new(25.0, 0.0, 5.0),
            &square,
        )
        .unwrap();

        assert_eq!(t_min, 0.0);
        assert!((t_max - 0.25).abs() < 1e-5);
        assert!(exit.is_some());

        assert!(intersect_segment_polygon_2d(
            Vec3::new(20.0, 0.0, 20.0),
            Vec3::new(30.0, 0.0, 20.0),
            &square,
        )
        .is_none());
    }

    #[test]
    fn triangle_height_lookup() {
        let a = Vec3::new(0.0, 1.0, 0.0);
        let b = Vec3::new(10.0, 1.0, 0.0);
        let c = Vec3::new(0.0, 1.0, 10.0);

        let height = closest_height_on_triangle(Vec3::new(2.0, 5.0, 2.0), a, b, c);
        assert!((height.unwrap() - 1.0).abs() < 1e-5);

        assert!(closest_height_on_triangle(Vec3::new(20.0, 5.0, 20.0), a, b, c).is_none());
    }

    #[test]
    fn polygon_overlap() {
        let a = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 4.0),
            Vec3::new(4.0, 0.0, 0.0),
        ];
        let b: Vec<Vec3> = a.iter().map(|v| *v + Vec3::new(2.0, 0.0, 2.0)).collect();
        let c: Vec<Vec3> = a.iter().map(|v| *v + Vec3::new(10.0, 0.0, 0.0)).collect();

        assert!(overlap_polygons_2d(&a, &b));
        assert!(!overlap_polygons_2d(&a, &c));
    }
}
