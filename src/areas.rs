//! Marking areas of the open tile from world-space volumes.
//!
//! Used by the offline pipeline to paint surface types (water, roads, ...) and
//! by the tile cache to stamp obstacles back onto decompressed layers.

use bevy::prelude::{UVec2, Vec2, Vec3};

use crate::{get_neighbour_index, heightfields::OpenTile, Area, NavMeshSettings};

/// A world-space volume painting an area type onto the walkable surface
/// during tile builds.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaModifier {
    pub volume: AreaVolume,
    /// The area to paint. ``None`` erases walkability.
    pub area: Option<Area>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AreaVolume {
    Box {
        min: Vec3,
        max: Vec3,
    },
    /// Vertical cylinder; ``position`` is the center of its base.
    Cylinder {
        position: Vec3,
        radius: f32,
        height: f32,
    },
    /// Convex XZ outline (counter-clockwise) between two heights. See
    /// [convex_hull_2d] & [offset_polygon_2d] for authoring one from
    /// scattered points.
    ConvexPolygon {
        vertices: Vec<Vec2>,
        min_y: f32,
        max_y: f32,
    },
    OrientedBox {
        center: Vec3,
        half_extents: Vec3,
        y_rotation: f32,
    },
}

/// Applies every modifier to the tile, in order.
pub fn apply_area_modifiers(
    nav_mesh_settings: &NavMeshSettings,
    tile_coord: UVec2,
    modifiers: &[AreaModifier],
    open_tile: &mut OpenTile,
) {
    for modifier in modifiers {
        match &modifier.volume {
            AreaVolume::Box { min, max } => {
                mark_box_area(nav_mesh_settings, tile_coord, *min, *max, modifier.area, open_tile)
            }
            AreaVolume::Cylinder {
                position,
                radius,
                height,
            } => mark_cylinder_area(
                nav_mesh_settings,
                tile_coord,
                *position,
                *radius,
                *height,
                modifier.area,
                open_tile,
            ),
            AreaVolume::ConvexPolygon {
                vertices,
                min_y,
                max_y,
            } => mark_convex_polygon_area(
                nav_mesh_settings,
                tile_coord,
                vertices,
                *min_y,
                *max_y,
                modifier.area,
                open_tile,
            ),
            AreaVolume::OrientedBox {
                center,
                half_extents,
                y_rotation,
            } => mark_oriented_box_area(
                nav_mesh_settings,
                tile_coord,
                *center,
                *half_extents,
                *y_rotation,
                modifier.area,
                open_tile,
            ),
        }
    }
}

struct CellSpace {
    origin: Vec2,
    tile_side: usize,
}

impl CellSpace {
    fn new(nav_mesh_settings: &NavMeshSettings, tile_coord: UVec2) -> Self {
        Self {
            origin: nav_mesh_settings.get_tile_origin_with_border(tile_coord),
            tile_side: nav_mesh_settings.get_tile_side_with_border(),
        }
    }

    fn column_range(&self, nav_mesh_settings: &NavMeshSettings, min: f32, max: f32) -> (usize, usize) {
        let min = ((min - self.origin.x) / nav_mesh_settings.cell_width).floor() as i64;
        let max = ((max - self.origin.x) / nav_mesh_settings.cell_width).floor() as i64;

        (
            min.clamp(0, self.tile_side as i64 - 1) as usize,
            max.clamp(0, self.tile_side as i64 - 1) as usize,
        )
    }

    fn row_range(&self, nav_mesh_settings: &NavMeshSettings, min: f32, max: f32) -> (usize, usize) {
        let min = ((min - self.origin.y) / nav_mesh_settings.cell_width).floor() as i64;
        let max = ((max - self.origin.y) / nav_mesh_settings.cell_width).floor() as i64;

        (
            min.clamp(0, self.tile_side as i64 - 1) as usize,
            max.clamp(0, self.tile_side as i64 - 1) as usize,
        )
    }

    fn cell_center(&self, nav_mesh_settings: &NavMeshSettings, column: usize, row: usize) -> Vec2 {
        self.origin
            + Vec2::new(
                (column as f32 + 0.5) * nav_mesh_settings.cell_width,
                (row as f32 + 0.5) * nav_mesh_settings.cell_width,
            )
    }
}

fn span_height(nav_mesh_settings: &NavMeshSettings, span_min: u16) -> f32 {
    nav_mesh_settings.world_bottom_bound + f32::from(span_min) * nav_mesh_settings.cell_height
}

/// Sets ``area`` on every span whose floor lies inside the world-space box.
pub fn mark_box_area(
    nav_mesh_settings: &NavMeshSettings,
    tile_coord: UVec2,
    min: Vec3,
    max: Vec3,
    area: Option<Area>,
    open_tile: &mut OpenTile,
) {
    let space = CellSpace::new(nav_mesh_settings, tile_coord);
    let (column_min, column_max) = space.column_range(nav_mesh_settings, min.x, max.x);
    let (row_min, row_max) = space.row_range(nav_mesh_settings, min.z, max.z);

    for row in row_min..=row_max {
        for column in column_min..=column_max {
            let cell = &open_tile.cells[column + row * space.tile_side];

            for span in cell.spans.iter() {
                let height = span_height(nav_mesh_settings, span.min);
                if min.y <= height && height <= max.y {
                    open_tile.areas[span.tile_index] = area;
                }
            }
        }
    }
}

/// Sets ``area`` on every span whose floor lies inside the vertical cylinder.
/// ``position`` is the center of the cylinder's base.
pub fn mark_cylinder_area(
    nav_mesh_settings: &NavMeshSettings,
    tile_coord: UVec2,
    position: Vec3,
    radius: f32,
    height: f32,
    area: Option<Area>,
    open_tile: &mut OpenTile,
) {
    let space = CellSpace::new(nav_mesh_settings, tile_coord);

    // Expanded by half a cell so spans whose center is grazed still count.
    let expanded_radius = radius + nav_mesh_settings.cell_width * 0.5;
    let radius_squared = expanded_radius * expanded_radius;

    let (column_min, column_max) =
        space.column_range(nav_mesh_settings, position.x - radius, position.x + radius);
    let (row_min, row_max) =
        space.row_range(nav_mesh_settings, position.z - radius, position.z + radius);

    for row in row_min..=row_max {
        for column in column_min..=column_max {
            let center = space.cell_center(nav_mesh_settings, column, row);
            if center.distance_squared(Vec2::new(position.x, position.z)) > radius_squared {
                continue;
            }

            let cell = &open_tile.cells[column + row * space.tile_side];
            for span in cell.spans.iter() {
                let span_y = span_height(nav_mesh_settings, span.min);
                if position.y <= span_y && span_y <= position.y + height {
                    open_tile.areas[span.tile_index] = area;
                }
            }
        }
    }
}

/// Sets ``area`` on every span whose floor lies inside the convex polygon
/// (XZ vertices, counter-clockwise) between ``min_y`` & ``max_y``.
pub fn mark_convex_polygon_area(
    nav_mesh_settings: &NavMeshSettings,
    tile_coord: UVec2,
    vertices: &[Vec2],
    min_y: f32,
    max_y: f32,
    area: Option<Area>,
    open_tile: &mut OpenTile,
) {
    if vertices.len() < 3 {
        return;
    }

    let space = CellSpace::new(nav_mesh_settings, tile_coord);

    let mut min = vertices[0];
    let mut max = vertices[0];
    for vertex in vertices.iter().skip(1) {
        min = min.min(*vertex);
        max = max.max(*vertex);
    }

    let (column_min, column_max) = space.column_range(nav_mesh_settings, min.x, max.x);
    let (row_min, row_max) = space.row_range(nav_mesh_settings, min.y, max.y);

    for row in row_min..=row_max {
        for column in column_min..=column_max {
            let center = space.cell_center(nav_mesh_settings, column, row);
            if !point_in_convex_polygon(center, vertices) {
                continue;
            }

            let cell = &open_tile.cells[column + row * space.tile_side];
            for span in cell.spans.iter() {
                let span_y = span_height(nav_mesh_settings, span.min);
                if min_y <= span_y && span_y <= max_y {
                    open_tile.areas[span.tile_index] = area;
                }
            }
        }
    }
}

/// Sets ``area`` on every span whose floor lies inside the Y-rotated box.
pub fn mark_oriented_box_area(
    nav_mesh_settings: &NavMeshSettings,
    tile_coord: UVec2,
    center: Vec3,
    half_extents: Vec3,
    y_rotation: f32,
    area: Option<Area>,
    open_tile: &mut OpenTile,
) {
    let space = CellSpace::new(nav_mesh_settings, tile_coord);

    let (sin, cos) = y_rotation.sin_cos();

    // Conservative XZ bounds of the rotated footprint.
    let extent = half_extents.x.abs() * cos.abs()
        + half_extents.z.abs() * sin.abs()
        + half_extents.x.abs() * sin.abs()
        + half_extents.z.abs() * cos.abs();

    let (column_min, column_max) =
        space.column_range(nav_mesh_settings, center.x - extent, center.x + extent);
    let (row_min, row_max) =
        space.row_range(nav_mesh_settings, center.z - extent, center.z + extent);

    for row in row_min..=row_max {
        for column in column_min..=column_max {
            let cell_center = space.cell_center(nav_mesh_settings, column, row);

            // Rotate the cell into the box's local frame.
            let delta_x = cell_center.x - center.x;
            let delta_z = cell_center.y - center.z;
            let local_x = delta_x * cos + delta_z * sin;
            let local_z = -delta_x * sin + delta_z * cos;

            if local_x.abs() > half_extents.x || local_z.abs() > half_extents.z {
                continue;
            }

            let cell = &open_tile.cells[column + row * space.tile_side];
            for span in cell.spans.iter() {
                let span_y = span_height(nav_mesh_settings, span.min);
                if (span_y - center.y).abs() <= half_extents.y {
                    open_tile.areas[span.tile_index] = area;
                }
            }
        }
    }
}

/// Convex hull (gift wrapping) of a set of XZ points, counter-clockwise.
/// Useful for turning scattered marker points into a volume for
/// [mark_convex_polygon_area].
pub fn convex_hull_2d(points: &[Vec2]) -> Vec<Vec2> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let start = points
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (a.x, a.y).partial_cmp(&(b.x, b.y)).unwrap())
        .map(|(i, _)| i)
        .unwrap();

    let mut hull = Vec::new();
    let mut current = start;

    loop {
        hull.push(points[current]);

        let mut best = (current + 1) % points.len();
        for (candidate, point) in points.iter().enumerate() {
            if candidate == current {
                continue;
            }

            let edge = points[best] - points[current];
            let to_candidate = *point - points[current];
            let turn = edge.x * to_candidate.y - edge.y * to_candidate.x;

            // Keep the interior on the left so the winding matches the
            // marking volume test.
            if turn < 0.0
                || (turn == 0.0 && to_candidate.length_squared() > edge.length_squared())
            {
                best = candidate;
            }
        }

        current = best;
        if current == start || hull.len() > points.len() {
            break;
        }
    }

    hull
}

/// Offsets a convex XZ polygon outwards (positive) or inwards (negative)
/// with mitered corners. Useful for growing a marking volume by an agent
/// radius.
pub fn offset_polygon_2d(vertices: &[Vec2], offset: f32) -> Vec<Vec2> {
    let mut result = Vec::with_capacity(vertices.len());

    for i in 0..vertices.len() {
        let previous = vertices[(i + vertices.len() - 1) % vertices.len()];
        let current = vertices[i];
        let next = vertices[(i + 1) % vertices.len()];

        let direction_in = (current - previous).normalize_or_zero();
        let direction_out = (next - current).normalize_or_zero();

        // Outward normals of the two edges (polygon is counter-clockwise).
        let normal_in = Vec2::new(direction_in.y, -direction_in.x);
        let normal_out = Vec2::new(direction_out.y, -direction_out.x);

        let miter = (normal_in + normal_out).normalize_or_zero();
        let denominator = 1.0 + normal_in.dot(normal_out);
        let scale = if denominator.abs() < 1e-5 {
            1.0
        } else {
            (2.0 / denominator).sqrt()
        };

        result.push(current + miter * offset * scale);
    }

    result
}

fn point_in_convex_polygon(point: Vec2, vertices: &[Vec2]) -> bool {
    for i in 0..vertices.len() {
        let a = vertices[i];
        let b = vertices[(i + 1) % vertices.len()];

        let edge = b - a;
        let to_point = point - a;
        if edge.x * to_point.y - edge.y * to_point.x < 0.0 {
            return false;
        }
    }

    true
}

/// Replaces each walkable span's area with the median of its 3x3
/// neighbourhood. Removes single-cell speckles of one area inside another.
pub fn median_filter_walkable_area(open_tile: &mut OpenTile, nav_mesh_settings: &NavMeshSettings) {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    let mut filtered = open_tile.areas.clone();

    for (i, cell) in open_tile.cells.iter().enumerate() {
        for span in cell.spans.iter() {
            if open_tile.areas[span.tile_index].is_none() {
                continue;
            }

            let mut neighbourhood = [open_tile.areas[span.tile_index]; 9];
            let mut any_missing = false;

            for dir in 0..4 {
                let Some(index) = span.neighbours[dir] else {
                    any_missing = true;
                    continue;
                };

                let other_cell_index = get_neighbour_index(tile_side, i, dir);
                let other_span = &open_tile.cells[other_cell_index].spans[index as usize];
                neighbourhood[dir * 2] = open_tile.areas[other_span.tile_index];

                let next_dir = (dir + 1) & 0x3;
                let Some(index) = other_span.neighbours[next_dir] else {
                    continue;
                };

                let diagonal_cell_index = get_neighbour_index(tile_side, other_cell_index, next_dir);
                let diagonal_span = &open_tile.cells[diagonal_cell_index].spans[index as usize];
                neighbourhood[dir * 2 + 1] = open_tile.areas[diagonal_span.tile_index];
            }

            // Only filter spans fully surrounded by walkable cells.
            if any_missing || neighbourhood.iter().any(|area| area.is_none()) {
                continue;
            }

            neighbourhood.sort_unstable();
            filtered[span.tile_index] = neighbourhood[4];
        }
    }

    open_tile.areas = filtered;
}

#[cfg(test)]
mod tests {
    use bevy::prelude::{Transform, UVec2, Vec3};

    use super::*;
    use crate::conversion::{GeometryCollection, Triangles};
    use crate::heightfields::{build_heightfield_tile, build_open_heightfield_tile};

    #[test]
    fn cylinder_marks_spans_under_it() {
        let settings = crate::NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 50.0, 0.0)
            .with_cell_size(1.0, 0.5)
            .with_walkable_radius(1)
            .with_step_height(1);

        let tile_coord = UVec2::new(5, 5);
        let origin = settings.get_tile_origin_with_border(tile_coord);
        let offset = Vec3::new(origin.x, 0.0, origin.y);

        let floor = GeometryCollection::new(
            Transform::IDENTITY,
            Triangles::TriMesh(
                Box::new([
                    offset + Vec3::new(0.0, 1.0, 0.0),
                    offset + Vec3::new(10.0, 1.0, 0.0),
                    offset + Vec3::new(10.0, 1.0, 10.0),
                    offset + Vec3::new(0.0, 1.0, 10.0),
                ]),
                Box::new([[0, 2, 1], [0, 3, 2]]),
            ),
        );

        let voxelized = build_heightfield_tile(tile_coord, &[floor], &settings);
        let mut open_tile = build_open_heightfield_tile(&voxelized, &settings);

        let marked_before = open_tile
            .areas
            .iter()
            .filter(|area| area.is_none())
            .count();

        mark_cylinder_area(
            &settings,
            tile_coord,
            offset + Vec3::new(5.0, 0.0, 5.0),
            2.0,
            3.0,
            None,
            &mut open_tile,
        );

        let marked_after = open_tile
            .areas
            .iter()
            .filter(|area| area.is_none())
            .count();

        assert!(marked_after > marked_before);
    }

    #[test]
    fn median_filter_removes_single_cell_speckles() {
        let settings = crate::NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 50.0, 0.0)
            .with_cell_size(1.0, 0.5)
            .with_walkable_radius(1)
            .with_step_height(1);

        let tile_coord = UVec2::new(5, 5);
        let origin = settings.get_tile_origin_with_border(tile_coord);
        let offset = Vec3::new(origin.x, 0.0, origin.y);

        let floor = GeometryCollection::new(
            Transform::IDENTITY,
            Triangles::TriMesh(
                Box::new([
                    offset + Vec3::new(0.0, 1.0, 0.0),
                    offset + Vec3::new(10.0, 1.0, 0.0),
                    offset + Vec3::new(10.0, 1.0, 10.0),
                    offset + Vec3::new(0.0, 1.0, 10.0),
                ]),
                Box::new([[0, 2, 1], [0, 3, 2]]),
            ),
        );

        let voxelized = build_heightfield_tile(tile_coord, &[floor], &settings);
        let mut open_tile = build_open_heightfield_tile(&voxelized, &settings);

        // A lone cell tagged differently in the middle of the floor.
        mark_box_area(
            &settings,
            tile_coord,
            offset + Vec3::new(5.1, 0.0, 5.1),
            offset + Vec3::new(5.9, 2.0, 5.9),
            Some(Area(5)),
            &mut open_tile,
        );
        assert!(open_tile.areas.iter().any(|area| *area == Some(Area(5))));

        median_filter_walkable_area(&mut open_tile, &settings);

        assert!(
            !open_tile.areas.iter().any(|area| *area == Some(Area(5))),
            "a single-cell speckle must not survive the median filter"
        );
    }

    #[test]
    fn convex_modifier_marks_hulled_points() {
        let settings = crate::NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 50.0, 0.0)
            .with_cell_size(1.0, 0.5)
            .with_walkable_radius(1)
            .with_step_height(1);

        let tile_coord = UVec2::new(5, 5);
        let origin = settings.get_tile_origin_with_border(tile_coord);
        let offset = Vec3::new(origin.x, 0.0, origin.y);

        let floor = GeometryCollection::new(
            Transform::IDENTITY,
            Triangles::TriMesh(
                Box::new([
                    offset + Vec3::new(0.0, 1.0, 0.0),
                    offset + Vec3::new(12.0, 1.0, 0.0),
                    offset + Vec3::new(12.0, 1.0, 12.0),
                    offset + Vec3::new(0.0, 1.0, 12.0),
                ]),
                Box::new([[0, 2, 1], [0, 3, 2]]),
            ),
        );

        let voxelized = build_heightfield_tile(tile_coord, &[floor], &settings);
        let mut open_tile = build_open_heightfield_tile(&voxelized, &settings);

        // Author the volume from scattered points, grown by half a cell.
        let hull = convex_hull_2d(&[
            Vec2::new(origin.x + 4.0, origin.y + 4.0),
            Vec2::new(origin.x + 8.0, origin.y + 4.5),
            Vec2::new(origin.x + 7.5, origin.y + 8.0),
            Vec2::new(origin.x + 4.5, origin.y + 7.5),
            Vec2::new(origin.x + 6.0, origin.y + 6.0),
        ]);
        assert_eq!(hull.len(), 4, "the interior point must drop out");

        apply_area_modifiers(
            &settings,
            tile_coord,
            &[AreaModifier {
                volume: AreaVolume::ConvexPolygon {
                    vertices: offset_polygon_2d(&hull, 0.5),
                    min_y: 0.0,
                    max_y: 3.0,
                },
                area: Some(Area(3)),
            }],
            &mut open_tile,
        );

        assert!(open_tile.areas.iter().any(|area| *area == Some(Area(3))));
        assert!(open_tile.areas.iter().any(|area| *area == Some(Area(0))));
    }
}
