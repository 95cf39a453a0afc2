use bevy::{
    math::{U16Vec2, U16Vec3, UVec3, Vec3, Vec3Swizzles},
    prelude::UVec2,
};

#[cfg(feature = "trace")]
use bevy::log::info_span;

use crate::{
    get_neighbour_index,
    heightfields::OpenTile,
    math::{
        closest_height_on_triangle, distance_point_to_segment_2d, point_in_polygon_2d,
        triangle_area_2d,
    },
    mesher::{count_polygon_vertices, PolyMesh},
    NavMeshSettings,
};

/// Per-polygon height-sampled triangulation of the walkable surface.
///
/// Triangle indices below the owning polygon's vertex count refer to the
/// polygon's own vertices; higher indices refer into [Self::vertices] offset
/// by the record's vertex base.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct PolyMeshDetail {
    /// One record per polygon: ``[vertex_base, vertex_count, triangle_base, triangle_count]``.
    pub meshes: Vec<[u32; 4]>,
    /// Additional surface-sampled vertices in world space.
    pub vertices: Vec<Vec3>,
    /// ``[a, b, c, edge_flags]``. Two bits per edge; bit set when the edge
    /// lies on the owning polygon's outline.
    pub triangles: Vec<[u8; 4]>,
}

#[derive(Debug)]
struct HeightPatch {
    min_x: u16,
    min_y: u16,
    width: u16,
    height: u16,

    /// Heights of the area covered by the patch extracted from the open tile.
    heights: Vec<u16>,
}

impl HeightPatch {
    fn get(&self, x: u16, z: u16) -> Option<u16> {
        (x < self.width && z < self.height)
            .then(|| self.heights[usize::from(x) + usize::from(z) * usize::from(self.width)])
            .filter(|height| *height != u16::MAX)
    }

    /// Height stored at or near the cell, searching outward ring by ring &
    /// preferring the height closest to ``y``. Cells outside the patch clamp
    /// to its border.
    fn height_near(&self, x: u32, y: u32, z: u32, search_radius: u16) -> u16 {
        let center_x = x
            .saturating_sub(u32::from(self.min_x))
            .min(u32::from(self.width.saturating_sub(1))) as i32;
        let center_z = z
            .saturating_sub(u32::from(self.min_y))
            .min(u32::from(self.height.saturating_sub(1))) as i32;

        if let Some(height) = self.get(center_x as u16, center_z as u16) {
            return height;
        }

        for ring in 1..=i32::from(search_radius) {
            let mut best: Option<(u32, u16)> = None;

            let mut consider = |cell_x: i32, cell_z: i32| {
                if cell_x < 0 || cell_z < 0 {
                    return;
                }
                if let Some(height) = self.get(cell_x as u16, cell_z as u16) {
                    let delta = u32::from(height).abs_diff(y);
                    if best.is_none_or(|(best_delta, _)| delta < best_delta) {
                        best = Some((delta, height));
                    }
                }
            };

            for cell_x in center_x - ring..=center_x + ring {
                consider(cell_x, center_z - ring);
                consider(cell_x, center_z + ring);
            }
            for cell_z in center_z - ring + 1..center_z + ring {
                consider(center_x - ring, cell_z);
                consider(center_x + ring, cell_z);
            }

            if let Some((_, height)) = best {
                return height;
            }
        }

        0
    }
}

const MAX_VERTS: usize = 127;
const MAX_VERTS_PER_EDGE: usize = 32;

/// Builds the detail mesh for every polygon of the mesh. Returns ``None``
/// when detail generation is disabled in the settings.
pub fn build_poly_mesh_detail(
    nav_mesh_settings: &NavMeshSettings,
    open_tile: &OpenTile,
    poly_mesh: &PolyMesh,
    tile_coord: UVec2,
) -> Option<PolyMeshDetail> {
    let detail_settings = nav_mesh_settings.detail_mesh_generation.as_ref()?;

    #[cfg(feature = "trace")]
    let _span = info_span!("Build Detail Mesh").entered();

    let tile_width = nav_mesh_settings.tile_width.get();
    let mut max_bounds = U16Vec2::ZERO;

    let polygon_bounds = poly_mesh
        .polygons
        .iter()
        .map(|polygon| {
            let mut min = U16Vec2::splat(tile_width);
            let mut max = U16Vec2::ZERO;

            for i in &polygon[..count_polygon_vertices(polygon)] {
                let vertex = poly_mesh.vertices[*i as usize];
                let vertex = U16Vec2::new(vertex.x as u16, vertex.z as u16);

                min = min.min(vertex);
                max = max.max(vertex);
            }

            min = min.saturating_sub(U16Vec2::ONE);
            max = (max + U16Vec2::ONE).min(U16Vec2::splat(tile_width));

            max_bounds = max_bounds.max(max.saturating_sub(min) + U16Vec2::ONE);

            (min, max)
        })
        .collect::<Vec<_>>();

    let mut height_patch = HeightPatch {
        min_x: 0,
        min_y: 0,
        width: 0,
        height: 0,
        heights: vec![0u16; usize::from(max_bounds.x) * usize::from(max_bounds.y)],
    };

    let mut detail = PolyMeshDetail {
        meshes: Vec::with_capacity(poly_mesh.polygons.len()),
        vertices: Vec::new(),
        triangles: Vec::new(),
    };

    let tile_origin = nav_mesh_settings.get_tile_origin(tile_coord);

    let mut polygon_vertices = Vec::with_capacity(crate::mesher::MAX_VERTICES_PER_POLYGON);
    let mut triangles = Vec::with_capacity(512);
    let mut samples = Vec::with_capacity(512);
    let mut verts = Vec::with_capacity(256);
    let mut queue = Vec::with_capacity(512);

    for ((polygon, (min, max)), region) in poly_mesh
        .polygons
        .iter()
        .zip(polygon_bounds.iter())
        .zip(poly_mesh.regions.iter())
    {
        polygon_vertices.clear();
        polygon_vertices.extend(polygon[..count_polygon_vertices(polygon)].iter().map(|i| {
            let vertex = poly_mesh.vertices[*i as usize];
            U16Vec3::new(vertex.x as u16, vertex.y as u16, vertex.z as u16)
        }));

        height_patch.min_x = min.x;
        height_patch.min_y = min.y;
        height_patch.width = max.x.saturating_sub(min.x);
        height_patch.height = max.y.saturating_sub(min.y);

        extract_height_data(
            nav_mesh_settings,
            open_tile,
            &polygon_vertices,
            *region,
            &mut height_patch,
            &mut queue,
        );

        if !build_poly_detail(
            &height_patch,
            &polygon_vertices,
            u32::from(detail_settings.sample_step.get()),
            &mut verts,
            &mut triangles,
            &mut samples,
            f32::from(detail_settings.max_height_error.get()),
            3,
        ) {
            return None;
        }

        // Emit the record. Only vertices beyond the polygon's own corners go
        // into the shared vertex array.
        let polygon_vertex_count = polygon_vertices.len();
        let vertex_base = detail.vertices.len() as u32;
        let triangle_base = detail.triangles.len() as u32;

        detail.vertices.extend(verts.iter().skip(polygon_vertex_count).map(|vertex| {
            Vec3::new(
                tile_origin.x + f32::from(vertex.x) * nav_mesh_settings.cell_width,
                nav_mesh_settings.world_bottom_bound
                    + f32::from(vertex.y) * nav_mesh_settings.cell_height,
                tile_origin.y + f32::from(vertex.z) * nav_mesh_settings.cell_width,
            )
        }));

        for triangle in triangles.iter() {
            let [a, b, c] = *triangle;
            let flags = get_edge_flags(&verts, a, b, polygon_vertex_count)
                | get_edge_flags(&verts, b, c, polygon_vertex_count) << 2
                | get_edge_flags(&verts, c, a, polygon_vertex_count) << 4;

            detail
                .triangles
                .push([a as u8, b as u8, c as u8, flags]);
        }

        detail.meshes.push([
            vertex_base,
            (verts.len() - polygon_vertex_count) as u32,
            triangle_base,
            triangles.len() as u32,
        ]);
    }

    Some(detail)
}

/// A detail triangle edge is a boundary edge when both endpoints lie on the
/// polygon outline (corner indices, or edge samples inserted between them).
fn get_edge_flags(verts: &[U16Vec3], a: u32, b: u32, polygon_vertex_count: usize) -> u8 {
    const THRESHOLD: f32 = 0.001;

    let va = verts[a as usize].as_vec3();
    let vb = verts[b as usize].as_vec3();

    for i in 0..polygon_vertex_count {
        let j = (i + polygon_vertex_count - 1) % polygon_vertex_count;
        let corner_a = verts[j].as_vec3();
        let corner_b = verts[i].as_vec3();

        if distance_point_to_segment_2d(va, corner_a, corner_b).0 < THRESHOLD
            && distance_point_to_segment_2d(vb, corner_a, corner_b).0 < THRESHOLD
        {
            return 1;
        }
    }

    0
}

fn extract_height_data(
    nav_mesh_settings: &NavMeshSettings,
    open_tile: &OpenTile,
    polygon_vertices: &[U16Vec3],
    region: u16,
    height_patch: &mut HeightPatch,
    queue: &mut Vec<(usize, usize)>,
) {
    queue.clear();

    height_patch.heights.fill(u16::MAX);

    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let height_patch_width = usize::from(height_patch.width);

    let mut empty = true;
    for y in 0..height_patch.height {
        // Including walkable radius because it acts as a buffer zone around
        // the tile but this is not included in the poly mesh.
        let cell_y = y + height_patch.min_y + nav_mesh_settings.walkable_radius;

        for x in 0..height_patch.width {
            let cell_x = x + height_patch.min_x + nav_mesh_settings.walkable_radius;
            let cell_i = usize::from(cell_x) + usize::from(cell_y) * tile_side;
            let cell = &open_tile.cells[cell_i];

            for (span_i, span) in cell.spans.iter().enumerate() {
                if span.region == region {
                    height_patch.heights[usize::from(x) + usize::from(y) * height_patch_width] =
                        span.min;
                    empty = false;

                    let border = span
                        .neighbours
                        .iter()
                        .enumerate()
                        .filter_map(|(i, neighbour)| Some(i).zip(*neighbour))
                        .any(|(i, neighbour)| {
                            let neighbour_i = get_neighbour_index(tile_side, cell_i, i);

                            open_tile.cells[neighbour_i].spans[neighbour as usize].region != region
                        });

                    if border {
                        queue.push((cell_i, span_i));
                    }
                    break;
                }
            }
        }
    }

    // If no seed points were found, fall back to the polygon center.
    if empty {
        seed_array_with_poly_center(
            open_tile,
            polygon_vertices,
            nav_mesh_settings,
            queue,
            height_patch,
        );
    }

    // If we go over this, we clear out the first retract_size elements in the queue.
    let retract_size = 256;
    let mut head = 0;

    while head < queue.len() {
        let (cell_i, span_i) = queue[head];

        head += 1;

        if head >= retract_size {
            queue.drain(..retract_size);
            head = 0;
        }

        let open_cell = &open_tile.cells[cell_i];
        let open_span = &open_cell.spans[span_i];

        for (i, neighbour) in open_span
            .neighbours
            .iter()
            .enumerate()
            .filter_map(|(i, neighbour)| Some(i).zip(*neighbour))
        {
            let neighbour_i = get_neighbour_index(tile_side, cell_i, i);

            let x = neighbour_i % tile_side;
            let y = neighbour_i / tile_side;

            let height_patch_x = x as isize
                - height_patch.min_x as isize
                - nav_mesh_settings.walkable_radius as isize;
            let height_patch_y = y as isize
                - height_patch.min_y as isize
                - nav_mesh_settings.walkable_radius as isize;

            if height_patch_x < 0
                || height_patch_y < 0
                || height_patch_y >= height_patch.height as isize
                || height_patch_x >= height_patch.width as isize
            {
                continue;
            }

            if height_patch.heights
                [height_patch_x as usize + height_patch_y as usize * height_patch_width]
                != u16::MAX
            {
                continue;
            }

            let neighbour_span = &open_tile.cells[neighbour_i].spans[neighbour as usize];

            height_patch.heights
                [height_patch_x as usize + height_patch_y as usize * height_patch_width] =
                neighbour_span.min;

            queue.push((neighbour_i, neighbour as usize));
        }
    }
}

fn seed_array_with_poly_center(
    open_tile: &OpenTile,
    vertices: &[U16Vec3],
    nav_mesh_settings: &NavMeshSettings,
    queue: &mut Vec<(usize, usize)>,
    height_patch: &mut HeightPatch,
) {
    const OFFSETS: [(i16, i16); 9] = [
        (0, 0),
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let mut start_cell = None;
    let mut span_height_distance_to_vertex = u16::MAX;

    let min_x = height_patch.min_x;
    let max_x = height_patch.min_x + height_patch.width;

    let min_y = height_patch.min_y;
    let max_y = height_patch.min_y + height_patch.height;

    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    for &vertex in vertices {
        for &(offset_x, offset_y) in &OFFSETS {
            let ax = vertex.x.saturating_add_signed(offset_x);
            let ay = vertex.y;
            let az = vertex.z.saturating_add_signed(offset_y);

            if ax < min_x || ax >= max_x || az < min_y || az >= max_y {
                continue;
            }

            let cell_i = usize::from(ax + nav_mesh_settings.walkable_radius)
                + usize::from(az + nav_mesh_settings.walkable_radius) * tile_side;
            let cell = &open_tile.cells[cell_i];
            for (span_i, open_span) in cell.spans.iter().enumerate() {
                let height_difference = ay.abs_diff(open_span.min);
                if height_difference < span_height_distance_to_vertex {
                    start_cell = Some((cell_i, span_i));
                    span_height_distance_to_vertex = height_difference;

                    if span_height_distance_to_vertex == 0 {
                        break;
                    }
                }
            }

            if span_height_distance_to_vertex == 0 {
                break;
            }
        }

        if span_height_distance_to_vertex == 0 {
            break;
        }
    }

    let Some(start_cell) = start_cell else {
        return;
    };

    queue.clear();
    queue.push(start_cell);
}

/// Squared distance from ``point`` to the 3D segment ``a-b``.
fn segment_deviation(point: Vec3, a: Vec3, b: Vec3) -> f32 {
    let direction = b - a;
    let length_squared = direction.length_squared();
    let t = if length_squared > 0.0 {
        ((point - a).dot(direction) / length_squared).clamp(0.0, 1.0)
    } else {
        0.0
    };

    point.distance_squared(a + direction * t)
}

#[allow(clippy::too_many_arguments)]
fn build_poly_detail(
    height_patch: &HeightPatch,
    // Vertices of the polygon we are currently building detail for.
    poly: &[U16Vec3],
    sample_distance: u32,
    verts: &mut Vec<U16Vec3>,
    triangles: &mut Vec<[u32; 3]>,
    samples: &mut Vec<U16Vec3>,
    sample_max_error: f32,
    search_radius: u16,
) -> bool {
    let mut edge = [U16Vec3::ZERO; MAX_VERTS_PER_EDGE + 1];
    let mut hull = Vec::with_capacity(MAX_VERTS);

    verts.clear();
    verts.extend(poly.iter().cloned());
    triangles.clear();
    samples.clear();

    let min_extent = polygon_min_extent(verts);

    // Tesselate outlines.
    if sample_distance > 0 {
        for i in 0..poly.len() {
            let j = (i + poly.len() - 1) % poly.len();
            let mut vertex_j = poly[j];
            let mut vertex_i = poly[i];
            let mut swapped = false;

            if vertex_j.x.abs_diff(vertex_i.x) == 0 {
                if vertex_j.z > vertex_i.z {
                    std::mem::swap(&mut vertex_j, &mut vertex_i);
                    swapped = true;
                }
            } else if vertex_j.x > vertex_i.x {
                std::mem::swap(&mut vertex_j, &mut vertex_i);
                swapped = true;
            }

            let delta = vertex_i.as_vec3() - vertex_j.as_vec3();
            let d = (delta.x * delta.x + delta.z * delta.z).sqrt();

            let mut nn =
                (1 + (d / sample_distance as f32).floor() as usize).min(MAX_VERTS_PER_EDGE - 1);
            if verts.len() + nn >= MAX_VERTS {
                nn = (MAX_VERTS - 1).saturating_sub(verts.len());
            }

            for k in 0..=nn {
                let t = k as f32 / nn as f32;
                let mut pos = vertex_j
                    .as_vec3()
                    .lerp(vertex_i.as_vec3(), t)
                    .floor()
                    .as_uvec3();
                pos.y = u32::from(height_patch.height_near(pos.x, pos.y, pos.z, search_radius));

                edge[k] = pos.as_u16vec3();
            }

            // Simplify samples.
            let mut idx = vec![0, nn];
            let mut k = 0;
            while k < idx.len() - 1 {
                let a = idx[k];
                let b = idx[k + 1];
                let vertex_a = edge[a];
                let vertex_b = edge[b];

                // Find maximum deviation along the segment.
                let mut max_dev = 0.0;
                let mut max_i = None;
                for m in a + 1..b {
                    let dev =
                        segment_deviation(edge[m].as_vec3(), vertex_a.as_vec3(), vertex_b.as_vec3());
                    if dev > max_dev {
                        max_dev = dev;
                        max_i = Some(m);
                    }
                }

                // Add new point if deviation is greater than sample_max_error.
                if let Some(max_i) = max_i {
                    if max_dev > sample_max_error * sample_max_error {
                        idx.insert(k + 1, max_i);
                    } else {
                        k += 1;
                    }
                } else {
                    k += 1;
                }
            }

            // Record the hull.
            hull.push(j);

            // Add new vertices.
            if swapped {
                for &k in idx.iter().rev().skip(1).take(idx.len() - 2) {
                    verts.push(edge[k]);
                    hull.push(verts.len() - 1);
                }
            } else {
                for &k in idx.iter().skip(1).take(idx.len() - 2) {
                    verts.push(edge[k]);
                    hull.push(verts.len() - 1);
                }
            }
        }
    }

    if hull.is_empty() {
        hull.extend(0..poly.len());
    }

    triangulate_hull(verts, &hull, triangles);

    if min_extent < (sample_distance * 2) as f32 || triangles.is_empty() {
        return true;
    }

    if sample_distance > 0 {
        let mut min_bounds = poly[0];
        let mut max_bounds = poly[0];

        for vertex in poly.iter().skip(1) {
            min_bounds = min_bounds.min(*vertex);
            max_bounds = max_bounds.max(*vertex);
        }
        let y = ((max_bounds.y as f32 + min_bounds.y as f32) * 0.5).floor() as u16;

        let outline: Vec<Vec3> = poly.iter().map(|vertex| vertex.as_vec3()).collect();

        for z in (min_bounds.z..max_bounds.z).step_by(sample_distance as usize) {
            for x in (min_bounds.x..max_bounds.x).step_by(sample_distance as usize) {
                let point = U16Vec3::new(x, y, z);

                // Make sure the samples are not too close to the edges.
                if signed_distance_to_polygon(point.as_vec3(), &outline)
                    > -(sample_distance as f32) / 2.0
                {
                    continue;
                }

                let y = height_patch.height_near(
                    point.x.into(),
                    point.y.into(),
                    point.z.into(),
                    search_radius,
                );

                samples.push(point.with_y(y));
            }
        }

        // Make sure there is at least one sample at the center of the polygon.
        if samples.is_empty() {
            let point_center = poly
                .iter()
                .fold(UVec3::ZERO, |acc, entry| acc + entry.as_uvec3())
                / poly.len() as u32;

            let y = height_patch.height_near(
                point_center.x,
                point_center.y,
                point_center.z,
                search_radius,
            );

            samples.push(point_center.as_u16vec3().with_y(y));
        }

        // Find and add samples with the largest errors.
        let nsamples = samples.len();
        for _ in 0..nsamples {
            if verts.len() >= MAX_VERTS {
                break;
            }

            // Find the sample with the most error.
            let mut best_point = U16Vec3::ZERO;
            let mut best_distance = 0.0;
            let mut best_i = None;

            for (i, sample) in samples.iter().enumerate() {
                let Some(d) = sample_error(sample.as_vec3(), verts, triangles) else {
                    continue;
                };

                if d > best_distance {
                    best_distance = d;
                    best_i = Some(i);
                    best_point = *sample;
                }
            }

            // Stop tessellating if error is within the threshold or no sample found.
            if best_distance <= sample_max_error {
                break;
            }
            let Some(best_i) = best_i else {
                break;
            };

            samples.swap_remove(best_i);

            // Add the new sample point to verts.
            verts.push(best_point);

            // Rebuild the triangulation around the new vertex.
            *triangles = delaunay_triangulation(verts, &hull);
        }
    }

    // If we failed to add more points, let's just triangulate with the hull again.
    if triangles.is_empty() {
        triangulate_hull(verts, &hull, triangles);
    }

    true
}

/// Signed XZ distance from ``point`` to the polygon outline; negative when
/// the point lies inside.
fn signed_distance_to_polygon(point: Vec3, outline: &[Vec3]) -> f32 {
    let edge_distance = (0..outline.len())
        .map(|i| {
            let a = outline[i];
            let b = outline[(i + 1) % outline.len()];
            distance_point_to_segment_2d(point, a, b).0
        })
        .fold(f32::MAX, f32::min)
        .sqrt();

    if point_in_polygon_2d(point, outline) {
        -edge_distance
    } else {
        edge_distance
    }
}

/// Vertical error of ``point`` against the current triangulation. ``None``
/// when the point projects outside every triangle.
fn sample_error(point: Vec3, vertices: &[U16Vec3], triangles: &[[u32; 3]]) -> Option<f32> {
    triangles
        .iter()
        .filter_map(|[a, b, c]| {
            closest_height_on_triangle(
                point,
                vertices[*a as usize].as_vec3(),
                vertices[*b as usize].as_vec3(),
                vertices[*c as usize].as_vec3(),
            )
        })
        .map(|height| (height - point.y).abs())
        .reduce(f32::min)
}

/// Collinear corners carry no surface; clipping them is deferred until only
/// they remain.
const DEGENERATE_DIAGONAL_PENALTY: f32 = 1e9;

/// Triangulates the hull outline by repeatedly clipping the corner whose
/// diagonal is shortest. The outline is convex apart from collinear edge
/// samples, so every corner is clippable.
fn triangulate_hull(vertices: &[U16Vec3], hull: &[usize], triangles: &mut Vec<[u32; 3]>) {
    if hull.len() < 3 {
        return;
    }

    let mut ring: Vec<usize> = hull.to_vec();

    while ring.len() > 3 {
        let mut best_corner = 0;
        let mut best_diagonal = f32::MAX;

        for corner in 0..ring.len() {
            let previous = vertices[ring[(corner + ring.len() - 1) % ring.len()]].as_vec3();
            let current = vertices[ring[corner]].as_vec3();
            let next = vertices[ring[(corner + 1) % ring.len()]].as_vec3();

            let mut diagonal = previous.xz().distance_squared(next.xz());
            if triangle_area_2d(previous, current, next).abs() < 1e-6 {
                diagonal += DEGENERATE_DIAGONAL_PENALTY;
            }

            if diagonal < best_diagonal {
                best_diagonal = diagonal;
                best_corner = corner;
            }
        }

        let previous = ring[(best_corner + ring.len() - 1) % ring.len()];
        let next = ring[(best_corner + 1) % ring.len()];
        triangles.push([previous as u32, ring[best_corner] as u32, next as u32]);

        ring.remove(best_corner);
    }

    triangles.push([ring[0] as u32, ring[1] as u32, ring[2] as u32]);
}

/// One edge of the growing triangulation, tracking whether the triangle on
/// each side of ``a -> b`` has been built yet.
#[derive(Clone, Copy)]
struct FacetEdge {
    a: u32,
    b: u32,
    positive_done: bool,
    negative_done: bool,
}

/// Delaunay triangulation of the sample points, grown inwards from the hull
/// outline. Every open edge side is completed with the point subtending the
/// largest angle, which keeps circumcircles empty.
fn delaunay_triangulation(vertices: &[U16Vec3], hull: &[usize]) -> Vec<[u32; 3]> {
    let mut triangles = Vec::with_capacity(vertices.len() * 2);
    if hull.len() < 3 {
        return triangles;
    }

    // Which side of the hull edges faces inwards depends on the outline's
    // winding.
    let mut winding = 0.0;
    for i in 2..hull.len() {
        winding += triangle_area_2d(
            vertices[hull[0]].as_vec3(),
            vertices[hull[i - 1]].as_vec3(),
            vertices[hull[i]].as_vec3(),
        );
    }
    let interior_positive = winding > 0.0;

    let mut edges: Vec<FacetEdge> = Vec::with_capacity(vertices.len() * 3);
    for i in 0..hull.len() {
        edges.push(FacetEdge {
            a: hull[i] as u32,
            b: hull[(i + 1) % hull.len()] as u32,
            // The outside of the hull never receives triangles.
            positive_done: !interior_positive,
            negative_done: interior_positive,
        });
    }

    let mut head = 0;
    while head < edges.len() {
        if !edges[head].positive_done {
            complete_edge_side(vertices, &mut edges, &mut triangles, head, true);
        }
        if !edges[head].negative_done {
            complete_edge_side(vertices, &mut edges, &mut triangles, head, false);
        }

        head += 1;
    }

    triangles
}

/// Builds the triangle on one open side of an edge, marking the affected
/// sides of all three edges so no triangle is built twice.
fn complete_edge_side(
    vertices: &[U16Vec3],
    edges: &mut Vec<FacetEdge>,
    triangles: &mut Vec<[u32; 3]>,
    edge_index: usize,
    positive: bool,
) {
    const EPSILON: f32 = 1e-6;

    let FacetEdge { a, b, .. } = edges[edge_index];
    let origin = vertices[a as usize].as_vec3();
    let target = vertices[b as usize].as_vec3();

    // The candidate subtending the largest angle has an empty circumcircle
    // on its side of the edge.
    let mut best: Option<(f32, u32)> = None;

    for (candidate, vertex) in vertices.iter().enumerate() {
        let candidate = candidate as u32;
        if candidate == a || candidate == b {
            continue;
        }

        let point = vertex.as_vec3();
        let side = triangle_area_2d(origin, target, point);
        if side.abs() <= EPSILON || (side > 0.0) != positive {
            continue;
        }

        let to_origin = (origin - point).xz();
        let to_target = (target - point).xz();
        let lengths = to_origin.length() * to_target.length();
        if lengths < EPSILON {
            continue;
        }
        let cos_angle = to_origin.dot(to_target) / lengths;

        if best.is_some_and(|(best_cos, _)| cos_angle >= best_cos) {
            continue;
        }

        // The new triangle's edges must not cross what is already built.
        if crosses_existing_edge(vertices, edges, a, candidate)
            || crosses_existing_edge(vertices, edges, b, candidate)
        {
            continue;
        }

        best = Some((cos_angle, candidate));
    }

    let Some((_, point)) = best else {
        // Nothing on this side; the edge borders the outline.
        mark_edge_side(&mut edges[edge_index], positive);
        return;
    };

    triangles.push([a, point, b]);

    mark_edge_side(&mut edges[edge_index], positive);
    attach_triangle_edge(vertices, edges, a, point, b);
    attach_triangle_edge(vertices, edges, point, b, a);
}

fn mark_edge_side(edge: &mut FacetEdge, positive: bool) {
    if positive {
        edge.positive_done = true;
    } else {
        edge.negative_done = true;
    }
}

/// Marks the triangle's side on the edge ``a -> b`` (``opposite`` being the
/// triangle's third vertex), creating the edge when it's new.
fn attach_triangle_edge(
    vertices: &[U16Vec3],
    edges: &mut Vec<FacetEdge>,
    a: u32,
    b: u32,
    opposite: u32,
) {
    let side = triangle_area_2d(
        vertices[a as usize].as_vec3(),
        vertices[b as usize].as_vec3(),
        vertices[opposite as usize].as_vec3(),
    ) > 0.0;

    if let Some(edge) = edges
        .iter_mut()
        .find(|edge| (edge.a == a && edge.b == b) || (edge.a == b && edge.b == a))
    {
        // Flip the side when the stored orientation is reversed.
        mark_edge_side(edge, side == (edge.a == a));
    } else {
        edges.push(FacetEdge {
            a,
            b,
            positive_done: side,
            negative_done: !side,
        });
    }
}

fn crosses_existing_edge(vertices: &[U16Vec3], edges: &[FacetEdge], s: u32, t: u32) -> bool {
    let s_point = vertices[s as usize].as_vec3();
    let t_point = vertices[t as usize].as_vec3();

    edges.iter().any(|edge| {
        if edge.a == s || edge.a == t || edge.b == s || edge.b == t {
            return false;
        }

        segments_cross_2d(
            s_point,
            t_point,
            vertices[edge.a as usize].as_vec3(),
            vertices[edge.b as usize].as_vec3(),
        )
    })
}

fn segments_cross_2d(a: Vec3, b: Vec3, c: Vec3, d: Vec3) -> bool {
    let c_side = triangle_area_2d(a, b, c);
    let d_side = triangle_area_2d(a, b, d);
    let a_side = triangle_area_2d(c, d, a);
    let b_side = triangle_area_2d(c, d, b);

    c_side * d_side < 0.0 && a_side * b_side < 0.0
}

/// Smallest width of the polygon: the minimum over its edges of the farthest
/// distance from the edge to any other vertex.
fn polygon_min_extent(vertices: &[U16Vec3]) -> f32 {
    let mut min_extent = f32::MAX;

    for i in 0..vertices.len() {
        let next = (i + 1) % vertices.len();
        let a = vertices[i].as_vec3();
        let b = vertices[next].as_vec3();

        let farthest = vertices
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i && *j != next)
            .map(|(_, vertex)| distance_point_to_segment_2d(vertex.as_vec3(), a, b).0)
            .fold(0.0_f32, f32::max);

        min_extent = min_extent.min(farthest);
    }

    min_extent.sqrt()
}
