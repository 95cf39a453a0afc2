use std::collections::HashMap;

use bevy::log::warn;
use bevy::prelude::{IVec4, UVec2, UVec3, UVec4};
use smallvec::SmallVec;

use crate::contour::ContourSet;
use crate::math::{intersect, intersect_prop, left, left_on};
use crate::{Area, NavMeshSettings, FLAG_BORDER_VERTEX};

/// Maximum vertices of one merged polygon.
pub const MAX_VERTICES_PER_POLYGON: usize = 6;

/// Unused slot in a polygon's vertex array.
pub const NULL_INDEX: u32 = u32::MAX;

#[derive(Default, Clone, Debug)]
pub struct PolyMesh {
    /// Vertices in tile-local cell coordinates, ``[0, tile_width]`` on XZ.
    pub vertices: Vec<UVec3>,
    /// Up to [MAX_VERTICES_PER_POLYGON] counter-clockwise vertex indices per
    /// polygon, [NULL_INDEX] padded.
    pub polygons: Vec<[u32; MAX_VERTICES_PER_POLYGON]>,
    /// For each polygon edge, the polygon (if any) sharing the edge.
    pub edges: Vec<[EdgeConnection; MAX_VERTICES_PER_POLYGON]>,
    pub regions: Vec<u16>,
    pub areas: Vec<Area>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeConnectionDirection {
    XNegative,
    ZPositive,
    XPositive,
    ZNegative,
}

impl EdgeConnectionDirection {
    /// The neighbouring tile coordinate in this direction, or ``None`` at the
    /// edge of the world.
    pub fn offset(self, coordinate: UVec2) -> Option<UVec2> {
        match self {
            EdgeConnectionDirection::XNegative => {
                coordinate.x.checked_sub(1).map(|x| UVec2::new(x, coordinate.y))
            }
            EdgeConnectionDirection::ZPositive => Some(coordinate + UVec2::Y),
            EdgeConnectionDirection::XPositive => Some(coordinate + UVec2::X),
            EdgeConnectionDirection::ZNegative => {
                coordinate.y.checked_sub(1).map(|y| UVec2::new(coordinate.x, y))
            }
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            EdgeConnectionDirection::XNegative => EdgeConnectionDirection::XPositive,
            EdgeConnectionDirection::ZPositive => EdgeConnectionDirection::ZNegative,
            EdgeConnectionDirection::XPositive => EdgeConnectionDirection::XNegative,
            EdgeConnectionDirection::ZNegative => EdgeConnectionDirection::ZPositive,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            EdgeConnectionDirection::XNegative => 0,
            EdgeConnectionDirection::ZPositive => 1,
            EdgeConnectionDirection::XPositive => 2,
            EdgeConnectionDirection::ZNegative => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => EdgeConnectionDirection::XNegative,
            1 => EdgeConnectionDirection::ZPositive,
            2 => EdgeConnectionDirection::XPositive,
            3 => EdgeConnectionDirection::ZNegative,
            _ => panic!("Not a valid direction"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeConnection {
    None,
    Internal(u16),
    External(EdgeConnectionDirection),
}

pub fn build_poly_mesh(contour_set: &ContourSet, nav_mesh_settings: &NavMeshSettings) -> PolyMesh {
    let mut max_vertices = 0;
    let mut max_polygons = 0;
    let mut max_verts_per_contour = 0;

    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }

        max_vertices += contour.vertices.len();
        max_polygons += contour.vertices.len() - 2;
        max_verts_per_contour = contour.vertices.len().max(max_verts_per_contour);
    }

    let mut poly_mesh = PolyMesh {
        vertices: Vec::with_capacity(max_vertices),
        polygons: Vec::with_capacity(max_polygons),
        edges: Vec::with_capacity(max_polygons),
        regions: Vec::with_capacity(max_polygons),
        areas: Vec::with_capacity(max_polygons),
    };

    let mut welder = VertexWelder::default();
    let mut vertex_removable = vec![false; max_vertices];

    let mut indices = Vec::with_capacity(max_verts_per_contour);
    let mut polygons = Vec::with_capacity(max_verts_per_contour + 1);

    let border = u32::from(nav_mesh_settings.walkable_radius);
    let tile_width = u32::from(nav_mesh_settings.tile_width.get());

    for contour in &contour_set.contours {
        if contour.vertices.len() < 3 {
            continue;
        }

        let Some(contour_triangles) = triangulate_polygon(&contour.vertices) else {
            warn!(
                "Triangulation failed for contour in region {}; it produces no polygons.",
                contour.region
            );
            continue;
        };

        indices.clear();
        polygons.clear();

        for vertex in contour.vertices.iter() {
            // Shift out of the border padding into tile-local coordinates.
            let local = UVec3::new(
                vertex.x.saturating_sub(border).min(tile_width),
                vertex.y,
                vertex.z.saturating_sub(border).min(tile_width),
            );

            let index = welder.add(local, &mut poly_mesh.vertices);
            if vertex_removable.len() <= index as usize {
                vertex_removable.resize(index as usize + 1, false);
            }
            vertex_removable[index as usize] |= vertex.w & FLAG_BORDER_VERTEX != 0;
            indices.push(index);
        }

        for [a, b, c] in contour_triangles {
            let mut polygon = [NULL_INDEX; MAX_VERTICES_PER_POLYGON];
            polygon[0] = indices[a as usize];
            polygon[1] = indices[b as usize];
            polygon[2] = indices[c as usize];

            // Welding may collapse slivers into lines.
            if polygon[0] != polygon[1] && polygon[0] != polygon[2] && polygon[1] != polygon[2] {
                polygons.push(polygon);
            }
        }

        if polygons.is_empty() {
            continue;
        }

        merge_polygons(&mut polygons, &poly_mesh.vertices);

        // Store polygons.
        for polygon in polygons.iter() {
            poly_mesh.polygons.push(*polygon);
            poly_mesh.regions.push(contour.region);
            poly_mesh.areas.push(contour.area);
        }
    }

    // Remove the vertices the contour pass marked as removable.
    let mut vertex = 0;
    while vertex < poly_mesh.vertices.len() {
        if !vertex_removable[vertex] {
            vertex += 1;
            continue;
        }

        if can_remove_vertex(&poly_mesh, vertex as u32) && remove_vertex(&mut poly_mesh, vertex as u32)
        {
            // Indices shifted down, flags follow suit. Don't advance.
            vertex_removable.remove(vertex);
        } else {
            vertex += 1;
        }
    }

    // For each edge, find other polygon that shares that edge.
    build_mesh_adjacency(
        &poly_mesh.polygons,
        poly_mesh.vertices.len(),
        &mut poly_mesh.edges,
    );

    // Fix portal edges.
    for (i, polygon) in poly_mesh.polygons.iter().enumerate() {
        let vertex_count = count_polygon_vertices(polygon);

        for index in 0..vertex_count {
            // Connect to edges that don't have an internal edge connection.
            let EdgeConnection::None = poly_mesh.edges[i][index] else {
                continue;
            };

            let vertex_a = poly_mesh.vertices[polygon[index] as usize];
            let vertex_b = poly_mesh.vertices[polygon[(index + 1) % vertex_count] as usize];

            // Only edges parallel to the tile edge.
            if vertex_a.x == 0 && vertex_b.x == 0 {
                poly_mesh.edges[i][index] =
                    EdgeConnection::External(EdgeConnectionDirection::XNegative);
            } else if vertex_a.z == tile_width && vertex_b.z == tile_width {
                poly_mesh.edges[i][index] =
                    EdgeConnection::External(EdgeConnectionDirection::ZPositive);
            } else if vertex_a.x == tile_width && vertex_b.x == tile_width {
                poly_mesh.edges[i][index] =
                    EdgeConnection::External(EdgeConnectionDirection::XPositive);
            } else if vertex_a.z == 0 && vertex_b.z == 0 {
                poly_mesh.edges[i][index] =
                    EdgeConnection::External(EdgeConnectionDirection::ZNegative);
            }
        }
    }

    poly_mesh
}

pub fn count_polygon_vertices(polygon: &[u32; MAX_VERTICES_PER_POLYGON]) -> usize {
    polygon
        .iter()
        .position(|index| *index == NULL_INDEX)
        .unwrap_or(MAX_VERTICES_PER_POLYGON)
}

/// Greedily merges polygons sharing an edge while the result stays convex
/// and within [MAX_VERTICES_PER_POLYGON]. The longest shared edge merges
/// first.
fn merge_polygons(polygons: &mut Vec<[u32; MAX_VERTICES_PER_POLYGON]>, vertices: &[UVec3]) {
    if MAX_VERTICES_PER_POLYGON <= 3 || polygons.len() < 2 {
        return;
    }

    loop {
        let mut best_merge_value = 0;
        let mut best_pair = None;

        for i in 0..polygons.len() - 1 {
            for j in i + 1..polygons.len() {
                if let Some((value, edge_a, edge_b)) =
                    get_merge_value(&polygons[i], &polygons[j], vertices)
                {
                    if value > best_merge_value {
                        best_merge_value = value;
                        best_pair = Some((i, j, edge_a, edge_b));
                    }
                }
            }
        }

        let Some((i, j, edge_a, edge_b)) = best_pair else {
            break;
        };

        let merged = merge_polygon_pair(&polygons[i], &polygons[j], edge_a, edge_b);
        polygons[i] = merged;
        polygons.swap_remove(j);
    }
}

/// Squared length of the shared edge if the two polygons can merge, plus the
/// shared edge index in each polygon.
fn get_merge_value(
    polygon_a: &[u32; MAX_VERTICES_PER_POLYGON],
    polygon_b: &[u32; MAX_VERTICES_PER_POLYGON],
    vertices: &[UVec3],
) -> Option<(i64, usize, usize)> {
    let count_a = count_polygon_vertices(polygon_a);
    let count_b = count_polygon_vertices(polygon_b);

    if count_a + count_b - 2 > MAX_VERTICES_PER_POLYGON {
        return None;
    }

    // Check if the polygons share an edge.
    let mut edge_a = None;
    let mut edge_b = None;
    for i in 0..count_a {
        let a0 = polygon_a[i];
        let a1 = polygon_a[(i + 1) % count_a];

        for j in 0..count_b {
            let b0 = polygon_b[j];
            let b1 = polygon_b[(j + 1) % count_b];

            if a0 == b1 && a1 == b0 {
                edge_a = Some(i);
                edge_b = Some(j);
            }
        }
    }

    let edge_a = edge_a?;
    let edge_b = edge_b?;

    // The merged polygon must stay convex at both joints.
    let to_ivec = |index: u32| {
        let vertex = vertices[index as usize];
        IVec4::new(vertex.x as i32, vertex.y as i32, vertex.z as i32, 0)
    };

    let before_a = polygon_a[(edge_a + count_a - 1) % count_a];
    let shared_a = polygon_a[edge_a];
    let after_b = polygon_b[(edge_b + 2) % count_b];
    if !left(to_ivec(before_a), to_ivec(shared_a), to_ivec(after_b)) {
        return None;
    }

    let before_b = polygon_b[(edge_b + count_b - 1) % count_b];
    let shared_b = polygon_b[edge_b];
    let after_a = polygon_a[(edge_a + 2) % count_a];
    if !left(to_ivec(before_b), to_ivec(shared_b), to_ivec(after_a)) {
        return None;
    }

    let vertex_a = vertices[polygon_a[edge_a] as usize];
    let vertex_b = vertices[polygon_a[(edge_a + 1) % count_a] as usize];

    let delta_x = i64::from(vertex_a.x) - i64::from(vertex_b.x);
    let delta_z = i64::from(vertex_a.z) - i64::from(vertex_b.z);

    Some((delta_x * delta_x + delta_z * delta_z, edge_a, edge_b))
}

fn merge_polygon_pair(
    polygon_a: &[u32; MAX_VERTICES_PER_POLYGON],
    polygon_b: &[u32; MAX_VERTICES_PER_POLYGON],
    edge_a: usize,
    edge_b: usize,
) -> [u32; MAX_VERTICES_PER_POLYGON] {
    let count_a = count_polygon_vertices(polygon_a);
    let count_b = count_polygon_vertices(polygon_b);

    let mut merged = [NULL_INDEX; MAX_VERTICES_PER_POLYGON];
    let mut n = 0;

    // Add polygon A skipping the shared edge.
    for i in 0..count_a - 1 {
        merged[n] = polygon_a[(edge_a + 1 + i) % count_a];
        n += 1;
    }
    // Add polygon B skipping the shared edge.
    for i in 0..count_b - 1 {
        merged[n] = polygon_b[(edge_b + 1 + i) % count_b];
        n += 1;
    }

    merged
}

/// True when removing the vertex leaves a patchable hole.
fn can_remove_vertex(poly_mesh: &PolyMesh, vertex: u32) -> bool {
    let mut num_touched_vertices = 0;
    let mut num_remaining_edges = 0;

    for polygon in poly_mesh.polygons.iter() {
        let vertex_count = count_polygon_vertices(polygon);

        let removed = polygon[..vertex_count]
            .iter()
            .filter(|index| **index == vertex)
            .count();
        if removed > 0 {
            num_touched_vertices += removed;
            num_remaining_edges += vertex_count - (removed + 1);
        }
    }

    if num_remaining_edges <= 2 {
        // There would be too few edges remaining to create a polygon.
        return false;
    }

    // Check that there will be no more than two open edges after removal.
    let mut edges: Vec<(u32, u32, u32)> = Vec::with_capacity(num_touched_vertices * 2);

    for polygon in poly_mesh.polygons.iter() {
        let vertex_count = count_polygon_vertices(polygon);
        if !polygon[..vertex_count].contains(&vertex) {
            continue;
        }

        for i in 0..vertex_count {
            let previous = polygon[(i + vertex_count - 1) % vertex_count];
            let current = polygon[i];

            if current != vertex && previous != vertex {
                continue;
            }

            // Arrange the edge to lead away from the removed vertex.
            let other = if current == vertex { previous } else { current };
            if other == vertex {
                continue;
            }

            if let Some(edge) = edges.iter_mut().find(|(a, _, _)| *a == other) {
                edge.2 += 1;
            } else {
                edges.push((other, vertex, 1));
            }
        }
    }

    let open_edges = edges.iter().filter(|(_, _, count)| *count < 2).count();
    open_edges <= 2
}

/// Removes the vertex, retriangulates the hole left behind & merges the
/// resulting triangles back into the mesh. Refuses to operate across
/// region/area boundaries or when the hole cannot be retriangulated; the
/// mesh is untouched in both cases.
fn remove_vertex(poly_mesh: &mut PolyMesh, vertex: u32) -> bool {
    let mut hole_edges: Vec<[u32; 2]> = Vec::new();
    let mut region = None;
    let mut area = None;

    for (polygon_index, polygon) in poly_mesh.polygons.iter().enumerate() {
        let vertex_count = count_polygon_vertices(polygon);
        if !polygon[..vertex_count].contains(&vertex) {
            continue;
        }

        match region {
            None => {
                region = Some(poly_mesh.regions[polygon_index]);
                area = Some(poly_mesh.areas[polygon_index]);
            }
            Some(region) if region != poly_mesh.regions[polygon_index] => return false,
            _ => {}
        }
        if area.is_some_and(|area| area != poly_mesh.areas[polygon_index]) {
            return false;
        }

        // Collect the edges not touching the vertex.
        for i in 0..vertex_count {
            let current = polygon[i];
            let next = polygon[(i + 1) % vertex_count];
            if current != vertex && next != vertex {
                hole_edges.push([current, next]);
            }
        }
    }

    let (Some(region), Some(area)) = (region, area) else {
        return false;
    };
    if hole_edges.is_empty() {
        return false;
    }

    // Chain the edges into the hole's outline.
    let mut hole = Vec::with_capacity(hole_edges.len());
    {
        let first = hole_edges.swap_remove(0);
        hole.push(first[0]);
        hole.push(first[1]);

        while !hole_edges.is_empty() {
            let tail = *hole.last().unwrap();

            let Some(position) = hole_edges.iter().position(|edge| edge[0] == tail) else {
                break;
            };

            let edge = hole_edges.swap_remove(position);
            if edge[1] != hole[0] {
                hole.push(edge[1]);
            }
        }
    }

    if hole.len() < 3 {
        return false;
    }

    // Triangulate before touching the mesh, so failure leaves it intact.
    let hole_vertices: Vec<UVec4> = hole
        .iter()
        .map(|index| {
            let vertex = poly_mesh.vertices[*index as usize];
            UVec4::new(vertex.x, vertex.y, vertex.z, 0)
        })
        .collect();

    let Some(hole_triangles) = triangulate_polygon(&hole_vertices) else {
        warn!("Retriangulation failed when removing a vertex; keeping it.");
        return false;
    };

    let mut polygons = Vec::with_capacity(hole_triangles.len());
    for [a, b, c] in hole_triangles {
        let a = hole[a as usize];
        let b = hole[b as usize];
        let c = hole[c as usize];

        if a != b && a != c && b != c {
            let mut polygon = [NULL_INDEX; MAX_VERTICES_PER_POLYGON];
            polygon[0] = a;
            polygon[1] = b;
            polygon[2] = c;
            polygons.push(polygon);
        }
    }

    if polygons.is_empty() {
        return false;
    }

    // Drop the polygons touching the vertex.
    let mut polygon_index = 0;
    while polygon_index < poly_mesh.polygons.len() {
        let polygon = &poly_mesh.polygons[polygon_index];
        let vertex_count = count_polygon_vertices(polygon);
        if polygon[..vertex_count].contains(&vertex) {
            poly_mesh.polygons.swap_remove(polygon_index);
            poly_mesh.regions.swap_remove(polygon_index);
            poly_mesh.areas.swap_remove(polygon_index);
        } else {
            polygon_index += 1;
        }
    }

    // Remove the vertex & shift every index above it down, in the mesh and
    // in the patch polygons alike.
    poly_mesh.vertices.remove(vertex as usize);
    for polygon in poly_mesh.polygons.iter_mut() {
        for index in polygon.iter_mut() {
            if *index != NULL_INDEX && *index > vertex {
                *index -= 1;
            }
        }
    }
    for polygon in polygons.iter_mut() {
        for index in polygon.iter_mut() {
            if *index != NULL_INDEX && *index > vertex {
                *index -= 1;
            }
        }
    }

    merge_polygons(&mut polygons, &poly_mesh.vertices);

    for polygon in polygons {
        poly_mesh.polygons.push(polygon);
        poly_mesh.regions.push(region);
        poly_mesh.areas.push(area);
    }

    true
}

#[derive(Debug)]
struct Edge {
    // The vertices that make up this edge.
    vertices: [u32; 2],
    // The index of the edge in respective polygon.
    edge_in_polygon: [usize; 2],
    // The polygons that this edge makes up.
    polygon: [usize; 2],
}

fn build_mesh_adjacency(
    polygons: &[[u32; MAX_VERTICES_PER_POLYGON]],
    vertex_count: usize,
    in_edges: &mut Vec<[EdgeConnection; MAX_VERTICES_PER_POLYGON]>,
) {
    let max_edge_count = polygons.len() * MAX_VERTICES_PER_POLYGON;

    let mut first_edge = vec![None; vertex_count];
    let mut next_edge: Vec<Option<usize>> = vec![None; max_edge_count];
    let mut edges = Vec::with_capacity(max_edge_count);

    for (i, polygon) in polygons.iter().enumerate() {
        let polygon_vertex_count = count_polygon_vertices(polygon);
        for j in 0..polygon_vertex_count {
            let current = polygon[j];
            let next = polygon[(j + 1) % polygon_vertex_count];
            if current < next {
                let edge = Edge {
                    vertices: [current, next],
                    edge_in_polygon: [j, 0],
                    polygon: [i, i],
                };

                next_edge[edges.len()] = first_edge[current as usize];
                first_edge[current as usize] = Some(edges.len());
                edges.push(edge);
            }
        }
    }

    for (i, polygon) in polygons.iter().enumerate() {
        let polygon_vertex_count = count_polygon_vertices(polygon);
        for j in 0..polygon_vertex_count {
            let current = polygon[j];
            let next = polygon[(j + 1) % polygon_vertex_count];
            if current > next {
                let mut edge_iter = first_edge[next as usize];
                while let Some(edge_index) = edge_iter {
                    let edge = &mut edges[edge_index];
                    if edge.vertices[1] == current && edge.polygon[0] == edge.polygon[1] {
                        edge.polygon[1] = i;
                        edge.edge_in_polygon[1] = j;
                        break;
                    }
                    edge_iter = next_edge[edge_index];
                }
            }
        }
    }

    in_edges.clear();
    in_edges.resize(
        polygons.len(),
        [EdgeConnection::None; MAX_VERTICES_PER_POLYGON],
    );
    for edge in edges.iter() {
        if edge.polygon[0] != edge.polygon[1] {
            let polygon_one = edge.polygon[0];
            let polygon_two = edge.polygon[1];
            in_edges[polygon_one][edge.edge_in_polygon[0]] =
                EdgeConnection::Internal(edge.polygon[1] as u16);
            in_edges[polygon_two][edge.edge_in_polygon[1]] =
                EdgeConnection::Internal(edge.polygon[0] as u16);
        }
    }
}

/// Welds vertices sharing an XZ cell whose heights are within two cells of
/// each other, handing out stable indices into the mesh vertex list.
#[derive(Default)]
struct VertexWelder {
    buckets: HashMap<(u32, u32), SmallVec<[u32; 2]>>,
}

impl VertexWelder {
    fn add(&mut self, vertex: UVec3, vertices: &mut Vec<UVec3>) -> u32 {
        let bucket = self.buckets.entry((vertex.x, vertex.z)).or_default();

        if let Some(existing) = bucket
            .iter()
            .find(|index| vertices[**index as usize].y.abs_diff(vertex.y) <= 2)
        {
            return *existing;
        }

        let index = vertices.len() as u32;
        vertices.push(vertex);
        bucket.push(index);
        index
    }
}

/// Ear-clipping triangulation of a contour outline, clipping the corner with
/// the shortest diagonal each round. Returns ``None`` when the outline is too
/// degenerate to triangulate; such contours produce no polygons.
fn triangulate_polygon(vertices: &[UVec4]) -> Option<Vec<[u32; 3]>> {
    let mut ring: Vec<u32> = (0..vertices.len() as u32).collect();
    let mut triangles = Vec::with_capacity(vertices.len().saturating_sub(2));

    while ring.len() > 3 {
        let corner = match find_best_ear(vertices, &ring, false) {
            Some(corner) => corner,
            // Relax the diagonal tests before giving up; outlines with
            // merged holes can hide every strict ear behind duplicated
            // segments.
            None => find_best_ear(vertices, &ring, true)?,
        };

        let previous = ring[(corner + ring.len() - 1) % ring.len()];
        let next = ring[(corner + 1) % ring.len()];
        triangles.push([previous, ring[corner], next]);

        ring.remove(corner);
    }

    triangles.push([ring[0], ring[1], ring[2]]);
    Some(triangles)
}

/// The clippable corner whose diagonal is shortest, if any corner can be
/// clipped at all.
fn find_best_ear(vertices: &[UVec4], ring: &[u32], relaxed: bool) -> Option<usize> {
    let mut best = None;
    let mut best_length = u32::MAX;

    for corner in 0..ring.len() {
        if !corner_is_clippable(vertices, ring, corner, relaxed) {
            continue;
        }

        let previous = vertices[ring[(corner + ring.len() - 1) % ring.len()] as usize];
        let next = vertices[ring[(corner + 1) % ring.len()] as usize];

        let delta_x = next.x.abs_diff(previous.x);
        let delta_z = next.z.abs_diff(previous.z);
        let length = delta_x * delta_x + delta_z * delta_z;

        if length < best_length {
            best_length = length;
            best = Some(corner);
        }
    }

    best
}

/// A corner can be clipped when the diagonal spanning it opens into the
/// outline's interior & crosses no other outline segment.
fn corner_is_clippable(vertices: &[UVec4], ring: &[u32], corner: usize, relaxed: bool) -> bool {
    let length = ring.len();
    let previous_index = (corner + length - 1) % length;
    let next_index = (corner + 1) % length;

    let before = vertices[ring[(previous_index + length - 1) % length] as usize].as_ivec4();
    let at = vertices[ring[previous_index] as usize].as_ivec4();
    let after = vertices[ring[corner] as usize].as_ivec4();
    let target = vertices[ring[next_index] as usize].as_ivec4();

    diagonal_in_cone(before, at, after, target, relaxed)
        && diagonal_is_unobstructed(vertices, ring, previous_index, next_index, relaxed)
}

/// True when the segment from ``at`` towards ``target`` leaves ``at`` on the
/// interior side, where ``before`` & ``after`` are the outline neighbours of
/// ``at``. Relaxed mode admits diagonals grazing the outline.
fn diagonal_in_cone(before: IVec4, at: IVec4, after: IVec4, target: IVec4, relaxed: bool) -> bool {
    let convex = left_on(before, at, after);

    if relaxed {
        if convex {
            left_on(at, target, before) && left_on(target, at, after)
        } else {
            !(left_on(at, target, after) && left_on(target, at, before))
        }
    } else if convex {
        left(at, target, before) && left(target, at, after)
    } else {
        !(left_on(at, target, after) && left_on(target, at, before))
    }
}

fn diagonal_is_unobstructed(
    vertices: &[UVec4],
    ring: &[u32],
    previous_index: usize,
    next_index: usize,
    relaxed: bool,
) -> bool {
    let diagonal_start = vertices[ring[previous_index] as usize];
    let diagonal_end = vertices[ring[next_index] as usize];

    for segment in 0..ring.len() {
        let segment_end = (segment + 1) % ring.len();
        if segment == previous_index
            || segment == next_index
            || segment_end == previous_index
            || segment_end == next_index
        {
            continue;
        }

        let a = vertices[ring[segment] as usize];
        let b = vertices[ring[segment_end] as usize];

        // Segments sharing a position with the diagonal's endpoints come
        // from merged holes & don't obstruct it.
        if same_position(a, diagonal_start)
            || same_position(a, diagonal_end)
            || same_position(b, diagonal_start)
            || same_position(b, diagonal_end)
        {
            continue;
        }

        let crossing = if relaxed {
            intersect_prop(
                diagonal_start.as_ivec4(),
                diagonal_end.as_ivec4(),
                a.as_ivec4(),
                b.as_ivec4(),
            )
        } else {
            intersect(
                diagonal_start.as_ivec4(),
                diagonal_end.as_ivec4(),
                a.as_ivec4(),
                b.as_ivec4(),
            )
        };
        if crossing {
            return false;
        }
    }

    true
}

fn same_position(a: UVec4, b: UVec4) -> bool {
    a.x == b.x && a.z == b.z
}

#[cfg(test)]
mod tests {
    use bevy::prelude::{Transform, UVec2, Vec3};

    use super::*;
    use crate::contour::build_contours;
    use crate::conversion::{GeometryCollection, Triangles};
    use crate::heightfields::{
        build_heightfield_tile, build_open_heightfield_tile, calculate_distance_field,
        erode_walkable_area,
    };
    use crate::math::area_2d_i;
    use crate::regions::build_regions;

    fn build_mesh(settings: &NavMeshSettings) -> PolyMesh {
        let tile_coord = UVec2::new(5, 5);
        let origin = settings.get_tile_origin_with_border(tile_coord);
        let offset = Vec3::new(origin.x, 0.0, origin.y);

        let floor = GeometryCollection::new(
            Transform::IDENTITY,
            Triangles::TriMesh(
                Box::new([
                    offset + Vec3::new(0.0, 1.0, 0.0),
                    offset + Vec3::new(14.0, 1.0, 0.0),
                    offset + Vec3::new(14.0, 1.0, 14.0),
                    offset + Vec3::new(0.0, 1.0, 14.0),
                ]),
                Box::new([[0, 2, 1], [0, 3, 2]]),
            ),
        );

        let voxelized = build_heightfield_tile(tile_coord, &[floor], settings);
        let mut open_tile = build_open_heightfield_tile(&voxelized, settings);
        erode_walkable_area(&mut open_tile, settings);
        calculate_distance_field(&mut open_tile, settings);
        build_regions(&mut open_tile, settings);

        let contour_set = build_contours(&open_tile, settings);
        build_poly_mesh(&contour_set, settings)
    }

    fn test_settings() -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 50.0, 0.0)
            .with_cell_size(1.0, 0.5)
            .with_walkable_radius(1)
            .with_step_height(1)
            .with_region_area(1, 100)
    }

    #[test]
    fn polygons_are_convex_and_ccw() {
        let settings = test_settings();
        let poly_mesh = build_mesh(&settings);

        assert!(!poly_mesh.polygons.is_empty());

        for polygon in poly_mesh.polygons.iter() {
            let vertex_count = count_polygon_vertices(polygon);
            assert!((3..=MAX_VERTICES_PER_POLYGON).contains(&vertex_count));

            for i in 0..vertex_count {
                let to_ivec = |index: u32| {
                    let vertex = poly_mesh.vertices[index as usize];
                    bevy::prelude::IVec4::new(vertex.x as i32, vertex.y as i32, vertex.z as i32, 0)
                };

                let a = to_ivec(polygon[i]);
                let b = to_ivec(polygon[(i + 1) % vertex_count]);
                let c = to_ivec(polygon[(i + 2) % vertex_count]);

                assert!(
                    area_2d_i(a, b, c) <= 0,
                    "polygon must turn consistently counter-clockwise in XZ"
                );
            }
        }
    }

    #[test]
    fn adjacency_is_symmetric() {
        let settings = test_settings();
        let poly_mesh = build_mesh(&settings);

        for (polygon_index, edges) in poly_mesh.edges.iter().enumerate() {
            for connection in edges {
                let EdgeConnection::Internal(other) = connection else {
                    continue;
                };

                let other_edges = &poly_mesh.edges[*other as usize];
                assert!(
                    other_edges.iter().any(|other_connection| matches!(
                        other_connection,
                        EdgeConnection::Internal(index) if *index == polygon_index as u16
                    )),
                    "internal edges must link both ways"
                );
            }
        }
    }

    #[test]
    fn merged_quad_floor_is_few_polygons() {
        let settings = test_settings();
        let poly_mesh = build_mesh(&settings);

        // A flat rectangle merges down to one convex polygon (two triangles
        // merged), maybe a couple if split vertices survived.
        assert!(poly_mesh.polygons.len() <= 2);
    }
}
