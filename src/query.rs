//! Querying the nav-mesh: pathfinding, string-pulling, raycasts & local
//! region queries.
//!
//! All queries are read-only over [NavMeshTiles] & carry their own scratch
//! state, so any number may run in parallel against a quiescent nav-mesh.

use bevy::prelude::{Vec2, Vec3};
use thiserror::Error;

use crate::math::{
    distance_point_to_segment_2d, intersect_segment_polygon_2d, point_in_polygon_2d,
    overlap_polygons_2d, random_point_in_convex_polygon, triangle_area_2d,
};
use crate::tiles::{Link, NavMeshTiles, PolyRef, Polygon};
use crate::{Area, NavMeshSettings};

/// Number of distinct area types a filter can cost separately.
pub const MAX_AREAS: usize = 64;

const HEURISTIC_SCALE: f32 = 0.999;

/// Polygon admission & cost scaling for the traversal queries.
#[derive(Clone, Debug)]
pub struct QueryFilter {
    /// At least one of these flags must be set on a polygon to traverse it.
    pub include_flags: u16,
    /// None of these flags may be set on a polygon to traverse it.
    pub exclude_flags: u16,
    /// Cost multiplier per area type.
    pub area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: 0xffff,
            exclude_flags: 0,
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    #[inline]
    pub fn passes(&self, polygon: &Polygon) -> bool {
        (polygon.flags & self.include_flags) != 0 && (polygon.flags & self.exclude_flags) == 0
    }

    #[inline]
    pub fn cost(&self, area: Area) -> f32 {
        self.area_cost[usize::from(area.0.min(MAX_AREAS as u16 - 1))]
    }
}

const NULL_NODE: u16 = u16::MAX;

#[derive(Default, Debug, PartialEq, Eq, Clone, Copy)]
enum NodeState {
    #[default]
    Unchecked,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
struct Node {
    reference: PolyRef,
    position: Vec3,
    cost: f32,
    total: f32,
    parent: u16,
    state: NodeState,
}

/// Fixed-capacity pool of search nodes addressed by `u16` indices & hashed
/// by polygon ref, so revisits update in place instead of re-allocating.
struct NodePool {
    nodes: Vec<Node>,
    buckets: Vec<u16>,
    next: Vec<u16>,
    max_nodes: usize,
}

impl NodePool {
    fn new(max_nodes: usize) -> Self {
        let bucket_count = max_nodes.next_power_of_two().max(4);
        Self {
            nodes: Vec::with_capacity(64.min(max_nodes)),
            buckets: vec![NULL_NODE; bucket_count],
            next: Vec::with_capacity(64.min(max_nodes)),
            max_nodes,
        }
    }

    fn hash(&self, reference: PolyRef) -> usize {
        // Fibonacci hash over the packed ref bits.
        let hash = u64::from(reference) as u128 * 0x9e3779b97f4a7c15;
        (hash as u64 as usize) & (self.buckets.len() - 1)
    }

    fn find(&self, reference: PolyRef) -> Option<u16> {
        let mut index = self.buckets[self.hash(reference)];
        while index != NULL_NODE {
            if self.nodes[usize::from(index)].reference == reference {
                return Some(index);
            }
            index = self.next[usize::from(index)];
        }
        None
    }

    /// Returns ``None`` when the pool is exhausted.
    fn get_or_create(&mut self, reference: PolyRef) -> Option<u16> {
        if let Some(index) = self.find(reference) {
            return Some(index);
        }

        if self.nodes.len() >= self.max_nodes {
            return None;
        }

        let index = self.nodes.len() as u16;
        self.nodes.push(Node {
            reference,
            position: Vec3::ZERO,
            cost: 0.0,
            total: 0.0,
            parent: NULL_NODE,
            state: NodeState::Unchecked,
        });

        let bucket = self.hash(reference);
        self.next.push(self.buckets[bucket]);
        self.buckets[bucket] = index;

        Some(index)
    }
}

/// Indexed binary min-heap over the node pool, keyed by total cost with the
/// accumulated cost as the tie-breaker.
#[derive(Default)]
struct OpenList {
    heap: Vec<u16>,
}

impl OpenList {
    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn better(a: &Node, b: &Node) -> bool {
        a.total < b.total || (a.total == b.total && a.cost < b.cost)
    }

    fn push(&mut self, node: u16, nodes: &[Node]) {
        self.heap.push(node);
        self.sift_up(self.heap.len() - 1, nodes);
    }

    fn pop(&mut self, nodes: &[Node]) -> Option<u16> {
        if self.heap.is_empty() {
            return None;
        }

        let top = self.heap.swap_remove(0);
        if !self.heap.is_empty() {
            self.sift_down(0, nodes);
        }
        Some(top)
    }

    /// Re-sorts an entry whose key decreased.
    fn update(&mut self, node: u16, nodes: &[Node]) {
        if let Some(position) = self.heap.iter().position(|entry| *entry == node) {
            self.sift_up(position, nodes);
        }
    }

    fn sift_up(&mut self, mut position: usize, nodes: &[Node]) {
        while position > 0 {
            let parent = (position - 1) / 2;
            let entry = &nodes[usize::from(self.heap[position])];
            let parent_entry = &nodes[usize::from(self.heap[parent])];
            if !Self::better(entry, parent_entry) {
                break;
            }
            self.heap.swap(position, parent);
            position = parent;
        }
    }

    fn sift_down(&mut self, mut position: usize, nodes: &[Node]) {
        loop {
            let left = position * 2 + 1;
            let right = position * 2 + 2;
            let mut smallest = position;

            if left < self.heap.len()
                && Self::better(
                    &nodes[usize::from(self.heap[left])],
                    &nodes[usize::from(self.heap[smallest])],
                )
            {
                smallest = left;
            }
            if right < self.heap.len()
                && Self::better(
                    &nodes[usize::from(self.heap[right])],
                    &nodes[usize::from(self.heap[smallest])],
                )
            {
                smallest = right;
            }

            if smallest == position {
                break;
            }
            self.heap.swap(position, smallest);
            position = smallest;
        }
    }
}

/// Polygon corridor produced by pathfinding. ``partial`` is set when the
/// search could not reach the requested end & the corridor leads to the
/// closest reachable polygon instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub polygons: Vec<PolyRef>,
    pub partial: bool,
}

/// Errors returned by [find_path] & friends.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FindPathError {
    #[error("no polygon found near the start position")]
    NoValidStartPolygon,
    #[error("no polygon found near the end position")]
    NoValidEndPolygon,
    #[error("a supplied polygon reference is invalid or stale")]
    InvalidPolyRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlicedPathStatus {
    InProgress,
    Succeeded,
    PartialResult,
}

/// Suspended A* search. Created by [init_sliced_find_path], advanced by
/// [SlicedPathQuery::update] & committed by [SlicedPathQuery::finalize].
/// Dropping the query cancels it.
pub struct SlicedPathQuery {
    pool: NodePool,
    open: OpenList,
    end_reference: PolyRef,
    end_position: Vec3,
    filter: QueryFilter,
    last_best: u16,
    last_best_heuristic: f32,
    out_of_nodes: bool,
    finished: Option<SlicedPathStatus>,
}

/// Maximum nodes one search visits before reporting a partial result.
const MAX_SEARCH_NODES: usize = 4096;

/// Starts a sliced A* search between two polygons.
pub fn init_sliced_find_path(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    start_position: Vec3,
    end_reference: PolyRef,
    end_position: Vec3,
    filter: QueryFilter,
) -> Result<SlicedPathQuery, FindPathError> {
    if !nav_mesh.is_valid_poly_ref(start_reference) {
        return Err(FindPathError::NoValidStartPolygon);
    }
    if !nav_mesh.is_valid_poly_ref(end_reference) {
        return Err(FindPathError::NoValidEndPolygon);
    }

    let mut query = SlicedPathQuery {
        pool: NodePool::new(MAX_SEARCH_NODES),
        open: OpenList::default(),
        end_reference,
        end_position,
        filter,
        last_best: 0,
        last_best_heuristic: f32::MAX,
        out_of_nodes: false,
        finished: None,
    };

    let start = query.pool.get_or_create(start_reference).unwrap();
    {
        let node = &mut query.pool.nodes[usize::from(start)];
        node.position = start_position;
        node.cost = 0.0;
        node.total = start_position.distance(end_position) * HEURISTIC_SCALE;
        node.state = NodeState::Open;
    }
    query.last_best = start;
    query.last_best_heuristic = query.pool.nodes[usize::from(start)].total;
    query.open.push(start, &query.pool.nodes);

    if start_reference == end_reference {
        query.finished = Some(SlicedPathStatus::Succeeded);
    }

    Ok(query)
}

impl SlicedPathQuery {
    /// Runs up to ``max_iterations`` node expansions. Returns
    /// [SlicedPathStatus::InProgress] while there is more work to do.
    pub fn update(&mut self, nav_mesh: &NavMeshTiles, max_iterations: usize) -> SlicedPathStatus {
        if let Some(finished) = self.finished {
            return finished;
        }

        for _ in 0..max_iterations {
            let Some(best) = self.open.pop(&self.pool.nodes) else {
                // Exhausted the reachable surface without touching the end.
                let status = SlicedPathStatus::PartialResult;
                self.finished = Some(status);
                return status;
            };

            let (best_reference, best_position, best_cost) = {
                let node = &mut self.pool.nodes[usize::from(best)];
                node.state = NodeState::Closed;
                (node.reference, node.position, node.cost)
            };

            if best_reference == self.end_reference {
                self.last_best = best;
                let status = SlicedPathStatus::Succeeded;
                self.finished = Some(status);
                return status;
            }

            let Some((_, polygon)) = nav_mesh.get_tile_and_polygon(best_reference) else {
                // The tile was swapped out under the query.
                continue;
            };

            let links = polygon.links.clone();
            let area = polygon.area;

            for link in links {
                let neighbour_reference = match link {
                    Link::Internal {
                        neighbour_polygon, ..
                    } => nav_mesh.poly_ref_in_same_tile(best_reference, neighbour_polygon),
                    Link::External { neighbour, .. } => neighbour,
                    Link::OffMesh { neighbour, .. } => neighbour,
                };

                let Some((neighbour_tile, neighbour_polygon)) =
                    nav_mesh.get_tile_and_polygon(neighbour_reference)
                else {
                    continue;
                };

                if !self.filter.passes(neighbour_polygon) {
                    continue;
                }

                let Some(position) =
                    link_position(nav_mesh, best_reference, &link, neighbour_tile, neighbour_polygon)
                else {
                    continue;
                };

                let Some(neighbour) = self.pool.get_or_create(neighbour_reference) else {
                    self.out_of_nodes = true;
                    continue;
                };

                let (cost, heuristic) = if neighbour_reference == self.end_reference {
                    let current_cost =
                        best_position.distance(position) * self.filter.cost(area);
                    let end_cost = position.distance(self.end_position)
                        * self.filter.cost(neighbour_polygon.area);

                    (best_cost + current_cost + end_cost, 0.0)
                } else {
                    let current_cost =
                        best_position.distance(position) * self.filter.cost(area);
                    let heuristic =
                        position.distance(self.end_position) * HEURISTIC_SCALE;

                    (best_cost + current_cost, heuristic)
                };
                let total = cost + heuristic;

                let node = &mut self.pool.nodes[usize::from(neighbour)];
                if node.state != NodeState::Unchecked && total >= node.total {
                    continue;
                }

                let old_state = node.state;
                node.position = position;
                node.parent = best;
                node.cost = cost;
                node.total = total;
                node.state = NodeState::Open;

                if heuristic < self.last_best_heuristic {
                    self.last_best_heuristic = heuristic;
                    self.last_best = neighbour;
                }

                if old_state == NodeState::Open {
                    self.open.update(neighbour, &self.pool.nodes);
                } else {
                    self.open.push(neighbour, &self.pool.nodes);
                }
            }
        }

        if self.open.is_empty() {
            let status = SlicedPathStatus::PartialResult;
            self.finished = Some(status);
            status
        } else {
            SlicedPathStatus::InProgress
        }
    }

    /// Commits the search & returns the polygon corridor to the end, or to
    /// the closest reached polygon on a partial result.
    pub fn finalize(self) -> Path {
        let partial = !matches!(self.finished, Some(SlicedPathStatus::Succeeded))
            || self.out_of_nodes
                && self.pool.nodes[usize::from(self.last_best)].reference != self.end_reference;

        let mut polygons = Vec::new();
        let mut current = self.last_best;
        while current != NULL_NODE {
            let node = &self.pool.nodes[usize::from(current)];
            polygons.push(node.reference);
            current = node.parent;
        }
        polygons.reverse();

        Path { polygons, partial }
    }
}

/// A* between two polygon refs. Equivalent to driving a sliced query to
/// completion in one call.
pub fn find_polygon_path(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    start_position: Vec3,
    end_reference: PolyRef,
    end_position: Vec3,
    filter: &QueryFilter,
) -> Result<Path, FindPathError> {
    let mut query = init_sliced_find_path(
        nav_mesh,
        start_reference,
        start_position,
        end_reference,
        end_position,
        filter.clone(),
    )?;

    while query.update(nav_mesh, 64) == SlicedPathStatus::InProgress {}

    Ok(query.finalize())
}

/// Performs A* pathfinding between two world positions, snapping both to the
/// nav-mesh first.
///
/// * ``position_search_radius`` - Radius to search for a start & end polygon
///   in. In world units. Defaults to ``5.0``.
pub fn find_path(
    nav_mesh: &NavMeshTiles,
    nav_mesh_settings: &NavMeshSettings,
    start_position: Vec3,
    end_position: Vec3,
    position_search_radius: Option<f32>,
    filter: Option<&QueryFilter>,
) -> Result<Path, FindPathError> {
    let search_radius = position_search_radius.unwrap_or(5.0);
    let default_filter = QueryFilter::default();
    let filter = filter.unwrap_or(&default_filter);

    let Some((start_reference, start_point)) = nav_mesh.find_closest_polygon_in_box(
        nav_mesh_settings,
        start_position,
        Vec3::splat(search_radius),
    ) else {
        return Err(FindPathError::NoValidStartPolygon);
    };

    let Some((end_reference, end_point)) = nav_mesh.find_closest_polygon_in_box(
        nav_mesh_settings,
        end_position,
        Vec3::splat(search_radius),
    ) else {
        return Err(FindPathError::NoValidEndPolygon);
    };

    find_polygon_path(
        nav_mesh,
        start_reference,
        start_point,
        end_reference,
        end_point,
        filter,
    )
}

/// Position of the crossing point of ``link`` when stepping out of the
/// polygon behind ``from_reference``.
fn link_position(
    nav_mesh: &NavMeshTiles,
    from_reference: PolyRef,
    link: &Link,
    neighbour_tile: &crate::tiles::NavMeshTile,
    neighbour_polygon: &Polygon,
) -> Option<Vec3> {
    let (from_tile, from_polygon) = nav_mesh.get_tile_and_polygon(from_reference)?;

    match link {
        Link::Internal { edge, .. } => {
            let indices = &from_polygon.indices;
            let a = from_tile.vertices[indices[usize::from(*edge)] as usize];
            let b = from_tile.vertices[indices[usize::from(*edge + 1) % indices.len()] as usize];

            Some(a.lerp(b, 0.5))
        }
        Link::External {
            edge,
            bound_min,
            bound_max,
            ..
        } => {
            let indices = &from_polygon.indices;
            let a = from_tile.vertices[indices[usize::from(*edge)] as usize];
            let b = from_tile.vertices[indices[usize::from(*edge + 1) % indices.len()] as usize];

            const S: f32 = 1.0 / 255.0;
            let clamped_a = a.lerp(b, f32::from(*bound_min) * S);
            let clamped_b = a.lerp(b, f32::from(*bound_max) * S);

            Some(clamped_a.lerp(clamped_b, 0.5))
        }
        Link::OffMesh { endpoint, .. } => {
            if from_polygon.is_off_mesh() {
                let indices = &from_polygon.indices;
                Some(from_tile.vertices[indices[usize::from(*endpoint)] as usize])
            } else {
                // Stepping onto the connection: its endpoint vertex.
                let indices = &neighbour_polygon.indices;
                Some(neighbour_tile.vertices[indices[usize::from(*endpoint)] as usize])
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StraightPathPointKind {
    Start,
    Waypoint,
    /// The point enters an off-mesh connection; the next point is its exit.
    OffMeshConnection,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathVertex {
    pub position: Vec3,
    pub kind: StraightPathPointKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StringPullingError {
    #[error("the supplied path is empty")]
    PathEmpty,
    #[error("the path's start polygon is missing from the nav-mesh")]
    MissingStartTile,
    #[error("the path's end polygon is missing from the nav-mesh")]
    MissingEndTile,
    #[error("a path polygon is missing from the nav-mesh")]
    MissingNodeTile,
    #[error("two consecutive path polygons are not linked")]
    NoLinkBetweenPathPoints,
}

/// Performs "string pulling" (the funnel algorithm) on a polygon corridor,
/// producing an ordered world-space path.
pub fn perform_string_pulling_on_path(
    nav_mesh: &NavMeshTiles,
    start_position: Vec3,
    end_position: Vec3,
    path: &[PolyRef],
) -> Result<Vec<StraightPathVertex>, StringPullingError> {
    if path.is_empty() {
        return Err(StringPullingError::PathEmpty);
    }

    let Some((start_tile, start_polygon)) = nav_mesh.get_tile_and_polygon(path[0]) else {
        return Err(StringPullingError::MissingStartTile);
    };
    let Some((end_tile, end_polygon)) = nav_mesh.get_tile_and_polygon(*path.last().unwrap())
    else {
        return Err(StringPullingError::MissingEndTile);
    };

    let start_position = start_tile.get_closest_point_in_polygon(start_polygon, start_position);
    let end_position = end_tile.get_closest_point_in_polygon(end_polygon, end_position);

    let mut string_path = Vec::with_capacity(path.len() + 2);
    string_path.push(StraightPathVertex {
        position: start_position,
        kind: StraightPathPointKind::Start,
    });

    if path.len() > 1 {
        let mut portal_apex = start_position;
        let mut portal_left = start_position;
        let mut portal_right = start_position;

        let mut left_index = 0;
        let mut right_index = 0;

        // Portals whose left == right are off-mesh entry points; waypoints
        // landing on them get tagged.
        let mut off_mesh_points: Vec<Vec3> = Vec::new();

        let mut i = 0;
        while i < path.len() {
            let (left, right) = if i + 1 < path.len() {
                let (left, right, off_mesh) =
                    portal_between(nav_mesh, path[i], path[i + 1])?;
                if off_mesh {
                    off_mesh_points.push(left);
                }
                (left, right)
            } else {
                (end_position, end_position)
            };

            // Right vertex.
            if triangle_area_2d(portal_apex, portal_right, right) <= 0.0 {
                if portal_apex.distance_squared(portal_right) < (1.0 / 16384.0)
                    || triangle_area_2d(portal_apex, portal_left, right) > 0.0
                {
                    portal_right = right;
                    right_index = i;
                } else {
                    portal_apex = portal_left;

                    push_waypoint(&mut string_path, portal_apex, &off_mesh_points);

                    portal_left = portal_apex;
                    portal_right = portal_apex;
                    right_index = left_index;

                    i = left_index + 1;
                    continue;
                }
            }

            // Left vertex.
            if triangle_area_2d(portal_apex, portal_left, left) >= 0.0 {
                if portal_apex.distance_squared(portal_left) < (1.0 / 16384.0)
                    || triangle_area_2d(portal_apex, portal_right, left) < 0.0
                {
                    portal_left = left;
                    left_index = i;
                } else {
                    portal_apex = portal_right;

                    push_waypoint(&mut string_path, portal_apex, &off_mesh_points);

                    portal_left = portal_apex;
                    portal_right = portal_apex;
                    left_index = right_index;

                    i = right_index + 1;
                    continue;
                }
            }

            i += 1;
        }
    }

    string_path.push(StraightPathVertex {
        position: end_position,
        kind: StraightPathPointKind::End,
    });

    Ok(string_path)
}

fn push_waypoint(
    string_path: &mut Vec<StraightPathVertex>,
    position: Vec3,
    off_mesh_points: &[Vec3],
) {
    if string_path
        .last()
        .is_some_and(|last| last.position == position)
    {
        return;
    }

    let kind = if off_mesh_points
        .iter()
        .any(|point| point.distance_squared(position) < 1e-6)
    {
        StraightPathPointKind::OffMeshConnection
    } else {
        StraightPathPointKind::Waypoint
    };

    string_path.push(StraightPathVertex { position, kind });
}

/// The portal (left & right funnel points) between two adjacent corridor
/// polygons, plus whether it is an off-mesh hop.
fn portal_between(
    nav_mesh: &NavMeshTiles,
    from: PolyRef,
    to: PolyRef,
) -> Result<(Vec3, Vec3, bool), StringPullingError> {
    let Some((from_tile, from_polygon)) = nav_mesh.get_tile_and_polygon(from) else {
        return Err(StringPullingError::MissingNodeTile);
    };

    let link = from_polygon
        .links
        .iter()
        .find(|link| match link {
            Link::Internal {
                neighbour_polygon, ..
            } => nav_mesh.poly_ref_in_same_tile(from, *neighbour_polygon) == to,
            Link::External { neighbour, .. } => *neighbour == to,
            Link::OffMesh { neighbour, .. } => *neighbour == to,
        })
        .ok_or(StringPullingError::NoLinkBetweenPathPoints)?;

    match link {
        Link::Internal { edge, .. } => {
            let indices = &from_polygon.indices;
            let a = from_tile.vertices[indices[usize::from(*edge)] as usize];
            let b = from_tile.vertices[indices[usize::from(*edge + 1) % indices.len()] as usize];

            Ok((a, b, false))
        }
        Link::External {
            edge,
            bound_min,
            bound_max,
            ..
        } => {
            let indices = &from_polygon.indices;
            let a = from_tile.vertices[indices[usize::from(*edge)] as usize];
            let b = from_tile.vertices[indices[usize::from(*edge + 1) % indices.len()] as usize];

            const S: f32 = 1.0 / 255.0;
            let clamped_a = a.lerp(b, f32::from(*bound_min) * S);
            let clamped_b = a.lerp(b, f32::from(*bound_max) * S);

            Ok((clamped_a, clamped_b, false))
        }
        Link::OffMesh { endpoint, .. } => {
            let point = if from_polygon.is_off_mesh() {
                // Leaving the connection at the landing-side endpoint.
                from_tile.vertices[from_polygon.indices[usize::from(*endpoint)] as usize]
            } else {
                let Some((to_tile, to_polygon)) = nav_mesh.get_tile_and_polygon(to) else {
                    return Err(StringPullingError::MissingNodeTile);
                };
                to_tile.vertices[to_polygon.indices[usize::from(*endpoint)] as usize]
            };

            Ok((point, point, true))
        }
    }
}

/// Result of a [raycast]. ``t`` is in ``[0, infinity]`` along the ray;
/// values above ``1.0`` mean the ray reached the end without hitting a wall.
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    pub t: f32,
    /// Normal of the hit wall on the XZ-plane. Zero when nothing was hit.
    pub normal: Vec3,
    /// Polygons visited up to the hit.
    pub path: Vec<PolyRef>,
}

impl RaycastHit {
    pub fn has_hit(&self) -> bool {
        self.t <= 1.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RaycastError {
    #[error("the start polygon reference is invalid or stale")]
    InvalidStartRef,
}

/// Casts a "walkability" ray along the surface from ``start_position``
/// towards ``end_position``, walking polygon to polygon until a wall blocks
/// the segment.
pub fn raycast(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    start_position: Vec3,
    end_position: Vec3,
    filter: &QueryFilter,
) -> Result<RaycastHit, RaycastError> {
    if !nav_mesh.is_valid_poly_ref(start_reference) {
        return Err(RaycastError::InvalidStartRef);
    }

    let mut hit = RaycastHit {
        t: f32::MAX,
        normal: Vec3::ZERO,
        path: Vec::new(),
    };

    let mut current = start_reference;

    loop {
        let Some((tile, polygon)) = nav_mesh.get_tile_and_polygon(current) else {
            break;
        };

        let vertices = tile.polygon_vertices(polygon);
        let Some((_, t_max, _, exit_edge)) =
            intersect_segment_polygon_2d(start_position, end_position, &vertices)
        else {
            // The ray never enters the current polygon.
            hit.t = 0.0;
            break;
        };

        hit.path.push(current);

        let Some(exit_edge) = exit_edge else {
            // The end lies inside this polygon.
            return Ok(hit);
        };

        // Follow the link crossing the exit edge.
        let mut next = None;
        for link in polygon.links.iter() {
            let (edge, neighbour_reference) = match link {
                Link::Internal {
                    edge,
                    neighbour_polygon,
                } => (
                    *edge,
                    nav_mesh.poly_ref_in_same_tile(current, *neighbour_polygon),
                ),
                Link::External { edge, neighbour, .. } => (*edge, *neighbour),
                Link::OffMesh { .. } => continue,
            };

            if usize::from(edge) != exit_edge {
                continue;
            }

            let Some((_, neighbour_polygon)) = nav_mesh.get_tile_and_polygon(neighbour_reference)
            else {
                continue;
            };
            if !filter.passes(neighbour_polygon) {
                continue;
            }

            if let Link::External {
                bound_min,
                bound_max,
                ..
            } = link
            {
                // The crossing point must lie within the linked sub-range.
                let a = vertices[exit_edge];
                let b = vertices[(exit_edge + 1) % vertices.len()];
                let crossing = start_position.lerp(end_position, t_max);

                let (_, edge_t) = distance_point_to_segment_2d(crossing, a, b);
                const S: f32 = 1.0 / 255.0;
                if edge_t < f32::from(*bound_min) * S - 1e-3
                    || edge_t > f32::from(*bound_max) * S + 1e-3
                {
                    continue;
                }
            }

            next = Some(neighbour_reference);
            break;
        }

        let Some(next) = next else {
            // Wall hit.
            let a = vertices[exit_edge];
            let b = vertices[(exit_edge + 1) % vertices.len()];

            hit.t = t_max;
            hit.normal = Vec3::new(b.z - a.z, 0.0, -(b.x - a.x)).normalize_or_zero();
            break;
        };

        current = next;
    }

    Ok(hit)
}

/// Distance from ``center`` to the nearest wall reachable within
/// ``max_radius``, plus the hit point & wall normal.
pub fn find_distance_to_wall(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    center: Vec3,
    max_radius: f32,
    filter: &QueryFilter,
) -> Result<(f32, Vec3, Vec3), RaycastError> {
    if !nav_mesh.is_valid_poly_ref(start_reference) {
        return Err(RaycastError::InvalidStartRef);
    }

    let mut pool = NodePool::new(MAX_SEARCH_NODES);
    let mut open = OpenList::default();

    let start = pool.get_or_create(start_reference).unwrap();
    pool.nodes[usize::from(start)].position = center;
    pool.nodes[usize::from(start)].state = NodeState::Open;
    open.push(start, &pool.nodes);

    let mut radius_squared = max_radius * max_radius;
    let mut hit_position = center;

    while let Some(best) = open.pop(&pool.nodes) {
        let (best_reference, best_cost) = {
            let node = &mut pool.nodes[usize::from(best)];
            node.state = NodeState::Closed;
            (node.reference, node.cost)
        };

        let Some((tile, polygon)) = nav_mesh.get_tile_and_polygon(best_reference) else {
            continue;
        };

        let vertices = tile.polygon_vertices(polygon);

        // Walls: edges without a traversable link.
        for edge in 0..vertices.len() {
            let passable = polygon.links.iter().any(|link| {
                let (link_edge, neighbour_reference) = match link {
                    Link::Internal {
                        edge,
                        neighbour_polygon,
                    } => (
                        *edge,
                        nav_mesh.poly_ref_in_same_tile(best_reference, *neighbour_polygon),
                    ),
                    Link::External { edge, neighbour, .. } => (*edge, *neighbour),
                    Link::OffMesh { .. } => return false,
                };

                usize::from(link_edge) == edge
                    && nav_mesh
                        .get_tile_and_polygon(neighbour_reference)
                        .is_some_and(|(_, neighbour)| filter.passes(neighbour))
            });

            if passable {
                continue;
            }

            let a = vertices[edge];
            let b = vertices[(edge + 1) % vertices.len()];

            let (distance_squared, t) = distance_point_to_segment_2d(center, a, b);
            if distance_squared < radius_squared {
                radius_squared = distance_squared;
                hit_position = a.lerp(b, t);
            }
        }

        // Expand.
        for link in polygon.links.iter() {
            let neighbour_reference = match link {
                Link::Internal {
                    neighbour_polygon, ..
                } => nav_mesh.poly_ref_in_same_tile(best_reference, *neighbour_polygon),
                Link::External { neighbour, .. } => *neighbour,
                Link::OffMesh { .. } => continue,
            };

            let Some((neighbour_tile, neighbour_polygon)) =
                nav_mesh.get_tile_and_polygon(neighbour_reference)
            else {
                continue;
            };
            if !filter.passes(neighbour_polygon) {
                continue;
            }

            let Some(position) = link_position(
                nav_mesh,
                best_reference,
                link,
                neighbour_tile,
                neighbour_polygon,
            ) else {
                continue;
            };

            if center.distance_squared(position) > radius_squared {
                continue;
            }

            let Some(neighbour) = pool.get_or_create(neighbour_reference) else {
                continue;
            };

            let cost = best_cost + center.distance(position);
            let node = &mut pool.nodes[usize::from(neighbour)];
            if node.state != NodeState::Unchecked && cost >= node.cost {
                continue;
            }

            let old_state = node.state;
            node.position = position;
            node.parent = best;
            node.cost = cost;
            node.total = cost;
            node.state = NodeState::Open;

            if old_state == NodeState::Open {
                open.update(neighbour, &pool.nodes);
            } else {
                open.push(neighbour, &pool.nodes);
            }
        }
    }

    let distance = radius_squared.sqrt();
    let normal = if distance > 1e-5 {
        Vec3::new(center.x - hit_position.x, 0.0, center.z - hit_position.z).normalize_or_zero()
    } else {
        Vec3::ZERO
    };

    Ok((distance, hit_position, normal))
}

/// One polygon discovered by a region query, with the polygon it was reached
/// from & the accumulated traversal cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolySearchResult {
    pub reference: PolyRef,
    pub parent: Option<PolyRef>,
    pub cost: f32,
}

/// Polygons discovered by a region query. ``truncated`` is set when the
/// result limit cut the search short.
#[derive(Debug, Clone, PartialEq)]
pub struct PolySearch {
    pub polygons: Vec<PolySearchResult>,
    pub truncated: bool,
}

/// Finds the polygons reachable from ``start_reference`` whose portals are
/// touched by the circle around ``center``.
pub fn find_polys_around_circle(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    center: Vec3,
    radius: f32,
    filter: &QueryFilter,
    max_result: usize,
) -> Result<PolySearch, RaycastError> {
    find_polys_around(
        nav_mesh,
        start_reference,
        center,
        filter,
        max_result,
        |a: Vec3, b: Vec3| {
            let (distance_squared, _) = distance_point_to_segment_2d(center, a, b);
            distance_squared <= radius * radius
        },
    )
}

/// Finds the polygons reachable from ``start_reference`` whose portals cross
/// the convex XZ polygon ``shape``.
pub fn find_polys_around_shape(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    shape: &[Vec3],
    filter: &QueryFilter,
    max_result: usize,
) -> Result<PolySearch, RaycastError> {
    let centroid = shape.iter().copied().sum::<Vec3>() / shape.len().max(1) as f32;

    find_polys_around(
        nav_mesh,
        start_reference,
        centroid,
        filter,
        max_result,
        |a: Vec3, b: Vec3| intersect_segment_polygon_2d(a, b, shape).is_some(),
    )
}

fn find_polys_around(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    start_position: Vec3,
    filter: &QueryFilter,
    max_result: usize,
    mut portal_admitted: impl FnMut(Vec3, Vec3) -> bool,
) -> Result<PolySearch, RaycastError> {
    if !nav_mesh.is_valid_poly_ref(start_reference) {
        return Err(RaycastError::InvalidStartRef);
    }

    let mut pool = NodePool::new(MAX_SEARCH_NODES);
    let mut open = OpenList::default();

    let start = pool.get_or_create(start_reference).unwrap();
    pool.nodes[usize::from(start)].position = start_position;
    pool.nodes[usize::from(start)].state = NodeState::Open;
    open.push(start, &pool.nodes);

    let mut search = PolySearch {
        polygons: Vec::new(),
        truncated: false,
    };

    while let Some(best) = open.pop(&pool.nodes) {
        let (best_reference, best_cost, best_parent, best_position) = {
            let node = &mut pool.nodes[usize::from(best)];
            node.state = NodeState::Closed;
            (node.reference, node.cost, node.parent, node.position)
        };

        if search.polygons.len() >= max_result {
            search.truncated = true;
            break;
        }

        search.polygons.push(PolySearchResult {
            reference: best_reference,
            parent: (best_parent != NULL_NODE)
                .then(|| pool.nodes[usize::from(best_parent)].reference),
            cost: best_cost,
        });

        let Some((tile, polygon)) = nav_mesh.get_tile_and_polygon(best_reference) else {
            continue;
        };

        for link in polygon.links.clone() {
            let neighbour_reference = match link {
                Link::Internal {
                    neighbour_polygon, ..
                } => nav_mesh.poly_ref_in_same_tile(best_reference, neighbour_polygon),
                Link::External { neighbour, .. } => neighbour,
                Link::OffMesh { .. } => continue,
            };

            let Some((neighbour_tile, neighbour_polygon)) =
                nav_mesh.get_tile_and_polygon(neighbour_reference)
            else {
                continue;
            };
            if !filter.passes(neighbour_polygon) {
                continue;
            }

            // Portal edge of the link.
            let (edge_a, edge_b) = match &link {
                Link::Internal { edge, .. } | Link::External { edge, .. } => {
                    let indices = &polygon.indices;
                    let a = tile.vertices[indices[usize::from(*edge)] as usize];
                    let b =
                        tile.vertices[indices[usize::from(*edge + 1) % indices.len()] as usize];
                    (a, b)
                }
                Link::OffMesh { .. } => continue,
            };

            if !portal_admitted(edge_a, edge_b) {
                continue;
            }

            let Some(neighbour) = pool.get_or_create(neighbour_reference) else {
                search.truncated = true;
                continue;
            };

            let position = edge_a.lerp(edge_b, 0.5);
            let cost = best_cost + best_position.distance(position);

            let node = &mut pool.nodes[usize::from(neighbour)];
            if node.state != NodeState::Unchecked && cost >= node.cost {
                continue;
            }

            let old_state = node.state;
            node.position = position;
            node.parent = best;
            node.cost = cost;
            node.total = cost;
            node.state = NodeState::Open;

            if old_state == NodeState::Open {
                open.update(neighbour, &pool.nodes);
            } else {
                open.push(neighbour, &pool.nodes);
            }
        }
    }

    Ok(search)
}

/// Finds the non-overlapping polygons around ``center`` reachable without
/// leaving ``radius``, constrained so the result never doubles back over
/// itself on another floor.
pub fn find_local_neighbourhood(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    center: Vec3,
    radius: f32,
    filter: &QueryFilter,
    max_result: usize,
) -> Result<Vec<PolyRef>, RaycastError> {
    if !nav_mesh.is_valid_poly_ref(start_reference) {
        return Err(RaycastError::InvalidStartRef);
    }

    const MAX_STACK: usize = 48;

    let mut stack = std::collections::VecDeque::with_capacity(MAX_STACK);
    let mut visited = vec![start_reference];
    let mut result = vec![start_reference];

    stack.push_back(start_reference);

    let radius_squared = radius * radius;

    while let Some(current) = stack.pop_front() {
        let Some((tile, polygon)) = nav_mesh.get_tile_and_polygon(current) else {
            continue;
        };

        for link in polygon.links.iter() {
            let neighbour_reference = match link {
                Link::Internal {
                    neighbour_polygon, ..
                } => nav_mesh.poly_ref_in_same_tile(current, *neighbour_polygon),
                Link::External { neighbour, .. } => *neighbour,
                Link::OffMesh { .. } => continue,
            };

            if visited.contains(&neighbour_reference) {
                continue;
            }

            let Some((neighbour_tile, neighbour_polygon)) =
                nav_mesh.get_tile_and_polygon(neighbour_reference)
            else {
                continue;
            };
            if neighbour_polygon.is_off_mesh() || !filter.passes(neighbour_polygon) {
                continue;
            }

            // The portal must be within reach.
            let (edge_a, edge_b) = match link {
                Link::Internal { edge, .. } | Link::External { edge, .. } => {
                    let indices = &polygon.indices;
                    let a = tile.vertices[indices[usize::from(*edge)] as usize];
                    let b =
                        tile.vertices[indices[usize::from(*edge + 1) % indices.len()] as usize];
                    (a, b)
                }
                Link::OffMesh { .. } => continue,
            };
            let (portal_distance, _) = distance_point_to_segment_2d(center, edge_a, edge_b);
            if portal_distance > radius_squared {
                continue;
            }

            visited.push(neighbour_reference);

            // Reject candidates overlapping polygons already collected; they
            // sit on another floor of the same area.
            let neighbour_vertices = neighbour_tile.polygon_vertices(neighbour_polygon);
            let overlaps = result.iter().any(|accepted| {
                nav_mesh
                    .get_tile_and_polygon(*accepted)
                    .is_some_and(|(accepted_tile, accepted_polygon)| {
                        let accepted_vertices =
                            accepted_tile.polygon_vertices(accepted_polygon);
                        overlap_polygons_2d(&neighbour_vertices, &accepted_vertices)
                    })
            });

            if overlaps {
                continue;
            }

            if result.len() < max_result {
                result.push(neighbour_reference);
            }
            if stack.len() < MAX_STACK {
                stack.push_back(neighbour_reference);
            }
        }
    }

    Ok(result)
}

/// Greedy constrained walk across the surface from ``start_position``
/// towards ``end_position``, sliding along walls. Returns the final position
/// & the polygons visited on the way.
pub fn move_along_surface(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    start_position: Vec3,
    end_position: Vec3,
    filter: &QueryFilter,
) -> Result<(Vec3, Vec<PolyRef>), RaycastError> {
    if !nav_mesh.is_valid_poly_ref(start_reference) {
        return Err(RaycastError::InvalidStartRef);
    }

    const MAX_STACK: usize = 48;

    let mut stack = std::collections::VecDeque::with_capacity(MAX_STACK);
    let mut visited = Vec::new();

    stack.push_back(start_reference);
    visited.push(start_reference);

    let mut best_position = start_position;
    let mut best_distance = f32::MAX;

    let search_radius = start_position.distance(end_position) * 0.5 + 0.05;
    let search_radius_squared = search_radius * search_radius;

    while let Some(current) = stack.pop_front() {
        let Some((tile, polygon)) = nav_mesh.get_tile_and_polygon(current) else {
            continue;
        };

        let vertices = tile.polygon_vertices(polygon);

        if point_in_polygon_2d(end_position, &vertices) {
            best_position = end_position;
            break;
        }

        for edge in 0..vertices.len() {
            let a = vertices[edge];
            let b = vertices[(edge + 1) % vertices.len()];

            let linked: Vec<PolyRef> = polygon
                .links
                .iter()
                .filter_map(|link| match link {
                    Link::Internal {
                        edge: link_edge,
                        neighbour_polygon,
                    } if usize::from(*link_edge) == edge => Some(
                        nav_mesh.poly_ref_in_same_tile(current, *neighbour_polygon),
                    ),
                    Link::External {
                        edge: link_edge,
                        neighbour,
                        ..
                    } if usize::from(*link_edge) == edge => Some(*neighbour),
                    _ => None,
                })
                .filter(|reference| {
                    nav_mesh
                        .get_tile_and_polygon(*reference)
                        .is_some_and(|(_, neighbour)| filter.passes(neighbour))
                })
                .collect();

            if linked.is_empty() {
                // Wall: slide the target onto it.
                let (distance_squared, t) = distance_point_to_segment_2d(end_position, a, b);
                if distance_squared < best_distance {
                    best_distance = distance_squared;
                    best_position = a.lerp(b, t);
                }
            } else {
                for neighbour in linked {
                    if visited.contains(&neighbour) {
                        continue;
                    }

                    // Only wander as far as the search capsule.
                    let (edge_distance, _) =
                        distance_point_to_segment_2d(start_position, a, b);
                    if edge_distance > search_radius_squared {
                        continue;
                    }

                    if stack.len() < MAX_STACK {
                        visited.push(neighbour);
                        stack.push_back(neighbour);
                    }
                }
            }
        }
    }

    Ok((best_position, visited))
}

/// Repairs a corridor after [move_along_surface], keeping the tail from the
/// furthest polygon both lists have in common.
pub fn fixup_corridor(corridor: &mut Vec<PolyRef>, visited: &[PolyRef]) {
    let mut furthest_path = None;
    let mut furthest_visited = None;

    'outer: for (path_index, path_reference) in corridor.iter().enumerate().rev() {
        for (visited_index, visited_reference) in visited.iter().enumerate().rev() {
            if path_reference == visited_reference {
                furthest_path = Some(path_index);
                furthest_visited = Some(visited_index);
                break 'outer;
            }
        }
    }

    let (Some(furthest_path), Some(furthest_visited)) = (furthest_path, furthest_visited) else {
        return;
    };

    // The new corridor starts where the walk ended, runs back to the common
    // polygon, then follows the old corridor's tail.
    let mut fixed = Vec::with_capacity(visited.len() - furthest_visited + corridor.len());
    fixed.extend(visited[furthest_visited..].iter().rev());
    fixed.extend_from_slice(&corridor[(furthest_path + 1).min(corridor.len())..]);

    *corridor = fixed;
}

/// Uniformly random point on the nav-mesh. ``random`` must yield values in
/// ``[0, 1)``.
pub fn find_random_point(
    nav_mesh: &NavMeshTiles,
    filter: &QueryFilter,
    random: &mut impl FnMut() -> f32,
) -> Option<(PolyRef, Vec3)> {
    // Pick a polygon weighted by surface area, then sample inside it.
    let mut chosen: Option<PolyRef> = None;
    let mut total_area = 0.0;

    for (tile_ref, tile) in nav_mesh.tiles() {
        for (polygon_index, polygon) in tile.polygons.iter().enumerate() {
            if polygon.is_off_mesh() || !filter.passes(polygon) {
                continue;
            }

            let vertices = tile.polygon_vertices(polygon);
            let mut area = 0.0;
            for i in 2..vertices.len() {
                area += triangle_area_2d(vertices[0], vertices[i - 1], vertices[i]).abs() * 0.5;
            }

            total_area += area;
            let reference =
                nav_mesh.poly_ref_in_same_tile(PolyRef::from(tile_ref), polygon_index as u16);

            // Reservoir sampling keeps a single pass.
            if random() * total_area <= area || chosen.is_none() {
                chosen = Some(reference);
            }
        }
    }

    let reference = chosen?;
    let (tile, polygon) = nav_mesh.get_tile_and_polygon(reference)?;
    let vertices = tile.polygon_vertices(polygon);

    let point = random_point_in_convex_polygon(&vertices, random(), random());
    let height = tile.polygon_height_at(polygon, point).unwrap_or(point.y);

    Some((reference, Vec3::new(point.x, height, point.z)))
}

/// Random point on the nav-mesh reachable from ``start_reference`` within
/// ``radius`` of ``center``.
pub fn find_random_point_around_circle(
    nav_mesh: &NavMeshTiles,
    start_reference: PolyRef,
    center: Vec3,
    radius: f32,
    filter: &QueryFilter,
    random: &mut impl FnMut() -> f32,
) -> Option<(PolyRef, Vec3)> {
    let reachable = find_polys_around_circle(
        nav_mesh,
        start_reference,
        center,
        radius,
        filter,
        MAX_SEARCH_NODES,
    )
    .ok()?;

    // Weighted pick among the reached polygons.
    let mut chosen = None;
    let mut total_area = 0.0;

    for result in reachable.polygons.iter() {
        let Some((tile, polygon)) = nav_mesh.get_tile_and_polygon(result.reference) else {
            continue;
        };
        if polygon.is_off_mesh() {
            continue;
        }

        let vertices = tile.polygon_vertices(polygon);
        let mut area = 0.0;
        for i in 2..vertices.len() {
            area += triangle_area_2d(vertices[0], vertices[i - 1], vertices[i]).abs() * 0.5;
        }

        total_area += area;
        if random() * total_area <= area || chosen.is_none() {
            chosen = Some(result.reference);
        }
    }

    let reference = chosen?;
    let (tile, polygon) = nav_mesh.get_tile_and_polygon(reference)?;
    let vertices = tile.polygon_vertices(polygon);

    let mut point = random_point_in_convex_polygon(&vertices, random(), random());

    // Clamp into the circle.
    let offset = Vec2::new(point.x - center.x, point.z - center.z);
    if offset.length_squared() > radius * radius {
        let clamped = offset.normalize_or_zero() * radius;
        point.x = center.x + clamped.x;
        point.z = center.z + clamped.y;
        point = tile.get_closest_point_in_polygon(polygon, point);
    }

    let height = tile.polygon_height_at(polygon, point).unwrap_or(point.y);

    Some((reference, Vec3::new(point.x, height, point.z)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_list_orders_by_total_then_cost() {
        let mut nodes = Vec::new();
        for (cost, total) in [(0.0, 5.0), (1.0, 3.0), (2.0, 3.0), (0.0, 7.0)] {
            nodes.push(Node {
                reference: PolyRef::NULL,
                position: Vec3::ZERO,
                cost,
                total,
                parent: NULL_NODE,
                state: NodeState::Open,
            });
        }

        let mut open = OpenList::default();
        for i in 0..nodes.len() as u16 {
            open.push(i, &nodes);
        }

        assert_eq!(open.pop(&nodes), Some(1)); // total 3, cost 1
        assert_eq!(open.pop(&nodes), Some(2)); // total 3, cost 2
        assert_eq!(open.pop(&nodes), Some(0)); // total 5
        assert_eq!(open.pop(&nodes), Some(3)); // total 7
        assert_eq!(open.pop(&nodes), None);
    }

    #[test]
    fn node_pool_deduplicates_by_reference() {
        let mut pool = NodePool::new(8);

        let a = PolyRef::from_raw(0x10);
        let b = PolyRef::from_raw(0x20);

        let first = pool.get_or_create(a).unwrap();
        let second = pool.get_or_create(b).unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.get_or_create(a), Some(first));
    }

    #[test]
    fn node_pool_reports_exhaustion() {
        let mut pool = NodePool::new(2);

        assert!(pool.get_or_create(PolyRef::from_raw(1)).is_some());
        assert!(pool.get_or_create(PolyRef::from_raw(2)).is_some());
        assert!(pool.get_or_create(PolyRef::from_raw(3)).is_none());
        // Existing entries stay reachable.
        assert!(pool.get_or_create(PolyRef::from_raw(1)).is_some());
    }
}
