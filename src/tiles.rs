//! The runtime nav-mesh: a spatial table of tiles holding convex polygons,
//! linked to each other within & across tiles.
//!
//! Polygons are addressed by [PolyRef], an opaque handle packing the owning
//! tile slot's salt. Removing & re-adding a tile bumps the salt, so stale refs
//! held by callers are detectably invalid instead of silently wrong.

use std::collections::HashMap;

use bevy::prelude::{UVec2, Vec2, Vec3};
use smallvec::SmallVec;
use thiserror::Error;

use crate::detail_mesh::PolyMeshDetail;
use crate::math::{closest_height_on_triangle, distance_point_to_segment_2d, point_in_polygon_2d};
use crate::mesher::{
    count_polygon_vertices, EdgeConnection, EdgeConnectionDirection, PolyMesh,
};
use crate::{Area, NavMeshSettings};

/// Opaque handle to one polygon of the nav-mesh, packing
/// ``(salt, tile slot, polygon index)``.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct PolyRef(u64);

impl PolyRef {
    pub const NULL: PolyRef = PolyRef(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<PolyRef> for u64 {
    fn from(reference: PolyRef) -> u64 {
        reference.0
    }
}

impl From<TileRef> for PolyRef {
    fn from(reference: TileRef) -> PolyRef {
        PolyRef(reference.0)
    }
}

/// Opaque handle to one tile slot, packing ``(salt, tile slot)``.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TileRef(u64);

impl TileRef {
    pub const NULL: TileRef = TileRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A connection from one polygon to a neighbouring one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Link {
    /// A shared edge with another polygon of the same tile.
    Internal { edge: u8, neighbour_polygon: u16 },
    /// A portal edge matched against a polygon of a neighbouring tile.
    External {
        edge: u8,
        neighbour: PolyRef,
        direction: EdgeConnectionDirection,
        /// Sub-range of the edge covered by the connection, normalized to
        /// ``0..=255``.
        bound_min: u8,
        bound_max: u8,
    },
    /// A traversal over an off-mesh connection. On a ground polygon
    /// ``neighbour`` is the connection polygon; on the connection polygon it
    /// is the landing polygon at ``endpoint``.
    OffMesh { neighbour: PolyRef, endpoint: u8 },
}

/// A point-to-point jump/teleport edge, stored in the tile as a degenerate
/// two-vertex polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct OffMeshConnection {
    pub start: Vec3,
    pub end: Vec3,
    /// Snap tolerance around the endpoints when looking for the landing
    /// polygons.
    pub radius: f32,
    pub bidirectional: bool,
    pub area: Area,
    pub flags: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    /// Counter-clockwise vertex indices. Two for off-mesh connections.
    pub indices: Vec<u32>,
    /// Static per-edge adjacency computed by the mesher.
    pub edges: Vec<EdgeConnection>,
    /// Dynamic links, rebuilt whenever tiles get added or removed.
    pub links: Vec<Link>,
    pub area: Area,
    pub flags: u16,
}

impl Polygon {
    #[inline]
    pub fn is_off_mesh(&self) -> bool {
        self.indices.len() == 2
    }
}

/// Node of the static bounding-volume tree over a tile's polygons. Bounds are
/// quantized relative to the tile's minimum bound. Non-negative ``i`` is a
/// polygon index, negative is the escape offset to skip the subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BvNode {
    pub min: [u16; 3],
    pub max: [u16; 3],
    pub i: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NavMeshTile {
    pub coord: UVec2,
    pub layer: u16,
    pub vertices: Vec<Vec3>,
    pub polygons: Vec<Polygon>,
    pub detail: Option<PolyMeshDetail>,
    pub off_mesh_connections: Vec<OffMeshConnection>,
    pub bv_tree: Vec<BvNode>,
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

impl NavMeshTile {
    /// Index of the polygon backing off-mesh connection ``i``.
    pub fn off_mesh_polygon_index(&self, connection: usize) -> usize {
        self.polygons.len() - self.off_mesh_connections.len() + connection
    }

    /// Index of the off-mesh connection backing polygon ``polygon``, if any.
    pub fn off_mesh_connection_index(&self, polygon: usize) -> Option<usize> {
        let base = self.polygons.len() - self.off_mesh_connections.len();
        (polygon >= base).then(|| polygon - base)
    }

    pub(crate) fn polygon_vertices(&self, polygon: &Polygon) -> SmallVec<[Vec3; 6]> {
        polygon
            .indices
            .iter()
            .map(|index| self.vertices[*index as usize])
            .collect()
    }

    /// Closest point on the polygon to ``position`` plus whether the position
    /// was already over the polygon.
    pub fn get_closest_point_in_polygon(&self, polygon: &Polygon, position: Vec3) -> Vec3 {
        let vertices = self.polygon_vertices(polygon);

        if polygon.is_off_mesh() {
            let (_, t) = distance_point_to_segment_2d(position, vertices[0], vertices[1]);
            return vertices[0].lerp(vertices[1], t);
        }

        if point_in_polygon_2d(position, &vertices) {
            let height = self
                .polygon_height_at(polygon, position)
                .unwrap_or(position.y);
            return Vec3::new(position.x, height, position.z);
        }

        // Outside: clamp to the nearest boundary edge.
        let mut closest = vertices[0];
        let mut closest_distance = f32::MAX;
        for i in 0..vertices.len() {
            let a = vertices[i];
            let b = vertices[(i + 1) % vertices.len()];

            let (distance, t) = distance_point_to_segment_2d(position, a, b);
            if distance < closest_distance {
                closest_distance = distance;
                closest = a.lerp(b, t);
            }
        }

        closest
    }

    /// Accurate surface height at the XZ-position, sampled from the detail
    /// mesh when present, else interpolated over the polygon fan.
    pub fn polygon_height_at(&self, polygon: &Polygon, position: Vec3) -> Option<f32> {
        if polygon.is_off_mesh() {
            return None;
        }

        let polygon_index = self
            .polygons
            .iter()
            .position(|other| std::ptr::eq(other, polygon))?;

        if let Some(detail) = &self.detail {
            let [vertex_base, _, triangle_base, triangle_count] = detail.meshes[polygon_index];

            for triangle in
                &detail.triangles[triangle_base as usize..(triangle_base + triangle_count) as usize]
            {
                let resolve = |index: u8| {
                    if usize::from(index) < polygon.indices.len() {
                        self.vertices[polygon.indices[usize::from(index)] as usize]
                    } else {
                        detail.vertices
                            [vertex_base as usize + usize::from(index) - polygon.indices.len()]
                    }
                };

                let a = resolve(triangle[0]);
                let b = resolve(triangle[1]);
                let c = resolve(triangle[2]);

                if let Some(height) = closest_height_on_triangle(position, a, b, c) {
                    return Some(height);
                }
            }
        }

        // Fan interpolation over the base polygon.
        let vertices = self.polygon_vertices(polygon);
        for i in 2..vertices.len() {
            if let Some(height) =
                closest_height_on_triangle(position, vertices[0], vertices[i - 1], vertices[i])
            {
                return Some(height);
            }
        }

        None
    }
}

#[derive(Debug, Default)]
struct TileSlot {
    salt: u32,
    tile: Option<NavMeshTile>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddTileError {
    #[error("a tile already occupies coordinate {coord:?} layer {layer}")]
    AlreadyOccupied { coord: UVec2, layer: u16 },
    #[error("the nav-mesh tile limit of {0} is reached")]
    TileLimitReached(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidTileRef {
    #[error("tile reference is null")]
    Null,
    #[error("tile reference is stale or out of range")]
    Stale,
}

/// The tiled nav-mesh: tile slots with salts, a coordinate lookup & the
/// packed polygon-reference layout.
#[derive(Debug)]
pub struct NavMeshTiles {
    slots: Vec<TileSlot>,
    /// Tile chains per coordinate; each entry is a slot holding one layer.
    lookup: HashMap<UVec2, SmallVec<[u16; 1]>>,
    free_slots: Vec<u16>,
    max_tiles: usize,
    max_polys_per_tile: usize,
    tile_bits: u32,
    poly_bits: u32,
    salt_bits: u32,
}

impl Default for NavMeshTiles {
    fn default() -> Self {
        Self::new(1024, 4096)
    }
}

impl NavMeshTiles {
    /// Creates an empty nav-mesh able to hold ``max_tiles`` tiles of up to
    /// ``max_polys_per_tile`` polygons. These determine the bit layout of
    /// every [PolyRef] handed out by this instance.
    pub fn new(max_tiles: usize, max_polys_per_tile: usize) -> Self {
        let tile_bits = (max_tiles.next_power_of_two().trailing_zeros()).max(1);
        let poly_bits = (max_polys_per_tile.next_power_of_two().trailing_zeros()).max(1);
        let salt_bits = (64 - tile_bits - poly_bits).min(31);

        Self {
            slots: Vec::new(),
            lookup: HashMap::new(),
            free_slots: Vec::new(),
            max_tiles,
            max_polys_per_tile,
            tile_bits,
            poly_bits,
            salt_bits,
        }
    }

    pub fn max_tiles(&self) -> usize {
        self.max_tiles
    }

    pub fn max_polys_per_tile(&self) -> usize {
        self.max_polys_per_tile
    }

    #[inline]
    fn encode(&self, salt: u32, slot: u32, polygon: u32) -> PolyRef {
        PolyRef(
            (u64::from(salt) << (self.poly_bits + self.tile_bits))
                | (u64::from(slot) << self.poly_bits)
                | u64::from(polygon),
        )
    }

    #[inline]
    fn decode(&self, reference: PolyRef) -> (u32, u32, u32) {
        let poly_mask = (1u64 << self.poly_bits) - 1;
        let tile_mask = (1u64 << self.tile_bits) - 1;
        let salt_mask = (1u64 << self.salt_bits) - 1;

        let polygon = (reference.0 & poly_mask) as u32;
        let slot = ((reference.0 >> self.poly_bits) & tile_mask) as u32;
        let salt = ((reference.0 >> (self.poly_bits + self.tile_bits)) & salt_mask) as u32;

        (salt, slot, polygon)
    }

    /// The ref of polygon ``polygon`` in the tile at ``slot``, under the
    /// slot's current salt.
    fn poly_ref(&self, slot: u16, polygon: u16) -> PolyRef {
        self.encode(self.slots[usize::from(slot)].salt, u32::from(slot), u32::from(polygon))
    }

    fn tile_ref(&self, slot: u16) -> TileRef {
        TileRef(self.poly_ref(slot, 0).0)
    }

    fn bump_salt(&mut self, slot: u16) {
        let slot = &mut self.slots[usize::from(slot)];
        let mask = (1u32 << self.salt_bits) - 1;
        slot.salt = (slot.salt + 1) & mask;
        if slot.salt == 0 {
            slot.salt = 1;
        }
    }

    pub fn tile_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.tile.is_some()).count()
    }

    /// Iterates over all loaded tiles with their refs.
    pub fn tiles(&self) -> impl Iterator<Item = (TileRef, &NavMeshTile)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.tile
                .as_ref()
                .map(|tile| (self.tile_ref(i as u16), tile))
        })
    }

    pub fn get_tile_at(&self, coord: UVec2, layer: u16) -> Option<&NavMeshTile> {
        self.slot_at(coord, layer)
            .and_then(|slot| self.slots[usize::from(slot)].tile.as_ref())
    }

    pub fn get_tile_ref_at(&self, coord: UVec2, layer: u16) -> Option<TileRef> {
        self.slot_at(coord, layer).map(|slot| self.tile_ref(slot))
    }

    fn slot_at(&self, coord: UVec2, layer: u16) -> Option<u16> {
        self.lookup.get(&coord)?.iter().copied().find(|slot| {
            self.slots[usize::from(*slot)]
                .tile
                .as_ref()
                .is_some_and(|tile| tile.layer == layer)
        })
    }

    pub fn get_tile(&self, reference: TileRef) -> Result<&NavMeshTile, InvalidTileRef> {
        let (salt, slot, _) = self.decode(PolyRef(reference.0));
        if reference.is_null() {
            return Err(InvalidTileRef::Null);
        }

        let tile_slot = self
            .slots
            .get(slot as usize)
            .ok_or(InvalidTileRef::Stale)?;
        if tile_slot.salt != salt {
            return Err(InvalidTileRef::Stale);
        }

        tile_slot.tile.as_ref().ok_or(InvalidTileRef::Stale)
    }

    /// True when the ref's salt matches the referenced slot's current salt
    /// and the polygon exists.
    pub fn is_valid_poly_ref(&self, reference: PolyRef) -> bool {
        self.get_tile_and_polygon(reference).is_some()
    }

    pub fn get_tile_and_polygon(&self, reference: PolyRef) -> Option<(&NavMeshTile, &Polygon)> {
        if reference.is_null() {
            return None;
        }

        let (salt, slot, polygon) = self.decode(reference);
        let tile_slot = self.slots.get(slot as usize)?;
        if tile_slot.salt != salt {
            return None;
        }

        let tile = tile_slot.tile.as_ref()?;
        let polygon = tile.polygons.get(polygon as usize)?;
        Some((tile, polygon))
    }

    /// Re-targets a ref at another polygon of the same tile, keeping the
    /// salt & slot bits.
    pub(crate) fn poly_ref_in_same_tile(&self, reference: PolyRef, polygon: u16) -> PolyRef {
        let poly_mask = (1u64 << self.poly_bits) - 1;
        PolyRef((reference.0 & !poly_mask) | u64::from(polygon))
    }

    pub(crate) fn decode_slot_and_polygon(&self, reference: PolyRef) -> Option<(u16, u16)> {
        if reference.is_null() {
            return None;
        }

        let (salt, slot, polygon) = self.decode(reference);
        let tile_slot = self.slots.get(slot as usize)?;
        if tile_slot.salt != salt || tile_slot.tile.is_none() {
            return None;
        }

        Some((slot as u16, polygon as u16))
    }

    /// Adds a tile & connects it to its neighbours. Fails when the
    /// ``(coord, layer)`` slot is already occupied; remove the old tile
    /// first to replace it.
    pub fn add_tile(
        &mut self,
        tile: NavMeshTile,
        nav_mesh_settings: &NavMeshSettings,
    ) -> Result<TileRef, AddTileError> {
        if self.slot_at(tile.coord, tile.layer).is_some() {
            return Err(AddTileError::AlreadyOccupied {
                coord: tile.coord,
                layer: tile.layer,
            });
        }

        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                if self.slots.len() >= self.max_tiles {
                    return Err(AddTileError::TileLimitReached(self.max_tiles));
                }
                self.slots.push(TileSlot::default());
                (self.slots.len() - 1) as u16
            }
        };

        self.bump_salt(slot);

        let coord = tile.coord;
        self.slots[usize::from(slot)].tile = Some(tile);
        self.lookup.entry(coord).or_default().push(slot);

        self.build_internal_links(slot);
        self.connect_off_mesh_links(slot, nav_mesh_settings);

        // Cross-link portals against every loaded neighbour.
        for direction in [
            EdgeConnectionDirection::XNegative,
            EdgeConnectionDirection::ZPositive,
            EdgeConnectionDirection::XPositive,
            EdgeConnectionDirection::ZNegative,
        ] {
            let Some(neighbour_coord) = direction.offset(coord) else {
                continue;
            };
            let Some(neighbour_slots) = self.lookup.get(&neighbour_coord) else {
                continue;
            };

            for neighbour_slot in neighbour_slots.clone() {
                self.connect_external_links(slot, neighbour_slot, direction, nav_mesh_settings);
                self.connect_external_links(
                    neighbour_slot,
                    slot,
                    direction.opposite(),
                    nav_mesh_settings,
                );
            }
        }

        Ok(self.tile_ref(slot))
    }

    /// Removes the tile, unlinking it from its neighbours, & returns it. The
    /// slot's salt advances so refs into the removed tile become stale.
    pub fn remove_tile(&mut self, reference: TileRef) -> Result<NavMeshTile, InvalidTileRef> {
        let (salt, slot, _) = self.decode(PolyRef(reference.0));
        if reference.is_null() {
            return Err(InvalidTileRef::Null);
        }

        let slot = slot as u16;
        let tile_slot = self
            .slots
            .get_mut(usize::from(slot))
            .ok_or(InvalidTileRef::Stale)?;
        if tile_slot.salt != salt {
            return Err(InvalidTileRef::Stale);
        }

        let tile = tile_slot.tile.take().ok_or(InvalidTileRef::Stale)?;

        // Unlink every cross-tile link pointing into the removed slot.
        let tile_mask = (1u64 << self.tile_bits) - 1;
        let poly_bits = self.poly_bits;
        for other_slot in self.slots.iter_mut() {
            let Some(other_tile) = other_slot.tile.as_mut() else {
                continue;
            };

            for polygon in other_tile.polygons.iter_mut() {
                polygon.links.retain(|link| {
                    let neighbour = match link {
                        Link::Internal { .. } => return true,
                        Link::External { neighbour, .. } => neighbour,
                        Link::OffMesh { neighbour, .. } => neighbour,
                    };

                    ((neighbour.0 >> poly_bits) & tile_mask) as u16 != slot
                });
            }
        }

        if let Some(chain) = self.lookup.get_mut(&tile.coord) {
            chain.retain(|chained| *chained != slot);
            if chain.is_empty() {
                self.lookup.remove(&tile.coord);
            }
        }

        self.bump_salt(slot);
        self.free_slots.push(slot);

        Ok(tile)
    }

    pub fn remove_tile_at(
        &mut self,
        coord: UVec2,
        layer: u16,
    ) -> Result<NavMeshTile, InvalidTileRef> {
        let reference = self
            .get_tile_ref_at(coord, layer)
            .ok_or(InvalidTileRef::Stale)?;
        self.remove_tile(reference)
    }

    fn build_internal_links(&mut self, slot: u16) {
        let tile = self.slots[usize::from(slot)].tile.as_mut().unwrap();

        for polygon in tile.polygons.iter_mut() {
            polygon.links.clear();

            for (edge, connection) in polygon.edges.iter().enumerate() {
                if let EdgeConnection::Internal(neighbour_polygon) = connection {
                    polygon.links.push(Link::Internal {
                        edge: edge as u8,
                        neighbour_polygon: *neighbour_polygon,
                    });
                }
            }
        }
    }

    /// Snaps off-mesh connection endpoints to their landing polygons & links
    /// them in both directions.
    fn connect_off_mesh_links(&mut self, slot: u16, nav_mesh_settings: &NavMeshSettings) {
        let connections = self.slots[usize::from(slot)]
            .tile
            .as_ref()
            .unwrap()
            .off_mesh_connections
            .clone();

        for (connection_index, connection) in connections.iter().enumerate() {
            let search_extents = Vec3::splat(connection.radius.max(0.1));

            let Some((start_ref, start_point)) = self.find_closest_polygon_in_box(
                nav_mesh_settings,
                connection.start,
                search_extents,
            ) else {
                continue;
            };
            let Some((end_ref, end_point)) =
                self.find_closest_polygon_in_box(nav_mesh_settings, connection.end, search_extents)
            else {
                continue;
            };

            let connection_polygon = {
                let tile = self.slots[usize::from(slot)].tile.as_ref().unwrap();
                tile.off_mesh_polygon_index(connection_index) as u16
            };
            let connection_ref = self.poly_ref(slot, connection_polygon);

            // Snap the connection polygon's vertices to the surface.
            {
                let tile = self.slots[usize::from(slot)].tile.as_mut().unwrap();
                let indices = tile.polygons[usize::from(connection_polygon)].indices.clone();
                tile.vertices[indices[0] as usize] = start_point;
                tile.vertices[indices[1] as usize] = end_point;
            }

            let bidirectional = connection.bidirectional;

            // Connection polygon -> landing polygons.
            {
                let tile = self.slots[usize::from(slot)].tile.as_mut().unwrap();
                let polygon = &mut tile.polygons[usize::from(connection_polygon)];
                polygon.links.push(Link::OffMesh {
                    neighbour: start_ref,
                    endpoint: 0,
                });
                polygon.links.push(Link::OffMesh {
                    neighbour: end_ref,
                    endpoint: 1,
                });
            }

            // Start landing polygon -> connection polygon.
            if let Some((start_slot, start_polygon)) = self.decode_slot_and_polygon(start_ref) {
                let tile = self.slots[usize::from(start_slot)].tile.as_mut().unwrap();
                tile.polygons[usize::from(start_polygon)]
                    .links
                    .push(Link::OffMesh {
                        neighbour: connection_ref,
                        endpoint: 0,
                    });
            }

            // End landing polygon -> connection polygon, when traversable
            // backwards.
            if bidirectional {
                if let Some((end_slot, end_polygon)) = self.decode_slot_and_polygon(end_ref) {
                    let tile = self.slots[usize::from(end_slot)].tile.as_mut().unwrap();
                    tile.polygons[usize::from(end_polygon)]
                        .links
                        .push(Link::OffMesh {
                            neighbour: connection_ref,
                            endpoint: 1,
                        });
                }
            }
        }
    }

    /// Creates external links from portal edges of ``slot`` facing
    /// ``direction`` to matching portal edges of ``neighbour_slot``.
    fn connect_external_links(
        &mut self,
        slot: u16,
        neighbour_slot: u16,
        direction: EdgeConnectionDirection,
        nav_mesh_settings: &NavMeshSettings,
    ) {
        let step_tolerance =
            f32::from(nav_mesh_settings.step_height) * nav_mesh_settings.cell_height;

        struct PendingLink {
            polygon: u16,
            link: Link,
        }
        let mut pending = Vec::new();

        {
            let tile = self.slots[usize::from(slot)].tile.as_ref().unwrap();
            let neighbour_tile = self.slots[usize::from(neighbour_slot)].tile.as_ref().unwrap();
            let neighbour_salt = self.slots[usize::from(neighbour_slot)].salt;

            for (polygon_index, polygon) in tile.polygons.iter().enumerate() {
                if polygon.is_off_mesh() {
                    continue;
                }

                for (edge, connection) in polygon.edges.iter().enumerate() {
                    let EdgeConnection::External(edge_direction) = connection else {
                        continue;
                    };
                    if *edge_direction != direction {
                        continue;
                    }

                    let a = tile.vertices[polygon.indices[edge] as usize];
                    let b = tile.vertices
                        [polygon.indices[(edge + 1) % polygon.indices.len()] as usize];

                    for (neighbour_index, neighbour_polygon) in
                        neighbour_tile.polygons.iter().enumerate()
                    {
                        if neighbour_polygon.is_off_mesh() {
                            continue;
                        }

                        for (neighbour_edge, neighbour_connection) in
                            neighbour_polygon.edges.iter().enumerate()
                        {
                            let EdgeConnection::External(neighbour_direction) =
                                neighbour_connection
                            else {
                                continue;
                            };
                            if *neighbour_direction != direction.opposite() {
                                continue;
                            }

                            let c = neighbour_tile.vertices
                                [neighbour_polygon.indices[neighbour_edge] as usize];
                            let d = neighbour_tile.vertices[neighbour_polygon.indices
                                [(neighbour_edge + 1) % neighbour_polygon.indices.len()]
                                as usize];

                            let Some((bound_min, bound_max)) =
                                portal_edge_overlap(a, b, c, d, direction, step_tolerance)
                            else {
                                continue;
                            };

                            pending.push(PendingLink {
                                polygon: polygon_index as u16,
                                link: Link::External {
                                    edge: edge as u8,
                                    neighbour: self.encode(
                                        neighbour_salt,
                                        u32::from(neighbour_slot),
                                        neighbour_index as u32,
                                    ),
                                    direction,
                                    bound_min,
                                    bound_max,
                                },
                            });
                        }
                    }
                }
            }
        }

        let tile = self.slots[usize::from(slot)].tile.as_mut().unwrap();
        for PendingLink { polygon, link } in pending {
            let links = &mut tile.polygons[usize::from(polygon)].links;
            if !links.contains(&link) {
                links.push(link);
            }
        }
    }

    /// Finds the polygon closest to ``center`` within the axis-aligned box
    /// spanned by ``half_extents``, returning the ref & the closest point on
    /// the polygon.
    pub fn find_closest_polygon_in_box(
        &self,
        nav_mesh_settings: &NavMeshSettings,
        center: Vec3,
        half_extents: Vec3,
    ) -> Option<(PolyRef, Vec3)> {
        let min = center - half_extents;
        let max = center + half_extents;

        let min_tile = nav_mesh_settings.get_tile_containing_position(Vec2::new(min.x, min.z));
        let max_tile = nav_mesh_settings.get_tile_containing_position(Vec2::new(max.x, max.z));

        let mut closest = None;
        let mut closest_distance = f32::MAX;

        for x in min_tile.x..=max_tile.x {
            for y in min_tile.y..=max_tile.y {
                let Some(chain) = self.lookup.get(&UVec2::new(x, y)) else {
                    continue;
                };

                for slot in chain.iter() {
                    let Some(tile) = self.slots[usize::from(*slot)].tile.as_ref() else {
                        continue;
                    };

                    query_polygons_in_tile(tile, min, max, |polygon_index| {
                        let polygon = &tile.polygons[usize::from(polygon_index)];
                        if polygon.is_off_mesh() {
                            return;
                        }

                        let point = tile.get_closest_point_in_polygon(polygon, center);
                        let distance = point.distance_squared(center);

                        if distance < closest_distance {
                            closest_distance = distance;
                            closest = Some((self.poly_ref(*slot, polygon_index), point));
                        }
                    });
                }
            }
        }

        closest
    }
}

/// Overlap of two portal edges along the axis perpendicular to ``direction``.
/// Returns the overlap as a normalized sub-range of edge ``a-b``.
fn portal_edge_overlap(
    a: Vec3,
    b: Vec3,
    c: Vec3,
    d: Vec3,
    direction: EdgeConnectionDirection,
    step_tolerance: f32,
) -> Option<(u8, u8)> {
    let along = |v: Vec3| match direction {
        EdgeConnectionDirection::XNegative | EdgeConnectionDirection::XPositive => v.z,
        EdgeConnectionDirection::ZNegative | EdgeConnectionDirection::ZPositive => v.x,
    };

    let (a_lo, a_hi) = (along(a).min(along(b)), along(a).max(along(b)));
    let (b_lo, b_hi) = (along(c).min(along(d)), along(c).max(along(d)));

    let overlap_lo = a_lo.max(b_lo);
    let overlap_hi = a_hi.min(b_hi);
    if overlap_hi - overlap_lo < 1e-4 {
        return None;
    }

    // Reject vertically separated portals (other layers).
    let midpoint = (overlap_lo + overlap_hi) * 0.5;
    let height_at = |p: Vec3, q: Vec3| {
        let (p_along, q_along) = (along(p), along(q));
        if (q_along - p_along).abs() < 1e-6 {
            (p.y + q.y) * 0.5
        } else {
            let t = ((midpoint - p_along) / (q_along - p_along)).clamp(0.0, 1.0);
            p.y + (q.y - p.y) * t
        }
    };

    if (height_at(a, b) - height_at(c, d)).abs() > step_tolerance + 1e-4 {
        return None;
    }

    // Normalize onto the a-b parameterization.
    let a_start = along(a);
    let a_end = along(b);
    let span = a_end - a_start;
    if span.abs() < 1e-6 {
        return None;
    }

    let t0 = ((overlap_lo - a_start) / span).clamp(0.0, 1.0);
    let t1 = ((overlap_hi - a_start) / span).clamp(0.0, 1.0);
    let (t_min, t_max) = (t0.min(t1), t0.max(t1));

    Some(((t_min * 255.0) as u8, (t_max * 255.0).ceil().min(255.0) as u8))
}

/// Enumerates polygons of the tile whose bounds overlap the world-space box.
pub(crate) fn query_polygons_in_tile(
    tile: &NavMeshTile,
    min: Vec3,
    max: Vec3,
    mut callback: impl FnMut(u16),
) {
    if tile.bv_tree.is_empty() {
        for (polygon_index, polygon) in tile.polygons.iter().enumerate() {
            if polygon.is_off_mesh() {
                continue;
            }

            let vertices = tile.polygon_vertices(polygon);
            let mut poly_min = vertices[0];
            let mut poly_max = vertices[0];
            for vertex in vertices.iter().skip(1) {
                poly_min = poly_min.min(*vertex);
                poly_max = poly_max.max(*vertex);
            }

            if poly_min.cmple(max).all() && poly_max.cmpge(min).all() {
                callback(polygon_index as u16);
            }
        }
        return;
    }

    // Quantize the query box into the tree's space.
    let quantize = |value: Vec3| -> [u16; 3] {
        let clamped = (value - tile.bounds_min)
            .max(Vec3::ZERO)
            .min(tile.bounds_max - tile.bounds_min);
        [
            (clamped.x * BV_QUANT_FACTOR) as u16,
            (clamped.y * BV_QUANT_FACTOR) as u16,
            (clamped.z * BV_QUANT_FACTOR) as u16,
        ]
    };

    let query_min = quantize(min);
    let query_max = quantize(max);

    let mut node = 0usize;
    while node < tile.bv_tree.len() {
        let bv_node = &tile.bv_tree[node];
        let overlap = query_min[0] <= bv_node.max[0]
            && query_max[0] >= bv_node.min[0]
            && query_min[1] <= bv_node.max[1]
            && query_max[1] >= bv_node.min[1]
            && query_min[2] <= bv_node.max[2]
            && query_max[2] >= bv_node.min[2];
        let is_leaf = bv_node.i >= 0;

        if is_leaf && overlap {
            callback(bv_node.i as u16);
        }

        if overlap || is_leaf {
            node += 1;
        } else {
            node += (-bv_node.i) as usize;
        }
    }
}

/// Quantization factor of the BV tree, in tree units per world unit.
pub(crate) const BV_QUANT_FACTOR: f32 = 64.0;

/// Converts a built poly mesh (plus optional detail mesh & off-mesh
/// connections) into a runtime nav-mesh tile.
pub fn create_nav_mesh_tile_from_poly_mesh(
    poly_mesh: PolyMesh,
    detail: Option<PolyMeshDetail>,
    off_mesh_connections: Vec<OffMeshConnection>,
    tile_coord: UVec2,
    layer: u16,
    nav_mesh_settings: &NavMeshSettings,
) -> NavMeshTile {
    let tile_origin = nav_mesh_settings.get_tile_origin(tile_coord);

    let mut vertices: Vec<Vec3> = poly_mesh
        .vertices
        .iter()
        .map(|vertex| {
            Vec3::new(
                tile_origin.x + vertex.x as f32 * nav_mesh_settings.cell_width,
                nav_mesh_settings.world_bottom_bound
                    + vertex.y as f32 * nav_mesh_settings.cell_height,
                tile_origin.y + vertex.z as f32 * nav_mesh_settings.cell_width,
            )
        })
        .collect();

    let mut polygons: Vec<Polygon> = poly_mesh
        .polygons
        .iter()
        .zip(poly_mesh.edges.iter())
        .zip(poly_mesh.areas.iter())
        .map(|((polygon, edges), area)| {
            let vertex_count = count_polygon_vertices(polygon);

            Polygon {
                indices: polygon[..vertex_count].to_vec(),
                edges: edges[..vertex_count].to_vec(),
                links: Vec::new(),
                area: *area,
                flags: 1,
            }
        })
        .collect();

    // Off-mesh connections become two-vertex polygons at the end.
    for connection in off_mesh_connections.iter() {
        let base = vertices.len() as u32;
        vertices.push(connection.start);
        vertices.push(connection.end);

        polygons.push(Polygon {
            indices: vec![base, base + 1],
            edges: vec![EdgeConnection::None, EdgeConnection::None],
            links: Vec::new(),
            area: connection.area,
            flags: connection.flags,
        });
    }

    let mut bounds_min = Vec3::splat(f32::MAX);
    let mut bounds_max = Vec3::splat(f32::MIN);
    for vertex in vertices.iter() {
        bounds_min = bounds_min.min(*vertex);
        bounds_max = bounds_max.max(*vertex);
    }
    if vertices.is_empty() {
        bounds_min = Vec3::new(tile_origin.x, nav_mesh_settings.world_bottom_bound, tile_origin.y);
        bounds_max = bounds_min + Vec3::splat(nav_mesh_settings.get_tile_size());
    }
    // Leave vertical room for agents standing on the top surface.
    bounds_max.y += f32::from(nav_mesh_settings.walkable_height) * nav_mesh_settings.cell_height;

    let mut tile = NavMeshTile {
        coord: tile_coord,
        layer,
        vertices,
        polygons,
        detail,
        off_mesh_connections,
        bv_tree: Vec::new(),
        bounds_min,
        bounds_max,
    };

    tile.bv_tree = build_bv_tree(&tile);

    tile
}

struct BvItem {
    min: [u16; 3],
    max: [u16; 3],
    index: u16,
}

fn build_bv_tree(tile: &NavMeshTile) -> Vec<BvNode> {
    let ground_polygons = tile.polygons.len() - tile.off_mesh_connections.len();
    if ground_polygons == 0 {
        return Vec::new();
    }

    let quantize = |value: Vec3| -> [u16; 3] {
        let clamped = (value - tile.bounds_min)
            .max(Vec3::ZERO)
            .min(tile.bounds_max - tile.bounds_min);
        [
            (clamped.x * BV_QUANT_FACTOR) as u16,
            (clamped.y * BV_QUANT_FACTOR) as u16,
            (clamped.z * BV_QUANT_FACTOR) as u16,
        ]
    };

    let mut items: Vec<BvItem> = (0..ground_polygons)
        .map(|polygon_index| {
            let polygon = &tile.polygons[polygon_index];
            let vertices = tile.polygon_vertices(polygon);

            let mut min = vertices[0];
            let mut max = vertices[0];
            for vertex in vertices.iter().skip(1) {
                min = min.min(*vertex);
                max = max.max(*vertex);
            }

            BvItem {
                min: quantize(min),
                max: quantize(max),
                index: polygon_index as u16,
            }
        })
        .collect();

    let mut nodes = Vec::with_capacity(ground_polygons * 2);
    subdivide_bv_items(&mut items, 0, ground_polygons, &mut nodes);
    nodes
}

fn subdivide_bv_items(
    items: &mut [BvItem],
    min_index: usize,
    max_index: usize,
    nodes: &mut Vec<BvNode>,
) {
    let count = max_index - min_index;
    let current = nodes.len();

    if count == 1 {
        let item = &items[min_index];
        nodes.push(BvNode {
            min: item.min,
            max: item.max,
            i: i32::from(item.index),
        });
        return;
    }

    let mut min = items[min_index].min;
    let mut max = items[min_index].max;
    for item in &items[min_index + 1..max_index] {
        for axis in 0..3 {
            min[axis] = min[axis].min(item.min[axis]);
            max[axis] = max[axis].max(item.max[axis]);
        }
    }

    nodes.push(BvNode { min, max, i: 0 });

    // Split along the longest axis.
    let spans = [max[0] - min[0], max[1] - min[1], max[2] - min[2]];
    let axis = if spans[0] >= spans[1] && spans[0] >= spans[2] {
        0
    } else if spans[1] >= spans[2] {
        1
    } else {
        2
    };

    items[min_index..max_index].sort_unstable_by_key(|item| item.min[axis]);

    let split = min_index + count / 2;
    subdivide_bv_items(items, min_index, split, nodes);
    subdivide_bv_items(items, split, max_index, nodes);

    let escape = (nodes.len() - current) as i32;
    nodes[current].i = -escape;
}
