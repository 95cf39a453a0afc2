//! Compressed tile store with dynamic obstacle support.
//!
//! Tiles are kept as compressed 2.5D layers. Adding or removing an obstacle
//! marks the tiles it touches; [TileCache::update] decompresses those layers,
//! stamps the live obstacles back onto them, reruns the region, contour &
//! polygon stages & swaps the rebuilt tile into the nav-mesh. Each swap
//! advances the tile's salt, so polygon refs held by callers go stale instead
//! of dangling.

use std::collections::{HashMap, VecDeque};
use std::io::Read;

use bevy::log::warn;
use bevy::prelude::{Resource, UVec2, Vec3};
use smallvec::SmallVec;
use thiserror::Error;

use crate::areas::{
    mark_box_area, mark_cylinder_area, mark_oriented_box_area, median_filter_walkable_area,
};
use crate::contour::build_contours;
use crate::heightfields::{OpenCell, OpenSpan, OpenTile};
use crate::mesher::build_poly_mesh;
use crate::regions::{assign_layer_floors, build_regions};
use crate::tiles::{create_nav_mesh_tile_from_poly_mesh, NavMeshTiles};
use crate::{Area, NavMeshSettings, PartitionType};

pub const TILE_CACHE_LAYER_MAGIC: u32 =
    (b'T' as u32) << 24 | (b'C' as u32) << 16 | (b'L' as u32) << 8 | b'Y' as u32;
pub const TILE_CACHE_LAYER_VERSION: i32 = 1;

/// Marker for cells without a span in a layer's height plane.
const LAYER_EMPTY: u8 = 0xff;

/// Tiles one obstacle may touch; obstacles spanning more are clamped with a
/// warning.
const MAX_TOUCHED_TILES: usize = 8;

/// Maximum queued obstacle requests.
const MAX_OBSTACLE_REQUESTS: usize = 64;

/// Maximum tile rebuilds per [TileCache::update] call.
const MAX_UPDATE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct TileCacheLayerHeader {
    pub coord: UVec2,
    pub layer: u16,
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
    /// Vertical voxel range of the layer.
    pub height_min: u16,
    pub height_max: u16,
    /// Grid dimensions (the bordered tile side).
    pub width: u16,
    pub height: u16,
    /// Usable sub-rectangle after border trimming.
    pub min_x: u16,
    pub max_x: u16,
    pub min_y: u16,
    pub max_y: u16,
}

/// One uncompressed 2.5D floor of a tile: a height, area & connectivity byte
/// per cell.
#[derive(Debug, Clone, PartialEq)]
pub struct TileCacheLayer {
    pub header: TileCacheLayerHeader,
    pub heights: Vec<u8>,
    pub areas: Vec<u8>,
    pub connections: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("codec failure: {0}")]
    Codec(#[from] std::io::Error),
    #[error("decompressed size {actual} does not match the expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Pluggable codec for compressed tile layers.
pub trait TileCompressor: Send + Sync {
    /// Upper bound of the compressed size for any ``size``-byte input.
    fn max_compressed_size(&self, size: usize) -> usize;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CompressionError>;
}

/// Default codec: raw DEFLATE via flate2.
#[derive(Default, Debug, Clone, Copy)]
pub struct DeflateCompressor;

impl TileCompressor for DeflateCompressor {
    fn max_compressed_size(&self, size: usize) -> usize {
        // Stored-block worst case: 5 bytes per 16 KiB block plus slack.
        size + 5 * (size / 16383 + 1) + 64
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut encoder =
            flate2::read::DeflateEncoder::new(data, flate2::Compression::fast());
        let mut compressed = Vec::with_capacity(self.max_compressed_size(data.len()).min(4096));
        encoder.read_to_end(&mut compressed)?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CompressionError> {
        let mut decoder = flate2::read::DeflateDecoder::new(data);
        let mut decompressed = Vec::with_capacity(expected_size);
        decoder.read_to_end(&mut decompressed)?;

        if decompressed.len() != expected_size {
            return Err(CompressionError::SizeMismatch {
                expected: expected_size,
                actual: decompressed.len(),
            });
        }

        Ok(decompressed)
    }
}

/// A tile kept in compressed form: header in the clear, the three planes
/// behind the codec.
#[derive(Debug, Clone)]
pub struct CompressedTile {
    pub header: TileCacheLayerHeader,
    pub data: Vec<u8>,
}

/// Salted handle to an obstacle slot: ``(salt << 16) | slot``.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObstacleRef(u32);

impl ObstacleRef {
    fn new(salt: u16, slot: u16) -> Self {
        Self(u32::from(salt) << 16 | u32::from(slot))
    }

    fn salt(self) -> u16 {
        (self.0 >> 16) as u16
    }

    fn slot(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObstacleShape {
    /// Vertical cylinder; ``position`` is the center of its base.
    Cylinder {
        position: Vec3,
        radius: f32,
        height: f32,
    },
    Box { min: Vec3, max: Vec3 },
    OrientedBox {
        center: Vec3,
        half_extents: Vec3,
        y_rotation: f32,
    },
}

impl ObstacleShape {
    pub fn bounds(&self) -> (Vec3, Vec3) {
        match self {
            ObstacleShape::Cylinder {
                position,
                radius,
                height,
            } => (
                *position - Vec3::new(*radius, 0.0, *radius),
                *position + Vec3::new(*radius, *height, *radius),
            ),
            ObstacleShape::Box { min, max } => (*min, *max),
            ObstacleShape::OrientedBox {
                center,
                half_extents,
                y_rotation,
            } => {
                let (sin, cos) = y_rotation.sin_cos();
                let extent_x = half_extents.x * cos.abs() + half_extents.z * sin.abs();
                let extent_z = half_extents.x * sin.abs() + half_extents.z * cos.abs();
                let extents = Vec3::new(extent_x, half_extents.y, extent_z);
                (*center - extents, *center + extents)
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ObstacleState {
    #[default]
    Empty,
    Processing,
    Processed,
    Removing,
}

#[derive(Default)]
struct ObstacleSlot {
    salt: u16,
    state: ObstacleState,
    shape: Option<ObstacleShape>,
    touched: SmallVec<[(UVec2, u16); MAX_TOUCHED_TILES]>,
    pending: SmallVec<[(UVec2, u16); MAX_TOUCHED_TILES]>,
}

#[derive(Debug, Clone, Copy)]
struct ObstacleRequest {
    add: bool,
    reference: ObstacleRef,
}

#[derive(Debug, Error)]
pub enum ObstacleError {
    #[error("the obstacle request queue is full ({MAX_OBSTACLE_REQUESTS} entries)")]
    QueueFull,
    #[error("the obstacle reference is invalid or stale")]
    InvalidRef,
}

#[derive(Debug, Error)]
pub enum TileCacheError {
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error("no compressed tile at coordinate {coord:?} layer {layer}")]
    MissingTile { coord: UVec2, layer: u16 },
}

/// Outcome of one [TileCache::update] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCacheUpdate {
    /// All requests & rebuilds are drained; nothing left to do.
    pub up_to_date: bool,
    /// Tiles rebuilt & swapped into the nav-mesh by this call.
    pub rebuilt: Vec<(UVec2, u16)>,
}

/// The compressed tile store plus the obstacle scheduler.
#[derive(Resource)]
pub struct TileCache {
    compressor: Box<dyn TileCompressor>,
    tiles: HashMap<(UVec2, u16), CompressedTile>,
    obstacles: Vec<ObstacleSlot>,
    free_obstacles: Vec<u16>,
    requests: VecDeque<ObstacleRequest>,
    update_queue: Vec<(UVec2, u16)>,
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TileCache {
    pub fn new() -> Self {
        Self::with_compressor(Box::new(DeflateCompressor))
    }

    pub fn with_compressor(compressor: Box<dyn TileCompressor>) -> Self {
        Self {
            compressor,
            tiles: HashMap::new(),
            obstacles: Vec::new(),
            free_obstacles: Vec::new(),
            requests: VecDeque::with_capacity(MAX_OBSTACLE_REQUESTS),
            update_queue: Vec::new(),
        }
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn compressed_tiles(&self) -> impl Iterator<Item = &CompressedTile> {
        self.tiles.values()
    }

    /// Compresses & stores a layer, replacing any previous tile at its
    /// coordinate.
    pub fn add_tile(&mut self, layer: TileCacheLayer) -> Result<(), TileCacheError> {
        let planes = [&layer.heights, &layer.areas, &layer.connections]
            .into_iter()
            .flatten()
            .copied()
            .collect::<Vec<u8>>();

        let data = self.compressor.compress(&planes)?;

        self.tiles.insert(
            (layer.header.coord, layer.header.layer),
            CompressedTile {
                header: layer.header,
                data,
            },
        );

        Ok(())
    }

    pub fn remove_tile(&mut self, coord: UVec2, layer: u16) -> Option<CompressedTile> {
        self.tiles.remove(&(coord, layer))
    }

    /// Stores an already compressed tile, e.g. read back from a cache set
    /// file.
    pub fn add_compressed_tile(&mut self, tile: CompressedTile) {
        self.tiles.insert((tile.header.coord, tile.header.layer), tile);
    }

    /// Decompresses the tile at the coordinate back into layer form.
    pub fn decompress_tile(&self, coord: UVec2, layer: u16) -> Result<TileCacheLayer, TileCacheError> {
        let tile = self
            .tiles
            .get(&(coord, layer))
            .ok_or(TileCacheError::MissingTile { coord, layer })?;

        let plane_size = usize::from(tile.header.width) * usize::from(tile.header.height);
        let planes = self.compressor.decompress(&tile.data, plane_size * 3)?;

        Ok(TileCacheLayer {
            header: tile.header.clone(),
            heights: planes[..plane_size].to_vec(),
            areas: planes[plane_size..plane_size * 2].to_vec(),
            connections: planes[plane_size * 2..].to_vec(),
        })
    }

    /// Queues an obstacle for insertion. The nav-mesh is untouched until
    /// [TileCache::update] processes the request.
    pub fn add_obstacle(&mut self, shape: ObstacleShape) -> Result<ObstacleRef, ObstacleError> {
        if self.requests.len() >= MAX_OBSTACLE_REQUESTS {
            return Err(ObstacleError::QueueFull);
        }

        let slot = match self.free_obstacles.pop() {
            Some(slot) => slot,
            None => {
                self.obstacles.push(ObstacleSlot::default());
                (self.obstacles.len() - 1) as u16
            }
        };

        let obstacle = &mut self.obstacles[usize::from(slot)];
        obstacle.salt = obstacle.salt.wrapping_add(1).max(1);
        obstacle.state = ObstacleState::Empty;
        obstacle.shape = Some(shape);
        obstacle.touched.clear();
        obstacle.pending.clear();

        let reference = ObstacleRef::new(obstacle.salt, slot);
        self.requests.push_back(ObstacleRequest {
            add: true,
            reference,
        });

        Ok(reference)
    }

    /// Queues an obstacle for removal.
    pub fn remove_obstacle(&mut self, reference: ObstacleRef) -> Result<(), ObstacleError> {
        if self.requests.len() >= MAX_OBSTACLE_REQUESTS {
            return Err(ObstacleError::QueueFull);
        }

        self.obstacle_slot(reference)?;

        self.requests.push_back(ObstacleRequest {
            add: false,
            reference,
        });

        Ok(())
    }

    pub fn obstacle_state(&self, reference: ObstacleRef) -> ObstacleState {
        self.obstacle_slot(reference)
            .map(|slot| self.obstacles[usize::from(slot)].state)
            .unwrap_or(ObstacleState::Empty)
    }

    fn obstacle_slot(&self, reference: ObstacleRef) -> Result<u16, ObstacleError> {
        let slot = reference.slot();
        let obstacle = self
            .obstacles
            .get(usize::from(slot))
            .ok_or(ObstacleError::InvalidRef)?;

        if obstacle.salt != reference.salt() {
            return Err(ObstacleError::InvalidRef);
        }

        Ok(slot)
    }

    /// Picks the obstacle whose bounds the world-space ray pierces first.
    pub fn hit_test_obstacle(&self, origin: Vec3, direction: Vec3) -> Option<ObstacleRef> {
        let mut nearest: Option<(f32, ObstacleRef)> = None;

        for (slot, obstacle) in self.obstacles.iter().enumerate() {
            if !matches!(
                obstacle.state,
                ObstacleState::Processing | ObstacleState::Processed
            ) {
                continue;
            }
            let Some(shape) = &obstacle.shape else {
                continue;
            };

            let (min, max) = shape.bounds();
            let Some(t) = ray_aabb_intersection(origin, direction, min, max) else {
                continue;
            };

            if nearest.is_none_or(|(nearest_t, _)| t < nearest_t) {
                nearest = Some((t, ObstacleRef::new(obstacle.salt, slot as u16)));
            }
        }

        nearest.map(|(_, reference)| reference)
    }

    /// Processes pending obstacle requests & rebuilds up to [MAX_UPDATE]
    /// touched tiles, swapping them into ``nav_mesh``. Returns whether the
    /// cache is fully caught up.
    pub fn update(
        &mut self,
        nav_mesh_settings: &NavMeshSettings,
        nav_mesh: &mut NavMeshTiles,
    ) -> TileCacheUpdate {
        // Promote queued requests into obstacle state.
        while let Some(request) = self.requests.pop_front() {
            let Ok(slot) = self.obstacle_slot(request.reference) else {
                continue;
            };

            let tile_keys: Vec<(UVec2, u16)> = self.tiles.keys().copied().collect();
            let obstacle = &mut self.obstacles[usize::from(slot)];

            if request.add {
                obstacle.state = ObstacleState::Processing;

                let (min, max) = obstacle.shape.as_ref().unwrap().bounds();
                obstacle.touched.clear();

                for (coord, layer) in tile_keys {
                    let tile = &self.tiles[&(coord, layer)];
                    let overlaps = tile.header.bounds_min.x <= max.x
                        && tile.header.bounds_max.x >= min.x
                        && tile.header.bounds_min.z <= max.z
                        && tile.header.bounds_max.z >= min.z;

                    if overlaps {
                        if obstacle.touched.len() >= MAX_TOUCHED_TILES {
                            warn!("Obstacle touches more than {MAX_TOUCHED_TILES} tiles; ignoring the rest.");
                            break;
                        }
                        obstacle.touched.push((coord, layer));
                    }
                }

                obstacle.pending = obstacle.touched.clone();
            } else {
                obstacle.state = ObstacleState::Removing;
                obstacle.pending = obstacle.touched.clone();
            }
        }

        // Batch tile rebuilds.
        for obstacle in self.obstacles.iter() {
            if !matches!(
                obstacle.state,
                ObstacleState::Processing | ObstacleState::Removing
            ) {
                continue;
            }

            for tile in obstacle.pending.iter() {
                if self.update_queue.len() >= MAX_UPDATE {
                    break;
                }
                if !self.update_queue.contains(tile) {
                    self.update_queue.push(*tile);
                }
            }
        }

        let batch: Vec<(UVec2, u16)> = self.update_queue.drain(..).collect();
        let mut rebuilt = Vec::with_capacity(batch.len());

        for (coord, layer) in batch {
            match self.build_nav_mesh_tile(coord, layer, nav_mesh_settings, nav_mesh) {
                Ok(()) => {
                    rebuilt.push((coord, layer));

                    for obstacle in self.obstacles.iter_mut() {
                        obstacle
                            .pending
                            .retain(|pending| *pending != (coord, layer));
                    }
                }
                Err(error) => {
                    // The tile stays pending; it is retried next update.
                    warn!("Failed to rebuild tile {coord:?} layer {layer}: {error}");
                }
            }
        }

        // Advance obstacle state machines.
        for (slot, obstacle) in self.obstacles.iter_mut().enumerate() {
            if !obstacle.pending.is_empty() {
                continue;
            }

            match obstacle.state {
                ObstacleState::Processing => obstacle.state = ObstacleState::Processed,
                ObstacleState::Removing => {
                    obstacle.state = ObstacleState::Empty;
                    obstacle.shape = None;
                    obstacle.touched.clear();
                    obstacle.salt = obstacle.salt.wrapping_add(1).max(1);
                    self.free_obstacles.push(slot as u16);
                }
                _ => {}
            }
        }

        let transitional = self.obstacles.iter().any(|obstacle| {
            matches!(
                obstacle.state,
                ObstacleState::Processing | ObstacleState::Removing
            )
        });

        TileCacheUpdate {
            up_to_date: self.requests.is_empty() && self.update_queue.is_empty() && !transitional,
            rebuilt,
        }
    }

    /// Rebuilds one tile from its compressed layer & swaps it into the
    /// nav-mesh.
    pub fn build_nav_mesh_tile(
        &self,
        coord: UVec2,
        layer: u16,
        nav_mesh_settings: &NavMeshSettings,
        nav_mesh: &mut NavMeshTiles,
    ) -> Result<(), TileCacheError> {
        let cache_layer = self.decompress_tile(coord, layer)?;
        let mut open_tile = layer_to_open_tile(&cache_layer);

        // Stamp every live obstacle whose bounds reach this tile.
        for obstacle in self.obstacles.iter() {
            if !matches!(
                obstacle.state,
                ObstacleState::Processing | ObstacleState::Processed
            ) {
                continue;
            }
            let Some(shape) = &obstacle.shape else {
                continue;
            };

            match *shape {
                ObstacleShape::Cylinder {
                    position,
                    radius,
                    height,
                } => mark_cylinder_area(
                    nav_mesh_settings,
                    coord,
                    position,
                    radius,
                    height,
                    None,
                    &mut open_tile,
                ),
                ObstacleShape::Box { min, max } => {
                    mark_box_area(nav_mesh_settings, coord, min, max, None, &mut open_tile)
                }
                ObstacleShape::OrientedBox {
                    center,
                    half_extents,
                    y_rotation,
                } => mark_oriented_box_area(
                    nav_mesh_settings,
                    coord,
                    center,
                    half_extents,
                    y_rotation,
                    None,
                    &mut open_tile,
                ),
            }
        }

        // Smooth out single-cell speckles left by the obstacle stamps.
        median_filter_walkable_area(&mut open_tile, nav_mesh_settings);

        // Layers re-partition monotonically; no distance field required.
        let mut layer_settings = nav_mesh_settings.clone();
        layer_settings.partition_type = PartitionType::Monotone;

        build_regions(&mut open_tile, &layer_settings);
        let contour_set = build_contours(&open_tile, &layer_settings);
        let poly_mesh = build_poly_mesh(&contour_set, &layer_settings);

        let tile = create_nav_mesh_tile_from_poly_mesh(
            poly_mesh,
            None,
            Vec::new(),
            coord,
            layer,
            nav_mesh_settings,
        );

        // Swap. The salt advances on add, invalidating stale refs.
        let _ = nav_mesh.remove_tile_at(coord, layer);
        if let Err(error) = nav_mesh.add_tile(tile, nav_mesh_settings) {
            warn!("Failed to insert rebuilt tile {coord:?} layer {layer}: {error}");
        }

        Ok(())
    }
}

fn ray_aabb_intersection(origin: Vec3, direction: Vec3, min: Vec3, max: Vec3) -> Option<f32> {
    let mut t_min = 0.0_f32;
    let mut t_max = f32::MAX;

    for axis in 0..3 {
        let origin_axis = origin[axis];
        let direction_axis = direction[axis];

        if direction_axis.abs() < 1e-8 {
            if origin_axis < min[axis] || origin_axis > max[axis] {
                return None;
            }
            continue;
        }

        let inverse = 1.0 / direction_axis;
        let mut t0 = (min[axis] - origin_axis) * inverse;
        let mut t1 = (max[axis] - origin_axis) * inverse;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }

        t_min = t_min.max(t0);
        t_max = t_max.min(t1);
        if t_min > t_max {
            return None;
        }
    }

    Some(t_min)
}

/// Extracts the 2.5D floors of a built open tile into cache layers.
pub fn build_tile_cache_layers(
    open_tile: &OpenTile,
    tile_coord: UVec2,
    nav_mesh_settings: &NavMeshSettings,
) -> Vec<TileCacheLayer> {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();
    let (floors, floor_count) = assign_layer_floors(open_tile, nav_mesh_settings);

    let origin = nav_mesh_settings.get_tile_origin_with_border(tile_coord);
    let plane_size = tile_side * tile_side;

    let mut layers = Vec::with_capacity(floor_count);

    for floor in 0..floor_count {
        let floor = floor as u8;

        // Vertical bounds of this floor.
        let mut height_min = u16::MAX;
        let mut height_max = 0u16;
        let mut min_x = tile_side as u16;
        let mut max_x = 0u16;
        let mut min_y = tile_side as u16;
        let mut max_y = 0u16;

        for (cell_index, cell) in open_tile.cells.iter().enumerate() {
            for span in cell.spans.iter() {
                if floors[span.tile_index] != floor {
                    continue;
                }

                height_min = height_min.min(span.min);
                height_max = height_max.max(span.min);

                let x = (cell_index % tile_side) as u16;
                let y = (cell_index / tile_side) as u16;
                min_x = min_x.min(x);
                max_x = max_x.max(x);
                min_y = min_y.min(y);
                max_y = max_y.max(y);
            }
        }

        if height_min == u16::MAX {
            continue;
        }

        let mut heights = vec![LAYER_EMPTY; plane_size];
        let mut areas = vec![0u8; plane_size];
        let mut connections = vec![0u8; plane_size];

        for (cell_index, cell) in open_tile.cells.iter().enumerate() {
            for span in cell.spans.iter() {
                if floors[span.tile_index] != floor {
                    continue;
                }

                let relative_height = span.min - height_min;
                if relative_height >= u16::from(LAYER_EMPTY) {
                    warn!("Layer exceeds the representable height range; dropping a span.");
                    continue;
                }
                if heights[cell_index] != LAYER_EMPTY {
                    // A second span of the same floor in one column cannot be
                    // represented; the layer keeps the first.
                    continue;
                }

                heights[cell_index] = relative_height as u8;
                areas[cell_index] = open_tile.areas[span.tile_index]
                    .map_or(0, |area| (area.0.min(0xfe) + 1) as u8);

                let mut connection_bits = 0u8;
                for (dir, neighbour) in span.neighbours.iter().enumerate() {
                    if neighbour.is_some() {
                        connection_bits |= 1 << dir;
                    }
                }
                connections[cell_index] = connection_bits;
            }
        }

        let bounds_min = Vec3::new(
            origin.x,
            nav_mesh_settings.world_bottom_bound
                + f32::from(height_min) * nav_mesh_settings.cell_height,
            origin.y,
        );
        let bounds_max = Vec3::new(
            origin.x + tile_side as f32 * nav_mesh_settings.cell_width,
            nav_mesh_settings.world_bottom_bound
                + f32::from(height_max + 1) * nav_mesh_settings.cell_height,
            origin.y + tile_side as f32 * nav_mesh_settings.cell_width,
        );

        layers.push(TileCacheLayer {
            header: TileCacheLayerHeader {
                coord: tile_coord,
                layer: u16::from(floor),
                bounds_min,
                bounds_max,
                height_min,
                height_max,
                width: tile_side as u16,
                height: tile_side as u16,
                min_x,
                max_x,
                min_y,
                max_y,
            },
            heights,
            areas,
            connections,
        });
    }

    layers
}

/// Reconstructs an open tile from a decompressed layer, ready for the
/// region, contour & mesher stages.
fn layer_to_open_tile(layer: &TileCacheLayer) -> OpenTile {
    let plane_size = usize::from(layer.header.width) * usize::from(layer.header.height);

    let mut cells = vec![OpenCell::default(); plane_size];
    let mut span_count = 0;

    for (cell_index, cell) in cells.iter_mut().enumerate() {
        if layer.heights[cell_index] == LAYER_EMPTY {
            continue;
        }

        let area = match layer.areas[cell_index] {
            0 => None,
            encoded => Some(Area(u16::from(encoded) - 1)),
        };

        let mut neighbours = [None; 4];
        for (dir, neighbour) in neighbours.iter_mut().enumerate() {
            if layer.connections[cell_index] & (1 << dir) != 0 {
                *neighbour = Some(0);
            }
        }

        cell.spans.push(OpenSpan {
            min: layer.header.height_min + u16::from(layer.heights[cell_index]),
            max: None,
            neighbours,
            tile_index: span_count,
            region: 0,
            area,
        });
        span_count += 1;
    }

    let mut open_tile = OpenTile {
        cells,
        distances: vec![0; span_count].into_boxed_slice(),
        areas: vec![None; span_count].into_boxed_slice(),
        max_distance: 0,
        span_count,
        max_regions: 0,
    };

    let mut tile_index = 0;
    for cell in open_tile.cells.iter_mut() {
        for span in cell.spans.iter_mut() {
            span.tile_index = tile_index;
            open_tile.areas[tile_index] = span.area;
            tile_index += 1;
        }
    }

    open_tile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_round_trips() {
        let compressor = DeflateCompressor;
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 7) as u8).collect();

        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() <= compressor.max_compressed_size(data.len()));

        let decompressed = compressor.decompress(&compressed, data.len()).unwrap();
        assert_eq!(data, decompressed);
    }

    #[test]
    fn decompress_checks_expected_size() {
        let compressor = DeflateCompressor;
        let compressed = compressor.compress(&[1, 2, 3, 4]).unwrap();

        assert!(matches!(
            compressor.decompress(&compressed, 3),
            Err(CompressionError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn obstacle_refs_go_stale_after_removal_cycle() {
        let mut cache = TileCache::new();

        let reference = cache
            .add_obstacle(ObstacleShape::Cylinder {
                position: Vec3::ZERO,
                radius: 1.0,
                height: 2.0,
            })
            .unwrap();

        let settings = NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 50.0, 0.0);
        let mut nav_mesh = NavMeshTiles::default();

        // No tiles loaded: processing finishes immediately.
        let update = cache.update(&settings, &mut nav_mesh);
        assert!(update.up_to_date);
        assert_eq!(cache.obstacle_state(reference), ObstacleState::Processed);

        cache.remove_obstacle(reference).unwrap();
        let update = cache.update(&settings, &mut nav_mesh);
        assert!(update.up_to_date);

        // The slot was recycled & the salt advanced.
        assert!(matches!(
            cache.remove_obstacle(reference),
            Err(ObstacleError::InvalidRef)
        ));
    }

    #[test]
    fn request_queue_is_bounded() {
        let mut cache = TileCache::new();

        for _ in 0..MAX_OBSTACLE_REQUESTS {
            cache
                .add_obstacle(ObstacleShape::Box {
                    min: Vec3::ZERO,
                    max: Vec3::ONE,
                })
                .unwrap();
        }

        assert!(matches!(
            cache.add_obstacle(ObstacleShape::Box {
                min: Vec3::ZERO,
                max: Vec3::ONE,
            }),
            Err(ObstacleError::QueueFull)
        ));
    }
}
