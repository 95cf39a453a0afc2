//! Tiled **runtime** nav-mesh generation, path queries & dynamic obstacles
//! for 3D worlds in [Bevy].
//!
//! Takes in raw triangle soups, voxelizes them into tiles of convex-polygon
//! navigation meshes based on [NavMeshSettings] & serves spatial queries
//! ([query::find_path], [query::raycast], [query::find_distance_to_wall], ...)
//! against the resulting [tiles::NavMeshTiles]. Tiles can also be kept in
//! compressed form inside a [tile_cache::TileCache], which rebuilds them on
//! demand when obstacles are added or removed.
//!
//! ## Quick-start:
//! **Offline build:**
//! 1. Collect your world geometry into [conversion::GeometryCollection]s.
//! 2. Call [build_tile_sync] per tile & add the tiles to a
//!    [tiles::NavMeshTiles] with [tiles::NavMeshTiles::add_tile]. Portal
//!    links across tile seams are created automatically.
//! 3. Query with [query::find_path] & turn the corridor into a world-space
//!    path with [query::perform_string_pulling_on_path].
//!
//! **Dynamic obstacles:**
//! 1. Build each tile's layers with [build_open_tile] &
//!    [tile_cache::build_tile_cache_layers], then feed them to
//!    [tile_cache::TileCache::add_tile].
//! 2. Add & remove obstacles through the cache; pump
//!    [tile_cache::TileCache::update] until it reports being up to date.
//!
//! **In Bevy:** add [TiledNavigationPlugin], attach [NavMeshObstacle]
//! components to entities & read the nav-mesh through the [NavMesh]
//! resource. The plugin drives the tile cache for you & emits
//! [TileRebuilt] events.
//!
//! [Bevy]: https://crates.io/crates/bevy

use std::num::{NonZeroU16, NonZeroU8};
use std::sync::{Arc, RwLock};

use bevy::ecs::entity::EntityHashMap;
use bevy::{
    ecs::{intern::Interned, schedule::ScheduleLabel},
    prelude::*,
};

use tile_cache::{ObstacleRef, ObstacleShape, TileCache};
use tiles::NavMeshTiles;

pub mod areas;
pub mod contour;
pub mod conversion;
pub mod detail_mesh;
pub mod heightfields;
pub mod io;
mod math;
pub mod mesher;
pub mod query;
pub mod regions;
pub mod tile_blob;
pub mod tile_cache;
pub mod tiles;

pub use conversion::{GeometryCollection, Triangles};

/// System sets containing the crate's systems.
#[derive(SystemSet, Debug, PartialEq, Eq, Hash, Clone)]
pub enum TiledNavigation {
    /// Systems handling obstacle removal when a [NavMeshObstacle] component
    /// is removed. Separated to make sure removal events are caught even if
    /// the main set is throttled.
    RemovedComponent,
    /// Main systems: syncing obstacle components into the tile cache &
    /// pumping tile rebuilds.
    Main,
}

pub struct TiledNavigationPlugin {
    pub settings: NavMeshSettings,
    schedule: Interned<dyn ScheduleLabel>,
}

impl TiledNavigationPlugin {
    #[must_use]
    pub fn new(settings: NavMeshSettings) -> Self {
        Self {
            settings,
            schedule: Update.intern(),
        }
    }

    /// Sets the schedule for running the plugin. Defaults to [`Update`].
    #[must_use]
    pub fn in_schedule(mut self, schedule: impl ScheduleLabel) -> Self {
        self.schedule = schedule.intern();
        self
    }
}

impl Plugin for TiledNavigationPlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(self.settings.clone());

        app.init_resource::<NavMesh>()
            .init_resource::<TileCache>()
            .init_resource::<ObstacleRelations>();

        app.configure_sets(
            self.schedule,
            (
                TiledNavigation::RemovedComponent,
                TiledNavigation::Main,
            )
                .chain(),
        );

        app.add_systems(
            self.schedule,
            handle_removed_obstacles_system
                .run_if(any_component_removed::<NavMeshObstacle>)
                .in_set(TiledNavigation::RemovedComponent),
        );

        app.add_systems(
            self.schedule,
            (update_obstacles_system, update_tile_cache_system)
                .chain()
                .in_set(TiledNavigation::Main),
        );

        app.register_type::<NavMeshObstacle>();

        app.add_event::<TileRebuilt>();
    }
}

pub(crate) const FLAG_BORDER_VERTEX: u32 = 0x10000;
pub(crate) const FLAG_AREA_BORDER: u32 = 0x20000;
pub(crate) const MASK_CONTOUR_REGION: u32 = 0xffff; // Masks out the above values.

/// Area type of a walkable surface. Higher areas win when surfaces overlap;
/// values stay below [query::MAX_AREAS] so filters can cost them.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Reflect)]
pub struct Area(pub u16);

/*
*   Neighbours:
*   0: (-1, 0),
*   1: (0, 1),
*   2: (1, 0),
*   3: (0, -1)
*/

#[derive(Default, Resource, Deref, DerefMut)]
struct ObstacleRelations(EntityHashMap<ObstacleRef>);

/// Component marking an entity as a dynamic nav-mesh obstacle. The shape is
/// placed at the entity's [GlobalTransform]; boxes follow the transform's
/// yaw.
#[derive(Component, Reflect, Clone, Copy, Debug)]
#[reflect(Component)]
pub enum NavMeshObstacle {
    Cylinder { radius: f32, height: f32 },
    Box { half_extents: Vec3 },
}

impl Default for NavMeshObstacle {
    fn default() -> Self {
        NavMeshObstacle::Cylinder {
            radius: 0.5,
            height: 2.0,
        }
    }
}

impl NavMeshObstacle {
    fn world_shape(&self, transform: &GlobalTransform) -> ObstacleShape {
        let translation = transform.translation();

        match self {
            NavMeshObstacle::Cylinder { radius, height } => ObstacleShape::Cylinder {
                position: translation,
                radius: *radius,
                height: *height,
            },
            NavMeshObstacle::Box { half_extents } => {
                let (yaw, _, _) = transform.rotation().to_euler(EulerRot::YXZ);

                if yaw.abs() < 1e-5 {
                    ObstacleShape::Box {
                        min: translation - *half_extents,
                        max: translation + *half_extents,
                    }
                } else {
                    ObstacleShape::OrientedBox {
                        center: translation,
                        half_extents: *half_extents,
                        y_rotation: yaw,
                    }
                }
            }
        }
    }
}

/// Event emitted whenever the tile cache swapped a rebuilt tile into the
/// nav-mesh.
#[derive(Event, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRebuilt {
    pub coord: UVec2,
    pub layer: u16,
}

/// How the walkable surface is partitioned into regions.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// Distance-field watershed. Best polygon quality, slowest.
    #[default]
    Watershed,
    /// Row sweeps. Fast, long thin polygons on open fields.
    Monotone,
    /// Monotone sweeps within non-overlapping 2.5D floors.
    Layers,
}

/// Settings for generating height-corrected detail meshes.
#[derive(Clone)]
pub struct DetailMeshSettings {
    /// The maximum acceptable error in height between the nav-mesh polygons & the true world (in cells).
    pub max_height_error: NonZeroU16,
    /// Determines how often (in cells) to sample the height when generating the height-corrected nav-mesh.
    ///
    /// This greatly affects generation performance.
    ///
    /// **Suggested value:** >=2. Start high & reduce as needed.
    pub sample_step: NonZeroU8,
}

/// Settings for nav-mesh generation.
#[derive(Resource, Clone)]
pub struct NavMeshSettings {
    /// The horizontal resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of character radius.
    ///
    /// Smaller values will increase tile generation times with diminishing returns in nav-mesh detail.
    pub cell_width: f32,
    /// The vertical resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of cell_width.
    pub cell_height: f32,

    /// Length of a tile's side in cells. Resulting size in world units is ``tile_width * cell_width``.
    ///
    /// Higher means more to update each time something within the tile changes, smaller means more overhead from connecting the edges to other tiles & generating the tile itself.
    pub tile_width: NonZeroU16,

    /// Extents of the world as measured from the world origin (0.0, 0.0) on the XZ-plane.
    ///
    /// **Suggested value**: As small as possible whilst still keeping the entire world within it.
    pub world_half_extents: f32,
    /// Bottom extents of the world on the Y-axis. The top extents is capped by ``world_bottom_bound + cell_height * u16::MAX``.
    pub world_bottom_bound: f32,

    /// Maximum incline/slope traversable when navigating in radians.
    pub max_traversable_slope_radians: f32,
    /// Minimum open height for an area to be considered walkable in cell_height(s).
    ///
    /// **Suggested value**: The height of character / ``cell_height``, rounded up.
    pub walkable_height: u16,
    /// This will "pull-back" the nav-mesh from edges, meaning anywhere on the nav-mesh will be walkable for a character with a radius of ``walkable_radius * cell_width``.
    ///
    /// **Suggested value**: ``ceil(character_radius / cell_width)``
    pub walkable_radius: u16,
    /// Maximum height difference that is still considered traversable in cell_height(s). This smooths out stair steps and small ledges.
    pub step_height: u16,

    /// Minimum size of a region in cells, anything smaller than this will be removed. This is used to filter out smaller disconnected islands that may appear on surfaces like tables.
    pub min_region_area: u32,
    /// Maximum size of a region in cells we can merge other regions into.
    pub max_region_area_to_merge_into: u32,

    /// Maximum length of an edge before it's split.
    ///
    /// **Suggested value**: Start high and reduce if there are issues.
    pub max_edge_length: u16,
    /// Maximum difference allowed for simplified contour generation on the XZ-plane in cell_width(s).
    ///
    /// **Suggested value range**: `[1.1, 1.5]`
    pub max_contour_simplification_error: f32,

    /// How the walkable surface is partitioned into regions.
    pub partition_type: PartitionType,

    /// Max tiles to generate in parallel at once when driving builds
    /// asynchronously. A value of ``None`` will result in no limit.
    pub max_tile_generation_tasks: Option<NonZeroU16>,

    /// When not None, height correct nav-mesh polygons where the surface height differs too much from the polygon surface. This is very useful for bumpy terrain.
    pub detail_mesh_generation: Option<DetailMeshSettings>,
}

impl NavMeshSettings {
    /// Helper function for creating nav-mesh settings with reasonable
    /// defaults from the size of your navigation agent and bounds of your
    /// world.
    #[inline]
    pub fn from_agent_and_bounds(
        agent_radius: f32,
        agent_height: f32,
        world_half_extents: f32,
        world_bottom_bound: f32,
    ) -> Self {
        let cell_width = agent_radius / 2.0;
        let cell_height = agent_radius / 4.0;

        let walkable_height = (agent_height / cell_height) as u16;

        Self {
            cell_width,
            cell_height,
            tile_width: NonZeroU16::new(120).unwrap(),
            world_half_extents: world_half_extents.abs(),
            world_bottom_bound,
            max_traversable_slope_radians: 50.0_f32.to_radians(),
            walkable_height,
            walkable_radius: 2,
            step_height: 3,
            min_region_area: 100,
            max_region_area_to_merge_into: 500,
            max_edge_length: 80,
            max_contour_simplification_error: 1.1,
            partition_type: PartitionType::default(),
            max_tile_generation_tasks: NonZeroU16::new(8),
            detail_mesh_generation: None,
        }
    }

    /// Setter for [`NavMeshSettings::cell_width`] & [`NavMeshSettings::cell_height`].
    ///
    /// Rescales [`NavMeshSettings::walkable_height`] so the agent's
    /// world-space clearance stays the same.
    pub fn with_cell_size(mut self, cell_width: f32, cell_height: f32) -> Self {
        let world_walkable_height = f32::from(self.walkable_height) * self.cell_height;

        self.cell_width = cell_width;
        self.cell_height = cell_height;
        self.walkable_height = (world_walkable_height / cell_height).ceil() as u16;

        self
    }
    /// Setter for [`NavMeshSettings::walkable_radius`]
    pub fn with_walkable_radius(mut self, walkable_radius: u16) -> Self {
        self.walkable_radius = walkable_radius;

        self
    }
    /// Setter for [`NavMeshSettings::tile_width`]
    pub fn with_tile_width(mut self, tile_width: NonZeroU16) -> Self {
        self.tile_width = tile_width;

        self
    }
    /// Setter for [`NavMeshSettings::max_traversable_slope_radians`]
    pub fn with_traversible_slope(mut self, traversible_slope: f32) -> Self {
        self.max_traversable_slope_radians = traversible_slope;

        self
    }
    /// Setter for [`NavMeshSettings::step_height`]
    pub fn with_step_height(mut self, step_height: u16) -> Self {
        self.step_height = step_height;

        self
    }
    /// Setter for [`NavMeshSettings::min_region_area`] & [`NavMeshSettings::max_region_area_to_merge_into`]
    pub fn with_region_area(
        mut self,
        min_region_area: u32,
        max_region_area_to_merge_into: u32,
    ) -> Self {
        self.min_region_area = min_region_area;
        self.max_region_area_to_merge_into = max_region_area_to_merge_into;

        self
    }
    /// Setter for [`NavMeshSettings::max_contour_simplification_error`]
    pub fn with_max_contour_simplification_error(
        mut self,
        max_contour_simplification_error: f32,
    ) -> Self {
        self.max_contour_simplification_error = max_contour_simplification_error;

        self
    }
    /// Setter for [`NavMeshSettings::max_edge_length`]
    pub fn with_max_edge_length(mut self, max_edge_length: u16) -> Self {
        self.max_edge_length = max_edge_length;

        self
    }
    /// Setter for [`NavMeshSettings::partition_type`]
    pub fn with_partition_type(mut self, partition_type: PartitionType) -> Self {
        self.partition_type = partition_type;

        self
    }
    /// Setter for [`NavMeshSettings::max_tile_generation_tasks`]
    pub fn with_max_tile_generation_tasks(
        mut self,
        max_tile_generation_tasks: Option<NonZeroU16>,
    ) -> Self {
        self.max_tile_generation_tasks = max_tile_generation_tasks;

        self
    }
    /// Setter for [`NavMeshSettings::detail_mesh_generation`]
    pub fn with_detail_mesh_generation(
        mut self,
        detail_mesh_generation: DetailMeshSettings,
    ) -> Self {
        self.detail_mesh_generation = Some(detail_mesh_generation);

        self
    }

    /// Returns the length of a tile's side in world units.
    #[inline]
    pub fn get_tile_size(&self) -> f32 {
        self.cell_width * f32::from(self.tile_width.get())
    }
    #[inline]
    pub fn get_border_size(&self) -> f32 {
        f32::from(self.walkable_radius) * self.cell_width
    }

    /// Returns the tile coordinate that contains the supplied ``world_position``.
    #[inline]
    pub fn get_tile_containing_position(&self, world_position: Vec2) -> UVec2 {
        let offset_world = world_position + self.world_half_extents;

        (offset_world / self.get_tile_size()).as_uvec2()
    }

    /// Returns the minimum bound of a tile on the XZ-plane.
    #[inline]
    pub fn get_tile_origin(&self, tile: UVec2) -> Vec2 {
        tile.as_vec2() * self.get_tile_size() - self.world_half_extents
    }

    /// Returns the origin of a tile on the XZ-plane including the border area.
    #[inline]
    pub fn get_tile_origin_with_border(&self, tile: UVec2) -> Vec2 {
        self.get_tile_origin(tile) - self.get_border_size()
    }

    #[inline]
    pub fn get_tile_side_with_border(&self) -> usize {
        usize::from(self.tile_width.get()) + usize::from(self.walkable_radius) * 2
    }

    /// Returns the minimum & maximum bound of a tile on the XZ-plane.
    #[inline]
    pub fn get_tile_bounds(&self, tile: UVec2) -> (Vec2, Vec2) {
        let tile_size = self.get_tile_size();

        let min_bound = tile.as_vec2() * tile_size - self.world_half_extents;
        let max_bound = min_bound + tile_size;

        (min_bound, max_bound)
    }
}

/// Wrapper around the nav-mesh data.
///
/// The underlying [NavMeshTiles] must be retrieved using [NavMesh::get] &
/// read through the [RwLock].
#[derive(Default, Resource)]
pub struct NavMesh(Arc<RwLock<NavMeshTiles>>);

impl NavMesh {
    pub fn get(&self) -> Arc<RwLock<NavMeshTiles>> {
        self.0.clone()
    }
}

fn handle_removed_obstacles_system(
    mut removed_obstacles: RemovedComponents<NavMeshObstacle>,
    mut relations: ResMut<ObstacleRelations>,
    mut tile_cache: ResMut<TileCache>,
) {
    for reference in removed_obstacles
        .read()
        .filter_map(|removed| relations.remove(&removed))
    {
        if let Err(error) = tile_cache.remove_obstacle(reference) {
            warn!("Failed to remove obstacle: {error}");
        }
    }
}

fn update_obstacles_system(
    mut relations: ResMut<ObstacleRelations>,
    mut tile_cache: ResMut<TileCache>,
    query: Query<
        (Entity, &NavMeshObstacle, &GlobalTransform),
        Or<(Changed<GlobalTransform>, Changed<NavMeshObstacle>)>,
    >,
) {
    for (entity, obstacle, transform) in query.iter() {
        if let Some(old_reference) = relations.remove(&entity) {
            if let Err(error) = tile_cache.remove_obstacle(old_reference) {
                warn!("Failed to replace obstacle: {error}");
                continue;
            }
        }

        match tile_cache.add_obstacle(obstacle.world_shape(transform)) {
            Ok(reference) => {
                relations.insert(entity, reference);
            }
            Err(error) => warn!("Failed to add obstacle: {error}"),
        }
    }
}

fn update_tile_cache_system(
    nav_mesh_settings: Res<NavMeshSettings>,
    mut tile_cache: ResMut<TileCache>,
    nav_mesh: Res<NavMesh>,
    mut rebuilt_events: EventWriter<TileRebuilt>,
) {
    let Ok(mut nav_mesh) = nav_mesh.0.write() else {
        error!("Nav-Mesh lock has been poisoned. Tile rebuilding can no longer continue.");
        return;
    };

    let update = tile_cache.update(&nav_mesh_settings, &mut nav_mesh);
    for (coord, layer) in update.rebuilt {
        rebuilt_events.send(TileRebuilt { coord, layer });
    }
}

/// Voxelizes & filters one tile's geometry into its compact walkable
/// surface, ready for partitioning (or layer extraction for the tile cache).
/// ``area_modifiers`` paint surface types (water, roads, ...) onto the
/// walkable area before it is partitioned.
pub fn build_open_tile(
    tile_coord: UVec2,
    geometry_collections: &[GeometryCollection],
    area_modifiers: &[areas::AreaModifier],
    nav_mesh_settings: &NavMeshSettings,
) -> heightfields::OpenTile {
    let mut voxelized_tile = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build Heightfield Tile").entered();
        heightfields::build_heightfield_tile(tile_coord, geometry_collections, nav_mesh_settings)
    };

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Filter walkable spans").entered();
        heightfields::filter_low_hanging_walkable_obstacles(
            &mut voxelized_tile,
            nav_mesh_settings.step_height,
        );
        heightfields::filter_ledge_spans(&mut voxelized_tile, nav_mesh_settings);
        heightfields::filter_low_height_spans(
            &mut voxelized_tile,
            nav_mesh_settings.walkable_height,
        );
    }

    let mut open_tile = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build Open Heightfield Tile").entered();
        heightfields::build_open_heightfield_tile(&voxelized_tile, nav_mesh_settings)
    };

    // Remove areas that are too close to a wall.
    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Erode walkable area").entered();
        heightfields::erode_walkable_area(&mut open_tile, nav_mesh_settings);
    }

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Mark areas").entered();
        areas::apply_area_modifiers(
            nav_mesh_settings,
            tile_coord,
            area_modifiers,
            &mut open_tile,
        );
        areas::median_filter_walkable_area(&mut open_tile, nav_mesh_settings);
    }

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Calculate distance field").entered();
        heightfields::calculate_distance_field(&mut open_tile, nav_mesh_settings);
    }

    open_tile
}

/// Runs the whole build pipeline for one tile, producing a runtime nav-mesh
/// tile at layer 0.
pub fn build_tile_sync(
    geometry_collections: Vec<GeometryCollection>,
    tile_coord: UVec2,
    area_modifiers: &[areas::AreaModifier],
    off_mesh_connections: Vec<tiles::OffMeshConnection>,
    nav_mesh_settings: &NavMeshSettings,
) -> tiles::NavMeshTile {
    let mut open_tile = build_open_tile(
        tile_coord,
        &geometry_collections,
        area_modifiers,
        nav_mesh_settings,
    );

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build regions").entered();
        regions::build_regions(&mut open_tile, nav_mesh_settings);
    }

    let contour_set = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build contours").entered();
        contour::build_contours(&open_tile, nav_mesh_settings)
    };

    let poly_mesh = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build poly mesh").entered();
        mesher::build_poly_mesh(&contour_set, nav_mesh_settings)
    };

    let detail = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build detail mesh").entered();
        detail_mesh::build_poly_mesh_detail(nav_mesh_settings, &open_tile, &poly_mesh, tile_coord)
    };

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Create nav-mesh tile from poly mesh").entered();

        tiles::create_nav_mesh_tile_from_poly_mesh(
            poly_mesh,
            detail,
            off_mesh_connections,
            tile_coord,
            0,
            nav_mesh_settings,
        )
    }
}

pub(crate) fn get_neighbour_index(tile_side: usize, index: usize, dir: usize) -> usize {
    match dir {
        0 => index - 1,
        1 => index + tile_side,
        2 => index + 1,
        3 => index - tile_side,
        _ => panic!("Not a valid direction"),
    }
}

pub(crate) fn get_cell_offset(nav_mesh_settings: &NavMeshSettings, dir: usize) -> isize {
    let tile_side = nav_mesh_settings.get_tile_side_with_border() as isize;
    match dir {
        0 => -1,
        1 => tile_side,
        2 => 1,
        3 => -tile_side,
        _ => panic!("Not a valid direction"),
    }
}
