//! Driving the Bevy plugin: obstacle components end up in the tile cache &
//! rebuilt tiles land in the nav-mesh resource.

use std::num::NonZeroU16;

use bevy::prelude::*;
use tiled_navigation::{
    build_open_tile,
    query::find_path,
    tile_cache::{build_tile_cache_layers, TileCache},
    GeometryCollection, NavMesh, NavMeshObstacle, NavMeshSettings, TiledNavigationPlugin,
    Triangles,
};

fn quad(min: Vec3, size_x: f32, size_z: f32) -> GeometryCollection {
    GeometryCollection::new(
        Transform::IDENTITY,
        Triangles::TriMesh(
            Box::new([
                min,
                min + Vec3::new(size_x, 0.0, 0.0),
                min + Vec3::new(size_x, 0.0, size_z),
                min + Vec3::new(0.0, 0.0, size_z),
            ]),
            Box::new([[0, 2, 1], [0, 3, 2]]),
        ),
    )
}

fn test_settings() -> NavMeshSettings {
    NavMeshSettings {
        cell_width: 1.0,
        cell_height: 0.5,
        tile_width: NonZeroU16::new(16).unwrap(),
        world_half_extents: 50.0,
        world_bottom_bound: -1.0,
        max_traversable_slope_radians: 45.0_f32.to_radians(),
        walkable_height: 4,
        walkable_radius: 1,
        step_height: 1,
        min_region_area: 4,
        max_region_area_to_merge_into: 500,
        max_edge_length: 80,
        max_contour_simplification_error: 1.1,
        partition_type: tiled_navigation::PartitionType::Watershed,
        max_tile_generation_tasks: None,
        detail_mesh_generation: None,
    }
}

#[test]
fn obstacle_component_blocks_the_floor() {
    let settings = test_settings();

    let mut app = App::new();
    app.add_plugins((
        MinimalPlugins,
        TransformPlugin,
        TiledNavigationPlugin::new(settings.clone()),
    ));

    // Seed the tile cache with one floor tile & bake the initial nav-mesh.
    let tile_coord = settings.get_tile_containing_position(Vec2::new(7.0, 7.0));
    {
        let open_tile = build_open_tile(
            tile_coord,
            &[quad(Vec3::new(0.0, 0.0, 0.0), 14.0, 14.0)],
            &[],
            &settings,
        );

        let mut cache = app.world_mut().resource_mut::<TileCache>();
        for layer in build_tile_cache_layers(&open_tile, tile_coord, &settings) {
            cache.add_tile(layer).unwrap();
        }
    }
    {
        let nav_mesh = app.world().resource::<NavMesh>().get();
        let mut nav_mesh = nav_mesh.write().unwrap();
        app.world()
            .resource::<TileCache>()
            .build_nav_mesh_tile(tile_coord, 0, &settings, &mut nav_mesh)
            .unwrap();
    }

    let start = Vec3::new(2.0, 0.0, 7.0);
    let end = Vec3::new(12.0, 0.0, 7.0);

    let baseline = {
        let nav_mesh = app.world().resource::<NavMesh>().get();
        let nav_mesh = nav_mesh.read().unwrap();
        find_path(&nav_mesh, &settings, start, end, None, None)
            .expect("the empty floor must be traversable")
    };
    assert!(!baseline.partial);

    // Drop an obstacle into the middle of the floor.
    app.world_mut().spawn((
        Transform::from_xyz(7.0, -1.0, 7.0),
        GlobalTransform::from(Transform::from_xyz(7.0, -1.0, 7.0)),
        NavMeshObstacle::Cylinder {
            radius: 3.0,
            height: 3.0,
        },
    ));

    for _ in 0..8 {
        app.update();
    }

    let blocked = {
        let nav_mesh = app.world().resource::<NavMesh>().get();
        let nav_mesh = nav_mesh.read().unwrap();
        find_path(&nav_mesh, &settings, start, end, None, None)
    };

    // Either the goal became unreachable or the corridor grew around the
    // cylinder.
    match blocked {
        Ok(path) => assert!(
            path.partial || path.polygons.len() > baseline.polygons.len(),
            "the obstacle must affect the path"
        ),
        Err(_) => {}
    }
}
