//! Obstacle rebuild cycles & the sliced path query.

use std::num::NonZeroU16;

use bevy::prelude::{Transform, Vec2, Vec3};
use tiled_navigation::{
    build_open_tile, build_tile_sync,
    query::{
        find_path, find_polygon_path, init_sliced_find_path, perform_string_pulling_on_path,
        QueryFilter, SlicedPathStatus,
    },
    tile_cache::{build_tile_cache_layers, ObstacleShape, ObstacleState, TileCache},
    tiles::NavMeshTiles,
    GeometryCollection, NavMeshSettings, Triangles,
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

fn pump_until_up_to_date(
    cache: &mut TileCache,
    settings: &NavMeshSettings,
    nav_mesh: &mut NavMeshTiles,
) {
    for _ in 0..16 {
        if cache.update(settings, nav_mesh).up_to_date {
            return;
        }
    }
    panic!("tile cache did not settle");
}

fn straight_length(
    nav_mesh: &NavMeshTiles,
    settings: &NavMeshSettings,
    start: Vec3,
    end: Vec3,
) -> Option<f32> {
    let path = find_path(nav_mesh, settings, start, end, None, None).ok()?;
    if path.partial {
        return None;
    }

    let straight = perform_string_pulling_on_path(nav_mesh, start, end, &path.polygons).ok()?;
    Some(
        straight
            .windows(2)
            .map(|pair| pair[0].position.distance(pair[1].position))
            .sum(),
    )
}

#[test]
fn obstacle_cycle_detours_and_restores() {
    let settings = test_settings();

    let floor = quad(Vec3::new(0.0, 0.0, 0.0), 14.0, 14.0);
    let tile_coord = settings.get_tile_containing_position(Vec2::new(7.0, 7.0));

    let open_tile = build_open_tile(tile_coord, &[floor], &[], &settings);
    let layers = build_tile_cache_layers(&open_tile, tile_coord, &settings);
    assert_eq!(layers.len(), 1, "a flat floor is exactly one layer");

    let mut cache = TileCache::new();
    for layer in layers {
        cache.add_tile(layer).unwrap();
    }

    let mut nav_mesh = NavMeshTiles::default();
    cache
        .build_nav_mesh_tile(tile_coord, 0, &settings, &mut nav_mesh)
        .unwrap();

    let start = Vec3::new(2.0, 0.0, 7.0);
    let end = Vec3::new(12.0, 0.0, 7.0);

    let unobstructed = straight_length(&nav_mesh, &settings, start, end)
        .expect("the empty floor must be traversable");

    // A stale-ref canary from before the rebuild.
    let (old_ref, _) = nav_mesh
        .find_closest_polygon_in_box(&settings, start, Vec3::splat(2.0))
        .unwrap();

    // Insert a cylinder in the middle of the floor.
    let obstacle = cache
        .add_obstacle(ObstacleShape::Cylinder {
            position: Vec3::new(7.0, -1.0, 7.0),
            radius: 2.5,
            height: 3.0,
        })
        .unwrap();

    pump_until_up_to_date(&mut cache, &settings, &mut nav_mesh);
    assert_eq!(cache.obstacle_state(obstacle), ObstacleState::Processed);

    // The rebuild swapped the tile: refs captured before are stale now.
    assert!(
        !nav_mesh.is_valid_poly_ref(old_ref),
        "refs into the rebuilt tile must go stale"
    );

    // The path either detours around the cylinder or fails outright.
    match straight_length(&nav_mesh, &settings, start, end) {
        Some(detoured) => assert!(
            detoured > unobstructed + 0.5,
            "blocked path must be longer: {detoured} vs {unobstructed}"
        ),
        None => {} // Partial result is acceptable too.
    }

    // Remove the obstacle & verify the straight line comes back.
    cache.remove_obstacle(obstacle).unwrap();
    pump_until_up_to_date(&mut cache, &settings, &mut nav_mesh);

    let restored = straight_length(&nav_mesh, &settings, start, end)
        .expect("the floor must be traversable again");
    assert!(
        (restored - unobstructed).abs() < 0.5,
        "restored {restored} vs original {unobstructed}"
    );
}

#[test]
fn sliced_path_matches_single_shot() {
    let settings = test_settings();

    // An L-shaped floor so the search has something to do.
    let floor_a = quad(Vec3::new(0.0, 0.0, 0.0), 14.0, 6.0);
    let floor_b = quad(Vec3::new(8.0, 0.0, 6.0), 6.0, 8.0);

    let tile_coord = settings.get_tile_containing_position(Vec2::new(7.0, 7.0));
    let tile = build_tile_sync(vec![floor_a, floor_b], tile_coord, &[], Vec::new(), &settings);

    let mut nav_mesh = NavMeshTiles::default();
    nav_mesh.add_tile(tile, &settings).unwrap();

    let start = Vec3::new(2.0, 0.0, 3.0);
    let end = Vec3::new(11.0, 0.0, 12.0);

    let (start_ref, start_point) = nav_mesh
        .find_closest_polygon_in_box(&settings, start, Vec3::splat(2.0))
        .unwrap();
    let (end_ref, end_point) = nav_mesh
        .find_closest_polygon_in_box(&settings, end, Vec3::splat(2.0))
        .unwrap();

    let filter = QueryFilter::default();
    let single_shot =
        find_polygon_path(&nav_mesh, start_ref, start_point, end_ref, end_point, &filter)
            .unwrap();

    let mut sliced = init_sliced_find_path(
        &nav_mesh,
        start_ref,
        start_point,
        end_ref,
        end_point,
        filter,
    )
    .unwrap();

    let mut iterations = 0;
    loop {
        match sliced.update(&nav_mesh, 4) {
            SlicedPathStatus::InProgress => {
                iterations += 1;
                assert!(iterations < 10_000, "sliced query must terminate");
            }
            _ => break,
        }
    }

    let sliced_path = sliced.finalize();

    assert_eq!(single_shot.partial, sliced_path.partial);
    assert_eq!(single_shot.polygons, sliced_path.polygons);
}

#[test]
fn removing_a_tile_invalidates_refs() {
    let settings = test_settings();

    let floor = quad(Vec3::new(0.0, 0.0, 0.0), 10.0, 10.0);
    let tile_coord = settings.get_tile_containing_position(Vec2::new(5.0, 5.0));

    let tile = build_tile_sync(vec![floor], tile_coord, &[], Vec::new(), &settings);
    let mut nav_mesh = NavMeshTiles::default();
    let tile_ref = nav_mesh.add_tile(tile, &settings).unwrap();

    let (poly_ref, _) = nav_mesh
        .find_closest_polygon_in_box(&settings, Vec3::new(5.0, 0.0, 5.0), Vec3::splat(2.0))
        .unwrap();
    assert!(nav_mesh.is_valid_poly_ref(poly_ref));

    let removed = nav_mesh.remove_tile(tile_ref).unwrap();
    assert_eq!(removed.coord, tile_coord);

    // The slot is empty & the captured ref is stale.
    assert_eq!(nav_mesh.tile_count(), 0);
    assert!(!nav_mesh.is_valid_poly_ref(poly_ref));
    assert!(nav_mesh.remove_tile(tile_ref).is_err());

    // Re-adding bumps the salt again; old refs stay stale.
    let floor = quad(Vec3::new(0.0, 0.0, 0.0), 10.0, 10.0);
    let tile = build_tile_sync(vec![floor], tile_coord, &[], Vec::new(), &settings);
    nav_mesh.add_tile(tile, &settings).unwrap();
    assert!(!nav_mesh.is_valid_poly_ref(poly_ref));
}

#[test]
fn obstacles_only_touch_overlapping_tiles() {
    let settings = test_settings();

    let floor = quad(Vec3::new(0.0, 0.0, 0.0), 14.0, 14.0);
    let tile_coord = settings.get_tile_containing_position(Vec2::new(7.0, 7.0));

    let open_tile = build_open_tile(tile_coord, &[floor], &[], &settings);
    let mut cache = TileCache::new();
    for layer in build_tile_cache_layers(&open_tile, tile_coord, &settings) {
        cache.add_tile(layer).unwrap();
    }

    let mut nav_mesh = NavMeshTiles::default();
    cache
        .build_nav_mesh_tile(tile_coord, 0, &settings, &mut nav_mesh)
        .unwrap();

    // An obstacle far away never touches the tile, so no rebuild happens.
    let far_away = cache
        .add_obstacle(ObstacleShape::Box {
            min: Vec3::new(200.0, 0.0, 200.0),
            max: Vec3::new(202.0, 2.0, 202.0),
        })
        .unwrap();

    let update = cache.update(&settings, &mut nav_mesh);
    assert!(update.rebuilt.is_empty());
    assert_eq!(cache.obstacle_state(far_away), ObstacleState::Processed);
}
