//! End-to-end build & query scenarios on hand-made geometry.

use std::num::NonZeroU16;

use bevy::prelude::{Transform, UVec2, Vec2, Vec3};
use tiled_navigation::{
    areas::{convex_hull_2d, offset_polygon_2d, AreaModifier, AreaVolume},
    build_tile_sync,
    query::{find_path, perform_string_pulling_on_path, raycast, QueryFilter},
    tiles::NavMeshTiles,
    Area, GeometryCollection, NavMeshSettings, Triangles,
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

fn path_length(points: &[tiled_navigation::query::StraightPathVertex]) -> f32 {
    points
        .windows(2)
        .map(|pair| pair[0].position.distance(pair[1].position))
        .sum()
}

#[test]
fn single_quad_floor() {
    let settings = test_settings();

    let floor = quad(Vec3::new(0.0, 0.0, 0.0), 10.0, 10.0);
    let tile_coord = settings.get_tile_containing_position(bevy::prelude::Vec2::new(5.0, 5.0));

    let tile = build_tile_sync(vec![floor], tile_coord, &[], Vec::new(), &settings);
    assert!(
        !tile.polygons.is_empty(),
        "a flat floor must produce polygons"
    );

    let mut nav_mesh = NavMeshTiles::default();
    nav_mesh.add_tile(tile, &settings).unwrap();
    assert_eq!(nav_mesh.tile_count(), 1);

    let path = find_path(
        &nav_mesh,
        &settings,
        Vec3::new(1.0, 0.0, 1.0),
        Vec3::new(9.0, 0.0, 9.0),
        None,
        None,
    )
    .expect("pathfinding across a flat floor must succeed");

    assert!(!path.partial);
    // The whole floor merges into very few convex polygons.
    assert!(path.polygons.len() <= 2, "corridor: {:?}", path.polygons);

    let straight = perform_string_pulling_on_path(
        &nav_mesh,
        Vec3::new(1.0, 0.0, 1.0),
        Vec3::new(9.0, 0.0, 9.0),
        &path.polygons,
    )
    .unwrap();

    let length = path_length(&straight);
    let expected = 128.0_f32.sqrt();
    assert!(
        (length - expected).abs() < 0.5,
        "straight path length {length} expected ~{expected}"
    );
}

#[test]
fn step_within_climb_connects() {
    let settings = test_settings();

    // The upper floor sits within step range of the lower one.
    let lower = quad(Vec3::new(0.0, 0.0, 0.0), 5.0, 10.0);
    let upper = quad(Vec3::new(5.0, 0.25, 0.0), 5.0, 10.0);

    let tile_coord = settings.get_tile_containing_position(bevy::prelude::Vec2::new(5.0, 5.0));
    let tile = build_tile_sync(vec![lower, upper], tile_coord, &[], Vec::new(), &settings);

    let mut nav_mesh = NavMeshTiles::default();
    nav_mesh.add_tile(tile, &settings).unwrap();

    let path = find_path(
        &nav_mesh,
        &settings,
        Vec3::new(1.0, 0.0, 5.0),
        Vec3::new(9.0, 0.25, 5.0),
        None,
        None,
    )
    .expect("path across a small step must succeed");

    assert!(!path.partial, "the step must not split the surface");
}

#[test]
fn ledge_above_climb_separates() {
    let settings = test_settings();

    // The upper floor is a full unit up, twice the step height.
    let lower = quad(Vec3::new(0.0, 0.0, 0.0), 5.0, 10.0);
    let upper = quad(Vec3::new(5.0, 1.0, 0.0), 5.0, 10.0);

    let tile_coord = settings.get_tile_containing_position(bevy::prelude::Vec2::new(5.0, 5.0));
    let tile = build_tile_sync(vec![lower, upper], tile_coord, &[], Vec::new(), &settings);

    let mut nav_mesh = NavMeshTiles::default();
    nav_mesh.add_tile(tile, &settings).unwrap();

    let path = find_path(
        &nav_mesh,
        &settings,
        Vec3::new(1.0, 0.0, 5.0),
        Vec3::new(9.0, 1.0, 5.0),
        None,
        None,
    )
    .expect("a partial path to the ledge must still be returned");

    assert!(
        path.partial,
        "the ledge exceeds the climbable height, the goal must be unreachable"
    );
}

#[test]
fn tile_seam_connects_neighbouring_tiles() {
    let mut settings = test_settings();
    settings.tile_width = NonZeroU16::new(32).unwrap();
    settings.world_half_extents = 64.0;

    // One long strip crossing the tile boundary at x = 0 (tile 1 | tile 2).
    let floor = quad(Vec3::new(-30.0, 0.0, 0.0), 72.0, 8.0);

    let tile_a = settings.get_tile_containing_position(bevy::prelude::Vec2::new(-1.0, 1.0));
    let tile_b = settings.get_tile_containing_position(bevy::prelude::Vec2::new(1.0, 1.0));
    assert_ne!(tile_a, tile_b);

    let mut nav_mesh = NavMeshTiles::default();
    nav_mesh
        .add_tile(
            build_tile_sync(vec![floor.clone()], tile_a, &[], Vec::new(), &settings),
            &settings,
        )
        .unwrap();
    nav_mesh
        .add_tile(
            build_tile_sync(vec![floor], tile_b, &[], Vec::new(), &settings),
            &settings,
        )
        .unwrap();

    let start = Vec3::new(-25.0, 0.0, 4.0);
    let end = Vec3::new(14.0, 0.0, 4.0);

    let path = find_path(&nav_mesh, &settings, start, end, None, None)
        .expect("path across the tile seam must succeed");
    assert!(!path.partial);

    // The corridor crosses both tiles through a portal.
    let coords: Vec<UVec2> = path
        .polygons
        .iter()
        .filter_map(|reference| {
            nav_mesh
                .get_tile_and_polygon(*reference)
                .map(|(tile, _)| tile.coord)
        })
        .collect();
    assert!(coords.contains(&tile_a));
    assert!(coords.contains(&tile_b));

    let straight =
        perform_string_pulling_on_path(&nav_mesh, start, end, &path.polygons).unwrap();
    let length = path_length(&straight);
    assert!(
        (length - 39.0).abs() < 1.0,
        "straight path length {length} expected ~39"
    );
}

#[test]
fn area_modifiers_tag_polygons_and_scale_costs() {
    let settings = test_settings();

    let floor = quad(Vec3::new(0.0, 0.0, 0.0), 12.0, 12.0);
    let tile_coord = settings.get_tile_containing_position(Vec2::new(6.0, 6.0));

    // A mud patch across the middle of the floor, authored from scattered
    // points & grown by half a cell.
    let hull = convex_hull_2d(&[
        Vec2::new(4.0, 1.0),
        Vec2::new(8.0, 1.5),
        Vec2::new(7.5, 11.0),
        Vec2::new(4.5, 10.5),
        Vec2::new(6.0, 6.0),
    ]);
    let mud = AreaModifier {
        volume: AreaVolume::ConvexPolygon {
            vertices: offset_polygon_2d(&hull, 0.5),
            min_y: -1.0,
            max_y: 2.0,
        },
        area: Some(Area(3)),
    };

    let tile = build_tile_sync(vec![floor], tile_coord, &[mud], Vec::new(), &settings);
    assert!(tile.polygons.iter().any(|polygon| polygon.area == Area(3)));
    assert!(tile.polygons.iter().any(|polygon| polygon.area == Area(0)));

    let mut nav_mesh = NavMeshTiles::default();
    nav_mesh.add_tile(tile, &settings).unwrap();

    // Crossing the patch costs extra under a filter that penalizes it.
    let mut filter = QueryFilter::default();
    filter.area_cost[3] = 10.0;

    let path = find_path(
        &nav_mesh,
        &settings,
        Vec3::new(1.0, 0.0, 6.0),
        Vec3::new(11.0, 0.0, 6.0),
        None,
        Some(&filter),
    )
    .expect("the mud patch stays walkable");
    assert!(!path.partial);
}

#[test]
fn raycast_stops_at_walls_but_not_open_floor() {
    let settings = test_settings();

    let floor = quad(Vec3::new(0.0, 0.0, 0.0), 10.0, 10.0);
    let tile_coord = settings.get_tile_containing_position(bevy::prelude::Vec2::new(5.0, 5.0));

    let tile = build_tile_sync(vec![floor], tile_coord, &[], Vec::new(), &settings);
    let mut nav_mesh = NavMeshTiles::default();
    nav_mesh.add_tile(tile, &settings).unwrap();

    let filter = QueryFilter::default();
    let (start_ref, start_point) = nav_mesh
        .find_closest_polygon_in_box(&settings, Vec3::new(5.0, 0.0, 5.0), Vec3::splat(2.0))
        .unwrap();

    // Within the open floor: no hit.
    let open = raycast(
        &nav_mesh,
        start_ref,
        start_point,
        Vec3::new(6.0, start_point.y, 5.0),
        &filter,
    )
    .unwrap();
    assert!(!open.has_hit(), "open floor must not block the ray");

    // Off the edge of the floor: hit with a normal along the wall.
    let blocked = raycast(
        &nav_mesh,
        start_ref,
        start_point,
        Vec3::new(50.0, start_point.y, 5.0),
        &filter,
    )
    .unwrap();
    assert!(blocked.has_hit(), "the floor edge must block the ray");
    assert!(blocked.normal.length() > 0.9);
}
