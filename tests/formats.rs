//! Persistence round trips: tile blobs, nav-mesh sets & tile-cache sets.

use std::num::{NonZeroU16, NonZeroU8};

use bevy::prelude::{Transform, Vec2, Vec3};
use tiled_navigation::{
    build_open_tile, build_tile_sync,
    io::{read_nav_mesh_set, read_tile_cache_set, write_nav_mesh_set, write_tile_cache_set},
    query::find_path,
    tile_blob::{data_swap_endian, decode_tile, encode_tile, header_swap_endian},
    tile_cache::{build_tile_cache_layers, TileCache},
    tiles::NavMeshTiles,
    DetailMeshSettings, GeometryCollection, NavMeshSettings, Triangles,
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
        detail_mesh_generation: Some(DetailMeshSettings {
            max_height_error: NonZeroU16::new(2).unwrap(),
            sample_step: NonZeroU8::new(4).unwrap(),
        }),
    }
}

#[test]
fn built_tile_blob_round_trips() {
    let settings = test_settings();
    let tile_coord = settings.get_tile_containing_position(Vec2::new(5.0, 5.0));

    let tile = build_tile_sync(
        vec![quad(Vec3::new(0.0, 0.0, 0.0), 12.0, 12.0)],
        tile_coord,
        &[],
        Vec::new(),
        &settings,
    );
    assert!(tile.detail.is_some(), "detail generation was requested");

    let blob = encode_tile(&tile, &settings);
    let decoded = decode_tile(&blob).unwrap();

    assert_eq!(decoded.coord, tile.coord);
    assert_eq!(decoded.vertices, tile.vertices);
    assert_eq!(decoded.polygons.len(), tile.polygons.len());
    assert_eq!(decoded.detail, tile.detail);
    assert_eq!(decoded.bv_tree, tile.bv_tree);

    // Byte-for-byte stable across a decode/encode cycle.
    assert_eq!(blob, encode_tile(&decoded, &settings));

    // Both endian swaps are involutions over a real blob.
    let mut swapped = blob.clone();
    header_swap_endian(&mut swapped).unwrap();
    header_swap_endian(&mut swapped).unwrap();
    data_swap_endian(&mut swapped).unwrap();
    data_swap_endian(&mut swapped).unwrap();
    assert_eq!(blob, swapped);
}

#[test]
fn nav_mesh_set_round_trips() {
    let settings = test_settings();

    let mut nav_mesh = NavMeshTiles::new(64, 256);

    let floor = quad(Vec3::new(-30.0, 0.0, 0.0), 60.0, 8.0);
    for world_x in [-25.0, -9.0, 7.0] {
        let tile_coord = settings.get_tile_containing_position(Vec2::new(world_x, 4.0));
        let tile = build_tile_sync(vec![floor.clone()], tile_coord, &[], Vec::new(), &settings);
        nav_mesh.add_tile(tile, &settings).unwrap();
    }

    let mut buffer = Vec::new();
    write_nav_mesh_set(&mut buffer, &nav_mesh, &settings).unwrap();

    let restored = read_nav_mesh_set(&mut buffer.as_slice(), &settings).unwrap();
    assert_eq!(restored.tile_count(), nav_mesh.tile_count());

    // The restored mesh is relinked & traversable across seams.
    let path = find_path(
        &restored,
        &settings,
        Vec3::new(-25.0, 0.0, 4.0),
        Vec3::new(10.0, 0.0, 4.0),
        None,
        None,
    )
    .unwrap();
    assert!(!path.partial);
}

#[test]
fn nav_mesh_set_rejects_garbage() {
    let settings = test_settings();

    assert!(read_nav_mesh_set(&mut [0u8; 32].as_slice(), &settings).is_err());
}

#[test]
fn tile_cache_set_round_trips() {
    let settings = test_settings();
    let tile_coord = settings.get_tile_containing_position(Vec2::new(7.0, 7.0));

    let open_tile = build_open_tile(
        tile_coord,
        &[quad(Vec3::new(0.0, 0.0, 0.0), 14.0, 14.0)],
        &[],
        &settings,
    );

    let mut cache = TileCache::new();
    for layer in build_tile_cache_layers(&open_tile, tile_coord, &settings) {
        cache.add_tile(layer).unwrap();
    }

    let nav_mesh = NavMeshTiles::default();
    let mut buffer = Vec::new();
    write_tile_cache_set(&mut buffer, &cache, &nav_mesh, &settings).unwrap();

    let restored = read_tile_cache_set(&mut buffer.as_slice()).unwrap();
    assert_eq!(restored.tile_count(), cache.tile_count());

    // The restored cache can still produce a working nav-mesh tile.
    let mut nav_mesh = NavMeshTiles::default();
    restored
        .build_nav_mesh_tile(tile_coord, 0, &settings, &mut nav_mesh)
        .unwrap();
    assert_eq!(nav_mesh.tile_count(), 1);

    let decompressed = restored.decompress_tile(tile_coord, 0).unwrap();
    assert_eq!(
        decompressed.heights.len(),
        usize::from(decompressed.header.width) * usize::from(decompressed.header.height)
    );
}
