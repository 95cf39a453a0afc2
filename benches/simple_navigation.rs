use std::num::NonZeroU16;

use bevy::prelude::{Transform, UVec2, Vec2, Vec3};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tiled_navigation::{
    build_tile_sync,
    query::{find_path, perform_string_pulling_on_path},
    tiles::{NavMeshTile, NavMeshTiles},
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

fn generate_single_floor(nav_mesh_settings: &NavMeshSettings) -> (UVec2, NavMeshTile) {
    let tile_coord = nav_mesh_settings.get_tile_containing_position(Vec2::new(0.0, 0.0));

    let geometry = vec![quad(Vec3::new(-10.0, 0.0, -10.0), 20.0, 20.0)];

    (
        tile_coord,
        build_tile_sync(geometry, tile_coord, &[], Vec::new(), nav_mesh_settings),
    )
}

fn generate_cluttered_floor(nav_mesh_settings: &NavMeshSettings) -> (UVec2, NavMeshTile) {
    let tile_coord = nav_mesh_settings.get_tile_containing_position(Vec2::new(0.0, 0.0));

    // A floor with raised islands the agent has to walk around.
    let geometry = vec![
        quad(Vec3::new(-10.0, 0.0, -10.0), 20.0, 20.0),
        quad(Vec3::new(-5.0, 1.5, -2.0), 4.0, 2.0),
        quad(Vec3::new(2.0, 1.5, -6.0), 2.0, 4.0),
        quad(Vec3::new(-2.0, 1.5, 3.0), 5.0, 2.0),
        quad(Vec3::new(4.0, 1.5, 4.0), 3.0, 3.0),
    ];

    (
        tile_coord,
        build_tile_sync(geometry, tile_coord, &[], Vec::new(), nav_mesh_settings),
    )
}

fn criterion_benchmark(c: &mut Criterion) {
    let nav_mesh_settings = NavMeshSettings {
        cell_width: 0.25,
        cell_height: 0.1,
        tile_width: NonZeroU16::new(100).unwrap(),
        world_half_extents: 12.5,
        world_bottom_bound: -1.0,
        max_traversable_slope_radians: (40.0_f32 - 0.1).to_radians(),
        walkable_height: 20,
        walkable_radius: 1,
        step_height: 3,
        min_region_area: 100,
        max_region_area_to_merge_into: 500,
        max_edge_length: 80,
        max_contour_simplification_error: 1.1,
        partition_type: tiled_navigation::PartitionType::Watershed,
        max_tile_generation_tasks: None,
        detail_mesh_generation: None,
    };

    let simple_mesh = {
        let mut nav_mesh = NavMeshTiles::default();
        let (_, tile) = generate_single_floor(&nav_mesh_settings);
        nav_mesh.add_tile(tile, &nav_mesh_settings).unwrap();
        nav_mesh
    };
    let cluttered_mesh = {
        let mut nav_mesh = NavMeshTiles::default();
        let (_, tile) = generate_cluttered_floor(&nav_mesh_settings);
        nav_mesh.add_tile(tile, &nav_mesh_settings).unwrap();
        nav_mesh
    };

    c.bench_function("generate_tile", |b| {
        b.iter(|| {
            black_box(generate_cluttered_floor(&nav_mesh_settings));
        })
    });

    c.bench_function("find_path_simple", |b| {
        b.iter(|| {
            let path = find_path(
                &simple_mesh,
                &nav_mesh_settings,
                black_box(Vec3::new(-9.0, 0.0, -9.0)),
                black_box(Vec3::new(9.0, 0.0, 9.0)),
                None,
                None,
            )
            .unwrap();
            black_box(path);
        })
    });

    c.bench_function("find_path_string_pulled", |b| {
        b.iter(|| {
            let start = black_box(Vec3::new(-9.0, 0.0, -9.0));
            let end = black_box(Vec3::new(9.0, 0.0, 9.0));

            let path = find_path(&cluttered_mesh, &nav_mesh_settings, start, end, None, None)
                .unwrap();
            let straight =
                perform_string_pulling_on_path(&cluttered_mesh, start, end, &path.polygons)
                    .unwrap();
            black_box(straight);
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
