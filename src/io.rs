//! Persisting nav-meshes & tile caches, plus debug dump formats.
//!
//! Set files are little-endian. A nav-mesh set (`MSET`) stores the mesh
//! parameters & every tile's monolithic blob; a tile-cache set (`TSET`)
//! stores the compressed layers instead.

use std::io::{self, Read, Write};

use bevy::prelude::{UVec2, Vec3};
use thiserror::Error;

use crate::contour::ContourSet;
use crate::heightfields::OpenTile;
use crate::mesher::{count_polygon_vertices, PolyMesh};
use crate::tile_blob::{decode_tile, encode_tile, TileDataError};
use crate::tile_cache::{CompressedTile, TileCache, TileCacheLayerHeader};
use crate::tiles::NavMeshTiles;
use crate::NavMeshSettings;

pub const NAV_MESH_SET_MAGIC: u32 =
    (b'M' as u32) << 24 | (b'S' as u32) << 16 | (b'E' as u32) << 8 | b'T' as u32;
pub const NAV_MESH_SET_VERSION: i32 = 1;

pub const TILE_CACHE_SET_MAGIC: u32 =
    (b'T' as u32) << 24 | (b'S' as u32) << 16 | (b'E' as u32) << 8 | b'T' as u32;
pub const TILE_CACHE_SET_VERSION: i32 = 1;

pub const CONTOUR_SET_MAGIC: u32 =
    (b'c' as u32) << 24 | (b's' as u32) << 16 | (b'e' as u32) << 8 | b't' as u32;
pub const CONTOUR_SET_VERSION: i32 = 2;

pub const COMPACT_HEIGHTFIELD_MAGIC: u32 =
    (b'r' as u32) << 24 | (b'c' as u32) << 16 | (b'h' as u32) << 8 | b'f' as u32;
pub const COMPACT_HEIGHTFIELD_VERSION: i32 = 3;

#[derive(Debug, Error)]
pub enum SetFileError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("the file does not start with the expected magic")]
    WrongMagic,
    #[error("the file has version {0}, which this build cannot read")]
    WrongVersion(i32),
    #[error(transparent)]
    Tile(#[from] TileDataError),
    #[error("the tile count {0} is implausible")]
    CorruptTileCount(i32),
}

fn write_u32(writer: &mut impl Write, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}
fn write_i32(writer: &mut impl Write, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}
fn write_u64(writer: &mut impl Write, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}
fn write_f32(writer: &mut impl Write, value: f32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}
fn write_vec3(writer: &mut impl Write, value: Vec3) -> io::Result<()> {
    write_f32(writer, value.x)?;
    write_f32(writer, value.y)?;
    write_f32(writer, value.z)
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}
fn read_i32(reader: &mut impl Read) -> io::Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}
fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}
fn read_f32(reader: &mut impl Read) -> io::Result<f32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(f32::from_le_bytes(bytes))
}
fn read_vec3(reader: &mut impl Read) -> io::Result<Vec3> {
    Ok(Vec3::new(
        read_f32(reader)?,
        read_f32(reader)?,
        read_f32(reader)?,
    ))
}

fn write_nav_mesh_params(
    writer: &mut impl Write,
    nav_mesh: &NavMeshTiles,
    nav_mesh_settings: &NavMeshSettings,
) -> io::Result<()> {
    let origin = Vec3::new(
        -nav_mesh_settings.world_half_extents,
        nav_mesh_settings.world_bottom_bound,
        -nav_mesh_settings.world_half_extents,
    );
    write_vec3(writer, origin)?;
    write_f32(writer, nav_mesh_settings.get_tile_size())?;
    write_f32(writer, nav_mesh_settings.get_tile_size())?;
    write_i32(writer, nav_mesh.max_tiles() as i32)?;
    write_i32(writer, nav_mesh.max_polys_per_tile() as i32)
}

struct NavMeshParams {
    max_tiles: i32,
    max_polys: i32,
}

fn read_nav_mesh_params(reader: &mut impl Read) -> io::Result<NavMeshParams> {
    let _origin = read_vec3(reader)?;
    let _tile_width = read_f32(reader)?;
    let _tile_height = read_f32(reader)?;
    let max_tiles = read_i32(reader)?;
    let max_polys = read_i32(reader)?;

    Ok(NavMeshParams {
        max_tiles,
        max_polys,
    })
}

/// Writes the nav-mesh & its tiles as a `MSET` set file.
pub fn write_nav_mesh_set(
    writer: &mut impl Write,
    nav_mesh: &NavMeshTiles,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<(), SetFileError> {
    write_u32(writer, NAV_MESH_SET_MAGIC)?;
    write_i32(writer, NAV_MESH_SET_VERSION)?;
    write_i32(writer, nav_mesh.tile_count() as i32)?;
    write_nav_mesh_params(writer, nav_mesh, nav_mesh_settings)?;

    for (tile_ref, tile) in nav_mesh.tiles() {
        let blob = encode_tile(tile, nav_mesh_settings);

        write_u64(writer, crate::tiles::PolyRef::from(tile_ref).into())?;
        write_i32(writer, blob.len() as i32)?;
        writer.write_all(&blob)?;
    }

    Ok(())
}

/// Reads a `MSET` set file back into a nav-mesh, re-linking all tiles.
pub fn read_nav_mesh_set(
    reader: &mut impl Read,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<NavMeshTiles, SetFileError> {
    let magic = read_u32(reader)?;
    if magic != NAV_MESH_SET_MAGIC {
        return Err(SetFileError::WrongMagic);
    }
    let version = read_i32(reader)?;
    if version != NAV_MESH_SET_VERSION {
        return Err(SetFileError::WrongVersion(version));
    }

    let tile_count = read_i32(reader)?;
    if !(0..=i32::MAX / 2).contains(&tile_count) {
        return Err(SetFileError::CorruptTileCount(tile_count));
    }

    let params = read_nav_mesh_params(reader)?;
    let mut nav_mesh = NavMeshTiles::new(
        params.max_tiles.max(1) as usize,
        params.max_polys.max(1) as usize,
    );

    for _ in 0..tile_count {
        let _tile_ref = read_u64(reader)?;
        let size = read_i32(reader)?;
        if size < 0 {
            return Err(SetFileError::CorruptTileCount(size));
        }

        let mut blob = vec![0u8; size as usize];
        reader.read_exact(&mut blob)?;

        let tile = decode_tile(&blob)?;
        if let Err(error) = nav_mesh.add_tile(tile, nav_mesh_settings) {
            bevy::log::warn!("Skipping tile from set file: {error}");
        }
    }

    Ok(nav_mesh)
}

fn write_layer_header(writer: &mut impl Write, header: &TileCacheLayerHeader) -> io::Result<()> {
    write_u32(writer, crate::tile_cache::TILE_CACHE_LAYER_MAGIC)?;
    write_i32(writer, crate::tile_cache::TILE_CACHE_LAYER_VERSION)?;
    write_i32(writer, header.coord.x as i32)?;
    write_i32(writer, header.coord.y as i32)?;
    write_i32(writer, i32::from(header.layer))?;
    write_vec3(writer, header.bounds_min)?;
    write_vec3(writer, header.bounds_max)?;
    for value in [
        header.height_min,
        header.height_max,
        header.width,
        header.height,
        header.min_x,
        header.max_x,
        header.min_y,
        header.max_y,
    ] {
        write_i32(writer, i32::from(value))?;
    }
    Ok(())
}

fn read_layer_header(reader: &mut impl Read) -> Result<TileCacheLayerHeader, SetFileError> {
    let magic = read_u32(reader)?;
    if magic != crate::tile_cache::TILE_CACHE_LAYER_MAGIC {
        return Err(SetFileError::WrongMagic);
    }
    let version = read_i32(reader)?;
    if version != crate::tile_cache::TILE_CACHE_LAYER_VERSION {
        return Err(SetFileError::WrongVersion(version));
    }

    let x = read_i32(reader)?;
    let y = read_i32(reader)?;
    let layer = read_i32(reader)?;
    let bounds_min = read_vec3(reader)?;
    let bounds_max = read_vec3(reader)?;

    let mut values = [0u16; 8];
    for value in values.iter_mut() {
        *value = read_i32(reader)?.clamp(0, i32::from(u16::MAX)) as u16;
    }

    Ok(TileCacheLayerHeader {
        coord: UVec2::new(x.max(0) as u32, y.max(0) as u32),
        layer: layer.clamp(0, i32::from(u16::MAX)) as u16,
        bounds_min,
        bounds_max,
        height_min: values[0],
        height_max: values[1],
        width: values[2],
        height: values[3],
        min_x: values[4],
        max_x: values[5],
        min_y: values[6],
        max_y: values[7],
    })
}

/// Writes the tile cache's compressed tiles as a `TSET` set file.
pub fn write_tile_cache_set(
    writer: &mut impl Write,
    tile_cache: &TileCache,
    nav_mesh: &NavMeshTiles,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<(), SetFileError> {
    write_u32(writer, TILE_CACHE_SET_MAGIC)?;
    write_i32(writer, TILE_CACHE_SET_VERSION)?;
    write_i32(writer, tile_cache.tile_count() as i32)?;
    write_nav_mesh_params(writer, nav_mesh, nav_mesh_settings)?;

    // Cache parameters.
    write_f32(writer, nav_mesh_settings.cell_width)?;
    write_f32(writer, nav_mesh_settings.cell_height)?;
    write_i32(writer, i32::from(nav_mesh_settings.tile_width.get()))?;
    write_i32(writer, i32::from(nav_mesh_settings.walkable_radius))?;

    for tile in tile_cache.compressed_tiles() {
        write_layer_header(writer, &tile.header)?;
        write_i32(writer, tile.data.len() as i32)?;
        writer.write_all(&tile.data)?;
    }

    Ok(())
}

/// Reads a `TSET` set file back into a tile cache. The nav-mesh tiles are
/// rebuilt lazily through [TileCache::build_nav_mesh_tile] or
/// [TileCache::update].
pub fn read_tile_cache_set(reader: &mut impl Read) -> Result<TileCache, SetFileError> {
    let magic = read_u32(reader)?;
    if magic != TILE_CACHE_SET_MAGIC {
        return Err(SetFileError::WrongMagic);
    }
    let version = read_i32(reader)?;
    if version != TILE_CACHE_SET_VERSION {
        return Err(SetFileError::WrongVersion(version));
    }

    let tile_count = read_i32(reader)?;
    if !(0..=i32::MAX / 2).contains(&tile_count) {
        return Err(SetFileError::CorruptTileCount(tile_count));
    }

    let _params = read_nav_mesh_params(reader)?;
    let _cell_width = read_f32(reader)?;
    let _cell_height = read_f32(reader)?;
    let _tile_width = read_i32(reader)?;
    let _walkable_radius = read_i32(reader)?;

    let mut tile_cache = TileCache::new();

    for _ in 0..tile_count {
        let header = read_layer_header(reader)?;
        let size = read_i32(reader)?;
        if size < 0 {
            return Err(SetFileError::CorruptTileCount(size));
        }

        let mut data = vec![0u8; size as usize];
        reader.read_exact(&mut data)?;

        tile_cache.add_compressed_tile(CompressedTile { header, data });
    }

    Ok(tile_cache)
}

/// Dumps a contour set for offline inspection.
pub fn write_contour_set(
    writer: &mut impl Write,
    contour_set: &ContourSet,
) -> Result<(), SetFileError> {
    write_u32(writer, CONTOUR_SET_MAGIC)?;
    write_i32(writer, CONTOUR_SET_VERSION)?;
    write_i32(writer, contour_set.contours.len() as i32)?;

    for contour in &contour_set.contours {
        write_i32(writer, i32::from(contour.region))?;
        write_i32(writer, i32::from(contour.area.0))?;
        write_i32(writer, contour.vertices.len() as i32)?;
        for vertex in &contour.vertices {
            write_u32(writer, vertex.x)?;
            write_u32(writer, vertex.y)?;
            write_u32(writer, vertex.z)?;
            write_u32(writer, vertex.w)?;
        }
    }

    Ok(())
}

/// Dumps a compact heightfield for offline inspection.
pub fn write_compact_heightfield(
    writer: &mut impl Write,
    open_tile: &OpenTile,
    nav_mesh_settings: &NavMeshSettings,
) -> Result<(), SetFileError> {
    let tile_side = nav_mesh_settings.get_tile_side_with_border();

    write_u32(writer, COMPACT_HEIGHTFIELD_MAGIC)?;
    write_i32(writer, COMPACT_HEIGHTFIELD_VERSION)?;
    write_i32(writer, tile_side as i32)?;
    write_i32(writer, tile_side as i32)?;
    write_i32(writer, open_tile.span_count as i32)?;
    write_i32(writer, i32::from(open_tile.max_distance))?;
    write_i32(writer, i32::from(open_tile.max_regions))?;

    for cell in open_tile.cells.iter() {
        write_i32(writer, cell.spans.len() as i32)?;

        for span in cell.spans.iter() {
            write_i32(writer, i32::from(span.min))?;
            write_i32(writer, span.max.map_or(-1, i32::from))?;
            write_i32(writer, i32::from(span.region))?;
            write_i32(
                writer,
                span.area.map_or(-1, |area| i32::from(area.0)),
            )?;
            write_i32(
                writer,
                i32::from(open_tile.distances[span.tile_index]),
            )?;

            let mut connections = 0i32;
            for (dir, neighbour) in span.neighbours.iter().enumerate() {
                if neighbour.is_some() {
                    connections |= 1 << dir;
                }
            }
            write_i32(writer, connections)?;
        }
    }

    Ok(())
}

/// Dumps the poly mesh as Wavefront OBJ text. Coordinates stay in cell
/// units.
pub fn write_poly_mesh_obj(writer: &mut impl Write, poly_mesh: &PolyMesh) -> io::Result<()> {
    for vertex in &poly_mesh.vertices {
        writeln!(writer, "v {} {} {}", vertex.x, vertex.y, vertex.z)?;
    }

    for polygon in &poly_mesh.polygons {
        let vertex_count = count_polygon_vertices(polygon);

        write!(writer, "f")?;
        for index in &polygon[..vertex_count] {
            // OBJ indices are one-based.
            write!(writer, " {}", index + 1)?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

/// Dumps a tile's detail triangulation as Wavefront OBJ text in world
/// units.
pub fn write_detail_mesh_obj(
    writer: &mut impl Write,
    tile: &crate::tiles::NavMeshTile,
) -> io::Result<()> {
    let Some(detail) = &tile.detail else {
        return Ok(());
    };

    let mut emitted = Vec::new();

    for (polygon_index, polygon) in tile.polygons.iter().enumerate() {
        if polygon.is_off_mesh() || polygon_index >= detail.meshes.len() {
            continue;
        }

        let [vertex_base, _, triangle_base, triangle_count] = detail.meshes[polygon_index];

        for triangle in
            &detail.triangles[triangle_base as usize..(triangle_base + triangle_count) as usize]
        {
            let mut face = [0usize; 3];
            for (corner, index) in triangle[..3].iter().enumerate() {
                let position = if usize::from(*index) < polygon.indices.len() {
                    tile.vertices[polygon.indices[usize::from(*index)] as usize]
                } else {
                    detail.vertices
                        [vertex_base as usize + usize::from(*index) - polygon.indices.len()]
                };

                emitted.push(position);
                face[corner] = emitted.len();
            }

            writeln!(
                writer,
                "# poly {polygon_index}"
            )?;
            for position in &emitted[emitted.len() - 3..] {
                writeln!(writer, "v {} {} {}", position.x, position.y, position.z)?;
            }
            writeln!(writer, "f {} {} {}", face[0], face[1], face[2])?;
        }
    }

    Ok(())
}
