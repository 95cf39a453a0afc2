//! The packed on-disk form of one nav-mesh tile.
//!
//! The blob is little-endian by default & consists of align4-padded sections
//! in a fixed order: header, vertices, polygons, links, detail meshes, detail
//! vertices, detail triangles, BV tree, off-mesh connections. Links are
//! runtime state; the section is zeroed on encode & skipped on decode.

use bevy::prelude::{UVec2, Vec3};
use thiserror::Error;

use crate::detail_mesh::PolyMeshDetail;
use crate::mesher::{EdgeConnection, EdgeConnectionDirection};
use crate::tiles::{BvNode, NavMeshTile, OffMeshConnection, Polygon};
use crate::{Area, NavMeshSettings};

pub const NAV_MESH_TILE_MAGIC: u32 =
    (b'D' as u32) << 24 | (b'N' as u32) << 16 | (b'A' as u32) << 8 | b'V' as u32;
pub const NAV_MESH_TILE_VERSION: i32 = 1;

// 14 int fields plus 10 float fields, all four bytes wide.
const HEADER_SIZE: usize = 96;
const LINK_RECORD_SIZE: usize = 16;
const MAX_BLOB_VERTICES_PER_POLYGON: usize = crate::mesher::MAX_VERTICES_PER_POLYGON;

/// Neighbour encoding inside the packed polygon record.
const NEI_NONE: u16 = 0;
const NEI_PORTAL_FLAG: u16 = 0x8000;

const POLY_TYPE_OFF_MESH: u8 = 1 << 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileDataError {
    #[error("tile data does not start with the nav-mesh magic")]
    WrongMagic,
    #[error("tile data has version {0}, expected {NAV_MESH_TILE_VERSION}")]
    WrongVersion(i32),
    #[error("tile data is truncated")]
    Truncated,
    #[error("tile data contains an out-of-range index")]
    CorruptIndex,
}

struct Writer {
    data: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.data.push(value);
    }
    fn u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }
    fn u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }
    fn i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }
    fn u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }
    fn f32(&mut self, value: f32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }
    fn vec3(&mut self, value: Vec3) {
        self.f32(value.x);
        self.f32(value.y);
        self.f32(value.z);
    }
    fn align4(&mut self) {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], TileDataError> {
        let slice = self
            .data
            .get(self.offset..self.offset + count)
            .ok_or(TileDataError::Truncated)?;
        self.offset += count;
        Ok(slice)
    }
    fn u8(&mut self) -> Result<u8, TileDataError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, TileDataError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32, TileDataError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> Result<i32, TileDataError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn f32(&mut self) -> Result<f32, TileDataError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn vec3(&mut self) -> Result<Vec3, TileDataError> {
        Ok(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }
    fn align4(&mut self) {
        self.offset = (self.offset + 3) & !3;
    }
}

fn max_link_count(tile: &NavMeshTile) -> usize {
    let edge_links: usize = tile
        .polygons
        .iter()
        .map(|polygon| polygon.indices.len())
        .sum();
    edge_links + tile.off_mesh_connections.len() * 4
}

/// Serializes the tile into its monolithic blob form.
pub fn encode_tile(tile: &NavMeshTile, nav_mesh_settings: &NavMeshSettings) -> Vec<u8> {
    let mut writer = Writer { data: Vec::new() };

    let ground_polygons = tile.polygons.len() - tile.off_mesh_connections.len();
    let (detail_mesh_count, detail_vert_count, detail_tri_count) = match &tile.detail {
        Some(detail) => (
            detail.meshes.len(),
            detail.vertices.len(),
            detail.triangles.len(),
        ),
        None => (0, 0, 0),
    };

    // Header.
    writer.u32(NAV_MESH_TILE_MAGIC);
    writer.i32(NAV_MESH_TILE_VERSION);
    writer.i32(tile.coord.x as i32);
    writer.i32(tile.coord.y as i32);
    writer.i32(i32::from(tile.layer));
    writer.i32(tile.polygons.len() as i32);
    writer.i32(tile.vertices.len() as i32);
    writer.i32(max_link_count(tile) as i32);
    writer.i32(detail_mesh_count as i32);
    writer.i32(detail_vert_count as i32);
    writer.i32(detail_tri_count as i32);
    writer.i32(tile.bv_tree.len() as i32);
    writer.i32(tile.off_mesh_connections.len() as i32);
    writer.i32(ground_polygons as i32);
    writer.f32(f32::from(nav_mesh_settings.walkable_height) * nav_mesh_settings.cell_height);
    writer.f32(f32::from(nav_mesh_settings.walkable_radius) * nav_mesh_settings.cell_width);
    writer.f32(f32::from(nav_mesh_settings.step_height) * nav_mesh_settings.cell_height);
    writer.vec3(tile.bounds_min);
    writer.vec3(tile.bounds_max);
    writer.f32(crate::tiles::BV_QUANT_FACTOR);

    debug_assert_eq!(writer.data.len(), HEADER_SIZE);

    // Vertices.
    for vertex in tile.vertices.iter() {
        writer.vec3(*vertex);
    }
    writer.align4();

    // Polygons.
    for polygon in tile.polygons.iter() {
        writer.u32(0); // first_link, rebuilt at add time.

        for i in 0..MAX_BLOB_VERTICES_PER_POLYGON {
            writer.u16(polygon.indices.get(i).map_or(0, |index| *index as u16));
        }
        for i in 0..MAX_BLOB_VERTICES_PER_POLYGON {
            let nei = match polygon.edges.get(i) {
                Some(EdgeConnection::Internal(neighbour)) => *neighbour + 1,
                Some(EdgeConnection::External(direction)) => {
                    NEI_PORTAL_FLAG | u16::from(direction.as_u8())
                }
                _ => NEI_NONE,
            };
            writer.u16(nei);
        }

        writer.u16(polygon.flags);
        writer.u8(polygon.indices.len() as u8);

        let type_bit = if polygon.is_off_mesh() {
            POLY_TYPE_OFF_MESH
        } else {
            0
        };
        writer.u8((polygon.area.0.min(0x3f) as u8) | type_bit);
    }
    writer.align4();

    // Links, zeroed.
    for _ in 0..max_link_count(tile) * LINK_RECORD_SIZE {
        writer.u8(0);
    }
    writer.align4();

    // Detail meshes.
    if let Some(detail) = &tile.detail {
        for mesh in detail.meshes.iter() {
            for value in mesh {
                writer.u32(*value);
            }
        }
        writer.align4();

        for vertex in detail.vertices.iter() {
            writer.vec3(*vertex);
        }
        writer.align4();

        for triangle in detail.triangles.iter() {
            for value in triangle {
                writer.u8(*value);
            }
        }
        writer.align4();
    }

    // BV tree.
    for node in tile.bv_tree.iter() {
        for value in node.min {
            writer.u16(value);
        }
        for value in node.max {
            writer.u16(value);
        }
        writer.i32(node.i);
    }
    writer.align4();

    // Off-mesh connections.
    for connection in tile.off_mesh_connections.iter() {
        writer.vec3(connection.start);
        writer.vec3(connection.end);
        writer.f32(connection.radius);
        writer.u16(connection.flags);
        writer.u16(connection.area.0);
        writer.u8(u8::from(connection.bidirectional));
        writer.u8(0);
        writer.u16(0);
    }
    writer.align4();

    writer.data
}

/// Deserializes a tile blob back into its runtime form.
pub fn decode_tile(data: &[u8]) -> Result<NavMeshTile, TileDataError> {
    let mut reader = Reader { data, offset: 0 };

    let magic = reader.u32()?;
    if magic != NAV_MESH_TILE_MAGIC {
        return Err(TileDataError::WrongMagic);
    }
    let version = reader.i32()?;
    if version != NAV_MESH_TILE_VERSION {
        return Err(TileDataError::WrongVersion(version));
    }

    let x = reader.i32()?;
    let y = reader.i32()?;
    let layer = reader.i32()?;
    let poly_count = reader.i32()? as usize;
    let vert_count = reader.i32()? as usize;
    let link_count = reader.i32()? as usize;
    let detail_mesh_count = reader.i32()? as usize;
    let detail_vert_count = reader.i32()? as usize;
    let detail_tri_count = reader.i32()? as usize;
    let bv_node_count = reader.i32()? as usize;
    let off_mesh_count = reader.i32()? as usize;
    let _off_mesh_base = reader.i32()?;
    let _walkable_height = reader.f32()?;
    let _walkable_radius = reader.f32()?;
    let _walkable_climb = reader.f32()?;
    let bounds_min = reader.vec3()?;
    let bounds_max = reader.vec3()?;
    let _bv_quant_factor = reader.f32()?;

    // Vertices.
    let mut vertices = Vec::with_capacity(vert_count);
    for _ in 0..vert_count {
        vertices.push(reader.vec3()?);
    }
    reader.align4();

    // Polygons.
    let mut polygons = Vec::with_capacity(poly_count);
    for _ in 0..poly_count {
        let _first_link = reader.u32()?;

        let mut indices = [0u16; MAX_BLOB_VERTICES_PER_POLYGON];
        for index in indices.iter_mut() {
            *index = reader.u16()?;
        }
        let mut neighbours = [0u16; MAX_BLOB_VERTICES_PER_POLYGON];
        for neighbour in neighbours.iter_mut() {
            *neighbour = reader.u16()?;
        }

        let flags = reader.u16()?;
        let vertex_count = usize::from(reader.u8()?);
        let area_and_type = reader.u8()?;

        if vertex_count > MAX_BLOB_VERTICES_PER_POLYGON {
            return Err(TileDataError::CorruptIndex);
        }

        let indices: Vec<u32> = indices[..vertex_count]
            .iter()
            .map(|index| u32::from(*index))
            .collect();
        if indices.iter().any(|index| *index as usize >= vert_count) {
            return Err(TileDataError::CorruptIndex);
        }

        let edges: Vec<EdgeConnection> = neighbours[..vertex_count]
            .iter()
            .map(|nei| {
                if *nei == NEI_NONE {
                    EdgeConnection::None
                } else if nei & NEI_PORTAL_FLAG != 0 {
                    EdgeConnection::External(EdgeConnectionDirection::from_u8(
                        (nei & 0x3) as u8,
                    ))
                } else {
                    EdgeConnection::Internal(nei - 1)
                }
            })
            .collect();

        polygons.push(Polygon {
            indices,
            edges,
            links: Vec::new(),
            area: Area(u16::from(area_and_type & 0x3f)),
            flags,
        });
    }
    reader.align4();

    // Links are runtime state.
    reader.take(link_count * LINK_RECORD_SIZE)?;
    reader.align4();

    // Detail.
    let detail = if detail_mesh_count > 0 {
        let mut meshes = Vec::with_capacity(detail_mesh_count);
        for _ in 0..detail_mesh_count {
            meshes.push([reader.u32()?, reader.u32()?, reader.u32()?, reader.u32()?]);
        }
        reader.align4();

        let mut detail_vertices = Vec::with_capacity(detail_vert_count);
        for _ in 0..detail_vert_count {
            detail_vertices.push(reader.vec3()?);
        }
        reader.align4();

        let mut triangles = Vec::with_capacity(detail_tri_count);
        for _ in 0..detail_tri_count {
            triangles.push([reader.u8()?, reader.u8()?, reader.u8()?, reader.u8()?]);
        }
        reader.align4();

        Some(PolyMeshDetail {
            meshes,
            vertices: detail_vertices,
            triangles,
        })
    } else {
        None
    };

    // BV tree.
    let mut bv_tree = Vec::with_capacity(bv_node_count);
    for _ in 0..bv_node_count {
        let min = [reader.u16()?, reader.u16()?, reader.u16()?];
        let max = [reader.u16()?, reader.u16()?, reader.u16()?];
        let i = reader.i32()?;
        bv_tree.push(BvNode { min, max, i });
    }
    reader.align4();

    // Off-mesh connections.
    let mut off_mesh_connections = Vec::with_capacity(off_mesh_count);
    for _ in 0..off_mesh_count {
        let start = reader.vec3()?;
        let end = reader.vec3()?;
        let radius = reader.f32()?;
        let flags = reader.u16()?;
        let area = reader.u16()?;
        let bidirectional = reader.u8()? != 0;
        let _pad = reader.u8()?;
        let _pad = reader.u16()?;

        off_mesh_connections.push(OffMeshConnection {
            start,
            end,
            radius,
            bidirectional,
            area: Area(area),
            flags,
        });
    }

    Ok(NavMeshTile {
        coord: UVec2::new(x.max(0) as u32, y.max(0) as u32),
        layer: layer.clamp(0, i32::from(u16::MAX)) as u16,
        vertices,
        polygons,
        detail,
        off_mesh_connections,
        bv_tree,
        bounds_min,
        bounds_max,
    })
}

/// Byte-swaps every multi-byte field of the blob header in place.
pub fn header_swap_endian(data: &mut [u8]) -> Result<(), TileDataError> {
    if data.len() < HEADER_SIZE {
        return Err(TileDataError::Truncated);
    }

    for field in data[..HEADER_SIZE].chunks_exact_mut(4) {
        field.reverse();
    }

    Ok(())
}

/// Byte-swaps every multi-byte field of the blob body in place. The header
/// must already be in native endianness.
pub fn data_swap_endian(data: &mut [u8]) -> Result<(), TileDataError> {
    let mut reader = Reader { data, offset: 0 };

    let magic = reader.u32()?;
    if magic != NAV_MESH_TILE_MAGIC {
        return Err(TileDataError::WrongMagic);
    }
    let version = reader.i32()?;
    if version != NAV_MESH_TILE_VERSION {
        return Err(TileDataError::WrongVersion(version));
    }

    reader.take(4 * 3)?; // coord & layer
    let poly_count = reader.i32()? as usize;
    let vert_count = reader.i32()? as usize;
    let link_count = reader.i32()? as usize;
    let detail_mesh_count = reader.i32()? as usize;
    let detail_vert_count = reader.i32()? as usize;
    let detail_tri_count = reader.i32()? as usize;
    let bv_node_count = reader.i32()? as usize;
    let off_mesh_count = reader.i32()? as usize;

    let mut offset = HEADER_SIZE;

    let mut swap = |data: &mut [u8], sizes: &[usize], count: usize| -> Result<(), TileDataError> {
        for _ in 0..count {
            for size in sizes {
                let field = data
                    .get_mut(offset..offset + size)
                    .ok_or(TileDataError::Truncated)?;
                field.reverse();
                offset += size;
            }
        }
        offset = (offset + 3) & !3;
        Ok(())
    };

    // Vertices.
    swap(data, &[4, 4, 4], vert_count)?;
    // Polygons: first_link, 12 u16 indices/neighbours, flags, two u8.
    swap(
        data,
        &[4, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 1, 1],
        poly_count,
    )?;
    // Links: ref u64, next u32, four u8.
    swap(data, &[8, 4, 1, 1, 1, 1], link_count)?;
    if detail_mesh_count > 0 {
        swap(data, &[4, 4, 4, 4], detail_mesh_count)?;
        swap(data, &[4, 4, 4], detail_vert_count)?;
        swap(data, &[1, 1, 1, 1], detail_tri_count)?;
    }
    // BV nodes: six u16, i32.
    swap(data, &[2, 2, 2, 2, 2, 2, 4], bv_node_count)?;
    // Off-mesh connections.
    swap(data, &[4, 4, 4, 4, 4, 4, 4, 2, 2, 1, 1, 2], off_mesh_count)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesher::EdgeConnection;

    fn sample_tile() -> NavMeshTile {
        let vertices = vec![
            Vec3::new(0.0, 0.5, 0.0),
            Vec3::new(10.0, 0.5, 0.0),
            Vec3::new(10.0, 0.5, 10.0),
            Vec3::new(0.0, 0.5, 10.0),
        ];

        let polygons = vec![
            Polygon {
                indices: vec![0, 1, 2],
                edges: vec![
                    EdgeConnection::None,
                    EdgeConnection::None,
                    EdgeConnection::Internal(1),
                ],
                links: Vec::new(),
                area: Area(0),
                flags: 1,
            },
            Polygon {
                indices: vec![0, 2, 3],
                edges: vec![
                    EdgeConnection::Internal(0),
                    EdgeConnection::None,
                    EdgeConnection::External(EdgeConnectionDirection::XNegative),
                ],
                links: Vec::new(),
                area: Area(0),
                flags: 1,
            },
        ];

        let mut tile = NavMeshTile {
            coord: UVec2::new(3, 4),
            layer: 0,
            vertices,
            polygons,
            detail: None,
            off_mesh_connections: Vec::new(),
            bv_tree: vec![BvNode {
                min: [0, 0, 0],
                max: [100, 10, 100],
                i: 0,
            }],
            bounds_min: Vec3::ZERO,
            bounds_max: Vec3::new(10.0, 3.0, 10.0),
        };
        tile.bv_tree.push(BvNode {
            min: [0, 0, 0],
            max: [50, 10, 100],
            i: 1,
        });
        tile
    }

    fn settings() -> NavMeshSettings {
        NavMeshSettings::from_agent_and_bounds(0.5, 2.0, 100.0, -10.0)
    }

    #[test]
    fn blob_round_trips_byte_for_byte() {
        let tile = sample_tile();
        let blob = encode_tile(&tile, &settings());

        let decoded = decode_tile(&blob).unwrap();
        let reencoded = encode_tile(&decoded, &settings());

        assert_eq!(blob, reencoded);
    }

    #[test]
    fn decode_preserves_structure() {
        let tile = sample_tile();
        let blob = encode_tile(&tile, &settings());
        let decoded = decode_tile(&blob).unwrap();

        assert_eq!(decoded.coord, tile.coord);
        assert_eq!(decoded.vertices, tile.vertices);
        assert_eq!(decoded.polygons.len(), tile.polygons.len());
        assert_eq!(decoded.polygons[1].edges, tile.polygons[1].edges);
        assert_eq!(decoded.bv_tree, tile.bv_tree);
    }

    #[test]
    fn header_swap_is_an_involution() {
        let tile = sample_tile();
        let blob = encode_tile(&tile, &settings());

        let mut swapped = blob.clone();
        header_swap_endian(&mut swapped).unwrap();
        assert_ne!(blob, swapped);
        header_swap_endian(&mut swapped).unwrap();
        assert_eq!(blob, swapped);
    }

    #[test]
    fn data_swap_is_an_involution() {
        let tile = sample_tile();
        let blob = encode_tile(&tile, &settings());

        let mut swapped = blob.clone();
        data_swap_endian(&mut swapped).unwrap();
        data_swap_endian(&mut swapped).unwrap();
        assert_eq!(blob, swapped);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let tile = sample_tile();
        let mut blob = encode_tile(&tile, &settings());
        blob[0] ^= 0xff;

        assert_eq!(decode_tile(&blob), Err(TileDataError::WrongMagic));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let tile = sample_tile();
        let mut blob = encode_tile(&tile, &settings());
        blob[4..8].copy_from_slice(&99i32.to_le_bytes());

        assert!(matches!(
            decode_tile(&blob),
            Err(TileDataError::WrongVersion(99))
        ));
    }
}
