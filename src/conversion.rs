//! Input geometry for the voxelization pipeline.
//!
//! The pipeline consumes raw triangle soups. Every triangle is classified by
//! slope during rasterization; an optional [Area] tag overrides which area the
//! resulting walkable surface belongs to.

use bevy::prelude::{Transform, Vec3};

use crate::Area;

/// Triangles of one input mesh.
#[derive(Debug, Clone)]
pub enum Triangles {
    /// A single triangle.
    Triangle([Vec3; 3]),
    /// An indexed triangle mesh.
    TriMesh(Box<[Vec3]>, Box<[[u32; 3]]>),
    /// An indexed triangle mesh with a per-triangle area tag. ``None`` marks
    /// the triangle as unwalkable regardless of slope.
    TriMeshWithAreas(Box<[Vec3]>, Box<[[u32; 3]]>, Box<[Option<Area>]>),
}

impl Triangles {
    pub fn triangle_count(&self) -> usize {
        match self {
            Triangles::Triangle(_) => 1,
            Triangles::TriMesh(_, triangles) => triangles.len(),
            Triangles::TriMeshWithAreas(_, triangles, _) => triangles.len(),
        }
    }
}

/// One transformed mesh contributing to a tile.
///
/// ``area`` applies to every triangle of the collection that doesn't carry its
/// own tag. Overlapping surfaces prefer the higher area.
#[derive(Debug, Clone)]
pub struct GeometryCollection {
    pub transform: Transform,
    pub triangles: Triangles,
    pub area: Option<Area>,
}

impl GeometryCollection {
    pub fn new(transform: Transform, triangles: Triangles) -> Self {
        Self {
            transform,
            triangles,
            area: Some(Area::default()),
        }
    }

    pub fn with_area(mut self, area: Option<Area>) -> Self {
        self.area = area;
        self
    }
}
