//! The triangle soup fed into [`Heightfield`](crate::Heightfield) rasterization.

use glam::{UVec3, Vec3A};

use crate::{
    math::{Aabb3d, TriangleIndices as _},
    span::AreaType,
};

/// A mesh used as input for [`Heightfield`](crate::Heightfield) rasterization.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TriMesh {
    /// The vertices of the level geometry.
    /// Follows the convention of a triangle list.
    pub vertices: Vec<Vec3A>,

    /// The indices of the level geometry.
    /// Follows the convention of a triangle list.
    pub indices: Vec<UVec3>,

    /// The area types of the trimesh. Each index corresponds 1:1 to the [`TriMesh::indices`].
    pub area_types: Vec<AreaType>,
}

impl TriMesh {
    /// Extends the trimesh with the vertices and indices of another trimesh.
    /// The indices of `other` will be offset by the number of vertices in `self`.
    ///
    /// Returns `false` and leaves `self` untouched if the combined mesh would need
    /// vertex indices beyond `u32::MAX`.
    pub fn extend(&mut self, other: TriMesh) -> bool {
        let Ok(next_vertex_index) = u32::try_from(self.vertices.len()) else {
            return false;
        };
        if u32::try_from(self.vertices.len() + other.vertices.len()).is_err() {
            return false;
        }
        self.vertices.extend(other.vertices);
        self.indices
            .extend(other.indices.iter().map(|i| i + next_vertex_index));
        self.area_types.extend(other.area_types);
        true
    }

    /// Computes the AABB of the trimesh.
    /// Returns `None` if the trimesh is empty.
    pub fn compute_aabb(&self) -> Option<Aabb3d> {
        Aabb3d::from_verts(&self.vertices)
    }

    /// Marks the triangles as walkable or not based on the threshold angle.
    ///
    /// A triangle whose normal is closer to straight up than `threshold_rad` becomes
    /// [`AreaType::DEFAULT_WALKABLE`]. Other triangles keep their area type.
    /// Triangles with out of range indices are left alone; rasterization reports them.
    pub fn mark_walkable_triangles(&mut self, threshold_rad: f32) {
        let threshold_cos = threshold_rad.cos();
        for (indices, area) in self.indices.iter().zip(self.area_types.iter_mut()) {
            let Some(normal) = indices.normal(&self.vertices) else {
                continue;
            };
            if normal.y > threshold_cos {
                *area = AreaType::DEFAULT_WALKABLE;
            }
        }
    }
}
