//! Bounding volume hierarchy over the polygons of a [`PolygonNavmesh`].

use glam::{U16Vec3, Vec3};

use crate::{Aabb3d, DetailNavmesh, PolygonNavmesh};

/// A node of a [`BvTree`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct BvNode {
    /// Minimum bounds of the node's AABB, quantized to cell size units relative to the mesh origin.
    pub min: U16Vec3,
    /// Maximum bounds of the node's AABB, quantized to cell size units relative to the mesh origin.
    pub max: U16Vec3,
    /// The polygon index for leaf nodes.
    /// For inner nodes, the negated number of nodes in the subtree rooted at this node.
    pub index: i32,
}

impl BvNode {
    /// Whether the node holds a polygon.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.index >= 0
    }

    #[inline]
    fn overlaps(&self, min: U16Vec3, max: U16Vec3) -> bool {
        self.min.cmple(max).all() && self.max.cmpge(min).all()
    }
}

/// A bounding volume hierarchy used to find the polygons of a navmesh overlapping a box.
///
/// The nodes are stored in depth-first order. Skipping a subtree is done by jumping over its escape offset.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct BvTree {
    nodes: Vec<BvNode>,
    aabb: Aabb3d,
    quant_factor: f32,
}

impl BvTree {
    /// Builds the tree over the polygons of `mesh`.
    ///
    /// If a detail mesh is passed, the polygon bounds include the detail surface instead of
    /// only the polygon vertices.
    pub fn new(mesh: &PolygonNavmesh, detail: Option<&DetailNavmesh>) -> Self {
        let quant_factor = 1.0 / mesh.cell_size();
        let aabb = mesh.aabb();
        let items: Vec<BvItem> = match detail {
            Some(detail) => (0..detail.meshes.len())
                .map(|i| {
                    let vertices = detail.submesh_vertices(i);
                    let (min, max) = vertices.iter().fold(
                        (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
                        |(min, max), v| (min.min(*v), max.max(*v)),
                    );
                    let quantize = |v: Vec3| {
                        ((v - aabb.min) * quant_factor)
                            .clamp(Vec3::ZERO, Vec3::splat(u16::MAX as f32))
                            .as_u16vec3()
                    };
                    BvItem {
                        min: quantize(min),
                        max: quantize(max),
                        index: i as i32,
                    }
                })
                .collect(),
            None => mesh
                .polygons()
                .enumerate()
                .map(|(i, polygon)| {
                    let (mut min, mut max) = polygon
                        .iter()
                        .map(|&index| mesh.vertices()[index as usize])
                        .fold((U16Vec3::MAX, U16Vec3::ZERO), |(min, max), v| {
                            (min.min(v), max.max(v))
                        });
                    // Remap y from cell heights to cell sizes.
                    let y_scale = mesh.cell_height() * quant_factor;
                    min.y = (min.y as f32 * y_scale).floor() as u16;
                    max.y = (max.y as f32 * y_scale).ceil() as u16;
                    BvItem {
                        min,
                        max,
                        index: i as i32,
                    }
                })
                .collect(),
        };
        Self::from_items(items, aabb, quant_factor)
    }

    fn from_items(mut items: Vec<BvItem>, aabb: Aabb3d, quant_factor: f32) -> Self {
        let mut nodes = Vec::with_capacity(items.len() * 2);
        let len = items.len();
        if len > 0 {
            subdivide(&mut items, 0, len, &mut nodes);
        }
        tracing::debug!(nodes = nodes.len(), "Built BV tree");
        Self {
            nodes,
            aabb,
            quant_factor,
        }
    }

    /// The nodes of the tree in depth-first order.
    pub fn nodes(&self) -> &[BvNode] {
        &self.nodes
    }

    /// Returns the indices of all polygons whose quantized bounds overlap the quantized box `[min, max]`.
    pub fn query(&self, min: U16Vec3, max: U16Vec3) -> Vec<usize> {
        let mut polygons = Vec::new();
        let mut current = 0;
        while let Some(node) = self.nodes.get(current) {
            let overlap = node.overlaps(min, max);
            if node.is_leaf() && overlap {
                polygons.push(node.index as usize);
            }
            if overlap || node.is_leaf() {
                current += 1;
            } else {
                current += (-node.index) as usize;
            }
        }
        polygons
    }

    /// Returns the indices of all polygons whose bounds overlap the world-space `aabb`.
    ///
    /// The box is clamped to the mesh bounds and rounded outwards to the quantization grid.
    pub fn query_aabb(&self, aabb: &Aabb3d) -> Vec<usize> {
        if !self.aabb.intersects(aabb) {
            return Vec::new();
        }
        let min = (aabb.min.clamp(self.aabb.min, self.aabb.max) - self.aabb.min) * self.quant_factor;
        let max = (aabb.max.clamp(self.aabb.min, self.aabb.max) - self.aabb.min) * self.quant_factor;
        let min = min.as_u16vec3() & U16Vec3::splat(0xfffe);
        let max = (max + 1.0).as_u16vec3() | U16Vec3::splat(1);
        self.query(min, max)
    }
}

#[derive(Debug, Clone, Copy)]
struct BvItem {
    min: U16Vec3,
    max: U16Vec3,
    index: i32,
}

fn subdivide(items: &mut [BvItem], imin: usize, imax: usize, nodes: &mut Vec<BvNode>) {
    let count = imax - imin;
    let current = nodes.len();
    nodes.push(BvNode::default());

    if count == 1 {
        // Leaf
        let item = items[imin];
        nodes[current] = BvNode {
            min: item.min,
            max: item.max,
            index: item.index,
        };
        return;
    }

    // Split
    let (min, max) = items[imin..imax]
        .iter()
        .fold((U16Vec3::MAX, U16Vec3::ZERO), |(min, max), item| {
            (min.min(item.min), max.max(item.max))
        });
    let axis = longest_axis(max - min);
    items[imin..imax].sort_by_key(|item| item.min[axis]);

    let split = imin + count / 2;
    // Left
    subdivide(items, imin, split, nodes);
    // Right
    subdivide(items, split, imax, nodes);

    let escape = (nodes.len() - current) as i32;
    nodes[current] = BvNode {
        min,
        max,
        index: -escape,
    };
}

fn longest_axis(extent: U16Vec3) -> usize {
    let mut axis = 0;
    let mut max = extent.x;
    if extent.y > max {
        axis = 1;
        max = extent.y;
    }
    if extent.z > max {
        axis = 2;
    }
    axis
}
