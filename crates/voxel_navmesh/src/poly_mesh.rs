//! Convex polygon mesh built from the simplified contours.

use std::collections::VecDeque;

use glam::{IVec2, U16Vec3};
use thiserror::Error;

use crate::{
    Aabb3d, AreaType, RegionId,
    contours::{ContourSet, RegionVertexId, intersect, intersect_prop, left, left_on},
    math::{next, prev},
};

/// A value which indicates an invalid index within a mesh.
///
/// Pads unused vertex slots of a polygon and marks edges without a neighbor.
pub const RC_MESH_NULL_IDX: u16 = 0xffff;

/// Set on a polygon neighbor to mark an edge on the tile border.
/// The low bits hold the direction of the border the edge lies on.
pub const PORTAL_EDGE: u16 = 0x8000;

/// The largest supported number of vertices per polygon.
pub const MAX_VERTICES_PER_POLYGON: usize = 12;

/// Vertex indices at and above this value are reserved.
const MAX_MESH_VERTICES: usize = 0xfffe;

/// Represents a polygon mesh suitable for use in building a navigation mesh.
///
/// All vertices are in voxel coordinates relative to [`PolygonNavmesh::aabb`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PolygonNavmesh {
    /// The mesh vertices.
    vertices: Vec<U16Vec3>,
    /// Vertex indices of each polygon. [Length: polygon count * `max_vertices_per_polygon`]
    polygons: Vec<u16>,
    /// Neighbor polygon of each polygon edge. Same layout as `polygons`.
    polygon_neighbors: Vec<u16>,
    /// The region id assigned to each polygon.
    regions: Vec<RegionId>,
    /// The user defined flags of each polygon.
    flags: Vec<u16>,
    /// The area id assigned to each polygon.
    areas: Vec<AreaType>,
    /// The maximum number of vertices per polygon
    max_vertices_per_polygon: usize,
    /// The bounding box of the mesh in world space.
    aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    cell_size: f32,
    /// The height of each cell. (The minimum increment along the y-axis.)
    cell_height: f32,
    /// The AABB border size used to generate the source data from which the mesh was derived.
    border_size: u16,
    /// The max error of the polygon edges in the mesh.
    max_edge_error: f32,
}

impl PolygonNavmesh {
    /// The mesh vertices in voxel coordinates.
    #[inline]
    pub fn vertices(&self) -> &[U16Vec3] {
        &self.vertices
    }

    /// The number of polygons in the mesh.
    #[inline]
    pub fn polygon_count(&self) -> usize {
        self.regions.len()
    }

    /// The maximum number of vertices a polygon of this mesh can have.
    #[inline]
    pub fn max_vertices_per_polygon(&self) -> usize {
        self.max_vertices_per_polygon
    }

    /// The vertex indices of polygon `index`, without padding.
    pub fn polygon(&self, index: usize) -> &[u16] {
        let nvp = self.max_vertices_per_polygon;
        let slots = &self.polygons[index * nvp..(index + 1) * nvp];
        &slots[..count_polygon_vertices(slots)]
    }

    /// The neighbor of each edge of polygon `index`.
    ///
    /// Edge `j` runs from vertex `j` to vertex `j + 1`. The value is either a polygon index,
    /// [`RC_MESH_NULL_IDX`] for a solid edge, or [`PORTAL_EDGE`] combined with a direction for
    /// an edge on the tile border.
    pub fn polygon_neighbors(&self, index: usize) -> &[u16] {
        let nvp = self.max_vertices_per_polygon;
        let vertex_count = self.polygon(index).len();
        &self.polygon_neighbors[index * nvp..index * nvp + vertex_count]
    }

    /// Iterates over the vertex indices of all polygons.
    pub fn polygons(&self) -> impl Iterator<Item = &[u16]> + '_ {
        (0..self.polygon_count()).map(|index| self.polygon(index))
    }

    /// The region polygon `index` was built from. [`RegionId::NONE`] if it spans several regions.
    #[inline]
    pub fn region(&self, index: usize) -> RegionId {
        self.regions[index]
    }

    /// The area type of polygon `index`.
    #[inline]
    pub fn area(&self, index: usize) -> AreaType {
        self.areas[index]
    }

    /// The user defined flags of polygon `index`. Zero after the build.
    #[inline]
    pub fn flags(&self, index: usize) -> u16 {
        self.flags[index]
    }

    /// Sets the user defined flags of polygon `index`.
    #[inline]
    pub fn set_flags(&mut self, index: usize, flags: u16) {
        self.flags[index] = flags;
    }

    /// The bounding box of the mesh in world space.
    #[inline]
    pub fn aabb(&self) -> Aabb3d {
        self.aabb
    }

    /// The size of each cell on the xz-plane.
    #[inline]
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// The height of each cell along the y-axis.
    #[inline]
    pub fn cell_height(&self) -> f32 {
        self.cell_height
    }

    /// The AABB border size used to generate the source data.
    #[inline]
    pub fn border_size(&self) -> u16 {
        self.border_size
    }

    /// The max error of the polygon edges in the mesh.
    #[inline]
    pub fn max_edge_error(&self) -> f32 {
        self.max_edge_error
    }

    /// Converts a vertex of the mesh to world space.
    pub fn world_vertex(&self, vertex: U16Vec3) -> glam::Vec3 {
        self.aabb.min
            + vertex.as_vec3() * glam::Vec3::new(self.cell_size, self.cell_height, self.cell_size)
    }
}

impl ContourSet {
    /// Builds a polygon mesh from the provided contours.
    ///
    /// Each contour is triangulated, its vertices are welded with those of the other contours
    /// and the triangles are greedily merged into convex polygons with at most
    /// `max_vertices_per_polygon` vertices. Vertices on the tile border are removed afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_vertices_per_polygon` is not within `3..=12`, or if the
    /// mesh would have more vertices or polygons than 16 bit indices can address.
    pub fn into_polygon_mesh(
        self,
        max_vertices_per_polygon: usize,
    ) -> Result<PolygonNavmesh, PolygonMeshError> {
        let nvp = max_vertices_per_polygon;
        if !(3..=MAX_VERTICES_PER_POLYGON).contains(&nvp) {
            return Err(PolygonMeshError::InvalidVerticesPerPolygon { got: nvp });
        }

        let contours = || self.contours.iter().filter(|contour| contour.vertices.len() >= 3);
        let max_vertices: usize = contours().map(|contour| contour.vertices.len()).sum();
        let max_polygons: usize = contours().map(|contour| contour.vertices.len() - 2).sum();
        if max_vertices >= MAX_MESH_VERTICES {
            return Err(PolygonMeshError::TooManyVertices {
                count: max_vertices,
            });
        }

        let mut mesh = PolygonNavmesh {
            vertices: Vec::with_capacity(max_vertices),
            polygons: Vec::with_capacity(max_polygons * nvp),
            polygon_neighbors: Vec::new(),
            regions: Vec::with_capacity(max_polygons),
            flags: Vec::new(),
            areas: Vec::with_capacity(max_polygons),
            max_vertices_per_polygon: nvp,
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            border_size: self.border_size,
            max_edge_error: self.max_error,
        };

        let mut border_vertices = Vec::with_capacity(max_vertices);
        let mut buckets = VertexBuckets::new(max_vertices);
        let mut indices = Vec::new();
        let mut triangles = Vec::new();
        let mut polygons = Vec::new();

        for contour in contours() {
            let points: Vec<IVec2> = contour.vertices.iter().map(|(v, _)| xz(*v)).collect();
            indices.clear();
            indices.extend(0..points.len() as u32);
            if !triangulate(&points, &mut indices, &mut triangles) {
                // Keep the triangles found so far.
                tracing::warn!(region = contour.region.bits(), "Bad triangulation of contour");
            }

            // Add and merge vertices.
            let mesh_indices: Vec<u16> = contour
                .vertices
                .iter()
                .map(|(vertex, flags)| {
                    let index = buckets.add_vertex(*vertex, &mut mesh.vertices);
                    border_vertices.resize(mesh.vertices.len(), false);
                    if flags.contains(RegionVertexId::BORDER_VERTEX) {
                        border_vertices[index as usize] = true;
                    }
                    index
                })
                .collect();

            // Build initial polygons.
            polygons.clear();
            for triangle in &triangles {
                let [a, b, c] = triangle.map(|i| mesh_indices[i as usize]);
                if a != b && a != c && b != c {
                    polygons.extend([a, b, c]);
                    polygons.resize(polygons.len() + nvp - 3, RC_MESH_NULL_IDX);
                }
            }
            if polygons.is_empty() {
                continue;
            }

            // Merge polygons.
            if nvp > 3 {
                merge_convex_polygons(&mut polygons, nvp, &mesh.vertices, |_, _| {});
            }

            // Store polygons.
            let polygon_count = polygons.len() / nvp;
            mesh.polygons.extend_from_slice(&polygons);
            mesh.regions.extend(std::iter::repeat_n(contour.region, polygon_count));
            mesh.areas.extend(std::iter::repeat_n(contour.area, polygon_count));
            if mesh.polygon_count() > max_polygons {
                return Err(PolygonMeshError::TooManyPolygons {
                    count: mesh.polygon_count(),
                    max: max_polygons,
                });
            }
        }

        // Remove edge vertices.
        let mut i = 0;
        while i < mesh.vertices.len() {
            if border_vertices[i] && mesh.can_remove_vertex(i as u16) {
                mesh.remove_vertex(i as u16, max_polygons)?;
                // The next vertex moved into slot i.
                border_vertices.remove(i);
                continue;
            }
            i += 1;
        }

        // Calculate adjacency.
        mesh.polygon_neighbors = build_mesh_adjacency(&mesh.polygons, mesh.vertices.len(), nvp);

        // Find portal edges
        if mesh.border_size > 0 {
            mesh.mark_portal_edges(self.width, self.height);
        }

        // Just allocate the mesh flags array. The user is responsible to fill it.
        mesh.flags = vec![0; mesh.polygon_count()];

        if mesh.vertices.len() > RC_MESH_NULL_IDX as usize {
            return Err(PolygonMeshError::TooManyVertices {
                count: mesh.vertices.len(),
            });
        }
        if mesh.polygon_count() > RC_MESH_NULL_IDX as usize {
            return Err(PolygonMeshError::TooManyPolygons {
                count: mesh.polygon_count(),
                max: RC_MESH_NULL_IDX as usize,
            });
        }

        tracing::debug!(
            vertices = mesh.vertices.len(),
            polygons = mesh.polygon_count(),
            "Built polygon mesh"
        );
        Ok(mesh)
    }
}

impl PolygonNavmesh {
    fn can_remove_vertex(&self, rem: u16) -> bool {
        // Count number of polygons to remove.
        let mut touched_vertices = 0;
        let mut remaining_edges = 0;
        for polygon in self.polygons() {
            let removed = polygon.iter().filter(|&&v| v == rem).count();
            if removed > 0 {
                touched_vertices += removed;
                remaining_edges += polygon.len() - (removed + 1);
            }
        }

        // There would be too few edges remaining to create a polygon.
        // This can happen for example when a tip of a triangle is marked
        // as deletion, but there are no other polys that share the vertex.
        // In this case, the vertex should not be removed.
        if remaining_edges <= 2 {
            return false;
        }

        // Find edges which share the removed vertex, keyed by their other vertex.
        let mut edges: Vec<(u16, u32)> = Vec::with_capacity(touched_vertices * 2);
        for polygon in self.polygons() {
            let nv = polygon.len();
            for j in 0..nv {
                let k = prev(j, nv);
                if polygon[j] != rem && polygon[k] != rem {
                    continue;
                }
                let other = if polygon[k] == rem { polygon[j] } else { polygon[k] };
                match edges.iter_mut().find(|(vertex, _)| *vertex == other) {
                    // Exists, increment vertex share count.
                    Some((_, share_count)) => *share_count += 1,
                    None => edges.push((other, 1)),
                }
            }
        }

        // There should be no more than 2 open edges.
        // This catches the case that two non-adjacent polygons
        // share the removed vertex. In that case, do not remove the vertex.
        let open_edges = edges.iter().filter(|(_, share_count)| *share_count < 2).count();
        open_edges <= 2
    }

    fn remove_vertex(&mut self, rem: u16, max_polygons: usize) -> Result<(), PolygonMeshError> {
        let nvp = self.max_vertices_per_polygon;

        // Collect the edges of the touched polygons which do not touch the removed vertex,
        // as (start, end, region, area).
        let mut edges: Vec<(u16, u16, RegionId, AreaType)> = Vec::new();
        let mut i = 0;
        while i < self.polygon_count() {
            let polygon = self.polygon(i);
            if !polygon.contains(&rem) {
                i += 1;
                continue;
            }
            let nv = polygon.len();
            for j in 0..nv {
                let k = prev(j, nv);
                if polygon[j] != rem && polygon[k] != rem {
                    edges.push((polygon[k], polygon[j], self.regions[i], self.areas[i]));
                }
            }
            // Remove the polygon.
            swap_remove_polygon(&mut self.polygons, i, nvp);
            self.regions.swap_remove(i);
            self.areas.swap_remove(i);
        }

        // Remove vertex.
        self.vertices.remove(rem as usize);

        // Adjust indices to match the removed vertex layout.
        for index in &mut self.polygons {
            if *index != RC_MESH_NULL_IDX && *index > rem {
                *index -= 1;
            }
        }
        for (start, end, _, _) in &mut edges {
            if *start > rem {
                *start -= 1;
            }
            if *end > rem {
                *end -= 1;
            }
        }

        let Some(&(first, _, region, area)) = edges.first() else {
            return Ok(());
        };

        // Start with one vertex, keep appending connected
        // segments to the start and end of the hole.
        let mut hole = VecDeque::with_capacity(edges.len() + 1);
        hole.push_back((first, region, area));
        while !edges.is_empty() {
            let mut matched = false;
            let mut i = 0;
            while i < edges.len() {
                let (start, end, region, area) = edges[i];
                let added = if hole.front().is_some_and(|&(vertex, _, _)| vertex == end) {
                    // The segment matches the beginning of the hole boundary.
                    hole.push_front((start, region, area));
                    true
                } else if hole.back().is_some_and(|&(vertex, _, _)| vertex == start) {
                    // The segment matches the end of the hole boundary.
                    hole.push_back((end, region, area));
                    true
                } else {
                    false
                };
                if added {
                    // The edge segment was added, remove it.
                    edges.swap_remove(i);
                    matched = true;
                } else {
                    i += 1;
                }
            }
            if !matched {
                break;
            }
        }

        // Triangulate the hole.
        let points: Vec<IVec2> = hole
            .iter()
            .map(|&(vertex, _, _)| xz(self.vertices[vertex as usize]))
            .collect();
        let mut indices: Vec<u32> = (0..points.len() as u32).collect();
        let mut triangles = Vec::new();
        if !triangulate(&points, &mut indices, &mut triangles) {
            tracing::warn!(vertex = rem, "Bad triangulation while removing a tile border vertex");
        }

        // Merge the hole triangles back to polygons.
        let mut polygons = Vec::with_capacity(triangles.len() * nvp);
        let mut polygon_regions = Vec::with_capacity(triangles.len());
        let mut polygon_areas = Vec::with_capacity(triangles.len());
        for triangle in &triangles {
            let [a, b, c] = triangle.map(|i| hole[i as usize]);
            if a.0 == b.0 || a.0 == c.0 || b.0 == c.0 {
                continue;
            }
            polygons.extend([a.0, b.0, c.0]);
            polygons.resize(polygons.len() + nvp - 3, RC_MESH_NULL_IDX);
            // If this polygon covers multiple region types then mark it as such
            let region = if a.1 != b.1 || b.1 != c.1 {
                RegionId::NONE
            } else {
                a.1
            };
            polygon_regions.push(region);
            polygon_areas.push(a.2);
        }
        if polygons.is_empty() {
            return Ok(());
        }

        // Merge polygons.
        if nvp > 3 {
            merge_convex_polygons(&mut polygons, nvp, &self.vertices, |pa, pb| {
                if polygon_regions[pa] != polygon_regions[pb] {
                    polygon_regions[pa] = RegionId::NONE;
                }
                polygon_regions.swap_remove(pb);
                polygon_areas.swap_remove(pb);
            });
        }

        // Store polygons.
        let added = polygons.len() / nvp;
        if self.polygon_count() + added > max_polygons {
            return Err(PolygonMeshError::TooManyPolygons {
                count: self.polygon_count() + added,
                max: max_polygons,
            });
        }
        self.polygons.extend_from_slice(&polygons);
        self.regions.extend(polygon_regions);
        self.areas.extend(polygon_areas);
        Ok(())
    }

    fn mark_portal_edges(&mut self, width: u16, height: u16) {
        let nvp = self.max_vertices_per_polygon;
        for i in 0..self.polygon_count() {
            let vertex_count = self.polygon(i).len();
            for j in 0..vertex_count {
                // Skip connected edges.
                if self.polygon_neighbors[i * nvp + j] != RC_MESH_NULL_IDX {
                    continue;
                }
                let va = self.vertices[self.polygons[i * nvp + j] as usize];
                let vb = self.vertices[self.polygons[i * nvp + next(j, vertex_count)] as usize];

                let dir = if va.x == 0 && vb.x == 0 {
                    0
                } else if va.z == height && vb.z == height {
                    1
                } else if va.x == width && vb.x == width {
                    2
                } else if va.z == 0 && vb.z == 0 {
                    3
                } else {
                    continue;
                };
                self.polygon_neighbors[i * nvp + j] = PORTAL_EDGE | dir;
            }
        }
    }
}

/// Spatial hash used to weld vertices that share x and z and are close in y.
struct VertexBuckets {
    first: Vec<Option<u16>>,
    next: Vec<Option<u16>>,
}

impl VertexBuckets {
    const BUCKET_COUNT: usize = 1 << 12;

    fn new(capacity: usize) -> Self {
        Self {
            first: vec![None; Self::BUCKET_COUNT],
            next: Vec::with_capacity(capacity),
        }
    }

    fn bucket(vertex: U16Vec3) -> usize {
        const H1: u32 = 0x8da6b343; // Large multiplicative constants;
        const H3: u32 = 0xcb1ab31f; // here arbitrarily chosen primes
        let n = H1
            .wrapping_mul(vertex.x as u32)
            .wrapping_add(H3.wrapping_mul(vertex.z as u32));
        n as usize & (Self::BUCKET_COUNT - 1)
    }

    fn add_vertex(&mut self, vertex: U16Vec3, vertices: &mut Vec<U16Vec3>) -> u16 {
        let bucket = Self::bucket(vertex);
        let mut current = self.first[bucket];
        while let Some(i) = current {
            let existing = vertices[i as usize];
            if existing.x == vertex.x
                && existing.z == vertex.z
                && existing.y.abs_diff(vertex.y) <= 2
            {
                return i;
            }
            current = self.next[i as usize];
        }

        // Could not find, create new.
        let i = vertices.len() as u16;
        vertices.push(vertex);
        self.next.push(self.first[bucket]);
        self.first[bucket] = Some(i);
        i
    }
}

#[inline]
fn xz(vertex: U16Vec3) -> IVec2 {
    IVec2::new(vertex.x as i32, vertex.z as i32)
}

fn count_polygon_vertices(polygon: &[u16]) -> usize {
    polygon
        .iter()
        .position(|&index| index == RC_MESH_NULL_IDX)
        .unwrap_or(polygon.len())
}

/// Moves the last polygon of the flat array into slot `index`.
fn swap_remove_polygon(polygons: &mut Vec<u16>, index: usize, nvp: usize) {
    let last = polygons.len() / nvp - 1;
    if index != last {
        polygons.copy_within(last * nvp..(last + 1) * nvp, index * nvp);
    }
    polygons.truncate(last * nvp);
}

/// Set on an index in [`triangulate`] when the vertex is the tip of an ear.
const EAR_TIP: u32 = 0x8000_0000;
const INDEX_MASK: u32 = 0x0fff_ffff;

/// Ear clipping triangulation of a simple polygon, always cutting the ear with the
/// shortest diagonal first.
///
/// Returns `false` if the polygon could not be fully triangulated, in which case
/// `triangles` holds the triangles found until then.
fn triangulate(points: &[IVec2], indices: &mut Vec<u32>, triangles: &mut Vec<[u32; 3]>) -> bool {
    triangles.clear();
    let point = |indices: &[u32], i: usize| points[(indices[i] & INDEX_MASK) as usize];

    // The last bit of the index is used to indicate if the vertex can be removed.
    let n = indices.len();
    for i in 0..n {
        let i1 = next(i, n);
        let i2 = next(i1, n);
        if diagonal(i, i2, points, indices) {
            indices[i1] |= EAR_TIP;
        }
    }

    while indices.len() > 3 {
        let n = indices.len();
        let mut best: Option<(i32, usize)> = None;
        for i in 0..n {
            let i1 = next(i, n);
            if indices[i1] & EAR_TIP != 0 {
                let len = (point(indices, next(i1, n)) - point(indices, i)).length_squared();
                if best.is_none_or(|(min_len, _)| len < min_len) {
                    best = Some((len, i));
                }
            }
        }

        if best.is_none() {
            // We might get here because the contour has overlapping segments, like this:
            //
            //  A o-o=====o---o B
            //   /  |C   D|    \.
            //  o   o     o     o
            //  :   :     :     :
            // We'll try to recover by loosing up the inCone test a bit so that a diagonal
            // like 'C-D' is accepted.
            for i in 0..n {
                let i1 = next(i, n);
                let i2 = next(i1, n);
                if diagonal_loose(i, i2, points, indices) {
                    let len = (point(indices, i2) - point(indices, i)).length_squared();
                    if best.is_none_or(|(min_len, _)| len < min_len) {
                        best = Some((len, i));
                    }
                }
            }
        }
        let Some((_, i)) = best else {
            // The contour is messed up. This sometimes happens
            // if the contour simplification is too aggressive.
            return false;
        };

        let i1 = next(i, n);
        let i2 = next(i1, n);
        triangles.push([indices[i], indices[i1], indices[i2]].map(|index| index & INDEX_MASK));

        // Removes P[i1] by shifting the rest left one index.
        indices.remove(i1);
        let n = indices.len();
        let i1 = if i1 >= n { 0 } else { i1 };
        let i = prev(i1, n);

        // Update diagonal flags.
        if diagonal(prev(i, n), i1, points, indices) {
            indices[i] |= EAR_TIP;
        } else {
            indices[i] &= INDEX_MASK;
        }
        if diagonal(i, next(i1, n), points, indices) {
            indices[i1] |= EAR_TIP;
        } else {
            indices[i1] &= INDEX_MASK;
        }
    }

    // Append the remaining triangle.
    if let [a, b, c] = indices[..] {
        triangles.push([a, b, c].map(|index| index & INDEX_MASK));
    }
    true
}

/// Returns true iff the diagonal (i,j) is strictly internal to the
/// polygon in the neighborhood of the i endpoint.
fn in_cone(i: usize, j: usize, points: &[IVec2], indices: &[u32], loose: bool) -> bool {
    let n = indices.len();
    let point = |i: usize| points[(indices[i] & INDEX_MASK) as usize];
    let pi = point(i);
    let pj = point(j);
    let pi1 = point(next(i, n));
    let pin1 = point(prev(i, n));

    // If P[i] is a convex vertex [ i+1 left or on (i-1,i) ].
    if left_on(pin1, pi, pi1) {
        return if loose {
            left_on(pi, pj, pin1) && left_on(pj, pi, pi1)
        } else {
            left(pi, pj, pin1) && left(pj, pi, pi1)
        };
    }
    // Assume (i-1,i,i+1) not collinear.
    // else P[i] is reflex.
    !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
}

/// Returns true iff (v_i, v_j) is a proper internal *or* external
/// diagonal of P, *ignoring edges incident to v_i and v_j*.
fn diagonalie(i: usize, j: usize, points: &[IVec2], indices: &[u32], loose: bool) -> bool {
    let n = indices.len();
    let point = |i: usize| points[(indices[i] & INDEX_MASK) as usize];
    let d0 = point(i);
    let d1 = point(j);

    // For each edge (k,k+1) of P
    (0..n).all(|k| {
        let k1 = next(k, n);
        // Skip edges incident to i or j
        if k == i || k1 == i || k == j || k1 == j {
            return true;
        }
        let p0 = point(k);
        let p1 = point(k1);
        if d0 == p0 || d1 == p0 || d0 == p1 || d1 == p1 {
            return true;
        }
        if loose {
            !intersect_prop(d0, d1, p0, p1)
        } else {
            !intersect(d0, d1, p0, p1)
        }
    })
}

/// Returns true iff (v_i, v_j) is a proper internal diagonal of P.
fn diagonal(i: usize, j: usize, points: &[IVec2], indices: &[u32]) -> bool {
    in_cone(i, j, points, indices, false) && diagonalie(i, j, points, indices, false)
}

fn diagonal_loose(i: usize, j: usize, points: &[IVec2], indices: &[u32]) -> bool {
    in_cone(i, j, points, indices, true) && diagonalie(i, j, points, indices, true)
}

#[inline]
fn uleft(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    let (a, b, c) = (xz(a), xz(b), xz(c));
    (b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y) < 0
}

/// Returns the squared length of the edge shared by `pa` and `pb` and the index of that edge in
/// both polygons, or `None` if the polygons cannot be merged into a convex polygon.
fn get_polygon_merge_value(
    pa: &[u16],
    pb: &[u16],
    vertices: &[U16Vec3],
    nvp: usize,
) -> Option<(i32, usize, usize)> {
    let na = count_polygon_vertices(pa);
    let nb = count_polygon_vertices(pb);

    // If the merged polygon would be too big, do not merge.
    if na + nb - 2 > nvp {
        return None;
    }

    // Check if the polygons share an edge.
    let sorted_edge = |polygon: &[u16], n: usize, i: usize| {
        let (v0, v1) = (polygon[i], polygon[next(i, n)]);
        if v0 > v1 { (v1, v0) } else { (v0, v1) }
    };
    let (ea, eb) = (0..na).find_map(|i| {
        let edge = sorted_edge(pa, na, i);
        (0..nb)
            .find(|&j| sorted_edge(pb, nb, j) == edge)
            .map(|j| (i, j))
    })?;

    // Check to see if the merged polygon would be convex.
    let vertex = |index: u16| vertices[index as usize];
    let va = vertex(pa[(ea + na - 1) % na]);
    let vb = vertex(pa[ea]);
    let vc = vertex(pb[(eb + 2) % nb]);
    if !uleft(va, vb, vc) {
        return None;
    }

    let va = vertex(pb[(eb + nb - 1) % nb]);
    let vb = vertex(pb[eb]);
    let vc = vertex(pa[(ea + 2) % na]);
    if !uleft(va, vb, vc) {
        return None;
    }

    let delta = xz(vertex(pa[ea])) - xz(vertex(pa[next(ea, na)]));
    Some((delta.length_squared(), ea, eb))
}

/// Greedily merges the polygon pair with the longest shared edge until no pair can be merged.
///
/// `on_merge(pa, pb)` is called before polygon `pb` is merged into `pa` and replaced by the last
/// polygon, so that per polygon data can be kept in sync.
fn merge_convex_polygons(
    polygons: &mut Vec<u16>,
    nvp: usize,
    vertices: &[U16Vec3],
    mut on_merge: impl FnMut(usize, usize),
) {
    loop {
        // Find best polygons to merge.
        let polygon_count = polygons.len() / nvp;
        let mut best: Option<(i32, usize, usize, usize, usize)> = None;
        for j in 0..polygon_count.saturating_sub(1) {
            let pj = &polygons[j * nvp..(j + 1) * nvp];
            for k in j + 1..polygon_count {
                let pk = &polygons[k * nvp..(k + 1) * nvp];
                let Some((value, ea, eb)) = get_polygon_merge_value(pj, pk, vertices, nvp) else {
                    continue;
                };
                if best.is_none_or(|(best_value, ..)| value > best_value) {
                    best = Some((value, j, k, ea, eb));
                }
            }
        }

        let Some((_, pa, pb, ea, eb)) = best else {
            // Could not merge any polygons, stop.
            break;
        };
        // Found best, merge.
        merge_polygon_vertices(polygons, pa, pb, ea, eb, nvp);
        on_merge(pa, pb);
        swap_remove_polygon(polygons, pb, nvp);
    }
}

fn merge_polygon_vertices(
    polygons: &mut [u16],
    pa: usize,
    pb: usize,
    ea: usize,
    eb: usize,
    nvp: usize,
) {
    let a = &polygons[pa * nvp..(pa + 1) * nvp];
    let b = &polygons[pb * nvp..(pb + 1) * nvp];
    let na = count_polygon_vertices(a);
    let nb = count_polygon_vertices(b);

    let mut merged = Vec::with_capacity(nvp);
    // Add pa
    merged.extend((0..na - 1).map(|i| a[(ea + 1 + i) % na]));
    // Add pb
    merged.extend((0..nb - 1).map(|i| b[(eb + 1 + i) % nb]));
    merged.resize(nvp, RC_MESH_NULL_IDX);

    polygons[pa * nvp..(pa + 1) * nvp].copy_from_slice(&merged);
}

struct Edge {
    vertices: [u16; 2],
    polygons: [u16; 2],
    polygon_edges: [u16; 2],
}

/// Links every polygon edge to the other polygon sharing both of its vertices.
fn build_mesh_adjacency(polygons: &[u16], vertex_count: usize, nvp: usize) -> Vec<u16> {
    let mut neighbors = vec![RC_MESH_NULL_IDX; polygons.len()];
    let mut first_edge: Vec<Option<usize>> = vec![None; vertex_count];
    let mut next_edge: Vec<Option<usize>> = Vec::new();
    let mut edges: Vec<Edge> = Vec::new();

    for (i, polygon) in polygons.chunks_exact(nvp).enumerate() {
        let nv = count_polygon_vertices(polygon);
        for j in 0..nv {
            let v0 = polygon[j];
            let v1 = polygon[next(j, nv)];
            if v0 < v1 {
                edges.push(Edge {
                    vertices: [v0, v1],
                    polygons: [i as u16; 2],
                    polygon_edges: [j as u16, 0],
                });
                // Insert edge
                next_edge.push(first_edge[v0 as usize]);
                first_edge[v0 as usize] = Some(edges.len() - 1);
            }
        }
    }

    for (i, polygon) in polygons.chunks_exact(nvp).enumerate() {
        let nv = count_polygon_vertices(polygon);
        for j in 0..nv {
            let v0 = polygon[j];
            let v1 = polygon[next(j, nv)];
            if v0 <= v1 {
                continue;
            }
            let mut current = first_edge[v1 as usize];
            while let Some(e) = current {
                let edge = &mut edges[e];
                if edge.vertices[1] == v0 && edge.polygons[0] == edge.polygons[1] {
                    edge.polygons[1] = i as u16;
                    edge.polygon_edges[1] = j as u16;
                    break;
                }
                current = next_edge[e];
            }
        }
    }

    // Store adjacency
    for edge in &edges {
        if edge.polygons[0] != edge.polygons[1] {
            let [p0, p1] = edge.polygons.map(|p| p as usize);
            let [e0, e1] = edge.polygon_edges.map(|e| e as usize);
            neighbors[p0 * nvp + e0] = edge.polygons[1];
            neighbors[p1 * nvp + e1] = edge.polygons[0];
        }
    }
    neighbors
}

/// Errors that can occur when building a [`PolygonNavmesh`] with [`ContourSet::into_polygon_mesh`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolygonMeshError {
    /// The requested polygon size is not supported.
    #[error(
        "Vertices per polygon must be between 3 and {max}, got {got}",
        max = MAX_VERTICES_PER_POLYGON
    )]
    InvalidVerticesPerPolygon {
        /// The requested number of vertices per polygon.
        got: usize,
    },
    /// The mesh has more vertices than a 16 bit index can address.
    #[error("Too many vertices, got {count} but at most {max} are supported", max = MAX_MESH_VERTICES)]
    TooManyVertices {
        /// The number of vertices the mesh would have.
        count: usize,
    },
    /// The mesh has more polygons than were allocated for it.
    #[error("Too many polygons, got {count} but at most {max} are supported")]
    TooManyPolygons {
        /// The number of polygons the mesh would have.
        count: usize,
        /// The maximum number of polygons.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use crate::Contour;

    use super::*;

    fn contour(region: u16, points: &[(u16, u16, u16)]) -> Contour {
        let vertices: Vec<_> = points
            .iter()
            .map(|&(x, y, z)| (U16Vec3::new(x, y, z), RegionVertexId::NONE))
            .collect();
        Contour {
            raw_vertices: vertices.clone(),
            vertices,
            region: RegionId::from(region),
            area: AreaType::DEFAULT_WALKABLE,
        }
    }

    fn contour_set(contours: Vec<Contour>) -> ContourSet {
        ContourSet {
            contours,
            aabb: Aabb3d::new([0.0, 0.0, 0.0], [16.0, 4.0, 16.0]),
            cell_size: 1.0,
            cell_height: 1.0,
            width: 16,
            height: 16,
            border_size: 0,
            max_error: 1.3,
        }
    }

    fn square(region: u16, x: u16, y: u16) -> Contour {
        contour(region, &[(x, y, 0), (x, y, 4), (x + 4, y, 4), (x + 4, y, 0)])
    }

    fn assert_symmetric(mesh: &PolygonNavmesh) {
        for i in 0..mesh.polygon_count() {
            for &neighbor in mesh.polygon_neighbors(i) {
                if neighbor & PORTAL_EDGE != 0 {
                    continue;
                }
                assert!(
                    mesh.polygon_neighbors(neighbor as usize).contains(&(i as u16)),
                    "polygon {i} lists {neighbor} as neighbor but not vice versa"
                );
            }
        }
    }

    #[test]
    fn square_merges_into_single_quad() {
        let mesh = contour_set(vec![square(1, 0, 0)]).into_polygon_mesh(6).unwrap();
        assert_eq!(mesh.vertices().len(), 4);
        assert_eq!(mesh.polygon_count(), 1);
        assert_eq!(mesh.polygon(0).len(), 4);
        assert!(mesh.polygon_neighbors(0).iter().all(|&n| n == RC_MESH_NULL_IDX));
        assert_eq!(mesh.region(0), RegionId::from(1));
        assert_eq!(mesh.area(0), AreaType::DEFAULT_WALKABLE);
        assert_eq!(mesh.flags(0), 0);
    }

    #[test]
    fn triangles_only_with_three_vertices_per_polygon() {
        let mesh = contour_set(vec![square(1, 0, 0)]).into_polygon_mesh(3).unwrap();
        assert_eq!(mesh.polygon_count(), 2);
        assert_eq!(mesh.polygon_neighbors(0).iter().filter(|&&n| n == 1).count(), 1);
        assert_eq!(mesh.polygon_neighbors(1).iter().filter(|&&n| n == 0).count(), 1);
        assert_symmetric(&mesh);
    }

    #[test]
    fn concave_contour_is_split_into_convex_polygons() {
        let l_shape = contour(1, &[(0, 0, 0), (0, 0, 8), (4, 0, 8), (4, 0, 4), (8, 0, 4), (8, 0, 0)]);
        let mesh = contour_set(vec![l_shape]).into_polygon_mesh(6).unwrap();
        assert_eq!(mesh.polygon_count(), 2);
        for polygon in mesh.polygons() {
            assert!((3..=6).contains(&polygon.len()));
            let n = polygon.len();
            for i in 0..n {
                let [a, b, c] = [i, next(i, n), next(next(i, n), n)]
                    .map(|j| mesh.vertices()[polygon[j] as usize]);
                assert!(uleft(a, b, c), "polygon {polygon:?} is not convex");
            }
        }
        assert_symmetric(&mesh);
    }

    #[test]
    fn adjacent_contours_share_welded_vertices() {
        let mesh = contour_set(vec![square(1, 0, 0), square(2, 4, 0)])
            .into_polygon_mesh(6)
            .unwrap();
        assert_eq!(mesh.vertices().len(), 6);
        assert_eq!(mesh.polygon_count(), 2);
        assert!(mesh.polygon_neighbors(0).contains(&1));
        assert!(mesh.polygon_neighbors(1).contains(&0));
        assert_symmetric(&mesh);
    }

    #[test]
    fn welding_tolerates_two_voxels_of_height() {
        let mesh = contour_set(vec![square(1, 0, 0), square(2, 4, 2)])
            .into_polygon_mesh(6)
            .unwrap();
        assert_eq!(mesh.vertices().len(), 6);

        let mesh = contour_set(vec![square(1, 0, 0), square(2, 4, 3)])
            .into_polygon_mesh(6)
            .unwrap();
        assert_eq!(mesh.vertices().len(), 8);
        assert!(mesh.polygon_neighbors(0).iter().all(|&n| n == RC_MESH_NULL_IDX));
    }

    #[test]
    fn tile_border_vertices_are_removed() {
        let mut pentagon = contour(1, &[(0, 0, 0), (0, 0, 2), (0, 0, 4), (4, 0, 4), (4, 0, 0)]);
        pentagon.vertices[1].1 = RegionVertexId::BORDER_VERTEX;
        let mesh = contour_set(vec![pentagon]).into_polygon_mesh(6).unwrap();
        assert_eq!(mesh.vertices().len(), 4);
        assert!(!mesh.vertices().contains(&U16Vec3::new(0, 0, 2)));
        assert!(mesh.polygon_count() >= 1);
        for polygon in mesh.polygons() {
            assert!(polygon.iter().all(|&v| (v as usize) < mesh.vertices().len()));
        }
        assert_symmetric(&mesh);
    }

    #[test]
    fn edges_on_the_tile_border_become_portals() {
        let mut cset = contour_set(vec![square(1, 0, 0)]);
        cset.width = 4;
        cset.height = 4;
        cset.border_size = 1;
        let mesh = cset.into_polygon_mesh(6).unwrap();
        let mut neighbors = mesh.polygon_neighbors(0).to_vec();
        neighbors.sort();
        assert_eq!(
            neighbors,
            vec![PORTAL_EDGE, PORTAL_EDGE | 1, PORTAL_EDGE | 2, PORTAL_EDGE | 3]
        );
    }

    #[test]
    fn rejects_unsupported_polygon_sizes() {
        for nvp in [0, 2, 13] {
            assert_eq!(
                contour_set(vec![square(1, 0, 0)]).into_polygon_mesh(nvp),
                Err(PolygonMeshError::InvalidVerticesPerPolygon { got: nvp })
            );
        }
        assert!(contour_set(vec![square(1, 0, 0)]).into_polygon_mesh(12).is_ok());
    }

    #[test]
    fn ear_clipping_covers_polygon_with_collinear_vertices() {
        let points = [
            IVec2::new(0, 0),
            IVec2::new(0, 2),
            IVec2::new(10, 2),
            IVec2::new(20, 2),
            IVec2::new(20, 0),
            IVec2::new(10, 0),
        ];
        let mut indices: Vec<u32> = (0..points.len() as u32).collect();
        let mut triangles = Vec::new();
        assert!(triangulate(&points, &mut indices, &mut triangles));
        assert_eq!(triangles.len(), 4);
        let doubled_area: i32 = triangles
            .iter()
            .map(|triangle| {
                let [a, b, c] = triangle.map(|i| points[i as usize]);
                crate::contours::area2(a, b, c).abs()
            })
            .sum();
        assert_eq!(doubled_area, 2 * 20 * 2);
    }

    #[test]
    fn vertex_buckets_weld_close_vertices() {
        let mut buckets = VertexBuckets::new(4);
        let mut vertices = Vec::new();
        let a = buckets.add_vertex(U16Vec3::new(3, 10, 7), &mut vertices);
        let b = buckets.add_vertex(U16Vec3::new(3, 12, 7), &mut vertices);
        let c = buckets.add_vertex(U16Vec3::new(3, 13, 7), &mut vertices);
        let d = buckets.add_vertex(U16Vec3::new(4, 10, 7), &mut vertices);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(vertices.len(), 3);
    }
}
