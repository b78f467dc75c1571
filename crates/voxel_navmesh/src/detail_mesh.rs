use std::collections::VecDeque;

use glam::{U16Vec3, Vec2, Vec3, Vec3A, Vec3Swizzles as _};
use thiserror::Error;

use crate::{
    CompactHeightfield, PolygonNavmesh, RegionId,
    math::{
        dir_offset, dir_offset_x, dir_offset_z, distance_squared_between_point_and_line_vec3,
        distance_squared_between_point_and_line_xz, next, prev,
    },
};

/// Marks a detail triangle edge that lies on the boundary of its polygon.
///
/// The flags of edge `k` of a triangle are stored at bit `k * 2`.
pub const DETAIL_EDGE_BOUNDARY: u8 = 0x1;

const MAX_VERTS: usize = 127;
// Max tris for delaunay is 2n-2-k (n=num verts, k=num hull verts).
const MAX_TRIS: usize = 255;
const MAX_VERTS_PER_EDGE: usize = 32;

const RC_UNSET_HEIGHT: u16 = 0xffff;

/// Contains triangle meshes that represent detailed height data associated
/// with the polygons in its associated polygon mesh object.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DetailNavmesh {
    /// The sub-mesh data, one per polygon of the polygon mesh.
    pub meshes: Vec<SubMesh>,
    /// The mesh vertices in world space.
    pub vertices: Vec<Vec3>,
    /// The mesh triangles. Indices are relative to the [`SubMesh::first_vertex_index`] of their sub-mesh.
    pub triangles: Vec<[u8; 3]>,
    /// Edge flags of each triangle, see [`DETAIL_EDGE_BOUNDARY`].
    pub triangle_flags: Vec<u8>,
}

/// The detail triangles of one polygon.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SubMesh {
    /// Index of the first vertex of the sub-mesh in [`DetailNavmesh::vertices`].
    pub first_vertex_index: u32,
    /// Number of vertices in the sub-mesh.
    pub vertex_count: u32,
    /// Index of the first triangle of the sub-mesh in [`DetailNavmesh::triangles`].
    pub first_triangle_index: u32,
    /// Number of triangles in the sub-mesh.
    pub triangle_count: u32,
}

impl DetailNavmesh {
    /// Builds a detail mesh from the provided polygon mesh.
    ///
    /// `sample_distance` is the world-space spacing of the height samples taken along the polygon
    /// edges and inside the polygons; zero disables sampling. `sample_max_error` is the largest
    /// allowed distance between the detail surface and the heightfield.
    ///
    /// # Errors
    ///
    /// Returns an error if a polygon needs more than 255 detail triangles.
    pub fn new(
        mesh: &PolygonNavmesh,
        heightfield: &CompactHeightfield,
        sample_distance: f32,
        sample_max_error: f32,
    ) -> Result<Self, DetailNavmeshError> {
        let mut dmesh = DetailNavmesh::default();
        if mesh.vertices().is_empty() || mesh.polygon_count() == 0 {
            return Ok(dmesh);
        }
        let chf = heightfield;
        let cs = mesh.cell_size();
        let ch = mesh.cell_height();
        let origin = Vec3A::from(mesh.aabb().min);
        let height_search_radius = 1.max(mesh.max_edge_error().ceil() as u32);

        // Find max size for a polygon area.
        let bounds: Vec<Bounds> = mesh
            .polygons()
            .map(|polygon| Bounds::of_polygon(polygon, mesh.vertices(), chf))
            .collect();
        let max_patch_len = bounds.iter().map(Bounds::len).max().unwrap_or_default();
        let mut patch = HeightPatch {
            data: vec![RC_UNSET_HEIGHT; max_patch_len],
            ..Default::default()
        };

        let mut queue = VecDeque::with_capacity(512);
        let mut builder = PolygonDetailBuilder {
            sample_distance,
            sample_max_error,
            height_search_radius,
            cell_size: chf.cell_size,
            cell_height: chf.cell_height,
            vertices: Vec::with_capacity(MAX_VERTS),
            hull: Vec::with_capacity(MAX_VERTS),
            triangles: Vec::with_capacity(MAX_TRIS),
            edges: Vec::new(),
            samples: Vec::new(),
        };
        let mut polygon_vertices = Vec::with_capacity(mesh.max_vertices_per_polygon());

        for (i, polygon) in mesh.polygons().enumerate() {
            // Store polygon vertices for processing.
            polygon_vertices.clear();
            polygon_vertices.extend(polygon.iter().map(|&index| {
                let vertex = mesh.vertices()[index as usize].as_vec3a();
                Vec3A::new(vertex.x * cs, vertex.y * ch, vertex.z * cs)
            }));

            // Get the height data from the area of the polygon.
            patch.set_bounds(&bounds[i]);
            patch.get_height_data(
                chf,
                polygon,
                mesh.vertices(),
                mesh.border_size(),
                &mut queue,
                mesh.region(i),
            );

            // Build detail mesh.
            builder.build(&polygon_vertices, &patch, i)?;

            // Store detail submesh
            dmesh.meshes.push(SubMesh {
                first_vertex_index: dmesh.vertices.len() as u32,
                vertex_count: builder.vertices.len() as u32,
                first_triangle_index: dmesh.triangles.len() as u32,
                triangle_count: builder.triangles.len() as u32,
            });

            // Move detail verts to world space.
            dmesh.vertices.extend(builder.vertices.iter().map(|vertex| {
                let mut world = *vertex + origin;
                // Sampled heights are the floor of the span below the surface.
                world.y += chf.cell_height;
                Vec3::from(world)
            }));
            for (triangle, flags) in &builder.triangles {
                dmesh.triangles.push(triangle.map(|index| index as u8));
                dmesh.triangle_flags.push(*flags);
            }
        }

        tracing::debug!(
            vertices = dmesh.vertices.len(),
            triangles = dmesh.triangles.len(),
            "Built detail mesh"
        );
        Ok(dmesh)
    }

    /// The world-space vertices of the sub-mesh of polygon `index`.
    pub fn submesh_vertices(&self, index: usize) -> &[Vec3] {
        let submesh = &self.meshes[index];
        let start = submesh.first_vertex_index as usize;
        &self.vertices[start..start + submesh.vertex_count as usize]
    }

    /// The triangles of the sub-mesh of polygon `index`, indexing into [`Self::submesh_vertices`].
    pub fn submesh_triangles(&self, index: usize) -> &[[u8; 3]] {
        let submesh = &self.meshes[index];
        let start = submesh.first_triangle_index as usize;
        &self.triangles[start..start + submesh.triangle_count as usize]
    }
}

/// Errors that can occur when building a [`DetailNavmesh`] with [`DetailNavmesh::new`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetailNavmeshError {
    /// A polygon was split into more triangles than a sub-mesh can hold.
    #[error("Polygon {polygon} needs {count} detail triangles, but at most {max} are supported", max = MAX_TRIS)]
    TooManyTriangles {
        /// The index of the polygon in the polygon mesh.
        polygon: usize,
        /// The number of triangles the polygon needed.
        count: usize,
    },
}

/// Scratch buffers and parameters for building the detail mesh of a single polygon.
struct PolygonDetailBuilder {
    sample_distance: f32,
    sample_max_error: f32,
    height_search_radius: u32,
    cell_size: f32,
    cell_height: f32,
    /// Polygon vertices, then edge samples, then interior samples.
    vertices: Vec<Vec3A>,
    /// Indices of the vertices on the polygon outline, in order.
    hull: Vec<usize>,
    triangles: Vec<([usize; 3], u8)>,
    edges: Vec<[i32; 4]>,
    samples: Vec<Sample>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    x: i32,
    y: u16,
    z: i32,
    added: bool,
}

impl PolygonDetailBuilder {
    fn build(
        &mut self,
        polygon: &[Vec3A],
        patch: &HeightPatch,
        polygon_index: usize,
    ) -> Result<(), DetailNavmeshError> {
        let nin = polygon.len();
        let sample_distance = self.sample_distance;
        let ics = 1.0 / self.cell_size;

        self.vertices.clear();
        self.vertices.extend_from_slice(polygon);
        self.hull.clear();
        self.edges.clear();
        self.triangles.clear();

        // Calculate minimum extents of the polygon based on input data.
        let min_extent = polygon_min_extent(polygon);

        // Tessellate outlines.
        // This is done in separate pass in order to ensure
        // seamless height values across the ply boundaries.
        if sample_distance > 0.0 {
            let mut edge = [Vec3A::ZERO; MAX_VERTS_PER_EDGE + 1];
            let mut j = nin - 1;
            for i in 0..nin {
                let mut vj = polygon[j];
                let mut vi = polygon[i];
                let mut swapped = false;
                // Make sure the segments are always handled in same order
                // using lexological sort or else there will be seams.
                if (vj.x - vi.x).abs() < 1.0e-6 {
                    if vj.z > vi.z {
                        std::mem::swap(&mut vj, &mut vi);
                        swapped = true;
                    }
                } else if vj.x > vi.x {
                    std::mem::swap(&mut vj, &mut vi);
                    swapped = true;
                }
                // Create samples along the edge.
                let delta = vi - vj;
                let d = delta.xz().length();
                let mut nn = 1 + (d / sample_distance).floor() as usize;
                if nn >= MAX_VERTS_PER_EDGE {
                    nn = MAX_VERTS_PER_EDGE - 1;
                }
                if self.vertices.len() + nn >= MAX_VERTS {
                    nn = (MAX_VERTS - 1).saturating_sub(self.vertices.len());
                }
                for (k, pos) in edge.iter_mut().enumerate().take(nn + 1) {
                    let u = if nn == 0 { 0.0 } else { k as f32 / nn as f32 };
                    *pos = vj + delta * u;
                    pos.y = get_height(*pos, ics, self.cell_height, self.height_search_radius, patch)
                        as f32
                        * self.cell_height;
                }

                // Simplify samples.
                let mut idx = Vec::with_capacity(MAX_VERTS_PER_EDGE);
                idx.extend([0, nn]);
                let mut k = 0;
                while k + 1 < idx.len() {
                    let a = idx[k];
                    let b = idx[k + 1];
                    let va = edge[a];
                    let vb = edge[b];
                    // Find maximum deviation along the segment.
                    let mut max_d = 0.0;
                    let mut max_i = None;
                    for (m, point) in edge.iter().enumerate().take(b).skip(a + 1) {
                        let dev = distance_squared_between_point_and_line_vec3(*point, (va, vb));
                        if dev > max_d {
                            max_d = dev;
                            max_i = Some(m);
                        }
                    }
                    // If the max deviation is larger than accepted error,
                    // add new point, else continue to next segment.
                    match max_i {
                        Some(max_i) if max_d > self.sample_max_error * self.sample_max_error => {
                            idx.insert(k + 1, max_i);
                        }
                        _ => k += 1,
                    }
                }

                self.hull.push(j);
                // Add new vertices.
                let inner = &idx[1..idx.len() - 1];
                let mut add = |index: usize| {
                    self.hull.push(self.vertices.len());
                    self.vertices.push(edge[index]);
                };
                if swapped {
                    inner.iter().rev().for_each(|&index| add(index));
                } else {
                    inner.iter().for_each(|&index| add(index));
                }
                j = i;
            }
        } else {
            self.hull.extend(0..nin);
        }

        // If the polygon minimum extent is small (sliver or small triangle), do not try to add internal points.
        if min_extent < sample_distance * 2.0 {
            triangulate_hull(&self.vertices, &self.hull, nin, &mut self.triangles);
            set_triangle_flags(&mut self.triangles, &self.hull);
            return Ok(());
        }

        // Tessellate the base mesh.
        // We're using the triangulate_hull instead of delaunay_hull as it tends to
        // create a bit better triangulation for long thin triangles when there
        // are no internal points.
        triangulate_hull(&self.vertices, &self.hull, nin, &mut self.triangles);

        if self.triangles.is_empty() {
            // Could not triangulate the poly, make sure there is some valid data there.
            tracing::warn!(
                polygon = polygon_index,
                vertices = self.vertices.len(),
                "Could not triangulate polygon"
            );
            return Ok(());
        }

        if sample_distance > 0.0 {
            self.add_interior_samples(polygon, patch);
        }

        if self.triangles.len() > MAX_TRIS {
            return Err(DetailNavmeshError::TooManyTriangles {
                polygon: polygon_index,
                count: self.triangles.len(),
            });
        }
        set_triangle_flags(&mut self.triangles, &self.hull);
        Ok(())
    }

    fn add_interior_samples(&mut self, polygon: &[Vec3A], patch: &HeightPatch) {
        let sample_distance = self.sample_distance;
        let ics = 1.0 / self.cell_size;

        // Create sample locations in a grid.
        let (min, max) = polygon
            .iter()
            .fold((polygon[0], polygon[0]), |(min, max), v| (min.min(*v), max.max(*v)));
        let x0 = (min.x / sample_distance).floor() as i32;
        let x1 = (max.x / sample_distance).ceil() as i32;
        let z0 = (min.z / sample_distance).floor() as i32;
        let z1 = (max.z / sample_distance).ceil() as i32;
        self.samples.clear();
        for z in z0..z1 {
            for x in x0..x1 {
                let pt = Vec3A::new(
                    x as f32 * sample_distance,
                    (max.y + min.y) * 0.5,
                    z as f32 * sample_distance,
                );
                // Make sure the samples are not too close to the edges.
                if signed_distance_to_polygon(polygon, pt) > -sample_distance / 2.0 {
                    continue;
                }
                let y = get_height(pt, ics, self.cell_height, self.height_search_radius, patch);
                self.samples.push(Sample {
                    x,
                    y,
                    z,
                    added: false,
                });
            }
        }

        // Add the samples starting from the one that has the most
        // error. The procedure stops when all samples are added
        // or when the max error is within treshold.
        for _ in 0..self.samples.len() {
            if self.vertices.len() >= MAX_VERTS {
                break;
            }

            // Find sample with most error.
            let mut best: Option<(f32, Vec3A, usize)> = None;
            for (i, sample) in self.samples.iter().enumerate() {
                if sample.added {
                    continue;
                }
                // The sample location is jittered to get rid of some bad triangulations
                // which are cause by symmetrical data from the grid structure.
                let pt = Vec3A::new(
                    sample.x as f32 * sample_distance + jitter_x(i) * self.cell_size * 0.1,
                    sample.y as f32 * self.cell_height,
                    sample.z as f32 * sample_distance + jitter_z(i) * self.cell_size * 0.1,
                );
                let Some(d) = distance_to_triangle_mesh(pt, &self.vertices, &self.triangles)
                else {
                    // did not hit the mesh.
                    continue;
                };
                if best.is_none_or(|(best_d, _, _)| d > best_d) {
                    best = Some((d, pt, i));
                }
            }
            // If the max error is within accepted threshold, stop tesselating.
            let Some((best_d, best_pt, best_i)) = best else {
                break;
            };
            if best_d <= self.sample_max_error {
                break;
            }
            // Mark sample as added.
            self.samples[best_i].added = true;
            // Add the new sample point.
            self.vertices.push(best_pt);

            // Create new triangulation.
            delaunay_hull(&self.vertices, &self.hull, &mut self.triangles, &mut self.edges);
        }
    }
}

/// Local height data around a polygon, in cell coordinates without the border.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct HeightPatch {
    data: Vec<u16>,
    xmin: u16,
    zmin: u16,
    width: u16,
    height: u16,
}

/// The cells covered by a polygon, padded by one cell on each side.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    xmin: u16,
    xmax: u16,
    zmin: u16,
    zmax: u16,
}

impl Bounds {
    fn of_polygon(polygon: &[u16], vertices: &[U16Vec3], chf: &CompactHeightfield) -> Self {
        let (min, max) = polygon.iter().map(|&index| vertices[index as usize]).fold(
            (U16Vec3::MAX, U16Vec3::ZERO),
            |(min, max), v| (min.min(v), max.max(v)),
        );
        Self {
            xmin: min.x.saturating_sub(1),
            xmax: chf.width.min(max.x.saturating_add(1)),
            zmin: min.z.saturating_sub(1),
            zmax: chf.height.min(max.z.saturating_add(1)),
        }
    }

    #[inline]
    fn width(&self) -> u16 {
        self.xmax.saturating_sub(self.xmin)
    }

    #[inline]
    fn height(&self) -> u16 {
        self.zmax.saturating_sub(self.zmin)
    }

    #[inline]
    fn len(&self) -> usize {
        self.width() as usize * self.height() as usize
    }
}

impl HeightPatch {
    fn set_bounds(&mut self, bounds: &Bounds) {
        self.xmin = bounds.xmin;
        self.zmin = bounds.zmin;
        self.width = bounds.width();
        self.height = bounds.height();
    }

    #[inline]
    fn data_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    #[inline]
    fn contains(&self, hx: i32, hz: i32) -> bool {
        hx >= 0 && hz >= 0 && hx < self.width as i32 && hz < self.height as i32
    }

    #[inline]
    fn at(&self, hx: i32, hz: i32) -> u16 {
        self.data[(hx + hz * self.width as i32) as usize]
    }

    #[inline]
    fn at_mut(&mut self, hx: i32, hz: i32) -> &mut u16 {
        &mut self.data[(hx + hz * self.width as i32) as usize]
    }

    /// Fills the patch with the floor heights of the spans below `polygon`.
    ///
    /// The queue holds `(x, z, span index)` in heightfield coordinates, including the border.
    fn get_height_data(
        &mut self,
        chf: &CompactHeightfield,
        polygon: &[u16],
        vertices: &[U16Vec3],
        border_size: u16,
        queue: &mut VecDeque<(u16, u16, usize)>,
        region: RegionId,
    ) {
        // Note: Reads to the compact heightfield are offset by border size
        // since border size offset is already removed from the polymesh vertices.
        let bs = border_size;
        queue.clear();
        let data_len = self.data_len();
        // Set all heights to RC_UNSET_HEIGHT.
        self.data[..data_len].fill(RC_UNSET_HEIGHT);

        let mut empty = true;

        // We cannot sample from this poly if it was created from polys
        // of different regions. If it was then it could potentially be overlapping
        // with polys of that region and the heights sampled here could be wrong.
        if region != RegionId::NONE {
            // Copy the height from the same region, and mark region borders
            // as seed points to fill the rest.
            for hz in 0..self.height {
                let z = self.zmin + hz + bs;
                for hx in 0..self.width {
                    let x = self.xmin + hx + bs;
                    if !chf.contains(x as i32, z as i32) {
                        continue;
                    }
                    let Some(i) = chf
                        .cell_at(x, z)
                        .index_range()
                        .find(|&i| chf.spans[i].region == region)
                    else {
                        continue;
                    };
                    // Store height
                    *self.at_mut(hx as i32, hz as i32) = chf.spans[i].y;
                    empty = false;

                    // If any of the neighbours is not in same region,
                    // add the current location as flood fill start
                    let border = (0..4).any(|dir| {
                        chf.neighbor(x, z, i, dir)
                            .is_some_and(|(_, _, ai)| chf.spans[ai].region != region)
                    });
                    if border {
                        queue.push_back((x, z, i));
                    }
                }
            }
        }

        // if the polygon does not contain any points from the current region (rare, but happens)
        // or if it could potentially be overlapping polygons of the same region,
        // then use the center as the seed point.
        if empty {
            self.seed_with_polygon_center(chf, polygon, vertices, bs, queue);
        }

        // We assume the seed is centered in the polygon, so a BFS to collect
        // height data will ensure we do not move onto overlapping polygons and
        // sample wrong heights.
        while let Some((cx, cz, ci)) = queue.pop_front() {
            for dir in 0..4 {
                let Some((ax, az, ai)) = chf.neighbor(cx, cz, ci, dir) else {
                    continue;
                };
                let hx = ax as i32 - self.xmin as i32 - bs as i32;
                let hz = az as i32 - self.zmin as i32 - bs as i32;
                if !self.contains(hx, hz) || self.at(hx, hz) != RC_UNSET_HEIGHT {
                    continue;
                }
                *self.at_mut(hx, hz) = chf.spans[ai].y;
                queue.push_back((ax, az, ai));
            }
        }
    }

    /// Walks from the span closest to a polygon vertex towards the polygon center and seeds
    /// the queue with the last span reached.
    fn seed_with_polygon_center(
        &mut self,
        chf: &CompactHeightfield,
        polygon: &[u16],
        vertices: &[U16Vec3],
        bs: u16,
        queue: &mut VecDeque<(u16, u16, usize)>,
    ) {
        const OFFSET: [(i32, i32); 9] = [
            (0, 0),
            (-1, -1),
            (0, -1),
            (1, -1),
            (1, 0),
            (1, 1),
            (0, 1),
            (-1, 1),
            (-1, 0),
        ];

        // Find cell closest to a poly vertex
        let mut start: Option<(i32, i32, usize)> = None;
        let mut dmin = RC_UNSET_HEIGHT as i32;
        'vertices: for vertex in polygon.iter().map(|&index| vertices[index as usize]) {
            for (offset_x, offset_z) in OFFSET {
                if dmin <= 0 {
                    break 'vertices;
                }
                let ax = vertex.x as i32 + offset_x;
                let az = vertex.z as i32 + offset_z;
                if !self.contains(ax - self.xmin as i32, az - self.zmin as i32)
                    || !chf.contains(ax + bs as i32, az + bs as i32)
                {
                    continue;
                }
                let cell = chf.cell_at((ax + bs as i32) as u16, (az + bs as i32) as u16);
                for i in cell.index_range() {
                    let d = (vertex.y as i32 - chf.spans[i].y as i32).abs();
                    if d < dmin {
                        start = Some((ax, az, i));
                        dmin = d;
                    }
                }
            }
        }
        let Some(start) = start else {
            tracing::warn!("Found no span below the polygon to sample heights from");
            return;
        };

        // Find center of the polygon
        let (sum_x, sum_z) = polygon.iter().fold((0, 0), |(x, z), &index| {
            let vertex = vertices[index as usize];
            (x + vertex.x as i32, z + vertex.z as i32)
        });
        let pcx = sum_x / polygon.len() as i32;
        let pcz = sum_z / polygon.len() as i32;

        // Use a stack for DFS. The patch marks visited cells.
        let mut stack = vec![start];
        let mut dirs = [0, 1, 2, 3];
        let data_len = self.data_len();
        self.data[..data_len].fill(0);

        // DFS to move to the center. Note that we need a DFS here and can not just move
        // directly towards the center without recording intermediate nodes, even though the polygons
        // are convex. In very rare we can get stuck due to contour simplification if we do not
        // record nodes.
        let mut current = start;
        while let Some(popped) = stack.pop() {
            current = popped;
            let (cx, cz, ci) = current;
            if cx == pcx && cz == pcz {
                break;
            }

            // If we are already at the correct X-position, prefer direction
            // directly towards the center in the Z-axis; otherwise prefer
            // direction in the X-axis
            let direct_dir = if cx == pcx {
                dir_offset(0, if pcz > cz { 1 } else { -1 })
            } else {
                dir_offset(if pcx > cx { 1 } else { -1 }, 0)
            } as usize;

            // Push the direct dir last so we start with this on next iteration
            dirs.swap(direct_dir, 3);

            for &dir in &dirs {
                let Some(con) = chf.spans[ci].con(dir) else {
                    continue;
                };
                let new_x = cx + dir_offset_x(dir) as i32;
                let new_z = cz + dir_offset_z(dir) as i32;
                let hx = new_x - self.xmin as i32;
                let hz = new_z - self.zmin as i32;
                if !self.contains(hx, hz) || self.at(hx, hz) != 0 {
                    continue;
                }
                *self.at_mut(hx, hz) = 1;
                let cell = chf.cell_at((new_x + bs as i32) as u16, (new_z + bs as i32) as u16);
                stack.push((new_x, new_z, cell.index() as usize + con as usize));
            }

            dirs.swap(direct_dir, 3);
        }

        // The queue holds coordinates with borders
        let (cx, cz, ci) = current;
        queue.clear();
        queue.push_back(((cx + bs as i32) as u16, (cz + bs as i32) as u16, ci));
        self.data[..data_len].fill(RC_UNSET_HEIGHT);
        *self.at_mut(cx - self.xmin as i32, cz - self.zmin as i32) = chf.spans[ci].y;
    }
}

/// Looks up the height of the patch below `f`, searching outwards in rings if the cell has no data.
fn get_height(f: Vec3A, ics: f32, ch: f32, radius: u32, hp: &HeightPatch) -> u16 {
    if hp.data_len() == 0 {
        return RC_UNSET_HEIGHT;
    }
    let ix = (f.x * ics + 0.01).floor() as i32;
    let iz = (f.z * ics + 0.01).floor() as i32;
    let ix = (ix - hp.xmin as i32).clamp(0, hp.width as i32 - 1);
    let iz = (iz - hp.zmin as i32).clamp(0, hp.height as i32 - 1);
    let mut h = hp.at(ix, iz);
    if h != RC_UNSET_HEIGHT {
        return h;
    }

    // Special case when data might be bad.
    // Walk adjacent cells in a spiral up to 'radius', and look
    // for a pixel which has a valid height.
    let (mut x, mut z, mut dx, mut dz) = (1, 0, 1, 0);
    let max_size = radius * 2 + 1;
    let max_iter = max_size * max_size - 1;

    let mut next_ring_iter_start = 8;
    let mut next_ring_iters = 16;

    let mut dmin = f32::MAX;
    for i in 0..max_iter {
        let nx = ix + x;
        let nz = iz + z;
        if hp.contains(nx, nz) {
            let nh = hp.at(nx, nz);
            if nh != RC_UNSET_HEIGHT {
                let d = (nh as f32 * ch - f.y).abs();
                if d < dmin {
                    h = nh;
                    dmin = d;
                }
            }
        }

        // The search visits rings of cells around the center: 8 neighbors, then 16, and so on.
        // Once a ring produced a height, the rings further out are not searched.
        if i + 1 == next_ring_iter_start {
            if h != RC_UNSET_HEIGHT {
                break;
            }
            next_ring_iter_start += next_ring_iters;
            next_ring_iters += 8;
        }

        if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
            let tmp = dx;
            dx = -dz;
            dz = tmp;
        }
        x += dx;
        z += dz;
    }
    h
}

/// Calculate minimum extend of the polygon.
fn polygon_min_extent(vertices: &[Vec3A]) -> f32 {
    let n = vertices.len();
    let min_dist_squared = (0..n)
        .map(|i| {
            let ni = next(i, n);
            let edge = (vertices[i], vertices[ni]);
            (0..n)
                .filter(|&j| j != i && j != ni)
                .map(|j| distance_squared_between_point_and_line_xz(vertices[j], edge))
                .fold(0.0_f32, f32::max)
        })
        .fold(f32::MAX, f32::min);
    min_dist_squared.sqrt()
}

/// Distance on the xz-plane from `p` to the polygon outline, negative inside the polygon.
fn signed_distance_to_polygon(vertices: &[Vec3A], p: Vec3A) -> f32 {
    let mut dmin = f32::MAX;
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for (i, &vi) in vertices.iter().enumerate() {
        let vj = vertices[j];
        if (vi.z > p.z) != (vj.z > p.z)
            && p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x
        {
            inside = !inside;
        }
        dmin = dmin.min(distance_squared_between_point_and_line_xz(p, (vj, vi)));
        j = i;
    }
    let dmin = dmin.sqrt();
    if inside { -dmin } else { dmin }
}

/// Vertical distance from `p` to the triangle below or above it, if any.
fn distance_to_triangle_mesh(
    p: Vec3A,
    vertices: &[Vec3A],
    triangles: &[([usize; 3], u8)],
) -> Option<f32> {
    triangles
        .iter()
        .filter_map(|([a, b, c], _)| {
            distance_to_triangle(p, vertices[*a], vertices[*b], vertices[*c])
        })
        .reduce(f32::min)
}

/// Distance from point p to triangle defined by vertices a, b, and c.
/// Returns None if the point is outside the triangle.
fn distance_to_triangle(p: Vec3A, a: Vec3A, b: Vec3A, c: Vec3A) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let dot00 = v0.xz().dot(v0.xz());
    let dot01 = v0.xz().dot(v1.xz());
    let dot02 = v0.xz().dot(v2.xz());
    let dot11 = v1.xz().dot(v1.xz());
    let dot12 = v1.xz().dot(v2.xz());

    // Compute barycentric coordinates
    let inv_denom = 1.0 / (dot00 * dot11 - dot01 * dot01);
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    // If point lies inside the triangle, return interpolated y-coord.
    const EPS: f32 = 1.0e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a.y + v0.y * u + v1.y * v;
        Some((y - p.y).abs())
    } else {
        None
    }
}

fn jitter_x(i: usize) -> f32 {
    ((i as u32).wrapping_mul(0x8da6b343) & 0xffff) as f32 / 65535.0 * 2.0 - 1.0
}

fn jitter_z(i: usize) -> f32 {
    ((i as u32).wrapping_mul(0xd8163841) & 0xffff) as f32 / 65535.0 * 2.0 - 1.0
}

/// Find edges that lie on hull and mark them as such.
fn set_triangle_flags(triangles: &mut [([usize; 3], u8)], hull: &[usize]) {
    for ([a, b, c], flags) in triangles {
        let boundary = |from: usize, to: usize, shift: u8| {
            if on_hull(from, to, hull) {
                DETAIL_EDGE_BOUNDARY << shift
            } else {
                0
            }
        };
        *flags = boundary(*a, *b, 0) | boundary(*b, *c, 2) | boundary(*c, *a, 4);
    }
}

fn on_hull(a: usize, b: usize, hull: &[usize]) -> bool {
    // All internal sampled points come after the hull so we can early out for those.
    let nhull = hull.len();
    if a >= nhull || b >= nhull {
        return false;
    }
    let mut j = nhull - 1;
    for i in 0..nhull {
        if a == hull[j] && b == hull[i] {
            return true;
        }
        j = i;
    }
    false
}

/// Fan-like triangulation of the hull that prefers short perimeters.
fn triangulate_hull(
    vertices: &[Vec3A],
    hull: &[usize],
    nin: usize,
    triangles: &mut Vec<([usize; 3], u8)>,
) {
    triangles.clear();
    let nhull = hull.len();
    if nhull < 3 {
        return;
    }
    let mut start = 0;
    let mut left = 1;
    let mut right = nhull - 1;

    // Start from an ear with shortest perimeter.
    // This tends to favor well formed triangles as starting point.
    let mut dmin = f32::MAX;
    for i in 0..nhull {
        if hull[i] >= nin {
            // Ears are triangles with original vertices as middle vertex while others are actually line segments on edges
            continue;
        }
        let pi = prev(i, nhull);
        let ni = next(i, nhull);
        let pv = vertices[hull[pi]].xz();
        let cv = vertices[hull[i]].xz();
        let nv = vertices[hull[ni]].xz();
        let d = pv.distance(cv) + cv.distance(nv) + nv.distance(pv);
        if d < dmin {
            start = i;
            left = ni;
            right = pi;
            dmin = d;
        }
    }

    // Add first triangle
    triangles.push(([hull[start], hull[left], hull[right]], 0));

    // Triangulate the polygon by moving left or right,
    // depending on which triangle has shorter perimeter.
    // This heuristic was chose empirically, since it seems
    // handle tessellated straight edges well.
    while next(left, nhull) != right {
        // Check to see if se should advance left or right.
        let nleft = next(left, nhull);
        let nright = prev(right, nhull);

        let cvleft = vertices[hull[left]].xz();
        let nvleft = vertices[hull[nleft]].xz();
        let cvright = vertices[hull[right]].xz();
        let nvright = vertices[hull[nright]].xz();
        let dleft = cvleft.distance(nvleft) + nvleft.distance(cvright);
        let dright = cvright.distance(nvright) + cvleft.distance(nvright);
        if dleft < dright {
            triangles.push(([hull[left], hull[nleft], hull[right]], 0));
            left = nleft;
        } else {
            triangles.push(([hull[left], hull[nright], hull[right]], 0));
            right = nright;
        }
    }
}

const EV_UNDEF: i32 = -1;
const EV_HULL: i32 = -2;

/// Delaunay triangulation of `points` constrained to the given hull.
///
/// Edges are stored as `[start, end, left face, right face]`.
fn delaunay_hull(
    points: &[Vec3A],
    hull: &[usize],
    triangles: &mut Vec<([usize; 3], u8)>,
    edges: &mut Vec<[i32; 4]>,
) {
    let max_edges = points.len() * 10;
    let mut face_count = 0;
    edges.clear();
    triangles.clear();

    let mut j = hull.len() - 1;
    for i in 0..hull.len() {
        add_edge(edges, max_edges, hull[j] as i32, hull[i] as i32, EV_HULL, EV_UNDEF);
        j = i;
    }

    let mut current_edge = 0;
    while current_edge < edges.len() {
        if edges[current_edge][2] == EV_UNDEF {
            complete_facet(points, edges, max_edges, &mut face_count, current_edge);
        }
        if edges[current_edge][3] == EV_UNDEF {
            complete_facet(points, edges, max_edges, &mut face_count, current_edge);
        }
        current_edge += 1;
    }

    // Create tris
    let mut faces = vec![[-1_i32; 3]; face_count as usize];
    for e in edges.iter() {
        if e[3] >= 0 {
            // Left face
            let t = &mut faces[e[3] as usize];
            if t[0] == -1 {
                t[0] = e[0];
                t[1] = e[1];
            } else if t[0] == e[1] {
                t[2] = e[0];
            } else if t[1] == e[0] {
                t[2] = e[1];
            }
        }
        if e[2] >= 0 {
            // Right
            let t = &mut faces[e[2] as usize];
            if t[0] == -1 {
                t[0] = e[1];
                t[1] = e[0];
            } else if t[0] == e[0] {
                t[2] = e[1];
            } else if t[1] == e[1] {
                t[2] = e[0];
            }
        }
    }

    let mut i = 0;
    while i < faces.len() {
        let t = faces[i];
        if t.contains(&-1) {
            tracing::warn!(face = i, "Removing dangling face from detail triangulation");
            faces.swap_remove(i);
        } else {
            i += 1;
        }
    }
    triangles.extend(faces.into_iter().map(|t| (t.map(|index| index as usize), 0)));
}

fn find_edge(edges: &[[i32; 4]], s: i32, t: i32) -> Option<usize> {
    edges
        .iter()
        .position(|e| (e[0] == s && e[1] == t) || (e[0] == t && e[1] == s))
}

fn add_edge(edges: &mut Vec<[i32; 4]>, max_edges: usize, s: i32, t: i32, l: i32, r: i32) {
    if edges.len() >= max_edges {
        tracing::error!(max_edges, "Too many edges in detail triangulation");
        return;
    }
    // Add edge if not already in the triangulation.
    if find_edge(edges, s, t).is_none() {
        edges.push([s, t, l, r]);
    }
}

fn update_left_face(e: &mut [i32; 4], s: i32, t: i32, f: i32) {
    if e[0] == s && e[1] == t && e[2] == EV_UNDEF {
        e[2] = f;
    } else if e[1] == s && e[0] == t && e[3] == EV_UNDEF {
        e[3] = f;
    }
}

fn complete_facet(
    points: &[Vec3A],
    edges: &mut Vec<[i32; 4]>,
    max_edges: usize,
    face_count: &mut i32,
    e: usize,
) {
    const EPS: f32 = 1e-5;

    let edge = edges[e];

    // Cache s and t.
    let (s, t) = if edge[2] == EV_UNDEF {
        (edge[0], edge[1])
    } else if edge[3] == EV_UNDEF {
        (edge[1], edge[0])
    } else {
        // Edge already completed.
        return;
    };
    let point = |index: i32| points[index as usize].xz();

    // Find best point on left of edge.
    let mut pt = None;
    let mut circle: Option<(Vec2, f32)> = None;
    for u in 0..points.len() as i32 {
        if u == s || u == t {
            continue;
        }
        if cross_2d(point(s), point(t), point(u)) <= EPS {
            continue;
        }
        let Some((center, radius)) = circle else {
            // The circle is not updated yet, do it now.
            pt = Some(u);
            circle = Some(circum_circle(point(s), point(t), point(u)));
            continue;
        };
        let d = center.distance(point(u));
        const TOLERANCE: f32 = 0.001;
        if d > radius * (1.0 + TOLERANCE) {
            // Outside current circumcircle, skip.
            continue;
        } else if d >= radius * (1.0 - TOLERANCE) {
            // Inside epsilon circum circle, do extra tests to make sure the edge is valid.
            // s-u and t-u cannot overlap with s-pt nor t-pt if they exists.
            if overlap_edges(points, edges, s, u) || overlap_edges(points, edges, t, u) {
                continue;
            }
        }
        // Edge is valid.
        pt = Some(u);
        circle = Some(circum_circle(point(s), point(t), point(u)));
    }

    // Add new triangle or update edge info if s-t is on hull.
    let Some(pt) = pt else {
        update_left_face(&mut edges[e], s, t, EV_HULL);
        return;
    };

    // Update face information of edge being completed.
    update_left_face(&mut edges[e], s, t, *face_count);

    // Add new edge or update face info of old edge.
    match find_edge(edges, pt, s) {
        None => add_edge(edges, max_edges, pt, s, *face_count, EV_UNDEF),
        Some(existing) => update_left_face(&mut edges[existing], pt, s, *face_count),
    }

    // Add new edge or update face info of old edge.
    match find_edge(edges, t, pt) {
        None => add_edge(edges, max_edges, t, pt, *face_count, EV_UNDEF),
        Some(existing) => update_left_face(&mut edges[existing], t, pt, *face_count),
    }

    *face_count += 1;
}

fn overlap_edges(points: &[Vec3A], edges: &[[i32; 4]], s1: i32, t1: i32) -> bool {
    let point = |index: i32| points[index as usize].xz();
    edges.iter().any(|e| {
        let (s0, t0) = (e[0], e[1]);
        // Same or connected edges do not overlap.
        if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
            return false;
        }
        overlap_segment_segment_2d(point(s0), point(t0), point(s1), point(t1))
    })
}

fn overlap_segment_segment_2d(a: Vec2, b: Vec2, c: Vec2, d: Vec2) -> bool {
    let a1 = cross_2d(a, b, d);
    let a2 = cross_2d(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = cross_2d(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

#[inline]
fn cross_2d(p1: Vec2, p2: Vec2, p3: Vec2) -> f32 {
    (p2 - p1).perp_dot(p3 - p1)
}

/// Returns the center and radius of the circle through the three points.
fn circum_circle(p1: Vec2, p2: Vec2, p3: Vec2) -> (Vec2, f32) {
    const EPS: f32 = 1e-6;
    // Calculate the circle relative to p1, to avoid some precision issues.
    let v2 = p2 - p1;
    let v3 = p3 - p1;

    let cp = v2.perp_dot(v3);
    if cp.abs() <= EPS {
        return (p1, 0.0);
    }
    let v2_sq = v2.length_squared();
    let v3_sq = v3.length_squared();
    let center = Vec2::new(
        (v2_sq * v3.y - v3_sq * v2.y) / (2.0 * cp),
        (v3_sq * v2.x - v2_sq * v3.x) / (2.0 * cp),
    );
    (center + p1, center.length())
}
