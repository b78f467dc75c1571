//! Tracing and simplification of region outlines into [`Contour`]s.

use glam::{IVec2, U16Vec3};

use crate::{
    Aabb3d, AreaType, CompactHeightfield, RegionId,
    math::{distance_squared_between_point_and_line_vec2, next, prev},
};

impl CompactHeightfield {
    /// The raw contours will match the region outlines exactly. The `max_error` and `max_edge_len`
    /// parameters control how closely the simplified contours will match the raw contours.
    ///
    /// Simplified contours are generated such that the vertices for portals between areas match up.
    /// (They are considered mandatory vertices.)
    ///
    /// Setting `max_edge_len` to zero will disabled the edge length feature.
    ///
    /// Regions must be built with [`CompactHeightfield::build_regions`] first.
    pub fn build_contours(
        &self,
        max_error: f32,
        max_edge_len: u16,
        build_flags: BuildContoursFlags,
    ) -> ContourSet {
        let mut cset = ContourSet {
            contours: Vec::with_capacity(self.max_region.bits().max(8) as usize),
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            width: self.width.saturating_sub(self.border_size * 2),
            height: self.height.saturating_sub(self.border_size * 2),
            border_size: self.border_size,
            max_error,
        };
        if self.border_size > 0 {
            // If the heightfield was built with border_size, remove the offset
            let pad = self.border_size as f32 * self.cell_size;
            cset.aabb.min.x += pad;
            cset.aabb.min.z += pad;
            cset.aabb.max.x -= pad;
            cset.aabb.max.z -= pad;
        }

        let mut flags = vec![0_u8; self.spans.len()];

        // Mark boundaries
        for (x, z, i) in self.span_indices() {
            let region = self.spans[i].region;
            if !region.is_interior() {
                flags[i] = 0;
                continue;
            }
            let mut res = 0;
            for dir in 0..4 {
                let neighbor_region = self
                    .neighbor(x, z, i, dir)
                    .map_or(RegionId::NONE, |(_, _, ai)| self.spans[ai].region);
                if neighbor_region == region {
                    res |= 1 << dir;
                }
            }
            // Inverse, mark non connected edges.
            flags[i] = res ^ 0xf;
        }

        let mut verts = Vec::with_capacity(256);
        let mut simplified = Vec::with_capacity(64);

        for (x, z, i) in self.span_indices() {
            if flags[i] == 0 || flags[i] == 0xf {
                flags[i] = 0;
                continue;
            }
            let region = self.spans[i].region;
            if !region.is_interior() {
                continue;
            }
            let area = self.areas[i];

            verts.clear();
            simplified.clear();

            self.walk_contour_build(x, z, i, &mut flags, &mut verts);

            simplify_contour(&verts, &mut simplified, max_error, max_edge_len, build_flags);
            remove_degenerate_segments(&mut simplified);

            if contour_self_intersects(&simplified) {
                tracing::warn!(
                    region = region.bits(),
                    "Simplified contour intersects itself, keeping the raw outline"
                );
                simplified = raw_as_simplified(&verts);
                remove_degenerate_segments(&mut simplified);
            }

            // Create contour.
            if simplified.len() >= 3 {
                let remove_offset = |(vertex, flags): (U16Vec3, RegionVertexId)| {
                    let mut vertex = vertex;
                    // If the heightfield was built with border_size, remove the offset.
                    vertex.x = vertex.x.saturating_sub(self.border_size);
                    vertex.z = vertex.z.saturating_sub(self.border_size);
                    (vertex, flags)
                };
                cset.contours.push(Contour {
                    vertices: simplified.iter().copied().map(remove_offset).collect(),
                    raw_vertices: verts.iter().copied().map(remove_offset).collect(),
                    region,
                    area,
                });
            }
        }

        cset.merge_holes(self.max_region);
        tracing::debug!(contours = cset.contours.len(), "Built contours");
        cset
    }

    fn walk_contour_build(
        &self,
        mut x: u16,
        mut z: u16,
        mut i: usize,
        flags: &mut [u8],
        points: &mut Vec<(U16Vec3, RegionVertexId)>,
    ) {
        // Choose the first non-connected edge
        let mut dir = 0;
        while flags[i] & (1 << dir) == 0 {
            dir += 1;
        }

        let start_dir = dir;
        let start_i = i;
        let area = self.areas[i];

        let mut iter = 0;
        loop {
            iter += 1;
            if iter >= 40_000 {
                tracing::warn!(x, z, "Contour walk did not terminate");
                return;
            }
            if flags[i] & (1 << dir) != 0 {
                // Choose the edge corner
                let (p_y, is_border_vertex) = self.get_corner_height(x, z, i, dir);
                let (p_x, p_z) = match dir {
                    0 => (x, z + 1),
                    1 => (x + 1, z + 1),
                    2 => (x + 1, z),
                    _ => (x, z),
                };
                let mut r = RegionVertexId::NONE;
                if let Some((_, _, ai)) = self.neighbor(x, z, i, dir) {
                    r = RegionVertexId::from(self.spans[ai].region);
                    if area != self.areas[ai] {
                        r |= RegionVertexId::AREA_BORDER;
                    }
                }
                if is_border_vertex {
                    r |= RegionVertexId::BORDER_VERTEX;
                }
                points.push((U16Vec3::new(p_x, p_y, p_z), r));

                // Remove visited edges
                flags[i] &= !(1 << dir);
                // Rotate clockwise
                dir = (dir + 1) & 0x3;
            } else {
                let Some((nx, nz, ni)) = self.neighbor(x, z, i, dir) else {
                    // Should not happen.
                    tracing::warn!(x, z, dir, "Contour walk stepped into an unconnected span");
                    return;
                };
                x = nx;
                z = nz;
                i = ni;
                // Rotate counterclockwise
                dir = (dir + 3) & 0x3;
            }
            if start_i == i && start_dir == dir {
                break;
            }
        }
    }

    /// Returns the height of the corner at the start of edge `dir` of span `i`, and whether
    /// the corner is a tile border vertex that will be removed when building the polygon mesh.
    fn get_corner_height(&self, x: u16, z: u16, i: usize, dir: u8) -> (u16, bool) {
        let mut ch = self.spans[i].y;
        let dir_p = (dir + 1) & 0x3;

        // Combine region and area codes in order to prevent
        // border vertices which are in between two areas to be removed.
        let region_and_area =
            |i: usize| self.spans[i].region.bits() as u32 | ((self.areas[i].0 as u32) << 16);
        let mut regs = [0_u32; 4];
        regs[0] = region_and_area(i);

        if let Some((ax, az, ai)) = self.neighbor(x, z, i, dir) {
            ch = ch.max(self.spans[ai].y);
            regs[1] = region_and_area(ai);
            if let Some((_, _, bi)) = self.neighbor(ax, az, ai, dir_p) {
                ch = ch.max(self.spans[bi].y);
                regs[2] = region_and_area(bi);
            }
        }
        if let Some((ax, az, ai)) = self.neighbor(x, z, i, dir_p) {
            ch = ch.max(self.spans[ai].y);
            regs[3] = region_and_area(ai);
            if let Some((_, _, bi)) = self.neighbor(ax, az, ai, dir) {
                ch = ch.max(self.spans[bi].y);
                regs[2] = region_and_area(bi);
            }
        }

        // Check if the vertex is special edge vertex, these vertices will be removed later.
        let border = RegionId::BORDER_REGION.bits() as u32;
        let is_border_vertex = (0..4).any(|j| {
            let a = regs[j];
            let b = regs[(j + 1) & 0x3];
            let c = regs[(j + 2) & 0x3];
            let d = regs[(j + 3) & 0x3];

            // The vertex is a border vertex there are two same exterior cells in a row,
            // followed by two interior cells and none of the regions are out of bounds.
            let two_same_exts = a & b & border != 0 && a == b;
            let two_ints = (c | d) & border == 0;
            let ints_same_area = c >> 16 == d >> 16;
            let no_zeros = a != 0 && b != 0 && c != 0 && d != 0;
            two_same_exts && two_ints && ints_same_area && no_zeros
        });
        (ch, is_border_vertex)
    }
}

/// A simplified vertex: position plus the index of the raw vertex it came from.
type SimplifiedVertex = (U16Vec3, usize);

fn simplify_contour(
    points: &[(U16Vec3, RegionVertexId)],
    simplified: &mut Vec<(U16Vec3, RegionVertexId)>,
    max_error: f32,
    max_edge_len: u16,
    build_flags: BuildContoursFlags,
) {
    let pn = points.len();
    let mut vertices: Vec<SimplifiedVertex> = Vec::with_capacity(64);

    // Add initial points.
    let has_connections = points
        .iter()
        .any(|(_, r)| r.intersects(RegionVertexId::REGION_MASK));

    if has_connections {
        // The contour has some portals to other regions.
        // Add a new point to every location where the region changes.
        for (i, (point, r)) in points.iter().enumerate() {
            let next_r = points[(i + 1) % pn].1;
            let different_regs = r.region() != next_r.region();
            let area_borders = r.contains(RegionVertexId::AREA_BORDER)
                != next_r.contains(RegionVertexId::AREA_BORDER);
            if different_regs || area_borders {
                vertices.push((*point, i));
            }
        }
    }

    if vertices.is_empty() {
        // If there is no connections at all,
        // create some initial points for the simplification process.
        // Find lower-left and upper-right vertices of the contour.
        let mut lower_left = 0;
        let mut upper_right = 0;
        for (i, (point, _)) in points.iter().enumerate() {
            let ll = points[lower_left].0;
            if point.x < ll.x || (point.x == ll.x && point.z < ll.z) {
                lower_left = i;
            }
            let ur = points[upper_right].0;
            if point.x > ur.x || (point.x == ur.x && point.z > ur.z) {
                upper_right = i;
            }
        }
        vertices.push((points[lower_left].0, lower_left));
        vertices.push((points[upper_right].0, upper_right));
    }

    // Add points until all raw points are within
    // error tolerance to the simplified shape.
    let max_error_sq = max_error * max_error;
    let mut i = 0;
    while i < vertices.len() {
        let ii = (i + 1) % vertices.len();

        let (mut a, ai) = vertices[i];
        let (mut b, bi) = vertices[ii];

        // Find maximum deviation from the segment.
        let mut max_d = 0.0;
        let mut max_i = None;

        // Traverse the segment in lexilogical order so that the
        // max deviation is calculated similarly when traversing
        // opposite segments.
        let (mut ci, c_inc, end_i) = if b.x > a.x || (b.x == a.x && b.z > a.z) {
            ((ai + 1) % pn, 1, bi)
        } else {
            std::mem::swap(&mut a, &mut b);
            ((bi + pn - 1) % pn, pn - 1, ai)
        };

        // Tessellate only outer edges or edges between areas.
        let r = points[ci].1;
        if !r.intersects(RegionVertexId::REGION_MASK) || r.contains(RegionVertexId::AREA_BORDER) {
            let segment = (xz(a).as_vec2(), xz(b).as_vec2());
            while ci != end_i {
                let d = distance_squared_between_point_and_line_vec2(
                    xz(points[ci].0).as_vec2(),
                    segment,
                );
                if d > max_d {
                    max_d = d;
                    max_i = Some(ci);
                }
                ci = (ci + c_inc) % pn;
            }
        }

        // If the max deviation is larger than accepted error,
        // add new point, else continue to next segment.
        match max_i {
            Some(max_i) if max_d > max_error_sq => {
                vertices.insert(i + 1, (points[max_i].0, max_i));
            }
            _ => i += 1,
        }
    }

    // Split too long edges.
    let tessellate_walls = build_flags.contains(BuildContoursFlags::TESSELLATE_SOLID_WALL_EDGES);
    let tessellate_areas = build_flags.contains(BuildContoursFlags::TESSELLATE_AREA_EDGES);
    if max_edge_len > 0 && (tessellate_walls || tessellate_areas) {
        let max_edge_len_sq = max_edge_len as i32 * max_edge_len as i32;
        let mut i = 0;
        while i < vertices.len() {
            let ii = (i + 1) % vertices.len();

            let (a, ai) = vertices[i];
            let (b, bi) = vertices[ii];

            // Find maximum deviation from the segment.
            let mut max_i = None;
            let ci = (ai + 1) % pn;

            // Tessellate only outer edges or edges between areas.
            let r = points[ci].1;
            let tessellate = (tessellate_walls && !r.intersects(RegionVertexId::REGION_MASK))
                || (tessellate_areas && r.contains(RegionVertexId::AREA_BORDER));

            if tessellate {
                let delta = xz(b) - xz(a);
                if delta.length_squared() > max_edge_len_sq {
                    // Round based on the segments in lexilogical order so that the
                    // max tesselation is consistent regardless in which direction
                    // segments are traversed.
                    let n = if bi < ai { bi + pn - ai } else { bi - ai };
                    if n > 1 {
                        max_i = Some(if b.x > a.x || (b.x == a.x && b.z > a.z) {
                            (ai + n / 2) % pn
                        } else {
                            (ai + n.div_ceil(2)) % pn
                        });
                    }
                }
            }

            // If the max deviation is larger than accepted error,
            // add new point, else continue to next segment.
            if let Some(max_i) = max_i {
                vertices.insert(i + 1, (points[max_i].0, max_i));
            } else {
                i += 1;
            }
        }
    }

    simplified.clear();
    simplified.extend(vertices.into_iter().map(|(vertex, raw_index)| {
        // The edge vertex flag is take from the current raw point,
        // and the neighbour region is take from the next raw point.
        let ai = (raw_index + 1) % pn;
        let neighbor = points[ai].1 & (RegionVertexId::REGION_MASK | RegionVertexId::AREA_BORDER);
        let border = points[raw_index].1 & RegionVertexId::BORDER_VERTEX;
        (vertex, neighbor | border)
    }));
}

/// Uses every raw vertex as a simplified vertex, with the same flags [`simplify_contour`] would assign.
fn raw_as_simplified(points: &[(U16Vec3, RegionVertexId)]) -> Vec<(U16Vec3, RegionVertexId)> {
    let pn = points.len();
    points
        .iter()
        .enumerate()
        .map(|(i, (vertex, r))| {
            let neighbor =
                points[(i + 1) % pn].1 & (RegionVertexId::REGION_MASK | RegionVertexId::AREA_BORDER);
            (*vertex, neighbor | (*r & RegionVertexId::BORDER_VERTEX))
        })
        .collect()
}

/// Remove adjacent vertices which are equal on xz-plane,
/// or else the triangulator will get confused.
fn remove_degenerate_segments(simplified: &mut Vec<(U16Vec3, RegionVertexId)>) {
    let mut i = 0;
    while i < simplified.len() {
        let ni = next(i, simplified.len());
        if simplified.len() > 1 && xz(simplified[i].0) == xz(simplified[ni].0) {
            // Degenerate segment, remove.
            simplified.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Whether two non-adjacent edges of the loop properly cross each other.
fn contour_self_intersects(vertices: &[(U16Vec3, RegionVertexId)]) -> bool {
    let n = vertices.len();
    if n < 4 {
        return false;
    }
    let point = |i: usize| xz(vertices[i].0);
    (0..n).any(|i| {
        let i1 = next(i, n);
        (i + 2..n)
            .filter(|&j| next(j, n) != i)
            .any(|j| intersect_prop(point(i), point(i1), point(j), point(next(j, n))))
    })
}

impl ContourSet {
    /// Merges every hole (a clockwise contour) into the outline of its region.
    fn merge_holes(&mut self, max_region: RegionId) {
        // Calculate winding of all polygons.
        let winding: Vec<bool> = self
            .contours
            .iter()
            .map(|contour| calc_area_of_polygon_2d(&contour.vertices) < 0)
            .collect();
        if !winding.iter().any(|&is_hole| is_hole) {
            return;
        }

        // Collect outline contour and holes contours per region.
        // We assume that there is one outline and multiple holes.
        let region_count = max_region.bits() as usize + 1;
        let mut outlines: Vec<Option<usize>> = vec![None; region_count];
        let mut holes: Vec<Vec<usize>> = vec![Vec::new(); region_count];
        for (i, contour) in self.contours.iter().enumerate() {
            let region = contour.region.bits() as usize;
            if region >= region_count {
                continue;
            }
            // Positively wound contours are outlines, negative holes.
            if winding[i] {
                holes[region].push(i);
            } else {
                if outlines[region].is_some() {
                    tracing::warn!(region, "Multiple outlines for region");
                }
                outlines[region] = Some(i);
            }
        }

        // Finally merge each regions holes into the outline.
        for (region, region_holes) in holes.into_iter().enumerate() {
            if region_holes.is_empty() {
                continue;
            }
            let Some(outline) = outlines[region] else {
                tracing::warn!(region, "Missing outline for region, needed for merging holes");
                continue;
            };
            self.merge_region_holes(outline, region_holes);
        }

        // Merged holes leave empty contours behind.
        self.contours.retain(|contour| !contour.vertices.is_empty());
    }

    fn merge_region_holes(&mut self, outline: usize, holes: Vec<usize>) {
        // Sort holes from left to right.
        let mut holes: Vec<(usize, HoleSortKey, usize)> = holes
            .into_iter()
            .map(|hole| {
                let (leftmost, min) = find_left_most_vertex(&self.contours[hole].vertices);
                (hole, min, leftmost)
            })
            .collect();
        holes.sort_by_key(|&(_, min, _)| min);

        let mut diagonals: Vec<PotentialDiagonal> = Vec::new();

        // Merge holes into the outline one by one.
        for i in 0..holes.len() {
            let (hole, _, leftmost) = holes[i];
            let hole_len = self.contours[hole].vertices.len();

            let mut index = None;
            let mut best_vertex = leftmost;
            for _ in 0..hole_len {
                // Find potential diagonals.
                // The 'best' vertex must be in the cone described by 3 cosequtive vertices of the outline.
                // ..o j-1
                //   |
                //   |   * best
                //   |
                // j o-----o j+1
                //         :
                let corner = xz(self.contours[hole].vertices[best_vertex].0);
                let outline_vertices = &self.contours[outline].vertices;
                diagonals.clear();
                for j in 0..outline_vertices.len() {
                    if in_cone(j, outline_vertices, corner) {
                        let dist = (xz(outline_vertices[j].0) - corner).length_squared();
                        diagonals.push(PotentialDiagonal { vertex: j, dist });
                    }
                }
                // Sort potential diagonals by distance, we want to make the connection as short as possible.
                diagonals.sort_by_key(|diagonal| diagonal.dist);

                // Find a diagonal that is not intersecting the outline not the remaining holes.
                index = diagonals
                    .iter()
                    .find(|diagonal| {
                        let pt = xz(outline_vertices[diagonal.vertex].0);
                        let intersects_outline = intersect_seg_contour(
                            pt,
                            corner,
                            Some(diagonal.vertex),
                            outline_vertices,
                        );
                        let intersects_holes = holes[i..].iter().any(|&(other, _, _)| {
                            intersect_seg_contour(pt, corner, None, &self.contours[other].vertices)
                        });
                        !intersects_outline && !intersects_holes
                    })
                    .map(|diagonal| diagonal.vertex);

                // If found non-intersecting diagonal, stop looking.
                if index.is_some() {
                    break;
                }
                // All the potential diagonals for the current vertex were intersecting, try next vertex.
                best_vertex = (best_vertex + 1) % hole_len;
            }

            let Some(index) = index else {
                tracing::warn!(
                    region = self.contours[outline].region.bits(),
                    "Failed to find merge points for a contour hole"
                );
                continue;
            };
            self.merge_contours(outline, hole, index, best_vertex);
        }
    }

    /// Appends contour `b` to contour `a` through the diagonal between `ia` and `ib`.
    fn merge_contours(&mut self, a: usize, b: usize, ia: usize, ib: usize) {
        let b_vertices = std::mem::take(&mut self.contours[b].vertices);
        let a_vertices = &self.contours[a].vertices;
        let mut vertices = Vec::with_capacity(a_vertices.len() + b_vertices.len() + 2);

        // Copy contour A.
        vertices.extend((0..=a_vertices.len()).map(|i| a_vertices[(ia + i) % a_vertices.len()]));
        // Copy contour B
        vertices.extend((0..=b_vertices.len()).map(|i| b_vertices[(ib + i) % b_vertices.len()]));

        self.contours[a].vertices = vertices;
    }
}

#[derive(Debug, Clone, Copy)]
struct PotentialDiagonal {
    vertex: usize,
    dist: i32,
}

/// Sort key of a hole: its lowest x, then lowest z.
type HoleSortKey = (u16, u16);

fn find_left_most_vertex(vertices: &[(U16Vec3, RegionVertexId)]) -> (usize, HoleSortKey) {
    let mut leftmost = 0;
    let mut min = (vertices[0].0.x, vertices[0].0.z);
    for (i, (vertex, _)) in vertices.iter().enumerate().skip(1) {
        if vertex.x < min.0 || (vertex.x == min.0 && vertex.z < min.1) {
            min = (vertex.x, vertex.z);
            leftmost = i;
        }
    }
    (leftmost, min)
}

fn calc_area_of_polygon_2d(vertices: &[(U16Vec3, RegionVertexId)]) -> i32 {
    let n = vertices.len();
    let mut area = 0;
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = xz(vertices[i].0);
        let vj = xz(vertices[j].0);
        area += vi.x * vj.y - vj.x * vi.y;
        j = i;
    }
    (area + 1) / 2
}

#[inline]
fn xz(vertex: U16Vec3) -> IVec2 {
    IVec2::new(vertex.x as i32, vertex.z as i32)
}

#[inline]
pub(crate) fn area2(a: IVec2, b: IVec2, c: IVec2) -> i32 {
    (b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y)
}

/// Returns true iff c is strictly to the left of the directed
/// line through a to b.
#[inline]
pub(crate) fn left(a: IVec2, b: IVec2, c: IVec2) -> bool {
    area2(a, b, c) < 0
}

#[inline]
pub(crate) fn left_on(a: IVec2, b: IVec2, c: IVec2) -> bool {
    area2(a, b, c) <= 0
}

#[inline]
pub(crate) fn collinear(a: IVec2, b: IVec2, c: IVec2) -> bool {
    area2(a, b, c) == 0
}

/// Returns true iff ab properly intersects cd: they share
/// a point interior to both segments. The properness of the
/// intersection is ensured by using strict leftness.
pub(crate) fn intersect_prop(a: IVec2, b: IVec2, c: IVec2, d: IVec2) -> bool {
    // Eliminate improper cases.
    if collinear(a, b, c) || collinear(a, b, d) || collinear(c, d, a) || collinear(c, d, b) {
        return false;
    }
    (left(a, b, c) ^ left(a, b, d)) && (left(c, d, a) ^ left(c, d, b))
}

/// Returns T iff (a,b,c) are collinear and point c lies
/// on the closed segement ab.
pub(crate) fn between(a: IVec2, b: IVec2, c: IVec2) -> bool {
    if !collinear(a, b, c) {
        return false;
    }
    // If ab not vertical, check betweenness on x; else on y.
    if a.x != b.x {
        (a.x <= c.x && c.x <= b.x) || (a.x >= c.x && c.x >= b.x)
    } else {
        (a.y <= c.y && c.y <= b.y) || (a.y >= c.y && c.y >= b.y)
    }
}

/// Returns true iff segments ab and cd intersect, properly or improperly.
pub(crate) fn intersect(a: IVec2, b: IVec2, c: IVec2, d: IVec2) -> bool {
    intersect_prop(a, b, c, d)
        || between(a, b, c)
        || between(a, b, d)
        || between(c, d, a)
        || between(c, d, b)
}

fn intersect_seg_contour(
    d0: IVec2,
    d1: IVec2,
    skip: Option<usize>,
    vertices: &[(U16Vec3, RegionVertexId)],
) -> bool {
    // For each edge (k,k+1) of P
    let n = vertices.len();
    (0..n).any(|k| {
        let k1 = next(k, n);
        // Skip edges incident to i.
        if skip == Some(k) || skip == Some(k1) {
            return false;
        }
        let p0 = xz(vertices[k].0);
        let p1 = xz(vertices[k1].0);
        if d0 == p0 || d1 == p0 || d0 == p1 || d1 == p1 {
            return false;
        }
        intersect(d0, d1, p0, p1)
    })
}

fn in_cone(i: usize, vertices: &[(U16Vec3, RegionVertexId)], pj: IVec2) -> bool {
    let n = vertices.len();
    let pi = xz(vertices[i].0);
    let pi1 = xz(vertices[next(i, n)].0);
    let pin1 = xz(vertices[prev(i, n)].0);

    // If P[i] is a convex vertex [ i+1 left or on (i-1,i) ].
    if left_on(pin1, pi, pi1) {
        return left(pi, pj, pin1) && left(pj, pi, pi1);
    }
    // Assume (i-1,i,i+1) not collinear.
    // else P[i] is reflex.
    !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
}

/// Represents a group of related contours.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ContourSet {
    /// An array of the contours in the set.
    pub contours: Vec<Contour>,
    /// The AABB in world space
    pub aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    pub cell_size: f32,
    /// The height of each cell. (The minimum increment along the y-axis.)
    pub cell_height: f32,
    /// The width of the set. (Along the x-axis in cell units.)
    pub width: u16,
    /// The height of the set. (Along the z-axis in cell units.)
    pub height: u16,
    /// The AABB border size used to generate the source data from which the contours were derived.
    pub border_size: u16,
    /// The max edge error that this contour set was simplified with.
    pub max_error: f32,
}

bitflags::bitflags! {
    /// The region on the far side of a contour edge, together with flags describing the edge's start vertex.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct RegionVertexId: u32 {
        /// No neighboring region, i.e. a solid wall.
        const NONE = 0;

        /// Applied to the region id field of contour vertices in order to extract the region id.
        /// The region id field of a vertex may have several flags applied to it.  So the
        /// fields value can't be used directly.
        const REGION_MASK = 0xffff;

        /// Border vertex flag.
        /// If a region ID has this bit set, then the associated element lies on
        /// a tile border. If a contour vertex's region ID has this bit set, the
        /// vertex will later be removed in order to match the segments and vertices
        /// at tile boundaries.
        /// (Used during the build process.)
        const BORDER_VERTEX = 0x10_000;

        /// Area border flag.
        /// If a region ID has this bit set, then the associated element lies on
        /// the border of an area.
        /// (Used during the region and contour build process.)
        const AREA_BORDER = 0x20_000;
    }
}

impl RegionVertexId {
    /// The region on the far side of the edge, without flags.
    #[inline]
    pub fn region(&self) -> RegionId {
        RegionId::from(*self)
    }
}

impl From<u32> for RegionVertexId {
    fn from(bits: u32) -> Self {
        RegionVertexId::from_bits_retain(bits)
    }
}

impl From<RegionId> for RegionVertexId {
    fn from(region_id: RegionId) -> Self {
        RegionVertexId::from_bits_retain(region_id.bits() as u32)
    }
}

impl From<RegionVertexId> for RegionId {
    fn from(region_vertex_id: RegionVertexId) -> Self {
        let bits = region_vertex_id.bits() & RegionVertexId::REGION_MASK.bits();
        RegionId::from_bits_retain(bits as u16)
    }
}

/// Represents a simple, non-overlapping contour in field space.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Contour {
    /// Simplified contour vertices in voxel coordinates, each with the region on the far side
    /// of the edge that starts at it.
    pub vertices: Vec<(U16Vec3, RegionVertexId)>,
    /// Raw contour vertices and connection data, as traced around the region.
    pub raw_vertices: Vec<(U16Vec3, RegionVertexId)>,
    /// Region ID of the contour.
    pub region: RegionId,
    /// Area type of the contour.
    pub area: AreaType,
}

bitflags::bitflags! {
    /// Contour build flags used in [`CompactHeightfield::build_contours`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct BuildContoursFlags: u8 {
        /// Tessellate solid (impassable) edges during contour simplification.
        const TESSELLATE_SOLID_WALL_EDGES = 1;
        /// Tessellate edges between areas during contour simplification.
        const TESSELLATE_AREA_EDGES = 2;

        /// Default flags for building contours.
        const DEFAULT = Self::TESSELLATE_SOLID_WALL_EDGES.bits();
    }
}

impl Default for BuildContoursFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use crate::{HeightfieldBuilder, SpanBuilder, SpanInsertion};

    use super::*;

    /// A flat field with the cells in `hole` left empty, with every span in region 1.
    fn field_with_hole(size: u16, hole: std::ops::Range<u16>) -> CompactHeightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new([0.0, 0.0, 0.0], [size as f32, 10.0, size as f32]),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        for z in 0..size {
            for x in 0..size {
                if hole.contains(&x) && hole.contains(&z) {
                    continue;
                }
                heightfield
                    .add_span(SpanInsertion {
                        x,
                        z,
                        flag_merge_threshold: 0,
                        span: SpanBuilder {
                            min: 0,
                            max: 1,
                            area: AreaType::DEFAULT_WALKABLE,
                            next: None,
                        }
                        .build(),
                    })
                    .unwrap();
            }
        }
        let mut compact = heightfield.into_compact(2, 1).unwrap();
        for span in &mut compact.spans {
            span.region = RegionId::from(1);
        }
        compact.max_region = RegionId::from(1);
        compact
    }

    fn corners(contour: &Contour) -> Vec<(u16, u16)> {
        let mut corners: Vec<_> = contour
            .vertices
            .iter()
            .map(|(vertex, _)| (vertex.x, vertex.z))
            .collect();
        corners.sort();
        corners
    }

    #[test]
    fn square_region_simplifies_to_its_corners() {
        let compact = field_with_hole(8, 0..0);
        let cset = compact.build_contours(1.3, 0, BuildContoursFlags::DEFAULT);
        assert_eq!(cset.contours.len(), 1);
        let contour = &cset.contours[0];
        assert_eq!(contour.region, RegionId::from(1));
        assert_eq!(contour.area, AreaType::DEFAULT_WALKABLE);
        assert_eq!(corners(contour), vec![(0, 0), (0, 8), (8, 0), (8, 8)]);
        assert!(contour.vertices.iter().all(|(vertex, _)| vertex.y == 1));
        assert!(calc_area_of_polygon_2d(&contour.vertices) > 0);
        // 4 cell edges per side
        assert_eq!(contour.raw_vertices.len(), 32);
    }

    #[test]
    fn long_wall_edges_are_split() {
        let compact = field_with_hole(8, 0..0);
        let cset = compact.build_contours(1.3, 4, BuildContoursFlags::DEFAULT);
        let contour = &cset.contours[0];
        assert_eq!(contour.vertices.len(), 8);
        for (i, (a, _)) in contour.vertices.iter().enumerate() {
            let (b, _) = contour.vertices[next(i, contour.vertices.len())];
            assert!((xz(b) - xz(*a)).length_squared() <= 16);
        }
    }

    #[test]
    fn hole_is_merged_into_outline() {
        let compact = field_with_hole(11, 4..7);
        let cset = compact.build_contours(1.3, 0, BuildContoursFlags::DEFAULT);
        assert_eq!(cset.contours.len(), 1);
        let contour = &cset.contours[0];
        // Outline and hole, each closed by repeating the vertex the bridge starts from.
        assert_eq!(contour.vertices.len(), 4 + 1 + 4 + 1);
        let corners = corners(contour);
        for hole_corner in [(4, 4), (4, 7), (7, 4), (7, 7)] {
            assert!(corners.contains(&hole_corner), "{hole_corner:?}");
        }
    }

    #[test]
    fn portal_vertices_store_the_neighbor_region() {
        let mut compact = field_with_hole(8, 0..0);
        for (x, _, i) in compact.span_indices().collect::<Vec<_>>() {
            if x >= 4 {
                compact.spans[i].region = RegionId::from(2);
            }
        }
        compact.max_region = RegionId::from(2);
        let cset = compact.build_contours(1.3, 0, BuildContoursFlags::DEFAULT);
        assert_eq!(cset.contours.len(), 2);
        let left = cset
            .contours
            .iter()
            .find(|contour| contour.region == RegionId::from(1))
            .unwrap();
        let portal_starts: Vec<_> = left
            .vertices
            .iter()
            .filter(|(_, r)| r.region() == RegionId::from(2))
            .collect();
        assert_eq!(portal_starts.len(), 1);
        assert_eq!(portal_starts[0].0.x, 4);
        assert_eq!(corners(left), vec![(0, 0), (0, 8), (4, 0), (4, 8)]);
    }

    #[test]
    fn border_regions_produce_no_contours() {
        let mut compact = field_with_hole(6, 0..0);
        for span in &mut compact.spans {
            span.region = RegionId::from(1) | RegionId::BORDER_REGION;
        }
        let cset = compact.build_contours(1.3, 0, BuildContoursFlags::DEFAULT);
        assert!(cset.contours.is_empty());
    }

    #[test]
    fn border_size_is_removed_from_vertices_and_bounds() {
        let mut compact = field_with_hole(8, 0..0);
        compact.border_size = 2;
        let cset = compact.build_contours(1.3, 0, BuildContoursFlags::DEFAULT);
        assert_eq!(cset.width, 4);
        assert_eq!(cset.height, 4);
        assert_eq!(cset.aabb.min.x, 2.0);
        assert_eq!(cset.aabb.max.z, 6.0);
        assert!(corners(&cset.contours[0]).contains(&(6, 6)));
    }

    #[test]
    fn geometry_predicates() {
        let a = IVec2::new(0, 0);
        let b = IVec2::new(4, 0);
        assert!(collinear(a, b, IVec2::new(8, 0)));
        assert!(between(a, b, IVec2::new(2, 0)));
        assert!(!between(a, b, IVec2::new(5, 0)));
        assert!(intersect_prop(a, b, IVec2::new(2, -1), IVec2::new(2, 1)));
        assert!(!intersect_prop(a, b, IVec2::new(4, -1), IVec2::new(4, 1)));
        assert!(intersect(a, b, IVec2::new(4, -1), IVec2::new(4, 1)));
        assert_ne!(left(a, b, IVec2::new(2, 1)), left(a, b, IVec2::new(2, -1)));
    }

    #[test]
    fn self_intersecting_loop_is_detected() {
        let bowtie: Vec<_> = [(0, 0), (4, 4), (4, 0), (0, 4)]
            .into_iter()
            .map(|(x, z)| (U16Vec3::new(x, 0, z), RegionVertexId::NONE))
            .collect();
        assert!(contour_self_intersects(&bowtie));
        let square: Vec<_> = [(0, 0), (4, 0), (4, 4), (0, 4)]
            .into_iter()
            .map(|(x, z)| (U16Vec3::new(x, 0, z), RegionVertexId::NONE))
            .collect();
        assert!(!contour_self_intersects(&square));
    }
}
