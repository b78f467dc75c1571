//! Triangle rasterization into a [`Heightfield`].

use glam::Vec3A;
use thiserror::Error;

use crate::{
    heightfield::{Heightfield, SpanInsertion, SpanInsertionError},
    math::TriangleVertices as _,
    span::{AreaType, Span, SpanBuilder},
    trimesh::TriMesh,
};

impl Heightfield {
    /// Rasterizes all triangles of a [`TriMesh`] into the heightfield.
    ///
    /// Spans of the same column that overlap are merged. See [`Heightfield::add_span`] for how
    /// `flag_merge_threshold` decides which [`AreaType`] survives the merge.
    ///
    /// # Errors
    ///
    /// Returns an error if an index points outside the vertex list or a triangle has no area type.
    pub fn rasterize_triangles(
        &mut self,
        trimesh: &TriMesh,
        flag_merge_threshold: u16,
    ) -> Result<(), RasterizationError> {
        for (i, indices) in trimesh.indices.iter().enumerate() {
            let vertex = |index: u32| {
                trimesh.vertices.get(index as usize).copied().ok_or(
                    RasterizationError::VertexIndexOutOfBounds {
                        triangle: i,
                        index,
                        vertex_count: trimesh.vertices.len(),
                    },
                )
            };
            let triangle = [vertex(indices.x)?, vertex(indices.y)?, vertex(indices.z)?];
            let area_type = *trimesh
                .area_types
                .get(i)
                .ok_or(RasterizationError::MissingAreaType { triangle: i })?;
            self.rasterize_triangle(triangle, area_type, flag_merge_threshold)?;
        }
        Ok(())
    }

    /// Rasterizes a single triangle into the heightfield.
    ///
    /// Degenerate triangles and triangles outside the heightfield bounds are skipped.
    pub fn rasterize_triangle(
        &mut self,
        triangle: [Vec3A; 3],
        area_type: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), RasterizationError> {
        if triangle.is_degenerate() {
            tracing::trace!(?triangle, "Skipping degenerate triangle");
            return Ok(());
        }
        let triangle_aabb = triangle.aabb();
        if !self.aabb.intersects(&triangle_aabb) {
            return Ok(());
        }

        let inverse_cell_size = 1.0 / self.cell_size;
        let inverse_cell_height = 1.0 / self.cell_height;
        let aabb_min = Vec3A::from(self.aabb.min);
        let by = self.aabb.max.y - self.aabb.min.y;
        let width = self.width as i32;
        let height = self.height as i32;

        // Calculate the footprint of the triangle on the grid's z-axis
        let z0 = ((triangle_aabb.min.z - self.aabb.min.z) * inverse_cell_size) as i32;
        let z1 = ((triangle_aabb.max.z - self.aabb.min.z) * inverse_cell_size) as i32;

        // Use -1 rather than 0 to cut the polygon properly at the start of the tile
        let z0 = z0.clamp(-1, height - 1);
        let z1 = z1.clamp(0, height - 1);

        // Clip the triangle into all grid cells it touches.
        let mut input: Vec<Vec3A> = triangle.to_vec();
        for z in z0..=z1 {
            // Clip polygon to row. Store the remaining polygon as well
            let cell_z = self.aabb.min.z + z as f32 * self.cell_size;
            let (row, rest) = divide_poly(&input, cell_z + self.cell_size, Axis::Z);
            input = rest;
            if row.len() < 3 || z < 0 {
                continue;
            }

            // find X-axis bounds of the row
            let (min_x, max_x) = row
                .iter()
                .fold((row[0].x, row[0].x), |(min, max), v| (min.min(v.x), max.max(v.x)));
            let x0 = ((min_x - self.aabb.min.x) * inverse_cell_size) as i32;
            let x1 = ((max_x - self.aabb.min.x) * inverse_cell_size) as i32;
            if x1 < 0 || x0 >= width {
                continue;
            }
            let x0 = x0.clamp(-1, width - 1);
            let x1 = x1.clamp(0, width - 1);

            let mut row_rest = row;
            for x in x0..=x1 {
                // Clip polygon to column. Store the remaining polygon as well
                let cx = self.aabb.min.x + x as f32 * self.cell_size;
                let (cell, rest) = divide_poly(&row_rest, cx + self.cell_size, Axis::X);
                row_rest = rest;
                if cell.len() < 3 || x < 0 {
                    continue;
                }

                // Calculate min and max of the span.
                let (span_min, span_max) = cell
                    .iter()
                    .fold((cell[0].y, cell[0].y), |(min, max), v| {
                        (min.min(v.y), max.max(v.y))
                    });
                let span_min = span_min - aabb_min.y;
                let span_max = span_max - aabb_min.y;

                // Skip the span if it's completely outside the heightfield bounding box
                if span_max < 0.0 || span_min > by {
                    continue;
                }

                // Clamp the span to the heightfield bounding box.
                let span_min = span_min.max(0.0);
                let span_max = span_max.min(by);

                // Snap the span to the heightfield height grid.
                let span_min_cell_index = ((span_min * inverse_cell_height).floor() as i32)
                    .clamp(0, Span::MAX_HEIGHT as i32 - 1);
                let span_max_cell_index = ((span_max * inverse_cell_height).ceil() as i32)
                    .clamp(span_min_cell_index + 1, Span::MAX_HEIGHT as i32);

                self.add_span(SpanInsertion {
                    x: x as u16,
                    z: z as u16,
                    flag_merge_threshold,
                    span: SpanBuilder {
                        min: span_min_cell_index as u16,
                        max: span_max_cell_index as u16,
                        area: area_type,
                        next: None,
                    }
                    .build(),
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Z,
}

/// Divides a convex polygon of max 12 vertices into two convex polygons
/// across a separating axis.
///
/// Returns the part below `axis_offset` and the part above it.
fn divide_poly(input: &[Vec3A], axis_offset: f32, axis: Axis) -> (Vec<Vec3A>, Vec<Vec3A>) {
    let component = |v: &Vec3A| match axis {
        Axis::X => v.x,
        Axis::Z => v.z,
    };
    // How far positive or negative away from the separating axis is each vertex.
    let deltas: Vec<f32> = input.iter().map(|v| axis_offset - component(v)).collect();

    let mut below = Vec::with_capacity(input.len() + 2);
    let mut above = Vec::with_capacity(input.len() + 2);
    let Some(mut b) = input.len().checked_sub(1) else {
        return (below, above);
    };
    for a in 0..input.len() {
        // Two vertices on the same side of the separating axis won't need a split.
        let same_side = (deltas[a] >= 0.0) == (deltas[b] >= 0.0);
        if !same_side {
            // Add the intersection point to both polygons.
            let s = deltas[b] / (deltas[b] - deltas[a]);
            let intersection = input[b] + (input[a] - input[b]) * s;
            below.push(intersection);
            above.push(intersection);

            // Add the vertex to the polygon it belongs to. Vertices on the axis were already
            // added as the intersection.
            if deltas[a] > 0.0 {
                below.push(input[a]);
            } else if deltas[a] < 0.0 {
                above.push(input[a]);
            }
        } else {
            // Add the vertex to the correct polygon
            if deltas[a] >= 0.0 {
                below.push(input[a]);
                if deltas[a] != 0.0 {
                    b = a;
                    continue;
                }
            }
            above.push(input[a]);
        }
        b = a;
    }
    (below, above)
}

/// Errors that can occur when rasterizing triangles into a [`Heightfield`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RasterizationError {
    /// A triangle references a vertex that does not exist.
    #[error("triangle {triangle} references vertex {index}, but there are only {vertex_count} vertices")]
    VertexIndexOutOfBounds {
        /// The index of the offending triangle
        triangle: usize,
        /// The offending vertex index
        index: u32,
        /// The number of vertices in the mesh
        vertex_count: usize,
    },
    /// A triangle has no entry in [`TriMesh::area_types`].
    #[error("triangle {triangle} has no area type")]
    MissingAreaType {
        /// The index of the offending triangle
        triangle: usize,
    },
    /// Inserting a rasterized span failed.
    #[error(transparent)]
    SpanInsertion(#[from] SpanInsertionError),
}

#[cfg(test)]
mod tests {
    use glam::UVec3;

    use super::*;
    use crate::{Aabb3d, HeightfieldBuilder};

    fn heightfield() -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d::new([0.0, 0.0, 0.0], [10.0, 10.0, 10.0]),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap()
    }

    fn quad(y: f32, area: AreaType) -> TriMesh {
        TriMesh {
            vertices: vec![
                Vec3A::new(0.0, y, 0.0),
                Vec3A::new(10.0, y, 0.0),
                Vec3A::new(10.0, y, 10.0),
                Vec3A::new(0.0, y, 10.0),
            ],
            indices: vec![UVec3::new(0, 2, 1), UVec3::new(0, 3, 2)],
            area_types: vec![area; 2],
        }
    }

    #[test]
    fn divide_poly_splits_triangle() {
        let triangle = [
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(2.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 2.0),
        ];
        let (below, above) = divide_poly(&triangle, 1.0, Axis::X);
        assert!(below.iter().all(|v| v.x <= 1.0));
        assert!(above.iter().all(|v| v.x >= 1.0));
        assert_eq!(below.len(), 4);
        assert_eq!(above.len(), 3);
    }

    #[test]
    fn flat_quad_covers_every_column() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_triangles(&quad(2.5, AreaType::DEFAULT_WALKABLE), 1)
            .unwrap();
        for z in 0..heightfield.height {
            for x in 0..heightfield.width {
                let spans: Vec<_> = heightfield.column(x, z).collect();
                assert_eq!(spans.len(), 1, "column ({x}, {z})");
                let span = spans[0].1;
                assert_eq!(span.min(), 2);
                assert_eq!(span.max(), 3);
                assert_eq!(span.area(), AreaType::DEFAULT_WALKABLE);
            }
        }
    }

    #[test]
    fn stacked_quads_stay_separate() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_triangles(&quad(1.5, AreaType::DEFAULT_WALKABLE), 1)
            .unwrap();
        heightfield
            .rasterize_triangles(&quad(6.5, AreaType(3)), 1)
            .unwrap();
        let spans: Vec<_> = heightfield.column(4, 4).map(|(_, span)| span.clone()).collect();
        assert_eq!(spans.len(), 2);
        assert!(spans[0].max() < spans[1].min());
        assert_eq!(spans[1].area(), AreaType(3));
    }

    #[test]
    fn degenerate_and_outside_triangles_are_skipped() {
        let mut heightfield = heightfield();
        let degenerate = [
            Vec3A::new(1.0, 1.0, 1.0),
            Vec3A::new(2.0, 1.0, 2.0),
            Vec3A::new(3.0, 1.0, 3.0),
        ];
        heightfield
            .rasterize_triangle(degenerate, AreaType::DEFAULT_WALKABLE, 1)
            .unwrap();
        let outside = [
            Vec3A::new(20.0, 1.0, 20.0),
            Vec3A::new(22.0, 1.0, 20.0),
            Vec3A::new(20.0, 1.0, 22.0),
        ];
        heightfield
            .rasterize_triangle(outside, AreaType::DEFAULT_WALKABLE, 1)
            .unwrap();
        assert!(heightfield.allocated_spans.is_empty());
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let mut heightfield = heightfield();
        let mut trimesh = quad(1.0, AreaType::DEFAULT_WALKABLE);
        trimesh.indices.push(UVec3::new(0, 1, 7));
        trimesh.area_types.push(AreaType::DEFAULT_WALKABLE);
        let result = heightfield.rasterize_triangles(&trimesh, 1);
        assert_eq!(
            result,
            Err(RasterizationError::VertexIndexOutOfBounds {
                triangle: 2,
                index: 7,
                vertex_count: 4
            })
        );
    }

    #[test]
    fn spans_are_sorted_and_non_overlapping() {
        let mut heightfield = heightfield();
        let slope = TriMesh {
            vertices: vec![
                Vec3A::new(0.0, 0.0, 0.0),
                Vec3A::new(10.0, 8.0, 0.0),
                Vec3A::new(10.0, 8.0, 10.0),
                Vec3A::new(0.0, 0.0, 10.0),
            ],
            indices: vec![UVec3::new(0, 2, 1), UVec3::new(0, 3, 2)],
            area_types: vec![AreaType::DEFAULT_WALKABLE; 2],
        };
        heightfield.rasterize_triangles(&slope, 1).unwrap();
        heightfield
            .rasterize_triangles(&quad(9.5, AreaType::DEFAULT_WALKABLE), 1)
            .unwrap();
        for z in 0..heightfield.height {
            for x in 0..heightfield.width {
                let spans: Vec<_> = heightfield.column(x, z).map(|(_, s)| s).collect();
                for span in &spans {
                    assert!(span.min() < span.max());
                }
                for pair in spans.windows(2) {
                    assert!(pair[0].max() < pair[1].min());
                }
            }
        }
    }
}
