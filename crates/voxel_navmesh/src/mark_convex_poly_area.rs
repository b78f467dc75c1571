use glam::{Vec2, Vec3Swizzles as _};

use crate::{AreaType, CompactHeightfield, math::Aabb2d};

impl CompactHeightfield {
    /// Sets the [`AreaType`] of the walkable spans within the given convex volume.
    ///
    /// Spans that were already eroded or filtered away stay untouched.
    pub fn mark_convex_poly_area(&mut self, volume: &ConvexVolume) {
        // Compute the bounding box of the polygon
        let Some(aabb) = Aabb2d::from_verts(&volume.vertices) else {
            // The volume is empty
            return;
        };
        let origin = self.aabb.min.xz();

        // Compute the grid footprint of the polygon
        let min = (aabb.min - origin) / self.cell_size;
        let max = (aabb.max - origin) / self.cell_size;
        let min_y = ((volume.min_y - self.aabb.min.y) / self.cell_height) as i32;
        let max_y = ((volume.max_y - self.aabb.min.y) / self.cell_height) as i32;
        let (min_x, min_z) = (min.x as i32, min.y as i32);
        let (max_x, max_z) = (max.x as i32, max.y as i32);

        // Early-out if the polygon lies entirely outside the grid.
        if max_x < 0 || min_x >= self.width as i32 || max_z < 0 || min_z >= self.height as i32 {
            return;
        }

        // Clamp the polygon footprint to the grid
        let min_x = min_x.max(0) as u16;
        let max_x = max_x.min(self.width as i32 - 1) as u16;
        let min_z = min_z.max(0) as u16;
        let max_z = max_z.min(self.height as i32 - 1) as u16;

        let mut marked = 0_usize;
        for z in min_z..=max_z {
            for x in min_x..=max_x {
                for i in self.cell_at(x, z).index_range() {
                    // Skip if span is removed.
                    if !self.areas[i].is_walkable() {
                        continue;
                    }

                    // Skip if y extents don't overlap.
                    let y = self.spans[i].y as i32;
                    if y < min_y || y > max_y {
                        continue;
                    }

                    let point = origin + (Vec2::new(x as f32, z as f32) + 0.5) * self.cell_size;
                    if point_in_poly(point, &volume.vertices) {
                        self.areas[i] = volume.area;
                        marked += 1;
                    }
                }
            }
        }
        tracing::debug!(marked, area = volume.area.0, "Marked convex volume");
    }
}

/// Even-odd test on the xz-plane.
fn point_in_poly(point: Vec2, vertices: &[Vec2]) -> bool {
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for (i, vi) in vertices.iter().enumerate() {
        let vj = vertices[j];
        if ((vi.y > point.y) != (vj.y > point.y))
            && (point.x < (vj.x - vi.x) * (point.y - vi.y) / (vj.y - vi.y) + vi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// A convex prism on the xz-plane that overrides the [`AreaType`] of the spans within it.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvexVolume {
    /// The outline of the volume on the xz-plane, stored as `x` and `y`.
    pub vertices: Vec<Vec2>,
    /// The world-space height of the volume's floor.
    pub min_y: f32,
    /// The world-space height of the volume's ceiling.
    pub max_y: f32,
    /// The area type to apply to the spans inside the volume.
    pub area: AreaType,
}

#[cfg(test)]
mod tests {
    use crate::{Aabb3d, HeightfieldBuilder, SpanBuilder, SpanInsertion};

    use super::*;

    fn flat_field(size: u16) -> CompactHeightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new([0.0, 0.0, 0.0], [size as f32, 10.0, size as f32]),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        for z in 0..size {
            for x in 0..size {
                heightfield
                    .add_span(SpanInsertion {
                        x,
                        z,
                        flag_merge_threshold: 0,
                        span: SpanBuilder {
                            min: 0,
                            max: 2,
                            area: AreaType::DEFAULT_WALKABLE,
                            next: None,
                        }
                        .build(),
                    })
                    .unwrap();
            }
        }
        heightfield.into_compact(2, 1).unwrap()
    }

    #[test]
    fn marks_spans_inside_volume() {
        let mut compact = flat_field(6);
        let volume = ConvexVolume {
            vertices: vec![
                Vec2::new(1.0, 1.0),
                Vec2::new(3.0, 1.0),
                Vec2::new(3.0, 3.0),
                Vec2::new(1.0, 3.0),
            ],
            min_y: 0.0,
            max_y: 5.0,
            area: AreaType(9),
        };
        compact.mark_convex_poly_area(&volume);
        for (x, z, i) in compact.span_indices() {
            let inside = (1..3).contains(&x) && (1..3).contains(&z);
            let expected = if inside {
                AreaType(9)
            } else {
                AreaType::DEFAULT_WALKABLE
            };
            assert_eq!(compact.areas[i], expected, "({x}, {z})");
        }
    }

    #[test]
    fn volume_above_spans_changes_nothing() {
        let mut compact = flat_field(4);
        let volume = ConvexVolume {
            vertices: vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(4.0, 0.0),
                Vec2::new(4.0, 4.0),
                Vec2::new(0.0, 4.0),
            ],
            min_y: 5.0,
            max_y: 8.0,
            area: AreaType(9),
        };
        compact.mark_convex_poly_area(&volume);
        assert!(compact.areas.iter().all(|&area| area == AreaType::DEFAULT_WALKABLE));
    }

    #[test]
    fn even_odd_point_test() {
        let triangle = [Vec2::ZERO, Vec2::new(4.0, 0.0), Vec2::new(0.0, 4.0)];
        assert!(point_in_poly(Vec2::new(1.0, 1.0), &triangle));
        assert!(!point_in_poly(Vec2::new(3.0, 3.0), &triangle));
    }
}
