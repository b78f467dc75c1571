use crate::{AreaType, CompactHeightfield};

impl CompactHeightfield {
    /// Erode the walkable area by agent radius.
    ///
    /// Every walkable span closer than `walkable_radius` cells to a non-walkable span or to the
    /// edge of the walkable surface becomes [`AreaType::NOT_WALKABLE`].
    pub fn erode_walkable_area(&mut self, walkable_radius: u16) {
        let mut distance_to_boundary = vec![u8::MAX; self.spans.len()];

        // Mark boundary cells.
        for (x, z, span_index) in self.span_indices() {
            if !self.areas[span_index].is_walkable() {
                distance_to_boundary[span_index] = 0;
                continue;
            }
            // Check that there is a non-null adjacent span in each of the 4 cardinal directions.
            let neighbor_count = (0..4)
                .filter_map(|direction| self.neighbor(x, z, span_index, direction))
                .filter(|&(_, _, neighbor_index)| self.areas[neighbor_index].is_walkable())
                .count();

            // At least one missing neighbour, so this is a boundary cell.
            if neighbor_count != 4 {
                distance_to_boundary[span_index] = 0;
            }
        }

        self.chamfer_distance(&mut distance_to_boundary, |distance, cost| {
            distance.saturating_add(cost)
        });

        // Erode
        let min_boundary_distance = walkable_radius.saturating_mul(2);
        let mut eroded = 0_usize;
        for (area, distance) in self.areas.iter_mut().zip(&distance_to_boundary) {
            if (*distance as u16) < min_boundary_distance && area.is_walkable() {
                *area = AreaType::NOT_WALKABLE;
                eroded += 1;
            }
        }
        tracing::debug!(eroded, walkable_radius, "Eroded walkable area");
    }

    /// Runs the two-pass chamfer distance transform over the span connections.
    ///
    /// Orthogonal steps cost 2, diagonal steps cost 3.
    /// `add` combines a distance with a step cost and decides how to handle overflow.
    pub(crate) fn chamfer_distance<T: Copy + Ord>(&self, distances: &mut [T], add: impl Fn(T, u8) -> T) {
        let relax = |distances: &mut [T], i: usize, neighbor_index: usize, cost: u8| {
            let new_distance = add(distances[neighbor_index], cost);
            if new_distance < distances[i] {
                distances[i] = new_distance;
            }
        };

        // Pass 1
        for z in 0..self.height {
            for x in 0..self.width {
                for i in self.cell_at(x, z).index_range() {
                    if let Some((ax, az, ai)) = self.neighbor(x, z, i, 0) {
                        // (-1,0)
                        relax(distances, i, ai, 2);
                        // (-1,-1)
                        if let Some((_, _, aai)) = self.neighbor(ax, az, ai, 3) {
                            relax(distances, i, aai, 3);
                        }
                    }
                    if let Some((ax, az, ai)) = self.neighbor(x, z, i, 3) {
                        // (0,-1)
                        relax(distances, i, ai, 2);
                        // (1,-1)
                        if let Some((_, _, aai)) = self.neighbor(ax, az, ai, 2) {
                            relax(distances, i, aai, 3);
                        }
                    }
                }
            }
        }

        // Pass 2
        for z in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                for i in self.cell_at(x, z).index_range() {
                    if let Some((ax, az, ai)) = self.neighbor(x, z, i, 2) {
                        // (1,0)
                        relax(distances, i, ai, 2);
                        // (1,1)
                        if let Some((_, _, aai)) = self.neighbor(ax, az, ai, 1) {
                            relax(distances, i, aai, 3);
                        }
                    }
                    if let Some((ax, az, ai)) = self.neighbor(x, z, i, 1) {
                        // (0,1)
                        relax(distances, i, ai, 2);
                        // (-1,1)
                        if let Some((_, _, aai)) = self.neighbor(ax, az, ai, 0) {
                            relax(distances, i, aai, 3);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Aabb3d, AreaType, HeightfieldBuilder, SpanBuilder, SpanInsertion};

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
                            max: 1,
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

    fn walkable(compact: &CompactHeightfield, x: u16, z: u16) -> bool {
        let index = compact.cell_at(x, z).index() as usize;
        compact.areas[index].is_walkable()
    }

    #[test]
    fn erosion_shrinks_by_radius() {
        let mut compact = flat_field(9);
        compact.erode_walkable_area(2);
        for z in 0..9 {
            for x in 0..9 {
                let expected = (2..7).contains(&x) && (2..7).contains(&z);
                assert_eq!(walkable(&compact, x, z), expected, "({x}, {z})");
            }
        }
    }

    #[test]
    fn zero_radius_keeps_everything() {
        let mut compact = flat_field(4);
        compact.erode_walkable_area(0);
        assert!(compact.areas.iter().all(AreaType::is_walkable));
    }

    #[test]
    fn large_radius_erodes_everything() {
        let mut compact = flat_field(5);
        compact.erode_walkable_area(10);
        assert!(!compact.areas.iter().any(AreaType::is_walkable));
    }
}
