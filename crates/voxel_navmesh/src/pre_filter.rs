//! Filters that run on a [`Heightfield`] before it is compacted.

use crate::{
    heightfield::Heightfield,
    math::{dir_offset_x, dir_offset_z},
    span::{AreaType, Span},
};

impl Heightfield {
    /// Marks non-walkable spans as walkable if their maximum is within `walkable_climb_height` of the
    /// span directly below them. This allows agents to step over low obstacles like curbs.
    pub fn filter_low_hanging_walkable_obstacles(&mut self, walkable_climb_height: u16) {
        for z in 0..self.height {
            for x in 0..self.width {
                let mut previous: Option<(u16, bool, AreaType)> = None;
                let mut span_key = self.span_key_at(x, z);

                // For each span in the column...
                while let Some(key) = span_key {
                    let span = self.span_mut(key);
                    span_key = span.next();
                    let walkable = span.area().is_walkable();

                    // If current span is not walkable, but there is walkable span just below it and the height difference
                    // is small enough for the agent to walk over, mark the current span as walkable too.
                    if let Some((previous_max, previous_walkable, previous_area)) = previous {
                        if !walkable
                            && previous_walkable
                            && span.max() as i32 - previous_max as i32
                                <= walkable_climb_height as i32
                        {
                            span.set_area(previous_area);
                        }
                    }

                    // Copy the original walkable value regardless of whether we changed it.
                    // This prevents multiple consecutive non-walkable spans from being erroneously marked as walkable.
                    previous = Some((span.max(), walkable, span.area()));
                }
            }
        }
    }

    /// Marks spans that are ledges as not walkable.
    ///
    /// A ledge is a span with one or more neighbors whose maximum is further away than `walkable_climb_height`
    /// from the current span's maximum, or whose accessible neighbors are too far apart in height from each other.
    /// Spans next to the edge of the heightfield count as ledges.
    pub fn filter_ledge_spans(&mut self, walkable_height: u16, walkable_climb_height: u16) {
        let walkable_height = walkable_height as i32;
        let walkable_climb_height = walkable_climb_height as i32;
        let max_height = Span::MAX_HEIGHT as i32;

        let mut unwalkable = Vec::new();
        for z in 0..self.height {
            for x in 0..self.width {
                for (span_key, span) in self.column(x, z) {
                    // Skip non-walkable spans
                    if !span.area().is_walkable() {
                        continue;
                    }

                    let floor = span.max() as i32;
                    let ceiling = span
                        .next()
                        .map_or(max_height, |next| self.span(next).min() as i32);

                    // The difference between this walkable area and the lowest neighbor walkable area.
                    // This is the difference between the current span and all neighbor spans that have
                    // enough space for an agent to move between, but not accounting at all for surface slope.
                    let mut lowest_neighbor_floor_difference = max_height;

                    // Min and max height of accessible neighbours.
                    let mut lowest_traversable_neighbor_floor = floor;
                    let mut highest_traversable_neighbor_floor = floor;

                    for direction in 0..4 {
                        let neighbor_x = x as i32 + dir_offset_x(direction) as i32;
                        let neighbor_z = z as i32 + dir_offset_z(direction) as i32;

                        // Skip neighbours which are out of bounds.
                        if !self.contains(neighbor_x, neighbor_z) {
                            lowest_neighbor_floor_difference = -walkable_climb_height - 1;
                            break;
                        }
                        let mut neighbor_spans =
                            self.column(neighbor_x as u16, neighbor_z as u16).peekable();

                        // The most we can step down to the neighbor is the walkable climb distance.
                        // Start with the area under the neighbor span
                        let neighbor_ceiling = neighbor_spans
                            .peek()
                            .map_or(max_height, |(_, neighbor)| neighbor.min() as i32);

                        // Skip neighbour if the gap between the spans is too small.
                        if ceiling.min(neighbor_ceiling) - floor >= walkable_height {
                            lowest_neighbor_floor_difference = -walkable_climb_height - 1;
                            break;
                        }

                        // For each span in the neighboring column...
                        for (_, neighbor) in neighbor_spans {
                            let neighbor_floor = neighbor.max() as i32;
                            let neighbor_ceiling = neighbor
                                .next()
                                .map_or(max_height, |next| self.span(next).min() as i32);

                            // Only consider neighboring areas that have enough overlap to be potentially traversable.
                            if ceiling.min(neighbor_ceiling) - floor.max(neighbor_floor)
                                < walkable_height
                            {
                                // No space to traverse between them.
                                continue;
                            }

                            let neighbor_floor_difference = neighbor_floor - floor;
                            lowest_neighbor_floor_difference =
                                lowest_neighbor_floor_difference.min(neighbor_floor_difference);

                            // Find min/max accessible neighbor height.
                            // Only consider neighbors that are at most walkable_climb_height away.
                            if neighbor_floor_difference.abs() <= walkable_climb_height {
                                // There is space to move to the neighbor cell and the slope isn't too much.
                                lowest_traversable_neighbor_floor =
                                    lowest_traversable_neighbor_floor.min(neighbor_floor);
                                highest_traversable_neighbor_floor =
                                    highest_traversable_neighbor_floor.max(neighbor_floor);
                            } else if neighbor_floor_difference < -walkable_climb_height {
                                // We already know this will be considered a ledge span so we can early-out
                                break;
                            }
                        }
                    }

                    if lowest_neighbor_floor_difference < -walkable_climb_height
                        || highest_traversable_neighbor_floor - lowest_traversable_neighbor_floor
                            > walkable_climb_height
                    {
                        // The current span is close to a ledge or the slope is too steep.
                        unwalkable.push(span_key);
                    }
                }
            }
        }
        for span_key in unwalkable {
            self.span_mut(span_key).set_area(AreaType::NOT_WALKABLE);
        }
    }

    /// Marks walkable spans as not walkable if the clearance above the span is less than the specified `walkable_height`.
    pub fn filter_walkable_low_height_spans(&mut self, walkable_height: u16) {
        let max_height = Span::MAX_HEIGHT as i32;
        let mut too_low = Vec::new();
        for z in 0..self.height {
            for x in 0..self.width {
                for (span_key, span) in self.column(x, z) {
                    let floor = span.max() as i32;
                    let ceiling = span
                        .next()
                        .map_or(max_height, |next| self.span(next).min() as i32);
                    if ceiling - floor < walkable_height as i32 {
                        too_low.push(span_key);
                    }
                }
            }
        }
        for span_key in too_low {
            self.span_mut(span_key).set_area(AreaType::NOT_WALKABLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Aabb3d, HeightfieldBuilder, SpanBuilder, SpanInsertion};

    fn heightfield(size: f32) -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d::new([0.0, 0.0, 0.0], [size, 100.0, size]),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap()
    }

    fn insert(heightfield: &mut Heightfield, x: u16, z: u16, min: u16, max: u16, area: AreaType) {
        heightfield
            .add_span(SpanInsertion {
                x,
                z,
                flag_merge_threshold: 0,
                span: SpanBuilder {
                    min,
                    max,
                    area,
                    next: None,
                }
                .build(),
            })
            .unwrap();
    }

    fn areas(heightfield: &Heightfield, x: u16, z: u16) -> Vec<AreaType> {
        heightfield.column(x, z).map(|(_, span)| span.area()).collect()
    }

    #[test]
    fn low_hanging_obstacle_becomes_walkable() {
        let mut heightfield = heightfield(1.0);
        insert(&mut heightfield, 0, 0, 0, 10, AreaType(7));
        insert(&mut heightfield, 0, 0, 11, 12, AreaType::NOT_WALKABLE);
        insert(&mut heightfield, 0, 0, 13, 14, AreaType::NOT_WALKABLE);
        heightfield.filter_low_hanging_walkable_obstacles(2);
        // Only the first obstacle is reachable, the one above it stacks on a non-walkable span.
        assert_eq!(
            areas(&heightfield, 0, 0),
            vec![AreaType(7), AreaType(7), AreaType::NOT_WALKABLE]
        );
    }

    #[test]
    fn high_obstacle_stays_unwalkable() {
        let mut heightfield = heightfield(1.0);
        insert(&mut heightfield, 0, 0, 0, 10, AreaType(7));
        insert(&mut heightfield, 0, 0, 11, 15, AreaType::NOT_WALKABLE);
        heightfield.filter_low_hanging_walkable_obstacles(2);
        assert_eq!(
            areas(&heightfield, 0, 0),
            vec![AreaType(7), AreaType::NOT_WALKABLE]
        );
    }

    #[test]
    fn low_ceiling_makes_span_unwalkable() {
        let mut heightfield = heightfield(1.0);
        insert(&mut heightfield, 0, 0, 0, 10, AreaType(7));
        insert(&mut heightfield, 0, 0, 12, 20, AreaType(7));
        heightfield.filter_walkable_low_height_spans(3);
        assert_eq!(
            areas(&heightfield, 0, 0),
            vec![AreaType::NOT_WALKABLE, AreaType(7)]
        );
    }

    #[test]
    fn ledges_and_field_borders_are_unwalkable() {
        let mut heightfield = heightfield(5.0);
        for z in 0..5 {
            for x in 0..5 {
                // A pillar in the middle of a flat floor
                let top = if x == 2 && z == 2 { 30 } else { 10 };
                insert(&mut heightfield, x, z, 0, top, AreaType(7));
            }
        }
        heightfield.filter_ledge_spans(3, 2);
        for z in 0..5 {
            for x in 0..5 {
                let area = areas(&heightfield, x, z)[0];
                let is_border = x == 0 || z == 0 || x == 4 || z == 4;
                if is_border || (x == 2 && z == 2) {
                    assert_eq!(area, AreaType::NOT_WALKABLE, "({x}, {z})");
                } else {
                    // The pillar is a wall, not a drop, so its neighbors stay walkable.
                    assert_eq!(area, AreaType(7), "({x}, {z})");
                }
            }
        }
    }
}
