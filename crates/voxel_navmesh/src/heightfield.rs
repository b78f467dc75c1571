//! The heightfield module contains the types and functions for working with [`Heightfield`]s.
//!
//! A heightfield is a 3D grid of [`Span`]s, where each column contains 0, 1, or more spans.

use thiserror::Error;

use crate::{
    Aabb3d,
    span::{Span, SpanKey, Spans},
};

/// A dynamic heightfield representing obstructed space.
/// Corresponds to <https://github.com/recastnavigation/recastnavigation/blob/bd98d84c274ee06842bf51a4088ca82ac71f8c2d/Recast/Include/Recast.h#L312>
/// Build with [`HeightfieldBuilder`].
#[derive(Debug, Clone)]
pub struct Heightfield {
    /// The width of the heightfield along the x-axis in cell units
    pub width: u16,
    /// The height of the heightfield along the z-axis in cell units
    pub height: u16,
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
    /// The indices to the spans in the heightfield in width*height order
    /// Each index corresponds to a column in the heightfield by pointing to the lowest span in the column
    pub spans: Vec<Option<SpanKey>>,
    /// All spans in the heightfield
    pub allocated_spans: Spans,
}

impl Heightfield {
    /// Inserts a span into its column, merging it with every span it overlaps or touches.
    ///
    /// The merged span keeps the larger extent. If the merged top is within
    /// `flag_merge_threshold` of the existing span's top, the higher [`AreaType`](crate::AreaType) wins,
    /// otherwise the new span's area is kept.
    pub fn add_span(&mut self, insertion: SpanInsertion) -> Result<(), SpanInsertionError> {
        if insertion.x >= self.width || insertion.z >= self.height {
            return Err(SpanInsertionError::ColumnIndexOutOfBounds {
                x: insertion.x,
                z: insertion.z,
            });
        }
        let column_index = self.column_index(insertion.x, insertion.z);

        let mut new_span = insertion.span;
        let mut previous_span_key = None;
        let mut current_span_key_iter = self.spans[column_index];
        // Insert the new span, possibly merging it with existing spans.
        while let Some(current_span_key) = current_span_key_iter {
            let current_span = self.span(current_span_key);
            current_span_key_iter = current_span.next();
            if current_span.min() > new_span.max() {
                // Current span is completely above the new span, break.
                break;
            }
            if current_span.max() < new_span.min() {
                // Current span is completely below the new span. Keep going.
                previous_span_key = Some(current_span_key);
                continue;
            }
            // The new span overlaps with an existing span. Merge them.
            let current_max = current_span.max();
            let current_area = current_span.area();
            new_span.set_min(new_span.min().min(current_span.min()));
            new_span.set_max(new_span.max().max(current_max));

            // Merge flags.
            if (new_span.max() as i32 - current_max as i32).unsigned_abs()
                <= insertion.flag_merge_threshold as u32
            {
                // Higher area ID numbers indicate higher resolution priority.
                new_span.set_area(new_span.area().max(current_area));
            }

            // Remove the current span since it's now merged with the new span.
            // Keep going because there might be other overlapping spans that also need to be merged.
            self.allocated_spans.remove(current_span_key);
            if let Some(previous_span_key) = previous_span_key {
                self.span_mut(previous_span_key)
                    .set_next(current_span_key_iter);
            } else {
                self.spans[column_index] = current_span_key_iter;
            }
        }

        if let Some(previous_span_key) = previous_span_key {
            // Insert new span after prev
            new_span.set_next(self.span(previous_span_key).next());
            let new_span_key = self.allocated_spans.insert(new_span);
            self.span_mut(previous_span_key).set_next(new_span_key);
        } else {
            // This span should go before the others in the list
            new_span.set_next(self.spans[column_index]);
            let new_span_key = self.allocated_spans.insert(new_span);
            self.spans[column_index] = Some(new_span_key);
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn column_index(&self, x: u16, z: u16) -> usize {
        x as usize + z as usize * self.width as usize
    }

    #[inline]
    pub(crate) fn contains(&self, x: i32, z: i32) -> bool {
        x >= 0 && x < self.width as i32 && z >= 0 && z < self.height as i32
    }

    /// Returns the key of the lowest span in the column at the given coordinates.
    /// `None` if either the index is out of bounds or there is no span in the column.
    #[inline]
    pub fn span_key_at(&self, x: u16, z: u16) -> Option<SpanKey> {
        if x >= self.width || z >= self.height {
            return None;
        }
        self.spans[self.column_index(x, z)]
    }

    /// Returns the lowest span at the given coordinates.
    /// `None` if either the index is out of bounds or there is no span in the column.
    #[inline]
    pub fn span_at(&self, x: u16, z: u16) -> Option<&Span> {
        let span_key = self.span_key_at(x, z)?;
        Some(self.span(span_key))
    }

    /// Iterates over the spans of a column from bottom to top.
    /// Out of bounds coordinates yield an empty iterator.
    pub fn column(&self, x: u16, z: u16) -> impl Iterator<Item = (SpanKey, &Span)> + '_ {
        std::iter::successors(
            self.span_key_at(x, z).map(|key| (key, self.span(key))),
            |(_, span)| span.next().map(|key| (key, self.span(key))),
        )
    }

    /// Returns a reference to the span with the given key.
    /// # Panics
    /// Panics if the key is not found.
    #[inline]
    pub fn span(&self, key: SpanKey) -> &Span {
        &self.allocated_spans[key]
    }

    /// Returns a mutable reference to the span with the given key.
    /// # Panics
    /// Panics if the key is not found.
    #[inline]
    pub fn span_mut(&mut self, key: SpanKey) -> &mut Span {
        &mut self.allocated_spans[key]
    }
}

/// A builder for [`Heightfield`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightfieldBuilder {
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
}

impl HeightfieldBuilder {
    /// Builds the heightfield.
    pub fn build(self) -> Result<Heightfield, HeightfieldBuilderError> {
        if !(self.cell_size > 0.0 && self.cell_height > 0.0) {
            return Err(HeightfieldBuilderError::InvalidCellSize {
                cell_size: self.cell_size,
                cell_height: self.cell_height,
            });
        }
        let width = (self.aabb.max.x - self.aabb.min.x) / self.cell_size + 0.5;
        let height = (self.aabb.max.z - self.aabb.min.z) / self.cell_size + 0.5;
        if !(width >= 0.0 && height >= 0.0)
            || width > u16::MAX as f32
            || height > u16::MAX as f32
        {
            return Err(HeightfieldBuilderError::ColumnCountTooLarge { width, height });
        }
        let column_count = width as usize * height as usize;
        Ok(Heightfield {
            width: width as u16,
            height: height as u16,
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            spans: vec![None; column_count],
            allocated_spans: Spans::with_min_capacity(column_count),
        })
    }
}

/// Errors that can occur when building a [`Heightfield`] with [`HeightfieldBuilder::build`].
#[derive(Error, Debug)]
pub enum HeightfieldBuilderError {
    /// Happens when the grid would not fit the 16 bit cell coordinates.
    #[error("Column count is too large, got {width}*{height} but each axis is limited to {max}", max = u16::MAX)]
    ColumnCountTooLarge {
        /// The width of the heightfield along the x-axis in cell units
        width: f32,
        /// The height of the heightfield along the z-axis in cell units
        height: f32,
    },
    /// Happens when the cell size or height is not positive.
    #[error("Cell size and height must be positive, got {cell_size} and {cell_height}")]
    InvalidCellSize {
        /// The requested xz-plane cell size
        cell_size: f32,
        /// The requested y-axis cell size
        cell_height: f32,
    },
}

/// Errors that can occur when inserting a span into a [`Heightfield`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpanInsertionError {
    /// Happens when the column index is out of bounds.
    #[error("column index out of bounds: x={x}, z={z}")]
    ColumnIndexOutOfBounds {
        /// The x-coordinate of the span
        x: u16,
        /// The z-coordinate of the span
        z: u16,
    },
}

/// A span to insert with [`Heightfield::add_span`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanInsertion {
    /// The x-coordinate of the span
    pub x: u16,
    /// The z-coordinate of the span
    pub z: u16,
    /// Maximum difference between the ceilings of two spans to merge area type IDs
    pub flag_merge_threshold: u16,
    /// The span to insert
    pub span: Span,
}

#[cfg(test)]
mod tests {
    use glam::Vec3A;

    use crate::{
        Aabb3d,
        span::{AreaType, SpanBuilder},
    };

    use super::*;

    fn height_field() -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3A::ZERO, [5.0, 5.0, 5.0]),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap()
    }

    fn span_low() -> SpanBuilder {
        SpanBuilder {
            min: 2,
            max: 4,
            area: AreaType(2),
            next: None,
        }
    }

    fn span_mid() -> SpanBuilder {
        SpanBuilder {
            min: 4,
            max: 7,
            area: AreaType(3),
            next: None,
        }
    }

    fn span_high() -> SpanBuilder {
        SpanBuilder {
            min: 9,
            max: 12,
            area: AreaType(2),
            next: None,
        }
    }

    fn insert(heightfield: &mut Heightfield, x: u16, z: u16, span: Span) {
        heightfield
            .add_span(SpanInsertion {
                x,
                z,
                flag_merge_threshold: 0,
                span,
            })
            .unwrap();
    }

    #[test]
    fn can_create_heightfield() {
        let heightfield = height_field();
        assert_eq!(heightfield.width, 5);
        assert_eq!(heightfield.height, 5);
        assert_eq!(heightfield.spans.len(), 25);
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        let result = HeightfieldBuilder {
            aabb: Aabb3d::new(Vec3A::ZERO, [5.0, 5.0, 5.0]),
            cell_size: 0.0,
            cell_height: 1.0,
        }
        .build();
        assert!(matches!(
            result,
            Err(HeightfieldBuilderError::InvalidCellSize { .. })
        ));
    }

    #[test]
    fn can_add_span() {
        let mut heightfield = height_field();
        let expected_span = span_low().build();
        insert(&mut heightfield, 1, 3, expected_span.clone());
        let span = heightfield.span_at(1, 3).unwrap();
        assert_eq!(*span, expected_span);

        let empty_span = heightfield.span_at(3, 1);
        assert_eq!(empty_span, None);
    }

    #[test]
    fn rejects_out_of_bounds_span() {
        let mut heightfield = height_field();
        let result = heightfield.add_span(SpanInsertion {
            x: 5,
            z: 0,
            flag_merge_threshold: 0,
            span: span_low().build(),
        });
        assert_eq!(
            result,
            Err(SpanInsertionError::ColumnIndexOutOfBounds { x: 5, z: 0 })
        );
    }

    #[test]
    fn can_add_multiple_spans_next_to_each_other() {
        let mut heightfield = height_field();
        let expected_span_1 = span_low().build();
        insert(&mut heightfield, 1, 3, expected_span_1.clone());
        let expected_span_2 = span_mid().build();
        insert(&mut heightfield, 2, 3, expected_span_2.clone());

        assert_eq!(*heightfield.span_at(1, 3).unwrap(), expected_span_1);
        assert_eq!(*heightfield.span_at(2, 3).unwrap(), expected_span_2);
    }

    #[test]
    fn can_add_higher_span_in_same_column() {
        let mut heightfield = height_field();
        let span_low = span_low().build();
        insert(&mut heightfield, 1, 3, span_low.clone());
        let span_high = span_high().build();
        insert(&mut heightfield, 1, 3, span_high.clone());

        let column: Vec<_> = heightfield.column(1, 3).map(|(_, span)| span).collect();
        assert_eq!(column.len(), 2);
        assert_eq_without_next(column[0], &span_low);
        assert_eq_without_next(column[1], &span_high);
    }

    #[test]
    fn can_add_lower_span_in_same_column() {
        let mut heightfield = height_field();
        let span_high = span_high().build();
        insert(&mut heightfield, 1, 3, span_high.clone());
        let span_low = span_low().build();
        insert(&mut heightfield, 1, 3, span_low.clone());

        let column: Vec<_> = heightfield.column(1, 3).map(|(_, span)| span).collect();
        assert_eq!(column.len(), 2);
        assert_eq_without_next(column[0], &span_low);
        assert_eq_without_next(column[1], &span_high);
    }

    #[test]
    fn can_merge_touching_spans() {
        let mut heightfield = height_field();
        let span_low = span_low().build();
        insert(&mut heightfield, 1, 3, span_low.clone());
        let span_mid = span_mid().build();
        insert(&mut heightfield, 1, 3, span_mid.clone());

        let merged_span = SpanBuilder {
            min: span_low.min(),
            max: span_mid.max(),
            area: span_mid.area(),
            next: None,
        }
        .build();

        assert_eq!(*heightfield.span_at(1, 3).unwrap(), merged_span);
        assert_eq!(heightfield.allocated_spans.len(), 1);
    }

    #[test]
    fn merge_bridges_multiple_spans() {
        let mut heightfield = height_field();
        insert(&mut heightfield, 0, 0, span_low().build());
        insert(&mut heightfield, 0, 0, span_high().build());
        insert(
            &mut heightfield,
            0,
            0,
            SpanBuilder {
                min: 3,
                max: 10,
                area: AreaType(1),
                next: None,
            }
            .build(),
        );
        let column: Vec<_> = heightfield.column(0, 0).map(|(_, span)| span).collect();
        assert_eq!(column.len(), 1);
        assert_eq!(column[0].min(), 2);
        assert_eq!(column[0].max(), 12);
        assert_eq!(heightfield.allocated_spans.len(), 1);
    }

    #[test]
    fn higher_area_wins_within_merge_threshold() {
        let mut heightfield = height_field();
        let base = SpanBuilder {
            min: 0,
            max: 10,
            area: AreaType(5),
            next: None,
        };
        insert(&mut heightfield, 0, 0, base.clone().build());
        heightfield
            .add_span(SpanInsertion {
                x: 0,
                z: 0,
                flag_merge_threshold: 1,
                span: SpanBuilder {
                    min: 2,
                    max: 11,
                    area: AreaType(1),
                    next: None,
                }
                .build(),
            })
            .unwrap();
        assert_eq!(heightfield.span_at(0, 0).unwrap().area(), AreaType(5));

        // The new top is too far above the old one: the new span's area is kept.
        let mut heightfield = height_field();
        insert(&mut heightfield, 0, 0, base.build());
        insert(
            &mut heightfield,
            0,
            0,
            SpanBuilder {
                min: 2,
                max: 15,
                area: AreaType(1),
                next: None,
            }
            .build(),
        );
        assert_eq!(heightfield.span_at(0, 0).unwrap().area(), AreaType(1));
    }

    #[track_caller]
    fn assert_eq_without_next(span: &Span, expected_span: &Span) {
        assert_eq!(span.min(), expected_span.min(), "min is not equal");
        assert_eq!(span.max(), expected_span.max(), "max is not equal");
        assert_eq!(span.area(), expected_span.area(), "area is not equal");
    }
}
