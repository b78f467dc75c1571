//! The compact heightfield only stores the walkable spans of a [`Heightfield`],
//! together with the connections between neighboring spans.

use crate::{
    Aabb3d,
    compact_cell::CompactCell,
    compact_span::CompactSpan,
    heightfield::Heightfield,
    math::{dir_offset_x, dir_offset_z},
    region::RegionId,
    span::{AreaType, Span},
};

/// A packed representation of a [`Heightfield`] that only keeps walkable spans.
/// Corresponds to <https://github.com/recastnavigation/recastnavigation/blob/bd98d84c274ee06842bf51a4088ca82ac71f8c2d/Recast/Include/Recast.h#L372>
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CompactHeightfield {
    /// The width of the heightfield along the x-axis in cell units
    pub width: u16,
    /// The height of the heightfield along the z-axis in cell units
    pub height: u16,
    /// The walkable height used during the build of the field
    pub walkable_height: u16,
    /// The walkable climb used during the build of the field.
    pub walkable_climb: u16,
    /// The AABB border size used during the build of the field.
    pub border_size: u16,
    /// The maximum distance value of any span within the field.
    pub max_distance: u16,
    /// The maximum region id of any span within the field.
    pub max_region: RegionId,
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
    /// The cells in the heightfield [Size: `width * height`]
    pub cells: Vec<CompactCell>,
    /// All walkable spans in the heightfield
    pub spans: Vec<CompactSpan>,
    /// Vector containing border distance data. [Size: `spans.len()`]
    pub dist: Vec<u16>,
    /// Vector containing area type data. [Size: `spans.len()`]
    pub areas: Vec<AreaType>,
}

impl Heightfield {
    /// Builds a compact heightfield from the walkable spans of this heightfield.
    ///
    /// Two spans in neighboring columns are connected if the gap between them is at least
    /// `walkable_height` high and their floors are at most `walkable_climb` apart.
    ///
    /// # Errors
    ///
    /// Returns an error if a column has more layers than a connection can address.
    pub fn into_compact(
        self,
        walkable_height: u16,
        walkable_climb: u16,
    ) -> Result<CompactHeightfield, CompactHeightfieldError> {
        CompactHeightfield::from_heightfield(self, walkable_height, walkable_climb)
    }
}

impl CompactHeightfield {
    /// The largest layer index a connection can store.
    pub(crate) const MAX_LAYERS: u8 = CompactSpan::NOT_CONNECTED - 1;

    /// Builds a compact heightfield from a heightfield.
    /// See [`Heightfield::into_compact`].
    ///
    /// # Errors
    ///
    /// Returns an error if the heightfield has too many layers.
    pub fn from_heightfield(
        heightfield: Heightfield,
        walkable_height: u16,
        walkable_climb: u16,
    ) -> Result<Self, CompactHeightfieldError> {
        let walkable_span_count = heightfield
            .allocated_spans
            .values()
            .filter(|span| span.area().is_walkable())
            .count();

        let mut compact_heightfield = Self {
            width: heightfield.width,
            height: heightfield.height,
            walkable_height,
            walkable_climb,
            border_size: 0,
            aabb: heightfield.aabb,
            max_distance: 0,
            max_region: RegionId::NONE,
            cell_size: heightfield.cell_size,
            cell_height: heightfield.cell_height,
            cells: vec![
                CompactCell::default();
                heightfield.width as usize * heightfield.height as usize
            ],
            spans: Vec::with_capacity(walkable_span_count),
            dist: vec![0; walkable_span_count],
            areas: Vec::with_capacity(walkable_span_count),
        };
        compact_heightfield.aabb.max.y += walkable_height as f32 * compact_heightfield.cell_height;

        // Fill in cells and spans
        for z in 0..heightfield.height {
            for x in 0..heightfield.width {
                let column_index = heightfield.column_index(x, z);
                let cell = &mut compact_heightfield.cells[column_index];
                cell.set_index(compact_heightfield.spans.len() as u32);

                for (_, span) in heightfield.column(x, z) {
                    if !span.area().is_walkable() {
                        continue;
                    }
                    if cell.count() == u8::MAX {
                        return Err(CompactHeightfieldError::TooManyLayers {
                            max_layer_index: Self::MAX_LAYERS,
                            layer_index: u8::MAX as u32 + 1,
                        });
                    }
                    let bot = span.max();
                    let top = span
                        .next()
                        .map_or(Span::MAX_HEIGHT, |next| heightfield.span(next).min());
                    let mut compact_span = CompactSpan {
                        y: bot,
                        ..Default::default()
                    };
                    let height = top.saturating_sub(bot).min(u8::MAX.into()) as u8;
                    compact_span.set_height(height);
                    compact_heightfield.spans.push(compact_span);
                    compact_heightfield.areas.push(span.area());
                    cell.inc_count();
                }
            }
        }

        // Find neighbour connections
        let mut too_high_neighbor = None;
        for z in 0..compact_heightfield.height {
            for x in 0..compact_heightfield.width {
                let cell = *compact_heightfield.cell_at(x, z);
                for i in cell.index_range() {
                    let span = compact_heightfield.spans[i].clone();
                    let span_top = span.y as i32 + span.height() as i32;
                    let mut connections = [None; 4];
                    for (dir, connection) in connections.iter_mut().enumerate() {
                        let dir = dir as u8;
                        let neighbor_x = x as i32 + dir_offset_x(dir) as i32;
                        let neighbor_z = z as i32 + dir_offset_z(dir) as i32;
                        // First check that the neighbour cell is in bounds.
                        if !heightfield.contains(neighbor_x, neighbor_z) {
                            continue;
                        }

                        // Iterate over all neighbour spans and check if any of the is
                        // accessible from current cell.
                        let neighbor_cell =
                            compact_heightfield.cell_at(neighbor_x as u16, neighbor_z as u16);
                        for k in neighbor_cell.index_range() {
                            let neighbor_span = &compact_heightfield.spans[k];
                            let bot = span.y.max(neighbor_span.y) as i32;
                            let top = span_top
                                .min(neighbor_span.y as i32 + neighbor_span.height() as i32);

                            // Check that the gap between the spans is walkable,
                            // and that the climb height between the gaps is not too high.
                            let is_walkable = top - bot >= walkable_height as i32;
                            let is_climbable = (neighbor_span.y as i32 - span.y as i32).abs()
                                <= walkable_climb as i32;
                            if !is_walkable || !is_climbable {
                                continue;
                            }
                            // Mark direction as walkable.
                            let layer_index = k - neighbor_cell.index() as usize;
                            if layer_index >= Self::MAX_LAYERS as usize {
                                too_high_neighbor = too_high_neighbor.max(Some(layer_index));
                                continue;
                            }
                            *connection = Some(layer_index as u8);
                            break;
                        }
                    }
                    let span = &mut compact_heightfield.spans[i];
                    for (dir, connection) in connections.into_iter().enumerate() {
                        span.set_con(dir as u8, connection);
                    }
                }
            }
        }
        if let Some(layer_index) = too_high_neighbor {
            return Err(CompactHeightfieldError::TooManyLayers {
                max_layer_index: Self::MAX_LAYERS,
                layer_index: layer_index as u32,
            });
        }
        tracing::debug!(
            spans = compact_heightfield.spans.len(),
            width = compact_heightfield.width,
            height = compact_heightfield.height,
            "Built compact heightfield"
        );
        Ok(compact_heightfield)
    }

    #[inline]
    pub(crate) fn column_index(&self, x: u16, z: u16) -> usize {
        x as usize + z as usize * self.width as usize
    }

    /// Whether the cell coordinates lie within the field.
    #[inline]
    pub(crate) fn contains(&self, x: i32, z: i32) -> bool {
        x >= 0 && x < self.width as i32 && z >= 0 && z < self.height as i32
    }

    /// Returns the cell at the given coordinates. Returns `None` if the coordinates are invalid.
    #[inline]
    pub fn get_cell_at(&self, x: u16, z: u16) -> Option<&CompactCell> {
        if x >= self.width || z >= self.height {
            return None;
        }
        self.cells.get(self.column_index(x, z))
    }

    /// Returns the cell at the given coordinates.
    /// # Panics
    /// Panics if the coordinates are invalid.
    #[inline]
    pub fn cell_at(&self, x: u16, z: u16) -> &CompactCell {
        &self.cells[self.column_index(x, z)]
    }

    /// Returns the coordinates and span index of the neighbor of span `i` at `(x, z)` in `dir`.
    /// `None` if the span is not connected in that direction.
    #[inline]
    pub(crate) fn neighbor(&self, x: u16, z: u16, i: usize, dir: u8) -> Option<(u16, u16, usize)> {
        let con = self.spans[i].con(dir)?;
        let neighbor_x = (x as i32 + dir_offset_x(dir) as i32) as u16;
        let neighbor_z = (z as i32 + dir_offset_z(dir) as i32) as u16;
        let neighbor_index = self.cell_at(neighbor_x, neighbor_z).index() as usize + con as usize;
        Some((neighbor_x, neighbor_z, neighbor_index))
    }

    /// Iterates over all `(x, z, span_index)` triples in raster order.
    pub(crate) fn span_indices(&self) -> impl Iterator<Item = (u16, u16, usize)> + '_ {
        (0..self.height).flat_map(move |z| {
            (0..self.width).flat_map(move |x| self.cell_at(x, z).index_range().map(move |i| (x, z, i)))
        })
    }
}

/// Errors that can occur when building a compact heightfield.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompactHeightfieldError {
    /// The heightfield has too many layers.
    #[error(
        "Heightfield has too many layers. Max layer index is {max_layer_index}, but got {layer_index}"
    )]
    TooManyLayers {
        /// The maximum layer index.
        max_layer_index: u8,
        /// The layer index that caused the error.
        layer_index: u32,
    },
}
