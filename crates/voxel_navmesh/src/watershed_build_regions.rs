use std::collections::HashMap;

use thiserror::Error;

use crate::{AreaType, CompactHeightfield, region::RegionId};

impl CompactHeightfield {
    /// Non-null regions will consist of connected, non-overlapping walkable spans that form a single contour.
    /// Contours will form simple polygons.
    ///
    /// If multiple regions form an area that is smaller than `min_region_area`, then all spans will be
    /// re-assigned to [`RegionId::NONE`], unless they touch the tile border.
    /// A region smaller than `min_region_area` that survives is merged into the compatible neighbor
    /// it shares the longest boundary with.
    ///
    /// Watershed partitioning can result in smaller than necessary regions, especially in diagonal corridors.
    /// `merge_region_area` helps reduce unnecessarily small regions.
    ///
    /// The region data will be available via the [`CompactHeightfield::max_region`]
    /// and [`CompactSpan::region`](crate::CompactSpan::region) fields.
    ///
    /// The distance field must be created using [`CompactHeightfield::build_distance_field`] before attempting to build regions.
    ///
    /// # Errors
    ///
    /// Returns an error if the watershed creates more regions than a [`RegionId`] can hold.
    pub fn build_regions(
        &mut self,
        border_size: u16,
        min_region_area: u16,
        merge_region_area: u16,
    ) -> Result<(), BuildRegionsError> {
        const LOG_NB_STACKS: usize = 3;
        const NB_STACKS: usize = 1 << LOG_NB_STACKS;
        let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS] = [const { Vec::new() }; NB_STACKS];
        for stack in &mut level_stacks {
            stack.reserve(256);
        }

        let mut stack: Vec<LevelStackEntry> = Vec::with_capacity(256);

        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let mut src_dist = vec![0_u16; self.spans.len()];

        let mut region_id: u16 = 1;
        let mut level = self.max_distance.saturating_add(1) & !1;

        // expand_iters defines how much the watershed "overflows" and simplifies the regions.
        let expand_iters = 8;

        if border_size > 0 {
            // Make sure border will not overflow.
            let border_width = border_size.min(self.width);
            let border_height = border_size.min(self.height);

            // Paint regions
            let rects = [
                (0, border_width, 0, self.height),
                (self.width - border_width, self.width, 0, self.height),
                (0, self.width, 0, border_height),
                (0, self.width, self.height - border_height, self.height),
            ];
            for (min_x, max_x, min_z, max_z) in rects {
                let region = RegionId::from(region_id) | RegionId::BORDER_REGION;
                self.paint_rect_region(min_x, max_x, min_z, max_z, region, &mut src_reg);
                region_id += 1;
            }
        }
        self.border_size = border_size;

        let mut s_id = usize::MAX;
        while level > 0 {
            level = level.saturating_sub(2);
            s_id = s_id.wrapping_add(1) & (NB_STACKS - 1);

            if s_id == 0 {
                self.sort_cells_by_level(level, &src_reg, &mut level_stacks, 1);
            } else {
                // copy left overs from last level
                let (src, dst) = level_stacks.split_at_mut(s_id);
                append_stacks(&src[s_id - 1], &mut dst[0], &src_reg);
            }

            self.expand_regions(
                expand_iters,
                level,
                &mut src_reg,
                &mut src_dist,
                &mut level_stacks[s_id],
                false,
            );

            // Mark new regions with IDs.
            for entry in &level_stacks[s_id] {
                let Some(i) = entry.index else {
                    continue;
                };
                if src_reg[i] != RegionId::NONE {
                    continue;
                }
                if self.flood_region(
                    entry.x,
                    entry.z,
                    i,
                    level,
                    RegionId::from(region_id),
                    &mut src_reg,
                    &mut src_dist,
                    &mut stack,
                ) {
                    if region_id >= RegionId::MAX.bits() {
                        return Err(BuildRegionsError::TooManyRegions {
                            max: RegionId::MAX.bits(),
                        });
                    }
                    region_id += 1;
                }
            }
        }

        // Expand current regions until no empty connected cells found.
        self.expand_regions(
            expand_iters * 8,
            0,
            &mut src_reg,
            &mut src_dist,
            &mut stack,
            true,
        );

        // Merge regions and filter out small regions.
        let (max_region, overlaps) = self.merge_and_filter_regions(
            min_region_area as usize,
            merge_region_area as usize,
            region_id,
            &mut src_reg,
        );
        self.max_region = max_region;

        // If overlapping regions were found during merging, split those regions.
        if !overlaps.is_empty() {
            tracing::warn!(
                count = overlaps.len(),
                "Found overlapping regions, contours built from them may be invalid"
            );
        }

        // Write the result out.
        for (span, region) in self.spans.iter_mut().zip(src_reg) {
            span.region = region;
        }
        tracing::debug!(
            max_region = self.max_region.bits(),
            "Built watershed regions"
        );
        Ok(())
    }

    fn paint_rect_region(
        &self,
        min_x: u16,
        max_x: u16,
        min_z: u16,
        max_z: u16,
        region: RegionId,
        src_reg: &mut [RegionId],
    ) {
        for z in min_z..max_z {
            for x in min_x..max_x {
                for i in self.cell_at(x, z).index_range() {
                    if self.areas[i].is_walkable() {
                        src_reg[i] = region;
                    }
                }
            }
        }
    }

    fn sort_cells_by_level(
        &self,
        start_level: u16,
        src_reg: &[RegionId],
        stacks: &mut [Vec<LevelStackEntry>],
        log_levels_per_stack: u16,
    ) {
        let start_level = (start_level >> log_levels_per_stack) as i32;
        for stack in stacks.iter_mut() {
            stack.clear();
        }

        // put all cells in the level range into the appropriate stacks
        for (x, z, i) in self.span_indices() {
            if !self.areas[i].is_walkable() || src_reg[i] != RegionId::NONE {
                continue;
            }
            let level = (self.dist[i] >> log_levels_per_stack) as i32;
            let s_id = (start_level - level).max(0) as usize;
            if s_id >= stacks.len() {
                continue;
            }
            stacks[s_id].push(LevelStackEntry {
                x,
                z,
                index: Some(i),
            });
        }
    }

    fn expand_regions(
        &self,
        max_iter: u16,
        level: u16,
        src_reg: &mut [RegionId],
        src_dist: &mut [u16],
        stack: &mut Vec<LevelStackEntry>,
        fill_stack: bool,
    ) {
        if fill_stack {
            // Find cells revealed by the raised level.
            stack.clear();
            for (x, z, i) in self.span_indices() {
                if self.dist[i] >= level
                    && src_reg[i] == RegionId::NONE
                    && self.areas[i].is_walkable()
                {
                    stack.push(LevelStackEntry {
                        x,
                        z,
                        index: Some(i),
                    });
                }
            }
        } else {
            // use cells in the input stack
            // mark all cells which already have a region
            for entry in stack.iter_mut() {
                if entry.index.is_some_and(|i| src_reg[i] != RegionId::NONE) {
                    entry.index = None;
                }
            }
        }

        let mut dirty_entries = Vec::new();
        let mut iter = 0;
        while !stack.is_empty() {
            let mut failed = 0;
            dirty_entries.clear();

            for entry in stack.iter_mut() {
                let Some(i) = entry.index else {
                    failed += 1;
                    continue;
                };

                let mut r = src_reg[i];
                let mut d2 = u16::MAX;
                let area = self.areas[i];
                for dir in 0..4 {
                    let Some((_, _, ai)) = self.neighbor(entry.x, entry.z, i, dir) else {
                        continue;
                    };
                    if self.areas[ai] != area {
                        continue;
                    }
                    let neighbor_region = src_reg[ai];
                    if !neighbor_region.is_interior() {
                        continue;
                    }
                    // Closest region wins, ties go to the lowest region id.
                    let neighbor_dist = src_dist[ai].saturating_add(2);
                    if neighbor_dist < d2 || (neighbor_dist == d2 && neighbor_region < r) {
                        r = neighbor_region;
                        d2 = neighbor_dist;
                    }
                }
                if r != RegionId::NONE {
                    // Mark as used
                    entry.index = None;
                    dirty_entries.push(DirtyEntry {
                        index: i,
                        region: r,
                        distance2: d2,
                    });
                } else {
                    failed += 1;
                }
            }
            // Copy entries that differ between src and dst to keep them in sync.
            for dirty_entry in &dirty_entries {
                src_reg[dirty_entry.index] = dirty_entry.region;
                src_dist[dirty_entry.index] = dirty_entry.distance2;
            }

            if failed == stack.len() {
                break;
            }

            if level > 0 {
                iter += 1;
                if iter >= max_iter {
                    break;
                }
            }
        }
    }

    fn flood_region(
        &self,
        x: u16,
        z: u16,
        i: usize,
        level: u16,
        region: RegionId,
        src_reg: &mut [RegionId],
        src_dist: &mut [u16],
        stack: &mut Vec<LevelStackEntry>,
    ) -> bool {
        let area = self.areas[i];

        // Flood fill mark region.
        stack.clear();
        stack.push(LevelStackEntry {
            x,
            z,
            index: Some(i),
        });
        src_reg[i] = region;
        src_dist[i] = 0;

        let level = level.saturating_sub(2);
        let mut count = 0;

        while let Some(back) = stack.pop() {
            let Some(ci) = back.index else {
                continue;
            };
            let (cx, cz) = (back.x, back.z);

            // Check if any of the neighbours already have a valid region set.
            let mut adjacent_region = RegionId::NONE;
            for dir in 0..4 {
                // 8 connected
                let Some((ax, az, ai)) = self.neighbor(cx, cz, ci, dir) else {
                    continue;
                };
                if self.areas[ai] != area {
                    continue;
                }
                let neighbor_region = src_reg[ai];
                // Do not take borders into account.
                if neighbor_region.is_border() {
                    continue;
                }
                if neighbor_region != RegionId::NONE && neighbor_region != region {
                    adjacent_region = neighbor_region;
                    break;
                }

                let dir2 = (dir + 1) & 0x3;
                let Some((_, _, ai2)) = self.neighbor(ax, az, ai, dir2) else {
                    continue;
                };
                if self.areas[ai2] != area {
                    continue;
                }
                let diagonal_region = src_reg[ai2];
                if diagonal_region != RegionId::NONE && diagonal_region != region {
                    adjacent_region = diagonal_region;
                    break;
                }
            }
            if adjacent_region != RegionId::NONE {
                src_reg[ci] = RegionId::NONE;
                continue;
            }

            count += 1;

            // Expand neighbours.
            for dir in 0..4 {
                let Some((ax, az, ai)) = self.neighbor(cx, cz, ci, dir) else {
                    continue;
                };
                if self.areas[ai] != area {
                    continue;
                }
                if self.dist[ai] >= level && src_reg[ai] == RegionId::NONE {
                    src_reg[ai] = region;
                    src_dist[ai] = 0;
                    stack.push(LevelStackEntry {
                        x: ax,
                        z: az,
                        index: Some(ai),
                    });
                }
            }
        }

        count > 0
    }

    fn is_solid_edge(&self, src_reg: &[RegionId], x: u16, z: u16, i: usize, dir: u8) -> bool {
        let neighbor_region = self
            .neighbor(x, z, i, dir)
            .map_or(RegionId::NONE, |(_, _, ai)| src_reg[ai]);
        neighbor_region != src_reg[i]
    }

    /// Walks the outline of the region `i` belongs to and returns the regions on the other side, in order.
    fn walk_contour(
        &self,
        mut x: u16,
        mut z: u16,
        mut i: usize,
        mut dir: u8,
        src_reg: &[RegionId],
    ) -> Vec<RegionId> {
        let start_dir = dir;
        let start_index = i;

        let mut current_region = self
            .neighbor(x, z, i, dir)
            .map_or(RegionId::NONE, |(_, _, ai)| src_reg[ai]);
        let mut connections = vec![current_region];

        let mut iter = 0;
        loop {
            iter += 1;
            if iter >= 40_000 {
                tracing::warn!(x, z, "Region contour walk did not terminate");
                break;
            }
            if self.is_solid_edge(src_reg, x, z, i, dir) {
                // Choose the edge corner
                let region = self
                    .neighbor(x, z, i, dir)
                    .map_or(RegionId::NONE, |(_, _, ai)| src_reg[ai]);
                if region != current_region {
                    current_region = region;
                    connections.push(current_region);
                }
                // Rotate CW
                dir = (dir + 1) & 0x3;
            } else {
                let Some((nx, nz, ni)) = self.neighbor(x, z, i, dir) else {
                    // Should not happen.
                    return connections;
                };
                x = nx;
                z = nz;
                i = ni;
                // Rotate CCW
                dir = (dir + 3) & 0x3;
            }

            if start_index == i && start_dir == dir {
                break;
            }
        }

        // Remove adjacent duplicates.
        remove_adjacent_duplicates(&mut connections);
        connections
    }

    fn merge_and_filter_regions(
        &self,
        min_region_area: usize,
        merge_region_size: usize,
        max_region_id: u16,
        src_reg: &mut [RegionId],
    ) -> (RegionId, Vec<RegionId>) {
        let region_count = max_region_id as usize + 1;
        let mut regions: Vec<Region> = (0..region_count)
            .map(|i| Region::new(RegionId::from(i as u16)))
            .collect();

        // Find edge of a region and find connections around the contour.
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = *self.cell_at(x, z);
                for i in cell.index_range() {
                    let r = src_reg[i].bits() as usize;
                    if r == 0 || r >= region_count {
                        continue;
                    }

                    let region = &mut regions[r];
                    region.span_count += 1;

                    // Update floors.
                    for j in cell.index_range() {
                        if i == j {
                            continue;
                        }
                        let floor_id = src_reg[j];
                        if floor_id == RegionId::NONE || floor_id.bits() as usize >= region_count {
                            continue;
                        }
                        if floor_id.bits() as usize == r {
                            region.overlap = true;
                        }
                        region.add_unique_floor_region(floor_id);
                    }

                    // Have found contour
                    if !region.connections.is_empty() {
                        continue;
                    }

                    region.area_type = self.areas[i];

                    // Check if this cell is next to a border.
                    let Some(dir) = (0..4).find(|&dir| self.is_solid_edge(src_reg, x, z, i, dir))
                    else {
                        continue;
                    };
                    // The cell is at border.
                    // Walk around the contour to find all the neighbours.
                    regions[r].connections = self.walk_contour(x, z, i, dir, src_reg);
                }
            }
        }

        remove_small_islands(&mut regions, min_region_area);
        self.merge_small_regions(&mut regions, min_region_area, src_reg);
        merge_regions_into_smallest_neighbor(&mut regions, merge_region_size);

        // Compress region Ids.
        for region in regions.iter_mut() {
            region.remap = region.id.is_interior();
        }

        let mut region_id_gen = 0_u16;
        for i in 0..region_count {
            if !regions[i].remap {
                continue;
            }
            let old_id = regions[i].id;
            region_id_gen += 1;
            let new_id = RegionId::from(region_id_gen);
            for region in regions[i..].iter_mut() {
                if region.id == old_id {
                    region.id = new_id;
                    region.remap = false;
                }
            }
        }

        // Remap regions.
        for region in src_reg.iter_mut() {
            if !region.is_border() {
                *region = regions[region.bits() as usize].id;
            }
        }

        // Return regions that we found to be overlapping.
        let overlaps = regions
            .iter()
            .filter(|region| region.overlap)
            .map(|region| region.id)
            .collect();
        (RegionId::from(region_id_gen), overlaps)
    }

    /// Merges regions smaller than `min_region_area` into the compatible neighbor
    /// sharing the longest boundary with them. Ties go to the lowest region id.
    fn merge_small_regions(
        &self,
        regions: &mut [Region],
        min_region_area: usize,
        src_reg: &[RegionId],
    ) {
        loop {
            let boundaries = self.shared_boundary_lengths(regions, src_reg);
            let mut merge_count = 0;
            for i in 0..regions.len() {
                let region = &regions[i];
                if !region.id.is_interior()
                    || region.overlap
                    || region.span_count == 0
                    || region.span_count >= min_region_area
                {
                    continue;
                }
                let target = region
                    .connections
                    .iter()
                    .filter(|connection| connection.is_interior())
                    .filter(|&&connection| {
                        let candidate = &regions[connection.bits() as usize];
                        candidate.id.is_interior()
                            && !candidate.overlap
                            && region.can_merge_with(candidate)
                            && candidate.can_merge_with(region)
                    })
                    .map(|&connection| {
                        let key = (region.id.min(connection), region.id.max(connection));
                        (boundaries.get(&key).copied().unwrap_or(0), connection)
                    })
                    .max_by(|(a_len, a_id), (b_len, b_id)| a_len.cmp(b_len).then(b_id.cmp(a_id)));
                let old_id = region.id;
                let Some((_, merge_id)) = target else {
                    continue;
                };
                if merge_regions(regions, merge_id.bits() as usize, i) {
                    fix_up_merged_region(regions, old_id, merge_id);
                    merge_count += 1;
                }
            }
            if merge_count == 0 {
                break;
            }
        }
    }

    /// Counts the span edges shared by every pair of neighboring regions, keyed by the ordered pair.
    fn shared_boundary_lengths(
        &self,
        regions: &[Region],
        src_reg: &[RegionId],
    ) -> HashMap<(RegionId, RegionId), usize> {
        let current_id = |region: RegionId| {
            regions
                .get(region.bits() as usize)
                .map(|region| region.id)
                .filter(RegionId::is_interior)
        };
        let mut boundaries = HashMap::new();
        for (x, z, i) in self.span_indices() {
            let Some(a) = current_id(src_reg[i]) else {
                continue;
            };
            // Only look in the positive directions so that every edge is counted once.
            for dir in [1, 2] {
                let Some((_, _, ai)) = self.neighbor(x, z, i, dir) else {
                    continue;
                };
                let Some(b) = current_id(src_reg[ai]) else {
                    continue;
                };
                if a != b {
                    *boundaries.entry((a.min(b), a.max(b))).or_insert(0) += 1;
                }
            }
        }
        boundaries
    }
}

/// Removes groups of connected regions that are too small to be useful, unless they touch the tile border.
fn remove_small_islands(regions: &mut [Region], min_region_area: usize) {
    let mut stack = Vec::with_capacity(32);
    let mut trace = Vec::with_capacity(32);
    for i in 0..regions.len() {
        let region = &regions[i];
        if !region.id.is_interior() || region.span_count == 0 || region.visited {
            continue;
        }

        // Count the total size of all the connected regions.
        // Also keep track of the regions connects to a tile border.
        let mut connects_to_border = false;
        let mut span_count = 0;
        stack.clear();
        trace.clear();

        regions[i].visited = true;
        stack.push(i);

        while let Some(ri) = stack.pop() {
            // Get current region.
            span_count += regions[ri].span_count;
            trace.push(ri);

            for j in 0..regions[ri].connections.len() {
                let connection = regions[ri].connections[j];
                if connection.is_border() {
                    connects_to_border = true;
                    continue;
                }
                let neighbor = &mut regions[connection.bits() as usize];
                if neighbor.visited || !neighbor.id.is_interior() {
                    continue;
                }
                // Visit
                stack.push(neighbor.id.bits() as usize);
                neighbor.visited = true;
            }
        }

        // If the accumulated regions size is too small, remove it.
        // Do not remove areas which connect to tile borders
        // as their size cannot be estimated correctly and removing them
        // can potentially remove necessary areas.
        if span_count < min_region_area && !connects_to_border {
            // Kill all visited regions.
            for &j in &trace {
                regions[j].span_count = 0;
                regions[j].id = RegionId::NONE;
            }
        }
    }
}

/// Merges small regions, and regions that do not touch the walkable border,
/// into their smallest mutually compatible neighbor until nothing changes.
fn merge_regions_into_smallest_neighbor(regions: &mut [Region], merge_region_size: usize) {
    loop {
        let mut merge_count = 0;
        for i in 0..regions.len() {
            let region = &regions[i];
            if !region.id.is_interior() || region.overlap || region.span_count == 0 {
                continue;
            }

            // Check to see if the region should be merged.
            if region.span_count > merge_region_size && region.is_connected_to_border() {
                continue;
            }

            // Small region with more than 1 connection.
            // Or region which is not connected to a border at all.
            // Find smallest neighbour region that connects to this one.
            let mut smallest = usize::MAX;
            let mut merge_id = region.id;
            for connection in &region.connections {
                if connection.is_border() {
                    continue;
                }
                let candidate = &regions[connection.bits() as usize];
                if !candidate.id.is_interior() || candidate.overlap {
                    continue;
                }
                if candidate.span_count < smallest
                    && region.can_merge_with(candidate)
                    && candidate.can_merge_with(region)
                {
                    smallest = candidate.span_count;
                    merge_id = candidate.id;
                }
            }

            // Found new id.
            if merge_id != region.id {
                let old_id = region.id;
                // Merge neighbours.
                if merge_regions(regions, merge_id.bits() as usize, i) {
                    fix_up_merged_region(regions, old_id, merge_id);
                    merge_count += 1;
                }
            }
        }
        if merge_count == 0 {
            break;
        }
    }
}

/// Merges the region at `source` into the region at `target`. Returns `false` if the two do not touch.
fn merge_regions(regions: &mut [Region], target: usize, source: usize) -> bool {
    let a_id = regions[target].id;
    let b_id = regions[source].id;

    // Duplicate current neighbourhood.
    let a_connections = &regions[target].connections;
    let b_connections = &regions[source].connections;

    // Find insertion point on A.
    let Some(insert_a) = a_connections.iter().position(|&c| c == b_id) else {
        return false;
    };
    // Find insertion point on B.
    let Some(insert_b) = b_connections.iter().position(|&c| c == a_id) else {
        return false;
    };

    // Merge neighbours.
    let a_len = a_connections.len();
    let b_len = b_connections.len();
    let mut connections = Vec::with_capacity(a_len + b_len);
    connections.extend((0..a_len - 1).map(|i| a_connections[(insert_a + 1 + i) % a_len]));
    connections.extend((0..b_len - 1).map(|i| b_connections[(insert_b + 1 + i) % b_len]));
    remove_adjacent_duplicates(&mut connections);

    let floors = regions[source].floors.clone();
    let span_count = regions[source].span_count;

    let region_a = &mut regions[target];
    region_a.connections = connections;
    for floor in floors {
        region_a.add_unique_floor_region(floor);
    }
    region_a.span_count += span_count;

    let region_b = &mut regions[source];
    region_b.span_count = 0;
    region_b.connections.clear();
    true
}

/// Points every reference to `old_id` at `merge_id`.
fn fix_up_merged_region(regions: &mut [Region], old_id: RegionId, merge_id: RegionId) {
    for region in regions.iter_mut() {
        if !region.id.is_interior() {
            continue;
        }
        // If another region was already merged into current region
        // change the nid of the previous region too.
        if region.id == old_id {
            region.id = merge_id;
        }
        // Replace the current region with the new one if the
        // current regions is neighbour.
        region.replace_neighbor(old_id, merge_id);
    }
}

fn remove_adjacent_duplicates(connections: &mut Vec<RegionId>) {
    let mut i = 0;
    while i < connections.len() && connections.len() > 1 {
        let ni = (i + 1) % connections.len();
        if connections[i] == connections[ni] {
            connections.remove(i);
        } else {
            i += 1;
        }
    }
}

fn append_stacks(
    src_stack: &[LevelStackEntry],
    dst_stack: &mut Vec<LevelStackEntry>,
    src_reg: &[RegionId],
) {
    for entry in src_stack {
        let Some(i) = entry.index else {
            continue;
        };
        if src_reg[i] != RegionId::NONE {
            continue;
        }
        dst_stack.push(entry.clone());
    }
}

/// Bookkeeping for one region while merging and filtering.
#[derive(Debug, Clone)]
struct Region {
    /// Number of spans belonging to this region
    span_count: usize,
    /// ID of the region
    id: RegionId,
    /// Area type.
    area_type: AreaType,
    remap: bool,
    visited: bool,
    overlap: bool,
    /// Regions on the other side of the outline, in walking order
    connections: Vec<RegionId>,
    /// Regions stacked in the same columns
    floors: Vec<RegionId>,
}

impl Region {
    fn new(id: RegionId) -> Self {
        Self {
            span_count: 0,
            id,
            area_type: AreaType::NOT_WALKABLE,
            remap: false,
            visited: false,
            overlap: false,
            connections: Vec::new(),
            floors: Vec::new(),
        }
    }

    fn add_unique_floor_region(&mut self, floor: RegionId) {
        if !self.floors.contains(&floor) {
            self.floors.push(floor);
        }
    }

    fn is_connected_to_border(&self) -> bool {
        // Null region indicates border.
        self.connections.contains(&RegionId::NONE)
    }

    fn can_merge_with(&self, other: &Region) -> bool {
        if self.area_type != other.area_type {
            return false;
        }
        let shared_runs = self.connections.iter().filter(|&&c| c == other.id).count();
        if shared_runs > 1 {
            return false;
        }
        !self.floors.contains(&other.id)
    }

    fn replace_neighbor(&mut self, old_id: RegionId, new_id: RegionId) {
        let mut neighbor_changed = false;
        for connection in self.connections.iter_mut() {
            if *connection == old_id {
                *connection = new_id;
                neighbor_changed = true;
            }
        }
        for floor in self.floors.iter_mut() {
            if *floor == old_id {
                *floor = new_id;
            }
        }
        if neighbor_changed {
            remove_adjacent_duplicates(&mut self.connections);
        }
    }
}

#[derive(Clone, Debug)]
struct LevelStackEntry {
    x: u16,
    z: u16,
    index: Option<usize>,
}

#[derive(Clone, Debug)]
struct DirtyEntry {
    index: usize,
    region: RegionId,
    distance2: u16,
}

/// Errors that can occur when building regions with [`CompactHeightfield::build_regions`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildRegionsError {
    /// The watershed produced more regions than can be addressed.
    #[error("Too many regions, at most {max} regions fit into a region id")]
    TooManyRegions {
        /// The maximum region id
        max: u16,
    },
}

#[cfg(test)]
mod tests {
    use crate::{Aabb3d, HeightfieldBuilder, SpanBuilder, SpanInsertion};

    use super::*;

    fn compact_field(size: u16, wall: impl Fn(u16, u16) -> bool) -> CompactHeightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d::new([0.0, 0.0, 0.0], [size as f32, 10.0, size as f32]),
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        for z in 0..size {
            for x in 0..size {
                let area = if wall(x, z) {
                    AreaType::NOT_WALKABLE
                } else {
                    AreaType::DEFAULT_WALKABLE
                };
                heightfield
                    .add_span(SpanInsertion {
                        x,
                        z,
                        flag_merge_threshold: 0,
                        span: SpanBuilder {
                            min: 0,
                            max: 1,
                            area,
                            next: None,
                        }
                        .build(),
                    })
                    .unwrap();
            }
        }
        let mut compact = heightfield.into_compact(2, 1).unwrap();
        compact.build_distance_field();
        compact
    }

    fn distinct_regions(compact: &CompactHeightfield) -> Vec<RegionId> {
        let mut regions: Vec<_> = compact
            .spans
            .iter()
            .map(|span| span.region)
            .filter(RegionId::is_interior)
            .collect();
        regions.sort();
        regions.dedup();
        regions
    }

    #[test]
    fn flat_field_is_a_single_region() {
        let mut compact = compact_field(12, |_, _| false);
        compact.build_regions(0, 8, 20).unwrap();
        assert_eq!(distinct_regions(&compact), vec![RegionId::from(1)]);
        assert_eq!(compact.max_region, RegionId::from(1));
        assert!(compact.spans.iter().all(|span| span.region == RegionId::from(1)));
    }

    #[test]
    fn border_is_painted_and_excluded() {
        let mut compact = compact_field(10, |_, _| false);
        compact.build_regions(2, 0, 20).unwrap();
        assert_eq!(compact.border_size, 2);
        for (x, z, i) in compact.span_indices() {
            let on_border = x < 2 || z < 2 || x >= 8 || z >= 8;
            assert_eq!(compact.spans[i].region.is_border(), on_border, "({x}, {z})");
        }
        assert_eq!(distinct_regions(&compact).len(), 1);
    }

    #[test]
    fn wall_splits_field_into_two_regions() {
        let mut compact = compact_field(11, |x, _| x == 5);
        compact.build_regions(0, 4, 0).unwrap();
        let regions = distinct_regions(&compact);
        assert_eq!(regions.len(), 2);
        let left = compact.spans[compact.cell_at(0, 0).index() as usize].region;
        let right = compact.spans[compact.cell_at(10, 10).index() as usize].region;
        assert_ne!(left, right);
        assert_eq!(compact.max_region, RegionId::from(2));
    }

    #[test]
    fn tiny_islands_are_removed() {
        // A 2x2 pocket enclosed by walls
        let mut compact = compact_field(12, |x, z| {
            (x == 2 || x == 5) && (2..=5).contains(&z) || (z == 2 || z == 5) && (2..=5).contains(&x)
        });
        compact.build_regions(0, 8, 0).unwrap();
        let pocket = compact.spans[compact.cell_at(3, 3).index() as usize].region;
        assert_eq!(pocket, RegionId::NONE);
        let outside = compact.spans[compact.cell_at(0, 0).index() as usize].region;
        assert!(outside.is_interior());
    }

    #[test]
    fn building_regions_is_deterministic() {
        let mut compact = compact_field(16, |x, z| x == 8 && z > 3);
        compact.build_regions(1, 4, 10).unwrap();
        let first: Vec<_> = compact.spans.iter().map(|span| span.region).collect();
        compact.build_regions(1, 4, 10).unwrap();
        let second: Vec<_> = compact.spans.iter().map(|span| span.region).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn region_can_merge_checks_area_and_floors() {
        let mut a = Region::new(RegionId::from(1));
        let mut b = Region::new(RegionId::from(2));
        a.connections = vec![RegionId::from(2), RegionId::NONE];
        b.connections = vec![RegionId::from(1)];
        assert!(a.can_merge_with(&b));
        b.area_type = AreaType(3);
        assert!(!a.can_merge_with(&b));
        b.area_type = a.area_type;
        a.floors.push(RegionId::from(2));
        assert!(!a.can_merge_with(&b));
    }

    #[test]
    fn merging_joins_connection_rings() {
        let mut regions = vec![
            Region::new(RegionId::NONE),
            Region::new(RegionId::from(1)),
            Region::new(RegionId::from(2)),
        ];
        regions[1].connections = vec![RegionId::NONE, RegionId::from(2)];
        regions[1].span_count = 5;
        regions[2].connections = vec![RegionId::from(1), RegionId::NONE];
        regions[2].span_count = 3;
        assert!(merge_regions(&mut regions, 1, 2));
        assert_eq!(regions[1].span_count, 8);
        assert_eq!(regions[1].connections, vec![RegionId::NONE]);
        assert_eq!(regions[2].span_count, 0);
    }
}
