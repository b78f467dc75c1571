//! Watershed partitioning
//!   - the classic Recast partitioning
//!   - creates the nicest tessellation
//!   - usually slowest
//!   - partitions the heightfield into nice regions without holes or overlaps
//!   - the are some corner cases where this method creates produces holes and overlaps
//!      - holes may appear when a small obstacles is close to large open area (triangulation can handle this)
//!      - overlaps may occur if you have narrow spiral corridors (i.e stairs), this make triangulation to fail
//!   * generally the best choice if you precompute the navmesh, use this if you have large open areas

use crate::CompactHeightfield;

impl CompactHeightfield {
    /// Prepare for region partitioning, by calculating distance field along the walkable surface.
    ///
    /// Afterwards, [`CompactHeightfield::dist`] holds the smoothed distance of every span to the
    /// nearest border and [`CompactHeightfield::max_distance`] the largest unsmoothed distance.
    pub fn build_distance_field(&mut self) {
        let mut src = vec![0_u16; self.spans.len()];
        self.max_distance = self.calculate_distance_field(&mut src);
        self.dist = self.box_blur(1, &src);
        tracing::debug!(max_distance = self.max_distance, "Built distance field");
    }

    fn calculate_distance_field(&self, src: &mut [u16]) -> u16 {
        src.fill(u16::MAX);

        // Mark boundary cells.
        for (x, z, i) in self.span_indices() {
            let area = self.areas[i];
            let neighbor_count = (0..4)
                .filter_map(|dir| self.neighbor(x, z, i, dir))
                .filter(|&(_, _, ai)| self.areas[ai] == area)
                .count();
            if neighbor_count != 4 {
                src[i] = 0;
            }
        }

        self.chamfer_distance(src, |distance, cost| distance.saturating_add(cost as u16));

        src.iter().copied().max().unwrap_or_default()
    }

    fn box_blur(&self, threshold: u16, src: &[u16]) -> Vec<u16> {
        let threshold = threshold * 2;
        let mut dst = vec![0_u16; src.len()];
        for (x, z, i) in self.span_indices() {
            let center_distance = src[i];
            if center_distance <= threshold {
                dst[i] = center_distance;
                continue;
            }

            let mut distance = center_distance as u32;
            for dir in 0..4 {
                let Some((ax, az, ai)) = self.neighbor(x, z, i, dir) else {
                    distance += center_distance as u32 * 2;
                    continue;
                };
                distance += src[ai] as u32;

                let dir_2 = (dir + 1) & 0x3;
                match self.neighbor(ax, az, ai, dir_2) {
                    Some((_, _, aai)) => distance += src[aai] as u32,
                    None => distance += center_distance as u32,
                }
            }
            dst[i] = ((distance + 5) / 9) as u16;
        }
        dst
    }
}
