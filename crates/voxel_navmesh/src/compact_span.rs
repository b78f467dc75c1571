use crate::region::RegionId;

/// A walkable floor in a [`CompactHeightfield`](crate::CompactHeightfield).
///
/// The four neighbor links and the clearance share one packed word:
/// bits 0..24 hold four 6-bit layer indices, bits 24..32 the clearance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CompactSpan {
    /// Floor height in voxels above the heightfield's base.
    pub y: u16,
    /// Region the floor was assigned to, [`RegionId::NONE`] before partitioning.
    pub region: RegionId,
    pub(crate) packed: u32,
}

impl CompactSpan {
    pub(crate) const NOT_CONNECTED: u8 = 0x3f;
    const LINK_BITS: u32 = 6;
    const CLEARANCE_SHIFT: u32 = 24;

    #[inline]
    fn link_shift(direction: u8) -> u32 {
        u32::from(direction & 0x3) * Self::LINK_BITS
    }

    /// Stores the layer index of the neighbor reached by walking in `direction`.
    /// `None` clears the link.
    pub fn set_con(&mut self, direction: u8, neighbor: impl Into<Option<u8>>) {
        let shift = Self::link_shift(direction);
        let layer = neighbor.into().unwrap_or(Self::NOT_CONNECTED) & Self::NOT_CONNECTED;
        let mask = u32::from(Self::NOT_CONNECTED) << shift;
        self.packed = (self.packed & !mask) | (u32::from(layer) << shift);
    }

    /// Layer index, within the neighboring column, of the floor reached by walking in `direction`.
    pub fn con(&self, direction: u8) -> Option<u8> {
        let layer = (self.packed >> Self::link_shift(direction)) as u8 & Self::NOT_CONNECTED;
        (layer != Self::NOT_CONNECTED).then_some(layer)
    }

    /// Free space above the floor in voxels, saturating at [`u8::MAX`].
    pub fn height(&self) -> u8 {
        (self.packed >> Self::CLEARANCE_SHIFT) as u8
    }

    /// Overwrites the free space above the floor.
    pub fn set_height(&mut self, height: u8) {
        let links = self.packed & ((1 << Self::CLEARANCE_SHIFT) - 1);
        self.packed = links | (u32::from(height) << Self::CLEARANCE_SHIFT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlinked() -> CompactSpan {
        let mut span = CompactSpan::default();
        for direction in 0..4 {
            span.set_con(direction, None);
        }
        span
    }

    #[test]
    fn links_are_independent_per_direction() {
        let mut span = unlinked();
        span.set_con(0, 1);
        span.set_con(2, 5);
        assert_eq!(span.con(0), Some(1));
        assert_eq!(span.con(1), None);
        assert_eq!(span.con(2), Some(5));
        assert_eq!(span.con(3), None);

        span.set_con(0, 2);
        span.set_con(2, None);
        assert_eq!(span.con(0), Some(2));
        assert_eq!(span.con(2), None);
    }

    #[test]
    fn zeroed_span_links_to_layer_zero() {
        let span = CompactSpan::default();
        assert_eq!(span.con(3), Some(0));
        assert_eq!(span.height(), 0);
    }

    #[test]
    fn clearance_and_links_do_not_overlap() {
        let mut span = unlinked();
        span.set_con(3, 61);
        span.set_height(u8::MAX);
        assert_eq!(span.con(3), Some(61));
        assert_eq!(span.con(0), None);
        assert_eq!(span.height(), u8::MAX);

        span.set_height(7);
        assert_eq!(span.height(), 7);
        assert_eq!(span.con(3), Some(61));
    }
}
