bitflags::bitflags! {
    /// A region in a [`CompactHeightfield`](crate::CompactHeightfield).
    ///
    /// The lower 15 bits are the region number, the highest bit marks regions
    /// painted along the tile border.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct RegionId: u16 {
        /// The default region, which is used for spans that are not in a region, i.e. not walkable.
        const NONE = 0;

        /// Heightfield border flag.
        /// If a heightfield region ID has this bit set, then the region is a border
        /// region and its spans are considered un-walkable.
        /// (Used during the region and contour build process.)
        const BORDER_REGION = 0x8000;

        /// The highest region number that fits next to the border flag.
        const MAX = Self::BORDER_REGION.bits() - 1;
    }
}

impl From<u16> for RegionId {
    fn from(value: u16) -> Self {
        RegionId::from_bits_retain(value)
    }
}

impl RegionId {
    /// Whether this region was painted along the tile border.
    #[inline]
    pub fn is_border(&self) -> bool {
        self.contains(Self::BORDER_REGION)
    }

    /// Whether the span belongs to an actual walkable region, i.e. neither [`RegionId::NONE`] nor a border region.
    #[inline]
    pub fn is_interior(&self) -> bool {
        *self != Self::NONE && !self.is_border()
    }

    /// The region id without the border flag.
    #[inline]
    pub(crate) fn without_flags(self) -> Self {
        self.intersection(Self::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_flag_is_separate_from_the_id() {
        let region = RegionId::from(3) | RegionId::BORDER_REGION;
        assert!(region.is_border());
        assert!(!region.is_interior());
        assert_eq!(region.without_flags(), RegionId::from(3));
        assert!(RegionId::from(3).is_interior());
        assert!(!RegionId::NONE.is_interior());
    }
}
