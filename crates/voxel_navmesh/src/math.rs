use glam::{UVec3, Vec2, Vec3, Vec3A, Vec3Swizzles as _};

/// An axis-aligned bounding box in 3D space.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb3d {
    /// The minimum corner.
    pub min: Vec3,
    /// The maximum corner.
    pub max: Vec3,
}

impl Aabb3d {
    /// Creates a new AABB from its corners.
    #[inline]
    pub fn new(min: impl Into<Vec3>, max: impl Into<Vec3>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Computes the smallest AABB containing all `verts`.
    /// Returns `None` if `verts` is empty.
    pub fn from_verts(verts: &[Vec3A]) -> Option<Self> {
        let (first, rest) = verts.split_first()?;
        let (min, max) = rest
            .iter()
            .fold((*first, *first), |(min, max), v| (min.min(*v), max.max(*v)));
        Some(Self::new(min, max))
    }

    /// The size of the AABB along every axis.
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Whether the two boxes overlap. Touching boxes count as overlapping.
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Whether `min <= max` on every axis and all coordinates are finite.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all() && self.min.is_finite() && self.max.is_finite()
    }
}

/// An axis-aligned bounding box on the xz-plane, stored as `x` and `y`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb2d {
    /// The minimum corner.
    pub min: Vec2,
    /// The maximum corner.
    pub max: Vec2,
}

impl Aabb2d {
    /// Computes the smallest AABB containing all `verts`.
    /// Returns `None` if `verts` is empty.
    pub fn from_verts(verts: &[Vec2]) -> Option<Self> {
        let (first, rest) = verts.split_first()?;
        let (min, max) = rest
            .iter()
            .fold((*first, *first), |(min, max), v| (min.min(*v), max.max(*v)));
        Some(Self { min, max })
    }
}

pub(crate) trait TriangleIndices {
    /// Normal of the triangle, `None` if an index is out of range.
    fn normal(&self, vertices: &[Vec3A]) -> Option<Vec3A>;
}

impl TriangleIndices for UVec3 {
    #[inline]
    fn normal(&self, vertices: &[Vec3A]) -> Option<Vec3A> {
        let a = *vertices.get(self.x as usize)?;
        let b = *vertices.get(self.y as usize)?;
        let c = *vertices.get(self.z as usize)?;
        let ab = b - a;
        let ac = c - a;
        Some(ab.cross(ac).normalize_or_zero())
    }
}

pub(crate) trait TriangleVertices {
    fn aabb(&self) -> Aabb3d;
    fn is_degenerate(&self) -> bool;
}

impl TriangleVertices for [Vec3A; 3] {
    #[inline]
    fn aabb(&self) -> Aabb3d {
        let min = self[0].min(self[1]).min(self[2]);
        let max = self[0].max(self[1]).max(self[2]);
        Aabb3d::new(min, max)
    }

    #[inline]
    fn is_degenerate(&self) -> bool {
        let area = (self[1] - self[0]).cross(self[2] - self[0]);
        area.length_squared() <= f32::EPSILON * f32::EPSILON || !area.is_finite()
    }
}

/// Gets the standard width (x-axis) offset for the specified direction.
/// # Arguments
/// - `direction`: The direction. [Limits: 0 <= value < 4]
/// # Returns
///
/// The width offset to apply to the current cell position to move in the direction.
#[inline]
pub(crate) fn dir_offset_x(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [-1, 0, 1, 0];
    OFFSET[direction as usize & 0x03]
}

/// Gets the standard height (z-axis) offset for the specified direction.
/// # Arguments
/// - `direction`: The direction. [Limits: 0 <= value < 4]
/// # Returns
///
/// The height offset to apply to the current cell position to move in the direction.
#[inline]
pub(crate) fn dir_offset_z(direction: u8) -> i8 {
    const OFFSET: [i8; 4] = [0, 1, 0, -1];
    OFFSET[direction as usize & 0x03]
}

/// Gets the direction for the specified offset. One of x and z should be 0.
#[inline]
pub(crate) fn dir_offset(offset_x: i32, offset_z: i32) -> u8 {
    const DIRS: [u8; 5] = [3, 0, 0xff, 2, 1];
    DIRS[(((offset_z + 1) << 1) + offset_x) as usize]
}

#[inline]
pub(crate) fn next(i: usize, n: usize) -> usize {
    if i + 1 < n { i + 1 } else { 0 }
}

#[inline]
pub(crate) fn prev(i: usize, n: usize) -> usize {
    if i >= 1 { i - 1 } else { n - 1 }
}

/// Squared distance on the xz-plane from `pt` to the segment `(p, q)`.
#[inline]
pub(crate) fn distance_squared_between_point_and_line_vec2(pt: Vec2, (p, q): (Vec2, Vec2)) -> f32 {
    let pq = q - p;
    let d = pq.length_squared();
    let mut t = pq.dot(pt - p);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    (p + pq * t - pt).length_squared()
}

/// Squared distance in 3D from `pt` to the segment `(p, q)`.
#[inline]
pub(crate) fn distance_squared_between_point_and_line_vec3(
    pt: Vec3A,
    (p, q): (Vec3A, Vec3A),
) -> f32 {
    let pq = q - p;
    let d = pq.length_squared();
    let mut t = pq.dot(pt - p);
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);
    (p + pq * t - pt).length_squared()
}

/// Same as [`distance_squared_between_point_and_line_vec2`] but on the xz components of 3D points.
#[inline]
pub(crate) fn distance_squared_between_point_and_line_xz(pt: Vec3A, (p, q): (Vec3A, Vec3A)) -> f32 {
    distance_squared_between_point_and_line_vec2(pt.xz(), (p.xz(), q.xz()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_offsets_round_trip() {
        for dir in 0..4 {
            let x = dir_offset_x(dir) as i32;
            let z = dir_offset_z(dir) as i32;
            assert_eq!(dir_offset(x, z), dir);
        }
    }

    #[test]
    fn aabb_from_verts() {
        let aabb = Aabb3d::from_verts(&[
            Vec3A::new(1.0, -2.0, 3.0),
            Vec3A::new(-1.0, 5.0, 0.0),
            Vec3A::new(0.5, 0.0, 7.0),
        ])
        .unwrap();
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 5.0, 7.0));
        assert_eq!(Aabb3d::from_verts(&[]), None);
    }

    #[test]
    fn point_segment_distance_clamps_to_endpoints() {
        let segment = (Vec2::ZERO, Vec2::new(2.0, 0.0));
        assert_eq!(
            distance_squared_between_point_and_line_vec2(Vec2::new(1.0, 1.0), segment),
            1.0
        );
        assert_eq!(
            distance_squared_between_point_and_line_vec2(Vec2::new(4.0, 0.0), segment),
            4.0
        );
    }

    #[test]
    fn degenerate_triangles_are_detected() {
        let flat = [Vec3A::ZERO, Vec3A::X, Vec3A::X * 2.0];
        assert!(flat.is_degenerate());
        let proper = [Vec3A::ZERO, Vec3A::X, Vec3A::Z];
        assert!(!proper.is_degenerate());
    }
}
