use crate::{Coord, GridError, GridResult};

/// The largest supported lattice dimension.
pub const MAX_DIMENSION: usize = 12;

/// Every coordinate component must lie in `[-COORD_LIMIT, COORD_LIMIT]`.
///
/// Roots grow by a factor of 3 and child centers sit `2r + 1` away from their parent, so this leaves enough headroom
/// that no box arithmetic can overflow an `i64`.
pub const COORD_LIMIT: i64 = i64::MAX / 16;

/// An axis-aligned box of lattice sites. Both bounds are inclusive.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct IBox<const D: usize> {
    pub min: Coord<D>,
    pub max: Coord<D>,
}

impl<const D: usize> IBox<D> {
    #[inline]
    pub fn new(min: Coord<D>, max: Coord<D>) -> Self {
        Self { min, max }
    }

    /// The box containing only `p`.
    #[inline]
    pub fn point(p: Coord<D>) -> Self {
        Self { min: p, max: p }
    }

    /// The cube `[center - half_width, center + half_width]`.
    #[inline]
    pub fn centered(center: Coord<D>, half_width: u64) -> Self {
        let h = half_width as i64;
        Self {
            min: center.map(|c| c - h),
            max: center.map(|c| c + h),
        }
    }

    #[inline]
    pub fn contains(&self, p: &Coord<D>) -> bool {
        (0..D).all(|i| self.min[i] <= p[i] && p[i] <= self.max[i])
    }

    #[inline]
    pub fn contains_box(&self, other: &Self) -> bool {
        (0..D).all(|i| self.min[i] <= other.min[i] && other.max[i] <= self.max[i])
    }

    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        (0..D).all(|i| self.min[i] <= other.max[i] && other.min[i] <= self.max[i])
    }

    #[inline]
    pub fn is_point(&self) -> bool {
        self.min == self.max
    }

    /// Grows the box just enough to contain `p`.
    #[inline]
    pub fn include(&mut self, p: &Coord<D>) {
        for i in 0..D {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    /// The number of sites between `p` and the closest face of the box, or `None` if `p` is outside.
    pub fn boundary_distance(&self, p: &Coord<D>) -> Option<u64> {
        if !self.contains(p) {
            return None;
        }
        (0..D)
            .map(|i| (p[i] - self.min[i]).min(self.max[i] - p[i]) as u64)
            .min()
    }
}

/// Geometry of the box tree for a fixed elementary radius `R`.
///
/// A leaf stores the `(2R + 1)^D` sites within `R` of its center. A node of radius `r` has `3^D` children of
/// half-width `r` and reaches `3r + 1` sites in every direction from its center. Its middle child shares its center,
/// which is what lets the tree be re-rooted around the origin. Nodes of radius `R` have leaves as children, and every
/// larger node radius is obtained from the previous one by `r -> 3r + 1`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BoxShape<const D: usize> {
    radius: u64,
    leaf_side: u64,
    leaf_len: usize,
    fan_out: usize,
}

impl<const D: usize> BoxShape<D> {
    pub fn new(radius: u64) -> GridResult<Self> {
        if D == 0 || D > MAX_DIMENSION {
            return Err(GridError::InvalidDimension(D));
        }
        let invalid = GridError::InvalidRadius {
            radius,
            dimension: D,
        };
        if radius == 0 || radius > COORD_LIMIT as u64 {
            return Err(invalid);
        }
        let leaf_side = 2 * radius + 1;
        let leaf_len = leaf_side
            .checked_pow(D as u32)
            .filter(|&n| n <= u32::MAX as u64)
            .ok_or(invalid)?;
        Ok(Self {
            radius,
            leaf_side,
            leaf_len: leaf_len as usize,
            fan_out: 3usize.pow(D as u32),
        })
    }

    /// The elementary radius `R`.
    #[inline]
    pub fn radius(&self) -> u64 {
        self.radius
    }

    /// The number of sites in a leaf.
    #[inline]
    pub fn leaf_len(&self) -> usize {
        self.leaf_len
    }

    /// The number of children of a node.
    #[inline]
    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// The child slot whose box has the same center as its parent.
    #[inline]
    pub fn middle_child(&self) -> usize {
        (self.fan_out - 1) / 2
    }

    /// True iff the children of a node with this radius are leaves.
    #[inline]
    pub fn is_bottom(&self, node_radius: u64) -> bool {
        node_radius == self.radius
    }

    #[inline]
    pub fn parent_radius(&self, node_radius: u64) -> u64 {
        3 * node_radius + 1
    }

    #[inline]
    pub fn child_radius(&self, node_radius: u64) -> u64 {
        debug_assert!(node_radius > self.radius);
        (node_radius - 1) / 3
    }

    /// True iff `node_radius` belongs to the sequence `R, 3R + 1, 9R + 4, ...`.
    pub fn is_node_radius(&self, mut node_radius: u64) -> bool {
        while node_radius > self.radius {
            if (node_radius - 1) % 3 != 0 {
                return false;
            }
            node_radius = (node_radius - 1) / 3;
        }
        node_radius == self.radius
    }

    #[inline]
    pub fn node_contains(&self, center: &Coord<D>, node_radius: u64, pos: &Coord<D>) -> bool {
        let l = (3 * node_radius + 1) as i64;
        (0..D).all(|i| (pos[i] - center[i]).abs() <= l)
    }

    /// Classifies each component of `pos` as below, within, or above the middle band of the node and combines the
    /// ternary digits into a child index in `[0, 3^D)`. Assumes `pos` is inside the node.
    #[inline]
    pub fn child_index(&self, center: &Coord<D>, node_radius: u64, pos: &Coord<D>) -> usize {
        let r = node_radius as i64;
        let mut m = 1;
        let mut index = 0;
        for i in 0..D {
            let a = pos[i] - center[i];
            let digit = if a < -r {
                0
            } else if a > r {
                2
            } else {
                1
            };
            index += digit * m;
            m *= 3;
        }
        index
    }

    #[inline]
    pub fn child_center(&self, center: &Coord<D>, node_radius: u64, pos: &Coord<D>) -> Coord<D> {
        let index = self.child_index(center, node_radius, pos);
        self.child_center_from_index(center, node_radius, index)
    }

    pub fn child_center_from_index(
        &self,
        center: &Coord<D>,
        node_radius: u64,
        mut index: usize,
    ) -> Coord<D> {
        let step = (2 * node_radius + 1) as i64;
        let mut child = *center;
        for c in child.iter_mut() {
            match index % 3 {
                0 => *c -= step,
                2 => *c += step,
                _ => {}
            }
            index /= 3;
        }
        child
    }

    #[inline]
    pub fn node_bounds(&self, center: &Coord<D>, node_radius: u64) -> IBox<D> {
        IBox::centered(*center, 3 * node_radius + 1)
    }

    /// Bounds of a child slot. Children of a node of radius `r` always have half-width `r`.
    #[inline]
    pub fn child_bounds(&self, center: &Coord<D>, node_radius: u64, index: usize) -> IBox<D> {
        IBox::centered(
            self.child_center_from_index(center, node_radius, index),
            node_radius,
        )
    }

    #[inline]
    pub fn leaf_bounds(&self, center: &Coord<D>) -> IBox<D> {
        IBox::centered(*center, self.radius)
    }

    #[inline]
    pub fn leaf_contains(&self, center: &Coord<D>, pos: &Coord<D>) -> bool {
        let r = self.radius as i64;
        (0..D).all(|i| (pos[i] - center[i]).abs() <= r)
    }

    /// The linear index of `pos` among the sites of the leaf centered at `center`. Assumes `pos` is inside the leaf.
    #[inline]
    pub fn leaf_offset(&self, center: &Coord<D>, pos: &Coord<D>) -> usize {
        let r = self.radius as i64;
        let mut offset = 0;
        let mut m = 1;
        for i in 0..D {
            offset += (pos[i] - center[i] + r) as u64 * m;
            m *= self.leaf_side;
        }
        offset as usize
    }

    /// Inverse of [`BoxShape::leaf_offset`].
    #[inline]
    pub fn leaf_position(&self, center: &Coord<D>, offset: usize) -> Coord<D> {
        let r = self.radius as i64;
        let mut rest = offset as u64;
        let mut pos = *center;
        for p in pos.iter_mut() {
            *p += (rest % self.leaf_side) as i64 - r;
            rest /= self.leaf_side;
        }
        pos
    }

    /// The number of sites in a cube of the given half-width, saturating at `u64::MAX`.
    pub fn cube_sites(&self, half_width: u64) -> u64 {
        let side = half_width.saturating_mul(2).saturating_add(1);
        (0..D).fold(1u64, |acc, _| acc.saturating_mul(side))
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_bad_parameters() {
        assert_eq!(
            BoxShape::<0>::new(1).unwrap_err(),
            GridError::InvalidDimension(0)
        );
        assert_eq!(
            BoxShape::<13>::new(1).unwrap_err(),
            GridError::InvalidDimension(13)
        );
        assert!(matches!(
            BoxShape::<2>::new(0),
            Err(GridError::InvalidRadius { radius: 0, .. })
        ));
        // (2 * 40000 + 1)^2 sites do not fit in a u32 count.
        assert!(BoxShape::<2>::new(40000).is_err());
        assert!(BoxShape::<2>::new(100).is_ok());
    }

    #[test]
    fn sizes() {
        let shape = BoxShape::<2>::new(2).unwrap();
        assert_eq!(shape.leaf_len(), 25);
        assert_eq!(shape.fan_out(), 9);
        assert_eq!(shape.middle_child(), 4);

        let shape = BoxShape::<3>::new(1).unwrap();
        assert_eq!(shape.leaf_len(), 27);
        assert_eq!(shape.fan_out(), 27);
        assert_eq!(shape.middle_child(), 13);
    }

    #[test]
    fn child_index_digits() {
        let shape = BoxShape::<2>::new(2).unwrap();
        let center = [0, 0];
        // Radius 2 node spans [-7, 7], children are [-7, -3], [-2, 2], [3, 7] along each axis.
        assert_eq!(shape.child_index(&center, 2, &[0, 0]), 4);
        assert_eq!(shape.child_index(&center, 2, &[-7, -7]), 0);
        assert_eq!(shape.child_index(&center, 2, &[-3, 0]), 3);
        assert_eq!(shape.child_index(&center, 2, &[3, 0]), 5);
        assert_eq!(shape.child_index(&center, 2, &[0, 7]), 7);
        assert_eq!(shape.child_index(&center, 2, &[7, 7]), 8);

        assert_eq!(shape.child_center(&center, 2, &[6, -4]), [5, -5]);
        assert_eq!(shape.child_center_from_index(&center, 2, 2), [5, -5]);
        assert_eq!(shape.child_bounds(&center, 2, 2), IBox::new([3, -7], [7, -3]));
    }

    #[test]
    fn node_containment() {
        let shape = BoxShape::<2>::new(2).unwrap();
        assert!(shape.node_contains(&[0, 0], 2, &[7, -7]));
        assert!(!shape.node_contains(&[0, 0], 2, &[8, 0]));
        assert!(shape.node_contains(&[0, 0], 7, &[22, 0]));
        assert!(!shape.node_contains(&[0, 0], 7, &[0, -23]));
    }

    #[test]
    fn node_radius_sequence() {
        let shape = BoxShape::<2>::new(2).unwrap();
        assert_eq!(shape.parent_radius(2), 7);
        assert_eq!(shape.child_radius(7), 2);
        assert!(shape.is_node_radius(2));
        assert!(shape.is_node_radius(7));
        assert!(shape.is_node_radius(22));
        assert!(!shape.is_node_radius(21));
        assert!(!shape.is_node_radius(1));
    }

    #[test]
    fn leaf_addressing() {
        let shape = BoxShape::<2>::new(2).unwrap();
        let center = [5, -5];
        assert!(shape.leaf_contains(&center, &[3, -7]));
        assert!(!shape.leaf_contains(&center, &[8, -5]));
        assert_eq!(shape.leaf_offset(&center, &[3, -7]), 0);
        assert_eq!(shape.leaf_offset(&center, &[4, -7]), 1);
        assert_eq!(shape.leaf_offset(&center, &[3, -6]), 5);
        assert_eq!(shape.leaf_offset(&center, &[7, -3]), 24);
        for offset in 0..shape.leaf_len() {
            let p = shape.leaf_position(&center, offset);
            assert!(shape.leaf_contains(&center, &p));
            assert_eq!(shape.leaf_offset(&center, &p), offset);
        }
    }

    #[test]
    fn box_queries() {
        let b = IBox::new([0, 0], [4, 10]);
        assert!(b.contains(&[4, 10]));
        assert!(!b.contains(&[5, 10]));
        assert_eq!(b.boundary_distance(&[2, 3]), Some(2));
        assert_eq!(b.boundary_distance(&[1, 5]), Some(1));
        assert_eq!(b.boundary_distance(&[-1, 5]), None);
        assert!(b.intersects(&IBox::new([4, 10], [6, 12])));
        assert!(!b.intersects(&IBox::new([5, 0], [6, 12])));
        assert!(b.contains_box(&IBox::point([2, 2])));

        let mut r = IBox::point([0, 0]);
        r.include(&[1, -3]);
        assert_eq!(r, IBox::new([0, -3], [1, 0]));

        let shape = BoxShape::<2>::new(2).unwrap();
        assert_eq!(shape.cube_sites(2), 25);
        assert_eq!(shape.cube_sites(u64::MAX), u64::MAX);
    }
}
