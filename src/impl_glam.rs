use crate::{Coord, GridBasic, GridFactor, IntoCoord};

use glam::{I64Vec2, I64Vec3, IVec2, IVec3};

/// A plane grid.
pub type GridBasic2<T> = GridBasic<T, 2>;
/// A volume grid.
pub type GridBasic3<T> = GridBasic<T, 3>;

/// A factorizing plane grid.
pub type GridFactor2<T> = GridFactor<T, 2>;
/// A factorizing volume grid.
pub type GridFactor3<T> = GridFactor<T, 3>;

macro_rules! impl_into_coord {
    ($vector:ty, $dim:literal, [$($axis:ident),+]) => {
        impl IntoCoord<$dim> for $vector {
            #[inline]
            fn into_coord(self) -> Coord<$dim> {
                [$(self.$axis as i64),+]
            }
        }

        impl IntoCoord<$dim> for &$vector {
            #[inline]
            fn into_coord(self) -> Coord<$dim> {
                (*self).into_coord()
            }
        }
    };
}

impl_into_coord!(IVec2, 2, [x, y]);
impl_into_coord!(IVec3, 3, [x, y, z]);
impl_into_coord!(I64Vec2, 2, [x, y]);
impl_into_coord!(I64Vec3, 3, [x, y, z]);

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    use crate::GridConfig;

    #[test]
    fn glam_vectors_address_sites() {
        let mut grid = GridBasic3::<u8>::new(GridConfig::for_dimension(3)).unwrap();
        grid.set(IVec3::new(1, -2, 3), 7).unwrap();
        assert_eq!(grid.peek([1, -2, 3]), Some(&7));
        assert_eq!(grid.peek(I64Vec3::new(1, -2, 3)), Some(&7));
        assert_eq!(grid.peek(&IVec3::new(1, -2, 3)), Some(&7));

        let mut plane = GridBasic2::<u8>::new(GridConfig::for_dimension(2)).unwrap();
        plane.set(I64Vec2::new(-5, 9), 1).unwrap();
        assert_eq!(plane.peek(IVec2::new(-5, 9)), Some(&1));
    }
}
