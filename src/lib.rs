//! Sparse grids over the integer lattice `Z^D`.
//!
//! Store any type in a [`GridBasic`](crate::GridBasic) or a [`GridFactor`](crate::GridFactor), both of which map an
//! arbitrary coordinate `[i64; D]` to a `T`. Storage is only created for the sites that are actually touched: the
//! lattice is covered by a box tree with fan-out `3^D` whose leaves hold dense blocks of `(2R + 1)^D` values, and the
//! tree grows outward from the origin as accesses reach further.
//!
//! [`GridFactor`](crate::GridFactor) additionally collapses regions that hold a single "special" value into one shared
//! object, so that memory grows with the information content of the assignment rather than with the visited volume.
//!
//! # Performance
//!
//! Every grid remembers the box it touched last and walks the tree from there, so the cost of an access is proportional
//! to the tree distance from the previous one. Sweeping neighboring sites is therefore much cheaper than jumping around.
//!
//! - random access: O(depth)
//! - access next to the previous one: O(1)
//! - memory usage per leaf: `(2R + 1)^D * size_of::<T>()` bytes plus a small header
//! - memory usage per node: `3^D * 8` bytes plus a small header
//!
//! # Concurrency
//!
//! Writes take `&mut self`. Reads through [`GridBasic::peek`](crate::GridBasic::peek) and
//! [`GridBasic::peek_hinted`](crate::GridBasic::peek_hinted) only take `&self` and never allocate, so any number of
//! threads may peek at a shared grid. Give each thread its own [`PeekHint`](crate::PeekHint) to keep their walks short.
//!
//! The supported pattern is many readers while no writer is active. A peek can never overlap a write: the borrow
//! checker rejects it, so a grid shared with a writer thread has to sit behind a lock such as `RwLock`, which
//! serializes the writer against every reader.

mod archive;
mod config;
mod error;
mod grid_basic;
mod grid_factor;
mod pool;
mod shape;
mod tree;

pub use archive::*;
pub use config::*;
pub use error::*;
pub use grid_basic::*;
pub use grid_factor::*;
pub use pool::*;
pub use shape::*;
pub use tree::PeekHint;

#[cfg(feature = "glam")]
mod impl_glam;
#[cfg(feature = "glam")]
pub use impl_glam::*;

#[cfg(feature = "glam")]
pub use glam;

/// A site of the lattice `Z^D`.
pub type Coord<const D: usize> = [i64; D];

/// Anything that names a site of `Z^D`.
pub trait IntoCoord<const D: usize> {
    fn into_coord(self) -> Coord<D>;
}

impl<const D: usize> IntoCoord<D> for [i64; D] {
    #[inline]
    fn into_coord(self) -> Coord<D> {
        self
    }
}

impl<const D: usize> IntoCoord<D> for &[i64; D] {
    #[inline]
    fn into_coord(self) -> Coord<D> {
        *self
    }
}

impl IntoCoord<2> for (i64, i64) {
    #[inline]
    fn into_coord(self) -> Coord<2> {
        [self.0, self.1]
    }
}

impl IntoCoord<3> for (i64, i64, i64) {
    #[inline]
    fn into_coord(self) -> Coord<3> {
        [self.0, self.1, self.2]
    }
}
