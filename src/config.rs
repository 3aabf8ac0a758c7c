use crate::{BoxShape, GridError, GridResult};

/// The pool chunk length used unless configured otherwise.
pub const DEFAULT_POOL_CHUNK_LEN: usize = 200;

/// The elementary radius used by [`GridConfig::for_dimension`].
///
/// Leaves get smaller as the dimension grows so that a single leaf stays in the tens of thousands of sites.
pub fn default_radius(dimension: usize) -> u64 {
    match dimension {
        1 => 10000,
        2 => 100,
        3 => 20,
        4 => 6,
        5 => 3,
        _ => 1,
    }
}

/// Construction parameters shared by every grid.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct GridConfig {
    /// Every leaf holds the `(2 * radius + 1)^D` sites within `radius` of its center.
    pub radius: u64,
    /// The number of nodes or leaves requested from the system at once.
    pub pool_chunk_len: usize,
    /// When false, cells are abandoned instead of dropped when the grid is reset or dropped.
    pub call_destructors: bool,
}

impl GridConfig {
    pub fn for_dimension(dimension: usize) -> Self {
        Self {
            radius: default_radius(dimension),
            pool_chunk_len: DEFAULT_POOL_CHUNK_LEN,
            call_destructors: true,
        }
    }

    pub fn with_radius(mut self, radius: u64) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_pool_chunk_len(mut self, pool_chunk_len: usize) -> Self {
        self.pool_chunk_len = pool_chunk_len;
        self
    }

    pub fn with_call_destructors(mut self, call_destructors: bool) -> Self {
        self.call_destructors = call_destructors;
        self
    }

    /// Checks every parameter against the dimension `D` and returns the resulting tree geometry.
    pub fn validate<const D: usize>(&self) -> GridResult<BoxShape<D>> {
        let shape = BoxShape::new(self.radius)?;
        if self.pool_chunk_len == 0 {
            return Err(GridError::InvalidChunkLength);
        }
        Ok(shape)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
