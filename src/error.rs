use thiserror::Error;

/// Failure to obtain storage from a [`Pool`](crate::Pool).
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum PoolError {
    #[error("the system allocator refused a request of {requested} bytes")]
    Exhausted { requested: usize },
    #[error("the pool cannot address more than {max} slots")]
    CapacityExceeded { max: usize },
}

/// Failure while reading or writing an archive record stream.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ArchiveError {
    #[error("the archive ended before the expected record")]
    UnexpectedEnd,
    #[error("expected a record tagged {expected:?}, found {found:?}")]
    TagMismatch { expected: String, found: String },
    #[error("expected a {expected} token, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("header field {field} is {found}, expected {expected}")]
    HeaderMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },
    #[error("malformed archive: {0}")]
    Malformed(String),
}

impl ArchiveError {
    pub fn header_mismatch(
        field: &'static str,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        Self::HeaderMismatch {
            field,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub fn malformed(msg: impl AsRef<str>) -> Self {
        Self::Malformed(msg.as_ref().to_owned())
    }
}

/// The error type of every fallible grid operation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GridError {
    #[error("dimension {0} is not supported")]
    InvalidDimension(usize),
    #[error("elementary radius {radius} is not supported in dimension {dimension}")]
    InvalidRadius { radius: u64, dimension: usize },
    #[error("pool chunk length must be positive")]
    InvalidChunkLength,
    #[error("special range [{min}, {max}] holds more than {capacity} values")]
    SpecialRangeTooLarge { min: i64, max: i64, capacity: usize },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("coordinate {0:?} is outside the representable range")]
    OutOfRange(Vec<i64>),
    #[error("the grid holds {0} factorized cells")]
    CollapsedRegions(u64),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub type GridResult<T> = Result<T, GridError>;
