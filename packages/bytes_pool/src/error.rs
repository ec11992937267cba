use thiserror::Error;

/// Errors that can occur when building a [`BytesPool`][crate::BytesPool].
///
/// Once built, a pool never returns errors: exhaustion falls back to the heap and misuse of a
/// released buffer is a panic.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// One of the sizes given to the builder was zero.
    #[error("{parameter} must be greater than zero")]
    ZeroSize {
        /// Name of the offending builder parameter.
        parameter: &'static str,
    },

    /// The smallest size class would be larger than the largest one.
    #[error("initial size {initial_size} exceeds max size {max_size}")]
    InitialExceedsMax {
        /// The configured initial (smallest) chunk size.
        initial_size: usize,

        /// The configured maximum chunk size.
        max_size: usize,
    },

    /// A size class would hold more chunks than its free stack can index.
    #[error(
        "size class of {chunk_size} bytes would hold {chunk_count} chunks, more than a free stack can index"
    )]
    TooManyChunks {
        /// Chunk size of the offending size class.
        chunk_size: usize,

        /// Number of chunks the memory budget would give it.
        chunk_count: usize,
    },

    /// The memory block for a size class could not be reserved.
    #[error("failed to reserve {bytes} bytes for a size class")]
    OutOfMemory {
        /// Size of the block that could not be reserved.
        bytes: usize,
    },
}

/// A specialized `Result` type for pool construction, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
