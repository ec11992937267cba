/// A snapshot of one size class of a [`BytesPool`][crate::BytesPool].
///
/// # Examples
///
/// ```
/// use bytes_pool::BytesPool;
///
/// let pool = BytesPool::new(32, 128, 1024).unwrap();
///
/// let chunk_sizes = pool
///     .size_classes()
///     .map(|class| class.chunk_size())
///     .collect::<Vec<_>>();
///
/// assert_eq!(chunk_sizes, [32, 64, 128]);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SizeClassInfo {
    chunk_size: usize,
    chunk_count: usize,
    free_chunks: usize,
}

impl SizeClassInfo {
    #[must_use]
    pub(crate) fn new(chunk_size: usize, chunk_count: usize, free_chunks: usize) -> Self {
        Self {
            chunk_size,
            chunk_count,
            free_chunks,
        }
    }

    /// Size in bytes of every chunk in this size class.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks the size class was created with.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Number of chunks that were on the free stack when the snapshot was taken.
    ///
    /// Under concurrent use this is already stale by the time you read it.
    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.free_chunks
    }
}
