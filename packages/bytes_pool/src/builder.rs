use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{BytesPool, Error, Result};

/// Chunk size of the smallest size class when none is specified.
pub const DEFAULT_INITIAL_SIZE: usize = 512;

/// Upper bound on the largest size class when none is specified.
pub const DEFAULT_MAX_SIZE: usize = 64 * 1024;

/// Bytes reserved for each size class when no budget is specified.
pub const DEFAULT_MEMORY_BUDGET: usize = 3 * 1024 * 1024;

/// Builder for creating an instance of [`BytesPool`].
///
/// All settings are optional and fall back to [`DEFAULT_INITIAL_SIZE`], [`DEFAULT_MAX_SIZE`]
/// and [`DEFAULT_MEMORY_BUDGET`].
///
/// # Examples
///
/// ```
/// use bytes_pool::BytesPool;
///
/// let pool = BytesPool::builder()
///     .initial_size(64)
///     .max_size(4096)
///     .memory_budget(1024 * 1024)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.size_classes().count(), 7);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct BytesPoolBuilder {
    initial_size: usize,
    max_size: usize,
    memory_budget: usize,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl BytesPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            _not_sync: PhantomData,
        }
    }

    /// Sets the chunk size of the smallest size class. Each further size class doubles it.
    #[inline]
    pub fn initial_size(mut self, bytes: usize) -> Self {
        self.initial_size = bytes;
        self
    }

    /// Sets the largest request the pool serves from a size class. Larger requests always
    /// get a plain heap buffer.
    #[inline]
    pub fn max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    /// Sets how many bytes each size class reserves. A size class of chunk size `s` holds
    /// `memory_budget / s` chunks, and chunk sizes above the budget get no size class.
    #[inline]
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Reserves the memory of every size class and builds the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if a size is zero, if the initial size exceeds the max size, if a
    /// size class would hold more chunks than it can index or if the memory for a size class
    /// cannot be reserved.
    #[inline]
    pub fn build(self) -> Result<BytesPool> {
        let initial_size = non_zero(self.initial_size, "initial_size")?;
        let max_size = non_zero(self.max_size, "max_size")?;
        let memory_budget = non_zero(self.memory_budget, "memory_budget")?;

        if initial_size > max_size {
            return Err(Error::InitialExceedsMax {
                initial_size: initial_size.get(),
                max_size: max_size.get(),
            });
        }

        BytesPool::new_inner(initial_size, max_size, memory_budget)
    }
}

fn non_zero(value: usize, parameter: &'static str) -> Result<NonZero<usize>> {
    NonZero::new(value).ok_or(Error::ZeroSize { parameter })
}
