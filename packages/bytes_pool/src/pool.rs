use std::num::NonZero;
use std::ptr::NonNull;

use new_zealand::nz;
use nm::Event;
use tracing::{debug, trace};

use crate::metrics::{ALLOC_HEAP_BYTES, ALLOC_POOLED_BYTES, RELEASE_POOLED};
use crate::{BytesPoolBuilder, PooledBytes, Result, SizeClass, SizeClassInfo};

/// Each size class has chunks this many times larger than the previous one.
const GROWTH_FACTOR: NonZero<usize> = nz!(2);

/// A lock-free pool of byte buffers in a fixed set of size classes.
///
/// At construction, the pool creates one size class per chunk size `initial_size`,
/// `initial_size * 2`, `initial_size * 4` and so on, up to `max_size` and the memory budget.
/// Each size class reserves one contiguous block of up to `memory_budget` bytes and slices it
/// into chunks. Nothing is added, removed or resized afterwards.
///
/// [`allocate()`](Self::allocate) takes a chunk from the smallest size class that fits the
/// request. If the request is larger than `max_size`, or that size class has no free chunk
/// left, the pool hands out an ordinary heap buffer instead. It never blocks, and running out
/// of chunks is never an error.
///
/// [`release()`](Self::release) (or simply dropping the buffer) puts the chunk back. Heap
/// buffers are freed as usual.
///
/// # Examples
///
/// ```
/// use bytes_pool::BytesPool;
///
/// let pool = BytesPool::new(32, 1024, 1024).unwrap();
///
/// let mut small = pool.allocate(5);
/// assert_eq!(small.len(), 5);
/// assert_eq!(small.capacity(), 32);
/// small.copy_from_slice(b"hello");
///
/// let large = pool.allocate(2046);
/// assert_eq!(large.len(), 2046);
/// assert_eq!(large.capacity(), 2046);
/// assert!(!large.is_pooled());
///
/// pool.release(small);
/// pool.release(large);
/// ```
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]). Share it by reference (e.g. from a scoped
/// thread or an `Arc`) and allocate and release from any number of threads at once. All
/// coordination happens through one atomic word per size class and per chunk.
#[derive(Debug)]
pub struct BytesPool {
    initial_size: NonZero<usize>,
    max_size: NonZero<usize>,
    memory_budget: NonZero<usize>,

    /// Ordered by ascending chunk size, each double the previous.
    size_classes: Box<[SizeClass]>,
}

impl BytesPool {
    /// Creates a builder for configuring and constructing a [`BytesPool`].
    #[inline]
    pub fn builder() -> BytesPoolBuilder {
        BytesPoolBuilder::new()
    }

    /// Creates a pool with the given smallest chunk size, largest pooled size and per size
    /// class memory budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid or if the memory for a size class cannot
    /// be reserved. See [`BytesPoolBuilder::build()`].
    ///
    /// # Examples
    ///
    /// ```
    /// use bytes_pool::BytesPool;
    ///
    /// let pool = BytesPool::new(512, 64 * 1024, 3 * 1024 * 1024).unwrap();
    ///
    /// assert_eq!(pool.size_classes().count(), 8);
    /// ```
    #[inline]
    pub fn new(initial_size: usize, max_size: usize, memory_budget: usize) -> Result<Self> {
        Self::builder()
            .initial_size(initial_size)
            .max_size(max_size)
            .memory_budget(memory_budget)
            .build()
    }

    /// Creates the size classes. Parameters are validated by the builder.
    pub(crate) fn new_inner(
        initial_size: NonZero<usize>,
        max_size: NonZero<usize>,
        memory_budget: NonZero<usize>,
    ) -> Result<Self> {
        let mut size_classes = Vec::new();
        let mut next_chunk_size = Some(initial_size);

        while let Some(chunk_size) =
            next_chunk_size.filter(|size| *size <= max_size && *size <= memory_budget)
        {
            #[expect(
                clippy::integer_division,
                reason = "any remainder of the budget is left unused"
            )]
            let chunk_count = NonZero::new(memory_budget.get() / chunk_size.get())
                .expect("chunk size is within the budget, so at least one chunk fits");

            size_classes.push(SizeClass::new(chunk_size, chunk_count)?);

            debug!(
                chunk_size = chunk_size.get(),
                chunk_count = chunk_count.get(),
                "reserved bytes pool size class"
            );

            next_chunk_size = chunk_size.checked_mul(GROWTH_FACTOR);
        }

        debug!(
            initial_size = initial_size.get(),
            max_size = max_size.get(),
            memory_budget = memory_budget.get(),
            size_classes = size_classes.len(),
            "created bytes pool"
        );

        Ok(Self {
            initial_size,
            max_size,
            memory_budget,
            size_classes: size_classes.into_boxed_slice(),
        })
    }

    /// Chunk size of the smallest size class.
    #[must_use]
    #[inline]
    pub fn initial_size(&self) -> usize {
        self.initial_size.get()
    }

    /// Requests above this size always get a heap buffer.
    #[must_use]
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size.get()
    }

    /// Bytes each size class was allowed to reserve.
    #[must_use]
    #[inline]
    pub fn memory_budget(&self) -> usize {
        self.memory_budget.get()
    }

    /// Describes the size classes of the pool, smallest chunk size first.
    ///
    /// # Examples
    ///
    /// ```
    /// use bytes_pool::BytesPool;
    ///
    /// let pool = BytesPool::new(32, 1024, 1024).unwrap();
    ///
    /// let _buffer = pool.allocate(20);
    ///
    /// let smallest = pool.size_classes().next().unwrap();
    /// assert_eq!(smallest.chunk_size(), 32);
    /// assert_eq!(smallest.chunk_count(), 32);
    /// assert_eq!(smallest.free_chunks(), 31);
    /// ```
    pub fn size_classes(&self) -> impl Iterator<Item = SizeClassInfo> + '_ {
        self.size_classes.iter().map(SizeClass::info)
    }

    /// Obtains a buffer of exactly `size` bytes.
    ///
    /// If a size class serves the request, the buffer is a chunk of pool memory: its length is
    /// `size` and its capacity is the chunk size. The chunk keeps whatever bytes its previous
    /// holder left in it.
    ///
    /// Otherwise (the request is above [`max_size()`](Self::max_size), no size class is large
    /// enough, or the matching size class has no free chunk) the buffer is a new zero-filled
    /// heap allocation whose length and capacity are both `size`. Only the first size class
    /// that fits is tried.
    ///
    /// # Panics
    ///
    /// Panics if the request takes the heap fallback and the global allocator cannot provide
    /// `size` bytes, as with any `Vec` allocation. This includes any `size` above `isize::MAX`.
    #[must_use]
    pub fn allocate(&self, size: usize) -> PooledBytes<'_> {
        if let Some(bytes) = self.allocate_chunk(size) {
            ALLOC_POOLED_BYTES.with(|e| e.observe(size));
            return bytes;
        }

        ALLOC_HEAP_BYTES.with(|e| e.observe(size));
        trace!(size, "bytes pool allocation falling back to heap");

        PooledBytes::from_heap(vec![0; size].into_boxed_slice())
    }

    fn allocate_chunk(&self, size: usize) -> Option<PooledBytes<'_>> {
        if size > self.max_size.get() {
            return None;
        }

        let size_class = self
            .size_classes
            .iter()
            .find(|size_class| size_class.chunk_size() >= size)?;

        let index = size_class.pop()?;

        Some(PooledBytes::from_chunk(
            self,
            size_class.chunk_ptr(index),
            size,
            size_class.chunk_size(),
        ))
    }

    /// Returns a buffer to the pool.
    ///
    /// A chunk goes back onto the free stack of its size class, where it is the next chunk
    /// that size class hands out. A heap buffer is simply freed. This is the same as dropping
    /// the buffer, so a buffer allocated from a different pool goes back to that pool.
    #[inline]
    pub fn release(&self, bytes: PooledBytes<'_>) {
        drop(bytes);
    }

    /// Returns a chunk to the pool given the pointer and capacity obtained from
    /// [`PooledBytes::into_raw_parts()`].
    ///
    /// Returns `true` if the pointer belongs to one of the size classes and the chunk went
    /// back onto its free stack. Returns `false` and does nothing for any other pointer, such
    /// as that of a heap buffer (which stays the caller's to free).
    ///
    /// # Panics
    ///
    /// Panics if the chunk is already free, i.e. it is released twice with no allocation of
    /// it in between.
    ///
    /// Panics if the pointer lies inside a size class but is not the start of a chunk, or if
    /// the capacity is not the chunk size of that size class.
    ///
    /// # Safety
    ///
    /// If the pointer belongs to this pool, the caller must ensure that it was obtained from a
    /// buffer allocated from this pool that has not been allocated again since, and that no
    /// reference into the buffer is used after this call.
    ///
    /// # Examples
    ///
    /// ```
    /// use bytes_pool::BytesPool;
    ///
    /// let pool = BytesPool::new(32, 1024, 1024).unwrap();
    ///
    /// let (ptr, _len, capacity) = pool.allocate(10).into_raw_parts();
    ///
    /// // SAFETY: The pointer came from this pool and we no longer use the buffer.
    /// let returned = unsafe { pool.release_raw(ptr, capacity) };
    /// assert!(returned);
    /// ```
    pub unsafe fn release_raw(&self, ptr: NonNull<u8>, capacity: usize) -> bool {
        self.return_chunk(ptr, capacity)
    }

    /// Routes a chunk back to its size class by address.
    pub(crate) fn return_chunk(&self, ptr: NonNull<u8>, capacity: usize) -> bool {
        let address = ptr.as_ptr().addr();

        for size_class in &self.size_classes {
            let Some(index) = size_class.chunk_index_of(address) else {
                continue;
            };

            assert!(
                size_class.chunk_ptr(index) == ptr && size_class.chunk_size() == capacity,
                "buffer at {address:#x} with capacity {capacity} is not a whole chunk of the {}-byte size class",
                size_class.chunk_size()
            );

            size_class.push(index);
            RELEASE_POOLED.with(Event::observe_once);

            return true;
        }

        false
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(BytesPool: Send, Sync, std::fmt::Debug);

    fn chunk_sizes(pool: &BytesPool) -> Vec<usize> {
        pool.size_classes()
            .map(|size_class| size_class.chunk_size())
            .collect()
    }

    #[test]
    fn size_classes_double_up_to_max_size() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        assert_eq!(chunk_sizes(&pool), [32, 64, 128, 256, 512, 1024]);
    }

    #[test]
    fn chunk_count_is_budget_divided_by_chunk_size() {
        let pool = BytesPool::new(512, 64 * 1024, 3 * 1024 * 1024).unwrap();

        for size_class in pool.size_classes() {
            assert_eq!(
                size_class.chunk_count(),
                3 * 1024 * 1024 / size_class.chunk_size()
            );
            assert_eq!(size_class.free_chunks(), size_class.chunk_count());
        }
    }

    #[test]
    fn budget_caps_the_largest_size_class() {
        let pool = BytesPool::new(32, 4096, 200).unwrap();

        assert_eq!(chunk_sizes(&pool), [32, 64, 128]);

        let counts = pool
            .size_classes()
            .map(|size_class| size_class.chunk_count())
            .collect::<Vec<_>>();
        assert_eq!(counts, [6, 3, 1]);
    }

    #[test]
    fn max_size_between_powers_stops_below_it() {
        let pool = BytesPool::new(32, 100, 1024).unwrap();

        assert_eq!(chunk_sizes(&pool), [32, 64]);
    }

    #[test]
    fn budget_below_initial_size_gives_no_size_classes() {
        let pool = BytesPool::new(64, 128, 32).unwrap();

        assert_eq!(pool.size_classes().count(), 0);

        let buffer = pool.allocate(16);
        assert!(!buffer.is_pooled());
        assert_eq!(buffer.capacity(), 16);
    }

    #[test]
    fn allocate_picks_smallest_fitting_size_class() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        for (size, expected_capacity) in [(1, 32), (32, 32), (33, 64), (200, 256), (1024, 1024)] {
            let buffer = pool.allocate(size);

            assert!(buffer.is_pooled());
            assert_eq!(buffer.len(), size);
            assert_eq!(buffer.capacity(), expected_capacity);
        }
    }

    #[test]
    fn allocate_zero_comes_from_smallest_size_class() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        let buffer = pool.allocate(0);

        assert!(buffer.is_pooled());
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 32);
    }

    #[test]
    fn allocate_above_max_size_uses_heap() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        let buffer = pool.allocate(2046);

        assert!(!buffer.is_pooled());
        assert_eq!(buffer.len(), 2046);
        assert_eq!(buffer.capacity(), 2046);
        assert!(buffer.iter().all(|byte| *byte == 0));

        pool.release(buffer);
    }

    #[test]
    fn allocate_between_largest_class_and_max_size_uses_heap() {
        let pool = BytesPool::new(32, 100, 1024).unwrap();

        let buffer = pool.allocate(80);

        assert!(!buffer.is_pooled());
        assert_eq!(buffer.capacity(), 80);
    }

    #[test]
    fn release_then_allocate_returns_same_chunk() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        let first = pool.allocate(20);
        let address = first.as_ptr().addr();
        pool.release(first);

        let second = pool.allocate(30);
        assert_eq!(second.as_ptr().addr(), address);
    }

    #[test]
    fn exhausted_size_class_falls_back_to_heap_without_trying_larger_classes() {
        let pool = BytesPool::new(128, 256, 512).unwrap();

        let held = (0..4).map(|_| pool.allocate(100)).collect::<Vec<_>>();
        assert!(held.iter().all(PooledBytes::is_pooled));
        assert_eq!(pool.size_classes().next().unwrap().free_chunks(), 0);

        let fallback = pool.allocate(100);
        assert!(!fallback.is_pooled());
        assert_eq!(fallback.capacity(), 100);

        // The 256-byte size class was not touched.
        assert_eq!(pool.size_classes().nth(1).unwrap().free_chunks(), 2);

        drop(held);
        assert_eq!(pool.size_classes().next().unwrap().free_chunks(), 4);
        assert!(pool.allocate(100).is_pooled());
    }

    #[test]
    fn outstanding_buffers_never_overlap() {
        let pool = BytesPool::new(16, 64, 256).unwrap();

        let held = (0..30).map(|i| pool.allocate(i % 70)).collect::<Vec<_>>();

        let pooled_addresses = held
            .iter()
            .filter(|buffer| buffer.is_pooled())
            .map(|buffer| buffer.as_ptr().addr())
            .collect::<Vec<_>>();
        let unique = pooled_addresses.iter().collect::<HashSet<_>>();

        assert_eq!(unique.len(), pooled_addresses.len());
    }

    #[test]
    #[should_panic]
    fn allocate_beyond_address_space_panics() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        _ = pool.allocate(usize::MAX);
    }

    #[test]
    fn release_raw_of_heap_pointer_is_ignored() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        let buffer = pool.allocate(4096);
        let mut owned = buffer.to_vec();

        let ptr = NonNull::new(owned.as_mut_ptr()).unwrap();

        // SAFETY: The pointer does not belong to the pool.
        let returned = unsafe { pool.release_raw(ptr, owned.capacity()) };
        assert!(!returned);
    }

    #[test]
    fn release_raw_of_chunk_returns_it() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        let (ptr, len, capacity) = pool.allocate(40).into_raw_parts();
        assert_eq!(len, 40);
        assert_eq!(capacity, 64);

        // SAFETY: The pointer came from this pool and the buffer is no longer used.
        assert!(unsafe { pool.release_raw(ptr, capacity) });

        assert_eq!(pool.allocate(64).as_ptr(), ptr.as_ptr().cast_const());
    }

    #[test]
    #[should_panic]
    fn double_release_panics() {
        let pool = BytesPool::new(128, 1024, 1024).unwrap();

        let (ptr, _len, capacity) = pool.allocate(64).into_raw_parts();

        // SAFETY: The pointer came from this pool and the buffer is no longer used.
        unsafe {
            pool.release_raw(ptr, capacity);
        }

        // SAFETY: Deliberately violating the contract to exercise the double release check.
        unsafe {
            pool.release_raw(ptr, capacity);
        }
    }

    #[test]
    #[should_panic]
    fn release_raw_with_wrong_capacity_panics() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        let (ptr, len, _capacity) = pool.allocate(10).into_raw_parts();

        // SAFETY: Deliberately passing a truncated capacity to exercise the check.
        unsafe {
            pool.release_raw(ptr, len);
        }
    }

    #[test]
    #[should_panic]
    fn release_raw_of_chunk_interior_panics() {
        let pool = BytesPool::new(32, 1024, 1024).unwrap();

        let (ptr, _len, capacity) = pool.allocate(10).into_raw_parts();

        // SAFETY: Stays within the chunk.
        let interior = unsafe { ptr.add(4) };

        // SAFETY: Deliberately passing a sub-sliced pointer to exercise the check.
        unsafe {
            pool.release_raw(interior, capacity);
        }
    }

    #[test]
    fn buffers_from_another_pool_go_back_to_that_pool() {
        let pool_a = BytesPool::new(32, 64, 64).unwrap();
        let pool_b = BytesPool::new(32, 64, 64).unwrap();

        let buffer = pool_a.allocate(8);
        pool_b.release(buffer);

        assert_eq!(pool_a.size_classes().next().unwrap().free_chunks(), 2);
        assert_eq!(pool_b.size_classes().next().unwrap().free_chunks(), 2);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn scoped_threads_share_the_pool() {
        let pool = BytesPool::new(64, 256, 64 * 64).unwrap();

        thread::scope(|scope| {
            for seed in 0..4_u8 {
                let pool = &pool;

                scope.spawn(move || {
                    for _ in 0..500 {
                        let mut buffer = pool.allocate(48);
                        buffer.fill(seed);
                        assert!(buffer.iter().all(|byte| *byte == seed));
                        pool.release(buffer);
                    }
                });
            }
        });

        for size_class in pool.size_classes() {
            assert_eq!(size_class.free_chunks(), size_class.chunk_count());
        }
    }
}
