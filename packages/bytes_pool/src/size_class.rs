use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use new_zealand::nz;
use nm::Event;

use crate::free_link::{CHECKED_OUT, FreeLink, next_generation};
use crate::metrics::FREE_STACK_RETRIES;
use crate::{Error, Result, SizeClassInfo};

/// Alignment of the start of every region block. Chunk sizes are not required to be powers
/// of two, so only the first chunk of a region is guaranteed to have this alignment.
const REGION_ALIGNMENT: usize = 64;

/// The largest number of chunks a single size class may hold, limited by the 32-bit slot of
/// a [`FreeLink`].
pub(crate) const MAX_CHUNKS_PER_CLASS: usize = u32::MAX as usize;

/// Generation every chunk starts with. Generations are never zero.
const INITIAL_GENERATION: NonZero<u32> = nz!(1);

/// One contiguous memory block sliced into equally sized chunks, with a lock-free free stack
/// threaded through the per-chunk metadata.
///
/// The region owns its memory block exclusively. Chunks are identified by index and never
/// own memory of their own; a checked-out chunk is reachable only through the pointer handed
/// to the caller, a free chunk only through the stack.
///
/// # Thread safety
///
/// All mutable state is atomic. Any number of threads may pop and push concurrently.
pub(crate) struct SizeClass {
    chunk_size: NonZero<usize>,

    /// Start of the memory block, allocated with `layout` and owned by us.
    memory: NonNull<u8>,
    layout: Layout,

    chunks: Box<[Chunk]>,

    /// Encoded [`FreeLink`] pointing at the top of the free stack.
    head: AtomicU64,

    /// Point-in-time count of chunks on the free stack, for introspection only. The stack
    /// itself never consults this.
    ///
    /// A chunk is counted from just before it is pushed until just after it is popped, so the
    /// value always stays within `0..=chunk_count`.
    free_chunks: AtomicUsize,
}

/// Free-list metadata of one chunk. The chunk memory itself lives in the region block.
#[derive(Debug)]
struct Chunk {
    /// Encoded [`FreeLink`] to the next free chunk while on the stack, [`CHECKED_OUT`]
    /// while a caller holds the chunk.
    next_free: AtomicU64,

    /// How many times the chunk has been released (starting from 1, skipping 0 on wrap).
    /// Only the holder of the chunk touches this.
    generation: AtomicU32,
}

impl Chunk {
    fn new(next_free: FreeLink) -> Self {
        Self {
            next_free: AtomicU64::new(next_free.encode()),
            generation: AtomicU32::new(INITIAL_GENERATION.get()),
        }
    }

    fn generation(&self) -> NonZero<u32> {
        NonZero::new(self.generation.load(Ordering::Relaxed))
            .expect("chunk generation is only ever assigned non-zero values")
    }
}

impl SizeClass {
    /// Reserves the memory block for `chunk_count` chunks of `chunk_size` bytes and links
    /// all of them into the free stack, chunk 0 on top.
    pub(crate) fn new(chunk_size: NonZero<usize>, chunk_count: NonZero<usize>) -> Result<Self> {
        if chunk_count.get() > MAX_CHUNKS_PER_CLASS {
            return Err(Error::TooManyChunks {
                chunk_size: chunk_size.get(),
                chunk_count: chunk_count.get(),
            });
        }

        let total_bytes = chunk_size
            .get()
            .checked_mul(chunk_count.get())
            .ok_or(Error::OutOfMemory { bytes: usize::MAX })?;

        let layout = Layout::from_size_align(total_bytes, REGION_ALIGNMENT)
            .map_err(|_layout_error| Error::OutOfMemory { bytes: total_bytes })?;

        // SAFETY: The layout has a non-zero size because both factors are non-zero.
        let memory = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(Error::OutOfMemory { bytes: total_bytes })?;

        let last_index = chunk_count.get().wrapping_sub(1);

        let chunks = (0..chunk_count.get())
            .map(|index| {
                if index == last_index {
                    Chunk::new(FreeLink::end(INITIAL_GENERATION))
                } else {
                    // Cannot overflow, index is below the chunk count which fits in u32.
                    Chunk::new(FreeLink::to_chunk(
                        index.wrapping_add(1),
                        INITIAL_GENERATION,
                    ))
                }
            })
            .collect::<Box<[_]>>();

        Ok(Self {
            chunk_size,
            memory,
            layout,
            chunks,
            head: AtomicU64::new(FreeLink::to_chunk(0, INITIAL_GENERATION).encode()),
            free_chunks: AtomicUsize::new(chunk_count.get()),
        })
    }

    #[must_use]
    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size.get()
    }

    #[must_use]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Number of bytes in the region block.
    #[must_use]
    pub(crate) fn total_bytes(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub(crate) fn info(&self) -> SizeClassInfo {
        SizeClassInfo::new(
            self.chunk_size(),
            self.chunk_count(),
            self.free_chunks.load(Ordering::Relaxed),
        )
    }

    /// Pointer to the first byte of the chunk at `index`.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    #[must_use]
    pub(crate) fn chunk_ptr(&self, index: usize) -> NonNull<u8> {
        assert!(
            index < self.chunk_count(),
            "chunk {index} index out of bounds in size class of {} chunks",
            self.chunk_count()
        );

        // Cannot overflow, the product is below the block size.
        let offset = index.wrapping_mul(self.chunk_size.get());

        // SAFETY: The offset is within the block we allocated, as the index is in bounds.
        unsafe { self.memory.add(offset) }
    }

    /// Returns the index of the chunk whose memory contains `address`, or `None` if the
    /// address lies outside this region.
    #[must_use]
    pub(crate) fn chunk_index_of(&self, address: usize) -> Option<usize> {
        let offset = address.checked_sub(self.memory.as_ptr().addr())?;

        if offset >= self.total_bytes() {
            return None;
        }

        #[expect(
            clippy::integer_division,
            reason = "we want the chunk the offset falls into"
        )]
        let index = offset / self.chunk_size.get();

        Some(index)
    }

    /// Takes the chunk on top of the free stack, returning its index, or `None` if every
    /// chunk is checked out.
    #[cfg_attr(test, mutants::skip)] // Mutating the retry loop can spin forever.
    pub(crate) fn pop(&self) -> Option<usize> {
        let mut observed = self.head.load(Ordering::Acquire);

        loop {
            let top = FreeLink::decode(observed)
                .expect("free stack head always holds a link, never a checked-out marker");

            let index = top.chunk_index()?;
            let chunk = self.chunk(index);

            let next = chunk.next_free.load(Ordering::Acquire);

            match self
                .head
                .compare_exchange(observed, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // The chunk is off the stack, nobody reaches it through the head anymore.
                    chunk.next_free.store(CHECKED_OUT, Ordering::Release);
                    self.free_chunks.fetch_sub(1, Ordering::Relaxed);
                    return Some(index);
                }
                Err(actual) => {
                    observed = actual;
                    FREE_STACK_RETRIES.with(Event::observe_once);
                    thread::yield_now();
                }
            }
        }
    }

    /// Links a checked-out chunk back onto the top of the free stack.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is already on the free stack. Linking it a second time would make
    /// the stack hand the same memory to two callers.
    #[cfg_attr(test, mutants::skip)] // Mutating the retry loop can spin forever.
    pub(crate) fn push(&self, index: usize) {
        let chunk = self.chunk(index);

        let mut observed = self.head.load(Ordering::Acquire);

        // Claiming the link word atomically means two racing releases of one chunk cannot
        // both pass the check.
        if chunk
            .next_free
            .compare_exchange(CHECKED_OUT, observed, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            panic!(
                "chunk {index} of the {}-byte size class was released while already free",
                self.chunk_size
            );
        }

        let generation = next_generation(chunk.generation());
        chunk.generation.store(generation.get(), Ordering::Relaxed);

        let new_head = FreeLink::to_chunk(index, generation).encode();

        // Counted before it becomes reachable, so a racing pop can never decrement first.
        self.free_chunks.fetch_add(1, Ordering::Relaxed);

        loop {
            match self
                .head
                .compare_exchange(observed, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => {
                    observed = actual;

                    // Not yet reachable from the head, so we still own the link word.
                    chunk.next_free.store(observed, Ordering::Release);

                    FREE_STACK_RETRIES.with(Event::observe_once);
                    thread::yield_now();
                }
            }
        }
    }

    /// Whether the chunk at `index` is currently linked into the free stack.
    #[cfg(test)]
    pub(crate) fn is_free(&self, index: usize) -> bool {
        self.chunk(index).next_free.load(Ordering::Acquire) != CHECKED_OUT
    }

    fn chunk(&self, index: usize) -> &Chunk {
        self.chunks
            .get(index)
            .expect("free links and located addresses only ever name chunks of this region")
    }
}

impl Drop for SizeClass {
    fn drop(&mut self) {
        // SAFETY: We allocated the block in `new()` with exactly this layout and nothing
        // else deallocates it. Checked-out buffers borrow the pool, so none can outlive us.
        unsafe {
            dealloc(self.memory.as_ptr(), self.layout);
        }
    }
}

impl fmt::Debug for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeClass")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_count", &self.chunk_count())
            .field("free_chunks", &self.free_chunks.load(Ordering::Relaxed))
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

// SAFETY: The region owns its memory block and only hands out chunk pointers through the free
// stack, whose coordination is entirely atomic. Nothing is tied to the creating thread.
unsafe impl Send for SizeClass {}

// SAFETY: Shared access only touches atomics or computes addresses. Chunk memory is accessed
// by whichever single caller popped the chunk, never through `&SizeClass`.
unsafe impl Sync for SizeClass {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SizeClass: Send, Sync, fmt::Debug);

    fn size_class(chunk_size: usize, chunk_count: usize) -> SizeClass {
        SizeClass::new(
            NonZero::new(chunk_size).unwrap(),
            NonZero::new(chunk_count).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn new_reserves_one_block_for_all_chunks() {
        let class = size_class(32, 10);

        assert_eq!(class.chunk_size(), 32);
        assert_eq!(class.chunk_count(), 10);
        assert_eq!(class.total_bytes(), 320);
        assert_eq!(class.info().free_chunks(), 10);
    }

    #[test]
    fn chunks_are_adjacent_in_address_order() {
        let class = size_class(48, 4);

        let addresses = (0..4)
            .map(|index| class.chunk_ptr(index).as_ptr().addr())
            .collect::<Vec<_>>();

        for pair in addresses.windows(2) {
            assert_eq!(pair[1] - pair[0], 48);
        }
    }

    #[test]
    fn fresh_stack_pops_in_index_order() {
        let class = size_class(16, 3);

        assert_eq!(class.pop(), Some(0));
        assert_eq!(class.pop(), Some(1));
        assert_eq!(class.pop(), Some(2));
        assert_eq!(class.pop(), None);
        assert_eq!(class.info().free_chunks(), 0);
    }

    #[test]
    fn push_then_pop_is_lifo() {
        let class = size_class(16, 4);

        let a = class.pop().unwrap();
        let b = class.pop().unwrap();

        class.push(a);
        class.push(b);

        assert_eq!(class.pop(), Some(b));
        assert_eq!(class.pop(), Some(a));
    }

    #[test]
    fn last_chunk_is_free_before_and_after_being_popped_and_pushed() {
        let class = size_class(8, 1);

        assert!(class.is_free(0));

        assert_eq!(class.pop(), Some(0));
        assert!(!class.is_free(0));

        // Pushing onto an empty stack links to the end marker, which must still read as free.
        class.push(0);
        assert!(class.is_free(0));

        assert_eq!(class.pop(), Some(0));
        assert_eq!(class.pop(), None);
    }

    #[test]
    #[should_panic]
    fn push_of_never_popped_chunk_panics() {
        let class = size_class(8, 2);

        class.push(1);
    }

    #[test]
    #[should_panic]
    fn double_push_panics() {
        let class = size_class(8, 2);

        let index = class.pop().unwrap();
        class.push(index);
        class.push(index);
    }

    #[test]
    #[should_panic]
    fn double_push_of_bottom_chunk_panics() {
        let class = size_class(8, 1);

        class.pop().unwrap();
        class.push(0);
        class.push(0);
    }

    #[test]
    fn chunk_index_of_maps_addresses_to_chunks() {
        let class = size_class(64, 4);
        let begin = class.chunk_ptr(0).as_ptr().addr();

        assert_eq!(class.chunk_index_of(begin), Some(0));
        assert_eq!(class.chunk_index_of(begin + 63), Some(0));
        assert_eq!(class.chunk_index_of(begin + 64), Some(1));
        assert_eq!(class.chunk_index_of(begin + 255), Some(3));
        assert_eq!(class.chunk_index_of(begin + 256), None);
        assert_eq!(class.chunk_index_of(begin - 1), None);
        assert_eq!(class.chunk_index_of(0), None);
    }

    #[test]
    #[should_panic]
    fn chunk_ptr_out_of_bounds_panics() {
        let class = size_class(8, 2);

        _ = class.chunk_ptr(2);
    }

    #[test]
    fn too_many_chunks_is_rejected() {
        let result = SizeClass::new(nz!(1), NonZero::new(MAX_CHUNKS_PER_CLASS + 1).unwrap());

        assert!(matches!(result, Err(Error::TooManyChunks { .. })));
    }

    #[test]
    fn impossible_block_size_is_out_of_memory() {
        let result = SizeClass::new(NonZero::new(usize::MAX / 2).unwrap(), nz!(2));

        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn concurrent_pop_push_never_hands_out_a_chunk_twice() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 2_000;

        let class = Arc::new(size_class(16, 4));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|_| {
                let class = Arc::clone(&class);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();

                    for _ in 0..ITERATIONS {
                        if let Some(index) = class.pop() {
                            // Our marker must survive untouched until we release the chunk.
                            let ptr = class.chunk_ptr(index);
                            let marker = u8::try_from(index).unwrap();

                            // SAFETY: We hold the chunk exclusively until we push it back.
                            unsafe {
                                ptr.write(marker);
                            }
                            thread::yield_now();
                            // SAFETY: As above.
                            assert_eq!(unsafe { ptr.read() }, marker);

                            class.push(index);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(index) = class.pop() {
            assert!(seen.insert(index), "chunk {index} was on the stack twice");
        }

        assert_eq!(seen.len(), 4);
    }
}
