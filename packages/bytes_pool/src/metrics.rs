//! Metrics for the bytes pool.
//!
//! Per-thread event instances keep the hot paths free of shared counters.

use nm::{Event, Magnitude};

/// Histogram buckets for requested buffer sizes in bytes.
///
/// Powers of two, matching how size classes grow, so each bucket roughly lines up with one
/// size class of a typical pool.
const REQUEST_SIZE_BYTES_BUCKETS: &[Magnitude] = &[
    0, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131_072, 1_048_576,
];

thread_local! {
    /// Allocation served by a chunk from one of the size classes.
    ///
    /// The magnitude is the requested size in bytes.
    pub(crate) static ALLOC_POOLED_BYTES: Event = Event::builder()
        .name("bytes_pool_alloc_pooled_bytes")
        .histogram(REQUEST_SIZE_BYTES_BUCKETS)
        .build();

    /// Allocation that fell back to the heap, either because the size is above every size
    /// class or because the matching size class had no free chunk.
    ///
    /// The magnitude is the requested size in bytes.
    pub(crate) static ALLOC_HEAP_BYTES: Event = Event::builder()
        .name("bytes_pool_alloc_heap_bytes")
        .histogram(REQUEST_SIZE_BYTES_BUCKETS)
        .build();

    /// A chunk returned to its size class.
    pub(crate) static RELEASE_POOLED: Event = Event::builder()
        .name("bytes_pool_release_pooled")
        .build();

    /// A compare-and-swap on a free stack head lost a race and had to be retried.
    pub(crate) static FREE_STACK_RETRIES: Event = Event::builder()
        .name("bytes_pool_free_stack_retries")
        .build();
}
