use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;

use crate::BytesPool;

/// A byte buffer obtained from [`BytesPool::allocate()`].
///
/// The buffer is either a chunk of pool memory or, when the pool could not serve the request,
/// an ordinary heap allocation. Both dereference to `[u8]` of exactly the requested length.
///
/// A chunk keeps its full chunk size as [`capacity()`](Self::capacity), which is how the pool
/// recognizes it when it comes back. Dropping the buffer (or passing it to
/// [`BytesPool::release()`]) returns the chunk to the pool that allocated it.
///
/// # Thread safety
///
/// The buffer is [`Send`] and [`Sync`] just like `Box<[u8]>`. While checked out, the chunk
/// memory is reachable only through this handle.
pub struct PooledBytes<'pool> {
    inner: Inner<'pool>,
}

enum Inner<'pool> {
    Chunk {
        pool: &'pool BytesPool,
        ptr: NonNull<u8>,
        len: usize,
        capacity: usize,
    },
    Heap(Box<[u8]>),
}

impl<'pool> PooledBytes<'pool> {
    /// # Panics
    ///
    /// Panics if `len` exceeds `capacity`.
    #[must_use]
    pub(crate) fn from_chunk(
        pool: &'pool BytesPool,
        ptr: NonNull<u8>,
        len: usize,
        capacity: usize,
    ) -> Self {
        assert!(
            len <= capacity,
            "buffer of {len} bytes cannot be served by a chunk of {capacity} bytes"
        );

        Self {
            inner: Inner::Chunk {
                pool,
                ptr,
                len,
                capacity,
            },
        }
    }

    #[must_use]
    pub(crate) fn from_heap(bytes: Box<[u8]>) -> Self {
        Self {
            inner: Inner::Heap(bytes),
        }
    }

    /// Number of bytes in the buffer, which is the size that was requested.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        match &self.inner {
            Inner::Chunk { len, .. } => *len,
            Inner::Heap(bytes) => bytes.len(),
        }
    }

    /// Whether the buffer has a length of zero.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bytes backing the buffer: the chunk size for pool memory, the length for a
    /// heap buffer.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        match &self.inner {
            Inner::Chunk { capacity, .. } => *capacity,
            Inner::Heap(bytes) => bytes.len(),
        }
    }

    /// Whether the buffer is a chunk of pool memory rather than a heap fallback.
    #[must_use]
    #[inline]
    pub fn is_pooled(&self) -> bool {
        matches!(self.inner, Inner::Chunk { .. })
    }

    /// Takes the buffer apart into its pointer, length and capacity without returning it.
    ///
    /// A chunk stays checked out until the pointer and capacity are handed to
    /// [`BytesPool::release_raw()`]. A heap buffer is leaked; the caller may reclaim it with
    /// `Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len))`.
    #[must_use]
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize, usize) {
        let this = ManuallyDrop::new(self);

        // SAFETY: `this` is never used or dropped again, so the contents have no other owner.
        let inner = unsafe { ptr::read(&this.inner) };

        match inner {
            Inner::Chunk {
                ptr, len, capacity, ..
            } => (ptr, len, capacity),
            Inner::Heap(bytes) => {
                let len = bytes.len();
                let ptr = NonNull::from(Box::leak(bytes)).cast::<u8>();

                (ptr, len, len)
            }
        }
    }
}

impl Deref for PooledBytes<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        match &self.inner {
            // SAFETY: The chunk memory is initialized (zeroed at reservation, then only ever
            // written with bytes) and nobody else accesses it while we hold the chunk.
            Inner::Chunk { ptr, len, .. } => unsafe {
                slice::from_raw_parts(ptr.as_ptr(), *len)
            },
            Inner::Heap(bytes) => bytes,
        }
    }
}

impl DerefMut for PooledBytes<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.inner {
            // SAFETY: As in `deref()`, and `&mut self` guarantees the access is exclusive.
            Inner::Chunk { ptr, len, .. } => unsafe {
                slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
            Inner::Heap(bytes) => bytes,
        }
    }
}

impl AsRef<[u8]> for PooledBytes<'_> {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBytes<'_> {
    #[inline]
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl Drop for PooledBytes<'_> {
    fn drop(&mut self) {
        if let Inner::Chunk {
            pool,
            ptr,
            capacity,
            ..
        } = self.inner
        {
            let returned = pool.return_chunk(ptr, capacity);
            debug_assert!(returned, "chunk must belong to the pool that allocated it");
        }
    }
}

impl fmt::Debug for PooledBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBytes")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

// SAFETY: The buffer exclusively owns its bytes (a checked-out chunk or a box), and the pool it
// refers to is `Sync`. Nothing ties the buffer to the thread that allocated it.
unsafe impl Send for PooledBytes<'_> {}

// SAFETY: Shared access only reads the bytes, as with `&[u8]`.
unsafe impl Sync for PooledBytes<'_> {}
