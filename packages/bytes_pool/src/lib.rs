#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A lock-free pool of byte buffers in fixed size classes, carved from large pre-reserved
//! memory regions.
//!
//! This crate provides [`BytesPool`], which reserves one contiguous memory block per size class
//! at construction time and slices each block into equally sized chunks. Any number of threads
//! can then obtain and return buffers without taking a lock and without going to the system
//! allocator.
//!
//! # Key Features
//!
//! - **Size classes**: Chunk sizes start at an initial size and double up to a maximum size
//! - **Lock-free**: Each size class keeps its free chunks on a Treiber stack driven by a single
//!   compare-and-swap on a tagged 64-bit word
//! - **Never fails**: Oversized requests and exhausted size classes fall back to ordinary heap
//!   buffers, transparently to the caller
//! - **LIFO reuse**: The most recently returned chunk is the next one handed out, keeping hot
//!   memory in cache
//! - **Double release detection**: Returning a chunk that is already free panics instead of
//!   corrupting the free stack
//! - **Fixed layout**: The set of size classes and their memory never change after construction
//!
//! # Examples
//!
//! ```rust
//! use bytes_pool::BytesPool;
//!
//! // Chunks of 32, 64, ... 1024 bytes, with 1024 bytes reserved per size class.
//! let pool = BytesPool::new(32, 1024, 1024).unwrap();
//!
//! let mut buffer = pool.allocate(5);
//! assert_eq!(buffer.len(), 5);
//! assert_eq!(buffer.capacity(), 32);
//!
//! buffer.copy_from_slice(b"hello");
//!
//! // Returns the chunk to its size class. Dropping the buffer does the same.
//! pool.release(buffer);
//! ```
//!
//! Sharing one pool between threads:
//!
//! ```rust
//! use std::thread;
//!
//! use bytes_pool::BytesPool;
//!
//! let pool = BytesPool::builder()
//!     .initial_size(128)
//!     .max_size(1024)
//!     .memory_budget(64 * 1024)
//!     .build()
//!     .unwrap();
//!
//! thread::scope(|scope| {
//!     for _ in 0..4 {
//!         scope.spawn(|| {
//!             let mut buffer = pool.allocate(700);
//!             buffer.fill(1);
//!             pool.release(buffer);
//!         });
//!     }
//! });
//! ```
//!
//! # Observability
//!
//! Allocations, releases and free stack contention are recorded as [`nm`] events named
//! `bytes_pool_*`. Pool construction is logged at debug level via [`tracing`].

mod builder;
mod error;
mod free_link;
mod metrics;
mod pool;
mod pooled_bytes;
mod size_class;
mod size_class_info;

pub use builder::*;
pub use error::Error;
pub(crate) use error::Result;
pub use pool::BytesPool;
pub use pooled_bytes::PooledBytes;
pub(crate) use size_class::SizeClass;
pub use size_class_info::SizeClassInfo;
