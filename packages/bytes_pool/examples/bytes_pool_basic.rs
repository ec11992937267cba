//! Basic usage example for `BytesPool`.
//!
//! Builds a pool, serves a few requests from different size classes and the heap, and shows
//! how the size classes fill and drain. Run with `RUST_LOG=debug` to see construction logs.

use bytes_pool::BytesPool;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let pool = BytesPool::builder()
        .initial_size(32)
        .max_size(1024)
        .memory_budget(4096)
        .build()
        .expect("pool parameters are valid and small");

    println!("Size classes:");
    print_size_classes(&pool);

    let mut greeting = pool.allocate(5);
    greeting.copy_from_slice(b"hello");
    println!(
        "Allocated {} bytes with capacity {} (pooled: {})",
        greeting.len(),
        greeting.capacity(),
        greeting.is_pooled()
    );

    let medium = pool.allocate(300);
    println!(
        "Allocated {} bytes with capacity {} (pooled: {})",
        medium.len(),
        medium.capacity(),
        medium.is_pooled()
    );

    let large = pool.allocate(2046);
    println!(
        "Allocated {} bytes with capacity {} (pooled: {})",
        large.len(),
        large.capacity(),
        large.is_pooled()
    );

    println!("After allocating:");
    print_size_classes(&pool);

    let address = greeting.as_ptr();
    pool.release(greeting);
    pool.release(medium);
    pool.release(large);

    let reused = pool.allocate(20);
    println!(
        "Next 20-byte allocation reuses the released chunk: {}",
        reused.as_ptr() == address
    );

    println!("After releasing:");
    print_size_classes(&pool);
}

fn print_size_classes(pool: &BytesPool) {
    for size_class in pool.size_classes() {
        println!(
            "  {:>5} bytes: {:>3} of {:>3} chunks free",
            size_class.chunk_size(),
            size_class.free_chunks(),
            size_class.chunk_count()
        );
    }
}
