//! Timing checks for name derivation and uncontended acquisition.
//!
//! These tests measure key operations and validate that they stay within
//! acceptable bounds. Run with:
//!
//! ```sh
//! cargo test -p nsmutex-core --test benchmarks -- --ignored --nocapture
//! ```

use std::time::Instant;

use nsmutex_core::naming::MutexNamer;
use nsmutex_core::{MemoryPlatform, NamespaceConfig, NamespaceRuntime, SystemRuntime};

// ---------------------------------------------------------------------------
// Name derivation benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_derive_mutex_name() {
    const ITERATIONS: usize = 100_000;
    let namer = MutexNamer::default();
    let pools: Vec<String> = (0..64).map(|i| format!("pool-{i}-caf\u{00e9}")).collect();

    let start = Instant::now();
    for i in 0..ITERATIONS {
        let name = namer.derive(&pools[i % pools.len()]);
        std::hint::black_box(name);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_derive_mutex_name] {ITERATIONS} iterations in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        per_iter.as_micros() < 50,
        "derivation should complete in < 50 us, got {per_iter:?}"
    );
}

// ---------------------------------------------------------------------------
// Acquisition benchmarks
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_memory_acquire_release() {
    const ITERATIONS: usize = 100_000;
    let runtime = NamespaceRuntime::new(MemoryPlatform::new(), NamespaceConfig::default());
    runtime.ensure_ready().unwrap();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        runtime.take_pool_mutex("bench").unwrap().release();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_memory_acquire_release] {ITERATIONS} iterations in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        per_iter.as_micros() < 100,
        "in-memory acquire/release should complete in < 100 us, got {per_iter:?}"
    );
}

#[test]
#[ignore]
fn bench_unix_acquire_release() {
    const ITERATIONS: usize = 2_000;
    let root = tempfile::tempdir().unwrap();
    let runtime = SystemRuntime::system(NamespaceConfig::with_root(root.path()));
    runtime.ensure_ready().unwrap();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        runtime.take_pool_mutex("bench").unwrap().release();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_unix_acquire_release] {ITERATIONS} iterations in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        per_iter.as_millis() < 5,
        "lock file acquire/release should complete in < 5 ms, got {per_iter:?}"
    );
}

#[test]
#[ignore]
fn bench_bootstrap_fast_path() {
    const ITERATIONS: usize = 1_000_000;
    let runtime = NamespaceRuntime::new(MemoryPlatform::new(), NamespaceConfig::default());
    runtime.ensure_ready().unwrap();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        runtime.ensure_ready().unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!("[bench_bootstrap_fast_path] {ITERATIONS} iterations in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        per_iter.as_micros() < 5,
        "ready fast path should complete in < 5 us, got {per_iter:?}"
    );
}
