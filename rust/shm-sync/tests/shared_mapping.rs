//! Counters in a mapping shared with a forked child.

#![cfg(unix)]

use std::sync::Arc;

use shm_sync::{CounterSlab, SharedMmapSpan};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn parent_and_child_count_on_the_same_word() {
    init_tracing();
    const ROUNDS: u32 = 10_000;

    let slab = CounterSlab::new(Arc::new(SharedMmapSpan), 64).unwrap();
    let counter = slab.try_acquire().unwrap();
    counter.increment().unwrap();

    // SAFETY: the child only runs atomic operations on the mapping and exits.
    let child = unsafe { libc::fork() };
    assert!(child >= 0, "fork failed");
    if child == 0 {
        let ok = (0..ROUNDS).all(|_| counter.increment().is_ok());
        unsafe { libc::_exit(if ok { 0 } else { 1 }) };
    }

    for _ in 0..ROUNDS {
        counter.increment().unwrap();
    }
    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
    assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
    assert_eq!(counter.count(), 2 * ROUNDS + 1);

    for _ in 0..2 * ROUNDS {
        counter.decrement().unwrap();
    }
    assert_eq!(counter.decrement_if_one(), Ok(0));
    counter.dispose().unwrap();
    slab.release(counter).unwrap();
    assert!(slab.dispose().is_ok());
}
