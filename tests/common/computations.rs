//! Computations with controllable latency

use pipfil::pipeline::{func, Computation};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A random delay of up to `max_ms` milliseconds
pub fn jitter(max_ms: u64) -> Duration {
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// `x -> 3x + 1` after a random delay. Injective, so every result identifies
/// its input.
pub fn slow_affine(max_ms: u64) -> Arc<dyn Computation> {
    func(move |x: u64| {
        thread::sleep(jitter(max_ms));
        3 * x + 1
    })
}

/// Identity after a random delay
pub fn slow_identity(max_ms: u64) -> Arc<dyn Computation> {
    func(move |x: u64| {
        thread::sleep(jitter(max_ms));
        x
    })
}

/// Identity after a fixed delay
pub fn sleeper(delay: Duration) -> Arc<dyn Computation> {
    func(move |x: u64| {
        thread::sleep(delay);
        x
    })
}
