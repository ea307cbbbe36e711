//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod computations;

use pipfil::Value;
use std::time::Duration;

/// Upper bound for anything a test waits on
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Unwrap a single typed output of a model call
pub fn output<T: pipfil::pipeline::PipeData>(values: &[Option<Value>], index: usize) -> Option<T> {
    values.get(index)?.as_ref()?.get::<T>()
}
