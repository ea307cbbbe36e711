//! Identity types for the pipeline system.
//!
//! A pipe keeps one buffered queue per consumer. The consumer is either a filter,
//! identified by its name, or the model itself for the terminal output slots.

use std::fmt;
use std::sync::Arc;

/// Who is reading from a pipe.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Consumer {
    /// A filter worker, keyed by filter name.
    Filter(Arc<str>),
    /// The model's own output collection.
    Model,
}

impl Consumer {
    pub fn filter(name: &str) -> Self {
        Consumer::Filter(Arc::from(name))
    }

    #[inline]
    pub fn is_model(&self) -> bool {
        matches!(self, Consumer::Model)
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consumer::Filter(name) => write!(f, "Consumer(filter={name})"),
            Consumer::Model => write!(f, "Consumer(model)"),
        }
    }
}

impl fmt::Display for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consumer::Filter(name) => write!(f, "filter '{name}'"),
            Consumer::Model => write!(f, "model"),
        }
    }
}

/// Key of a length side-channel queue: the consumer plus the streamed pipe whose
/// element count it carries.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LengthKey {
    pub consumer: Consumer,
    pub streamed: Arc<str>,
}

impl LengthKey {
    pub fn new(consumer: Consumer, streamed: &str) -> Self {
        Self {
            consumer,
            streamed: Arc::from(streamed),
        }
    }
}

impl fmt::Debug for LengthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LengthKey({:?}, streamed={})", self.consumer, self.streamed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_consumer_identity() {
        let a = Consumer::filter("dup");
        let b = Consumer::filter("dup");
        assert_eq!(a, b);
        assert_ne!(a, Consumer::Model);
        assert!(Consumer::Model.is_model());

        let set: HashSet<_> = [a, b, Consumer::Model].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_length_key_distinguishes_streams() {
        let c = Consumer::filter("join");
        assert_ne!(LengthKey::new(c.clone(), "dup"), LengthKey::new(c, "inc"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Consumer::filter("x").to_string(), "filter 'x'");
        assert_eq!(Consumer::Model.to_string(), "model");
    }
}
