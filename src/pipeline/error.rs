//! Pipeline-specific error types.
//!
//! `PipelineError` covers wiring and usage mistakes: these are reported while a
//! graph is being built, compiled or driven, and a graph that produced one is never
//! started. `FilterFault` is the runtime counterpart: a computation that failed
//! during one invocation. Faults are recorded on the filter and never stop it.

use crate::pipeline::id::Consumer;
use crate::pipeline::value::DataType;
use std::fmt;
use thiserror::Error;

/// Errors that can occur while wiring, validating or driving a pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipe '{pipe}' receives type '{found}' but is declared as '{expected}'")]
    TypeMismatch {
        pipe: String,
        expected: DataType,
        found: DataType,
    },

    #[error("consumer {consumer} is not registered on pipe '{pipe}'")]
    UnregisteredConsumer { pipe: String, consumer: Consumer },

    #[error("{what} is already registered on '{owner}'")]
    AlreadyRegistered { owner: String, what: String },

    #[error("filter '{filter}': no pipe found for {slot}")]
    PipeNotFound { filter: String, slot: String },

    #[error("filter '{filter}': {detail}")]
    AmbiguousType { filter: String, detail: String },

    #[error("filter '{filter}': pipe '{pipe}' feeds a sequence slot one element at a time but has no length source")]
    MissingLength { filter: String, pipe: String },

    #[error("filter '{filter}': pipe '{pipe}' is not bound to any {side} slot")]
    UnboundPipe {
        filter: String,
        pipe: String,
        side: &'static str,
    },

    #[error("{side} slot {index} is out of range for a computation with {arity} {side}s")]
    SlotOutOfRange {
        side: &'static str,
        index: usize,
        arity: usize,
    },

    #[error("name '{name}' is already used by another {side} slot")]
    NameInUse { name: String, side: &'static str },

    #[error("model {side} pipe '{pipe}' is declared twice")]
    DuplicateIO { pipe: String, side: &'static str },

    #[error("filter name '{0}' is used by more than one filter")]
    DuplicateFilter(String),

    #[error("two different pipes are named '{0}'")]
    PipeNameClash(String),

    #[error("possible deadlock: {0}")]
    PossibleDeadlock(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("model expects {expected} inputs but received {found}")]
    InputCountMismatch { expected: usize, found: usize },

    #[error("filter '{0}' has not been compiled")]
    NotCompiled(String),

    #[error("parallelism must be at least 1, got {0}")]
    InvalidParallelism(usize),

    #[error("model is already running")]
    AlreadyRunning,

    #[error("model is not running")]
    NotRunning,

    #[error("pipe '{0}' is closed")]
    PipeClosed(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("worker thread '{0}' panicked")]
    WorkerPanicked(String),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// How a single invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The computation returned an error.
    Computation,
    /// The computation panicked.
    Panic,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Computation => write!(f, "error"),
            FaultKind::Panic => write!(f, "panic"),
        }
    }
}

/// A runtime fault captured from one filter invocation.
///
/// The message is rendered eagerly (including the `anyhow` context chain) so faults
/// can be cloned out of a running model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("filter '{filter}' {kind}: {message}")]
pub struct FilterFault {
    pub filter: String,
    pub kind: FaultKind,
    pub message: String,
}

impl FilterFault {
    pub fn computation(filter: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            filter: filter.into(),
            kind: FaultKind::Computation,
            message: format!("{err:#}"),
        }
    }

    pub fn panic(filter: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            filter: filter.into(),
            kind: FaultKind::Panic,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_fault_keeps_context_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("division by zero"))
            .context("computing ratio")
            .unwrap_err();
        let fault = FilterFault::computation("ratio", &err);
        assert_eq!(fault.kind, FaultKind::Computation);
        assert!(fault.message.contains("computing ratio"));
        assert!(fault.message.contains("division by zero"));
        assert!(fault.to_string().starts_with("filter 'ratio' error"));
    }

    #[test]
    fn test_fault_from_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let fault = FilterFault::panic("f", payload.as_ref());
        assert_eq!(fault.kind, FaultKind::Panic);
        assert_eq!(fault.message, "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(FilterFault::panic("f", payload.as_ref()).message, "owned boom");
    }

    #[test]
    fn test_input_count_display() {
        let err = PipelineError::InputCountMismatch {
            expected: 2,
            found: 1,
        };
        assert_eq!(err.to_string(), "model expects 2 inputs but received 1");
    }
}
