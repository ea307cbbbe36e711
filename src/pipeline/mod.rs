//! Pipes-and-filters dataflow engine.
//!
//! Computations are wrapped in filters that run on their own worker threads and
//! talk only through typed pipes. A model owns a set of filters plus the pipes
//! that feed and drain them, audits the graph once, then serves concurrent calls.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────┐   items (streamed)   ┌──────────┐   dupls    ┌──────────┐
//! call(n) ──► n ─┤  expand  ├─────────────────────►│   dup    ├───────────►│   join   ├─► out
//!                └──────────┘          │           └──────────┘            └────▲─────┘
//!                                      └──────────── lengths ───────────────────┘
//! ```
//!
//! # Design
//!
//! - **Fan-out pipes**: one bounded queue per consumer; a write completes only
//!   once every consumer holds the value.
//! - **Streaming**: a `Vec<T>` result written to a `T` pipe goes out element by
//!   element; consumers that want the sequence back pair the pipe with a length
//!   source.
//! - **Faults are data**: an error or panic in a computation is recorded on its
//!   filter and its outputs are left unset for that invocation.
//! - **Order under parallelism**: a per-filter reorder queue forwards results in
//!   submission order.
//! - **Cooperative stop**: a shared [`Signal`] plus pipe closing.

pub mod binding;
pub mod compiler;
pub mod error;
pub mod filter;
pub mod id;
pub mod model;
pub mod pipe;
pub mod pipe_set;
pub mod queue;
pub mod signal;
pub mod value;

pub use binding::{func, Binding, Computation, IntoComputation, IntoReturns, Slot};
pub use compiler::{AuditReport, GraphAuditor};
pub use error::{FaultKind, FilterFault, PipelineError, PipelineResult};
pub use filter::{Filter, FilterWorker, Length};
pub use id::Consumer;
pub use model::{Model, ModelBuilder};
pub use pipe::Pipe;
pub use pipe_set::PipeSet;
pub use queue::{ReorderQueue, Ticket};
pub use signal::Signal;
pub use value::{DataType, PipeData, Value, ValueTypeError};
