//! # pipfil: pipes-and-filters dataflow engine
//!
//! Compose independently running computations ("filters") into a graph joined by
//! typed, fan-out channels ("pipes"), then drive the graph like a function.
//!
//! ## Architecture
//!
//! - **Pipes**: typed multi-consumer channels built on crossbeam, with a length
//!   side channel for streaming sequences one element at a time
//! - **Filters**: one worker thread per computation, optionally with several
//!   invocations in flight and results restored to submission order
//! - **Models**: a statically audited graph with a thread-safe `call` interface
//! - **Config**: TOML-backed defaults for buffering, parallelism and thread naming
//!
//! ## Example
//!
//! ```
//! use pipfil::pipeline::{func, Filter, Length, Model, Pipe, Value};
//!
//! let n = Pipe::of::<i64>("n", 4);
//! let items = Pipe::of::<i64>("items", 4);
//! let dupls = Pipe::of::<i64>("dupls", 4);
//! let out = Pipe::of::<Vec<i64>>("out", 4);
//!
//! let expand = Filter::with_pipes(
//!     "expand",
//!     func(|n: i64| (0..n).collect::<Vec<i64>>()),
//!     &[&n],
//!     &[&items],
//!     &[],
//! )?;
//! let dup = Filter::with_pipes("dup", func(|x: i64| x * 2), &[&items], &[&dupls], &[])?;
//! let join = Filter::with_pipes(
//!     "join",
//!     func(|xs: Vec<i64>| xs),
//!     &[&dupls],
//!     &[&out],
//!     &[Length::new(&dupls, &items)],
//! )?;
//!
//! let model = Model::builder()
//!     .filter(expand)
//!     .filter(dup)
//!     .filter(join)
//!     .input(&n)
//!     .output(&out)
//!     .build()?;
//! model.run()?;
//!
//! let result = model.call(vec![Value::new(10i64)])?;
//! let doubled = result[0].as_ref().and_then(|v| v.get::<Vec<i64>>());
//! assert_eq!(doubled, Some((0..10).map(|x| x * 2).collect()));
//!
//! model.stop()?;
//! model.wait()?;
//! # Ok::<(), pipfil::pipeline::PipelineError>(())
//! ```

pub mod config;
pub mod error;
pub mod pipeline;

#[doc(hidden)]
pub use anyhow;

pub use config::EngineConfig;
pub use error::{PipfilError, Result, ResultExt};
pub use pipeline::{func, Filter, Length, Model, ModelBuilder, Pipe, PipelineError, Value};
