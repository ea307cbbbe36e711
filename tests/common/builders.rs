//! Graph builders for the models the tests drive

use pipfil::pipeline::{func, Computation, Filter, Length, Model, Pipe, PipelineResult};
use std::sync::Arc;

pub const BUFFER: usize = 8;

/// `n -> [0, 2, .., 2(n-1)]`: expand to a stream, double each element, join.
pub fn stream_model() -> PipelineResult<Model> {
    let n = Pipe::of::<i64>("n", BUFFER);
    let items = Pipe::of::<i64>("items", BUFFER);
    let dupls = Pipe::of::<i64>("dupls", BUFFER);
    let out = Pipe::of::<Vec<i64>>("out", BUFFER);

    Model::builder()
        .filter(Filter::with_pipes(
            "expand",
            func(|n: i64| (0..n).collect::<Vec<i64>>()),
            &[&n],
            &[&items],
            &[],
        )?)
        .filter(Filter::with_pipes(
            "dup",
            func(|x: i64| x * 2),
            &[&items],
            &[&dupls],
            &[],
        )?)
        .filter(Filter::with_pipes(
            "join",
            func(|xs: Vec<i64>| xs),
            &[&dupls],
            &[&out],
            &[Length::new(&dupls, &items)],
        )?)
        .input(&n)
        .output(&out)
        .build()
}

/// One model input through a single `u64 -> u64` computation.
pub fn single_filter_model(computation: Arc<dyn Computation>, parallel: usize) -> PipelineResult<Model> {
    let input = Pipe::of::<u64>("in", BUFFER);
    let output = Pipe::of::<u64>("out", BUFFER);
    let mut filter = Filter::with_pipes("work", computation, &[&input], &[&output], &[])?;
    filter.set_parallel(parallel)?;
    Model::builder()
        .filter(filter)
        .input(&input)
        .output(&output)
        .build()
}

/// `x -> (x * x, x + 1)` through two sibling filters; the second panics on 15.
pub fn fault_model() -> PipelineResult<Model> {
    let input = Pipe::of::<i64>("input", BUFFER);
    let squared = Pipe::of::<i64>("squared", BUFFER);
    let checked = Pipe::of::<i64>("checked", BUFFER);

    Model::builder()
        .filter(Filter::with_pipes(
            "square",
            func(|x: i64| x * x),
            &[&input],
            &[&squared],
            &[],
        )?)
        .filter(Filter::with_pipes(
            "picky",
            func(|x: i64| {
                if x == 15 {
                    panic!("refusing to handle {x}");
                }
                x + 1
            }),
            &[&input],
            &[&checked],
            &[],
        )?)
        .input(&input)
        .output(&squared)
        .output(&checked)
        .build()
}
