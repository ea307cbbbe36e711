//! pipfil demo - Main Entry Point
//!
//! Builds two small models and drives them:
//! - `stream`: expands `n` into `0..n`, doubles each element and joins them back
//! - `faults`: two sibling filters, one of which panics on a particular input
//!
//! Usage: `pipfil-demo [engine.toml]`

use pipfil::pipeline::{func, Filter, Length, Model, Pipe, Value};
use pipfil::{EngineConfig, Result, ResultExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pipfil=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(&path)?,
        None => EngineConfig::default(),
    };
    tracing::info!(?config, "Starting pipfil demo");

    run_stream_demo(&config).context("stream demo failed")?;
    run_fault_demo(&config).context("fault demo failed")?;
    Ok(())
}

fn run_stream_demo(config: &EngineConfig) -> Result<()> {
    let n = Pipe::of::<i64>("n", config.pipe_buffer);
    let items = Pipe::of::<i64>("items", config.pipe_buffer);
    let dupls = Pipe::of::<i64>("dupls", config.pipe_buffer);
    let out = Pipe::of::<Vec<i64>>("out", config.pipe_buffer);

    let expand = Filter::with_pipes(
        "expand",
        func(|n: i64| (0..n).collect::<Vec<i64>>()),
        &[&n],
        &[&items],
        &[],
    )?;
    let dup = Filter::with_pipes("dup", func(|x: i64| x * 2), &[&items], &[&dupls], &[])?;
    let join = Filter::with_pipes(
        "join",
        func(|xs: Vec<i64>| xs),
        &[&dupls],
        &[&out],
        &[Length::new(&dupls, &items)],
    )?;

    let model = Model::builder()
        .filter(expand)
        .filter(dup)
        .filter(join)
        .input(&n)
        .output(&out)
        .config(config.clone())
        .build()?;
    model.run()?;

    for size in [10i64, 3, 0] {
        let result = model.call(vec![Value::new(size)])?;
        let joined = result[0].as_ref().and_then(|v| v.get::<Vec<i64>>());
        tracing::info!(size, ?joined, "stream demo result");
    }

    model.stop()?;
    model.wait()?;
    Ok(())
}

fn run_fault_demo(config: &EngineConfig) -> Result<()> {
    let input = Pipe::of::<i64>("input", config.pipe_buffer);
    let squared = Pipe::of::<i64>("squared", config.pipe_buffer);
    let checked = Pipe::of::<i64>("checked", config.pipe_buffer);

    let square = Filter::with_pipes("square", func(|x: i64| x * x), &[&input], &[&squared], &[])?;
    let picky = Filter::with_pipes(
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
    )?;

    let model = Model::builder()
        .filter(square)
        .filter(picky)
        .input(&input)
        .output(&squared)
        .output(&checked)
        .config(config.clone())
        .build()?;
    model.run()?;

    for x in [14i64, 15, 16] {
        let result = model.call(vec![Value::new(x)])?;
        let values: Vec<Option<i64>> = result
            .iter()
            .map(|v| v.as_ref().and_then(|v| v.get::<i64>()))
            .collect();
        tracing::info!(input = x, ?values, "fault demo result");
        if model.has_errs() {
            model.log_errs();
            model.clear();
        }
    }

    model.stop()?;
    model.wait()?;
    Ok(())
}
