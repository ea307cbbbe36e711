//! Integration tests for engine configuration
//!
//! Loads configs from disk and checks they reach pipes, filters and worker
//! threads.

mod common;

use common::computations::slow_affine;
use common::output;
use pipfil::pipeline::{func, DataType, Filter, Model, Pipe, PipelineError, Value};
use pipfil::{EngineConfig, PipfilError};
use std::thread;
use tempfile::TempDir;

#[test]
fn test_config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("engine.toml");

    let config = EngineConfig {
        pipe_buffer: 2,
        parallel: 3,
        worker_name_prefix: "etl".to_string(),
    };
    config.save(&path).unwrap();
    assert_eq!(EngineConfig::load(&path).unwrap(), config);
}

#[test]
fn test_invalid_config_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.toml");
    std::fs::write(&path, "parallel = 0\n").unwrap();

    let err = EngineConfig::load(&path).unwrap_err();
    assert!(matches!(err.root(), PipfilError::Config(_)));
    assert_eq!(EngineConfig::load_or_default(&path), EngineConfig::default());

    let missing = dir.path().join("missing.toml");
    assert!(matches!(
        EngineConfig::load(&missing).unwrap_err().root(),
        PipfilError::Io(_)
    ));
}

#[test]
fn test_config_reaches_pipes_and_filters() {
    let config = EngineConfig::from_toml_str("pipe_buffer = 3\nparallel = 4\n").unwrap();
    let input = Pipe::with_config("in", DataType::of::<u64>(), &config);
    let out = Pipe::with_config("out", DataType::of::<u64>(), &config);
    assert_eq!(input.buffer(), 3);

    let filter = Filter::with_pipes("work", slow_affine(2), &[&input], &[&out], &[]).unwrap();
    let model = std::sync::Arc::new(
        Model::builder()
            .filter(filter)
            .input(&input)
            .output(&out)
            .config(config)
            .build()
            .unwrap(),
    );
    assert_eq!(model.filter("work").map(Filter::parallel), Some(4));
    model.run().unwrap();

    let callers: Vec<_> = (0..4u64)
        .map(|caller| {
            let model = model.clone();
            thread::spawn(move || {
                for i in 0..10u64 {
                    let x = caller * 50 + i;
                    let result = model.call(vec![Value::new(x)]).unwrap();
                    assert_eq!(output::<u64>(&result, 0), Some(3 * x + 1));
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }
    model.stop().unwrap();
    model.wait().unwrap();
}

#[test]
fn test_apply_config_only_before_run() {
    let (x, y) = (Pipe::of::<i64>("x", 4), Pipe::of::<i64>("y", 4));
    let filter = Filter::with_pipes("inc", func(|x: i64| x + 1), &[&x], &[&y], &[]).unwrap();
    let mut model = Model::builder().filter(filter).input(&x).output(&y).build().unwrap();

    let config = EngineConfig {
        parallel: 2,
        ..EngineConfig::default()
    };
    model.apply_config(&config).unwrap();
    assert_eq!(model.filter("inc").map(Filter::parallel), Some(2));

    model.run().unwrap();
    assert!(matches!(
        model.apply_config(&config),
        Err(PipelineError::AlreadyRunning)
    ));
    assert!(matches!(model.set_parallel(1), Err(PipelineError::AlreadyRunning)));
    model.stop().unwrap();
    model.wait().unwrap();
}
