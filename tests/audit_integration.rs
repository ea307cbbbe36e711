//! Integration tests for graph auditing
//!
//! Malformed graphs must be refused while the model is built, before any
//! worker thread exists.

mod common;

use common::builders::BUFFER;
use pipfil::pipeline::{func, Filter, Length, Model, Pipe, PipelineError, Value};

fn i64_pipe(name: &str) -> Pipe {
    Pipe::of::<i64>(name, BUFFER)
}

fn seq_pipe(name: &str) -> Pipe {
    Pipe::of::<Vec<i64>>(name, BUFFER)
}

fn expand(n: &Pipe, items: &Pipe) -> Filter {
    Filter::with_pipes(
        "expand",
        func(|n: i64| (0..n).collect::<Vec<i64>>()),
        &[n],
        &[items],
        &[],
    )
    .unwrap()
}

fn join(name: &str, items: &Pipe, out: &Pipe, lengths: &Pipe) -> Filter {
    Filter::with_pipes(
        name,
        func(|xs: Vec<i64>| xs),
        &[items],
        &[out],
        &[Length::new(items, lengths)],
    )
    .unwrap()
}

#[test]
fn test_element_wise_length_source_is_rejected() {
    let (n, items, incs, dupls) = (i64_pipe("n"), i64_pipe("items"), i64_pipe("incs"), i64_pipe("dupls"));
    let out = seq_pipe("out");

    // `incs` receives one value per element of `items`, so it never carries
    // the length of the whole sequence.
    let split = Filter::with_pipes(
        "split",
        func(|x: i64| (x + 1, x * 2)),
        &[&items],
        &[&incs, &dupls],
        &[],
    )
    .unwrap();

    let result = Model::builder()
        .filter(expand(&n, &items))
        .filter(split)
        .filter(join("join", &dupls, &out, &incs))
        .input(&n)
        .output(&out)
        .build();

    match result {
        Err(PipelineError::PossibleDeadlock(detail)) => {
            assert!(detail.contains("incs"), "diagnosis names the pipe: {detail}")
        }
        other => panic!("expected PossibleDeadlock, got {other:?}"),
    }
}

#[test]
fn test_producer_streamed_pipe_with_foreign_lengths_is_rejected() {
    let n = i64_pipe("n");
    let (list, items, out) = (seq_pipe("list"), i64_pipe("items"), seq_pipe("out"));

    let gen = Filter::with_pipes(
        "gen",
        func(|n: i64| {
            let xs: Vec<i64> = (0..n).collect();
            (xs.clone(), xs)
        }),
        &[&n],
        &[&list, &items],
        &[],
    )
    .unwrap();
    let len = i64_pipe("len");
    let count = Filter::with_pipes("count", func(|xs: Vec<i64>| xs.len() as i64), &[&list], &[&len], &[])
        .unwrap();

    let result = Model::builder()
        .filter(gen)
        .filter(join("join", &items, &out, &list))
        .filter(count)
        .input(&n)
        .output(&out)
        .output(&len)
        .build();
    assert!(matches!(result, Err(PipelineError::PossibleDeadlock(_))));
}

#[test]
fn test_length_source_written_by_two_filters_is_rejected() {
    let (a, b) = (i64_pipe("a"), i64_pipe("b"));
    let (items, lens, out) = (i64_pipe("items"), seq_pipe("lens"), seq_pipe("out"));

    let first = Filter::with_pipes(
        "first",
        func(|n: i64| ((0..n).collect::<Vec<i64>>(), (0..n).collect::<Vec<i64>>())),
        &[&a],
        &[&items, &lens],
        &[],
    )
    .unwrap();
    let second = Filter::with_pipes(
        "second",
        func(|n: i64| (0..n).collect::<Vec<i64>>()),
        &[&b],
        &[&lens],
        &[],
    )
    .unwrap();

    let result = Model::builder()
        .filter(first)
        .filter(second)
        .filter(join("join", &items, &out, &lens))
        .input(&a)
        .input(&b)
        .output(&out)
        .build();
    assert!(matches!(result, Err(PipelineError::PossibleDeadlock(_))));
}

/// A fresh `x -> y` increment filter with its own pipes.
fn inc(name: &str) -> (Filter, Pipe, Pipe) {
    let (x, y) = (i64_pipe("x"), i64_pipe("y"));
    let filter = Filter::with_pipes(name, func(|x: i64| x + 1), &[&x], &[&y], &[]).unwrap();
    (filter, x, y)
}

#[test]
fn test_duplicate_declarations_are_rejected() {
    let (filter, x, y) = inc("inc");
    let result = Model::builder().filter(filter).input(&x).input(&x).output(&y).build();
    assert!(matches!(
        result,
        Err(PipelineError::DuplicateIO { side: "input", .. })
    ));

    let (filter, x, y) = inc("inc");
    let result = Model::builder().filter(filter).input(&x).output(&y).output(&y).build();
    assert!(matches!(
        result,
        Err(PipelineError::DuplicateIO { side: "output", .. })
    ));

    let (first, x, y) = inc("inc");
    let (p, q) = (i64_pipe("p"), i64_pipe("q"));
    let twin = Filter::with_pipes("inc", func(|x: i64| x - 1), &[&p], &[&q], &[]).unwrap();
    let result = Model::builder()
        .filter(first)
        .filter(twin)
        .input(&x)
        .input(&p)
        .output(&y)
        .output(&q)
        .build();
    assert!(matches!(result, Err(PipelineError::DuplicateFilter(name)) if name == "inc"));
}

#[test]
fn test_dangling_pipes_are_rejected() {
    // Written but never read.
    let (filter, x, _) = inc("inc");
    let result = Model::builder().filter(filter).input(&x).build();
    assert!(matches!(result, Err(PipelineError::InvalidGraph(_))));

    // Declared model input nobody reads.
    let (filter, x, y) = inc("inc");
    let result = Model::builder()
        .filter(filter)
        .input(&x)
        .input(&i64_pipe("z"))
        .output(&y)
        .build();
    assert!(matches!(result, Err(PipelineError::InvalidGraph(_))));

    // Declared model output nobody writes.
    let (filter, x, y) = inc("inc");
    let result = Model::builder()
        .filter(filter)
        .input(&x)
        .output(&y)
        .output(&i64_pipe("z"))
        .build();
    assert!(matches!(result, Err(PipelineError::InvalidGraph(_))));

    // No model inputs at all.
    let (filter, _, y) = inc("inc");
    let result = Model::builder().filter(filter).output(&y).build();
    assert!(matches!(result, Err(PipelineError::InvalidGraph(_))));
}

#[test]
fn test_compile_errors_surface_before_the_model() {
    // A sequence parameter fed element-wise needs a length source.
    let items = i64_pipe("items");
    let mut join = Filter::new("join", func(|xs: Vec<i64>| xs.len() as i64));
    join.input(&items).unwrap().output(&i64_pipe("count")).unwrap();
    assert!(matches!(
        join.compile(),
        Err(PipelineError::MissingLength { .. })
    ));

    // Two unnamed parameters of the same type cannot be told apart.
    let mut add = Filter::new("add", func(|a: i64, b: i64| a + b));
    add.typed_input(&i64_pipe("a")).unwrap();
    add.typed_output(&i64_pipe("c")).unwrap();
    assert!(matches!(add.compile(), Err(PipelineError::AmbiguousType { .. })));

    // An uncompiled filter is refused by the model.
    let (x, y) = (i64_pipe("x"), i64_pipe("y"));
    let mut raw = Filter::new("raw", func(|x: i64| x));
    raw.input(&x).unwrap().output(&y).unwrap();
    let result = Model::builder().filter(raw).input(&x).output(&y).build();
    assert!(matches!(result, Err(PipelineError::NotCompiled(_))));
}

#[test]
fn test_typed_slots_ignore_wiring_order() {
    let x = i64_pipe("x");
    let label = Pipe::of::<String>("label", BUFFER);
    let text = Pipe::of::<String>("text", BUFFER);

    let mut show = Filter::new("show", func(|label: String, x: i64| format!("{label}{x}")));
    show.typed_input(&x).unwrap();
    show.typed_input(&label).unwrap();
    show.typed_output(&text).unwrap();
    show.compile().unwrap();

    let model = Model::builder()
        .filter(show)
        .input(&x)
        .input(&label)
        .output(&text)
        .build()
        .unwrap();
    model.run().unwrap();
    let result = model
        .call(vec![Value::new(5i64), Value::new("n=".to_string())])
        .unwrap();
    assert_eq!(common::output::<String>(&result, 0), Some("n=5".to_string()));
    model.stop().unwrap();
    model.wait().unwrap();
}

#[test]
fn test_report_orders_producers_first() {
    let (n, items, dupls, out) = (i64_pipe("n"), i64_pipe("items"), i64_pipe("dupls"), seq_pipe("out"));
    let dup = Filter::with_pipes("dup", func(|x: i64| x * 2), &[&items], &[&dupls], &[]).unwrap();

    // Declared consumers first.
    let model = Model::builder()
        .filter(join("join", &dupls, &out, &items))
        .filter(dup)
        .filter(expand(&n, &items))
        .input(&n)
        .output(&out)
        .build()
        .unwrap();

    let report = model.report();
    assert!(!report.has_cycle);
    let names: Vec<&str> = report
        .order
        .iter()
        .map(|&i| model.filters()[i].name())
        .collect();
    assert_eq!(names, ["expand", "dup", "join"]);
    assert_eq!(report.streamed_inputs, 1);
}

#[test]
fn test_pipes_sharing_a_name_are_rejected() {
    let a = i64_pipe("a");
    let written = i64_pipe("x");
    let read = i64_pipe("x");
    let y = i64_pipe("y");

    // `g` reads a pipe nobody writes; only its name matches what `f` writes.
    let f = Filter::with_pipes("f", func(|x: i64| x + 1), &[&a], &[&written], &[]).unwrap();
    let g = Filter::with_pipes("g", func(|x: i64| x * 2), &[&read], &[&y], &[]).unwrap();
    let result = Model::builder().filter(f).filter(g).input(&a).output(&y).build();
    assert!(matches!(result, Err(PipelineError::PipeNameClash(name)) if name == "x"));
}

#[test]
fn test_rejected_model_releases_its_pipes() {
    let (x, y, z) = (i64_pipe("x"), i64_pipe("y"), i64_pipe("z"));

    // `z` is written but never read, so the graph is refused.
    let inc = Filter::with_pipes("inc", func(|x: i64| x + 1), &[&x], &[&y], &[]).unwrap();
    let stray = Filter::with_pipes("stray", func(|x: i64| x - 1), &[&x], &[&z], &[]).unwrap();
    let result = Model::builder()
        .filter(inc)
        .filter(stray)
        .input(&x)
        .output(&y)
        .build();
    assert!(matches!(result, Err(PipelineError::InvalidGraph(_))));
    assert_eq!(x.consumer_count(), 0);
    assert_eq!(y.consumer_count(), 0);

    // A failed compile leaves nothing behind either.
    let broken = Filter::with_pipes("inc", func(|x: String| x), &[&x], &[&y], &[]);
    assert!(broken.is_err());
    assert_eq!(x.consumer_count(), 0);

    // Same names, same pipes: wiring succeeds and the model runs.
    let inc = Filter::with_pipes("inc", func(|x: i64| x + 1), &[&x], &[&y], &[]).unwrap();
    let model = Model::builder().filter(inc).input(&x).output(&y).build().unwrap();
    assert_eq!(x.consumer_count(), 1);
    model.run().unwrap();
    let result = model.call(vec![Value::new(41i64)]).unwrap();
    assert_eq!(common::output::<i64>(&result, 0), Some(42));
    model.stop().unwrap();
    model.wait().unwrap();
}

#[test]
fn test_unused_model_releases_output_queue() {
    let (x, y) = (i64_pipe("x"), i64_pipe("y"));
    let inc = Filter::with_pipes("inc", func(|x: i64| x + 1), &[&x], &[&y], &[]).unwrap();
    let model = Model::builder().filter(inc).input(&x).output(&y).build().unwrap();
    assert_eq!(y.consumer_count(), 1);
    drop(model);
    assert_eq!(x.consumer_count(), 0);
    assert_eq!(y.consumer_count(), 0);
}
