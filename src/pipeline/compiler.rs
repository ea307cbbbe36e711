//! Static audit of a filter graph.
//!
//! Run once when a model is built, before any worker exists. A graph that fails
//! the audit is never started: every rule here guards against a worker waiting on
//! a pipe that nothing will ever write.

use super::filter::{Filter, FilterPlan, OutputLink};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::pipe::Pipe;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// What the audit learned about an accepted graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Filter indices, producers before consumers where the graph allows it.
    pub order: Vec<usize>,
    /// The filter graph contains a cycle; filters on it trail `order` in
    /// declaration order.
    pub has_cycle: bool,
    /// Distinct pipes referenced by filters.
    pub pipes: usize,
    /// Inputs that read a sequence one element at a time.
    pub streamed_inputs: usize,
}

/// Validates a model's filters against its declared input and output pipes.
pub struct GraphAuditor;

/// Who writes and who reads each pipe, keyed by pipe name.
#[derive(Default)]
struct Wiring<'a> {
    producers: HashMap<&'a str, Vec<(usize, &'a OutputLink)>>,
    readers: HashMap<&'a str, Vec<usize>>,
    length_readers: HashMap<&'a str, Vec<usize>>,
}

impl<'a> Wiring<'a> {
    fn build(plans: &[&'a FilterPlan]) -> Self {
        let mut wiring = Wiring::default();
        for (index, &plan) in plans.iter().enumerate() {
            for link in &plan.outputs {
                wiring
                    .producers
                    .entry(link.pipe.name())
                    .or_default()
                    .push((index, link));
            }
            for link in &plan.inputs {
                wiring
                    .readers
                    .entry(link.pipe.name())
                    .or_default()
                    .push(index);
                if let Some(source) = &link.length {
                    wiring
                        .length_readers
                        .entry(source.name())
                        .or_default()
                        .push(index);
                }
            }
        }
        wiring
    }

    fn producers(&self, pipe: &str) -> &[(usize, &'a OutputLink)] {
        self.producers
            .get(pipe)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn is_read(&self, pipe: &str) -> bool {
        self.readers.contains_key(pipe) || self.length_readers.contains_key(pipe)
    }
}

impl GraphAuditor {
    /// Audit the graph formed by `filters`, fed through `inputs` and read through
    /// `outputs`.
    pub fn audit(filters: &[Filter], inputs: &[Pipe], outputs: &[Pipe]) -> PipelineResult<AuditReport> {
        let plans = Self::compiled_plans(filters)?;
        let model_inputs = Self::unique_names(inputs, "input")?;
        let model_outputs = Self::unique_names(outputs, "output")?;
        Self::check_pipe_identity(&plans, inputs, outputs)?;
        let wiring = Wiring::build(&plans);

        Self::check_lengths(&plans, &wiring, &model_inputs)?;
        Self::check_inputs(&plans, &wiring, &model_inputs)?;
        Self::check_outputs(&plans, &wiring, &model_outputs)?;
        Self::check_model_io(inputs, outputs, &wiring)?;

        let (order, has_cycle) = Self::topological_order(&plans, &wiring);
        if has_cycle {
            warn!("filter graph contains a cycle; workers are started in declaration order");
        }

        let pipes: HashSet<&str> = wiring
            .producers
            .keys()
            .chain(wiring.readers.keys())
            .chain(wiring.length_readers.keys())
            .copied()
            .collect();
        let report = AuditReport {
            order,
            has_cycle,
            pipes: pipes.len(),
            streamed_inputs: plans
                .iter()
                .flat_map(|plan| &plan.inputs)
                .filter(|link| link.length.is_some())
                .count(),
        };
        debug!(
            filters = plans.len(),
            pipes = report.pipes,
            streamed_inputs = report.streamed_inputs,
            "graph audit passed"
        );
        Ok(report)
    }

    fn compiled_plans(filters: &[Filter]) -> PipelineResult<Vec<&FilterPlan>> {
        let mut names = HashSet::new();
        filters
            .iter()
            .map(|filter| {
                if !names.insert(filter.name()) {
                    return Err(PipelineError::DuplicateFilter(filter.name().to_string()));
                }
                filter
                    .plan()
                    .ok_or_else(|| PipelineError::NotCompiled(filter.name().to_string()))
            })
            .collect()
    }

    fn unique_names<'a>(pipes: &'a [Pipe], side: &'static str) -> PipelineResult<HashSet<&'a str>> {
        let mut names = HashSet::with_capacity(pipes.len());
        for pipe in pipes {
            if !names.insert(pipe.name()) {
                return Err(PipelineError::DuplicateIO {
                    pipe: pipe.name().to_string(),
                    side,
                });
            }
        }
        Ok(names)
    }

    /// Pipes are matched up by name below, so one name must mean one pipe.
    fn check_pipe_identity(plans: &[&FilterPlan], inputs: &[Pipe], outputs: &[Pipe]) -> PipelineResult<()> {
        let linked = plans.iter().flat_map(|plan| {
            plan.inputs
                .iter()
                .flat_map(|link| std::iter::once(&link.pipe).chain(&link.length))
                .chain(plan.outputs.iter().map(|link| &link.pipe))
        });
        let mut seen: HashMap<&str, &Pipe> = HashMap::new();
        for pipe in inputs.iter().chain(outputs).chain(linked) {
            match seen.get(pipe.name()) {
                Some(&first) if first != pipe => {
                    return Err(PipelineError::PipeNameClash(pipe.name().to_string()))
                }
                Some(_) => {}
                None => {
                    seen.insert(pipe.name(), pipe);
                }
            }
        }
        Ok(())
    }

    /// A streamed input needs a length written once per sequence by a single
    /// filter that returns that sequence whole.
    fn check_lengths(
        plans: &[&FilterPlan],
        wiring: &Wiring<'_>,
        model_inputs: &HashSet<&str>,
    ) -> PipelineResult<()> {
        for (index, plan) in plans.iter().enumerate() {
            for link in &plan.inputs {
                let Some(source) = &link.length else {
                    continue;
                };
                let (filter, streamed, source) = (&plan.name, link.pipe.name(), source.name());
                let deadlock = |detail: String| Err(PipelineError::PossibleDeadlock(detail));

                if model_inputs.contains(source) {
                    return deadlock(format!(
                        "filter '{filter}' takes the lengths of '{streamed}' from model input '{source}', which carries no lengths"
                    ));
                }
                if model_inputs.contains(streamed) {
                    return deadlock(format!(
                        "filter '{filter}' reads model input '{streamed}' one element at a time"
                    ));
                }
                match wiring.producers(source) {
                    [] => {
                        return deadlock(format!(
                            "length source '{source}' of filter '{filter}' is not written by any filter"
                        ))
                    }
                    [(producer, _)] if *producer == index => {
                        return deadlock(format!(
                            "filter '{filter}' takes the lengths of '{streamed}' from its own output '{source}'"
                        ))
                    }
                    [(_, out)] if !(out.streamed || out.pipe.data_type().is_seq()) => {
                        return deadlock(format!(
                            "length source '{source}' of filter '{filter}' is not written as a sequence, so it never carries a length"
                        ))
                    }
                    [_] => {}
                    many => {
                        return deadlock(format!(
                            "length source '{source}' of filter '{filter}' is written by {} filters",
                            many.len()
                        ))
                    }
                }
                let streams_itself = wiring
                    .producers(streamed)
                    .iter()
                    .any(|(_, out)| out.streamed);
                if streams_itself && streamed != source {
                    return deadlock(format!(
                        "filter '{filter}' pairs '{streamed}', which is already streamed by its producer, with lengths from '{source}'"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Every filter input is either a model input or written by exactly one other
    /// filter.
    fn check_inputs(
        plans: &[&FilterPlan],
        wiring: &Wiring<'_>,
        model_inputs: &HashSet<&str>,
    ) -> PipelineResult<()> {
        for (index, plan) in plans.iter().enumerate() {
            for link in &plan.inputs {
                let pipe = link.pipe.name();
                let is_model_input = model_inputs.contains(pipe);
                match (is_model_input, wiring.producers(pipe)) {
                    (true, []) => {}
                    (true, [(producer, _), ..]) => {
                        return Err(PipelineError::InvalidGraph(format!(
                            "pipe '{pipe}' is a model input but is also written by filter '{}'",
                            plans[*producer].name
                        )))
                    }
                    (false, []) => {
                        return Err(PipelineError::InvalidGraph(format!(
                            "input '{pipe}' of filter '{}' is neither a model input nor written by any filter",
                            plan.name
                        )))
                    }
                    (false, [(producer, _)]) if *producer == index => {
                        return Err(PipelineError::InvalidGraph(format!(
                            "filter '{}' reads its own output '{pipe}'",
                            plan.name
                        )))
                    }
                    (false, [_]) => {}
                    (false, many) => {
                        return Err(PipelineError::InvalidGraph(format!(
                            "pipe '{pipe}' is written by {} filters",
                            many.len()
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Every filter output is read by someone, and model outputs carry whole values.
    fn check_outputs(
        plans: &[&FilterPlan],
        wiring: &Wiring<'_>,
        model_outputs: &HashSet<&str>,
    ) -> PipelineResult<()> {
        for (pipe, producers) in &wiring.producers {
            if producers.len() > 1 {
                return Err(PipelineError::InvalidGraph(format!(
                    "pipe '{pipe}' is written by {} filters",
                    producers.len()
                )));
            }
        }
        for plan in plans {
            for link in &plan.outputs {
                let pipe = link.pipe.name();
                let is_model_output = model_outputs.contains(pipe);
                if !is_model_output && !wiring.is_read(pipe) {
                    return Err(PipelineError::InvalidGraph(format!(
                        "output '{pipe}' of filter '{}' is neither a model output nor read by any filter",
                        plan.name
                    )));
                }
                if is_model_output && link.streamed {
                    return Err(PipelineError::InvalidGraph(format!(
                        "model output '{pipe}' is written one element at a time by filter '{}'",
                        plan.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_model_io(inputs: &[Pipe], outputs: &[Pipe], wiring: &Wiring<'_>) -> PipelineResult<()> {
        if let Some(pipe) = inputs.iter().find(|pipe| !wiring.is_read(pipe.name())) {
            return Err(PipelineError::InvalidGraph(format!(
                "model input '{}' is not read by any filter",
                pipe.name()
            )));
        }
        if let Some(pipe) = outputs
            .iter()
            .find(|pipe| wiring.producers(pipe.name()).is_empty())
        {
            return Err(PipelineError::InvalidGraph(format!(
                "model output '{}' is not written by any filter",
                pipe.name()
            )));
        }
        Ok(())
    }

    /// Kahn's algorithm over producer -> reader edges. Filters left over on a cycle
    /// are appended in declaration order.
    fn topological_order(plans: &[&FilterPlan], wiring: &Wiring<'_>) -> (Vec<usize>, bool) {
        let n = plans.len();
        let mut successors: Vec<HashSet<usize>> = vec![HashSet::new(); n];
        let mut in_degree = vec![0usize; n];
        for (pipe, producers) in &wiring.producers {
            let readers = wiring
                .readers
                .get(pipe)
                .into_iter()
                .chain(wiring.length_readers.get(pipe))
                .flatten();
            for &reader in readers {
                for &(producer, _) in producers {
                    if producer != reader && successors[producer].insert(reader) {
                        in_degree[reader] += 1;
                    }
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(index) = queue.pop_front() {
            order.push(index);
            let mut next: Vec<usize> = successors[index].iter().copied().collect();
            next.sort_unstable();
            for reader in next {
                in_degree[reader] -= 1;
                if in_degree[reader] == 0 {
                    queue.push_back(reader);
                }
            }
        }

        let has_cycle = order.len() < n;
        if has_cycle {
            let placed: HashSet<usize> = order.iter().copied().collect();
            order.extend((0..n).filter(|i| !placed.contains(i)));
        }
        (order, has_cycle)
    }
}
