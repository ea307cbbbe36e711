//! Models: an audited graph of filters with designated input and output pipes.
//!
//! ```text
//!  call(inputs) ──► [input pipes] ──► filters ... ──► [output pipes] ──► results
//! ```
//!
//! [`Model::call`] may be used from many threads at once. Each call registers a
//! result slot and writes its inputs under the submit lock; results are then read
//! one round at a time under the collect lock and handed to the oldest pending
//! call. Pipes deliver in write order, so round *k* belongs to call *k*.

use super::compiler::{AuditReport, GraphAuditor};
use crate::config::EngineConfig;
use crate::pipeline::error::{FilterFault, PipelineError, PipelineResult};
use crate::pipeline::filter::Filter;
use crate::pipeline::id::Consumer;
use crate::pipeline::pipe::Pipe;
use crate::pipeline::signal::Signal;
use crate::pipeline::value::Value;
use crossbeam_channel::{bounded, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

type CallResult = PipelineResult<Vec<Option<Value>>>;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Builder for [`Model`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    filters: Vec<Filter>,
    inputs: Vec<Pipe>,
    outputs: Vec<Pipe>,
    config: Option<EngineConfig>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn input(mut self, pipe: &Pipe) -> Self {
        self.inputs.push(pipe.clone());
        self
    }

    pub fn output(mut self, pipe: &Pipe) -> Self {
        self.outputs.push(pipe.clone());
        self
    }

    /// Apply `config` to the model (overriding per-filter parallelism).
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Audit the graph and build the model.
    pub fn build(self) -> PipelineResult<Model> {
        let mut model = Model::new(self.filters, self.inputs, self.outputs)?;
        if let Some(config) = &self.config {
            model.apply_config(config)?;
        }
        Ok(model)
    }
}

#[derive(Default)]
struct CallRouter {
    submit: Mutex<()>,
    pending: Mutex<VecDeque<Sender<CallResult>>>,
    collect: Mutex<()>,
}

pub struct Model {
    filters: Vec<Filter>,
    inputs: Vec<Pipe>,
    outputs: Vec<Pipe>,
    input_index: HashMap<String, usize>,
    output_index: HashMap<String, usize>,
    report: AuditReport,
    signal: Signal,
    config: EngineConfig,
    state: AtomicU8,
    workers: Mutex<Vec<JoinHandle<()>>>,
    router: CallRouter,
}

impl Model {
    /// Audit the graph and build the model. The filters must be compiled.
    pub fn new(
        mut filters: Vec<Filter>,
        inputs: Vec<Pipe>,
        outputs: Vec<Pipe>,
    ) -> PipelineResult<Self> {
        if inputs.is_empty() {
            return Err(PipelineError::InvalidGraph(
                "a model needs at least one input pipe".to_string(),
            ));
        }
        let report = GraphAuditor::audit(&filters, &inputs, &outputs)?;
        for (index, pipe) in outputs.iter().enumerate() {
            if let Err(err) = pipe.connect(Consumer::Model) {
                for connected in &outputs[..index] {
                    connected.disconnect(&Consumer::Model);
                }
                return Err(err);
            }
        }

        let signal = Signal::new();
        for filter in &mut filters {
            filter.attach_signal(signal.clone());
        }

        let index = |pipes: &[Pipe]| {
            pipes
                .iter()
                .enumerate()
                .map(|(i, pipe)| (pipe.name().to_string(), i))
                .collect::<HashMap<_, _>>()
        };
        info!(
            filters = filters.len(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            has_cycle = report.has_cycle,
            "model built"
        );
        Ok(Self {
            input_index: index(&inputs),
            output_index: index(&outputs),
            filters,
            inputs,
            outputs,
            report,
            signal,
            config: EngineConfig::default(),
            state: AtomicU8::new(IDLE),
            workers: Mutex::new(Vec::new()),
            router: CallRouter::default(),
        })
    }

    pub fn builder() -> ModelBuilder {
        ModelBuilder::new()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.name() == name)
    }

    pub fn inputs(&self) -> &[Pipe] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Pipe] {
        &self.outputs
    }

    /// Position of the named pipe among the model inputs.
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.input_index.get(name).copied()
    }

    /// Position of the named pipe among the model outputs.
    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.output_index.get(name).copied()
    }

    pub fn report(&self) -> &AuditReport {
        &self.report
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Set every filter's parallelism. Only before [`run`](Self::run).
    pub fn set_parallel(&mut self, parallel: usize) -> PipelineResult<()> {
        if self.state.load(Ordering::Acquire) != IDLE {
            return Err(PipelineError::AlreadyRunning);
        }
        if parallel == 0 {
            return Err(PipelineError::InvalidParallelism(parallel));
        }
        for filter in &mut self.filters {
            filter.set_parallel(parallel)?;
        }
        Ok(())
    }

    /// Apply parallelism and worker naming from `config`. Only before `run`.
    pub fn apply_config(&mut self, config: &EngineConfig) -> PipelineResult<()> {
        self.set_parallel(config.parallel)?;
        self.config = config.clone();
        Ok(())
    }

    /// Start one worker thread per filter.
    pub fn run(&self) -> PipelineResult<()> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PipelineError::AlreadyRunning)?;

        let mut workers = lock(&self.workers);
        for &index in &self.report.order {
            let filter = &self.filters[index];
            let thread_name = format!("{}-{}", self.config.worker_name_prefix, filter.name());
            let worker = filter.worker()?.with_thread_name(thread_name.clone());
            let spawned = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Workers that never started cannot acknowledge the stop.
                    for _ in workers.len()..self.report.order.len() {
                        self.signal.retire();
                    }
                    drop(workers);
                    self.shut_down();
                    return Err(PipelineError::Spawn(err.to_string()));
                }
            }
        }
        info!(workers = workers.len(), "model running");
        Ok(())
    }

    /// Feed one set of inputs through the graph and wait for the matching outputs.
    ///
    /// Outputs are in declaration order; `None` marks an output left unset by a
    /// computation fault upstream (see [`errs`](Self::errs)).
    ///
    /// # Errors
    ///
    /// A wrong number of inputs is reported as
    /// [`InputCountMismatch`](PipelineError::InputCountMismatch) and a value of the
    /// wrong type as [`TypeMismatch`](PipelineError::TypeMismatch). Neither panics
    /// or writes to the graph, so the model stays usable. A model that was never
    /// started fails with `NotRunning`; a stopped one with `PipeClosed`.
    pub fn call(&self, inputs: Vec<Value>) -> CallResult {
        if !self.is_running() {
            return Err(match self.state.load(Ordering::Acquire) {
                STOPPED => PipelineError::PipeClosed(self.inputs[0].name().to_string()),
                _ => PipelineError::NotRunning,
            });
        }
        if inputs.len() != self.inputs.len() {
            return Err(PipelineError::InputCountMismatch {
                expected: self.inputs.len(),
                found: inputs.len(),
            });
        }
        for (pipe, value) in self.inputs.iter().zip(&inputs) {
            let found = value.data_type();
            if &found != pipe.data_type() {
                return Err(PipelineError::TypeMismatch {
                    pipe: pipe.name().to_string(),
                    expected: pipe.data_type().clone(),
                    found,
                });
            }
        }

        let (tx, rx) = bounded(1);
        {
            let _submit = lock(&self.router.submit);
            lock(&self.router.pending).push_back(tx);
            for (pipe, value) in self.inputs.iter().zip(inputs) {
                if let Err(err) = pipe.set(Some(value)) {
                    lock(&self.router.pending).pop_back();
                    return Err(err);
                }
            }
        }

        self.collect_round();
        rx.recv()
            .unwrap_or_else(|_| Err(PipelineError::PipeClosed(self.outputs_label())))
    }

    /// Read one value from every output and hand them to the oldest pending call.
    fn collect_round(&self) {
        let _collect = lock(&self.router.collect);
        let round: CallResult = self
            .outputs
            .iter()
            .map(|pipe| pipe.get(&Consumer::Model))
            .collect();
        if let Some(caller) = lock(&self.router.pending).pop_front() {
            let _ = caller.send(round);
        }
    }

    fn outputs_label(&self) -> String {
        self.outputs
            .iter()
            .map(Pipe::name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Ask every worker to stop and close the model's pipes so blocked workers and
    /// callers wake up.
    pub fn stop(&self) -> PipelineResult<()> {
        match self.state.swap(STOPPED, Ordering::AcqRel) {
            IDLE => {
                self.state.store(IDLE, Ordering::Release);
                Err(PipelineError::NotRunning)
            }
            RUNNING => {
                self.shut_down();
                info!("model stopped");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn shut_down(&self) {
        self.state.store(STOPPED, Ordering::Release);
        self.signal.stop();
        for pipe in self.inputs.iter().chain(&self.outputs) {
            pipe.close();
        }
        // Wake callers whose round will never arrive.
        for caller in lock(&self.router.pending).drain(..) {
            let _ = caller.send(Err(PipelineError::PipeClosed(self.outputs_label())));
        }
    }

    /// Block until every worker has exited.
    pub fn wait(&self) -> PipelineResult<()> {
        if self.state.load(Ordering::Acquire) == IDLE {
            return Err(PipelineError::NotRunning);
        }
        self.signal.wait();
        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        let mut panicked = None;
        for handle in handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                panicked.get_or_insert(name);
            }
        }
        match panicked {
            Some(name) => Err(PipelineError::WorkerPanicked(name)),
            None => {
                debug!("all workers joined");
                Ok(())
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns whether
    /// every worker acknowledged the stop.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }

    /// Faults recorded by every filter since the last [`clear`](Self::clear).
    pub fn errs(&self) -> Vec<FilterFault> {
        self.filters.iter().flat_map(Filter::errs).collect()
    }

    pub fn has_errs(&self) -> bool {
        self.filters.iter().any(Filter::has_errs)
    }

    pub fn clear(&self) {
        self.filters.iter().for_each(Filter::clear);
    }

    pub fn log_errs(&self) {
        self.filters.iter().for_each(Filter::log_errs);
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("model dropped while running, stopping workers");
            self.shut_down();
            let _ = self.wait();
        }
        for pipe in &self.outputs {
            pipe.disconnect(&Consumer::Model);
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("filters", &self.filters)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
