//! Filters and their worker loop.
//!
//! A [`Filter`] binds one computation to input and output pipes. Wiring happens on
//! the filter itself; [`Filter::compile`] resolves every parameter and return slot
//! to a pipe and freezes the result into a `FilterPlan`. A [`FilterWorker`] then runs
//! that plan until a stop token is consumed or a pipe closes:
//!
//! 1. fetch one value per input (a streamed input fetches its length first, then
//!    that many elements),
//! 2. invoke the computation, catching errors and panics as [`FilterFault`]s,
//! 3. write the results (a streamed output writes its length, then each element).
//!
//! With parallelism above one, invocations run on their own threads and a
//! [`ReorderQueue`] restores submission order before anything is written.

use crate::pipeline::binding::{Binding, Computation};
use crate::pipeline::error::{FilterFault, PipelineError, PipelineResult};
use crate::pipeline::id::Consumer;
use crate::pipeline::pipe::Pipe;
use crate::pipeline::pipe_set::PipeSet;
use crate::pipeline::queue::ReorderQueue;
use crate::pipeline::signal::Signal;
use crate::pipeline::value::{DataType, Value};
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tracing::{debug, error, warn};

/// Pairs a streamed input pipe with the pipe whose lengths delimit each sequence.
#[derive(Debug, Clone)]
pub struct Length {
    pub streamed: Pipe,
    pub source: Pipe,
}

impl Length {
    pub fn new(streamed: &Pipe, source: &Pipe) -> Self {
        Self {
            streamed: streamed.clone(),
            source: source.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InputLink {
    pub(crate) pipe: Pipe,
    pub(crate) slot: usize,
    /// Set when the slot is a sequence fed one element at a time.
    pub(crate) length: Option<Pipe>,
}

#[derive(Debug, Clone)]
pub(crate) struct OutputLink {
    pub(crate) pipe: Pipe,
    pub(crate) slot: usize,
    /// The slot returns a sequence that is written one element at a time.
    pub(crate) streamed: bool,
}

/// Compiled wiring of a filter. Inputs are in parameter order and outputs in
/// return order.
#[derive(Debug)]
pub(crate) struct FilterPlan {
    pub(crate) name: Arc<str>,
    pub(crate) binding: Binding,
    pub(crate) inputs: Vec<InputLink>,
    pub(crate) outputs: Vec<OutputLink>,
}

enum Outcome {
    Values(Vec<Value>),
    Unset,
}

pub struct Filter {
    name: Arc<str>,
    binding: Binding,
    inputs: PipeSet,
    outputs: PipeSet,
    parallel: usize,
    plan: Option<Arc<FilterPlan>>,
    faults: Arc<Mutex<Vec<FilterFault>>>,
    signal: Option<Signal>,
    // Set once a worker is handed out; the worker then owns leaving the pipes.
    launched: AtomicBool,
}

impl Filter {
    pub fn new(name: impl Into<String>, computation: Arc<dyn Computation>) -> Self {
        let name: String = name.into();
        Self {
            inputs: PipeSet::new(format!("{name} inputs")),
            outputs: PipeSet::new(format!("{name} outputs")),
            name: Arc::from(name),
            binding: Binding::new(computation),
            parallel: 1,
            plan: None,
            faults: Arc::default(),
            signal: None,
            launched: AtomicBool::new(false),
        }
    }

    /// Build and compile a filter in one go. Inputs and outputs are bound to the
    /// parameter and return slots in order.
    pub fn with_pipes(
        name: impl Into<String>,
        computation: Arc<dyn Computation>,
        ins: &[&Pipe],
        outs: &[&Pipe],
        lens: &[Length],
    ) -> PipelineResult<Self> {
        let mut filter = Self::new(name, computation);
        for pipe in ins {
            filter.input(pipe)?;
        }
        for pipe in outs {
            filter.output(pipe)?;
        }
        for length in lens {
            filter.length(&length.streamed, &length.source)?;
        }
        filter.compile()?;
        Ok(filter)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    pub fn is_compiled(&self) -> bool {
        self.plan.is_some()
    }

    pub fn inputs(&self) -> &PipeSet {
        &self.inputs
    }

    pub fn outputs(&self) -> &PipeSet {
        &self.outputs
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Read from `pipe` through the next unbound parameter slot.
    pub fn input(&mut self, pipe: &Pipe) -> PipelineResult<&mut Self> {
        self.ensure_wiring()?;
        pipe.connect(self.consumer())?;
        if let Err(err) = self.inputs.register_named(pipe) {
            pipe.disconnect(&self.consumer());
            return Err(err);
        }
        self.binding.bind_in(pipe)?;
        Ok(self)
    }

    /// Read from `pipe` through the unnamed parameter slot of its type.
    pub fn typed_input(&mut self, pipe: &Pipe) -> PipelineResult<&mut Self> {
        self.ensure_wiring()?;
        pipe.connect(self.consumer())?;
        if let Err(err) = self.inputs.register_typed(pipe) {
            pipe.disconnect(&self.consumer());
            return Err(err);
        }
        Ok(self)
    }

    /// Write the next unbound return slot to `pipe`.
    pub fn output(&mut self, pipe: &Pipe) -> PipelineResult<&mut Self> {
        self.ensure_wiring()?;
        self.outputs.register_named(pipe)?;
        self.binding.bind_out(pipe)?;
        Ok(self)
    }

    /// Write the unnamed return slot of its type to `pipe`.
    pub fn typed_output(&mut self, pipe: &Pipe) -> PipelineResult<&mut Self> {
        self.ensure_wiring()?;
        self.outputs.register_typed(pipe)?;
        Ok(self)
    }

    /// Take the element count of each sequence read from `streamed` from the
    /// lengths written alongside `source`.
    pub fn length(&mut self, streamed: &Pipe, source: &Pipe) -> PipelineResult<&mut Self> {
        self.ensure_wiring()?;
        source.connect_len(self.consumer(), streamed.name())?;
        if let Err(err) = self.inputs.set_length(streamed.name(), source) {
            source.disconnect_len(&self.consumer(), streamed.name());
            return Err(err);
        }
        Ok(self)
    }

    /// Name parameter slot `index`, so the input pipe of that name feeds it.
    pub fn name_in(&mut self, index: usize, name: &str) -> PipelineResult<&mut Self> {
        self.ensure_wiring()?;
        self.binding.name_in(index, name)?;
        Ok(self)
    }

    /// Name return slot `index`, so it is written to the output pipe of that name.
    pub fn name_out(&mut self, index: usize, name: &str) -> PipelineResult<&mut Self> {
        self.ensure_wiring()?;
        self.binding.name_out(index, name)?;
        Ok(self)
    }

    /// Number of invocations allowed in flight at once.
    pub fn set_parallel(&mut self, parallel: usize) -> PipelineResult<()> {
        if parallel == 0 {
            return Err(PipelineError::InvalidParallelism(parallel));
        }
        self.parallel = parallel;
        Ok(())
    }

    /// Resolve every slot to a pipe and freeze the wiring. Calling it again on a
    /// compiled filter does nothing.
    pub fn compile(&mut self) -> PipelineResult<()> {
        if self.plan.is_some() {
            return Ok(());
        }
        let filter = self.name.to_string();
        self.binding.compile(&filter)?;
        if self.inputs.is_empty() {
            return Err(PipelineError::InvalidGraph(format!(
                "filter '{filter}' has no input pipes"
            )));
        }

        let mut bound = HashSet::new();
        let mut inputs = Vec::with_capacity(self.binding.params().len());
        for (slot, param) in self.binding.params().iter().enumerate() {
            let pipe = match &param.name {
                Some(name) => self.inputs.by_name(name),
                None => self.inputs.by_type(&param.ty).or_else(|| {
                    param.ty.element().and_then(|elem| self.inputs.by_type(elem))
                }),
            }
            .ok_or_else(|| PipelineError::PipeNotFound {
                filter: filter.clone(),
                slot: describe_slot("parameter", slot, param.name.as_deref()),
            })?;
            claim(&mut bound, &filter, pipe, "parameter")?;

            let streamed = is_streamed(&filter, pipe, &param.ty)?;
            let length = if streamed {
                let source = self.inputs.length_for(pipe.name()).ok_or_else(|| {
                    PipelineError::MissingLength {
                        filter: filter.clone(),
                        pipe: pipe.name().to_string(),
                    }
                })?;
                Some(source.clone())
            } else {
                None
            };
            inputs.push(InputLink {
                pipe: pipe.clone(),
                slot,
                length,
            });
        }
        check_all_bound(&filter, &self.inputs, &bound, "input")?;
        for (streamed, _) in self.inputs.lengths() {
            let is_streamed = inputs
                .iter()
                .any(|link| link.length.is_some() && link.pipe.name() == streamed);
            if !is_streamed {
                return Err(PipelineError::InvalidGraph(format!(
                    "filter '{filter}': pipe '{streamed}' has a length source but is not read one element at a time"
                )));
            }
        }

        let mut bound = HashSet::new();
        let mut outputs = Vec::with_capacity(self.binding.returns().len());
        for (slot, ret) in self.binding.returns().iter().enumerate() {
            let pipe = match &ret.name {
                Some(name) => self.outputs.by_name(name),
                None => self.outputs.by_type(&ret.ty).or_else(|| {
                    ret.ty.element().and_then(|elem| self.outputs.by_type(elem))
                }),
            }
            .ok_or_else(|| PipelineError::PipeNotFound {
                filter: filter.clone(),
                slot: describe_slot("return", slot, ret.name.as_deref()),
            })?;
            claim(&mut bound, &filter, pipe, "return")?;
            outputs.push(OutputLink {
                pipe: pipe.clone(),
                slot,
                streamed: is_streamed(&filter, pipe, &ret.ty)?,
            });
        }
        check_all_bound(&filter, &self.outputs, &bound, "output")?;

        debug!(
            filter = %filter,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "filter compiled"
        );
        self.plan = Some(Arc::new(FilterPlan {
            name: self.name.clone(),
            binding: self.binding.clone(),
            inputs,
            outputs,
        }));
        Ok(())
    }

    pub(crate) fn plan(&self) -> Option<&FilterPlan> {
        self.plan.as_deref()
    }

    pub(crate) fn attach_signal(&mut self, signal: Signal) {
        signal.register();
        self.signal = Some(signal);
    }

    /// A worker for this filter's compiled plan.
    pub fn worker(&self) -> PipelineResult<FilterWorker> {
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| PipelineError::NotCompiled(self.name.to_string()))?;
        self.launched.store(true, Ordering::Release);
        Ok(FilterWorker {
            thread_name: format!("pipfil-{}", self.name),
            plan,
            parallel: self.parallel,
            faults: self.faults.clone(),
            signal: self.signal.clone(),
        })
    }

    /// Run the worker loop on the current thread until it exits.
    pub fn run(&self) -> PipelineResult<()> {
        self.worker()?.run();
        Ok(())
    }

    /// Faults recorded since the last [`clear`](Self::clear).
    pub fn errs(&self) -> Vec<FilterFault> {
        lock(&self.faults).clone()
    }

    pub fn has_errs(&self) -> bool {
        !lock(&self.faults).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.faults).clear();
    }

    /// Emit one warning per recorded fault.
    pub fn log_errs(&self) {
        for fault in lock(&self.faults).iter() {
            warn!(filter = %fault.filter, kind = %fault.kind, "{}", fault.message);
        }
    }

    fn consumer(&self) -> Consumer {
        Consumer::Filter(self.name.clone())
    }

    fn ensure_wiring(&self) -> PipelineResult<()> {
        if self.plan.is_some() {
            return Err(PipelineError::InvalidGraph(format!(
                "filter '{}' is compiled and its wiring can no longer change",
                self.name
            )));
        }
        Ok(())
    }
}

/// A filter that never handed out a worker leaves the queues it registered, so
/// writers on shared pipes do not fill them and the name can be wired again.
impl Drop for Filter {
    fn drop(&mut self) {
        if self.launched.load(Ordering::Acquire) {
            return;
        }
        let consumer = self.consumer();
        for pipe in &self.inputs {
            pipe.disconnect(&consumer);
        }
        for (streamed, source) in self.inputs.lengths() {
            source.disconnect_len(&consumer, streamed);
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("parallel", &self.parallel)
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

fn describe_slot(side: &str, index: usize, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{side} {index} ('{name}')"),
        None => format!("{side} {index}"),
    }
}

fn claim<'a>(
    bound: &mut HashSet<&'a str>,
    filter: &str,
    pipe: &'a Pipe,
    side: &str,
) -> PipelineResult<()> {
    if !bound.insert(pipe.name()) {
        return Err(PipelineError::AmbiguousType {
            filter: filter.to_string(),
            detail: format!("pipe '{}' is bound to more than one {side} slot", pipe.name()),
        });
    }
    Ok(())
}

/// Whether a slot of type `slot_ty` moves through `pipe` one element at a time.
fn is_streamed(filter: &str, pipe: &Pipe, slot_ty: &DataType) -> PipelineResult<bool> {
    if pipe.data_type() == slot_ty {
        Ok(false)
    } else if slot_ty.streams_from(pipe.data_type()) {
        Ok(true)
    } else {
        Err(PipelineError::TypeMismatch {
            pipe: format!("{} (filter '{filter}')", pipe.name()),
            expected: slot_ty.clone(),
            found: pipe.data_type().clone(),
        })
    }
}

fn check_all_bound(
    filter: &str,
    set: &PipeSet,
    bound: &HashSet<&str>,
    side: &'static str,
) -> PipelineResult<()> {
    set.try_for_each(|pipe| {
        if bound.contains(pipe.name()) {
            Ok(())
        } else {
            Err(PipelineError::UnboundPipe {
                filter: filter.to_string(),
                pipe: pipe.name().to_string(),
                side,
            })
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn joined<T>(result: thread::Result<PipelineResult<T>>, pipe: &Pipe) -> PipelineResult<T> {
    result.unwrap_or_else(|_| Err(PipelineError::WorkerPanicked(pipe.name().to_string())))
}

impl InputLink {
    fn fetch(&self, consumer: &Consumer) -> PipelineResult<Option<Value>> {
        let Some(source) = &self.length else {
            return self.pipe.get(consumer);
        };
        let n = source.get_len(consumer, self.pipe.name())?;
        let mut items = Vec::with_capacity(n);
        let mut unset = false;
        for _ in 0..n {
            match self.pipe.get(consumer)? {
                Some(item) => items.push(item),
                None => unset = true,
            }
        }
        Ok((!unset).then(|| Value::seq(self.pipe.data_type().clone(), items)))
    }
}

impl OutputLink {
    fn emit(&self, value: Option<&Value>) -> PipelineResult<()> {
        if self.streamed {
            let items = value.and_then(Value::items).unwrap_or(&[]);
            self.pipe.set_len(items.len())?;
            return items
                .iter()
                .try_for_each(|item| self.pipe.set(Some(item.clone())));
        }
        if self.pipe.data_type().is_seq() {
            let len = value.and_then(Value::items).map_or(0, <[Value]>::len);
            self.pipe.set_len(len)?;
        }
        self.pipe.set(value.cloned())
    }
}

impl FilterPlan {
    fn is_open(&self) -> bool {
        self.inputs.iter().all(|link| link.pipe.is_open())
            && self.outputs.iter().all(|link| link.pipe.is_open())
    }

    /// One value per parameter, or `None` if any input delivered the unset
    /// sentinel. Inputs are fetched concurrently.
    fn fetch(&self, consumer: &Consumer) -> PipelineResult<Option<Vec<Value>>> {
        let fetched: Vec<Option<Value>> = match self.inputs.as_slice() {
            [link] => vec![link.fetch(consumer)?],
            links => thread::scope(|s| {
                let handles: Vec<_> = links
                    .iter()
                    .map(|link| (link, s.spawn(move || link.fetch(consumer))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(link, handle)| joined(handle.join(), &link.pipe))
                    .collect::<PipelineResult<Vec<_>>>()
            })?,
        };
        Ok(fetched.into_iter().collect())
    }

    fn invoke(&self, args: Option<Vec<Value>>, faults: &Mutex<Vec<FilterFault>>) -> Outcome {
        let Some(args) = args else {
            return Outcome::Unset;
        };
        let fault = match panic::catch_unwind(AssertUnwindSafe(|| self.binding.invoke(args))) {
            Ok(Ok(values)) => return Outcome::Values(values),
            Ok(Err(err)) => FilterFault::computation(&*self.name, &err),
            Err(payload) => FilterFault::panic(&*self.name, payload.as_ref()),
        };
        warn!(
            filter = %self.name,
            kind = %fault.kind,
            error = %fault.message,
            "invocation failed, outputs unset"
        );
        lock(faults).push(fault);
        Outcome::Unset
    }

    /// Write an outcome to every output, concurrently when there are several.
    fn emit(&self, outcome: &Outcome) -> PipelineResult<()> {
        let value_for = |link: &OutputLink| match outcome {
            Outcome::Values(values) => values.get(link.slot),
            Outcome::Unset => None,
        };
        match self.outputs.as_slice() {
            [] => Ok(()),
            [link] => link.emit(value_for(link)),
            links => thread::scope(|s| {
                let handles: Vec<_> = links
                    .iter()
                    .map(|link| {
                        let value = value_for(link);
                        (link, s.spawn(move || link.emit(value)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .try_for_each(|(link, handle)| joined(handle.join(), &link.pipe))
            }),
        }
    }

    /// Close owned outputs and leave every input queue.
    fn shut_down(&self, consumer: &Consumer) {
        for link in &self.outputs {
            link.pipe.close();
        }
        for link in &self.inputs {
            link.pipe.disconnect(consumer);
            if let Some(source) = &link.length {
                source.disconnect(consumer);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stopped,
    EndOfStream,
    SendFailed,
}

/// The runnable half of a compiled filter. Move it onto a thread and call
/// [`run`](Self::run).
pub struct FilterWorker {
    plan: Arc<FilterPlan>,
    parallel: usize,
    faults: Arc<Mutex<Vec<FilterFault>>>,
    signal: Option<Signal>,
    thread_name: String,
}

impl FilterWorker {
    pub fn name(&self) -> &str {
        &self.plan.name
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn with_thread_name(mut self, thread_name: String) -> Self {
        self.thread_name = thread_name;
        self
    }

    /// Process invocations until stopped or until a pipe closes. On exit the
    /// outputs are closed and the worker leaves its input pipes.
    pub fn run(self) {
        let consumer = Consumer::Filter(self.plan.name.clone());
        debug!(filter = %self.plan.name, parallel = self.parallel, "filter worker started");

        let exit = if self.parallel > 1 {
            self.run_parallel(&consumer)
        } else {
            self.run_serial(&consumer)
        };

        self.plan.shut_down(&consumer);
        if exit != Exit::Stopped {
            if let Some(signal) = &self.signal {
                signal.retire();
            }
        }
        debug!(filter = %self.plan.name, ?exit, "filter worker exited");
    }

    fn run_serial(&self, consumer: &Consumer) -> Exit {
        loop {
            if let Some(exit) = self.checkpoint() {
                return exit;
            }
            let args = match self.plan.fetch(consumer) {
                Ok(args) => args,
                Err(err) => return self.input_ended(err),
            };
            if self.stop_requested() {
                return Exit::Stopped;
            }
            let outcome = self.plan.invoke(args, &self.faults);
            if let Err(err) = self.plan.emit(&outcome) {
                return self.send_failed(err);
            }
        }
    }

    fn run_parallel(&self, consumer: &Consumer) -> Exit {
        let send_error: Arc<Mutex<Option<PipelineError>>> = Arc::default();
        let sink = {
            let plan = self.plan.clone();
            let send_error = send_error.clone();
            move |outcome: Outcome| {
                if lock(&send_error).is_some() {
                    return;
                }
                if let Err(err) = plan.emit(&outcome) {
                    lock(&send_error).get_or_insert(err);
                }
            }
        };
        let queue = match ReorderQueue::new(
            self.parallel,
            format!("{}-reorder", self.thread_name),
            sink,
        ) {
            Ok(queue) => queue,
            Err(err) => {
                error!(filter = %self.plan.name, error = %err, "failed to start reorder queue");
                return Exit::SendFailed;
            }
        };

        let exit = loop {
            if let Some(exit) = self.checkpoint() {
                break exit;
            }
            if let Some(err) = lock(&send_error).clone() {
                break self.send_failed(err);
            }
            let args = match self.plan.fetch(consumer) {
                Ok(args) => args,
                Err(err) => break self.input_ended(err),
            };
            if self.stop_requested() {
                break Exit::Stopped;
            }
            let Some(ticket) = queue.push() else {
                error!(filter = %self.plan.name, "reorder queue dispatcher is gone");
                break Exit::SendFailed;
            };
            let plan = self.plan.clone();
            let faults = self.faults.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-call", self.thread_name))
                .spawn(move || ticket.complete(plan.invoke(args, &faults)));
            if let Err(err) = spawned {
                error!(filter = %self.plan.name, error = %err, "failed to spawn invocation");
                break Exit::SendFailed;
            }
        };

        // In-flight invocations are forwarded before the outputs close.
        queue.exit();
        exit
    }

    fn checkpoint(&self) -> Option<Exit> {
        if self.stop_requested() {
            Some(Exit::Stopped)
        } else if !self.plan.is_open() {
            Some(Exit::EndOfStream)
        } else {
            None
        }
    }

    fn stop_requested(&self) -> bool {
        self.signal.as_ref().is_some_and(Signal::try_stop)
    }

    fn input_ended(&self, err: PipelineError) -> Exit {
        debug!(filter = %self.plan.name, reason = %err, "input ended");
        Exit::EndOfStream
    }

    fn send_failed(&self, err: PipelineError) -> Exit {
        match err {
            PipelineError::PipeClosed(pipe) => {
                debug!(filter = %self.plan.name, pipe = %pipe, "output closed");
                Exit::EndOfStream
            }
            other => {
                error!(filter = %self.plan.name, error = %other, "failed to send results");
                Exit::SendFailed
            }
        }
    }
}
