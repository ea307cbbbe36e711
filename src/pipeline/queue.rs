//! Order-restoring completion queue for parallel filters.
//!
//! `push` hands out a [`Ticket`] per invocation in submission order. Tickets may be
//! completed in any order; a dispatcher thread waits on the oldest slot and only
//! forwards its result to the sink once it has arrived, so the sink observes results
//! in push order.
//!
//! At most `capacity` tickets are outstanding at once (`push` blocks beyond that),
//! which bounds the number of concurrent invocations.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{error, trace};

pub struct ReorderQueue<T: Send + 'static> {
    permits: Sender<()>,
    released: Receiver<()>,
    slots: Option<Sender<Receiver<T>>>,
    dispatcher: Option<JoinHandle<()>>,
    capacity: usize,
}

impl<T: Send + 'static> ReorderQueue<T> {
    /// Start a queue whose dispatcher thread (named `thread_name`) passes results to
    /// `sink` in push order.
    pub fn new<F>(capacity: usize, thread_name: String, mut sink: F) -> PipelineResult<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        if capacity == 0 {
            return Err(PipelineError::InvalidParallelism(capacity));
        }
        let (permits, released) = bounded(capacity);
        let (slots, slot_rx) = bounded::<Receiver<T>>(capacity);

        let dispatcher = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                for slot in slot_rx.iter() {
                    match slot.recv() {
                        Ok(result) => sink(result),
                        Err(_) => trace!("skipping abandoned slot"),
                    }
                }
            })
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        Ok(Self {
            permits,
            released,
            slots: Some(slots),
            dispatcher: Some(dispatcher),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of admitted tickets not yet completed or dropped.
    pub fn in_flight(&self) -> usize {
        self.permits.len()
    }

    /// Admit one invocation, blocking while `capacity` tickets are outstanding.
    ///
    /// Returns `None` once the dispatcher is gone (after `exit`, or if the sink
    /// panicked).
    pub fn push(&self) -> Option<Ticket<T>> {
        let slots = self.slots.as_ref()?;
        self.permits.send(()).ok()?;
        let (tx, rx) = bounded(1);
        let ticket = Ticket {
            tx,
            released: self.released.clone(),
        };
        // On failure the ticket is dropped here and gives its permit back.
        slots.send(rx).ok()?;
        Some(ticket)
    }

    /// Stop accepting pushes and wait for the dispatcher to forward every
    /// outstanding result.
    pub fn exit(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.slots.take();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                error!("reorder queue sink panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for ReorderQueue<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One admitted slot. Complete it exactly once; dropping it uncompleted frees the
/// slot and the dispatcher skips it.
pub struct Ticket<T> {
    tx: Sender<T>,
    released: Receiver<()>,
}

impl<T> Ticket<T> {
    pub fn complete(self, result: T) {
        // The dispatcher only disappears on shutdown; the result is then moot.
        let _ = self.tx.send(result);
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        let _ = self.released.try_recv();
    }
}
