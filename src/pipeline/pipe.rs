//! Typed multi-consumer pipes.
//!
//! A pipe keeps one bounded crossbeam queue per registered consumer and writes every
//! value to all of them before `set` returns. A second family of queues carries
//! sequence lengths for consumers that read a sequence one element at a time.
//!
//! Closing a pipe drops every sender: readers drain what is buffered and then see
//! [`PipelineError::PipeClosed`], and writers blocked on a full queue are released
//! through a dedicated close channel.

use crate::config::EngineConfig;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{Consumer, LengthKey};
use crate::pipeline::value::{DataType, PipeData, Value};
use crossbeam_channel::{bounded, Receiver, Select, Sender, TrySendError};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

struct Queue<T> {
    tx: Option<Sender<T>>,
    rx: Receiver<T>,
}

impl<T> Queue<T> {
    fn new(buffer: usize) -> Self {
        let (tx, rx) = bounded(buffer);
        Self { tx: Some(tx), rx }
    }
}

struct PipeInner {
    name: Arc<str>,
    ty: DataType,
    buffer: usize,
    values: RwLock<HashMap<Consumer, Queue<Option<Value>>>>,
    lengths: RwLock<HashMap<LengthKey, Queue<usize>>>,
    // Writers are serialized so every consumer sees the same order.
    write_lock: Mutex<()>,
    len_write_lock: Mutex<()>,
    open: AtomicBool,
    closed_tx: Mutex<Option<Sender<()>>>,
    closed_rx: Receiver<()>,
}

/// A named, typed, closable fan-out channel. Cloning yields another handle to the
/// same pipe.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Pipe {
    /// Create a pipe whose per-consumer queues hold up to `buffer` values.
    pub fn new(name: impl Into<String>, ty: DataType, buffer: usize) -> Self {
        let name: String = name.into();
        let (closed_tx, closed_rx) = bounded(0);
        Self {
            inner: Arc::new(PipeInner {
                name: Arc::from(name),
                ty,
                buffer,
                values: RwLock::new(HashMap::new()),
                lengths: RwLock::new(HashMap::new()),
                write_lock: Mutex::new(()),
                len_write_lock: Mutex::new(()),
                open: AtomicBool::new(true),
                closed_tx: Mutex::new(Some(closed_tx)),
                closed_rx,
            }),
        }
    }

    /// Shortcut for a pipe carrying `T`.
    pub fn of<T: PipeData>(name: impl Into<String>, buffer: usize) -> Self {
        Self::new(name, T::data_type(), buffer)
    }

    /// Create a pipe with the configured default buffer depth.
    pub fn with_config(name: impl Into<String>, ty: DataType, config: &EngineConfig) -> Self {
        Self::new(name, ty, config.pipe_buffer)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.inner.ty
    }

    pub fn buffer(&self) -> usize {
        self.inner.buffer
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Number of registered value consumers.
    pub fn consumer_count(&self) -> usize {
        read(&self.inner.values).len()
    }

    /// Values buffered for `consumer` and not yet read.
    pub fn pending(&self, consumer: &Consumer) -> usize {
        read(&self.inner.values)
            .get(consumer)
            .map_or(0, |queue| queue.rx.len())
    }

    /// Register a value queue for `consumer`.
    pub fn connect(&self, consumer: Consumer) -> PipelineResult<()> {
        let mut values = write(&self.inner.values);
        if !self.is_open() {
            return Err(self.closed());
        }
        if values.contains_key(&consumer) {
            return Err(PipelineError::AlreadyRegistered {
                owner: self.name().to_string(),
                what: consumer.to_string(),
            });
        }
        values.insert(consumer, Queue::new(self.inner.buffer));
        Ok(())
    }

    /// Register a length queue for `consumer`, which streams the pipe named
    /// `streamed` and takes its element counts from this pipe.
    pub fn connect_len(&self, consumer: Consumer, streamed: &str) -> PipelineResult<()> {
        let mut lengths = write(&self.inner.lengths);
        if !self.is_open() {
            return Err(self.closed());
        }
        let key = LengthKey::new(consumer, streamed);
        if lengths.contains_key(&key) {
            return Err(PipelineError::AlreadyRegistered {
                owner: self.name().to_string(),
                what: format!("length of '{}' for {}", key.streamed, key.consumer),
            });
        }
        lengths.insert(key, Queue::new(self.inner.buffer));
        Ok(())
    }

    /// Write a value (or the unset sentinel) to every consumer.
    ///
    /// Blocks until each consumer queue has accepted it. Fails with `TypeMismatch`
    /// if the value does not carry the declared type, in which case nothing is
    /// written, and with `PipeClosed` if the pipe is closed before the write completes.
    pub fn set(&self, value: Option<Value>) -> PipelineResult<()> {
        if let Some(value) = &value {
            let found = value.data_type();
            if found != self.inner.ty {
                return Err(PipelineError::TypeMismatch {
                    pipe: self.name().to_string(),
                    expected: self.inner.ty.clone(),
                    found,
                });
            }
        }
        let _writer = lock(&self.inner.write_lock);
        let senders = senders_of(&self.inner.values);
        self.broadcast(senders, value)
    }

    /// Write a sequence length to every length consumer.
    pub fn set_len(&self, len: usize) -> PipelineResult<()> {
        let _writer = lock(&self.inner.len_write_lock);
        let senders = senders_of(&self.inner.lengths);
        self.broadcast(senders, len)
    }

    /// Block until a value is available for `consumer`.
    pub fn get(&self, consumer: &Consumer) -> PipelineResult<Option<Value>> {
        let rx = read(&self.inner.values)
            .get(consumer)
            .map(|queue| queue.rx.clone())
            .ok_or_else(|| PipelineError::UnregisteredConsumer {
                pipe: self.name().to_string(),
                consumer: consumer.clone(),
            })?;
        rx.recv().map_err(|_| self.closed())
    }

    /// Block until the next length for `consumer` reading `streamed` is available.
    pub fn get_len(&self, consumer: &Consumer, streamed: &str) -> PipelineResult<usize> {
        let key = LengthKey::new(consumer.clone(), streamed);
        let rx = read(&self.inner.lengths)
            .get(&key)
            .map(|queue| queue.rx.clone())
            .ok_or_else(|| PipelineError::UnregisteredConsumer {
                pipe: self.name().to_string(),
                consumer: consumer.clone(),
            })?;
        rx.recv().map_err(|_| self.closed())
    }

    /// Remove every queue registered for `consumer`. Writers stop waiting on it,
    /// including writes already in progress.
    pub fn disconnect(&self, consumer: &Consumer) {
        let removed = write(&self.inner.values).remove(consumer).is_some();
        write(&self.inner.lengths).retain(|key, _| &key.consumer != consumer);
        if removed {
            debug!(pipe = %self.inner.name, %consumer, "consumer disconnected");
        }
    }

    /// Remove the length queue `consumer` registered for the pipe named `streamed`.
    pub fn disconnect_len(&self, consumer: &Consumer, streamed: &str) {
        write(&self.inner.lengths).remove(&LengthKey::new(consumer.clone(), streamed));
    }

    /// Close the pipe. Idempotent.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            for queue in write(&self.inner.values).values_mut() {
                queue.tx = None;
            }
            for queue in write(&self.inner.lengths).values_mut() {
                queue.tx = None;
            }
            lock(&self.inner.closed_tx).take();
            debug!(pipe = %self.inner.name, "pipe closed");
        }
    }

    fn closed(&self) -> PipelineError {
        PipelineError::PipeClosed(self.name().to_string())
    }

    /// Send `value` on every sender. Ready queues are served first; the rest are
    /// multiplexed so a slow consumer does not hold back a fast one.
    fn broadcast<T: Clone>(&self, mut pending: Vec<Sender<T>>, value: T) -> PipelineResult<()> {
        if !self.is_open() {
            return Err(self.closed());
        }

        // A disconnected sender belongs to a consumer that has left; skip it.
        pending.retain(|tx| matches!(tx.try_send(value.clone()), Err(TrySendError::Full(_))));

        while !pending.is_empty() {
            let mut sel = Select::new();
            for tx in &pending {
                sel.send(tx);
            }
            let close_index = sel.recv(&self.inner.closed_rx);
            let op = sel.select();
            let index = op.index();
            if index == close_index {
                let _ = op.recv(&self.inner.closed_rx);
                return Err(self.closed());
            }
            let _ = op.send(&pending[index], value.clone());
            drop(sel);
            pending.swap_remove(index);
        }
        Ok(())
    }
}

fn senders_of<K, T>(map: &RwLock<HashMap<K, Queue<T>>>) -> Vec<Sender<T>> {
    read(map)
        .values()
        .filter_map(|queue| queue.tx.clone())
        .collect()
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PartialEq for Pipe {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Pipe {}

impl Hash for Pipe {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.inner.name)
            .field("ty", &self.inner.ty)
            .field("open", &self.is_open())
            .finish()
    }
}
