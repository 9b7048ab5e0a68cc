use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tuplepipe_error::{internal, plan_err, PipeError, Result};

use crate::tuple::Tuple;

/// Default number of tuples a buffer holds before producers block.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// How a buffer gets sized.
///
/// Without an explicit capacity the buffer uses the `buffer_capacity` of the
/// query it gets attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferOptions {
    pub capacity: Option<usize>,
}

impl BufferOptions {
    pub const fn with_capacity(capacity: usize) -> Self {
        BufferOptions {
            capacity: Some(capacity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BufferStats {
    /// Tuples accepted by `put`.
    pub inserted: u64,
    /// Tuples handed out by `get`.
    pub removed: u64,
    /// Number of times a producer blocked on a full buffer.
    pub insert_waits: u64,
    /// Number of times a consumer blocked on an empty buffer.
    pub remove_waits: u64,
}

/// Result of a bounded wait on a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum PollGet {
    Tuple(Tuple),
    EndOfStream,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferStatus {
    Open,
    /// All producers finished. Remaining tuples can still be drained.
    Closed,
    /// Aborted. Both sides error out.
    Terminated,
    /// The consumer doesn't want any more input.
    ConsumerDetached,
}

#[derive(Debug)]
struct BufferState {
    queue: VecDeque<Tuple>,
    capacity: usize,
    status: BufferStatus,
    producers: usize,
    stats: BufferStats,
}

/// Bounded blocking FIFO of fixed-size tuples connecting two stages.
///
/// Any number of producer and consumer threads may share a buffer. A full
/// buffer blocks `put`, an empty buffer blocks `get`, which is the only flow
/// control between stages.
pub struct TupleBuffer {
    name: String,
    tuple_size: usize,
    /// Capacity was given by the plan and won't be replaced by the query
    /// default.
    explicit_capacity: bool,
    state: Mutex<BufferState>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TupleBuffer {
    pub fn new(name: impl Into<String>, tuple_size: usize, opts: BufferOptions) -> Result<Self> {
        let name = name.into();
        if opts.capacity == Some(0) {
            return Err(plan_err!("buffer '{name}' must have a non-zero capacity"));
        }
        let capacity = opts.capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY);
        if tuple_size == 0 {
            return Err(plan_err!("buffer '{name}' must have a non-zero tuple size"));
        }

        Ok(TupleBuffer {
            name,
            tuple_size,
            explicit_capacity: opts.capacity.is_some(),
            state: Mutex::new(BufferState {
                queue: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
                capacity,
                status: BufferStatus::Open,
                producers: 0,
                stats: BufferStats::default(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    pub fn new_shared(
        name: impl Into<String>,
        tuple_size: usize,
        opts: BufferOptions,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(name, tuple_size, opts)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Resize a buffer built without an explicit capacity. Producers blocked
    /// on the old limit are woken if the buffer grew.
    pub fn apply_default_capacity(&self, capacity: usize) {
        if self.explicit_capacity || capacity == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.capacity = capacity;
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        self.state.lock().stats
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().status == BufferStatus::Terminated
    }

    /// Register `n` more producers. The buffer closes once every registered
    /// producer called `finish_producer`.
    pub fn add_producers(&self, n: usize) {
        self.state.lock().producers += n;
    }

    pub fn finish_producer(&self) {
        let mut state = self.state.lock();
        state.producers = state.producers.saturating_sub(1);
        if state.producers == 0 && state.status == BufferStatus::Open {
            state.status = BufferStatus::Closed;
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    /// Mark the end of input. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.status == BufferStatus::Open {
            state.status = BufferStatus::Closed;
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    /// Abort the buffer, dropping anything queued and waking every blocked
    /// producer and consumer.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if state.status != BufferStatus::Terminated {
            state.status = BufferStatus::Terminated;
            state.queue.clear();
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    /// Signal that the consumer won't read any more tuples. Producers see
    /// `put` return `false` and can stop early.
    pub fn detach_consumer(&self) {
        let mut state = self.state.lock();
        if matches!(state.status, BufferStatus::Open | BufferStatus::Closed) {
            state.status = BufferStatus::ConsumerDetached;
            state.queue.clear();
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    /// Push a tuple, blocking while the buffer is full.
    ///
    /// Returns `Ok(false)` if the consumer detached and the tuple was
    /// discarded.
    pub fn put(&self, tuple: Tuple) -> Result<bool> {
        if tuple.size() != self.tuple_size {
            return Err(internal!(
                "tuple of {} bytes pushed into buffer '{}' of {} byte tuples",
                tuple.size(),
                self.name,
                self.tuple_size
            ));
        }

        let mut state = self.state.lock();
        loop {
            match state.status {
                BufferStatus::Terminated => return Err(self.closed_prematurely()),
                BufferStatus::ConsumerDetached => return Ok(false),
                BufferStatus::Closed => {
                    return Err(internal!("put into closed buffer '{}'", self.name))
                }
                BufferStatus::Open => {
                    if state.queue.len() < state.capacity {
                        state.queue.push_back(tuple);
                        state.stats.inserted += 1;
                        self.not_empty.notify_one();
                        return Ok(true);
                    }
                    state.stats.insert_waits += 1;
                    self.not_full.wait(&mut state);
                }
            }
        }
    }

    /// Pop the next tuple, blocking while the buffer is empty and open.
    ///
    /// `Ok(None)` is the normal end of stream. A terminated buffer yields
    /// `BufferClosedPrematurely`.
    pub fn get(&self) -> Result<Option<Tuple>> {
        let mut state = self.state.lock();
        loop {
            if let Some(tuple) = self.try_pop(&mut state)? {
                return Ok(Some(tuple));
            }
            match state.status {
                BufferStatus::Open => {
                    state.stats.remove_waits += 1;
                    self.not_empty.wait(&mut state);
                }
                _ => return Ok(None),
            }
        }
    }

    /// Like `get`, but gives up once `deadline` passes.
    pub fn get_deadline(&self, deadline: Instant) -> Result<PollGet> {
        let mut state = self.state.lock();
        loop {
            if let Some(tuple) = self.try_pop(&mut state)? {
                return Ok(PollGet::Tuple(tuple));
            }
            match state.status {
                BufferStatus::Open => {
                    state.stats.remove_waits += 1;
                    if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                        // Something may have raced in right at the deadline.
                        if let Some(tuple) = self.try_pop(&mut state)? {
                            return Ok(PollGet::Tuple(tuple));
                        }
                        if state.status == BufferStatus::Open {
                            return Ok(PollGet::TimedOut);
                        }
                    }
                }
                _ => return Ok(PollGet::EndOfStream),
            }
        }
    }

    fn try_pop(&self, state: &mut BufferState) -> Result<Option<Tuple>> {
        if state.status == BufferStatus::Terminated {
            return Err(self.closed_prematurely());
        }
        match state.queue.pop_front() {
            Some(tuple) => {
                state.stats.removed += 1;
                self.not_full.notify_one();
                Ok(Some(tuple))
            }
            None => Ok(None),
        }
    }

    fn closed_prematurely(&self) -> PipeError {
        PipeError::BufferClosedPrematurely {
            buffer: self.name.clone(),
        }
    }
}

impl fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TupleBuffer")
            .field("name", &self.name)
            .field("tuple_size", &self.tuple_size)
            .field("capacity", &state.capacity)
            .field("queued", &state.queue.len())
            .field("status", &state.status)
            .finish()
    }
}
