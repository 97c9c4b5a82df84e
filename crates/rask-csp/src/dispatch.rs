// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Trampolined task dispatcher.
//!
//! Channel hand-offs never call continuations directly. They queue them
//! here, and the queue is flushed in batches from host ticks, so a long
//! chain of synchronous rendezvous cannot grow the call stack.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::host::{Host, Task};
use crate::ring::RingBuffer;

const INITIAL_TASK_CAPACITY: usize = 32;

struct DispatchState {
    tasks: RefCell<RingBuffer<Task>>,
    /// A batch is being processed right now.
    running: Cell<bool>,
    /// A host tick has been requested and not yet started.
    queued: Cell<bool>,
    batch_size: usize,
    host: Rc<dyn Host>,
}

/// Handle to a runtime's dispatcher. Clones share one queue.
#[derive(Clone)]
pub struct Dispatcher {
    state: Rc<DispatchState>,
}

impl Dispatcher {
    pub fn new(host: Rc<dyn Host>, batch_size: usize) -> Self {
        Self {
            state: Rc::new(DispatchState {
                tasks: RefCell::new(RingBuffer::new(INITIAL_TASK_CAPACITY)),
                running: Cell::new(false),
                queued: Cell::new(false),
                batch_size: batch_size.max(1),
                host,
            }),
        }
    }

    pub fn host(&self) -> &Rc<dyn Host> {
        &self.state.host
    }

    /// Tasks waiting for the next batch.
    pub fn pending(&self) -> usize {
        self.state.tasks.borrow().len()
    }

    /// Queue `f` and make sure a flush is on its way.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.state.tasks.borrow_mut().unbounded_unshift(Box::new(f));
        self.request_tick();
    }

    /// Ask the host for one tick unless a flush is already queued or in
    /// progress. A running batch re-requests on its own if work remains.
    fn request_tick(&self) {
        let state = &self.state;
        if state.queued.get() || state.running.get() {
            return;
        }
        state.queued.set(true);
        let weak = Rc::downgrade(&self.state);
        state.host.schedule_soon(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                Dispatcher { state }.process_batch();
            }
        }));
    }

    /// Run up to one batch of tasks. Returns how many ran.
    pub fn process_batch(&self) -> usize {
        let state = &self.state;
        state.running.set(true);
        state.queued.set(false);

        let mut ran = 0;
        while ran < state.batch_size {
            // Borrow ends before the task runs; tasks enqueue more tasks.
            let task = state.tasks.borrow_mut().pop();
            let Some(task) = task else { break };
            task();
            ran += 1;
        }

        state.running.set(false);
        let remaining = self.pending();
        trace!(ran, remaining, "dispatch batch");
        if remaining > 0 {
            self.request_tick();
        }
        ran
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending())
            .field("running", &self.state.running.get())
            .field("queued", &self.state.queued.get())
            .finish()
    }
}
