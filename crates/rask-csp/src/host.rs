// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Host scheduling primitives and a single-threaded event loop.
//!
//! The dispatcher and the timer registry are the only consumers of
//! `Host`. `EventLoop` is the in-process host: tests drive it with a
//! manual clock, programs with the system clock.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::error::FrameError;

/// Deferred unit of work.
pub type Task = Box<dyn FnOnce()>;

pub trait Host {
    /// Monotonic time since the host started.
    fn now(&self) -> Duration;

    /// Run `task` at the next opportunity, after already-queued work.
    fn schedule_soon(&self, task: Task);

    /// Run `task` no earlier than `delay` from now.
    fn schedule_after(&self, delay: Duration, task: Task);

    /// Default error channel for failures nobody is left to return to.
    fn report(&self, err: FrameError) {
        error!(error = %err, "uncaught frame error");
    }
}

enum Clock {
    System(Instant),
    Manual(Cell<Duration>),
}

impl Clock {
    fn now(&self) -> Duration {
        match self {
            Clock::System(start) => start.elapsed(),
            Clock::Manual(now) => now.get(),
        }
    }
}

/// Cooperative event loop: one FIFO of ready tasks plus timers ordered by
/// deadline. Nothing runs until the owner calls one of the `run*` methods.
pub struct EventLoop {
    clock: Clock,
    ready: RefCell<VecDeque<Task>>,
    /// Keyed by (deadline, insertion order) so equal deadlines stay FIFO.
    timers: RefCell<BTreeMap<(Duration, u64), Task>>,
    next_seq: Cell<u64>,
    errors: RefCell<Vec<FrameError>>,
}

impl EventLoop {
    /// Event loop on the system monotonic clock.
    pub fn new() -> Self {
        Self::with_clock(Clock::System(Instant::now()))
    }

    /// Event loop on a virtual clock that only moves via `advance`/`run`.
    pub fn manual() -> Self {
        Self::with_clock(Clock::Manual(Cell::new(Duration::ZERO)))
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(BTreeMap::new()),
            next_seq: Cell::new(0),
            errors: RefCell::new(Vec::new()),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.clock, Clock::Manual(_))
    }

    pub fn pending_tasks(&self) -> usize {
        self.ready.borrow().len()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Errors handed to `report` since the last call.
    pub fn take_errors(&self) -> Vec<FrameError> {
        std::mem::take(&mut *self.errors.borrow_mut())
    }

    /// Move every timer whose deadline has passed onto the ready queue.
    fn promote_due_timers(&self) {
        let now = self.clock.now();
        loop {
            let due = {
                let mut timers = self.timers.borrow_mut();
                let next = timers.first_key_value().map(|(&(deadline, _), _)| deadline);
                match next {
                    Some(deadline) if deadline <= now => timers.pop_first(),
                    _ => None,
                }
            };
            match due {
                Some((_, task)) => self.ready.borrow_mut().push_back(task),
                None => break,
            }
        }
    }

    /// Run ready tasks and due timers until neither is left. Never sleeps.
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            self.promote_due_timers();
            let task = self.ready.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Let `by` elapse, running everything that becomes due on the way in
    /// deadline order.
    ///
    /// On the system clock this sleeps.
    pub fn advance(&self, by: Duration) -> usize {
        match &self.clock {
            Clock::System(_) => {
                std::thread::sleep(by);
                self.run_until_idle()
            }
            Clock::Manual(now) => {
                let target = now.get() + by;
                let mut ran = self.run_until_idle();
                while let Some(deadline) = self.next_deadline() {
                    if deadline > target {
                        break;
                    }
                    now.set(now.get().max(deadline));
                    ran += self.run_until_idle();
                }
                now.set(target);
                ran + self.run_until_idle()
            }
        }
    }

    /// Run until no ready task and no timer remains, waiting out each
    /// timer in turn.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        loop {
            ran += self.run_until_idle();
            let Some(deadline) = self.next_deadline() else {
                break;
            };
            match &self.clock {
                Clock::System(_) => {
                    let now = self.clock.now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                }
                Clock::Manual(now) => now.set(now.get().max(deadline)),
            }
        }
        ran
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.timers
            .borrow()
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for EventLoop {
    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn schedule_soon(&self, task: Task) {
        self.ready.borrow_mut().push_back(task);
    }

    fn schedule_after(&self, delay: Duration, task: Task) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        let deadline = self.clock.now() + delay;
        trace!(?deadline, seq, "timer scheduled");
        self.timers.borrow_mut().insert((deadline, seq), task);
    }

    fn report(&self, err: FrameError) {
        error!(error = %err, "uncaught frame error");
        self.errors.borrow_mut().push(err);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("now", &self.clock.now())
            .field("manual", &self.is_manual())
            .field("ready", &self.pending_tasks())
            .field("timers", &self.pending_timers())
            .finish()
    }
}
