// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! State-machine frames and the interpreter that drives them.
//!
//! A frame is a program counter, a fixed set of local slots and a result
//! channel. Its transition function runs until it either returns or asks
//! for a channel operation that cannot complete right away. In the latter
//! case the frame is parked in the interpreter's arena, and the operation's
//! handler carries only the frame's id and the slot to write into.
//!
//! Transition functions advance the program counter *before* returning a
//! suspending step; the interpreter re-enters at whatever pc the frame
//! holds once the value is in its slot.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use rand::rngs::StdRng;
use tracing::{error, trace, warn};

use crate::alts::{alts, Alt, AltOp, AltOptions};
use crate::buffer::BufferKind;
use crate::channel::{Channel, Outcome};
use crate::config::QueueLimits;
use crate::dispatch::Dispatcher;
use crate::error::{ChanError, FrameError};
use crate::handler::FnHandler;

/// Contents of one local slot.
#[derive(Debug)]
pub enum Local<T> {
    Empty,
    Value(T),
    /// Result of a put: whether the value was delivered.
    Delivered(bool),
    /// Result of an alts step.
    Selected(Alt<T>),
}

impl<T> Local<T> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Local::Empty)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Local::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn delivered(&self) -> Option<bool> {
        match self {
            Local::Delivered(d) => Some(*d),
            _ => None,
        }
    }
}

impl<T> Default for Local<T> {
    fn default() -> Self {
        Local::Empty
    }
}

impl<T> From<Option<T>> for Local<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Local::Value(v),
            None => Local::Empty,
        }
    }
}

pub struct Frame<T> {
    pc: usize,
    locals: Vec<Local<T>>,
    result: Channel<T>,
}

impl<T: 'static> Frame<T> {
    fn new(locals: Vec<Local<T>>, result: Channel<T>) -> Self {
        Self {
            pc: 0,
            locals,
            result,
        }
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn goto(&mut self, pc: usize) {
        self.pc = pc;
    }

    pub fn result(&self) -> &Channel<T> {
        &self.result
    }

    pub fn slot_count(&self) -> usize {
        self.locals.len()
    }

    fn check(&self, slot: usize) -> Result<(), ChanError> {
        if slot < self.locals.len() {
            Ok(())
        } else {
            Err(ChanError::BadSlot {
                slot,
                len: self.locals.len(),
            })
        }
    }

    pub fn get(&self, slot: usize) -> Result<&Local<T>, ChanError> {
        self.check(slot)?;
        Ok(&self.locals[slot])
    }

    pub fn set(&mut self, slot: usize, local: Local<T>) -> Result<(), ChanError> {
        self.check(slot)?;
        self.locals[slot] = local;
        Ok(())
    }

    /// Move the slot out, leaving it empty.
    pub fn take(&mut self, slot: usize) -> Result<Local<T>, ChanError> {
        self.check(slot)?;
        Ok(std::mem::take(&mut self.locals[slot]))
    }

    /// Move a plain value out of the slot. Anything else yields `None`.
    pub fn take_value(&mut self, slot: usize) -> Result<Option<T>, ChanError> {
        match self.take(slot)? {
            Local::Value(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }
}

impl<T> fmt::Debug for Frame<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("pc", &self.pc)
            .field("locals", &self.locals.len())
            .finish()
    }
}

/// What the frame wants next.
pub enum Step<T> {
    /// Call the transition function again right away.
    Continue,
    /// Take from `channel` into slot `into`.
    Take { channel: Channel<T>, into: usize },
    /// Put the value in slot `from` (leaving it empty) and write the
    /// delivery flag into slot `into`.
    Put {
        channel: Channel<T>,
        from: usize,
        into: usize,
    },
    Alts {
        ops: Vec<AltOp<T>>,
        options: AltOptions<T>,
        into: usize,
    },
    /// Terminal. `None` closes the result channel without a value.
    Return(Option<T>),
}

/// A frame's transition function.
pub trait StateMachine<T> {
    fn step(&mut self, frame: &mut Frame<T>) -> Result<Step<T>, FrameError>;
}

impl<T, F> StateMachine<T> for F
where
    F: FnMut(&mut Frame<T>) -> Result<Step<T>, FrameError>,
{
    fn step(&mut self, frame: &mut Frame<T>) -> Result<Step<T>, FrameError> {
        self(frame)
    }
}

/// Arena handle of a live frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId {
    index: usize,
    generation: u32,
}

struct Coroutine<T> {
    frame: Frame<T>,
    machine: Box<dyn StateMachine<T>>,
}

enum SlotState<T> {
    Free,
    Running,
    Parked(Coroutine<T>),
}

struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

enum Exit<T> {
    Parked,
    Returned(Option<T>),
}

struct InterpreterInner<T> {
    slots: RefCell<Vec<Slot<T>>>,
    free: RefCell<Vec<usize>>,
    dispatcher: Dispatcher,
    rng: Rc<RefCell<StdRng>>,
    limits: QueueLimits,
}

impl<T> InterpreterInner<T> {
    fn allocate(&self) -> FrameId {
        let mut slots = self.slots.borrow_mut();
        match self.free.borrow_mut().pop() {
            Some(index) => {
                let slot = &mut slots[index];
                slot.state = SlotState::Running;
                FrameId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                slots.push(Slot {
                    generation: 0,
                    state: SlotState::Running,
                });
                FrameId {
                    index: slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    fn release(&self, id: FrameId) {
        let mut slots = self.slots.borrow_mut();
        let slot = &mut slots[id.index];
        if slot.generation != id.generation {
            return;
        }
        slot.state = SlotState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.borrow_mut().push(id.index);
    }

    fn park(&self, id: FrameId, co: Coroutine<T>) {
        let mut slots = self.slots.borrow_mut();
        let slot = &mut slots[id.index];
        if slot.generation == id.generation {
            slot.state = SlotState::Parked(co);
        }
    }

    fn unpark(&self, id: FrameId) -> Option<Coroutine<T>> {
        let mut slots = self.slots.borrow_mut();
        let slot = slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        match std::mem::replace(&mut slot.state, SlotState::Running) {
            SlotState::Parked(co) => Some(co),
            other => {
                slot.state = other;
                None
            }
        }
    }
}

/// Drives frames to completion. Clones share one arena.
pub struct Interpreter<T> {
    inner: Rc<InterpreterInner<T>>,
}

impl<T> Clone for Interpreter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Interpreter<T> {
    pub fn new(
        dispatcher: Dispatcher,
        rng: Rc<RefCell<StdRng>>,
        limits: QueueLimits,
    ) -> Self {
        Self {
            inner: Rc::new(InterpreterInner {
                slots: RefCell::new(Vec::new()),
                free: RefCell::new(Vec::new()),
                dispatcher,
                rng,
                limits,
            }),
        }
    }

    /// Frames currently parked on a channel operation.
    pub fn parked(&self) -> usize {
        self.inner
            .slots
            .borrow()
            .iter()
            .filter(|s| matches!(s.state, SlotState::Parked(_)))
            .count()
    }

    /// Start a frame and run it until it first parks or finishes.
    ///
    /// Errors raised before the first park are returned here; later ones
    /// go to the host's `report`. Either way the result channel is closed.
    pub fn spawn<M>(&self, locals: Vec<Local<T>>, machine: M) -> Result<Channel<T>, FrameError>
    where
        M: StateMachine<T> + 'static,
    {
        let result = Channel::new(
            self.inner.dispatcher.clone(),
            BufferKind::Fixed(1).build(),
            self.inner.limits,
        );
        let id = self.inner.allocate();
        trace!(?id, slots = locals.len(), "frame spawned");
        let co = Coroutine {
            frame: Frame::new(locals, result.clone()),
            machine: Box::new(machine),
        };
        drive(&self.inner, id, co)?;
        Ok(result)
    }
}

impl<T> fmt::Debug for Interpreter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("slots", &self.inner.slots.borrow().len())
            .field("free", &self.inner.free.borrow().len())
            .finish()
    }
}

fn drive<T: 'static>(
    inner: &Rc<InterpreterInner<T>>,
    id: FrameId,
    mut co: Coroutine<T>,
) -> Result<(), FrameError> {
    let exit = run_until_blocked(inner, id, &mut co);
    conclude(inner, id, co, exit)
}

fn conclude<T: 'static>(
    inner: &Rc<InterpreterInner<T>>,
    id: FrameId,
    co: Coroutine<T>,
    exit: Result<Exit<T>, FrameError>,
) -> Result<(), FrameError> {
    match exit {
        Ok(Exit::Parked) => {
            trace!(?id, pc = co.frame.pc, "frame parked");
            inner.park(id, co);
            Ok(())
        }
        Ok(Exit::Returned(value)) => {
            inner.release(id);
            let result = co.frame.result;
            let put = match value {
                Some(v) => result.put(v, FnHandler::noop()).map(|_| ()),
                None => Ok(()),
            };
            result.close();
            trace!(?id, "frame finished");
            put.map_err(FrameError::from)
        }
        Err(err) => {
            inner.release(id);
            // Close first so nobody waits on a frame that is gone.
            co.frame.result.close();
            error!(?id, pc = co.frame.pc, error = %err, "frame failed");
            Err(err)
        }
    }
}

fn run_until_blocked<T: 'static>(
    inner: &Rc<InterpreterInner<T>>,
    id: FrameId,
    co: &mut Coroutine<T>,
) -> Result<Exit<T>, FrameError> {
    loop {
        let step = co.machine.step(&mut co.frame)?;
        let pc = co.frame.pc;
        match step {
            Step::Continue => {}
            Step::Return(value) => return Ok(Exit::Returned(value)),
            Step::Take { channel, into } => {
                co.frame.check(into)?;
                let weak = Rc::downgrade(inner);
                let handler =
                    FnHandler::new(move |v: Option<T>| resume(&weak, id, into, Local::from(v)));
                match channel.take(handler)? {
                    Outcome::Ready(v) => co.frame.set(into, Local::from(v))?,
                    Outcome::Parked => return Ok(Exit::Parked),
                    Outcome::Abandoned => return Err(FrameError::fault(pc, "take abandoned")),
                }
            }
            Step::Put {
                channel,
                from,
                into,
            } => {
                co.frame.check(into)?;
                let value = co.frame.take_value(from)?;
                let weak = Rc::downgrade(inner);
                let handler =
                    FnHandler::new(move |d: bool| resume(&weak, id, into, Local::Delivered(d)));
                match channel.put_opt(value, handler)? {
                    Outcome::Ready(d) => co.frame.set(into, Local::Delivered(d))?,
                    Outcome::Parked => return Ok(Exit::Parked),
                    Outcome::Abandoned => return Err(FrameError::fault(pc, "put abandoned")),
                }
            }
            Step::Alts { ops, options, into } => {
                co.frame.check(into)?;
                let weak = Rc::downgrade(inner);
                let won = {
                    let mut rng = inner.rng.borrow_mut();
                    alts(ops, options, &mut *rng, move |alt| {
                        resume(&weak, id, into, Local::Selected(alt))
                    })?
                };
                match won {
                    Some(alt) => co.frame.set(into, Local::Selected(alt))?,
                    None => return Ok(Exit::Parked),
                }
            }
        }
    }
}

/// Continuation installed on every parked operation of a frame.
fn resume<T: 'static>(
    weak: &Weak<InterpreterInner<T>>,
    id: FrameId,
    into: usize,
    local: Local<T>,
) {
    let Some(inner) = weak.upgrade() else { return };
    let Some(mut co) = inner.unpark(id) else {
        warn!(?id, "resume for a frame that is not parked");
        return;
    };
    trace!(?id, pc = co.frame.pc, into, "frame resumed");
    let outcome = match co.frame.set(into, local) {
        Ok(()) => drive(&inner, id, co),
        Err(err) => conclude(&inner, id, co, Err(err.into())),
    };
    if let Err(err) = outcome {
        inner.dispatcher.host().report(err);
    }
}
