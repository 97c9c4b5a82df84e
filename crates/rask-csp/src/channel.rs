// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels: rendezvous points with an optional buffer.
//!
//! A take or put either completes synchronously (`Outcome::Ready`) or
//! parks its handler on the channel (`Outcome::Parked`). Parked handlers
//! are served strictly FIFO per side. Continuations of the *other* party
//! in a hand-off always go through the dispatcher.
//!
//! Closing is terminal. Parked takers receive `None` at once. Buffered
//! values and putters parked before the close still drain to later takes,
//! and only then do takes yield `None`.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::config::QueueLimits;
use crate::dispatch::Dispatcher;
use crate::error::{ChanError, QueueSide};
use crate::handler::{FnHandler, Handler};
use crate::host::Task;
use crate::ring::RingBuffer;

const INITIAL_QUEUE_CAPACITY: usize = 32;

/// Result of one channel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<A> {
    /// Completed synchronously; the handler's callback will not run.
    Ready(A),
    /// Registered on the channel; the handler's callback runs later.
    Parked,
    /// The handler was already claimed elsewhere or refused to block.
    /// Nothing was registered.
    Abandoned,
}

impl<A> Outcome<A> {
    pub fn is_parked(&self) -> bool {
        matches!(self, Outcome::Parked)
    }

    pub fn ready(self) -> Option<A> {
        match self {
            Outcome::Ready(a) => Some(a),
            _ => None,
        }
    }
}

type TakeHandler<T> = Box<dyn Handler<Option<T>>>;

/// A parked put: the putter's handler and the value it offers.
struct PutBox<T> {
    handler: Box<dyn Handler<bool>>,
    value: T,
}

struct ChannelState<T> {
    takes: RingBuffer<TakeHandler<T>>,
    dirty_takes: usize,
    puts: RingBuffer<PutBox<T>>,
    dirty_puts: usize,
    buffer: Option<Box<dyn Buffer<T>>>,
    closed: bool,
}

impl<T> ChannelState<T> {
    fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.count())
    }

    /// Move parked putters into free buffer space. Their continuations
    /// are appended to `wakeups`.
    fn refill_from_puts(&mut self, wakeups: &mut Vec<Task>) -> Result<(), ChanError> {
        let ChannelState { puts, buffer, .. } = self;
        let Some(buffer) = buffer.as_mut() else {
            return Ok(());
        };
        while !buffer.is_full() {
            let Some(putter) = puts.pop() else { break };
            if !putter.handler.is_active() {
                continue;
            }
            let put_cb = putter.handler.commit().ok_or(ChanError::DoubleCommit)?;
            buffer.add(putter.value);
            wakeups.push(Box::new(move || put_cb(true)));
        }
        Ok(())
    }

    /// Hand buffered values to parked takers.
    fn drain_to_takes(&mut self, wakeups: &mut Vec<Task>) -> Result<(), ChanError>
    where
        T: 'static,
    {
        let ChannelState { takes, buffer, .. } = self;
        let Some(buffer) = buffer.as_mut() else {
            return Ok(());
        };
        while buffer.count() > 0 {
            let Some(taker) = takes.pop() else { break };
            if !taker.is_active() {
                continue;
            }
            let take_cb = taker.commit().ok_or(ChanError::DoubleCommit)?;
            let value = buffer.remove();
            wakeups.push(Box::new(move || take_cb(value)));
        }
        Ok(())
    }
}

struct ChannelInner<T> {
    state: RefCell<ChannelState<T>>,
    dispatcher: Dispatcher,
    limits: QueueLimits,
}

/// Handle to a channel. Clones refer to the same channel.
pub struct Channel<T> {
    inner: Rc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning channel handle. Handlers parked on a channel use it to
/// refer back to that channel without keeping it alive.
pub struct WeakChannel<T> {
    inner: Weak<ChannelInner<T>>,
}

impl<T> Clone for WeakChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WeakChannel<T> {
    pub fn upgrade(&self) -> Option<Channel<T>> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl<T> Channel<T> {
    pub fn downgrade(&self) -> WeakChannel<T> {
        WeakChannel {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl<T: 'static> Channel<T> {
    pub fn new(
        dispatcher: Dispatcher,
        buffer: Option<Box<dyn Buffer<T>>>,
        limits: QueueLimits,
    ) -> Self {
        Self {
            inner: Rc::new(ChannelInner {
                state: RefCell::new(ChannelState {
                    takes: RingBuffer::new(INITIAL_QUEUE_CAPACITY),
                    dirty_takes: 0,
                    puts: RingBuffer::new(INITIAL_QUEUE_CAPACITY),
                    dirty_puts: 0,
                    buffer,
                    closed: false,
                }),
                dispatcher,
                limits,
            }),
        }
    }

    /// Whether both handles refer to the same channel.
    pub fn same_channel(&self, other: &Channel<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    pub fn buffered_count(&self) -> usize {
        self.inner.state.borrow().buffered()
    }

    /// Parked takes, including ones not yet purged after deactivation.
    pub fn pending_takes(&self) -> usize {
        self.inner.state.borrow().takes.len()
    }

    /// Parked puts, including ones not yet purged after deactivation.
    pub fn pending_puts(&self) -> usize {
        self.inner.state.borrow().puts.len()
    }

    fn dispatch(&self, wakeups: Vec<Task>) {
        for task in wakeups {
            self.inner.dispatcher.run(task);
        }
    }

    /// Take a value.
    ///
    /// `Ready(None)` means the channel is closed and drained.
    pub fn take<H>(&self, handler: H) -> Result<Outcome<Option<T>>, ChanError>
    where
        H: Handler<Option<T>> + 'static,
    {
        if !handler.is_active() {
            return Ok(Outcome::Abandoned);
        }
        let mut wakeups = Vec::new();
        let mut st = self.inner.state.borrow_mut();

        if st.buffered() > 0 {
            let _ = handler.commit().ok_or(ChanError::DoubleCommit)?;
            let value = st.buffer.as_mut().and_then(|b| b.remove());
            st.refill_from_puts(&mut wakeups)?;
            drop(st);
            self.dispatch(wakeups);
            return Ok(Outcome::Ready(value));
        }

        while let Some(putter) = st.puts.pop() {
            if !putter.handler.is_active() {
                continue;
            }
            let put_cb = putter.handler.commit().ok_or(ChanError::DoubleCommit)?;
            let _ = handler.commit().ok_or(ChanError::DoubleCommit)?;
            drop(st);
            trace!("take matched parked put");
            self.inner.dispatcher.run(move || put_cb(true));
            return Ok(Outcome::Ready(Some(putter.value)));
        }

        if st.closed {
            let _ = handler.commit().ok_or(ChanError::DoubleCommit)?;
            return Ok(Outcome::Ready(None));
        }

        let limits = self.inner.limits;
        if st.dirty_takes > limits.max_dirty {
            st.dirty_takes = 0;
            let purged = st.takes.cleanup(|h| h.is_active());
            debug!(purged, remaining = st.takes.len(), "pending takes cleaned");
        } else {
            st.dirty_takes += 1;
        }

        if !handler.is_blockable() {
            return Ok(Outcome::Abandoned);
        }
        if st.takes.len() >= limits.max_queue_size {
            error!(limit = limits.max_queue_size, "pending takes overflow");
            return Err(ChanError::QueueOverflow {
                side: QueueSide::Takes,
                limit: limits.max_queue_size,
            });
        }
        st.takes.unbounded_unshift(Box::new(handler));
        trace!(pending = st.takes.len(), "take parked");
        Ok(Outcome::Parked)
    }

    /// Put a value.
    ///
    /// On a closed channel the handler is still committed and the result
    /// is `Ready(false)`: nothing was delivered.
    pub fn put<H>(&self, value: T, handler: H) -> Result<Outcome<bool>, ChanError>
    where
        H: Handler<bool> + 'static,
    {
        if !handler.is_active() {
            return Ok(Outcome::Abandoned);
        }
        let mut wakeups = Vec::new();
        let mut st = self.inner.state.borrow_mut();

        if st.closed {
            let _ = handler.commit().ok_or(ChanError::DoubleCommit)?;
            trace!("put on closed channel");
            return Ok(Outcome::Ready(false));
        }

        let has_room = st.buffer.as_ref().map_or(false, |b| !b.is_full());
        if has_room {
            let _ = handler.commit().ok_or(ChanError::DoubleCommit)?;
            if let Some(buffer) = st.buffer.as_mut() {
                buffer.add(value);
            }
            st.drain_to_takes(&mut wakeups)?;
            drop(st);
            self.dispatch(wakeups);
            return Ok(Outcome::Ready(true));
        }

        while let Some(taker) = st.takes.pop() {
            if !taker.is_active() {
                continue;
            }
            let take_cb = taker.commit().ok_or(ChanError::DoubleCommit)?;
            let _ = handler.commit().ok_or(ChanError::DoubleCommit)?;
            drop(st);
            trace!("put matched parked take");
            self.inner.dispatcher.run(move || take_cb(Some(value)));
            return Ok(Outcome::Ready(true));
        }

        let limits = self.inner.limits;
        if st.dirty_puts > limits.max_dirty {
            st.dirty_puts = 0;
            let purged = st.puts.cleanup(|p| p.handler.is_active());
            debug!(purged, remaining = st.puts.len(), "pending puts cleaned");
        } else {
            st.dirty_puts += 1;
        }

        if !handler.is_blockable() {
            return Ok(Outcome::Abandoned);
        }
        if st.puts.len() >= limits.max_queue_size {
            error!(limit = limits.max_queue_size, "pending puts overflow");
            return Err(ChanError::QueueOverflow {
                side: QueueSide::Puts,
                limit: limits.max_queue_size,
            });
        }
        st.puts.unbounded_unshift(PutBox {
            handler: Box::new(handler),
            value,
        });
        trace!(pending = st.puts.len(), "put parked");
        Ok(Outcome::Parked)
    }

    /// Put where the absent value is representable. `None` is a protocol
    /// violation.
    pub fn put_opt<H>(&self, value: Option<T>, handler: H) -> Result<Outcome<bool>, ChanError>
    where
        H: Handler<bool> + 'static,
    {
        let value = value.ok_or(ChanError::AbsentValue)?;
        self.put(value, handler)
    }

    /// Put only if it completes right now. Returns whether the value was
    /// delivered or buffered.
    pub fn offer(&self, value: T) -> Result<bool, ChanError> {
        let outcome = self.put(value, FnHandler::non_blocking(|_| {}))?;
        Ok(outcome.ready().unwrap_or(false))
    }

    /// Take only if a value is available right now.
    pub fn poll(&self) -> Result<Option<T>, ChanError> {
        let outcome = self.take(FnHandler::non_blocking(|_| {}))?;
        Ok(outcome.ready().flatten())
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        let mut wakeups: Vec<Task> = Vec::new();
        {
            let mut st = self.inner.state.borrow_mut();
            if st.closed {
                return;
            }
            st.closed = true;
            while let Some(taker) = st.takes.pop() {
                if !taker.is_active() {
                    continue;
                }
                match taker.commit() {
                    Some(take_cb) => {
                        let value = st.buffer.as_mut().and_then(|b| b.remove());
                        wakeups.push(Box::new(move || take_cb(value)));
                    }
                    None => warn!("active taker refused commit on close"),
                }
            }
            debug!(
                released = wakeups.len(),
                stranded_puts = st.puts.len(),
                "channel closed"
            );
        }
        self.dispatch(wakeups);
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("Channel")
            .field("closed", &st.closed)
            .field("buffered", &st.buffered())
            .field("takes", &st.takes.len())
            .field("puts", &st.puts.len())
            .finish()
    }
}
