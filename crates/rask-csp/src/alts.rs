// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-way select over channel operations.
//!
//! All operations of one call share an `AltFlag`, so at most one of them
//! can ever complete. Operations are attempted in a fresh random order on
//! every call unless `priority` is set, in which case listed order wins.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::trace;

use crate::channel::{Channel, Outcome, WeakChannel};
use crate::error::ChanError;
use crate::handler::{AltFlag, Callback, Handler};

/// One candidate operation.
pub enum AltOp<T> {
    Take(Channel<T>),
    Put(Channel<T>, T),
}

impl<T> AltOp<T> {
    pub fn channel(&self) -> &Channel<T> {
        match self {
            AltOp::Take(ch) | AltOp::Put(ch, _) => ch,
        }
    }
}

impl<T> fmt::Debug for AltOp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AltOp::Take(ch) => f.debug_tuple("Take").field(ch).finish(),
            AltOp::Put(ch, _) => f.debug_tuple("Put").field(ch).finish(),
        }
    }
}

pub struct AltOptions<T> {
    /// Attempt operations in listed order instead of a random one.
    pub priority: bool,
    /// Returned immediately when no operation can complete right now.
    pub default: Option<T>,
}

impl<T> AltOptions<T> {
    pub fn new() -> Self {
        Self {
            priority: false,
            default: None,
        }
    }

    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn with_default(mut self, value: T) -> Self {
        self.default = Some(value);
        self
    }
}

impl<T> Default for AltOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Which operation won and what it produced.
pub enum Alt<T> {
    Took {
        index: usize,
        channel: Channel<T>,
        /// `None` when the channel was closed.
        value: Option<T>,
    },
    Put {
        index: usize,
        channel: Channel<T>,
        delivered: bool,
    },
    /// Nothing was ready and a default was supplied.
    Default(T),
}

impl<T> Alt<T> {
    /// Position of the winning operation in the list passed to `alts`.
    pub fn index(&self) -> Option<usize> {
        match self {
            Alt::Took { index, .. } | Alt::Put { index, .. } => Some(*index),
            Alt::Default(_) => None,
        }
    }

    pub fn channel(&self) -> Option<&Channel<T>> {
        match self {
            Alt::Took { channel, .. } | Alt::Put { channel, .. } => Some(channel),
            Alt::Default(_) => None,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Alt::Default(_))
    }
}

impl<T: fmt::Debug> fmt::Debug for Alt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alt::Took { index, value, .. } => f
                .debug_struct("Took")
                .field("index", index)
                .field("value", value)
                .finish(),
            Alt::Put {
                index, delivered, ..
            } => f
                .debug_struct("Put")
                .field("index", index)
                .field("delivered", delivered)
                .finish(),
            Alt::Default(v) => f.debug_tuple("Default").field(v).finish(),
        }
    }
}

type SharedReturn<T> = Rc<RefCell<Option<Box<dyn FnOnce(Alt<T>)>>>>;

/// Per-operation handler. Siblings share `flag` and `ret`.
///
/// The handler sits in its own channel's pending queue, so it refers back
/// to that channel weakly.
struct AltHandler<T> {
    flag: AltFlag,
    ret: SharedReturn<T>,
    index: usize,
    channel: WeakChannel<T>,
}

impl<T: 'static> AltHandler<T> {
    fn claim<A: 'static>(
        &self,
        wrap: fn(usize, Channel<T>, A) -> Alt<T>,
    ) -> Option<Callback<A>> {
        // Only the channel itself commits us, so it is still alive here.
        let channel = self.channel.upgrade()?;
        if !self.flag.commit() {
            return None;
        }
        let ret = self.ret.clone();
        let index = self.index;
        Some(Box::new(move |a| {
            let f = ret.borrow_mut().take();
            if let Some(f) = f {
                f(wrap(index, channel, a));
            }
        }))
    }
}

impl<T: 'static> Handler<Option<T>> for AltHandler<T> {
    fn is_active(&self) -> bool {
        self.flag.is_active()
    }

    fn commit(&self) -> Option<Callback<Option<T>>> {
        self.claim(|index, channel, value| Alt::Took {
            index,
            channel,
            value,
        })
    }
}

impl<T: 'static> Handler<bool> for AltHandler<T> {
    fn is_active(&self) -> bool {
        self.flag.is_active()
    }

    fn commit(&self) -> Option<Callback<bool>> {
        self.claim(|index, channel, delivered| Alt::Put {
            index,
            channel,
            delivered,
        })
    }
}

/// Reject sets that take from and put to the same channel. Such a pair
/// could only ever match itself.
fn check_conflicts<T: 'static>(ops: &[AltOp<T>]) -> Result<(), ChanError> {
    for (take, op) in ops.iter().enumerate() {
        let AltOp::Take(taken) = op else { continue };
        for (put, other) in ops.iter().enumerate() {
            if let AltOp::Put(target, _) = other {
                if taken.same_channel(target) {
                    return Err(ChanError::ConflictingAlt { take, put });
                }
            }
        }
    }
    Ok(())
}

/// Race `ops`. Returns `Some` if an operation (or the default) completed
/// synchronously, in which case `callback` never runs. Otherwise every
/// operation is parked and exactly one of them will call `callback`.
pub fn alts<T, R, F>(
    ops: Vec<AltOp<T>>,
    options: AltOptions<T>,
    rng: &mut R,
    callback: F,
) -> Result<Option<Alt<T>>, ChanError>
where
    T: 'static,
    R: Rng + ?Sized,
    F: FnOnce(Alt<T>) + 'static,
{
    check_conflicts(&ops)?;

    let flag = AltFlag::new();
    let ret: SharedReturn<T> = Rc::new(RefCell::new(Some(Box::new(callback))));

    let mut order: Vec<usize> = (0..ops.len()).collect();
    if !options.priority {
        order.shuffle(rng);
    }
    let mut slots: Vec<Option<AltOp<T>>> = ops.into_iter().map(Some).collect();

    for index in order {
        let Some(op) = slots[index].take() else { continue };
        let handler = AltHandler {
            flag: flag.clone(),
            ret: ret.clone(),
            index,
            channel: op.channel().downgrade(),
        };
        let attempt = match op {
            AltOp::Take(channel) => match channel.take(handler) {
                Ok(Outcome::Ready(value)) => Ok(Some(Alt::Took {
                    index,
                    channel,
                    value,
                })),
                Ok(_) => Ok(None),
                Err(err) => Err(err),
            },
            AltOp::Put(channel, value) => match channel.put(value, handler) {
                Ok(Outcome::Ready(delivered)) => Ok(Some(Alt::Put {
                    index,
                    channel,
                    delivered,
                })),
                Ok(_) => Ok(None),
                Err(err) => Err(err),
            },
        };
        match attempt {
            Ok(Some(won)) => {
                trace!(index, "alts completed synchronously");
                return Ok(Some(won));
            }
            Ok(None) => {}
            Err(err) => {
                // Kill whatever already parked under this flag.
                flag.commit();
                return Err(err);
            }
        }
    }

    if let Some(default) = options.default {
        if flag.commit() {
            trace!("alts took default");
            return Ok(Some(Alt::Default(default)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;
    use crate::config::QueueLimits;
    use crate::dispatch::Dispatcher;
    use crate::handler::FnHandler;
    use crate::host::EventLoop;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        host: Rc<EventLoop>,
        dispatcher: Dispatcher,
        rng: StdRng,
    }

    impl Fixture {
        fn new() -> Self {
            let host = Rc::new(EventLoop::manual());
            let dispatcher = Dispatcher::new(host.clone(), 64);
            Self {
                host,
                dispatcher,
                rng: StdRng::seed_from_u64(1234),
            }
        }

        fn chan(&self, kind: BufferKind) -> Channel<i32> {
            Channel::new(self.dispatcher.clone(), kind.build(), QueueLimits::default())
        }
    }

    fn recorder() -> (Rc<RefCell<Vec<Alt<i32>>>>, impl FnOnce(Alt<i32>)) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        (log, move |alt| l.borrow_mut().push(alt))
    }

    #[test]
    fn ready_take_wins_synchronously() {
        let mut fx = Fixture::new();
        let a = fx.chan(BufferKind::Fixed(1));
        let b = fx.chan(BufferKind::Fixed(1));
        b.put(5, FnHandler::noop()).unwrap();

        let ops = vec![AltOp::Take(a.clone()), AltOp::Take(b.clone())];
        let (log, cb) = recorder();
        let won = alts(ops, AltOptions::new(), &mut fx.rng, cb).unwrap().unwrap();
        assert_eq!(won.index(), Some(1));
        assert!(won.channel().unwrap().same_channel(&b));
        assert!(matches!(won, Alt::Took { value: Some(5), .. }));

        // if the take on `a` parked it is dead now, so the value stays buffered
        assert_eq!(a.put(1, FnHandler::noop()).unwrap(), Outcome::Ready(true));
        assert_eq!(a.buffered_count(), 1);
        fx.host.run_until_idle();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn parked_alts_resolve_exactly_once() {
        let mut fx = Fixture::new();
        let a = fx.chan(BufferKind::Fixed(0));
        let b = fx.chan(BufferKind::Fixed(0));
        let ops = vec![AltOp::Take(a.clone()), AltOp::Take(b.clone())];
        let (log, cb) = recorder();
        assert!(alts(ops, AltOptions::new(), &mut fx.rng, cb).unwrap().is_none());
        assert_eq!(a.pending_takes(), 1);
        assert_eq!(b.pending_takes(), 1);

        assert_eq!(
            b.put(2, FnHandler::noop()).unwrap(),
            Outcome::Ready(true)
        );
        // the sibling on `a` is dead, so this put parks
        assert!(a.put(1, FnHandler::noop()).unwrap().is_parked());
        fx.host.run_until_idle();

        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert!(matches!(log[0], Alt::Took { index: 1, value: Some(2), .. }));
    }

    #[test]
    fn put_ops_report_delivery() {
        let mut fx = Fixture::new();
        let out = fx.chan(BufferKind::Fixed(1));
        let ops = vec![AltOp::Put(out.clone(), 9)];
        let won = alts(ops, AltOptions::new(), &mut fx.rng, |_| {})
            .unwrap()
            .unwrap();
        assert!(matches!(won, Alt::Put { index: 0, delivered: true, .. }));
        assert_eq!(out.poll().unwrap(), Some(9));
    }

    #[test]
    fn default_returned_when_nothing_ready() {
        let mut fx = Fixture::new();
        let a = fx.chan(BufferKind::Fixed(0));
        let b = fx.chan(BufferKind::Fixed(0));
        let ops = vec![AltOp::Take(a.clone()), AltOp::Put(b.clone(), 3)];
        let won = alts(ops, AltOptions::new().with_default(-1), &mut fx.rng, |_| {})
            .unwrap()
            .unwrap();
        assert!(matches!(won, Alt::Default(-1)));

        // whatever got registered is already dead
        assert_eq!(b.take(FnHandler::noop()).unwrap(), Outcome::Parked);
        assert_eq!(a.put(1, FnHandler::noop()).unwrap(), Outcome::Parked);
    }

    #[test]
    fn priority_uses_listed_order() {
        let mut fx = Fixture::new();
        let a = fx.chan(BufferKind::Fixed(8));
        let b = fx.chan(BufferKind::Fixed(8));
        for i in 0..8 {
            a.put(i, FnHandler::noop()).unwrap();
            b.put(i, FnHandler::noop()).unwrap();
        }
        for _ in 0..8 {
            let ops = vec![AltOp::Take(a.clone()), AltOp::Take(b.clone())];
            let won = alts(ops, AltOptions::new().priority(), &mut fx.rng, |_| {})
                .unwrap()
                .unwrap();
            assert_eq!(won.index(), Some(0));
        }
    }

    #[test]
    fn random_order_is_roughly_fair() {
        let mut fx = Fixture::new();
        let a = fx.chan(BufferKind::Sliding(1));
        let b = fx.chan(BufferKind::Sliding(1));
        let mut wins = [0usize; 2];
        for _ in 0..2000 {
            a.put(1, FnHandler::noop()).unwrap();
            b.put(2, FnHandler::noop()).unwrap();
            let ops = vec![AltOp::Take(a.clone()), AltOp::Take(b.clone())];
            let won = alts(ops, AltOptions::new(), &mut fx.rng, |_| {})
                .unwrap()
                .unwrap();
            wins[won.index().unwrap()] += 1;
        }
        assert!(wins[0] > 800 && wins[1] > 800, "skewed wins: {:?}", wins);
    }

    #[test]
    fn closed_channel_wins_with_none() {
        let mut fx = Fixture::new();
        let a = fx.chan(BufferKind::Fixed(0));
        a.close();
        let won = alts(vec![AltOp::Take(a)], AltOptions::new(), &mut fx.rng, |_| {})
            .unwrap()
            .unwrap();
        assert!(matches!(won, Alt::Took { value: None, .. }));
    }

    #[test]
    fn same_channel_take_and_put_is_rejected() {
        let mut fx = Fixture::new();
        let a = fx.chan(BufferKind::Fixed(0));
        let ops = vec![AltOp::Put(a.clone(), 1), AltOp::Take(a.clone())];
        let err = alts(ops, AltOptions::new(), &mut fx.rng, |_| {}).unwrap_err();
        assert_eq!(err, ChanError::ConflictingAlt { take: 1, put: 0 });
        assert_eq!(a.pending_puts(), 0);
    }

    /// Sets its flag when dropped.
    struct Tracker(Rc<std::cell::Cell<bool>>);

    impl Drop for Tracker {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    #[test]
    fn losing_registration_does_not_keep_its_channel_alive() {
        let mut fx = Fixture::new();
        let dropped = Rc::new(std::cell::Cell::new(false));
        let out: Channel<Tracker> =
            Channel::new(fx.dispatcher.clone(), None, QueueLimits::default());
        let other: Channel<Tracker> =
            Channel::new(fx.dispatcher.clone(), None, QueueLimits::default());

        let ops = vec![
            AltOp::Put(out.clone(), Tracker(dropped.clone())),
            AltOp::Take(other.clone()),
        ];
        let won = Rc::new(RefCell::new(None));
        let w = won.clone();
        let sync = alts(ops, AltOptions::new(), &mut fx.rng, move |alt| {
            *w.borrow_mut() = alt.index();
        })
        .unwrap();
        assert!(sync.is_none());

        other.close();
        fx.host.run_until_idle();
        assert_eq!(*won.borrow(), Some(1));

        // the dead put still sits in `out`, holding the value
        assert_eq!(out.pending_puts(), 1);
        assert!(!dropped.get());
        drop(out);
        assert!(dropped.get());
    }
}
