// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime: one dispatcher, one timer registry and one frame arena bound
//! to a host.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::alts::{alts, Alt, AltOp, AltOptions};
use crate::buffer::{Buffer, BufferKind};
use crate::channel::{Channel, Outcome};
use crate::config::RuntimeConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ChanError, FrameError};
use crate::frame::{Interpreter, Local, StateMachine};
use crate::handler::FnHandler;
use crate::host::Host;
use crate::timers::TimerRegistry;

pub struct Runtime<T> {
    config: RuntimeConfig,
    dispatcher: Dispatcher,
    rng: Rc<RefCell<StdRng>>,
    timers: TimerRegistry<T>,
    interpreter: Interpreter<T>,
}

/// Shared one-shot continuation. Whichever of the handler or the
/// synchronous path gets to it first runs it.
fn shared_callback<A, F>(f: F) -> (Rc<RefCell<Option<F>>>, FnHandler<A>)
where
    A: 'static,
    F: FnOnce(A) + 'static,
{
    let slot = Rc::new(RefCell::new(Some(f)));
    let parked = slot.clone();
    let handler = FnHandler::new(move |a| {
        let f = parked.borrow_mut().take();
        if let Some(f) = f {
            f(a);
        }
    });
    (slot, handler)
}

fn run_now<A, F: FnOnce(A)>(slot: &RefCell<Option<F>>, a: A) {
    let f = slot.borrow_mut().take();
    if let Some(f) = f {
        f(a);
    }
}

impl<T: 'static> Runtime<T> {
    pub fn new(host: Rc<dyn Host>) -> Self {
        Self::with_config(host, RuntimeConfig::default())
    }

    pub fn with_config(host: Rc<dyn Host>, config: RuntimeConfig) -> Self {
        let (rng, timer_rng) = match config.seed {
            Some(seed) => (
                StdRng::seed_from_u64(seed),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => (StdRng::from_entropy(), StdRng::from_entropy()),
        };
        let rng = Rc::new(RefCell::new(rng));
        let dispatcher = Dispatcher::new(host, config.dispatch_batch_size);
        let timers = TimerRegistry::new(dispatcher.clone(), &config, timer_rng);
        let interpreter = Interpreter::new(dispatcher.clone(), rng.clone(), config.queue_limits());
        debug!(seed = ?config.seed, batch = config.dispatch_batch_size, "runtime created");
        Self {
            config,
            dispatcher,
            rng,
            timers,
            interpreter,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn host(&self) -> &Rc<dyn Host> {
        self.dispatcher.host()
    }

    pub fn interpreter(&self) -> &Interpreter<T> {
        &self.interpreter
    }

    /// Unbuffered channel.
    pub fn chan(&self) -> Channel<T> {
        self.chan_with(BufferKind::Fixed(0))
    }

    pub fn chan_with(&self, kind: BufferKind) -> Channel<T> {
        Channel::new(self.dispatcher.clone(), kind.build(), self.config.queue_limits())
    }

    /// Channel over a caller-supplied buffer policy.
    pub fn chan_with_buffer(&self, buffer: Box<dyn Buffer<T>>) -> Channel<T> {
        Channel::new(self.dispatcher.clone(), Some(buffer), self.config.queue_limits())
    }

    pub fn close(&self, ch: &Channel<T>) {
        ch.close();
    }

    /// Take from `ch`. `f` runs right here if a value (or closure) is
    /// available now, otherwise later from the dispatcher.
    pub fn take<F>(&self, ch: &Channel<T>, f: F) -> Result<(), ChanError>
    where
        F: FnOnce(Option<T>) + 'static,
    {
        let (slot, handler) = shared_callback(f);
        if let Outcome::Ready(v) = ch.take(handler)? {
            run_now(&slot, v);
        }
        Ok(())
    }

    /// Put `value` on `ch`. `f` receives whether it was delivered.
    pub fn put<F>(&self, ch: &Channel<T>, value: T, f: F) -> Result<(), ChanError>
    where
        F: FnOnce(bool) + 'static,
    {
        let (slot, handler) = shared_callback(f);
        if let Outcome::Ready(delivered) = ch.put(value, handler)? {
            run_now(&slot, delivered);
        }
        Ok(())
    }

    pub fn offer(&self, ch: &Channel<T>, value: T) -> Result<bool, ChanError> {
        ch.offer(value)
    }

    pub fn poll(&self, ch: &Channel<T>) -> Result<Option<T>, ChanError> {
        ch.poll()
    }

    /// Race `ops`; `f` receives the winner, on the caller when it is
    /// known right away.
    pub fn alts<F>(&self, ops: Vec<AltOp<T>>, options: AltOptions<T>, f: F) -> Result<(), ChanError>
    where
        F: FnOnce(Alt<T>) + 'static,
    {
        let slot = Rc::new(RefCell::new(Some(f)));
        let parked = slot.clone();
        let won = {
            let mut rng = self.rng.borrow_mut();
            alts(ops, options, &mut *rng, move |alt| run_now(&parked, alt))?
        };
        if let Some(alt) = won {
            run_now(&slot, alt);
        }
        Ok(())
    }

    /// Channel that closes after `delay`. Nearby deadlines share a channel.
    pub fn timeout(&self, delay: Duration) -> Channel<T> {
        self.timers.timeout(delay)
    }

    /// Timers registered and not yet fired.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Start a frame. Returns its result channel, which receives the
    /// frame's return value (if any) and is then closed.
    pub fn go<M>(&self, machine: M, locals: Vec<Local<T>>) -> Result<Channel<T>, FrameError>
    where
        M: StateMachine<T> + 'static,
    {
        self.interpreter.spawn(locals, machine)
    }
}

impl<T> fmt::Debug for Runtime<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::EventLoop;

    fn runtime() -> (Rc<EventLoop>, Runtime<i32>) {
        let host = Rc::new(EventLoop::manual());
        let rt = Runtime::with_config(host.clone(), RuntimeConfig::new().with_seed(3));
        (host, rt)
    }

    fn sink<A: 'static>() -> (Rc<RefCell<Vec<A>>>, impl FnOnce(A) + 'static) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        (log, move |a| l.borrow_mut().push(a))
    }

    #[test]
    fn ready_take_runs_on_caller() {
        let (_host, rt) = runtime();
        let ch = rt.chan_with(BufferKind::Fixed(1));
        let (put_log, put_cb) = sink::<bool>();
        rt.put(&ch, 4, put_cb).unwrap();
        assert_eq!(*put_log.borrow(), vec![true]);

        let (got, cb) = sink::<Option<i32>>();
        rt.take(&ch, cb).unwrap();
        assert_eq!(*got.borrow(), vec![Some(4)]);
    }

    #[test]
    fn parked_take_runs_from_dispatcher() {
        let (host, rt) = runtime();
        let ch = rt.chan();
        let (got, cb) = sink::<Option<i32>>();
        rt.take(&ch, cb).unwrap();
        let (delivered, put_cb) = sink::<bool>();
        rt.put(&ch, 9, put_cb).unwrap();

        assert_eq!(*delivered.borrow(), vec![true]);
        assert!(got.borrow().is_empty());
        host.run_until_idle();
        assert_eq!(*got.borrow(), vec![Some(9)]);
    }

    #[test]
    fn put_on_closed_reports_false() {
        let (_host, rt) = runtime();
        let ch = rt.chan();
        rt.close(&ch);
        rt.close(&ch);
        let (log, cb) = sink::<bool>();
        rt.put(&ch, 1, cb).unwrap();
        assert_eq!(*log.borrow(), vec![false]);
    }

    #[test]
    fn alts_default_runs_on_caller() {
        let (_host, rt) = runtime();
        let (a, b) = (rt.chan(), rt.chan());
        let (log, cb) = sink::<Alt<i32>>();
        rt.alts(
            vec![AltOp::Take(a.clone()), AltOp::Take(b.clone())],
            AltOptions::new().with_default(0),
            cb,
        )
        .unwrap();
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_default());
        // nothing stays registered
        assert!(!rt.offer(&a, 1).unwrap());
        assert!(!rt.offer(&b, 1).unwrap());
    }

    #[test]
    fn deadline_via_alts_and_timeout() {
        let (host, rt) = runtime();
        let never = rt.chan();
        let timeout = rt.timeout(Duration::from_millis(30));
        let (log, cb) = sink::<Alt<i32>>();
        rt.alts(
            vec![AltOp::Take(never.clone()), AltOp::Take(timeout.clone())],
            AltOptions::new(),
            cb,
        )
        .unwrap();
        assert!(log.borrow().is_empty());

        host.advance(Duration::from_millis(30));
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].index(), Some(1));
        assert!(log[0].channel().unwrap().same_channel(&timeout));
        assert_eq!(rt.pending_timers(), 0);
    }

    #[test]
    fn seeded_runtimes_pick_the_same_winners() {
        let pick = || {
            let (_host, rt) = runtime();
            let a = rt.chan_with(BufferKind::Sliding(1));
            let b = rt.chan_with(BufferKind::Sliding(1));
            let wins = Rc::new(RefCell::new(Vec::new()));
            for _ in 0..32 {
                rt.offer(&a, 1).unwrap();
                rt.offer(&b, 2).unwrap();
                let w = wins.clone();
                rt.alts(
                    vec![AltOp::Take(a.clone()), AltOp::Take(b.clone())],
                    AltOptions::new(),
                    move |alt| w.borrow_mut().push(alt.index()),
                )
                .unwrap();
            }
            let wins = wins.borrow().clone();
            wins
        };
        assert_eq!(pick(), pick());
    }
}
