// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline timer registry.
//!
//! A timeout is an ordinary unbuffered channel that closes itself when
//! its deadline passes. Requests whose deadlines land within the
//! resolution window of an existing later-or-equal deadline reuse that
//! channel, so a timeout may close up to one resolution late but never
//! early.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::config::{QueueLimits, RuntimeConfig};
use crate::dispatch::Dispatcher;
use crate::skiplist::SkipList;

/// Absolute deadline in host milliseconds.
pub type Deadline = u64;

type Entries<T> = SkipList<Deadline, Channel<T>, StdRng>;

pub struct TimerRegistry<T> {
    entries: Rc<RefCell<Entries<T>>>,
    dispatcher: Dispatcher,
    limits: QueueLimits,
    resolution_ms: u64,
}

impl<T: 'static> TimerRegistry<T> {
    pub fn new(dispatcher: Dispatcher, config: &RuntimeConfig, rng: StdRng) -> Self {
        Self {
            entries: Rc::new(RefCell::new(SkipList::new(config.timer_max_level, rng))),
            dispatcher,
            limits: config.queue_limits(),
            resolution_ms: config.timeout_resolution.as_millis() as u64,
        }
    }

    /// Timers that have not fired yet.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channel that closes once `delay` has elapsed.
    pub fn timeout(&self, delay: Duration) -> Channel<T> {
        let host = self.dispatcher.host().clone();
        let delay_ms = delay.as_millis() as u64;
        let deadline = host.now().as_millis() as u64 + delay_ms;

        if let Some((&at, channel)) = self.entries.borrow().ceiling_entry(&deadline) {
            // equal keys always coalesce, whatever the resolution
            if at == deadline || at < deadline + self.resolution_ms {
                debug!(deadline, coalesced_into = at, "timeout coalesced");
                return channel.clone();
            }
        }

        let channel = Channel::new(self.dispatcher.clone(), None, self.limits);
        self.entries.borrow_mut().insert(deadline, channel.clone());
        trace!(deadline, delay_ms, "timeout registered");

        let entries = Rc::downgrade(&self.entries);
        let fired = channel.clone();
        host.schedule_after(
            Duration::from_millis(delay_ms),
            Box::new(move || {
                if let Some(entries) = entries.upgrade() {
                    entries.borrow_mut().remove(&deadline);
                }
                trace!(deadline, "timeout fired");
                fired.close();
            }),
        );
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Outcome;
    use crate::handler::FnHandler;
    use crate::host::EventLoop;
    use rand::SeedableRng;

    fn setup() -> (Rc<EventLoop>, TimerRegistry<i32>) {
        setup_with(&RuntimeConfig::default())
    }

    fn setup_with(config: &RuntimeConfig) -> (Rc<EventLoop>, TimerRegistry<i32>) {
        let host = Rc::new(EventLoop::manual());
        let dispatcher = Dispatcher::new(host.clone(), 64);
        let timers = TimerRegistry::new(dispatcher, config, StdRng::seed_from_u64(9));
        (host, timers)
    }

    #[test]
    fn timeout_closes_after_delay() {
        let (host, timers) = setup();
        let ch = timers.timeout(Duration::from_millis(50));
        assert_eq!(timers.len(), 1);

        host.advance(Duration::from_millis(49));
        assert!(!ch.is_closed());
        host.advance(Duration::from_millis(1));
        assert!(ch.is_closed());
        assert!(timers.is_empty());
        assert_eq!(ch.take(FnHandler::noop()).unwrap(), Outcome::Ready(None));
    }

    #[test]
    fn parked_taker_is_released_by_timeout() {
        let (host, timers) = setup();
        let ch = timers.timeout(Duration::from_millis(10));
        let got = Rc::new(RefCell::new(Vec::new()));
        let g = got.clone();
        assert!(ch.take(FnHandler::new(move |v| g.borrow_mut().push(v))).unwrap().is_parked());
        host.advance(Duration::from_millis(10));
        assert_eq!(*got.borrow(), vec![None]);
    }

    #[test]
    fn nearby_deadlines_share_a_channel() {
        let (_host, timers) = setup();
        let a = timers.timeout(Duration::from_millis(100));
        let b = timers.timeout(Duration::from_millis(100));
        let c = timers.timeout(Duration::from_millis(95));
        assert!(a.same_channel(&b));
        assert!(a.same_channel(&c));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn distant_or_later_deadlines_get_their_own_channel() {
        let (host, timers) = setup();
        let a = timers.timeout(Duration::from_millis(100));
        let later = timers.timeout(Duration::from_millis(105));
        let far = timers.timeout(Duration::from_millis(80));
        assert!(!a.same_channel(&later));
        assert!(!a.same_channel(&far));

        host.advance(Duration::from_millis(100));
        assert!(a.is_closed());
        assert!(far.is_closed());
        assert!(!later.is_closed());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn equal_deadlines_share_a_channel_without_resolution() {
        for resolution in [Duration::ZERO, Duration::from_micros(500)] {
            let config = RuntimeConfig::default().with_timeout_resolution(resolution);
            let (host, timers) = setup_with(&config);
            let a = timers.timeout(Duration::from_millis(20));
            let b = timers.timeout(Duration::from_millis(20));
            let c = timers.timeout(Duration::from_millis(19));
            assert!(a.same_channel(&b));
            assert!(!a.same_channel(&c));
            assert_eq!(timers.len(), 2);

            host.advance(Duration::from_millis(19));
            assert!(c.is_closed());
            assert!(!a.is_closed());
            assert_eq!(timers.len(), 1);
            host.advance(Duration::from_millis(1));
            assert!(a.is_closed());
            assert!(timers.is_empty());
        }
    }
}
