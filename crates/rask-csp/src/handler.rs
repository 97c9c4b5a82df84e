// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Two-phase commit handlers.
//!
//! Every pending operation is a `Handler`. A channel pairing two operations
//! checks `is_active` on both, then commits both. Whoever gets `Some` back
//! from `commit` owns the operation; nobody re-checks after that.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Continuation run once an operation completes. Takes receive
/// `Option<T>` (`None` when the channel closed), puts receive `bool`
/// (`false` when the channel closed before delivery).
pub type Callback<A> = Box<dyn FnOnce(A)>;

/// At-most-once claim on completing a pending operation.
pub trait Handler<A> {
    /// False once this handler (or an `alts` sibling) has been committed.
    fn is_active(&self) -> bool;

    /// Non-blockable handlers are never parked on a channel.
    fn is_blockable(&self) -> bool {
        true
    }

    /// Claim the operation. Only the first call returns `Some`.
    fn commit(&self) -> Option<Callback<A>>;
}

/// Handler wrapping a single callback. Active until committed.
pub struct FnHandler<A> {
    callback: RefCell<Option<Callback<A>>>,
    blockable: bool,
}

impl<A> FnHandler<A> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(A) + 'static,
    {
        Self {
            callback: RefCell::new(Some(Box::new(callback))),
            blockable: true,
        }
    }

    /// A handler for operations that must complete now or not at all.
    pub fn non_blocking<F>(callback: F) -> Self
    where
        F: FnOnce(A) + 'static,
    {
        Self {
            blockable: false,
            ..Self::new(callback)
        }
    }

    /// Handler whose continuation does nothing.
    pub fn noop() -> Self
    where
        A: 'static,
    {
        Self::new(|_| {})
    }
}

impl<A> Handler<A> for FnHandler<A> {
    fn is_active(&self) -> bool {
        self.callback.borrow().is_some()
    }

    fn is_blockable(&self) -> bool {
        self.blockable
    }

    fn commit(&self) -> Option<Callback<A>> {
        self.callback.borrow_mut().take()
    }
}

impl<A> fmt::Debug for FnHandler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("active", &self.is_active())
            .field("blockable", &self.blockable)
            .finish()
    }
}

/// Shared flag deciding which of several handlers wins.
///
/// All handlers of one `alts` call hold the same flag, so committing any
/// of them deactivates the rest.
#[derive(Debug, Clone)]
pub struct AltFlag {
    active: Rc<Cell<bool>>,
}

impl AltFlag {
    pub fn new() -> Self {
        Self {
            active: Rc::new(Cell::new(true)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Flip the flag. Returns whether this call was the one that flipped it.
    pub fn commit(&self) -> bool {
        self.active.replace(false)
    }
}

impl Default for AltFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_handler_commits_once() {
        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        let handler = FnHandler::new(move |v: i32| s.set(v));
        assert!(handler.is_active());

        let cb = handler.commit().expect("first commit wins");
        assert!(!handler.is_active());
        assert!(handler.commit().is_none());

        cb(7);
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn non_blocking_handler() {
        let handler: FnHandler<bool> = FnHandler::non_blocking(|_| {});
        assert!(!handler.is_blockable());
        assert!(handler.is_active());
    }

    #[test]
    fn alt_flag_is_shared() {
        let flag = AltFlag::new();
        let sibling = flag.clone();
        assert!(sibling.commit());
        assert!(!flag.is_active());
        assert!(!flag.commit());
    }
}
