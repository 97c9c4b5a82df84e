// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded CSP channel runtime.
//!
//! Everything runs on one logical thread. Concurrency is the interleaving
//! of parked continuations: an operation that cannot complete registers a
//! handler and returns, and whoever later completes it schedules the
//! continuation through the dispatcher.
//!
//! Components:
//! - ring/buffer: circular storage and the fixed, dropping and sliding
//!   buffer policies
//! - handler: two-phase commit claims on pending operations
//! - channel: take/put/close with FIFO pending queues
//! - dispatch: trampolined task queue flushed from host ticks
//! - alts: fair or prioritized multi-way select
//! - skiplist/timers: deadline registry and self-closing timeout channels
//! - frame: state-machine frames driven through park/resume cycles
//! - host: scheduling primitives and an in-process event loop
//! - runtime: the above bound together with one config

pub mod alts;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handler;
pub mod host;
pub mod ring;
pub mod runtime;
pub mod skiplist;
pub mod timers;

pub use alts::{Alt, AltOp, AltOptions};
pub use buffer::{Buffer, BufferKind};
pub use channel::{Channel, Outcome};
pub use config::RuntimeConfig;
pub use error::{ChanError, FrameError};
pub use frame::{Frame, Local, StateMachine, Step};
pub use handler::{FnHandler, Handler};
pub use host::{EventLoop, Host};
pub use runtime::Runtime;
