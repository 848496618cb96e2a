//! In-process function tracing runtime.
//!
//! Injected into a traced program (through `-pg` style instrumentation
//! or the compiler's `-finstrument-functions` hooks), this library
//! records every function entry and exit with timestamps, call depth,
//! and optionally arguments and return values. Records stream to an
//! external recorder through per-thread rings of shared-memory buffers;
//! a control pipe carries the out-of-band session/buffer messages.
//!
//! The hooks run inside the traced program itself: they are per-thread,
//! reentrancy-guarded against the program's own allocator, survive
//! `fork`, and never block or abort the host once tracing has started.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate bitflags;

#[macro_use]
pub mod log;

pub mod arch;
pub mod args;
pub mod config;
pub mod filter;
pub mod mcount;
pub mod msg;
pub mod record;
pub mod scoped_fd;
pub mod session;
pub mod shmem;
pub mod symtab;
pub mod thread;
pub mod trigger;
pub mod util;

pub use crate::mcount::{
    enabled, mcount_cleanup, mcount_entry, mcount_exit, mcount_reset, mcount_restore,
    mcount_startup, set_enabled,
};
